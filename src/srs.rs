use crate::result::{Error, Result};
use crate::sql::table_definitions::CREATE_SPATIAL_REF_SYS_TABLE;
use rusqlite::{params, Connection, OptionalExtension};
use std::borrow::Cow;
use std::collections::HashMap;

/// Represents a spatial reference system as it appears in the GeoPackage [specification](https://www.geopackage.org/spec130/#gpkg_spatial_ref_sys_cols)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialRefSys {
    pub name: Cow<'static, str>,
    pub id: i32,
    pub organization: Cow<'static, str>,
    pub organization_coordsys_id: i32,
    pub definition: Cow<'static, str>,
    pub description: Cow<'static, str>,
}

impl SpatialRefSys {
    /// An entry with an empty description, e.g. `SpatialRefSys::new(3857, "EPSG", 3857, "PROJCS[...]")`.
    pub fn new(
        id: i32,
        organization: impl Into<String>,
        organization_coordsys_id: i32,
        definition: impl Into<String>,
    ) -> Self {
        let organization = organization.into();
        SpatialRefSys {
            name: Cow::Owned(format!("{}:{}", organization, organization_coordsys_id)),
            id,
            organization: Cow::Owned(organization),
            organization_coordsys_id,
            definition: Cow::Owned(definition.into()),
            description: Cow::Borrowed(""),
        }
    }
}

pub mod defaults {
    use super::SpatialRefSys;
    use std::borrow::Cow::Borrowed;

    pub const WGS84: SpatialRefSys = SpatialRefSys {
        name: Borrowed("WGS 84 geodetic"),
        id: 4326,
        organization: Borrowed("EPSG"),
        organization_coordsys_id: 4326,
        definition: Borrowed("GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",SPHEROID[\"WGS 84\",6378137,298.257223563,AUTHORITY[\"EPSG\",\"7030\"]],AUTHORITY[\"EPSG\",\"6326\"]],PRIMEM[\"Greenwich\",0,AUTHORITY[\"EPSG\",\"8901\"]],UNIT[\"degree\",0.0174532925199433,AUTHORITY[\"EPSG\",\"9122\"]],AUTHORITY[\"EPSG\",\"4326\"]]"),
        description: Borrowed("longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid"),
    };
    pub const GEOGRAPHIC: SpatialRefSys = SpatialRefSys {
        name: Borrowed("undefined geographic SRS"),
        id: 0,
        organization: Borrowed("NONE"),
        organization_coordsys_id: 0,
        definition: Borrowed("undefined"),
        description: Borrowed("undefined geographic coordinate reference system"),
    };
    pub const CARTESIAN: SpatialRefSys = SpatialRefSys {
        name: Borrowed("undefined cartesian SRS"),
        id: -1,
        organization: Borrowed("NONE"),
        organization_coordsys_id: -1,
        definition: Borrowed("undefined"),
        description: Borrowed("undefined cartesian coordinate reference system"),
    };
}

/// Looks up and registers rows of `gpkg_spatial_ref_sys`.
///
/// Lookups are cached for the lifetime of the registry. The only thing that
/// evicts a cached entry is [SrsRegistry::ensure_registered] on the same
/// registry, so rows changed by another connection are not picked up.
#[derive(Debug, Default)]
pub struct SrsRegistry {
    cache: HashMap<i32, SpatialRefSys>,
}

impl SrsRegistry {
    pub fn new() -> Self {
        SrsRegistry::default()
    }

    /// Creates the table when missing and inserts the entries every
    /// GeoPackage must hold (requirement 11): the two undefined systems and WGS 84.
    pub fn bootstrap(&mut self, conn: &Connection) -> Result<()> {
        conn.execute(CREATE_SPATIAL_REF_SYS_TABLE, [])?;
        for srs in [&defaults::CARTESIAN, &defaults::GEOGRAPHIC, &defaults::WGS84] {
            const STMT: &str = "INSERT OR IGNORE INTO gpkg_spatial_ref_sys
                (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
            conn.execute(
                STMT,
                params![
                    srs.name,
                    srs.id,
                    srs.organization,
                    srs.organization_coordsys_id,
                    srs.definition,
                    srs.description,
                ],
            )?;
        }
        Ok(())
    }

    pub fn resolve(&mut self, conn: &Connection, id: i32) -> Result<&SpatialRefSys> {
        if !self.cache.contains_key(&id) {
            let srs = conn
                .query_row(
                    "SELECT srs_name, srs_id, organization, organization_coordsys_id, definition, description
                     FROM gpkg_spatial_ref_sys WHERE srs_id = ?1",
                    [id],
                    srs_from_row,
                )
                .optional()?
                .ok_or_else(|| Error::NotFound(format!("spatial reference system {}", id)))?;
            self.cache.insert(id, srs);
        }
        // present: either cached already or inserted above
        Ok(&self.cache[&id])
    }

    /// Inserts the entry, or overwrites the row with the same id. Running it
    /// twice leaves a single row.
    pub fn ensure_registered(&mut self, conn: &Connection, srs: &SpatialRefSys) -> Result<()> {
        // a single upsert statement, so concurrent writers never see a gap
        // between the existence check and the insert
        const STMT: &str = "INSERT INTO gpkg_spatial_ref_sys
            (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (srs_id) DO UPDATE SET
                srs_name = excluded.srs_name,
                organization = excluded.organization,
                organization_coordsys_id = excluded.organization_coordsys_id,
                definition = excluded.definition,
                description = excluded.description";
        self.cache.remove(&srs.id);
        conn.execute(
            STMT,
            params![
                srs.name,
                srs.id,
                srs.organization,
                srs.organization_coordsys_id,
                srs.definition,
                srs.description,
            ],
        )?;
        log::debug!("registered spatial reference system {}", srs.id);
        Ok(())
    }

    /// Every registered system, ordered by id. Does not touch the cache.
    pub fn list(&self, conn: &Connection) -> Result<Vec<SpatialRefSys>> {
        let mut stmt = conn.prepare(
            "SELECT srs_name, srs_id, organization, organization_coordsys_id, definition, description
             FROM gpkg_spatial_ref_sys ORDER BY srs_id",
        )?;
        let rows = stmt.query_map([], srs_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn srs_from_row(row: &rusqlite::Row) -> rusqlite::Result<SpatialRefSys> {
    Ok(SpatialRefSys {
        name: Cow::Owned(row.get(0)?),
        id: row.get(1)?,
        organization: Cow::Owned(row.get(2)?),
        organization_coordsys_id: row.get(3)?,
        definition: Cow::Owned(row.get(4)?),
        description: Cow::Owned(row.get::<_, Option<String>>(5)?.unwrap_or_default()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn bootstrapped() -> (Connection, SrsRegistry) {
        let conn = Connection::open_in_memory().unwrap();
        let mut registry = SrsRegistry::new();
        registry.bootstrap(&conn).unwrap();
        (conn, registry)
    }

    fn row_count(conn: &Connection, id: i32) -> i64 {
        conn.query_row(
            "SELECT count(*) FROM gpkg_spatial_ref_sys WHERE srs_id = ?1",
            [id],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn resolve_sentinels_after_bootstrap() {
        let (conn, mut registry) = bootstrapped();
        assert_eq!(registry.resolve(&conn, -1).unwrap(), &defaults::CARTESIAN);
        assert_eq!(registry.resolve(&conn, 0).unwrap(), &defaults::GEOGRAPHIC);
        assert_eq!(registry.resolve(&conn, 4326).unwrap().organization, "EPSG");
    }

    #[test]
    fn bootstrap_twice_is_harmless() {
        let (conn, mut registry) = bootstrapped();
        registry.bootstrap(&conn).unwrap();
        assert_eq!(row_count(&conn, -1), 1);
        assert_eq!(registry.list(&conn).unwrap().len(), 3);
    }

    #[test]
    fn resolve_missing_is_not_found() {
        let (conn, mut registry) = bootstrapped();
        assert!(matches!(registry.resolve(&conn, 3857), Err(Error::NotFound(_))));
    }

    #[test]
    fn ensure_registered_is_idempotent() {
        let (conn, mut registry) = bootstrapped();
        let srs = SpatialRefSys::new(3857, "EPSG", 3857, "PROJCS[\"WGS 84 / Pseudo-Mercator\"]");
        registry.ensure_registered(&conn, &srs).unwrap();
        registry.ensure_registered(&conn, &srs).unwrap();
        assert_eq!(row_count(&conn, 3857), 1);
        assert_eq!(registry.resolve(&conn, 3857).unwrap(), &srs);
    }

    #[test]
    fn ensure_registered_replaces_cached_definition() {
        let (conn, mut registry) = bootstrapped();
        let first = SpatialRefSys::new(32613, "EPSG", 32613, "old");
        registry.ensure_registered(&conn, &first).unwrap();
        assert_eq!(registry.resolve(&conn, 32613).unwrap().definition, "old");

        let second = SpatialRefSys::new(32613, "EPSG", 32613, "new");
        registry.ensure_registered(&conn, &second).unwrap();
        assert_eq!(registry.resolve(&conn, 32613).unwrap().definition, "new");
        assert_eq!(row_count(&conn, 32613), 1);
    }

    #[test]
    fn concurrent_registration_leaves_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srs.gpkg");
        let conn = Connection::open(&path).unwrap();
        SrsRegistry::new().bootstrap(&conn).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let writers: Vec<_> = (0..2)
            .map(|n| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let conn = Connection::open(&path).unwrap();
                    conn.busy_timeout(Duration::from_secs(10)).unwrap();
                    let mut registry = SrsRegistry::new();
                    let srs = SpatialRefSys::new(3857, "EPSG", 3857, format!("writer {}", n));
                    barrier.wait();
                    for _ in 0..50 {
                        registry.ensure_registered(&conn, &srs).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(row_count(&conn, 3857), 1);
        let definition = SrsRegistry::new().resolve(&conn, 3857).unwrap().definition.to_string();
        assert!(definition == "writer 0" || definition == "writer 1");
    }

    #[test]
    fn cache_ignores_other_writers() {
        let (conn, mut registry) = bootstrapped();
        registry.resolve(&conn, 4326).unwrap();
        conn.execute(
            "UPDATE gpkg_spatial_ref_sys SET definition = 'changed' WHERE srs_id = 4326",
            [],
        )
        .unwrap();
        assert_eq!(registry.resolve(&conn, 4326).unwrap().definition, defaults::WGS84.definition);
        assert_eq!(SrsRegistry::new().resolve(&conn, 4326).unwrap().definition, "changed");
    }
}
