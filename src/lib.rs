pub mod config;
pub mod feature;
pub mod gpkg_wkb;
pub mod result;
pub mod rtree;
pub mod schema;
mod sql;
pub mod srs;
pub mod types;

use crate::feature::FeatureCursor;
use crate::rtree::SpatialIndex;
use crate::sql::quote_ident;
use crate::sql::table_definitions::*;
use crate::srs::SrsRegistry;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OpenFlags, Transaction};
use std::path::{Path, PathBuf};

pub use crate::config::{DataStoreParams, OpenOptions};
pub use crate::feature::{Feature, Query};
pub use crate::result::{Error, Result};
pub use crate::schema::{AttributeDescriptor, AttributeType, FeatureType, Value};
pub use crate::srs::SpatialRefSys;
pub use crate::types::{Coord, Dimensions, Envelope, Geometry, GeometryType, Shape};

/// A GeoPackage, upon creation, the necessary tables for conformance to the GeoPackage standard are created,
/// and validation is performed upon opening.
///
/// Every write runs in its own transaction, so a failed call leaves the
/// container as it was. One instance is meant for one thread; open several
/// instances on the same file for concurrent use.
pub struct GeoPackage {
    /// The underlying rusqlite connection for the GeoPackage
    ///
    /// Access is provided here to allow a user to do what is necessary for their specific use case,
    /// but extra care should be taken if using this for write operations, since the
    /// integrity of the GeoPackage could be compromised.
    pub conn: Connection,
    registry: SrsRegistry,
    options: OpenOptions,
    path: PathBuf,
}

impl GeoPackage {
    /// Creates an empty geopackage with the following metadata tables:
    /// * gpkg_extensions
    /// * gpkg_contents
    /// * gpkg_geometry_columns
    /// * gpkg_spatial_ref_sys
    ///
    /// Fails with [Error::Conflict] if something already exists at `path`.
    ///
    /// # Examples
    /// ```no_run
    /// # use geopkg::GeoPackage;
    /// let gp = GeoPackage::create("./test.gpkg").unwrap();
    /// ```
    pub fn create<P: AsRef<Path>>(path: P) -> Result<GeoPackage> {
        let path = path.as_ref();
        if path.exists() {
            return Err(Error::Conflict(format!("container {}", path.display())));
        }
        GeoPackage::open(path, OpenOptions::default())
    }

    /// Open a geopackage, doing validation of the GeoPackage internals to ensure that operation will work correctly.
    ///
    /// A missing or empty file is initialised as a new container unless
    /// `options.read_only` is set, in which case a missing file is
    /// [Error::NotFound].
    pub fn open<P: AsRef<Path>>(location: P, options: OpenOptions) -> Result<GeoPackage> {
        let path = options.resolve_path(location.as_ref());
        if options.read_only && !path.exists() {
            return Err(Error::NotFound(format!("container {}", path.display())));
        }
        let mut flags = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if options.read_only {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        } else {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        }
        if options.shared_cache {
            flags |= OpenFlags::SQLITE_OPEN_SHARED_CACHE;
        }
        let conn = Connection::open_with_flags(&path, flags)?;
        conn.busy_timeout(options.busy_timeout())?;
        rtree::register_functions(&conn)?;

        let mut gpkg = GeoPackage {
            conn,
            registry: SrsRegistry::new(),
            options,
            path,
        };
        if gpkg.is_blank()? && !gpkg.options.read_only {
            gpkg.initialize()?;
            log::info!("created GeoPackage {}", gpkg.path.display());
        } else {
            gpkg.validate()?;
            log::debug!("opened GeoPackage {}", gpkg.path.display());
        }
        Ok(gpkg)
    }

    /// Opens the container described by data store parameters.
    pub fn open_params(params: &DataStoreParams) -> Result<GeoPackage> {
        GeoPackage::open(params.location(), params.options.clone())
    }

    fn is_blank(&self) -> Result<bool> {
        let (application_id, user_version) = self.header()?;
        let objects: i64 =
            self.conn
                .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))?;
        Ok(application_id == 0 && user_version == 0 && objects == 0)
    }

    fn header(&self) -> Result<(u32, u32)> {
        let application_id: u32 =
            self.conn
                .query_row("SELECT * FROM pragma_application_id()", [], |row| {
                    row.get(0)
                })?;
        let user_version: u32 =
            self.conn
                .query_row("SELECT * FROM pragma_user_version()", [], |row| row.get(0))?;
        Ok((application_id, user_version))
    }

    fn initialize(&mut self) -> Result<()> {
        self.conn
            .pragma_update(Some(DatabaseName::Main), "application_id", APPLICATION_ID)?;
        self.conn
            .pragma_update(Some(DatabaseName::Main), "user_version", USER_VERSION)?;
        let tx = self.conn.transaction()?;
        // requirement 10 and 11
        self.registry.bootstrap(&tx)?;
        // requirement 13
        tx.execute(CREATE_CONTENTS_TABLE, [])?;
        tx.execute(CREATE_GEOMETRY_COLUMNS_TABLE, [])?;
        tx.execute(CREATE_EXTENSIONS_TABLE, [])?;
        tx.commit()?;
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        // check the user application_id and user_version as per GeoPackage requirement 2
        let (application_id, user_version) = self.header()?;
        let known = match application_id {
            APPLICATION_ID => KNOWN_USER_VERSIONS.contains(&user_version),
            id => LEGACY_APPLICATION_IDS.contains(&id),
        };
        if !known {
            return Err(Error::Version {
                application_id,
                user_version,
            });
        }
        // integrity check from requirement 6
        let integrity_check: String =
            self.conn
                .query_row("SELECT * FROM pragma_integrity_check()", [], |row| {
                    row.get(0)
                })?;
        if integrity_check != "ok" {
            return Err(Error::format(format!("integrity check failed: {}", integrity_check)));
        }
        // check that there are no foreign key violations as per GeoPackage requirement 7
        {
            let mut stmt = self.conn.prepare("SELECT * FROM pragma_foreign_key_check()")?;
            let mut rows = stmt.query([])?;
            if let Some(row) = rows.next()? {
                let table: String = row.get(0)?;
                return Err(Error::format(format!("foreign key violation in {}", table)));
            }
        }
        if self.options.read_only {
            for table in ["gpkg_spatial_ref_sys", "gpkg_contents"] {
                let found: i64 = self.conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )?;
                if found == 0 {
                    return Err(Error::format(format!("required table {} is missing", table)));
                }
            }
        } else {
            // fills in optional tables some writers leave out
            let tx = self.conn.transaction()?;
            self.registry.bootstrap(&tx)?;
            tx.execute(CREATE_CONTENTS_TABLE, [])?;
            tx.execute(CREATE_GEOMETRY_COLUMNS_TABLE, [])?;
            tx.execute(CREATE_EXTENSIONS_TABLE, [])?;
            tx.commit()?;
        }
        Ok(())
    }

    /// Close the geopackage
    /// # Examples
    /// ```no_run
    /// # use geopkg::GeoPackage;
    /// let gp = GeoPackage::create("./test.gpkg").unwrap();
    /// // do some things with the GeoPackage
    /// gp.close().unwrap();
    /// ```
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| Error::Storage(e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    fn check_writable(&self) -> Result<()> {
        match self.options.read_only {
            true => Err(Error::ReadOnly),
            false => Ok(()),
        }
    }

    /// Creates the table for `feature_type`, its metadata rows and, when it
    /// has a geometry, an empty spatial index.
    pub fn create_feature_type(&mut self, feature_type: &FeatureType) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction()?;
        schema::create_table(&tx, &mut self.registry, feature_type)?;
        if let Some(geometry) = feature_type.geometry_attribute() {
            SpatialIndex::detect(
                &tx,
                &feature_type.name,
                &geometry.name,
                &feature_type.id_column,
                self.options.allow_extensions,
            )?
            .build_index(&tx)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drops the table, its spatial index and every metadata row naming it.
    pub fn drop_feature_type(&mut self, name: &str) -> Result<()> {
        self.check_writable()?;
        let feature_type = self.describe(name)?;
        let index = self.existing_index(&feature_type)?;
        let tx = self.conn.transaction()?;
        if let Some(index) = index {
            index.drop_index(&tx)?;
        }
        schema::drop_table(&tx, name)?;
        tx.commit()?;
        Ok(())
    }

    pub fn describe(&self, name: &str) -> Result<FeatureType> {
        schema::describe(&self.conn, name)
    }

    pub fn feature_type_names(&self) -> Result<Vec<String>> {
        schema::feature_type_names(&self.conn)
    }

    /// The spatial index of the type's geometry column, if one exists.
    fn existing_index(&self, feature_type: &FeatureType) -> Result<Option<SpatialIndex>> {
        let geometry = match feature_type.geometry_attribute() {
            Some(g) => g,
            None => return Ok(None),
        };
        let index = SpatialIndex::detect(
            &self.conn,
            &feature_type.name,
            &geometry.name,
            &feature_type.id_column,
            self.options.allow_extensions,
        )?;
        match index.exists(&self.conn)? {
            true => Ok(Some(index)),
            false => Ok(None),
        }
    }

    /// The index that writes must maintain by hand. R-tree indexes are kept
    /// up to date by their triggers and are left alone.
    fn maintained_index(&self, feature_type: &FeatureType) -> Result<Option<SpatialIndex>> {
        match self.existing_index(feature_type)? {
            Some(index) if index.has_triggers(&self.conn)? => Ok(None),
            other => Ok(other),
        }
    }

    /// Inserts every feature or none of them. Returns the feature ids in
    /// input order.
    ///
    /// A failing feature aborts the call with [Error::Batch] naming its
    /// position. Geometries must be in the type's reference system.
    pub fn write_features(&mut self, name: &str, features: &[Feature]) -> Result<Vec<i64>> {
        self.check_writable()?;
        let feature_type = self.describe(name)?;
        let index = self.maintained_index(&feature_type)?;
        let srs_id = feature_type.effective_srs_id();

        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(features.len());
        let mut extent: Option<Envelope> = None;
        {
            let mut columns = vec![quote_ident(&feature_type.id_column)];
            columns.extend(feature_type.attributes.iter().map(|a| quote_ident(&a.name)));
            let placeholders = vec!["?"; columns.len()].join(", ");
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(name),
                columns.join(", "),
                placeholders
            ))?;
            for (i, feature) in features.iter().enumerate() {
                let result = bind_insert(&feature_type, feature, srs_id, &self.options)
                    .and_then(|(values, envelope)| {
                        let fid = stmt.insert(params_from_iter(values.iter())).map_err(|e| {
                            let e = Error::from(e);
                            match feature.id {
                                Some(id) if e.is_constraint_violation() => {
                                    Error::Conflict(format!("feature {} in {}", id, name))
                                }
                                _ => e,
                            }
                        })?;
                        if let (Some(index), Some(envelope)) = (&index, &envelope) {
                            index.insert(&tx, fid, envelope)?;
                        }
                        Ok((fid, envelope))
                    });
                let (fid, envelope) = result.map_err(|e| {
                    log::warn!("write to {} failed at feature {}: {}", name, i, e);
                    e.in_batch(i)
                })?;
                extent = union(extent, envelope);
                ids.push(fid);
            }
        }
        touch_contents(&tx, name, extent.as_ref())?;
        tx.commit()?;
        log::debug!("wrote {} features to {}", ids.len(), name);
        Ok(ids)
    }

    /// Replaces the values present in each feature's map, leaving other
    /// attributes untouched. Every feature needs an id.
    pub fn update_features(&mut self, name: &str, features: &[Feature]) -> Result<()> {
        self.check_writable()?;
        let feature_type = self.describe(name)?;
        let index = self.maintained_index(&feature_type)?;
        let srs_id = feature_type.effective_srs_id();

        let tx = self.conn.transaction()?;
        let mut extent: Option<Envelope> = None;
        for (i, feature) in features.iter().enumerate() {
            let envelope = update_one(&tx, &feature_type, feature, srs_id, &self.options, index.as_ref())
                .map_err(|e| {
                    log::warn!("update of {} failed at feature {}: {}", name, i, e);
                    e.in_batch(i)
                })?;
            extent = union(extent, envelope);
        }
        touch_contents(&tx, name, extent.as_ref())?;
        tx.commit()?;
        Ok(())
    }

    /// A lazy cursor over the features of `name` matching `query`.
    ///
    /// The cursor keeps a read transaction open until it is dropped.
    ///
    /// # Examples
    /// ```no_run
    /// # use geopkg::{GeoPackage, Envelope, Query};
    /// # let gp = GeoPackage::create("./test.gpkg").unwrap();
    /// for feature in gp.read_features("roads", Query::bbox(Envelope::new(0.0, 0.0, 1.0, 1.0))).unwrap() {
    ///     println!("{:?}", feature.unwrap().id);
    /// }
    /// ```
    pub fn read_features(&self, name: &str, query: Query) -> Result<FeatureCursor<'_>> {
        let feature_type = self.describe(name)?;
        let index = self.existing_index(&feature_type)?;
        FeatureCursor::new(&self.conn, feature_type, index, query)
    }

    /// Deletes the features with the given ids, returning how many existed.
    pub fn delete_features(&mut self, name: &str, ids: &[i64]) -> Result<usize> {
        self.check_writable()?;
        let feature_type = self.describe(name)?;
        let index = self.maintained_index(&feature_type)?;
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(name),
                quote_ident(&feature_type.id_column)
            ))?;
            for id in ids {
                if stmt.execute([id])? > 0 {
                    removed += 1;
                    if let Some(index) = &index {
                        index.remove(&tx, *id)?;
                    }
                }
            }
        }
        touch_contents(&tx, name, None)?;
        tx.commit()?;
        log::debug!("deleted {} features from {}", removed, name);
        Ok(removed)
    }

    pub fn count_features(&self, name: &str) -> Result<u64> {
        self.describe(name)?;
        let count: i64 = self.conn.query_row(
            &format!("SELECT count(*) FROM {}", quote_ident(name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// The XY extent of every stored geometry, `None` when there is none.
    /// Computed from the geometry headers, so it shrinks after deletes
    /// unlike the extent in `gpkg_contents`.
    pub fn bounds(&self, name: &str) -> Result<Option<Envelope>> {
        let feature_type = self.describe(name)?;
        let geometry = match feature_type.geometry_attribute() {
            Some(g) => g,
            None => return Ok(None),
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} IS NOT NULL",
            quote_ident(&geometry.name),
            quote_ident(name),
            quote_ident(&geometry.name)
        ))?;
        let mut rows = stmt.query([])?;
        let mut extent = None;
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(0)?;
            extent = union(extent, gpkg_wkb::decode_envelope(&blob)?);
        }
        Ok(extent)
    }

    /// Drops and rebuilds the spatial index of `name`, creating it if it is
    /// missing. Returns the number of indexed features.
    pub fn rebuild_index(&mut self, name: &str) -> Result<usize> {
        self.check_writable()?;
        let feature_type = self.describe(name)?;
        let geometry = feature_type.geometry_attribute().ok_or_else(|| {
            Error::validation(format!("{} has no geometry column to index", name))
        })?;
        let index = SpatialIndex::detect(
            &self.conn,
            name,
            &geometry.name,
            &feature_type.id_column,
            self.options.allow_extensions,
        )?;
        let tx = self.conn.transaction()?;
        let count = index.build_index(&tx)?;
        tx.commit()?;
        Ok(count)
    }

    /// Adds the reference system, replacing an entry with the same id.
    pub fn register_srs(&mut self, srs: &SpatialRefSys) -> Result<()> {
        self.check_writable()?;
        self.registry.ensure_registered(&self.conn, srs)
    }

    pub fn resolve_srs(&mut self, id: i32) -> Result<&SpatialRefSys> {
        self.registry.resolve(&self.conn, id)
    }

    pub fn spatial_ref_systems(&self) -> Result<Vec<SpatialRefSys>> {
        self.registry.list(&self.conn)
    }
}

fn union(a: Option<Envelope>, b: Option<Envelope>) -> Option<Envelope> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.union_xy(&b)),
        (a, b) => a.or(b),
    }
}

fn check_known_attributes(feature_type: &FeatureType, feature: &Feature) -> Result<()> {
    match feature.values.keys().find(|k| feature_type.attribute(k).is_none()) {
        Some(unknown) => Err(Error::validation(format!(
            "{} has no attribute {}",
            feature_type.name, unknown
        ))),
        None => Ok(()),
    }
}

/// The id followed by every attribute in column order, and the envelope of
/// the geometry if there is one.
fn bind_insert(
    feature_type: &FeatureType,
    feature: &Feature,
    srs_id: i32,
    options: &OpenOptions,
) -> Result<(Vec<SqlValue>, Option<Envelope>)> {
    check_known_attributes(feature_type, feature)?;
    let mut values = Vec::with_capacity(feature_type.attributes.len() + 1);
    values.push(feature.id.map_or(SqlValue::Null, SqlValue::Integer));
    let mut envelope = None;
    for attr in &feature_type.attributes {
        let value = feature.values.get(&attr.name).unwrap_or(&Value::Null);
        values.push(schema::map_value(attr, value, srs_id, &options.codec)?);
        if attr.is_geometry() {
            envelope = value.as_geometry().and_then(Geometry::envelope);
        }
    }
    Ok((values, envelope))
}

/// Updates one row and its index entry, returning the new envelope when the
/// geometry changed.
fn update_one(
    tx: &Transaction<'_>,
    feature_type: &FeatureType,
    feature: &Feature,
    srs_id: i32,
    options: &OpenOptions,
    index: Option<&SpatialIndex>,
) -> Result<Option<Envelope>> {
    let id = feature
        .id
        .ok_or_else(|| Error::validation("cannot update a feature without an id"))?;
    check_known_attributes(feature_type, feature)?;
    let mut assignments = Vec::with_capacity(feature.values.len());
    let mut values = Vec::with_capacity(feature.values.len() + 1);
    let mut new_envelope = None;
    for (name, value) in &feature.values {
        // presence checked above
        let attr = match feature_type.attribute(name) {
            Some(a) => a,
            None => continue,
        };
        assignments.push(format!("{} = ?", quote_ident(name)));
        values.push(schema::map_value(attr, value, srs_id, &options.codec)?);
        if attr.is_geometry() {
            new_envelope = Some(value.as_geometry().and_then(Geometry::envelope));
        }
    }
    if assignments.is_empty() {
        let exists: i64 = tx.query_row(
            &format!(
                "SELECT count(*) FROM {} WHERE {} = ?1",
                quote_ident(&feature_type.name),
                quote_ident(&feature_type.id_column)
            ),
            [id],
            |row| row.get(0),
        )?;
        return match exists {
            0 => Err(Error::NotFound(format!("feature {} in {}", id, feature_type.name))),
            _ => Ok(None),
        };
    }
    values.push(SqlValue::Integer(id));
    let updated = tx.execute(
        &format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(&feature_type.name),
            assignments.join(", "),
            quote_ident(&feature_type.id_column)
        ),
        params_from_iter(values.iter()),
    )?;
    if updated == 0 {
        return Err(Error::NotFound(format!("feature {} in {}", id, feature_type.name)));
    }
    match (new_envelope, index) {
        (Some(envelope), Some(index)) => {
            index.update(tx, id, envelope.as_ref())?;
            Ok(envelope)
        }
        (Some(envelope), None) => Ok(envelope),
        (None, _) => Ok(None),
    }
}

/// Sets `last_change` and grows the recorded extent to cover `extent`.
fn touch_contents(tx: &Transaction<'_>, name: &str, extent: Option<&Envelope>) -> Result<()> {
    match extent {
        Some(e) => tx.execute(
            "UPDATE gpkg_contents SET last_change = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                min_x = min(coalesce(min_x, ?2), ?2), min_y = min(coalesce(min_y, ?3), ?3),
                max_x = max(coalesce(max_x, ?4), ?4), max_y = max(coalesce(max_y, ?5), ?5)
             WHERE table_name = ?1",
            params![name, e.min_x, e.min_y, e.max_x, e.max_y],
        )?,
        None => tx.execute(
            "UPDATE gpkg_contents SET last_change = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE table_name = ?1",
            [name],
        )?,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtree::IndexBackend;
    use rstest::rstest;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn places() -> FeatureType {
        FeatureType::new("places")
            .with_attribute(AttributeDescriptor::new(
                "geom",
                AttributeType::geometry(GeometryType::Point, Dimensions::Xy),
            ))
            .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
            .with_srs_id(4326)
    }

    fn place(x: f64, y: f64, name: &str) -> Feature {
        Feature::new()
            .with_value("geom", Geometry::point(x, y))
            .with_value("name", name)
    }

    fn fresh(options: OpenOptions) -> (TempDir, GeoPackage) {
        init();
        let dir = tempdir().unwrap();
        let gp = GeoPackage::open(dir.path().join("test.gpkg"), options).unwrap();
        (dir, gp)
    }

    fn with_places(options: OpenOptions) -> (TempDir, GeoPackage) {
        let (dir, mut gp) = fresh(options);
        gp.create_feature_type(&places()).unwrap();
        (dir, gp)
    }

    fn everything() -> Envelope {
        Envelope::new(f64::MIN, f64::MIN, f64::MAX, f64::MAX)
    }

    fn indexed_ids(gp: &GeoPackage, name: &str) -> BTreeSet<i64> {
        let ft = gp.describe(name).unwrap();
        let index = gp.existing_index(&ft).unwrap().unwrap();
        index.query(&gp.conn, everything()).collect::<Result<_>>().unwrap()
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn three_points_bbox_scenario(#[case] allow_extensions: bool) {
        let (_dir, mut gp) = with_places(OpenOptions::default().allow_extensions(allow_extensions));
        let expected_backend = if allow_extensions { IndexBackend::RTree } else { IndexBackend::Table };
        assert_eq!(gp.existing_index(&places()).unwrap().unwrap().backend(), expected_backend);

        let ids = gp
            .write_features(
                "places",
                &[place(0.0, 0.0, "a"), place(1.0, 1.0, "b"), place(2.0, 2.0, "c")],
            )
            .unwrap();
        assert_eq!(ids.len(), 3);

        let found: Vec<Feature> = gp
            .read_features("places", Query::bbox(Envelope::new(0.0, 0.0, 1.0, 1.0)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let names: BTreeSet<String> = found
            .iter()
            .filter_map(|f| match f.get("name") {
                Some(Value::Text(name)) => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, BTreeSet::from(["a".to_owned(), "b".to_owned()]));
        let ids_found: BTreeSet<i64> = found.iter().filter_map(|f| f.id).collect();
        assert_eq!(ids_found, BTreeSet::from([ids[0], ids[1]]));
    }

    #[test]
    fn resolve_undefined_cartesian_after_create() {
        let dir = tempdir().unwrap();
        let mut gp = GeoPackage::create(dir.path().join("new.gpkg")).unwrap();
        assert_eq!(gp.resolve_srs(-1).unwrap().id, -1);
        assert_eq!(gp.resolve_srs(0).unwrap().id, 0);
        assert!(matches!(gp.resolve_srs(2193), Err(Error::NotFound(_))));
    }

    #[test]
    fn create_refuses_existing_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("twice.gpkg");
        GeoPackage::create(&path).unwrap().close().unwrap();
        assert!(matches!(GeoPackage::create(&path), Err(Error::Conflict(_))));
    }

    #[test]
    fn new_containers_carry_the_header() {
        let (_dir, gp) = fresh(OpenOptions::default());
        assert_eq!(gp.header().unwrap(), (APPLICATION_ID, USER_VERSION));
    }

    #[test]
    fn failing_feature_aborts_the_batch() {
        let (_dir, mut gp) = with_places(OpenOptions::default());
        let bad = Feature::new().with_value("geom", Geometry::point(f64::NAN, 1.0));
        let result = gp.write_features(
            "places",
            &[place(0.0, 0.0, "a"), bad, place(2.0, 2.0, "c")],
        );
        match result {
            Err(Error::Batch { index, source }) => {
                assert_eq!(index, 1);
                assert!(matches!(*source, Error::Validation(_)));
            }
            other => panic!("expected a batch error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(gp.count_features("places").unwrap(), 0);
        assert!(indexed_ids(&gp, "places").is_empty());
    }

    #[test]
    fn mixed_reference_systems_are_rejected() {
        let (_dir, mut gp) = with_places(OpenOptions::default());
        let other = Feature::new().with_value(
            "geom",
            Value::Geometry {
                geometry: Geometry::point(1.0, 1.0),
                srs_id: Some(3857),
            },
        );
        let result = gp.write_features("places", &[place(0.0, 0.0, "a"), other]);
        assert!(matches!(result, Err(Error::Batch { index: 1, .. })));
        assert_eq!(gp.count_features("places").unwrap(), 0);
    }

    #[test]
    fn unknown_attributes_and_duplicate_ids() {
        let (_dir, mut gp) = with_places(OpenOptions::default());
        let stray = place(0.0, 0.0, "a").with_value("colour", "red");
        let result = gp.write_features("places", &[stray]);
        match result {
            Err(Error::Batch { index: 0, source }) => assert!(matches!(*source, Error::Validation(_))),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        gp.write_features("places", &[place(0.0, 0.0, "a").with_id(10)]).unwrap();
        let result = gp.write_features("places", &[place(1.0, 1.0, "b").with_id(10)]);
        match result {
            Err(Error::Batch { index: 0, source }) => assert!(matches!(*source, Error::Conflict(_))),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            gp.write_features("nowhere", &[]),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn rebuilt_index_covers_non_null_geometries() {
        let (_dir, mut gp) = with_places(OpenOptions::default());
        let ids = gp
            .write_features(
                "places",
                &[
                    place(0.0, 0.0, "a"),
                    Feature::new().with_value("name", "no geometry"),
                    place(5.0, -5.0, "c"),
                ],
            )
            .unwrap();
        gp.conn.execute("DELETE FROM rtree_places_geom", []).unwrap();
        assert_eq!(gp.rebuild_index("places").unwrap(), 2);
        assert_eq!(indexed_ids(&gp, "places"), BTreeSet::from([ids[0], ids[2]]));
        // a second rebuild changes nothing
        assert_eq!(gp.rebuild_index("places").unwrap(), 2);
        assert_eq!(indexed_ids(&gp, "places"), BTreeSet::from([ids[0], ids[2]]));
    }

    #[test]
    fn delete_count_and_bounds() {
        let (_dir, mut gp) = with_places(OpenOptions::default());
        let ids = gp
            .write_features(
                "places",
                &[place(0.0, 0.0, "a"), place(1.0, 1.0, "b"), place(9.0, 4.0, "c")],
            )
            .unwrap();
        assert_eq!(gp.bounds("places").unwrap(), Some(Envelope::new(0.0, 0.0, 9.0, 4.0)));
        assert_eq!(gp.delete_features("places", &[ids[2], 999]).unwrap(), 1);
        assert_eq!(gp.count_features("places").unwrap(), 2);
        assert_eq!(gp.bounds("places").unwrap(), Some(Envelope::new(0.0, 0.0, 1.0, 1.0)));
        assert_eq!(indexed_ids(&gp, "places"), BTreeSet::from([ids[0], ids[1]]));

        let extent: (f64, f64) = gp
            .conn
            .query_row(
                "SELECT max_x, max_y FROM gpkg_contents WHERE table_name = 'places'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(extent, (9.0, 4.0));
    }

    #[test]
    fn update_moves_the_index_entry() {
        let (_dir, mut gp) = with_places(OpenOptions::default());
        let ids = gp.write_features("places", &[place(0.0, 0.0, "a")]).unwrap();
        let moved = Feature::new()
            .with_id(ids[0])
            .with_value("geom", Geometry::point(50.0, 50.0));
        gp.update_features("places", &[moved]).unwrap();

        let near_origin = Query::bbox(Envelope::new(-1.0, -1.0, 1.0, 1.0));
        assert_eq!(gp.read_features("places", near_origin).unwrap().count(), 0);
        let found: Vec<Feature> = gp
            .read_features("places", Query::bbox(Envelope::new(49.0, 49.0, 51.0, 51.0)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found.len(), 1);
        // untouched attributes keep their value
        assert_eq!(found[0].get("name"), Some(&Value::from("a")));

        let missing = Feature::new().with_id(999).with_value("name", "x");
        assert!(matches!(
            gp.update_features("places", &[missing]),
            Err(Error::Batch { index: 0, .. })
        ));
        let cleared = Feature::new().with_id(ids[0]).with_value("geom", Value::Null);
        gp.update_features("places", &[cleared]).unwrap();
        assert!(indexed_ids(&gp, "places").is_empty());
    }

    #[test]
    fn empty_polygon_survives_storage() {
        let (_dir, mut gp) = fresh(OpenOptions::default());
        let parcels = FeatureType::new("parcels").with_attribute(AttributeDescriptor::new(
            "geom",
            AttributeType::geometry(GeometryType::Polygon, Dimensions::Xy),
        ));
        gp.create_feature_type(&parcels).unwrap();
        let empty = Geometry::empty(GeometryType::Polygon, Dimensions::Xy);
        gp.write_features("parcels", &[Feature::new().with_value("geom", empty.clone())])
            .unwrap();
        let read: Vec<Feature> = gp
            .read_features("parcels", Query::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read[0].geometry(), Some(&empty));
        assert!(indexed_ids(&gp, "parcels").is_empty());
        assert_eq!(gp.bounds("parcels").unwrap(), None);
    }

    #[test]
    fn read_only_rejects_writes() {
        let (dir, gp) = with_places(OpenOptions::default());
        let path = gp.path().to_path_buf();
        gp.close().unwrap();

        let mut ro = GeoPackage::open(&path, OpenOptions::default().read_only(true)).unwrap();
        assert!(matches!(ro.write_features("places", &[place(0.0, 0.0, "a")]), Err(Error::ReadOnly)));
        assert!(matches!(ro.create_feature_type(&places()), Err(Error::ReadOnly)));
        assert!(matches!(ro.delete_features("places", &[1]), Err(Error::ReadOnly)));
        assert!(matches!(ro.rebuild_index("places"), Err(Error::ReadOnly)));
        assert_eq!(ro.count_features("places").unwrap(), 0);

        let missing = dir.path().join("missing.gpkg");
        assert!(matches!(
            GeoPackage::open(&missing, OpenOptions::default().read_only(true)),
            Err(Error::NotFound(_))
        ));
        assert!(!missing.exists());
    }

    #[test]
    fn foreign_files_fail_the_version_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        }
        assert!(matches!(
            GeoPackage::open(&path, OpenOptions::default()),
            Err(Error::Version { application_id: 0, user_version: 0 })
        ));

        let future = dir.path().join("future.gpkg");
        GeoPackage::create(&future).unwrap().close().unwrap();
        {
            let conn = Connection::open(&future).unwrap();
            conn.pragma_update(None, "user_version", 20000).unwrap();
        }
        assert!(matches!(
            GeoPackage::open(&future, OpenOptions::default()),
            Err(Error::Version { user_version: 20000, .. })
        ));
    }

    #[test]
    fn dangling_foreign_keys_are_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dangling.gpkg");
        let gp = GeoPackage::create(&path).unwrap();
        gp.conn
            .execute_batch(
                "PRAGMA foreign_keys = OFF;
                 INSERT INTO gpkg_contents (table_name, data_type, srs_id) VALUES ('x', 'features', 9999);",
            )
            .unwrap();
        gp.close().unwrap();
        assert!(matches!(
            GeoPackage::open(&path, OpenOptions::default()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn reopen_relative_to_base_directory() {
        init();
        let dir = tempdir().unwrap();
        let options = OpenOptions::default().base_directory(dir.path());
        let mut gp = GeoPackage::open("relative.gpkg", options.clone()).unwrap();
        gp.create_feature_type(&places()).unwrap();
        gp.write_features("places", &[place(3.0, 4.0, "kept")]).unwrap();
        gp.close().unwrap();
        assert!(dir.path().join("relative.gpkg").exists());

        let params = DataStoreParams::from_json(&format!(
            r#"{{"dbtype": "geopkg", "database": "relative.gpkg", "base_directory": {:?}}}"#,
            dir.path().to_str().unwrap()
        ))
        .unwrap();
        let gp = GeoPackage::open_params(&params).unwrap();
        assert_eq!(gp.describe("places").unwrap(), places());
        let kept: Vec<Feature> = gp
            .read_features("places", Query::all().with_filter("name", "kept"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(kept[0].geometry(), Some(&Geometry::point(3.0, 4.0)));
    }

    #[test]
    fn drop_feature_type_removes_everything() {
        let (_dir, mut gp) = with_places(OpenOptions::default());
        gp.drop_feature_type("places").unwrap();
        assert!(gp.feature_type_names().unwrap().is_empty());
        assert!(matches!(gp.describe("places"), Err(Error::NotFound(_))));
        let leftovers: i64 = gp
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name LIKE '%places%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(leftovers, 0);
        assert!(matches!(gp.drop_feature_type("places"), Err(Error::NotFound(_))));
    }

    #[test]
    fn registered_systems_can_back_feature_types() {
        let (_dir, mut gp) = fresh(OpenOptions::default());
        let nztm = SpatialRefSys::new(2193, "EPSG", 2193, "PROJCS[\"NZGD2000 / New Zealand Transverse Mercator 2000\"]");
        assert!(matches!(
            gp.create_feature_type(&places().with_srs_id(2193)),
            Err(Error::NotFound(_))
        ));
        gp.register_srs(&nztm).unwrap();
        gp.register_srs(&nztm).unwrap();
        gp.create_feature_type(&places().with_srs_id(2193)).unwrap();
        assert_eq!(gp.spatial_ref_systems().unwrap().len(), 4);
        let ids = gp.write_features("places", &[place(1_570_000.0, 5_180_000.0, "wellington")]).unwrap();
        let read = gp.read_features("places", Query::all()).unwrap().next().unwrap().unwrap();
        assert_eq!(read.id, Some(ids[0]));
        assert_eq!(
            read.get("geom"),
            Some(&Value::Geometry {
                geometry: Geometry::point(1_570_000.0, 5_180_000.0),
                srs_id: Some(2193)
            })
        );
    }

    #[test]
    fn attribute_tables_have_no_index() {
        let (_dir, mut gp) = fresh(OpenOptions::default());
        let owners = FeatureType::new("owners")
            .with_attribute(AttributeDescriptor::new("name", AttributeType::Text).not_null())
            .with_attribute(AttributeDescriptor::new("share", AttributeType::Real));
        gp.create_feature_type(&owners).unwrap();
        gp.write_features(
            "owners",
            &[Feature::new().with_value("name", "kim").with_value("share", 1i64)],
        )
        .unwrap();
        let read = gp.read_features("owners", Query::all()).unwrap().next().unwrap().unwrap();
        assert_eq!(read.get("share"), Some(&Value::Real(1.0)));
        assert!(matches!(gp.rebuild_index("owners"), Err(Error::Validation(_))));
        assert!(matches!(
            gp.read_features("owners", Query::bbox(everything())),
            Err(Error::Validation(_))
        ));
        assert_eq!(gp.bounds("owners").unwrap(), None);
        fs::metadata(gp.path()).unwrap();
    }

    #[test]
    fn index_names_never_overwrite_user_tables() {
        let (_dir, mut gp) = fresh(OpenOptions::default().allow_extensions(false));
        let notes = FeatureType::new("envelope_a_geom")
            .with_attribute(AttributeDescriptor::new("note", AttributeType::Text));
        assert!(matches!(gp.create_feature_type(&notes), Err(Error::Validation(_))));

        // as written by another tool
        gp.conn
            .execute_batch(
                "CREATE TABLE envelope_a_geom (fid INTEGER PRIMARY KEY AUTOINCREMENT, note TEXT);
                 INSERT INTO gpkg_contents (table_name, data_type) VALUES ('envelope_a_geom', 'attributes');
                 INSERT INTO envelope_a_geom (note) VALUES ('precious');",
            )
            .unwrap();
        let a = FeatureType::new("a")
            .with_attribute(AttributeDescriptor::new(
                "geom",
                AttributeType::geometry(GeometryType::Point, Dimensions::Xy),
            ))
            .with_srs_id(4326);
        assert!(matches!(gp.create_feature_type(&a), Err(Error::Conflict(_))));
        assert!(matches!(gp.describe("a"), Err(Error::NotFound(_))));
        assert_eq!(gp.count_features("envelope_a_geom").unwrap(), 1);
        let kept = gp.read_features("envelope_a_geom", Query::all()).unwrap().next().unwrap().unwrap();
        assert_eq!(kept.get("note"), Some(&Value::from("precious")));
    }

    #[test]
    fn rtree_sees_rows_from_other_writers() {
        let (_dir, gp) = with_places(OpenOptions::default());
        let blob = gpkg_wkb::encode(&Geometry::point(3.0, 3.0), 4326).unwrap();
        gp.conn
            .execute("INSERT INTO places (geom, name) VALUES (?1, 'outside')", [blob])
            .unwrap();
        let hits: Vec<Feature> = gp
            .read_features("places", Query::bbox(Envelope::new(2.5, 2.5, 3.5, 3.5)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(indexed_ids(&gp, "places").len(), 1);
    }

    #[test]
    fn readers_can_overlap() {
        let (_dir, mut gp) = with_places(OpenOptions::default());
        gp.write_features("places", &[place(0.0, 0.0, "a"), place(1.0, 1.0, "b")])
            .unwrap();
        let owners = FeatureType::new("owners")
            .with_attribute(AttributeDescriptor::new("name", AttributeType::Text));
        gp.create_feature_type(&owners).unwrap();
        gp.write_features("owners", &[Feature::new().with_value("name", "kim")])
            .unwrap();

        let mut places = gp.read_features("places", Query::all()).unwrap();
        let first = places.next().unwrap().unwrap();
        let owner = gp
            .read_features("owners", Query::all().with_filter("name", "kim"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(owner.get("name"), Some(&Value::from("kim")));
        assert_eq!(gp.count_features("places").unwrap(), 2);
        assert_eq!(first.get("name"), Some(&Value::from("a")));
        assert_eq!(places.count(), 1);
        assert!(gp.conn.is_autocommit());
    }
}
