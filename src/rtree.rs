//! Spatial index over the geometry column of a feature table.
//!
//! Two storage backends share one contract. The GeoPackage R-tree extension
//! stores envelopes in an SQLite `rtree` virtual table kept current by the
//! extension's triggers, so other writers to the file update it too. When
//! extensions are not allowed the same columns live in an ordinary table with
//! a composite index, and every mutation is issued explicitly inside the
//! caller's transaction.

use crate::feature::annotate;
use crate::gpkg_wkb;
use crate::result::{Error, Result};
use crate::sql::quote_ident;
use crate::types::Envelope;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::VecDeque;

const RTREE_EXTENSION: &str = "gpkg_rtree_index";
const RTREE_DEFINITION: &str = "http://www.geopackage.org/spec120/#extension_rtree";

/// Number of ids fetched per round trip by [IndexQuery].
const PAGE_SIZE: i64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackend {
    /// `rtree_<table>_<column>` virtual table.
    RTree,
    /// `envelope_<table>_<column>` ordinary table.
    Table,
}

impl IndexBackend {
    fn prefix(self) -> &'static str {
        match self {
            IndexBackend::RTree => "rtree",
            IndexBackend::Table => "envelope",
        }
    }
}

const TRIGGER_SUFFIXES: [&str; 6] = ["insert", "update1", "update2", "update3", "update4", "delete"];

/// Envelope of the blob argument. `None` for NULL and unreadable blobs,
/// `Some(None)` for empty geometries.
fn argument_envelope(ctx: &Context<'_>) -> Option<Option<Envelope>> {
    match ctx.get_raw(0) {
        ValueRef::Blob(bytes) => match gpkg_wkb::decode_envelope(bytes) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                log::debug!("unreadable geometry passed to an index function: {}", e);
                None
            }
        },
        _ => None,
    }
}

/// Registers `ST_MinX`, `ST_MaxX`, `ST_MinY`, `ST_MaxY` and `ST_IsEmpty`,
/// the geometry functions the R-tree triggers call. Must run on every
/// connection that writes to feature tables.
pub fn register_functions(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    let bounds: [(&str, fn(&Envelope) -> f64); 4] = [
        ("ST_MinX", |e| e.min_x),
        ("ST_MaxX", |e| e.max_x),
        ("ST_MinY", |e| e.min_y),
        ("ST_MaxY", |e| e.max_y),
    ];
    for (name, bound) in bounds {
        conn.create_scalar_function(name, 1, flags, move |ctx| {
            Ok(argument_envelope(ctx).flatten().map(|e| bound(&e)))
        })?;
    }
    conn.create_scalar_function("ST_IsEmpty", 1, flags, |ctx| {
        Ok(argument_envelope(ctx).map(|e| e.is_none()))
    })?;
    Ok(())
}

/// Whether the SQLite library was compiled with the R-tree module.
pub fn rtree_available(conn: &Connection) -> Result<bool> {
    let used: bool =
        conn.query_row("SELECT sqlite_compileoption_used('ENABLE_RTREE')", [], |row| {
            row.get(0)
        })?;
    Ok(used)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialIndex {
    table: String,
    column: String,
    id_column: String,
    backend: IndexBackend,
}

impl SpatialIndex {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        id_column: impl Into<String>,
        backend: IndexBackend,
    ) -> Self {
        SpatialIndex {
            table: table.into(),
            column: column.into(),
            id_column: id_column.into(),
            backend,
        }
    }

    /// Picks the backend of an index that already exists, otherwise the
    /// R-tree when `allow_extensions` is set and the engine provides it.
    pub fn detect(
        conn: &Connection,
        table: &str,
        column: &str,
        id_column: &str,
        allow_extensions: bool,
    ) -> Result<Self> {
        for backend in [IndexBackend::RTree, IndexBackend::Table] {
            let index = SpatialIndex::new(table, column, id_column, backend);
            index.check_unclaimed(conn)?;
            if index.exists(conn)? {
                return Ok(index);
            }
        }
        let backend = if allow_extensions && rtree_available(conn)? {
            IndexBackend::RTree
        } else {
            IndexBackend::Table
        };
        Ok(SpatialIndex::new(table, column, id_column, backend))
    }

    pub fn backend(&self) -> IndexBackend {
        self.backend
    }

    pub fn index_table(&self) -> String {
        format!("{}_{}_{}", self.backend.prefix(), self.table, self.column)
    }

    pub fn exists(&self, conn: &Connection) -> Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE name = ?1",
                [self.index_table()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Fails with [Error::Conflict] when the index name is listed in
    /// `gpkg_contents`, i.e. belongs to a user table.
    fn check_unclaimed(&self, conn: &Connection) -> Result<()> {
        let name = self.index_table();
        let claimed = conn
            .query_row(
                "SELECT 1 FROM gpkg_contents WHERE lower(table_name) = lower(?1)",
                [&name],
                |_| Ok(()),
            )
            .optional()?;
        match claimed {
            Some(()) => Err(Error::Conflict(format!(
                "index table {} of {}.{} is a user table",
                name, self.table, self.column
            ))),
            None => Ok(()),
        }
    }

    /// True when triggers on the feature table keep the index current, as
    /// the R-tree extension sets them up.
    pub fn has_triggers(&self, conn: &Connection) -> Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?1 AND instr(sql, ?2) > 0",
                params![self.table, self.index_table()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn create(&self, tx: &Transaction<'_>) -> Result<()> {
        let name = quote_ident(&self.index_table());
        match self.backend {
            IndexBackend::RTree => {
                tx.execute(
                    &format!(
                        "CREATE VIRTUAL TABLE {} USING rtree(id, minx, maxx, miny, maxy)",
                        name
                    ),
                    [],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO gpkg_extensions
                     (table_name, column_name, extension_name, definition, scope)
                     VALUES (?1, ?2, ?3, ?4, 'write-only')",
                    params![self.table, self.column, RTREE_EXTENSION, RTREE_DEFINITION],
                )?;
                tx.execute_batch(&self.trigger_sql())?;
            }
            IndexBackend::Table => {
                tx.execute(
                    &format!(
                        "CREATE TABLE {} (id INTEGER PRIMARY KEY, minx REAL NOT NULL, maxx REAL NOT NULL, miny REAL NOT NULL, maxy REAL NOT NULL)",
                        name
                    ),
                    [],
                )?;
                tx.execute(
                    &format!(
                        "CREATE INDEX {} ON {} (minx, maxx, miny, maxy)",
                        quote_ident(&format!("{}_bounds", self.index_table())),
                        name
                    ),
                    [],
                )?;
            }
        }
        Ok(())
    }

    /// The triggers of the GeoPackage R-tree extension, as other writers
    /// expect to find them.
    fn trigger_sql(&self) -> String {
        let t = quote_ident(&self.table);
        let c = quote_ident(&self.column);
        let i = quote_ident(&self.id_column);
        let r = quote_ident(&self.index_table());
        let trigger = |suffix: &str| quote_ident(&format!("{}_{}", self.index_table(), suffix));
        let bounds = format!(
            "NEW.{i}, ST_MinX(NEW.{c}), ST_MaxX(NEW.{c}), ST_MinY(NEW.{c}), ST_MaxY(NEW.{c})",
            i = i,
            c = c
        );
        let present = format!("(NEW.{c} NOTNULL AND NOT ST_IsEmpty(NEW.{c}))", c = c);
        let absent = format!("(NEW.{c} ISNULL OR ST_IsEmpty(NEW.{c}))", c = c);
        format!(
            "CREATE TRIGGER {insert} AFTER INSERT ON {t} WHEN {present}
             BEGIN INSERT OR REPLACE INTO {r} VALUES ({bounds}); END;
             CREATE TRIGGER {update1} AFTER UPDATE OF {c} ON {t} WHEN OLD.{i} = NEW.{i} AND {present}
             BEGIN INSERT OR REPLACE INTO {r} VALUES ({bounds}); END;
             CREATE TRIGGER {update2} AFTER UPDATE OF {c} ON {t} WHEN OLD.{i} = NEW.{i} AND {absent}
             BEGIN DELETE FROM {r} WHERE id = OLD.{i}; END;
             CREATE TRIGGER {update3} AFTER UPDATE ON {t} WHEN OLD.{i} != NEW.{i} AND {present}
             BEGIN DELETE FROM {r} WHERE id = OLD.{i}; INSERT OR REPLACE INTO {r} VALUES ({bounds}); END;
             CREATE TRIGGER {update4} AFTER UPDATE ON {t} WHEN OLD.{i} != NEW.{i} AND {absent}
             BEGIN DELETE FROM {r} WHERE id IN (OLD.{i}, NEW.{i}); END;
             CREATE TRIGGER {delete} AFTER DELETE ON {t} WHEN OLD.{c} NOTNULL
             BEGIN DELETE FROM {r} WHERE id = OLD.{i}; END;",
            insert = trigger("insert"),
            update1 = trigger("update1"),
            update2 = trigger("update2"),
            update3 = trigger("update3"),
            update4 = trigger("update4"),
            delete = trigger("delete"),
            t = t,
            c = c,
            i = i,
            r = r,
            bounds = bounds,
            present = present,
            absent = absent,
        )
    }

    /// Drops the index structure, its triggers and its extension
    /// registration. Missing indexes are ignored.
    pub fn drop_index(&self, tx: &Transaction<'_>) -> Result<()> {
        self.check_unclaimed(tx)?;
        for suffix in TRIGGER_SUFFIXES {
            tx.execute(
                &format!(
                    "DROP TRIGGER IF EXISTS {}",
                    quote_ident(&format!("{}_{}", self.index_table(), suffix))
                ),
                [],
            )?;
        }
        tx.execute(
            &format!("DROP TABLE IF EXISTS {}", quote_ident(&self.index_table())),
            [],
        )?;
        if self.backend == IndexBackend::RTree {
            tx.execute(
                "DELETE FROM gpkg_extensions WHERE table_name = ?1 AND column_name = ?2 AND extension_name = ?3",
                params![self.table, self.column, RTREE_EXTENSION],
            )?;
        }
        Ok(())
    }

    /// Drops, recreates and fills the index from the feature table. Rows with
    /// a NULL or empty geometry get no entry. Returns the number of entries.
    pub fn build_index(&self, tx: &Transaction<'_>) -> Result<usize> {
        self.drop_index(tx)?;
        self.create(tx)?;
        let mut stmt = tx.prepare(&format!(
            "SELECT {}, {} FROM {} WHERE {} IS NOT NULL",
            quote_ident(&self.id_column),
            quote_ident(&self.column),
            quote_ident(&self.table),
            quote_ident(&self.column),
        ))?;
        let mut rows = stmt.query([])?;
        let mut count = 0;
        while let Some(row) = rows.next()? {
            let fid: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let envelope =
                gpkg_wkb::decode_envelope(&blob).map_err(|e| annotate(e, &self.table, fid))?;
            if let Some(envelope) = envelope {
                self.insert(tx, fid, &envelope)?;
                count += 1;
            }
        }
        log::info!("built {:?} index {} with {} entries", self.backend, self.index_table(), count);
        Ok(count)
    }

    pub fn insert(&self, tx: &Transaction<'_>, fid: i64, envelope: &Envelope) -> Result<()> {
        tx.execute(
            &format!(
                "INSERT INTO {} (id, minx, maxx, miny, maxy) VALUES (?1, ?2, ?3, ?4, ?5)",
                quote_ident(&self.index_table())
            ),
            params![fid, envelope.min_x, envelope.max_x, envelope.min_y, envelope.max_y],
        )?;
        Ok(())
    }

    /// Replaces the entry of `fid`. `None` (a NULL or empty geometry) leaves
    /// the feature unindexed.
    pub fn update(&self, tx: &Transaction<'_>, fid: i64, envelope: Option<&Envelope>) -> Result<()> {
        self.remove(tx, fid)?;
        match envelope {
            Some(envelope) => self.insert(tx, fid, envelope),
            None => Ok(()),
        }
    }

    pub fn remove(&self, tx: &Transaction<'_>, fid: i64) -> Result<()> {
        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", quote_ident(&self.index_table())),
            [fid],
        )?;
        Ok(())
    }

    /// Ids of every entry whose envelope intersects `envelope`, touching
    /// edges included, in ascending order. Nothing runs until the iterator
    /// is pulled, and every call starts over from the current state.
    pub fn query<'c>(&self, conn: &'c Connection, envelope: Envelope) -> IndexQuery<'c> {
        IndexQuery {
            conn,
            sql: format!(
                "SELECT id FROM {} WHERE id > ?1 AND minx <= ?2 AND maxx >= ?3 AND miny <= ?4 AND maxy >= ?5 ORDER BY id LIMIT ?6",
                quote_ident(&self.index_table())
            ),
            envelope,
            last: None,
            page: VecDeque::new(),
            exhausted: false,
        }
    }
}

/// Lazy iterator returned by [SpatialIndex::query].
pub struct IndexQuery<'c> {
    conn: &'c Connection,
    sql: String,
    envelope: Envelope,
    last: Option<i64>,
    page: VecDeque<i64>,
    exhausted: bool,
}

impl IndexQuery<'_> {
    fn fetch_page(&mut self) -> Result<()> {
        let e = &self.envelope;
        let mut stmt = self.conn.prepare_cached(&self.sql)?;
        let ids = stmt.query_map(
            params![self.last.unwrap_or(i64::MIN), e.max_x, e.min_x, e.max_y, e.min_y, PAGE_SIZE],
            |row| row.get::<_, i64>(0),
        )?;
        for id in ids {
            self.page.push_back(id?);
        }
        if (self.page.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for IndexQuery<'_> {
    type Item = Result<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let id = self.page.pop_front()?;
        self.last = Some(id);
        Some(Ok(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::table_definitions::{
        CREATE_CONTENTS_TABLE, CREATE_EXTENSIONS_TABLE, CREATE_SPATIAL_REF_SYS_TABLE,
    };
    use crate::types::{Dimensions, Geometry, GeometryType};
    use rstest::rstest;
    use std::collections::BTreeSet;

    fn container() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();
        conn.execute(CREATE_SPATIAL_REF_SYS_TABLE, []).unwrap();
        conn.execute(CREATE_EXTENSIONS_TABLE, []).unwrap();
        conn.execute(CREATE_CONTENTS_TABLE, []).unwrap();
        conn.execute(
            "CREATE TABLE pts (fid INTEGER PRIMARY KEY AUTOINCREMENT, geom POINT)",
            [],
        )
        .unwrap();
        conn
    }

    fn add_point(conn: &Connection, fid: i64, geom: Option<Geometry>) {
        let blob = geom.map(|g| gpkg_wkb::encode(&g, 4326).unwrap());
        conn.execute("INSERT INTO pts (fid, geom) VALUES (?1, ?2)", params![fid, blob])
            .unwrap();
    }

    fn ids(index: &SpatialIndex, conn: &Connection, envelope: Envelope) -> BTreeSet<i64> {
        index.query(conn, envelope).collect::<Result<_>>().unwrap()
    }

    fn everything() -> Envelope {
        Envelope::new(f64::MIN, f64::MIN, f64::MAX, f64::MAX)
    }

    fn built(conn: &mut Connection, backend: IndexBackend) -> SpatialIndex {
        let index = SpatialIndex::new("pts", "geom", "fid", backend);
        let tx = conn.transaction().unwrap();
        index.build_index(&tx).unwrap();
        tx.commit().unwrap();
        index
    }

    #[test]
    fn bundled_sqlite_has_rtree() {
        assert!(rtree_available(&container()).unwrap());
    }

    #[rstest]
    #[case(IndexBackend::RTree)]
    #[case(IndexBackend::Table)]
    fn build_indexes_non_null_geometries(#[case] backend: IndexBackend) {
        let mut conn = container();
        add_point(&conn, 1, Some(Geometry::point(0.0, 0.0)));
        add_point(&conn, 2, None);
        add_point(&conn, 3, Some(Geometry::point(5.0, 5.0)));
        add_point(&conn, 4, Some(Geometry::empty(GeometryType::Point, Dimensions::Xy)));
        let index = built(&mut conn, backend);
        assert!(index.exists(&conn).unwrap());
        assert_eq!(ids(&index, &conn, everything()), BTreeSet::from([1, 3]));

        // rebuilding is idempotent
        let tx = conn.transaction().unwrap();
        assert_eq!(index.build_index(&tx).unwrap(), 2);
        tx.commit().unwrap();
        assert_eq!(ids(&index, &conn, everything()), BTreeSet::from([1, 3]));
    }

    #[rstest]
    #[case(IndexBackend::RTree)]
    #[case(IndexBackend::Table)]
    fn query_is_inclusive(#[case] backend: IndexBackend) {
        let mut conn = container();
        for i in 0..3 {
            add_point(&conn, i + 1, Some(Geometry::point(i as f64, i as f64)));
        }
        let index = built(&mut conn, backend);
        assert_eq!(
            ids(&index, &conn, Envelope::new(0.0, 0.0, 1.0, 1.0)),
            BTreeSet::from([1, 2])
        );
        assert!(ids(&index, &conn, Envelope::new(10.0, 10.0, 11.0, 11.0)).is_empty());
    }

    #[rstest]
    #[case(IndexBackend::RTree)]
    #[case(IndexBackend::Table)]
    fn mutations_follow_the_transaction(#[case] backend: IndexBackend) {
        let mut conn = container();
        let index = built(&mut conn, backend);
        {
            let tx = conn.transaction().unwrap();
            index.insert(&tx, 7, &Envelope::new(1.0, 1.0, 2.0, 2.0)).unwrap();
            // rolled back on drop
        }
        assert!(ids(&index, &conn, everything()).is_empty());

        let tx = conn.transaction().unwrap();
        index.insert(&tx, 7, &Envelope::new(1.0, 1.0, 2.0, 2.0)).unwrap();
        tx.commit().unwrap();
        assert_eq!(ids(&index, &conn, everything()), BTreeSet::from([7]));

        let tx = conn.transaction().unwrap();
        index.update(&tx, 7, Some(&Envelope::new(50.0, 50.0, 60.0, 60.0))).unwrap();
        tx.commit().unwrap();
        assert!(ids(&index, &conn, Envelope::new(0.0, 0.0, 3.0, 3.0)).is_empty());
        assert_eq!(ids(&index, &conn, Envelope::new(55.0, 55.0, 56.0, 56.0)), BTreeSet::from([7]));

        let tx = conn.transaction().unwrap();
        index.remove(&tx, 7).unwrap();
        tx.commit().unwrap();
        assert!(ids(&index, &conn, everything()).is_empty());
    }

    #[test]
    fn query_pages_through_large_results() {
        let mut conn = container();
        let index = built(&mut conn, IndexBackend::Table);
        let tx = conn.transaction().unwrap();
        for fid in 1..=(PAGE_SIZE * 2 + 3) {
            index.insert(&tx, fid, &Envelope::new(0.0, 0.0, 1.0, 1.0)).unwrap();
        }
        tx.commit().unwrap();
        let found: Vec<i64> = index.query(&conn, everything()).collect::<Result<_>>().unwrap();
        assert_eq!(found.len() as i64, PAGE_SIZE * 2 + 3);
        assert!(found.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn query_is_restartable() {
        let mut conn = container();
        add_point(&conn, 1, Some(Geometry::point(0.0, 0.0)));
        let index = built(&mut conn, IndexBackend::Table);
        let first = ids(&index, &conn, everything());
        add_point(&conn, 2, Some(Geometry::point(1.0, 1.0)));
        let tx = conn.transaction().unwrap();
        index.insert(&tx, 2, &Envelope::new(1.0, 1.0, 1.0, 1.0)).unwrap();
        tx.commit().unwrap();
        assert_eq!(first, BTreeSet::from([1]));
        assert_eq!(ids(&index, &conn, everything()), BTreeSet::from([1, 2]));
    }

    #[test]
    fn rtree_is_registered_as_extension() {
        let mut conn = container();
        let index = built(&mut conn, IndexBackend::RTree);
        let count = |conn: &Connection| -> i64 {
            conn.query_row(
                "SELECT count(*) FROM gpkg_extensions WHERE extension_name = 'gpkg_rtree_index'",
                [],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(count(&conn), 1);
        let tx = conn.transaction().unwrap();
        index.drop_index(&tx).unwrap();
        tx.commit().unwrap();
        assert_eq!(count(&conn), 0);
        assert!(!index.exists(&conn).unwrap());
    }

    #[test]
    fn triggers_are_detected() {
        let mut conn = container();
        let table = built(&mut conn, IndexBackend::Table);
        assert!(!table.has_triggers(&conn).unwrap());
        let rtree = built(&mut conn, IndexBackend::RTree);
        assert!(rtree.has_triggers(&conn).unwrap());
        let triggers: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'trigger' AND name LIKE 'rtree_pts_geom_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(triggers, 6);

        let tx = conn.transaction().unwrap();
        rtree.drop_index(&tx).unwrap();
        tx.commit().unwrap();
        assert!(!rtree.has_triggers(&conn).unwrap());
    }

    #[test]
    fn rtree_follows_plain_sql_writes() {
        let mut conn = container();
        let index = built(&mut conn, IndexBackend::RTree);
        add_point(&conn, 1, Some(Geometry::point(0.0, 0.0)));
        add_point(&conn, 2, Some(Geometry::point(5.0, 5.0)));
        add_point(&conn, 3, None);
        add_point(&conn, 4, Some(Geometry::empty(GeometryType::Point, Dimensions::Xy)));
        assert_eq!(ids(&index, &conn, everything()), BTreeSet::from([1, 2]));

        let moved = gpkg_wkb::encode(&Geometry::point(9.0, 9.0), 4326).unwrap();
        conn.execute("UPDATE pts SET geom = ?1 WHERE fid = 1", [moved]).unwrap();
        assert_eq!(ids(&index, &conn, Envelope::new(8.0, 8.0, 10.0, 10.0)), BTreeSet::from([1]));
        assert!(ids(&index, &conn, Envelope::new(-1.0, -1.0, 1.0, 1.0)).is_empty());

        conn.execute("UPDATE pts SET geom = NULL WHERE fid = 2", []).unwrap();
        conn.execute("UPDATE pts SET fid = 10 WHERE fid = 1", []).unwrap();
        assert_eq!(ids(&index, &conn, everything()), BTreeSet::from([10]));

        conn.execute("DELETE FROM pts WHERE fid = 10", []).unwrap();
        assert!(ids(&index, &conn, everything()).is_empty());
    }

    #[test]
    fn geometry_functions_read_the_header() {
        let conn = container();
        let blob = gpkg_wkb::encode(&Geometry::point(3.0, -4.0), 4326).unwrap();
        let (min_x, max_y, empty): (f64, f64, bool) = conn
            .query_row("SELECT ST_MinX(?1), ST_MaxY(?1), ST_IsEmpty(?1)", [&blob], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .unwrap();
        assert_eq!((min_x, max_y, empty), (3.0, -4.0, false));
        let empty = gpkg_wkb::encode(&Geometry::empty(GeometryType::Polygon, Dimensions::Xy), 4326).unwrap();
        let (min_x, is_empty): (Option<f64>, Option<bool>) = conn
            .query_row("SELECT ST_MinX(?1), ST_IsEmpty(?1)", [&empty], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!((min_x, is_empty), (None, Some(true)));
        let garbage: Option<bool> = conn
            .query_row("SELECT ST_IsEmpty(x'4750')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(garbage, None);
    }

    #[rstest]
    #[case(IndexBackend::RTree)]
    #[case(IndexBackend::Table)]
    fn index_names_listed_as_contents_are_refused(#[case] backend: IndexBackend) {
        let mut conn = container();
        let index = SpatialIndex::new("pts", "geom", "fid", backend);
        conn.execute_batch(&format!(
            "CREATE TABLE {name} (id INTEGER PRIMARY KEY, note TEXT);
             INSERT INTO {name} (note) VALUES ('kept');
             INSERT INTO gpkg_contents (table_name, data_type) VALUES ('{name}', 'attributes');",
            name = index.index_table()
        ))
        .unwrap();
        assert!(matches!(
            SpatialIndex::detect(&conn, "pts", "geom", "fid", true),
            Err(Error::Conflict(_))
        ));
        let tx = conn.transaction().unwrap();
        assert!(matches!(index.build_index(&tx), Err(Error::Conflict(_))));
        assert!(matches!(index.drop_index(&tx), Err(Error::Conflict(_))));
        drop(tx);
        let note: String = conn
            .query_row(&format!("SELECT note FROM {}", index.index_table()), [], |row| row.get(0))
            .unwrap();
        assert_eq!(note, "kept");
    }

    #[test]
    fn corrupt_blob_names_its_row() {
        let mut conn = container();
        add_point(&conn, 1, Some(Geometry::point(0.0, 0.0)));
        conn.execute("INSERT INTO pts (fid, geom) VALUES (42, x'47500003')", []).unwrap();
        let index = SpatialIndex::new("pts", "geom", "fid", IndexBackend::Table);
        let tx = conn.transaction().unwrap();
        match index.build_index(&tx) {
            Err(Error::Format(msg)) => assert!(msg.contains("pts feature 42"), "{}", msg),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn detect_prefers_existing_index() {
        let mut conn = container();
        built(&mut conn, IndexBackend::Table);
        let found = SpatialIndex::detect(&conn, "pts", "geom", "fid", true).unwrap();
        assert_eq!(found.backend(), IndexBackend::Table);
        let fresh = SpatialIndex::detect(&conn, "other", "geom", "fid", true).unwrap();
        assert_eq!(fresh.backend(), IndexBackend::RTree);
        let fresh = SpatialIndex::detect(&conn, "other", "geom", "fid", false).unwrap();
        assert_eq!(fresh.backend(), IndexBackend::Table);
    }
}
