use crate::gpkg_wkb;
use crate::result::{Error, Result};
use crate::rtree::{IndexQuery, SpatialIndex};
use crate::schema::{self, FeatureType, Value};
use crate::sql::quote_ident;
use crate::types::{Envelope, Geometry};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, Row, Transaction};
use std::collections::{BTreeMap, VecDeque};

/// Ids looked up per `IN (...)` statement, well below SQLite's default
/// limit of 999 bound parameters so filters still fit.
const ID_CHUNK: usize = 500;
/// Rows fetched per statement when scanning a table.
const SCAN_PAGE: i64 = 512;

/// One record of a feature type. Attributes missing from `values` are
/// written as NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feature {
    /// Assigned by the store on write when `None`.
    pub id: Option<i64>,
    pub values: BTreeMap<String, Value>,
}

impl Feature {
    pub fn new() -> Self {
        Feature::default()
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// The first geometry among the values, if any.
    pub fn geometry(&self) -> Option<&Geometry> {
        self.values.values().find_map(Value::as_geometry)
    }
}

/// Selection for [crate::GeoPackage::read_features]. The default selects
/// every feature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Keep features whose geometry envelope intersects this box.
    pub bbox: Option<Envelope>,
    /// Keep features whose attribute equals the value, NULL matching NULL.
    pub filters: Vec<(String, Value)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all() -> Self {
        Query::default()
    }

    pub fn bbox(envelope: Envelope) -> Self {
        Query {
            bbox: Some(envelope),
            ..Query::default()
        }
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((name.into(), value.into()));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Lazy iterator over the features matching a [Query].
///
/// The cursor holds a read transaction for its whole life so that every page
/// comes from the same snapshot; dropping it, exhausted or not, ends the
/// transaction. A cursor opened while another transaction is active on the
/// connection, such as a second live cursor, reads inside that transaction
/// and owns none.
pub struct FeatureCursor<'a> {
    conn: &'a Connection,
    _read: Option<Transaction<'a>>,
    feature_type: FeatureType,
    select: String,
    filter_sql: String,
    filter_params: Vec<SqlValue>,
    bbox: Option<Envelope>,
    geometry_position: Option<usize>,
    candidates: Option<IndexQuery<'a>>,
    last: Option<i64>,
    buffer: VecDeque<Feature>,
    remaining: Option<usize>,
    exhausted: bool,
    failure: Option<Error>,
}

impl<'a> FeatureCursor<'a> {
    /// `index` is consulted for bounding box queries when it exists,
    /// otherwise the table is scanned and envelopes checked row by row.
    pub(crate) fn new(
        conn: &'a Connection,
        feature_type: FeatureType,
        index: Option<SpatialIndex>,
        query: Query,
    ) -> Result<Self> {
        let geometry_position = feature_type.attributes.iter().position(|a| a.is_geometry());
        if query.bbox.is_some() && geometry_position.is_none() {
            return Err(Error::validation(format!(
                "bounding box query on {}, which has no geometry",
                feature_type.name
            )));
        }

        let mut filter_sql = String::new();
        let mut filter_params = Vec::with_capacity(query.filters.len());
        for (name, value) in &query.filters {
            let attr = feature_type.attribute(name).ok_or_else(|| {
                Error::validation(format!("{} has no attribute {}", feature_type.name, name))
            })?;
            if attr.is_geometry() {
                return Err(Error::validation(format!(
                    "geometry attribute {} cannot be compared for equality",
                    name
                )));
            }
            let param = match value {
                Value::Null => SqlValue::Null,
                v => schema::map_value(attr, v, feature_type.effective_srs_id(), &Default::default())?,
            };
            filter_sql.push_str(&format!(" AND {} IS ?", quote_ident(name)));
            filter_params.push(param);
        }

        let columns: Vec<String> = std::iter::once(&feature_type.id_column)
            .chain(feature_type.attributes.iter().map(|a| &a.name))
            .map(|c| quote_ident(c))
            .collect();
        let select = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            quote_ident(&feature_type.name)
        );

        let read = match conn.is_autocommit() {
            true => Some(conn.unchecked_transaction()?),
            false => None,
        };
        let candidates = match (query.bbox, index) {
            (Some(bbox), Some(index)) if index.exists(conn)? => Some(index.query(conn, bbox)),
            (Some(_), _) => {
                log::debug!("no spatial index on {}, scanning", feature_type.name);
                None
            }
            _ => None,
        };

        Ok(FeatureCursor {
            conn,
            _read: read,
            feature_type,
            select,
            filter_sql,
            filter_params,
            bbox: query.bbox,
            geometry_position,
            candidates,
            last: None,
            buffer: VecDeque::new(),
            remaining: query.limit,
            exhausted: false,
            failure: None,
        })
    }

    pub fn feature_type(&self) -> &FeatureType {
        &self.feature_type
    }

    fn fill(&mut self) -> Result<()> {
        let id_column = quote_ident(&self.feature_type.id_column);
        let (sql, params) = match self.candidates.as_mut() {
            Some(candidates) => {
                let ids = candidates.take(ID_CHUNK).collect::<Result<Vec<i64>>>()?;
                if ids.len() < ID_CHUNK {
                    self.exhausted = true;
                }
                if ids.is_empty() {
                    return Ok(());
                }
                let placeholders = vec!["?"; ids.len()].join(", ");
                let sql = format!(
                    "{} WHERE {} IN ({}){} ORDER BY {}",
                    self.select, id_column, placeholders, self.filter_sql, id_column
                );
                let params: Vec<SqlValue> = ids
                    .into_iter()
                    .map(SqlValue::Integer)
                    .chain(self.filter_params.iter().cloned())
                    .collect();
                (sql, params)
            }
            None => {
                let sql = format!(
                    "{} WHERE {} > ?{} ORDER BY {} LIMIT {}",
                    self.select, id_column, self.filter_sql, id_column, SCAN_PAGE
                );
                let params: Vec<SqlValue> =
                    std::iter::once(SqlValue::Integer(self.last.unwrap_or(i64::MIN)))
                        .chain(self.filter_params.iter().cloned())
                        .collect();
                (sql, params)
            }
        };

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut fetched = 0;
        while let Some(row) = rows.next()? {
            fetched += 1;
            let fid: i64 = row.get(0)?;
            self.last = Some(fid);
            if let Some(feature) =
                read_row(&self.feature_type, self.geometry_position, self.bbox.as_ref(), fid, row)?
            {
                self.buffer.push_back(feature);
            }
        }
        if self.candidates.is_none() && fetched < SCAN_PAGE {
            self.exhausted = true;
        }
        Ok(())
    }
}

/// Builds the feature of a row, or `None` when its envelope misses `bbox`.
/// The envelope comes from the blob header, so rejected rows are never
/// decoded in full.
fn read_row(
    feature_type: &FeatureType,
    geometry_position: Option<usize>,
    bbox: Option<&Envelope>,
    fid: i64,
    row: &Row<'_>,
) -> Result<Option<Feature>> {
    if let (Some(bbox), Some(position)) = (bbox, geometry_position) {
        let hit = match row.get_ref(position + 1)? {
            ValueRef::Blob(blob) => gpkg_wkb::decode_envelope(blob)?
                .map_or(false, |envelope| envelope.intersects(bbox)),
            _ => false,
        };
        if !hit {
            return Ok(None);
        }
    }
    let mut values = BTreeMap::new();
    for (i, attr) in feature_type.attributes.iter().enumerate() {
        let value = schema::unmap_value(attr, row.get_ref(i + 1)?)
            .map_err(|e| annotate(e, &feature_type.name, fid))?;
        values.insert(attr.name.clone(), value);
    }
    Ok(Some(Feature {
        id: Some(fid),
        values,
    }))
}

pub(crate) fn annotate(e: Error, table: &str, fid: i64) -> Error {
    match e {
        Error::Format(msg) => Error::Format(format!("{} feature {}: {}", table, fid, msg)),
        other => other,
    }
}

impl Iterator for FeatureCursor<'_> {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        while self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                // rows read before the failure are still handed out first
                self.exhausted = true;
                self.failure = Some(e);
            }
        }
        match self.buffer.pop_front() {
            Some(feature) => {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                Some(Ok(feature))
            }
            None => self.failure.take().map(Err),
        }
    }
}
