//! Translation between [FeatureType] descriptions and GeoPackage tables.
//!
//! A feature type becomes one SQLite table with an integer primary key, a row
//! in `gpkg_contents`, and (when it has a geometry attribute) a row in
//! `gpkg_geometry_columns`. [describe] rebuilds the description from those
//! metadata rows and `PRAGMA table_info`, never from row contents.

use crate::gpkg_wkb::{self, CodecOptions};
use crate::result::{Error, Result};
use crate::sql::quote_ident;
use crate::srs::SrsRegistry;
use crate::types::{Dimensions, Geometry, GeometryType};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

/// Primary key column used for tables created by this crate.
pub const DEFAULT_ID_COLUMN: &str = "fid";

/// Srs id given to geometry columns of a feature type that names none.
pub const DEFAULT_SRS_ID: i32 = 0;

const RESERVED_PREFIXES: [&str; 4] = ["gpkg_", "sqlite_", "rtree_", "envelope_"];

/// Whether a geometry column allows, requires or forbids an ordinate,
/// as stored in the z and m columns of `gpkg_geometry_columns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MZOption {
    Prohibited = 0,
    Mandatory = 1,
    Optional = 2,
}

impl MZOption {
    fn from_flag(flag: i64) -> Option<Self> {
        match flag {
            0 => Some(MZOption::Prohibited),
            1 => Some(MZOption::Mandatory),
            2 => Some(MZOption::Optional),
            _ => None,
        }
    }

    fn allows(self, present: bool) -> bool {
        match self {
            MZOption::Prohibited => !present,
            MZOption::Mandatory => present,
            MZOption::Optional => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryColumnType {
    pub geometry_type: GeometryType,
    pub z: MZOption,
    pub m: MZOption,
}

impl GeometryColumnType {
    /// A column holding exactly `dimensions` geometries of `geometry_type`.
    pub fn new(geometry_type: GeometryType, dimensions: Dimensions) -> Self {
        let flag = |present: bool| match present {
            true => MZOption::Mandatory,
            false => MZOption::Prohibited,
        };
        GeometryColumnType {
            geometry_type,
            z: flag(dimensions.has_z()),
            m: flag(dimensions.has_m()),
        }
    }

    fn check(&self, column: &str, geometry: &Geometry) -> Result<()> {
        if !self.geometry_type.accepts(geometry.geometry_type()) {
            return Err(Error::validation(format!(
                "column {} holds {} geometries, got {}",
                column,
                self.geometry_type,
                geometry.geometry_type()
            )));
        }
        let dims = geometry.dimensions();
        if !self.z.allows(dims.has_z()) || !self.m.allows(dims.has_m()) {
            return Err(Error::validation(format!(
                "column {} (z {:?}, m {:?}) cannot hold a {:?} geometry",
                column, self.z, self.m, dims
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    Integer,
    Real,
    Text,
    Blob,
    Geometry(GeometryColumnType),
}

impl AttributeType {
    pub fn geometry(geometry_type: GeometryType, dimensions: Dimensions) -> Self {
        AttributeType::Geometry(GeometryColumnType::new(geometry_type, dimensions))
    }

    fn sql_type(&self) -> &'static str {
        match self {
            AttributeType::Integer => "INTEGER",
            AttributeType::Real => "REAL",
            AttributeType::Text => "TEXT",
            AttributeType::Blob => "BLOB",
            // geometry columns are declared with their type name, the values are blobs
            AttributeType::Geometry(g) => g.geometry_type.name(),
        }
    }

    // https://www.sqlite.org/datatype3.html#determination_of_column_affinity,
    // with the GeoPackage BOOLEAN, DATE and DATETIME names added
    fn from_declared(declared: &str) -> Self {
        let t = declared.to_ascii_uppercase();
        if t.contains("INT") || t == "BOOLEAN" {
            AttributeType::Integer
        } else if t.contains("CHAR") || t.contains("CLOB") || t.contains("TEXT") || t.starts_with("DATE") {
            AttributeType::Text
        } else if t.is_empty() || t.contains("BLOB") {
            AttributeType::Blob
        } else {
            AttributeType::Real
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDescriptor {
    pub name: String,
    pub attribute_type: AttributeType,
    pub nullable: bool,
}

impl AttributeDescriptor {
    /// A nullable attribute.
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        AttributeDescriptor {
            name: name.into(),
            attribute_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn is_geometry(&self) -> bool {
        matches!(self.attribute_type, AttributeType::Geometry(_))
    }
}

/// The description of a feature table.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureType {
    pub name: String,
    pub attributes: Vec<AttributeDescriptor>,
    /// Reference system of the geometry attribute, [DEFAULT_SRS_ID] when unset.
    pub srs_id: Option<i32>,
    pub description: Option<String>,
    pub id_column: String,
}

impl FeatureType {
    pub fn new(name: impl Into<String>) -> Self {
        FeatureType {
            name: name.into(),
            attributes: Vec::new(),
            srs_id: None,
            description: None,
            id_column: DEFAULT_ID_COLUMN.to_owned(),
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_srs_id(mut self, srs_id: i32) -> Self {
        self.srs_id = Some(srs_id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn geometry_attribute(&self) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.is_geometry())
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn effective_srs_id(&self) -> i32 {
        self.srs_id.unwrap_or(DEFAULT_SRS_ID)
    }

    /// Checks the contract of a feature type before anything touches storage.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("feature type name is empty"));
        }
        let lower = self.name.to_ascii_lowercase();
        if let Some(prefix) = RESERVED_PREFIXES.iter().find(|p| lower.starts_with(*p)) {
            return Err(Error::validation(format!(
                "table name {} uses the reserved prefix {}",
                self.name, prefix
            )));
        }
        if self.attributes.is_empty() {
            return Err(Error::validation(format!(
                "feature type {} has no attributes",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        seen.insert(self.id_column.to_ascii_lowercase());
        for attr in &self.attributes {
            if attr.name.is_empty() {
                return Err(Error::validation(format!(
                    "feature type {} has an attribute without a name",
                    self.name
                )));
            }
            // SQLite column names are case-insensitive
            if !seen.insert(attr.name.to_ascii_lowercase()) {
                return Err(Error::validation(format!(
                    "attribute {} appears twice in {} (or clashes with {})",
                    attr.name, self.name, self.id_column
                )));
            }
        }
        let geometries = self.attributes.iter().filter(|a| a.is_geometry()).count();
        if geometries > 1 {
            return Err(Error::validation(format!(
                "found {} geometry attributes in {}, 1 is the maximum allowed amount",
                geometries, self.name
            )));
        }
        Ok(())
    }
}

/// An attribute value as seen by callers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    /// `srs_id` is filled on reads; on writes `None` means the feature type's own.
    Geometry {
        geometry: Geometry,
        srs_id: Option<i32>,
    },
}

impl Value {
    pub fn as_geometry(&self) -> Option<&Geometry> {
        match self {
            Value::Geometry { geometry, .. } => Some(geometry),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<Geometry> for Value {
    fn from(geometry: Geometry) -> Self {
        Value::Geometry {
            geometry,
            srs_id: None,
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NULL",
        Value::Integer(_) => "an integer",
        Value::Real(_) => "a real",
        Value::Text(_) => "text",
        Value::Blob(_) => "a blob",
        Value::Geometry { .. } => "a geometry",
    }
}

/// Maps a caller value onto what SQLite stores for the attribute, encoding
/// geometries with `srs_id`.
pub fn map_value(
    attr: &AttributeDescriptor,
    value: &Value,
    srs_id: i32,
    codec: &CodecOptions,
) -> Result<SqlValue> {
    let mapped = match (&attr.attribute_type, value) {
        (_, Value::Null) if attr.nullable => SqlValue::Null,
        (_, Value::Null) => {
            return Err(Error::validation(format!(
                "attribute {} is not nullable",
                attr.name
            )))
        }
        (AttributeType::Integer, Value::Integer(i)) => SqlValue::Integer(*i),
        (AttributeType::Real, Value::Real(f)) => SqlValue::Real(*f),
        (AttributeType::Real, Value::Integer(i)) => SqlValue::Real(*i as f64),
        (AttributeType::Text, Value::Text(s)) => SqlValue::Text(s.clone()),
        (AttributeType::Blob, Value::Blob(b)) => SqlValue::Blob(b.clone()),
        (
            AttributeType::Geometry(column),
            Value::Geometry {
                geometry,
                srs_id: given,
            },
        ) => {
            if let Some(given) = given.filter(|g| *g != srs_id) {
                return Err(Error::validation(format!(
                    "geometry in srs {} written to column {} declared with srs {}",
                    given, attr.name, srs_id
                )));
            }
            column.check(&attr.name, geometry)?;
            SqlValue::Blob(gpkg_wkb::encode_with(geometry, srs_id, codec)?)
        }
        (t, v) => {
            return Err(Error::validation(format!(
                "attribute {} of type {:?} cannot hold {}",
                attr.name,
                t,
                kind_name(v)
            )))
        }
    };
    Ok(mapped)
}

/// The inverse of [map_value]. Stored values that do not fit the declared
/// type are a [Error::Format], they are never coerced.
pub fn unmap_value(attr: &AttributeDescriptor, stored: ValueRef<'_>) -> Result<Value> {
    let value = match (&attr.attribute_type, stored) {
        (_, ValueRef::Null) => Value::Null,
        (AttributeType::Integer, ValueRef::Integer(i)) => Value::Integer(i),
        (AttributeType::Real, ValueRef::Real(f)) => Value::Real(f),
        (AttributeType::Real, ValueRef::Integer(i)) => Value::Real(i as f64),
        (AttributeType::Text, ValueRef::Text(t)) => Value::Text(
            String::from_utf8(t.to_vec())
                .map_err(|_| Error::format(format!("attribute {} is not valid UTF-8", attr.name)))?,
        ),
        (AttributeType::Blob, ValueRef::Blob(b)) => Value::Blob(b.to_vec()),
        (AttributeType::Geometry(_), ValueRef::Blob(b)) => {
            let decoded = gpkg_wkb::decode(b)?;
            Value::Geometry {
                geometry: decoded.geometry,
                srs_id: Some(decoded.srs_id),
            }
        }
        (t, v) => {
            return Err(Error::format(format!(
                "attribute {} of type {:?} holds a stored {:?}",
                attr.name,
                t,
                v.data_type()
            )))
        }
    };
    Ok(value)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE lower(name) = lower(?1)",
            [name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Creates the table and its metadata rows inside `tx`.
pub fn create_table(
    tx: &Transaction<'_>,
    registry: &mut SrsRegistry,
    feature_type: &FeatureType,
) -> Result<()> {
    feature_type.validate()?;
    let name = &feature_type.name;
    let registered: Option<String> = tx
        .query_row(
            "SELECT table_name FROM gpkg_contents WHERE lower(table_name) = lower(?1)",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    if registered.is_some() || table_exists(tx, name)? {
        return Err(Error::Conflict(format!("table {}", name)));
    }
    let geometry = feature_type.geometry_attribute();
    let srs_id = match geometry {
        Some(_) => {
            let id = feature_type.effective_srs_id();
            registry.resolve(tx, id)?;
            Some(id)
        }
        None => None,
    };

    let mut columns = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL",
        quote_ident(&feature_type.id_column)
    )];
    for attr in &feature_type.attributes {
        let null_str = if attr.nullable { "" } else { " NOT NULL" };
        columns.push(format!(
            "{} {}{}",
            quote_ident(&attr.name),
            attr.attribute_type.sql_type(),
            null_str
        ));
    }
    tx.execute(
        &format!("CREATE TABLE {} ({})", quote_ident(name), columns.join(", ")),
        [],
    )?;
    tx.execute(
        "INSERT INTO gpkg_contents (table_name, data_type, identifier, description, srs_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            name,
            if geometry.is_some() { "features" } else { "attributes" },
            name,
            feature_type.description.as_deref().unwrap_or(""),
            srs_id,
        ],
    )?;
    if let (Some(attr), Some(srs_id)) = (geometry, srs_id) {
        if let AttributeType::Geometry(column) = attr.attribute_type {
            tx.execute(
                "INSERT INTO gpkg_geometry_columns VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    name,
                    attr.name,
                    column.geometry_type.name(),
                    srs_id,
                    column.z as i32,
                    column.m as i32,
                ],
            )?;
        }
    }
    log::info!(
        "created table {} with {} attributes",
        name,
        feature_type.attributes.len()
    );
    Ok(())
}

/// Drops the table and every metadata row naming it.
pub fn drop_table(tx: &Transaction<'_>, name: &str) -> Result<()> {
    let registered = tx
        .query_row(
            "SELECT 1 FROM gpkg_contents WHERE table_name = ?1",
            [name],
            |_| Ok(()),
        )
        .optional()?;
    if registered.is_none() {
        return Err(Error::NotFound(format!("feature type {}", name)));
    }
    // rows referencing gpkg_contents go first
    tx.execute("DELETE FROM gpkg_geometry_columns WHERE table_name = ?1", [name])?;
    tx.execute("DELETE FROM gpkg_extensions WHERE table_name = ?1", [name])?;
    tx.execute("DELETE FROM gpkg_contents WHERE table_name = ?1", [name])?;
    tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])?;
    log::info!("dropped table {}", name);
    Ok(())
}

/// Names of every feature and attribute table listed in `gpkg_contents`.
pub fn feature_type_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT table_name FROM gpkg_contents
         WHERE data_type IN ('features', 'attributes') ORDER BY table_name",
    )?;
    let names = stmt.query_map([], |row| row.get(0))?;
    Ok(names.collect::<rusqlite::Result<Vec<String>>>()?)
}

struct ColumnInfo {
    name: String,
    declared: String,
    not_null: bool,
    pk: bool,
}

/// Rebuilds a [FeatureType] from the metadata tables and the table's columns.
pub fn describe(conn: &Connection, name: &str) -> Result<FeatureType> {
    let contents: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT table_name, data_type, description FROM gpkg_contents WHERE table_name = ?1",
            [name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let (table, data_type, description) =
        contents.ok_or_else(|| Error::NotFound(format!("feature type {}", name)))?;
    if data_type != "features" && data_type != "attributes" {
        return Err(Error::schema(&table, format!("unsupported data type {}", data_type)));
    }

    let geometry_row: Option<(String, String, i32, i64, i64)> = conn
        .query_row(
            "SELECT column_name, geometry_type_name, srs_id, z, m
             FROM gpkg_geometry_columns WHERE table_name = ?1",
            [&table],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;
    if data_type == "features" && geometry_row.is_none() {
        return Err(Error::schema(&table, "no gpkg_geometry_columns row for a features table"));
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                declared: row.get(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                pk: row.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if columns.is_empty() {
        return Err(Error::schema(&table, "listed in gpkg_contents but the table is missing"));
    }

    let id_columns: Vec<&ColumnInfo> = columns.iter().filter(|c| c.pk).collect();
    let id_column = match id_columns.as_slice() {
        [c] if AttributeType::from_declared(&c.declared) == AttributeType::Integer => c.name.clone(),
        _ => {
            return Err(Error::schema(&table, "no single INTEGER PRIMARY KEY column"));
        }
    };

    let geometry_column = match &geometry_row {
        Some((column, type_name, _, z, m)) => {
            let geometry_type = GeometryType::from_name(type_name).ok_or_else(|| {
                Error::schema(&table, format!("unknown geometry type {}", type_name))
            })?;
            let (z, m) = match (MZOption::from_flag(*z), MZOption::from_flag(*m)) {
                (Some(z), Some(m)) => (z, m),
                _ => return Err(Error::schema(&table, "z and m flags must be 0, 1 or 2")),
            };
            if !columns.iter().any(|c| &c.name == column) {
                return Err(Error::schema(
                    &table,
                    format!("geometry column {} does not exist", column),
                ));
            }
            Some((
                column.clone(),
                GeometryColumnType {
                    geometry_type,
                    z,
                    m,
                },
            ))
        }
        None => None,
    };

    let mut attributes = Vec::with_capacity(columns.len() - 1);
    for c in columns.iter().filter(|c| !c.pk) {
        let attribute_type = match &geometry_column {
            Some((column, column_type)) if column == &c.name => AttributeType::Geometry(*column_type),
            _ if GeometryType::from_name(&c.declared).is_some() => {
                return Err(Error::schema(
                    &table,
                    format!("column {} is declared {} but has no geometry metadata", c.name, c.declared),
                ));
            }
            _ => AttributeType::from_declared(&c.declared),
        };
        attributes.push(AttributeDescriptor {
            name: c.name.clone(),
            attribute_type,
            nullable: !c.not_null,
        });
    }

    Ok(FeatureType {
        name: table,
        attributes,
        srs_id: geometry_row.map(|(_, _, srs_id, _, _)| srs_id),
        description: description.filter(|d| !d.is_empty()),
        id_column,
    })
}
