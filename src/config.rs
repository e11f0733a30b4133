//! Options recognised when opening a container.

use crate::gpkg_wkb::CodecOptions;
use crate::result::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The `dbtype` value naming this store in [DataStoreParams].
pub const DBTYPE: &str = "geopkg";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    /// Refuse every write; opening a missing file fails instead of creating it.
    pub read_only: bool,
    /// Open with SQLite's shared cache so handles in this process share pages.
    pub shared_cache: bool,
    /// Use the R-tree virtual table for new spatial indexes. Without it
    /// envelopes are kept in an ordinary table.
    pub allow_extensions: bool,
    /// Directory that relative container paths are resolved against.
    pub base_directory: Option<PathBuf>,
    pub busy_timeout_ms: u64,
    pub codec: CodecOptions,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            read_only: false,
            shared_cache: false,
            allow_extensions: true,
            base_directory: None,
            busy_timeout_ms: 5_000,
            codec: CodecOptions::default(),
        }
    }
}

impl OpenOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn allow_extensions(mut self, allow: bool) -> Self {
        self.allow_extensions = allow;
        self
    }

    pub fn base_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_directory = Some(dir.into());
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// `location` joined onto the base directory when it is relative.
    pub fn resolve_path(&self, location: &Path) -> PathBuf {
        match &self.base_directory {
            Some(base) if location.is_relative() => base.join(location),
            _ => location.to_path_buf(),
        }
    }
}

/// Connection parameters in the key/value shape used by data store lookups,
/// e.g. `{"dbtype": "geopkg", "database": "roads.gpkg", "read_only": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DataStoreParams {
    pub dbtype: String,
    pub database: PathBuf,
    /// Accepted for compatibility, SQLite has no users.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(flatten)]
    pub options: OpenOptions,
}

impl DataStoreParams {
    pub fn from_json(json: &str) -> Result<Self> {
        let params: DataStoreParams = serde_json::from_str(json)?;
        if params.dbtype != DBTYPE {
            return Err(Error::validation(format!(
                "dbtype {} is not {}",
                params.dbtype, DBTYPE
            )));
        }
        Ok(params)
    }

    /// The container path with the base directory applied.
    pub fn location(&self) -> PathBuf {
        self.options.resolve_path(&self.database)
    }
}
