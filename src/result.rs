/// The result returned by many methods within the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A geometry blob or the container metadata is malformed.
    #[error("malformed data: {0}")]
    Format(String),
    /// A feature type or attribute value broke its contract before anything was written.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The file is not a GeoPackage version this crate understands.
    #[error("unsupported container: application_id {application_id:#010x}, user_version {user_version}")]
    Version {
        application_id: u32,
        user_version: u32,
    },
    /// A feature table and its metadata rows disagree.
    #[error("malformed schema for {table}: {reason}")]
    Schema { table: String, reason: String },
    /// One item of a batch failed, nothing from the batch was kept.
    #[error("feature at position {index} failed: {source}")]
    Batch {
        index: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("the GeoPackage was opened read-only")]
    ReadOnly,
    #[error("error when accessing the SQLite database")]
    Storage(#[from] rusqlite::Error),
    #[error("invalid configuration")]
    Config(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn schema(table: &str, reason: impl Into<String>) -> Self {
        Error::Schema {
            table: table.to_owned(),
            reason: reason.into(),
        }
    }

    /// Wraps a per-item failure with the position of the item in its batch.
    pub(crate) fn in_batch(self, index: usize) -> Self {
        Error::Batch {
            index,
            source: Box::new(self),
        }
    }

    /// True when SQLite refused the statement because of a constraint, e.g. a duplicate key.
    pub(crate) fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Error::Storage(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

/// Truncated reads surface as `UnexpectedEof`, which is a malformed blob rather than an I/O problem.
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::format("geometry blob is truncated"),
            _ => Error::format(format!("unreadable geometry blob: {}", e)),
        }
    }
}
