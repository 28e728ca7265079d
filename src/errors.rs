use thiserror::Error;

use crate::models::ActivityKind;

/// Error taxonomy for the interval engine. Validation and not-found
/// errors are surfaced synchronously and never retried; `Backend` is the
/// retryable class the reducer buffers open items against.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval: beginDate {begin} is after endDate {end}")]
    InvalidInterval { begin: i64, end: i64 },

    #[error("invalid query window: from {from} is after to {to}")]
    InvalidWindow { from: i64, to: i64 },

    #[error("track item {0} not found")]
    NotFound(i64),

    #[error("{kind} write [{begin}, {end}] would overlap an existing item")]
    Overlap {
        kind: ActivityKind,
        begin: i64,
        end: i64,
    },

    #[error("sampler is already active")]
    SamplerActive,

    #[error("storage backend unavailable: {0}")]
    Backend(String),

    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i32, supported: i32 },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl EngineError {
    /// Whether a failed write may succeed if replayed later. Only the
    /// transient SQLite classes qualify; a deterministic failure such as
    /// a constraint violation would fail identically on every replay.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Backend(_) => true,
            EngineError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}
