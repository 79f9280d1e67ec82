//! Error types for the restfed core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! None of these reach the caller of a sync run: the run only reports
//! aggregate counters, and the reason a record failed goes to the log.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Notification(#[from] NotificationError),
}

// ---------------------------------------------------------------------------
// Remote directory errors
// ---------------------------------------------------------------------------

/// Errors from a single page request against the remote user directory.
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP-level transport error (network, TLS, proxy, etc.).
    #[error("remote directory transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The directory answered with a non-success status code.
    #[error("remote directory returned HTTP {status} for page {page}")]
    Status { status: u16, page: u32 },

    /// The page body is not a JSON collection of user records.
    #[error("remote directory page {page} is not a valid user collection: {detail}")]
    MalformedBody { page: u32, detail: String },
}

// ---------------------------------------------------------------------------
// Local store errors
// ---------------------------------------------------------------------------

/// Errors from the local identity store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying rusqlite error (constraint violations included).
    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("store migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored value could not be decoded.
    #[error("corrupt {entity} row: {detail}")]
    Corrupt { entity: String, detail: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("store I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Per-record errors
// ---------------------------------------------------------------------------

/// Why a single remote record could not be applied to the local store.
#[derive(Debug, Error)]
pub enum RecordError {
    /// An update targeted an identity whose email differs from the remote one.
    #[error("local and remote users are not the same email: [{remote} != {local}]")]
    OriginMismatch { remote: String, local: String },

    /// The remote record lacks a username or email.
    #[error("remote record is missing required field '{0}'")]
    MissingRequiredField(&'static str),

    /// The unit of work failed at the store layer.
    #[error("persistence failure: {0}")]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for RecordError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors that abort a whole sync run before any record is processed.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another sync run is already in progress.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// Reading or writing run bookkeeping failed.
    #[error("sync store error: {0}")]
    StoreError(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A `${KEY}` placeholder could not be resolved.
    #[error("key {0} is not found in the env variables")]
    PlaceholderUnresolved(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Notification errors
// ---------------------------------------------------------------------------

/// Errors from post-provisioning notification.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Email delivery failed.
    #[error("email notification failed: {0}")]
    EmailError(String),

    /// A custom action template could not be loaded.
    #[error("action template '{template}' unavailable: {detail}")]
    TemplateError { template: String, detail: String },

    /// The action token could not be built.
    #[error("action token error: {0}")]
    TokenError(String),
}
