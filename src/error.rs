//! Error types for datastore operations and pipeline cycles.
//!
//! Every adapter failure is a [`StoreError`] tagged with an [`ErrorClass`].
//! Only transient errors are retried or reconnected; fatal ones surface
//! immediately. [`SyncError`] is what a pipeline cycle returns.

use thiserror::Error;

use crate::backoff::Retryable;
use crate::sink::ItemFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection drops, timeouts, throttling. Worth retrying.
    Transient,
    /// Bad credentials, malformed queries, missing objects.
    Fatal,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is unreachable or failed its liveness check.
    #[error("{store}: connection error: {message}")]
    Connection { store: &'static str, message: String },

    #[error("{store} {op}: {message}")]
    Transient {
        store: &'static str,
        op: &'static str,
        message: String,
    },

    #[error("{store} {op}: {message}")]
    Fatal {
        store: &'static str,
        op: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn connection(store: &'static str, message: impl Into<String>) -> Self {
        StoreError::Connection {
            store,
            message: message.into(),
        }
    }

    pub fn transient(store: &'static str, op: &'static str, message: impl Into<String>) -> Self {
        StoreError::Transient {
            store,
            op,
            message: message.into(),
        }
    }

    pub fn fatal(store: &'static str, op: &'static str, message: impl Into<String>) -> Self {
        StoreError::Fatal {
            store,
            op,
            message: message.into(),
        }
    }

    pub fn new(class: ErrorClass, store: &'static str, op: &'static str, message: impl Into<String>) -> Self {
        match class {
            ErrorClass::Transient => Self::transient(store, op, message),
            ErrorClass::Fatal => Self::fatal(store, op, message),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Connection { .. } | StoreError::Transient { .. } => ErrorClass::Transient,
            StoreError::Fatal { .. } => ErrorClass::Fatal,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection { .. })
    }

    pub fn store(&self) -> &'static str {
        match self {
            StoreError::Connection { store, .. }
            | StoreError::Transient { store, .. }
            | StoreError::Fatal { store, .. } => store,
        }
    }

    /// Classify a sqlx error from PostgreSQL or SQLite.
    pub fn from_sqlx(store: &'static str, op: &'static str, err: sqlx::Error) -> Self {
        let class = match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) => classify_sqlstate(&code),
                None => ErrorClass::Fatal,
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        };
        if matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolClosed) {
            return Self::connection(store, format!("{op}: {err}"));
        }
        Self::new(class, store, op, err.to_string())
    }

    /// Classify a transport-level reqwest error. HTTP status codes are
    /// classified separately by [`classify_status`].
    pub fn from_reqwest(store: &'static str, op: &'static str, err: reqwest::Error) -> Self {
        if err.is_connect() {
            return Self::connection(store, format!("{op}: {err}"));
        }
        if let Some(status) = err.status() {
            return Self::new(classify_status(status.as_u16()), store, op, err.to_string());
        }
        let class = if err.is_timeout() || err.is_request() || err.is_body() {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        };
        Self::new(class, store, op, err.to_string())
    }

    pub fn from_redis(op: &'static str, err: redis::RedisError) -> Self {
        const STORE: &str = "redis";
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            return Self::connection(STORE, format!("{op}: {err}"));
        }
        let class = match err.kind() {
            redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain => ErrorClass::Transient,
            _ if err.is_timeout() => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        };
        Self::new(class, STORE, op, err.to_string())
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// PostgreSQL SQLSTATE classes (and SQLite result codes) worth retrying.
pub fn classify_sqlstate(code: &str) -> ErrorClass {
    match code {
        // SQLite busy / locked, including extended codes
        "5" | "6" | "261" | "262" | "517" => ErrorClass::Transient,
        // connection exceptions
        c if c.starts_with("08") => ErrorClass::Transient,
        // serialization failure, deadlock
        "40001" | "40P01" => ErrorClass::Transient,
        // admin shutdown, crash shutdown, cannot connect now
        c if c.starts_with("57P") => ErrorClass::Transient,
        // too many connections
        "53300" => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        408 | 429 | 502 | 503 | 504 => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

/// Failure of a pipeline cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("corrupt sync state for '{entity}': {message}")]
    CorruptState { entity: String, message: String },

    /// Some documents of a chunk were rejected by the index.
    #[error("{} item(s) rejected by index '{index}' (first: {})", failures.len(), first_reason(failures))]
    PartialLoad {
        index: String,
        failures: Vec<ItemFailure>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

fn first_reason(failures: &[ItemFailure]) -> String {
    failures
        .first()
        .map(|f| format!("{} [{}] {}", f.id, f.status, f.reason))
        .unwrap_or_default()
}

impl SyncError {
    /// Fatal errors stop the pipeline. Everything else fails the cycle only.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Store(e) => e.class() == ErrorClass::Fatal,
            SyncError::CorruptState { .. } | SyncError::Config(_) => true,
            SyncError::PartialLoad { .. } => false,
        }
    }
}
