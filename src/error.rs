use std::fmt;

/// Classification of a failure reported by the reservation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// The connection was refused, dropped, or hit an I/O error.
    ConnectionLost,
    /// The store did not answer in time.
    Timeout,
    /// The store is still loading its dataset, is failing over, or is otherwise
    /// not ready yet.
    Loading,
    /// The store rejected our credentials.
    Authentication,
    /// The atomic operation itself failed (script error, aborted transaction).
    ScriptFailure,
    /// The store answered with something we cannot interpret.
    Protocol,
}

/// Whether each [`StoreErrorKind`] is worth retrying.
///
/// Kept as data so the whole table can be asserted in one place.
pub const RETRYABILITY: [(StoreErrorKind, bool); 6] = [
    (StoreErrorKind::ConnectionLost, true),
    (StoreErrorKind::Timeout, true),
    (StoreErrorKind::Loading, true),
    (StoreErrorKind::Authentication, false),
    (StoreErrorKind::ScriptFailure, false),
    (StoreErrorKind::Protocol, false),
];

impl StoreErrorKind {
    /// Returns `true` if an operation failing with this kind may succeed when retried.
    pub fn is_transient(self) -> bool {
        RETRYABILITY
            .iter()
            .find(|(kind, _)| *kind == self)
            .is_some_and(|(_, retryable)| *retryable)
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreErrorKind::ConnectionLost => "connection lost",
            StoreErrorKind::Timeout => "timeout",
            StoreErrorKind::Loading => "store loading",
            StoreErrorKind::Authentication => "authentication failed",
            StoreErrorKind::ScriptFailure => "atomic operation failed",
            StoreErrorKind::Protocol => "protocol error",
        };

        f.write_str(s)
    }
}

/// A classified failure from the reservation store.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    /// How the failure is classified for retry purposes.
    pub kind: StoreErrorKind,
    /// Human readable detail from the underlying transport.
    pub message: String,
}

impl StoreError {
    /// Build a store error of the given kind.
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Returns `true` if the failure may go away on its own.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        use redis::ErrorKind;

        let kind = if err.is_timeout() {
            StoreErrorKind::Timeout
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error()
        {
            StoreErrorKind::ConnectionLost
        } else {
            match err.kind() {
                ErrorKind::BusyLoadingError
                | ErrorKind::TryAgain
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
                | ErrorKind::ReadOnly => StoreErrorKind::Loading,
                ErrorKind::AuthenticationFailed => StoreErrorKind::Authentication,
                ErrorKind::NoScriptError | ErrorKind::ResponseError | ErrorKind::ExecAbortError => {
                    StoreErrorKind::ScriptFailure
                }
                _ => StoreErrorKind::Protocol,
            }
        };

        Self::new(kind, err.to_string())
    }
}

/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// A rate limit, window, or retry setting was rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A resource key or key prefix failed validation.
    #[error("invalid resource key: {0}")]
    InvalidResourceKey(String),

    /// The reservation store reported a failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A transient store failure persisted through every retry.
    #[error("store unavailable after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The last failure observed.
        source: StoreError,
    },

    /// The connection pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl AdmissionError {
    /// Returns `true` if the failure stems from store unavailability rather
    /// than something the caller must fix.
    pub fn is_transient(&self) -> bool {
        match self {
            AdmissionError::Store(err) => err.is_transient(),
            AdmissionError::RetriesExhausted { .. } => true,
            _ => false,
        }
    }
}

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        AdmissionError::Store(StoreError::from(err))
    }
}
