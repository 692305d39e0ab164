// ABOUTME: Custom error types for the replicator
// ABOUTME: Distinguishes retryable failures from permanent and fatal ones

use std::fmt;

#[derive(Debug)]
pub enum ReplicatorError {
    /// Invalid or missing configuration. Fatal at job start.
    Config(String),
    /// An endpoint cannot be reached. Fatal at job start.
    Connection(String),
    /// 5xx, timeout, or network reset. Retried up to `options.retries`.
    Transient(String),
    /// 4xx from a query (bad field, syntax). Aborts the measurement.
    Permanent(String),
    /// Malformed response or unusable payload. Empty result substituted.
    Data(String),
    /// Invalid cron expression. Fatal at job start.
    Scheduling(String),
}

impl ReplicatorError {
    /// Whether a failed operation may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicatorError::Transient(_) | ReplicatorError::Connection(_)
        )
    }
}

impl fmt::Display for ReplicatorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReplicatorError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ReplicatorError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ReplicatorError::Transient(msg) => write!(f, "Transient error: {}", msg),
            ReplicatorError::Permanent(msg) => write!(f, "Permanent error: {}", msg),
            ReplicatorError::Data(msg) => write!(f, "Data error: {}", msg),
            ReplicatorError::Scheduling(msg) => write!(f, "Scheduling error: {}", msg),
        }
    }
}

impl std::error::Error for ReplicatorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ReplicatorError::Transient("503".into()).is_transient());
        assert!(ReplicatorError::Connection("refused".into()).is_transient());
        assert!(!ReplicatorError::Permanent("bad field".into()).is_transient());
        assert!(!ReplicatorError::Config("missing url".into()).is_transient());
    }
}
