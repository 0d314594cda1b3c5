use std::fmt;
use thiserror::Error;

/// Unified error type for the model checking core.
///
/// Verification findings (deadlocks, invariant violations, accepting cycles)
/// are not errors; they are reported through [`crate::run::Outcome`].
#[derive(Debug, Error)]
pub enum CheckError {
    /// The fixed-size state store ran out of buckets
    #[error("State store full: {occupied} of {capacity} buckets occupied")]
    StoreFull {
        occupied: u64,
        capacity: u64,
        details: Option<String>,
    },

    /// A coordination invariant was broken (negative counter, double color-set, ...)
    #[error("Coordination protocol violated: {invariant}")]
    ProtocolViolation {
        invariant: String,
        reference: Option<usize>,
        worker: Option<usize>,
    },

    /// The next-state generator failed on a state
    #[error("Next-state oracle failed on state {state:?}: {message}")]
    Oracle {
        state: Vec<i32>,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Trace writing errors
    #[error("Trace sink failed: {message}")]
    TraceSink {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Cancellation errors
    #[error("Operation was cancelled: {operation}")]
    Cancelled {
        operation: String,
        reason: Option<String>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CheckError {
    /// Create a store capacity error
    pub fn store_full(occupied: u64, capacity: u64) -> Self {
        Self::StoreFull {
            occupied,
            capacity,
            details: None,
        }
    }

    /// Attach details to a store capacity error
    pub fn with_details<S: Into<String>>(mut self, text: S) -> Self {
        if let Self::StoreFull { ref mut details, .. } = self {
            *details = Some(text.into());
        }
        self
    }

    /// Create a protocol violation error
    pub fn protocol<S: Into<String>>(invariant: S) -> Self {
        Self::ProtocolViolation {
            invariant: invariant.into(),
            reference: None,
            worker: None,
        }
    }

    /// Create a protocol violation error naming the offending reference
    pub fn protocol_at<S: Into<String>>(invariant: S, reference: usize) -> Self {
        Self::ProtocolViolation {
            invariant: invariant.into(),
            reference: Some(reference),
            worker: None,
        }
    }

    /// Record which worker observed the error
    pub fn on_worker(mut self, id: usize) -> Self {
        if let Self::ProtocolViolation { ref mut worker, .. } = self {
            *worker = Some(id);
        }
        self
    }

    /// Create an oracle error for the given state
    pub fn oracle<M: Into<String>>(state: &[i32], message: M) -> Self {
        Self::Oracle {
            state: state.to_vec(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an oracle error with a source error
    pub fn oracle_with_source<M: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        state: &[i32],
        message: M,
        source: E,
    ) -> Self {
        Self::Oracle {
            state: state.to_vec(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
            expected: None,
            actual: None,
        }
    }

    /// Create a configuration error naming the field and the offending value
    pub fn configuration_field<S: Into<String>, F: Into<String>, A: fmt::Display>(
        message: S,
        field: F,
        actual: A,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
            expected: None,
            actual: Some(actual.to_string()),
        }
    }

    /// Create a trace sink error
    pub fn trace_sink<S: Into<String>>(message: S) -> Self {
        Self::TraceSink {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: None,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Fatal errors abort every worker of the run; a broken coordination
    /// protocol invalidates all partial results.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Cancelled { .. } => false,
            Self::Configuration { .. } => false,
            _ => true,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::StoreFull { .. } => "capacity",
            Self::ProtocolViolation { .. } => "protocol",
            Self::Oracle { .. } => "oracle",
            Self::Configuration { .. } => "configuration",
            Self::TraceSink { .. } => "trace",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CheckError>;

impl From<std::io::Error> for CheckError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for CheckError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for CheckError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for CheckError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
            source: None,
        }
    }
}
