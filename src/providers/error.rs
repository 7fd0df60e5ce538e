use std::error::Error;
use std::fmt;

/// Error returned by storage providers, classified for retry handling.
///
/// `retryable` marks transient faults (lock contention, busy database,
/// connection loss) the runtime may retry with backoff. `conflict` marks
/// uniqueness violations, used to detect duplicate instance creation.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub retryable: bool,
    pub conflict: bool,
    pub operation: String,
    pub message: String,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            conflict: false,
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            conflict: false,
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            conflict: true,
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.conflict
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = if self.conflict {
            "conflict"
        } else if self.retryable {
            "retryable"
        } else {
            "permanent"
        };
        write!(f, "{} error in {}: {}", class, self.operation, self.message)
    }
}

impl Error for ProviderError {}
