/// Failure reported by a [`Provider`](super::Provider) operation.
///
/// The `retryable` flag tells the runtime whether repeating the same call may
/// succeed. Lock contention and dropped connections are retryable. Corrupt
/// rows, unknown lock tokens and constraint violations are not.
///
/// ```rust
/// use durable_research::providers::ProviderError;
///
/// let busy = ProviderError::retryable("ack_orchestration_item", "database is locked");
/// assert!(busy.is_retryable());
///
/// let stale = ProviderError::permanent("ack_orchestration_item", "invalid lock token");
/// assert!(!stale.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Provider operation that failed, e.g. `fetch_work_item`.
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Shape this error as the `Infrastructure` variant recorded in history.
    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.retryable { "retryable" } else { "permanent" };
        write!(f, "{} failed ({kind}): {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        Self::permanent("serialize", e.to_string())
    }
}
