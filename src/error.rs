use std::fmt;

/// Closed error taxonomy for the query pipeline.
///
/// Only `InvalidArgument` is meant to be surfaced to a query caller as a
/// failure; every other variant is folded into a degraded `QueryResult` by
/// the executor instead of propagating.
#[derive(Debug)]
pub enum QueryError {
    InvalidArgument(String),
    BackendFault(String),
    NotFound(String),
    InternalError(String),
    ConfigurationError(String),
}

impl QueryError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn backend_fault(message: impl Into<String>) -> Self {
        Self::BackendFault(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError(message.into())
    }

    /// Short machine-stable tag, for structured log fields and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::BackendFault(_) => "backend_fault",
            Self::NotFound(_) => "not_found",
            Self::InternalError(_) => "internal_error",
            Self::ConfigurationError(_) => "configuration_error",
        }
    }

    /// Whether this error should ever reach a query caller as a failure.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::BackendFault(msg) => write!(f, "backend fault: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InternalError(msg) => write!(f, "internal error: {msg}"),
            Self::ConfigurationError(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}

pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invalid_argument_is_user_visible() {
        assert!(QueryError::invalid_argument("bad").is_user_visible());
        assert!(!QueryError::backend_fault("x").is_user_visible());
        assert!(!QueryError::not_found("x").is_user_visible());
        assert!(!QueryError::internal("x").is_user_visible());
        assert!(!QueryError::configuration("x").is_user_visible());
    }

    #[test]
    fn kind_is_stable_for_logging() {
        assert_eq!(QueryError::invalid_argument("x").kind(), "invalid_argument");
        assert_eq!(QueryError::backend_fault("x").kind(), "backend_fault");
    }
}
