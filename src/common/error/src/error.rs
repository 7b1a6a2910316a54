//! Core error types for Rivulet.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using `RivuletError`.
pub type RivuletResult<T> = std::result::Result<T, RivuletError>;

/// Generic shared error for external error sources.
pub type GenericError = Arc<dyn std::error::Error + Send + Sync>;

/// Core error type for Rivulet operations.
///
/// Variants fall into two groups. Construction-time errors are returned
/// synchronously from node factories and `start_producing`; execution-time
/// errors travel through `error_received` and completion futures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum RivuletError {
    /// Type mismatch or invalid type operation.
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Invalid value provided.
    #[error("ValueError: {0}")]
    ValueError(String),

    /// Schema-related error (mismatched batch, incompatible inputs, etc.).
    #[error("SchemaError: {0}")]
    SchemaError(String),

    /// Column not found in schema.
    #[error("ColumnNotFound: {0}")]
    ColumnNotFound(String),

    /// Node options rejected at construction.
    #[error("InvalidOptions: {0}")]
    InvalidOptions(String),

    /// Operation not allowed in the current lifecycle state.
    #[error("InvalidState: {0}")]
    InvalidState(String),

    /// Named entity (factory, function, node) does not exist.
    #[error("NotFound: {0}")]
    NotFound(String),

    /// Named entity is already registered.
    #[error("AlreadyExists: {0}")]
    AlreadyExists(String),

    /// Query execution error.
    #[error("ExecutionError: {0}")]
    ExecutionError(String),

    /// Memory or another bounded resource ran out.
    #[error("ResourceExhausted: {0}")]
    ResourceExhausted(String),

    /// A scheduled task panicked.
    #[error("TaskPanicked: {0}")]
    TaskPanicked(String),

    /// Execution was cancelled by the caller.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Feature not yet implemented.
    #[error("NotImplemented: {0}")]
    NotImplemented(String),

    /// Internal error (bug in Rivulet).
    #[error("InternalError: {0}")]
    InternalError(String),

    /// IO error.
    #[error("IoError: {0}")]
    IoError(Arc<std::io::Error>),

    /// Arrow error.
    #[error("ArrowError: {0}")]
    ArrowError(Arc<arrow_schema::ArrowError>),

    /// External error from third-party libraries.
    #[error("ExternalError: {0}")]
    ExternalError(GenericError),
}

impl RivuletError {
    /// Create a new `TypeError`.
    pub fn type_error<S: Into<String>>(msg: S) -> Self {
        Self::TypeError(msg.into())
    }

    /// Create a new `ValueError`.
    pub fn value_error<S: Into<String>>(msg: S) -> Self {
        Self::ValueError(msg.into())
    }

    /// Create a new `SchemaError`.
    pub fn schema_error<S: Into<String>>(msg: S) -> Self {
        Self::SchemaError(msg.into())
    }

    /// Create a new `ColumnNotFound` error.
    pub fn column_not_found<S: Into<String>>(name: S) -> Self {
        Self::ColumnNotFound(name.into())
    }

    /// Create a new `InvalidOptions` error.
    pub fn invalid_options<S: Into<String>>(msg: S) -> Self {
        Self::InvalidOptions(msg.into())
    }

    /// Create a new `InvalidState` error.
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new `NotFound` error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new `AlreadyExists` error.
    pub fn already_exists<S: Into<String>>(msg: S) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a new `ExecutionError`.
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::ExecutionError(msg.into())
    }

    /// Create a resource exhausted error.
    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a task panic error.
    pub fn task_panicked<S: Into<String>>(msg: S) -> Self {
        Self::TaskPanicked(msg.into())
    }

    /// Create a cancellation error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new `NotImplemented` error.
    pub fn not_implemented<S: Into<String>>(msg: S) -> Self {
        Self::NotImplemented(msg.into())
    }

    /// Create a new `InternalError`.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::InternalError(msg.into())
    }

    /// Wrap an error from a third-party library.
    pub fn external<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ExternalError(Arc::new(error))
    }

    /// Whether this error is reported before execution starts.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::TypeError(_)
                | Self::SchemaError(_)
                | Self::ColumnNotFound(_)
                | Self::InvalidOptions(_)
                | Self::InvalidState(_)
                | Self::NotFound(_)
                | Self::AlreadyExists(_)
        )
    }

    /// Whether this error reports a caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Whether this error reports memory exhaustion.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

impl From<std::io::Error> for RivuletError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(Arc::new(err))
    }
}

impl From<arrow_schema::ArrowError> for RivuletError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        Self::ArrowError(Arc::new(err))
    }
}

/// Ensure a condition holds, returning an `ExecutionError` if not.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            return Err($crate::RivuletError::ExecutionError($msg.to_string()));
        }
    };
    ($cond:expr, $variant:ident: $($msg:tt)*) => {
        if !$cond {
            return Err($crate::RivuletError::$variant(format!($($msg)*)));
        }
    };
}

/// Return early with an `InvalidOptions` error.
#[macro_export]
macro_rules! options_err {
    ($($arg:tt)*) => {
        return Err($crate::RivuletError::InvalidOptions(format!($($arg)*)))
    };
}

/// Return early with a `TypeError`.
#[macro_export]
macro_rules! type_err {
    ($($arg:tt)*) => {
        return Err($crate::RivuletError::TypeError(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_limit(value: usize) -> RivuletResult<usize> {
        ensure!(value < 10, InvalidOptions: "value {} exceeds limit", value);
        Ok(value)
    }

    fn reject_type(name: &str) -> RivuletResult<()> {
        type_err!("unsupported type {name}")
    }

    #[test]
    fn test_error_display() {
        let err = RivuletError::type_error("expected Int64, got Utf8");
        assert_eq!(err.to_string(), "TypeError: expected Int64, got Utf8");
    }

    #[test]
    fn test_error_constructors() {
        let _ = RivuletError::value_error("invalid value");
        let _ = RivuletError::schema_error("column count mismatch");
        let _ = RivuletError::not_implemented("feature X");
        let _ = RivuletError::internal("unexpected state");
        let _ = RivuletError::task_panicked("boom");
    }

    #[test]
    fn test_error_classification() {
        assert!(RivuletError::invalid_options("low >= high").is_construction_error());
        assert!(!RivuletError::execution("kernel failed").is_construction_error());
        assert!(RivuletError::cancelled("user").is_cancelled());
        assert!(RivuletError::resource_exhausted("memory").is_resource_exhausted());
    }

    #[test]
    fn test_arrow_error_is_cloneable() {
        let err: RivuletError = arrow_schema::ArrowError::ComputeError("overflow".into()).into();
        let cloned = err.clone();
        assert!(matches!(cloned, RivuletError::ArrowError(_)));
        assert!(cloned.to_string().contains("overflow"));
    }

    #[test]
    fn test_ensure_macro() {
        assert_eq!(check_limit(3).unwrap(), 3);
        let err = check_limit(12).unwrap_err();
        assert_eq!(err.to_string(), "InvalidOptions: value 12 exceeds limit");
    }

    #[test]
    fn test_type_err_macro() {
        let err = reject_type("Map").unwrap_err();
        assert!(matches!(err, RivuletError::TypeError(_)));
    }
}
