use thiserror::Error;

/// Main error type for the metric-learning losses
#[derive(Error, Debug, Clone)]
pub enum MetricError {
    /// Shape-related errors with detailed suggestions
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Per-class sample counts differ where a balanced batch is required
    #[error("Class imbalance: every class needs the same number of samples, got counts {counts:?}")]
    ClassImbalance {
        counts: Vec<usize>,
    },

    /// Operation errors with context
    #[error("Operation error: {operation} - {message}")]
    OperationError {
        operation: String,
        message: String,
    },

    /// Errors raised by the tensor backend
    #[error("Tensor error: {0}")]
    TensorError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),
}

impl MetricError {
    /// Create a shape error with helpful suggestions
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        MetricError::ShapeError(message)
    }

    /// Create an operation error with context
    pub fn operation_error(operation: &str, message: &str) -> Self {
        MetricError::OperationError {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<candle_core::Error> for MetricError {
    fn from(err: candle_core::Error) -> Self {
        MetricError::TensorError(err.to_string())
    }
}

impl From<std::io::Error> for MetricError {
    fn from(err: std::io::Error) -> Self {
        MetricError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for MetricError {
    fn from(err: serde_json::Error) -> Self {
        MetricError::SerializationError(err.to_string())
    }
}

/// Result type for metric-learning operations
pub type MetricResult<T> = Result<T, MetricError>;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ShapeMismatch,
    Imbalanced,
    InvalidOperation,
    BackendFailure,
    SerializationFailed,
    ConfigInvalid,
}

impl MetricError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            MetricError::ShapeError(_) => ErrorCode::ShapeMismatch,
            MetricError::ClassImbalance { .. } => ErrorCode::Imbalanced,
            MetricError::OperationError { .. } => ErrorCode::InvalidOperation,
            MetricError::TensorError(_) => ErrorCode::BackendFailure,
            MetricError::SerializationError(_) => ErrorCode::SerializationFailed,
            MetricError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            MetricError::InvalidInput(_) => ErrorCode::InvalidOperation,
            MetricError::InvalidState(_) => ErrorCode::InvalidOperation,
            MetricError::IoError(_) => ErrorCode::InvalidOperation,
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Loss computations are deterministic, so only configuration problems can
    /// be fixed without changing the batch.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.code(), ErrorCode::ConfigInvalid)
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            MetricError::ShapeError(msg) => {
                format!("Shape Error: {}\n\nEmbeddings must be a [batch, dim] tensor and labels must hold one class id per embedding.", msg)
            }
            MetricError::ClassImbalance { counts } => {
                format!("Class Imbalance: per-class counts {:?}\n\nCentroid-based losses need a class-balanced sampler (the same number of samples for every class in the batch).", counts)
            }
            MetricError::OperationError { operation, message } => {
                format!("Operation Error in '{}': {}\n\nThis operation failed. Check your input data and operation parameters.", operation, message)
            }
            MetricError::InvalidInput(msg) => {
                format!("Invalid Input: {}\n\nThe input provided is not valid for this operation. Please check your arguments and data.", msg)
            }
            MetricError::InvalidState(msg) => {
                format!("Invalid State: {}\n\nThe operation could not be performed because the loss is in an invalid state.", msg)
            }
            _ => self.to_string(),
        }
    }
}
