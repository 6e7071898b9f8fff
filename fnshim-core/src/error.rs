//! Startup error types
//!
//! Everything here is fatal: the shim reports it and exits before entering
//! the invocation loop. Failures raised by handler code are not `ShimError`s,
//! see [`crate::failure`].

use thiserror::Error;

/// Errors that stop the shim
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("Invalid startup parameters: expected {expected}, got {got}")]
    InvalidParameters { expected: &'static str, got: usize },

    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("No module named '{0}'")]
    ModuleNotFound(String),

    #[error("Failed to load module '{module}': {message}")]
    ModuleLoad { module: String, message: String },

    #[error("Module '{module}' has no attribute '{attribute}'")]
    AttributeNotFound { module: String, attribute: String },

    #[error("'{module}.{attribute}' is not callable")]
    NotCallable { module: String, attribute: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShimError {
    /// Whether the error came from resolving the handler rather than from
    /// the parameters or the output channel
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            Self::ModuleNotFound(_)
                | Self::ModuleLoad { .. }
                | Self::AttributeNotFound { .. }
                | Self::NotCallable { .. }
        )
    }
}
