//! Error types and handling for the sluice library

use thiserror::Error;

/// Result type alias for sluice operations
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Main error type for the sluice library
#[derive(Error, Debug)]
pub enum SluiceError {
    /// I/O errors from file and directory operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid setup or worker configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Worker callable not found in the registry
    #[error("Unknown worker '{name}' (not registered)")]
    UnknownWorker {
        /// Callable name that failed to resolve
        name: String,
    },

    /// Shared-memory region errors
    #[error("Shared memory error: {message}")]
    Shm {
        /// Error message describing the mapping issue
        message: String,
    },

    /// Process control errors (fork, wait)
    #[error("Process error: {0}")]
    Process(#[from] nix::Error),

    /// Slot access that violates the buffer's layout or protocol
    #[error("Slot misuse: {message}")]
    SlotMisuse {
        /// Reason the access was rejected
        message: String,
    },

    /// Setup file parse errors
    #[error("Setup parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SluiceError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new shared-memory error
    pub fn shm(message: impl Into<String>) -> Self {
        Self::Shm {
            message: message.into(),
        }
    }

    /// Create a new slot-misuse error
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::SlotMisuse {
            message: message.into(),
        }
    }

    /// Check if this error is fatal at setup time (aborts before any
    /// worker process is started)
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::UnknownWorker { .. } | Self::Yaml(_)
        )
    }
}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::SluiceError::config(format!($($arg)*))
    };
}
