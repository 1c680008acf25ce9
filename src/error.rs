use std::fmt::{Display, Formatter};

use super::config::StoreId;

/// Phase of the bind pipeline an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPhase {
    MetadataInfo,
    RemainingMetadata,
    StoreBind,
    Relocation,
}

impl Display for BindPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BindPhase::MetadataInfo => write!(f, "metadata-info"),
            BindPhase::RemainingMetadata => write!(f, "remaining-metadata"),
            BindPhase::StoreBind => write!(f, "store-bind"),
            BindPhase::Relocation => write!(f, "relocation"),
        }
    }
}

/// A specialized error type for trace store operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TraceStoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration was invalid.  Detected before any resource is created.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// A single store failed one of its bind phases.
    #[error("store {store} failed {phase} bind: {reason}")]
    BindPhaseFailed {
        store: StoreId,
        phase: BindPhase,
        reason: String,
    },
    /// Bind completed but one or more stores failed.
    #[error("bind completed with {failed} failed store(s)")]
    BindFailed { failed: usize },
    /// A wait on a completion event did not succeed.
    #[error("wait failed: {0}")]
    Wait(String),
    /// The store's reserved address space is exhausted.
    #[error("store out of space: needs {requested} of {reserved} reserved bytes")]
    OutOfSpace { requested: u64, reserved: u64 },
    /// Allocation was attempted against a store whose bind never completed.
    #[error("store {0} is not bound")]
    NotBound(StoreId),
    /// Persisted metadata could not be decoded.
    #[error("metadata corruption: {0}")]
    Corruption(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The bind pipeline was cancelled before this phase ran.
    #[error("bind cancelled before {0} phase")]
    Cancelled(BindPhase),
}

impl TraceStoreError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Configuration(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }

    /// Create a wait failure from a displayable value.
    pub fn wait_failed<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Wait(msg.to_string())
    }
}

/// A Result type alias for trace store operations.
pub type TraceResult<T> = Result<T, TraceStoreError>;
