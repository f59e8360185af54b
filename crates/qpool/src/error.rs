//! Error types for the pool core.
//!
//! Only configuration errors ever reach the caller of [`AllocTask::new`].
//! Allocation errors become a slot's failure marker, destroy errors are
//! counted and dropped.
//!
//! [`AllocTask::new`]: crate::AllocTask::new

use std::any::Any;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("size must be at least 1, got {size}")]
    InvalidSize { size: usize },

    #[error("{name} must be greater than zero")]
    ZeroInterval { name: &'static str },
}

/// Why the most recent allocation on a slot produced no usable resource.
///
/// Stored on the slot as its failure marker. Consumers that claim a
/// poisoned slot should retire it so the maintenance task retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("allocation failed: {message}")]
    Failed { message: String },

    /// The allocator returned a value it does not consider usable.
    #[error("allocation produced an unusable resource: {message}")]
    Invalid { message: String },

    #[error("allocator panicked: {message}")]
    Panicked { message: String },
}

impl AllocationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked {
            message: panic_message(payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestroyError {
    #[error("destroy failed: {message}")]
    Failed { message: String },

    #[error("destroy panicked: {message}")]
    Panicked { message: String },
}

impl DestroyError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked {
            message: panic_message(payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("live queue closed")]
    QueueClosed,
}

/// The completion latch went away without being released: the maintenance
/// task ended before its drain finished.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("maintenance task ended without completing its drain")]
    Abandoned,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Ok(s) = payload.downcast::<String>() {
        *s
    } else {
        "non-string panic payload".to_string()
    }
}
