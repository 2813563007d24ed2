//! Unified error handling for trackforge
//!
//! Two distinct failure channels exist in the pipeline:
//! - [`TrackForgeError`] is returned through `Result` for conditions that stop an
//!   operation (configuration problems, corrupt input, sizing defects).
//! - [`ErrorSink`] receives capacity overflows raised from inside parallel kernels.
//!   Those never unwind: the kernel drops the current partition's output and the
//!   pipeline keeps going with the next partition.

use std::fmt;
use std::sync::Mutex;

use crate::memory::MemoryError;

/// Unified error type for trackforge
#[derive(Debug, thiserror::Error)]
pub enum TrackForgeError {
    // ========== Memory Errors ==========
    /// Arena / resource manager failure
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // ========== Capacity Errors ==========
    /// A pre-sized buffer was too small for the produced data
    #[error("Capacity overflow ({code}): {observed} > {capacity}")]
    CapacityOverflow {
        code: ErrorCode,
        observed: u64,
        capacity: u64,
    },

    // ========== User Errors ==========
    /// Invalid processing settings
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Malformed event input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Compressed cluster buffer cannot be parsed
    #[error("Corrupt compressed data: {0}")]
    CorruptCompressedData(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (a worker panicked while holding it)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl TrackForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            TrackForgeError::InvalidConfiguration(_)
            | TrackForgeError::InvalidInput(_)
            | TrackForgeError::CorruptCompressedData(_) => ErrorCategory::User,

            TrackForgeError::CapacityOverflow { .. } => ErrorCategory::Recoverable,

            TrackForgeError::Memory(err) => {
                if err.is_fatal() {
                    ErrorCategory::Internal
                } else {
                    ErrorCategory::Recoverable
                }
            }

            TrackForgeError::InternalError(_) | TrackForgeError::LockPoisoned(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Recoverable errors only cost the current unit of work
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }

    /// Check if this is a user-facing error (bad settings or input)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Internal errors abort the pass and indicate a programming defect
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// - User: fix the settings or the input
/// - Recoverable: drop the unit of work and continue
/// - Internal: abort the pass, report as bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid input or configuration
    User,
    /// Recoverable error - resource exhaustion for one unit of work
    Recoverable,
    /// Internal error - indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for TrackForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TrackForgeError::LockPoisoned(err.to_string())
    }
}

/// Helper type alias for Results using TrackForgeError
pub type ForgeResult<T> = std::result::Result<T, TrackForgeError>;

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::TrackForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TrackForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create an invalid-input error with context
#[macro_export]
macro_rules! input_error {
    ($msg:expr) => {
        $crate::error::TrackForgeError::InvalidInput($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TrackForgeError::InvalidInput(format!($fmt, $($arg)*))
    };
}

// ========== Kernel Error Sink ==========

/// Codes raised by kernels through an [`ErrorSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    TrackOverflow = 1,
    TrackHitOverflow = 2,
    SliceOutputOverflow = 3,
    MergerTrackOverflow = 4,
    MergerClusterOverflow = 5,
}

impl ErrorCode {
    /// Stable upper-case name, as printed in logs
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::None => "ERROR_NONE",
            ErrorCode::TrackOverflow => "ERROR_TRACK_OVERFLOW",
            ErrorCode::TrackHitOverflow => "ERROR_TRACK_HIT_OVERFLOW",
            ErrorCode::SliceOutputOverflow => "ERROR_SLICE_OUTPUT_OVERFLOW",
            ErrorCode::MergerTrackOverflow => "ERROR_MERGER_TRACK_OVERFLOW",
            ErrorCode::MergerClusterOverflow => "ERROR_MERGER_CLUSTER_OVERFLOW",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One error raised by a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaisedError {
    pub code: ErrorCode,
    pub partition: u32,
    pub observed: u64,
    pub capacity: u64,
}

/// Receiver for errors raised from inside parallel workers
///
/// Must be callable concurrently from many workers; implementations never block
/// for long and never panic.
pub trait ErrorSink: Sync {
    fn raise_error(&self, code: ErrorCode, partition: u32, observed: u64, capacity: u64);
}

/// Bounded error list shared by all kernels of one pass
#[derive(Debug)]
pub struct ErrorRecorder {
    errors: Mutex<Vec<RaisedError>>,
    max_errors: usize,
    dropped: std::sync::atomic::AtomicU64,
}

impl ErrorRecorder {
    /// Default number of errors retained per pass
    pub const DEFAULT_MAX_ERRORS: usize = 1000;

    pub fn new(max_errors: usize) -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
            max_errors,
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Copy of the retained errors
    pub fn errors(&self) -> Vec<RaisedError> {
        match self.errors.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Errors raised after the list was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors().is_empty() || self.dropped() > 0
    }

    /// Take all errors and reset the recorder for the next pass
    pub fn drain(&self) -> Vec<RaisedError> {
        self.dropped.store(0, std::sync::atomic::Ordering::Relaxed);
        match self.errors.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl Default for ErrorRecorder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ERRORS)
    }
}

impl ErrorSink for ErrorRecorder {
    fn raise_error(&self, code: ErrorCode, partition: u32, observed: u64, capacity: u64) {
        tracing::warn!(
            code = code.name(),
            partition,
            observed,
            capacity,
            "kernel raised capacity error"
        );
        let mut guard = match self.errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.len() < self.max_errors {
            guard.push(RaisedError {
                code,
                partition,
                observed,
                capacity,
            });
        } else {
            self.dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_overflow_is_recoverable() {
        let err = TrackForgeError::CapacityOverflow {
            code: ErrorCode::TrackOverflow,
            observed: 11,
            capacity: 10,
        };
        assert_eq!(err.category(), ErrorCategory::Recoverable);
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("ERROR_TRACK_OVERFLOW"));
    }

    #[test]
    fn test_sizing_mismatch_is_internal() {
        let err = TrackForgeError::from(MemoryError::AllocationSizeMismatch {
            resource: "tracks".to_string(),
            reserved: 64,
            requested: 128,
        });
        assert!(err.is_internal_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_user_errors() {
        assert!(TrackForgeError::InvalidConfiguration("x".into()).is_user_error());
        assert!(input_error!("bad row {}", 3).is_user_error());
        assert!(internal_error!("broken").is_internal_error());
    }

    #[test]
    fn test_recorder_bounds_errors() {
        let recorder = ErrorRecorder::new(2);
        for i in 0..5 {
            recorder.raise_error(ErrorCode::TrackHitOverflow, 0, 10 + i, 10);
        }
        assert_eq!(recorder.errors().len(), 2);
        assert_eq!(recorder.dropped(), 3);

        let drained = recorder.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].observed, 10);
        assert!(!recorder.has_errors());
    }
}
