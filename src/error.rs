//! Error types for the dispatch runtime
//!
//! One crate-wide error enum covering the five failure classes the runtime
//! can surface: context lifecycle, kernel compilation, signature validation,
//! memory registration, and dispatch timeout. All failures propagate to the
//! immediate caller; the runtime never retries on its own.

use crate::kernel::ParamKind;
use thiserror::Error;

/// Error type for all dispatch runtime operations
#[derive(Debug, Error)]
pub enum DespacharError {
    /// An operation required an active runtime context but none exists
    /// (never initialized, or already released)
    #[error("no active runtime context")]
    NoActiveContext,

    /// `Context::initialize` was called while a default context is active
    #[error("a default runtime context is already active")]
    AlreadyInitialized,

    /// Context teardown was requested while work is still outstanding.
    /// Dispatches must be waited on and buffers unregistered first.
    #[error(
        "context released with outstanding work: {in_flight} in-flight dispatch(es), \
         {registrations} live registration(s)"
    )]
    ContextBusy {
        /// Dispatches submitted but not yet completed/released
        in_flight: usize,
        /// Memory registrations not yet unregistered
        registrations: usize,
    },

    /// The device compiler rejected a kernel/signature pair. The cache entry
    /// is not created, so a corrected kernel may be retried.
    #[error("kernel `{kernel}` failed to compile: {reason}")]
    Compile {
        /// Kernel name as registered with the cache
        kernel: String,
        /// Compiler-reported reason
        reason: String,
    },

    /// The caller supplied a different number of arguments than the
    /// executable declares
    #[error("argument count mismatch: kernel declares {declared}, caller supplied {supplied}")]
    ArgumentCount {
        /// Parameter count declared by the executable
        declared: usize,
        /// Argument count supplied by the caller
        supplied: usize,
    },

    /// An argument's kind does not match the executable's declared parameter
    /// kind at the same position. Detected before any device interaction.
    #[error("argument {index} kind mismatch: declared {declared}, supplied {supplied}")]
    SignatureMismatch {
        /// Zero-based parameter position
        index: usize,
        /// Kind declared by the executable
        declared: ParamKind,
        /// Kind the caller supplied
        supplied: ParamKind,
    },

    /// Registration or argument-buffer allocation failure. Partially
    /// registered buffers from the same call are unwound before this is
    /// returned.
    #[error("memory error: {0}")]
    Memory(String),

    /// A signal wait exceeded the caller-specified deadline. Non-fatal: the
    /// device-side work is not guaranteed to have stopped, so buffers tied
    /// to the dispatch are handed to a deferred reaper instead of freed.
    #[error("dispatch wait timed out after {waited_ms} ms")]
    DispatchTimeout {
        /// Milliseconds waited before giving up
        waited_ms: u64,
    },

    /// Launch geometry the queue cannot express (zero extents, too many
    /// dimensions, oversized workgroup)
    #[error("invalid launch geometry: {0}")]
    Geometry(String),
}

/// Result type alias for dispatch runtime operations
pub type Result<T> = std::result::Result<T, DespacharError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_values() {
        let err = DespacharError::ContextBusy {
            in_flight: 2,
            registrations: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("2 in-flight"), "got: {msg}");
        assert!(msg.contains("3 live registration"), "got: {msg}");

        let err = DespacharError::Compile {
            kernel: "vector_add_f32".to_string(),
            reason: "signature arity".to_string(),
        };
        assert!(err.to_string().contains("vector_add_f32"));

        let err = DespacharError::DispatchTimeout { waited_ms: 250 };
        assert!(err.to_string().contains("250 ms"));
    }

    #[test]
    fn test_signature_mismatch_display() {
        let err = DespacharError::SignatureMismatch {
            index: 1,
            declared: ParamKind::PtrF32,
            supplied: ParamKind::F32,
        };
        let msg = err.to_string();
        assert!(msg.contains("argument 1"), "got: {msg}");
        assert!(msg.contains("ptr<f32>"), "got: {msg}");
    }
}
