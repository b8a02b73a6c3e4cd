//! # Despachar
//!
//! Host-side kernel dispatch runtime with a user-mode packet queue.
//!
//! Despachar (Spanish: "to dispatch") drives compute kernels the way a
//! user-mode GPU queue does: kernels are compiled once through a build
//! cache, arguments are marshaled into a binary kernel-argument segment,
//! and each launch becomes a 64-byte dispatch packet submitted to a ring
//! and consumed asynchronously by an agent. Completion is observed through
//! counting signals, never through the submission call.
//!
//! The built-in agent is a software packet processor that executes
//! dispatches over the full grid on a thread pool, so the whole pipeline
//! runs (and is tested) without device hardware.
//!
//! ## Example
//!
//! ```rust
//! use despachar::{kernels, launch, Geometry, LaunchArg};
//!
//! let a = vec![1.0f32; 100];
//! let b = vec![2.0f32; 100];
//! let mut out = vec![0.0f32; 100];
//!
//! launch(
//!     &kernels::vector_add_f32(),
//!     Geometry::linear(100),
//!     &mut [
//!         LaunchArg::InF32(&a),
//!         LaunchArg::InF32(&b),
//!         LaunchArg::OutF32(&mut out),
//!         LaunchArg::U32(100),
//!     ],
//! )
//! .unwrap();
//!
//! assert!(out.iter().all(|&v| (v - 3.0).abs() < 1e-6));
//! ```
//!
//! ## Pipeline
//!
//! One launch walks the full path:
//! 1. acquire the process context ([`Context`])
//! 2. register host buffers with the memory registrar (best-effort pinning)
//! 3. resolve the executable through the build cache (at-most-once compile)
//! 4. marshal arguments into the kernel-argument segment
//! 5. build the dispatch packet and ring the queue doorbell
//! 6. block on the completion signal

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)] // index/extent narrowing is checked at the call sites
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)] // lock poisoning panics only
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::float_cmp)] // float comparisons in tests

pub mod cache;
pub mod compiler;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod kernels;
pub mod marshal;
pub mod memory;
pub mod packet;
pub mod queue;
pub mod signal;

pub use cache::{CacheStats, KernelCache};
pub use compiler::{CompiledBinary, HostCompiler, KernelCompiler};
pub use context::{select_default_agent, Agent, Context, ContextConfig};
pub use dispatch::{
    launch, launch_with_options, DispatchBuilder, Geometry, LaunchOptions, MAX_WORKGROUP_SIZE,
};
pub use error::{DespacharError, Result};
pub use kernel::{
    kernarg_layout, KernargView, KernelBody, KernelDef, KernelExecutable, KernelIdentity,
    ParamKind, ParamLayout, ParamSignature, WorkPoint, KERNARG_MIN_ALIGN,
};
pub use marshal::{marshal, ArgumentBuffer, LaunchArg};
pub use memory::{DevicePtr, MemoryRegistrar};
pub use packet::{DispatchPacket, PACKET_TYPE_KERNEL_DISPATCH};
pub use queue::{Queue, QueueConfig, QueueStats, DEFAULT_QUEUE_CAPACITY};
pub use signal::Signal;

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Whether diagnostic logging is enabled (`DESPACHAR_VERBOSE=1`)
pub(crate) fn verbose() -> bool {
    use std::sync::OnceLock;
    static VERBOSE: OnceLock<bool> = OnceLock::new();
    *VERBOSE.get_or_init(|| {
        std::env::var("DESPACHAR_VERBOSE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}
