//! Kernel compiler seam and kernel-object table
//!
//! The runtime treats device code generation as an opaque, possibly slow
//! function behind the [`KernelCompiler`] trait: given a kernel identity and
//! a parameter signature it either produces a [`CompiledBinary`] or a
//! compile error. The built-in [`HostCompiler`] is the software toolchain
//! for the in-process agent; a vendor toolchain would implement the same
//! trait.
//!
//! Linked executables are published in a process-wide kernel-object table so
//! dispatch packets can reference them by plain `u64` handle, mirroring how
//! a kernel object on real hardware is just an address in executable memory.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{DespacharError, Result};
use crate::kernel::{KernelBody, KernelIdentity, ParamLayout, ParamSignature};

/// Result of compiling one (identity, signature) pair: the executable entry
/// plus the metadata the dispatch packet needs
pub struct CompiledBinary {
    /// Entry point invoked per work-item
    pub body: Arc<dyn KernelBody>,
    /// Group (workgroup-local) memory requirement in bytes
    pub group_segment_size: u32,
    /// Private (per-work-item) memory requirement in bytes
    pub private_segment_size: u32,
}

impl fmt::Debug for CompiledBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledBinary")
            .field("group_segment_size", &self.group_segment_size)
            .field("private_segment_size", &self.private_segment_size)
            .finish_non_exhaustive()
    }
}

/// External device-code compiler.
///
/// Pure from the runtime's point of view: same inputs produce an equivalent
/// binary, and errors are surfaced without the pair being cached.
pub trait KernelCompiler: Send + Sync {
    /// Compile a kernel for the given parameter signature
    fn compile(&self, identity: &KernelIdentity, signature: &ParamSignature)
        -> Result<CompiledBinary>;
}

/// Built-in software toolchain for the in-process agent.
///
/// Validates the requested signature against the definition's declared
/// parameters and hands the definition body through unchanged. Tracks how
/// many times it was invoked so at-most-once compilation is observable.
#[derive(Debug, Default)]
pub struct HostCompiler {
    invocations: AtomicUsize,
}

impl HostCompiler {
    /// Create a fresh compiler with a zeroed invocation counter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of compile invocations so far (successful or not)
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl KernelCompiler for HostCompiler {
    fn compile(
        &self,
        identity: &KernelIdentity,
        signature: &ParamSignature,
    ) -> Result<CompiledBinary> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        if identity.def().params() != signature.kinds() {
            return Err(DespacharError::Compile {
                kernel: identity.name().to_string(),
                reason: format!(
                    "definition declares {}, requested signature is {}",
                    ParamSignature::from(identity.def().params()),
                    signature
                ),
            });
        }

        Ok(CompiledBinary {
            body: identity.def().body().clone(),
            group_segment_size: 0,
            private_segment_size: 0,
        })
    }
}

/// A published kernel object: what the packet processor resolves a
/// `kernel_object` handle into
pub(crate) struct KernelObject {
    pub(crate) body: Arc<dyn KernelBody>,
    pub(crate) layout: Vec<ParamLayout>,
}

static NEXT_KERNEL_OBJECT: AtomicU64 = AtomicU64::new(1);

fn objects() -> &'static Mutex<HashMap<u64, Arc<KernelObject>>> {
    static OBJECTS: OnceLock<Mutex<HashMap<u64, Arc<KernelObject>>>> = OnceLock::new();
    OBJECTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Publish a compiled body + kernarg layout; returns the packet-visible handle
pub(crate) fn register_kernel_object(body: Arc<dyn KernelBody>, layout: Vec<ParamLayout>) -> u64 {
    let handle = NEXT_KERNEL_OBJECT.fetch_add(1, Ordering::Relaxed);
    objects()
        .lock()
        .expect("kernel-object table poisoned")
        .insert(handle, Arc::new(KernelObject { body, layout }));
    handle
}

/// Remove a kernel object; called when its executable is dropped
pub(crate) fn deregister_kernel_object(handle: u64) {
    objects()
        .lock()
        .expect("kernel-object table poisoned")
        .remove(&handle);
}

/// Resolve a handle carried by a dispatch packet
pub(crate) fn kernel_object(handle: u64) -> Option<Arc<KernelObject>> {
    objects()
        .lock()
        .expect("kernel-object table poisoned")
        .get(&handle)
        .cloned()
}
