//! Kernel build cache
//!
//! Maps (kernel identity, parameter signature) to a compiled executable with
//! an at-most-once compilation guarantee: for a fixed key the compiler runs
//! at most once for the life of the cache, and every caller observes the
//! same `Arc<KernelExecutable>`.
//!
//! Resolution for an uncached key is serialized per key: the map lock is
//! held only long enough to find or insert the key's entry slot, then the
//! build happens under that entry's own lock. Two threads racing on the same
//! uncached signature therefore produce one compilation — the loser blocks
//! on the entry lock and reuses the winner's executable. Failed builds leave
//! the slot empty so a later call may retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::compiler::KernelCompiler;
use crate::error::Result;
use crate::kernel::{KernelExecutable, KernelIdentity, ParamSignature};
use crate::verbose;

/// Cache key: kernel name + definition id + exact ordered signature
type CacheKey = (String, u64, ParamSignature);

/// Per-key slot; `None` until a build succeeds
type EntrySlot = Arc<Mutex<Option<Arc<KernelExecutable>>>>;

/// Cache observability counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    /// Resolves served from a cached executable
    pub hits: u64,
    /// Resolves that had to invoke the compiler (including failed builds)
    pub misses: u64,
    /// Successful compilations stored in the cache
    pub compilations: u64,
}

/// Single-flight executable cache
pub struct KernelCache {
    compiler: Arc<dyn KernelCompiler>,
    entries: Mutex<HashMap<CacheKey, EntrySlot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
}

impl KernelCache {
    /// Create a cache backed by the given compiler
    #[must_use]
    pub fn new(compiler: Arc<dyn KernelCompiler>) -> Self {
        Self {
            compiler,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
        }
    }

    /// Resolve an executable for the (identity, signature) pair, compiling
    /// it on first use.
    ///
    /// Compiler errors propagate to the caller and are not cached, so a
    /// corrected kernel may be retried under the same key.
    pub fn resolve(
        &self,
        identity: &KernelIdentity,
        signature: &ParamSignature,
    ) -> Result<Arc<KernelExecutable>> {
        let slot = {
            let mut entries = self.entries.lock().expect("cache map poisoned");
            let key = (
                identity.name().to_string(),
                identity.def().id(),
                signature.clone(),
            );
            entries.entry(key).or_default().clone()
        };

        // Per-key serialization: losers of a build race block here and
        // observe the winner's executable.
        let mut entry = slot.lock().expect("cache entry poisoned");
        if let Some(executable) = entry.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(executable.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if verbose() {
            eprintln!(
                "[despachar] cache miss: compiling `{}` for {signature}",
                identity.name()
            );
        }

        let binary = self.compiler.compile(identity, signature)?;
        let executable = Arc::new(KernelExecutable::link(identity.name(), signature, binary));
        *entry = Some(executable.clone());
        self.compilations.fetch_add(1, Ordering::Relaxed);
        Ok(executable)
    }

    /// Number of cached executables (successful builds only)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("cache map poisoned")
            .values()
            .filter(|slot| slot.lock().expect("cache entry poisoned").is_some())
            .count()
    }

    /// Whether no executable has been cached yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cache counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
        }
    }
}
