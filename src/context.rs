//! Runtime context lifecycle
//!
//! The context owns everything a dispatch needs: the selected agent, its
//! dispatch queue, the kernel build cache, and the memory registrar. One
//! context is active per process at a time; [`Context::acquire`] initializes
//! a default context on first use and hands out cheap clones afterwards.
//!
//! Release is refused while work is outstanding: in-flight dispatches or
//! live memory registrations keep the context alive, so device work never
//! runs against torn-down state. Releasing drops the queue, which drains
//! already-submitted packets before the call returns.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{CacheStats, KernelCache};
use crate::compiler::HostCompiler;
use crate::error::{DespacharError, Result};
use crate::kernel::{KernelExecutable, KernelIdentity, ParamSignature};
use crate::memory::MemoryRegistrar;
use crate::packet::DispatchPacket;
use crate::queue::{Queue, QueueConfig, QueueStats};
use crate::verbose;

/// A compute agent the runtime can dispatch to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    id: u32,
    name: String,
}

impl Agent {
    /// Agent id (stable for the process lifetime)
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Human-readable agent name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (agent {})", self.name, self.id)
    }
}

/// Enumerate agents and pick the first dispatch-capable one.
///
/// The software agent is always present, so selection cannot fail.
#[must_use]
pub fn select_default_agent() -> Agent {
    Agent {
        id: 0,
        name: "despachar software agent".to_string(),
    }
}

/// Context construction parameters
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// Queue parameters for the context's dispatch queue
    pub queue: QueueConfig,
}

struct ContextInner {
    agent: Agent,
    queue: Mutex<Option<Queue>>,
    cache: KernelCache,
    registrar: MemoryRegistrar,
    in_flight: AtomicUsize,
    alive: AtomicBool,
}

static ACTIVE: Mutex<Option<Context>> = Mutex::new(None);

/// Handle to the process's active runtime context.
///
/// Clones share the same underlying state; the context stays active until
/// [`Context::release`] succeeds.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Initialize a new active context with explicit configuration.
    ///
    /// # Errors
    ///
    /// [`DespacharError::AlreadyInitialized`] if a context is already
    /// active; release it first.
    pub fn initialize(config: &ContextConfig) -> Result<Self> {
        let mut active = ACTIVE.lock().expect("active context lock poisoned");
        if active.is_some() {
            return Err(DespacharError::AlreadyInitialized);
        }

        let agent = select_default_agent();
        if verbose() {
            eprintln!("[despachar] initializing context on {agent}");
        }
        let context = Self {
            inner: Arc::new(ContextInner {
                agent,
                queue: Mutex::new(Some(Queue::new(&config.queue)?)),
                cache: KernelCache::new(Arc::new(HostCompiler::new())),
                registrar: MemoryRegistrar::new(),
                in_flight: AtomicUsize::new(0),
                alive: AtomicBool::new(true),
            }),
        };
        *active = Some(context.clone());
        Ok(context)
    }

    /// The active context, initializing a default one on first use.
    ///
    /// Idempotent: every caller observes the same context until it is
    /// released.
    pub fn acquire() -> Result<Self> {
        {
            let active = ACTIVE.lock().expect("active context lock poisoned");
            if let Some(context) = active.as_ref() {
                return Ok(context.clone());
            }
        }
        match Self::initialize(&ContextConfig::default()) {
            // lost the initialization race; take the winner's context
            Err(DespacharError::AlreadyInitialized) => Self::acquire(),
            other => other,
        }
    }

    /// Tear the active context down.
    ///
    /// Refused while dispatches are in flight or buffer registrations are
    /// outstanding; callers must observe their completion signals first.
    /// On success the queue is dropped, draining any packets already in the
    /// ring.
    pub fn release(self) -> Result<()> {
        let mut active = ACTIVE.lock().expect("active context lock poisoned");

        let in_flight = self.inner.in_flight.load(Ordering::SeqCst);
        let registrations = self.inner.registrar.outstanding();
        if in_flight > 0 || registrations > 0 {
            return Err(DespacharError::ContextBusy {
                in_flight,
                registrations,
            });
        }

        self.inner.alive.store(false, Ordering::SeqCst);
        let queue = self
            .inner
            .queue
            .lock()
            .expect("context queue lock poisoned")
            .take();
        // drain before the handle table entry disappears
        drop(queue);

        if let Some(current) = active.as_ref() {
            if Arc::ptr_eq(&current.inner, &self.inner) {
                *active = None;
            }
        }
        if verbose() {
            eprintln!("[despachar] context released");
        }
        Ok(())
    }

    /// The agent this context dispatches to
    #[must_use]
    pub fn agent(&self) -> &Agent {
        &self.inner.agent
    }

    /// Resolve a kernel executable through the context's build cache
    pub fn resolve(
        &self,
        identity: &KernelIdentity,
        signature: &ParamSignature,
    ) -> Result<Arc<KernelExecutable>> {
        self.ensure_alive()?;
        self.inner.cache.resolve(identity, signature)
    }

    /// The context's memory registrar
    #[must_use]
    pub fn registrar(&self) -> &MemoryRegistrar {
        &self.inner.registrar
    }

    /// Submit a dispatch packet to the context's queue
    pub fn submit(&self, packet: &DispatchPacket) -> Result<()> {
        let queue = self
            .inner
            .queue
            .lock()
            .expect("context queue lock poisoned");
        match queue.as_ref() {
            Some(queue) => queue.submit(packet),
            None => Err(DespacharError::NoActiveContext),
        }
    }

    /// Build-cache counters
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Queue counters; zeroed after release
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.inner
            .queue
            .lock()
            .expect("context queue lock poisoned")
            .as_ref()
            .map(Queue::stats)
            .unwrap_or_default()
    }

    /// Dispatches submitted but not yet signaled complete
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.inner.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DespacharError::NoActiveContext)
        }
    }

    pub(crate) fn begin_dispatch(&self) -> FlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        FlightGuard {
            context: self.clone(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("agent", &self.inner.agent)
            .field("in_flight", &self.in_flight())
            .field("alive", &self.inner.alive.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Scoped in-flight marker; a dispatch counts against release from
/// submission until its completion signal is observed
pub(crate) struct FlightGuard {
    context: Context,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.context.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
