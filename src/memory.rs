//! Host memory registration
//!
//! Before a dispatch touches host-resident arrays, the registrar makes them
//! agent-accessible: each buffer is pinned (best-effort `mlock`, so the
//! pages cannot be swapped out under the agent) and recorded in a
//! registration table keyed by address. The agent uses unified addressing,
//! so the device pointer handed back for a buffer is its host address.
//!
//! Registrations are per-dispatch: created before submission, destroyed
//! after the completion signal is observed, and never allowed to outlive
//! the context that issued them. Registering the same buffer twice without
//! an intervening unregister is a caller error.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{DespacharError, Result};
use crate::marshal::LaunchArg;
use crate::verbose;

/// Device-visible address of a registered buffer.
///
/// Null for argument slots that are not device memory (inline scalars).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// The null device pointer (scalar slot, no registration)
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Wrap a raw device address
    #[must_use]
    pub(crate) fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw device address
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.0
    }

    /// Whether this slot carries no device memory
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Outcome of pinning one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinState {
    /// Pages locked in physical memory
    Pinned,
    /// Lock refused (privileges/limits) or unsupported platform; the
    /// registration still stands, the agent just tolerates paging
    Unpinned,
}

#[derive(Debug)]
struct RegistrationEntry {
    len: usize,
    pin: PinState,
}

/// Pins/unpins host memory regions and tracks registration lifetime
#[derive(Debug, Default)]
pub struct MemoryRegistrar {
    table: Mutex<HashMap<u64, RegistrationEntry>>,
}

impl MemoryRegistrar {
    /// Create an empty registrar
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every buffer argument for agent access.
    ///
    /// Returns one [`DevicePtr`] per input argument, in input order; scalar
    /// arguments pass through with a null slot. If any buffer fails to
    /// register, buffers already registered by this call are unwound before
    /// the error propagates.
    ///
    /// Precondition: no buffer in `args` is currently registered. A repeat
    /// registration is reported as [`DespacharError::Memory`].
    pub fn register_all(&self, args: &[LaunchArg<'_>]) -> Result<Vec<DevicePtr>> {
        let mut pointers = Vec::with_capacity(args.len());
        let mut registered: Vec<DevicePtr> = Vec::new();

        for arg in args {
            let Some((addr, len)) = arg.buffer_region() else {
                pointers.push(DevicePtr::NULL);
                continue;
            };

            match self.register(addr, len) {
                Ok(ptr) => {
                    pointers.push(ptr);
                    registered.push(ptr);
                }
                Err(err) => {
                    // unwind partial registrations from this call
                    self.unregister_all(&registered)?;
                    return Err(err);
                }
            }
        }

        Ok(pointers)
    }

    /// Reverse [`Self::register_all`] for the returned pointers.
    ///
    /// Null slots are skipped. Unregistering an address that is not in the
    /// table is a caller error.
    pub fn unregister_all(&self, pointers: &[DevicePtr]) -> Result<()> {
        for ptr in pointers {
            if ptr.is_null() {
                continue;
            }
            self.unregister(*ptr)?;
        }
        Ok(())
    }

    /// Number of live registrations
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.table.lock().expect("registration table poisoned").len()
    }

    fn register(&self, addr: u64, len: usize) -> Result<DevicePtr> {
        if addr == 0 {
            return Err(DespacharError::Memory(
                "cannot register a null host pointer".to_string(),
            ));
        }

        let mut table = self.table.lock().expect("registration table poisoned");
        if table.contains_key(&addr) {
            return Err(DespacharError::Memory(format!(
                "buffer at {addr:#x} is already registered"
            )));
        }

        let pin = mlock_region(addr as *const u8, len);
        if pin == PinState::Unpinned && verbose() {
            eprintln!(
                "[despachar] mlock unavailable for {addr:#x} ({len} bytes), registering unpinned"
            );
        }
        table.insert(addr, RegistrationEntry { len, pin });
        Ok(DevicePtr::new(addr))
    }

    fn unregister(&self, ptr: DevicePtr) -> Result<()> {
        let mut table = self.table.lock().expect("registration table poisoned");
        let Some(entry) = table.remove(&ptr.addr()) else {
            return Err(DespacharError::Memory(format!(
                "buffer at {:#x} is not registered",
                ptr.addr()
            )));
        };

        if entry.pin == PinState::Pinned {
            munlock_region(ptr.addr() as *const u8, entry.len);
        }
        Ok(())
    }
}

#[cfg(target_family = "unix")]
fn mlock_region(ptr: *const u8, len: usize) -> PinState {
    if len == 0 {
        return PinState::Unpinned;
    }
    // SAFETY: ptr/len describe a live slice borrowed by the caller of
    // register_all; mlock touches page tables, not the memory contents
    let result = unsafe { libc::mlock(ptr.cast(), len) };
    if result == 0 {
        PinState::Pinned
    } else {
        PinState::Unpinned
    }
}

#[cfg(not(target_family = "unix"))]
fn mlock_region(_ptr: *const u8, _len: usize) -> PinState {
    PinState::Unpinned
}

#[cfg(target_family = "unix")]
fn munlock_region(ptr: *const u8, len: usize) {
    // SAFETY: same region that was locked at registration
    unsafe {
        libc::munlock(ptr.cast(), len);
    }
}

#[cfg(not(target_family = "unix"))]
fn munlock_region(_ptr: *const u8, _len: usize) {}
