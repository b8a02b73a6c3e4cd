//! Dispatch construction and the launch facade
//!
//! [`launch`] is the whole pipeline in one call: acquire the context,
//! validate the arguments against the kernel's declared signature, register
//! the buffers, resolve the executable through the build cache, marshal the
//! kernel-argument segment, build and submit the packet, then block on the
//! completion signal.
//!
//! Buffer registrations and the kernarg segment live until the signal is
//! observed. When a timed wait expires the dispatch may still be executing,
//! so those resources are handed to a reaper thread that waits for the
//! signal before releasing them; they are never freed under a running
//! kernel.

use std::thread;
use std::time::Duration;

use crate::context::Context;
use crate::error::{DespacharError, Result};
use crate::kernel::{KernelExecutable, KernelIdentity, ParamSignature};
use crate::marshal::{self, ArgumentBuffer, LaunchArg};
use crate::memory::DevicePtr;
use crate::packet::{
    encode_header, encode_setup, DispatchPacket, FENCE_SCOPE_SYSTEM, PACKET_TYPE_KERNEL_DISPATCH,
};
use crate::signal::Signal;
use crate::verbose;

/// Largest allowed work-items per workgroup (product over all dimensions)
pub const MAX_WORKGROUP_SIZE: u32 = 1024;

/// Grid and workgroup geometry of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    grid: [u32; 3],
    dims: u16,
    workgroup: Option<[u16; 3]>,
}

impl Geometry {
    /// One-dimensional grid of `n` work-items
    #[must_use]
    pub fn linear(n: u32) -> Self {
        Self {
            grid: [n, 1, 1],
            dims: 1,
            workgroup: None,
        }
    }

    /// Two-dimensional grid
    #[must_use]
    pub fn grid_2d(x: u32, y: u32) -> Self {
        Self {
            grid: [x, y, 1],
            dims: 2,
            workgroup: None,
        }
    }

    /// Three-dimensional grid
    #[must_use]
    pub fn grid_3d(x: u32, y: u32, z: u32) -> Self {
        Self {
            grid: [x, y, z],
            dims: 3,
            workgroup: None,
        }
    }

    /// Override the default workgroup shape
    #[must_use]
    pub fn with_workgroup(mut self, workgroup: [u16; 3]) -> Self {
        self.workgroup = Some(workgroup);
        self
    }

    /// Grid extent per dimension
    #[must_use]
    pub fn grid(&self) -> [u32; 3] {
        self.grid
    }

    /// Grid dimensionality (1-3)
    #[must_use]
    pub fn dims(&self) -> u16 {
        self.dims
    }

    /// The workgroup shape this dispatch will use: the explicit override,
    /// or a default sized to the dimensionality and clamped to the grid
    #[must_use]
    pub fn effective_workgroup(&self) -> [u16; 3] {
        if let Some(workgroup) = self.workgroup {
            return workgroup;
        }
        let clamp = |extent: u32, cap: u32| extent.min(cap).max(1) as u16;
        match self.dims {
            1 => [clamp(self.grid[0], 256), 1, 1],
            2 => [clamp(self.grid[0], 16), clamp(self.grid[1], 16), 1],
            _ => [
                clamp(self.grid[0], 8),
                clamp(self.grid[1], 8),
                clamp(self.grid[2], 4),
            ],
        }
    }

    /// Total work-items over the full grid
    #[must_use]
    pub fn total_work_items(&self) -> u64 {
        u64::from(self.grid[0]) * u64::from(self.grid[1]) * u64::from(self.grid[2])
    }

    fn validate(&self) -> Result<()> {
        if self.grid.iter().any(|&extent| extent == 0) {
            return Err(DespacharError::Geometry(format!(
                "grid extents must be non-zero, got {:?}",
                self.grid
            )));
        }
        let workgroup = self.effective_workgroup();
        if workgroup.iter().any(|&extent| extent == 0) {
            return Err(DespacharError::Geometry(format!(
                "workgroup extents must be non-zero, got {workgroup:?}"
            )));
        }
        // widened before multiplying; three u16 extents can overflow u32
        let volume =
            u64::from(workgroup[0]) * u64::from(workgroup[1]) * u64::from(workgroup[2]);
        if volume > u64::from(MAX_WORKGROUP_SIZE) {
            return Err(DespacharError::Geometry(format!(
                "workgroup of {workgroup:?} holds {volume} work-items, limit is {MAX_WORKGROUP_SIZE}"
            )));
        }
        Ok(())
    }
}

/// Per-launch knobs beyond geometry
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchOptions {
    /// Bound the blocking wait; `None` waits until completion
    pub timeout: Option<Duration>,
}

/// Assembles a dispatch packet from an executable, geometry, the marshaled
/// kernarg segment, and a completion signal
#[derive(Debug)]
pub struct DispatchBuilder<'a> {
    executable: &'a KernelExecutable,
    geometry: Geometry,
    kernarg_address: u64,
    completion_signal: u64,
}

impl<'a> DispatchBuilder<'a> {
    /// Start a packet for the given executable and geometry
    #[must_use]
    pub fn new(executable: &'a KernelExecutable, geometry: Geometry) -> Self {
        Self {
            executable,
            geometry,
            kernarg_address: 0,
            completion_signal: 0,
        }
    }

    /// Point the packet at a marshaled kernel-argument segment
    #[must_use]
    pub fn kernarg(mut self, buffer: &ArgumentBuffer) -> Self {
        self.kernarg_address = buffer.device_address();
        self
    }

    /// Attach the completion signal the packet processor will decrement
    #[must_use]
    pub fn completion(mut self, signal: &Signal) -> Self {
        self.completion_signal = signal.handle();
        self
    }

    /// Validate the geometry and produce the 64-byte packet
    pub fn build(self) -> Result<DispatchPacket> {
        self.geometry.validate()?;
        Ok(DispatchPacket {
            header: encode_header(
                PACKET_TYPE_KERNEL_DISPATCH,
                FENCE_SCOPE_SYSTEM,
                FENCE_SCOPE_SYSTEM,
            ),
            setup: encode_setup(self.geometry.dims()),
            workgroup_size: self.geometry.effective_workgroup(),
            grid_size: self.geometry.grid(),
            private_segment_size: self.executable.private_segment_size(),
            group_segment_size: self.executable.group_segment_size(),
            kernel_object: self.executable.kernel_object(),
            kernarg_address: self.kernarg_address,
            completion_signal: self.completion_signal,
            ..DispatchPacket::zeroed()
        })
    }
}

/// Unregisters a launch's buffers when dropped
struct RegistrationGuard {
    context: Context,
    pointers: Vec<DevicePtr>,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if let Err(err) = self.context.registrar().unregister_all(&self.pointers) {
            if verbose() {
                eprintln!("[despachar] unregister at launch teardown failed: {err}");
            }
        }
    }
}

/// Launch a kernel and block until it completes.
///
/// Equivalent to [`launch_with_options`] with default options.
pub fn launch(identity: &KernelIdentity, geometry: Geometry, args: &mut [LaunchArg<'_>]) -> Result<()> {
    launch_with_options(identity, geometry, args, &LaunchOptions::default())
}

/// Launch a kernel with explicit options.
///
/// Validates `args` against the kernel's declared signature, registers the
/// buffers, resolves the executable (compiling on first use), marshals the
/// kernarg segment, submits one dispatch packet, and waits on its signal.
/// Output buffers hold the kernel's results when this returns `Ok`.
///
/// On [`DespacharError::DispatchTimeout`] the dispatch may still be running;
/// its buffers stay registered (and the context stays busy) until the signal
/// fires, at which point a background thread releases them.
pub fn launch_with_options(
    identity: &KernelIdentity,
    geometry: Geometry,
    args: &mut [LaunchArg<'_>],
    options: &LaunchOptions,
) -> Result<()> {
    let context = Context::acquire()?;
    context.ensure_alive()?;

    let declared = ParamSignature::from(identity.def().params());
    precheck(&declared, args)?;
    geometry.validate()?;

    let flight = context.begin_dispatch();

    let pointers = context.registrar().register_all(args)?;
    let registration = RegistrationGuard {
        context: context.clone(),
        pointers,
    };

    let executable = context.resolve(identity, &declared)?;
    let buffer = marshal::marshal(&executable, args, &registration.pointers)?;

    let signal = Signal::new(1);
    let packet = DispatchBuilder::new(&executable, geometry)
        .kernarg(&buffer)
        .completion(&signal)
        .build()?;

    if verbose() {
        eprintln!(
            "[despachar] launching `{}` over {:?} (workgroup {:?})",
            executable.name(),
            geometry.grid(),
            geometry.effective_workgroup()
        );
    }
    context.submit(&packet)?;

    match options.timeout {
        None => {
            signal.wait(0);
            Ok(())
        }
        Some(timeout) => match signal.wait_timeout(0, timeout) {
            Ok(_) => Ok(()),
            Err(err @ DespacharError::DispatchTimeout { .. }) => {
                reap_after_completion(signal, buffer, registration, flight);
                Err(err)
            }
            Err(err) => Err(err),
        },
    }
}

/// Validate argument count and per-position kinds before any side effects
fn precheck(declared: &ParamSignature, args: &[LaunchArg<'_>]) -> Result<()> {
    if args.len() != declared.len() {
        return Err(DespacharError::ArgumentCount {
            declared: declared.len(),
            supplied: args.len(),
        });
    }
    for (index, (arg, &kind)) in args.iter().zip(declared.kinds()).enumerate() {
        if arg.kind() != kind {
            return Err(DespacharError::SignatureMismatch {
                index,
                declared: kind,
                supplied: arg.kind(),
            });
        }
    }
    Ok(())
}

/// Park a timed-out dispatch's resources until its signal fires.
///
/// The kernarg segment and the registrations must outlive the running
/// kernel; the flight guard keeps the context refusing release until then.
fn reap_after_completion(
    signal: Signal,
    buffer: ArgumentBuffer,
    registration: RegistrationGuard,
    flight: crate::context::FlightGuard,
) {
    type Parked = (
        Signal,
        ArgumentBuffer,
        RegistrationGuard,
        crate::context::FlightGuard,
    );
    let parked: std::sync::Arc<std::sync::Mutex<Option<Parked>>> =
        std::sync::Arc::new(std::sync::Mutex::new(Some((
            signal,
            buffer,
            registration,
            flight,
        ))));

    let remote = parked.clone();
    let spawn = thread::Builder::new()
        .name("despachar-reaper".to_string())
        .spawn(move || {
            let taken = remote.lock().expect("reaper parking lock poisoned").take();
            if let Some((signal, buffer, registration, flight)) = taken {
                signal.wait(0);
                drop(buffer);
                drop(registration);
                drop(flight);
            }
        });

    if spawn.is_err() {
        // no reaper thread available; the only safe option left is to
        // block this thread until the dispatch retires
        if verbose() {
            eprintln!("[despachar] reaper spawn failed, waiting inline");
        }
        let taken = parked.lock().expect("reaper parking lock poisoned").take();
        if let Some((signal, buffer, registration, flight)) = taken {
            signal.wait(0);
            drop(buffer);
            drop(registration);
            drop(flight);
        }
    }
}
