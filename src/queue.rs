//! Dispatch queue and packet processor
//!
//! A fixed-capacity ring of 64-byte dispatch packets shared between the host
//! (producer) and the agent's packet processor (consumer). Submission writes
//! the packet into the slot at the write index, publishes with a release
//! fence, then rings the doorbell; the packet processor consumes slots in
//! FIFO order, executes the dispatch over its grid, and decrements the
//! packet's completion signal.
//!
//! The software agent executes dispatches on a worker thread, spreading
//! workgroups across a rayon pool. Submission order is completion order per
//! queue; a full ring blocks the producer until a slot retires.

use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use rayon::prelude::*;
use serde::Serialize;

use crate::compiler::{self, KernelObject};
use crate::error::{DespacharError, Result};
use crate::kernel::{KernargView, WorkPoint};
use crate::packet::{DispatchPacket, PACKET_TYPE_KERNEL_DISPATCH};
use crate::signal;
use crate::verbose;

/// Default ring capacity in packets
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Queue construction parameters
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Ring capacity in packets; must be a power of two
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Queue observability counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    /// Packets accepted into the ring
    pub submitted: u64,
    /// Packets executed to completion
    pub completed: u64,
    /// Packets consumed but not executed (malformed or unknown kernel)
    pub failed: u64,
}

/// Producer/consumer indices plus shutdown flag, all under one lock so the
/// doorbell and space condvars have a single source of truth
#[derive(Debug, Default)]
struct DoorbellState {
    write_index: u64,
    read_index: u64,
    shutdown: bool,
    submitted: u64,
    completed: u64,
    failed: u64,
}

struct RingShared {
    slots: Mutex<Vec<DispatchPacket>>,
    state: Mutex<DoorbellState>,
    /// Rung by the producer after publishing a packet
    doorbell: Condvar,
    /// Rung by the consumer after retiring a packet
    space: Condvar,
    capacity: usize,
}

/// A user-mode dispatch queue bound to one agent.
///
/// Dropping the queue shuts the packet processor down after it drains every
/// packet already submitted.
pub struct Queue {
    shared: Arc<RingShared>,
    worker: Option<JoinHandle<()>>,
}

impl Queue {
    /// Create a queue and start its packet processor.
    ///
    /// # Errors
    ///
    /// [`DespacharError::Geometry`] if the configured capacity is zero or
    /// not a power of two.
    pub fn new(config: &QueueConfig) -> Result<Self> {
        if config.capacity == 0 || !config.capacity.is_power_of_two() {
            return Err(DespacharError::Geometry(format!(
                "queue capacity must be a non-zero power of two, got {}",
                config.capacity
            )));
        }

        let shared = Arc::new(RingShared {
            slots: Mutex::new(vec![DispatchPacket::zeroed(); config.capacity]),
            state: Mutex::new(DoorbellState::default()),
            doorbell: Condvar::new(),
            space: Condvar::new(),
            capacity: config.capacity,
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("despachar-packet-processor".to_string())
            .spawn(move || packet_processor(&worker_shared))
            .map_err(|e| DespacharError::Memory(format!("failed to spawn packet processor: {e}")))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Ring capacity in packets
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Write a packet into the next ring slot and ring the doorbell.
    ///
    /// Blocks while the ring is full. The packet is consumed asynchronously;
    /// completion is observed through the packet's signal, never through
    /// this call returning.
    pub fn submit(&self, packet: &DispatchPacket) -> Result<()> {
        let mut state = self.shared.state.lock().expect("queue state poisoned");
        if state.shutdown {
            return Err(DespacharError::NoActiveContext);
        }
        while state.write_index - state.read_index >= self.shared.capacity as u64 {
            state = self
                .shared
                .space
                .wait(state)
                .expect("queue state poisoned");
            if state.shutdown {
                return Err(DespacharError::NoActiveContext);
            }
        }

        let slot = (state.write_index % self.shared.capacity as u64) as usize;
        {
            let mut slots = self.shared.slots.lock().expect("queue ring poisoned");
            slots[slot] = *packet;
        }
        // publish the packet body before the doorbell advances
        fence(Ordering::Release);
        state.write_index += 1;
        state.submitted += 1;
        if verbose() {
            eprintln!(
                "[despachar] submit: slot {slot}, write_index {}",
                state.write_index
            );
        }
        self.shared.doorbell.notify_one();
        Ok(())
    }

    /// Snapshot of the queue counters
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock().expect("queue state poisoned");
        QueueStats {
            submitted: state.submitted,
            completed: state.completed,
            failed: state.failed,
        }
    }

    /// Packets submitted but not yet retired
    #[must_use]
    pub fn pending(&self) -> usize {
        let state = self.shared.state.lock().expect("queue state poisoned");
        (state.write_index - state.read_index) as usize
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("queue state poisoned");
            state.shutdown = true;
            self.shared.doorbell.notify_all();
            self.shared.space.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            // the processor drains submitted packets before exiting
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.shared.capacity)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Consumer loop: pop packets in FIFO order until shutdown, draining any
/// packets that were already in the ring
fn packet_processor(shared: &RingShared) {
    loop {
        let packet = {
            let mut state = shared.state.lock().expect("queue state poisoned");
            loop {
                if state.read_index < state.write_index {
                    break;
                }
                if state.shutdown {
                    return;
                }
                state = shared.doorbell.wait(state).expect("queue state poisoned");
            }
            let slot = (state.read_index % shared.capacity as u64) as usize;
            let packet = {
                let slots = shared.slots.lock().expect("queue ring poisoned");
                slots[slot]
            };
            // pair with the producer's release fence
            fence(Ordering::Acquire);
            packet
        };

        let executed = execute_packet(&packet);

        let mut state = shared.state.lock().expect("queue state poisoned");
        state.read_index += 1;
        if executed {
            state.completed += 1;
        } else {
            state.failed += 1;
        }
        shared.space.notify_all();
        drop(state);

        // the signal fires whether or not execution succeeded, so a waiter
        // never hangs on a malformed packet
        if let Some(signal) = signal::lookup(packet.completion_signal) {
            signal.subtract(1);
        }
    }
}

/// Execute one dispatch packet over its full grid. Returns false for
/// packets the processor cannot run.
fn execute_packet(packet: &DispatchPacket) -> bool {
    if packet.packet_type() != PACKET_TYPE_KERNEL_DISPATCH {
        if verbose() {
            eprintln!(
                "[despachar] dropping packet of type {}",
                packet.packet_type()
            );
        }
        return false;
    }

    let Some(object) = compiler::kernel_object(packet.kernel_object) else {
        if verbose() {
            eprintln!(
                "[despachar] unknown kernel object {:#x}",
                packet.kernel_object
            );
        }
        return false;
    };

    let grid = packet.grid_size;
    if grid.iter().any(|&extent| extent == 0) {
        return false;
    }
    let workgroup = [
        u32::from(packet.workgroup_size[0]).max(1),
        u32::from(packet.workgroup_size[1]).max(1),
        u32::from(packet.workgroup_size[2]).max(1),
    ];

    // SAFETY: the kernarg segment was marshaled for this kernel object's
    // layout and the launch path keeps it alive until the completion signal
    // fires, which happens strictly after this function returns
    let view = unsafe { KernargView::decode(&object.layout, packet.kernarg_address as *const u8) };

    run_grid(&object, &view, grid, workgroup);
    true
}

/// Iterate every workgroup of the grid in parallel, then every work-item of
/// the group sequentially, skipping the out-of-grid tail of partial groups
fn run_grid(object: &KernelObject, view: &KernargView, grid: [u32; 3], workgroup: [u32; 3]) {
    let groups = [
        grid[0].div_ceil(workgroup[0]),
        grid[1].div_ceil(workgroup[1]),
        grid[2].div_ceil(workgroup[2]),
    ];
    let total_groups = u64::from(groups[0]) * u64::from(groups[1]) * u64::from(groups[2]);

    (0..total_groups).into_par_iter().for_each(|linear| {
        let gx = (linear % u64::from(groups[0])) as u32;
        let gy = ((linear / u64::from(groups[0])) % u64::from(groups[1])) as u32;
        let gz = (linear / (u64::from(groups[0]) * u64::from(groups[1]))) as u32;
        let group = [gx, gy, gz];

        for lz in 0..workgroup[2] {
            for ly in 0..workgroup[1] {
                for lx in 0..workgroup[0] {
                    let global = [
                        gx * workgroup[0] + lx,
                        gy * workgroup[1] + ly,
                        gz * workgroup[2] + lz,
                    ];
                    // partial groups at the grid edge
                    if global[0] >= grid[0] || global[1] >= grid[1] || global[2] >= grid[2] {
                        continue;
                    }
                    let point = WorkPoint {
                        global,
                        local: [lx, ly, lz],
                        group,
                        grid,
                    };
                    object.body.execute(view, &point);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::register_kernel_object;
    use crate::kernel::{kernarg_layout, KernelBody, ParamKind, ParamSignature};
    use crate::packet::{encode_header, encode_setup, FENCE_SCOPE_SYSTEM};
    use crate::signal::Signal;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    fn dispatch_packet(
        kernel_object: u64,
        kernarg_address: u64,
        grid: [u32; 3],
        workgroup: [u16; 3],
        signal: &Signal,
    ) -> DispatchPacket {
        DispatchPacket {
            header: encode_header(
                PACKET_TYPE_KERNEL_DISPATCH,
                FENCE_SCOPE_SYSTEM,
                FENCE_SCOPE_SYSTEM,
            ),
            setup: encode_setup(1),
            workgroup_size: workgroup,
            grid_size: grid,
            kernel_object,
            kernarg_address,
            completion_signal: signal.handle(),
            ..DispatchPacket::zeroed()
        }
    }

    #[test]
    fn test_capacity_must_be_power_of_two() {
        assert!(Queue::new(&QueueConfig { capacity: 48 }).is_err());
        assert!(Queue::new(&QueueConfig { capacity: 0 }).is_err());
        let queue = Queue::new(&QueueConfig { capacity: 8 }).expect("valid capacity");
        assert_eq!(queue.capacity(), 8);
    }

    #[test]
    fn test_dispatch_executes_every_work_item_once() {
        let sig = ParamSignature::new(vec![ParamKind::PtrU32, ParamKind::U32]);
        let (layout, size, _) = kernarg_layout(&sig);

        let body: Arc<dyn KernelBody> = Arc::new(|args: &KernargView, point: &WorkPoint| {
            let n = args.u32(1) as usize;
            let i = point.global_linear();
            if i < n {
                // SAFETY: i < n, the buffer holds n elements
                unsafe {
                    *args.ptr_u32(0).add(i) += 1;
                }
            }
        });
        let object = register_kernel_object(body, layout.clone());

        let mut data = vec![0u32; 100];
        let mut segment = vec![0u8; size];
        segment[layout[0].offset..layout[0].offset + 8]
            .copy_from_slice(&(data.as_mut_ptr() as u64).to_ne_bytes());
        segment[layout[1].offset..layout[1].offset + 4]
            .copy_from_slice(&100u32.to_ne_bytes());

        let queue = Queue::new(&QueueConfig::default()).expect("queue");
        let signal = Signal::new(1);
        // workgroup of 32 over 100 items: the last group is partial
        let packet = dispatch_packet(
            object,
            segment.as_ptr() as u64,
            [100, 1, 1],
            [32, 1, 1],
            &signal,
        );
        queue.submit(&packet).expect("submit");
        signal.wait(0);

        assert!(data.iter().all(|&v| v == 1), "each item exactly once");
        let stats = queue.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);

        crate::compiler::deregister_kernel_object(object);
    }

    #[test]
    fn test_unknown_kernel_object_fails_but_signals() {
        let queue = Queue::new(&QueueConfig::default()).expect("queue");
        let signal = Signal::new(1);
        let packet = dispatch_packet(u64::MAX, 0, [1, 1, 1], [1, 1, 1], &signal);

        queue.submit(&packet).expect("submit");
        // the waiter must not hang on a malformed packet
        signal
            .wait_timeout(0, Duration::from_secs(5))
            .expect("signal fires even on failure");
        assert_eq!(queue.stats().failed, 1);
    }

    #[test]
    fn test_submissions_complete_in_fifo_order() {
        let sig = ParamSignature::new(vec![ParamKind::PtrU32]);
        let (layout, size, _) = kernarg_layout(&sig);

        // each dispatch appends its observation; order must match submission
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        SEEN.store(0, AtomicOrdering::SeqCst);

        let body: Arc<dyn KernelBody> = Arc::new(|args: &KernargView, _: &WorkPoint| {
            let order = SEEN.fetch_add(1, AtomicOrdering::SeqCst);
            // SAFETY: single work-item per dispatch, exclusive slot
            unsafe {
                *args.ptr_u32(0) = order as u32;
            }
        });
        let object = register_kernel_object(body, layout.clone());

        let queue = Queue::new(&QueueConfig { capacity: 4 }).expect("queue");
        let mut results = vec![u32::MAX; 8];
        let mut segments = Vec::new();
        let signal = Signal::new(8);

        for slot in &mut results {
            let mut segment = vec![0u8; size];
            segment[layout[0].offset..layout[0].offset + 8]
                .copy_from_slice(&(std::ptr::from_mut(slot) as u64).to_ne_bytes());
            segments.push(segment);
        }
        for segment in &segments {
            // more submissions than capacity: the producer must block and
            // resume as slots retire, preserving order
            let packet =
                dispatch_packet(object, segment.as_ptr() as u64, [1, 1, 1], [1, 1, 1], &signal);
            queue.submit(&packet).expect("submit");
        }
        signal.wait(0);

        let expected: Vec<u32> = (0..8).collect();
        assert_eq!(results, expected, "FIFO completion order");

        crate::compiler::deregister_kernel_object(object);
    }

    #[test]
    fn test_drop_drains_pending_packets() {
        let sig = ParamSignature::new(vec![ParamKind::PtrU32]);
        let (layout, size, _) = kernarg_layout(&sig);

        let body: Arc<dyn KernelBody> = Arc::new(|args: &KernargView, _: &WorkPoint| {
            // SAFETY: exclusive single-item buffer
            unsafe {
                *args.ptr_u32(0) += 1;
            }
        });
        let object = register_kernel_object(body, layout.clone());

        let mut value = 0u32;
        let mut segment = vec![0u8; size];
        segment[layout[0].offset..layout[0].offset + 8]
            .copy_from_slice(&(std::ptr::from_mut(&mut value) as u64).to_ne_bytes());

        let signal = Signal::new(3);
        {
            let queue = Queue::new(&QueueConfig::default()).expect("queue");
            for _ in 0..3 {
                let packet = dispatch_packet(
                    object,
                    segment.as_ptr() as u64,
                    [1, 1, 1],
                    [1, 1, 1],
                    &signal,
                );
                queue.submit(&packet).expect("submit");
            }
            // drop with packets possibly still in flight
        }
        assert_eq!(signal.value(), 0, "drop must drain, not abandon, the ring");
        assert_eq!(value, 3);

        crate::compiler::deregister_kernel_object(object);
    }

    #[test]
    fn test_stats_serialize() {
        let queue = Queue::new(&QueueConfig::default()).expect("queue");
        let json = serde_json::to_string(&queue.stats()).expect("serialize");
        assert!(json.contains("\"submitted\":0"), "got: {json}");
    }
}
