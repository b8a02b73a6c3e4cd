//! Kernel identity, parameter signatures, and compiled executables
//!
//! A kernel is identified by a stable name plus a definition reference; the
//! cache key is (identity, ordered parameter signature). Compiling a kernel
//! produces a [`KernelExecutable`]: an opaque kernel-object handle plus the
//! metadata the marshaler and the packet processor need — the kernel-argument
//! segment layout (offset per parameter, natural alignment, declaration
//! order) and the group/private segment sizes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Minimum kernel-argument segment alignment, in bytes.
///
/// Matches the target queue's requirement that the kernarg segment be
/// 16-byte aligned regardless of the parameters it holds.
pub const KERNARG_MIN_ALIGN: usize = 16;

/// Parameter kind: the tagged-variant type tag checked against an
/// executable's declared signature before marshaling.
///
/// Pointer kinds receive a device address from the memory registrar; scalar
/// kinds are written inline at the kernel's native width (no implicit
/// narrowing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    /// Pointer to a buffer of f32
    PtrF32,
    /// Pointer to a buffer of f64
    PtrF64,
    /// Pointer to a buffer of i32
    PtrI32,
    /// Pointer to a buffer of u32
    PtrU32,
    /// Scalar f32
    F32,
    /// Scalar f64
    F64,
    /// Scalar i32
    I32,
    /// Scalar u32
    U32,
    /// Scalar i64
    I64,
    /// Scalar u64
    U64,
}

impl ParamKind {
    /// Size of the parameter within the kernel-argument segment, in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::PtrF32 | Self::PtrF64 | Self::PtrI32 | Self::PtrU32 => 8,
            Self::F64 | Self::I64 | Self::U64 => 8,
            Self::F32 | Self::I32 | Self::U32 => 4,
        }
    }

    /// Natural alignment of the parameter within the segment, in bytes
    #[must_use]
    pub fn alignment(&self) -> usize {
        // All supported kinds are naturally aligned to their size.
        self.size()
    }

    /// Whether the parameter is a device pointer (registered buffer) as
    /// opposed to an inline scalar
    #[must_use]
    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            Self::PtrF32 | Self::PtrF64 | Self::PtrI32 | Self::PtrU32
        )
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PtrF32 => "ptr<f32>",
            Self::PtrF64 => "ptr<f64>",
            Self::PtrI32 => "ptr<i32>",
            Self::PtrU32 => "ptr<u32>",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
        };
        f.write_str(s)
    }
}

/// Ordered sequence of parameter kinds.
///
/// Two signatures are equal iff kinds and order match exactly; together with
/// the kernel identity this forms the build-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamSignature(Vec<ParamKind>);

impl ParamSignature {
    /// Create a signature from an ordered list of kinds
    #[must_use]
    pub fn new(kinds: Vec<ParamKind>) -> Self {
        Self(kinds)
    }

    /// The ordered kinds
    #[must_use]
    pub fn kinds(&self) -> &[ParamKind] {
        &self.0
    }

    /// Number of parameters
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the signature has no parameters
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[ParamKind]> for ParamSignature {
    fn from(kinds: &[ParamKind]) -> Self {
        Self(kinds.to_vec())
    }
}

impl fmt::Display for ParamSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, kind) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{kind}")?;
        }
        write!(f, ")")
    }
}

/// One point of the dispatch grid, as seen by an executing kernel body
#[derive(Debug, Clone, Copy)]
pub struct WorkPoint {
    /// Global work-item id per dimension
    pub global: [u32; 3],
    /// Id within the workgroup per dimension
    pub local: [u32; 3],
    /// Workgroup id per dimension
    pub group: [u32; 3],
    /// Total grid extent per dimension
    pub grid: [u32; 3],
}

impl WorkPoint {
    /// Global id in the given dimension (0..3)
    #[must_use]
    pub fn global_id(&self, dim: usize) -> usize {
        self.global[dim] as usize
    }

    /// Row-major linearization of the global id over the full grid
    #[must_use]
    pub fn global_linear(&self) -> usize {
        let x = self.global[0] as usize;
        let y = self.global[1] as usize;
        let z = self.global[2] as usize;
        let gx = self.grid[0] as usize;
        let gy = self.grid[1] as usize;
        (z * gy + y) * gx + x
    }
}

/// A decoded argument slot, produced by reading the kernel-argument segment
/// at a parameter's declared offset
#[derive(Debug, Clone, Copy)]
enum ArgSlot {
    PtrF32(*mut f32),
    PtrF64(*mut f64),
    PtrI32(*mut i32),
    PtrU32(*mut u32),
    F32(f32),
    F64(f64),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
}

/// Typed view of a dispatch's kernel-argument segment.
///
/// Decoded once per packet by the packet processor, then shared read-only by
/// every work-item of the dispatch. Accessors panic on a kind mismatch;
/// this is unreachable for dispatches that went through [`crate::marshal`],
/// which validates kinds against the executable before submission.
#[derive(Debug)]
pub struct KernargView {
    args: Vec<ArgSlot>,
}

// SAFETY: the raw pointers reference host memory registered for the duration
// of the dispatch. The view itself is read-only; data-race freedom between
// work-items writing through these pointers is the kernel author's
// obligation, exactly as on real hardware.
unsafe impl Send for KernargView {}
unsafe impl Sync for KernargView {}

macro_rules! kernarg_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty, $label:expr) => {
        /// Argument at `index`, panicking if it is not of the expected kind
        #[must_use]
        pub fn $fn_name(&self, index: usize) -> $ty {
            match self.args[index] {
                ArgSlot::$variant(v) => v,
                other => panic!(
                    "kernarg {index} is {other:?}, kernel body expected {}",
                    $label
                ),
            }
        }
    };
}

impl KernargView {
    /// Decode a kernel-argument segment per the executable's declared layout.
    ///
    /// # Safety
    ///
    /// `base` must point to a live allocation holding a segment written for
    /// this layout (at least the segment size in bytes) and must stay valid
    /// for the lifetime of the returned view. No alignment is required of
    /// `base`; every field is read unaligned.
    #[must_use]
    pub unsafe fn decode(layout: &[ParamLayout], base: *const u8) -> Self {
        let args = layout
            .iter()
            .map(|param| {
                let at = base.add(param.offset);
                match param.kind {
                    ParamKind::PtrF32 => {
                        ArgSlot::PtrF32((at.cast::<u64>()).read_unaligned() as *mut f32)
                    }
                    ParamKind::PtrF64 => {
                        ArgSlot::PtrF64((at.cast::<u64>()).read_unaligned() as *mut f64)
                    }
                    ParamKind::PtrI32 => {
                        ArgSlot::PtrI32((at.cast::<u64>()).read_unaligned() as *mut i32)
                    }
                    ParamKind::PtrU32 => {
                        ArgSlot::PtrU32((at.cast::<u64>()).read_unaligned() as *mut u32)
                    }
                    ParamKind::F32 => ArgSlot::F32(at.cast::<f32>().read_unaligned()),
                    ParamKind::F64 => ArgSlot::F64(at.cast::<f64>().read_unaligned()),
                    ParamKind::I32 => ArgSlot::I32(at.cast::<i32>().read_unaligned()),
                    ParamKind::U32 => ArgSlot::U32(at.cast::<u32>().read_unaligned()),
                    ParamKind::I64 => ArgSlot::I64(at.cast::<i64>().read_unaligned()),
                    ParamKind::U64 => ArgSlot::U64(at.cast::<u64>().read_unaligned()),
                }
            })
            .collect();
        Self { args }
    }

    /// Number of decoded arguments
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether the view holds no arguments
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    kernarg_accessor!(ptr_f32, PtrF32, *mut f32, "ptr<f32>");
    kernarg_accessor!(ptr_f64, PtrF64, *mut f64, "ptr<f64>");
    kernarg_accessor!(ptr_i32, PtrI32, *mut i32, "ptr<i32>");
    kernarg_accessor!(ptr_u32, PtrU32, *mut u32, "ptr<u32>");
    kernarg_accessor!(f32, F32, f32, "f32");
    kernarg_accessor!(f64, F64, f64, "f64");
    kernarg_accessor!(i32, I32, i32, "i32");
    kernarg_accessor!(u32, U32, u32, "u32");
    kernarg_accessor!(i64, I64, i64, "i64");
    kernarg_accessor!(u64, U64, u64, "u64");
}

/// Device-executable kernel body.
///
/// Invoked once per work-item of a dispatch; writes through the raw pointers
/// in the [`KernargView`]. Bodies must be data-race free across work-items of
/// the same dispatch.
pub trait KernelBody: Send + Sync {
    /// Execute this body for a single work-item
    fn execute(&self, args: &KernargView, point: &WorkPoint);
}

impl<F> KernelBody for F
where
    F: Fn(&KernargView, &WorkPoint) + Send + Sync,
{
    fn execute(&self, args: &KernargView, point: &WorkPoint) {
        self(args, point);
    }
}

static NEXT_DEF_ID: AtomicU64 = AtomicU64::new(1);

/// A kernel definition: declared parameter kinds plus the body the toolchain
/// compiles.
///
/// Each definition gets a unique id at construction; clones share it, so an
/// identity built once (e.g. from a `static`) always resolves to the same
/// cache entry.
#[derive(Clone)]
pub struct KernelDef {
    id: u64,
    params: Vec<ParamKind>,
    body: Arc<dyn KernelBody>,
}

impl KernelDef {
    /// Create a definition from declared parameters and a body
    #[must_use]
    pub fn new(params: Vec<ParamKind>, body: Arc<dyn KernelBody>) -> Self {
        Self {
            id: NEXT_DEF_ID.fetch_add(1, Ordering::Relaxed),
            params,
            body,
        }
    }

    /// Unique definition id (stable across clones)
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Declared parameter kinds, in declaration order
    #[must_use]
    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    /// The kernel body
    #[must_use]
    pub fn body(&self) -> &Arc<dyn KernelBody> {
        &self.body
    }
}

impl fmt::Debug for KernelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDef")
            .field("id", &self.id)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Stable identity of a kernel: a name plus a definition reference
#[derive(Debug, Clone)]
pub struct KernelIdentity {
    name: String,
    def: KernelDef,
}

impl KernelIdentity {
    /// Create an identity for the given definition
    #[must_use]
    pub fn new(name: impl Into<String>, def: KernelDef) -> Self {
        Self {
            name: name.into(),
            def,
        }
    }

    /// Kernel name (diagnostic; the cache key also includes the definition id)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The referenced definition
    #[must_use]
    pub fn def(&self) -> &KernelDef {
        &self.def
    }
}

/// Declared placement of one parameter within the kernel-argument segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamLayout {
    /// Parameter kind
    pub kind: ParamKind,
    /// Byte offset within the segment
    pub offset: usize,
}

/// Compute the kernel-argument segment layout for a signature.
///
/// Parameters are placed in declaration order at their natural alignment;
/// the total size is rounded up to the segment alignment, which is the
/// largest parameter alignment but at least [`KERNARG_MIN_ALIGN`].
///
/// Returns (per-parameter layout, segment size, segment alignment).
#[must_use]
pub fn kernarg_layout(signature: &ParamSignature) -> (Vec<ParamLayout>, usize, usize) {
    let mut offset = 0usize;
    let mut align = KERNARG_MIN_ALIGN;
    let mut layout = Vec::with_capacity(signature.len());

    for &kind in signature.kinds() {
        let a = kind.alignment();
        align = align.max(a);
        offset = offset.div_ceil(a) * a;
        layout.push(ParamLayout { kind, offset });
        offset += kind.size();
    }

    let size = offset.div_ceil(align) * align;
    (layout, size, align)
}

/// A compiled kernel: the immutable result of resolving one
/// (identity, signature) pair through the build cache.
///
/// Shared by all dispatches with that signature and owned by the cache for
/// the life of the context. The kernel-object handle is what a dispatch
/// packet carries; the packet processor resolves it back to the body and
/// layout through the kernel-object table.
pub struct KernelExecutable {
    name: String,
    kernel_object: u64,
    signature: ParamSignature,
    layout: Vec<ParamLayout>,
    kernarg_size: usize,
    kernarg_align: usize,
    group_segment_size: u32,
    private_segment_size: u32,
}

impl KernelExecutable {
    /// Link a compiled binary into an executable: compute the kernarg layout
    /// for the signature and publish the body in the kernel-object table.
    #[must_use]
    pub fn link(
        name: impl Into<String>,
        signature: &ParamSignature,
        binary: crate::compiler::CompiledBinary,
    ) -> Self {
        let (layout, kernarg_size, kernarg_align) = kernarg_layout(signature);
        let kernel_object = crate::compiler::register_kernel_object(binary.body, layout.clone());
        Self {
            name: name.into(),
            kernel_object,
            signature: signature.clone(),
            layout,
            kernarg_size,
            kernarg_align,
            group_segment_size: binary.group_segment_size,
            private_segment_size: binary.private_segment_size,
        }
    }

    /// Kernel name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opaque kernel-object handle carried by dispatch packets
    #[must_use]
    pub fn kernel_object(&self) -> u64 {
        self.kernel_object
    }

    /// The signature this executable was compiled for
    #[must_use]
    pub fn signature(&self) -> &ParamSignature {
        &self.signature
    }

    /// Per-parameter segment placement, in declaration order
    #[must_use]
    pub fn layout(&self) -> &[ParamLayout] {
        &self.layout
    }

    /// Required kernel-argument segment size in bytes
    #[must_use]
    pub fn kernarg_size(&self) -> usize {
        self.kernarg_size
    }

    /// Required kernel-argument segment alignment in bytes
    #[must_use]
    pub fn kernarg_align(&self) -> usize {
        self.kernarg_align
    }

    /// Group (workgroup-local) memory requirement in bytes
    #[must_use]
    pub fn group_segment_size(&self) -> u32 {
        self.group_segment_size
    }

    /// Private (per-work-item) memory requirement in bytes
    #[must_use]
    pub fn private_segment_size(&self) -> u32 {
        self.private_segment_size
    }
}

impl Drop for KernelExecutable {
    fn drop(&mut self) {
        crate::compiler::deregister_kernel_object(self.kernel_object);
    }
}

impl fmt::Debug for KernelExecutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelExecutable")
            .field("name", &self.name)
            .field("kernel_object", &self.kernel_object)
            .field("signature", &self.signature)
            .field("kernarg_size", &self.kernarg_size)
            .field("kernarg_align", &self.kernarg_align)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_kind_sizes() {
        assert_eq!(ParamKind::PtrF32.size(), 8);
        assert_eq!(ParamKind::PtrF64.size(), 8);
        assert_eq!(ParamKind::F32.size(), 4);
        assert_eq!(ParamKind::F64.size(), 8);
        assert_eq!(ParamKind::I32.size(), 4);
        assert_eq!(ParamKind::U64.size(), 8);
    }

    #[test]
    fn test_param_kind_pointer_classification() {
        assert!(ParamKind::PtrF32.is_pointer());
        assert!(ParamKind::PtrI32.is_pointer());
        assert!(!ParamKind::F32.is_pointer());
        assert!(!ParamKind::U64.is_pointer());
    }

    #[test]
    fn test_signature_equality_is_order_sensitive() {
        let a = ParamSignature::new(vec![ParamKind::PtrF32, ParamKind::U32]);
        let b = ParamSignature::new(vec![ParamKind::U32, ParamKind::PtrF32]);
        let c = ParamSignature::new(vec![ParamKind::PtrF32, ParamKind::U32]);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_signature_display() {
        let sig = ParamSignature::new(vec![ParamKind::PtrF64, ParamKind::I32]);
        assert_eq!(sig.to_string(), "(ptr<f64>, i32)");
        assert_eq!(ParamSignature::new(vec![]).to_string(), "()");
    }

    #[test]
    fn test_kernarg_layout_packs_at_natural_alignment() {
        // f32 at 0, then a pointer must skip to offset 8
        let sig = ParamSignature::new(vec![ParamKind::F32, ParamKind::PtrF32, ParamKind::U32]);
        let (layout, size, align) = kernarg_layout(&sig);
        assert_eq!(layout[0].offset, 0);
        assert_eq!(layout[1].offset, 8);
        assert_eq!(layout[2].offset, 16);
        assert_eq!(align, KERNARG_MIN_ALIGN);
        // 20 bytes of payload rounded up to the 16-byte segment alignment
        assert_eq!(size, 32);
    }

    #[test]
    fn test_kernarg_layout_empty_signature() {
        let (layout, size, align) = kernarg_layout(&ParamSignature::new(vec![]));
        assert!(layout.is_empty());
        assert_eq!(size, 0);
        assert_eq!(align, KERNARG_MIN_ALIGN);
    }

    #[test]
    fn test_kernel_def_ids_are_unique_and_clone_stable() {
        let body: Arc<dyn KernelBody> = Arc::new(|_: &KernargView, _: &WorkPoint| {});
        let a = KernelDef::new(vec![ParamKind::F32], body.clone());
        let b = KernelDef::new(vec![ParamKind::F32], body);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_work_point_global_linear() {
        let point = WorkPoint {
            global: [1, 2, 0],
            local: [1, 2, 0],
            group: [0, 0, 0],
            grid: [4, 3, 1],
        };
        // row-major: 2 * 4 + 1
        assert_eq!(point.global_linear(), 9);
        assert_eq!(point.global_id(0), 1);
        assert_eq!(point.global_id(1), 2);
    }

    #[test]
    fn test_kernarg_view_decode_roundtrip() {
        let sig = ParamSignature::new(vec![ParamKind::F32, ParamKind::U32, ParamKind::PtrF32]);
        let (layout, size, _) = kernarg_layout(&sig);

        let mut segment = vec![0u8; size];
        segment[0..4].copy_from_slice(&1.5f32.to_ne_bytes());
        segment[4..8].copy_from_slice(&7u32.to_ne_bytes());
        let fake_addr = 0xdead_beefu64;
        segment[8..16].copy_from_slice(&fake_addr.to_ne_bytes());

        // SAFETY: segment outlives the view; layout matches what was written
        let view = unsafe { KernargView::decode(&layout, segment.as_ptr()) };
        assert_eq!(view.len(), 3);
        assert!((view.f32(0) - 1.5).abs() < 1e-9);
        assert_eq!(view.u32(1), 7);
        assert_eq!(view.ptr_f32(2) as u64, fake_addr);
    }

    #[test]
    fn test_kernarg_view_decode_tolerates_unaligned_base() {
        let sig = ParamSignature::new(vec![ParamKind::U64, ParamKind::F64]);
        let (layout, size, _) = kernarg_layout(&sig);

        // segment deliberately shifted one byte so no field lands on its
        // natural alignment
        let mut backing = vec![0u8; size + 1];
        backing[1..9].copy_from_slice(&0x1122_3344_5566_7788u64.to_ne_bytes());
        backing[9..17].copy_from_slice(&6.5f64.to_ne_bytes());

        // SAFETY: backing outlives the view; layout matches what was written
        let view = unsafe { KernargView::decode(&layout, backing[1..].as_ptr()) };
        assert_eq!(view.u64(0), 0x1122_3344_5566_7788);
        assert!((view.f64(1) - 6.5).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "kernel body expected")]
    fn test_kernarg_view_kind_mismatch_panics() {
        let sig = ParamSignature::new(vec![ParamKind::F32]);
        let (layout, size, _) = kernarg_layout(&sig);
        let segment = vec![0u8; size];
        // SAFETY: segment outlives the view
        let view = unsafe { KernargView::decode(&layout, segment.as_ptr()) };
        let _ = view.u32(0);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn any_param_kind() -> impl Strategy<Value = ParamKind> {
        prop_oneof![
            Just(ParamKind::PtrF32),
            Just(ParamKind::PtrF64),
            Just(ParamKind::PtrI32),
            Just(ParamKind::PtrU32),
            Just(ParamKind::F32),
            Just(ParamKind::F64),
            Just(ParamKind::I32),
            Just(ParamKind::U32),
            Just(ParamKind::I64),
            Just(ParamKind::U64),
        ]
    }

    proptest! {
        #[test]
        fn kernarg_layout_invariants(kinds in prop::collection::vec(any_param_kind(), 0..16)) {
            let sig = ParamSignature::new(kinds);
            let (layout, size, align) = kernarg_layout(&sig);

            prop_assert_eq!(layout.len(), sig.len());
            prop_assert!(align >= KERNARG_MIN_ALIGN);
            prop_assert_eq!(size % align, 0);

            let mut prev_end = 0usize;
            for param in &layout {
                // aligned, in declaration order, non-overlapping
                prop_assert_eq!(param.offset % param.kind.alignment(), 0);
                prop_assert!(param.offset >= prev_end);
                prev_end = param.offset + param.kind.size();
            }
            prop_assert!(prev_end <= size);
        }
    }
}
