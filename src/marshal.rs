//! Argument marshaling
//!
//! Turns a caller's typed argument list into the binary kernel-argument
//! segment a dispatch packet points at. Arguments are validated against the
//! executable's declared signature first (count, then kind per position),
//! then written at the executable's declared offsets: device pointers as
//! `u64` addresses from the memory registrar, scalars inline at native
//! width. Nothing is written until validation passes.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::error::{DespacharError, Result};
use crate::kernel::{KernelExecutable, ParamKind};
use crate::memory::DevicePtr;

/// One launch argument, borrowed from the caller for the duration of the
/// launch call.
///
/// Buffer variants are registered with the memory registrar before
/// marshaling; `Out` variants take the buffer mutably so the borrow checker
/// enforces exclusive access while the agent may write through it.
#[derive(Debug)]
pub enum LaunchArg<'a> {
    /// Read-only f32 buffer
    InF32(&'a [f32]),
    /// Writable f32 buffer
    OutF32(&'a mut [f32]),
    /// Read-only f64 buffer
    InF64(&'a [f64]),
    /// Writable f64 buffer
    OutF64(&'a mut [f64]),
    /// Read-only i32 buffer
    InI32(&'a [i32]),
    /// Writable i32 buffer
    OutI32(&'a mut [i32]),
    /// Read-only u32 buffer
    InU32(&'a [u32]),
    /// Writable u32 buffer
    OutU32(&'a mut [u32]),
    /// Scalar f32
    F32(f32),
    /// Scalar f64
    F64(f64),
    /// Scalar i32
    I32(i32),
    /// Scalar u32
    U32(u32),
    /// Scalar i64
    I64(i64),
    /// Scalar u64
    U64(u64),
}

impl LaunchArg<'_> {
    /// The parameter kind this argument satisfies
    #[must_use]
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::InF32(_) | Self::OutF32(_) => ParamKind::PtrF32,
            Self::InF64(_) | Self::OutF64(_) => ParamKind::PtrF64,
            Self::InI32(_) | Self::OutI32(_) => ParamKind::PtrI32,
            Self::InU32(_) | Self::OutU32(_) => ParamKind::PtrU32,
            Self::F32(_) => ParamKind::F32,
            Self::F64(_) => ParamKind::F64,
            Self::I32(_) => ParamKind::I32,
            Self::U32(_) => ParamKind::U32,
            Self::I64(_) => ParamKind::I64,
            Self::U64(_) => ParamKind::U64,
        }
    }

    /// Host address and byte length of the underlying buffer, or `None` for
    /// scalar arguments
    #[must_use]
    pub(crate) fn buffer_region(&self) -> Option<(u64, usize)> {
        match self {
            Self::InF32(s) => Some((s.as_ptr() as u64, std::mem::size_of_val(*s))),
            Self::OutF32(s) => Some((s.as_ptr() as u64, std::mem::size_of_val(&**s))),
            Self::InF64(s) => Some((s.as_ptr() as u64, std::mem::size_of_val(*s))),
            Self::OutF64(s) => Some((s.as_ptr() as u64, std::mem::size_of_val(&**s))),
            Self::InI32(s) => Some((s.as_ptr() as u64, std::mem::size_of_val(*s))),
            Self::OutI32(s) => Some((s.as_ptr() as u64, std::mem::size_of_val(&**s))),
            Self::InU32(s) => Some((s.as_ptr() as u64, std::mem::size_of_val(*s))),
            Self::OutU32(s) => Some((s.as_ptr() as u64, std::mem::size_of_val(&**s))),
            _ => None,
        }
    }
}

impl fmt::Display for LaunchArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// Owned, aligned allocation holding one dispatch's marshaled
/// kernel-argument segment.
///
/// Must stay alive until the dispatch's completion signal is observed; the
/// packet carries only its raw address.
#[derive(Debug)]
pub struct ArgumentBuffer {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: the buffer is an owned heap allocation; the agent only reads it
// through the address the packet carries, and the launch path keeps the
// buffer alive until that read has retired.
unsafe impl Send for ArgumentBuffer {}

impl ArgumentBuffer {
    /// Allocate a zeroed segment of `size` bytes at `align` alignment.
    ///
    /// A zero-sized segment (kernel with no parameters) allocates the
    /// alignment's worth of bytes so the address stays non-null.
    pub fn alloc(size: usize, align: usize) -> Result<Self> {
        let alloc_size = size.max(align);
        let layout = Layout::from_size_align(alloc_size, align)
            .map_err(|e| DespacharError::Memory(format!("bad kernarg layout: {e}")))?;
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            DespacharError::Memory(format!("kernarg allocation of {alloc_size} bytes failed"))
        })?;
        Ok(Self { ptr, size, layout })
    }

    /// Segment size in bytes (as declared by the executable)
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Address the dispatch packet carries in `kernarg_address`
    #[must_use]
    pub fn device_address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.layout.size());
        // SAFETY: offset + len is within the allocation, checked above
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }
}

impl Drop for ArgumentBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

/// Validate `args` against the executable's signature and produce the
/// marshaled kernel-argument segment.
///
/// `pointers` is the registrar's output for the same argument list: one
/// [`DevicePtr`] per argument, null for scalars. Validation is all-or-
/// nothing; on error no segment is allocated.
///
/// # Errors
///
/// [`DespacharError::ArgumentCount`] when the list length differs from the
/// declared parameter count, [`DespacharError::SignatureMismatch`] on the
/// first position whose kind differs, [`DespacharError::Memory`] when
/// `pointers` does not cover every argument.
pub fn marshal(
    executable: &KernelExecutable,
    args: &[LaunchArg<'_>],
    pointers: &[DevicePtr],
) -> Result<ArgumentBuffer> {
    let declared = executable.signature().kinds();
    if args.len() != declared.len() {
        return Err(DespacharError::ArgumentCount {
            declared: declared.len(),
            supplied: args.len(),
        });
    }
    if pointers.len() != args.len() {
        return Err(DespacharError::Memory(format!(
            "registration output covers {} of {} arguments",
            pointers.len(),
            args.len()
        )));
    }

    for (index, (arg, &kind)) in args.iter().zip(declared).enumerate() {
        if arg.kind() != kind {
            return Err(DespacharError::SignatureMismatch {
                index,
                declared: kind,
                supplied: arg.kind(),
            });
        }
    }

    let mut buffer = ArgumentBuffer::alloc(executable.kernarg_size(), executable.kernarg_align())?;

    for ((arg, param), ptr) in args.iter().zip(executable.layout()).zip(pointers) {
        match arg {
            LaunchArg::InF32(_)
            | LaunchArg::OutF32(_)
            | LaunchArg::InF64(_)
            | LaunchArg::OutF64(_)
            | LaunchArg::InI32(_)
            | LaunchArg::OutI32(_)
            | LaunchArg::InU32(_)
            | LaunchArg::OutU32(_) => {
                buffer.write_bytes(param.offset, &ptr.addr().to_ne_bytes());
            }
            LaunchArg::F32(v) => buffer.write_bytes(param.offset, &v.to_ne_bytes()),
            LaunchArg::F64(v) => buffer.write_bytes(param.offset, &v.to_ne_bytes()),
            LaunchArg::I32(v) => buffer.write_bytes(param.offset, &v.to_ne_bytes()),
            LaunchArg::U32(v) => buffer.write_bytes(param.offset, &v.to_ne_bytes()),
            LaunchArg::I64(v) => buffer.write_bytes(param.offset, &v.to_ne_bytes()),
            LaunchArg::U64(v) => buffer.write_bytes(param.offset, &v.to_ne_bytes()),
        }
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{HostCompiler, KernelCompiler};
    use crate::kernel::{
        KernargView, KernelBody, KernelDef, KernelIdentity, ParamSignature, WorkPoint,
    };
    use std::sync::Arc;

    fn executable_for(kinds: Vec<ParamKind>) -> KernelExecutable {
        let body: Arc<dyn KernelBody> = Arc::new(|_: &KernargView, _: &WorkPoint| {});
        let identity = KernelIdentity::new("marshal_test", KernelDef::new(kinds.clone(), body));
        let signature = ParamSignature::new(kinds);
        let binary = HostCompiler::new()
            .compile(&identity, &signature)
            .expect("compile");
        KernelExecutable::link("marshal_test", &signature, binary)
    }

    #[test]
    fn test_marshal_writes_pointer_and_scalars_at_declared_offsets() {
        let exe = executable_for(vec![ParamKind::PtrF32, ParamKind::F32, ParamKind::U32]);
        let data = vec![0.0f32; 4];
        let addr = data.as_ptr() as u64;

        let args = [
            LaunchArg::InF32(&data),
            LaunchArg::F32(2.5),
            LaunchArg::U32(4),
        ];
        let pointers = [
            DevicePtr::new(addr),
            DevicePtr::NULL,
            DevicePtr::NULL,
        ];
        let buffer = marshal(&exe, &args, &pointers).expect("marshal");

        assert_eq!(buffer.size(), exe.kernarg_size());
        assert_eq!(buffer.device_address() % exe.kernarg_align() as u64, 0);

        // SAFETY: buffer outlives the view; layout matches what was marshaled
        let view = unsafe { KernargView::decode(exe.layout(), buffer.device_address() as *const u8) };
        assert_eq!(view.ptr_f32(0) as u64, addr);
        assert!((view.f32(1) - 2.5).abs() < 1e-9);
        assert_eq!(view.u32(2), 4);
    }

    #[test]
    fn test_marshal_rejects_wrong_argument_count() {
        let exe = executable_for(vec![ParamKind::F32, ParamKind::F32]);
        let err = marshal(&exe, &[LaunchArg::F32(1.0)], &[DevicePtr::NULL])
            .expect_err("one argument for a two-parameter kernel");
        assert!(matches!(
            err,
            DespacharError::ArgumentCount {
                declared: 2,
                supplied: 1
            }
        ));
    }

    #[test]
    fn test_marshal_rejects_kind_mismatch_with_position() {
        let exe = executable_for(vec![ParamKind::PtrF32, ParamKind::U32]);
        let data = vec![0.0f32; 4];
        let args = [LaunchArg::InF32(&data), LaunchArg::I32(4)];
        let pointers = [DevicePtr::new(data.as_ptr() as u64), DevicePtr::NULL];

        let err = marshal(&exe, &args, &pointers).expect_err("i32 supplied for u32");
        match err {
            DespacharError::SignatureMismatch {
                index,
                declared,
                supplied,
            } => {
                assert_eq!(index, 1);
                assert_eq!(declared, ParamKind::U32);
                assert_eq!(supplied, ParamKind::I32);
            }
            other => panic!("expected SignatureMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_marshal_rejects_short_pointer_slice() {
        let exe = executable_for(vec![ParamKind::PtrF32, ParamKind::U32]);
        let data = vec![0.0f32; 4];
        let args = [LaunchArg::InF32(&data), LaunchArg::U32(4)];

        // one registration result for two arguments: must error, not zero
        // the trailing parameters
        let err = marshal(&exe, &args, &[DevicePtr::new(data.as_ptr() as u64)])
            .expect_err("short pointer slice");
        assert!(matches!(err, DespacharError::Memory(_)));
    }

    #[test]
    fn test_marshal_empty_signature() {
        let exe = executable_for(vec![]);
        let buffer = marshal(&exe, &[], &[]).expect("empty marshal");
        assert_eq!(buffer.size(), 0);
        // address stays non-null and aligned even for an empty segment
        assert_ne!(buffer.device_address(), 0);
        assert_eq!(buffer.device_address() % exe.kernarg_align() as u64, 0);
    }

    #[test]
    fn test_marshal_scalar_widths_are_native() {
        let exe = executable_for(vec![ParamKind::I64, ParamKind::F64]);
        let args = [LaunchArg::I64(-1), LaunchArg::F64(3.25)];
        let pointers = [DevicePtr::NULL, DevicePtr::NULL];
        let buffer = marshal(&exe, &args, &pointers).expect("marshal");

        // SAFETY: buffer outlives the view
        let view = unsafe { KernargView::decode(exe.layout(), buffer.device_address() as *const u8) };
        assert_eq!(view.i64(0), -1);
        assert!((view.f64(1) - 3.25).abs() < 1e-12);
    }

    #[test]
    fn test_launch_arg_kind_mapping() {
        let mut out = vec![0u32; 2];
        assert_eq!(LaunchArg::InF64(&[1.0]).kind(), ParamKind::PtrF64);
        assert_eq!(LaunchArg::OutU32(&mut out).kind(), ParamKind::PtrU32);
        assert_eq!(LaunchArg::U64(9).kind(), ParamKind::U64);
    }
}
