//! Built-in kernel library
//!
//! Ready-made kernel identities for common element-wise and matrix
//! operations. Each constructor hands out clones of one process-wide
//! definition, so repeated launches of the same built-in share a single
//! build-cache entry.
//!
//! All bodies take an explicit element count (or matrix extents) and bounds
//! check against it, so any grid at least as large as the data is valid,
//! including grids padded up by the workgroup shape.

use std::sync::{Arc, OnceLock};

use crate::kernel::{KernargView, KernelBody, KernelDef, KernelIdentity, ParamKind, WorkPoint};

fn identity_of(
    cell: &'static OnceLock<KernelIdentity>,
    name: &str,
    params: Vec<ParamKind>,
    body: Arc<dyn KernelBody>,
) -> KernelIdentity {
    cell.get_or_init(|| KernelIdentity::new(name, KernelDef::new(params, body)))
        .clone()
}

/// `fill_f32(out: ptr<f32>, value: f32, n: u32)`: set every element to a
/// constant
#[must_use]
pub fn fill_f32() -> KernelIdentity {
    static IDENTITY: OnceLock<KernelIdentity> = OnceLock::new();
    identity_of(
        &IDENTITY,
        "fill_f32",
        vec![ParamKind::PtrF32, ParamKind::F32, ParamKind::U32],
        Arc::new(|args: &KernargView, point: &WorkPoint| {
            let i = point.global_linear();
            let n = args.u32(2) as usize;
            if i < n {
                // SAFETY: i < n and the registered buffer holds n elements
                unsafe {
                    *args.ptr_f32(0).add(i) = args.f32(1);
                }
            }
        }),
    )
}

/// `copy_i32(src: ptr<i32>, dst: ptr<i32>, n: u32)`: element-wise copy
#[must_use]
pub fn copy_i32() -> KernelIdentity {
    static IDENTITY: OnceLock<KernelIdentity> = OnceLock::new();
    identity_of(
        &IDENTITY,
        "copy_i32",
        vec![ParamKind::PtrI32, ParamKind::PtrI32, ParamKind::U32],
        Arc::new(|args: &KernargView, point: &WorkPoint| {
            let i = point.global_linear();
            let n = args.u32(2) as usize;
            if i < n {
                // SAFETY: i < n and both registered buffers hold n elements
                unsafe {
                    *args.ptr_i32(1).add(i) = *args.ptr_i32(0).add(i);
                }
            }
        }),
    )
}

/// `vector_add_f32(a: ptr<f32>, b: ptr<f32>, out: ptr<f32>, n: u32)`:
/// element-wise `out = a + b`
#[must_use]
pub fn vector_add_f32() -> KernelIdentity {
    static IDENTITY: OnceLock<KernelIdentity> = OnceLock::new();
    identity_of(
        &IDENTITY,
        "vector_add_f32",
        vec![
            ParamKind::PtrF32,
            ParamKind::PtrF32,
            ParamKind::PtrF32,
            ParamKind::U32,
        ],
        Arc::new(|args: &KernargView, point: &WorkPoint| {
            let i = point.global_linear();
            let n = args.u32(3) as usize;
            if i < n {
                // SAFETY: i < n and all three registered buffers hold n
                // elements
                unsafe {
                    *args.ptr_f32(2).add(i) = *args.ptr_f32(0).add(i) + *args.ptr_f32(1).add(i);
                }
            }
        }),
    )
}

/// `saxpy_f32(a: f32, x: ptr<f32>, y: ptr<f32>, n: u32)`: in-place
/// `y = a * x + y`
#[must_use]
pub fn saxpy_f32() -> KernelIdentity {
    static IDENTITY: OnceLock<KernelIdentity> = OnceLock::new();
    identity_of(
        &IDENTITY,
        "saxpy_f32",
        vec![
            ParamKind::F32,
            ParamKind::PtrF32,
            ParamKind::PtrF32,
            ParamKind::U32,
        ],
        Arc::new(|args: &KernargView, point: &WorkPoint| {
            let i = point.global_linear();
            let n = args.u32(3) as usize;
            if i < n {
                // SAFETY: i < n and both registered buffers hold n elements
                unsafe {
                    let y = args.ptr_f32(2).add(i);
                    *y = args.f32(0).mul_add(*args.ptr_f32(1).add(i), *y);
                }
            }
        }),
    )
}

/// `matmul_f32(a: ptr<f32>, b: ptr<f32>, c: ptr<f32>, m: u32, k: u32,
/// n: u32)`: row-major `C[m,n] = A[m,k] * B[k,n]`.
///
/// Launch over [`crate::Geometry::grid_2d`]`(m, n)`: the x dimension indexes
/// rows of C, the y dimension columns.
#[must_use]
pub fn matmul_f32() -> KernelIdentity {
    static IDENTITY: OnceLock<KernelIdentity> = OnceLock::new();
    identity_of(
        &IDENTITY,
        "matmul_f32",
        vec![
            ParamKind::PtrF32,
            ParamKind::PtrF32,
            ParamKind::PtrF32,
            ParamKind::U32,
            ParamKind::U32,
            ParamKind::U32,
        ],
        Arc::new(|args: &KernargView, point: &WorkPoint| {
            let row = point.global_id(0);
            let col = point.global_id(1);
            let m = args.u32(3) as usize;
            let k = args.u32(4) as usize;
            let n = args.u32(5) as usize;
            if row >= m || col >= n {
                return;
            }
            let a = args.ptr_f32(0);
            let b = args.ptr_f32(1);
            // SAFETY: row < m, col < n, and the registered buffers hold
            // m*k, k*n, and m*n elements respectively
            unsafe {
                let mut acc = 0.0f32;
                for step in 0..k {
                    acc = (*a.add(row * k + step)).mul_add(*b.add(step * n + col), acc);
                }
                *args.ptr_f32(2).add(row * n + col) = acc;
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities_are_clone_stable() {
        // repeated constructor calls must share one definition, otherwise
        // every launch would recompile
        assert_eq!(vector_add_f32().def().id(), vector_add_f32().def().id());
        assert_eq!(matmul_f32().def().id(), matmul_f32().def().id());
        assert_ne!(vector_add_f32().def().id(), saxpy_f32().def().id());
    }

    #[test]
    fn test_declared_signatures() {
        assert_eq!(
            fill_f32().def().params(),
            &[ParamKind::PtrF32, ParamKind::F32, ParamKind::U32]
        );
        assert_eq!(
            saxpy_f32().def().params(),
            &[
                ParamKind::F32,
                ParamKind::PtrF32,
                ParamKind::PtrF32,
                ParamKind::U32
            ]
        );
        assert_eq!(matmul_f32().def().params().len(), 6);
    }

    #[test]
    fn test_names() {
        assert_eq!(copy_i32().name(), "copy_i32");
        assert_eq!(matmul_f32().name(), "matmul_f32");
    }
}
