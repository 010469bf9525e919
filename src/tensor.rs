//! Tensor contraction kernels used for basis application.
//!
//! The contraction computes `v[a, j, c] (+)= Σ_b t[j, b] · u[a, b, c]` for a
//! table `t` of shape `J × B` (or its transpose), with arbitrary leading
//! extent `A` and trailing extent `C`. Applying a one-dimensional basis
//! table along each axis of a tensor-product element reduces to a sequence
//! of these contractions with varying `A`/`C`.
//!
//! Two strategies are provided. The blocked strategy vectorizes over the
//! trailing extent in fixed-size chunks and is used whenever `C > 1`; the
//! serial strategy vectorizes over the contracted-into extent and is used
//! for `C == 1`. Both traverse loops in a fixed order, so results are
//! bit-reproducible for a fixed strategy.

use crate::{Scalar, TransposeMode};

/// Chunk width for the unrolled inner loops.
const BLOCK: usize = 8;

/// Contract `u[A, B, C]` with `t` into `v[A, J, C]`.
///
/// With `tmode == NoTranspose`, `t` is indexed as a `J × B` row-major table;
/// with `Transpose` it is indexed as the transpose of a `B × J` table. When
/// `add` is false the destination is zeroed first; otherwise results
/// accumulate onto the existing contents.
///
/// # Panics
///
/// Panics if the slice lengths do not match the declared extents.
pub fn contract(
    a: usize,
    b: usize,
    c: usize,
    j: usize,
    t: &[Scalar],
    tmode: TransposeMode,
    add: bool,
    u: &[Scalar],
    v: &mut [Scalar],
) {
    assert_eq!(u.len(), a * b * c, "operand extent mismatch");
    assert_eq!(v.len(), a * j * c, "destination extent mismatch");
    assert_eq!(t.len(), b * j, "table extent mismatch");

    if !add {
        v.fill(0.0);
    }

    if c == 1 {
        contract_serial(a, b, c, j, t, tmode, u, v);
    } else {
        contract_blocked(a, b, c, j, t, tmode, u, v);
    }
}

/// Blocked contraction: unrolls over the trailing extent `C` in chunks of
/// [`BLOCK`] with a remainder tail. Always accumulates into `v`.
pub fn contract_blocked(
    a: usize,
    b: usize,
    c: usize,
    j: usize,
    t: &[Scalar],
    tmode: TransposeMode,
    u: &[Scalar],
    v: &mut [Scalar],
) {
    let (t_stride_0, t_stride_1) = table_strides(b, j, tmode);

    for ia in 0..a {
        for ib in 0..b {
            for ij in 0..j {
                let tq = t[ij * t_stride_0 + ib * t_stride_1];
                let u_base = (ia * b + ib) * c;
                let v_base = (ia * j + ij) * c;
                let chunks = (c / BLOCK) * BLOCK;
                let mut ic = 0;
                while ic < chunks {
                    for cc in 0..BLOCK {
                        v[v_base + ic + cc] += tq * u[u_base + ic + cc];
                    }
                    ic += BLOCK;
                }
                for ic in chunks..c {
                    v[v_base + ic] += tq * u[u_base + ic];
                }
            }
        }
    }
}

/// Serial contraction: unrolls over the contracted-into extent `J` in chunks
/// of [`BLOCK`]. Requires `C == 1` and always accumulates into `v`.
pub fn contract_serial(
    a: usize,
    b: usize,
    c: usize,
    j: usize,
    t: &[Scalar],
    tmode: TransposeMode,
    u: &[Scalar],
    v: &mut [Scalar],
) {
    assert_eq!(c, 1, "serial strategy requires a unit trailing extent");
    let (t_stride_0, t_stride_1) = table_strides(b, j, tmode);

    for ia in 0..a {
        for ib in 0..b {
            let uq = u[ia * b + ib];
            let chunks = (j / BLOCK) * BLOCK;
            let mut ij = 0;
            while ij < chunks {
                for jj in 0..BLOCK {
                    v[ia * j + ij + jj] += t[(ij + jj) * t_stride_0 + ib * t_stride_1] * uq;
                }
                ij += BLOCK;
            }
            for ij in chunks..j {
                v[ia * j + ij] += t[ij * t_stride_0 + ib * t_stride_1] * uq;
            }
        }
    }
}

fn table_strides(b: usize, j: usize, tmode: TransposeMode) -> (usize, usize) {
    match tmode {
        TransposeMode::NoTranspose => (b, 1),
        TransposeMode::Transpose => (1, j),
    }
}
