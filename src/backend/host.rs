//! The sequential host backend.
//!
//! Restriction, basis application and physics evaluation run as ordinary
//! loops; the only "parallelism" is the SIMD-friendly blocking inside the
//! tensor contraction engine. Operator application composes the public
//! restriction/basis/QFunction operations element block by element block,
//! reusing workspace buffers across apply calls.

use crate::backend::registry::{ObjectKind, Registry};
use crate::backend::{
    BasisApplyFn, OperatorApplyAddFn, OperatorCompileFn, QFunctionApplyFn, QFunctionBuildFn,
    RestrictionApplyFn,
};
use crate::basis::{Basis, BasisKind};
use crate::error::{Error, Result};
use crate::operator::{OperatorInner, OperatorPlan, PlannedField, VectorSpec};
use crate::qfunction::QFunction;
use crate::restriction::{ElemRestriction, RestrictionKind};
use crate::tensor;
use crate::vector::Vector;
use crate::{EvalMode, Scalar, TransposeMode};
use itertools::izip;
use std::sync::Arc;

/// Register the host implementations for every object kind.
pub(crate) fn register(registry: &mut Registry) {
    let restriction_apply: RestrictionApplyFn = Arc::new(restriction_apply);
    registry.register(ObjectKind::ElemRestriction, "Apply", restriction_apply);

    let basis_apply: BasisApplyFn = Arc::new(basis_apply);
    registry.register(ObjectKind::Basis, "Apply", basis_apply);

    let qf_build: QFunctionBuildFn = Arc::new(qfunction_build);
    registry.register(ObjectKind::QFunction, "Build", qf_build);
    let qf_apply: QFunctionApplyFn = Arc::new(qfunction_apply);
    registry.register(ObjectKind::QFunction, "Apply", qf_apply);

    let op_compile: OperatorCompileFn = Arc::new(operator_compile);
    registry.register(ObjectKind::Operator, "Compile", op_compile);
    let op_apply: OperatorApplyAddFn = Arc::new(operator_apply_add);
    registry.register(ObjectKind::Operator, "ApplyAdd", op_apply);
}

// -------------------------------------------------------------------------
// Element restriction
// -------------------------------------------------------------------------

pub(crate) fn restriction_apply(
    r: &ElemRestriction,
    tmode: TransposeMode,
    u: &Vector,
    v: &mut Vector,
) -> Result<()> {
    let num_elem = r.num_elements();
    let elem_size = r.elem_size();
    let num_comp = r.num_components();
    let u = u.as_slice();
    let v = v.as_mut_slice();

    match (r.kind(), tmode) {
        (RestrictionKind::Strided { strides }, TransposeMode::NoTranspose) => {
            let [s_node, s_comp, s_elem] = *strides;
            for elem in 0..num_elem {
                for comp in 0..num_comp {
                    let block = (elem * num_comp + comp) * elem_size;
                    for node in 0..elem_size {
                        v[block + node] = u[node * s_node + comp * s_comp + elem * s_elem];
                    }
                }
            }
        }
        (RestrictionKind::Strided { strides }, TransposeMode::Transpose) => {
            // Strided entries are never shared, so the accumulation below has
            // no conflicting writes.
            let [s_node, s_comp, s_elem] = *strides;
            for elem in 0..num_elem {
                for comp in 0..num_comp {
                    let block = (elem * num_comp + comp) * elem_size;
                    for node in 0..elem_size {
                        v[node * s_node + comp * s_comp + elem * s_elem] += u[block + node];
                    }
                }
            }
        }
        (
            RestrictionKind::Offsets {
                offsets, orients, ..
            },
            TransposeMode::NoTranspose,
        ) => {
            let comp_stride = r.comp_stride();
            for elem in 0..num_elem {
                for node in 0..elem_size {
                    let position = elem * elem_size + node;
                    let index = offsets[position];
                    let flip = orients.as_ref().map_or(false, |o| o[position]);
                    for comp in 0..num_comp {
                        let value = u[index + comp * comp_stride];
                        v[(elem * num_comp + comp) * elem_size + node] =
                            if flip { -value } else { value };
                    }
                }
            }
        }
        (
            RestrictionKind::Offsets {
                orients, transpose, ..
            },
            TransposeMode::Transpose,
        ) => {
            // Node-ordered reduction: all contributions to one L-vector node
            // are summed locally before a single accumulating write, so the
            // same loop is valid for any execution order over nodes.
            let comp_stride = r.comp_stride();
            for (i, &node) in transpose.lvec_indices.iter().enumerate() {
                let range = transpose.t_offsets[i]..transpose.t_offsets[i + 1];
                for comp in 0..num_comp {
                    let mut acc = 0.0;
                    for &position in &transpose.t_indices[range.clone()] {
                        let elem = position / elem_size;
                        let loc_node = position % elem_size;
                        let value = u[(elem * num_comp + comp) * elem_size + loc_node];
                        let flip = orients.as_ref().map_or(false, |o| o[position]);
                        acc += if flip { -value } else { value };
                    }
                    v[node + comp * comp_stride] += acc;
                }
            }
        }
    }
    Ok(())
}

// -------------------------------------------------------------------------
// Basis application
// -------------------------------------------------------------------------

pub(crate) fn basis_apply(
    basis: &Basis,
    num_elem: usize,
    tmode: TransposeMode,
    emode: EvalMode,
    u: &[Scalar],
    v: &mut [Scalar],
) -> Result<()> {
    if emode == EvalMode::Weight {
        let weights = basis.full_weights();
        let q = basis.num_quadrature_points();
        for elem in 0..num_elem {
            v[elem * q..(elem + 1) * q].copy_from_slice(&weights);
        }
        return Ok(());
    }

    match basis.kind() {
        BasisKind::TensorH1 {
            p_1d,
            q_1d,
            interp_1d,
            grad_1d,
            ..
        } => tensor_basis_apply(
            basis, num_elem, tmode, emode, *p_1d, *q_1d, interp_1d, grad_1d, u, v,
        ),
        BasisKind::H1 { interp, grad, .. } => match emode {
            EvalMode::Interp => dense_basis_apply(basis, num_elem, tmode, 1, interp, u, v),
            EvalMode::Grad => {
                dense_basis_apply(basis, num_elem, tmode, basis.dimension(), grad, u, v)
            }
            _ => unsupported_mode(emode),
        },
        BasisKind::Hdiv { interp, div, .. } => match emode {
            EvalMode::Interp => {
                dense_basis_apply(basis, num_elem, tmode, basis.dimension(), interp, u, v)
            }
            EvalMode::Div => dense_basis_apply(basis, num_elem, tmode, 1, div, u, v),
            _ => unsupported_mode(emode),
        },
    }
}

fn unsupported_mode(emode: EvalMode) -> Result<()> {
    Err(Error::InvalidConfiguration {
        kind: "Basis",
        message: format!("evaluation mode {:?} is not supported by this basis", emode),
    })
}

/// Apply a dense table consisting of `blocks` stacked `Q × P` blocks (one
/// per derivative direction; a single block for plain interpolation).
fn dense_basis_apply(
    basis: &Basis,
    num_elem: usize,
    tmode: TransposeMode,
    blocks: usize,
    table: &[Scalar],
    u: &[Scalar],
    v: &mut [Scalar],
) -> Result<()> {
    let p = basis.num_nodes();
    let q = basis.num_quadrature_points();
    let ncomp = basis.num_components();
    let nodal = ncomp * p;
    let quad = blocks * ncomp * q;

    for elem in 0..num_elem {
        match tmode {
            TransposeMode::NoTranspose => {
                let u_e = &u[elem * nodal..(elem + 1) * nodal];
                for block in 0..blocks {
                    let t = &table[block * q * p..(block + 1) * q * p];
                    let v_b = &mut v[elem * quad + block * ncomp * q..][..ncomp * q];
                    tensor::contract(ncomp, p, 1, q, t, TransposeMode::NoTranspose, false, u_e, v_b);
                }
            }
            TransposeMode::Transpose => {
                let v_e = &mut v[elem * nodal..(elem + 1) * nodal];
                for block in 0..blocks {
                    let t = &table[block * q * p..(block + 1) * q * p];
                    let u_b = &u[elem * quad + block * ncomp * q..][..ncomp * q];
                    tensor::contract(ncomp, q, 1, p, t, TransposeMode::Transpose, true, u_b, v_e);
                }
            }
        }
    }
    Ok(())
}

/// Apply a tensor-product basis by contracting the 1-D table along each
/// axis in turn, walking the `pre`/`post` extents.
#[allow(clippy::too_many_arguments)]
fn tensor_basis_apply(
    basis: &Basis,
    num_elem: usize,
    tmode: TransposeMode,
    emode: EvalMode,
    p_1d: usize,
    q_1d: usize,
    interp_1d: &[Scalar],
    grad_1d: &[Scalar],
    u: &[Scalar],
    v: &mut [Scalar],
) -> Result<()> {
    let dim = basis.dimension();
    let ncomp = basis.num_components();
    let p_total = basis.num_nodes();
    let q_total = basis.num_quadrature_points();
    let nodal = ncomp * p_total;
    let quad_per_dir = ncomp * q_total;

    // Scratch for the intermediate contraction results. The largest
    // intermediate has mixed extents, bounded by ncomp * max(P, Q)^dim.
    let scratch_len = ncomp * p_1d.max(q_1d).pow(dim as u32);
    let mut scratch = [vec![0.0; scratch_len], vec![0.0; scratch_len]];

    let directions = match emode {
        EvalMode::Interp => 1,
        EvalMode::Grad => dim,
        _ => return unsupported_mode(emode),
    };

    for elem in 0..num_elem {
        for dir in 0..directions {
            // Axis d of the element tensor uses the gradient table when it
            // matches the derivative direction, otherwise interpolation.
            // Axis 0 is the fastest-varying node index.
            let table_for_axis = |axis: usize| -> &[Scalar] {
                if emode == EvalMode::Grad && axis == dir {
                    grad_1d
                } else {
                    interp_1d
                }
            };

            // Walk the axes, contracting one per pass. `b_len`/`j_len` are
            // the contracted-from/into extents: P -> Q forward, Q -> P for
            // the transpose. The final pass of the transpose accumulates
            // into the nodal output so derivative directions sum up.
            let (b_len, j_len, final_add) = match tmode {
                TransposeMode::NoTranspose => (p_1d, q_1d, false),
                TransposeMode::Transpose => (q_1d, p_1d, true),
            };
            let (u_e, v_e) = match tmode {
                TransposeMode::NoTranspose => (
                    &u[elem * nodal..(elem + 1) * nodal],
                    &mut v[elem * directions * quad_per_dir + dir * quad_per_dir..]
                        [..quad_per_dir],
                ),
                TransposeMode::Transpose => (
                    &u[elem * directions * quad_per_dir + dir * quad_per_dir..][..quad_per_dir],
                    &mut v[elem * nodal..(elem + 1) * nodal],
                ),
            };

            let total_b = b_len.pow(dim as u32);
            let mut pre = ncomp * total_b / b_len;
            let mut post = 1;
            for axis in 0..dim {
                let in_len = pre * b_len * post;
                let out_len = pre * j_len * post;
                let (lo, hi) = scratch.split_at_mut(1);
                // Ping-pong between the two scratch buffers; even passes
                // write the second buffer, odd passes the first.
                let (src_buf, dst_buf) = if axis % 2 == 0 {
                    (&lo[0], &mut hi[0])
                } else {
                    (&hi[0], &mut lo[0])
                };
                let src: &[Scalar] = if axis == 0 { u_e } else { &src_buf[..in_len] };
                if axis == dim - 1 {
                    tensor::contract(
                        pre,
                        b_len,
                        post,
                        j_len,
                        table_for_axis(axis),
                        tmode,
                        final_add,
                        src,
                        &mut v_e[..],
                    );
                } else {
                    tensor::contract(
                        pre,
                        b_len,
                        post,
                        j_len,
                        table_for_axis(axis),
                        tmode,
                        false,
                        src,
                        &mut dst_buf[..out_len],
                    );
                }
                pre /= b_len;
                post *= j_len;
            }
        }
    }
    Ok(())
}

// -------------------------------------------------------------------------
// QFunction
// -------------------------------------------------------------------------

fn qfunction_build(qf: &QFunction) -> Result<()> {
    // Nothing to compile on the host; the closure must simply exist.
    if qf.host_kernel_ref().is_none() {
        return Err(Error::MissingKernel {
            name: qf.name().to_string(),
            what: "host kernel closure",
            backend: "host".to_string(),
        });
    }
    Ok(())
}

fn qfunction_apply(
    qf: &QFunction,
    num_points: usize,
    inputs: &[&[Scalar]],
    outputs: &mut [&mut [Scalar]],
) -> Result<()> {
    let kernel = qf.host_kernel_ref().ok_or_else(|| Error::MissingKernel {
        name: qf.name().to_string(),
        what: "host kernel closure",
        backend: "host".to_string(),
    })?;
    kernel(num_points, inputs, outputs).map_err(|message| Error::KernelFailure {
        name: qf.name().to_string(),
        message,
    })
}

// -------------------------------------------------------------------------
// Operator
// -------------------------------------------------------------------------

/// Where the quadrature-point data of one input field comes from during an
/// apply call.
enum QuadSource {
    /// Fixed auxiliary vectors and quadrature weights, computed once at
    /// operator compile time.
    Precomputed(Vec<Scalar>),
    /// Shared quadrature weights (identical for every element).
    Weights(Vec<Scalar>),
    /// The active input, recomputed every apply.
    Active,
}

struct HostOperatorData {
    q_in: Vec<QuadSource>,
    e_active: Vector,
    q_active: Vec<Scalar>,
    e_out: Vector,
    q_out: Vec<Scalar>,
}

fn operator_compile(inner: &mut OperatorInner) -> Result<()> {
    let plan = inner.plan.as_ref().expect("compile requires a plan").clone();
    let num_elem = plan.num_elem;
    let num_qpts = plan.num_qpts;
    log::debug!(
        "operator '{}': preparing host workspaces for {} elements, {} quadrature points",
        plan.qf.name(),
        num_elem,
        num_qpts
    );

    let mut q_in = Vec::with_capacity(plan.inputs.len());
    for field in &plan.inputs {
        let source = match (&field.vector, field.eval_mode) {
            (VectorSpec::None, EvalMode::Weight) => {
                let basis = field.basis.as_ref().expect("validated weight field");
                QuadSource::Weights(basis.full_weights())
            }
            (VectorSpec::Fixed(vector), _) => {
                QuadSource::Precomputed(gather_to_quadrature(field, num_elem, num_qpts, vector)?)
            }
            (VectorSpec::Active, _) => QuadSource::Active,
            (VectorSpec::None, _) => {
                return Err(Error::InvalidField {
                    name: field.name.clone(),
                    message: "input field carries no vector".to_string(),
                })
            }
        };
        q_in.push(source);
    }

    let active_in = &plan.inputs[plan.active_input];
    let active_out = &plan.outputs[plan.active_output];
    let out_restriction = active_out
        .restriction
        .as_ref()
        .expect("active output has a restriction");

    inner.backend_data = Some(Box::new(HostOperatorData {
        q_in,
        e_active: Vector::new(
            active_in
                .restriction
                .as_ref()
                .expect("active input has a restriction")
                .e_size(),
        ),
        q_active: vec![0.0; num_elem * active_in.size * num_qpts],
        e_out: Vector::new(out_restriction.e_size()),
        q_out: vec![0.0; num_elem * active_out.size * num_qpts],
    }));
    Ok(())
}

/// Gather a fixed input vector all the way to quadrature-point layout.
fn gather_to_quadrature(
    field: &PlannedField,
    num_elem: usize,
    num_qpts: usize,
    vector: &Vector,
) -> Result<Vec<Scalar>> {
    let restriction = field
        .restriction
        .as_ref()
        .expect("vector-carrying field has a restriction");
    let mut e_vec = restriction.create_evector();
    restriction.apply(TransposeMode::NoTranspose, vector, &mut e_vec)?;
    match (&field.basis, field.eval_mode) {
        (None, _) => Ok(e_vec.as_slice().to_vec()),
        (Some(basis), emode) => {
            let mut q_vec = vec![0.0; num_elem * field.size * num_qpts];
            basis.apply(
                num_elem,
                TransposeMode::NoTranspose,
                emode,
                e_vec.as_slice(),
                &mut q_vec,
            )?;
            Ok(q_vec)
        }
    }
}

fn operator_apply_add(inner: &mut OperatorInner, x: &Vector, y: &mut Vector) -> Result<()> {
    let plan = inner.plan.as_ref().expect("apply requires a plan").clone();
    let data = inner
        .backend_data
        .as_mut()
        .expect("compiled operator has backend data")
        .downcast_mut::<HostOperatorData>()
        .expect("host operator data");
    apply_plan(&plan, data, x, y)
}

fn apply_plan(
    plan: &OperatorPlan,
    data: &mut HostOperatorData,
    x: &Vector,
    y: &mut Vector,
) -> Result<()> {
    let num_elem = plan.num_elem;
    let num_qpts = plan.num_qpts;

    // Gather and basis-evaluate the active input; everything else was
    // precomputed when the operator was compiled.
    let active_in = &plan.inputs[plan.active_input];
    {
        let restriction = active_in.restriction.as_ref().unwrap();
        restriction.apply(TransposeMode::NoTranspose, x, &mut data.e_active)?;
        match &active_in.basis {
            Some(basis) => basis.apply(
                num_elem,
                TransposeMode::NoTranspose,
                active_in.eval_mode,
                data.e_active.as_slice(),
                &mut data.q_active,
            )?,
            None => data.q_active.copy_from_slice(data.e_active.as_slice()),
        }
    }

    let active_out = &plan.outputs[plan.active_output];
    let out_block = active_out.size * num_qpts;

    // Pointwise physics, one element block at a time.
    {
        let HostOperatorData {
            q_in,
            q_active,
            q_out,
            ..
        } = data;
        let mut inputs: Vec<&[Scalar]> = Vec::with_capacity(plan.inputs.len());
        for elem in 0..num_elem {
            inputs.clear();
            for (field, source) in izip!(plan.inputs.iter(), q_in.iter()) {
                let block = field.size * num_qpts;
                let slice = match source {
                    QuadSource::Weights(weights) => &weights[..],
                    QuadSource::Precomputed(values) => &values[elem * block..(elem + 1) * block],
                    QuadSource::Active => &q_active[elem * block..(elem + 1) * block],
                };
                inputs.push(slice);
            }
            let out_slice = &mut q_out[elem * out_block..(elem + 1) * out_block];
            let mut outputs: [&mut [Scalar]; 1] = [out_slice];
            plan.qf.apply(num_qpts, &inputs, &mut outputs)?;
        }
    }

    // Transpose basis, then scatter-accumulate into the L-vector.
    let out_restriction = active_out.restriction.as_ref().unwrap();
    match &active_out.basis {
        Some(basis) => {
            data.e_out.set_value(0.0);
            basis.apply(
                num_elem,
                TransposeMode::Transpose,
                active_out.eval_mode,
                &data.q_out,
                data.e_out.as_mut_slice(),
            )?;
        }
        None => data.e_out.as_mut_slice().copy_from_slice(&data.q_out),
    }
    out_restriction.apply(TransposeMode::Transpose, &data.e_out, y)?;
    Ok(())
}
