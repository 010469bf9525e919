//! Basis tables relating nodal values and quadrature-point values.
//!
//! A basis is defined by dense tables. Tensor-product H1 bases store
//! one-dimensional interpolation/gradient tables and are applied axis by
//! axis through the tensor contraction engine; generic H1 and H(div) bases
//! store full `num_qpts × num_nodes`-shaped tables. All tables are row-major
//! with quadrature points as rows.
//!
//! Applying a basis with [`TransposeMode::NoTranspose`] takes nodal data
//! (layout `[elem][comp][node]`) to quadrature data (layout
//! `[elem][q_comp][qpt]`); the transpose direction *accumulates* nodal
//! contributions, so callers zero the destination once before composing
//! transposed applications.

use crate::backend::registry::ObjectKind;
use crate::backend::BasisOps;
use crate::error::{Error, Result};
use crate::{quadrature, Context, EvalMode, Scalar, TransposeMode};

#[derive(Debug, Clone)]
pub(crate) enum BasisKind {
    TensorH1 {
        p_1d: usize,
        q_1d: usize,
        /// `q_1d × p_1d`, row-major.
        interp_1d: Vec<Scalar>,
        /// `q_1d × p_1d`, row-major.
        grad_1d: Vec<Scalar>,
        q_ref_1d: Vec<Scalar>,
        q_weight_1d: Vec<Scalar>,
    },
    H1 {
        /// `num_qpts × num_nodes`.
        interp: Vec<Scalar>,
        /// `(dim * num_qpts) × num_nodes`, direction-major.
        grad: Vec<Scalar>,
        q_weights: Vec<Scalar>,
    },
    Hdiv {
        /// `(dim * num_qpts) × num_nodes`, vector-valued interpolation.
        interp: Vec<Scalar>,
        /// `num_qpts × num_nodes`.
        div: Vec<Scalar>,
        q_weights: Vec<Scalar>,
    },
}

/// Interpolation/gradient/divergence tables for one element topology.
///
/// Immutable after creation; may be shared between operators.
pub struct Basis {
    dim: usize,
    num_comp: usize,
    num_nodes: usize,
    num_qpts: usize,
    kind: BasisKind,
    ops: BasisOps,
}

impl Basis {
    /// Create a tensor-product H1 basis from one-dimensional tables.
    ///
    /// `interp_1d` and `grad_1d` are `q_1d × p_1d` row-major; `q_ref_1d` and
    /// `q_weight_1d` hold the quadrature points and weights on `[-1, 1]`.
    pub fn create_tensor_h1(
        ctx: &Context,
        dim: usize,
        num_comp: usize,
        p_1d: usize,
        q_1d: usize,
        interp_1d: &[Scalar],
        grad_1d: &[Scalar],
        q_ref_1d: &[Scalar],
        q_weight_1d: &[Scalar],
    ) -> Result<Self> {
        if dim == 0 || dim > 3 {
            return Err(Error::InvalidConfiguration {
                kind: "Basis",
                message: format!("unsupported dimension {}", dim),
            });
        }
        check_table_len("interp_1d", interp_1d.len(), q_1d * p_1d)?;
        check_table_len("grad_1d", grad_1d.len(), q_1d * p_1d)?;
        check_table_len("q_ref_1d", q_ref_1d.len(), q_1d)?;
        check_table_len("q_weight_1d", q_weight_1d.len(), q_1d)?;

        let ops = resolve_ops(ctx)?;
        Ok(Self {
            dim,
            num_comp,
            num_nodes: p_1d.pow(dim as u32),
            num_qpts: q_1d.pow(dim as u32),
            kind: BasisKind::TensorH1 {
                p_1d,
                q_1d,
                interp_1d: interp_1d.to_vec(),
                grad_1d: grad_1d.to_vec(),
                q_ref_1d: q_ref_1d.to_vec(),
                q_weight_1d: q_weight_1d.to_vec(),
            },
            ops,
        })
    }

    /// Create a tensor-product Lagrange basis of `p` nodes and a `q`-point
    /// Gauss rule per dimension.
    ///
    /// Nodes are spaced at Chebyshev–Gauss–Lobatto points, which keeps the
    /// interpolation well conditioned at higher orders.
    pub fn create_tensor_h1_lagrange(
        ctx: &Context,
        dim: usize,
        num_comp: usize,
        p: usize,
        q: usize,
    ) -> Result<Self> {
        let nodes = quadrature::lobatto_nodes(p);
        let (q_weight_1d, q_ref_1d) = quadrature::gauss(q);

        let mut interp_1d = vec![0.0; q * p];
        let mut grad_1d = vec![0.0; q * p];
        for (j, &x) in q_ref_1d.iter().enumerate() {
            for i in 0..p {
                interp_1d[j * p + i] = lagrange_value(&nodes, i, x);
                grad_1d[j * p + i] = lagrange_derivative(&nodes, i, x);
            }
        }

        Self::create_tensor_h1(
            ctx,
            dim,
            num_comp,
            p,
            q,
            &interp_1d,
            &grad_1d,
            &q_ref_1d,
            &q_weight_1d,
        )
    }

    /// Create a generic H1 basis from full tables.
    ///
    /// `interp` is `num_qpts × num_nodes`; `grad` is
    /// `(dim * num_qpts) × num_nodes` with the derivative direction as the
    /// slowest index.
    pub fn create_h1(
        ctx: &Context,
        dim: usize,
        num_comp: usize,
        num_nodes: usize,
        num_qpts: usize,
        interp: &[Scalar],
        grad: &[Scalar],
        q_weights: &[Scalar],
    ) -> Result<Self> {
        check_table_len("interp", interp.len(), num_qpts * num_nodes)?;
        check_table_len("grad", grad.len(), dim * num_qpts * num_nodes)?;
        check_table_len("q_weights", q_weights.len(), num_qpts)?;
        let ops = resolve_ops(ctx)?;
        Ok(Self {
            dim,
            num_comp,
            num_nodes,
            num_qpts,
            kind: BasisKind::H1 {
                interp: interp.to_vec(),
                grad: grad.to_vec(),
                q_weights: q_weights.to_vec(),
            },
            ops,
        })
    }

    /// Create an H(div)-conforming basis from full tables.
    ///
    /// `interp` is `(dim * num_qpts) × num_nodes` (vector-valued basis
    /// functions, direction-major); `div` is `num_qpts × num_nodes`.
    pub fn create_hdiv(
        ctx: &Context,
        dim: usize,
        num_comp: usize,
        num_nodes: usize,
        num_qpts: usize,
        interp: &[Scalar],
        div: &[Scalar],
        q_weights: &[Scalar],
    ) -> Result<Self> {
        check_table_len("interp", interp.len(), dim * num_qpts * num_nodes)?;
        check_table_len("div", div.len(), num_qpts * num_nodes)?;
        check_table_len("q_weights", q_weights.len(), num_qpts)?;
        let ops = resolve_ops(ctx)?;
        Ok(Self {
            dim,
            num_comp,
            num_nodes,
            num_qpts,
            kind: BasisKind::Hdiv {
                interp: interp.to_vec(),
                div: div.to_vec(),
                q_weights: q_weights.to_vec(),
            },
            ops,
        })
    }

    /// Apply the basis to `num_elem` contiguous element blocks.
    ///
    /// `NoTranspose` maps nodal blocks of `num_comp * num_nodes` scalars to
    /// quadrature blocks of [`Self::field_size`]` * num_qpts` scalars and
    /// overwrites `v`; `Transpose` maps the other way and accumulates.
    /// `Weight` fills `v` with quadrature weights and ignores `u`.
    pub fn apply(
        &self,
        num_elem: usize,
        tmode: TransposeMode,
        emode: EvalMode,
        u: &[Scalar],
        v: &mut [Scalar],
    ) -> Result<()> {
        if emode == EvalMode::Weight {
            if tmode == TransposeMode::Transpose {
                return Err(Error::InvalidConfiguration {
                    kind: "Basis",
                    message: "weight evaluation has no transpose".to_string(),
                });
            }
            if v.len() != num_elem * self.num_qpts {
                return Err(Error::LengthMismatch {
                    kind: "Basis",
                    operation: "Apply",
                    expected: num_elem * self.num_qpts,
                    actual: v.len(),
                });
            }
        } else {
            let nodal = num_elem * self.num_comp * self.num_nodes;
            let quad = num_elem * self.field_size(emode)? * self.num_qpts;
            let (expected_u, expected_v) = match tmode {
                TransposeMode::NoTranspose => (nodal, quad),
                TransposeMode::Transpose => (quad, nodal),
            };
            if u.len() != expected_u {
                return Err(Error::LengthMismatch {
                    kind: "Basis",
                    operation: "Apply",
                    expected: expected_u,
                    actual: u.len(),
                });
            }
            if v.len() != expected_v {
                return Err(Error::LengthMismatch {
                    kind: "Basis",
                    operation: "Apply",
                    expected: expected_v,
                    actual: v.len(),
                });
            }
        }
        (self.ops.apply.clone())(self, num_elem, tmode, emode, u, v)
    }

    /// Scalars per quadrature point produced by evaluating this basis in the
    /// given mode.
    pub fn field_size(&self, emode: EvalMode) -> Result<usize> {
        let size = match (&self.kind, emode) {
            (_, EvalMode::Weight) => 1,
            (BasisKind::TensorH1 { .. } | BasisKind::H1 { .. }, EvalMode::Interp) => self.num_comp,
            (BasisKind::TensorH1 { .. } | BasisKind::H1 { .. }, EvalMode::Grad) => {
                self.num_comp * self.dim
            }
            (BasisKind::Hdiv { .. }, EvalMode::Interp) => self.num_comp * self.dim,
            (BasisKind::Hdiv { .. }, EvalMode::Div) => self.num_comp,
            (_, mode) => {
                return Err(Error::InvalidConfiguration {
                    kind: "Basis",
                    message: format!("evaluation mode {:?} is not supported by this basis", mode),
                })
            }
        };
        Ok(size)
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn num_components(&self) -> usize {
        self.num_comp
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_quadrature_points(&self) -> usize {
        self.num_qpts
    }

    /// Quadrature point coordinates of the 1-D rule, for tensor-product
    /// bases only.
    pub fn q_ref_1d(&self) -> Option<&[Scalar]> {
        match &self.kind {
            BasisKind::TensorH1 { q_ref_1d, .. } => Some(q_ref_1d),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &BasisKind {
        &self.kind
    }

    /// Row count of the dense interpolation table.
    pub(crate) fn interp_rows(&self) -> usize {
        match &self.kind {
            BasisKind::TensorH1 { .. } | BasisKind::H1 { .. } => self.num_qpts,
            BasisKind::Hdiv { .. } => self.dim * self.num_qpts,
        }
    }

    /// Row count of the dense gradient (H1) or divergence (H(div)) table.
    pub(crate) fn deriv_rows(&self) -> usize {
        match &self.kind {
            BasisKind::TensorH1 { .. } | BasisKind::H1 { .. } => self.dim * self.num_qpts,
            BasisKind::Hdiv { .. } => self.num_qpts,
        }
    }

    /// The full interpolation table for this basis, `rows × num_nodes`
    /// row-major, where `rows = field_size(Interp) / num_comp * num_qpts`.
    /// Tensor-product tables are collapsed to their dense form.
    pub(crate) fn dense_interp(&self) -> Vec<Scalar> {
        match &self.kind {
            BasisKind::TensorH1 {
                p_1d,
                q_1d,
                interp_1d,
                ..
            } => collapse_tensor(self.dim, *p_1d, *q_1d, |_, qd, nd| {
                interp_1d[qd * p_1d + nd]
            }),
            BasisKind::H1 { interp, .. } | BasisKind::Hdiv { interp, .. } => interp.clone(),
        }
    }

    /// The full gradient table, `(dim * num_qpts) × num_nodes` row-major,
    /// or the divergence table for H(div) bases (`num_qpts × num_nodes`).
    pub(crate) fn dense_derivative(&self) -> Vec<Scalar> {
        match &self.kind {
            BasisKind::TensorH1 {
                p_1d,
                q_1d,
                interp_1d,
                grad_1d,
                ..
            } => {
                let q = self.num_qpts;
                let p = self.num_nodes;
                let mut table = vec![0.0; self.dim * q * p];
                for d in 0..self.dim {
                    let block = collapse_tensor(self.dim, *p_1d, *q_1d, |axis, qd, nd| {
                        if axis == d {
                            grad_1d[qd * p_1d + nd]
                        } else {
                            interp_1d[qd * p_1d + nd]
                        }
                    });
                    table[d * q * p..(d + 1) * q * p].copy_from_slice(&block);
                }
                table
            }
            BasisKind::H1 { grad, .. } => grad.clone(),
            BasisKind::Hdiv { div, .. } => div.clone(),
        }
    }

    /// Quadrature weights for the full (tensor-product) rule, length
    /// `num_qpts`.
    pub(crate) fn full_weights(&self) -> Vec<Scalar> {
        match &self.kind {
            BasisKind::TensorH1 {
                q_1d, q_weight_1d, ..
            } => {
                let mut weights = vec![1.0; self.num_qpts];
                for (q, w) in weights.iter_mut().enumerate() {
                    let mut rem = q;
                    for _ in 0..self.dim {
                        *w *= q_weight_1d[rem % q_1d];
                        rem /= q_1d;
                    }
                }
                weights
            }
            BasisKind::H1 { q_weights, .. } | BasisKind::Hdiv { q_weights, .. } => {
                q_weights.clone()
            }
        }
    }
}

impl std::fmt::Debug for Basis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Basis")
            .field("dim", &self.dim)
            .field("num_comp", &self.num_comp)
            .field("num_nodes", &self.num_nodes)
            .field("num_qpts", &self.num_qpts)
            .finish()
    }
}

fn resolve_ops(ctx: &Context) -> Result<BasisOps> {
    ctx.registry()
        .resolve(ObjectKind::Basis, "Apply")
        .map(|apply| BasisOps { apply })
}

fn check_table_len(name: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(Error::InvalidConfiguration {
            kind: "Basis",
            message: format!(
                "table '{}' has length {}, expected {}",
                name, actual, expected
            ),
        });
    }
    Ok(())
}

/// Collapse a tensor-product table to its dense `num_qpts × num_nodes` form.
/// `entry(axis, q_1d_index, node_1d_index)` supplies the 1-D factor per axis.
fn collapse_tensor(
    dim: usize,
    p_1d: usize,
    q_1d: usize,
    entry: impl Fn(usize, usize, usize) -> Scalar,
) -> Vec<Scalar> {
    let p = p_1d.pow(dim as u32);
    let q = q_1d.pow(dim as u32);
    let mut table = vec![0.0; q * p];
    for iq in 0..q {
        for ip in 0..p {
            let mut value = 1.0;
            let (mut qr, mut pr) = (iq, ip);
            for axis in 0..dim {
                value *= entry(axis, qr % q_1d, pr % p_1d);
                qr /= q_1d;
                pr /= p_1d;
            }
            table[iq * p + ip] = value;
        }
    }
    table
}

/// Value of the `i`-th Lagrange polynomial for the given nodes at `x`.
fn lagrange_value(nodes: &[Scalar], i: usize, x: Scalar) -> Scalar {
    let mut value = 1.0;
    for (k, &xk) in nodes.iter().enumerate() {
        if k != i {
            value *= (x - xk) / (nodes[i] - xk);
        }
    }
    value
}

/// Derivative of the `i`-th Lagrange polynomial at `x`.
fn lagrange_derivative(nodes: &[Scalar], i: usize, x: Scalar) -> Scalar {
    let mut sum = 0.0;
    for (m, &xm) in nodes.iter().enumerate() {
        if m == i {
            continue;
        }
        let mut term = 1.0 / (nodes[i] - xm);
        for (k, &xk) in nodes.iter().enumerate() {
            if k != i && k != m {
                term *= (x - xk) / (nodes[i] - xk);
            }
        }
        sum += term;
    }
    sum
}
