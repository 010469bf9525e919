//! Element restrictions: maps between L-vectors and E-vectors.
//!
//! An *L-vector* holds one entry per (possibly multi-component) global
//! degree of freedom. An *E-vector* holds one contiguous block per element,
//! with entries duplicated at nodes shared between elements. The E-vector
//! layout is `[element][component][node]`, i.e. entry
//! `(elem * num_comp + comp) * elem_size + node`.
//!
//! Applying a restriction with [`TransposeMode::NoTranspose`] gathers an
//! L-vector into an E-vector; [`TransposeMode::Transpose`] is the adjoint
//! and *accumulates* E-vector entries back into the L-vector, since several
//! elements may contribute to the same degree of freedom.

use crate::backend::registry::ObjectKind;
use crate::backend::RestrictionOps;
use crate::error::{Error, Result};
use crate::vector::Vector;
use crate::{Context, TransposeMode};

/// Addressing mode of a restriction.
#[derive(Debug, Clone)]
pub(crate) enum RestrictionKind {
    /// L-vector entry for (node, comp, elem) is
    /// `node * strides[0] + comp * strides[1] + elem * strides[2]`.
    Strided { strides: [usize; 3] },
    /// L-vector entry for (node, comp) within element `e` is
    /// `offsets[e * elem_size + node] + comp * comp_stride`, with an
    /// optional per-entry orientation flip.
    Offsets {
        offsets: Vec<usize>,
        orients: Option<Vec<bool>>,
        transpose: TransposeAdjacency,
    },
}

/// Inverse adjacency of an offset table: for every L-vector node that occurs
/// in the forward table, the list of E-vector entry positions feeding it.
///
/// Built once at restriction creation so transpose accumulation can proceed
/// node by node without write conflicts: all contributions to one node are
/// summed locally before a single write.
#[derive(Debug, Clone)]
pub(crate) struct TransposeAdjacency {
    /// Distinct L-vector node indices, ascending.
    pub lvec_indices: Vec<usize>,
    /// CSR-style ranges into `t_indices`, one range per entry of
    /// `lvec_indices`.
    pub t_offsets: Vec<usize>,
    /// Positions into the forward offset table (`elem * elem_size + node`).
    pub t_indices: Vec<usize>,
}

impl TransposeAdjacency {
    fn build(offsets: &[usize]) -> Self {
        let mut pairs: Vec<(usize, usize)> = offsets
            .iter()
            .copied()
            .enumerate()
            .map(|(position, node)| (node, position))
            .collect();
        pairs.sort_unstable();

        let mut lvec_indices = Vec::new();
        let mut t_offsets = vec![0];
        let mut t_indices = Vec::with_capacity(pairs.len());
        for (node, position) in pairs {
            if lvec_indices.last() != Some(&node) {
                if !lvec_indices.is_empty() {
                    t_offsets.push(t_indices.len());
                }
                lvec_indices.push(node);
            }
            t_indices.push(position);
        }
        t_offsets.push(t_indices.len());
        if lvec_indices.is_empty() {
            // Degenerate empty restriction; keep the offsets array well formed.
            t_offsets = vec![0];
        }

        Self {
            lvec_indices,
            t_offsets,
            t_indices,
        }
    }
}

/// A map between the L-vector and E-vector layouts of one discretization.
///
/// Immutable after creation. Restrictions may be shared (read-only) between
/// any number of operators.
pub struct ElemRestriction {
    num_elem: usize,
    elem_size: usize,
    num_comp: usize,
    comp_stride: usize,
    l_size: usize,
    kind: RestrictionKind,
    ops: RestrictionOps,
}

impl ElemRestriction {
    /// Create a restriction addressed through an offset table.
    ///
    /// `offsets` has length `num_elem * elem_size` and holds, for each
    /// element-local node, the L-vector index of its first component;
    /// component `c` of that node lives at `offset + c * comp_stride`.
    /// Offsets must be pre-decoded: any boundary-condition encoding has to
    /// be resolved by the caller before this point.
    ///
    /// Every resolved index is validated against `l_size` here; an
    /// out-of-bounds entry is a configuration error at creation time, never
    /// at apply time.
    pub fn create(
        ctx: &Context,
        num_elem: usize,
        elem_size: usize,
        num_comp: usize,
        comp_stride: usize,
        l_size: usize,
        offsets: &[usize],
    ) -> Result<Self> {
        Self::create_offsets_impl(
            ctx, num_elem, elem_size, num_comp, comp_stride, l_size, offsets, None,
        )
    }

    /// Create an offset restriction with per-entry orientation.
    ///
    /// `orients` parallels `offsets`; a `true` entry flips the sign of the
    /// value on both gather and scatter. This reconciles degrees of freedom
    /// whose element-local direction convention disagrees with the global
    /// numbering, e.g. H(div) face normals.
    pub fn create_oriented(
        ctx: &Context,
        num_elem: usize,
        elem_size: usize,
        num_comp: usize,
        comp_stride: usize,
        l_size: usize,
        offsets: &[usize],
        orients: &[bool],
    ) -> Result<Self> {
        if orients.len() != offsets.len() {
            return Err(Error::LengthMismatch {
                kind: "ElemRestriction",
                operation: "CreateOriented",
                expected: offsets.len(),
                actual: orients.len(),
            });
        }
        Self::create_offsets_impl(
            ctx,
            num_elem,
            elem_size,
            num_comp,
            comp_stride,
            l_size,
            offsets,
            Some(orients.to_vec()),
        )
    }

    /// Create a strided restriction.
    ///
    /// The L-vector entry for (node, comp, elem) is
    /// `node * strides[0] + comp * strides[1] + elem * strides[2]`. Strided
    /// restrictions address regular data such as per-quadrature-point
    /// auxiliary fields; no entry is shared, so the transpose needs no
    /// conflict resolution.
    pub fn create_strided(
        ctx: &Context,
        num_elem: usize,
        elem_size: usize,
        num_comp: usize,
        l_size: usize,
        strides: [usize; 3],
    ) -> Result<Self> {
        if num_elem * elem_size * num_comp > 0 {
            let max_index = (elem_size - 1) * strides[0]
                + (num_comp - 1) * strides[1]
                + (num_elem - 1) * strides[2];
            if max_index >= l_size {
                return Err(Error::InvalidConfiguration {
                    kind: "ElemRestriction",
                    message: format!(
                        "strides {:?} address index {} outside L-vector length {}",
                        strides, max_index, l_size
                    ),
                });
            }
        }
        let ops = ctx
            .registry()
            .resolve(ObjectKind::ElemRestriction, "Apply")
            .map(|apply| RestrictionOps { apply })?;
        Ok(Self {
            num_elem,
            elem_size,
            num_comp,
            comp_stride: 1,
            l_size,
            kind: RestrictionKind::Strided { strides },
            ops,
        })
    }

    /// Strided restriction with the default layout for backend-owned data:
    /// nodes contiguous within an element, components next, elements last.
    pub fn create_strided_default(
        ctx: &Context,
        num_elem: usize,
        elem_size: usize,
        num_comp: usize,
        l_size: usize,
    ) -> Result<Self> {
        Self::create_strided(
            ctx,
            num_elem,
            elem_size,
            num_comp,
            l_size,
            [1, elem_size, elem_size * num_comp],
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn create_offsets_impl(
        ctx: &Context,
        num_elem: usize,
        elem_size: usize,
        num_comp: usize,
        comp_stride: usize,
        l_size: usize,
        offsets: &[usize],
        orients: Option<Vec<bool>>,
    ) -> Result<Self> {
        if offsets.len() != num_elem * elem_size {
            return Err(Error::LengthMismatch {
                kind: "ElemRestriction",
                operation: "Create",
                expected: num_elem * elem_size,
                actual: offsets.len(),
            });
        }
        for &offset in offsets {
            for comp in 0..num_comp.max(1) {
                let resolved = offset + comp * comp_stride;
                if resolved >= l_size {
                    return Err(Error::OffsetOutOfBounds {
                        offset,
                        component: comp,
                        resolved,
                        l_size,
                    });
                }
            }
        }
        let transpose = TransposeAdjacency::build(offsets);
        let ops = ctx
            .registry()
            .resolve(ObjectKind::ElemRestriction, "Apply")
            .map(|apply| RestrictionOps { apply })?;
        Ok(Self {
            num_elem,
            elem_size,
            num_comp,
            comp_stride,
            l_size,
            kind: RestrictionKind::Offsets {
                offsets: offsets.to_vec(),
                orients,
                transpose,
            },
            ops,
        })
    }

    /// Restrict an L-vector to an E-vector, or apply the transpose.
    ///
    /// `NoTranspose` expects `u` of length [`Self::l_size`] and overwrites
    /// `v` of length [`Self::e_size`]. `Transpose` expects the converse and
    /// *accumulates* into `v`.
    pub fn apply(&self, tmode: TransposeMode, u: &Vector, v: &mut Vector) -> Result<()> {
        let (expected_u, expected_v) = match tmode {
            TransposeMode::NoTranspose => (self.l_size, self.e_size()),
            TransposeMode::Transpose => (self.e_size(), self.l_size),
        };
        if u.len() != expected_u {
            return Err(Error::LengthMismatch {
                kind: "ElemRestriction",
                operation: "Apply",
                expected: expected_u,
                actual: u.len(),
            });
        }
        if v.len() != expected_v {
            return Err(Error::LengthMismatch {
                kind: "ElemRestriction",
                operation: "Apply",
                expected: expected_v,
                actual: v.len(),
            });
        }
        (self.ops.apply.clone())(self, tmode, u, v)
    }

    /// The multiplicity of each L-vector entry: how many E-vector entries
    /// feed it under the transpose map.
    pub fn multiplicity(&self) -> Result<Vector> {
        let mut ones = self.create_evector();
        ones.set_value(1.0);
        let mut mult = self.create_lvector();
        self.apply(TransposeMode::Transpose, &ones, &mut mult)?;
        Ok(mult)
    }

    /// A zero L-vector of the right length for this restriction.
    pub fn create_lvector(&self) -> Vector {
        Vector::new(self.l_size)
    }

    /// A zero E-vector of the right length for this restriction.
    pub fn create_evector(&self) -> Vector {
        Vector::new(self.e_size())
    }

    pub fn num_elements(&self) -> usize {
        self.num_elem
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn num_components(&self) -> usize {
        self.num_comp
    }

    pub fn comp_stride(&self) -> usize {
        self.comp_stride
    }

    pub fn l_size(&self) -> usize {
        self.l_size
    }

    /// Total E-vector length: `num_elem * elem_size * num_comp`.
    pub fn e_size(&self) -> usize {
        self.num_elem * self.elem_size * self.num_comp
    }

    pub fn is_oriented(&self) -> bool {
        matches!(
            &self.kind,
            RestrictionKind::Offsets {
                orients: Some(_),
                ..
            }
        )
    }

    pub fn is_strided(&self) -> bool {
        matches!(&self.kind, RestrictionKind::Strided { .. })
    }

    pub(crate) fn kind(&self) -> &RestrictionKind {
        &self.kind
    }
}

impl std::fmt::Debug for ElemRestriction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElemRestriction")
            .field("num_elem", &self.num_elem)
            .field("elem_size", &self.elem_size)
            .field("num_comp", &self.num_comp)
            .field("l_size", &self.l_size)
            .field("strided", &self.is_strided())
            .field("oriented", &self.is_oriented())
            .finish()
    }
}
