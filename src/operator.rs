//! Operators: the composition of restrictions, bases and a QFunction.
//!
//! An operator binds every field its QFunction declares to an element
//! restriction (or none, for quadrature weights), a basis (or none, for
//! collocated data), and a vector role. The *active* input and output
//! vectors are supplied fresh at each apply call; *fixed* vectors are bound
//! once at setup time.
//!
//! Operators move through three states: `Unbuilt` (fields may still be
//! bound), `Built` (bindings validated, compilation pending) and `Compiled`
//! (backend artifacts exist; bindings are frozen). The first apply call
//! drives the operator through the remaining states as a side effect.

use crate::backend::registry::ObjectKind;
use crate::backend::OperatorOps;
use crate::basis::Basis;
use crate::error::{Error, Result};
use crate::qfunction::QFunction;
use crate::restriction::ElemRestriction;
use crate::vector::Vector;
use crate::{Context, EvalMode};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

/// The vector role of one operator field.
#[derive(Clone)]
pub enum VectorSpec {
    /// Supplied fresh at each apply call (the operator input or output).
    Active,
    /// No vector data: quadrature-weight fields.
    None,
    /// A fixed auxiliary vector bound at setup time, read-only.
    Fixed(Arc<Vector>),
}

impl std::fmt::Debug for VectorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorSpec::Active => write!(f, "Active"),
            VectorSpec::None => write!(f, "None"),
            VectorSpec::Fixed(v) => write!(f, "Fixed(len = {})", v.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    Unbuilt,
    Built,
    Compiled,
}

/// A field binding as declared through [`Operator::set_field`].
#[derive(Clone)]
pub(crate) struct FieldBinding {
    pub name: String,
    pub restriction: Option<Arc<ElemRestriction>>,
    pub basis: Option<Arc<Basis>>,
    pub vector: VectorSpec,
}

/// A validated field of a built operator, in QFunction declaration order.
#[derive(Clone)]
pub(crate) struct PlannedField {
    pub name: String,
    pub size: usize,
    pub eval_mode: EvalMode,
    pub restriction: Option<Arc<ElemRestriction>>,
    pub basis: Option<Arc<Basis>>,
    pub vector: VectorSpec,
}

/// The validated, immutable description of a built operator.
pub(crate) struct OperatorPlan {
    pub qf: Arc<QFunction>,
    pub num_elem: usize,
    pub num_qpts: usize,
    pub inputs: Vec<PlannedField>,
    pub outputs: Vec<PlannedField>,
    pub active_input: usize,
    pub active_output: usize,
    pub signature: OperatorSignature,
}

/// Restriction shape as it enters the operator signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum RestrictionSig {
    Strided { strides: [usize; 3] },
    Offsets { comp_stride: usize, oriented: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BasisSig {
    pub num_nodes: usize,
    pub num_qpts: usize,
    pub dim: usize,
    /// Row count of the dense interpolation table.
    pub interp_rows: usize,
    /// Row count of the dense gradient/divergence table.
    pub deriv_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FieldSig {
    pub size: usize,
    pub eval_mode: EvalMode,
    pub elem_size: usize,
    pub num_comp: usize,
    pub restriction: Option<RestrictionSig>,
    pub basis: Option<BasisSig>,
    /// Canonical slot of the restriction object, in order of first
    /// appearance across all fields; fields sharing a restriction share the
    /// slot. Part of the signature because shared objects share device
    /// buffers in generated kernels.
    pub restr_slot: Option<usize>,
    pub basis_slot: Option<usize>,
}

/// The full shape signature of an operator.
///
/// Two operators with equal signatures execute the same compiled kernel;
/// the element count is deliberately excluded (it is a runtime parameter),
/// as are the actual offset tables and basis entries (device buffers).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct OperatorSignature {
    pub qf_name: String,
    pub source_hash: u64,
    pub num_qpts: usize,
    pub dim: usize,
    pub inputs: Vec<FieldSig>,
    pub outputs: Vec<FieldSig>,
}

pub(crate) struct OperatorInner {
    pub qf: Arc<QFunction>,
    pub bindings: Vec<FieldBinding>,
    pub state: OperatorState,
    pub plan: Option<Arc<OperatorPlan>>,
    /// Backend-owned artifacts (workspaces, compiled pipelines), created by
    /// the backend's compile operation.
    pub backend_data: Option<Box<dyn Any + Send>>,
}

/// A matrix-free operator.
///
/// Created once per discretization level, applied many times. Holds shared
/// (read-only) references to its restrictions, bases and QFunction and
/// exclusively owns any compiled backend artifacts.
pub struct Operator {
    inner: Mutex<OperatorInner>,
    ops: OperatorOps,
}

impl Operator {
    pub fn create(ctx: &Context, qf: &Arc<QFunction>) -> Result<Self> {
        let ops = OperatorOps {
            compile: ctx.registry().resolve(ObjectKind::Operator, "Compile")?,
            apply_add: ctx.registry().resolve(ObjectKind::Operator, "ApplyAdd")?,
        };
        Ok(Self {
            inner: Mutex::new(OperatorInner {
                qf: Arc::clone(qf),
                bindings: Vec::new(),
                state: OperatorState::Unbuilt,
                plan: None,
                backend_data: None,
            }),
            ops,
        })
    }

    /// Bind one field by QFunction field name.
    ///
    /// Weight fields take no restriction and no vector; collocated fields
    /// take no basis. Rebinding a name replaces the earlier binding.
    /// Rejected once the operator is compiled.
    pub fn set_field(
        &self,
        name: &str,
        restriction: Option<&Arc<ElemRestriction>>,
        basis: Option<&Arc<Basis>>,
        vector: VectorSpec,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            OperatorState::Compiled => {
                return Err(Error::OperatorFrozen {
                    name: name.to_string(),
                })
            }
            OperatorState::Built => {
                // Mutating a built-but-uncompiled operator reopens it.
                inner.state = OperatorState::Unbuilt;
                inner.plan = None;
            }
            OperatorState::Unbuilt => {}
        }
        let binding = FieldBinding {
            name: name.to_string(),
            restriction: restriction.map(Arc::clone),
            basis: basis.map(Arc::clone),
            vector,
        };
        if let Some(existing) = inner.bindings.iter_mut().find(|b| b.name == name) {
            *existing = binding;
        } else {
            inner.bindings.push(binding);
        }
        Ok(())
    }

    /// Validate bindings and build the plan without applying. Called
    /// implicitly by the first apply.
    pub fn build(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_built(&mut inner)
    }

    pub fn state(&self) -> OperatorState {
        self.inner.lock().state
    }

    /// Apply the operator: `y = A(x)`.
    pub fn apply(&self, x: &Vector, y: &mut Vector) -> Result<()> {
        y.set_value(0.0);
        self.apply_add(x, y)
    }

    /// Apply the operator and accumulate: `y += A(x)`.
    ///
    /// The first call builds and compiles as a side effect; the caller must
    /// not mutate `x` or `y` concurrently for the duration of the call.
    pub fn apply_add(&self, x: &Vector, y: &mut Vector) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_built(&mut inner)?;
        if inner.state == OperatorState::Built {
            (self.ops.compile.clone())(&mut inner)?;
            inner.state = OperatorState::Compiled;
        }

        let plan = inner.plan.clone().expect("built operator has a plan");
        let expected_in = plan.inputs[plan.active_input]
            .restriction
            .as_ref()
            .expect("active input has a restriction")
            .l_size();
        let expected_out = plan.outputs[plan.active_output]
            .restriction
            .as_ref()
            .expect("active output has a restriction")
            .l_size();
        if x.len() != expected_in {
            return Err(Error::LengthMismatch {
                kind: "Operator",
                operation: "Apply",
                expected: expected_in,
                actual: x.len(),
            });
        }
        if y.len() != expected_out {
            return Err(Error::LengthMismatch {
                kind: "Operator",
                operation: "Apply",
                expected: expected_out,
                actual: y.len(),
            });
        }

        (self.ops.apply_add.clone())(&mut inner, x, y)
    }
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Operator")
            .field("qfunction", &inner.qf.name())
            .field("state", &inner.state)
            .field("num_fields", &inner.bindings.len())
            .finish()
    }
}

/// A sum of sub-operators sharing their active vectors.
pub struct CompositeOperator {
    sub: Vec<Arc<Operator>>,
}

impl CompositeOperator {
    pub fn create(sub: Vec<Arc<Operator>>) -> Result<Self> {
        if sub.is_empty() {
            return Err(Error::InvalidConfiguration {
                kind: "Operator",
                message: "composite operator requires at least one sub-operator".to_string(),
            });
        }
        Ok(Self { sub })
    }

    pub fn sub_operators(&self) -> &[Arc<Operator>] {
        &self.sub
    }

    /// `y = Σ_k A_k(x)`: the output is zeroed once, then every
    /// sub-operator accumulates into it.
    pub fn apply(&self, x: &Vector, y: &mut Vector) -> Result<()> {
        y.set_value(0.0);
        self.apply_add(x, y)
    }

    pub fn apply_add(&self, x: &Vector, y: &mut Vector) -> Result<()> {
        for op in &self.sub {
            op.apply_add(x, y)?;
        }
        Ok(())
    }
}

fn ensure_built(inner: &mut OperatorInner) -> Result<()> {
    if inner.state != OperatorState::Unbuilt {
        return Ok(());
    }
    let plan = build_plan(&inner.qf, &inner.bindings)?;
    inner.plan = Some(Arc::new(plan));
    inner.state = OperatorState::Built;
    Ok(())
}

fn build_plan(qf: &Arc<QFunction>, bindings: &[FieldBinding]) -> Result<OperatorPlan> {
    // Every bound name must correspond to a QFunction field and vice versa.
    for binding in bindings {
        let known = qf
            .inputs()
            .iter()
            .chain(qf.outputs())
            .any(|f| f.name() == binding.name);
        if !known {
            return Err(Error::FieldSetMismatch {
                qfunction: qf.name().to_string(),
                message: format!("bound field '{}' is not declared", binding.name),
            });
        }
    }

    let plan_fields = |fields: &[crate::qfunction::QFunctionField]| -> Result<Vec<PlannedField>> {
        fields
            .iter()
            .map(|field| {
                let binding = bindings
                    .iter()
                    .find(|b| b.name == field.name())
                    .ok_or_else(|| Error::FieldSetMismatch {
                        qfunction: qf.name().to_string(),
                        message: format!("field '{}' has no binding", field.name()),
                    })?;
                Ok(PlannedField {
                    name: field.name().to_string(),
                    size: field.size(),
                    eval_mode: field.eval_mode(),
                    restriction: binding.restriction.clone(),
                    basis: binding.basis.clone(),
                    vector: binding.vector.clone(),
                })
            })
            .collect()
    };
    let inputs = plan_fields(qf.inputs())?;
    let outputs = plan_fields(qf.outputs())?;

    // Element count must be consistent across all restrictions.
    let mut num_elem = None;
    for field in inputs.iter().chain(&outputs) {
        if let Some(r) = &field.restriction {
            match num_elem {
                None => num_elem = Some(r.num_elements()),
                Some(n) if n != r.num_elements() => {
                    return Err(Error::InvalidField {
                        name: field.name.clone(),
                        message: format!(
                            "restriction has {} elements, other fields have {}",
                            r.num_elements(),
                            n
                        ),
                    })
                }
                Some(_) => {}
            }
        }
    }
    let num_elem = num_elem.ok_or_else(|| Error::InvalidConfiguration {
        kind: "Operator",
        message: "at least one field must carry a restriction".to_string(),
    })?;

    // Quadrature count from the bases; collocated fields must agree.
    let mut num_qpts = None;
    for field in inputs.iter().chain(&outputs) {
        if let Some(b) = &field.basis {
            match num_qpts {
                None => num_qpts = Some(b.num_quadrature_points()),
                Some(q) if q != b.num_quadrature_points() => {
                    return Err(Error::InvalidField {
                        name: field.name.clone(),
                        message: format!(
                            "basis has {} quadrature points, other fields have {}",
                            b.num_quadrature_points(),
                            q
                        ),
                    })
                }
                Some(_) => {}
            }
        }
    }
    let num_qpts = match num_qpts {
        Some(q) => q,
        // All fields collocated: the element size is the quadrature count.
        None => inputs
            .iter()
            .chain(&outputs)
            .find_map(|f| f.restriction.as_ref().map(|r| r.elem_size()))
            .unwrap(),
    };

    let dim = inputs
        .iter()
        .chain(&outputs)
        .filter_map(|f| f.basis.as_ref().map(|b| b.dimension()))
        .max()
        .unwrap_or(1);

    for (is_input, field) in inputs
        .iter()
        .map(|f| (true, f))
        .chain(outputs.iter().map(|f| (false, f)))
    {
        validate_field(field, is_input, num_qpts)?;
    }

    let active_input = single_active(&inputs, "input")?;
    let active_output = single_active(&outputs, "output")?;
    for field in &outputs {
        if !matches!(field.vector, VectorSpec::Active) {
            return Err(Error::InvalidField {
                name: field.name.clone(),
                message: "output fields must use the active vector".to_string(),
            });
        }
    }

    let signature = build_signature(qf, num_qpts, dim, &inputs, &outputs);

    Ok(OperatorPlan {
        qf: Arc::clone(qf),
        num_elem,
        num_qpts,
        inputs,
        outputs,
        active_input,
        active_output,
        signature,
    })
}

fn validate_field(field: &PlannedField, is_input: bool, num_qpts: usize) -> Result<()> {
    let err = |message: String| {
        Err(Error::InvalidField {
            name: field.name.clone(),
            message,
        })
    };
    match field.eval_mode {
        EvalMode::Weight => {
            if !is_input {
                return err("weight fields are inputs only".to_string());
            }
            if field.restriction.is_some() {
                return err("weight fields take no restriction".to_string());
            }
            if field.basis.is_none() {
                return err("weight fields require a basis for the quadrature rule".to_string());
            }
            if !matches!(field.vector, VectorSpec::None) {
                return err("weight fields take no vector".to_string());
            }
        }
        EvalMode::None => {
            let Some(r) = &field.restriction else {
                return err("collocated fields require a restriction".to_string());
            };
            if field.basis.is_some() {
                return err("collocated fields take no basis".to_string());
            }
            if r.num_components() != field.size {
                return err(format!(
                    "restriction has {} components, field size is {}",
                    r.num_components(),
                    field.size
                ));
            }
            if r.elem_size() != num_qpts {
                return err(format!(
                    "collocated restriction addresses {} nodes per element, \
                     but the operator has {} quadrature points",
                    r.elem_size(),
                    num_qpts
                ));
            }
        }
        EvalMode::Interp | EvalMode::Grad | EvalMode::Div => {
            let Some(r) = &field.restriction else {
                return err("basis-evaluated fields require a restriction".to_string());
            };
            let Some(b) = &field.basis else {
                return err("basis-evaluated fields require a basis".to_string());
            };
            let basis_size = b.field_size(field.eval_mode)?;
            if basis_size != field.size {
                return err(format!(
                    "basis produces {} scalars per quadrature point, field declares {}",
                    basis_size, field.size
                ));
            }
            if b.num_components() != r.num_components() {
                return err(format!(
                    "basis has {} components, restriction has {}",
                    b.num_components(),
                    r.num_components()
                ));
            }
            if r.elem_size() != b.num_nodes() {
                return err(format!(
                    "restriction addresses {} nodes per element, basis has {}",
                    r.elem_size(),
                    b.num_nodes()
                ));
            }
        }
    }
    Ok(())
}

fn single_active(fields: &[PlannedField], role: &str) -> Result<usize> {
    let mut active = None;
    for (index, field) in fields.iter().enumerate() {
        if matches!(field.vector, VectorSpec::Active) {
            if active.is_some() {
                return Err(Error::InvalidField {
                    name: field.name.clone(),
                    message: format!("more than one active {} field", role),
                });
            }
            active = Some(index);
        }
    }
    active.ok_or_else(|| Error::InvalidConfiguration {
        kind: "Operator",
        message: format!("exactly one active {} field is required", role),
    })
}

fn build_signature(
    qf: &Arc<QFunction>,
    num_qpts: usize,
    dim: usize,
    inputs: &[PlannedField],
    outputs: &[PlannedField],
) -> OperatorSignature {
    // Canonical slots: objects shared between fields share device buffers,
    // so the sharing topology is part of the compiled kernel's shape.
    let mut restr_ptrs: Vec<*const ElemRestriction> = Vec::new();
    let mut basis_ptrs: Vec<*const Basis> = Vec::new();
    let mut field_sig = |field: &PlannedField| -> FieldSig {
        let restr_slot = field.restriction.as_ref().map(|r| {
            let ptr = Arc::as_ptr(r);
            match restr_ptrs.iter().position(|&p| p == ptr) {
                Some(slot) => slot,
                None => {
                    restr_ptrs.push(ptr);
                    restr_ptrs.len() - 1
                }
            }
        });
        let basis_slot = field.basis.as_ref().map(|b| {
            let ptr = Arc::as_ptr(b);
            match basis_ptrs.iter().position(|&p| p == ptr) {
                Some(slot) => slot,
                None => {
                    basis_ptrs.push(ptr);
                    basis_ptrs.len() - 1
                }
            }
        });
        FieldSig {
            size: field.size,
            eval_mode: field.eval_mode,
            elem_size: field
                .restriction
                .as_ref()
                .map(|r| r.elem_size())
                .unwrap_or(0),
            num_comp: field
                .restriction
                .as_ref()
                .map(|r| r.num_components())
                .unwrap_or(0),
            restriction: field.restriction.as_ref().map(|r| match r.kind() {
                crate::restriction::RestrictionKind::Strided { strides } => {
                    RestrictionSig::Strided { strides: *strides }
                }
                crate::restriction::RestrictionKind::Offsets { orients, .. } => {
                    RestrictionSig::Offsets {
                        comp_stride: r.comp_stride(),
                        oriented: orients.is_some(),
                    }
                }
            }),
            basis: field.basis.as_ref().map(|b| BasisSig {
                num_nodes: b.num_nodes(),
                num_qpts: b.num_quadrature_points(),
                dim: b.dimension(),
                interp_rows: b.interp_rows(),
                deriv_rows: b.deriv_rows(),
            }),
            restr_slot,
            basis_slot,
        }
    };
    let inputs = inputs.iter().map(&mut field_sig).collect();
    let outputs = outputs.iter().map(&mut field_sig).collect();
    OperatorSignature {
        qf_name: qf.name().to_string(),
        source_hash: qf.source_hash(),
        num_qpts,
        dim,
        inputs,
        outputs,
    }
}
