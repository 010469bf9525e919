//! Backend dispatch.
//!
//! Each backend registers concrete implementations for the operations of
//! every object kind into the context's [`registry::Registry`]. Objects
//! resolve the operations they need exactly once at creation time into a
//! capability record of callable handles, so applying an object involves no
//! per-call lookup.

use crate::basis::Basis;
use crate::operator::OperatorInner;
use crate::qfunction::QFunction;
use crate::restriction::ElemRestriction;
use crate::vector::Vector;
use crate::{EvalMode, Result, Scalar, TransposeMode};
use std::sync::Arc;

pub mod gpu;
pub mod host;
pub mod registry;

pub(crate) type RestrictionApplyFn =
    Arc<dyn Fn(&ElemRestriction, TransposeMode, &Vector, &mut Vector) -> Result<()> + Send + Sync>;

/// Operations resolved for an element restriction at creation time.
#[derive(Clone)]
pub(crate) struct RestrictionOps {
    pub apply: RestrictionApplyFn,
}

pub(crate) type BasisApplyFn = Arc<
    dyn Fn(&Basis, usize, TransposeMode, EvalMode, &[Scalar], &mut [Scalar]) -> Result<()>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub(crate) struct BasisOps {
    pub apply: BasisApplyFn,
}

pub(crate) type QFunctionBuildFn = Arc<dyn Fn(&QFunction) -> Result<()> + Send + Sync>;
pub(crate) type QFunctionApplyFn = Arc<
    dyn Fn(&QFunction, usize, &[&[Scalar]], &mut [&mut [Scalar]]) -> Result<()> + Send + Sync,
>;

#[derive(Clone)]
pub(crate) struct QFunctionOps {
    pub build: QFunctionBuildFn,
    pub apply: QFunctionApplyFn,
}

pub(crate) type OperatorCompileFn =
    Arc<dyn Fn(&mut OperatorInner) -> Result<()> + Send + Sync>;
pub(crate) type OperatorApplyAddFn =
    Arc<dyn Fn(&mut OperatorInner, &Vector, &mut Vector) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct OperatorOps {
    pub compile: OperatorCompileFn,
    pub apply_add: OperatorApplyAddFn,
}
