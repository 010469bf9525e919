//! The operation registry backing backend dispatch.
//!
//! The registry maps (object kind, operation name) to a type-erased callable
//! registered by the selected backend when the context is initialized. It is
//! owned by the context rather than living in process-global state, so
//! construction and teardown ordering is explicit.

use crate::error::{Error, Result};
use rustc_hash::FxHashMap;
use std::any::Any;

/// The kinds of objects a backend provides operations for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ElemRestriction,
    Basis,
    QFunction,
    Operator,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::ElemRestriction => "ElemRestriction",
            ObjectKind::Basis => "Basis",
            ObjectKind::QFunction => "QFunction",
            ObjectKind::Operator => "Operator",
        }
    }
}

pub struct Registry {
    backend: String,
    entries: FxHashMap<(ObjectKind, &'static str), Box<dyn Any + Send + Sync>>,
}

impl Registry {
    pub(crate) fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            entries: FxHashMap::default(),
        }
    }

    /// Register an implementation for (kind, operation). Later registrations
    /// replace earlier ones, which lets layered backends override defaults.
    pub(crate) fn register<F>(&mut self, kind: ObjectKind, operation: &'static str, f: F)
    where
        F: Any + Send + Sync,
    {
        self.entries.insert((kind, operation), Box::new(f));
    }

    /// Resolve the implementation registered for (kind, operation).
    ///
    /// Called exactly once per object at creation time; a missing entry is
    /// an immediate configuration error naming the backend, object kind and
    /// operation.
    pub(crate) fn resolve<F>(&self, kind: ObjectKind, operation: &'static str) -> Result<F>
    where
        F: Any + Clone,
    {
        self.entries
            .get(&(kind, operation))
            .and_then(|entry| entry.downcast_ref::<F>())
            .cloned()
            .ok_or_else(|| Error::UnregisteredOperation {
                backend: self.backend.clone(),
                kind: kind.name(),
                operation,
            })
    }
}
