//! Matrix-free evaluation of finite element operators.
//!
//! The crate composes three primitives: an *element restriction* that maps a
//! global degree-of-freedom vector (L-vector) to a per-element layout
//! (E-vector) and back, a *tensor contraction* engine that applies basis
//! tables between nodal and quadrature-point representations, and a
//! user-supplied pointwise *QFunction* evaluated at quadrature points.
//! Operators bind these together per field and are applied matrix-free.
//!
//! Two backends are provided. The host backend evaluates the composition as
//! sequential loops with SIMD-friendly blocking. The GPU backend generates,
//! compiles and caches a single fused WGSL kernel per operator shape, so
//! that gather, basis application, physics and scatter all happen within one
//! kernel launch.

use std::sync::Arc;

pub mod backend;
pub mod basis;
pub mod codegen;
pub mod error;
pub mod operator;
pub mod qfunction;
pub mod quadrature;
pub mod restriction;
pub mod tensor;
pub mod vector;

pub use crate::error::{Error, Result};

/// The scalar type used for all host-side numerical data.
///
/// Device-resident data is stored in single precision; conversion happens at
/// upload/readback boundaries.
pub type Scalar = f64;

/// Whether an operation uses a map or its transpose.
///
/// For restrictions, `NoTranspose` gathers an L-vector into an E-vector and
/// `Transpose` scatter-accumulates an E-vector back into an L-vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransposeMode {
    NoTranspose,
    Transpose,
}

/// How a field is evaluated at quadrature points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvalMode {
    /// Use values as stored, without basis interpolation (collocated data).
    None,
    /// Interpolate nodal values to quadrature points.
    Interp,
    /// Evaluate gradients at quadrature points.
    Grad,
    /// Evaluate the divergence at quadrature points (vector-valued bases).
    Div,
    /// Supply quadrature weights. Input-only; carries no nodal data.
    Weight,
}

impl EvalMode {
    /// Number of scalars this mode produces per quadrature point for a field
    /// with `num_comp` components in `dim` dimensions.
    pub fn field_size(self, num_comp: usize, dim: usize) -> usize {
        match self {
            EvalMode::None | EvalMode::Interp | EvalMode::Div => num_comp,
            EvalMode::Grad => num_comp * dim,
            EvalMode::Weight => 1,
        }
    }
}

/// Preferred memory residency for a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Host,
    Device,
}

/// Runtime context owning the backend dispatch registry and, for the GPU
/// backend, the device state and compiled-module cache.
///
/// All objects are created against a context and resolve their backend
/// implementations exactly once at creation time. Cloning is cheap and
/// clones share the same backend state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    resource: String,
    registry: backend::registry::Registry,
    gpu: Option<Arc<backend::gpu::GpuContext>>,
}

impl Context {
    /// Initialize a context for the given backend resource.
    ///
    /// Supported resources are `"host"` and `"gpu"`. Initializing the GPU
    /// backend acquires a device through `wgpu`; if no adapter is available
    /// this fails with [`Error::DeviceUnavailable`].
    pub fn init(resource: &str) -> Result<Self> {
        let mut registry = backend::registry::Registry::new(resource);
        let gpu = match resource {
            "host" => {
                backend::host::register(&mut registry);
                None
            }
            "gpu" => {
                let gpu = Arc::new(backend::gpu::GpuContext::acquire()?);
                backend::gpu::register(&mut registry, &gpu);
                Some(gpu)
            }
            _ => {
                return Err(Error::UnknownBackend {
                    resource: resource.to_string(),
                })
            }
        };
        Ok(Self {
            inner: Arc::new(ContextInner {
                resource: resource.to_string(),
                registry,
                gpu,
            }),
        })
    }

    /// The resource string this context was initialized with.
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Whether this context compiles fused device kernels for operators, as
    /// opposed to interpreting the composition on the host.
    pub fn supports_fusion(&self) -> bool {
        self.inner.gpu.is_some()
    }

    pub(crate) fn registry(&self) -> &backend::registry::Registry {
        &self.inner.registry
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("resource", &self.inner.resource)
            .finish()
    }
}
