//! Pointwise physics kernels evaluated at quadrature points.
//!
//! A [`QFunction`] declares ordered input and output fields, each with a
//! size (scalars per quadrature point) and an evaluation mode. The kernel
//! itself comes in up to two forms: a host closure operating on
//! quadrature-major slices, and WGSL source text that the GPU backend
//! compiles into a device kernel on first use.
//!
//! Device source is compiled lazily and the compiled entry point is
//! memoized; after a successful compile the source text is discarded.
//! Rebuilding an already-compiled QFunction is a no-op. A consequence is
//! that a QFunction cannot be re-targeted after its source has been freed
//! without re-supplying the source; this is a documented limitation rather
//! than a defect.

use crate::backend::registry::ObjectKind;
use crate::backend::QFunctionOps;
use crate::error::{Error, Result};
use crate::{Context, EvalMode, Scalar};
use parking_lot::Mutex;
use std::any::Any;
use std::hash::Hasher;
use std::sync::Arc;

/// Host-side kernel: `(num_points, inputs, outputs)`, where each slice is
/// quadrature-major (`slice[q + num_points * component]`).
pub type HostKernel = Box<
    dyn Fn(usize, &[&[Scalar]], &mut [&mut [Scalar]]) -> std::result::Result<(), String>
        + Send
        + Sync,
>;

/// One declared input or output field of a QFunction.
#[derive(Debug, Clone)]
pub struct QFunctionField {
    name: String,
    size: usize,
    eval_mode: EvalMode,
}

impl QFunctionField {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scalars per quadrature point.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn eval_mode(&self) -> EvalMode {
        self.eval_mode
    }
}

pub(crate) struct DeviceKernelState {
    pub entry_point: String,
    pub source: Option<String>,
    pub source_hash: u64,
    /// Backend-owned compiled pipeline; set once on first build.
    pub compiled: Option<Arc<dyn Any + Send + Sync>>,
}

/// A named pointwise kernel over quadrature points.
pub struct QFunction {
    name: String,
    inputs: Vec<QFunctionField>,
    outputs: Vec<QFunctionField>,
    host_kernel: Option<HostKernel>,
    pub(crate) device: Mutex<DeviceKernelState>,
    ops: QFunctionOps,
}

impl QFunction {
    /// Create an empty QFunction; attach kernels and declare fields with the
    /// builder methods before use.
    pub fn create(ctx: &Context, name: &str) -> Result<Self> {
        let ops = QFunctionOps {
            build: ctx.registry().resolve(ObjectKind::QFunction, "Build")?,
            apply: ctx.registry().resolve(ObjectKind::QFunction, "Apply")?,
        };
        Ok(Self {
            name: name.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            host_kernel: None,
            device: Mutex::new(DeviceKernelState {
                entry_point: name.to_string(),
                source: None,
                source_hash: 0,
                compiled: None,
            }),
            ops,
        })
    }

    /// Attach the host kernel closure.
    pub fn host_kernel(mut self, kernel: HostKernel) -> Self {
        self.host_kernel = Some(kernel);
        self
    }

    /// Attach WGSL device source. `entry_point` names the function inside
    /// `source` that evaluates one quadrature point; see
    /// [`crate::codegen::qfunction`] for the expected signature.
    pub fn device_source(self, source: &str, entry_point: &str) -> Self {
        {
            let mut device = self.device.lock();
            let mut hasher = rustc_hash::FxHasher::default();
            hasher.write(entry_point.as_bytes());
            hasher.write(source.as_bytes());
            device.entry_point = entry_point.to_string();
            device.source = Some(source.to_string());
            device.source_hash = hasher.finish();
        }
        self
    }

    /// Declare the next input field.
    pub fn input(mut self, name: &str, size: usize, eval_mode: EvalMode) -> Result<Self> {
        self.check_field(name, size, eval_mode)?;
        self.inputs.push(QFunctionField {
            name: name.to_string(),
            size,
            eval_mode,
        });
        Ok(self)
    }

    /// Declare the next output field. `Weight` is not a valid output mode.
    pub fn output(mut self, name: &str, size: usize, eval_mode: EvalMode) -> Result<Self> {
        if eval_mode == EvalMode::Weight {
            return Err(Error::InvalidField {
                name: name.to_string(),
                message: "quadrature weights cannot be an output".to_string(),
            });
        }
        self.check_field(name, size, eval_mode)?;
        self.outputs.push(QFunctionField {
            name: name.to_string(),
            size,
            eval_mode,
        });
        Ok(self)
    }

    fn check_field(&self, name: &str, size: usize, eval_mode: EvalMode) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidField {
                name: name.to_string(),
                message: "field size must be positive".to_string(),
            });
        }
        if eval_mode == EvalMode::Weight && size != 1 {
            return Err(Error::InvalidField {
                name: name.to_string(),
                message: format!("weight fields have size 1, got {}", size),
            });
        }
        let duplicate = self
            .inputs
            .iter()
            .chain(&self.outputs)
            .any(|f| f.name == name);
        if duplicate {
            return Err(Error::InvalidField {
                name: name.to_string(),
                message: "field name already declared".to_string(),
            });
        }
        Ok(())
    }

    /// Build the device kernel now instead of lazily on first use.
    ///
    /// A no-op when the compiled entry point is already cached, even if the
    /// source has since been freed.
    pub fn build(&self) -> Result<()> {
        (self.ops.build.clone())(self)
    }

    /// Evaluate the kernel at `num_points` quadrature points.
    ///
    /// Each input slice must hold `num_points * size` scalars in
    /// quadrature-major order, and likewise for outputs.
    pub fn apply(
        &self,
        num_points: usize,
        inputs: &[&[Scalar]],
        outputs: &mut [&mut [Scalar]],
    ) -> Result<()> {
        if inputs.len() != self.inputs.len() {
            return Err(Error::LengthMismatch {
                kind: "QFunction",
                operation: "Apply",
                expected: self.inputs.len(),
                actual: inputs.len(),
            });
        }
        if outputs.len() != self.outputs.len() {
            return Err(Error::LengthMismatch {
                kind: "QFunction",
                operation: "Apply",
                expected: self.outputs.len(),
                actual: outputs.len(),
            });
        }
        for (field, data) in self.inputs.iter().zip(inputs) {
            if data.len() != num_points * field.size {
                return Err(Error::LengthMismatch {
                    kind: "QFunction",
                    operation: "Apply",
                    expected: num_points * field.size,
                    actual: data.len(),
                });
            }
        }
        for (field, data) in self.outputs.iter().zip(outputs.iter()) {
            if data.len() != num_points * field.size {
                return Err(Error::LengthMismatch {
                    kind: "QFunction",
                    operation: "Apply",
                    expected: num_points * field.size,
                    actual: data.len(),
                });
            }
        }
        (self.ops.apply.clone())(self, num_points, inputs, outputs)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[QFunctionField] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[QFunctionField] {
        &self.outputs
    }

    pub(crate) fn host_kernel_ref(&self) -> Option<&HostKernel> {
        self.host_kernel.as_ref()
    }

    /// Hash of the device source, stable across source freeing. Zero when no
    /// device source was ever supplied.
    pub(crate) fn source_hash(&self) -> u64 {
        self.device.lock().source_hash
    }
}

impl std::fmt::Debug for QFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QFunction")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("has_host_kernel", &self.host_kernel.is_some())
            .finish()
    }
}
