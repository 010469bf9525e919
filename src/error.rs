//! Error types.
//!
//! Errors fall into two classes. *Configuration errors* are detected eagerly
//! at object creation or operator build time and indicate inconsistent
//! shapes, bindings or backend selection; they abort the enclosing setup
//! step and are never retryable. *Build errors* arise when the shader
//! compiler rejects generated or user source; the generated source is
//! attached for diagnosis.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown backend resource '{resource}'")]
    UnknownBackend { resource: String },

    #[error("No operation '{operation}' registered for {kind} on backend '{backend}'")]
    UnregisteredOperation {
        backend: String,
        kind: &'static str,
        operation: &'static str,
    },

    #[error("{kind} {operation}: expected length {expected}, got {actual}")]
    LengthMismatch {
        kind: &'static str,
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error(
        "Restriction offset {offset} for component {component} resolves to {resolved}, \
         outside the L-vector length {l_size}"
    )]
    OffsetOutOfBounds {
        offset: usize,
        component: usize,
        resolved: usize,
        l_size: usize,
    },

    #[error("{kind}: {message}")]
    InvalidConfiguration { kind: &'static str, message: String },

    #[error("Operator field '{name}': {message}")]
    InvalidField { name: String, message: String },

    #[error("Operator field bindings do not match QFunction '{qfunction}': {message}")]
    FieldSetMismatch { qfunction: String, message: String },

    #[error("Operator bindings are frozen once compiled; cannot modify field '{name}'")]
    OperatorFrozen { name: String },

    #[error("QFunction '{name}' has no {what} for backend '{backend}'")]
    MissingKernel {
        name: String,
        what: &'static str,
        backend: String,
    },

    #[error("QFunction '{name}' failed at quadrature point batch: {message}")]
    KernelFailure { name: String, message: String },

    #[error("No suitable GPU adapter or device is available: {message}")]
    DeviceUnavailable { message: String },

    #[error(
        "Shader compilation for '{unit}' failed: {message}\n\
         --- generated source ---\n{generated_source}"
    )]
    ShaderBuild {
        unit: String,
        message: String,
        generated_source: String,
    },
}

impl Error {
    /// True for errors in the configuration class (eager, non-retryable
    /// setup failures), false for build errors.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Error::ShaderBuild { .. })
    }
}
