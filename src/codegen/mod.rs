//! Runtime WGSL source synthesis.
//!
//! Both generators are pure functions from kernel metadata to source text:
//! they perform no I/O and produce identical output for identical input, so
//! the generated translation units can be tested by direct string
//! comparison. Compilation and caching of the generated source is the GPU
//! backend's concern.

pub mod operator;
pub mod qfunction;

/// Workgroup size shared by every generated compute kernel.
pub const WORKGROUP_SIZE: u32 = 64;
