//! Translation-unit synthesis for standalone QFunction kernels.
//!
//! The generated module evaluates a user-supplied pointwise function at
//! every quadrature point, grid-strided over the point count. It consists
//! of: a bindings preamble, one read/write helper per field (parameterized
//! on the field width), the verbatim user source, and the entry kernel that
//! loads each input field into a small local array, invokes the user
//! function with single-point arity, and stores each output field back.
//!
//! Field data lives in quadrature-major layout: component `c` of point `q`
//! is at `q + num_points * c`.
//!
//! The user function must have the signature
//!
//! ```wgsl
//! fn name(q: u32,
//!         in_0: ptr<function, array<f32, S0>>, ...,
//!         out_0: ptr<function, array<f32, T0>>, ...)
//! ```
//!
//! with one pointer parameter per declared input and output field, sized by
//! the declared field widths.

use crate::codegen::WORKGROUP_SIZE;
use std::fmt::Write;

/// A complete generated translation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QFunctionUnit {
    /// Name of the generated compute entry point.
    pub entry_point: String,
    pub source: String,
}

/// Synthesize the translation unit for a pointwise kernel.
///
/// `user_entry` names the function defined in `user_source`; `input_sizes`
/// and `output_sizes` are the declared per-point field widths in field
/// order.
pub fn qfunction_unit(
    user_entry: &str,
    user_source: &str,
    input_sizes: &[usize],
    output_sizes: &[usize],
) -> QFunctionUnit {
    let mut s = String::new();

    writeln!(s, "// Generated pointwise kernel module for '{user_entry}'.").unwrap();
    writeln!(s, "struct Params {{").unwrap();
    writeln!(s, "    num_points: u32,").unwrap();
    writeln!(s, "    _pad0: u32,").unwrap();
    writeln!(s, "    _pad1: u32,").unwrap();
    writeln!(s, "    _pad2: u32,").unwrap();
    writeln!(s, "}}").unwrap();
    writeln!(s).unwrap();
    writeln!(s, "@group(0) @binding(0) var<uniform> params: Params;").unwrap();
    for (i, _) in input_sizes.iter().enumerate() {
        let binding = 1 + i;
        writeln!(
            s,
            "@group(0) @binding({binding}) var<storage, read> in_{i}: array<f32>;"
        )
        .unwrap();
    }
    for (i, _) in output_sizes.iter().enumerate() {
        let binding = 1 + input_sizes.len() + i;
        writeln!(
            s,
            "@group(0) @binding({binding}) var<storage, read_write> out_{i}: array<f32>;"
        )
        .unwrap();
    }
    writeln!(s).unwrap();

    // Per-field read helpers over the quadrature-major layout.
    for (i, size) in input_sizes.iter().enumerate() {
        writeln!(s, "fn read_field_{i}(q: u32) -> array<f32, {size}> {{").unwrap();
        writeln!(s, "    var r: array<f32, {size}>;").unwrap();
        writeln!(s, "    for (var c = 0u; c < {size}u; c = c + 1u) {{").unwrap();
        writeln!(s, "        r[c] = in_{i}[q + params.num_points * c];").unwrap();
        writeln!(s, "    }}").unwrap();
        writeln!(s, "    return r;").unwrap();
        writeln!(s, "}}").unwrap();
        writeln!(s).unwrap();
    }
    for (i, size) in output_sizes.iter().enumerate() {
        writeln!(s, "fn write_field_{i}(q: u32, r: array<f32, {size}>) {{").unwrap();
        writeln!(s, "    for (var c = 0u; c < {size}u; c = c + 1u) {{").unwrap();
        writeln!(s, "        out_{i}[q + params.num_points * c] = r[c];").unwrap();
        writeln!(s, "    }}").unwrap();
        writeln!(s, "}}").unwrap();
        writeln!(s).unwrap();
    }

    writeln!(s, "// User physics source.").unwrap();
    writeln!(s, "{}", user_source.trim_end()).unwrap();
    writeln!(s).unwrap();

    writeln!(s, "@compute @workgroup_size({WORKGROUP_SIZE})").unwrap();
    writeln!(
        s,
        "fn qf_main(@builtin(global_invocation_id) gid: vec3<u32>,"
    )
    .unwrap();
    writeln!(s, "           @builtin(num_workgroups) nwg: vec3<u32>) {{").unwrap();
    writeln!(s, "    let stride = nwg.x * {WORKGROUP_SIZE}u;").unwrap();
    writeln!(s, "    var q = gid.x;").unwrap();
    writeln!(s, "    loop {{").unwrap();
    writeln!(s, "        if (q >= params.num_points) {{ break; }}").unwrap();
    for (i, _) in input_sizes.iter().enumerate() {
        writeln!(s, "        var r_q{i} = read_field_{i}(q);").unwrap();
    }
    for (i, size) in output_sizes.iter().enumerate() {
        writeln!(s, "        var r_v{i}: array<f32, {size}>;").unwrap();
    }
    let mut args = vec!["q".to_string()];
    args.extend((0..input_sizes.len()).map(|i| format!("&r_q{i}")));
    args.extend((0..output_sizes.len()).map(|i| format!("&r_v{i}")));
    writeln!(s, "        {user_entry}({});", args.join(", ")).unwrap();
    for (i, _) in output_sizes.iter().enumerate() {
        writeln!(s, "        write_field_{i}(q, r_v{i});").unwrap();
    }
    writeln!(s, "        q = q + stride;").unwrap();
    writeln!(s, "    }}").unwrap();
    writeln!(s, "}}").unwrap();

    QFunctionUnit {
        entry_point: "qf_main".to_string(),
        source: s,
    }
}
