//! Fused operator-kernel synthesis.
//!
//! For one operator shape signature, generate a single WGSL kernel that
//! processes one element per (grid-strided) thread: gather every input
//! field from its L-vector, apply the dense basis contraction for all
//! quadrature points, invoke the user physics function point by point,
//! apply the transpose contraction, and scatter-accumulate the output back
//! to its L-vector. All intermediate element data lives in kernel-private
//! arrays whose extents are baked into the generated source.
//!
//! The scatter phase is the only stage with cross-thread write conflicts
//! (elements sharing degrees of freedom); it accumulates through a
//! compare-exchange loop on the raw bit pattern, since WGSL has no native
//! floating-point atomics.
//!
//! Generation is a pure function of the [`KernelOperator`] description;
//! buffer creation and pipeline compilation live in the GPU backend.

use crate::codegen::WORKGROUP_SIZE;
use crate::EvalMode;
use std::fmt::Write;

/// Vector role of a field as the generator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelVector {
    Active,
    Fixed,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRestriction {
    /// Canonical slot; fields sharing a restriction share buffers.
    pub slot: usize,
    pub elem_size: usize,
    pub num_comp: usize,
    pub comp_stride: usize,
    /// `Some` for strided addressing (strides baked into the source),
    /// `None` for offset addressing (offset table bound as a buffer).
    pub strides: Option<[usize; 3]>,
    pub oriented: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBasis {
    pub slot: usize,
    pub num_nodes: usize,
    /// Row count of the dense interpolation table (`num_qpts` for H1,
    /// `dim * num_qpts` for vector-valued bases).
    pub interp_rows: usize,
    /// Row count of the dense gradient/divergence table.
    pub deriv_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelField {
    pub size: usize,
    pub eval_mode: EvalMode,
    pub role: KernelVector,
    pub restriction: Option<KernelRestriction>,
    pub basis: Option<KernelBasis>,
}

/// Everything the generator needs to synthesize one fused kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelOperator {
    pub user_entry: String,
    pub user_source: String,
    pub num_qpts: usize,
    pub inputs: Vec<KernelField>,
    pub outputs: Vec<KernelField>,
}

/// One entry of the kernel's bind group, in binding-index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Params,
    Offsets { slot: usize },
    Orients { slot: usize },
    Interp { slot: usize },
    Deriv { slot: usize },
    Weights { slot: usize },
    ActiveInput,
    FixedInput { field: usize },
    Output,
}

/// Derive the bind-group layout for a kernel description.
///
/// Buffers shared between fields (offset tables, basis tables) appear once,
/// at the position of their first use; the generated source and the GPU
/// backend both consume this layout, so binding indices always agree.
pub fn device_layout(op: &KernelOperator) -> Vec<Binding> {
    let mut layout = vec![Binding::Params];
    let push_unique = |layout: &mut Vec<Binding>, binding: Binding| {
        if !layout.contains(&binding) {
            layout.push(binding);
        }
    };

    for field in op.inputs.iter().chain(&op.outputs) {
        if let Some(r) = &field.restriction {
            if r.strides.is_none() {
                push_unique(&mut layout, Binding::Offsets { slot: r.slot });
                if r.oriented {
                    push_unique(&mut layout, Binding::Orients { slot: r.slot });
                }
            }
        }
        if let Some(b) = &field.basis {
            match field.eval_mode {
                EvalMode::Interp => push_unique(&mut layout, Binding::Interp { slot: b.slot }),
                EvalMode::Grad | EvalMode::Div => {
                    push_unique(&mut layout, Binding::Deriv { slot: b.slot })
                }
                EvalMode::Weight => push_unique(&mut layout, Binding::Weights { slot: b.slot }),
                EvalMode::None => {}
            }
        }
    }
    for (f, field) in op.inputs.iter().enumerate() {
        match field.role {
            KernelVector::Active => push_unique(&mut layout, Binding::ActiveInput),
            KernelVector::Fixed => push_unique(&mut layout, Binding::FixedInput { field: f }),
            KernelVector::None => {}
        }
    }
    layout.push(Binding::Output);
    layout
}

fn binding_index(layout: &[Binding], binding: Binding) -> usize {
    layout
        .iter()
        .position(|&b| b == binding)
        .expect("binding present in layout")
}

/// Synthesize the fused kernel source for the given description and layout.
pub fn fused_kernel_source(op: &KernelOperator, layout: &[Binding]) -> String {
    let q_total = op.num_qpts;
    let mut s = String::new();

    writeln!(s, "// Generated fused operator kernel for '{}'.", op.user_entry).unwrap();
    writeln!(s, "struct Params {{").unwrap();
    writeln!(s, "    num_elem: u32,").unwrap();
    writeln!(s, "    _pad0: u32,").unwrap();
    writeln!(s, "    _pad1: u32,").unwrap();
    writeln!(s, "    _pad2: u32,").unwrap();
    writeln!(s, "}}").unwrap();
    writeln!(s).unwrap();

    for (i, binding) in layout.iter().enumerate() {
        match binding {
            Binding::Params => {
                writeln!(s, "@group(0) @binding({i}) var<uniform> params: Params;").unwrap()
            }
            Binding::Offsets { .. } | Binding::Orients { .. } => writeln!(
                s,
                "@group(0) @binding({i}) var<storage, read> b{i}: array<u32>;"
            )
            .unwrap(),
            Binding::Output => writeln!(
                s,
                "@group(0) @binding({i}) var<storage, read_write> b{i}: array<atomic<u32>>;"
            )
            .unwrap(),
            _ => writeln!(
                s,
                "@group(0) @binding({i}) var<storage, read> b{i}: array<f32>;"
            )
            .unwrap(),
        }
    }
    writeln!(s).unwrap();

    // Compare-exchange accumulation on the raw bit pattern: WGSL offers no
    // native float atomics.
    let out_idx = binding_index(layout, Binding::Output);
    writeln!(s, "fn atomic_add_out(index: u32, value: f32) {{").unwrap();
    writeln!(s, "    var old = atomicLoad(&b{out_idx}[index]);").unwrap();
    writeln!(s, "    loop {{").unwrap();
    writeln!(
        s,
        "        let new_bits = bitcast<u32>(bitcast<f32>(old) + value);"
    )
    .unwrap();
    writeln!(
        s,
        "        let result = atomicCompareExchangeWeak(&b{out_idx}[index], old, new_bits);"
    )
    .unwrap();
    writeln!(s, "        if (result.exchanged) {{ break; }}").unwrap();
    writeln!(s, "        old = result.old_value;").unwrap();
    writeln!(s, "    }}").unwrap();
    writeln!(s, "}}").unwrap();
    writeln!(s).unwrap();

    writeln!(s, "// User physics source.").unwrap();
    writeln!(s, "{}", op.user_source.trim_end()).unwrap();
    writeln!(s).unwrap();

    writeln!(s, "fn apply_element(e: u32) {{").unwrap();

    // Stage 1 + 2: gather each input field and apply its basis transform.
    for (f, field) in op.inputs.iter().enumerate() {
        match field.eval_mode {
            EvalMode::Weight => {
                writeln!(s, "    // input {f}: quadrature weights, read per point").unwrap();
            }
            EvalMode::None => {
                let r = field.restriction.as_ref().expect("collocated input");
                writeln!(s, "    // input {f}: collocated gather").unwrap();
                writeln!(
                    s,
                    "    var r_in{f}: array<f32, {}>;",
                    field.size * q_total
                )
                .unwrap();
                s.push_str(&gather_snippet(layout, op, f, field, r, &format!("r_in{f}")));
            }
            _ => {
                let r = field.restriction.as_ref().expect("basis-evaluated input");
                let b = field.basis.as_ref().expect("basis-evaluated input");
                writeln!(s, "    // input {f}: gather").unwrap();
                writeln!(
                    s,
                    "    var e_in{f}: array<f32, {}>;",
                    r.num_comp * r.elem_size
                )
                .unwrap();
                s.push_str(&gather_snippet(layout, op, f, field, r, &format!("e_in{f}")));
                writeln!(s, "    // input {f}: basis transform").unwrap();
                writeln!(
                    s,
                    "    var r_in{f}: array<f32, {}>;",
                    field.size * q_total
                )
                .unwrap();
                s.push_str(&basis_forward_snippet(layout, q_total, f, field, r, b));
            }
        }
    }

    for (f, field) in op.outputs.iter().enumerate() {
        writeln!(
            s,
            "    var r_out{f}: array<f32, {}>;",
            field.size * q_total
        )
        .unwrap();
    }

    // Stage 3: pointwise physics at every quadrature point.
    writeln!(s, "    // pointwise physics").unwrap();
    writeln!(s, "    for (var q = 0u; q < {q_total}u; q = q + 1u) {{").unwrap();
    for (f, field) in op.inputs.iter().enumerate() {
        writeln!(s, "        var qin{f}: array<f32, {}>;", field.size).unwrap();
        if field.eval_mode == EvalMode::Weight {
            let b = field.basis.as_ref().expect("weight input");
            let w_idx = binding_index(layout, Binding::Weights { slot: b.slot });
            writeln!(s, "        qin{f}[0] = b{w_idx}[q];").unwrap();
        } else {
            writeln!(
                s,
                "        for (var c = 0u; c < {}u; c = c + 1u) {{ qin{f}[c] = r_in{f}[c * {q_total}u + q]; }}",
                field.size
            )
            .unwrap();
        }
    }
    for (f, field) in op.outputs.iter().enumerate() {
        writeln!(s, "        var qout{f}: array<f32, {}>;", field.size).unwrap();
    }
    let mut args = vec![format!("e * {q_total}u + q")];
    args.extend((0..op.inputs.len()).map(|f| format!("&qin{f}")));
    args.extend((0..op.outputs.len()).map(|f| format!("&qout{f}")));
    writeln!(s, "        {}({});", op.user_entry, args.join(", ")).unwrap();
    for (f, field) in op.outputs.iter().enumerate() {
        writeln!(
            s,
            "        for (var c = 0u; c < {}u; c = c + 1u) {{ r_out{f}[c * {q_total}u + q] = qout{f}[c]; }}",
            field.size
        )
        .unwrap();
    }
    writeln!(s, "    }}").unwrap();

    // Stage 4 + 5: transpose basis transform and scatter-accumulate.
    for (f, field) in op.outputs.iter().enumerate() {
        let r = field.restriction.as_ref().expect("output restriction");
        match &field.basis {
            Some(b) => {
                writeln!(s, "    // output {f}: transpose basis transform").unwrap();
                writeln!(
                    s,
                    "    var e_out{f}: array<f32, {}>;",
                    r.num_comp * r.elem_size
                )
                .unwrap();
                s.push_str(&basis_transpose_snippet(layout, q_total, f, field, r, b));
                writeln!(s, "    // output {f}: scatter").unwrap();
                s.push_str(&scatter_snippet(layout, f, field, r, &format!("e_out{f}")));
            }
            None => {
                writeln!(s, "    // output {f}: collocated scatter").unwrap();
                s.push_str(&scatter_snippet(layout, f, field, r, &format!("r_out{f}")));
            }
        }
    }
    writeln!(s, "}}").unwrap();
    writeln!(s).unwrap();

    writeln!(s, "@compute @workgroup_size({WORKGROUP_SIZE})").unwrap();
    writeln!(
        s,
        "fn op_main(@builtin(global_invocation_id) gid: vec3<u32>,"
    )
    .unwrap();
    writeln!(s, "           @builtin(num_workgroups) nwg: vec3<u32>) {{").unwrap();
    writeln!(s, "    let stride = nwg.x * {WORKGROUP_SIZE}u;").unwrap();
    writeln!(s, "    var e = gid.x;").unwrap();
    writeln!(s, "    loop {{").unwrap();
    writeln!(s, "        if (e >= params.num_elem) {{ break; }}").unwrap();
    writeln!(s, "        apply_element(e);").unwrap();
    writeln!(s, "        e = e + stride;").unwrap();
    writeln!(s, "    }}").unwrap();
    writeln!(s, "}}").unwrap();

    s
}

/// The L-vector buffer variable for a field's vector role.
fn lvec_name(layout: &[Binding], field_index: usize, role: KernelVector) -> String {
    let binding = match role {
        KernelVector::Active => Binding::ActiveInput,
        KernelVector::Fixed => Binding::FixedInput { field: field_index },
        KernelVector::None => unreachable!("weight fields carry no L-vector"),
    };
    format!("b{}", binding_index(layout, binding))
}

fn gather_snippet(
    layout: &[Binding],
    _op: &KernelOperator,
    field_index: usize,
    field: &KernelField,
    r: &KernelRestriction,
    dst: &str,
) -> String {
    let lvec = lvec_name(layout, field_index, field.role);
    let p = r.elem_size;
    let nc = r.num_comp;
    let mut s = String::new();
    match r.strides {
        Some([s_node, s_comp, s_elem]) => {
            writeln!(s, "    for (var n = 0u; n < {p}u; n = n + 1u) {{").unwrap();
            writeln!(s, "        for (var c = 0u; c < {nc}u; c = c + 1u) {{").unwrap();
            writeln!(
                s,
                "            {dst}[c * {p}u + n] = {lvec}[n * {s_node}u + c * {s_comp}u + e * {s_elem}u];"
            )
            .unwrap();
            writeln!(s, "        }}").unwrap();
            writeln!(s, "    }}").unwrap();
        }
        None => {
            let off = binding_index(layout, Binding::Offsets { slot: r.slot });
            writeln!(s, "    for (var n = 0u; n < {p}u; n = n + 1u) {{").unwrap();
            writeln!(s, "        let index = b{off}[e * {p}u + n];").unwrap();
            if r.oriented {
                let ori = binding_index(layout, Binding::Orients { slot: r.slot });
                writeln!(s, "        let flip = b{ori}[e * {p}u + n] != 0u;").unwrap();
            }
            writeln!(s, "        for (var c = 0u; c < {nc}u; c = c + 1u) {{").unwrap();
            writeln!(
                s,
                "            var value = {lvec}[index + c * {}u];",
                r.comp_stride
            )
            .unwrap();
            if r.oriented {
                writeln!(s, "            if (flip) {{ value = -value; }}").unwrap();
            }
            writeln!(s, "            {dst}[c * {p}u + n] = value;").unwrap();
            writeln!(s, "        }}").unwrap();
            writeln!(s, "    }}").unwrap();
        }
    }
    s
}

/// Nodal-to-quadrature contraction against the dense table:
/// `r_in[(rep * nc + c) * Q + q] = Σ_n table[(rep * Q + q) * P + n] * e_in[c * P + n]`.
fn basis_forward_snippet(
    layout: &[Binding],
    q_total: usize,
    field_index: usize,
    field: &KernelField,
    r: &KernelRestriction,
    b: &KernelBasis,
) -> String {
    let table = table_binding(layout, field.eval_mode, b);
    let p = b.num_nodes;
    let nc = r.num_comp;
    let reps = field.size / nc.max(1);
    let f = field_index;
    let mut s = String::new();
    writeln!(s, "    for (var rep = 0u; rep < {reps}u; rep = rep + 1u) {{").unwrap();
    writeln!(s, "        for (var c = 0u; c < {nc}u; c = c + 1u) {{").unwrap();
    writeln!(
        s,
        "            for (var q = 0u; q < {q_total}u; q = q + 1u) {{"
    )
    .unwrap();
    writeln!(s, "                var acc = 0.0;").unwrap();
    writeln!(
        s,
        "                for (var n = 0u; n < {p}u; n = n + 1u) {{"
    )
    .unwrap();
    writeln!(
        s,
        "                    acc = acc + {table}[(rep * {q_total}u + q) * {p}u + n] * e_in{f}[c * {p}u + n];"
    )
    .unwrap();
    writeln!(s, "                }}").unwrap();
    writeln!(
        s,
        "                r_in{f}[(rep * {nc}u + c) * {q_total}u + q] = acc;"
    )
    .unwrap();
    writeln!(s, "            }}").unwrap();
    writeln!(s, "        }}").unwrap();
    writeln!(s, "    }}").unwrap();
    s
}

/// Quadrature-to-nodal transpose contraction, accumulating every table
/// block (derivative direction) into the nodal values.
fn basis_transpose_snippet(
    layout: &[Binding],
    q_total: usize,
    field_index: usize,
    field: &KernelField,
    r: &KernelRestriction,
    b: &KernelBasis,
) -> String {
    let table = table_binding(layout, field.eval_mode, b);
    let p = b.num_nodes;
    let nc = r.num_comp;
    let reps = field.size / nc.max(1);
    let f = field_index;
    let mut s = String::new();
    writeln!(s, "    for (var c = 0u; c < {nc}u; c = c + 1u) {{").unwrap();
    writeln!(s, "        for (var n = 0u; n < {p}u; n = n + 1u) {{").unwrap();
    writeln!(s, "            var acc = 0.0;").unwrap();
    writeln!(
        s,
        "            for (var rep = 0u; rep < {reps}u; rep = rep + 1u) {{"
    )
    .unwrap();
    writeln!(
        s,
        "                for (var q = 0u; q < {q_total}u; q = q + 1u) {{"
    )
    .unwrap();
    writeln!(
        s,
        "                    acc = acc + {table}[(rep * {q_total}u + q) * {p}u + n] * r_out{f}[(rep * {nc}u + c) * {q_total}u + q];"
    )
    .unwrap();
    writeln!(s, "                }}").unwrap();
    writeln!(s, "            }}").unwrap();
    writeln!(s, "            e_out{f}[c * {p}u + n] = acc;").unwrap();
    writeln!(s, "        }}").unwrap();
    writeln!(s, "    }}").unwrap();
    s
}

fn scatter_snippet(
    layout: &[Binding],
    _field_index: usize,
    field: &KernelField,
    r: &KernelRestriction,
    src: &str,
) -> String {
    let p = r.elem_size;
    let nc = r.num_comp;
    let mut s = String::new();
    match r.strides {
        Some([s_node, s_comp, s_elem]) => {
            writeln!(s, "    for (var n = 0u; n < {p}u; n = n + 1u) {{").unwrap();
            writeln!(s, "        for (var c = 0u; c < {nc}u; c = c + 1u) {{").unwrap();
            writeln!(
                s,
                "            atomic_add_out(n * {s_node}u + c * {s_comp}u + e * {s_elem}u, {src}[c * {p}u + n]);"
            )
            .unwrap();
            writeln!(s, "        }}").unwrap();
            writeln!(s, "    }}").unwrap();
        }
        None => {
            let off = binding_index(layout, Binding::Offsets { slot: r.slot });
            writeln!(s, "    for (var n = 0u; n < {p}u; n = n + 1u) {{").unwrap();
            writeln!(s, "        let index = b{off}[e * {p}u + n];").unwrap();
            if r.oriented {
                let ori = binding_index(layout, Binding::Orients { slot: r.slot });
                writeln!(s, "        let flip = b{ori}[e * {p}u + n] != 0u;").unwrap();
            }
            writeln!(s, "        for (var c = 0u; c < {nc}u; c = c + 1u) {{").unwrap();
            writeln!(s, "            var value = {src}[c * {p}u + n];").unwrap();
            if r.oriented {
                writeln!(s, "            if (flip) {{ value = -value; }}").unwrap();
            }
            writeln!(
                s,
                "            atomic_add_out(index + c * {}u, value);",
                r.comp_stride
            )
            .unwrap();
            writeln!(s, "        }}").unwrap();
            writeln!(s, "    }}").unwrap();
        }
    }
    s
}

fn table_binding(layout: &[Binding], emode: EvalMode, b: &KernelBasis) -> String {
    let binding = match emode {
        EvalMode::Interp => Binding::Interp { slot: b.slot },
        EvalMode::Grad | EvalMode::Div => Binding::Deriv { slot: b.slot },
        _ => unreachable!("no table for mode {emode:?}"),
    };
    format!("b{}", binding_index(layout, binding))
}
