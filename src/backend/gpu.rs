//! The GPU backend, built on `wgpu`.
//!
//! Scalars live on the device in single precision; conversion happens at
//! upload/readback. Restrictions run as fixed WGSL kernels parameterized
//! through a uniform block; QFunctions and operators are JIT-compiled from
//! generated WGSL (see [`crate::codegen`]) and the compiled fused modules
//! are cached in the context keyed by the full operator shape signature.

use crate::backend::registry::{ObjectKind, Registry};
use crate::backend::{
    BasisApplyFn, OperatorApplyAddFn, OperatorCompileFn, QFunctionApplyFn, QFunctionBuildFn,
    RestrictionApplyFn,
};
use crate::codegen::operator::{
    device_layout, fused_kernel_source, Binding, KernelBasis, KernelField, KernelOperator,
    KernelRestriction, KernelVector,
};
use crate::codegen::qfunction::qfunction_unit;
use crate::codegen::WORKGROUP_SIZE;
use crate::error::{Error, Result};
use crate::operator::{OperatorInner, OperatorPlan, OperatorSignature, PlannedField, VectorSpec};
use crate::qfunction::QFunction;
use crate::restriction::{ElemRestriction, RestrictionKind};
use crate::vector::Vector;
use crate::{basis::Basis, Scalar, TransposeMode};
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use wgpu::util::DeviceExt;

// -------------------------------------------------------------------------
// Context and registration
// -------------------------------------------------------------------------

pub(crate) struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    restriction_kernels: Mutex<Option<Arc<RestrictionPipelines>>>,
    fused_cache: Mutex<FxHashMap<OperatorSignature, Arc<FusedPipeline>>>,
}

impl GpuContext {
    /// Acquire an adapter and device. Fails with a configuration error when
    /// no suitable adapter exists (e.g. headless CI machines).
    pub(crate) fn acquire() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| Error::DeviceUnavailable {
            message: "no compatible adapter".to_string(),
        })?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("matfree-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| Error::DeviceUnavailable {
            message: e.to_string(),
        })?;

        Ok(Self {
            device,
            queue,
            restriction_kernels: Mutex::new(None),
            fused_cache: Mutex::new(FxHashMap::default()),
        })
    }
}

pub(crate) fn register(registry: &mut Registry, gpu: &Arc<GpuContext>) {
    let ctx = Arc::clone(gpu);
    let restriction_apply: RestrictionApplyFn = Arc::new(
        move |r: &ElemRestriction, tmode: TransposeMode, u: &Vector, v: &mut Vector| {
            restriction_apply_gpu(&ctx, r, tmode, u, v)
        },
    );
    registry.register(ObjectKind::ElemRestriction, "Apply", restriction_apply);

    // Basis tables are host-resident; standalone basis application uses the
    // sequential path. Fused operators apply bases on-device.
    let basis_apply: BasisApplyFn = Arc::new(crate::backend::host::basis_apply);
    registry.register(ObjectKind::Basis, "Apply", basis_apply);

    let ctx = Arc::clone(gpu);
    let qf_build: QFunctionBuildFn =
        Arc::new(move |qf: &QFunction| qfunction_build_gpu(&ctx, qf));
    registry.register(ObjectKind::QFunction, "Build", qf_build);

    let ctx = Arc::clone(gpu);
    let qf_apply: QFunctionApplyFn = Arc::new(
        move |qf: &QFunction, q: usize, ins: &[&[Scalar]], outs: &mut [&mut [Scalar]]| {
            qfunction_apply_gpu(&ctx, qf, q, ins, outs)
        },
    );
    registry.register(ObjectKind::QFunction, "Apply", qf_apply);

    let ctx = Arc::clone(gpu);
    let op_compile: OperatorCompileFn =
        Arc::new(move |inner: &mut OperatorInner| operator_compile_gpu(&ctx, inner));
    registry.register(ObjectKind::Operator, "Compile", op_compile);

    let ctx = Arc::clone(gpu);
    let op_apply: OperatorApplyAddFn = Arc::new(
        move |inner: &mut OperatorInner, x: &Vector, y: &mut Vector| {
            operator_apply_add_gpu(&ctx, inner, x, y)
        },
    );
    registry.register(ObjectKind::Operator, "ApplyAdd", op_apply);
}

// -------------------------------------------------------------------------
// Device helpers
// -------------------------------------------------------------------------

impl GpuContext {
    fn storage_f32(&self, label: &str, values: &[Scalar], writable: bool) -> wgpu::Buffer {
        let mut data: Vec<f32> = values.iter().map(|&x| x as f32).collect();
        if data.is_empty() {
            data.push(0.0);
        }
        let mut usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        if writable {
            usage |= wgpu::BufferUsages::COPY_SRC;
        }
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(&data),
                usage,
            })
    }

    fn storage_u32(&self, label: &str, values: &[u32]) -> wgpu::Buffer {
        let data: &[u32] = if values.is_empty() { &[0] } else { values };
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE,
            })
    }

    fn uniform_u32(&self, label: &str, values: &[u32]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(values),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    /// Compile a WGSL module under a validation error scope, so compiler
    /// rejections surface as build errors carrying the offending source.
    fn compile_module(&self, unit: &str, source: &str) -> Result<wgpu::ShaderModule> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(unit),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::ShaderBuild {
                unit: unit.to_string(),
                message: error.to_string(),
                generated_source: source.to_string(),
            });
        }
        Ok(module)
    }

    fn create_pipeline(
        &self,
        unit: &str,
        module: &wgpu::ShaderModule,
        entry_point: &str,
        source: &str,
    ) -> Result<wgpu::ComputePipeline> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(unit),
                layout: None,
                module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::ShaderBuild {
                unit: unit.to_string(),
                message: error.to_string(),
                generated_source: source.to_string(),
            });
        }
        Ok(pipeline)
    }

    /// Submit one compute dispatch.
    fn dispatch(&self, pipeline: &wgpu::ComputePipeline, bind_group: &wgpu::BindGroup, threads: usize) {
        let groups = workgroups_for(threads);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    /// Read a device buffer back to the host.
    fn read_f32(&self, source: &wgpu::Buffer, len: usize) -> Result<Vec<f32>> {
        let size = (len * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("matfree-staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| Error::DeviceUnavailable {
                message: "device disconnected during readback".to_string(),
            })?
            .map_err(|e| Error::DeviceUnavailable {
                message: format!("buffer mapping failed: {:?}", e),
            })?;
        let mapped = slice.get_mapped_range();
        let values: Vec<f32> = bytemuck::cast_slice(&mapped).to_vec();
        drop(mapped);
        staging.unmap();
        Ok(values)
    }

    /// Run one compute dispatch and read a result buffer back to the host.
    fn dispatch_and_read(
        &self,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        threads: usize,
        result: &wgpu::Buffer,
        result_len: usize,
    ) -> Result<Vec<f32>> {
        self.dispatch(pipeline, bind_group, threads);
        self.read_f32(result, result_len)
    }

    fn bind_group(
        &self,
        pipeline: &wgpu::ComputePipeline,
        buffers: &[&wgpu::Buffer],
    ) -> wgpu::BindGroup {
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        })
    }
}

fn workgroups_for(threads: usize) -> u32 {
    let groups = (threads as u32).div_ceil(WORKGROUP_SIZE).max(1);
    // Grid-striding in the kernels covers anything beyond the dispatch cap.
    groups.min(0xffff)
}

fn write_f32(queue: &wgpu::Queue, buffer: &wgpu::Buffer, values: &[Scalar]) {
    let data: Vec<f32> = values.iter().map(|&x| x as f32).collect();
    queue.write_buffer(buffer, 0, bytemuck::cast_slice(&data));
}

// -------------------------------------------------------------------------
// Element restriction kernels
// -------------------------------------------------------------------------

const STRIDED_SRC: &str = r#"
struct Params {
    num_elem: u32,
    elem_size: u32,
    num_comp: u32,
    stride_node: u32,
    stride_comp: u32,
    stride_elem: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> u: array<f32>;
@group(0) @binding(2) var<storage, read_write> v: array<f32>;

@compute @workgroup_size(64)
fn strided_no_transpose(@builtin(global_invocation_id) gid: vec3<u32>,
                        @builtin(num_workgroups) nwg: vec3<u32>) {
    let stride = nwg.x * 64u;
    var i = gid.x;
    loop {
        if (i >= params.num_elem * params.elem_size) { break; }
        let loc_node = i % params.elem_size;
        let elem = i / params.elem_size;
        for (var comp = 0u; comp < params.num_comp; comp = comp + 1u) {
            v[(elem * params.num_comp + comp) * params.elem_size + loc_node] =
                u[loc_node * params.stride_node + comp * params.stride_comp + elem * params.stride_elem];
        }
        i = i + stride;
    }
}

@compute @workgroup_size(64)
fn strided_transpose(@builtin(global_invocation_id) gid: vec3<u32>,
                     @builtin(num_workgroups) nwg: vec3<u32>) {
    let stride = nwg.x * 64u;
    var i = gid.x;
    loop {
        if (i >= params.num_elem * params.elem_size) { break; }
        let loc_node = i % params.elem_size;
        let elem = i / params.elem_size;
        for (var comp = 0u; comp < params.num_comp; comp = comp + 1u) {
            let l_index = loc_node * params.stride_node + comp * params.stride_comp + elem * params.stride_elem;
            v[l_index] = v[l_index] + u[(elem * params.num_comp + comp) * params.elem_size + loc_node];
        }
        i = i + stride;
    }
}
"#;

const OFFSET_FORWARD_SRC: &str = r#"
struct Params {
    num_elem: u32,
    elem_size: u32,
    num_comp: u32,
    comp_stride: u32,
    oriented: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> offsets: array<u32>;
@group(0) @binding(2) var<storage, read> orients: array<u32>;
@group(0) @binding(3) var<storage, read> u: array<f32>;
@group(0) @binding(4) var<storage, read_write> v: array<f32>;

@compute @workgroup_size(64)
fn offset_no_transpose(@builtin(global_invocation_id) gid: vec3<u32>,
                       @builtin(num_workgroups) nwg: vec3<u32>) {
    let stride = nwg.x * 64u;
    var i = gid.x;
    loop {
        if (i >= params.num_elem * params.elem_size) { break; }
        let index = offsets[i];
        let loc_node = i % params.elem_size;
        let elem = i / params.elem_size;
        let flip = params.oriented == 1u && orients[i] == 1u;
        for (var comp = 0u; comp < params.num_comp; comp = comp + 1u) {
            var value = u[index + comp * params.comp_stride];
            if (flip) { value = -value; }
            v[(elem * params.num_comp + comp) * params.elem_size + loc_node] = value;
        }
        i = i + stride;
    }
}
"#;

const OFFSET_TRANSPOSE_SRC: &str = r#"
struct Params {
    num_nodes: u32,
    elem_size: u32,
    num_comp: u32,
    comp_stride: u32,
    oriented: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> lvec_indices: array<u32>;
@group(0) @binding(2) var<storage, read> t_offsets: array<u32>;
@group(0) @binding(3) var<storage, read> t_indices: array<u32>;
@group(0) @binding(4) var<storage, read> orients: array<u32>;
@group(0) @binding(5) var<storage, read> u: array<f32>;
@group(0) @binding(6) var<storage, read_write> v: array<f32>;

// One thread per distinct L-vector node: every contribution to a node is
// summed locally before the single accumulating write, so no two threads
// ever touch the same location.
@compute @workgroup_size(64)
fn offset_transpose(@builtin(global_invocation_id) gid: vec3<u32>,
                    @builtin(num_workgroups) nwg: vec3<u32>) {
    let stride = nwg.x * 64u;
    var i = gid.x;
    loop {
        if (i >= params.num_nodes) { break; }
        let node = lvec_indices[i];
        let range_begin = t_offsets[i];
        let range_end = t_offsets[i + 1u];
        for (var comp = 0u; comp < params.num_comp; comp = comp + 1u) {
            var acc = 0.0;
            for (var j = range_begin; j < range_end; j = j + 1u) {
                let position = t_indices[j];
                let loc_node = position % params.elem_size;
                let elem = position / params.elem_size;
                var value = u[(elem * params.num_comp + comp) * params.elem_size + loc_node];
                if (params.oriented == 1u && orients[position] == 1u) { value = -value; }
                acc = acc + value;
            }
            let l_index = node + comp * params.comp_stride;
            v[l_index] = v[l_index] + acc;
        }
        i = i + stride;
    }
}
"#;

struct RestrictionPipelines {
    strided_forward: wgpu::ComputePipeline,
    strided_transpose: wgpu::ComputePipeline,
    offset_forward: wgpu::ComputePipeline,
    offset_transpose: wgpu::ComputePipeline,
}

fn restriction_pipelines(gpu: &GpuContext) -> Result<Arc<RestrictionPipelines>> {
    let mut cached = gpu.restriction_kernels.lock();
    if let Some(pipelines) = cached.as_ref() {
        return Ok(Arc::clone(pipelines));
    }
    let strided = gpu.compile_module("restriction-strided", STRIDED_SRC)?;
    let forward = gpu.compile_module("restriction-offset", OFFSET_FORWARD_SRC)?;
    let transpose = gpu.compile_module("restriction-offset-transpose", OFFSET_TRANSPOSE_SRC)?;
    let pipelines = Arc::new(RestrictionPipelines {
        strided_forward: gpu.create_pipeline(
            "restriction-strided",
            &strided,
            "strided_no_transpose",
            STRIDED_SRC,
        )?,
        strided_transpose: gpu.create_pipeline(
            "restriction-strided",
            &strided,
            "strided_transpose",
            STRIDED_SRC,
        )?,
        offset_forward: gpu.create_pipeline(
            "restriction-offset",
            &forward,
            "offset_no_transpose",
            OFFSET_FORWARD_SRC,
        )?,
        offset_transpose: gpu.create_pipeline(
            "restriction-offset-transpose",
            &transpose,
            "offset_transpose",
            OFFSET_TRANSPOSE_SRC,
        )?,
    });
    *cached = Some(Arc::clone(&pipelines));
    Ok(pipelines)
}

fn restriction_apply_gpu(
    gpu: &GpuContext,
    r: &ElemRestriction,
    tmode: TransposeMode,
    u: &Vector,
    v: &mut Vector,
) -> Result<()> {
    let pipelines = restriction_pipelines(gpu)?;
    let u_buf = gpu.storage_f32("restriction-u", u.as_slice(), false);
    let v_buf = gpu.storage_f32("restriction-v", v.as_slice(), true);

    let (pipeline, bind_group, threads) = match (r.kind(), tmode) {
        (RestrictionKind::Strided { strides }, _) => {
            let params = gpu.uniform_u32(
                "restriction-params",
                &[
                    r.num_elements() as u32,
                    r.elem_size() as u32,
                    r.num_components() as u32,
                    strides[0] as u32,
                    strides[1] as u32,
                    strides[2] as u32,
                    0,
                    0,
                ],
            );
            let pipeline = match tmode {
                TransposeMode::NoTranspose => &pipelines.strided_forward,
                TransposeMode::Transpose => &pipelines.strided_transpose,
            };
            let bind_group = gpu.bind_group(pipeline, &[&params, &u_buf, &v_buf]);
            (pipeline, bind_group, r.num_elements() * r.elem_size())
        }
        (
            RestrictionKind::Offsets {
                offsets, orients, ..
            },
            TransposeMode::NoTranspose,
        ) => {
            let params = gpu.uniform_u32(
                "restriction-params",
                &[
                    r.num_elements() as u32,
                    r.elem_size() as u32,
                    r.num_components() as u32,
                    r.comp_stride() as u32,
                    orients.is_some() as u32,
                    0,
                    0,
                    0,
                ],
            );
            let offsets_buf = gpu.storage_u32(
                "restriction-offsets",
                &offsets.iter().map(|&o| o as u32).collect::<Vec<_>>(),
            );
            let orients_buf = gpu.storage_u32(
                "restriction-orients",
                &orients
                    .as_ref()
                    .map(|o| o.iter().map(|&f| f as u32).collect::<Vec<_>>())
                    .unwrap_or_default(),
            );
            let pipeline = &pipelines.offset_forward;
            let bind_group =
                gpu.bind_group(pipeline, &[&params, &offsets_buf, &orients_buf, &u_buf, &v_buf]);
            (pipeline, bind_group, r.num_elements() * r.elem_size())
        }
        (
            RestrictionKind::Offsets {
                orients, transpose, ..
            },
            TransposeMode::Transpose,
        ) => {
            let params = gpu.uniform_u32(
                "restriction-params",
                &[
                    transpose.lvec_indices.len() as u32,
                    r.elem_size() as u32,
                    r.num_components() as u32,
                    r.comp_stride() as u32,
                    orients.is_some() as u32,
                    0,
                    0,
                    0,
                ],
            );
            let lvec_buf = gpu.storage_u32(
                "restriction-lvec-indices",
                &transpose
                    .lvec_indices
                    .iter()
                    .map(|&i| i as u32)
                    .collect::<Vec<_>>(),
            );
            let t_offsets_buf = gpu.storage_u32(
                "restriction-t-offsets",
                &transpose
                    .t_offsets
                    .iter()
                    .map(|&i| i as u32)
                    .collect::<Vec<_>>(),
            );
            let t_indices_buf = gpu.storage_u32(
                "restriction-t-indices",
                &transpose
                    .t_indices
                    .iter()
                    .map(|&i| i as u32)
                    .collect::<Vec<_>>(),
            );
            let orients_buf = gpu.storage_u32(
                "restriction-orients",
                &orients
                    .as_ref()
                    .map(|o| o.iter().map(|&f| f as u32).collect::<Vec<_>>())
                    .unwrap_or_default(),
            );
            let pipeline = &pipelines.offset_transpose;
            let bind_group = gpu.bind_group(
                pipeline,
                &[
                    &params,
                    &lvec_buf,
                    &t_offsets_buf,
                    &t_indices_buf,
                    &orients_buf,
                    &u_buf,
                    &v_buf,
                ],
            );
            (pipeline, bind_group, transpose.lvec_indices.len())
        }
    };

    let values = gpu.dispatch_and_read(pipeline, &bind_group, threads, &v_buf, v.len())?;
    for (dst, &src) in v.as_mut_slice().iter_mut().zip(&values) {
        *dst = src as Scalar;
    }
    Ok(())
}

// -------------------------------------------------------------------------
// QFunction JIT
// -------------------------------------------------------------------------

pub(crate) struct QFunctionPipeline {
    pipeline: wgpu::ComputePipeline,
}

fn qfunction_build_gpu(gpu: &GpuContext, qf: &QFunction) -> Result<()> {
    let mut state = qf.device.lock();
    if state.compiled.is_some() {
        // Already compiled; the source may be long gone, and that is fine.
        debug!("QFunction '{}': reusing compiled kernel", qf.name());
        return Ok(());
    }
    let source = state.source.as_ref().ok_or_else(|| Error::MissingKernel {
        name: qf.name().to_string(),
        what: "device kernel source",
        backend: "gpu".to_string(),
    })?;

    let input_sizes: Vec<usize> = qf.inputs().iter().map(|f| f.size()).collect();
    let output_sizes: Vec<usize> = qf.outputs().iter().map(|f| f.size()).collect();
    let unit = qfunction_unit(&state.entry_point, source, &input_sizes, &output_sizes);
    debug!("QFunction '{}' generated unit:\n{}", qf.name(), unit.source);

    let label = format!("qfunction-{}", qf.name());
    let module = gpu.compile_module(&label, &unit.source)?;
    let pipeline = gpu.create_pipeline(&label, &module, &unit.entry_point, &unit.source)?;

    state.compiled = Some(Arc::new(QFunctionPipeline { pipeline }));
    // The source has served its purpose; rebuilding reuses the pipeline.
    state.source = None;
    Ok(())
}

fn qfunction_apply_gpu(
    gpu: &GpuContext,
    qf: &QFunction,
    num_points: usize,
    inputs: &[&[Scalar]],
    outputs: &mut [&mut [Scalar]],
) -> Result<()> {
    qfunction_build_gpu(gpu, qf)?;
    let compiled = {
        let state = qf.device.lock();
        state
            .compiled
            .as_ref()
            .expect("built qfunction has a pipeline")
            .clone()
    };
    let Ok(compiled) = compiled.downcast::<QFunctionPipeline>() else {
        unreachable!("gpu backend stores a gpu pipeline");
    };

    let params = gpu.uniform_u32("qfunction-params", &[num_points as u32, 0, 0, 0]);
    let input_buffers: Vec<wgpu::Buffer> = inputs
        .iter()
        .map(|data| gpu.storage_f32("qfunction-in", data, false))
        .collect();
    let output_buffers: Vec<wgpu::Buffer> = outputs
        .iter()
        .map(|data| gpu.storage_f32("qfunction-out", &vec![0.0; data.len()], true))
        .collect();

    let mut buffers: Vec<&wgpu::Buffer> = vec![&params];
    buffers.extend(input_buffers.iter());
    buffers.extend(output_buffers.iter());
    let bind_group = gpu.bind_group(&compiled.pipeline, &buffers);

    gpu.dispatch(&compiled.pipeline, &bind_group, num_points);
    for (output, buffer) in outputs.iter_mut().zip(&output_buffers) {
        let values = gpu.read_f32(buffer, output.len())?;
        for (dst, &src) in output.iter_mut().zip(&values) {
            *dst = src as Scalar;
        }
    }
    Ok(())
}

// -------------------------------------------------------------------------
// Fused operator
// -------------------------------------------------------------------------

pub(crate) struct FusedPipeline {
    pipeline: wgpu::ComputePipeline,
    layout: Vec<Binding>,
}

struct GpuOperatorData {
    fused: Arc<FusedPipeline>,
    bind_group: wgpu::BindGroup,
    /// One buffer per binding, in layout order.
    buffers: Vec<wgpu::Buffer>,
    active_input_idx: usize,
    output_idx: usize,
    num_elem: usize,
    out_len: usize,
}

/// Lower the operator plan to the pure codegen description, assigning
/// canonical slots to shared restrictions/bases in field order. The user
/// entry/source are filled in separately, and only when a kernel actually
/// has to be generated: a module-cache hit must not require the (possibly
/// already freed) QFunction source.
fn kernel_operator_from_plan(
    plan: &OperatorPlan,
) -> (KernelOperator, Vec<Arc<ElemRestriction>>, Vec<Arc<Basis>>) {
    let mut restr_slots: Vec<Arc<ElemRestriction>> = Vec::new();
    let mut basis_slots: Vec<Arc<Basis>> = Vec::new();
    let mut lower = |field: &PlannedField| -> KernelField {
        let restriction = field.restriction.as_ref().map(|r| {
            let ptr = Arc::as_ptr(r);
            let slot = restr_slots
                .iter()
                .position(|x| Arc::as_ptr(x) == ptr)
                .unwrap_or_else(|| {
                    restr_slots.push(Arc::clone(r));
                    restr_slots.len() - 1
                });
            KernelRestriction {
                slot,
                elem_size: r.elem_size(),
                num_comp: r.num_components(),
                comp_stride: r.comp_stride(),
                strides: match r.kind() {
                    RestrictionKind::Strided { strides } => Some(*strides),
                    RestrictionKind::Offsets { .. } => None,
                },
                oriented: r.is_oriented(),
            }
        });
        let basis = field.basis.as_ref().map(|b| {
            let ptr = Arc::as_ptr(b);
            let slot = basis_slots
                .iter()
                .position(|x| Arc::as_ptr(x) == ptr)
                .unwrap_or_else(|| {
                    basis_slots.push(Arc::clone(b));
                    basis_slots.len() - 1
                });
            KernelBasis {
                slot,
                num_nodes: b.num_nodes(),
                interp_rows: b.interp_rows(),
                deriv_rows: b.deriv_rows(),
            }
        });
        KernelField {
            size: field.size,
            eval_mode: field.eval_mode,
            role: match field.vector {
                VectorSpec::Active => KernelVector::Active,
                VectorSpec::Fixed(_) => KernelVector::Fixed,
                VectorSpec::None => KernelVector::None,
            },
            restriction,
            basis,
        }
    };

    let inputs: Vec<KernelField> = plan.inputs.iter().map(&mut lower).collect();
    let outputs: Vec<KernelField> = plan.outputs.iter().map(&mut lower).collect();
    (
        KernelOperator {
            user_entry: String::new(),
            user_source: String::new(),
            num_qpts: plan.num_qpts,
            inputs,
            outputs,
        },
        restr_slots,
        basis_slots,
    )
}

fn operator_compile_gpu(gpu: &GpuContext, inner: &mut OperatorInner) -> Result<()> {
    let plan = inner.plan.as_ref().expect("compile requires a plan").clone();
    let (mut kernel_op, restr_slots, basis_slots) = kernel_operator_from_plan(&plan);

    let fused = {
        let mut cache = gpu.fused_cache.lock();
        if let Some(fused) = cache.get(&plan.signature) {
            debug!(
                "operator '{}': fused module cache hit",
                plan.qf.name()
            );
            Arc::clone(fused)
        } else {
            {
                let state = plan.qf.device.lock();
                let source = state.source.clone().ok_or_else(|| Error::MissingKernel {
                    name: plan.qf.name().to_string(),
                    what: "device kernel source",
                    backend: "gpu".to_string(),
                })?;
                kernel_op.user_entry = state.entry_point.clone();
                kernel_op.user_source = source;
            }
            let layout = device_layout(&kernel_op);
            let source = fused_kernel_source(&kernel_op, &layout);
            debug!(
                "operator '{}' generated fused kernel:\n{}",
                plan.qf.name(),
                source
            );
            let label = format!("operator-{}", plan.qf.name());
            let module = gpu.compile_module(&label, &source)?;
            let pipeline = gpu.create_pipeline(&label, &module, "op_main", &source)?;
            let fused = Arc::new(FusedPipeline { pipeline, layout });
            cache.insert(plan.signature.clone(), Arc::clone(&fused));
            fused
        }
    };

    // Materialize one buffer per binding. Fixed vectors, index tables and
    // basis tables upload once here; the active vectors get fresh contents
    // on every apply.
    let active_in = &plan.inputs[plan.active_input];
    let active_out = &plan.outputs[plan.active_output];
    let in_len = active_in
        .restriction
        .as_ref()
        .expect("active input restriction")
        .l_size();
    let out_len = active_out
        .restriction
        .as_ref()
        .expect("active output restriction")
        .l_size();

    let mut buffers: Vec<wgpu::Buffer> = Vec::with_capacity(fused.layout.len());
    let mut active_input_idx = None;
    let mut output_idx = None;
    for binding in &fused.layout {
        let buffer = match *binding {
            Binding::Params => gpu.uniform_u32("operator-params", &[plan.num_elem as u32, 0, 0, 0]),
            Binding::Offsets { slot } => {
                let r = &restr_slots[slot];
                match r.kind() {
                    RestrictionKind::Offsets { offsets, .. } => gpu.storage_u32(
                        "operator-offsets",
                        &offsets.iter().map(|&o| o as u32).collect::<Vec<_>>(),
                    ),
                    RestrictionKind::Strided { .. } => unreachable!("strided has no offsets"),
                }
            }
            Binding::Orients { slot } => {
                let r = &restr_slots[slot];
                match r.kind() {
                    RestrictionKind::Offsets {
                        orients: Some(orients),
                        ..
                    } => gpu.storage_u32(
                        "operator-orients",
                        &orients.iter().map(|&f| f as u32).collect::<Vec<_>>(),
                    ),
                    _ => unreachable!("orients binding requires an oriented restriction"),
                }
            }
            Binding::Interp { slot } => {
                gpu.storage_f32("operator-interp", &basis_slots[slot].dense_interp(), false)
            }
            Binding::Deriv { slot } => gpu.storage_f32(
                "operator-deriv",
                &basis_slots[slot].dense_derivative(),
                false,
            ),
            Binding::Weights { slot } => {
                gpu.storage_f32("operator-weights", &basis_slots[slot].full_weights(), false)
            }
            Binding::ActiveInput => {
                let buffer = gpu.storage_f32("operator-active-in", &vec![0.0; in_len], false);
                active_input_idx = Some(buffers.len());
                buffer
            }
            Binding::FixedInput { field } => {
                let VectorSpec::Fixed(vector) = &plan.inputs[field].vector else {
                    unreachable!("fixed binding requires a fixed vector");
                };
                gpu.storage_f32("operator-fixed-in", vector.as_slice(), false)
            }
            Binding::Output => {
                let buffer = gpu.storage_f32("operator-out", &vec![0.0; out_len], true);
                output_idx = Some(buffers.len());
                buffer
            }
        };
        buffers.push(buffer);
    }

    let refs: Vec<&wgpu::Buffer> = buffers.iter().collect();
    let bind_group = gpu.bind_group(&fused.pipeline, &refs);

    inner.backend_data = Some(Box::new(GpuOperatorData {
        fused,
        bind_group,
        active_input_idx: active_input_idx.expect("layout contains the active input"),
        output_idx: output_idx.expect("layout contains the output"),
        num_elem: plan.num_elem,
        out_len,
        buffers,
    }));
    Ok(())
}

fn operator_apply_add_gpu(
    gpu: &GpuContext,
    inner: &mut OperatorInner,
    x: &Vector,
    y: &mut Vector,
) -> Result<()> {
    let data = inner
        .backend_data
        .as_ref()
        .expect("compiled operator has backend data")
        .downcast_ref::<GpuOperatorData>()
        .expect("gpu operator data");

    write_f32(&gpu.queue, &data.buffers[data.active_input_idx], x.as_slice());
    // The kernel accumulates into the output bits, so uploading the current
    // contents of `y` realizes apply-add semantics.
    write_f32(&gpu.queue, &data.buffers[data.output_idx], y.as_slice());

    let values = gpu.dispatch_and_read(
        &data.fused.pipeline,
        &data.bind_group,
        data.num_elem,
        &data.buffers[data.output_idx],
        data.out_len,
    )?;
    for (dst, &src) in y.as_mut_slice().iter_mut().zip(&values) {
        *dst = src as Scalar;
    }
    Ok(())
}
