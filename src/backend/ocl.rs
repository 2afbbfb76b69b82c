//! The OpenCL backend (§4.H, the hardest subsystem): a work-group-tiled
//! kernel with cooperative halo prefetch into local memory, one kernel per
//! convolution channel, plus boundary-copy subkernels for [`BoundaryMode::Copy`].
//!
//! Source generation is textual (the original's approach, appropriate for a
//! kernel whose shape is only known at specialization time) and the host
//! side drives compilation and launch through the [`ocl`] crate, the
//! idiomatic Rust OpenCL binding used across this corpus for GPU-backed
//! work. The explicit launch state machine from §4.H is modeled as
//! [`LaunchState`] so a caller can tell a partially-enqueued artifact from a
//! finished one.

use ocl::{Buffer, Context, Device, Kernel, Platform, Program, Queue};
use thiserror::Error;

use super::{Artifact, Backend, BackendId, KernelMeta};
use crate::boundary::BoundaryMode;
use crate::grid::{DType, GridDescriptor};
use crate::ir::unroll::{ConvolutionTerms, PostOp, UnrolledKernel};
use crate::planner::{self, Plan};
use crate::{StencilConfig, StencilError};

/// Errors specific to the OpenCL backend, wrapped into [`StencilError::Device`].
#[derive(Debug, Error)]
pub enum OclError {
    /// No platform/device matched `cfg.device_index`.
    #[error("no OpenCL device at index {0}")]
    NoSuchDevice(usize),
    /// The underlying `ocl` crate reported an error.
    #[error(transparent)]
    Ocl(#[from] ocl::Error),
    /// A launch method was called out of state-machine order (§4.H).
    #[error("launch state machine: expected {expected}, was in {actual}")]
    BadLaunchState {
        /// State required by the call.
        expected: &'static str,
        /// State the artifact was actually in.
        actual: &'static str,
    },
}

/// States of the host-side launch state machine (§4.H). An artifact is
/// constructed in `Compiled` and advances forward only; a failure at any
/// stage leaves it in that stage, and the caller must discard it rather
/// than retry in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Uncompiled,
    Compiling,
    Compiled,
    ArgsSet,
    RangeEnqueued,
    Finished,
}

impl LaunchState {
    fn tag(self) -> &'static str {
        match self {
            LaunchState::Uncompiled => "Uncompiled",
            LaunchState::Compiling => "Compiling",
            LaunchState::Compiled => "Compiled",
            LaunchState::ArgsSet => "ArgsSet",
            LaunchState::RangeEnqueued => "RangeEnqueued",
            LaunchState::Finished => "Finished",
        }
    }
}

/// A compiled OpenCL specialization: generated source, the chosen tiling,
/// and the device handles needed to enqueue it.
pub struct CompiledOcl {
    source: String,
    plan: Plan,
    context: Context,
    queue: Queue,
    program: Program,
    channel_kernel_names: Vec<String>,
    boundary_kernel_specs: Vec<BoundaryPlateSpec>,
    grid_shape: Vec<usize>,
    ghost_depth: Vec<usize>,
    state: std::sync::Mutex<LaunchState>,
}

/// A boundary-plate kernel's launch geometry: the plate covers the full
/// grid extent in every dimension except `dim`, where it covers only the
/// `ghost_depth[dim]`-wide slice at the low or high end (§4.H, §4.E).
struct BoundaryPlateSpec {
    name: String,
    offset: Vec<usize>,
    extent: Vec<usize>,
}

impl CompiledOcl {
    /// The generated kernel source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The work-size plan this source was generated against.
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Current stage of the launch state machine.
    pub fn state(&self) -> LaunchState {
        *self.state.lock().expect("launch state mutex poisoned")
    }
}

/// The OpenCL backend implementation, bound to one device index.
#[derive(Debug, Clone, Copy, Default)]
pub struct OclBackend;

impl Backend for OclBackend {
    fn id(&self) -> BackendId {
        BackendId::Ocl
    }

    fn lower(&self, kernel: &UnrolledKernel, meta: &KernelMeta, cfg: &StencilConfig) -> Result<Artifact, StencilError> {
        let device = select_device(cfg.device_index)?;
        let context = Context::builder()
            .platform(device.0)
            .devices(device.1)
            .build()
            .map_err(OclError::from)?;
        let queue = Queue::new(&context, device.1, None).map_err(OclError::from)?;

        let limits = device_limits(&device.1, meta.neighborhoods.len())?;
        let plan = planner::plan(&meta.grid_shape, &meta.ghost_depth, &limits, meta.dtype.size_bytes(), cfg.testing)
            .map_err(StencilError::from)?;

        let source = generate_source(kernel, meta, &plan);
        let program = Program::builder()
            .devices(device.1)
            .src(source.clone())
            .build(&context)
            .map_err(OclError::from)?;

        let channel_kernel_names = (0..kernel.convolutions.len()).map(|c| format!("kernel_c{c}")).collect();
        let boundary_kernel_specs = if meta.boundary == BoundaryMode::Copy {
            boundary_plate_specs(meta.grid_shape.len(), &meta.grid_shape, &kernel.ghost_depth)
        } else {
            Vec::new()
        };

        Ok(Artifact::Ocl(CompiledOcl {
            source,
            plan,
            context,
            queue,
            program,
            channel_kernel_names,
            boundary_kernel_specs,
            grid_shape: meta.grid_shape.clone(),
            ghost_depth: kernel.ghost_depth.clone(),
            state: std::sync::Mutex::new(LaunchState::Compiled),
        }))
    }

    fn launch(
        &self,
        artifact: &Artifact,
        inputs: &[&GridDescriptor],
        outputs: &mut [GridDescriptor],
        _meta: &KernelMeta,
    ) -> Result<(), StencilError> {
        let compiled = match artifact {
            Artifact::Ocl(c) => c,
            _ => return Err(StencilError::wrong_artifact(BackendId::Ocl, artifact.backend_id())),
        };

        {
            let mut state = compiled.state.lock().expect("launch state mutex poisoned");
            if *state != LaunchState::Compiled {
                return Err(OclError::BadLaunchState { expected: "Compiled", actual: state.tag() }.into());
            }
            *state = LaunchState::ArgsSet;
        }

        let result = run_launch(compiled, inputs, outputs);

        let mut state = compiled.state.lock().expect("launch state mutex poisoned");
        *state = match &result {
            Ok(()) => LaunchState::Finished,
            Err(_) => LaunchState::ArgsSet,
        };
        result
    }
}

fn run_launch(compiled: &CompiledOcl, inputs: &[&GridDescriptor], outputs: &mut [GridDescriptor]) -> Result<(), StencilError> {
    if compiled.channel_kernel_names.len() != outputs.len() {
        return Err(StencilError::ChannelCountMismatch {
            expected: compiled.channel_kernel_names.len(),
            got: outputs.len(),
        });
    }

    let input_buffers: Vec<Buffer<f64>> = inputs
        .iter()
        .map(|g| {
            Buffer::<f64>::builder()
                .queue(compiled.queue.clone())
                .len(g.element_count())
                .copy_host_slice(&g.to_f64_vec())
                .build()
                .map_err(OclError::from)
        })
        .collect::<Result<_, _>>()?;

    let mut output_buffers: Vec<Buffer<f64>> = outputs
        .iter()
        .map(|g| {
            Buffer::<f64>::builder()
                .queue(compiled.queue.clone())
                .len(g.element_count())
                .build()
                .map_err(OclError::from)
        })
        .collect::<Result<_, _>>()?;

    // Every boundary plate applies to every output channel independently —
    // `boundary_kernel_specs` and `output_buffers` are not parallel arrays,
    // each plate must run once per channel.
    for out_buf in output_buffers.iter() {
        for spec in &compiled.boundary_kernel_specs {
            let kernel = Kernel::builder()
                .program(&compiled.program)
                .name(&spec.name)
                .queue(compiled.queue.clone())
                .global_work_offset(spec.offset.as_slice())
                .global_work_size(spec.extent.as_slice())
                .arg(&input_buffers[0])
                .arg(out_buf)
                .build()
                .map_err(OclError::from)?;
            unsafe {
                kernel.cmd().enq().map_err(OclError::from)?;
            }
        }
    }

    {
        let mut state = compiled.state.lock().expect("launch state mutex poisoned");
        *state = LaunchState::RangeEnqueued;
    }

    let tile_elems: usize = tile_extents(&compiled.plan, &compiled.ghost_depth).iter().product();
    for (name, out_buf) in compiled.channel_kernel_names.iter().zip(output_buffers.iter()) {
        let mut builder = Kernel::builder();
        builder
            .program(&compiled.program)
            .name(name)
            .queue(compiled.queue.clone())
            .global_work_size(&compiled.plan.virtual_global_size)
            .local_work_size(&compiled.plan.local_size);
        for input in &input_buffers {
            builder.arg(input);
        }
        builder.arg(out_buf);
        builder.arg_local::<f64>(tile_elems);
        let kernel = builder.build().map_err(OclError::from)?;
        unsafe {
            kernel.cmd().enq().map_err(OclError::from)?;
        }
    }

    compiled.queue.finish().map_err(OclError::from)?;

    for (out_buf, grid) in output_buffers.iter_mut().zip(outputs.iter_mut()) {
        let mut host = vec![0f64; grid.element_count()];
        out_buf.read(&mut host).enq().map_err(OclError::from)?;
        for (point, value) in grid.all_points().zip(host) {
            grid.set(&point, value);
        }
    }

    Ok(())
}

fn select_device(index: usize) -> Result<(Platform, Device), StencilError> {
    let platform = Platform::default();
    let devices = Device::list_all(platform).map_err(OclError::from)?;
    // `usize::MAX` is `StencilConfig::device_index`'s default sentinel for
    // "the last available device" (§6).
    let resolved = if index == usize::MAX {
        devices.len().checked_sub(1).ok_or(OclError::NoSuchDevice(index))?
    } else {
        index
    };
    let device = devices.get(resolved).copied().ok_or(OclError::NoSuchDevice(resolved))?;
    Ok((platform, device))
}

fn device_limits(device: &Device, ndim: usize) -> Result<crate::planner::DeviceLimits, StencilError> {
    let max_work_group = device.max_wg_size().map_err(OclError::from)?;
    let max_local_mem_bytes = match device.info(ocl::enums::DeviceInfo::LocalMemSize).map_err(OclError::from)? {
        ocl::enums::DeviceInfoResult::LocalMemSize(bytes) => bytes as usize,
        _ => 0,
    };
    Ok(crate::planner::DeviceLimits {
        max_work_group,
        max_per_dim: vec![max_work_group; ndim],
        max_local_mem_bytes,
    })
}

/// One [`BoundaryPlateSpec`] per (dimension, side), in the same
/// low-then-high, dimension-ascending order [`generate_source`] emits the
/// matching kernel functions in. The low plate for dimension `d` covers
/// `[0, ghost_depth[d])` along `d` and the full extent elsewhere; the high
/// plate covers `[shape[d] - ghost_depth[d], shape[d])`.
fn boundary_plate_specs(ndim: usize, shape: &[usize], ghost_depth: &[usize]) -> Vec<BoundaryPlateSpec> {
    (0..ndim)
        .flat_map(|d| {
            let depth = ghost_depth.get(d).copied().unwrap_or(0);
            let mut lo_extent = shape.to_vec();
            lo_extent[d] = depth;
            let hi_extent = lo_extent.clone();
            let lo_offset = vec![0; ndim];
            let mut hi_offset = vec![0; ndim];
            hi_offset[d] = shape[d].saturating_sub(depth);
            [
                BoundaryPlateSpec { name: format!("boundary_lo_d{d}"), offset: lo_offset, extent: lo_extent },
                BoundaryPlateSpec { name: format!("boundary_hi_d{d}"), offset: hi_offset, extent: hi_extent },
            ]
        })
        .collect()
}

/// Generate the full OpenCL C source for `kernel`/`meta`/`plan` (§4.H):
/// local/global index macros, the shared-memory block loader, one
/// interior kernel per convolution channel, and (for `Copy` boundary
/// handling) one boundary-plate kernel per (dimension, side).
fn generate_source(kernel: &UnrolledKernel, meta: &KernelMeta, plan: &Plan) -> String {
    let ndim = meta.grid_shape.len();
    let mut src = String::new();

    src.push_str("// Generated by the stencil crate's OpenCL backend; do not edit by hand.\n\n");
    emit_index_macros(&mut src, ndim, &kernel.ghost_depth, plan, &meta.grid_shape);
    emit_tile_loader(&mut src, ndim, &kernel.ghost_depth, &meta.grid_shape, plan, meta.boundary);

    for (c, conv) in kernel.convolutions.iter().enumerate() {
        emit_channel_kernel(&mut src, c, conv, meta, &kernel.ghost_depth);
    }

    if meta.boundary == BoundaryMode::Copy {
        for d in 0..ndim {
            emit_boundary_plate(&mut src, d, &meta.grid_shape, true);
            emit_boundary_plate(&mut src, d, &meta.grid_shape, false);
        }
    }

    src
}

/// `global_array_macro` indexes the global buffer with `shape`'s row-major
/// strides; `local_array_macro` indexes `block`, whose extent per dimension
/// is the *tile* (`local_size[d] + 2*ghost_depth[d]`, §4.F), not `local_size`
/// alone — using plain `local_size` strides here would alias distinct tile
/// cells onto the same flat offset.
fn emit_index_macros(src: &mut String, ndim: usize, ghost_depth: &[usize], plan: &Plan, shape: &[usize]) {
    let global_args: Vec<String> = (0..ndim).map(|d| format!("d{d}")).collect();
    let global_strides = crate::grid::row_major_strides(shape);
    let global_expr: Vec<String> = global_args
        .iter()
        .zip(&global_strides)
        .map(|(a, s)| format!("({a}) * {s}"))
        .collect();
    src.push_str(&format!(
        "#define global_array_macro({}) ({})\n",
        global_args.join(", "),
        global_expr.join(" + ")
    ));

    let tile_extent = tile_extents(plan, ghost_depth);
    let local_strides = crate::grid::row_major_strides(&tile_extent);
    let local_expr: Vec<String> = global_args
        .iter()
        .zip(&local_strides)
        .map(|(a, s)| format!("({a}) * {s}"))
        .collect();
    src.push_str(&format!(
        "#define local_array_macro({}) ({})\n\n",
        global_args.join(", "),
        local_expr.join(" + ")
    ));
}

fn tile_extents(plan: &Plan, ghost_depth: &[usize]) -> Vec<usize> {
    plan.local_size.iter().zip(ghost_depth).map(|(&l, &g)| l + 2 * g).collect()
}

/// The shared-memory block loader (§4.H): every work-item in a group
/// cooperatively fills `block` with the group's tile plus halo, read from
/// the first input grid, before any work-item runs the stencil op on it.
///
/// Emitted once as a plain (non-`__kernel`) function and called from every
/// per-channel kernel, since all channels share the same input-0 tile.
fn emit_tile_loader(src: &mut String, ndim: usize, ghost_depth: &[usize], shape: &[usize], plan: &Plan, mode: BoundaryMode) {
    let tile_extent = tile_extents(plan, ghost_depth);
    let tile_size: usize = tile_extent.iter().product();
    let num_threads: usize = plan.local_size.iter().product();
    let local_stride = crate::grid::row_major_strides(&plan.local_size);

    src.push_str(&format!(
        "// Shared-memory block loader: tile_size={tile_size}, num_threads={num_threads}, boundary={}\n",
        mode.tag()
    ));
    src.push_str("static void load_tile_in0(__global const double* in0, __local double* block) {\n");

    let thread_id_terms: Vec<String> = (0..ndim).map(|d| format!("get_local_id({d}) * {}", local_stride[d])).collect();
    src.push_str(&format!("    int thread_id = {};\n", thread_id_terms.join(" + ")));

    src.push_str(&format!("    for (int tid = thread_id; tid < {tile_size}; tid += {num_threads}) {{\n"));
    src.push_str("        int rem = tid;\n");
    // Unflatten `tid` in reverse dimension order (§4.H: "successive
    // division/modulo with the tile extents in reverse dimension order").
    for d in (0..ndim).rev() {
        if d == 0 {
            src.push_str("        int t0 = rem;\n");
        } else {
            src.push_str(&format!("        int t{d} = rem % {}; rem /= {};\n", tile_extent[d], tile_extent[d]));
        }
    }
    for d in 0..ndim {
        src.push_str(&format!(
            "        int c{d} = t{d} + get_group_id({d}) * {} - {};\n",
            plan.local_size[d], ghost_depth.get(d).copied().unwrap_or(0)
        ));
    }

    let coords_raw: Vec<String> = (0..ndim).map(|d| format!("c{d}")).collect();
    match mode {
        BoundaryMode::Zero => {
            let in_range: Vec<String> = (0..ndim).map(|d| format!("c{d} >= 0 && c{d} < {}", shape[d])).collect();
            src.push_str(&format!("        if ({}) {{\n", in_range.join(" && ")));
            src.push_str(&format!("            block[tid] = in0[global_array_macro({})];\n", coords_raw.join(", ")));
            src.push_str("        }\n");
        }
        BoundaryMode::Clamp | BoundaryMode::Copy => {
            for d in 0..ndim {
                src.push_str(&format!("        c{d} = clamp(c{d}, 0, {});\n", shape[d] as i64 - 1));
            }
            src.push_str(&format!("        block[tid] = in0[global_array_macro({})];\n", coords_raw.join(", ")));
        }
        BoundaryMode::Warp => {
            for d in 0..ndim {
                src.push_str(&format!("        c{d} = ((c{d} % {e}) + {e}) % {e};\n", e = shape[d] as i64));
            }
            src.push_str(&format!("        block[tid] = in0[global_array_macro({})];\n", coords_raw.join(", ")));
        }
    }
    src.push_str("    }\n");
    src.push_str("}\n\n");
}

fn emit_channel_kernel(src: &mut String, c: usize, conv: &ConvolutionTerms, meta: &KernelMeta, ghost_depth: &[usize]) {
    let ndim = meta.grid_shape.len();
    let params: Vec<String> = (0..meta.num_inputs)
        .map(|i| format!("__global const double* in{i}"))
        .chain(std::iter::once("__global double* out".to_string()))
        .collect();

    src.push_str(&format!("__kernel void kernel_c{c}(\n    {},\n    __local double* block\n) {{\n", params.join(",\n    ")));
    for d in 0..ndim {
        src.push_str(&format!("    int g{d} = get_global_id({d});\n"));
    }
    src.push_str("    load_tile_in0(in0, block);\n");
    src.push_str("    barrier(CLK_LOCAL_MEM_FENCE);\n");
    for d in 0..ndim {
        src.push_str(&format!("    int lid{d} = get_local_id({d}) + {};\n", ghost_depth.get(d).copied().unwrap_or(0)));
    }

    // §4.E: `zero`/`copy` only compute the interior band in this kernel —
    // `zero` leaves the halo at its allocated zero, `copy`'s halo is
    // overwritten by the boundary plates afterward, so the two ranges must
    // stay disjoint. `clamp`/`warp` instead resolve every out-of-range
    // neighbor read in place, so the whole (virtual-global-size-masked)
    // range is computed here, matching `backend::cpu`'s per-point split.
    let resolves_in_kernel = matches!(meta.boundary, BoundaryMode::Clamp | BoundaryMode::Warp);
    let guard: Vec<String> = (0..ndim)
        .map(|d| {
            if resolves_in_kernel {
                format!("g{d} < {}", meta.grid_shape[d])
            } else {
                format!(
                    "g{d} >= {} && g{d} < {}",
                    meta.ghost_depth.get(d).copied().unwrap_or(0),
                    meta.grid_shape[d].saturating_sub(meta.ghost_depth.get(d).copied().unwrap_or(0))
                )
            }
        })
        .collect();
    src.push_str(&format!("    if ({}) {{\n", guard.join(" && ")));
    src.push_str("        double sum = 0.0;\n");
    for term in &conv.terms {
        if term.input == 0 {
            // §4.H step 7: the first input reads through the local tile,
            // indexed by this work-item's own local id plus the offset —
            // the tile loader already resolved any out-of-range halo cell.
            let coords: Vec<String> = term
                .offset
                .iter()
                .enumerate()
                .map(|(d, o)| format!("(lid{d} + ({o}))"))
                .collect();
            src.push_str(&format!(
                "        sum += {:.17} * block[local_array_macro({})];\n",
                term.coefficient,
                coords.join(", ")
            ));
            continue;
        }
        let coords: Vec<String> = term
            .offset
            .iter()
            .enumerate()
            .map(|(d, o)| resolved_index_expr(meta.boundary, &format!("g{d}"), *o, meta.grid_shape[d]))
            .collect();
        src.push_str(&format!(
            "        sum += {:.17} * in{}[global_array_macro({})];\n",
            term.coefficient,
            term.input,
            coords.join(", ")
        ));
    }
    match &conv.post_op {
        PostOp::Identity => {}
        PostOp::Call { name, extra_args } => {
            let mut args = vec!["sum".to_string()];
            args.extend(extra_args.iter().map(|a| format!("{a:.17}")));
            src.push_str(&format!("        sum = {}({});\n", name.ocl_name(), args.join(", ")));
        }
    }
    let out_coords: Vec<String> = (0..ndim).map(|d| format!("g{d}")).collect();
    src.push_str(&format!("        out[global_array_macro({})] = sum;\n", out_coords.join(", ")));
    src.push_str("    }\n");
    src.push_str("}\n\n");
}

/// One offset-adjusted index expression, with clamp/warp injected per §4.E
/// ("Injected `clamp(i, 0, shape-1)` around each index expression in halo
/// load" / "Modular arithmetic on halo load indices") when `mode` resolves
/// in-kernel; `zero`/`copy` never reach an out-of-range offset here since
/// their guard already restricts to the interior band.
fn resolved_index_expr(mode: BoundaryMode, base: &str, offset: i64, extent: usize) -> String {
    let raw = format!("({base} + ({offset}))");
    match mode {
        BoundaryMode::Clamp | BoundaryMode::Copy => format!("clamp({raw}, 0, {})", extent as i64 - 1),
        BoundaryMode::Warp => format!("((({raw}) % {e} + {e}) % {e})", e = extent as i64),
        BoundaryMode::Zero => raw,
    }
}

/// A boundary-plate kernel body: `get_global_id(d)` for every `d`, addressed
/// against the full-grid strides via `global_array_macro`. The lo/hi plates
/// for a given `dim` share this body; what makes them write disjoint regions
/// is the launch geometry in [`boundary_plate_specs`] (`global_work_offset`
/// placing the high plate at `shape[dim] - ghost_depth[dim]`, `global_work_size`
/// restricting both to a `ghost_depth[dim]`-wide slab along `dim`) — `low`
/// only selects this kernel's name, matching the corresponding spec.
fn emit_boundary_plate(src: &mut String, dim: usize, shape: &[usize], low: bool) {
    let name = if low { format!("boundary_lo_d{dim}") } else { format!("boundary_hi_d{dim}") };
    let ndim = shape.len();
    src.push_str(&format!(
        "__kernel void {name}(__global const double* in0, __global double* out) {{\n"
    ));
    for d in 0..ndim {
        src.push_str(&format!("    int g{d} = get_global_id({d});\n"));
    }
    let coords: Vec<String> = (0..ndim).map(|d| format!("g{d}")).collect();
    src.push_str(&format!("    out[global_array_macro({0})] = in0[global_array_macro({0})];\n", coords.join(", ")));
    src.push_str("}\n\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{build, KernelDef, NeighborOp, PostOp as BuilderPostOp};
    use crate::ir::unroll::unroll;
    use crate::neighborhood::Neighborhood;

    #[test]
    fn generated_source_contains_one_kernel_per_channel() {
        let n = Neighborhood::custom(vec![vec![0, 0], vec![1, 0]]).unwrap();
        let def = KernelDef {
            neighborhoods: vec![n],
            num_inputs: 1,
            num_convolutions: 2,
            ops: vec![NeighborOp::literal(0, 0, vec![1.0, 1.0])],
            post_op: BuilderPostOp::Identity,
        };
        let ir = build(def, 2).unwrap();
        let kernel = unroll(&ir, None).unwrap();
        let meta = KernelMeta {
            neighborhoods: ir.neighborhoods.clone(),
            ghost_depth: kernel.ghost_depth.clone(),
            boundary: BoundaryMode::Clamp,
            num_inputs: 1,
            grid_shape: vec![8, 8],
            dtype: DType::F64,
        };
        let plan = Plan { local_size: vec![4, 4], virtual_global_size: vec![8, 8], tile_bytes: 0 };
        let source = generate_source(&kernel, &meta, &plan);
        assert!(source.contains("kernel_c0"));
        assert!(source.contains("kernel_c1"));
        assert!(!source.contains("boundary_lo_d0"));
    }

    #[test]
    fn copy_boundary_emits_plate_kernels_per_dimension() {
        let n = Neighborhood::custom(vec![vec![0, 0]]).unwrap();
        let def = KernelDef {
            neighborhoods: vec![n],
            num_inputs: 1,
            num_convolutions: 1,
            ops: vec![NeighborOp::literal(0, 0, vec![1.0])],
            post_op: BuilderPostOp::Identity,
        };
        let ir = build(def, 2).unwrap();
        let kernel = unroll(&ir, None).unwrap();
        let meta = KernelMeta {
            neighborhoods: ir.neighborhoods.clone(),
            ghost_depth: kernel.ghost_depth.clone(),
            boundary: BoundaryMode::Copy,
            num_inputs: 1,
            grid_shape: vec![8, 8],
            dtype: DType::F64,
        };
        let plan = Plan { local_size: vec![4, 4], virtual_global_size: vec![8, 8], tile_bytes: 0 };
        let source = generate_source(&kernel, &meta, &plan);
        assert!(source.contains("boundary_lo_d0"));
        assert!(source.contains("boundary_hi_d1"));
    }

    #[test]
    fn first_input_reads_go_through_the_local_tile() {
        let n = Neighborhood::custom(vec![vec![0, 0], vec![1, 0]]).unwrap();
        let def = KernelDef {
            neighborhoods: vec![n],
            num_inputs: 1,
            num_convolutions: 1,
            ops: vec![NeighborOp::literal(0, 0, vec![1.0, 2.0])],
            post_op: BuilderPostOp::Identity,
        };
        let ir = build(def, 2).unwrap();
        let kernel = unroll(&ir, None).unwrap();
        let meta = KernelMeta {
            neighborhoods: ir.neighborhoods.clone(),
            ghost_depth: kernel.ghost_depth.clone(),
            boundary: BoundaryMode::Clamp,
            num_inputs: 1,
            grid_shape: vec![8, 8],
            dtype: DType::F64,
        };
        let plan = Plan { local_size: vec![4, 4], virtual_global_size: vec![8, 8], tile_bytes: 0 };
        let source = generate_source(&kernel, &meta, &plan);
        assert!(source.contains("static void load_tile_in0"));
        assert!(source.contains("load_tile_in0(in0, block);"));
        assert!(source.contains("block[local_array_macro((lid0 + (0)), (lid1 + (0)))]"));
        // `in0` is read from global memory only inside the tile loader
        // itself — the per-channel kernel body reads exclusively via `block`.
        let kernel_body = source.split("__kernel void kernel_c0").nth(1).unwrap();
        assert!(!kernel_body.contains("in0[global_array_macro"));
    }

    #[test]
    fn secondary_input_reads_stay_global_and_get_clamped() {
        let n = Neighborhood::custom(vec![vec![0, 0]]).unwrap();
        let def = KernelDef {
            neighborhoods: vec![n],
            num_inputs: 2,
            num_convolutions: 1,
            ops: vec![NeighborOp::literal(1, 0, vec![3.0])],
            post_op: BuilderPostOp::Identity,
        };
        let ir = build(def, 2).unwrap();
        let kernel = unroll(&ir, None).unwrap();
        let meta = KernelMeta {
            neighborhoods: ir.neighborhoods.clone(),
            ghost_depth: kernel.ghost_depth.clone(),
            boundary: BoundaryMode::Clamp,
            num_inputs: 2,
            grid_shape: vec![8, 8],
            dtype: DType::F64,
        };
        let plan = Plan { local_size: vec![4, 4], virtual_global_size: vec![8, 8], tile_bytes: 0 };
        let source = generate_source(&kernel, &meta, &plan);
        assert!(source.contains("in1[global_array_macro(clamp((g0 + (0)), 0, 7), clamp((g1 + (0)), 0, 7))]"));
    }

    #[test]
    fn boundary_plate_specs_place_lo_and_hi_on_disjoint_slabs() {
        let specs = boundary_plate_specs(2, &[8, 8], &[1, 2]);
        assert_eq!(specs.len(), 4);

        let lo_d0 = &specs[0];
        assert_eq!(lo_d0.name, "boundary_lo_d0");
        assert_eq!(lo_d0.offset, vec![0, 0]);
        assert_eq!(lo_d0.extent, vec![1, 8]);

        let hi_d0 = &specs[1];
        assert_eq!(hi_d0.name, "boundary_hi_d0");
        assert_eq!(hi_d0.offset, vec![7, 0]);
        assert_eq!(hi_d0.extent, vec![1, 8]);

        let lo_d1 = &specs[2];
        assert_eq!(lo_d1.name, "boundary_lo_d1");
        assert_eq!(lo_d1.offset, vec![0, 0]);
        assert_eq!(lo_d1.extent, vec![8, 2]);

        let hi_d1 = &specs[3];
        assert_eq!(hi_d1.name, "boundary_hi_d1");
        assert_eq!(hi_d1.offset, vec![0, 6]);
        assert_eq!(hi_d1.extent, vec![8, 2]);
    }
}
