//! Backend abstraction (§9's design note): one `Backend` trait, one
//! implementation per lowering target, no shared mutable base state.
//!
//! `lower(ir, cfg) -> Artifact` and `launch(artifact, buffers) -> Result`
//! replace the original's deep inheritance of backend classes.

/// The CPU backend: full unrolling lowered to a native closure per channel (§4.G).
pub mod cpu;
/// The reference backend: a plain per-point interpreter, the correctness oracle (§8 property 3).
pub mod reference;

/// The OpenCL backend: a work-group-tiled kernel with halo load and boundary subkernels (§4.H).
#[cfg(feature = "opencl")]
pub mod ocl;

use crate::boundary::BoundaryMode;
use crate::grid::{DType, GridDescriptor};
use crate::ir::unroll::UnrolledKernel;
use crate::neighborhood::Neighborhood;
use crate::{StencilConfig, StencilError};

/// Which lowering pipeline produced (or should produce) a given
/// [`Artifact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendId {
    /// Plain interior/neighbor-loop interpreter; the correctness oracle.
    Reference,
    /// Unrolled, natively-compiled closure.
    Cpu,
    /// Work-group-tiled OpenCL kernel.
    Ocl,
}

impl BackendId {
    /// Short tag used in fingerprints and generated kernel names.
    pub fn tag(self) -> &'static str {
        match self {
            BackendId::Reference => "reference",
            BackendId::Cpu => "cpu",
            BackendId::Ocl => "ocl",
        }
    }
}

/// Shape and policy metadata every backend needs to lower and launch a
/// kernel, independent of which specific grids are passed to `apply`.
#[derive(Debug, Clone)]
pub struct KernelMeta {
    /// Declared neighborhoods, shared with the IR.
    pub neighborhoods: Vec<Neighborhood>,
    /// Per-dimension ghost depth, `= neighborhood::ghost_depth(neighborhoods)`.
    pub ghost_depth: Vec<usize>,
    /// Selected boundary handling.
    pub boundary: BoundaryMode,
    /// Number of declared input grids.
    pub num_inputs: usize,
    /// Output (== first input's) shape at specialization time.
    pub grid_shape: Vec<usize>,
    /// Output (== first input's) element type at specialization time.
    pub dtype: DType,
}

/// An opaque compiled specialization (§3's "Compiled artifact"): generated
/// source (where applicable), a backend-specific object handle, and the
/// launch plan.
pub enum Artifact {
    /// [`reference::CompiledReference`].
    Reference(reference::CompiledReference),
    /// [`cpu::CompiledCpu`].
    Cpu(cpu::CompiledCpu),
    /// [`ocl::CompiledOcl`], only constructible with the `opencl` feature.
    #[cfg(feature = "opencl")]
    Ocl(ocl::CompiledOcl),
}

impl Artifact {
    /// Which backend produced this artifact.
    pub fn backend_id(&self) -> BackendId {
        match self {
            Artifact::Reference(_) => BackendId::Reference,
            Artifact::Cpu(_) => BackendId::Cpu,
            #[cfg(feature = "opencl")]
            Artifact::Ocl(_) => BackendId::Ocl,
        }
    }

    /// The generated source text, if this backend emits one (only OpenCL
    /// does; the reference and CPU backends compile straight to a native
    /// closure with nothing to show).
    pub fn source(&self) -> Option<&str> {
        match self {
            #[cfg(feature = "opencl")]
            Artifact::Ocl(a) => Some(a.source()),
            _ => None,
        }
    }

    /// The chosen work-size plan, present only for the tiled OpenCL backend.
    pub fn plan(&self) -> Option<&crate::planner::Plan> {
        match self {
            #[cfg(feature = "opencl")]
            Artifact::Ocl(a) => Some(a.plan()),
            _ => None,
        }
    }
}

/// One lowering-and-launch pipeline (§9's `Backend` interface).
pub trait Backend: Send + Sync {
    /// Which backend this is.
    fn id(&self) -> BackendId;

    /// Lower `kernel` (already unrolled, see [`crate::ir::unroll`]) into a
    /// compiled [`Artifact`] for `meta`/`cfg`.
    fn lower(&self, kernel: &UnrolledKernel, meta: &KernelMeta, cfg: &StencilConfig) -> Result<Artifact, StencilError>;

    /// Execute a previously lowered `artifact` against concrete buffers.
    ///
    /// `outputs` has one entry per convolution channel (§4.H: each channel
    /// is an independent kernel writing its own result), in channel order —
    /// `outputs.len() == 1` for the common single-convolution case.
    fn launch(
        &self,
        artifact: &Artifact,
        inputs: &[&GridDescriptor],
        outputs: &mut [GridDescriptor],
        meta: &KernelMeta,
    ) -> Result<(), StencilError>;
}
