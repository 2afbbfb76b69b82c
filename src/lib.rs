//! Crate root: public surface, configuration, and error unification for the
//! stencil compiler and runtime.
//!
//! A caller describes a kernel once through the embedded builder API
//! ([`ir::builder`]) — which neighborhoods it reads, which input grids and
//! coefficients feed each term, how many convolution channels to emit —
//! and builds a [`Stencil`] from it. Each [`Stencil::apply`] call then goes
//! through the same pipeline the module docs on [`backend`] describe:
//! lower the already-built IR against the caller's boundary/backend choice
//! (through the [`cache::SpecializationCache`], so repeated calls with an
//! unchanged fingerprint reuse one compiled artifact) and launch it against
//! concrete buffers.
//!
//! ## Invariants
//!
//! - **Neighborhoods and coefficients are bound at [`Stencil::new`] time**;
//!   only the input/output buffers and their shape vary per [`apply`]
//!   call. A shape change from one call to the next produces a new cache
//!   fingerprint rather than an error, since the fingerprint includes
//!   shape (§3).
//! - **No implicit retries.** A failed build or launch is surfaced as a
//!   [`StencilError`] and, for compile failures, cached negatively (§4.I)
//!   so a repeated call with the same fingerprint re-raises immediately
//!   instead of recompiling.
//! - **Unsafe code is confined to `backend::ocl`**, where the `ocl` crate's
//!   kernel-enqueue calls are themselves `unsafe fn`; no other module in
//!   this crate uses `unsafe`.
//!
//! [`apply`]: Stencil::apply

#![deny(missing_docs, rust_2018_idioms)]

use thiserror::Error;

/// Neighbor-offset sets (von Neumann, Moore, custom) and ghost depth (§4.A).
pub mod neighborhood;
/// Grid descriptors: the contiguous-buffer view a stencil reads/writes (§4.B).
pub mod grid;
/// The stencil intermediate representation, its builder, and unrolling (§4.C/D/G).
pub mod ir;
/// Boundary handling policies (§4.E).
pub mod boundary;
/// Local/global work-size planner (§4.F).
pub mod planner;
/// Backend abstraction and the reference/CPU/OpenCL lowerings (§4.G/H).
pub mod backend;
/// Specialization cache keyed by argument-configuration fingerprint (§4.I).
pub mod cache;
/// Launch glue: cache-mediated dispatch from a built kernel to a backend (§4.J).
pub mod launch;

use backend::BackendId;
use boundary::BoundaryMode;
use grid::{DType, GridDescriptor};
use ir::builder::{CoefficientTable, KernelDef};
use ir::unroll::UnrolledKernel;

/// Per-invocation configuration (§6): which backend to lower to, how to
/// handle boundaries, and whether to force the planner's `testing` path.
///
/// Passed by value and cloned where needed, in the same spirit as the
/// teacher's `ProveParams`/`VerifyParams`: explicit, no hidden global
/// config, `Clone + Debug` so callers can stash and compare configurations.
#[derive(Debug, Clone)]
pub struct StencilConfig {
    /// Which lowering pipeline to use.
    pub backend: BackendId,
    /// Boundary handling mode (§4.E).
    pub boundary_handling: BoundaryMode,
    /// Forces `local_size = (1, ..., 1)` and skips device inspection in the
    /// OpenCL planner (§4.F); ignored by the reference and CPU backends.
    pub testing: bool,
    /// Which OpenCL device to select, by platform device-list index.
    /// `usize::MAX` (the default) means "the last available device",
    /// matching §6's "device selected as index -1 (last) unless otherwise
    /// specified".
    pub device_index: usize,
}

impl Default for StencilConfig {
    fn default() -> Self {
        Self {
            backend: BackendId::Cpu,
            boundary_handling: BoundaryMode::Zero,
            testing: false,
            device_index: usize::MAX,
        }
    }
}

/// The crate's unified error type (§7). Each variant wraps a module-local
/// `thiserror` enum via `#[from]`, except the few failure modes that only
/// make sense at the façade level (wrong artifact, channel-count mismatch,
/// shape mismatch, and a cached compilation failure's message).
#[derive(Debug, Error)]
pub enum StencilError {
    /// Frontend capture rejected the kernel definition (§4.D).
    #[error(transparent)]
    Ir(#[from] ir::IrError),
    /// The selected backend does not support the requested boundary mode (§4.E).
    #[error(transparent)]
    Boundary(#[from] boundary::BoundaryError),
    /// The work-size planner could not satisfy device limits (§4.F).
    #[error(transparent)]
    Planning(#[from] planner::PlanningError),
    /// A grid descriptor could not be constructed or indexed (§4.B).
    #[error(transparent)]
    Grid(#[from] grid::GridError),
    /// A neighborhood could not be constructed (§4.A).
    #[error(transparent)]
    Neighborhood(#[from] neighborhood::NeighborhoodError),
    /// The on-disk specialization cache record was malformed (§4.I).
    #[error(transparent)]
    Cache(#[from] cache::CacheError),
    /// An OpenCL driver call failed, or the host-side launch state machine
    /// was driven out of order (§4.H).
    #[cfg(feature = "opencl")]
    #[error(transparent)]
    Device(#[from] backend::ocl::OclError),
    /// A backend's `launch` was handed an [`backend::Artifact`] produced by
    /// a different backend.
    #[error("artifact was compiled by backend {got:?}, expected {expected:?}")]
    WrongArtifact {
        /// The backend the artifact was expected to come from.
        expected: BackendId,
        /// The backend that actually produced it.
        got: BackendId,
    },
    /// The kernel's convolution-channel count didn't match the number of
    /// output grids supplied to a launch.
    #[error("kernel has {expected} convolution channel(s), but {got} output grid(s) were supplied")]
    ChannelCountMismatch {
        /// Channels the compiled kernel expects.
        expected: usize,
        /// Output grids actually supplied.
        got: usize,
    },
    /// Two grids that an operation requires to agree on shape didn't
    /// (§7's `ShapeMismatchError`: a runtime input shape differs from the
    /// fingerprint the caller built the `Stencil` against).
    #[error("grid shape mismatch: {first:?} vs {other:?}")]
    ShapeMismatch {
        /// The first grid's shape.
        first: Vec<usize>,
        /// The shape it was compared against.
        other: Vec<usize>,
    },
    /// [`Stencil::new`] was asked for [`BackendId::Ocl`] but this crate was
    /// built without the `opencl` feature.
    #[error("backend {backend:?} is unavailable: crate was built without its feature")]
    BackendUnavailable {
        /// The backend that was requested.
        backend: BackendId,
    },
    /// The specialization cache's negative entry was replayed, or a fresh
    /// build just failed; `detail` is the backend's own error message,
    /// flattened to a string since build errors are not required to be
    /// `Clone` (§4.I, §7's compilation/device error propagation policy).
    #[error("specialization failed to compile: {0}")]
    CompilationFailed(String),
}

impl StencilError {
    /// Build a [`StencilError::WrongArtifact`].
    pub fn wrong_artifact(expected: BackendId, got: BackendId) -> Self {
        Self::WrongArtifact { expected, got }
    }
}

/// A compiled, cached stencil kernel bound to a fixed set of neighborhoods,
/// coefficients, and configuration (§6's single public operation).
///
/// Construct once with [`Stencil::new`] and call [`Stencil::apply`] as many
/// times as needed; repeated calls with unchanged input shape/dtype reuse
/// the same compiled specialization via the internal
/// [`cache::SpecializationCache`] (§8 property 4/S6).
pub struct Stencil {
    ir: ir::StencilIr,
    unrolled: UnrolledKernel,
    coefficients_flat: Vec<f64>,
    config: StencilConfig,
    cache: cache::SpecializationCache,
    backend: Box<dyn backend::Backend>,
}

impl Stencil {
    /// Build and validate a stencil kernel from `def` (§4.D), resolving any
    /// table-sourced coefficients against `coefficients` and binding
    /// `config` for every future [`apply`](Stencil::apply) call.
    ///
    /// Fails with [`StencilError::Ir`] for the frontend's structural
    /// failure modes (unrecognized neighborhood id, write to a non-output
    /// grid, dimensionality mismatch between a neighborhood and `grid_ndim`).
    pub fn new(
        def: KernelDef,
        grid_ndim: usize,
        coefficients: Option<CoefficientTable>,
        config: StencilConfig,
    ) -> Result<Self, StencilError> {
        #[cfg(not(feature = "opencl"))]
        if matches!(config.backend, BackendId::Ocl) {
            return Err(StencilError::BackendUnavailable { backend: config.backend });
        }

        let span = tracing::info_span!("stencil_build", backend = %config.backend.tag());
        let _enter = span.enter();

        let ir = ir::builder::build(def, grid_ndim)?;
        tracing::debug!(neighborhoods = ir.neighborhoods.len(), convolutions = ir.num_convolutions, "built stencil IR");

        let unrolled = ir::unroll::unroll(&ir, coefficients.as_ref())?;
        let coefficients_flat = flatten_coefficients(coefficients.as_ref());
        let backend = launch::backend_for(config.backend);

        Ok(Self { ir, unrolled, coefficients_flat, config, cache: cache::SpecializationCache::new(), backend })
    }

    /// Number of convolution channels this stencil emits, i.e. the length
    /// of [`apply`](Stencil::apply)'s returned `Vec`.
    pub fn num_convolutions(&self) -> usize {
        self.ir.num_convolutions
    }

    /// Run the stencil against `inputs`, returning one freshly allocated
    /// output grid per convolution channel, shaped and typed like
    /// `inputs[0]` (§6's "output defaults to a freshly allocated grid of
    /// the first input's shape and dtype").
    ///
    /// Fails with [`StencilError::ShapeMismatch`] if the inputs disagree on
    /// shape, and otherwise propagates whatever the selected backend's
    /// `lower`/`launch` returns.
    pub fn apply(&self, inputs: &[&GridDescriptor]) -> Result<Vec<GridDescriptor>, StencilError> {
        let shape = inputs[0].shape().to_vec();
        let dtype = inputs[0].dtype();
        for g in &inputs[1..] {
            if g.shape() != shape.as_slice() {
                return Err(StencilError::ShapeMismatch { first: shape, other: g.shape().to_vec() });
            }
        }

        let mut outputs = (0..self.ir.num_convolutions)
            .map(|_| GridDescriptor::zeros(shape.clone(), dtype))
            .collect::<Result<Vec<_>, _>>()?;

        self.apply_into(inputs, &mut outputs)?;
        Ok(outputs)
    }

    /// Like [`apply`](Stencil::apply), but writes into caller-supplied
    /// `outputs` (one per convolution channel) instead of allocating fresh
    /// grids — the entry point the launch glue (§4.J) actually drives.
    pub fn apply_into(&self, inputs: &[&GridDescriptor], outputs: &mut [GridDescriptor]) -> Result<(), StencilError> {
        if outputs.len() != self.ir.num_convolutions {
            return Err(StencilError::ChannelCountMismatch { expected: self.ir.num_convolutions, got: outputs.len() });
        }

        let meta = backend::KernelMeta {
            neighborhoods: self.ir.neighborhoods.clone(),
            ghost_depth: self.unrolled.ghost_depth.clone(),
            boundary: self.config.boundary_handling,
            num_inputs: self.ir.num_inputs,
            grid_shape: inputs[0].shape().to_vec(),
            dtype: inputs[0].dtype(),
        };

        launch::run(
            &self.cache,
            self.backend.as_ref(),
            &self.unrolled,
            &meta,
            &self.coefficients_flat,
            &self.config,
            inputs,
            outputs,
        )
    }
}

fn flatten_coefficients(table: Option<&CoefficientTable>) -> Vec<f64> {
    table.map(|t| t.flatten()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{NeighborOp, PostOp};
    use crate::neighborhood::Neighborhood;

    fn laplacian_def() -> KernelDef {
        let n = Neighborhood::custom(vec![
            vec![0, 0],
            vec![-1, 0],
            vec![1, 0],
            vec![0, -1],
            vec![0, 1],
        ])
        .unwrap();
        KernelDef {
            neighborhoods: vec![n],
            num_inputs: 1,
            num_convolutions: 1,
            ops: vec![NeighborOp::literal(0, 0, vec![-4.0, 1.0, 1.0, 1.0, 1.0])],
            post_op: PostOp::Identity,
        }
    }

    #[test]
    fn s1_laplacian_zero_boundary_end_to_end() {
        let stencil = Stencil::new(laplacian_def(), 2, None, StencilConfig::default()).unwrap();
        let input = GridDescriptor::from_f64(vec![8, 8], vec![1.0; 64]).unwrap();
        let outputs = stencil.apply(&[&input]).unwrap();
        assert_eq!(outputs.len(), 1);
        for v in outputs[0].to_f64_vec() {
            assert_eq!(v, 0.0);
        }
    }

    #[test]
    fn s2_jacobi_clamp_boundary_end_to_end() {
        let n_horiz = Neighborhood::custom(vec![vec![0, -1], vec![0, 1]]).unwrap();
        let n_vert = Neighborhood::custom(vec![vec![-1, 0], vec![1, 0]]).unwrap();
        let def = KernelDef {
            neighborhoods: vec![n_horiz, n_vert],
            num_inputs: 1,
            num_convolutions: 1,
            ops: vec![
                NeighborOp::literal(0, 0, vec![0.1, 0.1]),
                NeighborOp::literal(0, 1, vec![0.3, 0.3]),
            ],
            post_op: PostOp::Identity,
        };
        let mut cfg = StencilConfig::default();
        cfg.boundary_handling = BoundaryMode::Clamp;
        let stencil = Stencil::new(def, 2, None, cfg).unwrap();
        let input = GridDescriptor::from_f64(vec![10, 10], vec![1.0; 100]).unwrap();
        let outputs = stencil.apply(&[&input]).unwrap();

        assert!((outputs[0].get(&[5, 5]) - 0.8).abs() < 1e-12);
        assert!((outputs[0].get(&[0, 0]) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn apply_rejects_mismatched_input_shapes() {
        let stencil = Stencil::new(laplacian_def(), 2, None, StencilConfig::default()).unwrap();
        let a = GridDescriptor::from_f64(vec![8, 8], vec![1.0; 64]).unwrap();
        let b = GridDescriptor::from_f64(vec![4, 4], vec![1.0; 16]).unwrap();
        let err = stencil.apply(&[&a, &b]).unwrap_err();
        assert!(matches!(err, StencilError::ShapeMismatch { .. }));
    }

    #[test]
    fn apply_into_rejects_wrong_channel_count() {
        let stencil = Stencil::new(laplacian_def(), 2, None, StencilConfig::default()).unwrap();
        let input = GridDescriptor::from_f64(vec![8, 8], vec![1.0; 64]).unwrap();
        let mut outputs = vec![
            GridDescriptor::zeros(vec![8, 8], DType::F64).unwrap(),
            GridDescriptor::zeros(vec![8, 8], DType::F64).unwrap(),
        ];
        let err = stencil.apply_into(&[&input], &mut outputs).unwrap_err();
        assert!(matches!(err, StencilError::ChannelCountMismatch { expected: 1, got: 2 }));
    }

    #[test]
    fn s6_repeated_apply_reuses_one_compiled_artifact() {
        let stencil = Stencil::new(laplacian_def(), 2, None, StencilConfig::default()).unwrap();
        let input = GridDescriptor::from_f64(vec![8, 8], vec![1.0; 64]).unwrap();
        stencil.apply(&[&input]).unwrap();
        stencil.apply(&[&input]).unwrap();
        assert_eq!(stencil.cache.len(), 1);
    }
}
