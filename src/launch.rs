//! Launch glue (§4.J): the generic, backend-agnostic dispatch every
//! [`crate::Stencil::apply`] call goes through.
//!
//! Responsibilities: select the concrete [`Backend`] for a
//! [`BackendId`](crate::backend::BackendId), route the lowering step through
//! the [`SpecializationCache`] so equal fingerprints share one compiled
//! [`Artifact`](crate::backend::Artifact), and launch the result against
//! caller-supplied buffers. What each backend does with "allocate device
//! buffers, copy host→device, enqueue, copy device→host" differs enough
//! (the CPU backend needs none of it, the OpenCL backend owns it entirely
//! in `backend::ocl::run_launch`) that this module does not attempt to
//! unify that part — only the cache-mediated dispatch above it.

use crate::backend::{Backend, BackendId, KernelMeta};
use crate::cache::{Fingerprint, SpecializationCache};
use crate::grid::GridDescriptor;
use crate::ir::unroll::UnrolledKernel;
use crate::{StencilConfig, StencilError};

/// Construct the concrete backend for `id`.
///
/// # Panics
///
/// Panics if `id` is [`BackendId::Ocl`] and this crate was built without the
/// `opencl` feature. `Stencil::new` rejects that combination with
/// [`StencilError::BackendUnavailable`](crate::StencilError::BackendUnavailable)
/// before a backend is ever requested, so this path is unreachable through
/// the public API.
pub fn backend_for(id: BackendId) -> Box<dyn Backend> {
    match id {
        BackendId::Reference => Box::new(crate::backend::reference::ReferenceBackend),
        BackendId::Cpu => Box::new(crate::backend::cpu::CpuBackend),
        #[cfg(feature = "opencl")]
        BackendId::Ocl => Box::new(crate::backend::ocl::OclBackend),
        #[cfg(not(feature = "opencl"))]
        BackendId::Ocl => panic!("stencil: opencl backend requested but the `opencl` feature is disabled"),
    }
}

/// Lower (via the cache) and launch `kernel` against `inputs`/`outputs`.
///
/// `coefficients` is the flattened coefficient table used only to
/// distinguish fingerprints that differ solely in their literal weights
/// (§3's fingerprint tuple); the IR itself has already baked them into
/// `kernel`.
pub fn run(
    cache: &SpecializationCache,
    backend: &dyn Backend,
    kernel: &UnrolledKernel,
    meta: &KernelMeta,
    coefficients: &[f64],
    cfg: &StencilConfig,
    inputs: &[&GridDescriptor],
    outputs: &mut [GridDescriptor],
) -> Result<(), StencilError> {
    let fingerprint = Fingerprint::new(meta, coefficients, backend.id());
    let span = tracing::info_span!("stencil_launch", backend = %backend.id().tag());
    let _enter = span.enter();

    let artifact = cache
        .get_or_build(fingerprint, || {
            tracing::debug!("cache miss, compiling specialization");
            backend.lower(kernel, meta, cfg).map_err(|e| e.to_string())
        })
        .map_err(StencilError::CompilationFailed)?;

    tracing::debug!("launching compiled artifact");
    backend.launch(&artifact, inputs, outputs, meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::BoundaryMode;
    use crate::grid::DType;
    use crate::ir::builder::{build, KernelDef, NeighborOp, PostOp};
    use crate::ir::unroll::unroll;
    use crate::neighborhood::Neighborhood;

    fn laplacian() -> (UnrolledKernel, KernelMeta) {
        let n = Neighborhood::custom(vec![
            vec![0, 0],
            vec![-1, 0],
            vec![1, 0],
            vec![0, -1],
            vec![0, 1],
        ])
        .unwrap();
        let def = KernelDef {
            neighborhoods: vec![n],
            num_inputs: 1,
            num_convolutions: 1,
            ops: vec![NeighborOp::literal(0, 0, vec![-4.0, 1.0, 1.0, 1.0, 1.0])],
            post_op: PostOp::Identity,
        };
        let ir = build(def, 2).unwrap();
        let kernel = unroll(&ir, None).unwrap();
        let meta = KernelMeta {
            neighborhoods: ir.neighborhoods.clone(),
            ghost_depth: kernel.ghost_depth.clone(),
            boundary: BoundaryMode::Zero,
            num_inputs: 1,
            grid_shape: vec![8, 8],
            dtype: DType::F64,
        };
        (kernel, meta)
    }

    #[test]
    fn run_dispatches_through_cache_and_launches() {
        let (kernel, meta) = laplacian();
        let cache = SpecializationCache::new();
        let backend = crate::backend::cpu::CpuBackend;
        let cfg = StencilConfig::default();
        let input = GridDescriptor::from_f64(vec![8, 8], vec![1.0; 64]).unwrap();
        let mut outputs = vec![GridDescriptor::zeros(vec![8, 8], DType::F64).unwrap()];

        run(&cache, &backend, &kernel, &meta, &[], &cfg, &[&input], &mut outputs).unwrap();
        for v in outputs[0].to_f64_vec() {
            assert_eq!(v, 0.0);
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn s6_repeated_run_reuses_one_compilation() {
        let (kernel, meta) = laplacian();
        let cache = SpecializationCache::new();
        let backend = crate::backend::cpu::CpuBackend;
        let cfg = StencilConfig::default();
        let input = GridDescriptor::from_f64(vec![8, 8], vec![1.0; 64]).unwrap();

        for _ in 0..3 {
            let mut outputs = vec![GridDescriptor::zeros(vec![8, 8], DType::F64).unwrap()];
            run(&cache, &backend, &kernel, &meta, &[], &cfg, &[&input], &mut outputs).unwrap();
        }
        // `SpecializationCache` holds one entry regardless of how many
        // times `run` was called, since every call shares one fingerprint.
        assert_eq!(cache.len(), 1);
    }
}
