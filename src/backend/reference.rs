//! The reference backend: a plain, unoptimized interpreter used as the
//! correctness oracle for property 3 in §8 (the original's `python`
//! backend, reimplemented natively rather than shelling out to a second
//! language).
//!
//! Unlike the CPU and OpenCL backends, this backend does not restrict
//! itself to the interior band with a separate boundary pass: it evaluates
//! every output point directly, resolving each neighbor read's boundary
//! handling in place via [`crate::boundary::resolve_dim`]. It shares the
//! same unrolled term list the other backends lower from (unrolling itself
//! is exercised independently by `ir::unroll`'s own unit tests), and
//! instead diverges from them in execution strategy — no interior/halo
//! split, no tiling, no local-memory simulation — so it exercises a
//! genuinely different code path for the same semantics.

use super::{Artifact, Backend, BackendId, KernelMeta};
use crate::boundary::{resolve_dim, BoundaryMode, Resolved};
use crate::grid::GridDescriptor;
use crate::ir::unroll::{PostOp, UnrolledKernel};
use crate::{StencilConfig, StencilError};

/// A compiled reference specialization: just the unrolled kernel and
/// metadata, cloned in so `launch` needs no further lookups.
pub struct CompiledReference {
    kernel: UnrolledKernel,
}

/// The reference backend implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceBackend;

impl Backend for ReferenceBackend {
    fn id(&self) -> BackendId {
        BackendId::Reference
    }

    fn lower(&self, kernel: &UnrolledKernel, _meta: &KernelMeta, _cfg: &StencilConfig) -> Result<Artifact, StencilError> {
        Ok(Artifact::Reference(CompiledReference { kernel: kernel.clone() }))
    }

    fn launch(
        &self,
        artifact: &Artifact,
        inputs: &[&GridDescriptor],
        outputs: &mut [GridDescriptor],
        meta: &KernelMeta,
    ) -> Result<(), StencilError> {
        let compiled = match artifact {
            Artifact::Reference(c) => c,
            _ => return Err(StencilError::wrong_artifact(BackendId::Reference, artifact.backend_id())),
        };
        debug_assert_eq!(outputs.len(), compiled.kernel.convolutions.len());
        for (conv, output) in compiled.kernel.convolutions.iter().zip(outputs.iter_mut()) {
            evaluate_channel(conv, &compiled.kernel.ghost_depth, inputs, output, meta.boundary);
        }
        Ok(())
    }
}

fn evaluate_channel(
    conv: &crate::ir::unroll::ConvolutionTerms,
    ghost_depth: &[usize],
    inputs: &[&GridDescriptor],
    output: &mut GridDescriptor,
    mode: BoundaryMode,
) {
    let shape = output.shape().to_vec();
    for point in output.all_points() {
        if mode == BoundaryMode::Zero && crate::boundary::is_boundary_point(&point, &shape, ghost_depth) {
            output.set(&point, 0.0);
            continue;
        }
        if mode == BoundaryMode::Copy && crate::boundary::is_boundary_point(&point, &shape, ghost_depth) {
            let v = inputs[0].get(&point);
            output.set(&point, v);
            continue;
        }

        let mut sum = 0.0;
        for term in &conv.terms {
            let neighbor: Vec<i64> = crate::neighborhood::Neighborhood::apply(&point, &term.offset);
            let grid = inputs[term.input];
            let mut resolved = Vec::with_capacity(neighbor.len());
            let mut zeroed = false;
            for (d, &c) in neighbor.iter().enumerate() {
                match resolve_dim(mode, c, grid.shape()[d]) {
                    Resolved::Index(i) => resolved.push(i as i64),
                    Resolved::Zero => {
                        zeroed = true;
                        break;
                    }
                }
            }
            if zeroed {
                continue;
            }
            sum += term.coefficient * grid.get(&resolved);
        }
        let value = match &conv.post_op {
            PostOp::Identity => sum,
            PostOp::Call { name, extra_args } => {
                let mut args = vec![sum];
                args.extend(extra_args.iter().copied());
                name.eval(&args)
            }
        };
        output.set(&point, value);
    }
}
