//! Minimal CLI driver: run a few Jacobi relaxation sweeps over a 2-D grid
//! with a hot top edge held fixed by `Copy` boundary handling, ping-ponging
//! input/output between calls (the pattern `demos/heat2d.rs` also uses for
//! explicit time stepping).
//!
//! Usage: `jacobi2d [size] [iterations]` (defaults to 16, 20).

#![forbid(unsafe_code)]

use stencil::boundary::BoundaryMode;
use stencil::grid::GridDescriptor;
use stencil::ir::builder::{KernelDef, NeighborOp, PostOp};
use stencil::neighborhood::Neighborhood;
use stencil::{Stencil, StencilConfig};

fn main() -> Result<(), stencil::StencilError> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let size: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(16);
    let iterations: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(20);

    let horizontal = Neighborhood::custom(vec![vec![0, -1], vec![0, 1]])?;
    let vertical = Neighborhood::custom(vec![vec![-1, 0], vec![1, 0]])?;
    let def = KernelDef {
        neighborhoods: vec![horizontal, vertical],
        num_inputs: 1,
        num_convolutions: 1,
        ops: vec![
            NeighborOp::literal(0, 0, vec![0.25, 0.25]),
            NeighborOp::literal(0, 1, vec![0.25, 0.25]),
        ],
        post_op: PostOp::Identity,
    };

    let mut cfg = StencilConfig::default();
    cfg.boundary_handling = BoundaryMode::Copy;
    let stencil = Stencil::new(def, 2, None, cfg)?;

    let mut data = vec![0.0f64; size * size];
    for col in 0..size {
        data[col] = 100.0; // top edge held hot: `Copy` re-writes it verbatim each sweep
    }
    let mut current = GridDescriptor::from_f64(vec![size, size], data)?;

    for step in 0..iterations {
        let next = stencil.apply(&[&current])?.remove(0);
        current = next;
        if step % 5 == 0 || step + 1 == iterations {
            let mid = (size / 2) as i64;
            println!("iter {step:>3}: center = {:>8.4}", current.get(&[mid, mid]));
        }
    }

    Ok(())
}
