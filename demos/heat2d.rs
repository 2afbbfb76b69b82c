//! Minimal CLI driver for explicit 2-D heat diffusion: `u' = u + alpha *
//! laplacian(u)`, stepped by repeatedly calling [`Stencil::apply`] and
//! ping-ponging the grid rather than folding time into the kernel (this
//! crate's resolution of the original source's 3-D time-as-an-axis layout,
//! see `SPEC_FULL.md`'s design notes).
//!
//! Usage: `heat2d [size] [steps] [alpha]` (defaults to 24, 50, 0.2).

#![forbid(unsafe_code)]

use stencil::boundary::BoundaryMode;
use stencil::grid::GridDescriptor;
use stencil::ir::builder::{KernelDef, NeighborOp, PostOp};
use stencil::neighborhood::Neighborhood;
use stencil::{Stencil, StencilConfig};

fn main() -> Result<(), stencil::StencilError> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let size: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(24);
    let steps: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(50);
    let alpha: f64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(0.2);

    let neighborhood = Neighborhood::custom(vec![
        vec![0, 0],
        vec![-1, 0],
        vec![1, 0],
        vec![0, -1],
        vec![0, 1],
    ])?;
    let def = KernelDef {
        neighborhoods: vec![neighborhood],
        num_inputs: 1,
        num_convolutions: 1,
        ops: vec![NeighborOp::literal(
            0,
            0,
            vec![1.0 - 4.0 * alpha, alpha, alpha, alpha, alpha],
        )],
        post_op: PostOp::Identity,
    };

    let mut cfg = StencilConfig::default();
    cfg.boundary_handling = BoundaryMode::Zero;
    let stencil = Stencil::new(def, 2, None, cfg)?;

    let mut data = vec![0.0f64; size * size];
    data[(size / 2) * size + size / 2] = 100.0;
    let mut current = GridDescriptor::from_f64(vec![size, size], data)?;

    for step in 0..steps {
        let next = stencil.apply(&[&current])?.remove(0);
        current = next;
        if step % 10 == 0 || step + 1 == steps {
            let mid = (size / 2) as i64;
            let total: f64 = current.to_f64_vec().iter().sum();
            println!(
                "step {step:>3}: center = {:>9.5}, total heat = {total:>10.4}",
                current.get(&[mid, mid])
            );
        }
    }

    Ok(())
}
