//! Minimal CLI driver: apply a 5-point Laplacian to a 2-D grid with a single
//! hot point in the center, printing the interior row through that point.
//!
//! Usage: `laplacian2d [size]` (defaults to 16).

#![forbid(unsafe_code)]

use stencil::boundary::BoundaryMode;
use stencil::grid::GridDescriptor;
use stencil::ir::builder::{KernelDef, NeighborOp, PostOp};
use stencil::neighborhood::Neighborhood;
use stencil::{Stencil, StencilConfig};

fn main() -> Result<(), stencil::StencilError> {
    tracing_subscriber::fmt::init();

    let size: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(16);

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
        ops: vec![NeighborOp::literal(0, 0, vec![-4.0, 1.0, 1.0, 1.0, 1.0])],
        post_op: PostOp::Identity,
    };

    let mut cfg = StencilConfig::default();
    cfg.boundary_handling = BoundaryMode::Zero;
    let stencil = Stencil::new(def, 2, None, cfg)?;

    let mut data = vec![0.0f64; size * size];
    data[(size / 2) * size + size / 2] = 1.0;
    let input = GridDescriptor::from_f64(vec![size, size], data)?;

    let outputs = stencil.apply(&[&input])?;
    let out = &outputs[0];

    println!("laplacian2d: {size}x{size} grid, single hot point at center");
    let row = (size / 2) as i64;
    let values: Vec<String> = (0..size)
        .map(|col| format!("{:>6.2}", out.get(&[row, col as i64])))
        .collect();
    println!("row {row}: {}", values.join(" "));
    Ok(())
}
