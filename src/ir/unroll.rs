//! Shared unrolling: turn a [`StencilIr`] into a flat list of weighted
//! neighbor-read terms, one list per convolution channel (§4.G, §4.H).
//!
//! Both the CPU and OpenCL backends lower by **full unrolling**: for every
//! offset in a neighborhood, clone the loop body and substitute the
//! neighbor index with `center + offset`, baking any coefficient lookup
//! into a literal along the way. This module performs that substitution
//! once, producing an [`UnrolledKernel`] both backends consume — the CPU
//! backend indexes buffers directly with each [`Term`]'s offset, the OpenCL
//! backend emits `block[local_array_macro(local_id + offset)]` textually
//! from the same offset (§4.H step 7).
//!
//! [`StencilIr`]: super::StencilIr

use super::{AssignOp, BinOp, CoeffSource, Expr, GridRef, IndexRef, IrError, MathFn, StencilIr};
use crate::neighborhood::Offset;

/// One fully-resolved accumulation term: `out[center] += coefficient *
/// input[center + offset]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    /// Which input grid to read.
    pub input: usize,
    /// Offset from the center point.
    pub offset: Offset,
    /// Coefficient, already resolved from any [`CoeffSource::Table`] lookup.
    pub coefficient: f64,
}

/// A whole-kernel post-op, carried alongside the summed terms (see
/// [`crate::ir::builder::PostOp`]); resolved to avoid either backend
/// re-walking the original `Expr` tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    /// No post-processing.
    Identity,
    /// Apply `name` to the sum plus `extra_args`.
    Call { name: MathFn, extra_args: Vec<f64> },
}

/// One convolution channel's unrolled terms.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionTerms {
    /// Convolution id.
    pub convolution: usize,
    /// Terms to sum.
    pub terms: Vec<Term>,
    /// Applied to the sum once all terms are accumulated.
    pub post_op: PostOp,
}

/// The fully unrolled kernel: one [`ConvolutionTerms`] per convolution
/// channel (§4.H's "Multi-convolution lowering").
#[derive(Debug, Clone, PartialEq)]
pub struct UnrolledKernel {
    /// Per-channel terms, in channel order.
    pub convolutions: Vec<ConvolutionTerms>,
    /// Shared ghost depth (per-dimension max `|offset|`) across every term.
    pub ghost_depth: Vec<usize>,
}

/// Unroll `ir` into an [`UnrolledKernel`], resolving table-sourced
/// coefficients against `coefficients` where provided.
///
/// The only failure mode at this stage is a `CoeffSource::Table` term with
/// no table supplied — every other invariant was already checked by
/// [`super::validate`] during construction.
pub fn unroll(
    ir: &StencilIr,
    coefficients: Option<&crate::ir::builder::CoefficientTable>,
) -> Result<UnrolledKernel, IrError> {
    let ghost_depth = crate::neighborhood::ghost_depth(&ir.neighborhoods);
    let mut convolutions = Vec::with_capacity(ir.root.body.len());

    for mpl in &ir.root.body {
        let mut terms = Vec::new();
        let mut post_op = PostOp::Identity;

        for npl in &mpl.body {
            let neighborhood = &ir.neighborhoods[npl.neighborhood];
            for assign in &npl.body {
                debug_assert_eq!(assign.op, AssignOp::Add);
                for (position, offset) in neighborhood.offsets().iter().enumerate() {
                    let (coefficient, rest) = split_coefficient(&assign.expr, npl.id, position, coefficients)?;
                    let input = grid_input_of(&assign.expr, npl.id);
                    if let Some((name, extra)) = rest {
                        post_op = PostOp::Call { name, extra_args: extra };
                    }
                    terms.push(Term { input, offset: offset.clone(), coefficient });
                }
            }
        }
        convolutions.push(ConvolutionTerms { convolution: mpl.convolution, terms, post_op });
    }

    Ok(UnrolledKernel { convolutions, ghost_depth })
}

/// Walk `expr` (shaped `Coefficient * Grid` optionally wrapped in one
/// `Math` call applied to the whole term) and return the resolved
/// coefficient value for `position`, plus the math call if present.
fn split_coefficient(
    expr: &Expr,
    neighbor_loop: super::LoopId,
    position: usize,
    coefficients: Option<&crate::ir::builder::CoefficientTable>,
) -> Result<(f64, Option<(MathFn, Vec<f64>)>), IrError> {
    match expr {
        Expr::BinOp(BinOp::Mul, lhs, rhs) => {
            let coeff = match (lhs.as_ref(), rhs.as_ref()) {
                (Expr::Coefficient(src), _) | (_, Expr::Coefficient(src)) => {
                    resolve_coefficient(src, position, coefficients)?
                }
                _ => 1.0,
            };
            Ok((coeff, None))
        }
        Expr::Math(m) => {
            let (coeff, _) = split_coefficient(&m.args[0], neighbor_loop, position, coefficients)?;
            let extra: Vec<f64> = m.args[1..]
                .iter()
                .map(|a| match a {
                    Expr::Literal(v) => *v,
                    _ => 0.0,
                })
                .collect();
            Ok((coeff, Some((m.name, extra))))
        }
        _ => Ok((1.0, None)),
    }
}

fn resolve_coefficient(
    src: &CoeffSource,
    position: usize,
    coefficients: Option<&crate::ir::builder::CoefficientTable>,
) -> Result<f64, IrError> {
    match src {
        CoeffSource::Literal(values) => Ok(values[position]),
        CoeffSource::Table { conv, channel } => {
            let table = coefficients.ok_or(IrError::UnknownInputGrid { id: *channel, count: 0 })?;
            Ok(table.get(*conv, *channel, position))
        }
    }
}

fn grid_input_of(expr: &Expr, neighbor_loop: super::LoopId) -> usize {
    match expr {
        Expr::BinOp(_, lhs, rhs) => {
            grid_input_of(lhs, neighbor_loop).max(grid_input_of_opt(rhs, neighbor_loop))
        }
        Expr::Math(m) => m
            .args
            .iter()
            .map(|a| grid_input_of(a, neighbor_loop))
            .max()
            .unwrap_or(0),
        Expr::Grid(ge) => match (ge.grid, ge.index) {
            (GridRef::Input(i), IndexRef::Neighbor(id)) if id == neighbor_loop => i,
            _ => 0,
        },
        _ => 0,
    }
}

fn grid_input_of_opt(expr: &Expr, neighbor_loop: super::LoopId) -> usize {
    grid_input_of(expr, neighbor_loop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{build, KernelDef, NeighborOp, PostOp as BuilderPostOp};
    use crate::neighborhood::Neighborhood;

    #[test]
    fn unrolls_laplacian_into_five_terms() {
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
            post_op: BuilderPostOp::Identity,
        };
        let ir = build(def, 2).unwrap();
        let unrolled = unroll(&ir, None).unwrap();
        assert_eq!(unrolled.convolutions.len(), 1);
        let terms = &unrolled.convolutions[0].terms;
        assert_eq!(terms.len(), 5);
        assert_eq!(terms[0].coefficient, -4.0);
        assert_eq!(terms[0].offset, vec![0, 0]);
        assert!(terms.iter().all(|t| t.input == 0));
        assert_eq!(unrolled.ghost_depth, vec![1, 1]);
    }

    #[test]
    fn unrolls_table_sourced_multi_convolution() {
        use crate::ir::builder::CoefficientTable;
        let n = Neighborhood::custom(vec![vec![0, 0], vec![1, 0]]).unwrap();
        let def = KernelDef {
            neighborhoods: vec![n],
            num_inputs: 1,
            num_convolutions: 2,
            ops: vec![NeighborOp::table(0, 0)],
            post_op: BuilderPostOp::Identity,
        };
        let ir = build(def, 2).unwrap();
        let table = CoefficientTable::new(vec![1.0, 2.0, 3.0, 4.0], 2, 1, 2).unwrap();
        let unrolled = unroll(&ir, Some(&table)).unwrap();
        assert_eq!(unrolled.convolutions.len(), 2);
        assert_eq!(
            unrolled.convolutions[0].terms.iter().map(|t| t.coefficient).collect::<Vec<_>>(),
            vec![1.0, 2.0]
        );
        assert_eq!(
            unrolled.convolutions[1].terms.iter().map(|t| t.coefficient).collect::<Vec<_>>(),
            vec![3.0, 4.0]
        );
    }
}
