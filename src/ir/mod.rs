//! The stencil intermediate representation (§4.C).
//!
//! A [`StencilIr`] is a small typed tree: one [`InteriorPointsLoop`] at the
//! root, optionally wrapping one [`MultiPointsLoop`] per convolution
//! channel, each containing one [`NeighborPointsLoop`] per neighborhood the
//! kernel reads from, each bottoming out in an [`Assign`] whose right-hand
//! side is an [`Expr`] tree of [`GridElement`] reads, coefficient lookups,
//! and [`MathFunction`] calls.
//!
//! The tree is built once, by [`builder`], and is never mutated in place —
//! lowering ([`crate::ir::unroll`] plus the backends in [`crate::backend`])
//! consumes it by reference and produces a new, flatter representation.

/// Declarative kernel definition and the frontend capture pass that
/// validates and emits a [`StencilIr`] from it (§4.D).
pub mod builder;
/// Full-unrolling lowering shared by the CPU and OpenCL backends (§4.G/H).
pub mod unroll;

use crate::neighborhood::Neighborhood;
use thiserror::Error;

/// Identifies one loop-binding site in the tree (an [`InteriorPointsLoop`]
/// or a [`NeighborPointsLoop`]), so that a [`GridElement`] deep inside the
/// body can say unambiguously which enclosing loop's current coordinate it
/// reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub u32);

/// Which grid an [`Assign`] or [`GridElement`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridRef {
    /// One of the kernel's input grids, by position.
    Input(usize),
    /// The single output grid.
    Output,
}

/// Which loop-bound coordinate a [`GridElement`] indexes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexRef {
    /// The enclosing [`InteriorPointsLoop`]'s current point.
    Center(LoopId),
    /// The enclosing [`NeighborPointsLoop`]'s current neighbor coordinate
    /// (`center + offset`, resolved during unrolling).
    Neighbor(LoopId),
}

/// A read or write site: one grid, indexed by one loop-bound coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct GridElement {
    /// Which grid.
    pub grid: GridRef,
    /// Which coordinate.
    pub index: IndexRef,
}

/// Where a coefficient value for one neighbor *position* (offset index
/// within its neighborhood) comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum CoeffSource {
    /// One literal per offset position, in the neighborhood's own order.
    /// Length must equal the referenced neighborhood's `len()`.
    Literal(Vec<f64>),
    /// Looked up at unroll time from the kernel's [`CoefficientTable`] at
    /// `(conv, channel, position)`, where `conv`/`channel` are fixed here
    /// and `position` is supplied by the enclosing
    /// [`NeighborPointsLoop`]'s offset index.
    ///
    /// [`CoefficientTable`]: builder::CoefficientTable
    Table {
        /// Convolution id (`c` in §4.H's `kernel_c0`, `kernel_c1`, …).
        conv: usize,
        /// Channel, conventionally the input grid index.
        channel: usize,
    },
}

/// Elementwise device-math functions (§4.C's `MathFunction` node),
/// applicable to a fully-summed convolution result before it is written out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MathFn {
    /// `sqrt(x)`.
    Sqrt,
    /// `fabs(x)`.
    Abs,
    /// `fmin(x, bound)`.
    Min,
    /// `fmax(x, bound)`.
    Max,
    /// `clamp(x, lo, hi)`.
    Clamp,
}

impl MathFn {
    /// The OpenCL builtin this maps to.
    pub fn ocl_name(self) -> &'static str {
        match self {
            MathFn::Sqrt => "sqrt",
            MathFn::Abs => "fabs",
            MathFn::Min => "fmin",
            MathFn::Max => "fmax",
            MathFn::Clamp => "clamp",
        }
    }

    /// Native evaluation used by the reference and CPU backends.
    pub fn eval(self, args: &[f64]) -> f64 {
        match self {
            MathFn::Sqrt => args[0].sqrt(),
            MathFn::Abs => args[0].abs(),
            MathFn::Min => args[0].min(args[1]),
            MathFn::Max => args[0].max(args[1]),
            MathFn::Clamp => args[0].clamp(args[1], args[2]),
        }
    }
}

/// A call into device math: `name(args...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MathFunction {
    /// Which function.
    pub name: MathFn,
    /// Its arguments, each itself an [`Expr`].
    pub args: Vec<Expr>,
}

/// Arithmetic operators combining two [`Expr`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A scalar expression: a grid read, a literal, a coefficient lookup, a
/// math call, or a binary combination of sub-expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Read one [`GridElement`].
    Grid(GridElement),
    /// A constant.
    Literal(f64),
    /// A coefficient, resolved to a literal during unrolling.
    Coefficient(CoeffSource),
    /// A device math call.
    Math(MathFunction),
    /// `lhs op rhs`.
    BinOp(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// `self * other`.
    pub fn mul(self, other: Expr) -> Expr {
        Expr::BinOp(BinOp::Mul, Box::new(self), Box::new(other))
    }

    /// `self + other`.
    pub fn add(self, other: Expr) -> Expr {
        Expr::BinOp(BinOp::Add, Box::new(self), Box::new(other))
    }
}

/// How an [`Assign`] combines its right-hand side with the current output
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `out[center] = expr`.
    Set,
    /// `out[center] += expr`.
    Add,
}

/// A statement: write `expr` into `target` (always the output grid; see
/// [`validate`]'s non-output-write check).
#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    /// Always `GridRef::Output`, indexed by the enclosing interior loop.
    pub target: GridElement,
    /// Combination mode.
    pub op: AssignOp,
    /// Value to combine in.
    pub expr: Expr,
}

/// Iterate neighborhood `neighborhood` around the enclosing interior
/// point's coordinate, once per offset, binding `id` to the current
/// neighbor coordinate inside `body`.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborPointsLoop {
    /// This loop's own binding id, referenced by `IndexRef::Neighbor`.
    pub id: LoopId,
    /// The interior loop this is nested in (enforced by [`validate`]).
    pub center: LoopId,
    /// Which declared neighborhood this iterates.
    pub neighborhood: usize,
    /// Statements executed once per offset.
    pub body: Vec<Assign>,
}

/// Emit one convolution channel's worth of neighbor loops.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiPointsLoop {
    /// Convolution/channel id, `0..num_convolutions`.
    pub convolution: usize,
    /// One neighbor loop per input term in this channel.
    pub body: Vec<NeighborPointsLoop>,
}

/// Iterate every interior point (distance `>= ghost_depth[d]` from every
/// boundary in dimension `d`), binding `id` to the current coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct InteriorPointsLoop {
    /// This loop's own binding id, referenced by `IndexRef::Center`.
    pub id: LoopId,
    /// One multi-points loop per convolution channel.
    pub body: Vec<MultiPointsLoop>,
}

/// The root of a stencil kernel's IR, plus the metadata needed to lower it:
/// the declared neighborhoods (shared by every `NeighborPointsLoop`) and how
/// many input grids the kernel reads.
#[derive(Debug, Clone, PartialEq)]
pub struct StencilIr {
    /// The single root loop.
    pub root: InteriorPointsLoop,
    /// Declared neighborhoods, indexed by `NeighborPointsLoop::neighborhood`.
    pub neighborhoods: Vec<Neighborhood>,
    /// Number of declared input grids.
    pub num_inputs: usize,
    /// Number of convolution channels (`>= 1`).
    pub num_convolutions: usize,
}

/// Errors raised while validating or building a [`StencilIr`] (§4.D).
#[derive(Debug, Error, PartialEq)]
pub enum IrError {
    /// A `NeighborPointsLoop` named a neighborhood id past the declared list.
    #[error("neighborhood id {id} is not declared (have {count})")]
    UnknownNeighborhood {
        /// The offending id.
        id: usize,
        /// How many neighborhoods were declared.
        count: usize,
    },
    /// An `Assign` wrote to something other than the output grid.
    #[error("kernel writes to input grid {0}, only the output grid may be written")]
    WriteToInputGrid(usize),
    /// A `GridElement` read an input grid id past the declared count.
    #[error("input grid id {id} is not declared (have {count})")]
    UnknownInputGrid {
        /// The offending id.
        id: usize,
        /// How many input grids were declared.
        count: usize,
    },
    /// An `IndexRef::Center`/`Neighbor` referenced a loop id that isn't the
    /// (unique) enclosing binder of that kind.
    #[error("index reference to loop {0:?} is not bound by its enclosing loop")]
    UnboundLoopReference(LoopId),
    /// A neighborhood's offset dimensionality didn't match the grid's.
    #[error("neighborhood {neighborhood} has offsets of dimensionality {got}, grid is {expected}-D")]
    DimensionalityMismatch {
        /// Which neighborhood.
        neighborhood: usize,
        /// Its dimensionality.
        got: usize,
        /// The grid's declared dimensionality.
        expected: usize,
    },
    /// A `CoeffSource::Literal` had the wrong length for its neighborhood.
    #[error("literal coefficient list has {got} entries, neighborhood {neighborhood} has {expected}")]
    CoefficientArityMismatch {
        /// Which neighborhood.
        neighborhood: usize,
        /// Length supplied.
        got: usize,
        /// Length required (the neighborhood's offset count).
        expected: usize,
    },
    /// `num_convolutions` was zero.
    #[error("num_convolutions must be >= 1")]
    ZeroConvolutions,
}

/// Validate every structural invariant from §3/§4.C/§4.D against a built
/// tree: neighborhood ids in range, dimensionality agreement, writes only
/// to the output grid, reads only from declared input grids, coefficient
/// arity, and that every index reference is bound by its matching enclosing
/// loop (checked by construction here since the tree shape makes dangling
/// references structurally impossible — retained as a defense-in-depth pass
/// for IR built outside [`builder`]).
pub fn validate(ir: &StencilIr, grid_ndim: usize) -> Result<(), IrError> {
    if ir.num_convolutions == 0 {
        return Err(IrError::ZeroConvolutions);
    }
    for (nid, n) in ir.neighborhoods.iter().enumerate() {
        if n.ndim() != grid_ndim {
            return Err(IrError::DimensionalityMismatch {
                neighborhood: nid,
                got: n.ndim(),
                expected: grid_ndim,
            });
        }
    }
    for mpl in &ir.root.body {
        for npl in &mpl.body {
            if npl.center != ir.root.id {
                return Err(IrError::UnboundLoopReference(npl.center));
            }
            let neighborhood = ir.neighborhoods.get(npl.neighborhood).ok_or(
                IrError::UnknownNeighborhood { id: npl.neighborhood, count: ir.neighborhoods.len() },
            )?;
            for assign in &npl.body {
                validate_grid_element(&assign.target, ir.root.id, npl.id, ir.num_inputs)?;
                if assign.target.grid != GridRef::Output {
                    if let GridRef::Input(i) = assign.target.grid {
                        return Err(IrError::WriteToInputGrid(i));
                    }
                }
                validate_expr(&assign.expr, ir.root.id, npl.id, ir.num_inputs, npl.neighborhood, neighborhood.len())?;
            }
        }
    }
    Ok(())
}

fn validate_grid_element(
    ge: &GridElement,
    center_id: LoopId,
    neighbor_id: LoopId,
    num_inputs: usize,
) -> Result<(), IrError> {
    if let GridRef::Input(i) = ge.grid {
        if i >= num_inputs {
            return Err(IrError::UnknownInputGrid { id: i, count: num_inputs });
        }
    }
    match ge.index {
        IndexRef::Center(id) if id == center_id => Ok(()),
        IndexRef::Neighbor(id) if id == neighbor_id => Ok(()),
        IndexRef::Center(id) | IndexRef::Neighbor(id) => Err(IrError::UnboundLoopReference(id)),
    }
}

fn validate_expr(
    expr: &Expr,
    center_id: LoopId,
    neighbor_id: LoopId,
    num_inputs: usize,
    neighborhood_id: usize,
    neighborhood_len: usize,
) -> Result<(), IrError> {
    match expr {
        Expr::Grid(ge) => validate_grid_element(ge, center_id, neighbor_id, num_inputs),
        Expr::Literal(_) => Ok(()),
        Expr::Coefficient(CoeffSource::Literal(values)) => {
            if values.len() != neighborhood_len {
                return Err(IrError::CoefficientArityMismatch {
                    neighborhood: neighborhood_id,
                    got: values.len(),
                    expected: neighborhood_len,
                });
            }
            Ok(())
        }
        Expr::Coefficient(CoeffSource::Table { channel, .. }) => {
            if *channel >= num_inputs {
                return Err(IrError::UnknownInputGrid { id: *channel, count: num_inputs });
            }
            Ok(())
        }
        Expr::Math(m) => {
            for a in &m.args {
                validate_expr(a, center_id, neighbor_id, num_inputs, neighborhood_id, neighborhood_len)?;
            }
            Ok(())
        }
        Expr::BinOp(_, lhs, rhs) => {
            validate_expr(lhs, center_id, neighbor_id, num_inputs, neighborhood_id, neighborhood_len)?;
            validate_expr(rhs, center_id, neighbor_id, num_inputs, neighborhood_id, neighborhood_len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighborhood::Neighborhood;

    fn one_neighborhood_kernel() -> StencilIr {
        let center = LoopId(0);
        let nloop = LoopId(1);
        let n = Neighborhood::custom(vec![vec![0, 0], vec![1, 0]]).unwrap();
        let assign = Assign {
            target: GridElement { grid: GridRef::Output, index: IndexRef::Center(center) },
            op: AssignOp::Add,
            expr: Expr::Coefficient(CoeffSource::Literal(vec![1.0, 2.0]))
                .mul(Expr::Grid(GridElement { grid: GridRef::Input(0), index: IndexRef::Neighbor(nloop) })),
        };
        StencilIr {
            root: InteriorPointsLoop {
                id: center,
                body: vec![MultiPointsLoop {
                    convolution: 0,
                    body: vec![NeighborPointsLoop {
                        id: nloop,
                        center,
                        neighborhood: 0,
                        body: vec![assign],
                    }],
                }],
            },
            neighborhoods: vec![n],
            num_inputs: 1,
            num_convolutions: 1,
        }
    }

    #[test]
    fn well_formed_tree_validates() {
        assert!(validate(&one_neighborhood_kernel(), 2).is_ok());
    }

    #[test]
    fn rejects_dimensionality_mismatch() {
        assert_eq!(
            validate(&one_neighborhood_kernel(), 3),
            Err(IrError::DimensionalityMismatch { neighborhood: 0, got: 2, expected: 3 })
        );
    }

    #[test]
    fn rejects_unknown_input_grid() {
        let mut ir = one_neighborhood_kernel();
        ir.num_inputs = 0;
        assert!(matches!(validate(&ir, 2), Err(IrError::UnknownInputGrid { id: 0, count: 0 })));
    }

    #[test]
    fn rejects_write_to_input_grid() {
        let mut ir = one_neighborhood_kernel();
        ir.root.body[0].body[0].body[0].target.grid = GridRef::Input(0);
        assert_eq!(validate(&ir, 2), Err(IrError::WriteToInputGrid(0)));
    }

    #[test]
    fn rejects_zero_convolutions() {
        let mut ir = one_neighborhood_kernel();
        ir.num_convolutions = 0;
        assert_eq!(validate(&ir, 2), Err(IrError::ZeroConvolutions));
    }
}
