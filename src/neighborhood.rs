//! Neighbor-offset sets (von Neumann, Moore, custom).
//!
//! A [`Neighborhood`] is an ordered list of integer offsets relative to a
//! center point. Stencil kernels refer to neighborhoods by index; the order
//! of offsets within one is the order a [`NeighborPointsLoop`] iterates them
//! in, which matters once coefficients are attached per offset
//! (see [`crate::ir::CoeffSource::Literal`]).
//!
//! [`NeighborPointsLoop`]: crate::ir::NeighborPointsLoop

use std::collections::BTreeSet;

/// An offset relative to a stencil center point, one component per dimension.
pub type Offset = Vec<i64>;

/// Errors raised while constructing a [`Neighborhood`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NeighborhoodError {
    /// `custom()` was given an empty offset list.
    #[error("neighborhood must contain at least one offset")]
    Empty,
    /// Offsets within one neighborhood disagreed on dimensionality.
    #[error("offset {index} has dimensionality {got}, expected {expected}")]
    DimensionalityMismatch {
        /// Index of the offending offset.
        index: usize,
        /// Its dimensionality.
        got: usize,
        /// Dimensionality established by the first offset.
        expected: usize,
    },
}

/// An ordered set of neighbor offsets, all sharing one dimensionality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Neighborhood {
    offsets: Vec<Offset>,
    ndim: usize,
}

impl Neighborhood {
    /// Build a neighborhood from an explicit, caller-ordered offset list.
    ///
    /// Order is preserved exactly as given; this is the only constructor
    /// that does not sort its output.
    pub fn custom(offsets: Vec<Offset>) -> Result<Self, NeighborhoodError> {
        let first = offsets.first().ok_or(NeighborhoodError::Empty)?;
        let ndim = first.len();
        for (index, off) in offsets.iter().enumerate() {
            if off.len() != ndim {
                return Err(NeighborhoodError::DimensionalityMismatch {
                    index,
                    got: off.len(),
                    expected: ndim,
                });
            }
        }
        Ok(Self { offsets, ndim })
    }

    /// All points at Manhattan (L1) distance `<= radius` from the origin.
    ///
    /// Offsets are generated in lexicographic order. `include_origin`
    /// controls whether the zero offset (the center itself) is kept.
    pub fn von_neumann(radius: u32, ndim: usize, include_origin: bool) -> Self {
        let r = radius as i64;
        let mut offsets = Vec::new();
        generate_lattice(ndim, r, &mut vec![0i64; 0], &mut offsets, |off| {
            let dist: i64 = off.iter().map(|c| c.abs()).sum();
            dist <= r
        });
        if !include_origin {
            offsets.retain(|o| o.iter().any(|&c| c != 0));
        }
        Self { offsets, ndim }
    }

    /// All points at Chebyshev (L-infinity) distance `<= radius` from the origin.
    ///
    /// Offsets are generated in lexicographic order.
    pub fn moore(radius: u32, ndim: usize, include_origin: bool) -> Self {
        let r = radius as i64;
        let mut offsets = Vec::new();
        generate_lattice(ndim, r, &mut vec![0i64; 0], &mut offsets, |off| {
            off.iter().all(|&c| c.abs() <= r)
        });
        if !include_origin {
            offsets.retain(|o| o.iter().any(|&c| c != 0));
        }
        Self { offsets, ndim }
    }

    /// Dimensionality shared by every offset in this neighborhood.
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Number of offsets (the original source calls this the neighborhood's reach).
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether this neighborhood has zero offsets (impossible via the public
    /// constructors, but kept for API symmetry with `Vec::is_empty`).
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The offsets in iteration order.
    pub fn offsets(&self) -> &[Offset] {
        &self.offsets
    }

    /// The coordinate a given offset produces when applied to `center`.
    pub fn apply(center: &[i64], offset: &[i64]) -> Vec<i64> {
        center.iter().zip(offset).map(|(c, o)| c + o).collect()
    }
}

/// Per-dimension maximum absolute offset across all neighborhoods: the
/// thickness of the non-interior band a stencil using these neighborhoods
/// requires.
pub fn ghost_depth(neighborhoods: &[Neighborhood]) -> Vec<usize> {
    let ndim = neighborhoods.first().map(Neighborhood::ndim).unwrap_or(0);
    let mut depth = vec![0usize; ndim];
    for n in neighborhoods {
        for off in &n.offsets {
            for (d, &c) in off.iter().enumerate() {
                depth[d] = depth[d].max(c.unsigned_abs() as usize);
            }
        }
    }
    depth
}

fn generate_lattice(
    ndim: usize,
    radius: i64,
    prefix: &mut Vec<i64>,
    out: &mut Vec<Offset>,
    keep: impl Fn(&[i64]) -> bool + Copy,
) {
    if prefix.len() == ndim {
        if keep(prefix) {
            out.push(prefix.clone());
        }
        return;
    }
    for c in -radius..=radius {
        prefix.push(c);
        generate_lattice(ndim, radius, prefix, out, keep);
        prefix.pop();
    }
}

/// Distinct neighborhood ids referenced in `ids`, used by the frontend to
/// validate a kernel only references declared neighborhoods.
pub fn referenced_ids_in_range(ids: impl IntoIterator<Item = usize>, count: usize) -> bool {
    let set: BTreeSet<usize> = ids.into_iter().collect();
    set.iter().all(|&id| id < count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn von_neumann_2d_radius1_excludes_origin() {
        let n = Neighborhood::von_neumann(1, 2, false);
        let mut offs = n.offsets().to_vec();
        offs.sort();
        assert_eq!(offs, vec![vec![-1, 0], vec![0, -1], vec![0, 1], vec![1, 0]]);
    }

    #[test]
    fn von_neumann_2d_radius1_includes_origin() {
        let n = Neighborhood::von_neumann(1, 2, true);
        assert_eq!(n.len(), 5);
        assert!(n.offsets().iter().any(|o| o == &vec![0, 0]));
    }

    #[test]
    fn moore_2d_radius1_excludes_origin_is_8_neighbors() {
        let n = Neighborhood::moore(1, 2, false);
        assert_eq!(n.len(), 8);
    }

    #[test]
    fn ghost_depth_is_max_abs_offset_per_dim() {
        let a = Neighborhood::custom(vec![vec![-2, 0], vec![1, 0]]).unwrap();
        let b = Neighborhood::custom(vec![vec![0, 3], vec![0, -1]]).unwrap();
        assert_eq!(ghost_depth(&[a, b]), vec![2, 3]);
    }

    #[test]
    fn custom_rejects_mismatched_dimensionality() {
        let err = Neighborhood::custom(vec![vec![0, 0], vec![1, 0, 0]]).unwrap_err();
        assert_eq!(
            err,
            NeighborhoodError::DimensionalityMismatch { index: 1, got: 3, expected: 2 }
        );
    }

    #[test]
    fn custom_preserves_insertion_order() {
        let n = Neighborhood::custom(vec![vec![1, 1], vec![-1, -1], vec![0, 0]]).unwrap();
        assert_eq!(n.offsets(), &[vec![1, 1], vec![-1, -1], vec![0, 0]]);
    }
}
