//! Grid descriptors: the contiguous-buffer view a stencil reads and writes.
//!
//! The numeric array library that owns the real host buffer is an external
//! collaborator (see the crate root docs); [`GridDescriptor`] is the
//! `{data_ptr, dtype, ndim, shape, strides}` view this crate needs, plus
//! enough owned storage to make the reference and CPU backends runnable
//! without a third-party array crate in the loop.

use thiserror::Error;

/// Element type of a grid's backing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE float.
    F32,
    /// 64-bit IEEE float.
    F64,
}

impl DType {
    /// Size in bytes of one element, used by the work-size planner to size
    /// the local-memory tile (§4.F).
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

/// Errors raised constructing or indexing a [`GridDescriptor`].
#[derive(Debug, Error, PartialEq)]
pub enum GridError {
    /// `shape` was empty.
    #[error("grid must have at least one dimension")]
    ZeroDimensional,
    /// Supplied buffer length didn't match `shape`'s element count.
    #[error("buffer has {got} elements, shape implies {expected}")]
    BufferLengthMismatch {
        /// Length actually supplied.
        got: usize,
        /// Length `shape`'s product requires.
        expected: usize,
    },
    /// Two grids that must agree on shape didn't.
    #[error("shape mismatch: {a:?} vs {b:?}")]
    ShapeMismatch {
        /// First grid's shape.
        a: Vec<usize>,
        /// Second grid's shape.
        b: Vec<usize>,
    },
}

#[derive(Debug, Clone)]
enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Buffer {
    fn len(&self) -> usize {
        match self {
            Buffer::F32(v) => v.len(),
            Buffer::F64(v) => v.len(),
        }
    }

    fn get(&self, i: usize) -> f64 {
        match self {
            Buffer::F32(v) => v[i] as f64,
            Buffer::F64(v) => v[i],
        }
    }

    fn set(&mut self, i: usize, value: f64) {
        match self {
            Buffer::F32(v) => v[i] = value as f32,
            Buffer::F64(v) => v[i] = value,
        }
    }
}

/// Row-major strides for `shape`, i.e. `strides[d] = product(shape[d+1..])`.
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// An immutable-shape, owned numeric grid: `{data, dtype, ndim, shape, strides}`.
///
/// Invariant: `element_count == shape.iter().product()` and `strides` follow
/// [`row_major_strides`] unless constructed with an explicit override via
/// [`GridDescriptor::with_strides`].
#[derive(Debug, Clone)]
pub struct GridDescriptor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
    buffer: Buffer,
}

impl GridDescriptor {
    /// A freshly allocated, zero-filled grid of the given shape and dtype.
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Result<Self, GridError> {
        if shape.is_empty() {
            return Err(GridError::ZeroDimensional);
        }
        let count: usize = shape.iter().product();
        let buffer = match dtype {
            DType::F32 => Buffer::F32(vec![0.0; count]),
            DType::F64 => Buffer::F64(vec![0.0; count]),
        };
        let strides = row_major_strides(&shape);
        Ok(Self { shape, strides, dtype, buffer })
    }

    /// A grid built from caller-supplied row-major `f64` data.
    pub fn from_f64(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, GridError> {
        if shape.is_empty() {
            return Err(GridError::ZeroDimensional);
        }
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(GridError::BufferLengthMismatch { got: data.len(), expected });
        }
        let strides = row_major_strides(&shape);
        Ok(Self { shape, strides, dtype: DType::F64, buffer: Buffer::F64(data) })
    }

    /// A grid built from caller-supplied row-major `f32` data.
    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, GridError> {
        if shape.is_empty() {
            return Err(GridError::ZeroDimensional);
        }
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(GridError::BufferLengthMismatch { got: data.len(), expected });
        }
        let strides = row_major_strides(&shape);
        Ok(Self { shape, strides, dtype: DType::F32, buffer: Buffer::F32(data) })
    }

    /// Override the default row-major strides (e.g. to describe a
    /// transposed or padded external buffer).
    pub fn with_strides(mut self, strides: Vec<usize>) -> Result<Self, GridError> {
        if strides.len() != self.shape.len() {
            return Err(GridError::ShapeMismatch { a: self.shape.clone(), b: strides });
        }
        self.strides = strides;
        Ok(self)
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Shape, outermost dimension first.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Row-major (or overridden) strides.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Total element count, `= product(shape)`.
    pub fn element_count(&self) -> usize {
        self.buffer.len()
    }

    /// Whether `index` (signed, so out-of-range in either direction is
    /// representable) falls within `shape` in every dimension.
    pub fn in_bounds(&self, index: &[i64]) -> bool {
        index.len() == self.shape.len()
            && index
                .iter()
                .zip(&self.shape)
                .all(|(&i, &s)| i >= 0 && (i as usize) < s)
    }

    /// Flatten an in-bounds index using this grid's strides.
    pub fn flat_index(&self, index: &[i64]) -> Option<usize> {
        if !self.in_bounds(index) {
            return None;
        }
        Some(
            index
                .iter()
                .zip(&self.strides)
                .map(|(&i, &s)| i as usize * s)
                .sum(),
        )
    }

    /// Read the element at `index` as `f64`, widening if the backing buffer
    /// is `f32`. Panics if `index` is out of bounds — callers are expected
    /// to have already resolved boundary handling before indexing.
    pub fn get(&self, index: &[i64]) -> f64 {
        let flat = self
            .flat_index(index)
            .unwrap_or_else(|| panic!("index {index:?} out of bounds for shape {:?}", self.shape));
        self.buffer.get(flat)
    }

    /// Write `value` at `index`, narrowing if the backing buffer is `f32`.
    pub fn set(&mut self, index: &[i64], value: f64) {
        let flat = self
            .flat_index(index)
            .unwrap_or_else(|| panic!("index {index:?} out of bounds for shape {:?}", self.shape));
        self.buffer.set(flat, value);
    }

    /// Iterate every grid point in row-major order, as signed coordinate
    /// vectors (signed so they compose uniformly with neighbor offsets).
    pub fn all_points(&self) -> PointIter<'_> {
        PointIter::new(&self.shape, &[0usize; 0])
    }

    /// Iterate interior points only: those at distance `>= ghost_depth[d]`
    /// from every boundary in dimension `d`.
    pub fn interior_points<'a>(&'a self, ghost_depth: &'a [usize]) -> PointIter<'a> {
        PointIter::new(&self.shape, ghost_depth)
    }

    /// Copy this grid's raw `f64` contents out in row-major order.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.element_count()).map(|i| self.buffer.get(i)).collect()
    }
}

/// Row-major iterator over coordinate vectors, optionally restricted to an
/// interior band defined by a per-dimension ghost depth.
pub struct PointIter<'a> {
    shape: &'a [usize],
    lo: Vec<i64>,
    hi: Vec<i64>,
    cur: Option<Vec<i64>>,
}

impl<'a> PointIter<'a> {
    fn new(shape: &'a [usize], ghost_depth: &'a [usize]) -> Self {
        let ndim = shape.len();
        let lo: Vec<i64> = (0..ndim)
            .map(|d| *ghost_depth.get(d).unwrap_or(&0) as i64)
            .collect();
        let hi: Vec<i64> = (0..ndim)
            .map(|d| shape[d] as i64 - *ghost_depth.get(d).unwrap_or(&0) as i64)
            .collect();
        let empty = lo.iter().zip(&hi).any(|(&l, &h)| l >= h);
        let cur = if empty { None } else { Some(lo.clone()) };
        Self { shape, lo, hi, cur }
    }
}

impl<'a> Iterator for PointIter<'a> {
    type Item = Vec<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cur.take()?;
        let mut next = current.clone();
        let ndim = self.shape.len();
        let mut carry = true;
        for d in (0..ndim).rev() {
            if !carry {
                break;
            }
            next[d] += 1;
            if next[d] < self.hi[d] {
                carry = false;
            } else {
                next[d] = self.lo[d];
            }
        }
        self.cur = if carry { None } else { Some(next) };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_strides_2d() {
        assert_eq!(row_major_strides(&[3, 4]), vec![4, 1]);
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
    }

    #[test]
    fn zeros_has_expected_element_count() {
        let g = GridDescriptor::zeros(vec![8, 8], DType::F64).unwrap();
        assert_eq!(g.element_count(), 64);
        assert_eq!(g.get(&[3, 3]), 0.0);
    }

    #[test]
    fn from_f64_rejects_length_mismatch() {
        let err = GridDescriptor::from_f64(vec![2, 2], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(err, GridError::BufferLengthMismatch { got: 3, expected: 4 });
    }

    #[test]
    fn interior_points_respects_ghost_depth() {
        let g = GridDescriptor::zeros(vec![8, 8], DType::F64).unwrap();
        let pts: Vec<_> = g.interior_points(&[1, 1]).collect();
        assert_eq!(pts.len(), 6 * 6);
        assert!(pts.iter().all(|p| p[0] >= 1 && p[0] < 7 && p[1] >= 1 && p[1] < 7));
    }

    #[test]
    fn all_points_covers_full_grid_in_row_major_order() {
        let g = GridDescriptor::zeros(vec![2, 3], DType::F64).unwrap();
        let pts: Vec<_> = g.all_points().collect();
        assert_eq!(
            pts,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2],
            ]
        );
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut g = GridDescriptor::zeros(vec![4, 4], DType::F32).unwrap();
        g.set(&[1, 2], 5.5);
        assert_eq!(g.get(&[1, 2]), 5.5);
    }
}
