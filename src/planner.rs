//! Local/global work-size planner (§4.F).
//!
//! Chooses a work-group tiling compatible with device limits: grow a
//! candidate `local_size`, one dimension at a time, by doubling in cyclic
//! innermost-first order, stopping the moment no dimension can grow without
//! violating the work-group size, per-dimension, or local-memory budget.

use thiserror::Error;

/// Device capabilities the planner must respect.
#[derive(Debug, Clone)]
pub struct DeviceLimits {
    /// Maximum product of `local_size` across all dimensions.
    pub max_work_group: usize,
    /// Per-dimension maximum `local_size[d]`.
    pub max_per_dim: Vec<usize>,
    /// Maximum bytes available for one kernel's `__local` tile.
    pub max_local_mem_bytes: usize,
}

impl DeviceLimits {
    /// The "trivial testing device" from §4.F: effectively unlimited,
    /// used only to satisfy the `testing` configuration flag's separate
    /// force-to-`(1,...,1)` path, not to drive real planning.
    pub fn unrestricted(ndim: usize) -> Self {
        Self {
            max_work_group: usize::MAX,
            max_per_dim: vec![usize::MAX; ndim],
            max_local_mem_bytes: usize::MAX,
        }
    }
}

/// Errors raised when no tiling satisfies the device's limits.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanningError {
    /// Even the minimal `local_size = (1, ..., 1)` tiling violates a limit
    /// in dimension `dim`.
    #[error("cannot satisfy device limits in dimension {dim}: local_size would be 0")]
    Unsatisfiable {
        /// The offending dimension.
        dim: usize,
    },
}

/// A chosen tiling plus its derived quantities (§3's "launch plan" fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Work-group size per dimension.
    pub local_size: Vec<usize>,
    /// Padded global NDRange, a multiple of `local_size` in every
    /// dimension and `>= global_shape`.
    pub virtual_global_size: Vec<usize>,
    /// Bytes the generated kernel's `__local` tile occupies.
    pub tile_bytes: usize,
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Compute a deterministic work-group tiling for `global_shape`, given
/// `ghost_depth` (the halo each tile must carry) and `limits`.
///
/// When `testing` is set, `local_size = (1, ..., 1)` unconditionally,
/// matching the `testing` configuration option (§6) which "disables device
/// inspection".
pub fn plan(
    global_shape: &[usize],
    ghost_depth: &[usize],
    limits: &DeviceLimits,
    dtype_size: usize,
    testing: bool,
) -> Result<Plan, PlanningError> {
    let ndim = global_shape.len();
    let local_size = if testing {
        vec![1usize; ndim]
    } else {
        greedy_local_size(global_shape, ghost_depth, limits, dtype_size)?
    };

    let virtual_global_size: Vec<usize> = global_shape
        .iter()
        .zip(&local_size)
        .map(|(&g, &l)| l * ceil_div(g, l))
        .collect();

    let tile_bytes = tile_size_bytes(&local_size, ghost_depth, dtype_size);

    Ok(Plan { local_size, virtual_global_size, tile_bytes })
}

fn tile_size_bytes(local_size: &[usize], ghost_depth: &[usize], dtype_size: usize) -> usize {
    local_size
        .iter()
        .zip(ghost_depth)
        .map(|(&l, &g)| l + 2 * g)
        .product::<usize>()
        * dtype_size
}

fn greedy_local_size(
    global_shape: &[usize],
    ghost_depth: &[usize],
    limits: &DeviceLimits,
    dtype_size: usize,
) -> Result<Vec<usize>, PlanningError> {
    let ndim = global_shape.len();
    let mut local_size = vec![1usize; ndim];

    for d in 0..ndim {
        let max_d = *limits.max_per_dim.get(d).unwrap_or(&usize::MAX);
        if max_d == 0 || limits.max_work_group == 0 {
            return Err(PlanningError::Unsatisfiable { dim: d });
        }
    }
    if tile_size_bytes(&local_size, ghost_depth, dtype_size) > limits.max_local_mem_bytes {
        return Err(PlanningError::Unsatisfiable { dim: 0 });
    }

    // Dimensions whose global extent is odd are pinned at local_size 1, per
    // §4.F ("Odd dimensions are pinned at 1").
    let pinned: Vec<bool> = global_shape.iter().map(|&s| s % 2 == 1).collect();

    loop {
        let mut grew = false;
        // Cyclic order, innermost (fastest-varying, highest index) first —
        // ties in which dimension grows next favor the innermost one.
        for d in (0..ndim).rev() {
            if pinned[d] {
                continue;
            }
            let candidate = local_size[d] * 2;
            let max_d = *limits.max_per_dim.get(d).unwrap_or(&usize::MAX);
            if candidate > max_d {
                continue;
            }
            let mut trial = local_size.clone();
            trial[d] = candidate;
            let product: usize = trial.iter().product();
            if product > limits.max_work_group {
                continue;
            }
            if tile_size_bytes(&trial, ghost_depth, dtype_size) > limits.max_local_mem_bytes {
                continue;
            }
            local_size = trial;
            grew = true;
        }
        if !grew {
            break;
        }
    }

    Ok(local_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_work_group: usize, max_per_dim: Vec<usize>) -> DeviceLimits {
        DeviceLimits { max_work_group, max_per_dim, max_local_mem_bytes: 1 << 20 }
    }

    #[test]
    fn testing_mode_forces_unit_local_size() {
        let p = plan(&[512, 101], &[1, 1], &limits(512, vec![512, 512]), 8, true).unwrap();
        assert_eq!(p.local_size, vec![1, 1]);
    }

    #[test]
    fn virtual_global_size_is_multiple_of_local_size_and_covers_shape() {
        let p = plan(&[512, 101], &[1, 1], &limits(512, vec![512, 512, 512]), 8, false).unwrap();
        for d in 0..2 {
            assert!(p.virtual_global_size[d] >= [512, 101][d]);
            assert_eq!(p.virtual_global_size[d] % p.local_size[d], 0);
        }
    }

    #[test]
    fn odd_dimension_is_pinned_at_one() {
        // shape[1] = 101 is odd, so local_size[1] must stay 1.
        let p = plan(&[512, 101], &[1, 1], &limits(512, vec![512, 512]), 8, false).unwrap();
        assert_eq!(p.local_size[1], 1);
    }

    #[test]
    fn respects_work_group_and_per_dim_caps() {
        let p = plan(&[64, 64], &[0, 0], &limits(16, vec![64, 64]), 4, false).unwrap();
        let product: usize = p.local_size.iter().product();
        assert!(product <= 16);
    }

    #[test]
    fn local_mem_budget_limits_growth() {
        // A tiny local-mem budget should prevent any growth past (1, 1).
        let tiny = DeviceLimits { max_work_group: 1024, max_per_dim: vec![1024, 1024], max_local_mem_bytes: 16 };
        let p = plan(&[64, 64], &[1, 1], &tiny, 8, false).unwrap();
        assert_eq!(p.local_size, vec![1, 1]);
    }

    #[test]
    fn zero_max_work_group_is_unsatisfiable() {
        let err = plan(&[8, 8], &[0, 0], &limits(0, vec![8, 8]), 4, false).unwrap_err();
        assert_eq!(err, PlanningError::Unsatisfiable { dim: 0 });
    }
}
