//! Cartesian decomposition of a tensor-product global index space.
//!
//! A [`CartDecomposition`] partitions a D-dimensional index space across a
//! Cartesian grid of processes. Each process owns a contiguous interior
//! range per axis; the interiors of all processes tile the global space
//! exactly, while the pad (ghost) regions of neighbors overlap by design.
//! The decomposition is immutable after construction and shared read-only
//! by every stencil object built over it.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use tessella_comm::Communicator;

use crate::error::{Error, Result};

/// One of the two directions along an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Minus,
    Plus,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Minus => Side::Plus,
            Side::Plus => Side::Minus,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Side::Minus => 0,
            Side::Plus => 1,
        }
    }
}

/// Configuration surface for a [`CartDecomposition`].
///
/// Plain serializable data; the decomposition itself is produced by
/// [`CartBuilder::build`] against a communicator. The process grid is
/// derived from the communicator size by a near-square factorization unless
/// set explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartBuilder {
    shape: Vec<usize>,
    pads: Vec<usize>,
    periods: Vec<bool>,
    process_grid: Option<Vec<usize>>,
}

impl CartBuilder {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            pads: vec![0; shape.len()],
            periods: vec![false; shape.len()],
            process_grid: None,
        }
    }

    pub fn pads(mut self, pads: &[usize]) -> Self {
        self.pads = pads.to_vec();
        self
    }

    pub fn periodic(mut self, periods: &[bool]) -> Self {
        self.periods = periods.to_vec();
        self
    }

    pub fn process_grid(mut self, grid: &[usize]) -> Self {
        self.process_grid = Some(grid.to_vec());
        self
    }

    pub fn build<const D: usize>(
        &self,
        comm: Arc<dyn Communicator>,
    ) -> Result<CartDecomposition<D>> {
        let shape = to_array::<D>(&self.shape, "shape")?;
        let pads = to_array::<D>(&self.pads, "pads")?;
        if self.periods.len() != D {
            return Err(Error::configuration(format!(
                "periods has {} axes, expected {}",
                self.periods.len(),
                D
            )));
        }
        let mut periods = [false; D];
        periods.copy_from_slice(&self.periods);

        let grid = match &self.process_grid {
            Some(grid) => {
                let grid = to_array::<D>(grid, "process grid")?;
                let total: usize = grid.iter().product();
                if total != comm.size() {
                    return Err(Error::configuration(format!(
                        "process grid {:?} has {} cells but the communicator has {} ranks",
                        grid,
                        total,
                        comm.size()
                    )));
                }
                grid
            }
            None => compute_process_grid(comm.size(), &shape),
        };

        CartDecomposition::new(comm, shape, pads, periods, grid)
    }
}

fn to_array<const D: usize>(values: &[usize], what: &str) -> Result<[usize; D]> {
    if values.len() != D {
        return Err(Error::configuration(format!(
            "{what} has {} axes, expected {}",
            values.len(),
            D
        )));
    }
    let mut out = [0usize; D];
    out.copy_from_slice(values);
    Ok(out)
}

/// Near-square factorization of `size` into one factor per axis.
///
/// Prime factors of `size` are assigned, largest first, to the axis with
/// the largest per-process extent, so load stays balanced when axis
/// extents differ. Deterministic for a fixed size and shape.
pub fn compute_process_grid<const D: usize>(size: usize, shape: &[usize; D]) -> [usize; D] {
    let mut grid = [1usize; D];
    for factor in prime_factors_descending(size) {
        let mut best = 0;
        for axis in 1..D {
            // shape[axis] / grid[axis] > shape[best] / grid[best], in
            // integer arithmetic
            if shape[axis] * grid[best] > shape[best] * grid[axis] {
                best = axis;
            }
        }
        grid[best] *= factor;
    }
    grid
}

fn prime_factors_descending(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors.reverse();
    factors
}

/// Cartesian decomposition of a D-dimensional global index space.
#[derive(Clone)]
pub struct CartDecomposition<const D: usize> {
    comm: Arc<dyn Communicator>,
    shape: [usize; D],
    pads: [usize; D],
    periods: [bool; D],
    nprocs: [usize; D],
    coords: [usize; D],
    starts: [usize; D],
    ends: [usize; D],
    partition_starts: [Vec<usize>; D],
    partition_counts: [Vec<usize>; D],
    neighbors: [[Option<usize>; 2]; D],
}

impl<const D: usize> CartDecomposition<D> {
    /// Serial shorthand: the whole index space on a [`SelfComm`]-style
    /// single-rank communicator.
    ///
    /// [`SelfComm`]: tessella_comm::SelfComm
    pub fn serial(
        comm: Arc<dyn Communicator>,
        shape: [usize; D],
        pads: [usize; D],
        periods: [bool; D],
    ) -> Result<Self> {
        Self::new(comm, shape, pads, periods, [1; D])
    }

    fn new(
        comm: Arc<dyn Communicator>,
        shape: [usize; D],
        pads: [usize; D],
        periods: [bool; D],
        nprocs: [usize; D],
    ) -> Result<Self> {
        if D == 0 {
            return Err(Error::configuration("the index space must have at least one axis"));
        }
        for axis in 0..D {
            if shape[axis] == 0 {
                return Err(Error::configuration(format!(
                    "axis {axis} has zero extent"
                )));
            }
            if shape[axis] < nprocs[axis] {
                return Err(Error::configuration(format!(
                    "axis {axis} has {} grid points but {} processes; a process would own zero elements",
                    shape[axis], nprocs[axis]
                )));
            }
            // A halo may not span more than one neighbor.
            if pads[axis] > shape[axis] / nprocs[axis] {
                return Err(Error::configuration(format!(
                    "pad {} on axis {axis} exceeds the smallest local extent {}",
                    pads[axis],
                    shape[axis] / nprocs[axis]
                )));
            }
            if periods[axis] && pads[axis] == 0 {
                warn!(
                    "axis {axis} is periodic but has pad 0; wraparound will not be \
                     visible in any halo"
                );
            }
        }
        let total: usize = nprocs.iter().product();
        if total != comm.size() {
            return Err(Error::configuration(format!(
                "process grid {:?} has {} cells but the communicator has {} ranks",
                nprocs,
                total,
                comm.size()
            )));
        }

        let coords = coords_of_rank(comm.rank(), &nprocs);

        let partition_starts: [Vec<usize>; D] = std::array::from_fn(|axis| {
            (0..nprocs[axis])
                .map(|c| partition_start(shape[axis], nprocs[axis], c))
                .collect()
        });
        let partition_counts: [Vec<usize>; D] = std::array::from_fn(|axis| {
            (0..nprocs[axis])
                .map(|c| partition_count(shape[axis], nprocs[axis], c))
                .collect()
        });

        let mut starts = [0usize; D];
        let mut ends = [0usize; D];
        for axis in 0..D {
            starts[axis] = partition_starts[axis][coords[axis]];
            ends[axis] = starts[axis] + partition_counts[axis][coords[axis]] - 1;
        }

        let mut neighbors = [[None; 2]; D];
        for axis in 0..D {
            for side in [Side::Minus, Side::Plus] {
                neighbors[axis][side.index()] =
                    neighbor_coords(&coords, &nprocs, &periods, axis, side)
                        .map(|c| rank_of_coords_in(&c, &nprocs));
            }
        }

        debug!(
            "cart decomposition: shape {:?} over grid {:?}; rank {} at {:?} owns {:?}..={:?}",
            shape,
            nprocs,
            comm.rank(),
            coords,
            starts,
            ends
        );

        Ok(Self {
            comm,
            shape,
            pads,
            periods,
            nprocs,
            coords,
            starts,
            ends,
            partition_starts,
            partition_counts,
            neighbors,
        })
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn global_shape(&self) -> [usize; D] {
        self.shape
    }

    pub fn pads(&self) -> [usize; D] {
        self.pads
    }

    pub fn periods(&self) -> [bool; D] {
        self.periods
    }

    pub fn nprocs(&self) -> [usize; D] {
        self.nprocs
    }

    pub fn coords(&self) -> [usize; D] {
        self.coords
    }

    /// Global index of the first owned entry per axis.
    pub fn starts(&self) -> [usize; D] {
        self.starts
    }

    /// Global index of the last owned entry per axis (inclusive).
    pub fn ends(&self) -> [usize; D] {
        self.ends
    }

    /// Extent of the owned interior per axis.
    pub fn local_shape(&self) -> [usize; D] {
        std::array::from_fn(|axis| self.ends[axis] - self.starts[axis] + 1)
    }

    /// Extent of the local buffer per axis: interior plus a pad-wide ghost
    /// region on each side.
    pub fn buffer_shape(&self) -> [usize; D] {
        std::array::from_fn(|axis| {
            self.ends[axis] - self.starts[axis] + 1 + 2 * self.pads[axis]
        })
    }

    /// Rank of the immediate neighbor in the given direction, or `None` at
    /// a non-periodic boundary. On a periodic axis with a single process
    /// the neighbor is this process itself.
    pub fn neighbor(&self, axis: usize, side: Side) -> Option<usize> {
        self.neighbors[axis][side.index()]
    }

    /// Ownership ranges of every process coordinate along an axis, as
    /// `(start, count)` pairs.
    pub fn partition(&self, axis: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.partition_starts[axis]
            .iter()
            .zip(&self.partition_counts[axis])
            .map(|(&s, &c)| (s, c))
    }

    pub fn rank_of_coords(&self, coords: &[usize; D]) -> usize {
        rank_of_coords_in(coords, &self.nprocs)
    }

    /// Rank owning the given global index.
    pub fn owner_of(&self, global: &[usize; D]) -> Result<usize> {
        let mut coords = [0usize; D];
        for axis in 0..D {
            if global[axis] >= self.shape[axis] {
                return Err(Error::Index {
                    axis,
                    index: global[axis] as i64,
                    low: 0,
                    high: self.shape[axis] as i64,
                });
            }
            coords[axis] = owner_coord(self.shape[axis], self.nprocs[axis], global[axis]);
        }
        Ok(self.rank_of_coords(&coords))
    }

    /// Convert a global multi-index to this process's local interior-
    /// relative index, if it falls within the interior or pads. No
    /// periodic unwrapping is performed.
    pub fn global_to_local(&self, global: &[usize; D]) -> Option<[i64; D]> {
        let mut local = [0i64; D];
        for axis in 0..D {
            let l = global[axis] as i64 - self.starts[axis] as i64;
            let n = (self.ends[axis] - self.starts[axis] + 1) as i64;
            let p = self.pads[axis] as i64;
            if l < -p || l >= n + p {
                return None;
            }
            local[axis] = l;
        }
        Some(local)
    }

    /// Global position of a local interior-relative index. Ghost indices
    /// map outside the owned range and, near a periodic seam, outside the
    /// global range (unwrapped frame).
    pub fn local_to_global(&self, local: &[i64; D]) -> [i64; D] {
        std::array::from_fn(|axis| self.starts[axis] as i64 + local[axis])
    }

    /// Whether a local index lies in the owned interior (not in a pad).
    pub fn is_interior(&self, local: &[i64; D]) -> bool {
        (0..D).all(|axis| {
            let n = (self.ends[axis] - self.starts[axis] + 1) as i64;
            local[axis] >= 0 && local[axis] < n
        })
    }

    /// Structural compatibility: same global space, same partition, same
    /// position in it. Communicator identity is not compared.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.pads == other.pads
            && self.periods == other.periods
            && self.nprocs == other.nprocs
            && self.coords == other.coords
    }

    /// Whether two decompositions share the same process grid and
    /// placement, ignoring shape and pads. Rectangular operators couple
    /// spaces that agree on this much.
    pub fn shares_grid_with(&self, other: &Self) -> bool {
        self.periods == other.periods
            && self.nprocs == other.nprocs
            && self.coords == other.coords
    }
}

impl<const D: usize> fmt::Debug for CartDecomposition<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CartDecomposition")
            .field("shape", &self.shape)
            .field("pads", &self.pads)
            .field("periods", &self.periods)
            .field("nprocs", &self.nprocs)
            .field("coords", &self.coords)
            .field("starts", &self.starts)
            .field("ends", &self.ends)
            .field("neighbors", &self.neighbors)
            .finish_non_exhaustive()
    }
}

fn partition_count(n: usize, p: usize, coord: usize) -> usize {
    n / p + usize::from(coord < n % p)
}

fn partition_start(n: usize, p: usize, coord: usize) -> usize {
    let q = n / p;
    let r = n % p;
    if coord < r {
        coord * (q + 1)
    } else {
        r * (q + 1) + (coord - r) * q
    }
}

fn owner_coord(n: usize, p: usize, global: usize) -> usize {
    let q = n / p;
    let r = n % p;
    let threshold = r * (q + 1);
    if global < threshold {
        global / (q + 1)
    } else {
        r + (global - threshold) / q
    }
}

fn coords_of_rank<const D: usize>(rank: usize, nprocs: &[usize; D]) -> [usize; D] {
    let mut coords = [0usize; D];
    let mut rest = rank;
    for axis in (0..D).rev() {
        coords[axis] = rest % nprocs[axis];
        rest /= nprocs[axis];
    }
    coords
}

fn rank_of_coords_in<const D: usize>(coords: &[usize; D], nprocs: &[usize; D]) -> usize {
    let mut rank = 0;
    for axis in 0..D {
        rank = rank * nprocs[axis] + coords[axis];
    }
    rank
}

fn neighbor_coords<const D: usize>(
    coords: &[usize; D],
    nprocs: &[usize; D],
    periods: &[bool; D],
    axis: usize,
    side: Side,
) -> Option<[usize; D]> {
    let p = nprocs[axis];
    let stepped = match side {
        Side::Plus => {
            if coords[axis] + 1 < p {
                coords[axis] + 1
            } else if periods[axis] {
                0
            } else {
                return None;
            }
        }
        Side::Minus => {
            if coords[axis] > 0 {
                coords[axis] - 1
            } else if periods[axis] {
                p - 1
            } else {
                return None;
            }
        }
    };
    let mut out = *coords;
    out[axis] = stepped;
    Some(out)
}
