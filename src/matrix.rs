//! Banded stencil operators between decomposed tensor-product spaces.

use std::ops::{AddAssign, MulAssign};
use std::sync::Arc;

use itertools::izip;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use num::Zero;
use rayon::prelude::*;

use crate::cart::CartDecomposition;
use crate::error::{Error, Result};
use crate::exchange::{collective_ghost_state, synchronize, GhostState, HaloLayout};
use crate::util::{for_each_multi_index, strides_for};
use crate::vector::StencilVector;
use crate::StencilScalar;

/// A distributed banded operator mapping vectors over `domain` to vectors
/// over `codomain`.
///
/// Only couplings within a per-axis bandwidth of the diagonal are stored:
/// the entry at (row `r`, offset `k`) couples row `r` to column `r + k`,
/// with `k` ranging over `[-bw, +bw]` per axis. Rows are laid out like a
/// stencil vector over the codomain (interior plus pad rows), each carrying
/// a contiguous diagonal block, so ghost-row contributions from assembly
/// are reconciled by the same exchange protocol as vectors.
///
/// Domain and codomain may differ (rectangular operators between spaces of
/// different degree) as long as they share the process grid and every
/// codomain row can reach its coupled columns inside the domain's padded
/// buffer; this is validated at construction.
#[derive(Debug, Clone)]
pub struct StencilMatrix<T, const D: usize> {
    domain: Arc<CartDecomposition<D>>,
    codomain: Arc<CartDecomposition<D>>,
    bandwidth: [usize; D],
    diag_dims: [usize; D],
    diag_strides: [usize; D],
    layout: HaloLayout<D>,
    data: Vec<T>,
    ghost_state: GhostState,
    scratch: Vec<T>,
}

impl<T: StencilScalar, const D: usize> StencilMatrix<T, D> {
    pub fn new(
        domain: Arc<CartDecomposition<D>>,
        codomain: Arc<CartDecomposition<D>>,
        bandwidth: [usize; D],
    ) -> Result<Self> {
        if !domain.shares_grid_with(&codomain) {
            return Err(Error::configuration(
                "domain and codomain must share the same process grid and placement",
            ));
        }
        for axis in 0..D {
            if bandwidth[axis] > domain.pads()[axis] {
                return Err(Error::configuration(format!(
                    "bandwidth {} on axis {axis} exceeds the domain pad {}",
                    bandwidth[axis],
                    domain.pads()[axis]
                )));
            }
            // Every owned codomain row must reach all coupled columns
            // inside the domain's padded buffer.
            let bw = bandwidth[axis] as i64;
            let dom_low = domain.starts()[axis] as i64 - domain.pads()[axis] as i64;
            let dom_high = domain.ends()[axis] as i64 + domain.pads()[axis] as i64;
            let cod_low = codomain.starts()[axis] as i64 - bw;
            let cod_high = codomain.ends()[axis] as i64 + bw;
            if cod_low < dom_low || cod_high > dom_high {
                return Err(Error::configuration(format!(
                    "codomain rows on axis {axis} couple to columns outside the domain's padded range"
                )));
            }
        }
        let diag_dims: [usize; D] = std::array::from_fn(|axis| 2 * bandwidth[axis] + 1);
        let diag_strides = strides_for(diag_dims, 1);
        let item: usize = diag_dims.iter().product();
        let layout = HaloLayout::new(&codomain, item);
        let data = vec![T::zero(); layout.len];
        Ok(Self {
            domain,
            codomain,
            bandwidth,
            diag_dims,
            diag_strides,
            layout,
            data,
            ghost_state: GhostState::InSync,
            scratch: Vec::new(),
        })
    }

    /// Square operator on a single space, with bandwidth equal to the
    /// space's pads.
    pub fn square(cart: Arc<CartDecomposition<D>>) -> Result<Self> {
        let bandwidth = cart.pads();
        Self::new(Arc::clone(&cart), cart, bandwidth)
    }

    pub fn domain(&self) -> &Arc<CartDecomposition<D>> {
        &self.domain
    }

    pub fn codomain(&self) -> &Arc<CartDecomposition<D>> {
        &self.codomain
    }

    pub fn bandwidth(&self) -> [usize; D] {
        self.bandwidth
    }

    pub fn ghost_state(&self) -> GhostState {
        self.ghost_state
    }

    pub(crate) fn set_ghost_state(&mut self, state: GhostState) {
        self.ghost_state = state;
    }

    fn row_position(&self, row: &[i64; D]) -> Result<usize> {
        let mut pos = [0usize; D];
        for axis in 0..D {
            let p = self.layout.pads[axis] as i64;
            let n = self.layout.interior[axis] as i64;
            if row[axis] < -p || row[axis] >= n + p {
                return Err(Error::Index {
                    axis,
                    index: row[axis],
                    low: -p,
                    high: n + p,
                });
            }
            pos[axis] = (row[axis] + p) as usize;
        }
        Ok(self.layout.offset(pos))
    }

    fn diag_position(&self, offset: &[i64; D]) -> Result<usize> {
        let mut index = 0;
        for axis in 0..D {
            let bw = self.bandwidth[axis] as i64;
            if offset[axis] < -bw || offset[axis] > bw {
                return Err(Error::Index {
                    axis,
                    index: offset[axis],
                    low: -bw,
                    high: bw + 1,
                });
            }
            index += (offset[axis] + bw) as usize * self.diag_strides[axis];
        }
        Ok(index)
    }

    fn note_write(&mut self, row: &[i64; D]) {
        if self.codomain.is_interior(row) {
            self.ghost_state = self.ghost_state.max(GhostState::Stale);
        } else {
            self.ghost_state = GhostState::Pending;
        }
    }

    pub fn get(&self, row: &[i64; D], offset: &[i64; D]) -> Result<T> {
        let position = self.row_position(row)? + self.diag_position(offset)?;
        Ok(self.data[position])
    }

    pub fn set(&mut self, row: &[i64; D], offset: &[i64; D], value: T) -> Result<()> {
        let position = self.row_position(row)? + self.diag_position(offset)?;
        self.data[position] = value;
        self.note_write(row);
        Ok(())
    }

    /// Add `value` into the coupling at (`row`, `offset`). Additions into
    /// pad rows are pending contributions to a neighbor and are reconciled
    /// by [`update_ghost_regions`](Self::update_ghost_regions).
    pub fn add(&mut self, row: &[i64; D], offset: &[i64; D], value: T) -> Result<()> {
        let position = self.row_position(row)? + self.diag_position(offset)?;
        self.data[position] += value;
        self.note_write(row);
        Ok(())
    }

    /// Matrix-vector product into a fresh vector over the codomain.
    ///
    /// The input vector's halo must already be current (call
    /// [`StencilVector::update_ghost_regions`] first); the product does not
    /// synchronize implicitly so that chained products do not pay for
    /// redundant communication. Periodic coupling is realized entirely by
    /// the halo contents, and couplings past a non-periodic boundary read
    /// the zero ghosts there and contribute nothing.
    pub fn dot(&self, x: &StencilVector<T, D>) -> Result<StencilVector<T, D>> {
        let mut y = StencilVector::new(Arc::clone(&self.codomain));
        self.dot_into(x, &mut y, false)?;
        Ok(y)
    }

    /// Matrix-vector product into an existing vector, optionally
    /// accumulating onto its current interior values.
    pub fn dot_into(
        &self,
        x: &StencilVector<T, D>,
        y: &mut StencilVector<T, D>,
        accumulate: bool,
    ) -> Result<()> {
        if !x.cart().is_compatible_with(&self.domain) {
            return Err(Error::shape_mismatch(
                "input vector does not live on the operator's domain",
            ));
        }
        if !y.cart().is_compatible_with(&self.codomain) {
            return Err(Error::shape_mismatch(
                "output vector does not live on the operator's codomain",
            ));
        }
        if !accumulate {
            y.zero_out();
        }

        let item: usize = self.diag_dims.iter().product();
        let x_strides = x.layout().strides;
        // Flat stride of each diagonal offset into the input buffer, in
        // diagonal-block order.
        let mut x_offsets = Vec::with_capacity(item);
        for_each_multi_index(self.diag_dims, |k| {
            let mut step = 0i64;
            for axis in 0..D {
                step += (k[axis] as i64 - self.bandwidth[axis] as i64)
                    * x_strides[axis] as i64;
            }
            x_offsets.push(step);
        });
        // Buffer position of row 0 of this process in the input buffer.
        let shift: [usize; D] = std::array::from_fn(|axis| {
            (self.codomain.starts()[axis] as i64 - self.domain.starts()[axis] as i64
                + self.domain.pads()[axis] as i64) as usize
        });

        let interior = self.layout.interior;
        let pads = self.layout.pads;
        let y_stride0 = y.layout().strides[0];
        let y_strides = y.layout().strides;
        let m_strides = self.layout.strides;
        let m_data = &self.data;
        let x_data = x.data();
        let x_offsets = &x_offsets;

        // Axis-0 layers of the output touch disjoint rows, so they
        // parallelize without synchronization.
        y.data_mut()
            .par_chunks_mut(y_stride0)
            .enumerate()
            .skip(pads[0])
            .take(interior[0])
            .for_each(|(layer, y_chunk)| {
                let i0 = layer - pads[0];
                let mut outer = interior;
                outer[0] = 1;
                for_each_multi_index(outer, |rel| {
                    let mut row = rel;
                    row[0] = i0;
                    let mut y_offset = 0;
                    let mut m_offset = 0;
                    let mut x_base = 0i64;
                    for axis in 0..D {
                        if axis > 0 {
                            y_offset += (row[axis] + pads[axis]) * y_strides[axis];
                        }
                        m_offset += (row[axis] + pads[axis]) * m_strides[axis];
                        x_base += (row[axis] + shift[axis]) as i64 * x_strides[axis] as i64;
                    }
                    // m_offset counts from the buffer start; drop the
                    // axis-0 layers outside this chunk's row block.
                    let m_row = &m_data[m_offset..m_offset + item];
                    let mut sum = T::zero();
                    for (value, step) in m_row.iter().zip(x_offsets) {
                        sum += *value * x_data[(x_base + step) as usize];
                    }
                    if accumulate {
                        y_chunk[y_offset] += sum;
                    } else {
                        y_chunk[y_offset] = sum;
                    }
                });
            });
        y.set_ghost_state(y.ghost_state().max(GhostState::Stale));
        Ok(())
    }

    /// Synchronize ghost rows with the neighboring processes, with the same
    /// accumulate-then-refresh contract as vectors, applied per row block:
    /// pending pad-row contributions are added into the owner's rows, then
    /// all ghost rows are refreshed with the canonical values. Like the
    /// vector update this is a collective operation whose mode is the
    /// strongest tracked state across the communicator.
    pub fn update_ghost_regions(&mut self) -> Result<()> {
        let additive =
            match collective_ghost_state(self.codomain.comm().as_ref(), self.ghost_state)? {
                GhostState::InSync => return Ok(()),
                GhostState::Stale => false,
                GhostState::Pending => true,
            };
        synchronize(
            &self.codomain,
            &self.layout,
            &mut self.data,
            additive,
            &mut self.scratch,
        )?;
        self.ghost_state = GhostState::InSync;
        Ok(())
    }

    /// The transposed operator, mapping the codomain space to the domain
    /// space: `Tᵀ[r, k] = T[r + k, -k]`.
    ///
    /// Reads the rows within bandwidth of this process's interior,
    /// including ghost rows, so the matrix's ghost regions must be current
    /// (call [`update_ghost_regions`](Self::update_ghost_regions) first).
    pub fn transpose(&self) -> Result<Self> {
        for axis in 0..D {
            if self.bandwidth[axis] > self.codomain.pads()[axis] {
                return Err(Error::configuration(format!(
                    "transpose on axis {axis} needs ghost rows up to the bandwidth {}, but the codomain pad is {}",
                    self.bandwidth[axis],
                    self.codomain.pads()[axis]
                )));
            }
        }
        let mut transposed = StencilMatrix::new(
            Arc::clone(&self.codomain),
            Arc::clone(&self.domain),
            self.bandwidth,
        )?;
        let interior = transposed.layout.interior;
        for_each_multi_index(interior, |row| {
            for_each_multi_index(self.diag_dims, |k| {
                let mut offset = [0i64; D];
                let mut source_row = [0i64; D];
                let mut in_range = true;
                for axis in 0..D {
                    offset[axis] = k[axis] as i64 - self.bandwidth[axis] as i64;
                    // This row of the transpose corresponds to a column of
                    // `self`; the contributing row lives at row + offset in
                    // the codomain frame.
                    let global = transposed.codomain.starts()[axis] as i64
                        + row[axis] as i64
                        + offset[axis];
                    let local = global - self.codomain.starts()[axis] as i64;
                    let p = self.layout.pads[axis] as i64;
                    let n = self.layout.interior[axis] as i64;
                    if local < -p || local >= n + p {
                        in_range = false;
                        break;
                    }
                    source_row[axis] = local;
                }
                if !in_range {
                    return;
                }
                let negated: [i64; D] = std::array::from_fn(|axis| -offset[axis]);
                let value = self
                    .get(&source_row, &negated)
                    .expect("transpose source within bandwidth");
                let target: [i64; D] = std::array::from_fn(|axis| row[axis] as i64);
                transposed
                    .set(&target, &offset, value)
                    .expect("transpose target within bandwidth");
            });
        });
        Ok(transposed)
    }

    /// The main diagonal as a vector over the codomain.
    pub fn diagonal(&self) -> StencilVector<T, D> {
        let mut diag = StencilVector::new(Arc::clone(&self.codomain));
        let zero_offset = [0i64; D];
        let interior = self.layout.interior;
        for_each_multi_index(interior, |row| {
            let local: [i64; D] = std::array::from_fn(|axis| row[axis] as i64);
            let value = self
                .get(&local, &zero_offset)
                .expect("interior row within range");
            diag.set(&local, value).expect("interior row within range");
        });
        diag
    }

    /// Zero every coupling that reaches past a non-periodic boundary of the
    /// global index space. Such couplings are structurally absent; this
    /// removes anything a careless assembly scattered there.
    pub fn remove_spurious_entries(&mut self) {
        let dims = self.layout.dims;
        let diag_dims = self.diag_dims;
        for_each_multi_index(dims, |pos| {
            for_each_multi_index(diag_dims, |k| {
                let mut spurious = false;
                for axis in 0..D {
                    if self.domain.periods()[axis] {
                        continue;
                    }
                    let global_row = self.codomain.starts()[axis] as i64
                        + pos[axis] as i64
                        - self.layout.pads[axis] as i64;
                    let column = global_row + k[axis] as i64 - self.bandwidth[axis] as i64;
                    if column < 0 || column >= self.domain.global_shape()[axis] as i64 {
                        spurious = true;
                        break;
                    }
                }
                if spurious {
                    let position = self.layout.offset(pos)
                        + crate::util::flat_index(k, self.diag_strides);
                    self.data[position] = T::zero();
                }
            });
        });
    }

    /// Dense export of the owned rows against the flattened global column
    /// space, for diagnostics and solver interop. Traversal is
    /// deterministic: row-major over local rows, then over diagonal
    /// offsets. Exact zeros are kept; couplings past a non-periodic
    /// boundary do not exist and are skipped, periodic ones wrap.
    pub fn to_dense(&self) -> DMatrix<T> {
        let nrows: usize = self.layout.interior.iter().product();
        let ncols: usize = self.domain.global_shape().iter().product();
        let mut dense = DMatrix::zeros(nrows, ncols);
        self.for_each_owned_triplet(|row, col, value| {
            dense[(row, col)] += value;
        });
        dense
    }

    /// CSR export of the owned rows against the flattened global column
    /// space. Duplicate positions (small periodic grids where distinct
    /// offsets wrap onto one column) are summed.
    pub fn to_csr(&self) -> CsrMatrix<T> {
        let nrows: usize = self.layout.interior.iter().product();
        let ncols: usize = self.domain.global_shape().iter().product();
        let mut coo = CooMatrix::new(nrows, ncols);
        self.for_each_owned_triplet(|row, col, value| {
            coo.push(row, col, value);
        });
        CsrMatrix::from(&coo)
    }

    fn for_each_owned_triplet(&self, mut f: impl FnMut(usize, usize, T)) {
        let shape = self.domain.global_shape();
        let col_strides = strides_for(shape, 1);
        let row_strides = strides_for(self.layout.interior, 1);
        let interior = self.layout.interior;
        for_each_multi_index(interior, |row| {
            let row_flat = crate::util::flat_index(row, row_strides);
            let row_position = {
                let mut pos = [0usize; D];
                for axis in 0..D {
                    pos[axis] = row[axis] + self.layout.pads[axis];
                }
                self.layout.offset(pos)
            };
            for_each_multi_index(self.diag_dims, |k| {
                let mut col_flat = 0usize;
                for axis in 0..D {
                    let global = self.codomain.starts()[axis] as i64 + row[axis] as i64;
                    let mut column = global + k[axis] as i64 - self.bandwidth[axis] as i64;
                    let n = shape[axis] as i64;
                    if column < 0 || column >= n {
                        if self.domain.periods()[axis] {
                            column = column.rem_euclid(n);
                        } else {
                            return;
                        }
                    }
                    col_flat += column as usize * col_strides[axis];
                }
                let value =
                    self.data[row_position + crate::util::flat_index(k, self.diag_strides)];
                f(row_flat, col_flat, value);
            });
        });
    }
}

impl<'a, T: StencilScalar, const D: usize> AddAssign<&'a StencilMatrix<T, D>>
    for StencilMatrix<T, D>
{
    fn add_assign(&mut self, rhs: &'a StencilMatrix<T, D>) {
        assert!(
            self.domain.is_compatible_with(&rhs.domain)
                && self.codomain.is_compatible_with(&rhs.codomain)
                && self.bandwidth == rhs.bandwidth,
            "addition requires matrices with identical spaces and bandwidth"
        );
        for (a, b) in izip!(&mut self.data, &rhs.data) {
            *a += *b;
        }
        self.ghost_state = self.ghost_state.max(rhs.ghost_state);
    }
}

impl<T: StencilScalar, const D: usize> MulAssign<T> for StencilMatrix<T, D> {
    fn mul_assign(&mut self, alpha: T) {
        for v in &mut self.data {
            *v *= alpha;
        }
    }
}
