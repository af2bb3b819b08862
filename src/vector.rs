//! Distributed coefficient vectors over a Cartesian decomposition.

use std::ops::{AddAssign, MulAssign, SubAssign};
use std::sync::Arc;

use itertools::izip;
use nalgebra::{ComplexField, RealField};
use num::{One, Zero};

use tessella_comm::Communicator;

use crate::cart::CartDecomposition;
use crate::error::{Error, Result};
use crate::exchange::{collective_ghost_state, synchronize, GhostState, HaloLayout};
use crate::StencilScalar;

/// A dense D-dimensional coefficient array over the local interior of a
/// decomposition, surrounded by a pad-wide ghost region per axis.
///
/// Local indices are signed and interior-relative: on an axis with owned
/// extent `n` and pad `p`, valid indices run from `-p` to `n + p - 1` and
/// index `0` is the first owned entry. Entries outside the interior are
/// ghosts: they either mirror a neighbor's boundary data (after a ghost
/// update) or hold pending scatter contributions (before one).
#[derive(Debug, Clone)]
pub struct StencilVector<T, const D: usize> {
    cart: Arc<CartDecomposition<D>>,
    layout: HaloLayout<D>,
    data: Vec<T>,
    ghost_state: GhostState,
    scratch: Vec<T>,
}

impl<T: StencilScalar, const D: usize> StencilVector<T, D> {
    /// A zero-filled vector over the given decomposition.
    pub fn new(cart: Arc<CartDecomposition<D>>) -> Self {
        let layout = HaloLayout::new(&cart, 1);
        let data = vec![T::zero(); layout.len];
        Self {
            cart,
            layout,
            data,
            // All entries are zero, which is a globally consistent state.
            ghost_state: GhostState::InSync,
            scratch: Vec::new(),
        }
    }

    pub fn cart(&self) -> &Arc<CartDecomposition<D>> {
        &self.cart
    }

    pub fn ghost_state(&self) -> GhostState {
        self.ghost_state
    }

    fn buffer_position(&self, local: &[i64; D]) -> Result<usize> {
        let mut pos = [0usize; D];
        for axis in 0..D {
            let p = self.layout.pads[axis] as i64;
            let n = self.layout.interior[axis] as i64;
            if local[axis] < -p || local[axis] >= n + p {
                return Err(Error::Index {
                    axis,
                    index: local[axis],
                    low: -p,
                    high: n + p,
                });
            }
            pos[axis] = (local[axis] + p) as usize;
        }
        Ok(self.layout.offset(pos))
    }

    fn note_write(&mut self, local: &[i64; D]) {
        if self.cart.is_interior(local) {
            self.ghost_state = self.ghost_state.max(GhostState::Stale);
        } else {
            self.ghost_state = GhostState::Pending;
        }
    }

    pub fn get(&self, local: &[i64; D]) -> Result<T> {
        let offset = self.buffer_position(local)?;
        Ok(self.data[offset])
    }

    pub fn set(&mut self, local: &[i64; D], value: T) -> Result<()> {
        let offset = self.buffer_position(local)?;
        self.data[offset] = value;
        self.note_write(local);
        Ok(())
    }

    /// Add `value` into the entry at `local`. Additions into the pads are
    /// pending contributions to a neighbor's interior and are reconciled by
    /// [`update_ghost_regions`](Self::update_ghost_regions).
    pub fn add(&mut self, local: &[i64; D], value: T) -> Result<()> {
        let offset = self.buffer_position(local)?;
        self.data[offset] += value;
        self.note_write(local);
        Ok(())
    }

    /// `self += alpha * x`, elementwise over the full buffer including the
    /// ghost regions, so pending contributions combine linearly too.
    pub fn axpy(&mut self, alpha: T, x: &Self) -> Result<()> {
        self.check_compatible(x)?;
        for (a, b) in izip!(&mut self.data, &x.data) {
            *a += alpha * *b;
        }
        self.ghost_state = self.ghost_state.max(x.ghost_state);
        Ok(())
    }

    pub fn copy_from(&mut self, x: &Self) -> Result<()> {
        self.check_compatible(x)?;
        self.data.copy_from_slice(&x.data);
        self.ghost_state = x.ghost_state;
        Ok(())
    }

    pub fn zero_out(&mut self) {
        self.data.fill(T::zero());
        self.ghost_state = GhostState::InSync;
    }

    /// Conjugate every entry in place. A no-op for real scalars.
    pub fn conjugate(&mut self) {
        for v in &mut self.data {
            *v = v.conjugate();
        }
    }

    pub fn scale(&mut self, alpha: T) {
        for v in &mut self.data {
            *v *= alpha;
        }
    }

    /// Inner product `⟨self, x⟩` with `self` conjugated.
    ///
    /// Only owned interior entries enter the local sum, so a value present
    /// in several processes' ghost regions is counted exactly once, by its
    /// owner. The local sums are then combined by one blocking all-reduce
    /// across the decomposition's communicator.
    pub fn dot(&self, x: &Self) -> Result<T> {
        self.check_compatible(x)?;
        let partial = self.fold_interior(T::zero(), |acc, offset| {
            acc + self.data[offset].conjugate() * x.data[offset]
        });
        let mut parts = partial.into_components();
        self.cart.comm().allreduce_sum(&mut parts)?;
        Ok(T::from_components(parts))
    }

    pub fn norm(&self) -> Result<T::RealField> {
        let squared = self.dot(self)?;
        Ok(squared.real().sqrt())
    }

    /// Synchronize the ghost regions with the neighboring processes.
    ///
    /// What runs depends on the strongest [`GhostState`] across the
    /// communicator, agreed on by a small reduction first: if any rank's
    /// pads hold pending scatter contributions, the pass ships every ghost
    /// slab to its owner and adds it into the owner's interior, then
    /// refreshes all halos with the now-canonical owner values; after plain
    /// interior writes only the refresh runs; a globally in-sync vector
    /// makes the call a no-op. This is a collective operation: every rank
    /// must call it the same number of times in the same relative order.
    pub fn update_ghost_regions(&mut self) -> Result<()> {
        let additive = match collective_ghost_state(self.cart.comm().as_ref(), self.ghost_state)? {
            GhostState::InSync => return Ok(()),
            GhostState::Stale => false,
            GhostState::Pending => true,
        };
        synchronize(&self.cart, &self.layout, &mut self.data, additive, &mut self.scratch)?;
        self.ghost_state = GhostState::InSync;
        Ok(())
    }

    /// Owned interior entries in row-major order.
    pub fn interior_to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.layout.interior.iter().product());
        self.fold_interior((), |(), offset| out.push(self.data[offset]));
        out
    }

    /// The raw local buffer, including ghost entries.
    pub fn buffer(&self) -> &[T] {
        &self.data
    }

    /// Mutable access to the raw local buffer. The ghost state is
    /// conservatively downgraded to `Pending`, since arbitrary writes may
    /// have touched the pads.
    pub fn buffer_mut(&mut self) -> &mut [T] {
        self.ghost_state = GhostState::Pending;
        &mut self.data
    }

    pub(crate) fn layout(&self) -> &HaloLayout<D> {
        &self.layout
    }

    pub(crate) fn data(&self) -> &[T] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub(crate) fn set_ghost_state(&mut self, state: GhostState) {
        self.ghost_state = state;
    }

    fn check_compatible(&self, x: &Self) -> Result<()> {
        if self.cart.is_compatible_with(&x.cart) {
            Ok(())
        } else {
            Err(Error::shape_mismatch(format!(
                "vectors live on different decompositions: {:?} vs {:?}",
                self.cart, x.cart
            )))
        }
    }

    /// Fold over the scalar offsets of the owned interior, row by row.
    fn fold_interior<A>(&self, init: A, mut f: impl FnMut(A, usize) -> A) -> A {
        let mut acc = Some(init);
        let row = self.layout.interior[D - 1];
        let mut outer = self.layout.interior;
        outer[D - 1] = 1;
        crate::util::for_each_multi_index(outer, |rel| {
            let mut pos = self.layout.pads;
            for axis in 0..D {
                pos[axis] += rel[axis];
            }
            let offset = self.layout.offset(pos);
            let mut a = acc.take().unwrap();
            for i in 0..row {
                a = f(a, offset + i);
            }
            acc = Some(a);
        });
        acc.unwrap()
    }
}

impl<'a, T: StencilScalar, const D: usize> AddAssign<&'a StencilVector<T, D>>
    for StencilVector<T, D>
{
    fn add_assign(&mut self, rhs: &'a StencilVector<T, D>) {
        self.axpy(T::one(), rhs)
            .expect("addition requires vectors over the same decomposition");
    }
}

impl<'a, T: StencilScalar, const D: usize> SubAssign<&'a StencilVector<T, D>>
    for StencilVector<T, D>
{
    fn sub_assign(&mut self, rhs: &'a StencilVector<T, D>) {
        self.axpy(-T::one(), rhs)
            .expect("subtraction requires vectors over the same decomposition");
    }
}

impl<T: StencilScalar, const D: usize> MulAssign<T> for StencilVector<T, D> {
    fn mul_assign(&mut self, alpha: T) {
        self.scale(alpha);
    }
}
