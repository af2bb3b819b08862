//! Essential (Dirichlet) boundary conditions on stencil objects.
//!
//! The treatment is the usual row form: on the boundary plane of an axis
//! the matrix row is zeroed and its diagonal set to one, and the right-hand
//! side entry is zeroed, so the constrained degree of freedom solves to
//! zero exactly. Pad copies of a boundary plane are zeroed as well, keeping
//! every rank's view of the plane consistent without another exchange.

use num::{One, Zero};

use crate::cart::Side;
use crate::error::{Error, Result};
use crate::matrix::StencilMatrix;
use crate::util::for_each_multi_index;
use crate::vector::StencilVector;
use crate::StencilScalar;

fn boundary_plane<const D: usize>(
    shape: [usize; D],
    periods: [bool; D],
    axis: usize,
    side: Side,
) -> Result<i64> {
    if axis >= D {
        return Err(Error::Index {
            axis,
            index: axis as i64,
            low: 0,
            high: D as i64,
        });
    }
    if periods[axis] {
        return Err(Error::configuration(format!(
            "axis {axis} is periodic and has no boundary"
        )));
    }
    Ok(match side {
        Side::Minus => 0,
        Side::Plus => shape[axis] as i64 - 1,
    })
}

/// Apply a homogeneous essential condition to the rows of `matrix` on the
/// given boundary plane: zero the row couplings and set the diagonal to
/// one. Should run after assembly and ghost reconciliation.
pub fn apply_essential_bc_matrix<T: StencilScalar, const D: usize>(
    matrix: &mut StencilMatrix<T, D>,
    axis: usize,
    side: Side,
) -> Result<()> {
    let plane = boundary_plane(
        matrix.codomain().global_shape(),
        matrix.codomain().periods(),
        axis,
        side,
    )?;
    let cart = std::sync::Arc::clone(matrix.codomain());
    let pads = cart.pads();
    let local_shape = cart.local_shape();
    let start = cart.starts()[axis] as i64;
    let bandwidth = matrix.bandwidth();
    // The plane is written identically on its owner and on every rank that
    // holds a pad copy, so the matrix stays globally consistent and the
    // ghost state must not degrade to pending.
    let state = matrix.ghost_state();

    // The plane row in local coordinates, if this process sees it at all
    // (as an owned row or a pad copy).
    let local_plane = plane - start;
    let low = -(pads[axis] as i64);
    let high = local_shape[axis] as i64 + pads[axis] as i64;
    if local_plane < low || local_plane >= high {
        return Ok(());
    }

    let mut extents = [0usize; D];
    for a in 0..D {
        extents[a] = local_shape[a] + 2 * pads[a];
    }
    extents[axis] = 1;

    let diag_dims: [usize; D] = std::array::from_fn(|a| 2 * bandwidth[a] + 1);
    for_each_multi_index(extents, |pos| {
        let mut row = [0i64; D];
        for a in 0..D {
            row[a] = if a == axis {
                local_plane
            } else {
                pos[a] as i64 - pads[a] as i64
            };
        }
        for_each_multi_index(diag_dims, |k| {
            let offset: [i64; D] =
                std::array::from_fn(|a| k[a] as i64 - bandwidth[a] as i64);
            let value = if offset.iter().all(|&o| o == 0) {
                T::one()
            } else {
                T::zero()
            };
            matrix
                .set(&row, &offset, value)
                .expect("plane row within the padded row range");
        });
    });
    matrix.set_ghost_state(state);
    Ok(())
}

/// Zero the entries of `vector` on the given boundary plane, including pad
/// copies.
pub fn apply_essential_bc_vector<T: StencilScalar, const D: usize>(
    vector: &mut StencilVector<T, D>,
    axis: usize,
    side: Side,
) -> Result<()> {
    let plane = boundary_plane(
        vector.cart().global_shape(),
        vector.cart().periods(),
        axis,
        side,
    )?;
    let cart = std::sync::Arc::clone(vector.cart());
    let pads = cart.pads();
    let local_shape = cart.local_shape();
    let start = cart.starts()[axis] as i64;
    let state = vector.ghost_state();

    let local_plane = plane - start;
    let low = -(pads[axis] as i64);
    let high = local_shape[axis] as i64 + pads[axis] as i64;
    if local_plane < low || local_plane >= high {
        return Ok(());
    }

    let mut extents = [0usize; D];
    for a in 0..D {
        extents[a] = local_shape[a] + 2 * pads[a];
    }
    extents[axis] = 1;

    for_each_multi_index(extents, |pos| {
        let mut index = [0i64; D];
        for a in 0..D {
            index[a] = if a == axis {
                local_plane
            } else {
                pos[a] as i64 - pads[a] as i64
            };
        }
        vector
            .set(&index, T::zero())
            .expect("plane entry within the padded range");
    });
    vector.set_ghost_state(state);
    Ok(())
}
