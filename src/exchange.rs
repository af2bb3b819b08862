//! The ghost exchange protocol.
//!
//! Stencil vectors and matrices share one engine: a flat buffer described
//! by a [`HaloLayout`] (padded per-axis extents plus a contiguous
//! per-gridpoint item, of length 1 for vectors and of the diagonal-block
//! length for matrix rows) is synchronized axis by axis. Every axis runs up
//! to two phases:
//!
//! - *accumulate*: each side's ghost slab, which holds pending scatter
//!   contributions to the neighbor's interior, is shipped to that neighbor
//!   and added into the neighbor's interior border;
//! - *refresh*: each side's interior border, now canonical, is shipped to
//!   the neighbor and overwrites the neighbor's ghost slab.
//!
//! Within a phase all sends are posted before any receive is awaited, so
//! the blocking order of ranks cannot deadlock. Axes are processed
//! strictly in order and each phase completes before the next begins:
//! slabs span the full padded extent of the other axes, so corner and edge
//! contributions reconciled along axis 0 are carried into the axis 1
//! messages, which is what makes the additive semantics correct in two or
//! more dimensions.
//!
//! Periodic wraparound needs no special casing: on a periodic axis with a
//! single process both neighbors are the process itself, and send-to-self
//! routes the wrapped slabs through the same code path. A side with no
//! neighbor (non-periodic boundary) is skipped entirely and its ghost slab
//! is never written, so physical-boundary ghosts stay zero.

use bytemuck::{cast_slice, pod_collect_to_vec};

use tessella_comm::Communicator;

use crate::cart::{CartDecomposition, Side};
use crate::error::Result;
use crate::util::{flat_index, for_each_multi_index, strides_for};
use crate::StencilScalar;

/// Synchronization status of a stencil object's ghost regions.
///
/// The state decides what [`update_ghost_regions`] has to do: `Pending`
/// ghosts hold unreconciled scatter contributions and require the full
/// accumulate-then-refresh pass; `Stale` ghosts only need a refresh after
/// interior writes; `InSync` ghosts make the update a no-op, which is what
/// makes repeated calls idempotent.
///
/// The state is tracked locally, but what a synchronization actually runs
/// is decided collectively: a scatter may leave one rank `Pending` and its
/// neighbor merely `Stale` (all of its cells wrote interior entries), and
/// the two must still agree on the phases they exchange. The strongest
/// state across the communicator wins.
///
/// [`update_ghost_regions`]: crate::vector::StencilVector::update_ghost_regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GhostState {
    InSync,
    Stale,
    Pending,
}

/// Agree on the exchange mode across all ranks: the strongest local state
/// wins, so a rank whose writes stayed interior still joins the accumulate
/// phase its neighbors need. One small blocking reduction per call.
pub(crate) fn collective_ghost_state(
    comm: &dyn Communicator,
    local: GhostState,
) -> Result<GhostState> {
    let mut flags = [
        if local == GhostState::Pending { 1.0 } else { 0.0 },
        if local == GhostState::Stale { 1.0 } else { 0.0 },
    ];
    comm.allreduce_sum(&mut flags)?;
    Ok(if flags[0] > 0.0 {
        GhostState::Pending
    } else if flags[1] > 0.0 {
        GhostState::Stale
    } else {
        GhostState::InSync
    })
}

/// Geometry of a padded local buffer: extents, strides and the contiguous
/// item length per grid point.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HaloLayout<const D: usize> {
    pub dims: [usize; D],
    pub pads: [usize; D],
    pub interior: [usize; D],
    pub item: usize,
    pub strides: [usize; D],
    pub len: usize,
}

impl<const D: usize> HaloLayout<D> {
    pub fn new(cart: &CartDecomposition<D>, item: usize) -> Self {
        let dims = cart.buffer_shape();
        let strides = strides_for(dims, item);
        let len = dims.iter().product::<usize>() * item;
        Self {
            dims,
            pads: cart.pads(),
            interior: cart.local_shape(),
            item,
            strides,
            len,
        }
    }

    /// Scalar offset of the item at buffer position `pos`.
    pub fn offset(&self, pos: [usize; D]) -> usize {
        flat_index(pos, self.strides)
    }
}

/// A rectangular sub-box of the buffer, in buffer coordinates.
#[derive(Debug, Clone, Copy)]
struct Slab<const D: usize> {
    begin: [usize; D],
    extent: [usize; D],
}

/// The pad-wide ghost slab on the given side of an axis, spanning the full
/// padded extent of every other axis.
fn ghost_slab<const D: usize>(layout: &HaloLayout<D>, axis: usize, side: Side) -> Slab<D> {
    let mut begin = [0usize; D];
    let mut extent = layout.dims;
    extent[axis] = layout.pads[axis];
    if side == Side::Plus {
        begin[axis] = layout.pads[axis] + layout.interior[axis];
    }
    Slab { begin, extent }
}

/// The pad-wide slab of owned entries adjacent to the ghost region on the
/// given side.
fn border_slab<const D: usize>(layout: &HaloLayout<D>, axis: usize, side: Side) -> Slab<D> {
    let mut begin = [0usize; D];
    let mut extent = layout.dims;
    extent[axis] = layout.pads[axis];
    begin[axis] = match side {
        Side::Minus => layout.pads[axis],
        Side::Plus => layout.interior[axis],
    };
    Slab { begin, extent }
}

fn message_scalars<const D: usize>(layout: &HaloLayout<D>, axis: usize) -> usize {
    let mut scalars = layout.pads[axis] * layout.item;
    for other in 0..D {
        if other != axis {
            scalars *= layout.dims[other];
        }
    }
    scalars
}

/// Visit each contiguous row of a slab as `(scalar offset, scalar length)`.
fn for_each_slab_row<const D: usize>(
    layout: &HaloLayout<D>,
    slab: &Slab<D>,
    mut f: impl FnMut(usize, usize),
) {
    let row_len = slab.extent[D - 1] * layout.item;
    let mut outer = slab.extent;
    outer[D - 1] = 1;
    for_each_multi_index(outer, |rel| {
        let mut pos = slab.begin;
        for axis in 0..D {
            pos[axis] += rel[axis];
        }
        f(layout.offset(pos), row_len);
    });
}

fn pack<T: StencilScalar, const D: usize>(
    data: &[T],
    layout: &HaloLayout<D>,
    slab: &Slab<D>,
    out: &mut Vec<T>,
) {
    out.clear();
    for_each_slab_row(layout, slab, |offset, len| {
        out.extend_from_slice(&data[offset..offset + len]);
    });
}

fn unpack<T: StencilScalar, const D: usize>(
    data: &mut [T],
    layout: &HaloLayout<D>,
    slab: &Slab<D>,
    incoming: &[T],
    additive: bool,
) {
    let mut cursor = 0;
    for_each_slab_row(layout, slab, |offset, len| {
        let source = &incoming[cursor..cursor + len];
        let target = &mut data[offset..offset + len];
        if additive {
            for (t, s) in target.iter_mut().zip(source) {
                *t += *s;
            }
        } else {
            target.copy_from_slice(source);
        }
        cursor += len;
    });
    debug_assert_eq!(cursor, incoming.len());
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Accumulate,
    Refresh,
}

fn tag(axis: usize, phase: Phase, travel: Side) -> u16 {
    let phase = match phase {
        Phase::Accumulate => 0,
        Phase::Refresh => 1,
    };
    (axis * 4 + phase * 2 + travel.index()) as u16
}

/// Run one full synchronization pass over the buffer. With `additive` set
/// the accumulate phase runs before every refresh; otherwise only the halo
/// refresh is performed.
pub(crate) fn synchronize<T: StencilScalar, const D: usize>(
    cart: &CartDecomposition<D>,
    layout: &HaloLayout<D>,
    data: &mut [T],
    additive: bool,
    scratch: &mut Vec<T>,
) -> Result<()> {
    debug_assert_eq!(data.len(), layout.len);
    for axis in 0..D {
        if layout.pads[axis] == 0 {
            continue;
        }
        if additive {
            exchange_phase(cart, layout, data, axis, Phase::Accumulate, scratch)?;
        }
        exchange_phase(cart, layout, data, axis, Phase::Refresh, scratch)?;
    }
    Ok(())
}

fn exchange_phase<T: StencilScalar, const D: usize>(
    cart: &CartDecomposition<D>,
    layout: &HaloLayout<D>,
    data: &mut [T],
    axis: usize,
    phase: Phase,
    scratch: &mut Vec<T>,
) -> Result<()> {
    let comm = cart.comm();

    // Post every send of the phase before awaiting any receive. The
    // transport copies the payload at post time, so one scratch buffer can
    // serve both sides.
    for side in [Side::Minus, Side::Plus] {
        if let Some(neighbor) = cart.neighbor(axis, side) {
            let slab = match phase {
                Phase::Accumulate => ghost_slab(layout, axis, side),
                Phase::Refresh => border_slab(layout, axis, side),
            };
            pack(data, layout, &slab, scratch);
            comm.isend(neighbor, tag(axis, phase, side), cast_slice(scratch))?;
        }
    }

    let byte_len = message_scalars(layout, axis) * std::mem::size_of::<T>();
    let mut requests = Vec::with_capacity(2);
    for side in [Side::Minus, Side::Plus] {
        if let Some(neighbor) = cart.neighbor(axis, side) {
            // A message from the neighbor on `side` traveled in the
            // opposite direction.
            let request = comm.irecv(neighbor, tag(axis, phase, side.opposite()), byte_len)?;
            requests.push((side, request));
        }
    }

    for (side, request) in requests {
        let bytes = request.wait()?;
        let incoming: Vec<T> = pod_collect_to_vec(&bytes);
        match phase {
            // The neighbor's ghost slab holds contributions to my border.
            Phase::Accumulate => {
                unpack(data, layout, &border_slab(layout, axis, side), &incoming, true)
            }
            // The neighbor's border is canonical; it replaces my ghosts.
            Phase::Refresh => {
                unpack(data, layout, &ghost_slab(layout, axis, side), &incoming, false)
            }
        }
    }
    Ok(())
}
