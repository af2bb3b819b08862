use std::sync::Arc;

use tessella::cart::{CartBuilder, CartDecomposition};
use tessella::comm::{ChannelComm, Communicator};

mod block;
mod cart;
mod vector;

/// Run `f` once per rank of an in-process channel group, each rank on its
/// own thread, and collect the results in rank order. The thread group
/// plays the role of the process group of a parallel run.
pub fn on_ranks<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(Arc<dyn Communicator>) -> R + Sync,
{
    let comms = ChannelComm::group(size);
    std::thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| scope.spawn(move || f(Arc::new(comm))))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    })
}

pub fn build_cart<const D: usize>(
    comm: Arc<dyn Communicator>,
    shape: [usize; D],
    pads: [usize; D],
    periods: [bool; D],
) -> Arc<CartDecomposition<D>> {
    Arc::new(
        CartBuilder::new(&shape)
            .pads(&pads)
            .periodic(&periods)
            .build(comm)
            .unwrap(),
    )
}
