//! Rank-addressed message passing for distributed stencil objects.
//!
//! The core linear-algebra crate depends only on the minimal capability set
//! expressed by [`Communicator`]: point-to-point sends and receives with
//! rank addressing, and a blocking all-reduce sum. Two implementations are
//! provided: [`SelfComm`], a single-process loopback (send-to-self must work
//! so that periodic axes wrap correctly on one process), and
//! [`ChannelComm`], a fully connected in-process group backed by crossbeam
//! channels, which doubles as the multi-rank transport for tests and
//! shared-memory runs. An MPI-backed implementation can be supplied by
//! downstream crates without touching the core.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytemuck::cast_slice;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

/// Communication failure. Always fatal: a partial collective cannot be
/// replayed without risking divergent state across ranks, so callers must
/// not retry.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {rank} out of range for communicator of size {size}")]
    InvalidRank { rank: usize, size: usize },
    #[error("peer {peer} disconnected")]
    Disconnected { peer: usize },
    #[error("message truncated: expected {expected} bytes, received {got}")]
    Truncated { expected: usize, got: usize },
    #[error("no matching message from rank {from} with tag {tag}")]
    NoMessage { from: usize, tag: u16 },
}

/// A posted receive. Dropping a request without awaiting it leaves the
/// message undelivered in the transport.
pub struct RecvRequest(Box<dyn Wait>);

impl RecvRequest {
    /// Block until the matching message arrives and return its payload.
    pub fn wait(self) -> Result<Vec<u8>, CommError> {
        self.0.wait()
    }
}

trait Wait: Send {
    fn wait(self: Box<Self>) -> Result<Vec<u8>, CommError>;
}

/// The transport capability set required by the stencil core.
///
/// `isend` posts a send and returns once the payload has been handed to the
/// transport (the buffer may be reused immediately). `irecv` posts a receive
/// that is awaited later through [`RecvRequest::wait`]; posting every
/// send and receive of an exchange before awaiting any of them is what lets
/// the ghost protocol overlap messages without deadlocking on blocking
/// order. Messages between a fixed (source, destination) pair are matched
/// by tag, in FIFO order per tag.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn isend(&self, to: usize, tag: u16, bytes: &[u8]) -> Result<(), CommError>;

    fn irecv(&self, from: usize, tag: u16, len: usize) -> Result<RecvRequest, CommError>;

    /// Blocking collective elementwise sum over all ranks. Every rank must
    /// call with a buffer of the same length; on return each rank holds the
    /// summed values. The summation order is rank order, so the result is
    /// reproducible for a fixed group size.
    fn allreduce_sum(&self, values: &mut [f64]) -> Result<(), CommError>;
}

// Tags at the top of the range are reserved for the collectives built on
// top of the point-to-point layer.
const REDUCE_TAG: u16 = u16::MAX;
const BCAST_TAG: u16 = u16::MAX - 1;

struct Message {
    tag: u16,
    payload: Vec<u8>,
}

/// Single-process loopback communicator.
pub struct SelfComm {
    queue: Arc<Mutex<VecDeque<Message>>>,
}

impl SelfComm {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl Default for SelfComm {
    fn default() -> Self {
        Self::new()
    }
}

struct SelfRecv {
    queue: Arc<Mutex<VecDeque<Message>>>,
    tag: u16,
    expected: usize,
}

impl Wait for SelfRecv {
    fn wait(self: Box<Self>) -> Result<Vec<u8>, CommError> {
        let mut queue = self.queue.lock().unwrap();
        let index = queue.iter().position(|m| m.tag == self.tag);
        // On a single rank every send precedes its matching wait, so a
        // missing message is a protocol violation rather than a stall.
        let message = match index {
            Some(index) => queue.remove(index).unwrap(),
            None => {
                return Err(CommError::NoMessage {
                    from: 0,
                    tag: self.tag,
                })
            }
        };
        if message.payload.len() != self.expected {
            return Err(CommError::Truncated {
                expected: self.expected,
                got: message.payload.len(),
            });
        }
        Ok(message.payload)
    }
}

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn isend(&self, to: usize, tag: u16, bytes: &[u8]) -> Result<(), CommError> {
        if to != 0 {
            return Err(CommError::InvalidRank { rank: to, size: 1 });
        }
        self.queue.lock().unwrap().push_back(Message {
            tag,
            payload: bytes.to_vec(),
        });
        Ok(())
    }

    fn irecv(&self, from: usize, tag: u16, len: usize) -> Result<RecvRequest, CommError> {
        if from != 0 {
            return Err(CommError::InvalidRank { rank: from, size: 1 });
        }
        Ok(RecvRequest(Box::new(SelfRecv {
            queue: Arc::clone(&self.queue),
            tag,
            expected: len,
        })))
    }

    fn allreduce_sum(&self, _values: &mut [f64]) -> Result<(), CommError> {
        Ok(())
    }
}

/// One endpoint of a fully connected in-process group.
///
/// Endpoints are created together through [`ChannelComm::group`] and moved
/// onto their own threads; each thread then behaves exactly like a process
/// rank. Channels are unbounded, so a send never blocks and send-to-self is
/// well defined.
pub struct ChannelComm {
    rank: usize,
    size: usize,
    senders: Vec<Sender<Message>>,
    sources: Vec<Arc<SourceChannel>>,
}

struct SourceChannel {
    rx: Receiver<Message>,
    // Messages pulled off the channel while looking for a different tag.
    stash: Mutex<Vec<Message>>,
}

impl ChannelComm {
    /// Build a group of `size` fully connected endpoints, one per rank.
    pub fn group(size: usize) -> Vec<ChannelComm> {
        assert!(size > 0, "communicator group must have at least one rank");
        let mut txs: Vec<Vec<Option<Sender<Message>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();
        let mut rxs: Vec<Vec<Option<Arc<SourceChannel>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();
        for src in 0..size {
            for dst in 0..size {
                let (tx, rx) = unbounded();
                txs[src][dst] = Some(tx);
                rxs[dst][src] = Some(Arc::new(SourceChannel {
                    rx,
                    stash: Mutex::new(Vec::new()),
                }));
            }
        }
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (senders, sources))| ChannelComm {
                rank,
                size,
                senders: senders.into_iter().map(Option::unwrap).collect(),
                sources: sources.into_iter().map(Option::unwrap).collect(),
            })
            .collect()
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.size {
            Err(CommError::InvalidRank {
                rank,
                size: self.size,
            })
        } else {
            Ok(())
        }
    }
}

struct ChannelRecv {
    source: Arc<SourceChannel>,
    from: usize,
    tag: u16,
    expected: usize,
}

impl Wait for ChannelRecv {
    fn wait(self: Box<Self>) -> Result<Vec<u8>, CommError> {
        loop {
            {
                let mut stash = self.source.stash.lock().unwrap();
                if let Some(index) = stash.iter().position(|m| m.tag == self.tag) {
                    let message = stash.remove(index);
                    return check_len(message.payload, self.expected);
                }
            }
            match self.source.rx.recv_timeout(Duration::from_millis(10)) {
                Ok(message) if message.tag == self.tag => {
                    return check_len(message.payload, self.expected);
                }
                Ok(message) => self.source.stash.lock().unwrap().push(message),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Disconnected { peer: self.from });
                }
            }
        }
    }
}

fn check_len(payload: Vec<u8>, expected: usize) -> Result<Vec<u8>, CommError> {
    if payload.len() != expected {
        Err(CommError::Truncated {
            expected,
            got: payload.len(),
        })
    } else {
        Ok(payload)
    }
}

impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, to: usize, tag: u16, bytes: &[u8]) -> Result<(), CommError> {
        self.check_rank(to)?;
        self.senders[to]
            .send(Message {
                tag,
                payload: bytes.to_vec(),
            })
            .map_err(|_| CommError::Disconnected { peer: to })
    }

    fn irecv(&self, from: usize, tag: u16, len: usize) -> Result<RecvRequest, CommError> {
        self.check_rank(from)?;
        Ok(RecvRequest(Box::new(ChannelRecv {
            source: Arc::clone(&self.sources[from]),
            from,
            tag,
            expected: len,
        })))
    }

    fn allreduce_sum(&self, values: &mut [f64]) -> Result<(), CommError> {
        if self.size == 1 {
            return Ok(());
        }
        let byte_len = std::mem::size_of_val(values);
        if self.rank == 0 {
            // Reduce in rank order so the floating-point sum is reproducible
            // for a fixed group size.
            for peer in 1..self.size {
                let data = self.irecv(peer, REDUCE_TAG, byte_len)?.wait()?;
                let incoming: Vec<f64> = bytemuck::pod_collect_to_vec(&data);
                for (v, x) in values.iter_mut().zip(&incoming) {
                    *v += *x;
                }
            }
            for peer in 1..self.size {
                self.isend(peer, BCAST_TAG, cast_slice(values))?;
            }
        } else {
            self.isend(0, REDUCE_TAG, cast_slice(values))?;
            let data = self.irecv(0, BCAST_TAG, byte_len)?.wait()?;
            let incoming: Vec<f64> = bytemuck::pod_collect_to_vec(&data);
            values.copy_from_slice(&incoming);
        }
        Ok(())
    }
}
