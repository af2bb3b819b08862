//! Error taxonomy for the stencil core.
//!
//! Configuration errors are reported before any computation starts. Index
//! and shape-mismatch errors are always programming errors in the caller
//! and are never retried. Communication errors are fatal: a partially
//! completed exchange leaves distributed state undefined, so no operation
//! returns a degraded result.

use thiserror::Error;

use tessella_comm::CommError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested decomposition cannot satisfy the process-grid and
    /// shape constraints.
    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    /// Access outside a buffer's valid range, including bandwidth
    /// violations on stencil matrices.
    #[error("index {index} out of range on axis {axis} (valid range {low}..{high})")]
    Index {
        axis: usize,
        index: i64,
        low: i64,
        high: i64,
    },

    /// Operation between stencil or block objects with incompatible
    /// decompositions or block structures.
    #[error("shape mismatch: {reason}")]
    ShapeMismatch { reason: String },

    /// Transport failure. The state of the exchange is undefined; the
    /// process must abort rather than continue with possibly divergent
    /// distributed data.
    #[error("communication failure")]
    Comm(#[from] CommError),
}

impl Error {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape_mismatch(reason: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            reason: reason.into(),
        }
    }
}
