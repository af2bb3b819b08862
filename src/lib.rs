//! Distributed stencil linear algebra for tensor-product spline
//! discretizations.
//!
//! The crate turns a Cartesian decomposition of a D-dimensional
//! tensor-product index space into distributed linear-algebra objects:
//! coefficient vectors with pad-wide ghost regions, banded stencil
//! operators storing only within-bandwidth diagonals, and block containers
//! for multi-field problems. Assembly scatters per-cell contributions from
//! an external quadrature layer into the interior and ghost regions, and a
//! per-axis exchange protocol reconciles overlapping ghost contributions
//! into canonical owner values while refreshing halos for stencil
//! products.
//!
//! All cross-process coordination goes through the [`comm::Communicator`]
//! handle threaded through every constructor; a single-process loopback
//! communicator makes the whole crate usable (and testable) without any
//! parallel runtime.

use bytemuck::Pod;
use nalgebra::{ComplexField, Scalar};
use num_complex::Complex;

pub mod assembly;
pub mod bc;
pub mod block;
pub mod cart;
pub mod error;
pub mod exchange;
pub mod matrix;
pub mod ops;
pub mod vector;

pub(crate) mod util;

pub mod comm {
    pub use tessella_comm::*;
}

pub use crate::block::{BlockMatrix, BlockVector};
pub use crate::cart::{compute_process_grid, CartBuilder, CartDecomposition, Side};
pub use crate::error::{Error, Result};
pub use crate::exchange::GhostState;
pub use crate::matrix::StencilMatrix;
pub use crate::vector::StencilVector;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

/// Scalar types a stencil object can hold.
///
/// Bundles the numeric capabilities the containers need (a complex field,
/// so real and complex coefficients share one code path) with the plain-
/// old-data requirement of the exchange protocol, plus the conversion to
/// and from `f64` components used by the all-reduce in `dot` and `norm`.
pub trait StencilScalar: Scalar + ComplexField + Pod + Send + Sync {
    fn into_components(self) -> [f64; 2];

    fn from_components(components: [f64; 2]) -> Self;
}

impl StencilScalar for f64 {
    fn into_components(self) -> [f64; 2] {
        [self, 0.0]
    }

    fn from_components(components: [f64; 2]) -> Self {
        components[0]
    }
}

impl StencilScalar for f32 {
    fn into_components(self) -> [f64; 2] {
        [self as f64, 0.0]
    }

    fn from_components(components: [f64; 2]) -> Self {
        components[0] as f32
    }
}

impl StencilScalar for Complex<f64> {
    fn into_components(self) -> [f64; 2] {
        [self.re, self.im]
    }

    fn from_components(components: [f64; 2]) -> Self {
        Complex::new(components[0], components[1])
    }
}

impl StencilScalar for Complex<f32> {
    fn into_components(self) -> [f64; 2] {
        [self.re as f64, self.im as f64]
    }

    fn from_components(components: [f64; 2]) -> Self {
        Complex::new(components[0] as f32, components[1] as f32)
    }
}
