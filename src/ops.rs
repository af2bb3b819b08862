//! Operation contracts consumed by solvers and exporters.
//!
//! Single-field and block objects implement the same capability surface;
//! the block implementations delegate per-block by composition. External
//! solver crates should program against these traits rather than the
//! concrete containers.

use num::One;

use crate::block::{BlockMatrix, BlockVector};
use crate::error::Result;
use crate::matrix::StencilMatrix;
use crate::vector::StencilVector;
use crate::StencilScalar;

/// An element of a distributed vector space.
pub trait VectorSpaceElement<T: StencilScalar> {
    fn zero_out(&mut self);

    fn scale(&mut self, alpha: T);

    fn conjugate(&mut self);

    fn axpy(&mut self, alpha: T, x: &Self) -> Result<()>;

    fn copy_from(&mut self, x: &Self) -> Result<()>;

    fn dot(&self, x: &Self) -> Result<T>;

    fn norm(&self) -> Result<T::RealField>;

    fn update_ghost_regions(&mut self) -> Result<()>;
}

/// A linear operator between two distributed vector spaces.
///
/// `apply` requires the input's ghost regions to be current; see
/// [`StencilMatrix::dot`].
pub trait LinearOperator<T: StencilScalar> {
    type Domain;
    type Codomain;

    fn apply(&self, x: &Self::Domain) -> Result<Self::Codomain>;

    fn apply_into(
        &self,
        x: &Self::Domain,
        y: &mut Self::Codomain,
        accumulate: bool,
    ) -> Result<()>;

    fn update_ghost_regions(&mut self) -> Result<()>;
}

impl<T: StencilScalar, const D: usize> VectorSpaceElement<T> for StencilVector<T, D> {
    fn zero_out(&mut self) {
        StencilVector::zero_out(self);
    }

    fn scale(&mut self, alpha: T) {
        StencilVector::scale(self, alpha);
    }

    fn conjugate(&mut self) {
        StencilVector::conjugate(self);
    }

    fn axpy(&mut self, alpha: T, x: &Self) -> Result<()> {
        StencilVector::axpy(self, alpha, x)
    }

    fn copy_from(&mut self, x: &Self) -> Result<()> {
        StencilVector::copy_from(self, x)
    }

    fn dot(&self, x: &Self) -> Result<T> {
        StencilVector::dot(self, x)
    }

    fn norm(&self) -> Result<T::RealField> {
        StencilVector::norm(self)
    }

    fn update_ghost_regions(&mut self) -> Result<()> {
        StencilVector::update_ghost_regions(self)
    }
}

impl<T: StencilScalar, const D: usize> VectorSpaceElement<T> for BlockVector<T, D> {
    fn zero_out(&mut self) {
        BlockVector::zero_out(self);
    }

    fn scale(&mut self, alpha: T) {
        BlockVector::scale(self, alpha);
    }

    fn conjugate(&mut self) {
        BlockVector::conjugate(self);
    }

    fn axpy(&mut self, alpha: T, x: &Self) -> Result<()> {
        BlockVector::axpy(self, alpha, x)
    }

    fn copy_from(&mut self, x: &Self) -> Result<()> {
        BlockVector::copy_from(self, x)
    }

    fn dot(&self, x: &Self) -> Result<T> {
        BlockVector::dot(self, x)
    }

    fn norm(&self) -> Result<T::RealField> {
        BlockVector::norm(self)
    }

    fn update_ghost_regions(&mut self) -> Result<()> {
        BlockVector::update_ghost_regions(self)
    }
}

impl<T: StencilScalar, const D: usize> LinearOperator<T> for StencilMatrix<T, D> {
    type Domain = StencilVector<T, D>;
    type Codomain = StencilVector<T, D>;

    fn apply(&self, x: &Self::Domain) -> Result<Self::Codomain> {
        self.dot(x)
    }

    fn apply_into(
        &self,
        x: &Self::Domain,
        y: &mut Self::Codomain,
        accumulate: bool,
    ) -> Result<()> {
        self.dot_into(x, y, accumulate)
    }

    fn update_ghost_regions(&mut self) -> Result<()> {
        StencilMatrix::update_ghost_regions(self)
    }
}

impl<T: StencilScalar, const D: usize> LinearOperator<T> for BlockMatrix<T, D> {
    type Domain = BlockVector<T, D>;
    type Codomain = BlockVector<T, D>;

    fn apply(&self, x: &Self::Domain) -> Result<Self::Codomain> {
        self.dot(x)
    }

    fn apply_into(
        &self,
        x: &Self::Domain,
        y: &mut Self::Codomain,
        accumulate: bool,
    ) -> Result<()> {
        let product = self.dot(x)?;
        if accumulate {
            y.axpy(T::one(), &product)
        } else {
            y.copy_from(&product)
        }
    }

    fn update_ghost_regions(&mut self) -> Result<()> {
        BlockMatrix::update_ghost_regions(self)
    }
}
