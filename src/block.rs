//! Composite containers for multi-field and vector-valued problems.
//!
//! Block objects aggregate stencil vectors/matrices into one algebraic
//! object and implement the same operation contracts by per-block
//! delegation; nothing here touches buffers or the exchange protocol
//! directly.

use nalgebra::{ComplexField, RealField};
use num::Zero;

use crate::error::{Error, Result};
use crate::matrix::StencilMatrix;
use crate::vector::StencilVector;
use crate::StencilScalar;

/// An ordered sequence of stencil vectors, one per field.
#[derive(Debug, Clone)]
pub struct BlockVector<T, const D: usize> {
    blocks: Vec<StencilVector<T, D>>,
}

impl<T: StencilScalar, const D: usize> BlockVector<T, D> {
    pub fn from_blocks(blocks: Vec<StencilVector<T, D>>) -> Result<Self> {
        if blocks.is_empty() {
            return Err(Error::configuration(
                "a block vector must have at least one block",
            ));
        }
        Ok(Self { blocks })
    }

    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, index: usize) -> &StencilVector<T, D> {
        &self.blocks[index]
    }

    pub fn block_mut(&mut self, index: usize) -> &mut StencilVector<T, D> {
        &mut self.blocks[index]
    }

    pub fn blocks(&self) -> &[StencilVector<T, D>] {
        &self.blocks
    }

    fn check_structure(&self, x: &Self) -> Result<()> {
        if self.blocks.len() != x.blocks.len() {
            return Err(Error::shape_mismatch(format!(
                "block vectors have {} and {} blocks",
                self.blocks.len(),
                x.blocks.len()
            )));
        }
        Ok(())
    }

    pub fn axpy(&mut self, alpha: T, x: &Self) -> Result<()> {
        self.check_structure(x)?;
        for (mine, theirs) in self.blocks.iter_mut().zip(&x.blocks) {
            mine.axpy(alpha, theirs)?;
        }
        Ok(())
    }

    pub fn copy_from(&mut self, x: &Self) -> Result<()> {
        self.check_structure(x)?;
        for (mine, theirs) in self.blocks.iter_mut().zip(&x.blocks) {
            mine.copy_from(theirs)?;
        }
        Ok(())
    }

    pub fn zero_out(&mut self) {
        for block in &mut self.blocks {
            block.zero_out();
        }
    }

    pub fn conjugate(&mut self) {
        for block in &mut self.blocks {
            block.conjugate();
        }
    }

    pub fn scale(&mut self, alpha: T) {
        for block in &mut self.blocks {
            block.scale(alpha);
        }
    }

    /// Inner product: the sum of the per-block inner products.
    pub fn dot(&self, x: &Self) -> Result<T> {
        self.check_structure(x)?;
        let mut total = T::zero();
        for (mine, theirs) in self.blocks.iter().zip(&x.blocks) {
            total += mine.dot(theirs)?;
        }
        Ok(total)
    }

    pub fn norm(&self) -> Result<T::RealField> {
        let squared = self.dot(self)?;
        Ok(squared.real().sqrt())
    }

    pub fn update_ghost_regions(&mut self) -> Result<()> {
        for block in &mut self.blocks {
            block.update_ghost_regions()?;
        }
        Ok(())
    }
}

/// A block-row × block-column grid of stencil matrices; absent blocks act
/// as zero operators.
///
/// Every block in a block-row shares its codomain decomposition and every
/// block in a block-column shares its domain decomposition; both are
/// enforced at insertion.
#[derive(Debug, Clone)]
pub struct BlockMatrix<T, const D: usize> {
    nrows: usize,
    ncols: usize,
    blocks: Vec<Option<StencilMatrix<T, D>>>,
}

impl<T: StencilScalar, const D: usize> BlockMatrix<T, D> {
    pub fn new(nrows: usize, ncols: usize) -> Result<Self> {
        if nrows == 0 || ncols == 0 {
            return Err(Error::configuration(
                "a block matrix must have at least one block row and column",
            ));
        }
        Ok(Self {
            nrows,
            ncols,
            blocks: (0..nrows * ncols).map(|_| None).collect(),
        })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn block(&self, row: usize, col: usize) -> Option<&StencilMatrix<T, D>> {
        self.blocks[self.flat(row, col)].as_ref()
    }

    pub fn block_mut(&mut self, row: usize, col: usize) -> Option<&mut StencilMatrix<T, D>> {
        let index = self.flat(row, col);
        self.blocks[index].as_mut()
    }

    pub fn set_block(
        &mut self,
        row: usize,
        col: usize,
        block: StencilMatrix<T, D>,
    ) -> Result<()> {
        if row >= self.nrows || col >= self.ncols {
            return Err(Error::shape_mismatch(format!(
                "block position ({row}, {col}) outside a {}x{} block matrix",
                self.nrows, self.ncols
            )));
        }
        // Codomain agreement along the block row.
        for other_col in 0..self.ncols {
            if let Some(other) = self.block(row, other_col) {
                if !other.codomain().is_compatible_with(block.codomain()) {
                    return Err(Error::shape_mismatch(format!(
                        "block ({row}, {col}) disagrees with block ({row}, {other_col}) on the codomain"
                    )));
                }
            }
        }
        // Domain agreement down the block column.
        for other_row in 0..self.nrows {
            if let Some(other) = self.block(other_row, col) {
                if !other.domain().is_compatible_with(block.domain()) {
                    return Err(Error::shape_mismatch(format!(
                        "block ({row}, {col}) disagrees with block ({other_row}, {col}) on the domain"
                    )));
                }
            }
        }
        let index = self.flat(row, col);
        self.blocks[index] = Some(block);
        Ok(())
    }

    fn flat(&self, row: usize, col: usize) -> usize {
        row * self.ncols + col
    }

    /// Block matrix-vector product: `y_i = Σ_j A_ij · x_j`.
    ///
    /// Every block row must contain at least one block (the codomain of an
    /// all-zero row would be undefined), and the input vector's halos must
    /// be current, as for [`StencilMatrix::dot`].
    pub fn dot(&self, x: &BlockVector<T, D>) -> Result<BlockVector<T, D>> {
        if x.n_blocks() != self.ncols {
            return Err(Error::shape_mismatch(format!(
                "block vector has {} blocks but the block matrix has {} block columns",
                x.n_blocks(),
                self.ncols
            )));
        }
        let mut out = Vec::with_capacity(self.nrows);
        for row in 0..self.nrows {
            let first = (0..self.ncols)
                .find_map(|col| self.block(row, col))
                .ok_or_else(|| {
                    Error::shape_mismatch(format!("block row {row} has no blocks"))
                })?;
            let mut y = StencilVector::new(std::sync::Arc::clone(first.codomain()));
            for col in 0..self.ncols {
                if let Some(block) = self.block(row, col) {
                    block.dot_into(x.block(col), &mut y, true)?;
                }
            }
            out.push(y);
        }
        BlockVector::from_blocks(out)
    }

    pub fn update_ghost_regions(&mut self) -> Result<()> {
        for block in self.blocks.iter_mut().flatten() {
            block.update_ghost_regions()?;
        }
        Ok(())
    }
}
