//! Scatter of per-cell integration contributions into stencil objects.
//!
//! The quadrature/basis layer is an external collaborator: for each cell it
//! produces a dense local contribution array together with the global basis
//! multi-indices of the test and trial functions supported on the cell.
//! The assembler loops cells, invokes that kernel, and adds each entry at
//! the (row, diagonal-offset) position implied by the index pair.
//! Contributions are purely additive, so the assembled result does not
//! depend on cell traversal order; contributions that land in pad rows are
//! reconciled later by the target's `update_ghost_regions`.

use std::cell::RefCell;

use nalgebra::{DMatrix, DVector};
use num::Zero;

use crate::matrix::StencilMatrix;
use crate::vector::StencilVector;
use crate::StencilScalar;

/// Connectivity of the cells this process integrates: which global basis
/// functions have support on each cell.
///
/// Indices are given in the unwrapped frame of the cell: at a periodic seam
/// the trial indices keep increasing past the global extent rather than
/// wrapping, so that the offset `trial - test` stays within the bandwidth.
pub trait CellConnectivity<const D: usize> {
    fn num_cells(&self) -> usize;

    fn cell_test_count(&self, cell: usize) -> usize;

    fn cell_trial_count(&self, cell: usize) -> usize;

    fn populate_cell_test_indices(&self, indices: &mut Vec<[i64; D]>, cell: usize);

    fn populate_cell_trial_indices(&self, indices: &mut Vec<[i64; D]>, cell: usize);
}

/// Per-cell kernel for bilinear forms: fills the dense test × trial
/// contribution matrix of one cell.
pub trait CellMatrixAssembler<T: StencilScalar, const D: usize>: CellConnectivity<D> {
    fn assemble_cell_matrix_into(&self, cell: usize, output: &mut DMatrix<T>) -> eyre::Result<()>;
}

/// Per-cell kernel for linear forms: fills the dense test contribution
/// vector of one cell.
pub trait CellVectorAssembler<T: StencilScalar, const D: usize>: CellConnectivity<D> {
    fn assemble_cell_vector_into(&self, cell: usize, output: &mut DVector<T>) -> eyre::Result<()>;
}

/// An assembler for stencil matrices and vectors.
#[derive(Debug)]
pub struct StencilAssembler<T: nalgebra::Scalar, const D: usize> {
    // Buffers that prevent per-cell allocations when assembling multiple
    // operators with the same assembler.
    workspace: RefCell<AssemblerWorkspace<T, D>>,
}

#[derive(Debug)]
struct AssemblerWorkspace<T: nalgebra::Scalar, const D: usize> {
    test_indices: Vec<[i64; D]>,
    trial_indices: Vec<[i64; D]>,
    cell_matrix: DMatrix<T>,
    cell_vector: DVector<T>,
}

impl<T: nalgebra::Scalar, const D: usize> Default for StencilAssembler<T, D> {
    fn default() -> Self {
        Self {
            workspace: RefCell::new(AssemblerWorkspace {
                test_indices: Vec::new(),
                trial_indices: Vec::new(),
                cell_matrix: DMatrix::from_row_slice(0, 0, &[]),
                cell_vector: DVector::from_column_slice(&[]),
            }),
        }
    }
}

impl<T: StencilScalar, const D: usize> StencilAssembler<T, D> {
    /// Assemble a bilinear form into `matrix`, adding on top of whatever it
    /// already holds.
    ///
    /// Every test index must fall within this process's padded row range;
    /// a cell whose rows do not is a foreign cell and an error in the
    /// caller's cell distribution.
    pub fn assemble_into_matrix(
        &self,
        matrix: &mut StencilMatrix<T, D>,
        assembler: &dyn CellMatrixAssembler<T, D>,
    ) -> eyre::Result<()> {
        let ws = &mut *self.workspace.borrow_mut();
        let starts = matrix.codomain().starts();
        for cell in 0..assembler.num_cells() {
            let n_test = assembler.cell_test_count(cell);
            let n_trial = assembler.cell_trial_count(cell);
            ws.cell_matrix.resize_mut(n_test, n_trial, T::zero());
            ws.cell_matrix.fill(T::zero());
            assembler.assemble_cell_matrix_into(cell, &mut ws.cell_matrix)?;
            assembler.populate_cell_test_indices(&mut ws.test_indices, cell);
            assembler.populate_cell_trial_indices(&mut ws.trial_indices, cell);

            for (a, test) in ws.test_indices.iter().enumerate() {
                let row: [i64; D] = std::array::from_fn(|axis| test[axis] - starts[axis] as i64);
                for (b, trial) in ws.trial_indices.iter().enumerate() {
                    let offset: [i64; D] =
                        std::array::from_fn(|axis| trial[axis] - test[axis]);
                    matrix.add(&row, &offset, ws.cell_matrix[(a, b)])?;
                }
            }
        }
        Ok(())
    }

    /// Assemble a linear form into `vector`, adding on top of whatever it
    /// already holds.
    pub fn assemble_into_vector(
        &self,
        vector: &mut StencilVector<T, D>,
        assembler: &dyn CellVectorAssembler<T, D>,
    ) -> eyre::Result<()> {
        let ws = &mut *self.workspace.borrow_mut();
        let starts = vector.cart().starts();
        for cell in 0..assembler.num_cells() {
            let n_test = assembler.cell_test_count(cell);
            ws.cell_vector.resize_vertically_mut(n_test, T::zero());
            ws.cell_vector.fill(T::zero());
            assembler.assemble_cell_vector_into(cell, &mut ws.cell_vector)?;
            assembler.populate_cell_test_indices(&mut ws.test_indices, cell);

            for (a, test) in ws.test_indices.iter().enumerate() {
                let row: [i64; D] = std::array::from_fn(|axis| test[axis] - starts[axis] as i64);
                vector.add(&row, ws.cell_vector[a])?;
            }
        }
        Ok(())
    }
}
