//! Pluggable Hessian representation.
//!
//! In the abstract-matrix mode the fitter never touches the Hessian elements
//! itself. The gradient callback fills the matrix, and the fitter only reads
//! and replaces its diagonal and asks it to solve linear systems. This allows
//! using sparse or otherwise structured Hessians for problems with many
//! parameters.
use alloc::rc::Rc;
use core::cell::RefCell;

use nalgebra::{linalg::Cholesky, DMatrix, DVector, RealField};
use num_traits::Float;

/// Errors reported by [`HessianMatrix`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MatrixError {
    /// The matrix is singular or not positive definite.
    #[error("matrix is singular or not positive definite")]
    Singular,
    /// A buffer length does not match the matrix order.
    #[error("buffer of length {found} does not match matrix order {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Symmetric matrix used as the Hessian in the abstract-matrix mode.
///
/// The matrix must be square and its order must be equal to the number of
/// fitting parameters.
pub trait HessianMatrix<F> {
    /// Number of rows.
    fn n_rows(&self) -> usize;

    /// Number of columns.
    fn n_cols(&self) -> usize;

    /// Copy the diagonal into `out`.
    fn diagonal(&self, out: &mut [F]) -> Result<(), MatrixError>;

    /// Replace the diagonal with `diag`, keeping all other elements.
    fn set_diagonal(&mut self, diag: &[F]) -> Result<(), MatrixError>;

    /// Solve `$\mathbf{M}\vec{x} = \vec{b}$`, storing `$\vec{x}$` into `out`.
    ///
    /// Failure means the matrix is degenerate or not positive definite.
    fn inv_multiply(&mut self, rhs: &[F], out: &mut [F]) -> Result<(), MatrixError>;

    /// Compute the diagonal of `$\mathbf{M}^{-1}$`.
    ///
    /// Implementations do not need to form the full inverse.
    fn inv_diagonal(&mut self, out: &mut [F]) -> Result<(), MatrixError>;

    /// Set the symmetric pair of elements `$(i, j)$` and `$(j, i)$`.
    ///
    /// # Panics
    ///
    /// Panics if an index is out of range.
    fn set_element(&mut self, i: usize, j: usize, value: F);

    /// Set all elements to zero.
    fn clear(&mut self);
}

/// Shared handle to a [`HessianMatrix`].
///
/// The fitter keeps one clone of the handle while the matrix is installed.
pub type SharedMatrix<F> = Rc<RefCell<dyn HessianMatrix<F>>>;

fn check_len(expected: usize, found: usize) -> Result<(), MatrixError> {
    if expected == found {
        Ok(())
    } else {
        Err(MatrixError::DimensionMismatch { expected, found })
    }
}

/// Dense [`HessianMatrix`] backed by an [`nalgebra::DMatrix`].
///
/// Linear systems are solved with a Cholesky decomposition computed anew
/// for each solve, since the fitter changes the diagonal between solves.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseHessian<F: RealField> {
    matrix: DMatrix<F>,
}

impl<F: RealField + Float> DenseHessian<F> {
    /// Create a zero matrix of order `n`.
    pub fn zeros(n: usize) -> Self {
        Self {
            matrix: DMatrix::zeros(n, n),
        }
    }

    /// Wrap an existing matrix.
    ///
    /// Only the lower triangle is used when solving.
    ///
    /// # Panics
    ///
    /// Panics if `matrix` is not square.
    pub fn from_matrix(matrix: DMatrix<F>) -> Self {
        assert!(matrix.is_square(), "Hessian must be a square matrix");
        Self { matrix }
    }

    /// Get the element `$(i, j)$`.
    pub fn get(&self, i: usize, j: usize) -> F {
        self.matrix[(i, j)]
    }

    /// Access the underlying matrix.
    pub fn as_matrix(&self) -> &DMatrix<F> {
        &self.matrix
    }

    /// Mutably access the underlying matrix.
    ///
    /// The caller is responsible for keeping it symmetric.
    pub fn as_matrix_mut(&mut self) -> &mut DMatrix<F> {
        &mut self.matrix
    }

    /// Move the matrix into a handle that can be installed into a fitter.
    pub fn into_shared(self) -> SharedMatrix<F> {
        Rc::new(RefCell::new(self))
    }

    fn cholesky(&self) -> Result<Cholesky<F, nalgebra::Dyn>, MatrixError> {
        Cholesky::new(self.matrix.clone()).ok_or(MatrixError::Singular)
    }
}

impl<F: RealField + Float> HessianMatrix<F> for DenseHessian<F> {
    fn n_rows(&self) -> usize {
        self.matrix.nrows()
    }

    fn n_cols(&self) -> usize {
        self.matrix.ncols()
    }

    fn diagonal(&self, out: &mut [F]) -> Result<(), MatrixError> {
        check_len(self.matrix.nrows(), out.len())?;
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.matrix[(i, i)];
        }
        Ok(())
    }

    fn set_diagonal(&mut self, diag: &[F]) -> Result<(), MatrixError> {
        check_len(self.matrix.nrows(), diag.len())?;
        self.matrix.set_diagonal(&DVector::from_column_slice(diag));
        Ok(())
    }

    fn inv_multiply(&mut self, rhs: &[F], out: &mut [F]) -> Result<(), MatrixError> {
        let n = self.matrix.nrows();
        check_len(n, rhs.len())?;
        check_len(n, out.len())?;
        let solution = self.cholesky()?.solve(&DVector::from_column_slice(rhs));
        if solution.iter().any(|x| !Float::is_finite(*x)) {
            return Err(MatrixError::Singular);
        }
        out.copy_from_slice(solution.as_slice());
        Ok(())
    }

    fn inv_diagonal(&mut self, out: &mut [F]) -> Result<(), MatrixError> {
        check_len(self.matrix.nrows(), out.len())?;
        let inverse = self.cholesky()?.inverse();
        for (i, o) in out.iter_mut().enumerate() {
            *o = inverse[(i, i)];
        }
        if out.iter().any(|x| !Float::is_finite(*x)) {
            return Err(MatrixError::Singular);
        }
        Ok(())
    }

    fn set_element(&mut self, i: usize, j: usize, value: F) {
        self.matrix[(i, j)] = value;
        self.matrix[(j, i)] = value;
    }

    fn clear(&mut self) {
        self.matrix.fill(F::zero());
    }
}
