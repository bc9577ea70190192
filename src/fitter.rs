use alloc::{boxed::Box, rc::Rc, vec, vec::Vec};
use core::fmt;

use log::{debug, trace, warn};
use nalgebra::RealField;
use num_traits::Float;

use crate::matrix::{HessianMatrix, SharedMatrix};
use crate::packed::{cholesky_decompose, cholesky_invert, cholesky_solve, index, matrix_len};
use crate::settings::FitterSettings;

#[cfg(test)]
mod test_helpers;
#[cfg(test)]
mod test_failures;

/// Reason the last fit terminated.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FitterStatus {
    /// No fit has been run since the last reconfiguration.
    #[default]
    None,
    /// The maximum number of iterations was reached.
    MaxIter,
    /// `$\lambda$` exceeded its maximum without finding an improving step.
    LambdaOverflow,
    /// The residuum and parameters changed too little after many successful steps.
    TooSmallChange,
    /// The residuum callback reported failure.
    FunctionFailure,
    /// The gradient callback reported failure.
    GradientFailure,
    /// A callback reported success but produced `NaN`.
    SilentFailure,
    /// The constraint callback found a parameter out of bounds.
    ParamOffBounds,
    /// The damped normal matrix could not be solved.
    CannotStep,
    /// An operation on the abstract Hessian matrix failed.
    MatrixFailure,
}

impl FitterStatus {
    /// Whether the status means the fit failed.
    ///
    /// [`None`](#variant.None) is not a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            Self::None | Self::MaxIter | Self::LambdaOverflow | Self::TooSmallChange
        )
    }
}

impl fmt::Display for FitterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "not fitted",
            Self::MaxIter => "maximum number of iterations reached",
            Self::LambdaOverflow => "no improving step found, lambda too large",
            Self::TooSmallChange => "converged, change too small",
            Self::FunctionFailure => "function evaluation failed",
            Self::GradientFailure => "gradient evaluation failed",
            Self::SilentFailure => "evaluation produced NaN",
            Self::ParamOffBounds => "parameter out of bounds",
            Self::CannotStep => "normal matrix is not positive definite",
            Self::MatrixFailure => "Hessian matrix operation failed",
        })
    }
}

/// Fitter misuse detected before any iteration started.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("the number of parameters is zero")]
    NoParameters,
    #[error("initial parameter values were not set")]
    ParamsNotSet,
    #[error("residuum and gradient functions were not set")]
    NoFunctions,
    #[error("matrix gradient function set but no matrix installed")]
    NoMatrix,
    #[error("matrix order {found} does not match the number of parameters {expected}")]
    MatrixSizeMismatch { expected: usize, found: usize },
    #[error("matrix is not square ({rows}x{cols})")]
    NonSquareMatrix { rows: usize, cols: usize },
}

/// Evaluates the residuum at the given parameters, `None` on failure.
pub type ResiduumFn<F, D> = Box<dyn FnMut(&[F], &mut D) -> Option<F>>;

/// Fills the gradient and the packed lower-triangular Hessian at the given
/// parameters. Returns `false` on failure.
pub type GradientFn<F, D> = Box<dyn FnMut(&[F], &mut [F], &mut [F], &mut D) -> bool>;

/// Fills the gradient and the abstract Hessian matrix at the given parameters.
/// Returns `false` on failure.
pub type MatrixGradientFn<F, D> =
    Box<dyn FnMut(&[F], &mut [F], &mut dyn HessianMatrix<F>, &mut D) -> bool>;

type ConstrainDyn<F, D> = dyn FnMut(&[F], Option<&mut [bool]>, &mut D) -> bool;

/// Checks whether parameters are within bounds, `false` if any is not.
///
/// When the second argument is given the function should also mark which
/// parameters are fine.
pub type ConstrainFn<F, D> = Box<ConstrainDyn<F, D>>;

/// The two ways of computing the Hessian.
enum GradientMode<F, D> {
    Dense(GradientFn<F, D>),
    Matrix(MatrixGradientFn<F, D>),
}

struct Callbacks<F, D> {
    residuum: ResiduumFn<F, D>,
    gradient: GradientMode<F, D>,
}

/// How much of the derived state can be trusted.
///
/// Ordered, a higher level implies all the lower ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Validity {
    Nothing,
    Params,
    Function,
    Hessian,
    InvHessianDiag,
    InvHessian,
}

struct State<F> {
    nparam: usize,
    status: FitterStatus,
    valid: Validity,
    lambda: F,
    iter: usize,
    f: F,
    f_best: F,
    nsuccesses: usize,
    param: Vec<F>,
    param_best: Vec<F>,
    gradient: Vec<F>,
    diag: Vec<F>,
    step: Vec<F>,
    inv_diag: Vec<F>,
    hessian: Vec<F>,
    inv_hessian: Vec<F>,
}

impl<F: RealField + Float> State<F> {
    fn new() -> Self {
        Self {
            nparam: 0,
            status: FitterStatus::None,
            valid: Validity::Nothing,
            lambda: F::one(),
            iter: 0,
            f: F::zero(),
            f_best: F::zero(),
            nsuccesses: 0,
            param: vec![],
            param_best: vec![],
            gradient: vec![],
            diag: vec![],
            step: vec![],
            inv_diag: vec![],
            hessian: vec![],
            inv_hessian: vec![],
        }
    }

    fn set_n_params(&mut self, nparam: usize) {
        self.valid = Validity::Nothing;
        self.status = FitterStatus::None;
        if self.nparam == nparam {
            return;
        }

        self.nparam = nparam;
        for buf in [
            &mut self.param,
            &mut self.param_best,
            &mut self.gradient,
            &mut self.diag,
            &mut self.step,
            &mut self.inv_diag,
        ] {
            *buf = vec![F::zero(); nparam];
        }
        self.hessian = vec![F::zero(); matrix_len(nparam)];
        self.inv_hessian = vec![F::zero(); matrix_len(nparam)];
    }

    /// Invert the dense Hessian into `inv_hessian`.
    ///
    /// Parameters with zero diagonal are treated as fixed: their row and
    /// column of the inverse are zero.
    fn invert_dense(&mut self) -> bool {
        let n = self.nparam;
        self.inv_hessian.copy_from_slice(&self.hessian);
        let mut zero = vec![false; n];
        for (i, z) in zero.iter_mut().enumerate() {
            if self.hessian[index(i, i)].is_zero() {
                self.inv_hessian[index(i, i)] = F::one();
                *z = true;
            }
        }
        if !cholesky_invert(&mut self.inv_hessian, n) {
            return false;
        }
        for (i, z) in zero.iter().enumerate() {
            if *z {
                self.inv_hessian[index(i, i)] = F::zero();
            }
        }
        true
    }

    /// Assemble the inverse of an abstract Hessian column by column.
    fn invert_matrix(&mut self, matrix: &mut dyn HessianMatrix<F>) -> bool {
        let n = self.nparam;
        if matrix.diagonal(&mut self.diag).is_err() {
            return false;
        }
        for (s, d) in self.step.iter_mut().zip(self.diag.iter()) {
            *s = if d.is_zero() { F::one() } else { *d };
        }
        if matrix.set_diagonal(&self.step).is_err() {
            return false;
        }

        let mut ok = true;
        let mut rhs = vec![F::zero(); n];
        for j in 0..n {
            rhs.fill(F::zero());
            rhs[j] = F::one();
            if matrix.inv_multiply(&rhs, &mut self.inv_diag).is_err() {
                ok = false;
                break;
            }
            for i in j..n {
                self.inv_hessian[index(i, j)] = self.inv_diag[i];
            }
        }
        ok &= matrix.set_diagonal(&self.diag).is_ok();
        if !ok {
            return false;
        }
        for i in 0..n {
            if self.diag[i].is_zero() {
                self.inv_hessian[index(i, i)] = F::zero();
            }
        }
        true
    }
}

/// Marquardt-Levenberg non-linear least-squares fitter.
///
/// See the [module documentation](index.html) for a usage example.
///
/// The fitter minimizes a residuum `$S(\vec{p})$` given as callbacks
/// together with its gradient and Hessian. The type `D` is the user data
/// passed to [`fit`](#method.fit) and handed to all callbacks.
///
/// Sign convention: the callbacks compute the gradient of the differences
/// defined as theoretical minus measured values. The step `$\vec{s}$`
/// solving `$(\mathbf{H} + \lambda\mathbf{D})\vec{s} = \vec{g}$` is then
/// subtracted from the parameters.
pub struct Fitter<F, D = ()> {
    settings: FitterSettings<F>,
    state: State<F>,
    callbacks: Option<Callbacks<F, D>>,
    constrain: Option<ConstrainFn<F, D>>,
    matrix: Option<SharedMatrix<F>>,
}

impl<F: RealField + Float, D> Fitter<F, D> {
    /// Create a fitter with zero parameters and default settings.
    pub fn new() -> Self {
        Self {
            settings: FitterSettings::new(),
            state: State::new(),
            callbacks: None,
            constrain: None,
            matrix: None,
        }
    }

    pub fn settings(&self) -> &FitterSettings<F> {
        &self.settings
    }

    /// Replace the settings. They are used from the next fit on.
    pub fn set_settings(&mut self, settings: FitterSettings<F>) {
        self.settings = settings;
    }

    pub fn n_params(&self) -> usize {
        self.state.nparam
    }

    /// Set the number of fitting parameters.
    ///
    /// This forgets everything computed so far, including the parameter
    /// values. An installed matrix of a different order is released.
    pub fn set_n_params(&mut self, nparam: usize) {
        let mismatched = self
            .matrix
            .as_ref()
            .is_some_and(|m| m.borrow().n_cols() != nparam);
        if mismatched {
            warn!("releasing Hessian matrix of order different from {}", nparam);
            self.matrix = None;
        }
        self.state.set_n_params(nparam);
    }

    /// Set the initial parameter values.
    ///
    /// # Panics
    ///
    /// Panics if the length of `params` differs from the number of parameters.
    pub fn set_params(&mut self, params: &[F]) {
        assert_eq!(
            params.len(),
            self.state.nparam,
            "parameter count does not match"
        );
        self.state.param_best.copy_from_slice(params);
        self.state.valid = Validity::Params;
    }

    /// Forget everything evaluated at the current parameters, keeping the
    /// parameters themselves.
    ///
    /// Call this when the user data change the meaning of the residuum, for
    /// instance when new data are to be fitted.
    pub fn invalidate(&mut self) {
        self.state.valid = self.state.valid.min(Validity::Params);
        self.state.status = FitterStatus::None;
    }

    /// Get the current best parameter values.
    ///
    /// Returns `None` if parameters were never set.
    pub fn params(&self) -> Option<&[F]> {
        if self.state.valid < Validity::Params {
            return None;
        }
        Some(&self.state.param_best)
    }

    /// Set the residuum function and the gradient function computing a dense
    /// packed Hessian.
    ///
    /// Replaces any function set with [`set_matrix_funcs`](#method.set_matrix_funcs).
    /// Everything evaluated with the previous functions is forgotten, only
    /// the parameters are kept.
    pub fn set_funcs<R, G>(&mut self, residuum: R, gradient: G)
    where
        R: FnMut(&[F], &mut D) -> Option<F> + 'static,
        G: FnMut(&[F], &mut [F], &mut [F], &mut D) -> bool + 'static,
    {
        self.replace_callbacks(Callbacks {
            residuum: Box::new(residuum),
            gradient: GradientMode::Dense(Box::new(gradient)),
        });
    }

    /// Set the residuum function and the gradient function filling the
    /// abstract Hessian matrix installed with [`set_matrix`](#method.set_matrix).
    ///
    /// Replaces any function set with [`set_funcs`](#method.set_funcs).
    /// Everything evaluated with the previous functions is forgotten, only
    /// the parameters are kept.
    pub fn set_matrix_funcs<R, G>(&mut self, residuum: R, gradient: G)
    where
        R: FnMut(&[F], &mut D) -> Option<F> + 'static,
        G: FnMut(&[F], &mut [F], &mut dyn HessianMatrix<F>, &mut D) -> bool + 'static,
    {
        self.replace_callbacks(Callbacks {
            residuum: Box::new(residuum),
            gradient: GradientMode::Matrix(Box::new(gradient)),
        });
    }

    // The Hessian lives in a different place in each mode, so nothing
    // computed with the old functions describes the new ones.
    fn replace_callbacks(&mut self, callbacks: Callbacks<F, D>) {
        self.invalidate();
        self.callbacks = Some(callbacks);
    }

    /// Whether the abstract matrix gradient function is used.
    pub fn uses_matrix(&self) -> bool {
        matches!(
            self.callbacks,
            Some(Callbacks {
                gradient: GradientMode::Matrix(_),
                ..
            })
        )
    }

    /// Install or release the abstract Hessian matrix.
    ///
    /// The number of parameters is set to the order of the matrix, or to
    /// zero when `matrix` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::NonSquareMatrix`] if the matrix is not square;
    /// nothing is changed then.
    pub fn set_matrix(&mut self, matrix: Option<SharedMatrix<F>>) -> Result<(), UsageError> {
        let same = match (&self.matrix, &matrix) {
            (Some(a), Some(b)) => core::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)),
            (None, None) => true,
            _ => false,
        };
        if same {
            return Ok(());
        }

        let nparam = match &matrix {
            Some(m) => {
                let m = m.borrow();
                let (rows, cols) = (m.n_rows(), m.n_cols());
                if rows != cols {
                    return Err(UsageError::NonSquareMatrix { rows, cols });
                }
                cols
            }
            None => 0,
        };
        self.matrix = matrix;
        self.state.set_n_params(nparam);
        Ok(())
    }

    pub fn matrix(&self) -> Option<&SharedMatrix<F>> {
        self.matrix.as_ref()
    }

    /// Set the function checking whether parameters are within bounds.
    ///
    /// The status of the last fit is reset.
    pub fn set_constraint<C>(&mut self, constrain: C)
    where
        C: FnMut(&[F], Option<&mut [bool]>, &mut D) -> bool + 'static,
    {
        self.state.status = FitterStatus::None;
        self.constrain = Some(Box::new(constrain));
    }

    /// Remove the constraint function, resetting the status of the last fit.
    pub fn clear_constraint(&mut self) {
        self.state.status = FitterStatus::None;
        self.constrain = None;
    }

    /// Status of the last fit.
    pub fn status(&self) -> FitterStatus {
        self.state.status
    }

    /// Current value of the Marquardt parameter `$\lambda$`.
    pub fn lambda(&self) -> F {
        self.state.lambda
    }

    /// Number of iterations performed in the last fit.
    pub fn iter_number(&self) -> usize {
        self.state.iter
    }

    /// Residuum at the best parameters found, if it was evaluated.
    pub fn residuum(&self) -> Option<F> {
        if self.state.valid < Validity::Function {
            return None;
        }
        Some(self.state.f_best)
    }

    /// Evaluate the residuum at the current best parameters.
    ///
    /// Returns `None` if parameters or functions are not set or the
    /// evaluation fails. A failure also updates the status.
    pub fn eval_residuum(&mut self, data: &mut D) -> Option<F> {
        if self.state.valid < Validity::Params {
            return None;
        }
        let callbacks = self.callbacks.as_mut()?;
        let state = &mut self.state;
        state.param.copy_from_slice(&state.param_best);
        let mut run = Run {
            settings: &self.settings,
            state,
            callbacks,
            constrain: self.constrain.as_deref_mut(),
            matrix: self.matrix.as_ref(),
            data,
        };
        if run.eval_residuum_with_check() {
            run.state.f_best = run.state.f;
            Some(run.state.f)
        } else {
            None
        }
    }

    /// Get the inverse of the Hessian at the best parameters, in packed
    /// lower-triangular form.
    ///
    /// Returns `None` if the Hessian has not been evaluated at the current
    /// parameters or cannot be inverted.
    pub fn inverse_hessian(&mut self) -> Option<&[F]> {
        if self.state.valid < Validity::Hessian {
            return None;
        }
        if self.state.valid < Validity::InvHessian {
            let ok = if self.uses_matrix() {
                match &self.matrix {
                    Some(matrix) => self.state.invert_matrix(&mut *matrix.borrow_mut()),
                    None => false,
                }
            } else {
                self.state.invert_dense()
            };
            if !ok {
                debug!("Hessian inversion failed");
                return None;
            }
            self.state.valid = Validity::InvHessian;
        }
        Some(&self.state.inv_hessian)
    }

    /// Get the diagonal of the inverse Hessian at the best parameters.
    ///
    /// This is all that is needed for parameter error estimates. With an
    /// abstract matrix it avoids forming the full inverse.
    pub fn inverse_hessian_diagonal(&mut self) -> Option<&[F]> {
        if self.state.valid < Validity::Hessian {
            return None;
        }
        if self.state.valid < Validity::InvHessianDiag && self.uses_matrix() {
            let matrix = self.matrix.as_ref()?;
            if matrix
                .borrow_mut()
                .inv_diagonal(&mut self.state.inv_diag)
                .is_err()
            {
                debug!("Hessian inverse diagonal failed");
                return None;
            }
            self.state.valid = Validity::InvHessianDiag;
        } else if self.state.valid != Validity::InvHessianDiag {
            self.inverse_hessian()?;
            let state = &mut self.state;
            for (j, d) in state.inv_diag.iter_mut().enumerate() {
                *d = state.inv_hessian[index(j, j)];
            }
        }
        Some(&self.state.inv_diag)
    }

    /// Run the fit starting from the parameters set with
    /// [`set_params`](#method.set_params).
    ///
    /// Returns `Ok(true)` when the fit terminated normally, see
    /// [`status`](#method.status) for the reason, and `Ok(false)` when it
    /// stopped because of a failure.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] without doing anything if the fitter is not
    /// fully configured.
    pub fn fit(&mut self, data: &mut D) -> Result<bool, UsageError> {
        self.state.status = FitterStatus::None;
        let nparam = self.state.nparam;
        if nparam == 0 {
            return Err(UsageError::NoParameters);
        }
        if self.state.valid < Validity::Params {
            return Err(UsageError::ParamsNotSet);
        }
        let callbacks = self.callbacks.as_mut().ok_or(UsageError::NoFunctions)?;
        if let GradientMode::Matrix(_) = callbacks.gradient {
            let matrix = self.matrix.as_ref().ok_or(UsageError::NoMatrix)?;
            let m = matrix.borrow();
            for found in [m.n_rows(), m.n_cols()] {
                if found != nparam {
                    return Err(UsageError::MatrixSizeMismatch {
                        expected: nparam,
                        found,
                    });
                }
            }
        }

        debug!("fitting {} parameters", nparam);
        let mut run = Run {
            settings: &self.settings,
            state: &mut self.state,
            callbacks,
            constrain: self.constrain.as_deref_mut(),
            matrix: self.matrix.as_ref(),
            data,
        };
        let ok = run.minimize();
        debug!(
            "fit finished after {} iterations: {} (lambda = {}, residuum = {})",
            self.state.iter, self.state.status, self.state.lambda, self.state.f_best
        );
        Ok(ok)
    }
}

impl<F: RealField + Float, D> Default for Fitter<F, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: fmt::Debug, D> fmt::Debug for Fitter<F, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fitter")
            .field("n_params", &self.state.nparam)
            .field("status", &self.state.status)
            .field("settings", &self.settings)
            .field("has_funcs", &self.callbacks.is_some())
            .field("has_constraint", &self.constrain.is_some())
            .field("has_matrix", &self.matrix.is_some())
            .finish()
    }
}

/// Everything a single fit borrows from the fitter.
struct Run<'a, F, D> {
    settings: &'a FitterSettings<F>,
    state: &'a mut State<F>,
    callbacks: &'a mut Callbacks<F, D>,
    constrain: Option<&'a mut ConstrainDyn<F, D>>,
    matrix: Option<&'a SharedMatrix<F>>,
    data: &'a mut D,
}

impl<'a, F: RealField + Float, D> Run<'a, F, D> {
    fn param_off_bounds(&mut self) -> bool {
        match self.constrain.as_deref_mut() {
            Some(constrain) => !constrain(&self.state.param, None, &mut *self.data),
            None => false,
        }
    }

    // Callers are not trusted to produce numbers. A failure is reclassified
    // as off bounds when the constraint function says so.
    fn eval_residuum_with_check(&mut self) -> bool {
        let ok = match (self.callbacks.residuum)(&self.state.param, &mut *self.data) {
            Some(f) if Float::is_nan(f) => {
                debug!("residuum is NaN");
                self.state.f = f;
                self.state.status = FitterStatus::SilentFailure;
                false
            }
            Some(f) => {
                if f < F::zero() {
                    warn!("residuum {} is negative", f);
                }
                self.state.f = f;
                true
            }
            None => {
                debug!("residuum evaluation failed");
                self.state.status = FitterStatus::FunctionFailure;
                false
            }
        };

        if ok {
            self.state.valid = self.state.valid.max(Validity::Function);
        } else if self.param_off_bounds() {
            self.state.status = FitterStatus::ParamOffBounds;
        }
        ok
    }

    fn eval_gradient_with_check(&mut self) -> bool {
        let state = &mut *self.state;
        let n = state.nparam;
        let reported = match &mut self.callbacks.gradient {
            GradientMode::Dense(eval) => eval(
                &state.param,
                &mut state.gradient,
                &mut state.hessian,
                &mut *self.data,
            ),
            GradientMode::Matrix(eval) => match self.matrix {
                Some(matrix) => eval(
                    &state.param,
                    &mut state.gradient,
                    &mut *matrix.borrow_mut(),
                    &mut *self.data,
                ),
                None => false,
            },
        };

        let ok = if !reported {
            debug!("gradient evaluation failed");
            state.status = FitterStatus::GradientFailure;
            false
        } else {
            // The abstract matrix has to be trusted with its own elements.
            let dense = matches!(self.callbacks.gradient, GradientMode::Dense(_));
            let nan = state.gradient.iter().any(|g| Float::is_nan(*g))
                || (dense
                    && state.hessian[..matrix_len(n)]
                        .iter()
                        .any(|h| Float::is_nan(*h)));
            if nan {
                debug!("gradient or Hessian contains NaN");
                state.status = FitterStatus::SilentFailure;
            }
            !nan
        };

        if ok {
            self.state.valid = self.state.valid.max(Validity::Hessian);
        } else if self.param_off_bounds() {
            self.state.status = FitterStatus::ParamOffBounds;
        }
        ok
    }

    fn matrix_mode(&self) -> Option<&'a SharedMatrix<F>> {
        match self.callbacks.gradient {
            GradientMode::Matrix(_) => self.matrix,
            GradientMode::Dense(_) => None,
        }
    }

    fn extract_hessian_diagonal(&mut self) -> bool {
        let matrix = self.matrix_mode();
        if let Some(matrix) = matrix {
            if matrix.borrow().diagonal(&mut self.state.diag).is_err() {
                self.state.status = FitterStatus::MatrixFailure;
                return false;
            }
            return true;
        }
        let state = &mut *self.state;
        for (j, d) in state.diag.iter_mut().enumerate() {
            *d = state.hessian[index(j, j)];
        }
        true
    }

    /// Put the values stored in `step` or `diag` onto the Hessian diagonal.
    fn set_diagonal(&mut self, from_step: bool) -> bool {
        let matrix = self.matrix_mode();
        let state = &mut *self.state;
        let values = if from_step { &state.step } else { &state.diag };
        if let Some(matrix) = matrix {
            if matrix.borrow_mut().set_diagonal(values).is_err() {
                state.status = FitterStatus::MatrixFailure;
                return false;
            }
            return true;
        }
        for (j, v) in values.iter().enumerate() {
            state.hessian[index(j, j)] = *v;
        }
        true
    }

    // Non-positive diagonal elements are damped as if they were 1 so that
    // parameters with no influence stay put. diag keeps the original
    // diagonal for restoring; step is used as the scratch buffer.
    fn add_to_diagonal(&mut self) -> bool {
        let state = &mut *self.state;
        let lambda = state.lambda;
        for (s, d) in state.step.iter_mut().zip(state.diag.iter()) {
            let scale = if *d > F::zero() { *d } else { F::one() };
            *s = *d + lambda * scale;
        }
        self.set_diagonal(true)
    }

    fn restore_diagonal(&mut self) -> bool {
        self.set_diagonal(false)
    }

    fn solve_step(&mut self) -> bool {
        let matrix = self.matrix_mode();
        let state = &mut *self.state;
        if let Some(matrix) = matrix {
            return matrix
                .borrow_mut()
                .inv_multiply(&state.gradient, &mut state.step)
                .is_ok();
        }

        let n = state.nparam;
        state.inv_hessian.copy_from_slice(&state.hessian);
        if !cholesky_decompose(&mut state.inv_hessian, n) {
            return false;
        }
        state.step.copy_from_slice(&state.gradient);
        cholesky_solve(&state.inv_hessian, &mut state.step, n);
        true
    }

    fn update_param(&mut self) {
        let state = &mut *self.state;
        for ((p, pb), s) in state
            .param
            .iter_mut()
            .zip(state.param_best.iter())
            .zip(state.step.iter())
        {
            *p = *pb - *s;
        }
    }

    /// Try one step with the current `$\lambda$`, returning whether it
    /// decreased the residuum.
    fn try_step(&mut self) -> bool {
        if !self.solve_step() {
            trace!("cannot solve with lambda = {}", self.state.lambda);
            self.state.status = FitterStatus::CannotStep;
            return false;
        }
        self.update_param();
        // TODO: find out which parameters are off bounds and keep them fixed
        // for the retry instead of only increasing lambda.
        if self.param_off_bounds() {
            self.state.status = FitterStatus::ParamOffBounds;
            return false;
        }
        if !self.eval_residuum_with_check() {
            return false;
        }
        trace!(
            "lambda = {}, residuum {} -> {}",
            self.state.lambda,
            self.state.f_best,
            self.state.f
        );
        self.state.f < self.state.f_best
    }

    /// Check whether the last step was negligible compared to the parameter
    /// errors estimated from the inverse Hessian diagonal.
    ///
    /// The Hessian at this point is the damped one from the last accepted
    /// step, so nothing computed here is cached.
    fn too_small_param_change(&mut self) -> bool {
        let matrix = self.matrix_mode();
        let state = &mut *self.state;
        let n = state.nparam;
        // Multiplying by the residuum makes the condition scale with the
        // fitted function values.
        let eps = self.settings.param_change_min * Float::sqrt(state.f_best);

        if let Some(matrix) = matrix {
            if matrix
                .borrow_mut()
                .inv_diagonal(&mut state.inv_diag)
                .is_err()
            {
                return false;
            }
        } else {
            state.inv_hessian.copy_from_slice(&state.hessian);
            if !cholesky_invert(&mut state.inv_hessian, n) {
                return false;
            }
            for (j, d) in state.inv_diag.iter_mut().enumerate() {
                *d = state.inv_hessian[index(j, j)];
            }
        }

        state
            .step
            .iter()
            .zip(state.inv_diag.iter())
            .all(|(s, d)| Float::abs(*s) <= eps * Float::sqrt(Float::max(*d, F::zero())))
    }

    fn minimize(&mut self) -> bool {
        let settings = *self.settings;
        {
            let state = &mut *self.state;
            state.iter = 0;
            state.lambda = settings.lambda_start;
            state.valid = state.valid.min(Validity::Params);
            state.param.copy_from_slice(&state.param_best);
        }

        if !self.eval_residuum_with_check() || !self.eval_gradient_with_check() {
            return false;
        }

        let mut f_step = F::zero();
        self.state.f_best = self.state.f;
        self.state.nsuccesses = 0;

        loop {
            // Nothing can improve a zero residuum.
            if self.state.f_best.is_zero() {
                self.state.status = FitterStatus::TooSmallChange;
                break;
            }
            if self.state.iter >= settings.iter_max {
                break;
            }
            self.state.iter += 1;

            if !self.extract_hessian_diagonal() {
                return false;
            }
            while self.state.lambda <= settings.lambda_max {
                self.state.status = FitterStatus::None;
                if !self.add_to_diagonal() {
                    return false;
                }
                if self.try_step() {
                    let state = &mut *self.state;
                    state.nsuccesses += 1;
                    state.lambda /= settings.lambda_decrease;
                    f_step = if state.f_best.is_zero() {
                        F::zero()
                    } else {
                        F::one() - state.f / state.f_best
                    };
                    state.f_best = state.f;
                    state.param_best.copy_from_slice(&state.param);
                    state.valid = state.valid.min(Validity::Function);
                    break;
                }

                self.state.nsuccesses = 0;
                self.state.lambda *= settings.lambda_increase;
                if !self.restore_diagonal() {
                    return false;
                }
            }

            if self.state.nsuccesses == 0 {
                if self.state.status != FitterStatus::None {
                    return false;
                }
                self.state.status = FitterStatus::LambdaOverflow;
                break;
            } else if self.state.nsuccesses > settings.successes_to_get_bored
                && (f_step < settings.residuum_change_min || self.too_small_param_change())
            {
                self.state.status = FitterStatus::TooSmallChange;
                break;
            }

            if !self.eval_gradient_with_check() {
                return false;
            }
            self.state.status = FitterStatus::None;
        }

        if self.state.status == FitterStatus::None {
            self.state.status = FitterStatus::MaxIter;
        }
        // Keep the Hessian at the best parameters available for error
        // estimates. A failure here does not change the outcome.
        if self.state.valid < Validity::Hessian {
            let status = self.state.status;
            let state = &mut *self.state;
            state.param.copy_from_slice(&state.param_best);
            if !self.eval_gradient_with_check() {
                warn!("cannot evaluate Hessian at the best parameters");
            }
            self.state.status = status;
        }
        true
    }
}
