//! Fitting of model functions to point data.
//!
//! [`FitTask`] turns a model `$y = f(x; \vec{p})$` and a set of points
//! `$(x_i, y_i)$` into the residuum and gradient functions of a [`Fitter`].
//! The residuum is
//! ```math
//!   S(\vec{p}) = \sum_i \bigl(f(x_i; \vec{p}) - y_i\bigr)^2
//! ```
//! and the Hessian is approximated with products of first derivatives.
use alloc::{vec, vec::Vec};

use log::debug;
use nalgebra::{convert, RealField};
use num_traits::Float;

use crate::fitter::{Fitter, UsageError};
use crate::packed::index;

/// A model function for [`FitTask`].
///
/// For example:
///
/// ```
/// # use approx::assert_relative_eq;
/// use marquardt_fitter::{FitFunction, FitTask};
///
/// struct Decay;
///
/// impl FitFunction<f64> for Decay {
///     fn n_params(&self) -> usize {
///         2
///     }
///
///     fn value(&self, x: f64, p: &[f64]) -> Option<f64> {
///         Some(p[0] * (-p[1] * x).exp())
///     }
/// }
///
/// let xs: Vec<f64> = (0..21).map(|i| 0.5 * i as f64).collect();
/// let ys: Vec<f64> = xs.iter().map(|x| 2.0 * (-0.5 * x).exp()).collect();
///
/// let mut task = FitTask::new(Decay);
/// task.set_data(&xs, &ys);
/// task.set_params(&[1.0, 1.0]);
/// assert_eq!(task.fit(), Ok(true));
///
/// let p = task.params().unwrap();
/// assert_relative_eq!(p[0], 2.0, epsilon = 1e-6);
/// assert_relative_eq!(p[1], 0.5, epsilon = 1e-6);
/// ```
pub trait FitFunction<F: RealField + Float> {
    /// Number of parameters of the model.
    fn n_params(&self) -> usize;

    /// Evaluate the model at `x`, `None` if it cannot be evaluated.
    fn value(&self, x: F, params: &[F]) -> Option<F>;

    /// Compute the partial derivatives by parameters at `x` into `out`.
    ///
    /// The default implementation uses central differences with step
    /// `$10^{-5}|p_j|$`, or `$10^{-9}$` for zero parameters. Returns `false`
    /// if the model cannot be evaluated.
    fn derivatives(&self, x: F, params: &[F], out: &mut [F]) -> bool {
        let mut shifted = params.to_vec();
        for (j, d) in out.iter_mut().enumerate() {
            let p = params[j];
            let h: F = if p.is_zero() {
                convert(1.0e-9)
            } else {
                let relative: F = convert(1.0e-5);
                Float::abs(p) * relative
            };

            shifted[j] = p - h;
            let Some(minus) = self.value(x, &shifted) else {
                return false;
            };
            shifted[j] = p + h;
            let Some(plus) = self.value(x, &shifted) else {
                return false;
            };
            shifted[j] = p;
            *d = (plus - minus) / (h + h);
        }
        true
    }
}

/// Model and points handed to the fitter functions of a [`FitTask`].
pub struct PointData<F, E> {
    function: E,
    points: Vec<(F, F)>,
    fixed: Vec<bool>,
    diff: Vec<F>,
}

impl<F, E> PointData<F, E> {
    pub fn function(&self) -> &E {
        &self.function
    }

    pub fn points(&self) -> &[(F, F)] {
        &self.points
    }
}

fn point_residuum<F, E>(params: &[F], data: &mut PointData<F, E>) -> Option<F>
where
    F: RealField + Float,
    E: FitFunction<F>,
{
    let mut r = F::zero();
    for &(x, y) in &data.points {
        let v = data.function.value(x, params)? - y;
        r += v * v;
    }
    Some(r)
}

fn point_gradient<F, E>(
    params: &[F],
    gradient: &mut [F],
    hessian: &mut [F],
    data: &mut PointData<F, E>,
) -> bool
where
    F: RealField + Float,
    E: FitFunction<F>,
{
    gradient.fill(F::zero());
    hessian.fill(F::zero());
    let PointData {
        function,
        points,
        fixed,
        diff,
    } = data;

    for &(x, y) in points.iter() {
        let Some(v) = function.value(x, params) else {
            return false;
        };
        let v = v - y;
        if !function.derivatives(x, params, diff) {
            return false;
        }
        for (d, _) in diff.iter_mut().zip(fixed.iter()).filter(|(_, f)| **f) {
            *d = F::zero();
        }
        for j in 0..diff.len() {
            gradient[j] += v * diff[j];
            for k in 0..=j {
                hessian[index(j, k)] += diff[j] * diff[k];
            }
        }
    }
    true
}

/// Least-squares fit of a [`FitFunction`] to point data.
///
/// Parameters can be fixed; a fixed parameter keeps its initial value.
pub struct FitTask<F, E> {
    fitter: Fitter<F, PointData<F, E>>,
    data: PointData<F, E>,
}

impl<F: RealField + Float, E: FitFunction<F> + 'static> FitTask<F, E> {
    pub fn new(function: E) -> Self {
        let n = function.n_params();
        let mut fitter = Fitter::new();
        fitter.set_n_params(n);
        fitter.set_funcs(point_residuum::<F, E>, point_gradient::<F, E>);
        Self {
            fitter,
            data: PointData {
                function,
                points: vec![],
                fixed: vec![false; n],
                diff: vec![F::zero(); n],
            },
        }
    }

    /// Set the points to fit.
    ///
    /// # Panics
    ///
    /// Panics if `xs` and `ys` are not of the same length.
    pub fn set_data(&mut self, xs: &[F], ys: &[F]) {
        assert_eq!(xs.len(), ys.len(), "x and y data lengths differ");
        self.data.points = xs.iter().copied().zip(ys.iter().copied()).collect();
        self.fitter.invalidate();
    }

    pub fn n_data(&self) -> usize {
        self.data.points.len()
    }

    /// Fix or release the parameter `j`.
    ///
    /// # Panics
    ///
    /// Panics if `j` is not a parameter index.
    pub fn set_fixed_param(&mut self, j: usize, fixed: bool) {
        self.data.fixed[j] = fixed;
        self.fitter.invalidate();
    }

    pub fn fixed_params(&self) -> &[bool] {
        &self.data.fixed
    }

    /// Set the initial parameter values.
    ///
    /// # Panics
    ///
    /// Panics if the length of `params` is not the number of parameters of
    /// the model.
    pub fn set_params(&mut self, params: &[F]) {
        self.fitter.set_params(params);
    }

    pub fn params(&self) -> Option<&[F]> {
        self.fitter.params()
    }

    /// Fit the model to the data, see [`Fitter::fit`].
    pub fn fit(&mut self) -> Result<bool, UsageError> {
        debug!(
            "fitting {} points with {} parameters",
            self.data.points.len(),
            self.data.fixed.len()
        );
        self.fitter.fit(&mut self.data)
    }

    /// Evaluate the residuum at the current parameters.
    pub fn eval_residuum(&mut self) -> Option<F> {
        self.fitter.eval_residuum(&mut self.data)
    }

    /// Estimate the standard errors of the parameters after a fit.
    ///
    /// The errors are `$\sqrt{S (\mathbf{H}^{-1})_{jj}/(N - P)}$` where `$N$`
    /// is the number of points and `$P$` the number of free parameters.
    /// Fixed parameters have zero error. Returns `None` if the Hessian is not
    /// available or there are no more points than free parameters.
    pub fn param_errors(&mut self) -> Option<Vec<F>> {
        let nfree = self.data.fixed.iter().filter(|f| !**f).count();
        let ndata = self.data.points.len();
        if ndata <= nfree {
            return None;
        }
        let residuum = self.fitter.residuum()?;
        let dof: F = convert((ndata - nfree) as f64);
        let diagonal = self.fitter.inverse_hessian_diagonal()?;
        Some(
            diagonal
                .iter()
                .map(|d| Float::sqrt(residuum * Float::max(*d, F::zero()) / dof))
                .collect(),
        )
    }

    pub fn function(&self) -> &E {
        &self.data.function
    }

    pub fn fitter(&self) -> &Fitter<F, PointData<F, E>> {
        &self.fitter
    }

    /// Access the fitter, for instance to change its settings.
    ///
    /// Its number of parameters and functions must not be changed.
    pub fn fitter_mut(&mut self) -> &mut Fitter<F, PointData<F, E>> {
        &mut self.fitter
    }
}
