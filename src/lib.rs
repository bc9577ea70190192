//! Non-linear least-squares fitting with the
//! [Marquardt-Levenberg](https://en.wikipedia.org/wiki/Levenberg%E2%80%93Marquardt_algorithm)
//! algorithm.
//!
//! The [`Fitter`] minimizes a residuum
//! ```math
//!   S(\vec{p}) = \sum_i v_i(\vec{p})^2
//! ```
//! of `$n$` parameters `$\vec{p}$`, where `$v_i$` are the differences
//! between the theoretical and measured values. It does not know the
//! differences themselves; it only calls user functions computing
//!
//! - the residuum `$S(\vec{p})$`,
//! - the gradient `$g_j = \sum_i v_i\,\partial v_i/\partial p_j$`
//! - and the Hessian approximation `$H_{jk} = \sum_i \partial v_i/\partial p_j\,\partial v_i/\partial p_k$`.
//!
//! Each iteration solves `$(\mathbf{H} + \lambda\mathbf{D})\vec{s} = \vec{g}$`,
//! where `$\mathbf{D}$` is the diagonal of `$\mathbf{H}$`, and tries the
//! parameters `$\vec{p} - \vec{s}$`. The Marquardt parameter `$\lambda$`
//! grows while the steps fail to decrease the residuum and shrinks when they
//! succeed. The thresholds are collected in [`FitterSettings`].
//!
//! # Hessian representations
//!
//! By default the Hessian is a dense symmetric matrix in the packed
//! lower-triangular layout of the [`packed`] module, filled by the function
//! set with [`Fitter::set_funcs`]. For problems with many parameters and a
//! structured Hessian, any [`HessianMatrix`] can be installed with
//! [`Fitter::set_matrix`] and filled by a function set with
//! [`Fitter::set_matrix_funcs`].
//!
//! Models of the form `$y = f(x; \vec{p})$` fitted to point data do not need
//! any of this: [`FitTask`] provides the functions.
//!
//! # Usage Example
//!
//! We use `$(x^2 + y - 11)^2 + (x + y^2 - 7)^2$`, i.e.
//! [Himmelblau's function](https://en.wikipedia.org/wiki/Himmelblau%27s_function),
//! as the residuum.
//!
//! ```
//! # use approx::assert_relative_eq;
//! use marquardt_fitter::{packed, Fitter};
//!
//! fn differences(p: &[f64]) -> [f64; 2] {
//!     [p[0] * p[0] + p[1] - 11.0, p[0] + p[1] * p[1] - 7.0]
//! }
//!
//! let mut fitter = Fitter::<f64>::new();
//! fitter.set_n_params(2);
//! fitter.set_funcs(
//!     |p, _| Some(differences(p).iter().map(|v| v * v).sum()),
//!     |p, gradient, hessian, _| {
//!         let v = differences(p);
//!         // derivatives of the differences by the parameters
//!         let d = [[2.0 * p[0], 1.0], [1.0, 2.0 * p[1]]];
//!         gradient.fill(0.0);
//!         hessian.fill(0.0);
//!         for i in 0..2 {
//!             for j in 0..2 {
//!                 gradient[j] += v[i] * d[i][j];
//!                 for k in 0..=j {
//!                     hessian[packed::index(j, k)] += d[i][j] * d[i][k];
//!                 }
//!             }
//!         }
//!         true
//!     },
//! );
//! fitter.set_params(&[1.0, 1.0]);
//!
//! assert_eq!(fitter.fit(&mut ()), Ok(true));
//! assert!(!fitter.status().is_failure());
//! assert!(fitter.residuum().unwrap() < 1e-10);
//! let p = fitter.params().unwrap();
//! assert_relative_eq!(p[0], 3.0, epsilon = 1e-6);
//! assert_relative_eq!(p[1], 2.0, epsilon = 1e-6);
//! ```
//!
//! # Parameter errors
//!
//! After a fit, [`Fitter::inverse_hessian`] gives the inverse of the Hessian
//! at the best parameters. Its diagonal, available alone through
//! [`Fitter::inverse_hessian_diagonal`], multiplied by the residuum per degree
//! of freedom estimates the squared parameter errors. [`FitTask::param_errors`]
//! does exactly this.
#![no_std]

extern crate alloc;

mod fit_task;
mod fitter;
mod matrix;
pub mod packed;
mod settings;

pub use fit_task::{FitFunction, FitTask, PointData};
pub use fitter::{
    ConstrainFn, Fitter, FitterStatus, GradientFn, MatrixGradientFn, ResiduumFn, UsageError,
};
pub use matrix::{DenseHessian, HessianMatrix, MatrixError, SharedMatrix};
pub use settings::FitterSettings;
