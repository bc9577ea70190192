use alloc::{vec, vec::Vec};

use crate::matrix::HessianMatrix;
use crate::packed::{index, matrix_len};
use crate::Fitter;

/// Number of callback invocations, passed to the callbacks as user data.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Calls {
    pub residuum: usize,
    pub gradient: usize,
}

/// Linear least-squares problem `$\sum_i (\vec{a}_i\cdot\vec{p} - y_i)^2$`.
///
/// The residuum is an exact quadratic form so its minimum can be computed
/// directly.
#[derive(Debug, Clone)]
pub struct LinearModel {
    rows: Vec<Vec<f64>>,
    values: Vec<f64>,
}

impl LinearModel {
    pub fn new(rows: Vec<Vec<f64>>, values: Vec<f64>) -> Self {
        assert_eq!(rows.len(), values.len());
        Self { rows, values }
    }

    /// `$(p - 3)^2$`
    pub fn shifted_parabola() -> Self {
        Self::new(vec![vec![1.0]], vec![3.0])
    }

    /// `$(a - 1)^2 + (b + 2)^2$`
    pub fn paraboloid() -> Self {
        Self::new(vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![1.0, -2.0])
    }

    /// Straight line through slightly scattered points.
    pub fn line() -> Self {
        let noise = [0.1, -0.1, 0.05, -0.02, 0.03, -0.06];
        let (rows, values) = noise
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let x = i as f64;
                (vec![1.0, x], 2.0 + 0.5 * x + e)
            })
            .unzip();
        Self::new(rows, values)
    }

    pub fn n_params(&self) -> usize {
        self.rows[0].len()
    }

    fn differences(&self, params: &[f64]) -> impl Iterator<Item = (&[f64], f64)> + '_ {
        let params = params.to_vec();
        self.rows.iter().zip(self.values.iter()).map(move |(row, y)| {
            let model: f64 = row.iter().zip(params.iter()).map(|(a, p)| a * p).sum();
            (row.as_slice(), model - y)
        })
    }

    pub fn residuum(&self, params: &[f64]) -> f64 {
        self.differences(params).map(|(_, v)| v * v).sum()
    }

    pub fn gradient(&self, params: &[f64], gradient: &mut [f64], hessian: &mut [f64]) {
        gradient.fill(0.0);
        hessian.fill(0.0);
        for (row, v) in self.differences(params) {
            for j in 0..row.len() {
                gradient[j] += v * row[j];
                for k in 0..=j {
                    hessian[index(j, k)] += row[j] * row[k];
                }
            }
        }
    }

    /// The Hessian in packed form; it does not depend on the parameters.
    pub fn hessian(&self) -> Vec<f64> {
        let n = self.n_params();
        let mut gradient = vec![0.0; n];
        let mut hessian = vec![0.0; matrix_len(n)];
        self.gradient(&vec![0.0; n], &mut gradient, &mut hessian);
        hessian
    }

    /// Solve the normal equations.
    pub fn minimum(&self) -> Vec<f64> {
        let n = self.n_params();
        let mut l = self.hessian();
        let mut rhs = vec![0.0; n];
        for (row, y) in self.rows.iter().zip(self.values.iter()) {
            for j in 0..n {
                rhs[j] += y * row[j];
            }
        }
        assert!(crate::packed::cholesky_decompose(&mut l, n));
        crate::packed::cholesky_solve(&l, &mut rhs, n);
        rhs
    }

    pub fn dense_fitter(&self) -> Fitter<f64, Calls> {
        let mut fitter = Fitter::<f64, Calls>::new();
        fitter.set_n_params(self.n_params());
        self.install_dense_funcs(&mut fitter);
        fitter
    }

    /// A fitter using the abstract matrix functions. The matrix itself still
    /// has to be installed.
    pub fn matrix_fitter(&self) -> Fitter<f64, Calls> {
        let mut fitter = Fitter::<f64, Calls>::new();
        self.install_matrix_funcs(&mut fitter);
        fitter
    }

    pub fn install_dense_funcs(&self, fitter: &mut Fitter<f64, Calls>) {
        let (r, g) = (self.clone(), self.clone());
        fitter.set_funcs(
            move |p, calls: &mut Calls| {
                calls.residuum += 1;
                Some(r.residuum(p))
            },
            move |p, grad, hess, calls: &mut Calls| {
                calls.gradient += 1;
                g.gradient(p, grad, hess);
                true
            },
        );
    }

    pub fn install_matrix_funcs(&self, fitter: &mut Fitter<f64, Calls>) {
        let (r, g) = (self.clone(), self.clone());
        fitter.set_matrix_funcs(
            move |p, calls: &mut Calls| {
                calls.residuum += 1;
                Some(r.residuum(p))
            },
            move |p, grad, matrix: &mut dyn HessianMatrix<f64>, calls: &mut Calls| {
                calls.gradient += 1;
                let n = grad.len();
                let mut hess = vec![0.0; matrix_len(n)];
                g.gradient(p, grad, &mut hess);
                for j in 0..n {
                    for k in 0..=j {
                        matrix.set_element(j, k, hess[index(j, k)]);
                    }
                }
                true
            },
        );
    }
}
