use approx::assert_relative_eq;

use super::test_helpers::{Calls, LinearModel};
use crate::{Fitter, FitterSettings, FitterStatus};

fn unit_gradient(_: &[f64], g: &mut [f64], h: &mut [f64], calls: &mut Calls) -> bool {
    calls.gradient += 1;
    g.fill(1.0);
    h.fill(0.0);
    for j in 0..g.len() {
        h[crate::packed::index(j, j)] = 1.0;
    }
    true
}

fn failing_fitter<R>(residuum: R) -> Fitter<f64, Calls>
where
    R: FnMut(&[f64], &mut Calls) -> Option<f64> + 'static,
{
    let mut fitter = Fitter::<f64, Calls>::new();
    fitter.set_n_params(1);
    fitter.set_funcs(residuum, unit_gradient);
    fitter.set_params(&[0.5]);
    fitter
}

#[test]
fn residuum_always_fails() {
    let mut fitter = failing_fitter(|_, calls| {
        calls.residuum += 1;
        None
    });
    let mut calls = Calls::default();

    assert_eq!(fitter.fit(&mut calls), Ok(false));
    assert_eq!(fitter.status(), FitterStatus::FunctionFailure);
    assert!(fitter.status().is_failure());
    assert_eq!(fitter.iter_number(), 0);
    assert_eq!(calls, Calls { residuum: 1, gradient: 0 });
    assert_eq!(fitter.params(), Some(&[0.5][..]));
}

#[test]
fn nan_residuum() {
    let mut fitter = failing_fitter(|_, _| Some(f64::NAN));
    assert_eq!(fitter.fit(&mut Calls::default()), Ok(false));
    assert_eq!(fitter.status(), FitterStatus::SilentFailure);
}

#[test]
fn gradient_fails() {
    let mut fitter = LinearModel::paraboloid().dense_fitter();
    fitter.set_funcs(
        |p, _| Some(p[0] * p[0] + p[1] * p[1]),
        |_, _, _, _| false,
    );
    fitter.set_params(&[1.0, 1.0]);
    assert_eq!(fitter.fit(&mut Calls::default()), Ok(false));
    assert_eq!(fitter.status(), FitterStatus::GradientFailure);
    assert_eq!(fitter.iter_number(), 0);
}

#[test]
fn nan_in_gradient_or_hessian() {
    let model = LinearModel::paraboloid();
    for nan_in_hessian in [false, true] {
        let mut fitter = model.dense_fitter();
        let r = model.clone();
        let g = model.clone();
        fitter.set_funcs(
            move |p, _| Some(r.residuum(p)),
            move |p, grad, hess, _| {
                g.gradient(p, grad, hess);
                if nan_in_hessian {
                    hess[1] = f64::NAN;
                } else {
                    grad[1] = f64::NAN;
                }
                true
            },
        );
        fitter.set_params(&[3.0, 3.0]);

        assert_eq!(fitter.fit(&mut Calls::default()), Ok(false));
        assert_eq!(fitter.status(), FitterStatus::SilentFailure);
        assert_eq!(fitter.params(), Some(&[3.0, 3.0][..]));
    }
}

#[test]
fn nan_gradient_attributed_to_bounds() {
    let model = LinearModel::paraboloid();
    let mut fitter = model.dense_fitter();
    let r = model.clone();
    fitter.set_funcs(
        move |p, _| Some(r.residuum(p)),
        |_, grad, _, _| {
            grad.fill(f64::NAN);
            true
        },
    );
    fitter.set_constraint(|p, _, _| p[0] < 0.0);
    fitter.set_params(&[3.0, 3.0]);

    assert_eq!(fitter.fit(&mut Calls::default()), Ok(false));
    assert_eq!(fitter.status(), FitterStatus::ParamOffBounds);
}

#[test]
fn failure_outside_bounds() {
    let mut fitter = failing_fitter(|_, _| None);
    fitter.set_constraint(|p, _, _| p[0] > 1.0);
    assert_eq!(fitter.fit(&mut Calls::default()), Ok(false));
    assert_eq!(fitter.status(), FitterStatus::ParamOffBounds);

    // Within bounds the failure is the function's own.
    fitter.set_params(&[2.0]);
    assert_eq!(fitter.fit(&mut Calls::default()), Ok(false));
    assert_eq!(fitter.status(), FitterStatus::FunctionFailure);
}

#[test]
fn every_step_out_of_bounds() {
    let model = LinearModel::shifted_parabola();
    let mut fitter = model.dense_fitter();
    fitter.set_constraint(|p, _, _| p[0] == 0.0);
    fitter.set_params(&[0.0]);
    let mut calls = Calls::default();

    assert_eq!(fitter.fit(&mut calls), Ok(false));
    assert_eq!(fitter.status(), FitterStatus::ParamOffBounds);
    assert_eq!(fitter.params(), Some(&[0.0][..]));
    // Rejected steps are never evaluated.
    assert_eq!(calls.residuum, 1);

    fitter.clear_constraint();
    assert_eq!(fitter.fit(&mut calls), Ok(true));
    assert_relative_eq!(fitter.params().unwrap()[0], 3.0, epsilon = 1e-9);
}

#[test]
fn always_worse_overflows_lambda() {
    // Each evaluation gives a larger residuum than the previous one.
    let mut fitter = failing_fitter(|_, calls| {
        calls.residuum += 1;
        Some(calls.residuum as f64)
    });
    let mut calls = Calls::default();

    assert_eq!(fitter.fit(&mut calls), Ok(true));
    assert_eq!(fitter.status(), FitterStatus::LambdaOverflow);
    assert!(!fitter.status().is_failure());
    assert_relative_eq!(fitter.lambda(), 1.0e7);
    assert_eq!(fitter.iter_number(), 1);
    // Initial evaluation and one per lambda from 1 to 1e6.
    assert_eq!(calls, Calls { residuum: 8, gradient: 1 });
    assert_eq!(fitter.params(), Some(&[0.5][..]));
    assert_eq!(fitter.residuum(), Some(1.0));
}

#[test]
fn lambda_max_below_start() {
    let mut fitter = LinearModel::shifted_parabola().dense_fitter();
    fitter.set_settings(FitterSettings::new().with_lambda_max(0.5));
    fitter.set_params(&[0.0]);
    let mut calls = Calls::default();

    assert_eq!(fitter.fit(&mut calls), Ok(true));
    assert_eq!(fitter.status(), FitterStatus::LambdaOverflow);
    assert_eq!(calls.residuum, 1);
    assert_eq!(fitter.params(), Some(&[0.0][..]));
}

#[test]
fn hessian_never_positive_definite() {
    let mut fitter = Fitter::<f64, ()>::new();
    fitter.set_n_params(1);
    fitter.set_funcs(
        |p, _| Some(p[0] * p[0]),
        |p, g, h, _| {
            g[0] = p[0];
            h[0] = -1.0e9;
            true
        },
    );
    fitter.set_params(&[1.0]);

    assert_eq!(fitter.fit(&mut ()), Ok(false));
    assert_eq!(fitter.status(), FitterStatus::CannotStep);
    assert_eq!(fitter.params(), Some(&[1.0][..]));
    assert_relative_eq!(fitter.lambda(), 1.0e7);
}

#[test]
fn status_reset_by_reconfiguration() {
    let mut fitter = failing_fitter(|_, _| None);
    fitter.fit(&mut Calls::default()).unwrap();
    assert_eq!(fitter.status(), FitterStatus::FunctionFailure);

    let model = LinearModel::shifted_parabola();
    let r = model.clone();
    fitter.set_funcs(move |p, _| Some(r.residuum(p)), unit_gradient);
    assert_eq!(fitter.status(), FitterStatus::None);
}

#[test]
fn status_reset_by_constraint_change() {
    let mut fitter = failing_fitter(|_, _| None);
    fitter.fit(&mut Calls::default()).unwrap();
    assert_eq!(fitter.status(), FitterStatus::FunctionFailure);
    fitter.set_constraint(|p, _, _| p[0] > 1.0);
    assert_eq!(fitter.status(), FitterStatus::None);

    fitter.fit(&mut Calls::default()).unwrap();
    assert_eq!(fitter.status(), FitterStatus::ParamOffBounds);
    fitter.clear_constraint();
    assert_eq!(fitter.status(), FitterStatus::None);
    assert_eq!(fitter.params(), Some(&[0.5][..]));
}

#[test]
fn negative_residuum_is_not_convergence() {
    let mut fitter = failing_fitter(|_, calls| {
        calls.residuum += 1;
        Some(-1.0)
    });
    let mut calls = Calls::default();

    assert_eq!(fitter.fit(&mut calls), Ok(true));
    assert_eq!(fitter.status(), FitterStatus::LambdaOverflow);
    assert_eq!(fitter.iter_number(), 1);
    assert_eq!(calls.residuum, 8);
    assert_eq!(fitter.residuum(), Some(-1.0));
}
