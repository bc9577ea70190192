use nalgebra::{convert, RealField};
use num_traits::Float;

/// Tunable thresholds of the [`Fitter`](struct.Fitter.html).
///
/// The settings are a plain value. They are copied into the fitter with
/// [`Fitter::set_settings`](struct.Fitter.html#method.set_settings) and take
/// effect at the next fit.
///
/// The Marquardt parameter `$\lambda$` starts each fit at `lambda_start`.
/// It is multiplied by `lambda_increase` after each rejected trial step and
/// divided by `lambda_decrease` after each accepted one. When it exceeds
/// `lambda_max` the fit terminates.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FitterSettings<F> {
    pub(crate) iter_max: usize,
    pub(crate) successes_to_get_bored: usize,
    pub(crate) lambda_start: F,
    pub(crate) lambda_max: F,
    pub(crate) lambda_increase: F,
    pub(crate) lambda_decrease: F,
    pub(crate) param_change_min: F,
    pub(crate) residuum_change_min: F,
}

impl<F: RealField + Float> FitterSettings<F> {
    pub fn new() -> Self {
        Self {
            iter_max: 50,
            successes_to_get_bored: 5,
            lambda_start: F::one(),
            lambda_max: convert(1.0e6),
            lambda_increase: convert(10.0),
            lambda_decrease: convert(4.0),
            param_change_min: convert(1.0e-4),
            residuum_change_min: convert(1.0e-6),
        }
    }

    /// Set the maximum number of iterations.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{iter\_max} = 0$`.
    pub fn with_iter_max(self, iter_max: usize) -> Self {
        assert!(iter_max > 0, "iter_max must be > 0");
        Self { iter_max, ..self }
    }

    /// Set the number of consecutive successful steps after which the
    /// minimum required change of residuum and parameters is checked.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{successes\_to\_get\_bored} = 0$`.
    pub fn with_successes_to_get_bored(self, successes_to_get_bored: usize) -> Self {
        assert!(
            successes_to_get_bored > 0,
            "successes_to_get_bored must be > 0"
        );
        Self {
            successes_to_get_bored,
            ..self
        }
    }

    /// Set the value of `$\lambda$` at the start of each fit.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{lambda\_start} \leq 0$`.
    pub fn with_lambda_start(self, lambda_start: F) -> Self {
        assert!(lambda_start > F::zero(), "lambda_start must be > 0");
        Self {
            lambda_start,
            ..self
        }
    }

    /// Set the maximum value of `$\lambda$`.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{lambda\_max} < 0$`.
    pub fn with_lambda_max(self, lambda_max: F) -> Self {
        assert!(lambda_max >= F::zero(), "lambda_max must be >= 0");
        Self { lambda_max, ..self }
    }

    /// Set the factor `$\lambda$` is multiplied with after a rejected step.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{lambda\_increase} < 1$`.
    pub fn with_lambda_increase(self, lambda_increase: F) -> Self {
        assert!(lambda_increase >= F::one(), "lambda_increase must be >= 1");
        Self {
            lambda_increase,
            ..self
        }
    }

    /// Set the factor `$\lambda$` is divided with after an accepted step.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{lambda\_decrease} < 1$`.
    pub fn with_lambda_decrease(self, lambda_decrease: F) -> Self {
        assert!(lambda_decrease >= F::one(), "lambda_decrease must be >= 1");
        Self {
            lambda_decrease,
            ..self
        }
    }

    /// Set the minimum relative change of at least one parameter in a
    /// successful step.
    ///
    /// The change of parameter `$j$` is compared to
    /// `$\mathtt{param\_change\_min}\sqrt{S\,(\mathbf{H}^{-1})_{jj}}$`
    /// where `$S$` is the residuum.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{param\_change\_min} < 0$`.
    pub fn with_param_change_min(self, param_change_min: F) -> Self {
        assert!(
            param_change_min >= F::zero(),
            "param_change_min must be >= 0"
        );
        Self {
            param_change_min,
            ..self
        }
    }

    /// Set the minimum relative decrease of the residuum in a successful step.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{residuum\_change\_min} < 0$`.
    pub fn with_residuum_change_min(self, residuum_change_min: F) -> Self {
        assert!(
            residuum_change_min >= F::zero(),
            "residuum_change_min must be >= 0"
        );
        Self {
            residuum_change_min,
            ..self
        }
    }

    pub fn iter_max(&self) -> usize {
        self.iter_max
    }

    pub fn successes_to_get_bored(&self) -> usize {
        self.successes_to_get_bored
    }

    pub fn lambda_start(&self) -> F {
        self.lambda_start
    }

    pub fn lambda_max(&self) -> F {
        self.lambda_max
    }

    pub fn lambda_increase(&self) -> F {
        self.lambda_increase
    }

    pub fn lambda_decrease(&self) -> F {
        self.lambda_decrease
    }

    pub fn param_change_min(&self) -> F {
        self.param_change_min
    }

    pub fn residuum_change_min(&self) -> F {
        self.residuum_change_min
    }
}

impl<F: RealField + Float> Default for FitterSettings<F> {
    fn default() -> Self {
        Self::new()
    }
}
