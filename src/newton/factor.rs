//! Factorization driver: sweep selection, pivot safeguards, and the
//! regularization policy around the banded Cholesky kernels.

use crate::E;
use crate::error::{DualNewtonError, FactorizationError};
use crate::newton::DualNewtonSolver;
use crate::options::{FactorizationAlg, RegStrategy};

impl DualNewtonSolver {
    /// Factorizes the Newton Hessian with the configured sweep, then applies
    /// the regularization policy if the factorization failed or the factor
    /// diagonal fell below the pivot tolerance.
    ///
    /// The reverse sweep restarts at the last stage with an active-set
    /// change; when no active set changed since the previous factorization
    /// the factor is reused as is.
    pub(crate) fn factor_newton_hessian(
        &mut self,
        regularized: &mut bool,
    ) -> Result<(), FactorizationError> {
        if self.n_coupling == 0 {
            return Ok(());
        }
        let tol = self.options.newton_hess_diag_reg_tolerance;
        let on_the_fly = match self.options.reg_type {
            RegStrategy::SingularDirections => Some(self.options.reg_param),
            _ => None,
        };

        // a failed or skipped factorization invalidates the stored factor,
        // so partial refactorization must restart from the full band
        let restart = if self.factor_valid {
            self.last_act_set_change
        } else {
            Some(self.n_coupling - 1)
        };
        self.factor_valid = false;

        let attempt = match self.options.newton_hess_fac_alg {
            FactorizationAlg::BandForward => {
                self.cholesky.factorize_forward(&self.hessian, tol, on_the_fly)
            }
            FactorizationAlg::BandReverse => match restart {
                Some(idx) => self.cholesky.factorize_reverse(&self.hessian, idx, tol, on_the_fly),
                // no block changed since the last factorization
                None => Ok(false),
            },
        };

        let attempt = match attempt {
            Ok(flag) => {
                *regularized |= flag;
                Ok(())
            }
            Err(err) => Err(err),
        };

        let min_diag = if attempt.is_ok() { self.cholesky.min_diag() } else { E::NEG_INFINITY };
        if attempt.is_ok() && min_diag >= tol {
            self.factor_valid = true;
            return Ok(());
        }

        // TODO: blocks reused across iterations keep their regularization
        // shift until their next rebuild, so the band can be partially
        // regularized after an incremental refactorization
        let result = match self.options.reg_type {
            // repaired on the fly inside the sweep; only a hard failure of
            // the sweep itself remains fatal
            RegStrategy::SingularDirections => attempt,

            RegStrategy::LevenbergMarquardt => {
                for k in 0..self.n_coupling {
                    for j in 0..self.nx {
                        self.hessian.add(k, 0, j, j, self.options.reg_param);
                    }
                }
                *regularized = true;
                let refactor = match self.options.newton_hess_fac_alg {
                    FactorizationAlg::BandForward => {
                        self.cholesky.factorize_forward(&self.hessian, tol, None)
                    }
                    FactorizationAlg::BandReverse => self.cholesky.factorize_reverse(
                        &self.hessian,
                        self.n_coupling - 1,
                        tol,
                        None,
                    ),
                };
                refactor.map(|_| ())
            }

            RegStrategy::GradientStep => {
                *regularized = true;
                Err(FactorizationError::GradientStepRequested)
            }

            RegStrategy::NormalizedLevenbergMarquardt => Err(FactorizationError::DeprecatedStrategy),
            RegStrategy::UnconstrainedHessian => Err(FactorizationError::UnimplementedStrategy),
        };
        if result.is_ok() {
            self.factor_valid = true;
        }
        result
    }

    /// Back-substitution matched to the factorization sweep; yields the
    /// Newton direction in `delta_lambda`.
    pub(crate) fn solve_newton_system(&mut self) -> Result<(), DualNewtonError> {
        if self.n_coupling == 0 {
            return Ok(());
        }
        match self.options.newton_hess_fac_alg {
            FactorizationAlg::BandForward => self.cholesky.solve_forward(
                &self.gradient,
                &mut self.delta_lambda,
                self.options.zero,
            ),
            FactorizationAlg::BandReverse => self.cholesky.solve_reverse(
                &self.gradient,
                &mut self.delta_lambda,
                self.options.zero,
            ),
        }
    }
}
