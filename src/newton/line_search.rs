//! Step length determination over the concave, piecewise-quadratic dual.
//!
//! All trial evaluations are side-effect-free: the stage solvers evaluate
//! candidate primals into per-stage trial buffers. Only the accepted step is
//! committed, advancing `lambda`, every stage's `(z, y, q, p)`, and the
//! incumbent objective.

use crate::linalg::vector_ops::{axpy, dot};
use crate::newton::DualNewtonSolver;
use crate::options::{DualNewtonOptions, LineSearchKind};
use crate::{E, I};

/// Non-fatal termination of a line search; the last step length tried is
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSearchOutcome {
    Converged,
    IterationLimit,
    StepSizeLimit,
}

/// Fatal line search conditions, surfaced to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineSearchFailure {
    /// No ascent within the minimum step size; the direction is unusable.
    MinStepSizeDeceeded,
    /// A stage solver failed during a trial or commit.
    StageFailure,
}

impl DualNewtonSolver {
    /// Determines the step length along `delta_lambda` and commits it.
    /// Returns the number of line search iterations spent.
    pub(crate) fn determine_step_length(
        &mut self,
        hessian_regularized: bool,
    ) -> Result<(I, LineSearchOutcome), LineSearchFailure> {
        let opts = self.options.clone();
        let mut iters: I = 0;
        let alpha_max: E = 1.;

        // smallest step at which any stage's active set changes; stays at
        // the infinity sentinel when no stage can report one (general
        // stages)
        let mut alpha_min = opts.infinity;
        for stage in &self.stages {
            alpha_min = E::min(alpha_min, stage.min_step_to_active_set_change());
        }

        // the dual is quadratic on [0, alpha_min]; take the full step
        // unconditionally if no active-set change can occur before it
        if alpha_min > 1. - opts.equality_tolerance && !hessian_regularized {
            self.commit(1.)?;
            return Ok((0, LineSearchOutcome::Converged));
        }

        // lower end of the interval searches
        let alpha_floor = if alpha_min < alpha_max { alpha_min } else { 0. };
        let incumbent = self.obj_val;

        let (alpha, outcome) = match opts.line_search_kind {
            LineSearchKind::Backtracking => {
                self.backtracking_search(&opts, &mut iters, 0., alpha_max, incumbent)?
            }
            LineSearchKind::BacktrackingAsChange => {
                let (mut alpha, outcome) =
                    self.backtracking_search(&opts, &mut iters, 0., alpha_max, incumbent)?;
                // ensure at least one active-set change, so the next Newton
                // system carries new curvature information
                if alpha_min < 1. - opts.equality_tolerance && alpha < alpha_min {
                    alpha = alpha_min;
                }
                (alpha, outcome)
            }
            LineSearchKind::GoldenSection => {
                self.golden_section_search(&opts, &mut iters, alpha_floor, alpha_max)?
            }
            LineSearchKind::GradientBisection => {
                self.bisection_search(&opts, &mut iters, alpha_floor, alpha_max)?
            }
            LineSearchKind::Grid => {
                self.grid_search(&opts, &mut iters, alpha_floor, alpha_max)?
            }
            LineSearchKind::AcceleratedGradientBisection => {
                let (alpha, _) =
                    self.backtracking_search(&opts, &mut iters, 0., alpha_max, incumbent)?;
                // resume from the last step that did not yet ascend
                let shrunk = E::min(alpha_max, alpha / opts.line_search_reduction_factor);
                self.bisection_search(&opts, &mut iters, alpha_floor, shrunk)?
            }
            LineSearchKind::AcceleratedGrid => {
                let (alpha, _) =
                    self.backtracking_search(&opts, &mut iters, 0., alpha_max, incumbent)?;
                let shrunk = E::min(alpha_max, alpha / opts.line_search_reduction_factor);
                self.grid_search(&opts, &mut iters, alpha_floor, shrunk)?
            }
        };

        self.commit(alpha)?;
        Ok((iters, outcome))
    }

    /// Dual objective at trial step `alpha`, without committing.
    pub(crate) fn parametric_objective(&mut self, alpha: E) -> Result<E, LineSearchFailure> {
        let mut obj = 0.;
        for stage in self.stages.iter_mut() {
            obj += stage
                .parametric_objective(alpha)
                .map_err(|_| LineSearchFailure::StageFailure)?;
        }
        Ok(obj)
    }

    /// Directional derivative `gradient(lambda + alpha dlambda)' dlambda`
    /// from the per-stage trial primals.
    fn directional_derivative(&mut self, alpha: E) -> Result<E, LineSearchFailure> {
        for stage in self.stages.iter_mut() {
            stage.trial(alpha).map_err(|_| LineSearchFailure::StageFailure)?;
        }
        self.assemble_trial_gradient();
        Ok(dot(self.gradient_try.as_ref(), self.delta_lambda.as_ref()))
    }

    /// Accepts `alpha`: advances the dual iterate, every stage, and the
    /// incumbent objective.
    fn commit(&mut self, alpha: E) -> Result<(), LineSearchFailure> {
        self.alpha = alpha;
        axpy(self.lambda.as_mut(), alpha, self.delta_lambda.as_ref());
        let mut failed = false;
        for stage in self.stages.iter_mut() {
            if stage.commit_step(alpha).is_err() {
                failed = true;
            }
        }
        if failed {
            return Err(LineSearchFailure::StageFailure);
        }
        self.obj_val = self.compute_objective();
        Ok(())
    }

    /// Armijo-style backtracking from `alpha_max`.
    fn backtracking_search(
        &mut self,
        opts: &DualNewtonOptions,
        iters: &mut I,
        alpha_min: E,
        alpha_max: E,
        incumbent: E,
    ) -> Result<(E, LineSearchOutcome), LineSearchFailure> {
        let min_progress = opts.line_search_min_rel_progress * incumbent.abs()
            + opts.line_search_min_abs_progress;
        let norm_delta = self.delta_lambda.norm_l2();
        let mut alpha = alpha_max;

        while *iters < opts.max_num_line_search_iterations {
            *iters += 1;
            let obj = self.parametric_objective(alpha)?;
            if obj > incumbent + min_progress {
                return Ok((alpha, LineSearchOutcome::Converged));
            }
            alpha *= opts.line_search_reduction_factor;

            if norm_delta * (alpha - alpha_min) < opts.equality_tolerance {
                return Err(LineSearchFailure::MinStepSizeDeceeded);
            }
        }
        Ok((alpha, LineSearchOutcome::IterationLimit))
    }

    /// Golden section interval reduction on `[alpha_min, alpha_max]`;
    /// stationarity is measured on consecutive-sample second differences.
    fn golden_section_search(
        &mut self,
        opts: &DualNewtonOptions,
        iters: &mut I,
        alpha_min: E,
        alpha_max: E,
    ) -> Result<(E, LineSearchOutcome), LineSearchFailure> {
        const GOLD: E = 0.618_033_988_7;
        let cap = opts.max_num_line_search_refinement_iterations;

        let mut a_ll = alpha_min;
        let mut a_rr = alpha_max;
        let mut obj_ll = self.parametric_objective(a_ll)?;
        let mut obj_rr = self.parametric_objective(a_rr)?;

        // push the interior points until they dominate the interval ends
        let mut a_l = a_rr - GOLD * (a_rr - a_ll);
        let mut obj_l = self.parametric_objective(a_l)?;
        while *iters < cap && obj_ll > obj_l {
            *iters += 1;
            a_rr = a_l;
            obj_rr = obj_l;
            a_l = a_rr - GOLD * (a_rr - a_ll);
            obj_l = self.parametric_objective(a_l)?;
        }
        let mut a_r = a_ll + GOLD * (a_rr - a_ll);
        let mut obj_r = self.parametric_objective(a_r)?;
        while *iters < cap && obj_rr > obj_r {
            *iters += 1;
            a_ll = a_r;
            obj_ll = obj_r;
            a_r = a_ll + GOLD * (a_rr - a_ll);
            obj_r = self.parametric_objective(a_r)?;
        }

        let mut last = a_r;
        while *iters < cap {
            *iters += 1;
            if 2. * obj_l - obj_r - obj_ll <= 2. * opts.line_search_stationarity_tolerance
                || 2. * obj_r - obj_l - obj_rr <= 2. * opts.line_search_stationarity_tolerance
            {
                return Ok((last, LineSearchOutcome::Converged));
            }
            if obj_l >= obj_r {
                // throw out the right interval
                a_rr = a_r;
                obj_rr = obj_r;
                a_r = a_l;
                obj_r = obj_l;
                a_l = a_rr - GOLD * (a_rr - a_ll);
                obj_l = self.parametric_objective(a_l)?;
                last = a_l;
            } else {
                a_ll = a_l;
                obj_ll = obj_l;
                a_l = a_r;
                obj_l = obj_r;
                a_r = a_ll + GOLD * (a_rr - a_ll);
                obj_r = self.parametric_objective(a_r)?;
                last = a_r;
            }
        }
        Ok((last, LineSearchOutcome::IterationLimit))
    }

    /// Bisection on the directional derivative. The interval is first
    /// inflated while the derivative at `alpha_max` still ascends, then
    /// halved toward the sign change.
    fn bisection_search(
        &mut self,
        opts: &DualNewtonOptions,
        iters: &mut I,
        mut alpha_min: E,
        mut alpha_max: E,
    ) -> Result<(E, LineSearchOutcome), LineSearchFailure> {
        let cap = opts.max_num_line_search_refinement_iterations;
        // demand more stationarity for smaller steps
        let normalization = E::min(1., self.delta_lambda.norm_l2());

        loop {
            if *iters >= cap {
                return Ok((alpha_max, LineSearchOutcome::IterationLimit));
            }
            *iters += 1;
            let slope = self.directional_derivative(alpha_max)?;
            if (slope / normalization).abs() <= opts.line_search_stationarity_tolerance {
                return Ok((alpha_max, LineSearchOutcome::Converged));
            }
            if slope / normalization < 0. {
                break;
            }
            // the full trial step still ascends
            alpha_min = alpha_max;
            alpha_max *= opts.line_search_increase_factor;
            if alpha_max > opts.line_search_max_step_size {
                return Ok((alpha_min, LineSearchOutcome::StepSizeLimit));
            }
        }

        let mut alpha_c = 0.5 * (alpha_min + alpha_max);
        while *iters < cap {
            *iters += 1;
            alpha_c = 0.5 * (alpha_min + alpha_max);
            let slope = self.directional_derivative(alpha_c)?;
            if (slope / normalization).abs() <= opts.line_search_stationarity_tolerance {
                return Ok((alpha_c, LineSearchOutcome::Converged));
            }
            if slope > 0. {
                alpha_min = alpha_c;
            } else {
                alpha_max = alpha_c;
            }
        }
        Ok((alpha_c, LineSearchOutcome::IterationLimit))
    }

    /// Evaluates the dual on an equally spaced grid and keeps the best
    /// point.
    fn grid_search(
        &mut self,
        opts: &DualNewtonOptions,
        iters: &mut I,
        alpha_min: E,
        alpha_max: E,
    ) -> Result<(E, LineSearchOutcome), LineSearchFailure> {
        let n = opts.line_search_nbr_grid_points.max(2);
        let mut best_alpha = alpha_min;
        let mut best_obj = E::NEG_INFINITY;
        for k in 0..n {
            let alpha = alpha_min + (k as E) * (alpha_max - alpha_min) / ((n - 1) as E);
            let obj = self.parametric_objective(alpha)?;
            if obj > best_obj {
                best_obj = obj;
                best_alpha = alpha;
            }
        }
        *iters += n;
        Ok((best_alpha, LineSearchOutcome::Converged))
    }
}
