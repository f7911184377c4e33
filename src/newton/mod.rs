//! The dual Newton driver.
//!
//! [`DualNewtonSolver`] owns the stage records, the global dual state, the
//! banded Newton system, and the iteration log. One outer iteration runs
//! through: step selection (Newton or pure gradient), factorization of the
//! banded Hessian, back-substitution, stage QP solves along the step
//! direction, line search, and the active-set diff that drives incremental
//! refactorization in the next iteration.

pub mod factor;
pub mod gradient;
pub mod hessian;
pub mod line_search;

use faer::Col;
use problemo::Problem;
use problemo::common::IntoCommonProblem;

use crate::error::{DualNewtonError, FactorizationError};
use crate::linalg::banded::BlockTridiagonal;
use crate::linalg::cholesky::BandedCholesky;
use crate::log::{IterationRecord, IterationSnapshot, SolveLog};
use crate::options::{DualNewtonOptions, LogLevel};
use crate::problem::OcpProblem;
use crate::stage::{STATUS_UNSET, Stage, compare_active_sets, count_active};
use crate::{E, I, Solver, SolverHooks, Status};

pub use hessian::SetupOutcome;
pub use line_search::LineSearchOutcome;
use line_search::LineSearchFailure;

/// Builder for a [`DualNewtonSolver`].
pub struct DualNewtonSolverBuilder {
    problem: Option<OcpProblem>,
    options: DualNewtonOptions,
}

impl DualNewtonSolverBuilder {
    pub fn new() -> Self {
        Self {
            problem: None,
            options: DualNewtonOptions::default(),
        }
    }

    pub fn with_problem(mut self, problem: OcpProblem) -> Self {
        self.problem = Some(problem);
        self
    }

    pub fn with_options(mut self, options: DualNewtonOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<DualNewtonSolver, Problem> {
        let problem = self
            .problem
            .ok_or_else(|| "an optimal control problem must be provided".gloss())?;
        Ok(DualNewtonSolver::new(problem, self.options))
    }
}

impl Default for DualNewtonSolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Dual Newton solver instance.
///
/// Owns all per-solve state and scratch; a single instance is not safe for
/// concurrent `solve` calls. Per-stage trial scratch lives inside the stage
/// records, so the stage QP phase can run in parallel without sharing
/// mutable buffers.
pub struct DualNewtonSolver {
    pub(crate) options: DualNewtonOptions,
    pub(crate) stages: Vec<Stage>,
    pub(crate) nx: I,
    /// Number of coupling equalities `N`.
    pub(crate) n_coupling: I,

    /// Coupling multipliers, length `N * nx`.
    pub(crate) lambda: Col<E>,
    /// Current search direction.
    pub(crate) delta_lambda: Col<E>,
    /// Dual gradient.
    pub(crate) gradient: Col<E>,
    /// Last accepted step size.
    pub(crate) alpha: E,
    /// Incumbent dual objective.
    pub(crate) obj_val: E,

    pub(crate) hessian: BlockTridiagonal,
    pub(crate) cholesky: BandedCholesky,

    /// Largest stage index with an active-set change since the last
    /// factorization; restart point of the reverse Cholesky.
    pub(crate) last_act_set_change: Option<I>,
    /// Whether `cholesky` holds a complete factorization of the current
    /// band; reset when a factorization fails or is skipped.
    pub(crate) factor_valid: bool,
    pub(crate) prev_status: Vec<Vec<i8>>,
    pub(crate) new_status: Vec<Vec<i8>>,
    pub(crate) n_active: I,
    pub(crate) n_changed: I,

    /// Trial gradient scratch of the bisection line search; kept apart from
    /// `gradient`, which belongs to the committed iterate.
    pub(crate) gradient_try: Col<E>,

    pub(crate) log: SolveLog,
}

impl DualNewtonSolver {
    pub fn new(problem: OcpProblem, options: DualNewtonOptions) -> Self {
        let nx = problem.nx();
        let n_coupling = problem.horizon();
        let stages: Vec<Stage> = problem.into_stages().into_iter().map(Stage::new).collect();
        let status_shape: Vec<Vec<i8>> = stages
            .iter()
            .map(|s| vec![STATUS_UNSET; s.n_constraint_rows()])
            .collect();
        let n_dual = n_coupling * nx;
        Self {
            options,
            nx,
            n_coupling,
            lambda: Col::zeros(n_dual),
            delta_lambda: Col::zeros(n_dual),
            gradient: Col::zeros(n_dual),
            alpha: 0.,
            obj_val: 0.,
            hessian: BlockTridiagonal::new(n_coupling, nx),
            cholesky: BandedCholesky::new(n_coupling, nx),
            last_act_set_change: None,
            factor_valid: false,
            prev_status: status_shape.clone(),
            new_status: status_shape,
            n_active: 0,
            n_changed: 0,
            gradient_try: Col::zeros(n_dual),
            log: SolveLog::default(),
            stages,
        }
    }

    pub fn options(&self) -> &DualNewtonOptions {
        &self.options
    }

    pub fn log(&self) -> &SolveLog {
        &self.log
    }

    /// Dual objective at the current iterate.
    pub fn objective_value(&self) -> E {
        self.obj_val
    }

    /// Concatenated per-stage primal solutions `z_k`.
    pub fn primal_solution(&self) -> Col<E> {
        let total: I = self.stages.iter().map(|s| s.nz()).sum();
        let mut z = Col::zeros(total);
        let mut offset = 0;
        for stage in &self.stages {
            for i in 0..stage.nz() {
                z[offset + i] = stage.z[i];
            }
            offset += stage.nz();
        }
        z
    }

    /// Coupling multipliers and concatenated per-stage constraint
    /// multipliers. Stage multipliers are nonnegative lower/upper pairs per
    /// constraint row (bounds first, then general affine rows).
    pub fn dual_solution(&self) -> (Col<E>, Col<E>) {
        let total: I = self.stages.iter().map(|s| 2 * s.n_constraint_rows()).sum();
        let mut y = Col::zeros(total);
        let mut offset = 0;
        for stage in &self.stages {
            for i in 0..2 * stage.n_constraint_rows() {
                y[offset + i] = stage.y[i];
            }
            offset += 2 * stage.n_constraint_rows();
        }
        (self.lambda.clone(), y)
    }

    /// Pins the state part of stage 0 to `x0` (initial value embedding);
    /// honored by the initial resolve of the next `solve` call.
    pub fn embed_initial_state(&mut self, x0: &Col<E>) -> Result<(), Problem> {
        if x0.nrows() != self.nx {
            return Err("initial state does not match the state dimension".gloss().into());
        }
        let stage = &mut self.stages[0];
        for i in 0..x0.nrows() {
            stage.data.z_low[i] = x0[i];
            stage.data.z_upp[i] = x0[i];
        }
        Ok(())
    }

    /// Replaces the linear and constant objective terms of stage `k`.
    pub fn update_stage_objective(&mut self, k: I, q: Col<E>, p: E) -> Result<(), Problem> {
        if k >= self.stages.len() || q.nrows() != self.stages[k].nz() {
            return Err("objective update does not match the stage dimension".gloss().into());
        }
        self.stages[k].data.q = q;
        self.stages[k].data.p = p;
        Ok(())
    }

    /// Runs the per-stage QP phase, possibly in parallel, aggregating
    /// failures in a shared error counter.
    pub(crate) fn for_each_stage<F>(&mut self, f: F) -> I
    where
        F: Fn(&mut Stage) -> Result<(), crate::error::StageError> + Send + Sync,
    {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            use std::sync::atomic::{AtomicUsize, Ordering};
            let errors = AtomicUsize::new(0);
            self.stages.par_iter_mut().for_each(|stage| {
                if f(stage).is_err() {
                    errors.fetch_add(1, Ordering::Relaxed);
                }
            });
            errors.load(Ordering::Relaxed)
        }
        #[cfg(not(feature = "parallel"))]
        {
            let mut errors = 0;
            for stage in self.stages.iter_mut() {
                if f(stage).is_err() {
                    errors += 1;
                }
            }
            errors
        }
    }

    /// Writes the committed multiplier slices into every stage's objective
    /// terms. Sequential; the subsequent stage solves only read them.
    pub(crate) fn update_stage_multipliers(&mut self) {
        let nx = self.nx;
        let n = self.n_coupling;
        let lambda = &self.lambda;
        for (k, stage) in self.stages.iter_mut().enumerate() {
            let lam_in = (k > 0).then(|| lambda.as_ref().subrows((k - 1) * nx, nx));
            let lam_out = (k < n).then(|| lambda.as_ref().subrows(k * nx, nx));
            stage.set_multipliers(lam_in, lam_out);
        }
    }

    /// Registers the pending dual step slices with every stage.
    pub(crate) fn update_stage_directions(&mut self) {
        let nx = self.nx;
        let n = self.n_coupling;
        let delta = &self.delta_lambda;
        for (k, stage) in self.stages.iter_mut().enumerate() {
            let dlam_in = (k > 0).then(|| delta.as_ref().subrows((k - 1) * nx, nx));
            let dlam_out = (k < n).then(|| delta.as_ref().subrows(k * nx, nx));
            stage.set_direction(dlam_in, dlam_out);
        }
    }

    pub(crate) fn compute_objective(&self) -> E {
        self.stages.iter().map(|s| s.objective()).sum()
    }

    /// Accept-phase bookkeeping: extracts the new active set, diffs it
    /// against the previous one, and updates the per-stage change flags and
    /// the restart index.
    pub(crate) fn accept_active_set(&mut self) {
        let eq_tol = self.options.equality_tolerance;
        for (k, stage) in self.stages.iter().enumerate() {
            stage.extract_active_set(&mut self.new_status[k], eq_tol);
        }
        self.n_active = count_active(&self.new_status);
        let (n_changed, last_change) =
            compare_active_sets(&mut self.stages, &self.new_status, &self.prev_status);
        self.n_changed = n_changed;
        self.last_act_set_change = last_change;
        std::mem::swap(&mut self.prev_status, &mut self.new_status);
    }

    fn make_record(&self, iteration: I, ls_iters: I, regularized: bool) -> IterationRecord {
        IterationRecord {
            iteration,
            obj_val: self.obj_val,
            grad_norm: self.gradient.norm_l2(),
            step_norm: self.delta_lambda.norm_l2(),
            step_size: self.alpha,
            lambda_norm: self.lambda.norm_l2(),
            n_line_search_iter: ls_iters,
            n_active_constraints: self.n_active,
            n_changed_constraints: self.n_changed,
            hessian_regularized: regularized,
            last_act_set_change: self.last_act_set_change,
        }
    }

    fn make_snapshot(&self) -> IterationSnapshot {
        IterationSnapshot {
            lambda: self.lambda.clone(),
            delta_lambda: self.delta_lambda.clone(),
            gradient: self.gradient.clone(),
            hessian: self.hessian.data().to_vec(),
            chol_hessian: self.cholesky.factor().data().to_vec(),
            stage_primal: self.stages.iter().map(|s| s.z.clone()).collect(),
        }
    }

    fn finish_iteration(
        &mut self,
        hooks: &mut SolverHooks,
        iteration: I,
        ls_iters: I,
        regularized: bool,
    ) {
        let record = self.make_record(iteration, ls_iters, regularized);
        hooks.callback.call(&record);
        let snapshot =
            (self.options.log_level == LogLevel::AllData).then(|| self.make_snapshot());
        self.log.push(record, snapshot);
    }

    fn run(&mut self, hooks: &mut SolverHooks) -> Result<Status, Problem> {
        self.log.reset(self.options.log_level);
        hooks.terminator.initialize();
        self.alpha = 0.;
        self.last_act_set_change = None;
        for status in self.prev_status.iter_mut() {
            status.fill(STATUS_UNSET);
        }

        // (1) resolve every stage QP at the committed multipliers, honoring
        // possibly updated bounds (initial value embedding on stage 0)
        self.update_stage_multipliers();
        let errors = self.for_each_stage(|stage| stage.resolve());
        self.obj_val = self.compute_objective();
        if errors > 0 {
            self.finish_iteration(hooks, 0, 0, false);
            return Ok(Status::Infeasible);
        }
        self.accept_active_set();
        self.finish_iteration(hooks, 0, 0, false);

        // (2) loop of nonsmooth Newton iterations
        for iteration in 1..=self.options.max_iter {
            let mut regularized = false;

            // (2a) step selection: a few pure gradient steps may be forced
            // after the first Newton step
            let gradient_iteration = iteration > 1
                && iteration - 1 <= self.options.nbr_initial_gradient_steps;
            if gradient_iteration {
                self.assemble_gradient();
                for i in 0..self.delta_lambda.nrows() {
                    self.delta_lambda[i] = self.gradient[i];
                }
            } else {
                match self.setup_newton_system() {
                    SetupOutcome::OptimalFound => {
                        self.finish_iteration(hooks, iteration, 0, false);
                        return Ok(Status::Optimal);
                    }
                    SetupOutcome::Assembled => {}
                }

                // (2b) factorize, then back-substitute for the step
                match self.factor_newton_hessian(&mut regularized) {
                    Ok(()) => {
                        if let Err(err) = self.solve_newton_system() {
                            self.finish_iteration(hooks, iteration, 0, regularized);
                            return Err(err.into());
                        }
                    }
                    Err(FactorizationError::GradientStepRequested) => {
                        // the regularization policy gave up on the Newton
                        // step; ascend along the gradient this iteration
                        for i in 0..self.delta_lambda.nrows() {
                            self.delta_lambda[i] = self.gradient[i];
                        }
                    }
                    Err(_) => {
                        self.finish_iteration(hooks, iteration, 0, regularized);
                        return Err(DualNewtonError::FactorizationFailed.into());
                    }
                }
            }

            // (2c) stage QP solves for the full step, in parallel
            self.update_stage_directions();
            let errors = self.for_each_stage(|stage| stage.solve_direction());
            if errors > 0 {
                self.finish_iteration(hooks, iteration, 0, regularized);
                return Ok(Status::Infeasible);
            }

            if self.options.check_for_infeasibility {
                // infeasibility detection is not implemented; the iteration
                // proceeds unconditionally
            }

            // (2d) line search along the step direction, then commit
            let ls_iters = match self.determine_step_length(regularized) {
                Ok((iters, _outcome)) => iters,
                Err(LineSearchFailure::MinStepSizeDeceeded) => {
                    self.alpha = 0.;
                    self.finish_iteration(hooks, iteration, 0, regularized);
                    return Ok(Status::NoAscentDirection);
                }
                Err(LineSearchFailure::StageFailure) => {
                    self.finish_iteration(hooks, iteration, 0, regularized);
                    return Ok(Status::Infeasible);
                }
            };

            // (2e) accept: active-set diff, bookkeeping, log
            self.accept_active_set();
            self.finish_iteration(hooks, iteration, ls_iters, regularized);

            if let Some(status) = hooks.terminator.terminate() {
                return Ok(status);
            }
        }

        Ok(Status::IterationLimit)
    }
}

impl Solver for DualNewtonSolver {
    fn solve(&mut self, hooks: &mut SolverHooks) -> Result<Status, Problem> {
        self.run(hooks)
    }
}
