//! Solver configuration.
//!
//! All numerical controls of the dual Newton strategy live in
//! [`DualNewtonOptions`]. The struct is plain data with public fields; the
//! `with_*` setters exist for chaining when building a solver.

use serde::Serialize;

use crate::{E, I};

/// Direction of the banded block-tridiagonal Cholesky factorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FactorizationAlg {
    /// Top-down factorization; always refactorizes the full band.
    BandForward,
    /// Bottom-up factorization; supports partial refactorization restarting
    /// from the last stage with an active-set change.
    BandReverse,
}

/// Regularization strategy applied when a diagonal pivot of the Newton
/// Hessian falls below [`DualNewtonOptions::newton_hess_diag_reg_tolerance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegStrategy {
    /// Add `reg_param` to the Hessian diagonal and refactorize from scratch.
    LevenbergMarquardt,
    /// Regularize offending pivots on the fly inside the factorization; the
    /// affected rows are recorded so back-substitution zeroes their
    /// contribution to the step.
    SingularDirections,
    /// Give up on the Newton step for this iteration and take a pure
    /// gradient step instead.
    GradientStep,
    /// Deprecated; rejected with an error.
    NormalizedLevenbergMarquardt,
    /// Not implemented; rejected with an error.
    UnconstrainedHessian,
}

/// Line search strategy over the concave dual along the Newton direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LineSearchKind {
    /// Armijo-style backtracking from the full step.
    Backtracking,
    /// Backtracking, then the step is snapped up to the smallest step that
    /// changes an active set, so new curvature information is obtained.
    BacktrackingAsChange,
    /// Golden section interval reduction on the dual value.
    GoldenSection,
    /// Bisection on the directional derivative of the dual.
    GradientBisection,
    /// Evaluate the dual on an equally spaced grid and keep the best point.
    Grid,
    /// Backtracking to shrink the interval, then gradient bisection.
    AcceleratedGradientBisection,
    /// Backtracking to shrink the interval, then grid search.
    AcceleratedGrid,
}

/// Amount of per-iteration data retained in the solve log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum LogLevel {
    /// Keep nothing.
    None,
    /// Keep per-iteration scalars.
    #[default]
    Iterations,
    /// Keep scalars plus full snapshots of the dual state, the Newton
    /// system, and the per-stage primal vectors.
    AllData,
}

/// Options for the dual Newton solver.
#[derive(Debug, Clone, Serialize)]
pub struct DualNewtonOptions {
    /// Cap on outer Newton iterations.
    pub max_iter: I,
    /// Number of pure gradient iterations forced after the first Newton
    /// step.
    pub nbr_initial_gradient_steps: I,

    /// Factorization direction for the Newton Hessian.
    pub newton_hess_fac_alg: FactorizationAlg,
    /// Regularization strategy for near-singular Newton Hessians.
    pub reg_type: RegStrategy,
    /// Magnitude of the diagonal regularization.
    pub reg_param: E,
    /// Pivot threshold triggering regularization.
    pub newton_hess_diag_reg_tolerance: E,

    /// Gradient-norm convergence threshold of the outer loop.
    pub stationarity_tolerance: E,
    /// Tolerance for equality-like comparisons (active multipliers, full
    /// step detection).
    pub equality_tolerance: E,
    /// Smallest magnitude treated as nonzero in pivot divisions.
    pub zero: E,
    /// Large sentinel standing in for infinity.
    pub infinity: E,

    /// Line search algorithm.
    pub line_search_kind: LineSearchKind,
    /// Backtracking reduction ratio.
    pub line_search_reduction_factor: E,
    /// Interval expansion ratio of the gradient bisection search.
    pub line_search_increase_factor: E,
    /// Absolute dual progress demanded per accepted step.
    pub line_search_min_abs_progress: E,
    /// Relative dual progress demanded per accepted step.
    pub line_search_min_rel_progress: E,
    /// Stationarity tolerance on the (normalized) directional derivative.
    pub line_search_stationarity_tolerance: E,
    /// Largest step length the bisection search may expand to.
    pub line_search_max_step_size: E,
    /// Number of grid points of the grid search.
    pub line_search_nbr_grid_points: I,
    /// Iteration cap of the backtracking searches.
    pub max_num_line_search_iterations: I,
    /// Iteration cap of the interval refinement searches.
    pub max_num_line_search_refinement_iterations: I,

    /// Amount of data retained in the solve log.
    pub log_level: LogLevel,
    /// Verbosity of the convergence output callback.
    pub print_level: I,
    /// Reprint the iteration table header every this many iterations.
    pub print_interval_header: I,
    /// Print per-iteration phase timings.
    pub print_iteration_timing: bool,
    /// Run the (stubbed) infeasibility check each iteration.
    pub check_for_infeasibility: bool,
}

impl Default for DualNewtonOptions {
    fn default() -> Self {
        Self {
            max_iter: 100,
            nbr_initial_gradient_steps: 0,

            newton_hess_fac_alg: FactorizationAlg::BandReverse,
            reg_type: RegStrategy::LevenbergMarquardt,
            reg_param: 1e-6,
            newton_hess_diag_reg_tolerance: 1e-10,

            stationarity_tolerance: 1e-6,
            equality_tolerance: 2.221e-16,
            zero: 1e-50,
            infinity: 1e12,

            line_search_kind: LineSearchKind::AcceleratedGradientBisection,
            line_search_reduction_factor: 0.1,
            line_search_increase_factor: 1.5,
            line_search_min_abs_progress: 2.221e-16,
            line_search_min_rel_progress: 1e-14,
            line_search_stationarity_tolerance: 1e-3,
            line_search_max_step_size: 1.,
            line_search_nbr_grid_points: 5,
            max_num_line_search_iterations: 19,
            max_num_line_search_refinement_iterations: 49,

            log_level: LogLevel::Iterations,
            print_level: 0,
            print_interval_header: 20,
            print_iteration_timing: false,
            check_for_infeasibility: false,
        }
    }
}

impl DualNewtonOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iter(mut self, max_iter: I) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_initial_gradient_steps(mut self, steps: I) -> Self {
        self.nbr_initial_gradient_steps = steps;
        self
    }

    pub fn with_factorization(mut self, alg: FactorizationAlg) -> Self {
        self.newton_hess_fac_alg = alg;
        self
    }

    pub fn with_regularization(mut self, reg_type: RegStrategy, reg_param: E) -> Self {
        self.reg_type = reg_type;
        self.reg_param = reg_param;
        self
    }

    pub fn with_line_search(mut self, kind: LineSearchKind) -> Self {
        self.line_search_kind = kind;
        self
    }

    pub fn with_stationarity_tolerance(mut self, tolerance: E) -> Self {
        self.stationarity_tolerance = tolerance;
        self
    }

    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }
}
