//! A dual Newton strategy for convex quadratic programs with block-banded
//! optimal control structure.
//!
//! The decision variable decomposes across `N + 1` consecutive stages of
//! fixed dimensions, coupled only by linear dynamics between consecutive
//! stages:
//!
//! ```text
//!   min  sum_k  0.5 z_k' H_k z_k + q_k' z_k + p_k
//!   s.t. x_{k+1} = C_k z_k + c_k          (coupling, k = 0..N-1)
//!        zLow_k <= z_k <= zUpp_k          (simple bounds)
//!        dLow_k <= D_k z_k <= dUpp_k      (general affine rows, optional)
//! ```
//!
//! The coupling equalities are dualized; the resulting concave,
//! piecewise-quadratic dual of the coupling multipliers is maximized by a
//! semismooth Newton method with line search, while primal variables are
//! recovered from decoupled per-stage QPs. The Newton system is
//! block-tridiagonal and handled by a specialized banded Cholesky
//! factorization with numerical safeguards.

use problemo::Problem;

pub type E = f64;
pub type I = usize;

pub mod callback;
pub mod error;
pub mod linalg;
pub mod log;
pub mod newton;
pub mod options;
pub mod problem;
pub mod stage;
pub mod terminators;

#[cfg(test)]
pub mod tests;

pub use error::DualNewtonError;
pub use newton::{DualNewtonSolver, DualNewtonSolverBuilder};
pub use options::{DualNewtonOptions, FactorizationAlg, LineSearchKind, LogLevel, RegStrategy};
pub use problem::{OcpProblem, StageData, StageHessian, StageSolverKind};

/// Status codes for the dual Newton solver.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Status {
    #[default]
    /// The solver is still running.
    InProgress,
    /// An optimal solution was found (stationarity tolerance met).
    Optimal,
    /// The solver stopped due to the outer iteration limit.
    IterationLimit,
    /// A stage QP reported infeasibility.
    Infeasible,
    /// The Newton direction was not an ascent direction for the dual.
    NoAscentDirection,
    /// The solver stopped due to a time limit.
    TimeLimit,
    /// The solver was interrupted (e.g., by user or signal).
    Interrupted,
    /// The status is unknown or not determined.
    Unknown,
}

/// Trait for iterative optimization solvers.
///
/// Provides a standard interface for algorithms that proceed by repeated
/// iteration; termination outcomes are reported as a [`Status`], hard
/// failures as a [`Problem`].
pub trait Solver {
    /// Run the solver until convergence, an iteration limit, or an error.
    fn solve(&mut self, hooks: &mut SolverHooks) -> Result<Status, Problem>;
}

/// Per-solve hooks: a per-iteration callback and a cooperative terminator.
pub struct SolverHooks {
    pub callback: Box<dyn crate::callback::Callback>,
    pub terminator: Box<dyn crate::terminators::Terminator>,
}

impl Default for SolverHooks {
    fn default() -> Self {
        Self {
            callback: Box::new(crate::callback::NoOpCallback {}),
            terminator: Box::new(crate::terminators::NoOpTerminator {}),
        }
    }
}
