use derive_more::{Display, Error};

/// Error kinds surfaced by the dual Newton driver.
#[derive(Debug, Display, Error, PartialEq, Eq, Clone, Copy)]
pub enum DualNewtonError {
    #[display("Invalid problem data or solver configuration")]
    InvalidArgument,

    #[display("Setup of the Newton system failed")]
    NewtonSetupFailed,

    #[display("Factorization of the Newton Hessian failed")]
    FactorizationFailed,

    #[display("Division by zero in banded back-substitution")]
    DivisionByZero,

    #[display("Unknown line search type")]
    UnknownLineSearchType,

    #[display("Unknown error")]
    Unknown,
}

/// Failures of the banded Cholesky factorization and its regularization
/// policy.
#[derive(Debug, Display, Error, PartialEq, Eq, Clone, Copy)]
pub enum FactorizationError {
    /// A diagonal pivot fell below the regularization tolerance and the
    /// active policy could not repair it.
    #[display("Newton Hessian is not positive definite")]
    IndefiniteHessian,

    /// The `GradientStep` policy requests a pure gradient step for this
    /// iteration instead of a Newton step.
    #[display("Gradient step requested by the regularization policy")]
    GradientStepRequested,

    #[display("Deprecated regularization strategy")]
    DeprecatedStrategy,

    #[display("Regularization strategy not implemented")]
    UnimplementedStrategy,
}

/// Failures of a per-stage QP solve.
#[derive(Debug, Display, Error, PartialEq, Eq, Clone, Copy)]
pub enum StageError {
    #[display("Stage QP is infeasible")]
    Infeasible,

    #[display("Stage QP Hessian is singular on the free subspace")]
    SingularReducedHessian,
}
