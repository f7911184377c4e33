//! Problem setup for block-banded optimal control QPs.
//!
//! An [`OcpProblem`] owns `N + 1` consecutive [`StageData`] records. Stage
//! `k < N` carries a coupling block `(C, c)` predicting the next state from
//! the stacked stage variable `z = (x, u)`; the terminal stage carries none.

use faer::{Col, Mat};
use problemo::Problem;
use problemo::common::IntoCommonProblem;

use crate::newton::DualNewtonSolverBuilder;
use crate::{E, I};

/// Per-stage QP solver kind, chosen at setup and fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSolverKind {
    /// Closed-form bound clipping; requires a diagonal stage Hessian and no
    /// general affine rows.
    Clipping,
    /// Dense active-set QP engine; handles general affine rows.
    General,
}

/// Stage Hessian storage. Clipping stages are restricted to the diagonal
/// variant.
#[derive(Debug, Clone)]
pub enum StageHessian {
    Diagonal(Col<E>),
    Dense(Mat<E>),
}

impl StageHessian {
    pub fn dim(&self) -> I {
        match self {
            StageHessian::Diagonal(d) => d.nrows(),
            StageHessian::Dense(m) => m.nrows(),
        }
    }

    /// `H z`
    pub fn mul_vec(&self, z: &Col<E>) -> Col<E> {
        match self {
            StageHessian::Diagonal(d) => Col::from_fn(d.nrows(), |i| d[i] * z[i]),
            StageHessian::Dense(m) => m * z,
        }
    }

    /// `z' H z`
    pub fn quad_form(&self, z: &Col<E>) -> E {
        crate::linalg::vector_ops::dot(self.mul_vec(z).as_ref(), z.as_ref())
    }
}

/// Data of one stage `k` of the horizon.
///
/// Dimensions: `nx` states, `nu` controls (`0` for the terminal stage),
/// `nz = nx + nu` stacked variables, `nd` general affine rows.
#[allow(non_snake_case)]
#[derive(Debug, Clone)]
pub struct StageData {
    pub nx: I,
    pub nu: I,

    /// Stage Hessian (positive semidefinite, `nz x nz`).
    pub H: StageHessian,
    /// Linear objective term.
    pub q: Col<E>,
    /// Constant objective term.
    pub p: E,

    /// Coupling block (`nx x nz`) producing the predicted next state;
    /// absent on the terminal stage.
    pub C: Option<Mat<E>>,
    /// Coupling offset (`nx`); absent on the terminal stage.
    pub c: Option<Col<E>>,

    /// Simple lower bounds on the stacked variable.
    pub z_low: Col<E>,
    /// Simple upper bounds on the stacked variable.
    pub z_upp: Col<E>,

    /// General affine constraint rows (`nd x nz`), optional.
    pub D: Option<Mat<E>>,
    pub d_low: Option<Col<E>>,
    pub d_upp: Option<Col<E>>,

    pub solver_kind: StageSolverKind,
}

#[allow(non_snake_case)]
impl StageData {
    /// Creates a clipping stage from a diagonal Hessian and simple bounds.
    /// `coupling` is `Some((C, c))` for every stage but the terminal one.
    pub fn clipping(
        nx: I,
        nu: I,
        h_diag: Col<E>,
        q: Col<E>,
        p: E,
        coupling: Option<(Mat<E>, Col<E>)>,
        z_low: Col<E>,
        z_upp: Col<E>,
    ) -> Self {
        let (C, c) = match coupling {
            Some((C, c)) => (Some(C), Some(c)),
            None => (None, None),
        };
        Self {
            nx,
            nu,
            H: StageHessian::Diagonal(h_diag),
            q,
            p,
            C,
            c,
            z_low,
            z_upp,
            D: None,
            d_low: None,
            d_upp: None,
            solver_kind: StageSolverKind::Clipping,
        }
    }

    /// Creates a general stage with a dense Hessian and optional affine rows
    /// `affine = (D, dLow, dUpp)`.
    pub fn general(
        nx: I,
        nu: I,
        H: Mat<E>,
        q: Col<E>,
        p: E,
        coupling: Option<(Mat<E>, Col<E>)>,
        z_low: Col<E>,
        z_upp: Col<E>,
        affine: Option<(Mat<E>, Col<E>, Col<E>)>,
    ) -> Self {
        let (C, c) = match coupling {
            Some((C, c)) => (Some(C), Some(c)),
            None => (None, None),
        };
        let (D, d_low, d_upp) = match affine {
            Some((D, d_low, d_upp)) => (Some(D), Some(d_low), Some(d_upp)),
            None => (None, None, None),
        };
        Self {
            nx,
            nu,
            H: StageHessian::Dense(H),
            q,
            p,
            C,
            c,
            z_low,
            z_upp,
            D,
            d_low,
            d_upp,
            solver_kind: StageSolverKind::General,
        }
    }

    /// Stacked variable dimension `nx + nu`.
    pub fn nz(&self) -> I {
        self.nx + self.nu
    }

    /// Number of general affine rows.
    pub fn nd(&self) -> I {
        self.D.as_ref().map_or(0, |d| d.nrows())
    }

    fn validate(&self, nx: I, is_terminal: bool) -> Result<(), Problem> {
        let nz = self.nz();
        if self.nx != nx {
            return Err("state dimension differs across stages".gloss().into());
        }
        if self.H.dim() != nz || self.q.nrows() != nz {
            return Err("stage objective dimension does not match nx + nu".gloss().into());
        }
        if self.z_low.nrows() != nz || self.z_upp.nrows() != nz {
            return Err("stage bound dimension does not match nx + nu".gloss().into());
        }
        for i in 0..nz {
            if self.z_low[i] > self.z_upp[i] {
                return Err("stage lower bound exceeds upper bound".gloss().into());
            }
        }
        match (is_terminal, &self.C, &self.c) {
            (false, Some(C), Some(c)) => {
                if C.nrows() != nx || C.ncols() != nz || c.nrows() != nx {
                    return Err("coupling block dimension does not match nx x (nx + nu)".gloss().into());
                }
            }
            (true, None, None) => {
                if self.nu != 0 {
                    return Err("terminal stage must not carry controls".gloss().into());
                }
            }
            (false, ..) => return Err("non-terminal stage is missing its coupling block".gloss().into()),
            (true, ..) => return Err("terminal stage must not carry a coupling block".gloss().into()),
        }
        if let Some(D) = &self.D {
            let nd = D.nrows();
            if D.ncols() != nz {
                return Err("affine row dimension does not match nx + nu".gloss().into());
            }
            match (&self.d_low, &self.d_upp) {
                (Some(l), Some(u)) if l.nrows() == nd && u.nrows() == nd => {}
                _ => return Err("affine row bounds do not match the row count".gloss().into()),
            }
        }
        if self.solver_kind == StageSolverKind::Clipping {
            match &self.H {
                StageHessian::Diagonal(d) => {
                    for i in 0..nz {
                        if d[i] <= 0. {
                            return Err("clipping stages require a positive diagonal Hessian".gloss().into());
                        }
                    }
                }
                StageHessian::Dense(_) => {
                    return Err("clipping stages require a diagonal Hessian".gloss().into());
                }
            }
            if self.nd() != 0 {
                return Err("clipping stages cannot carry general affine rows".gloss().into());
            }
        }
        Ok(())
    }
}

/// A block-banded optimal control QP over `N + 1` stages.
pub struct OcpProblem {
    stages: Vec<StageData>,
    nx: I,
}

impl OcpProblem {
    /// Validates the stage records and assembles the problem. A single
    /// stage is a degenerate problem without coupling equalities.
    pub fn new(stages: Vec<StageData>) -> Result<Self, Problem> {
        if stages.is_empty() {
            return Err("an optimal control problem requires at least one stage".gloss().into());
        }
        let nx = stages[0].nx;
        let last = stages.len() - 1;
        for (k, stage) in stages.iter().enumerate() {
            stage.validate(nx, k == last)?;
        }
        Ok(Self { stages, nx })
    }

    /// Number of stages `N + 1`.
    pub fn num_stages(&self) -> I {
        self.stages.len()
    }

    /// Horizon length `N` (the number of coupling equalities).
    pub fn horizon(&self) -> I {
        self.stages.len() - 1
    }

    pub fn nx(&self) -> I {
        self.nx
    }

    pub fn stage(&self, k: I) -> &StageData {
        &self.stages[k]
    }

    pub(crate) fn into_stages(self) -> Vec<StageData> {
        self.stages
    }

    /// Replaces the linear and constant objective terms of stage `k`.
    pub fn update_objective(&mut self, k: I, q: Col<E>, p: E) -> Result<(), Problem> {
        if k >= self.stages.len() || q.nrows() != self.stages[k].nz() {
            return Err("objective update does not match the stage dimension".gloss().into());
        }
        self.stages[k].q = q;
        self.stages[k].p = p;
        Ok(())
    }

    /// Replaces the simple bounds of stage `k`.
    pub fn update_bounds(&mut self, k: I, z_low: Col<E>, z_upp: Col<E>) -> Result<(), Problem> {
        if k >= self.stages.len()
            || z_low.nrows() != self.stages[k].nz()
            || z_upp.nrows() != self.stages[k].nz()
        {
            return Err("bound update does not match the stage dimension".gloss().into());
        }
        self.stages[k].z_low = z_low;
        self.stages[k].z_upp = z_upp;
        Ok(())
    }

    /// Initial value embedding: pins the state part of stage 0 to `x0` by
    /// tight equal bounds, consumed by the next per-stage resolve.
    pub fn embed_initial_state(&mut self, x0: &Col<E>) -> Result<(), Problem> {
        if x0.nrows() != self.nx {
            return Err("initial state does not match the state dimension".gloss().into());
        }
        let stage = &mut self.stages[0];
        for i in 0..self.nx {
            stage.z_low[i] = x0[i];
            stage.z_upp[i] = x0[i];
        }
        Ok(())
    }

    /// Starts building a dual Newton solver for this problem.
    pub fn solver_builder(self) -> DualNewtonSolverBuilder {
        DualNewtonSolverBuilder::new().with_problem(self)
    }
}
