//! Per-stage QP records and solvers.
//!
//! Each stage owns its problem data, its solver (a sum type over the two
//! solver kinds), the current primal/dual iterates, and the scratch needed
//! for trial evaluations. The uniform capability set is dispatched through
//! [`StageSolverOps`]; kind-specific capabilities (minimum step to an
//! active-set change, null-space extraction) are reached by matching on the
//! solver tag.

pub mod clipping;
pub mod dense;

use enum_dispatch::enum_dispatch;
use faer::{Col, ColRef};

use crate::error::StageError;
use crate::linalg::vector_ops::{axpy, dot};
use crate::problem::{StageData, StageSolverKind};
use crate::{E, I};

pub(crate) use clipping::ClippingSolver;
pub(crate) use dense::DenseStageSolver;

/// Active-set status value standing for "never compared"; forces a full
/// first factorization.
pub(crate) const STATUS_UNSET: i8 = i8::MIN;

/// Uniform capability set of the per-stage QP solvers.
#[enum_dispatch]
pub(crate) trait StageSolverOps {
    /// Solves for the primal response to the pending first-order step
    /// `q_step` on top of the current linear term `q_cur`.
    fn solve_direction(
        &mut self,
        data: &StageData,
        q_cur: &Col<E>,
        q_step: &Col<E>,
    ) -> Result<(), StageError>;

    /// Fresh solve at the current linear term; writes `z` and `y`.
    fn resolve(
        &mut self,
        data: &StageData,
        q_cur: &Col<E>,
        z: &mut Col<E>,
        y: &mut Col<E>,
    ) -> Result<(), StageError>;

    /// Advances the stage by step length `alpha` along the registered
    /// direction; `q_new` is the already stepped linear term. Writes `z`
    /// and `y`.
    fn commit_step(
        &mut self,
        data: &StageData,
        alpha: E,
        q_new: &Col<E>,
        z: &mut Col<E>,
        y: &mut Col<E>,
    ) -> Result<(), StageError>;

    /// Primal at trial step length `alpha`, without committing any state.
    fn trial_primal(
        &self,
        data: &StageData,
        alpha: E,
        q_cur: &Col<E>,
        q_step: &Col<E>,
        z_out: &mut Col<E>,
    ) -> Result<(), StageError>;

    /// Smallest `alpha > 0` at which the stage's active set changes.
    /// Returns infinity when not computable for this solver kind.
    fn min_step_to_active_set_change(&self, data: &StageData) -> E;
}

#[enum_dispatch(StageSolverOps)]
pub(crate) enum StageSolver {
    Clipping(ClippingSolver),
    Dense(DenseStageSolver),
}

/// One stage of the horizon: problem data, solver, iterates, and scratch.
pub(crate) struct Stage {
    pub data: StageData,
    pub solver: StageSolver,

    /// Current stage primal.
    pub z: Col<E>,
    /// Constraint multipliers as lower/upper pairs per row, length
    /// `2 * (nz + nd)`.
    pub y: Col<E>,

    /// Multiplier-adjusted linear objective term.
    pub q_cur: Col<E>,
    /// Multiplier-adjusted constant objective term.
    pub p_cur: E,
    /// Pending first-order step induced by the dual search direction.
    pub q_step: Col<E>,
    pub p_step: E,

    /// Trial primal scratch, written by line search evaluations only.
    pub z_tmp: Col<E>,

    /// Set by the active-set diff of the accept phase; consumed by the
    /// Newton setup block reuse.
    pub act_set_changed: bool,
}

impl Stage {
    pub fn new(data: StageData) -> Self {
        let nz = data.nz();
        let nd = data.nd();
        let solver = match data.solver_kind {
            StageSolverKind::Clipping => StageSolver::Clipping(ClippingSolver::new(&data)),
            StageSolverKind::General => StageSolver::Dense(DenseStageSolver::new(&data)),
        };
        Self {
            solver,
            z: Col::zeros(nz),
            y: Col::zeros(2 * (nz + nd)),
            q_cur: data.q.clone(),
            p_cur: data.p,
            q_step: Col::zeros(nz),
            p_step: 0.,
            z_tmp: Col::zeros(nz),
            act_set_changed: true,
            data,
        }
    }

    pub fn nz(&self) -> I {
        self.data.nz()
    }

    /// Number of constraint rows tracked in the active set.
    pub fn n_constraint_rows(&self) -> I {
        self.data.nz() + self.data.nd()
    }

    /// Rebuilds the multiplier-adjusted objective terms from the coupling
    /// multiplier slices:
    /// `q = q0 + C' lambda_out - E' lambda_in`, `p = p0 + lambda_out' c`.
    pub fn set_multipliers(&mut self, lam_in: Option<ColRef<'_, E>>, lam_out: Option<ColRef<'_, E>>) {
        let nz = self.data.nz();
        let nx = self.data.nx;
        for i in 0..nz {
            self.q_cur[i] = self.data.q[i];
        }
        self.p_cur = self.data.p;
        if let (Some(lam), Some(c_mat)) = (lam_out, self.data.C.as_ref()) {
            for j in 0..nz {
                let mut sum = 0.;
                for i in 0..nx {
                    sum += c_mat[(i, j)] * lam[i];
                }
                self.q_cur[j] += sum;
            }
            self.p_cur += dot(lam, self.data.c.as_ref().unwrap().as_ref());
        }
        if let Some(lam) = lam_in {
            for i in 0..nx {
                self.q_cur[i] -= lam[i];
            }
        }
    }

    /// Registers the pending dual step:
    /// `q_step = C' dlambda_out - E' dlambda_in`, `p_step = dlambda_out' c`.
    pub fn set_direction(
        &mut self,
        dlam_in: Option<ColRef<'_, E>>,
        dlam_out: Option<ColRef<'_, E>>,
    ) {
        let nz = self.data.nz();
        let nx = self.data.nx;
        for i in 0..nz {
            self.q_step[i] = 0.;
        }
        self.p_step = 0.;
        if let (Some(dlam), Some(c_mat)) = (dlam_out, self.data.C.as_ref()) {
            for j in 0..nz {
                let mut sum = 0.;
                for i in 0..nx {
                    sum += c_mat[(i, j)] * dlam[i];
                }
                self.q_step[j] += sum;
            }
            self.p_step += dot(dlam, self.data.c.as_ref().unwrap().as_ref());
        }
        if let Some(dlam) = dlam_in {
            for i in 0..nx {
                self.q_step[i] -= dlam[i];
            }
        }
    }

    pub fn solve_direction(&mut self) -> Result<(), StageError> {
        self.solver
            .solve_direction(&self.data, &self.q_cur, &self.q_step)
    }

    pub fn resolve(&mut self) -> Result<(), StageError> {
        self.solver
            .resolve(&self.data, &self.q_cur, &mut self.z, &mut self.y)
    }

    /// Accepts step length `alpha`: steps the objective terms and advances
    /// the solver's primal/dual state.
    pub fn commit_step(&mut self, alpha: E) -> Result<(), StageError> {
        axpy(self.q_cur.as_mut(), alpha, self.q_step.as_ref());
        self.p_cur += alpha * self.p_step;
        self.solver
            .commit_step(&self.data, alpha, &self.q_cur, &mut self.z, &mut self.y)
    }

    /// Evaluates the trial primal at `alpha` into `z_tmp`.
    pub fn trial(&mut self, alpha: E) -> Result<(), StageError> {
        self.solver
            .trial_primal(&self.data, alpha, &self.q_cur, &self.q_step, &mut self.z_tmp)
    }

    /// Stage contribution to the dual objective at the current iterate.
    pub fn objective(&self) -> E {
        0.5 * self.data.H.quad_form(&self.z) + dot(self.q_cur.as_ref(), self.z.as_ref()) + self.p_cur
    }

    /// Stage contribution to the dual objective at trial step `alpha`;
    /// leaves the committed state untouched.
    pub fn parametric_objective(&mut self, alpha: E) -> Result<E, StageError> {
        self.trial(alpha)?;
        let quad = 0.5 * self.data.H.quad_form(&self.z_tmp);
        let lin = dot(self.q_cur.as_ref(), self.z_tmp.as_ref())
            + alpha * dot(self.q_step.as_ref(), self.z_tmp.as_ref());
        Ok(quad + lin + self.p_cur + alpha * self.p_step)
    }

    pub fn min_step_to_active_set_change(&self) -> E {
        self.solver.min_step_to_active_set_change(&self.data)
    }

    /// Writes the active-set status of every constraint row: `-1` lower
    /// bound active, `+1` upper bound active, `0` inactive.
    pub fn extract_active_set(&self, status: &mut [i8], eq_tol: E) {
        for i in 0..self.n_constraint_rows() {
            status[i] = if self.y[2 * i] > eq_tol {
                -1
            } else if self.y[2 * i + 1] > eq_tol {
                1
            } else {
                0
            };
        }
    }
}

/// Diffs the new active sets against the old ones, updating each stage's
/// `act_set_changed` flag. Returns the number of changed constraints and
/// the largest stage index with a change.
pub(crate) fn compare_active_sets(
    stages: &mut [Stage],
    new_status: &[Vec<i8>],
    old_status: &[Vec<i8>],
) -> (I, Option<I>) {
    let mut n_changed = 0;
    let mut last_change = None;
    for (k, stage) in stages.iter_mut().enumerate() {
        stage.act_set_changed = false;
        for (new, old) in new_status[k].iter().zip(old_status[k].iter()) {
            if new != old {
                n_changed += 1;
                stage.act_set_changed = true;
                last_change = Some(k);
            }
        }
    }
    (n_changed, last_change)
}

/// Counts the active constraints in an extracted status set.
pub(crate) fn count_active(status: &[Vec<i8>]) -> I {
    status
        .iter()
        .map(|s| s.iter().filter(|v| **v != 0).count())
        .sum()
}
