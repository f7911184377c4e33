//! Newton-system setup: assembly of the banded generalized dual Hessian
//! from per-stage sensitivities.
//!
//! The diagonal block at row `k` is
//! `E_{k+1} P_{k+1} E_{k+1}' + C_k P_k C_k'` and the sub-diagonal block at
//! row `k` is `-C_k P_k E_k'`, where `P = Z (Z'HZ)^{-1} Z'` is the stage
//! Hessian inverse projected onto the null space of the active constraints
//! and `E` extracts the state part of the stacked variable. For clipping
//! stages `P` is the diagonal inverse with the rows and columns of actively
//! bounded coordinates annihilated; for general stages the blocks are built
//! as `M'M` from triangular solves against the reduced Cholesky factor.
//!
//! A block is rebuilt only if an active-set change was flagged on a stage
//! contributing to it; all other blocks are reused from the previous
//! iteration.

use faer::Mat;

use crate::linalg::cholesky::solve_lower_in_place;
use crate::newton::DualNewtonSolver;
use crate::stage::{Stage, StageSolver};
use crate::E;

pub enum SetupOutcome {
    /// The gradient norm is below the stationarity tolerance; no system was
    /// assembled.
    OptimalFound,
    Assembled,
}

impl DualNewtonSolver {
    pub(crate) fn setup_newton_system(&mut self) -> SetupOutcome {
        self.assemble_gradient();
        if self.gradient.norm_l2() < self.options.stationarity_tolerance {
            return SetupOutcome::OptimalFound;
        }

        let nx = self.nx;
        let eq_tol = self.options.equality_tolerance;
        let mut block = Mat::<E>::zeros(nx, nx);

        // diagonal blocks
        for k in 0..self.n_coupling {
            if !(self.stages[k].act_set_changed || self.stages[k + 1].act_set_changed) {
                continue;
            }
            zero_block(&mut block);
            epe_contribution(&self.stages[k + 1], &mut block, eq_tol);
            cpc_contribution(&self.stages[k], &mut block, eq_tol);
            self.hessian.write_diag_block(k, block.as_ref());
        }

        // sub-diagonal blocks
        for k in 1..self.n_coupling {
            if !self.stages[k].act_set_changed {
                continue;
            }
            zero_block(&mut block);
            cpe_block(&self.stages[k], &mut block, eq_tol);
            for i in 0..nx {
                for j in 0..nx {
                    self.hessian.set(k, -1, i, j, -block[(i, j)]);
                }
            }
        }

        SetupOutcome::Assembled
    }
}

/// Adds `E P E'` of `stage` (its next-state sensitivity) to `block`.
fn epe_contribution(stage: &Stage, block: &mut Mat<E>, eq_tol: E) {
    let nx = stage.data.nx;
    match &stage.solver {
        StageSolver::Clipping(clip) => {
            let inv_h = clip.inv_hessian_diag();
            for i in 0..nx {
                // annihilate coordinates with an active bound multiplier
                if stage.y[2 * i] > eq_tol || stage.y[2 * i + 1] > eq_tol {
                    continue;
                }
                block[(i, i)] += inv_h[i];
            }
        }
        StageSolver::Dense(dense) => {
            let (n_free, zt, chol) = dense.null_space_data();
            if n_free == 0 {
                return;
            }
            // M = R^{-T} (Z' E'), contribution M'M
            let mut m = Mat::from_fn(n_free, nx, |t, i| zt[(t, i)]);
            solve_lower_in_place(chol, &mut m);
            accumulate_mt_m(&m, &m, block, false);
        }
    }
}

/// Adds `C P C'` of `stage` to `block`.
fn cpc_contribution(stage: &Stage, block: &mut Mat<E>, eq_tol: E) {
    let nx = stage.data.nx;
    let c_mat = stage.data.C.as_ref().unwrap();
    match &stage.solver {
        StageSolver::Clipping(clip) => {
            let inv_h = clip.inv_hessian_diag();
            for col in 0..stage.nz() {
                if stage.y[2 * col] > eq_tol || stage.y[2 * col + 1] > eq_tol {
                    continue;
                }
                for i in 0..nx {
                    for j in 0..nx {
                        block[(i, j)] += c_mat[(i, col)] * inv_h[col] * c_mat[(j, col)];
                    }
                }
            }
        }
        StageSolver::Dense(dense) => {
            let (n_free, zt, chol) = dense.null_space_data();
            if n_free == 0 {
                return;
            }
            let mut m = zt_ct(zt, c_mat, n_free, stage.nz(), nx);
            solve_lower_in_place(chol, &mut m);
            accumulate_mt_m(&m, &m, block, false);
        }
    }
}

/// Writes `C P E'` of `stage` into `block` (the caller negates it into the
/// sub-diagonal).
fn cpe_block(stage: &Stage, block: &mut Mat<E>, eq_tol: E) {
    let nx = stage.data.nx;
    let c_mat = stage.data.C.as_ref().unwrap();
    match &stage.solver {
        StageSolver::Clipping(clip) => {
            let inv_h = clip.inv_hessian_diag();
            for j in 0..nx {
                // columns of actively bounded state coordinates vanish
                if stage.y[2 * j] > eq_tol || stage.y[2 * j + 1] > eq_tol {
                    continue;
                }
                for i in 0..nx {
                    block[(i, j)] = c_mat[(i, j)] * inv_h[j];
                }
            }
        }
        StageSolver::Dense(dense) => {
            let (n_free, zt, chol) = dense.null_space_data();
            if n_free == 0 {
                return;
            }
            let mut m_c = zt_ct(zt, c_mat, n_free, stage.nz(), nx);
            solve_lower_in_place(chol, &mut m_c);
            let mut m_e = Mat::from_fn(n_free, nx, |t, i| zt[(t, i)]);
            solve_lower_in_place(chol, &mut m_e);
            accumulate_mt_m(&m_c, &m_e, block, true);
        }
    }
}

fn zero_block(block: &mut Mat<E>) {
    for i in 0..block.nrows() {
        for j in 0..block.ncols() {
            block[(i, j)] = 0.;
        }
    }
}

/// `Z' C'` as an `n_free x nx` matrix.
fn zt_ct(zt: &Mat<E>, c_mat: &Mat<E>, n_free: usize, nz: usize, nx: usize) -> Mat<E> {
    Mat::from_fn(n_free, nx, |t, i| {
        let mut sum = 0.;
        for j in 0..nz {
            sum += zt[(t, j)] * c_mat[(i, j)];
        }
        sum
    })
}

/// `block (+)= A' B`; with `overwrite` the block is assigned instead.
fn accumulate_mt_m(a: &Mat<E>, b: &Mat<E>, block: &mut Mat<E>, overwrite: bool) {
    for i in 0..a.ncols() {
        for j in 0..b.ncols() {
            let mut sum = 0.;
            for t in 0..a.nrows() {
                sum += a[(t, i)] * b[(t, j)];
            }
            if overwrite {
                block[(i, j)] = sum;
            } else {
                block[(i, j)] += sum;
            }
        }
    }
}
