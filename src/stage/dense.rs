//! Dense active-set QP engine for general stages.
//!
//! A primal active-set method over the working set of simple bounds and
//! general affine rows, using the null-space approach: on each working set
//! the equality-constrained subproblem is reduced through a basis `Z` of the
//! constraint null space and solved with a dense Cholesky of `Z' H Z`. The
//! engine is warm-started across outer dual iterations (only the linear term
//! changes), and exposes the null-space basis and the reduced Cholesky
//! factor as the sensitivity data consumed by the Newton-system setup.
//!
//! The engine assumes `Z' H Z` is positive definite on every visited
//! working set.

use faer::{Col, Mat};

use crate::error::StageError;
use crate::linalg::cholesky::{
    chol_lower_in_place, solve_lower_in_place, solve_lower_transpose_in_place,
};
use crate::linalg::vector_ops::clamp;
use crate::problem::{StageData, StageHessian};
use crate::stage::StageSolverOps;
use crate::{E, I};

/// Multiplier margin below which an active constraint is dropped.
const OPTIMALITY_TOL: E = 1e-9;
/// Null-space step considered stationary.
const STEP_TOL: E = 1e-11;
/// Pivot threshold of the working-set elimination.
const PIVOT_TOL: E = 1e-12;

pub(crate) struct DenseStageSolver {
    /// Working set per stacked coordinate: `-1` lower, `0` free, `+1` upper.
    wb: Vec<i8>,
    /// Working set per general affine row.
    wr: Vec<i8>,
    /// Committed primal iterate; stays feasible across outer iterations.
    z_cur: Col<E>,
    /// Iterate of the registered full-step target solve.
    z_target: Col<E>,
    /// Signed bound multipliers at the committed point.
    nu: Col<E>,
    /// Signed row multipliers at the committed point.
    mu: Col<E>,
    /// Null-space basis (transposed, `n_free x nz`) at the committed point.
    zt: Mat<E>,
    /// Lower Cholesky factor of the reduced Hessian `Z' H Z`.
    chol_reduced: Mat<E>,
    n_free: I,
    started: bool,
}

impl DenseStageSolver {
    pub fn new(data: &StageData) -> Self {
        let nz = data.nz();
        let nd = data.nd();
        Self {
            wb: vec![0; nz],
            wr: vec![0; nd],
            z_cur: Col::zeros(nz),
            z_target: Col::zeros(nz),
            nu: Col::zeros(nz),
            mu: Col::zeros(nd),
            zt: Mat::zeros(0, nz),
            chol_reduced: Mat::zeros(0, 0),
            n_free: 0,
            started: false,
        }
    }

    /// Current null-space dimension, basis `Z'` and reduced Cholesky factor,
    /// consumed by the Newton-system setup.
    pub fn null_space_data(&self) -> (I, &Mat<E>, &Mat<E>) {
        (self.n_free, &self.zt, &self.chol_reduced)
    }

    fn refresh_sensitivities(&mut self, data: &StageData) -> Result<(), StageError> {
        let basis = null_space(data, &self.wb, &self.wr)?;
        let nn = basis.ncols();
        self.zt = basis.transpose().to_owned();
        let hz = hessian_mul_mat(&data.H, &basis);
        let mut reduced = &self.zt * &hz;
        chol_lower_in_place(&mut reduced)?;
        self.chol_reduced = reduced;
        self.n_free = nn;
        Ok(())
    }

    fn write_y(&self, data: &StageData, y: &mut Col<E>) {
        let nz = data.nz();
        for i in 0..nz {
            y[2 * i] = E::max(0., self.nu[i]);
            y[2 * i + 1] = E::max(0., -self.nu[i]);
        }
        for r in 0..data.nd() {
            y[2 * (nz + r)] = E::max(0., self.mu[r]);
            y[2 * (nz + r) + 1] = E::max(0., -self.mu[r]);
        }
    }
}

impl StageSolverOps for DenseStageSolver {
    fn solve_direction(
        &mut self,
        data: &StageData,
        q_cur: &Col<E>,
        q_step: &Col<E>,
    ) -> Result<(), StageError> {
        // solve at the full-step linear term; the working set moves to the
        // target's active set, warm-starting the partial-step resolves of
        // the line search and commit
        let q_target = Col::from_fn(data.nz(), |i| q_cur[i] + q_step[i]);
        for i in 0..data.nz() {
            self.z_target[i] = self.z_cur[i];
        }
        active_set_solve(
            data,
            &q_target,
            &mut self.z_target,
            &mut self.wb,
            &mut self.wr,
        )?;
        Ok(())
    }

    fn resolve(
        &mut self,
        data: &StageData,
        q_cur: &Col<E>,
        z: &mut Col<E>,
        y: &mut Col<E>,
    ) -> Result<(), StageError> {
        if !self.started {
            for i in 0..data.nz() {
                self.z_cur[i] = 0.;
            }
            self.started = true;
        }
        let out = active_set_solve(data, q_cur, &mut self.z_cur, &mut self.wb, &mut self.wr)?;
        self.nu = out.nu;
        self.mu = out.mu;
        self.refresh_sensitivities(data)?;
        for i in 0..data.nz() {
            z[i] = self.z_cur[i];
        }
        self.write_y(data, y);
        Ok(())
    }

    fn commit_step(
        &mut self,
        data: &StageData,
        _alpha: E,
        q_new: &Col<E>,
        z: &mut Col<E>,
        y: &mut Col<E>,
    ) -> Result<(), StageError> {
        let out = active_set_solve(data, q_new, &mut self.z_cur, &mut self.wb, &mut self.wr)?;
        self.nu = out.nu;
        self.mu = out.mu;
        self.refresh_sensitivities(data)?;
        for i in 0..data.nz() {
            z[i] = self.z_cur[i];
        }
        self.write_y(data, y);
        Ok(())
    }

    fn trial_primal(
        &self,
        data: &StageData,
        alpha: E,
        q_cur: &Col<E>,
        q_step: &Col<E>,
        z_out: &mut Col<E>,
    ) -> Result<(), StageError> {
        let q_try = Col::from_fn(data.nz(), |i| q_cur[i] + alpha * q_step[i]);
        let mut wb = self.wb.clone();
        let mut wr = self.wr.clone();
        for i in 0..data.nz() {
            z_out[i] = self.z_cur[i];
        }
        active_set_solve(data, &q_try, z_out, &mut wb, &mut wr)?;
        Ok(())
    }

    fn min_step_to_active_set_change(&self, _data: &StageData) -> E {
        // not recoverable from this engine's warm-started resolves; problems
        // containing general stages therefore run their line search without
        // an active-set-aware minimum step
        E::INFINITY
    }
}

struct SolveOutput {
    nu: Col<E>,
    mu: Col<E>,
}

/// `H z + q`
fn gradient(data: &StageData, q: &Col<E>, z: &Col<E>) -> Col<E> {
    let hz = data.H.mul_vec(z);
    Col::from_fn(data.nz(), |i| hz[i] + q[i])
}

fn hessian_mul_mat(h: &StageHessian, m: &Mat<E>) -> Mat<E> {
    match h {
        StageHessian::Diagonal(d) => {
            Mat::from_fn(m.nrows(), m.ncols(), |i, j| d[i] * m[(i, j)])
        }
        StageHessian::Dense(hm) => hm * m,
    }
}

/// Embedded null-space basis (`nz x nn`) of the working-set constraints:
/// coordinates fixed by `wb` are zero rows, the active rows of `D`
/// (restricted to the free coordinates) are eliminated by Gauss-Jordan.
fn null_space(data: &StageData, wb: &[i8], wr: &[i8]) -> Result<Mat<E>, StageError> {
    let nz = data.nz();
    let free: Vec<I> = (0..nz).filter(|i| wb[*i] == 0).collect();
    let act: Vec<I> = (0..data.nd()).filter(|r| wr[*r] != 0).collect();
    let nf = free.len();

    if nf == 0 {
        return Ok(Mat::zeros(nz, 0));
    }
    if act.is_empty() {
        let mut basis = Mat::zeros(nz, nf);
        for (t, &i) in free.iter().enumerate() {
            basis[(i, t)] = 1.;
        }
        return Ok(basis);
    }

    let d_mat = data.D.as_ref().unwrap();
    let m = act.len();
    let mut r = Mat::<E>::zeros(m, nf);
    for (row, &a) in act.iter().enumerate() {
        for (col, &f) in free.iter().enumerate() {
            r[(row, col)] = d_mat[(a, f)];
        }
    }

    // Gauss-Jordan with partial pivoting
    let mut pivot_cols: Vec<I> = Vec::with_capacity(m);
    let mut row = 0;
    for col in 0..nf {
        if row == m {
            break;
        }
        let mut best = row;
        for i in (row + 1)..m {
            if r[(i, col)].abs() > r[(best, col)].abs() {
                best = i;
            }
        }
        if r[(best, col)].abs() < PIVOT_TOL {
            continue;
        }
        if best != row {
            for j in 0..nf {
                let tmp = r[(row, j)];
                r[(row, j)] = r[(best, j)];
                r[(best, j)] = tmp;
            }
        }
        let pivot = r[(row, col)];
        for j in 0..nf {
            r[(row, j)] /= pivot;
        }
        for i in 0..m {
            if i == row {
                continue;
            }
            let factor = r[(i, col)];
            if factor != 0. {
                for j in 0..nf {
                    r[(i, j)] -= factor * r[(row, j)];
                }
            }
        }
        pivot_cols.push(col);
        row += 1;
    }
    if row < m {
        // linearly dependent working set
        return Err(StageError::SingularReducedHessian);
    }

    let nonbasic: Vec<I> = (0..nf).filter(|c| !pivot_cols.contains(c)).collect();
    let mut basis = Mat::<E>::zeros(nz, nonbasic.len());
    for (t, &c) in nonbasic.iter().enumerate() {
        basis[(free[c], t)] = 1.;
        for (pr, &pc) in pivot_cols.iter().enumerate() {
            basis[(free[pc], t)] = -r[(pr, c)];
        }
    }
    Ok(basis)
}

/// Signed working-set multipliers from stationarity `H z + q = nu + D' mu`:
/// the active-row multipliers solve the normal equations on the free
/// coordinates, the fixed-coordinate multipliers follow by substitution.
fn multipliers(
    data: &StageData,
    g: &Col<E>,
    wb: &[i8],
    wr: &[i8],
) -> Result<SolveOutput, StageError> {
    let nz = data.nz();
    let nd = data.nd();
    let mut nu = Col::<E>::zeros(nz);
    let mut mu = Col::<E>::zeros(nd);

    let free: Vec<I> = (0..nz).filter(|i| wb[*i] == 0).collect();
    let act: Vec<I> = (0..nd).filter(|r| wr[*r] != 0).collect();

    if !act.is_empty() {
        let d_mat = data.D.as_ref().unwrap();
        let m = act.len();
        let mut aat = Mat::<E>::zeros(m, m);
        let mut rhs = Mat::<E>::zeros(m, 1);
        for (r1, &a1) in act.iter().enumerate() {
            for (r2, &a2) in act.iter().enumerate() {
                let mut sum = 0.;
                for &f in &free {
                    sum += d_mat[(a1, f)] * d_mat[(a2, f)];
                }
                aat[(r1, r2)] = sum;
            }
            let mut sum = 0.;
            for &f in &free {
                sum += d_mat[(a1, f)] * g[f];
            }
            rhs[(r1, 0)] = sum;
        }
        chol_lower_in_place(&mut aat)?;
        solve_lower_in_place(&aat, &mut rhs);
        solve_lower_transpose_in_place(&aat, &mut rhs);
        for (r1, &a1) in act.iter().enumerate() {
            mu[a1] = rhs[(r1, 0)];
        }
    }

    for i in 0..nz {
        if wb[i] != 0 {
            let mut dt_mu = 0.;
            if let Some(d_mat) = data.D.as_ref() {
                for &a in &act {
                    dt_mu += d_mat[(a, i)] * mu[a];
                }
            }
            nu[i] = g[i] - dt_mu;
        }
    }

    Ok(SolveOutput { nu, mu })
}

/// Moves `z` onto the working-set constraints and into the feasible region.
fn normalize_iterate(
    data: &StageData,
    z: &mut Col<E>,
    wb: &[i8],
    wr: &mut [i8],
) -> Result<(), StageError> {
    for i in 0..data.nz() {
        match wb[i] {
            -1 => z[i] = data.z_low[i],
            1 => z[i] = data.z_upp[i],
            _ => z[i] = z[i].clamp(data.z_low[i], data.z_upp[i]),
        }
    }
    let Some(d_mat) = data.D.as_ref() else {
        return Ok(());
    };
    let nd = data.nd();
    let d_low = data.d_low.as_ref().unwrap();
    let d_upp = data.d_upp.as_ref().unwrap();

    // active rows that no longer hold (e.g. after a bounds update) are
    // dropped rather than restored
    for r in 0..nd {
        if wr[r] != 0 {
            let val = row_value(d_mat, z, r);
            if val < d_low[r] - 1e-8 || val > d_upp[r] + 1e-8 {
                wr[r] = 0;
            }
        }
    }

    // alternating projection repair for violated inactive rows
    for _ in 0..(20 * (nd + 1)) {
        clamp(z.as_mut(), data.z_low.as_ref(), data.z_upp.as_ref());
        let mut worst: Option<(E, I)> = None;
        for r in 0..nd {
            let val = row_value(d_mat, z, r);
            let violation = E::max(d_low[r] - val, val - d_upp[r]);
            if violation > 1e-10 && worst.map_or(true, |(w, _)| violation > w) {
                worst = Some((violation, r));
            }
        }
        let Some((_, r)) = worst else {
            return Ok(());
        };
        let val = row_value(d_mat, z, r);
        let target = val.clamp(d_low[r], d_upp[r]);
        let mut norm2 = 0.;
        for i in 0..data.nz() {
            norm2 += d_mat[(r, i)] * d_mat[(r, i)];
        }
        if norm2 < PIVOT_TOL {
            return Err(StageError::Infeasible);
        }
        let scale = (target - val) / norm2;
        for i in 0..data.nz() {
            z[i] += scale * d_mat[(r, i)];
        }
    }
    Err(StageError::Infeasible)
}

fn row_value(d_mat: &Mat<E>, z: &Col<E>, r: I) -> E {
    let mut val = 0.;
    for i in 0..z.nrows() {
        val += d_mat[(r, i)] * z[i];
    }
    val
}

/// Primal active-set iteration for `min 0.5 z'Hz + q'z` over the stage's
/// bounds and affine rows. `z` must enter feasible with respect to the
/// working set and leaves at the minimizer; the working set is updated in
/// place so subsequent calls warm-start.
fn active_set_solve(
    data: &StageData,
    q: &Col<E>,
    z: &mut Col<E>,
    wb: &mut [i8],
    wr: &mut [i8],
) -> Result<SolveOutput, StageError> {
    let nz = data.nz();
    let nd = data.nd();

    normalize_iterate(data, z, wb, wr)?;

    let max_iter = 50 * (nz + nd + 1);
    for _ in 0..max_iter {
        let basis = null_space(data, wb, wr)?;
        let nn = basis.ncols();

        // reduced Newton step on the current working set
        let g = gradient(data, q, z);
        let mut dz = Col::<E>::zeros(nz);
        if nn > 0 {
            let hz = hessian_mul_mat(&data.H, &basis);
            let basis_t = basis.transpose().to_owned();
            let mut reduced = &basis_t * &hz;
            chol_lower_in_place(&mut reduced)?;
            let mut rhs = Mat::<E>::zeros(nn, 1);
            for t in 0..nn {
                let mut sum = 0.;
                for i in 0..nz {
                    sum += basis[(i, t)] * g[i];
                }
                rhs[(t, 0)] = -sum;
            }
            solve_lower_in_place(&reduced, &mut rhs);
            solve_lower_transpose_in_place(&reduced, &mut rhs);
            for i in 0..nz {
                let mut sum = 0.;
                for t in 0..nn {
                    sum += basis[(i, t)] * rhs[(t, 0)];
                }
                dz[i] = sum;
            }
        }

        let mut step_norm: E = 0.;
        let mut z_norm: E = 0.;
        for i in 0..nz {
            step_norm = E::max(step_norm, dz[i].abs());
            z_norm = E::max(z_norm, z[i].abs());
        }

        if step_norm > STEP_TOL * (1. + z_norm) {
            // ratio test over the constraints outside the working set
            let mut t = 1.;
            let mut blocking: Option<(bool, I, i8)> = None;
            for i in 0..nz {
                if wb[i] != 0 {
                    continue;
                }
                if dz[i] > PIVOT_TOL && data.z_upp[i].is_finite() {
                    let tt = (data.z_upp[i] - z[i]) / dz[i];
                    if tt < t {
                        t = tt;
                        blocking = Some((false, i, 1));
                    }
                } else if dz[i] < -PIVOT_TOL && data.z_low[i].is_finite() {
                    let tt = (data.z_low[i] - z[i]) / dz[i];
                    if tt < t {
                        t = tt;
                        blocking = Some((false, i, -1));
                    }
                }
            }
            if let Some(d_mat) = data.D.as_ref() {
                let d_low = data.d_low.as_ref().unwrap();
                let d_upp = data.d_upp.as_ref().unwrap();
                for r in 0..nd {
                    if wr[r] != 0 {
                        continue;
                    }
                    let dr = row_value(d_mat, &dz, r);
                    let val = row_value(d_mat, z, r);
                    if dr > PIVOT_TOL && d_upp[r].is_finite() {
                        let tt = (d_upp[r] - val) / dr;
                        if tt < t {
                            t = tt;
                            blocking = Some((true, r, 1));
                        }
                    } else if dr < -PIVOT_TOL && d_low[r].is_finite() {
                        let tt = (d_low[r] - val) / dr;
                        if tt < t {
                            t = tt;
                            blocking = Some((true, r, -1));
                        }
                    }
                }
            }
            let t = E::max(t, 0.);
            for i in 0..nz {
                z[i] += t * dz[i];
            }
            match blocking {
                Some((true, r, side)) => wr[r] = side,
                Some((false, i, side)) => {
                    wb[i] = side;
                    z[i] = if side < 0 { data.z_low[i] } else { data.z_upp[i] };
                }
                None => {}
            }
            continue;
        }

        // stationary on the working set; check the multipliers
        let g = gradient(data, q, z);
        let out = multipliers(data, &g, wb, wr)?;
        let mut worst: Option<(E, bool, I)> = None;
        for i in 0..nz {
            let margin = match wb[i] {
                -1 => out.nu[i],
                1 => -out.nu[i],
                _ => continue,
            };
            if margin < -OPTIMALITY_TOL && worst.map_or(true, |(w, _, _)| margin < w) {
                worst = Some((margin, false, i));
            }
        }
        for r in 0..nd {
            let margin = match wr[r] {
                -1 => out.mu[r],
                1 => -out.mu[r],
                _ => continue,
            };
            if margin < -OPTIMALITY_TOL && worst.map_or(true, |(w, _, _)| margin < w) {
                worst = Some((margin, true, r));
            }
        }
        match worst {
            Some((_, true, r)) => wr[r] = 0,
            Some((_, false, i)) => wb[i] = 0,
            None => return Ok(out),
        }
    }

    Err(StageError::Infeasible)
}
