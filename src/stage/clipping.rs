//! Closed-form stage solver for diagonal Hessians with simple bounds.
//!
//! The unconstrained minimizer is `z* = -H^{-1} q`; the constrained
//! minimizer is its componentwise projection onto `[zLow, zUpp]`. The
//! parametric step along a direction `dz` keeps the unconstrained iterate
//! `z(alpha) = zUnconstrained + alpha * dz` and clips at every `alpha`.

use faer::Col;

use crate::error::StageError;
use crate::linalg::vector_ops::{axpy, clamp, cwise_inverse, scaled_sum};
use crate::problem::{StageData, StageHessian};
use crate::stage::StageSolverOps;
use crate::E;

pub(crate) struct ClippingSolver {
    /// Unconstrained minimizer at the committed multipliers.
    z_unconstrained: Col<E>,
    /// Unconstrained response to the registered dual step.
    dz: Col<E>,
    /// Cached inverse of the diagonal Hessian.
    inv_h: Col<E>,
}

impl ClippingSolver {
    pub fn new(data: &StageData) -> Self {
        let nz = data.nz();
        let inv_h = match &data.H {
            StageHessian::Diagonal(d) => cwise_inverse(d.as_ref()),
            // setup validation restricts clipping stages to diagonal Hessians
            StageHessian::Dense(m) => Col::from_fn(nz, |i| 1. / m[(i, i)]),
        };
        Self {
            z_unconstrained: Col::zeros(nz),
            dz: Col::zeros(nz),
            inv_h,
        }
    }

    /// Clips the unconstrained iterate into `z` and rebuilds the bound
    /// multipliers `y` as lower/upper pairs
    /// `max(0, +/- diag(H) (clipped - unclipped))`.
    fn saturate(&self, data: &StageData, z: &mut Col<E>, y: &mut Col<E>) {
        let nz = data.nz();
        for i in 0..nz {
            z[i] = self.z_unconstrained[i];
        }
        clamp(z.as_mut(), data.z_low.as_ref(), data.z_upp.as_ref());
        for i in 0..nz {
            let h = 1. / self.inv_h[i];
            y[2 * i] = E::max(0., h * (z[i] - self.z_unconstrained[i]));
            y[2 * i + 1] = E::max(0., h * (self.z_unconstrained[i] - z[i]));
        }
    }

    /// Cached `1 / diag(H)`, consumed by the Newton-system setup.
    pub fn inv_hessian_diag(&self) -> &Col<E> {
        &self.inv_h
    }
}

impl StageSolverOps for ClippingSolver {
    fn solve_direction(
        &mut self,
        data: &StageData,
        _q_cur: &Col<E>,
        q_step: &Col<E>,
    ) -> Result<(), StageError> {
        for i in 0..data.nz() {
            self.dz[i] = -self.inv_h[i] * q_step[i];
        }
        Ok(())
    }

    fn resolve(
        &mut self,
        data: &StageData,
        q_cur: &Col<E>,
        z: &mut Col<E>,
        y: &mut Col<E>,
    ) -> Result<(), StageError> {
        for i in 0..data.nz() {
            self.z_unconstrained[i] = -self.inv_h[i] * q_cur[i];
            self.dz[i] = 0.;
        }
        self.saturate(data, z, y);
        Ok(())
    }

    fn commit_step(
        &mut self,
        data: &StageData,
        alpha: E,
        _q_new: &Col<E>,
        z: &mut Col<E>,
        y: &mut Col<E>,
    ) -> Result<(), StageError> {
        axpy(self.z_unconstrained.as_mut(), alpha, self.dz.as_ref());
        self.saturate(data, z, y);
        Ok(())
    }

    fn trial_primal(
        &self,
        data: &StageData,
        alpha: E,
        _q_cur: &Col<E>,
        _q_step: &Col<E>,
        z_out: &mut Col<E>,
    ) -> Result<(), StageError> {
        scaled_sum(
            z_out.as_mut(),
            self.z_unconstrained.as_ref(),
            alpha,
            self.dz.as_ref(),
        );
        clamp(z_out.as_mut(), data.z_low.as_ref(), data.z_upp.as_ref());
        Ok(())
    }

    fn min_step_to_active_set_change(&self, data: &StageData) -> E {
        let mut alpha_min = E::INFINITY;
        for i in 0..data.nz() {
            if self.dz[i] == 0. {
                continue;
            }
            for bound in [data.z_low[i], data.z_upp[i]] {
                if !bound.is_finite() {
                    continue;
                }
                let step = (bound - self.z_unconstrained[i]) / self.dz[i];
                if step > 0. && step < alpha_min {
                    alpha_min = step;
                }
            }
        }
        alpha_min
    }
}
