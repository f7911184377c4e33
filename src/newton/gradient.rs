//! Dual gradient assembly.
//!
//! The gradient block at row `k` is the coupling residual
//! `C_k z_k + c_k - z_{k+1}[0..nx]` of the current per-stage primal
//! solutions.

use crate::newton::DualNewtonSolver;

impl DualNewtonSolver {
    pub(crate) fn assemble_gradient(&mut self) {
        let nx = self.nx;
        for k in 0..self.n_coupling {
            let stage = &self.stages[k];
            let next = &self.stages[k + 1];
            let c_mat = stage.data.C.as_ref().unwrap();
            let c_vec = stage.data.c.as_ref().unwrap();
            for i in 0..nx {
                let mut sum = c_vec[i] - next.z[i];
                for j in 0..stage.nz() {
                    sum += c_mat[(i, j)] * stage.z[j];
                }
                self.gradient[k * nx + i] = sum;
            }
        }
    }

    /// Same residual on the per-stage trial primals (`z_tmp`), written into
    /// the separate trial-gradient buffer. Used by the line searches that
    /// probe the directional derivative without committing a step.
    pub(crate) fn assemble_trial_gradient(&mut self) {
        let nx = self.nx;
        for k in 0..self.n_coupling {
            let stage = &self.stages[k];
            let next = &self.stages[k + 1];
            let c_mat = stage.data.C.as_ref().unwrap();
            let c_vec = stage.data.c.as_ref().unwrap();
            for i in 0..nx {
                let mut sum = c_vec[i] - next.z_tmp[i];
                for j in 0..stage.nz() {
                    sum += c_mat[(i, j)] * stage.z_tmp[j];
                }
                self.gradient_try[k * nx + i] = sum;
            }
        }
    }
}
