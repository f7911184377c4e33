//! Structured per-iteration records of a solve.

use faer::Col;
use serde::Serialize;

use crate::options::LogLevel;
use crate::{E, I};

/// Scalars recorded once per outer iteration. Record 0 describes the
/// initial stage resolve; records `1..` describe Newton/gradient iterations.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: I,
    /// Dual objective after the accepted step.
    pub obj_val: E,
    pub grad_norm: E,
    pub step_norm: E,
    /// Accepted step length `alpha`.
    pub step_size: E,
    pub lambda_norm: E,
    pub n_line_search_iter: I,
    pub n_active_constraints: I,
    pub n_changed_constraints: I,
    pub hessian_regularized: bool,
    /// Largest stage index with an active-set change this iteration.
    pub last_act_set_change: Option<I>,
}

/// Full-state snapshot kept at [`LogLevel::AllData`].
#[derive(Debug, Clone)]
pub struct IterationSnapshot {
    pub lambda: Col<E>,
    pub delta_lambda: Col<E>,
    pub gradient: Col<E>,
    /// Packed band of the Newton Hessian.
    pub hessian: Vec<E>,
    /// Packed band of its Cholesky factor.
    pub chol_hessian: Vec<E>,
    /// Per-stage primal vectors.
    pub stage_primal: Vec<Col<E>>,
}

/// The finite sequence of iteration records of one `solve` call.
#[derive(Default)]
pub struct SolveLog {
    level: LogLevel,
    records: Vec<IterationRecord>,
    snapshots: Vec<IterationSnapshot>,
}

impl SolveLog {
    pub(crate) fn reset(&mut self, level: LogLevel) {
        self.level = level;
        self.records.clear();
        self.snapshots.clear();
    }

    pub(crate) fn push(&mut self, record: IterationRecord, snapshot: Option<IterationSnapshot>) {
        if self.level == LogLevel::None {
            return;
        }
        self.records.push(record);
        if self.level == LogLevel::AllData {
            if let Some(snapshot) = snapshot {
                self.snapshots.push(snapshot);
            }
        }
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn snapshots(&self) -> &[IterationSnapshot] {
        &self.snapshots
    }

    /// Number of logged Newton/gradient iterations, excluding the initial
    /// resolve record.
    pub fn num_iterations(&self) -> I {
        self.records.len().saturating_sub(1)
    }

    pub fn last_record(&self) -> Option<&IterationRecord> {
        self.records.last()
    }
}
