use std::time::Instant;

use crate::I;
use crate::log::IterationRecord;
use crate::options::DualNewtonOptions;

/// Hook invoked once per solver iteration for logging, monitoring, or early
/// stopping.
pub trait Callback {
    /// Creates a new callback from solver options.
    fn new(options: &DualNewtonOptions) -> Self
    where
        Self: Sized;

    /// Called at the end of each iteration with the iteration record.
    fn call(&mut self, record: &IterationRecord);
}

/// A callback that does nothing. Use when no per-iteration output is needed.
pub struct NoOpCallback {}

impl Callback for NoOpCallback {
    fn new(_options: &DualNewtonOptions) -> Self {
        Self {}
    }

    fn call(&mut self, _record: &IterationRecord) {
        // Do nothing
    }
}

/// Prints per-iteration convergence data of the dual Newton loop to stdout.
pub struct ConvergenceOutput {
    print_level: I,
    print_interval_header: I,
    print_timing: bool,
    last_call: Instant,
}

impl ConvergenceOutput {
    fn print_header(&self) {
        println!(
            " iter |     gradNorm |     stepNorm |    stepSize | LS iter | reg. NHess |     obj. val |  #conAct |  #chgAS |  lambdaNorm"
        );
        println!(
            " ---- | ------------ | ------------ | ----------- | ------- | ---------- | ------------ | -------- | ------- | -----------"
        );
    }
}

impl Callback for ConvergenceOutput {
    fn new(options: &DualNewtonOptions) -> Self {
        Self {
            print_level: options.print_level,
            print_interval_header: options.print_interval_header.max(1),
            print_timing: options.print_iteration_timing,
            last_call: Instant::now(),
        }
    }

    fn call(&mut self, record: &IterationRecord) {
        if self.print_level < 2 {
            return;
        }
        if record.iteration % self.print_interval_header == 1 {
            self.print_header();
        }
        println!(
            " {:4} |    {:.3e} |    {:.3e} |    {:.2e} |     {:3} |      {:5} |  {:+.5e} |   {:6} |  {:6} |   {:.3e}",
            record.iteration,
            record.grad_norm,
            record.step_norm,
            record.step_size,
            record.n_line_search_iter,
            if record.last_act_set_change.is_some() {
                if record.hessian_regularized { "true" } else { "false" }
            } else {
                "n/a"
            },
            record.obj_val,
            record.n_active_constraints,
            record.n_changed_constraints,
            record.lambda_norm,
        );
        if self.print_timing {
            println!("      | iteration wall time: {:9.3} ms", self.last_call.elapsed().as_secs_f64() * 1e3);
        }
        self.last_call = Instant::now();
    }
}
