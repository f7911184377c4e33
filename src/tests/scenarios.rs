//! End-to-end scenario tests of the dual Newton solver.

use faer::Col;
use rstest::rstest;
use rstest_reuse::{apply, template};

use crate::callback::{Callback, ConvergenceOutput};
use crate::options::{DualNewtonOptions, FactorizationAlg, LineSearchKind, RegStrategy};
use crate::problem::{OcpProblem, StageData};
use crate::tests::support::{double_integrator_stages, kkt_reference};
use crate::{DualNewtonSolver, E, Solver, SolverHooks, Status};

fn build_solver(
    stages: Vec<StageData>,
    x0: &Col<E>,
    options: DualNewtonOptions,
) -> DualNewtonSolver {
    let mut problem = OcpProblem::new(stages).unwrap();
    problem.embed_initial_state(x0).unwrap();
    problem.solver_builder().with_options(options).build().unwrap()
}

#[template]
#[rstest]
pub fn factorization_algs(
    #[values(FactorizationAlg::BandForward, FactorizationAlg::BandReverse)]
    fac_alg: FactorizationAlg,
) {
}

/// Degenerate single-stage problem: no coupling equalities, the dual is
/// trivially stationary and the solver must report optimality without
/// taking a Newton step.
#[test]
fn test_single_stage_is_immediately_optimal() {
    let stage = StageData::clipping(
        1,
        0,
        Col::from_fn(1, |_| 1.),
        Col::zeros(1),
        0.,
        None,
        Col::from_fn(1, |_| E::NEG_INFINITY),
        Col::from_fn(1, |_| E::INFINITY),
    );
    let problem = OcpProblem::new(vec![stage]).unwrap();
    let mut solver = problem.solver_builder().build().unwrap();

    let status = solver.solve(&mut SolverHooks::default()).unwrap();
    assert_eq!(status, Status::Optimal);
    assert!(solver.objective_value().abs() < 1e-12);
    let last = solver.log().last_record().unwrap();
    assert_eq!(last.step_norm, 0.);
}

/// Unconstrained double integrator: a single Newton step solves the dual
/// exactly and the primal matches the equality-constrained KKT system.
#[apply(factorization_algs)]
fn test_double_integrator_converges_in_one_newton_step(fac_alg: FactorizationAlg) {
    let stages = double_integrator_stages(5);
    let x0 = Col::from_fn(2, |i| if i == 0 { 1.0 } else { 0.5 });
    let options = DualNewtonOptions::default()
        .with_factorization(fac_alg)
        .with_line_search(LineSearchKind::Backtracking);
    let mut solver = build_solver(stages.clone(), &x0, options);

    let status = solver.solve(&mut SolverHooks::default()).unwrap();
    assert_eq!(status, Status::Optimal);
    // one Newton step plus the stationarity check
    assert_eq!(solver.log().num_iterations(), 2);
    let last = solver.log().last_record().unwrap();
    assert!(last.grad_norm < solver.options().stationarity_tolerance);

    let reference = kkt_reference(&stages, &x0, &[]);
    let z = solver.primal_solution();
    assert!((&z - &reference).norm_l2() < 1e-6, "primal mismatch");
}

/// A tight input bound on stage 2 saturates; the solver converges to the
/// solution of the KKT system with that input pinned at its bound.
#[apply(factorization_algs)]
fn test_saturated_input_bound(fac_alg: FactorizationAlg) {
    let bound = 0.02;
    let mut stages = double_integrator_stages(5);
    stages[2].z_low[2] = -bound;
    stages[2].z_upp[2] = bound;
    let x0 = Col::from_fn(2, |i| if i == 0 { 1.0 } else { 0.5 });
    let options = DualNewtonOptions::default()
        .with_factorization(fac_alg)
        .with_line_search(LineSearchKind::BacktrackingAsChange);
    let mut solver = build_solver(stages.clone(), &x0, options);

    let status = solver.solve(&mut SolverHooks::default()).unwrap();
    assert_eq!(status, Status::Optimal);

    // global index of stage 2's input: stages 0..2 carry nz = 3
    let u2_idx = 3 * 2 + 2;
    let z = solver.primal_solution();
    assert!(
        (z[u2_idx].abs() - bound).abs() < 1e-7,
        "input bound is not active: u2 = {}",
        z[u2_idx]
    );

    // with the saturated input pinned, the remaining system is an equality
    // KKT problem
    let pinned = z[u2_idx].signum() * bound;
    let reference = kkt_reference(&stages, &x0, &[(u2_idx, pinned)]);
    assert!((&z - &reference).norm_l2() < 1e-5, "primal mismatch");

    // the active bound carries a multiplier
    let (_, y) = solver.dual_solution();
    let y_offset: usize = (0..2).map(|k| 2 * (stages[k].nz() + stages[k].nd())).sum();
    let y_low = y[y_offset + 2 * 2];
    let y_upp = y[y_offset + 2 * 2 + 1];
    assert!(y_low > 0. || y_upp > 0., "no multiplier on the active bound");
}

/// A structurally singular Newton Hessian row (fully pinned stages with a
/// consistent trajectory) must be repaired on the fly by the
/// singular-directions policy.
#[apply(factorization_algs)]
fn test_singular_directions_regularization(fac_alg: FactorizationAlg) {
    // nx = 1, nu = 1, dynamics x+ = x + u
    let c_mat = faer::Mat::from_fn(1, 2, |_, _| 1.0);
    let wide = (E::NEG_INFINITY, E::INFINITY);
    let mk_stage = |bounds: [(E, E); 2]| {
        StageData::clipping(
            1,
            1,
            Col::from_fn(2, |_| 1.),
            Col::zeros(2),
            0.,
            Some((c_mat.clone(), Col::zeros(1))),
            Col::from_fn(2, |i| bounds[i].0),
            Col::from_fn(2, |i| bounds[i].1),
        )
    };
    // stage 0 fully pinned at (1, 0.2); stage 1 state pinned at the
    // consistent value 1.2 so the first dual residual stays zero
    let stages = vec![
        mk_stage([(1.0, 1.0), (0.2, 0.2)]),
        mk_stage([(1.2, 1.2), wide]),
        StageData::clipping(
            1,
            0,
            Col::from_fn(1, |_| 1.),
            Col::zeros(1),
            0.,
            None,
            Col::from_fn(1, |_| E::NEG_INFINITY),
            Col::from_fn(1, |_| E::INFINITY),
        ),
    ];

    let reg_param = 1e-4;
    let mut problem = OcpProblem::new(stages).unwrap();
    problem.embed_initial_state(&Col::from_fn(1, |_| 1.0)).unwrap();
    let options = DualNewtonOptions::default()
        .with_factorization(fac_alg)
        .with_regularization(RegStrategy::SingularDirections, reg_param)
        .with_line_search(LineSearchKind::Backtracking);
    let mut solver = problem.solver_builder().with_options(options).build().unwrap();

    let status = solver.solve(&mut SolverHooks::default()).unwrap();
    assert_eq!(status, Status::Optimal);

    let regularized = solver
        .log()
        .records()
        .iter()
        .any(|record| record.hessian_regularized);
    assert!(regularized, "no iteration was regularized");

    // the singular pivot is sqrt(s + regParam) with s = 0
    let pivot = solver.cholesky.factor().get(0, 0, 0, 0);
    assert!((pivot - reg_param.sqrt()).abs() < 1e-10, "pivot {}", pivot);
}

/// Gradient bisection line search on a bound-saturated problem: alpha
/// settles where the directional derivative is stationary and the solve
/// still converges.
#[apply(factorization_algs)]
fn test_gradient_bisection_line_search(fac_alg: FactorizationAlg) {
    let mut stages = double_integrator_stages(3);
    stages[1].z_low[2] = -0.1;
    stages[1].z_upp[2] = 0.1;
    let x0 = Col::from_fn(2, |i| if i == 0 { 1.0 } else { 0.0 });
    let options = DualNewtonOptions::default()
        .with_factorization(fac_alg)
        .with_line_search(LineSearchKind::GradientBisection);
    let mut solver = build_solver(stages, &x0, options);

    let status = solver.solve(&mut SolverHooks::default()).unwrap();
    assert_eq!(status, Status::Optimal);
    let last = solver.log().last_record().unwrap();
    assert!(last.grad_norm < solver.options().stationarity_tolerance);
}

/// Iteration cap: with `max_iter = 1` the solver stops after exactly one
/// logged iteration; at the full log level every record carries a state
/// snapshot.
#[test]
fn test_iteration_limit() {
    let stages = double_integrator_stages(5);
    let x0 = Col::from_fn(2, |i| if i == 0 { 1.0 } else { 0.5 });
    let options = DualNewtonOptions::default()
        .with_max_iter(1)
        .with_log_level(crate::options::LogLevel::AllData);
    let mut hooks = crate::SolverHooks {
        callback: Box::new(ConvergenceOutput::new(&options)),
        terminator: Box::new(crate::terminators::NoOpTerminator {}),
    };
    let mut solver = build_solver(stages, &x0, options);

    let status = solver.solve(&mut hooks).unwrap();
    assert_eq!(status, Status::IterationLimit);
    assert_eq!(solver.log().num_iterations(), 1);
    assert_eq!(solver.log().snapshots().len(), solver.log().records().len());
    let snapshot = solver.log().snapshots().last().unwrap();
    assert_eq!(snapshot.lambda.nrows(), 5 * 2);
}

/// Forced gradient iterations after the first Newton step still reach the
/// optimum once the Newton iterations resume.
#[test]
fn test_forced_initial_gradient_steps() {
    let stages = double_integrator_stages(4);
    let x0 = Col::from_fn(2, |i| if i == 0 { 1.0 } else { 0.25 });
    let options = DualNewtonOptions::default()
        .with_initial_gradient_steps(2)
        .with_line_search(LineSearchKind::Backtracking)
        .with_max_iter(200);
    let mut solver = build_solver(stages, &x0, options);

    let status = solver.solve(&mut SolverHooks::default()).unwrap();
    assert_eq!(status, Status::Optimal);
    assert!(solver.log().num_iterations() >= 3);
}

/// Re-solving after an initial-state update (the MPC pattern) warm-starts
/// from the previous multipliers and converges to the new optimum.
#[test]
fn test_resolve_after_initial_state_update() {
    let stages = double_integrator_stages(5);
    let x0 = Col::from_fn(2, |i| if i == 0 { 1.0 } else { 0.5 });
    let options = DualNewtonOptions::default().with_line_search(LineSearchKind::Backtracking);
    let mut solver = build_solver(stages.clone(), &x0, options);
    assert_eq!(solver.solve(&mut SolverHooks::default()).unwrap(), Status::Optimal);

    let x1 = Col::from_fn(2, |i| if i == 0 { 0.6 } else { -0.2 });
    solver.embed_initial_state(&x1).unwrap();
    assert_eq!(solver.solve(&mut SolverHooks::default()).unwrap(), Status::Optimal);

    let reference = kkt_reference(&stages, &x1, &[]);
    let z = solver.primal_solution();
    assert!((&z - &reference).norm_l2() < 1e-6, "primal mismatch after update");
}

/// Every line search strategy drives the bound-saturated double integrator
/// to optimality.
#[rstest]
fn test_all_line_search_kinds_converge(
    #[values(
        LineSearchKind::Backtracking,
        LineSearchKind::BacktrackingAsChange,
        LineSearchKind::GoldenSection,
        LineSearchKind::GradientBisection,
        LineSearchKind::Grid,
        LineSearchKind::AcceleratedGradientBisection,
        LineSearchKind::AcceleratedGrid
    )]
    ls_kind: LineSearchKind,
) {
    let mut stages = double_integrator_stages(4);
    stages[1].z_low[2] = -0.1;
    stages[1].z_upp[2] = 0.1;
    let x0 = Col::from_fn(2, |i| if i == 0 { 1.0 } else { 0.25 });
    let options = DualNewtonOptions::default()
        .with_max_iter(200)
        .with_line_search(ls_kind);
    let mut solver = build_solver(stages, &x0, options);

    let status = solver.solve(&mut SolverHooks::default()).unwrap();
    assert_eq!(status, Status::Optimal, "line search {:?} did not converge", ls_kind);
}

/// A mixed problem with a general stage (dense engine) alongside clipping
/// stages converges and respects the affine row.
#[test]
fn test_mixed_stage_kinds_with_affine_row() {
    let mut stages = double_integrator_stages(3);
    // replace stage 1 by a general stage with a row limiting x0 + u
    let d_mat = faer::Mat::from_fn(1, 3, |_, j| if j == 0 || j == 2 { 1.0 } else { 0.0 });
    let clip = stages[1].clone();
    stages[1] = StageData::general(
        2,
        1,
        faer::Mat::from_fn(3, 3, |i, j| if i == j { 1.0 } else { 0.0 }),
        clip.q.clone(),
        0.,
        Some((clip.C.clone().unwrap(), clip.c.clone().unwrap())),
        clip.z_low.clone(),
        clip.z_upp.clone(),
        Some((
            d_mat,
            Col::from_fn(1, |_| E::NEG_INFINITY),
            Col::from_fn(1, |_| 0.4),
        )),
    );
    let x0 = Col::from_fn(2, |i| if i == 0 { 1.0 } else { 0.0 });
    let options = DualNewtonOptions::default()
        .with_line_search(LineSearchKind::Backtracking)
        .with_max_iter(200);
    let mut solver = build_solver(stages, &x0, options);

    let status = solver.solve(&mut SolverHooks::default()).unwrap();
    assert_eq!(status, Status::Optimal);

    // the affine row holds at the solution
    let z = solver.primal_solution();
    let row_value = z[3] + z[5];
    assert!(row_value <= 0.4 + 1e-7, "affine row violated: {}", row_value);
}
