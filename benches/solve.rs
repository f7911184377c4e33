use divan::Bencher;
use dunq::{
    DualNewtonOptions, LineSearchKind, OcpProblem, Solver, SolverHooks, StageData, Status,
};
use faer::{Col, Mat};

fn main() {
    divan::main();
}

fn double_integrator(n_intervals: usize, u_bound: f64) -> OcpProblem {
    let a = [[1., 1.], [0., 1.]];
    let b = [0.5, 1.];
    let c_mat = Mat::from_fn(2, 3, |i, j| if j < 2 { a[i][j] } else { b[i] });

    let mut stages = Vec::new();
    for _ in 0..n_intervals {
        stages.push(StageData::clipping(
            2,
            1,
            Col::from_fn(3, |_| 1.),
            Col::zeros(3),
            0.,
            Some((c_mat.clone(), Col::zeros(2))),
            Col::from_fn(3, |i| if i < 2 { f64::NEG_INFINITY } else { -u_bound }),
            Col::from_fn(3, |i| if i < 2 { f64::INFINITY } else { u_bound }),
        ));
    }
    stages.push(StageData::clipping(
        2,
        0,
        Col::from_fn(2, |_| 1.),
        Col::zeros(2),
        0.,
        None,
        Col::from_fn(2, |_| f64::NEG_INFINITY),
        Col::from_fn(2, |_| f64::INFINITY),
    ));

    let mut problem = OcpProblem::new(stages).unwrap();
    problem
        .embed_initial_state(&Col::from_fn(2, |i| if i == 0 { 1.0 } else { 0.5 }))
        .unwrap();
    problem
}

#[divan::bench(args = [5, 20, 50])]
fn unconstrained(bencher: Bencher, n_intervals: usize) {
    bencher.bench(|| {
        let problem = double_integrator(n_intervals, f64::INFINITY);
        let mut solver = problem
            .solver_builder()
            .with_options(DualNewtonOptions::default().with_line_search(LineSearchKind::Backtracking))
            .build()
            .unwrap();
        let status = solver.solve(&mut SolverHooks::default()).unwrap();
        assert_eq!(status, Status::Optimal);
        divan::black_box(solver.primal_solution());
    });
}

#[divan::bench(args = [5, 20])]
fn input_bounded(bencher: Bencher, n_intervals: usize) {
    bencher.bench(|| {
        let problem = double_integrator(n_intervals, 0.1);
        let mut solver = problem
            .solver_builder()
            .with_options(
                DualNewtonOptions::default().with_line_search(LineSearchKind::BacktrackingAsChange),
            )
            .build()
            .unwrap();
        let status = solver.solve(&mut SolverHooks::default()).unwrap();
        assert_eq!(status, Status::Optimal);
        divan::black_box(solver.objective_value());
    });
}
