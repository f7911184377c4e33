//! Shared problem builders and a dense reference solver for the tests.

use faer::{Col, Mat};

use crate::problem::StageData;
use crate::{E, I};

/// Stage records of a double integrator regulation problem:
/// `x+ = A x + B u` with `A = [[1, 1], [0, 1]]`, `B = [0.5, 1]`, unit
/// Hessians, zero linear terms, and unbounded variables. `n_intervals`
/// coupled stages plus the terminal stage.
pub fn double_integrator_stages(n_intervals: I) -> Vec<StageData> {
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
            Col::from_fn(3, |_| E::NEG_INFINITY),
            Col::from_fn(3, |_| E::INFINITY),
        ));
    }
    stages.push(StageData::clipping(
        2,
        0,
        Col::from_fn(2, |_| 1.),
        Col::zeros(2),
        0.,
        None,
        Col::from_fn(2, |_| E::NEG_INFINITY),
        Col::from_fn(2, |_| E::INFINITY),
    ));
    stages
}

/// Dense Gaussian elimination with partial pivoting; consumes the system.
pub fn solve_dense(a: &mut Mat<E>, b: &mut Col<E>) -> Col<E> {
    let n = a.nrows();
    for col in 0..n {
        let mut pivot_row = col;
        for row in (col + 1)..n {
            if a[(row, col)].abs() > a[(pivot_row, col)].abs() {
                pivot_row = row;
            }
        }
        assert!(a[(pivot_row, col)].abs() > 1e-12, "singular reference system");
        if pivot_row != col {
            for j in 0..n {
                let tmp = a[(col, j)];
                a[(col, j)] = a[(pivot_row, j)];
                a[(pivot_row, j)] = tmp;
            }
            let tmp = b[col];
            b[col] = b[pivot_row];
            b[pivot_row] = tmp;
        }
        for row in (col + 1)..n {
            let factor = a[(row, col)] / a[(col, col)];
            if factor != 0. {
                for j in col..n {
                    a[(row, j)] -= factor * a[(col, j)];
                }
                b[row] -= factor * b[col];
            }
        }
    }
    let mut x = Col::<E>::zeros(n);
    for row in (0..n).rev() {
        let mut sum = b[row];
        for j in (row + 1)..n {
            sum -= a[(row, j)] * x[j];
        }
        x[row] = sum / a[(row, row)];
    }
    x
}

/// Reference primal solution of an equality-constrained instance: the KKT
/// system over all stacked stage variables with the initial state pinned to
/// `x0`, all couplings as equalities, and `extra` as additional pinned
/// coordinates `(global z index, value)` standing in for active bounds.
pub fn kkt_reference(stages: &[StageData], x0: &Col<E>, extra: &[(I, E)]) -> Col<E> {
    let nx = stages[0].nx;
    let n_coupling = stages.len() - 1;
    let offsets: Vec<I> = stages
        .iter()
        .scan(0, |acc, s| {
            let o = *acc;
            *acc += s.nz();
            Some(o)
        })
        .collect();
    let nv: I = stages.iter().map(|s| s.nz()).sum();
    let nc = nx + n_coupling * nx + extra.len();
    let dim = nv + nc;

    let mut kkt = Mat::<E>::zeros(dim, dim);
    let mut rhs = Col::<E>::zeros(dim);

    // stationarity block
    for (k, stage) in stages.iter().enumerate() {
        for i in 0..stage.nz() {
            kkt[(offsets[k] + i, offsets[k] + i)] = match &stage.H {
                crate::problem::StageHessian::Diagonal(d) => d[i],
                crate::problem::StageHessian::Dense(m) => m[(i, i)],
            };
            rhs[offsets[k] + i] = -stage.q[i];
        }
    }

    // constraint rows: x0 pin, couplings, extra pins
    let mut row = nv;
    for i in 0..nx {
        kkt[(row, i)] = 1.;
        rhs[row] = x0[i];
        row += 1;
    }
    for k in 0..n_coupling {
        let c_mat = stages[k].C.as_ref().unwrap();
        let c_vec = stages[k].c.as_ref().unwrap();
        for i in 0..nx {
            for j in 0..stages[k].nz() {
                kkt[(row, offsets[k] + j)] = c_mat[(i, j)];
            }
            kkt[(row, offsets[k + 1] + i)] = -1.;
            rhs[row] = -c_vec[i];
            row += 1;
        }
    }
    for &(idx, value) in extra {
        kkt[(row, idx)] = 1.;
        rhs[row] = value;
        row += 1;
    }

    // symmetrize the constraint blocks
    for r in nv..dim {
        for c in 0..nv {
            kkt[(c, r)] = kkt[(r, c)];
        }
    }

    let x = solve_dense(&mut kkt, &mut rhs);
    Col::from_fn(nv, |i| x[i])
}
