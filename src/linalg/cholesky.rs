//! Banded Cholesky factorization of the block-tridiagonal Newton matrix.
//!
//! Two sweep directions are provided:
//! - [`BandedCholesky::factorize_forward`] runs top-down and produces a
//!   lower factor `L` with `L L' = H`; it always refactorizes the full band.
//! - [`BandedCholesky::factorize_reverse`] runs bottom-up and produces a
//!   lower factor `L` with `L' L = H`; it can be restarted from a given
//!   block row, recomputing only the leading part of the band whose source
//!   blocks changed (partial refactorization).
//!
//! Both sweeps support on-the-fly regularization: when a pivot squared-sum
//! falls below the tolerance, `reg_param` is added before the square root is
//! taken. In the forward sweep the affected row is additionally decoupled
//! (its below-pivot column is zeroed) and recorded in a sidecar bitset that
//! the back-substitutions consult to zero the corresponding solution
//! component.

use faer::Mat;

use crate::error::{DualNewtonError, FactorizationError, StageError};
use crate::linalg::banded::BlockTridiagonal;
use crate::{E, I};

pub struct BandedCholesky {
    factor: BlockTridiagonal,
    /// Rows regularized as singular directions by the forward sweep; their
    /// solution components are zeroed in back-substitution.
    singular: Vec<bool>,
}

impl BandedCholesky {
    pub fn new(n_blocks: I, nx: I) -> Self {
        Self {
            factor: BlockTridiagonal::new(n_blocks, nx),
            singular: vec![false; n_blocks * nx],
        }
    }

    pub fn factor(&self) -> &BlockTridiagonal {
        &self.factor
    }

    /// Smallest diagonal element of the factor.
    pub fn min_diag(&self) -> E {
        let mut min = E::INFINITY;
        for k in 0..self.factor.n_blocks() {
            for i in 0..self.factor.nx() {
                min = E::min(min, self.factor.get(k, 0, i, i));
            }
        }
        min
    }

    /// Top-down block-tridiagonal Cholesky, `L L' = H`. Returns whether any
    /// pivot was regularized.
    pub fn factorize_forward(
        &mut self,
        hessian: &BlockTridiagonal,
        reg_tolerance: E,
        on_the_fly_reg: Option<E>,
    ) -> Result<bool, FactorizationError> {
        let n = hessian.n_blocks();
        let nx = hessian.nx();
        let mut regularized = false;

        self.singular.fill(false);

        // go by block columns
        for k in 0..n {
            // go by in-block columns
            for j in 0..nx {
                // diagonal element: subtract the squared forepart of the
                // corresponding row, in this diagonal block and, for all
                // block columns but the first, in the sub-diagonal block
                let mut sum = hessian.get(k, 0, j, j);
                for l in 0..j {
                    sum -= self.factor.get(k, 0, j, l) * self.factor.get(k, 0, j, l);
                }
                if k > 0 {
                    for l in 0..nx {
                        sum -= self.factor.get(k, -1, j, l) * self.factor.get(k, -1, j, l);
                    }
                }

                let mut is_singular = false;
                if sum < reg_tolerance {
                    match on_the_fly_reg {
                        Some(reg_param) => {
                            sum += reg_param;
                            regularized = true;
                            is_singular = true;
                            self.singular[k * nx + j] = true;
                            if sum < reg_tolerance {
                                return Err(FactorizationError::IndefiniteHessian);
                            }
                        }
                        None => return Err(FactorizationError::IndefiniteHessian),
                    }
                }
                let pivot = sum.sqrt();
                self.factor.set(k, 0, j, j, pivot);

                // remainder of the j-th column, in this diagonal block and
                // in the following row's sub-diagonal block
                for i in (j + 1)..nx {
                    let value = if is_singular {
                        // decouple the regularized direction
                        0.
                    } else {
                        let mut sum = hessian.get(k, 0, i, j);
                        for l in 0..j {
                            sum -= self.factor.get(k, 0, i, l) * self.factor.get(k, 0, j, l);
                        }
                        if k > 0 {
                            for l in 0..nx {
                                sum -= self.factor.get(k, -1, i, l) * self.factor.get(k, -1, j, l);
                            }
                        }
                        sum / pivot
                    };
                    self.factor.set(k, 0, i, j, value);
                }
                if k < n - 1 {
                    for i in 0..nx {
                        let value = if is_singular {
                            0.
                        } else {
                            let mut sum = hessian.get(k + 1, -1, i, j);
                            for l in 0..j {
                                sum -=
                                    self.factor.get(k + 1, -1, i, l) * self.factor.get(k, 0, j, l);
                            }
                            sum / pivot
                        };
                        self.factor.set(k + 1, -1, i, j, value);
                    }
                }
            }
        }

        Ok(regularized)
    }

    /// Bottom-up block-tridiagonal Cholesky, `L' L = H`, restarted at block
    /// row `start_block` (clamped to the band). Block rows above
    /// `start_block` keep their factor from the previous call.
    pub fn factorize_reverse(
        &mut self,
        hessian: &BlockTridiagonal,
        start_block: I,
        reg_tolerance: E,
        on_the_fly_reg: Option<E>,
    ) -> Result<bool, FactorizationError> {
        let n = hessian.n_blocks();
        let nx = hessian.nx();
        let start = start_block.min(n - 1);
        let mut regularized = false;

        for row in 0..=(start * nx + nx - 1) {
            self.singular[row] = false;
        }

        // go by block columns, bottom up
        for k in (0..=start).rev() {
            for j in (0..nx).rev() {
                // diagonal element: subtract the squared rear part of the
                // corresponding row (transposed access)
                let mut sum = hessian.get(k, 0, j, j);
                for l in (j + 1)..nx {
                    sum -= self.factor.get(k, 0, l, j) * self.factor.get(k, 0, l, j);
                }
                if k < n - 1 {
                    for l in 0..nx {
                        sum -= self.factor.get(k + 1, -1, l, j) * self.factor.get(k + 1, -1, l, j);
                    }
                }

                if sum < reg_tolerance {
                    match on_the_fly_reg {
                        Some(reg_param) => {
                            sum += reg_param;
                            regularized = true;
                            if sum < reg_tolerance {
                                return Err(FactorizationError::IndefiniteHessian);
                            }
                        }
                        None => return Err(FactorizationError::IndefiniteHessian),
                    }
                }
                let pivot = sum.sqrt();
                self.factor.set(k, 0, j, j, pivot);

                // remainder of the j-th column, upwards via transposed
                // access, in this diagonal block and in this row's
                // sub-diagonal block
                for i in (0..j).rev() {
                    let mut sum = hessian.get(k, 0, j, i);
                    for l in (j + 1)..nx {
                        sum -= self.factor.get(k, 0, l, i) * self.factor.get(k, 0, l, j);
                    }
                    if k < n - 1 {
                        for l in 0..nx {
                            sum -=
                                self.factor.get(k + 1, -1, l, i) * self.factor.get(k + 1, -1, l, j);
                        }
                    }
                    self.factor.set(k, 0, j, i, sum / pivot);
                }
                if k > 0 {
                    for i in (0..nx).rev() {
                        let mut sum = hessian.get(k, -1, j, i);
                        for l in (j + 1)..nx {
                            sum -= self.factor.get(k, -1, l, i) * self.factor.get(k, 0, l, j);
                        }
                        self.factor.set(k, -1, j, i, sum / pivot);
                    }
                }
            }
        }

        Ok(regularized)
    }

    /// Solves `H x = g` for a forward factor (`L L' = H`): `L y = g`
    /// top-down, then `L' x = y` bottom-up.
    pub fn solve_forward(
        &self,
        rhs: &faer::Col<E>,
        out: &mut faer::Col<E>,
        zero: E,
    ) -> Result<(), DualNewtonError> {
        let n = self.factor.n_blocks();
        let nx = self.factor.nx();

        for k in 0..n {
            for i in 0..nx {
                let mut sum = rhs[k * nx + i];
                if k > 0 {
                    for j in 0..nx {
                        sum -= self.factor.get(k, -1, i, j) * out[(k - 1) * nx + j];
                    }
                }
                for j in 0..i {
                    sum -= self.factor.get(k, 0, i, j) * out[k * nx + j];
                }
                out[k * nx + i] = self.divide(sum, k, i, zero)?;
            }
        }

        for k in (0..n).rev() {
            for i in (0..nx).rev() {
                let mut sum = out[k * nx + i];
                for j in (i + 1)..nx {
                    sum -= self.factor.get(k, 0, j, i) * out[k * nx + j];
                }
                if k < n - 1 {
                    for j in 0..nx {
                        sum -= self.factor.get(k + 1, -1, j, i) * out[(k + 1) * nx + j];
                    }
                }
                out[k * nx + i] = self.divide(sum, k, i, zero)?;
            }
        }

        Ok(())
    }

    /// Solves `H x = g` for a reverse factor (`L' L = H`): `L' y = g`
    /// bottom-up, then `L x = y` top-down.
    pub fn solve_reverse(
        &self,
        rhs: &faer::Col<E>,
        out: &mut faer::Col<E>,
        zero: E,
    ) -> Result<(), DualNewtonError> {
        let n = self.factor.n_blocks();
        let nx = self.factor.nx();

        for k in (0..n).rev() {
            for i in (0..nx).rev() {
                let mut sum = rhs[k * nx + i];
                for j in (i + 1)..nx {
                    sum -= self.factor.get(k, 0, j, i) * out[k * nx + j];
                }
                if k < n - 1 {
                    for j in 0..nx {
                        sum -= self.factor.get(k + 1, -1, j, i) * out[(k + 1) * nx + j];
                    }
                }
                out[k * nx + i] = self.divide(sum, k, i, zero)?;
            }
        }

        for k in 0..n {
            for i in 0..nx {
                let mut sum = out[k * nx + i];
                if k > 0 {
                    for j in 0..nx {
                        sum -= self.factor.get(k, -1, i, j) * out[(k - 1) * nx + j];
                    }
                }
                for j in 0..i {
                    sum -= self.factor.get(k, 0, i, j) * out[k * nx + j];
                }
                out[k * nx + i] = self.divide(sum, k, i, zero)?;
            }
        }

        Ok(())
    }

    #[inline]
    fn divide(&self, sum: E, k: I, i: I, zero: E) -> Result<E, DualNewtonError> {
        let nx = self.factor.nx();
        if self.singular[k * nx + i] {
            return Ok(0.);
        }
        let pivot = self.factor.get(k, 0, i, i);
        if pivot.abs() < zero * sum.abs() {
            return Err(DualNewtonError::DivisionByZero);
        }
        Ok(sum / pivot)
    }
}

/// In-place dense Cholesky of a small SPD matrix; on success the lower
/// triangle holds `L` with `L L' = M` and the strict upper triangle is
/// zeroed. Used for the reduced Hessians of general stages.
pub(crate) fn chol_lower_in_place(m: &mut Mat<E>) -> Result<(), StageError> {
    let n = m.nrows();
    for j in 0..n {
        let mut sum = m[(j, j)];
        for l in 0..j {
            sum -= m[(j, l)] * m[(j, l)];
        }
        if sum <= 0. {
            return Err(StageError::SingularReducedHessian);
        }
        let pivot = sum.sqrt();
        m[(j, j)] = pivot;
        for i in (j + 1)..n {
            let mut sum = m[(i, j)];
            for l in 0..j {
                sum -= m[(i, l)] * m[(j, l)];
            }
            m[(i, j)] = sum / pivot;
        }
        for i in 0..j {
            m[(i, j)] = 0.;
        }
    }
    Ok(())
}

/// Solves `L X = B` in place for a dense lower-triangular `L`.
pub(crate) fn solve_lower_in_place(l: &Mat<E>, rhs: &mut Mat<E>) {
    let n = l.nrows();
    for col in 0..rhs.ncols() {
        for i in 0..n {
            let mut sum = rhs[(i, col)];
            for j in 0..i {
                sum -= l[(i, j)] * rhs[(j, col)];
            }
            rhs[(i, col)] = sum / l[(i, i)];
        }
    }
}

/// Solves `L' X = B` in place for a dense lower-triangular `L`.
pub(crate) fn solve_lower_transpose_in_place(l: &Mat<E>, rhs: &mut Mat<E>) {
    let n = l.nrows();
    for col in 0..rhs.ncols() {
        for i in (0..n).rev() {
            let mut sum = rhs[(i, col)];
            for j in (i + 1)..n {
                sum -= l[(j, i)] * rhs[(j, col)];
            }
            rhs[(i, col)] = sum / l[(i, i)];
        }
    }
}

#[cfg(test)]
mod tests {
    use faer::Col;
    use rstest::rstest;
    use rstest_reuse::{apply, template};

    use super::*;

    enum SweepDirection {
        Forward,
        Reverse,
    }

    /// Deterministic pseudo-random stream for test matrices.
    fn lcg(state: &mut u64) -> E {
        *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((*state >> 33) as E) / (u32::MAX as E) - 0.5
    }

    /// Builds an SPD block-tridiagonal matrix as `L L'` from a random lower
    /// block-bidiagonal `L` with positive diagonal.
    fn random_spd_band(n_blocks: usize, nx: usize, seed: u64) -> BlockTridiagonal {
        let mut state = seed;
        let mut l = BlockTridiagonal::new(n_blocks, nx);
        for k in 0..n_blocks {
            for i in 0..nx {
                for j in 0..=i {
                    let v = if i == j {
                        1.5 + lcg(&mut state).abs()
                    } else {
                        lcg(&mut state)
                    };
                    l.set(k, 0, i, j, v);
                }
                if k > 0 {
                    for j in 0..nx {
                        l.set(k, -1, i, j, lcg(&mut state));
                    }
                }
            }
        }
        let dense_l = l.to_dense_lower();
        let dense_h = &dense_l * &dense_l.transpose().to_owned();

        let mut h = BlockTridiagonal::new(n_blocks, nx);
        for k in 0..n_blocks {
            for i in 0..nx {
                for j in 0..nx {
                    h.set(k, 0, i, j, dense_h[(k * nx + i, k * nx + j)]);
                    if k > 0 {
                        h.set(k, -1, i, j, dense_h[(k * nx + i, (k - 1) * nx + j)]);
                    }
                }
            }
        }
        h
    }

    #[template]
    #[rstest]
    fn sweep_directions(
        #[values(SweepDirection::Forward, SweepDirection::Reverse)] direction: SweepDirection,
    ) {
    }

    #[apply(sweep_directions)]
    fn test_factorization_reconstructs_input(direction: SweepDirection) {
        let h = random_spd_band(4, 3, 7);
        let mut chol = BandedCholesky::new(4, 3);

        let reconstructed = match direction {
            SweepDirection::Forward => {
                chol.factorize_forward(&h, 1e-13, None).unwrap();
                let l = chol.factor().to_dense_lower();
                &l * &l.transpose().to_owned()
            }
            SweepDirection::Reverse => {
                chol.factorize_reverse(&h, 3, 1e-13, None).unwrap();
                let l = chol.factor().to_dense_lower();
                &l.transpose().to_owned() * &l
            }
        };
        let dense = h.to_dense();
        let err = (&reconstructed - &dense).norm_l2() / dense.norm_l2();
        assert!(err < 1e-10, "reconstruction error {:e}", err);
    }

    #[apply(sweep_directions)]
    fn test_back_substitution_solves_system(direction: SweepDirection) {
        let h = random_spd_band(5, 2, 21);
        let dim = h.dim();
        let mut chol = BandedCholesky::new(5, 2);
        let rhs = Col::from_fn(dim, |i| 1.0 - 0.3 * (i as E));
        let mut x = Col::<E>::zeros(dim);

        match direction {
            SweepDirection::Forward => {
                chol.factorize_forward(&h, 1e-13, None).unwrap();
                chol.solve_forward(&rhs, &mut x, 1e-50).unwrap();
            }
            SweepDirection::Reverse => {
                chol.factorize_reverse(&h, 4, 1e-13, None).unwrap();
                chol.solve_reverse(&rhs, &mut x, 1e-50).unwrap();
            }
        }

        let mut hx = Col::<E>::zeros(dim);
        h.mul_vec(&x, &mut hx);
        let err = (&hx - &rhs).norm_l2() / rhs.norm_l2();
        assert!(err < 1e-8, "solve residual {:e}", err);
    }

    #[test]
    fn test_partial_refactorization_matches_full() {
        let n_blocks = 4;
        let nx = 2;
        let mut h = random_spd_band(n_blocks, nx, 3);
        let mut chol = BandedCholesky::new(n_blocks, nx);
        chol.factorize_reverse(&h, n_blocks - 1, 1e-13, None).unwrap();

        // perturb block row 1 and below-coupled entries only
        h.set(1, 0, 0, 0, h.get(1, 0, 0, 0) + 0.5);
        chol.factorize_reverse(&h, 1, 1e-13, None).unwrap();

        let mut full = BandedCholesky::new(n_blocks, nx);
        full.factorize_reverse(&h, n_blocks - 1, 1e-13, None).unwrap();

        for (a, b) in chol.factor().data().iter().zip(full.factor().data()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[apply(sweep_directions)]
    fn test_singular_direction_regularization(direction: SweepDirection) {
        // zero out the last row and column of the band so the final pivot
        // becomes a structural singular direction
        let nx = 2;
        let mut h = random_spd_band(2, nx, 11);
        for j in 0..nx {
            h.set(1, -1, 1, j, 0.);
            h.set(1, 0, 1, j, 0.);
            h.set(1, 0, j, 1, 0.);
        }

        let reg_param = 1e-4;
        let mut chol = BandedCholesky::new(2, nx);
        let regularized = match direction {
            SweepDirection::Forward => chol.factorize_forward(&h, 1e-10, Some(reg_param)),
            SweepDirection::Reverse => chol.factorize_reverse(&h, 1, 1e-10, Some(reg_param)),
        }
        .unwrap();

        assert!(regularized);
        // affected pivot is sqrt(s + regParam) with s = 0
        let pivot = chol.factor().get(1, 0, 1, 1);
        assert!((pivot - reg_param.sqrt()).abs() < 1e-12);

        // without regularization the factorization must report indefiniteness
        let mut plain = BandedCholesky::new(2, nx);
        let res = match direction {
            SweepDirection::Forward => plain.factorize_forward(&h, 1e-10, None),
            SweepDirection::Reverse => plain.factorize_reverse(&h, 1, 1e-10, None),
        };
        assert_eq!(res.unwrap_err(), FactorizationError::IndefiniteHessian);
    }

    #[test]
    fn test_forward_singular_rows_are_zeroed_in_backsolve() {
        let nx = 2;
        let mut h = BlockTridiagonal::new(2, nx);
        // diag(4, 0, 9, 1): one singular direction at block 0, row 1
        h.set(0, 0, 0, 0, 4.);
        h.set(1, 0, 0, 0, 9.);
        h.set(1, 0, 1, 1, 1.);

        let mut chol = BandedCholesky::new(2, nx);
        chol.factorize_forward(&h, 1e-10, Some(1e-8)).unwrap();

        let rhs = Col::from_fn(4, |_| 1.0);
        let mut x = Col::<E>::zeros(4);
        chol.solve_forward(&rhs, &mut x, 1e-50).unwrap();

        assert!((x[0] - 0.25).abs() < 1e-12);
        assert_eq!(x[1], 0.);
        assert!((x[2] - 1. / 9.).abs() < 1e-12);
        assert!((x[3] - 1.).abs() < 1e-12);
    }

    #[test]
    fn test_dense_chol_helpers() {
        let mut m = Mat::<E>::zeros(3, 3);
        let entries = [[4.0, 1.0, 0.5], [1.0, 3.0, -0.2], [0.5, -0.2, 2.0]];
        for i in 0..3 {
            for j in 0..3 {
                m[(i, j)] = entries[i][j];
            }
        }
        let original = m.clone();
        chol_lower_in_place(&mut m).unwrap();

        let reconstructed = &m * &m.transpose().to_owned();
        assert!((&reconstructed - &original).norm_l2() < 1e-12);

        let mut rhs = Mat::<E>::zeros(3, 1);
        rhs[(0, 0)] = 1.;
        rhs[(1, 0)] = 2.;
        rhs[(2, 0)] = 3.;
        let b = rhs.clone();
        solve_lower_in_place(&m, &mut rhs);
        solve_lower_transpose_in_place(&m, &mut rhs);
        let recovered = &original * &rhs;
        assert!((&recovered - &b).norm_l2() < 1e-12);
    }
}
