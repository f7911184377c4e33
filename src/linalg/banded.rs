//! Packed storage for the block-tridiagonal Newton matrix.
//!
//! A symmetric block-tridiagonal matrix of `n_blocks` block rows with
//! `nx x nx` blocks is stored as `n_blocks` row-blocks of two column-blocks
//! each: the sub-diagonal block (`offset = -1`) and the diagonal block
//! (`offset = 0`). The super-diagonal is never stored; symmetry is implicit.
//! Block row 0 has no sub-diagonal block (treated as zero). The Cholesky
//! factor shares the same layout.

use faer::{Col, Mat, MatRef};

use crate::{E, I};

#[derive(Debug, Clone)]
pub struct BlockTridiagonal {
    n_blocks: I,
    nx: I,
    data: Vec<E>,
}

impl BlockTridiagonal {
    pub fn new(n_blocks: I, nx: I) -> Self {
        Self {
            n_blocks,
            nx,
            data: vec![0.; n_blocks * nx * 2 * nx],
        }
    }

    pub fn n_blocks(&self) -> I {
        self.n_blocks
    }

    pub fn nx(&self) -> I {
        self.nx
    }

    /// Scalar dimension `n_blocks * nx`.
    pub fn dim(&self) -> I {
        self.n_blocks * self.nx
    }

    pub fn data(&self) -> &[E] {
        &self.data
    }

    #[inline]
    fn idx(&self, k: I, offset: isize, i: I, j: I) -> I {
        debug_assert!(offset == -1 || offset == 0);
        debug_assert!(!(k == 0 && offset == -1));
        (k * self.nx + i) * 2 * self.nx + ((offset + 1) as I) * self.nx + j
    }

    /// Entry `(i, j)` of the block at block row `k`, column offset
    /// `offset` in `{-1, 0}`.
    #[inline]
    pub fn get(&self, k: I, offset: isize, i: I, j: I) -> E {
        self.data[self.idx(k, offset, i, j)]
    }

    #[inline]
    pub fn set(&mut self, k: I, offset: isize, i: I, j: I, value: E) {
        let idx = self.idx(k, offset, i, j);
        self.data[idx] = value;
    }

    #[inline]
    pub fn add(&mut self, k: I, offset: isize, i: I, j: I, value: E) {
        let idx = self.idx(k, offset, i, j);
        self.data[idx] += value;
    }

    pub fn write_diag_block(&mut self, k: I, block: MatRef<'_, E>) {
        for i in 0..self.nx {
            for j in 0..self.nx {
                self.set(k, 0, i, j, block[(i, j)]);
            }
        }
    }

    pub fn write_sub_block(&mut self, k: I, block: MatRef<'_, E>) {
        for i in 0..self.nx {
            for j in 0..self.nx {
                self.set(k, -1, i, j, block[(i, j)]);
            }
        }
    }

    /// Symmetric matrix-vector product `out = M v`, using transposed access
    /// of the sub-diagonal blocks for the implicit super-diagonal.
    pub fn mul_vec(&self, v: &Col<E>, out: &mut Col<E>) {
        let nx = self.nx;
        for k in 0..self.n_blocks {
            for i in 0..nx {
                out[k * nx + i] = 0.;
            }
            for i in 0..nx {
                if k > 0 {
                    for j in 0..nx {
                        out[k * nx + i] += self.get(k, -1, i, j) * v[(k - 1) * nx + j];
                    }
                }
                for j in 0..nx {
                    out[k * nx + i] += self.get(k, 0, i, j) * v[k * nx + j];
                }
                if k < self.n_blocks - 1 {
                    for j in 0..nx {
                        out[k * nx + j] += self.get(k + 1, -1, i, j) * v[(k + 1) * nx + i];
                    }
                }
            }
        }
    }

    /// Expands the band into a dense symmetric matrix. Intended for tests
    /// and full-state logging.
    pub fn to_dense(&self) -> Mat<E> {
        let nx = self.nx;
        let dim = self.dim();
        let mut dense = Mat::<E>::zeros(dim, dim);
        for k in 0..self.n_blocks {
            for i in 0..nx {
                for j in 0..nx {
                    dense[(k * nx + i, k * nx + j)] = self.get(k, 0, i, j);
                    if k > 0 {
                        dense[(k * nx + i, (k - 1) * nx + j)] = self.get(k, -1, i, j);
                        dense[((k - 1) * nx + j, k * nx + i)] = self.get(k, -1, i, j);
                    }
                }
            }
        }
        dense
    }

    /// Expands the band into a dense lower-triangular matrix (no symmetric
    /// mirroring); used to check Cholesky factors.
    pub fn to_dense_lower(&self) -> Mat<E> {
        let nx = self.nx;
        let dim = self.dim();
        let mut dense = Mat::<E>::zeros(dim, dim);
        for k in 0..self.n_blocks {
            for i in 0..nx {
                for j in 0..nx {
                    if j <= i {
                        dense[(k * nx + i, k * nx + j)] = self.get(k, 0, i, j);
                    }
                    if k > 0 {
                        dense[(k * nx + i, (k - 1) * nx + j)] = self.get(k, -1, i, j);
                    }
                }
            }
        }
        dense
    }

    pub fn fill_zero(&mut self) {
        self.data.fill(0.);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_layout_round_trip() {
        let mut m = BlockTridiagonal::new(3, 2);
        m.set(1, -1, 0, 1, 4.0);
        m.set(1, 0, 1, 0, -2.0);
        m.set(2, 0, 1, 1, 7.0);
        assert_eq!(m.get(1, -1, 0, 1), 4.0);
        assert_eq!(m.get(1, 0, 1, 0), -2.0);
        assert_eq!(m.get(2, 0, 1, 1), 7.0);
        assert_eq!(m.get(0, 0, 0, 0), 0.0);
        assert_eq!(m.data().len(), 3 * 2 * 2 * 2);
    }

    #[test]
    fn test_mul_vec_matches_dense() {
        let nx = 2;
        let mut m = BlockTridiagonal::new(3, nx);
        for k in 0..3 {
            for i in 0..nx {
                for j in 0..nx {
                    m.set(k, 0, i, j, ((k + 1) * (i + j + 1)) as E);
                    if k > 0 {
                        m.set(k, -1, i, j, (k as E) - 0.5 * (i as E) + (j as E));
                    }
                }
            }
            // keep diagonal blocks symmetric
            let v = 0.5 * (m.get(k, 0, 0, 1) + m.get(k, 0, 1, 0));
            m.set(k, 0, 0, 1, v);
            m.set(k, 0, 1, 0, v);
        }
        let v = Col::from_fn(6, |i| (i as E) - 2.5);
        let mut out = Col::<E>::zeros(6);
        m.mul_vec(&v, &mut out);
        let reference = m.to_dense() * &v;
        assert!((&out - &reference).norm_l2() < 1e-12);
    }
}
