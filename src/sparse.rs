//! CSR sparse-matrix primitive backing the dose-deposition artifacts.
//!
//! Provides the three kernels every entry evaluation reduces to: `y ← A·x`,
//! `g ← Aᵀ·v`, and the squared norm `‖A·x‖²`. Archives store matrices in
//! column-major (CSC) order, so ingestion transposes to CSR once; the
//! distribution path re-ingests CSR parts directly.

use crate::float::Float;

/// Sparse matrix in compressed-sparse-row form.
///
/// `rows` is the voxel count of the region of interest, `cols` the number of
/// beamlets (decision variables). Indices are 32-bit to match the inter-rank
/// wire format.
#[derive(Clone, Debug)]
pub struct CsrMatrix<F> {
    rows: usize,
    cols: usize,
    values: Vec<F>,
    col_indices: Vec<u32>,
    row_ptrs: Vec<u32>,
}

impl<F: Float> CsrMatrix<F> {
    /// Build from column-major (CSC) triplets, transposing to CSR.
    ///
    /// `row_indices[k]` is the row of `values[k]`; `col_ptrs` has length
    /// `cols + 1` and delimits each column's run in `values`.
    pub fn from_csc(
        rows: usize,
        cols: usize,
        values: &[F],
        row_indices: &[u32],
        col_ptrs: &[u32],
    ) -> Self {
        let nnz = values.len();
        debug_assert_eq!(row_indices.len(), nnz);
        debug_assert_eq!(col_ptrs.len(), cols + 1);
        debug_assert_eq!(col_ptrs[cols] as usize, nnz);

        // Counting sort by row: one pass to size each row, one to scatter.
        let mut row_ptrs = vec![0u32; rows + 1];
        for &r in row_indices {
            row_ptrs[r as usize + 1] += 1;
        }
        for i in 0..rows {
            row_ptrs[i + 1] += row_ptrs[i];
        }

        let mut out_values = vec![F::zero(); nnz];
        let mut out_cols = vec![0u32; nnz];
        let mut next = row_ptrs.clone();
        for col in 0..cols {
            let start = col_ptrs[col] as usize;
            let end = col_ptrs[col + 1] as usize;
            for k in start..end {
                let row = row_indices[k] as usize;
                let dst = next[row] as usize;
                out_values[dst] = values[k];
                out_cols[dst] = col as u32;
                next[row] += 1;
            }
        }

        CsrMatrix {
            rows,
            cols,
            values: out_values,
            col_indices: out_cols,
            row_ptrs,
        }
    }

    /// Build directly from CSR parts (the receiving side of matrix transport).
    ///
    /// `row_ptrs` has length `rows + 1`; `values` and `col_indices` have
    /// length `nnz = row_ptrs[rows]`.
    pub fn from_csr_parts(
        rows: usize,
        cols: usize,
        values: Vec<F>,
        col_indices: Vec<u32>,
        row_ptrs: Vec<u32>,
    ) -> Self {
        debug_assert_eq!(row_ptrs.len(), rows + 1);
        debug_assert_eq!(row_ptrs[rows] as usize, values.len());
        debug_assert_eq!(col_indices.len(), values.len());
        debug_assert!(col_indices.iter().all(|&c| (c as usize) < cols));

        CsrMatrix {
            rows,
            cols,
            values,
            col_indices,
            row_ptrs,
        }
    }

    /// Number of rows (voxels).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (beamlets).
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored nonzeros.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Stored nonzero values in row-major order.
    pub fn values(&self) -> &[F] {
        &self.values
    }

    /// Column index of each stored nonzero.
    pub fn col_indices(&self) -> &[u32] {
        &self.col_indices
    }

    /// Row pointer array of length `rows + 1`.
    pub fn row_ptrs(&self) -> &[u32] {
        &self.row_ptrs
    }

    /// Matrix-vector product `y ← A·x`.
    pub fn spmv(&self, x: &[F], y: &mut [F]) {
        debug_assert_eq!(x.len(), self.cols);
        debug_assert_eq!(y.len(), self.rows);
        for i in 0..self.rows {
            let start = self.row_ptrs[i] as usize;
            let end = self.row_ptrs[i + 1] as usize;
            let mut acc = F::zero();
            for k in start..end {
                acc = acc + self.values[k] * x[self.col_indices[k] as usize];
            }
            y[i] = acc;
        }
    }

    /// Transposed product `g ← Aᵀ·v`. Zeroes `g` first.
    pub fn spmv_transpose(&self, v: &[F], g: &mut [F]) {
        debug_assert_eq!(v.len(), self.rows);
        debug_assert_eq!(g.len(), self.cols);
        for gj in g.iter_mut() {
            *gj = F::zero();
        }
        for i in 0..self.rows {
            let vi = v[i];
            if vi == F::zero() {
                continue;
            }
            let start = self.row_ptrs[i] as usize;
            let end = self.row_ptrs[i + 1] as usize;
            for k in start..end {
                let j = self.col_indices[k] as usize;
                g[j] = g[j] + self.values[k] * vi;
            }
        }
    }

    /// Squared norm `‖A·x‖²`, leaving `A·x` in `scratch`.
    ///
    /// The quadratic cost uses `½·‖A·x‖² + c`; the caller applies the factor
    /// and offset.
    pub fn quad_mul(&self, x: &[F], scratch: &mut [F]) -> F {
        self.spmv(x, scratch);
        let mut acc = F::zero();
        for &yi in scratch.iter() {
            acc = acc + yi * yi;
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2x3 matrix [[1, 0, 2], [0, 3, 0]] in CSC form.
    fn example_csc() -> CsrMatrix<f64> {
        CsrMatrix::from_csc(2, 3, &[1.0, 3.0, 2.0], &[0, 1, 0], &[0, 1, 2, 3])
    }

    #[test]
    fn from_csc_transposes_to_row_major() {
        let m = example_csc();
        assert_eq!(m.rows(), 2);
        assert_eq!(m.cols(), 3);
        assert_eq!(m.nnz(), 3);
        assert_eq!(m.row_ptrs(), &[0, 2, 3]);
        assert_eq!(m.col_indices(), &[0, 2, 1]);
        assert_eq!(m.values(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn spmv_matches_dense() {
        let m = example_csc();
        let mut y = [0.0; 2];
        m.spmv(&[1.0, 2.0, 3.0], &mut y);
        assert_eq!(y, [7.0, 6.0]);
    }

    #[test]
    fn spmv_transpose_matches_dense() {
        let m = example_csc();
        let mut g = [9.0; 3];
        m.spmv_transpose(&[1.0, 2.0], &mut g);
        assert_eq!(g, [1.0, 6.0, 2.0]);
    }

    #[test]
    fn quad_mul_is_squared_norm() {
        let m = example_csc();
        let mut scratch = [0.0; 2];
        let q = m.quad_mul(&[1.0, 2.0, 3.0], &mut scratch);
        assert_eq!(q, 7.0 * 7.0 + 6.0 * 6.0);
        assert_eq!(scratch, [7.0, 6.0]);
    }

    #[test]
    fn csr_parts_roundtrip() {
        let m = example_csc();
        let rebuilt = CsrMatrix::from_csr_parts(
            m.rows(),
            m.cols(),
            m.values().to_vec(),
            m.col_indices().to_vec(),
            m.row_ptrs().to_vec(),
        );
        let mut y0 = [0.0; 2];
        let mut y1 = [0.0; 2];
        m.spmv(&[0.5, -1.0, 4.0], &mut y0);
        rebuilt.spmv(&[0.5, -1.0, 4.0], &mut y1);
        assert_eq!(y0, y1);
    }

    #[test]
    fn empty_rows_produce_zeros() {
        // 3x2 with only one nonzero in the middle row.
        let m = CsrMatrix::from_csc(3, 2, &[5.0], &[1], &[0, 1, 1]);
        let mut y = [1.0; 3];
        m.spmv(&[2.0, 7.0], &mut y);
        assert_eq!(y, [0.0, 10.0, 0.0]);
    }
}
