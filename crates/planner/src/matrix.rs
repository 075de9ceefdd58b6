use crate::constants::{FORMAT_CSC, FORMAT_CSR, FORMAT_DENSE};
use crate::error::{PlanError, Result};
use nalgebra::{DMatrix, DVector};
use sprs::{CsMat, TriMat};

/// Capabilities the planner needs from an influence matrix (voxels x beams).
pub trait DoseOperator {
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;

    /// y = A x
    fn apply(&self, x: &DVector<f64>) -> DVector<f64>;

    /// Non-zero entries (column, value) of row `i`
    fn row_entries(&self, i: usize) -> Vec<(usize, f64)>;

    /// Mean over rows, one entry per column
    fn column_means(&self) -> DVector<f64>;
}

impl DoseOperator for DMatrix<f64> {
    fn rows(&self) -> usize {
        self.nrows()
    }

    fn cols(&self) -> usize {
        self.ncols()
    }

    fn apply(&self, x: &DVector<f64>) -> DVector<f64> {
        self * x
    }

    fn row_entries(&self, i: usize) -> Vec<(usize, f64)> {
        self.row(i)
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(j, v)| (j, *v))
            .collect()
    }

    fn column_means(&self) -> DVector<f64> {
        let m = self.nrows().max(1) as f64;
        DVector::from_iterator(
            self.ncols(),
            (0..self.ncols()).map(|j| self.column(j).sum() / m),
        )
    }
}

impl DoseOperator for CsMat<f64> {
    fn rows(&self) -> usize {
        CsMat::rows(self)
    }

    fn cols(&self) -> usize {
        CsMat::cols(self)
    }

    fn apply(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = DVector::zeros(CsMat::rows(self));
        if self.is_csr() {
            sprs::prod::mul_acc_mat_vec_csr(self.view(), x.as_slice(), y.as_mut_slice());
        } else {
            sprs::prod::mul_acc_mat_vec_csc(self.view(), x.as_slice(), y.as_mut_slice());
        }
        y
    }

    fn row_entries(&self, i: usize) -> Vec<(usize, f64)> {
        if self.is_csr() {
            self.outer_view(i)
                .map(|row| row.iter().map(|(j, &v)| (j, v)).collect())
                .unwrap_or_default()
        } else {
            let mut entries: Vec<(usize, f64)> = self
                .iter()
                .filter(|(_, (r, _))| *r == i)
                .map(|(&v, (_, c))| (c, v))
                .collect();
            entries.sort_by_key(|&(c, _)| c);
            entries
        }
    }

    fn column_means(&self) -> DVector<f64> {
        let mut means = DVector::zeros(CsMat::cols(self));
        for (&v, (_, c)) in self.iter() {
            means[c] += v;
        }
        means / CsMat::rows(self).max(1) as f64
    }
}

/// Influence matrix in one of the supported storage forms.
#[derive(Debug, Clone)]
pub enum DoseMatrix {
    Dense(DMatrix<f64>),
    Sparse(CsMat<f64>),
}

impl DoseMatrix {
    pub fn dense(m: DMatrix<f64>) -> Self {
        DoseMatrix::Dense(m)
    }

    /// Sparse matrices are kept in CSR order so that row access stays cheap.
    pub fn sparse(m: CsMat<f64>) -> Self {
        if m.is_csr() {
            DoseMatrix::Sparse(m)
        } else {
            DoseMatrix::Sparse(m.to_csr())
        }
    }

    /// Dense matrix from row-major data
    pub fn from_row_slice(rows: usize, cols: usize, data: &[f64]) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(PlanError::Dimension {
                what: "dense matrix data",
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(DoseMatrix::Dense(DMatrix::from_row_slice(rows, cols, data)))
    }

    /// Builds a matrix from raw storage named by `format`.
    ///
    /// `"dense"` expects row-major `data` and ignores `indptr`/`indices`;
    /// `"csr"`/`"csc"` expect compressed storage. Any other name is rejected.
    pub fn from_parts(
        format: &str,
        shape: (usize, usize),
        indptr: Vec<usize>,
        indices: Vec<usize>,
        data: Vec<f64>,
    ) -> Result<Self> {
        let (rows, cols) = shape;
        match format {
            FORMAT_DENSE => Self::from_row_slice(rows, cols, &data),
            FORMAT_CSR => CsMat::try_new(shape, indptr, indices, data)
                .map(Self::sparse)
                .map_err(|(_, _, _, e)| {
                    PlanError::MatrixType(format!("malformed csr storage: {:?}", e))
                }),
            FORMAT_CSC => CsMat::try_new_csc(shape, indptr, indices, data)
                .map(Self::sparse)
                .map_err(|(_, _, _, e)| {
                    PlanError::MatrixType(format!("malformed csc storage: {:?}", e))
                }),
            other => Err(PlanError::MatrixType(format!(
                "'{}' (expected '{}', '{}' or '{}')",
                other, FORMAT_DENSE, FORMAT_CSR, FORMAT_CSC
            ))),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, DoseMatrix::Sparse(_))
    }

    pub fn storage(&self) -> &'static str {
        match self {
            DoseMatrix::Dense(_) => FORMAT_DENSE,
            DoseMatrix::Sparse(_) => FORMAT_CSR,
        }
    }

    /// New matrix made of the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Result<DoseMatrix> {
        let bound = self.rows();
        if let Some(&bad) = rows.iter().find(|&&r| r >= bound) {
            return Err(PlanError::Index {
                what: "matrix row",
                index: bad,
                bound,
            });
        }
        match self {
            DoseMatrix::Dense(m) => Ok(DoseMatrix::Dense(m.select_rows(rows.iter()))),
            DoseMatrix::Sparse(m) => {
                let mut tri = TriMat::new((rows.len(), CsMat::cols(m)));
                for (new_row, &old_row) in rows.iter().enumerate() {
                    for (c, v) in m.row_entries(old_row) {
                        tri.add_triplet(new_row, c, v);
                    }
                }
                Ok(DoseMatrix::Sparse(tri.to_csr()))
            }
        }
    }
}

impl DoseOperator for DoseMatrix {
    fn rows(&self) -> usize {
        match self {
            DoseMatrix::Dense(m) => DoseOperator::rows(m),
            DoseMatrix::Sparse(m) => DoseOperator::rows(m),
        }
    }

    fn cols(&self) -> usize {
        match self {
            DoseMatrix::Dense(m) => DoseOperator::cols(m),
            DoseMatrix::Sparse(m) => DoseOperator::cols(m),
        }
    }

    fn apply(&self, x: &DVector<f64>) -> DVector<f64> {
        match self {
            DoseMatrix::Dense(m) => m.apply(x),
            DoseMatrix::Sparse(m) => m.apply(x),
        }
    }

    fn row_entries(&self, i: usize) -> Vec<(usize, f64)> {
        match self {
            DoseMatrix::Dense(m) => m.row_entries(i),
            DoseMatrix::Sparse(m) => m.row_entries(i),
        }
    }

    fn column_means(&self) -> DVector<f64> {
        match self {
            DoseMatrix::Dense(m) => m.column_means(),
            DoseMatrix::Sparse(m) => m.column_means(),
        }
    }
}

impl From<DMatrix<f64>> for DoseMatrix {
    fn from(m: DMatrix<f64>) -> Self {
        DoseMatrix::dense(m)
    }
}

impl From<CsMat<f64>> for DoseMatrix {
    fn from(m: CsMat<f64>) -> Self {
        DoseMatrix::sparse(m)
    }
}
