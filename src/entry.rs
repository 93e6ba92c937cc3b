//! Per-term evaluation: one weighted objective or one constraint function.
//!
//! Every entry evaluates `f(A·x)` for a shared dose-deposition artifact `A`
//! and one of six function families. Values and gradients reuse an
//! interior-mutable scratch pair (`y`, `v`) so repeated solver callbacks do
//! not allocate.

use std::cell::RefCell;

use tracing::warn;

use crate::archive::ArchiveError;
use crate::sparse::CsrMatrix;

/// Threshold below which a mean-vector component is treated as structurally
/// zero when computing the gradient sparsity pattern.
const MEAN_NONZERO_THRESHOLD: f64 = 1e-20;

/// The function family of a plan entry.
///
/// `Dvh` and `Chain` are carried through construction and transport but have
/// no evaluation semantics: their value is 0 and their gradient is the zero
/// vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum FunctionType {
    Min,
    Max,
    Mean,
    Quadratic,
    Geud,
    Ltcp,
    Dvh,
    Chain,
}

impl FunctionType {
    /// Resolve an archive type id to a function family.
    ///
    /// Archive id 1 covers the whole linear family; the matrix display name
    /// disambiguates: a `"(mean)"` marker means the matrix was pre-collapsed
    /// to a mean vector, otherwise the penalty direction follows `minimise`.
    /// Nonlinear ids 2..=6 map to Quadratic, gEUD, LTCP, DVH, Chain.
    /// Returns `None` for ids outside the archive's enumeration.
    pub fn resolve(type_id: u32, minimise: bool, matrix_name: &str) -> Option<FunctionType> {
        match type_id {
            1 => {
                if matrix_name.contains("(mean)") {
                    Some(FunctionType::Mean)
                } else if minimise {
                    Some(FunctionType::Max)
                } else {
                    Some(FunctionType::Min)
                }
            }
            2 => Some(FunctionType::Quadratic),
            3 => Some(FunctionType::Geud),
            4 => Some(FunctionType::Ltcp),
            5 => Some(FunctionType::Dvh),
            6 => Some(FunctionType::Chain),
            _ => None,
        }
    }

    /// Whether the family has implemented value/gradient semantics.
    pub fn is_implemented(self) -> bool {
        !matches!(self, FunctionType::Dvh | FunctionType::Chain)
    }
}

impl std::fmt::Display for FunctionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FunctionType::Min => "Min",
            FunctionType::Max => "Max",
            FunctionType::Mean => "Mean",
            FunctionType::Quadratic => "Quadratic",
            FunctionType::Geud => "gEUD",
            FunctionType::Ltcp => "LTCP",
            FunctionType::Dvh => "DVH",
            FunctionType::Chain => "Chain",
        };
        f.write_str(name)
    }
}

/// A dose-deposition artifact: a CSR matrix, or a dense vector when the
/// matrix was pre-collapsed to `(1/|R|)·𝟙ᵀ·A` for a mean entry.
#[derive(Clone, Debug)]
pub enum DoseArtifact {
    Matrix(CsrMatrix<f64>),
    MeanVector(Vec<f64>),
}

impl DoseArtifact {
    /// Number of decision variables this artifact maps from.
    pub fn num_vars(&self) -> usize {
        match self {
            DoseArtifact::Matrix(m) => m.cols(),
            DoseArtifact::MeanVector(v) => v.len(),
        }
    }

    /// Workload weight for load balancing: stored nonzeros for a matrix,
    /// vector length for a mean vector.
    pub fn workload_nnz(&self) -> usize {
        match self {
            DoseArtifact::Matrix(m) => m.nnz(),
            DoseArtifact::MeanVector(v) => v.len(),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            DoseArtifact::Matrix(_) => "matrix",
            DoseArtifact::MeanVector(_) => "mean vector",
        }
    }
}

/// Transportable entry metadata: everything an entry carries except the
/// artifact itself and the derived state rebuilt on attachment.
#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct EntryMeta {
    pub roi_name: String,
    pub data_id: u32,
    pub function_type: FunctionType,
    pub is_constraint: bool,
    pub minimise: bool,
    pub active: bool,
    pub rhs: f64,
    pub weight: f64,
    pub c: f64,
    pub parameters: Vec<f64>,
    pub num_vars: u32,
}

/// Evaluation scratch reused across calls.
///
/// `y` holds the dose vector `A·x` from the most recent value or gradient
/// call; `v` holds the elementwise multiplier fed to `Aᵀ`. Not safe for
/// concurrent calls on the same entry; callers must not observe the
/// buffers across calls.
#[derive(Debug, Default)]
struct Scratch {
    y: Vec<f64>,
    v: Vec<f64>,
}

/// One weighted term of the objective, or one constraint function.
///
/// Entries are immutable after construction apart from the scratch pair.
/// The dose artifact is owned by the problem (or the worker's local table)
/// and borrowed at call time, keyed by `data_id`.
#[derive(Debug)]
pub struct Entry {
    roi_name: String,
    data_id: u32,
    function_type: FunctionType,
    is_constraint: bool,
    minimise: bool,
    active: bool,
    rhs: f64,
    weight: f64,
    c: f64,
    parameters: Vec<f64>,
    num_vars: usize,
    voxels: usize,
    workload: usize,
    grad_nonzero_idxs: Vec<u32>,
    scratch: RefCell<Scratch>,
}

impl Entry {
    /// Build an entry from its metadata and the artifact it references.
    ///
    /// Computes the gradient sparsity pattern and sizes the scratch buffers.
    /// Fails if the artifact kind contradicts the function family or the
    /// variable counts disagree.
    pub fn from_meta(meta: EntryMeta, artifact: &DoseArtifact) -> Result<Entry, ArchiveError> {
        let is_mean = meta.function_type == FunctionType::Mean;
        match artifact {
            DoseArtifact::MeanVector(_) if !is_mean => {
                return Err(ArchiveError::ArtifactKindMismatch {
                    roi: meta.roi_name,
                    data_id: meta.data_id,
                    expected: "matrix",
                    found: artifact.kind_name(),
                });
            }
            DoseArtifact::Matrix(_) if is_mean => {
                return Err(ArchiveError::ArtifactKindMismatch {
                    roi: meta.roi_name,
                    data_id: meta.data_id,
                    expected: "mean vector",
                    found: artifact.kind_name(),
                });
            }
            _ => {}
        }

        let num_vars = artifact.num_vars();
        if meta.num_vars != 0 && meta.num_vars as usize != num_vars {
            return Err(ArchiveError::DimensionMismatch {
                roi: meta.roi_name,
                expected: meta.num_vars as usize,
                found: num_vars,
            });
        }

        if !meta.function_type.is_implemented() {
            warn!(
                roi = %meta.roi_name,
                function_type = %meta.function_type,
                "function type is not implemented; value and gradient evaluate to zero"
            );
        }

        let (voxels, grad_nonzero_idxs) = match artifact {
            DoseArtifact::Matrix(m) => (m.rows(), matrix_nonzero_cols(m)),
            DoseArtifact::MeanVector(v) => (0, mean_nonzero_idxs(v)),
        };

        Ok(Entry {
            roi_name: meta.roi_name,
            data_id: meta.data_id,
            function_type: meta.function_type,
            is_constraint: meta.is_constraint,
            minimise: meta.minimise,
            active: meta.active,
            rhs: meta.rhs,
            weight: meta.weight,
            c: meta.c,
            parameters: meta.parameters,
            num_vars,
            voxels,
            workload: artifact.workload_nnz(),
            grad_nonzero_idxs,
            scratch: RefCell::new(Scratch {
                y: vec![0.0; voxels],
                v: vec![0.0; voxels],
            }),
        })
    }

    /// Recover the transportable metadata of this entry.
    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            roi_name: self.roi_name.clone(),
            data_id: self.data_id,
            function_type: self.function_type,
            is_constraint: self.is_constraint,
            minimise: self.minimise,
            active: self.active,
            rhs: self.rhs,
            weight: self.weight,
            c: self.c,
            parameters: self.parameters.clone(),
            num_vars: self.num_vars as u32,
        }
    }

    pub fn roi_name(&self) -> &str {
        &self.roi_name
    }

    pub fn data_id(&self) -> u32 {
        self.data_id
    }

    pub fn function_type(&self) -> FunctionType {
        self.function_type
    }

    pub fn is_constraint(&self) -> bool {
        self.is_constraint
    }

    pub fn is_minimisation(&self) -> bool {
        self.minimise
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn rhs(&self) -> f64 {
        self.rhs
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    /// Workload weight used by the load distributor.
    pub fn workload_nnz(&self) -> usize {
        self.workload
    }

    /// Strictly ascending column indices that can hold nonzero gradient
    /// components. The Jacobian structure and the sparse gradient follow
    /// this ordering.
    pub fn grad_nonzero_idxs(&self) -> &[u32] {
        &self.grad_nonzero_idxs
    }

    /// Evaluate the entry's function value at `x`.
    ///
    /// `artifact` must be the artifact this entry was constructed against.
    /// The dose vector `A·x` is left in scratch for a following gradient
    /// call with `cached_dose = true`. Dose is assumed nonnegative for gEUD
    /// (the solver keeps `x ≥ 0`).
    pub fn value(&self, artifact: &DoseArtifact, x: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.num_vars);
        match self.function_type {
            FunctionType::Quadratic => self.quadratic_value(self.matrix(artifact), x),
            FunctionType::Max => self.penalty_max(self.matrix(artifact), x),
            FunctionType::Min => self.penalty_min(self.matrix(artifact), x),
            FunctionType::Mean => mean_value(self.mean_vec(artifact), x),
            FunctionType::Geud => self.geud_value(self.matrix(artifact), x),
            FunctionType::Ltcp => self.ltcp_value(self.matrix(artifact), x),
            FunctionType::Dvh | FunctionType::Chain => 0.0,
        }
    }

    /// Write the dense gradient of the entry into `grad` (length `num_vars`).
    ///
    /// `cached_dose` reuses the dose vector left in scratch by an immediately
    /// preceding `value` call at the same `x`.
    pub fn gradient(&self, artifact: &DoseArtifact, x: &[f64], grad: &mut [f64], cached_dose: bool) {
        debug_assert_eq!(x.len(), self.num_vars);
        debug_assert_eq!(grad.len(), self.num_vars);
        match self.function_type {
            FunctionType::Quadratic => self.quadratic_grad(self.matrix(artifact), x, grad, cached_dose),
            FunctionType::Max => self.penalty_max_grad(self.matrix(artifact), x, grad, cached_dose),
            FunctionType::Min => self.penalty_min_grad(self.matrix(artifact), x, grad, cached_dose),
            FunctionType::Mean => grad.copy_from_slice(self.mean_vec(artifact)),
            FunctionType::Geud => self.geud_grad(self.matrix(artifact), x, grad, cached_dose),
            FunctionType::Ltcp => self.ltcp_grad(self.matrix(artifact), x, grad, cached_dose),
            FunctionType::Dvh | FunctionType::Chain => grad.fill(0.0),
        }
    }

    /// Gradient gathered at `grad_nonzero_idxs`, in that order.
    ///
    /// This is the per-row payload of the constraint Jacobian; the ordering
    /// matches the structure declared to the solver at setup.
    pub fn sparse_gradient(&self, artifact: &DoseArtifact, x: &[f64]) -> Vec<f64> {
        let mut dense = vec![0.0; self.num_vars];
        self.gradient(artifact, x, &mut dense, false);
        self.grad_nonzero_idxs
            .iter()
            .map(|&j| dense[j as usize])
            .collect()
    }

    fn matrix<'a>(&self, artifact: &'a DoseArtifact) -> &'a CsrMatrix<f64> {
        match artifact {
            DoseArtifact::Matrix(m) => m,
            DoseArtifact::MeanVector(_) => {
                panic!("entry `{}` expects a matrix artifact", self.roi_name)
            }
        }
    }

    fn mean_vec<'a>(&self, artifact: &'a DoseArtifact) -> &'a [f64] {
        match artifact {
            DoseArtifact::MeanVector(v) => v,
            DoseArtifact::Matrix(_) => {
                panic!("entry `{}` expects a mean-vector artifact", self.roi_name)
            }
        }
    }

    fn quadratic_value(&self, matrix: &CsrMatrix<f64>, x: &[f64]) -> f64 {
        let mut scratch = self.scratch.borrow_mut();
        0.5 * matrix.quad_mul(x, &mut scratch.y) + self.c
    }

    fn penalty_min(&self, matrix: &CsrMatrix<f64>, x: &[f64]) -> f64 {
        let mut scratch = self.scratch.borrow_mut();
        matrix.spmv(x, &mut scratch.y);
        let mut sq_diff = 0.0;
        for &yi in scratch.y.iter() {
            let clamped = (yi - self.rhs).min(0.0);
            sq_diff += clamped * clamped;
        }
        sq_diff / self.voxels as f64
    }

    fn penalty_max(&self, matrix: &CsrMatrix<f64>, x: &[f64]) -> f64 {
        let mut scratch = self.scratch.borrow_mut();
        matrix.spmv(x, &mut scratch.y);
        let mut sq_diff = 0.0;
        for &yi in scratch.y.iter() {
            let clamped = (yi - self.rhs).max(0.0);
            sq_diff += clamped * clamped;
        }
        sq_diff / self.voxels as f64
    }

    fn geud_value(&self, matrix: &CsrMatrix<f64>, x: &[f64]) -> f64 {
        let mut scratch = self.scratch.borrow_mut();
        matrix.spmv(x, &mut scratch.y);
        let a = self.parameters[0];
        let mut sum = 0.0;
        for &yi in scratch.y.iter() {
            sum += yi.powf(a);
        }
        (sum / self.voxels as f64).powf(1.0 / a)
    }

    fn ltcp_value(&self, matrix: &CsrMatrix<f64>, x: &[f64]) -> f64 {
        let mut scratch = self.scratch.borrow_mut();
        matrix.spmv(x, &mut scratch.y);
        let prescribed_dose = self.parameters[0];
        let alpha = self.parameters[1];
        let mut sum = 0.0;
        for &yi in scratch.y.iter() {
            sum += (-alpha * (yi - prescribed_dose)).exp();
        }
        sum / self.voxels as f64
    }

    fn quadratic_grad(&self, matrix: &CsrMatrix<f64>, x: &[f64], grad: &mut [f64], cached_dose: bool) {
        let mut scratch = self.scratch.borrow_mut();
        let Scratch { y, .. } = &mut *scratch;
        if !cached_dose {
            matrix.spmv(x, y);
        }
        matrix.spmv_transpose(y, grad);
    }

    fn penalty_min_grad(&self, matrix: &CsrMatrix<f64>, x: &[f64], grad: &mut [f64], cached_dose: bool) {
        let mut scratch = self.scratch.borrow_mut();
        let Scratch { y, v } = &mut *scratch;
        if !cached_dose {
            matrix.spmv(x, y);
        }
        for i in 0..v.len() {
            v[i] = 2.0 * (y[i] - self.rhs).min(0.0);
        }
        matrix.spmv_transpose(v, grad);
    }

    fn penalty_max_grad(&self, matrix: &CsrMatrix<f64>, x: &[f64], grad: &mut [f64], cached_dose: bool) {
        let mut scratch = self.scratch.borrow_mut();
        let Scratch { y, v } = &mut *scratch;
        if !cached_dose {
            matrix.spmv(x, y);
        }
        for i in 0..v.len() {
            v[i] = 2.0 * (y[i] - self.rhs).max(0.0);
        }
        matrix.spmv_transpose(v, grad);
    }

    fn geud_grad(&self, matrix: &CsrMatrix<f64>, x: &[f64], grad: &mut [f64], cached_dose: bool) {
        let mut scratch = self.scratch.borrow_mut();
        let Scratch { y, v } = &mut *scratch;
        if !cached_dose {
            matrix.spmv(x, y);
        }
        let a = self.parameters[0];
        let m = self.voxels as f64;

        // Common factor m^(-1/a) · (Σ yᵢᵃ)^(1/a - 1) shared by all components.
        let mut power_sum = 0.0;
        for &yi in y.iter() {
            power_sum += yi.powf(a);
        }
        let common = power_sum.powf(1.0 / a - 1.0) * m.powf(-1.0 / a);

        for i in 0..v.len() {
            v[i] = y[i].powf(a - 1.0) * common;
        }
        matrix.spmv_transpose(v, grad);
    }

    fn ltcp_grad(&self, matrix: &CsrMatrix<f64>, x: &[f64], grad: &mut [f64], cached_dose: bool) {
        let mut scratch = self.scratch.borrow_mut();
        let Scratch { y, v } = &mut *scratch;
        if !cached_dose {
            matrix.spmv(x, y);
        }
        let prescribed_dose = self.parameters[0];
        let alpha = self.parameters[1];
        let m = self.voxels as f64;
        for i in 0..v.len() {
            v[i] = -alpha / m * (-alpha * (y[i] - prescribed_dose)).exp();
        }
        matrix.spmv_transpose(v, grad);
    }
}

fn mean_value(mean_vec: &[f64], x: &[f64]) -> f64 {
    mean_vec.iter().zip(x.iter()).map(|(&m, &xi)| m * xi).sum()
}

/// Distinct, sorted column indices appearing in the CSR column-index array.
fn matrix_nonzero_cols(matrix: &CsrMatrix<f64>) -> Vec<u32> {
    let mut cols = matrix.col_indices().to_vec();
    cols.sort_unstable();
    cols.dedup();
    cols
}

/// Indices where the mean vector is structurally nonzero.
fn mean_nonzero_idxs(mean_vec: &[f64]) -> Vec<u32> {
    mean_vec
        .iter()
        .enumerate()
        .filter(|&(_, &m)| m >= MEAN_NONZERO_THRESHOLD)
        .map(|(i, _)| i as u32)
        .collect()
}
