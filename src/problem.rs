//! Problem aggregation: owns the artifacts and entries, sums weighted
//! objective terms, and lays out the constraint vector and Jacobian the way
//! the solver declared them at setup.

use std::collections::HashMap;

use tracing::debug;

use crate::archive::{ArchiveError, ArchiveProblem, EntryRecord, MatrixRecord};
use crate::entry::{DoseArtifact, Entry, EntryMeta, FunctionType};
use crate::sparse::CsrMatrix;

/// Shared evaluation interface of the sequential and distributed engines.
///
/// The solver adapter is generic over this trait; `Problem` itself is the
/// sequential implementation. All methods take `&self`: evaluation state
/// lives in the entries' interior-mutable scratch.
pub trait Evaluator {
    /// The underlying problem (the coordinator always owns the full one).
    fn problem(&self) -> &Problem;

    /// Weighted sum of active objective entry values.
    fn objective(&self, x: &[f64]) -> f64;

    /// Weighted sum of active objective entry gradients, written densely.
    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]);

    /// Unweighted constraint values in declaration order.
    fn constraints(&self, x: &[f64], out: &mut [f64]);

    /// Constraint Jacobian values in the declared structure order.
    fn jacobian_values(&self, x: &[f64], vals: &mut [f64]);
}

/// A fully materialized treatment-planning problem.
///
/// Owns the artifact table (keyed by 1-based `data_id`) and the entries,
/// partitioned into objectives and constraints in declaration order.
/// Immutable after construction.
#[derive(Debug)]
pub struct Problem {
    matrices: HashMap<u32, DoseArtifact>,
    objective_entries: Vec<Entry>,
    constraint_entries: Vec<Entry>,
    num_vars: usize,
    nnz_jac_cons: usize,
}

impl Problem {
    /// Materialize a problem from a decoded archive.
    ///
    /// Artifacts are ingested first (CSC input transposed to CSR), then
    /// entries are resolved and attached. Inactive entries are dropped
    /// here: the solver never sees them.
    pub fn from_archive(archive: ArchiveProblem) -> Result<Problem, ArchiveError> {
        let num_vars = archive.num_vars as usize;
        let matrix_count = archive.matrices.len();

        let mut names = Vec::with_capacity(matrix_count);
        let mut constants = Vec::with_capacity(matrix_count);
        let mut matrices = HashMap::with_capacity(matrix_count);
        for (index, record) in archive.matrices.into_iter().enumerate() {
            let data_id = index as u32 + 1;
            names.push(record.name().to_string());
            let (artifact, c) = ingest_matrix(record);
            constants.push(c);
            matrices.insert(data_id, artifact);
        }

        let mut objective_entries = Vec::new();
        let mut constraint_entries = Vec::new();
        for record in archive.entries {
            if !record.active {
                debug!(roi = %record.name, "skipping inactive entry");
                continue;
            }

            let data_idx = record.data_id as usize;
            if data_idx == 0 || data_idx > matrix_count {
                return Err(ArchiveError::MissingMatrix {
                    roi: record.name,
                    data_id: record.data_id,
                    count: matrix_count,
                });
            }

            let function_type =
                FunctionType::resolve(record.type_id, record.minimise, &names[data_idx - 1])
                    .ok_or_else(|| ArchiveError::UnknownFunctionType {
                        roi: record.name.clone(),
                        type_id: record.type_id,
                    })?;

            let c = if function_type == FunctionType::Quadratic {
                constants[data_idx - 1].ok_or_else(|| ArchiveError::MissingQuadraticConstant {
                    roi: record.name.clone(),
                    data_id: record.data_id,
                })? as f64
            } else {
                0.0
            };

            let artifact = &matrices[&record.data_id];
            let meta = entry_meta(record, function_type, c, archive.num_vars);
            let entry = Entry::from_meta(meta, artifact)?;
            if entry.is_constraint() {
                constraint_entries.push(entry);
            } else {
                objective_entries.push(entry);
            }
        }

        let nnz_jac_cons = constraint_entries
            .iter()
            .map(|e| e.grad_nonzero_idxs().len())
            .sum();

        Ok(Problem {
            matrices,
            objective_entries,
            constraint_entries,
            num_vars,
            nnz_jac_cons,
        })
    }

    /// Number of decision variables (beamlets).
    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    /// Number of constraint entries.
    pub fn num_constraints(&self) -> usize {
        self.constraint_entries.len()
    }

    /// Total structural nonzeros of the constraint Jacobian.
    pub fn nnz_jac_cons(&self) -> usize {
        self.nnz_jac_cons
    }

    /// Objective entries in declaration order.
    pub fn objective_entries(&self) -> &[Entry] {
        &self.objective_entries
    }

    /// Constraint entries in declaration order.
    pub fn constraint_entries(&self) -> &[Entry] {
        &self.constraint_entries
    }

    /// Look up an artifact by its 1-based `data_id`.
    pub fn artifact(&self, data_id: u32) -> Option<&DoseArtifact> {
        self.matrices.get(&data_id)
    }

    fn artifact_for(&self, entry: &Entry) -> &DoseArtifact {
        &self.matrices[&entry.data_id()]
    }

    /// `Σ wᵢ·fᵢ(x)` over the objective entries (all active: inactive ones
    /// were dropped at load).
    pub fn calc_objective(&self, x: &[f64]) -> f64 {
        let mut total = 0.0;
        for entry in &self.objective_entries {
            total += entry.weight() * entry.value(self.artifact_for(entry), x);
        }
        total
    }

    /// Accumulate `Σ wᵢ·∇fᵢ(x)` over the objective entries into `grad`.
    pub fn calc_obj_gradient(&self, x: &[f64], grad: &mut [f64]) {
        debug_assert_eq!(grad.len(), self.num_vars);
        grad.fill(0.0);
        let mut term = vec![0.0; self.num_vars];
        for entry in &self.objective_entries {
            entry.gradient(self.artifact_for(entry), x, &mut term, false);
            let w = entry.weight();
            for (g, t) in grad.iter_mut().zip(term.iter()) {
                *g += w * t;
            }
        }
    }

    /// Constraint values in declaration order. Weights are not applied to
    /// constraints; only objectives are weighted.
    pub fn calc_constraints(&self, x: &[f64], out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.constraint_entries.len());
        for (entry, slot) in self.constraint_entries.iter().zip(out.iter_mut()) {
            *slot = entry.value(self.artifact_for(entry), x);
        }
    }

    /// Jacobian values: each constraint's sparse gradient appended in
    /// declaration order, each ordered by its `grad_nonzero_idxs`.
    pub fn calc_jacobian_vals(&self, x: &[f64], vals: &mut [f64]) {
        debug_assert_eq!(vals.len(), self.nnz_jac_cons);
        let mut offset = 0;
        for entry in &self.constraint_entries {
            let sparse = entry.sparse_gradient(self.artifact_for(entry), x);
            vals[offset..offset + sparse.len()].copy_from_slice(&sparse);
            offset += sparse.len();
        }
    }

    /// Structural (row, col) pairs of the constraint Jacobian, zero-based:
    /// row `j` is populated at constraint `j`'s gradient nonzero columns.
    pub fn jacobian_structure(&self) -> (Vec<u32>, Vec<u32>) {
        let mut rows = Vec::with_capacity(self.nnz_jac_cons);
        let mut cols = Vec::with_capacity(self.nnz_jac_cons);
        for (j, entry) in self.constraint_entries.iter().enumerate() {
            for &col in entry.grad_nonzero_idxs() {
                rows.push(j as u32);
                cols.push(col);
            }
        }
        (rows, cols)
    }
}

impl Evaluator for Problem {
    fn problem(&self) -> &Problem {
        self
    }

    fn objective(&self, x: &[f64]) -> f64 {
        self.calc_objective(x)
    }

    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]) {
        self.calc_obj_gradient(x, grad)
    }

    fn constraints(&self, x: &[f64], out: &mut [f64]) {
        self.calc_constraints(x, out)
    }

    fn jacobian_values(&self, x: &[f64], vals: &mut [f64]) {
        self.calc_jacobian_vals(x, vals)
    }
}

fn ingest_matrix(record: MatrixRecord) -> (DoseArtifact, Option<f32>) {
    match record {
        MatrixRecord::Sparse {
            rows,
            cols,
            values,
            row_indices,
            col_ptrs,
            c,
            ..
        } => {
            let matrix =
                CsrMatrix::from_csc(rows as usize, cols as usize, &values, &row_indices, &col_ptrs);
            (DoseArtifact::Matrix(matrix), c)
        }
        MatrixRecord::Dense { values, .. } => (DoseArtifact::MeanVector(values), None),
    }
}

fn entry_meta(record: EntryRecord, function_type: FunctionType, c: f64, num_vars: u32) -> EntryMeta {
    EntryMeta {
        roi_name: record.name,
        data_id: record.data_id,
        function_type,
        is_constraint: record.is_constraint,
        minimise: record.minimise,
        active: record.active,
        rhs: record.objective,
        weight: record.weight,
        c,
        parameters: record.parameters,
        num_vars,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveProblem, EntryRecord, MatrixRecord};

    fn identity_record(name: &str, n: u32, c: Option<f32>) -> MatrixRecord {
        MatrixRecord::Sparse {
            name: name.to_string(),
            rows: n,
            cols: n,
            values: vec![1.0; n as usize],
            row_indices: (0..n).collect(),
            col_ptrs: (0..=n).collect(),
            c,
        }
    }

    fn entry_record(name: &str, data_id: u32, type_id: u32, is_constraint: bool) -> EntryRecord {
        EntryRecord {
            name: name.to_string(),
            data_id,
            minimise: true,
            active: true,
            is_constraint,
            objective: 1.0,
            type_id,
            weight: 2.0,
            parameters: Vec::new(),
        }
    }

    fn sample_problem() -> Problem {
        let archive = ArchiveProblem {
            num_vars: 2,
            matrices: vec![
                identity_record("PTV", 2, Some(0.5)),
                MatrixRecord::Dense {
                    name: "Lung (mean)".to_string(),
                    values: vec![0.5, 0.5],
                },
            ],
            entries: vec![
                entry_record("PTV quad", 1, 2, false),
                entry_record("Lung mean", 2, 1, true),
                entry_record("PTV max", 1, 1, true),
            ],
        };
        Problem::from_archive(archive).unwrap()
    }

    #[test]
    fn linear_family_resolves_by_matrix_name() {
        let p = sample_problem();
        assert_eq!(p.objective_entries().len(), 1);
        assert_eq!(p.constraint_entries().len(), 2);
        assert_eq!(
            p.constraint_entries()[0].function_type(),
            FunctionType::Mean
        );
        // minimise = true resolves the non-mean linear entry to Max.
        assert_eq!(p.constraint_entries()[1].function_type(), FunctionType::Max);
    }

    #[test]
    fn objective_is_weighted_constraints_are_not() {
        let p = sample_problem();
        let x = [3.0, 5.0];
        // Quadratic: 0.5·(9 + 25) + 0.5 = 17.5, weighted by 2.
        assert_eq!(p.calc_objective(&x), 35.0);

        let mut g = [0.0; 2];
        p.calc_constraints(&x, &mut g);
        // Mean ⟨(0.5, 0.5), (3, 5)⟩ = 4; Max penalty ((3-1)² + (5-1)²)/2 = 10.
        assert_eq!(g, [4.0, 10.0]);
    }

    #[test]
    fn objective_gradient_is_weighted_sum() {
        let p = sample_problem();
        let x = [3.0, 5.0];
        let mut grad = [0.0; 2];
        p.calc_obj_gradient(&x, &mut grad);
        // ∇(quadratic on identity) = x, weight 2.
        assert_eq!(grad, [6.0, 10.0]);
    }

    #[test]
    fn jacobian_layout_matches_structure() {
        let p = sample_problem();
        assert_eq!(p.nnz_jac_cons(), 4);

        let (rows, cols) = p.jacobian_structure();
        assert_eq!(rows, vec![0, 0, 1, 1]);
        assert_eq!(cols, vec![0, 1, 0, 1]);

        let x = [3.0, 5.0];
        let mut vals = [0.0; 4];
        p.calc_jacobian_vals(&x, &mut vals);
        // Mean gradient is μ; Max gradient on identity is 2·max(y − rhs, 0).
        assert_eq!(vals, [0.5, 0.5, 4.0, 8.0]);
    }

    #[test]
    fn inactive_entries_are_dropped() {
        let mut inactive = entry_record("PTV max", 1, 1, true);
        inactive.active = false;
        let archive = ArchiveProblem {
            num_vars: 2,
            matrices: vec![identity_record("PTV", 2, None)],
            entries: vec![entry_record("PTV min", 1, 1, false), inactive],
        };
        let p = Problem::from_archive(archive).unwrap();
        assert_eq!(p.objective_entries().len(), 1);
        assert_eq!(p.num_constraints(), 0);
        assert_eq!(p.nnz_jac_cons(), 0);
    }

    #[test]
    fn unknown_type_id_is_a_load_error() {
        let archive = ArchiveProblem {
            num_vars: 2,
            matrices: vec![identity_record("PTV", 2, None)],
            entries: vec![entry_record("PTV broken", 1, 9, false)],
        };
        assert!(matches!(
            Problem::from_archive(archive),
            Err(ArchiveError::UnknownFunctionType { type_id: 9, .. })
        ));
    }

    #[test]
    fn quadratic_without_constant_is_a_load_error() {
        let archive = ArchiveProblem {
            num_vars: 2,
            matrices: vec![identity_record("PTV", 2, None)],
            entries: vec![entry_record("PTV quad", 1, 2, false)],
        };
        assert!(matches!(
            Problem::from_archive(archive),
            Err(ArchiveError::MissingQuadraticConstant { .. })
        ));
    }

    #[test]
    fn out_of_range_data_id_is_a_load_error() {
        let archive = ArchiveProblem {
            num_vars: 2,
            matrices: vec![identity_record("PTV", 2, None)],
            entries: vec![entry_record("ghost", 4, 1, false)],
        };
        assert!(matches!(
            Problem::from_archive(archive),
            Err(ArchiveError::MissingMatrix { data_id: 4, .. })
        ));
    }
}
