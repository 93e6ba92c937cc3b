//! Shared fixture: randomized mixed problem archives.

use doseplan::{ArchiveProblem, EntryRecord, MatrixRecord};
use rand::rngs::StdRng;
use rand::Rng;

/// Random archive mixing every implemented function family, sparse and
/// mean artifacts, objectives and constraints.
pub fn mixed_archive(
    rng: &mut StdRng,
    num_vars: u32,
    num_matrices: usize,
    num_entries: usize,
) -> ArchiveProblem {
    let mut matrices = Vec::with_capacity(num_matrices);
    for m in 0..num_matrices {
        if m % 4 == 3 {
            matrices.push(MatrixRecord::Dense {
                name: format!("ROI {m} (mean)"),
                values: (0..num_vars).map(|_| rng.gen_range(0.0..0.1)).collect(),
            });
        } else {
            let rows = rng.gen_range(10..30u32);
            let mut values = Vec::new();
            let mut row_indices = Vec::new();
            let mut col_ptrs = vec![0u32];
            for _ in 0..num_vars {
                for _ in 0..2 {
                    values.push(rng.gen_range(0.1..1.0));
                    row_indices.push(rng.gen_range(0..rows));
                }
                col_ptrs.push(values.len() as u32);
            }
            matrices.push(MatrixRecord::Sparse {
                name: format!("ROI {m}"),
                rows,
                cols: num_vars,
                values,
                row_indices,
                col_ptrs,
                c: Some(rng.gen_range(0.0..1.0f32)),
            });
        }
    }

    let mut entries = Vec::with_capacity(num_entries);
    for e in 0..num_entries {
        let data_id = rng.gen_range(1..=num_matrices as u32);
        let dense = matches!(matrices[data_id as usize - 1], MatrixRecord::Dense { .. });
        let (type_id, parameters) = if dense {
            (1, Vec::new())
        } else {
            match rng.gen_range(0..4) {
                0 => (1, Vec::new()),
                1 => (2, Vec::new()),
                2 => (3, vec![2.0]),
                _ => (4, vec![1.0, 0.2]),
            }
        };
        entries.push(EntryRecord {
            name: format!("entry {e}"),
            data_id,
            minimise: rng.gen_bool(0.5),
            active: rng.gen_bool(0.9),
            is_constraint: rng.gen_bool(0.5),
            objective: rng.gen_range(1.0..3.0),
            type_id,
            weight: rng.gen_range(0.5..2.0),
            parameters,
        });
    }

    ArchiveProblem {
        num_vars,
        matrices,
        entries,
    }
}
