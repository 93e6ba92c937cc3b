//! Problem-archive boundary.
//!
//! The archive is a read-only container holding the dose-deposition
//! artifacts (1-based `data_id` order) and the entry descriptors of one
//! treatment-planning problem. This module owns the on-disk container
//! format; the rest of the crate only sees the decoded record types.
//!
//! Container layout: an 8-byte magic tag followed by a bincode-encoded
//! [`ArchiveProblem`] (standard configuration, little-endian).

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bincode::config;
use thiserror::Error;

const MAGIC: &[u8; 8] = b"DOSEPLN1";

/// Errors raised while reading an archive or constructing a problem from it.
///
/// Archive-format errors are fatal at load time and name the offending
/// field or entry.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to read archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive is not a doseplan container (bad magic)")]
    BadMagic,

    #[error("archive decode failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("archive encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("entry `{roi}` references data id {data_id}, but the archive holds {count} matrices")]
    MissingMatrix { roi: String, data_id: u32, count: usize },

    #[error("entry `{roi}` has unknown function type id {type_id}")]
    UnknownFunctionType { roi: String, type_id: u32 },

    #[error("quadratic entry `{roi}` has no scalar constant on matrix {data_id}")]
    MissingQuadraticConstant { roi: String, data_id: u32 },

    #[error("entry `{roi}` expects a {expected} artifact but data id {data_id} holds a {found}")]
    ArtifactKindMismatch {
        roi: String,
        data_id: u32,
        expected: &'static str,
        found: &'static str,
    },

    #[error("entry `{roi}` spans {found} variables, expected {expected}")]
    DimensionMismatch {
        roi: String,
        expected: usize,
        found: usize,
    },
}

/// One dose-deposition artifact as stored in the archive.
///
/// Sparse matrices are stored column-major (CSC), the layout the source
/// archives use; ingestion transposes to CSR. The optional `c` is the
/// scalar offset of quadratic costs, stored single-precision.
#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub enum MatrixRecord {
    Sparse {
        name: String,
        rows: u32,
        cols: u32,
        values: Vec<f64>,
        row_indices: Vec<u32>,
        col_ptrs: Vec<u32>,
        c: Option<f32>,
    },
    Dense {
        name: String,
        values: Vec<f64>,
    },
}

impl MatrixRecord {
    /// Display name of the artifact; a `"(mean)"` marker identifies
    /// pre-collapsed mean vectors for the linear function family.
    pub fn name(&self) -> &str {
        match self {
            MatrixRecord::Sparse { name, .. } | MatrixRecord::Dense { name, .. } => name,
        }
    }
}

/// One objective or constraint descriptor as stored in the archive.
///
/// `objective` is the right-hand side (prescription); `type_id` follows the
/// archive enumeration (1 = linear family, 2..=6 nonlinear).
#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct EntryRecord {
    pub name: String,
    pub data_id: u32,
    pub minimise: bool,
    pub active: bool,
    pub is_constraint: bool,
    pub objective: f64,
    pub type_id: u32,
    pub weight: f64,
    pub parameters: Vec<f64>,
}

/// A decoded problem archive: matrix artifacts in 1-based `data_id` order
/// plus entry descriptors in declaration order.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct ArchiveProblem {
    pub num_vars: u32,
    pub matrices: Vec<MatrixRecord>,
    pub entries: Vec<EntryRecord>,
}

/// Read a problem archive from disk.
pub fn read_archive(path: &Path) -> Result<ArchiveProblem, ArchiveError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ArchiveError::BadMagic);
    }
    let archive = bincode::decode_from_std_read(&mut reader, config::standard())?;
    Ok(archive)
}

/// Write a problem archive to disk (tooling and test fixtures).
pub fn write_archive(path: &Path, archive: &ArchiveProblem) -> Result<(), ArchiveError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    bincode::encode_into_std_write(archive, &mut writer, config::standard())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_archive() -> ArchiveProblem {
        ArchiveProblem {
            num_vars: 3,
            matrices: vec![
                MatrixRecord::Sparse {
                    name: "PTV".to_string(),
                    rows: 2,
                    cols: 3,
                    values: vec![1.0, 2.0],
                    row_indices: vec![0, 1],
                    col_ptrs: vec![0, 1, 2, 2],
                    c: None,
                },
                MatrixRecord::Dense {
                    name: "Lung (mean)".to_string(),
                    values: vec![0.1, 0.2, 0.7],
                },
            ],
            entries: vec![EntryRecord {
                name: "PTV".to_string(),
                data_id: 1,
                minimise: true,
                active: true,
                is_constraint: false,
                objective: 60.0,
                type_id: 1,
                weight: 1.0,
                parameters: Vec::new(),
            }],
        }
    }

    #[test]
    fn archive_roundtrips_through_disk() {
        let dir = std::env::temp_dir().join("doseplan-archive-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.dpln");

        let archive = sample_archive();
        write_archive(&path, &archive).unwrap();
        let back = read_archive(&path).unwrap();

        assert_eq!(back.num_vars, 3);
        assert_eq!(back.matrices.len(), 2);
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].name, "PTV");
        assert_eq!(back.matrices[1].name(), "Lung (mean)");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = std::env::temp_dir().join("doseplan-archive-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("garbage.dpln");
        std::fs::write(&path, b"NOTAPLAN-and-some-trailing-bytes").unwrap();

        assert!(matches!(
            read_archive(&path),
            Err(ArchiveError::BadMagic)
        ));
    }
}
