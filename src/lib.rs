pub mod archive;
pub mod entry;
pub mod float;
pub mod problem;
pub mod sparse;

pub use archive::{
    read_archive, write_archive, ArchiveError, ArchiveProblem, EntryRecord, MatrixRecord,
};
pub use entry::{DoseArtifact, Entry, EntryMeta, FunctionType};
pub use float::Float;
pub use problem::{Evaluator, Problem};
pub use sparse::CsrMatrix;
