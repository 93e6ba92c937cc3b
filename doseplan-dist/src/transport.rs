//! Matrix and entry transfer from the coordinator to the workers.
//!
//! Matrices are shipped once to the single rank that owns them: a
//! vector/sparse discriminator, the `data_id`, then either the dense
//! payload or the three CSR arrays (the receiver recovers `nnz` and the
//! row count from the array lengths). Entries follow as bincode metadata
//! tagged with their global index, in distributor order.

use std::collections::HashMap;

use bincode::config;
use doseplan::{ArchiveError, CsrMatrix, DoseArtifact, Entry, EntryMeta, Problem};

use crate::comm::{Body, CommError, Communicator, Message, Tag, COORDINATOR};
use crate::distribute::matrix_assignment;

/// Entry metadata on the wire, carrying the entry's global index within its
/// sequence (objective or constraint) on the coordinator.
#[derive(Debug, bincode::Encode, bincode::Decode)]
struct WireEntry {
    global_index: u32,
    meta: EntryMeta,
}

/// An entry rebuilt on a worker, remembering its coordinator-side index.
#[derive(Debug)]
pub struct LocalEntry {
    pub global_index: usize,
    pub entry: Entry,
}

/// Everything one worker rank holds after setup.
#[derive(Debug, Default)]
pub struct LocalData {
    pub num_vars: usize,
    pub matrices: HashMap<u32, DoseArtifact>,
    pub objective_entries: Vec<LocalEntry>,
    pub constraint_entries: Vec<LocalEntry>,
}

/// Coordinator side of setup: broadcast the variable count, then ship each
/// rank its matrices and entries per the distribution.
pub fn send_local_data<C: Communicator>(
    comm: &C,
    problem: &Problem,
    distrib_obj: &[Vec<usize>],
    distrib_cons: &[Vec<usize>],
) -> Result<(), CommError> {
    comm.broadcast(Tag::NumVars, Body::U32(vec![problem.num_vars() as u32]))?;

    let buckets = matrix_assignment(
        problem.objective_entries(),
        problem.constraint_entries(),
        distrib_obj,
        distrib_cons,
    );
    for rank in 1..comm.size() {
        let data_ids = &buckets[rank];
        send_u32(comm, rank, Tag::NumMats, data_ids.len() as u32)?;
        for &data_id in data_ids {
            let artifact = match problem.artifact(data_id) {
                Some(a) => a,
                None => unreachable!("entries only reference artifacts owned by the problem"),
            };
            send_matrix(comm, rank, data_id, artifact)?;
        }

        send_entry_counts(comm, rank, distrib_obj[rank].len(), distrib_cons[rank].len())?;
        send_entries(comm, rank, problem.objective_entries(), &distrib_obj[rank])?;
        send_entries(comm, rank, problem.constraint_entries(), &distrib_cons[rank])?;
    }
    Ok(())
}

/// Worker side of setup: receive the variable count, the local matrix
/// table, and the local entries, then rebuild them against the table.
pub fn recv_local_data<C: Communicator>(comm: &C) -> Result<LocalData, CommError> {
    let num_vars = recv_u32(comm, Tag::NumVars)? as usize;

    let num_matrices = recv_u32(comm, Tag::NumMats)?;
    let mut matrices = HashMap::with_capacity(num_matrices as usize);
    for _ in 0..num_matrices {
        let is_vec = recv_u32(comm, Tag::VecFlag)? != 0;
        let data_id = recv_u32(comm, Tag::DataId)?;
        let artifact = if is_vec {
            let values = comm.recv_expect(COORDINATOR, Tag::VecData)?.into_f64s()?;
            DoseArtifact::MeanVector(values)
        } else {
            let num_cols = recv_u32(comm, Tag::CsrNumCols)? as usize;
            let values = comm.recv_expect(COORDINATOR, Tag::CsrData)?.into_f64s()?;
            let col_indices = comm.recv_expect(COORDINATOR, Tag::CsrColInds)?.into_u32s()?;
            let row_ptrs = comm.recv_expect(COORDINATOR, Tag::CsrRowPtrs)?.into_u32s()?;
            if row_ptrs.is_empty() {
                return Err(CommError::BodyMismatch {
                    expected: "row pointer array of length rows + 1",
                });
            }
            let num_rows = row_ptrs.len() - 1;
            DoseArtifact::Matrix(CsrMatrix::from_csr_parts(
                num_rows,
                num_cols,
                values,
                col_indices,
                row_ptrs,
            ))
        };
        matrices.insert(data_id, artifact);
    }

    let counts = comm
        .recv_expect(COORDINATOR, Tag::EntryCounts)?
        .into_u32s()?;
    if counts.len() != 2 {
        return Err(CommError::BodyMismatch {
            expected: "two entry counts",
        });
    }
    let objective_entries = recv_entries(comm, counts[0], &matrices)?;
    let constraint_entries = recv_entries(comm, counts[1], &matrices)?;

    Ok(LocalData {
        num_vars,
        matrices,
        objective_entries,
        constraint_entries,
    })
}

fn send_matrix<C: Communicator>(
    comm: &C,
    rank: usize,
    data_id: u32,
    artifact: &DoseArtifact,
) -> Result<(), CommError> {
    let is_vec = matches!(artifact, DoseArtifact::MeanVector(_));
    send_u32(comm, rank, Tag::VecFlag, is_vec as u32)?;
    send_u32(comm, rank, Tag::DataId, data_id)?;
    match artifact {
        DoseArtifact::MeanVector(values) => comm.send(
            rank,
            Message {
                tag: Tag::VecData,
                body: Body::F64(values.clone()),
            },
        ),
        DoseArtifact::Matrix(matrix) => {
            send_u32(comm, rank, Tag::CsrNumCols, matrix.cols() as u32)?;
            comm.send(
                rank,
                Message {
                    tag: Tag::CsrData,
                    body: Body::F64(matrix.values().to_vec()),
                },
            )?;
            comm.send(
                rank,
                Message {
                    tag: Tag::CsrColInds,
                    body: Body::U32(matrix.col_indices().to_vec()),
                },
            )?;
            comm.send(
                rank,
                Message {
                    tag: Tag::CsrRowPtrs,
                    body: Body::U32(matrix.row_ptrs().to_vec()),
                },
            )
        }
    }
}

fn send_entry_counts<C: Communicator>(
    comm: &C,
    rank: usize,
    num_obj: usize,
    num_cons: usize,
) -> Result<(), CommError> {
    comm.send(
        rank,
        Message {
            tag: Tag::EntryCounts,
            body: Body::U32(vec![num_obj as u32, num_cons as u32]),
        },
    )
}

fn send_entries<C: Communicator>(
    comm: &C,
    rank: usize,
    entries: &[Entry],
    idxs: &[usize],
) -> Result<(), CommError> {
    for &global_index in idxs {
        let wire = WireEntry {
            global_index: global_index as u32,
            meta: entries[global_index].meta(),
        };
        let bytes = bincode::encode_to_vec(&wire, config::standard())?;
        comm.send(
            rank,
            Message {
                tag: Tag::EntryMeta,
                body: Body::Bytes(bytes),
            },
        )?;
    }
    Ok(())
}

fn recv_entries<C: Communicator>(
    comm: &C,
    count: u32,
    matrices: &HashMap<u32, DoseArtifact>,
) -> Result<Vec<LocalEntry>, CommError> {
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let bytes = comm.recv_expect(COORDINATOR, Tag::EntryMeta)?.into_bytes()?;
        let (wire, _): (WireEntry, usize) = bincode::decode_from_slice(&bytes, config::standard())?;
        let artifact = matrices.get(&wire.meta.data_id).ok_or_else(|| {
            CommError::Rebuild(ArchiveError::MissingMatrix {
                roi: wire.meta.roi_name.clone(),
                data_id: wire.meta.data_id,
                count: matrices.len(),
            })
        })?;
        let entry = Entry::from_meta(wire.meta, artifact)?;
        entries.push(LocalEntry {
            global_index: wire.global_index as usize,
            entry,
        });
    }
    Ok(entries)
}

fn send_u32<C: Communicator>(
    comm: &C,
    rank: usize,
    tag: Tag,
    value: u32,
) -> Result<(), CommError> {
    comm.send(
        rank,
        Message {
            tag,
            body: Body::U32(vec![value]),
        },
    )
}

fn recv_u32<C: Communicator>(comm: &C, tag: Tag) -> Result<u32, CommError> {
    let values = comm.recv_expect(COORDINATOR, tag)?.into_u32s()?;
    values.first().copied().ok_or(CommError::BodyMismatch {
        expected: "one u32 scalar",
    })
}
