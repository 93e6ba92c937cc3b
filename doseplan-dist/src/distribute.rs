//! Workload partitioning: spread entries over worker ranks so that each
//! rank carries a similar share of matrix nonzeros.

use std::collections::BTreeSet;

use doseplan::Entry;
use tracing::debug;

/// Partition `entries` over `num_ranks` ranks (coordinator included).
///
/// Greedy LPT: entries sorted by workload descending, each assigned to the
/// currently lightest worker. Rank 0 is the coordinator and receives no
/// entries; element `r` of the result lists the entry indices assigned to
/// rank `r`, in decreasing workload order.
pub fn partition_entries(entries: &[Entry], num_ranks: usize) -> Vec<Vec<usize>> {
    let mut assignment: Vec<Vec<usize>> = vec![Vec::new(); num_ranks];
    if num_ranks < 2 || entries.is_empty() {
        return assignment;
    }

    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| {
        entries[b]
            .workload_nnz()
            .cmp(&entries[a].workload_nnz())
            .then(a.cmp(&b))
    });

    let mut loads = vec![0usize; num_ranks];
    for idx in order {
        let mut lightest = 1;
        for rank in 2..num_ranks {
            if loads[rank] < loads[lightest] {
                lightest = rank;
            }
        }
        loads[lightest] += entries[idx].workload_nnz();
        assignment[lightest].push(idx);
    }
    assignment
}

/// Derive each rank's matrix needs: the union of `data_id` over every entry
/// assigned to it, across both sequences.
pub fn matrix_assignment(
    objective_entries: &[Entry],
    constraint_entries: &[Entry],
    distrib_obj: &[Vec<usize>],
    distrib_cons: &[Vec<usize>],
) -> Vec<BTreeSet<u32>> {
    let num_ranks = distrib_obj.len().max(distrib_cons.len());
    let mut buckets: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); num_ranks];
    for (rank, idxs) in distrib_obj.iter().enumerate() {
        for &i in idxs {
            buckets[rank].insert(objective_entries[i].data_id());
        }
    }
    for (rank, idxs) in distrib_cons.iter().enumerate() {
        for &i in idxs {
            buckets[rank].insert(constraint_entries[i].data_id());
        }
    }
    buckets
}

/// Log each rank's entry share and summed workload at debug level.
pub fn log_distribution(label: &str, entries: &[Entry], distribution: &[Vec<usize>]) {
    for (rank, idxs) in distribution.iter().enumerate() {
        let nnz_sum: usize = idxs.iter().map(|&i| entries[i].workload_nnz()).sum();
        debug!(
            label,
            rank,
            entries = ?idxs,
            nnz_sum,
            "rank workload share"
        );
    }
}
