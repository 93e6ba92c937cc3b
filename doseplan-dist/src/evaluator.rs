//! Coordinator/worker evaluation schedule.
//!
//! Every solver callback becomes one collective round: the coordinator
//! broadcasts an operation tag and the iterate, evaluates its own share
//! (empty under the current distributor), then gathers the workers'
//! contributions. Workers block on the next broadcast until `Shutdown`.

use std::cell::Cell;

use doseplan::{Evaluator, Problem};
use tracing::{debug, info};

use crate::comm::{Body, CommError, Communicator, Tag, COORDINATOR};
use crate::distribute::{log_distribution, partition_entries};
use crate::transport::{recv_local_data, send_local_data, LocalData};

/// Coordinator-side distributed engine.
///
/// Owns the full problem (the solver adapter reads metadata from it) and
/// drives the worker ranks through the collective schedule. Dropping the
/// evaluator sends `Shutdown` so workers leave their service loop.
pub struct DistributedEvaluator<C: Communicator> {
    comm: C,
    problem: Problem,
    distrib_obj: Vec<Vec<usize>>,
    distrib_cons: Vec<Vec<usize>>,
    /// Sparse gradient length per global constraint index.
    cons_sparse_lens: Vec<usize>,
    /// Offset of each constraint's segment in the Jacobian values array.
    cons_offsets: Vec<usize>,
    shut_down: Cell<bool>,
}

impl<C: Communicator> DistributedEvaluator<C> {
    /// Partition the problem over the communicator's ranks and ship each
    /// worker its share.
    pub fn new(comm: C, problem: Problem) -> Result<Self, CommError> {
        let num_ranks = comm.size();
        let distrib_obj = partition_entries(problem.objective_entries(), num_ranks);
        let distrib_cons = partition_entries(problem.constraint_entries(), num_ranks);
        log_distribution("objectives", problem.objective_entries(), &distrib_obj);
        log_distribution("constraints", problem.constraint_entries(), &distrib_cons);

        send_local_data(&comm, &problem, &distrib_obj, &distrib_cons)?;
        info!(
            workers = num_ranks - 1,
            objectives = problem.objective_entries().len(),
            constraints = problem.constraint_entries().len(),
            "distributed setup complete"
        );

        let cons_sparse_lens: Vec<usize> = problem
            .constraint_entries()
            .iter()
            .map(|e| e.grad_nonzero_idxs().len())
            .collect();
        let mut cons_offsets = Vec::with_capacity(cons_sparse_lens.len());
        let mut offset = 0;
        for &len in &cons_sparse_lens {
            cons_offsets.push(offset);
            offset += len;
        }

        Ok(DistributedEvaluator {
            comm,
            problem,
            distrib_obj,
            distrib_cons,
            cons_sparse_lens,
            cons_offsets,
            shut_down: Cell::new(false),
        })
    }

    /// Broadcast `Shutdown`; workers exit their loop. Idempotent.
    pub fn shutdown(&self) -> Result<(), CommError> {
        if self.shut_down.replace(true) {
            return Ok(());
        }
        debug!("broadcasting shutdown");
        self.comm.broadcast(Tag::Shutdown, Body::Empty)
    }

    fn start_round(&self, op: Tag, x: &[f64]) -> Result<(), CommError> {
        debug_assert!(!self.shut_down.get(), "evaluation after shutdown");
        self.comm.broadcast(op, Body::Empty)?;
        self.comm.broadcast(Tag::Iterate, Body::F64(x.to_vec()))
    }

    fn artifact_of<'a>(&'a self, entry: &doseplan::Entry) -> &'a doseplan::DoseArtifact {
        match self.problem.artifact(entry.data_id()) {
            Some(a) => a,
            None => unreachable!("entries only reference artifacts owned by the problem"),
        }
    }

    /// The coordinator's own share of the objective (empty under the
    /// current distributor, kept for schedule fidelity).
    fn local_objective(&self, x: &[f64]) -> f64 {
        let entries = self.problem.objective_entries();
        self.distrib_obj[COORDINATOR]
            .iter()
            .map(|&i| &entries[i])
            .map(|e| e.weight() * e.value(self.artifact_of(e), x))
            .sum()
    }

    fn round_objective(&self, x: &[f64]) -> Result<f64, CommError> {
        self.start_round(Tag::EvalObj, x)?;
        let mut total = self.local_objective(x);
        for rank in 1..self.comm.size() {
            let contribution = self
                .comm
                .recv_expect(rank, Tag::ObjValue)?
                .into_f64s()?;
            total += contribution.first().copied().unwrap_or(0.0);
        }
        Ok(total)
    }

    fn round_obj_gradient(&self, x: &[f64], grad: &mut [f64]) -> Result<(), CommError> {
        self.start_round(Tag::EvalObjGrad, x)?;
        grad.fill(0.0);
        for rank in 1..self.comm.size() {
            let partial = self.comm.recv_expect(rank, Tag::ObjGrad)?.into_f64s()?;
            for (g, p) in grad.iter_mut().zip(partial.iter()) {
                *g += p;
            }
        }
        Ok(())
    }

    fn round_constraints(&self, x: &[f64], out: &mut [f64]) -> Result<(), CommError> {
        self.start_round(Tag::EvalCons, x)?;
        for rank in 1..self.comm.size() {
            let idxs = self.comm.recv_expect(rank, Tag::ConsIdxs)?.into_u32s()?;
            let vals = self.comm.recv_expect(rank, Tag::ConsVals)?.into_f64s()?;
            // Placement follows the recorded distribution, not reception
            // order; the transmitted indices only cross-check it.
            for (k, &global) in self.distrib_cons[rank].iter().enumerate() {
                debug_assert_eq!(idxs[k] as usize, global);
                out[global] = vals[k];
            }
        }
        Ok(())
    }

    fn round_jacobian(&self, x: &[f64], vals: &mut [f64]) -> Result<(), CommError> {
        self.start_round(Tag::EvalJac, x)?;
        for rank in 1..self.comm.size() {
            let segment = self.comm.recv_expect(rank, Tag::JacVals)?.into_f64s()?;
            let mut consumed = 0;
            for &global in &self.distrib_cons[rank] {
                let len = self.cons_sparse_lens[global];
                let offset = self.cons_offsets[global];
                vals[offset..offset + len].copy_from_slice(&segment[consumed..consumed + len]);
                consumed += len;
            }
        }
        Ok(())
    }
}

impl<C: Communicator> Evaluator for DistributedEvaluator<C> {
    fn problem(&self) -> &Problem {
        &self.problem
    }

    fn objective(&self, x: &[f64]) -> f64 {
        match self.round_objective(x) {
            Ok(v) => v,
            Err(err) => panic!("distributed objective round failed: {err}"),
        }
    }

    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]) {
        if let Err(err) = self.round_obj_gradient(x, grad) {
            panic!("distributed gradient round failed: {err}");
        }
    }

    fn constraints(&self, x: &[f64], out: &mut [f64]) {
        if let Err(err) = self.round_constraints(x, out) {
            panic!("distributed constraints round failed: {err}");
        }
    }

    fn jacobian_values(&self, x: &[f64], vals: &mut [f64]) {
        if let Err(err) = self.round_jacobian(x, vals) {
            panic!("distributed jacobian round failed: {err}");
        }
    }
}

impl<C: Communicator> Drop for DistributedEvaluator<C> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl LocalData {
    fn artifact_of<'a>(&'a self, entry: &doseplan::Entry) -> &'a doseplan::DoseArtifact {
        match self.matrices.get(&entry.data_id()) {
            Some(a) => a,
            None => unreachable!("local entries only reference transported artifacts"),
        }
    }

    /// Weighted sum of this rank's objective entry values.
    pub fn objective_value(&self, x: &[f64]) -> f64 {
        self.objective_entries
            .iter()
            .map(|le| &le.entry)
            .map(|e| e.weight() * e.value(self.artifact_of(e), x))
            .sum()
    }

    /// Weighted dense gradient sum over this rank's objective entries.
    pub fn objective_gradient(&self, x: &[f64], grad: &mut [f64]) {
        grad.fill(0.0);
        let mut term = vec![0.0; self.num_vars];
        for le in &self.objective_entries {
            let entry = &le.entry;
            entry.gradient(self.artifact_of(entry), x, &mut term, false);
            let w = entry.weight();
            for (g, t) in grad.iter_mut().zip(term.iter()) {
                *g += w * t;
            }
        }
    }

    /// Per-constraint values with their global indices, in local order.
    pub fn constraint_values(&self, x: &[f64]) -> (Vec<u32>, Vec<f64>) {
        let mut idxs = Vec::with_capacity(self.constraint_entries.len());
        let mut vals = Vec::with_capacity(self.constraint_entries.len());
        for le in &self.constraint_entries {
            idxs.push(le.global_index as u32);
            vals.push(le.entry.value(self.artifact_of(&le.entry), x));
        }
        (idxs, vals)
    }

    /// Concatenated sparse constraint gradients, in local order.
    pub fn jacobian_segment(&self, x: &[f64]) -> Vec<f64> {
        let mut segment = Vec::new();
        for le in &self.constraint_entries {
            segment.extend(le.entry.sparse_gradient(self.artifact_of(&le.entry), x));
        }
        segment
    }
}

/// Worker service: run setup, then answer evaluation rounds until
/// `Shutdown`.
pub fn worker_run<C: Communicator>(comm: &C) -> Result<(), CommError> {
    let data = recv_local_data(comm)?;
    debug!(
        rank = comm.rank(),
        matrices = data.matrices.len(),
        objectives = data.objective_entries.len(),
        constraints = data.constraint_entries.len(),
        "worker setup complete"
    );
    serve(comm, &data)
}

/// The worker's evaluation loop over already-received local data.
pub fn serve<C: Communicator>(comm: &C, data: &LocalData) -> Result<(), CommError> {
    loop {
        let message = comm.recv(COORDINATOR)?;
        let op = message.tag;
        if op == Tag::Shutdown {
            debug!(rank = comm.rank(), "shutdown received");
            return Ok(());
        }

        if !matches!(
            op,
            Tag::EvalObj | Tag::EvalObjGrad | Tag::EvalCons | Tag::EvalJac
        ) {
            return Err(CommError::UnexpectedTag { found: op });
        }

        let x = comm.recv_expect(COORDINATOR, Tag::Iterate)?.into_f64s()?;
        match op {
            Tag::EvalObj => {
                let value = data.objective_value(&x);
                comm.send(
                    COORDINATOR,
                    crate::comm::Message {
                        tag: Tag::ObjValue,
                        body: Body::F64(vec![value]),
                    },
                )?;
            }
            Tag::EvalObjGrad => {
                let mut grad = vec![0.0; data.num_vars];
                data.objective_gradient(&x, &mut grad);
                comm.send(
                    COORDINATOR,
                    crate::comm::Message {
                        tag: Tag::ObjGrad,
                        body: Body::F64(grad),
                    },
                )?;
            }
            Tag::EvalCons => {
                let (idxs, vals) = data.constraint_values(&x);
                comm.send(
                    COORDINATOR,
                    crate::comm::Message {
                        tag: Tag::ConsIdxs,
                        body: Body::U32(idxs),
                    },
                )?;
                comm.send(
                    COORDINATOR,
                    crate::comm::Message {
                        tag: Tag::ConsVals,
                        body: Body::F64(vals),
                    },
                )?;
            }
            Tag::EvalJac => {
                let segment = data.jacobian_segment(&x);
                comm.send(
                    COORDINATOR,
                    crate::comm::Message {
                        tag: Tag::JacVals,
                        body: Body::F64(segment),
                    },
                )?;
            }
            _ => unreachable!("filtered above"),
        }
    }
}
