//! CLI driver: load a problem archive, optionally fan out over worker
//! ranks, run the solver, and dump the final beamlet weights.
//!
//! Modes:
//! - `doseplan <archive> [max_iters]`: sequential evaluation.
//! - `doseplan <archive> --workers N`: N in-process worker ranks.
//! - `doseplan <archive> --listen ADDR --expect N`: cluster coordinator.
//! - `doseplan --connect ADDR`: cluster worker (no archive needed).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use doseplan::{read_archive, Evaluator, Problem};
use doseplan_dist::{worker_run, Communicator, DistributedEvaluator, MemComm, TcpComm};
use tracing::{debug, error, info};

/// Final iterate dump: raw little-endian doubles, one per beamlet.
#[cfg(feature = "solver")]
const SOLUTION_FILE: &str = "solution_x.bin";

const DEFAULT_MAX_ITERS: usize = 20_000;

#[derive(Parser)]
#[command(name = "doseplan", version, about = "Treatment-plan optimization driver")]
struct Args {
    /// Path to the problem archive (not used with --connect).
    archive: Option<PathBuf>,

    /// Maximum solver iterations.
    max_iters: Option<usize>,

    /// Spawn N in-process worker ranks.
    #[arg(long, conflicts_with_all = ["listen", "connect"])]
    workers: Option<usize>,

    /// Coordinate a cluster: address to accept workers on.
    #[arg(long, requires = "expect", conflicts_with = "connect")]
    listen: Option<SocketAddr>,

    /// Number of cluster workers to wait for.
    #[arg(long)]
    expect: Option<usize>,

    /// Join a cluster as a worker rank.
    #[arg(long)]
    connect: Option<SocketAddr>,
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    if let Some(addr) = args.connect {
        let comm = TcpComm::connect(addr).context("failed to join the cluster")?;
        info!(rank = comm.rank(), "worker joined");
        worker_run(&comm)?;
        return Ok(ExitCode::SUCCESS);
    }

    let archive_path = args
        .archive
        .context("an archive path is required unless running with --connect")?;
    let archive = read_archive(&archive_path)
        .with_context(|| format!("failed to load archive {}", archive_path.display()))?;
    let problem = Problem::from_archive(archive)?;
    info!(
        num_vars = problem.num_vars(),
        objectives = problem.objective_entries().len(),
        constraints = problem.num_constraints(),
        "problem loaded"
    );

    let max_iters = args.max_iters.unwrap_or(DEFAULT_MAX_ITERS);
    let code = if let Some(addr) = args.listen {
        let workers = args.expect.context("--listen requires --expect")?;
        let comm = TcpComm::listen(addr, workers)?;
        drive(DistributedEvaluator::new(comm, problem)?, max_iters)?
    } else if let Some(workers) = args.workers.filter(|&w| w > 0) {
        run_threaded(problem, workers, max_iters)?
    } else {
        drive(problem, max_iters)?
    };
    Ok(ExitCode::from(code as u8))
}

/// Run worker ranks on threads of this process, coordinator on the caller.
fn run_threaded(problem: Problem, workers: usize, max_iters: usize) -> anyhow::Result<i32> {
    let mut comms = MemComm::connected(workers + 1);
    let coordinator = comms.remove(0);
    std::thread::scope(|scope| {
        for comm in comms {
            scope.spawn(move || {
                if let Err(err) = worker_run(&comm) {
                    error!(%err, "worker rank failed");
                }
            });
        }
        let engine = DistributedEvaluator::new(coordinator, problem)?;
        drive(engine, max_iters)
    })
}

/// Probe-evaluate, solve, and dump the solution. Returns the exit code.
fn drive<E: Evaluator>(engine: E, max_iters: usize) -> anyhow::Result<i32> {
    probe_evaluation(&engine);

    #[cfg(feature = "solver")]
    {
        let solution = doseplan_dist::solver::solve(engine, max_iters)
            .map_err(|e| anyhow::anyhow!("failed to create the solver: {e:?}"))?;
        dump_solution(std::path::Path::new(SOLUTION_FILE), &solution.x)?;
        info!(
            path = SOLUTION_FILE,
            objective = solution.objective,
            "solution written"
        );
        Ok(solution.exit_code())
    }

    #[cfg(not(feature = "solver"))]
    {
        let _ = max_iters;
        info!("built without the `solver` feature; probe evaluation only");
        Ok(0)
    }
}

/// Evaluate the objective and constraints once at `x = 100·𝟙` before
/// handing the problem to the solver.
fn probe_evaluation<E: Evaluator>(engine: &E) {
    let problem = engine.problem();
    let x = vec![100.0; problem.num_vars()];
    let objective = engine.objective(&x);
    let mut constraints = vec![0.0; problem.num_constraints()];
    engine.constraints(&x, &mut constraints);
    info!(
        objective,
        num_constraints = constraints.len(),
        "probe evaluation at x = 100"
    );
    debug!(?constraints, "probe constraint values");
}

/// Write the final iterate as raw little-endian doubles.
#[cfg(feature = "solver")]
fn dump_solution(path: &std::path::Path, x: &[f64]) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::File::create(path)?;
    let mut bytes = Vec::with_capacity(x.len() * 8);
    for &xi in x {
        bytes.extend_from_slice(&xi.to_le_bytes());
    }
    file.write_all(&bytes)
}
