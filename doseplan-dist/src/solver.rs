//! IPOPT adapter: exposes an [`Evaluator`] through the solver's callback
//! protocol. Built only with the `solver` cargo feature, which links the
//! native IPOPT library.

use doseplan::{Evaluator, FunctionType};
use ipopt::{
    BasicProblem, ConstrainedProblem, Index, Ipopt, Number, SolveResult, SolveStatus,
    SolverDataMut,
};
use tracing::info;

/// IPOPT treats magnitudes above 1e19 as infinite.
const NEG_INF: Number = -1e20;
const POS_INF: Number = 1e20;

/// Starting-point scaling: begin at `x = 100·𝟙` and scale by 1.5 while any
/// LTCP objective exceeds this value.
const LTCP_START_CEILING: f64 = 1500.0;

/// The nonlinear program handed to IPOPT, generic over the sequential or
/// distributed engine.
pub struct DosePlanNlp<E: Evaluator> {
    engine: E,
}

impl<E: Evaluator> DosePlanNlp<E> {
    pub fn new(engine: E) -> Self {
        DosePlanNlp { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}

impl<E: Evaluator> BasicProblem for DosePlanNlp<E> {
    fn num_variables(&self) -> usize {
        self.engine.problem().num_vars()
    }

    fn bounds(&self, x_l: &mut [Number], x_u: &mut [Number]) -> bool {
        x_l.fill(0.0);
        x_u.fill(POS_INF);
        true
    }

    fn initial_point(&self, x: &mut [Number]) -> bool {
        // Keep the LTCP objectives moderate at the start: their exponential
        // underdose penalty dwarfs everything else at low beamlet weights.
        x.fill(100.0);

        let problem = self.engine.problem();
        let ltcp_entries: Vec<_> = problem
            .objective_entries()
            .iter()
            .filter(|e| e.function_type() == FunctionType::Ltcp)
            .collect();

        let too_large = |x: &[f64]| {
            ltcp_entries.iter().any(|e| {
                let artifact = match problem.artifact(e.data_id()) {
                    Some(a) => a,
                    None => unreachable!("entries only reference artifacts owned by the problem"),
                };
                e.value(artifact, x) > LTCP_START_CEILING
            })
        };
        while too_large(x) {
            for xi in x.iter_mut() {
                *xi *= 1.5;
            }
        }
        info!(x0 = x[0], "starting point initialized");
        true
    }

    fn objective(&self, x: &[Number], obj: &mut Number) -> bool {
        *obj = self.engine.objective(x);
        true
    }

    fn objective_grad(&self, x: &[Number], grad_f: &mut [Number]) -> bool {
        self.engine.objective_gradient(x, grad_f);
        true
    }
}

impl<E: Evaluator> ConstrainedProblem for DosePlanNlp<E> {
    fn num_constraints(&self) -> usize {
        self.engine.problem().num_constraints()
    }

    fn num_constraint_jacobian_non_zeros(&self) -> usize {
        self.engine.problem().nnz_jac_cons()
    }

    fn constraint_bounds(&self, g_l: &mut [Number], g_u: &mut [Number]) -> bool {
        for (entry, (lo, hi)) in self
            .engine
            .problem()
            .constraint_entries()
            .iter()
            .zip(g_l.iter_mut().zip(g_u.iter_mut()))
        {
            let upper_bounded = entry.is_minimisation()
                || matches!(
                    entry.function_type(),
                    FunctionType::Min | FunctionType::Max
                );
            if upper_bounded {
                *lo = NEG_INF;
                *hi = 0.0;
            } else {
                *lo = 0.0;
                *hi = POS_INF;
            }
        }
        true
    }

    fn constraint(&self, x: &[Number], g: &mut [Number]) -> bool {
        self.engine.constraints(x, g);
        true
    }

    fn constraint_jacobian_indices(&self, irow: &mut [Index], jcol: &mut [Index]) -> bool {
        let (rows, cols) = self.engine.problem().jacobian_structure();
        for (slot, row) in irow.iter_mut().zip(rows.iter()) {
            *slot = *row as Index;
        }
        for (slot, col) in jcol.iter_mut().zip(cols.iter()) {
            *slot = *col as Index;
        }
        true
    }

    fn constraint_jacobian_values(&self, x: &[Number], vals: &mut [Number]) -> bool {
        self.engine.jacobian_values(x, vals);
        true
    }

    // The Hessian is declared dense-symmetric but never materialized: the
    // driver selects the limited-memory quasi-Newton approximation.
    fn num_hessian_non_zeros(&self) -> usize {
        let n = self.engine.problem().num_vars();
        n * n / 2
    }

    fn hessian_indices(&self, _irow: &mut [Index], _jcol: &mut [Index]) -> bool {
        false
    }

    fn hessian_values(
        &self,
        _x: &[Number],
        _obj_factor: Number,
        _lambda: &[Number],
        _vals: &mut [Number],
    ) -> bool {
        false
    }
}

/// Outcome of one solve: the solver status, the final iterate, and the
/// final objective value.
pub struct PlanSolution {
    pub status: SolveStatus,
    pub x: Vec<f64>,
    pub objective: f64,
}

impl PlanSolution {
    /// Process exit code for the CLI: zero on (acceptable) convergence.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            SolveStatus::SolveSucceeded | SolveStatus::SolvedToAcceptableLevel => 0,
            _ => 1,
        }
    }
}

/// Run IPOPT on the given engine with the standard option set.
pub fn solve<E: Evaluator>(engine: E, max_iters: usize) -> Result<PlanSolution, ipopt::CreateError> {
    let nlp = DosePlanNlp::new(engine);
    let mut ipopt = Ipopt::new(nlp)?;
    ipopt.set_option("hessian_approximation", "limited-memory");
    ipopt.set_option("mu_strategy", "adaptive");
    ipopt.set_option("adaptive_mu_globalization", "kkt-error");
    ipopt.set_option("tol", 1e-9);
    ipopt.set_option("max_iter", max_iters as i32);

    let SolveResult {
        solver_data:
            SolverDataMut {
                solution, ..
            },
        objective_value,
        status,
        ..
    } = ipopt.solve();

    info!(?status, objective = objective_value, "solver finished");
    Ok(PlanSolution {
        status,
        x: solution.primal_variables.to_vec(),
        objective: objective_value,
    })
}
