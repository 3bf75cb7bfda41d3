//! Mixed-integer quadratic program boundary.
//!
//! Problems are stated as
//!
//! ```text
//! minimize    ½ xᵀPx + qᵀx
//! subject to  a·x = b   (equalities)
//!             a·x ≤ b   (inequalities)
//!             x_i ∈ {0, 1} for i in the binary index set
//! ```
//!
//! and handed to a [`MiqpSolver`]. The default backend,
//! [`ClarabelMiqpSolver`], enumerates the binary assignments admitted by the
//! binary-only constraint rows and solves each remaining continuous QP with
//! the clarabel interior-point solver. Any other engine can be plugged in by
//! implementing the trait.

use crate::error::{AllocationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, trace};

/// Feasibility tolerance for constraint checks outside the QP solver.
const FEAS_TOL: f64 = 1e-9;

/// Dense linear constraint row `coefficients · x (=|≤) rhs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConstraint {
    pub coefficients: Vec<f64>,
    pub rhs: f64,
}

impl LinearConstraint {
    pub fn new(coefficients: Vec<f64>, rhs: f64) -> Self {
        Self { coefficients, rhs }
    }

    fn evaluate(&self, x: &[f64]) -> f64 {
        self.coefficients.iter().zip(x).map(|(a, v)| a * v).sum()
    }
}

/// A mixed-integer QP in the form described in the module docs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiqpProblem {
    /// Symmetric positive semidefinite quadratic term P (n×n).
    pub quadratic: Vec<Vec<f64>>,
    /// Linear term q.
    pub linear: Vec<f64>,
    pub equalities: Vec<LinearConstraint>,
    pub inequalities: Vec<LinearConstraint>,
    /// Indices of variables restricted to {0, 1}.
    pub binaries: Vec<usize>,
}

impl MiqpProblem {
    /// Start a problem with the given objective and no constraints.
    pub fn new(quadratic: Vec<Vec<f64>>, linear: Vec<f64>) -> Self {
        Self {
            quadratic,
            linear,
            equalities: Vec::new(),
            inequalities: Vec::new(),
            binaries: Vec::new(),
        }
    }

    pub fn variable_count(&self) -> usize {
        self.linear.len()
    }

    pub fn add_equality(&mut self, coefficients: Vec<f64>, rhs: f64) {
        self.equalities.push(LinearConstraint::new(coefficients, rhs));
    }

    pub fn add_inequality(&mut self, coefficients: Vec<f64>, rhs: f64) {
        self.inequalities.push(LinearConstraint::new(coefficients, rhs));
    }

    pub fn mark_binary(&mut self, index: usize) {
        if !self.binaries.contains(&index) {
            self.binaries.push(index);
        }
    }

    /// Objective value ½ xᵀPx + qᵀx.
    pub fn objective(&self, x: &[f64]) -> f64 {
        let mut quad = 0.0;
        for (i, row) in self.quadratic.iter().enumerate() {
            for (j, p) in row.iter().enumerate() {
                quad += x[i] * p * x[j];
            }
        }
        0.5 * quad + self.linear.iter().zip(x).map(|(q, v)| q * v).sum::<f64>()
    }

    /// Check dimensions of every term.
    pub fn validate(&self) -> Result<()> {
        let n = self.variable_count();
        if self.quadratic.len() != n || self.quadratic.iter().any(|row| row.len() != n) {
            return Err(AllocationError::InvalidInput(format!(
                "Quadratic term must be {}x{}",
                n, n
            )));
        }
        let rows = self.equalities.iter().chain(&self.inequalities);
        if let Some(bad) = rows.clone().find(|c| c.coefficients.len() != n) {
            return Err(AllocationError::InvalidInput(format!(
                "Constraint row has {} coefficients, expected {}",
                bad.coefficients.len(),
                n
            )));
        }
        if self.binaries.iter().any(|&b| b >= n) {
            return Err(AllocationError::InvalidInput(
                "Binary index out of range".to_string(),
            ));
        }
        let mut values = self
            .quadratic
            .iter()
            .flatten()
            .chain(&self.linear)
            .chain(rows.flat_map(|c| c.coefficients.iter().chain(std::iter::once(&c.rhs))));
        if values.any(|v| !v.is_finite()) {
            return Err(AllocationError::InvalidInput(
                "Problem data contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }
}

/// Optimal point of a [`MiqpProblem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiqpSolution {
    /// Full variable vector (continuous and binary).
    pub x: Vec<f64>,
    /// Values of the binary variables, in `MiqpProblem::binaries` order.
    pub binary: Vec<bool>,
    pub objective: f64,
}

/// Result of a solve that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum MiqpOutcome {
    Optimal(MiqpSolution),
    Infeasible,
}

/// Capability to solve mixed-integer quadratic programs.
///
/// Implementations must either return the optimum, report infeasibility, or
/// fail with [`AllocationError::Solver`]. They must never hand back a
/// partial or default solution.
pub trait MiqpSolver: Send + Sync {
    fn name(&self) -> &str;

    fn solve(&self, problem: &MiqpProblem) -> Result<MiqpOutcome>;
}

/// Limits for the default solver backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Iteration cap for each continuous QP.
    pub max_iter: u32,
    /// Wall-clock budget for one MIQP solve, in seconds.
    pub time_limit_secs: f64,
    /// Maximum number of continuous QPs one MIQP solve may spawn.
    pub max_subproblems: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iter: 200,
            time_limit_secs: 30.0,
            max_subproblems: 200_000,
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(AllocationError::ConfigError(
                "solver.max_iter must be positive".to_string(),
            ));
        }
        if !(self.time_limit_secs > 0.0) {
            return Err(AllocationError::ConfigError(
                "solver.time_limit_secs must be positive".to_string(),
            ));
        }
        if self.max_subproblems == 0 {
            return Err(AllocationError::ConfigError(
                "solver.max_subproblems must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Binary enumeration over clarabel continuous QPs.
#[derive(Debug, Clone, Default)]
pub struct ClarabelMiqpSolver {
    settings: SolverSettings,
}

/// Bookkeeping for one enumeration run.
struct Search<'a> {
    problem: &'a MiqpProblem,
    settings: &'a SolverSettings,
    started: Instant,
    /// Rows (index into equalities / inequalities) touching only binaries.
    binary_equalities: Vec<usize>,
    binary_inequalities: Vec<usize>,
    subproblems: usize,
    best: Option<MiqpSolution>,
}

impl ClarabelMiqpSolver {
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }
}

impl MiqpSolver for ClarabelMiqpSolver {
    fn name(&self) -> &str {
        "clarabel-enumeration"
    }

    fn solve(&self, problem: &MiqpProblem) -> Result<MiqpOutcome> {
        problem.validate()?;

        let mut is_binary = vec![false; problem.variable_count()];
        for &b in &problem.binaries {
            is_binary[b] = true;
        }
        let binary_only = |c: &LinearConstraint| {
            c.coefficients
                .iter()
                .enumerate()
                .all(|(j, a)| *a == 0.0 || is_binary[j])
        };

        let mut search = Search {
            problem,
            settings: &self.settings,
            started: Instant::now(),
            binary_equalities: (0..problem.equalities.len())
                .filter(|&r| binary_only(&problem.equalities[r]))
                .collect(),
            binary_inequalities: (0..problem.inequalities.len())
                .filter(|&r| binary_only(&problem.inequalities[r]))
                .collect(),
            subproblems: 0,
            best: None,
        };

        let mut assignment: Vec<Option<f64>> = vec![None; problem.variable_count()];
        search.descend(0, &mut assignment)?;

        debug!(
            "MIQP with {} binaries solved via {} QPs in {:.3}s",
            problem.binaries.len(),
            search.subproblems,
            search.started.elapsed().as_secs_f64()
        );

        Ok(match search.best {
            Some(solution) => MiqpOutcome::Optimal(solution),
            None => MiqpOutcome::Infeasible,
        })
    }
}

impl<'a> Search<'a> {
    /// Depth-first assignment of binaries in index order, pruning on
    /// binary-only rows.
    fn descend(&mut self, depth: usize, assignment: &mut [Option<f64>]) -> Result<()> {
        if !self.binary_rows_admissible(assignment) {
            return Ok(());
        }
        if depth == self.problem.binaries.len() {
            return self.solve_leaf(assignment);
        }

        let var = self.problem.binaries[depth];
        for value in [0.0, 1.0] {
            assignment[var] = Some(value);
            self.descend(depth + 1, assignment)?;
        }
        assignment[var] = None;
        Ok(())
    }

    /// Whether some completion of the partial assignment can satisfy every
    /// binary-only row.
    fn binary_rows_admissible(&self, assignment: &[Option<f64>]) -> bool {
        let bounds = |c: &LinearConstraint| {
            let mut lo = 0.0;
            let mut hi = 0.0;
            for (a, v) in c.coefficients.iter().zip(assignment) {
                match v {
                    Some(v) => {
                        lo += a * v;
                        hi += a * v;
                    }
                    None => {
                        lo += a.min(0.0);
                        hi += a.max(0.0);
                    }
                }
            }
            (lo, hi)
        };

        let ineq_ok = self.binary_inequalities.iter().all(|&r| {
            let c = &self.problem.inequalities[r];
            bounds(c).0 <= c.rhs + FEAS_TOL
        });
        let eq_ok = self.binary_equalities.iter().all(|&r| {
            let c = &self.problem.equalities[r];
            let (lo, hi) = bounds(c);
            lo <= c.rhs + FEAS_TOL && hi >= c.rhs - FEAS_TOL
        });
        ineq_ok && eq_ok
    }

    fn solve_leaf(&mut self, assignment: &[Option<f64>]) -> Result<()> {
        self.subproblems += 1;
        if self.subproblems > self.settings.max_subproblems {
            return Err(AllocationError::solver(format!(
                "Exceeded {} continuous subproblems",
                self.settings.max_subproblems
            )));
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > self.settings.time_limit_secs {
            return Err(AllocationError::solver(format!(
                "Time limit of {:e}s exceeded after {} subproblems",
                self.settings.time_limit_secs, self.subproblems
            )));
        }

        let Some(fixed) = presolve(self.problem, assignment) else {
            trace!("Assignment infeasible in presolve");
            return Ok(());
        };
        let remaining = self.settings.time_limit_secs - elapsed;
        let Some(x) = solve_continuous(self.problem, &fixed, self.settings.max_iter, remaining)?
        else {
            return Ok(());
        };

        let objective = self.problem.objective(&x);
        if self.best.as_ref().map_or(true, |b| objective < b.objective) {
            let binary = self.problem.binaries.iter().map(|&b| x[b] > 0.5).collect();
            self.best = Some(MiqpSolution {
                x,
                binary,
                objective,
            });
        }
        Ok(())
    }
}

/// Fix variables pinned by single-variable rows once the binaries are set.
///
/// Returns `None` if the assignment makes some row unsatisfiable.
fn presolve(problem: &MiqpProblem, assignment: &[Option<f64>]) -> Option<Vec<Option<f64>>> {
    let n = problem.variable_count();
    let mut fixed = assignment.to_vec();

    loop {
        let mut lower = vec![f64::NEG_INFINITY; n];
        let mut upper = vec![f64::INFINITY; n];
        let mut changed = false;

        // residual rhs and the free coefficients of a row
        let reduce = |c: &LinearConstraint, fixed: &[Option<f64>]| {
            let mut rhs = c.rhs;
            let mut free = Vec::new();
            for (j, &a) in c.coefficients.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                match fixed[j] {
                    Some(v) => rhs -= a * v,
                    None => free.push((j, a)),
                }
            }
            (rhs, free)
        };

        for c in &problem.equalities {
            let (rhs, free) = reduce(c, &fixed);
            match free.as_slice() {
                [] if rhs.abs() > FEAS_TOL => return None,
                [(j, a)] => {
                    fixed[*j] = Some(rhs / a);
                    changed = true;
                }
                _ => {}
            }
        }

        for c in &problem.inequalities {
            let (rhs, free) = reduce(c, &fixed);
            match free.as_slice() {
                [] if rhs < -FEAS_TOL => return None,
                [(j, a)] if *a > 0.0 => upper[*j] = upper[*j].min(rhs / a),
                [(j, a)] => lower[*j] = lower[*j].max(rhs / a),
                _ => {}
            }
        }

        for j in 0..n {
            if fixed[j].is_some() {
                continue;
            }
            if lower[j] > upper[j] + FEAS_TOL {
                return None;
            }
            if upper[j] - lower[j] <= FEAS_TOL {
                // + 0.0 turns a pinned -0.0 into 0.0
                fixed[j] = Some(lower[j] + 0.0);
                changed = true;
            }
        }

        if !changed {
            return Some(fixed);
        }
    }
}

/// Solve the continuous QP left after fixing variables.
///
/// Returns `Ok(None)` when clarabel certifies infeasibility.
fn solve_continuous(
    problem: &MiqpProblem,
    fixed: &[Option<f64>],
    max_iter: u32,
    time_limit: f64,
) -> Result<Option<Vec<f64>>> {
    use clarabel::algebra::*;
    use clarabel::solver::*;

    let free: Vec<usize> = (0..fixed.len()).filter(|&j| fixed[j].is_none()).collect();
    let mut x: Vec<f64> = fixed.iter().map(|v| v.unwrap_or(0.0)).collect();

    let row_residual = |c: &LinearConstraint| -> (f64, Vec<f64>) {
        let rhs = c.rhs
            - c.coefficients
                .iter()
                .zip(fixed)
                .filter_map(|(a, v)| v.map(|v| a * v))
                .sum::<f64>();
        (rhs, free.iter().map(|&j| c.coefficients[j]).collect())
    };

    if free.is_empty() {
        let feasible = problem
            .equalities
            .iter()
            .all(|c| (c.evaluate(&x) - c.rhs).abs() <= FEAS_TOL)
            && problem
                .inequalities
                .iter()
                .all(|c| c.evaluate(&x) <= c.rhs + FEAS_TOL);
        return Ok(feasible.then_some(x));
    }

    let m = free.len();

    // P restricted to the free variables, upper triangle in CSC form
    let mut p_data = Vec::new();
    let mut p_indices = Vec::new();
    let mut p_indptr = vec![0];
    for (col, &j) in free.iter().enumerate() {
        for (row, &i) in free.iter().enumerate().take(col + 1) {
            let val = problem.quadratic[i][j];
            if val.abs() > 1e-14 {
                p_data.push(val);
                p_indices.push(row);
            }
        }
        p_indptr.push(p_data.len());
    }
    let p = CscMatrix::new(m, m, p_indptr, p_indices, p_data);

    // q_f + P_{f,fixed} v
    let q: Vec<f64> = free
        .iter()
        .map(|&i| {
            problem.linear[i]
                + fixed
                    .iter()
                    .enumerate()
                    .filter_map(|(j, v)| v.map(|v| problem.quadratic[i][j] * v))
                    .sum::<f64>()
        })
        .collect();

    // rows that still involve a free variable: equalities first, then inequalities
    let mut rows: Vec<(Vec<f64>, f64)> = Vec::new();
    for c in &problem.equalities {
        let (rhs, coefs) = row_residual(c);
        if coefs.iter().any(|a| *a != 0.0) {
            rows.push((coefs, rhs));
        }
    }
    let eq_rows = rows.len();
    for c in &problem.inequalities {
        let (rhs, coefs) = row_residual(c);
        if coefs.iter().any(|a| *a != 0.0) {
            rows.push((coefs, rhs));
        }
    }
    let ineq_rows = rows.len() - eq_rows;

    let mut a_data = Vec::new();
    let mut a_indices = Vec::new();
    let mut a_indptr = vec![0];
    for col in 0..m {
        for (r, (coefs, _)) in rows.iter().enumerate() {
            if coefs[col] != 0.0 {
                a_data.push(coefs[col]);
                a_indices.push(r);
            }
        }
        a_indptr.push(a_data.len());
    }
    let a = CscMatrix::new(rows.len(), m, a_indptr, a_indices, a_data);
    let b: Vec<f64> = rows.iter().map(|(_, rhs)| *rhs).collect();

    let mut cones = Vec::new();
    if eq_rows > 0 {
        cones.push(ZeroConeT(eq_rows));
    }
    if ineq_rows > 0 {
        cones.push(NonnegativeConeT(ineq_rows));
    }

    let settings = DefaultSettingsBuilder::default()
        .max_iter(max_iter)
        .time_limit(time_limit.max(0.0))
        .verbose(false)
        .build()
        .map_err(|e| AllocationError::solver(format!("Failed to build settings: {}", e)))?;

    let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, settings)
        .map_err(|e| AllocationError::solver(format!("Failed to create solver: {:?}", e)))?;

    solver.solve();

    match solver.solution.status {
        SolverStatus::Solved | SolverStatus::AlmostSolved => {
            for (k, &j) in free.iter().enumerate() {
                x[j] = solver.solution.x[k];
            }
            Ok(Some(x))
        }
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => Ok(None),
        SolverStatus::MaxTime => Err(AllocationError::solver(
            "Continuous subproblem hit the time limit",
        )),
        status => Err(AllocationError::solver(format!(
            "Continuous subproblem failed with status: {:?}",
            status
        ))),
    }
}
