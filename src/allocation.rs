//! Outer search over cardinality and capital splits.
//!
//! An [`AllocationPolicy`] proposes candidate [`ClusterAllocation`]s; the
//! [`AllocationPlanner`] scores each candidate with the additive objective
//! Σ_k f*_k(Δ_k, α_k), where every term is an intra-cluster MIQP solve, and
//! keeps the best one.

use crate::distance::Estimates;
use crate::error::{AllocationError, PipelineStage, Result};
use crate::solver::MiqpSolver;
use crate::subproblem::{ClusterProblem, ClusterSolution};
use crate::types::{
    ClusterAllocation, ClusterLabels, ClusterShare, PortfolioParams, PortfolioWeights,
    SUM_TOLERANCE,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Proposes candidate splits of the budget and capital across clusters.
pub trait AllocationPolicy: Send + Sync {
    /// Policy name for logging.
    fn name(&self) -> &str;

    /// Candidates for clusters of the given sizes, in evaluation order.
    fn propose(&self, sizes: &[usize], params: &PortfolioParams) -> Result<Vec<ClusterAllocation>>;
}

/// How capital fractions follow the cardinality split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum CapitalRule {
    /// α_k = Δ_k / Δ.
    Cardinality,
    /// Every α on a simplex grid of `steps` units that the caps can hold.
    Grid { steps: usize },
}

/// Minimum cardinality per cluster and a sanity check shared by all policies.
fn check_split(sizes: &[usize], params: &PortfolioParams, require_every_cluster: bool) -> Result<usize> {
    let total: usize = sizes.iter().sum();
    if params.budget > total {
        return Err(AllocationError::InfeasibleAllocation(format!(
            "budget {} exceeds the {} clustered assets",
            params.budget, total
        )));
    }
    if require_every_cluster && params.budget < sizes.len() {
        return Err(AllocationError::InfeasibleAllocation(format!(
            "budget {} cannot give each of {} clusters a slot",
            params.budget,
            sizes.len()
        )));
    }
    if (params.budget as f64) * params.max_weight + SUM_TOLERANCE < 1.0 {
        return Err(AllocationError::InfeasibleAllocation(format!(
            "{} assets at max weight {} cannot hold the full portfolio",
            params.budget, params.max_weight
        )));
    }
    Ok(if require_every_cluster { 1 } else { 0 })
}

fn capital_by_cardinality(caps: &[usize], budget: usize) -> ClusterAllocation {
    ClusterAllocation::new(
        caps.iter()
            .map(|&c| ClusterShare::new(c, c as f64 / budget as f64))
            .collect(),
    )
}

/// Cardinality proportional to cluster size, capital proportional to
/// cardinality.
///
/// Slots are handed out one at a time to the cluster whose size quota
/// Δ·|C_k|/N is furthest from its current cap, which reproduces the
/// largest-remainder rounding. Ties go to the lowest cluster id.
#[derive(Debug, Clone, Default)]
pub struct ProportionalPolicy {
    pub require_every_cluster: bool,
}

impl ProportionalPolicy {
    pub fn new(require_every_cluster: bool) -> Self {
        Self {
            require_every_cluster,
        }
    }

    /// Integer caps summing to the budget.
    pub fn caps(&self, sizes: &[usize], budget: usize) -> Vec<usize> {
        let total: usize = sizes.iter().sum();
        let quota: Vec<f64> = sizes
            .iter()
            .map(|&s| budget as f64 * s as f64 / total as f64)
            .collect();

        let floor = usize::from(self.require_every_cluster);
        let mut caps: Vec<usize> = sizes.iter().map(|&s| floor.min(s)).collect();
        let mut assigned: usize = caps.iter().sum();

        while assigned < budget {
            let next = (0..sizes.len())
                .filter(|&k| caps[k] < sizes[k])
                .fold(None::<(usize, f64)>, |best, k| {
                    let deficit = quota[k] - caps[k] as f64;
                    match best {
                        Some((_, d)) if d >= deficit => best,
                        _ => Some((k, deficit)),
                    }
                });
            match next {
                Some((k, _)) => {
                    caps[k] += 1;
                    assigned += 1;
                }
                None => break,
            }
        }
        caps
    }
}

impl AllocationPolicy for ProportionalPolicy {
    fn name(&self) -> &str {
        "proportional"
    }

    fn propose(&self, sizes: &[usize], params: &PortfolioParams) -> Result<Vec<ClusterAllocation>> {
        check_split(sizes, params, self.require_every_cluster)?;
        let caps = self.caps(sizes, params.budget);
        Ok(vec![capital_by_cardinality(&caps, params.budget)])
    }
}

/// Every composition of the budget, optionally crossed with a capital grid.
#[derive(Debug, Clone)]
pub struct ExhaustivePolicy {
    pub require_every_cluster: bool,
    pub capital: CapitalRule,
    /// Upper bound on the number of proposed candidates.
    pub max_candidates: usize,
}

impl Default for ExhaustivePolicy {
    fn default() -> Self {
        Self {
            require_every_cluster: false,
            capital: CapitalRule::Cardinality,
            max_candidates: 20_000,
        }
    }
}

impl ExhaustivePolicy {
    /// All cap vectors with `min ≤ Δ_k ≤ |C_k|` summing to `budget`, in
    /// lexicographic order.
    pub fn compositions(sizes: &[usize], budget: usize, min: usize) -> Vec<Vec<usize>> {
        fn walk(
            sizes: &[usize],
            remaining: usize,
            min: usize,
            current: &mut Vec<usize>,
            out: &mut Vec<Vec<usize>>,
        ) {
            let k = current.len();
            if k == sizes.len() {
                if remaining == 0 {
                    out.push(current.clone());
                }
                return;
            }
            let rest_min = min * (sizes.len() - k - 1);
            let rest_max: usize = sizes[k + 1..].iter().sum();
            let lo = min.max(remaining.saturating_sub(rest_max));
            let hi = sizes[k].min(remaining.saturating_sub(rest_min));
            for c in lo..=hi {
                if c > remaining {
                    break;
                }
                current.push(c);
                walk(sizes, remaining - c, min, current, out);
                current.pop();
            }
        }

        let mut out = Vec::new();
        walk(sizes, budget, min, &mut Vec::new(), &mut out);
        out
    }

    /// Capital splits on a grid of `steps` units for fixed caps, at most `limit` of them.
    fn capital_grid(caps: &[usize], steps: usize, max_weight: f64, limit: usize) -> Vec<Vec<f64>> {
        fn walk(
            caps: &[usize],
            remaining: usize,
            steps: usize,
            max_weight: f64,
            limit: usize,
            current: &mut Vec<usize>,
            out: &mut Vec<Vec<f64>>,
        ) {
            if out.len() >= limit {
                return;
            }
            let k = current.len();
            if k == caps.len() {
                if remaining == 0 {
                    out.push(current.iter().map(|&u| u as f64 / steps as f64).collect());
                }
                return;
            }
            let range = if caps[k] == 0 {
                0..=0
            } else if k + 1 == caps.len() {
                remaining.max(1)..=remaining
            } else {
                1..=remaining
            };
            for u in range {
                if out.len() >= limit {
                    break;
                }
                let alpha = u as f64 / steps as f64;
                if alpha > caps[k] as f64 * max_weight + SUM_TOLERANCE {
                    break;
                }
                current.push(u);
                walk(caps, remaining - u, steps, max_weight, limit, current, out);
                current.pop();
            }
        }

        let mut out = Vec::new();
        walk(caps, steps, steps, max_weight, limit, &mut Vec::new(), &mut out);
        out
    }
}

impl AllocationPolicy for ExhaustivePolicy {
    fn name(&self) -> &str {
        "exhaustive"
    }

    fn propose(&self, sizes: &[usize], params: &PortfolioParams) -> Result<Vec<ClusterAllocation>> {
        let min = check_split(sizes, params, self.require_every_cluster)?;
        let compositions = Self::compositions(sizes, params.budget, min);

        let mut candidates = Vec::new();
        for caps in compositions {
            match self.capital {
                CapitalRule::Cardinality => {
                    candidates.push(capital_by_cardinality(&caps, params.budget))
                }
                CapitalRule::Grid { steps } => {
                    // one past the cap is enough to trip the check below
                    let allowance = (self.max_candidates + 1).saturating_sub(candidates.len());
                    for alphas in Self::capital_grid(&caps, steps, params.max_weight, allowance) {
                        candidates.push(ClusterAllocation::new(
                            caps.iter()
                                .zip(alphas)
                                .map(|(&c, a)| ClusterShare::new(c, a))
                                .collect(),
                        ));
                    }
                }
            }
            if candidates.len() > self.max_candidates {
                return Err(AllocationError::ConfigError(format!(
                    "exhaustive search exceeds {} candidates; raise allocation.max_candidates or use the proportional policy",
                    self.max_candidates
                )));
            }
        }

        if candidates.is_empty() {
            return Err(AllocationError::InfeasibleAllocation(
                "no split satisfies the cluster sizes and capital grid".to_string(),
            ));
        }
        Ok(candidates)
    }
}

/// Which policy the planner uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Proportional,
    Exhaustive,
}

/// Planner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub policy: PolicyKind,
    /// Force Δ_k ≥ 1 for every cluster.
    pub require_every_cluster: bool,
    pub capital: CapitalRule,
    pub max_candidates: usize,
    /// Solve the clusters of a candidate on the rayon pool.
    pub parallel: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Proportional,
            require_every_cluster: false,
            capital: CapitalRule::Cardinality,
            max_candidates: 20_000,
            parallel: true,
        }
    }
}

impl PlannerConfig {
    /// Instantiate the configured policy.
    pub fn build_policy(&self) -> Box<dyn AllocationPolicy> {
        match self.policy {
            PolicyKind::Proportional => Box::new(ProportionalPolicy::new(self.require_every_cluster)),
            PolicyKind::Exhaustive => Box::new(ExhaustivePolicy {
                require_every_cluster: self.require_every_cluster,
                capital: self.capital,
                max_candidates: self.max_candidates,
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let CapitalRule::Grid { steps } = self.capital {
            if steps == 0 {
                return Err(AllocationError::ConfigError(
                    "allocation.capital_steps must be positive".to_string(),
                ));
            }
        }
        if self.max_candidates == 0 {
            return Err(AllocationError::ConfigError(
                "allocation.max_candidates must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Best candidate found by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub allocation: ClusterAllocation,
    pub clusters: Vec<ClusterSolution>,
    pub weights: PortfolioWeights,
    /// Σ_k f*_k at the chosen allocation.
    pub objective: f64,
    pub candidates_evaluated: usize,
    pub candidates_infeasible: usize,
}

/// Scores candidates from a policy with per-cluster MIQP solves.
pub struct AllocationPlanner {
    policy: Box<dyn AllocationPolicy>,
    solver: Box<dyn MiqpSolver>,
    parallel: bool,
}

impl AllocationPlanner {
    pub fn new(policy: Box<dyn AllocationPolicy>, solver: Box<dyn MiqpSolver>) -> Self {
        Self {
            policy,
            solver,
            parallel: true,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn policy(&self) -> &dyn AllocationPolicy {
        self.policy.as_ref()
    }

    pub fn solver(&self) -> &dyn MiqpSolver {
        self.solver.as_ref()
    }

    /// Solve every cluster for one candidate.
    ///
    /// Results come back in cluster order. Any error other than an
    /// infeasible cluster takes precedence so solver failures are never
    /// masked by infeasibility elsewhere.
    pub fn evaluate(
        &self,
        clusters: &[Vec<usize>],
        allocation: &ClusterAllocation,
        estimates: &Estimates,
        params: &PortfolioParams,
    ) -> Result<Vec<ClusterSolution>> {
        let solve = |(k, (assets, share)): (usize, (&Vec<usize>, &ClusterShare))| {
            ClusterProblem::new(k, assets.clone(), estimates, *share, params)
                .solve(self.solver.as_ref())
        };

        let results: Vec<Result<ClusterSolution>> = if self.parallel {
            clusters
                .par_iter()
                .zip(allocation.shares.par_iter())
                .enumerate()
                .map(solve)
                .collect()
        } else {
            clusters
                .iter()
                .zip(allocation.shares.iter())
                .enumerate()
                .map(solve)
                .collect()
        };

        let mut infeasible = None;
        let mut solutions = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(solution) => solutions.push(solution),
                Err(e @ AllocationError::InfeasibleClusterProblem { .. }) => {
                    infeasible.get_or_insert(e);
                }
                Err(e) => return Err(e.at(PipelineStage::ClusterSolve)),
            }
        }
        match infeasible {
            Some(e) => Err(e),
            None => Ok(solutions),
        }
    }

    /// Search the policy's candidates for the lowest additive objective.
    pub fn plan(
        &self,
        labels: &ClusterLabels,
        estimates: &Estimates,
        params: &PortfolioParams,
    ) -> Result<AllocationPlan> {
        params.validate(labels.asset_count())?;
        if estimates.asset_count() != labels.asset_count() {
            return Err(AllocationError::InvalidInput(format!(
                "Estimates cover {} assets, labels cover {}",
                estimates.asset_count(),
                labels.asset_count()
            )));
        }

        let clusters = labels.clusters();
        let sizes: Vec<usize> = clusters.iter().map(|c| c.len()).collect();
        let candidates = self.policy.propose(&sizes, params)?;
        info!(
            "Evaluating {} candidate allocations across {} clusters ({} policy)",
            candidates.len(),
            clusters.len(),
            self.policy.name()
        );

        let mut best: Option<(ClusterAllocation, Vec<ClusterSolution>, f64)> = None;
        let mut infeasible = 0;
        let mut last_infeasible = None;

        for candidate in &candidates {
            candidate.validate(params.budget, &sizes)?;
            let solutions = match self.evaluate(&clusters, candidate, estimates, params) {
                Ok(s) => s,
                Err(e @ AllocationError::InfeasibleClusterProblem { .. }) => {
                    warn!("Skipping candidate {:?}: {}", candidate.shares, e);
                    infeasible += 1;
                    last_infeasible = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let objective: f64 = solutions.iter().map(|s| s.objective).sum();
            debug!("Candidate {:?} scores {:.8}", candidate.shares, objective);
            if best.as_ref().map_or(true, |(_, _, b)| objective < *b) {
                best = Some((candidate.clone(), solutions, objective));
            }
        }

        let Some((allocation, solutions, objective)) = best else {
            return Err(match last_infeasible {
                // a lone candidate keeps its cluster id
                Some(e) if candidates.len() == 1 => e,
                last => AllocationError::InfeasibleAllocation(format!(
                    "all {} candidates infeasible; last: {}",
                    candidates.len(),
                    last.map(|e| e.to_string()).unwrap_or_default()
                )),
            });
        };

        let parts: Vec<(Vec<usize>, Vec<f64>)> = solutions
            .iter()
            .map(|s| (s.assets.clone(), s.weights.clone()))
            .collect();
        let weights = PortfolioWeights::assemble(labels.asset_count(), &parts)?;
        weights
            .validate(params.max_weight, params.budget)
            .map_err(|e| AllocationError::solver(format!("Assembled weights rejected: {}", e)))?;

        info!(
            "Chose allocation {:?} with objective {:.8}",
            allocation.shares, objective
        );

        Ok(AllocationPlan {
            allocation,
            clusters: solutions,
            weights,
            objective,
            candidates_evaluated: candidates.len(),
            candidates_infeasible: infeasible,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::ClarabelMiqpSolver;

    fn estimates() -> Estimates {
        let mean = vec![0.10, 0.12, 0.05, 0.06, 0.08];
        let var = [0.04, 0.05, 0.01, 0.012, 0.03];
        let mut cov = vec![vec![0.0; 5]; 5];
        for i in 0..5 {
            cov[i][i] = var[i];
        }
        Estimates::new(mean, cov).unwrap()
    }

    fn planner(policy: Box<dyn AllocationPolicy>) -> AllocationPlanner {
        AllocationPlanner::new(policy, Box::new(ClarabelMiqpSolver::default()))
    }

    #[test]
    fn test_proportional_caps_largest_remainder() {
        let policy = ProportionalPolicy::default();
        assert_eq!(policy.caps(&[3, 2], 3), vec![2, 1]);
        assert_eq!(policy.caps(&[4, 4, 2], 5), vec![2, 2, 1]);
        assert_eq!(policy.caps(&[1, 1, 1], 2), vec![1, 1, 0]);

        let strict = ProportionalPolicy::new(true);
        assert_eq!(strict.caps(&[8, 1, 1], 3), vec![1, 1, 1]);
    }

    #[test]
    fn test_proportional_sums_match_budget() {
        let params = PortfolioParams::new(4, 0.5, 1.0);
        let candidates = ProportionalPolicy::default()
            .propose(&[5, 3, 2], &params)
            .unwrap();
        assert_eq!(candidates.len(), 1);
        let alloc = &candidates[0];
        assert_eq!(alloc.total_cardinality(), 4);
        assert!((alloc.total_capital() - 1.0).abs() < 1e-12);
        assert!(alloc.validate(4, &[5, 3, 2]).is_ok());
    }

    #[test]
    fn test_require_every_cluster_with_small_budget() {
        let params = PortfolioParams::new(2, 1.0, 1.0);
        let err = ProportionalPolicy::new(true).propose(&[2, 2, 2], &params);
        assert!(matches!(err, Err(AllocationError::InfeasibleAllocation(_))));

        // without the requirement a cluster simply receives nothing
        let ok = ProportionalPolicy::new(false)
            .propose(&[2, 2, 2], &params)
            .unwrap();
        assert_eq!(ok[0].total_cardinality(), 2);
    }

    #[test]
    fn test_budget_times_max_weight_below_one() {
        let params = PortfolioParams::new(2, 0.3, 1.0);
        assert!(matches!(
            ProportionalPolicy::default().propose(&[3, 3], &params),
            Err(AllocationError::InfeasibleAllocation(_))
        ));
    }

    #[test]
    fn test_compositions_enumeration() {
        let all = ExhaustivePolicy::compositions(&[2, 1], 2, 0);
        assert_eq!(all, vec![vec![1, 1], vec![2, 0]]);

        let at_least_one = ExhaustivePolicy::compositions(&[3, 3], 3, 1);
        assert_eq!(at_least_one, vec![vec![1, 2], vec![2, 1]]);

        assert!(ExhaustivePolicy::compositions(&[1, 1], 3, 0).is_empty());
    }

    #[test]
    fn test_capital_grid_respects_capacity() {
        let grid = ExhaustivePolicy::capital_grid(&[1, 2], 4, 0.5, usize::MAX);
        // cluster 0 holds at most 0.5, so at most 2 of 4 units
        for alphas in &grid {
            assert!(alphas[0] <= 0.5 + 1e-12);
            assert!((alphas.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
        assert_eq!(grid.len(), 2);

        let with_empty = ExhaustivePolicy::capital_grid(&[0, 3], 2, 1.0, usize::MAX);
        assert_eq!(with_empty, vec![vec![0.0, 1.0]]);
    }

    #[test]
    fn test_capital_grid_stops_at_limit() {
        let grid = ExhaustivePolicy::capital_grid(&[3, 3], 1_000, 1.0, 5);
        assert_eq!(grid.len(), 5);
        assert_eq!(grid[0], vec![0.001, 0.999]);
    }

    #[test]
    fn test_fine_grid_trips_candidate_cap() {
        let policy = ExhaustivePolicy {
            capital: CapitalRule::Grid { steps: 10_000_000 },
            max_candidates: 100,
            ..Default::default()
        };
        let params = PortfolioParams::new(2, 1.0, 1.0);
        assert!(matches!(
            policy.propose(&[3, 3], &params),
            Err(AllocationError::ConfigError(_))
        ));
    }

    #[test]
    fn test_exhaustive_candidate_cap() {
        let policy = ExhaustivePolicy {
            max_candidates: 1,
            ..Default::default()
        };
        let params = PortfolioParams::new(2, 1.0, 1.0);
        assert!(matches!(
            policy.propose(&[2, 2], &params),
            Err(AllocationError::ConfigError(_))
        ));
    }

    #[test]
    fn test_plan_assembles_valid_weights() {
        let labels = ClusterLabels::new(vec![0, 0, 1, 1, 0]).unwrap();
        let params = PortfolioParams::new(3, 0.5, 1.0);
        let plan = planner(Box::new(ProportionalPolicy::default()))
            .plan(&labels, &estimates(), &params)
            .unwrap();

        assert_eq!(plan.allocation.total_cardinality(), 3);
        assert!((plan.weights.total() - 1.0).abs() < 1e-6);
        assert!(plan.weights.holdings() <= 3);
        assert!(plan.weights.validate(0.5, 3).is_ok());
        let sum: f64 = plan.clusters.iter().map(|c| c.objective).sum();
        assert!((sum - plan.objective).abs() < 1e-12);
    }

    #[test]
    fn test_exhaustive_not_worse_than_proportional() {
        let labels = ClusterLabels::new(vec![0, 0, 1, 1, 0]).unwrap();
        let params = PortfolioParams::new(3, 0.5, 1.0);
        let proportional = planner(Box::new(ProportionalPolicy::default()))
            .plan(&labels, &estimates(), &params)
            .unwrap();
        let exhaustive = planner(Box::new(ExhaustivePolicy {
            // sixths contain the proportional split (2/3, 1/3)
            capital: CapitalRule::Grid { steps: 6 },
            ..Default::default()
        }))
        .plan(&labels, &estimates(), &params)
        .unwrap();

        assert!(exhaustive.candidates_evaluated > 1);
        assert!(exhaustive.objective <= proportional.objective + 1e-9);
    }

    #[test]
    fn test_sequential_and_parallel_evaluation_agree() {
        let labels = ClusterLabels::new(vec![0, 1, 1, 2, 0]).unwrap();
        let params = PortfolioParams::new(4, 0.4, 2.0);
        let a = planner(Box::new(ProportionalPolicy::default()))
            .with_parallel(false)
            .plan(&labels, &estimates(), &params)
            .unwrap();
        let b = planner(Box::new(ProportionalPolicy::default()))
            .plan(&labels, &estimates(), &params)
            .unwrap();
        assert_eq!(a.allocation, b.allocation);
        assert!((a.objective - b.objective).abs() < 1e-9);
    }

    #[test]
    fn test_plan_rejects_mismatched_estimates() {
        let labels = ClusterLabels::new(vec![0, 1]).unwrap();
        let params = PortfolioParams::new(1, 1.0, 1.0);
        assert!(planner(Box::new(ProportionalPolicy::default()))
            .plan(&labels, &estimates(), &params)
            .is_err());
    }
}
