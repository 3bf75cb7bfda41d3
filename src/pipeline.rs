//! End-to-end cardinality-constrained allocation.
//!
//! ```text
//! returns ─▶ distance ─▶ clustering ─▶ labels ─┐
//!        └─▶ estimates (μ, Σ) ──────────────────┴─▶ planner ─▶ weights
//! ```
//!
//! Every error leaving the pipeline carries the [`PipelineStage`] it came
//! from.

use crate::allocation::{AllocationPlan, AllocationPlanner, AllocationPolicy, PlannerConfig};
use crate::clustering::{ClusteringConfig, Dendrogram, HierarchicalClustering};
use crate::distance::{distance_matrix, Estimates};
use crate::error::{AllocationError, PipelineStage, Result};
use crate::solver::{ClarabelMiqpSolver, MiqpSolver, SolverSettings};
use crate::subproblem::{ClusterProblem, ClusterSolution};
use crate::types::{
    ClusterAllocation, ClusterLabels, ClusterShare, PortfolioParams, PortfolioWeights,
    ReturnMatrix,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Runtime configuration for the whole pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub params: PortfolioParams,
    pub clustering: ClusteringConfig,
    pub planner: PlannerConfig,
    pub solver: SolverSettings,
    /// Scale per-period moments by this factor before optimising.
    pub periods_per_year: Option<f64>,
    /// Also solve the full universe as one cluster for comparison.
    pub compare_unclustered: bool,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.planner.validate()?;
        self.solver.validate()?;
        if let Some(f) = self.periods_per_year {
            if !(f > 0.0 && f.is_finite()) {
                return Err(AllocationError::ConfigError(format!(
                    "periods_per_year must be positive, got {}",
                    f
                )));
            }
        }
        Ok(())
    }
}

/// Everything a run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub assets: Vec<String>,
    pub dendrogram: Dendrogram,
    pub allocation: ClusterAllocation,
    pub cluster_solutions: Vec<ClusterSolution>,
    pub weights: PortfolioWeights,
    /// Σ_k f*_k at the chosen allocation.
    pub objective: f64,
    pub expected_return: f64,
    pub variance: f64,
    pub candidates_evaluated: usize,
    /// Objective of the single-cluster problem, when requested.
    pub unclustered_objective: Option<f64>,
}

impl PipelineResult {
    pub fn labels(&self) -> &ClusterLabels {
        &self.dendrogram.labels
    }

    /// Held assets as (name, weight), largest weight first.
    pub fn holdings(&self) -> Vec<(String, f64)> {
        let w = self.weights.as_slice();
        let mut held: Vec<(String, f64)> = self
            .weights
            .held_assets()
            .into_iter()
            .map(|i| (self.assets[i].clone(), w[i]))
            .collect();
        held.sort_by(|a, b| b.1.total_cmp(&a.1));
        held
    }
}

/// One point on an objective-versus-budget curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub budget: usize,
    pub clustered: f64,
    pub unclustered: Option<f64>,
}

/// The assembled pipeline.
pub struct CardinalityPipeline {
    config: PipelineConfig,
    clustering: HierarchicalClustering,
    planner: AllocationPlanner,
}

impl CardinalityPipeline {
    /// Build the pipeline with the configured policy and the clarabel backend.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let policy = config.planner.build_policy();
        let solver = Box::new(ClarabelMiqpSolver::new(config.solver.clone()));
        Self::with_components(config, policy, solver)
    }

    /// Build the pipeline around a custom policy and solver backend.
    pub fn with_components(
        config: PipelineConfig,
        policy: Box<dyn AllocationPolicy>,
        solver: Box<dyn MiqpSolver>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            clustering: HierarchicalClustering::new(config.clustering.clone()),
            planner: AllocationPlanner::new(policy, solver).with_parallel(config.planner.parallel),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Correlation distance and clustering.
    pub fn cluster(&self, returns: &ReturnMatrix) -> Result<Dendrogram> {
        let distance = distance_matrix(returns).map_err(|e| e.at(PipelineStage::Correlation))?;
        self.clustering
            .cluster(&distance)
            .map_err(|e| e.at(PipelineStage::Clustering))
    }

    /// Mean and covariance, annualised if configured.
    pub fn estimates(&self, returns: &ReturnMatrix) -> Result<Estimates> {
        let estimates =
            Estimates::from_returns(returns).map_err(|e| e.at(PipelineStage::Correlation))?;
        Ok(match self.config.periods_per_year {
            Some(f) => estimates.annualized(f),
            None => estimates,
        })
    }

    /// Plan an allocation for already-clustered assets.
    pub fn allocate(
        &self,
        labels: &ClusterLabels,
        estimates: &Estimates,
        params: &PortfolioParams,
    ) -> Result<AllocationPlan> {
        self.planner
            .plan(labels, estimates, params)
            .map_err(|e| e.at(PipelineStage::Allocation))
    }

    /// Solve the whole universe as a single cluster with budget Δ.
    pub fn solve_unclustered(
        &self,
        estimates: &Estimates,
        params: &PortfolioParams,
    ) -> Result<ClusterSolution> {
        params
            .validate(estimates.asset_count())
            .map_err(|e| e.at(PipelineStage::Allocation))?;
        let assets: Vec<usize> = (0..estimates.asset_count()).collect();
        ClusterProblem::new(0, assets, estimates, ClusterShare::new(params.budget, 1.0), params)
            .solve(self.planner.solver())
            .map_err(|e| e.at(PipelineStage::ClusterSolve))
    }

    /// Run every stage on a return matrix.
    pub fn run(&self, returns: &ReturnMatrix) -> Result<PipelineResult> {
        info!(
            "Running pipeline on {} assets x {} periods (budget {}, {} policy, {} solver)",
            returns.asset_count(),
            returns.observations(),
            self.config.params.budget,
            self.planner.policy().name(),
            self.planner.solver().name()
        );

        let dendrogram = self.cluster(returns)?;
        let estimates = self.estimates(returns)?;
        let params = self.config.params;
        let plan = self.allocate(&dendrogram.labels, &estimates, &params)?;

        let unclustered_objective = if self.config.compare_unclustered {
            Some(self.solve_unclustered(&estimates, &params)?.objective)
        } else {
            None
        };

        let expected_return = plan.weights.expected_return(&estimates.mean);
        let variance = plan.weights.variance(&estimates.covariance);
        info!(
            "Pipeline done: {} holdings, objective {:.6}, return {:.6}, variance {:.6}",
            plan.weights.holdings(),
            plan.objective,
            expected_return,
            variance
        );

        Ok(PipelineResult {
            assets: returns.assets().to_vec(),
            dendrogram,
            allocation: plan.allocation,
            cluster_solutions: plan.clusters,
            weights: plan.weights,
            objective: plan.objective,
            expected_return,
            variance,
            candidates_evaluated: plan.candidates_evaluated,
            unclustered_objective,
        })
    }

    /// Optimal objective for each budget in `budgets`.
    ///
    /// Clustering and estimates are computed once. Budgets no allocation can
    /// satisfy are skipped with a warning; any other failure aborts the curve.
    pub fn objective_curve(&self, returns: &ReturnMatrix, budgets: &[usize]) -> Result<Vec<CurvePoint>> {
        let dendrogram = self.cluster(returns)?;
        let estimates = self.estimates(returns)?;

        let mut curve = Vec::with_capacity(budgets.len());
        for &budget in budgets {
            let params = self.config.params.with_budget(budget);
            let clustered = match self.allocate(&dendrogram.labels, &estimates, &params) {
                Ok(plan) => plan.objective,
                Err(e) if is_infeasible(&e) => {
                    warn!("Skipping budget {}: {}", budget, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let unclustered = if self.config.compare_unclustered {
                match self.solve_unclustered(&estimates, &params) {
                    Ok(s) => Some(s.objective),
                    Err(e) if is_infeasible(&e) => None,
                    Err(e) => return Err(e),
                }
            } else {
                None
            };
            curve.push(CurvePoint {
                budget,
                clustered,
                unclustered,
            });
        }
        Ok(curve)
    }
}

fn is_infeasible(e: &AllocationError) -> bool {
    matches!(
        e.root(),
        AllocationError::InfeasibleAllocation(_)
            | AllocationError::InfeasibleClusterProblem { .. }
            | AllocationError::InvalidInput(_)
    )
}
