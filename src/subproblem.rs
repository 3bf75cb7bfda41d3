//! Per-cluster sparse mean-variance problem.
//!
//! For a cluster with m assets the adapter builds
//!
//! ```text
//! minimize    wᵀΣw − γ μᵀw
//! subject to  0 ≤ w_i ≤ w̄ z_i,  Σ w_i = α,  Σ z_i ≤ Δ,  z ∈ {0,1}^m
//! ```
//!
//! over the stacked variable vector `[w, z]` and hands it to a
//! [`MiqpSolver`].

use crate::distance::Estimates;
use crate::error::{AllocationError, Result};
use crate::solver::{MiqpOutcome, MiqpProblem, MiqpSolver};
use crate::types::{ClusterShare, PortfolioParams, SUM_TOLERANCE};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The intra-cluster problem for one cluster and one (Δ_k, α_k) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterProblem {
    pub cluster: usize,
    /// Global asset indices, ascending.
    pub assets: Vec<usize>,
    pub covariance: Vec<Vec<f64>>,
    pub mean: Vec<f64>,
    pub share: ClusterShare,
    pub max_weight: f64,
    pub risk_aversion: f64,
}

/// Optimal weights of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSolution {
    pub cluster: usize,
    /// Global asset indices the weights belong to.
    pub assets: Vec<usize>,
    pub weights: Vec<f64>,
    pub share: ClusterShare,
    /// Optimal value of wᵀΣw − γ μᵀw.
    pub objective: f64,
}

impl ClusterSolution {
    /// Number of assets held inside the cluster.
    pub fn holdings(&self) -> usize {
        self.weights
            .iter()
            .filter(|&&w| w > crate::types::HOLDING_EPSILON)
            .count()
    }
}

impl ClusterProblem {
    /// Slice the global estimates down to one cluster.
    pub fn new(
        cluster: usize,
        assets: Vec<usize>,
        estimates: &Estimates,
        share: ClusterShare,
        params: &PortfolioParams,
    ) -> Self {
        Self {
            cluster,
            covariance: estimates.sub_covariance(&assets),
            mean: estimates.sub_mean(&assets),
            assets,
            share,
            max_weight: params.max_weight,
            risk_aversion: params.risk_aversion,
        }
    }

    pub fn size(&self) -> usize {
        self.assets.len()
    }

    /// Reject (Δ_k, α_k, w̄) combinations no weight vector can satisfy.
    pub fn check_feasible(&self) -> Result<()> {
        let alpha = self.share.capital;
        if !(-SUM_TOLERANCE..=1.0 + SUM_TOLERANCE).contains(&alpha) {
            return Err(AllocationError::InvalidInput(format!(
                "Capital fraction {} of cluster {} outside [0, 1]",
                alpha, self.cluster
            )));
        }

        let slots = self.share.cardinality.min(self.size());
        let capacity = slots as f64 * self.max_weight;
        if capacity + SUM_TOLERANCE < alpha {
            return Err(AllocationError::InfeasibleClusterProblem {
                cluster: self.cluster,
                reason: format!(
                    "{} slots at max weight {} hold {:.6}, capital fraction is {:.6}",
                    slots, self.max_weight, capacity, alpha
                ),
            });
        }
        Ok(())
    }

    /// Build the MIQP over `[w_0..w_{m-1}, z_0..z_{m-1}]`.
    pub fn formulate(&self) -> MiqpProblem {
        let m = self.size();
        let n = 2 * m;

        // ½ xᵀPx with P = 2Σ on the weight block gives wᵀΣw
        let mut quadratic = vec![vec![0.0; n]; n];
        for i in 0..m {
            for j in 0..m {
                quadratic[i][j] = 2.0 * self.covariance[i][j];
            }
        }
        let mut linear = vec![0.0; n];
        for i in 0..m {
            linear[i] = -self.risk_aversion * self.mean[i];
        }

        let mut problem = MiqpProblem::new(quadratic, linear);

        let mut budget = vec![0.0; n];
        budget[..m].iter_mut().for_each(|c| *c = 1.0);
        problem.add_equality(budget, self.share.capital);

        for i in 0..m {
            // w_i − w̄ z_i ≤ 0
            let mut upper = vec![0.0; n];
            upper[i] = 1.0;
            upper[m + i] = -self.max_weight;
            problem.add_inequality(upper, 0.0);

            // −w_i ≤ 0
            let mut lower = vec![0.0; n];
            lower[i] = -1.0;
            problem.add_inequality(lower, 0.0);
        }

        let mut cardinality = vec![0.0; n];
        cardinality[m..].iter_mut().for_each(|c| *c = 1.0);
        problem.add_inequality(cardinality, self.share.cardinality as f64);

        for i in 0..m {
            problem.mark_binary(m + i);
        }
        problem
    }

    /// wᵀΣw − γ μᵀw.
    pub fn objective(&self, weights: &[f64]) -> f64 {
        let mut variance = 0.0;
        for (i, wi) in weights.iter().enumerate() {
            for (j, wj) in weights.iter().enumerate() {
                variance += wi * wj * self.covariance[i][j];
            }
        }
        let ret: f64 = weights.iter().zip(&self.mean).map(|(w, m)| w * m).sum();
        variance - self.risk_aversion * ret
    }

    fn empty_solution(&self) -> ClusterSolution {
        ClusterSolution {
            cluster: self.cluster,
            assets: self.assets.clone(),
            weights: vec![0.0; self.size()],
            share: self.share,
            objective: 0.0,
        }
    }

    /// Solve the cluster problem with the given backend.
    pub fn solve(&self, solver: &dyn MiqpSolver) -> Result<ClusterSolution> {
        self.check_feasible()?;

        // Δ_k = 0 or α_k = 0 leaves w = 0 as the only feasible point
        if self.share.cardinality == 0 || self.share.capital <= SUM_TOLERANCE {
            return Ok(self.empty_solution());
        }

        let problem = self.formulate();
        let solution = match solver
            .solve(&problem)
            .map_err(|e| e.with_cluster(self.cluster))?
        {
            MiqpOutcome::Optimal(solution) => solution,
            MiqpOutcome::Infeasible => {
                return Err(AllocationError::InfeasibleClusterProblem {
                    cluster: self.cluster,
                    reason: format!("{} reported the problem infeasible", solver.name()),
                })
            }
        };

        let m = self.size();
        if solution.x.len() != 2 * m || solution.binary.len() != m {
            return Err(AllocationError::solver(format!(
                "{} returned {} values and {} binaries for {} assets",
                solver.name(),
                solution.x.len(),
                solution.binary.len(),
                m
            ))
            .with_cluster(self.cluster));
        }
        let weights: Vec<f64> = (0..m)
            .map(|i| {
                if solution.binary[i] {
                    solution.x[i].clamp(0.0, self.max_weight)
                } else {
                    0.0
                }
            })
            .collect();

        let objective = self.objective(&weights);
        debug!(
            "Cluster {}: {} of {} assets held, objective {:.6}",
            self.cluster,
            weights.iter().filter(|&&w| w > crate::types::HOLDING_EPSILON).count(),
            m,
            objective
        );

        Ok(ClusterSolution {
            cluster: self.cluster,
            assets: self.assets.clone(),
            weights,
            share: self.share,
            objective,
        })
    }
}
