//! Core data types for the allocation pipeline.

use crate::error::{AllocationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tolerance used when checking sums of weights and capital fractions.
pub const SUM_TOLERANCE: f64 = 1e-6;

/// Weights at or below this magnitude count as "not held".
pub const HOLDING_EPSILON: f64 = 1e-8;

/// Global portfolio parameters shared by every stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioParams {
    /// Global cardinality budget (Δ).
    pub budget: usize,
    /// Maximum weight per asset (w̄).
    pub max_weight: f64,
    /// Risk aversion (γ) applied to expected returns.
    pub risk_aversion: f64,
}

impl Default for PortfolioParams {
    fn default() -> Self {
        Self {
            budget: 5,
            max_weight: 0.3,
            risk_aversion: 1.0,
        }
    }
}

impl PortfolioParams {
    pub fn new(budget: usize, max_weight: f64, risk_aversion: f64) -> Self {
        Self {
            budget,
            max_weight,
            risk_aversion,
        }
    }

    /// Same parameters with a different cardinality budget.
    pub fn with_budget(self, budget: usize) -> Self {
        Self { budget, ..self }
    }

    /// Check parameter ranges against a universe of `assets` assets.
    pub fn validate(&self, assets: usize) -> Result<()> {
        if self.budget == 0 {
            return Err(AllocationError::InvalidInput(
                "Cardinality budget must be at least 1".to_string(),
            ));
        }
        if self.budget > assets {
            return Err(AllocationError::InvalidInput(format!(
                "Cardinality budget {} exceeds the {} available assets",
                self.budget, assets
            )));
        }
        if !(self.max_weight > 0.0 && self.max_weight <= 1.0) {
            return Err(AllocationError::InvalidInput(format!(
                "Max weight {} outside (0, 1]",
                self.max_weight
            )));
        }
        if !(self.risk_aversion > 0.0 && self.risk_aversion.is_finite()) {
            return Err(AllocationError::InvalidInput(format!(
                "Risk aversion {} must be positive",
                self.risk_aversion
            )));
        }
        Ok(())
    }
}

/// T×N matrix of asset returns: one row per period, one column per asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnMatrix {
    rows: Vec<Vec<f64>>,
    assets: Vec<String>,
}

impl ReturnMatrix {
    /// Create a return matrix from period rows, naming assets `A0..A{N-1}`.
    pub fn new(rows: Vec<Vec<f64>>) -> Result<Self> {
        let n = rows.first().map(|r| r.len()).unwrap_or(0);
        let assets = (0..n).map(|i| format!("A{}", i)).collect();
        Self::with_assets(assets, rows)
    }

    /// Create a return matrix with explicit asset names.
    pub fn with_assets(assets: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        let n = assets.len();
        if n == 0 {
            return Err(AllocationError::InvalidInput(
                "Return matrix needs at least one asset".to_string(),
            ));
        }

        for (t, row) in rows.iter().enumerate() {
            if row.len() != n {
                return Err(AllocationError::InvalidInput(format!(
                    "Row {} has {} columns, expected {}",
                    t,
                    row.len(),
                    n
                )));
            }
            if let Some(j) = row.iter().position(|v| !v.is_finite()) {
                return Err(AllocationError::InvalidInput(format!(
                    "Non-finite return at row {}, asset {}",
                    t, assets[j]
                )));
            }
        }

        Ok(Self { rows, assets })
    }

    /// Build a matrix from per-asset return columns of equal length.
    pub fn from_columns(assets: Vec<String>, columns: &[Vec<f64>]) -> Result<Self> {
        if columns.len() != assets.len() {
            return Err(AllocationError::InvalidInput(format!(
                "{} columns supplied for {} assets",
                columns.len(),
                assets.len()
            )));
        }
        let t = columns.first().map(|c| c.len()).unwrap_or(0);
        if columns.iter().any(|c| c.len() != t) {
            return Err(AllocationError::InvalidInput(
                "Return columns must have equal length".to_string(),
            ));
        }

        let rows = (0..t)
            .map(|i| columns.iter().map(|c| c[i]).collect())
            .collect();
        Self::with_assets(assets, rows)
    }

    /// Number of periods (T).
    pub fn observations(&self) -> usize {
        self.rows.len()
    }

    /// Number of assets (N).
    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    /// Asset names in column order.
    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    /// Period rows.
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Returns of a single asset over all periods.
    pub fn column(&self, asset: usize) -> Vec<f64> {
        self.rows.iter().map(|row| row[asset]).collect()
    }

    /// All asset columns.
    pub fn columns(&self) -> Vec<Vec<f64>> {
        (0..self.asset_count()).map(|j| self.column(j)).collect()
    }
}

/// Ordered, non-empty set of asset indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cluster {
    members: Vec<usize>,
}

impl Cluster {
    /// A cluster holding a single asset.
    pub fn singleton(asset: usize) -> Self {
        Self {
            members: vec![asset],
        }
    }

    /// Build a cluster from arbitrary members; they are sorted and deduplicated.
    pub fn from_members(mut members: Vec<usize>) -> Result<Self> {
        members.sort_unstable();
        members.dedup();
        if members.is_empty() {
            return Err(AllocationError::InvalidInput(
                "Cluster must contain at least one asset".to_string(),
            ));
        }
        Ok(Self { members })
    }

    /// Union of two disjoint clusters.
    pub fn union(&self, other: &Cluster) -> Cluster {
        let mut members = Vec::with_capacity(self.len() + other.len());
        members.extend_from_slice(&self.members);
        members.extend_from_slice(&other.members);
        members.sort_unstable();
        Cluster { members }
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false; kept for API symmetry with collections.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, asset: usize) -> bool {
        self.members.binary_search(&asset).is_ok()
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.members.iter().map(|m| m.to_string()).collect();
        write!(f, "{{{}}}", ids.join(","))
    }
}

/// One step of the agglomerative merge loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeLogEntry {
    pub left: Cluster,
    pub right: Cluster,
    pub merged: Cluster,
    pub distance: f64,
}

/// Total mapping from asset index to cluster id in `0..K`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLabels {
    labels: Vec<usize>,
    cluster_count: usize,
}

impl ClusterLabels {
    /// Build labels, checking they form a contiguous range starting at zero.
    pub fn new(labels: Vec<usize>) -> Result<Self> {
        if labels.is_empty() {
            return Err(AllocationError::InvalidInput(
                "Labels must cover at least one asset".to_string(),
            ));
        }
        let cluster_count = labels.iter().max().map(|m| m + 1).unwrap_or(0);
        let mut seen = vec![false; cluster_count];
        for &l in &labels {
            seen[l] = true;
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(AllocationError::InvalidInput(format!(
                "Cluster id {} has no members; labels must be contiguous",
                missing
            )));
        }
        Ok(Self {
            labels,
            cluster_count,
        })
    }

    /// Every asset in a single cluster.
    pub fn single(assets: usize) -> Result<Self> {
        Self::new(vec![0; assets])
    }

    /// Number of clusters (K).
    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    /// Number of labelled assets (N).
    pub fn asset_count(&self) -> usize {
        self.labels.len()
    }

    /// Cluster id of an asset.
    pub fn label(&self, asset: usize) -> usize {
        self.labels[asset]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.labels
    }

    /// Ascending asset indices of one cluster.
    pub fn members(&self, cluster: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == cluster)
            .map(|(i, _)| i)
            .collect()
    }

    /// Members of every cluster, indexed by cluster id.
    pub fn clusters(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.cluster_count];
        for (asset, &l) in self.labels.iter().enumerate() {
            out[l].push(asset);
        }
        out
    }

    /// Cluster sizes indexed by cluster id.
    pub fn sizes(&self) -> Vec<usize> {
        self.clusters().iter().map(|c| c.len()).collect()
    }
}

/// Cardinality cap and capital fraction for one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterShare {
    /// Maximum number of held assets (Δ_k).
    pub cardinality: usize,
    /// Fraction of capital invested in the cluster (α_k).
    pub capital: f64,
}

impl ClusterShare {
    pub fn new(cardinality: usize, capital: f64) -> Self {
        Self {
            cardinality,
            capital,
        }
    }

    /// A cluster that holds nothing.
    pub fn empty() -> Self {
        Self::new(0, 0.0)
    }
}

/// Split of the global budget and capital across clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAllocation {
    pub shares: Vec<ClusterShare>,
}

impl ClusterAllocation {
    pub fn new(shares: Vec<ClusterShare>) -> Self {
        Self { shares }
    }

    /// Σ Δ_k.
    pub fn total_cardinality(&self) -> usize {
        self.shares.iter().map(|s| s.cardinality).sum()
    }

    /// Σ α_k.
    pub fn total_capital(&self) -> f64 {
        self.shares.iter().map(|s| s.capital).sum()
    }

    /// Check the allocation against a global budget and the cluster sizes.
    pub fn validate(&self, budget: usize, sizes: &[usize]) -> Result<()> {
        if self.shares.len() != sizes.len() {
            return Err(AllocationError::InvalidInput(format!(
                "Allocation covers {} clusters, expected {}",
                self.shares.len(),
                sizes.len()
            )));
        }
        if self.total_cardinality() != budget {
            return Err(AllocationError::InvalidInput(format!(
                "Cardinality caps sum to {}, expected {}",
                self.total_cardinality(),
                budget
            )));
        }
        if (self.total_capital() - 1.0).abs() > SUM_TOLERANCE {
            return Err(AllocationError::InvalidInput(format!(
                "Capital fractions sum to {:.8}, expected 1",
                self.total_capital()
            )));
        }
        for (k, (share, &size)) in self.shares.iter().zip(sizes).enumerate() {
            if share.cardinality > size {
                return Err(AllocationError::InvalidInput(format!(
                    "Cluster {} cap {} exceeds its {} assets",
                    k, share.cardinality, size
                )));
            }
            if !(0.0..=1.0 + SUM_TOLERANCE).contains(&share.capital) {
                return Err(AllocationError::InvalidInput(format!(
                    "Cluster {} capital fraction {} outside [0, 1]",
                    k, share.capital
                )));
            }
            if share.cardinality == 0 && share.capital > SUM_TOLERANCE {
                return Err(AllocationError::InvalidInput(format!(
                    "Cluster {} holds no assets but receives capital {}",
                    k, share.capital
                )));
            }
        }
        Ok(())
    }
}

/// Full-length long-only portfolio weight vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioWeights {
    weights: Vec<f64>,
}

impl PortfolioWeights {
    pub fn new(weights: Vec<f64>) -> Self {
        Self { weights }
    }

    /// Scatter per-cluster sub-vectors into a full-length vector.
    ///
    /// Every asset index must be written exactly once.
    pub fn assemble(assets: usize, parts: &[(Vec<usize>, Vec<f64>)]) -> Result<Self> {
        let mut weights = vec![0.0; assets];
        let mut written = vec![false; assets];

        for (indices, values) in parts {
            if indices.len() != values.len() {
                return Err(AllocationError::InvalidInput(format!(
                    "Sub-vector has {} weights for {} assets",
                    values.len(),
                    indices.len()
                )));
            }
            for (&i, &w) in indices.iter().zip(values) {
                if i >= assets {
                    return Err(AllocationError::InvalidInput(format!(
                        "Asset index {} out of range for {} assets",
                        i, assets
                    )));
                }
                if written[i] {
                    return Err(AllocationError::InvalidInput(format!(
                        "Asset {} written by more than one cluster",
                        i
                    )));
                }
                written[i] = true;
                weights[i] = w;
            }
        }

        if let Some(gap) = written.iter().position(|w| !w) {
            return Err(AllocationError::InvalidInput(format!(
                "Asset {} not covered by any cluster",
                gap
            )));
        }

        Ok(Self { weights })
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Number of assets with weight above [`HOLDING_EPSILON`].
    pub fn holdings(&self) -> usize {
        self.weights.iter().filter(|&&w| w > HOLDING_EPSILON).count()
    }

    /// Indices of held assets.
    pub fn held_assets(&self) -> Vec<usize> {
        self.weights
            .iter()
            .enumerate()
            .filter(|(_, &w)| w > HOLDING_EPSILON)
            .map(|(i, _)| i)
            .collect()
    }

    /// Portfolio expected return μᵀw.
    pub fn expected_return(&self, mean: &[f64]) -> f64 {
        self.weights.iter().zip(mean).map(|(w, m)| w * m).sum()
    }

    /// Portfolio variance wᵀΣw.
    pub fn variance(&self, covariance: &[Vec<f64>]) -> f64 {
        let mut variance = 0.0;
        for (i, wi) in self.weights.iter().enumerate() {
            for (j, wj) in self.weights.iter().enumerate() {
                variance += wi * wj * covariance[i][j];
            }
        }
        variance
    }

    /// Check full investment, bounds and the cardinality budget.
    pub fn validate(&self, max_weight: f64, budget: usize) -> Result<()> {
        if (self.total() - 1.0).abs() > SUM_TOLERANCE {
            return Err(AllocationError::InvalidInput(format!(
                "Weights sum to {:.8}, expected 1",
                self.total()
            )));
        }
        if let Some(i) = self
            .weights
            .iter()
            .position(|&w| w < -SUM_TOLERANCE || w > max_weight + SUM_TOLERANCE)
        {
            return Err(AllocationError::InvalidInput(format!(
                "Weight {} of asset {} outside [0, {}]",
                self.weights[i], i, max_weight
            )));
        }
        if self.holdings() > budget {
            return Err(AllocationError::InvalidInput(format!(
                "{} assets held, budget is {}",
                self.holdings(),
                budget
            )));
        }
        Ok(())
    }
}
