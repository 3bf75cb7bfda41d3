//! Cardinal - cardinality-constrained portfolio allocation.
//!
//! # Overview
//!
//! Choosing a long-only mean-variance portfolio that holds at most Δ assets is
//! a mixed-integer quadratic program whose size grows with the universe.
//! Cardinal splits it along the correlation structure of the assets:
//!
//! 1. **Distance**: Pearson correlation τ and the distance D = 1 − τ.
//! 2. **Clustering**: agglomerative centroid linkage in distance space, cut
//!    at the largest gap between successive merge distances.
//! 3. **Allocation**: a pluggable policy splits Δ and the capital across the
//!    K clusters; each candidate is scored by the sum of the per-cluster
//!    optima.
//! 4. **Cluster solve**: every cluster's sparse mean-variance MIQP goes to a
//!    [`solver::MiqpSolver`] backend, and the sub-vectors are scattered back
//!    into one weight vector.
//!
//! # Quick Start
//!
//! ```no_run
//! use cardinal::data::{load_returns_csv, DataConfig};
//! use cardinal::pipeline::{CardinalityPipeline, PipelineConfig};
//! use cardinal::types::PortfolioParams;
//!
//! let returns = load_returns_csv("data/returns.csv", &DataConfig::default()).unwrap();
//! let config = PipelineConfig {
//!     params: PortfolioParams::new(5, 0.3, 1.0),
//!     ..Default::default()
//! };
//! let result = CardinalityPipeline::new(config).unwrap().run(&returns).unwrap();
//!
//! for (asset, weight) in result.holdings() {
//!     println!("{asset}: {:.2}%", weight * 100.0);
//! }
//! ```
//!
//! # Custom Allocation Policies
//!
//! Implement [`allocation::AllocationPolicy`] to control how the budget is
//! split:
//!
//! ```
//! use cardinal::allocation::AllocationPolicy;
//! use cardinal::error::Result;
//! use cardinal::types::{ClusterAllocation, ClusterShare, PortfolioParams};
//!
//! /// Everything goes to the largest cluster.
//! struct LargestCluster;
//!
//! impl AllocationPolicy for LargestCluster {
//!     fn name(&self) -> &str {
//!         "largest-cluster"
//!     }
//!
//!     fn propose(&self, sizes: &[usize], params: &PortfolioParams) -> Result<Vec<ClusterAllocation>> {
//!         let largest = (0..sizes.len()).max_by_key(|&k| (sizes[k], usize::MAX - k)).unwrap_or(0);
//!         let shares = (0..sizes.len())
//!             .map(|k| if k == largest { ClusterShare::new(params.budget, 1.0) } else { ClusterShare::empty() })
//!             .collect();
//!         Ok(vec![ClusterAllocation::new(shares)])
//!     }
//! }
//! ```
//!
//! # Modules
//!
//! - [`types`]: Return matrix, clusters, labels, allocations, weights
//! - [`distance`]: Correlation, distance and moment estimates
//! - [`clustering`]: Merge loop, dendrogram cut and labels
//! - [`solver`]: MIQP boundary and the clarabel-backed backend
//! - [`subproblem`]: Per-cluster MIQP formulation
//! - [`allocation`]: Allocation policies and the planner
//! - [`pipeline`]: End-to-end runs and objective curves
//! - [`config`]: TOML configuration file support
//! - [`data`]: CSV loading

pub mod allocation;
pub mod clustering;
pub mod config;
pub mod data;
pub mod distance;
pub mod error;
pub mod pipeline;
pub mod solver;
pub mod subproblem;
pub mod types;

pub use allocation::{AllocationPlanner, AllocationPolicy, ExhaustivePolicy, ProportionalPolicy};
pub use clustering::{Dendrogram, HierarchicalClustering};
pub use error::{AllocationError, PipelineStage, Result};
pub use pipeline::{CardinalityPipeline, PipelineConfig, PipelineResult};
pub use solver::{ClarabelMiqpSolver, MiqpSolver};
pub use types::{ClusterLabels, PortfolioParams, PortfolioWeights, ReturnMatrix};
