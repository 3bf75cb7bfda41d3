//! Integration tests for the allocation pipeline.

use cardinal::allocation::{
    AllocationPlanner, AllocationPolicy, CapitalRule, ExhaustivePolicy, PlannerConfig,
    PolicyKind, ProportionalPolicy,
};
use cardinal::clustering::HierarchicalClustering;
use cardinal::config::PipelineFileConfig;
use cardinal::data::{load_returns_csv, DataConfig};
use cardinal::distance::{correlation_matrix, distance_matrix, Estimates};
use cardinal::error::{AllocationError, PipelineStage, Result};
use cardinal::pipeline::{CardinalityPipeline, PipelineConfig};
use cardinal::solver::{ClarabelMiqpSolver, MiqpOutcome, MiqpProblem, MiqpSolver};
use cardinal::subproblem::ClusterProblem;
use cardinal::types::{
    ClusterAllocation, ClusterLabels, ClusterShare, PortfolioParams, ReturnMatrix,
};
use std::io::Write;
use tempfile::NamedTempFile;

/// Deterministic factor path; different seeds give near-uncorrelated paths.
fn factor(seed: usize, t: usize) -> f64 {
    let s = seed as f64;
    let t = t as f64;
    ((t * (0.37 + 0.29 * s)).sin() + 0.5 * (t * (1.13 + 0.41 * s)).cos()) * 0.01
}

/// Returns for `blocks` groups of `per_block` assets driven by one factor each.
fn block_returns(blocks: usize, per_block: usize, periods: usize, noise: f64) -> ReturnMatrix {
    let mut columns = Vec::new();
    let mut names = Vec::new();
    for b in 0..blocks {
        for j in 0..per_block {
            let i = b * per_block + j;
            let beta = 0.8 + 0.1 * j as f64;
            let drift = 0.0002 * (i as f64 + 1.0);
            let column = (0..periods)
                .map(|t| {
                    let idio = ((t * (i + 3)) as f64 * 0.917).sin() * noise;
                    beta * factor(b, t) + drift + idio
                })
                .collect();
            columns.push(column);
            names.push(format!("B{}A{}", b, j));
        }
    }
    ReturnMatrix::from_columns(names, &columns).unwrap()
}

fn pipeline(budget: usize, max_weight: f64) -> CardinalityPipeline {
    CardinalityPipeline::new(PipelineConfig {
        params: PortfolioParams::new(budget, max_weight, 1.0),
        ..Default::default()
    })
    .unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_two_correlated_pairs_form_two_clusters() {
    let returns = block_returns(2, 2, 60, 0.0005);
    let corr = correlation_matrix(&returns).unwrap();
    assert!(corr[0][1] > 0.95);
    assert!(corr[2][3] > 0.95);

    let dendrogram = HierarchicalClustering::default()
        .cluster(&distance_matrix(&returns).unwrap())
        .unwrap();
    assert_eq!(dendrogram.distances.len(), 3);
    assert_eq!(dendrogram.labels.cluster_count(), 2);
    assert_eq!(dendrogram.labels.as_slice(), &[0, 0, 1, 1]);
}

#[test]
fn test_single_slot_single_cluster_picks_one_asset() {
    // objective at w = 1 is σ² − γμ: 0.04−0.10, 0.01−0.12, 0.09−0.15
    let estimates = Estimates::new(
        vec![0.10, 0.12, 0.15],
        vec![
            vec![0.04, 0.0, 0.0],
            vec![0.0, 0.01, 0.0],
            vec![0.0, 0.0, 0.09],
        ],
    )
    .unwrap();
    let labels = ClusterLabels::single(3).unwrap();
    let planner = AllocationPlanner::new(
        Box::new(ProportionalPolicy::default()),
        Box::new(ClarabelMiqpSolver::default()),
    );

    let plan = planner
        .plan(&labels, &estimates, &PortfolioParams::new(1, 1.0, 1.0))
        .unwrap();
    let w = plan.weights.as_slice();
    assert_eq!(plan.weights.holdings(), 1);
    assert!((w[1] - 1.0).abs() < 1e-9);
    assert_eq!(w[0], 0.0);
    assert_eq!(w[2], 0.0);

    // one slot capped below 1 cannot be fully invested
    let err = planner
        .plan(&labels, &estimates, &PortfolioParams::new(1, 0.5, 1.0))
        .unwrap_err();
    assert!(matches!(err, AllocationError::InfeasibleAllocation(_)));
}

#[test]
fn test_capacity_shortfall_raises_infeasible_cluster() {
    let estimates = Estimates::new(vec![0.1, 0.1], vec![vec![0.04, 0.0], vec![0.0, 0.04]]).unwrap();
    let problem = ClusterProblem::new(
        4,
        vec![0, 1],
        &estimates,
        ClusterShare::new(1, 0.7),
        &PortfolioParams::new(1, 0.5, 1.0),
    );
    let err = problem.solve(&ClarabelMiqpSolver::default()).unwrap_err();
    assert!(matches!(
        err,
        AllocationError::InfeasibleClusterProblem { cluster: 4, .. }
    ));
}

#[test]
fn test_single_asset_is_degenerate() {
    let returns = ReturnMatrix::new(vec![vec![0.01], vec![-0.02], vec![0.005]]).unwrap();
    let err = pipeline(1, 1.0).run(&returns).unwrap_err();
    assert_eq!(err.stage(), Some(PipelineStage::Clustering));
    assert!(matches!(
        err.root(),
        AllocationError::DegenerateClustering { assets: 1 }
    ));
}

// ============================================================================
// End-to-end invariants
// ============================================================================

#[test]
fn test_weights_satisfy_portfolio_constraints() {
    let returns = block_returns(3, 3, 120, 0.002);
    for budget in [3, 4, 6] {
        let result = pipeline(budget, 0.4).run(&returns).unwrap();
        let w = &result.weights;
        assert!((w.total() - 1.0).abs() < 1e-6, "budget {}: sum {}", budget, w.total());
        assert!(w.as_slice().iter().all(|&x| (-1e-9..=0.4 + 1e-6).contains(&x)));
        assert!(w.holdings() <= budget);
        assert_eq!(result.allocation.total_cardinality(), budget);
        assert!((result.allocation.total_capital() - 1.0).abs() < 1e-6);
        assert!(result.labels().cluster_count() >= 2);
    }
}

#[test]
fn test_rerun_is_deterministic() {
    let returns = block_returns(3, 3, 90, 0.002);
    let p = pipeline(4, 0.4);
    let a = p.run(&returns).unwrap();
    let b = p.run(&returns).unwrap();
    assert_eq!(a.labels(), b.labels());
    assert_eq!(a.dendrogram.distances, b.dendrogram.distances);
    assert_eq!(a.allocation, b.allocation);
    for (x, y) in a.weights.as_slice().iter().zip(b.weights.as_slice()) {
        assert!((x - y).abs() < 1e-9);
    }
}

#[test]
fn test_exhaustive_policy_improves_on_proportional() {
    let returns = block_returns(3, 3, 90, 0.002);
    let proportional = pipeline(4, 0.4).run(&returns).unwrap();
    let exhaustive = CardinalityPipeline::new(PipelineConfig {
        params: PortfolioParams::new(4, 0.4, 1.0),
        planner: PlannerConfig {
            policy: PolicyKind::Exhaustive,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap()
    .run(&returns)
    .unwrap();

    assert!(exhaustive.candidates_evaluated > 1);
    assert!(exhaustive.objective <= proportional.objective + 1e-9);
}

#[test]
fn test_objective_curve_against_unclustered() {
    let returns = block_returns(3, 3, 90, 0.002);
    let p = CardinalityPipeline::new(PipelineConfig {
        params: PortfolioParams::new(3, 0.4, 1.0),
        compare_unclustered: true,
        ..Default::default()
    })
    .unwrap();

    let curve = p.objective_curve(&returns, &[2, 3, 4, 5]).unwrap();
    // 2 slots at 0.4 cannot reach full investment
    assert_eq!(curve.first().map(|c| c.budget), Some(3));
    assert_eq!(curve.len(), 3);
    for point in &curve {
        let unclustered = point.unclustered.unwrap();
        assert!(unclustered <= point.clustered + 1e-7);
    }
}

#[test]
fn test_annualisation_scales_objective_inputs() {
    let returns = block_returns(2, 2, 60, 0.001);
    let raw = pipeline(2, 0.6).estimates(&returns).unwrap();
    let annual = CardinalityPipeline::new(PipelineConfig {
        params: PortfolioParams::new(2, 0.6, 1.0),
        periods_per_year: Some(252.0),
        ..Default::default()
    })
    .unwrap()
    .estimates(&returns)
    .unwrap();
    assert!((annual.mean[0] - 252.0 * raw.mean[0]).abs() < 1e-12);
    assert!((annual.covariance[1][1] - 252.0 * raw.covariance[1][1]).abs() < 1e-12);
}

// ============================================================================
// Pluggable components
// ============================================================================

/// Backend that always fails.
struct BrokenSolver;

impl MiqpSolver for BrokenSolver {
    fn name(&self) -> &str {
        "broken"
    }

    fn solve(&self, _problem: &MiqpProblem) -> Result<MiqpOutcome> {
        Err(AllocationError::solver("numerical failure"))
    }
}

/// Proposes one split that no cluster can honour.
struct OverloadFirstCluster;

impl AllocationPolicy for OverloadFirstCluster {
    fn name(&self) -> &str {
        "overload"
    }

    fn propose(&self, sizes: &[usize], params: &PortfolioParams) -> Result<Vec<ClusterAllocation>> {
        let mut shares = vec![ClusterShare::empty(); sizes.len()];
        shares[0] = ClusterShare::new(1, 0.9);
        shares[1] = ClusterShare::new(params.budget - 1, 0.1);
        Ok(vec![ClusterAllocation::new(shares)])
    }
}

#[test]
fn test_solver_failure_propagates_with_cluster_id() {
    let returns = block_returns(2, 2, 60, 0.0005);
    let p = CardinalityPipeline::with_components(
        PipelineConfig {
            params: PortfolioParams::new(2, 0.6, 1.0),
            ..Default::default()
        },
        Box::new(ProportionalPolicy::default()),
        Box::new(BrokenSolver),
    )
    .unwrap();

    let err = p.run(&returns).unwrap_err();
    assert_eq!(err.stage(), Some(PipelineStage::ClusterSolve));
    assert!(matches!(
        err.root(),
        AllocationError::Solver {
            cluster: Some(0),
            ..
        }
    ));
}

/// Two candidates, both asking the first cluster for more than one slot can hold.
struct OverloadTwice;

impl AllocationPolicy for OverloadTwice {
    fn name(&self) -> &str {
        "overload-twice"
    }

    fn propose(&self, sizes: &[usize], params: &PortfolioParams) -> Result<Vec<ClusterAllocation>> {
        let mut candidates = OverloadFirstCluster.propose(sizes, params)?;
        let mut shares = vec![ClusterShare::empty(); sizes.len()];
        shares[0] = ClusterShare::new(1, 0.8);
        shares[1] = ClusterShare::new(params.budget - 1, 0.2);
        candidates.push(ClusterAllocation::new(shares));
        Ok(candidates)
    }
}

#[test]
fn test_single_infeasible_candidate_keeps_cluster_id() {
    let returns = block_returns(2, 2, 60, 0.0005);
    let p = CardinalityPipeline::with_components(
        PipelineConfig {
            params: PortfolioParams::new(2, 0.5, 1.0),
            ..Default::default()
        },
        Box::new(OverloadFirstCluster),
        Box::new(ClarabelMiqpSolver::default()),
    )
    .unwrap();

    let err = p.run(&returns).unwrap_err();
    assert_eq!(err.stage(), Some(PipelineStage::Allocation));
    assert!(matches!(
        err.root(),
        AllocationError::InfeasibleClusterProblem { cluster: 0, .. }
    ));
}

#[test]
fn test_all_candidates_infeasible() {
    let returns = block_returns(2, 2, 60, 0.0005);
    let p = CardinalityPipeline::with_components(
        PipelineConfig {
            params: PortfolioParams::new(2, 0.5, 1.0),
            ..Default::default()
        },
        Box::new(OverloadTwice),
        Box::new(ClarabelMiqpSolver::default()),
    )
    .unwrap();

    let err = p.run(&returns).unwrap_err();
    assert_eq!(err.stage(), Some(PipelineStage::Allocation));
    assert!(matches!(err.root(), AllocationError::InfeasibleAllocation(_)));
}

#[test]
fn test_require_every_cluster_with_small_budget() {
    // one slot cannot cover two or more clusters
    let returns = block_returns(3, 2, 60, 0.0005);
    let p = CardinalityPipeline::new(PipelineConfig {
        params: PortfolioParams::new(1, 1.0, 1.0),
        planner: PlannerConfig {
            require_every_cluster: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();

    let err = p.run(&returns).unwrap_err();
    assert!(matches!(err.root(), AllocationError::InfeasibleAllocation(_)));
}

#[test]
fn test_grid_policy_direct() {
    let policy = ExhaustivePolicy {
        capital: CapitalRule::Grid { steps: 4 },
        ..Default::default()
    };
    let candidates = policy
        .propose(&[2, 2], &PortfolioParams::new(2, 0.5, 1.0))
        .unwrap();
    // every proposed split must fit within 0.5 per held slot
    for c in &candidates {
        assert!(c.validate(2, &[2, 2]).is_ok());
        for s in &c.shares {
            assert!(s.capital <= s.cardinality as f64 * 0.5 + 1e-12);
        }
    }
    assert!(!candidates.is_empty());
}

// ============================================================================
// Files
// ============================================================================

#[test]
fn test_csv_and_config_round_trip() {
    let returns = block_returns(2, 2, 40, 0.0005);
    let mut csv = NamedTempFile::with_suffix(".csv").unwrap();
    writeln!(csv, "date,{}", returns.assets().join(",")).unwrap();
    for (t, row) in returns.rows().iter().enumerate() {
        let values: Vec<String> = row.iter().map(|v| format!("{:.17e}", v)).collect();
        writeln!(csv, "{},{}", t, values.join(",")).unwrap();
    }
    csv.flush().unwrap();

    let loaded = load_returns_csv(csv.path(), &DataConfig::default()).unwrap();
    assert_eq!(loaded.assets(), returns.assets());
    assert_eq!(loaded.observations(), 40);

    let mut file_config = PipelineFileConfig::default();
    file_config.portfolio.budget = 2;
    file_config.portfolio.max_weight = 0.6;
    file_config.data.path = Some(csv.path().display().to_string());
    let toml_file = NamedTempFile::new().unwrap();
    file_config.save(toml_file.path()).unwrap();

    let reloaded = PipelineFileConfig::load(toml_file.path()).unwrap();
    let config = reloaded.to_pipeline_config().unwrap();
    let data = load_returns_csv(reloaded.data.path.as_deref().unwrap(), &reloaded.data_config().unwrap()).unwrap();
    let result = CardinalityPipeline::new(config).unwrap().run(&data).unwrap();
    assert_eq!(result.labels().cluster_count(), 2);
    assert!(result.weights.holdings() <= 2);

    let json = serde_json::to_string(&result).unwrap();
    assert!(json.contains("\"dendrogram\""));
}
