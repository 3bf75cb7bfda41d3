//! Configuration file support.
//!
//! A run is fully described by a TOML file so results can be reproduced.
//! Every section and key is optional; missing values take the defaults below.

use crate::allocation::{CapitalRule, PlannerConfig, PolicyKind};
use crate::clustering::ClusteringConfig;
use crate::data::{DataConfig, InputKind};
use crate::error::{AllocationError, Result};
use crate::pipeline::PipelineConfig;
use crate::solver::SolverSettings;
use crate::types::PortfolioParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete run configuration loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineFileConfig {
    #[serde(default)]
    pub portfolio: PortfolioSettings,
    #[serde(default)]
    pub clustering: ClusteringSettings,
    #[serde(default)]
    pub allocation: AllocationSettings,
    #[serde(default)]
    pub solver: SolverFileSettings,
    #[serde(default)]
    pub data: DataSettings,
}

/// Portfolio-level parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSettings {
    /// Global cardinality budget.
    #[serde(default = "default_budget")]
    pub budget: usize,
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
    #[serde(default = "default_risk_aversion")]
    pub risk_aversion: f64,
    /// Annualisation factor for μ and Σ; omit to use per-period moments.
    #[serde(default)]
    pub periods_per_year: Option<f64>,
    /// Also report the objective of the unclustered problem.
    #[serde(default)]
    pub compare_unclustered: bool,
}

fn default_budget() -> usize { 5 }
fn default_max_weight() -> f64 { 0.3 }
fn default_risk_aversion() -> f64 { 1.0 }

impl Default for PortfolioSettings {
    fn default() -> Self {
        Self {
            budget: 5,
            max_weight: 0.3,
            risk_aversion: 1.0,
            periods_per_year: None,
            compare_unclustered: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringSettings {
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
}

fn default_parallel_threshold() -> usize { 64 }

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            parallel_threshold: 64,
        }
    }
}

/// Allocation search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationSettings {
    /// "proportional" or "exhaustive".
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default)]
    pub require_every_cluster: bool,
    /// "cardinality" or "grid".
    #[serde(default = "default_capital_rule")]
    pub capital_rule: String,
    #[serde(default = "default_capital_steps")]
    pub capital_steps: usize,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_true")]
    pub parallel: bool,
}

fn default_policy() -> String { "proportional".to_string() }
fn default_capital_rule() -> String { "cardinality".to_string() }
fn default_capital_steps() -> usize { 10 }
fn default_max_candidates() -> usize { 20_000 }
fn default_true() -> bool { true }

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            policy: "proportional".to_string(),
            require_every_cluster: false,
            capital_rule: "cardinality".to_string(),
            capital_steps: 10,
            max_candidates: 20_000,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverFileSettings {
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
    #[serde(default = "default_time_limit")]
    pub time_limit_secs: f64,
    #[serde(default = "default_max_subproblems")]
    pub max_subproblems: usize,
}

fn default_max_iter() -> u32 { 200 }
fn default_time_limit() -> f64 { 30.0 }
fn default_max_subproblems() -> usize { 200_000 }

impl Default for SolverFileSettings {
    fn default() -> Self {
        Self {
            max_iter: 200,
            time_limit_secs: 30.0,
            max_subproblems: 200_000,
        }
    }
}

/// Input data settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// Path to the CSV file.
    pub path: Option<String>,
    #[serde(default)]
    pub input: InputKind,
    #[serde(default = "default_true")]
    pub has_headers: bool,
    #[serde(default = "default_true")]
    pub date_column: bool,
    /// Delimiter; detected from the file when absent.
    pub delimiter: Option<char>,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            path: None,
            input: InputKind::Returns,
            has_headers: true,
            date_column: true,
            delimiter: None,
        }
    }
}

impl PipelineFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: PipelineFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AllocationError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Convert to the runtime pipeline configuration.
    pub fn to_pipeline_config(&self) -> Result<PipelineConfig> {
        let policy = match self.allocation.policy.to_lowercase().as_str() {
            "proportional" => PolicyKind::Proportional,
            "exhaustive" => PolicyKind::Exhaustive,
            other => {
                return Err(AllocationError::ConfigError(format!(
                    "Unknown allocation policy: {}",
                    other
                )))
            }
        };
        let capital = match self.allocation.capital_rule.to_lowercase().as_str() {
            "cardinality" => CapitalRule::Cardinality,
            "grid" => CapitalRule::Grid {
                steps: self.allocation.capital_steps,
            },
            other => {
                return Err(AllocationError::ConfigError(format!(
                    "Unknown capital rule: {}",
                    other
                )))
            }
        };

        let params = PortfolioParams::new(
            self.portfolio.budget,
            self.portfolio.max_weight,
            self.portfolio.risk_aversion,
        );
        if params.budget == 0 {
            return Err(AllocationError::ConfigError(
                "portfolio.budget must be at least 1".to_string(),
            ));
        }
        if !(params.max_weight > 0.0 && params.max_weight <= 1.0) {
            return Err(AllocationError::ConfigError(format!(
                "portfolio.max_weight {} outside (0, 1]",
                params.max_weight
            )));
        }
        if !(params.risk_aversion > 0.0) {
            return Err(AllocationError::ConfigError(format!(
                "portfolio.risk_aversion {} must be positive",
                params.risk_aversion
            )));
        }

        let config = PipelineConfig {
            params,
            clustering: ClusteringConfig {
                parallel_threshold: self.clustering.parallel_threshold,
            },
            planner: PlannerConfig {
                policy,
                require_every_cluster: self.allocation.require_every_cluster,
                capital,
                max_candidates: self.allocation.max_candidates,
                parallel: self.allocation.parallel,
            },
            solver: SolverSettings {
                max_iter: self.solver.max_iter,
                time_limit_secs: self.solver.time_limit_secs,
                max_subproblems: self.solver.max_subproblems,
            },
            periods_per_year: self.portfolio.periods_per_year,
            compare_unclustered: self.portfolio.compare_unclustered,
        };
        config.validate()?;
        Ok(config)
    }

    /// CSV loader settings for the `[data]` section.
    pub fn data_config(&self) -> Result<DataConfig> {
        let delimiter = match self.data.delimiter {
            None => None,
            Some(c) if c.is_ascii() => Some(c as u8),
            Some(c) => {
                return Err(AllocationError::ConfigError(format!(
                    "data.delimiter must be a single ASCII character, got {:?}",
                    c
                )))
            }
        };
        Ok(DataConfig {
            has_headers: self.data.has_headers,
            delimiter,
            date_column: self.data.date_column,
            input: self.data.input,
            skip_invalid: false,
        })
    }

    /// Example configuration file content.
    pub fn example() -> String {
        r#"# cardinal configuration file

[portfolio]
budget = 5              # maximum number of held assets
max_weight = 0.3        # per-asset weight cap
risk_aversion = 1.0     # weight on expected return in the objective
# periods_per_year = 252  # annualise daily moments
compare_unclustered = false

[clustering]
parallel_threshold = 64

[allocation]
policy = "proportional"        # or "exhaustive"
require_every_cluster = false
capital_rule = "cardinality"   # or "grid" (exhaustive policy only)
capital_steps = 10
max_candidates = 20000
parallel = true

[solver]
max_iter = 200
time_limit_secs = 30.0
max_subproblems = 200000

[data]
path = "data/returns.csv"
input = "returns"       # or "prices"
has_headers = true
date_column = true
# delimiter = ","
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PipelineFileConfig::default();
        assert_eq!(config.portfolio.budget, 5);
        assert_eq!(config.allocation.policy, "proportional");
        assert!(config.to_pipeline_config().is_ok());
    }

    #[test]
    fn test_load_config() {
        let toml_content = r#"
[portfolio]
budget = 3
max_weight = 0.5
periods_per_year = 252

[allocation]
policy = "exhaustive"
capital_rule = "grid"
capital_steps = 4

[data]
path = "prices.csv"
input = "prices"
delimiter = ";"
"#;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", toml_content).unwrap();

        let config = PipelineFileConfig::load(file.path()).unwrap();
        assert_eq!(config.portfolio.budget, 3);
        assert_eq!(config.portfolio.risk_aversion, 1.0);
        assert_eq!(config.solver.max_subproblems, 200_000);

        let runtime = config.to_pipeline_config().unwrap();
        assert_eq!(runtime.params.max_weight, 0.5);
        assert_eq!(runtime.periods_per_year, Some(252.0));
        assert_eq!(runtime.planner.policy, PolicyKind::Exhaustive);
        assert_eq!(runtime.planner.capital, CapitalRule::Grid { steps: 4 });

        let data = config.data_config().unwrap();
        assert_eq!(data.input, InputKind::Prices);
        assert_eq!(data.delimiter, Some(b';'));
    }

    #[test]
    fn test_rejects_unknown_policy_and_bad_ranges() {
        let mut config = PipelineFileConfig::default();
        config.allocation.policy = "greedy".to_string();
        assert!(matches!(
            config.to_pipeline_config(),
            Err(AllocationError::ConfigError(_))
        ));

        let mut config = PipelineFileConfig::default();
        config.portfolio.max_weight = 1.5;
        assert!(config.to_pipeline_config().is_err());

        let mut config = PipelineFileConfig::default();
        config.solver.time_limit_secs = 0.0;
        assert!(config.to_pipeline_config().is_err());
    }

    #[test]
    fn test_save_config() {
        let mut config = PipelineFileConfig::default();
        config.portfolio.budget = 7;
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded = PipelineFileConfig::load(file.path()).unwrap();
        assert_eq!(loaded.portfolio.budget, 7);
    }

    #[test]
    fn test_example_config_parses() {
        let example = PipelineFileConfig::example();
        let config: PipelineFileConfig = toml::from_str(&example).unwrap();
        assert_eq!(config.data.path.as_deref(), Some("data/returns.csv"));
        assert!(config.to_pipeline_config().is_ok());
    }

    #[test]
    fn test_malformed_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[portfolio\nbudget = ").unwrap();
        assert!(matches!(
            PipelineFileConfig::load(file.path()),
            Err(AllocationError::TomlError(_))
        ));
    }
}
