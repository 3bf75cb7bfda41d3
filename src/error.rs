//! Error types for the allocation pipeline.

use std::fmt;
use thiserror::Error;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Correlation / distance / estimate computation.
    Correlation,
    /// Agglomerative clustering and dendrogram cut.
    Clustering,
    /// Outer search over cardinality and capital splits.
    Allocation,
    /// Per-cluster MIQP solve.
    ClusterSolve,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Correlation => "correlation",
            PipelineStage::Clustering => "clustering",
            PipelineStage::Allocation => "allocation",
            PipelineStage::ClusterSolve => "cluster solve",
        };
        f.write_str(name)
    }
}

/// Main error type for the allocation pipeline.
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("Insufficient data: need at least {required} observations, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("Degenerate clustering: need at least 2 assets, have {assets}")]
    DegenerateClustering { assets: usize },

    #[error("Infeasible allocation: {0}")]
    InfeasibleAllocation(String),

    #[error("Infeasible problem for cluster {cluster}: {reason}")]
    InfeasibleClusterProblem { cluster: usize, reason: String },

    #[error("Solver error{}: {message}", cluster_suffix(.cluster))]
    Solver {
        cluster: Option<usize>,
        message: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: PipelineStage,
        #[source]
        source: Box<AllocationError>,
    },
}

impl AllocationError {
    /// Build a solver error without cluster context.
    pub fn solver(message: impl Into<String>) -> Self {
        AllocationError::Solver {
            cluster: None,
            message: message.into(),
        }
    }

    /// Attach a cluster id to a solver error raised by a backend.
    ///
    /// Errors that already carry a cluster id keep it.
    pub fn with_cluster(self, id: usize) -> Self {
        match self {
            AllocationError::Solver {
                cluster: None,
                message,
            } => AllocationError::Solver {
                cluster: Some(id),
                message,
            },
            other => other,
        }
    }

    /// Wrap the error with the pipeline stage it surfaced from.
    ///
    /// An error that already carries stage context is returned unchanged.
    pub fn at(self, stage: PipelineStage) -> Self {
        match self {
            AllocationError::Stage { .. } => self,
            other => AllocationError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Stage the error was raised in, if known.
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            AllocationError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The underlying error with stage context stripped.
    pub fn root(&self) -> &AllocationError {
        match self {
            AllocationError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short remediation hint for command-line output.
    pub fn hint(&self) -> Option<&'static str> {
        match self.root() {
            AllocationError::InsufficientData { .. } => {
                Some("Provide at least two return observations per asset.")
            }
            AllocationError::DegenerateClustering { .. } => {
                Some("Clustering needs two or more assets in the universe.")
            }
            AllocationError::InfeasibleAllocation(_) => Some(
                "Raise the cardinality budget, allow empty clusters, or raise max_weight.",
            ),
            AllocationError::InfeasibleClusterProblem { .. } => {
                Some("Each cluster needs cardinality * max_weight >= its capital fraction.")
            }
            AllocationError::Solver { .. } => {
                Some("Increase solver.time_limit_secs or solver.max_subproblems.")
            }
            AllocationError::TomlError(_) | AllocationError::ConfigError(_) => {
                Some("Run `cardinal init` to generate a valid example configuration.")
            }
            _ => None,
        }
    }
}

fn cluster_suffix(cluster: &Option<usize>) -> String {
    cluster.map(|c| format!(" (cluster {})", c)).unwrap_or_default()
}

/// Result type alias for allocation operations.
pub type Result<T> = std::result::Result<T, AllocationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wrapping_is_idempotent() {
        let err = AllocationError::DegenerateClustering { assets: 1 }
            .at(PipelineStage::Clustering)
            .at(PipelineStage::Allocation);

        assert_eq!(err.stage(), Some(PipelineStage::Clustering));
        assert!(matches!(
            err.root(),
            AllocationError::DegenerateClustering { assets: 1 }
        ));
        assert!(err.to_string().starts_with("clustering stage failed"));
    }

    #[test]
    fn test_with_cluster_attaches_id() {
        let err = AllocationError::solver("timed out").with_cluster(3);
        assert!(matches!(
            err,
            AllocationError::Solver {
                cluster: Some(3),
                ..
            }
        ));
        assert_eq!(err.to_string(), "Solver error (cluster 3): timed out");

        let err = AllocationError::Solver {
            cluster: Some(1),
            message: "x".to_string(),
        }
        .with_cluster(7);
        assert!(matches!(
            err,
            AllocationError::Solver {
                cluster: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn test_hint_looks_through_stage() {
        let err = AllocationError::InsufficientData {
            required: 2,
            available: 1,
        }
        .at(PipelineStage::Correlation);
        assert!(err.hint().is_some());
        assert!(AllocationError::InvalidInput("x".into()).hint().is_none());
    }
}
