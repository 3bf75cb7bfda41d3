//! Correlation, distance and moment estimates from a return matrix.
//!
//! All functions here are pure: the same [`ReturnMatrix`] always yields the
//! same matrices, and the only failure mode is malformed input.

use crate::error::{AllocationError, Result};
use crate::types::ReturnMatrix;
use serde::{Deserialize, Serialize};

/// Minimum number of observations needed for a correlation estimate.
pub const MIN_OBSERVATIONS: usize = 2;

/// Columns with a standard deviation below this are treated as constant.
const CONSTANT_STD: f64 = 1e-12;

fn require_observations(returns: &ReturnMatrix) -> Result<()> {
    if returns.observations() < MIN_OBSERVATIONS {
        return Err(AllocationError::InsufficientData {
            required: MIN_OBSERVATIONS,
            available: returns.observations(),
        });
    }
    Ok(())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Pearson correlation matrix τ (N×N, symmetric, unit diagonal).
///
/// A constant column has no defined correlation; it is reported as
/// uncorrelated (0) with every other asset.
pub fn correlation_matrix(returns: &ReturnMatrix) -> Result<Vec<Vec<f64>>> {
    require_observations(returns)?;

    let columns = returns.columns();
    let n = columns.len();

    let centered: Vec<Vec<f64>> = columns
        .iter()
        .map(|c| {
            let m = mean(c);
            c.iter().map(|r| r - m).collect()
        })
        .collect();
    let norms: Vec<f64> = centered
        .iter()
        .map(|c| c.iter().map(|x| x * x).sum::<f64>().sqrt())
        .collect();

    let mut corr = vec![vec![0.0; n]; n];
    for i in 0..n {
        corr[i][i] = 1.0;
        for j in (i + 1)..n {
            let value = if norms[i] > CONSTANT_STD && norms[j] > CONSTANT_STD {
                let dot: f64 = centered[i]
                    .iter()
                    .zip(&centered[j])
                    .map(|(a, b)| a * b)
                    .sum();
                (dot / (norms[i] * norms[j])).clamp(-1.0, 1.0)
            } else {
                0.0
            };
            corr[i][j] = value;
            corr[j][i] = value;
        }
    }

    Ok(corr)
}

/// Correlation distance D = 1 − τ (values in [0, 2], zero diagonal).
pub fn distance_from_correlation(corr: &[Vec<f64>]) -> Vec<Vec<f64>> {
    corr.iter()
        .enumerate()
        .map(|(i, row)| {
            row.iter()
                .enumerate()
                .map(|(j, c)| if i == j { 0.0 } else { 1.0 - c })
                .collect()
        })
        .collect()
}

/// Correlation distance matrix computed directly from returns.
pub fn distance_matrix(returns: &ReturnMatrix) -> Result<Vec<Vec<f64>>> {
    let corr = correlation_matrix(returns)?;
    Ok(distance_from_correlation(&corr))
}

/// Sample moments of a return matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimates {
    /// Mean return per asset (μ).
    pub mean: Vec<f64>,
    /// Sample covariance matrix (Σ), T−1 denominator.
    pub covariance: Vec<Vec<f64>>,
}

impl Estimates {
    /// Estimate mean returns and sample covariance.
    pub fn from_returns(returns: &ReturnMatrix) -> Result<Self> {
        require_observations(returns)?;

        let columns = returns.columns();
        let n = columns.len();
        let t = returns.observations() as f64;
        let means: Vec<f64> = columns.iter().map(|c| mean(c)).collect();

        let mut covariance = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i..n {
                let cov = columns[i]
                    .iter()
                    .zip(&columns[j])
                    .map(|(ri, rj)| (ri - means[i]) * (rj - means[j]))
                    .sum::<f64>()
                    / (t - 1.0);
                covariance[i][j] = cov;
                covariance[j][i] = cov;
            }
        }

        Ok(Self {
            mean: means,
            covariance,
        })
    }

    /// Build estimates from precomputed moments.
    pub fn new(mean: Vec<f64>, covariance: Vec<Vec<f64>>) -> Result<Self> {
        let n = mean.len();
        if covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
            return Err(AllocationError::InvalidInput(format!(
                "Covariance matrix must be {}x{} to match the mean vector",
                n, n
            )));
        }
        Ok(Self { mean, covariance })
    }

    /// Scale per-period moments to an annual horizon.
    pub fn annualized(mut self, periods_per_year: f64) -> Self {
        for m in &mut self.mean {
            *m *= periods_per_year;
        }
        for row in &mut self.covariance {
            for c in row.iter_mut() {
                *c *= periods_per_year;
            }
        }
        self
    }

    pub fn asset_count(&self) -> usize {
        self.mean.len()
    }

    /// Mean sub-vector for the given assets.
    pub fn sub_mean(&self, assets: &[usize]) -> Vec<f64> {
        assets.iter().map(|&i| self.mean[i]).collect()
    }

    /// Covariance sub-matrix for the given assets.
    pub fn sub_covariance(&self, assets: &[usize]) -> Vec<Vec<f64>> {
        assets
            .iter()
            .map(|&i| assets.iter().map(|&j| self.covariance[i][j]).collect())
            .collect()
    }
}
