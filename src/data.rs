//! Loading return matrices from CSV files.
//!
//! The expected layout is one row per period and one column per asset, with
//! asset names in the header and an optional leading date column:
//!
//! ```text
//! date,AAPL,MSFT,XOM
//! 2024-01-02,0.0041,-0.0012,0.0100
//! 2024-01-03,-0.0075,0.0031,0.0022
//! ```
//!
//! Dates are carried through untouched; rows are used in file order.

use crate::error::{AllocationError, Result};
use crate::types::ReturnMatrix;
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

/// What the numeric columns contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Per-period simple returns.
    #[default]
    Returns,
    /// Price levels, converted to simple returns on load.
    Prices,
}

/// Configuration for CSV loading.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Whether the first row holds asset names.
    pub has_headers: bool,
    /// Delimiter byte. `None` detects it from the first lines.
    pub delimiter: Option<u8>,
    /// Whether the first column is a date/index column to skip.
    pub date_column: bool,
    pub input: InputKind,
    /// Drop unparseable rows instead of failing.
    pub skip_invalid: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            has_headers: true,
            delimiter: None,
            date_column: true,
            input: InputKind::Returns,
            skip_invalid: false,
        }
    }
}

/// Pick the delimiter giving the most consistent multi-column split.
fn detect_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path)?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .take(5)
        .filter_map(|l| l.ok())
        .filter(|l| !l.trim().is_empty())
        .collect();

    let mut best = (b',', 0);
    for delim in [b',', b'\t', b';', b'|'] {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.bytes().filter(|&b| b == delim).count() + 1)
            .collect();
        let Some(&first) = counts.first() else {
            continue;
        };
        if first >= 2 && counts.iter().all(|&c| c == first) && first > best.1 {
            best = (delim, first);
        }
    }

    debug!("Detected delimiter {:?} ({} fields)", best.0 as char, best.1);
    Ok(best.0)
}

/// Convert price rows to simple returns `p_t / p_{t-1} - 1`.
///
/// The result has one row fewer than the input.
pub fn prices_to_returns(prices: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    prices
        .windows(2)
        .enumerate()
        .map(|(t, pair)| {
            pair[0]
                .iter()
                .zip(&pair[1])
                .enumerate()
                .map(|(j, (&prev, &next))| {
                    if prev <= 0.0 {
                        Err(AllocationError::InvalidInput(format!(
                            "Non-positive price {} at row {}, column {}",
                            prev, t, j
                        )))
                    } else {
                        Ok(next / prev - 1.0)
                    }
                })
                .collect::<Result<Vec<f64>>>()
        })
        .collect()
}

/// Load a return matrix from a CSV file.
pub fn load_returns_csv(path: impl AsRef<Path>, config: &DataConfig) -> Result<ReturnMatrix> {
    let path = path.as_ref();
    info!("Loading returns from: {}", path.display());

    let delimiter = match config.delimiter {
        Some(d) => d,
        None => detect_delimiter(path)?,
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(config.has_headers)
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let skip = usize::from(config.date_column);
    let mut assets: Vec<String> = if config.has_headers {
        reader.headers()?.iter().skip(skip).map(str::to_string).collect()
    } else {
        Vec::new()
    };

    let mut rows = Vec::new();
    let mut skipped = 0;
    for (row_num, result) in reader.records().enumerate() {
        let record = result?;
        let parsed: std::result::Result<Vec<f64>, _> = record
            .iter()
            .skip(skip)
            .map(|field| field.parse::<f64>())
            .collect();

        match parsed {
            Ok(values) if values.iter().all(|v| v.is_finite()) => rows.push(values),
            Ok(_) | Err(_) if config.skip_invalid => {
                debug!("Skipping row {}: unparseable or non-finite value", row_num + 1);
                skipped += 1;
            }
            Ok(_) => {
                return Err(AllocationError::InvalidInput(format!(
                    "Non-finite value in row {}",
                    row_num + 1
                )))
            }
            Err(e) => {
                return Err(AllocationError::InvalidInput(format!(
                    "Row {}: {}",
                    row_num + 1,
                    e
                )))
            }
        }
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows", skipped);
    }

    if assets.is_empty() {
        let n = rows.first().map(|r| r.len()).unwrap_or(0);
        assets = (0..n).map(|i| format!("A{}", i)).collect();
    }

    let rows = match config.input {
        InputKind::Returns => rows,
        InputKind::Prices => prices_to_returns(&rows)?,
    };

    info!("Loaded {} periods for {} assets", rows.len(), assets.len());
    ReturnMatrix::with_assets(assets, rows)
}
