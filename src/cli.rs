//! Command-line interface for the allocation pipeline.

use cardinal::allocation::{CapitalRule, PlannerConfig, PolicyKind};
use cardinal::clustering::Dendrogram;
use cardinal::config::PipelineFileConfig;
use cardinal::data::{load_returns_csv, DataConfig, InputKind};
use cardinal::error::{AllocationError, Result};
use cardinal::pipeline::{CardinalityPipeline, CurvePoint, PipelineConfig, PipelineResult};
use cardinal::types::{PortfolioParams, ReturnMatrix};

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Cardinal - cardinality-constrained portfolios via asset clustering.
#[derive(Parser)]
#[command(name = "cardinal")]
#[command(version)]
#[command(about = "Cluster assets, split a cardinality budget across clusters, and solve each cluster's MIQP")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline on a returns file
    Run {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        portfolio: PortfolioArgs,

        /// Maximum number of held assets
        #[arg(short, long, default_value = "5")]
        budget: usize,

        /// Also solve the unclustered problem for comparison
        #[arg(long)]
        compare: bool,
    },

    /// Cluster the assets and print the dendrogram cut
    Cluster {
        #[command(flatten)]
        input: InputArgs,
    },

    /// Objective value for a range of cardinality budgets
    Curve {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        portfolio: PortfolioArgs,

        /// Smallest budget
        #[arg(long, default_value = "1")]
        from: usize,

        /// Largest budget (defaults to the number of assets)
        #[arg(long)]
        to: Option<usize>,

        /// Also solve the unclustered problem at every budget
        #[arg(long)]
        compare: bool,
    },

    /// Create an example configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "cardinal.toml")]
        output: PathBuf,
    },

    /// Run from a configuration file
    RunConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(clap::Args)]
pub struct InputArgs {
    /// Path to CSV file (one column per asset)
    #[arg(short, long)]
    pub data: PathBuf,

    /// The file holds prices instead of returns
    #[arg(long)]
    pub prices: bool,

    /// The first column is an asset, not a date
    #[arg(long)]
    pub no_date_column: bool,
}

#[derive(clap::Args)]
pub struct PortfolioArgs {
    /// Per-asset weight cap
    #[arg(short = 'w', long, default_value = "0.3")]
    pub max_weight: f64,

    /// Risk aversion applied to expected returns
    #[arg(short = 'g', long, default_value = "1.0")]
    pub risk_aversion: f64,

    /// Annualise moments with this many periods per year
    #[arg(long)]
    pub periods_per_year: Option<f64>,

    /// Allocation policy
    #[arg(short, long, value_enum, default_value = "proportional")]
    pub policy: PolicyArg,

    /// Give every cluster at least one slot
    #[arg(long)]
    pub require_every_cluster: bool,

    /// Enumerate capital splits on a grid with this many steps (exhaustive policy)
    #[arg(long)]
    pub capital_steps: Option<usize>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Slots proportional to cluster size
    Proportional,
    /// Every split of the budget
    Exhaustive,
}

impl InputArgs {
    fn load(&self) -> Result<ReturnMatrix> {
        let config = DataConfig {
            date_column: !self.no_date_column,
            input: if self.prices {
                InputKind::Prices
            } else {
                InputKind::Returns
            },
            ..Default::default()
        };
        load_returns_csv(&self.data, &config)
    }
}

impl PortfolioArgs {
    fn pipeline_config(&self, budget: usize, compare: bool) -> PipelineConfig {
        PipelineConfig {
            params: PortfolioParams::new(budget, self.max_weight, self.risk_aversion),
            planner: PlannerConfig {
                policy: match self.policy {
                    PolicyArg::Proportional => PolicyKind::Proportional,
                    PolicyArg::Exhaustive => PolicyKind::Exhaustive,
                },
                require_every_cluster: self.require_every_cluster,
                capital: match self.capital_steps {
                    Some(steps) => CapitalRule::Grid { steps },
                    None => CapitalRule::Cardinality,
                },
                ..Default::default()
            },
            periods_per_year: self.periods_per_year,
            compare_unclustered: compare,
            ..Default::default()
        }
    }
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();

        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("Warning: a tracing subscriber was already installed");
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Run {
            input,
            portfolio,
            budget,
            compare,
        } => {
            let returns = input.load()?;
            let pipeline = CardinalityPipeline::new(portfolio.pipeline_config(*budget, *compare))?;
            let result = pipeline.run(&returns)?;
            print_result(&result, cli.output)
        }

        Commands::Cluster { input } => {
            let returns = input.load()?;
            let pipeline = CardinalityPipeline::new(PipelineConfig::default())?;
            let dendrogram = pipeline.cluster(&returns)?;
            print_dendrogram(&dendrogram, returns.assets(), cli.output)
        }

        Commands::Curve {
            input,
            portfolio,
            from,
            to,
            compare,
        } => {
            let returns = input.load()?;
            let to = to.unwrap_or(returns.asset_count()).min(returns.asset_count());
            if *from == 0 || *from > to {
                return Err(AllocationError::InvalidInput(format!(
                    "Budget range {}..={} is empty",
                    from, to
                )));
            }
            let budgets: Vec<usize> = (*from..=to).collect();
            let pipeline = CardinalityPipeline::new(portfolio.pipeline_config(*from, *compare))?;
            let curve = pipeline.objective_curve(&returns, &budgets)?;
            print_curve(&curve, cli.output)
        }

        Commands::Init { output } => init_config(output),

        Commands::RunConfig { config } => run_from_config(config, cli.output),
    }
}

fn init_config(output: &PathBuf) -> Result<()> {
    fs::write(output, PipelineFileConfig::example())?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to describe your universe, then run:");
    println!("  cardinal run-config -c {}", output.display());
    Ok(())
}

fn run_from_config(config_path: &PathBuf, output: OutputFormat) -> Result<()> {
    let file_config = PipelineFileConfig::load(config_path)?;
    let pipeline_config = file_config.to_pipeline_config()?;

    let data_path = file_config.data.path.clone().ok_or_else(|| {
        AllocationError::ConfigError("No data path specified in config".to_string())
    })?;
    info!("Loading data from: {}", data_path);
    let returns = load_returns_csv(&data_path, &file_config.data_config()?)?;

    let result = CardinalityPipeline::new(pipeline_config)?.run(&returns)?;
    print_result(&result, output)
}

fn print_result(result: &PipelineResult, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => {
            let labels = result.labels();
            println!("Clusters: {}", labels.cluster_count());
            for (k, members) in labels.clusters().iter().enumerate() {
                let names: Vec<&str> = members.iter().map(|&i| result.assets[i].as_str()).collect();
                let share = result.allocation.shares[k];
                println!(
                    "  [{}] slots {:>2}  capital {:>6.2}%  {}",
                    k,
                    share.cardinality,
                    share.capital * 100.0,
                    names.join(", ")
                );
            }
            println!();
            println!("Holdings:");
            for (name, weight) in result.holdings() {
                println!("  {:<12} {:>8.4}%", name, weight * 100.0);
            }
            println!();
            println!("Objective:       {:.8}", result.objective);
            println!("Expected return: {:.8}", result.expected_return);
            println!("Variance:        {:.8}", result.variance);
            println!("Candidates:      {}", result.candidates_evaluated);
            if let Some(unclustered) = result.unclustered_objective {
                println!("Unclustered:     {:.8}", unclustered);
            }
        }
    }
    Ok(())
}

fn print_dendrogram(dendrogram: &Dendrogram, assets: &[String], output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(dendrogram)?),
        OutputFormat::Text => {
            println!("Merges:");
            for (step, merge) in dendrogram.merges.iter().enumerate() {
                let marker = if dendrogram.cut.applies(merge.distance) { ' ' } else { '|' };
                println!(
                    " {}{:>3}  {:>12.6}  {} + {}",
                    marker, step, merge.distance, merge.left, merge.right
                );
            }
            println!();
            println!(
                "Cut threshold: {:.6} ({} clusters)",
                dendrogram.cut.threshold,
                dendrogram.labels.cluster_count()
            );
            for (k, members) in dendrogram.labels.clusters().iter().enumerate() {
                let names: Vec<&str> = members.iter().map(|&i| assets[i].as_str()).collect();
                println!("  [{}] {}", k, names.join(", "));
            }
        }
    }
    Ok(())
}

fn print_curve(curve: &[CurvePoint], output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(curve)?),
        OutputFormat::Text => {
            println!("{:>6}  {:>14}  {:>14}", "budget", "clustered", "unclustered");
            for point in curve {
                let unclustered = point
                    .unclustered
                    .map(|v| format!("{:.8}", v))
                    .unwrap_or_else(|| "-".to_string());
                println!("{:>6}  {:>14.8}  {:>14}", point.budget, point.clustered, unclustered);
            }
        }
    }
    Ok(())
}
