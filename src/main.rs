use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use simpo::logging::init_logging;
use simpo::{pair_loss, pair_margin, LossType, SimpoConfig, SimpoLoss, TrainingConfig};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "simpo")]
#[command(about = "SimPO - reference-free preference optimization loss and trainer", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a training configuration file
    Config {
        /// Configuration file (.json, .yaml or .yml)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Evaluate the loss for one pair of log-probabilities
    Loss {
        /// Length-normalized log-probability of the chosen completion
        #[arg(long, allow_negative_numbers = true)]
        chosen_logp: f64,

        /// Length-normalized log-probability of the rejected completion
        #[arg(long, allow_negative_numbers = true)]
        rejected_logp: f64,

        /// Reward scale
        #[arg(long, default_value_t = 2.0)]
        beta: f64,

        /// Target margin as a fraction of beta
        #[arg(long, default_value_t = 0.5, allow_negative_numbers = true)]
        gamma_beta_ratio: f64,

        /// sigmoid or hinge
        #[arg(long, default_value = "sigmoid")]
        loss_type: LossType,

        /// Label smoothing for the sigmoid loss
        #[arg(long, default_value_t = 0.0)]
        label_smoothing: f64,
    },

    /// Score a JSONL file of precomputed log-probabilities
    Score {
        /// One `{"chosen_logp": .., "rejected_logp": ..}` object per line
        #[arg(short, long)]
        input: PathBuf,

        /// Training config supplying the loss hyperparameters
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show build information
    Info,
}

#[derive(Debug, Deserialize)]
struct ScoredPair {
    chosen_logp: f64,
    rejected_logp: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json)?;

    match cli.command {
        Commands::Config { file } => validate_config(&file)?,
        Commands::Loss {
            chosen_logp,
            rejected_logp,
            beta,
            gamma_beta_ratio,
            loss_type,
            label_smoothing,
        } => {
            let config = SimpoConfig::new(beta, gamma_beta_ratio)
                .with_loss_type(loss_type)
                .with_label_smoothing(label_smoothing);
            single_loss(chosen_logp, rejected_logp, &config)?;
        }
        Commands::Score { input, config } => score_file(&input, config.as_deref()).await?,
        Commands::Info => show_system_info(),
    }

    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    info!("Validating configuration file: {}", path.display());

    let config = TrainingConfig::from_file(path).context("Failed to load configuration file")?;
    config.validate().context("Configuration is invalid")?;

    info!("Configuration is valid");
    info!(
        "  - Loss: {} (beta={}, gamma_beta_ratio={}, gamma={})",
        config.simpo.loss_type,
        config.simpo.beta,
        config.simpo.gamma_beta_ratio,
        config.simpo.gamma()
    );
    info!(
        "  - Optimization: lr={}, epochs={}, effective batch size={}",
        config.training.learning_rate,
        config.training.num_train_epochs,
        config.effective_batch_size()
    );
    info!(
        "  - Data: max_length={}, max_prompt_length={}",
        config.data.max_length, config.data.max_prompt_length
    );
    Ok(())
}

fn single_loss(chosen_logp: f64, rejected_logp: f64, config: &SimpoConfig) -> Result<()> {
    config.validate().context("Invalid loss hyperparameters")?;
    let output = serde_json::json!({
        "margin": pair_margin(chosen_logp, rejected_logp, config),
        "loss": pair_loss(chosen_logp, rejected_logp, config),
        "rewards/chosen": config.beta * chosen_logp,
        "rewards/rejected": config.beta * rejected_logp,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn score_file(input: &Path, config_path: Option<&Path>) -> Result<()> {
    let simpo_config = match config_path {
        Some(path) => TrainingConfig::from_file(path).context("Failed to load configuration file")?.simpo,
        None => SimpoConfig::default(),
    };
    let loss_fn = SimpoLoss::new(&simpo_config).context("Invalid loss hyperparameters")?;

    let text = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let mut chosen = Vec::new();
    let mut rejected = Vec::new();
    for (line_no, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let pair: ScoredPair =
            serde_json::from_str(line).with_context(|| format!("Malformed record on line {}", line_no + 1))?;
        chosen.push(pair.chosen_logp);
        rejected.push(pair.rejected_logp);
    }
    anyhow::ensure!(!chosen.is_empty(), "{} contains no records", input.display());
    info!(pairs = chosen.len(), "scoring preference pairs");

    let chosen = Tensor::new(chosen.as_slice(), &Device::Cpu)?;
    let rejected = Tensor::new(rejected.as_slice(), &Device::Cpu)?;
    let output = loss_fn.forward(&chosen, &rejected)?;

    println!("{}", serde_json::to_string_pretty(&output.metrics.to_map(""))?);
    Ok(())
}

fn show_system_info() {
    println!("SimPO - reference-free preference optimization");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Loss variants: sigmoid, hinge");
    println!("Defaults: beta=2.0, gamma_beta_ratio=0.5, lr=6e-7, grad accumulation=16");
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  [x] NVIDIA CUDA");
    #[cfg(not(feature = "cuda"))]
    println!("  [ ] CUDA (not compiled)");

    #[cfg(feature = "metal")]
    println!("  [x] Apple Metal");
    #[cfg(not(feature = "metal"))]
    println!("  [ ] Metal (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  [x] Apple Accelerate");
    #[cfg(not(feature = "accelerate"))]
    println!("  [ ] Accelerate (not compiled)");

    println!("  [x] CPU");
    println!();
    println!("Usage:");
    println!("  simpo config -f simpo.yaml                              # Validate configuration");
    println!("  simpo loss --chosen-logp -1.2 --rejected-logp -1.9      # Loss for one pair");
    println!("  simpo score -i logps.jsonl [-c simpo.yaml]              # Batch metrics as JSON");
    println!("  simpo info                                              # Show this information");
}
