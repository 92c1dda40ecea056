use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use retina_train::logging::init_logging;
use retina_train::training::{run_training, OptimizationStrategy, OptimizerParams, TrainingOptions};
use retina_train::ConfigRegistry;
use tracing::info;

#[derive(Parser)]
#[command(name = "retina-train")]
#[command(about = "Train a multi-task anchor-based face detector", long_about = None)]
#[command(version)]
struct Cli {
    /// WIDER FACE label file
    #[arg(long, default_value = "./data/widerface/train/label.txt")]
    training_dataset: PathBuf,

    /// Network variant
    #[arg(long, default_value = "efficientb2")]
    network: String,

    /// Batches decoded concurrently
    #[arg(long, default_value_t = 4)]
    num_workers: usize,

    /// Initial learning rate
    #[arg(long = "lr", alias = "learning-rate", default_value_t = 1e-3)]
    lr: f64,

    /// Momentum
    #[arg(long, default_value_t = 0.9)]
    momentum: f64,

    /// Resume from the checkpoint of --resume-epoch
    #[arg(long)]
    resume_net: bool,

    /// Completed epochs of the checkpoint to resume from
    #[arg(long, default_value_t = 0)]
    resume_epoch: usize,

    /// Weight decay
    #[arg(long, default_value_t = 5e-4)]
    weight_decay: f64,

    /// Step-decay factor (unused)
    #[arg(long, default_value_t = 0.1)]
    gamma: f64,

    /// Checkpoint directory
    #[arg(long, default_value = "./weights/")]
    save_folder: PathBuf,

    /// Optimizer: sgd, sgdp or adamp
    #[arg(long, default_value = "sgd")]
    optimizer: String,

    /// Shuffle seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Extra variant definitions (JSON or YAML)
    #[arg(long, env = "RETINA_TRAIN_REGISTRY")]
    registry: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Do not draw the progress line
    #[arg(long)]
    no_progress: bool,
}

impl Cli {
    fn options(&self) -> Result<TrainingOptions> {
        let optimizer: OptimizationStrategy = self
            .optimizer
            .parse()
            .context("Failed to parse --optimizer")?;

        Ok(TrainingOptions {
            training_dataset: self.training_dataset.clone(),
            network: self.network.clone(),
            num_workers: self.num_workers,
            optimizer,
            optimizer_params: OptimizerParams {
                learning_rate: self.lr,
                momentum: self.momentum,
                weight_decay: self.weight_decay,
            },
            gamma: self.gamma,
            resume_net: self.resume_net,
            resume_epoch: self.resume_epoch,
            save_folder: self.save_folder.clone(),
            seed: self.seed,
            registry: self.registry.clone(),
            show_progress: !self.no_progress,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.quiet, cli.json_logs).context("Failed to initialise logging")?;

    let options = cli.options()?;
    options.validate().context("Invalid training options")?;

    let mut registry = ConfigRegistry::builtin();
    if let Some(path) = &options.registry {
        let extra = ConfigRegistry::from_file(path)
            .with_context(|| format!("Failed to load variant registry {}", path.display()))?;
        registry = registry.merge(extra);
    }

    let summary = run_training(&options, &registry)
        .await
        .context("Training failed")?;

    info!(
        "Finished {} epochs ({} iterations); final weights at {}",
        summary.epochs_completed,
        summary.iterations_run,
        summary.final_checkpoint.display()
    );

    Ok(())
}
