//! Training loop for multi-task face detectors
//!
//! [`TrainingLoop`] owns everything a run mutates: the detector, the optimizer
//! set, the batch source and the [`TrainingState`]. It walks the global
//! iteration range of an [`EpochPlan`], rolling over epochs, saving periodic
//! checkpoints at epoch boundaries and a `Final` checkpoint at the end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::Tensor;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::checkpoints::{should_checkpoint, CheckpointLabel, CheckpointManager};
use super::data::{
    DataLoader, DataLoaderStream, Dataset, DetectionBatch, Preprocessor, WiderFaceDataset,
};
use super::loss::{LossAggregator, MultiBoxCriterion, MultiBoxLoss};
use super::optimizers::OptimizerSet;
use super::options::TrainingOptions;
use super::progress::{IterationStats, ProgressLine, TracingObserver, TrainingObserver};
use crate::config::{ConfigRegistry, VariantConfig};
use crate::detector::{AnchorHeadDetector, Detector};
use crate::device::DevicePlacement;
use crate::error::{Error, Result};
use crate::priors::PriorGenerator;
use crate::utils::timing::Timer;

/// Iteration arithmetic of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochPlan {
    /// Batches per epoch
    pub epoch_size: usize,
    /// Total epochs
    pub epoch_count: usize,
    /// One past the last global iteration
    pub max_iteration: usize,
    /// First global iteration to run
    pub start_iteration: usize,
}

impl EpochPlan {
    /// Plan a run over `dataset_len` samples
    pub fn new(
        dataset_len: usize,
        batch_size: usize,
        epoch_count: usize,
        resume_epoch: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("Batch size must be positive"));
        }
        if dataset_len == 0 {
            return Err(Error::dataset("Training dataset is empty"));
        }

        let epoch_size = dataset_len.div_ceil(batch_size);
        Ok(Self {
            epoch_size,
            epoch_count,
            max_iteration: epoch_count * epoch_size,
            start_iteration: resume_epoch * epoch_size,
        })
    }

    /// Whether `iteration` opens a new epoch
    pub fn is_epoch_boundary(&self, iteration: usize) -> bool {
        iteration % self.epoch_size == 0
    }

    /// Iterations left to run, zero when resuming past the end
    pub fn remaining(&self) -> usize {
        self.max_iteration.saturating_sub(self.start_iteration)
    }

    /// Projected remaining time given the last batch time
    pub fn eta(&self, batch_time: Duration, iteration: usize) -> Duration {
        let left = self.max_iteration.saturating_sub(iteration);
        batch_time.mul_f64(left as f64)
    }
}

/// Per-epoch running loss sums
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningLosses {
    loc: f64,
    cls: f64,
    landm: f64,
    total: f64,
    batches: usize,
}

impl RunningLosses {
    /// Add one batch
    pub fn record(&mut self, loc: f64, cls: f64, landm: f64, total: f64) {
        self.loc += loc;
        self.cls += cls;
        self.landm += landm;
        self.total += total;
        self.batches += 1;
    }

    /// Start a new epoch
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Batches recorded this epoch
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Means `(loc, cls, landm, total)` over the recorded batches
    pub fn means(&self) -> (f64, f64, f64, f64) {
        if self.batches == 0 {
            return (0.0, 0.0, 0.0, 0.0);
        }
        let n = self.batches as f64;
        (self.loc / n, self.cls / n, self.landm / n, self.total / n)
    }
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingStatus {
    /// Built, not yet started
    Initializing,
    /// Iterating
    Running,
    /// Writing a checkpoint
    Checkpointing,
    /// Final checkpoint written
    Completed,
}

/// Mutable state of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Epoch counter, pre-incremented at each epoch boundary
    pub epoch: usize,
    /// Next global iteration
    pub iteration: usize,
    /// Running losses of the current epoch
    pub running: RunningLosses,
    /// Lifecycle status
    pub status: TrainingStatus,
}

/// Outcome of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Epoch counter at completion
    pub epochs_completed: usize,
    /// Optimizer steps taken by this run
    pub iterations_run: usize,
    /// Periodic checkpoints written by this run
    pub checkpoints: Vec<PathBuf>,
    /// The `Final` checkpoint
    pub final_checkpoint: PathBuf,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration
    pub duration: Duration,
}

/// Explicit training loop over one detector
pub struct TrainingLoop<D: Dataset + 'static> {
    config: VariantConfig,
    placement: DevicePlacement,
    detector: Box<dyn Detector>,
    criterion: Box<dyn MultiBoxCriterion>,
    aggregator: LossAggregator,
    optimizers: OptimizerSet,
    checkpoints: CheckpointManager,
    loader: DataLoader<D>,
    priors: Tensor,
    plan: EpochPlan,
    state: TrainingState,
    observers: Vec<Box<dyn TrainingObserver>>,
}

impl<D: Dataset + 'static> TrainingLoop<D> {
    /// Prepare a run
    ///
    /// Applies the resume checkpoint (if requested) before anything else
    /// touches the detector, then builds the prior set on the placement
    /// device, the optimizer set and the iteration plan.
    #[instrument(skip_all, fields(model = %config.name, optimizer = %options.optimizer))]
    pub fn new(
        config: VariantConfig,
        options: &TrainingOptions,
        placement: DevicePlacement,
        mut detector: Box<dyn Detector>,
        criterion: Box<dyn MultiBoxCriterion>,
        dataset: Arc<D>,
    ) -> Result<Self> {
        options.validate()?;
        config.validate()?;

        let checkpoints = CheckpointManager::new(
            &options.save_folder,
            &config.name,
            options.optimizer.as_str(),
        )?;

        let start_epoch = options.start_epoch();
        if options.resume_net {
            info!("Loading resume network from epoch {}", options.resume_epoch);
            checkpoints
                .load(options.resume_epoch, placement.device())
                .and_then(|state| detector.load_state_dict(&state))
                .map_err(|e| Error::resume_failed(options.resume_epoch, e))?;
        }

        let priors = PriorGenerator::new(&config, (config.image_size, config.image_size))
            .generate()?
            .to_tensor(placement.device())?;

        let optimizers = OptimizerSet::new(
            options.optimizer,
            detector.var_map(),
            &options.optimizer_params,
            config.epoch,
            start_epoch,
        )?;

        let plan = EpochPlan::new(dataset.len(), config.batch_size, config.epoch, start_epoch)?;
        let loader = DataLoader::new(dataset, config.batch_size, options.num_workers, options.seed)?;

        info!(
            "Prepared {} on {} ({} parameters, {} priors, {} batches per epoch)",
            detector.name(),
            placement,
            detector.parameter_count(),
            priors.dim(0)?,
            plan.epoch_size
        );

        Ok(Self {
            aggregator: LossAggregator::new(config.loc_weight),
            config,
            placement,
            detector,
            criterion,
            optimizers,
            checkpoints,
            loader,
            priors,
            plan,
            state: TrainingState {
                epoch: start_epoch,
                iteration: plan.start_iteration,
                running: RunningLosses::default(),
                status: TrainingStatus::Initializing,
            },
            observers: Vec::new(),
        })
    }

    /// Attach a progress observer
    pub fn with_observer(mut self, observer: Box<dyn TrainingObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Iteration plan
    pub fn plan(&self) -> &EpochPlan {
        &self.plan
    }

    /// Current state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Detector being trained
    pub fn detector(&self) -> &dyn Detector {
        self.detector.as_ref()
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.optimizers.learning_rate()
    }

    /// Run every remaining iteration, then save the `Final` checkpoint
    #[instrument(skip(self), fields(model = %self.config.name))]
    pub async fn run(&mut self) -> Result<TrainingSummary> {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut checkpoints = Vec::new();
        let mut batches: Option<DataLoaderStream> = None;
        let mut iterations_run = 0;

        if self.plan.remaining() == 0 {
            warn!(
                "Resume epoch {} leaves no iterations out of {}",
                self.state.epoch, self.plan.epoch_count
            );
        }
        self.state.status = TrainingStatus::Running;

        for iteration in self.plan.start_iteration..self.plan.max_iteration {
            self.state.iteration = iteration;

            if self.plan.is_epoch_boundary(iteration) {
                batches = Some(self.loader.epoch_stream(self.state.epoch));
                if should_checkpoint(self.state.epoch) {
                    let label = CheckpointLabel::Epoch(self.state.epoch);
                    checkpoints.push(self.save_checkpoint(label)?);
                }
                self.begin_epoch();
            }

            let timer = Timer::new("iteration");
            let batch = match batches.as_mut() {
                Some(stream) => stream.next().await,
                None => None,
            }
            .ok_or_else(|| {
                Error::malformed_batch(format!(
                    "batch source exhausted at iteration {iteration} of epoch {}",
                    self.state.epoch
                ))
            })??;

            let (loc, cls, landm, total) = self.train_step(&batch)?;
            iterations_run += 1;
            self.state.running.record(loc, cls, landm, total);

            let batch_time = timer.elapsed();
            self.report_iteration(iteration, batch_time);
        }

        self.state.iteration = self.plan.max_iteration.max(self.plan.start_iteration);
        let final_checkpoint = self.save_checkpoint(CheckpointLabel::Final)?;
        self.state.status = TrainingStatus::Completed;

        let summary = TrainingSummary {
            epochs_completed: self.state.epoch,
            iterations_run,
            checkpoints,
            final_checkpoint,
            started_at,
            duration: started.elapsed(),
        };
        for observer in &mut self.observers {
            observer.on_completed(&summary);
        }
        Ok(summary)
    }

    fn begin_epoch(&mut self) {
        self.state.epoch += 1;
        self.state.running.reset();
        if self.state.epoch > 1 {
            if let Some(lr) = self.optimizers.advance_schedule() {
                debug!("Learning rate for epoch {}: {:.8}", self.state.epoch, lr);
            }
        }

        let lr = self.optimizers.learning_rate();
        for observer in &mut self.observers {
            observer.on_epoch_start(self.state.epoch, self.plan.epoch_count, lr);
        }
    }

    /// Forward, loss, backward and one optimizer step on a host batch
    fn train_step(&mut self, batch: &DetectionBatch) -> Result<(f64, f64, f64, f64)> {
        let batch = batch.to_device(self.placement.device())?;

        let output = self.detector.forward(&batch.images)?;
        let losses = self.criterion.compute(&output, &self.priors, &batch.targets)?;
        let total = self.aggregator.combine(&losses)?;

        let gradients = total.backward()?;
        self.optimizers.step(&gradients)?;

        let (loc, cls, landm) = losses.to_scalars()?;
        let total = LossAggregator::aggregate(loc, cls, landm, self.aggregator.loc_weight());
        Ok((loc, cls, landm, total))
    }

    fn report_iteration(&mut self, iteration: usize, batch_time: Duration) {
        let (loc, cls, landm, total) = self.state.running.means();
        let stats = IterationStats {
            epoch: self.state.epoch,
            epoch_count: self.plan.epoch_count,
            epoch_iteration: iteration % self.plan.epoch_size + 1,
            epoch_size: self.plan.epoch_size,
            iteration: iteration + 1,
            max_iteration: self.plan.max_iteration,
            loc,
            cls,
            landm,
            total,
            learning_rate: self.optimizers.learning_rate(),
            batch_time: batch_time.as_secs_f64(),
            eta: self.plan.eta(batch_time, iteration).as_secs_f64(),
        };
        for observer in &mut self.observers {
            observer.on_iteration_complete(&stats);
        }
    }

    fn save_checkpoint(&mut self, label: CheckpointLabel) -> Result<PathBuf> {
        self.state.status = TrainingStatus::Checkpointing;
        let timer = Timer::new(format!("checkpoint {label}"));
        let state = self.placement.export_state(self.detector.state_dict()?);
        let path = self.checkpoints.save(&state, label)?;
        timer.stop();
        for observer in &mut self.observers {
            observer.on_checkpoint_saved(label, &path);
        }
        self.state.status = TrainingStatus::Running;
        Ok(path)
    }
}

/// Train a registry variant on WIDER FACE with the baseline detector
#[instrument(skip_all, fields(network = %options.network))]
pub async fn run_training(
    options: &TrainingOptions,
    registry: &ConfigRegistry,
) -> Result<TrainingSummary> {
    options.validate()?;
    let config = registry.resolve(&options.network)?;
    info!(
        "Training {} with {} (batch {}, {} epochs, image {}px)",
        config.name, options.optimizer, config.batch_size, config.epoch, config.image_size
    );
    info!("Step-decay gamma {} is accepted but unused", options.gamma);

    let placement = DevicePlacement::resolve(config.device_policy, config.ngpu)?;
    let detector = AnchorHeadDetector::new(&config, placement.device())?;
    let dataset = WiderFaceDataset::open(
        &options.training_dataset,
        Preprocessor::new(config.image_size),
    )?;
    let criterion = MultiBoxLoss::with_variances(config.variance);

    let mut training = TrainingLoop::new(
        config,
        options,
        placement,
        Box::new(detector),
        Box::new(criterion),
        Arc::new(dataset),
    )?
    .with_observer(Box::new(TracingObserver));

    if options.show_progress {
        let line = ProgressLine::new(training.plan().max_iteration);
        training = training.with_observer(Box::new(line));
    }

    training.run().await
}
