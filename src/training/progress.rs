//! Training progress reporting
//!
//! The training loop reports through [`TrainingObserver`]s. Two are provided:
//! a terminal [`ProgressLine`] redrawn in place on stdout, and a
//! [`TracingObserver`] that turns progress into structured log events.

use std::fmt;
use std::path::Path;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{debug, info};

use super::checkpoints::CheckpointLabel;
use super::trainer::TrainingSummary;
use crate::utils::timing::format_hms;

/// Snapshot of one finished iteration
///
/// Counters are one-based, as printed.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationStats {
    /// Current epoch
    pub epoch: usize,
    /// Total epochs
    pub epoch_count: usize,
    /// Iteration within the epoch
    pub epoch_iteration: usize,
    /// Iterations per epoch
    pub epoch_size: usize,
    /// Global iteration
    pub iteration: usize,
    /// Last global iteration
    pub max_iteration: usize,
    /// Running mean of the localisation loss over the epoch
    pub loc: f64,
    /// Running mean of the classification loss
    pub cls: f64,
    /// Running mean of the landmark loss
    pub landm: f64,
    /// Running mean of the aggregated loss
    pub total: f64,
    /// Learning rate used for the step
    pub learning_rate: f64,
    /// Wall time of the iteration in seconds
    pub batch_time: f64,
    /// Estimated remaining time in seconds
    pub eta: f64,
}

impl fmt::Display for IterationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Epoch:{}/{} || Epochiter: {}/{} || Iter: {}/{} || Loc: {:.3} Cla: {:.3} Landm: {:.3} Loss: {:.3}|| LR: {:.8} || Batchtime: {:.3} s || ETA: {}",
            self.epoch,
            self.epoch_count,
            self.epoch_iteration,
            self.epoch_size,
            self.iteration,
            self.max_iteration,
            self.loc,
            self.cls,
            self.landm,
            self.total,
            self.learning_rate,
            self.batch_time,
            format_hms(self.eta),
        )
    }
}

/// Receives training progress events
pub trait TrainingObserver: Send {
    /// A new epoch begins (one-based)
    fn on_epoch_start(&mut self, _epoch: usize, _epoch_count: usize, _learning_rate: f64) {}

    /// An optimizer step finished
    fn on_iteration_complete(&mut self, stats: &IterationStats);

    /// A checkpoint was written
    fn on_checkpoint_saved(&mut self, _label: CheckpointLabel, _path: &Path) {}

    /// Training finished
    fn on_completed(&mut self, _summary: &TrainingSummary) {}
}

/// Single status line redrawn in place on stdout
pub struct ProgressLine {
    bar: ProgressBar,
}

impl ProgressLine {
    /// Create a line tracking `max_iteration` iterations
    pub fn new(max_iteration: usize) -> Self {
        Self::with_target(max_iteration, ProgressDrawTarget::stdout())
    }

    /// Create a line that is never drawn
    pub fn hidden(max_iteration: usize) -> Self {
        Self::with_target(max_iteration, ProgressDrawTarget::hidden())
    }

    fn with_target(max_iteration: usize, target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(Some(max_iteration as u64), target);
        let style =
            ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }

    /// Last rendered message
    pub fn message(&self) -> String {
        self.bar.message()
    }

    /// Position of the line (global iteration)
    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl TrainingObserver for ProgressLine {
    fn on_iteration_complete(&mut self, stats: &IterationStats) {
        self.bar.set_position(stats.iteration as u64);
        self.bar.set_message(stats.to_string());
    }

    fn on_checkpoint_saved(&mut self, label: CheckpointLabel, path: &Path) {
        self.bar
            .println(format!("Saved epoch {} checkpoint to {}", label, path.display()));
    }

    fn on_completed(&mut self, _summary: &TrainingSummary) {
        self.bar.finish();
    }
}

/// Emits progress as tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TrainingObserver for TracingObserver {
    fn on_epoch_start(&mut self, epoch: usize, epoch_count: usize, learning_rate: f64) {
        info!(epoch, epoch_count, learning_rate, "Starting epoch");
    }

    fn on_iteration_complete(&mut self, stats: &IterationStats) {
        debug!(
            epoch = stats.epoch,
            iteration = stats.iteration,
            loc = stats.loc,
            cls = stats.cls,
            landm = stats.landm,
            loss = stats.total,
            lr = stats.learning_rate,
            batch_time = stats.batch_time,
            "Iteration complete"
        );
    }

    fn on_checkpoint_saved(&mut self, label: CheckpointLabel, path: &Path) {
        info!(label = %label, path = %path.display(), "Checkpoint saved");
    }

    fn on_completed(&mut self, summary: &TrainingSummary) {
        info!(
            epochs = summary.epochs_completed,
            iterations = summary.iterations_run,
            checkpoints = summary.checkpoints.len(),
            "Training completed in {:.1}s",
            summary.duration.as_secs_f64()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> IterationStats {
        IterationStats {
            epoch: 1,
            epoch_count: 250,
            epoch_iteration: 3,
            epoch_size: 42,
            iteration: 3,
            max_iteration: 10500,
            loc: 1.23456,
            cls: 0.5,
            landm: 2.0,
            total: 4.96912,
            learning_rate: 1e-3,
            batch_time: 0.25,
            eta: 3725.0,
        }
    }

    #[test]
    fn test_progress_line_format() {
        assert_eq!(
            stats().to_string(),
            "Epoch:1/250 || Epochiter: 3/42 || Iter: 3/10500 || Loc: 1.235 Cla: 0.500 Landm: 2.000 Loss: 4.969|| LR: 0.00100000 || Batchtime: 0.250 s || ETA: 1:02:05"
        );
    }

    #[test]
    fn test_progress_line_tracks_iterations() {
        let mut line = ProgressLine::hidden(10500);
        line.on_iteration_complete(&stats());
        assert_eq!(line.position(), 3);
        assert!(line.message().starts_with("Epoch:1/250"));
    }
}
