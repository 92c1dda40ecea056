//! Learning rate schedulers
//!
//! Schedulers advance once per epoch boundary.

use super::Scheduler;

/// Cosine annealing over a fixed number of epochs
///
/// `lr(t) = eta_min + (base_lr - eta_min) * (1 + cos(pi * t / t_max)) / 2`
#[derive(Debug, Clone)]
pub struct CosineAnnealingScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Minimum learning rate
    eta_min: f64,

    /// Length of the half period, in epochs
    t_max: usize,

    /// Number of schedule steps taken
    last_epoch: usize,
}

impl CosineAnnealingScheduler {
    /// Create a scheduler positioned at `last_epoch`
    pub fn new(base_lr: f64, eta_min: f64, t_max: usize, last_epoch: usize) -> Self {
        Self {
            base_lr,
            eta_min,
            t_max: t_max.max(1),
            last_epoch,
        }
    }

    /// Learning rate at schedule position `epoch`
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let progress = epoch as f64 / self.t_max as f64;
        self.eta_min
            + (self.base_lr - self.eta_min) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
    }
}

impl Scheduler for CosineAnnealingScheduler {
    fn name(&self) -> &str {
        "cosine_annealing"
    }

    fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.get_lr()
    }

    fn get_lr(&self) -> f64 {
        self.lr_at(self.last_epoch)
    }

    fn last_epoch(&self) -> usize {
        self.last_epoch
    }
}
