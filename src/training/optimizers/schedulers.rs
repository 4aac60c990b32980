//! Learning rate schedules with linear warmup
//!
//! The rate for optimizer step `s` (zero-based, counted before the update)
//! ramps linearly from 0 over the warmup steps and then follows the decay
//! curve down to 0 at `total_steps`.

use crate::training::config::{SchedulerType, TrainingArgs};

/// Trait for learning rate schedulers
pub trait Scheduler: Send + Sync {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Learning rate for a given optimizer step
    fn lr_at(&self, step: usize) -> f64;

    /// Current optimizer step
    fn current_step(&self) -> usize;

    /// Jump to a step, used when resuming
    fn set_step(&mut self, step: usize);

    /// Advance by one optimizer step
    fn step(&mut self) {
        let next = self.current_step().saturating_add(1);
        self.set_step(next);
    }

    /// Learning rate for the current step
    fn get_lr(&self) -> f64 {
        self.lr_at(self.current_step())
    }
}

/// Linear warmup followed by constant, linear or cosine decay
#[derive(Debug, Clone)]
pub struct WarmupScheduler {
    kind: SchedulerType,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl WarmupScheduler {
    /// Create a new scheduler
    pub fn new(kind: SchedulerType, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Scheduler for a run of `total_steps` optimizer steps
    pub fn from_args(args: &TrainingArgs, total_steps: usize) -> Self {
        Self::new(
            args.lr_scheduler_type,
            args.learning_rate,
            args.warmup_steps(total_steps),
            total_steps,
        )
    }

    /// Warmup length
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

impl Scheduler for WarmupScheduler {
    fn name(&self) -> &str {
        match self.kind {
            SchedulerType::Constant => "constant_with_warmup",
            SchedulerType::Linear => "linear",
            SchedulerType::Cosine => "cosine",
        }
    }

    fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;
        let progress = progress.min(1.0);

        let factor = match self.kind {
            SchedulerType::Constant => 1.0,
            SchedulerType::Linear => 1.0 - progress,
            SchedulerType::Cosine => 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
        };
        self.base_lr * factor
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }
}
