//! SimPO trainer
//!
//! Drives a [`PolicyModel`] through epochs of preference batches. Each
//! micro-batch runs one forward pass over the concatenated chosen+rejected
//! rows, and gradients are summed until an optimizer step. Logging,
//! evaluation and checkpointing hang off optimizer step counts.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::training::checkpoints::{save_model, CheckpointManager, TrainerState};
use crate::training::config::{NonFinitePolicy, TrainingConfig};
use crate::training::data::{DataLoader, PreferenceBatch};
use crate::training::loss::{masked_mean_logits, sequence_logps, PreferenceLossOutput, SimpoLoss};
use crate::training::metrics::{JsonlExporter, LogRecord, MetricsExporter, MetricsTracker, TracingExporter};
use crate::training::model::PolicyModel;
use crate::training::optimizers::{clip_grad_norm, AdamWOptimizer, GradientAccumulator, Scheduler, WarmupScheduler};

/// Metrics file written under the output directory
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    /// An epoch begins
    EpochStarted {
        /// Zero-based epoch
        epoch: usize,
    },
    /// An epoch ends
    EpochCompleted {
        /// Zero-based epoch
        epoch: usize,
    },
    /// An optimizer step was applied
    StepCompleted {
        /// Global step after the update
        step: usize,
        /// Mean loss of the step's micro-batches
        loss: Option<f64>,
        /// Learning rate used
        lr: f64,
        /// Gradient norm before clipping
        grad_norm: f64,
    },
    /// A log record was emitted
    Logged(LogRecord),
    /// Evaluation finished
    EvaluationCompleted {
        /// Global step
        step: usize,
        /// `eval_`-prefixed metrics
        metrics: BTreeMap<String, f64>,
    },
    /// A checkpoint was written
    CheckpointSaved {
        /// Checkpoint directory
        path: PathBuf,
    },
    /// Training resumed from a checkpoint
    Resumed {
        /// Checkpoint directory
        path: PathBuf,
        /// Restored global step
        step: usize,
    },
    /// A micro-batch produced a NaN or infinite loss
    NonFiniteLoss {
        /// Global step
        step: usize,
        /// Offending value
        value: f64,
    },
    /// A micro-batch was dropped under the skip policy
    BatchSkipped {
        /// Global step
        step: usize,
        /// Error that caused the skip
        reason: String,
    },
    /// Training finished
    TrainingCompleted {
        /// Optimizer steps taken
        total_steps: usize,
    },
    /// Training failed
    Error {
        /// Error message
        error: String,
    },
}

/// Training status enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingStatus {
    /// `train` not called yet
    NotStarted,
    /// Inside the training loop
    Running,
    /// Finished normally
    Completed,
    /// Stopped with an error
    Failed {
        /// Error message
        error: String,
    },
}

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Optimizer steps taken
    pub global_step: usize,
    /// Last logged training loss
    pub final_loss: Option<f64>,
    /// Final evaluation metrics
    pub eval_metrics: Option<BTreeMap<String, f64>>,
    /// Micro-batches dropped under the skip policy
    pub skipped_batches: usize,
    /// Wall time in seconds
    pub duration_secs: f64,
    /// Where the final model was written
    pub output_dir: PathBuf,
}

/// Trainer for the SimPO objective
pub struct SimpoTrainer<M: PolicyModel> {
    config: TrainingConfig,
    model: M,
    loss_fn: SimpoLoss,
    optimizer: AdamWOptimizer,
    scheduler: WarmupScheduler,
    accumulator: GradientAccumulator,
    train_loader: DataLoader,
    eval_loader: Option<DataLoader>,
    checkpoints: CheckpointManager,
    metrics: MetricsTracker,
    exporters: Vec<Box<dyn MetricsExporter>>,
    state: TrainerState,
    status: TrainingStatus,
    skipped_batches: usize,
    last_eval_step: Option<usize>,
    event_tx: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

impl<M: PolicyModel> SimpoTrainer<M> {
    /// Create a trainer. The config is validated here, before any batch runs.
    pub fn new(
        config: TrainingConfig,
        model: M,
        train_loader: DataLoader,
        eval_loader: Option<DataLoader>,
    ) -> Result<Self> {
        config.validate()?;
        if train_loader.num_batches() == 0 {
            return Err(Error::config("training set yields no batches"));
        }

        let loss_fn = SimpoLoss::new(&config.simpo)?;
        let total_steps = config.training.total_steps(train_loader.num_batches());
        let scheduler = WarmupScheduler::from_args(&config.training, total_steps);
        let optimizer = AdamWOptimizer::new(model.var_map(), &config.training)?;
        let accumulator = GradientAccumulator::new(optimizer.vars().to_vec());
        let checkpoints = CheckpointManager::new(&config.training.output_dir, config.training.save_total_limit);
        let exporters: Vec<Box<dyn MetricsExporter>> = vec![
            Box::new(TracingExporter),
            Box::new(JsonlExporter::new(config.training.output_dir.join(METRICS_FILE))),
        ];

        info!(
            parameters = optimizer.parameter_count(),
            total_steps,
            warmup_steps = scheduler.warmup_steps(),
            effective_batch_size = config.effective_batch_size(),
            "created SimPO trainer"
        );

        Ok(Self {
            config,
            model,
            loss_fn,
            optimizer,
            scheduler,
            accumulator,
            train_loader,
            eval_loader,
            checkpoints,
            metrics: MetricsTracker::new(),
            exporters,
            state: TrainerState::new(total_steps),
            status: TrainingStatus::NotStarted,
            skipped_batches: 0,
            last_eval_step: None,
            event_tx: None,
        })
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Replace the default exporters
    pub fn with_exporters(mut self, exporters: Vec<Box<dyn MetricsExporter>>) -> Self {
        self.exporters = exporters;
        self
    }

    /// Current trainer position
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Current status
    pub fn status(&self) -> &TrainingStatus {
        &self.status
    }

    /// Metrics history
    pub fn metrics(&self) -> &MetricsTracker {
        &self.metrics
    }

    /// The model being trained
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Give the trained model back
    pub fn into_model(self) -> M {
        self.model
    }

    /// Start training
    pub async fn train(&mut self) -> Result<TrainingSummary> {
        info!(output_dir = %self.config.training.output_dir.display(), "starting SimPO training");
        self.status = TrainingStatus::Running;
        let started = Instant::now();

        match self.run_and_save().await {
            Ok(eval_metrics) => {
                self.status = TrainingStatus::Completed;
                let output_dir = self.config.training.output_dir.clone();
                self.flush_exporters().await;
                self.send_event(TrainingEvent::TrainingCompleted {
                    total_steps: self.state.global_step,
                });
                info!(global_step = self.state.global_step, "training completed");

                Ok(TrainingSummary {
                    global_step: self.state.global_step,
                    final_loss: self.metrics.latest("loss"),
                    eval_metrics,
                    skipped_batches: self.skipped_batches,
                    duration_secs: started.elapsed().as_secs_f64(),
                    output_dir,
                })
            }
            Err(e) => {
                error!(error = %e, step = self.state.global_step, "training failed");
                self.status = TrainingStatus::Failed { error: e.to_string() };
                self.send_event(TrainingEvent::Error { error: e.to_string() });
                self.flush_exporters().await;

                let partial = self.partial_output_dir();
                match save_model(&partial, self.model.var_map(), &self.config).await {
                    Ok(()) => warn!(path = %partial.display(), "saved partial model"),
                    Err(save_err) => warn!(error = %save_err, "could not save partial model"),
                }
                Err(e)
            }
        }
    }

    /// Loss and metrics for one batch, with the gradient tape attached
    #[instrument(skip_all, fields(batch_size = batch.batch_size(), seq_len = batch.seq_len()))]
    pub fn compute_loss(&self, batch: &PreferenceBatch) -> Result<PreferenceLossOutput> {
        let pad = self.config.data.label_pad_token_id;
        let pairs = batch.batch_size();
        let (input_ids, attention_mask, labels) = batch.concatenated()?;

        let logits = self.model.forward(&input_ids, &attention_mask)?;
        let (rows, seq_len, _) = logits.dims3()?;
        if rows != 2 * pairs || seq_len != batch.seq_len() {
            return Err(Error::shape_mismatch(
                "model logits",
                &[2 * pairs, batch.seq_len()],
                &[rows, seq_len],
            ));
        }

        let all = sequence_logps(&logits, &labels, pad, true)?;
        let (chosen, rejected) = all.split_at(pairs)?;
        let mut output = self.loss_fn.forward_sequences(&chosen, &rejected)?;

        let logits_chosen = masked_mean_logits(&logits.narrow(0, 0, pairs)?, &labels.narrow(0, 0, pairs)?, pad)?;
        let logits_rejected =
            masked_mean_logits(&logits.narrow(0, pairs, pairs)?, &labels.narrow(0, pairs, pairs)?, pad)?;
        output.metrics = output.metrics.with_logits(logits_chosen, logits_rejected);
        Ok(output)
    }

    /// Evaluate on the eval loader; `None` when there is none
    pub async fn evaluate(&mut self) -> Result<Option<BTreeMap<String, f64>>> {
        let Some(loader) = self.eval_loader.as_ref() else {
            return Ok(None);
        };

        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        let mut pairs = 0usize;
        for indices in loader.epoch_indices(0) {
            let scored = loader
                .batch(&indices)
                .map_err(Error::from)
                .and_then(|batch| Ok((batch.batch_size(), self.compute_loss(&batch)?)));
            let (batch_size, output) = match scored {
                Ok(scored) => scored,
                Err(e) if e.is_batch_local() && self.skips_bad_batches() => {
                    warn!(error = %e, "skipping evaluation batch");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let weight = batch_size as f64;
            for (name, value) in output.metrics.to_map("eval_") {
                *sums.entry(name).or_insert(0.0) += value * weight;
            }
            pairs += batch_size;
        }

        let metrics: BTreeMap<String, f64> = sums
            .into_iter()
            .map(|(name, sum)| (name, sum / pairs.max(1) as f64))
            .collect();

        let record = self.metrics.push(self.state.global_step, self.fractional_epoch(), metrics.clone());
        self.export(&record).await;
        self.last_eval_step = Some(self.state.global_step);
        self.send_event(TrainingEvent::EvaluationCompleted {
            step: self.state.global_step,
            metrics: metrics.clone(),
        });
        Ok(Some(metrics))
    }

    /// Train, then write the final model; a failed save fails the run
    async fn run_and_save(&mut self) -> Result<Option<BTreeMap<String, f64>>> {
        let eval_metrics = self.run_training_loop().await?;
        save_model(&self.config.training.output_dir, self.model.var_map(), &self.config).await?;
        Ok(eval_metrics)
    }

    async fn run_training_loop(&mut self) -> Result<Option<BTreeMap<String, f64>>> {
        self.maybe_resume().await?;

        let num_batches = self.train_loader.num_batches();
        let num_epochs = self.config.training.num_epochs(num_batches);
        let accumulation = self.config.training.gradient_accumulation_steps;

        'epochs: for epoch in self.state.epoch..num_epochs {
            if self.is_done() {
                break;
            }
            self.state.epoch = epoch;
            let resume_from = std::mem::take(&mut self.state.batches_in_epoch);
            self.send_event(TrainingEvent::EpochStarted { epoch });
            info!(epoch, batches = num_batches, skip = resume_from, "starting epoch");

            let epoch_batches = self.train_loader.epoch_indices(epoch);
            let len = epoch_batches.len();
            for (i, indices) in epoch_batches.iter().enumerate().skip(resume_from) {
                // Accumulation windows restart every epoch; the last one may be short
                let window_start = i - i % accumulation;
                let window = accumulation.min(len - window_start);

                self.micro_step(indices, window)?;
                self.state.batches_in_epoch = i + 1;

                if i + 1 - window_start == window {
                    self.optimizer_step().await?;
                    if self.is_done() {
                        break 'epochs;
                    }
                }
            }

            self.state.batches_in_epoch = 0;
            self.send_event(TrainingEvent::EpochCompleted { epoch });
        }

        if self.config.training.do_eval && self.last_eval_step != Some(self.state.global_step) {
            return self.evaluate().await;
        }
        Ok(self.last_eval_metrics())
    }

    /// Collate, forward, backward and accumulate one micro-batch
    fn micro_step(&mut self, indices: &[usize], window: usize) -> Result<()> {
        match self.try_micro_step(indices, window) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Error::NonFiniteLoss { value, step } = &e {
                    error!(value, step, "non-finite loss");
                    self.send_event(TrainingEvent::NonFiniteLoss {
                        step: *step,
                        value: *value,
                    });
                }
                if e.is_batch_local() && self.skips_bad_batches() {
                    warn!(error = %e, step = self.state.global_step, "skipping micro-batch");
                    self.skipped_batches += 1;
                    self.send_event(TrainingEvent::BatchSkipped {
                        step: self.state.global_step,
                        reason: e.to_string(),
                    });
                    return Ok(());
                }
                Err(e)
            }
        }
    }

    fn try_micro_step(&mut self, indices: &[usize], window: usize) -> Result<()> {
        let batch = self.train_loader.batch(indices)?;
        let output = self.compute_loss(&batch)?;
        let value = output.metrics.loss;
        if !value.is_finite() {
            return Err(Error::NonFiniteLoss {
                value,
                step: self.state.global_step,
            });
        }

        let scaled = output.loss.affine(1.0 / window as f64, 0.0)?;
        let grads = scaled.backward()?;
        self.accumulator.accumulate(grads)?;
        self.metrics.record(&output.metrics.to_map(""));
        debug!(loss = value, micro_batches = self.accumulator.micro_batches(), "micro-batch done");
        Ok(())
    }

    async fn optimizer_step(&mut self) -> Result<()> {
        let lr = self.scheduler.get_lr();
        let mut grad_norm = 0.0;

        match self.accumulator.take() {
            Some(mut grads) => {
                self.optimizer.set_learning_rate(lr);
                grad_norm = clip_grad_norm(&mut grads, self.optimizer.vars(), self.config.training.max_grad_norm)?;
                self.optimizer.step(&grads)?;
                self.state.optimizer_steps = self.optimizer.step_count();
            }
            None => warn!(step = self.state.global_step, "every micro-batch in this step was skipped"),
        }

        self.scheduler.step();
        self.state.global_step += 1;
        let step = self.state.global_step;
        let loss = self.metrics.window_means().get("loss").copied();
        self.send_event(TrainingEvent::StepCompleted {
            step,
            loss,
            lr,
            grad_norm,
        });

        let args = &self.config.training;
        let (logging_steps, eval_steps, save_steps, do_eval) =
            (args.logging_steps, args.eval_steps, args.save_steps, args.do_eval);

        if step % logging_steps == 0 || self.is_done() {
            let extra = BTreeMap::from([
                ("learning_rate".to_string(), lr),
                ("grad_norm".to_string(), grad_norm),
            ]);
            let record = self.metrics.flush(step, self.fractional_epoch(), extra);
            self.state.last_loss = record.metrics.get("loss").copied().or(self.state.last_loss);
            self.export(&record).await;
            self.send_event(TrainingEvent::Logged(record));
        }

        if do_eval && eval_steps > 0 && step % eval_steps == 0 {
            self.evaluate().await?;
        }

        if save_steps > 0 && step % save_steps == 0 {
            let path = self
                .checkpoints
                .save(self.model.var_map(), &self.optimizer, &self.state)
                .await?;
            self.send_event(TrainingEvent::CheckpointSaved { path });
        }
        Ok(())
    }

    async fn maybe_resume(&mut self) -> Result<()> {
        let Some(target) = self.config.training.resume_from_checkpoint.clone() else {
            return Ok(());
        };

        let path = if target == "latest" {
            match self.checkpoints.latest().await? {
                Some(path) => path,
                None => {
                    info!("no checkpoint to resume from; starting fresh");
                    return Ok(());
                }
            }
        } else {
            PathBuf::from(target)
        };

        // VarMap clones share storage, so this loads into the model's variables
        let mut var_map = self.model.var_map().clone();
        let restored = self.checkpoints.load(&path, &mut var_map).await?;
        let moments = self
            .checkpoints
            .load_optimizer(&path, &mut self.optimizer, &restored)
            .await?;

        self.state.global_step = restored.global_step;
        self.state.epoch = restored.epoch;
        self.state.batches_in_epoch = restored.batches_in_epoch;
        self.state.optimizer_steps = self.optimizer.step_count();
        self.state.last_loss = restored.last_loss;
        self.scheduler.set_step(restored.global_step);
        info!(
            step = restored.global_step,
            epoch = restored.epoch,
            optimizer_steps = restored.optimizer_steps,
            moments,
            "resumed from checkpoint"
        );
        self.send_event(TrainingEvent::Resumed {
            path,
            step: restored.global_step,
        });
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.state.global_step >= self.state.total_steps
    }

    fn skips_bad_batches(&self) -> bool {
        self.config.training.non_finite_policy == NonFinitePolicy::SkipBatch
    }

    fn fractional_epoch(&self) -> f64 {
        let per_epoch = self.train_loader.num_batches().max(1) as f64;
        self.state.epoch as f64 + self.state.batches_in_epoch as f64 / per_epoch
    }

    fn last_eval_metrics(&self) -> Option<BTreeMap<String, f64>> {
        self.last_eval_step?;
        self.metrics
            .history()
            .into_iter()
            .rev()
            .find(|r| r.metrics.keys().any(|k| k.starts_with("eval_")))
            .map(|r| r.metrics)
    }

    fn partial_output_dir(&self) -> PathBuf {
        let mut name: OsString = self.config.training.output_dir.clone().into_os_string();
        name.push("_partial");
        PathBuf::from(name)
    }

    async fn export(&mut self, record: &LogRecord) {
        for exporter in self.exporters.iter_mut() {
            if let Err(e) = exporter.export(record).await {
                warn!(exporter = exporter.name(), error = %e, "metrics export failed");
            }
        }
    }

    async fn flush_exporters(&mut self) {
        for exporter in self.exporters.iter_mut() {
            if let Err(e) = exporter.flush().await {
                warn!(exporter = exporter.name(), error = %e, "metrics flush failed");
            }
        }
    }

    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
