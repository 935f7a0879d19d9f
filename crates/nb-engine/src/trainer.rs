//! The training boundary and its reference CPU implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nb_data::{Batch, DataSource};
use nb_types::{
    config_error, ArchitectureDescriptor, DataError, Device, EpochMetrics, NbResult, ScoreKind,
    SearchSpaceConfig, TrainingBudget, TrainingError,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::metrics::{argmax, bce_with_logits, sigmoid, softmax_cross_entropy, ScoreTracker};
use crate::model::{Adam, Mlp};

/// Cooperative cancellation flag shared between the launcher and a worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Trains one architecture under a fixed budget.
///
/// Errors are local to the architecture; the driver records them and moves
/// on, except [`TrainingError::Cancelled`] which stops the worker.
pub trait Trainer: Send {
    fn train(
        &mut self,
        arch: &ArchitectureDescriptor,
        budget: &TrainingBudget,
        data: &dyn DataSource,
    ) -> Result<Vec<EpochMetrics>, TrainingError>;

    fn score_kind(&self) -> ScoreKind;

    /// Reject devices this trainer cannot run on, before any training.
    fn check_device(&self, _device: &Device) -> NbResult<()> {
        Ok(())
    }
}

/// Reference trainer: [`Mlp`] with Adam, evaluated each epoch.
#[derive(Debug, Clone)]
pub struct MlpTrainer {
    space: SearchSpaceConfig,
    cancel: CancelToken,
}

impl MlpTrainer {
    pub fn new(space: SearchSpaceConfig) -> Self {
        Self {
            space,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn binary(&self) -> bool {
        self.space.num_labels == 1
    }

    /// Loss gradient for a forward pass, scaled by the batch mean, plus the
    /// summed loss. Predictions go into `tracker`.
    fn loss_and_grad(
        &self,
        logits: &[f32],
        batch: &Batch,
        tracker: &mut ScoreTracker,
    ) -> Result<(f64, Vec<f32>), TrainingError> {
        let rows = batch.size();
        let scale = 1.0 / rows.max(1) as f32;
        let mut loss_sum = 0.0f64;

        if self.binary() {
            let mut grad = Vec::with_capacity(rows);
            let mut probabilities = Vec::with_capacity(rows);
            for (&logit, &label) in logits.iter().zip(&batch.labels) {
                if label != 0.0 && label != 1.0 {
                    return Err(TrainingError::Data(DataError::LoadingFailed {
                        message: format!("label {label} is not a binary 0/1 target"),
                    }));
                }
                let (loss, g) = bce_with_logits(logit, label);
                loss_sum += loss as f64;
                grad.push(g * scale);
                probabilities.push(sigmoid(logit));
            }
            tracker.record_binary(loss_sum, &probabilities, &batch.labels);
            return Ok((loss_sum, grad));
        }

        let classes = self.space.num_labels;
        let mut grad = vec![0.0; logits.len()];
        let mut predicted = Vec::with_capacity(rows);
        for (row, &label) in batch.labels.iter().enumerate() {
            let class = label as usize;
            if label < 0.0 || label.fract() != 0.0 || class >= classes {
                return Err(TrainingError::Data(DataError::LoadingFailed {
                    message: format!("label {label} is not a class index below {classes}"),
                }));
            }
            let span = row * classes..(row + 1) * classes;
            let loss = softmax_cross_entropy(&logits[span.clone()], class, &mut grad[span.clone()]);
            loss_sum += loss as f64;
            predicted.push(argmax(&logits[span]));
        }
        grad.iter_mut().for_each(|g| *g *= scale);
        tracker.record_classes(loss_sum, &predicted, &batch.labels);
        Ok((loss_sum, grad))
    }

    fn evaluate(
        &self,
        model: &Mlp,
        budget: &TrainingBudget,
        data: &dyn DataSource,
    ) -> Result<Option<(f64, f64)>, TrainingError> {
        let Some(batches) = data.valid_batches(budget.batch_size) else {
            return Ok(None);
        };
        let mut tracker = ScoreTracker::new(self.score_kind());
        for batch in batches {
            if self.cancel.is_cancelled() {
                return Err(TrainingError::Cancelled);
            }
            let batch = batch?;
            let pass = model.forward(&batch)?;
            self.loss_and_grad(&pass.logits, &batch, &mut tracker)?;
        }
        if tracker.samples() == 0 {
            return Ok(None);
        }
        Ok(Some((tracker.mean_loss(), tracker.score())))
    }
}

impl Trainer for MlpTrainer {
    fn train(
        &mut self,
        arch: &ArchitectureDescriptor,
        budget: &TrainingBudget,
        data: &dyn DataSource,
    ) -> Result<Vec<EpochMetrics>, TrainingError> {
        let seed = budget.seed ^ arch.index.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut model = Mlp::new(
            self.space.nfeat,
            self.space.nfield,
            self.space.nemb,
            &arch.hidden_layers,
            self.space.num_labels,
            &mut rng,
        )?;
        let mut adam = Adam::new(budget.lr);
        debug!("Model {} has {} parameters", arch.encoding(), model.num_params());

        let mut batches = data.train_batches(budget.batch_size, seed)?;
        let mut metrics = Vec::with_capacity(budget.epoch);

        for epoch in 0..budget.epoch {
            let started = Instant::now();
            let mut tracker = ScoreTracker::new(self.score_kind());

            for iteration in 0..budget.iter_per_epoch {
                if self.cancel.is_cancelled() {
                    return Err(TrainingError::Cancelled);
                }
                let batch = batches.next().ok_or_else(|| DataError::Exhausted {
                    message: format!("after {iteration} of {} iterations", budget.iter_per_epoch),
                })??;

                let pass = model.forward(&batch)?;
                let (loss_sum, grad) = self.loss_and_grad(&pass.logits, &batch, &mut tracker)?;
                let loss = loss_sum / batch.size().max(1) as f64;
                if !loss.is_finite() {
                    return Err(TrainingError::NumericInstability {
                        epoch,
                        iteration,
                        loss,
                    });
                }

                model.zero_grad();
                model.backward(&batch, &pass, &grad);
                model.step(&mut adam);

                if (iteration + 1) % budget.report_freq == 0 {
                    debug!(
                        "{} epoch {} iter {}/{}: loss {:.5}, running {:.5}",
                        arch.encoding(),
                        epoch,
                        iteration + 1,
                        budget.iter_per_epoch,
                        loss,
                        tracker.mean_loss()
                    );
                }
            }

            let valid = self.evaluate(&model, budget, data)?;
            let epoch_metrics = EpochMetrics {
                epoch,
                iterations: budget.iter_per_epoch,
                train_loss: tracker.mean_loss(),
                train_score: tracker.score(),
                valid_loss: valid.map(|(loss, _)| loss),
                valid_score: valid.map(|(_, score)| score),
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            info!(
                "{} epoch {}: train loss {:.5} score {:.4}, valid {:?}",
                arch.encoding(),
                epoch,
                epoch_metrics.train_loss,
                epoch_metrics.train_score,
                epoch_metrics.valid_score
            );
            metrics.push(epoch_metrics);
        }

        Ok(metrics)
    }

    fn score_kind(&self) -> ScoreKind {
        if self.binary() {
            ScoreKind::Auc
        } else {
            ScoreKind::Accuracy
        }
    }

    fn check_device(&self, device: &Device) -> NbResult<()> {
        match device {
            Device::Cpu => Ok(()),
            Device::Accelerator(_) => Err(config_error!(
                "device {device} is unavailable: the MLP trainer runs on cpu only"
            )),
        }
    }
}
