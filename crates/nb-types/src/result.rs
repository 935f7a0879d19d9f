//! Per-architecture training records and the keys that identify them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arch::ArchitectureDescriptor;
use crate::config::{SearchSpaceConfig, TrainingBudget};
use crate::errors::ErrorKind;

/// Unique run identifier, derived from everything that changes what a
/// result means.
pub type RunId = Uuid;

/// Deterministic identity of a benchmark run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    pub run_id: RunId,
    pub space_signature: String,
    pub dataset: String,
}

impl RunIdentity {
    pub fn new(space: &SearchSpaceConfig, dataset: &str, budget: &TrainingBudget) -> Self {
        let space_signature = space.signature();
        // Device and report_freq do not change what a result means.
        let name = format!(
            "{space_signature}|{dataset}|epoch={}|iter={}|bs={}|lr={}|seed={}",
            budget.epoch, budget.iter_per_epoch, budget.batch_size, budget.lr, budget.seed
        );
        Self {
            run_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
            space_signature,
            dataset: dataset.to_string(),
        }
    }

    /// Short form used in file names.
    pub fn short(&self) -> String {
        self.run_id.simple().to_string()[..8].to_string()
    }
}

/// Key under which a result is recorded; restarting the same worker with
/// the same configuration reproduces the same keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub run_id: RunId,
    pub arch: String,
    pub worker_id: usize,
}

/// Metrics captured at the end of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 0-based epoch number.
    pub epoch: usize,
    pub iterations: usize,
    pub train_loss: f64,
    /// AUC for single-logit models, accuracy otherwise.
    pub train_score: f64,
    pub valid_loss: Option<f64>,
    pub valid_score: Option<f64>,
    pub elapsed_ms: u64,
}

/// Why an architecture has no usable metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Data,
    NumericInstability,
    Model,
}

impl From<ErrorKind> for FailureKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Data => Self::Data,
            ErrorKind::NumericInstability => Self::NumericInstability,
            _ => Self::Model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed { kind: FailureKind, message: String },
}

/// Which score the metrics carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    Auc,
    Accuracy,
}

/// Result of training one architecture. One JSON line in a worker's result
/// file; never rewritten once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    pub run_id: RunId,
    pub space_signature: String,
    pub dataset: String,
    pub index: u64,
    pub arch: String,
    pub choices: Vec<u16>,
    pub worker_id: usize,
    pub total_workers: usize,
    pub status: ResultStatus,
    pub score_kind: ScoreKind,
    pub metrics: Vec<EpochMetrics>,
    pub duration_seconds: f64,
    pub recorded_at: DateTime<Utc>,
}

impl TrainingResult {
    pub fn completed(
        run: &RunIdentity,
        arch: &ArchitectureDescriptor,
        worker_id: usize,
        total_workers: usize,
        score_kind: ScoreKind,
        metrics: Vec<EpochMetrics>,
        duration_seconds: f64,
    ) -> Self {
        Self {
            run_id: run.run_id,
            space_signature: run.space_signature.clone(),
            dataset: run.dataset.clone(),
            index: arch.index,
            arch: arch.encoding(),
            choices: arch.choices.clone(),
            worker_id,
            total_workers,
            status: ResultStatus::Completed,
            score_kind,
            metrics,
            duration_seconds,
            recorded_at: Utc::now(),
        }
    }

    /// Sentinel record for an architecture whose training aborted.
    pub fn failed(
        run: &RunIdentity,
        arch: &ArchitectureDescriptor,
        worker_id: usize,
        total_workers: usize,
        score_kind: ScoreKind,
        kind: FailureKind,
        message: String,
        duration_seconds: f64,
    ) -> Self {
        let mut result = Self::completed(
            run,
            arch,
            worker_id,
            total_workers,
            score_kind,
            Vec::new(),
            duration_seconds,
        );
        result.status = ResultStatus::Failed { kind, message };
        result
    }

    pub fn key(&self) -> ResultKey {
        ResultKey {
            run_id: self.run_id,
            arch: self.arch.clone(),
            worker_id: self.worker_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ResultStatus::Completed
    }

    /// Validation score of the last epoch, falling back to the training score.
    pub fn final_score(&self) -> Option<f64> {
        let last = self.metrics.last()?;
        Some(last.valid_score.unwrap_or(last.train_score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceId;

    fn sample_run() -> RunIdentity {
        let space = SearchSpaceConfig::new(SpaceId::MlpSp, 4, 20);
        RunIdentity::new(&space, "frappe", &TrainingBudget::default())
    }

    fn sample_arch() -> ArchitectureDescriptor {
        ArchitectureDescriptor::new(42, vec![0, 0, 2, 2], vec![8, 8, 24, 24])
    }

    #[test]
    fn run_identity_is_deterministic() {
        let a = sample_run();
        let b = sample_run();
        assert_eq!(a, b);
        assert_eq!(a.short().len(), 8);

        let space = SearchSpaceConfig::new(SpaceId::MlpSp, 4, 20);
        let other = RunIdentity::new(
            &space,
            "frappe",
            &TrainingBudget::default().with_epochs(2, 200),
        );
        assert_ne!(a.run_id, other.run_id);
    }

    #[test]
    fn device_does_not_change_run_identity() {
        let space = SearchSpaceConfig::new(SpaceId::MlpSp, 4, 20);
        let mut budget = TrainingBudget::default();
        let cpu = RunIdentity::new(&space, "frappe", &budget);
        budget.device = crate::config::Device::Accelerator(0);
        let gpu = RunIdentity::new(&space, "frappe", &budget);
        assert_eq!(cpu.run_id, gpu.run_id);
    }

    #[test]
    fn completed_result_lifecycle() {
        let run = sample_run();
        let metrics = vec![EpochMetrics {
            epoch: 0,
            iterations: 200,
            train_loss: 0.41,
            train_score: 0.88,
            valid_loss: Some(0.43),
            valid_score: Some(0.91),
            elapsed_ms: 1200,
        }];
        let result =
            TrainingResult::completed(&run, &sample_arch(), 0, 1, ScoreKind::Auc, metrics, 1.2);

        assert!(result.is_completed());
        assert_eq!(result.arch, "8-8-24-24");
        assert_eq!(result.final_score(), Some(0.91));
        assert_eq!(
            result.key(),
            ResultKey {
                run_id: run.run_id,
                arch: "8-8-24-24".into(),
                worker_id: 0
            }
        );
    }

    #[test]
    fn failed_result_serializes_its_kind() {
        let result = TrainingResult::failed(
            &sample_run(),
            &sample_arch(),
            3,
            8,
            ScoreKind::Auc,
            FailureKind::NumericInstability,
            "loss diverged".into(),
            0.5,
        );
        assert!(!result.is_completed());
        assert_eq!(result.final_score(), None);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"]["state"], "failed");
        assert_eq!(json["status"]["kind"], "numeric_instability");
        assert_eq!(json["worker_id"], 3);
    }
}
