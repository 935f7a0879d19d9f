//! The per-worker run loop: enumerate the assigned architectures, train the
//! ones not yet recorded and persist each outcome before moving on.

use std::fmt;
use std::time::Instant;

use nb_data::{DataSource, ResultRecorder};
use nb_search::{build_space, PrePartitionedFile, SearchSpace, WorkPlan};
use nb_types::{
    ErrorKind, FailureKind, NbError, ResultKey, RunIdentity, TrainingBudget, TrainingError,
    TrainingResult,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::trainer::{CancelToken, Trainer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverState {
    Init,
    Enumerating,
    Training,
    Skipping,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Enumerating => "ENUMERATING",
            Self::Training => "TRAINING",
            Self::Skipping => "SKIPPING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// A failure that aborts the worker, tagged with where it happened.
#[derive(Debug, Error)]
#[error("{stage} failed{}: {source}", .index.map(|i| format!(" at index {i}")).unwrap_or_default())]
pub struct DriverError {
    pub stage: DriverState,
    pub index: Option<u64>,
    #[source]
    pub source: NbError,
}

impl DriverError {
    pub fn at_init(source: NbError) -> Self {
        Self {
            stage: DriverState::Init,
            index: None,
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub plan: String,
    pub assigned: u64,
    pub trained: u64,
    pub failed: u64,
    pub skipped: u64,
    pub outcome: RunOutcome,
    pub elapsed_seconds: f64,
}

/// Open the dataset collaborator for `config`. Failure here is fatal.
pub fn open_data(config: &WorkerConfig) -> Result<Box<dyn DataSource>, DriverError> {
    config
        .data_source()
        .open()
        .map_err(|e| DriverError::at_init(e.into()))
}

pub struct RunDriver<T: Trainer> {
    config: WorkerConfig,
    space: Box<dyn SearchSpace>,
    plan: WorkPlan,
    run: RunIdentity,
    budget: TrainingBudget,
    recorder: ResultRecorder,
    trainer: T,
    data: Box<dyn DataSource>,
    cancel: CancelToken,
    state: DriverState,
}

impl<T: Trainer> RunDriver<T> {
    /// INIT: validate, build the space and this worker's plan, and index the
    /// existing result log.
    pub fn init(
        config: WorkerConfig,
        trainer: T,
        data: Box<dyn DataSource>,
        cancel: CancelToken,
    ) -> Result<Self, DriverError> {
        config.validate().map_err(DriverError::at_init)?;
        let budget = config.budget();
        let assignment = config.assignment().map_err(DriverError::at_init)?;
        trainer
            .check_device(&budget.device)
            .map_err(DriverError::at_init)?;

        let space = build_space(&config.space_config()).map_err(DriverError::at_init)?;
        let plan = match &config.pre_partitioned_file {
            Some(path) => PrePartitionedFile::load(path)
                .and_then(|file| WorkPlan::from_pre_partitioned(&file, space.as_ref(), &assignment)),
            None => WorkPlan::block(space.total(), &assignment),
        }
        .map_err(DriverError::at_init)?;

        let run = config.run_identity();
        let recorder = ResultRecorder::open(config.result_file(&run), config.retry())
            .map_err(|e| DriverError::at_init(e.into()))?;

        info!(
            "Worker {}/{} on {} ({} architectures): {}, run {}",
            config.worker_id,
            config.total_workers,
            space.name(),
            space.total(),
            plan,
            run.run_id
        );
        if config.retrain {
            warn!("Retraining requested: existing records will be superseded");
        }

        Ok(Self {
            config,
            space,
            plan,
            run,
            budget,
            recorder,
            trainer,
            data,
            cancel,
            state: DriverState::Init,
        })
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn plan(&self) -> &WorkPlan {
        &self.plan
    }

    pub fn run_identity(&self) -> &RunIdentity {
        &self.run
    }

    pub fn recorder(&self) -> &ResultRecorder {
        &self.recorder
    }

    fn fail(&mut self, stage: DriverState, index: u64, source: NbError) -> DriverError {
        self.state = DriverState::Failed;
        error!("Worker aborted in {} at index {}: {}", stage, index, source);
        DriverError {
            stage,
            index: Some(index),
            source,
        }
    }

    fn finish(&mut self, mut summary: RunSummary, outcome: RunOutcome, started: Instant) -> RunSummary {
        self.state = match outcome {
            RunOutcome::Done => DriverState::Done,
            RunOutcome::Cancelled => DriverState::Cancelled,
        };
        summary.outcome = outcome;
        summary.elapsed_seconds = started.elapsed().as_secs_f64();
        info!(
            "Worker {} {:?}: {} trained, {} failed, {} skipped of {} in {:.1}s",
            self.config.worker_id,
            outcome,
            summary.trained,
            summary.failed,
            summary.skipped,
            summary.assigned,
            summary.elapsed_seconds
        );
        summary
    }

    /// Process the plan in order. Returns normally when the plan is
    /// exhausted or the run is cancelled.
    pub fn run(&mut self) -> Result<RunSummary, DriverError> {
        let started = Instant::now();
        let mut summary = RunSummary {
            run_id: self.run.run_id.to_string(),
            plan: self.plan.to_string(),
            assigned: self.plan.len(),
            trained: 0,
            failed: 0,
            skipped: 0,
            outcome: RunOutcome::Done,
            elapsed_seconds: 0.0,
        };
        let (worker_id, total_workers) = (self.config.worker_id, self.config.total_workers);
        let score_kind = self.trainer.score_kind();

        self.state = DriverState::Enumerating;
        let plan = self.plan.clone();
        for (position, index) in plan.indices().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(self.finish(summary, RunOutcome::Cancelled, started));
            }

            let arch = self
                .space
                .descriptor_at(index)
                .map_err(|e| self.fail(DriverState::Enumerating, index, e))?;
            let key = ResultKey {
                run_id: self.run.run_id,
                arch: arch.encoding(),
                worker_id,
            };

            if !self.config.retrain && self.recorder.has_result(&key) {
                self.state = DriverState::Skipping;
                summary.skipped += 1;
                debug!("Skipping {} (already recorded)", arch);
                continue;
            }

            self.state = DriverState::Training;
            info!("Training {} ({}/{})", arch, position + 1, summary.assigned);
            let arch_started = Instant::now();
            let outcome = self.trainer.train(&arch, &self.budget, self.data.as_ref());
            let duration = arch_started.elapsed().as_secs_f64();

            let result = match outcome {
                Ok(metrics) => {
                    summary.trained += 1;
                    TrainingResult::completed(
                        &self.run,
                        &arch,
                        worker_id,
                        total_workers,
                        score_kind,
                        metrics,
                        duration,
                    )
                }
                Err(TrainingError::Cancelled) => {
                    warn!("Cancelled while training {}; discarding it", arch);
                    return Ok(self.finish(summary, RunOutcome::Cancelled, started));
                }
                Err(e) => {
                    summary.failed += 1;
                    let kind = FailureKind::from(e.kind());
                    warn!("Training {} failed ({:?}): {}", arch, kind, e);
                    TrainingResult::failed(
                        &self.run,
                        &arch,
                        worker_id,
                        total_workers,
                        score_kind,
                        kind,
                        e.to_string(),
                        duration,
                    )
                }
            };

            self.recorder
                .append(&result)
                .map_err(|e| self.fail(DriverState::Training, index, e.into()))?;
        }

        Ok(self.finish(summary, RunOutcome::Done, started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nb_data::scan_results;
    use nb_types::{ArchitectureDescriptor, EpochMetrics, ResultStatus, ScoreKind};
    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Pulls the budgeted number of batches and returns canned metrics.
    #[derive(Default)]
    struct FakeTrainer {
        trained: Arc<Mutex<Vec<u64>>>,
        batches: Arc<Mutex<Vec<usize>>>,
        fail_on: Option<u64>,
        cancel_on: Option<(u64, CancelToken)>,
        break_log_on: Option<(u64, PathBuf)>,
    }

    impl Trainer for FakeTrainer {
        fn train(
            &mut self,
            arch: &ArchitectureDescriptor,
            budget: &TrainingBudget,
            data: &dyn DataSource,
        ) -> Result<Vec<EpochMetrics>, TrainingError> {
            if let Some((index, token)) = &self.cancel_on {
                if *index == arch.index {
                    token.cancel();
                    return Err(TrainingError::Cancelled);
                }
            }
            if let Some((index, path)) = &self.break_log_on {
                if *index == arch.index {
                    fs::remove_file(path).unwrap();
                    fs::create_dir(path).unwrap();
                }
            }

            let pulled = data
                .train_batches(budget.batch_size, budget.seed)?
                .take(budget.total_iterations())
                .count();
            self.batches.lock().unwrap().push(pulled);
            self.trained.lock().unwrap().push(arch.index);

            if self.fail_on == Some(arch.index) {
                return Err(TrainingError::NumericInstability {
                    epoch: 0,
                    iteration: 3,
                    loss: f64::NAN,
                });
            }
            Ok(vec![EpochMetrics {
                epoch: 0,
                iterations: budget.iter_per_epoch,
                train_loss: 0.3,
                train_score: 0.9,
                valid_loss: Some(0.35),
                valid_score: Some(0.88),
                elapsed_ms: 1,
            }])
        }

        fn score_kind(&self) -> ScoreKind {
            ScoreKind::Auc
        }
    }

    fn config(dir: &Path) -> WorkerConfig {
        WorkerConfig {
            num_layers: 1,
            hidden_choice_len: 10,
            nfeat: 32,
            nfield: 2,
            nemb: 2,
            dataset: "synthetic".into(),
            batch_size: 8,
            iter_per_epoch: 5,
            result_dir: dir.to_path_buf(),
            write_attempts: 2,
            write_retry_delay_ms: 1,
            ..WorkerConfig::default()
        }
    }

    fn driver(config: WorkerConfig, trainer: FakeTrainer) -> RunDriver<FakeTrainer> {
        let data = open_data(&config).unwrap();
        RunDriver::init(config, trainer, data, CancelToken::new()).unwrap()
    }

    fn trained(trainer: &FakeTrainer) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&trainer.trained)
    }

    fn result_file(config: &WorkerConfig) -> PathBuf {
        config.result_file(&config.run_identity())
    }

    #[test]
    fn trains_the_assigned_block_with_full_budget() {
        let dir = TempDir::new().unwrap();
        let config = WorkerConfig {
            worker_id: 1,
            total_workers: 2,
            iter_per_epoch: 200,
            ..config(dir.path())
        };
        let trainer = FakeTrainer::default();
        let (seen, batches) = (trained(&trainer), Arc::clone(&trainer.batches));

        let mut driver = driver(config.clone(), trainer);
        let summary = driver.run().unwrap();

        assert_eq!(summary.outcome, RunOutcome::Done);
        assert_eq!(driver.state(), DriverState::Done);
        assert_eq!((summary.assigned, summary.trained, summary.skipped), (5, 5, 0));
        assert_eq!(*seen.lock().unwrap(), vec![5, 6, 7, 8, 9]);
        assert!(batches.lock().unwrap().iter().all(|&n| n == 200));

        let report = scan_results(result_file(&config)).unwrap();
        assert_eq!(report.results.len(), 5);
        assert!(report.results.iter().all(|r| r.worker_id == 1 && r.is_completed()));
        assert_eq!(report.results[0].arch, "112");
    }

    #[test]
    fn restart_resumes_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let capped = WorkerConfig {
            total_models_per_worker: 3,
            ..config(dir.path())
        };
        let summary = driver(capped, FakeTrainer::default()).run().unwrap();
        assert_eq!(summary.trained, 3);

        let trainer = FakeTrainer::default();
        let seen = trained(&trainer);
        let summary = driver(config(dir.path()), trainer).run().unwrap();
        assert_eq!((summary.trained, summary.skipped), (7, 3));
        assert_eq!(*seen.lock().unwrap(), (3..10).collect::<Vec<u64>>());

        let report = scan_results(result_file(&config(dir.path()))).unwrap();
        let mut indices: Vec<u64> = report.results.iter().map(|r| r.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn truncated_record_is_retrained_once() {
        let dir = TempDir::new().unwrap();
        let capped = |cap| WorkerConfig {
            total_models_per_worker: cap,
            ..config(dir.path())
        };
        driver(capped(2), FakeTrainer::default()).run().unwrap();

        // Simulate a crash halfway through writing the record for index 2.
        let path = result_file(&capped(2));
        let report = scan_results(&path).unwrap();
        let mut partial = report.results[0].clone();
        partial.index = 2;
        partial.arch = "32".into();
        let line = serde_json::to_string(&partial).unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&line.as_bytes()[..line.len() / 3]).unwrap();
        drop(file);

        let trainer = FakeTrainer::default();
        let seen = trained(&trainer);
        let summary = driver(capped(3), trainer).run().unwrap();
        assert_eq!((summary.trained, summary.skipped), (1, 2));
        assert_eq!(*seen.lock().unwrap(), vec![2]);

        let report = scan_results(&path).unwrap();
        assert!(!report.truncated_tail);
        assert_eq!(report.skipped_lines, 0);
        assert_eq!(report.results.len(), 3);
    }

    #[test]
    fn failed_architecture_gets_a_sentinel_and_the_run_continues() {
        let dir = TempDir::new().unwrap();
        let trainer = FakeTrainer {
            fail_on: Some(1),
            ..FakeTrainer::default()
        };
        let summary = driver(config(dir.path()), trainer).run().unwrap();
        assert_eq!((summary.trained, summary.failed), (9, 1));

        let report = scan_results(result_file(&config(dir.path()))).unwrap();
        let sentinel = report.results.iter().find(|r| r.index == 1).unwrap();
        assert!(matches!(
            sentinel.status,
            ResultStatus::Failed {
                kind: FailureKind::NumericInstability,
                ..
            }
        ));
        assert!(sentinel.metrics.is_empty());

        // Sentinels count as recorded on restart...
        let summary = driver(config(dir.path()), FakeTrainer::default()).run().unwrap();
        assert_eq!((summary.trained, summary.skipped), (0, 10));

        // ...unless retraining is forced.
        let retrain = WorkerConfig {
            retrain: true,
            ..config(dir.path())
        };
        let summary = driver(retrain, FakeTrainer::default()).run().unwrap();
        assert_eq!(summary.trained, 10);
        let report = scan_results(result_file(&config(dir.path()))).unwrap();
        assert_eq!(report.results.len(), 20);
    }

    #[test]
    fn cancellation_discards_the_in_flight_architecture() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let token = CancelToken::new();
        let trainer = FakeTrainer {
            cancel_on: Some((2, token.clone())),
            ..FakeTrainer::default()
        };
        let data = open_data(&config).unwrap();
        let mut driver = RunDriver::init(config.clone(), trainer, data, token).unwrap();

        let summary = driver.run().unwrap();
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(driver.state(), DriverState::Cancelled);
        assert_eq!(summary.trained, 2);

        let report = scan_results(result_file(&config)).unwrap();
        let indices: Vec<u64> = report.results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn cancellation_before_start_trains_nothing() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let token = CancelToken::new();
        token.cancel();
        let trainer = FakeTrainer::default();
        let seen = trained(&trainer);
        let data = open_data(&config).unwrap();
        let summary = RunDriver::init(config, trainer, data, token)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn persistence_failure_aborts_with_stage_and_index() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let trainer = FakeTrainer {
            break_log_on: Some((1, result_file(&config))),
            ..FakeTrainer::default()
        };
        let mut driver = driver(config, trainer);

        let err = driver.run().unwrap_err();
        assert_eq!(err.stage, DriverState::Training);
        assert_eq!(err.index, Some(1));
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert_eq!(driver.state(), DriverState::Failed);
        assert!(err.to_string().contains("TRAINING failed at index 1"));
    }

    #[test]
    fn configuration_errors_surface_at_init() {
        let dir = TempDir::new().unwrap();
        let bad = WorkerConfig {
            worker_id: 2,
            total_workers: 2,
            ..config(dir.path())
        };
        let data = open_data(&config(dir.path())).unwrap();
        let err = RunDriver::init(bad, FakeTrainer::default(), data, CancelToken::new())
            .err()
            .unwrap();
        assert_eq!(err.stage, DriverState::Init);
        assert_eq!(err.index, None);
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn missing_dataset_is_fatal_at_init() {
        let dir = TempDir::new().unwrap();
        let config = WorkerConfig {
            dataset: "frappe".into(),
            base_dir: dir.path().join("dataset"),
            ..config(dir.path())
        };
        let err = open_data(&config).err().unwrap();
        assert_eq!(err.stage, DriverState::Init);
        assert_eq!(err.kind(), ErrorKind::Data);
    }

    #[test]
    fn pre_partitioned_plan_is_followed_in_file_order() {
        let dir = TempDir::new().unwrap();
        let plan_path = dir.path().join("plan.json");
        fs::write(&plan_path, r#"{"0": ["16", "8", "384"], "1": ["32"]}"#).unwrap();
        let config = WorkerConfig {
            total_workers: 2,
            total_models_per_worker: 2,
            pre_partitioned_file: Some(plan_path),
            ..config(dir.path())
        };

        let trainer = FakeTrainer::default();
        let seen = trained(&trainer);
        let summary = driver(config, trainer).run().unwrap();
        assert_eq!(summary.assigned, 2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
    }
}
