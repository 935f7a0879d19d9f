//! Launch configuration for one benchmark worker.

use std::path::{Path, PathBuf};

use nb_data::{DataSourceConfig, RetryConfig};
use nb_types::{
    config_error, Device, NbResult, RunIdentity, SearchSpaceConfig, SpaceId, TrainingBudget,
    WorkerAssignment,
};
use serde::{Deserialize, Serialize};

/// Every launch parameter in one flat, immutable struct.
///
/// Missing fields take the defaults of the frappe benchmark runs, so a JSON
/// config file may name any subset of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub search_space: SpaceId,
    pub num_layers: usize,
    pub hidden_choice_len: usize,
    pub nfeat: usize,
    pub nfield: usize,
    pub nemb: usize,
    pub num_labels: usize,

    pub batch_size: usize,
    pub lr: f64,
    pub epoch: usize,
    pub iter_per_epoch: usize,
    pub device: Device,
    pub report_freq: usize,
    pub seed: u64,

    pub dataset: String,
    pub worker_id: usize,
    pub total_workers: usize,
    /// Data-loader threads. Never affects partitioning.
    pub workers: usize,
    pub total_models_per_worker: i64,

    pub base_dir: PathBuf,
    pub result_dir: PathBuf,
    pub log_folder: String,
    pub log_name: String,

    pub pre_partitioned_file: Option<PathBuf>,
    pub retrain: bool,
    pub write_attempts: u32,
    pub write_retry_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let budget = TrainingBudget::default();
        Self {
            search_space: SpaceId::MlpSp,
            num_layers: 4,
            hidden_choice_len: 20,
            nfeat: 5500,
            nfield: 10,
            nemb: 10,
            num_labels: 1,
            batch_size: budget.batch_size,
            lr: budget.lr,
            epoch: budget.epoch,
            iter_per_epoch: budget.iter_per_epoch,
            device: budget.device,
            report_freq: budget.report_freq,
            seed: budget.seed,
            dataset: "frappe".to_string(),
            worker_id: 0,
            total_workers: 1,
            workers: 0,
            total_models_per_worker: -1,
            base_dir: PathBuf::from("./dataset"),
            result_dir: PathBuf::from("./result_base"),
            log_folder: "train_frappe".to_string(),
            log_name: "benchmark_train".to_string(),
            pre_partitioned_file: None,
            retrain: false,
            write_attempts: 3,
            write_retry_delay_ms: 200,
        }
    }
}

impl WorkerConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> NbResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read config file {}: {e}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|e| config_error!("invalid config file {}: {e}", path.display()))
    }

    pub fn space_config(&self) -> SearchSpaceConfig {
        SearchSpaceConfig::new(self.search_space, self.num_layers, self.hidden_choice_len)
            .with_embedding(self.nfeat, self.nfield, self.nemb)
            .with_num_labels(self.num_labels)
    }

    pub fn budget(&self) -> TrainingBudget {
        TrainingBudget {
            epoch: self.epoch,
            iter_per_epoch: self.iter_per_epoch,
            batch_size: self.batch_size,
            lr: self.lr,
            device: self.device,
            report_freq: self.report_freq,
            seed: self.seed,
        }
    }

    pub fn assignment(&self) -> NbResult<WorkerAssignment> {
        WorkerAssignment::new(self.worker_id, self.total_workers, self.total_models_per_worker)
    }

    pub fn run_identity(&self) -> RunIdentity {
        RunIdentity::new(&self.space_config(), &self.dataset, &self.budget())
    }

    pub fn data_source(&self) -> DataSourceConfig {
        DataSourceConfig::new(&self.dataset, &self.base_dir, self.nfeat, self.nfield)
            .with_num_labels(self.num_labels)
            .with_workers(self.workers)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new(self.write_attempts).with_initial_delay(self.write_retry_delay_ms)
    }

    /// `result_dir/log_folder`, shared by every worker of the job.
    pub fn log_dir(&self) -> PathBuf {
        self.result_dir.join(&self.log_folder)
    }

    pub fn result_file(&self, run: &RunIdentity) -> PathBuf {
        self.log_dir().join(format!(
            "{}_{}_{}_worker{}of{}.jsonl",
            self.search_space,
            self.dataset,
            run.short(),
            self.worker_id,
            self.total_workers
        ))
    }

    pub fn log_file(&self, unix_ts: i64) -> PathBuf {
        self.log_dir().join(format!("{}_{}.log", self.log_name, unix_ts))
    }

    /// Fail fast on anything that would make the run meaningless.
    pub fn validate(&self) -> NbResult<()> {
        self.space_config().validate()?;
        self.budget().validate()?;
        self.assignment()?;
        if self.dataset.trim().is_empty() {
            return Err(config_error!("dataset must not be empty"));
        }
        if self.log_folder.trim().is_empty() {
            return Err(config_error!("log_folder must not be empty"));
        }
        if self.write_attempts == 0 {
            return Err(config_error!("write_attempts must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nb_types::NbError;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_frappe_runs() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        let space = config.space_config();
        assert_eq!(space.signature(), "mlp_sp-L4-C20-F5500-f10-e10-o1");
        assert_eq!(config.budget(), TrainingBudget::default());
        assert_eq!(config.assignment().unwrap().cap_limit(), None);
        assert_eq!(config.log_dir(), PathBuf::from("./result_base/train_frappe"));
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(
            &path,
            r#"{"worker_id": 3, "total_workers": 8, "device": "cpu", "lr": 0.01}"#,
        )
        .unwrap();

        let config = WorkerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.worker_id, 3);
        assert_eq!(config.total_workers, 8);
        assert_eq!(config.lr, 0.01);
        assert_eq!(config.nfeat, 5500);
        assert_eq!(config.dataset, "frappe");
    }

    #[test]
    fn unknown_fields_and_bad_values_are_config_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{"wokrer_id": 1}"#).unwrap();
        assert!(matches!(
            WorkerConfig::from_json_file(&path),
            Err(NbError::Config(_))
        ));

        let config = WorkerConfig {
            worker_id: 4,
            total_workers: 4,
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(NbError::Config(_))));

        let config = WorkerConfig {
            total_models_per_worker: -3,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = WorkerConfig {
            epoch: 0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn run_identity_ignores_worker_slot_and_device() {
        let base = WorkerConfig::default();
        let other_slot = WorkerConfig {
            worker_id: 2,
            total_workers: 5,
            report_freq: 1,
            ..WorkerConfig::default()
        };
        assert_eq!(base.run_identity(), other_slot.run_identity());

        let other_budget = WorkerConfig {
            iter_per_epoch: 100,
            ..WorkerConfig::default()
        };
        assert_ne!(base.run_identity(), other_budget.run_identity());
    }

    #[test]
    fn file_layout() {
        let config = WorkerConfig {
            worker_id: 1,
            total_workers: 3,
            result_dir: PathBuf::from("/tmp/results"),
            ..WorkerConfig::default()
        };
        let run = config.run_identity();
        let file = config.result_file(&run);
        assert_eq!(
            file,
            PathBuf::from(format!(
                "/tmp/results/train_frappe/mlp_sp_frappe_{}_worker1of3.jsonl",
                run.short()
            ))
        );
        assert_eq!(
            config.log_file(1_700_000_000),
            PathBuf::from("/tmp/results/train_frappe/benchmark_train_1700000000.log")
        );
    }
}
