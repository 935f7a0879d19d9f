use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{NbError, NbResult};
use crate::config_error;

/// Registered search spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceId {
    #[serde(rename = "mlp_sp")]
    MlpSp,
}

impl SpaceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MlpSp => "mlp_sp",
        }
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpaceId {
    type Err = NbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mlp_sp" => Ok(Self::MlpSp),
            other => Err(config_error!("unknown search space: {other}")),
        }
    }
}

/// Shape of an enumerable search space plus the model input/output shape
/// handed to the trainer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchSpaceConfig {
    pub space_id: SpaceId,
    pub num_layers: usize,
    pub hidden_choice_len: usize,
    pub nfeat: usize,
    pub nfield: usize,
    pub nemb: usize,
    pub num_labels: usize,
}

impl SearchSpaceConfig {
    pub fn new(space_id: SpaceId, num_layers: usize, hidden_choice_len: usize) -> Self {
        Self {
            space_id,
            num_layers,
            hidden_choice_len,
            nfeat: 5500,
            nfield: 10,
            nemb: 10,
            num_labels: 1,
        }
    }

    pub fn with_embedding(mut self, nfeat: usize, nfield: usize, nemb: usize) -> Self {
        self.nfeat = nfeat;
        self.nfield = nfield;
        self.nemb = nemb;
        self
    }

    pub fn with_num_labels(mut self, num_labels: usize) -> Self {
        self.num_labels = num_labels;
        self
    }

    pub fn validate(&self) -> NbResult<()> {
        let positive = [
            ("num_layers", self.num_layers),
            ("hidden_choice_len", self.hidden_choice_len),
            ("nfeat", self.nfeat),
            ("nfield", self.nfield),
            ("nemb", self.nemb),
            ("num_labels", self.num_labels),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(config_error!("{name} must be positive"));
            }
        }
        Ok(())
    }

    /// Stable textual signature of the space shape, e.g.
    /// `mlp_sp-L4-C20-F5500-f10-e10-o1`.
    pub fn signature(&self) -> String {
        format!(
            "{}-L{}-C{}-F{}-f{}-e{}-o{}",
            self.space_id,
            self.num_layers,
            self.hidden_choice_len,
            self.nfeat,
            self.nfield,
            self.nemb,
            self.num_labels
        )
    }
}

/// Where training runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Device {
    Cpu,
    Accelerator(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Accelerator(id) => write!(f, "cuda:{id}"),
        }
    }
}

impl FromStr for Device {
    type Err = NbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Self::Cpu);
        }
        if s == "cuda" || s == "gpu" {
            return Ok(Self::Accelerator(0));
        }
        let id = s
            .strip_prefix("cuda:")
            .or_else(|| s.strip_prefix("gpu:"))
            .ok_or_else(|| config_error!("unrecognized device: {s}"))?;
        id.parse()
            .map(Self::Accelerator)
            .map_err(|_| config_error!("invalid accelerator id in device: {s}"))
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

impl TryFrom<String> for Device {
    type Error = NbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Fixed compute budget applied to every architecture of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingBudget {
    pub epoch: usize,
    pub iter_per_epoch: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub device: Device,
    /// Log training progress every `report_freq` iterations.
    pub report_freq: usize,
    pub seed: u64,
}

impl Default for TrainingBudget {
    fn default() -> Self {
        Self {
            epoch: 1,
            iter_per_epoch: 200,
            batch_size: 512,
            lr: 0.001,
            device: Device::Cpu,
            report_freq: 30,
            seed: 2023,
        }
    }
}

impl TrainingBudget {
    pub fn with_epochs(mut self, epoch: usize, iter_per_epoch: usize) -> Self {
        self.epoch = epoch;
        self.iter_per_epoch = iter_per_epoch;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn validate(&self) -> NbResult<()> {
        if self.epoch == 0 {
            return Err(config_error!("epoch must be positive"));
        }
        if self.iter_per_epoch == 0 {
            return Err(config_error!("iter_per_epoch must be positive"));
        }
        if self.batch_size == 0 {
            return Err(config_error!("batch_size must be positive"));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(config_error!("lr must be a positive number, got {}", self.lr));
        }
        if self.report_freq == 0 {
            return Err(config_error!("report_freq must be positive"));
        }
        Ok(())
    }

    /// Iterations consumed per architecture.
    pub fn total_iterations(&self) -> usize {
        self.epoch * self.iter_per_epoch
    }
}

/// This worker's slot in the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub worker_id: usize,
    pub total_workers: usize,
    /// Maximum architectures to process; -1 means the whole block.
    pub cap: i64,
}

impl WorkerAssignment {
    pub fn new(worker_id: usize, total_workers: usize, cap: i64) -> NbResult<Self> {
        let assignment = Self {
            worker_id,
            total_workers,
            cap,
        };
        assignment.validate()?;
        Ok(assignment)
    }

    pub fn validate(&self) -> NbResult<()> {
        if self.total_workers == 0 {
            return Err(config_error!("total_workers must be positive"));
        }
        if self.worker_id >= self.total_workers {
            return Err(config_error!(
                "worker_id {} out of range for {} workers",
                self.worker_id,
                self.total_workers
            ));
        }
        if self.cap < -1 {
            return Err(config_error!(
                "total_models_per_worker must be -1 or non-negative, got {}",
                self.cap
            ));
        }
        Ok(())
    }

    /// The cap as a count, `None` when unbounded.
    pub fn cap_limit(&self) -> Option<u64> {
        u64::try_from(self.cap).ok()
    }
}
