// NAS benchmark worker engine
// Trainer boundary, reference MLP trainer and the resumable run driver

pub mod config;
pub mod driver;
pub mod metrics;
pub mod model;
pub mod trainer;

pub use config::WorkerConfig;
pub use driver::{open_data, DriverError, DriverState, RunDriver, RunOutcome, RunSummary};
pub use trainer::{CancelToken, MlpTrainer, Trainer};

use nb_types::ErrorKind;

/// Process exit code for a worker that stopped with `kind`.
pub fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Configuration => 2,
        ErrorKind::Persistence => 3,
        ErrorKind::Data | ErrorKind::NumericInstability => 4,
        ErrorKind::Cancelled => 130,
        ErrorKind::Internal => 1,
    }
}
