use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use nb_types::DataError;

use crate::loaders::LibsvmLoader;
use crate::providers::{DataSource, LibsvmSource, SyntheticSource};

/// Selects and opens the dataset collaborator for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub dataset: String,
    pub base_dir: PathBuf,
    pub nfeat: usize,
    pub nfield: usize,
    pub num_labels: usize,
    /// Loader threads; 0 parses on the calling thread.
    pub workers: usize,
}

impl DataSourceConfig {
    pub fn new(dataset: &str, base_dir: impl Into<PathBuf>, nfeat: usize, nfield: usize) -> Self {
        Self {
            dataset: dataset.to_string(),
            base_dir: base_dir.into(),
            nfeat,
            nfield,
            num_labels: 1,
            workers: 0,
        }
    }

    pub fn with_num_labels(mut self, num_labels: usize) -> Self {
        self.num_labels = num_labels;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn prefetch_depth(&self) -> usize {
        2 * self.workers.max(1)
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.base_dir.join(&self.dataset)
    }

    /// `synthetic` selects the generated source; any other name is a libsvm
    /// directory under `base_dir`.
    pub fn open(&self) -> Result<Box<dyn DataSource>, DataError> {
        let source: Box<dyn DataSource> = if self.dataset == SyntheticSource::NAME {
            let mut synthetic = SyntheticSource::new(self.nfeat, self.nfield);
            if self.num_labels >= 2 {
                synthetic = synthetic.with_classes(self.num_labels);
            }
            Box::new(synthetic.build(self.prefetch_depth())?)
        } else {
            let loader = LibsvmLoader::new(self.nfeat, self.nfield).with_workers(self.workers);
            Box::new(LibsvmSource::open(
                self.dataset_dir(),
                &self.dataset,
                &loader,
                self.prefetch_depth(),
            )?)
        };

        tracing::info!("Opened dataset {}: {}", self.dataset, source.config());
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_synthetic_dataset_needs_no_files() {
        let dir = TempDir::new().unwrap();
        let source = DataSourceConfig::new("synthetic", dir.path(), 200, 4).open().unwrap();
        assert_eq!(source.name(), "synthetic");
        assert_eq!(source.nfield(), 4);
        assert!(source.valid_batches(32).is_some());
    }

    #[test]
    fn test_libsvm_dataset_under_base_dir() {
        let dir = TempDir::new().unwrap();
        let frappe = dir.path().join("frappe");
        std::fs::create_dir(&frappe).unwrap();
        std::fs::write(frappe.join("train.libsvm"), "1 0:1 3:1\n0 1:1 2:1\n").unwrap();

        let config = DataSourceConfig::new("frappe", dir.path(), 4, 2).with_workers(2);
        assert_eq!(config.prefetch_depth(), 4);
        let source = config.open().unwrap();
        assert_eq!(source.name(), "frappe");
        assert!(source.valid_batches(8).is_none());
    }

    #[test]
    fn test_unknown_dataset_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = DataSourceConfig::new("criteo", dir.path(), 10, 2).open().unwrap_err();
        assert!(matches!(err, DataError::DatasetNotFound { .. }));
    }
}
