use std::path::{Path, PathBuf};
use std::sync::Arc;

use nb_types::DataError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::batcher::{prefetch, BatchIter, SequentialBatches, ShuffledBatches};
use crate::loaders::{Dataset, LibsvmLoader, Sample};

/// Dataset collaborator handed to trainers.
///
/// Training streams are endless and reshuffled every pass; validation is a
/// single ordered pass, absent when the dataset ships no validation split.
pub trait DataSource: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn nfield(&self) -> usize;

    fn train_batches(&self, batch_size: usize, seed: u64) -> Result<BatchIter, DataError>;

    fn valid_batches(&self, batch_size: usize) -> Option<BatchIter>;

    /// Source description for logs.
    fn config(&self) -> serde_json::Value;
}

/// Training and validation splits held in memory, served through a
/// prefetching producer thread.
#[derive(Debug)]
pub struct InMemorySource {
    name: String,
    nfield: usize,
    train: Arc<Dataset>,
    valid: Option<Arc<Dataset>>,
    prefetch_depth: usize,
    origin: serde_json::Value,
}

impl InMemorySource {
    pub fn new(train: Dataset, valid: Option<Dataset>) -> Self {
        Self {
            name: train.name.clone(),
            nfield: train.nfield,
            origin: serde_json::json!({ "type": "memory" }),
            train: Arc::new(train),
            valid: valid.map(Arc::new),
            prefetch_depth: 2,
        }
    }

    /// Bounded channel depth for the producer thread.
    pub fn with_prefetch_depth(mut self, depth: usize) -> Self {
        self.prefetch_depth = depth.max(1);
        self
    }

    fn with_origin(mut self, origin: serde_json::Value) -> Self {
        self.origin = origin;
        self
    }

    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn valid_len(&self) -> Option<usize> {
        self.valid.as_ref().map(|v| v.len())
    }
}

impl DataSource for InMemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn nfield(&self) -> usize {
        self.nfield
    }

    fn train_batches(&self, batch_size: usize, seed: u64) -> Result<BatchIter, DataError> {
        let stream = ShuffledBatches::new(Arc::clone(&self.train), batch_size, seed)?;
        Ok(prefetch(Box::new(stream), self.prefetch_depth))
    }

    fn valid_batches(&self, batch_size: usize) -> Option<BatchIter> {
        let valid = self.valid.as_ref()?;
        let stream = SequentialBatches::new(Arc::clone(valid), batch_size);
        Some(prefetch(Box::new(stream), self.prefetch_depth))
    }

    fn config(&self) -> serde_json::Value {
        let mut config = self.origin.clone();
        config["train_samples"] = self.train.len().into();
        config["valid_samples"] = self.valid_len().into();
        config
    }
}

/// Loads `{dir}/train.libsvm` and, when present, `{dir}/valid.libsvm`.
#[derive(Debug)]
pub struct LibsvmSource;

impl LibsvmSource {
    pub const TRAIN_FILE: &'static str = "train.libsvm";
    pub const VALID_FILE: &'static str = "valid.libsvm";

    pub fn open<P: AsRef<Path>>(
        dir: P,
        name: &str,
        loader: &LibsvmLoader,
        prefetch_depth: usize,
    ) -> Result<InMemorySource, DataError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(DataError::DatasetNotFound {
                name: format!("{name} (no directory {})", dir.display()),
            });
        }

        let train = loader.load_file(dir.join(Self::TRAIN_FILE), name)?;
        if train.is_empty() {
            return Err(DataError::Empty {
                name: name.to_string(),
            });
        }

        let valid_path: PathBuf = dir.join(Self::VALID_FILE);
        let valid = if valid_path.exists() {
            Some(loader.load_file(&valid_path, name)?)
        } else {
            tracing::warn!(
                "No validation split at {}; validation metrics will be absent",
                valid_path.display()
            );
            None
        };

        Ok(InMemorySource::new(train, valid)
            .with_prefetch_depth(prefetch_depth)
            .with_origin(serde_json::json!({
                "type": "libsvm",
                "directory": dir,
            })))
    }
}

/// Deterministic synthetic tabular data for smoke runs.
///
/// Field `f` draws its feature id from its own slice of `[0, nfeat)`, and
/// labels follow a fixed random linear rule over the ids so the data is
/// learnable.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    pub nfeat: usize,
    pub nfield: usize,
    pub num_classes: usize,
    pub train_rows: usize,
    pub valid_rows: usize,
    pub seed: u64,
}

impl SyntheticSource {
    pub const NAME: &'static str = "synthetic";

    pub fn new(nfeat: usize, nfield: usize) -> Self {
        Self {
            nfeat,
            nfield,
            num_classes: 2,
            train_rows: 2048,
            valid_rows: 512,
            seed: 7,
        }
    }

    pub fn with_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes.max(2);
        self
    }

    pub fn with_rows(mut self, train_rows: usize, valid_rows: usize) -> Self {
        self.train_rows = train_rows;
        self.valid_rows = valid_rows;
        self
    }

    pub fn build(&self, prefetch_depth: usize) -> Result<InMemorySource, DataError> {
        if self.nfeat == 0 || self.nfield == 0 {
            return Err(DataError::LoadingFailed {
                message: format!(
                    "synthetic data needs nfeat and nfield > 0 (nfeat={}, nfield={})",
                    self.nfeat, self.nfield
                ),
            });
        }
        if self.train_rows == 0 {
            return Err(DataError::Empty {
                name: Self::NAME.to_string(),
            });
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let weights: Vec<f32> = (0..self.nfeat).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let train = self.generate(self.train_rows, &weights, &mut rng);
        let valid = (self.valid_rows > 0).then(|| self.generate(self.valid_rows, &weights, &mut rng));

        Ok(InMemorySource::new(train, valid)
            .with_prefetch_depth(prefetch_depth)
            .with_origin(serde_json::json!({
                "type": "synthetic",
                "nfeat": self.nfeat,
                "num_classes": self.num_classes,
                "seed": self.seed,
            })))
    }

    fn generate(&self, rows: usize, weights: &[f32], rng: &mut ChaCha8Rng) -> Dataset {
        let span = (self.nfeat / self.nfield).max(1);
        let samples = (0..rows)
            .map(|_| {
                let ids: Vec<u32> = (0..self.nfield)
                    .map(|f| ((f * span + rng.gen_range(0..span)) % self.nfeat) as u32)
                    .collect();
                let score: f32 = ids.iter().map(|&id| weights[id as usize]).sum();
                let label = if self.num_classes == 2 {
                    if score > 0.0 { 1.0 } else { 0.0 }
                } else {
                    let unit = (score.tanh() + 1.0) / 2.0;
                    ((unit * self.num_classes as f32) as usize).min(self.num_classes - 1) as f32
                };
                Sample {
                    values: vec![1.0; ids.len()],
                    ids,
                    label,
                }
            })
            .collect();

        Dataset {
            name: Self::NAME.to_string(),
            nfield: self.nfield,
            samples,
        }
    }
}
