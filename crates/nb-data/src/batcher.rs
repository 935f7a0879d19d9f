//! Mini-batch assembly and background prefetching.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};
use nb_types::DataError;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::loaders::Dataset;

/// A mini-batch with row-major `size × nfield` feature ids and values.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub ids: Vec<u32>,
    pub values: Vec<f32>,
    pub labels: Vec<f32>,
    pub nfield: usize,
}

impl Batch {
    fn with_capacity(rows: usize, nfield: usize) -> Self {
        Self {
            ids: Vec::with_capacity(rows * nfield),
            values: Vec::with_capacity(rows * nfield),
            labels: Vec::with_capacity(rows),
            nfield,
        }
    }

    fn push(&mut self, dataset: &Dataset, row: usize) {
        let sample = &dataset.samples[row];
        self.ids.extend_from_slice(&sample.ids);
        self.values.extend_from_slice(&sample.values);
        self.labels.push(sample.label);
    }

    pub fn size(&self) -> usize {
        self.labels.len()
    }
}

/// Stream of batches handed to a trainer.
pub type BatchIter = Box<dyn Iterator<Item = Result<Batch, DataError>> + Send>;

/// Endless stream over a training split, reshuffled on every pass.
///
/// The last batch of a pass may be smaller than `batch_size`.
#[derive(Debug)]
pub struct ShuffledBatches {
    dataset: Arc<Dataset>,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: ChaCha8Rng,
}

impl ShuffledBatches {
    pub fn new(dataset: Arc<Dataset>, batch_size: usize, seed: u64) -> Result<Self, DataError> {
        if dataset.is_empty() {
            return Err(DataError::Empty {
                name: dataset.name.clone(),
            });
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.shuffle(&mut rng);
        Ok(Self {
            dataset,
            batch_size: batch_size.max(1),
            order,
            cursor: 0,
            rng,
        })
    }
}

impl Iterator for ShuffledBatches {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let mut batch = Batch::with_capacity(end - self.cursor, self.dataset.nfield);
        for &row in &self.order[self.cursor..end] {
            batch.push(&self.dataset, row);
        }
        self.cursor = end;
        Some(Ok(batch))
    }
}

/// One ordered pass over a split, used for evaluation.
#[derive(Debug)]
pub struct SequentialBatches {
    dataset: Arc<Dataset>,
    batch_size: usize,
    cursor: usize,
}

impl SequentialBatches {
    pub fn new(dataset: Arc<Dataset>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }
}

impl Iterator for SequentialBatches {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.dataset.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.dataset.len());
        let mut batch = Batch::with_capacity(end - self.cursor, self.dataset.nfield);
        for row in self.cursor..end {
            batch.push(&self.dataset, row);
        }
        self.cursor = end;
        Some(Ok(batch))
    }
}

/// Batches produced on a background thread and handed over through a
/// bounded channel of `depth` slots.
///
/// The producer stops as soon as the consumer is dropped.
#[derive(Debug)]
pub struct Prefetched {
    rx: Receiver<Result<Batch, DataError>>,
}

impl Iterator for Prefetched {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Move batch production for `source` onto a producer thread.
pub fn prefetch(source: BatchIter, depth: usize) -> BatchIter {
    let (tx, rx) = bounded(depth.max(1));
    let spawned = thread::Builder::new()
        .name("nb-prefetch".into())
        .spawn(move || {
            for item in source {
                if tx.send(item).is_err() {
                    break;
                }
            }
        });

    match spawned {
        Ok(_) => Box::new(Prefetched { rx }),
        Err(e) => {
            tracing::warn!("Prefetch thread unavailable, loading inline: {}", e);
            Box::new(std::iter::once(Err(DataError::LoadingFailed {
                message: format!("failed to spawn prefetch thread: {e}"),
            })))
        }
    }
}
