//! Work partitioning across independent workers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use nb_types::{config_error, NbResult, WorkerAssignment};

use crate::search::SearchSpace;

/// Half-open range of enumeration indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRange {
    pub start: u64,
    pub end: u64,
}

impl WorkRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.start && index < self.end
    }

    /// Truncate to at most `cap` indices; `-1` leaves the range untouched.
    pub fn with_cap(self, cap: i64) -> NbResult<Self> {
        match cap {
            -1 => Ok(self),
            c if c < -1 => Err(config_error!(
                "total_models_per_worker must be -1 or non-negative, got {c}"
            )),
            c => Ok(Self::new(self.start, self.end.min(self.start.saturating_add(c as u64)))),
        }
    }
}

impl std::fmt::Display for WorkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Block partition of `[0, total)`: worker `w` owns
/// `[w * ceil(total / n), min((w + 1) * ceil(total / n), total))`.
pub fn assign(total: u64, worker_id: usize, total_workers: usize) -> NbResult<WorkRange> {
    if total_workers == 0 {
        return Err(config_error!("total_workers must be positive"));
    }
    if worker_id >= total_workers {
        return Err(config_error!(
            "worker_id {worker_id} out of range for {total_workers} workers"
        ));
    }

    let workers = total_workers as u64;
    let block = total.div_ceil(workers);
    let start = (worker_id as u64).saturating_mul(block).min(total);
    let end = start.saturating_add(block).min(total);
    Ok(WorkRange::new(start, end))
}

// ---------------------------------------------------------------------------
// Work plans
// ---------------------------------------------------------------------------

/// Ordered list of indices one worker will visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkPlan {
    /// Contiguous block from the block partition.
    Block(WorkRange),
    /// Explicit indices from a pre-partitioned file, in file order.
    Explicit(Vec<u64>),
}

impl WorkPlan {
    /// Block plan for `assignment` over a space with `total` architectures,
    /// with the assignment's cap applied.
    pub fn block(total: u64, assignment: &WorkerAssignment) -> NbResult<Self> {
        assignment.validate()?;
        let range = assign(total, assignment.worker_id, assignment.total_workers)?
            .with_cap(assignment.cap)?;
        Ok(Self::Block(range))
    }

    /// Explicit plan from `{"<worker_id>": ["8-16-24-32", ...]}`.
    pub fn from_pre_partitioned(
        file: &PrePartitionedFile,
        space: &dyn SearchSpace,
        assignment: &WorkerAssignment,
    ) -> NbResult<Self> {
        assignment.validate()?;
        let encodings = file.archs_for(assignment.worker_id)?;
        let mut indices = encodings
            .iter()
            .map(|encoding| space.index_of(encoding))
            .collect::<NbResult<Vec<u64>>>()?;
        if let Some(cap) = assignment.cap_limit() {
            indices.truncate(usize::try_from(cap).unwrap_or(usize::MAX));
        }
        Ok(Self::Explicit(indices))
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::Block(range) => range.len(),
            Self::Explicit(indices) => indices.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indices(&self) -> Box<dyn Iterator<Item = u64> + '_> {
        match self {
            Self::Block(range) => Box::new(range.start..range.end),
            Self::Explicit(indices) => Box::new(indices.iter().copied()),
        }
    }
}

impl std::fmt::Display for WorkPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block(range) => write!(f, "block {range}"),
            Self::Explicit(indices) => write!(f, "{} pre-partitioned architectures", indices.len()),
        }
    }
}

/// Worker id → architecture encodings, as written by external partitioners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrePartitionedFile {
    pub workers: HashMap<String, Vec<String>>,
}

impl PrePartitionedFile {
    pub fn load<P: AsRef<Path>>(path: P) -> NbResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            config_error!("cannot read pre-partitioned file {}: {e}", path.display())
        })?;
        let file: Self = serde_json::from_str(&raw).map_err(|e| {
            config_error!("invalid pre-partitioned file {}: {e}", path.display())
        })?;
        info!(
            "Loaded pre-partitioned plan for {} workers from {}",
            file.workers.len(),
            path.display()
        );
        Ok(file)
    }

    pub fn archs_for(&self, worker_id: usize) -> NbResult<&[String]> {
        self.workers
            .get(&worker_id.to_string())
            .map(Vec::as_slice)
            .ok_or_else(|| config_error!("pre-partitioned file has no entry for worker {worker_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::MlpSpace;
    use nb_types::{SearchSpaceConfig, SpaceId};

    #[test]
    fn seventeen_over_five() {
        let ranges: Vec<WorkRange> = (0..5).map(|w| assign(17, w, 5).unwrap()).collect();
        assert_eq!(
            ranges,
            vec![
                WorkRange::new(0, 4),
                WorkRange::new(4, 8),
                WorkRange::new(8, 12),
                WorkRange::new(12, 16),
                WorkRange::new(16, 17),
            ]
        );
    }

    #[test]
    fn partition_is_complete_and_disjoint() {
        for total in 1..=60u64 {
            for workers in 1..=12usize {
                let mut owner = vec![None; total as usize];
                for w in 0..workers {
                    let range = assign(total, w, workers).unwrap();
                    assert!(range.start <= range.end);
                    for i in range.start..range.end {
                        assert!(owner[i as usize].is_none(), "overlap at {i}");
                        owner[i as usize] = Some(w);
                    }
                }
                assert!(
                    owner.iter().all(Option::is_some),
                    "gap for total={total} workers={workers}"
                );
            }
        }
    }

    #[test]
    fn more_workers_than_architectures() {
        // block = 2, so workers 3.. get nothing
        assert_eq!(assign(5, 2, 4).unwrap(), WorkRange::new(4, 5));
        assert!(assign(5, 3, 4).unwrap().is_empty());
    }

    #[test]
    fn invalid_assignments() {
        assert!(assign(10, 0, 0).is_err());
        assert!(assign(10, 3, 3).is_err());
    }

    #[test]
    fn cap_semantics() {
        let block = WorkRange::new(10, 20);
        assert_eq!(block.with_cap(-1).unwrap(), block);
        assert_eq!(block.with_cap(3).unwrap().len(), 3);
        assert_eq!(block.with_cap(0).unwrap().len(), 0);
        assert_eq!(block.with_cap(50).unwrap(), block);
        assert!(block.with_cap(-2).is_err());
    }

    #[test]
    fn single_worker_owns_the_full_space() {
        let assignment = WorkerAssignment::new(0, 1, -1).unwrap();
        let plan = WorkPlan::block(160_000, &assignment).unwrap();
        assert_eq!(plan, WorkPlan::Block(WorkRange::new(0, 160_000)));
        assert_eq!(plan.len(), 160_000);
        assert_eq!(plan.indices().next(), Some(0));
    }

    #[test]
    fn pre_partitioned_plan_maps_encodings() {
        let space = MlpSpace::new(SearchSpaceConfig::new(SpaceId::MlpSp, 2, 20)).unwrap();
        let mut file = PrePartitionedFile::default();
        file.workers.insert(
            "1".into(),
            vec!["8-16".into(), "512-512".into(), "8-8".into()],
        );

        let assignment = WorkerAssignment::new(1, 2, 2).unwrap();
        let plan = WorkPlan::from_pre_partitioned(&file, &space, &assignment).unwrap();
        assert_eq!(plan, WorkPlan::Explicit(vec![1, 399]));

        let missing = WorkerAssignment::new(0, 2, -1).unwrap();
        assert!(WorkPlan::from_pre_partitioned(&file, &space, &missing).is_err());
    }

    #[test]
    fn pre_partitioned_file_loads_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("partition.json");
        std::fs::write(&path, r#"{"0": ["8-8", "8-16"], "1": []}"#).unwrap();

        let file = PrePartitionedFile::load(&path).unwrap();
        assert_eq!(file.archs_for(0).unwrap().len(), 2);
        assert!(file.archs_for(1).unwrap().is_empty());

        std::fs::write(&path, "not json").unwrap();
        assert!(PrePartitionedFile::load(&path).is_err());
    }
}
