use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use nb_types::{PersistenceError, RunId, TrainingResult};
use serde::{Deserialize, Serialize};

use crate::storage::scan_results;

/// Merged view of every worker's result log, keyed by architecture encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkTable {
    pub entries: BTreeMap<String, TrainingResult>,
    #[serde(skip)]
    pub files_read: usize,
    #[serde(skip)]
    pub records_read: usize,
    #[serde(skip)]
    pub skipped_lines: usize,
}

impl BenchmarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one record. A completed record always beats a failed one;
    /// otherwise the later `recorded_at` wins.
    pub fn insert(&mut self, result: TrainingResult) {
        self.records_read += 1;
        match self.entries.get(&result.arch) {
            Some(existing) if Self::supersedes(existing, &result) => {}
            _ => {
                self.entries.insert(result.arch.clone(), result);
            }
        }
    }

    fn supersedes(existing: &TrainingResult, candidate: &TrainingResult) -> bool {
        match (existing.is_completed(), candidate.is_completed()) {
            (true, false) => true,
            (false, true) => false,
            _ => existing.recorded_at > candidate.recorded_at,
        }
    }

    /// Read every `*.jsonl` file in `dir`, optionally keeping only one run.
    pub fn from_dir<P: AsRef<Path>>(dir: P, run: Option<RunId>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref();
        let read_err = |e: std::io::Error| PersistenceError::ReadFailed {
            path: dir.to_path_buf(),
            message: e.to_string(),
        };

        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(read_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        files.sort();

        let mut table = Self::new();
        let mut runs = HashSet::new();
        for file in &files {
            let report = scan_results(file)?;
            table.files_read += 1;
            table.skipped_lines += report.skipped_lines;
            for result in report.results {
                if run.is_some_and(|id| id != result.run_id) {
                    continue;
                }
                runs.insert(result.run_id);
                table.insert(result);
            }
        }

        if runs.len() > 1 {
            tracing::warn!(
                "Merged records from {} different runs in {}",
                runs.len(),
                dir.display()
            );
        }
        tracing::info!(
            "Merged {} records from {} files into {} architectures",
            table.records_read,
            table.files_read,
            table.len()
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn completed(&self) -> usize {
        self.entries.values().filter(|r| r.is_completed()).count()
    }

    pub fn get(&self, arch: &str) -> Option<&TrainingResult> {
        self.entries.get(arch)
    }

    /// Highest final score among completed architectures.
    pub fn best(&self) -> Option<&TrainingResult> {
        self.entries
            .values()
            .filter(|r| r.is_completed())
            .filter_map(|r| r.final_score().map(|s| (s, r)))
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, r)| r)
    }

    /// Write the table as one pretty JSON object.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<(), PersistenceError> {
        let path = path.as_ref();
        let write_err = |message: String| PersistenceError::WriteFailed {
            path: path.to_path_buf(),
            attempts: 1,
            message,
        };
        let json = serde_json::to_string_pretty(&self.entries).map_err(|e| write_err(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| PersistenceError::CreateDirFailed {
                path: parent.to_path_buf(),
                message: e.to_string(),
            })?;
        }
        fs::write(path, json).map_err(|e| write_err(e.to_string()))
    }
}
