use std::fs;
use std::path::Path;

use nb_types::DataError;
use rayon::prelude::*;

/// One tabular sample: `nfield` (feature id, value) pairs and a label.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub ids: Vec<u32>,
    pub values: Vec<f32>,
    pub label: f32,
}

/// An in-memory split of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub nfield: usize,
    pub samples: Vec<Sample>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Loader for libsvm-style files: `label id:value id:value ...`.
#[derive(Debug)]
pub struct LibsvmLoader {
    nfeat: usize,
    nfield: usize,
    workers: usize,
}

impl LibsvmLoader {
    pub fn new(nfeat: usize, nfield: usize) -> Self {
        Self {
            nfeat,
            nfield,
            workers: 0,
        }
    }

    /// Parse with a dedicated pool of `workers` threads (0 = current thread).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn load_file<P: AsRef<Path>>(&self, file_path: P, name: &str) -> Result<Dataset, DataError> {
        let path = file_path.as_ref();
        tracing::info!("Loading libsvm data from: {}", path.display());

        if !path.exists() {
            return Err(DataError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path).map_err(|e| DataError::LoadingFailed {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        let lines: Vec<(usize, &str)> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();

        let parse = |&(line_no, line): &(usize, &str)| {
            self.parse_line(line).map_err(|message| DataError::ParseError {
                path: path.to_path_buf(),
                line: line_no + 1,
                message,
            })
        };

        let samples = if self.workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.workers)
                .build()
                .map_err(|e| DataError::LoadingFailed {
                    message: format!("Failed to build loader pool: {}", e),
                })?;
            pool.install(|| lines.par_iter().map(parse).collect::<Result<Vec<_>, _>>())?
        } else {
            lines.iter().map(parse).collect::<Result<Vec<_>, _>>()?
        };

        tracing::info!("Loaded {} samples from libsvm file: {}", samples.len(), path.display());
        Ok(Dataset {
            name: name.to_string(),
            nfield: self.nfield,
            samples,
        })
    }

    fn parse_line(&self, line: &str) -> Result<Sample, String> {
        let mut tokens = line.split_whitespace();
        let label = tokens
            .next()
            .ok_or_else(|| "missing label".to_string())?
            .parse::<f32>()
            .map_err(|e| format!("invalid label: {e}"))?;

        let mut ids = Vec::with_capacity(self.nfield);
        let mut values = Vec::with_capacity(self.nfield);
        for token in tokens {
            let (id, value) = token
                .split_once(':')
                .ok_or_else(|| format!("expected id:value, got '{token}'"))?;
            let id = id
                .parse::<u32>()
                .map_err(|e| format!("invalid feature id '{id}': {e}"))?;
            if id as usize >= self.nfeat {
                return Err(format!("feature id {id} exceeds nfeat={}", self.nfeat));
            }
            let value = value
                .parse::<f32>()
                .map_err(|e| format!("invalid feature value '{value}': {e}"))?;
            ids.push(id);
            values.push(value);
        }

        if ids.len() != self.nfield {
            return Err(format!("expected {} fields, found {}", self.nfield, ids.len()));
        }

        Ok(Sample { ids, values, label })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_lines(lines: &[&str]) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(temp_file, "{line}").unwrap();
        }
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    fn test_libsvm_loading() {
        let file = write_lines(&["1 0:1 12:1 25:0.5", "", "0 3:1 14:1 29:1"]);
        let dataset = LibsvmLoader::new(30, 3).load_file(file.path(), "tiny").unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.nfield, 3);
        assert_eq!(dataset.samples[0].ids, vec![0, 12, 25]);
        assert_eq!(dataset.samples[0].values, vec![1.0, 1.0, 0.5]);
        assert_eq!(dataset.samples[0].label, 1.0);
        assert_eq!(dataset.samples[1].label, 0.0);
    }

    #[test]
    fn test_parallel_loading_matches_sequential() {
        let lines: Vec<String> = (0..500)
            .map(|i| format!("{} {}:1 {}:1", i % 2, i % 10, 10 + i % 10))
            .collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let file = write_lines(&refs);

        let sequential = LibsvmLoader::new(20, 2).load_file(file.path(), "seq").unwrap();
        let parallel = LibsvmLoader::new(20, 2)
            .with_workers(4)
            .load_file(file.path(), "seq")
            .unwrap();
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_malformed_lines_report_position() {
        let file = write_lines(&["1 0:1 1:1", "0 0:1"]);
        let err = LibsvmLoader::new(10, 2).load_file(file.path(), "bad").unwrap_err();
        match err {
            DataError::ParseError { line, .. } => assert_eq!(line, 2),
            other => panic!("Expected ParseError, got: {:?}", other),
        }

        let file = write_lines(&["1 0:1 99:1"]);
        assert!(LibsvmLoader::new(10, 2).load_file(file.path(), "bad").is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = LibsvmLoader::new(10, 2).load_file("/path/that/does/not/exist.libsvm", "x");
        assert!(matches!(result, Err(DataError::FileNotFound { .. })));
    }
}
