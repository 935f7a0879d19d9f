use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::NbResult;
use crate::validation_error;

/// One concrete point in a search space.
///
/// `choices` holds the per-layer choice index, `hidden_layers` the resolved
/// number of units for each layer. Descriptors order lexicographically by
/// `choices`, which matches their enumeration `index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchitectureDescriptor {
    pub index: u64,
    pub choices: Vec<u16>,
    pub hidden_layers: Vec<usize>,
}

impl ArchitectureDescriptor {
    pub fn new(index: u64, choices: Vec<u16>, hidden_layers: Vec<usize>) -> Self {
        debug_assert_eq!(choices.len(), hidden_layers.len());
        Self {
            index,
            choices,
            hidden_layers,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.hidden_layers.len()
    }

    /// Canonical id used in result files, e.g. `8-16-24-32`.
    pub fn encoding(&self) -> String {
        encode_hidden_layers(&self.hidden_layers)
    }

    /// Product of the hidden sizes, a cheap proxy for model size.
    pub fn arch_size(&self) -> u128 {
        self.hidden_layers.iter().map(|&h| h as u128).product()
    }
}

impl PartialOrd for ArchitectureDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArchitectureDescriptor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.choices.cmp(&other.choices)
    }
}

impl fmt::Display for ArchitectureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}]", self.index, self.encoding())
    }
}

pub fn encode_hidden_layers(hidden_layers: &[usize]) -> String {
    hidden_layers
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Parse an encoding such as `8-16-24-32` back into hidden sizes.
pub fn decode_hidden_layers(encoding: &str) -> NbResult<Vec<usize>> {
    let encoding = encoding.trim();
    if encoding.is_empty() {
        return Err(validation_error!("empty architecture encoding"));
    }
    encoding
        .split('-')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| validation_error!("invalid layer size '{part}' in '{encoding}'"))
        })
        .collect()
}
