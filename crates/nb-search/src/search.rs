//! Search space definitions and deterministic enumeration.

use nb_types::{
    config_error, decode_hidden_layers, validation_error, ArchitectureDescriptor, NbResult,
    SearchSpaceConfig, SpaceId,
};

/// Hidden-unit choices used when a space has 20 options per layer.
pub const DEFAULT_LAYER_CHOICES_20: [usize; 20] = [
    8, 16, 24, 32, // 8
    48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240, 256, // 16
    384, 512,
];

/// Hidden-unit choices used when a space has 10 options per layer.
pub const DEFAULT_LAYER_CHOICES_10: [usize; 10] = [8, 16, 32, 48, 96, 112, 144, 176, 240, 384];

/// Resolve the per-layer choice table for `hidden_choice_len`.
pub fn layer_choices(hidden_choice_len: usize) -> NbResult<Vec<usize>> {
    match hidden_choice_len {
        0 => Err(config_error!("hidden_choice_len must be positive")),
        10 => Ok(DEFAULT_LAYER_CHOICES_10.to_vec()),
        n if n <= DEFAULT_LAYER_CHOICES_20.len() => Ok(DEFAULT_LAYER_CHOICES_20[..n].to_vec()),
        n => Err(config_error!(
            "no registered layer choices for hidden_choice_len={n} (max {})",
            DEFAULT_LAYER_CHOICES_20.len()
        )),
    }
}

// ---------------------------------------------------------------------------
// Search spaces
// ---------------------------------------------------------------------------

/// A finite, totally ordered space of architectures addressable by index.
pub trait SearchSpace: Send + Sync {
    /// Number of architectures in the space.
    fn total(&self) -> u64;

    /// Decode the architecture at `index` without materializing the space.
    fn descriptor_at(&self, index: u64) -> NbResult<ArchitectureDescriptor>;

    /// Inverse of [`SearchSpace::descriptor_at`] for a canonical encoding.
    fn index_of(&self, encoding: &str) -> NbResult<u64>;

    /// Human-readable space name.
    fn name(&self) -> &str;
}

// ---- MLP space ----

/// Uniform-cardinality MLP space: every layer picks one of the same
/// hidden sizes. Index order is lexicographic over the choice tuple with the
/// first layer most significant.
#[derive(Debug, Clone)]
pub struct MlpSpace {
    config: SearchSpaceConfig,
    layer_choices: Vec<usize>,
    total: u64,
}

impl MlpSpace {
    pub fn new(config: SearchSpaceConfig) -> NbResult<Self> {
        config.validate()?;
        let layer_choices = layer_choices(config.hidden_choice_len)?;
        let total = count_mlp(config.hidden_choice_len, config.num_layers)?;
        Ok(Self {
            config,
            layer_choices,
            total,
        })
    }

    pub fn config(&self) -> &SearchSpaceConfig {
        &self.config
    }

    pub fn layer_choices(&self) -> &[usize] {
        &self.layer_choices
    }
}

fn count_mlp(hidden_choice_len: usize, num_layers: usize) -> NbResult<u64> {
    let radix = hidden_choice_len as u64;
    let layers = u32::try_from(num_layers)
        .map_err(|_| config_error!("num_layers={num_layers} is too large"))?;
    radix.checked_pow(layers).ok_or_else(|| {
        config_error!("space {hidden_choice_len}^{num_layers} does not fit in 64 bits")
    })
}

impl SearchSpace for MlpSpace {
    fn total(&self) -> u64 {
        self.total
    }

    fn descriptor_at(&self, index: u64) -> NbResult<ArchitectureDescriptor> {
        if index >= self.total {
            return Err(validation_error!(
                "index {index} out of range for {} with {} architectures",
                self.config.space_id,
                self.total
            ));
        }

        // Mixed-radix decode, least significant digit = last layer.
        let radix = self.layer_choices.len() as u64;
        let layers = self.config.num_layers;
        let mut choices = vec![0u16; layers];
        let mut rest = index;
        for slot in choices.iter_mut().rev() {
            *slot = (rest % radix) as u16;
            rest /= radix;
        }

        let hidden_layers = choices
            .iter()
            .map(|&c| self.layer_choices[c as usize])
            .collect();
        Ok(ArchitectureDescriptor::new(index, choices, hidden_layers))
    }

    fn index_of(&self, encoding: &str) -> NbResult<u64> {
        let hidden = decode_hidden_layers(encoding)?;
        if hidden.len() != self.config.num_layers {
            return Err(validation_error!(
                "'{encoding}' has {} layers, space expects {}",
                hidden.len(),
                self.config.num_layers
            ));
        }

        let radix = self.layer_choices.len() as u64;
        hidden.iter().try_fold(0u64, |acc, size| {
            let choice = self
                .layer_choices
                .iter()
                .position(|c| c == size)
                .ok_or_else(|| validation_error!("layer size {size} is not a choice of this space"))?;
            Ok(acc * radix + choice as u64)
        })
    }

    fn name(&self) -> &str {
        self.config.space_id.as_str()
    }
}

/// Build the registered space for `config.space_id`.
pub fn build_space(config: &SearchSpaceConfig) -> NbResult<Box<dyn SearchSpace>> {
    match config.space_id {
        SpaceId::MlpSp => Ok(Box::new(MlpSpace::new(config.clone())?)),
    }
}

/// Number of architectures in the space described by `config`.
pub fn count_total(config: &SearchSpaceConfig) -> NbResult<u64> {
    Ok(build_space(config)?.total())
}

/// Architecture at `index` in the space described by `config`.
pub fn descriptor_at(config: &SearchSpaceConfig, index: u64) -> NbResult<ArchitectureDescriptor> {
    build_space(config)?.descriptor_at(index)
}
