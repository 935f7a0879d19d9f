//! # nb-search
//!
//! Search space enumeration and work partitioning for the benchmark workers.
//!
//! Provides the registered architecture spaces (index-addressable, never
//! materialized), the block partitioner that splits a space across
//! independent workers, and pre-partitioned work plans.

mod partition;
mod search;

pub use partition::{assign, PrePartitionedFile, WorkPlan, WorkRange};
pub use search::{
    build_space, count_total, descriptor_at, layer_choices, MlpSpace, SearchSpace,
    DEFAULT_LAYER_CHOICES_10, DEFAULT_LAYER_CHOICES_20,
};
