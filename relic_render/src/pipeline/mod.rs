//! Polygon flags and the prebuilt pipeline variant tables.

mod flags;
mod table;

pub use flags::{flags_for_index, variant_index, BlendKind, PolyFlags, VARIANT_COUNT};
pub use table::{PipelineVariantTable, TargetConfig, PUSH_CONSTANT_SIZE};
