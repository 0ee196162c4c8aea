//! Dead-letter pipeline
//!
//! Terminally failed work is classified, archived, and left available for
//! inspection, replay, and pruning.

mod classify;
mod pipeline;

pub use classify::classify;
pub use pipeline::{DeadLetterConfig, DeadLetterPipeline, DlqError};
