//! The staged message pipeline: classify → extract → match → evaluate.

pub mod classify;
pub mod extract;
pub mod processor;
pub mod types;

pub use classify::Classifier;
pub use extract::Extractor;
pub use processor::{MessageProcessor, ProcessOutcome};
