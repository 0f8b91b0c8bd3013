pub mod engine;
pub mod fingerprint;
pub mod similarity;

// Re-export common types
pub use engine::{DedupEngine, DetectionMethod, DuplicateRecord, IngestOutcome};
pub use fingerprint::Fingerprint;
