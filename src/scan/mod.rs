//! The scan pipeline: record types, the detection ladder and escalator, the
//! lifecycle state machine, the restoration worker pool and the engine that
//! ties them together per record.

pub mod engine;
pub mod escalator;
pub mod lifecycle;
pub mod restoration;
pub mod strategy;
pub mod types;

pub use engine::{EngineConfig, EngineError, ScanEngine};
pub use escalator::{escalate, DetectionError, DetectionLog, Escalation, EscalationOptions};
pub use lifecycle::TransitionError;
pub use restoration::{RestorationOutcome, RestorationScheduler, ShardFailure, DEFAULT_CONCURRENCY};
pub use strategy::{default_ladder, DetectionStrategy};
pub use types::{
    DetectedRegion, LogLevel, LogLine, NormalizedBox, ProvisionalScan, RestoredShard, Rotation,
    ScanRecord, ScanStatus, ScanSummary,
};
