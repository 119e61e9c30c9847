//! Detection and fusion engine
//!
//! - `verdict`: classifier line parsing
//! - `debounce`: consecutive-verdict smoke alert
//! - `risk`: temperature/humidity fire risk tiers
//! - `fusion`: the per-tick loop combining both streams

pub mod debounce;
pub mod fusion;
pub mod risk;
pub mod verdict;

pub use debounce::{DebouncePhase, DebounceState, SmokeDebouncer};
pub use fusion::{
    run_fusion_loop, BoxedSource, Consumer, FusionConfig, FusionLoop, FusionStats,
    RestartPolicy, TickOutcome,
};
pub use risk::{evaluate, RiskAssessment};
pub use verdict::{parse_verdict, ClassifierVerdict, VerdictLabel};
