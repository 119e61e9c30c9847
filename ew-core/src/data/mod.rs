//! Data types shared across the core

mod types;

pub use types::{FusedState, ProducerKind, RiskTier, SensorSample, StreamHealth};
