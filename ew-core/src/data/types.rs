//! Core data types

use serde::{Deserialize, Serialize};
use std::time::Instant;

use ew_protocol::SensorMessage;

/// The two producers the orchestrator supervises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerKind {
    Sensor,
    Classifier,
}

impl ProducerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProducerKind::Sensor => "sensor",
            ProducerKind::Classifier => "classifier",
        }
    }
}

impl std::fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded temperature/humidity reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: Instant,
}

impl SensorSample {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature,
            humidity,
            timestamp: Instant::now(),
        }
    }

    /// Build a sample from a validated wire message, stamped now.
    /// The message's smoke flag is dropped.
    pub fn from_message(message: &SensorMessage) -> Self {
        Self::new(message.temperature, message.humidity)
    }
}

/// Liveness of one producer stream as seen by the fusion loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamHealth {
    /// Pipe open; data may or may not have arrived yet
    Open,
    /// Producer closed its end; last-known state is frozen
    Ended,
    /// Pipe read failed; producer treated as dead, last-known state is frozen
    Failed,
}

impl StreamHealth {
    pub fn is_open(&self) -> bool {
        matches!(self, StreamHealth::Open)
    }
}

impl std::fmt::Display for StreamHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamHealth::Open => write!(f, "open"),
            StreamHealth::Ended => write!(f, "ended"),
            StreamHealth::Failed => write!(f, "failed"),
        }
    }
}

/// Fire risk tier, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    None,
    Elevated,
    High,
    Extreme,
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskTier::None => write!(f, "none"),
            RiskTier::Elevated => write!(f, "elevated"),
            RiskTier::High => write!(f, "high"),
            RiskTier::Extreme => write!(f, "extreme"),
        }
    }
}

/// The externally visible snapshot, rebuilt from scratch on every tick.
///
/// `Copy` so consumers always hold a complete value, never a view into
/// state the loop is still mutating.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusedState {
    /// Latest temperature (°C); `None` until the first sample arrives
    pub temperature: Option<f64>,
    /// Latest relative humidity (%); `None` until the first sample arrives
    pub humidity: Option<f64>,
    pub smoke_asserted: bool,
    pub risk_tier: RiskTier,
    pub risk_message: &'static str,
    pub low_humidity: bool,
    pub sensor: StreamHealth,
    pub classifier: StreamHealth,
    /// Tick counter of the loop that produced this snapshot
    pub tick: u64,
}

impl FusedState {
    /// Snapshot before any tick has run
    pub fn initial() -> Self {
        Self {
            temperature: None,
            humidity: None,
            smoke_asserted: false,
            risk_tier: RiskTier::None,
            risk_message: "",
            low_humidity: false,
            sensor: StreamHealth::Open,
            classifier: StreamHealth::Open,
            tick: 0,
        }
    }

    pub fn has_reading(&self) -> bool {
        self.temperature.is_some() && self.humidity.is_some()
    }

    /// Whether any warning is active
    pub fn alerting(&self) -> bool {
        self.smoke_asserted || self.risk_tier != RiskTier::None || self.low_humidity
    }

    /// Equal in everything a consumer displays (ignores the tick counter)
    pub fn same_content(&self, other: &FusedState) -> bool {
        FusedState { tick: 0, ..*self } == FusedState { tick: 0, ..*other }
    }
}

impl Default for FusedState {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_quiet() {
        let state = FusedState::initial();
        assert!(!state.has_reading());
        assert!(!state.alerting());
        assert_eq!(state.risk_tier, RiskTier::None);
        assert_eq!(state.risk_message, "");
    }

    #[test]
    fn test_same_content_ignores_tick() {
        let a = FusedState { tick: 4, ..FusedState::initial() };
        let b = FusedState { tick: 9, ..FusedState::initial() };
        assert!(a.same_content(&b));
        let c = FusedState { smoke_asserted: true, ..b };
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_risk_tier_ordering() {
        assert!(RiskTier::Extreme > RiskTier::High);
        assert!(RiskTier::High > RiskTier::Elevated);
        assert!(RiskTier::Elevated > RiskTier::None);
    }

    #[test]
    fn test_snapshot_serializes() {
        let state = FusedState {
            temperature: Some(32.0),
            humidity: Some(25.0),
            risk_tier: RiskTier::Elevated,
            ..FusedState::initial()
        };
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["risk_tier"], "elevated");
        assert_eq!(json["sensor"], "open");
        assert_eq!(json["temperature"], 32.0);
    }

    #[test]
    fn test_sample_from_message_drops_smoke_flag() {
        let msg = SensorMessage { temperature: 20.0, humidity: 50.0, smoke_detected: Some(true) };
        let sample = SensorSample::from_message(&msg);
        assert_eq!(sample.temperature, 20.0);
        assert_eq!(sample.humidity, 50.0);
    }
}
