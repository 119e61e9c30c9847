//! Fire risk classification from temperature and humidity

use crate::constants::risk;
use crate::data::RiskTier;

/// Result of one evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    /// Operator-facing message for the tier; empty for `RiskTier::None`
    pub message: &'static str,
    /// Humidity below the advisory threshold, independent of the tier
    pub low_humidity: bool,
}

impl RiskAssessment {
    pub const NONE: RiskAssessment = RiskAssessment {
        tier: RiskTier::None,
        message: "",
        low_humidity: false,
    };

    pub fn advisory_message(&self) -> Option<&'static str> {
        self.low_humidity.then_some(risk::LOW_HUMIDITY_MESSAGE)
    }
}

/// (tier, min temperature, max humidity, message), most severe first
const RULES: [(RiskTier, f64, f64, &str); 3] = [
    (
        RiskTier::Extreme,
        risk::EXTREME_MIN_TEMPERATURE,
        risk::EXTREME_MAX_HUMIDITY,
        risk::EXTREME_MESSAGE,
    ),
    (
        RiskTier::High,
        risk::HIGH_MIN_TEMPERATURE,
        risk::HIGH_MAX_HUMIDITY,
        risk::HIGH_MESSAGE,
    ),
    (
        RiskTier::Elevated,
        risk::ELEVATED_MIN_TEMPERATURE,
        risk::ELEVATED_MAX_HUMIDITY,
        risk::ELEVATED_MESSAGE,
    ),
];

/// Classify a reading. Total: NaN in either input yields no risk and no advisory.
pub fn evaluate(temperature: f64, humidity: f64) -> RiskAssessment {
    if temperature.is_nan() || humidity.is_nan() {
        return RiskAssessment::NONE;
    }

    let low_humidity = humidity < risk::LOW_HUMIDITY_ADVISORY;

    for (tier, min_temp, max_humidity, message) in RULES {
        if temperature >= min_temp && humidity <= max_humidity {
            return RiskAssessment {
                tier,
                message,
                low_humidity,
            };
        }
    }

    RiskAssessment {
        low_humidity,
        ..RiskAssessment::NONE
    }
}
