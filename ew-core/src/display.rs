//! Display Formatting Helpers
//!
//! Frontend-agnostic rendering of fused snapshots. A missing reading shows
//! as `--`.

use crate::constants::risk;
use crate::data::FusedState;

/// "31.5°C", or "--°C" before the first reading
pub fn format_temperature(celsius: Option<f64>) -> String {
    match celsius {
        Some(t) => format!("{:.1}°C", t),
        None => "--°C".to_string(),
    }
}

/// "25.0%", or "--%" before the first reading
pub fn format_humidity(percent: Option<f64>) -> String {
    match percent {
        Some(h) => format!("{:.1}%", h),
        None => "--%".to_string(),
    }
}

/// Active warning messages, most urgent first
pub fn active_warnings(state: &FusedState) -> Vec<&'static str> {
    let mut warnings = Vec::with_capacity(3);
    if state.smoke_asserted {
        warnings.push(risk::SMOKE_MESSAGE);
    }
    if !state.risk_message.is_empty() {
        warnings.push(state.risk_message);
    }
    if state.low_humidity {
        warnings.push(risk::LOW_HUMIDITY_MESSAGE);
    }
    warnings
}

/// One-line status summary
pub fn format_status_line(state: &FusedState) -> String {
    format!(
        "temperature {} humidity {} risk {} smoke {} (sensor {}, classifier {})",
        format_temperature(state.temperature),
        format_humidity(state.humidity),
        state.risk_tier,
        if state.smoke_asserted { "yes" } else { "no" },
        state.sensor,
        state.classifier,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{RiskTier, StreamHealth};

    #[test]
    fn test_reading_formats() {
        assert_eq!(format_temperature(Some(31.46)), "31.5°C");
        assert_eq!(format_temperature(None), "--°C");
        assert_eq!(format_humidity(Some(25.0)), "25.0%");
        assert_eq!(format_humidity(None), "--%");
    }

    #[test]
    fn test_warnings_order() {
        let state = FusedState {
            temperature: Some(32.0),
            humidity: Some(25.0),
            smoke_asserted: true,
            risk_tier: RiskTier::Elevated,
            risk_message: risk::ELEVATED_MESSAGE,
            low_humidity: true,
            ..FusedState::initial()
        };
        assert_eq!(
            active_warnings(&state),
            vec![risk::SMOKE_MESSAGE, risk::ELEVATED_MESSAGE, risk::LOW_HUMIDITY_MESSAGE]
        );
        assert!(active_warnings(&FusedState::initial()).is_empty());
    }

    #[test]
    fn test_status_line() {
        let state = FusedState {
            temperature: Some(20.0),
            humidity: Some(50.0),
            classifier: StreamHealth::Ended,
            ..FusedState::initial()
        };
        assert_eq!(
            format_status_line(&state),
            "temperature 20.0°C humidity 50.0% risk none smoke no (sensor open, classifier ended)"
        );
    }
}
