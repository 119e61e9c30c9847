//! Producer wire formats
//!
//! Both producers talk to the orchestrator over a pipe carrying
//! newline-delimited UTF-8. The sensor producer writes one JSON object per
//! sample; the classifier writes free text with verdict lines mixed in.

use serde::{Deserialize, Serialize};

/// Maximum size of a single line on either pipe (8KB)
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Line terminator on both pipes
pub const LINE_TERMINATOR: u8 = b'\n';

/// Marker that introduces a verdict line in classifier output
pub const VERDICT_MARKER: &str = "Prediction:";

/// Synchronization line emitted by the sensor device before every sample pair
pub const SYNC_MARKER: &str = "start";

/// One sample as written by the sensor producer.
///
/// `smoke_detected` is informational only; the orchestrator computes its own
/// smoke state from classifier verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorMessage {
    pub temperature: f64,
    pub humidity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoke_detected: Option<bool>,
}

impl SensorMessage {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature,
            humidity,
            smoke_detected: Some(false),
        }
    }

    /// Reject values that cannot take part in threshold comparisons.
    ///
    /// Raw readings are otherwise passed through untouched.
    pub fn validate(&self) -> Result<(), String> {
        validate_temperature(self.temperature)?;
        validate_humidity(self.humidity)?;
        Ok(())
    }

    /// Encode as one protocol line, terminator included
    pub fn to_line(&self) -> Result<String, String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| format!("Failed to encode sensor message: {}", e))?;
        line.push(LINE_TERMINATOR as char);
        Ok(line)
    }
}

/// Decode one sensor line (without terminator) and validate its values
pub fn decode_sensor_line(line: &str) -> Result<SensorMessage, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err("Empty sensor line".into());
    }
    if trimmed.len() > MAX_LINE_BYTES {
        return Err(format!("Sensor line too large: {} bytes", trimmed.len()));
    }

    let message: SensorMessage = serde_json::from_str(trimmed)
        .map_err(|e| format!("Malformed sensor message: {}", e))?;
    message.validate()?;
    Ok(message)
}

pub fn validate_temperature(celsius: f64) -> Result<(), String> {
    if !celsius.is_finite() {
        return Err(format!("Temperature is not finite: {}", celsius));
    }
    Ok(())
}

pub fn validate_humidity(percent: f64) -> Result<(), String> {
    if !percent.is_finite() {
        return Err(format!("Humidity is not finite: {}", percent));
    }
    Ok(())
}

/// Whether a classifier line is a candidate verdict line
pub fn is_verdict_candidate(line: &str) -> bool {
    line.contains(VERDICT_MARKER)
}

/// Whether a device line is the synchronization marker
pub fn is_sync_marker(line: &str) -> bool {
    line.trim() == SYNC_MARKER
}
