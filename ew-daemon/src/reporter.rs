//! Console reporting of fused snapshots
//!
//! Every tick produces a snapshot; the reporter only speaks when something
//! a person would care about changed.

use std::io::{self, Write};
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use ew_core::constants::risk;
use ew_core::{
    format_humidity, format_temperature, FusedState, RiskTier, ShutdownSignal, StreamHealth,
};

pub struct ConsoleReporter {
    last: Option<FusedState>,
    json: bool,
    out: Box<dyn Write + Send>,
    /// Triggered when the JSON reader goes away
    on_closed: Option<Arc<ShutdownSignal>>,
    closed: bool,
    write_failed: bool,
}

impl ConsoleReporter {
    pub fn new(json: bool) -> Self {
        Self {
            last: None,
            json,
            out: Box::new(io::stdout()),
            on_closed: None,
            closed: false,
            write_failed: false,
        }
    }

    /// Write JSON lines somewhere other than stdout
    pub fn with_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.out = out;
        self
    }

    /// Request shutdown once the JSON output is closed
    pub fn shutdown_on_close(mut self, shutdown: Arc<ShutdownSignal>) -> Self {
        self.on_closed = Some(shutdown);
        self
    }

    /// Describe what changed since the previous snapshot
    pub fn observe(&mut self, state: &FusedState) -> Vec<String> {
        let prev = self.last.unwrap_or_else(FusedState::initial);
        let mut events = Vec::new();

        let reading_changed =
            state.temperature != prev.temperature || state.humidity != prev.humidity;
        if reading_changed && state.has_reading() {
            events.push(format!(
                "Reading: {} {}",
                format_temperature(state.temperature),
                format_humidity(state.humidity)
            ));
        }

        if state.smoke_asserted != prev.smoke_asserted {
            events.push(if state.smoke_asserted {
                risk::SMOKE_MESSAGE.to_string()
            } else {
                "Smoke cleared".to_string()
            });
        }

        if state.risk_tier != prev.risk_tier {
            events.push(if state.risk_tier == RiskTier::None {
                "Fire risk cleared".to_string()
            } else {
                state.risk_message.to_string()
            });
        }

        if state.low_humidity != prev.low_humidity {
            events.push(if state.low_humidity {
                risk::LOW_HUMIDITY_MESSAGE.to_string()
            } else {
                "Humidity recovered".to_string()
            });
        }

        for (name, now, before) in [
            ("Sensor", state.sensor, prev.sensor),
            ("Classifier", state.classifier, prev.classifier),
        ] {
            if now != before {
                events.push(format!("{} stream {}", name, now));
            }
        }

        self.last = Some(*state);
        events
    }

    /// Print changes for one snapshot
    pub fn report(&mut self, state: &FusedState) {
        let prev = self.last;
        let events = self.observe(state);
        if events.is_empty() {
            return;
        }

        if self.json {
            if prev.map_or(true, |p| !p.same_content(state)) {
                self.emit_json(state);
            }
            return;
        }

        for event in events {
            if is_alarm(state, &event) {
                warn!("{}", event);
            } else {
                info!("{}", event);
            }
        }
    }

    fn emit_json(&mut self, state: &FusedState) {
        if self.closed {
            return;
        }
        let line = snapshot_json(state);
        let result = writeln!(self.out, "{}", line).and_then(|_| self.out.flush());
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                warn!("JSON output closed, stopping");
                self.closed = true;
                if let Some(shutdown) = &self.on_closed {
                    shutdown.trigger();
                }
            }
            Err(e) => {
                if !self.write_failed {
                    warn!("Failed to write snapshot: {}", e);
                    self.write_failed = true;
                }
            }
        }
    }
}

fn is_alarm(state: &FusedState, event: &str) -> bool {
    event == risk::SMOKE_MESSAGE
        || event == risk::LOW_HUMIDITY_MESSAGE
        || (state.risk_tier != RiskTier::None && event == state.risk_message)
        || event.ends_with(&StreamHealth::Failed.to_string())
}

/// One snapshot as a JSON line
pub fn snapshot_json(state: &FusedState) -> String {
    json!({
        "tick": state.tick,
        "temperature": state.temperature,
        "humidity": state.humidity,
        "smoke": state.smoke_asserted,
        "risk_tier": state.risk_tier,
        "risk_message": state.risk_message,
        "low_humidity": state.low_humidity,
        "alerting": state.alerting(),
        "warnings": ew_core::active_warnings(state),
        "sensor": state.sensor,
        "classifier": state.classifier,
    })
    .to_string()
}
