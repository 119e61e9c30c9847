//! Sensor and classifier stream fusion
//!
//! [`FusionLoop::tick`] is one synchronous, non-blocking step: drain both
//! streams, update the latest reading and the smoke debouncer, rebuild the
//! [`FusedState`] snapshot and hand it to every consumer.
//! [`run_fusion_loop`] drives ticks on a timer and deals with producers whose
//! streams end.
//!
//! # Failure handling
//! - Bad lines are logged (rate-limited) and skipped
//! - A stream that ends keeps its last-known state
//! - A stream whose read fails gets its producer killed, same freeze policy
//! - The restart policy may bring an ended producer back once

use std::collections::HashMap;
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use ew_protocol::decode_sensor_line;

use crate::constants::{limits, timing};
use crate::data::{FusedState, ProducerKind, SensorSample, StreamHealth};
use crate::engine::debounce::SmokeDebouncer;
use crate::engine::risk::{self, RiskAssessment};
use crate::engine::verdict::{parse_verdict, VerdictLabel};
use crate::io::{FramedLineReader, ReaderState};
use crate::shutdown::ShutdownSignal;
use crate::supervisor::{ChildSupervisor, ProducerExit};

/// Any non-blocking byte source the loop can own
pub type BoxedSource = Box<dyn Read + Send>;

/// Consumer invoked with every published snapshot
pub type Consumer = Box<dyn FnMut(&FusedState) + Send>;

/// What to do when a producer's stream ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Keep the last-known state for the rest of the session
    #[default]
    Never,
    /// Restart each producer at most once
    Once,
}

impl RestartPolicy {
    pub fn max_restarts(&self) -> u32 {
        match self {
            RestartPolicy::Never => 0,
            RestartPolicy::Once => 1,
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(RestartPolicy::Never),
            "once" => Ok(RestartPolicy::Once),
            other => Err(format!("unknown restart policy '{}' (expected never or once)", other)),
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::Once => write!(f, "once"),
        }
    }
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub state: FusedState,
    /// Streams that stopped being open during this tick
    pub newly_ended: Vec<ProducerKind>,
}

/// Running counters, mostly for logs and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    pub samples: u64,
    pub verdicts: u64,
    pub rejected_sensor_lines: u64,
    pub unparsable_verdicts: u64,
    pub decode_errors: u64,
}

struct StreamSlot {
    kind: ProducerKind,
    reader: FramedLineReader<BoxedSource>,
    health: StreamHealth,
    errors: u64,
}

impl StreamSlot {
    fn new(kind: ProducerKind, source: BoxedSource) -> Self {
        Self {
            kind,
            reader: FramedLineReader::new(source),
            health: StreamHealth::Open,
            errors: 0,
        }
    }

    /// First occurrence, then every Nth
    fn should_log_error(&mut self) -> bool {
        self.errors += 1;
        self.errors == 1 || self.errors % limits::ERROR_LOG_EVERY == 0
    }
}

pub struct FusionLoop {
    sensor: StreamSlot,
    classifier: StreamSlot,
    debouncer: SmokeDebouncer,
    latest: Option<SensorSample>,
    tick: u64,
    state: FusedState,
    publisher: watch::Sender<FusedState>,
    consumers: Vec<Consumer>,
    stats: FusionStats,
}

impl FusionLoop {
    pub fn new(sensor: BoxedSource, classifier: BoxedSource) -> Self {
        let (publisher, _) = watch::channel(FusedState::initial());
        Self {
            sensor: StreamSlot::new(ProducerKind::Sensor, sensor),
            classifier: StreamSlot::new(ProducerKind::Classifier, classifier),
            debouncer: SmokeDebouncer::new(),
            latest: None,
            tick: 0,
            state: FusedState::initial(),
            publisher,
            consumers: Vec::new(),
            stats: FusionStats::default(),
        }
    }

    /// Receiver of every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<FusedState> {
        self.publisher.subscribe()
    }

    pub fn add_consumer(&mut self, consumer: impl FnMut(&FusedState) + Send + 'static) {
        self.consumers.push(Box::new(consumer));
    }

    /// Replace a stream's source, e.g. after a producer restart.
    /// The latest reading and debounce state carry over.
    pub fn attach(&mut self, kind: ProducerKind, source: BoxedSource) {
        info!(producer = %kind, "Attaching new stream");
        *self.slot_mut(kind) = StreamSlot::new(kind, source);
    }

    pub fn state(&self) -> FusedState {
        self.state
    }

    pub fn health(&self, kind: ProducerKind) -> StreamHealth {
        self.slot(kind).health
    }

    pub fn stats(&self) -> FusionStats {
        self.stats
    }

    pub fn latest_sample(&self) -> Option<SensorSample> {
        self.latest
    }

    pub fn debouncer(&self) -> &SmokeDebouncer {
        &self.debouncer
    }

    fn slot(&self, kind: ProducerKind) -> &StreamSlot {
        match kind {
            ProducerKind::Sensor => &self.sensor,
            ProducerKind::Classifier => &self.classifier,
        }
    }

    fn slot_mut(&mut self, kind: ProducerKind) -> &mut StreamSlot {
        match kind {
            ProducerKind::Sensor => &mut self.sensor,
            ProducerKind::Classifier => &mut self.classifier,
        }
    }

    /// One fusion step. Never blocks.
    pub fn tick(&mut self) -> TickOutcome {
        self.tick += 1;
        let mut newly_ended = Vec::new();

        if self.poll_sensor() {
            newly_ended.push(ProducerKind::Sensor);
        }
        if self.poll_classifier() {
            newly_ended.push(ProducerKind::Classifier);
        }

        let state = self.compute_state();
        self.state = state;
        self.publisher.send_replace(state);
        for consumer in &mut self.consumers {
            consumer(&state);
        }

        TickOutcome { state, newly_ended }
    }

    /// Returns true if the stream closed during this poll
    fn poll_sensor(&mut self) -> bool {
        let slot = &mut self.sensor;
        let polled = slot.reader.poll();

        for line in polled.lines {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    self.stats.decode_errors += 1;
                    if slot.should_log_error() {
                        warn!(producer = %slot.kind, errors = slot.errors, "Dropped sensor line: {}", e);
                    }
                    continue;
                }
            };
            match decode_sensor_line(&line) {
                Ok(message) => {
                    debug!(
                        temperature = message.temperature,
                        humidity = message.humidity,
                        "Sensor sample"
                    );
                    self.latest = Some(SensorSample::from_message(&message));
                    self.stats.samples += 1;
                }
                Err(e) => {
                    self.stats.rejected_sensor_lines += 1;
                    if slot.should_log_error() {
                        warn!(producer = %slot.kind, errors = slot.errors, "Rejected sensor line {:?}: {}", line, e);
                    }
                }
            }
        }

        close_if_ended(slot, polled.closed_now, &polled.state)
    }

    fn poll_classifier(&mut self) -> bool {
        let slot = &mut self.classifier;
        let polled = slot.reader.poll();

        for line in polled.lines {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    self.stats.decode_errors += 1;
                    if slot.should_log_error() {
                        warn!(producer = %slot.kind, errors = slot.errors, "Dropped classifier line: {}", e);
                    }
                    continue;
                }
            };
            debug!(target: "emberwatch::classifier", "{}", line);

            let Some(verdict) = parse_verdict(&line) else { continue };
            self.stats.verdicts += 1;
            if verdict.label == VerdictLabel::Unparsable {
                self.stats.unparsable_verdicts += 1;
                if slot.should_log_error() {
                    warn!(errors = slot.errors, "Unparsable classifier verdict: {:?}", line);
                }
            }

            if self.debouncer.feed(&verdict) {
                if self.debouncer.is_asserted() {
                    info!(confidence = verdict.confidence, "Smoke alert asserted");
                } else {
                    info!("Smoke alert cleared");
                }
            }
        }

        close_if_ended(slot, polled.closed_now, &polled.state)
    }

    fn compute_state(&self) -> FusedState {
        let (temperature, humidity, assessment) = match self.latest {
            Some(sample) => (
                Some(sample.temperature),
                Some(sample.humidity),
                risk::evaluate(sample.temperature, sample.humidity),
            ),
            None => (None, None, RiskAssessment::NONE),
        };

        FusedState {
            temperature,
            humidity,
            smoke_asserted: self.debouncer.is_asserted(),
            risk_tier: assessment.tier,
            risk_message: assessment.message,
            low_humidity: assessment.low_humidity,
            sensor: self.sensor.health,
            classifier: self.classifier.health,
            tick: self.tick,
        }
    }
}

fn close_if_ended(slot: &mut StreamSlot, closed_now: bool, state: &ReaderState) -> bool {
    if !closed_now {
        return false;
    }
    match state {
        ReaderState::Failed { reason } => {
            error!(producer = %slot.kind, "Stream read failed: {}", reason);
            slot.health = StreamHealth::Failed;
        }
        _ => {
            info!(producer = %slot.kind, lines = slot.reader.lines_emitted(), "Stream ended");
            slot.health = StreamHealth::Ended;
        }
    }
    true
}

// ============================================================================
// Async Driver
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionConfig {
    pub tick_interval: Duration,
    pub restart_policy: RestartPolicy,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(timing::DEFAULT_TICK_INTERVAL_MS),
            restart_policy: RestartPolicy::Never,
        }
    }
}

/// A producer whose stream ended but whose exit has not been collected yet
#[derive(Debug, Default)]
struct PendingReap {
    ticks_waited: u32,
    killed: bool,
}

/// Tick until shutdown is requested. Returns the last published snapshot.
///
/// Does not stop the supervisor; the caller does that once this returns.
pub async fn run_fusion_loop(
    mut fusion: FusionLoop,
    supervisor: &ChildSupervisor,
    shutdown: &ShutdownSignal,
    config: FusionConfig,
) -> FusedState {
    let period = config
        .tick_interval
        .max(Duration::from_millis(timing::MIN_TICK_INTERVAL_MS));
    info!(
        tick_ms = period.as_millis() as u64,
        restart_policy = %config.restart_policy,
        "Fusion loop starting"
    );

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending: HashMap<ProducerKind, PendingReap> = HashMap::new();
    let mut restarts: HashMap<ProducerKind, u32> = HashMap::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.wait() => {
                debug!("Fusion loop woken by shutdown");
                break;
            }
        }
        if shutdown.is_triggered() {
            break;
        }

        let outcome = fusion.tick();

        for kind in outcome.newly_ended {
            let mut entry = PendingReap::default();
            if fusion.health(kind) == StreamHealth::Failed {
                // Read side is unusable; the producer is treated as dead
                supervisor.terminate(kind);
                entry.killed = true;
            }
            pending.insert(kind, entry);
        }

        let mut exited = Vec::new();
        for (kind, entry) in pending.iter_mut() {
            if let Some(exit) = supervisor.try_reap(*kind) {
                exited.push(exit);
                continue;
            }
            entry.ticks_waited += 1;
            if entry.ticks_waited >= timing::REAP_GRACE_TICKS && !entry.killed {
                warn!(producer = %kind, "Producer still running after closing its output");
                supervisor.terminate(*kind);
                entry.killed = true;
            }
        }

        for exit in exited {
            pending.remove(&exit.kind);
            log_exit(&exit);

            let used = restarts.entry(exit.kind).or_insert(0);
            if *used >= config.restart_policy.max_restarts() || shutdown.is_triggered() {
                info!(producer = %exit.kind, "Keeping last-known state");
                continue;
            }
            *used += 1;
            match supervisor.restart(exit.kind) {
                Ok(source) => fusion.attach(exit.kind, Box::new(source)),
                Err(e) => error!(producer = %exit.kind, "Restart failed: {}", e),
            }
        }
    }

    let stats = fusion.stats();
    info!(
        ticks = fusion.state().tick,
        samples = stats.samples,
        verdicts = stats.verdicts,
        "Fusion loop stopped"
    );
    fusion.state()
}

fn log_exit(exit: &ProducerExit) {
    if exit.is_anomaly() {
        warn!(producer = %exit.kind, pid = exit.pid, "Producer exited abnormally: {}", exit.describe());
    } else {
        info!(producer = %exit.kind, pid = exit.pid, "Producer exited: {}", exit.describe());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::risk as risk_const;
    use crate::data::RiskTier;
    use crate::io::{channel, ChannelSink};
    use std::sync::{Arc, Mutex};

    fn harness() -> (ChannelSink, ChannelSink, FusionLoop) {
        let (sensor_tx, sensor) = channel();
        let (classifier_tx, classifier) = channel();
        (sensor_tx, classifier_tx, FusionLoop::new(Box::new(sensor), Box::new(classifier)))
    }

    fn send(tx: &ChannelSink, text: &str) {
        tx.send(text.as_bytes().to_vec()).unwrap();
    }

    #[test]
    fn test_initial_tick_has_no_reading() {
        let (_s, _c, mut fusion) = harness();
        let outcome = fusion.tick();
        assert_eq!(outcome.state.tick, 1);
        assert!(!outcome.state.has_reading());
        assert_eq!(outcome.state.risk_tier, RiskTier::None);
        assert!(!outcome.state.low_humidity);
        assert!(outcome.newly_ended.is_empty());
    }

    #[test]
    fn test_smoke_and_risk_fuse() {
        let (sensor, classifier, mut fusion) = harness();
        send(&sensor, "{\"temperature\": 32.0, \"humidity\": 25.0, \"smoke_detected\": false}\n");

        for i in 1..=3 {
            send(&classifier, "Prediction: smoke (90%)\n");
            let state = fusion.tick().state;
            assert_eq!(state.smoke_asserted, i == 3, "tick {}", i);
        }

        let state = fusion.state();
        assert_eq!(state.temperature, Some(32.0));
        assert_eq!(state.humidity, Some(25.0));
        assert_eq!(state.risk_tier, RiskTier::Elevated);
        assert_eq!(state.risk_message, risk_const::ELEVATED_MESSAGE);
        assert!(state.low_humidity);
    }

    #[test]
    fn test_latest_sample_wins_within_tick() {
        let (sensor, _c, mut fusion) = harness();
        send(
            &sensor,
            "{\"temperature\": 20.0, \"humidity\": 50.0}\n{\"temperature\": 41.0, \"humidity\": 10.0}\n",
        );
        let state = fusion.tick().state;
        assert_eq!(state.temperature, Some(41.0));
        assert_eq!(state.risk_tier, RiskTier::Extreme);
        assert_eq!(fusion.stats().samples, 2);
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let (sensor, classifier, mut fusion) = harness();
        send(&sensor, "garbage\n{\"temperature\": 22.0, \"humidity\": 45.0}\n{\"temperature\": 1\n");
        send(&classifier, "loading...\nPrediction: smoke (abc%)\n");
        let state = fusion.tick().state;
        assert_eq!(state.temperature, Some(22.0));
        // The truncated line is still pending, not rejected
        assert_eq!(fusion.stats().rejected_sensor_lines, 1);
        assert_eq!(fusion.stats().unparsable_verdicts, 1);
        assert!(state.sensor.is_open());
    }

    #[test]
    fn test_quiet_tick_carries_state_forward() {
        let (sensor, classifier, mut fusion) = harness();
        send(&sensor, "{\"temperature\": 36.0, \"humidity\": 18.0}\n");
        send(&classifier, "Prediction: smoke (95%)\nPrediction: smoke (95%)\nPrediction: smoke (95%)\n");
        let first = fusion.tick().state;
        let second = fusion.tick().state;
        assert!(first.same_content(&second));
        assert_eq!(second.tick, 2);
        assert!(second.smoke_asserted);
        assert_eq!(second.risk_tier, RiskTier::High);
    }

    #[test]
    fn test_ended_stream_freezes_last_state() {
        let (sensor, classifier, mut fusion) = harness();
        send(&sensor, "{\"temperature\": 31.0, \"humidity\": 28.0}");
        drop(sensor);

        let outcome = fusion.tick();
        assert_eq!(outcome.newly_ended, vec![ProducerKind::Sensor]);
        // Unterminated final line flushed at close
        assert_eq!(outcome.state.temperature, Some(31.0));
        assert_eq!(outcome.state.sensor, StreamHealth::Ended);

        send(&classifier, "Prediction: no_smoke (99%)\n");
        let later = fusion.tick();
        assert!(later.newly_ended.is_empty());
        assert_eq!(later.state.temperature, Some(31.0));
        assert_eq!(later.state.risk_tier, RiskTier::Elevated);
    }

    #[test]
    fn test_attach_reopens_stream() {
        let (sensor, _c, mut fusion) = harness();
        send(&sensor, "{\"temperature\": 25.0, \"humidity\": 40.0}\n");
        drop(sensor);
        fusion.tick();
        assert_eq!(fusion.health(ProducerKind::Sensor), StreamHealth::Ended);

        let (tx, source) = channel();
        fusion.attach(ProducerKind::Sensor, Box::new(source));
        assert_eq!(fusion.health(ProducerKind::Sensor), StreamHealth::Open);
        // Previous reading survives until the new stream delivers
        assert_eq!(fusion.tick().state.temperature, Some(25.0));
        send(&tx, "{\"temperature\": 26.5, \"humidity\": 39.0}\n");
        assert_eq!(fusion.tick().state.temperature, Some(26.5));
    }

    #[test]
    fn test_consumers_and_watch_see_every_tick() {
        let (sensor, _c, mut fusion) = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fusion.add_consumer(move |state| sink.lock().unwrap().push(state.tick));
        let rx = fusion.subscribe();

        fusion.tick();
        send(&sensor, "{\"temperature\": 18.0, \"humidity\": 60.0}\n");
        fusion.tick();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        let latest = *rx.borrow();
        assert_eq!(latest.tick, 2);
        assert_eq!(latest.temperature, Some(18.0));
    }

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!("never".parse::<RestartPolicy>().unwrap(), RestartPolicy::Never);
        assert_eq!(" Once ".parse::<RestartPolicy>().unwrap(), RestartPolicy::Once);
        assert!("always".parse::<RestartPolicy>().is_err());
        assert_eq!(RestartPolicy::default(), RestartPolicy::Never);
        assert_eq!(RestartPolicy::Once.max_restarts(), 1);
        assert_eq!(serde_json::to_string(&RestartPolicy::Once).unwrap(), "\"once\"");
    }

    #[tokio::test]
    async fn test_driver_exits_on_shutdown() {
        let (_s, _c, fusion) = harness();
        let supervisor = ChildSupervisor::new(crate::supervisor::SupervisorConfig {
            sweep_enabled: false,
            ..Default::default()
        });
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let config = FusionConfig {
            tick_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let last = tokio::time::timeout(
            Duration::from_secs(5),
            run_fusion_loop(fusion, &supervisor, &shutdown, config),
        )
        .await
        .expect("loop should stop");
        // The first interval tick fires immediately, but the shutdown check wins
        assert!(last.tick <= 1);
    }
}
