//! Emberwatch Core Library
//!
//! Fire-risk monitoring by fusing two producer streams: temperature and
//! humidity samples from a serial sensor board, and smoke verdicts from an
//! image classifier.
//!
//! # Features
//!
//! - **Stream framing**: Non-blocking newline framing over child pipes
//! - **Smoke debouncing**: Alert only after consecutive confident verdicts
//! - **Risk tiers**: Threshold classification of temperature and humidity
//! - **Supervision**: Producer lifecycle with graceful then forced shutdown
//! - **Configuration**: JSON settings with defaults and atomic save
//!
//! # Module Structure
//!
//! - `io/` - Line reader and byte sources (pipes, channels)
//! - `engine/` - Verdict parsing, debouncing, risk evaluation, fusion loop
//! - `hw/` - Serial link to the sensor board
//! - `data/` - Shared data types
//!
//! # Example
//!
//! ```no_run
//! use ew_core::{channel, FusionLoop};
//!
//! let (sensor_tx, sensor) = channel();
//! let (_classifier_tx, classifier) = channel();
//! let mut fusion = FusionLoop::new(Box::new(sensor), Box::new(classifier));
//!
//! sensor_tx.send(b"{\"temperature\": 32.0, \"humidity\": 25.0}\n".to_vec()).unwrap();
//! let state = fusion.tick().state;
//! assert!(state.low_humidity);
//! ```

// Grouped modules
pub mod data;
pub mod engine;
pub mod hw;
pub mod io;

// Standalone modules
pub mod constants;
pub mod display;
pub mod error;
pub mod settings;
pub mod shutdown;
pub mod supervisor;

// Re-export primary types from data/
pub use data::{FusedState, ProducerKind, RiskTier, SensorSample, StreamHealth};

// Re-export error types
pub use error::{DecodeError, EmberwatchError, Result};

// Re-export engine types
pub use engine::{
    evaluate, parse_verdict, run_fusion_loop, BoxedSource, ClassifierVerdict, DebouncePhase,
    DebounceState, FusionConfig, FusionLoop, FusionStats, RestartPolicy, RiskAssessment,
    SmokeDebouncer, TickOutcome, VerdictLabel,
};

// Re-export stream plumbing
pub use io::{channel, ChannelSink, ChannelSource, FramedLineReader, PipeEnd, PipeSource, PolledLines, ReaderState};

// Re-export hardware access
pub use hw::{parse_literal, SampleFramer, SerialPort};

// Re-export process supervision
pub use shutdown::ShutdownSignal;
pub use supervisor::{ChildSupervisor, ProducerExit, ProducerSpec, StopReport, SupervisorConfig};

// Re-export settings functions
pub use settings::{
    load_settings, load_settings_from, resolve_settings_path, save_settings,
    ClassifierSettings, CleanupSettings, GeneralSettings, SensorSettings, Settings,
};

// Re-export display formatting functions
pub use display::{active_warnings, format_humidity, format_status_line, format_temperature};
