//! Constants and configuration defaults for Emberwatch
//!
//! Centralizes thresholds, paths, timings and limits.
//! Detection thresholds live here as named constants and are not configurable.

use std::time::Duration;

/// File system paths
pub mod paths {
    use std::path::PathBuf;

    /// System-wide configuration directory
    pub const CONFIG_DIR: &str = "/etc/emberwatch";

    /// Configuration file name (both system and user directories)
    pub const CONFIG_FILE: &str = "config.json";

    /// Environment variable overriding the configuration file path
    pub const CONFIG_ENV: &str = "EMBERWATCH_CONFIG";

    /// Default serial device of the sensor board
    pub const DEFAULT_SENSOR_DEVICE: &str = "/dev/ttyACM0";

    /// Default classifier runtime executable
    pub const DEFAULT_CLASSIFIER_PROGRAM: &str = "/usr/local/MATLAB/R2024b/bin/matlab";

    /// Default classifier script
    pub const DEFAULT_CLASSIFIER_SCRIPT: &str = "smoke_detection.m";

    /// Per-user configuration directory
    ///
    /// Honors XDG_CONFIG_HOME, then falls back to the platform config dir.
    pub fn user_config_dir() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(dirs::config_dir)?;
        Some(base.join("emberwatch"))
    }

    /// System configuration file path
    pub fn system_config_file() -> PathBuf {
        PathBuf::from(CONFIG_DIR).join(CONFIG_FILE)
    }
}

/// Smoke verdict debouncing
pub mod debounce {
    /// Consecutive qualifying smoke verdicts required before the alert asserts
    pub const CONSECUTIVE_THRESHOLD: u32 = 3;

    /// Minimum classifier confidence (0.0-1.0) for a smoke verdict to qualify
    pub const CONFIDENCE_CUTOFF: f64 = 0.80;
}

/// Fire risk thresholds (°C and relative humidity %)
pub mod risk {
    pub const EXTREME_MIN_TEMPERATURE: f64 = 40.0;
    pub const EXTREME_MAX_HUMIDITY: f64 = 15.0;

    pub const HIGH_MIN_TEMPERATURE: f64 = 35.0;
    pub const HIGH_MAX_HUMIDITY: f64 = 20.0;

    pub const ELEVATED_MIN_TEMPERATURE: f64 = 30.0;
    pub const ELEVATED_MAX_HUMIDITY: f64 = 30.0;

    /// Humidity strictly below this raises the low-humidity advisory
    pub const LOW_HUMIDITY_ADVISORY: f64 = 30.0;

    pub const EXTREME_MESSAGE: &str = "EXTREME FIRE RISK! High temperature and very low humidity!";
    pub const HIGH_MESSAGE: &str = "HIGH FIRE RISK! High temperature and low humidity!";
    pub const ELEVATED_MESSAGE: &str = "ELEVATED FIRE RISK! Watch temperature and humidity levels.";
    pub const LOW_HUMIDITY_MESSAGE: &str = "LOW HUMIDITY WARNING! Look out for fires.";
    pub const SMOKE_MESSAGE: &str = "SMOKE DETECTED! Check for fire hazards!";
}

/// Timing defaults
pub mod timing {
    use super::*;

    /// Fusion loop tick (presentation-facing cadence)
    pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

    /// Smallest accepted tick interval
    pub const MIN_TICK_INTERVAL_MS: u64 = 10;

    /// Sensor producer sample cadence
    pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1000;

    /// Serial read timeout used by the sensor producer
    pub const DEFAULT_SERIAL_TIMEOUT_MS: u64 = 1000;

    /// Grace period between SIGTERM and SIGKILL during shutdown
    pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 3000;

    /// How often stop() re-checks whether children have exited
    pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

    /// Ticks an ended stream may wait for its producer's exit status before
    /// the producer is killed
    pub const REAP_GRACE_TICKS: u32 = 50;
}

/// Stream and framing limits
pub mod limits {
    /// Read chunk size for pipe polling
    pub const READ_CHUNK_BYTES: usize = 4096;

    /// Upper bound on reads per poll so a flooding producer cannot starve the tick
    pub const MAX_READS_PER_POLL: usize = 64;

    /// Lines the sensor framer may skip while waiting for the sync marker
    pub const MAX_SYNC_LINES: usize = 1000;

    /// Log a repeated error on its first occurrence and then every Nth time
    pub const ERROR_LOG_EVERY: u64 = 10;
}

/// Serial line settings
pub mod serial {
    pub const DEFAULT_BAUD_RATE: u32 = 9600;

    /// Baud rates the producer knows how to configure
    pub const SUPPORTED_BAUD_RATES: &[u32] = &[
        1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400,
    ];
}

/// Stray process cleanup
pub mod cleanup {
    /// Command line patterns swept on shutdown
    pub const DEFAULT_SWEEP_PATTERNS: &[&str] = &["matlab", "gst-launch"];

    /// Lists pids whose full command line matches a pattern
    pub const PGREP: &str = "pgrep";
}

/// Process exit codes of the daemon
pub mod exit {
    pub const SUCCESS: i32 = 0;
    /// Startup precondition failed or cleanup could not kill a child
    pub const FAILURE: i32 = 1;
}
