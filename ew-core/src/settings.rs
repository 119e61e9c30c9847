//! Daemon Settings
//!
//! Persistent settings stored as JSON. The file is looked up in order:
//! 1. an explicit path (`--config`)
//! 2. `$EMBERWATCH_CONFIG`
//! 3. `~/.config/emberwatch/config.json` (honors XDG_CONFIG_HOME)
//! 4. `/etc/emberwatch/config.json`
//!
//! If none exists, defaults are used.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ew_error::{EmberwatchError, Result};

use crate::constants::{cleanup, paths, serial, timing};
use crate::data::ProducerKind;
use crate::engine::{FusionConfig, RestartPolicy};
use crate::supervisor::{ProducerSpec, SupervisorConfig};

/// Placeholder in classifier arguments replaced by the script path
pub const SCRIPT_PLACEHOLDER: &str = "{script}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub sensor: SensorSettings,

    #[serde(default)]
    pub classifier: ClassifierSettings,

    #[serde(default)]
    pub cleanup: CleanupSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Fusion tick period in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// SIGTERM grace period before producers are killed
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Refuse to start unless running as root
    #[serde(default)]
    pub require_root: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSettings {
    #[serde(default = "default_device_path")]
    pub device_path: PathBuf,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Minimum spacing between samples written by the sensor producer
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// How long a single serial read may wait
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSettings {
    #[serde(default = "default_classifier_program")]
    pub program: PathBuf,

    #[serde(default = "default_classifier_script")]
    pub script: PathBuf,

    /// Arguments passed to `program`; `{script}` is replaced by `script`
    #[serde(default = "default_classifier_args")]
    pub args: Vec<String>,

    #[serde(default = "default_classifier_env")]
    pub env: BTreeMap<String, String>,

    #[serde(default = "default_true")]
    pub own_process_group: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupSettings {
    #[serde(default = "default_true")]
    pub sweep_enabled: bool,

    #[serde(default = "default_sweep_patterns")]
    pub sweep_patterns: Vec<String>,
}

fn default_tick_interval() -> u64 { timing::DEFAULT_TICK_INTERVAL_MS }
fn default_stop_timeout() -> u64 { timing::DEFAULT_STOP_TIMEOUT_MS }
fn default_device_path() -> PathBuf { PathBuf::from(paths::DEFAULT_SENSOR_DEVICE) }
fn default_baud_rate() -> u32 { serial::DEFAULT_BAUD_RATE }
fn default_sample_interval() -> u64 { timing::DEFAULT_SAMPLE_INTERVAL_MS }
fn default_read_timeout() -> u64 { timing::DEFAULT_SERIAL_TIMEOUT_MS }
fn default_classifier_program() -> PathBuf { PathBuf::from(paths::DEFAULT_CLASSIFIER_PROGRAM) }
fn default_classifier_script() -> PathBuf { PathBuf::from(paths::DEFAULT_CLASSIFIER_SCRIPT) }
fn default_true() -> bool { true }

fn default_classifier_args() -> Vec<String> {
    vec![
        "-nodisplay".to_string(),
        "-nosplash".to_string(),
        "-r".to_string(),
        format!(
            "try, run('{}'), catch ME, fprintf('Error: %s\\n', ME.message), end, quit",
            SCRIPT_PLACEHOLDER
        ),
    ]
}

fn default_classifier_env() -> BTreeMap<String, String> {
    // Keeps the runtime from starting its JVM
    BTreeMap::from([("MATLAB_JAVA".to_string(), String::new())])
}

fn default_sweep_patterns() -> Vec<String> {
    cleanup::DEFAULT_SWEEP_PATTERNS.iter().map(|p| p.to_string()).collect()
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            stop_timeout_ms: default_stop_timeout(),
            restart_policy: RestartPolicy::Never,
            require_root: false,
        }
    }
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            baud_rate: default_baud_rate(),
            sample_interval_ms: default_sample_interval(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            program: default_classifier_program(),
            script: default_classifier_script(),
            args: default_classifier_args(),
            env: default_classifier_env(),
            own_process_group: true,
        }
    }
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            sweep_enabled: true,
            sweep_patterns: default_sweep_patterns(),
        }
    }
}

impl Settings {
    /// Reject values the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.general.tick_interval_ms < timing::MIN_TICK_INTERVAL_MS {
            return Err(EmberwatchError::invalid_config(
                "general.tick_interval_ms",
                format!("must be at least {} ms", timing::MIN_TICK_INTERVAL_MS),
            ));
        }
        if self.general.stop_timeout_ms == 0 {
            return Err(EmberwatchError::invalid_config(
                "general.stop_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.sensor.device_path.as_os_str().is_empty() {
            return Err(EmberwatchError::invalid_config("sensor.device_path", "must not be empty"));
        }
        if !serial::SUPPORTED_BAUD_RATES.contains(&self.sensor.baud_rate) {
            return Err(EmberwatchError::invalid_config(
                "sensor.baud_rate",
                format!("{} is not one of {:?}", self.sensor.baud_rate, serial::SUPPORTED_BAUD_RATES),
            ));
        }
        if self.sensor.sample_interval_ms == 0 {
            return Err(EmberwatchError::invalid_config(
                "sensor.sample_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.sensor.read_timeout_ms == 0 {
            return Err(EmberwatchError::invalid_config(
                "sensor.read_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.classifier.program.as_os_str().is_empty() {
            return Err(EmberwatchError::invalid_config("classifier.program", "must not be empty"));
        }
        if self.classifier.script.as_os_str().is_empty() {
            return Err(EmberwatchError::invalid_config("classifier.script", "must not be empty"));
        }
        if self.classifier.env.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(EmberwatchError::invalid_config(
                "classifier.env",
                "variable names must be non-empty and contain no '='",
            ));
        }
        Ok(())
    }

    pub fn fusion_config(&self) -> FusionConfig {
        FusionConfig {
            tick_interval: Duration::from_millis(self.general.tick_interval_ms),
            restart_policy: self.general.restart_policy,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            stop_timeout: Duration::from_millis(self.general.stop_timeout_ms),
            sweep_enabled: self.cleanup.sweep_enabled,
            sweep_patterns: self.cleanup.sweep_patterns.clone(),
        }
    }
}

impl ClassifierSettings {
    /// Arguments with the script placeholder filled in
    pub fn resolved_args(&self) -> Vec<String> {
        let script = self.script.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace(SCRIPT_PLACEHOLDER, &script))
            .collect()
    }

    pub fn producer_spec(&self) -> ProducerSpec {
        let mut spec = ProducerSpec::new(ProducerKind::Classifier, &self.program)
            .args(self.resolved_args())
            .own_process_group(self.own_process_group);
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        spec
    }
}

// ============================================================================
// Load / Save
// ============================================================================

/// Find the settings file to use. `None` means run on defaults.
///
/// Explicit and environment paths must exist; the user and system
/// locations are only used if present.
pub fn resolve_settings_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        return require_existing(path.to_path_buf(), "--config");
    }

    if let Some(value) = std::env::var_os(paths::CONFIG_ENV).filter(|v| !v.is_empty()) {
        return require_existing(PathBuf::from(value), paths::CONFIG_ENV);
    }

    if let Some(dir) = paths::user_config_dir() {
        let user_file = dir.join(paths::CONFIG_FILE);
        if user_file.is_file() {
            return Ok(Some(user_file));
        }
    }

    let system_file = paths::system_config_file();
    if system_file.is_file() {
        return Ok(Some(system_file));
    }

    Ok(None)
}

fn require_existing(path: PathBuf, source: &str) -> Result<Option<PathBuf>> {
    if path.is_file() {
        Ok(Some(path))
    } else {
        Err(EmberwatchError::missing_path(path, format!("settings file from {}", source)))
    }
}

/// Load and validate settings from one file
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let content = fs::read_to_string(path).map_err(|source| EmberwatchError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    let settings: Settings = serde_json::from_str(&content).map_err(|e| {
        EmberwatchError::config(format!("Failed to parse {}: {}", path.display(), e))
    })?;

    settings.validate()?;
    Ok(settings)
}

/// Resolve and load settings. Also returns the file used, if any.
pub fn load_settings(explicit: Option<&Path>) -> Result<(Settings, Option<PathBuf>)> {
    match resolve_settings_path(explicit)? {
        Some(path) => {
            let settings = load_settings_from(&path)?;
            Ok((settings, Some(path)))
        }
        None => Ok((Settings::default(), None)),
    }
}

/// Write settings atomically (temp file, fsync, rename)
pub fn save_settings(settings: &Settings, path: &Path) -> Result<()> {
    use std::io::Write;

    settings.validate()?;

    let json = serde_json::to_string_pretty(settings)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| EmberwatchError::FileWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let temp_path = path.with_extension("json.tmp");
    let write_err = |source| EmberwatchError::FileWrite {
        path: temp_path.clone(),
        source,
    };

    let mut file = fs::File::create(&temp_path).map_err(write_err)?;
    file.write_all(json.as_bytes()).map_err(write_err)?;
    file.write_all(b"\n").map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|source| EmberwatchError::FileWrite {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}
