//! Command Line Interface

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use ew_core::{load_settings, RestartPolicy, Settings};

#[derive(Parser, Debug)]
#[command(name = "emberwatchd")]
#[command(version)]
#[command(about = "Emberwatch - fire risk monitor fusing sensor and smoke classifier streams")]
#[command(long_about = "Emberwatch - fire risk monitor fusing sensor and smoke classifier streams

Starts a serial sensor producer and a smoke classifier as child processes,
reads both output streams, and reports smoke alerts, fire risk tiers and
low humidity advisories.

EXAMPLES:
    emberwatchd                              Run with the resolved configuration
    emberwatchd run --device /dev/ttyUSB0    Override the sensor device
    emberwatchd run --json                   Print snapshots as JSON lines
    emberwatchd check                        Verify startup preconditions
    emberwatchd config > config.json         Write a default configuration

ENVIRONMENT VARIABLES:
    EMBERWATCH_LOG=debug      Log filter (trace, debug, info, warn, error)
    EMBERWATCH_CONFIG=PATH    Settings file to use

FILES:
    ~/.config/emberwatch/config.json      User settings
    /etc/emberwatch/config.json           System settings")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start both producers and monitor until interrupted (default)
    Run(RunArgs),

    /// Sensor producer: read the serial board and write JSON lines to stdout
    Sensor(SensorArgs),

    /// Check startup preconditions and print the resolved configuration
    Check(ConfigArgs),

    /// Print the default configuration as JSON
    Config,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Settings file (overrides EMBERWATCH_CONFIG and the default locations)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Sensor serial device
    #[arg(long, value_name = "PATH")]
    pub device: Option<PathBuf>,

    /// Fusion tick interval in milliseconds
    #[arg(long, value_name = "MS")]
    pub tick_ms: Option<u64>,

    /// What to do when a producer exits: never or once
    #[arg(long, value_name = "POLICY")]
    pub restart_policy: Option<RestartPolicy>,
}

impl ConfigArgs {
    /// Apply command line overrides on top of loaded settings
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(device) = &self.device {
            settings.sensor.device_path = device.clone();
        }
        if let Some(tick) = self.tick_ms {
            settings.general.tick_interval_ms = tick;
        }
        if let Some(policy) = self.restart_policy {
            settings.general.restart_policy = policy;
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Print each changed snapshot as a JSON line on stdout
    #[arg(long)]
    pub json: bool,

    /// Log to the systemd journal instead of stderr
    #[arg(long)]
    pub journald: bool,

    /// Log filter (overrides EMBERWATCH_LOG)
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SensorArgs {
    /// Settings file used for any value not given on the command line
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Ignore settings files; start from defaults plus the given flags
    #[arg(long, conflicts_with = "config")]
    pub no_config: bool,

    /// Serial device of the sensor board
    #[arg(long, value_name = "PATH")]
    pub device: Option<PathBuf>,

    /// Serial baud rate
    #[arg(long)]
    pub baud: Option<u32>,

    /// Minimum spacing between emitted samples in milliseconds
    #[arg(long, value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Serial read timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Log filter (overrides EMBERWATCH_LOG)
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,
}

impl SensorArgs {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(device) = &self.device {
            settings.sensor.device_path = device.clone();
        }
        if let Some(baud) = self.baud {
            settings.sensor.baud_rate = baud;
        }
        if let Some(interval) = self.interval_ms {
            settings.sensor.sample_interval_ms = interval;
        }
        if let Some(timeout) = self.timeout_ms {
            settings.sensor.read_timeout_ms = timeout;
        }
    }

    /// Settings for the producer: file (unless `--no-config`), then flags
    pub fn resolve(&self) -> anyhow::Result<Settings> {
        let mut settings = if self.no_config {
            Settings::default()
        } else {
            load_settings(self.config.as_deref())
                .context("failed to load settings")?
                .0
        };
        self.apply(&mut settings);
        settings.validate().context("invalid sensor settings")?;
        Ok(settings)
    }

    /// Arguments that make a child `sensor` invocation fully explicit.
    ///
    /// The child reads the same settings file as the parent, or none at all
    /// when the parent ran on defaults.
    pub fn child_args(
        settings: &Settings,
        settings_path: Option<&Path>,
        log_level: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec!["sensor".to_string()];
        match settings_path {
            Some(path) => {
                args.push("--config".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
            None => args.push("--no-config".to_string()),
        }
        args.extend([
            "--device".to_string(),
            settings.sensor.device_path.to_string_lossy().into_owned(),
            "--baud".to_string(),
            settings.sensor.baud_rate.to_string(),
            "--interval-ms".to_string(),
            settings.sensor.sample_interval_ms.to_string(),
            "--timeout-ms".to_string(),
            settings.sensor.read_timeout_ms.to_string(),
        ]);
        if let Some(level) = log_level {
            args.push("--log-level".to_string());
            args.push(level.to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serial_test::serial;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["emberwatchd"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::try_parse_from([
            "emberwatchd",
            "run",
            "--device",
            "/dev/ttyUSB3",
            "--tick-ms",
            "250",
            "--restart-policy",
            "once",
            "--json",
        ])
        .unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert!(args.json);

        let mut settings = Settings::default();
        args.config.apply(&mut settings);
        assert_eq!(settings.sensor.device_path, PathBuf::from("/dev/ttyUSB3"));
        assert_eq!(settings.general.tick_interval_ms, 250);
        assert_eq!(settings.general.restart_policy, RestartPolicy::Once);
    }

    #[test]
    fn test_bad_restart_policy_rejected() {
        assert!(Cli::try_parse_from(["emberwatchd", "run", "--restart-policy", "always"]).is_err());
    }

    fn parse_sensor(args: Vec<String>) -> SensorArgs {
        let cli = Cli::try_parse_from(std::iter::once("emberwatchd".to_string()).chain(args)).unwrap();
        let Some(Commands::Sensor(sensor)) = cli.command else {
            panic!("expected sensor");
        };
        sensor
    }

    #[test]
    fn test_sensor_child_args_round_trip() {
        let mut settings = Settings::default();
        settings.sensor.baud_rate = 115200;
        let sensor = parse_sensor(SensorArgs::child_args(&settings, None, Some("debug")));

        assert!(sensor.no_config);
        assert_eq!(sensor.config, None);
        let mut parsed = Settings::default();
        sensor.apply(&mut parsed);
        assert_eq!(parsed.sensor, settings.sensor);
        assert_eq!(sensor.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_sensor_child_args_pass_settings_file() {
        let settings = Settings::default();
        let path = Path::new("/srv/emberwatch/site.json");
        let sensor = parse_sensor(SensorArgs::child_args(&settings, Some(path), None));
        assert_eq!(sensor.config.as_deref(), Some(path));
        assert!(!sensor.no_config);
    }

    #[test]
    fn test_no_config_conflicts_with_config() {
        assert!(Cli::try_parse_from(["emberwatchd", "sensor", "--no-config", "--config", "a.json"]).is_err());
    }

    #[test]
    #[serial]
    fn test_child_without_settings_file_ignores_environment() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        std::env::set_var(ew_core::constants::paths::CONFIG_ENV, &broken);

        let mut settings = Settings::default();
        settings.sensor.device_path = PathBuf::from("/dev/ttyUSB7");
        let child = parse_sensor(SensorArgs::child_args(&settings, None, None));
        let resolved = child.resolve();

        // Without --no-config the same environment would fail the child
        let mut unpinned = child.clone();
        unpinned.no_config = false;
        let failed = unpinned.resolve();
        std::env::remove_var(ew_core::constants::paths::CONFIG_ENV);

        assert_eq!(resolved.unwrap().sensor, settings.sensor);
        assert!(failed.is_err());
    }

    #[test]
    #[serial]
    fn test_child_reads_parent_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut on_disk = Settings::default();
        on_disk.sensor.read_timeout_ms = 2500;
        ew_core::save_settings(&on_disk, &path).unwrap();

        let child = parse_sensor(SensorArgs::child_args(&on_disk, Some(&path), None));
        let resolved = child.resolve().unwrap();
        assert_eq!(resolved.sensor, on_disk.sensor);
        assert_eq!(resolved.classifier, on_disk.classifier);
    }
}
