//! Emberwatch Daemon
//!
//! Supervises the sensor and smoke classifier producers, fuses their output
//! streams, and reports smoke alerts and fire risk.
//!
//! The same binary doubles as the sensor producer (`emberwatchd sensor`),
//! which the orchestrator starts as a child process.

mod cli;
mod preflight;
mod producer;
mod reporter;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use ew_core::constants::{exit, paths};
use ew_core::{
    load_settings, run_fusion_loop, ChildSupervisor, FusionLoop, ProducerKind, ProducerSpec,
    Settings, ShutdownSignal,
};

use cli::{Cli, Commands, ConfigArgs, RunArgs, SensorArgs};
use reporter::ConsoleReporter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LOG_ENV: &str = "EMBERWATCH_LOG";
const JOURNALD_SOCKET: &str = "/run/systemd/journal/socket";

// ============================================================================
// Logging
// ============================================================================

/// Install the global subscriber. Returns whether the journal is in use.
///
/// Stdout carries data in sensor and JSON modes, so the fallback writes to stderr.
fn init_logging(filter: &str, prefer_journald: bool) -> bool {
    use tracing_subscriber::prelude::*;

    if prefer_journald && std::path::Path::new(JOURNALD_SOCKET).exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(filter))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stderr", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();
    false
}

fn log_filter(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_ENV).ok())
        .unwrap_or_else(|| "info".to_string())
}

/// Load settings and apply command line overrides; exits on failure.
///
/// Also returns the file the settings came from, if any.
fn resolve_settings(config: &ConfigArgs) -> (Settings, Option<PathBuf>) {
    match load_settings(config.config.as_deref()) {
        Ok((mut settings, path)) => {
            match &path {
                Some(p) => info!("Settings loaded from {}", p.display()),
                None => info!("No settings file found, using defaults"),
            }
            config.apply(&mut settings);
            (settings, path)
        }
        Err(e) => {
            error!("Failed to load settings: {}", e);
            std::process::exit(exit::FAILURE);
        }
    }
}

// ============================================================================
// Subcommands
// ============================================================================

async fn run(args: RunArgs) -> i32 {
    let filter = log_filter(args.log_level.as_deref());
    let use_journald = init_logging(&filter, args.journald);

    info!("STARTUP: emberwatchd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stderr" });
    info!("STARTUP: PID: {}", std::process::id());

    let (settings, settings_path) = resolve_settings(&args.config);
    if let Err(e) = preflight::ensure_ready(&settings) {
        error!("{}", e);
        return exit::FAILURE;
    }

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!("Cannot locate own executable: {}", e);
            return exit::FAILURE;
        }
    };
    let sensor_spec = ProducerSpec::new(ProducerKind::Sensor, exe)
        .args(SensorArgs::child_args(
            &settings,
            settings_path.as_deref(),
            args.log_level.as_deref(),
        ));
    let classifier_spec = settings.classifier.producer_spec();

    let supervisor = Arc::new(ChildSupervisor::new(settings.supervisor_config()));
    let shutdown = Arc::new(ShutdownSignal::new());

    let handler_supervisor = Arc::clone(&supervisor);
    let handler_shutdown = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_shutdown.trigger() {
            info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
        } else {
            warn!("SIGNAL: Second interrupt - killing producers immediately");
            handler_supervisor.kill_now();
            std::process::exit(exit::FAILURE);
        }
    }) {
        warn!("Failed to set signal handler: {}. Shutdown via signals may not work cleanly.", e);
    }

    let sources = match supervisor.start(vec![sensor_spec, classifier_spec]) {
        Ok(sources) => sources,
        Err(e) => {
            error!("Failed to start producers: {}", e);
            supervisor.stop();
            return exit::FAILURE;
        }
    };

    let mut sensor = None;
    let mut classifier = None;
    for (kind, source) in sources {
        match kind {
            ProducerKind::Sensor => sensor = Some(source),
            ProducerKind::Classifier => classifier = Some(source),
        }
    }
    let (Some(sensor), Some(classifier)) = (sensor, classifier) else {
        error!("Producer pipes missing after start");
        supervisor.stop();
        return exit::FAILURE;
    };

    let mut fusion = FusionLoop::new(Box::new(sensor), Box::new(classifier));
    let mut reporter = ConsoleReporter::new(args.json).shutdown_on_close(Arc::clone(&shutdown));
    fusion.add_consumer(move |state| reporter.report(state));

    info!("Monitoring started");
    let last = run_fusion_loop(fusion, &supervisor, &shutdown, settings.fusion_config()).await;
    info!("SHUTDOWN: {}", ew_core::format_status_line(&last));

    let report = supervisor.stop();
    if report.is_clean() {
        info!("SHUTDOWN: Producers stopped");
        exit::SUCCESS
    } else {
        for (kind, pid) in &report.unkillable {
            error!(producer = %kind, pid = pid, "Producer could not be stopped");
        }
        exit::FAILURE
    }
}

fn sensor(args: SensorArgs) -> i32 {
    let filter = log_filter(args.log_level.as_deref());
    init_logging(&filter, false);

    match args.resolve() {
        Ok(settings) => producer::run_sensor(&settings),
        Err(e) => {
            error!("{:#}", e);
            exit::FAILURE
        }
    }
}

fn check(args: ConfigArgs) -> i32 {
    init_logging(&log_filter(None), false);
    let (settings, _) = resolve_settings(&args);

    let results = preflight::run_checks(&settings);
    for result in &results {
        println!(
            "[{}] {}: {}",
            if result.ok { " ok " } else { "FAIL" },
            result.name,
            result.detail
        );
    }
    match serde_json::to_string_pretty(&settings) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to encode settings: {}", e),
    }

    if results.iter().all(|r| r.ok) {
        exit::SUCCESS
    } else {
        exit::FAILURE
    }
}

fn print_default_config() -> i32 {
    match serde_json::to_string_pretty(&Settings::default()) {
        Ok(json) => {
            println!("{}", json);
            eprintln!(
                "Save as {} or {}",
                paths::system_config_file().display(),
                paths::user_config_dir()
                    .map(|d| d.join(paths::CONFIG_FILE).display().to_string())
                    .unwrap_or_else(|| "~/.config/emberwatch/config.json".to_string())
            );
            exit::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to encode settings: {}", e);
            exit::FAILURE
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC at {}: {}", location, message);
    }));

    let cli = Cli::parse();
    let code = match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await,
        Commands::Sensor(args) => sensor(args),
        Commands::Check(args) => check(args),
        Commands::Config => print_default_config(),
    };
    std::process::exit(code);
}
