//! Startup preconditions
//!
//! Everything here runs before any child is spawned. A failure means the
//! daemon exits with status 1 without touching the producers.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use ew_core::{EmberwatchError, Result, Settings};

/// Outcome of one precondition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self { name, ok: true, detail: detail.into() }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self { name, ok: false, detail: detail.into() }
    }
}

/// Verify we're running as root (uid 0)
fn is_root() -> bool {
    // SAFETY: geteuid is always safe - it just returns the effective user ID.
    unsafe { libc::geteuid() == 0 }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve a bare program name against PATH; paths with a separator are used as-is
pub fn find_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return is_executable(program).then(|| program.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// Run every check, in order, without stopping at the first failure
pub fn run_checks(settings: &Settings) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(match settings.validate() {
        Ok(()) => CheckResult::pass("configuration", "valid"),
        Err(e) => CheckResult::fail("configuration", e.to_string()),
    });

    if settings.general.require_root {
        results.push(if is_root() {
            CheckResult::pass("privileges", "running as root")
        } else {
            CheckResult::fail("privileges", "root required by general.require_root")
        });
    }

    let device = &settings.sensor.device_path;
    results.push(if device.exists() {
        CheckResult::pass("sensor device", device.display().to_string())
    } else {
        CheckResult::fail("sensor device", format!("{} not found", device.display()))
    });

    let program = &settings.classifier.program;
    results.push(match find_program(program) {
        Some(resolved) => CheckResult::pass("classifier program", resolved.display().to_string()),
        None => CheckResult::fail(
            "classifier program",
            format!("{} not found or not executable", program.display()),
        ),
    });

    let script = &settings.classifier.script;
    results.push(if script.is_file() {
        CheckResult::pass("classifier script", script.display().to_string())
    } else {
        CheckResult::fail("classifier script", format!("{} not found", script.display()))
    });

    results.push(match std::env::current_exe() {
        Ok(exe) => CheckResult::pass("sensor producer", exe.display().to_string()),
        Err(e) => CheckResult::fail("sensor producer", format!("cannot locate own executable: {}", e)),
    });

    for result in &results {
        debug!(check = result.name, ok = result.ok, "{}", result.detail);
    }
    results
}

/// Fail with the first unmet precondition
pub fn ensure_ready(settings: &Settings) -> Result<()> {
    settings.validate()?;

    if settings.general.require_root && !is_root() {
        return Err(EmberwatchError::PermissionDenied(
            "root required by general.require_root".to_string(),
        ));
    }
    if !settings.sensor.device_path.exists() {
        return Err(EmberwatchError::missing_path(&settings.sensor.device_path, "sensor device"));
    }
    if find_program(&settings.classifier.program).is_none() {
        return Err(EmberwatchError::missing_path(
            &settings.classifier.program,
            "classifier executable",
        ));
    }
    if !settings.classifier.script.is_file() {
        return Err(EmberwatchError::missing_path(&settings.classifier.script, "classifier script"));
    }
    std::env::current_exe().map_err(|e| {
        EmberwatchError::Precondition(format!("cannot locate own executable: {}", e))
    })?;

    info!("STARTUP: Preconditions satisfied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn ready_settings(dir: &Path) -> Settings {
        let device = dir.join("ttyFAKE");
        fs::write(&device, "").unwrap();
        let script = dir.join("smoke_detection.m");
        fs::write(&script, "disp('hi')").unwrap();

        let mut settings = Settings::default();
        settings.sensor.device_path = device;
        settings.classifier.program = PathBuf::from("/bin/sh");
        settings.classifier.script = script;
        settings
    }

    #[test]
    fn test_all_checks_pass() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ready_settings(dir.path());
        let results = run_checks(&settings);
        assert!(results.iter().all(|r| r.ok), "{:?}", results);
        ensure_ready(&settings).unwrap();
    }

    #[test]
    fn test_missing_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ready_settings(dir.path());
        settings.sensor.device_path = dir.path().join("absent");
        let err = ensure_ready(&settings).unwrap_err();
        assert!(matches!(err, EmberwatchError::MissingPath { ref what, .. } if what == "sensor device"));
        assert!(run_checks(&settings).iter().any(|r| !r.ok && r.name == "sensor device"));
    }

    #[test]
    fn test_non_executable_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ready_settings(dir.path());
        let program = dir.path().join("matlab");
        fs::write(&program, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o644)).unwrap();
        settings.classifier.program = program.clone();
        assert!(ensure_ready(&settings).is_err());

        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
        ensure_ready(&settings).unwrap();
    }

    #[test]
    fn test_missing_script_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ready_settings(dir.path());
        settings.classifier.script = dir.path().join("nope.m");
        assert!(matches!(ensure_ready(&settings), Err(EmberwatchError::MissingPath { .. })));
    }

    #[test]
    fn test_invalid_config_fails_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ready_settings(dir.path());
        settings.sensor.baud_rate = 7;
        assert!(matches!(ensure_ready(&settings), Err(EmberwatchError::InvalidConfig { .. })));
    }

    #[test]
    fn test_find_program_on_path() {
        assert_eq!(find_program(Path::new("/bin/sh")), Some(PathBuf::from("/bin/sh")));
        assert!(find_program(Path::new("sh")).is_some());
        assert!(find_program(Path::new("definitely-not-a-real-program-xyz")).is_none());
    }
}
