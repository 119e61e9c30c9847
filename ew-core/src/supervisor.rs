//! Producer process supervision
//!
//! Each producer runs as a child process whose stdout is a pipe; the child
//! holds the only write end and the supervisor keeps the read end. The
//! supervisor owns every child handle and is the only component allowed to
//! signal or reap them.
//!
//! # Shutdown
//! [`ChildSupervisor::stop`] is idempotent and may be called from any thread:
//! 1. SIGTERM to every live child (to its process group if it has one)
//! 2. Wait up to the stop timeout for them to exit
//! 3. SIGKILL and reap survivors
//! 4. Close all pipe read ends
//! 5. Best-effort sweep of stray helper processes: `pgrep -f` each pattern
//!    and SIGKILL the matches, skipping this process and its process group
//!
//! Once stopped, nothing can be spawned again. [`ChildSupervisor::kill_now`]
//! SIGKILLs every live child without waiting on a `stop` in progress.

use std::collections::HashMap;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use ew_error::{EmberwatchError, Result};

use crate::constants::{cleanup, timing};
use crate::data::ProducerKind;
use crate::io::{PipeEnd, PipeSource};

// ============================================================================
// Producer Specification
// ============================================================================

/// How to launch one producer
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerSpec {
    pub kind: ProducerKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Start the child in its own process group so the whole tree can be signalled
    pub own_process_group: bool,
}

impl ProducerSpec {
    pub fn new(kind: ProducerKind, program: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            own_process_group: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn own_process_group(mut self, enabled: bool) -> Self {
        self.own_process_group = enabled;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if self.own_process_group {
            cmd.process_group(0);
        }
        cmd
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Exit of one producer as observed by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerExit {
    pub kind: ProducerKind,
    pub pid: u32,
    /// `None` if the process vanished without an observable status
    pub status: Option<ExitStatus>,
}

impl ProducerExit {
    /// Non-zero exit or death by signal
    pub fn is_anomaly(&self) -> bool {
        self.status.map_or(true, |s| !s.success())
    }

    pub fn describe(&self) -> String {
        match self.status {
            Some(s) => match (s.code(), s.signal()) {
                (Some(code), _) => format!("exit code {}", code),
                (None, Some(sig)) => format!("killed by signal {}", sig),
                _ => "unknown status".to_string(),
            },
            None => "status unavailable".to_string(),
        }
    }
}

/// Outcome of [`ChildSupervisor::stop`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopReport {
    /// Exited on their own before stop began
    pub already_exited: Vec<ProducerKind>,
    /// Exited within the grace period after SIGTERM
    pub graceful: Vec<ProducerKind>,
    /// Needed SIGKILL
    pub killed: Vec<ProducerKind>,
    /// Still not reaped after SIGKILL
    pub unkillable: Vec<(ProducerKind, u32)>,
    /// Sweep patterns that matched at least one process
    pub swept: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.unkillable.is_empty()
    }
}

// ============================================================================
// Supervisor
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub stop_timeout: Duration,
    pub sweep_enabled: bool,
    pub sweep_patterns: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_millis(timing::DEFAULT_STOP_TIMEOUT_MS),
            sweep_enabled: true,
            sweep_patterns: cleanup::DEFAULT_SWEEP_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

#[derive(Debug)]
enum ChildStatus {
    Running,
    Exited(ExitStatus),
    /// try_wait failed; the pid is no longer ours to wait on
    Lost,
}

/// Pid of a running child, readable without the supervisor lock.
/// Zero once the child has been reaped.
#[derive(Debug)]
struct LivePid {
    pid: AtomicU32,
    own_group: bool,
}

impl LivePid {
    /// SIGKILL the child if it has not been reaped. True if a signal was sent.
    fn kill(&self) -> bool {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return false;
        }
        if self.own_group {
            let _ = send_signal(-(pid as i32), libc::SIGKILL);
        }
        send_signal(pid as i32, libc::SIGKILL).is_ok()
    }
}

#[derive(Debug)]
struct ChildHandle {
    kind: ProducerKind,
    pid: u32,
    child: Child,
    pipe: Arc<PipeEnd>,
    own_group: bool,
    status: ChildStatus,
    restart_count: u32,
    live: Arc<LivePid>,
}

impl ChildHandle {
    /// Collect the exit status without blocking. True once the child is gone.
    fn poll_exit(&mut self) -> bool {
        if let ChildStatus::Running = self.status {
            match self.child.try_wait() {
                Ok(Some(status)) => self.status = ChildStatus::Exited(status),
                Ok(None) => {}
                Err(e) => {
                    debug!(producer = %self.kind, pid = self.pid, "try_wait failed: {}", e);
                    self.status = ChildStatus::Lost;
                }
            }
            if !matches!(self.status, ChildStatus::Running) {
                self.live.pid.store(0, Ordering::SeqCst);
            }
        }
        !matches!(self.status, ChildStatus::Running)
    }

    fn exit(&self) -> Option<ProducerExit> {
        match self.status {
            ChildStatus::Running => None,
            ChildStatus::Exited(status) => Some(ProducerExit {
                kind: self.kind,
                pid: self.pid,
                status: Some(status),
            }),
            ChildStatus::Lost => Some(ProducerExit {
                kind: self.kind,
                pid: self.pid,
                status: None,
            }),
        }
    }

    fn signal(&self, sig: libc::c_int) -> io::Result<()> {
        if self.own_group {
            send_signal(-(self.pid as i32), sig)?;
        }
        send_signal(self.pid as i32, sig)
    }
}

/// `kill(2)` that treats an already-gone target as success
fn send_signal(target: i32, sig: libc::c_int) -> io::Result<()> {
    // SAFETY: kill only takes plain integers; target is a pid or negated pgid
    // of a child this process spawned.
    if unsafe { libc::kill(target, sig) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[derive(Debug, Default)]
struct Inner {
    specs: HashMap<ProducerKind, ProducerSpec>,
    children: HashMap<ProducerKind, ChildHandle>,
    stop_report: Option<StopReport>,
}

/// Owner of all producer processes
#[derive(Debug)]
pub struct ChildSupervisor {
    config: SupervisorConfig,
    inner: Mutex<Inner>,
    /// Never held across a wait
    live: Mutex<Vec<Arc<LivePid>>>,
    stopped: AtomicBool,
}

impl ChildSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            live: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawn every producer. If any fails, the ones already started are stopped.
    pub fn start(&self, specs: Vec<ProducerSpec>) -> Result<Vec<(ProducerKind, PipeSource)>> {
        let mut sources = Vec::with_capacity(specs.len());
        for spec in specs {
            let kind = spec.kind;
            match self.spawn(spec) {
                Ok(source) => sources.push((kind, source)),
                Err(e) => {
                    error!(producer = %kind, "Startup failed: {}", e);
                    self.stop();
                    return Err(e);
                }
            }
        }
        Ok(sources)
    }

    /// Launch one producer and return its pipe reader
    pub fn spawn(&self, spec: ProducerSpec) -> Result<PipeSource> {
        let mut inner = self.inner.lock();
        if inner.stop_report.is_some() || self.is_stopped() {
            return Err(EmberwatchError::SupervisorStopped);
        }

        let kind = spec.kind;
        let restart_count = match inner.children.get_mut(&kind) {
            Some(existing) => {
                if !existing.poll_exit() {
                    return Err(EmberwatchError::generic(format!(
                        "{} producer already running (pid {})",
                        kind, existing.pid
                    )));
                }
                existing.restart_count + 1
            }
            None => 0,
        };

        let handle = launch(&spec, restart_count)?;
        let source = handle.pipe.source();
        info!(
            producer = %kind,
            pid = handle.pid,
            program = %spec.program.display(),
            restarts = restart_count,
            "Producer started"
        );
        {
            let mut live = self.live.lock();
            live.retain(|l| l.pid.load(Ordering::SeqCst) != 0);
            live.push(Arc::clone(&handle.live));
        }
        inner.children.insert(kind, handle);
        inner.specs.insert(kind, spec);
        Ok(source)
    }

    /// Relaunch a producer from its last spec. A still-running instance is killed first.
    pub fn restart(&self, kind: ProducerKind) -> Result<PipeSource> {
        let spec = {
            let inner = self.inner.lock();
            inner
                .specs
                .get(&kind)
                .cloned()
                .ok_or_else(|| EmberwatchError::generic(format!("no spec for {} producer", kind)))?
        };
        if self.is_alive(kind) {
            self.terminate(kind);
            let deadline = Instant::now() + self.config.stop_timeout;
            while self.try_reap(kind).is_none() && Instant::now() < deadline {
                std::thread::sleep(timing::STOP_POLL_INTERVAL);
            }
        }
        self.spawn(spec)
    }

    /// Exit of a producer, if it has exited. Never blocks.
    pub fn try_reap(&self, kind: ProducerKind) -> Option<ProducerExit> {
        let mut inner = self.inner.lock();
        let handle = inner.children.get_mut(&kind)?;
        handle.poll_exit();
        handle.exit()
    }

    /// SIGKILL one producer and close its pipe. The exit is collected by
    /// a later [`try_reap`](Self::try_reap) if not immediately available.
    pub fn terminate(&self, kind: ProducerKind) -> Option<ProducerExit> {
        let mut inner = self.inner.lock();
        let handle = inner.children.get_mut(&kind)?;
        handle.pipe.close();
        if handle.poll_exit() {
            return handle.exit();
        }
        warn!(producer = %kind, pid = handle.pid, "Killing producer");
        if let Err(e) = handle.signal(libc::SIGKILL) {
            error!(producer = %kind, pid = handle.pid, "SIGKILL failed: {}", e);
        }
        handle.poll_exit();
        handle.exit()
    }

    pub fn pid(&self, kind: ProducerKind) -> Option<u32> {
        self.inner.lock().children.get(&kind).map(|h| h.pid)
    }

    pub fn is_alive(&self, kind: ProducerKind) -> bool {
        let mut inner = self.inner.lock();
        match inner.children.get_mut(&kind) {
            Some(handle) => !handle.poll_exit(),
            None => false,
        }
    }

    pub fn restart_count(&self, kind: ProducerKind) -> u32 {
        self.inner
            .lock()
            .children
            .get(&kind)
            .map_or(0, |h| h.restart_count)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// SIGKILL every unreaped child right away and refuse further spawns.
    ///
    /// Does not take the main lock, so it returns promptly even while
    /// [`stop`](Self::stop) is waiting out its grace period on another
    /// thread. Exits are still collected by `stop`. Returns how many
    /// children were signalled.
    pub fn kill_now(&self) -> usize {
        self.stopped.store(true, Ordering::SeqCst);
        let killed = self.live.lock().iter().filter(|l| l.kill()).count();
        if killed > 0 {
            warn!(count = killed, "Killed producers immediately");
        }
        killed
    }

    /// Terminate everything. Safe to call repeatedly and concurrently; later
    /// calls return the first call's report without signalling anything.
    pub fn stop(&self) -> StopReport {
        self.stopped.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if let Some(report) = &inner.stop_report {
            debug!("Supervisor already stopped");
            return report.clone();
        }

        info!("Stopping producers");
        let mut report = StopReport::default();
        let mut signalled = Vec::new();

        for handle in inner.children.values_mut() {
            if handle.poll_exit() {
                report.already_exited.push(handle.kind);
                continue;
            }
            debug!(producer = %handle.kind, pid = handle.pid, "Sending SIGTERM");
            if let Err(e) = handle.signal(libc::SIGTERM) {
                warn!(producer = %handle.kind, pid = handle.pid, "SIGTERM failed: {}", e);
            }
            signalled.push(handle.kind);
        }

        wait_for_exit(&mut inner.children, &signalled, self.config.stop_timeout);

        let mut survivors = Vec::new();
        for kind in &signalled {
            let Some(handle) = inner.children.get_mut(kind) else { continue };
            if handle.poll_exit() {
                report.graceful.push(*kind);
                continue;
            }
            warn!(producer = %kind, pid = handle.pid, "Producer ignored SIGTERM, sending SIGKILL");
            if let Err(e) = handle.signal(libc::SIGKILL) {
                error!(producer = %kind, pid = handle.pid, "SIGKILL failed: {}", e);
            }
            report.killed.push(*kind);
            survivors.push(*kind);
        }

        wait_for_exit(&mut inner.children, &survivors, self.config.stop_timeout);

        for kind in &survivors {
            if let Some(handle) = inner.children.get_mut(kind) {
                if !handle.poll_exit() {
                    error!(producer = %kind, pid = handle.pid, "Producer could not be killed");
                    report.unkillable.push((*kind, handle.pid));
                }
            }
        }

        for handle in inner.children.values() {
            handle.pipe.close();
        }

        if self.config.sweep_enabled {
            report.swept = sweep(&self.config.sweep_patterns);
        }

        info!(
            graceful = report.graceful.len(),
            killed = report.killed.len(),
            unkillable = report.unkillable.len(),
            "Producers stopped"
        );
        inner.stop_report = Some(report.clone());
        report
    }
}

impl Drop for ChildSupervisor {
    fn drop(&mut self) {
        if self.inner.get_mut().stop_report.is_none() && !self.inner.get_mut().children.is_empty() {
            self.stop();
        }
    }
}

fn launch(spec: &ProducerSpec, restart_count: u32) -> Result<ChildHandle> {
    let producer = spec.kind.to_string();
    let mut child = spec
        .command()
        .spawn()
        .map_err(|source| EmberwatchError::Spawn {
            producer: producer.clone(),
            source,
        })?;
    let pid = child.id();

    let pipe = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdout not captured"))
        .and_then(PipeEnd::new);
    let pipe = match pipe {
        Ok(pipe) => pipe,
        Err(source) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EmberwatchError::Spawn { producer, source });
        }
    };

    Ok(ChildHandle {
        kind: spec.kind,
        pid,
        child,
        pipe,
        own_group: spec.own_process_group,
        status: ChildStatus::Running,
        restart_count,
        live: Arc::new(LivePid {
            pid: AtomicU32::new(pid),
            own_group: spec.own_process_group,
        }),
    })
}

fn wait_for_exit(children: &mut HashMap<ProducerKind, ChildHandle>, kinds: &[ProducerKind], timeout: Duration) {
    if kinds.is_empty() {
        return;
    }
    let deadline = Instant::now() + timeout;
    loop {
        let mut all_gone = true;
        for k in kinds {
            if let Some(h) = children.get_mut(k) {
                all_gone = h.poll_exit() && all_gone;
            }
        }
        if all_gone || Instant::now() >= deadline {
            return;
        }
        std::thread::sleep(timing::STOP_POLL_INTERVAL);
    }
}

/// SIGKILL every process whose command line matches a pattern.
/// Failures are logged at debug and otherwise ignored.
fn sweep(patterns: &[String]) -> Vec<String> {
    sweep_with(cleanup::PGREP, patterns)
}

fn sweep_with(pgrep: &str, patterns: &[String]) -> Vec<String> {
    let own_pid = std::process::id();
    // SAFETY: getpgrp takes no arguments and cannot fail.
    let own_group = unsafe { libc::getpgrp() };

    let mut matched = Vec::new();
    for pattern in patterns.iter().filter(|p| !p.trim().is_empty()) {
        let output = Command::new(pgrep)
            .args(["-f", pattern.as_str()])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                debug!(pattern = %pattern, "Sweep failed: {}", e);
                continue;
            }
        };

        let targets: Vec<i32> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .filter(|&pid| pid > 0 && pid as u32 != own_pid)
            // SAFETY: getpgid only reads the group of the given pid.
            .filter(|&pid| unsafe { libc::getpgid(pid) } != own_group)
            .collect();
        if targets.is_empty() {
            debug!(pattern = %pattern, "Sweep matched nothing");
            continue;
        }

        let mut killed = 0;
        for pid in targets {
            match send_signal(pid, libc::SIGKILL) {
                Ok(()) => killed += 1,
                Err(e) => debug!(pattern = %pattern, pid = pid, "Sweep could not kill: {}", e),
            }
        }
        if killed > 0 {
            info!(pattern = %pattern, count = killed, "Swept stray processes");
            matched.push(pattern.clone());
        }
    }
    matched
}
