//! Process execution and management.
//!
//! This module contains the [`Supervisor`], which spawns group commands as detached
//! processes, routes their output into size-bounded logs and keeps the state store in
//! step with what is actually running. Every mutation of a group's records happens under
//! that group's lock; group-wide operations hold it for the whole pass and isolate
//! failures per process.

use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::io::PipeWriter;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::{Paths, Settings};
use crate::error::{Result, SupervisorError};
use crate::lock::LockManager;
use crate::output::{copy_into, LogCapture};
use crate::ports::{first_bound_port, PortChecker, TcpPortChecker};
use crate::process::{CommandSpec, ProcessState, ProcessStatus, StartOptions};
use crate::state::StateStore;

/// Lock scope used for group mutations.
pub const GROUP_SCOPE: &str = "group";

/// Subcommand a [`CaptureMode::Helper`] program is invoked with.
pub const CAPTURE_SUBCOMMAND: &str = "capture";

const KILL_GRACE: Duration = Duration::from_secs(1);
const PUMP_DRAIN: Duration = Duration::from_millis(500);
const LIVENESS_POLL: Duration = Duration::from_millis(50);

type StateKey = (String, String);

/// Where process output is copied into its log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CaptureMode {
    /// Tasks inside this supervisor copy the output. Capture ends with the supervisor,
    /// after which the process writes into a closed pipe.
    #[default]
    InProcess,
    /// Each process gets a detached `<program> capture` companion that owns the read end
    /// of its output pipe, so capture outlives the supervisor.
    Helper(PathBuf),
}

/// Arguments that make a helper program copy its stdin into `log`.
pub fn capture_args(log: &Path, max_bytes: u64, keep_ratio: f64) -> Vec<OsString> {
    vec![
        CAPTURE_SUBCOMMAND.into(),
        "--log".into(),
        log.as_os_str().to_owned(),
        "--max-bytes".into(),
        max_bytes.to_string().into(),
        "--keep-ratio".into(),
        keep_ratio.to_string().into(),
    ]
}

#[derive(Debug, Clone, Copy)]
enum ProcessSignal {
    SigTerm,
    SigKill,
}

/// In-process handles for a process this supervisor spawned.
struct Attachment {
    child: Option<Child>,
    capture: Option<Child>,
    log: Option<Arc<LogCapture>>,
    pumps: Vec<JoinHandle<()>>,
}

impl Attachment {
    async fn close(mut self) {
        for mut pump in self.pumps.drain(..) {
            if tokio::time::timeout(PUMP_DRAIN, &mut pump).await.is_err() {
                pump.abort();
            }
        }
        if let Some(log) = self.log.take() {
            if let Err(err) = log.close().await {
                tracing::warn!(error = %err, "failed to close log");
            }
        }
        if let Some(capture) = self.capture.as_mut() {
            // reaps a finished helper; a running one carries on detached
            let _ = capture.try_wait();
        }
    }
}

// Output destination of a process being started.
enum Output {
    Discard,
    Local(Arc<LogCapture>),
    Helper {
        path: PathBuf,
        helper: Child,
        writer: PipeWriter,
    },
}

impl Output {
    fn child_stdio(&self) -> std::io::Result<(Stdio, Stdio)> {
        match self {
            Output::Discard => Ok((Stdio::null(), Stdio::null())),
            Output::Local(_) => Ok((Stdio::piped(), Stdio::piped())),
            Output::Helper { writer, .. } => Ok((
                Stdio::from(writer.try_clone()?),
                Stdio::from(writer.try_clone()?),
            )),
        }
    }

    // Drops this process's copy of the pipe writer so the helper sees end of input once
    // the child is gone.
    fn into_parts(self) -> (Option<Arc<LogCapture>>, Option<Child>, Option<PathBuf>) {
        match self {
            Output::Discard => (None, None, None),
            Output::Local(log) => {
                let path = log.path().to_path_buf();
                (Some(log), None, Some(path))
            }
            Output::Helper { path, helper, .. } => (None, Some(helper), Some(path)),
        }
    }
}

/// Outcome of one process within a group operation.
#[derive(Debug)]
pub struct GroupEntry {
    pub process: String,
    /// The resulting record, or `None` when there was nothing to do.
    pub outcome: Result<Option<ProcessState>>,
}

/// Per-process results of a group operation, in processing order.
#[derive(Debug)]
pub struct GroupReport {
    pub group: String,
    pub entries: Vec<GroupEntry>,
}

impl GroupReport {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            entries: Vec::new(),
        }
    }

    fn push(&mut self, process: &str, outcome: Result<Option<ProcessState>>) {
        if let Err(err) = &outcome {
            tracing::warn!(group = %self.group, process, error = %err, "process operation failed");
        }
        self.entries.push(GroupEntry {
            process: process.to_string(),
            outcome,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &SupervisorError)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            Err(err) => Some((entry.process.as_str(), err)),
            Ok(_) => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Starts, stops and tracks supervised processes.
pub struct Supervisor {
    store: StateStore,
    locks: LockManager,
    ports: Arc<dyn PortChecker>,
    settings: Settings,
    capture: CaptureMode,
    attachments: Mutex<HashMap<StateKey, Attachment>>,
}

impl Supervisor {
    pub fn new(paths: &Paths, settings: Settings) -> Self {
        Self {
            store: StateStore::new(paths),
            locks: LockManager::new(paths.lock_dir.clone()),
            ports: Arc::new(TcpPortChecker),
            settings,
            capture: CaptureMode::default(),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_port_checker(mut self, checker: Arc<dyn PortChecker>) -> Self {
        self.ports = checker;
        self
    }

    #[must_use]
    pub fn with_capture(mut self, capture: CaptureMode) -> Self {
        self.capture = capture;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Starts `spec` unless a live record for it already exists.
    ///
    /// Declared ports are checked before anything is spawned; a conflict leaves the
    /// state store untouched.
    pub async fn start(
        &self,
        group: &str,
        spec: &CommandSpec,
        options: &StartOptions,
    ) -> Result<ProcessState> {
        self.locked(group, || self.start_unlocked(group, spec, options))
            .await
    }

    /// Stops the process if its record says it is running.
    ///
    /// Returns the final record, or `None` when nothing was running.
    pub async fn stop(&self, group: &str, process: &str) -> Result<Option<ProcessState>> {
        self.locked(group, || self.stop_unlocked(group, process)).await
    }

    /// Stops the current instance (if any) and starts `spec` again.
    pub async fn restart(
        &self,
        group: &str,
        spec: &CommandSpec,
        options: &StartOptions,
    ) -> Result<ProcessState> {
        self.locked(group, || self.restart_unlocked(group, spec, options))
            .await
    }

    /// All known records, with dead running processes reconciled to `Error`.
    pub async fn list_processes(&self) -> Vec<ProcessState> {
        let mut states = Vec::new();
        for state in self.store.list_all() {
            if let Some(state) = self.reconcile_listed(state).await {
                states.push(state);
            }
        }
        states
    }

    /// Starts every command of `group` in declaration order under the group lock.
    pub async fn start_group(
        &self,
        group: &str,
        commands: &[CommandSpec],
        options: &StartOptions,
    ) -> Result<GroupReport> {
        self.locked(group, || async {
            let pruned = self.store.prune_logs(&self.store.list_all());
            if pruned > 0 {
                tracing::debug!(group, pruned, "pruned orphaned logs");
            }
            let mut report = GroupReport::new(group);
            for spec in commands {
                let outcome = self.start_unlocked(group, spec, options).await.map(Some);
                report.push(&spec.name, outcome);
            }
            Ok(report)
        })
        .await
    }

    /// Stops every command of `group`, then any leftover records of the group.
    pub async fn stop_group(&self, group: &str, commands: &[CommandSpec]) -> Result<GroupReport> {
        self.locked(group, || async {
            let mut report = GroupReport::new(group);
            let mut names: Vec<String> = commands.iter().map(|c| c.name.clone()).collect();
            for state in self.store.list_all() {
                if state.group == group && !names.contains(&state.process) {
                    names.push(state.process);
                }
            }
            for name in &names {
                let outcome = self.stop_unlocked(group, name).await;
                report.push(name, outcome);
            }
            Ok(report)
        })
        .await
    }

    /// Restarts every command of `group` in declaration order under the group lock.
    pub async fn restart_group(
        &self,
        group: &str,
        commands: &[CommandSpec],
        options: &StartOptions,
    ) -> Result<GroupReport> {
        self.locked(group, || async {
            let mut report = GroupReport::new(group);
            for spec in commands {
                let outcome = self.restart_unlocked(group, spec, options).await.map(Some);
                report.push(&spec.name, outcome);
            }
            Ok(report)
        })
        .await
    }

    /// Waits until every process captured in-process has closed its output.
    pub async fn wait_for_logs(&self) {
        let pumps: Vec<JoinHandle<()>> = {
            let mut attachments = self.lock_attachments();
            attachments
                .values_mut()
                .flat_map(|attachment| attachment.pumps.drain(..))
                .collect()
        };
        for pump in pumps {
            let _ = pump.await;
        }
    }

    /// Closes in-process logs and releases child handles. The processes keep running.
    pub async fn detach_all(&self) {
        let attachments: Vec<Attachment> = {
            let mut map = self.lock_attachments();
            map.drain().map(|(_, attachment)| attachment).collect()
        };
        for mut attachment in attachments {
            for pump in attachment.pumps.drain(..) {
                pump.abort();
            }
            attachment.close().await;
        }
    }

    async fn locked<F, Fut, T>(&self, group: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.locks
            .with_lock(GROUP_SCOPE, group, self.settings.lock_timeout(), operation)
            .await
    }

    async fn start_unlocked(
        &self,
        group: &str,
        spec: &CommandSpec,
        options: &StartOptions,
    ) -> Result<ProcessState> {
        if let Some(existing) = self.store.read(group, &spec.name) {
            let existing = self.reconcile(existing).await;
            if existing.is_running() {
                tracing::info!(group, process = %spec.name, pid = ?existing.pid, "process already running");
                return Ok(existing);
            }
        }

        if let Some(port) = first_bound_port(self.ports.as_ref(), &spec.ports) {
            return Err(SupervisorError::PortInUse {
                group: group.to_string(),
                process: spec.name.clone(),
                port,
            });
        }

        let mut record = ProcessState::new(group, &spec.name, &options.meta);
        record.command = Some(spec.command.clone());
        record.ports = (!spec.ports.is_empty()).then(|| spec.ports.clone());
        record.logs_disabled = options.logs_disabled.then_some(true);

        let log_max_bytes = options.log_max_bytes.unwrap_or(self.settings.log_max_bytes);
        let keep_ratio = self.settings.log_keep_ratio;
        let output = if options.logs_disabled {
            Output::Discard
        } else {
            let path = self.store.generate_log_path(group, &spec.name)?;
            match &self.capture {
                CaptureMode::InProcess => Output::Local(Arc::new(
                    LogCapture::open(path, log_max_bytes, keep_ratio).await?,
                )),
                CaptureMode::Helper(program) => {
                    // creates the file and checks the bounds before anything is spawned
                    LogCapture::open(path.clone(), log_max_bytes, keep_ratio)
                        .await?
                        .close()
                        .await?;
                    match spawn_capture(program, &path, log_max_bytes, keep_ratio) {
                        Ok((helper, writer)) => Output::Helper {
                            path,
                            helper,
                            writer,
                        },
                        Err(err) => {
                            let context = "failed to spawn log capture";
                            let err = self
                                .fail_start(group, spec, record, Some(&path), context, err)
                                .await;
                            return Err(err);
                        }
                    }
                }
            }
        };

        let spawned = output
            .child_stdio()
            .and_then(|(stdout, stderr)| build_command(spec, stdout, stderr).spawn());
        let (log, capture, log_path) = output.into_parts();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                if let Some(log) = &log {
                    let _ = log.close().await;
                }
                if let Some(mut capture) = capture {
                    let _ = tokio::time::timeout(PUMP_DRAIN, capture.wait()).await;
                }
                return Err(self
                    .fail_start(group, spec, record, log_path.as_deref(), "failed to spawn", err)
                    .await);
            }
        };
        let Some(pid) = child.id() else {
            return Err(self
                .fail_start(
                    group,
                    spec,
                    record,
                    None,
                    "failed to read pid",
                    std::io::Error::other("process exited immediately"),
                )
                .await);
        };

        let mut pumps = Vec::new();
        if let Some(log) = &log {
            if let Some(stdout) = child.stdout.take() {
                pumps.push(spawn_pump(stdout, Arc::clone(log)));
            }
            if let Some(stderr) = child.stderr.take() {
                pumps.push(spawn_pump(stderr, Arc::clone(log)));
            }
        }
        if let Some(path) = &log_path {
            record.log_path = Some(path.to_string_lossy().into_owned());
            record.log_max_bytes = Some(log_max_bytes);
        }

        record.status = ProcessStatus::Running;
        record.pid = Some(pid);
        record.capture_pid = capture.as_ref().and_then(Child::id);
        record.started_at = Some(Utc::now());
        record.stopped_at = None;
        record.error = None;

        let attachment = Attachment {
            child: Some(child),
            capture,
            log,
            pumps,
        };
        if let Err(err) = self.store.write(group, &spec.name, &record) {
            // An unrecorded process could never be stopped again.
            let _ = send_os_signal(pid, ProcessSignal::SigKill);
            attachment.close().await;
            return Err(err);
        }
        self.attach(group, &spec.name, attachment);

        tracing::info!(
            group,
            process = %spec.name,
            pid,
            capture_pid = ?record.capture_pid,
            log = record.log_path.as_deref().unwrap_or("-"),
            "started process"
        );
        Ok(record)
    }

    // Writes an error record for a start that never produced a running process.
    async fn fail_start(
        &self,
        group: &str,
        spec: &CommandSpec,
        mut record: ProcessState,
        log_path: Option<&Path>,
        context: &str,
        err: std::io::Error,
    ) -> SupervisorError {
        if let Some(path) = log_path {
            let _ = tokio::fs::remove_file(path).await;
        }
        record.mark_error(format!("{context}: {err}"));
        if let Err(write_err) = self.store.write(group, &spec.name, &record) {
            return write_err;
        }
        SupervisorError::ProcessStart {
            group: group.to_string(),
            process: spec.name.clone(),
            source: err,
        }
    }

    async fn stop_unlocked(&self, group: &str, process: &str) -> Result<Option<ProcessState>> {
        let Some(state) = self.store.read(group, process) else {
            return Ok(None);
        };
        let mut state = self.reconcile(state).await;
        let Some(pid) = state.pid.filter(|_| state.is_running()) else {
            tracing::debug!(group, process, status = ?state.status, "nothing to stop");
            return Ok(None);
        };

        let mut attachment = self.detach(group, process);
        let terminated = {
            let child = attachment.as_mut().and_then(|a| a.child.as_mut());
            terminate(pid, child, self.settings.stop_timeout()).await
        };
        if let Err(err) = terminated {
            if let Some(attachment) = attachment {
                self.attach(group, process, attachment);
            }
            return Err(err);
        }
        if let Some(capture_pid) = state.capture_pid {
            let helper = attachment.as_mut().and_then(|a| a.capture.as_mut());
            finish_capture(capture_pid, helper).await;
        }

        self.store.delete(group, process);
        if let Some(attachment) = attachment {
            attachment.close().await;
        }

        state.status = ProcessStatus::Stopped;
        state.pid = None;
        state.capture_pid = None;
        state.stopped_at = Some(Utc::now());
        tracing::info!(group, process, pid, "stopped process");
        Ok(Some(state))
    }

    async fn restart_unlocked(
        &self,
        group: &str,
        spec: &CommandSpec,
        options: &StartOptions,
    ) -> Result<ProcessState> {
        let wrap = |err: SupervisorError| SupervisorError::ProcessRestart {
            group: group.to_string(),
            process: spec.name.clone(),
            source: Box::new(err),
        };

        self.stop_unlocked(group, &spec.name).await.map_err(wrap)?;
        match self.start_unlocked(group, spec, options).await {
            Ok(state) => Ok(state),
            Err(err) => {
                if self.store.read(group, &spec.name).is_none() {
                    let mut record = ProcessState::new(group, &spec.name, &options.meta);
                    record.command = Some(spec.command.clone());
                    record.mark_error(err.to_string());
                    if let Err(write_err) = self.store.write(group, &spec.name, &record) {
                        tracing::warn!(group, process = %spec.name, error = %write_err, "failed to record restart failure");
                    }
                }
                Err(wrap(err))
            }
        }
    }

    // Listing runs outside any lock, so a stale record is only rewritten under its group
    // lock and only while the stored record is still the one that was observed. `None`
    // means the record disappeared in the meantime.
    async fn reconcile_listed(&self, observed: ProcessState) -> Option<ProcessState> {
        if !observed.is_running() || self.is_live(&observed) {
            return Some(observed);
        }
        let outcome = self
            .locked(&observed.group, || async {
                Ok(match self.store.read(&observed.group, &observed.process) {
                    Some(current) if current == observed => Some(self.reconcile(current).await),
                    other => other,
                })
            })
            .await;
        match outcome {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(
                    group = %observed.group,
                    process = %observed.process,
                    error = %err,
                    "could not lock group to reconcile record"
                );
                let mut view = observed;
                view.mark_error(stale_message(&view));
                Some(view)
            }
        }
    }

    // A running record whose process is gone becomes an error record. Callers hold the
    // group lock.
    async fn reconcile(&self, mut state: ProcessState) -> ProcessState {
        if !state.is_running() || self.is_live(&state) {
            return state;
        }
        tracing::info!(group = %state.group, process = %state.process, pid = ?state.pid, "reconciling stale record");
        state.mark_error(stale_message(&state));
        if let Err(err) = self.store.write(&state.group, &state.process, &state) {
            tracing::warn!(error = %err, "failed to persist reconciled record");
        }
        if let Some(attachment) = self.detach(&state.group, &state.process) {
            attachment.close().await;
        }
        state
    }

    fn is_live(&self, state: &ProcessState) -> bool {
        match state.pid {
            Some(pid) => !self.attached_exited(&state.group, &state.process) && pid_alive(pid),
            None => false,
        }
    }

    fn attached_exited(&self, group: &str, process: &str) -> bool {
        let mut attachments = self.lock_attachments();
        let Some(child) = attachments
            .get_mut(&(group.to_string(), process.to_string()))
            .and_then(|a| a.child.as_mut())
        else {
            return false;
        };
        matches!(child.try_wait(), Ok(Some(_)))
    }

    fn attach(&self, group: &str, process: &str, attachment: Attachment) {
        let previous = self
            .lock_attachments()
            .insert((group.to_string(), process.to_string()), attachment);
        if let Some(mut previous) = previous {
            for pump in previous.pumps.drain(..) {
                pump.abort();
            }
        }
    }

    fn detach(&self, group: &str, process: &str) -> Option<Attachment> {
        self.lock_attachments()
            .remove(&(group.to_string(), process.to_string()))
    }

    fn lock_attachments(&self) -> std::sync::MutexGuard<'_, HashMap<StateKey, Attachment>> {
        self.attachments
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn stale_message(state: &ProcessState) -> String {
    match state.pid {
        Some(pid) => format!("process {pid} is no longer running"),
        None => "running record has no pid".to_string(),
    }
}

fn build_command(spec: &CommandSpec, stdout: Stdio, stderr: Stdio) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(&spec.command);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    if !spec.env.is_empty() {
        command.envs(&spec.env);
    }
    command.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
    command.kill_on_drop(false);
    detach_session(&mut command);
    command
}

fn spawn_pump<R>(reader: R, log: Arc<LogCapture>) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = copy_into(reader, &log).await {
            tracing::warn!(error = %err, "stopped capturing output");
        }
    })
}

// The helper reads the pipe until every writer is gone, i.e. until the child and any
// descendants holding its output have exited.
fn spawn_capture(
    program: &Path,
    log: &Path,
    max_bytes: u64,
    keep_ratio: f64,
) -> std::io::Result<(Child, PipeWriter)> {
    let (reader, writer) = std::io::pipe()?;
    let mut command = Command::new(program);
    command
        .args(capture_args(log, max_bytes, keep_ratio))
        .stdin(Stdio::from(reader))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);
    detach_session(&mut command);
    let helper = command.spawn()?;
    Ok((helper, writer))
}

// New session so the process outlives this supervisor; SIGPIPE ignored so a closed
// output pipe surfaces as EPIPE instead of killing it.
fn detach_session(command: &mut Command) {
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
            Ok(())
        });
    }
}

// SIGTERM, wait, then SIGKILL for whatever is still alive.
async fn terminate(pid: u32, mut child: Option<&mut Child>, timeout: Duration) -> Result<()> {
    if !signal_pid(pid, ProcessSignal::SigTerm)? {
        return Ok(());
    }
    if wait_for_exit(pid, child.as_deref_mut(), timeout).await {
        return Ok(());
    }
    tracing::warn!(pid, "process did not exit after SIGTERM, sending SIGKILL");
    if !signal_pid(pid, ProcessSignal::SigKill)? {
        return Ok(());
    }
    if !wait_for_exit(pid, child, KILL_GRACE).await {
        tracing::warn!(pid, "process still present after SIGKILL");
    }
    Ok(())
}

// The helper normally exits by itself once the child's output closes.
async fn finish_capture(pid: u32, helper: Option<&mut Child>) {
    if wait_for_exit(pid, helper, PUMP_DRAIN).await {
        return;
    }
    tracing::debug!(pid, "log capture still running, terminating it");
    if let Err(err) = signal_pid(pid, ProcessSignal::SigTerm) {
        tracing::warn!(pid, error = %err, "failed to stop log capture");
    }
}

/// Signals the process group and the process. Returns `false` if the pid is gone.
fn signal_pid(pid: u32, signal: ProcessSignal) -> Result<bool> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Ok(false);
    }
    match send_os_signal(pid, signal) {
        Ok(()) => Ok(true),
        Err(err) if err.raw_os_error() == Some(libc::ESRCH) => Ok(false),
        Err(source) => Err(SupervisorError::Signal { pid, source }),
    }
}

fn send_os_signal(pid: u32, signal: ProcessSignal) -> std::io::Result<()> {
    let sig = match signal {
        ProcessSignal::SigTerm => libc::SIGTERM,
        ProcessSignal::SigKill => libc::SIGKILL,
    };
    let pid = pid as i32;
    unsafe {
        if is_group_leader(pid) {
            let _ = libc::kill(-pid, sig);
        }
        if libc::kill(pid, sig) == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

// Only a group led by the pid itself is signalled; a reused pid inside some other group
// must not take that group down. Pid 1 is excluded since kill(-1) broadcasts.
fn is_group_leader(pid: i32) -> bool {
    pid > 1 && unsafe { libc::getpgid(pid) } == pid
}

/// Waits up to `timeout` for `pid` to exit. Returns `true` once it is gone.
async fn wait_for_exit(pid: u32, child: Option<&mut Child>, timeout: Duration) -> bool {
    if let Some(child) = child {
        return matches!(tokio::time::timeout(timeout, child.wait()).await, Ok(Ok(_)));
    }
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(LIVENESS_POLL).await;
    }
}

/// Whether `pid` names a live (non-zombie) process.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    let exists = rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state field follows the parenthesized command name.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state == 'Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}
