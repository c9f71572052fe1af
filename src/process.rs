//! Per-process state machine.
//!
//! A [`Process`] owns one supervised subprocess for its whole life:
//!
//! ```text
//!            exit / exec error            backoff elapsed
//! STARTING ---------------------> WAITING -----------------> STARTING
//!    | min running time               ^  \ cancelled
//!    v                                |   v
//! RUNNING ------- exit ---------------+  DONE
//!    | cancelled                         ^
//!    v                                   |
//! STOPPING -- SIGTERM, kill timeout, SIGKILL
//! ```
//!
//! Every new state is published before the state's action runs. `DONE` is
//! terminal: the change stream closes and the instance cannot be reused.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::backoff::{Backoff, DELAY_MAX, DELAY_MIN};
use crate::logger::ProcessLogger;

/// How long a process must stay alive to count as started.
pub const MIN_RUNNING_TIME: Duration = Duration::from_secs(1);
/// How long a process may take to exit after SIGTERM before it gets SIGKILL.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing knobs of the state machine. Production code uses the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub min_running: Duration,
    pub kill: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            min_running: MIN_RUNNING_TIME,
            kill: KILL_TIMEOUT,
            backoff_min: DELAY_MIN,
            backoff_max: DELAY_MAX,
        }
    }
}

/// Resolved launch parameters of one process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessParams {
    /// Binary to execute.
    pub path: PathBuf,
    /// Arguments, without the program name.
    pub args: Vec<String>,
    /// Complete environment as `KEY=VALUE` entries; nothing is inherited.
    pub env: Vec<String>,
}

impl fmt::Display for ProcessParams {
    // Environment is left out on purpose, it usually carries credentials.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    /// The binary is being executed and has not survived the minimum running time yet.
    Starting,
    /// The process survived the minimum running time.
    Running,
    /// The process exited or failed to start; a restart is pending.
    Waiting,
    /// The process is being terminated.
    Stopping,
    /// Terminal state.
    Done,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Starting => "STARTING",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Waiting => "WAITING",
            ProcessStatus::Stopping => "STOPPING",
            ProcessStatus::Done => "DONE",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every state a process enters, in order. Closed after `DONE`.
pub type ProcessChanges = mpsc::UnboundedReceiver<ProcessStatus>;

/// Handle to a running state machine.
#[derive(Debug)]
pub struct Process {
    status: watch::Receiver<ProcessStatus>,
    logger: Arc<ProcessLogger>,
}

impl Process {
    /// Starts the state machine on the current tokio runtime.
    ///
    /// The process is stopped by cancelling `cancel`; there is no other way to
    /// reach `DONE`.
    pub fn spawn(
        params: ProcessParams,
        logger: Arc<ProcessLogger>,
        timeouts: Timeouts,
        cancel: CancellationToken,
    ) -> (Self, ProcessChanges) {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Starting);
        let span = info_span!(
            "process",
            agent_id = %logger.agent_id(),
            agent_type = %logger.agent_type()
        );
        let runner = Runner {
            params,
            logger: logger.clone(),
            timeouts,
            cancel,
            backoff: Backoff::new(timeouts.backoff_min, timeouts.backoff_max),
            child: None,
            changes: changes_tx,
            status: status_tx,
        };
        tokio::spawn(runner.run().instrument(span));
        let process = Self {
            status: status_rx,
            logger,
        };
        (process, changes_rx)
    }

    /// Returns the current state.
    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    /// Returns the latest output lines.
    pub fn logs(&self) -> Vec<String> {
        self.logger.latest()
    }

    /// Waits until the state machine is `DONE`.
    pub async fn done(&self) {
        let mut status = self.status.clone();
        // An error means the runner is gone, which only happens after DONE or
        // on runtime shutdown.
        let _ = status.wait_for(|s| *s == ProcessStatus::Done).await;
    }
}

struct Runner {
    params: ProcessParams,
    logger: Arc<ProcessLogger>,
    timeouts: Timeouts,
    cancel: CancellationToken,
    backoff: Backoff,
    child: Option<Child>,
    changes: mpsc::UnboundedSender<ProcessStatus>,
    status: watch::Sender<ProcessStatus>,
}

impl Runner {
    async fn run(mut self) {
        let mut state = ProcessStatus::Starting;
        loop {
            self.emit(state);
            state = match state {
                ProcessStatus::Starting => self.starting().await,
                ProcessStatus::Running => self.running().await,
                ProcessStatus::Waiting => self.waiting().await,
                ProcessStatus::Stopping => self.stopping().await,
                ProcessStatus::Done => break,
            };
        }
        debug!("Process: done.");
        // Dropping `self` closes the change stream.
    }

    fn emit(&self, state: ProcessStatus) {
        self.status.send_replace(state);
        let _ = self.changes.send(state);
    }

    async fn starting(&mut self) -> ProcessStatus {
        debug!("Starting: {}.", self.params);
        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(err) => {
                warn!("Failed to start {}: {}.", self.params.path.display(), err);
                return ProcessStatus::Waiting;
            }
        };
        info!(pid = child.id(), "Process: started.");

        let exited = tokio::select! {
            _ = tokio::time::sleep(self.timeouts.min_running) => None,
            status = child.wait() => Some(status),
        };
        match exited {
            None => {
                self.child = Some(child);
                ProcessStatus::Running
            }
            Some(status) => {
                log_exit("Process exited during start", status);
                ProcessStatus::Waiting
            }
        }
    }

    async fn running(&mut self) -> ProcessStatus {
        let Some(mut child) = self.child.take() else {
            return ProcessStatus::Waiting;
        };
        self.backoff.reset();

        let exited = tokio::select! {
            _ = self.cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        match exited {
            None => {
                self.child = Some(child);
                ProcessStatus::Stopping
            }
            Some(status) => {
                log_exit("Process exited unexpectedly", status);
                ProcessStatus::Waiting
            }
        }
    }

    async fn waiting(&mut self) -> ProcessStatus {
        let delay = self.backoff.delay();
        info!("Process: waiting {:?}.", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => ProcessStatus::Starting,
            _ = self.cancel.cancelled() => ProcessStatus::Done,
        }
    }

    // Not cancellable: once entered, the process gets SIGTERM, the full kill
    // timeout, and SIGKILL if needed.
    async fn stopping(&mut self) -> ProcessStatus {
        let Some(mut child) = self.child.take() else {
            return ProcessStatus::Done;
        };

        send_signal(&mut child, Signal::Term);
        match tokio::time::timeout(self.timeouts.kill, child.wait()).await {
            Ok(status) => log_exit("Process stopped", status),
            Err(_) => {
                warn!(
                    "Process: still alive after {:?}, sending SIGKILL.",
                    self.timeouts.kill
                );
                send_signal(&mut child, Signal::Kill);
                log_exit("Process killed", child.wait().await);
            }
        }
        ProcessStatus::Done
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        // stdout and stderr share one pipe so lines keep their relative order.
        let (reader, writer) = std::io::pipe()?;

        let mut command = Command::new(&self.params.path);
        command.args(&self.params.args);
        command.env_clear();
        for entry in &self.params.env {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    command.env(key, value);
                }
                _ => warn!("Ignoring malformed environment entry."),
            }
        }
        command
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        command.kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let logger = self.logger.clone();
        std::thread::Builder::new()
            .name(format!("output-{}", self.logger.agent_id()))
            .spawn(move || copy_output(reader, &logger))?;

        let child = command.spawn();
        // Release our copies of the write end so the reader sees EOF once the
        // child and its descendants are gone.
        drop(command);
        child
    }
}

fn copy_output(mut reader: impl Read, logger: &ProcessLogger) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => logger.write(&buf[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("Output reader stopped: {}.", err);
                break;
            }
        }
    }
}

fn log_exit(message: &str, status: std::io::Result<ExitStatus>) {
    match status {
        Ok(status) if status.success() => info!("{}: {}.", message, status),
        Ok(status) => warn!("{}: {}.", message, status),
        Err(err) => warn!("{}: wait failed: {}.", message, err),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Term,
    Kill,
}

// Best effort: failures are logged and the state machine moves on.
fn send_signal(child: &mut Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    debug!(pid, "Sending {:?} to process group.", signal);
    if let Err(err) = signal_group(pid, signal) {
        warn!(pid, "Failed to send {:?}: {}.", signal, err);
        if signal == Signal::Kill {
            if let Err(err) = child.start_kill() {
                warn!(pid, "Failed to kill process: {}.", err);
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pgid = pid as libc::pid_t;
    if unsafe { libc::kill(-pgid, sig) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast() -> Timeouts {
        Timeouts {
            min_running: Duration::from_millis(200),
            kill: Duration::from_millis(700),
            backoff_min: Duration::from_millis(20),
            backoff_max: Duration::from_millis(50),
        }
    }

    fn sh(script: &str) -> ProcessParams {
        ProcessParams {
            path: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()],
        }
    }

    fn start(params: ProcessParams, timeouts: Timeouts) -> (Process, ProcessChanges, CancellationToken) {
        let logger = Arc::new(ProcessLogger::new("test", "node_exporter", 10));
        let cancel = CancellationToken::new();
        let (process, changes) = Process::spawn(params, logger, timeouts, cancel.clone());
        (process, changes, cancel)
    }

    async fn next(changes: &mut ProcessChanges) -> Option<ProcessStatus> {
        tokio::time::timeout(Duration::from_secs(10), changes.recv())
            .await
            .expect("timed out waiting for a state change")
    }

    async fn drain(changes: &mut ProcessChanges) -> Vec<ProcessStatus> {
        let mut rest = Vec::new();
        while let Some(status) = next(changes).await {
            rest.push(status);
        }
        rest
    }

    #[tokio::test]
    async fn missing_binary_loops_until_cancelled() {
        let params = ProcessParams {
            path: PathBuf::from("/nonexistent/agent-supervisor-test"),
            args: vec![],
            env: vec![],
        };
        let (process, mut changes, cancel) = start(params, fast());

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(next(&mut changes).await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                ProcessStatus::Starting,
                ProcessStatus::Waiting,
                ProcessStatus::Starting,
                ProcessStatus::Waiting,
                ProcessStatus::Starting,
                ProcessStatus::Waiting,
            ]
        );

        cancel.cancel();
        let rest = drain(&mut changes).await;
        assert_eq!(rest.last(), Some(&ProcessStatus::Done));
        assert!(!rest.contains(&ProcessStatus::Running));
        assert!(!rest.contains(&ProcessStatus::Stopping));
        process.done().await;
        assert_eq!(process.status(), ProcessStatus::Done);
    }

    #[tokio::test]
    async fn long_lived_process_runs_and_stops() {
        let (process, mut changes, cancel) = start(sh("exec sleep 30"), fast());
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Starting));
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Running));
        assert_eq!(process.status(), ProcessStatus::Running);

        let cancelled_at = Instant::now();
        cancel.cancel();
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Stopping));
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Done));
        assert_eq!(next(&mut changes).await, None);
        assert!(cancelled_at.elapsed() < fast().kill);
    }

    #[tokio::test]
    async fn sigterm_ignoring_process_is_killed() {
        let timeouts = fast();
        let (_process, mut changes, cancel) =
            start(sh("trap '' TERM; while true; do sleep 1; done"), timeouts);
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Starting));
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Running));

        let cancelled_at = Instant::now();
        cancel.cancel();
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Stopping));
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Done));
        let elapsed = cancelled_at.elapsed();
        assert!(elapsed >= timeouts.kill, "stopped too early: {:?}", elapsed);
        assert!(elapsed < timeouts.kill + Duration::from_secs(2), "stopped too late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn crashing_process_is_restarted() {
        let (_process, mut changes, cancel) = start(sh("sleep 0.4; exit 1"), fast());
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(next(&mut changes).await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                ProcessStatus::Starting,
                ProcessStatus::Running,
                ProcessStatus::Waiting,
                ProcessStatus::Starting,
                ProcessStatus::Running,
            ]
        );
        cancel.cancel();
        assert_eq!(drain(&mut changes).await.last(), Some(&ProcessStatus::Done));
    }

    #[tokio::test]
    async fn captures_combined_output() {
        let (process, mut changes, cancel) =
            start(sh("echo out; echo err >&2; printf partial; exec sleep 30"), fast());
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Starting));
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Running));

        let deadline = Instant::now() + Duration::from_secs(5);
        while process.logs().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(process.logs(), vec!["out", "err"]);

        cancel.cancel();
        assert_eq!(drain(&mut changes).await.last(), Some(&ProcessStatus::Done));
    }

    #[tokio::test]
    async fn environment_is_not_inherited() {
        let mut params = sh("echo \"[$FOO][$HOME]\"; exec sleep 30");
        params.env.push("FOO=bar=baz".to_string());
        params.env.push("broken".to_string());
        let (process, mut changes, cancel) = start(params, fast());
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Starting));
        assert_eq!(next(&mut changes).await, Some(ProcessStatus::Running));

        let deadline = Instant::now() + Duration::from_secs(5);
        while process.logs().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(process.logs(), vec!["[bar=baz][]"]);

        cancel.cancel();
        assert_eq!(drain(&mut changes).await.last(), Some(&ProcessStatus::Done));
    }

    #[test]
    fn params_display_omits_environment() {
        let params = ProcessParams {
            path: PathBuf::from("/usr/bin/node_exporter"),
            args: vec!["--web.listen-address=:42000".to_string()],
            env: vec!["SECRET=1".to_string()],
        };
        assert_eq!(params.to_string(), "/usr/bin/node_exporter --web.listen-address=:42000");
        assert_eq!(ProcessStatus::Running.to_string(), "RUNNING");
    }
}
