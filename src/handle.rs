//! Session handle
//!
//! Owns one worker's lifetime: its child process, the stdin/stdout line
//! pipes, the idle clock, and the ordered teardown. All commands to a
//! session funnel through [`SessionHandle::send_command`], which holds the
//! pipe mutex for the whole round-trip, so the worker only ever sees one
//! command at a time.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use sysinfo::System;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::protocol::{CommandRequest, CommandResponse, CredentialsMessage, InitMessage};

/// How long a worker gets to exit after the terminate request
const GRACEFUL_EXIT_WAIT: Duration = Duration::from_secs(5);

/// How long a worker gets after SIGTERM before it is killed
const SIGNAL_EXIT_WAIT: Duration = Duration::from_secs(5);

/// How long to wait for a reaped terminal process to disappear
const TERMINAL_KILL_WAIT: Duration = Duration::from_secs(5);

/// Everything needed to spawn one worker
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Worker executable
    pub program: PathBuf,
    pub session_id: String,
    pub login: i64,
    pub server: String,
    /// The session's isolated installation root
    pub data_dir: PathBuf,
    /// Terminal executable inside the data dir
    pub terminal_exe: PathBuf,
}

/// Point-in-time view of a session, safe to hand to callers
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub login: i64,
    pub server: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub age_seconds: f64,
}

#[derive(Debug)]
struct WorkerIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// The in-process owner of one worker
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    login: i64,
    server: String,
    data_dir: PathBuf,
    terminal_exe: PathBuf,
    created_at: DateTime<Utc>,
    last_accessed: parking_lot::Mutex<DateTime<Utc>>,
    healthy: AtomicBool,
    command_timeout: Duration,
    worker_pid: Option<u32>,
    mt5_pid: Option<u32>,
    /// Single-writer discipline: held for the whole write-then-read round-trip
    io: tokio::sync::Mutex<Option<WorkerIo>>,
    child: tokio::sync::Mutex<Option<Child>>,
    cleanup_done: tokio::sync::Mutex<bool>,
}

impl SessionHandle {
    /// Spawn a worker, deliver the credentials line, and wait for its init line
    ///
    /// On any failure the child is killed before returning; removing the data
    /// dir is the caller's job.
    pub async fn spawn(
        spec: WorkerSpec,
        password: &SecretString,
        init_timeout: Duration,
        command_timeout: Duration,
    ) -> SessionResult<Self> {
        let stderr = match std::fs::File::create(spec.data_dir.join("worker.log")) {
            Ok(file) => Stdio::from(file),
            Err(_) => Stdio::null(),
        };

        let mut child = Command::new(&spec.program)
            .arg("--id")
            .arg(&spec.session_id)
            .arg("--login")
            .arg(spec.login.to_string())
            .arg("--server")
            .arg(&spec.server)
            .arg("--data-dir")
            .arg(&spec.data_dir)
            .arg("--exe-path")
            .arg(&spec.terminal_exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn(format!("{}: {e}", spec.program.display())))?;

        let worker_pid = child.id();

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Spawn("worker has no stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Spawn("worker has no stdout pipe".into()))?;
        let mut stdout = BufReader::new(stdout);

        // Credentials travel over the pipe, never on argv
        let mut credentials =
            serde_json::to_string(&CredentialsMessage::new(password.expose_secret().as_str()))
                .expect("credentials message serializes");
        credentials.push('\n');
        if let Err(e) = stdin.write_all(credentials.as_bytes()).await {
            child.kill().await.ok();
            return Err(SessionError::Init(format!(
                "failed to deliver credentials: {e}"
            )));
        }
        drop(credentials);

        let mut line = String::new();
        let init: InitMessage = match timeout(init_timeout, stdout.read_line(&mut line)).await {
            Err(_) => {
                child.kill().await.ok();
                return Err(SessionError::Init(format!(
                    "worker did not report initialization within {}s",
                    init_timeout.as_secs()
                )));
            }
            Ok(Err(e)) => {
                child.kill().await.ok();
                return Err(SessionError::Init(format!(
                    "failed to read init message: {e}"
                )));
            }
            Ok(Ok(0)) => {
                child.kill().await.ok();
                return Err(SessionError::Init(
                    "worker exited before reporting initialization".into(),
                ));
            }
            Ok(Ok(_)) => match serde_json::from_str(line.trim()) {
                Ok(init) => init,
                Err(e) => {
                    child.kill().await.ok();
                    return Err(SessionError::Init(format!("malformed init message: {e}")));
                }
            },
        };

        if !init.success {
            // The worker exits on its own after a failed init
            child.kill().await.ok();
            return Err(SessionError::Init(
                init.error
                    .unwrap_or_else(|| "unknown initialization error".into()),
            ));
        }

        let now = Utc::now();
        info!(
            session_id = %spec.session_id,
            login = spec.login,
            server = %spec.server,
            worker_pid = ?worker_pid,
            mt5_pid = ?init.mt5_pid,
            "Worker initialized"
        );

        Ok(Self {
            id: spec.session_id,
            login: spec.login,
            server: spec.server,
            data_dir: spec.data_dir,
            terminal_exe: spec.terminal_exe,
            created_at: now,
            last_accessed: parking_lot::Mutex::new(now),
            healthy: AtomicBool::new(true),
            command_timeout,
            worker_pid,
            mt5_pid: init.mt5_pid,
            io: tokio::sync::Mutex::new(Some(WorkerIo { stdin, stdout })),
            child: tokio::sync::Mutex::new(Some(child)),
            cleanup_done: tokio::sync::Mutex::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn login(&self) -> i64 {
        self.login
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        *self.last_accessed.lock()
    }

    /// Pid of the worker process, if it was still running at spawn time
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker_pid
    }

    /// Pid of the terminal the worker reported at init, if any
    pub fn mt5_pid(&self) -> Option<u32> {
        self.mt5_pid
    }

    /// False once a round-trip timed out or the pipes failed
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Snapshot for listings; never exposes the handle itself
    pub fn info(&self) -> SessionInfo {
        let last_accessed = self.last_accessed();
        let age = Utc::now() - last_accessed;
        SessionInfo {
            id: self.id.clone(),
            login: self.login,
            server: self.server.clone(),
            created_at: self.created_at,
            last_accessed,
            age_seconds: (age.num_milliseconds().max(0) as f64) / 1000.0,
        }
    }

    /// One command, one response, with the default timeout
    pub async fn send_command(&self, request: &CommandRequest) -> SessionResult<CommandResponse> {
        self.send_command_with_timeout(request, self.command_timeout)
            .await
    }

    /// One command, one response, within `budget`
    ///
    /// Commands from concurrent callers are totally ordered by the pipe
    /// mutex. `last_accessed` moves only on completed round-trips; vendor
    /// errors count, pipe failures do not.
    pub async fn send_command_with_timeout(
        &self,
        request: &CommandRequest,
        budget: Duration,
    ) -> SessionResult<CommandResponse> {
        let mut io_guard = self.io.lock().await;
        let io = io_guard
            .as_mut()
            .ok_or_else(|| SessionError::WorkerDead("session is closed".into()))?;

        let mut line = serde_json::to_string(request)
            .map_err(|e| SessionError::Protocol(format!("unserializable request: {e}")))?;
        line.push('\n');

        if let Err(e) = io.stdin.write_all(line.as_bytes()).await {
            self.healthy.store(false, Ordering::Relaxed);
            return Err(SessionError::WorkerDead(format!(
                "failed to write request: {e}"
            )));
        }

        let mut response_line = String::new();
        let read = timeout(budget, io.stdout.read_line(&mut response_line)).await;
        let response: CommandResponse = match read {
            Err(_) => {
                self.healthy.store(false, Ordering::Relaxed);
                return Err(SessionError::Timeout(budget));
            }
            Ok(Err(e)) => {
                self.healthy.store(false, Ordering::Relaxed);
                return Err(SessionError::WorkerDead(format!(
                    "failed to read response: {e}"
                )));
            }
            Ok(Ok(0)) => {
                self.healthy.store(false, Ordering::Relaxed);
                return Err(SessionError::WorkerDead("worker closed its stdout".into()));
            }
            Ok(Ok(_)) => match serde_json::from_str(response_line.trim()) {
                Ok(response) => response,
                Err(e) => {
                    self.healthy.store(false, Ordering::Relaxed);
                    return Err(SessionError::Protocol(format!(
                        "unparseable response line: {e}"
                    )));
                }
            },
        };

        // A stale line (left over from a timed-out round-trip) answers the
        // wrong request; the echoed command name exposes it.
        if let Some(echoed) = &response.command {
            if echoed != &request.command {
                self.healthy.store(false, Ordering::Relaxed);
                return Err(SessionError::Protocol(format!(
                    "response for '{echoed}' does not match request '{}'",
                    request.command
                )));
            }
        }

        self.touch();
        self.healthy.store(true, Ordering::Relaxed);

        if response.success {
            Ok(response)
        } else {
            Err(SessionError::Vendor(
                response
                    .error
                    .unwrap_or_else(|| "unknown vendor error".into()),
            ))
        }
    }

    /// Ordered teardown; idempotent and safe from any caller
    ///
    /// Every step is best-effort: terminate request, close stdin, bounded
    /// wait, SIGTERM, bounded wait, kill, reap the terminal process by
    /// executable path, remove the data dir. Failures are logged and never
    /// surface.
    pub async fn cleanup(&self) {
        let mut done = self.cleanup_done.lock().await;
        if *done {
            return;
        }
        debug!(session_id = %self.id, "Tearing down session");

        // Steps 1-2: terminate request, then close stdin by dropping the
        // pipes. Skipped when a command is mid-flight; process teardown
        // below unblocks that caller with a pipe error.
        if let Ok(mut guard) = self.io.try_lock() {
            if let Some(mut io) = guard.take() {
                let mut line = serde_json::to_string(&CommandRequest::terminate())
                    .expect("terminate request serializes");
                line.push('\n');
                let _ = io.stdin.write_all(line.as_bytes()).await;
                let _ = io.stdin.flush().await;
            }
        }

        // Steps 3-5: bounded waits, escalating to SIGTERM and then kill
        if let Some(mut child) = self.child.lock().await.take() {
            match timeout(GRACEFUL_EXIT_WAIT, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(session_id = %self.id, ?status, "Worker exited");
                }
                Ok(Err(e)) => {
                    warn!(session_id = %self.id, error = %e, "Failed to wait for worker, killing");
                    child.kill().await.ok();
                }
                Err(_) => {
                    warn!(session_id = %self.id, "Worker ignored terminate, signaling");
                    signal_terminate(&child);
                    if timeout(SIGNAL_EXIT_WAIT, child.wait()).await.is_err() {
                        warn!(session_id = %self.id, "Worker ignored signal, killing");
                        child.kill().await.ok();
                    }
                }
            }
        }

        // Step 6: the terminal the vendor library spawned outlives a killed
        // worker; match it by executable path so unrelated instances survive.
        if self.mt5_pid.is_some() {
            let exe = self.terminal_exe.clone();
            let session_id = self.id.clone();
            let _ = tokio::task::spawn_blocking(move || {
                let killed = kill_processes_by_exe(&exe);
                if killed > 0 {
                    debug!(session_id = %session_id, killed, "Reaped terminal processes");
                }
            })
            .await;
        }

        // Step 7: the data dir goes last
        let data_dir = self.data_dir.clone();
        let session_id = self.id.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Err(e) = std::fs::remove_dir_all(&data_dir) {
                if data_dir.exists() {
                    warn!(session_id = %session_id, error = %e, "Failed to remove data dir");
                }
            }
        })
        .await;

        *done = true;
        info!(session_id = %self.id, "Session torn down");
    }

    fn touch(&self) {
        let mut last = self.last_accessed.lock();
        let now = Utc::now();
        if now > *last {
            *last = now;
        }
    }
}

#[cfg(unix)]
fn signal_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "Failed to send SIGTERM to worker");
        }
    }
}

#[cfg(not(unix))]
fn signal_terminate(_child: &Child) {}

/// Kill every process whose executable path equals `exe`; returns the count
///
/// Used for the terminal instance the vendor library launched inside a
/// session's data dir. The exact-path match keeps other sessions' terminals
/// untouched.
pub(crate) fn kill_processes_by_exe(exe: &Path) -> usize {
    let canonical = exe.canonicalize().unwrap_or_else(|_| exe.to_path_buf());
    let mut sys = System::new_all();

    let mut killed = 0;
    for (pid, process) in sys.processes() {
        let Some(proc_exe) = process.exe() else {
            continue;
        };
        if (proc_exe == canonical.as_path() || proc_exe == exe) && process.kill() {
            debug!(pid = pid.as_u32(), exe = %exe.display(), "Killed terminal process");
            killed += 1;
        }
    }

    if killed > 0 {
        let deadline = std::time::Instant::now() + TERMINAL_KILL_WAIT;
        loop {
            sys.refresh_processes();
            let alive = sys.processes().values().any(|p| {
                p.exe()
                    .map(|e| e == canonical.as_path() || e == exe)
                    .unwrap_or(false)
            });
            if !alive || std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    killed
}
