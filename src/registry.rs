//! Session registry and idle reaper
//!
//! Process-wide map from session id to [`SessionHandle`], behind short
//! critical sections. Command dispatch and teardown always run outside the
//! registry lock; only lookup, insertion, removal, and snapshotting happen
//! under it.

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use secrecy::SecretString;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::{SessionError, SessionResult};
use crate::handle::{kill_processes_by_exe, SessionHandle, SessionInfo, WorkerSpec};
use crate::protocol::{CommandRequest, CommandResponse};
use crate::provision;
use crate::template::TemplateBuilder;

/// Concurrent teardowns during a registry drain
const CLEANUP_FANOUT: usize = 8;

/// Thread-safe owner of every live session in the process
pub struct SessionRegistry {
    config: BridgeConfig,
    template: TemplateBuilder,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    shutdown: AtomicBool,
}

impl SessionRegistry {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let template = TemplateBuilder::from_config(&config);
        Arc::new(Self {
            config,
            template,
            sessions: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Provision a data dir, spawn a worker, and register the session
    ///
    /// Failure anywhere on this path kills whatever was started and removes
    /// the partial data dir; nothing leaks into the registry.
    pub async fn create_session(
        &self,
        login: i64,
        password: SecretString,
        server: &str,
    ) -> SessionResult<String> {
        let session_id = generate_session_id();

        let provisioned = {
            let template = self.template.clone();
            let base = self.config.sessions_base_path.clone();
            let id = session_id.clone();
            tokio::task::spawn_blocking(move || {
                let template_dir = template.ensure()?;
                provision::provision(&base, &template_dir, &id)
            })
            .await
            .map_err(|e| SessionError::Provision(format!("provisioning task failed: {e}")))?
        };
        let data_dir = match provisioned {
            Ok(data_dir) => data_dir,
            Err(e) => {
                // A copy that failed partway leaves a partial dir behind
                let base = self.config.sessions_base_path.clone();
                let id = session_id.clone();
                let _ = tokio::task::spawn_blocking(move || provision::remove(&base, &id)).await;
                return Err(SessionError::Provision(e.to_string()));
            }
        };

        let spec = WorkerSpec {
            program: self.worker_program(),
            session_id: session_id.clone(),
            login,
            server: server.to_string(),
            terminal_exe: data_dir.join(self.config.terminal_file_name()),
            data_dir,
        };
        let terminal_exe = spec.terminal_exe.clone();

        let handle = match SessionHandle::spawn(
            spec,
            &password,
            self.config.init_timeout(),
            self.config.command_timeout(),
        )
        .await
        {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Session creation failed");
                self.scrub_failed_create(&session_id, terminal_exe).await;
                return Err(e);
            }
        };

        self.sessions
            .write()
            .insert(session_id.clone(), Arc::clone(&handle));

        info!(
            session_id = %session_id,
            login,
            server,
            active = self.session_count(),
            "Session created"
        );
        Ok(session_id)
    }

    /// Atomic lookup; does not touch the idle clock
    ///
    /// Touching happens inside `send_command` only. A caller that wants
    /// "touch on reference" semantics can dispatch a `ping`; touching here
    /// would hide a deadlocked session from the reaper.
    pub fn get_session(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Lookup-and-dispatch with the default command timeout
    pub async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        params: Value,
    ) -> SessionResult<CommandResponse> {
        self.execute_command_with_timeout(session_id, command, params, None)
            .await
    }

    /// Lookup-and-dispatch; `budget` overrides the default timeout
    ///
    /// A fatal pipe failure, or any non-vendor failure on a session that was
    /// already unhealthy, evicts and tears down the session.
    pub async fn execute_command_with_timeout(
        &self,
        session_id: &str,
        command: &str,
        params: Value,
        budget: Option<Duration>,
    ) -> SessionResult<CommandResponse> {
        let handle = self
            .get_session(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let was_healthy = handle.is_healthy();
        let request = CommandRequest::with_params(command, params);
        let result = match budget {
            Some(budget) => handle.send_command_with_timeout(&request, budget).await,
            None => handle.send_command(&request).await,
        };

        if let Err(e) = &result {
            if e.is_fatal() || (!was_healthy && !e.is_vendor()) {
                warn!(session_id, error = %e, "Session is broken, evicting");
                self.cleanup_session(session_id).await;
            }
        }

        result
    }

    /// Point-in-time snapshot of all sessions, keyed by id
    pub fn list_sessions(&self) -> HashMap<String, SessionInfo> {
        self.sessions
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.info()))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Remove-then-teardown; returns whether anything was removed
    pub async fn cleanup_session(&self, session_id: &str) -> bool {
        let handle = self.sessions.write().remove(session_id);
        match handle {
            Some(handle) => {
                handle.cleanup().await;
                true
            }
            None => false,
        }
    }

    /// Evict every session idle for longer than `max_age_seconds`
    ///
    /// Candidates are selected and unregistered under one lock acquisition
    /// so a concurrent command cannot resurrect an evicted entry; the
    /// teardowns run after the lock is gone.
    pub async fn cleanup_old_sessions(&self, max_age_seconds: u64) -> Vec<String> {
        let now = chrono::Utc::now();
        let max_age_ms = (max_age_seconds as i64).saturating_mul(1000);

        let expired: Vec<(String, Arc<SessionHandle>)> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, handle)| {
                    (now - handle.last_accessed()).num_milliseconds() > max_age_ms
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|handle| (id, handle)))
                .collect()
        };

        let removed: Vec<String> = expired.iter().map(|(id, _)| id.clone()).collect();
        stream::iter(expired)
            .for_each_concurrent(CLEANUP_FANOUT, |(_, handle)| async move {
                handle.cleanup().await;
            })
            .await;

        removed
    }

    /// Drain the registry, tearing sessions down concurrently; returns the count
    pub async fn close_all_sessions(&self) -> usize {
        let drained: Vec<Arc<SessionHandle>> =
            self.sessions.write().drain().map(|(_, handle)| handle).collect();
        let count = drained.len();

        stream::iter(drained)
            .for_each_concurrent(CLEANUP_FANOUT, |handle| async move {
                handle.cleanup().await;
            })
            .await;

        if count > 0 {
            info!(count, "Closed all sessions");
        }
        count
    }

    /// Start the idle-eviction loop; exactly one per process
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                registry.config.reaper_interval_seconds,
            ));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if registry.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let removed = registry
                    .cleanup_old_sessions(registry.config.session_idle_timeout_seconds)
                    .await;
                if !removed.is_empty() {
                    info!(count = removed.len(), "Reaped idle sessions");
                }
            }
        })
    }

    /// Stop the reaper at its next tick
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Undo a partially-created session: terminal process first, then the dir
    async fn scrub_failed_create(&self, session_id: &str, terminal_exe: PathBuf) {
        let base = self.config.sessions_base_path.clone();
        let id = session_id.to_string();
        let _ = tokio::task::spawn_blocking(move || {
            kill_processes_by_exe(&terminal_exe);
            provision::remove(&base, &id);
        })
        .await;
    }

    fn worker_program(&self) -> PathBuf {
        if let Some(command) = &self.config.worker_command {
            return command.clone();
        }
        let name = if cfg!(windows) { "mt5-worker.exe" } else { "mt5-worker" };
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
            .unwrap_or_else(|| PathBuf::from(name))
    }
}

/// Opaque session id: 256 bits of randomness as a 64-char hex string
fn generate_session_id() -> String {
    hex::encode(Sha256::digest(Uuid::new_v4().as_bytes()))
}
