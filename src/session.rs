use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::config::SessionConfig;
use crate::project::ProjectAuthority;
use crate::pty::{ProcessEvent, ProcessHandle, ProcessSpawner, PtyError, Signal, SpawnRequest};
use crate::rate_limit::RateLimiter;
use crate::tracker::{self, TrackedSession};

/// Project id recorded for sessions created from a bare `cwd`.
pub const ADHOC_PROJECT: &str = "adhoc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
    /// The process could not be spawned.
    Failed,
}

impl SessionStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Exited | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Failed => "failed",
        }
    }
}

/// Snapshot of a session's metadata, as served over the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub cwd: PathBuf,
    pub command: Vec<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub scrollback_lines: usize,
    pub pty: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InputError {
    #[error("input chunk of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("input rate limit exceeded")]
    RateLimited,
    #[error("session process is not accepting input")]
    ProcessUnavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("cwd must be a known project directory with .multiterm/project.json")]
    InvalidCwd,
    #[error("unknown project: {0}")]
    UnknownProject(String),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error(transparent)]
    Input(#[from] InputError),
}

/// One live session: process handle, output bus, input limiter and metadata.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    id: Arc<str>,
    meta: Arc<RwLock<SessionInfo>>,
    bus: Bus,
    limiter: Arc<RateLimiter>,
    process: Option<Arc<dyn ProcessHandle>>,
    input_chunk_max: usize,
    /// Fires when the session is removed from the registry. Stream handlers
    /// watch it so they close instead of serving a ghost session.
    pub cancelled: CancellationToken,
    /// Fires once the process has exited (or never started).
    exited: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.meta.read().status)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn info(&self) -> SessionInfo {
        let mut info = self.meta.read().clone();
        info.scrollback_lines = self.bus.line_count();
        info
    }

    pub fn status(&self) -> SessionStatus {
        self.meta.read().status
    }

    /// Resolves once the process has exited.
    pub async fn wait_exited(&self) {
        self.exited.cancelled().await
    }

    /// Forward input to the process after the size and rate checks.
    ///
    /// Both the HTTP input endpoint and the streaming channel go through here.
    pub fn submit_input(&self, data: Bytes) -> Result<(), InputError> {
        if data.len() > self.input_chunk_max {
            return Err(InputError::TooLarge {
                size: data.len(),
                max: self.input_chunk_max,
            });
        }
        let process = match self.process.as_ref() {
            Some(process) if !process.has_exited() => process,
            _ => return Err(InputError::ProcessUnavailable),
        };
        let bytes = data.len();
        if !self.limiter.allow(bytes) {
            return Err(InputError::RateLimited);
        }
        // Only delivered bytes count against the budget.
        process.write(data).map_err(|e| {
            self.limiter.release(bytes);
            match e {
                PtyError::InputQueueFull => InputError::RateLimited,
                _ => InputError::ProcessUnavailable,
            }
        })?;
        tracing::debug!(session = %self.id, bytes, "io.input");
        Ok(())
    }

    /// Resize the terminal. A no-op for processes without a pty.
    pub fn resize(&self, cols: u16, rows: u16) {
        let Some(resizer) = self.process.as_deref().and_then(|p| p.resizer()) else {
            return;
        };
        if let Err(e) = resizer.resize(cols, rows) {
            tracing::warn!(session = %self.id, error = %e, "failed to resize");
        }
    }

    /// SIGTERM now, SIGKILL after `grace` unless the process exits first.
    fn terminate(&self, grace: Duration) -> Option<tokio::task::JoinHandle<()>> {
        let process = self.process.clone()?;
        if process.has_exited() {
            return None;
        }
        process.kill(Signal::Terminate);
        let exited = self.exited.clone();
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = exited.cancelled() => {}
                _ = tokio::time::sleep(grace) => process.kill(Signal::Kill),
            }
        }))
    }

    fn kill(&self) {
        if let Some(process) = &self.process {
            process.kill(Signal::Kill);
        }
    }

    fn mark_running(&self) {
        let mut meta = self.meta.write();
        if meta.status == SessionStatus::Starting {
            meta.status = SessionStatus::Running;
        }
    }

    fn mark_exited(&self, code: Option<i32>) {
        {
            let mut meta = self.meta.write();
            meta.status = SessionStatus::Exited;
            meta.exit_code = code;
            meta.exited_at = Some(Utc::now());
        }
        self.exited.cancel();
    }
}

/// Parameters of a session create request.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub project_id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub argv: Option<Vec<String>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
}

/// In-memory map of session id to live session. All lifecycle mutations go
/// through here.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    spawner: Arc<dyn ProcessSpawner>,
    projects: Arc<dyn ProjectAuthority>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        projects: Arc<dyn ProjectAuthority>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
            })),
            spawner,
            projects,
            config,
        }
    }

    pub fn spawner(&self) -> &Arc<dyn ProcessSpawner> {
        &self.spawner
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Validate, spawn and register a new session.
    ///
    /// Spawning forks a process, so async callers should run this on a
    /// blocking thread. It must still run inside the tokio runtime.
    pub fn create(&self, request: CreateSession) -> Result<SessionInfo, RegistryError> {
        let cwd = match &request.project_id {
            Some(project_id) => self
                .projects
                .resolve(project_id)
                .ok_or_else(|| RegistryError::UnknownProject(project_id.clone()))?,
            None => request.cwd.clone().ok_or(RegistryError::InvalidCwd)?,
        };
        if !self.projects.is_authorized(&cwd) {
            return Err(RegistryError::InvalidCwd);
        }
        if self.len() >= self.config.max_sessions {
            return Err(RegistryError::MaxSessionsReached);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let command = request.argv.clone().unwrap_or_default();
        let spawn = self.spawner.spawn(&SpawnRequest {
            cwd: cwd.clone(),
            argv: request.argv.clone(),
            cols: request.cols.unwrap_or(self.config.default_cols),
            rows: request.rows.unwrap_or(self.config.default_rows),
        });

        let created_at = Utc::now();
        let (process, events) = match spawn {
            Ok(spawned) => (Some(spawned.handle), Some(spawned.events)),
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "failed to spawn session process");
                (None, None)
            }
        };
        let meta = SessionInfo {
            id: id.clone(),
            project_id: request
                .project_id
                .clone()
                .unwrap_or_else(|| ADHOC_PROJECT.to_string()),
            pid: process.as_ref().and_then(|p| p.pid()),
            cwd: cwd.clone(),
            command: command.clone(),
            status: if process.is_some() {
                SessionStatus::Starting
            } else {
                SessionStatus::Failed
            },
            created_at,
            exited_at: process.is_none().then_some(created_at),
            exit_code: None,
            scrollback_lines: 0,
            pty: process.as_ref().is_some_and(|p| p.is_pty()),
        };

        let session = Session {
            id: Arc::from(id.as_str()),
            meta: Arc::new(RwLock::new(meta)),
            bus: Bus::with_max_lines(id.as_str(), self.config.max_scrollback_lines),
            limiter: Arc::new(RateLimiter::new(
                self.config.input_bytes_per_sec,
                Duration::from_secs(1),
            )),
            process,
            input_chunk_max: self.config.input_chunk_max,
            cancelled: CancellationToken::new(),
            exited: CancellationToken::new(),
        };
        if session.process.is_none() {
            session.exited.cancel();
        }

        {
            let mut inner = self.inner.write();
            // Re-check under the write lock: concurrent creates may have raced
            // past the early check while this one was spawning.
            if inner.sessions.len() >= self.config.max_sessions {
                drop(inner);
                session.kill();
                return Err(RegistryError::MaxSessionsReached);
            }
            inner.sessions.insert(id.clone(), session.clone());
        }

        let info = session.info();
        if let Some(events) = events {
            tracing::info!(session = %id, cwd = %cwd.display(), pty = info.pty, pid = ?info.pid, "session spawned");
            tracker::record_start(&id, info.pid, &command, &cwd, created_at);
            tokio::spawn(pump_events(session, events));
        }
        Ok(info)
    }

    /// Look up a session by id, returning a clone if found.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().sessions.get(id).cloned()
    }

    fn require(&self, id: &str) -> Result<Session, RegistryError> {
        self.get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Snapshot of every session's metadata, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self
            .inner
            .read()
            .sessions
            .values()
            .map(Session::info)
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), RegistryError> {
        self.require(id)?.resize(cols, rows);
        Ok(())
    }

    /// Graceful stop with forceful fallback after the grace period.
    /// Harmless on a session whose process already exited.
    pub fn stop(&self, id: &str) -> Result<(), RegistryError> {
        let session = self.require(id)?;
        if session.terminate(self.config.stop_grace()).is_some() {
            tracing::info!(session = %id, "session stop requested");
        }
        Ok(())
    }

    /// Kill the process immediately and drop the session without waiting
    /// for the exit to be observed.
    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let session = self
            .inner
            .write()
            .sessions
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        session.cancelled.cancel();
        session.kill();
        tracing::info!(session = %id, "session removed");
        Ok(())
    }

    /// Size- and rate-checked write into a session's process.
    pub fn write(&self, id: &str, data: Bytes) -> Result<(), RegistryError> {
        self.require(id)?.submit_input(data)?;
        Ok(())
    }

    /// Terminate every live session, escalating to a kill after the grace
    /// period. Returns the escalation task so the caller can await it.
    ///
    /// Drains the map under a single write lock so that sessions created by
    /// in-flight requests cannot escape.
    pub fn shutdown_all(&self) -> Option<tokio::task::JoinHandle<()>> {
        let sessions: Vec<Session> = {
            let mut inner = self.inner.write();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return None;
        }
        tracing::info!(count = sessions.len(), "terminating all sessions");
        let grace = self.config.stop_grace();
        let escalations: Vec<_> = sessions
            .iter()
            .filter_map(|session| {
                session.cancelled.cancel();
                session.terminate(grace)
            })
            .collect();
        Some(tokio::spawn(async move {
            futures::future::join_all(escalations).await;
        }))
    }

    /// Session history recorded in every known project directory.
    pub fn tracked(&self) -> Vec<TrackedSession> {
        tracker::list_tracked(&self.projects.project_dirs())
    }
}

/// Drive a session from its process events until the process exits.
async fn pump_events(session: Session, mut events: mpsc::Receiver<ProcessEvent>) {
    let mut code = None;
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Output(data) => {
                let bytes = data.len();
                session.bus.push(data);
                session.mark_running();
                tracing::debug!(session = %session.id, bytes, "io.output");
            }
            ProcessEvent::Exit(exit_code) => {
                code = exit_code;
                break;
            }
        }
    }
    session.mark_exited(code);
    tracing::info!(session = %session.id, code = ?code, "session exited");

    let cwd = session.meta.read().cwd.clone();
    let id = session.id.to_string();
    let _ = tokio::task::spawn_blocking(move || tracker::record_exit(&cwd, &id, code)).await;
}
