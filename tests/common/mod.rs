#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use multiterm::api::{self, AppState, RouterConfig};
use multiterm::config::SessionConfig;
use multiterm::project::MarkerProjects;
use multiterm::pty::{
    ProcessEvent, ProcessHandle, ProcessSpawner, PtyError, Resize, Signal, SpawnRequest,
    SpawnedProcess,
};
use multiterm::session::SessionRegistry;
use multiterm::shutdown::ShutdownCoordinator;

pub const PROJECT_ID: &str = "p1";

/// A process that never runs anything: tests drive its output and exit, and
/// inspect what the registry wrote, resized and signalled.
pub struct FakeProcess {
    pid: u32,
    events: mpsc::Sender<ProcessEvent>,
    exited: AtomicBool,
    /// When false, SIGTERM is recorded but ignored (only SIGKILL ends it).
    obeys_terminate: bool,
    /// When set, writes fail as if the input queue were full.
    pub queue_full: AtomicBool,
    pub writes: Mutex<Vec<Bytes>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    pub signals: Mutex<Vec<Signal>>,
}

impl FakeProcess {
    /// Emit a chunk of output.
    pub fn emit(&self, data: &str) {
        let _ = self
            .events
            .try_send(ProcessEvent::Output(Bytes::copy_from_slice(data.as_bytes())));
    }

    /// Emit the exit event. Only the first call has any effect.
    pub fn exit(&self, code: Option<i32>) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            let _ = self.events.try_send(ProcessEvent::Exit(code));
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.writes.lock().iter().flat_map(|b| b.to_vec()).collect()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }
}

impl Resize for FakeProcess {
    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.resizes.lock().push((cols, rows));
        Ok(())
    }
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_pty(&self) -> bool {
        true
    }

    fn write(&self, data: Bytes) -> Result<(), PtyError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(PtyError::InputClosed);
        }
        if self.queue_full.load(Ordering::SeqCst) {
            return Err(PtyError::InputQueueFull);
        }
        self.writes.lock().push(data);
        Ok(())
    }

    fn resizer(&self) -> Option<&dyn Resize> {
        Some(self)
    }

    fn kill(&self, signal: Signal) {
        if self.has_exited() {
            return;
        }
        self.signals.lock().push(signal);
        if signal == Signal::Kill || self.obeys_terminate {
            self.exit(None);
        }
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Spawner handing out [`FakeProcess`]es and remembering every request.
pub struct ScriptedSpawner {
    obeys_terminate: bool,
    next_pid: AtomicU32,
    pub requests: Mutex<Vec<SpawnRequest>>,
    pub processes: Mutex<Vec<Arc<FakeProcess>>>,
}

impl ScriptedSpawner {
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// Processes spawned by this spawner shrug off SIGTERM.
    pub fn stubborn() -> Arc<Self> {
        Self::build(false)
    }

    fn build(obeys_terminate: bool) -> Arc<Self> {
        Arc::new(Self {
            obeys_terminate,
            next_pid: AtomicU32::new(4000),
            requests: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
        })
    }

    /// The most recently spawned process.
    pub fn last(&self) -> Arc<FakeProcess> {
        self.processes
            .lock()
            .last()
            .cloned()
            .expect("nothing spawned yet")
    }
}

impl ProcessSpawner for ScriptedSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, PtyError> {
        let (events, rx) = mpsc::channel(256);
        let process = Arc::new(FakeProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            events,
            exited: AtomicBool::new(false),
            obeys_terminate: self.obeys_terminate,
            queue_full: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
        });
        self.requests.lock().push(request.clone());
        self.processes.lock().push(process.clone());
        Ok(SpawnedProcess {
            handle: process,
            events: rx,
        })
    }
}

/// A temporary directory carrying a valid project marker.
pub fn project_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_marker(dir.path(), PROJECT_ID, "demo");
    dir
}

pub fn write_marker(dir: &Path, id: &str, name: &str) {
    std::fs::create_dir_all(dir.join(".multiterm")).unwrap();
    std::fs::write(
        dir.join(".multiterm/project.json"),
        serde_json::json!({ "id": id, "name": name }).to_string(),
    )
    .unwrap();
}

pub fn registry(
    spawner: Arc<ScriptedSpawner>,
    roots: Vec<PathBuf>,
    config: SessionConfig,
) -> SessionRegistry {
    SessionRegistry::new(spawner, Arc::new(MarkerProjects::new(roots)), config)
}

pub fn app_state(sessions: SessionRegistry) -> AppState {
    AppState {
        sessions,
        shutdown: ShutdownCoordinator::new(),
    }
}

pub fn app(state: AppState) -> axum::Router {
    api::router(state, RouterConfig::default())
}

/// Serve the router on an ephemeral local port.
pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
