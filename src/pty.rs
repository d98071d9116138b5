//! Process handles: the capability interface the session registry drives,
//! plus the pseudo-terminal and plain-pipe implementations behind it.
//!
//! A spawner returns a [`SpawnedProcess`]: a shared [`ProcessHandle`] for
//! writes, resizes and signals, and an event receiver that yields every
//! chunk of output followed by exactly one [`ProcessEvent::Exit`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtyPair, PtySize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Capacity of the output event channel. The reader blocks when it is full,
/// which pushes backpressure into the kernel buffer and the child process.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the per-process input queue.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// How long the exit monitor waits for the output reader to drain before
/// emitting the exit event anyway (background children can hold the pty open).
/// Output read after the exit event is discarded.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_BUF_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command in pty: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnPipe(#[source] std::io::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("process input queue is full")]
    InputQueueFull,

    #[error("process is no longer accepting input")]
    InputClosed,
}

/// Termination signals a handle understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful: SIGTERM.
    Terminate,
    /// Forceful: SIGKILL.
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(Bytes),
    /// Emitted exactly once, after all output. `None` when the process was
    /// terminated by a signal or the code is unknown.
    Exit(Option<i32>),
}

/// Optional resize capability. Pipe-backed processes do not have one.
pub trait Resize: Send + Sync {
    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;
}

/// A live process owned by exactly one session.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Whether the process runs inside a pseudo-terminal.
    fn is_pty(&self) -> bool;

    /// Queue raw bytes for the process's input. Never blocks.
    fn write(&self, data: Bytes) -> Result<(), PtyError>;

    fn resizer(&self) -> Option<&dyn Resize> {
        None
    }

    /// Signal the process. A no-op once it has exited.
    fn kill(&self, signal: Signal);

    fn has_exited(&self) -> bool;
}

/// Everything needed to start a session's process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub cwd: PathBuf,
    /// Full argv, executable first. `None` or empty means the default shell.
    pub argv: Option<Vec<String>>,
    pub cols: u16,
    pub rows: u16,
}

pub struct SpawnedProcess {
    pub handle: Arc<dyn ProcessHandle>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// Factory for process handles.
pub trait ProcessSpawner: Send + Sync {
    /// Start a process. Must be called from within a tokio runtime.
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, PtyError>;
}

/// Spawns into a pseudo-terminal when possible, plain pipes otherwise.
#[derive(Debug, Clone)]
pub struct NativeSpawner {
    prefer_pty: bool,
}

impl Default for NativeSpawner {
    fn default() -> Self {
        Self { prefer_pty: true }
    }
}

impl NativeSpawner {
    /// A spawner that never allocates a pty.
    pub fn pipes_only() -> Self {
        Self { prefer_pty: false }
    }
}

impl ProcessSpawner for NativeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, PtyError> {
        let (program, args) = resolve_argv(request.argv.as_deref());
        if self.prefer_pty {
            match spawn_pty(&program, &args, request) {
                Ok(spawned) => {
                    tracing::info!(cmd = %program, cwd = %request.cwd.display(), "spawned in pty");
                    return Ok(spawned);
                }
                Err(e) => {
                    tracing::warn!(error = %e, cmd = %program, "pty unavailable, falling back to pipes");
                }
            }
        }
        let spawned = spawn_pipes(&program, &args, &request.cwd)?;
        tracing::info!(cmd = %program, cwd = %request.cwd.display(), "spawned with pipes");
        Ok(spawned)
    }
}

/// Split an argv into program and arguments, substituting the default shell
/// when no argv was given.
pub fn resolve_argv(argv: Option<&[String]>) -> (String, Vec<String>) {
    match argv {
        Some([program, args @ ..]) => (program.clone(), args.to_vec()),
        _ => default_shell(),
    }
}

/// `$MULTITERM_SHELL`, else `$SHELL`, else `/bin/sh`. Shells that support it
/// are started as login shells.
pub fn default_shell() -> (String, Vec<String>) {
    let shell = std::env::var("MULTITERM_SHELL")
        .or_else(|_| std::env::var("SHELL"))
        .unwrap_or_else(|_| "/bin/sh".to_string());
    let base = Path::new(&shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let args = match base {
        "bash" | "zsh" | "fish" => vec!["-l".to_string()],
        _ => Vec::new(),
    };
    (shell, args)
}

// ── Signals ────────────────────────────────────────────────────────

/// Signal the process group led by `pid`.
///
/// Both portable_pty (setsid) and the pipe spawner (process_group(0)) make
/// the child a group leader, so children of the shell are signalled too.
fn signal_group(pid: Option<u32>, exited: &AtomicBool, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return;
    }
    if exited.load(Ordering::Acquire) {
        tracing::debug!(pid, ?signal, "process already exited, skipping signal");
        return;
    }
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        unsafe {
            libc::kill(-(pid as i32), sig);
        }
    }
    #[cfg(not(unix))]
    tracing::warn!(pid, ?signal, "process signals are not supported on this platform");
}

// ── Pseudo-terminal ────────────────────────────────────────────────

struct PtyProcess {
    pid: Option<u32>,
    master: parking_lot::Mutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::Sender<Bytes>,
    exited: Arc<AtomicBool>,
}

impl Resize for PtyProcess {
    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }
}

impl ProcessHandle for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_pty(&self) -> bool {
        true
    }

    fn write(&self, data: Bytes) -> Result<(), PtyError> {
        queue_input(&self.input_tx, data)
    }

    fn resizer(&self) -> Option<&dyn Resize> {
        Some(self)
    }

    fn kill(&self, signal: Signal) {
        signal_group(self.pid, &self.exited, signal);
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// The one way into a process's event channel, shared by its readers and its
/// exit monitor. Sends are serialized, and the exit event closes the gate, so
/// `Exit` is always the last event even when a reader outlives the drain
/// timeout.
#[derive(Clone)]
struct EventGate(Arc<tokio::sync::Mutex<Option<mpsc::Sender<ProcessEvent>>>>);

impl EventGate {
    fn new(tx: mpsc::Sender<ProcessEvent>) -> Self {
        Self(Arc::new(tokio::sync::Mutex::new(Some(tx))))
    }

    /// Blocking-thread variant of [`EventGate::output`].
    fn blocking_output(&self, data: Bytes) -> bool {
        let tx = self.0.blocking_lock();
        match tx.as_ref() {
            Some(tx) => tx.blocking_send(ProcessEvent::Output(data)).is_ok(),
            None => false,
        }
    }

    /// Queue output. Returns false once the gate is closed or the receiver
    /// is gone, telling the reader to stop.
    async fn output(&self, data: Bytes) -> bool {
        let tx = self.0.lock().await;
        match tx.as_ref() {
            Some(tx) => tx.send(ProcessEvent::Output(data)).await.is_ok(),
            None => false,
        }
    }

    fn blocking_exit(&self, code: Option<i32>) {
        let tx = self.0.blocking_lock().take();
        if let Some(tx) = tx {
            let _ = tx.blocking_send(ProcessEvent::Exit(code));
        }
    }

    /// Queue the exit event after any output send already in progress, and
    /// close the gate.
    async fn exit(&self, code: Option<i32>) {
        let tx = self.0.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(ProcessEvent::Exit(code)).await;
        }
    }
}

fn queue_input(tx: &mpsc::Sender<Bytes>, data: Bytes) -> Result<(), PtyError> {
    tx.try_send(data).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => PtyError::InputQueueFull,
        mpsc::error::TrySendError::Closed(_) => PtyError::InputClosed,
    })
}

fn spawn_pty(program: &str, args: &[String], request: &SpawnRequest) -> Result<SpawnedProcess, PtyError> {
    let pty_system = native_pty_system();
    let PtyPair { master, slave } = pty_system
        .openpty(PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(PtyError::OpenPty)?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.cwd(&request.cwd);
    cmd.env("TERM", "xterm-256color");

    let mut child = slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
    // Our copy of the slave must go, or the reader never sees EOF.
    drop(slave);

    let reader = master.try_clone_reader().map_err(PtyError::CloneReader)?;
    let writer = master.take_writer().map_err(PtyError::TakeWriter)?;
    let pid = child.process_id();

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
    let exited = Arc::new(AtomicBool::new(false));
    let (reader_done_tx, reader_done_rx) = std::sync::mpsc::channel::<()>();
    let gate = EventGate::new(events_tx);

    // Reader: a blocking send applies backpressure when the session pump lags.
    let output = gate.clone();
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            use std::io::Read;
            let mut reader = reader;
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        if !output.blocking_output(data) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }));
        if let Err(e) = result {
            tracing::error!("pty reader task panicked: {:?}", e);
        }
        let _ = reader_done_tx.send(());
    });

    // Writer
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        let mut writer = writer;
        let mut rx = input_rx;
        while let Some(data) = rx.blocking_recv() {
            if writer.write_all(&data).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    // Exit monitor
    let exited_flag = exited.clone();
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                tracing::error!(?e, "error waiting for pty child");
                None
            }
        };
        // Set before the exit event so no signal can hit a recycled PID.
        exited_flag.store(true, Ordering::Release);
        let _ = reader_done_rx.recv_timeout(READER_DRAIN_TIMEOUT);
        gate.blocking_exit(code);
    });

    Ok(SpawnedProcess {
        handle: Arc::new(PtyProcess {
            pid,
            master: parking_lot::Mutex::new(master),
            input_tx,
            exited,
        }),
        events: events_rx,
    })
}

// ── Pipes ──────────────────────────────────────────────────────────

struct PipeProcess {
    pid: Option<u32>,
    input_tx: mpsc::Sender<Bytes>,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle for PipeProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_pty(&self) -> bool {
        false
    }

    fn write(&self, data: Bytes) -> Result<(), PtyError> {
        queue_input(&self.input_tx, data)
    }

    fn kill(&self, signal: Signal) {
        signal_group(self.pid, &self.exited, signal);
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

async fn pump_output<R>(mut stream: R, gate: EventGate)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if !gate.output(data).await {
                    break;
                }
            }
        }
    }
}

fn spawn_pipes(program: &str, args: &[String], cwd: &Path) -> Result<SpawnedProcess, PtyError> {
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(PtyError::SpawnPipe)?;
    let pid = child.id();

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
    let exited = Arc::new(AtomicBool::new(false));
    let gate = EventGate::new(events_tx);

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .map(|s| tokio::spawn(pump_output(s, gate.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|s| tokio::spawn(pump_output(s, gate.clone())));

    let exited_flag = exited.clone();
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::error!(?e, "error waiting for child");
                None
            }
        };
        exited_flag.store(true, Ordering::Release);
        let drained = async {
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = reader.await;
            }
        };
        let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, drained).await;
        gate.exit(code).await;
    });

    Ok(SpawnedProcess {
        handle: Arc::new(PipeProcess {
            pid,
            input_tx,
            exited,
        }),
        events: events_rx,
    })
}
