//! multiterm - a multi-session terminal dashboard server.
//!
//! `multiterm serve` hosts the session registry behind an HTTP/WebSocket API.
//! The remaining subcommands are thin clients of a running server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser as ClapParser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multiterm::{
    api,
    client::{ConnState, SessionApi, StreamController, StreamOptions},
    config::Config,
    project::MarkerProjects,
    pty::NativeSpawner,
    session::SessionRegistry,
    shutdown::ShutdownCoordinator,
    terminal,
};

const DEFAULT_SERVER: &str = "http://127.0.0.1:3001";

/// multiterm - run many shell sessions and watch them from anywhere.
#[derive(ClapParser, Debug)]
#[command(name = "multiterm", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the session server
    Serve {
        /// Address to bind the HTTP/WebSocket API server (overrides the config file)
        #[arg(long, env = "MULTITERM_BIND")]
        bind: Option<SocketAddr>,
    },

    /// List sessions on a running server
    List {
        #[arg(long, env = "MULTITERM_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Attach the local terminal to a session
    Attach {
        /// Session id
        id: String,

        #[arg(long, env = "MULTITERM_SERVER", default_value = DEFAULT_SERVER)]
        server: String,

        /// Replay output after this sequence number
        #[arg(long, default_value_t = 0)]
        from: u64,
    },

    /// Stop a session's process (terminate, then kill after the grace period)
    Stop {
        id: String,

        #[arg(long, env = "MULTITERM_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Stop a session and remove it from the server
    Delete {
        id: String,

        #[arg(long, env = "MULTITERM_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind } => {
            init_tracing();
            run_serve(bind, cli.config).await
        }
        Commands::List { server } => {
            init_tracing_stderr();
            run_list(&server).await
        }
        Commands::Attach { id, server, from } => {
            init_tracing_stderr();
            run_attach(&server, &id, from).await
        }
        Commands::Stop { id, server } => {
            init_tracing_stderr();
            run_stop(&server, &id).await
        }
        Commands::Delete { id, server } => {
            init_tracing_stderr();
            run_delete(&server, &id).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "multiterm=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Client subcommands own stdout (session output, tables), so logs go to
/// stderr and default to warnings only.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "multiterm=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server ─────────────────────────────────────────────────────────

async fn run_serve(bind: Option<SocketAddr>, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config =
        Config::load_or_default(config_path.as_deref()).context("failed to load config")?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let projects = Arc::new(MarkerProjects::new(config.projects.roots.clone()));
    let sessions = SessionRegistry::new(
        Arc::new(NativeSpawner::default()),
        projects,
        config.sessions.clone(),
    );
    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState {
        sessions: sessions.clone(),
        shutdown: shutdown.clone(),
    };
    let app = api::router(
        state,
        api::RouterConfig {
            cors_origins: config.server.cors_origins.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, "server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    wait_for_shutdown_signal().await;
    tracing::info!(sessions = sessions.len(), "server shutdown");

    // Signal WebSocket handlers to send close frames, and give them a moment
    // to flush before the listener goes away.
    shutdown.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = server_shutdown_tx.send(());

    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server error"),
        Err(e) => tracing::warn!(?e, "HTTP server task panicked"),
    }

    if let Some(escalation) = sessions.shutdown_all() {
        let _ = escalation.await;
    }

    tracing::info!("multiterm exiting");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

// ── Client subcommands ─────────────────────────────────────────────

fn connect(command: &str, server: &str) -> SessionApi {
    match SessionApi::new(server) {
        Ok(api) => api,
        Err(e) => {
            eprintln!("multiterm {command}: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_list(server: &str) -> anyhow::Result<()> {
    let api = connect("list", server);
    let sessions = match api.list().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("multiterm list: {e}");
            std::process::exit(1);
        }
    };

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    println!(
        "{:<38} {:<9} {:<8} {:<5} {:<8} {}",
        "ID", "STATUS", "PID", "PTY", "LINES", "COMMAND"
    );
    for s in &sessions {
        let pid = s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let status = match s.exit_code {
            Some(code) if s.status.is_finished() => format!("{}({code})", s.status.as_str()),
            _ => s.status.as_str().to_string(),
        };
        let command = if s.command.is_empty() {
            "(shell)".to_string()
        } else {
            s.command.join(" ")
        };
        println!(
            "{:<38} {:<9} {:<8} {:<5} {:<8} {}",
            s.id,
            status,
            pid,
            if s.pty { "yes" } else { "no" },
            s.scrollback_lines,
            command
        );
    }
    Ok(())
}

async fn run_stop(server: &str, id: &str) -> anyhow::Result<()> {
    let api = connect("stop", server);
    if let Err(e) = api.stop(id).await {
        eprintln!("multiterm stop: {e}");
        std::process::exit(1);
    }
    println!("Session '{id}' stopping.");
    Ok(())
}

async fn run_delete(server: &str, id: &str) -> anyhow::Result<()> {
    let api = connect("delete", server);
    if let Err(e) = api.delete(id).await {
        eprintln!("multiterm delete: {e}");
        std::process::exit(1);
    }
    println!("Session '{id}' deleted.");
    Ok(())
}

async fn run_attach(server: &str, id: &str, from: u64) -> anyhow::Result<()> {
    let api = connect("attach", server);

    // Fail before touching the terminal if the session does not exist.
    if let Err(e) = api.get(id).await {
        eprintln!("multiterm attach: {e}");
        std::process::exit(1);
    }

    if let Ok((cols, rows)) = terminal::terminal_size() {
        if let Err(e) = api.resize(id, cols, rows).await {
            tracing::warn!(session = %id, error = %e, "failed to send initial size");
        }
    }

    let mut resize = terminal::ResizeWatcher::new()?;
    let raw_guard = terminal::RawModeGuard::new()?;

    // A plain thread rather than spawn_blocking: a read blocked on stdin
    // must not hold up runtime shutdown.
    let (stdin_tx, mut stdin_rx) = tokio::sync::mpsc::channel::<Bytes>(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let options = StreamOptions::default();
    let flush_delay = options.input_debounce * 3;
    let mut stream = StreamController::connect(api.clone(), id, from, options);
    let mut stdout = tokio::io::stdout();

    let result = async {
        loop {
            tokio::select! {
                frame = stream.next_frame() => match frame {
                    Some(frame) => {
                        stdout.write_all(&frame.data).await?;
                        stdout.flush().await?;
                    }
                    None => break,
                },
                data = stdin_rx.recv() => match data {
                    Some(data) => stream.send(data),
                    None => {
                        // Let the input batcher flush what was typed last.
                        tokio::time::sleep(flush_delay).await;
                        break;
                    }
                },
                Some((cols, rows)) = resize.changed() => {
                    if let Err(e) = api.resize(id, cols, rows).await {
                        tracing::warn!(session = %id, error = %e, "failed to resize");
                    }
                }
            }
        }
        Ok::<(), std::io::Error>(())
    }
    .await;

    let gone = stream.state() == ConnState::Closed;
    stream.close();
    drop(raw_guard);

    result.context("failed to write session output")?;
    if gone {
        eprintln!("\r\nmultiterm attach: session '{id}' is gone");
    }
    Ok(())
}
