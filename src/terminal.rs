//! Local terminal handling for `multiterm attach`.

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),

    #[error("failed to query terminal size: {0}")]
    Size(#[source] std::io::Error),

    #[error("failed to watch for window size changes: {0}")]
    ResizeSignal(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// Enables raw mode on creation and restores the terminal on drop (even on
/// panic), so keystrokes like Ctrl+C reach the remote session instead of
/// the local terminal.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current terminal size as `(cols, rows)`, the order the resize endpoint takes.
pub fn terminal_size() -> Result<(u16, u16), TerminalError> {
    size().map_err(TerminalError::Size)
}

/// Yields the new terminal size each time the window is resized.
pub struct ResizeWatcher {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl ResizeWatcher {
    pub fn new() -> Result<Self, TerminalError> {
        #[cfg(unix)]
        {
            let signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
                .map_err(TerminalError::ResizeSignal)?;
            Ok(Self { signal })
        }
        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Wait for the next resize. Pends forever where resize signals are
    /// unavailable.
    pub async fn changed(&mut self) -> Option<(u16, u16)> {
        #[cfg(unix)]
        {
            self.signal.recv().await?;
            terminal_size().ok()
        }
        #[cfg(not(unix))]
        std::future::pending().await
    }
}
