use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default per-session input budget, bytes per window.
pub const DEFAULT_BYTES_PER_WINDOW: u64 = 1_000_000;

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

struct Window {
    started: Instant,
    bytes: u64,
}

/// Fixed-window byte budget guarding writes into a session's process.
///
/// Tracks bytes admitted since the current window started. When the window
/// has elapsed the counter resets. A request is admitted only if it fits in
/// what remains of the budget; a rejected request leaves the state untouched.
///
/// Up to twice the budget can pass across a window boundary. The limiter
/// bounds worst-case write pressure; it does not provide exact fairness.
pub struct RateLimiter {
    budget: u64,
    window: Duration,
    state: Mutex<Window>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BYTES_PER_WINDOW, DEFAULT_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(budget: u64, window: Duration) -> Self {
        Self {
            budget,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                bytes: 0,
            }),
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Admit `size` bytes now, if the budget allows.
    pub fn allow(&self, size: usize) -> bool {
        self.allow_at(size, Instant::now())
    }

    /// Same as [`allow`](Self::allow) with an explicit clock reading.
    pub fn allow_at(&self, size: usize, now: Instant) -> bool {
        let size = size as u64;
        let mut state = self.state.lock();
        if now.saturating_duration_since(state.started) >= self.window {
            state.bytes = 0;
            state.started = now;
        }
        if state.bytes + size > self.budget {
            return false;
        }
        state.bytes += size;
        true
    }

    /// Return `size` previously admitted bytes to the current window, for
    /// input that was admitted but never delivered.
    pub fn release(&self, size: usize) {
        let mut state = self.state.lock();
        state.bytes = state.bytes.saturating_sub(size as u64);
    }
}
