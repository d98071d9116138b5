use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::OutputFrame;

/// Default scrollback ceiling, in newline-delimited lines.
pub const DEFAULT_MAX_LINES: usize = 5000;

/// Extra queue slots each subscriber gets on top of its backlog.
///
/// A subscriber whose queue fills up is dropped from the bus instead of
/// stalling `push()`; the client resumes from its last seq.
const SUBSCRIBER_HEADROOM: usize = 1024;

/// Number of scrollback lines a chunk of output accounts for.
pub fn count_lines(data: &[u8]) -> usize {
    data.iter().filter(|&&b| b == b'\n').count().max(1)
}

/// Identifies one subscriber on one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Retained {
    frame: OutputFrame,
    lines: usize,
}

struct BusInner {
    last_seq: u64,
    frames: VecDeque<Retained>,
    lines: usize,
    lines_dropped: u64,
    subscribers: Vec<(SubscriberId, mpsc::Sender<OutputFrame>)>,
    next_subscriber: u64,
}

impl BusInner {
    fn frames_after(&self, seq: u64) -> Vec<OutputFrame> {
        // Retained seqs are contiguous, so the first match can be computed.
        let Some(oldest) = self.frames.front().map(|r| r.frame.seq) else {
            return Vec::new();
        };
        let skip = seq.saturating_sub(oldest - 1).min(self.frames.len() as u64) as usize;
        self.frames
            .iter()
            .skip(skip)
            .map(|r| r.frame.clone())
            .collect()
    }

    fn evict_overflow(&mut self, max_lines: usize) {
        while self.lines > max_lines {
            let Some(old) = self.frames.pop_front() else {
                break;
            };
            self.lines = self.lines.saturating_sub(old.lines);
            self.lines_dropped += old.lines as u64;
        }
    }

    fn broadcast(&mut self, frame: &OutputFrame) {
        self.subscribers.retain(|(id, tx)| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    session = %frame.session_id,
                    subscriber = id.0,
                    "subscriber queue full, dropping subscriber"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Per-session output log with live fan-out.
///
/// Every chunk of process output becomes an [`OutputFrame`] with the next
/// sequence number. Frames are retained until the total retained line count
/// exceeds the ceiling, at which point the oldest frames are evicted
/// silently. Subscribers receive each frame exactly once, in push order.
///
/// All state lives behind one mutex: `push()` and `add_subscriber()`
/// serialize against each other, which is what guarantees that a new
/// subscriber sees its backlog strictly before any live frame.
#[derive(Clone)]
pub struct Bus {
    session_id: Arc<str>,
    max_lines: usize,
    inner: Arc<Mutex<BusInner>>,
}

impl Bus {
    pub fn new(session_id: impl Into<Arc<str>>) -> Self {
        Self::with_max_lines(session_id, DEFAULT_MAX_LINES)
    }

    pub fn with_max_lines(session_id: impl Into<Arc<str>>, max_lines: usize) -> Self {
        Self {
            session_id: session_id.into(),
            max_lines,
            inner: Arc::new(Mutex::new(BusInner {
                last_seq: 0,
                frames: VecDeque::new(),
                lines: 0,
                lines_dropped: 0,
                subscribers: Vec::new(),
                next_subscriber: 0,
            })),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append output, evict overflow, fan out to subscribers.
    ///
    /// Never blocks: a subscriber that cannot accept the frame is dropped.
    pub fn push(&self, data: Bytes) -> OutputFrame {
        let lines = count_lines(&data);
        let mut inner = self.inner.lock();
        inner.last_seq += 1;
        let frame = OutputFrame {
            session_id: self.session_id.to_string(),
            seq: inner.last_seq,
            ts: chrono::Utc::now().timestamp_millis(),
            data,
        };
        inner.frames.push_back(Retained {
            frame: frame.clone(),
            lines,
        });
        inner.lines += lines;
        inner.evict_overflow(self.max_lines);
        inner.broadcast(&frame);
        frame
    }

    /// All retained frames with `seq > seq`, ascending.
    ///
    /// The result is a gap-free continuation only if the oldest retained
    /// frame's seq is at most `seq + 1`; otherwise the missing frames were
    /// evicted.
    pub fn get_from(&self, seq: u64) -> Vec<OutputFrame> {
        self.inner.lock().frames_after(seq)
    }

    /// Register a subscriber for future pushes.
    ///
    /// With `from_seq`, the backlog (`get_from(from_seq)`) is queued on the
    /// subscription before it is registered, under the same lock that
    /// `push()` takes, so no live frame can overtake the backlog.
    pub fn add_subscriber(&self, from_seq: Option<u64>) -> Subscription {
        let mut inner = self.inner.lock();
        let backlog = from_seq
            .map(|seq| inner.frames_after(seq))
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(backlog.len() + SUBSCRIBER_HEADROOM);
        for frame in backlog {
            // Capacity covers the whole backlog.
            let _ = tx.try_send(frame);
        }

        let id = SubscriberId(inner.next_subscriber);
        inner.next_subscriber += 1;
        inner.subscribers.push((id, tx));

        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Stop delivering to a subscriber. Idempotent.
    pub fn remove_subscriber(&self, id: SubscriberId) {
        remove_from(&self.inner, id);
    }

    /// Lines currently retained. Never exceeds the ceiling after a push.
    pub fn line_count(&self) -> usize {
        self.inner.lock().lines
    }

    /// Seq of the most recently pushed frame (0 before the first push).
    pub fn latest_seq(&self) -> u64 {
        self.inner.lock().last_seq
    }

    /// Total lines evicted since the bus was created.
    pub fn lines_dropped(&self) -> u64 {
        self.inner.lock().lines_dropped
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

fn remove_from(inner: &Mutex<BusInner>, id: SubscriberId) {
    inner.lock().subscribers.retain(|(sid, _)| *sid != id);
}

/// Receiving end of a bus subscription.
///
/// Dropping the subscription deregisters it.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<OutputFrame>,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next frame, or `None` once the bus dropped this subscriber (queue
    /// overflow) or the bus itself is gone.
    pub async fn recv(&mut self) -> Option<OutputFrame> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<OutputFrame> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            remove_from(&inner, self.id);
        }
    }
}
