//! Client side of the session transport.
//!
//! [`SessionApi`] wraps the HTTP endpoints. [`StreamController`] turns a
//! session's output into one ordered, gap-free frame stream regardless of
//! transport health: it keeps a WebSocket connected, falls back to polling
//! scrollback when the socket stays silent, and reconciles both paths through
//! a single reducer keyed on `seq`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    InputChunk, OutputFrame, ScrollbackResponse, CLOSE_NO_SUCH_SESSION, NO_SUCH_SESSION_REASON,
};
use crate::session::SessionInfo;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status: 404, .. })
    }
}

/// Body of a session create request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

/// HTTP client for the session endpoints.
#[derive(Clone)]
pub struct SessionApi {
    base: String,
    http: reqwest::Client,
}

impl SessionApi {
    /// `base` is the server origin, e.g. `http://127.0.0.1:3001`.
    pub fn new(base: &str) -> Result<Self, ClientError> {
        let base = base.trim_end_matches('/').to_string();
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(ClientError::InvalidUrl(base));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { base, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/sessions{}", self.base, path)
    }

    /// WebSocket URL of a session's stream, resuming after `from`.
    pub fn stream_url(&self, id: &str, from: u64) -> String {
        let ws_base = match self.base.strip_prefix("https://") {
            Some(rest) => format!("wss://{rest}"),
            None => format!("ws://{}", self.base.trim_start_matches("http://")),
        };
        format!("{ws_base}/api/sessions/{id}/stream?from={from}")
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        Err(ClientError::Status {
            status,
            code: body["error"]["code"].as_str().unwrap_or("unknown").to_string(),
            message: body["error"]["message"].as_str().unwrap_or("").to_string(),
        })
    }

    pub async fn list(&self) -> Result<Vec<SessionInfo>, ClientError> {
        let resp = Self::check(self.http.get(self.url("")).send().await?).await?;
        Ok(resp.json().await?)
    }

    pub async fn get(&self, id: &str) -> Result<SessionInfo, ClientError> {
        let resp = Self::check(self.http.get(self.url(&format!("/{id}"))).send().await?).await?;
        Ok(resp.json().await?)
    }

    pub async fn create(&self, request: &NewSession) -> Result<SessionInfo, ClientError> {
        let resp = Self::check(self.http.post(self.url("")).json(request).send().await?).await?;
        Ok(resp.json().await?)
    }

    pub async fn stop(&self, id: &str) -> Result<(), ClientError> {
        Self::check(self.http.post(self.url(&format!("/{id}/stop"))).send().await?).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), ClientError> {
        Self::check(self.http.delete(self.url(&format!("/{id}"))).send().await?).await?;
        Ok(())
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), ClientError> {
        let body = serde_json::json!({ "cols": cols, "rows": rows });
        Self::check(
            self.http
                .post(self.url(&format!("/{id}/resize")))
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    pub async fn scrollback(&self, id: &str, from: u64) -> Result<ScrollbackResponse, ClientError> {
        let resp = Self::check(
            self.http
                .get(self.url(&format!("/{id}/scrollback")))
                .query(&[("from", from)])
                .send()
                .await?,
        )
        .await?;
        Ok(resp.json().await?)
    }

    pub async fn input(&self, id: &str, chunk: &InputChunk) -> Result<(), ClientError> {
        Self::check(
            self.http
                .post(self.url(&format!("/{id}/input")))
                .json(chunk)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }
}

// ── Stream controller ──────────────────────────────────────────────

/// Connection state of a [`StreamController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Reconnecting,
    Live,
    Polling,
    /// Terminal: the session is gone.
    Closed,
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Start polling if an attempt has produced no frame by then.
    pub first_frame_timeout: Duration,
    pub poll_interval: Duration,
    /// How long locally typed input is coalesced before sending.
    pub input_debounce: Duration,
    pub input_chunk_max: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            first_frame_timeout: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(500),
            input_debounce: Duration::from_millis(20),
            input_chunk_max: 32 * 1024,
        }
    }
}

/// Wait before reconnecting, given how long the failed attempt lasted.
///
/// Attempts that die almost immediately are likely being refused, so they
/// back off for a second; anything else waits two. Never more than five.
pub fn reconnect_delay(attempt_elapsed: Duration) -> Duration {
    let delay = if attempt_elapsed < Duration::from_millis(200) {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(2)
    };
    delay.min(Duration::from_secs(5))
}

/// Whether a close frame means the session no longer exists.
pub fn is_terminal_close(code: u16, reason: &str) -> bool {
    code == CLOSE_NO_SUCH_SESSION || reason.contains(NO_SUCH_SESSION_REASON)
}

/// The single delivery point for frames from both the socket and the poller.
///
/// A frame is accepted only if its seq is strictly greater than everything
/// delivered so far.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameReducer {
    last_seq: u64,
}

impl FrameReducer {
    pub fn new(last_seq: u64) -> Self {
        Self { last_seq }
    }

    pub fn accept(&mut self, frame: &OutputFrame) -> bool {
        if frame.seq <= self.last_seq {
            return false;
        }
        self.last_seq = frame.seq;
        true
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

/// Split coalesced input into wire-sized chunks.
pub fn split_input(data: &[u8], max: usize) -> Vec<Bytes> {
    data.chunks(max.max(1)).map(Bytes::copy_from_slice).collect()
}

struct Delivery {
    reducer: FrameReducer,
    tx: mpsc::UnboundedSender<OutputFrame>,
}

enum Outcome {
    Retry,
    Gone,
    Cancelled,
}

struct Shared {
    api: SessionApi,
    session_id: String,
    options: StreamOptions,
    delivery: parking_lot::Mutex<Delivery>,
    state: watch::Sender<ConnState>,
    poller: parking_lot::Mutex<Option<CancellationToken>>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    /// Cancelled by `close()`.
    cancel: CancellationToken,
    /// Cancelled when the session is known to be gone.
    gone: CancellationToken,
}

impl Shared {
    fn deliver(&self, frame: OutputFrame) {
        let mut delivery = self.delivery.lock();
        if delivery.reducer.accept(&frame) {
            let _ = delivery.tx.send(frame);
        }
    }

    fn last_seq(&self) -> u64 {
        self.delivery.lock().reducer.last_seq()
    }

    fn set_state(&self, next: ConnState) {
        self.state.send_if_modified(|current| {
            if *current == ConnState::Closed || *current == next {
                return false;
            }
            tracing::debug!(session = %self.session_id, from = ?*current, to = ?next, "stream state");
            *current = next;
            true
        });
    }

    fn start_polling(self: &Arc<Self>) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }
        let token = self.cancel.child_token();
        *poller = Some(token.clone());
        drop(poller);
        self.set_state(ConnState::Polling);
        tokio::spawn(poll_loop(self.clone(), token));
    }

    /// Returns whether polling was active.
    fn stop_polling(&self) -> bool {
        match self.poller.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn send_input(&self, chunk: InputChunk) {
        let bytes = chunk.data.len();
        {
            let mut sink = self.sink.lock().await;
            if let Some(ws) = sink.as_mut() {
                match serde_json::to_string(&chunk) {
                    Ok(json) => {
                        if ws.send(Message::Text(json.into())).await.is_ok() {
                            tracing::debug!(session = %self.session_id, bytes, "input sent on stream");
                            return;
                        }
                        *sink = None;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode input chunk");
                        return;
                    }
                }
            }
        }
        if let Err(e) = self.api.input(&self.session_id, &chunk).await {
            tracing::debug!(session = %self.session_id, error = %e, "input dropped");
        }
    }
}

async fn poll_loop(shared: Arc<Shared>, token: CancellationToken) {
    let mut interval = tokio::time::interval(shared.options.poll_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = shared.api.scrollback(&shared.session_id, shared.last_seq()) => result,
        };
        match result {
            Ok(batch) => {
                for frame in batch.frames {
                    shared.deliver(frame);
                }
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(session = %shared.session_id, "session gone while polling");
                shared.gone.cancel();
                return;
            }
            Err(e) => {
                tracing::debug!(session = %shared.session_id, error = %e, "poll failed");
            }
        }
    }
}

/// Parse a server message into a frame, ignoring anything else.
fn parse_frame(msg: &Message) -> Option<OutputFrame> {
    let raw: &[u8] = match msg {
        Message::Text(text) => text.as_bytes(),
        Message::Binary(data) => data.as_ref(),
        _ => return None,
    };
    serde_json::from_slice(raw).ok()
}

/// One connection attempt, from dial to close.
async fn attempt(shared: &Arc<Shared>) -> Outcome {
    let url = shared.api.stream_url(&shared.session_id, shared.last_seq());
    let first_frame = tokio::time::sleep(shared.options.first_frame_timeout);
    tokio::pin!(first_frame);
    let mut timer_done = false;

    let connect = tokio_tungstenite::connect_async(url);
    tokio::pin!(connect);
    let ws = loop {
        tokio::select! {
            result = &mut connect => break result,
            _ = &mut first_frame, if !timer_done => {
                timer_done = true;
                shared.start_polling();
            }
            _ = shared.gone.cancelled() => return Outcome::Gone,
            _ = shared.cancel.cancelled() => return Outcome::Cancelled,
        }
    };
    let (sink, mut stream) = match ws {
        Ok((ws, _)) => ws.split(),
        Err(e) => {
            tracing::debug!(session = %shared.session_id, error = %e, "stream connect failed");
            return Outcome::Retry;
        }
    };

    *shared.sink.lock().await = Some(sink);
    shared.stop_polling();
    shared.set_state(ConnState::Live);
    tracing::debug!(session = %shared.session_id, "stream open");

    let outcome = loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(frame))) => {
                        let gone = frame
                            .as_ref()
                            .is_some_and(|f| is_terminal_close(u16::from(f.code), &f.reason));
                        break if gone { Outcome::Gone } else { Outcome::Retry };
                    }
                    Some(Ok(msg)) => {
                        if let Some(frame) = parse_frame(&msg) {
                            timer_done = true;
                            if shared.stop_polling() {
                                shared.set_state(ConnState::Live);
                            }
                            shared.deliver(frame);
                        }
                    }
                    Some(Err(_)) | None => break Outcome::Retry,
                }
            }
            _ = &mut first_frame, if !timer_done => {
                timer_done = true;
                shared.start_polling();
            }
            _ = shared.gone.cancelled() => break Outcome::Gone,
            _ = shared.cancel.cancelled() => break Outcome::Cancelled,
        }
    };

    if let Some(mut sink) = shared.sink.lock().await.take() {
        if matches!(outcome, Outcome::Cancelled) {
            let _ = sink
                .send(Message::Close(Some(
                    tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client closed".into(),
                    },
                )))
                .await;
        }
    }
    outcome
}

async fn run(shared: Arc<Shared>) {
    loop {
        shared.set_state(ConnState::Reconnecting);
        let started = Instant::now();
        let outcome = attempt(&shared).await;
        shared.stop_polling();
        match outcome {
            Outcome::Gone => {
                tracing::info!(session = %shared.session_id, "session gone, stream closed");
                break;
            }
            Outcome::Cancelled => break,
            Outcome::Retry => {}
        }
        shared.set_state(ConnState::Reconnecting);
        let delay = reconnect_delay(started.elapsed());
        tracing::debug!(session = %shared.session_id, ?delay, "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.gone.cancelled() => break,
            _ = shared.cancel.cancelled() => break,
        }
    }
    shared.set_state(ConnState::Closed);
}

async fn batch_input(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    let mut seq = 0u64;
    while let Some(first) = rx.recv().await {
        let mut pending = BytesMut::from(&first[..]);
        let window = tokio::time::sleep(shared.options.input_debounce);
        tokio::pin!(window);
        let mut closed = false;
        loop {
            tokio::select! {
                _ = &mut window => break,
                more = rx.recv() => match more {
                    Some(more) => pending.extend_from_slice(&more),
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }
        for data in split_input(&pending, shared.options.input_chunk_max) {
            seq += 1;
            shared
                .send_input(InputChunk {
                    session_id: shared.session_id.clone(),
                    seq,
                    data,
                    is_final: None,
                })
                .await;
        }
        if closed {
            break;
        }
    }
}

/// Keeps one session's output flowing. See the module docs.
pub struct StreamController {
    shared: Arc<Shared>,
    frames: mpsc::UnboundedReceiver<OutputFrame>,
    input: mpsc::UnboundedSender<Bytes>,
    state: watch::Receiver<ConnState>,
}

impl StreamController {
    /// Start streaming `session_id`, delivering frames after `from`.
    pub fn connect(api: SessionApi, session_id: &str, from: u64, options: StreamOptions) -> Self {
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (input, input_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnState::Reconnecting);
        let shared = Arc::new(Shared {
            api,
            session_id: session_id.to_string(),
            options,
            delivery: parking_lot::Mutex::new(Delivery {
                reducer: FrameReducer::new(from),
                tx: frames_tx,
            }),
            state: state_tx,
            poller: parking_lot::Mutex::new(None),
            sink: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            gone: CancellationToken::new(),
        });
        tokio::spawn(run(shared.clone()));
        tokio::spawn(batch_input(shared.clone(), input_rx));
        Self {
            shared,
            frames,
            input,
            state,
        }
    }

    /// Next frame in seq order, or `None` once the controller has closed and
    /// every delivered frame has been consumed.
    pub async fn next_frame(&mut self) -> Option<OutputFrame> {
        tokio::select! {
            biased;
            frame = self.frames.recv() => frame,
            _ = wait_closed(self.state.clone()) => self.frames.try_recv().ok(),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.state.clone()
    }

    pub fn last_seq(&self) -> u64 {
        self.shared.last_seq()
    }

    /// Queue locally typed input. It is coalesced for the debounce window,
    /// then sent on the live channel if open, or over HTTP otherwise.
    pub fn send(&self, data: impl Into<Bytes>) {
        let _ = self.input.send(data.into());
    }

    /// Stop streaming. The controller moves to `Closed`.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn wait_closed(mut state: watch::Receiver<ConnState>) {
    let _ = state.wait_for(|s| *s == ConnState::Closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> OutputFrame {
        OutputFrame {
            session_id: "s".into(),
            seq,
            ts: 0,
            data: Bytes::new(),
        }
    }

    #[test]
    fn reducer_delivers_strictly_increasing_seqs() {
        let mut reducer = FrameReducer::new(0);
        let delivered: Vec<u64> = [1, 2, 2, 1, 3, 5, 4, 6]
            .into_iter()
            .filter(|&s| reducer.accept(&frame(s)))
            .collect();
        assert_eq!(delivered, vec![1, 2, 3, 5, 6]);
        assert_eq!(reducer.last_seq(), 6);
    }

    #[test]
    fn reducer_respects_resume_point() {
        let mut reducer = FrameReducer::new(10);
        assert!(!reducer.accept(&frame(10)));
        assert!(reducer.accept(&frame(11)));
    }

    #[test]
    fn fast_failures_back_off_for_one_second() {
        assert_eq!(reconnect_delay(Duration::from_millis(50)), Duration::from_secs(1));
        assert_eq!(reconnect_delay(Duration::from_millis(199)), Duration::from_secs(1));
    }

    #[test]
    fn slow_failures_back_off_for_two_seconds() {
        assert_eq!(reconnect_delay(Duration::from_millis(200)), Duration::from_secs(2));
        assert_eq!(reconnect_delay(Duration::from_secs(60)), Duration::from_secs(2));
    }

    #[test]
    fn terminal_close_detection() {
        assert!(is_terminal_close(1008, ""));
        assert!(is_terminal_close(1000, "no such session"));
        assert!(!is_terminal_close(1013, "subscriber lagged"));
        assert!(!is_terminal_close(1000, "server shutting down"));
    }

    #[test]
    fn input_is_split_at_chunk_cap() {
        let data = vec![b'x'; 70_000];
        let chunks = split_input(&data, 32 * 1024);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 32 * 1024);
        assert_eq!(chunks[2].len(), 70_000 - 2 * 32 * 1024);
        assert!(split_input(b"", 10).is_empty());
    }

    #[test]
    fn stream_url_swaps_scheme() {
        let api = SessionApi::new("http://127.0.0.1:3001/").unwrap();
        assert_eq!(
            api.stream_url("abc", 7),
            "ws://127.0.0.1:3001/api/sessions/abc/stream?from=7"
        );
        let api = SessionApi::new("https://term.example").unwrap();
        assert_eq!(
            api.stream_url("abc", 0),
            "wss://term.example/api/sessions/abc/stream?from=0"
        );
    }

    #[test]
    fn api_rejects_non_http_base() {
        assert!(matches!(
            SessionApi::new("ftp://host"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn new_session_omits_unset_fields() {
        let body = serde_json::to_value(NewSession {
            cwd: Some("/p".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "cwd": "/p" }));
    }
}
