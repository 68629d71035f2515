//! In-memory transport for tests and offline hosts.
//!
//! Every [`connect`](Transport::connect) opens a fresh in-memory socket and
//! makes it the "current" one; inbound frames are pushed into the current
//! socket, and everything sent on any socket is recorded.
//!
//! ```
//! use exchange_stream_mux::application::ports::TransportError;
//! use exchange_stream_mux::infrastructure::transport::MockTransport;
//!
//! let transport = MockTransport::new();
//! transport.fail_next_connect(TransportError::Connect("refused".into()));
//! assert!(transport.sent().is_empty());
//! assert_eq!(transport.connection_count(), 0);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::application::ports::{
    Frame, FrameSink, FrameStream, Transport, TransportConnection, TransportError,
};

type Inbound = mpsc::UnboundedSender<Result<Frame, TransportError>>;

/// A recorded handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    /// Endpoint requested.
    pub url: String,
    /// Handshake headers.
    pub headers: Vec<(String, String)>,
}

struct State {
    script: VecDeque<TransportError>,
    send_failures: VecDeque<TransportError>,
    attempts: Vec<ConnectAttempt>,
    sent: Vec<String>,
    pings: usize,
    current: Option<Inbound>,
    auto_pong: bool,
}

struct Inner {
    state: Mutex<State>,
    sends: watch::Sender<usize>,
    connections: watch::Sender<usize>,
    paused: watch::Sender<bool>,
}

/// Scriptable in-memory [`Transport`].
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MockTransport")
            .field("attempts", &state.attempts.len())
            .field("sent", &state.sent.len())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// Create a transport whose connects succeed and whose pings are answered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    script: VecDeque::new(),
                    send_failures: VecDeque::new(),
                    attempts: Vec::new(),
                    sent: Vec::new(),
                    pings: 0,
                    current: None,
                    auto_pong: true,
                }),
                sends: watch::Sender::new(0),
                connections: watch::Sender::new(0),
                paused: watch::Sender::new(false),
            }),
        }
    }

    /// Make the next connect attempt fail. Calls queue up.
    pub fn fail_next_connect(&self, error: TransportError) {
        self.inner.state.lock().script.push_back(error);
    }

    /// Make the next frame send fail without recording it. Calls queue up.
    pub fn fail_next_send(&self, error: TransportError) {
        self.inner.state.lock().send_failures.push_back(error);
    }

    /// Answer pings with a pong (default on).
    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.state.lock().auto_pong = enabled;
    }

    /// Deliver a text frame on the current socket. Returns false if none is
    /// open.
    pub fn push_inbound(&self, text: &str) -> bool {
        self.push(Ok(Frame::Text(text.to_string())))
    }

    /// Close the current socket from the server side.
    pub fn close_connection(&self) -> bool {
        self.push(Ok(Frame::Closed))
    }

    /// Fail the current socket's read half.
    pub fn fail_connection(&self, error: TransportError) -> bool {
        self.push(Err(error))
    }

    /// Hold every send until [`resume_sends`](Self::resume_sends).
    pub fn pause_sends(&self) {
        self.inner.paused.send_replace(true);
    }

    /// Release held sends.
    pub fn resume_sends(&self) {
        self.inner.paused.send_replace(false);
    }

    /// Every frame sent so far, across sockets.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.inner.state.lock().sent.clone()
    }

    /// Every handshake attempted, including failed ones.
    #[must_use]
    pub fn connect_attempts(&self) -> Vec<ConnectAttempt> {
        self.inner.state.lock().attempts.clone()
    }

    /// Pings sent across sockets.
    #[must_use]
    pub fn ping_count(&self) -> usize {
        self.inner.state.lock().pings
    }

    /// Successful connects so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        *self.inner.connections.borrow()
    }

    /// Wait until at least `count` frames were sent.
    pub async fn wait_for_sends(&self, count: usize) {
        let mut rx = self.inner.sends.subscribe();
        let _ = rx.wait_for(|sent| *sent >= count).await;
    }

    /// Wait until at least `count` connects succeeded.
    pub async fn wait_for_connections(&self, count: usize) {
        let mut rx = self.inner.connections.subscribe();
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }

    fn push(&self, frame: Result<Frame, TransportError>) -> bool {
        self.inner
            .state
            .lock()
            .current
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<TransportConnection, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock();
            state.attempts.push(ConnectAttempt {
                url: url.to_string(),
                headers: headers.to_vec(),
            });
            if let Some(error) = state.script.pop_front() {
                return Err(error);
            }
            state.current = Some(tx.clone());
        }
        self.inner.connections.send_modify(|opened| *opened += 1);

        Ok(TransportConnection {
            sink: Box::new(MockSink {
                inner: Arc::clone(&self.inner),
                inbound: tx,
                closed: false,
            }),
            stream: Box::new(MockFrames { rx }),
        })
    }
}

struct MockSink {
    inner: Arc<Inner>,
    inbound: Inbound,
    closed: bool,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let mut paused = self.inner.paused.subscribe();
        let _ = paused.wait_for(|held| !*held).await;

        if self.closed || self.inbound.is_closed() {
            return Err(TransportError::Closed);
        }
        {
            let mut state = self.inner.state.lock();
            if let Some(error) = state.send_failures.pop_front() {
                return Err(error);
            }
            state.sent.push(text);
        }
        self.inner.sends.send_modify(|sent| *sent += 1);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let auto_pong = {
            let mut state = self.inner.state.lock();
            state.pings += 1;
            state.auto_pong
        };
        if auto_pong {
            let _ = self.inbound.send(Ok(Frame::Pong));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        let _ = self.inbound.send(Ok(Frame::Closed));
        Ok(())
    }
}

struct MockFrames {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameStream for MockFrames {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await
    }
}
