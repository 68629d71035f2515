//! Transport Port (Driven Port)
//!
//! A framed, text-oriented socket. The write half and the read half are
//! handed out separately so one task can drain inbound frames while others
//! send.

use async_trait::async_trait;

/// Inbound frame as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 payload (text, or binary that decoded as UTF-8).
    Text(String),
    /// Reply to a ping.
    Pong,
    /// Peer closed the socket.
    Closed,
}

/// Socket-level failure. Always handled by reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not establish the connection.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Handshake rejected the credentials (HTTP 401).
    #[error("Handshake rejected: unauthorized")]
    Unauthorized,

    /// Write failed.
    #[error("Send failed: {0}")]
    Send(String),

    /// Read failed.
    #[error("Receive failed: {0}")]
    Receive(String),

    /// The socket is already closed.
    #[error("Connection closed")]
    Closed,
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a ping.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the socket gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound frame; `None` once the stream is exhausted.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// An open connection, split into halves.
pub struct TransportConnection {
    /// Write half.
    pub sink: Box<dyn FrameSink>,
    /// Read half.
    pub stream: Box<dyn FrameStream>,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection").finish_non_exhaustive()
    }
}

/// Port for opening exchange sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a socket to `url`, sending `headers` with the handshake.
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<TransportConnection, TransportError>;
}
