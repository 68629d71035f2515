//! WebSocket transport over `tokio-tungstenite` with rustls.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{
    Frame, FrameSink, FrameStream, Transport, TransportConnection, TransportError,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens real exchange sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<TransportConnection, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connect(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connect(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_connect_error)?;

        let (write, read) = ws.split();
        Ok(TransportConnection {
            sink: Box::new(WebSocketSink { write }),
            stream: Box::new(WebSocketFrames { read }),
        })
    }
}

fn map_connect_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            TransportError::Unauthorized
        }
        other => TransportError::Connect(other.to_string()),
    }
}

struct WebSocketSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.write
            .send(Message::Ping(tungstenite::Bytes::new()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.write
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

struct WebSocketFrames {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WebSocketFrames {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.read.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring non-UTF-8 binary frame");
                    }
                },
                Message::Pong(_) => return Some(Ok(Frame::Pong)),
                Message::Close(frame) => {
                    tracing::debug!(frame = ?frame, "Server sent close frame");
                    return Some(Ok(Frame::Closed));
                }
                // Pings are answered by tungstenite.
                Message::Ping(_) | Message::Frame(_) => {}
            }
        }
    }
}
