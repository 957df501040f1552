use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendKind, Chunk, ChunkStream, cancellable, endpoint_url};
use crate::bridge::{BRIDGE_CAPACITY, Bridge, Pusher};
use crate::error::QuillError;
use crate::options::{CompletionRequest, translate};

const KIND: BackendKind = BackendKind::WebSocketStream;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Streaming API that pushes JSON events over a WebSocket. No tokenize
/// endpoint and no stop call: closing the socket stops generation.
#[derive(Debug, Clone, Default)]
pub struct WebSocketAdapter;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum StreamEvent {
    TextStream { text: String },
    StreamEnd,
    #[serde(other)]
    Other,
}

impl WebSocketAdapter {
    pub fn new() -> Self {
        Self
    }

    pub async fn stream_completion(
        &self,
        endpoint: &Url,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, QuillError> {
        let url = endpoint_url(endpoint, "/api/v1/stream")?;
        let body = Value::Object(translate(KIND, request)).to_string();

        tracing::debug!(backend = %KIND, %url, prompt_len = request.prompt.len(), "opening socket");
        let mut socket = cancellable(&cancel, async {
            let (socket, _response) = connect_async(url.as_str()).await?;
            Ok(socket)
        })
        .await?;

        // The whole request goes out as one message on open.
        socket.send(Message::Text(body)).await?;

        let (mut sink, source) = socket.split();
        let (pusher, mut bridge) = Bridge::new(BRIDGE_CAPACITY);
        bridge.attach(tokio::spawn(pump(source, pusher)));

        Ok(Box::pin(async_stream::try_stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!(backend = %KIND, "cancelled, closing socket");
                        break;
                    }
                    next = bridge.next() => next,
                };
                let Some(text) = next else {
                    tracing::debug!(backend = %KIND, "socket closed by server");
                    break;
                };
                let text = text?;

                let event: StreamEvent = serde_json::from_str(&text)
                    .map_err(|e| QuillError::Protocol(format!("stream event: {e}")))?;
                match event {
                    StreamEvent::TextStream { text } => {
                        yield Chunk::text(text);
                    }
                    StreamEvent::StreamEnd => break,
                    StreamEvent::Other => {}
                }
            }

            bridge.shutdown();
            if let Err(e) = sink.close().await {
                tracing::debug!(backend = %KIND, "error closing socket: {e}");
            }
        }))
    }
}

/// Forward the socket's text messages into the bridge until it closes or fails.
async fn pump(mut source: SplitStream<Socket>, pusher: Pusher<String>) {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if !pusher.push(text).await {
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                tracing::debug!(backend = %KIND, ?frame, "close frame received");
                break;
            }
            // Pings are answered by tungstenite itself; binary frames aren't part of the protocol.
            Ok(_) => {}
            Err(e) => {
                pusher.fail(e.into()).await;
                return;
            }
        }
    }
    pusher.close().await;
}
