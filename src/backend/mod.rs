pub mod abortable_http;
pub mod direct_http;
pub mod websocket;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use futures_util::Stream;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::QuillError;
use crate::options::CompletionRequest;

use abortable_http::AbortableHttpAdapter;
use direct_http::DirectHttpAdapter;
use websocket::WebSocketAdapter;

/// Max bytes of an error response body kept for the error message.
const MAX_ERROR_BODY_BYTES: usize = 4 * 1024;

/// Which inference server protocol to speak.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// llama.cpp server: SSE over HTTP POST, tokenize endpoint, no stop call.
    #[default]
    #[serde(rename = "llama-cpp")]
    DirectHttpStream,
    /// text-generation-webui streaming API over a WebSocket.
    #[serde(rename = "websocket")]
    WebSocketStream,
    /// KoboldCpp: SSE over HTTP POST plus an explicit abort call.
    #[serde(rename = "koboldcpp")]
    HttpStreamWithAbort,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectHttpStream => "llama-cpp",
            Self::WebSocketStream => "websocket",
            Self::HttpStreamWithAbort => "koboldcpp",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::DirectHttpStream => 8080,
            Self::WebSocketStream => 5005,
            Self::HttpStreamWithAbort => 5001,
        }
    }

    fn uses_websocket(&self) -> bool {
        matches!(self, Self::WebSocketStream)
    }

    pub fn default_endpoint(&self) -> Url {
        let scheme = if self.uses_websocket() { "ws" } else { "http" };
        let raw = format!("{scheme}://localhost:{}", self.default_port());
        Url::parse(&raw).unwrap_or_else(|_| unreachable!("static endpoint {raw} is valid"))
    }

    /// Rewrite `endpoint` to this backend's conventions after the user switches
    /// backend: `http`/`ws` (and `https`/`wss`) swap to match the transport, and
    /// a port that is some backend's default becomes this backend's default.
    /// Custom ports, host and path are kept.
    pub fn adapt_endpoint(&self, endpoint: &Url) -> Result<Url, QuillError> {
        let mut url = endpoint.clone();
        let secure = matches!(url.scheme(), "https" | "wss");
        let scheme = match (self.uses_websocket(), secure) {
            (true, false) => "ws",
            (true, true) => "wss",
            (false, false) => "http",
            (false, true) => "https",
        };
        url.set_scheme(scheme)
            .map_err(|_| QuillError::InvalidEndpoint(endpoint.to_string()))?;

        let known_default = url.port().is_some_and(|port| {
            [
                BackendKind::DirectHttpStream,
                BackendKind::WebSocketStream,
                BackendKind::HttpStreamWithAbort,
            ]
            .iter()
            .any(|kind| kind.default_port() == port)
        });
        if known_default {
            url.set_port(Some(self.default_port()))
                .map_err(|_| QuillError::InvalidEndpoint(endpoint.to_string()))?;
        }
        Ok(url)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = QuillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llama-cpp" | "llamacpp" | "llama.cpp" | "direct" => Ok(Self::DirectHttpStream),
            "websocket" | "ooba" | "oobabooga" => Ok(Self::WebSocketStream),
            "koboldcpp" | "kobold" | "abortable" => Ok(Self::HttpStreamWithAbort),
            other => Err(QuillError::Config(format!(
                "unknown backend {other:?} (expected llama-cpp, websocket or koboldcpp)"
            ))),
        }
    }
}

/// One piece of generated text, normalized across backends.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Chunk {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_probabilities: Option<Vec<TokenProbabilities>>,
}

impl Chunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            completion_probabilities: None,
        }
    }

    /// Tokens this chunk adds to the running count: one per probability
    /// entry when the backend reports them, otherwise one.
    pub fn token_cost(&self) -> usize {
        self.completion_probabilities
            .as_ref()
            .map_or(1, |probs| probs.len())
    }
}

/// Alternatives for one generated token.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct TokenProbabilities {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub probs: Vec<TokenProbability>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TokenProbability {
    pub tok_str: String,
    pub prob: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenizeResult {
    pub token_count: usize,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, QuillError>> + Send>>;

/// Backend adapter, selected once from a [`BackendKind`].
#[derive(Debug, Clone)]
pub enum Backend {
    DirectHttp(DirectHttpAdapter),
    WebSocket(WebSocketAdapter),
    AbortableHttp(AbortableHttpAdapter),
}

impl Backend {
    pub fn new(kind: BackendKind, client: Client) -> Self {
        match kind {
            BackendKind::DirectHttpStream => Self::DirectHttp(DirectHttpAdapter::new(client)),
            BackendKind::WebSocketStream => Self::WebSocket(WebSocketAdapter::new()),
            BackendKind::HttpStreamWithAbort => {
                Self::AbortableHttp(AbortableHttpAdapter::new(client))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::DirectHttp(_) => BackendKind::DirectHttpStream,
            Self::WebSocket(_) => BackendKind::WebSocketStream,
            Self::AbortableHttp(_) => BackendKind::HttpStreamWithAbort,
        }
    }

    /// Whether stopping server-side generation needs a network call.
    pub fn requires_abort(&self) -> bool {
        matches!(self, Self::AbortableHttp(_))
    }

    /// Count the tokens of `text`. Backends without a tokenize endpoint
    /// return zero without touching the network.
    pub async fn tokenize(
        &self,
        endpoint: &Url,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TokenizeResult, QuillError> {
        match self {
            Self::DirectHttp(adapter) => adapter.tokenize(endpoint, text, cancel).await,
            Self::WebSocket(_) | Self::AbortableHttp(_) => Ok(TokenizeResult::default()),
        }
    }

    /// Open a generation. Connection failures and non-success statuses are
    /// returned here; the stream itself ends quietly once `cancel` fires.
    pub async fn stream_completion(
        &self,
        endpoint: &Url,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, QuillError> {
        match self {
            Self::DirectHttp(adapter) => adapter.stream_completion(endpoint, request, cancel).await,
            Self::WebSocket(adapter) => adapter.stream_completion(endpoint, request, cancel).await,
            Self::AbortableHttp(adapter) => {
                adapter.stream_completion(endpoint, request, cancel).await
            }
        }
    }

    /// Stop server-side generation. No-op for backends where closing the
    /// connection is enough.
    pub async fn abort(&self, endpoint: &Url) -> Result<(), QuillError> {
        match self {
            Self::AbortableHttp(adapter) => adapter.abort(endpoint).await,
            Self::DirectHttp(_) | Self::WebSocket(_) => Ok(()),
        }
    }
}

/// Shared HTTP client for the HTTP backends. No request timeout: callers
/// bound generations through cancellation.
pub fn http_client() -> Result<Client, QuillError> {
    Ok(Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()?)
}

/// Resolve an absolute API path against the endpoint (the endpoint's own path is replaced).
pub(crate) fn endpoint_url(endpoint: &Url, path: &str) -> Result<Url, QuillError> {
    endpoint
        .join(path)
        .map_err(|e| QuillError::InvalidEndpoint(format!("{endpoint}: {e}")))
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, QuillError>
where
    F: Future<Output = Result<T, QuillError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(QuillError::Cancelled),
        result = fut => result,
    }
}

/// Pass through success responses; turn anything else into a `Network` error
/// carrying the (truncated) body.
pub(crate) async fn check_status(
    kind: BackendKind,
    response: reqwest::Response,
) -> Result<reqwest::Response, QuillError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let body = String::from_utf8_lossy(&body[..body.len().min(MAX_ERROR_BODY_BYTES)]);
    tracing::warn!(backend = %kind, %status, "inference server returned error status");
    Err(QuillError::status(kind, status, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn default_endpoints_follow_backend_conventions() {
        assert_eq!(
            BackendKind::DirectHttpStream.default_endpoint().as_str(),
            "http://localhost:8080/"
        );
        assert_eq!(
            BackendKind::WebSocketStream.default_endpoint().as_str(),
            "ws://localhost:5005/"
        );
        assert_eq!(
            BackendKind::HttpStreamWithAbort.default_endpoint().as_str(),
            "http://localhost:5001/"
        );
    }

    #[test]
    fn switching_to_websocket_changes_scheme_and_default_port() {
        let adapted = BackendKind::WebSocketStream
            .adapt_endpoint(&url("http://10.0.0.2:8080"))
            .unwrap();
        assert_eq!(adapted.as_str(), "ws://10.0.0.2:5005/");
    }

    #[test]
    fn switching_back_preserves_tls() {
        let adapted = BackendKind::HttpStreamWithAbort
            .adapt_endpoint(&url("wss://gpu.example:5005/base"))
            .unwrap();
        assert_eq!(adapted.as_str(), "https://gpu.example:5001/base");
    }

    #[test]
    fn custom_port_is_kept() {
        let adapted = BackendKind::WebSocketStream
            .adapt_endpoint(&url("http://localhost:9999"))
            .unwrap();
        assert_eq!(adapted.as_str(), "ws://localhost:9999/");
    }

    #[test]
    fn implicit_port_is_kept() {
        let adapted = BackendKind::WebSocketStream
            .adapt_endpoint(&url("https://proxy.example/"))
            .unwrap();
        assert_eq!(adapted.as_str(), "wss://proxy.example/");
        assert_eq!(adapted.port(), None);
    }

    #[test]
    fn backend_kind_parses_names_and_aliases() {
        assert_eq!(
            "llama.cpp".parse::<BackendKind>().unwrap(),
            BackendKind::DirectHttpStream
        );
        assert_eq!(
            "Kobold".parse::<BackendKind>().unwrap(),
            BackendKind::HttpStreamWithAbort
        );
        assert!("vllm".parse::<BackendKind>().is_err());
        for kind in [
            BackendKind::DirectHttpStream,
            BackendKind::WebSocketStream,
            BackendKind::HttpStreamWithAbort,
        ] {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn endpoint_path_is_replaced_by_api_path() {
        let joined = endpoint_url(&url("http://host:8080/ui/"), "/completion").unwrap();
        assert_eq!(joined.as_str(), "http://host:8080/completion");
    }

    #[test]
    fn token_cost_counts_probability_entries() {
        let mut chunk = Chunk::text("ab");
        assert_eq!(chunk.token_cost(), 1);
        chunk.completion_probabilities = Some(vec![
            TokenProbabilities::default(),
            TokenProbabilities::default(),
        ]);
        assert_eq!(chunk.token_cost(), 2);
    }
}
