//! Mock inference servers for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Url;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const SSE_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: close\r\n\r\n";

/// Helper: bind a TCP listener on localhost and return (listener, port).
pub async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let (listener, port) = mock_listener().await;
    drop(listener);
    port
}

pub fn endpoint(scheme: &str, port: u16) -> Url {
    Url::parse(&format!("{scheme}://127.0.0.1:{port}")).unwrap()
}

/// Format an SSE data event from a JSON payload.
pub fn sse_event(json: &str) -> String {
    format!("data: {json}\n\n")
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl HttpRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Read one HTTP/1.1 request (headers plus Content-Length body).
pub async fn read_request(socket: &mut TcpStream) -> HttpRequest {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut tmp).await.unwrap();
        assert!(n > 0, "connection closed before request headers");
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let n = socket.read(&mut tmp).await.unwrap();
        assert!(n > 0, "connection closed before request body");
        buf.extend_from_slice(&tmp[..n]);
    }

    let mut request_line = head.lines().next().unwrap_or_default().split(' ');
    HttpRequest {
        method: request_line.next().unwrap_or_default().to_string(),
        path: request_line.next().unwrap_or_default().to_string(),
        body: String::from_utf8_lossy(&buf[body_start..body_start + content_length]).to_string(),
    }
}

pub fn json_response(status: u16, body: &str) -> Vec<u8> {
    let reason = if status < 400 { "OK" } else { "Error" };
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// What the mock server answers a request with.
pub enum Reply {
    /// A complete response.
    Full(Vec<u8>),
    /// SSE headers, then each fragment written separately, then keep the
    /// connection open for `hold` before closing.
    Sse {
        fragments: Vec<String>,
        hold: Duration,
    },
    /// Read the request, then keep the connection open without answering.
    Silent(Duration),
}

impl Reply {
    pub fn sse(fragments: &[&str]) -> Self {
        Self::Sse {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            hold: Duration::ZERO,
        }
    }

    pub fn sse_then_hold(fragments: &[&str], hold: Duration) -> Self {
        Self::Sse {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            hold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub request: HttpRequest,
    pub at: Instant,
}

/// HTTP server that answers every connection through `handler` and records
/// each request with its arrival time. Connections are served concurrently.
pub struct MockServer {
    pub port: u16,
    requests: Arc<Mutex<Vec<Recorded>>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Reply + Send + Sync + 'static,
    {
        let (listener, port) = mock_listener().await;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        let recorded = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let request = read_request(&mut socket).await;
                    recorded.lock().unwrap().push(Recorded {
                        request: request.clone(),
                        at: Instant::now(),
                    });
                    match handler(&request) {
                        Reply::Full(bytes) => {
                            let _ = socket.write_all(&bytes).await;
                        }
                        Reply::Sse { fragments, hold } => {
                            if socket.write_all(SSE_HEADERS).await.is_err() {
                                return;
                            }
                            for fragment in fragments {
                                if socket.write_all(fragment.as_bytes()).await.is_err() {
                                    return;
                                }
                                let _ = socket.flush().await;
                                tokio::time::sleep(Duration::from_millis(10)).await;
                            }
                            tokio::time::sleep(hold).await;
                        }
                        Reply::Silent(hold) => {
                            tokio::time::sleep(hold).await;
                        }
                    }
                });
            }
        });

        Self {
            port,
            requests,
            handle,
        }
    }

    pub fn endpoint(&self) -> Url {
        endpoint("http", self.port)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| r.request.path)
            .collect()
    }

    /// Wait up to `within` for a request to `path`.
    pub async fn wait_for(&self, path: &str, within: Duration) -> Option<Recorded> {
        let deadline = Instant::now() + within;
        loop {
            if let Some(found) = self.requests().into_iter().find(|r| r.request.path == path) {
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
