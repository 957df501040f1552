//! HttpStreamWithAbort adapter: SSE token records plus the abort call.

mod common;

use std::time::Duration;

use futures_util::StreamExt;
use quill::backend::http_client;
use quill::{Backend, BackendKind, CompletionRequest, MirostatMode, QuillError, SamplingOptions};
use tokio_util::sync::CancellationToken;

use common::{MockServer, Reply, endpoint, json_response, mock_listener};

fn backend() -> Backend {
    Backend::new(BackendKind::HttpStreamWithAbort, http_client().unwrap())
}

fn kobold_server_reply(request: &common::HttpRequest) -> Reply {
    match request.path.as_str() {
        "/api/extra/generate/stream" => Reply::sse(&[
            "event: message\ndata: {\"token\":\"Hel\"}\n\n",
            "event: message\ndata: {\"token\":\"lo\"}\n\n",
        ]),
        "/api/extra/abort" => Reply::Full(json_response(200, r#"{"success":"true"}"#)),
        _ => Reply::Full(json_response(404, "")),
    }
}

#[tokio::test]
async fn token_records_become_chunks() {
    let server = MockServer::spawn(kobold_server_reply).await;

    let stream = backend()
        .stream_completion(
            &server.endpoint(),
            &CompletionRequest::new("Say hi", SamplingOptions::default()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let contents: Vec<String> =
        tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.unwrap().content)
            .collect();
    assert_eq!(contents, vec!["Hel", "lo"]);
}

#[tokio::test]
async fn request_body_uses_native_names() {
    let server = MockServer::spawn(kobold_server_reply).await;

    let options = SamplingOptions {
        mirostat: MirostatMode::Off,
        seed: Some(42),
        max_tokens: Some(80),
        stop: vec!["###".to_string()],
        context_length: Some(2048),
        ..SamplingOptions::default()
    };
    let stream = backend()
        .stream_completion(
            &server.endpoint(),
            &CompletionRequest::new("Say hi", options),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let _: Vec<_> = stream.collect().await;

    let recorded = &server.requests()[0].request;
    assert_eq!(recorded.method, "POST");
    assert_eq!(recorded.path, "/api/extra/generate/stream");

    let body = recorded.json();
    assert_eq!(body["prompt"], "Say hi");
    assert_eq!(body["rep_pen"], 1.1);
    assert_eq!(body["rep_pen_range"], 256);
    assert_eq!(body["sampler_seed"], 42);
    assert_eq!(body["max_length"], 80);
    assert_eq!(body["max_context_length"], 2048);
    assert_eq!(body["stop_sequence"], serde_json::json!(["###"]));
    assert_eq!(body["top_k"], 40);
    assert_eq!(body["typical"], 1.0);
    assert_eq!(body["use_default_badwordsids"], false);
    for absent in ["mirostat_tau", "presence_penalty", "penalize_nl", "n_probs", "stream"] {
        assert!(body.get(absent).is_none(), "{absent} must not be sent: {body}");
    }
}

#[tokio::test]
async fn abort_posts_to_abort_endpoint() {
    let server = MockServer::spawn(kobold_server_reply).await;

    backend().abort(&server.endpoint()).await.unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].request.method, "POST");
    assert_eq!(requests[0].request.path, "/api/extra/abort");
}

#[tokio::test]
async fn abort_error_status_is_network_error() {
    let server = MockServer::spawn(|_| Reply::Full(json_response(500, "boom"))).await;

    let err = backend().abort(&server.endpoint()).await.unwrap_err();
    assert!(
        matches!(
            err,
            QuillError::Network {
                backend: BackendKind::HttpStreamWithAbort,
                status: Some(500),
                ..
            }
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn tokenize_is_zero_without_network() {
    let (listener, port) = mock_listener().await;

    let result = backend()
        .tokenize(&endpoint("http", port), "some prompt", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.token_count, 0);

    let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(accepted.is_err(), "tokenize must not connect");
}

#[tokio::test]
async fn only_this_backend_requires_abort() {
    let client = http_client().unwrap();
    assert!(Backend::new(BackendKind::HttpStreamWithAbort, client.clone()).requires_abort());
    assert!(!Backend::new(BackendKind::DirectHttpStream, client.clone()).requires_abort());
    assert!(!Backend::new(BackendKind::WebSocketStream, client).requires_abort());
}
