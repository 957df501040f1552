use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendKind, Chunk, ChunkStream, TokenizeResult, cancellable, check_status, endpoint_url,
};
use crate::error::QuillError;
use crate::options::{CompletionRequest, translate};
use crate::sse::response_records;

const KIND: BackendKind = BackendKind::DirectHttpStream;

/// Server that streams `/completion` records already shaped like [`Chunk`]
/// and exposes `/tokenize`.
#[derive(Debug, Clone)]
pub struct DirectHttpAdapter {
    client: Client,
}

#[derive(Deserialize)]
struct TokenizeResponse {
    tokens: Vec<Value>,
}

impl DirectHttpAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The prompt is tokenized with a leading space, the way the server
    /// tokenizes it for generation; the BOS token is added to the count.
    pub async fn tokenize(
        &self,
        endpoint: &Url,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TokenizeResult, QuillError> {
        let url = endpoint_url(endpoint, "/tokenize")?;
        let body = json!({ "content": format!(" {text}") });

        let tokens = cancellable(cancel, async {
            let response = self.client.post(url).json(&body).send().await?;
            let response = check_status(KIND, response).await?;
            let bytes = response.bytes().await?;
            let parsed: TokenizeResponse = serde_json::from_slice(&bytes)
                .map_err(|e| QuillError::Protocol(format!("tokenize response: {e}")))?;
            Ok(parsed.tokens)
        })
        .await?;

        tracing::debug!(backend = %KIND, tokens = tokens.len(), "tokenized prompt");
        Ok(TokenizeResult {
            token_count: tokens.len() + 1,
        })
    }

    pub async fn stream_completion(
        &self,
        endpoint: &Url,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, QuillError> {
        let url = endpoint_url(endpoint, "/completion")?;
        let mut body = translate(KIND, request);
        body.insert("stream".to_string(), Value::Bool(true));

        tracing::debug!(backend = %KIND, %url, prompt_len = request.prompt.len(), "starting completion");
        let response = cancellable(&cancel, async {
            let response = self.client.post(url).json(&body).send().await?;
            check_status(KIND, response).await
        })
        .await?;

        let records = response_records(response, cancel);
        Ok(Box::pin(async_stream::try_stream! {
            for await record in records {
                let record = record?;
                // Bare (non-object) payloads carry no text.
                if !record.is_object() {
                    tracing::debug!(backend = %KIND, %record, "skipping non-object record");
                    continue;
                }
                let chunk: Chunk = serde_json::from_value(record)
                    .map_err(|e| QuillError::Protocol(format!("completion record: {e}")))?;
                yield chunk;
            }
        }))
    }
}
