use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendKind, Chunk, ChunkStream, cancellable, check_status, endpoint_url,
};
use crate::error::QuillError;
use crate::options::{CompletionRequest, translate};
use crate::sse::response_records;

const KIND: BackendKind = BackendKind::HttpStreamWithAbort;

/// SSE streaming server that keeps generating after the client disconnects,
/// so stopping needs an explicit POST to the abort endpoint.
#[derive(Debug, Clone)]
pub struct AbortableHttpAdapter {
    client: Client,
}

#[derive(Deserialize)]
struct TokenRecord {
    #[serde(default)]
    token: String,
}

impl AbortableHttpAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn stream_completion(
        &self,
        endpoint: &Url,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, QuillError> {
        let url = endpoint_url(endpoint, "/api/extra/generate/stream")?;
        let body = translate(KIND, request);

        tracing::debug!(backend = %KIND, %url, prompt_len = request.prompt.len(), "starting completion");
        let response = cancellable(&cancel, async {
            let response = self.client.post(url).json(&body).send().await?;
            check_status(KIND, response).await
        })
        .await?;

        let records = response_records(response, cancel);
        Ok(Box::pin(async_stream::try_stream! {
            for await record in records {
                let record: Value = record?;
                if !record.is_object() {
                    tracing::debug!(backend = %KIND, %record, "skipping non-object record");
                    continue;
                }
                let TokenRecord { token } = serde_json::from_value(record)
                    .map_err(|e| QuillError::Protocol(format!("token record: {e}")))?;
                yield Chunk::text(token);
            }
        }))
    }

    /// Ask the server to stop the current generation.
    pub async fn abort(&self, endpoint: &Url) -> Result<(), QuillError> {
        let url = endpoint_url(endpoint, "/api/extra/abort")?;
        tracing::debug!(backend = %KIND, %url, "sending abort");
        let response = self.client.post(url).json(&json!({})).send().await?;
        check_status(KIND, response).await?;
        Ok(())
    }
}
