//! Owns the single in-flight generation.
//!
//! State machine: `Idle → Requesting → Streaming → {Completed, Cancelled, Failed}`.
//! Terminal states behave like `Idle` for the next [`Coordinator::start`].
//! A generation reaches exactly one terminal state, whichever of natural end,
//! failure, [`Coordinator::cancel`] or dropping the stream happens first.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::Url;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, Chunk, ChunkStream};
use crate::config::Config;
use crate::error::QuillError;
use crate::options::CompletionRequest;
use crate::preflight::Preflight;

/// Wait after a cancellation before the same backend gets a new request.
/// Some servers produce garbage when a stop and a start arrive back to back.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(500);

static NEXT_GENERATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    /// Pre-flight tokenize in progress.
    Requesting,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl GenerationState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Requesting | Self::Streaming)
    }
}

/// Handle to one generation, returned by [`Coordinator::start`] and passed
/// back to [`Coordinator::cancel`].
#[derive(Debug, Clone)]
pub struct GenerationContext {
    id: u64,
    token: CancellationToken,
}

impl GenerationContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct Inner {
    state: GenerationState,
    /// Id of the generation `state` refers to while it is active.
    live: Option<u64>,
}

#[derive(Debug)]
struct Shared {
    backend: Backend,
    endpoint: Url,
    cooldown: Duration,
    preflight: Preflight,
    inner: Mutex<Inner>,
    /// When the last cancellation took effect locally (or its abort call
    /// returned, whichever is later).
    last_cancel: Mutex<Option<Instant>>,
    /// Held across the abort call, so a start waits for an in-progress
    /// cancel before computing its cooldown.
    aborting: tokio::sync::Mutex<()>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> GenerationState {
        self.lock().state
    }

    fn mark_cancelled(&self) {
        *self.last_cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    fn last_cancel(&self) -> Option<Instant> {
        *self.last_cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move generation `id` into a terminal state. Only the first call for
    /// a given generation has any effect.
    fn finish(&self, id: u64, to: GenerationState) -> bool {
        let mut inner = self.lock();
        if inner.live != Some(id) || !inner.state.is_active() {
            return false;
        }
        inner.state = to;
        inner.live = None;
        true
    }

    fn begin_streaming(&self, id: u64) -> bool {
        let mut inner = self.lock();
        if inner.live != Some(id) || inner.state != GenerationState::Requesting {
            return false;
        }
        inner.state = GenerationState::Streaming;
        true
    }
}

/// Single-generation client: one backend, one endpoint, at most one live
/// generation. Clones share the same state.
#[derive(Debug, Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(backend: Backend, endpoint: Url) -> Self {
        Self::with_timing(backend, endpoint, DEFAULT_COOLDOWN, crate::preflight::DEFAULT_DEBOUNCE)
    }

    pub fn with_timing(
        backend: Backend,
        endpoint: Url,
        cooldown: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                endpoint,
                cooldown,
                preflight: Preflight::new(debounce),
                inner: Mutex::new(Inner {
                    state: GenerationState::Idle,
                    live: None,
                }),
                last_cancel: Mutex::new(None),
                aborting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, QuillError> {
        let endpoint = config.server.endpoint_url()?;
        let backend = Backend::new(config.server.backend, crate::backend::http_client()?);
        Ok(Self::with_timing(
            backend,
            endpoint,
            config.timing.cooldown(),
            config.timing.debounce(),
        ))
    }

    pub fn state(&self) -> GenerationState {
        self.shared.state()
    }

    pub fn backend(&self) -> &Backend {
        &self.shared.backend
    }

    pub fn endpoint(&self) -> &Url {
        &self.shared.endpoint
    }

    pub fn preflight(&self) -> &Preflight {
        &self.shared.preflight
    }

    /// Live token count (prompt plus generated tokens).
    pub fn token_count(&self) -> watch::Receiver<usize> {
        self.shared.preflight.subscribe()
    }

    /// Refresh the token count after the user stops editing. Skipped while a
    /// generation is live, since the generation keeps the count itself.
    pub async fn refresh_token_count(&self, text: &str) -> Result<Option<usize>, QuillError> {
        if self.state().is_active() {
            return Ok(None);
        }
        self.shared
            .preflight
            .count_debounced(&self.shared.backend, &self.shared.endpoint, text)
            .await
    }

    /// Start a generation.
    ///
    /// Fails with [`QuillError::Busy`] (before any network traffic) if one is
    /// already live. Waits out the cooldown if the last generation was
    /// cancelled less than the cooldown ago.
    pub async fn start(&self, request: CompletionRequest) -> Result<Generation, QuillError> {
        if self.state().is_active() {
            return Err(QuillError::Busy);
        }

        let last_cancel = {
            let _aborting = self.shared.aborting.lock().await;
            self.shared.last_cancel()
        };
        if let Some(ready_at) = last_cancel.map(|at| at + self.shared.cooldown)
            && Instant::now() < ready_at
        {
            tracing::debug!(
                wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                "waiting out cancellation cooldown"
            );
            tokio::time::sleep_until(ready_at).await;
        }

        let id = NEXT_GENERATION_ID.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.shared.lock();
            if inner.state.is_active() {
                return Err(QuillError::Busy);
            }
            inner.state = GenerationState::Requesting;
            inner.live = Some(id);
        }

        // The generation publishes its own prompt count; a pending idle count would be stale.
        self.shared.preflight.cancel();

        let context = GenerationContext {
            id,
            token: CancellationToken::new(),
        };
        tracing::info!(
            generation = id,
            backend = %self.shared.backend.kind(),
            endpoint = %self.shared.endpoint,
            "generation started"
        );

        let stream = generate(self.shared.clone(), context.clone(), request);
        Ok(Generation { context, stream })
    }

    /// Cancel `context` if it is the live generation. Signals the local
    /// stream, then calls the backend's abort endpoint when it has one.
    /// Returns false (and does nothing) if the generation already ended.
    ///
    /// The local side completes before the first await on the network, so
    /// dropping this future mid-abort still leaves the generation stopped
    /// and the cooldown recorded.
    pub async fn cancel(&self, context: &GenerationContext) -> bool {
        let _aborting = self.shared.aborting.lock().await;
        if !self.shared.finish(context.id, GenerationState::Cancelled) {
            return false;
        }
        context.token.cancel();
        self.shared.mark_cancelled();
        tracing::info!(generation = context.id, "generation cancelled");

        if self.shared.backend.requires_abort() {
            if let Err(e) = self.shared.backend.abort(&self.shared.endpoint).await {
                tracing::warn!(generation = context.id, "abort call failed: {e}");
            }
            // The server has only now stopped; count the cooldown from here.
            self.shared.mark_cancelled();
        }
        true
    }
}

/// A running generation: its context plus the chunk stream.
///
/// Yields only chunks with non-empty content. Ends silently on cancellation;
/// any other error is yielded once and ends the stream.
pub struct Generation {
    context: GenerationContext,
    stream: ChunkStream,
}

impl Generation {
    pub fn context(&self) -> &GenerationContext {
        &self.context
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Stream for Generation {
    type Item = Result<Chunk, QuillError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

/// Marks the generation cancelled if its stream is dropped before reaching a
/// terminal state. Local only: no abort call is made from a destructor, use
/// [`Coordinator::cancel`] for that.
struct DropGuard {
    shared: Arc<Shared>,
    context: GenerationContext,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if !self.shared.finish(self.context.id, GenerationState::Cancelled) {
            return;
        }
        self.context.token.cancel();
        self.shared.mark_cancelled();
        tracing::info!(generation = self.context.id, "generation dropped before completion");
    }
}

fn generate(shared: Arc<Shared>, context: GenerationContext, request: CompletionRequest) -> ChunkStream {
    // Built outside the stream body so it is dropped even if the stream never gets polled.
    let guard = DropGuard {
        shared: shared.clone(),
        context: context.clone(),
    };
    Box::pin(async_stream::stream! {
        let _guard = guard;
        let id = context.id;
        let token = context.token.clone();

        match shared.backend.tokenize(&shared.endpoint, &request.prompt, &token).await {
            Ok(result) => shared.preflight.publish(result.token_count),
            Err(_) if token.is_cancelled() => return,
            Err(e) => {
                if shared.finish(id, GenerationState::Failed) {
                    tracing::warn!(generation = id, "tokenize failed: {e}");
                    yield Err(e);
                }
                return;
            }
        }

        if !shared.begin_streaming(id) {
            return;
        }

        let mut chunks = match shared
            .backend
            .stream_completion(&shared.endpoint, &request, token.clone())
            .await
        {
            Ok(chunks) => chunks,
            Err(_) if token.is_cancelled() => return,
            Err(e) => {
                if shared.finish(id, GenerationState::Failed) {
                    tracing::warn!(generation = id, "failed to start stream: {e}");
                    yield Err(e);
                }
                return;
            }
        };

        let mut generated = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = chunks.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if chunk.content.is_empty() {
                        continue;
                    }
                    generated += chunk.token_cost();
                    shared.preflight.add(chunk.token_cost());
                    yield Ok(chunk);
                }
                Some(Err(_)) if token.is_cancelled() => break,
                Some(Err(e)) => {
                    if shared.finish(id, GenerationState::Failed) {
                        tracing::warn!(generation = id, generated, "generation failed: {e}");
                        yield Err(e);
                    }
                    return;
                }
                None => break,
            }
        }

        if shared.finish(id, GenerationState::Completed) {
            tracing::info!(generation = id, generated, "generation completed");
        }
    })
}
