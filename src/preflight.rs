//! Token-count pre-flight.
//!
//! At most one pre-flight is pending at a time. Issuing a new one cancels the
//! previous one first, so a stale count can never overwrite a newer one.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::Url;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::error::QuillError;

/// Quiet period after the last edit before the idle count is refreshed.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct Preflight {
    pending: Mutex<Option<CancellationToken>>,
    counts: watch::Sender<usize>,
    debounce: Duration,
}

impl Default for Preflight {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl Preflight {
    pub fn new(debounce: Duration) -> Self {
        let (counts, _) = watch::channel(0);
        Self {
            pending: Mutex::new(None),
            counts,
            debounce,
        }
    }

    /// Live token count: prompt tokens plus tokens generated so far.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.counts.subscribe()
    }

    pub fn current(&self) -> usize {
        *self.counts.borrow()
    }

    /// Cancel the pending pre-flight, if any.
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = pending.take() {
            token.cancel();
        }
    }

    /// Tokenize now. Resolves to `None` if superseded or cancelled.
    pub async fn count_now(
        &self,
        backend: &Backend,
        endpoint: &Url,
        text: &str,
    ) -> Result<Option<usize>, QuillError> {
        let token = self.supersede();
        self.run(backend, endpoint, text, token).await
    }

    /// Tokenize after the debounce period, unless another pre-flight is
    /// issued (or [`cancel`](Self::cancel) is called) in the meantime.
    pub async fn count_debounced(
        &self,
        backend: &Backend,
        endpoint: &Url,
        text: &str,
    ) -> Result<Option<usize>, QuillError> {
        let token = self.supersede();
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            _ = tokio::time::sleep(self.debounce) => {}
        }
        self.run(backend, endpoint, text, token).await
    }

    /// Set the count directly (prompt count at generation start).
    pub(crate) fn publish(&self, count: usize) {
        self.counts.send_replace(count);
    }

    /// Add generated tokens to the count.
    pub(crate) fn add(&self, tokens: usize) {
        self.counts.send_modify(|count| *count += tokens);
    }

    fn supersede(&self) -> CancellationToken {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = pending.take() {
            old.cancel();
        }
        let token = CancellationToken::new();
        *pending = Some(token.clone());
        token
    }

    async fn run(
        &self,
        backend: &Backend,
        endpoint: &Url,
        text: &str,
        token: CancellationToken,
    ) -> Result<Option<usize>, QuillError> {
        let result = match backend.tokenize(endpoint, text, &token).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => return Ok(None),
            Err(e) => return Err(e),
        };

        // Publish under the lock so a concurrent supersede can't interleave.
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            return Ok(None);
        }
        self.counts.send_replace(result.token_count);
        *pending = None;
        Ok(Some(result.token_count))
    }
}
