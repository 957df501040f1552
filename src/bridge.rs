//! Push-to-pull bridge for event-driven sources.
//!
//! The producer side pushes items, a failure, or a close sentinel into a
//! bounded queue. The consumer pulls with [`Bridge::next`], which suspends
//! until the next event and returns `None` once the source is closed.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::QuillError;

/// Queue depth between the socket reader and the consumer. Full queue applies
/// backpressure to the reader, which stops reading from the socket.
pub const BRIDGE_CAPACITY: usize = 64;

#[derive(Debug)]
enum BridgeEvent<T> {
    Item(T),
    Failed(QuillError),
    Closed,
}

/// Producer half.
#[derive(Debug)]
pub struct Pusher<T> {
    tx: mpsc::Sender<BridgeEvent<T>>,
}

impl<T> Pusher<T> {
    /// Returns false once the consumer has gone away.
    pub async fn push(&self, item: T) -> bool {
        self.tx.send(BridgeEvent::Item(item)).await.is_ok()
    }

    pub async fn fail(&self, error: QuillError) {
        let _ = self.tx.send(BridgeEvent::Failed(error)).await;
    }

    pub async fn close(&self) {
        let _ = self.tx.send(BridgeEvent::Closed).await;
    }
}

/// Consumer half. Owns the producer task (if attached) and aborts it on drop.
#[derive(Debug)]
pub struct Bridge<T> {
    rx: mpsc::Receiver<BridgeEvent<T>>,
    producer: Option<JoinHandle<()>>,
    done: bool,
}

impl<T> Bridge<T> {
    pub fn new(capacity: usize) -> (Pusher<T>, Bridge<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Pusher { tx },
            Bridge {
                rx,
                producer: None,
                done: false,
            },
        )
    }

    /// Tie a producer task's lifetime to this bridge.
    pub fn attach(&mut self, producer: JoinHandle<()>) {
        self.producer = Some(producer);
    }

    /// Next pushed item. `None` after close, after a failure has been
    /// returned, or when every pusher is dropped.
    pub async fn next(&mut self) -> Option<Result<T, QuillError>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(BridgeEvent::Item(item)) => Some(Ok(item)),
            Some(BridgeEvent::Failed(error)) => {
                self.shutdown();
                Some(Err(error))
            }
            Some(BridgeEvent::Closed) | None => {
                self.shutdown();
                None
            }
        }
    }

    /// Stop accepting events. Buffered items are discarded and the producer is aborted.
    pub fn shutdown(&mut self) {
        self.done = true;
        self.rx.close();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

impl<T> Drop for Bridge<T> {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}
