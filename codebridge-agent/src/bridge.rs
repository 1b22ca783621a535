// ABOUTME: Push-to-pull bridge between a record producer task and a single consumer.
// ABOUTME: Ordered queue plus one notification slot; errors surface only after the queue drains.

use crate::error::QueryError;
use crate::record::OutputRecord;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct State {
    queue: VecDeque<OutputRecord>,
    closed: bool,
    error: Option<QueryError>,
    /// Set once the terminal signal (clean end or error) was handed out
    finished: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Holds at most one permit, which acts as the pending-consumer slot
    notify: Notify,
    /// Fired when the receiver drops
    receiver_gone: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a connected sender/receiver pair
pub fn record_channel() -> (RecordSender, RecordReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            closed: false,
            error: None,
            finished: false,
        }),
        notify: Notify::new(),
        receiver_gone: CancellationToken::new(),
    });
    (
        RecordSender {
            shared: Arc::clone(&shared),
        },
        RecordReceiver { shared },
    )
}

/// Producer side, owned by the task that reads the backend.
///
/// Dropping the sender without calling [`close`](Self::close) or
/// [`fail`](Self::fail) ends the stream cleanly.
pub struct RecordSender {
    shared: Arc<Shared>,
}

impl RecordSender {
    /// Append a record and wake the consumer if it is waiting
    pub fn push(&self, record: OutputRecord) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                tracing::debug!("Record pushed after close, dropping");
                return;
            }
            state.queue.push_back(record);
        }
        self.shared.notify.notify_one();
    }

    /// Signal a clean end of stream
    pub fn close(&self) {
        self.finish(None);
    }

    /// Signal end of stream with an error, raised after queued records drain
    pub fn fail(&self, error: QueryError) {
        self.finish(Some(error));
    }

    /// True once the consumer is gone and further output has nowhere to go
    pub fn is_receiver_dropped(&self) -> bool {
        self.shared.receiver_gone.is_cancelled()
    }

    /// Resolves once the consumer is gone. Safe to use as a `select!` arm.
    pub async fn receiver_dropped(&self) {
        self.shared.receiver_gone.cancelled().await
    }

    fn finish(&self, error: Option<QueryError>) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.error = error;
        }
        self.shared.notify.notify_one();
    }
}

impl Drop for RecordSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer side. Exactly one reader; not `Clone`.
pub struct RecordReceiver {
    shared: Arc<Shared>,
}

impl RecordReceiver {
    /// Next record, the deferred error, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<Result<OutputRecord, QueryError>> {
        loop {
            {
                let mut state = self.shared.lock();
                if let Some(record) = state.queue.pop_front() {
                    return Some(Ok(record));
                }
                if state.closed {
                    if state.finished {
                        return None;
                    }
                    state.finished = true;
                    return state.error.take().map(Err);
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` means nothing ready
    pub fn try_recv(&mut self) -> Option<Result<OutputRecord, QueryError>> {
        let mut state = self.shared.lock();
        if let Some(record) = state.queue.pop_front() {
            return Some(Ok(record));
        }
        if state.closed && !state.finished {
            state.finished = true;
            return state.error.take().map(Err);
        }
        None
    }

    /// Records currently buffered
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<OutputRecord, QueryError>> + Send {
        stream::unfold(self, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
    }
}

impl Drop for RecordReceiver {
    fn drop(&mut self) {
        self.shared.receiver_gone.cancel();
    }
}
