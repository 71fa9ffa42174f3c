//! Append-only recorded-request queue (spec.md §3, C10) with blocking and
//! polling `take_request` per spec.md §6 (`server.takeRequest()` /
//! `server.takeRequest(timeout)`).
//!
//! Concurrent collection: single-producer (only the server appends),
//! multi-consumer (tests call `take_request` from wherever they like), the
//! same shape the teacher's `common::drain` channel is used for elsewhere.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::request::RecordedRequest;

/// The server's append-only request log.
pub struct Recorder {
    queue: Mutex<VecDeque<RecordedRequest>>,
    notify: Notify,
    total: AtomicU64,
}

impl Default for Recorder {
    fn default() -> Self {
        Recorder::new()
    }
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            total: AtomicU64::new(0),
        }
    }

    /// Appends a request; wakes any task parked in `take_request`.
    ///
    /// Ordering: requests are appended in wire-arrival order per connection,
    /// and the recorder is only ever written by the server, so the queue
    /// order is a total order across connections too (spec.md §5 "Ordering
    /// guarantees").
    pub fn record(&self, request: RecordedRequest) {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().unwrap().push_back(request);
        self.notify.notify_waiters();
    }

    /// Total requests ever recorded (`server.requestCount`).
    pub fn request_count(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Pops the oldest unconsumed request, blocking until one arrives.
    pub async fn take_request(&self) -> RecordedRequest {
        loop {
            if let Some(req) = self.try_take() {
                return req;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Re-check after registering interest to avoid missing a
            // notification that landed between the check above and here.
            if let Some(req) = self.try_take() {
                return req;
            }
            notified.await;
        }
    }

    /// Pops the oldest unconsumed request, waiting at most `timeout`.
    pub async fn take_request_timeout(&self, timeout: Duration) -> Option<RecordedRequest> {
        tokio::select! {
            req = self.take_request() => Some(req),
            _ = tokio::time::sleep(timeout) => None,
        }
    }

    fn try_take(&self) -> Option<RecordedRequest> {
        self.queue.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RecordedRequest;

    #[tokio::test]
    async fn take_request_returns_in_recorded_order() {
        let r = Recorder::new();
        r.record(RecordedRequest::bookkeeping(0, 0, None));
        r.record(RecordedRequest::bookkeeping(0, 1, None));
        assert_eq!(r.take_request().await.exchange_index, 0);
        assert_eq!(r.take_request().await.exchange_index, 1);
        assert_eq!(r.request_count(), 2);
    }

    #[tokio::test]
    async fn take_request_timeout_elapses_when_empty() {
        tokio::time::pause();
        let r = Recorder::new();
        let got = r.take_request_timeout(Duration::from_millis(50)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn take_request_wakes_on_record() {
        let r = std::sync::Arc::new(Recorder::new());
        let r2 = r.clone();
        let handle = tokio::spawn(async move { r2.take_request().await });
        tokio::task::yield_now().await;
        r.record(RecordedRequest::bookkeeping(0, 0, None));
        let got = handle.await.unwrap();
        assert_eq!(got.exchange_index, 0);
    }
}
