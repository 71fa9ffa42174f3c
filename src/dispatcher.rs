//! The dispatcher contract (spec.md §4.8, C8): a strategy for selecting a
//! `MockResponse` per request, plus the default FIFO queue implementation.
//!
//! Grounded in the teacher's `proto::dispatch`/`proto::h1::dispatch`
//! split between "a `Dispatch` trait the connection drives" and "the
//! concrete `Server`/`Client` implementations of it" — mockwire's
//! `Dispatcher` trait plays the same role, generalized to scripted
//! responses instead of a user `Service`.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::request::RecordedRequest;
use crate::response::MockResponse;

/// Strategy for turning a captured request into a scripted response.
///
/// `dispatch` may block (e.g. a hand-written dispatcher that wants to
/// inspect several requests before deciding); `peek` must not, since the
/// exchange engine calls it before the request body is even read, to learn
/// `in_tunnel` / `on_request_start` / `informational_responses` ahead of
/// time (spec.md §4.8, §9 "Informational responses before body").
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, request: &RecordedRequest) -> MockResponse;

    /// Non-consuming look at the response that would currently be returned
    /// by `dispatch`. A dispatcher that cannot predict the next response
    /// (e.g. one keyed off request content) returns `keep_open_sentinel()`.
    fn peek(&self) -> MockResponse;

    /// Called exactly once, at server shutdown.
    fn close(&self) {}
}

/// A response with no pre-read commitments: not in-tunnel, no
/// `onRequestStart` effect, no informational responses. Used by `peek()`
/// implementations that cannot predict ahead of time.
pub fn keep_open_sentinel() -> MockResponse {
    MockResponse::builder().code(200).build()
}

/// The default dispatcher: a FIFO queue of enqueued responses.
///
/// When the queue is empty at `dispatch` time, returns `fallback` rather
/// than blocking (spec.md §9's pragmatic open-question resolution);
/// default fallback is a bare `503` with no body.
pub struct QueueDispatcher {
    queue: Mutex<VecDeque<MockResponse>>,
    fallback: MockResponse,
}

impl Default for QueueDispatcher {
    fn default() -> Self {
        QueueDispatcher::new()
    }
}

impl QueueDispatcher {
    pub fn new() -> QueueDispatcher {
        QueueDispatcher {
            queue: Mutex::new(VecDeque::new()),
            fallback: MockResponse::builder().code(503).build(),
        }
    }

    pub fn with_fallback(fallback: MockResponse) -> QueueDispatcher {
        QueueDispatcher {
            queue: Mutex::new(VecDeque::new()),
            fallback,
        }
    }

    pub fn enqueue(&self, response: MockResponse) {
        self.queue.lock().unwrap().push_back(response);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, _request: &RecordedRequest) -> MockResponse {
        let mut queue = self.queue.lock().unwrap();
        queue.pop_front().unwrap_or_else(|| self.fallback.clone())
    }

    fn peek(&self) -> MockResponse {
        let queue = self.queue.lock().unwrap();
        queue.front().cloned().unwrap_or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_request() -> RecordedRequest {
        RecordedRequest::bookkeeping(0, 0, None)
    }

    #[test]
    fn fifo_consumption_order() {
        let d = QueueDispatcher::new();
        d.enqueue(MockResponse::builder().code(200).build());
        d.enqueue(MockResponse::builder().code(201).build());
        assert_eq!(d.dispatch(&dummy_request()).code(), 200);
        assert_eq!(d.dispatch(&dummy_request()).code(), 201);
    }

    #[test]
    fn empty_queue_returns_fallback() {
        let d = QueueDispatcher::new();
        assert_eq!(d.dispatch(&dummy_request()).code(), 503);
    }

    #[test]
    fn peek_does_not_consume() {
        let d = QueueDispatcher::new();
        d.enqueue(MockResponse::builder().code(200).in_tunnel().build());
        assert!(d.peek().in_tunnel);
        assert!(d.peek().in_tunnel);
        assert_eq!(d.len(), 1);
    }
}
