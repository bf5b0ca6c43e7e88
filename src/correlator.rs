//! Request/reply correlation.
//!
//! Each `send` gets a generated reply address and a one-shot waiter. The
//! waiter is removed from the map in the same step that delivers to it, so
//! a reply resolves its request at most once. Requests never time out;
//! callers wrap [`ReplyFuture`] in `tokio::time::timeout` if they need to.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CloseReason, RequestError};
use crate::message::{Headers, Message};

/// Successful reply to a `send`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// The reply address the answer was delivered to.
    pub address: String,
    /// Reply payload.
    pub body: Value,
    /// Reply headers.
    pub headers: Headers,
}

pub(crate) type Waiter = oneshot::Sender<Result<Reply, RequestError>>;

/// Future resolving to the outcome of one `send`.
#[derive(Debug)]
pub struct ReplyFuture {
    reply_address: String,
    rx: oneshot::Receiver<Result<Reply, RequestError>>,
}

impl ReplyFuture {
    pub(crate) fn channel(reply_address: String) -> (Waiter, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { reply_address, rx })
    }

    /// The generated reply address this request waits on.
    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }
}

impl Future for ReplyFuture {
    type Output = Result<Reply, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|outcome| {
            outcome.unwrap_or(Err(RequestError::Cancelled(CloseReason::Shutdown)))
        })
    }
}

/// Pending-map size that triggers the first sweep of abandoned waiters.
const PRUNE_THRESHOLD: usize = 64;

/// Pending requests keyed by reply address.
#[derive(Debug)]
pub struct RequestCorrelator {
    pending: HashMap<String, Waiter>,
    /// Sweep abandoned waiters once `pending` grows to this size.
    prune_at: usize,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            prune_at: PRUNE_THRESHOLD,
        }
    }
}

impl RequestCorrelator {
    /// An empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting on `reply_address`.
    ///
    /// Waiters whose [`ReplyFuture`] was dropped are swept whenever the map
    /// doubles past its last swept size, keeping `track` amortised O(1).
    pub(crate) fn track(&mut self, reply_address: String, waiter: Waiter) {
        if self.pending.len() >= self.prune_at {
            self.pending.retain(|_, waiter| !waiter.is_closed());
            self.prune_at = (self.pending.len() * 2).max(PRUNE_THRESHOLD);
        }
        self.pending.insert(reply_address, waiter);
    }

    /// Deliver `message` to its pending request, if it is a reply.
    ///
    /// Returns the message untouched when no live request waits on its
    /// address. A waiter whose [`ReplyFuture`] was dropped is discarded and
    /// the message handed back, so it still reaches handlers.
    pub fn resolve(&mut self, message: Message) -> Option<Message> {
        let Some(address) = message.address() else {
            return Some(message);
        };
        if !matches!(message, Message::Receive { .. } | Message::Error { .. })
            || !self.pending.contains_key(address)
        {
            return Some(message);
        }
        let address = address.to_string();
        let waiter = self.pending.remove(&address)?;
        if waiter.is_closed() {
            log::debug!("[EventBus] Reply for {} arrived after its caller gave up", address);
            return Some(message);
        }
        let outcome = match message {
            Message::Receive { address, body, headers } => Ok(Reply {
                address,
                body,
                headers,
            }),
            other => match other.error_content() {
                Some(content) => Err(RequestError::Failed(content)),
                None => return Some(other),
            },
        };
        if waiter.send(outcome).is_err() {
            log::debug!("[EventBus] Caller for {} went away during delivery", address);
        }
        None
    }

    /// Fail every pending request with `reason`. Returns how many were failed.
    pub fn cancel_all(&mut self, reason: CloseReason) -> usize {
        let count = self.pending.len();
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(RequestError::Cancelled(reason)));
        }
        count
    }

    /// Whether a request waits on `reply_address`.
    pub fn is_pending(&self, reply_address: &str) -> bool {
        self.pending.contains_key(reply_address)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorContent;
    use serde_json::json;

    fn tracked(correlator: &mut RequestCorrelator, address: &str) -> ReplyFuture {
        let (waiter, future) = ReplyFuture::channel(address.to_string());
        correlator.track(address.to_string(), waiter);
        future
    }

    #[tokio::test]
    async fn test_rec_resolves_and_removes() {
        let mut correlator = RequestCorrelator::new();
        let future = tracked(&mut correlator, "R1");

        assert_eq!(correlator.resolve(Message::rec("R1", json!("hi"))), None);
        assert!(!correlator.is_pending("R1"));

        let reply = future.await.unwrap();
        assert_eq!(reply.body, json!("hi"));
        assert_eq!(reply.address, "R1");
    }

    #[tokio::test]
    async fn test_err_fails_request() {
        let mut correlator = RequestCorrelator::new();
        let future = tracked(&mut correlator, "R2");
        let content = ErrorContent::new(404, "NO_HANDLERS", "nobody home");

        assert_eq!(correlator.resolve(Message::error("R2", content.clone())), None);
        assert_eq!(future.await, Err(RequestError::Failed(content)));
    }

    #[test]
    fn test_second_reply_is_not_consumed() {
        let mut correlator = RequestCorrelator::new();
        let _future = tracked(&mut correlator, "R3");

        assert_eq!(correlator.resolve(Message::rec("R3", json!(1))), None);
        let again = Message::rec("R3", json!(2));
        assert_eq!(correlator.resolve(again.clone()), Some(again));
    }

    #[test]
    fn test_unrelated_frames_pass_through() {
        let mut correlator = RequestCorrelator::new();
        let _future = tracked(&mut correlator, "R4");

        let other = Message::rec("news", json!("x"));
        assert_eq!(correlator.resolve(other.clone()), Some(other));
        let publish = Message::publish("R4", json!("not a reply"));
        assert_eq!(correlator.resolve(publish.clone()), Some(publish));
        assert!(correlator.is_pending("R4"));
    }

    #[tokio::test]
    async fn test_cancel_all_rejects_every_waiter() {
        let mut correlator = RequestCorrelator::new();
        let first = tracked(&mut correlator, "A");
        let second = tracked(&mut correlator, "B");

        let reason = CloseReason::AttemptsExhausted { attempts: 3 };
        assert_eq!(correlator.cancel_all(reason), 2);
        assert!(correlator.is_empty());
        assert_eq!(first.await, Err(RequestError::Cancelled(reason)));
        assert_eq!(second.await, Err(RequestError::Cancelled(reason)));
    }

    #[test]
    fn test_abandoned_waiters_are_swept_at_threshold() {
        let mut correlator = RequestCorrelator::new();
        for n in 0..PRUNE_THRESHOLD {
            drop(tracked(&mut correlator, &format!("dropped-{n}")));
        }
        assert_eq!(correlator.len(), PRUNE_THRESHOLD);

        let _kept = tracked(&mut correlator, "kept");
        assert_eq!(correlator.len(), 1);
        assert!(correlator.is_pending("kept"));
    }

    #[test]
    fn test_sweep_threshold_grows_with_live_requests() {
        let mut correlator = RequestCorrelator::new();
        let live: Vec<ReplyFuture> = (0..PRUNE_THRESHOLD)
            .map(|n| tracked(&mut correlator, &format!("live-{n}")))
            .collect();
        // Sweeps here find nothing to drop, so the next one waits for 2x.
        let _one_more = tracked(&mut correlator, "extra");
        assert_eq!(correlator.prune_at, PRUNE_THRESHOLD * 2);
        assert_eq!(correlator.len(), live.len() + 1);
    }

    #[test]
    fn test_late_reply_to_abandoned_request_is_handed_back() {
        let mut correlator = RequestCorrelator::new();
        drop(tracked(&mut correlator, "R5"));

        let late = Message::rec("R5", json!("too late"));
        assert_eq!(correlator.resolve(late.clone()), Some(late));
        assert!(!correlator.is_pending("R5"));

        let failure = Message::error("R5", ErrorContent::new(1, "TIMEOUT", "late"));
        assert_eq!(correlator.resolve(failure.clone()), Some(failure));
    }

    #[tokio::test]
    async fn test_lost_waiter_reads_as_shutdown() {
        let (waiter, future) = ReplyFuture::channel("R".to_string());
        drop(waiter);
        assert_eq!(
            future.await,
            Err(RequestError::Cancelled(CloseReason::Shutdown))
        );
    }
}
