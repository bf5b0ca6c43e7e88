//! Channel registry: address → ordered handlers.
//!
//! Wire traffic is reference counted. The first handler for an address
//! yields a `register` frame and removing the last one yields an
//! `unregister` frame; every other change is local. The registry itself is
//! not synchronised. It lives inside the client's connection task and is
//! only mutated between dispatch turns.

// Rust guideline compliant 2026-02

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::message::{Headers, Message};

/// A handler invoked for every `rec`/`err` frame delivered to its address.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Stable identity of one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw counter value.
    pub fn get(self) -> u64 {
        self.0
    }
}

struct Subscription {
    headers: Headers,
    handlers: Vec<(HandlerId, Handler)>,
}

/// Handlers per channel address.
#[derive(Default)]
pub struct ChannelRegistry {
    subscriptions: BTreeMap<String, Subscription>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .subscriptions
            .iter()
            .map(|(address, sub)| (address.as_str(), sub.handlers.len()))
            .collect();
        f.debug_struct("ChannelRegistry")
            .field("subscriptions", &counts)
            .finish()
    }
}

impl ChannelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to `address`.
    ///
    /// Returns the `register` frame to transmit when this is the address's
    /// first handler. `headers` are remembered for replay and only apply to
    /// the first registration.
    pub fn register(
        &mut self,
        address: &str,
        id: HandlerId,
        handler: Handler,
        headers: Headers,
    ) -> Option<Message> {
        if let Some(subscription) = self.subscriptions.get_mut(address) {
            subscription.handlers.push((id, handler));
            return None;
        }
        let frame = Message::register(address).with_headers(headers.clone());
        self.subscriptions.insert(
            address.to_string(),
            Subscription {
                headers,
                handlers: vec![(id, handler)],
            },
        );
        Some(frame)
    }

    /// Remove one handler from `address`.
    ///
    /// Returns the `unregister` frame to transmit when the last handler
    /// went away. Unknown ids are ignored.
    pub fn unregister(&mut self, address: &str, id: HandlerId) -> Option<Message> {
        let subscription = self.subscriptions.get_mut(address)?;
        let before = subscription.handlers.len();
        subscription.handlers.retain(|(handler_id, _)| *handler_id != id);
        if subscription.handlers.len() == before {
            log::debug!("[EventBus] No handler {:?} registered on {}", id, address);
            return None;
        }
        if !subscription.handlers.is_empty() {
            return None;
        }
        self.subscriptions.remove(address);
        Some(Message::unregister(address))
    }

    /// Snapshot of the handlers for `address`, in registration order.
    pub fn handlers(&self, address: &str) -> Vec<Handler> {
        self.subscriptions
            .get(address)
            .map(|sub| sub.handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// One `register` frame per live address, for replay after (re)connect.
    pub fn replay_frames(&self) -> Vec<Message> {
        self.subscriptions
            .iter()
            .map(|(address, sub)| {
                Message::register(address.as_str()).with_headers(sub.headers.clone())
            })
            .collect()
    }

    /// Number of handlers registered on `address`.
    pub fn handler_count(&self, address: &str) -> usize {
        self.subscriptions
            .get(address)
            .map_or(0, |sub| sub.handlers.len())
    }

    /// Number of live addresses.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether no address has a handler.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// Invoke every handler with `message`, isolating panics.
///
/// A panicking handler is logged and skipped; the remaining handlers still
/// run. Returns how many handlers panicked.
pub fn dispatch(handlers: &[Handler], message: &Message) -> usize {
    let mut failures = 0;
    for handler in handlers {
        if let Err(panic_info) = catch_unwind(AssertUnwindSafe(|| handler(message))) {
            failures += 1;
            log::error!(
                "[EventBus] Handler for {} panicked: {}",
                message.address().unwrap_or("-"),
                panic_message(panic_info.as_ref())
            );
        }
    }
    failures
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn noop() -> Handler {
        Arc::new(|_: &Message| {})
    }

    #[test]
    fn test_first_registration_emits_register() {
        let mut registry = ChannelRegistry::new();
        let frame = registry.register("channel:test", HandlerId::new(1), noop(), Headers::new());
        assert_eq!(frame, Some(Message::register("channel:test")));
        assert_eq!(registry.handler_count("channel:test"), 1);
    }

    #[test]
    fn test_k_handlers_one_register_one_unregister() {
        let mut registry = ChannelRegistry::new();
        let frames: Vec<Message> = (1..=4)
            .filter_map(|n| registry.register("a", HandlerId::new(n), noop(), Headers::new()))
            .collect();
        assert_eq!(frames, vec![Message::register("a")]);

        for n in 1..=3 {
            assert_eq!(registry.unregister("a", HandlerId::new(n)), None);
        }
        assert_eq!(
            registry.unregister("a", HandlerId::new(4)),
            Some(Message::unregister("a"))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_two_handlers_one_unregistration_is_silent() {
        let mut registry = ChannelRegistry::new();
        registry.register("channel:test", HandlerId::new(1), noop(), Headers::new());
        assert_eq!(
            registry.register("channel:test", HandlerId::new(2), noop(), Headers::new()),
            None
        );
        assert_eq!(registry.unregister("channel:test", HandlerId::new(1)), None);
        assert_eq!(registry.handler_count("channel:test"), 1);
    }

    #[test]
    fn test_unknown_handler_is_ignored() {
        let mut registry = ChannelRegistry::new();
        registry.register("a", HandlerId::new(1), noop(), Headers::new());
        assert_eq!(registry.unregister("a", HandlerId::new(99)), None);
        assert_eq!(registry.unregister("missing", HandlerId::new(1)), None);
        assert_eq!(registry.handler_count("a"), 1);
    }

    #[test]
    fn test_replay_covers_live_addresses_only() {
        let mut registry = ChannelRegistry::new();
        let mut headers = Headers::new();
        headers.insert("token".into(), json!("t"));
        registry.register("b", HandlerId::new(1), noop(), Headers::new());
        registry.register("a", HandlerId::new(2), noop(), headers.clone());
        registry.register("a", HandlerId::new(3), noop(), Headers::new());
        registry.register("gone", HandlerId::new(4), noop(), Headers::new());
        registry.unregister("gone", HandlerId::new(4));

        assert_eq!(
            registry.replay_frames(),
            vec![
                Message::register("a").with_headers(headers),
                Message::register("b"),
            ]
        );
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let mut registry = ChannelRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 1..=3 {
            let seen = Arc::clone(&seen);
            registry.register(
                "a",
                HandlerId::new(n),
                Arc::new(move |_: &Message| seen.lock().unwrap().push(n)),
                Headers::new(),
            );
        }
        dispatch(&registry.handlers("a"), &Message::rec("a", json!(1)));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handlers: Vec<Handler> = vec![
            Arc::new(|_: &Message| panic!("handler exploded")),
            Arc::new(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ];
        let failures = dispatch(&handlers, &Message::rec("a", json!("x")));
        assert_eq!(failures, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
