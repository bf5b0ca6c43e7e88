//! Event-bus client.
//!
//! [`EventBus`] is a cheap handle onto a background connection task that
//! owns the transport, the channel registry, the pending-request map and
//! both timers. Every handle method is a message to that task, so handler
//! dispatch and registry mutation never race.
//!
//! # Architecture
//!
//! ```text
//!   EventBus (handle)                      connection task
//!         │  register / publish / send           │
//!         │ ───────── mpsc commands ──────────►  │  CONNECTING ─► OPEN
//!         │                                      │      ▲           │
//!         │  state_changes()  ◄── watch ──────── │      └─ backoff ◄┘
//!         │  events()         ◄── broadcast ──── │
//!         ▼                                      ▼
//!   ReplyFuture ◄──────── oneshot ───────── RequestCorrelator
//! ```
//!
//! # Lifecycle
//!
//! - Starts in `Connecting` as soon as it is constructed
//! - Replays every live registration as a `register` frame on each open
//! - Queues `publish`/`send` frames while not open and flushes them after
//!   the replay
//! - Reconnects with jittered exponential backoff until the attempt budget
//!   runs out, then settles in `Closed`
//! - [`EventBus::close`] (or dropping the handle) cancels timers, fails
//!   pending requests and closes the transport

// Rust guideline compliant 2026-02

mod connection;

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::correlator::{ReplyFuture, Waiter};
use crate::error::{BusError, CloseReason, CodecError};
use crate::id;
use crate::message::{ErrorContent, Headers, Message};
use crate::options::ConnectionOptions;
use crate::registry::{Handler, HandlerId};
use crate::transport::Connector;
use crate::ws::WsConnector;

/// Capacity of the lifecycle event channel per subscriber.
const EVENT_CAPACITY: usize = 64;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Opening a transport or waiting to retry.
    Connecting,
    /// Transport open; frames flow.
    Open,
    /// Explicit close in progress.
    Closing,
    /// Terminal. A closed client cannot be reopened.
    Closed,
}

impl ConnectionState {
    /// Whether this is the terminal state.
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        })
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// First successful open.
    Opened,
    /// A later open after a lost connection.
    Reconnected,
    /// The open transport was lost.
    Disconnected,
    /// A reconnect attempt is scheduled.
    ReconnectScheduled {
        /// 1-based attempt number since the last open.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// An `err` frame no request or handler claimed.
    Error {
        /// Address the error was sent to, if any.
        address: Option<String>,
        /// The failure itself.
        error: ErrorContent,
    },
    /// The client reached `Closed`.
    Closed(CloseReason),
}

/// Traffic and retry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStats {
    /// Frames written to the transport, pings included.
    pub sent: u64,
    /// Frames read from the transport, undecodable ones included.
    pub received: u64,
    /// Consecutive failed opens since the last successful one.
    pub reconnect_attempts: u32,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    reconnect_attempts: AtomicU32,
}

/// Requests from the handle to the connection task.
enum Command {
    Register {
        address: String,
        id: HandlerId,
        handler: Handler,
        headers: Headers,
    },
    Unregister {
        address: String,
        id: HandlerId,
    },
    Publish(Message),
    Send {
        frame: Message,
        reply_address: String,
        waiter: Waiter,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to a bridge connection.
///
/// Dropping the handle shuts the connection down as if
/// [`close`](Self::close) had been called.
#[derive(Debug)]
pub struct EventBus {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<BusEvent>,
    counters: Arc<Counters>,
    next_handler_id: AtomicU64,
    options: ConnectionOptions,
}

impl EventBus {
    /// Start a client over `connector`.
    ///
    /// Spawns the connection task on the current Tokio runtime and returns
    /// immediately in the `Connecting` state.
    pub fn connect<C>(connector: C, options: ConnectionOptions) -> Result<Self, BusError>
    where
        C: Connector + 'static,
    {
        options.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let counters = Arc::new(Counters::default());

        let connection = connection::Connection::new(
            Arc::new(connector),
            options.clone(),
            commands_rx,
            state_tx,
            events_tx.clone(),
            Arc::clone(&counters),
        );
        tokio::spawn(connection.run());

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
            counters,
            next_handler_id: AtomicU64::new(1),
            options,
        })
    }

    /// Start a client for the WebSocket bridge at `url`.
    pub fn connect_url(url: &str, options: ConnectionOptions) -> Result<Self, BusError> {
        Self::connect(WsConnector::new(url), options)
    }

    /// Register `handler` for frames delivered to `address`.
    ///
    /// Only the first handler of an address puts a `register` frame on the
    /// wire.
    pub fn register_handler<F>(
        &self,
        address: impl Into<String>,
        handler: F,
    ) -> Result<HandlerId, BusError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register_handler_with_headers(address, Headers::new(), handler)
    }

    /// [`register_handler`](Self::register_handler) with headers for the
    /// `register` frame.
    pub fn register_handler_with_headers<F>(
        &self,
        address: impl Into<String>,
        headers: Headers,
        handler: F,
    ) -> Result<HandlerId, BusError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let address = non_empty(address.into(), "register")?;
        let id = HandlerId::new(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.command(Command::Register {
            address,
            id,
            handler: Arc::new(handler),
            headers,
        })?;
        Ok(id)
    }

    /// Remove a handler. Removing the last one for an address puts an
    /// `unregister` frame on the wire.
    pub fn unregister_handler(
        &self,
        address: impl Into<String>,
        id: HandlerId,
    ) -> Result<(), BusError> {
        self.command(Command::Unregister {
            address: address.into(),
            id,
        })
    }

    /// Fire-and-forget `publish`.
    pub fn publish(&self, address: impl Into<String>, body: Value) -> Result<(), BusError> {
        self.publish_with_headers(address, body, Headers::new())
    }

    /// [`publish`](Self::publish) with frame headers.
    pub fn publish_with_headers(
        &self,
        address: impl Into<String>,
        body: Value,
        headers: Headers,
    ) -> Result<(), BusError> {
        let address = non_empty(address.into(), "publish")?;
        self.command(Command::Publish(
            Message::publish(address, body).with_headers(headers),
        ))
    }

    /// Request/reply `send`.
    ///
    /// The returned future resolves with the reply, a failure reply, or a
    /// cancellation once the client closes for good. There is no timeout.
    pub fn send(&self, address: impl Into<String>, body: Value) -> Result<ReplyFuture, BusError> {
        self.send_with_headers(address, body, Headers::new())
    }

    /// [`send`](Self::send) with frame headers.
    pub fn send_with_headers(
        &self,
        address: impl Into<String>,
        body: Value,
        headers: Headers,
    ) -> Result<ReplyFuture, BusError> {
        let address = non_empty(address.into(), "send")?;
        let reply_address = id::reply_address();
        let frame = Message::send(address, body, Some(reply_address.clone())).with_headers(headers);
        let (waiter, future) = ReplyFuture::channel(reply_address.clone());
        self.command(Command::Send {
            frame,
            reply_address,
            waiter,
        })?;
        Ok(future)
    }

    /// Close the connection and wait until it is `Closed`.
    ///
    /// Idempotent; returns immediately if the client is already closed.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close { ack }).is_ok() {
            let _ = done.await;
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the client reaches `target`.
    ///
    /// Fails with [`BusError::Closed`] if the client closes first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), BusError> {
        let mut states = self.state.clone();
        let reached = states
            .wait_for(|state| *state == target || state.is_closed())
            .await
            .map(|state| *state)
            .unwrap_or(ConnectionState::Closed);
        if reached == target {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }

    /// Subscribe to lifecycle events from now on.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            reconnect_attempts: self.counters.reconnect_attempts.load(Ordering::Relaxed),
        }
    }

    /// Options this client was built with.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn command(&self, command: Command) -> Result<(), BusError> {
        self.commands.send(command).map_err(|_unsent| BusError::Closed)
    }
}

fn non_empty(address: String, kind: &'static str) -> Result<String, BusError> {
    if address.is_empty() {
        Err(CodecError::EmptyAddress(kind).into())
    } else {
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "CONNECTING");
        assert_eq!(ConnectionState::Closed.to_string(), "CLOSED");
        assert!(ConnectionState::Closed.is_closed());
        assert!(!ConnectionState::Closing.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let options = ConnectionOptions {
            delay_min: 10,
            delay_max: 1,
            ..ConnectionOptions::default()
        };
        let result = EventBus::connect_url("ws://127.0.0.1:1/bridge", options);
        assert!(matches!(result, Err(BusError::InvalidOptions(_))));
    }

    #[tokio::test]
    async fn test_empty_address_rejected_without_traffic() {
        let bus =
            EventBus::connect_url("ws://127.0.0.1:1/bridge", ConnectionOptions::default()).unwrap();
        assert!(matches!(
            bus.publish("", Value::Null),
            Err(BusError::Codec(CodecError::EmptyAddress("publish")))
        ));
        assert!(bus.send("", Value::Null).is_err());
        assert!(bus.register_handler("", |_| {}).is_err());
        bus.close().await;
    }

    #[tokio::test]
    async fn test_commands_after_close_fail() {
        let bus =
            EventBus::connect_url("ws://127.0.0.1:1/bridge", ConnectionOptions::default()).unwrap();
        bus.close().await;
        assert_eq!(bus.state(), ConnectionState::Closed);
        assert!(matches!(bus.publish("a", Value::Null), Err(BusError::Closed)));
        assert!(matches!(bus.send("a", Value::Null), Err(BusError::Closed)));
        bus.close().await;
    }
}
