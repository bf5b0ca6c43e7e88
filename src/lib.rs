//! busbridge - event-bus bridge client and mock broker.
//!
//! A long-lived client that talks to a message broker's bridge over a
//! socket-like transport, plus an in-process broker that speaks the same
//! wire protocol for test harnesses.
//!
//! # Architecture
//!
//! - **Codec** - tagged wire frames and their JSON encoding
//! - **Client** - connection state machine with backoff, keepalive pings,
//!   registration replay and request/reply correlation
//! - **Mock broker** - multi-connection counterpart that routes `send` and
//!   `publish` frames to test handlers and broadcasts pushes
//!
//! # Modules
//!
//! - [`message`] - wire protocol
//! - [`client`] - [`EventBus`] handle and its connection task
//! - [`mock`] - [`MockBroker`]
//! - [`transport`] / [`ws`] - transport traits, in-memory and WebSocket
//!   implementations
//! - [`options`] - client and broker configuration
//!
//! # Example
//!
//! ```no_run
//! use busbridge::{ConnectionOptions, EventBus};
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let bus = EventBus::connect_url("ws://localhost:9870/bridge", ConnectionOptions::default())?;
//! bus.register_handler("news", |frame| println!("{frame}"))?;
//! let reply = bus.send("echo", json!("hi"))?.await?;
//! println!("{}", reply.body);
//! bus.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod correlator;
pub mod error;
pub mod id;
pub mod message;
pub mod mock;
pub mod options;
pub mod registry;
pub mod timer;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use client::{BusEvent, BusStats, ConnectionState, EventBus};
pub use correlator::{Reply, ReplyFuture};
pub use error::{BusError, CloseReason, CodecError, RequestError};
pub use message::{ErrorContent, Headers, Message};
pub use mock::{BrokerEvent, ConnectionId, FrameInterceptor, MockBroker, Responder};
pub use options::{ConnectionOptions, ListenOptions, MockBrokerOptions};
pub use registry::HandlerId;
pub use transport::{memory_pair, Connector, Transport};
