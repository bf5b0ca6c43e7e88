//! Protocol-compatible mock broker for test harnesses.
//!
//! The broker accepts any number of concurrent connections, either
//! in-process through [`MockBroker::accept`] or over WebSocket through
//! [`MockBroker::listen`], and routes what clients send:
//!
//! - `send` goes to every send handler registered on the address; their
//!   [`Responder`] replies only to the originating connection
//! - `publish` goes to every publish handler on the address
//! - `rec` and `err` from a client are protocol violations, logged and
//!   dropped
//!
//! [`MockBroker::send`] and [`MockBroker::send_error`] broadcast to every
//! open connection. The broker does not track per-address subscribers.
//!
//! A test that needs custom handling for some frames, `register` for
//! instance, installs a [`FrameInterceptor`] with
//! [`MockBroker::set_interceptor`]. It sees each decoded frame before
//! routing and consumes it by returning `true`.
//!
//! # Concurrency
//!
//! Each connection runs in its own task, draining an outbound queue into
//! the transport. The connection set and both handler tables sit behind
//! mutexes that are never held while a handler runs or a frame is written.

// Rust guideline compliant 2026-02

mod handlers;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub use handlers::{PublishHandler, PublishHandlerId, SendHandler, SendHandlerId};

use crate::error::BusError;
use crate::message::{self, ErrorContent, Message};
use crate::options::{ListenOptions, MockBrokerOptions};
use crate::registry::panic_message;
use crate::transport::Transport;
use crate::ws;
use handlers::HandlerTable;

/// Sees every decoded frame before routing. Returning `true` consumes it.
pub type FrameInterceptor = Arc<dyn Fn(ConnectionId, &Message) -> bool + Send + Sync>;

/// Capacity of the broker event channel per subscriber.
const EVENT_CAPACITY: usize = 256;

/// Identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Things that happen on the broker, for tests to observe.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// A connection was accepted.
    Connected(ConnectionId),
    /// A connection ended.
    Disconnected(ConnectionId),
    /// A frame was decoded from a connection.
    Frame {
        /// Origin of the frame.
        connection: ConnectionId,
        /// The decoded frame.
        message: Message,
    },
}

/// Answers one `send` frame on the connection it came from.
///
/// Cloneable, so a handler may keep it and reply later.
#[derive(Debug, Clone)]
pub struct Responder {
    connection: ConnectionId,
    address: String,
    reply_address: Option<String>,
    outbound: mpsc::WeakUnboundedSender<String>,
}

impl Responder {
    /// Reply with a `rec` frame. Returns whether it was queued.
    ///
    /// Logged as a no-op when the request carried no reply address or its
    /// connection has gone.
    pub fn respond(&self, body: Value) -> bool {
        self.reply(|reply_address| Message::rec(reply_address, body))
    }

    /// Reply with an `err` frame.
    pub fn fail(&self, content: ErrorContent) -> bool {
        self.reply(|reply_address| Message::error(reply_address, content))
    }

    /// The connection the request came from.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// The address the request was sent to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The request's reply address, if it had one.
    pub fn reply_address(&self) -> Option<&str> {
        self.reply_address.as_deref()
    }

    fn reply(&self, build: impl FnOnce(String) -> Message) -> bool {
        let Some(reply_address) = &self.reply_address else {
            log::warn!(
                "[MockBroker] Reply address for 'send' message on channel {} is not available",
                self.address
            );
            return false;
        };
        let frame = build(reply_address.clone());
        let text = match message::encode(&frame) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("[MockBroker] Cannot encode reply: {}", e);
                return false;
            }
        };
        let Some(outbound) = self.outbound.upgrade() else {
            log::debug!(
                "[MockBroker] Connection {} closed before reply to {}",
                self.connection,
                reply_address
            );
            return false;
        };
        log::debug!("[MockBroker] <--- {} to {}", frame, self.connection);
        outbound.send(text).is_ok()
    }
}

#[derive(Default)]
struct ConnectionSet {
    /// Outbound queues of open connections. Removing an entry closes the
    /// connection.
    open: HashMap<ConnectionId, mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
    closed: bool,
}

struct BrokerInner {
    options: MockBrokerOptions,
    connections: Mutex<ConnectionSet>,
    send_handlers: Mutex<HandlerTable<SendHandler>>,
    publish_handlers: Mutex<HandlerTable<PublishHandler>>,
    interceptor: Mutex<Option<FrameInterceptor>>,
    next_connection: AtomicU64,
    events: broadcast::Sender<BrokerEvent>,
}

/// In-process bridge broker. Clones share the same broker.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

impl fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (connections, closed) = {
            let set = lock(&self.inner.connections);
            (set.open.len(), set.closed)
        };
        f.debug_struct("MockBroker")
            .field("prefix", &self.inner.options.prefix)
            .field("connections", &connections)
            .field("send_handlers", &lock(&self.inner.send_handlers).len())
            .field("publish_handlers", &lock(&self.inner.publish_handlers).len())
            .field("closed", &closed)
            .finish_non_exhaustive()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new(MockBrokerOptions::default())
    }
}

impl MockBroker {
    /// A broker with no connections and no handlers.
    pub fn new(options: MockBrokerOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(BrokerInner {
                options,
                connections: Mutex::new(ConnectionSet::default()),
                send_handlers: Mutex::new(HandlerTable::default()),
                publish_handlers: Mutex::new(HandlerTable::default()),
                interceptor: Mutex::new(None),
                next_connection: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Broker settings.
    pub fn options(&self) -> &MockBrokerOptions {
        &self.inner.options
    }

    /// Handle `send` frames on `address`.
    pub fn handle_send<F>(&self, address: impl Into<String>, handler: F) -> SendHandlerId
    where
        F: Fn(&Value, &Responder) + Send + Sync + 'static,
    {
        SendHandlerId(lock(&self.inner.send_handlers).insert(address.into(), Arc::new(handler)))
    }

    /// Remove a send handler. Other ids stay valid.
    pub fn remove_send_handler(&self, id: SendHandlerId) -> bool {
        lock(&self.inner.send_handlers).remove(id.0)
    }

    /// Handle `publish` frames on `address`.
    pub fn handle_publish<F>(&self, address: impl Into<String>, handler: F) -> PublishHandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = lock(&self.inner.publish_handlers).insert(address.into(), Arc::new(handler));
        PublishHandlerId(id)
    }

    /// Remove a publish handler. Other ids stay valid.
    pub fn remove_publish_handler(&self, id: PublishHandlerId) -> bool {
        lock(&self.inner.publish_handlers).remove(id.0)
    }

    /// Install `interceptor`, replacing any previous one.
    pub fn set_interceptor<F>(&self, interceptor: F)
    where
        F: Fn(ConnectionId, &Message) -> bool + Send + Sync + 'static,
    {
        *lock(&self.inner.interceptor) = Some(Arc::new(interceptor));
    }

    /// Remove the interceptor. Returns whether one was installed.
    pub fn clear_interceptor(&self) -> bool {
        lock(&self.inner.interceptor).take().is_some()
    }

    /// Serve an already-open transport as a new connection.
    ///
    /// Must be called within a Tokio runtime.
    pub fn accept(&self, transport: Transport) -> Result<ConnectionId, BusError> {
        let id = ConnectionId(self.inner.next_connection.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let weak_outbound = outbound_tx.downgrade();

        let mut set = lock(&self.inner.connections);
        if set.closed {
            return Err(broker_closed());
        }
        set.open.insert(id, outbound_tx);
        set.tasks.retain(|task| !task.is_finished());
        self.inner.emit(BrokerEvent::Connected(id));
        let task = tokio::spawn(serve_connection(
            Arc::clone(&self.inner),
            id,
            transport,
            weak_outbound,
            outbound_rx,
        ));
        set.tasks.push(task);
        drop(set);

        log::info!("[MockBroker] Connection {} opened", id);
        Ok(id)
    }

    /// Serve the bridge over WebSocket under the configured prefix.
    ///
    /// Returns the bound address; port `0` picks a free one.
    pub async fn listen(&self, listen: &ListenOptions) -> Result<SocketAddr, BusError> {
        if self.is_closed() {
            return Err(broker_closed());
        }
        let listener = TcpListener::bind((listen.hostname.as_str(), listen.port)).await?;
        let local = listener.local_addr()?;

        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(&self.inner)));
        let mut set = lock(&self.inner.connections);
        if set.closed {
            task.abort();
            return Err(broker_closed());
        }
        set.listeners.push(task);
        drop(set);

        log::info!(
            "[MockBroker] Listening on ws://{}{}",
            local,
            self.inner.options.prefix
        );
        Ok(local)
    }

    /// Broadcast `message` to every open connection.
    ///
    /// Returns how many connections it was queued on.
    pub fn push(&self, message: &Message) -> Result<usize, BusError> {
        let text = message::encode(message)?;
        let set = lock(&self.inner.connections);
        let delivered = set
            .open
            .values()
            .filter(|outbound| outbound.send(text.clone()).is_ok())
            .count();
        drop(set);
        log::debug!("[MockBroker] <--- {} to {} connections", message, delivered);
        Ok(delivered)
    }

    /// Queue `message` on one connection only.
    ///
    /// Returns `false` if the connection is not open.
    pub fn push_to(&self, connection: ConnectionId, message: &Message) -> Result<bool, BusError> {
        let text = message::encode(message)?;
        let queued = lock(&self.inner.connections)
            .open
            .get(&connection)
            .is_some_and(|outbound| outbound.send(text).is_ok());
        if queued {
            log::debug!("[MockBroker] <--- {} to {}", message, connection);
        }
        Ok(queued)
    }

    /// Broadcast a `rec` frame.
    pub fn send(&self, address: impl Into<String>, body: Value) -> Result<usize, BusError> {
        self.push(&Message::rec(address, body))
    }

    /// Broadcast an `err` frame.
    pub fn send_error(
        &self,
        address: impl Into<String>,
        content: ErrorContent,
    ) -> Result<usize, BusError> {
        self.push(&Message::error(address, content))
    }

    /// Ids of the open connections, oldest first.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> =
            lock(&self.inner.connections).open.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).open.len()
    }

    /// Close one connection. It leaves the broadcast set immediately.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = lock(&self.inner.connections).open.remove(&id).is_some();
        if removed {
            log::info!("[MockBroker] Disconnecting {}", id);
        }
        removed
    }

    /// Subscribe to broker events from now on.
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.connections).closed
    }

    /// Stop listening, close every connection and wait for each one to
    /// finish. Later `accept`/`listen` calls fail.
    pub async fn close(&self) {
        let (listeners, tasks) = {
            let mut set = lock(&self.inner.connections);
            set.closed = true;
            set.open.clear();
            (
                std::mem::take(&mut set.listeners),
                std::mem::take(&mut set.tasks),
            )
        };

        for listener in listeners {
            listener.abort();
        }
        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("[MockBroker] Connection task failed: {}", e);
            }
        }
        log::info!("[MockBroker] Closed after draining {} connection tasks", count);
    }
}

impl BrokerInner {
    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }

    fn handle_frame(
        &self,
        connection: ConnectionId,
        text: &str,
        outbound: &mpsc::WeakUnboundedSender<String>,
    ) {
        let frame = match message::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!(
                    "[MockBroker] Connection {}: discarding frame ({}): {}",
                    connection,
                    e,
                    message::preview(text)
                );
                return;
            }
        };
        log::debug!("[MockBroker] ---> {} from {}", frame, connection);
        self.emit(BrokerEvent::Frame {
            connection,
            message: frame.clone(),
        });
        if self.intercepted(connection, &frame) {
            log::debug!(
                "[MockBroker] {} from {} consumed by interceptor",
                frame.kind(),
                connection
            );
            return;
        }

        match frame {
            Message::Send {
                address,
                body,
                reply_address,
                ..
            } => {
                let handlers = lock(&self.send_handlers).matching(&address);
                if handlers.is_empty() {
                    log::debug!("[MockBroker] No send handler for {}", address);
                    return;
                }
                let responder = Responder {
                    connection,
                    address,
                    reply_address,
                    outbound: outbound.clone(),
                };
                for handler in handlers {
                    isolate(&responder.address, || handler(&body, &responder));
                }
            }
            Message::Publish { address, body, .. } => {
                let handlers = lock(&self.publish_handlers).matching(&address);
                for handler in handlers {
                    isolate(&address, || handler(&body));
                }
            }
            Message::Receive { address, .. } => log::warn!(
                "[MockBroker] Connection {} sent a 'rec' frame for {}; rec is broker-to-client only, dropped",
                connection,
                address
            ),
            Message::Error { address, .. } => log::warn!(
                "[MockBroker] Connection {} sent an 'err' frame for {}; dropped",
                connection,
                address.as_deref().unwrap_or("-")
            ),
            Message::Ping => log::trace!("[MockBroker] Ping from {}", connection),
            Message::Register { address, .. } => {
                log::debug!("[MockBroker] {} registered {}", connection, address);
            }
            Message::Unregister { address, .. } => {
                log::debug!("[MockBroker] {} unregistered {}", connection, address);
            }
        }
    }

    fn intercepted(&self, connection: ConnectionId, frame: &Message) -> bool {
        let Some(interceptor) = lock(&self.interceptor).clone() else {
            return false;
        };
        catch_unwind(AssertUnwindSafe(|| interceptor(connection, frame))).unwrap_or_else(
            |panic_info| {
                log::error!(
                    "[MockBroker] Interceptor panicked on {}: {}",
                    frame.kind(),
                    panic_message(panic_info.as_ref())
                );
                false
            },
        )
    }

    /// Drop a finished connection from the set.
    fn forget(&self, connection: ConnectionId) {
        lock(&self.connections).open.remove(&connection);
    }
}

/// Pump one connection until either side closes it.
async fn serve_connection(
    inner: Arc<BrokerInner>,
    id: ConnectionId,
    transport: Transport,
    weak_outbound: mpsc::WeakUnboundedSender<String>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let Transport {
        mut writer,
        mut reader,
    } = transport;

    loop {
        tokio::select! {
            frame = reader.recv() => match frame {
                Some(Ok(text)) => inner.handle_frame(id, &text, &weak_outbound),
                Some(Err(e)) => {
                    log::warn!("[MockBroker] Connection {} read error: {:#}", id, e);
                    break;
                }
                None => break,
            },
            queued = outbound.recv() => match queued {
                Some(text) => {
                    if let Err(e) = writer.send(text).await {
                        log::warn!("[MockBroker] Connection {} write error: {:#}", id, e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    inner.forget(id);
    if let Err(e) = writer.close().await {
        log::debug!("[MockBroker] Connection {} close: {:#}", id, e);
    }
    log::info!("[MockBroker] Connection {} closed", id);
    inner.emit(BrokerEvent::Disconnected(id));
}

async fn accept_loop(listener: TcpListener, broker: Weak<BrokerInner>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("[MockBroker] Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let Some(prefix) = broker.upgrade().map(|inner| inner.options.prefix.clone()) else {
            return;
        };
        let broker = broker.clone();
        tokio::spawn(async move {
            let transport = match ws::accept(stream, &prefix).await {
                Ok(transport) => transport,
                Err(e) => {
                    log::debug!("[MockBroker] Handshake with {} failed: {:#}", peer, e);
                    return;
                }
            };
            let Some(inner) = broker.upgrade() else {
                return;
            };
            if let Err(e) = (MockBroker { inner }).accept(transport) {
                log::debug!("[MockBroker] Refused {}: {}", peer, e);
            }
        });
    }
}

fn isolate(address: &str, call: impl FnOnce()) {
    if let Err(panic_info) = catch_unwind(AssertUnwindSafe(call)) {
        log::error!(
            "[MockBroker] Handler for {} panicked: {}",
            address,
            panic_message(panic_info.as_ref())
        );
    }
}

fn broker_closed() -> BusError {
    BusError::Broker("broker is closed".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn next_text(transport: &mut Transport) -> String {
        transport.reader.recv().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_echo_replies_to_origin() {
        let broker = MockBroker::default();
        broker.handle_send("echo", |body, responder| {
            responder.respond(body.clone());
        });
        let (mut client, server) = memory_pair();
        broker.accept(server).unwrap();

        client
            .writer
            .send(r#"{"type":"send","address":"echo","body":"hi","headers":{},"replyAddress":"R1"}"#.into())
            .await
            .unwrap();
        assert_eq!(
            next_text(&mut client).await,
            r#"{"type":"rec","address":"R1","body":"hi","headers":{}}"#
        );
        broker.close().await;
    }

    async fn wait_disconnected(events: &mut broadcast::Receiver<BrokerEvent>, id: ConnectionId) {
        loop {
            if events.recv().await.unwrap() == BrokerEvent::Disconnected(id) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_respond_without_reply_address_is_noop() {
        let broker = MockBroker::default();
        let outcome = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&outcome);
        broker.handle_send("echo", move |body, responder| {
            *seen.lock().unwrap() = Some(responder.respond(body.clone()));
        });
        let mut events = broker.events();
        let (mut client, server) = memory_pair();
        let id = broker.accept(server).unwrap();

        client
            .writer
            .send(r#"{"type":"send","address":"echo","body":1}"#.into())
            .await
            .unwrap();
        client.writer.close().await.unwrap();
        wait_disconnected(&mut events, id).await;

        assert_eq!(*outcome.lock().unwrap(), Some(false));
        assert!(client.reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_others() {
        let broker = MockBroker::default();
        let calls = Arc::new(AtomicUsize::new(0));
        broker.handle_publish("news", |_| panic!("boom"));
        let counter = Arc::clone(&calls);
        broker.handle_publish("news", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut events = broker.events();
        let (mut client, server) = memory_pair();
        let id = broker.accept(server).unwrap();

        client
            .writer
            .send(message::encode(&Message::publish("news", json!(1))).unwrap())
            .await
            .unwrap();
        client.writer.close().await.unwrap();
        wait_disconnected(&mut events, id).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_accept_after_close_fails() {
        let broker = MockBroker::default();
        broker.close().await;
        let (_client, server) = memory_pair();
        assert!(matches!(broker.accept(server), Err(BusError::Broker(_))));
        assert!(broker.listen(&ListenOptions::loopback()).await.is_err());
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "#7");
    }
}
