//! The connection task behind [`EventBus`](super::EventBus).
//!
//! One task per client owns everything mutable: transport, registry,
//! pending requests, outbox and timers. It alternates between three
//! phases, all driven by `tokio::select!` so commands are served in every
//! one of them:
//!
//! - opening a transport (`CONNECTING`)
//! - waiting out the reconnect backoff (still `CONNECTING`)
//! - the open message loop (`OPEN`), with the ping ticker running
//!
//! The ping ticker only runs inside the open loop and the reconnect timer
//! only outside it, so at most one of them is ever live.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::{BusEvent, Command, ConnectionState, Counters};
use crate::backoff;
use crate::correlator::RequestCorrelator;
use crate::error::{CloseReason, RequestError};
use crate::message::{self, Message};
use crate::options::ConnectionOptions;
use crate::registry::{self, ChannelRegistry};
use crate::timer::{PingTimer, ReconnectTimer};
use crate::transport::{Connector, FrameReader, FrameWriter, Transport};

/// What the caller should do after applying a command.
enum Flow {
    Continue,
    /// An explicit close was requested.
    Close,
    /// Writing to the transport failed.
    Disconnected,
}

enum ConnectOutcome {
    Opened(Transport),
    Failed,
    Closed(CloseReason),
}

/// Result of the open message loop.
enum OpenExit {
    /// Transport lost; the reconnect decision comes next.
    Disconnected,
    /// Close requested while open.
    Closed(CloseReason),
}

pub(super) struct Connection {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<BusEvent>,
    counters: Arc<Counters>,
    registry: ChannelRegistry,
    correlator: RequestCorrelator,
    /// `publish`/`send` frames issued while not open, in order.
    outbox: VecDeque<Message>,
    reconnect: ReconnectTimer,
    ping: PingTimer,
    /// Consecutive failed opens since the last successful one.
    failed_opens: u32,
    has_opened: bool,
    close_acks: Vec<oneshot::Sender<()>>,
}

impl Connection {
    pub(super) fn new(
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
        events: broadcast::Sender<BusEvent>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            connector,
            options,
            commands,
            state,
            events,
            counters,
            registry: ChannelRegistry::new(),
            correlator: RequestCorrelator::new(),
            outbox: VecDeque::new(),
            reconnect: ReconnectTimer::new(),
            ping: PingTimer::new(),
            failed_opens: 0,
            has_opened: false,
            close_acks: Vec::new(),
        }
    }

    /// Drive the state machine until `Closed`.
    pub(super) async fn run(mut self) {
        let reason = loop {
            self.set_state(ConnectionState::Connecting);

            let transport = match self.open_transport().await {
                ConnectOutcome::Opened(transport) => transport,
                ConnectOutcome::Closed(reason) => break reason,
                ConnectOutcome::Failed => {
                    self.failed_opens += 1;
                    self.counters
                        .reconnect_attempts
                        .store(self.failed_opens, Ordering::Relaxed);
                    if let Some(reason) = self.retry_blocked() {
                        break reason;
                    }
                    if let Some(reason) = self.wait_for_retry().await {
                        break reason;
                    }
                    continue;
                }
            };

            match self.run_open(transport).await {
                OpenExit::Closed(reason) => break reason,
                OpenExit::Disconnected => {
                    self.emit(BusEvent::Disconnected);
                    if let Some(reason) = self.retry_blocked() {
                        break reason;
                    }
                    self.set_state(ConnectionState::Connecting);
                    if let Some(reason) = self.wait_for_retry().await {
                        break reason;
                    }
                }
            }
        };

        self.finish(reason);
    }

    /// Open a transport while still serving commands.
    async fn open_transport(&mut self) -> ConnectOutcome {
        log::info!(
            "[EventBus] Connecting (attempt {})",
            self.failed_opens + 1
        );
        let connector = Arc::clone(&self.connector);
        let mut connecting = connector.connect();

        loop {
            tokio::select! {
                result = &mut connecting => {
                    return match result {
                        Ok(transport) => ConnectOutcome::Opened(transport),
                        Err(e) => {
                            log::warn!("[EventBus] Connection failed: {:#}", e);
                            ConnectOutcome::Failed
                        }
                    };
                }
                command = self.commands.recv() => {
                    if let Some(reason) = self.apply_offline(command).await {
                        return ConnectOutcome::Closed(reason);
                    }
                }
            }
        }
    }

    /// Sit out the backoff delay. Returns a reason if closed meanwhile.
    async fn wait_for_retry(&mut self) -> Option<CloseReason> {
        let attempt = self.failed_opens + 1;
        let delay = backoff::jittered_delay(&self.options, attempt);
        log::info!(
            "[EventBus] Reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            attempt
        );
        self.reconnect.schedule(delay);
        self.emit(BusEvent::ReconnectScheduled { attempt, delay });

        loop {
            tokio::select! {
                () = self.reconnect.fired() => return None,
                command = self.commands.recv() => {
                    if let Some(reason) = self.apply_offline(command).await {
                        return Some(reason);
                    }
                }
            }
        }
    }

    /// `Some` when the next reconnect must not happen.
    fn retry_blocked(&self) -> Option<CloseReason> {
        if !self.options.auto_reconnect {
            return Some(CloseReason::ReconnectDisabled);
        }
        match self.options.reconnect_attempts {
            Some(limit) if self.failed_opens >= limit => Some(CloseReason::AttemptsExhausted {
                attempts: self.failed_opens,
            }),
            _ => None,
        }
    }

    async fn run_open(&mut self, transport: Transport) -> OpenExit {
        let Transport {
            mut writer,
            mut reader,
        } = transport;

        self.failed_opens = 0;
        self.counters.reconnect_attempts.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Open);
        self.emit(if self.has_opened {
            BusEvent::Reconnected
        } else {
            BusEvent::Opened
        });
        self.has_opened = true;

        let exit = if self.replay(writer.as_mut()).await {
            self.message_loop(writer.as_mut(), reader.as_mut()).await
        } else {
            OpenExit::Disconnected
        };

        self.ping.stop();
        if matches!(exit, OpenExit::Closed(_)) {
            if let Err(e) = writer.close().await {
                log::debug!("[EventBus] Transport close failed: {:#}", e);
            }
        }
        exit
    }

    /// Re-register every live address, then flush the outbox.
    async fn replay(&mut self, writer: &mut dyn FrameWriter) -> bool {
        for frame in self.registry.replay_frames() {
            if let Err(e) = self.write(writer, &frame).await {
                log::warn!("[EventBus] Failed to replay {}: {:#}", frame, e);
                return false;
            }
        }
        if !self.outbox.is_empty() {
            log::debug!("[EventBus] Flushing {} queued frames", self.outbox.len());
        }
        while let Some(frame) = self.outbox.pop_front() {
            if let Err(e) = self.write(writer, &frame).await {
                log::warn!("[EventBus] Failed to flush {}: {:#}", frame.kind(), e);
                self.outbox.push_front(frame);
                return false;
            }
        }
        true
    }

    async fn message_loop(
        &mut self,
        writer: &mut dyn FrameWriter,
        reader: &mut dyn FrameReader,
    ) -> OpenExit {
        self.ping.start(self.options.ping_period());

        loop {
            tokio::select! {
                frame = reader.recv() => match frame {
                    Some(Ok(text)) => {
                        self.counters.received.fetch_add(1, Ordering::Relaxed);
                        self.dispatch(&text);
                    }
                    Some(Err(e)) => {
                        log::warn!("[EventBus] Transport error: {:#}", e);
                        return OpenExit::Disconnected;
                    }
                    None => {
                        log::info!("[EventBus] Transport closed by peer");
                        return OpenExit::Disconnected;
                    }
                },
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.begin_close();
                        return OpenExit::Closed(CloseReason::Shutdown);
                    };
                    match self.apply(command, Some(&mut *writer)).await {
                        Flow::Continue => {}
                        Flow::Close => return OpenExit::Closed(CloseReason::Requested),
                        Flow::Disconnected => return OpenExit::Disconnected,
                    }
                }
                () = self.ping.tick() => {
                    if let Err(e) = self.write(writer, &Message::ping()).await {
                        log::warn!("[EventBus] Ping failed: {:#}", e);
                        return OpenExit::Disconnected;
                    }
                }
            }
        }
    }

    /// Apply a command while no transport is open.
    async fn apply_offline(&mut self, command: Option<Command>) -> Option<CloseReason> {
        let Some(command) = command else {
            self.begin_close();
            return Some(CloseReason::Shutdown);
        };
        match self.apply(command, None).await {
            Flow::Close => Some(CloseReason::Requested),
            Flow::Continue | Flow::Disconnected => None,
        }
    }

    async fn apply(&mut self, command: Command, writer: Option<&mut dyn FrameWriter>) -> Flow {
        match command {
            Command::Register {
                address,
                id,
                handler,
                headers,
            } => {
                let frame = self.registry.register(&address, id, handler, headers);
                self.control(writer, frame).await
            }
            Command::Unregister { address, id } => {
                let frame = self.registry.unregister(&address, id);
                self.control(writer, frame).await
            }
            Command::Publish(frame) => self.deliver(writer, frame).await,
            Command::Send {
                frame,
                reply_address,
                waiter,
            } => {
                self.correlator.track(reply_address, waiter);
                self.deliver(writer, frame).await
            }
            Command::Close { ack } => {
                self.close_acks.push(ack);
                self.begin_close();
                Flow::Close
            }
        }
    }

    /// Send a `register`/`unregister` frame if open. These are never
    /// queued; the replay on the next open covers them.
    async fn control(
        &mut self,
        writer: Option<&mut dyn FrameWriter>,
        frame: Option<Message>,
    ) -> Flow {
        let (Some(writer), Some(frame)) = (writer, frame) else {
            return Flow::Continue;
        };
        match self.write(writer, &frame).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                log::warn!("[EventBus] Failed to send {}: {:#}", frame, e);
                Flow::Disconnected
            }
        }
    }

    /// Send a content frame if open, otherwise queue it.
    async fn deliver(&mut self, writer: Option<&mut dyn FrameWriter>, frame: Message) -> Flow {
        let Some(writer) = writer else {
            log::debug!("[EventBus] Not open, queued {}", frame);
            self.outbox.push_back(frame);
            return Flow::Continue;
        };
        match self.write(writer, &frame).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                log::warn!("[EventBus] Failed to send {}, queued for retry: {:#}", frame.kind(), e);
                self.outbox.push_back(frame);
                Flow::Disconnected
            }
        }
    }

    async fn write(&self, writer: &mut dyn FrameWriter, frame: &Message) -> anyhow::Result<()> {
        let text = match message::encode(frame) {
            Ok(text) => text,
            Err(e) => {
                log::error!("[EventBus] Dropping unencodable frame {}: {}", frame, e);
                return Ok(());
            }
        };
        log::debug!("[EventBus] <--- {}", frame);
        writer.send(text).await?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Route one received frame: pending request first, then handlers.
    fn dispatch(&mut self, text: &str) {
        let frame = match message::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!(
                    "[EventBus] Discarding frame ({}): {}",
                    e,
                    message::preview(text)
                );
                return;
            }
        };
        log::debug!("[EventBus] ---> {}", frame);

        match &frame {
            Message::Receive { .. } | Message::Error { .. } => {}
            Message::Ping => return,
            other => {
                log::warn!(
                    "[EventBus] Ignoring '{}' frame, brokers only send rec and err",
                    other.kind()
                );
                return;
            }
        }

        let Some(frame) = self.correlator.resolve(frame) else {
            return;
        };

        let handlers = frame
            .address()
            .map(|address| self.registry.handlers(address))
            .unwrap_or_default();
        if !handlers.is_empty() {
            registry::dispatch(&handlers, &frame);
            return;
        }

        if let Some(error) = frame.error_content() {
            log::warn!("[EventBus] Unhandled {}", frame);
            self.emit(BusEvent::Error {
                address: frame.address().map(str::to_string),
                error,
            });
        } else {
            log::debug!(
                "[EventBus] No handler for {}",
                frame.address().unwrap_or("-")
            );
        }
    }

    fn begin_close(&mut self) {
        self.set_state(ConnectionState::Closing);
        self.reconnect.cancel();
        self.ping.stop();
    }

    /// Settle in `Closed`: cancel everything still waiting on this task.
    fn finish(mut self, reason: CloseReason) {
        self.reconnect.cancel();
        self.ping.stop();

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send { waiter, .. } => {
                    let _ = waiter.send(Err(RequestError::Cancelled(reason)));
                }
                Command::Close { ack } => self.close_acks.push(ack),
                Command::Register { .. } | Command::Unregister { .. } | Command::Publish(_) => {}
            }
        }

        let cancelled = self.correlator.cancel_all(reason);
        let dropped = self.outbox.len();
        self.outbox.clear();
        if reason.is_requested() {
            log::info!("[EventBus] Closed: {}", reason);
        } else {
            log::error!(
                "[EventBus] Closed: {} ({} pending requests cancelled, {} queued frames dropped)",
                reason,
                cancelled,
                dropped
            );
        }

        self.set_state(ConnectionState::Closed);
        self.emit(BusEvent::Closed(reason));
        for ack in self.close_acks.drain(..) {
            let _ = ack.send(());
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            log::info!("[EventBus] State -> {}", next);
        }
    }

    fn emit(&self, event: BusEvent) {
        let _ = self.events.send(event);
    }
}
