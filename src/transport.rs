//! Socket-like transport abstraction.
//!
//! The client state machine and the mock broker only ever see text frames
//! through [`FrameWriter`] / [`FrameReader`]. The WebSocket implementation
//! lives in [`crate::ws`]; [`memory_pair`] wires two in-process ends
//! together for tests and embedded brokers.

// Rust guideline compliant 2026-02

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Write half of a transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one text frame.
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Close the transport. The peer's reader ends.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Next text frame; `None` once the transport is closed.
    ///
    /// Must be cancel-safe, since it is polled from `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// An open transport, split for use in `tokio::select!` loops.
pub struct Transport {
    /// Outgoing frames.
    pub writer: Box<dyn FrameWriter>,
    /// Incoming frames.
    pub reader: Box<dyn FrameReader>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    /// Pair up two halves.
    pub fn new(writer: impl FrameWriter + 'static, reader: impl FrameReader + 'static) -> Self {
        Self {
            writer: Box::new(writer),
            reader: Box::new(reader),
        }
    }
}

/// Opens transports for the client, once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport. An error counts as a failed open.
    async fn connect(&self) -> Result<Transport>;
}

/// In-process write half.
#[derive(Debug)]
pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

/// In-process read half.
#[derive(Debug)]
pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: String) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| anyhow!("transport closed"))?;
        tx.send(frame).map_err(|e| anyhow!("peer hung up: {e}"))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Two connected in-process transports.
///
/// Frames written on one end are read on the other. Closing or dropping
/// an end's writer ends the other end's reader.
pub fn memory_pair() -> (Transport, Transport) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    let left = Transport::new(MemoryWriter { tx: Some(left_tx) }, MemoryReader { rx: left_rx });
    let right = Transport::new(MemoryWriter { tx: Some(right_tx) }, MemoryReader { rx: right_rx });
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_over() {
        let (mut left, mut right) = memory_pair();
        left.writer.send("hello".to_string()).await.unwrap();
        right.writer.send("world".to_string()).await.unwrap();
        assert_eq!(right.reader.recv().await.unwrap().unwrap(), "hello");
        assert_eq!(left.reader.recv().await.unwrap().unwrap(), "world");
    }

    #[tokio::test]
    async fn test_close_ends_peer_reader() {
        let (mut left, mut right) = memory_pair();
        left.writer.send("last".to_string()).await.unwrap();
        left.writer.close().await.unwrap();
        assert_eq!(right.reader.recv().await.unwrap().unwrap(), "last");
        assert!(right.reader.recv().await.is_none());
        assert!(left.writer.send("after".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_peer_fails_writes() {
        let (mut left, right) = memory_pair();
        drop(right);
        assert!(left.writer.send("x".to_string()).await.is_err());
        assert!(left.reader.recv().await.is_none());
    }
}
