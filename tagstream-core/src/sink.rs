use std::io::Write;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CoreResult, TagStreamError};
use crate::stream::StreamEvent;

/// Where classified events go. Events arrive in stream order; an error
/// from `emit` ends the run.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: StreamEvent) -> CoreResult<()>;
}

/// Forwards events into a tokio channel.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving half.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: StreamEvent) -> CoreResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| TagStreamError::Sink("receiver dropped".into()))
    }
}

/// Writes one JSON object per event, newline-terminated, flushing each line.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    async fn emit(&self, event: StreamEvent) -> CoreResult<()> {
        let line = serde_json::to_string(&event)
            .map_err(|e| TagStreamError::Sink(format!("encode failed: {e}")))?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}
