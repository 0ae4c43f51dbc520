//! Event sinks
//!
//! Where the consumer task delivers events: a channel read by the caller, or
//! a callback into the host runtime.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::Event;

/// The receiving side is gone
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Final destination of events.
///
/// `deliver` may wait; while it does, undelivered events pile up in the
/// emitter queue and count against its depth cap.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: Event) -> Result<(), SinkClosed>;
}

/// Delivers into a bounded channel read through [`EventStream`]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, event: Event) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}

/// Caller side of a [`ChannelSink`]
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Next event, or `None` once the bridge is gone
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Create a connected sink and stream holding up to `capacity` events
pub fn channel(capacity: usize) -> (ChannelSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx }, EventStream { rx })
}

/// Hands every event to a callback, e.g. a host runtime's event emitter
pub struct FnSink<F> {
    callback: F,
}

impl<F> FnSink<F>
where
    F: Fn(Event) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> EventSink for FnSink<F>
where
    F: Fn(Event) + Send + Sync,
{
    async fn deliver(&self, event: Event) -> Result<(), SinkClosed> {
        (self.callback)(event);
        Ok(())
    }
}
