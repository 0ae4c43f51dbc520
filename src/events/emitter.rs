//! Event emitter
//!
//! Producers never wait for the consumer. Each producer counts its own
//! undelivered token events in a [`Backlog`]; once that backlog reaches the
//! cap a token emit fails and only that producing task is failed with
//! backpressure. Terminal and lifecycle events skip the cap so a failure is
//! never lost.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{Event, EventSink};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EmitError {
    #[error("event queue full ({depth} undelivered events)")]
    BackpressureExceeded { depth: usize },

    #[error("event sink closed")]
    Closed,
}

/// Undelivered token events of one producer
#[derive(Debug, Clone, Default)]
pub struct Backlog(Arc<AtomicUsize>);

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Queued {
    event: Event,
    /// Set for token events, released once delivered
    backlog: Option<Backlog>,
}

/// Producer side of the event queue. Cheap to clone.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<Queued>,
    depth: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    capacity: usize,
}

impl EventEmitter {
    /// Start the consumer task delivering to `sink`.
    ///
    /// Must be called from within a tokio runtime. The consumer stops once
    /// every emitter clone is dropped and the queue is drained.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Queued>();
        let depth = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let consumer_depth = Arc::clone(&depth);
        let consumer_closed = Arc::clone(&closed);
        let consumer = tokio::spawn(async move {
            while let Some(Queued { event, backlog }) = rx.recv().await {
                if !consumer_closed.load(Ordering::Acquire) && sink.deliver(event).await.is_err() {
                    tracing::warn!("Event sink closed, discarding further events");
                    consumer_closed.store(true, Ordering::Release);
                }
                consumer_depth.fetch_sub(1, Ordering::AcqRel);
                if let Some(backlog) = backlog {
                    backlog.0.fetch_sub(1, Ordering::AcqRel);
                }
            }
            tracing::debug!("Event consumer finished");
        });

        (
            Self {
                tx,
                depth,
                closed,
                capacity: capacity.max(1),
            },
            consumer,
        )
    }

    /// Enqueue a token event on behalf of the producer owning `backlog`,
    /// failing instead of growing its backlog past the cap
    pub fn try_emit(&self, backlog: &Backlog, event: Event) -> Result<(), EmitError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EmitError::Closed);
        }
        let capacity = self.capacity;
        backlog
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < capacity).then_some(depth + 1)
            })
            .map_err(|depth| EmitError::BackpressureExceeded { depth })?;

        self.depth.fetch_add(1, Ordering::AcqRel);
        let queued = Queued {
            event,
            backlog: Some(backlog.clone()),
        };
        if self.tx.send(queued).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            backlog.0.fetch_sub(1, Ordering::AcqRel);
            return Err(EmitError::Closed);
        }
        Ok(())
    }

    /// Enqueue a terminal or lifecycle event regardless of the cap
    pub fn emit(&self, event: Event) {
        self.depth.fetch_add(1, Ordering::AcqRel);
        let queued = Queued {
            event,
            backlog: None,
        };
        if self.tx.send(queued).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!("Event consumer stopped, event dropped");
        }
    }

    /// Events enqueued but not yet delivered, across all producers
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Cap on one producer's undelivered token events
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
