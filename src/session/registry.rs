//! Session registry
//!
//! Owns the mapping from session id to session. Entries are inserted fully
//! constructed in `Loading` and removed only by a failed load or an unload.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::BridgeError;
use crate::inference::{EngineBackend, EngineHandle, ModelDescriptor, ModelLoadError};
use crate::session::Session;
use crate::types::SessionId;

pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    max_sessions: usize,
    /// Slots held by loaded and loading sessions
    reserved: AtomicUsize,
    /// Loads that have not settled yet
    loading: AtomicUsize,
    loads_settled: Notify,
    closed: AtomicBool,
}

/// One in-flight `create`. Releases its slot and entry unless committed,
/// also when the load future is dropped.
struct PendingLoad<'a> {
    registry: &'a SessionRegistry,
    /// Set once the loading entry is in the map
    inserted: Option<SessionId>,
    committed: bool,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        let registry = self.registry;
        if !self.committed {
            if let Some(id) = self.inserted.take() {
                registry.sessions.remove(&id);
                tracing::debug!("Discarded session {} after unfinished load", id);
            }
            registry.reserved.fetch_sub(1, Ordering::AcqRel);
        }
        if registry.loading.fetch_sub(1, Ordering::AcqRel) == 1 {
            registry.loads_settled.notify_waiters();
        }
    }
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            reserved: AtomicUsize::new(0),
            loading: AtomicUsize::new(0),
            loads_settled: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Load `descriptor` into a new session registered as `id`.
    ///
    /// The session is visible in `Loading` while the worker loads the model.
    /// On failure it is removed again and the error returned. A load that
    /// finishes after [`close`](Self::close) is torn down and reported as
    /// `ShuttingDown`.
    pub async fn create(
        &self,
        id: SessionId,
        descriptor: ModelDescriptor,
        backend: Arc<dyn EngineBackend>,
    ) -> Result<Arc<Session>, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ShuttingDown);
        }
        let max = self.max_sessions;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| BridgeError::TooManySessions(max))?;
        self.loading.fetch_add(1, Ordering::AcqRel);

        let mut pending = PendingLoad {
            registry: self,
            inserted: None,
            committed: false,
        };

        let (session, load_rx) = match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(BridgeError::SessionExists(id)),
            Entry::Vacant(vacant) => {
                let (engine, load_rx) = EngineHandle::spawn(&id, backend, descriptor.clone())?;
                let session = Arc::new(Session::new(id.clone(), descriptor, engine));
                vacant.insert(Arc::clone(&session));
                (session, load_rx)
            }
        };
        pending.inserted = Some(id);

        let loaded = load_rx.await.unwrap_or_else(|_| {
            Err(ModelLoadError::Worker(
                "engine worker exited during load".to_string(),
            ))
        });

        match loaded {
            Ok(info) if !self.is_closed() => {
                session.mark_loaded(info);
                pending.committed = true;
                Ok(session)
            }
            Ok(_) => {
                tracing::info!("Session {} loaded during shutdown, releasing it", session.id());
                // close before settling so shutdown never sees a live worker
                session.close().await;
                drop(pending);
                Err(BridgeError::ShuttingDown)
            }
            Err(e) => {
                session.close().await;
                drop(pending);
                Err(e.into())
            }
        }
    }

    /// Refuse new loads. Loads already running finish as `ShuttingDown`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until no load is in flight
    pub async fn wait_for_loads(&self) {
        loop {
            let settled = self.loads_settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if self.loading.load(Ordering::Acquire) == 0 {
                return;
            }
            settled.await;
        }
    }

    pub fn get(&self, id: &SessionId) -> Result<Arc<Session>, BridgeError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))
    }

    /// Unload and remove a session.
    ///
    /// Fails with `SessionBusy` while a task is active; callers cancel first.
    pub async fn destroy(&self, id: &SessionId) -> Result<(), BridgeError> {
        let session = self.get(id)?;
        session.gate().begin_unload()?;
        if self.sessions.remove(id).is_some() {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
        }
        session.close().await;
        Ok(())
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
