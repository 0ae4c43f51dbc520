//! Sessions
//!
//! A session binds a caller-visible id to one engine handle. It owns the
//! handle exclusively and admits at most one generation task at a time.

pub mod gate;
pub mod registry;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::generation::task::GenerationTask;
use crate::inference::{EngineHandle, LoadedModelInfo, ModelDescriptor};
use crate::types::{SessionId, TaskId};

pub use gate::{SessionGate, SessionState};
pub use registry::SessionRegistry;

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    descriptor: ModelDescriptor,
    gate: Arc<SessionGate>,
    engine: EngineHandle,
    model: OnceCell<LoadedModelInfo>,
    created_at: DateTime<Utc>,
}

/// Snapshot of a session for callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub state: SessionState,
    pub active_task: Option<TaskId>,
    pub descriptor: ModelDescriptor,
    /// Present once loading finished
    pub model: Option<LoadedModelInfo>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(id: SessionId, descriptor: ModelDescriptor, engine: EngineHandle) -> Self {
        Self {
            gate: Arc::new(SessionGate::new(id.clone())),
            id,
            descriptor,
            engine,
            model: OnceCell::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SessionState {
        self.gate.state()
    }

    pub fn gate(&self) -> &Arc<SessionGate> {
        &self.gate
    }

    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.model.get()
    }

    /// True while the model can serve generate calls
    pub fn is_loaded(&self) -> bool {
        matches!(self.state(), SessionState::Ready | SessionState::Generating)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            state: self.gate.state(),
            active_task: self.gate.active_task(),
            descriptor: self.descriptor.clone(),
            model: self.model.get().cloned(),
            created_at: self.created_at,
        }
    }

    pub(crate) fn mark_loaded(&self, info: LoadedModelInfo) {
        let _ = self.model.set(info);
        self.gate.mark_ready();
    }

    /// Hand an admitted task to the engine worker
    pub(crate) fn submit(&self, task: GenerationTask) -> Result<(), Box<GenerationTask>> {
        self.engine.submit(task)
    }

    /// Release the engine and wait for its worker to exit. Idempotent.
    pub(crate) async fn close(&self) {
        let Some(worker) = self.engine.unload() else {
            return;
        };
        match tokio::task::spawn_blocking(move || worker.join()).await {
            Ok(Ok(())) => tracing::debug!("Engine worker for session {} joined", self.id),
            Ok(Err(_)) => tracing::error!("Engine worker for session {} panicked", self.id),
            Err(e) => tracing::error!("Failed to join engine worker for {}: {}", self.id, e),
        }
    }
}
