//! Session admission gate
//!
//! Holds a session's lifecycle state and its single active task slot. Every
//! transition happens under one lock, so two tasks can never both be
//! admitted to the same engine.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::BridgeError;
use crate::lock_unpoisoned;
use crate::types::{SessionId, TaskId};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Loading,
    Ready,
    Generating,
    Unloading,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Generating => "generating",
            SessionState::Unloading => "unloading",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct GateInner {
    state: SessionState,
    active_task: Option<TaskId>,
}

#[derive(Debug)]
pub struct SessionGate {
    session_id: SessionId,
    inner: Mutex<GateInner>,
    /// Signalled whenever the active task slot is freed
    idle: Notify,
}

impl SessionGate {
    /// New gate in `Loading`
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            inner: Mutex::new(GateInner {
                state: SessionState::Loading,
                active_task: None,
            }),
            idle: Notify::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        lock_unpoisoned(&self.inner).state
    }

    pub fn active_task(&self) -> Option<TaskId> {
        lock_unpoisoned(&self.inner).active_task.clone()
    }

    /// `Loading -> Ready`
    pub fn mark_ready(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.state == SessionState::Loading {
            inner.state = SessionState::Ready;
        }
    }

    /// Claim the active task slot for `task_id`: `Ready -> Generating`
    pub fn admit(&self, task_id: &TaskId) -> Result<(), BridgeError> {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.state {
            SessionState::Ready => {
                inner.state = SessionState::Generating;
                inner.active_task = Some(task_id.clone());
                Ok(())
            }
            SessionState::Generating => Err(BridgeError::SessionBusy {
                session_id: self.session_id.clone(),
                active_task: inner.active_task.clone(),
            }),
            state => Err(BridgeError::SessionUnavailable {
                session_id: self.session_id.clone(),
                state,
            }),
        }
    }

    /// Free the slot held by `task_id`: `Generating -> Ready`
    pub fn release(&self, task_id: &TaskId) {
        {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.active_task.as_ref() != Some(task_id) {
                return;
            }
            inner.active_task = None;
            if inner.state == SessionState::Generating {
                inner.state = SessionState::Ready;
            }
        }
        self.idle.notify_waiters();
    }

    /// Enter `Unloading`. Fails while a task is active or the model is
    /// still loading.
    pub fn begin_unload(&self) -> Result<(), BridgeError> {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.state {
            SessionState::Ready | SessionState::Failed => {
                inner.state = SessionState::Unloading;
                Ok(())
            }
            SessionState::Generating => Err(BridgeError::SessionBusy {
                session_id: self.session_id.clone(),
                active_task: inner.active_task.clone(),
            }),
            state => Err(BridgeError::SessionUnavailable {
                session_id: self.session_id.clone(),
                state,
            }),
        }
    }

    /// The engine can no longer be used; only unloading remains possible
    pub fn mark_failed(&self) {
        {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.state = SessionState::Failed;
            inner.active_task = None;
        }
        self.idle.notify_waiters();
    }

    /// Wait until no task holds the slot
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock_unpoisoned(&self.inner).active_task.is_none() {
                return;
            }
            notified.await;
        }
    }
}
