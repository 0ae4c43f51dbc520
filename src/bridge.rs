//! Bridge facade
//!
//! The surface a host runtime calls: load and unload models, start and
//! cancel generation, and receive every result as an [`Event`].
//!
//! Calls validate their inputs before touching the registry or an engine.
//! None of them wait for token generation; progress is reported through the
//! event sink handed to [`Bridge::new`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::events::{channel, Event, EventEmitter, EventSink, EventStream};
use crate::generation::task::GenerationTask;
use crate::generation::{GenerationParams, TaskControl, TaskState, TaskTable};
use crate::inference::{EngineBackend, ModelDescriptor};
use crate::session::{SessionInfo, SessionRegistry};
use crate::truncate_str;
use crate::types::{format_prompt, ChatMessage, SessionId, TaskId};

pub struct Bridge {
    backend: Arc<dyn EngineBackend>,
    registry: SessionRegistry,
    tasks: TaskTable,
    emitter: EventEmitter,
    config: BridgeConfig,
    closing: AtomicBool,
}

impl Bridge {
    /// Create a bridge delivering events to `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        backend: Arc<dyn EngineBackend>,
        mut config: BridgeConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        config.validate();
        let (emitter, _consumer) = EventEmitter::spawn(sink, config.event_queue_depth);
        tracing::info!(
            "Bridge started with {} backend (queue depth {}, max {} sessions)",
            backend.name(),
            config.event_queue_depth,
            config.max_sessions
        );

        Self {
            backend,
            registry: SessionRegistry::new(config.max_sessions),
            tasks: TaskTable::new(config.retained_tasks),
            emitter,
            config,
            closing: AtomicBool::new(false),
        }
    }

    /// Create a bridge whose events are read from the returned stream
    pub fn with_event_stream(
        backend: Arc<dyn EngineBackend>,
        config: BridgeConfig,
    ) -> (Self, EventStream) {
        let (sink, stream) = channel(config.event_queue_depth);
        (Self::new(backend, config, Arc::new(sink)), stream)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Generation parameters from the configuration
    pub fn default_params(&self) -> GenerationParams {
        self.config.generation.clone()
    }

    /// Load a model into a new session and return its id
    pub async fn load_model(&self, descriptor: ModelDescriptor) -> Result<SessionId, BridgeError> {
        self.load_model_as(SessionId::generate(), descriptor).await
    }

    /// Load a model into a new session with a caller-chosen id
    pub async fn load_model_as(
        &self,
        session_id: SessionId,
        descriptor: ModelDescriptor,
    ) -> Result<SessionId, BridgeError> {
        self.ensure_open()?;
        if session_id.as_str().trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "session id must not be empty".to_string(),
            ));
        }
        if descriptor.path.as_os_str().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "model path must not be empty".to_string(),
            ));
        }
        if descriptor.context_size == 0 {
            return Err(BridgeError::InvalidArgument(
                "contextSize must be positive".to_string(),
            ));
        }

        let session = self
            .registry
            .create(session_id.clone(), descriptor, Arc::clone(&self.backend))
            .await?;

        if let Some(model) = session.model_info() {
            tracing::info!("Session {} ready with {}", session_id, model.name);
            self.emitter.emit(Event::ModelLoaded {
                session_id: session_id.clone(),
                model: model.clone(),
            });
        }
        Ok(session_id)
    }

    /// Start generating from `prompt`. Tokens and the outcome arrive as
    /// events tagged with the returned task id.
    pub fn generate(
        &self,
        session_id: &SessionId,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<TaskId, BridgeError> {
        self.ensure_open()?;
        if prompt.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "prompt must not be empty".to_string(),
            ));
        }
        params.validate()?;

        let session = self.registry.get(session_id)?;
        let task_id = TaskId::generate();
        session.gate().admit(&task_id)?;

        let control = Arc::new(TaskControl::new(task_id.clone(), session_id.clone()));
        self.tasks.insert(Arc::clone(&control));

        tracing::info!(
            "Task {} admitted on session {}: {:?} (max {} tokens)",
            task_id,
            session_id,
            truncate_str(prompt, 48),
            params.max_tokens
        );

        let task = GenerationTask::new(
            control,
            Arc::clone(session.gate()),
            self.emitter.clone(),
            prompt.to_string(),
            params,
        );
        if let Err(task) = session.submit(task) {
            task.reject();
            self.tasks.remove(&task_id);
            tracing::error!("Engine worker for session {} is gone", session_id);
            return Err(BridgeError::Worker(format!(
                "engine worker for session {} is not running",
                session_id
            )));
        }

        Ok(task_id)
    }

    /// Render `messages` as a chat transcript and generate the next
    /// assistant turn
    pub fn generate_chat(
        &self,
        session_id: &SessionId,
        messages: &[ChatMessage],
        params: GenerationParams,
    ) -> Result<TaskId, BridgeError> {
        if messages.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "messages must not be empty".to_string(),
            ));
        }
        self.generate(session_id, &format_prompt(messages), params)
    }

    /// Request cancellation of a task.
    ///
    /// The task stops at its next step boundary. Cancelling a finished task
    /// does nothing, as long as its record is still retained: only the last
    /// `retained_tasks` finished tasks are kept, and an evicted one fails
    /// with `TaskNotFound` like an id that never existed.
    pub fn cancel(&self, task_id: &TaskId) -> Result<(), BridgeError> {
        let control = self
            .tasks
            .get(task_id)
            .ok_or_else(|| BridgeError::TaskNotFound(task_id.clone()))?;

        if control.cancel() {
            tracing::info!("Cancellation requested for task {}", task_id);
        } else {
            tracing::debug!("Task {} already finished, cancel ignored", task_id);
        }
        Ok(())
    }

    /// Cancel `task_id` once `timeout` elapses
    pub fn cancel_after(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<JoinHandle<()>, BridgeError> {
        let control = self
            .tasks
            .get(task_id)
            .ok_or_else(|| BridgeError::TaskNotFound(task_id.clone()))?;

        Ok(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if control.cancel() {
                tracing::info!(
                    "Task {} timed out after {:?}, cancelling",
                    control.task_id(),
                    timeout
                );
            }
        }))
    }

    /// Unload a session's model. Fails with `SessionBusy` while a task runs.
    pub async fn unload_model(&self, session_id: &SessionId) -> Result<(), BridgeError> {
        self.registry.destroy(session_id).await?;
        tracing::info!("Session {} unloaded", session_id);
        self.emitter.emit(Event::ModelUnloaded {
            session_id: session_id.clone(),
        });
        Ok(())
    }

    pub fn session(&self, session_id: &SessionId) -> Result<SessionInfo, BridgeError> {
        Ok(self.registry.get(session_id)?.info())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.list().iter().map(|s| s.info()).collect()
    }

    pub fn is_model_loaded(&self, session_id: &SessionId) -> bool {
        self.registry
            .get(session_id)
            .is_ok_and(|session| session.is_loaded())
    }

    pub fn task_state(&self, task_id: &TaskId) -> Result<TaskState, BridgeError> {
        self.tasks
            .get(task_id)
            .map(|control| control.state())
            .ok_or_else(|| BridgeError::TaskNotFound(task_id.clone()))
    }

    /// Cancel every task, wait for them to stop and unload every session.
    ///
    /// New loads and generations are refused from the moment this is called.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Bridge shutting down");
        self.registry.close();

        for control in self.tasks.live() {
            control.cancel();
        }
        // a load still in flight releases its own session
        self.registry.wait_for_loads().await;
        for session in self.registry.list() {
            session.gate().wait_idle().await;
            if let Err(e) = self.unload_model(session.id()).await {
                tracing::warn!("Failed to unload session {}: {}", session.id(), e);
            }
        }
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(BridgeError::ShuttingDown);
        }
        Ok(())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // Workers exit once their current task stops and their queue closes
        for control in self.tasks.live() {
            control.cancel();
        }
    }
}
