//! Engine handle implementation
//!
//! Wraps one loaded model and its computational context.
//!
//! # Architecture
//!
//! Native inference types hold raw pointers and are not `Send`, and the
//! context is not reentrant. Every session therefore gets a dedicated worker
//! thread that loads the model, owns it for its whole lifetime and runs the
//! decode loop of one generation task at a time. The bridge talks to the
//! worker through a command channel.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::generation::task::GenerationTask;
use crate::inference::model::{LoadedModelInfo, ModelDescriptor, ModelLoadError};
use crate::lock_unpoisoned;
use crate::types::SessionId;

/// Vocabulary index of a token
pub type TokenId = i32;

/// Errors raised by a single engine step
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineFault {
    #[error("Context window exceeded: {used} tokens, limit {limit}")]
    ContextOverflow { used: usize, limit: usize },

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

/// A model loaded into memory together with its inference context.
///
/// Lives on the worker thread that created it and is driven by one task at a
/// time.
pub trait InferenceModel {
    /// Information reported to callers once loading finished
    fn info(&self) -> LoadedModelInfo;

    /// Size of the context window in tokens
    fn context_size(&self) -> usize;

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineFault>;

    /// Run one decode step and return logits for the next token.
    ///
    /// `history` is the full token sequence so far (prompt plus generated
    /// tokens). Implementations keep their own cache and only evaluate the
    /// part of `history` they have not seen since the last `reset`.
    fn decode_step(&mut self, history: &[TokenId]) -> Result<Vec<f32>, EngineFault>;

    /// Raw bytes of a token. May be an incomplete UTF-8 sequence.
    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineFault>;

    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    /// Forget all cached state so the next decode starts a fresh sequence
    fn reset(&mut self);
}

/// Something that can load models.
///
/// `open` runs on the session's worker thread. It loads the model, hands it
/// to `serve` and releases every native resource once `serve` returns, so
/// the model never has to leave the thread or outlive the call.
pub trait EngineBackend: Send + Sync + 'static {
    /// Short backend name for logs
    fn name(&self) -> &str;

    fn open(
        &self,
        descriptor: &ModelDescriptor,
        serve: &mut dyn FnMut(&mut dyn InferenceModel),
    ) -> Result<(), ModelLoadError>;
}

/// Receives the outcome of a model load started by [`EngineHandle::spawn`]
pub type LoadReceiver = oneshot::Receiver<Result<LoadedModelInfo, ModelLoadError>>;

/// Handle to one session's engine worker
#[derive(Debug)]
pub struct EngineHandle {
    /// Queue of tasks for the worker; dropping it stops the worker
    command_tx: Mutex<Option<Sender<Box<GenerationTask>>>>,
    /// Handle to the worker thread
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EngineHandle {
    /// Spawns the worker thread and starts loading `descriptor` on it.
    ///
    /// The returned receiver resolves once the model is loaded or loading
    /// failed.
    pub fn spawn(
        session_id: &SessionId,
        backend: Arc<dyn EngineBackend>,
        descriptor: ModelDescriptor,
    ) -> Result<(Self, LoadReceiver), ModelLoadError> {
        let (command_tx, command_rx) = mpsc::channel::<Box<GenerationTask>>();
        let (load_tx, load_rx) = oneshot::channel();

        let id = session_id.clone();
        let worker = thread::Builder::new()
            .name(format!("engine-{}", crate::truncate_str(session_id.as_str(), 8)))
            .spawn(move || worker_main(id, backend, descriptor, load_tx, command_rx))
            .map_err(|e| ModelLoadError::Worker(e.to_string()))?;

        tracing::debug!("Engine worker spawned for session {}", session_id);

        Ok((
            Self {
                command_tx: Mutex::new(Some(command_tx)),
                worker: Mutex::new(Some(worker)),
            },
            load_rx,
        ))
    }

    /// Queue a task on the worker. Gives the task back if the worker is gone.
    pub(crate) fn submit(&self, task: GenerationTask) -> Result<(), Box<GenerationTask>> {
        let guard = lock_unpoisoned(&self.command_tx);
        let Some(tx) = guard.as_ref() else {
            return Err(Box::new(task));
        };
        tx.send(Box::new(task)).map_err(|e| e.0)
    }

    /// Asks the worker to release the model and exit.
    ///
    /// Returns the worker's join handle the first time; later calls are
    /// no-ops and return `None`.
    pub fn unload(&self) -> Option<JoinHandle<()>> {
        if lock_unpoisoned(&self.command_tx).take().is_some() {
            tracing::info!("Model unload requested");
        }
        lock_unpoisoned(&self.worker).take()
    }

    /// Returns true while the worker accepts commands
    pub fn is_alive(&self) -> bool {
        let worker_running = lock_unpoisoned(&self.worker)
            .as_ref()
            .is_some_and(|w| !w.is_finished());
        lock_unpoisoned(&self.command_tx).is_some() && worker_running
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish its current task and exit
        lock_unpoisoned(&self.command_tx).take();
    }
}

/// Worker thread entry point
///
/// Loads the model, reports the result, then serves commands until shutdown.
fn worker_main(
    session_id: SessionId,
    backend: Arc<dyn EngineBackend>,
    descriptor: ModelDescriptor,
    load_tx: oneshot::Sender<Result<LoadedModelInfo, ModelLoadError>>,
    command_rx: Receiver<Box<GenerationTask>>,
) {
    tracing::info!(
        "Loading {} for session {} with {} backend",
        descriptor.path.display(),
        session_id,
        backend.name()
    );

    let mut load_tx = Some(load_tx);
    let result = backend.open(&descriptor, &mut |model: &mut dyn InferenceModel| {
        let info = model.info();
        tracing::info!(
            "Model loaded: {} ({} vocab, {} ctx)",
            info.path,
            info.vocab_size,
            info.context_length
        );
        if let Some(tx) = load_tx.take() {
            if tx.send(Ok(info)).is_err() {
                tracing::warn!("Load of session {} abandoned by caller", session_id);
                return;
            }
        }
        serve(&session_id, model, &command_rx);
    });

    match result {
        Ok(()) => tracing::info!("Model released for session {}", session_id),
        Err(e) => match load_tx.take() {
            Some(tx) => {
                let _ = tx.send(Err(e));
            }
            None => tracing::error!("Engine for session {} failed after load: {}", session_id, e),
        },
    }
}

fn serve(
    session_id: &SessionId,
    model: &mut dyn InferenceModel,
    command_rx: &Receiver<Box<GenerationTask>>,
) {
    // recv fails once the handle dropped its sender and the queue is drained
    while let Ok(mut task) = command_rx.recv() {
        let run = panic::catch_unwind(AssertUnwindSafe(|| task.run(&mut *model)));
        if run.is_err() {
            // Context state is unknown after a panic; stop using it
            tracing::error!("Engine panicked during task {}", task.task_id());
            task.abort_after_panic();
            return;
        }
    }
    tracing::info!("Engine worker for session {} shutting down", session_id);
}
