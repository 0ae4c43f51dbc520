//! Generation task state machine and decode loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::events::{Backlog, EmitError, Event, EventEmitter};
use crate::generation::{CompletionReason, FailureKind, GenerationParams, GenerationStats};
use crate::inference::{InferenceModel, TokenDecoder, TokenId};
use crate::lock_unpoisoned;
use crate::session::SessionGate;
use crate::types::{SessionId, TaskId};

/// Tokens considered by the repeat penalty
const REPEAT_WINDOW: usize = 64;

/// Lifecycle state of a generation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Shared control block of a task.
///
/// The bridge keeps one to answer `cancel` and status queries; the worker
/// keeps one to drive the state machine.
#[derive(Debug)]
pub struct TaskControl {
    task_id: TaskId,
    session_id: SessionId,
    cancelled: AtomicBool,
    state: Mutex<TaskState>,
}

impl TaskControl {
    pub fn new(task_id: TaskId, session_id: SessionId) -> Self {
        Self {
            task_id,
            session_id,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(TaskState::Pending),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Lookup-only back-reference to the owning session
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> TaskState {
        *lock_unpoisoned(&self.state)
    }

    /// Request cancellation.
    ///
    /// Returns false when the task already reached a terminal state, in which
    /// case nothing changes.
    pub fn cancel(&self) -> bool {
        let state = lock_unpoisoned(&self.state);
        if state.is_terminal() {
            return false;
        }
        self.cancelled.store(true, Ordering::Release);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Pending -> Running`. Fails if the task left `Pending` already.
    fn start(&self) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if *state != TaskState::Pending {
            return false;
        }
        *state = TaskState::Running;
        true
    }

    /// Move to a terminal state. Only the first terminal transition wins.
    pub(crate) fn finish(&self, terminal: TaskState) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut state = lock_unpoisoned(&self.state);
        if state.is_terminal() {
            return false;
        }
        *state = terminal;
        true
    }
}

/// How a run ended
#[derive(Debug)]
enum Outcome {
    Completed(CompletionReason),
    Cancelled,
    Failed(FailureKind, String),
}

/// Partial output of a running task
#[derive(Debug, Default)]
struct Progress {
    text: String,
    emitted: usize,
    prompt_tokens: usize,
    decoder: TokenDecoder,
}

/// One in-flight decode request, executed on the session's worker thread
pub struct GenerationTask {
    control: Arc<TaskControl>,
    gate: Arc<SessionGate>,
    emitter: EventEmitter,
    /// This task's undelivered tokens; other tasks never count against it
    backlog: Backlog,
    prompt: String,
    params: GenerationParams,
}

impl GenerationTask {
    pub(crate) fn new(
        control: Arc<TaskControl>,
        gate: Arc<SessionGate>,
        emitter: EventEmitter,
        prompt: String,
        params: GenerationParams,
    ) -> Self {
        Self {
            control,
            gate,
            emitter,
            backlog: Backlog::new(),
            prompt,
            params,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        self.control.task_id()
    }

    /// Drive the task to a terminal state and report it
    pub(crate) fn run(&mut self, model: &mut dyn InferenceModel) {
        let started = Instant::now();
        let mut progress = Progress::default();

        let outcome = if self.control.start() {
            tracing::debug!("Task {} running", self.task_id());
            self.decode_loop(model, &mut progress)
        } else {
            // cancelled while still queued
            Outcome::Cancelled
        };

        self.conclude(outcome, progress, started);
    }

    fn decode_loop(&self, model: &mut dyn InferenceModel, progress: &mut Progress) -> Outcome {
        model.reset();

        let mut history = match model.tokenize(&self.prompt) {
            Ok(tokens) if tokens.is_empty() => {
                return Outcome::Failed(
                    FailureKind::Tokenization,
                    "prompt produced no tokens".to_string(),
                )
            }
            Ok(tokens) => tokens,
            Err(fault) => return Outcome::Failed(FailureKind::from(&fault), fault.to_string()),
        };
        progress.prompt_tokens = history.len();

        let limit = model.context_size();
        let max_tokens = self.params.max_tokens as usize;
        let mut sampler = self.params.sampler();

        loop {
            // step boundary: the only place cancellation is honored
            if self.control.is_cancelled() {
                return Outcome::Cancelled;
            }

            // a history of exactly `limit` tokens still fits
            if history.len() > limit {
                return Outcome::Failed(
                    FailureKind::ContextOverflow,
                    format!("context window of {} tokens is full", limit),
                );
            }

            let logits = match model.decode_step(&history) {
                Ok(logits) => logits,
                Err(fault) => return Outcome::Failed(FailureKind::from(&fault), fault.to_string()),
            };

            let window = &history[history.len().saturating_sub(REPEAT_WINDOW)..];
            let token: TokenId = match sampler.sample(&logits, window) {
                Ok(token) => token,
                Err(e) => return Outcome::Failed(FailureKind::Engine, e.to_string()),
            };

            if model.is_end_of_sequence(token) {
                tracing::debug!("End of generation token encountered");
                progress.text.push_str(&progress.decoder.finish());
                return Outcome::Completed(CompletionReason::EndOfSequence);
            }

            let bytes = match model.token_bytes(token) {
                Ok(bytes) => bytes,
                Err(fault) => return Outcome::Failed(FailureKind::from(&fault), fault.to_string()),
            };
            let piece = progress.decoder.push(&bytes);
            history.push(token);
            progress.text.push_str(&piece);

            let event = Event::TokenProduced {
                task_id: self.task_id().clone(),
                token: piece,
                token_id: token,
                index: progress.emitted,
            };
            match self.emitter.try_emit(&self.backlog, event) {
                Ok(()) => progress.emitted += 1,
                Err(EmitError::BackpressureExceeded { depth }) => {
                    return Outcome::Failed(
                        FailureKind::BackpressureExceeded,
                        format!("event queue full ({} undelivered events)", depth),
                    )
                }
                Err(EmitError::Closed) => {
                    tracing::debug!("Event consumer gone, stopping generation");
                    return Outcome::Cancelled;
                }
            }

            if let Some(pos) = self.find_stop(&progress.text) {
                progress.text.truncate(pos);
                return Outcome::Completed(CompletionReason::StopSequence);
            }

            if progress.emitted >= max_tokens {
                progress.text.push_str(&progress.decoder.finish());
                return Outcome::Completed(CompletionReason::MaxTokens);
            }
        }
    }

    /// Byte offset of the earliest stop sequence in `text`
    fn find_stop(&self, text: &str) -> Option<usize> {
        self.params
            .stop_sequences
            .iter()
            .filter_map(|stop| text.find(stop.as_str()))
            .min()
    }

    /// Terminal transition: record state, free the session, then report
    fn conclude(&self, outcome: Outcome, progress: Progress, started: Instant) {
        let terminal = match &outcome {
            Outcome::Completed(_) => TaskState::Completed,
            Outcome::Cancelled => TaskState::Cancelled,
            Outcome::Failed(..) => TaskState::Failed,
        };
        if !self.control.finish(terminal) {
            return;
        }
        self.gate.release(self.task_id());

        let task_id = self.task_id().clone();
        let event = match outcome {
            Outcome::Completed(reason) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let stats = GenerationStats::new(progress.prompt_tokens, progress.emitted, elapsed_ms);
                tracing::info!(
                    "Task {} completed ({:?}): {} tokens at {:.1} tok/s",
                    task_id,
                    reason,
                    stats.completion_tokens,
                    stats.tokens_per_second
                );
                Event::GenerationCompleted {
                    task_id,
                    reason,
                    text: progress.text,
                    stats,
                }
            }
            Outcome::Cancelled => {
                tracing::info!("Task {} cancelled after {} tokens", task_id, progress.emitted);
                Event::GenerationCancelled {
                    task_id,
                    tokens_emitted: progress.emitted,
                }
            }
            Outcome::Failed(kind, message) => {
                tracing::warn!("Task {} failed ({:?}): {}", task_id, kind, message);
                Event::GenerationFailed {
                    task_id,
                    kind,
                    message,
                }
            }
        };
        self.emitter.emit(event);
    }

    /// Fail the task after the engine panicked mid-run.
    ///
    /// The session is marked failed because its context can no longer be
    /// trusted.
    pub(crate) fn abort_after_panic(&self) {
        self.gate.mark_failed();
        if self.control.finish(TaskState::Failed) {
            self.emitter.emit(Event::GenerationFailed {
                task_id: self.task_id().clone(),
                kind: FailureKind::Engine,
                message: "engine panicked during decode".to_string(),
            });
        }
    }

    /// Fail a task the worker never accepted
    pub(crate) fn reject(&self) {
        self.gate.mark_failed();
        self.control.finish(TaskState::Failed);
    }
}
