//! Scenario tests driving the bridge against the scripted backend

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use llamabridge::events::EventStream;
use llamabridge::inference::ScriptedBackend;
use llamabridge::{
    Bridge, BridgeConfig, BridgeError, ChatMessage, CompletionReason, Event, FailureKind,
    GenerationParams, ModelDescriptor, ModelLoadError, SessionId, SessionState, TaskId, TaskState,
};

const WAIT: Duration = Duration::from_secs(10);

fn setup(backend: ScriptedBackend) -> (Bridge, EventStream) {
    Bridge::with_event_stream(Arc::new(backend), BridgeConfig::default())
}

fn slow_backend() -> ScriptedBackend {
    ScriptedBackend::new().with_step_delay(Duration::from_millis(10))
}

async fn next_event(events: &mut EventStream) -> Event {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

/// Collect a task's token events up to and including its terminal event
async fn run_to_end(events: &mut EventStream, task: &TaskId) -> (Vec<Event>, Event) {
    let mut tokens = Vec::new();
    loop {
        let event = next_event(events).await;
        if event.task_id() != Some(task) {
            continue;
        }
        if event.is_terminal() {
            return (tokens, event);
        }
        tokens.push(event);
    }
}

/// Wait until `count` tokens of `task` arrived
async fn wait_for_tokens(events: &mut EventStream, task: &TaskId, count: usize) {
    let mut seen = 0;
    while seen < count {
        let event = next_event(events).await;
        if event.task_id() == Some(task) {
            assert!(!event.is_terminal(), "task ended early: {event:?}");
            seen += 1;
        }
    }
}

fn token_indices(tokens: &[Event]) -> Vec<usize> {
    tokens
        .iter()
        .map(|event| match event {
            Event::TokenProduced { index, .. } => *index,
            other => panic!("expected a token event, got {other:?}"),
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_five_tokens_then_completed() {
    let (bridge, mut events) = setup(ScriptedBackend::new());
    let session = bridge
        .load_model(ModelDescriptor::new("m.bin").with_context_size(2048))
        .await
        .unwrap();

    match next_event(&mut events).await {
        Event::ModelLoaded { session_id, model } => {
            assert_eq!(session_id, session);
            assert_eq!(model.context_length, 2048);
        }
        other => panic!("expected ModelLoaded, got {other:?}"),
    }

    let task = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(5))
        .unwrap();
    let (tokens, terminal) = run_to_end(&mut events, &task).await;

    assert_eq!(token_indices(&tokens), vec![0, 1, 2, 3, 4]);
    match terminal {
        Event::GenerationCompleted {
            reason,
            text,
            stats,
            ..
        } => {
            assert_eq!(reason, CompletionReason::MaxTokens);
            assert_eq!(text, " quick brown fox jumps over");
            assert_eq!(stats.prompt_tokens, 1);
            assert_eq!(stats.completion_tokens, 5);
            assert_eq!(stats.total_tokens, 6);
        }
        other => panic!("expected GenerationCompleted, got {other:?}"),
    }

    assert_eq!(bridge.task_state(&task).unwrap(), TaskState::Completed);
    assert_eq!(bridge.session(&session).unwrap().state, SessionState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_generate_is_busy() {
    let (bridge, mut events) = setup(slow_backend());
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();

    let first = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(500))
        .unwrap();
    let err = bridge
        .generate(&session, "Again", GenerationParams::default())
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::SessionBusy {
            session_id: session.clone(),
            active_task: Some(first.clone()),
        }
    );

    bridge.cancel(&first).unwrap();
    let (_, terminal) = run_to_end(&mut events, &first).await;
    assert!(matches!(terminal, Event::GenerationCancelled { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_mid_generation() {
    let (bridge, mut events) = setup(slow_backend());
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();
    let task = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(1000))
        .unwrap();

    wait_for_tokens(&mut events, &task, 3).await;
    bridge.cancel(&task).unwrap();

    let (late_tokens, terminal) = run_to_end(&mut events, &task).await;
    match terminal {
        Event::GenerationCancelled { tokens_emitted, .. } => {
            // at most the in-flight step finishes after the request
            assert_eq!(tokens_emitted, 3 + late_tokens.len());
            assert!(tokens_emitted < 1000);
        }
        other => panic!("expected GenerationCancelled, got {other:?}"),
    }

    // nothing for this task after its terminal event
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Some(event) = events.try_recv() {
        assert_ne!(event.task_id(), Some(&task), "event after terminal: {event:?}");
    }

    assert_eq!(bridge.task_state(&task).unwrap(), TaskState::Cancelled);
    assert_eq!(bridge.session(&session).unwrap().state, SessionState::Ready);

    let next = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(2))
        .unwrap();
    let (_, terminal) = run_to_end(&mut events, &next).await;
    assert!(matches!(terminal, Event::GenerationCompleted { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_is_idempotent_after_terminal() {
    let (bridge, mut events) = setup(ScriptedBackend::new());
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();
    let task = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(2))
        .unwrap();
    run_to_end(&mut events, &task).await;

    bridge.cancel(&task).unwrap();
    bridge.cancel(&task).unwrap();
    assert_eq!(bridge.task_state(&task).unwrap(), TaskState::Completed);

    let err = bridge.cancel(&TaskId::from("no-such-task")).unwrap_err();
    assert_eq!(err.code(), "NotFound");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unload_requires_idle_session() {
    let backend = slow_backend();
    let stats = backend.stats();
    let (bridge, mut events) = setup(backend);
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();
    let task = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(1000))
        .unwrap();

    let err = bridge.unload_model(&session).await.unwrap_err();
    assert!(err.is_busy());

    bridge.cancel(&task).unwrap();
    run_to_end(&mut events, &task).await;

    bridge.unload_model(&session).await.unwrap();
    assert!(bridge.session(&session).unwrap_err().is_not_found());
    assert!(!bridge.is_model_loaded(&session));
    assert_eq!(stats.unloads(), 1);

    loop {
        if let Event::ModelUnloaded { session_id } = next_event(&mut events).await {
            assert_eq!(session_id, session);
            break;
        }
    }

    // late cancel of a task from the unloaded session is still a no-op
    bridge.cancel(&task).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_fault_fails_only_the_task() {
    let (bridge, mut events) = setup(ScriptedBackend::new().with_fault_at_step(2));
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();

    let task = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(10))
        .unwrap();
    let (tokens, terminal) = run_to_end(&mut events, &task).await;
    assert_eq!(tokens.len(), 2);
    match terminal {
        Event::GenerationFailed { kind, .. } => assert_eq!(kind, FailureKind::Engine),
        other => panic!("expected GenerationFailed, got {other:?}"),
    }
    assert_eq!(bridge.session(&session).unwrap().state, SessionState::Ready);

    let retry = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(3))
        .unwrap();
    let (tokens, terminal) = run_to_end(&mut events, &retry).await;
    assert_eq!(tokens.len(), 3);
    assert!(matches!(terminal, Event::GenerationCompleted { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_overflow() {
    let (bridge, mut events) = setup(ScriptedBackend::new());
    let session = bridge
        .load_model(ModelDescriptor::new("m.bin").with_context_size(4))
        .await
        .unwrap();

    let task = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(100))
        .unwrap();
    let (tokens, terminal) = run_to_end(&mut events, &task).await;
    // one prompt token plus four generated ones would overflow
    assert_eq!(tokens.len(), 4);
    assert!(matches!(
        terminal,
        Event::GenerationFailed {
            kind: FailureKind::ContextOverflow,
            ..
        }
    ));
    assert_eq!(bridge.session(&session).unwrap().state, SessionState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backpressure_fails_task() {
    let config = BridgeConfig {
        event_queue_depth: 4,
        ..Default::default()
    };
    let (bridge, mut events) = Bridge::with_event_stream(Arc::new(ScriptedBackend::new()), config);
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();

    // nobody reads the stream while the task runs
    let task = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(200))
        .unwrap();
    timeout(WAIT, async {
        while !bridge.task_state(&task).unwrap().is_terminal() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task never finished");

    let (tokens, terminal) = run_to_end(&mut events, &task).await;
    assert!(tokens.len() < 200);
    assert_eq!(token_indices(&tokens), (0..tokens.len()).collect::<Vec<_>>());
    assert!(matches!(
        terminal,
        Event::GenerationFailed {
            kind: FailureKind::BackpressureExceeded,
            ..
        }
    ));
    assert_eq!(bridge.task_state(&task).unwrap(), TaskState::Failed);
    assert_eq!(bridge.session(&session).unwrap().state, SessionState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_sequence() {
    let (bridge, mut events) = setup(ScriptedBackend::new());
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();
    let params = GenerationParams::default()
        .with_max_tokens(50)
        .with_stop_sequence(" fox");

    let task = bridge.generate(&session, "Hello", params).unwrap();
    let (tokens, terminal) = run_to_end(&mut events, &task).await;
    // the token completing the stop sequence is still streamed
    assert_eq!(tokens.len(), 3);
    match terminal {
        Event::GenerationCompleted { reason, text, .. } => {
            assert_eq!(reason, CompletionReason::StopSequence);
            assert_eq!(text, " quick brown");
        }
        other => panic!("expected GenerationCompleted, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_of_sequence() {
    let (bridge, mut events) = setup(ScriptedBackend::new().with_eos_after(4));
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();
    let task = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(50))
        .unwrap();

    let (tokens, terminal) = run_to_end(&mut events, &task).await;
    assert_eq!(tokens.len(), 4);
    assert!(matches!(
        terminal,
        Event::GenerationCompleted {
            reason: CompletionReason::EndOfSequence,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_error_creates_no_session() {
    let backend = ScriptedBackend::new()
        .with_load_error(ModelLoadError::FileNotFound("missing.gguf".into()));
    let (bridge, _events) = setup(backend);

    let err = bridge
        .load_model(ModelDescriptor::new("missing.gguf"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ModelLoadError");
    assert!(bridge.sessions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_generates_admit_one() {
    let backend = slow_backend();
    let stats = backend.stats();
    let (bridge, mut events) = setup(backend);
    let bridge = Arc::new(bridge);
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let bridge = Arc::clone(&bridge);
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            bridge.generate(&session, "Hello", GenerationParams::default().with_max_tokens(5))
        }));
    }

    let mut admitted = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(task) => admitted.push(task),
            Err(e) => assert!(e.is_busy(), "unexpected error: {e}"),
        }
    }
    assert_eq!(admitted.len(), 1);

    run_to_end(&mut events, &admitted[0]).await;
    assert_eq!(stats.peak_concurrent_steps(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sessions_run_independently() {
    let (bridge, mut events) = setup(slow_backend());
    let a = bridge.load_model(ModelDescriptor::new("a.bin")).await.unwrap();
    let b = bridge.load_model(ModelDescriptor::new("b.bin")).await.unwrap();

    let params = GenerationParams::default().with_max_tokens(4);
    let task_a = bridge.generate(&a, "Hello", params.clone()).unwrap();
    let task_b = bridge.generate(&b, "Hello", params).unwrap();

    let mut done = Vec::new();
    while done.len() < 2 {
        let event = next_event(&mut events).await;
        if let Event::GenerationCompleted { task_id, .. } = event {
            done.push(task_id);
        }
    }
    assert!(done.contains(&task_a));
    assert!(done.contains(&task_b));
    assert_eq!(bridge.sessions().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_panic_fails_session() {
    let (bridge, mut events) = setup(ScriptedBackend::new().with_panic_at_step(1));
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();
    let task = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(10))
        .unwrap();

    let (_, terminal) = run_to_end(&mut events, &task).await;
    assert!(matches!(
        terminal,
        Event::GenerationFailed {
            kind: FailureKind::Engine,
            ..
        }
    ));
    assert_eq!(bridge.session(&session).unwrap().state, SessionState::Failed);

    let err = bridge
        .generate(&session, "Hello", GenerationParams::default())
        .unwrap_err();
    assert_eq!(err.code(), "SessionUnavailable");

    bridge.unload_model(&session).await.unwrap();
    assert!(bridge.session(&session).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_after_timeout() {
    let (bridge, mut events) = setup(slow_backend());
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();
    let task = bridge
        .generate(&session, "Hello", GenerationParams::default().with_max_tokens(10_000))
        .unwrap();

    bridge
        .cancel_after(&task, Duration::from_millis(50))
        .unwrap();
    let (_, terminal) = run_to_end(&mut events, &task).await;
    assert!(matches!(terminal, Event::GenerationCancelled { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generate_chat() {
    let (bridge, mut events) = setup(ScriptedBackend::new());
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();
    let messages = [
        ChatMessage::user("Hi"),
        ChatMessage::assistant("Hello"),
        ChatMessage::user("Tell me about the fox"),
    ];

    let task = bridge
        .generate_chat(&session, &messages, GenerationParams::default().with_max_tokens(3))
        .unwrap();
    let (tokens, terminal) = run_to_end(&mut events, &task).await;
    assert_eq!(tokens.len(), 3);
    match terminal {
        Event::GenerationCompleted { stats, .. } => {
            // "Human: Hi  Assistant: Hello  Human: Tell me about the fox  Assistant:"
            assert_eq!(stats.prompt_tokens, 11);
        }
        other => panic!("expected GenerationCompleted, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_arguments() {
    let (bridge, _events) = setup(ScriptedBackend::new());
    let session = bridge.load_model(ModelDescriptor::new("m.bin")).await.unwrap();

    for (prompt, params) in [
        ("", GenerationParams::default()),
        ("Hello", GenerationParams::default().with_max_tokens(0)),
        ("Hello", GenerationParams::default().with_temperature(-1.0)),
        ("Hello", GenerationParams::default().with_temperature(f32::NAN)),
    ] {
        let err = bridge.generate(&session, prompt, params).unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }
    // rejected calls leave the session untouched
    assert_eq!(bridge.session(&session).unwrap().state, SessionState::Ready);

    let err = bridge
        .generate(&SessionId::from("ghost"), "Hello", GenerationParams::default())
        .unwrap_err();
    assert!(err.is_not_found());

    let err = bridge
        .load_model_as(session.clone(), ModelDescriptor::new("m.bin"))
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::SessionExists(session));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_cancels_and_unloads() {
    let backend = slow_backend();
    let stats = backend.stats();
    let (bridge, mut events) = setup(backend);
    let busy = bridge.load_model(ModelDescriptor::new("a.bin")).await.unwrap();
    bridge.load_model(ModelDescriptor::new("b.bin")).await.unwrap();

    let task = bridge
        .generate(&busy, "Hello", GenerationParams::default().with_max_tokens(10_000))
        .unwrap();
    timeout(WAIT, bridge.shutdown()).await.expect("shutdown hung");

    assert!(bridge.sessions().is_empty());
    assert_eq!(stats.loads(), 2);
    assert_eq!(stats.unloads(), 2);

    let (_, terminal) = run_to_end(&mut events, &task).await;
    assert!(matches!(terminal, Event::GenerationCancelled { .. }));
    assert_eq!(
        bridge.generate(&busy, "Hello", GenerationParams::default()),
        Err(BridgeError::ShuttingDown)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_pending_load() {
    let backend = ScriptedBackend::new().with_load_delay(Duration::from_millis(300));
    let stats = backend.stats();
    let (bridge, _events) = setup(backend);
    let bridge = Arc::new(bridge);

    let loading = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.load_model(ModelDescriptor::new("slow.bin")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.sessions().len(), 1);

    timeout(WAIT, bridge.shutdown()).await.expect("shutdown hung");
    let result = timeout(WAIT, loading).await.expect("load hung").unwrap();

    assert_eq!(result, Err(BridgeError::ShuttingDown));
    assert!(bridge.sessions().is_empty());
    assert_eq!(stats.loads(), 1);
    assert_eq!(stats.unloads(), 1);
}
