//! llamabridge - stream a completion from a local GGUF model
//!
//! Usage: `llamabridge <model.gguf> <prompt>`

use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llamabridge::config::load_config;
use llamabridge::inference::LlamaCppBackend;
use llamabridge::{Bridge, ChatMessage, Event, ModelDescriptor};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("llamabridge=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(model) = args.next() else {
        eprintln!("usage: llamabridge <model.gguf> <prompt>");
        return ExitCode::from(2);
    };
    let prompt = args.collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        eprintln!("usage: llamabridge <model.gguf> <prompt>");
        return ExitCode::from(2);
    }

    info!("Starting llamabridge v{}", env!("CARGO_PKG_VERSION"));

    match run(PathBuf::from(model), prompt).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(model: PathBuf, prompt: String) -> Result<(), Box<dyn Error>> {
    let config = load_config();
    let backend = Arc::new(LlamaCppBackend::from_config(&config));
    let params = config.generation.clone().with_stop_sequence("\nHuman:");

    let (bridge, mut events) = Bridge::with_event_stream(backend, config);
    let session = bridge.load_model(ModelDescriptor::new(model)).await?;
    let task = bridge.generate_chat(&session, &[ChatMessage::user(prompt)], params)?;

    let mut stdout = io::stdout();
    let mut outcome = Ok(());
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                bridge.cancel(&task)?;
                continue;
            }
        };
        let Some(event) = event else { break };
        if event.task_id() != Some(&task) {
            continue;
        }

        match event {
            Event::TokenProduced { token, .. } => {
                write!(stdout, "{token}")?;
                stdout.flush()?;
            }
            Event::GenerationCompleted { reason, stats, .. } => {
                writeln!(stdout)?;
                eprintln!(
                    "[{:?}] {} prompt + {} completion tokens in {} ms ({:.1} tok/s)",
                    reason,
                    stats.prompt_tokens,
                    stats.completion_tokens,
                    stats.elapsed_ms,
                    stats.tokens_per_second
                );
                break;
            }
            Event::GenerationCancelled { tokens_emitted, .. } => {
                writeln!(stdout)?;
                eprintln!("[cancelled after {tokens_emitted} tokens]");
                break;
            }
            Event::GenerationFailed { kind, message, .. } => {
                outcome = Err(format!("generation failed ({kind:?}): {message}").into());
                break;
            }
            _ => {}
        }
    }

    bridge.shutdown().await;
    outcome
}
