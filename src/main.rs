//! doris-voice: streaming text-to-speech for a chat assistant.

mod api;
mod clip;
mod config;
mod control;
mod error;
mod greeting;
mod notifier;
mod orchestrator;
mod playback;
mod segmenter;
mod source;
mod synthesis;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use control::ControlState;
use orchestrator::{Orchestrator, TurnEvent};
use playback::{PlaybackQueue, RodioOutput};
use segmenter::speech::SpeechFilter;
use source::{fragment_channel, OllamaSource, StaticSource, TextSource};
use synthesis::piper::PiperBackend;
use synthesis::{ProcessHandle, RestartPolicy, SynthesisWorker};

#[derive(Parser, Debug)]
#[command(name = "doris-voice", about = "Streaming speech output for chat replies")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control API until interrupted (default)
    Serve,
    /// Speak the given text and exit
    Say { text: String },
    /// Stream an Ollama completion for the prompt and speak it
    Ask { prompt: String },
    /// Speak stdin as it arrives, one fragment per line
    Stdin,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug,rodio=info,hyper=info,reqwest=info")
    } else {
        EnvFilter::new("info,rodio=warn,hyper=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("doris-voice starting");

    let config = config::Config::load(args.config.as_deref());
    info!(
        "Synthesis: `{}` model={:?}, lookahead={}",
        config.synthesis.command, config.synthesis.model_path, config.playback.lookahead
    );

    let controls = Arc::new(ControlState::new(config.controls.volume, config.controls.speed));

    let backend = Arc::new(PiperBackend::new(&config.synthesis));
    let handle = ProcessHandle::start(backend, RestartPolicy::from_config(&config.synthesis)).await?;
    let worker = SynthesisWorker::spawn(
        handle,
        controls.clone(),
        SpeechFilter::new(config.speech.clone()),
        config.synthesis.queue_depth,
    );

    let (playback, playback_events) = PlaybackQueue::start(
        RodioOutput::open_default,
        controls.clone(),
        config.playback.poll_interval(),
    )?;

    let orchestrator = Orchestrator::new(worker, playback.clone(), playback_events, controls, &config);
    tokio::spawn(notifier::Notifier::new(config.feedback.notifications).watch(orchestrator.subscribe()));

    let result = match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&orchestrator, &config).await,
        Command::Say { text } => speak_to_end(&orchestrator, StaticSource::text(text)).await,
        Command::Ask { prompt } => {
            let source = OllamaSource::new(&config.ollama, &prompt)?;
            speak_to_end(&orchestrator, source).await
        }
        Command::Stdin => {
            let (tx, source) = fragment_channel(config.segmenter.unit_channel_depth);
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !tx.send(format!("{line}\n")).await {
                        break;
                    }
                }
            });
            speak_to_end(&orchestrator, source).await
        }
    };

    playback.shutdown();
    info!("doris-voice stopped");
    result
}

async fn serve(orchestrator: &Orchestrator, config: &config::Config) -> Result<(), Box<dyn std::error::Error>> {
    if config.api.enabled {
        let state = api::ApiState {
            orchestrator: orchestrator.clone(),
            ollama: config.ollama.clone(),
        };
        api::start_api(state, config.api.port).await;
    }

    if config.greeting.enabled {
        let text = greeting::greeting(&config.greeting.user_name);
        info!("Greeting: {text}");
        orchestrator.start_turn(StaticSource::text(text));
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    orchestrator.cancel_turn();
    Ok(())
}

/// Speak one turn and wait for it to end (or for Ctrl-C).
async fn speak_to_end<S: TextSource + 'static>(
    orchestrator: &Orchestrator,
    source: S,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = orchestrator.subscribe();
    let turn = orchestrator.start_turn(source);

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                orchestrator.cancel_turn();
                return Ok(());
            }
        };

        match event {
            Ok(TurnEvent::Completed(t)) | Ok(TurnEvent::Cancelled(t)) if t == turn => return Ok(()),
            Ok(TurnEvent::Failed { turn: t, reason }) if t == turn => return Err(reason.into()),
            Ok(TurnEvent::UnitDropped { seq, reason, .. }) => warn!("Skipped sentence #{seq}: {reason}"),
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}
