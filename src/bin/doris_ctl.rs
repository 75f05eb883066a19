//! doris-ctl: command-line client for the doris-voice control API.
//!
//! Talks to a running `doris-voice serve` over HTTP and prints the JSON
//! reply. Exits non-zero if the service is unreachable or reports an error.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "doris-ctl", about = "Control a running doris-voice service")]
struct Args {
    /// Control API port
    #[arg(short, long, default_value_t = 8768)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show playback state and controls
    Status,
    /// Speak text, interrupting anything already playing
    Say { text: Vec<String> },
    /// Ask the language model and speak the streamed answer
    Ask { prompt: Vec<String> },
    /// Stop speaking now
    Stop,
    /// Set volume (0-100)
    Volume { volume: i64 },
    /// Set speed multiplier (snapped to 0.25 steps), or a level 0-9 with --level
    Speed {
        value: f32,
        #[arg(long)]
        level: bool,
    },
}

#[derive(Serialize)]
struct SpeakRequest {
    text: String,
}

#[derive(Serialize)]
struct AskRequest {
    prompt: String,
}

#[derive(Serialize)]
struct VolumeRequest {
    volume: i64,
}

#[derive(Serialize)]
struct SpeedRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    level: Option<u8>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let base = format!("http://127.0.0.1:{}", args.port);

    let client = Client::builder()
        .connect_timeout(Duration::from_millis(300))
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| Client::new());

    let request = match args.command {
        Command::Status => client.get(format!("{base}/status")),
        Command::Say { text } => client
            .post(format!("{base}/speak"))
            .json(&SpeakRequest { text: text.join(" ") }),
        Command::Ask { prompt } => client
            .post(format!("{base}/ask"))
            .json(&AskRequest { prompt: prompt.join(" ") }),
        Command::Stop => client.post(format!("{base}/cancel")),
        Command::Volume { volume } => client
            .post(format!("{base}/volume"))
            .json(&VolumeRequest { volume }),
        Command::Speed { value, level } => {
            let body = if level {
                SpeedRequest {
                    speed: None,
                    level: Some(value.clamp(0.0, 9.0) as u8),
                }
            } else {
                SpeedRequest {
                    speed: Some(value),
                    level: None,
                }
            };
            client.post(format!("{base}/speed")).json(&body)
        }
    };

    let reply = match request.send().await {
        Ok(resp) => resp.json::<Value>().await,
        Err(e) => {
            eprintln!("doris-voice is not reachable on {base}: {e}");
            return ExitCode::FAILURE;
        }
    };

    match reply {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string()));
            if body["status"] == "error" {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("Unexpected reply: {e}");
            ExitCode::FAILURE
        }
    }
}
