//! Piper-compatible synthesis subprocess.
//!
//! Protocol (one request at a time):
//! - stdin: one JSON object per line, `{"text", "output_file", "length_scale"}`
//! - stdout: one line per request holding the path of the WAV it wrote
//!
//! EOF on stdout means the process died. A reply that does not name a
//! readable WAV is a per-request failure. stderr goes to the debug log.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use super::{SynthesisBackend, SynthesisProcess, SynthesisRequest, Waveform};
use crate::config::SynthesisConfig;
use crate::error::SynthesisError;

#[derive(Serialize)]
struct PiperRequest<'a> {
    text: &'a str,
    output_file: &'a Path,
    length_scale: f32,
}

/// Piper's `length_scale` is inverse duration and perceptually damped, so
/// the multiplier is raised to 1.5 before inverting.
pub fn length_scale(speed: f32) -> f32 {
    1.0 / speed.clamp(0.1, 5.0).powf(1.5)
}

fn request_line(request: &SynthesisRequest, output_file: &Path) -> Result<String, SynthesisError> {
    let body = PiperRequest {
        text: &request.text,
        output_file,
        length_scale: length_scale(request.speed),
    };
    let mut line = serde_json::to_string(&body)
        .map_err(|e| SynthesisError::Rejected(format!("unencodable request: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Decode a WAV file into mono f32 samples.
pub fn read_wav(path: &Path) -> Result<Waveform, SynthesisError> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| SynthesisError::Decode(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| SynthesisError::Decode(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|s| s as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(|e| SynthesisError::Decode(e.to_string()))?
        }
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(Waveform {
        samples,
        sample_rate: spec.sample_rate,
    })
}

pub struct PiperBackend {
    command: String,
    args: Vec<String>,
    model_path: String,
    output_dir: PathBuf,
    counter: Arc<AtomicU64>,
}

impl PiperBackend {
    pub fn new(config: &SynthesisConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            model_path: config.model_path.clone(),
            output_dir: config.output_dir(),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    fn spawn_error(&self, reason: impl ToString) -> SynthesisError {
        SynthesisError::Spawn {
            command: self.command.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl SynthesisBackend for PiperBackend {
    fn name(&self) -> &str {
        &self.command
    }

    async fn spawn(&self) -> Result<Box<dyn SynthesisProcess>, SynthesisError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| self.spawn_error(format!("output dir {}: {e}", self.output_dir.display())))?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if !self.model_path.is_empty() {
            cmd.arg("--model").arg(&self.model_path);
        }
        cmd.arg("--output_dir")
            .arg(&self.output_dir)
            .arg("--json-input")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let stdin = child.stdin.take().ok_or_else(|| self.spawn_error("stdin not captured"))?;
        let stdout = child.stdout.take().ok_or_else(|| self.spawn_error("stdout not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            let pid = child.id().unwrap_or_default();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("synthesis[{pid}]: {line}");
                }
            });
        }

        debug!("Spawned `{}` (pid {:?})", self.command, child.id());

        Ok(Box::new(PiperProcess {
            child,
            stdin,
            replies: BufReader::new(stdout).lines(),
            output_dir: self.output_dir.clone(),
            counter: self.counter.clone(),
        }))
    }
}

struct PiperProcess {
    child: Child,
    stdin: ChildStdin,
    replies: Lines<BufReader<ChildStdout>>,
    output_dir: PathBuf,
    counter: Arc<AtomicU64>,
}

impl PiperProcess {
    fn exit_reason(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => status.to_string(),
            Ok(None) => "stdout closed".into(),
            Err(e) => e.to_string(),
        }
    }
}

#[async_trait]
impl SynthesisProcess for PiperProcess {
    async fn synthesize(&mut self, request: &SynthesisRequest) -> Result<Waveform, SynthesisError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let output_file = self
            .output_dir
            .join(format!("clip-{}-{n}.wav", std::process::id()));

        let line = request_line(request, &output_file)?;
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let Some(reply) = self.replies.next_line().await? else {
            return Err(SynthesisError::Crashed(self.exit_reason()));
        };

        let reply = reply.trim();
        let path = PathBuf::from(reply);
        if reply.is_empty() || !path.is_file() {
            return Err(SynthesisError::Rejected(format!("no audio written (reply: {reply:?})")));
        }

        let decode_path = path.clone();
        let waveform = tokio::task::spawn_blocking(move || read_wav(&decode_path))
            .await
            .map_err(|e| SynthesisError::Decode(e.to_string()))??;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Could not remove {}: {e}", path.display());
        }

        Ok(waveform)
    }

    async fn shutdown(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}
