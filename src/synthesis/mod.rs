//! Speech synthesis against one long-lived backend process.
//!
//! Components:
//! - `process`: `ProcessHandle`, the owned process slot with restart policy
//! - `worker`: `SynthesisWorker`, serializes requests from all turns
//! - `piper`: Piper-compatible subprocess backend (JSON lines in, WAV paths out)

pub mod piper;
pub mod process;
pub mod worker;

use async_trait::async_trait;

use crate::error::SynthesisError;

pub use process::{ProcessHandle, RestartPolicy};
pub use worker::SynthesisWorker;

/// Cleaned text plus the speed multiplier sampled at submit time.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub speed: f32,
}

#[derive(Debug, Clone)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Something that can start synthesis processes.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn spawn(&self) -> Result<Box<dyn SynthesisProcess>, SynthesisError>;
}

/// A running synthesis process. Not assumed to handle concurrent requests.
#[async_trait]
pub trait SynthesisProcess: Send {
    async fn synthesize(&mut self, request: &SynthesisRequest) -> Result<Waveform, SynthesisError>;

    async fn shutdown(&mut self);
}
