//! Ownership of the single synthesis process, including crash recovery.
//!
//! The handle is created once at startup and moved into the worker task.
//! A process that crashes, times out or breaks its pipes is discarded and
//! respawned with exponential backoff, with a bounded number of restarts
//! inside a sliding window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::{SynthesisBackend, SynthesisProcess, SynthesisRequest, Waveform};
use crate::config::SynthesisConfig;
use crate::error::SynthesisError;

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: Duration::from_secs(config.restart_window_secs),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            request_timeout: config.request_timeout(),
        }
    }

    /// Delay before the `attempt`-th restart in the current window (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

pub struct ProcessHandle {
    backend: Arc<dyn SynthesisBackend>,
    process: Option<Box<dyn SynthesisProcess>>,
    policy: RestartPolicy,
    restarts: VecDeque<Instant>,
    instance: u64,
}

impl ProcessHandle {
    /// Spawn the process up front so the first sentence does not pay for it.
    pub async fn start(
        backend: Arc<dyn SynthesisBackend>,
        policy: RestartPolicy,
    ) -> Result<Self, SynthesisError> {
        let t0 = Instant::now();
        let process = backend.spawn().await?;
        info!(
            "Synthesis process `{}` started in {}ms",
            backend.name(),
            t0.elapsed().as_millis()
        );

        Ok(Self {
            backend,
            process: Some(process),
            policy,
            restarts: VecDeque::new(),
            instance: 1,
        })
    }

    /// Number of process instances spawned so far.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Send one request. Process faults leave the handle without a process;
    /// the next request or an explicit `restart` brings one back.
    pub async fn request(&mut self, request: &SynthesisRequest) -> Result<Waveform, SynthesisError> {
        if self.process.is_none() {
            self.restart().await?;
        }
        let Some(process) = self.process.as_mut() else {
            return Err(SynthesisError::Crashed("no process available".into()));
        };

        let timeout = self.policy.request_timeout;
        let outcome = tokio::time::timeout(timeout, process.synthesize(request)).await;

        match outcome {
            Ok(Ok(waveform)) => Ok(waveform),
            Ok(Err(e)) => {
                if e.is_process_fault() {
                    self.discard().await;
                }
                Err(e)
            }
            Err(_) => {
                warn!("Synthesis request exceeded {timeout:?}, killing process");
                self.discard().await;
                Err(SynthesisError::Timeout(timeout))
            }
        }
    }

    /// Replace the current process with a fresh one.
    pub async fn restart(&mut self) -> Result<(), SynthesisError> {
        self.discard().await;

        loop {
            let now = Instant::now();
            while let Some(&at) = self.restarts.front() {
                if now.duration_since(at) > self.policy.window {
                    self.restarts.pop_front();
                } else {
                    break;
                }
            }

            if self.restarts.len() >= self.policy.max_restarts as usize {
                return Err(SynthesisError::RestartLimit {
                    restarts: self.restarts.len(),
                    window: self.policy.window,
                });
            }

            let attempt = self.restarts.len() as u32;
            let delay = self.policy.backoff(attempt);
            warn!(
                "Restarting synthesis process in {delay:?} (restart {}/{})",
                attempt + 1,
                self.policy.max_restarts
            );
            tokio::time::sleep(delay).await;
            self.restarts.push_back(Instant::now());

            match self.backend.spawn().await {
                Ok(process) => {
                    self.process = Some(process);
                    self.instance += 1;
                    info!("Synthesis process instance #{} running", self.instance);
                    return Ok(());
                }
                Err(e) => warn!("Synthesis process failed to start: {e}"),
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.discard().await;
    }

    async fn discard(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.shutdown().await;
        }
    }
}
