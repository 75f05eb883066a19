//! Serialized access to the synthesis process for all turns.
//!
//! `submit` may be called for unit N+1 while unit N is still playing; the
//! worker task processes jobs strictly one at a time against the process.
//! Jobs belonging to a cancelled turn are answered without touching the
//! process, and a clip finished after its turn was cancelled is discarded.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ProcessHandle, SynthesisRequest};
use crate::clip::{AudioClip, TurnId};
use crate::control::ControlState;
use crate::error::SynthesisError;
use crate::segmenter::speech::SpeechFilter;
use crate::segmenter::{SentenceUnit, UnitKind};

struct Job {
    turn: TurnId,
    unit: SentenceUnit,
    speed: f32,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<AudioClip, SynthesisError>>,
}

#[derive(Clone)]
pub struct SynthesisWorker {
    jobs: mpsc::Sender<Job>,
    controls: Arc<ControlState>,
}

impl SynthesisWorker {
    /// Move `handle` into a background task that owns it until every
    /// `SynthesisWorker` clone is dropped.
    pub fn spawn(
        handle: ProcessHandle,
        controls: Arc<ControlState>,
        filter: SpeechFilter,
        queue_depth: usize,
    ) -> Self {
        let (jobs, rx) = mpsc::channel(queue_depth.max(1));
        tokio::spawn(run_worker(handle, filter, rx));
        Self { jobs, controls }
    }

    /// Synthesize one unit. The speed multiplier is sampled now.
    ///
    /// Returns `Cancelled` as soon as `cancel` fires, without waiting for a
    /// request that is already with the process.
    pub async fn submit(
        &self,
        turn: TurnId,
        cancel: &CancellationToken,
        unit: SentenceUnit,
    ) -> Result<AudioClip, SynthesisError> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            turn,
            unit,
            speed: self.controls.speed(),
            cancel: cancel.clone(),
            reply,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SynthesisError::Cancelled),
            sent = self.jobs.send(job) => sent.map_err(|_| SynthesisError::WorkerClosed)?,
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SynthesisError::Cancelled),
            result = rx => result.unwrap_or(Err(SynthesisError::WorkerClosed)),
        }
    }
}

async fn run_worker(mut handle: ProcessHandle, filter: SpeechFilter, mut jobs: mpsc::Receiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let Job {
            turn,
            unit,
            speed,
            cancel,
            reply,
        } = job;
        let result = synthesize_unit(&mut handle, &filter, turn, unit, speed, &cancel).await;
        // the submitter may have moved on (cancelled turn)
        let _ = reply.send(result);
    }

    info!("Synthesis worker stopping");
    handle.shutdown().await;
}

async fn synthesize_unit(
    handle: &mut ProcessHandle,
    filter: &SpeechFilter,
    turn: TurnId,
    unit: SentenceUnit,
    speed: f32,
    cancel: &CancellationToken,
) -> Result<AudioClip, SynthesisError> {
    if cancel.is_cancelled() {
        debug!("{turn} unit #{}: discarded before synthesis", unit.seq);
        return Err(SynthesisError::Cancelled);
    }

    let text = match unit.kind {
        UnitKind::CodePlaceholder => unit.text.clone(),
        UnitKind::Prose => filter.apply(&unit.text),
    };
    if text.is_empty() {
        return Err(SynthesisError::NothingToSay);
    }
    let request = SynthesisRequest { text, speed };

    let t0 = Instant::now();
    let waveform = match handle.request(&request).await {
        Ok(waveform) => waveform,
        Err(e) if e.is_process_fault() => {
            warn!("{turn} unit #{}: {e}", unit.seq);
            handle.restart().await?;
            if cancel.is_cancelled() {
                return Err(SynthesisError::Cancelled);
            }
            handle.request(&request).await.map_err(|retry| {
                warn!("{turn} unit #{}: retry failed: {retry}", unit.seq);
                SynthesisError::Dropped {
                    seq: unit.seq,
                    reason: retry.to_string(),
                }
            })?
        }
        Err(e) => return Err(e),
    };

    if cancel.is_cancelled() {
        debug!("{turn} unit #{}: discarded after synthesis", unit.seq);
        return Err(SynthesisError::Cancelled);
    }

    let clip = AudioClip::new(turn, unit.seq, unit.text, waveform.sample_rate, waveform.samples);
    debug!(
        "{turn} unit #{}: gen={:.0}ms audio={:.1}s speed={speed}",
        clip.seq(),
        t0.elapsed().as_secs_f64() * 1000.0,
        clip.duration().as_secs_f64()
    );
    Ok(clip)
}
