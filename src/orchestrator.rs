//! Turn lifecycle: one text stream in, ordered speech out.
//!
//! Each turn runs two stages connected by a bounded channel:
//! - segment: source fragments → `SentenceSegmenter` → units
//! - synthesize: units → `SynthesisWorker` → `PlaybackQueue`
//!
//! The synthesize stage stays at most `lookahead` units ahead of the clip
//! being played. Starting a turn cancels the previous one; cancellation
//! never waits for an in-flight synthesis request.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clip::{AudioClip, TurnId};
use crate::config::{Config, SegmenterConfig};
use crate::control::ControlState;
use crate::error::SynthesisError;
use crate::playback::{PlaybackEvent, PlaybackQueue};
use crate::segmenter::{SentenceSegmenter, SentenceUnit};
use crate::source::TextSource;
use crate::synthesis::SynthesisWorker;

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Started(TurnId),
    /// A unit failed after its retry and was skipped; the turn continues.
    UnitDropped { turn: TurnId, seq: u64, reason: String },
    Completed(TurnId),
    Cancelled(TurnId),
    Failed { turn: TurnId, reason: String },
}

enum TurnOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

struct ActiveTurn {
    id: TurnId,
    cancel: CancellationToken,
}

struct Inner {
    worker: SynthesisWorker,
    playback: PlaybackQueue,
    controls: Arc<ControlState>,
    segmenter: SegmenterConfig,
    lookahead: u64,
    dump_dir: Option<PathBuf>,
    active: Mutex<Option<ActiveTurn>>,
    next_turn: AtomicU64,
    events: broadcast::Sender<TurnEvent>,
}

impl Inner {
    fn emit(&self, event: TurnEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Cancel a turn that has just been taken out of the active slot. Callers
    /// hold the `active` lock across the take and this call, so the playback
    /// generation always matches the active turn.
    fn stop(&self, active: ActiveTurn) {
        active.cancel.cancel();
        self.playback.cancel_all();
    }

    /// Run `end` on `turn` if it is still the active one, under the lock.
    fn end_turn(&self, turn: TurnId, end: impl FnOnce(ActiveTurn)) {
        let mut active = self.active.lock().unwrap();
        if active.as_ref().is_some_and(|a| a.id == turn) {
            if let Some(current) = active.take() {
                end(current);
            }
        }
    }

    fn complete(&self, turn: TurnId) {
        self.end_turn(turn, |_| {
            info!("{turn} completed");
            self.emit(TurnEvent::Completed(turn));
        });
    }

    fn fail(&self, turn: TurnId, reason: String) {
        self.end_turn(turn, |active| {
            self.stop(active);
            warn!("{turn} failed: {reason}");
            self.emit(TurnEvent::Failed { turn, reason });
        });
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        worker: SynthesisWorker,
        playback: PlaybackQueue,
        playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
        controls: Arc<ControlState>,
        config: &Config,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            worker,
            playback,
            controls,
            segmenter: config.segmenter.clone(),
            lookahead: config.playback.lookahead,
            dump_dir: config.playback.dump_dir.clone(),
            active: Mutex::new(None),
            next_turn: AtomicU64::new(1),
            events,
        });

        tokio::spawn(monitor_playback(Arc::downgrade(&inner), playback_events));

        Self { inner }
    }

    /// Cancel whatever is playing and start speaking `source`.
    pub fn start_turn<S: TextSource + 'static>(&self, source: S) -> TurnId {
        let cancel = CancellationToken::new();
        let id = {
            let mut active = self.inner.active.lock().unwrap();
            if let Some(previous) = active.take() {
                self.cancelled(previous);
            }

            let id = TurnId(self.inner.next_turn.fetch_add(1, Ordering::Relaxed));
            self.inner.playback.begin_turn(id);
            *active = Some(ActiveTurn {
                id,
                cancel: cancel.clone(),
            });
            info!("{id} started");
            self.inner.emit(TurnEvent::Started(id));
            id
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match run_turn(&inner, id, cancel, Box::new(source)).await {
                TurnOutcome::Completed => inner.complete(id),
                TurnOutcome::Failed(reason) => inner.fail(id, reason),
                TurnOutcome::Cancelled => debug!("{id} stages stopped"),
            }
        });

        id
    }

    /// Stop the active turn immediately. Returns the cancelled turn, if any.
    pub fn cancel_turn(&self) -> Option<TurnId> {
        let mut active = self.inner.active.lock().unwrap();
        let previous = active.take()?;
        let id = previous.id;
        self.cancelled(previous);
        Some(id)
    }

    fn cancelled(&self, previous: ActiveTurn) {
        let id = previous.id;
        self.inner.stop(previous);
        info!("{id} cancelled");
        self.inner.emit(TurnEvent::Cancelled(id));
    }

    pub fn active_turn(&self) -> Option<TurnId> {
        self.inner.active.lock().unwrap().as_ref().map(|a| a.id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.inner.events.subscribe()
    }

    pub fn controls(&self) -> &Arc<ControlState> {
        &self.inner.controls
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.inner.playback
    }
}

async fn monitor_playback(
    inner: std::sync::Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<PlaybackEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            PlaybackEvent::DeviceFailed { turn, reason } => {
                inner.fail(turn, format!("audio device failed: {reason}"));
            }
            PlaybackEvent::Started { turn, seq } => debug!("{turn} #{seq} playing"),
            PlaybackEvent::Finished { .. } | PlaybackEvent::Stopped { .. } => {}
        }
    }
}

async fn run_turn(
    inner: &Inner,
    turn: TurnId,
    cancel: CancellationToken,
    source: Box<dyn TextSource>,
) -> TurnOutcome {
    let (units_tx, mut units) = mpsc::channel(inner.segmenter.unit_channel_depth.max(1));
    let segmenter = SentenceSegmenter::new(&inner.segmenter);
    tokio::spawn(segment_stage(turn, source, segmenter, units_tx, cancel.clone()));

    let mut progress = inner.playback.progress();
    let mut total = 0;

    loop {
        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TurnOutcome::Cancelled,
            unit = units.recv() => unit,
        };
        let Some(unit) = unit else {
            break;
        };
        let seq = unit.seq;
        total = seq + 1;

        let lookahead = inner.lookahead;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return TurnOutcome::Cancelled,
            _ = progress.wait_for(|p| p.turn != Some(turn) || seq <= p.next_seq + lookahead) => {}
        }

        match inner.worker.submit(turn, &cancel, unit).await {
            Ok(clip) => {
                if let Some(dir) = &inner.dump_dir {
                    dump_clip(dir, &clip);
                }
                inner.playback.enqueue(clip);
            }
            Err(SynthesisError::Cancelled) => return TurnOutcome::Cancelled,
            Err(e) if e.is_unrecoverable() => return TurnOutcome::Failed(e.to_string()),
            Err(SynthesisError::NothingToSay) => {
                debug!("{turn} #{seq}: nothing to say, skipped");
                inner.playback.skip(turn, seq);
            }
            Err(e) => {
                warn!("{turn} #{seq} dropped: {e}");
                inner.playback.skip(turn, seq);
                inner.emit(TurnEvent::UnitDropped {
                    turn,
                    seq,
                    reason: e.to_string(),
                });
            }
        }
    }

    if cancel.is_cancelled() {
        return TurnOutcome::Cancelled;
    }
    debug!("{turn}: all {total} unit(s) handed to playback");

    let done = inner.playback.finish(turn, total);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => TurnOutcome::Cancelled,
        played = done => match played {
            Ok(()) => TurnOutcome::Completed,
            // the queue retired the turn (device failure or cancellation)
            Err(_) => TurnOutcome::Cancelled,
        },
    }
}

async fn segment_stage(
    turn: TurnId,
    mut source: Box<dyn TextSource>,
    mut segmenter: SentenceSegmenter,
    units: mpsc::Sender<SentenceUnit>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                segmenter.reset();
                return;
            }
            next = source.next_fragment() => next,
        };

        match next {
            None => break,
            Some(Ok(fragment)) => {
                if fragment.is_empty() {
                    continue;
                }
                for unit in segmenter.feed(&fragment) {
                    if !forward(&units, unit, &cancel).await {
                        segmenter.reset();
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!("{turn}: text source failed, speaking what arrived: {e}");
                break;
            }
        }
    }

    if let Some(unit) = segmenter.flush() {
        forward(&units, unit, &cancel).await;
    }
}

async fn forward(
    units: &mpsc::Sender<SentenceUnit>,
    unit: SentenceUnit,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = units.send(unit) => sent.is_ok(),
    }
}

fn dump_clip(dir: &std::path::Path, clip: &AudioClip) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("Cannot create dump dir {}: {e}", dir.display());
        return;
    }
    let path = dir.join(format!("{}-{:03}.wav", clip.turn(), clip.seq()));
    match clip.write_wav(&path) {
        Ok(()) => debug!("Saved {}", path.display()),
        Err(e) => warn!("Failed to save {}: {e}", path.display()),
    }
}
