//! Ordered, cancellable playback of synthesized clips.
//!
//! A dedicated thread owns the audio device for the lifetime of the queue.
//! Clips may arrive out of order; they are held in a reorder buffer and
//! played strictly by `seq`, one at a time. A seq that never arrives blocks
//! later ones until it is explicitly skipped.

pub mod rodio_out;

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::clip::{AudioClip, TurnId};
use crate::control::ControlState;
use crate::error::PlaybackError;

pub use rodio_out::RodioOutput;

/// How long a clip may run past its own length before the device is
/// considered gone.
const STALL_GRACE: Duration = Duration::from_secs(2);

/// An audio device that can start one clip at a time.
pub trait AudioOutput {
    fn play(&mut self, clip: &AudioClip, gain: f32) -> Result<Box<dyn ActivePlayback>, PlaybackError>;
}

/// A clip that is currently sounding.
pub trait ActivePlayback: Send + Sync {
    fn set_gain(&self, gain: f32);

    fn is_finished(&self) -> bool;

    /// Set once the device has reported an error for this stream.
    fn failure(&self) -> Option<String> {
        None
    }

    fn stop(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started { turn: TurnId, seq: u64 },
    Finished { turn: TurnId, seq: u64 },
    Stopped { turn: TurnId, seq: u64 },
    DeviceFailed { turn: TurnId, reason: String },
}

/// The seq currently playing (or next expected) for the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub turn: Option<TurnId>,
    pub next_seq: u64,
}

enum Slot {
    Clip(AudioClip),
    Skip,
}

struct Active {
    turn: TurnId,
    seq: u64,
    playback: Box<dyn ActivePlayback>,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    turn: Option<TurnId>,
    next_seq: u64,
    pending: BTreeMap<u64, Slot>,
    active: Option<Active>,
    finish: Option<(u64, oneshot::Sender<()>)>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
    controls: Arc<ControlState>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    progress: watch::Sender<Progress>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap()
    }

    fn emit(&self, event: PlaybackEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn publish(&self, state: &QueueState) {
        self.progress.send_replace(Progress {
            turn: state.turn,
            next_seq: state.next_seq,
        });
    }

    fn stop_active(&self, state: &mut QueueState) {
        if let Some(active) = state.active.take() {
            active.playback.stop();
            self.emit(PlaybackEvent::Stopped {
                turn: active.turn,
                seq: active.seq,
            });
        }
    }
}

#[derive(Clone)]
pub struct PlaybackQueue {
    shared: Arc<Shared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PlaybackQueue {
    /// Start the playback thread. `open` runs on that thread, so the device
    /// never has to cross threads; its failure is returned here.
    pub fn start<O, F>(
        open: F,
        controls: Arc<ControlState>,
        poll: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PlaybackEvent>), PlaybackError>
    where
        O: AudioOutput + 'static,
        F: FnOnce() -> Result<O, PlaybackError> + Send + 'static,
    {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (progress, _) = watch::channel(Progress::default());
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            controls,
            events,
            progress,
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("doris-playback".into())
            .spawn(move || {
                let output = match open() {
                    Ok(output) => {
                        let _ = ready_tx.send(Ok(()));
                        output
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_playback(&thread_shared, output, poll);
            })
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("playback thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| PlaybackError::DeviceUnavailable("playback thread exited".into()))??;
        info!("Playback queue ready");

        Ok((
            Self {
                shared,
                thread: Arc::new(Mutex::new(Some(thread))),
            },
            events_rx,
        ))
    }

    /// Make `turn` the current generation. Anything left from an earlier
    /// turn is dropped.
    pub fn begin_turn(&self, turn: TurnId) {
        let mut state = self.shared.lock();
        self.shared.stop_active(&mut state);
        state.turn = Some(turn);
        state.next_seq = 0;
        state.pending.clear();
        state.finish = None;
        self.shared.publish(&state);
        self.shared.wake.notify_all();
    }

    /// Hand a clip to the queue. Returns false if it belongs to a stale turn.
    pub fn enqueue(&self, clip: AudioClip) -> bool {
        let mut state = self.shared.lock();
        if state.turn != Some(clip.turn()) || clip.seq() < state.next_seq {
            debug!("Discarding stale clip {} #{}", clip.turn(), clip.seq());
            return false;
        }
        state.pending.insert(clip.seq(), Slot::Clip(clip));
        self.shared.wake.notify_all();
        true
    }

    /// Mark `seq` as never arriving so later clips are not held back.
    pub fn skip(&self, turn: TurnId, seq: u64) -> bool {
        let mut state = self.shared.lock();
        if state.turn != Some(turn) || seq < state.next_seq {
            return false;
        }
        state.pending.insert(seq, Slot::Skip);
        self.shared.wake.notify_all();
        true
    }

    /// Resolves once all `total` units of `turn` have played or been skipped.
    /// The sender is dropped if the turn is cancelled first.
    pub fn finish(&self, turn: TurnId, total: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.shared.lock();
        if state.turn == Some(turn) {
            state.finish = Some((total, tx));
            self.shared.wake.notify_all();
        }
        rx
    }

    /// Stop the active clip right now and retire the current turn.
    pub fn cancel_all(&self) {
        let mut state = self.shared.lock();
        self.shared.stop_active(&mut state);
        let dropped = state.pending.len();
        state.pending.clear();
        state.finish = None;
        state.turn = None;
        state.next_seq = 0;
        self.shared.publish(&state);
        self.shared.wake.notify_all();
        if dropped > 0 {
            debug!("Playback cancelled, {dropped} pending clip(s) dropped");
        }
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.shared.progress.subscribe()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().active.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Stop playback and join the playback thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn run_playback<O: AudioOutput>(shared: &Shared, mut output: O, poll: Duration) {
    let mut state = shared.lock();

    loop {
        if state.shutdown {
            shared.stop_active(&mut state);
            break;
        }

        if let Some(active) = &state.active {
            if active.playback.is_finished() {
                shared.emit(PlaybackEvent::Finished {
                    turn: active.turn,
                    seq: active.seq,
                });
                state.active = None;
                state.next_seq += 1;
                shared.publish(&state);
            } else if let Some(reason) = stalled(active) {
                let turn = active.turn;
                shared.stop_active(&mut state);
                device_failed(shared, &mut state, turn, reason);
                continue;
            } else {
                active.playback.set_gain(shared.controls.gain());
                state = shared.wake.wait_timeout(state, poll).unwrap().0;
                continue;
            }
        }

        while matches!(state.pending.get(&state.next_seq), Some(Slot::Skip)) {
            let seq = state.next_seq;
            state.pending.remove(&seq);
            state.next_seq += 1;
            shared.publish(&state);
        }

        let next_seq = state.next_seq;
        if matches!(&state.finish, Some((total, _)) if next_seq >= *total) {
            if let Some((_, done)) = state.finish.take() {
                let _ = done.send(());
            }
        }

        let Some(turn) = state.turn else {
            state = shared.wake.wait_timeout(state, poll).unwrap().0;
            continue;
        };

        if !matches!(state.pending.get(&next_seq), Some(Slot::Clip(_))) {
            state = shared.wake.wait_timeout(state, poll).unwrap().0;
            continue;
        }
        let Some(Slot::Clip(clip)) = state.pending.remove(&next_seq) else {
            continue;
        };

        // the device call happens without the lock so cancel_all never waits on it
        drop(state);
        let started = output.play(&clip, shared.controls.gain());
        state = shared.lock();

        match started {
            Ok(playback) => {
                if state.turn != Some(turn) || state.shutdown {
                    playback.stop();
                    continue;
                }
                debug!("Playing {turn} #{next_seq} ({:.1}s)", clip.duration().as_secs_f64());
                shared.emit(PlaybackEvent::Started { turn, seq: next_seq });
                state.active = Some(Active {
                    turn,
                    seq: next_seq,
                    playback,
                    deadline: Instant::now() + clip.duration() + STALL_GRACE,
                });
            }
            Err(e) => device_failed(shared, &mut state, turn, e.to_string()),
        }
    }

    info!("Playback thread stopping");
}

/// A clip that the device reported broken, or that stopped draining.
fn stalled(active: &Active) -> Option<String> {
    active.playback.failure().or_else(|| {
        (Instant::now() >= active.deadline)
            .then(|| format!("{} #{} stopped playing before its end", active.turn, active.seq))
    })
}

/// Drop what is queued for `turn` and report the device as failed. A newer
/// turn that began meanwhile keeps its queue.
fn device_failed(shared: &Shared, state: &mut QueueState, turn: TurnId, reason: String) {
    warn!("Audio device failed: {reason}");
    if state.turn == Some(turn) {
        state.pending.clear();
        state.finish = None;
        state.turn = None;
        state.next_seq = 0;
        shared.publish(state);
    }
    shared.emit(PlaybackEvent::DeviceFailed { turn, reason });
}
