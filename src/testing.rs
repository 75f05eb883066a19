//! Test doubles for the synthesis process and the audio device.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::clip::{AudioClip, TurnId};
use crate::error::{PlaybackError, SynthesisError};
use crate::playback::{ActivePlayback, AudioOutput};
use crate::synthesis::{SynthesisBackend, SynthesisProcess, SynthesisRequest, Waveform};

pub const SCRIPTED_RATE: u32 = 1000;

#[derive(Default)]
struct Script {
    spawns: usize,
    fail_spawns: usize,
    crash_on: HashMap<String, usize>,
    reject: HashSet<String>,
    hang: HashSet<String>,
    requests: Vec<(String, f32)>,
    delay: Option<Duration>,
}

/// Synthesis backend whose processes follow a script keyed by request text.
/// Every request yields two samples per character at 1 kHz.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_backend(&self) -> Arc<dyn SynthesisBackend> {
        Arc::new(self.clone())
    }

    /// The next `times` requests for `text` kill the process.
    pub fn crash_on(&self, text: &str, times: usize) {
        self.script.lock().unwrap().crash_on.insert(text.into(), times);
    }

    pub fn hang_on(&self, text: &str) {
        self.script.lock().unwrap().hang.insert(text.into());
    }

    pub fn reject(&self, text: &str) {
        self.script.lock().unwrap().reject.insert(text.into());
    }

    pub fn fail_spawns(&self, times: usize) {
        self.script.lock().unwrap().fail_spawns = times;
    }

    pub fn delay(&self, delay: Duration) {
        self.script.lock().unwrap().delay = Some(delay);
    }

    pub fn spawns(&self) -> usize {
        self.script.lock().unwrap().spawns
    }

    pub fn requests(&self) -> Vec<String> {
        self.script.lock().unwrap().requests.iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn speeds(&self) -> Vec<f32> {
        self.script.lock().unwrap().requests.iter().map(|(_, s)| *s).collect()
    }
}

#[async_trait]
impl SynthesisBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn spawn(&self) -> Result<Box<dyn SynthesisProcess>, SynthesisError> {
        let mut script = self.script.lock().unwrap();
        script.spawns += 1;
        if script.fail_spawns > 0 {
            script.fail_spawns -= 1;
            return Err(SynthesisError::Spawn {
                command: "scripted".into(),
                reason: "scripted spawn failure".into(),
            });
        }
        Ok(Box::new(ScriptedProcess {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedProcess {
    script: Arc<Mutex<Script>>,
}

enum Outcome {
    Crash,
    Reject,
    Hang,
    Speak(Option<Duration>),
}

#[async_trait]
impl SynthesisProcess for ScriptedProcess {
    async fn synthesize(&mut self, request: &SynthesisRequest) -> Result<Waveform, SynthesisError> {
        let outcome = {
            let mut script = self.script.lock().unwrap();
            script.requests.push((request.text.clone(), request.speed));
            let crash = match script.crash_on.get_mut(&request.text) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            if crash {
                Outcome::Crash
            } else if script.reject.contains(&request.text) {
                Outcome::Reject
            } else if script.hang.contains(&request.text) {
                Outcome::Hang
            } else {
                Outcome::Speak(script.delay)
            }
        };

        match outcome {
            Outcome::Crash => Err(SynthesisError::Crashed("scripted crash".into())),
            Outcome::Reject => Err(SynthesisError::Rejected("scripted rejection".into())),
            Outcome::Hang => std::future::pending().await,
            Outcome::Speak(delay) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(Waveform {
                    samples: vec![0.1; request.text.len() * 2],
                    sample_rate: SCRIPTED_RATE,
                })
            }
        }
    }

    async fn shutdown(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct PlayRecord {
    pub turn: TurnId,
    pub seq: u64,
    pub text: String,
    pub started: Instant,
    pub duration: Duration,
    pub ended: Option<Instant>,
    pub gains: Vec<f32>,
    pub stopped: bool,
}

#[derive(Default)]
struct LogInner {
    records: Vec<PlayRecord>,
    fail: bool,
    stall: bool,
}

/// Everything a `MockOutput` was asked to play, shared with the test.
#[derive(Clone, Default)]
pub struct OutputLog {
    inner: Arc<Mutex<LogInner>>,
}

impl OutputLog {
    pub fn fail_plays(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }

    /// Clips start but never finish, as when the device stops pulling samples.
    pub fn stall_plays(&self, stall: bool) {
        self.inner.lock().unwrap().stall = stall;
    }

    pub fn records(&self) -> Vec<PlayRecord> {
        self.inner.lock().unwrap().records.clone()
    }

    pub fn seqs(&self) -> Vec<u64> {
        self.records().iter().map(|r| r.seq).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.text).collect()
    }

    pub fn last_gain(&self) -> Option<f32> {
        self.records().last().and_then(|r| r.gains.last().copied())
    }

    pub fn assert_no_overlap(&self) {
        let records = self.records();
        for pair in records.windows(2) {
            let ended = pair[0].ended.expect("earlier clip never ended");
            assert!(
                ended <= pair[1].started,
                "#{} started before #{} ended",
                pair[1].seq,
                pair[0].seq
            );
        }
    }
}

/// Audio device that plays nothing; clips "finish" after their duration.
pub struct MockOutput {
    log: OutputLog,
}

impl MockOutput {
    pub fn new(log: OutputLog) -> Self {
        Self { log }
    }
}

impl AudioOutput for MockOutput {
    fn play(&mut self, clip: &AudioClip, gain: f32) -> Result<Box<dyn ActivePlayback>, PlaybackError> {
        let mut inner = self.log.inner.lock().unwrap();
        if inner.fail {
            return Err(PlaybackError::DeviceUnavailable("mock device unplugged".into()));
        }
        inner.records.push(PlayRecord {
            turn: clip.turn(),
            seq: clip.seq(),
            text: clip.text().to_string(),
            started: Instant::now(),
            duration: clip.duration(),
            ended: None,
            gains: vec![gain],
            stopped: false,
        });
        Ok(Box::new(MockPlayback {
            log: self.log.clone(),
            index: inner.records.len() - 1,
        }))
    }
}

struct MockPlayback {
    log: OutputLog,
    index: usize,
}

impl ActivePlayback for MockPlayback {
    fn set_gain(&self, gain: f32) {
        let mut inner = self.log.inner.lock().unwrap();
        let gains = &mut inner.records[self.index].gains;
        if gains.last() != Some(&gain) {
            gains.push(gain);
        }
    }

    fn is_finished(&self) -> bool {
        let mut inner = self.log.inner.lock().unwrap();
        if inner.stall {
            return false;
        }
        let record = &mut inner.records[self.index];
        if record.ended.is_some() {
            return true;
        }
        if record.started.elapsed() >= record.duration {
            record.ended = Some(record.started + record.duration);
            return true;
        }
        false
    }

    fn stop(&self) {
        let mut inner = self.log.inner.lock().unwrap();
        let record = &mut inner.records[self.index];
        if record.ended.is_none() {
            record.stopped = true;
            record.ended = Some(Instant::now());
        }
    }
}
