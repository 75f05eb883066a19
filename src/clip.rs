//! Turn identity and the audio produced for one sentence unit.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

/// One user-triggered generation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

/// Mono waveform for exactly one sentence unit. Immutable once built.
#[derive(Debug, Clone)]
pub struct AudioClip {
    turn: TurnId,
    seq: u64,
    text: Arc<str>,
    sample_rate: u32,
    samples: Arc<[f32]>,
}

impl AudioClip {
    pub fn new(
        turn: TurnId,
        seq: u64,
        text: impl Into<Arc<str>>,
        sample_rate: u32,
        samples: Vec<f32>,
    ) -> Self {
        Self {
            turn,
            seq,
            text: text.into(),
            sample_rate,
            samples: samples.into(),
        }
    }

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Save as 16-bit mono WAV.
    pub fn write_wav(&self, path: &Path) -> Result<(), hound::Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in self.samples.iter() {
            // f32 [-1, 1] → i16
            let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(s)?;
        }
        writer.finalize()
    }
}
