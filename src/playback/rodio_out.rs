//! Default audio device through rodio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamBuilder, Sink};
use tracing::{info, warn};

use super::{ActivePlayback, AudioOutput};
use crate::clip::AudioClip;
use crate::error::PlaybackError;

const DEVICE_LOST: &str = "output stream reported an error";

pub struct RodioOutput {
    // In rodio 0.21, OutputStream is the handle; dropping it closes the device
    stream: OutputStream,
    // set by the stream's error callback (unplugged device, backend failure)
    failed: Arc<AtomicBool>,
}

impl RodioOutput {
    pub fn open_default() -> Result<Self, PlaybackError> {
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let stream = OutputStreamBuilder::from_default_device()
            .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?
            .with_error_callback(move |e| {
                warn!("Audio stream error: {e}");
                flag.store(true, Ordering::SeqCst);
            })
            .open_stream_or_fallback()
            .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;
        info!("Audio output opened");
        Ok(Self { stream, failed })
    }
}

impl AudioOutput for RodioOutput {
    fn play(&mut self, clip: &AudioClip, gain: f32) -> Result<Box<dyn ActivePlayback>, PlaybackError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(PlaybackError::DeviceUnavailable(DEVICE_LOST.into()));
        }
        let sink = Sink::connect_new(self.stream.mixer());
        sink.set_volume(gain);
        sink.append(SamplesBuffer::new(1, clip.sample_rate(), clip.samples().to_vec()));
        Ok(Box::new(RodioPlayback {
            sink,
            failed: self.failed.clone(),
        }))
    }
}

struct RodioPlayback {
    sink: Sink,
    failed: Arc<AtomicBool>,
}

impl ActivePlayback for RodioPlayback {
    fn set_gain(&self, gain: f32) {
        self.sink.set_volume(gain);
    }

    fn is_finished(&self) -> bool {
        self.sink.empty()
    }

    fn failure(&self) -> Option<String> {
        self.failed.load(Ordering::SeqCst).then(|| DEVICE_LOST.to_string())
    }

    fn stop(&self) {
        self.sink.stop();
    }
}
