//! User-tunable volume and speed, shared lock-free between stages.
//!
//! Volume is an integer percentage. Speed is one of ten fixed multipliers;
//! continuous inputs are snapped to the nearest level and only the level is
//! stored.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use tracing::debug;

/// Linear speed table, 0.25x to 2.5x in steps of 0.25.
pub const SPEED_LEVELS: [f32; 10] = [0.25, 0.5, 0.75, 1.0, 1.25, 1.5, 1.75, 2.0, 2.25, 2.5];

/// Index of 1.0x in [`SPEED_LEVELS`].
pub const NORMAL_SPEED_LEVEL: u8 = 3;

pub const MAX_VOLUME: u8 = 100;

pub fn clamp_volume(volume: i64) -> u8 {
    volume.clamp(0, MAX_VOLUME as i64) as u8
}

/// Nearest level for `value`; ties go to the lower level.
pub fn snap_speed(value: f32) -> u8 {
    if !value.is_finite() {
        return NORMAL_SPEED_LEVEL;
    }

    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (level, &speed) in SPEED_LEVELS.iter().enumerate() {
        let distance = (speed - value).abs();
        if distance < best_distance {
            best = level;
            best_distance = distance;
        }
    }
    best as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlSnapshot {
    pub volume: u8,
    pub gain: f32,
    pub speed_level: u8,
    pub speed: f32,
}

#[derive(Debug)]
pub struct ControlState {
    volume: AtomicU8,
    speed_level: AtomicU8,
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new(MAX_VOLUME as i64, 1.0)
    }
}

impl ControlState {
    pub fn new(volume: i64, speed: f32) -> Self {
        Self {
            volume: AtomicU8::new(clamp_volume(volume)),
            speed_level: AtomicU8::new(snap_speed(speed)),
        }
    }

    /// Set volume, clamped to [0, 100]. Returns the stored value.
    pub fn set_volume(&self, volume: i64) -> u8 {
        let volume = clamp_volume(volume);
        self.volume.store(volume, Ordering::Relaxed);
        debug!("Volume set to {volume}");
        volume
    }

    /// Snap `speed` to the nearest level and store it. Returns the multiplier.
    pub fn set_speed(&self, speed: f32) -> f32 {
        let level = snap_speed(speed);
        self.speed_level.store(level, Ordering::Relaxed);
        debug!("Speed {speed} snapped to level {level}");
        SPEED_LEVELS[level as usize]
    }

    pub fn set_speed_level(&self, level: u8) -> f32 {
        let level = level.min(SPEED_LEVELS.len() as u8 - 1);
        self.speed_level.store(level, Ordering::Relaxed);
        SPEED_LEVELS[level as usize]
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    /// Linear gain applied at playback.
    pub fn gain(&self) -> f32 {
        self.volume() as f32 / MAX_VOLUME as f32
    }

    pub fn speed_level(&self) -> u8 {
        self.speed_level.load(Ordering::Relaxed)
    }

    pub fn speed(&self) -> f32 {
        SPEED_LEVELS[self.speed_level() as usize]
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        let volume = self.volume();
        let speed_level = self.speed_level();
        ControlSnapshot {
            volume,
            gain: volume as f32 / MAX_VOLUME as f32,
            speed_level,
            speed: SPEED_LEVELS[speed_level as usize],
        }
    }
}
