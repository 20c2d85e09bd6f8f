//! Peak metering bus: 13 logical channels (capture, playback, recorder, 10
//! per-sketchpad-channel), each tracked in the integer domain and published at
//! 30 Hz as dBFS, with a slower-decaying peak-hold value for meter ballistics.
//! Grounded on `original_source/lib/AudioLevels.cpp`'s `timerCallback`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::disk_writer::DiskWriter;
use crate::event::{EngineEvent, LevelsChannel};
use crate::mutex_util::non_blocking_lock;
use crate::sampler_synth::SKETCHPAD_CHANNEL_COUNT;
use crossbeam_channel::Sender;

const METERING_TICK_HZ: u64 = 30;

/// Unit gain (`1.0` linear) is represented as this integer value; tracking
/// peaks as integers instead of floats avoids the host's float-to-float
/// comparisons being at the mercy of denormals on the audio thread.
pub const PEAK_SCALE: i32 = 1_000_000;
/// How much the running peak decays every 30 Hz tick, in the same integer domain.
pub const DECAY_PER_TICK: i32 = 10_000;
/// Multiplicative decay applied to the (slower) peak-hold value every tick.
pub const PEAK_HOLD_DECAY_FACTOR: f32 = 0.9;
pub const SILENCE_FLOOR_DB: f32 = -200.0;

pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        return SILENCE_FLOOR_DB;
    }
    (20.0 * linear.log10()).max(SILENCE_FLOOR_DB)
}

#[derive(Default, Clone, Copy)]
struct ChannelLevel {
    peak_integer: i32,
    hold_integer: i32,
}

impl ChannelLevel {
    /// Called from the audio thread once per JACK period: widen the running
    /// peak if this block was louder. Never shrinks it; only `tick` decays it.
    fn observe_block(&mut self, samples: &[f32]) {
        let block_peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let block_peak_integer = (block_peak * PEAK_SCALE as f32) as i32;
        if block_peak_integer > self.peak_integer {
            self.peak_integer = block_peak_integer;
        }
    }

    /// Called from the 30 Hz metering timer: decay the running peak, update
    /// the hold value, and return `(peak_db, hold_db)`.
    fn tick(&mut self) -> (f32, f32) {
        self.peak_integer = (self.peak_integer - DECAY_PER_TICK).max(0);
        if self.peak_integer >= self.hold_integer {
            self.hold_integer = self.peak_integer;
        } else {
            self.hold_integer = (self.hold_integer as f32 * PEAK_HOLD_DECAY_FACTOR) as i32;
        }
        let peak_db = linear_to_db(self.peak_integer as f32 / PEAK_SCALE as f32);
        let hold_db = linear_to_db(self.hold_integer as f32 / PEAK_SCALE as f32);
        (peak_db, hold_db)
    }
}

pub struct AudioLevels {
    capture: ChannelLevel,
    playback: ChannelLevel,
    recorder: ChannelLevel,
    sketchpad_channels: [ChannelLevel; SKETCHPAD_CHANNEL_COUNT],
    disk_writer: DiskWriter,
    event_tx: Sender<EngineEvent>,
}

impl AudioLevels {
    pub fn new(event_tx: Sender<EngineEvent>) -> Self {
        Self {
            capture: ChannelLevel::default(),
            playback: ChannelLevel::default(),
            recorder: ChannelLevel::default(),
            sketchpad_channels: Default::default(),
            disk_writer: DiskWriter::new(event_tx.clone()),
            event_tx,
        }
    }

    pub fn disk_writer(&self) -> &DiskWriter {
        &self.disk_writer
    }

    pub fn observe_capture(&mut self, left: &[f32], right: &[f32]) {
        self.capture.observe_block(left);
        self.capture.observe_block(right);
        self.disk_writer.push_block(left, right);
    }

    pub fn observe_playback(&mut self, left: &[f32], right: &[f32]) {
        self.playback.observe_block(left);
        self.playback.observe_block(right);
    }

    pub fn observe_recorder(&mut self, left: &[f32], right: &[f32]) {
        self.recorder.observe_block(left);
        self.recorder.observe_block(right);
    }

    pub fn observe_sketchpad_channel(&mut self, channel: usize, left: &[f32], right: &[f32]) {
        if let Some(level) = self.sketchpad_channels.get_mut(channel) {
            level.observe_block(left);
            level.observe_block(right);
        }
    }

    /// Run off a 30 Hz timer (not the audio thread): decay every channel and
    /// publish its new peak/hold dBFS through the event channel.
    pub fn tick(&mut self) {
        let (peak, hold) = self.capture.tick();
        let _ = self.event_tx.send(EngineEvent::LevelsUpdate {
            channel: LevelsChannel::Capture,
            peak_db: peak,
            peak_hold_db: hold,
        });

        let (peak, hold) = self.playback.tick();
        let _ = self.event_tx.send(EngineEvent::LevelsUpdate {
            channel: LevelsChannel::Playback,
            peak_db: peak,
            peak_hold_db: hold,
        });

        let (peak, hold) = self.recorder.tick();
        let _ = self.event_tx.send(EngineEvent::LevelsUpdate {
            channel: LevelsChannel::Recorder,
            peak_db: peak,
            peak_hold_db: hold,
        });

        for (i, level) in self.sketchpad_channels.iter_mut().enumerate() {
            let (peak, hold) = level.tick();
            let _ = self.event_tx.send(EngineEvent::LevelsUpdate {
                channel: LevelsChannel::SketchpadChannel(i as u8),
                peak_db: peak,
                peak_hold_db: hold,
            });
        }
    }
}

/// Drives [`AudioLevels::tick`] at a fixed 30 Hz off a dedicated background
/// thread. Not the musical clock in `clock.rs`: metering ballistics run on
/// wall-clock time regardless of tempo or whether the transport is playing.
pub struct MeteringTimer {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MeteringTimer {
    pub fn start(levels: Arc<Mutex<AudioLevels>>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let period = Duration::from_millis(1000 / METERING_TICK_HZ);
        let handle = std::thread::Builder::new()
            .name("audio-levels-timer".to_string())
            .spawn(move || {
                while thread_running.load(Ordering::Acquire) {
                    std::thread::sleep(period);
                    non_blocking_lock(&levels, "audio levels").tick();
                }
            })
            .expect("failed to spawn audio-levels-timer thread");
        Self { running, handle: Some(handle) }
    }
}

impl Drop for MeteringTimer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_reports_floor_db() {
        assert_eq!(linear_to_db(0.0), SILENCE_FLOOR_DB);
    }

    #[test]
    fn unity_gain_reports_zero_db() {
        assert!((linear_to_db(1.0)).abs() < 1e-4);
    }

    #[test]
    fn running_peak_decays_over_successive_ticks() {
        let mut level = ChannelLevel::default();
        level.observe_block(&[1.0, -1.0, 0.5]);
        let (first_peak, _) = level.tick();
        let (second_peak, _) = level.tick();
        assert!(second_peak <= first_peak);
    }

    #[test]
    fn peak_hold_decays_slower_than_the_instantaneous_peak() {
        let mut level = ChannelLevel::default();
        level.observe_block(&[1.0]);
        level.tick();
        let (peak_after_silence, hold_after_silence) = level.tick();
        assert!(hold_after_silence >= peak_after_silence);
    }
}
