//! Clip: a decoded audio source plus the slice points and playback defaults
//! SamplerSynth reads from when starting a voice.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use atomic::Atomic;
use derivative::Derivative;
use ulid::Ulid;

use crate::audio_format::AudioFormatReader;
use crate::error::{EngineError, EngineResult};

/// Opaque handle identifying a registered clip. Cheap to copy, stable for the
/// clip's whole registered lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipId(Ulid);

impl Default for ClipId {
    fn default() -> Self {
        ClipId(Ulid::from(0u128))
    }
}

impl ClipId {
    pub fn new() -> Self {
        ClipId(Ulid::new())
    }

    #[cfg(test)]
    pub fn new_for_test(seed: u128) -> Self {
        ClipId(Ulid::from(seed))
    }
}

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named sub-region of a clip's audio, in source-sample-rate frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slice {
    pub start_position_seconds: f64,
    pub stop_position_seconds: f64,
}

/// Decoded PCM backing a clip, plus the slice table and defaults a
/// `ClipCommand` can override per playback.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Clip {
    id: ClipId,
    path: String,
    #[derivative(Debug = "ignore")]
    channels: Vec<Vec<f32>>,
    source_sample_rate: u32,
    root_note: i32,
    slices: Vec<Slice>,
    /// Playback position, as progress in `[0, 1]`, published for whichever
    /// observer wants to show a playhead. A single wait-free cell rather than a
    /// lock: see DESIGN.md's resolution of the upstream positions-model race.
    position_progress: Atomic<f32>,
}

impl Clip {
    pub fn load(path: &str, reader: &dyn AudioFormatReader, root_note: i32) -> EngineResult<Self> {
        let decoded = reader.decode(path).map_err(|reason| EngineError::Decode {
            path: path.to_string(),
            reason,
        })?;
        let duration = decoded.channels[0].len() as f64 / decoded.sample_rate as f64;
        Ok(Self {
            id: ClipId::new(),
            path: path.to_string(),
            channels: decoded.channels,
            source_sample_rate: decoded.sample_rate,
            root_note,
            slices: vec![Slice { start_position_seconds: 0.0, stop_position_seconds: duration }],
            position_progress: Atomic::new(0.0),
        })
    }

    pub fn id(&self) -> ClipId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate
    }

    pub fn root_note(&self) -> i32 {
        self.root_note
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn duration_seconds(&self) -> f64 {
        self.channels[0].len() as f64 / self.source_sample_rate as f64
    }

    fn slice_or_default(&self, slice: i32) -> Slice {
        if slice < 0 {
            return self.slices[0];
        }
        self.slices.get(slice as usize).copied().unwrap_or(self.slices[0])
    }

    pub fn start_position_frames(&self, slice: i32) -> f64 {
        self.slice_or_default(slice).start_position_seconds * self.source_sample_rate as f64
    }

    pub fn stop_position_frames(&self, slice: i32) -> f64 {
        self.slice_or_default(slice).stop_position_seconds * self.source_sample_rate as f64
    }

    pub fn set_slices(&mut self, slices: Vec<Slice>) {
        self.slices = slices;
    }

    /// Wait-free overwrite, called from the audio thread once per rendered block.
    pub fn publish_position_progress(&self, progress: f32) {
        self.position_progress.store(progress, Ordering::Relaxed);
    }

    /// Wait-free read, called from any observer thread. Always sees a recent,
    /// never-torn value (possibly a torn sequence of reads across calls, but
    /// never a torn f32 within one).
    pub fn position_progress(&self) -> f32 {
        self.position_progress.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn new_for_test(channels: Vec<Vec<f32>>, source_sample_rate: u32, root_note: i32) -> Self {
        let duration = channels[0].len() as f64 / source_sample_rate as f64;
        Self {
            id: ClipId::new(),
            path: "test".into(),
            channels,
            source_sample_rate,
            root_note,
            slices: vec![Slice { start_position_seconds: 0.0, stop_position_seconds: duration }],
            position_progress: Atomic::new(0.0),
        }
    }
}

pub type ClipHandle = Arc<Clip>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_progress_round_trips_through_atomic_cell() {
        let clip = Clip {
            id: ClipId::new(),
            path: "test".into(),
            channels: vec![vec![0.0; 4]],
            source_sample_rate: 44100,
            root_note: 60,
            slices: vec![Slice { start_position_seconds: 0.0, stop_position_seconds: 1.0 }],
            position_progress: Atomic::new(0.0),
        };
        clip.publish_position_progress(0.42);
        assert!((clip.position_progress() - 0.42).abs() < f32::EPSILON);
    }

    #[test]
    fn out_of_range_slice_falls_back_to_first_slice() {
        let clip = Clip {
            id: ClipId::new(),
            path: "test".into(),
            channels: vec![vec![0.0; 4]],
            source_sample_rate: 2,
            root_note: 60,
            slices: vec![Slice { start_position_seconds: 0.0, stop_position_seconds: 2.0 }],
            position_progress: Atomic::new(0.0),
        };
        assert_eq!(clip.stop_position_frames(5), 4.0);
        assert_eq!(clip.stop_position_frames(-1), 4.0);
    }
}
