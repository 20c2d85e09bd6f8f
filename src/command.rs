//! The three value types producers schedule into a `Step`: a raw MIDI byte
//! triple, a clip-playback mutation, and a housekeeping/transport operation.
//!
//! `ClipCommand`/`TimerCommand` are drawn from and returned to a
//! [`crate::pool::CommandPool`]; the C++ original's `void* dataParameter` /
//! `void* variantParameter` union members become typed `Option` fields here,
//! which is the idiomatic Rust rendering of "this command sometimes carries a
//! payload of one specific other type."

use crate::clip::ClipId;
use crate::pool::Poolable;

/// A channel value meaning "the global effected bus" rather than a real MIDI channel.
pub const CHANNEL_GLOBAL_EFFECTED: i8 = -1;
/// A channel value meaning "the global uneffected bus" rather than a real MIDI channel.
pub const CHANNEL_GLOBAL_UNEFFECTED: i8 = -2;

/// A single outgoing MIDI message, at most 3 bytes (covers everything this
/// engine emits: note on/off, CC, pitch bend, beat clock). Fixed-size so
/// scheduling one never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepMidiEvent {
    pub len: u8,
    pub data: [u8; 3],
}

impl StepMidiEvent {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= 3);
        let mut data = [0u8; 3];
        let len = bytes.len().min(3);
        data[..len].copy_from_slice(&bytes[..len]);
        Self { len: len as u8, data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// True for a note-off, or a note-on with velocity 0 (the usual
    /// running-status stand-in for note-off).
    pub fn is_note_off(&self) -> bool {
        match self.as_slice() {
            [status, _, velocity] if status & 0xF0 == 0x90 => *velocity == 0,
            [status, ..] if status & 0xF0 == 0x80 => true,
            _ => false,
        }
    }
}

/// A mutation to apply to a playing or about-to-play clip voice.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClipCommand {
    pub clip: ClipId,
    pub midi_note: i32,
    pub midi_channel: i8,

    pub start_playback: bool,
    pub stop_playback: bool,

    pub change_looping: bool,
    pub looping: bool,

    pub change_pitch: bool,
    pub pitch_change: f64,

    pub change_speed: bool,
    pub speed_ratio: f64,

    pub change_gain_db: bool,
    pub gain_db: f64,

    pub change_volume: bool,
    pub volume: f32,

    pub change_slice: bool,
    pub slice: i32,
}

impl ClipCommand {
    /// Two commands are equivalent (and so may be merged into a single step
    /// slot) iff they target the same clip, and either they both reference the
    /// same slice, or neither changes the slice and they share (note, channel).
    pub fn equivalent(&self, other: &ClipCommand) -> bool {
        if self.clip != other.clip {
            return false;
        }
        if self.change_slice && other.change_slice {
            return self.slice == other.slice;
        }
        !self.change_slice
            && !other.change_slice
            && self.midi_note == other.midi_note
            && self.midi_channel == other.midi_channel
    }

    /// Fold `incoming` (scheduled after `self`) into `self`: the resulting
    /// command's changeX flags are the union of both inputs', each with the
    /// later (incoming) value.
    pub fn merge_from(&mut self, incoming: &ClipCommand) {
        if incoming.start_playback {
            self.start_playback = true;
        }
        if incoming.stop_playback {
            self.stop_playback = true;
        }
        if incoming.change_looping {
            self.change_looping = true;
            self.looping = incoming.looping;
        }
        if incoming.change_pitch {
            self.change_pitch = true;
            self.pitch_change = incoming.pitch_change;
        }
        if incoming.change_speed {
            self.change_speed = true;
            self.speed_ratio = incoming.speed_ratio;
        }
        if incoming.change_gain_db {
            self.change_gain_db = true;
            self.gain_db = incoming.gain_db;
        }
        if incoming.change_volume {
            self.change_volume = true;
            self.volume = incoming.volume;
        }
        if incoming.change_slice {
            self.change_slice = true;
            self.slice = incoming.slice;
        }
    }
}

impl Poolable for ClipCommand {
    fn reset(&mut self) {
        *self = ClipCommand::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOperation {
    StartPlayback,
    StopPlayback,
    StartClipLoop,
    StopClipLoop,
    ClipCommand,
    SamplerChannelEnabledState,
    SetBpm,
    RegisterClip,
    UnregisterClip,
    StartPart,
    StopPart,
}

/// A transport/housekeeping operation scheduled onto the beat grid.
///
/// `data`/`loop_command` are the typed replacements for the original's
/// `dataParameter`/`variantParameter` void pointers: `data` carries the
/// payload for `ClipCommand` operations, `loop_command` for
/// `StartClipLoop`/`StopClipLoop`.
#[derive(Debug, Clone, Default)]
pub struct TimerCommand {
    pub operation: Option<TimerOperation>,
    pub parameter: i64,
    pub parameter2: i64,
    pub parameter3: i64,
    pub data: Option<ClipCommand>,
    pub loop_command: Option<ClipCommand>,
    pub clip: Option<ClipId>,
}

impl Poolable for TimerCommand {
    fn reset(&mut self) {
        *self = TimerCommand::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_command(clip: ClipId) -> ClipCommand {
        ClipCommand { clip, midi_note: 60, midi_channel: 0, ..Default::default() }
    }

    #[test]
    fn note_off_status_byte_is_a_note_off() {
        assert!(StepMidiEvent::new(&[0x80, 60, 0]).is_note_off());
        assert!(StepMidiEvent::new(&[0x8F, 60, 127]).is_note_off());
    }

    #[test]
    fn zero_velocity_note_on_is_a_note_off() {
        assert!(StepMidiEvent::new(&[0x90, 60, 0]).is_note_off());
    }

    #[test]
    fn sounding_note_on_is_not_a_note_off() {
        assert!(!StepMidiEvent::new(&[0x90, 60, 127]).is_note_off());
    }

    #[test]
    fn non_note_messages_are_not_note_offs() {
        assert!(!StepMidiEvent::new(&[0xB0, 7, 64]).is_note_off());
        assert!(!StepMidiEvent::new(&[0xF8]).is_note_off());
    }

    #[test]
    fn same_clip_and_slice_is_equivalent() {
        let clip = ClipId::new_for_test(1);
        let mut a = base_command(clip);
        a.slice = 2;
        let mut b = base_command(clip);
        b.slice = 2;
        assert!(a.equivalent(&b));
    }

    #[test]
    fn different_clip_is_never_equivalent() {
        let a = base_command(ClipId::new_for_test(1));
        let b = base_command(ClipId::new_for_test(2));
        assert!(!a.equivalent(&b));
    }

    #[test]
    fn same_note_and_channel_without_slice_change_is_equivalent() {
        let clip = ClipId::new_for_test(1);
        let a = base_command(clip);
        let mut b = base_command(clip);
        b.slice = 1; // differs, but neither changes slice
        assert!(a.equivalent(&b));
    }

    #[test]
    fn same_clip_different_notes_with_unset_slices_are_not_equivalent() {
        // Regression: `slice` defaults to 0 on both sides when neither command
        // ever sets `change_slice`, so comparing raw `slice` values without
        // first checking `change_slice` would spuriously merge two unrelated
        // notes on the same clip.
        let clip = ClipId::new_for_test(1);
        let mut a = base_command(clip);
        a.midi_note = 60;
        let mut b = base_command(clip);
        b.midi_note = 61;
        assert!(!a.equivalent(&b));
    }

    #[test]
    fn differing_slice_change_breaks_equivalence() {
        let clip = ClipId::new_for_test(1);
        let a = base_command(clip);
        let mut b = base_command(clip);
        b.slice = 1;
        b.change_slice = true;
        assert!(!a.equivalent(&b));
    }

    #[test]
    fn merge_unions_flags_and_takes_later_values() {
        let clip = ClipId::new_for_test(1);
        let mut resident = base_command(clip);
        resident.change_pitch = true;
        resident.pitch_change = 1.0;

        let mut incoming = base_command(clip);
        incoming.change_volume = true;
        incoming.volume = 0.5;
        incoming.change_pitch = true;
        incoming.pitch_change = 2.0;

        resident.merge_from(&incoming);

        assert!(resident.change_pitch && resident.change_volume);
        assert_eq!(resident.pitch_change, 2.0);
        assert_eq!(resident.volume, 0.5);
    }

    #[test]
    fn reset_restores_default_command() {
        let mut cmd = base_command(ClipId::new_for_test(1));
        cmd.reset();
        assert_eq!(cmd, ClipCommand::default());
    }
}
