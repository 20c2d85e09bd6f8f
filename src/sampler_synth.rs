//! 16-voice polyphonic sample playback: `SamplerSynth` owns the sound table
//! and the voice pool; `Voice` owns one playing clip's read head, gain and
//! envelope. Grounded closely on `SamplerSynthVoice.cpp`'s `setCurrentCommand`/
//! `startNote`/`stopNote`/`renderNextBlock`.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::adsr::Adsr;
use crate::clip::{ClipHandle, ClipId};
use crate::command::ClipCommand;
use crate::pool::CommandPool;

pub const VOICE_COUNT: usize = 16;
pub const SKETCHPAD_CHANNEL_COUNT: usize = 10;

struct Voice {
    current_command: Option<ClipCommand>,
    clip: Option<ClipHandle>,
    pitch_ratio: f64,
    source_sample_position: f64,
    source_sample_length: f64,
    lgain: f32,
    rgain: f32,
    adsr: Adsr,
}

impl Default for Voice {
    fn default() -> Self {
        Self {
            current_command: None,
            clip: None,
            pitch_ratio: 1.0,
            source_sample_position: 0.0,
            source_sample_length: 0.0,
            lgain: 0.0,
            rgain: 0.0,
            adsr: Adsr::default(),
        }
    }
}

impl Voice {
    fn is_free(&self) -> bool {
        self.current_command.is_none()
    }

    /// Mirrors `SamplerSynthVoice::setCurrentCommand`: if this voice is already
    /// carrying a command for the same clip, fold `incoming` into it instead of
    /// starting a second voice. Returns the command that should be released
    /// back to the pool (the one that was *not* kept).
    fn merge_or_adopt(&mut self, incoming: ClipCommand) -> Option<ClipCommand> {
        if let Some(resident) = self.current_command.as_mut() {
            let restart = incoming.start_playback;
            if incoming.change_volume {
                self.lgain = incoming.volume;
                self.rgain = incoming.volume;
            }
            resident.merge_from(&incoming);
            if restart {
                if let Some(clip) = &self.clip {
                    self.source_sample_position =
                        clip.start_position_frames(resident.slice).floor();
                }
            }
            Some(incoming)
        } else {
            self.current_command = Some(incoming);
            None
        }
    }

    fn start_note(&mut self, clip: ClipHandle, device_sample_rate: f32) {
        let command = self.current_command.as_ref().expect("start_note requires a command");
        let velocity = command.volume;
        self.pitch_ratio = 2f64.powf((command.midi_note as f64 - clip.root_note() as f64) / 12.0)
            * clip.source_sample_rate() as f64
            / device_sample_rate as f64;
        self.source_sample_length = clip.duration_seconds() * clip.source_sample_rate() as f64;
        self.source_sample_position = clip.start_position_frames(command.slice).floor();
        self.lgain = velocity;
        self.rgain = velocity;

        self.adsr.set_sample_rate(clip.source_sample_rate() as f32);
        self.adsr.note_on();
        self.clip = Some(clip);
    }

    fn stop_note(&mut self, allow_tail_off: bool, clip_pool: &CommandPool<ClipCommand>) {
        if allow_tail_off {
            self.adsr.note_off();
            return;
        }
        self.adsr.reset();
        self.clip = None;
        if let Some(cmd) = self.current_command.take() {
            clip_pool.release(cmd);
        }
    }

    /// Render `frame_count` frames additively into `out_l`/`out_r`. Returns
    /// `true` if the voice naturally reached its stop position this block
    /// (non-looping) and is now free.
    fn render(&mut self, out_l: &mut [f32], out_r: &mut [f32], clip_pool: &CommandPool<ClipCommand>) -> bool {
        let Some(clip) = self.clip.clone() else { return false };
        let Some(command) = self.current_command.clone() else { return false };
        let stop_position = clip.stop_position_frames(command.slice);
        let channel_count = clip.channel_count();

        for i in 0..out_l.len() {
            let pos = self.source_sample_position as usize;
            let alpha = (self.source_sample_position - pos as f64) as f32;
            let inv_alpha = 1.0 - alpha;

            let left = clip.channel(0);
            let l = left[pos] * inv_alpha + left.get(pos + 1).copied().unwrap_or(left[pos]) * alpha;
            let r = if channel_count > 1 {
                let right = clip.channel(1);
                right[pos] * inv_alpha + right.get(pos + 1).copied().unwrap_or(right[pos]) * alpha
            } else {
                l
            };

            let envelope = self.adsr.get_next_sample();
            out_l[i] += l * self.lgain * envelope;
            out_r[i] += r * self.rgain * envelope;

            self.source_sample_position += self.pitch_ratio;

            if self.source_sample_position > stop_position {
                if command.looping {
                    self.source_sample_position = clip.start_position_frames(command.slice).floor();
                } else {
                    self.stop_note(false, clip_pool);
                    clip.publish_position_progress(1.0);
                    return true;
                }
            }
        }

        if self.clip.is_some() {
            let progress = (self.source_sample_position / self.source_sample_length.max(1.0)) as f32;
            clip.publish_position_progress(progress.clamp(0.0, 1.0));
        }
        false
    }
}

/// Owns the registered-clip table and the fixed voice pool.
pub struct SamplerSynth {
    sounds: HashMap<ClipId, ClipHandle>,
    voices: [Voice; VOICE_COUNT],
    channel_enabled: [bool; SKETCHPAD_CHANNEL_COUNT],
    device_sample_rate: f32,
}

impl SamplerSynth {
    pub fn new(device_sample_rate: f32) -> Self {
        Self {
            sounds: HashMap::new(),
            voices: Default::default(),
            channel_enabled: [true; SKETCHPAD_CHANNEL_COUNT],
            device_sample_rate,
        }
    }

    pub fn register_clip(&mut self, clip: ClipHandle) {
        self.sounds.insert(clip.id(), clip);
    }

    pub fn unregister_clip(&mut self, id: ClipId) {
        self.sounds.remove(&id);
    }

    pub fn set_channel_enabled(&mut self, channel: usize, enabled: bool) {
        if let Some(slot) = self.channel_enabled.get_mut(channel) {
            *slot = enabled;
        } else {
            warn!(channel, "set_channel_enabled: channel index out of range");
        }
    }

    pub fn channel_enabled(&self, channel: usize) -> bool {
        self.channel_enabled.get(channel).copied().unwrap_or(false)
    }

    /// Dispatch a `ClipCommand`. Finds a voice already playing an equivalent
    /// command and merges into it, or claims a free voice and starts it. Drops
    /// (and releases back to the pool) the command if no voice is free.
    pub fn handle_clip_command(&mut self, command: ClipCommand, clip_pool: &CommandPool<ClipCommand>) {
        if command.stop_playback {
            // Every voice playing this sound's note gets hard-stopped, not just
            // the first match: a retriggered note can be sounding in more than
            // one voice at once, and all of them need to die together.
            for voice in self.voices.iter_mut() {
                let same_sound_and_note = voice
                    .current_command
                    .as_ref()
                    .map(|c| c.clip == command.clip && c.midi_note == command.midi_note)
                    .unwrap_or(false);
                if same_sound_and_note {
                    voice.stop_note(false, clip_pool);
                }
            }
            clip_pool.release(command);
            return;
        }

        if let Some(voice) = self
            .voices
            .iter_mut()
            .find(|v| v.current_command.as_ref().map(|c| c.equivalent(&command)).unwrap_or(false))
        {
            if let Some(leftover) = voice.merge_or_adopt(command) {
                clip_pool.release(leftover);
            }
            return;
        }

        let Some(clip) = self.sounds.get(&command.clip).cloned() else {
            warn!(clip = %command.clip, "handle_clip_command: clip not registered");
            clip_pool.release(command);
            return;
        };

        let Some(voice) = self.voices.iter_mut().find(|v| v.is_free()) else {
            debug!("handle_clip_command: no free voice");
            clip_pool.release(command);
            return;
        };

        voice.current_command = Some(command);
        voice.start_note(clip, self.device_sample_rate);
    }

    /// Render one JACK period, summing all active voices additively.
    pub fn render(&mut self, out_l: &mut [f32], out_r: &mut [f32], clip_pool: &CommandPool<ClipCommand>) {
        out_l.iter_mut().for_each(|s| *s = 0.0);
        out_r.iter_mut().for_each(|s| *s = 0.0);
        for voice in self.voices.iter_mut() {
            if voice.clip.is_some() {
                voice.render(out_l, out_r, clip_pool);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::Clip;
    use std::sync::Arc;

    #[test]
    fn unregistered_clip_releases_command_instead_of_panicking() {
        let mut synth = SamplerSynth::new(44_100.0);
        let pool = CommandPool::<ClipCommand>::new(4);
        let cmd = pool.acquire().unwrap();
        synth.handle_clip_command(cmd, &pool);
        assert_eq!(pool.available_len(), 3, "command should be queued for reclaim, not leaked");
    }

    #[test]
    fn channel_enable_defaults_to_true_and_is_settable() {
        let mut synth = SamplerSynth::new(44_100.0);
        assert!(synth.channel_enabled(0));
        synth.set_channel_enabled(0, false);
        assert!(!synth.channel_enabled(0));
    }

    fn registered_clip(synth: &mut SamplerSynth) -> ClipId {
        let clip = Clip::new_for_test(vec![vec![0.5; 1000], vec![-0.5; 1000]], 44_100, 60);
        let id = clip.id();
        synth.register_clip(Arc::new(clip));
        id
    }

    #[test]
    fn start_playback_latches_gain_from_command_volume() {
        let mut synth = SamplerSynth::new(44_100.0);
        let clip = registered_clip(&mut synth);
        let pool = CommandPool::<ClipCommand>::new(4);
        let mut cmd = pool.acquire().unwrap();
        cmd.clip = clip;
        cmd.midi_note = 60;
        cmd.start_playback = true;
        cmd.volume = 0.25;
        synth.handle_clip_command(cmd, &pool);

        let voice = synth.voices.iter().find(|v| v.clip.is_some()).expect("voice should have started");
        assert_eq!(voice.lgain, 0.25);
        assert_eq!(voice.rgain, 0.25);
    }

    #[test]
    fn stop_playback_hard_stops_every_voice_with_the_same_sound_and_note() {
        let mut synth = SamplerSynth::new(44_100.0);
        let clip = registered_clip(&mut synth);
        let pool = CommandPool::<ClipCommand>::new(8);

        // Start two voices playing the same clip/note directly (bypassing the
        // equivalent()-merge path SamplerSynth uses for start commands), to
        // simulate a retriggered note sounding in more than one voice.
        for voice in synth.voices.iter_mut().take(2) {
            let mut cmd = pool.acquire().unwrap();
            cmd.clip = clip;
            cmd.midi_note = 64;
            cmd.volume = 1.0;
            voice.current_command = Some(cmd);
            let clip_handle = synth.sounds.get(&clip).cloned().unwrap();
            voice.start_note(clip_handle, synth.device_sample_rate);
        }

        let mut stop_cmd = pool.acquire().unwrap();
        stop_cmd.clip = clip;
        stop_cmd.midi_note = 64;
        stop_cmd.stop_playback = true;
        synth.handle_clip_command(stop_cmd, &pool);

        assert!(synth.voices.iter().take(2).all(|v| v.clip.is_none()), "both voices must be hard-stopped");
    }
}
