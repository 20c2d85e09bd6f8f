//! The beat-grid step ring: `STEP_RING_COUNT` slots, each holding whatever is
//! scheduled to fire on that absolute tick modulo the ring size. Producers
//! (any thread) write into future slots; the SyncTimer audio thread is the
//! sole reader/consumer, advancing one slot per tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use static_assertions::const_assert;

use crate::command::{ClipCommand, StepMidiEvent, TimerCommand};
use crate::mutex_util::non_blocking_lock;
use crate::pool::CommandPool;

pub const STEP_RING_COUNT: u64 = 32_768;
// `slot()` relies on a power-of-two ring size to reduce modulo to a mask.
const_assert!(STEP_RING_COUNT.is_power_of_two());

#[derive(Default)]
struct StepPayload {
    midi_buffer: Vec<StepMidiEvent>,
    clip_commands: Vec<ClipCommand>,
    timer_commands: Vec<TimerCommand>,
}

pub struct Step {
    /// Set by the consumer once it has dispatched this slot's contents; left
    /// untouched until the next producer to touch this slot calls
    /// `ensure_fresh`, which is also when stale timer commands are finally
    /// returned to the pool.
    played: AtomicBool,
    payload: Mutex<StepPayload>,
}

impl Default for Step {
    fn default() -> Self {
        Self { played: AtomicBool::new(false), payload: Mutex::new(StepPayload::default()) }
    }
}

impl Step {
    /// Called by producers before writing into this slot. If the slot still
    /// carries the previous cycle's already-dispatched contents, reclaim its
    /// timer commands and clear it out.
    pub fn ensure_fresh(&self, timer_pool: &CommandPool<TimerCommand>) {
        if self.played.load(Ordering::Acquire) {
            let mut payload = non_blocking_lock(&self.payload, "step payload");
            for cmd in payload.timer_commands.drain(..) {
                timer_pool.release(cmd);
            }
            payload.clip_commands.clear();
            payload.midi_buffer.clear();
            self.played.store(false, Ordering::Release);
        }
    }

    pub fn push_midi(&self, event: StepMidiEvent) {
        non_blocking_lock(&self.payload, "step payload").midi_buffer.push(event);
    }

    /// Schedule a clip command into this slot, merging into an equivalent
    /// resident command if one is already here instead of adding a second.
    pub fn push_clip_command(&self, command: ClipCommand, clip_pool: &CommandPool<ClipCommand>) {
        let mut payload = non_blocking_lock(&self.payload, "step payload");
        if let Some(resident) = payload.clip_commands.iter_mut().find(|r| r.equivalent(&command)) {
            resident.merge_from(&command);
            clip_pool.release(command);
        } else {
            payload.clip_commands.push(command);
        }
    }

    pub fn push_timer_command(&self, command: TimerCommand) {
        non_blocking_lock(&self.payload, "step payload").timer_commands.push(command);
    }

    /// Drain this step's contents for dispatch by the sole consumer (the
    /// SyncTimer audio thread). Leaves the containers populated (per
    /// `ensure_fresh`'s contract above) but marks the slot played.
    pub fn dispatch(
        &self,
        mut on_midi: impl FnMut(&StepMidiEvent),
        mut on_clip_command: impl FnMut(ClipCommand),
        mut on_timer_command: impl FnMut(&mut TimerCommand),
    ) {
        let mut payload = non_blocking_lock(&self.payload, "step payload");
        for event in &payload.midi_buffer {
            on_midi(event);
        }
        for command in payload.clip_commands.drain(..) {
            on_clip_command(command);
        }
        for command in payload.timer_commands.iter_mut() {
            on_timer_command(command);
        }
        self.played.store(true, Ordering::Release);
    }

    /// Forcibly retire this slot as part of a transport stop, per
    /// `SyncTimer::stop()`'s drain: already-played slots are left alone,
    /// everything else hands back its queued note-offs (for immediate
    /// replay) and its clip commands (for the caller to resubmit with volume
    /// forced to zero) and is marked played. Queued timer commands are
    /// dropped and their pool slots reclaimed, same as `ensure_fresh` would
    /// do for a played slot.
    pub fn drain_for_stop(&self, timer_pool: &CommandPool<TimerCommand>) -> (Vec<StepMidiEvent>, Vec<ClipCommand>) {
        if self.played.load(Ordering::Acquire) {
            return (Vec::new(), Vec::new());
        }
        let mut payload = non_blocking_lock(&self.payload, "step payload");
        let note_offs = payload.midi_buffer.iter().filter(|e| e.is_note_off()).copied().collect();
        let clip_commands = payload.clip_commands.drain(..).collect();
        for cmd in payload.timer_commands.drain(..) {
            timer_pool.release(cmd);
        }
        payload.midi_buffer.clear();
        self.played.store(true, Ordering::Release);
        (note_offs, clip_commands)
    }

    #[cfg(test)]
    pub fn has_pending_timer_commands(&self) -> bool {
        !self.payload.lock().unwrap().timer_commands.is_empty()
    }
}

pub struct StepRing {
    steps: Vec<Step>,
}

impl StepRing {
    pub fn new() -> Self {
        let mut steps = Vec::with_capacity(STEP_RING_COUNT as usize);
        steps.resize_with(STEP_RING_COUNT as usize, Step::default);
        Self { steps }
    }

    pub fn slot(&self, absolute_tick: u64) -> &Step {
        &self.steps[(absolute_tick % STEP_RING_COUNT) as usize]
    }
}

impl Default for StepRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::ClipId;

    #[test]
    fn ensure_fresh_is_a_no_op_on_an_untouched_slot() {
        let timer_pool = CommandPool::<TimerCommand>::new(4);
        let ring = StepRing::new();
        let step = ring.slot(5);
        step.ensure_fresh(&timer_pool);
        assert_eq!(timer_pool.available_len(), 4);
    }

    #[test]
    fn ensure_fresh_reclaims_timer_commands_left_by_a_played_slot() {
        let timer_pool = CommandPool::<TimerCommand>::new(4);
        let ring = StepRing::new();
        let step = ring.slot(5);

        step.push_timer_command(timer_pool.acquire().unwrap());
        assert_eq!(timer_pool.available_len(), 3);

        step.dispatch(|_| {}, |_| {}, |_| {});
        assert!(step.has_pending_timer_commands(), "dispatch leaves commands for ensure_fresh to reclaim");

        step.ensure_fresh(&timer_pool);
        timer_pool.reclaim();
        assert_eq!(timer_pool.available_len(), 4);
        assert!(!step.has_pending_timer_commands());
    }

    #[test]
    fn equivalent_clip_commands_merge_instead_of_stacking() {
        let clip_pool = CommandPool::<ClipCommand>::new(4);
        let ring = StepRing::new();
        let step = ring.slot(9);

        let clip = ClipId::new_for_test(1);
        let mut first = clip_pool.acquire().unwrap();
        first.clip = clip;
        first.midi_note = 60;
        first.change_pitch = true;
        first.pitch_change = 1.0;
        step.push_clip_command(first, &clip_pool);

        let mut second = clip_pool.acquire().unwrap();
        second.clip = clip;
        second.midi_note = 60;
        second.change_volume = true;
        second.volume = 0.25;
        step.push_clip_command(second, &clip_pool);

        assert_eq!(clip_pool.available_len(), 3, "the merged-away command must be released");

        let mut seen = 0;
        step.dispatch(
            |_| {},
            |cmd| {
                seen += 1;
                assert!(cmd.change_pitch && cmd.change_volume);
            },
            |_| {},
        );
        assert_eq!(seen, 1);
    }

    #[test]
    fn drain_for_stop_returns_only_note_offs_and_all_clip_commands() {
        let timer_pool = CommandPool::<TimerCommand>::new(4);
        let clip_pool = CommandPool::<ClipCommand>::new(4);
        let ring = StepRing::new();
        let step = ring.slot(3);

        step.push_midi(StepMidiEvent::new(&[0x90, 60, 127]));
        step.push_midi(StepMidiEvent::new(&[0x80, 60, 0]));
        let clip = ClipId::new_for_test(1);
        let mut cmd = clip_pool.acquire().unwrap();
        cmd.clip = clip;
        cmd.start_playback = true;
        step.push_clip_command(cmd, &clip_pool);
        step.push_timer_command(timer_pool.acquire().unwrap());

        let (note_offs, clip_commands) = step.drain_for_stop(&timer_pool);
        assert_eq!(note_offs.len(), 1);
        assert!(note_offs[0].is_note_off());
        assert_eq!(clip_commands.len(), 1);
        assert!(clip_commands[0].start_playback);

        timer_pool.reclaim();
        assert_eq!(timer_pool.available_len(), 4, "queued timer command must be reclaimed");

        // A second call on an already-played slot is a no-op.
        let (note_offs_again, clip_commands_again) = step.drain_for_stop(&timer_pool);
        assert!(note_offs_again.is_empty());
        assert!(clip_commands_again.is_empty());
    }
}
