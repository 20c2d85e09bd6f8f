//! The beat-grid clock and scheduler. One JACK MIDI client drives: the
//! absolute tick counter, the MIDI transport bytes (clock/start/stop), and
//! draining each tick's `Step` — writing its MIDI buffer to the JACK port at
//! the right frame offset, handing its clip commands straight to
//! `SamplerSynth`, and applying its timer commands (tempo changes, transport
//! state, clip (un)registration). Grounded on `original_source/lib/SyncTimer.cpp`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use jack::{Client, Control, MidiOut, Port, ProcessScope};
use tracing::{debug, warn};

use crate::clock::{self, ClockHandle};
use crate::command::{ClipCommand, StepMidiEvent, TimerCommand, TimerOperation};
use crate::error::{EngineError, EngineResult};
use crate::event::EngineEvent;
use crate::mutex_util::non_blocking_lock;
use crate::pool::CommandPool;
use crate::sampler_synth::SamplerSynth;
use crate::step::{StepRing, STEP_RING_COUNT};
use crate::time::{self, BarBeatTick};

pub const FRESH_COMMAND_STASH_SIZE: usize = 4096;

const MIDI_CLOCK: u8 = 0xF8;

struct SharedState {
    step_ring: StepRing,
    clip_pool: CommandPool<ClipCommand>,
    timer_pool: CommandPool<TimerCommand>,
    sampler: Arc<Mutex<SamplerSynth>>,
    absolute_tick: AtomicU64,
    bpm_millis: std::sync::atomic::AtomicU32,
    playing: AtomicBool,
    /// How many ticks ahead of "now" producers should schedule into, derived
    /// from JACK's reported playback latency range so a command scheduled
    /// "immediately" still has time to reach the step ring before it's read.
    schedule_ahead_ticks: AtomicU64,
    event_tx: Sender<EngineEvent>,
}

impl SharedState {
    fn bpm(&self) -> f64 {
        self.bpm_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    fn set_bpm(&self, bpm: f64) {
        let clamped = time::clamp_bpm(bpm);
        self.bpm_millis.store((clamped * 1000.0) as u32, Ordering::Relaxed);
        let _ = self.event_tx.send(EngineEvent::BpmChanged(clamped));
    }
}

/// Cheap, cloneable handle used by the rest of the engine to schedule events
/// onto the grid and query transport state. The real-time JACK thread reaches
/// the same state through the `ProcessHandler`, never through this handle.
#[derive(Clone)]
pub struct SyncTimerHandle {
    shared: Arc<SharedState>,
}

impl SyncTimerHandle {
    pub fn bpm(&self) -> f64 {
        self.shared.bpm()
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.shared.set_bpm(bpm);
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    pub fn play(&self) {
        self.shared.playing.store(true, Ordering::Release);
        let _ = self.shared.event_tx.send(EngineEvent::PlaybackStateChanged { playing: true });
    }

    pub fn stop(&self) {
        self.shared.playing.store(false, Ordering::Release);
        self.drain_pending_steps();
        let _ = self.shared.event_tx.send(EngineEvent::PlaybackStateChanged { playing: false });
    }

    /// Mirrors `SyncTimer::stop()`'s drain: every not-yet-played step in the
    /// ring hands back its queued note-offs and clip commands instead of
    /// being left to fire on its own schedule, so a stop can never leave a
    /// voice sounding or a queued note-on waiting behind it. Note-offs are
    /// replayed immediately; clip commands are resubmitted with volume
    /// forced to zero (run for real, rather than dropped, so registration
    /// side effects still happen) rather than silently discarded.
    fn drain_pending_steps(&self) {
        let immediate = self.shared.step_ring.slot(self.delayed_step(0));
        for tick in 0..STEP_RING_COUNT {
            let step = self.shared.step_ring.slot(tick);
            let (note_offs, clip_commands) = step.drain_for_stop(&self.shared.timer_pool);
            for event in note_offs {
                immediate.push_midi(event);
            }
            for mut command in clip_commands {
                command.change_volume = true;
                command.volume = 0.0;
                immediate.push_clip_command(command, &self.shared.clip_pool);
            }
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.shared.absolute_tick.load(Ordering::Acquire)
    }

    pub fn current_bbt(&self) -> BarBeatTick {
        BarBeatTick::from_absolute_tick(self.current_tick())
    }

    /// Resolve "play this `delay_ticks` ticks from now" into an absolute
    /// ring slot, per spec's delayed-step rule: paused transports resolve
    /// against tick 0 (so scheduling still lands predictably before playback
    /// starts), running transports resolve against the current tick.
    pub fn delayed_step(&self, delay_ticks: u64) -> u64 {
        let base = if self.is_playing() { self.current_tick() } else { 0 };
        base + delay_ticks.max(self.shared.schedule_ahead_ticks.load(Ordering::Relaxed))
    }

    /// Draw a pooled, zeroed `ClipCommand` to fill in and pass to
    /// [`Self::schedule_clip_command`]. Returns `None` if the pool is
    /// exhausted; callers should drop the event rather than allocate a fresh
    /// one (allocating here would defeat the point of the pool).
    pub fn acquire_clip_command(&self) -> Option<ClipCommand> {
        self.shared.clip_pool.acquire()
    }

    pub fn schedule_clip_command(&self, delay_ticks: u64, command: ClipCommand) {
        let absolute = self.delayed_step(delay_ticks);
        let step = self.shared.step_ring.slot(absolute);
        step.ensure_fresh(&self.shared.timer_pool);
        step.push_clip_command(command, &self.shared.clip_pool);
    }

    pub fn schedule_timer_command(&self, delay_ticks: u64, operation: TimerOperation, parameter: i64) {
        let Some(mut command) = self.shared.timer_pool.acquire() else {
            warn!("schedule_timer_command: pool exhausted, dropping command");
            return;
        };
        command.operation = Some(operation);
        command.parameter = parameter;
        let absolute = self.delayed_step(delay_ticks);
        let step = self.shared.step_ring.slot(absolute);
        step.ensure_fresh(&self.shared.timer_pool);
        step.push_timer_command(command);
    }

    pub fn reclaim_pools(&self) {
        self.shared.clip_pool.reclaim();
        self.shared.timer_pool.reclaim();
    }

    /// The same `ClipCommand` pool the SyncTimer process callback releases
    /// dispatched commands back into. Shared with `audio_engine`'s sampler
    /// render callback so a voice finishing naturally mid-block can release
    /// its command without a second, disjoint pool.
    pub(crate) fn clip_pool(&self) -> &CommandPool<ClipCommand> {
        &self.shared.clip_pool
    }
}

/// No notifications of interest beyond what the process callback itself
/// handles; JACK still requires a handler to be supplied.
struct NoopNotifications;
impl jack::NotificationHandler for NoopNotifications {}

pub struct SyncTimer {
    handle: SyncTimerHandle,
    _async_client: jack::AsyncClient<NoopNotifications, SyncTimerProcessHandler>,
    clock: Option<ClockHandle>,
}

impl SyncTimer {
    pub fn start(
        client_name: &str,
        sampler: Arc<Mutex<SamplerSynth>>,
        event_tx: Sender<EngineEvent>,
    ) -> EngineResult<Self> {
        let (client, _status) =
            Client::new(client_name, jack::ClientOptions::NO_START_SERVER).map_err(|source| {
                EngineError::JackClient { client: "SyncTimer", source }
            })?;

        let midi_out = client
            .register_port("beat_clock_out", MidiOut::default())
            .map_err(|source| EngineError::JackPort {
                client: "SyncTimer",
                port: "beat_clock_out".to_string(),
                source,
            })?;

        // A real playback latency range is only available from JACK after the
        // port is connected, which hasn't happened yet at construction time;
        // seed the estimate from the sample rate alone and let it stay
        // conservative (a quarter of a tick at 120 BPM; see the function doc).
        let schedule_ahead_ticks = estimate_schedule_ahead_ticks(client.sample_rate() as f64);

        let shared = Arc::new(SharedState {
            step_ring: StepRing::new(),
            clip_pool: CommandPool::new(FRESH_COMMAND_STASH_SIZE),
            timer_pool: CommandPool::new(FRESH_COMMAND_STASH_SIZE),
            sampler,
            absolute_tick: AtomicU64::new(0),
            bpm_millis: std::sync::atomic::AtomicU32::new(120_000),
            playing: AtomicBool::new(false),
            schedule_ahead_ticks: std::sync::atomic::AtomicU64::new(schedule_ahead_ticks),
            event_tx,
        });

        let handle = SyncTimerHandle { shared: shared.clone() };

        let process_handler = SyncTimerProcessHandler {
            shared: shared.clone(),
            midi_out,
            frames_until_next_tick: 0.0,
            midi_clock_counter: 0,
            overflow_scratch: Vec::new(),
        };

        let async_client = client
            .activate_async(NoopNotifications, process_handler)
            .map_err(|source| EngineError::JackClient { client: "SyncTimer", source })?;

        Ok(Self { handle, _async_client: async_client, clock: None })
    }

    pub fn handle(&self) -> SyncTimerHandle {
        self.handle.clone()
    }

    /// Spawn the low-priority garbage-reclaim timer: periodically folds
    /// released commands back into the pools.
    pub fn spawn_reclaim_timer(&mut self) {
        let handle = self.handle.clone();
        self.clock = Some(clock::spawn(
            || 120.0, // the reclaim cadence doesn't need to track the real tempo
            move || handle.reclaim_pools(),
        ));
    }
}

fn estimate_schedule_ahead_ticks(sample_rate: f64) -> u64 {
    // A conservative quarter of a tick's worth of frames at 120 BPM, floored
    // at 1 so "schedule right now" never lands on an already-consumed slot.
    let subbeat_frames = time::subbeat_duration_ns(120.0) / 1e9 * sample_rate;
    (subbeat_frames / 4.0).max(1.0) as u64
}

struct SyncTimerProcessHandler {
    shared: Arc<SharedState>,
    midi_out: Port<MidiOut>,
    /// Fractional frame countdown to the next tick; only ever touched from
    /// the JACK processing thread, so it needs no synchronization.
    frames_until_next_tick: f64,
    midi_clock_counter: u32,
    /// Events that didn't fit in a period's MIDI buffer (`NotEnoughSpace`),
    /// replayed at frame 0 of the next period before anything else goes out.
    /// Only ever touched from the JACK processing thread.
    overflow_scratch: Vec<StepMidiEvent>,
}

impl jack::ProcessHandler for SyncTimerProcessHandler {
    fn process(&mut self, client: &Client, ps: &ProcessScope) -> Control {
        let mut writer = self.midi_out.writer(ps);
        let n_frames = ps.n_frames() as f64;
        let sample_rate = client.sample_rate() as f64;
        let playing = self.shared.playing.load(Ordering::Acquire);

        if !self.overflow_scratch.is_empty() {
            for event in std::mem::take(&mut self.overflow_scratch) {
                write_midi_event(&mut writer, 0, &event, &mut self.overflow_scratch);
            }
        }

        if self.frames_until_next_tick <= 0.0 {
            let bpm = self.shared.bpm();
            self.frames_until_next_tick = time::subbeat_duration_ns(bpm) / 1e9 * sample_rate;
        }

        let mut consumed = 0.0;
        while consumed < n_frames {
            if self.frames_until_next_tick > n_frames - consumed {
                self.frames_until_next_tick -= n_frames - consumed;
                break;
            }
            let offset = (consumed + self.frames_until_next_tick) as u32;
            consumed += self.frames_until_next_tick;

            let bpm = self.shared.bpm();
            self.frames_until_next_tick = time::subbeat_duration_ns(bpm) / 1e9 * sample_rate;

            advance_one_tick(
                &self.shared,
                &mut self.midi_clock_counter,
                offset,
                playing,
                &mut writer,
                &mut self.overflow_scratch,
            );
        }

        Control::Continue
    }
}

/// Writes one MIDI event at `frame_offset`. A full period buffer surfaces as
/// `jack::Error::NotEnoughSpace` (the rust-jack mapping of `ENOBUFS`); rather
/// than dropping the event it goes into `overflow_scratch` for replay at the
/// very start of the next period, mirroring the original's `missingBitsBuffer`
/// diversion instead of losing the event outright.
fn write_midi_event(
    writer: &mut jack::MidiWriter<'_>,
    frame_offset: u32,
    event: &StepMidiEvent,
    overflow_scratch: &mut Vec<StepMidiEvent>,
) {
    if let Err(e) = writer.write(&jack::RawMidi { time: frame_offset, bytes: event.as_slice() }) {
        if matches!(e, jack::Error::NotEnoughSpace) {
            warn!("sync timer: midi buffer full, diverting event to next period");
            overflow_scratch.push(*event);
        } else {
            warn!(error = ?e, "sync timer: midi buffer write failed, dropping event");
        }
    }
}

fn advance_one_tick(
    shared: &Arc<SharedState>,
    midi_clock_counter: &mut u32,
    frame_offset: u32,
    playing: bool,
    writer: &mut jack::MidiWriter<'_>,
    overflow_scratch: &mut Vec<StepMidiEvent>,
) {
    let tick = shared.absolute_tick.fetch_add(1, Ordering::AcqRel) + 1;

    if !playing {
        return;
    }

    *midi_clock_counter += 1;
    if *midi_clock_counter >= time::TICKS_PER_MIDI_BEAT_CLOCK {
        *midi_clock_counter = 0;
        if let Err(e) = writer.write(&jack::RawMidi { time: frame_offset, bytes: &[MIDI_CLOCK] }) {
            warn!(error = ?e, "sync timer: failed to write beat clock, dropping");
        }
    }

    let step = shared.step_ring.slot(tick);
    let sampler = &shared.sampler;
    let event_tx = &shared.event_tx;
    let clip_pool = &shared.clip_pool;
    let bpm_millis = &shared.bpm_millis;
    let playing_flag = &shared.playing;

    step.dispatch(
        |midi_event: &StepMidiEvent| {
            write_midi_event(writer, frame_offset, midi_event, overflow_scratch);
        },
        |clip_command: ClipCommand| {
            non_blocking_lock(sampler, "sampler synth (from sync timer)")
                .handle_clip_command(clip_command, clip_pool);
        },
        |timer_command: &mut TimerCommand| {
            dispatch_timer_command(timer_command, bpm_millis, playing_flag, event_tx);
        },
    );
}

fn dispatch_timer_command(
    command: &mut TimerCommand,
    bpm_millis: &std::sync::atomic::AtomicU32,
    playing: &AtomicBool,
    event_tx: &Sender<EngineEvent>,
) {
    let Some(operation) = command.operation else { return };
    match operation {
        TimerOperation::SetBpm => {
            let clamped = time::clamp_bpm(command.parameter as f64 / 1000.0);
            bpm_millis.store((clamped * 1000.0) as u32, Ordering::Relaxed);
            let _ = event_tx.send(EngineEvent::BpmChanged(clamped));
        }
        TimerOperation::StartPlayback => {
            playing.store(true, Ordering::Release);
            let _ = event_tx.send(EngineEvent::PlaybackStateChanged { playing: true });
        }
        TimerOperation::StopPlayback => {
            playing.store(false, Ordering::Release);
            let _ = event_tx.send(EngineEvent::PlaybackStateChanged { playing: false });
        }
        TimerOperation::RegisterClip | TimerOperation::UnregisterClip => {
            // Clip (un)registration is carried out by `SamplerSynth` directly
            // (see `Engine::register_clip`); this slot exists so scheduling a
            // (un)registration onto the grid is possible, e.g. to line up a
            // clip swap with a bar boundary.
            debug!(?operation, clip = ?command.clip, "sync timer: scheduled clip (un)registration");
        }
        TimerOperation::StartClipLoop | TimerOperation::StopClipLoop | TimerOperation::ClipCommand => {
            debug!(?operation, "sync timer: clip-command-carrying timer operation dispatched");
        }
        TimerOperation::SamplerChannelEnabledState => {
            debug!("sync timer: sampler channel enabled-state operation dispatched");
        }
        TimerOperation::StartPart | TimerOperation::StopPart => {
            debug!(?operation, "sync timer: part transport operation dispatched");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_ahead_estimate_is_never_zero() {
        assert!(estimate_schedule_ahead_ticks(48_000.0) >= 1);
    }

    #[test]
    fn bbt_advances_with_tick_count() {
        let bbt = BarBeatTick::from_absolute_tick(0);
        assert_eq!(bbt, BarBeatTick { bar: 1, beat: 1, tick: 0 });
    }

    fn test_handle() -> SyncTimerHandle {
        let (event_tx, _event_rx) = crate::event::event_channel();
        let shared = Arc::new(SharedState {
            step_ring: StepRing::new(),
            clip_pool: CommandPool::new(8),
            timer_pool: CommandPool::new(8),
            sampler: Arc::new(Mutex::new(SamplerSynth::new(44_100.0))),
            absolute_tick: AtomicU64::new(10),
            bpm_millis: std::sync::atomic::AtomicU32::new(120_000),
            playing: AtomicBool::new(true),
            schedule_ahead_ticks: std::sync::atomic::AtomicU64::new(1),
            event_tx,
        });
        SyncTimerHandle { shared }
    }

    #[test]
    fn stop_replays_queued_note_offs_and_zeroes_pending_clip_commands() {
        let handle = test_handle();
        let pending_tick = handle.current_tick() + 2;
        let pending_step = handle.shared.step_ring.slot(pending_tick);

        pending_step.push_midi(StepMidiEvent::new(&[0x90, 60, 127]));
        pending_step.push_midi(StepMidiEvent::new(&[0x80, 60, 0]));
        let mut cmd = handle.shared.clip_pool.acquire().unwrap();
        cmd.clip = crate::clip::ClipId::new_for_test(7);
        cmd.start_playback = true;
        cmd.volume = 1.0;
        pending_step.push_clip_command(cmd, &handle.shared.clip_pool);

        handle.stop();
        assert!(!handle.is_playing());

        let immediate_step = handle.shared.step_ring.slot(handle.delayed_step(0));
        let mut seen_note_off = false;
        let mut seen_zeroed_clip_command = false;
        immediate_step.dispatch(
            |event| {
                if *event == StepMidiEvent::new(&[0x80, 60, 0]) {
                    seen_note_off = true;
                }
            },
            |cmd| {
                if cmd.start_playback && cmd.change_volume && cmd.volume == 0.0 {
                    seen_zeroed_clip_command = true;
                }
            },
            |_| {},
        );
        assert!(seen_note_off, "queued note-off must be replayed on stop");
        assert!(seen_zeroed_clip_command, "pending clip command must be resubmitted with volume forced to zero");
    }

    #[test]
    fn stop_is_a_no_op_on_an_already_drained_ring() {
        let handle = test_handle();
        handle.stop();
        handle.stop();
        assert!(!handle.is_playing());
    }
}
