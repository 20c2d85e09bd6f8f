//! Thin JACK timebase-master client. Publishes the BBT position SyncTimer is
//! already computing, and translates the standard MIDI transport bytes
//! (`0xFA` start, `0xFB` continue, `0xFC` stop) arriving on its MIDI input
//! into `TimerCommand`s scheduled onto SyncTimer's grid.

use jack::{Client, Control, MidiIn, MidiOut, Port, PositionBits, ProcessScope};
use num_enum::TryFromPrimitive;
use tracing::{debug, warn};

use crate::command::TimerOperation;
use crate::error::{EngineError, EngineResult};
use crate::jack_util::TransportBbt;
use crate::sync_timer::SyncTimerHandle;

/// The MIDI realtime status bytes this client reacts to; everything else on
/// `midi_in` is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum TransportByte {
    Start = 0xFA,
    Continue = 0xFB,
    Stop = 0xFC,
}

struct NoopNotifications;
impl jack::NotificationHandler for NoopNotifications {}

pub struct TransportManager {
    _async_client: jack::AsyncClient<NoopNotifications, TransportProcessHandler>,
}

impl TransportManager {
    pub fn start(client_name: &str, sync_timer: SyncTimerHandle) -> EngineResult<Self> {
        let (client, _status) = Client::new(client_name, jack::ClientOptions::NO_START_SERVER)
            .map_err(|source| EngineError::JackClient { client: "TransportManager", source })?;

        let midi_in =
            client.register_port("midi_in", MidiIn::default()).map_err(|source| EngineError::JackPort {
                client: "TransportManager",
                port: "midi_in".to_string(),
                source,
            })?;

        // Registered for parity with the external transport-control surface
        // (other clients expect a `midi_out` companion port here) even though
        // this client currently only consumes transport bytes, never emits
        // them; SyncTimer's own `beat_clock_out` port is the one that drives
        // downstream listeners.
        let _midi_out = client.register_port("midi_out", MidiOut::default()).map_err(|source| {
            EngineError::JackPort { client: "TransportManager", port: "midi_out".to_string(), source }
        })?;

        let process_handler = TransportProcessHandler { midi_in, sync_timer };

        let async_client = client
            .activate_async(NoopNotifications, process_handler)
            .map_err(|source| EngineError::JackClient { client: "TransportManager", source })?;

        Ok(Self { _async_client: async_client })
    }
}

struct TransportProcessHandler {
    midi_in: Port<MidiIn>,
    sync_timer: SyncTimerHandle,
}

impl jack::ProcessHandler for TransportProcessHandler {
    fn process(&mut self, client: &Client, ps: &ProcessScope) -> Control {
        for event in self.midi_in.iter(ps) {
            let Some(&status) = event.bytes.first() else { continue };
            let Ok(transport_byte) = TransportByte::try_from(status) else { continue };
            match transport_byte {
                TransportByte::Start => {
                    debug!("transport manager: MIDI start received");
                    self.sync_timer.schedule_timer_command(0, TimerOperation::StartPlayback, 0);
                }
                TransportByte::Continue => {
                    debug!("transport manager: MIDI continue received");
                    self.sync_timer.schedule_timer_command(0, TimerOperation::StartPlayback, 0);
                }
                TransportByte::Stop => {
                    debug!("transport manager: MIDI stop received");
                    self.sync_timer.schedule_timer_command(0, TimerOperation::StopPlayback, 0);
                }
            }
        }

        self.publish_bbt(client);
        Control::Continue
    }
}

impl TransportProcessHandler {
    /// Publish the core's bar/beat/tick/BPM to JACK every period, per the
    /// timebase-master responsibility spec.md assigns this client. rust-jack
    /// does not wrap `jack_set_timebase_callback`, so this copies the fields
    /// through `transport_reposition` instead of a dedicated timebase
    /// callback — functionally the same "just copy these fields" contract
    /// the design notes describe, driven from this client's own process call
    /// rather than a second JACK-invoked callback.
    fn publish_bbt(&self, client: &Client) {
        let current = self.sync_timer.current_bbt();
        let bbt = TransportBbt {
            bar: current.bar as i32,
            beat: current.beat as i32,
            tick: current.tick as i32,
            beats_per_minute: self.sync_timer.bpm(),
        };

        let (_, mut pos) = client.transport_query();
        pos.bar = bbt.bar;
        pos.beat = bbt.beat;
        pos.tick = bbt.tick;
        pos.beats_per_bar = crate::time::BEATS_PER_BAR as f32;
        pos.beat_type = 4.0;
        pos.ticks_per_beat = crate::time::BEAT_SUBDIVISIONS as f64;
        pos.beats_per_minute = bbt.beats_per_minute;
        pos.valid = PositionBits::BBT;

        if let Err(e) = client.transport_reposition(&pos) {
            warn!(error = ?e, "transport manager: failed to publish BBT");
        }
    }
}
