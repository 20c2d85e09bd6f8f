//! 16-channel MIDI demultiplexer. A single `current_channel` selector (set by
//! the host, e.g. from a UI) decides which numbered output bus ("Channel0"..
//! "Channel15") hardware note-ons are routed to; the note-off for a held note
//! keeps following wherever its note-on went even if the selector is moved in
//! the meantime, via a flat per-note activation latch kept per hardware input
//! device (`original_source/lib/MidiRouter.cpp`'s `noteActivations`/
//! `activeNoteChannel`, which are keyed by note only, not by channel).
//!
//! Messages arriving on the `SyncTimerIn` control port are channel-addressed
//! instead: the low nibble of the status byte picks the output bus directly.

use std::collections::HashMap;

use derive_more::Display;
use tracing::{debug, warn};

use crate::command::StepMidiEvent;
use crate::config::RouterConfig;
use crate::event::{EngineEvent, MidiListenerKind};
use crate::jack_util::connect_ports;

pub const CHANNEL_COUNT: usize = 16;
const NOTE_COUNT: usize = 128;
/// Hardware MIDI input devices are patched into a bounded pool of
/// pre-registered input ports rather than registering a fresh JACK port per
/// device at hotplug time, trading the original's unbounded dynamic port
/// count for a fixed, real-time-safe set.
pub const HARDWARE_INPUT_SLOTS: usize = 8;
/// The raw JACK port-type string for MIDI (`JACK_DEFAULT_MIDI_TYPE` in
/// jack/types.h), used to filter `Client::ports` to hardware MIDI outputs.
const JACK_MIDI_TYPE: &str = "8 bit raw midi";

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Zynthian,
    Sampler,
    External,
    None,
}

/// One of the router's 16 numbered output busses.
#[derive(Clone)]
struct ChannelOutput {
    destination: Destination,
    /// `None` means "use this channel's own index" (the original's
    /// `externalChannel == -1` sentinel).
    external_channel: Option<u8>,
    /// Which MIDI channel(s) a Zynthian-bound message is rewritten to and
    /// fanned out across, within this same output port.
    zynthian_channels: Vec<u8>,
}

impl ChannelOutput {
    fn new(channel: u8) -> Self {
        Self { destination: Destination::Zynthian, external_channel: None, zynthian_channels: vec![channel] }
    }
}

/// Per-note activation bookkeeping for one hardware input device, keyed by
/// note only (not channel): a count rather than a bool because the same note
/// can be pressed by more than one physical key-down in odd MIDI setups
/// (sustain pedal replay, merged controllers), and the latched output channel
/// only clears once the count drops back to 0.
struct InputDevice {
    note_activations: [u8; NOTE_COUNT],
    active_output_channel: [u8; NOTE_COUNT],
}

impl Default for InputDevice {
    fn default() -> Self {
        Self { note_activations: [0; NOTE_COUNT], active_output_channel: [0; NOTE_COUNT] }
    }
}

/// Routes one decoded MIDI event to one of the router's numbered output
/// busses. Returned by the pure routing functions so callers (the JACK
/// process callback, tests) can write it to the right output port without
/// this module knowing about JACK at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutedEvent {
    pub output_channel: u8,
    pub destination: Destination,
    pub event: StepMidiEvent,
}

pub struct MidiRouter {
    config: RouterConfig,
    current_channel: u8,
    outputs: Vec<ChannelOutput>,
    devices: HashMap<String, InputDevice>,
}

impl MidiRouter {
    pub fn new(config: RouterConfig) -> Self {
        let outputs = (0..CHANNEL_COUNT as u8).map(ChannelOutput::new).collect();
        Self { config, current_channel: 0, outputs, devices: HashMap::new() }
    }

    pub fn set_current_channel(&mut self, channel: u8) {
        self.current_channel = channel.min((CHANNEL_COUNT - 1) as u8);
    }

    pub fn current_channel(&self) -> u8 {
        self.current_channel
    }

    pub fn set_channel_destination(&mut self, channel: usize, destination: Destination, external_channel: Option<u8>) {
        if let Some(output) = self.outputs.get_mut(channel) {
            output.destination = destination;
            output.external_channel = external_channel;
        }
    }

    pub fn set_zynthian_channels(&mut self, channel: usize, zynthian_channels: Vec<u8>) {
        if let Some(output) = self.outputs.get_mut(channel) {
            output.zynthian_channels = zynthian_channels;
        }
    }

    pub fn device_connected(&mut self, port_name: &str) {
        self.devices.entry(port_name.to_string()).or_default();
    }

    /// Hot-unplug handling: emit a synthetic note-off for every note this
    /// device left sounding, addressed to whichever output channel its
    /// matching note-on actually latched.
    pub fn device_disconnected(&mut self, port_name: &str) -> Vec<RoutedEvent> {
        let mut synthetic_note_offs = Vec::new();
        if let Some(device) = self.devices.remove(port_name) {
            for note in 0..NOTE_COUNT {
                if device.note_activations[note] > 0 {
                    let output_channel = device.active_output_channel[note];
                    synthetic_note_offs.extend(self.route_to_output(output_channel, &[0x80, note as u8, 0]));
                }
            }
        }
        synthetic_note_offs
    }

    /// Route one incoming MIDI message from a hardware input device. Channel
    /// voice messages go to `current_channel`'s output; note on/off latches
    /// (and, for a note-off, recalls) that device+note's own output channel so
    /// reassigning `current_channel` mid-note can't split a note-on from its
    /// note-off.
    pub fn route_hardware_input(&mut self, port_name: &str, bytes: &[u8]) -> Vec<RoutedEvent> {
        if !self.config.port_allowed(port_name) {
            debug!(port_name, "route_hardware_input: port filtered out");
            return Vec::new();
        }
        if bytes.is_empty() || bytes[0] & 0xF0 == 0xF0 {
            return Vec::new();
        }
        let status = bytes[0] & 0xF0;
        let current = self.current_channel;
        let mut output_channel = current;

        if (status == 0x80 || status == 0x90) && bytes.len() >= 3 {
            let note = bytes[1] as usize;
            let note_on = status == 0x90 && bytes[2] > 0;
            let device = self.devices.entry(port_name.to_string()).or_default();
            if note_on {
                device.note_activations[note] = device.note_activations[note].saturating_add(1);
                if device.note_activations[note] == 1 {
                    device.active_output_channel[note] = current;
                }
            } else {
                device.note_activations[note] = 0;
            }
            output_channel = device.active_output_channel[note];
        }

        self.route_to_output(output_channel, bytes)
    }

    /// Route one incoming MIDI message from the `SyncTimerIn` control port:
    /// channel-addressed, the low nibble of the status byte picks the output
    /// bus directly (no note-activation latching, since these messages already
    /// encode their intended destination).
    pub fn route_sync_timer_input(&self, bytes: &[u8]) -> Vec<RoutedEvent> {
        if bytes.is_empty() || bytes[0] & 0xF0 == 0xF0 {
            return Vec::new();
        }
        let output_channel = bytes[0] & 0x0F;
        self.route_to_output(output_channel, bytes)
    }

    /// Shared destination-handling logic: `Zynthian` fans the message out
    /// (channel-rewritten) across every configured zynthian channel within
    /// this same output port; `External` rewrites to the configured override
    /// channel (or the output's own index); `Sampler` passes the bytes through
    /// unchanged; `None` drops the message.
    fn route_to_output(&self, output_channel: u8, bytes: &[u8]) -> Vec<RoutedEvent> {
        let Some(output) = self.outputs.get(output_channel as usize) else { return Vec::new() };
        match output.destination {
            Destination::Zynthian => output
                .zynthian_channels
                .iter()
                .map(|&channel| RoutedEvent {
                    output_channel,
                    destination: Destination::Zynthian,
                    event: rewrite_channel(bytes, channel),
                })
                .collect(),
            Destination::Sampler => {
                vec![RoutedEvent { output_channel, destination: Destination::Sampler, event: StepMidiEvent::new(bytes) }]
            }
            Destination::External => {
                let external_channel = output.external_channel.unwrap_or(output_channel);
                vec![RoutedEvent {
                    output_channel,
                    destination: Destination::External,
                    event: rewrite_channel(bytes, external_channel),
                }]
            }
            Destination::None => {
                warn!(output_channel, "route_to_output: channel has no destination configured, dropping");
                Vec::new()
            }
        }
    }

    pub fn listener_event(&self, listener: MidiListenerKind, bytes: &[u8]) -> EngineEvent {
        EngineEvent::MidiListener { listener, bytes: bytes.to_vec() }
    }
}

fn rewrite_channel(bytes: &[u8], channel: u8) -> StepMidiEvent {
    let mut data = [0u8; 3];
    let len = bytes.len().min(3);
    data[..len].copy_from_slice(&bytes[..len]);
    data[0] = (data[0] & 0xF0) | (channel & 0x0F);
    StepMidiEvent::new(&data[..len])
}

/// JACK client wiring: a bounded pool of hardware MIDI input ports (patched in
/// by the notification handler as hardware appears/disappears), one
/// `SyncTimerIn` control input, and 16 numbered `Channel0`..`Channel15` output
/// ports.
pub struct MidiRouterClient {
    _async_client: jack::AsyncClient<MidiRouterNotifications, MidiRouterProcessHandler>,
}

enum HotplugEvent {
    Connected { slot: usize, port_name: String },
    Disconnected { slot: usize, port_name: String },
}

/// Watches for hardware MIDI devices appearing/disappearing and patches them
/// into the bounded input-slot pool, mirroring the original's
/// `client_port_registration`/`client_registration` callbacks deferring into
/// `connectHardwareInputs()`. Runs on JACK's own notification thread, so
/// connecting ports here (unlike in `process()`) is not real-time-sensitive.
pub struct MidiRouterNotifications {
    slot_port_names: Vec<String>,
    bound: [Option<String>; HARDWARE_INPUT_SLOTS],
    hotplug_tx: crossbeam_channel::Sender<HotplugEvent>,
}

impl MidiRouterNotifications {
    fn rescan(&mut self, client: &jack::Client) {
        let physical =
            client.ports(None, Some(JACK_MIDI_TYPE), jack::PortFlags::IS_OUTPUT | jack::PortFlags::IS_PHYSICAL);

        for port_name in &physical {
            if self.bound.iter().any(|b| b.as_deref() == Some(port_name.as_str())) {
                continue;
            }
            let Some(slot) = self.bound.iter().position(|b| b.is_none()) else {
                warn!(port_name, "midi router: no free hardware input slot, device ignored");
                continue;
            };
            let destination = format!("{}:{}", client.name(), self.slot_port_names[slot]);
            if let Err(e) = connect_ports(client, port_name, &destination) {
                warn!(port_name, error = ?e, "midi router: failed to connect hardware input");
                continue;
            }
            self.bound[slot] = Some(port_name.clone());
            let _ = self.hotplug_tx.send(HotplugEvent::Connected { slot, port_name: port_name.clone() });
        }

        for slot in 0..HARDWARE_INPUT_SLOTS {
            if let Some(port_name) = self.bound[slot].clone() {
                if !physical.contains(&port_name) {
                    self.bound[slot] = None;
                    let _ = self.hotplug_tx.send(HotplugEvent::Disconnected { slot, port_name });
                }
            }
        }
    }
}

impl jack::NotificationHandler for MidiRouterNotifications {
    fn port_registration(&mut self, client: &jack::Client, _port_id: jack::PortId, _is_registered: bool) {
        self.rescan(client);
    }

    fn client_registration(&mut self, client: &jack::Client, _name: &str, _is_registered: bool) {
        self.rescan(client);
    }
}

impl MidiRouterClient {
    pub fn start(
        client_name: &str,
        config: RouterConfig,
        event_tx: crossbeam_channel::Sender<EngineEvent>,
    ) -> crate::error::EngineResult<Self> {
        use crate::error::EngineError;
        use jack::{MidiIn, MidiOut};

        let (client, _status) = jack::Client::new(client_name, jack::ClientOptions::NO_START_SERVER)
            .map_err(|source| EngineError::JackClient { client: "MidiRouter", source })?;

        let sync_timer_in = client.register_port("SyncTimerIn", MidiIn::default()).map_err(|source| {
            EngineError::JackPort { client: "MidiRouter", port: "SyncTimerIn".to_string(), source }
        })?;

        let mut hardware_inputs = Vec::with_capacity(HARDWARE_INPUT_SLOTS);
        let mut slot_port_names = Vec::with_capacity(HARDWARE_INPUT_SLOTS);
        for slot in 0..HARDWARE_INPUT_SLOTS {
            let name = format!("hardware_in_{slot}");
            let port = client.register_port(&name, MidiIn::default()).map_err(|source| EngineError::JackPort {
                client: "MidiRouter",
                port: name.clone(),
                source,
            })?;
            slot_port_names.push(name);
            hardware_inputs.push(port);
        }

        let mut channel_outs = Vec::with_capacity(CHANNEL_COUNT);
        for channel in 0..CHANNEL_COUNT {
            let name = format!("Channel{channel}");
            let port = client.register_port(&name, MidiOut::default()).map_err(|source| EngineError::JackPort {
                client: "MidiRouter",
                port: name.clone(),
                source,
            })?;
            channel_outs.push(port);
        }

        let (hotplug_tx, hotplug_rx) = crossbeam_channel::unbounded();

        let process_handler = MidiRouterProcessHandler {
            router: MidiRouter::new(config),
            sync_timer_in,
            hardware_inputs,
            slot_bindings: Default::default(),
            channel_outs,
            hotplug_rx,
            event_tx,
        };

        let notifications = MidiRouterNotifications {
            slot_port_names,
            bound: Default::default(),
            hotplug_tx,
        };

        let async_client = client
            .activate_async(notifications, process_handler)
            .map_err(|source| EngineError::JackClient { client: "MidiRouter", source })?;

        Ok(Self { _async_client: async_client })
    }
}

struct MidiRouterProcessHandler {
    router: MidiRouter,
    sync_timer_in: jack::Port<jack::MidiIn>,
    hardware_inputs: Vec<jack::Port<jack::MidiIn>>,
    /// Which hardware device name (if any) is currently patched into each
    /// `hardware_inputs` slot; kept in sync with [`MidiRouterNotifications`]
    /// purely via `hotplug_rx`, so the audio thread never touches a lock.
    slot_bindings: [Option<String>; HARDWARE_INPUT_SLOTS],
    channel_outs: Vec<jack::Port<jack::MidiOut>>,
    hotplug_rx: crossbeam_channel::Receiver<HotplugEvent>,
    event_tx: crossbeam_channel::Sender<EngineEvent>,
}

impl jack::ProcessHandler for MidiRouterProcessHandler {
    fn process(&mut self, _client: &jack::Client, ps: &jack::ProcessScope) -> jack::Control {
        let mut pending: Vec<RoutedEvent> = Vec::new();

        for hotplug in self.hotplug_rx.try_iter() {
            match hotplug {
                HotplugEvent::Connected { slot, port_name } => {
                    self.router.device_connected(&port_name);
                    let _ = self.event_tx.send(EngineEvent::DeviceHotplug { port_name: port_name.clone(), connected: true });
                    self.slot_bindings[slot] = Some(port_name);
                }
                HotplugEvent::Disconnected { slot, port_name } => {
                    pending.extend(self.router.device_disconnected(&port_name));
                    let _ = self.event_tx.send(EngineEvent::DeviceHotplug { port_name, connected: false });
                    self.slot_bindings[slot] = None;
                }
            }
        }

        for slot in 0..HARDWARE_INPUT_SLOTS {
            let Some(device_name) = self.slot_bindings[slot].clone() else { continue };
            let router = &mut self.router;
            let event_tx = &self.event_tx;
            let events: Vec<RoutedEvent> = self.hardware_inputs[slot]
                .iter(ps)
                .flat_map(|raw| {
                    let _ = event_tx.send(router.listener_event(MidiListenerKind::HardwareIn, raw.bytes));
                    router.route_hardware_input(&device_name, raw.bytes)
                })
                .collect();
            pending.extend(events);
        }

        {
            let router = &self.router;
            let event_tx = &self.event_tx;
            let sync_timer_events: Vec<RoutedEvent> = self
                .sync_timer_in
                .iter(ps)
                .flat_map(|raw| {
                    let _ = event_tx.send(router.listener_event(MidiListenerKind::SyncTimerOut, raw.bytes));
                    router.route_sync_timer_input(raw.bytes)
                })
                .collect();
            pending.extend(sync_timer_events);
        }

        let mut writers: Vec<jack::MidiWriter<'_>> =
            self.channel_outs.iter_mut().map(|port| port.writer(ps)).collect();

        for routed in &pending {
            let bytes = routed.event.as_slice();
            if routed.destination == Destination::External {
                let _ = self.event_tx.send(self.router.listener_event(MidiListenerKind::ExternalOut, bytes));
            } else if routed.destination == Destination::Zynthian {
                let _ = self.event_tx.send(self.router.listener_event(MidiListenerKind::InternalPassthrough, bytes));
            }
            if let Some(writer) = writers.get_mut(routed.output_channel as usize) {
                if let Err(e) = writer.write(&jack::RawMidi { time: 0, bytes }) {
                    warn!(error = ?e, "midi router: output write failed, dropping event");
                }
            }
        }

        jack::Control::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> MidiRouter {
        MidiRouter::new(RouterConfig::default())
    }

    #[test]
    fn note_on_then_off_reaches_same_output_channel_despite_selector_reassignment() {
        let mut router = router();
        router.set_current_channel(3);
        let on = router.route_hardware_input("dev", &[0x90, 60, 100]);
        assert_eq!(on.len(), 1);
        assert_eq!(on[0].output_channel, 3);

        // Move the selector before the note-off arrives.
        router.set_current_channel(7);
        let off = router.route_hardware_input("dev", &[0x80, 60, 0]);
        assert_eq!(off.len(), 1);
        assert_eq!(off[0].output_channel, 3, "note-off must follow the note-on's latched output channel");
    }

    #[test]
    fn note_on_velocity_zero_is_treated_as_note_off() {
        let mut router = router();
        router.set_current_channel(2);
        router.route_hardware_input("dev", &[0x90, 60, 100]);
        router.set_current_channel(5);
        let off = router.route_hardware_input("dev", &[0x90, 60, 0]);
        assert_eq!(off[0].output_channel, 2);
    }

    #[test]
    fn hot_unplug_emits_synthetic_note_off_on_the_held_output_channel() {
        let mut router = router();
        router.set_current_channel(4);
        router.route_hardware_input("dev", &[0x92, 64, 100]);

        let synthetic = router.device_disconnected("dev");
        assert_eq!(synthetic.len(), 1);
        assert_eq!(synthetic[0].output_channel, 4);
        assert_eq!(synthetic[0].event.as_slice()[1], 64);
        assert_eq!(synthetic[0].event.as_slice()[0] & 0xF0, 0x80);
    }

    #[test]
    fn disabled_input_port_is_dropped() {
        let mut router = MidiRouter::new(RouterConfig {
            disabled_in_ports: vec!["not-allowed".to_string()],
            ..Default::default()
        });
        assert!(router.route_hardware_input("not-allowed", &[0x90, 60, 100]).is_empty());
        assert!(!router.route_hardware_input("allowed", &[0x90, 60, 100]).is_empty());
    }

    #[test]
    fn zynthian_destination_fans_out_across_configured_channels() {
        let mut router = router();
        router.set_channel_destination(0, Destination::Zynthian, None);
        router.set_zynthian_channels(0, vec![0, 1, 2]);
        router.set_current_channel(0);

        let routed = router.route_hardware_input("dev", &[0x90, 60, 100]);
        assert_eq!(routed.len(), 3);
        let channels: Vec<u8> = routed.iter().map(|r| r.event.as_slice()[0] & 0x0F).collect();
        assert_eq!(channels, vec![0, 1, 2]);
        assert!(routed.iter().all(|r| r.output_channel == 0));
    }

    #[test]
    fn external_destination_rewrites_to_override_channel() {
        let mut router = router();
        router.set_channel_destination(6, Destination::External, Some(9));
        router.set_current_channel(6);

        let routed = router.route_hardware_input("dev", &[0x90, 60, 100]);
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].destination, Destination::External);
        assert_eq!(routed[0].event.as_slice()[0] & 0x0F, 9);
    }

    #[test]
    fn external_destination_without_override_uses_its_own_channel_index() {
        let mut router = router();
        router.set_channel_destination(11, Destination::External, None);
        router.set_current_channel(11);

        let routed = router.route_hardware_input("dev", &[0x90, 60, 100]);
        assert_eq!(routed[0].event.as_slice()[0] & 0x0F, 11);
    }

    #[test]
    fn no_destination_drops_the_message() {
        let mut router = router();
        router.set_channel_destination(0, Destination::None, None);
        router.set_current_channel(0);
        assert!(router.route_hardware_input("dev", &[0x90, 60, 100]).is_empty());
    }

    #[test]
    fn sync_timer_input_is_channel_addressed_directly() {
        let mut router = router();
        router.set_channel_destination(5, Destination::Sampler, None);
        let routed = router.route_sync_timer_input(&[0x95, 60, 100]);
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].output_channel, 5);
        assert_eq!(routed[0].destination, Destination::Sampler);
    }

    #[test]
    fn realtime_messages_are_ignored_on_both_input_paths() {
        let mut router = router();
        assert!(router.route_hardware_input("dev", &[0xF8]).is_empty());
        assert!(router.route_sync_timer_input(&[0xF8]).is_empty());
    }
}
