//! Observer boundary. Stands in for the UI/property-binding layer that spec.md
//! places out of scope: every component holds a clone of an
//! `crossbeam_channel::Sender<EngineEvent>` and pushes onto it instead of calling
//! back into a UI toolkit directly, mirroring the teacher's own
//! `crossbeam_channel::Sender<MatrixCommand>` / outward-event plumbing.

use crossbeam_channel::{Receiver, Sender};

use crate::clip::ClipId;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// SyncTimer's BPM changed (clamped value).
    BpmChanged(f64),
    /// SyncTimer started or stopped the transport.
    PlaybackStateChanged { playing: bool },
    /// A MIDI listener port observed an incoming message, tagged with which of
    /// the four listener roles received it.
    MidiListener { listener: MidiListenerKind, bytes: Vec<u8> },
    /// A hardware MIDI input device appeared or disappeared.
    DeviceHotplug { port_name: String, connected: bool },
    /// AudioLevels' 30 Hz publish tick for one channel.
    LevelsUpdate { channel: LevelsChannel, peak_db: f32, peak_hold_db: f32 },
    /// DiskWriter started or finished recording to a file.
    RecordingStateChanged { recording: bool, path: Option<String> },
    /// A clip finished natural playback (reached its stop position, non-looping).
    ClipPlaybackEnded { clip: ClipId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiListenerKind {
    HardwareIn,
    SyncTimerOut,
    ExternalOut,
    InternalPassthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelsChannel {
    Capture,
    Playback,
    Recorder,
    SketchpadChannel(u8),
}

pub fn event_channel() -> (Sender<EngineEvent>, Receiver<EngineEvent>) {
    crossbeam_channel::unbounded()
}
