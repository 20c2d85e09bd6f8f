//! The audio-bearing half of the JACK graph: one client renders sampler
//! voices into a stereo output pair, and a fleet of thirteen metering clients
//! (`AudioLevels-*`) each expose a stereo input pair that `AudioLevels`
//! observes every period. Neither owns any scheduling state of its own;
//! `SamplerSynth`/`AudioLevels` stay usable headless, as they already are in
//! their own test modules.

use std::sync::{Arc, Mutex};

use jack::{AudioIn, AudioOut, Client, ClientOptions, Control, ProcessScope};
use tracing::warn;

use crate::audio_levels::AudioLevels;
use crate::error::{EngineError, EngineResult};
use crate::jack_util::connect_ports;
use crate::mutex_util::non_blocking_lock;
use crate::sampler_synth::{SamplerSynth, SKETCHPAD_CHANNEL_COUNT};
use crate::sync_timer::SyncTimerHandle;

/// No notifications of interest beyond what the process callback itself
/// handles; JACK still requires a handler to be supplied.
struct NoopNotifications;
impl jack::NotificationHandler for NoopNotifications {}

/// Renders the sampler into a stereo pair every JACK period. Kept separate
/// from `AudioLevels-SystemPlayback` (which only meters whatever is patched
/// into it) so the sampler stays a plain render target any host's JACK graph
/// can route however it likes.
pub struct SamplerAudioClient {
    _async_client: jack::AsyncClient<NoopNotifications, SamplerProcessHandler>,
}

impl SamplerAudioClient {
    pub fn start(client_name: &str, sampler: Arc<Mutex<SamplerSynth>>, sync_timer: SyncTimerHandle) -> EngineResult<Self> {
        let (client, _status) = Client::new(client_name, ClientOptions::NO_START_SERVER)
            .map_err(|source| EngineError::JackClient { client: "SamplerAudio", source })?;

        let out_l = client
            .register_port("out_l", AudioOut::default())
            .map_err(|source| EngineError::JackPort { client: "SamplerAudio", port: "out_l".to_string(), source })?;
        let out_r = client
            .register_port("out_r", AudioOut::default())
            .map_err(|source| EngineError::JackPort { client: "SamplerAudio", port: "out_r".to_string(), source })?;

        let process_handler = SamplerProcessHandler { sampler, out_l, out_r, sync_timer };
        let async_client = client
            .activate_async(NoopNotifications, process_handler)
            .map_err(|source| EngineError::JackClient { client: "SamplerAudio", source })?;

        // Best-effort: patch the rendered pair straight to hardware playback
        // and into the playback metering bus. EEXIST (already connected) is
        // tolerated by `connect_ports`; anything else is logged, not fatal.
        let inner = async_client.as_client();
        for (from, to) in [
            (format!("{client_name}:out_l"), "system:playback_1".to_string()),
            (format!("{client_name}:out_r"), "system:playback_2".to_string()),
            (format!("{client_name}:out_l"), "AudioLevels-SystemPlayback:left_in".to_string()),
            (format!("{client_name}:out_r"), "AudioLevels-SystemPlayback:right_in".to_string()),
        ] {
            if let Err(e) = connect_ports(inner, &from, &to) {
                warn!(%from, %to, error = ?e, "sampler audio: default connection failed");
            }
        }

        Ok(Self { _async_client: async_client })
    }
}

struct SamplerProcessHandler {
    sampler: Arc<Mutex<SamplerSynth>>,
    out_l: jack::Port<AudioOut>,
    out_r: jack::Port<AudioOut>,
    sync_timer: SyncTimerHandle,
}

impl jack::ProcessHandler for SamplerProcessHandler {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let out_l = self.out_l.as_mut_slice(ps);
        let out_r = self.out_r.as_mut_slice(ps);
        non_blocking_lock(&self.sampler, "sampler synth (from audio engine)")
            .render(out_l, out_r, self.sync_timer.clip_pool());
        Control::Continue
    }
}

/// Which bus an `AudioLevelsClient` instance feeds into `AudioLevels::tick`'s
/// corresponding `observe_*` call.
#[derive(Clone, Copy)]
enum LevelsBus {
    Capture,
    Playback,
    Recorder,
    SketchpadChannel(usize),
}

impl LevelsBus {
    fn jack_client_name(self) -> String {
        match self {
            LevelsBus::Capture => "AudioLevels-SystemCapture".to_string(),
            LevelsBus::Playback => "AudioLevels-SystemPlayback".to_string(),
            LevelsBus::Recorder => "AudioLevels-SystemRecorder".to_string(),
            LevelsBus::SketchpadChannel(channel) => format!("AudioLevels-Channel{}", channel + 1),
        }
    }
}

/// One metering client: a stereo input pair plus whichever `AudioLevels::
/// observe_*` call matches its bus.
pub struct AudioLevelsClient {
    _async_client: jack::AsyncClient<NoopNotifications, AudioLevelsProcessHandler>,
}

impl AudioLevelsClient {
    fn start(bus: LevelsBus, levels: Arc<Mutex<AudioLevels>>) -> EngineResult<Self> {
        let client_name = bus.jack_client_name();
        let (client, _status) = Client::new(&client_name, ClientOptions::NO_START_SERVER)
            .map_err(|source| EngineError::JackClient { client: "AudioLevels", source })?;

        let left_in = client
            .register_port("left_in", AudioIn::default())
            .map_err(|source| EngineError::JackPort { client: "AudioLevels", port: "left_in".to_string(), source })?;
        let right_in = client
            .register_port("right_in", AudioIn::default())
            .map_err(|source| EngineError::JackPort { client: "AudioLevels", port: "right_in".to_string(), source })?;

        let process_handler = AudioLevelsProcessHandler { bus, levels, left_in, right_in };
        let async_client = client
            .activate_async(NoopNotifications, process_handler)
            .map_err(|source| EngineError::JackClient { client: "AudioLevels", source })?;

        if matches!(bus, LevelsBus::Capture | LevelsBus::Recorder) {
            let inner = async_client.as_client();
            for (from, to) in [
                ("system:capture_1".to_string(), format!("{client_name}:left_in")),
                ("system:capture_2".to_string(), format!("{client_name}:right_in")),
            ] {
                if let Err(e) = connect_ports(inner, &from, &to) {
                    warn!(%from, %to, error = ?e, "audio levels: default connection failed");
                }
            }
        }

        Ok(Self { _async_client: async_client })
    }
}

struct AudioLevelsProcessHandler {
    bus: LevelsBus,
    levels: Arc<Mutex<AudioLevels>>,
    left_in: jack::Port<AudioIn>,
    right_in: jack::Port<AudioIn>,
}

impl jack::ProcessHandler for AudioLevelsProcessHandler {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let left = self.left_in.as_slice(ps);
        let right = self.right_in.as_slice(ps);
        let mut levels = non_blocking_lock(&self.levels, "audio levels (from audio engine)");
        match self.bus {
            LevelsBus::Capture => levels.observe_capture(left, right),
            LevelsBus::Playback => levels.observe_playback(left, right),
            LevelsBus::Recorder => levels.observe_recorder(left, right),
            LevelsBus::SketchpadChannel(channel) => levels.observe_sketchpad_channel(channel, left, right),
        }
        Control::Continue
    }
}

/// Start all thirteen metering clients: capture, playback, recorder, and one
/// per sketchpad channel, in that order (matching `AudioLevels.cpp`'s
/// client-index convention: 0 capture, 1 playback, 2 recorder, 3-12 per-channel).
pub fn start_audio_levels_fleet(levels: Arc<Mutex<AudioLevels>>) -> EngineResult<Vec<AudioLevelsClient>> {
    let mut clients = Vec::with_capacity(3 + SKETCHPAD_CHANNEL_COUNT);
    clients.push(AudioLevelsClient::start(LevelsBus::Capture, levels.clone())?);
    clients.push(AudioLevelsClient::start(LevelsBus::Playback, levels.clone())?);
    clients.push(AudioLevelsClient::start(LevelsBus::Recorder, levels.clone())?);
    for channel in 0..SKETCHPAD_CHANNEL_COUNT {
        clients.push(AudioLevelsClient::start(LevelsBus::SketchpadChannel(channel), levels.clone())?);
    }
    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_client_names_match_the_fixed_jack_graph_naming() {
        assert_eq!(LevelsBus::Capture.jack_client_name(), "AudioLevels-SystemCapture");
        assert_eq!(LevelsBus::Playback.jack_client_name(), "AudioLevels-SystemPlayback");
        assert_eq!(LevelsBus::Recorder.jack_client_name(), "AudioLevels-SystemRecorder");
        assert_eq!(LevelsBus::SketchpadChannel(0).jack_client_name(), "AudioLevels-Channel1");
        assert_eq!(LevelsBus::SketchpadChannel(9).jack_client_name(), "AudioLevels-Channel10");
    }
}
