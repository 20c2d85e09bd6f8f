//! Real-time audio/MIDI engine for a looper/sampler instrument: a beat-grid
//! scheduler (`SyncTimer`), a MIDI demultiplexer (`MidiRouter`), a polyphonic
//! sample player (`SamplerSynth`) rendered by `audio_engine`'s JACK client,
//! and a peak-metering/recording bus (`AudioLevels`) fed by `audio_engine`'s
//! metering fleet, cooperating over JACK.
//!
//! [`Engine`] wires every subsystem together and is the crate's main entry
//! point. Each subsystem is also usable on its own for embedding in a larger
//! host.

pub mod adsr;
pub mod audio_engine;
pub mod audio_format;
pub mod audio_levels;
pub mod clip;
pub mod clock;
pub mod command;
pub mod config;
pub mod disk_writer;
pub mod error;
pub mod event;
pub mod jack_util;
mod mutex_util;
pub mod midi_router;
pub mod pool;
pub mod sampler_synth;
pub mod step;
pub mod sync_timer;
pub mod time;
pub mod transport_manager;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::audio_engine::{start_audio_levels_fleet, AudioLevelsClient, SamplerAudioClient};
use crate::audio_format::{AudioFormatReader, HoundWavReader};
use crate::audio_levels::AudioLevels;
use crate::clip::{Clip, ClipHandle, ClipId};
use crate::config::RouterConfig;
use crate::error::EngineResult;
use crate::event::{event_channel, EngineEvent};
use crate::midi_router::MidiRouterClient;
use crate::sampler_synth::SamplerSynth;
use crate::sync_timer::{SyncTimer, SyncTimerHandle};
use crate::transport_manager::TransportManager;

/// Owns the full fleet of JACK clients and the shared sampler state. Dropping
/// this stops every client.
pub struct Engine {
    sync_timer: SyncTimer,
    sampler: Arc<Mutex<SamplerSynth>>,
    /// Kept alive purely so its JACK client stays activated; deactivated on drop.
    _transport_manager: TransportManager,
    /// Kept alive purely so its JACK client stays activated; deactivated on drop.
    _midi_router: MidiRouterClient,
    /// Kept alive purely so its JACK client stays activated; deactivated on drop.
    _sampler_audio: SamplerAudioClient,
    audio_levels: Arc<Mutex<AudioLevels>>,
    /// Kept alive purely so their JACK clients stay activated; deactivated on drop.
    _audio_levels_fleet: Vec<AudioLevelsClient>,
    _levels_timer: audio_levels::MeteringTimer,
    audio_format_reader: Box<dyn AudioFormatReader>,
    events: Receiver<EngineEvent>,
    /// Maps a hash of a clip's source path to its id, so loading the same
    /// file twice (common when a pattern references one sample from several
    /// steps) returns the already-decoded clip instead of decoding it again.
    loaded_by_path_hash: Mutex<HashMap<u64, ClipId>>,
}

pub struct EngineConfig {
    /// JACK client name prefix; each subsystem suffixes its own role.
    pub client_name_prefix: String,
    pub device_sample_rate: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { client_name_prefix: "loop_engine".to_string(), device_sample_rate: 44_100.0 }
    }
}

impl Engine {
    pub fn start(config: EngineConfig) -> EngineResult<Self> {
        let (event_tx, events) = event_channel();

        let sampler = Arc::new(Mutex::new(SamplerSynth::new(config.device_sample_rate)));

        let mut sync_timer = SyncTimer::start(
            &format!("{}_sync_timer", config.client_name_prefix),
            sampler.clone(),
            event_tx.clone(),
        )?;
        sync_timer.spawn_reclaim_timer();

        let transport_manager = TransportManager::start(
            &format!("{}_transport", config.client_name_prefix),
            sync_timer.handle(),
        )?;

        let midi_router = MidiRouterClient::start(
            &format!("{}_midi_router", config.client_name_prefix),
            RouterConfig::from_env(),
            event_tx.clone(),
        )?;

        let sampler_audio = SamplerAudioClient::start(
            &format!("{}_sampler", config.client_name_prefix),
            sampler.clone(),
            sync_timer.handle(),
        )?;

        let audio_levels = Arc::new(Mutex::new(AudioLevels::new(event_tx)));
        let audio_levels_fleet = start_audio_levels_fleet(audio_levels.clone())?;
        let levels_timer = audio_levels::MeteringTimer::start(audio_levels.clone());

        info!("engine started");

        Ok(Self {
            sync_timer,
            sampler,
            _transport_manager: transport_manager,
            _midi_router: midi_router,
            _sampler_audio: sampler_audio,
            audio_levels,
            _audio_levels_fleet: audio_levels_fleet,
            _levels_timer: levels_timer,
            audio_format_reader: Box::new(HoundWavReader),
            events,
            loaded_by_path_hash: Mutex::new(HashMap::new()),
        })
    }

    /// Start recording the capture bus to a WAV file.
    pub fn start_recording(&self, path: impl Into<String>, sample_rate: u32) -> EngineResult<()> {
        self.audio_levels.lock().expect("audio levels mutex poisoned").disk_writer().start_recording(path, sample_rate)
    }

    pub fn stop_recording(&self) {
        self.audio_levels.lock().expect("audio levels mutex poisoned").disk_writer().stop_recording();
    }

    pub fn sync_timer(&self) -> SyncTimerHandle {
        self.sync_timer.handle()
    }

    pub fn events(&self) -> &Receiver<EngineEvent> {
        &self.events
    }

    /// Decode and register a clip with the sampler, returning its handle.
    /// Re-loading a path already registered returns the existing id instead
    /// of decoding the file again.
    pub fn load_clip(&self, path: &str, root_note: i32) -> EngineResult<ClipId> {
        let path_hash = xxh3_64(path.as_bytes());
        let mut loaded = self.loaded_by_path_hash.lock().expect("clip cache mutex poisoned");
        if let Some(&id) = loaded.get(&path_hash) {
            return Ok(id);
        }

        let clip = Clip::load(path, self.audio_format_reader.as_ref(), root_note)?;
        let id = clip.id();
        let handle: ClipHandle = Arc::new(clip);
        self.sampler.lock().expect("sampler mutex poisoned").register_clip(handle);
        loaded.insert(path_hash, id);
        Ok(id)
    }

    pub fn unregister_clip(&self, id: ClipId) {
        self.sampler.lock().expect("sampler mutex poisoned").unregister_clip(id);
        self.loaded_by_path_hash.lock().expect("clip cache mutex poisoned").retain(|_, &mut v| v != id);
    }

    pub fn set_channel_enabled(&self, channel: usize, enabled: bool) {
        self.sampler.lock().expect("sampler mutex poisoned").set_channel_enabled(channel, enabled);
    }

    /// Replace the default WAV-only decoder with a host-supplied one (e.g.
    /// backed by a richer codec library), without touching `SamplerSynth` or `Clip`.
    pub fn set_audio_format_reader(&mut self, reader: Box<dyn AudioFormatReader>) {
        self.audio_format_reader = reader;
    }
}
