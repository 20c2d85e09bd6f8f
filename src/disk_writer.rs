//! Background WAV writer. The audio thread pushes interleaved stereo frames
//! into an `rtrb` ring buffer (never blocks, never allocates); a plain
//! background thread drains it and does the actual file I/O. Mirrors the
//! `DiskWriter` class's atomic-writer-pointer-under-critical-section design:
//! here the "atomic pointer" is a `Mutex<Option<Producer<f32>>>` taken only
//! with [`non_blocking_lock`](crate::mutex_util::non_blocking_lock), so a
//! contended attempt panics loudly in testing rather than silently blocking
//! the audio thread in production.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::event::EngineEvent;
use crate::mutex_util::non_blocking_lock;

const RING_CAPACITY_FRAMES: usize = 1 << 16;

enum WorkerCommand {
    Start { consumer: Consumer<f32>, path: String, sample_rate: u32, bits_per_sample: u16, channels: u16 },
    Stop,
    Shutdown,
}

/// 16-bit PCM is the default bit depth a recording is started with, per the
/// disk writer's own `startRecording(path, sampleRate, bitRate=16, channels=2)`
/// contract; callers needing float WAV output pass 32 explicitly.
pub const DEFAULT_BITS_PER_SAMPLE: u16 = 16;
pub const DEFAULT_CHANNELS: u16 = 2;

pub struct DiskWriter {
    producer: Mutex<Option<Producer<f32>>>,
    recording: AtomicBool,
    commands: Sender<WorkerCommand>,
    worker: Option<JoinHandle<()>>,
}

impl DiskWriter {
    pub fn new(event_tx: Sender<EngineEvent>) -> Self {
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let worker = std::thread::Builder::new()
            .name("disk-writer".to_string())
            .spawn(move || worker_loop(commands_rx, event_tx))
            .expect("failed to spawn disk-writer thread");
        Self {
            producer: Mutex::new(None),
            recording: AtomicBool::new(false),
            commands: commands_tx,
            worker: Some(worker),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Start recording with the default format (16-bit PCM, stereo).
    pub fn start_recording(&self, path: impl Into<String>, sample_rate: u32) -> EngineResult<()> {
        self.start_recording_with_format(path, sample_rate, DEFAULT_BITS_PER_SAMPLE, DEFAULT_CHANNELS)
    }

    pub fn start_recording_with_format(
        &self,
        path: impl Into<String>,
        sample_rate: u32,
        bits_per_sample: u16,
        channels: u16,
    ) -> EngineResult<()> {
        let (producer, consumer) = RingBuffer::<f32>::new(RING_CAPACITY_FRAMES * 2);
        let path = path.into();
        {
            let mut guard = non_blocking_lock(&self.producer, "disk writer producer");
            *guard = Some(producer);
        }
        self.recording.store(true, Ordering::Release);
        self.commands
            .send(WorkerCommand::Start { consumer, path, sample_rate, bits_per_sample, channels })
            .map_err(|_| EngineError::Io {
                path: "disk-writer worker channel".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker thread gone"),
            })
    }

    pub fn stop_recording(&self) {
        if !self.recording.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut guard = non_blocking_lock(&self.producer, "disk writer producer");
            *guard = None;
        }
        let _ = self.commands.send(WorkerCommand::Stop);
    }

    /// Called once per JACK period from the capture bus's process callback.
    /// Real-time safe: at most one non-blocking mutex lock and a handful of
    /// lock-free ring-buffer pushes, never allocates.
    pub fn push_block(&self, left: &[f32], right: &[f32]) {
        if !self.recording.load(Ordering::Acquire) {
            return;
        }
        let mut guard = non_blocking_lock(&self.producer, "disk writer producer");
        if let Some(producer) = guard.as_mut() {
            for (&l, &r) in left.iter().zip(right.iter()) {
                if producer.push(l).is_err() || producer.push(r).is_err() {
                    warn!("disk writer ring buffer full, dropping frames");
                    break;
                }
            }
        }
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        self.stop_recording();
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// The WAV sample format actually written, derived from the `bitRate`/
/// `channels` a recording was started with (16-bit PCM stereo by default).
#[derive(Debug, Clone, Copy)]
struct WriteFormat {
    bits_per_sample: u16,
    sample_format: hound::SampleFormat,
    channels: u16,
}

impl WriteFormat {
    fn new(bits_per_sample: u16, channels: u16) -> Self {
        let sample_format =
            if bits_per_sample == 32 { hound::SampleFormat::Float } else { hound::SampleFormat::Int };
        Self { bits_per_sample, sample_format, channels }
    }

    fn spec(&self, sample_rate: u32) -> hound::WavSpec {
        hound::WavSpec {
            channels: self.channels,
            sample_rate,
            bits_per_sample: self.bits_per_sample,
            sample_format: self.sample_format,
        }
    }
}

fn scale_and_write(
    writer: &mut hound::WavWriter<std::io::BufWriter<std::fs::File>>,
    format: WriteFormat,
    sample: f32,
) -> hound::Result<()> {
    match format.sample_format {
        hound::SampleFormat::Float => writer.write_sample(sample),
        hound::SampleFormat::Int => {
            let max_value = (1i64 << (format.bits_per_sample - 1)) - 1;
            let scaled = (sample.clamp(-1.0, 1.0) as f64 * max_value as f64).round() as i32;
            writer.write_sample(scaled)
        }
    }
}

type ActiveWriter = (hound::WavWriter<std::io::BufWriter<std::fs::File>>, Consumer<f32>, String, WriteFormat);

fn worker_loop(commands: Receiver<WorkerCommand>, event_tx: Sender<EngineEvent>) {
    let mut writer: Option<ActiveWriter> = None;

    loop {
        match commands.recv_timeout(std::time::Duration::from_millis(20)) {
            Ok(WorkerCommand::Start { consumer, path, sample_rate, bits_per_sample, channels }) => {
                let format = WriteFormat::new(bits_per_sample, channels);
                match hound::WavWriter::create(&path, format.spec(sample_rate)) {
                    Ok(w) => {
                        info!(path, bits_per_sample, channels, "disk writer: recording started");
                        let _ = event_tx.send(EngineEvent::RecordingStateChanged {
                            recording: true,
                            path: Some(path.clone()),
                        });
                        writer = Some((w, consumer, path, format));
                    }
                    Err(e) => error!(path, error = %e, "disk writer: failed to open WAV file"),
                }
            }
            Ok(WorkerCommand::Stop) => {
                if let Some((w, mut consumer, path, format)) = writer.take() {
                    drain_into(&mut consumer, w, &path, format, &event_tx);
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                if let Some((w, mut consumer, path, format)) = writer.take() {
                    drain_into(&mut consumer, w, &path, format, &event_tx);
                }
                return;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }

        if let Some((w, consumer, _path, format)) = writer.as_mut() {
            drain_pairs(consumer, w, *format);
        }
    }
}

/// `push_block` always pushes interleaved stereo pairs regardless of the
/// configured output channel count; a mono target downmixes each pair.
fn drain_pairs(
    consumer: &mut Consumer<f32>,
    writer: &mut hound::WavWriter<std::io::BufWriter<std::fs::File>>,
    format: WriteFormat,
) {
    loop {
        let Ok(left) = consumer.pop() else { break };
        let Ok(right) = consumer.pop() else { break };
        let result = if format.channels == 1 {
            scale_and_write(writer, format, (left + right) * 0.5)
        } else {
            scale_and_write(writer, format, left).and_then(|_| scale_and_write(writer, format, right))
        };
        if let Err(e) = result {
            error!(error = %e, "disk writer: write failed");
            break;
        }
    }
}

fn drain_into(
    consumer: &mut Consumer<f32>,
    mut writer: hound::WavWriter<std::io::BufWriter<std::fs::File>>,
    path: &str,
    format: WriteFormat,
    event_tx: &Sender<EngineEvent>,
) {
    drain_pairs(consumer, &mut writer, format);
    if let Err(e) = writer.finalize() {
        error!(path, error = %e, "disk writer: failed to finalize WAV file");
    } else {
        info!(path, "disk writer: recording finalized");
    }
    let _ = event_tx.send(EngineEvent::RecordingStateChanged { recording: false, path: Some(path.to_string()) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;

    #[test]
    fn records_a_short_buffer_to_a_valid_wav_file() {
        let (tx, _rx) = event_channel();
        let writer = DiskWriter::new(tx);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        writer.start_recording(path.to_str().unwrap(), 44_100).unwrap();
        assert!(writer.is_recording());
        let left = vec![0.1f32; 512];
        let right = vec![-0.1f32; 512];
        writer.push_block(&left, &right);
        writer.stop_recording();
        assert!(!writer.is_recording());

        // Give the background thread a moment to finalize the file.
        std::thread::sleep(std::time::Duration::from_millis(200));
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().bits_per_sample, 16, "default recording format must be 16-bit PCM");
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Int);
        assert!(reader.duration() > 0);
    }

    #[test]
    fn sixteen_bit_round_trip_is_bit_identical_for_representable_values() {
        let (tx, _rx) = event_channel();
        let writer = DiskWriter::new(tx);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round_trip.wav");

        writer.start_recording(path.to_str().unwrap(), 44_100).unwrap();
        // 4096 / 32767 is exactly representable as a 16-bit sample.
        let value = 4096.0f32 / i16::MAX as f32;
        writer.push_block(&[value; 8], &[value; 8]);
        writer.stop_recording();
        std::thread::sleep(std::time::Duration::from_millis(200));

        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i32> = reader.samples::<i32>().map(|s| s.unwrap()).collect();
        assert!(samples.iter().all(|&s| s == 4096), "samples: {:?}", samples);
    }

    #[test]
    fn explicit_float_format_still_available() {
        let (tx, _rx) = event_channel();
        let writer = DiskWriter::new(tx);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.wav");

        writer.start_recording_with_format(path.to_str().unwrap(), 44_100, 32, 2).unwrap();
        writer.push_block(&[0.1f32; 8], &[-0.1f32; 8]);
        writer.stop_recording();
        std::thread::sleep(std::time::Duration::from_millis(200));

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Float);
        assert_eq!(reader.spec().bits_per_sample, 32);
    }
}
