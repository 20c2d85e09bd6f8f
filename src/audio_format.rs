//! The audio-file-decoding boundary. Decoding itself is explicitly out of
//! scope for this crate; `AudioFormatReader` is the seam a host embeds a real
//! decoder behind. `HoundWavReader` is the default implementation, good enough
//! to make the crate runnable and testable standalone against the same WAV
//! format `DiskWriter` produces.

use std::path::Path;

pub struct DecodedAudio {
    /// One `Vec<f32>` per channel, all the same length.
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

pub trait AudioFormatReader: Send + Sync {
    /// Decode the file at `path` into planar f32 PCM. `Err` carries a
    /// human-readable reason, wrapped by the caller into `EngineError::Decode`.
    fn decode(&self, path: &str) -> Result<DecodedAudio, String>;
}

#[derive(Default)]
pub struct HoundWavReader;

impl AudioFormatReader for HoundWavReader {
    fn decode(&self, path: &str) -> Result<DecodedAudio, String> {
        let mut reader = hound::WavReader::open(Path::new(path)).map_err(|e| e.to_string())?;
        let spec = reader.spec();
        let channel_count = spec.channels as usize;
        let mut channels: Vec<Vec<f32>> = vec![Vec::new(); channel_count];

        match spec.sample_format {
            hound::SampleFormat::Float => {
                for (i, sample) in reader.samples::<f32>().enumerate() {
                    let sample = sample.map_err(|e| e.to_string())?;
                    channels[i % channel_count].push(sample);
                }
            }
            hound::SampleFormat::Int => {
                let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
                for (i, sample) in reader.samples::<i32>().enumerate() {
                    let sample = sample.map_err(|e| e.to_string())?;
                    channels[i % channel_count].push(sample as f32 / max);
                }
            }
        }

        Ok(DecodedAudio { channels, sample_rate: spec.sample_rate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_wav(path: &Path) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..8000 {
            writer.write_sample(((i % 100) as i16) - 50).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn decodes_mono_16_bit_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wav");
        write_test_wav(&path);

        let reader = HoundWavReader;
        let decoded = reader.decode(path.to_str().unwrap()).unwrap();
        assert_eq!(decoded.sample_rate, 8000);
        assert_eq!(decoded.channels.len(), 1);
        assert_eq!(decoded.channels[0].len(), 8000);
        assert!(decoded.channels[0].iter().all(|s| *s >= -1.0 && *s <= 1.0));
    }

    #[test]
    fn missing_file_reports_a_readable_error() {
        let reader = HoundWavReader;
        let result = reader.decode("/nonexistent/path/does-not-exist.wav");
        assert!(result.is_err());
        let _ = Write::flush(&mut std::io::sink());
    }
}
