//! Audio decode/encode helpers shared by the pipeline and the backends.

use std::io::Cursor;

use tracing::debug;

use crate::error::{Error, Result};

/// Peak amplitude below which a buffer is treated as silence.
pub const SILENCE_THRESHOLD: f32 = 1e-4;

/// A decoded mono buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn is_silent(&self) -> bool {
        peak_amplitude(&self.samples) < SILENCE_THRESHOLD
    }
}

/// Decode a base64 payload, tolerating `data:` URL prefixes and whitespace.
pub fn base64_decode(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;

    let payload = if data.starts_with("data:") {
        data.split_once(',').map(|(_, b64)| b64).unwrap_or(data)
    } else {
        data
    };

    let normalized: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::Audio(format!("Base64 decode error: {}", e)))
}

pub fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode WAV bytes into a mono f32 buffer in [-1, 1].
pub fn decode_wav(wav_bytes: &[u8]) -> Result<AudioBuffer> {
    let mut reader = hound::WavReader::new(Cursor::new(wav_bytes))
        .map_err(|e| Error::Audio(format!("Failed to parse WAV: {}", e)))?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let bytes_per_sample = (spec.bits_per_sample as u64 + 7) / 8;
    let declared = reader.len() as u64 * bytes_per_sample.max(1);
    if declared > wav_bytes.len() as u64 {
        return Err(Error::Audio(format!(
            "WAV header declares {} bytes of samples but only {} bytes were provided",
            declared,
            wav_bytes.len()
        )));
    }

    let mut samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample.max(1) as u32;
            let max_val = if bits > 1 {
                ((1i64 << (bits - 1)) - 1) as f32
            } else {
                1.0
            };
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| (s as f32 / max_val).clamp(-1.0, 1.0)))
                .collect::<std::result::Result<Vec<_>, _>>()
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>(),
    }
    .map_err(|e| Error::Audio(format!("Failed to read WAV samples: {}", e)))?;

    if channels > 1 {
        samples = samples
            .chunks(channels)
            .map(|frame| frame.iter().copied().sum::<f32>() / frame.len() as f32)
            .collect();
    }

    for sample in &mut samples {
        *sample = if sample.is_finite() {
            sample.clamp(-1.0, 1.0)
        } else {
            0.0
        };
    }

    debug!(
        "Decoded WAV: {} samples @ {} Hz ({} channel(s))",
        samples.len(),
        spec.sample_rate,
        channels
    );

    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

/// Encode mono samples as a 16-bit PCM WAV container.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::Audio(format!("Failed to create WAV writer: {}", e)))?;
        for &sample in samples {
            let clamped = if sample.is_finite() {
                sample.clamp(-1.0, 1.0)
            } else {
                0.0
            };
            writer
                .write_sample((clamped * i16::MAX as f32) as i16)
                .map_err(|e| Error::Audio(format!("Failed to write WAV sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| Error::Audio(format!("Failed to finalize WAV: {}", e)))?;
    }

    Ok(cursor.into_inner())
}

pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples
        .iter()
        .filter(|s| s.is_finite())
        .fold(0.0f32, |p, &s| p.max(s.abs()))
}

/// Scrub non-finite samples and scale down so the peak never exceeds `limit`.
///
/// Quieter buffers are left untouched.
pub fn normalize_peak(samples: &mut [f32], limit: f32) {
    for sample in samples.iter_mut() {
        if !sample.is_finite() {
            *sample = 0.0;
        }
    }

    let peak = peak_amplitude(samples);
    if peak > limit && peak > 0.0 {
        let scale = limit / peak;
        for sample in samples.iter_mut() {
            *sample *= scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_encode_then_decode_preserves_shape() {
        let samples: Vec<f32> = (0..2400).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
        let bytes = encode_wav(&samples, 24000).unwrap();
        let decoded = decode_wav(&bytes).unwrap();

        assert_eq!(decoded.sample_rate, 24000);
        assert_eq!(decoded.samples.len(), samples.len());
        assert!((decoded.duration_secs() - 0.1).abs() < 1e-4);
        assert!((peak_amplitude(&decoded.samples) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn decode_downmixes_stereo() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..100 {
                writer.write_sample(i16::MAX).unwrap();
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        let decoded = decode_wav(&cursor.into_inner()).unwrap();
        assert_eq!(decoded.samples.len(), 100);
        assert!((decoded.samples[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn base64_accepts_data_url_and_whitespace() {
        let encoded = base64_encode(b"RIFF");
        let wrapped = format!("data:audio/wav;base64,{}\n", encoded);
        assert_eq!(base64_decode(&wrapped).unwrap(), b"RIFF");
        assert!(base64_decode("not base64!").is_err());
    }

    #[test]
    fn normalize_only_scales_loud_buffers() {
        let mut loud = vec![0.0, 2.0, -1.0, f32::NAN];
        normalize_peak(&mut loud, 0.95);
        assert!((peak_amplitude(&loud) - 0.95).abs() < 1e-6);
        assert_eq!(loud[3], 0.0);

        let mut quiet = vec![0.1, -0.2];
        normalize_peak(&mut quiet, 0.95);
        assert_eq!(quiet, vec![0.1, -0.2]);
    }

    fn wav_header_only(sample_rate: u32, data_len: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(44);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36u32.wrapping_add(data_len)).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes
    }

    #[test]
    fn truncated_wav_is_rejected() {
        let samples = vec![0.25f32; 16000];
        let full = encode_wav(&samples, 16000).unwrap();
        let truncated = &full[..44 + 16000];

        assert!(matches!(decode_wav(truncated), Err(Error::Audio(_))));
    }

    #[test]
    fn oversized_data_chunk_is_rejected_quickly() {
        let header = wav_header_only(16000, 0x7FFF_FFF0);
        let started = std::time::Instant::now();

        assert!(matches!(decode_wav(&header), Err(Error::Audio(_))));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn garbage_bytes_are_not_wav() {
        assert!(matches!(decode_wav(b"hello"), Err(Error::Audio(_))));
    }
}
