//! PCM audio container, WAV codec and resampling.
//!
//! All engine audio is mono f32 PCM normalized to `[-1.0, 1.0]`. The WAV
//! codec produces canonical RIFF/WAVE PCM with 8/16/24/32-bit integer
//! depths; values outside the normalized range are clamped before encoding.

use crate::error::{ErrorKind, Result, SdkError};
use std::io::Cursor;

/// Mono PCM audio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioData {
    /// Samples normalized to `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Samples per second; positive for real audio.
    pub sample_rate: u32,
    /// Channel count; the engines operate on mono.
    pub channels: u16,
}

impl AudioData {
    /// Wrap samples at a rate as mono audio.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// The empty end-of-stream sentinel.
    pub fn end_of_stream() -> Self {
        Self {
            samples: Vec::new(),
            sample_rate: 0,
            channels: 1,
        }
    }

    /// Whether this value is the end-of-stream sentinel.
    pub fn is_end_of_stream(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds; `0.0` for empty audio.
    pub fn duration_seconds(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Linear-interpolation resample to `target_rate`.
    ///
    /// A no-op when the rates already match. Output length is
    /// `len * target / source` within one sample.
    pub fn resample(&self, target_rate: u32) -> AudioData {
        if target_rate == self.sample_rate || self.samples.is_empty() || target_rate == 0 {
            let mut out = self.clone();
            if target_rate != 0 {
                out.sample_rate = target_rate;
            }
            return out;
        }
        let out_len = ((self.samples.len() as u64 * u64::from(target_rate))
            / u64::from(self.sample_rate)) as usize;
        let mut out = Vec::with_capacity(out_len.max(1));
        let step = f64::from(self.sample_rate) / f64::from(target_rate);
        for i in 0..out_len.max(1) {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = self.samples[idx.min(self.samples.len() - 1)];
            let b = self.samples[(idx + 1).min(self.samples.len() - 1)];
            out.push(a + (b - a) * frac);
        }
        AudioData {
            samples: out,
            sample_rate: target_rate,
            channels: self.channels,
        }
    }

    /// Scale so the peak magnitude is 1.0. Silence is returned unchanged.
    pub fn normalized_peak(&self) -> AudioData {
        let peak = self.samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        if peak <= f32::EPSILON || (peak - 1.0).abs() <= f32::EPSILON {
            return self.clone();
        }
        let scale = 1.0 / peak;
        AudioData {
            samples: self.samples.iter().map(|s| s * scale).collect(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// Encode as mono RIFF/WAVE PCM at the given bit depth.
    ///
    /// Supported depths: 8, 16, 24, 32. Samples are clamped to
    /// `[-1.0, 1.0]` before quantization.
    pub fn to_wav(&self, bits_per_sample: u16) -> Result<Vec<u8>> {
        if self.samples.is_empty() || self.sample_rate == 0 {
            return Err(SdkError::new(
                ErrorKind::InvalidInputAudioFormat,
                "cannot encode empty audio as WAV",
                format!(
                    "samples={} sample_rate={}",
                    self.samples.len(),
                    self.sample_rate
                ),
            ));
        }
        if !matches!(bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(SdkError::new(
                ErrorKind::InvalidInputParameterValue,
                "unsupported WAV bit depth requested",
                format!("bits_per_sample={bits_per_sample} supported=[8,16,24,32]"),
            ));
        }
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer =
                hound::WavWriter::new(&mut cursor, spec).map_err(wav_encode_error)?;
            for &sample in &self.samples {
                let v = f64::from(sample.clamp(-1.0, 1.0));
                match bits_per_sample {
                    8 => writer
                        .write_sample((v * 127.0).round() as i8)
                        .map_err(wav_encode_error)?,
                    16 => writer
                        .write_sample((v * 32_767.0).round() as i16)
                        .map_err(wav_encode_error)?,
                    24 => writer
                        .write_sample((v * 8_388_607.0).round() as i32)
                        .map_err(wav_encode_error)?,
                    _ => writer
                        .write_sample((v * 2_147_483_647.0).round() as i32)
                        .map_err(wav_encode_error)?,
                }
            }
            writer.finalize().map_err(wav_encode_error)?;
        }
        Ok(cursor.into_inner())
    }

    /// Decode a mono RIFF/WAVE PCM buffer produced by [`AudioData::to_wav`]
    /// (or any standard encoder of the same layout).
    pub fn from_wav(bytes: &[u8]) -> Result<AudioData> {
        if bytes.is_empty() {
            return Err(SdkError::new(
                ErrorKind::InvalidInputAudioFormat,
                "cannot decode an empty WAV buffer",
                "len=0",
            ));
        }
        let mut reader =
            hound::WavReader::new(Cursor::new(bytes)).map_err(wav_decode_error)?;
        let spec = reader.spec();
        if spec.channels != 1 {
            return Err(SdkError::new(
                ErrorKind::InvalidInputAudioFormat,
                "only mono WAV data is supported",
                format!("channels={}", spec.channels),
            ));
        }
        let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 8) => reader
                .samples::<i8>()
                .map(|s| s.map(|v| f32::from(v) / 127.0))
                .collect::<std::result::Result<_, _>>()
                .map_err(wav_decode_error)?,
            (hound::SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / 32_767.0))
                .collect::<std::result::Result<_, _>>()
                .map_err(wav_decode_error)?,
            (hound::SampleFormat::Int, 24) => reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v as f64 / 8_388_607.0) as f32))
                .collect::<std::result::Result<_, _>>()
                .map_err(wav_decode_error)?,
            (hound::SampleFormat::Int, 32) => reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v as f64 / 2_147_483_647.0) as f32))
                .collect::<std::result::Result<_, _>>()
                .map_err(wav_decode_error)?,
            (hound::SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(wav_decode_error)?,
            (format, bits) => {
                return Err(SdkError::new(
                    ErrorKind::InvalidInputAudioFormat,
                    "unsupported WAV sample layout",
                    format!("format={format:?} bits_per_sample={bits}"),
                ));
            }
        };
        Ok(AudioData {
            samples,
            sample_rate: spec.sample_rate,
            channels: 1,
        })
    }
}

fn wav_encode_error(e: hound::Error) -> SdkError {
    SdkError::new(
        ErrorKind::InvalidInputAudioFormat,
        "WAV encoding failed for the given audio",
        e.to_string(),
    )
}

fn wav_decode_error(e: hound::Error) -> SdkError {
    SdkError::new(
        ErrorKind::InvalidInputAudioFormat,
        "buffer is not a decodable RIFF/WAVE stream",
        e.to_string(),
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn sine(sample_rate: u32, seconds: f32, frequency: f32, amplitude: f32) -> AudioData {
        let n = (sample_rate as f32 * seconds) as usize;
        let samples = (0..n)
            .map(|i| {
                amplitude
                    * (2.0 * std::f32::consts::PI * frequency * i as f32
                        / sample_rate as f32)
                        .sin()
            })
            .collect();
        AudioData::new(samples, sample_rate)
    }

    #[test]
    fn sixteen_bit_round_trip_reference_vector() {
        let input = AudioData::new(
            vec![0.0, 0.25, 0.5, 0.75, 1.0, -0.25, -0.5, -0.75, -1.0],
            22_050,
        );
        let wav = input.to_wav(16).expect("encode");
        let decoded = AudioData::from_wav(&wav).expect("decode");
        assert_eq!(decoded.sample_rate, 22_050);
        assert_eq!(decoded.samples.len(), 9);
        for (got, want) in decoded.samples.iter().zip(input.samples.iter()) {
            assert!(
                (got - want).abs() <= 0.01,
                "sample {got} should be within 0.01 of {want}"
            );
        }
    }

    #[test]
    fn wav_header_is_canonical() {
        let input = AudioData::new(vec![0.5; 100], 16_000);
        let wav = input.to_wav(16).expect("encode");
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        // fmt chunk length 16, PCM format tag 1, mono.
        assert_eq!(u32::from_le_bytes([wav[16], wav[17], wav[18], wav[19]]), 16);
        assert_eq!(u16::from_le_bytes([wav[20], wav[21]]), 1);
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 1);
        assert_eq!(
            u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]),
            16_000
        );
        // 16-bit mono: byte rate = rate * 2, block align = 2.
        assert_eq!(
            u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]),
            32_000
        );
        assert_eq!(u16::from_le_bytes([wav[32], wav[33]]), 2);
        assert_eq!(u16::from_le_bytes([wav[34], wav[35]]), 16);
    }

    #[test]
    fn all_supported_depths_round_trip() {
        let input = sine(16_000, 0.05, 440.0, 0.8);
        for bits in [8u16, 16, 24, 32] {
            let wav = input.to_wav(bits).expect("encode");
            let decoded = AudioData::from_wav(&wav).expect("decode");
            assert_eq!(decoded.samples.len(), input.samples.len(), "{bits}-bit");
            let tolerance = match bits {
                8 => 0.02,
                _ => 0.01,
            };
            for (got, want) in decoded.samples.iter().zip(input.samples.iter()) {
                assert!((got - want).abs() <= tolerance, "{bits}-bit: {got} vs {want}");
            }
        }
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let input = AudioData::new(vec![2.0, -3.0, 0.5], 8_000);
        let wav = input.to_wav(16).expect("encode");
        let decoded = AudioData::from_wav(&wav).expect("decode");
        assert!((decoded.samples[0] - 1.0).abs() <= 0.01);
        assert!((decoded.samples[1] + 1.0).abs() <= 0.01);
        assert!((decoded.samples[2] - 0.5).abs() <= 0.01);
    }

    #[test]
    fn empty_audio_is_rejected() {
        let err = AudioData::new(Vec::new(), 16_000).to_wav(16).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInputAudioFormat);
    }

    #[test]
    fn invalid_bit_depth_is_rejected() {
        let input = AudioData::new(vec![0.1; 10], 16_000);
        for bits in [0u16, 7, 12, 64] {
            let err = input.to_wav(bits).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidInputParameterValue, "{bits}");
            assert!(err.details.contains(&bits.to_string()));
        }
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        let err = AudioData::from_wav(b"definitely not a wav file").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInputAudioFormat);
        let err = AudioData::from_wav(b"").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInputAudioFormat);
    }

    #[test]
    fn resample_is_identity_at_same_rate() {
        let input = sine(16_000, 0.1, 440.0, 0.5);
        let out = input.resample(16_000);
        assert_eq!(out, input);
    }

    #[test]
    fn resample_scales_length_proportionally() {
        let input = sine(16_000, 0.5, 440.0, 0.5);
        let up = input.resample(48_000);
        let expected_up = input.samples.len() * 3;
        assert!(
            (up.samples.len() as i64 - expected_up as i64).abs() <= 1,
            "{} vs {expected_up}",
            up.samples.len()
        );
        assert_eq!(up.sample_rate, 48_000);

        let down = input.resample(8_000);
        let expected_down = input.samples.len() / 2;
        assert!((down.samples.len() as i64 - expected_down as i64).abs() <= 1);
    }

    #[test]
    fn resample_preserves_duration() {
        let input = sine(22_050, 0.3, 220.0, 0.5);
        let out = input.resample(16_000);
        assert!((out.duration_seconds() - input.duration_seconds()).abs() < 0.01);
    }

    #[test]
    fn normalization_scales_peak_to_one() {
        let input = AudioData::new(vec![0.1, -0.25, 0.2], 16_000);
        let normalized = input.normalized_peak();
        let peak = normalized
            .samples
            .iter()
            .map(|s| s.abs())
            .fold(0.0f32, f32::max);
        assert!((peak - 1.0).abs() < 1e-6);
        // Silence stays silent.
        let silence = AudioData::new(vec![0.0; 10], 16_000);
        assert_eq!(silence.normalized_peak(), silence);
    }

    #[test]
    fn end_of_stream_sentinel() {
        assert!(AudioData::end_of_stream().is_end_of_stream());
        assert!(!sine(16_000, 0.01, 440.0, 0.5).is_end_of_stream());
    }

    #[test]
    fn duration_reflects_rate_and_length() {
        let audio = AudioData::new(vec![0.0; 22_050], 22_050);
        assert!((audio.duration_seconds() - 1.0).abs() < f32::EPSILON);
    }
}
