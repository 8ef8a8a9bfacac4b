//! SHA-256 hashing for artifact integrity.
//!
//! Downloads are verified against the registry checksum before the atomic
//! rename into place; comparisons are case-insensitive over lowercase hex.

use sha2::{Digest, Sha256 as Sha256Inner};
use std::io::Read;
use std::path::Path;
use tracing::warn;

/// Incremental SHA-256 hasher.
pub struct Sha256 {
    inner: Sha256Inner,
}

impl Sha256 {
    /// Start a new hash.
    pub fn new() -> Self {
        Self {
            inner: Sha256Inner::new(),
        }
    }

    /// Absorb more input.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finish and return the 32-byte digest.
    pub fn finalize(self) -> [u8; 32] {
        self.inner.finalize().into()
    }

    /// Finish and return the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        to_hex(&self.finalize())
    }
}

impl Default for Sha256 {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// One-shot hex digest of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Hex digest of a file's contents, streamed in 64 KiB chunks.
///
/// Returns the empty string when the file cannot be read; callers treat an
/// empty digest as "verification impossible", which never matches a real
/// checksum.
pub fn sha256_file_hex(path: &Path) -> String {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open file for hashing");
            return String::new();
        }
    };
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "read failed while hashing");
                return String::new();
            }
        }
    }
    hasher.finalize_hex()
}

/// Case-insensitive comparison of two hex digests.
pub fn checksum_matches(actual_hex: &str, expected_hex: &str) -> bool {
    !actual_hex.is_empty() && actual_hex.eq_ignore_ascii_case(expected_hex)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // FIPS 180-4 test vectors.
    const EMPTY_DIGEST: &str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_DIGEST: &str =
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const TWO_BLOCK_DIGEST: &str =
        "248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1";

    #[test]
    fn fips_vector_empty() {
        assert_eq!(sha256_hex(b""), EMPTY_DIGEST);
    }

    #[test]
    fn fips_vector_abc() {
        assert_eq!(sha256_hex(b"abc"), ABC_DIGEST);
    }

    #[test]
    fn fips_vector_two_block_message() {
        assert_eq!(
            sha256_hex(b"abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq"),
            TWO_BLOCK_DIGEST
        );
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = Sha256::new();
        hasher.update(b"ab");
        hasher.update(b"c");
        assert_eq!(hasher.finalize_hex(), ABC_DIGEST);
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let mut f = NamedTempFile::new().expect("create temp file");
        f.write_all(b"abc").expect("write");
        assert_eq!(sha256_file_hex(f.path()), ABC_DIGEST);
    }

    #[test]
    fn file_hash_of_large_chunked_input() {
        let data = vec![0x5au8; 200_000];
        let mut f = NamedTempFile::new().expect("create temp file");
        f.write_all(&data).expect("write");
        assert_eq!(sha256_file_hex(f.path()), sha256_hex(&data));
    }

    #[test]
    fn missing_file_yields_empty_string() {
        assert_eq!(sha256_file_hex(Path::new("/nonexistent/model.bin")), "");
    }

    #[test]
    fn checksum_comparison_is_case_insensitive() {
        assert!(checksum_matches(ABC_DIGEST, &ABC_DIGEST.to_uppercase()));
        assert!(checksum_matches(&ABC_DIGEST.to_uppercase(), ABC_DIGEST));
        assert!(!checksum_matches(ABC_DIGEST, EMPTY_DIGEST));
    }

    #[test]
    fn empty_actual_never_matches() {
        assert!(!checksum_matches("", ""));
        assert!(!checksum_matches("", ABC_DIGEST));
    }

    #[test]
    fn hex_encoding_is_lowercase() {
        assert_eq!(to_hex(&[0xDE, 0xAD, 0x00, 0x0F]), "dead000f");
    }
}
