//! Resumable, verified model artifact downloads.
//!
//! Each download writes to `{dest}.tmp`, resumes from an existing partial
//! file with a range request, verifies the SHA-256 checksum, then atomically
//! renames into place. The destination file either exists fully verified or
//! not at all. Transient transport failures are retried with exponential
//! backoff; everything else aborts and the partial file is removed.

use crate::device::available_storage_bytes;
use crate::error::{ErrorKind, Result, SdkError};
use crate::hash::{checksum_matches, sha256_file_hex};
use crate::http::{CancelFlag, Transport};
use crate::recovery::{CleanupGuard, RetryConfig, with_retry};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Required headroom over the expected artifact size before a download
/// starts, as a ratio of the expected size.
const STORAGE_HEADROOM: f64 = 1.1;

/// Fractional progress callback, `0.0..=1.0`, weakly increasing.
pub type DownloadProgress = Arc<dyn Fn(f32) + Send + Sync>;

/// One download's inputs.
#[derive(Clone)]
pub struct DownloadRequest {
    /// Source URL (HTTPS in production).
    pub url: String,
    /// Final artifact path.
    pub dest_path: PathBuf,
    /// Expected artifact size in bytes; drives progress fractions and the
    /// pre-flight storage check. `0` disables both.
    pub expected_size: u64,
    /// Expected SHA-256 hex digest; empty skips verification.
    pub expected_sha256: String,
    /// Retry policy for transient transport failures.
    pub retry: RetryConfig,
}

/// Executes downloads over an injected [`Transport`].
pub struct DownloadEngine {
    transport: Arc<dyn Transport>,
}

impl DownloadEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Run one download to completion.
    ///
    /// Blocks the caller. Independent downloads may run concurrently from
    /// different threads; each owns its own `.tmp` path.
    pub fn download(
        &self,
        request: &DownloadRequest,
        progress: &DownloadProgress,
        cancel: &CancelFlag,
    ) -> Result<()> {
        // URL policy first: a rejected scheme must not leave any trace on
        // disk.
        self.transport.validate_url(&request.url)?;
        self.preflight_storage(request)?;

        let tmp = tmp_path(&request.dest_path);
        let mut tmp_guard = {
            let tmp = tmp.clone();
            CleanupGuard::new(move || {
                let _ = std::fs::remove_file(&tmp);
            })
        };

        // Weakly-increasing progress across resume and retry boundaries.
        let mut high_water = 0.0f32;
        let mut report = |fraction: f32| {
            let clamped = fraction.clamp(0.0, 1.0);
            if clamped >= high_water {
                high_water = clamped;
                progress(clamped);
            }
        };

        let transfer = || -> Result<u64> {
            let start = resume_offset(&tmp, request.expected_size);
            let mut file = open_tmp(&tmp, start)?;
            if start > 0 {
                info!(
                    url = %request.url,
                    offset = start,
                    "resuming partial download"
                );
                report(fraction_of(start, request.expected_size));
            }
            let mut on_bytes = |received: u64| {
                report(fraction_of(start + received, request.expected_size));
            };
            let received =
                self.transport
                    .fetch(&request.url, start, cancel, &mut file, &mut on_bytes)?;
            Ok(start + received)
        };

        let total = with_retry(
            &request.retry,
            |attempt, e| {
                warn!(
                    url = %request.url,
                    attempt,
                    error = %e,
                    "download attempt failed, will retry"
                );
            },
            transfer,
        )?;

        if !request.expected_sha256.is_empty() {
            let actual = sha256_file_hex(&tmp);
            if !checksum_matches(&actual, &request.expected_sha256) {
                tmp_guard.trigger();
                return Err(SdkError::new(
                    ErrorKind::ModelFileCorrupted,
                    "downloaded artifact failed checksum verification",
                    format!(
                        "url={} expected={} actual={}",
                        request.url, request.expected_sha256, actual
                    ),
                )
                .with_recovery("delete any cached copy and download the model again"));
            }
        }

        std::fs::rename(&tmp, &request.dest_path)?;
        tmp_guard.dismiss();
        report(1.0);
        info!(
            url = %request.url,
            dest = %request.dest_path.display(),
            bytes = total,
            "download complete"
        );
        Ok(())
    }

    fn preflight_storage(&self, request: &DownloadRequest) -> Result<()> {
        if request.expected_size == 0 {
            return Ok(());
        }
        let probe_dir = request
            .dest_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let available = available_storage_bytes(&probe_dir);
        let required = (request.expected_size as f64 * STORAGE_HEADROOM) as u64;
        if available < required {
            return Err(SdkError::new(
                ErrorKind::StorageInsufficientSpace,
                "not enough free disk space for the download",
                format!(
                    "dest={} required={required} available={available}",
                    request.dest_path.display()
                ),
            )
            .with_recovery("free disk space or delete unused models"));
        }
        Ok(())
    }
}

/// `{dest}.tmp`.
pub fn tmp_path(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn fraction_of(bytes: u64, expected: u64) -> f32 {
    if expected == 0 {
        return 0.0;
    }
    (bytes as f64 / expected as f64) as f32
}

/// Offset to resume from: the partial file's size when it is smaller than
/// the expected artifact, otherwise 0 (restart from scratch).
fn resume_offset(tmp: &Path, expected_size: u64) -> u64 {
    match std::fs::metadata(tmp) {
        Ok(meta) if expected_size > 0 && meta.len() < expected_size => meta.len(),
        _ => 0,
    }
}

fn open_tmp(tmp: &Path, offset: u64) -> Result<File> {
    if offset == 0 {
        Ok(File::create(tmp)?)
    } else {
        Ok(OpenOptions::new().append(true).open(tmp)?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::http::CancelFlag;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Transport that replays a scripted sequence of outcomes, one per
    /// attempt. `Ok` serves the artifact suffix from the requested offset in
    /// small chunks.
    struct ScriptedTransport {
        body: Vec<u8>,
        // One entry per attempt: None = success, Some(kind) = fail with kind.
        script: Mutex<Vec<Option<ErrorKind>>>,
        attempts: AtomicU32,
        offsets: Mutex<Vec<u64>>,
    }

    impl ScriptedTransport {
        fn new(body: Vec<u8>, script: Vec<Option<ErrorKind>>) -> Self {
            Self {
                body,
                script: Mutex::new(script),
                attempts: AtomicU32::new(0),
                offsets: Mutex::new(Vec::new()),
            }
        }

        fn always_ok(body: Vec<u8>) -> Self {
            Self::new(body, Vec::new())
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Transport for ScriptedTransport {
        fn fetch(
            &self,
            url: &str,
            offset: u64,
            cancel: &CancelFlag,
            sink: &mut dyn Write,
            on_bytes: &mut dyn FnMut(u64),
        ) -> Result<u64> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.offsets.lock().unwrap().push(offset);
            let outcome = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() { None } else { script.remove(0) }
            };
            if let Some(kind) = outcome {
                return Err(SdkError::new(
                    kind,
                    "scripted transport failure for testing",
                    format!("url={url}"),
                ));
            }
            let body = &self.body[offset.min(self.body.len() as u64) as usize..];
            let mut sent = 0u64;
            for chunk in body.chunks(64) {
                if cancel.is_cancelled() {
                    return Err(SdkError::new(
                        ErrorKind::OperationCancelled,
                        "transfer was cancelled by the caller",
                        format!("url={url}"),
                    ));
                }
                sink.write_all(chunk)?;
                sent += chunk.len() as u64;
                on_bytes(sent);
            }
            Ok(sent)
        }

        fn fetch_text(&self, _url: &str) -> Result<String> {
            Ok(String::from_utf8_lossy(&self.body).into_owned())
        }

        fn content_length(&self, _url: &str) -> Result<Option<u64>> {
            Ok(Some(self.body.len() as u64))
        }
    }

    fn body_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn request_for(dir: &Path, body: &[u8]) -> DownloadRequest {
        DownloadRequest {
            url: "https://models.example.com/artifact.bin".to_owned(),
            dest_path: dir.join("llama-3b-1.0.0"),
            expected_size: body.len() as u64,
            expected_sha256: crate::hash::sha256_hex(body),
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                backoff_multiplier: 2.0,
            },
        }
    }

    fn collecting_progress() -> (DownloadProgress, Arc<Mutex<Vec<f32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: DownloadProgress =
            Arc::new(move |f| sink.lock().unwrap().push(f));
        (progress, seen)
    }

    #[test]
    fn clean_download_verifies_and_renames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(10_000);
        let request = request_for(dir.path(), &body);
        let transport = Arc::new(ScriptedTransport::always_ok(body.clone()));
        let engine = DownloadEngine::new(transport);
        let (progress, seen) = collecting_progress();

        engine
            .download(&request, &progress, &CancelFlag::new())
            .expect("download");

        assert_eq!(std::fs::read(&request.dest_path).expect("artifact"), body);
        assert!(!tmp_path(&request.dest_path).exists());

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|f| (0.0..=1.0).contains(f)));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "weakly increasing");
        assert!((seen.last().unwrap() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn transient_failures_are_retried_then_succeed() {
        // Attempts 0 and 1 time out; attempt 2 succeeds.
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(5_000);
        let request = request_for(dir.path(), &body);
        let transport = Arc::new(ScriptedTransport::new(
            body.clone(),
            vec![
                Some(ErrorKind::NetworkConnectionTimeout),
                Some(ErrorKind::NetworkConnectionTimeout),
                None,
            ],
        ));
        let engine = DownloadEngine::new(Arc::clone(&transport) as Arc<dyn Transport>);
        let (progress, seen) = collecting_progress();

        engine
            .download(&request, &progress, &CancelFlag::new())
            .expect("download succeeds on third attempt");

        assert_eq!(transport.attempts(), 3);
        assert_eq!(std::fs::read(&request.dest_path).expect("artifact"), body);
        assert!(!tmp_path(&request.dest_path).exists());
        let seen = seen.lock().unwrap();
        assert!((seen.last().unwrap() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn terminal_failure_aborts_without_retry_and_cleans_tmp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(5_000);
        let request = request_for(dir.path(), &body);
        let transport = Arc::new(ScriptedTransport::new(
            body,
            vec![Some(ErrorKind::NetworkHTTPError)],
        ));
        let engine = DownloadEngine::new(Arc::clone(&transport) as Arc<dyn Transport>);
        let (progress, _) = collecting_progress();

        let err = engine
            .download(&request, &progress, &CancelFlag::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkHTTPError);
        assert_eq!(transport.attempts(), 1);
        assert!(!request.dest_path.exists());
        assert!(!tmp_path(&request.dest_path).exists());
    }

    #[test]
    fn retries_exhausted_returns_last_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(1_000);
        let request = request_for(dir.path(), &body);
        let transport = Arc::new(ScriptedTransport::new(
            body,
            vec![
                Some(ErrorKind::NetworkUnreachable),
                Some(ErrorKind::NetworkUnreachable),
                Some(ErrorKind::NetworkUnreachable),
            ],
        ));
        let engine = DownloadEngine::new(Arc::clone(&transport) as Arc<dyn Transport>);
        let (progress, _) = collecting_progress();

        let err = engine
            .download(&request, &progress, &CancelFlag::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkUnreachable);
        assert_eq!(transport.attempts(), 3);
        assert!(!tmp_path(&request.dest_path).exists());
    }

    #[test]
    fn checksum_mismatch_deletes_tmp_and_reports_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(2_000);
        let mut request = request_for(dir.path(), &body);
        request.expected_sha256 =
            "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef".to_owned();
        let engine = DownloadEngine::new(Arc::new(ScriptedTransport::always_ok(body)));
        let (progress, _) = collecting_progress();

        let err = engine
            .download(&request, &progress, &CancelFlag::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModelFileCorrupted);
        assert!(!request.dest_path.exists());
        assert!(!tmp_path(&request.dest_path).exists());
    }

    #[test]
    fn checksum_comparison_is_case_insensitive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(2_000);
        let mut request = request_for(dir.path(), &body);
        request.expected_sha256 = request.expected_sha256.to_uppercase();
        let engine = DownloadEngine::new(Arc::new(ScriptedTransport::always_ok(body)));
        let (progress, _) = collecting_progress();
        engine
            .download(&request, &progress, &CancelFlag::new())
            .expect("uppercase checksum accepted");
        assert!(request.dest_path.exists());
    }

    #[test]
    fn partial_tmp_resumes_with_range_offset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(8_000);
        let request = request_for(dir.path(), &body);

        // Pre-seed the first half as a crashed previous attempt.
        std::fs::write(tmp_path(&request.dest_path), &body[..4_000]).expect("seed tmp");

        let transport = Arc::new(ScriptedTransport::always_ok(body.clone()));
        let engine = DownloadEngine::new(Arc::clone(&transport) as Arc<dyn Transport>);
        let (progress, seen) = collecting_progress();

        engine
            .download(&request, &progress, &CancelFlag::new())
            .expect("resumed download");

        assert_eq!(*transport.offsets.lock().unwrap(), vec![4_000]);
        assert_eq!(std::fs::read(&request.dest_path).expect("artifact"), body);
        let seen = seen.lock().unwrap();
        // First report is the resumed fraction.
        assert!((seen[0] - 0.5).abs() < 0.01);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn oversized_tmp_restarts_from_scratch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(1_000);
        let request = request_for(dir.path(), &body);
        std::fs::write(tmp_path(&request.dest_path), vec![0xffu8; 5_000]).expect("seed");

        let transport = Arc::new(ScriptedTransport::always_ok(body.clone()));
        let engine = DownloadEngine::new(Arc::clone(&transport) as Arc<dyn Transport>);
        let (progress, _) = collecting_progress();
        engine
            .download(&request, &progress, &CancelFlag::new())
            .expect("download");
        assert_eq!(*transport.offsets.lock().unwrap(), vec![0]);
        assert_eq!(std::fs::read(&request.dest_path).expect("artifact"), body);
    }

    #[test]
    fn cancellation_removes_tmp_and_reports_cancelled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(10_000);
        let request = request_for(dir.path(), &body);
        let engine = DownloadEngine::new(Arc::new(ScriptedTransport::always_ok(body)));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let (progress, _) = collecting_progress();

        let err = engine.download(&request, &progress, &cancel).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OperationCancelled);
        assert!(!request.dest_path.exists());
        assert!(!tmp_path(&request.dest_path).exists());
    }

    #[test]
    fn insufficient_storage_fails_fast_without_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(100);
        let mut request = request_for(dir.path(), &body);
        request.expected_size = u64::MAX / 2;
        let transport = Arc::new(ScriptedTransport::always_ok(body));
        let engine = DownloadEngine::new(Arc::clone(&transport) as Arc<dyn Transport>);
        let (progress, seen) = collecting_progress();

        let err = engine
            .download(&request, &progress, &CancelFlag::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StorageInsufficientSpace);
        assert_eq!(transport.attempts(), 0, "no transfer attempted");
        assert!(!tmp_path(&request.dest_path).exists());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_checksum_skips_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = body_of(500);
        let mut request = request_for(dir.path(), &body);
        request.expected_sha256 = String::new();
        let engine = DownloadEngine::new(Arc::new(ScriptedTransport::always_ok(body.clone())));
        let (progress, _) = collecting_progress();
        engine
            .download(&request, &progress, &CancelFlag::new())
            .expect("download without checksum");
        assert_eq!(std::fs::read(&request.dest_path).expect("artifact"), body);
    }

    #[test]
    fn concurrent_downloads_own_their_tmp_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body_a = body_of(3_000);
        let body_b = body_of(7_000);
        let mut request_a = request_for(dir.path(), &body_a);
        request_a.dest_path = dir.path().join("model-a-1.0.0");
        let mut request_b = request_for(dir.path(), &body_b);
        request_b.dest_path = dir.path().join("model-b-1.0.0");

        let engine_a = DownloadEngine::new(Arc::new(ScriptedTransport::always_ok(
            body_a.clone(),
        )));
        let engine_b = DownloadEngine::new(Arc::new(ScriptedTransport::always_ok(
            body_b.clone(),
        )));

        let ra = request_a.clone();
        let rb = request_b.clone();
        let ta = std::thread::spawn(move || {
            let (progress, _) = collecting_progress();
            engine_a.download(&ra, &progress, &CancelFlag::new())
        });
        let tb = std::thread::spawn(move || {
            let (progress, _) = collecting_progress();
            engine_b.download(&rb, &progress, &CancelFlag::new())
        });
        ta.join().expect("join a").expect("download a");
        tb.join().expect("join b").expect("download b");

        assert_eq!(std::fs::read(&request_a.dest_path).expect("a"), body_a);
        assert_eq!(std::fs::read(&request_b.dest_path).expect("b"), body_b);
    }
}
