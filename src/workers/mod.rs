//! Background workers: folder ingestion and face detection.
//!
//! Both consume external collaborators through the traits below and do their
//! store work on blocking threads. Cancellation is checked between units of
//! work, never in the middle of a store write.

pub mod face;
pub mod local;
pub mod sync;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::db::{BoundingBox, SharedFolder};

pub use face::{FaceBatchOutcome, FaceWorker};
pub use local::LocalDriveSource;
pub use sync::{SyncOutcome, SyncWorker};

/// A face returned by the detector, not yet stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: Vec<f32>,
}

/// Face detection and embedding service.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &[u8], mime_type: &str) -> anyhow::Result<Vec<DetectedFace>>;

    /// Cheap health probe, checked once per batch.
    fn is_available(&self) -> bool {
        true
    }
}

/// An image listed in a drive folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Path of the containing folder relative to the shared root.
    pub folder_path: String,
}

/// Read access to a linked drive folder.
pub trait DriveSource: Send + Sync {
    /// Every image below the folder, recursively.
    fn list_images(&self, folder: &SharedFolder) -> anyhow::Result<Vec<DriveFile>>;

    fn download(&self, folder: &SharedFolder, drive_file_id: &str) -> anyhow::Result<Vec<u8>>;
}

pub fn is_image_mime_type(mime_type: &str) -> bool {
    mime_type.starts_with("image/")
}

const RETRYABLE_PATTERNS: [&str; 8] = [
    "timeout",
    "connection refused",
    "connection reset",
    "temporary failure",
    "502",
    "503",
    "504",
    "rate limit",
];

/// Whether a collaborator error looks transient (network, overload, throttling).
pub fn is_retryable_error(err: &anyhow::Error) -> bool {
    let message = format!("{:#}", err).to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| message.contains(p))
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
}

/// Stops calling a failing collaborator for a while.
///
/// Opens after `threshold` consecutive failures. Once `reset_timeout` has
/// passed since the last failure it lets work through again (half-open);
/// one success closes it.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold,
            reset_timeout,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.failures < self.threshold {
            return false;
        }
        match state.last_failure {
            Some(at) => at.elapsed() <= self.reset_timeout,
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.failures = 0;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.failures = state.failures.saturating_add(1);
        state.last_failure = Some(Instant::now());
    }

    pub fn failures(&self) -> u32 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).failures
    }
}

/// Sleep for `duration` on a blocking thread, waking early on cancellation.
/// Returns false when cancelled.
pub(crate) fn sleep_unless_cancelled(
    cancel: &tokio_util::sync::CancellationToken,
    duration: Duration,
) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(Duration::from_millis(50)));
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Drive with a fixed listing; each file's bytes are its id.
    #[derive(Default)]
    pub struct FakeDrive {
        pub files: Mutex<Vec<DriveFile>>,
        pub list_error: Mutex<Option<String>>,
        pub download_errors: Mutex<HashMap<String, String>>,
    }

    impl FakeDrive {
        pub fn with_files(ids: &[&str]) -> Self {
            let drive = FakeDrive::default();
            drive.set_files(ids);
            drive
        }

        pub fn set_files(&self, ids: &[&str]) {
            *self.files.lock().unwrap() = ids
                .iter()
                .map(|id| DriveFile {
                    id: id.to_string(),
                    name: format!("{id}.jpg"),
                    mime_type: "image/jpeg".to_string(),
                    folder_path: "Albums".to_string(),
                })
                .collect();
        }
    }

    impl DriveSource for FakeDrive {
        fn list_images(&self, _folder: &SharedFolder) -> anyhow::Result<Vec<DriveFile>> {
            if let Some(message) = self.list_error.lock().unwrap().clone() {
                anyhow::bail!(message);
            }
            Ok(self.files.lock().unwrap().clone())
        }

        fn download(&self, _folder: &SharedFolder, drive_file_id: &str) -> anyhow::Result<Vec<u8>> {
            if let Some(message) = self.download_errors.lock().unwrap().get(drive_file_id) {
                anyhow::bail!(message.clone());
            }
            Ok(drive_file_id.as_bytes().to_vec())
        }
    }

    /// Detector returning `faces_per_image` faces of dimension `dim`, failing
    /// with `error` for the first `fail_times` calls.
    pub struct FakeDetector {
        pub dim: usize,
        pub faces_per_image: usize,
        pub error: Option<String>,
        pub fail_times: AtomicUsize,
        pub calls: AtomicUsize,
        pub available: bool,
    }

    impl FakeDetector {
        pub fn new(dim: usize, faces_per_image: usize) -> Self {
            Self {
                dim,
                faces_per_image,
                error: None,
                fail_times: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                available: true,
            }
        }

        pub fn failing(dim: usize, error: &str, times: usize) -> Self {
            Self {
                error: Some(error.to_string()),
                fail_times: AtomicUsize::new(times),
                ..Self::new(dim, 1)
            }
        }
    }

    impl FaceDetector for FakeDetector {
        fn detect(&self, _image: &[u8], _mime_type: &str) -> anyhow::Result<Vec<DetectedFace>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = &self.error {
                let left = self.fail_times.load(Ordering::SeqCst);
                if left > 0 {
                    self.fail_times.store(left - 1, Ordering::SeqCst);
                    anyhow::bail!(error.clone());
                }
            }
            let mut embedding = vec![0.0; self.dim];
            embedding[0] = 1.0;
            Ok((0..self.faces_per_image)
                .map(|i| DetectedFace {
                    bbox: BoundingBox {
                        x: i as f32 * 10.0,
                        y: 0.0,
                        width: 10.0,
                        height: 10.0,
                    },
                    confidence: 0.9,
                    embedding: embedding.clone(),
                })
                .collect())
        }

        fn is_available(&self) -> bool {
            self.available
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable_error(&anyhow::anyhow!("request Timeout after 30s")));
        assert!(is_retryable_error(&anyhow::anyhow!("upstream returned 503")));
        assert!(is_retryable_error(
            &anyhow::anyhow!("connection reset by peer").context("face extraction failed")
        ));
        assert!(!is_retryable_error(&anyhow::anyhow!("unsupported image format")));
    }

    #[test]
    fn test_breaker_opens_and_half_opens() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(50));
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.failures(), 2);

        std::thread::sleep(Duration::from_millis(80));
        assert!(!breaker.is_open());

        breaker.record_success();
        assert_eq!(breaker.failures(), 0);
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_unless_cancelled(&cancel, Duration::from_millis(10)));
        cancel.cancel();
        let started = Instant::now();
        assert!(!sleep_unless_cancelled(&cancel, Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_image_mime_types() {
        assert!(is_image_mime_type("image/heic"));
        assert!(!is_image_mime_type("video/mp4"));
    }
}
