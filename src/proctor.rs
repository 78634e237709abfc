//! One-shot environment checks run before an exam.
//!
//! Every check resolves to a [`CheckOutcome`]; failures are folded into the
//! outcome's message instead of being returned as errors.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Clock drift must stay strictly below this.
pub const MAX_CLOCK_DRIFT_MS: i64 = 5000;

pub const DEFAULT_THRESHOLD_MBPS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

pub fn evaluate_drift(drift_ms: i64) -> CheckOutcome {
    let drift = drift_ms.abs();
    if drift < MAX_CLOCK_DRIFT_MS {
        CheckOutcome::pass()
    } else {
        let err = Error::ThresholdNotMet(format!(
            "system clock is off by {} ms (allowed < {} ms)",
            drift, MAX_CLOCK_DRIFT_MS
        ));
        CheckOutcome::fail(err.to_string())
    }
}

pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}

pub fn evaluate_throughput(mbps: f64, threshold_mbps: f64) -> CheckOutcome {
    if mbps >= threshold_mbps {
        CheckOutcome::pass()
    } else {
        let err = Error::ThresholdNotMet(format!(
            "download speed {:.2} Mbps is below the required {} Mbps",
            mbps, threshold_mbps
        ));
        CheckOutcome::fail(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkReport {
    pub throughput: CheckOutcome,
    pub clock_sync: CheckOutcome,
}

/// Throughput and clock probes against the assessment backend.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    client: reqwest::Client,
    base_url: String,
    probe_path: String,
    time_path: String,
}

impl NetworkProbe {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        probe_path: impl Into<String>,
        time_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            probe_path: probe_path.into(),
            time_path: time_path.into(),
        }
    }

    /// Run both probes concurrently.
    pub async fn run(&self, threshold_mbps: f64) -> NetworkReport {
        let (throughput, clock_sync) = tokio::join!(self.throughput(threshold_mbps), self.clock_sync());
        NetworkReport {
            throughput,
            clock_sync,
        }
    }

    pub async fn clock_sync(&self) -> CheckOutcome {
        let outcome = match self.fetch_server_time().await {
            Ok(server_time) => evaluate_drift((Utc::now() - server_time).num_milliseconds()),
            Err(e) => CheckOutcome::fail(e.to_string()),
        };
        info!(ok = outcome.ok, "Clock sync check");
        outcome
    }

    async fn fetch_server_time(&self) -> Result<DateTime<Utc>> {
        let url = format!("{}{}", self.base_url, self.time_path);
        let body: ServerTime = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.server_time)
    }

    pub async fn throughput(&self, threshold_mbps: f64) -> CheckOutcome {
        let outcome = match self.measure_mbps().await {
            Ok(mbps) => {
                info!(mbps, threshold_mbps, "Throughput measured");
                evaluate_throughput(mbps, threshold_mbps)
            }
            Err(e) => CheckOutcome::fail(e.to_string()),
        };
        if !outcome.ok {
            warn!(error = ?outcome.error, "Throughput check failed");
        }
        outcome
    }

    async fn measure_mbps(&self) -> Result<f64> {
        let url = format!("{}{}", self.base_url, self.probe_path);
        let started = Instant::now();
        let body = self
            .client
            .get(&url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(reqwest::header::PRAGMA, "no-cache")
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(throughput_mbps(body.len() as u64, started.elapsed()))
    }
}

#[async_trait]
pub trait DisplayHost: Send + Sync {
    fn is_fullscreen(&self) -> bool;

    async fn request_fullscreen(&self) -> std::result::Result<(), String>;
}

pub async fn check_fullscreen(host: &dyn DisplayHost) -> CheckOutcome {
    if host.is_fullscreen() {
        return CheckOutcome::pass();
    }
    match host.request_fullscreen().await {
        Ok(()) => CheckOutcome::pass(),
        Err(reason) => {
            warn!(%reason, "Fullscreen request refused");
            CheckOutcome::fail(Error::PermissionDenied(format!("fullscreen: {}", reason)).to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDevice {
    Microphone,
    Camera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
}

/// A live capture; released right after a successful probe.
pub trait CaptureStream: Send {
    fn stop_all(&mut self);
}

#[async_trait]
pub trait MediaHost: Send + Sync {
    /// Per-device permission state, `None` where the platform cannot say.
    async fn query_permission(&self, device: MediaDevice) -> Option<PermissionState>;

    /// Request combined audio and video capture.
    async fn request_capture(&self) -> std::result::Result<Box<dyn CaptureStream>, String>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaOutcome {
    pub microphone: CheckOutcome,
    pub camera: CheckOutcome,
    /// Set when the per-device split was guessed from the error text.
    pub approximate: bool,
}

pub async fn check_media(host: &dyn MediaHost) -> MediaOutcome {
    let reason = match host.request_capture().await {
        Ok(mut stream) => {
            stream.stop_all();
            return MediaOutcome {
                microphone: CheckOutcome::pass(),
                camera: CheckOutcome::pass(),
                approximate: false,
            };
        }
        Err(reason) => reason,
    };
    warn!(%reason, "Media capture refused");

    let mic = host.query_permission(MediaDevice::Microphone).await;
    let cam = host.query_permission(MediaDevice::Camera).await;
    let (mic_failed, cam_failed, approximate) = match (mic, cam) {
        (Some(mic), Some(cam)) => {
            let mic_failed = mic != PermissionState::Granted;
            let cam_failed = cam != PermissionState::Granted;
            if mic_failed || cam_failed {
                (mic_failed, cam_failed, false)
            } else {
                // Both granted yet capture failed: not a permission problem per device.
                (true, true, false)
            }
        }
        _ => {
            let (mic_failed, cam_failed) = classify_media_error(&reason);
            (mic_failed, cam_failed, true)
        }
    };

    let outcome = |failed: bool, device: &str| {
        if failed {
            CheckOutcome::fail(Error::PermissionDenied(format!("{}: {}", device, reason)).to_string())
        } else {
            CheckOutcome::pass()
        }
    };
    MediaOutcome {
        microphone: outcome(mic_failed, "microphone"),
        camera: outcome(cam_failed, "camera"),
        approximate,
    }
}

/// Guess which device a capture error names. Approximate: when the text
/// names neither device, both are marked failed.
pub fn classify_media_error(message: &str) -> (bool, bool) {
    let lower = message.to_lowercase();
    let mic = ["audio", "microphone", "mic"].iter().any(|k| lower.contains(k));
    let cam = ["video", "camera", "webcam"].iter().any(|k| lower.contains(k));
    if mic || cam {
        (mic, cam)
    } else {
        (true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn drift_boundary_is_exclusive() {
        assert!(!evaluate_drift(5000).ok);
        assert!(evaluate_drift(4999).ok);
        assert!(evaluate_drift(-4999).ok);
        assert!(!evaluate_drift(-5000).ok);
    }

    #[test]
    fn throughput_at_threshold_passes() {
        assert!(evaluate_throughput(1.0, 1.0).ok);
        let below = evaluate_throughput(4.0, 5.0);
        assert!(!below.ok);
        let msg = below.error.unwrap();
        assert!(msg.contains("4.00"), "{}", msg);
        assert!(msg.contains("5 Mbps"), "{}", msg);
    }

    #[test]
    fn mbps_from_bytes_and_time() {
        let mbps = throughput_mbps(1_000_000, Duration::from_secs(8));
        assert!((mbps - 1.0).abs() < 1e-9);
    }

    fn probe(server: &MockServer) -> NetworkProbe {
        NetworkProbe::new(reqwest::Client::new(), server.uri(), "/speed-test.bin", "/api/server-time")
    }

    #[tokio::test]
    async fn clock_sync_against_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/server-time"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "serverTime": Utc::now().to_rfc3339()
            })))
            .mount(&server)
            .await;
        assert!(probe(&server).clock_sync().await.ok);
    }

    #[tokio::test]
    async fn clock_sync_detects_skew_and_errors() {
        let server = MockServer::start().await;
        let skewed = Utc::now() - chrono::Duration::seconds(30);
        Mock::given(path("/api/server-time"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "serverTime": skewed.to_rfc3339() })),
            )
            .mount(&server)
            .await;
        let outcome = probe(&server).clock_sync().await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("threshold not met"));

        let down = MockServer::start().await;
        Mock::given(path("/api/server-time"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;
        let outcome = probe(&down).clock_sync().await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("network error"));
    }

    #[tokio::test]
    async fn throughput_downloads_uncached_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/speed-test.bin"))
            .and(header("cache-control", "no-cache"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 256 * 1024]))
            .expect(2)
            .mount(&server)
            .await;

        let p = probe(&server);
        assert!(p.throughput(0.001).await.ok);
        let slow = p.throughput(1.0e9).await;
        assert!(!slow.ok);
        assert!(slow.error.unwrap().contains("1000000000 Mbps"));
    }

    struct Display {
        fullscreen: bool,
        refuse: bool,
        requested: AtomicBool,
    }

    #[async_trait]
    impl DisplayHost for Display {
        fn is_fullscreen(&self) -> bool {
            self.fullscreen
        }

        async fn request_fullscreen(&self) -> std::result::Result<(), String> {
            self.requested.store(true, Ordering::SeqCst);
            if self.refuse {
                Err("request denied by user agent".into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn fullscreen_requests_only_when_needed() {
        let already = Display {
            fullscreen: true,
            refuse: true,
            requested: AtomicBool::new(false),
        };
        assert!(check_fullscreen(&already).await.ok);
        assert!(!already.requested.load(Ordering::SeqCst));

        let refused = Display {
            fullscreen: false,
            refuse: true,
            requested: AtomicBool::new(false),
        };
        let outcome = check_fullscreen(&refused).await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("request denied"));
    }

    struct Stream(Arc<AtomicBool>);

    impl CaptureStream for Stream {
        fn stop_all(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct Media {
        capture_error: Option<String>,
        permissions: Option<(PermissionState, PermissionState)>,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MediaHost for Media {
        async fn query_permission(&self, device: MediaDevice) -> Option<PermissionState> {
            self.permissions.map(|(mic, cam)| match device {
                MediaDevice::Microphone => mic,
                MediaDevice::Camera => cam,
            })
        }

        async fn request_capture(&self) -> std::result::Result<Box<dyn CaptureStream>, String> {
            match &self.capture_error {
                Some(e) => Err(e.clone()),
                None => Ok(Box::new(Stream(self.stopped.clone()))),
            }
        }
    }

    #[tokio::test]
    async fn granted_capture_is_released() {
        let stopped = Arc::new(AtomicBool::new(false));
        let host = Media {
            capture_error: None,
            permissions: None,
            stopped: stopped.clone(),
        };
        let outcome = check_media(&host).await;
        assert!(outcome.microphone.ok && outcome.camera.ok);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn structured_permissions_win_over_message() {
        let host = Media {
            capture_error: Some("Could not start video source".into()),
            permissions: Some((PermissionState::Denied, PermissionState::Granted)),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        let outcome = check_media(&host).await;
        assert!(!outcome.microphone.ok);
        assert!(outcome.camera.ok);
        assert!(!outcome.approximate);
    }

    #[tokio::test]
    async fn falls_back_to_message_heuristic() {
        let host = Media {
            capture_error: Some("Permission denied: microphone".into()),
            permissions: None,
            stopped: Arc::new(AtomicBool::new(false)),
        };
        let outcome = check_media(&host).await;
        assert!(!outcome.microphone.ok);
        assert!(outcome.camera.ok);
        assert!(outcome.approximate);
    }

    #[test]
    fn heuristic_marks_both_when_unspecific() {
        assert_eq!(classify_media_error("NotAllowedError"), (true, true));
        assert_eq!(classify_media_error("Requested device not found: camera"), (false, true));
    }
}
