// src/telemetry.rs
//
// Fire-and-retry uploads from a publisher to the telemetry backend.
//
//   POST {base}/upload-snapshot    multipart: snapshot, teamId, employeeId
//   POST {base}/upload-app-usage   JSON AppUsage
//
// ─ Retry policy ─────────────────────────────────────────────────────────────
//
//   Attempt 1: immediate
//   Attempt 2: 1 s
//   Attempt 3: 2 s
//   Then give up and log the failure.
//
// ────────────────────────────────────────────────────────────────────────────

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::error::TelemetryError;

// ─── Payloads ───────────────────────────────────────────────────────────────

/// Body of `POST /upload-app-usage`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppUsage {
    pub app_name: String,
    pub window_title: String,
    pub team_id: String,
    pub employee_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Foreground application as reported by a [`UsageSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSample {
    pub app_name: String,
    pub window_title: String,
}

// ─── Client ─────────────────────────────────────────────────────────────────

pub struct TelemetryClient {
    http: Client,
    base_url: String,
    policy: Backoff,
    team_id: String,
    employee_id: String,
}

impl TelemetryClient {
    pub fn new(base_url: &str, team_id: &str, employee_id: &str) -> Result<Self, TelemetryError> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            policy: Backoff::telemetry(),
            team_id: team_id.to_string(),
            employee_id: employee_id.to_string(),
        })
    }

    pub fn with_policy(mut self, policy: Backoff) -> Self {
        self.policy = policy;
        self
    }

    /// Upload one JPEG snapshot.  The form is rebuilt for every attempt.
    pub async fn upload_snapshot(&self, jpeg: Bytes) -> Result<(), TelemetryError> {
        let url = &format!("{}/upload-snapshot", self.base_url);
        let jpeg = &jpeg;
        self.with_retry("snapshot", || async move {
            let part = Part::bytes(jpeg.to_vec())
                .file_name("snapshot.jpg")
                .mime_str("image/jpeg")?;
            let form = Form::new()
                .part("snapshot", part)
                .text("teamId", self.team_id.clone())
                .text("employeeId", self.employee_id.clone());
            let response = self.http.post(url).multipart(form).send().await?;
            check_status(response.status())
        })
        .await
    }

    pub async fn report_usage(
        &self,
        app_name: &str,
        window_title: &str,
    ) -> Result<(), TelemetryError> {
        let url = format!("{}/upload-app-usage", self.base_url);
        let body = AppUsage {
            app_name: app_name.to_string(),
            window_title: window_title.to_string(),
            team_id: self.team_id.clone(),
            employee_id: self.employee_id.clone(),
            timestamp: Utc::now(),
        };
        let (url, body) = (&url, &body);
        self.with_retry("usage", || async move {
            let response = self.http.post(url).json(body).send().await?;
            check_status(response.status())
        })
        .await
    }

    async fn with_retry<F, Fut>(
        &self,
        what: &'static str,
        mut attempt_once: F,
    ) -> Result<(), TelemetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), TelemetryError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            if attempts > 0 {
                let delay = self.policy.delay_for(attempts - 1);
                info!(
                    what,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying upload"
                );
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            match attempt_once().await {
                Ok(()) => {
                    debug!(what, attempts, "upload delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(what, attempt = attempts, error = %e, "upload failed");
                    if !self.policy.should_retry(attempts) {
                        error!(what, "upload exhausted all {attempts} attempts");
                        return Err(TelemetryError::Exhausted {
                            attempts,
                            last: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}

fn check_status(status: reqwest::StatusCode) -> Result<(), TelemetryError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TelemetryError::Status { status: status.as_u16() })
    }
}

// ─── Sources ────────────────────────────────────────────────────────────────

/// Produces an encoded JPEG of the current screen, if one is available.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn capture(&self) -> Option<Bytes>;
}

#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn current(&self) -> Option<UsageSample>;
}

/// Reads the JPEG an external screen grabber keeps overwriting at `path`.
pub struct FileSnapshotSource {
    path: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshotSource {
    async fn capture(&self) -> Option<Bytes> {
        match tokio::fs::read(&self.path).await {
            Ok(data) if !data.is_empty() => Some(Bytes::from(data)),
            Ok(_) => None,
            Err(e) => {
                debug!(path = %self.path.display(), "snapshot unavailable: {e}");
                None
            }
        }
    }
}

/// Reads `app<TAB>window title` from the first line of `path`.
pub struct FileUsageSource {
    path: PathBuf,
}

impl FileUsageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl UsageSource for FileUsageSource {
    async fn current(&self) -> Option<UsageSample> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %self.path.display(), "usage unavailable: {e}");
                return None;
            }
        };
        let line = text.lines().next()?.trim_end();
        let (app_name, window_title) = line.split_once('\t').unwrap_or((line, ""));
        if app_name.is_empty() {
            return None;
        }
        Some(UsageSample {
            app_name: app_name.to_string(),
            window_title: window_title.to_string(),
        })
    }
}

// ─── Background reporter ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReporterIntervals {
    pub snapshot: Duration,
    pub usage: Duration,
}

impl Default for ReporterIntervals {
    fn default() -> Self {
        Self {
            snapshot: Duration::from_secs(30),
            usage: Duration::from_secs(12),
        }
    }
}

/// Periodically upload snapshots and usage while `is_active` holds.
///
/// Each upload runs on its own task so a slow retry never delays the next tick.
pub fn spawn_reporter(
    client: Arc<TelemetryClient>,
    snapshots: Arc<dyn SnapshotSource>,
    usage: Arc<dyn UsageSource>,
    is_active: Arc<dyn Fn() -> bool + Send + Sync>,
    intervals: ReporterIntervals,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now();
        let mut snapshot_tick =
            tokio::time::interval_at(start + intervals.snapshot, intervals.snapshot);
        let mut usage_tick = tokio::time::interval_at(start + intervals.usage, intervals.usage);
        info!("telemetry reporter started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = snapshot_tick.tick() => {
                    if !is_active() {
                        continue;
                    }
                    let Some(jpeg) = snapshots.capture().await else {
                        debug!("no snapshot available");
                        continue;
                    };
                    let client = client.clone();
                    tokio::spawn(async move {
                        let _ = client.upload_snapshot(jpeg).await;
                    });
                }

                _ = usage_tick.tick() => {
                    if !is_active() {
                        continue;
                    }
                    let Some(sample) = usage.current().await else {
                        continue;
                    };
                    let client = client.clone();
                    tokio::spawn(async move {
                        let _ = client.report_usage(&sample.app_name, &sample.window_title).await;
                    });
                }
            }
        }
        info!("telemetry reporter stopped");
    })
}
