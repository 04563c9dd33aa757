//! Continuous profiler agent.
//!
//! # Responsibilities
//! - Sample process resources on a fixed interval
//! - Upload sample batches to the profiling backend in collapsed-stack
//!   (`format=folded`) form, one series per profile type
//! - Upload the last partial batch when stopped
//!
//! # Design Decisions
//! - A failed start disables profiling; the service keeps running
//! - A failed upload drops that batch; there is no retry queue
//! - Stopped explicitly after tracing shutdown, not by the shared broadcast

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use url::Url;

use crate::config::{ProfilingConfig, TracingConfig};
use crate::profiling::sampler::{self, ResourceSample, ResourceSampler};

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("invalid profiling server URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unknown profile type `{0}`")]
    UnknownProfileType(String),

    #[error("failed to build profiling HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("profile upload failed: {0}")]
    Upload(#[source] reqwest::Error),

    #[error("profile upload rejected with status {0}")]
    Rejected(reqwest::StatusCode),
}

/// Resource dimension collected by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProfileType {
    Cpu,
    AllocObjects,
    AllocSpace,
    InuseObjects,
    InuseSpace,
    Workers,
}

impl ProfileType {
    pub const ALL: [ProfileType; 6] = [
        Self::Cpu,
        Self::AllocObjects,
        Self::AllocSpace,
        Self::InuseObjects,
        Self::InuseSpace,
        Self::Workers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::AllocObjects => "alloc_objects",
            Self::AllocSpace => "alloc_space",
            Self::InuseObjects => "inuse_objects",
            Self::InuseSpace => "inuse_space",
            Self::Workers => "workers",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileType {
    type Err = ProfilerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProfilerError::UnknownProfileType(s.to_string()))
    }
}

/// Resolved agent settings.
#[derive(Debug, Clone)]
pub struct ProfilerSettings {
    pub server_url: String,
    pub application_name: String,
    pub service_name: String,
    pub environment: String,
    pub version: String,
    pub tags: BTreeMap<String, String>,
    pub sample_interval: Duration,
    pub upload_interval: Duration,
    pub upload_timeout: Duration,
    pub profile_types: Vec<ProfileType>,
}

impl ProfilerSettings {
    pub fn from_config(profiling: &ProfilingConfig, tracing_config: &TracingConfig) -> Result<Self, ProfilerError> {
        let profile_types = profiling
            .profile_types
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<ProfileType>, _>>()?;

        Ok(Self {
            server_url: profiling.server_url.clone(),
            application_name: profiling.application_name.clone(),
            service_name: tracing_config.application_service.clone(),
            environment: tracing_config.environment.clone(),
            version: profiling.version.clone(),
            tags: profiling.tags.clone(),
            sample_interval: Duration::from_millis(profiling.sample_interval_ms),
            upload_interval: Duration::from_secs(profiling.upload_interval_secs),
            upload_timeout: Duration::from_secs(profiling.upload_timeout_secs),
            profile_types,
        })
    }

    /// Backend series name: `app.type{tag=value,...}`.
    fn series_name(&self, profile_type: ProfileType) -> String {
        let mut tags = self.tags.clone();
        tags.insert("service_name".to_string(), self.service_name.clone());
        tags.insert("environment".to_string(), self.environment.clone());
        tags.insert("version".to_string(), self.version.clone());

        let labels: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}.{}{{{}}}", self.application_name, profile_type, labels.join(","))
    }
}

/// How the backend combines values of one series across uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Average,
}

impl Aggregation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Average => "average",
        }
    }
}

/// One profile type of a batch in collapsed-stack form (`frame;frame value`).
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedProfile {
    pub profile_type: ProfileType,
    pub units: &'static str,
    pub aggregation: Aggregation,
    pub sample_rate: u32,
    pub body: String,
}

impl FoldedProfile {
    /// Collapse `samples` for `profile_type`; `None` when no sample carries it.
    ///
    /// CPU time is reported in milliseconds at a 1000 Hz sample rate so the
    /// backend renders it as seconds.
    pub fn fold(root: &str, profile_type: ProfileType, samples: &[ResourceSample]) -> Option<Self> {
        let (units, aggregation, sample_rate, lines) = match profile_type {
            ProfileType::Cpu => {
                let seconds: Vec<f64> = samples.iter().filter_map(|s| s.cpu_seconds).collect();
                if seconds.is_empty() {
                    return None;
                }
                let millis = (seconds.iter().sum::<f64>() * 1000.0).round() as u64;
                ("samples", Aggregation::Sum, CPU_SAMPLE_RATE, vec![("cpu", millis)])
            }
            ProfileType::AllocObjects => {
                let total = total(samples.iter().filter_map(|s| s.alloc_objects))?;
                ("objects", Aggregation::Sum, DEFAULT_SAMPLE_RATE, vec![("alloc_objects", total)])
            }
            ProfileType::AllocSpace => {
                let total = total(samples.iter().filter_map(|s| s.alloc_bytes))?;
                ("bytes", Aggregation::Sum, DEFAULT_SAMPLE_RATE, vec![("alloc_space", total)])
            }
            ProfileType::InuseObjects => {
                let mean = mean(samples.iter().filter_map(|s| s.inuse_objects))?;
                ("objects", Aggregation::Average, DEFAULT_SAMPLE_RATE, vec![("inuse_objects", mean)])
            }
            ProfileType::InuseSpace => {
                let mean = mean(samples.iter().filter_map(|s| s.inuse_bytes))?;
                ("bytes", Aggregation::Average, DEFAULT_SAMPLE_RATE, vec![("inuse_space", mean)])
            }
            ProfileType::Workers => {
                let workers = mean(samples.iter().filter_map(|s| s.workers.map(|w| w as u64)))?;
                let mut lines = vec![("workers", workers)];
                if let Some(tasks) = mean(samples.iter().filter_map(|s| s.alive_tasks.map(|t| t as u64))) {
                    lines.push(("alive_tasks", tasks));
                }
                ("objects", Aggregation::Average, DEFAULT_SAMPLE_RATE, lines)
            }
        };

        let body = lines
            .iter()
            .map(|(frame, value)| format!("{root};{frame} {value}\n"))
            .collect();
        Some(Self {
            profile_type,
            units,
            aggregation,
            sample_rate,
            body,
        })
    }
}

const CPU_SAMPLE_RATE: u32 = 1000;
const DEFAULT_SAMPLE_RATE: u32 = 100;
const SPY_NAME: &str = "rustspy";

fn total(values: impl Iterator<Item = u64>) -> Option<u64> {
    values.fold(None, |acc, v| Some(acc.unwrap_or(0).saturating_add(v)))
}

fn mean(values: impl Iterator<Item = u64>) -> Option<u64> {
    let (sum, count) = values.fold((0_u128, 0_u128), |(sum, count), v| (sum + u128::from(v), count + 1));
    (count > 0).then(|| ((sum + count / 2) / count) as u64)
}

/// Sampling uploader. Build with [`ContinuousProfiler::new`], then [`start`](Self::start).
#[derive(Debug)]
pub struct ContinuousProfiler {
    settings: ProfilerSettings,
    client: reqwest::Client,
    ingest_url: Url,
}

impl ContinuousProfiler {
    pub fn new(settings: ProfilerSettings) -> Result<Self, ProfilerError> {
        let ingest_url = ingest_url(&settings.server_url)?;
        let client = reqwest::Client::builder()
            .timeout(settings.upload_timeout)
            .build()
            .map_err(ProfilerError::Client)?;

        Ok(Self {
            settings,
            client,
            ingest_url,
        })
    }

    pub fn settings(&self) -> &ProfilerSettings {
        &self.settings
    }

    /// Spawn the sampling loop.
    pub fn start(self) -> ProfilerHandle {
        tracing::info!(
            server = %self.ingest_url,
            application = %self.settings.application_name,
            profile_types = ?self.settings.profile_types,
            "Continuous profiler started"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(stop_rx));
        ProfilerHandle { stop_tx, task }
    }

    /// Upload one batch covering `[from, until]` (unix seconds), one folded
    /// profile per selected type. Stops at the first failed upload.
    pub async fn upload(&self, samples: &[ResourceSample], from: u64, until: u64) -> Result<usize, ProfilerError> {
        let mut uploaded = 0;
        for &profile_type in &self.settings.profile_types {
            let Some(profile) = FoldedProfile::fold(&self.settings.application_name, profile_type, samples) else {
                continue;
            };
            self.upload_profile(profile, from, until).await?;
            uploaded += 1;
        }
        Ok(uploaded)
    }

    async fn upload_profile(&self, profile: FoldedProfile, from: u64, until: u64) -> Result<(), ProfilerError> {
        let response = self
            .client
            .post(self.ingest_url.clone())
            .query(&[
                ("name", self.settings.series_name(profile.profile_type)),
                ("from", from.to_string()),
                ("until", until.to_string()),
                ("format", "folded".to_string()),
                ("sampleRate", profile.sample_rate.to_string()),
                ("spyName", SPY_NAME.to_string()),
                ("units", profile.units.to_string()),
                ("aggregationType", profile.aggregation.as_str().to_string()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(profile.body)
            .send()
            .await
            .map_err(ProfilerError::Upload)?;

        if !response.status().is_success() {
            return Err(ProfilerError::Rejected(response.status()));
        }
        Ok(())
    }

    async fn run(self, mut stop: oneshot::Receiver<()>) {
        let mut sample_ticker = time::interval(self.settings.sample_interval);
        sample_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let upload_interval = self.settings.upload_interval;
        let mut upload_ticker = time::interval_at(Instant::now() + upload_interval, upload_interval);

        let mut sampler = ResourceSampler::new(&self.settings.profile_types);
        let mut batch = Vec::new();
        let mut from = unix_secs();

        loop {
            tokio::select! {
                _ = sample_ticker.tick() => {
                    batch.push(sampler.sample());
                }
                _ = upload_ticker.tick() => {
                    self.flush(&mut batch, &mut from).await;
                }
                _ = &mut stop => {
                    self.flush(&mut batch, &mut from).await;
                    tracing::info!("Continuous profiler stopped");
                    break;
                }
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<ResourceSample>, from: &mut u64) {
        if batch.is_empty() {
            return;
        }
        let samples = std::mem::take(batch);
        let until = unix_secs();

        match self.upload(&samples, *from, until).await {
            Ok(profiles) => tracing::debug!(samples = samples.len(), profiles, "Profile batch uploaded"),
            Err(e) => tracing::warn!(error = %e, dropped = samples.len(), "Profile upload failed, batch dropped"),
        }
        *from = until;
    }
}

/// Running agent.
#[derive(Debug)]
pub struct ProfilerHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ProfilerHandle {
    /// Upload the final batch and wait for the loop to exit.
    pub async fn stop(self, timeout: Duration) {
        let _ = self.stop_tx.send(());
        let mut task = self.task;
        match time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Continuous profiler task failed"),
            Err(_) => {
                tracing::warn!(timeout = ?timeout, "Continuous profiler did not stop in time");
                task.abort();
            }
        }
    }
}

/// Start the agent, or log why not and carry on without it.
pub fn start_or_disable(profiling: &ProfilingConfig, tracing_config: &TracingConfig) -> Option<ProfilerHandle> {
    if !profiling.enabled {
        tracing::info!("Continuous profiling disabled by configuration");
        return None;
    }

    match ProfilerSettings::from_config(profiling, tracing_config).and_then(ContinuousProfiler::new) {
        Ok(profiler) => Some(profiler.start()),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to start continuous profiler, profiling disabled");
            None
        }
    }
}

fn ingest_url(server_url: &str) -> Result<Url, ProfilerError> {
    let invalid = |reason: String| ProfilerError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };

    let mut url = Url::parse(server_url.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    url.path_segments_mut()
        .map_err(|_| invalid("URL cannot be a base".to_string()))?
        .pop_if_empty()
        .push("ingest");
    Ok(url)
}

fn unix_secs() -> u64 {
    sampler::unix_millis() / 1000
}
