//! Data models

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Durations are written as floating point milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(d)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(ms / 1000.0))
    }
}

/// A not-yet-validated `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub source_tags: BTreeSet<String>,
}

impl Candidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            source_tags: BTreeSet::new(),
        }
    }

    /// `host:port`, IPv6 hosts are bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityResult {
    pub candidate: Candidate,
    pub reachable: bool,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub candidate: Candidate,
    pub is_target_service: bool,
    pub active_connections: i64,
    pub bound_address: String,
}

impl ServiceRecord {
    pub fn matched(candidate: Candidate, active_connections: i64, bound_address: String) -> Self {
        Self {
            candidate,
            is_target_service: true,
            active_connections,
            bound_address,
        }
    }

    pub fn mismatch(candidate: Candidate) -> Self {
        Self {
            candidate,
            is_target_service: false,
            active_connections: 0,
            bound_address: String::new(),
        }
    }

    pub fn address(&self) -> String {
        self.candidate.address()
    }
}

/// Region/operator specific test stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub operator_tag: String,
    pub region_tag: String,
    pub stream_address: String,
}

impl StreamConfig {
    pub fn new(
        operator_tag: impl Into<String>,
        region_tag: impl Into<String>,
        stream_address: impl Into<String>,
    ) -> Self {
        Self {
            operator_tag: operator_tag.into(),
            region_tag: region_tag.into(),
            stream_address: stream_address.into(),
        }
    }

    /// Case-insensitive match on region and operator
    pub fn matches(&self, region: &str, operator: &str) -> bool {
        self.region_tag.eq_ignore_ascii_case(region.trim())
            && self.operator_tag.eq_ignore_ascii_case(operator.trim())
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.operator_tag, self.region_tag)
    }
}

/// Why a throughput test did not produce a confirmed result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum FailureReason {
    ConnectTimeout,
    ConnectFailed,
    /// HTTP status indicating the stream does not exist
    StreamNotFound(u16),
    TransferTimeout,
    TransferError,
    /// Low-confidence success, speed is a placeholder
    InsufficientData,
    AnomalousSpeed,
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectTimeout => f.write_str("连接超时"),
            Self::ConnectFailed => f.write_str("连接失败"),
            Self::StreamNotFound(status) => write!(f, "HTTP {}", status),
            Self::TransferTimeout => f.write_str("任务超时"),
            Self::TransferError => f.write_str("传输错误"),
            Self::InsufficientData => f.write_str("数据不足"),
            Self::AnomalousSpeed => f.write_str("速度异常"),
            Self::Cancelled => f.write_str("已取消"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedResult {
    pub service_record: ServiceRecord,
    pub config_used: StreamConfig,
    pub bytes_transferred: u64,
    #[serde(with = "duration_ms")]
    pub elapsed_time: Duration,
    pub speed_mbps: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl SpeedResult {
    pub fn failure(record: ServiceRecord, config: StreamConfig, reason: FailureReason) -> Self {
        Self {
            service_record: record,
            config_used: config,
            bytes_transferred: 0,
            elapsed_time: Duration::ZERO,
            speed_mbps: 0.0,
            success: false,
            failure_reason: Some(reason),
        }
    }

    /// Success backed by real data (not a placeholder)
    pub fn is_confirmed(&self) -> bool {
        self.success && self.failure_reason.is_none()
    }
}

/// Which optimizer pass produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stage1,
    Stage2,
}

/// Per-run selection supplied by the CLI layer
#[derive(Debug, Clone, Default)]
pub struct RunParams {
    pub region: String,
    pub operator: String,
    /// Skip Stage 2 entirely
    pub fast_mode: bool,
    /// Skip throughput testing, emit service records only
    pub probe_only: bool,
    /// Upper bound on fallback configs tried per record (0 = all)
    pub stage2_max_attempts: usize,
}

/// Counts reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub candidates_in: usize,
    pub rejected_tokens: usize,
    pub candidates: usize,
    pub reachable: usize,
    pub validated: usize,
    pub stage1_successes: usize,
    pub stage2_successes: usize,
    pub stage2_attempts: usize,
    pub final_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    #[serde(default = "default_validate_timeout_ms")]
    pub validate_timeout_ms: u64,
    #[serde(default = "default_validate_concurrency")]
    pub validate_concurrency: usize,
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default = "default_max_transfer_bytes")]
    pub max_transfer_bytes: u64,
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_min_signal_bytes")]
    pub min_signal_bytes: u64,
    #[serde(default = "default_min_signal_window_ms")]
    pub min_signal_window_ms: u64,
    #[serde(default = "default_placeholder_speed")]
    pub placeholder_speed_mbps: f64,
    #[serde(default = "default_anomalous_speed")]
    pub anomalous_speed_mbps: f64,
    #[serde(default = "default_speed_floor")]
    pub speed_floor_mbps: f64,
    #[serde(default = "default_stage1_concurrency")]
    pub stage1_concurrency: usize,
    #[serde(default = "default_stage2_concurrency")]
    pub stage2_concurrency: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default)]
    pub collapse_subnets: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_concurrency: default_probe_concurrency(),
            validate_timeout_ms: default_validate_timeout_ms(),
            validate_concurrency: default_validate_concurrency(),
            status_path: default_status_path(),
            max_transfer_bytes: default_max_transfer_bytes(),
            transfer_timeout_ms: default_transfer_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            min_signal_bytes: default_min_signal_bytes(),
            min_signal_window_ms: default_min_signal_window_ms(),
            placeholder_speed_mbps: default_placeholder_speed(),
            anomalous_speed_mbps: default_anomalous_speed(),
            speed_floor_mbps: default_speed_floor(),
            stage1_concurrency: default_stage1_concurrency(),
            stage2_concurrency: default_stage2_concurrency(),
            task_timeout_secs: default_task_timeout_secs(),
            collapse_subnets: false,
            user_agent: default_user_agent(),
        }
    }
}

impl AppConfig {
    /// Clamp values that would stall or disable a phase
    pub fn sanitized(mut self) -> Self {
        self.probe_concurrency = self.probe_concurrency.clamp(1, 512);
        self.validate_concurrency = self.validate_concurrency.clamp(1, 256);
        self.stage1_concurrency = self.stage1_concurrency.clamp(1, 64);
        self.stage2_concurrency = self.stage2_concurrency.clamp(1, 64);
        self.probe_timeout_ms = self.probe_timeout_ms.max(100);
        self.validate_timeout_ms = self.validate_timeout_ms.max(100);
        self.connect_timeout_ms = self.connect_timeout_ms.max(100);
        self.transfer_timeout_ms = self.transfer_timeout_ms.max(100);
        self.task_timeout_secs = self.task_timeout_secs.max(1);
        self.max_transfer_bytes = self.max_transfer_bytes.max(1);
        if !self.status_path.starts_with('/') {
            self.status_path.insert(0, '/');
        }
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_millis(self.validate_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_probe_concurrency() -> usize {
    32
}
fn default_validate_timeout_ms() -> u64 {
    5_000
}
fn default_validate_concurrency() -> usize {
    16
}
fn default_status_path() -> String {
    "/status".into()
}
fn default_max_transfer_bytes() -> u64 {
    2 * 1024 * 1024
}
fn default_transfer_timeout_ms() -> u64 {
    8_000
}
fn default_connect_timeout_ms() -> u64 {
    8_000
}
fn default_min_signal_bytes() -> u64 {
    10 * 1024
}
fn default_min_signal_window_ms() -> u64 {
    500
}
fn default_placeholder_speed() -> f64 {
    0.001
}
fn default_anomalous_speed() -> f64 {
    1000.0
}
fn default_speed_floor() -> f64 {
    0.1
}
fn default_stage1_concurrency() -> usize {
    8
}
fn default_stage2_concurrency() -> usize {
    3
}
fn default_task_timeout_secs() -> u64 {
    120
}
fn default_user_agent() -> String {
    "FFmpeg/4.4.0".into()
}
