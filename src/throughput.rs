//! Throughput tester
//!
//! Pulls a bounded amount of a test stream through a relay and turns the
//! result into a [`SpeedResult`]. Three caps end a transfer, whichever comes
//! first: byte count, transfer wall clock, and connection setup (TCP connect
//! plus response headers). Hitting a cap is a normal end, not an error.

use crate::logging::debug_log;
use crate::models::{AppConfig, FailureReason, ServiceRecord, SpeedResult, StreamConfig};
use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use url::Url;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TransferLimits {
    pub max_bytes: u64,
    pub transfer_timeout: Duration,
    pub connect_timeout: Duration,
    /// Below this many bytes a transfer carries no usable signal
    pub min_signal_bytes: u64,
    /// ...provided it ran at least this long
    pub min_signal_window: Duration,
    pub placeholder_speed_mbps: f64,
    pub anomalous_speed_mbps: f64,
}

impl From<&AppConfig> for TransferLimits {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_bytes: config.max_transfer_bytes,
            transfer_timeout: Duration::from_millis(config.transfer_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            min_signal_bytes: config.min_signal_bytes,
            min_signal_window: Duration::from_millis(config.min_signal_window_ms),
            placeholder_speed_mbps: config.placeholder_speed_mbps,
            anomalous_speed_mbps: config.anomalous_speed_mbps,
        }
    }
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub speed_mbps: f64,
    pub success: bool,
    pub failure_reason: Option<FailureReason>,
}

/// Decide what a finished transfer means.
///
/// Tiny transfers that took real time are "no signal": success with the
/// placeholder speed and `InsufficientData`, so a silent relay sorts below any
/// real measurement. Tiny transfers that ended early are treated as broken.
pub fn classify_transfer(bytes: u64, elapsed: Duration, limits: &TransferLimits) -> Verdict {
    if bytes < limits.min_signal_bytes {
        return if elapsed >= limits.min_signal_window {
            Verdict {
                speed_mbps: limits.placeholder_speed_mbps,
                success: true,
                failure_reason: Some(FailureReason::InsufficientData),
            }
        } else {
            Verdict {
                speed_mbps: 0.0,
                success: false,
                failure_reason: Some(FailureReason::TransferError),
            }
        };
    }

    let secs = elapsed.as_secs_f64().max(1e-9);
    let speed_mbps = bytes as f64 / BYTES_PER_MB / secs;
    if speed_mbps > limits.anomalous_speed_mbps {
        return Verdict {
            speed_mbps,
            success: false,
            failure_reason: Some(FailureReason::AnomalousSpeed),
        };
    }

    Verdict {
        speed_mbps,
        success: true,
        failure_reason: None,
    }
}

/// `http://host:port/udp/239.x.x.x:port`
pub fn stream_url(record: &ServiceRecord, config: &StreamConfig) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "http://{}/{}",
        record.address(),
        config.stream_address.trim_start_matches('/')
    ))
}

/// Anything that can run one (record, config) throughput test
pub trait SpeedProbe: Send + Sync + 'static {
    fn measure(
        &self,
        record: &ServiceRecord,
        config: &StreamConfig,
    ) -> impl Future<Output = SpeedResult> + Send;
}

#[derive(Clone)]
pub struct ThroughputTester {
    client: Client,
    limits: TransferLimits,
}

impl ThroughputTester {
    pub fn new(limits: TransferLimits, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(user_agent)
            .no_proxy()
            .pool_max_idle_per_host(0)
            .connect_timeout(limits.connect_timeout)
            .build()?;
        Ok(Self { client, limits })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, reqwest::Error> {
        Self::new(TransferLimits::from(config), &config.user_agent)
    }

    async fn run(&self, record: &ServiceRecord, config: &StreamConfig) -> SpeedResult {
        let fail = |reason| SpeedResult::failure(record.clone(), config.clone(), reason);

        let url = match stream_url(record, config) {
            Ok(url) => url,
            Err(e) => {
                debug_log!("  {} 无效的流地址 {}: {}", record.address(), config.stream_address, e);
                return fail(FailureReason::ConnectFailed);
            }
        };

        let send = self.client.get(url.clone()).send();
        let mut resp = match tokio::time::timeout(self.limits.connect_timeout, send).await {
            Err(_) => {
                debug_log!("  {} 连接超时", url);
                return fail(FailureReason::ConnectTimeout);
            }
            Ok(Err(e)) => {
                debug_log!("  {} 连接失败: {}", url, e);
                return fail(if e.is_timeout() {
                    FailureReason::ConnectTimeout
                } else {
                    FailureReason::ConnectFailed
                });
            }
            Ok(Ok(resp)) => resp,
        };

        if !resp.status().is_success() {
            debug_log!("  {} HTTP {}", url, resp.status());
            return fail(FailureReason::StreamNotFound(resp.status().as_u16()));
        }

        // transfer clock starts after headers
        let start = tokio::time::Instant::now();
        let deadline = start + self.limits.transfer_timeout;
        let mut bytes: u64 = 0;

        while bytes < self.limits.max_bytes {
            match tokio::time::timeout_at(deadline, resp.chunk()).await {
                Err(_) => break,
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => {
                    let room = self.limits.max_bytes - bytes;
                    bytes += (chunk.len() as u64).min(room);
                }
                Ok(Err(e)) => {
                    debug_log!("  {} 传输中断 ({} 字节): {}", url, bytes, e);
                    let mut result = fail(FailureReason::TransferError);
                    result.bytes_transferred = bytes;
                    result.elapsed_time = start.elapsed();
                    return result;
                }
            }
        }

        let elapsed = start.elapsed();
        let verdict = classify_transfer(bytes, elapsed, &self.limits);
        debug_log!(
            "  {} {} 字节 / {:.2}s = {:.3} MB/s {:?}",
            url,
            bytes,
            elapsed.as_secs_f64(),
            verdict.speed_mbps,
            verdict.failure_reason
        );

        SpeedResult {
            service_record: record.clone(),
            config_used: config.clone(),
            bytes_transferred: bytes,
            elapsed_time: elapsed,
            speed_mbps: verdict.speed_mbps,
            success: verdict.success,
            failure_reason: verdict.failure_reason,
        }
    }
}

impl SpeedProbe for ThroughputTester {
    fn measure(
        &self,
        record: &ServiceRecord,
        config: &StreamConfig,
    ) -> impl Future<Output = SpeedResult> + Send {
        self.run(record, config)
    }
}
