//! Reachability prober: one raw TCP connect per candidate

use crate::logging::{debug_log, info_log};
use crate::models::{AppConfig, Candidate, ReachabilityResult};
use crate::pool::run_bounded;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Default per-attempt connect timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default cap on simultaneous sockets
pub const DEFAULT_PROBE_CONCURRENCY: usize = 32;

#[derive(Clone)]
pub struct ReachabilityProber {
    timeout: Duration,
    concurrency: usize,
    resolver: Arc<TokioAsyncResolver>,
}

impl ReachabilityProber {
    pub fn new(timeout: Duration, concurrency: usize) -> Self {
        let mut opts = ResolverOpts::default();
        opts.cache_size = 128;
        opts.attempts = 1;
        opts.timeout = timeout;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);

        Self {
            timeout,
            concurrency: concurrency.max(1),
            resolver: Arc::new(resolver),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.probe_timeout(), config.probe_concurrency)
    }

    /// Probe every candidate; output order matches input order
    pub async fn probe_all(
        &self,
        candidates: Vec<Candidate>,
        cancel: &CancellationToken,
    ) -> Vec<ReachabilityResult> {
        info_log!("端口连通性检测: {} 个候选", candidates.len());

        let slots = run_bounded("probe", candidates.clone(), self.concurrency, cancel, |c| {
            let prober = self.clone();
            async move { prober.probe(c).await }
        })
        .await;

        let results: Vec<ReachabilityResult> = slots
            .into_iter()
            .zip(candidates)
            .map(|(slot, candidate)| {
                slot.unwrap_or(ReachabilityResult {
                    candidate,
                    reachable: false,
                    latency: Duration::ZERO,
                })
            })
            .collect();

        let reachable = results.iter().filter(|r| r.reachable).count();
        info_log!("连通性检测完成: {}/{} 可达", reachable, results.len());
        results
    }

    /// Single attempt; timeout, refusal and DNS failure all mean unreachable
    pub async fn probe(&self, candidate: Candidate) -> ReachabilityResult {
        let start = Instant::now();
        let reachable = match tokio::time::timeout(self.timeout, self.connect(&candidate)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug_log!("  {} 不可达: {}", candidate, e);
                false
            }
            Err(_) => {
                debug_log!("  {} 连接超时 ({}ms)", candidate, self.timeout.as_millis());
                false
            }
        };
        let latency = start.elapsed();
        if reachable {
            debug_log!(
                "  {} 端口可达 ({:.1}ms)",
                candidate,
                latency.as_secs_f64() * 1000.0
            );
        }

        ReachabilityResult {
            candidate,
            reachable,
            latency,
        }
    }

    async fn connect(&self, candidate: &Candidate) -> Result<(), String> {
        let ip = self.resolve(&candidate.host).await?;
        let stream = TcpStream::connect(SocketAddr::new(ip, candidate.port))
            .await
            .map_err(|e| format!("TCP: {}", e))?;
        drop(stream);
        Ok(())
    }

    async fn resolve(&self, host: &str) -> Result<IpAddr, String> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| format!("DNS: {}", e))?;
        lookup
            .iter()
            .next()
            .ok_or_else(|| "DNS: 无结果".to_string())
    }
}
