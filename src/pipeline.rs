//! Pipeline driver
//!
//! normalize → probe → validate → (probe-only stop) → two-stage speed test → rank

use crate::aggregator::{rank, RunResult};
use crate::catalog::{CatalogError, StreamCatalog};
use crate::logging::{info_log, warn_log};
use crate::models::{AppConfig, RunParams, RunSummary, ServiceRecord};
use crate::normalizer::{normalize, read_candidate_file, DedupPolicy, RawCandidate};
use crate::optimizer::{OptimizerSettings, TwoStageOptimizer};
use crate::prober::ReachabilityProber;
use crate::sink::{SinkError, SinkRecord, SinkSender};
use crate::throughput::{SpeedProbe, ThroughputTester};
use crate::validator::ServiceValidator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Only startup problems are fatal; per-candidate failures end up in the summary
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("failed to read candidate file {}: {source}", path.display())]
    CandidateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("catalog default {found} does not match {operator}/{region}")]
    CatalogMismatch {
        region: String,
        operator: String,
        found: String,
    },
}

/// Read one inventory file; the file stem is used as source tag when `tag` is empty
pub fn load_candidate_file(path: &Path, tag: &str) -> Result<Vec<RawCandidate>, PipelineError> {
    let tag = if tag.is_empty() {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        tag.to_string()
    };
    let raw = read_candidate_file(path, &tag).map_err(|source| PipelineError::CandidateFile {
        path: path.to_path_buf(),
        source,
    })?;
    info_log!("读取候选文件 {}: {} 个条目", path.display(), raw.len());
    Ok(raw)
}

pub struct Pipeline<P: SpeedProbe> {
    config: AppConfig,
    prober: ReachabilityProber,
    validator: ServiceValidator,
    probe: Arc<P>,
}

impl Pipeline<ThroughputTester> {
    pub fn from_config(config: AppConfig) -> Result<Self, PipelineError> {
        let config = config.sanitized();
        let tester = ThroughputTester::from_config(&config)?;
        Self::with_probe(config, Arc::new(tester))
    }
}

impl<P: SpeedProbe> Pipeline<P> {
    pub fn with_probe(config: AppConfig, probe: Arc<P>) -> Result<Self, PipelineError> {
        let config = config.sanitized();
        Ok(Self {
            prober: ReachabilityProber::from_config(&config),
            validator: ServiceValidator::from_config(&config)?,
            probe,
            config,
        })
    }

    pub async fn run(
        &self,
        raw: Vec<RawCandidate>,
        catalog: &StreamCatalog,
        params: &RunParams,
        sink: Option<&SinkSender>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, PipelineError> {
        let default = catalog.default_config();
        if !default.matches(&params.region, &params.operator) {
            return Err(PipelineError::CatalogMismatch {
                region: params.region.clone(),
                operator: params.operator.clone(),
                found: default.label(),
            });
        }

        let mut summary = RunSummary {
            candidates_in: raw.len(),
            ..Default::default()
        };

        let policy = DedupPolicy {
            collapse_subnets: self.config.collapse_subnets,
        };
        let normalized = normalize(raw, policy);
        summary.rejected_tokens = normalized.rejected.len();
        summary.candidates = normalized.candidates.len();
        info_log!(
            "候选去重: 输入 {}，有效 {}，无效 {}，同网段合并 {}",
            summary.candidates_in,
            summary.candidates,
            summary.rejected_tokens,
            normalized.collapsed
        );

        let reachable: Vec<_> = self
            .prober
            .probe_all(normalized.candidates, cancel)
            .await
            .into_iter()
            .filter(|r| r.reachable)
            .map(|r| r.candidate)
            .collect();
        summary.reachable = reachable.len();

        let services: Vec<ServiceRecord> = self
            .validator
            .validate_all(reachable, cancel)
            .await
            .into_iter()
            .filter(|r| r.is_target_service)
            .collect();
        summary.validated = services.len();

        if let Some(sink) = sink {
            for record in &services {
                if !sink
                    .send(SinkRecord::Service {
                        record: record.clone(),
                    })
                    .await
                {
                    warn_log!("结果写入通道已关闭");
                    break;
                }
            }
        }

        if params.probe_only || services.is_empty() || cancel.is_cancelled() {
            if params.probe_only {
                info_log!("仅探测模式：跳过测速");
            }
            let result = RunResult {
                entries: Vec::new(),
                services,
                summary,
            };
            log_summary(&result.summary);
            return Ok(result);
        }

        let optimizer = TwoStageOptimizer::new(
            self.probe.clone(),
            OptimizerSettings::new(&self.config, params),
        );
        let outcome = optimizer
            .run(services.clone(), catalog, sink, cancel)
            .await;
        summary.stage1_successes = outcome.stage1_successes;
        summary.stage2_successes = outcome.stage2_successes;
        summary.stage2_attempts = outcome.stage2_attempts;

        let entries = rank(&outcome.finalized, self.config.speed_floor_mbps);
        summary.final_count = entries.len();

        let result = RunResult {
            entries,
            services,
            summary,
        };
        log_summary(&result.summary);
        Ok(result)
    }
}

fn log_summary(summary: &RunSummary) {
    info_log!(
        "汇总: 输入 {} → 候选 {} → 可达 {} → udpxy {} → 第一阶段 {} + 第二阶段 {} ({} 次) → 最终 {}",
        summary.candidates_in,
        summary.candidates,
        summary.reachable,
        summary.validated,
        summary.stage1_successes,
        summary.stage2_successes,
        summary.stage2_attempts,
        summary.final_count
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StreamConfig;
    use tempfile::TempDir;

    #[test]
    fn test_load_candidate_file_tags_with_file_stem() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quake.txt");
        std::fs::write(&path, "1.2.3.4:4022\n# comment\n5.6.7.8_8888, 9.9.9.9:81\n").unwrap();

        let raw = load_candidate_file(&path, "").unwrap();
        assert_eq!(raw.len(), 3);
        assert!(raw.iter().all(|r| r.source == "quake"));

        let raw = load_candidate_file(&path, "fofa").unwrap();
        assert!(raw.iter().all(|r| r.source == "fofa"));
    }

    #[tokio::test]
    async fn test_run_rejects_catalog_for_another_region() {
        let catalog = StreamCatalog::new(
            vec![StreamConfig::new("Telecom", "Beijing", "udp/239.3.1.1:8000")],
            "Beijing",
            "Telecom",
        )
        .unwrap();
        let params = RunParams {
            region: "Shanghai".into(),
            operator: "Telecom".into(),
            ..Default::default()
        };
        let pipeline = Pipeline::from_config(AppConfig::default()).unwrap();

        let err = pipeline
            .run(
                vec![RawCandidate::new("127.0.0.1:1", "t")],
                &catalog,
                &params,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::CatalogMismatch { .. }));
        assert_eq!(
            err.to_string(),
            "catalog default Telecom/Beijing does not match Telecom/Shanghai"
        );
    }

    #[test]
    fn test_missing_candidate_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = load_candidate_file(&dir.path().join("nope.txt"), "x").unwrap_err();
        assert!(matches!(err, PipelineError::CandidateFile { .. }));
    }
}
