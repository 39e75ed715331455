//! Two-stage speed test optimizer
//!
//! Stage 1 tests every validated record once against the default config at
//! high concurrency. Stage 2 walks the fallback list for Stage-1 failures only,
//! sequentially per record and at lower concurrency, stopping at the first
//! success. A low-confidence (`InsufficientData`) result is a success too; its
//! placeholder speed keeps it under the ranking floor. Each record's progress
//! is tracked as a [`RecordState`].

use crate::catalog::StreamCatalog;
use crate::logging::{debug_log, info_log, warn_log};
use crate::models::{
    AppConfig, FailureReason, RunParams, ServiceRecord, SpeedResult, Stage, StreamConfig,
};
use crate::pool::run_bounded;
use crate::sink::{SinkRecord, SinkSender};
use crate::throughput::SpeedProbe;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    Stage1Testing,
    Stage1Success,
    Stage1Failed,
    Stage2Testing,
    Stage2Success,
    Stage2Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    StartStage1,
    Stage1Passed,
    Stage1Missed,
    StartStage2,
    Stage2Passed,
    Stage2Exhausted,
}

impl RecordState {
    /// Legal transitions only; anything else is `None`
    pub fn next(self, event: StageEvent) -> Option<RecordState> {
        use RecordState::*;
        use StageEvent::*;
        match (self, event) {
            (Pending, StartStage1) => Some(Stage1Testing),
            (Stage1Testing, Stage1Passed) => Some(Stage1Success),
            (Stage1Testing, Stage1Missed) => Some(Stage1Failed),
            (Stage1Failed, StartStage2) => Some(Stage2Testing),
            (Stage2Testing, Stage2Passed) => Some(Stage2Success),
            (Stage2Testing, Stage2Exhausted) => Some(Stage2Failed),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, RecordState::Stage1Success | RecordState::Stage2Success)
    }
}

fn advance(state: &mut RecordState, event: StageEvent) {
    match state.next(event) {
        Some(next) => *state = next,
        None => {
            warn_log!("忽略非法状态转换: {:?} + {:?}", state, event);
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    pub stage1_concurrency: usize,
    pub stage2_concurrency: usize,
    /// Per record, per stage
    pub task_timeout: Duration,
    pub fast_mode: bool,
    /// 0 = try every fallback
    pub stage2_max_attempts: usize,
}

impl OptimizerSettings {
    pub fn new(config: &AppConfig, params: &RunParams) -> Self {
        Self {
            stage1_concurrency: config.stage1_concurrency.max(1),
            stage2_concurrency: config.stage2_concurrency.max(1),
            task_timeout: config.task_timeout(),
            fast_mode: params.fast_mode,
            stage2_max_attempts: params.stage2_max_attempts,
        }
    }
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self::new(&AppConfig::default(), &RunParams::default())
    }
}

/// A record that reached a success state, with the stage that produced it
#[derive(Debug, Clone)]
pub struct FinalizedResult {
    /// Position in the validated record list (discovery order)
    pub index: usize,
    pub stage: Stage,
    pub result: SpeedResult,
}

#[derive(Debug, Clone, Default)]
pub struct OptimizerOutcome {
    /// Discovery order
    pub finalized: Vec<FinalizedResult>,
    pub states: Vec<RecordState>,
    pub stage1_successes: usize,
    pub stage2_successes: usize,
    /// Throughput tests issued during Stage 2
    pub stage2_attempts: usize,
}

pub struct TwoStageOptimizer<P: SpeedProbe> {
    probe: Arc<P>,
    settings: OptimizerSettings,
}

impl<P: SpeedProbe> TwoStageOptimizer<P> {
    pub fn new(probe: Arc<P>, settings: OptimizerSettings) -> Self {
        Self { probe, settings }
    }

    pub async fn run(
        &self,
        records: Vec<ServiceRecord>,
        catalog: &StreamCatalog,
        sink: Option<&SinkSender>,
        cancel: &CancellationToken,
    ) -> OptimizerOutcome {
        let mut outcome = OptimizerOutcome {
            states: vec![RecordState::Pending; records.len()],
            ..Default::default()
        };
        if records.is_empty() {
            return outcome;
        }

        self.stage1(&records, catalog.default_config(), sink, cancel, &mut outcome)
            .await;

        if self.settings.fast_mode {
            info_log!("快速模式：跳过第二阶段");
        } else if cancel.is_cancelled() {
            warn_log!("已取消，跳过第二阶段");
        } else {
            let configs = catalog.stage2_configs(self.settings.stage2_max_attempts);
            self.stage2(&records, configs, sink, cancel, &mut outcome)
                .await;
        }

        outcome.finalized.sort_by_key(|f| f.index);
        outcome
    }

    async fn stage1(
        &self,
        records: &[ServiceRecord],
        default: &StreamConfig,
        sink: Option<&SinkSender>,
        cancel: &CancellationToken,
        outcome: &mut OptimizerOutcome,
    ) {
        info_log!(
            "第一阶段: {} 个节点使用默认配置 {} ({})",
            records.len(),
            default.label(),
            default.stream_address
        );
        for state in outcome.states.iter_mut() {
            advance(state, StageEvent::StartStage1);
        }

        let deadline = self.settings.task_timeout;
        let slots = run_bounded(
            "stage1",
            records.to_vec(),
            self.settings.stage1_concurrency,
            cancel,
            |record| {
                let probe = self.probe.clone();
                let config = default.clone();
                let sink = sink.cloned();
                async move {
                    let measured = probe.measure(&record, &config);
                    let result = match tokio::time::timeout(deadline, measured).await {
                        Ok(result) => result,
                        Err(_) => {
                            debug_log!("  {} 第一阶段任务超时", record.address());
                            SpeedResult::failure(
                                record.clone(),
                                config.clone(),
                                FailureReason::TransferTimeout,
                            )
                        }
                    };
                    if result.success {
                        if let Some(sink) = &sink {
                            sink.send(SinkRecord::Speed {
                                stage: Stage::Stage1,
                                result: result.clone(),
                            })
                            .await;
                        }
                    }
                    result
                }
            },
        )
        .await;

        for (index, slot) in slots.into_iter().enumerate() {
            let state = &mut outcome.states[index];
            match slot {
                Some(result) if result.success => {
                    advance(state, StageEvent::Stage1Passed);
                    outcome.stage1_successes += 1;
                    if result.is_confirmed() {
                        info_log!(
                            "  ✓ {} {:.2} MB/s",
                            result.service_record.address(),
                            result.speed_mbps
                        );
                    } else {
                        info_log!("  ? {} 连接成功但数据不足", result.service_record.address());
                    }
                    outcome.finalized.push(FinalizedResult {
                        index,
                        stage: Stage::Stage1,
                        result,
                    });
                }
                Some(result) => {
                    debug_log!(
                        "  ✗ {} 第一阶段失败: {}",
                        result.service_record.address(),
                        result
                            .failure_reason
                            .map(|r| r.to_string())
                            .unwrap_or_default()
                    );
                    advance(state, StageEvent::Stage1Missed);
                }
                // cancelled runs leave the record mid-stage
                None if cancel.is_cancelled() => {}
                None => advance(state, StageEvent::Stage1Missed),
            }
        }

        info_log!(
            "第一阶段完成: {}/{} 成功",
            outcome.stage1_successes,
            records.len()
        );
    }

    async fn stage2(
        &self,
        records: &[ServiceRecord],
        configs: &[StreamConfig],
        sink: Option<&SinkSender>,
        cancel: &CancellationToken,
        outcome: &mut OptimizerOutcome,
    ) {
        let retry: Vec<usize> = outcome
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == RecordState::Stage1Failed)
            .map(|(i, _)| i)
            .collect();
        if retry.is_empty() {
            return;
        }

        info_log!(
            "第二阶段: {} 个节点，备选配置 {} 个",
            retry.len(),
            configs.len()
        );
        for &i in &retry {
            advance(&mut outcome.states[i], StageEvent::StartStage2);
        }

        let configs: Arc<Vec<StreamConfig>> = Arc::new(configs.to_vec());
        let attempts = Arc::new(AtomicUsize::new(0));
        let deadline = self.settings.task_timeout;
        let items: Vec<ServiceRecord> = retry.iter().map(|&i| records[i].clone()).collect();

        let slots = run_bounded(
            "stage2",
            items,
            self.settings.stage2_concurrency,
            cancel,
            |record| {
                let probe = self.probe.clone();
                let configs = configs.clone();
                let attempts = attempts.clone();
                let sink = sink.cloned();
                async move {
                    let walk = async {
                        for config in configs.iter() {
                            attempts.fetch_add(1, Ordering::Relaxed);
                            let result = probe.measure(&record, config).await;
                            if result.success {
                                if let Some(sink) = &sink {
                                    sink.send(SinkRecord::Speed {
                                        stage: Stage::Stage2,
                                        result: result.clone(),
                                    })
                                    .await;
                                }
                            }
                            if result.success {
                                return Some(result);
                            }
                        }
                        None
                    };
                    let found = match tokio::time::timeout(deadline, walk).await {
                        Ok(found) => found,
                        Err(_) => {
                            debug_log!(
                                "  {} 第二阶段任务超时: {}",
                                record.address(),
                                FailureReason::TransferTimeout
                            );
                            None
                        }
                    };
                    found
                }
            },
        )
        .await;

        for (slot, index) in slots.into_iter().zip(retry) {
            let state = &mut outcome.states[index];
            match slot {
                Some(Some(result)) => {
                    advance(state, StageEvent::Stage2Passed);
                    outcome.stage2_successes += 1;
                    info_log!(
                        "  ✓ {} {:.2} MB/s (备选 {})",
                        result.service_record.address(),
                        result.speed_mbps,
                        result.config_used.label()
                    );
                    outcome.finalized.push(FinalizedResult {
                        index,
                        stage: Stage::Stage2,
                        result,
                    });
                }
                Some(None) => advance(state, StageEvent::Stage2Exhausted),
                None if cancel.is_cancelled() => {}
                None => advance(state, StageEvent::Stage2Exhausted),
            }
        }

        outcome.stage2_attempts = attempts.load(Ordering::Relaxed);
        info_log!(
            "第二阶段完成: {} 成功，共测试 {} 次",
            outcome.stage2_successes,
            outcome.stage2_attempts
        );
    }
}
