//! udpxyFAST - udpxy 组播转发节点探测与测速
//!
//! 候选地址去重 → 端口探测 → 服务识别 → 两阶段测速 → 排序输出

pub mod logging;

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod models;
pub mod normalizer;
pub mod optimizer;
pub mod pipeline;
mod pool;
pub mod prober;
pub mod sink;
pub mod throughput;
pub mod validator;

pub use aggregator::{RankedEntry, RunResult};
pub use catalog::StreamCatalog;
pub use config::ConfigManager;
pub use models::{
    AppConfig, Candidate, FailureReason, RunParams, RunSummary, ServiceRecord, SpeedResult, Stage,
    StreamConfig,
};
pub use normalizer::RawCandidate;
pub use pipeline::{load_candidate_file, Pipeline, PipelineError};
pub use sink::ResultSink;
pub use throughput::{SpeedProbe, ThroughputTester};
