//! udpxyFAST command line

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use udpxyfast_lib::{
    info_log, load_candidate_file, warn_log, ConfigManager, Pipeline, ResultSink, RunParams,
    RunResult, StreamCatalog,
};

/// Find, verify and speed-test udpxy relays
#[derive(Parser, Debug)]
#[command(name = "udpxyfast")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Target region, e.g. Shanghai
    #[arg(value_name = "REGION")]
    region: String,

    /// Target operator: Telecom, Unicom or Mobile
    #[arg(value_name = "OPERATOR")]
    operator: String,

    /// Candidate files (host:port per line, `#` comments)
    #[arg(short = 'c', long = "candidates", value_name = "FILE", required = true, num_args = 1..)]
    candidates: Vec<PathBuf>,

    /// Directory holding {Operator}_province_list.txt files
    #[arg(long = "catalog", value_name = "DIR", default_value = ".")]
    catalog: PathBuf,

    /// Skip the fallback (Stage 2) pass
    #[arg(long = "fast")]
    fast: bool,

    /// Only probe and identify relays, no speed test
    #[arg(long = "probe-only")]
    probe_only: bool,

    /// Max fallback configs tried per relay in Stage 2 (0 = all)
    #[arg(long = "max-stage2", value_name = "N", default_value_t = 0)]
    max_stage2: usize,

    /// Keep only the first candidate per /24 and port
    #[arg(long = "collapse-subnets")]
    collapse_subnets: bool,

    /// Append results as JSON lines while the run progresses
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,

    /// Config file (defaults to the platform config dir)
    #[arg(long = "config", value_name = "FILE", env = "UDPXYFAST_CONFIG")]
    config: Option<PathBuf>,

    /// Print the final result as JSON on stdout
    #[arg(long = "json")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    };
    let mut config = manager.load()?;
    if cli.collapse_subnets {
        config.collapse_subnets = true;
    }
    info_log!("配置文件: {}", manager.path().display());

    let mut raw = Vec::new();
    for path in &cli.candidates {
        raw.extend(load_candidate_file(path, "")?);
    }
    let catalog = StreamCatalog::load_dir(&cli.catalog, &cli.region, &cli.operator)?;

    let params = RunParams {
        region: cli.region.clone(),
        operator: cli.operator.clone(),
        fast_mode: cli.fast,
        probe_only: cli.probe_only,
        stage2_max_attempts: cli.max_stage2,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn_log!("收到 Ctrl-C，正在停止...");
            on_signal.cancel();
        }
    });

    let sink = match &cli.output {
        Some(path) => Some(ResultSink::open(path)?),
        None => None,
    };
    let sender = sink.as_ref().map(|s| s.sender());

    let pipeline = Pipeline::from_config(config)?;
    let result = pipeline
        .run(raw, &catalog, &params, sender.as_ref(), &cancel)
        .await?;

    drop(sender);
    if let Some(sink) = sink {
        let lines = sink.finish().await?;
        info_log!("已写入 {} 条记录", lines);
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result, cli.probe_only);
    }

    Ok(())
}

fn print_result(result: &RunResult, probe_only: bool) {
    if probe_only {
        for record in &result.services {
            println!(
                "{:<22} 活跃 {:<4} {}",
                record.address(),
                record.active_connections,
                record.bound_address
            );
        }
    } else {
        for entry in &result.entries {
            println!(
                "{:>8.2} MB/s  {:<22} {}/{}",
                entry.result.speed_mbps,
                entry.result.service_record.address(),
                entry.provenance.operator,
                entry.provenance.region
            );
        }
    }

    let s = &result.summary;
    println!();
    println!(
        "输入 {} | 无效 {} | 候选 {} | 可达 {} | udpxy {} | 第一阶段 {} | 第二阶段 {} | 最终 {}",
        s.candidates_in,
        s.rejected_tokens,
        s.candidates,
        s.reachable,
        s.validated,
        s.stage1_successes,
        s.stage2_successes,
        s.final_count
    );
}
