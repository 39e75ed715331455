//! End-to-end runs against local fake relays

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use udpxyfast_lib::{
    AppConfig, FailureReason, Pipeline, RawCandidate, ResultSink, RunParams, ServiceRecord,
    SpeedProbe, SpeedResult, StreamCatalog, StreamConfig,
};

const UDPXY_STATUS: &str = "<html><head><title>udpxy status</title></head><body>\
<table cellspacing=0><tr><td>1234</td><td>eth0</td><td>10.10.0.1</td><td>1</td></tr></table>\
</body></html>";

const NGINX_PAGE: &str = "<html><head><title>Welcome to nginx!</title></head></html>";

async fn serve(server: &'static str, body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nServer: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    server,
                    body.len(),
                    body
                );
                let _ = socket.write_all(resp.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Fixed speed per port on the default stream; every other call fails
#[derive(Default)]
struct FakeProbe {
    speeds: HashMap<u16, f64>,
    default_stream: String,
    stage1_calls: AtomicUsize,
    fallback_calls: AtomicUsize,
}

impl SpeedProbe for FakeProbe {
    fn measure(
        &self,
        record: &ServiceRecord,
        config: &StreamConfig,
    ) -> impl Future<Output = SpeedResult> + Send {
        let is_default = config.stream_address == self.default_stream;
        if is_default {
            self.stage1_calls.fetch_add(1, Ordering::SeqCst);
        } else {
            self.fallback_calls.fetch_add(1, Ordering::SeqCst);
        }
        let speed = self
            .speeds
            .get(&record.candidate.port)
            .copied()
            .filter(|_| is_default);
        let (record, config) = (record.clone(), config.clone());

        async move {
            match speed {
                Some(speed) => SpeedResult {
                    service_record: record,
                    config_used: config,
                    bytes_transferred: (speed * 1024.0 * 1024.0) as u64,
                    elapsed_time: Duration::from_secs(1),
                    speed_mbps: speed,
                    success: true,
                    failure_reason: None,
                },
                None => SpeedResult::failure(record, config, FailureReason::StreamNotFound(404)),
            }
        }
    }
}

fn catalog() -> StreamCatalog {
    StreamCatalog::new(
        vec![
            StreamConfig::new("Telecom", "Shanghai", "udp/239.45.3.146:5140"),
            StreamConfig::new("Unicom", "Shanghai", "rtp/239.3.1.241:8000"),
            StreamConfig::new("Telecom", "Beijing", "udp/239.3.1.1:8000"),
        ],
        "Shanghai",
        "Telecom",
    )
    .unwrap()
}

fn config() -> AppConfig {
    AppConfig {
        probe_timeout_ms: 1_000,
        validate_timeout_ms: 2_000,
        ..Default::default()
    }
}

fn params() -> RunParams {
    RunParams {
        region: "Shanghai".into(),
        operator: "Telecom".into(),
        ..Default::default()
    }
}

fn raw(ports: &[u16]) -> Vec<RawCandidate> {
    ports
        .iter()
        .map(|p| RawCandidate::new(format!("127.0.0.1:{}", p), "test"))
        .collect()
}

#[tokio::test]
async fn test_ten_candidates_two_relays() {
    let mut ports = Vec::new();
    for _ in 0..3 {
        ports.push(closed_port().await);
    }
    for _ in 0..5 {
        ports.push(serve("nginx/1.24.0", NGINX_PAGE).await);
    }
    let slow = serve("udpxy 1.0-23-12 prod", UDPXY_STATUS).await;
    let fast = serve("udpxy 1.0-23-12 prod", UDPXY_STATUS).await;
    // slower relay is discovered first
    ports.push(slow);
    ports.push(fast);

    let probe = Arc::new(FakeProbe {
        speeds: HashMap::from([(slow, 0.8), (fast, 1.0)]),
        default_stream: "udp/239.45.3.146:5140".into(),
        ..Default::default()
    });
    let pipeline = Pipeline::with_probe(config(), probe.clone()).unwrap();

    let result = pipeline
        .run(raw(&ports), &catalog(), &params(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.summary.candidates_in, 10);
    assert_eq!(result.summary.candidates, 10);
    assert_eq!(result.summary.reachable, 7);
    assert_eq!(result.summary.validated, 2);
    assert_eq!(result.summary.stage1_successes, 2);
    assert_eq!(result.summary.stage2_successes, 0);
    assert_eq!(result.summary.final_count, 2);

    assert_eq!(result.speeds(), vec![1.0, 0.8]);
    assert_eq!(result.entries[0].result.service_record.candidate.port, fast);
    assert_eq!(result.entries[1].result.service_record.candidate.port, slow);
    assert!(result.entries.iter().all(|e| e.provenance.is_default));
    assert_eq!(result.services[0].bound_address, "10.10.0.1");

    assert_eq!(probe.stage1_calls.load(Ordering::SeqCst), 2);
    assert_eq!(probe.fallback_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fast_mode_drops_stage1_failures() {
    let relay = serve("udpxy 1.0-23-12 prod", UDPXY_STATUS).await;
    let probe = Arc::new(FakeProbe {
        default_stream: "udp/239.45.3.146:5140".into(),
        ..Default::default()
    });
    let pipeline = Pipeline::with_probe(config(), probe.clone()).unwrap();
    let params = RunParams {
        fast_mode: true,
        ..params()
    };

    let result = pipeline
        .run(raw(&[relay]), &catalog(), &params, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.summary.validated, 1);
    assert!(result.entries.is_empty());
    assert_eq!(probe.stage1_calls.load(Ordering::SeqCst), 1);
    assert_eq!(probe.fallback_calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.summary.stage2_attempts, 0);
}

#[tokio::test]
async fn test_stage2_walks_fallbacks_without_fast_mode() {
    let relay = serve("udpxy 1.0-23-12 prod", UDPXY_STATUS).await;
    let probe = Arc::new(FakeProbe {
        default_stream: "udp/239.45.3.146:5140".into(),
        ..Default::default()
    });
    let pipeline = Pipeline::with_probe(config(), probe.clone()).unwrap();

    let result = pipeline
        .run(raw(&[relay]), &catalog(), &params(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.entries.is_empty());
    assert_eq!(probe.fallback_calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.summary.stage2_attempts, 2);
}

#[tokio::test]
async fn test_probe_only_skips_speed_tests_and_streams_services() {
    let relay = serve("udpxy 1.0-23-12 prod", UDPXY_STATUS).await;
    let other = serve("nginx", NGINX_PAGE).await;
    let probe = Arc::new(FakeProbe::default());
    let pipeline = Pipeline::with_probe(config(), probe.clone()).unwrap();
    let params = RunParams {
        probe_only: true,
        ..params()
    };

    let dir = tempfile::TempDir::new().unwrap();
    let out = dir.path().join("results.jsonl");
    let sink = ResultSink::open(&out).unwrap();
    let sender = sink.sender();

    let result = pipeline
        .run(
            raw(&[relay, other, relay]),
            &catalog(),
            &params,
            Some(&sender),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    drop(sender);
    assert_eq!(sink.finish().await.unwrap(), 1);

    assert_eq!(result.summary.candidates_in, 3);
    assert_eq!(result.summary.candidates, 2);
    assert_eq!(result.services.len(), 1);
    assert!(result.entries.is_empty());
    assert_eq!(probe.stage1_calls.load(Ordering::SeqCst), 0);

    let text = std::fs::read_to_string(&out).unwrap();
    assert!(text.contains(r#""type":"service""#));
    assert!(text.contains(&format!(r#""port":{}"#, relay)));
}

#[tokio::test]
async fn test_rejected_tokens_are_counted_not_fatal() {
    let pipeline = Pipeline::with_probe(config(), Arc::new(FakeProbe::default())).unwrap();
    let raw = vec![
        RawCandidate::new("not-an-address", "test"),
        RawCandidate::new("1.2.3.4:99999", "test"),
    ];

    let result = pipeline
        .run(raw, &catalog(), &params(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.summary.rejected_tokens, 2);
    assert_eq!(result.summary.candidates, 0);
    assert!(result.entries.is_empty());
}
