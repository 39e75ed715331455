//! Incremental result sink
//!
//! Workers never touch the output file. They send [`SinkRecord`]s over a
//! channel and one blocking writer task appends them as JSON lines, flushing
//! after each record so an interrupted run still leaves usable output.

use crate::logging::{debug_log, error_log, info_log};
use crate::models::{ServiceRecord, SpeedResult, Stage};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("output file {} is locked by another run", .0.display())]
    Locked(PathBuf),
    #[error("sink writer task failed: {0}")]
    Join(String),
}

/// One appended line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkRecord {
    Service { record: ServiceRecord },
    Speed { stage: Stage, result: SpeedResult },
}

/// Cloneable producer side, handed to workers
#[derive(Clone)]
pub struct SinkSender {
    tx: mpsc::Sender<SinkRecord>,
}

impl SinkSender {
    /// Returns false once the writer has gone away
    pub async fn send(&self, record: SinkRecord) -> bool {
        self.tx.send(record).await.is_ok()
    }
}

pub struct SinkHandle {
    tx: mpsc::Sender<SinkRecord>,
    join: JoinHandle<Result<u64, SinkError>>,
}

impl SinkHandle {
    pub fn sender(&self) -> SinkSender {
        SinkSender {
            tx: self.tx.clone(),
        }
    }

    /// Close the channel, wait for pending lines, return how many were written
    pub async fn finish(self) -> Result<u64, SinkError> {
        drop(self.tx);
        self.join
            .await
            .map_err(|e| SinkError::Join(e.to_string()))?
    }
}

pub struct ResultSink;

impl ResultSink {
    /// Spawn the single writer over any `Write`
    pub fn spawn<W>(writer: W) -> SinkHandle
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let join = tokio::task::spawn_blocking(move || write_loop(writer, rx));
        SinkHandle { tx, join }
    }

    /// Append to `path`, holding an exclusive lock for the whole run
    pub fn open(path: &Path) -> Result<SinkHandle, SinkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(SinkError::Locked(path.to_path_buf()));
        }

        info_log!("结果实时写入: {}", path.display());
        // lock is released when the writer drops the file
        Ok(Self::spawn(file))
    }
}

fn write_loop<W: Write>(
    mut writer: W,
    mut rx: mpsc::Receiver<SinkRecord>,
) -> Result<u64, SinkError> {
    let mut written = 0u64;
    while let Some(record) = rx.blocking_recv() {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error_log!("结果序列化失败: {}", e);
                continue;
            }
        };
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        written += 1;
    }
    debug_log!("结果写入完成: {} 行", written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Candidate, FailureReason, StreamConfig};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn speed_record(port: u16) -> SinkRecord {
        let record = ServiceRecord::matched(Candidate::new("10.0.0.1", port), 1, String::new());
        let mut result = SpeedResult::failure(
            record,
            StreamConfig::new("Telecom", "Shanghai", "udp/239.45.3.146:5140"),
            FailureReason::TransferError,
        );
        result.success = true;
        result.failure_reason = None;
        result.speed_mbps = 1.5;
        SinkRecord::Speed {
            stage: Stage::Stage1,
            result,
        }
    }

    #[tokio::test]
    async fn test_concurrent_senders_produce_whole_lines() {
        let buf = SharedBuf::default();
        let handle = ResultSink::spawn(buf.clone());

        let mut tasks = Vec::new();
        for i in 0..20u16 {
            let sender = handle.sender();
            tasks.push(tokio::spawn(async move {
                assert!(sender.send(speed_record(4000 + i)).await);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(handle.finish().await.unwrap(), 20);

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 20);
        for line in lines {
            let parsed: SinkRecord = serde_json::from_str(line).unwrap();
            assert!(matches!(parsed, SinkRecord::Speed { stage: Stage::Stage1, .. }));
        }
    }

    #[tokio::test]
    async fn test_file_sink_appends_across_runs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("results.jsonl");

        let handle = ResultSink::open(&path).unwrap();
        let record = ServiceRecord::matched(Candidate::new("10.0.0.2", 4022), 0, String::new());
        assert!(handle.sender().send(SinkRecord::Service { record }).await);
        assert_eq!(handle.finish().await.unwrap(), 1);

        let handle = ResultSink::open(&path).unwrap();
        assert!(handle.sender().send(speed_record(81)).await);
        assert_eq!(handle.finish().await.unwrap(), 1);

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""type":"service""#));
        assert!(lines[1].contains(r#""type":"speed""#));
        assert!(lines[1].contains(r#""stage":"stage1""#));
    }

    #[tokio::test]
    async fn test_second_open_while_locked_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.jsonl");

        let first = ResultSink::open(&path).unwrap();
        let second = ResultSink::open(&path);
        assert!(matches!(second, Err(SinkError::Locked(_))));

        first.finish().await.unwrap();
    }
}
