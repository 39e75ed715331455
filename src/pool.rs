//! Bounded worker pool used by every phase
//!
//! A `Semaphore` caps in-flight tasks, a `JoinSet` owns them. Results are put
//! back into input order so callers never depend on completion order.

use crate::logging::{debug_log, error_log, warn_log};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Run `task` over `items` with at most `limit` tasks in flight.
///
/// Slot `i` holds the output for `items[i]`, or `None` when the task panicked
/// or the run was cancelled before it finished.
pub async fn run_bounded<T, R, F, Fut>(
    phase: &str,
    items: Vec<T>,
    limit: usize,
    cancel: &CancellationToken,
    task: F,
) -> Vec<Option<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = items.len();
    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    if total == 0 {
        return slots;
    }

    let limit = limit.clamp(1, total);
    debug_log!("[{}] {} 个任务，最大并发 {}", phase, total, limit);
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut join_set = JoinSet::new();

    for (idx, item) in items.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn_log!("[{}] 已取消，停止添加新任务", phase);
                break;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    error_log!("[{}] 信号量关闭，停止调度", phase);
                    break;
                }
            }
        };

        let fut = task(item);
        join_set.spawn(async move {
            let _permit = permit;
            (idx, fut.await)
        });
    }

    let mut panic_count = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn_log!("[{}] 已取消，中止剩余 {} 个任务", phase, join_set.len());
                join_set.abort_all();
                break;
            }
            next = join_set.join_next() => match next {
                Some(Ok((idx, result))) => slots[idx] = Some(result),
                Some(Err(e)) => {
                    if e.is_panic() {
                        panic_count += 1;
                        error_log!("[{}] 任务 panic: {:?}", phase, e);
                    }
                }
                None => break,
            }
        }
    }

    if panic_count > 0 {
        warn_log!("[{}] {} 个任务异常退出", phase, panic_count);
    }

    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let cancel = CancellationToken::new();
        // later items finish first
        let items: Vec<u64> = vec![40, 30, 20, 10, 0];
        let out = run_bounded("test", items, 5, &cancel, |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ms * 2
        })
        .await;

        assert_eq!(out, vec![Some(80), Some(60), Some(40), Some(20), Some(0)]);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let out = run_bounded("test", (0..20).collect::<Vec<u32>>(), 3, &cancel, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(out.len(), 20);
        assert!(out.iter().all(Option::is_some));
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_input_returns_immediately() {
        let cancel = CancellationToken::new();
        let out: Vec<Option<u32>> =
            run_bounded("test", Vec::<u32>::new(), 4, &cancel, |x| async move { x }).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_task_leaves_empty_slot() {
        let cancel = CancellationToken::new();
        let out = run_bounded("test", vec![1u32, 2, 3], 2, &cancel, |x| async move {
            if x == 2 {
                panic!("boom");
            }
            x
        })
        .await;

        assert_eq!(out, vec![Some(1), None, Some(3)]);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_scheduling() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Arc::new(AtomicUsize::new(0));

        let out = run_bounded("test", vec![1u32, 2, 3], 1, &cancel, |x| {
            started.fetch_add(1, Ordering::SeqCst);
            async move { x }
        })
        .await;

        assert!(out.iter().all(Option::is_none));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }
}
