use std::future::Future;
use std::sync::Arc;

use tokio::select;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::weights::*;

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Runs the tasks with at most `max_concurrency` of them in flight.
///
/// Each task owns its permit, so the permit comes back when the task ends,
/// whether it succeeds, fails or panics. The results are in completion order.
/// Cancelling the token stops waiting for permits and aborts the tasks still
/// running.
pub async fn run_bounded<T, F>(
    tasks: Vec<F>,
    max_concurrency: usize,
    token: &CancellationToken,
) -> WeightsResult<Vec<WeightsResult<T>>>
where
    T: Send + 'static,
    F: Future<Output = WeightsResult<T>> + Send + 'static,
{
    let num_tasks = tasks.len();
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut set: JoinSet<WeightsResult<T>> = JoinSet::new();

    for task in tasks {
        let permit = select! {
            p = semaphore.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(e) => whatever!("run_bounded: semaphore closed: {}", e),
            },
            _ = token.cancelled() => {
                warn!("run_bounded: cancelled while waiting for a permit");
                set.abort_all();
                return Err(WeightsError::Weighting { source: WeightingErrors::Cancelled });
            }
        };
        set.spawn(async move {
            let _permit = permit;
            task.await
        });
    }
    debug!("run_bounded: {} tasks spawned", num_tasks);

    let mut res: Vec<WeightsResult<T>> = Vec::with_capacity(num_tasks);
    loop {
        select! {
            joined = set.join_next() => match joined {
                None => break,
                Some(Ok(r)) => res.push(r),
                Some(Err(e)) => {
                    warn!("run_bounded: task failed: {}", e);
                    res.push(Err(WeightsError::Whatever {
                        message: format!("Task failed: {}", e),
                        source: None,
                    }));
                }
            },
            _ = token.cancelled() => {
                warn!("run_bounded: cancelled with {} tasks running", set.len());
                set.abort_all();
                return Err(WeightsError::Weighting { source: WeightingErrors::Cancelled });
            }
        }
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        let res = timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) < expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(res.is_ok(), "only {} tasks started", counter.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn eleventh_task_waits_for_a_failed_one() {
        let started = Arc::new(AtomicUsize::new(0));
        let fail_gate = Arc::new(Semaphore::new(0));
        let release_gate = Arc::new(Semaphore::new(0));

        let tasks: Vec<_> = (0..11_usize)
            .map(|idx| {
                let started = started.clone();
                let fail_gate = fail_gate.clone();
                let release_gate = release_gate.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if idx == 0 {
                        let _p = fail_gate.acquire().await;
                        return Err(WeightsError::UnsupportedConfiguration {
                            message: "failed".to_string(),
                        });
                    }
                    if idx < 10 {
                        let _p = release_gate.acquire().await;
                    }
                    Ok(idx)
                }
            })
            .collect();

        let token = CancellationToken::new();
        let handle = tokio::spawn(async move { run_bounded(tasks, 10, &token).await });

        wait_for(&started, 10).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 10);

        fail_gate.add_permits(1);
        wait_for(&started, 11).await;

        release_gate.add_permits(9);
        let res = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(res.len(), 11);
        assert_eq!(res.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn cancelled_fanout() {
        let token = CancellationToken::new();
        let tasks: Vec<_> = (0..3_usize)
            .map(|idx| async move {
                sleep(Duration::from_secs(60)).await;
                Ok::<usize, WeightsError>(idx)
            })
            .collect();
        let t2 = token.clone();
        let handle = tokio::spawn(async move { run_bounded(tasks, 1, &t2).await });
        sleep(Duration::from_millis(20)).await;
        token.cancel();
        let res = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(matches!(
            res,
            Err(WeightsError::Weighting {
                source: WeightingErrors::Cancelled
            })
        ));
    }
}
