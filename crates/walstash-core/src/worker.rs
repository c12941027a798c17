//! Bounded-concurrency task execution with cancel-on-first-failure.

use crossbeam_channel::unbounded;
use walstash_storage::CancelFlag;

use crate::error::{ArchiveError, Result};

/// Default degree for base backup partition uploads and downloads.
pub const BACKUP_POOL_SIZE: usize = 4;
/// Default degree for pooled WAL pushes.
pub const WAL_PUSH_POOL_SIZE: usize = 8;
/// Default number of WAL segments to prefetch.
pub const WAL_PREFETCH_COUNT: usize = 8;

/// Run tasks on up to `degree` worker threads.
///
/// Tasks start in FIFO submission order; completion order is unspecified.
/// The first failure flips the shared cancel flag — queued tasks are then
/// skipped, and in-flight blob operations observe the flag at their next
/// retry boundary — and is returned once every worker has stopped. On
/// success the results are returned in submission order.
///
/// The pool is single-use; tasks must not submit further work into it.
pub fn run_all<T, F>(degree: usize, cancel: &CancelFlag, tasks: Vec<F>) -> Result<Vec<T>>
where
    T: Send,
    F: FnOnce(&CancelFlag) -> Result<T> + Send,
{
    if tasks.is_empty() {
        return Ok(Vec::new());
    }
    let degree = degree.max(1).min(tasks.len());

    let (task_tx, task_rx) = unbounded();
    let (result_tx, result_rx) = unbounded();
    let task_count = tasks.len();

    for (index, task) in tasks.into_iter().enumerate() {
        // Unbounded channel: all sends succeed, preserving FIFO order.
        let _ = task_tx.send((index, task));
    }
    drop(task_tx);

    std::thread::scope(|scope| {
        for _ in 0..degree {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            scope.spawn(move || {
                while let Ok((index, task)) = task_rx.recv() {
                    if cancel.is_cancelled() {
                        // Leave the remaining queue undrained for the other
                        // workers to skip the same way.
                        let _ = result_tx.send((index, Err(ArchiveError::Cancelled)));
                        continue;
                    }
                    let result = task(&cancel);
                    if result.is_err() {
                        cancel.cancel();
                    }
                    let _ = result_tx.send((index, result));
                }
            });
        }
        drop(result_tx);

        let mut slots: Vec<Option<T>> = (0..task_count).map(|_| None).collect();
        let mut first_error: Option<ArchiveError> = None;
        for (index, result) in result_rx.iter() {
            match result {
                Ok(value) => slots[index] = Some(value),
                Err(ArchiveError::Cancelled) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| ArchiveError::Other("worker dropped a task".into())))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn results_keep_submission_order() {
        let cancel = CancelFlag::new();
        let tasks: Vec<_> = (0..16u64)
            .map(|i| {
                move |_: &CancelFlag| {
                    // Let later tasks finish earlier.
                    std::thread::sleep(Duration::from_millis((16 - i) % 4));
                    Ok(i)
                }
            })
            .collect();
        let out = run_all(4, &cancel, tasks).unwrap();
        assert_eq!(out, (0..16u64).collect::<Vec<_>>());
    }

    #[test]
    fn first_failure_cancels_queued_tasks() {
        let cancel = CancelFlag::new();
        let ran = AtomicUsize::new(0);
        let tasks: Vec<Box<dyn FnOnce(&CancelFlag) -> Result<()> + Send>> = (0..32)
            .map(|i| {
                let ran = &ran;
                Box::new(move |_: &CancelFlag| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    if i == 0 {
                        Err(ArchiveError::Integrity("injected".into()))
                    } else {
                        std::thread::sleep(Duration::from_millis(5));
                        Ok(())
                    }
                }) as _
            })
            .collect();

        let err = run_all(2, &cancel, tasks).unwrap_err();
        assert!(matches!(err, ArchiveError::Integrity(_)), "got {err}");
        assert!(cancel.is_cancelled());
        // With degree 2 and an immediate failure, most of the queue is
        // skipped rather than run.
        assert!(ran.load(Ordering::SeqCst) < 32);
    }

    #[test]
    fn surfaced_error_is_a_real_failure_not_cancellation() {
        let cancel = CancelFlag::new();
        let tasks: Vec<Box<dyn FnOnce(&CancelFlag) -> Result<()> + Send>> = (0..8)
            .map(|i| {
                Box::new(move |_: &CancelFlag| {
                    if i == 3 {
                        Err(ArchiveError::Precondition("boom".into()))
                    } else {
                        Ok(())
                    }
                }) as _
            })
            .collect();
        let err = run_all(8, &cancel, tasks).unwrap_err();
        assert!(matches!(err, ArchiveError::Precondition(_)));
    }

    #[test]
    fn empty_task_list_is_ok() {
        let cancel = CancelFlag::new();
        let out: Vec<()> =
            run_all(4, &cancel, Vec::<Box<dyn FnOnce(&CancelFlag) -> Result<()> + Send>>::new())
                .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn pre_cancelled_pool_runs_nothing() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let ran = AtomicUsize::new(0);
        let tasks: Vec<Box<dyn FnOnce(&CancelFlag) -> Result<()> + Send>> = (0..4)
            .map(|_| {
                let ran = &ran;
                Box::new(move |_: &CancelFlag| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }) as _
            })
            .collect();
        let err = run_all(2, &cancel, tasks).unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
