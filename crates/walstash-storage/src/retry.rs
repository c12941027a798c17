use std::time::Duration;

use crate::{CancelFlag, RetryConfig, StorageError};

/// Whether an HTTP error is transient and worth retrying.
pub fn is_retryable_http(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Retry a blob call on transient errors with exponential backoff + jitter.
///
/// The closure reports failures as `StorageError`; only `Transient` values
/// are retried. The shared cancel flag is consulted before every retry so a
/// pool failure stops in-flight operations at the next attempt boundary.
pub fn retry_blob<T>(
    config: &RetryConfig,
    cancel: &CancelFlag,
    op_name: &str,
    backend_label: &str,
    mut f: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let mut delay_ms = config.retry_delay_ms;
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                tracing::warn!(
                    "{backend_label} {op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    config.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| StorageError::Fatal("retry loop exhausted".into())))
}

/// Classify a `ureq` failure into the storage error model.
///
/// 404 maps to `NotFound` so callers can distinguish end-of-archive from
/// trouble; transport errors, 429 and 5xx map to `Transient`; everything
/// else (authentication, permissions, malformed requests) is `Fatal`.
pub fn classify_http(op_name: &str, key: &str, err: ureq::Error) -> StorageError {
    match &err {
        ureq::Error::Status(404, _) => StorageError::NotFound(key.to_string()),
        _ if is_retryable_http(&err) => {
            StorageError::Transient(format!("{op_name} {key}: {err}"))
        }
        _ => StorageError::Fatal(format!("{op_name} {key}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tight_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    #[test]
    fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out = retry_blob(&tight_config(), &CancelFlag::new(), "PUT", "test", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::Transient("503".into()))
            } else {
                Ok(42)
            }
        })
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_blob(&tight_config(), &CancelFlag::new(), "PUT", "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::Fatal("denied".into()))
        })
        .unwrap_err();
        assert!(matches!(err, StorageError::Fatal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_found_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_blob(&tight_config(), &CancelFlag::new(), "GET", "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::NotFound("k".into()))
        })
        .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhaustion_surfaces_last_transient() {
        let err = retry_blob(&tight_config(), &CancelFlag::new(), "PUT", "test", || {
            Err::<(), _>(StorageError::Transient("throttled".into()))
        })
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn cancellation_stops_retries() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let err = retry_blob(&tight_config(), &cancel, "PUT", "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::Transient("503".into()))
        })
        .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
        // The first attempt runs; the retry boundary observes the flag.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retryable_io_classification() {
        for kind in [
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::UnexpectedEof,
            std::io::ErrorKind::TimedOut,
        ] {
            assert!(is_retryable_io(&std::io::Error::new(kind, "x")));
        }
        for kind in [
            std::io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::InvalidData,
        ] {
            assert!(!is_retryable_io(&std::io::Error::new(kind, "x")));
        }
    }
}
