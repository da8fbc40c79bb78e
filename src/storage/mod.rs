use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub mod fs;
pub mod s3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage unreachable: {0}")]
    Unreachable(String),
    #[error("invalid bucket: {0}")]
    InvalidBucket(String),
    #[error("storage i/o error: {0}")]
    Io(String),
}

/// Thin synchronous interface over object storage. Keys are
/// slash-separated relative paths; payload-sized objects go through
/// `put_file`/`get_file` so memory stays bounded.
pub trait StorageBackend: Send + Sync {
    fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    /// Upload a local file under `key`.
    fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError>;
    /// Download the object at `key` into `dest`, returning its size.
    fn get_file(&self, key: &str, dest: &Path) -> Result<u64, StorageError>;
    /// Size of a stored object without fetching its body.
    fn size_of(&self, key: &str) -> Result<u64, StorageError>;
    fn exists(&self, key: &str) -> Result<bool, StorageError>;
    /// All keys under `prefix`, unordered.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Where a stash bucket lives, parsed from the `-b` argument.
/// `s3://name[/prefix]` and bare names select S3; `file:///path`
/// selects a local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketLocation {
    S3 { bucket: String, prefix: String },
    Fs { root: PathBuf },
}

impl BucketLocation {
    pub fn parse(uri: &str) -> Result<Self, StorageError> {
        if uri.is_empty() {
            return Err(StorageError::InvalidBucket("bucket must not be empty".into()));
        }
        match uri.split_once("://") {
            None => Ok(BucketLocation::S3 { bucket: uri.to_string(), prefix: String::new() }),
            Some(("s3", rest)) => {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(StorageError::InvalidBucket(format!("'{}' has no bucket name", uri)));
                }
                let prefix = prefix.trim_matches('/');
                let prefix = if prefix.is_empty() { String::new() } else { format!("{}/", prefix) };
                Ok(BucketLocation::S3 { bucket: bucket.to_string(), prefix })
            }
            Some(("file", rest)) => {
                let root = rest.trim_start_matches('/');
                Ok(BucketLocation::Fs { root: PathBuf::from(format!("/{}", root)) })
            }
            Some((scheme, _)) => Err(StorageError::InvalidBucket(format!(
                "unsupported storage scheme '{}'",
                scheme
            ))),
        }
    }
}

/// Open the backend for a bucket URI. Network-backed stores bound every
/// call by `timeout`.
pub fn open_backend(
    uri: &str,
    timeout: Duration,
) -> Result<Box<dyn StorageBackend>, StorageError> {
    match BucketLocation::parse(uri)? {
        BucketLocation::S3 { bucket, prefix } => {
            Ok(Box::new(s3::S3Backend::new(bucket, prefix, timeout)?))
        }
        BucketLocation::Fs { root } => Ok(Box::new(fs::FsBackend::new(root)?)),
    }
}

/// Bounded exponential backoff for transient connectivity failures.
/// Only `Unreachable` errors are retried; everything else surfaces
/// immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { attempts: 3, base_delay: Duration::from_millis(500) }
    }
}

pub fn with_backoff<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.base_delay;
    for attempt in 1..=attempts {
        match op() {
            Err(StorageError::Unreachable(_)) if attempt < attempts => {
                std::thread::sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
    unreachable!("retry loop always returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn parses_bare_name_as_s3() {
        assert_eq!(
            BucketLocation::parse("my-stash").unwrap(),
            BucketLocation::S3 { bucket: "my-stash".into(), prefix: String::new() }
        );
    }

    #[test]
    fn parses_s3_uri_with_prefix() {
        assert_eq!(
            BucketLocation::parse("s3://my-stash/team/a/").unwrap(),
            BucketLocation::S3 { bucket: "my-stash".into(), prefix: "team/a/".into() }
        );
    }

    #[test]
    fn parses_file_uri() {
        assert_eq!(
            BucketLocation::parse("file:///var/stash").unwrap(),
            BucketLocation::Fs { root: PathBuf::from("/var/stash") }
        );
    }

    #[test]
    fn rejects_unknown_scheme_and_empty() {
        assert!(matches!(BucketLocation::parse("gs://x"), Err(StorageError::InvalidBucket(_))));
        assert!(matches!(BucketLocation::parse(""), Err(StorageError::InvalidBucket(_))));
        assert!(matches!(BucketLocation::parse("s3://"), Err(StorageError::InvalidBucket(_))));
    }

    #[test]
    fn backoff_retries_unreachable_until_ceiling() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { attempts: 3, base_delay: Duration::from_millis(1) };
        let result: Result<(), _> = with_backoff(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Unreachable("down".into()))
        });
        assert!(matches!(result, Err(StorageError::Unreachable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_does_not_retry_not_found() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { attempts: 5, base_delay: Duration::from_millis(1) };
        let result: Result<(), _> = with_backoff(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::NotFound("k".into()))
        });
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_returns_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { attempts: 4, base_delay: Duration::from_millis(1) };
        let result = with_backoff(&policy, || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::Unreachable("blip".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
