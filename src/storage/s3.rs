use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;

use super::{StorageBackend, StorageError};

/// S3 backend exposing a synchronous surface over the async AWS SDK.
/// The backend owns a private tokio runtime and wraps every request in
/// a timeout; the rest of the program stays blocking.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
    timeout: Duration,
    runtime: Option<Arc<Runtime>>,
}

impl Drop for S3Backend {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = std::thread::spawn(move || drop(runtime));
        }
    }
}

impl S3Backend {
    pub fn new(bucket: String, prefix: String, timeout: Duration) -> Result<Self, StorageError> {
        if bucket.trim().is_empty() {
            return Err(StorageError::InvalidBucket("bucket must be set".into()));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let shared_config =
            runtime.block_on(aws_config::defaults(BehaviorVersion::latest()).load());
        let client = Client::new(&shared_config);
        Ok(S3Backend { client, bucket, prefix, timeout, runtime: Some(Arc::new(runtime)) })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn block_on<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| StorageError::Io("storage backend closed".into()))?;
        runtime.block_on(async {
            tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
                StorageError::Unreachable(format!(
                    "s3 request timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
        })
    }
}

fn map_get_err(key: &str, err: SdkError<aws_sdk_s3::operation::get_object::GetObjectError>) -> StorageError {
    match &err {
        SdkError::ServiceError(ctx) if ctx.err().is_no_such_key() => {
            StorageError::NotFound(key.to_string())
        }
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            StorageError::Unreachable(err.to_string())
        }
        _ => StorageError::Io(err.to_string()),
    }
}

fn map_head_err(key: &str, err: SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>) -> StorageError {
    match &err {
        SdkError::ServiceError(ctx) if ctx.err().is_not_found() => {
            StorageError::NotFound(key.to_string())
        }
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            StorageError::Unreachable(err.to_string())
        }
        _ => StorageError::Io(err.to_string()),
    }
}

fn map_other_err<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            StorageError::Unreachable(err.to_string())
        }
        _ => StorageError::Io(err.to_string()),
    }
}

impl StorageBackend for S3Backend {
    fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.full_key(key);
        let body = ByteStream::from(bytes.to_vec());
        self.block_on(async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&full)
                .body(body)
                .send()
                .await
                .map_err(map_other_err)?;
            Ok(())
        })
    }

    fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.full_key(key);
        self.block_on(async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&full)
                .send()
                .await
                .map_err(|e| map_get_err(key, e))?;
            let data = output
                .body
                .collect()
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
            Ok(data.into_bytes().to_vec())
        })
    }

    fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let full = self.full_key(key);
        self.block_on(async {
            let body = ByteStream::from_path(path)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&full)
                .body(body)
                .send()
                .await
                .map_err(map_other_err)?;
            Ok(())
        })
    }

    fn get_file(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let full = self.full_key(key);
        self.block_on(async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&full)
                .send()
                .await
                .map_err(|e| map_get_err(key, e))?;
            let mut body = output.body.into_async_read();
            let mut file = tokio::fs::File::create(dest)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
            let n = tokio::io::copy(&mut body, &mut file)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
            file.flush().await.map_err(|e| StorageError::Io(e.to_string()))?;
            Ok(n)
        })
    }

    fn size_of(&self, key: &str) -> Result<u64, StorageError> {
        let full = self.full_key(key);
        self.block_on(async {
            let output = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&full)
                .send()
                .await
                .map_err(|e| map_head_err(key, e))?;
            let len = output
                .content_length()
                .ok_or_else(|| StorageError::Io(format!("no content length for '{}'", key)))?;
            u64::try_from(len).map_err(|_| StorageError::Io(format!("negative size for '{}'", key)))
        })
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.size_of(key) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let full_prefix = self.full_key(prefix);
        let strip = self.prefix.clone();
        self.block_on(async {
            let mut keys = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let output = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&full_prefix)
                    .set_continuation_token(token.take())
                    .send()
                    .await
                    .map_err(map_other_err)?;
                for object in output.contents() {
                    if let Some(key) = object.key() {
                        if let Some(rel) = key.strip_prefix(strip.as_str()) {
                            keys.push(rel.to_string());
                        }
                    }
                }
                match output.next_continuation_token() {
                    Some(next) => token = Some(next.to_string()),
                    None => break,
                }
            }
            Ok(keys)
        })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let full = self.full_key(key);
        self.block_on(async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&full)
                .send()
                .await
                .map_err(map_other_err)?;
            Ok(())
        })
    }
}
