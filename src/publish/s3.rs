use anyhow::Result;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::{ByteStream, ByteStreamError};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::ArtifactPublisher;
use crate::retry::{RetryPolicy, with_retry};

/// Publisher that uploads artifacts to `s3://{bucket}/{prefix}/{file_name}`
#[derive(Clone)]
pub struct S3Publisher {
    s3_client: Arc<S3Client>,
    bucket: String,
    prefix: Option<String>,
    retry: RetryPolicy,
}

impl S3Publisher {
    /// Create a new S3Publisher; an empty prefix is treated as no prefix
    pub fn new(
        s3_client: Arc<S3Client>,
        bucket: String,
        prefix: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        let prefix = prefix
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            s3_client,
            bucket,
            prefix,
            retry,
        }
    }

    /// Create a publisher from shared AWS configuration
    ///
    /// The SDK's own retries are disabled; attempts are bounded by `retry` alone.
    pub fn from_sdk_config(
        sdk_config: &SdkConfig,
        bucket: String,
        prefix: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        let s3_config = aws_sdk_s3::config::Builder::from(sdk_config)
            .retry_config(RetryConfig::disabled())
            .build();
        Self::new(
            Arc::new(S3Client::from_conf(s3_config)),
            bucket,
            prefix,
            retry,
        )
    }

    pub fn object_key(&self, file_name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{file_name}"),
            None => file_name.to_string(),
        }
    }
}

#[async_trait]
impl ArtifactPublisher for S3Publisher {
    fn destination(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("s3://{}/{}", self.bucket, prefix),
            None => format!("s3://{}", self.bucket),
        }
    }

    async fn publish(&self, local_path: &Path, file_name: &str) -> Result<String> {
        let key = self.object_key(file_name);
        let client = self.s3_client.as_ref();
        let bucket = self.bucket.as_str();
        let key_ref = key.as_str();

        with_retry(&self.retry, "s3 put_object", is_transient_upload, || async move {
            // The body is reopened per attempt; a consumed stream cannot be resent.
            let body = ByteStream::from_path(local_path)
                .await
                .map_err(UploadError::Body)?;
            client
                .put_object()
                .bucket(bucket)
                .key(key_ref)
                .body(body)
                .send()
                .await
                .map_err(UploadError::Sdk)
        })
        .await
        .map_err(|exhausted| {
            anyhow::anyhow!(
                "Failed to upload {} to s3://{}/{} after {} attempt(s): {}",
                local_path.display(),
                bucket,
                key_ref,
                exhausted.attempts,
                exhausted.error
            )
        })?;

        let location = format!("s3://{}/{}", self.bucket, key);
        tracing::info!(%location, "uploaded artifact");
        Ok(location)
    }
}

#[derive(Debug)]
enum UploadError {
    Body(ByteStreamError),
    Sdk(SdkError<PutObjectError>),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Body(e) => write!(f, "failed to open artifact for upload: {e}"),
            UploadError::Sdk(e) => write!(f, "{}", DisplayErrorContext(e)),
        }
    }
}

/// Timeouts, connection failures, unparsable responses and 5xx answers are
/// retried. Missing credentials and permission problems are not.
fn is_transient_upload(error: &UploadError) -> bool {
    match error {
        UploadError::Body(_) => false,
        UploadError::Sdk(SdkError::TimeoutError(_) | SdkError::ResponseError(_)) => true,
        UploadError::Sdk(SdkError::DispatchFailure(e)) => e.is_io() || e.is_timeout(),
        UploadError::Sdk(SdkError::ServiceError(e)) => e.raw().status().is_server_error(),
        UploadError::Sdk(_) => false,
    }
}
