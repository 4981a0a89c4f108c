use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::config::S3Location;
use crate::error::{EngineError, Result};

/// Blocking S3 reader used by the remote acquisition strategy.
///
/// Owns a small current-thread runtime so callers stay synchronous; every
/// call is bounded by `timeout`.
pub struct S3Client {
    runtime: Runtime,
    client: Client,
    bucket: String,
    timeout: Duration,
}

impl S3Client {
    /// Create a new S3 client
    pub fn new(bucket: String, region: String, timeout: Duration) -> Result<Self> {
        info!("Initializing S3 client for bucket: {} in region: {}", bucket, region);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(region))
                .load(),
        );
        let client = Client::new(&config);

        Ok(S3Client {
            runtime,
            client,
            bucket,
            timeout,
        })
    }

    pub fn from_location(location: &S3Location, timeout: Duration) -> Result<Self> {
        Self::new(location.bucket.clone(), location.region.clone(), timeout)
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Download an object's bytes; timeouts and SDK errors are reported as
    /// an unavailable source
    pub fn download_object(&self, key: &str) -> Result<Vec<u8>> {
        debug!("Downloading object: s3://{}/{}", self.bucket, key);

        let fetch = async {
            let response = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| EngineError::SourceUnavailable(format!("s3://{}/{}: {}", self.bucket, key, e)))?;

            let data = response
                .body
                .collect()
                .await
                .map_err(|e| EngineError::SourceUnavailable(format!("failed to read object body: {}", e)))?
                .into_bytes()
                .to_vec();
            Ok::<_, EngineError>(data)
        };

        let data = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, fetch).await })
            .map_err(|_| {
                EngineError::SourceUnavailable(format!(
                    "s3://{}/{} timed out after {:?}",
                    self.bucket, key, self.timeout
                ))
            })??;

        debug!("Downloaded {} bytes from {}", data.len(), key);
        Ok(data)
    }
}
