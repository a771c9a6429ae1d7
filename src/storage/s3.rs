//! S3 object-store adapter using the AWS SDK.
//!
//! Writes are streamed — a single PUT below the multipart threshold,
//! otherwise multipart with the adaptive part size from `plan.rs` and a
//! bounded number of parts in flight. The SDK's own body-checksum
//! recomputation is disabled; the pipeline has already hashed the payload.

use super::plan::UploadPlan;
use super::retry::{ClassifiedError, RetryPolicy};
use super::traits::{ObjectBody, ObjectStore, PayloadReader, StoreError};
use crate::config::StoreConfig;
use crate::types::{ContentDigest, PutOutcome, StoredObject};
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Region, RequestChecksumCalculation};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, CorsConfiguration, CorsRule, MetadataDirective,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

/// S3 store with an optional second client for the public endpoint.
pub struct S3Store {
    client: Client,
    /// Client against the public endpoint, used for presigning small
    /// payloads. `None` when no public endpoint is configured.
    public_client: Option<Client>,
    retry: RetryPolicy,
    parts_in_flight: usize,
    large_file_threshold: u64,
    cors_origins: Vec<String>,
}

impl S3Store {
    /// Build a store from configuration. Connects lazily; no network I/O
    /// happens here beyond credential resolution.
    pub async fn new(config: &StoreConfig, retry: RetryPolicy) -> Result<Self, StoreError> {
        let client = Self::build_client(config, config.endpoint.as_deref()).await;

        let public_client = match &config.public_endpoint {
            Some(host) => {
                let url = format!("{}://{}", config.public_scheme, host);
                Some(Self::build_client(config, Some(&url)).await)
            }
            None => None,
        };

        debug!(
            "S3Store initialized (endpoint: {:?}, public: {:?})",
            config.endpoint, config.public_endpoint
        );

        Ok(Self {
            client,
            public_client,
            retry,
            parts_in_flight: config.parts_in_flight,
            large_file_threshold: config.large_file_threshold_mib * 1024 * 1024,
            cors_origins: config.cors_origins.clone(),
        })
    }

    async fn build_client(config: &StoreConfig, endpoint: Option<&str>) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let Some(ep) = endpoint {
            loader = loader.endpoint_url(ep);
        }

        // Explicit credentials when configured, default chain otherwise
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id,
                secret,
                None,
                None,
                "wavevault-config",
            ));
        }

        // Constrained-host transport budget: slow TLS or a hung response
        // header must not pin a worker.
        loader = loader.timeout_config(
            TimeoutConfig::builder()
                .connect_timeout(Duration::from_secs(10))
                .read_timeout(Duration::from_secs(30))
                .build(),
        );

        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            // The pipeline hashes the payload itself; recomputing SHA-256
            // in the SDK would double the CPU cost of every upload.
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .build();

        Client::from_conf(s3_config)
    }

    /// Classify an SDK failure for the retry layer.
    fn classify<E>(op: &str, err: SdkError<E>) -> ClassifiedError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = format!("{op} failed: {err}");
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                ClassifiedError::transient(StoreError::Unavailable(message))
            }
            SdkError::ResponseError(raw) => ClassifiedError::from_status(
                raw.raw().status().as_u16(),
                StoreError::Unavailable(message),
            ),
            SdkError::ServiceError(service) => ClassifiedError::from_status(
                service.raw().status().as_u16(),
                StoreError::Unavailable(message),
            ),
            _ => ClassifiedError::permanent(StoreError::Unavailable(message)),
        }
    }

    /// Read up to `limit` bytes from the reader. Returns an empty buffer at
    /// end of stream.
    async fn read_chunk(reader: &mut PayloadReader, limit: usize) -> Result<Bytes, StoreError> {
        let mut buf = vec![0u8; limit];
        let mut filled = 0;
        while filled < limit {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn put_single(
        &self,
        bucket: &str,
        key: &str,
        mut reader: PayloadReader,
        size: u64,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<PutOutcome, StoreError> {
        // Below the multipart threshold the payload is bounded at 64 MiB;
        // the SDK needs a sized body for a single PUT.
        let body = Self::read_chunk(&mut reader, size as usize).await?;
        if body.len() as u64 != size {
            return Err(StoreError::InvalidArgument(format!(
                "payload ended early: declared {size}, read {}",
                body.len()
            )));
        }

        let response = self
            .retry
            .run("put_object", || {
                let body = body.clone();
                let metadata = user_metadata.clone();
                async move {
                    self.client
                        .put_object()
                        .bucket(bucket)
                        .key(key)
                        .content_type(content_type)
                        .set_metadata(Some(metadata))
                        .body(ByteStream::from(body))
                        .send()
                        .await
                        .map_err(|e| Self::classify("put_object", e))
                }
            })
            .await?;

        Ok(PutOutcome {
            etag: response.e_tag.unwrap_or_default(),
            stored_size: size,
        })
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        mut reader: PayloadReader,
        size: u64,
        part_size: u64,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<PutOutcome, StoreError> {
        let created = self
            .retry
            .run("create_multipart_upload", || {
                let metadata = user_metadata.clone();
                async move {
                    self.client
                        .create_multipart_upload()
                        .bucket(bucket)
                        .key(key)
                        .content_type(content_type)
                        .set_metadata(Some(metadata))
                        .send()
                        .await
                        .map_err(|e| Self::classify("create_multipart_upload", e))
                }
            })
            .await?;

        let upload_id = created.upload_id.ok_or_else(|| {
            StoreError::Unavailable("store returned no multipart upload id".to_string())
        })?;

        match self
            .upload_parts(bucket, key, &upload_id, &mut reader, size, part_size)
            .await
        {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                let response = self
                    .retry
                    .run("complete_multipart_upload", || {
                        let completed = completed.clone();
                        let upload_id = upload_id.clone();
                        async move {
                            self.client
                                .complete_multipart_upload()
                                .bucket(bucket)
                                .key(key)
                                .upload_id(upload_id)
                                .multipart_upload(completed)
                                .send()
                                .await
                                .map_err(|e| Self::classify("complete_multipart_upload", e))
                        }
                    })
                    .await?;

                Ok(PutOutcome {
                    etag: response.e_tag.unwrap_or_default(),
                    stored_size: size,
                })
            }
            Err(err) => {
                // Leaving half-finished multipart state behind costs real
                // storage on most backends.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("abort_multipart_upload for {key}: {abort_err}");
                }
                Err(err)
            }
        }
    }

    /// Upload all parts with at most `parts_in_flight` concurrent. The
    /// reader is consumed sequentially so input order is preserved.
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        reader: &mut PayloadReader,
        size: u64,
        part_size: u64,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let mut in_flight = FuturesUnordered::new();
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut part_number: i32 = 0;
        let mut sent: u64 = 0;

        loop {
            let remaining = size - sent;
            if remaining > 0 {
                let chunk_len = part_size.min(remaining) as usize;
                let chunk = Self::read_chunk(reader, chunk_len).await?;
                if chunk.is_empty() {
                    return Err(StoreError::InvalidArgument(format!(
                        "payload ended early: declared {size}, read {sent}"
                    )));
                }
                sent += chunk.len() as u64;
                part_number += 1;

                let client = self.client.clone();
                let retry = self.retry.clone();
                let bucket = bucket.to_string();
                let key = key.to_string();
                let upload_id = upload_id.to_string();
                in_flight.push(tokio::spawn(async move {
                    let etag = retry
                        .run("upload_part", || {
                            let chunk = chunk.clone();
                            let client = client.clone();
                            let bucket = bucket.clone();
                            let key = key.clone();
                            let upload_id = upload_id.clone();
                            async move {
                                client
                                    .upload_part()
                                    .bucket(bucket)
                                    .key(key)
                                    .upload_id(upload_id)
                                    .part_number(part_number)
                                    .body(ByteStream::from(chunk))
                                    .send()
                                    .await
                                    .map(|r| r.e_tag.unwrap_or_default())
                                    .map_err(|e| Self::classify("upload_part", e))
                            }
                        })
                        .await?;
                    Ok::<CompletedPart, StoreError>(
                        CompletedPart::builder()
                            .part_number(part_number)
                            .e_tag(etag)
                            .build(),
                    )
                }));
            }

            let done = sent == size;
            if in_flight.is_empty() && done {
                break;
            }

            // Drain: wait whenever the window is full, or for stragglers
            // after the last part went out.
            if in_flight.len() >= self.parts_in_flight || done {
                match in_flight.next().await {
                    Some(Ok(Ok(part))) => parts.push(part),
                    Some(Ok(Err(err))) => return Err(err),
                    Some(Err(join_err)) => {
                        return Err(StoreError::Unavailable(format!(
                            "part upload task failed: {join_err}"
                        )))
                    }
                    None => {}
                }
            }
        }

        // CompleteMultipartUpload requires ascending part numbers.
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    fn to_stored_object(
        key: &str,
        content_length: Option<i64>,
        content_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
        etag: Option<String>,
        last_modified: Option<aws_sdk_s3::primitives::DateTime>,
    ) -> StoredObject {
        StoredObject {
            key: key.to_string(),
            size: content_length.unwrap_or(0).max(0) as u64,
            content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            user_metadata: metadata.unwrap_or_default(),
            etag: etag.unwrap_or_default(),
            last_modified: last_modified
                .and_then(|dt| chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
                .unwrap_or_else(chrono::Utc::now),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service)) if service.raw().status().as_u16() == 404 => {
                Ok(false)
            }
            Err(e) => Err(StoreError::Unavailable(format!("head_bucket failed: {e}"))),
        }
    }

    #[instrument(skip(self))]
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        if self.bucket_exists(bucket).await? {
            return Ok(());
        }
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                debug!("Created bucket {}", bucket);
                Ok(())
            }
            Err(SdkError::ServiceError(service))
                if service.err().is_bucket_already_owned_by_you()
                    || service.err().is_bucket_already_exists() =>
            {
                Ok(())
            }
            Err(e) => Err(StoreError::Unavailable(format!(
                "create_bucket failed: {e}"
            ))),
        }
    }

    #[instrument(skip(self, reader, user_metadata), fields(size = size))]
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        reader: PayloadReader,
        size: u64,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<PutOutcome, StoreError> {
        let plan = UploadPlan::for_size(size);
        debug!("PUT {}/{} ({} bytes, {:?})", bucket, key, size, plan);

        match plan {
            UploadPlan::SinglePut => {
                self.put_single(bucket, key, reader, size, content_type, user_metadata)
                    .await
            }
            UploadPlan::Multipart { part_size } => {
                self.put_multipart(
                    bucket,
                    key,
                    reader,
                    size,
                    part_size,
                    content_type,
                    user_metadata,
                )
                .await
            }
        }
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if let SdkError::ServiceError(service) = &e {
                    if service.err().is_no_such_key() {
                        return StoreError::NotFound(key.to_string());
                    }
                }
                StoreError::Unavailable(format!("get_object failed: {e}"))
            })?;

        let reader = response.body.into_async_read();
        let stream = tokio_util::io::ReaderStream::new(reader).map(|r| r.map_err(StoreError::Io));
        Ok(Box::pin(stream))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if let SdkError::ServiceError(service) = &e {
                    if service.err().is_not_found() {
                        return StoreError::NotFound(key.to_string());
                    }
                }
                StoreError::Unavailable(format!("head_object failed: {e}"))
            })?;

        Ok(Self::to_stored_object(
            key,
            response.content_length,
            response.content_type,
            response.metadata,
            response.e_tag,
            response.last_modified,
        ))
    }

    #[instrument(skip(self, user_metadata))]
    async fn copy_object_replace_metadata(
        &self,
        bucket: &str,
        key: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        // Preserve the stored content type across the metadata rewrite.
        let head = self.head_object(bucket, key).await?;

        self.retry
            .run("copy_object", || {
                let content_type = head.content_type.clone();
                let metadata = user_metadata.clone();
                async move {
                    self.client
                        .copy_object()
                        .bucket(bucket)
                        .key(key)
                        .copy_source(format!("{bucket}/{key}"))
                        .metadata_directive(MetadataDirective::Replace)
                        .content_type(content_type)
                        .set_metadata(Some(metadata))
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(|e| Self::classify("copy_object", e))
                }
            })
            .await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("delete_object failed: {e}")))?;
        debug!("DELETE {}/{}", bucket, key);
        Ok(())
    }

    async fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StoreError::Unavailable(format!("list_objects_v2 failed: {e}")))?;

            if let Some(contents) = response.contents {
                keys.extend(contents.into_iter().filter_map(|o| o.key));
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn list_hashes(&self, bucket: &str) -> Result<HashSet<ContentDigest>, StoreError> {
        let keys = self.list_keys(bucket).await?;
        let mut hashes = HashSet::new();

        for key in keys {
            match self.head_object(bucket, &key).await {
                Ok(object) => {
                    if let Some(digest) = object.file_hash() {
                        hashes.insert(digest);
                    }
                }
                // An object deleted between list and head is not an error.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        debug!("Materialized {} content hashes from {}", hashes.len(), bucket);
        Ok(hashes)
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::InvalidArgument(format!("presign ttl: {e}")))?;
        let presigned = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| StoreError::Unavailable(format!("presign put failed: {e}")))?;
        Ok(presigned.uri().to_string())
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::InvalidArgument(format!("presign ttl: {e}")))?;
        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| StoreError::Unavailable(format!("presign get failed: {e}")))?;
        Ok(presigned.uri().to_string())
    }

    async fn presign_put_for_size(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        payload_size: u64,
    ) -> Result<String, StoreError> {
        // Large payloads bypass the CDN (upload caps); small ones benefit
        // from it. No public endpoint configured means everything is direct.
        let client = if payload_size > self.large_file_threshold {
            &self.client
        } else {
            self.public_client.as_ref().unwrap_or(&self.client)
        };

        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::InvalidArgument(format!("presign ttl: {e}")))?;
        let presigned = client
            .put_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| StoreError::Unavailable(format!("presign put failed: {e}")))?;
        Ok(presigned.uri().to_string())
    }

    async fn set_bucket_cors(&self, bucket: &str, origins: &[String]) -> Result<(), StoreError> {
        let origins = if origins.is_empty() {
            self.cors_origins.clone()
        } else {
            origins.to_vec()
        };

        let rule = CorsRule::builder()
            .set_allowed_origins(Some(origins))
            .set_allowed_methods(Some(
                ["PUT", "GET", "HEAD", "POST", "DELETE"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ))
            .set_allowed_headers(Some(vec!["*".to_string()]))
            .set_expose_headers(Some(
                ["ETag", "x-amz-*", "Content-Range", "Content-Length"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ))
            .max_age_seconds(3600)
            .build()
            .map_err(|e| StoreError::InvalidArgument(format!("cors rule: {e}")))?;

        let config = CorsConfiguration::builder()
            .cors_rules(rule)
            .build()
            .map_err(|e| StoreError::InvalidArgument(format!("cors config: {e}")))?;

        self.client
            .put_bucket_cors()
            .bucket(bucket)
            .cors_configuration(config)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("put_bucket_cors failed: {e}")))?;
        Ok(())
    }

    async fn set_bucket_policy(&self, bucket: &str) -> Result<(), StoreError> {
        let policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "AuthenticatedUploads",
                "Effect": "Allow",
                "Principal": {"AWS": ["*"]},
                "Action": ["s3:PutObject", "s3:GetObject"],
                "Resource": [format!("arn:aws:s3:::{bucket}/*")]
            }]
        });

        self.client
            .put_bucket_policy()
            .bucket(bucket)
            .policy(policy.to_string())
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("put_bucket_policy failed: {e}")))?;
        Ok(())
    }
}
