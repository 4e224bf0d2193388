use crate::config::S3Config;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Metadata returned by `head`
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub size: u64,
    pub content_type: Option<String>,
}

/// Durable object storage capability: `put(key, bytes) -> publicURL` plus verification.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`, overwriting, and return its public URL.
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> PipelineResult<String>;

    /// Look up an object by its public URL. `None` when it does not exist.
    async fn head(&self, public_url: &str) -> PipelineResult<Option<ObjectInfo>>;
}

/// Deterministic object key for a migrated video.
/// Format: videos/{asset_id}.{ext}
pub fn video_key(asset_id: Uuid, content_type: &str) -> String {
    format!("videos/{}.{}", asset_id, extension_for(content_type))
}

/// Deterministic object key for an asset's thumbnail.
/// Format: thumbnails/{asset_id}.jpg
pub fn thumbnail_key(asset_id: Uuid) -> String {
    format!("thumbnails/{}.jpg", asset_id)
}

/// File extension for a video content type, `mp4` when unknown
fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();

    match essence.as_str() {
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        _ => "mp4",
    }
}

/// S3-compatible object store for owned media
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    public_base_url: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Ok(Self::from_client(
            S3Client::from_conf(s3_config_builder.build()),
            config,
        ))
    }

    /// Wrap an already configured client
    pub fn from_client(client: S3Client, config: &S3Config) -> Self {
        let public_base_url = config
            .public_base_url
            .clone()
            .unwrap_or_else(|| {
                format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region)
            })
            .trim_end_matches('/')
            .to_string();

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_base_url = %public_base_url,
            "S3 object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url,
            config: config.clone(),
        }
    }

    /// Public URL of an object key
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    /// Object key behind one of our public URLs
    fn key_for_url<'a>(&self, public_url: &'a str) -> PipelineResult<&'a str> {
        public_url
            .strip_prefix(&self.public_base_url)
            .map(|rest| rest.trim_start_matches('/'))
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                PipelineError::InvalidInput(format!("{public_url} is not an owned storage URL"))
            })
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(&self, key: &str, body: Bytes, content_type: &str) -> PipelineResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                PipelineError::TransientIo(format!("S3 put failed: {}", DisplayErrorContext(e)))
            })?;

        Ok(())
    }

    /// Multipart upload for large objects
    async fn multipart_upload(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> PipelineResult<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                PipelineError::TransientIo(format!(
                    "Failed to create multipart upload: {}",
                    DisplayErrorContext(e)
                ))
            })?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| PipelineError::TransientIo("No upload ID in response".to_string()))?;

        match self.upload_parts(key, upload_id, body).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Uploaded parts are billed until the upload is aborted.
                self.abort_multipart(key, upload_id).await;
                Err(e)
            }
        }
    }

    /// Upload `body` in parts and complete the multipart upload
    async fn upload_parts(&self, key: &str, upload_id: &str, body: Bytes) -> PipelineResult<()> {
        let mut completed_parts = Vec::new();
        let part_size = self.config.part_size_bytes.max(1);
        let mut part_number = 1;
        let mut offset = 0;

        while offset < body.len() {
            let end = (offset + part_size).min(body.len());
            // Bytes::slice shares the buffer; no copy per part.
            let chunk = body.slice(offset..end);

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| {
                    PipelineError::TransientIo(format!(
                        "Failed to upload part {part_number}: {}",
                        DisplayErrorContext(e)
                    ))
                })?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
            offset = end;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| {
                PipelineError::TransientIo(format!(
                    "Failed to complete multipart upload: {}",
                    DisplayErrorContext(e)
                ))
            })?;

        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => debug!(key = %key, upload_id = %upload_id, "Multipart upload aborted"),
            Err(e) => warn!(
                key = %key,
                upload_id = %upload_id,
                error = %DisplayErrorContext(e),
                "Failed to abort multipart upload"
            ),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(key = %key, size_bytes = body.len()))]
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> PipelineResult<String> {
        let size = body.len();

        if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type).await?;
        } else {
            self.simple_upload(key, body, content_type).await?;
        }

        debug!(key = %key, size_bytes = size, "Object uploaded");
        Ok(self.public_url(key))
    }

    async fn head(&self, public_url: &str) -> PipelineResult<Option<ObjectInfo>> {
        let key = self.key_for_url(public_url)?;

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectInfo {
                size: output.content_length().unwrap_or_default().max(0) as u64,
                content_type: output.content_type().map(String::from),
            })),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(PipelineError::TransientIo(format!(
                        "S3 head failed: {}",
                        DisplayErrorContext(e)
                    )))
                }
            }
        }
    }
}
