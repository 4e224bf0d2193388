use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, instrument};

/// Media downloaded from a transient origin
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub body: Bytes,
    pub content_type: String,
}

/// Downloads media from the generation provider's origin URL.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> PipelineResult<FetchedMedia>;
}

/// reqwest-backed origin fetcher with a whole-request timeout and a size cap
pub struct HttpOriginFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpOriginFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl OriginFetcher for HttpOriginFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> PipelineResult<FetchedMedia> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::TransientIo(format!("Origin download timed out: {e}"))
            } else {
                PipelineError::TransientIo(format!("Origin request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::TransientIo(format!(
                "Origin returned HTTP {}",
                status.as_u16()
            )));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(PipelineError::InvalidInput(format!(
                    "Origin payload of {length} bytes exceeds limit of {}",
                    self.max_bytes
                )));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("video/mp4")
            .to_string();

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(PipelineError::InvalidInput(format!(
                    "Origin payload exceeds limit of {} bytes",
                    self.max_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(size_bytes = body.len(), content_type = %content_type, "Origin download finished");

        Ok(FetchedMedia {
            body: Bytes::from(body),
            content_type,
        })
    }
}
