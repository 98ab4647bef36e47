use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{Span, debug, info, warn};

use crate::cache::{CacheKey, CacheLookup, ContentCache};
use crate::config::Config;
use crate::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a failed fetch leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Recorded in the cache; later runs never retry.
    Permanent,
    /// Reported only; the next run tries again.
    Transient,
}

/// Classification of the three ways a fetch can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    /// Any status other than 200 and 404.
    pub http_status: Disposition,
    /// Connection, timeout or request construction failure before a response.
    pub connect: Disposition,
    /// Failure while reading the body.
    pub body_read: Disposition,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            http_status: Disposition::Permanent,
            connect: Disposition::Permanent,
            body_read: Disposition::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResourceKind {
    /// Buffered in memory, then cached.
    #[default]
    Document,
    /// Streamed straight into the cache.
    Blob,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    pub force_refresh: bool,
    pub kind: ResourceKind,
}

impl FetchOptions {
    pub fn document() -> Self {
        Self::default()
    }

    pub fn blob() -> Self {
        Self {
            kind: ResourceKind::Blob,
            ..Self::default()
        }
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Success(Vec<u8>),
    /// HTTP 404. Not cached; the resource may appear later.
    NotFoundRemote,
    TransientError(String),
    PermanentError(String),
}

/// HTTP retrieval in front of a [`ContentCache`].
pub struct Fetcher {
    client: Client,
    cache: ContentCache,
    policy: FailurePolicy,
    span: Span,
}

impl Fetcher {
    pub fn new(cache: ContentCache) -> Result<Self> {
        Self::with_timeout(cache, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(cache: ContentCache, timeout: Duration) -> Result<Self> {
        Self::build(
            cache,
            timeout,
            concat!("blog-archive-crawler/", env!("CARGO_PKG_VERSION")),
        )
    }

    pub fn from_config(cache: ContentCache, config: &Config) -> Result<Self> {
        Ok(Self::build(cache, config.timeout(), &config.user_agent)?.with_policy(config.failure_policy))
    }

    fn build(cache: ContentCache, timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(Error::Network)?;

        Ok(Self {
            client,
            cache,
            policy: FailurePolicy::default(),
            span: Span::current(),
        })
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Retrieves `locator`, preferring the cache unless `force_refresh` is set.
    ///
    /// Remote failures come back as [`FetchResult`] variants. `Err` is reserved
    /// for local failures such as an unwritable cache directory.
    pub async fn fetch(&self, locator: &str, opts: FetchOptions) -> Result<FetchResult> {
        if !opts.force_refresh {
            match self.cache.get(locator)? {
                CacheLookup::Hit(bytes) => {
                    debug!(parent: &self.span, url = locator, bytes = bytes.len(), "cache hit");
                    return Ok(FetchResult::Success(bytes));
                }
                CacheLookup::PermanentError(reason) => {
                    debug!(parent: &self.span, url = locator, %reason, "cached permanent error");
                    return Ok(FetchResult::PermanentError(reason));
                }
                CacheLookup::NotFound => {}
            }
        }

        debug!(parent: &self.span, url = locator, "requesting");
        let response = match self.client.get(locator).send().await {
            Ok(response) => response,
            Err(e) => return self.fail(locator, self.policy.connect, request_failure_reason(&e)),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            info!(parent: &self.span, url = locator, "not found (404)");
            return Ok(FetchResult::NotFoundRemote);
        }
        if status != StatusCode::OK {
            let reason = format!("InvalidHTTPStatusCode: {}", status.as_u16());
            return self.fail(locator, self.policy.http_status, reason);
        }

        let result = match opts.kind {
            ResourceKind::Document => self.store_buffered(locator, response).await?,
            ResourceKind::Blob => self.store_streamed(locator, response).await?,
        };

        if let FetchResult::Success(bytes) = &result {
            self.cache.clear_permanent_error(locator)?;
            info!(parent: &self.span, url = locator, bytes = bytes.len(), "fetched");
        }
        Ok(result)
    }

    async fn store_buffered(&self, locator: &str, response: Response) -> Result<FetchResult> {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(locator, self.policy.body_read, body_failure_reason(&e)),
        };
        self.cache.put(locator, &bytes)?;
        Ok(FetchResult::Success(bytes.to_vec()))
    }

    async fn store_streamed(&self, locator: &str, response: Response) -> Result<FetchResult> {
        let mut writer = self.cache.writer(locator)?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => writer.write_chunk(&chunk)?,
                Err(e) => {
                    // Dropping the writer removes the partial file.
                    drop(writer);
                    return self.fail(locator, self.policy.body_read, body_failure_reason(&e));
                }
            }
        }

        if writer.commit()? == 0 {
            return Ok(FetchResult::Success(Vec::new()));
        }
        // Only the committed file holds the body; it is read back once.
        let body = tokio::fs::read(self.cache.data_path(&CacheKey::for_locator(locator))).await?;
        Ok(FetchResult::Success(body))
    }

    fn fail(&self, locator: &str, disposition: Disposition, reason: String) -> Result<FetchResult> {
        match disposition {
            Disposition::Permanent => {
                self.cache.mark_permanent_error(locator, &reason)?;
                Ok(FetchResult::PermanentError(reason))
            }
            Disposition::Transient => {
                warn!(parent: &self.span, url = locator, %reason, "transient fetch failure");
                Ok(FetchResult::TransientError(reason))
            }
        }
    }
}

fn request_failure_reason(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "Timeout".to_string()
    } else if e.is_connect() {
        "ConnectionError".to_string()
    } else if e.is_builder() {
        "InvalidURL".to_string()
    } else {
        "RequestError".to_string()
    }
}

fn body_failure_reason(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "ReadTimeout".to_string()
    } else if e.is_decode() {
        "ContentDecodingError".to_string()
    } else {
        "ReadError".to_string()
    }
}
