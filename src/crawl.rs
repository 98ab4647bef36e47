//! Archive walk: monthly index pages, then posts, then their images.
//!
//! The driver keeps no state of its own. A restarted run starts from the top
//! and relies on the cache and the store to skip finished work: post pages
//! come from the cache, and images already in the store are never fetched.

use chrono::{Datelike, Local};
use std::fmt;
use std::str::FromStr;
use tracing::{Span, debug, info, warn};

use crate::blog::{Extractor, decode_html};
use crate::db::IdempotentStore;
use crate::fetcher::{FetchOptions, FetchResult, Fetcher};
use crate::image_meta::ImageDecoder;
use crate::model::{Image, PostId};
use crate::{Error, Result};

/// One monthly archive page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::Config(format!("month out of range: {month}")));
        }
        Ok(Self { year, month })
    }

    pub fn current() -> Self {
        let today = Local::now();
        Self {
            year: today.year(),
            month: today.month(),
        }
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Every period from `self` to `end`, inclusive. Empty when `end` is earlier.
    pub fn through(self, end: Period) -> impl Iterator<Item = Period> {
        std::iter::successors(Some(self), |p| Some(p.next())).take_while(move |p| *p <= end)
    }

    pub fn archive_url(&self, template: &str) -> String {
        template
            .replace("{year}", &self.year.to_string())
            .replace("{month}", &format!("{:02}", self.month))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("expected YYYY-MM, got {s:?}"));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        Period::new(year, month)
    }
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub periods: usize,
    pub posts_saved: usize,
    pub posts_failed: usize,
    pub images_saved: usize,
    pub images_skipped: usize,
    pub images_failed: usize,
}

pub struct CrawlDriver<S, E, D> {
    fetcher: Fetcher,
    store: S,
    extractor: E,
    decoder: D,
    archive_url_template: String,
    span: Span,
}

impl<S, E, D> CrawlDriver<S, E, D>
where
    S: IdempotentStore,
    E: Extractor,
    D: ImageDecoder,
{
    pub fn new(
        fetcher: Fetcher,
        store: S,
        extractor: E,
        decoder: D,
        archive_url_template: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            store,
            extractor,
            decoder,
            archive_url_template: archive_url_template.into(),
            span: Span::current(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Walks every archive page from `start` to `end`. With `update`, index
    /// pages are fetched again even when cached; posts and images never are.
    pub async fn run(&self, start: Period, end: Period, update: bool) -> Result<CrawlStats> {
        let mut stats = CrawlStats::default();
        for period in start.through(end) {
            stats.periods += 1;
            self.crawl_period(period, update, &mut stats).await?;
        }
        self.report(&stats);
        Ok(stats)
    }

    pub async fn run_single_post(&self, post_url: &str) -> Result<CrawlStats> {
        let mut stats = CrawlStats::default();
        self.process_post(post_url, None, &mut stats).await?;
        self.report(&stats);
        Ok(stats)
    }

    /// Records the owning post, then only `image_url`.
    pub async fn run_single_image(&self, post_url: &str, image_url: &str) -> Result<CrawlStats> {
        let mut stats = CrawlStats::default();
        self.process_post(post_url, Some(image_url), &mut stats).await?;
        self.report(&stats);
        Ok(stats)
    }

    async fn crawl_period(&self, period: Period, update: bool, stats: &mut CrawlStats) -> Result<()> {
        let url = period.archive_url(&self.archive_url_template);
        info!(parent: &self.span, %period, url = %url, "archive page");

        let options = FetchOptions::document().force_refresh(update);
        let html = match self.fetcher.fetch(&url, options).await? {
            FetchResult::Success(bytes) => decode_html(&bytes),
            FetchResult::NotFoundRemote => {
                info!(parent: &self.span, %period, url = %url, "no archive page for period");
                return Ok(());
            }
            FetchResult::TransientError(reason) | FetchResult::PermanentError(reason) => {
                warn!(parent: &self.span, %period, url = %url, %reason, "archive page unavailable");
                return Ok(());
            }
        };

        let links = self.extractor.post_links(&url, &html);
        debug!(parent: &self.span, %period, posts = links.len(), "found posts");

        for post_url in &links {
            self.process_post(post_url, None, stats).await?;
        }
        Ok(())
    }

    async fn process_post(
        &self,
        url: &str,
        only_image: Option<&str>,
        stats: &mut CrawlStats,
    ) -> Result<Option<PostId>> {
        let bytes = match self.fetcher.fetch(url, FetchOptions::document()).await? {
            FetchResult::Success(bytes) => bytes,
            FetchResult::NotFoundRemote => {
                info!(parent: &self.span, url, "post not found, skipping");
                stats.posts_failed += 1;
                return Ok(None);
            }
            FetchResult::TransientError(reason) | FetchResult::PermanentError(reason) => {
                warn!(parent: &self.span, url, %reason, "post unavailable, skipping");
                stats.posts_failed += 1;
                return Ok(None);
            }
        };

        let document = match self.extractor.post(url, &decode_html(&bytes)) {
            Ok(document) => document,
            Err(e) if e.is_per_resource() => {
                warn!(parent: &self.span, url, reason = %e, "post extraction failed, skipping");
                stats.posts_failed += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        // The post row must be committed before any of its images are looked at.
        let post_id = self.store.upsert_post(&document.post)?;
        stats.posts_saved += 1;

        let images = match only_image {
            Some(image_url) => vec![image_url.to_string()],
            None => document.images,
        };
        for image_url in &images {
            self.process_image(post_id, image_url, stats).await?;
        }

        Ok(Some(post_id))
    }

    async fn process_image(&self, post_id: PostId, url: &str, stats: &mut CrawlStats) -> Result<()> {
        if self.store.image_exists(post_id, url)? {
            debug!(parent: &self.span, url, post_id, "image already recorded");
            stats.images_skipped += 1;
            return Ok(());
        }

        let bytes = match self.fetcher.fetch(url, FetchOptions::blob()).await? {
            FetchResult::Success(bytes) => bytes,
            FetchResult::NotFoundRemote => {
                info!(parent: &self.span, url, "image not found, skipping");
                stats.images_failed += 1;
                return Ok(());
            }
            FetchResult::TransientError(reason) | FetchResult::PermanentError(reason) => {
                warn!(parent: &self.span, url, %reason, "image unavailable, skipping");
                stats.images_failed += 1;
                return Ok(());
            }
        };

        let meta = match self.decoder.decode(url, &bytes) {
            Ok(meta) => meta,
            Err(e) if e.is_per_resource() => {
                warn!(parent: &self.span, url, reason = %e, "image decoding failed, skipping");
                stats.images_failed += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.store.insert_image_if_absent(&Image {
            post_id,
            url: url.to_string(),
            meta,
        })?;
        stats.images_saved += 1;
        Ok(())
    }

    fn report(&self, stats: &CrawlStats) {
        info!(
            parent: &self.span,
            periods = stats.periods,
            posts_saved = stats.posts_saved,
            posts_failed = stats.posts_failed,
            images_saved = stats.images_saved,
            images_skipped = stats.images_skipped,
            images_failed = stats.images_failed,
            "crawl finished"
        );
    }
}
