//! Resumable crawler for a blog's monthly archive.
//!
//! Pages and images are fetched through a sharded on-disk cache that also
//! remembers permanent failures, and posts and images are persisted with
//! natural-key upserts. A run can be killed at any point and simply started
//! again.

pub mod blog;
pub mod cache;
pub mod config;
pub mod crawl;
pub mod db;
mod error;
pub mod fetcher;
pub mod image_meta;
pub mod model;

pub use blog::{Extractor, SelectorExtractor};
pub use cache::{CacheKey, CacheLookup, ContentCache};
pub use config::Config;
pub use crawl::{CrawlDriver, CrawlStats, Period};
pub use db::{IdempotentStore, SqliteStore};
pub use error::{Error, Result};
pub use fetcher::{Disposition, FailurePolicy, FetchOptions, FetchResult, Fetcher, ResourceKind};
pub use image_meta::{BasicImageDecoder, ImageDecoder};
pub use model::{Image, ImageId, ImageMeta, Post, PostDocument, PostId};
