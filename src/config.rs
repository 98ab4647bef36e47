use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::Result;
use crate::fetcher::FailurePolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Monthly archive page; `{year}` and `{month}` (zero padded) are substituted.
    pub archive_url_template: String,
    pub start_year: i32,
    pub start_month: u32,
    pub cache_dir: PathBuf,
    pub database: PathBuf,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub selectors: SelectorConfig,
    pub failure_policy: FailurePolicy,
}

/// CSS selectors used by the default extractor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub post_link: String,
    pub title: String,
    pub published: String,
    pub modified: String,
    pub tags: String,
    pub content: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            archive_url_template: "http://varlamov.ru/{year}/{month}".to_string(),
            start_year: 2006,
            start_month: 1,
            cache_dir: PathBuf::from("cache"),
            database: PathBuf::from("crawler.db"),
            timeout_secs: 10,
            user_agent: concat!("blog-archive-crawler/", env!("CARGO_PKG_VERSION")).to_string(),
            selectors: SelectorConfig::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            post_link: "a.j-day-subject-link".to_string(),
            title: "h1.entry-title, .j-e-title".to_string(),
            published: "time.published, .j-e-date-published, meta[property=\"article:published_time\"]"
                .to_string(),
            modified: "time.updated, meta[property=\"article:modified_time\"]".to_string(),
            tags: "a[rel=\"tag\"]".to_string(),
            content: "#entrytext".to_string(),
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub fn load(path: &str) -> Result<Config> {
    let text = fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&text)?;
    Ok(config)
}
