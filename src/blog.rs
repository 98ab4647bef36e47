use chardetng::EncodingDetector;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use encoding_rs::Encoding;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use url::Url;

use crate::config::SelectorConfig;
use crate::model::{Post, PostDocument};
use crate::{Error, Result};

static META_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"charset\s*=\s*["']?([A-Za-z0-9_\-]+)"#).expect("static charset regex")
});

/// Site-specific knowledge of where links and fields live in a page.
pub trait Extractor {
    /// Post URLs listed on an archive page, absolute, in page order, without
    /// duplicates.
    fn post_links(&self, page_url: &str, html: &str) -> Vec<String>;

    /// Post fields and image URLs. Fails when a required field is missing or
    /// a date cannot be parsed.
    fn post(&self, url: &str, html: &str) -> Result<PostDocument>;
}

/// [`Extractor`] driven by CSS selectors.
pub struct SelectorExtractor {
    post_link: Selector,
    title: Selector,
    published: Selector,
    modified: Selector,
    tags: Selector,
    content: Selector,
    image: Selector,
}

impl SelectorExtractor {
    pub fn new(config: &SelectorConfig) -> Result<Self> {
        Ok(Self {
            post_link: create_selector(&config.post_link)?,
            title: create_selector(&config.title)?,
            published: create_selector(&config.published)?,
            modified: create_selector(&config.modified)?,
            tags: create_selector(&config.tags)?,
            content: create_selector(&config.content)?,
            image: create_selector("img[src]")?,
        })
    }

    fn date(&self, document: &Html, selector: &Selector) -> Result<Option<DateTime<FixedOffset>>> {
        let Some(element) = document.select(selector).next() else {
            return Ok(None);
        };
        let raw = element
            .value()
            .attr("datetime")
            .or_else(|| element.value().attr("content"))
            .map(str::to_string)
            .unwrap_or_else(|| element_text(element));

        if raw.is_empty() {
            return Ok(None);
        }
        parse_date(&raw).map(Some)
    }
}

impl Extractor for SelectorExtractor {
    fn post_links(&self, page_url: &str, html: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        let hrefs = document
            .select(&self.post_link)
            .filter_map(|a| a.value().attr("href"))
            .map(|href| normalize_url(page_url, href));
        dedup_ordered(hrefs)
    }

    fn post(&self, url: &str, html: &str) -> Result<PostDocument> {
        let document = Html::parse_document(html);

        let title = document
            .select(&self.title)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Extraction(format!("no title in {url}")))?;

        let published = self.date(&document, &self.published)?;
        let modified = self.date(&document, &self.modified)?;

        let tags = dedup_ordered(
            document
                .select(&self.tags)
                .map(element_text)
                .filter(|t| !t.is_empty()),
        );

        let images = match document.select(&self.content).next() {
            Some(content) => dedup_ordered(
                content
                    .select(&self.image)
                    .filter_map(|img| img.value().attr("src"))
                    .filter(|src| !src.starts_with("data:"))
                    .map(|src| normalize_url(url, src)),
            ),
            None => Vec::new(),
        };

        Ok(PostDocument {
            post: Post {
                url: url.to_string(),
                title,
                published,
                modified,
                tags,
            },
            images,
        })
    }
}

#[inline]
fn create_selector(sel_str: &str) -> Result<Selector> {
    Selector::parse(sel_str).map_err(|_| Error::Config(format!("invalid selector: {sel_str}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn dedup_ordered(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Accepts RFC 3339 and the bare `YYYY-MM-DD HH:MM:SS` form (taken as UTC).
pub fn parse_date(raw: &str) -> Result<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Ok(date);
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc().fixed_offset());
        }
    }

    Err(Error::Extraction(format!("malformed date: {raw}")))
}

/// Resolves `href` against `base`, falling back to `href` unchanged.
pub fn normalize_url(base: &str, href: &str) -> String {
    let base_url = match Url::parse(base) {
        Ok(u) => u,
        Err(_) => return href.to_string(),
    };

    match base_url.join(href) {
        Ok(joined) => joined.to_string(),
        Err(_) => href.to_string(),
    }
}

/// Decodes cached HTML bytes: BOM, then `<meta charset>`, then detection.
pub fn decode_html(bytes: &[u8]) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _, _) = encoding.decode(&bytes[bom_len..]);
        return text.into_owned();
    }

    let ascii_head = String::from_utf8_lossy(&bytes[..bytes.len().min(4096)]);
    if let Some(charset) = META_CHARSET.captures(&ascii_head).and_then(|cap| cap.get(1)) {
        if let Some(encoding) = Encoding::for_label(charset.as_str().as_bytes()) {
            let (text, _, _) = encoding.decode(bytes);
            return text.into_owned();
        }
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const INDEX: &str = r#"
        <html><body>
          <a class="j-day-subject-link" href="/1001.html">First</a>
          <a class="j-day-subject-link" href="http://varlamov.ru/1002.html">Second</a>
          <a class="j-day-subject-link" href="/1001.html">First again</a>
          <a href="/elsewhere.html">Not a post</a>
        </body></html>
    "#;

    const POST: &str = r#"
        <html><head><meta charset="utf-8"></head><body>
          <h1 class="entry-title">  Moscow
              metro  </h1>
          <time class="published" datetime="2011-03-14T09:30:00+03:00">14 March</time>
          <a rel="tag" href="/tag/moscow">moscow</a>
          <a rel="tag" href="/tag/metro">metro</a>
          <a rel="tag" href="/tag/moscow">moscow</a>
          <div id="entrytext">
            <img src="/img/1.jpg">
            <img src="http://img.example/2.jpg">
            <img src="/img/1.jpg">
            <img src="data:image/gif;base64,R0lGOD">
          </div>
          <img src="/img/sidebar.jpg">
        </body></html>
    "#;

    fn extractor() -> SelectorExtractor {
        SelectorExtractor::new(&SelectorConfig::default()).unwrap()
    }

    #[test]
    fn post_links_are_absolute_and_unique() {
        let links = extractor().post_links("http://varlamov.ru/2011/03", INDEX);
        assert_eq!(
            links,
            vec![
                "http://varlamov.ru/1001.html".to_string(),
                "http://varlamov.ru/1002.html".to_string(),
            ]
        );
    }

    #[test]
    fn post_fields_are_extracted() {
        let doc = extractor().post("http://varlamov.ru/1001.html", POST).unwrap();
        assert_eq!(doc.post.title, "Moscow metro");
        assert_eq!(
            doc.post.published,
            Some(DateTime::parse_from_rfc3339("2011-03-14T09:30:00+03:00").unwrap())
        );
        assert_eq!(doc.post.modified, None);
        assert_eq!(doc.post.tags, vec!["moscow".to_string(), "metro".to_string()]);
        assert_eq!(
            doc.images,
            vec![
                "http://varlamov.ru/img/1.jpg".to_string(),
                "http://img.example/2.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn missing_title_is_an_extraction_error() {
        let err = extractor()
            .post("http://varlamov.ru/1.html", "<html><body><p>hi</p></body></html>")
            .unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
    }

    #[test]
    fn malformed_date_is_an_extraction_error() {
        let html = r#"<h1 class="entry-title">T</h1><time class="published">yesterday-ish</time>"#;
        let err = extractor().post("http://varlamov.ru/1.html", html).unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
    }

    #[test]
    fn bare_dates_are_utc() {
        let date = parse_date("2011-03-14 09:30:00").unwrap();
        assert_eq!(date.to_rfc3339(), "2011-03-14T09:30:00+00:00");
    }

    #[test]
    fn invalid_selector_is_a_config_error() {
        let config = SelectorConfig {
            title: "h1[".to_string(),
            ..SelectorConfig::default()
        };
        assert!(matches!(SelectorExtractor::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn meta_charset_is_honoured() {
        let (bytes, _, _) = encoding_rs::WINDOWS_1251
            .encode("<meta charset=\"windows-1251\"><h1>Привет</h1>");
        let text = decode_html(&bytes);
        assert!(text.contains("Привет"));
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice("<p>ok</p>".as_bytes());
        assert_eq!(decode_html(&bytes), "<p>ok</p>");
    }
}
