use chrono::{DateTime, FixedOffset};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use tracing::{Span, debug, info};

use crate::Result;
use crate::model::{Image, ImageId, ImageMeta, Post, PostId};

/// Persistence keyed by natural keys. Every call commits on its own, so a
/// post saved without all of its images is a valid state to resume from.
pub trait IdempotentStore {
    /// Inserts the post or refreshes title, timestamps and tags of the
    /// existing row. The id for a URL never changes.
    fn upsert_post(&self, post: &Post) -> Result<PostId>;

    fn image_exists(&self, post_id: PostId, url: &str) -> Result<bool>;

    /// Inserts the image unless `(post_id, url)` is already recorded. An
    /// existing row is returned untouched: images are write-once.
    fn insert_image_if_absent(&self, image: &Image) -> Result<ImageId>;
}

pub struct SqliteStore {
    conn: Connection,
    span: Span,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        init(&conn)?;
        Ok(Self {
            conn,
            span: Span::current(),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn post_id(&self, url: &str) -> Result<Option<PostId>> {
        let id = self
            .conn
            .query_row("SELECT id FROM post WHERE url = ?1", [url], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    pub fn get_post(&self, url: &str) -> Result<Option<(PostId, Post)>> {
        let row = self
            .conn
            .query_row(
                "
                SELECT id, url, title, date_published, date_modified, tags
                FROM post
                WHERE url = ?1
                ",
                [url],
                |row| {
                    Ok((
                        row.get::<_, PostId>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<DateTime<FixedOffset>>>(3)?,
                        row.get::<_, Option<DateTime<FixedOffset>>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, url, title, published, modified, tags)) = row else {
            return Ok(None);
        };
        let post = Post {
            url,
            title,
            published,
            modified,
            tags: serde_json::from_str(&tags)?,
        };
        Ok(Some((id, post)))
    }

    pub fn get_image(&self, post_id: PostId, url: &str) -> Result<Option<(ImageId, Image)>> {
        let image = self
            .conn
            .query_row(
                "
                SELECT id, post_id, url, width, height, file_size, camera_model,
                       focal_length, exposure_time, date_time, aperture_value, iso
                FROM image
                WHERE post_id = ?1 AND url = ?2
                ",
                params![post_id, url],
                image_from_row,
            )
            .optional()?;
        Ok(image)
    }

    pub fn count_images(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM image", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<(ImageId, Image)> {
    let file_size: i64 = row.get(5)?;
    Ok((
        row.get(0)?,
        Image {
            post_id: row.get(1)?,
            url: row.get(2)?,
            meta: ImageMeta {
                width: row.get(3)?,
                height: row.get(4)?,
                file_size: u64::try_from(file_size).unwrap_or_default(),
                camera_model: row.get(6)?,
                focal_length: row.get(7)?,
                exposure_time: row.get(8)?,
                date_time: row.get(9)?,
                aperture_value: row.get(10)?,
                iso: row.get(11)?,
            },
        },
    ))
}

// Initialize database and tables
pub fn init(conn: &Connection) -> Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS post (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            date_published TEXT,
            date_modified TEXT,
            tags TEXT NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_post_date_published
            ON post (date_published);

        CREATE TABLE IF NOT EXISTS image (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id INTEGER NOT NULL REFERENCES post (id),
            url TEXT NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            file_size INTEGER NOT NULL,
            camera_model TEXT,
            focal_length REAL,
            exposure_time REAL,
            date_time TEXT,
            aperture_value REAL,
            iso INTEGER,
            UNIQUE (post_id, url)
        );
        ",
    )?;

    Ok(())
}

impl IdempotentStore for SqliteStore {
    fn upsert_post(&self, post: &Post) -> Result<PostId> {
        let existed = self.post_id(&post.url)?.is_some();
        let tags = serde_json::to_string(&post.tags)?;
        let published = post.published.map(|d| d.to_rfc3339());
        let modified = post.modified.map(|d| d.to_rfc3339());

        let id: PostId = self.conn.query_row(
            "
            INSERT INTO post (url, title, date_published, date_modified, tags)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                date_published = excluded.date_published,
                date_modified = excluded.date_modified,
                tags = excluded.tags
            RETURNING id
            ",
            params![post.url, post.title, published, modified, tags],
            |row| row.get(0),
        )?;

        if existed {
            debug!(parent: &self.span, url = %post.url, id, "updated post");
        } else {
            info!(parent: &self.span, url = %post.url, id, title = %post.title, "new post");
        }
        Ok(id)
    }

    fn image_exists(&self, post_id: PostId, url: &str) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM image WHERE post_id = ?1 AND url = ?2)",
            params![post_id, url],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn insert_image_if_absent(&self, image: &Image) -> Result<ImageId> {
        let meta = &image.meta;
        let file_size = i64::try_from(meta.file_size).unwrap_or(i64::MAX);

        let affected = self.conn.execute(
            "
            INSERT OR IGNORE INTO image
            (post_id, url, width, height, file_size, camera_model, focal_length,
             exposure_time, date_time, aperture_value, iso)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                image.post_id,
                image.url,
                meta.width,
                meta.height,
                file_size,
                meta.camera_model,
                meta.focal_length,
                meta.exposure_time,
                meta.date_time,
                meta.aperture_value,
                meta.iso
            ],
        )?;

        if affected > 0 {
            let id = self.conn.last_insert_rowid();
            info!(parent: &self.span, url = %image.url, post_id = image.post_id, id, "new image");
            return Ok(id);
        }

        let id = self.conn.query_row(
            "SELECT id FROM image WHERE post_id = ?1 AND url = ?2",
            params![image.post_id, image.url],
            |row| row.get(0),
        )?;
        debug!(parent: &self.span, url = %image.url, id, "image already recorded");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn post(url: &str, title: &str) -> Post {
        Post {
            url: url.to_string(),
            title: title.to_string(),
            published: Some(DateTime::parse_from_rfc3339("2011-03-14T09:30:00+03:00").unwrap()),
            modified: None,
            tags: vec!["moscow".into(), "metro".into()],
        }
    }

    fn image(post_id: PostId, url: &str, width: u32) -> Image {
        Image {
            post_id,
            url: url.to_string(),
            meta: ImageMeta {
                width,
                height: 600,
                file_size: 123_456,
                camera_model: Some("Canon EOS 5D".into()),
                focal_length: Some(24.0),
                exposure_time: Some(0.008),
                date_time: None,
                aperture_value: Some(8.0),
                iso: Some(200),
            },
        }
    }

    #[test]
    fn upsert_post_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.upsert_post(&post("http://blog/1.html", "Metro")).unwrap();
        let second = store.upsert_post(&post("http://blog/1.html", "Metro")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn upsert_post_keeps_id_and_takes_new_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.upsert_post(&post("http://blog/1.html", "Old")).unwrap();

        let mut updated = post("http://blog/1.html", "New title");
        updated.tags = vec!["city".into()];
        updated.modified = Some(DateTime::parse_from_rfc3339("2012-01-01T00:00:00+00:00").unwrap());
        assert_eq!(store.upsert_post(&updated).unwrap(), id);

        let (stored_id, stored) = store.get_post("http://blog/1.html").unwrap().unwrap();
        assert_eq!(stored_id, id);
        assert_eq!(stored, updated);
    }

    #[test]
    fn timestamps_are_stored_as_rfc3339() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_post(&post("http://blog/1.html", "Metro")).unwrap();

        let raw: String = store
            .conn
            .query_row("SELECT date_published FROM post", [], |row| row.get(0))
            .unwrap();
        assert_eq!(raw, "2011-03-14T09:30:00+03:00");

        let (_, stored) = store.get_post("http://blog/1.html").unwrap().unwrap();
        assert_eq!(stored.published, post("http://blog/1.html", "Metro").published);
    }

    #[test]
    fn distinct_urls_get_distinct_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.upsert_post(&post("http://blog/a.html", "A")).unwrap();
        let b = store.upsert_post(&post("http://blog/b.html", "B")).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.post_id("http://blog/b.html").unwrap(), Some(b));
        assert_eq!(store.post_id("http://blog/c.html").unwrap(), None);
    }

    #[test]
    fn images_are_write_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let post_id = store.upsert_post(&post("http://blog/1.html", "Metro")).unwrap();

        assert!(!store.image_exists(post_id, "http://img/1.jpg").unwrap());
        let first = store
            .insert_image_if_absent(&image(post_id, "http://img/1.jpg", 800))
            .unwrap();
        assert!(store.image_exists(post_id, "http://img/1.jpg").unwrap());

        let second = store
            .insert_image_if_absent(&image(post_id, "http://img/1.jpg", 1024))
            .unwrap();
        assert_eq!(first, second);

        let (_, stored) = store.get_image(post_id, "http://img/1.jpg").unwrap().unwrap();
        assert_eq!(stored, image(post_id, "http://img/1.jpg", 800));
        assert_eq!(store.count_images().unwrap(), 1);
    }

    #[test]
    fn same_image_url_under_two_posts_is_two_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.upsert_post(&post("http://blog/a.html", "A")).unwrap();
        let b = store.upsert_post(&post("http://blog/b.html", "B")).unwrap();

        store.insert_image_if_absent(&image(a, "http://img/shared.jpg", 640)).unwrap();
        assert!(!store.image_exists(b, "http://img/shared.jpg").unwrap());
        store.insert_image_if_absent(&image(b, "http://img/shared.jpg", 640)).unwrap();
        assert_eq!(store.count_images().unwrap(), 2);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("crawler.db");

        let id = {
            let store = SqliteStore::open(&path).unwrap();
            let id = store.upsert_post(&post("http://blog/1.html", "Metro")).unwrap();
            store.insert_image_if_absent(&image(id, "http://img/1.jpg", 800)).unwrap();
            id
        };

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.post_id("http://blog/1.html").unwrap(), Some(id));
        assert!(store.image_exists(id, "http://img/1.jpg").unwrap());
    }
}
