use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{migrate::MigrateDatabase, FromRow, Pool, Row, Sqlite, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::models::{
    DiscoveryResult, LibraryItem, LibraryItemKind, SmartCriteria, ThumbnailStatus, Video,
};

/// Thin adapter over the persistence engine. Readers may run concurrently;
/// SQLite serializes writers underneath the pool.
#[derive(Clone)]
pub struct Catalog {
    pool: Pool<Sqlite>,
}

#[derive(Debug, FromRow)]
struct VideoRow {
    id: String,
    url: String,
    title: String,
    duration: f64,
    width: Option<i64>,
    height: Option<i64>,
    frame_rate: Option<f64>,
    codec_tag: Option<String>,
    bitrate: Option<i64>,
    file_size: Option<i64>,
    custom_metadata: String,
    date_added: DateTime<Utc>,
    date_modified: DateTime<Utc>,
    thumbnail_url: Option<String>,
    mosaic_url: Option<String>,
    preview_url: Option<String>,
    thumbnail_status: String,
    relative_path: String,
}

impl TryFrom<VideoRow> for Video {
    type Error = anyhow::Error;

    fn try_from(row: VideoRow) -> Result<Self> {
        let custom_metadata: BTreeMap<String, String> =
            serde_json::from_str(&row.custom_metadata).unwrap_or_default();
        Ok(Video {
            id: Uuid::parse_str(&row.id)?,
            url: row.url,
            title: row.title,
            duration: row.duration,
            width: row.width.map(|w| w as u32),
            height: row.height.map(|h| h as u32),
            frame_rate: row.frame_rate,
            codec_tag: row.codec_tag,
            bitrate: row.bitrate,
            file_size: row.file_size,
            custom_metadata,
            date_added: row.date_added,
            date_modified: row.date_modified,
            thumbnail_url: row.thumbnail_url,
            mosaic_url: row.mosaic_url,
            preview_url: row.preview_url,
            thumbnail_status: ThumbnailStatus::try_from(row.thumbnail_status.as_str())
                .map_err(|e| anyhow::anyhow!(e))?,
            relative_path: row.relative_path,
        })
    }
}

#[derive(Debug, FromRow)]
struct LibraryItemRow {
    id: String,
    name: String,
    item_type: String,
    url: Option<String>,
    parent_id: Option<String>,
    smart_criteria: Option<String>,
    date_created: DateTime<Utc>,
    date_modified: DateTime<Utc>,
    last_refresh: Option<DateTime<Utc>>,
}

impl TryFrom<LibraryItemRow> for LibraryItem {
    type Error = anyhow::Error;

    fn try_from(row: LibraryItemRow) -> Result<Self> {
        let smart_criteria = match row.smart_criteria {
            Some(ref json) => Some(serde_json::from_str::<SmartCriteria>(json)?),
            None => None,
        };
        Ok(LibraryItem {
            id: Uuid::parse_str(&row.id)?,
            name: row.name,
            kind: LibraryItemKind::try_from(row.item_type.as_str())
                .map_err(|e| anyhow::anyhow!(e))?,
            url: row.url,
            parent_id: row
                .parent_id
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()?,
            smart_criteria,
            date_created: row.date_created,
            date_modified: row.date_modified,
            last_refresh: row.last_refresh,
        })
    }
}

impl Catalog {
    pub async fn new(database_url: &str) -> Result<Self> {
        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            info!("Creating catalog database: {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory catalog for tests. A single connection keeps every query
    /// on the same memory database.
    pub async fn in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn upsert_video(&self, video: &Video) -> Result<()> {
        let custom_metadata = serde_json::to_string(&video.custom_metadata)?;
        sqlx::query(
            r#"
            INSERT INTO videos (
                id, url, title, duration, width, height, frame_rate,
                codec_tag, bitrate, file_size, custom_metadata,
                date_added, date_modified, thumbnail_url, mosaic_url,
                preview_url, thumbnail_status, relative_path
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                duration = excluded.duration,
                width = excluded.width,
                height = excluded.height,
                frame_rate = excluded.frame_rate,
                codec_tag = excluded.codec_tag,
                bitrate = excluded.bitrate,
                file_size = excluded.file_size,
                custom_metadata = excluded.custom_metadata,
                date_modified = excluded.date_modified,
                thumbnail_url = excluded.thumbnail_url,
                mosaic_url = excluded.mosaic_url,
                preview_url = excluded.preview_url,
                thumbnail_status = excluded.thumbnail_status,
                relative_path = excluded.relative_path
            "#,
        )
        .bind(video.id.to_string())
        .bind(&video.url)
        .bind(&video.title)
        .bind(video.duration)
        .bind(video.width.map(|w| w as i64))
        .bind(video.height.map(|h| h as i64))
        .bind(video.frame_rate)
        .bind(&video.codec_tag)
        .bind(video.bitrate)
        .bind(video.file_size)
        .bind(custom_metadata)
        .bind(video.date_added)
        .bind(video.date_modified)
        .bind(&video.thumbnail_url)
        .bind(&video.mosaic_url)
        .bind(&video.preview_url)
        .bind(video.thumbnail_status.as_str())
        .bind(&video.relative_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Batch save; the coordinator calls this once per processed batch.
    pub async fn upsert_videos(&self, videos: &[Video]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for video in videos {
            let custom_metadata = serde_json::to_string(&video.custom_metadata)?;
            sqlx::query(
                r#"
                INSERT INTO videos (
                    id, url, title, duration, width, height, frame_rate,
                    codec_tag, bitrate, file_size, custom_metadata,
                    date_added, date_modified, thumbnail_url, mosaic_url,
                    preview_url, thumbnail_status, relative_path
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(url) DO UPDATE SET
                    title = excluded.title,
                    duration = excluded.duration,
                    width = excluded.width,
                    height = excluded.height,
                    frame_rate = excluded.frame_rate,
                    codec_tag = excluded.codec_tag,
                    bitrate = excluded.bitrate,
                    file_size = excluded.file_size,
                    custom_metadata = excluded.custom_metadata,
                    date_modified = excluded.date_modified,
                    thumbnail_url = excluded.thumbnail_url,
                    mosaic_url = excluded.mosaic_url,
                    preview_url = excluded.preview_url,
                    thumbnail_status = excluded.thumbnail_status,
                    relative_path = excluded.relative_path
                "#,
            )
            .bind(video.id.to_string())
            .bind(&video.url)
            .bind(&video.title)
            .bind(video.duration)
            .bind(video.width.map(|w| w as i64))
            .bind(video.height.map(|h| h as i64))
            .bind(video.frame_rate)
            .bind(&video.codec_tag)
            .bind(video.bitrate)
            .bind(video.file_size)
            .bind(custom_metadata)
            .bind(video.date_added)
            .bind(video.date_modified)
            .bind(&video.thumbnail_url)
            .bind(&video.mosaic_url)
            .bind(&video.preview_url)
            .bind(video.thumbnail_status.as_str())
            .bind(&video.relative_path)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn fetch_video(&self, url: &str) -> Result<Option<Video>> {
        let row = sqlx::query_as::<_, VideoRow>("SELECT * FROM videos WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Video::try_from).transpose()
    }

    pub async fn fetch_video_by_id(&self, id: Uuid) -> Result<Option<Video>> {
        let row = sqlx::query_as::<_, VideoRow>("SELECT * FROM videos WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Video::try_from).transpose()
    }

    pub async fn fetch_all_videos(&self) -> Result<Vec<Video>> {
        let rows = sqlx::query_as::<_, VideoRow>("SELECT * FROM videos ORDER BY url")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Video::try_from).collect()
    }

    /// Predicate walk over all catalog records.
    pub async fn fetch_videos(&self, criteria: &SmartCriteria) -> Result<Vec<Video>> {
        let all = self.fetch_all_videos().await?;
        Ok(all.into_iter().filter(|v| criteria.matches(v)).collect())
    }

    pub async fn fetch_videos_under(&self, url_prefix: &str) -> Result<Vec<Video>> {
        let pattern = format!("{}%", url_prefix);
        let rows = sqlx::query_as::<_, VideoRow>(
            "SELECT * FROM videos WHERE url LIKE ? ORDER BY url",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Video::try_from).collect()
    }

    /// Which of `urls` are already registered. Issued in chunks so the
    /// coordinator avoids one round trip per url.
    pub async fn existing_urls(&self, urls: &[String]) -> Result<HashSet<String>> {
        let mut existing = HashSet::new();
        for chunk in urls.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("SELECT url FROM videos WHERE url IN ({})", placeholders);
            let mut query = sqlx::query(&sql);
            for url in chunk {
                query = query.bind(url);
            }
            let rows = query.fetch_all(&self.pool).await?;
            for row in rows {
                existing.insert(row.get::<String, _>("url"));
            }
        }
        Ok(existing)
    }

    pub async fn delete_video_by_url(&self, url: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM videos WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_video_by_id(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM videos WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cascade delete of videos and folder rows under a path prefix.
    pub async fn delete_by_url_prefix(&self, url_prefix: &str) -> Result<u64> {
        let pattern = format!("{}%", url_prefix);
        let mut tx = self.pool.begin().await?;
        let videos = sqlx::query("DELETE FROM videos WHERE url LIKE ?")
            .bind(&pattern)
            .execute(&mut *tx)
            .await?;
        let folders = sqlx::query("DELETE FROM library_items WHERE url LIKE ?")
            .bind(&pattern)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(videos.rows_affected() + folders.rows_affected())
    }

    pub async fn upsert_folder(&self, item: &LibraryItem) -> Result<()> {
        let criteria = item
            .smart_criteria
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO library_items (
                id, name, item_type, url, parent_id, smart_criteria,
                date_created, date_modified, last_refresh
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                parent_id = excluded.parent_id,
                smart_criteria = excluded.smart_criteria,
                date_modified = excluded.date_modified,
                last_refresh = excluded.last_refresh
            "#,
        )
        .bind(item.id.to_string())
        .bind(&item.name)
        .bind(item.kind.as_str())
        .bind(&item.url)
        .bind(item.parent_id.map(|id| id.to_string()))
        .bind(criteria)
        .bind(item.date_created)
        .bind(item.date_modified)
        .bind(item.last_refresh)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_folder(
        &self,
        url: &str,
        kind: LibraryItemKind,
    ) -> Result<Option<LibraryItem>> {
        let row = sqlx::query_as::<_, LibraryItemRow>(
            "SELECT * FROM library_items WHERE url = ? AND item_type = ?",
        )
        .bind(url)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(LibraryItem::try_from).transpose()
    }

    pub async fn update_thumbnail(
        &self,
        id: Uuid,
        thumbnail_url: Option<&str>,
        status: ThumbnailStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE videos SET thumbnail_url = ?, thumbnail_status = ? WHERE id = ?")
            .bind(thumbnail_url)
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_mosaic_url(&self, id: Uuid, mosaic_url: &str) -> Result<()> {
        sqlx::query("UPDATE videos SET mosaic_url = ? WHERE id = ?")
            .bind(mosaic_url)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_preview_url(&self, id: Uuid, preview_url: &str) -> Result<()> {
        sqlx::query("UPDATE videos SET preview_url = ? WHERE id = ?")
            .bind(preview_url)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_discovery_run(&self, root_url: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO discovery_runs (root_url, status) VALUES (?, 'running')")
            .bind(root_url)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn complete_discovery_run(
        &self,
        run_id: i64,
        result: &DiscoveryResult,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE discovery_runs SET
                completed_at = datetime('now'),
                videos_added = ?,
                videos_updated = ?,
                videos_removed = ?,
                folders_created = ?,
                error_count = ?,
                status = ?
            WHERE id = ?
            "#,
        )
        .bind(result.added as i64)
        .bind(result.updated as i64)
        .bind(result.removed as i64)
        .bind(result.created_folders as i64)
        .bind(result.errors.len() as i64)
        .bind(status)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_keyed_by_url() {
        let catalog = Catalog::in_memory().await.unwrap();
        let mut video = Video::new("/library/a.mp4".to_string());
        video.duration = 60.0;
        catalog.upsert_video(&video).await.unwrap();

        video.duration = 120.0;
        catalog.upsert_video(&video).await.unwrap();

        let fetched = catalog.fetch_video("/library/a.mp4").await.unwrap().unwrap();
        assert_eq!(fetched.id, video.id);
        assert_eq!(fetched.duration, 120.0);
        assert_eq!(catalog.fetch_all_videos().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn existing_urls_reports_known_paths() {
        let catalog = Catalog::in_memory().await.unwrap();
        catalog
            .upsert_video(&Video::new("/library/a.mp4".to_string()))
            .await
            .unwrap();

        let urls = vec![
            "/library/a.mp4".to_string(),
            "/library/b.mp4".to_string(),
        ];
        let existing = catalog.existing_urls(&urls).await.unwrap();
        assert!(existing.contains("/library/a.mp4"));
        assert!(!existing.contains("/library/b.mp4"));
    }

    #[tokio::test]
    async fn prefix_delete_cascades_to_folders() {
        let catalog = Catalog::in_memory().await.unwrap();
        catalog
            .upsert_video(&Video::new("/library/sub/a.mp4".to_string()))
            .await
            .unwrap();
        catalog
            .upsert_folder(&LibraryItem::folder(
                "sub".to_string(),
                "/library/sub".to_string(),
                None,
            ))
            .await
            .unwrap();
        catalog
            .upsert_video(&Video::new("/other/b.mp4".to_string()))
            .await
            .unwrap();

        let removed = catalog.delete_by_url_prefix("/library").await.unwrap();
        assert_eq!(removed, 2);
        assert!(catalog.fetch_video("/other/b.mp4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn smart_criteria_filter_applies_predicate() {
        let catalog = Catalog::in_memory().await.unwrap();
        let mut big = Video::new("/library/big.mp4".to_string());
        big.file_size = Some(2_000_000_000);
        let mut small = Video::new("/library/small.mp4".to_string());
        small.file_size = Some(1_000);
        catalog.upsert_videos(&[big, small]).await.unwrap();

        let criteria = SmartCriteria {
            min_size: Some(1_073_741_824),
            ..Default::default()
        };
        let matched = catalog.fetch_videos(&criteria).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].url, "/library/big.mp4");
    }
}
