use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// A stored song. `file` and `cover` hold file names inside the upload directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Song {
    pub id: i64,
    pub title: String,
    pub file: String,
    pub cover: String,
    pub artist: String,
    pub lyrics: String,
    pub uploaded_at: String,
}

#[derive(Debug, Clone)]
pub struct NewSong {
    pub title: String,
    pub artist: String,
    pub lyrics: String,
    pub file: String,
    pub cover: String,
}

/// Outcome of a conditional metadata update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    Unchanged,
    NotFound,
}

#[derive(Clone)]
pub struct SongLibrary {
    pool: SqlitePool,
}

impl SongLibrary {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS songs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                file TEXT NOT NULL,
                cover TEXT NOT NULL DEFAULT '',
                artist TEXT NOT NULL,
                lyrics TEXT NOT NULL DEFAULT '',
                uploaded_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create songs table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_songs_uploaded_at
            ON songs(uploaded_at)
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create index")?;

        Ok(Self { pool })
    }

    /// Insert a song row; this is the last step of an upload.
    pub async fn insert(&self, song: NewSong) -> Result<Song> {
        let uploaded_at =
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO songs (title, file, cover, artist, lyrics, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&song.title)
        .bind(&song.file)
        .bind(&song.cover)
        .bind(&song.artist)
        .bind(&song.lyrics)
        .bind(&uploaded_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert song")?;

        tracing::info!("Stored song {} ({})", id, song.title);

        Ok(Song {
            id,
            title: song.title,
            file: song.file,
            cover: song.cover,
            artist: song.artist,
            lyrics: song.lyrics,
            uploaded_at,
        })
    }

    /// All songs, newest first.
    pub async fn list(&self) -> Result<Vec<Song>> {
        sqlx::query_as::<_, Song>(
            r#"
            SELECT id, title, file, cover, artist, lyrics, uploaded_at
            FROM songs
            ORDER BY uploaded_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch songs")
    }

    pub async fn get(&self, id: i64) -> Result<Option<Song>> {
        sqlx::query_as::<_, Song>(
            r#"
            SELECT id, title, file, cover, artist, lyrics, uploaded_at
            FROM songs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch song")
    }

    pub async fn exists(&self, id: i64) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM songs WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check song existence")?;

        Ok(count > 0)
    }

    /// Update title, artist and lyrics. Rows whose values already match are not touched.
    pub async fn update_metadata(
        &self,
        id: i64,
        title: &str,
        artist: &str,
        lyrics: &str,
    ) -> Result<UpdateOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE songs
            SET title = ?, artist = ?, lyrics = ?
            WHERE id = ? AND (title IS NOT ? OR artist IS NOT ? OR lyrics IS NOT ?)
            "#,
        )
        .bind(title)
        .bind(artist)
        .bind(lyrics)
        .bind(id)
        .bind(title)
        .bind(artist)
        .bind(lyrics)
        .execute(&self.pool)
        .await
        .context("Failed to update song")?;

        if result.rows_affected() > 0 {
            return Ok(UpdateOutcome::Updated);
        }

        if self.exists(id).await? {
            Ok(UpdateOutcome::Unchanged)
        } else {
            Ok(UpdateOutcome::NotFound)
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
