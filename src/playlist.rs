use anyhow::Result;

use crate::library::{Song, SongLibrary};

/// Read side of the library: songs shaped for the client.
#[derive(Clone)]
pub struct PlaylistReader {
    library: SongLibrary,
    public_prefix: String,
}

impl PlaylistReader {
    pub fn new(library: SongLibrary, public_prefix: impl Into<String>) -> Self {
        let public_prefix = public_prefix.into().trim_matches('/').to_string();
        Self {
            library,
            public_prefix,
        }
    }

    /// A fresh snapshot of every song, newest first, with servable paths.
    pub async fn list(&self) -> Result<Vec<Song>> {
        let songs = self.library.list().await?;
        tracing::debug!("Returning {} songs", songs.len());
        Ok(songs.into_iter().map(|song| self.publish(song)).collect())
    }

    /// Rewrite `file` and `cover` relative to the public serving root.
    pub fn publish(&self, mut song: Song) -> Song {
        song.file = public_path(&self.public_prefix, &song.file);
        song.cover = public_path(&self.public_prefix, &song.cover);
        song
    }
}

/// `<prefix>/<name>`, unless `stored` is empty or already carries the prefix.
pub fn public_path(prefix: &str, stored: &str) -> String {
    if stored.is_empty() {
        return String::new();
    }
    if prefix.is_empty() {
        return stored.to_string();
    }

    let stored = stored.trim_start_matches('/');
    match stored.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => stored.to_string(),
        _ => format!("{prefix}/{stored}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::NewSong;

    #[test]
    fn paths_are_prefixed_once() {
        assert_eq!(public_path("uploads", "a_1.mp3"), "uploads/a_1.mp3");
        assert_eq!(public_path("uploads", "uploads/a_1.mp3"), "uploads/a_1.mp3");
        assert_eq!(public_path("uploads", "/uploads/a_1.mp3"), "uploads/a_1.mp3");
        assert_eq!(public_path("uploads", "uploadsfoo.mp3"), "uploads/uploadsfoo.mp3");
        assert_eq!(public_path("uploads", ""), "");
    }

    #[tokio::test]
    async fn list_publishes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(dir.path().join("test.db")).await.unwrap();
        let library = SongLibrary::new(pool).await.unwrap();
        library
            .insert(NewSong {
                title: "t".into(),
                artist: "a".into(),
                lyrics: String::new(),
                file: "t_1.mp3".into(),
                cover: "uploads/t_1.png".into(),
            })
            .await
            .unwrap();

        let reader = PlaylistReader::new(library, "/uploads/");
        let songs = reader.list().await.unwrap();
        assert_eq!(songs[0].file, "uploads/t_1.mp3");
        assert_eq!(songs[0].cover, "uploads/t_1.png");
    }
}
