use clap::Parser;
use std::path::PathBuf;

const MIB: u64 = 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "music-dock")]
#[command(about = "Self-hosted web audio player", long_about = None)]
pub struct Settings {
    /// Path to the SQLite database file
    #[arg(long, env = "MUSIC_DOCK_DATABASE", default_value = "data/music-dock.db")]
    pub database: PathBuf,

    /// Directory where uploaded songs and covers are stored
    #[arg(long, env = "MUSIC_DOCK_UPLOAD_DIR", default_value = "public/uploads")]
    pub upload_dir: PathBuf,

    /// URL prefix under which the upload directory is served
    #[arg(long, default_value = "uploads")]
    pub public_prefix: String,

    /// Directory holding player.html and the assets/ folder
    #[arg(long, env = "MUSIC_DOCK_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on
    #[arg(short, long, env = "MUSIC_DOCK_PORT", default_value = "3000")]
    pub port: u16,

    /// Maximum upload attempts per address inside the window
    #[arg(long, default_value = "10")]
    pub rate_limit_count: i64,

    /// Rate limit window in seconds
    #[arg(long, default_value = "3600")]
    pub rate_limit_window: i64,

    /// Accepted audio file extensions
    #[arg(long, value_delimiter = ',', default_value = "mp3,aac,m4a,ogg")]
    pub audio_extensions: Vec<String>,

    /// Maximum song file size in bytes
    #[arg(long, default_value_t = 64 * MIB)]
    pub max_song_size: u64,

    /// Maximum cover image size in bytes
    #[arg(long, default_value_t = 5 * MIB)]
    pub max_cover_size: u64,

    #[arg(long, default_value = "500")]
    pub cover_max_width: u32,

    #[arg(long, default_value = "500")]
    pub cover_max_height: u32,

    /// JPEG quality used when re-encoding cover art (1-100)
    #[arg(long, default_value = "75", value_parser = clap::value_parser!(u8).range(1..=100))]
    pub cover_jpeg_quality: u8,
}

impl Settings {
    /// Request body ceiling: both files plus room for the text fields.
    pub fn body_limit(&self) -> usize {
        (self.max_song_size + self.max_cover_size + MIB) as usize
    }

    pub fn audio_extensions(&self) -> Vec<String> {
        self.audio_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(root: &std::path::Path) -> Self {
        let path = |name: &str| root.join(name).display().to_string();
        Self::parse_from([
            "music-dock".to_string(),
            "--database".to_string(),
            path("music-dock.db"),
            "--upload-dir".to_string(),
            path("uploads"),
            "--static-dir".to_string(),
            path("static"),
        ])
    }
}
