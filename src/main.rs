use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use music_dock::config::Settings;
use music_dock::server::{self, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let settings = Settings::parse();

    tracing::info!("Starting Music Dock");
    tracing::info!("Database: {}", settings.database.display());
    tracing::info!("Upload directory: {}", settings.upload_dir.display());
    tracing::info!("Static directory: {}", settings.static_dir.display());

    let state = AppState::new(&settings)
        .await
        .context("Failed to initialize application state")?;

    let app = server::create_router(state, &settings);
    let addr = format!("{}:{}", settings.bind, settings.port);

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /?action=showPlayer          - Player page");
    tracing::info!("  GET  /?action=getPlaylist         - List all songs");
    tracing::info!("  POST /?action=uploadSong          - Upload a song (multipart)");
    tracing::info!("  POST /?action=updateSongMetadata  - Edit song metadata (JSON)");
    tracing::info!("  GET  /{}/<file>              - Uploaded media", settings.public_prefix);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
