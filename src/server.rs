use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{ConnectInfo, DefaultBodyLimit, FromRequest, Multipart, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::any,
};
use axum_extra::extract::CookieJar;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::cover::CoverNormalizer;
use crate::editor::{MetadataEditor, UpdateSongRequest};
use crate::error::{ApiError, error_page, fault_response, wants_json};
use crate::intake::FileIntake;
use crate::library::SongLibrary;
use crate::playlist::PlaylistReader;
use crate::rate_limit::RateLimiter;
use crate::session::{SessionStore, session_cookie, session_id_from};
use crate::upload::{UploadContext, Uploader};

const CSRF_PLACEHOLDER: &str = "{{csrf_token}}";

#[derive(Clone)]
pub struct AppState {
    pub library: SongLibrary,
    pub playlist: PlaylistReader,
    pub sessions: SessionStore,
    pub uploader: Uploader,
    pub editor: MetadataEditor,
    pub static_dir: PathBuf,
}

impl AppState {
    /// Open the database, create tables and the upload directory.
    pub async fn new(settings: &Settings) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.upload_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create upload directory: {}",
                    settings.upload_dir.display()
                )
            })?;

        let pool = crate::db::connect(&settings.database).await?;

        let library = SongLibrary::new(pool.clone()).await?;
        let sessions = SessionStore::new(pool.clone()).await?;
        let rate_limiter = RateLimiter::new(
            pool,
            settings.rate_limit_count,
            settings.rate_limit_window,
        )
        .await?;

        let playlist = PlaylistReader::new(library.clone(), settings.public_prefix.clone());
        let intake = FileIntake::new(
            settings.upload_dir.clone(),
            settings.audio_extensions(),
            settings.max_song_size,
            settings.max_cover_size,
        )
        .with_transport_limit(settings.body_limit() as u64);
        let normalizer = CoverNormalizer::new(
            settings.cover_max_width,
            settings.cover_max_height,
            settings.cover_jpeg_quality,
        );

        let uploader = Uploader::new(
            rate_limiter,
            sessions.clone(),
            intake,
            normalizer,
            library.clone(),
            playlist.clone(),
        );
        let editor = MetadataEditor::new(sessions.clone(), library.clone());

        Ok(Self {
            library,
            playlist,
            sessions,
            uploader,
            editor,
            static_dir: settings.static_dir.clone(),
        })
    }
}

pub fn create_router(state: AppState, settings: &Settings) -> Router {
    let public_prefix = settings.public_prefix.trim_matches('/');
    let uploads_service = ServeDir::new(&settings.upload_dir);
    let assets_service = ServeDir::new(settings.static_dir.join("assets"));

    Router::new()
        .route("/", any(dispatch))
        .nest_service(&format!("/{public_prefix}"), uploads_service)
        .nest_service("/assets", assets_service)
        .layer(DefaultBodyLimit::max(settings.body_limit()))
        .layer(middleware::from_fn(catch_faults))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ActionQuery {
    action: Option<String>,
}

/// All actions share `/` and are selected by `?action=`.
async fn dispatch(
    State(state): State<AppState>,
    Query(query): Query<ActionQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    jar: CookieJar,
    request: Request,
) -> Response {
    let action = query.action.as_deref().unwrap_or("showPlayer");
    let session_id = session_id_from(&jar);
    tracing::debug!("Dispatching action {}", action);

    match action {
        "showPlayer" => show_player(&state, jar, session_id.as_deref()).await,
        "getPlaylist" => get_playlist(&state).await.into_response(),
        "uploadSong" => {
            let ctx = UploadContext {
                client_address: connect_info
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                session_id,
            };
            upload_song(&state, ctx, request).await.into_response()
        }
        "updateSongMetadata" => update_song_metadata(&state, session_id.as_deref(), request)
            .await
            .into_response(),
        other => {
            tracing::warn!("Unknown action: {}", other);
            (StatusCode::NOT_FOUND, "Page not found.").into_response()
        }
    }
}

/// The player page with the session's CSRF token embedded.
async fn show_player(state: &AppState, jar: CookieJar, session_id: Option<&str>) -> Response {
    let session = match state.sessions.ensure(session_id).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Failed to prepare session: {:#}", e);
            return error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Oops! Something went wrong on our end.",
                "Please try again later.",
            );
        }
    };

    let template_path = state.static_dir.join("player.html");
    let template = match tokio::fs::read_to_string(&template_path).await {
        Ok(template) => template,
        Err(e) => {
            tracing::error!(
                "Player template not found at {}: {}",
                template_path.display(),
                e
            );
            return error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Oops! Something went wrong on our end.",
                "The player page is unavailable.",
            );
        }
    };

    let page = template.replace(CSRF_PLACEHOLDER, &session.csrf_token);
    (jar.add(session_cookie(&session)), Html(page)).into_response()
}

async fn get_playlist(state: &AppState) -> Result<Json<serde_json::Value>, ApiError> {
    let songs = state
        .playlist
        .list()
        .await
        .map_err(|e| ApiError::server("Could not retrieve playlist due to a server error.", e))?;

    Ok(Json(json!({
        "status": "success",
        "data": { "songs": songs },
    })))
}

async fn upload_song(
    state: &AppState,
    ctx: UploadContext,
    request: Request,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    // Every attempt counts, including ones whose body turns out unusable.
    state.uploader.admit(&ctx).await?;

    let multipart = Multipart::from_request(request, state).await.map_err(|e| {
        tracing::warn!("Rejected upload body: {}", e.body_text());
        ApiError::invalid("Expected a multipart/form-data upload.")
    })?;

    let outcome = state.uploader.upload(&ctx, multipart).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "message": outcome.message,
            "data": { "song": outcome.song },
            "csrf_token": outcome.csrf_token,
        })),
    ))
}

async fn update_song_metadata(
    state: &AppState,
    session_id: Option<&str>,
    request: Request,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = Json::<UpdateSongRequest>::from_request(request, state)
        .await
        .map_err(|e| {
            tracing::warn!("Rejected metadata update body: {}", e.body_text());
            ApiError::invalid("Invalid JSON request body.")
        })?;

    let (outcome, csrf_token) = state.editor.update(session_id, body).await?;

    Ok(Json(json!({
        "status": "success",
        "message": outcome.message(),
        "csrf_token": csrf_token,
    })))
}

/// Turn a panicking handler into a well-formed 500 instead of a dropped connection.
async fn catch_faults(request: Request, next: Next) -> Response {
    let json_context = wants_json(request.uri(), request.headers());
    let uri = request.uri().clone();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Handler panicked while serving {}: {}", uri, detail);
            fault_response(json_context)
        }
    }
}
