//! End-to-end handling of a single song upload.
//!
//! Files are written before the database row, so a failure can leave files behind but
//! never a row pointing at a missing file. If the insert itself fails, every file
//! written for the request is removed again.

use axum::extract::Multipart;
use axum::extract::multipart::Field;
use axum::http::StatusCode;

use crate::cover::CoverNormalizer;
use crate::error::ApiError;
use crate::intake::{
    FileIntake, FileRole, IntakeError, StoredFile, TransportError, UploadedBlob, mib_ceil,
    remove_quietly,
};
use crate::library::{NewSong, Song, SongLibrary};
use crate::playlist::PlaylistReader;
use crate::rate_limit::RateLimiter;
use crate::session::SessionStore;
use crate::validation::validate_upload;

/// Who is uploading.
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub client_address: String,
    pub session_id: Option<String>,
}

/// The parsed multipart form of an upload.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub lyrics: Option<String>,
    pub csrf_token: Option<String>,
    pub song: Option<UploadedBlob>,
    pub cover: Option<UploadedBlob>,
}

impl UploadForm {
    /// Read every part of the request. File parts are buffered up to their size ceiling.
    pub async fn read(
        mut multipart: Multipart,
        max_song_size: u64,
        max_cover_size: u64,
        transport_limit: u64,
    ) -> Result<Self, ApiError> {
        let mut form = UploadForm::default();

        loop {
            let mut field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                    tracing::warn!("Upload body exceeds the server limit: {}", e);
                    return Err(IntakeError::TransportLimit {
                        label: "Upload",
                        max_mib: mib_ceil(transport_limit),
                    }
                    .into());
                }
                Err(e) => {
                    tracing::warn!("Malformed upload body: {}", e);
                    return Err(ApiError::invalid("Malformed upload request."));
                }
            };

            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "song" | "cover" => {
                    let max = if name == "song" {
                        max_song_size
                    } else {
                        max_cover_size
                    };
                    let blob = read_blob(&mut field, max).await;
                    let broken = blob.transport_error.is_some();

                    // An empty file input still sends a part, with no name and no bytes.
                    let present = broken || !blob.file_name.is_empty() || blob.size > 0;
                    if present {
                        if name == "song" {
                            form.song = Some(blob);
                        } else {
                            form.cover = Some(blob);
                        }
                    }

                    // The stream cannot be resumed after a transport error.
                    if broken {
                        break;
                    }
                }
                "title" | "artist" | "lyrics" | "csrf_token" => {
                    let value = field.text().await.map_err(|e| {
                        tracing::warn!("Failed to read form field {}: {}", name, e);
                        ApiError::invalid("Malformed upload request.")
                    })?;
                    match name.as_str() {
                        "title" => form.title = Some(value),
                        "artist" => form.artist = Some(value),
                        "lyrics" => form.lyrics = Some(value),
                        _ => form.csrf_token = Some(value),
                    }
                }
                other => {
                    tracing::debug!("Ignoring unexpected form field: {}", other);
                }
            }
        }

        Ok(form)
    }
}

async fn read_blob(field: &mut Field<'_>, max_size: u64) -> UploadedBlob {
    let mut blob = UploadedBlob {
        file_name: field.file_name().unwrap_or_default().to_string(),
        content_type: field.content_type().map(str::to_string),
        ..Default::default()
    };

    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                blob.size += chunk.len() as u64;
                if blob.size <= max_size {
                    blob.data.extend_from_slice(&chunk);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Transfer of '{}' failed: {}", blob.file_name, e);
                blob.transport_error = Some(if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    TransportError::LimitExceeded
                } else {
                    TransportError::Partial
                });
                break;
            }
        }
    }

    if blob.size > max_size {
        blob.data = Vec::new();
    }
    blob
}

/// A successful upload.
#[derive(Debug)]
pub struct UploadOutcome {
    /// The stored song with public paths.
    pub song: Song,
    pub message: String,
    /// Replacement CSRF token for the session.
    pub csrf_token: String,
}

#[derive(Clone)]
pub struct Uploader {
    rate_limiter: RateLimiter,
    sessions: SessionStore,
    intake: FileIntake,
    normalizer: CoverNormalizer,
    library: SongLibrary,
    playlist: PlaylistReader,
}

impl Uploader {
    pub fn new(
        rate_limiter: RateLimiter,
        sessions: SessionStore,
        intake: FileIntake,
        normalizer: CoverNormalizer,
        library: SongLibrary,
        playlist: PlaylistReader,
    ) -> Self {
        Self {
            rate_limiter,
            sessions,
            intake,
            normalizer,
            library,
            playlist,
        }
    }

    /// Count the attempt against the client's window. Call before touching the body.
    pub async fn admit(&self, ctx: &UploadContext) -> Result<(), ApiError> {
        if self.rate_limiter.check_and_record(&ctx.client_address).await {
            Ok(())
        } else {
            Err(ApiError::RateLimited)
        }
    }

    /// Read and process the form of an admitted request.
    pub async fn upload(
        &self,
        ctx: &UploadContext,
        multipart: Multipart,
    ) -> Result<UploadOutcome, ApiError> {
        let form = UploadForm::read(
            multipart,
            self.intake.max_size(FileRole::Song),
            self.intake.max_size(FileRole::Cover),
            self.intake.transport_limit(),
        )
        .await?;

        self.process(ctx, form).await
    }

    /// Everything after rate limiting: CSRF, fields, files, and the database row.
    pub async fn process(
        &self,
        ctx: &UploadContext,
        form: UploadForm,
    ) -> Result<UploadOutcome, ApiError> {
        let csrf_token = self
            .sessions
            .consume_csrf(ctx.session_id.as_deref(), form.csrf_token.as_deref())
            .await?;

        let song_name = form
            .song
            .as_ref()
            .map(|blob| blob.file_name.as_str())
            .filter(|name| !name.is_empty());
        let fields = validate_upload(
            form.title.as_deref(),
            form.artist.as_deref(),
            form.lyrics.as_deref(),
            song_name,
        )?;

        let song_file = self
            .intake
            .intake(FileRole::Song, form.song.as_ref())
            .await?
            .ok_or(IntakeError::Missing { role: "song" })?;

        let (cover_file, cover_issue) = self.store_cover(form.cover.as_ref()).await;

        let new_song = NewSong {
            title: fields.title,
            artist: fields.artist,
            lyrics: fields.lyrics,
            file: song_file.file_name.clone(),
            cover: cover_file
                .as_ref()
                .map(|c| c.file_name.clone())
                .unwrap_or_default(),
        };

        let song = match self.library.insert(new_song).await {
            Ok(song) => song,
            Err(e) => {
                remove_quietly(&song_file.path).await;
                if let Some(cover) = &cover_file {
                    remove_quietly(&cover.path).await;
                }
                return Err(ApiError::server(
                    "Could not save song details to database.",
                    e,
                ));
            }
        };

        tracing::info!(
            "Upload from {} stored as song {} ({})",
            ctx.client_address,
            song.id,
            song.file
        );

        let mut message = "File uploaded successfully".to_string();
        if let Some(issue) = cover_issue {
            message.push_str(&format!(" (Note: Cover upload issue: {issue})"));
        }

        Ok(UploadOutcome {
            song: self.playlist.publish(song),
            message,
            csrf_token,
        })
    }

    /// Cover intake and normalization. Failures become a note, never an error.
    async fn store_cover(&self, blob: Option<&UploadedBlob>) -> (Option<StoredFile>, Option<String>) {
        match self.intake.intake(FileRole::Cover, blob).await {
            Ok(Some(stored)) => {
                match self.normalizer.normalize(&stored.path, &stored.mime_type).await {
                    Ok(normalized) => tracing::debug!(
                        "Cover {} normalized to {}x{}",
                        stored.file_name,
                        normalized.width,
                        normalized.height
                    ),
                    Err(reason) => tracing::warn!(
                        "Cover image optimization skipped for {}, original will be used: {}",
                        stored.file_name,
                        reason
                    ),
                }
                (Some(stored), None)
            }
            Ok(None) => (None, None),
            Err(e) => {
                match &e {
                    IntakeError::Storage { source, .. } => {
                        tracing::error!("Failed to store cover image: {}", source)
                    }
                    other => tracing::warn!("Cover rejected: {}", other),
                }
                (None, Some(e.to_string()))
            }
        }
    }
}
