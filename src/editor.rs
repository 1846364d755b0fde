use serde::Deserialize;

use crate::error::ApiError;
use crate::library::{SongLibrary, UpdateOutcome};
use crate::session::SessionStore;
use crate::validation::validate_edit;

/// JSON body of `updateSongMetadata`. Presence and shape are checked by the validator.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateSongRequest {
    pub song_id: Option<serde_json::Value>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub lyrics: Option<String>,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Updated,
    NoChanges,
}

impl EditOutcome {
    pub fn message(self) -> &'static str {
        match self {
            EditOutcome::Updated => "Song metadata updated successfully.",
            EditOutcome::NoChanges => "No changes detected in song metadata.",
        }
    }
}

#[derive(Clone)]
pub struct MetadataEditor {
    sessions: SessionStore,
    library: SongLibrary,
}

impl MetadataEditor {
    pub fn new(sessions: SessionStore, library: SongLibrary) -> Self {
        Self { sessions, library }
    }

    /// Apply an edit. Returns the outcome and the session's next CSRF token.
    pub async fn update(
        &self,
        session_id: Option<&str>,
        request: UpdateSongRequest,
    ) -> Result<(EditOutcome, String), ApiError> {
        let next_token = self
            .sessions
            .consume_csrf(session_id, request.csrf_token.as_deref())
            .await?;

        let (id, fields) = validate_edit(
            request.song_id.as_ref(),
            request.title.as_deref(),
            request.artist.as_deref(),
            request.lyrics.as_deref(),
        )?;

        tracing::debug!("Updating song {}: title={:?}, artist={:?}", id, fields.title, fields.artist);

        let outcome = self
            .library
            .update_metadata(id, &fields.title, &fields.artist, &fields.lyrics)
            .await
            .map_err(|e| ApiError::server("Could not update song details in database.", e))?;

        match outcome {
            UpdateOutcome::Updated => {
                tracing::info!("Updated metadata for song {}", id);
                Ok((EditOutcome::Updated, next_token))
            }
            UpdateOutcome::Unchanged => Ok((EditOutcome::NoChanges, next_token)),
            UpdateOutcome::NotFound => {
                tracing::warn!("Song {} not found", id);
                Err(ApiError::NotFound("Song not found.".to_string()))
            }
        }
    }
}
