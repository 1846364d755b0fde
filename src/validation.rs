//! Field validation for uploads and metadata edits.
//!
//! Lengths are measured in Unicode code points. Every field is checked and all
//! offending fields are reported together.

use std::collections::BTreeMap;

use crate::error::ApiError;
use crate::intake::split_file_name;

pub const MAX_TITLE_LENGTH: usize = 255;
pub const MAX_ARTIST_LENGTH: usize = 255;
pub const MAX_LYRICS_LENGTH: usize = 65535;

pub const DEFAULT_ARTIST: &str = "Unknown Artist";

/// Song metadata that passed validation; lyrics are already HTML-escaped.
#[derive(Debug, Clone, PartialEq)]
pub struct SongFields {
    pub title: String,
    pub artist: String,
    pub lyrics: String,
}

#[derive(Default)]
struct Problems(BTreeMap<String, String>);

impl Problems {
    fn add(&mut self, field: &str, reason: String) {
        self.0.insert(field.to_string(), reason);
    }

    fn check_length(&mut self, field: &str, label: &str, value: &str, max: usize) {
        if value.chars().count() > max {
            self.add(
                field,
                format!("{label} exceeds maximum length of {max} characters."),
            );
        }
    }

    fn into_result(self) -> Result<(), ApiError> {
        if self.0.is_empty() {
            return Ok(());
        }

        let message = if self.0.len() == 1 {
            self.0.values().next().cloned().unwrap_or_default()
        } else {
            "Validation failed.".to_string()
        };

        Err(ApiError::Validation {
            message,
            details: self.0,
        })
    }
}

/// Validate the text fields of an upload.
///
/// An empty title falls back to the song file's base name; an empty artist
/// becomes [`DEFAULT_ARTIST`].
pub fn validate_upload(
    title: Option<&str>,
    artist: Option<&str>,
    lyrics: Option<&str>,
    song_file_name: Option<&str>,
) -> Result<SongFields, ApiError> {
    let mut problems = Problems::default();

    let mut title = title.unwrap_or("").trim().to_string();
    if title.is_empty() {
        title = song_file_name
            .map(|name| split_file_name(name).0.trim().to_string())
            .unwrap_or_default();
    }
    if title.is_empty() {
        problems.add(
            "title",
            "Title is required if song filename is not available.".to_string(),
        );
    }

    let mut artist = artist.unwrap_or("").trim().to_string();
    if artist.is_empty() {
        artist = DEFAULT_ARTIST.to_string();
    }

    let lyrics = lyrics.unwrap_or("");

    problems.check_length("title", "Title", &title, MAX_TITLE_LENGTH);
    problems.check_length("artist", "Artist name", &artist, MAX_ARTIST_LENGTH);
    problems.check_length("lyrics", "Lyrics", lyrics, MAX_LYRICS_LENGTH);
    problems.into_result()?;

    Ok(SongFields {
        title,
        artist,
        lyrics: escape_html(lyrics),
    })
}

/// Validate a metadata edit. Title and artist are required here.
pub fn validate_edit(
    song_id: Option<&serde_json::Value>,
    title: Option<&str>,
    artist: Option<&str>,
    lyrics: Option<&str>,
) -> Result<(i64, SongFields), ApiError> {
    let mut problems = Problems::default();

    let id = song_id.and_then(parse_song_id);
    if id.is_none() {
        problems.add("song_id", "Invalid or missing song ID.".to_string());
    }

    let title = title.unwrap_or("").trim().to_string();
    if title.is_empty() {
        problems.add("title", "Title cannot be empty.".to_string());
    }

    let artist = artist.unwrap_or("").trim().to_string();
    if artist.is_empty() {
        problems.add("artist", "Artist cannot be empty.".to_string());
    }

    let lyrics = lyrics.unwrap_or("").trim();

    problems.check_length("title", "Title", &title, MAX_TITLE_LENGTH);
    problems.check_length("artist", "Artist name", &artist, MAX_ARTIST_LENGTH);
    problems.check_length("lyrics", "Lyrics", lyrics, MAX_LYRICS_LENGTH);
    problems.into_result()?;

    Ok((
        id.unwrap_or_default(),
        SongFields {
            title,
            artist,
            lyrics: escape_html(lyrics),
        },
    ))
}

/// Positive integer ids, given either as a JSON number or a numeric string.
fn parse_song_id(value: &serde_json::Value) -> Option<i64> {
    let id = match value {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (id > 0).then_some(id)
}

/// Escape text for embedding in HTML, including both quote styles.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
    out
}
