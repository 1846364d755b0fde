//! Validation and storage of uploaded song and cover files.
//!
//! Files land in the upload directory under a generated name that is never taken
//! verbatim from the client, and their bytes are sniffed after the write.

use std::path::{Path, PathBuf};

use axum::http::StatusCode;
use thiserror::Error;
use tokio::io::AsyncReadExt;

const SNIFF_LEN: usize = 8192;

const COVER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Song,
    Cover,
}

impl FileRole {
    pub fn field_name(self) -> &'static str {
        match self {
            FileRole::Song => "song",
            FileRole::Cover => "cover",
        }
    }

    fn label(self) -> &'static str {
        match self {
            FileRole::Song => "Song",
            FileRole::Cover => "Cover",
        }
    }

    fn placeholder(self) -> &'static str {
        match self {
            FileRole::Song => "uploaded_song",
            FileRole::Cover => "uploaded_cover",
        }
    }
}

/// Transport-level failure while receiving a file part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    LimitExceeded,
    Partial,
}

/// A file part as received from the client, held in memory.
#[derive(Debug, Default)]
pub struct UploadedBlob {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    /// Bytes received, including any dropped past the size ceiling.
    pub size: u64,
    pub transport_error: Option<TransportError>,
}

impl UploadedBlob {
    pub fn new(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self {
            file_name: file_name.into(),
            content_type: None,
            data,
            size,
            transport_error: None,
        }
    }
}

/// A file relocated into the upload directory.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_name: String,
    pub path: PathBuf,
    pub mime_type: String,
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("No file received for '{role}'.")]
    Missing { role: &'static str },

    #[error("{label} file is too large (exceeds server or form limit). Max: {max_mib}MB.")]
    TransportLimit { label: &'static str, max_mib: u64 },

    #[error("{label} file was only partially uploaded.")]
    Partial { label: &'static str },

    #[error("{label} received an empty file.")]
    Empty { label: &'static str },

    #[error("{label} file exceeds maximum allowed size of {max_mib}MB.")]
    TooLarge { label: &'static str, max_mib: u64 },

    #[error("Invalid {role} file extension. Allowed: {allowed}.")]
    UnsupportedExtension { role: &'static str, allowed: String },

    #[error("Invalid {role} file type reported: {declared}.")]
    DeclaredTypeMismatch { role: &'static str, declared: String },

    #[error("Invalid {role} file content. Detected: {detected}.")]
    ContentMismatch { role: &'static str, detected: String },

    #[error("Could not save the uploaded {role} file.")]
    Storage {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl IntakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            IntakeError::Missing { .. } | IntakeError::Partial { .. } | IntakeError::Empty { .. } => {
                StatusCode::BAD_REQUEST
            }
            IntakeError::TransportLimit { .. } | IntakeError::TooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            IntakeError::UnsupportedExtension { .. }
            | IntakeError::DeclaredTypeMismatch { .. }
            | IntakeError::ContentMismatch { .. } => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            IntakeError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone)]
struct RolePolicy {
    max_size: u64,
    extensions: Vec<String>,
}

/// Validates and relocates uploaded files into the public upload directory.
#[derive(Debug, Clone)]
pub struct FileIntake {
    upload_dir: PathBuf,
    song: RolePolicy,
    cover: RolePolicy,
    /// Ceiling on the whole request body; reported when a transfer is cut off.
    transport_limit: Option<u64>,
}

impl FileIntake {
    pub fn new(
        upload_dir: PathBuf,
        audio_extensions: Vec<String>,
        max_song_size: u64,
        max_cover_size: u64,
    ) -> Self {
        Self {
            upload_dir,
            song: RolePolicy {
                max_size: max_song_size,
                extensions: audio_extensions,
            },
            cover: RolePolicy {
                max_size: max_cover_size,
                extensions: COVER_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            },
            transport_limit: None,
        }
    }

    pub fn with_transport_limit(mut self, bytes: u64) -> Self {
        self.transport_limit = Some(bytes);
        self
    }

    /// The body ceiling, or the larger file ceiling when none was set.
    pub fn transport_limit(&self) -> u64 {
        self.transport_limit
            .unwrap_or_else(|| self.song.max_size.max(self.cover.max_size))
    }

    pub fn max_size(&self, role: FileRole) -> u64 {
        self.policy(role).max_size
    }

    fn policy(&self, role: FileRole) -> &RolePolicy {
        match role {
            FileRole::Song => &self.song,
            FileRole::Cover => &self.cover,
        }
    }

    /// Run every intake check for `blob` and store it.
    ///
    /// Returns `Ok(None)` only for an absent optional cover.
    pub async fn intake(
        &self,
        role: FileRole,
        blob: Option<&UploadedBlob>,
    ) -> Result<Option<StoredFile>, IntakeError> {
        let policy = self.policy(role);

        let blob = match blob {
            Some(blob) => blob,
            None if role == FileRole::Cover => return Ok(None),
            None => {
                return Err(IntakeError::Missing {
                    role: role.field_name(),
                });
            }
        };

        match blob.transport_error {
            Some(TransportError::LimitExceeded) => {
                return Err(IntakeError::TransportLimit {
                    label: role.label(),
                    max_mib: mib_ceil(self.transport_limit()),
                });
            }
            Some(TransportError::Partial) => {
                return Err(IntakeError::Partial {
                    label: role.label(),
                });
            }
            None => {}
        }

        if blob.size == 0 {
            return Err(IntakeError::Empty {
                label: role.label(),
            });
        }

        if blob.size > policy.max_size {
            return Err(IntakeError::TooLarge {
                label: role.label(),
                max_mib: mib_ceil(policy.max_size),
            });
        }

        let (base_name, extension) = split_file_name(&blob.file_name);
        if !policy.extensions.iter().any(|allowed| *allowed == extension) {
            return Err(IntakeError::UnsupportedExtension {
                role: role.field_name(),
                allowed: policy.extensions.join(", "),
            });
        }

        if let Some(declared) = blob.content_type.as_deref() {
            if !declared_type_fits(role, &extension, declared) {
                tracing::warn!(
                    "Rejected {} upload '{}': client reported {}",
                    role.field_name(),
                    blob.file_name,
                    declared
                );
                return Err(IntakeError::DeclaredTypeMismatch {
                    role: role.field_name(),
                    declared: declared.to_string(),
                });
            }
        }

        let file_name = self
            .unused_name(generated_name(
                &base_name,
                role.placeholder(),
                chrono::Utc::now().timestamp(),
                &extension,
            ))
            .await;
        let path = self.upload_dir.join(&file_name);

        self.relocate(&blob.data, &path)
            .await
            .map_err(|source| IntakeError::Storage {
                role: role.field_name(),
                source,
            })?;

        let detected = match sniff_mime(&path).await {
            Ok(detected) => detected,
            Err(source) => {
                remove_quietly(&path).await;
                return Err(IntakeError::Storage {
                    role: role.field_name(),
                    source,
                });
            }
        };

        let accepted = detected
            .as_deref()
            .map(|mime| allowed_mime_types(&extension).contains(&mime))
            .unwrap_or(false);

        if !accepted {
            remove_quietly(&path).await;
            let detected = detected.unwrap_or_else(|| "unknown".to_string());
            tracing::warn!(
                "Rejected {} upload '{}': extension {} but content is {}",
                role.field_name(),
                blob.file_name,
                extension,
                detected
            );
            return Err(IntakeError::ContentMismatch {
                role: role.field_name(),
                detected,
            });
        }

        tracing::debug!(
            "Stored {} file {} ({} bytes, {})",
            role.field_name(),
            file_name,
            blob.size,
            detected.as_deref().unwrap_or_default()
        );

        Ok(Some(StoredFile {
            file_name,
            path,
            mime_type: detected.unwrap_or_default(),
        }))
    }

    /// Same-second uploads of one base name get a numeric suffix instead of overwriting.
    async fn unused_name(&self, candidate: String) -> String {
        let mut name = candidate.clone();
        let mut n = 1;
        while tokio::fs::try_exists(self.upload_dir.join(&name))
            .await
            .unwrap_or(false)
        {
            n += 1;
            name = numbered(&candidate, n);
        }
        name
    }

    /// Write next to the destination, then rename into place.
    async fn relocate(&self, data: &[u8], path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.upload_dir).await?;

        let partial = path.with_file_name(format!(
            ".{}.part",
            path.file_name().unwrap_or_default().to_string_lossy()
        ));

        if let Err(e) = tokio::fs::write(&partial, data).await {
            remove_quietly(&partial).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&partial, path).await {
            remove_quietly(&partial).await;
            return Err(e);
        }
        Ok(())
    }
}

/// Base name and lower-cased extension of a client file name.
pub(crate) fn split_file_name(file_name: &str) -> (String, String) {
    // Clients may send full paths; only the last component counts.
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let path = Path::new(last);

    let base = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    (base, extension)
}

/// Keep ASCII letters, digits, underscore, hyphen and whitespace.
pub fn sanitize_base_name(base: &str) -> String {
    base.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect()
}

fn generated_name(base: &str, placeholder: &str, timestamp: i64, extension: &str) -> String {
    let mut sanitized = sanitize_base_name(base);
    if sanitized.is_empty() {
        sanitized = placeholder.to_string();
    }
    format!("{sanitized}_{timestamp}.{extension}")
}

/// Whole MiB, rounded up, for user-facing limits.
pub(crate) fn mib_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(MIB)
}

/// Whether the client-reported type is plausible for the role. A missing or
/// empty type is left to content sniffing.
fn declared_type_fits(role: FileRole, extension: &str, declared: &str) -> bool {
    let essence = declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence.is_empty() || allowed_mime_types(extension).contains(&essence.as_str()) {
        return true;
    }

    match role {
        FileRole::Song => essence.starts_with("audio/") || essence == "application/octet-stream",
        FileRole::Cover => essence.starts_with("image/"),
    }
}

fn numbered(file_name: &str, n: u32) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, extension)) => format!("{stem}_{n}.{extension}"),
        None => format!("{file_name}_{n}"),
    }
}

/// Content types acceptable for a claimed extension.
pub fn allowed_mime_types(extension: &str) -> &'static [&'static str] {
    match extension {
        "mp3" => &["audio/mpeg"],
        "aac" => &["audio/aac"],
        "m4a" => &["audio/m4a", "audio/mp4", "video/mp4"],
        "ogg" => &["audio/ogg", "video/ogg"],
        "flac" => &["audio/x-flac"],
        "wav" => &["audio/x-wav"],
        "jpg" | "jpeg" => &["image/jpeg"],
        "png" => &["image/png"],
        "gif" => &["image/gif"],
        _ => &[],
    }
}

/// MIME type detected from the leading bytes of the file on disk.
async fn sniff_mime(path: &Path) -> std::io::Result<Option<String>> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head).await?;

    Ok(infer::get(&head).map(|kind| kind.mime_type().to_string()))
}

pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MP3_BYTES: &[u8] = b"ID3\x04\x00\x00\x00\x00\x00\x00\xff\xfb\x90\x64\x00\x00\x00\x00";

    fn intake(dir: &Path) -> FileIntake {
        FileIntake::new(
            dir.to_path_buf(),
            vec!["mp3".into(), "ogg".into()],
            1024,
            512,
        )
    }

    fn files_in(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(
            generated_name("../../etc/pass wd", "uploaded_song", 42, "mp3"),
            "etcpass wd_42.mp3"
        );
        assert_eq!(
            generated_name("日本語", "uploaded_song", 42, "mp3"),
            "uploaded_song_42.mp3"
        );
        assert_eq!(
            split_file_name("C:\\music\\Track-01.MP3"),
            ("Track-01".to_string(), "mp3".to_string())
        );
    }

    #[tokio::test]
    async fn stores_valid_song() {
        let dir = tempfile::tempdir().unwrap();
        let intake = intake(dir.path());
        let blob = UploadedBlob::new("My Song!.mp3", MP3_BYTES.to_vec());

        let stored = intake
            .intake(FileRole::Song, Some(&blob))
            .await
            .unwrap()
            .unwrap();

        assert!(stored.file_name.starts_with("My Song_"));
        assert!(stored.file_name.ends_with(".mp3"));
        assert_eq!(stored.mime_type, "audio/mpeg");
        assert_eq!(std::fs::read(&stored.path).unwrap(), MP3_BYTES);
        assert_eq!(files_in(dir.path()), vec![stored.file_name]);
    }

    #[tokio::test]
    async fn same_second_uploads_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let intake = intake(dir.path());
        let blob = UploadedBlob::new("twice.mp3", MP3_BYTES.to_vec());

        let first = intake.intake(FileRole::Song, Some(&blob)).await.unwrap().unwrap();
        let second = intake.intake(FileRole::Song, Some(&blob)).await.unwrap().unwrap();

        assert_ne!(first.file_name, second.file_name);
        assert_eq!(files_in(dir.path()).len(), 2);
        assert_eq!(numbered("twice_42.mp3", 2), "twice_42_2.mp3");
    }

    #[tokio::test]
    async fn spoofed_song_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let intake = intake(dir.path());
        let blob = UploadedBlob::new("evil.mp3", b"<?php echo 'hi'; ?>".to_vec());

        let err = intake.intake(FileRole::Song, Some(&blob)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn checks_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let intake = intake(dir.path());

        let err = intake.intake(FileRole::Song, None).await.unwrap_err();
        assert!(matches!(err, IntakeError::Missing { .. }));
        assert!(intake.intake(FileRole::Cover, None).await.unwrap().is_none());

        let mut partial = UploadedBlob::new("a.wav", Vec::new());
        partial.transport_error = Some(TransportError::Partial);
        let err = intake.intake(FileRole::Song, Some(&partial)).await.unwrap_err();
        assert!(matches!(err, IntakeError::Partial { .. }));

        let empty = UploadedBlob::new("a.wav", Vec::new());
        let err = intake.intake(FileRole::Song, Some(&empty)).await.unwrap_err();
        assert!(matches!(err, IntakeError::Empty { .. }));

        let big = UploadedBlob::new("a.wav", vec![0u8; 2048]);
        let err = intake.intake(FileRole::Song, Some(&big)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let wrong_ext = UploadedBlob::new("a.wav", MP3_BYTES.to_vec());
        let err = intake.intake(FileRole::Song, Some(&wrong_ext)).await.unwrap_err();
        assert!(matches!(err, IntakeError::UnsupportedExtension { .. }));

        let bmp_cover = UploadedBlob::new("cover.bmp", b"BM\x00\x00".to_vec());
        let err = intake.intake(FileRole::Cover, Some(&bmp_cover)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn reported_type_must_fit_the_role() {
        let dir = tempfile::tempdir().unwrap();
        let intake = intake(dir.path());

        let mut html = UploadedBlob::new("page.mp3", MP3_BYTES.to_vec());
        html.content_type = Some("text/html; charset=utf-8".to_string());
        let err = intake.intake(FileRole::Song, Some(&html)).await.unwrap_err();
        assert!(matches!(err, IntakeError::DeclaredTypeMismatch { .. }));
        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let mut audio_cover = UploadedBlob::new("art.png", MP3_BYTES.to_vec());
        audio_cover.content_type = Some("audio/mpeg".to_string());
        let err = intake.intake(FileRole::Cover, Some(&audio_cover)).await.unwrap_err();
        assert!(matches!(err, IntakeError::DeclaredTypeMismatch { .. }));
        assert!(files_in(dir.path()).is_empty());

        for declared in ["audio/mpeg", "application/octet-stream", ""] {
            let mut blob = UploadedBlob::new("fine.mp3", MP3_BYTES.to_vec());
            blob.content_type = Some(declared.to_string());
            assert!(
                intake.intake(FileRole::Song, Some(&blob)).await.is_ok(),
                "{declared}"
            );
        }

        assert!(declared_type_fits(FileRole::Song, "m4a", "video/mp4"));
        assert!(declared_type_fits(FileRole::Cover, "jpg", "IMAGE/JPEG"));
    }

    #[tokio::test]
    async fn size_limits_round_up_to_whole_mib() {
        let dir = tempfile::tempdir().unwrap();
        let intake = intake(dir.path()).with_transport_limit(3 * MIB + 1);

        let big = UploadedBlob::new("a.mp3", vec![0u8; 2048]);
        let err = intake.intake(FileRole::Song, Some(&big)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Song file exceeds maximum allowed size of 1MB."
        );

        let mut cut = UploadedBlob::new("a.mp3", Vec::new());
        cut.transport_error = Some(TransportError::LimitExceeded);
        let err = intake.intake(FileRole::Song, Some(&cut)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Song file is too large (exceeds server or form limit). Max: 4MB."
        );

        assert_eq!(mib_ceil(0), 0);
        assert_eq!(mib_ceil(MIB), 1);
    }

    #[tokio::test]
    async fn cover_must_be_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let intake = intake(dir.path());
        let blob = UploadedBlob::new("cover.png", MP3_BYTES.to_vec());

        let err = intake.intake(FileRole::Cover, Some(&blob)).await.unwrap_err();
        assert!(matches!(err, IntakeError::ContentMismatch { .. }));
        assert!(files_in(dir.path()).is_empty());
    }
}
