#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, Response, header};
use clap::Parser;
use http_body_util::BodyExt;
use music_dock::config::Settings;
use music_dock::server::{AppState, create_router};
use tempfile::TempDir;
use tower::ServiceExt;

pub const BOUNDARY: &str = "music-dock-test-boundary";

/// Smallest byte sequence recognised as MPEG audio.
pub const MP3_BYTES: &[u8] = b"ID3\x04\x00\x00\x00\x00\x00\x00\xff\xfb\x90\x64\x00\x00\x00\x00";

const TEMPLATE: &str = r#"<html><body data-csrf-token="{{csrf_token}}"></body></html>"#;

pub struct TestApp {
    pub router: Router,
    pub upload_dir: PathBuf,
    _root: TempDir,
}

/// A browser-like client: one session cookie and the latest CSRF token.
pub struct Client {
    pub cookie: String,
    pub csrf_token: String,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_args(&[]).await
    }

    pub async fn with_args(extra: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let static_dir = root.path().join("static");
        std::fs::create_dir_all(&static_dir).unwrap();
        std::fs::write(static_dir.join("player.html"), TEMPLATE).unwrap();

        let settings = settings_in(root.path(), extra);
        let upload_dir = settings.upload_dir.clone();
        let state = AppState::new(&settings).await.unwrap();
        let router = create_router(state, &settings)
            .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 7], 40000))));

        Self {
            router,
            upload_dir,
            _root: root,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (Response<Body>, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes().to_vec();
        (Response::from_parts(parts, Body::empty()), bytes)
    }

    pub async fn json(&self, request: Request<Body>) -> (u16, serde_json::Value) {
        let (response, body) = self.send(request).await;
        let value = serde_json::from_slice(&body).unwrap_or_else(|e| {
            panic!("non-JSON body ({e}): {}", String::from_utf8_lossy(&body))
        });
        (response.status().as_u16(), value)
    }

    /// Open the player page and pick up the session cookie and token.
    pub async fn open_player(&self) -> Client {
        let (response, body) = self
            .send(Request::get("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), 200);

        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .unwrap()
            .to_string();

        let page = String::from_utf8(body).unwrap();
        let csrf_token = page
            .split("data-csrf-token=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap()
            .to_string();

        Client { cookie, csrf_token }
    }

    pub async fn playlist(&self) -> Vec<serde_json::Value> {
        let (status, value) = self
            .json(
                Request::get("/?action=getPlaylist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(value["status"], "success");
        value["data"]["songs"].as_array().unwrap().clone()
    }

    pub fn stored_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.upload_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

impl Client {
    /// Remember the rotated token, if the response carried one.
    pub fn absorb(&mut self, value: &serde_json::Value) {
        if let Some(token) = value["csrf_token"].as_str() {
            self.csrf_token = token.to_string();
        }
    }

    pub fn upload_request(&self, form: &Multipart) -> Request<Body> {
        Request::post("/?action=uploadSong")
            .header(header::COOKIE, &self.cookie)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(form.finish()))
            .unwrap()
    }

    pub fn edit_request(&self, body: serde_json::Value) -> Request<Body> {
        Request::post("/?action=updateSongMetadata")
            .header(header::COOKIE, &self.cookie)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}

/// Hand-built multipart/form-data body.
#[derive(Default, Clone)]
pub struct Multipart {
    body: Vec<u8>,
}

impl Multipart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, file_name: &str, content_type: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut body = self.body.clone();
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }
}

pub fn settings_in(root: &Path, extra: &[&str]) -> Settings {
    let database = root.join("music-dock.db").display().to_string();
    let upload_dir = root.join("uploads").display().to_string();
    let static_dir = root.join("static").display().to_string();

    let mut args = vec![
        "music-dock",
        "--database",
        database.as_str(),
        "--upload-dir",
        upload_dir.as_str(),
        "--static-dir",
        static_dir.as_str(),
    ];
    args.extend_from_slice(extra);
    Settings::parse_from(args)
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut png = Vec::new();
    image::RgbaImage::from_pixel(width, height, image::Rgba([200, 30, 30, 128]))
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    png
}
