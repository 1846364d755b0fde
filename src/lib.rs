//! Music Dock - a self-hosted web audio player
//!
//! This library provides the upload pipeline (rate limiting, CSRF checks,
//! file intake and cover normalization), the song library and the HTTP surface.

pub mod config;
pub mod cover;
pub mod db;
pub mod editor;
pub mod error;
pub mod intake;
pub mod library;
pub mod playlist;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod upload;
pub mod validation;
