//! Server-side sessions carrying the single-use CSRF token.

use anyhow::{Context, Result};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use rand::RngCore;
use sqlx::SqlitePool;

use crate::error::ApiError;

pub const SESSION_COOKIE: &str = "music_dock_session";

const SESSION_MAX_AGE_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub csrf_token: String,
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                csrf_token TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create sessions table")?;

        Ok(Self { pool })
    }

    /// Load the session named by the cookie, creating one or regenerating its token as needed.
    pub async fn ensure(&self, session_id: Option<&str>) -> Result<Session> {
        if let Some(id) = session_id {
            let row = sqlx::query_as::<_, (Option<String>,)>(
                "SELECT csrf_token FROM sessions WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load session")?;

            match row {
                Some((Some(token),)) => {
                    return Ok(Session {
                        id: id.to_string(),
                        csrf_token: token,
                    });
                }
                Some((None,)) => {
                    let token = generate_token();
                    sqlx::query("UPDATE sessions SET csrf_token = ? WHERE id = ?")
                        .bind(&token)
                        .bind(id)
                        .execute(&self.pool)
                        .await
                        .context("Failed to regenerate CSRF token")?;
                    return Ok(Session {
                        id: id.to_string(),
                        csrf_token: token,
                    });
                }
                None => {}
            }
        }

        self.create().await
    }

    async fn create(&self) -> Result<Session> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(SESSION_MAX_AGE_DAYS)).to_rfc3339();
        if let Err(e) = sqlx::query("DELETE FROM sessions WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await
        {
            tracing::warn!("Failed to purge old sessions: {}", e);
        }

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            csrf_token: generate_token(),
        };

        sqlx::query("INSERT INTO sessions (id, csrf_token, created_at) VALUES (?, ?, ?)")
            .bind(&session.id)
            .bind(&session.csrf_token)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .context("Failed to create session")?;

        tracing::debug!("Created session {}", session.id);
        Ok(session)
    }

    /// Verify `submitted` against the session token and consume it.
    ///
    /// The token is replaced before returning, so it can never be used twice.
    /// Returns the replacement token.
    pub async fn consume_csrf(
        &self,
        session_id: Option<&str>,
        submitted: Option<&str>,
    ) -> Result<String, ApiError> {
        let missing = || {
            ApiError::Auth(
                "CSRF token not found in session. Please refresh the page.".to_string(),
            )
        };
        let rejected = || {
            ApiError::Auth(
                "CSRF token validation failed. Please refresh and try again.".to_string(),
            )
        };

        let session_id = session_id.ok_or_else(missing)?;

        let stored = sqlx::query_scalar::<_, Option<String>>(
            "SELECT csrf_token FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ApiError::server("Could not verify the request.", e))?
        .flatten()
        .ok_or_else(missing)?;

        let submitted = submitted.ok_or_else(rejected)?;
        if !constant_time_eq(stored.as_bytes(), submitted.as_bytes()) {
            tracing::warn!("CSRF token mismatch for session {}", session_id);
            return Err(rejected());
        }

        let next = generate_token();
        let result = sqlx::query("UPDATE sessions SET csrf_token = ? WHERE id = ? AND csrf_token = ?")
            .bind(&next)
            .bind(session_id)
            .bind(&stored)
            .execute(&self.pool)
            .await
            .map_err(|e| ApiError::server("Could not verify the request.", e))?;

        // Another request consumed the same token first.
        if result.rows_affected() == 0 {
            return Err(rejected());
        }

        Ok(next)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Session id carried by the request's cookies.
pub fn session_id_from(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie(session: &Session) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, session.id.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .build()
}
