//! Google OAuth 2.0 and Calendar v3 over plain REST.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use reqwest::{header, Client, Method, StatusCode};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;

use super::{CalendarError, CalendarEvent, CalendarResult, CalendarService};
use crate::config::MediConfig;
use crate::meds::types::{format_datetime, DATETIME_FORMAT};
use crate::meds::{datetime_column, MedResult};

pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";
pub const SCOPE: &str = "https://www.googleapis.com/auth/calendar.events";

/// Refresh this long before the stated expiry.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<NaiveDateTime>,
}

impl StoredCredentials {
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at
            .is_some_and(|at| at <= now + Duration::seconds(EXPIRY_SLACK_SECS))
    }
}

/// Upsert tokens for `user_id`. A response without a refresh token keeps the
/// one already stored.
pub fn store_credentials(
    conn: &Connection,
    user_id: i64,
    tokens: &TokenResponse,
    now: NaiveDateTime,
) -> MedResult<()> {
    let expires_at = tokens
        .expires_in
        .map(|secs| format_datetime(now + Duration::seconds(secs)));
    conn.execute(
        "INSERT INTO google_credentials (user_id, access_token, refresh_token, expires_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(user_id) DO UPDATE SET \
           access_token = excluded.access_token, \
           refresh_token = COALESCE(excluded.refresh_token, google_credentials.refresh_token), \
           expires_at = excluded.expires_at, \
           updated_at = excluded.updated_at",
        params![
            user_id,
            tokens.access_token,
            tokens.refresh_token,
            expires_at,
            format_datetime(now)
        ],
    )?;
    Ok(())
}

pub fn load_credentials(conn: &Connection, user_id: i64) -> MedResult<Option<StoredCredentials>> {
    Ok(conn
        .query_row(
            "SELECT access_token, refresh_token, expires_at FROM google_credentials WHERE user_id = ?1",
            params![user_id],
            |row| {
                let expires_at = match row.get::<_, Option<String>>(2)? {
                    Some(_) => Some(datetime_column(row, 2)?),
                    None => None,
                };
                Ok(StoredCredentials {
                    access_token: row.get(0)?,
                    refresh_token: row.get(1)?,
                    expires_at,
                })
            },
        )
        .optional()?)
}

fn form_body(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// OAuth client settings.
#[derive(Debug, Clone)]
pub struct GoogleOAuth {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub token_url: String,
}

impl GoogleOAuth {
    pub fn from_config(config: &MediConfig) -> Self {
        Self {
            client_id: config.calendar.client_id.clone(),
            client_secret: config.calendar.client_secret.clone(),
            redirect_uri: config.calendar_redirect_uri(),
            token_url: TOKEN_URL.to_string(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    /// Consent URL asking for offline access so a refresh token comes back.
    pub fn authorization_url(&self, state: &str) -> String {
        format!(
            "{AUTH_URL}?{}",
            form_body(&[
                ("response_type", "code"),
                ("client_id", &self.client_id),
                ("redirect_uri", &self.redirect_uri),
                ("scope", SCOPE),
                ("access_type", "offline"),
                ("include_granted_scopes", "true"),
                ("prompt", "consent"),
                ("state", state),
            ])
        )
    }

    async fn token_request(&self, http: &Client, pairs: &[(&str, &str)]) -> anyhow::Result<TokenResponse> {
        let response = http
            .post(&self.token_url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form_body(pairs))
            .send()
            .await
            .context("token request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("token endpoint returned HTTP {status}: {body}"));
        }
        response.json().await.context("malformed token response")
    }

    pub async fn exchange_code(&self, http: &Client, code: &str) -> anyhow::Result<TokenResponse> {
        self.token_request(
            http,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("redirect_uri", &self.redirect_uri),
            ],
        )
        .await
    }

    pub async fn refresh(&self, http: &Client, refresh_token: &str) -> anyhow::Result<TokenResponse> {
        self.token_request(
            http,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ],
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct CreatedEvent {
    id: String,
}

/// [`CalendarService`] backed by the user's primary Google Calendar.
pub struct GoogleCalendar {
    oauth: GoogleOAuth,
    db: Arc<Mutex<Connection>>,
    http: Client,
    api_base: String,
}

impl GoogleCalendar {
    pub fn new(oauth: GoogleOAuth, db: Arc<Mutex<Connection>>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(StdDuration::from_secs(20))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            oauth,
            db,
            http,
            api_base: CALENDAR_API.to_string(),
        })
    }

    /// Point at another API root (used against local fakes).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn oauth(&self) -> &GoogleOAuth {
        &self.oauth
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    fn now() -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }

    async fn credentials(&self, user_id: i64) -> CalendarResult<StoredCredentials> {
        let db = Arc::clone(&self.db);
        let creds = tokio::task::spawn_blocking(move || -> CalendarResult<Option<StoredCredentials>> {
            let conn = db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            Ok(load_credentials(&conn, user_id)?)
        })
        .await
        .map_err(|e| CalendarError::Other(e.into()))??;
        creds.ok_or(CalendarError::NotConnected)
    }

    async fn save(&self, user_id: i64, tokens: TokenResponse) -> CalendarResult<()> {
        let db = Arc::clone(&self.db);
        let now = Self::now();
        tokio::task::spawn_blocking(move || -> CalendarResult<()> {
            let conn = db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            Ok(store_credentials(&conn, user_id, &tokens, now)?)
        })
        .await
        .map_err(|e| CalendarError::Other(e.into()))?
    }

    /// Exchange the stored refresh token for a new access token.
    async fn refreshed_token(&self, user_id: i64, creds: &StoredCredentials) -> CalendarResult<String> {
        let refresh_token = creds.refresh_token.as_deref().ok_or(CalendarError::NotConnected)?;
        let tokens = self
            .oauth
            .refresh(&self.http, refresh_token)
            .await
            .map_err(|e| CalendarError::Api(e.to_string()))?;
        let access = tokens.access_token.clone();
        self.save(user_id, tokens).await?;
        tracing::debug!(user_id, "google access token refreshed");
        Ok(access)
    }

    /// Send an authorized request, refreshing the token once on expiry or 401.
    async fn send(
        &self,
        user_id: i64,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> CalendarResult<reqwest::Response> {
        let creds = self.credentials(user_id).await?;
        let mut token = if creds.is_expired(Self::now()) && creds.refresh_token.is_some() {
            self.refreshed_token(user_id, &creds).await?
        } else {
            creds.access_token.clone()
        };

        let mut retried = false;
        loop {
            let mut request = self.http.request(method.clone(), url).bearer_auth(&token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request
                .send()
                .await
                .map_err(|e| CalendarError::Api(e.to_string()))?;

            if response.status() == StatusCode::UNAUTHORIZED && !retried && creds.refresh_token.is_some() {
                retried = true;
                token = self.refreshed_token(user_id, &creds).await?;
                continue;
            }
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(CalendarError::NotConnected);
            }
            return Ok(response);
        }
    }
}

/// Google's event resource for a [`CalendarEvent`].
pub fn event_resource(event: &CalendarEvent) -> serde_json::Value {
    json!({
        "summary": event.summary,
        "description": event.description,
        "start": {
            "dateTime": event.start.format(DATETIME_FORMAT).to_string(),
            "timeZone": event.time_zone,
        },
        "end": {
            "dateTime": event.end.format(DATETIME_FORMAT).to_string(),
            "timeZone": event.time_zone,
        },
        "recurrence": event.recurrence,
    })
}

#[async_trait]
impl CalendarService for GoogleCalendar {
    async fn insert_event(&self, user_id: i64, event: &CalendarEvent) -> CalendarResult<String> {
        let url = format!("{}/calendars/primary/events", self.api_base);
        let response = self
            .send(user_id, Method::POST, &url, Some(&event_resource(event)))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CalendarError::Api(format!("HTTP {status}: {body}")));
        }
        let created: CreatedEvent = response
            .json()
            .await
            .map_err(|e| CalendarError::Api(e.to_string()))?;
        Ok(created.id)
    }

    async fn delete_event(&self, user_id: i64, event_id: &str) -> CalendarResult<()> {
        let url = format!(
            "{}/calendars/primary/events/{}",
            self.api_base,
            urlencoding::encode(event_id)
        );
        let response = self.send(user_id, Method::DELETE, &url, None).await?;
        let status = response.status();
        // already gone counts as deleted
        if status.is_success() || status == StatusCode::GONE || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(CalendarError::Api(format!("HTTP {status}")))
        }
    }
}
