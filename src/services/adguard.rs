//! AdGuard Home API client
//!
//! Holds one `agh_session` cookie for the whole process. Requests that come
//! back `401`/`403` trigger a single re-login followed by a single retry.
//! Re-login is serialized: callers that hit an expired session at the same
//! time wait for the one login in flight and reuse its session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::net::IpAddr;
use tokio::sync::Mutex;

use crate::error::{PbrSyncError, Result};

const SESSION_COOKIE: &str = "agh_session";

/// One DNS query as recorded by AdGuard Home.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLogEntry {
    /// Normalized query name
    pub domain: String,
    /// A/AAAA answers; empty for blocked, failed or non-address queries
    pub answers: Vec<IpAddr>,
    pub client: Option<String>,
    pub time: Option<DateTime<Utc>>,
}

/// Source of recent query-log entries.
#[async_trait]
pub trait QueryLogSource: Send + Sync {
    /// Fetch up to `limit` of the most recent entries, newest first.
    async fn recent_entries(&self, limit: usize) -> Result<Vec<QueryLogEntry>>;
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// An authenticated resolver session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// `name=value` pair replayed in the `Cookie` header
    cookie: String,
}

impl Session {
    pub fn cookie(&self) -> &str {
        &self.cookie
    }
}

#[derive(Debug, Default)]
struct SessionState {
    session: Option<Session>,
    /// Bumped on every successful login
    generation: u64,
}

#[derive(Debug, Deserialize)]
struct QueryLogResponse {
    #[serde(default)]
    data: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    question: Option<RawQuestion>,
    #[serde(default)]
    answer: Option<Vec<RawAnswer>>,
    #[serde(default)]
    client: Option<String>,
    #[serde(default)]
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQuestion {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    #[serde(rename = "type")]
    record_type: Option<String>,
    value: Option<String>,
}

impl RawEntry {
    fn into_entry(self) -> Option<QueryLogEntry> {
        let name = self.question.and_then(|q| q.name)?;
        let domain = crate::sync::normalize_domain(&name);
        if domain.is_empty() {
            return None;
        }

        let answers = self
            .answer
            .unwrap_or_default()
            .into_iter()
            .filter(|a| matches!(a.record_type.as_deref(), Some("A") | Some("AAAA")))
            .filter_map(|a| a.value?.trim().parse::<IpAddr>().ok())
            .collect();

        let time = self
            .time
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc));

        Some(QueryLogEntry {
            domain,
            answers,
            client: self.client,
            time,
        })
    }
}

/// AdGuard Home management API client
pub struct AdGuardClient {
    http_client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    state: Mutex<SessionState>,
}

impl AdGuardClient {
    /// Creates a new client. Without credentials no login is ever attempted.
    pub fn new(http_client: Client, base_url: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Log in and return a fresh session. Does not touch the held session.
    pub async fn authenticate(&self) -> Result<Session> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            PbrSyncError::Auth("no AdGuard Home credentials configured".to_string())
        })?;

        let url = format!("{}/control/login", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({
                "name": credentials.username,
                "password": credentials.password,
            }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PbrSyncError::Auth(format!(
                "AdGuard Home rejected credentials for user '{}'",
                credentials.username
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PbrSyncError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .map(str::trim)
            .find(|pair| pair.starts_with(&format!("{}=", SESSION_COOKIE)))
            .map(str::to_string)
            .ok_or_else(|| {
                PbrSyncError::Auth("login response carried no session cookie".to_string())
            })?;

        log::info!("Authenticated to AdGuard Home at {}", self.base_url);
        Ok(Session { cookie })
    }

    /// Make sure a session is held (logging in if needed).
    pub async fn ensure_session(&self) -> Result<()> {
        self.current_session().await.map(|_| ())
    }

    /// Session to use for the next request, with the generation it belongs to.
    async fn current_session(&self) -> Result<(Option<Session>, u64)> {
        if self.credentials.is_none() {
            return Ok((None, 0));
        }

        let mut state = self.state.lock().await;
        if state.session.is_none() {
            let session = self.authenticate().await?;
            state.session = Some(session);
            state.generation += 1;
        }
        Ok((state.session.clone(), state.generation))
    }

    /// Replace the session that failed in `stale_generation`.
    ///
    /// The lock is held across the login, so concurrent callers queue here and
    /// find the generation already advanced instead of logging in again.
    async fn refresh_session(&self, stale_generation: u64) -> Result<Option<Session>> {
        let mut state = self.state.lock().await;
        if state.generation != stale_generation && state.session.is_some() {
            return Ok(state.session.clone());
        }

        state.session = None;
        let session = self.authenticate().await?;
        state.session = Some(session);
        state.generation += 1;
        log::debug!("AdGuard Home session renewed (generation {})", state.generation);
        Ok(state.session.clone())
    }

    async fn send_once<F>(&self, build: &F, session: Option<&Session>) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut request = build(&self.http_client);
        if let Some(session) = session {
            request = request.header(COOKIE, session.cookie());
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PbrSyncError::AuthExpired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PbrSyncError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Execute an authenticated request built by `build`.
    ///
    /// On an expired session the request is re-issued exactly once after
    /// re-authenticating.
    pub async fn execute<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let (session, generation) = self.current_session().await?;

        match self.send_once(&build, session.as_ref()).await {
            Err(PbrSyncError::AuthExpired) if self.credentials.is_some() => {
                log::info!("AdGuard Home session expired, re-authenticating");
                let session = self.refresh_session(generation).await?;
                self.send_once(&build, session.as_ref()).await
            }
            Err(PbrSyncError::AuthExpired) => Err(PbrSyncError::Auth(
                "AdGuard Home requires authentication; set ADGUARD_USER and ADGUARD_PASS"
                    .to_string(),
            )),
            other => other,
        }
    }

    /// Fetch the most recent `limit` query-log entries.
    pub async fn query_log(&self, limit: usize) -> Result<Vec<QueryLogEntry>> {
        let url = format!("{}/control/querylog", self.base_url);
        let limit = limit.to_string();

        let response = self
            .execute(|client| {
                client
                    .get(&url)
                    .query(&[("limit", limit.as_str())])
                    .header("accept", "application/json")
            })
            .await?;

        let data: QueryLogResponse = response.json().await?;
        let entries: Vec<QueryLogEntry> =
            data.data.into_iter().filter_map(RawEntry::into_entry).collect();

        log::debug!("Fetched {} query log entries", entries.len());
        Ok(entries)
    }
}

#[async_trait]
impl QueryLogSource for AdGuardClient {
    async fn recent_entries(&self, limit: usize) -> Result<Vec<QueryLogEntry>> {
        self.query_log(limit).await
    }
}
