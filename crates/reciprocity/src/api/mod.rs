//! HTTP adapter for the relationship API.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | POST | `/auth/login` | password login |
//! | POST | `/auth/two-factor` | complete a login with a code |
//! | GET | `/users/{handle}` | profile counters |
//! | GET | `/users/{handle}/{following,followers}` | one page of a list |

mod pages;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LoginError, SourceError};
use crate::source::{
    AccountClient, ClientFactory, Direction, ItemSource, Profile, SessionToken,
};

pub use pages::HttpItemSource;

/// Default number of accounts requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct TwoFactorRequest<'a> {
    username: &'a str,
    identifier: &'a str,
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    two_factor_identifier: Option<String>,
}

impl ErrorBody {
    fn describe(&self, fallback: &str) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| fallback.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    username: String,
    #[serde(default)]
    following_count: Option<u64>,
    #[serde(default)]
    followers_count: Option<u64>,
}

/// Map a transport error onto the source taxonomy.
pub(crate) fn transport_error(err: &reqwest::Error) -> SourceError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        SourceError::Connectivity(err.to_string())
    } else {
        SourceError::Request(err.to_string())
    }
}

/// Map a non-success response onto the source taxonomy.
pub(crate) async fn status_error(response: Response) -> SourceError {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return SourceError::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return SourceError::Connectivity(format!("server error ({status})"));
    }
    let text = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let fallback = if text.trim().is_empty() {
        status.to_string()
    } else {
        text
    };
    SourceError::Request(format!("{status}: {}", body.describe(&fallback)))
}

/// Client for one account on the relationship API.
pub struct HttpAccountClient {
    base: String,
    http: Client,
    page_size: u32,
    token: Arc<RwLock<Option<SessionToken>>>,
    pending_two_factor: Mutex<Option<String>>,
}

impl HttpAccountClient {
    /// Create an unauthenticated client.
    #[must_use]
    pub fn new(base: &str, http: Client, page_size: u32) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            page_size: page_size.max(1),
            token: Arc::new(RwLock::new(None)),
            pending_two_factor: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn bearer(&self) -> Option<String> {
        self.token
            .read()
            .as_ref()
            .map(|t| format!("Bearer {}", t.expose()))
    }

    fn store_token(&self, token: SessionToken) -> SessionToken {
        *self.token.write() = Some(token.clone());
        token
    }

    async fn token_from(&self, response: Response) -> Result<SessionToken, LoginError> {
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| LoginError::Other(format!("invalid login response: {e}")))?;
        Ok(self.store_token(SessionToken::new(body.token)))
    }
}

#[async_trait]
impl AccountClient for HttpAccountClient {
    async fn login(&self, handle: &str, password: &str) -> Result<SessionToken, LoginError> {
        debug!(handle, "Logging in");
        let response = self
            .http
            .post(self.url("/auth/login"))
            .json(&LoginRequest {
                username: handle,
                password,
            })
            .send()
            .await
            .map_err(|e| LoginError::Source(transport_error(&e)))?;

        let status = response.status();
        if status.is_success() {
            info!(handle, "Login succeeded");
            return self.token_from(response).await;
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(LoginError::Source(status_error(response).await));
        }

        let body: ErrorBody = response.json().await.unwrap_or_default();
        match (status, body.error.as_deref()) {
            (_, Some("two_factor_required")) => {
                *self.pending_two_factor.lock() = body.two_factor_identifier.clone();
                info!(handle, "Two-factor authentication required");
                Err(LoginError::TwoFactorRequired)
            }
            (_, Some("challenge_required" | "checkpoint_required")) => {
                warn!(handle, "Login held for approval");
                Err(LoginError::Blocked(body.describe("challenge required")))
            }
            (StatusCode::UNAUTHORIZED, _) => {
                Err(LoginError::BadCredentials(body.describe("invalid username or password")))
            }
            _ => Err(LoginError::from_message(body.describe(status.as_str()))),
        }
    }

    async fn two_factor_login(
        &self,
        handle: &str,
        code: &str,
    ) -> Result<SessionToken, LoginError> {
        let identifier = self
            .pending_two_factor
            .lock()
            .clone()
            .ok_or_else(|| LoginError::Other("no two-factor login pending".into()))?;

        let response = self
            .http
            .post(self.url("/auth/two-factor"))
            .json(&TwoFactorRequest {
                username: handle,
                identifier: &identifier,
                code,
            })
            .send()
            .await
            .map_err(|e| LoginError::Source(transport_error(&e)))?;

        let status = response.status();
        if status.is_success() {
            self.pending_two_factor.lock().take();
            info!(handle, "Two-factor login succeeded");
            return self.token_from(response).await;
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(LoginError::Source(status_error(response).await));
        }
        let body: ErrorBody = response.json().await.unwrap_or_default();
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) {
            Err(LoginError::BadCredentials(body.describe("invalid two-factor code")))
        } else {
            Err(LoginError::from_message(body.describe(status.as_str())))
        }
    }

    async fn restore_session(&self, handle: &str, token: &SessionToken) -> Result<(), LoginError> {
        debug!(handle, "Restoring session");
        self.store_token(token.clone());
        Ok(())
    }

    async fn profile(&self, handle: &str) -> Result<Profile, LoginError> {
        let mut request = self.http.get(self.url(&format!("/users/{handle}")));
        if let Some(bearer) = self.bearer() {
            request = request.header(reqwest::header::AUTHORIZATION, bearer);
        }
        let response = request
            .send()
            .await
            .map_err(|e| LoginError::Source(transport_error(&e)))?;

        match response.status() {
            status if status.is_success() => {
                let body: ProfileResponse = response
                    .json()
                    .await
                    .map_err(|e| LoginError::Other(format!("invalid profile response: {e}")))?;
                Ok(Profile {
                    handle: body.username,
                    following_count: body.following_count,
                    followers_count: body.followers_count,
                })
            }
            StatusCode::UNAUTHORIZED => Err(LoginError::SessionExpired(
                "stored session was rejected".into(),
            )),
            StatusCode::NOT_FOUND => Err(LoginError::Other(format!("profile {handle} not found"))),
            _ => Err(LoginError::Source(status_error(response).await)),
        }
    }

    fn relations(
        &self,
        handle: &str,
        direction: Direction,
        expected_total: Option<u64>,
        fetch_avatars: bool,
    ) -> Box<dyn ItemSource> {
        Box::new(HttpItemSource::new(
            self.http.clone(),
            self.url(&format!("/users/{handle}/{}", direction.label())),
            self.bearer(),
            self.page_size,
            expected_total,
            fetch_avatars,
        ))
    }
}

/// Builds one [`HttpAccountClient`] per run over a shared connection pool.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    base: String,
    http: Client,
    page_size: u32,
}

impl HttpClientFactory {
    /// Create a factory for the API at `base`.
    pub fn new(base: &str, page_size: u32, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reciprocity/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base: base.to_string(),
            http,
            page_size,
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(&self) -> Arc<dyn AccountClient> {
        Arc::new(HttpAccountClient::new(
            &self.base,
            self.http.clone(),
            self.page_size,
        ))
    }
}
