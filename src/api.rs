//! Backend auth API: login and profile endpoints.
//!
//! DESIGN
//! ======
//! `AuthApi` is the seam between the session store and the network so the
//! store can be driven by mocks in tests. `HttpAuthApi` is the production
//! implementation. Response parsing lives in free functions for testability.

use std::time::Duration;

use crate::config::{ClientConfig, HttpTimeouts};
use crate::session::{Token, UserProfile};

const LOGIN_PATH: &str = "/auth/login";
const PROFILE_PATH: &str = "/profile";

// =============================================================================
// ERROR
// =============================================================================

/// Transport-level failures of backend calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The backend answered 401. `message` is the body's `error` field when present.
    #[error("unauthorized: {}", .message.as_deref().unwrap_or("no message"))]
    Unauthorized { message: Option<String> },

    /// The backend answered with another non-success status.
    #[error("request rejected with status {status}: {}", .message.as_deref().unwrap_or("no message"))]
    Rejected { status: u16, message: Option<String> },

    /// The request never produced a response.
    #[error("request failed: {0}")]
    Request(String),

    /// The response body could not be deserialized.
    #[error("response parse failed: {0}")]
    Parse(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl ApiError {
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Rejected { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Debug, serde::Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
}

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

// =============================================================================
// TRAIT
// =============================================================================

/// Backend operations the session store depends on. Enables mocking in tests.
#[async_trait::async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange credentials for a bearer token.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the backend rejects the credentials or is
    /// unreachable.
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError>;

    /// Fetch the profile of the user owning `token`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unauthorized`] for an expired or revoked token and
    /// other variants for transport failures.
    async fn fetch_profile(&self, token: &Token) -> Result<UserProfile, ApiError>;
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

pub struct HttpAuthApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAuthApi {
    /// Build a client for the API rooted at `base_url` (e.g. `http://host/api`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(base_url: impl Into<String>, timeouts: HttpTimeouts) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.request_secs))
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .build()
            .map_err(|e| ApiError::HttpClientBuild(e.to_string()))?;
        let base_url: String = base_url.into();
        let base_url = crate::config::normalize_base_url(&base_url);
        Ok(Self { http, base_url })
    }

    /// Build a client from parsed [`ClientConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        Self::new(config.api_base_url.clone(), config.timeouts)
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait::async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let response = self
            .http
            .post(self.url(LOGIN_PATH))
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        parse_login_response(status, &text)
    }

    async fn fetch_profile(&self, token: &Token) -> Result<UserProfile, ApiError> {
        let response = self
            .http
            .get(self.url(PROFILE_PATH))
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        parse_profile_response(status, &text)
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// Map a non-success status and body to an [`ApiError`].
#[must_use]
pub fn status_error(status: u16, body: &str) -> ApiError {
    let message = extract_error_message(body);
    if status == 401 {
        ApiError::Unauthorized { message }
    } else {
        ApiError::Rejected { status, message }
    }
}

/// Pull the `error` field out of a JSON error body.
#[must_use]
pub fn extract_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .filter(|m| !m.trim().is_empty())
}

/// Parse the login endpoint's reply.
///
/// # Errors
///
/// Returns an error for non-2xx statuses or a body without `access_token`.
pub fn parse_login_response(status: u16, body: &str) -> Result<LoginResponse, ApiError> {
    if !(200..300).contains(&status) {
        return Err(status_error(status, body));
    }
    serde_json::from_str(body).map_err(|e| ApiError::Parse(e.to_string()))
}

/// Parse the profile endpoint's reply.
///
/// # Errors
///
/// Returns an error for non-2xx statuses or a body that is not a profile.
pub fn parse_profile_response(status: u16, body: &str) -> Result<UserProfile, ApiError> {
    if !(200..300).contains(&status) {
        return Err(status_error(status, body));
    }
    serde_json::from_str(body).map_err(|e| ApiError::Parse(e.to_string()))
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
