//! Session store: bearer token, cached profile, role predicates.
//!
//! ARCHITECTURE
//! ============
//! `SessionStore` is a cheaply clonable handle over the single writable copy
//! of the [`Session`]. Callers read through snapshots; only `login`,
//! `fetch_profile` and `logout` mutate, and every mutation is mirrored into
//! [`SessionStorage`] under the session lock so memory and storage never
//! disagree about which token is current.
//!
//! CONCURRENCY
//! ===========
//! Profile fetches are de-duplicated per token: concurrent callers share one
//! pending request. A profile that arrives after its token was replaced or
//! cleared is dropped, and a failure for a superseded token never logs out
//! the session that replaced it.
//!
//! ERROR HANDLING
//! ==============
//! Login failures propagate for display. Profile failures collapse the
//! session to anonymous before being reported. Storage failures are logged
//! and otherwise ignored.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use serde::{Deserialize, Serialize};

use crate::api::{ApiError, AuthApi};
use crate::storage::SessionStorage;

/// Storage key holding the raw bearer token.
pub const TOKEN_KEY: &str = "token";
/// Storage key holding the JSON-serialized profile.
pub const USER_KEY: &str = "user";

const DEFAULT_LOGIN_FAILURE: &str = "Login failed";

// =============================================================================
// TOKEN
// =============================================================================

/// Opaque bearer credential. Never inspected, never printed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

// =============================================================================
// ROLES
// =============================================================================

/// Role names with built-in meaning for redirect priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Administrator,
    Teacher,
    Student,
}

impl Role {
    /// All roles, highest redirect priority first.
    pub const ALL: [Role; 3] = [Role::Administrator, Role::Teacher, Role::Student];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Administrator => "administrator",
            Self::Teacher => "teacher",
            Self::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownRole(s.to_owned()))
    }
}

// =============================================================================
// PROFILE
// =============================================================================

/// Profile returned by the backend. Only `roles` is typed; every other field
/// (`id`, `username`, `email`, ...) is carried verbatim in `extra` so an
/// unexpected shape never invalidates the profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// A missing or `null` role list is empty.
    #[serde(default, deserialize_with = "roles_or_empty")]
    pub roles: BTreeSet<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn roles_or_empty<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<BTreeSet<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl UserProfile {
    /// Profile holding only the given role names.
    #[must_use]
    pub fn with_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { roles: roles.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    /// Display name, when the backend sent a string `username`.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.text_field("username")
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.text_field("email")
    }

    fn text_field(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(serde_json::Value::as_str)
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Read-only view of the session. A profile is never held without a token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    token: Option<Token>,
    user: Option<UserProfile>,
}

impl Session {
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Session backed by `token`. `user` is `None` until the profile is known.
    #[must_use]
    pub fn authenticated(token: Token, user: Option<UserProfile>) -> Self {
        Self { token: Some(token), user }
    }

    #[must_use]
    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    #[must_use]
    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Token restored without its profile; needs a refresh before role checks.
    #[must_use]
    pub fn needs_profile(&self) -> bool {
        self.token.is_some() && self.user.is_none()
    }

    /// Role names of the current user, empty when no profile is loaded.
    #[must_use]
    pub fn roles(&self) -> BTreeSet<&str> {
        self.user
            .iter()
            .flat_map(|u| u.roles.iter().map(String::as_str))
            .collect()
    }

    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.user.as_ref().is_some_and(|u| u.has_role(role.as_str()))
    }

    /// True when the user holds at least one of `allowed`.
    #[must_use]
    pub fn has_any_role(&self, allowed: &BTreeSet<String>) -> bool {
        self.user
            .as_ref()
            .is_some_and(|u| u.roles.iter().any(|r| allowed.contains(r)))
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.has_role(Role::Administrator)
    }

    #[must_use]
    pub fn is_teacher(&self) -> bool {
        self.has_role(Role::Teacher)
    }

    #[must_use]
    pub fn is_student(&self) -> bool {
        self.has_role(Role::Student)
    }

    /// Highest-priority role held: administrator, then teacher, then student.
    #[must_use]
    pub fn primary_role(&self) -> Option<Role> {
        Role::ALL.into_iter().find(|r| self.has_role(*r))
    }
}

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Credentials rejected. The message is meant for display.
    #[error("{0}")]
    InvalidCredentials(String),

    /// The backend could not be reached or answered unusably.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// The token was refused by the profile endpoint.
    #[error("session expired")]
    SessionExpired,

    #[error("profile fetch failed: {0}")]
    ProfileFetchFailure(String),
}

impl AuthError {
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure(_) | Self::ProfileFetchFailure(_))
    }
}

fn login_error(err: ApiError) -> AuthError {
    match err {
        ApiError::Unauthorized { message } => {
            AuthError::InvalidCredentials(message.unwrap_or_else(|| DEFAULT_LOGIN_FAILURE.to_owned()))
        }
        ApiError::Rejected { status, message } if status < 500 => {
            AuthError::InvalidCredentials(message.unwrap_or_else(|| DEFAULT_LOGIN_FAILURE.to_owned()))
        }
        ApiError::Rejected { status, message } => AuthError::NetworkFailure(
            message.unwrap_or_else(|| format!("{DEFAULT_LOGIN_FAILURE} (status {status})")),
        ),
        other => AuthError::NetworkFailure(other.to_string()),
    }
}

fn profile_error(err: ApiError) -> AuthError {
    match err {
        ApiError::Unauthorized { .. } => AuthError::SessionExpired,
        other => AuthError::ProfileFetchFailure(other.to_string()),
    }
}

// =============================================================================
// STORE
// =============================================================================

type ProfileFuture = Shared<BoxFuture<'static, Result<(), AuthError>>>;

/// The slot only holds a weak handle: the fetch future owns a store clone, so
/// a strong handle here would keep an abandoned fetch alive with its store.
struct InFlight {
    token: Token,
    future: WeakShared<BoxFuture<'static, Result<(), AuthError>>>,
}

struct StoreInner {
    session: Mutex<Session>,
    in_flight: Mutex<Option<InFlight>>,
    storage: Arc<dyn SessionStorage>,
    api: Arc<dyn AuthApi>,
}

/// Owner of the session. Clones share the same state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("session", &*self.lock_session())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Build a store, rehydrating token and profile from `storage`.
    ///
    /// No network call is made; a token restored without a profile is
    /// refreshed lazily by [`SessionStore::fetch_profile`].
    #[must_use]
    pub fn restore(storage: Arc<dyn SessionStorage>, api: Arc<dyn AuthApi>) -> Self {
        let session = load_session(storage.as_ref());
        tracing::debug!(
            authenticated = session.is_authenticated(),
            has_profile = session.user().is_some(),
            "session restored"
        );
        Self {
            inner: Arc::new(StoreInner {
                session: Mutex::new(session),
                in_flight: Mutex::new(None),
                storage,
                api,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Copy of the current session.
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.lock_session().clone()
    }

    #[must_use]
    pub fn token(&self) -> Option<Token> {
        self.lock_session().token.clone()
    }

    #[must_use]
    pub fn user(&self) -> Option<UserProfile> {
        self.lock_session().user.clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.lock_session().is_authenticated()
    }

    #[must_use]
    pub fn roles(&self) -> BTreeSet<String> {
        self.lock_session()
            .roles()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.lock_session().is_admin()
    }

    #[must_use]
    pub fn is_teacher(&self) -> bool {
        self.lock_session().is_teacher()
    }

    #[must_use]
    pub fn is_student(&self) -> bool {
        self.lock_session().is_student()
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Authenticate with the backend and load the user's profile.
    ///
    /// Succeeds only when both the token and the profile were obtained.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] for rejected credentials,
    /// [`AuthError::NetworkFailure`] when the backend is unusable, or the
    /// profile error when the follow-up profile fetch fails. The session is
    /// anonymous whenever an error is returned.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        let response = match self.inner.api.login(email, password).await {
            Ok(response) => response,
            Err(e) => {
                self.logout();
                let err = login_error(e);
                tracing::warn!(error = %err, "login rejected");
                return Err(err);
            }
        };

        if response.access_token.trim().is_empty() {
            self.logout();
            return Err(AuthError::NetworkFailure("login response carried an empty token".into()));
        }

        let token = Token::new(response.access_token);
        self.install_token(&token);

        if let Err(err) = self.fetch_profile().await {
            self.logout_if_current(&token);
            tracing::warn!(error = %err, "login aborted: profile unavailable");
            return Err(err);
        }

        let session = self.snapshot();
        if session.token() != Some(&token) || session.user().is_none() {
            // Another login or a logout replaced this session mid-flight.
            return Err(AuthError::SessionExpired);
        }
        tracing::info!(roles = ?session.roles(), "login succeeded");
        Ok(())
    }

    /// Refresh the cached profile for the current token.
    ///
    /// Without a token this is a successful no-op. Concurrent callers for the
    /// same token share one backend request.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SessionExpired`] when the backend refuses the
    /// token and [`AuthError::ProfileFetchFailure`] otherwise. In both cases
    /// the session has been logged out.
    pub async fn fetch_profile(&self) -> Result<(), AuthError> {
        match self.pending_profile_fetch() {
            Some(pending) => pending.await,
            None => Ok(()),
        }
    }

    /// Clear token and profile from memory and storage. Idempotent.
    pub fn logout(&self) {
        let mut session = self.lock_session();
        self.clear(&mut session);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn install_token(&self, token: &Token) {
        let mut session = self.lock_session();
        *session = Session::authenticated(token.clone(), None);
        self.write_key(TOKEN_KEY, token.as_str());
        self.remove_key(USER_KEY);
    }

    fn pending_profile_fetch(&self) -> Option<ProfileFuture> {
        let token = self.token()?;
        let mut slot = self.lock_in_flight();
        let joined = slot
            .as_ref()
            .filter(|f| f.token == token)
            .and_then(|f| f.future.upgrade());
        if let Some(future) = joined {
            tracing::debug!("joining in-flight profile fetch");
            return Some(future);
        }

        let store = self.clone();
        let fetch_token = token.clone();
        let future = async move { store.refresh_profile(fetch_token).await }
            .boxed()
            .shared();
        *slot = future.downgrade().map(|weak| InFlight { token, future: weak });
        Some(future)
    }

    async fn refresh_profile(self, token: Token) -> Result<(), AuthError> {
        let result = self.inner.api.fetch_profile(&token).await;
        let outcome = match result {
            Ok(profile) => {
                if !self.store_profile(&token, profile) {
                    tracing::debug!("discarding profile for superseded token");
                }
                Ok(())
            }
            Err(e) => {
                let err = profile_error(e);
                if self.logout_if_current(&token) {
                    tracing::warn!(error = %err, "profile fetch failed; session cleared");
                }
                Err(err)
            }
        };
        self.finish_in_flight(&token);
        outcome
    }

    fn store_profile(&self, token: &Token, profile: UserProfile) -> bool {
        let mut session = self.lock_session();
        if session.token.as_ref() != Some(token) {
            return false;
        }
        match serde_json::to_string(&profile) {
            Ok(raw) => self.write_key(USER_KEY, &raw),
            Err(e) => tracing::warn!(error = %e, "profile not persisted"),
        }
        session.user = Some(profile);
        true
    }

    fn clear(&self, session: &mut Session) {
        let was_authenticated = session.is_authenticated();
        *session = Session::anonymous();
        self.remove_key(TOKEN_KEY);
        self.remove_key(USER_KEY);
        if was_authenticated {
            tracing::info!("session cleared");
        }
    }

    fn logout_if_current(&self, token: &Token) -> bool {
        let mut session = self.lock_session();
        if session.token.as_ref() != Some(token) {
            return false;
        }
        self.clear(&mut session);
        true
    }

    fn finish_in_flight(&self, token: &Token) {
        let mut slot = self.lock_in_flight();
        if slot.as_ref().is_some_and(|f| &f.token == token) {
            *slot = None;
        }
    }

    fn write_key(&self, key: &str, value: &str) {
        if let Err(e) = self.inner.storage.set(key, value) {
            tracing::warn!(key, error = %e, "session storage write failed");
        }
    }

    fn remove_key(&self, key: &str) {
        if let Err(e) = self.inner.storage.remove(key) {
            tracing::warn!(key, error = %e, "session storage remove failed");
        }
    }
}

// =============================================================================
// REHYDRATION
// =============================================================================

fn read_key(storage: &dyn SessionStorage, key: &str) -> Option<String> {
    match storage.get(key) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(key, error = %e, "session storage read failed; treating as absent");
            None
        }
    }
}

fn discard_key(storage: &dyn SessionStorage, key: &str) {
    if let Err(e) = storage.remove(key) {
        tracing::warn!(key, error = %e, "session storage remove failed");
    }
}

fn load_session(storage: &dyn SessionStorage) -> Session {
    let token = read_key(storage, TOKEN_KEY)
        .filter(|t| !t.trim().is_empty())
        .map(Token::new);

    let user = read_key(storage, USER_KEY).and_then(|raw| match serde_json::from_str::<UserProfile>(&raw) {
        Ok(user) => Some(user),
        Err(e) => {
            tracing::warn!(error = %e, "persisted profile unreadable; discarding");
            discard_key(storage, USER_KEY);
            None
        }
    });

    match (token, user) {
        (Some(token), user) => Session::authenticated(token, user),
        (None, Some(_)) => {
            tracing::warn!("persisted profile without token; discarding");
            discard_key(storage, USER_KEY);
            Session::anonymous()
        }
        (None, None) => Session::anonymous(),
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
