use std::time::Duration;

use super::*;
use crate::api::{LoginResponse, parse_profile_response};
use crate::api::test_helpers::MockApi;
use crate::storage::{MemoryStorage, StorageError};

fn seeded_storage(token: Option<&str>, user: Option<&str>) -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    if let Some(token) = token {
        storage.set(TOKEN_KEY, token).unwrap();
    }
    if let Some(user) = user {
        storage.set(USER_KEY, user).unwrap();
    }
    storage
}

fn stored(storage: &MemoryStorage, key: &str) -> Option<String> {
    storage.get(key).unwrap()
}

/// Storage whose every operation fails.
struct BrokenStorage;

impl SessionStorage for BrokenStorage {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Corrupt("unreadable".into()))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Corrupt("read-only".into()))
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Corrupt("read-only".into()))
    }
}

// =============================================================================
// Rehydration
// =============================================================================

#[test]
fn restore_empty_storage_is_anonymous() {
    let store = SessionStore::restore(seeded_storage(None, None), Arc::new(MockApi::new("t", &[])));
    assert_eq!(store.snapshot(), Session::anonymous());
    assert!(!store.is_authenticated());
}

#[test]
fn restore_token_and_profile() {
    let storage = seeded_storage(Some("tok-1"), Some(r#"{"username": "ada", "roles": ["teacher"]}"#));
    let store = SessionStore::restore(storage, Arc::new(MockApi::new("t", &[])));

    assert_eq!(store.token(), Some(Token::new("tok-1")));
    assert!(store.is_teacher());
    assert_eq!(store.user().unwrap().username(), Some("ada"));
}

#[test]
fn restore_token_without_profile_needs_refresh() {
    let store = SessionStore::restore(seeded_storage(Some("tok-1"), None), Arc::new(MockApi::new("t", &[])));
    let session = store.snapshot();
    assert!(session.is_authenticated());
    assert!(session.needs_profile());
    assert!(session.roles().is_empty());
}

#[test]
fn restore_profile_without_token_is_discarded() {
    let storage = seeded_storage(None, Some(r#"{"roles": ["administrator"]}"#));
    let store = SessionStore::restore(storage.clone(), Arc::new(MockApi::new("t", &[])));

    assert_eq!(store.snapshot(), Session::anonymous());
    assert!(stored(&storage, USER_KEY).is_none());
}

#[test]
fn restore_unreadable_profile_is_discarded() {
    let storage = seeded_storage(Some("tok-1"), Some("{not json"));
    let store = SessionStore::restore(storage.clone(), Arc::new(MockApi::new("t", &[])));

    assert!(store.snapshot().needs_profile());
    assert!(stored(&storage, USER_KEY).is_none());
    assert_eq!(stored(&storage, TOKEN_KEY).as_deref(), Some("tok-1"));
}

#[test]
fn restore_blank_token_is_anonymous() {
    let store = SessionStore::restore(seeded_storage(Some("  "), None), Arc::new(MockApi::new("t", &[])));
    assert!(!store.is_authenticated());
}

#[test]
fn restore_with_failing_storage_is_anonymous() {
    let store = SessionStore::restore(Arc::new(BrokenStorage), Arc::new(MockApi::new("t", &[])));
    assert!(!store.is_authenticated());
}

// =============================================================================
// login
// =============================================================================

#[tokio::test]
async fn login_success_sets_and_persists_session() {
    let storage = seeded_storage(None, None);
    let api = Arc::new(MockApi::new("tok-new", &["student"]));
    let store = SessionStore::restore(storage.clone(), api.clone());

    store.login("ada@example.test", "pw").await.unwrap();

    assert_eq!(store.token(), Some(Token::new("tok-new")));
    assert!(store.is_student());
    assert_eq!(api.login_calls(), 1);
    assert_eq!(api.profile_calls(), 1);
    assert_eq!(api.seen_tokens(), vec!["tok-new".to_owned()]);
    assert_eq!(stored(&storage, TOKEN_KEY).as_deref(), Some("tok-new"));
    let persisted: UserProfile = serde_json::from_str(&stored(&storage, USER_KEY).unwrap()).unwrap();
    assert!(persisted.has_role("student"));
}

#[tokio::test]
async fn login_invalid_credentials_surfaces_backend_message() {
    let api = Arc::new(MockApi::new("t", &[]));
    api.set_login(Err(ApiError::Unauthorized { message: Some("Invalid credentials".into()) }));
    let store = SessionStore::restore(seeded_storage(None, None), api.clone());

    let err = store.login("ada@example.test", "wrong").await.unwrap_err();
    assert_eq!(err, AuthError::InvalidCredentials("Invalid credentials".into()));
    assert_eq!(err.to_string(), "Invalid credentials");
    assert!(!store.is_authenticated());
    assert_eq!(api.profile_calls(), 0);
}

#[tokio::test]
async fn login_rejection_without_message_uses_default() {
    let api = Arc::new(MockApi::new("t", &[]));
    api.set_login(Err(ApiError::Rejected { status: 400, message: None }));
    let store = SessionStore::restore(seeded_storage(None, None), api);

    let err = store.login("", "").await.unwrap_err();
    assert_eq!(err, AuthError::InvalidCredentials("Login failed".into()));
}

#[tokio::test]
async fn login_transport_failure_is_network_failure() {
    let api = Arc::new(MockApi::new("t", &[]));
    api.set_login(Err(ApiError::Request("connection refused".into())));
    let store = SessionStore::restore(seeded_storage(None, None), api);

    let err = store.login("ada@example.test", "pw").await.unwrap_err();
    assert!(matches!(err, AuthError::NetworkFailure(ref m) if m.contains("connection refused")));
    assert!(err.retryable());
}

#[tokio::test]
async fn login_server_error_is_network_failure() {
    let api = Arc::new(MockApi::new("t", &[]));
    api.set_login(Err(ApiError::Rejected { status: 502, message: None }));
    let store = SessionStore::restore(seeded_storage(None, None), api);

    let err = store.login("ada@example.test", "pw").await.unwrap_err();
    assert_eq!(err, AuthError::NetworkFailure("Login failed (status 502)".into()));
}

#[tokio::test]
async fn login_failure_clears_previous_session() {
    let storage = seeded_storage(Some("old"), Some(r#"{"roles": ["teacher"]}"#));
    let api = Arc::new(MockApi::new("t", &[]));
    api.set_login(Err(ApiError::Unauthorized { message: None }));
    let store = SessionStore::restore(storage.clone(), api);

    assert!(store.login("ada@example.test", "wrong").await.is_err());
    assert_eq!(store.snapshot(), Session::anonymous());
    assert!(stored(&storage, TOKEN_KEY).is_none());
    assert!(stored(&storage, USER_KEY).is_none());
}

#[tokio::test]
async fn login_fails_when_profile_fetch_fails() {
    let storage = seeded_storage(None, None);
    let api = Arc::new(MockApi::new("tok-new", &["student"]));
    api.set_profile(Err(ApiError::Rejected { status: 500, message: None }));
    let store = SessionStore::restore(storage.clone(), api.clone());

    let err = store.login("ada@example.test", "pw").await.unwrap_err();
    assert!(matches!(err, AuthError::ProfileFetchFailure(_)));
    assert_eq!(store.snapshot(), Session::anonymous());
    assert!(stored(&storage, TOKEN_KEY).is_none());
    assert_eq!(api.profile_calls(), 1);
}

#[tokio::test]
async fn login_with_empty_token_fails() {
    let api = Arc::new(MockApi::new("t", &[]));
    api.set_login(Ok(LoginResponse { access_token: String::new() }));
    let store = SessionStore::restore(seeded_storage(None, None), api.clone());

    assert!(matches!(store.login("a", "b").await, Err(AuthError::NetworkFailure(_))));
    assert!(!store.is_authenticated());
    assert_eq!(api.profile_calls(), 0);
}

#[tokio::test]
async fn login_overtaken_by_logout_reports_expired() {
    let storage = seeded_storage(None, None);
    let api = Arc::new(MockApi::new("tok-new", &["student"]).with_profile_delay(Duration::from_millis(30)));
    let store = SessionStore::restore(storage.clone(), api);

    let logout_soon = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.logout();
    };
    let (result, ()) = tokio::join!(store.login("ada@example.test", "pw"), logout_soon);

    assert_eq!(result, Err(AuthError::SessionExpired));
    assert_eq!(store.snapshot(), Session::anonymous());
    assert!(stored(&storage, TOKEN_KEY).is_none());
    assert!(stored(&storage, USER_KEY).is_none());
}

#[tokio::test]
async fn login_then_reload_reconstructs_session_without_network() {
    let storage = seeded_storage(None, None);
    let store = SessionStore::restore(storage.clone(), Arc::new(MockApi::new("tok-rt", &["teacher", "student"])));
    store.login("ada@example.test", "pw").await.unwrap();

    let fresh_api = Arc::new(MockApi::new("unused", &[]));
    let reloaded = SessionStore::restore(storage, fresh_api.clone());

    assert_eq!(reloaded.snapshot(), store.snapshot());
    assert_eq!(reloaded.roles(), store.roles());
    assert!(!reloaded.snapshot().needs_profile());
    assert_eq!(fresh_api.login_calls(), 0);
    assert_eq!(fresh_api.profile_calls(), 0);
}

// =============================================================================
// fetch_profile
// =============================================================================

#[tokio::test]
async fn fetch_profile_without_token_is_noop() {
    let api = Arc::new(MockApi::new("t", &["student"]));
    let store = SessionStore::restore(seeded_storage(None, None), api.clone());

    assert!(store.fetch_profile().await.is_ok());
    assert_eq!(api.profile_calls(), 0);
    assert!(store.user().is_none());
}

#[tokio::test]
async fn fetch_profile_replaces_and_persists_user() {
    let storage = seeded_storage(Some("tok-1"), Some(r#"{"roles": ["student"]}"#));
    let api = Arc::new(MockApi::new("t", &["teacher"]));
    let store = SessionStore::restore(storage.clone(), api.clone());

    store.fetch_profile().await.unwrap();

    assert!(store.is_teacher());
    assert!(!store.is_student());
    assert_eq!(api.seen_tokens(), vec!["tok-1".to_owned()]);
    let persisted: UserProfile = serde_json::from_str(&stored(&storage, USER_KEY).unwrap()).unwrap();
    assert_eq!(persisted.roles, BTreeSet::from(["teacher".to_owned()]));
}

#[tokio::test]
async fn fetch_profile_unauthorized_logs_out() {
    let storage = seeded_storage(Some("expired"), Some(r#"{"roles": ["student"]}"#));
    let api = Arc::new(MockApi::new("t", &[]));
    api.set_profile(Err(ApiError::Unauthorized { message: None }));
    let store = SessionStore::restore(storage.clone(), api);

    let err = store.fetch_profile().await.unwrap_err();

    assert_eq!(err, AuthError::SessionExpired);
    assert!(store.token().is_none());
    assert!(store.user().is_none());
    assert!(stored(&storage, TOKEN_KEY).is_none());
    assert!(stored(&storage, USER_KEY).is_none());
}

#[tokio::test]
async fn fetch_profile_transport_failure_logs_out() {
    let api = Arc::new(MockApi::new("t", &[]));
    api.set_profile(Err(ApiError::Request("timed out".into())));
    let store = SessionStore::restore(seeded_storage(Some("tok-1"), None), api);

    let err = store.fetch_profile().await.unwrap_err();
    assert!(matches!(err, AuthError::ProfileFetchFailure(ref m) if m.contains("timed out")));
    assert!(!store.is_authenticated());
}

#[tokio::test]
async fn concurrent_fetches_share_one_request() {
    let api = Arc::new(MockApi::new("t", &["student"]).with_profile_delay(Duration::from_millis(20)));
    let store = SessionStore::restore(seeded_storage(Some("tok-1"), None), api.clone());

    let (a, b, c) = tokio::join!(store.fetch_profile(), store.fetch_profile(), store.fetch_profile());

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(api.profile_calls(), 1);
    assert!(store.is_student());
}

#[tokio::test]
async fn concurrent_fetch_failure_reaches_every_caller() {
    let api = Arc::new(MockApi::new("t", &[]).with_profile_delay(Duration::from_millis(20)));
    api.set_profile(Err(ApiError::Unauthorized { message: None }));
    let store = SessionStore::restore(seeded_storage(Some("tok-1"), None), api.clone());

    let (a, b) = tokio::join!(store.fetch_profile(), store.fetch_profile());

    assert_eq!(a, Err(AuthError::SessionExpired));
    assert_eq!(b, Err(AuthError::SessionExpired));
    assert_eq!(api.profile_calls(), 1);
}

#[tokio::test]
async fn sequential_fetches_each_hit_backend() {
    let api = Arc::new(MockApi::new("t", &["student"]));
    let store = SessionStore::restore(seeded_storage(Some("tok-1"), None), api.clone());

    store.fetch_profile().await.unwrap();
    store.fetch_profile().await.unwrap();

    assert_eq!(api.profile_calls(), 2);
}

#[tokio::test]
async fn loosely_typed_profile_keeps_session() {
    let api = Arc::new(MockApi::new("t", &[]));
    api.set_profile(parse_profile_response(200, r#"{"id": 42, "username": "ada", "roles": null}"#));
    let store = SessionStore::restore(seeded_storage(Some("tok-1"), None), api);

    store.fetch_profile().await.unwrap();

    assert!(store.is_authenticated());
    let user = store.user().unwrap();
    assert!(user.roles.is_empty());
    assert_eq!(user.extra.get("id"), Some(&serde_json::json!(42)));
    assert_eq!(user.username(), Some("ada"));
}

#[tokio::test]
async fn abandoned_fetch_releases_store_and_is_retried() {
    let api = Arc::new(MockApi::new("t", &["teacher"]).with_profile_delay(Duration::from_millis(30)));
    let store = SessionStore::restore(seeded_storage(Some("tok-1"), None), api.clone());

    let abandoned = tokio::time::timeout(Duration::from_millis(5), store.fetch_profile()).await;
    assert!(abandoned.is_err());
    assert_eq!(Arc::strong_count(&store.inner), 1);

    store.fetch_profile().await.unwrap();
    assert!(store.is_teacher());
    assert_eq!(api.profile_calls(), 2);
}

#[tokio::test]
async fn profile_arriving_after_logout_is_dropped() {
    let storage = seeded_storage(Some("tok-1"), None);
    let api = Arc::new(MockApi::new("t", &["administrator"]).with_profile_delay(Duration::from_millis(30)));
    let store = SessionStore::restore(storage.clone(), api);

    let logout_soon = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.logout();
    };
    let (fetched, ()) = tokio::join!(store.fetch_profile(), logout_soon);

    assert!(fetched.is_ok());
    assert_eq!(store.snapshot(), Session::anonymous());
    assert!(stored(&storage, USER_KEY).is_none());
}

// =============================================================================
// logout
// =============================================================================

#[test]
fn logout_is_idempotent() {
    let storage = seeded_storage(Some("tok-1"), Some(r#"{"roles": ["student"]}"#));
    let store = SessionStore::restore(storage.clone(), Arc::new(MockApi::new("t", &[])));

    store.logout();
    let first = store.snapshot();
    store.logout();

    assert_eq!(first, Session::anonymous());
    assert_eq!(store.snapshot(), first);
    assert!(stored(&storage, TOKEN_KEY).is_none());
    assert!(stored(&storage, USER_KEY).is_none());
}

#[test]
fn logout_survives_storage_failure() {
    let store = SessionStore::restore(Arc::new(BrokenStorage), Arc::new(MockApi::new("t", &[])));
    store.logout();
    assert!(!store.is_authenticated());
}

// =============================================================================
// Session predicates
// =============================================================================

fn session_with_roles(roles: &[&str]) -> Session {
    Session::authenticated(Token::new("t"), Some(UserProfile::with_roles(roles.iter().copied())))
}

#[test]
fn anonymous_session_has_no_roles() {
    let session = Session::anonymous();
    assert!(!session.is_authenticated());
    assert!(session.roles().is_empty());
    assert!(!session.is_admin() && !session.is_teacher() && !session.is_student());
    assert_eq!(session.primary_role(), None);
}

#[test]
fn role_predicates_follow_profile() {
    let session = session_with_roles(&["teacher", "student"]);
    assert!(session.is_teacher());
    assert!(session.is_student());
    assert!(!session.is_admin());
}

#[test]
fn primary_role_prefers_administrator_regardless_of_order() {
    for roles in [["student", "teacher", "administrator"], ["administrator", "teacher", "student"]] {
        assert_eq!(session_with_roles(&roles).primary_role(), Some(Role::Administrator));
    }
    assert_eq!(session_with_roles(&["student", "teacher"]).primary_role(), Some(Role::Teacher));
    assert_eq!(session_with_roles(&["student"]).primary_role(), Some(Role::Student));
    assert_eq!(session_with_roles(&["librarian"]).primary_role(), None);
}

#[test]
fn has_any_role_requires_intersection() {
    let session = session_with_roles(&["student"]);
    let staff: BTreeSet<String> = ["teacher", "administrator"].into_iter().map(String::from).collect();
    assert!(!session.has_any_role(&staff));
    assert!(session_with_roles(&["teacher"]).has_any_role(&staff));
    assert!(!Session::anonymous().has_any_role(&staff));
}

#[test]
fn role_parse_and_display() {
    assert_eq!("teacher".parse::<Role>(), Ok(Role::Teacher));
    assert_eq!(Role::Administrator.to_string(), "administrator");
    assert_eq!("janitor".parse::<Role>(), Err(UnknownRole("janitor".into())));
}

#[test]
fn token_debug_is_redacted() {
    let debug = format!("{:?}", Token::new("secret-bearer"));
    assert!(!debug.contains("secret-bearer"));
}

#[test]
fn profile_preserves_unknown_fields() {
    let json = r#"{"id": "u-1", "email": "ada@example.test", "roles": ["student"], "first_name": "Ada"}"#;
    let profile: UserProfile = serde_json::from_str(json).unwrap();
    assert_eq!(profile.extra.get("first_name").and_then(|v| v.as_str()), Some("Ada"));

    let back: serde_json::Value = serde_json::to_value(&profile).unwrap();
    assert_eq!(back["first_name"], "Ada");
    assert_eq!(back["id"], "u-1");
}

#[test]
fn persisted_profile_with_numeric_id_and_null_roles_is_restored() {
    let storage = seeded_storage(Some("tok-1"), Some(r#"{"id": 42, "email": "ada@example.test", "roles": null}"#));
    let store = SessionStore::restore(storage.clone(), Arc::new(MockApi::new("t", &[])));

    let session = store.snapshot();
    assert!(!session.needs_profile());
    assert!(session.roles().is_empty());
    assert_eq!(session.user().unwrap().email(), Some("ada@example.test"));
    assert!(stored(&storage, USER_KEY).is_some());
}

#[test]
fn profile_without_roles_has_empty_role_set() {
    let profile: UserProfile = serde_json::from_str(r#"{"username": "ghost"}"#).unwrap();
    assert!(profile.roles.is_empty());
}
