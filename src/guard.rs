//! Navigation guard: allow or redirect each attempted transition.
//!
//! DESIGN
//! ======
//! Evaluation is a straight-line procedure over the current session and the
//! destination's descriptor. The only suspension point is rehydration: a
//! token restored without its profile is refreshed before any role check.
//! No state is kept between evaluations.
//!
//! ERROR HANDLING
//! ==============
//! A failed refresh has already logged the session out, so the guard simply
//! re-reads the session and lets the authentication check redirect to login.
//! Nothing escapes `evaluate` as an error.

use std::sync::Arc;

use crate::routes::{RouteDescriptor, RouteRegistry};
use crate::session::{Role, Session, SessionStore};

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("redirect target {0:?} is not a registered route")]
    UnknownTarget(String),
}

/// Route names the guard redirects to. These are the only destination names
/// the guard knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTargets {
    pub login: String,
    pub register: String,
    pub admin_default: String,
    pub teacher_default: String,
    pub generic_default: String,
}

impl Default for RedirectTargets {
    fn default() -> Self {
        Self {
            login: "login".into(),
            register: "register".into(),
            admin_default: "admin".into(),
            teacher_default: "teacher-dashboard".into(),
            generic_default: "dashboard".into(),
        }
    }
}

impl RedirectTargets {
    fn names(&self) -> [&str; 5] {
        [
            self.login.as_str(),
            self.register.as_str(),
            self.admin_default.as_str(),
            self.teacher_default.as_str(),
            self.generic_default.as_str(),
        ]
    }

    /// Landing destination for the session's highest-priority role.
    #[must_use]
    pub fn role_default(&self, session: &Session) -> &str {
        match session.primary_role() {
            Some(Role::Administrator) => &self.admin_default,
            Some(Role::Teacher) => &self.teacher_default,
            Some(Role::Student) | None => &self.generic_default,
        }
    }

    fn is_auth_page(&self, name: &str) -> bool {
        name == self.login || name == self.register
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectReason {
    /// Destination requires a session and there is none.
    LoginRequired,
    /// Session holds none of the destination's roles.
    Forbidden,
    /// Signed-in user asked for the login or registration page.
    AlreadyAuthenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationDecision {
    Allow,
    Redirect { to: String, reason: RedirectReason },
}

impl NavigationDecision {
    fn redirect(to: &str, reason: RedirectReason) -> Self {
        Self::Redirect { to: to.to_owned(), reason }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Route name to redirect to, if any.
    #[must_use]
    pub fn redirect_target(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Redirect { to, .. } => Some(to),
        }
    }
}

/// Decide a transition to the route named `destination` (if it has a name)
/// guarded by `descriptor`.
#[must_use]
pub fn decide(
    session: &Session,
    destination: Option<&str>,
    descriptor: &RouteDescriptor,
    targets: &RedirectTargets,
) -> NavigationDecision {
    if descriptor.requires_auth && !session.is_authenticated() {
        return NavigationDecision::redirect(&targets.login, RedirectReason::LoginRequired);
    }

    if !descriptor.allowed_roles.is_empty() && !session.has_any_role(&descriptor.allowed_roles) {
        return NavigationDecision::redirect(targets.role_default(session), RedirectReason::Forbidden);
    }

    if session.is_authenticated() && destination.is_some_and(|name| targets.is_auth_page(name)) {
        return NavigationDecision::redirect(targets.role_default(session), RedirectReason::AlreadyAuthenticated);
    }

    NavigationDecision::Allow
}

// =============================================================================
// GUARD
// =============================================================================

pub struct NavigationGuard {
    store: SessionStore,
    registry: Arc<RouteRegistry>,
    targets: RedirectTargets,
}

impl NavigationGuard {
    /// Guard over `registry` using the default redirect targets.
    ///
    /// # Errors
    ///
    /// Returns an error if a default target is missing from `registry`.
    pub fn new(store: SessionStore, registry: Arc<RouteRegistry>) -> Result<Self, GuardError> {
        Self::with_targets(store, registry, RedirectTargets::default())
    }

    /// # Errors
    ///
    /// Returns an error if any of `targets` is missing from `registry`.
    pub fn with_targets(
        store: SessionStore,
        registry: Arc<RouteRegistry>,
        targets: RedirectTargets,
    ) -> Result<Self, GuardError> {
        if let Some(missing) = targets.names().into_iter().find(|n| registry.get(n).is_none()) {
            return Err(GuardError::UnknownTarget(missing.to_owned()));
        }
        Ok(Self { store, registry, targets })
    }

    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    #[must_use]
    pub fn targets(&self) -> &RedirectTargets {
        &self.targets
    }

    /// Evaluate an attempted transition to `path`.
    ///
    /// Paths matching no registered route carry no access requirements.
    pub async fn evaluate(&self, path: &str) -> NavigationDecision {
        if self.store.snapshot().needs_profile() {
            if let Err(e) = self.store.fetch_profile().await {
                tracing::debug!(error = %e, "profile refresh failed during navigation");
            }
        }

        let session = self.store.snapshot();
        let public = RouteDescriptor::public();
        let matched = self.registry.resolve(path);
        let (name, descriptor) = matched
            .as_ref()
            .map_or((None, &public), |m| (Some(m.name), m.descriptor));

        let decision = decide(&session, name, descriptor, &self.targets);
        match &decision {
            NavigationDecision::Allow => tracing::debug!(path, route = ?name, "navigation allowed"),
            NavigationDecision::Redirect { to, reason } => {
                tracing::info!(path, route = ?name, to = %to, ?reason, "navigation redirected");
            }
        }
        decision
    }

    /// Concrete path for a decision's redirect target.
    #[must_use]
    pub fn redirect_path(&self, decision: &NavigationDecision) -> Option<&str> {
        decision
            .redirect_target()
            .and_then(|name| self.registry.path_for(name))
    }
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod tests;
