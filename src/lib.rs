//! # campus-auth
//!
//! Session management and navigation gating for the learning portal client.
//!
//! The [`session::SessionStore`] owns the bearer token and cached profile and
//! mirrors them into durable [`storage`]. The [`guard::NavigationGuard`]
//! consults the store and the [`routes::RouteRegistry`] on every attempted
//! transition and answers allow or redirect. Network access goes through the
//! [`api::AuthApi`] seam.

pub mod api;
pub mod config;
pub mod guard;
pub mod routes;
pub mod session;
pub mod storage;

pub use api::{ApiError, AuthApi, HttpAuthApi};
pub use config::ClientConfig;
pub use guard::{NavigationDecision, NavigationGuard, RedirectReason, RedirectTargets};
pub use routes::{RouteDescriptor, RouteEntry, RouteRegistry};
pub use session::{AuthError, Role, Session, SessionStore, Token, UserProfile};
pub use storage::{FileStorage, MemoryStorage, SessionStorage};
