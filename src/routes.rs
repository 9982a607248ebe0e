//! Route registry: path patterns mapped to access descriptors.
//!
//! DESIGN
//! ======
//! Entries are authored data (code or JSON) and matched in registration
//! order. Patterns are `/`-separated; a `:name` segment captures exactly one
//! non-empty path segment. Query strings, fragments and trailing slashes are
//! ignored when matching.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::session::Role;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid route pattern {path:?}: {reason}")]
    InvalidPattern { path: String, reason: &'static str },
    #[error("duplicate route name: {0}")]
    DuplicateName(String),
    #[error("route table parse failed: {0}")]
    Parse(#[from] serde_json::Error),
}

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// Static access metadata of a destination.
///
/// An empty `allowed_roles` admits any authenticated user, or everyone when
/// `requires_auth` is false.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDescriptor {
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub allowed_roles: BTreeSet<String>,
}

impl RouteDescriptor {
    #[must_use]
    pub fn public() -> Self {
        Self::default()
    }

    /// Any signed-in user.
    #[must_use]
    pub fn authenticated() -> Self {
        Self { requires_auth: true, allowed_roles: BTreeSet::new() }
    }

    /// Signed-in users holding at least one of `roles`.
    #[must_use]
    pub fn for_roles(roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            requires_auth: true,
            allowed_roles: roles.into_iter().map(|r| r.as_str().to_owned()).collect(),
        }
    }
}

/// One named destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "meta", default)]
    pub descriptor: RouteDescriptor,
}

impl RouteEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>, descriptor: RouteDescriptor) -> Self {
        Self { name: name.into(), path: path.into(), descriptor }
    }
}

// =============================================================================
// PATTERNS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    path[..end].split('/').filter(|s| !s.is_empty())
}

fn parse_pattern(path: &str) -> Vec<Segment> {
    path_segments(path)
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_owned()),
            None => Segment::Literal(s.to_owned()),
        })
        .collect()
}

fn validate_pattern(path: &str, segments: &[Segment]) -> Result<(), RouteError> {
    let invalid = |reason| RouteError::InvalidPattern { path: path.to_owned(), reason };
    if !path.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if path.contains(['?', '#']) {
        return Err(invalid("must not contain a query or fragment"));
    }
    let mut params = HashSet::new();
    for segment in segments {
        if let Segment::Param(name) = segment {
            if name.is_empty() {
                return Err(invalid("parameter name is empty"));
            }
            if !params.insert(name.as_str()) {
                return Err(invalid("parameter name repeated"));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    entry: RouteEntry,
    segments: Vec<Segment>,
}

impl CompiledRoute {
    fn new(entry: RouteEntry) -> Self {
        let segments = parse_pattern(&entry.path);
        Self { entry, segments }
    }

    fn captures(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        let mut actual = path_segments(path);
        for segment in &self.segments {
            let value = actual.next()?;
            match segment {
                Segment::Literal(lit) if lit == value => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), value.to_owned());
                }
            }
        }
        actual.next().is_none().then_some(params)
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Result of resolving a concrete path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub name: &'a str,
    pub pattern: &'a str,
    pub descriptor: &'a RouteDescriptor,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct RouteRegistry {
    routes: Vec<CompiledRoute>,
}

impl RouteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a destination.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed pattern or a name already in use.
    pub fn add(&mut self, entry: RouteEntry) -> Result<(), RouteError> {
        if self.get(&entry.name).is_some() {
            return Err(RouteError::DuplicateName(entry.name));
        }
        let compiled = CompiledRoute::new(entry);
        validate_pattern(&compiled.entry.path, &compiled.segments)?;
        self.routes.push(compiled);
        Ok(())
    }

    /// Build a registry from entries, in order.
    ///
    /// # Errors
    ///
    /// Returns the first entry error encountered.
    pub fn from_entries(entries: impl IntoIterator<Item = RouteEntry>) -> Result<Self, RouteError> {
        let mut registry = Self::new();
        for entry in entries {
            registry.add(entry)?;
        }
        Ok(registry)
    }

    /// Parse a JSON array of `{name, path, meta: {requiresAuth, allowedRoles}}`.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or an invalid entry.
    pub fn from_json(raw: &str) -> Result<Self, RouteError> {
        let entries: Vec<RouteEntry> = serde_json::from_str(raw)?;
        Self::from_entries(entries)
    }

    /// The learning portal's route table.
    #[must_use]
    pub fn campus() -> Self {
        use Role::{Administrator, Student, Teacher};

        let entries = [
            RouteEntry::new("home", "/", RouteDescriptor::public()),
            RouteEntry::new("about", "/about", RouteDescriptor::public()),
            RouteEntry::new("login", "/login", RouteDescriptor::public()),
            RouteEntry::new("register", "/register", RouteDescriptor::public()),
            RouteEntry::new("dashboard", "/dashboard", RouteDescriptor::for_roles([Student, Teacher, Administrator])),
            RouteEntry::new("teacher-dashboard", "/teacher-dashboard", RouteDescriptor::for_roles([Teacher, Administrator])),
            RouteEntry::new("admin", "/admin", RouteDescriptor::for_roles([Administrator])),
            RouteEntry::new("manage-courses", "/manage-courses", RouteDescriptor::for_roles([Teacher, Administrator])),
            RouteEntry::new(
                "course-details",
                "/courses/:courseId",
                RouteDescriptor::for_roles([Student, Teacher, Administrator]),
            ),
            RouteEntry::new(
                "course-progress",
                "/courses/:courseId/progress",
                RouteDescriptor::for_roles([Teacher, Administrator]),
            ),
        ];
        Self { routes: entries.into_iter().map(CompiledRoute::new).collect() }
    }

    /// First route whose pattern matches `path`.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|route| {
            route.captures(path).map(|params| RouteMatch {
                name: &route.entry.name,
                pattern: &route.entry.path,
                descriptor: &route.entry.descriptor,
                params,
            })
        })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RouteEntry> {
        self.routes
            .iter()
            .map(|r| &r.entry)
            .find(|e| e.name == name)
    }

    /// Pattern registered under `name`.
    #[must_use]
    pub fn path_for(&self, name: &str) -> Option<&str> {
        self.get(name).map(|e| e.path.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.iter().map(|r| &r.entry)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
#[path = "routes_test.rs"]
mod tests;
