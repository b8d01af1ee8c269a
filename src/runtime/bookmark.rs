//! Bookmarks: named, scoped suspension points
//!
//! The [`BookmarkManager`] maps `(scope, name)` to the owning instance and the
//! callback tag to invoke when the bookmark is resumed. It never holds a
//! registration whose owner has left the live states; the executor removes
//! registrations whenever an owner completes, faults or is aborted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::activity::CallbackTag;
use super::error::{BookmarkError, BookmarkResult};
use super::instance::InstanceId;

/// Isolation scope for bookmark names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BookmarkScope {
    /// Workflow-wide scope
    Default,
    /// Scope created by an activity
    Named(Uuid),
}

impl fmt::Display for BookmarkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookmarkScope::Default => write!(f, "default"),
            BookmarkScope::Named(id) => write!(f, "{}", id),
        }
    }
}

/// A named suspension point
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bookmark {
    /// Scope; ordered first so listings group by scope
    pub scope: BookmarkScope,
    /// Name, unique within its scope
    pub name: String,
}

impl Bookmark {
    /// A bookmark in the default scope
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: BookmarkScope::Default,
        }
    }

    /// A bookmark in an explicit scope
    pub fn in_scope(name: impl Into<String>, scope: BookmarkScope) -> Self {
        Self {
            name: name.into(),
            scope,
        }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            BookmarkScope::Default => write!(f, "{}", self.name),
            BookmarkScope::Named(id) => write!(f, "{}@{}", self.name, id),
        }
    }
}

/// Registration options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkOptions {
    /// Stay registered after each resumption
    pub multiple_resume: bool,
    /// Do not keep the owner from completing
    pub non_blocking: bool,
}

impl BookmarkOptions {
    /// One-shot, blocking
    pub fn none() -> Self {
        Self::default()
    }

    /// Resumable any number of times, blocking
    pub fn multiple_resume() -> Self {
        Self {
            multiple_resume: true,
            non_blocking: false,
        }
    }

    /// One-shot, discarded when the owner completes
    pub fn non_blocking() -> Self {
        Self {
            multiple_resume: false,
            non_blocking: true,
        }
    }

    /// Whether the bookmark contributes to the owner's busy count
    pub fn is_blocking(&self) -> bool {
        !self.non_blocking
    }
}

/// A registered bookmark
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkRegistration {
    /// The bookmark
    pub bookmark: Bookmark,
    /// Owning instance
    pub owner: InstanceId,
    /// Callback on the owner's activity
    pub callback: Option<CallbackTag>,
    /// Options
    pub options: BookmarkOptions,
}

/// Outcome of a resumption request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookmarkResumptionResult {
    /// A resumption work item was queued
    Success,
    /// No such bookmark
    NotFound,
    /// The workflow cannot accept stimulus right now
    NotReady,
}

/// Host-visible description of a pending bookmark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkInfo {
    /// The bookmark
    pub bookmark: Bookmark,
    /// Owning instance
    pub owner: InstanceId,
    /// Display name of the owner's activity
    pub owner_name: String,
    /// Options
    pub options: BookmarkOptions,
}

/// Scoped name registry
#[derive(Debug, Default)]
pub struct BookmarkManager {
    registrations: BTreeMap<Bookmark, BookmarkRegistration>,
    scopes: BTreeMap<Uuid, InstanceId>,
}

impl BookmarkManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a named scope owned by `owner`
    pub fn create_scope(&mut self, owner: InstanceId) -> BookmarkScope {
        let id = Uuid::new_v4();
        self.scopes.insert(id, owner);
        BookmarkScope::Named(id)
    }

    /// Re-seed a scope (reconstruction)
    pub(crate) fn restore_scope(&mut self, id: Uuid, owner: InstanceId) {
        self.scopes.insert(id, owner);
    }

    /// Owner of a named scope
    pub fn scope_owner(&self, scope: &BookmarkScope) -> Option<InstanceId> {
        match scope {
            BookmarkScope::Default => None,
            BookmarkScope::Named(id) => self.scopes.get(id).copied(),
        }
    }

    /// True when bookmarks may be registered in the scope
    pub fn scope_exists(&self, scope: &BookmarkScope) -> bool {
        match scope {
            BookmarkScope::Default => true,
            BookmarkScope::Named(id) => self.scopes.contains_key(id),
        }
    }

    /// Register a bookmark
    ///
    /// Re-registering a multiple-resume bookmark by the same owner is
    /// idempotent; every other collision is a [`BookmarkError::DuplicateName`].
    pub fn register(
        &mut self,
        bookmark: Bookmark,
        owner: InstanceId,
        callback: Option<CallbackTag>,
        options: BookmarkOptions,
    ) -> BookmarkResult<RegisterOutcome> {
        if !self.scope_exists(&bookmark.scope) {
            return Err(BookmarkError::UnknownScope(bookmark.scope));
        }

        if let Some(existing) = self.registrations.get(&bookmark) {
            if existing.options.multiple_resume
                && options.multiple_resume
                && existing.owner == owner
            {
                return Ok(RegisterOutcome::AlreadyRegistered);
            }
            return Err(BookmarkError::DuplicateName {
                name: bookmark.name,
                scope: bookmark.scope,
            });
        }

        tracing::trace!(bookmark = %bookmark, owner = %owner, "bookmark registered");
        self.registrations.insert(
            bookmark.clone(),
            BookmarkRegistration {
                bookmark,
                owner,
                callback,
                options,
            },
        );
        Ok(RegisterOutcome::Registered)
    }

    /// Look up a registration
    pub fn resolve(&self, bookmark: &Bookmark) -> Option<&BookmarkRegistration> {
        self.registrations.get(bookmark)
    }

    /// Remove a registration
    pub fn unregister(&mut self, bookmark: &Bookmark) -> Option<BookmarkRegistration> {
        let removed = self.registrations.remove(bookmark);
        if removed.is_some() {
            tracing::trace!(bookmark = %bookmark, "bookmark unregistered");
        }
        removed
    }

    /// Remove every registration owned by `owner`
    pub fn remove_all_owned_by(&mut self, owner: InstanceId) -> Vec<BookmarkRegistration> {
        let owned: Vec<Bookmark> = self
            .registrations
            .values()
            .filter(|r| r.owner == owner)
            .map(|r| r.bookmark.clone())
            .collect();

        owned
            .iter()
            .filter_map(|bookmark| self.registrations.remove(bookmark))
            .collect()
    }

    /// Remove the scopes owned by `owner`
    pub fn remove_scopes_owned_by(&mut self, owner: InstanceId) {
        self.scopes.retain(|_, scope_owner| *scope_owner != owner);
    }

    /// Registrations in deterministic (scope, name) order
    pub fn iter(&self) -> impl Iterator<Item = &BookmarkRegistration> {
        self.registrations.values()
    }

    /// Scopes as (id, owner) pairs
    pub fn scopes(&self) -> impl Iterator<Item = (&Uuid, &InstanceId)> {
        self.scopes.iter()
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// True when some registration keeps its owner busy
    pub fn has_blocking(&self) -> bool {
        self.registrations.values().any(|r| r.options.is_blocking())
    }
}

/// Whether a registration call added a new entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// New entry
    Registered,
    /// Existing multiple-resume entry kept
    AlreadyRegistered,
}
