//! Cache key naming.
//!
//! Keys follow `{service}:{module}:{resource}[:{id}]:{version}`. Everything
//! here is pure string manipulation apart from reading the module version
//! table, which only ever increases.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

const SEPARATOR: char = ':';
const NULL_SUFFIX: &str = ":null";
const LOCK_PREFIX: &str = "lock:";
const INITIAL_VERSION: u64 = 1;

/// Top-level namespace of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    User,
    Chat,
    Confession,
    Notification,
    Statistics,
    Lock,
    System,
}

impl Module {
    pub const ALL: [Module; 7] = [
        Module::User,
        Module::Chat,
        Module::Confession,
        Module::Notification,
        Module::Statistics,
        Module::Lock,
        Module::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Module::User => "user",
            Module::Chat => "chat",
            Module::Confession => "confession",
            Module::Notification => "notification",
            Module::Statistics => "statistics",
            Module::Lock => "lock",
            Module::System => "system",
        }
    }

    /// Bookkeeping modules are never refreshed and never counted in hit rates.
    pub fn is_internal(&self) -> bool {
        matches!(self, Module::Statistics | Module::Lock | Module::System)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cache module `{0}`")]
pub struct UnknownModule(pub String);

impl FromStr for Module {
    type Err = UnknownModule;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Module::ALL
            .into_iter()
            .find(|module| module.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownModule(value.to_string()))
    }
}

/// Second-level namespace: what kind of record inside a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Profile,
    Status,
    List,
    Detail,
    Private,
    Group,
    Member,
    Hit,
    Miss,
    Main,
    Version,
    Deps,
    Parents,
    Custom(String),
}

impl Resource {
    pub fn as_str(&self) -> &str {
        match self {
            Resource::Profile => "profile",
            Resource::Status => "status",
            Resource::List => "list",
            Resource::Detail => "detail",
            Resource::Private => "private",
            Resource::Group => "group",
            Resource::Member => "member",
            Resource::Hit => "hit",
            Resource::Miss => "miss",
            Resource::Main => "main",
            Resource::Version => "version",
            Resource::Deps => "deps",
            Resource::Parents => "parents",
            Resource::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-module logical version counters.
///
/// Bumping a module's version makes every key generated afterwards distinct
/// from the keys generated before, without touching the backing store.
#[derive(Debug, Default)]
pub struct ModuleVersions {
    versions: DashMap<Module, AtomicU64>,
}

impl ModuleVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, module: Module) -> u64 {
        self.versions
            .get(&module)
            .map(|version| version.load(Ordering::Acquire))
            .unwrap_or(INITIAL_VERSION)
    }

    /// Increment the module version and return the new value.
    pub fn bump(&self, module: Module) -> u64 {
        self.versions
            .entry(module)
            .or_insert_with(|| AtomicU64::new(INITIAL_VERSION))
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }
}

/// Builds structured cache keys for one service namespace.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    service: Arc<str>,
    versions: Arc<ModuleVersions>,
}

impl KeyBuilder {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_versions(service, Arc::new(ModuleVersions::new()))
    }

    pub fn with_versions(service: impl Into<String>, versions: Arc<ModuleVersions>) -> Self {
        Self {
            service: Arc::from(service.into()),
            versions,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn versions(&self) -> &Arc<ModuleVersions> {
        &self.versions
    }

    /// Build `{service}:{module}:{resource}[:{id}]:v{version}`.
    ///
    /// Empty parts are skipped; the version defaults to the module's current
    /// version.
    pub fn key(
        &self,
        module: Module,
        resource: &Resource,
        id: Option<&str>,
        version: Option<u64>,
    ) -> String {
        let version = version.unwrap_or_else(|| self.versions.current(module));
        let version = format!("v{version}");
        let parts = [
            self.service.as_ref(),
            module.as_str(),
            resource.as_str(),
            id.unwrap_or(""),
            version.as_str(),
        ];
        join_non_empty(&parts)
    }

    pub fn service_pattern(&self) -> String {
        format!("{}:*", self.service)
    }

    pub fn module_pattern(&self, module: Module) -> String {
        format!("{}:{}:*", self.service, module)
    }

    pub fn resource_pattern(&self, module: Module, resource: &Resource) -> String {
        format!("{}:{}:{}:*", self.service, module, resource)
    }

    /// Fixed key holding the global cache format marker.
    pub fn format_version_key(&self) -> String {
        format!("{}:system:cache_version", self.service)
    }

    /// Fixed key holding the persisted statistics snapshot.
    pub fn statistics_key(&self) -> String {
        self.key(
            Module::Statistics,
            &Resource::Main,
            None,
            Some(INITIAL_VERSION),
        )
    }

    /// Set of keys that depend on `parent`.
    pub fn dependents_key(&self, parent: &str) -> String {
        format!("{}:system:deps:{parent}", self.service)
    }

    /// Set of keys that `child` depends on.
    pub fn parents_key(&self, child: &str) -> String {
        format!("{}:system:parents:{child}", self.service)
    }

    /// Module segment of a key built by this builder.
    pub fn module_of(&self, key: &str) -> Option<Module> {
        let rest = key.strip_prefix(self.service.as_ref())?.strip_prefix(SEPARATOR)?;
        let segment = rest.split(SEPARATOR).next()?;
        segment.parse().ok()
    }

    /// Keys the refresh scheduler and statistics must leave alone.
    pub fn is_internal_key(&self, key: &str) -> bool {
        if is_lock_key(key) || is_null_key(key) {
            return true;
        }
        match self.module_of(key) {
            Some(module) => module.is_internal(),
            None => true,
        }
    }

    // ------------------------------------------------------------------
    // Entity keys
    // ------------------------------------------------------------------

    pub fn user_profile(&self, user_id: &str) -> String {
        self.key(Module::User, &Resource::Profile, Some(user_id), None)
    }

    pub fn user_status(&self, user_id: &str) -> String {
        self.key(Module::User, &Resource::Status, Some(user_id), None)
    }

    pub fn chat_private(&self, a: &str, b: &str) -> String {
        self.key(Module::Chat, &Resource::Private, Some(&pair_id(a, b)), None)
    }

    pub fn chat_list(&self, user_id: &str) -> String {
        self.key(Module::Chat, &Resource::List, Some(user_id), None)
    }

    pub fn chat_group(&self, group_id: &str) -> String {
        self.key(Module::Chat, &Resource::Group, Some(group_id), None)
    }

    pub fn chat_members(&self, group_id: &str) -> String {
        self.key(Module::Chat, &Resource::Member, Some(group_id), None)
    }

    pub fn confession_detail(&self, confession_id: &str) -> String {
        self.key(Module::Confession, &Resource::Detail, Some(confession_id), None)
    }

    pub fn confession_list(&self, page: u32, page_size: u32) -> String {
        let id = format!("{page}:{page_size}");
        self.key(Module::Confession, &Resource::List, Some(&id), None)
    }

    pub fn notification_list(&self, user_id: &str) -> String {
        self.key(Module::Notification, &Resource::List, Some(user_id), None)
    }
}

/// Null-marker key recording an authoritative "no data" answer.
pub fn null_key(key: &str) -> String {
    format!("{key}{NULL_SUFFIX}")
}

pub fn is_null_key(key: &str) -> bool {
    key.ends_with(NULL_SUFFIX)
}

/// Advisory lock key guarding the fetch-and-populate of `key`.
pub fn lock_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}

pub fn is_lock_key(key: &str) -> bool {
    key.starts_with(LOCK_PREFIX)
}

/// Replace a trailing `vN` segment, or append one when absent.
pub fn versioned_key(key: &str, version: u64) -> String {
    let base = match key.rsplit_once(SEPARATOR) {
        Some((head, last)) if is_version_segment(last) => head,
        None if is_version_segment(key) => "",
        _ => key,
    };
    if base.is_empty() {
        format!("v{version}")
    } else {
        format!("{base}{SEPARATOR}v{version}")
    }
}

/// Order-independent id for a symmetric relation between two identifiers.
pub fn pair_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}{SEPARATOR}{b}")
    } else {
        format!("{b}{SEPARATOR}{a}")
    }
}

fn is_version_segment(segment: &str) -> bool {
    segment
        .strip_prefix('v')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn join_non_empty(parts: &[&str]) -> String {
    let mut joined = String::new();
    for part in parts.iter().filter(|part| !part.is_empty()) {
        if !joined.is_empty() {
            joined.push(SEPARATOR);
        }
        joined.push_str(part);
    }
    joined
}
