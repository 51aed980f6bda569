//! Versioned registries for orchestrations and activities.
//!
//! Both handler kinds live in the same `Registry<H>` shape. Activities are
//! always stored at version 1.0.0 and resolve to their latest (only) entry.
//! Orchestrations can carry several versions side by side plus a per-name
//! [`VersionPolicy`] deciding which one new instances pin.

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::Codec;
use crate::{ActivityContext, ActivityError, OrchestrationContext};
use semver::Version;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// Which registered version a newly started instance runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

/// Name of an activity bound to its input and output types.
///
/// The same key is used to register the handler and to call it, so both
/// sides agree on the payload types at compile time.
///
/// ```rust
/// use durable_research::ActivityKey;
///
/// const ADD_ONE: ActivityKey<u32, u32> = ActivityKey::new("math::add_one");
/// assert_eq!(ADD_ONE.name(), "math::add_one");
/// ```
pub struct ActivityKey<In, Out> {
    name: &'static str,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out> ActivityKey<In, Out> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _types: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<In, Out> Clone for ActivityKey<In, Out> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<In, Out> Copy for ActivityKey<In, Out> {}

impl<In, Out> std::fmt::Debug for ActivityKey<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ActivityKey").field(&self.name).finish()
    }
}

/// Name of an orchestration bound to its input and output types.
pub struct OrchestrationKey<In, Out> {
    name: &'static str,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out> OrchestrationKey<In, Out> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _types: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<In, Out> Clone for OrchestrationKey<In, Out> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<In, Out> Copy for OrchestrationKey<In, Out> {}

impl<In, Out> std::fmt::Debug for OrchestrationKey<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OrchestrationKey").field(&self.name).finish()
    }
}

/// Immutable name → version → handler map.
pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    pub(crate) policy: Arc<HashMap<String, VersionPolicy>>,
}

// Manual impl: H is unsized, derive would demand H: Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Resolve the version a new instance of `name` should run, per policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let versions = self.inner.get(name)?;
        let found = match self.policy.get(name).unwrap_or(&VersionPolicy::Latest) {
            VersionPolicy::Latest => versions.iter().next_back().map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => versions.get(v).map(|h| (v.clone(), Arc::clone(h))),
        };
        if found.is_none() {
            self.log_registry_miss(name, None);
        }
        found
    }

    pub fn resolve_handler_exact(&self, name: &str, version: &Version) -> Option<Arc<H>> {
        let found = self.inner.get(name).and_then(|versions| versions.get(version)).cloned();
        if found.is_none() {
            self.log_registry_miss(name, Some(version));
        }
        found
    }

    /// Latest handler registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.inner
            .get(name)
            .and_then(|versions| versions.values().next_back())
            .cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn log_registry_miss(&self, name: &str, requested_version: Option<&Version>) {
        tracing::debug!(
            target: "durable_research::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?self.policy.get(name),
            available_versions = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "Registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        if !self.errors.is_empty() {
            tracing::warn!(
                target: "durable_research::runtime::registry",
                errors = ?self.errors,
                "Registry built with rejected registrations"
            );
        }
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(self.policy),
        }
    }

    /// Build the registry, failing if any registration was rejected.
    ///
    /// # Errors
    ///
    /// Returns every rejected registration joined with `"; "`.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn insert(&mut self, kind: &str, name: String, version: Version, handler: Arc<H>) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            self.errors.push(format!("duplicate {kind} registration: {name}@{version}"));
            return;
        }
        entry.insert(version, handler);
    }
}

impl OrchestrationRegistryBuilder {
    /// Register an orchestration at version 1.0.0.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert("orchestration", name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(f)));
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register_versioned_typed(name, "1.0.0", f)
    }

    /// Register through a typed key so callers and handler share one contract.
    pub fn register_key<In, Out, F, Fut>(self, key: OrchestrationKey<In, Out>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register_typed(key.name(), f)
    }

    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        match Version::parse(version.as_ref()) {
            Ok(v) => self.insert("orchestration", name, v, Arc::new(FnOrchestration(f))),
            Err(e) => self
                .errors
                .push(format!("invalid version '{}' for {name}: {e}", version.as_ref())),
        }
        self
    }

    pub fn register_versioned_typed<In, Out, F, Fut>(
        self,
        name: impl Into<String>,
        version: impl AsRef<str>,
        f: F,
    ) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.register_versioned(name, version, wrapper)
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.insert("activity", name.into(), DEFAULT_VERSION, Arc::new(FnActivity(f)));
        self
    }

    /// Register an activity whose payloads travel as JSON.
    ///
    /// Input that fails to decode is a terminal error.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, ActivityError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)
                    .map_err(|e| ActivityError::terminal(format!("invalid input: {e}")))?;
                let out: Out = f(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out).map_err(ActivityError::terminal)
            }
        };
        self.register(name, wrapper)
    }

    pub fn register_key<In, Out, F, Fut>(self, key: ActivityKey<In, Out>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, ActivityError>> + Send + 'static,
    {
        self.register_typed(key.name(), f)
    }
}
