//! Immutable name-keyed registries for activities and orchestrations.
//!
//! Both are built once via a builder and shared behind `Arc`s; the runtime
//! only ever reads them. Duplicate registration is rejected at build time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::OrchestrationContext;

/// Trait implemented by activity handlers invoked by the worker dispatcher.
///
/// Activities are stateless from the caller's perspective: every invocation
/// attempt is independent, and a retried attempt re-executes the full body —
/// at-least-once semantics toward anything external the activity calls.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`ActivityHandler`].
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

/// Trait implemented by orchestration handlers driven by replay.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`OrchestrationHandler`].
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Immutable registry mapping names to handlers.
pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Debug since H: ?Sized doesn't auto-derive.
impl<H: ?Sized> std::fmt::Debug for Registry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

// Manual Clone since H: ?Sized doesn't auto-derive.
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.inner.get(name).cloned()
    }
}

/// Builder for [`Registry`]. Registration errors are collected and surfaced
/// by `build_result`; plain `build` panics on them.
pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

impl<H: ?Sized> Default for RegistryBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    fn insert(&mut self, name: String, handler: Arc<H>, kind: &str) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {kind} registration: {name}"));
            return;
        }
        self.map.insert(name, handler);
    }

    pub fn build(self) -> Registry<H> {
        match self.build_result() {
            Ok(r) => r,
            Err(e) => panic!("registry build failed: {e}"),
        }
    }

    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(Registry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(self.errors.join("; "))
        }
    }
}

impl ActivityRegistryBuilder {
    /// Register a function as an activity under a unique name.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)), "activity");
        self
    }

    /// Register an already-boxed handler (used by the quorum wiring).
    pub fn register_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn ActivityHandler>,
    ) -> Self {
        self.insert(name.into(), handler, "activity");
        self
    }
}

impl OrchestrationRegistryBuilder {
    /// Register a function as an orchestration under a unique name.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)), "orchestration");
        self
    }
}
