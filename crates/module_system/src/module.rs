//! The module contract, its lifecycle states, and module factories.

use crate::context::ModuleContext;
use crate::error::ModuleError;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A unit of server functionality managed by the loader.
///
/// The loader drives a module through its hooks in a fixed order:
///
/// 1. `load` - construct internal state and publish capabilities. May fail;
///    a failure unwinds the whole batch the module was loaded with.
/// 2. `post_load` - runs once every module of the server is loaded, so
///    capabilities published by later modules can be resolved.
/// 3. `pre_unload` - release every capability reference taken from other
///    modules. Unloading is refused while references are outstanding.
/// 4. `unload` - final teardown. The module's registrations are already gone.
///
/// Every hook runs with panic isolation: a panic becomes
/// [`ModuleError::Panicked`] instead of taking the host down.
#[async_trait]
pub trait Module: Send + Sync {
    /// Name of the module, unique within a loader.
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Publishes capabilities and prepares the module.
    async fn load(&mut self, ctx: Arc<ModuleContext>) -> Result<(), ModuleError>;

    /// Resolves capabilities published by other modules.
    async fn post_load(&mut self, _ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Gives back references held on other modules' capabilities.
    async fn pre_unload(&mut self, _ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Final teardown after the module's registrations were removed.
    async fn unload(&mut self, _ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Lifecycle state of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Loaded,
    PostLoaded,
    PreUnloading,
    PreUnloaded,
}

impl ModuleState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// States only advance, one stage at a time, with two shortcuts to
    /// `Unloaded` for a module the post-load stage never reached:
    ///
    /// - `Loading -> Unloaded` drops a module whose batch failed.
    /// - `Loaded -> Unloaded` unloads a module before the post-load stage.
    ///   Neither `post_load` nor `pre_unload` runs for it, only `unload`.
    ///
    /// Once `PostLoaded`, the only way out is through the pre-unload stage.
    pub fn can_transition_to(self, next: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loading, Unloaded)
                | (Loaded, PostLoaded)
                | (Loaded, Unloaded)
                | (PostLoaded, PreUnloading)
                | (PreUnloading, PreUnloaded)
                | (PreUnloaded, Unloaded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Unloaded => "unloaded",
            ModuleState::Loading => "loading",
            ModuleState::Loaded => "loaded",
            ModuleState::PostLoaded => "post-loaded",
            ModuleState::PreUnloading => "pre-unloading",
            ModuleState::PreUnloaded => "pre-unloaded",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates module instances. A unit exposes one factory per module it
/// provides.
pub trait ModuleFactory: Send + Sync {
    /// Name of the module this factory builds.
    fn name(&self) -> &str;

    /// Modules that must be loaded before this one, in addition to the
    /// dependencies listed in the module configuration.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Builds a fresh, not yet loaded instance.
    fn create(&self) -> Result<Box<dyn Module>, ModuleError>;
}

/// A [`ModuleFactory`] backed by a constructor closure.
///
/// ```rust
/// use module_system::{FnFactory, Module, ModuleContext, ModuleError};
/// use std::sync::Arc;
///
/// struct Heartbeat;
///
/// #[async_trait::async_trait]
/// impl Module for Heartbeat {
///     fn name(&self) -> &str {
///         "heartbeat"
///     }
///
///     async fn load(&mut self, _ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
///         Ok(())
///     }
/// }
///
/// let factory = FnFactory::new("heartbeat", || Box::new(Heartbeat) as Box<dyn Module>).depends_on(["network"]);
/// ```
pub struct FnFactory<F> {
    name: String,
    dependencies: Vec<String>,
    build: F,
}

impl<F> FnFactory<F>
where
    F: Fn() -> Box<dyn Module> + Send + Sync,
{
    pub fn new(name: impl Into<String>, build: F) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            build,
        }
    }

    /// Adds modules that must be loaded first.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }
}

impl<F> ModuleFactory for FnFactory<F>
where
    F: Fn() -> Box<dyn Module> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn create(&self) -> Result<Box<dyn Module>, ModuleError> {
        Ok((self.build)())
    }
}

/// Converts a panic payload into a [`ModuleError`].
pub(crate) fn panic_to_error(payload: Box<dyn Any + Send>) -> ModuleError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    ModuleError::Panicked(message)
}

/// Runs a factory with panic isolation.
pub(crate) fn create_guarded(factory: &dyn ModuleFactory) -> Result<Box<dyn Module>, ModuleError> {
    catch_unwind(AssertUnwindSafe(|| factory.create())).unwrap_or_else(|panic| Err(panic_to_error(panic)))
}

/// Awaits a lifecycle hook with panic isolation.
pub(crate) async fn run_guarded<F>(hook: F) -> Result<(), ModuleError>
where
    F: Future<Output = Result<(), ModuleError>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_to_error(panic)),
    }
}
