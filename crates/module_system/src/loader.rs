//! The module lifecycle manager.
//!
//! [`ModuleLoader`] owns every loaded module and moves it through
//! [`ModuleState`]. All lifecycle operations are serialized behind one async
//! lock; an operation naming a module that another operation is already
//! working on is refused with [`LoaderError::ModuleInFlight`] instead of
//! queueing behind it.
//!
//! Loading is batched. Every call to [`ModuleLoader::load_from_config`] or
//! [`ModuleLoader::add_module`] is one batch: either every module in it ends
//! up `Loaded`, or the batch is unwound in reverse and nothing it registered
//! stays visible. Earlier batches are never touched by a later failure.
//!
//! Module hooks must not call back into the loader; the lifecycle lock is
//! held while they run.

use crate::capability::CapabilityId;
use crate::catalog::{Catalog, ConfigSource, LoadPlan, ModuleDeclaration, ModulesConfig, PlannedModule};
use crate::context::{Broker, ModuleContext};
use crate::error::{LoaderError, ModuleError};
use crate::module::{create_guarded, run_guarded, Module, ModuleState};
use crate::unit::{ResolvedUnit, UnitResolver};
use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Snapshot of one loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub unit: String,
    pub state: ModuleState,
    /// Batch the module was loaded with; batches count up from 1
    pub batch: u64,
    pub dependencies: Vec<String>,
    /// Capabilities the module currently publishes, in registration order
    pub capabilities: Vec<CapabilityId>,
    pub loaded_at: SystemTime,
}

/// A module owned by the loader.
///
/// Field order matters: the instance is dropped before the unit whose
/// library holds its code.
struct ModuleRecord {
    module: Box<dyn Module>,
    ctx: Arc<ModuleContext>,
    name: String,
    state: ModuleState,
    batch: u64,
    dependencies: Vec<String>,
    loaded_at: SystemTime,
    unit: ResolvedUnit,
}

impl ModuleRecord {
    fn advance(&mut self, next: ModuleState) -> Result<(), LoaderError> {
        if !self.state.can_transition_to(next) {
            return Err(LoaderError::InvalidTransition {
                module: self.name.clone(),
                from: self.state,
                to: next,
            });
        }
        debug!("Module {}: {} -> {}", self.name, self.state, next);
        self.state = next;
        Ok(())
    }

    fn info(&self) -> ModuleInfo {
        ModuleInfo {
            name: self.name.clone(),
            version: self.module.version().to_string(),
            unit: self.unit.reference().to_string(),
            state: self.state,
            batch: self.batch,
            dependencies: self.dependencies.clone(),
            capabilities: self
                .ctx
                .registrations()
                .iter()
                .map(|token| token.capability())
                .collect(),
            loaded_at: self.loaded_at,
        }
    }

    /// Runs the pre-unload hook of a `PostLoaded` module. Hook errors are
    /// logged; the module still advances.
    async fn pre_unload(&mut self) -> Result<(), LoaderError> {
        self.advance(ModuleState::PreUnloading)?;
        let ctx = Arc::clone(&self.ctx);
        if let Err(e) = run_guarded(self.module.pre_unload(ctx)).await {
            error!("Module {} pre-unload failed: {}", self.name, e);
        }
        self.advance(ModuleState::PreUnloaded)
    }

    /// Removes the module's (already retired) registrations, runs its unload
    /// hook, and drops it.
    async fn teardown(mut self) -> Result<String, LoaderError> {
        self.ctx.remove_registrations();
        let ctx = Arc::clone(&self.ctx);
        if let Err(e) = run_guarded(self.module.unload(ctx)).await {
            error!("Module {} unload failed: {}", self.name, e);
        }
        self.advance(ModuleState::Unloaded)?;
        info!("🔌 Module {} unloaded", self.name);
        Ok(self.name)
    }

    /// Drops the instance and force-removes whatever it registered.
    fn discard(mut self) -> Result<(), LoaderError> {
        let result = self.advance(ModuleState::Unloaded);
        let ModuleRecord { module, ctx, name, .. } = self;
        drop(module);
        ctx.force_remove_registrations();
        debug!("Module {} discarded", name);
        result
    }
}

struct LoaderState {
    /// Loaded modules in load order
    records: Vec<ModuleRecord>,
    next_batch: u64,
}

impl LoaderState {
    fn loaded_names(&self) -> HashSet<String> {
        self.records.iter().map(|r| r.name.clone()).collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.records.iter().position(|r| r.name == name)
    }
}

/// Retires the registrations of every record, newest first. If one is busy,
/// the records retired so far are restored.
fn retire_all(records: &[ModuleRecord]) -> Result<(), LoaderError> {
    for (done, record) in records.iter().rev().enumerate() {
        if let Err((capability, refs)) = record.ctx.retire_registrations() {
            for retired in records.iter().rev().take(done) {
                retired.ctx.restore_registrations();
            }
            warn!(
                "Unload refused: module {} capability {} has {} outstanding references",
                record.name, capability, refs
            );
            return Err(LoaderError::Busy {
                module: record.name.clone(),
                capability,
                refs,
            });
        }
    }
    Ok(())
}

/// Marks module names as busy for the duration of one operation.
struct InFlight<'a> {
    set: &'a DashSet<String>,
    names: Vec<String>,
}

impl<'a> InFlight<'a> {
    fn claim<'n>(
        set: &'a DashSet<String>,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Result<Self, LoaderError> {
        let mut guard = InFlight {
            set,
            names: Vec::new(),
        };
        for name in names {
            if guard.names.iter().any(|claimed| claimed == name) {
                continue;
            }
            if !set.insert(name.to_string()) {
                return Err(LoaderError::ModuleInFlight(name.to_string()));
            }
            guard.names.push(name.to_string());
        }
        Ok(guard)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        for name in &self.names {
            self.set.remove(name);
        }
    }
}

/// Loads, stages and unloads modules.
pub struct ModuleLoader {
    broker: Arc<Broker>,
    catalog: Catalog,
    state: Mutex<LoaderState>,
    in_flight: DashSet<String>,
}

impl ModuleLoader {
    /// Creates a loader that publishes into `broker` and finds module code
    /// through `resolver`.
    pub fn new(broker: Arc<Broker>, resolver: Arc<UnitResolver>) -> Self {
        Self {
            broker,
            catalog: Catalog::new(resolver),
            state: Mutex::new(LoaderState {
                records: Vec::new(),
                next_batch: 1,
            }),
            in_flight: DashSet::new(),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Loads every module of a module list as one batch.
    ///
    /// Returns the names of the loaded modules in load order.
    ///
    /// # Errors
    ///
    /// - [`LoaderError::Config`] if the list is invalid; nothing is loaded.
    /// - [`LoaderError::Load`] if a module fails to construct or register;
    ///   the batch is unwound.
    /// - [`LoaderError::ModuleInFlight`] if another operation is working on
    ///   one of the listed modules.
    pub async fn load_from_config(&self, source: &ConfigSource) -> Result<Vec<String>, LoaderError> {
        let config = source.read().await?;
        info!("📋 Loading {} modules from {}", config.modules.len(), source);
        self.load_config(&config).await
    }

    /// Loads a single module as its own batch. Its dependencies must already
    /// be loaded.
    pub async fn add_module(&self, unit: Option<&str>, name: &str) -> Result<(), LoaderError> {
        let config = ModulesConfig {
            modules: vec![ModuleDeclaration {
                unit: unit.map(str::to_string),
                ..ModuleDeclaration::new(name)
            }],
        };
        self.load_config(&config).await.map(|_| ())
    }

    async fn load_config(&self, config: &ModulesConfig) -> Result<Vec<String>, LoaderError> {
        let _claim = InFlight::claim(
            &self.in_flight,
            config.modules.iter().map(|m| m.name.as_str()),
        )?;
        let mut state = self.state.lock().await;
        let plan = self.catalog.plan_config(config, &state.loaded_names())?;
        self.load_batch(&mut state, plan).await
    }

    async fn load_batch(
        &self,
        state: &mut LoaderState,
        plan: LoadPlan,
    ) -> Result<Vec<String>, LoaderError> {
        let batch = state.next_batch;
        state.next_batch += 1;
        let first = state.records.len();
        info!("Loading batch {} with {} modules", batch, plan.len());

        for planned in plan {
            let name = planned.name.clone();
            match self.load_one(planned, batch).await {
                Ok(record) => state.records.push(record),
                Err(source) => {
                    error!("❌ Module {} failed to load: {}", name, source);
                    let unwound = state.records.split_off(first);
                    for record in unwound.into_iter().rev() {
                        warn!("Unwinding module {}", record.name);
                        if let Err(e) = record.discard() {
                            error!("Unwind: {}", e);
                        }
                    }
                    return Err(LoaderError::Load { module: name, source });
                }
            }
        }

        let loaded: Vec<String> = state.records[first..]
            .iter()
            .map(|r| r.name.clone())
            .collect();
        info!("✅ Batch {} loaded: {}", batch, loaded.join(", "));
        Ok(loaded)
    }

    /// Constructs one module and runs its load hook. On failure the module's
    /// own registrations are already gone when this returns.
    async fn load_one(&self, planned: PlannedModule, batch: u64) -> Result<ModuleRecord, ModuleError> {
        let PlannedModule {
            name,
            unit,
            factory,
            dependencies,
        } = planned;

        let module = create_guarded(factory.as_ref())?;
        if module.name() != name {
            warn!(
                "Factory for {} built a module that calls itself {}",
                name,
                module.name()
            );
        }

        let ctx = Arc::new(ModuleContext::new(&name, Arc::clone(&self.broker)));
        let mut record = ModuleRecord {
            module,
            ctx,
            name,
            state: ModuleState::Unloaded,
            batch,
            dependencies,
            loaded_at: SystemTime::now(),
            unit,
        };
        record
            .advance(ModuleState::Loading)
            .map_err(|e| ModuleError::InitializationFailed(e.to_string()))?;

        let ctx = Arc::clone(&record.ctx);
        if let Err(e) = run_guarded(record.module.load(ctx)).await {
            if let Err(unwind) = record.discard() {
                error!("Unwind: {}", unwind);
            }
            return Err(e);
        }

        record
            .advance(ModuleState::Loaded)
            .map_err(|e| ModuleError::InitializationFailed(e.to_string()))?;
        info!(
            "Module {} v{} loaded from unit {}",
            record.name,
            record.module.version(),
            record.unit.reference()
        );
        Ok(record)
    }

    /// Runs `post_load` on every `Loaded` module in load order.
    ///
    /// A failing hook is logged and the module still advances, so the stage
    /// never runs twice for the same module. Returns how many modules
    /// advanced.
    pub async fn do_post_load_stage(&self) -> Result<usize, LoaderError> {
        let mut state = self.state.lock().await;
        let mut advanced = 0;
        for record in state
            .records
            .iter_mut()
            .filter(|r| r.state == ModuleState::Loaded)
        {
            let ctx = Arc::clone(&record.ctx);
            if let Err(e) = run_guarded(record.module.post_load(ctx)).await {
                error!("Module {} post-load failed: {}", record.name, e);
            }
            record.advance(ModuleState::PostLoaded)?;
            advanced += 1;
        }
        info!("Post-load stage complete for {} modules", advanced);
        Ok(advanced)
    }

    /// Runs `pre_unload` on every `PostLoaded` module in reverse load order.
    /// Returns how many modules advanced.
    pub async fn do_pre_unload_stage(&self) -> Result<usize, LoaderError> {
        let mut state = self.state.lock().await;
        let mut advanced = 0;
        for record in state
            .records
            .iter_mut()
            .rev()
            .filter(|r| r.state == ModuleState::PostLoaded)
        {
            record.pre_unload().await?;
            advanced += 1;
        }
        info!("Pre-unload stage complete for {} modules", advanced);
        Ok(advanced)
    }

    /// Unloads every module in reverse load order.
    ///
    /// Run the pre-unload stage first: a module still `PostLoaded` is an
    /// [`LoaderError::InvalidTransition`] and nothing is touched. Then every
    /// registration of every module is retired; if any of them still has
    /// outstanding references, all retirements are undone and
    /// [`LoaderError::Busy`] is returned with no state changed.
    ///
    /// Returns the names of the unloaded modules in unload order.
    pub async fn unload_all(&self) -> Result<Vec<String>, LoaderError> {
        let mut state = self.state.lock().await;
        info!("Unloading {} modules", state.records.len());

        if let Some(record) = state
            .records
            .iter()
            .rev()
            .find(|r| r.state == ModuleState::PostLoaded)
        {
            return Err(LoaderError::InvalidTransition {
                module: record.name.clone(),
                from: record.state,
                to: ModuleState::Unloaded,
            });
        }
        retire_all(&state.records)?;

        let mut unloaded = Vec::with_capacity(state.records.len());
        while let Some(record) = state.records.pop() {
            unloaded.push(record.teardown().await?);
        }
        info!("All modules unloaded");
        Ok(unloaded)
    }

    /// Unloads one module.
    ///
    /// Its registrations are retired before anything else happens; a module
    /// still `PostLoaded` then gets its pre-unload hook.
    ///
    /// # Errors
    ///
    /// - [`LoaderError::NotLoaded`] if no module of that name is loaded.
    /// - [`LoaderError::HasDependents`] while loaded modules depend on it.
    /// - [`LoaderError::Busy`] if one of its registrations is still
    ///   referenced. The module keeps its state, no hook runs, and the call
    ///   can be retried.
    pub async fn unload_module(&self, name: &str) -> Result<(), LoaderError> {
        let _claim = InFlight::claim(&self.in_flight, [name])?;
        let mut state = self.state.lock().await;
        let index = state
            .position(name)
            .ok_or_else(|| LoaderError::NotLoaded(name.to_string()))?;

        let dependents: Vec<String> = state
            .records
            .iter()
            .filter(|r| r.dependencies.iter().any(|d| d == name))
            .map(|r| r.name.clone())
            .collect();
        if !dependents.is_empty() {
            return Err(LoaderError::HasDependents {
                module: name.to_string(),
                dependents,
            });
        }

        let record = &mut state.records[index];
        if let Err((capability, refs)) = record.ctx.retire_registrations() {
            warn!(
                "Unload of {} refused: capability {} has {} outstanding references",
                name, capability, refs
            );
            return Err(LoaderError::Busy {
                module: name.to_string(),
                capability,
                refs,
            });
        }
        if record.state == ModuleState::PostLoaded {
            record.pre_unload().await?;
        }

        let record = state.records.remove(index);
        record.teardown().await.map(|_| ())
    }

    /// Every loaded module, in load order.
    pub async fn modules(&self) -> Vec<ModuleInfo> {
        let state = self.state.lock().await;
        state.records.iter().map(ModuleRecord::info).collect()
    }

    /// Names of the loaded modules, in load order.
    pub async fn loaded_modules(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.records.iter().map(|r| r.name.clone()).collect()
    }

    pub async fn get_module_info(&self, name: &str) -> Option<ModuleInfo> {
        let state = self.state.lock().await;
        state.records.iter().find(|r| r.name == name).map(ModuleRecord::info)
    }

    /// Current state of a module; `None` if it is not loaded.
    pub async fn module_state(&self, name: &str) -> Option<ModuleState> {
        let state = self.state.lock().await;
        state.records.iter().find(|r| r.name == name).map(|r| r.state)
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("broker", &self.broker)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
