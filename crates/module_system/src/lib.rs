//! # Module System
//!
//! The component backbone of a zone server. Independently built modules
//! publish and consume well-known capability contracts at runtime, and a
//! loader brings those modules up and down in a safe, ordered and reversible
//! way.
//!
//! ## Architecture
//!
//! - **Broker**: the one context object, holding both registries
//! - **InterfaceRegistry**: exclusive capabilities, one implementation each,
//!   with per-registration reference counts
//! - **AdvisorRegistry**: non-exclusive capabilities, many implementations
//!   ordered by priority
//! - **Catalog**: parses the module list and computes a dependency-respecting
//!   load order
//! - **UnitResolver**: finds module factories in the built-in unit or in
//!   dynamic libraries
//! - **ModuleLoader**: drives the module lifecycle
//!
//! ## Module Lifecycle
//!
//! ```text
//! Unloaded -> Loading -> Loaded -> PostLoaded -> PreUnloading -> PreUnloaded -> Unloaded
//! ```
//!
//! 1. **Load** (`load_from_config`, `add_module`): modules are created in
//!    dependency order and publish their capabilities. A failure unwinds the
//!    whole batch in reverse order.
//! 2. **Post-load** (`do_post_load_stage`): every module can now resolve
//!    capabilities published by any other module.
//! 3. **Pre-unload** (`do_pre_unload_stage`): modules release the references
//!    they hold, in reverse load order.
//! 4. **Unload** (`unload_all`, `unload_module`): refused while any
//!    registration of the affected modules is still referenced. A refusal
//!    changes nothing. `unload_all` expects the pre-unload stage to have run
//!    for every post-loaded module.
//!
//! ## Quick Start
//!
//! ```rust
//! use module_system::contracts::Prng;
//! use module_system::*;
//! use std::sync::Arc;
//!
//! struct FixedPrng;
//!
//! impl Prng for FixedPrng {
//!     fn fill_secure(&self, buf: &mut [u8]) -> bool {
//!         buf.fill(4);
//!         true
//!     }
//!     fn fill_fast(&self, buf: &mut [u8]) {
//!         buf.fill(4);
//!     }
//!     fn below(&self, bound: u32) -> u32 {
//!         4 % bound.max(1)
//!     }
//!     fn next_u32(&self) -> u32 {
//!         4
//!     }
//!     fn uniform(&self) -> f64 {
//!         0.4
//!     }
//! }
//!
//! struct PrngModule;
//!
//! #[async_trait]
//! impl Module for PrngModule {
//!     fn name(&self) -> &str {
//!         "prng"
//!     }
//!
//!     async fn load(&mut self, ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
//!         ctx.register_interface::<dyn Prng>(Arc::new(FixedPrng))?;
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let unit = StaticUnit::new("core")
//!     .with_factory(FnFactory::new("prng", || Box::new(PrngModule) as Box<dyn Module>));
//! let broker = Arc::new(Broker::new());
//! let loader = ModuleLoader::new(broker.clone(), Arc::new(UnitResolver::new(unit)));
//!
//! loader
//!     .load_from_config(&ConfigSource::inline("[[modules]]\nname = \"prng\"\n"))
//!     .await
//!     .unwrap();
//!
//! let prng = broker.get_interface::<dyn Prng>().unwrap();
//! assert_eq!(prng.next_u32(), 4);
//! prng.release().unwrap();
//!
//! loader.unload_all().await.unwrap();
//! # }
//! ```

pub mod advisor;
pub mod capability;
pub mod catalog;
pub mod context;
pub mod contracts;
pub mod error;
pub mod interface;
pub mod loader;
pub mod module;
pub mod unit;

pub use advisor::{AdvisorRegistry, AdvisorSnapshot, AdvisorToken};
pub use capability::{Capability, CapabilityId};
pub use catalog::{Catalog, ConfigSource, LoadPlan, ModuleDeclaration, ModulesConfig, PlannedModule};
pub use context::{Broker, ModuleContext, RegistrationToken};
pub use error::{CatalogError, LoaderError, ModuleError, RegistryError};
pub use interface::{InterfaceRef, InterfaceRegistry, InterfaceToken};
pub use loader::{ModuleInfo, ModuleLoader};
pub use module::{FnFactory, Module, ModuleFactory, ModuleState};
pub use unit::{ModuleUnit, ResolvedUnit, StaticUnit, UnitResolver, BUILTIN_UNIT, UNIT_ENTRY_SYMBOL};

// Re-exported for module crates implementing the async hooks.
pub use async_trait::async_trait;
