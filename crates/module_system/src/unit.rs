//! Loadable units: where module code comes from.
//!
//! A unit is a named collection of [`ModuleFactory`]s. The host always has a
//! built-in [`StaticUnit`] for modules compiled into the binary; any other
//! unit reference names a dynamic library exporting `create_module_unit`,
//! which libraries generate with [`declare_module_unit!`].
//!
//! Dynamic units must be built with the same compiler and the same version
//! of this crate as the host, since trait objects cross the boundary.

use crate::error::CatalogError;
use crate::module::ModuleFactory;
use dashmap::DashMap;
use libloading::{Library, Symbol};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Unit reference that selects the built-in unit.
pub const BUILTIN_UNIT: &str = "builtin";

/// Symbol every dynamic unit exports.
pub const UNIT_ENTRY_SYMBOL: &[u8] = b"create_module_unit";

/// A collection of module factories.
pub trait ModuleUnit: Send + Sync {
    /// Name of the unit, for diagnostics.
    fn name(&self) -> &str;

    /// Factory for `module`, if this unit provides it.
    fn factory(&self, module: &str) -> Option<Arc<dyn ModuleFactory>>;

    /// Every module this unit provides.
    fn module_names(&self) -> Vec<String>;
}

/// A unit whose factories are registered in-process.
#[derive(Clone)]
pub struct StaticUnit {
    name: String,
    factories: Vec<Arc<dyn ModuleFactory>>,
}

impl StaticUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factories: Vec::new(),
        }
    }

    /// Adds a factory, replacing any earlier factory of the same module.
    pub fn add_factory(&mut self, factory: impl ModuleFactory + 'static) {
        self.factories.retain(|f| f.name() != factory.name());
        self.factories.push(Arc::new(factory));
    }

    pub fn with_factory(mut self, factory: impl ModuleFactory + 'static) -> Self {
        self.add_factory(factory);
        self
    }
}

impl ModuleUnit for StaticUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory(&self, module: &str) -> Option<Arc<dyn ModuleFactory>> {
        self.factories.iter().find(|f| f.name() == module).cloned()
    }

    fn module_names(&self) -> Vec<String> {
        self.factories.iter().map(|f| f.name().to_string()).collect()
    }
}

impl fmt::Debug for StaticUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticUnit")
            .field("name", &self.name)
            .field("modules", &self.module_names())
            .finish()
    }
}

/// A unit ready to produce modules.
///
/// Holds the backing library, if any, so the code stays mapped while any
/// module built from it is alive.
#[derive(Clone)]
pub struct ResolvedUnit {
    reference: String,
    unit: Arc<dyn ModuleUnit>,
    library: Option<Arc<Library>>,
}

impl ResolvedUnit {
    /// The reference this unit was resolved from.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn unit(&self) -> &Arc<dyn ModuleUnit> {
        &self.unit
    }

    /// Factory for `module`, or [`CatalogError::ModuleNotInUnit`].
    pub fn factory(&self, module: &str) -> Result<Arc<dyn ModuleFactory>, CatalogError> {
        self.unit
            .factory(module)
            .ok_or_else(|| CatalogError::ModuleNotInUnit {
                unit: self.reference.clone(),
                module: module.to_string(),
            })
    }

    pub fn is_dynamic(&self) -> bool {
        self.library.is_some()
    }
}

impl fmt::Debug for ResolvedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedUnit")
            .field("reference", &self.reference)
            .field("dynamic", &self.is_dynamic())
            .finish()
    }
}

/// Turns unit references from the module configuration into units.
///
/// Dynamic libraries are opened once and kept for the life of the resolver.
pub struct UnitResolver {
    builtin: ResolvedUnit,
    unit_directory: Option<PathBuf>,
    loaded: DashMap<String, ResolvedUnit>,
}

impl UnitResolver {
    /// Creates a resolver around the built-in unit.
    pub fn new(builtin: StaticUnit) -> Self {
        Self {
            builtin: ResolvedUnit {
                reference: BUILTIN_UNIT.to_string(),
                unit: Arc::new(builtin),
                library: None,
            },
            unit_directory: None,
            loaded: DashMap::new(),
        }
    }

    /// Directory searched for units referenced by bare name.
    pub fn with_unit_directory(mut self, directory: impl AsRef<Path>) -> Self {
        self.unit_directory = Some(directory.as_ref().to_path_buf());
        self
    }

    pub fn unit_directory(&self) -> Option<&Path> {
        self.unit_directory.as_deref()
    }

    /// Resolves a unit reference. `None` and `"builtin"` select the built-in
    /// unit; anything else names a dynamic library.
    pub fn resolve(&self, reference: Option<&str>) -> Result<ResolvedUnit, CatalogError> {
        let reference = match reference {
            None | Some(BUILTIN_UNIT) => return Ok(self.builtin.clone()),
            Some(reference) => reference,
        };

        if let Some(unit) = self.loaded.get(reference) {
            return Ok(unit.clone());
        }

        let path = self.locate(reference);
        let unit = Self::open(reference, &path)?;
        info!(
            "📦 Loaded unit {} from {} ({} modules)",
            reference,
            path.display(),
            unit.unit.module_names().len()
        );
        Ok(self
            .loaded
            .entry(reference.to_string())
            .or_insert(unit)
            .clone())
    }

    /// Maps a reference to a library path. References that look like paths
    /// are used as given; bare names get the platform's library file name
    /// inside the unit directory.
    fn locate(&self, reference: &str) -> PathBuf {
        let as_path = Path::new(reference);
        if as_path.components().count() > 1 || as_path.extension().is_some() {
            return as_path.to_path_buf();
        }
        let file_name = libloading::library_filename(reference);
        match &self.unit_directory {
            Some(directory) => directory.join(file_name),
            None => PathBuf::from(file_name),
        }
    }

    fn open(reference: &str, path: &Path) -> Result<ResolvedUnit, CatalogError> {
        let not_found = |reason: String| CatalogError::UnitNotFound {
            unit: reference.to_string(),
            reason,
        };

        debug!("Opening unit library {}", path.display());
        let library = unsafe { Library::new(path) }
            .map_err(|e| not_found(format!("failed to load library: {}", e)))?;

        let unit = {
            let create: Symbol<unsafe extern "C" fn() -> *mut dyn ModuleUnit> =
                unsafe { library.get(UNIT_ENTRY_SYMBOL) }
                    .map_err(|e| not_found(format!("missing create_module_unit: {}", e)))?;
            let raw = unsafe { create() };
            if raw.is_null() {
                return Err(not_found("create_module_unit returned null".to_string()));
            }
            unsafe { Box::from_raw(raw) }
        };

        Ok(ResolvedUnit {
            reference: reference.to_string(),
            unit: Arc::from(unit),
            library: Some(Arc::new(library)),
        })
    }
}

impl fmt::Debug for UnitResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitResolver")
            .field("unit_directory", &self.unit_directory)
            .field("loaded", &self.loaded.len())
            .finish()
    }
}

/// Exports a dynamic unit's entry point.
///
/// ```rust,ignore
/// use module_system::{declare_module_unit, FnFactory};
///
/// declare_module_unit!("chat_units", [
///     FnFactory::new("chatnet", || Box::new(ChatNetModule::default()) as Box<dyn Module>),
///     FnFactory::new("obscene", || Box::new(ObsceneModule::new()) as Box<dyn Module>),
/// ]);
/// ```
///
/// The generated `create_module_unit` catches panics at the boundary and
/// returns null instead, which the resolver reports as a missing unit.
#[macro_export]
macro_rules! declare_module_unit {
    ($name:expr, [$($factory:expr),* $(,)?]) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn create_module_unit() -> *mut dyn $crate::ModuleUnit {
            match ::std::panic::catch_unwind(|| {
                let unit = $crate::StaticUnit::new($name)$(.with_factory($factory))*;
                ::std::boxed::Box::into_raw(
                    ::std::boxed::Box::new(unit) as ::std::boxed::Box<dyn $crate::ModuleUnit>
                )
            }) {
                Ok(unit) => unit,
                Err(_) => ::std::ptr::null_mut::<$crate::StaticUnit>() as *mut dyn $crate::ModuleUnit,
            }
        }
    };
}
