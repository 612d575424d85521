//! Error types for the module backbone.
//!
//! Each component reports through its own enum; the loader wraps the others
//! so a host only has to match on [`LoaderError`].

use crate::capability::CapabilityId;
use crate::module::ModuleState;
use std::path::PathBuf;

/// Errors raised by the interface and advisor registries.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// An exclusive capability already has an active implementation
    #[error("capability {id} is already registered by module {owner}")]
    Duplicate { id: CapabilityId, owner: String },
    /// No live implementation is registered under the identity
    #[error("capability {0} is not registered")]
    NotFound(CapabilityId),
    /// Removal refused because references are still outstanding
    #[error("capability {id} is busy with {refs} outstanding references")]
    Busy { id: CapabilityId, refs: usize },
    /// A release was issued without a matching get
    #[error("reference count underflow on capability {0}")]
    ReferenceUnderflow(CapabilityId),
    /// The registration token does not name a live registration
    #[error("unknown registration token for capability {0}")]
    UnknownToken(CapabilityId),
    /// The stored implementation is not of the requested type
    #[error("capability {0} is registered with a different type")]
    TypeMismatch(CapabilityId),
}

/// Errors a module reports from its lifecycle hooks.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// Module construction or load hook failed
    #[error("module initialization failed: {0}")]
    InitializationFailed(String),
    /// A hook failed after the module was up
    #[error("module execution error: {0}")]
    ExecutionError(String),
    /// Publishing or resolving a capability failed
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A hook panicked; the panic was contained
    #[error("module panicked: {0}")]
    Panicked(String),
}

/// Configuration and planning errors. No module is loaded when one of these
/// is returned.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The module list could not be read
    #[error("failed to read module configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The module list is not valid TOML of the expected shape
    #[error("invalid module configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A declaration is structurally invalid
    #[error("invalid module declaration: {0}")]
    InvalidDeclaration(String),
    /// The same module is declared twice
    #[error("module {0} is declared more than once")]
    DuplicateModule(String),
    /// The module is already loaded by an earlier batch
    #[error("module {0} is already loaded")]
    AlreadyLoaded(String),
    /// The referenced loadable unit cannot be located or opened
    #[error("loadable unit {unit} cannot be located: {reason}")]
    UnitNotFound { unit: String, reason: String },
    /// The unit exists but does not provide the module
    #[error("unit {unit} does not provide module {module}")]
    ModuleNotInUnit { unit: String, module: String },
    /// A dependency is neither planned nor already loaded
    #[error("module {module} depends on {dependency}, which is not available")]
    MissingDependency { module: String, dependency: String },
    /// The dependency graph is cyclic
    #[error("dependency cycle between modules: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
}

/// Errors surfaced by lifecycle operations on the loader.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// Planning failed; nothing was loaded
    #[error(transparent)]
    Config(#[from] CatalogError),
    /// A module failed to load; its batch was unwound
    #[error("module {module} failed to load: {source}")]
    Load {
        module: String,
        #[source]
        source: ModuleError,
    },
    /// Teardown refused because a registration is still referenced
    #[error("module {module} is busy: capability {capability} has {refs} outstanding references")]
    Busy {
        module: String,
        capability: CapabilityId,
        refs: usize,
    },
    /// Another lifecycle operation on the same module is in progress
    #[error("a lifecycle operation on module {0} is already in progress")]
    ModuleInFlight(String),
    /// The module is not loaded
    #[error("module {0} is not loaded")]
    NotLoaded(String),
    /// Other loaded modules still depend on this one
    #[error("module {module} is required by {}", .dependents.join(", "))]
    HasDependents {
        module: String,
        dependents: Vec<String>,
    },
    /// A state change outside the lifecycle sequence was attempted
    #[error("module {module} cannot move from {from} to {to}")]
    InvalidTransition {
        module: String,
        from: ModuleState,
        to: ModuleState,
    },
}

impl LoaderError {
    /// Whether the caller can retry the same operation after releasing
    /// references.
    pub fn is_busy(&self) -> bool {
        matches!(self, LoaderError::Busy { .. } | LoaderError::ModuleInFlight(_))
    }
}
