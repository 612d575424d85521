//! Module configuration and load planning.
//!
//! The module list is a TOML document of `[[modules]]` tables:
//!
//! ```toml
//! [[modules]]
//! name = "network"
//!
//! [[modules]]
//! name = "chatnet"
//! unit = "chat_units"
//! depends_on = ["network"]
//! ```
//!
//! [`Catalog::plan`] validates the list, resolves every unit and factory, and
//! returns the modules in an order where each one follows everything it
//! depends on. Among modules that are ready at the same time the one declared
//! first wins, so an unchanged list always produces the same order.

use crate::error::CatalogError;
use crate::module::ModuleFactory;
use crate::unit::{ResolvedUnit, UnitResolver};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// One `[[modules]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDeclaration {
    pub name: String,
    /// Loadable unit providing the module; the built-in unit when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ModuleDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: None,
            depends_on: Vec::new(),
        }
    }
}

/// The parsed module list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulesConfig {
    #[serde(default)]
    pub modules: Vec<ModuleDeclaration>,
}

impl ModulesConfig {
    /// Parses a module list from TOML text.
    pub fn parse(text: &str) -> Result<Self, CatalogError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a module list file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CatalogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text)
    }
}

/// Where a module list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Inline(String),
}

impl ConfigSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ConfigSource::File(path.into())
    }

    pub fn inline(text: impl Into<String>) -> Self {
        ConfigSource::Inline(text.into())
    }

    pub async fn read(&self) -> Result<ModulesConfig, CatalogError> {
        match self {
            ConfigSource::File(path) => ModulesConfig::from_file(path).await,
            ConfigSource::Inline(text) => ModulesConfig::parse(text),
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Inline(_) => f.write_str("<inline>"),
        }
    }
}

/// A module ready to be instantiated.
pub struct PlannedModule {
    pub name: String,
    pub unit: ResolvedUnit,
    pub factory: Arc<dyn ModuleFactory>,
    /// Declared and factory dependencies, without duplicates
    pub dependencies: Vec<String>,
}

impl fmt::Debug for PlannedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannedModule")
            .field("name", &self.name)
            .field("unit", &self.unit.reference())
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Modules in load order.
#[derive(Debug, Default)]
pub struct LoadPlan {
    modules: Vec<PlannedModule>,
}

impl LoadPlan {
    pub fn names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlannedModule> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl IntoIterator for LoadPlan {
    type Item = PlannedModule;
    type IntoIter = std::vec::IntoIter<PlannedModule>;

    fn into_iter(self) -> Self::IntoIter {
        self.modules.into_iter()
    }
}

/// Validates module lists and orders them for loading.
#[derive(Debug, Clone)]
pub struct Catalog {
    resolver: Arc<UnitResolver>,
}

impl Catalog {
    pub fn new(resolver: Arc<UnitResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<UnitResolver> {
        &self.resolver
    }

    /// Reads `source` and plans it against the modules already loaded.
    pub async fn plan(
        &self,
        source: &ConfigSource,
        already_loaded: &HashSet<String>,
    ) -> Result<LoadPlan, CatalogError> {
        let config = source.read().await?;
        debug!("Planning {} modules from {}", config.modules.len(), source);
        self.plan_config(&config, already_loaded)
    }

    /// Plans an already parsed module list.
    ///
    /// # Errors
    ///
    /// Any [`CatalogError`]; nothing is instantiated either way.
    pub fn plan_config(
        &self,
        config: &ModulesConfig,
        already_loaded: &HashSet<String>,
    ) -> Result<LoadPlan, CatalogError> {
        let declarations = &config.modules;
        let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(declarations.len());
        for (index, declaration) in declarations.iter().enumerate() {
            validate_declaration(declaration)?;
            if index_of.insert(&declaration.name, index).is_some() {
                return Err(CatalogError::DuplicateModule(declaration.name.clone()));
            }
            if already_loaded.contains(&declaration.name) {
                return Err(CatalogError::AlreadyLoaded(declaration.name.clone()));
            }
        }

        let mut planned = Vec::with_capacity(declarations.len());
        for declaration in declarations {
            let unit = self.resolver.resolve(declaration.unit.as_deref())?;
            let factory = unit.factory(&declaration.name)?;
            let mut dependencies = Vec::new();
            for dependency in declaration
                .depends_on
                .iter()
                .cloned()
                .chain(factory.dependencies())
            {
                if !dependencies.contains(&dependency) {
                    dependencies.push(dependency);
                }
            }
            planned.push(PlannedModule {
                name: declaration.name.clone(),
                unit,
                factory,
                dependencies,
            });
        }

        // Edges run from a required module to the modules that need it.
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); planned.len()];
        let mut pending: Vec<usize> = vec![0; planned.len()];
        for (index, module) in planned.iter().enumerate() {
            for dependency in &module.dependencies {
                match index_of.get(dependency.as_str()) {
                    Some(&required) => {
                        dependents[required].push(index);
                        pending[index] += 1;
                    }
                    None if already_loaded.contains(dependency) => {}
                    None => {
                        return Err(CatalogError::MissingDependency {
                            module: module.name.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                }
            }
        }

        let order = stable_topological_order(&dependents, &mut pending);
        if order.len() < planned.len() {
            return Err(CatalogError::DependencyCycle(find_cycle(
                &planned, &index_of, &pending,
            )));
        }

        let mut slots: Vec<Option<PlannedModule>> = planned.into_iter().map(Some).collect();
        let modules = order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect();
        Ok(LoadPlan { modules })
    }
}

fn validate_declaration(declaration: &ModuleDeclaration) -> Result<(), CatalogError> {
    if declaration.name.trim().is_empty() {
        return Err(CatalogError::InvalidDeclaration(
            "module name cannot be empty".to_string(),
        ));
    }
    if matches!(&declaration.unit, Some(unit) if unit.trim().is_empty()) {
        return Err(CatalogError::InvalidDeclaration(format!(
            "module {} has an empty unit reference",
            declaration.name
        )));
    }
    if declaration.depends_on.iter().any(|d| d.trim().is_empty()) {
        return Err(CatalogError::InvalidDeclaration(format!(
            "module {} has an empty dependency name",
            declaration.name
        )));
    }
    Ok(())
}

/// Kahn's algorithm that always takes the lowest ready index. Leaves the
/// remaining in-degree of every node that could not be ordered in `pending`.
fn stable_topological_order(dependents: &[Vec<usize>], pending: &mut [usize]) -> Vec<usize> {
    let mut ready: BTreeSet<usize> = (0..pending.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(pending.len());
    while let Some(index) = ready.pop_first() {
        order.push(index);
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }
    order
}

/// Names the modules on one dependency cycle among the unordered ones.
fn find_cycle(
    planned: &[PlannedModule],
    index_of: &HashMap<&str, usize>,
    pending: &[usize],
) -> Vec<String> {
    let stuck = |index: usize| pending[index] > 0;
    let Some(start) = (0..planned.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    // Every stuck module has at least one stuck dependency, so walking them
    // must revisit a module.
    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = planned[current]
            .dependencies
            .iter()
            .filter_map(|d| index_of.get(d.as_str()).copied())
            .find(|&d| stuck(d));
        let Some(next) = next else {
            break;
        };
        if let Some(position) = path.iter().position(|&i| i == next) {
            return path[position..]
                .iter()
                .map(|&i| planned[i].name.clone())
                .collect();
        }
        path.push(next);
        current = next;
    }
    path.into_iter().map(|i| planned[i].name.clone()).collect()
}
