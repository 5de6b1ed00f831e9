//! Generated code modules and the bundles that aggregate them.

use crate::{
    asset::validate_name,
    error::{AssetError, ResolveError},
    resolver::{self, Dependent},
};

/// A named unit of generated code.
///
/// Dependencies and declared names only grow. Each declared name carries the
/// code chunk that defines it, so a module's source is the concatenation of
/// its chunks in declaration order.
///
/// # Invariants
///
/// - A module never lists itself as a dependency. Longer cycles are caught by
///   the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    name: String,
    deps: Vec<String>,
    declared: Vec<String>,
    chunks: Vec<String>,
    css: String,
}

impl Module {
    /// Empty module.
    ///
    /// # Errors
    ///
    /// - `AssetError::InvalidName` for an empty or ill-formed name
    pub fn new(name: impl Into<String>) -> Result<Self, AssetError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { name, deps: Vec::new(), declared: Vec::new(), chunks: Vec::new(), css: String::new() })
    }

    /// Add a dependency. Returns `false` if it was already present.
    ///
    /// # Errors
    ///
    /// - `AssetError::SelfDependency` if `dep` is this module
    pub fn add_dependency(&mut self, dep: impl Into<String>) -> Result<bool, AssetError> {
        let dep = dep.into();
        if dep == self.name {
            return Err(AssetError::SelfDependency(dep));
        }
        if self.deps.contains(&dep) {
            return Ok(false);
        }
        self.deps.push(dep);
        Ok(true)
    }

    /// Declare a name with its code and style. Returns `false` (and changes
    /// nothing) if the name was already declared.
    pub fn declare(&mut self, name: impl Into<String>, code: impl Into<String>, css: &str) -> bool {
        let name = name.into();
        if self.declared.contains(&name) {
            return false;
        }
        self.declared.push(name);
        self.chunks.push(code.into());
        if !css.is_empty() {
            if !self.css.is_empty() {
                self.css.push('\n');
            }
            self.css.push_str(css);
        }
        true
    }

    /// Whether `name` is declared here.
    pub fn declares(&self, name: &str) -> bool {
        self.declared.iter().any(|n| n == name)
    }

    /// Declared names in declaration order.
    pub fn declared_names(&self) -> &[String] {
        &self.declared
    }

    /// Style text (possibly empty).
    pub fn css(&self) -> &str {
        &self.css
    }

    /// Whether this is an application entry module.
    pub fn is_entry(&self) -> bool {
        self.name.starts_with(resolver::MAIN_NAMESPACE)
    }

    /// Loader-ready source: the chunks wrapped in a `tether.define` call that
    /// names the dependencies and exports every declared name.
    pub fn source(&self) -> String {
        let deps = serde_json::to_string(&self.deps).unwrap_or_else(|_| "[]".to_string());
        let exports = self.declared.join(", ");
        let mut body = String::new();
        for chunk in &self.chunks {
            body.push_str(chunk);
            if !chunk.ends_with('\n') {
                body.push('\n');
            }
        }
        format!(
            "tether.define({name:?}, {deps}, function (require) {{\n{body}return {{{exports}}};\n}});\n",
            name = self.name,
        )
    }
}

impl Dependent for Module {
    fn name(&self) -> &str {
        &self.name
    }

    fn deps(&self) -> &[String] {
        &self.deps
    }
}

/// A deliverable aggregate of modules, optionally with freestanding assets.
///
/// Member modules are kept in resolved order. The bundle's own dependencies
/// are the members' dependencies that are not members themselves.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bundle {
    name: String,
    modules: Vec<String>,
    assets: Vec<String>,
    deps: Vec<String>,
}

impl Bundle {
    /// Empty bundle.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Member module names in delivery order.
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    /// Freestanding asset names, delivered before the modules.
    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    /// Add a freestanding asset. Returns `false` if already present.
    pub fn add_asset(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.assets.contains(&name) {
            return false;
        }
        self.assets.push(name);
        true
    }

    /// Whether `module` is a member.
    pub fn contains(&self, module: &str) -> bool {
        self.modules.iter().any(|m| m == module)
    }

    /// Replace the member set and recompute order and dependencies.
    ///
    /// `members` is sorted with [`resolver::sort_entry_last`] and then
    /// resolved; dependencies outside the bundle are not missing, they are
    /// the bundle's own dependencies.
    ///
    /// # Errors
    ///
    /// - `ResolveError::Cycle` if the members form a cycle
    pub fn set_modules(&mut self, mut members: Vec<&Module>) -> Result<(), ResolveError> {
        resolver::sort_entry_last(&mut members);
        let resolution = resolver::resolve(&members)?;

        self.modules = resolution.names();
        self.deps.clear();
        for module in &resolution.order {
            for dep in module.deps() {
                if !self.contains(dep) && !self.deps.contains(dep) {
                    self.deps.push(dep.clone());
                }
            }
        }
        Ok(())
    }
}

impl Dependent for Bundle {
    fn name(&self) -> &str {
        &self.name
    }

    fn deps(&self) -> &[String] {
        &self.deps
    }
}
