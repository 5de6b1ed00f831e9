//! The asset store: assets, modules and bundles shared by every session.
//!
//! The store is read-mostly state of the single event loop. Sessions borrow
//! it to find which modules a class needs and to fetch their source; new
//! classes grow it incrementally. Nothing here is thread-safe by design of
//! the loop: a [`SharedStore`] is an `Rc<RefCell<_>>`.
//!
//! # Bundles
//!
//! Registering module `a.b.c` maintains the package bundles `a.b.c`, `a.b`
//! and `a`. A bundle is served under two names, `<bundle>.js` and
//! `<bundle>.css`; a bare bundle name is not a valid lookup.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet},
    rc::Rc,
};

use bytes::Bytes;

use crate::{
    asset::{Asset, AssetKind, AssetSource, NoFetcher, ResourceFetcher, validate_name},
    codegen::{CodeGenerator, MirrorClassGenerator},
    error::AssetError,
    mirror::MirrorClass,
    module::{Bundle, Module},
    resolver::{self, Dependent, MissingDependency},
};

/// Name of the core loader asset every store is seeded with.
pub const LOADER_ASSET: &str = "tether-loader.js";

const LOADER_SOURCE: &str = include_str!("loader.js");

/// Store handle shared by the sessions of one event loop.
pub type SharedStore = Rc<RefCell<AssetStore>>;

thread_local! {
    static DEFAULT_STORE: SharedStore = Rc::new(RefCell::new(AssetStore::new()));
}

/// The process-wide (per-thread) default store.
///
/// A convenience for applications that need only one store. Tests and
/// embedders that need isolation construct their own [`AssetStore`].
pub fn default_store() -> SharedStore {
    DEFAULT_STORE.with(Rc::clone)
}

/// Modules in dependency order, from [`AssetStore::resolve_modules`].
#[derive(Debug)]
pub struct ModuleOrder<'a> {
    /// Requested modules, dependencies first
    pub modules: Vec<&'a Module>,
    /// Dependencies that were not requested
    pub missing: Vec<MissingDependency>,
}

/// Outcome of [`AssetStore::register_class`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRegistration {
    /// Module that declares the class
    pub module: String,
    /// Whether the class was declared by this call (as opposed to already
    /// being known)
    pub newly_declared: bool,
}

/// Assets, modules and bundles.
///
/// # Invariants
///
/// - Asset, module and shared data names are each unique
/// - A class name is declared by at most one module
pub struct AssetStore {
    assets: BTreeMap<String, Asset>,
    modules: BTreeMap<String, Module>,
    bundles: BTreeMap<String, Bundle>,
    /// module -> assets it needs, in association order
    associated: HashMap<String, Vec<String>>,
    /// class name -> declaring module
    declared_by: HashMap<String, String>,
    /// qualified name -> registered class
    classes: HashMap<String, &'static MirrorClass>,
    shared_data: BTreeMap<String, Bytes>,
    generator: Box<dyn CodeGenerator>,
    fetcher: Box<dyn ResourceFetcher>,
}

impl Default for AssetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AssetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetStore")
            .field("assets", &self.assets.keys().collect::<Vec<_>>())
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("bundles", &self.bundles.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl AssetStore {
    /// Store seeded with the loader asset, using [`MirrorClassGenerator`]
    /// and no external fetcher.
    pub fn new() -> Self {
        let mut assets = BTreeMap::new();
        assets.insert(LOADER_ASSET.to_string(), Asset::builtin(LOADER_ASSET, LOADER_SOURCE));
        Self {
            assets,
            modules: BTreeMap::new(),
            bundles: BTreeMap::new(),
            associated: HashMap::new(),
            declared_by: HashMap::new(),
            classes: HashMap::new(),
            shared_data: BTreeMap::new(),
            generator: Box::new(MirrorClassGenerator),
            fetcher: Box::new(NoFetcher),
        }
    }

    /// Store seeded with additional assets and modules.
    ///
    /// # Errors
    ///
    /// Any error [`add_asset`](Self::add_asset) or
    /// [`add_module`](Self::add_module) would return.
    pub fn with_seeds(assets: Vec<Asset>, modules: Vec<Module>) -> Result<Self, AssetError> {
        let mut store = Self::new();
        for asset in assets {
            store.add_asset(asset)?;
        }
        for module in modules {
            store.add_module(module)?;
        }
        Ok(store)
    }

    /// Replace the code generator.
    pub fn with_generator(mut self, generator: impl CodeGenerator + 'static) -> Self {
        self.generator = Box::new(generator);
        self
    }

    /// Replace the fetcher used for remote assets.
    pub fn with_fetcher(mut self, fetcher: impl ResourceFetcher + 'static) -> Self {
        self.fetcher = Box::new(fetcher);
        self
    }

    /// Wrap in a [`SharedStore`].
    pub fn into_shared(self) -> SharedStore {
        Rc::new(RefCell::new(self))
    }

    /// Fetcher for remote assets.
    pub fn fetcher(&self) -> &dyn ResourceFetcher {
        self.fetcher.as_ref()
    }

    /// Add an asset.
    ///
    /// # Errors
    ///
    /// - `AssetError::DuplicateAsset` if the name is taken
    pub fn add_asset(&mut self, asset: Asset) -> Result<(), AssetError> {
        if self.assets.contains_key(asset.name()) {
            return Err(AssetError::DuplicateAsset(asset.name().to_string()));
        }
        tracing::debug!(asset = %asset.name(), "asset added");
        self.assets.insert(asset.name().to_string(), asset);
        Ok(())
    }

    /// Asset by exact name.
    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.get(name)
    }

    /// Add a complete module.
    ///
    /// # Errors
    ///
    /// - `AssetError::DuplicateModule` if the name is taken
    /// - `AssetError::DuplicateClass` if another module declares one of its
    ///   class names
    /// - `AssetError::Resolve` if the module closes a cycle inside one of
    ///   its package bundles
    pub fn add_module(&mut self, module: Module) -> Result<(), AssetError> {
        let name = module.name().to_string();
        if self.modules.contains_key(&name) {
            return Err(AssetError::DuplicateModule(name));
        }
        if let Some((class, existing)) = module
            .declared_names()
            .iter()
            .find_map(|declared| self.declared_by.get(declared).map(|owner| (declared, owner)))
        {
            return Err(AssetError::DuplicateClass { class: class.clone(), existing: existing.clone() });
        }
        for declared in module.declared_names() {
            self.declared_by.insert(declared.clone(), name.clone());
        }
        self.modules.insert(name.clone(), module);
        self.refresh_bundles(&name)
    }

    /// Module by name.
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    /// Bundle by bare name.
    pub fn bundle(&self, name: &str) -> Option<&Bundle> {
        self.bundles.get(name)
    }

    /// Module declaring `class_name`, if any.
    pub fn declaring_module(&self, class_name: &str) -> Option<&str> {
        self.declared_by.get(class_name).map(String::as_str)
    }

    /// Registered mirror class by bare name.
    ///
    /// Names declared by plain modules have no class metadata and are not
    /// found.
    pub fn class(&self, name: &str) -> Option<&'static MirrorClass> {
        let module = self.declared_by.get(name)?;
        self.classes.get(&format!("{module}.{name}")).copied()
    }

    /// Record that `module` needs `asset`, adding the asset when `source`
    /// is given.
    ///
    /// # Errors
    ///
    /// - `AssetError::UnknownModule` if the module does not exist
    /// - `AssetError::UnknownAsset` if no source is given and the asset does
    ///   not exist
    /// - `AssetError::DuplicateAsset` if a source is given for a taken name
    pub fn associate_asset(
        &mut self,
        module: &str,
        asset: &str,
        source: Option<AssetSource>,
    ) -> Result<(), AssetError> {
        if !self.modules.contains_key(module) {
            return Err(AssetError::UnknownModule(module.to_string()));
        }
        match source {
            Some(source) => self.add_asset(Asset::new(asset, source)?)?,
            None if !self.assets.contains_key(asset) => {
                return Err(AssetError::UnknownAsset(asset.to_string()));
            },
            None => {},
        }

        let list = self.associated.entry(module.to_string()).or_default();
        if !list.iter().any(|a| a == asset) {
            list.push(asset.to_string());
        }
        for prefix in package_prefixes(module) {
            if let Some(bundle) = self.bundles.get_mut(prefix) {
                bundle.add_asset(asset);
            }
        }
        Ok(())
    }

    /// Assets `module` needs, in association order.
    pub fn associated_assets(&self, module: &str) -> &[String] {
        self.associated.get(module).map_or(&[], Vec::as_slice)
    }

    /// Make sure `class` (and its bases) are declared by a module.
    ///
    /// Base classes are registered first. The generator's free names are
    /// mapped to declaring modules and become dependencies of the class'
    /// module; names no module declares are logged and skipped.
    ///
    /// # Errors
    ///
    /// - `AssetError::Generator` if code generation fails
    /// - `AssetError::DuplicateClass` if another module declares the name
    /// - `AssetError::InvalidName` if the class' module name is invalid
    /// - `AssetError::Resolve` if a package bundle becomes cyclic
    pub fn register_class(&mut self, class: &'static MirrorClass) -> Result<ClassRegistration, AssetError> {
        if let Some(base) = class.base {
            self.register_class(base)?;
        }

        let module_name = class.module.to_string();
        let qualified = class.qualified_name();
        if self.classes.contains_key(&qualified) {
            return Ok(ClassRegistration { module: module_name, newly_declared: false });
        }
        if let Some(existing) = self.declared_by.get(class.name).filter(|owner| **owner != module_name) {
            return Err(AssetError::DuplicateClass { class: class.name.to_string(), existing: existing.clone() });
        }

        let code = self
            .generator
            .generate(class)
            .map_err(|reason| AssetError::Generator { class: class.name.to_string(), reason })?;

        let created = !self.modules.contains_key(&module_name);
        if created {
            let module = Module::new(module_name.clone())?;
            self.modules.insert(module_name.clone(), module);
        }

        let mut deps = Vec::new();
        for free in &code.free_names {
            match self.declared_by.get(free) {
                Some(owner) if *owner == module_name => {},
                Some(owner) => deps.push(owner.clone()),
                None => tracing::warn!(
                    class = class.name,
                    name = %free,
                    "generated code refers to a name no module declares; skipping"
                ),
            }
        }

        let Some(module) = self.modules.get_mut(&module_name) else {
            return Err(AssetError::UnknownModule(module_name));
        };
        let mut deps_changed = false;
        for dep in deps {
            deps_changed |= module.add_dependency(dep)?;
        }
        module.declare(class.name, code.source, &code.css);
        self.declared_by.insert(class.name.to_string(), module_name.clone());
        self.classes.insert(qualified, class);
        tracing::debug!(class = class.name, module = %module_name, "class declared");

        if created || deps_changed {
            self.refresh_bundles(&module_name)?;
        }
        Ok(ClassRegistration { module: module_name, newly_declared: true })
    }

    /// `roots` plus every module they transitively depend on, as far as the
    /// store knows them. Roots come first, then dependencies in discovery
    /// order.
    pub fn dependency_closure(&self, roots: &[&str]) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        let mut queue: Vec<&str> = roots.to_vec();
        let mut i = 0;
        while i < queue.len() {
            let name = queue[i];
            i += 1;
            let Some(module) = self.modules.get(name) else { continue };
            if !seen.insert(name) {
                continue;
            }
            out.push(name.to_string());
            queue.extend(module.deps().iter().map(String::as_str));
        }
        out
    }

    /// Resolve the named modules without logging.
    ///
    /// # Errors
    ///
    /// - `AssetError::UnknownModule` for a name the store does not hold
    /// - `AssetError::Resolve` on a cycle
    pub fn resolve_modules(&self, names: &[&str]) -> Result<ModuleOrder<'_>, AssetError> {
        let mut modules = Vec::with_capacity(names.len());
        for name in names {
            let module =
                self.modules.get(*name).ok_or_else(|| AssetError::UnknownModule((*name).to_string()))?;
            modules.push(module);
        }
        resolver::sort_entry_last(&mut modules);
        let resolution = resolver::resolve(&modules)?;
        Ok(ModuleOrder {
            modules: resolution.order.iter().map(|m| **m).collect(),
            missing: resolution.missing,
        })
    }

    /// Order the requested modules, dependencies first.
    ///
    /// Dependencies outside `names` are not added; each occurrence is logged
    /// as a warning.
    ///
    /// # Errors
    ///
    /// - `AssetError::UnknownModule` for a requested name the store does not
    ///   hold
    /// - `AssetError::Resolve` on a cycle
    pub fn resolve(&self, names: &[&str]) -> Result<Vec<String>, AssetError> {
        let resolved = self.resolve_modules(names)?;
        for missing in &resolved.missing {
            tracing::warn!(module = %missing.item, dependency = %missing.dependency, "missing dependency");
        }
        Ok(resolved.modules.iter().map(|m| m.name().to_string()).collect())
    }

    /// Add process-wide binary data.
    ///
    /// # Errors
    ///
    /// - `AssetError::InvalidName` for an ill-formed name
    /// - `AssetError::DuplicateData` if the name is taken
    pub fn add_shared_data(&mut self, name: &str, data: Bytes) -> Result<(), AssetError> {
        validate_name(name)?;
        if self.shared_data.contains_key(name) {
            return Err(AssetError::DuplicateData(name.to_string()));
        }
        self.shared_data.insert(name.to_string(), data);
        Ok(())
    }

    /// Process-wide binary data by name.
    pub fn shared_data(&self, name: &str) -> Option<&Bytes> {
        self.shared_data.get(name)
    }

    /// Content of an asset or bundle.
    ///
    /// Assets are looked up by exact name first. Bundles are served as
    /// `<bundle>.js` (associated script assets, then member module sources)
    /// or `<bundle>.css` (associated style assets, then member styles).
    ///
    /// # Errors
    ///
    /// - `AssetError::InvalidName` for a bare bundle name
    /// - `AssetError::UnknownAsset` if nothing matches
    /// - any resolution error of the asset itself
    pub fn get_asset(&self, name: &str) -> Result<Bytes, AssetError> {
        if let Some(asset) = self.assets.get(name) {
            return asset.resolve(self.fetcher.as_ref());
        }
        if self.bundles.contains_key(name) {
            return Err(AssetError::InvalidName {
                name: name.to_string(),
                reason: "bundle lookups need a .js or .css suffix",
            });
        }

        let (bare, kind) = if let Some(bare) = name.strip_suffix(".js") {
            (bare, AssetKind::Script)
        } else if let Some(bare) = name.strip_suffix(".css") {
            (bare, AssetKind::Style)
        } else {
            return Err(AssetError::UnknownAsset(name.to_string()));
        };
        let bundle = self.bundles.get(bare).ok_or_else(|| AssetError::UnknownAsset(name.to_string()))?;

        let mut out = Vec::new();
        for asset_name in bundle.assets() {
            let Some(asset) = self.assets.get(asset_name) else { continue };
            if asset.kind() == kind {
                out.extend_from_slice(&asset.resolve(self.fetcher.as_ref())?);
                out.push(b'\n');
            }
        }
        for module in bundle.modules().iter().filter_map(|m| self.modules.get(m)) {
            match kind {
                AssetKind::Script => out.extend_from_slice(module.source().as_bytes()),
                _ if module.css().is_empty() => continue,
                _ => {
                    out.extend_from_slice(module.css().as_bytes());
                    out.push(b'\n');
                },
            }
        }
        Ok(Bytes::from(out))
    }

    fn refresh_bundles(&mut self, module: &str) -> Result<(), AssetError> {
        for prefix in package_prefixes(module) {
            let members: Vec<&Module> = self
                .modules
                .values()
                .filter(|m| m.name() == prefix || m.name().strip_prefix(prefix).is_some_and(|r| r.starts_with('.')))
                .collect();
            let bundle = self.bundles.entry(prefix.to_string()).or_insert_with(|| Bundle::new(prefix));
            bundle.set_modules(members)?;
        }
        Ok(())
    }
}

/// `a.b.c` -> `["a.b.c", "a.b", "a"]`
fn package_prefixes(name: &str) -> Vec<&str> {
    let mut out = vec![name];
    let mut rest = name;
    while let Some(idx) = rest.rfind('.') {
        rest = &rest[..idx];
        if !rest.is_empty() {
            out.push(rest);
        }
    }
    out
}
