//! Handler modules
//!
//! Handlers are compiled in, so "importing" a handler means looking it up in
//! a [`ModuleRegistry`]. A module declares the modules it imports; loading it
//! loads those first, once each, and records every module loaded along the
//! way. That record is what the watch set is computed from.

use fnshim_core::{HandlerError, Payload, ShimError};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::invocation::Handler;

type LoadHook = Box<dyn Fn() -> Result<(), String> + Send + Sync>;

/// A named module attribute
#[derive(Clone)]
pub enum Attribute {
    Function(Arc<dyn Handler>),
    Value(Value),
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Function"),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// A module: its imports, its attributes and an optional load hook
pub struct Module {
    id: String,
    imports: Vec<String>,
    attributes: HashMap<String, Attribute>,
    on_load: Option<LoadHook>,
}

impl Module {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            imports: Vec::new(),
            attributes: HashMap::new(),
            on_load: None,
        }
    }

    #[must_use]
    pub fn import(mut self, id: impl Into<String>) -> Self {
        self.imports.push(id.into());
        self
    }

    /// Add a handler function
    #[must_use]
    pub fn function<F, R>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, &ExecutionContext) -> Result<R, HandlerError> + Send + Sync + 'static,
        R: Into<Payload>,
    {
        self.attributes
            .insert(name.into(), Attribute::Function(Arc::new(f)));
        self
    }

    /// Add a plain value
    #[must_use]
    pub fn value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), Attribute::Value(value));
        self
    }

    /// Run `hook` when the module is loaded; an `Err` fails the load
    #[must_use]
    pub fn on_load<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        self.on_load = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.attributes.keys().collect();
        names.sort();
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("imports", &self.imports)
            .field("attributes", &names)
            .field("on_load", &self.on_load.is_some())
            .finish()
    }
}

/// A handler resolved from the registry
#[derive(Clone)]
pub struct ResolvedHandler {
    pub module: String,
    pub function: String,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("module", &self.module)
            .field("function", &self.function)
            .finish_non_exhaustive()
    }
}

/// All modules the shim knows about, and which of them are loaded
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Module>,
    loaded: BTreeSet<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, replacing any module with the same id
    pub fn register(&mut self, module: Module) -> &mut Self {
        self.modules.insert(module.id.clone(), module);
        self
    }

    #[must_use]
    pub fn with(mut self, module: Module) -> Self {
        self.register(module);
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    /// Modules loaded so far
    pub fn loaded(&self) -> &BTreeSet<String> {
        &self.loaded
    }

    /// Load a module and, before it, everything it imports
    pub fn load(&mut self, id: &str) -> Result<&Module, ShimError> {
        self.load_module(id)?;
        self.modules
            .get(id)
            .ok_or_else(|| ShimError::ModuleNotFound(id.to_string()))
    }

    fn load_module(&mut self, id: &str) -> Result<(), ShimError> {
        if self.loaded.contains(id) {
            return Ok(());
        }
        let imports = self
            .modules
            .get(id)
            .ok_or_else(|| ShimError::ModuleNotFound(id.to_string()))?
            .imports
            .clone();

        // Marked before its imports so that import cycles terminate
        self.loaded.insert(id.to_string());

        let result = imports
            .iter()
            .try_for_each(|import| self.load_module(import))
            .and_then(|()| self.run_load_hook(id));

        if result.is_err() {
            self.loaded.remove(id);
        } else {
            debug!(module = %id, "Loaded module");
        }
        result
    }

    fn run_load_hook(&self, id: &str) -> Result<(), ShimError> {
        let Some(hook) = self.modules.get(id).and_then(|m| m.on_load.as_ref()) else {
            return Ok(());
        };
        hook().map_err(|message| ShimError::ModuleLoad {
            module: id.to_string(),
            message,
        })
    }

    /// Resolve `function` in the first candidate module that exists
    pub fn resolve(
        &mut self,
        candidates: &[String],
        function: &str,
    ) -> Result<ResolvedHandler, ShimError> {
        let module_id = candidates
            .iter()
            .find(|id| self.contains(id))
            .or_else(|| candidates.last())
            .cloned()
            .unwrap_or_default();

        let module = self.load(&module_id)?;
        match module.attribute(function) {
            Some(Attribute::Function(handler)) => Ok(ResolvedHandler {
                module: module_id.clone(),
                function: function.to_string(),
                handler: Arc::clone(handler),
            }),
            Some(Attribute::Value(_)) => Err(ShimError::NotCallable {
                module: module_id.clone(),
                attribute: function.to_string(),
            }),
            None => Err(ShimError::AttributeNotFound {
                module: module_id.clone(),
                attribute: function.to_string(),
            }),
        }
    }

    /// Loaded modules under `prefix`, other than `handler_module` itself
    pub fn watch_set(&self, prefix: &str, handler_module: &str) -> Vec<String> {
        self.loaded
            .iter()
            .filter(|id| id.as_str() != handler_module && under_prefix(id, prefix))
            .cloned()
            .collect()
    }
}

fn under_prefix(id: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || id == prefix
        || id
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Top-level package of a dotted module id
pub fn root_package(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}
