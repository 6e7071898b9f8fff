//! Startup configuration
//!
//! The shim is started with a fixed list of positional parameters. Two
//! layouts are accepted:
//!
//! - handler directory, module, function, function name, timeout
//! - module, function, function name, timeout (working directory implied)

use fnshim_core::ShimError;
use std::path::{Component, Path, PathBuf};

use crate::context::IdentitySource;

/// Startup layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Handler directory given explicitly; requests carry a `context` object
    HandlerDir,
    /// Working directory implied; requests carry an `awsRequestId` and the
    /// watch set is emitted after loading
    WorkingDir,
}

impl Mode {
    /// Where per-invocation identity comes from in this mode
    pub fn identity_source(self) -> IdentitySource {
        match self {
            Self::HandlerDir => IdentitySource::ContextObject,
            Self::WorkingDir => IdentitySource::RequestId,
        }
    }

    pub fn emits_watch_set(self) -> bool {
        matches!(self, Self::WorkingDir)
    }
}

/// Parameters parsed once at process start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupConfig {
    pub mode: Mode,
    pub search_path: Option<PathBuf>,
    pub module: String,
    pub function: String,
    pub function_name: String,
    pub timeout_secs: u64,
}

impl StartupConfig {
    /// Parse the positional startup parameters
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, ShimError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        match args.as_slice() {
            [dir, module, function, name, timeout] => Ok(Self {
                mode: Mode::HandlerDir,
                search_path: Some(PathBuf::from(dir)),
                module: normalize_module(module),
                function: (*function).to_string(),
                function_name: (*name).to_string(),
                timeout_secs: parse_timeout(timeout)?,
            }),
            [module, function, name, timeout] => Ok(Self {
                mode: Mode::WorkingDir,
                search_path: None,
                module: normalize_module(module),
                function: (*function).to_string(),
                function_name: (*name).to_string(),
                timeout_secs: parse_timeout(timeout)?,
            }),
            other => Err(ShimError::InvalidParameters {
                expected: "[handler_dir] <module> <function> <function_name> <timeout>",
                got: other.len(),
            }),
        }
    }

    /// Module identifiers to try, in search order.
    ///
    /// With a handler directory the module is looked up inside the package
    /// that directory maps to (relative to `cwd`) before falling back to the
    /// bare identifier.
    ///
    /// An absolute module path is taken relative to `cwd`; one outside `cwd`
    /// is kept as given and will not resolve.
    pub fn module_candidates(&self, cwd: &Path) -> Vec<String> {
        let module = match Path::new(&self.module) {
            path if path.is_absolute() => match path.strip_prefix(cwd) {
                Ok(relative) => normalize_module(&relative.to_string_lossy()),
                Err(_) => self.module.clone(),
            },
            _ => self.module.clone(),
        };

        let mut candidates = Vec::with_capacity(2);
        if let Some(package) = self.search_path.as_deref().and_then(|dir| package_for(dir, cwd)) {
            candidates.push(format!("{package}.{module}"));
        }
        candidates.push(module);
        candidates
    }
}

/// Settings that shape the emulated context but are not part of the
/// positional startup contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimOptions {
    pub function_version: String,
    pub region: String,
    pub account_id: String,
    pub default_memory_mb: u32,
    /// Source-root prefix for the watch set; defaults to the handler
    /// module's top-level package
    pub watch_prefix: Option<String>,
}

impl Default for ShimOptions {
    fn default() -> Self {
        Self {
            function_version: "$LATEST".to_string(),
            region: "us-east-1".to_string(),
            account_id: "000000000000".to_string(),
            default_memory_mb: 1024,
            watch_prefix: None,
        }
    }
}

fn parse_timeout(raw: &str) -> Result<u64, ShimError> {
    raw.trim()
        .parse()
        .map_err(|_| ShimError::InvalidTimeout(raw.to_string()))
}

/// `src/handlers/orders.rs` and `./src/handlers/orders` both become
/// `src.handlers.orders`. Absolute paths are left for
/// [`StartupConfig::module_candidates`], which knows the working directory.
fn normalize_module(raw: &str) -> String {
    if Path::new(raw).is_absolute() {
        return raw.to_string();
    }
    let trimmed = raw.strip_prefix("./").unwrap_or(raw);
    let trimmed = trimmed.strip_suffix(".rs").unwrap_or(trimmed);
    trimmed.replace(|c: char| c == '/' || c == '\\', ".")
}

/// Dotted package for a handler directory, `None` when the directory is the
/// working directory itself or lies outside it
fn package_for(dir: &Path, cwd: &Path) -> Option<String> {
    let relative = if dir.is_absolute() {
        dir.strip_prefix(cwd).ok()?
    } else {
        dir
    };

    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => segments.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("."))
    }
}
