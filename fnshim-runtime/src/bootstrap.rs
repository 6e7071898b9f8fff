//! One-time startup
//!
//! Resolves the handler from the registry, computes the watch set and
//! builds the [`InvocationLoop`]. Any failure here is fatal and happens
//! before a single request is read.

use fnshim_core::ShimError;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ShimOptions, StartupConfig};
use crate::context::{Clock, ContextConfig, ContextEmulator, EnvSource};
use crate::invoke_loop::{InvocationLoop, LoopStats};
use crate::module::{root_package, ModuleRegistry};
use crate::protocol::Channels;

pub struct Bootstrap {
    startup: StartupConfig,
    options: ShimOptions,
    working_dir: Option<PathBuf>,
    clock: Option<Arc<dyn Clock>>,
    env: Option<Arc<dyn EnvSource>>,
}

impl Bootstrap {
    pub fn new(startup: StartupConfig, options: ShimOptions) -> Self {
        Self {
            startup,
            options,
            working_dir: None,
            clock: None,
            env: None,
        }
    }

    /// Directory handler directories are taken relative to; defaults to the
    /// process's current directory
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = Some(env);
        self
    }

    /// Resolve the handler and prepare the loop
    pub fn load(self, registry: &mut ModuleRegistry, channels: Channels) -> Result<Runtime, ShimError> {
        let working_dir = match self.working_dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };

        let candidates = self.startup.module_candidates(&working_dir);
        debug!(candidates = ?candidates, function = %self.startup.function, "Resolving handler");
        let resolved = registry.resolve(&candidates, &self.startup.function)?;

        let watch_set = if self.startup.mode.emits_watch_set() {
            let prefix = self
                .options
                .watch_prefix
                .clone()
                .unwrap_or_else(|| root_package(&resolved.module).to_string());
            registry.watch_set(&prefix, &resolved.module)
        } else {
            Vec::new()
        };

        info!(
            module = %resolved.module,
            function = %resolved.function,
            mode = ?self.startup.mode,
            watched = watch_set.len(),
            "Handler loaded"
        );

        let mut emulator = ContextEmulator::new(
            ContextConfig::new(&self.startup, &self.options),
            channels.stdout.clone(),
        );
        if let Some(clock) = self.clock {
            emulator = emulator.with_clock(clock);
        }
        if let Some(env) = self.env {
            emulator = emulator.with_env(env);
        }

        Ok(Runtime {
            emit_watch: self.startup.mode.emits_watch_set(),
            watch_set,
            channels: channels.clone(),
            invocation_loop: InvocationLoop::new(resolved.handler, emulator, channels),
        })
    }
}

/// A loaded handler, ready to serve requests
pub struct Runtime {
    emit_watch: bool,
    watch_set: Vec<String>,
    channels: Channels,
    invocation_loop: InvocationLoop,
}

impl Runtime {
    /// Loaded modules to watch for changes, sorted
    pub fn watch_set(&self) -> &[String] {
        &self.watch_set
    }

    /// Write the watch set, if this mode reports one, then serve `input`
    pub fn run<R: BufRead>(mut self, input: R) -> Result<LoopStats, ShimError> {
        if self.emit_watch {
            self.channels.write_watch(&self.watch_set)?;
        }
        self.invocation_loop.run(input)
    }
}
