//! Settings file and environment

use fnshim_runtime::ShimOptions;
use serde::Deserialize;
use std::path::Path;

/// Settings that are not part of the positional startup parameters
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_function_version")]
    pub function_version: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_account_id")]
    pub account_id: String,

    /// Memory limit reported when the environment does not provide one
    #[serde(default = "default_memory_mb")]
    pub default_memory_mb: u32,

    #[serde(default)]
    pub watch_prefix: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            function_version: default_function_version(),
            region: default_region(),
            account_id: default_account_id(),
            default_memory_mb: default_memory_mb(),
            watch_prefix: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_function_version() -> String {
    ShimOptions::default().function_version
}

fn default_region() -> String {
    ShimOptions::default().region
}

fn default_account_id() -> String {
    ShimOptions::default().account_id
}

fn default_memory_mb() -> u32 {
    ShimOptions::default().default_memory_mb
}

impl Settings {
    /// Load settings from `fnshim.toml` (or `path`, which must exist) and
    /// `FNSHIM_*` environment variables
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => ::config::File::from(path).required(true),
            None => ::config::File::with_name("fnshim").required(false),
        };

        let settings = ::config::Config::builder()
            .add_source(file)
            .add_source(::config::Environment::with_prefix("FNSHIM"))
            .build()?;

        Ok(settings.try_deserialize::<Settings>()?)
    }

    pub fn shim_options(&self) -> ShimOptions {
        ShimOptions {
            function_version: self.function_version.clone(),
            region: self.region.clone(),
            account_id: self.account_id.clone(),
            default_memory_mb: self.default_memory_mb,
            watch_prefix: self.watch_prefix.clone(),
        }
    }
}
