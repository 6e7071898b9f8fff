//! Execution context emulation
//!
//! A fresh [`ExecutionContext`] is built for every invocation. Identity
//! fields are derived from the startup configuration and the request id
//! only; the clock and the process environment are injected so that both
//! can be replaced in tests.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::config::{ShimOptions, StartupConfig};
use crate::protocol::OutputChannel;

/// Environment variable holding the memory limit when identity comes from a
/// bare request id
pub const MEMORY_SIZE_VAR: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";

/// Request id used when a context object carries none
pub const DEFAULT_REQUEST_ID: &str = "1234567890";

/// Millisecond wall clock
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self(Arc::new(AtomicI64::new(now_ms)))
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read access to environment variables
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Where per-invocation identity comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// A context object embedded in each request; memory limit from
    /// configuration
    ContextObject,
    /// A request id string in each request; memory limit from the
    /// environment
    RequestId,
}

/// Identity data carried by one request
#[derive(Debug, Clone, PartialEq)]
pub enum ContextSeed {
    Object {
        context: Value,
        aws_request_id: Option<String>,
    },
    RequestId(String),
}

impl ContextSeed {
    /// The request id: the context object's `awsRequestId`, then the
    /// request's own, then [`DEFAULT_REQUEST_ID`]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Object {
                context,
                aws_request_id,
            } => context
                .get("awsRequestId")
                .and_then(Value::as_str)
                .or(aws_request_id.as_deref())
                .unwrap_or(DEFAULT_REQUEST_ID),
            Self::RequestId(id) => id,
        }
    }

    fn client_context(&self) -> Option<&Value> {
        match self {
            Self::Object { context, .. } => Some(context),
            Self::RequestId(_) => None,
        }
    }
}

/// Everything the emulator needs that does not change between invocations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    pub function_name: String,
    pub function_version: String,
    pub timeout_secs: u64,
    pub region: String,
    pub account_id: String,
    pub default_memory_mb: u32,
    pub identity: IdentitySource,
}

impl ContextConfig {
    pub fn new(startup: &StartupConfig, options: &ShimOptions) -> Self {
        Self {
            function_name: startup.function_name.clone(),
            function_version: options.function_version.clone(),
            timeout_secs: startup.timeout_secs,
            region: options.region.clone(),
            account_id: options.account_id.clone(),
            default_memory_mb: options.default_memory_mb,
            identity: startup.mode.identity_source(),
        }
    }

    /// Function ARN, unqualified
    pub fn function_arn(&self) -> String {
        format!(
            "arn:aws:lambda:{}:{}:function:{}",
            self.region, self.account_id, self.function_name
        )
    }
}

/// Builds an [`ExecutionContext`] per invocation
pub struct ContextEmulator {
    config: ContextConfig,
    clock: Arc<dyn Clock>,
    env: Arc<dyn EnvSource>,
    log: OutputChannel,
}

impl ContextEmulator {
    /// Emulator on the system clock and process environment, logging to `log`
    pub fn new(config: ContextConfig, log: OutputChannel) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            env: Arc::new(ProcessEnv),
            log,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn identity_source(&self) -> IdentitySource {
        self.config.identity
    }

    /// Context for one invocation
    pub fn emulate(&self, seed: &ContextSeed) -> ExecutionContext {
        let created_ms = self.clock.now_ms();
        let request_id = seed.request_id().to_string();
        let client_context = match self.config.identity {
            IdentitySource::ContextObject => seed.client_context().cloned(),
            IdentitySource::RequestId => None,
        };

        ExecutionContext {
            function_name: self.config.function_name.clone(),
            function_version: self.config.function_version.clone(),
            invoked_function_arn: self.config.function_arn(),
            memory_limit_in_mb: self.memory_limit_in_mb(),
            log_group_name: format!("/aws/lambda/{}", self.config.function_name),
            log_stream_name: log_stream_name(
                created_ms,
                &self.config.function_version,
                &request_id,
            ),
            aws_request_id: request_id,
            client_context,
            created_ms,
            timeout_ms: i64::try_from(self.config.timeout_secs)
                .unwrap_or(i64::MAX)
                .saturating_mul(1000),
            clock: Arc::clone(&self.clock),
            log: self.log.clone(),
        }
    }

    fn memory_limit_in_mb(&self) -> u32 {
        match self.config.identity {
            IdentitySource::ContextObject => self.config.default_memory_mb,
            IdentitySource::RequestId => match self.env.var(MEMORY_SIZE_VAR) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    warn!(value = %raw, "Ignoring non-numeric {}", MEMORY_SIZE_VAR);
                    self.config.default_memory_mb
                }),
                None => self.config.default_memory_mb,
            },
        }
    }
}

/// `YYYY/MM/DD/[version]<hash>` where the hash is derived from the request id
fn log_stream_name(created_ms: i64, version: &str, request_id: &str) -> String {
    let date = DateTime::<Utc>::from_timestamp_millis(created_ms)
        .unwrap_or_default()
        .format("%Y/%m/%d");
    let digest = hex::encode(Sha256::digest(request_id.as_bytes()));
    format!("{date}/[{version}]{}", &digest[..32])
}

/// The context value passed to a handler
pub struct ExecutionContext {
    function_name: String,
    function_version: String,
    invoked_function_arn: String,
    memory_limit_in_mb: u32,
    aws_request_id: String,
    log_group_name: String,
    log_stream_name: String,
    client_context: Option<Value>,
    created_ms: i64,
    timeout_ms: i64,
    clock: Arc<dyn Clock>,
    log: OutputChannel,
}

impl ExecutionContext {
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn function_version(&self) -> &str {
        &self.function_version
    }

    pub fn invoked_function_arn(&self) -> &str {
        &self.invoked_function_arn
    }

    pub fn memory_limit_in_mb(&self) -> u32 {
        self.memory_limit_in_mb
    }

    pub fn aws_request_id(&self) -> &str {
        &self.aws_request_id
    }

    pub fn log_group_name(&self) -> &str {
        &self.log_group_name
    }

    pub fn log_stream_name(&self) -> &str {
        &self.log_stream_name
    }

    /// The context object the request carried, when identity comes from one
    pub fn client_context(&self) -> Option<&Value> {
        self.client_context.as_ref()
    }

    pub fn created_ms(&self) -> i64 {
        self.created_ms
    }

    pub fn deadline_ms(&self) -> i64 {
        self.created_ms.saturating_add(self.timeout_ms)
    }

    /// Get remaining time in milliseconds, never below zero
    pub fn get_remaining_time_in_millis(&self) -> i64 {
        let elapsed = self.clock.now_ms() - self.created_ms;
        (self.timeout_ms - elapsed).max(0)
    }

    /// Write a line to standard output alongside the framed results
    pub fn log(&self, message: impl AsRef<str>) {
        if let Err(e) = self.log.write_text(message.as_ref()) {
            warn!(error = %e, "Failed to write handler log");
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("function_name", &self.function_name)
            .field("function_version", &self.function_version)
            .field("aws_request_id", &self.aws_request_id)
            .field("created_ms", &self.created_ms)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::protocol::Capture;
    use serde_json::json;

    fn startup(mode: Mode, timeout_secs: u64) -> StartupConfig {
        StartupConfig {
            mode,
            search_path: None,
            module: "src.lambda.users".to_string(),
            function: "handler".to_string(),
            function_name: "users".to_string(),
            timeout_secs,
        }
    }

    fn emulator(mode: Mode, timeout_secs: u64, clock: &ManualClock) -> (ContextEmulator, Capture) {
        let out = Capture::default();
        let config = ContextConfig::new(&startup(mode, timeout_secs), &ShimOptions::default());
        let emulator = ContextEmulator::new(config, OutputChannel::new(out.clone()))
            .with_clock(Arc::new(clock.clone()))
            .with_env(Arc::new(HashMap::<String, String>::new()));
        (emulator, out)
    }

    #[test]
    fn test_remaining_time_counts_down_and_clamps() {
        let clock = ManualClock::new(1_700_000_000_000);
        let (emulator, _) = emulator(Mode::WorkingDir, 3, &clock);
        let ctx = emulator.emulate(&ContextSeed::RequestId("abc".to_string()));

        assert_eq!(ctx.get_remaining_time_in_millis(), 3000);

        clock.advance(1250);
        assert_eq!(ctx.get_remaining_time_in_millis(), 1750);

        clock.advance(1749);
        assert_eq!(ctx.get_remaining_time_in_millis(), 1);

        clock.advance(1);
        assert_eq!(ctx.get_remaining_time_in_millis(), 0);

        clock.advance(60_000);
        assert_eq!(ctx.get_remaining_time_in_millis(), 0);
        assert_eq!(ctx.deadline_ms(), 1_700_000_003_000);
    }

    #[test]
    fn test_identity_is_deterministic() {
        let clock = ManualClock::new(1_700_000_000_000);
        let (emulator, _) = emulator(Mode::WorkingDir, 3, &clock);

        let a = emulator.emulate(&ContextSeed::RequestId("abc".to_string()));
        let b = emulator.emulate(&ContextSeed::RequestId("abc".to_string()));
        let c = emulator.emulate(&ContextSeed::RequestId("xyz".to_string()));

        assert_eq!(a.function_name(), "users");
        assert_eq!(a.function_version(), "$LATEST");
        assert_eq!(a.aws_request_id(), "abc");
        assert_eq!(
            a.invoked_function_arn(),
            "arn:aws:lambda:us-east-1:000000000000:function:users"
        );
        assert_eq!(a.log_group_name(), "/aws/lambda/users");
        assert!(a.log_stream_name().starts_with("2023/11/14/[$LATEST]"));
        assert_eq!(a.log_stream_name().len(), "2023/11/14/[$LATEST]".len() + 32);
        assert_eq!(a.log_stream_name(), b.log_stream_name());
        assert_ne!(a.log_stream_name(), c.log_stream_name());
    }

    #[test]
    fn test_memory_limit_from_environment() {
        let clock = ManualClock::new(0);
        let (emulator, _) = emulator(Mode::WorkingDir, 3, &clock);
        let seed = ContextSeed::RequestId("abc".to_string());

        assert_eq!(emulator.emulate(&seed).memory_limit_in_mb(), 1024);

        let env: HashMap<String, String> =
            [(MEMORY_SIZE_VAR.to_string(), "512".to_string())].into_iter().collect();
        let emulator = emulator.with_env(Arc::new(env));
        assert_eq!(emulator.emulate(&seed).memory_limit_in_mb(), 512);

        let env: HashMap<String, String> =
            [(MEMORY_SIZE_VAR.to_string(), "lots".to_string())].into_iter().collect();
        let emulator = emulator.with_env(Arc::new(env));
        assert_eq!(emulator.emulate(&seed).memory_limit_in_mb(), 1024);
    }

    #[test]
    fn test_context_object_identity_ignores_environment() {
        let clock = ManualClock::new(0);
        let (emulator, _) = emulator(Mode::HandlerDir, 6, &clock);
        let env: HashMap<String, String> =
            [(MEMORY_SIZE_VAR.to_string(), "512".to_string())].into_iter().collect();
        let emulator = emulator.with_env(Arc::new(env));

        let ctx = emulator.emulate(&ContextSeed::Object {
            context: json!({"awsRequestId": "from-context", "custom": {"tenant": "a"}}),
            aws_request_id: Some("from-request".to_string()),
        });
        assert_eq!(ctx.aws_request_id(), "from-context");
        assert_eq!(ctx.memory_limit_in_mb(), 1024);
        assert_eq!(ctx.client_context().unwrap()["custom"]["tenant"], "a");

        let ctx = emulator.emulate(&ContextSeed::Object {
            context: json!(""),
            aws_request_id: None,
        });
        assert_eq!(ctx.aws_request_id(), DEFAULT_REQUEST_ID);
    }

    #[test]
    fn test_log_writes_to_stdout_channel() {
        let clock = ManualClock::new(0);
        let (emulator, out) = emulator(Mode::WorkingDir, 3, &clock);
        let ctx = emulator.emulate(&ContextSeed::RequestId("abc".to_string()));

        ctx.log("starting");
        ctx.log("done\n");
        assert_eq!(out.contents(), "starting\ndone\n");
    }
}
