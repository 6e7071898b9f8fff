//! Local function host for fnshim
//!
//! Loads a handler from a [`ModuleRegistry`], then reads one JSON request per
//! line, invokes the handler with an emulated execution context and writes a
//! framed result for each request.

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod invocation;
pub mod invoke_loop;
pub mod module;
pub mod protocol;

pub use bootstrap::{Bootstrap, Runtime};
pub use config::{Mode, ShimOptions, StartupConfig};
pub use context::{ContextEmulator, ExecutionContext};
pub use invocation::{Handler, InvocationResult};
pub use invoke_loop::{InvocationLoop, LoopStats};
pub use module::{Module, ModuleRegistry};
pub use protocol::{Channels, OutputChannel};

pub use fnshim_core::{frame, raise, traced};
pub use fnshim_core::{ErrorResponse, Frame, HandlerError, Payload, ShimError};
pub use rust_decimal::Decimal;

/// Load the handler and serve requests from the process's standard streams
/// until stdin closes
pub fn run_stdio(
    startup: StartupConfig,
    options: ShimOptions,
    registry: &mut ModuleRegistry,
) -> Result<LoopStats, ShimError> {
    let runtime = Bootstrap::new(startup, options).load(registry, Channels::stdio())?;
    runtime.run(std::io::stdin().lock())
}
