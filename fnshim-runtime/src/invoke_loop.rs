//! Request loop
//!
//! Reads one request per line until end of input, one invocation at a time.
//! Every line produces exactly one framed result, so a supervisor can pair
//! requests with results by order alone.

use fnshim_core::ShimError;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::ContextEmulator;
use crate::invocation::{invoke, Handler, InvocationRequest, InvocationResult};
use crate::protocol::Channels;

/// Loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingLine,
    Invoking,
    EmittingResult,
    Closed,
}

/// Counters reported when the loop ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
}

impl LoopStats {
    fn record(&mut self, result: &InvocationResult) {
        self.invocations += 1;
        if result.is_success() {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }
}

pub struct InvocationLoop {
    handler: Arc<dyn Handler>,
    emulator: ContextEmulator,
    channels: Channels,
    state: LoopState,
    stats: LoopStats,
}

impl InvocationLoop {
    pub fn new(handler: Arc<dyn Handler>, emulator: ContextEmulator, channels: Channels) -> Self {
        Self {
            handler,
            emulator,
            channels,
            state: LoopState::AwaitingLine,
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Serve requests from `input` until it is exhausted.
    ///
    /// Handler failures are reported and the loop continues; only a failure
    /// to read input or to write a result ends it early.
    pub fn run<R: BufRead>(&mut self, mut input: R) -> Result<LoopStats, ShimError> {
        let mut buf = Vec::new();
        loop {
            self.state = LoopState::AwaitingLine;
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                break;
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            self.state = LoopState::Invoking;
            let result = self.handle_line(line);

            self.state = LoopState::EmittingResult;
            self.emit(&result)?;
            self.stats.record(&result);
        }

        self.state = LoopState::Closed;
        debug!(
            invocations = self.stats.invocations,
            successes = self.stats.successes,
            failures = self.stats.failures,
            "Input closed"
        );
        Ok(self.stats)
    }

    /// Decode one request line and invoke the handler with it
    pub fn handle_line(&self, line: &str) -> InvocationResult {
        let request = match InvocationRequest::decode(line, self.emulator.identity_source()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed request line");
                return InvocationResult::malformed(&e);
            }
        };

        let context = self.emulator.emulate(&request.seed);
        debug!(request_id = %context.aws_request_id(), "Invoking handler");

        let result = invoke(self.handler.as_ref(), request.event, &context);
        if let InvocationResult::Failure(err) = &result {
            debug!(
                request_id = %context.aws_request_id(),
                error_type = %err.error_type,
                "Handler failed"
            );
        }
        result
    }

    fn emit(&self, result: &InvocationResult) -> Result<(), ShimError> {
        match result {
            InvocationResult::Success(json) => self.channels.write_response(json)?,
            InvocationResult::Failure(err) => self.channels.write_error(err)?,
        }
        Ok(())
    }
}
