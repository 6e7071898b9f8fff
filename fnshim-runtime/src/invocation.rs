//! Invocation handling
//!
//! Decodes a request line, and runs the handler inside a capture boundary
//! that turns both returned errors and panics into the failure shape.

use fnshim_core::failure::Frame;
use fnshim_core::{ErrorResponse, HandlerError, Payload};
use serde_json::{Map, Value};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use thiserror::Error;

use crate::context::{ContextSeed, ExecutionContext, IdentitySource};

/// `errorType` reported for request lines that cannot be decoded
pub const MALFORMED_REQUEST: &str = "Runtime.MalformedRequest";

/// `errorType` reported when a handler result cannot be serialized
pub const SERIALIZATION_ERROR: &str = "Runtime.SerializationError";

/// Symbol the reported call chain stops at
const CALL_BOUNDARY: &str = "fnshim_runtime::invocation::call_boundary";

/// Runtime frames that sit between the boundary and handler code
const RUNTIME_FRAMES: &[&str] = &[
    "fnshim_runtime::invocation::install_panic_hook",
    "as fnshim_runtime::invocation::Handler>::call",
];

/// A callable the shim can invoke
pub trait Handler: Send + Sync {
    fn call(&self, event: Value, context: &ExecutionContext) -> Result<Payload, HandlerError>;
}

impl<F, R> Handler for F
where
    F: Fn(Value, &ExecutionContext) -> Result<R, HandlerError> + Send + Sync,
    R: Into<Payload>,
{
    fn call(&self, event: Value, context: &ExecutionContext) -> Result<Payload, HandlerError> {
        self(event, context).map(Into::into)
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request must be a JSON object")]
    NotAnObject,

    #[error("Missing required key '{0}'")]
    MissingKey(&'static str),

    #[error("'{0}' must be a string")]
    NotAString(&'static str),
}

/// One decoded request line
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub event: Value,
    pub seed: ContextSeed,
}

impl InvocationRequest {
    /// Decode a request line.
    ///
    /// With a context object the line must carry `event` and `context`;
    /// with a request id it must carry `event` and a string `awsRequestId`.
    pub fn decode(line: &str, identity: IdentitySource) -> Result<Self, RequestError> {
        let Value::Object(mut fields) = serde_json::from_str(line)? else {
            return Err(RequestError::NotAnObject);
        };

        let event = take(&mut fields, "event")?;
        let seed = match identity {
            IdentitySource::ContextObject => ContextSeed::Object {
                context: take(&mut fields, "context")?,
                aws_request_id: fields
                    .get("awsRequestId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            IdentitySource::RequestId => match take(&mut fields, "awsRequestId")? {
                Value::String(id) => ContextSeed::RequestId(id),
                _ => return Err(RequestError::NotAString("awsRequestId")),
            },
        };

        Ok(Self { event, seed })
    }
}

fn take(fields: &mut Map<String, Value>, key: &'static str) -> Result<Value, RequestError> {
    fields.remove(key).ok_or(RequestError::MissingKey(key))
}

/// Outcome of one invocation
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    /// Serialized handler return value
    Success(String),
    Failure(ErrorResponse),
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn malformed(err: &RequestError) -> Self {
        Self::Failure(ErrorResponse::new(MALFORMED_REQUEST, err.to_string()))
    }
}

/// Invoke the handler and convert whatever comes out of it
pub fn invoke(handler: &dyn Handler, event: Value, context: &ExecutionContext) -> InvocationResult {
    match call_boundary(handler, event, context) {
        Ok(payload) => match payload.to_json() {
            Ok(json) => InvocationResult::Success(json),
            Err(e) => InvocationResult::Failure(ErrorResponse::new(SERIALIZATION_ERROR, e.to_string())),
        },
        Err(err) => InvocationResult::Failure(err.to_response()),
    }
}

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static PANIC_SITE: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

struct PanicSite {
    location: Option<Frame>,
    backtrace: Backtrace,
}

/// Panics raised inside the boundary are recorded instead of printed;
/// everything else goes to the hook that was installed before.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let site = PanicSite {
                    location: info.location().map(Frame::from_location),
                    backtrace: Backtrace::force_capture(),
                };
                PANIC_SITE.with(|slot| *slot.borrow_mut() = Some(site));
            } else {
                previous(info);
            }
        }));
    });
}

fn call_boundary(
    handler: &dyn Handler,
    event: Value,
    context: &ExecutionContext,
) -> Result<Payload, HandlerError> {
    install_panic_hook();

    let was_capturing = CAPTURING.with(|c| c.replace(true));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.call(event, context)));
    CAPTURING.with(|c| c.set(was_capturing));

    let outcome = outcome.unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        Err(match PANIC_SITE.with(|slot| slot.borrow_mut().take()) {
            Some(site) => HandlerError::from_panic(message, site.location).with_backtrace(site.backtrace),
            None => HandlerError::from_panic(message, None),
        })
    });
    outcome.map_err(|err| err.with_call_chain(CALL_BOUNDARY, RUNTIME_FRAMES))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ShimOptions, StartupConfig};
    use crate::context::{ContextConfig, ContextEmulator};
    use crate::protocol::OutputChannel;
    use fnshim_core::{raise, traced};
    use serde_json::json;

    fn context() -> ExecutionContext {
        let startup = StartupConfig::from_args(&["src.lambda.test", "handler", "test", "3"]).unwrap();
        let config = ContextConfig::new(&startup, &ShimOptions::default());
        ContextEmulator::new(config, OutputChannel::new(std::io::sink()))
            .emulate(&ContextSeed::RequestId("req-1".to_string()))
    }

    fn find_user(id: &str) -> Result<Value, HandlerError> {
        if id == "1" {
            return Ok(json!({"id": "1"}));
        }
        raise!("KeyError", "{}", id);
    }

    fn lookup_handler(event: Value, _ctx: &ExecutionContext) -> Result<Value, HandlerError> {
        let id = event["id"].as_str().unwrap_or_default().to_string();
        let user = traced!(find_user(&id));
        Ok(user)
    }

    #[test]
    fn test_decode_request_id_request() {
        let request = InvocationRequest::decode(
            r#"{"event": {"x": 1}, "awsRequestId": "abc"}"#,
            IdentitySource::RequestId,
        )
        .unwrap();
        assert_eq!(request.event, json!({"x": 1}));
        assert_eq!(request.seed, ContextSeed::RequestId("abc".to_string()));
    }

    #[test]
    fn test_decode_context_object_request() {
        let request = InvocationRequest::decode(
            r#"{"event": null, "context": {"k": "v"}, "awsRequestId": "abc"}"#,
            IdentitySource::ContextObject,
        )
        .unwrap();
        assert_eq!(request.event, Value::Null);
        assert_eq!(
            request.seed,
            ContextSeed::Object {
                context: json!({"k": "v"}),
                aws_request_id: Some("abc".to_string()),
            }
        );
    }

    #[test]
    fn test_decode_rejects_malformed_lines() {
        assert!(matches!(
            InvocationRequest::decode("{not json", IdentitySource::RequestId),
            Err(RequestError::Json(_))
        ));
        assert!(matches!(
            InvocationRequest::decode("[1, 2]", IdentitySource::RequestId),
            Err(RequestError::NotAnObject)
        ));
        assert!(matches!(
            InvocationRequest::decode(r#"{"event": {}}"#, IdentitySource::RequestId),
            Err(RequestError::MissingKey("awsRequestId"))
        ));
        assert!(matches!(
            InvocationRequest::decode(r#"{"event": {}, "awsRequestId": 7}"#, IdentitySource::RequestId),
            Err(RequestError::NotAString("awsRequestId"))
        ));
        assert!(matches!(
            InvocationRequest::decode(r#"{"event": {}}"#, IdentitySource::ContextObject),
            Err(RequestError::MissingKey("context"))
        ));
    }

    #[test]
    fn test_success_is_serialized() {
        let handler = |event: Value, _ctx: &ExecutionContext| -> Result<Value, HandlerError> {
            Ok(json!({"y": event["x"].as_i64().unwrap_or_default() + 1}))
        };
        let result = invoke(&handler, json!({"x": 1}), &context());
        assert_eq!(result, InvocationResult::Success(r#"{"y":2}"#.to_string()));
    }

    #[test]
    fn test_handler_error_reports_handler_frames_only() {
        let result = invoke(&lookup_handler, json!({"id": "boom"}), &context());
        let InvocationResult::Failure(err) = result else {
            panic!("expected failure");
        };

        assert_eq!(err.error_type, "KeyError");
        assert_eq!(err.error_message, "boom");
        assert_eq!(err.stack_trace.len(), 2);
        assert!(err.stack_trace[0].contains("in lookup_handler"));
        assert!(err.stack_trace[1].contains("in find_user"));
        assert!(err.stack_trace.iter().all(|f| !f.contains("call_boundary")));
    }

    #[test]
    fn test_panic_is_captured() {
        let handler = |_event: Value, _ctx: &ExecutionContext| -> Result<Value, HandlerError> {
            panic!("handler exploded");
        };
        let result = invoke(&handler, Value::Null, &context());
        let InvocationResult::Failure(err) = result else {
            panic!("expected failure");
        };

        assert_eq!(err.error_type, "Panic");
        assert_eq!(err.error_message, "handler exploded");
        assert_eq!(err.stack_trace.len(), 1);
        assert!(err.stack_trace[0].contains("invocation.rs"));
    }

    fn nth_item(items: &[i64], n: usize) -> i64 {
        items[n]
    }

    fn indexing_handler(event: Value, _ctx: &ExecutionContext) -> Result<Value, HandlerError> {
        let n = usize::try_from(event["n"].as_u64().unwrap_or_default()).unwrap_or_default();
        Ok(json!(nth_item(&[], n)))
    }

    fn plain_handler(event: Value, _ctx: &ExecutionContext) -> Result<Value, HandlerError> {
        let user = find_user(event["id"].as_str().unwrap_or_default())?;
        Ok(user)
    }

    #[test]
    fn test_panic_in_helper_reports_each_frame() {
        let result = invoke(&indexing_handler, json!({"n": 3}), &context());
        let InvocationResult::Failure(err) = result else {
            panic!("expected failure");
        };

        assert_eq!(err.error_type, "Panic");
        assert!(err.error_message.contains("index out of bounds"));
        assert_eq!(err.stack_trace.len(), 2, "{:?}", err.stack_trace);
        assert!(err.stack_trace[0].contains("in indexing_handler"));
        assert!(err.stack_trace[1].contains("in nth_item"));
        assert!(err.stack_trace.iter().all(|f| f.contains("invocation.rs")));
    }

    #[test]
    fn test_question_mark_keeps_handler_frame() {
        let result = invoke(&plain_handler, json!({"id": "7"}), &context());
        let InvocationResult::Failure(err) = result else {
            panic!("expected failure");
        };

        assert_eq!(err.error_type, "KeyError");
        assert_eq!(err.stack_trace.len(), 2, "{:?}", err.stack_trace);
        assert!(err.stack_trace[0].contains("in plain_handler"));
        assert!(err.stack_trace[1].contains("in find_user"));
    }

    #[test]
    fn test_std_error_kind_comes_from_type() {
        let handler = |event: Value, _ctx: &ExecutionContext| -> Result<i64, HandlerError> {
            let n: i64 = event.as_str().unwrap_or_default().parse()?;
            Ok(n)
        };
        let result = invoke(&handler, json!("seven"), &context());
        let InvocationResult::Failure(err) = result else {
            panic!("expected failure");
        };
        assert_eq!(err.error_type, "ParseIntError");
    }
}
