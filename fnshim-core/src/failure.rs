//! Handler failures
//!
//! A [`HandlerError`] carries an error kind, a message and the frames it
//! passed through on its way out of the handler. Frames are recorded from the
//! point of failure outwards:
//!
//! - [`raise!`](crate::raise) creates an error at the current function
//! - [`traced!`](crate::traced) propagates an error and records the current
//!   function as the next frame out
//! - `?` on any `std::error::Error` records the `?` site as the origin, with
//!   the error's type name as the kind
//!
//! Every error also captures a backtrace where it is created. The invocation
//! boundary replaces the recorded frames with the call chain read from that
//! backtrace (see [`HandlerError::with_call_chain`]), so plain `?` between
//! handler functions keeps every frame. The macro frames are what remains
//! when the binary carries no symbols.
//!
//! Only frames inside the handler are ever reported, so the invocation
//! boundary that catches the error never shows up in the trace.

use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::path::Path;
use std::sync::Arc;

use crate::trace;

/// Error kind used for panics caught at the invocation boundary
pub const PANIC_KIND: &str = "Panic";

/// One entry of a handler stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub file: String,
    pub line: u32,
    pub scope: Option<String>,
}

impl Frame {
    pub fn new(file: impl Into<String>, line: u32, scope: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            scope: Some(scope.into()),
        }
    }

    /// Frame for the caller's source location, with no known scope
    #[track_caller]
    pub fn caller() -> Self {
        Self::from_location(Location::caller())
    }

    pub fn from_location(location: &Location<'_>) -> Self {
        Self {
            file: location.file().to_string(),
            line: location.line(),
            scope: None,
        }
    }

    fn same_site(&self, other: &Frame) -> bool {
        self.file == other.file && self.line == other.line
    }

    /// Format the frame the way a traceback prints it
    pub fn render(&self, sources: &mut SourceCache) -> String {
        let scope = self.scope.as_deref().unwrap_or("<unknown>");
        let mut out = format!("  File \"{}\", line {}, in {}\n", self.file, self.line, scope);
        if let Some(source) = sources.line(&self.file, self.line) {
            out.push_str("    ");
            out.push_str(&source);
            out.push('\n');
        }
        out
    }
}

/// Reads source lines for frames, caching each file once
#[derive(Debug, Default)]
pub struct SourceCache {
    files: HashMap<String, Option<Vec<String>>>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The trimmed source text of `line` (1-based) in `file`, if readable
    pub fn line(&mut self, file: &str, line: u32) -> Option<String> {
        let lines = self
            .files
            .entry(file.to_string())
            .or_insert_with(|| read_source(file))
            .as_ref()?;
        let index = usize::try_from(line).ok()?.checked_sub(1)?;
        lines
            .get(index)
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
    }
}

/// Only the exact path is read; a relative path resolves against the
/// working directory.
fn read_source(file: &str) -> Option<Vec<String>> {
    let text = std::fs::read_to_string(Path::new(file)).ok()?;
    Some(text.lines().map(str::to_string).collect())
}

/// Backtrace taken where an error was created
#[derive(Clone)]
struct Origin(Arc<Backtrace>);

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Origin")
    }
}

/// The failure a handler returns
#[derive(Debug, Clone)]
pub struct HandlerError {
    kind: String,
    message: String,
    // innermost first
    frames: Vec<Frame>,
    origin: Option<Origin>,
}

impl HandlerError {
    /// Create an error located at the caller
    #[track_caller]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::at(kind, message, Frame::caller())
    }

    /// Create an error located at `frame`
    pub fn at(kind: impl Into<String>, message: impl Into<String>, frame: Frame) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            frames: vec![frame],
            origin: None,
        }
        .with_backtrace(Backtrace::force_capture())
    }

    /// Error for a panic caught at the invocation boundary
    pub fn from_panic(message: impl Into<String>, location: Option<Frame>) -> Self {
        Self {
            kind: PANIC_KIND.to_string(),
            message: message.into(),
            frames: location.into_iter().collect(),
            origin: None,
        }
    }

    /// Use `backtrace` as the place the error came from
    #[must_use]
    pub fn with_backtrace(mut self, backtrace: Backtrace) -> Self {
        self.origin = Some(Origin(Arc::new(backtrace)));
        self
    }

    /// Replace the recorded frames with the call chain below `boundary`.
    ///
    /// The chain comes from the backtrace taken at creation, without
    /// symbols containing any of `skip`. Nothing changes when there is no
    /// backtrace, `boundary` is not on it, or no frame could be symbolized.
    #[must_use]
    pub fn with_call_chain(mut self, boundary: &str, skip: &[&str]) -> Self {
        let listing = match &self.origin {
            Some(Origin(backtrace)) => backtrace.to_string(),
            None => return self,
        };
        if let Some(frames) = trace::frames_below(&listing, boundary, skip).filter(|f| !f.is_empty()) {
            self.frames = frames;
        }
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Recorded frames, outermost first
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().rev()
    }

    /// Record the next frame out.
    ///
    /// A frame at the same site as the last one recorded only fills in the
    /// missing scope name.
    #[must_use]
    pub fn within(mut self, frame: Frame) -> Self {
        if let Some(last) = self.frames.last_mut() {
            if last.same_site(&frame) {
                if last.scope.is_none() {
                    last.scope = frame.scope;
                }
                return self;
            }
        }
        self.frames.push(frame);
        self
    }

    /// Convert into the wire failure shape
    pub fn to_response(&self) -> ErrorResponse {
        let mut sources = SourceCache::new();
        ErrorResponse {
            error_type: self.kind.clone(),
            error_message: self.message.clone(),
            stack_trace: self.frames().map(|f| f.render(&mut sources)).collect(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    #[track_caller]
    fn from(err: E) -> Self {
        Self::at(kind_name::<E>(), err.to_string(), Frame::caller())
    }
}

/// Short type name of `E`, without module path or generic arguments
pub fn kind_name<E: ?Sized>() -> String {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Function name from the type name of an item nested inside it
#[doc(hidden)]
pub fn scope_name(nested_item: &str) -> String {
    let mut path = nested_item.rsplit_once("::").map_or(nested_item, |(p, _)| p);
    while let Some(parent) = path.strip_suffix("::{{closure}}") {
        path = parent;
    }
    path.rsplit("::").next().unwrap_or(path).to_string()
}

/// Failure document written on the error channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Vec<String>,
}

impl ErrorResponse {
    /// Failure with no stack trace
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: Vec::new(),
        }
    }
}

impl From<HandlerError> for ErrorResponse {
    fn from(err: HandlerError) -> Self {
        err.to_response()
    }
}

/// A [`Frame`] for the current source location and enclosing function
#[macro_export]
macro_rules! frame {
    () => {
        $crate::failure::Frame::new(file!(), line!(), $crate::__scope_name!())
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __scope_name {
    () => {{
        fn __here() {}
        fn __type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        $crate::failure::scope_name(__type_name_of(__here))
    }};
}

/// Return a [`HandlerError`] of the given kind from the current function
///
/// ```ignore
/// raise!("KeyError", "no user with id {}", id);
/// ```
#[macro_export]
macro_rules! raise {
    ($kind:expr, $($arg:tt)+) => {
        return ::std::result::Result::Err($crate::failure::HandlerError::at(
            $kind,
            format!($($arg)+),
            $crate::frame!(),
        ))
    };
}

/// Unwrap a `Result`, or return its error with the current frame recorded
#[macro_export]
macro_rules! traced {
    ($expr:expr) => {
        match $expr {
            ::std::result::Result::Ok(value) => value,
            ::std::result::Result::Err(err) => {
                return ::std::result::Result::Err(
                    $crate::failure::HandlerError::from(err).within($crate::frame!()),
                )
            }
        }
    };
}
