//! Output framing
//!
//! Results share stdout with whatever the handler prints, so every
//! structured document is prefixed with a marker. A supervisor reading the
//! streams splits each line at the first marker: text before it is handler
//! log output, the rest is JSON.
//!
//! | marker           | stream | payload                         |
//! |------------------|--------|---------------------------------|
//! | `__|watch|__`    | stdout | array of module identifiers     |
//! | `__|response|__` | stdout | handler return value            |
//! | `__|error|__`    | stderr | `errorType`, `errorMessage`, `stackTrace` |

use fnshim_core::ErrorResponse;
use parking_lot::Mutex;
use serde_json::Value;
use std::io::{self, Write};
use std::sync::Arc;

pub const WATCH_MARKER: &str = "__|watch|__";
pub const RESPONSE_MARKER: &str = "__|response|__";
pub const ERROR_MARKER: &str = "__|error|__";

/// A shared, flushed-on-every-write output stream
#[derive(Clone)]
pub struct OutputChannel {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputChannel {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Write `marker` + `json` as one newline-terminated line and flush
    pub fn write_frame(&self, marker: &str, json: &str) -> io::Result<()> {
        let mut writer = self.inner.lock();
        writeln!(writer, "{marker}{json}")?;
        writer.flush()
    }

    /// Write unframed text, newline-terminated, and flush
    pub fn write_text(&self, text: &str) -> io::Result<()> {
        let mut writer = self.inner.lock();
        writer.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        writer.flush()
    }
}

impl std::fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputChannel").finish_non_exhaustive()
    }
}

/// In-memory writer whose contents can be read back
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The success and failure channels
#[derive(Debug, Clone)]
pub struct Channels {
    pub stdout: OutputChannel,
    pub stderr: OutputChannel,
}

impl Channels {
    pub fn new(stdout: OutputChannel, stderr: OutputChannel) -> Self {
        Self { stdout, stderr }
    }

    /// The process's standard output and standard error
    pub fn stdio() -> Self {
        Self::new(OutputChannel::stdout(), OutputChannel::stderr())
    }

    /// Channels backed by in-memory buffers, returned with the buffers
    pub fn capture() -> (Self, Capture, Capture) {
        let stdout = Capture::default();
        let stderr = Capture::default();
        let channels = Self::new(
            OutputChannel::new(stdout.clone()),
            OutputChannel::new(stderr.clone()),
        );
        (channels, stdout, stderr)
    }

    pub fn write_watch(&self, modules: &[String]) -> io::Result<()> {
        let json = serde_json::to_string(modules).map_err(io::Error::other)?;
        self.stdout.write_frame(WATCH_MARKER, &json)
    }

    pub fn write_response(&self, json: &str) -> io::Result<()> {
        self.stdout.write_frame(RESPONSE_MARKER, json)
    }

    pub fn write_error(&self, error: &ErrorResponse) -> io::Result<()> {
        let json = serde_json::to_string(error).map_err(io::Error::other)?;
        self.stderr.write_frame(ERROR_MARKER, &json)
    }
}

/// A structured document found on an output line
#[derive(Debug, Clone, PartialEq)]
pub enum OutputMessage {
    Watch(Vec<String>),
    Response(Value),
    Error(ErrorResponse),
}

/// One output line split into handler text and a framed message
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub log: Option<String>,
    pub message: Option<OutputMessage>,
}

/// Split an output line at its first marker and decode the framed document
pub fn parse_line(line: &str) -> serde_json::Result<ParsedLine> {
    let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
    let found = [WATCH_MARKER, RESPONSE_MARKER, ERROR_MARKER]
        .into_iter()
        .filter_map(|marker| line.find(marker).map(|at| (at, marker)))
        .min_by_key(|(at, _)| *at);

    let Some((at, marker)) = found else {
        return Ok(ParsedLine {
            log: Some(line.to_string()).filter(|l| !l.is_empty()),
            message: None,
        });
    };

    let log = Some(line[..at].to_string()).filter(|l| !l.is_empty());
    let body = &line[at + marker.len()..];
    let message = match marker {
        WATCH_MARKER => OutputMessage::Watch(serde_json::from_str(body)?),
        RESPONSE_MARKER => OutputMessage::Response(serde_json::from_str(body)?),
        _ => OutputMessage::Error(serde_json::from_str(body)?),
    };

    Ok(ParsedLine {
        log,
        message: Some(message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frames_go_to_their_channels() {
        let (channels, out, err) = Channels::capture();

        channels.write_watch(&["src.lib.db".to_string()]).unwrap();
        channels.write_response(r#"{"y":2}"#).unwrap();
        channels
            .write_error(&ErrorResponse::new("KeyError", "boom"))
            .unwrap();

        assert_eq!(
            out.contents(),
            "__|watch|__[\"src.lib.db\"]\n__|response|__{\"y\":2}\n"
        );
        assert_eq!(
            err.contents(),
            "__|error|__{\"errorType\":\"KeyError\",\"errorMessage\":\"boom\",\"stackTrace\":[]}\n"
        );
    }

    #[test]
    fn test_write_text_terminates_line() {
        let out = Capture::default();
        let channel = OutputChannel::new(out.clone());
        channel.write_text("hello").unwrap();
        channel.write_text("world\n").unwrap();
        assert_eq!(out.contents(), "hello\nworld\n");
    }

    #[test]
    fn test_parse_line_with_leading_log_text() {
        let parsed = parse_line("processing...__|response|__{\"ok\":true}\n").unwrap();
        assert_eq!(parsed.log.as_deref(), Some("processing..."));
        assert_eq!(parsed.message, Some(OutputMessage::Response(json!({"ok": true}))));
    }

    #[test]
    fn test_parse_line_error_and_watch() {
        let parsed = parse_line(
            r#"__|error|__{"errorType":"KeyError","errorMessage":"boom","stackTrace":["x"]}"#,
        )
        .unwrap();
        let Some(OutputMessage::Error(err)) = parsed.message else {
            panic!("expected error message");
        };
        assert_eq!(err.error_type, "KeyError");
        assert_eq!(err.stack_trace, vec!["x".to_string()]);

        let parsed = parse_line(r#"__|watch|__["a","b"]"#).unwrap();
        assert_eq!(
            parsed.message,
            Some(OutputMessage::Watch(vec!["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn test_parse_plain_line() {
        let parsed = parse_line("just a log line").unwrap();
        assert_eq!(parsed.log.as_deref(), Some("just a log line"));
        assert!(parsed.message.is_none());
    }
}
