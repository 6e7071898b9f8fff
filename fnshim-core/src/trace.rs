//! Call chains from captured backtraces
//!
//! A [`std::backtrace::Backtrace`] only exposes its frames through its
//! `Display` output, which lists one symbol per entry, innermost first:
//!
//! ```text
//!    3: app::handlers::find_user
//!              at ./src/handlers.rs:41:9
//! ```
//!
//! [`frames_below`] reads that listing and keeps the entries between the
//! point of capture and a boundary symbol, dropping toolchain and shim
//! internals along the way.

use crate::failure::Frame;

/// Symbol prefixes that never belong to handler code
const INTERNAL_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "<std::",
    "<core::",
    "<alloc::",
    "rust_begin_unwind",
    "__rust",
    "fnshim_core::failure::HandlerError::",
    "<fnshim_core::failure::HandlerError as ",
];

/// One symbol of a backtrace listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub symbol: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Parse the `Display` output of a backtrace, innermost entry first
pub fn parse(listing: &str) -> Vec<TraceEntry> {
    let mut entries: Vec<TraceEntry> = Vec::new();
    for raw in listing.lines() {
        let text = raw.trim();
        if let Some(location) = text.strip_prefix("at ") {
            if let Some(entry) = entries.last_mut().filter(|e| e.file.is_none()) {
                if let Some((file, line)) = split_location(location) {
                    entry.file = Some(file.to_string());
                    entry.line = Some(line);
                }
            }
            continue;
        }

        let Some((index, symbol)) = text.split_once(": ") else {
            continue;
        };
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        entries.push(TraceEntry {
            symbol: symbol.trim().to_string(),
            file: None,
            line: None,
        });
    }
    entries
}

/// `path:line` or `path:line:column`
fn split_location(location: &str) -> Option<(&str, u32)> {
    let (rest, last) = location.rsplit_once(':')?;
    let last: u32 = last.parse().ok()?;
    match rest.rsplit_once(':') {
        Some((file, line)) => match line.parse() {
            Ok(line) => Some((file, line)),
            Err(_) => Some((rest, last)),
        },
        None => Some((rest, last)),
    }
}

/// Frames of the call chain below the first entry whose symbol contains
/// `boundary`, innermost first.
///
/// Returns `None` when the boundary is not on the stack. Entries without a
/// source location, toolchain and shim frames, and symbols containing any
/// of `skip` are left out.
pub fn frames_below(listing: &str, boundary: &str, skip: &[&str]) -> Option<Vec<Frame>> {
    let entries = parse(listing);
    let end = entries.iter().position(|e| e.symbol.contains(boundary))?;

    let frames = entries[..end]
        .iter()
        .filter(|e| !is_internal(e, skip))
        .filter_map(|e| {
            let file = e.file.as_ref()?;
            Some(Frame::new(file.clone(), e.line?, symbol_scope(&e.symbol)))
        })
        .collect();
    Some(frames)
}

fn is_internal(entry: &TraceEntry, skip: &[&str]) -> bool {
    let symbol = entry.symbol.as_str();
    INTERNAL_PREFIXES.iter().any(|p| symbol.starts_with(p))
        || [" as std::", " as core::", " as alloc::"]
            .iter()
            .any(|t| symbol.contains(t))
        || skip.iter().any(|s| symbol.contains(s))
        || entry
            .file
            .as_deref()
            .is_some_and(|f| f.contains("/rustc/") || f.contains("\\rustc\\"))
}

/// Function name for a demangled symbol, with closures folded into the
/// function that defines them
pub fn symbol_scope(symbol: &str) -> String {
    let mut path = symbol;
    if let Some((head, hash)) = path.rsplit_once("::h") {
        if hash.len() == 16 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            path = head;
        }
    }
    while let Some(parent) = path.strip_suffix("::{{closure}}") {
        path = parent;
    }
    path.rsplit("::").next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
   0: std::backtrace::Backtrace::force_capture
             at /rustc/90b35a6239c3d8bdabc530a6a0816f7ff89a0aaf/library/std/src/backtrace.rs:312:9
   1: app::runtime::panic_hook::{{closure}}
             at ./app/src/runtime.rs:140:30
   2: core::panicking::panic_bounds_check
             at /rustc/90b35a6239c3d8bdabc530a6a0816f7ff89a0aaf/library/core/src/panicking.rs:208:5
   3: app::handlers::store::find_user
             at ./app/src/handlers.rs:41:9
   4: <unknown>
   5: app::handlers::get_user::{{closure}}
             at ./app/src/handlers.rs:12:20
   6: <F as app::runtime::Handler>::call
             at ./app/src/runtime.rs:30:9
   7: app::runtime::call_boundary::{{closure}}
             at ./app/src/runtime.rs:151:57
   8: std::panicking::try::do_call
             at /rustc/90b35a6239c3d8bdabc530a6a0816f7ff89a0aaf/library/std/src/panicking.rs:554:40
   9: main
";

    #[test]
    fn test_parse_listing() {
        let entries = parse(LISTING);
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[3].symbol, "app::handlers::store::find_user");
        assert_eq!(entries[3].file.as_deref(), Some("./app/src/handlers.rs"));
        assert_eq!(entries[3].line, Some(41));
        assert_eq!(entries[4].file, None);
        assert_eq!(entries[9].symbol, "main");
    }

    #[test]
    fn test_frames_below_boundary() {
        let frames = frames_below(
            LISTING,
            "app::runtime::call_boundary",
            &["panic_hook", "Handler>::call"],
        )
        .unwrap();

        assert_eq!(
            frames,
            vec![
                Frame::new("./app/src/handlers.rs", 41, "find_user"),
                Frame::new("./app/src/handlers.rs", 12, "get_user"),
            ]
        );
    }

    #[test]
    fn test_no_boundary_on_stack() {
        assert_eq!(frames_below(LISTING, "app::elsewhere", &[]), None);
    }

    #[test]
    fn test_location_without_column() {
        assert_eq!(split_location("src/lib.rs:7"), Some(("src/lib.rs", 7)));
        assert_eq!(split_location("C:\\app\\lib.rs:7:3"), Some(("C:\\app\\lib.rs", 7)));
        assert_eq!(split_location("src/lib.rs"), None);
    }

    #[test]
    fn test_symbol_scope() {
        assert_eq!(symbol_scope("app::handlers::get_user"), "get_user");
        assert_eq!(symbol_scope("app::handlers::get_user::{{closure}}"), "get_user");
        assert_eq!(symbol_scope("app::handlers::get_user::h0123456789abcdef"), "get_user");
        assert_eq!(symbol_scope("<app::Users as app::Lookup>::find"), "find");
    }
}
