//! # Error taxonomy and markers
//!
//! Unified error handling for the dfm engine.
//!
//! Two layers cooperate here:
//!
//! - [`DfmError`] - typed engine errors (parse failures, unresolved names,
//!   cycles, subprocess failures). Evaluator and builder code returns
//!   `Result<T, DfmError>`; nothing in the engine unwinds via panic.
//! - [`Marker`] - diagnostics with severity and source location. Errors are
//!   converted to markers at the nearest collection boundary (parameter
//!   resolution, builder, runner) so a single bad task does not abort an
//!   otherwise healthy build.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// SOURCE LOCATIONS
// ============================================================================

/// Location of a definition or error within a package source file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcLoc {
    pub path: PathBuf,
    pub line: u32,
    pub pos: u32,
}

impl SrcLoc {
    pub fn new(path: impl Into<PathBuf>, line: u32, pos: u32) -> Self {
        Self {
            path: path.into(),
            line,
            pos,
        }
    }
}

impl fmt::Display for SrcLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.path.display(), self.line, self.pos)
    }
}

// ============================================================================
// ENGINE ERRORS
// ============================================================================

/// Top-level error type for the dfm engine
#[derive(Error, Debug)]
pub enum DfmError {
    /// YAML parse failure or grammar failure in expressions
    #[error("syntax error: {msg}")]
    Syntax { msg: String, loc: Option<SrcLoc> },

    /// Shape violation (missing name, conflicting fields, bad enum value)
    #[error("schema error: {msg}")]
    Schema { msg: String, loc: Option<SrcLoc> },

    /// Unresolved task, type, package, filter, or variable
    #[error("name not found: '{name}'{}", format_suggestions(.suggestions))]
    NameNotFound {
        name: String,
        suggestions: Vec<String>,
        loc: Option<SrcLoc>,
    },

    /// Cycle detected in `uses` (builder) or `needs` (runner)
    #[error("cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// Two tasks/types/filters with the same qualified name
    #[error("duplicate definition: '{name}'")]
    DuplicateDefinition { name: String, loc: Option<SrcLoc> },

    /// Reference to a `local` filter from another package, or a `root`
    /// filter from a non-root package
    #[error("'{name}' is not visible from package '{pkg}'")]
    VisibilityViolation { name: String, pkg: String },

    /// Non-zero exit from the shell() builtin or a script filter
    #[error("shell command failed (status {status}): {cmd}\n{output}")]
    ShellFailed {
        cmd: String,
        status: i32,
        output: String,
    },

    /// Jobserver acquire or filter-script timeout
    #[error("timeout: {0}")]
    Timeout(String),

    /// Rundir creation, log write, FIFO create/open
    #[error("io error: {what}: {source}")]
    Io {
        what: String,
        #[source]
        source: std::io::Error,
    },

    /// Task body returned a non-zero status
    #[error("task '{task}' failed with status {status}")]
    TaskFailed { task: String, status: i32 },
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

impl DfmError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        DfmError::Syntax {
            msg: msg.into(),
            loc: None,
        }
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        DfmError::Schema {
            msg: msg.into(),
            loc: None,
        }
    }

    pub fn name_not_found(name: impl Into<String>) -> Self {
        DfmError::NameNotFound {
            name: name.into(),
            suggestions: Vec::new(),
            loc: None,
        }
    }

    /// NameNotFound with "did you mean" suggestions drawn from `candidates`
    pub fn name_not_found_in<'a>(
        name: impl Into<String>,
        candidates: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let name = name.into();
        let suggestions = suggest(&name, candidates);
        DfmError::NameNotFound {
            name,
            suggestions,
            loc: None,
        }
    }

    pub fn io(what: impl Into<String>, source: std::io::Error) -> Self {
        DfmError::Io {
            what: what.into(),
            source,
        }
    }

    /// Attach a source location, where the variant carries one
    pub fn at(mut self, at: SrcLoc) -> Self {
        match &mut self {
            DfmError::Syntax { loc, .. }
            | DfmError::Schema { loc, .. }
            | DfmError::NameNotFound { loc, .. }
            | DfmError::DuplicateDefinition { loc, .. } => *loc = Some(at),
            _ => {}
        }
        self
    }

    pub fn loc(&self) -> Option<&SrcLoc> {
        match self {
            DfmError::Syntax { loc, .. }
            | DfmError::Schema { loc, .. }
            | DfmError::NameNotFound { loc, .. }
            | DfmError::DuplicateDefinition { loc, .. } => loc.as_ref(),
            _ => None,
        }
    }

    /// Convert into an error marker, preserving location if present
    pub fn to_marker(&self) -> Marker {
        Marker {
            msg: self.to_string(),
            severity: Severity::Error,
            loc: self.loc().cloned(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DfmError>;

// ============================================================================
// SUGGESTIONS
// ============================================================================

/// Edit-distance suggestions against the symbol table, closest first.
/// Only candidates within distance 3 (and at most 3 of them) are returned.
pub fn suggest<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut scored: Vec<(usize, &str)> = candidates
        .into_iter()
        .filter_map(|c| {
            let d = edit_distance(name, c);
            (d <= 3 && d > 0).then_some((d, c))
        })
        .collect();
    scored.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(b.1)));
    scored.truncate(3);
    scored.into_iter().map(|(_, c)| c.to_string()).collect()
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

// ============================================================================
// MARKERS
// ============================================================================

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// A diagnostic attached to a task or build step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub msg: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<SrcLoc>,
}

impl Marker {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            severity: Severity::Error,
            loc: None,
        }
    }

    pub fn warning(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            severity: Severity::Warning,
            loc: None,
        }
    }

    pub fn info(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            severity: Severity::Info,
            loc: None,
        }
    }

    pub fn at(mut self, loc: SrcLoc) -> Self {
        self.loc = Some(loc);
        self
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.loc {
            Some(loc) => write!(f, "{}: {}: {}", loc, self.severity, self.msg),
            None => write!(f, "{}: {}", self.severity, self.msg),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggest_close_names() {
        let candidates = ["compile", "link", "simulate"];
        let s = suggest("compil", candidates);
        assert_eq!(s, vec!["compile"]);
    }

    #[test]
    fn test_suggest_no_match_far_names() {
        let s = suggest("zzzzzz", ["compile", "link"]);
        assert!(s.is_empty());
    }

    #[test]
    fn test_suggest_orders_by_distance() {
        let s = suggest("lint", ["link", "lints", "compile"]);
        assert_eq!(s[0], "link");
    }

    #[test]
    fn test_error_location_attach() {
        let err = DfmError::schema("task lacks a name").at(SrcLoc::new("flow.yaml", 10, 3));
        assert_eq!(err.loc().unwrap().line, 10);
        let marker = err.to_marker();
        assert_eq!(marker.severity, Severity::Error);
        assert!(marker.loc.is_some());
    }

    #[test]
    fn test_name_not_found_message() {
        let err = DfmError::name_not_found_in("comple", ["compile", "link"]);
        let msg = err.to_string();
        assert!(msg.contains("comple"));
        assert!(msg.contains("compile"));
    }

    #[test]
    fn test_marker_display_with_loc() {
        let m = Marker::warning("unused parameter").at(SrcLoc::new("flow.yaml", 4, 2));
        assert_eq!(m.to_string(), "flow.yaml:4:2: warning: unused parameter");
    }
}
