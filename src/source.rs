//! Input plumbing: raw line sources, logical-line assembly, include
//! resolution, and the include frame that ties a source to its pending
//! expansion lines, conditional stack and active invocations.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::cond::CondState;
use crate::frames::{ExpFrame, ExpLine};

// ============================================================================
// LINE SOURCES
// ============================================================================

/// A producer of raw physical lines, without trailing newlines.
pub trait LineSource {
    fn read_line(&mut self) -> Option<String>;
}

/// Reads lines from a file.
pub struct FileSource {
    reader: BufReader<File>,
}

impl FileSource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(FileSource {
            reader: BufReader::new(File::open(path)?),
        })
    }
}

impl LineSource for FileSource {
    fn read_line(&mut self) -> Option<String> {
        let mut buf = String::new();
        match self.reader.read_line(&mut buf) {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                while buf.ends_with('\n') || buf.ends_with('\r') {
                    buf.pop();
                }
                Some(buf)
            }
        }
    }
}

/// Feeds lines from an in-memory buffer. The embedding and test entry
/// point.
pub struct MemorySource {
    lines: std::vec::IntoIter<String>,
}

impl From<&str> for MemorySource {
    fn from(text: &str) -> Self {
        MemorySource {
            lines: text
                .lines()
                .map(str::to_string)
                .collect::<Vec<_>>()
                .into_iter(),
        }
    }
}

impl LineSource for MemorySource {
    fn read_line(&mut self) -> Option<String> {
        self.lines.next()
    }
}

// ============================================================================
// LOGICAL LINES
// ============================================================================

/// Assemble one logical line: backslash continuations joined, carriage
/// returns stripped, the tail beyond a spurious `^Z` discarded. Returns the
/// line and the number of continuations swallowed (each one advanced the
/// physical position by an extra line).
pub fn next_logical_line(src: &mut dyn LineSource) -> Option<(String, i64)> {
    let mut line = src.read_line()?;
    let mut continued = 0;
    loop {
        while line.ends_with('\r') {
            line.pop();
        }
        if !line.ends_with('\\') {
            break;
        }
        line.pop();
        match src.read_line() {
            Some(next) => {
                continued += 1;
                line.push_str(&next);
            }
            None => break,
        }
    }
    if let Some(pos) = line.find('\x1a') {
        line.truncate(pos);
    }
    Some((line, continued))
}

/// Rewrite a cpp-style line marker (`# 123 "file"`) into the native
/// `%line 123 file` directive. Lines without the marker pass through
/// untouched.
pub fn translate_cpp_marker(line: &str) -> Option<String> {
    let rest = line.strip_prefix("# ")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let mut fname =
        rest[digits.len()..].trim_start_matches(|c: char| c == ' ' || c.is_ascii_digit());
    if let Some(stripped) = fname.strip_prefix('"') {
        fname = stripped;
    }
    let fname = fname.split('"').next().unwrap_or(fname);
    Some(format!("%line {} {}", digits, fname))
}

// ============================================================================
// INCLUDE RESOLUTION
// ============================================================================

/// Collaborator that turns an `%include` file name into an open source.
pub trait IncludeResolver {
    fn resolve(&mut self, name: &str) -> Option<(PathBuf, Box<dyn LineSource>)>;
}

/// Filesystem resolver: the name as given, then each search directory in
/// order.
#[derive(Debug, Default)]
pub struct SearchPath {
    pub dirs: Vec<PathBuf>,
}

impl SearchPath {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        SearchPath { dirs }
    }
}

impl IncludeResolver for SearchPath {
    fn resolve(&mut self, name: &str) -> Option<(PathBuf, Box<dyn LineSource>)> {
        let direct = PathBuf::from(name);
        let candidates = std::iter::once(direct).chain(self.dirs.iter().map(|d| d.join(name)));
        for path in candidates {
            if let Ok(src) = FileSource::open(&path) {
                return Some((path, Box::new(src)));
            }
        }
        None
    }
}

/// Expand `%VAR%` environment references inside an include file name.
/// Unset variables warn and leave the `%…%` text intact.
pub fn expand_env_refs(name: &str, warn: &mut dyn FnMut(String)) -> String {
    let mut out = String::new();
    let mut rest = name;
    loop {
        let Some(open) = rest.find('%') else {
            out.push_str(rest);
            break;
        };
        let Some(close_rel) = rest[open + 1..].find('%') else {
            out.push_str(rest);
            break;
        };
        let close = open + 1 + close_rel;
        let var = &rest[open + 1..close];
        match std::env::var(var) {
            Ok(value) => {
                out.push_str(&rest[..open]);
                out.push_str(&value);
            }
            Err(_) => {
                warn(format!("environment variable `{}' does not exist", var));
                out.push_str(&rest[..=close]);
            }
        }
        rest = &rest[close + 1..];
    }
    out
}

// ============================================================================
// INCLUDE FRAMES
// ============================================================================

/// One level of the input/expansion stack: a real source plus the pending
/// expansion lines queued in front of it, with the conditional and
/// invocation stacks that belong to this inclusion level.
pub struct IncludeFrame {
    pub src: Box<dyn LineSource>,
    /// Pending lines, last entry next to be consumed.
    pub expansion: Vec<ExpLine>,
    pub conds: Vec<CondState>,
    /// Active macro-call / rep frames, innermost last.
    pub invocations: Vec<ExpFrame>,
    /// Line-number step per physical line read (adjusted by `%line`).
    pub lineinc: i64,
    /// Position of the *including* file, restored when this frame pops.
    pub saved_file: String,
    pub saved_line: i64,
}

impl IncludeFrame {
    pub fn new(src: Box<dyn LineSource>, saved_file: String, saved_line: i64) -> Self {
        IncludeFrame {
            src,
            expansion: Vec::new(),
            conds: Vec::new(),
            invocations: Vec::new(),
            lineinc: 1,
            saved_file,
            saved_line,
        }
    }

    /// Is the top conditional branch of this frame non-emitting?
    pub fn suppressed(&self) -> bool {
        self.conds.last().map_or(false, |c| !c.emitting())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_yields_lines() {
        let mut src = MemorySource::from("one\ntwo\n");
        assert_eq!(src.read_line().as_deref(), Some("one"));
        assert_eq!(src.read_line().as_deref(), Some("two"));
        assert_eq!(src.read_line(), None);
    }

    #[test]
    fn continuation_joins_lines() {
        let mut src = MemorySource::from("mov ax, \\\n5\nnext");
        let (line, continued) = next_logical_line(&mut src).expect("line");
        assert_eq!(line, "mov ax, 5");
        assert_eq!(continued, 1);
        let (line, continued) = next_logical_line(&mut src).expect("line");
        assert_eq!(line, "next");
        assert_eq!(continued, 0);
    }

    #[test]
    fn continuation_with_carriage_return() {
        let mut src = MemorySource::from("a\\\r\nb");
        let (line, continued) = next_logical_line(&mut src).expect("line");
        assert_eq!(line, "ab");
        assert_eq!(continued, 1);
    }

    #[test]
    fn control_z_truncates() {
        let mut src = MemorySource::from("good\x1agarbage");
        let (line, _) = next_logical_line(&mut src).expect("line");
        assert_eq!(line, "good");
    }

    #[test]
    fn cpp_marker_translation() {
        assert_eq!(
            translate_cpp_marker("# 42 \"lib.inc\"").as_deref(),
            Some("%line 42 lib.inc")
        );
        assert_eq!(translate_cpp_marker("#define X"), None);
        assert_eq!(translate_cpp_marker("mov ax, 1"), None);
    }

    #[test]
    fn env_refs_expand_or_survive() {
        std::env::set_var("MANTRA_TEST_DIR", "/opt/inc");
        let mut warnings = Vec::new();
        assert_eq!(
            expand_env_refs("%MANTRA_TEST_DIR%/io.inc", &mut |msg: String| warnings
                .push(msg)),
            "/opt/inc/io.inc"
        );
        assert!(warnings.is_empty());
        assert_eq!(
            expand_env_refs("%MANTRA_UNSET_VAR%/io.inc", &mut |msg: String| warnings
                .push(msg)),
            "%MANTRA_UNSET_VAR%/io.inc"
        );
        assert_eq!(warnings.len(), 1);
    }
}
