//! Shared harness for the integration tests: run the preprocessor over
//! in-memory sources and collect output lines, diagnostics and any fatal
//! error.

use std::collections::HashMap;
use std::path::PathBuf;

use mantra::source::{IncludeResolver, LineSource, MemorySource};
use mantra::{CollectSink, Collaborators, Diagnostic, Pass, PreprocError, Preprocessor};

/// An include resolver backed by a name → contents map.
pub struct MapResolver {
    pub files: HashMap<String, String>,
}

impl IncludeResolver for MapResolver {
    fn resolve(&mut self, name: &str) -> Option<(PathBuf, Box<dyn LineSource>)> {
        let text = self.files.get(name)?;
        Some((
            PathBuf::from(name),
            Box::new(MemorySource::from(text.as_str())),
        ))
    }
}

pub struct Outcome {
    pub lines: Vec<String>,
    pub diags: Vec<Diagnostic>,
    pub fatal: Option<PreprocError>,
    pub deps: Vec<PathBuf>,
}

pub fn preprocess_with(src: &str, files: HashMap<String, String>, pass: Pass) -> Outcome {
    let sink = CollectSink::new();
    let handle = sink.handle();
    let collab = Collaborators {
        sink: Box::new(sink),
        resolver: Box::new(MapResolver { files }),
        ..Collaborators::default()
    };
    let mut preproc = Preprocessor::new(collab);
    preproc.reset(Box::new(MemorySource::from(src)), "test.asm", pass);

    let mut lines = Vec::new();
    let mut fatal = None;
    loop {
        match preproc.get_line() {
            Ok(Some(line)) => lines.push(line),
            Ok(None) => break,
            Err(err) => {
                fatal = Some(err);
                break;
            }
        }
    }
    preproc.cleanup(pass);
    let diags = handle.borrow().clone();
    let deps = preproc.dependencies().to_vec();
    Outcome {
        lines,
        diags,
        fatal,
        deps,
    }
}

pub fn preprocess(src: &str) -> Outcome {
    preprocess_with(src, HashMap::new(), Pass::First)
}

/// Run and demand a clean finish; returns the emitted lines.
pub fn expand(src: &str) -> Vec<String> {
    let out = preprocess(src);
    if let Some(fatal) = &out.fatal {
        panic!("unexpected fatal error: {fatal}");
    }
    out.lines
}
