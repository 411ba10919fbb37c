//! Command-line front end: argument parsing, severity-colored diagnostic
//! printing, and the drive-to-completion loop around
//! `Preprocessor::get_line`.

pub mod args;

pub use args::Args;

use std::cell::Cell;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::rc::Rc;

use clap::Parser;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::ccodes::X86ConditionCodes;
use crate::diagnostics::{Diagnostic, DiagnosticSink, Severity};
use crate::driver::{Collaborators, Pass, Preprocessor};
use crate::expr::NoSymbols;
use crate::source::{FileSource, SearchPath};

/// Exit codes: 0 clean, 1 with non-fatal errors, 2 fatal, 3 internal.
pub fn run() -> i32 {
    run_with(Args::parse())
}

pub fn run_with(args: Args) -> i32 {
    let errors = Rc::new(Cell::new(0usize));
    let sink = TermSink {
        out: StandardStream::stderr(ColorChoice::Auto),
        errors: Rc::clone(&errors),
    };
    let collab = Collaborators {
        sink: Box::new(sink),
        symbols: Box::new(NoSymbols),
        resolver: Box::new(SearchPath::new(args.include_path.clone())),
        ccodes: Box::new(X86ConditionCodes),
    };
    let mut preproc = Preprocessor::new(collab);
    for def in &args.define {
        preproc.pre_define(def);
    }
    for name in &args.undefine {
        preproc.pre_undefine(name);
    }
    for file in &args.pre_include {
        preproc.pre_include(file);
    }

    let src = match FileSource::open(&args.input) {
        Ok(src) => src,
        Err(err) => {
            eprintln!("mantra: cannot open `{}': {}", args.input.display(), err);
            return 2;
        }
    };
    let pass = if args.deps {
        Pass::Dependencies
    } else {
        Pass::First
    };
    preproc.reset(Box::new(src), &args.input.display().to_string(), pass);

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => match File::create(path) {
            Ok(file) => Box::new(BufWriter::new(file)),
            Err(err) => {
                eprintln!("mantra: cannot create `{}': {}", path.display(), err);
                return 2;
            }
        },
        None => Box::new(io::stdout()),
    };

    let status = loop {
        match preproc.get_line() {
            Ok(Some(line)) => {
                if !args.deps && writeln!(out, "{}", line).is_err() {
                    break 2;
                }
            }
            Ok(None) => break 0,
            Err(err) => {
                let code = match err.severity() {
                    Severity::Panic => 3,
                    _ => 2,
                };
                let report = miette::Report::new(err);
                eprintln!("{report:?}");
                break code;
            }
        }
    };
    preproc.cleanup(pass);

    if args.deps && status == 0 {
        for dep in preproc.dependencies() {
            let _ = writeln!(out, "{}", dep.display());
        }
    }
    let _ = out.flush();
    preproc.cleanup(Pass::Final);

    if status == 0 && errors.get() > 0 {
        1
    } else {
        status
    }
}

/// Streams diagnostics to stderr with a severity-colored tag and counts
/// the ones that make the run fail.
struct TermSink {
    out: StandardStream,
    errors: Rc<Cell<usize>>,
}

impl TermSink {
    fn print(&mut self, diag: &Diagnostic) -> io::Result<()> {
        if let Some(loc) = &diag.loc {
            write!(self.out, "{}: ", loc)?;
        }
        let color = match diag.severity {
            Severity::Warning => Color::Yellow,
            Severity::NonFatal | Severity::Fatal | Severity::Panic => Color::Red,
            Severity::Debug => Color::Cyan,
        };
        self.out
            .set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
        write!(self.out, "{}:", diag.severity)?;
        self.out.reset()?;
        writeln!(self.out, " {}", diag.message)
    }
}

impl DiagnosticSink for TermSink {
    fn report(&mut self, diag: Diagnostic) {
        if diag.severity == Severity::Debug {
            return;
        }
        if diag.severity == Severity::NonFatal {
            self.errors.set(self.errors.get() + 1);
        }
        let _ = self.print(&diag);
    }
}
