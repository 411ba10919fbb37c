use std::path::PathBuf;

use clap::Parser;

/// Standalone macro preprocessor: expands a source file and writes the
/// directive-free result.
#[derive(Debug, Parser)]
#[command(name = "mantra", version, about)]
pub struct Args {
    /// Input source file.
    pub input: PathBuf,

    /// Write output here instead of stdout.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Pre-define a single-line macro (NAME or NAME=VALUE). Repeatable.
    #[arg(short = 'D', long = "define", value_name = "NAME[=VALUE]")]
    pub define: Vec<String>,

    /// Pre-undefine a single-line macro. Repeatable.
    #[arg(short = 'U', long = "undefine", value_name = "NAME")]
    pub undefine: Vec<String>,

    /// Include a file before the input. Repeatable.
    #[arg(short = 'p', long = "pre-include", value_name = "FILE")]
    pub pre_include: Vec<String>,

    /// Add a directory to the %include search path. Repeatable.
    #[arg(short = 'I', long = "include-path", value_name = "DIR")]
    pub include_path: Vec<PathBuf>,

    /// Dependency mode: discard output, print %include targets.
    #[arg(short = 'M', long = "deps")]
    pub deps: bool,
}
