//! Profile the template instantiations of a C++ compilation unit

#![deny(missing_docs)]

use clap::{Parser, ValueEnum};
use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::{mpsc, Arc},
};
use tplprofile::{
    request::DEFAULT_STACK_RESERVE, CompilerFlavor, DiagnosticGrammar, GrammarKind, LogSink,
    Pipeline, PipelineOutcome, PipelineRequest, RegexGrammar,
};

/// Find out which template instantiations make a C++ source file slow to build
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Compiler invocation, split according to shell quoting rules
    #[clap(short = 'C', long = "compiler")]
    compiler: String,

    /// Command-line syntax of the compiler
    #[clap(short, long, value_enum, default_value_t = Flavor::Gcc)]
    flavor: Flavor,

    /// Syntax of the compiler's instantiation diagnostics (default: from flavor)
    #[clap(short, long, value_enum)]
    grammar: Option<Grammar>,

    /// Custom diagnostic grammar, a regex with `signature` and optional `cost`
    /// named groups
    #[clap(long, conflicts_with = "grammar")]
    grammar_regex: Option<String>,

    /// Extra arguments for the preprocessing run
    #[clap(short, long, default_value = "", allow_hyphen_values = true)]
    preprocess_args: String,

    /// Extra arguments for the profiling compile
    #[clap(short = 'a', long, default_value = "", allow_hyphen_values = true)]
    compile_args: String,

    /// Working directory of the compiler (default: current directory)
    #[clap(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Where intermediate files go (default: system temporary directory)
    #[clap(short, long)]
    intermediate_dir: Option<PathBuf>,

    /// Stack reservation of the profiling thread in bytes
    #[clap(short, long, default_value_t = DEFAULT_STACK_RESERVE)]
    stack_reserve: usize,

    /// Save the ranked report to a CSV file
    #[clap(long)]
    csv: Option<PathBuf>,

    /// C++ source file to be profiled
    source: PathBuf,
}

/// Command-line syntax of the compiler
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Flavor {
    Gcc,
    Msvc,
}
//
impl From<Flavor> for CompilerFlavor {
    fn from(flavor: Flavor) -> Self {
        match flavor {
            Flavor::Gcc => CompilerFlavor::Gcc,
            Flavor::Msvc => CompilerFlavor::Msvc,
        }
    }
}

/// Built-in diagnostic grammar
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Grammar {
    Gcc,
    Clang,
    Msvc,
}
//
impl From<Grammar> for GrammarKind {
    fn from(grammar: Grammar) -> Self {
        match grammar {
            Grammar::Gcc => GrammarKind::Gcc,
            Grammar::Clang => GrammarKind::Clang,
            Grammar::Msvc => GrammarKind::Msvc,
        }
    }
}

/// Sink that prints lines to stdout
struct StdoutSink;
//
impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}") {
            log::warn!("Failed to print a status line ({e})");
        }
    }

    fn clear(&self) {}

    fn activate(&self) {}
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    // Pick the diagnostic grammar
    let grammar: Option<Box<dyn DiagnosticGrammar>> = match (&args.grammar_regex, args.grammar) {
        (Some(pattern), _) => match RegexGrammar::new(pattern) {
            Ok(grammar) => Some(Box::new(grammar)),
            Err(e) => {
                eprintln!("Invalid custom grammar ({e})");
                return ExitCode::FAILURE;
            }
        },
        (None, Some(kind)) => Some(GrammarKind::from(kind).grammar()),
        (None, None) => None,
    };

    // Relative paths are relative to the current directory, not to the
    // compiler's working directory
    let current_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to query the current directory ({e})");
            return ExitCode::FAILURE;
        }
    };

    // Describe the run
    let mut request = PipelineRequest::new(&args.source, args.compiler)
        .with_flavor(args.flavor.into())
        .with_preprocess_args(args.preprocess_args)
        .with_compile_args(args.compile_args)
        .with_stack_reserve(args.stack_reserve);
    if let Some(grammar) = grammar {
        request = request.with_grammar(grammar);
    }
    if let Some(dir) = &args.directory {
        request = request.with_working_dir(current_dir.join(dir));
    }
    if let Some(dir) = &args.intermediate_dir {
        request = request.with_intermediate_dir(current_dir.join(dir));
    }
    log::debug!("Profiling with {request:#?}");

    // Run the pipeline and wait for it to be done
    let (outcome_in, outcome_out) = mpsc::channel();
    let pipeline = Pipeline::start(request, Arc::new(StdoutSink), move |outcome| {
        std::mem::drop(outcome_in.send(outcome));
    });
    let outcome = outcome_out.recv();
    pipeline.wait();

    // Export the report and pick the exit code
    match outcome {
        Ok(PipelineOutcome::Completed(report)) => {
            if let Some(path) = &args.csv {
                if let Err(e) = report.write_csv(path) {
                    eprintln!("Failed to save report to {} ({e})", path.display());
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Ok(PipelineOutcome::Canceled) => ExitCode::from(130),
        Ok(PipelineOutcome::Failed(_)) => ExitCode::FAILURE,
        Err(mpsc::RecvError) => {
            log::error!("Profiling ended without reporting an outcome");
            ExitCode::FAILURE
        }
    }
}
