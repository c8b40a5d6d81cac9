//! Description of one profiling run

use crate::{
    grammar::{DiagnosticGrammar, GrammarKind},
    process::CommandLine,
};
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Default stack reservation of the pipeline worker thread
pub const DEFAULT_STACK_RESERVE: usize = 16 * 1024 * 1024;

/// Command-line syntax family of a compiler
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum CompilerFlavor {
    /// GCC-like syntax (`-E`, `-c`, `-o`), also used by clang
    #[default]
    Gcc,

    /// MSVC-like syntax (`/P`, `/Fi`, `/c`, `/Fo`), also used by clang-cl
    Msvc,
}
//
impl CompilerFlavor {
    /// Arguments that preprocess `source` as C++ into `output`
    pub fn preprocess_args(self, source: &Path, output: &Path) -> Vec<OsString> {
        match self {
            Self::Gcc => vec![
                "-x".into(),
                "c++".into(),
                "-E".into(),
                source.into(),
                "-o".into(),
                output.into(),
            ],
            Self::Msvc => vec![
                "/TP".into(),
                source.into(),
                "/P".into(),
                prefixed("/Fi", output),
            ],
        }
    }

    /// Arguments that compile `source` as C++ into `object`, without linking
    pub fn compile_args(self, source: &Path, object: &Path) -> Vec<OsString> {
        match self {
            Self::Gcc => vec![
                "-x".into(),
                "c++".into(),
                "-c".into(),
                source.into(),
                "-o".into(),
                object.into(),
            ],
            Self::Msvc => vec![
                "/c".into(),
                "/TP".into(),
                source.into(),
                prefixed("/Fo", object),
            ],
        }
    }

    /// Extension of object files
    pub fn object_extension(self) -> &'static str {
        match self {
            Self::Gcc => "o",
            Self::Msvc => "obj",
        }
    }

    /// Diagnostic grammar of compilers using this syntax, unless told
    /// otherwise
    pub fn default_grammar(self) -> GrammarKind {
        match self {
            Self::Gcc => GrammarKind::Gcc,
            Self::Msvc => GrammarKind::Msvc,
        }
    }
}

/// Glue a path to an MSVC-style option
fn prefixed(option: &str, path: &Path) -> OsString {
    let mut result = OsString::from(option);
    result.push(path);
    result
}

/// Everything needed to profile one compilation unit
///
/// A request is immutable once a run has started.
///
#[derive(Debug)]
pub struct PipelineRequest {
    /// Source file to be profiled
    source: PathBuf,

    /// Compiler executable, possibly followed by leading arguments
    invocation: String,

    /// Syntax of the compiler's command line
    flavor: CompilerFlavor,

    /// Extra arguments for the preprocessing run
    preprocess_args: String,

    /// Extra arguments for the profiling compile
    compile_args: String,

    /// Working directory of the compiler
    working_dir: PathBuf,

    /// Where intermediate artifacts are stored
    intermediate_dir: PathBuf,

    /// Stack reservation of the pipeline worker thread in bytes
    stack_reserve: usize,

    /// Recognizer for instantiation diagnostics
    grammar: Box<dyn DiagnosticGrammar>,
}
//
impl PipelineRequest {
    /// Prepare to profile `source` with a compiler invoked as `invocation`
    ///
    /// The invocation is split according to POSIX shell rules, its first word
    /// is the compiler executable. By default the compiler uses a GCC-like
    /// syntax and runs in the current directory, artifacts go to the system's
    /// temporary directory, and no extra argument is passed.
    ///
    pub fn new(source: impl Into<PathBuf>, invocation: impl Into<String>) -> Self {
        let flavor = CompilerFlavor::default();
        Self {
            source: source.into(),
            invocation: invocation.into(),
            flavor,
            preprocess_args: String::new(),
            compile_args: String::new(),
            working_dir: PathBuf::from("."),
            intermediate_dir: std::env::temp_dir(),
            stack_reserve: DEFAULT_STACK_RESERVE,
            grammar: flavor.default_grammar().grammar(),
        }
    }

    /// Use another command-line syntax
    ///
    /// This also resets the diagnostic grammar to the flavor's default.
    ///
    pub fn with_flavor(mut self, flavor: CompilerFlavor) -> Self {
        self.flavor = flavor;
        self.grammar = flavor.default_grammar().grammar();
        self
    }

    /// Pass extra arguments to the preprocessing run
    pub fn with_preprocess_args(mut self, args: impl Into<String>) -> Self {
        self.preprocess_args = args.into();
        self
    }

    /// Pass extra arguments to the profiling compile
    pub fn with_compile_args(mut self, args: impl Into<String>) -> Self {
        self.compile_args = args.into();
        self
    }

    /// Run the compiler in another directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Store intermediate artifacts in another directory
    ///
    /// Relative paths are resolved against the working directory. Each run
    /// gets its own subdirectory, which is removed at the end of the run.
    ///
    pub fn with_intermediate_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.intermediate_dir = dir.into();
        self
    }

    /// Use another stack reservation for the pipeline worker thread
    pub fn with_stack_reserve(mut self, bytes: usize) -> Self {
        self.stack_reserve = bytes;
        self
    }

    /// Recognize instantiation diagnostics with another grammar
    pub fn with_grammar(mut self, grammar: Box<dyn DiagnosticGrammar>) -> Self {
        self.grammar = grammar;
        self
    }

    /// Source file to be profiled
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Command-line syntax of the compiler
    pub fn flavor(&self) -> CompilerFlavor {
        self.flavor
    }

    /// Working directory of the compiler
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Stack reservation of the pipeline worker thread in bytes
    pub fn stack_reserve(&self) -> usize {
        self.stack_reserve
    }

    /// Recognizer for instantiation diagnostics
    pub(crate) fn grammar_mut(&mut self) -> &mut dyn DiagnosticGrammar {
        &mut *self.grammar
    }

    /// Absolute location of the intermediate directory
    pub fn intermediate_dir(&self) -> io::Result<PathBuf> {
        let mut result = std::env::current_dir()?;
        result.push(&self.working_dir);
        result.push(&self.intermediate_dir);
        Ok(result)
    }

    /// Locations of the intermediate artifacts of this run, within `dir`
    pub fn artifact_paths(&self, dir: &Path) -> ArtifactPaths {
        let stem = self
            .source
            .file_stem()
            .map_or_else(|| OsString::from("unit"), |stem| stem.to_owned());
        let path = |extension: &str| {
            let mut name = stem.clone();
            name.push(extension);
            dir.join(name)
        };
        ArtifactPaths {
            preprocessed: path(".instrumented"),
            instrumented: path(".instrumented.cpp"),
            object: path(&format!(".instrumented.{}", self.flavor.object_extension())),
            profile: path(".template.profile"),
        }
    }

    /// Command line that preprocesses the source into `output`
    pub fn preprocess_command(&self, output: &Path) -> Result<CommandLine, CommandError> {
        self.command(
            self.flavor.preprocess_args(&self.source, output),
            &self.preprocess_args,
            "preprocessing arguments",
        )
    }

    /// Command line that compiles `instrumented` into `object`
    pub fn compile_command(
        &self,
        instrumented: &Path,
        object: &Path,
    ) -> Result<CommandLine, CommandError> {
        self.command(
            self.flavor.compile_args(instrumented, object),
            &self.compile_args,
            "compilation arguments",
        )
    }

    /// Assemble invocation prefix, mode arguments and user arguments
    fn command(
        &self,
        mode_args: Vec<OsString>,
        user_args: &str,
        what: &'static str,
    ) -> Result<CommandLine, CommandError> {
        let mut invocation = split(&self.invocation, "compiler invocation")?.into_iter();
        let Some(program) = invocation.next() else {
            return Err(CommandError::NoProgram);
        };
        let mut command = CommandLine::new(program);
        command
            .args(invocation)
            .args(mode_args)
            .args(split(user_args, what)?);
        Ok(command)
    }
}

/// Split a string according to POSIX shell rules
fn split(text: &str, what: &'static str) -> Result<Vec<String>, CommandError> {
    shlex::split(text).ok_or_else(|| CommandError::BadQuoting {
        what,
        text: text.into(),
    })
}

/// Locations of the intermediate artifacts of a run
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactPaths {
    /// Raw preprocessor output
    pub preprocessed: PathBuf,

    /// Instrumented translation unit
    pub instrumented: PathBuf,

    /// Object file of the profiling compile
    pub object: PathBuf,

    /// Captured output of the profiling compile
    pub profile: PathBuf,
}

/// Failure to build a compiler command line
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// The compiler invocation does not name a program
    #[error("compiler invocation is empty")]
    NoProgram,

    /// Some string could not be split into arguments
    #[error("failed to split {what} with shell quoting rules ({text:?})")]
    BadQuoting {
        /// What was being split
        what: &'static str,

        /// Offending text
        text: Box<str>,
    },
}
