//! Template instantiation profiling of C++ compilation units
//!
//! This crate runs the three-stage profiling pipeline: preprocessing and
//! instrumentation of a source file, compilation of the instrumented unit with
//! its diagnostics captured, and aggregation of those diagnostics into a ranked
//! report of template instantiations.

#![deny(missing_docs)]

pub mod artifact;
pub mod grammar;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod request;
pub mod sink;

pub use self::{
    grammar::{DiagnosticGrammar, GrammarKind, InstantiationSample, RegexGrammar},
    pipeline::{Pipeline, PipelineError, PipelineOutcome, PipelineStatus, StageError},
    process::CancelFlag,
    report::{InstantiationRecord, Report},
    request::{CompilerFlavor, PipelineRequest},
    sink::{LogSink, MemorySink},
};
