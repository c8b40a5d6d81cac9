//! Instrumentation, profiling and report stages

use crate::{
    artifact::StageArtifact,
    grammar::DiagnosticGrammar,
    process::{ProcessError, ProcessRunner, RunOutcome, Stream},
    report::Report,
    request::{CommandError, PipelineRequest},
    sink::LogSink,
};
use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::PathBuf,
};
use thiserror::Error;
use tplmarker::{InstrumentError, MarkerStats};

/// Preprocess the source into `preprocessed`, then instrument it into
/// `instrumented`
pub(super) fn instrument(
    request: &PipelineRequest,
    runner: &mut ProcessRunner,
    preprocessed: &mut StageArtifact,
    instrumented: &mut StageArtifact,
) -> Result<MarkerStats, StageError> {
    // Preprocess the source
    let command = request.preprocess_command(preprocessed.path())?;
    match runner.run(&command, request.working_dir(), None)? {
        RunOutcome::Canceled => return Err(StageError::Canceled),
        RunOutcome::Exited(status) if !status.success() => {
            log::warn!("Preprocessor exited with {status}");
        }
        RunOutcome::Exited(_) => {}
    }
    if !preprocessed.path().exists() {
        return Err(StageError::PreprocessFailure(request.source().to_owned()));
    }
    preprocessed.mark_populated();

    // Insert instantiation markers
    let stats = tplmarker::instrument_file(preprocessed.path(), instrumented.path())?;
    preprocessed.mark_consumed();
    instrumented.mark_populated();
    Ok(stats)
}

/// Compile `instrumented` into `object`, saving the compiler's output into
/// `profile`
///
/// Every output line goes to the profile in order of arrival, standard error
/// lines are also forwarded to the sink. The profile is closed before the
/// outcome of the compilation is looked at.
///
pub(super) fn profile(
    request: &PipelineRequest,
    runner: &mut ProcessRunner,
    instrumented: &mut StageArtifact,
    object: &mut StageArtifact,
    profile: &mut StageArtifact,
    sink: &dyn LogSink,
) -> Result<(), StageError> {
    // Run the compiler, capturing its output
    let command = request.compile_command(instrumented.path(), object.path())?;
    let mut writer = BufWriter::new(File::create(profile.path())?);
    profile.mark_populated();
    let mut written = Ok(());
    let mut on_line = |stream: Stream, line: &str| {
        if written.is_ok() {
            written = writeln!(writer, "{line}");
        }
        if stream == Stream::Stderr {
            sink.write_line(line);
        }
    };
    let outcome = runner.run(&command, request.working_dir(), Some(&mut on_line));

    // Close the profile
    let closed = written.and_then(|()| writer.flush());
    std::mem::drop(writer);
    instrumented.mark_consumed();
    object.mark_populated();

    // Report on compilation
    match outcome? {
        RunOutcome::Canceled => return Err(StageError::Canceled),
        RunOutcome::Exited(status) if !status.success() => {
            log::warn!("Instrumented compilation exited with {status}");
        }
        RunOutcome::Exited(_) => {}
    }
    closed?;
    Ok(())
}

/// Aggregate the instantiations recorded in `profile` and write them to the
/// sink, most expensive first
///
/// Lines that the grammar does not recognize are skipped.
///
pub(super) fn postprocess(
    profile: &mut StageArtifact,
    grammar: &mut dyn DiagnosticGrammar,
    sink: &dyn LogSink,
) -> Result<Report, StageError> {
    // Aggregate instantiations
    let reader = BufReader::new(File::open(profile.path())?);
    let mut report = Report::new();
    for line in reader.lines() {
        let line = line?;
        match grammar.parse_line(&line) {
            Some(sample) => report.record(sample),
            None => log::trace!("Skipped profile line: {line}"),
        }
    }
    profile.mark_consumed();

    // Emit the ranked report
    sink.write_line(&Report::header());
    for record in report.ranked() {
        sink.write_line(&record.to_string());
    }
    Ok(report)
}

/// Failure of a pipeline stage
#[derive(Debug, Error)]
pub enum StageError {
    /// The user asked for the run to stop
    #[error("profiling was canceled")]
    Canceled,

    /// The compiler command line could not be built
    #[error("invalid compiler command ({0})")]
    Command(#[from] CommandError),

    /// The compiler could not be run
    #[error("failed to run the compiler ({0})")]
    Process(#[from] ProcessError),

    /// The preprocessor did not produce any output
    #[error("unable to preprocess {}, please check that the file compiles and try again", .0.display())]
    PreprocessFailure(PathBuf),

    /// The preprocessed source could not be instrumented
    #[error("failed to instrument the preprocessed source ({0})")]
    Instrument(#[from] InstrumentError),

    /// Profile data or intermediate directory I/O failed
    #[error("failed to access intermediate files ({0})")]
    Io(#[from] io::Error),
}
