//! Worker thread of a profiling run

use super::{stages, PipelineError, PipelineOutcome, StageError};
use crate::{
    artifact::StageArtifact,
    process::{CancelFlag, ProcessRunner},
    report::Report,
    request::PipelineRequest,
    sink::LogSink,
};
use std::panic::AssertUnwindSafe;

/// Run all stages in order, reporting progress to the sink
pub(super) fn run(
    mut request: PipelineRequest,
    sink: &dyn LogSink,
    cancel: &CancelFlag,
) -> PipelineOutcome {
    // Prepare the sink
    sink.clear();
    sink.write_line(&format!(
        "Profiling instantiations in {}",
        request.source().display()
    ));
    sink.write_line("");
    sink.activate();

    // Run the stages, turning panics into failures
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        run_stages(&mut request, sink, cancel)
    }));
    let outcome = match result {
        Ok(Ok(report)) => PipelineOutcome::Completed(report),
        Ok(Err(StageError::Canceled)) => PipelineOutcome::Canceled,
        Ok(Err(e)) => PipelineOutcome::Failed(e.into()),
        Err(panic) => PipelineOutcome::Failed(panic.into()),
    };

    // Report how things went
    match &outcome {
        PipelineOutcome::Completed(_) => log::info!("Profiled {}", request.source().display()),
        PipelineOutcome::Canceled => {
            log::info!("Profiling of {} was canceled", request.source().display());
            sink.write_line("User canceled profile.");
        }
        PipelineOutcome::Failed(e) => {
            log::error!("Failed to profile {} ({e})", request.source().display());
            sink.write_line(&capitalize(&e.to_string()));
        }
    }
    outcome
}

/// Sequence of stages
///
/// Artifacts go to a fresh directory, so that files from other runs can
/// neither be mistaken for this run's output nor be deleted by it. Each
/// artifact is deleted as soon as the stage that needs it is over, whether it
/// succeeded or not, and the directory goes away at the end of the run.
///
fn run_stages(
    request: &mut PipelineRequest,
    sink: &dyn LogSink,
    cancel: &CancelFlag,
) -> Result<Report, StageError> {
    // Don't touch the filesystem if canceled early
    if cancel.is_raised() {
        return Err(StageError::Canceled);
    }
    let intermediate_dir = request.intermediate_dir()?;
    std::fs::create_dir_all(&intermediate_dir)?;
    let run_dir = tempfile::Builder::new()
        .prefix("tplprofile-")
        .tempdir_in(&intermediate_dir)?;
    let paths = request.artifact_paths(run_dir.path());
    let mut runner = ProcessRunner::new(cancel.clone());

    // Preprocess and instrument
    let mut instrumented = StageArtifact::new(paths.instrumented);
    {
        let mut preprocessed = StageArtifact::new(paths.preprocessed);
        sink.write_line("Instrumenting code...");
        let stats = stages::instrument(request, &mut runner, &mut preprocessed, &mut instrumented)?;
        log::info!(
            "Inserted {} instantiation markers ({} class templates, {} function templates, \
            {} member functions, {} templates left unmarked)",
            stats.markers(),
            stats.class_templates,
            stats.function_templates,
            stats.member_functions,
            stats.unmarked
        );
        sink.write_line("Instrumentation completed.");
    }
    if cancel.is_raised() {
        return Err(StageError::Canceled);
    }

    // Compile the instrumented source
    let mut profile = StageArtifact::new(paths.profile);
    {
        let mut object = StageArtifact::new(paths.object);
        sink.write_line("Running profile...");
        stages::profile(
            request,
            &mut runner,
            &mut instrumented,
            &mut object,
            &mut profile,
            sink,
        )?;
        sink.write_line("Profiling completed.");
    }
    std::mem::drop(instrumented);
    if cancel.is_raised() {
        return Err(StageError::Canceled);
    }

    // Aggregate the results
    sink.write_line("Finalizing data...");
    let report = stages::postprocess(&mut profile, request.grammar_mut(), sink)?;
    std::mem::drop(profile);
    let run_dir_path = run_dir.path().to_owned();
    if let Err(e) = run_dir.close() {
        log::warn!("Failed to remove {} ({e})", run_dir_path.display());
    }
    sink.write_line("");
    sink.write_line(&format!(
        "{} instantiations of {} distinct templates",
        report.total_instantiations(),
        report.len()
    ));
    sink.write_line("Profile run completed.");
    Ok(report)
}

/// Turn an error message into a sentence
pub(super) fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
