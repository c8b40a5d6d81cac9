//! Asynchronous execution of profiling runs

mod run;
mod stages;

use crate::{process::CancelFlag, report::Report, request::PipelineRequest, sink::LogSink};
use std::{
    any::Any,
    io,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};
use sysinfo::System;
use thiserror::Error;

pub use self::stages::StageError;

/// Ongoing profiling run
///
/// Dropping this handle cancels the run and waits for it to stop.
///
pub struct Pipeline {
    /// Handle to the worker thread, if it could be started
    worker: Option<JoinHandle<()>>,

    /// Mechanism to tell the worker to stop
    cancel: CancelFlag,

    /// Where the run stands
    status: Arc<Mutex<PipelineStatus>>,
}
//
impl Pipeline {
    /// Start profiling
    ///
    /// Status and report lines are written to `sink`. `done` is called exactly
    /// once when the run is over, whatever the way it ends. If the worker
    /// thread cannot be set up, it is called before this function returns.
    ///
    pub fn start(
        request: PipelineRequest,
        sink: Arc<dyn LogSink>,
        done: impl FnOnce(PipelineOutcome) + Send + 'static,
    ) -> Self {
        Self::start_with(request, sink, CancelFlag::new(), done)
    }

    /// Start profiling with an externally provided cancellation flag
    pub fn start_with(
        request: PipelineRequest,
        sink: Arc<dyn LogSink>,
        cancel: CancelFlag,
        done: impl FnOnce(PipelineOutcome) + Send + 'static,
    ) -> Self {
        let status = Arc::new(Mutex::new(PipelineStatus::Running));
        let requested = request.stack_reserve();
        let done = Arc::new(Mutex::new(Some(done)));

        // Start the worker thread, if there is enough memory
        let worker = check_memory(requested).and_then(|()| {
            let status = status.clone();
            let done = done.clone();
            let cancel = cancel.clone();
            let sink = sink.clone();
            thread::Builder::new()
                .name("tplprofile".into())
                .stack_size(requested)
                .spawn(move || {
                    // The sink is user code and may panic too
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        run::run(request, &*sink, &cancel)
                    }))
                    .unwrap_or_else(|panic| PipelineOutcome::Failed(panic.into()));
                    finish(&*status, &*done, outcome);
                })
                .map_err(|source| ResourceError::ThreadSpawn { requested, source })
        });

        // Report resource exhaustion right away
        let worker = match worker {
            Ok(worker) => Some(worker),
            Err(e) => {
                log::error!("Could not start profiling ({e})");
                let error = PipelineError::ResourceExhausted(e);
                sink.clear();
                sink.write_line(&run::capitalize(&error.to_string()));
                sink.activate();
                finish(&*status, &*done, PipelineOutcome::Failed(error));
                None
            }
        };
        Self {
            worker,
            cancel,
            status,
        }
    }

    /// Ask the run to stop
    ///
    /// No new stage will begin, and the active compiler process is killed.
    ///
    pub fn cancel(&self) {
        self.cancel.raise();
    }

    /// Where the run stands
    pub fn status(&self) -> PipelineStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the run to be over without canceling it
    pub fn wait(mut self) {
        if let Some(worker) = self.worker.take() {
            std::mem::drop(worker.join());
        }
    }
}
//
impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.raise();
        if let Some(worker) = self.worker.take() {
            std::mem::drop(worker.join());
        }
    }
}

/// Record the end of a run and notify the caller
fn finish<Done: FnOnce(PipelineOutcome)>(
    status: &Mutex<PipelineStatus>,
    done: &Mutex<Option<Done>>,
    outcome: PipelineOutcome,
) {
    {
        let mut status = status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status == PipelineStatus::Running {
            *status = outcome.status();
        }
    }
    let done = done.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(done) = done {
        done(outcome);
    }
}

/// Make sure that the worker's stack reservation fits in available memory
fn check_memory(requested: usize) -> Result<(), ResourceError> {
    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();
    let requested_bytes = u64::try_from(requested).unwrap_or(u64::MAX);
    // Some platforms do not report available memory
    if available != 0 && requested_bytes > available {
        return Err(ResourceError::ExceedsAvailable {
            requested: requested_bytes,
            available,
        });
    }
    Ok(())
}

/// Where a profiling run stands
///
/// Once a run has left the `Running` state, it never changes state again.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PipelineStatus {
    /// The run is in progress
    Running,

    /// The run was stopped at the user's request
    Canceled,

    /// The run failed
    Failed,

    /// The run produced a report
    Completed,
}

/// How a profiling run ended
#[derive(Debug)]
pub enum PipelineOutcome {
    /// The run was stopped at the user's request
    Canceled,

    /// The run failed
    Failed(PipelineError),

    /// The run produced a report
    Completed(Report),
}
//
impl PipelineOutcome {
    /// Terminal status matching this outcome
    pub fn status(&self) -> PipelineStatus {
        match self {
            Self::Canceled => PipelineStatus::Canceled,
            Self::Failed(_) => PipelineStatus::Failed,
            Self::Completed(_) => PipelineStatus::Completed,
        }
    }
}

/// Reason why a profiling run failed
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The worker could not be set up
    #[error("not enough resources to start profiling ({0})")]
    ResourceExhausted(#[from] ResourceError),

    /// A stage failed
    #[error(transparent)]
    Stage(#[from] StageError),

    /// The worker panicked
    #[error("the profiling thread panicked")]
    Panicked(Box<dyn Any + Send + 'static>),
}
//
impl From<Box<dyn Any + Send + 'static>> for PipelineError {
    fn from(inner: Box<dyn Any + Send + 'static>) -> Self {
        PipelineError::Panicked(inner)
    }
}

/// Failure to set up the worker thread
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The stack reservation is larger than available memory
    #[error("stack reservation of {requested} bytes exceeds available memory of {available} bytes")]
    ExceedsAvailable {
        /// Requested stack reservation in bytes
        requested: u64,

        /// Available memory in bytes
        available: u64,
    },

    /// The operating system refused to create the thread
    #[error("failed to create a thread with {requested} bytes of stack ({source})")]
    ThreadSpawn {
        /// Requested stack reservation in bytes
        requested: usize,

        /// Underlying OS error
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::{sync::mpsc, time::Duration};

    /// Sink that panics when a run starts
    struct PanickingSink;
    //
    impl LogSink for PanickingSink {
        fn write_line(&self, _line: &str) {}

        fn clear(&self) {
            panic!("Sink failure");
        }

        fn activate(&self) {}
    }

    #[test]
    fn sink_panic() {
        let (outcome_in, outcome_out) = mpsc::channel();
        let pipeline = Pipeline::start(
            PipelineRequest::new("unit.cpp", "this-compiler-does-not-exist"),
            Arc::new(PanickingSink),
            move |outcome| outcome_in.send(outcome).unwrap(),
        );
        let outcome = outcome_out.recv_timeout(Duration::from_secs(20)).unwrap();
        assert_matches!(outcome, PipelineOutcome::Failed(PipelineError::Panicked(_)));
        assert_eq!(pipeline.status(), PipelineStatus::Failed);
        pipeline.wait();
        assert!(outcome_out.try_recv().is_err());
    }
}
