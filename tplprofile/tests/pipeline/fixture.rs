use std::{
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc,
    },
    time::{Duration, Instant},
};
use tempfile::TempDir;
use tplprofile::{
    CancelFlag, DiagnosticGrammar, MemorySink, Pipeline, PipelineOutcome, PipelineRequest,
    PipelineStatus, RegexGrammar,
};

/// Test fixture for profiling runs based on the mock compiler
pub struct PipelineTest {
    /// Temporary directory, used as the compiler's working directory
    tmpdir: TempDir,

    /// Lines of the mock compiler's script
    script: Vec<String>,

    /// Compiler invocation, if not the mock compiler
    invocation: Option<String>,

    /// Diagnostic grammar
    grammar: Box<dyn DiagnosticGrammar>,

    /// Stack reservation of the worker thread
    stack_reserve: Option<usize>,

    /// Cancellation flag
    cancel: CancelFlag,

    /// Files present in the intermediate directory before the run
    stale_files: Vec<String>,
}
//
impl PipelineTest {
    /// Set up a working directory with a source file containing one template
    pub fn new() -> Self {
        let tmpdir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::write(
            tmpdir.path().join(Self::SOURCE),
            "template <class T> struct A { T x; };\nA<int> a;\n",
        )
        .expect("Failed to write source file");
        Self {
            tmpdir,
            script: Vec::new(),
            invocation: None,
            grammar: Box::new(
                RegexGrammar::new(r"^instantiate (?P<signature>.+) cost=(?P<cost>\d+)$")
                    .expect("Known-good test pattern"),
            ),
            stack_reserve: None,
            cancel: CancelFlag::new(),
            stale_files: Vec::new(),
        }
    }

    /// Add an action to the mock compiler's script
    ///
    /// Actions are described using the mini-language of the "mock" executable
    ///
    pub fn with_action(mut self, action: &str) -> Self {
        self.script.push(action.to_owned());
        self
    }

    /// Use some other compiler than the mock one
    pub fn with_invocation(mut self, invocation: &str) -> Self {
        self.invocation = Some(invocation.to_owned());
        self
    }

    /// Use another stack reservation for the worker thread
    pub fn with_stack_reserve(mut self, bytes: usize) -> Self {
        self.stack_reserve = Some(bytes);
        self
    }

    /// Put a file in the intermediate directory before the run
    pub fn with_stale_file(mut self, name: &str, contents: &str) -> Self {
        let intermediate_dir = self.tmpdir.path().join(Self::INTERMEDIATE_DIR);
        std::fs::create_dir_all(&intermediate_dir).expect("Failed to create intermediate dir");
        std::fs::write(intermediate_dir.join(name), contents).expect("Failed to write stale file");
        self.stale_files.push(name.to_owned());
        self
    }

    /// Request cancellation before the run is even started
    pub fn canceled(self) -> Self {
        self.cancel.raise();
        self
    }

    /// Start profiling
    pub fn start(self) -> RunningPipelineTest {
        // Name of the mock executable
        const MOCK_EXE: &str = env!("CARGO_BIN_EXE_mock");

        // Set up the mock compiler's script and command line
        let script_path = self.tmpdir.path().join("mock-script.txt");
        let log_path = self.tmpdir.path().join("mock-log.txt");
        std::fs::write(&script_path, self.script.join("\n")).expect("Failed to write script");
        let invocation = self.invocation.unwrap_or_else(|| {
            let quote = |path: &Path| {
                shlex::try_quote(&path.to_string_lossy())
                    .expect("Test paths should be quotable")
                    .into_owned()
            };
            format!(
                "{} --mock-script={} --mock-log={}",
                quote(Path::new(MOCK_EXE)),
                quote(&script_path),
                quote(&log_path)
            )
        });

        // Configure the run
        let intermediate_dir = self.tmpdir.path().join(Self::INTERMEDIATE_DIR);
        let mut request = PipelineRequest::new(Self::SOURCE, invocation)
            .with_working_dir(self.tmpdir.path())
            .with_intermediate_dir(&intermediate_dir)
            .with_grammar(self.grammar);
        if let Some(bytes) = self.stack_reserve {
            request = request.with_stack_reserve(bytes);
        }

        // Start the run
        let sink = Arc::new(MemorySink::new());
        let (outcome_in, outcome_out) = mpsc::channel();
        let pipeline = Pipeline::start_with(request, sink.clone(), self.cancel, move |outcome| {
            outcome_in.send(outcome).expect("Test thread has panicked")
        });
        RunningPipelineTest {
            tmpdir: self.tmpdir,
            log_path,
            intermediate_dir,
            stale_files: self.stale_files,
            sink,
            pipeline: Some(pipeline),
            outcome: outcome_out,
        }
    }

    /// Name of the source file, relative to the working directory
    pub const SOURCE: &'static str = "unit.cpp";

    /// Name of the intermediate directory, relative to the working directory
    const INTERMEDIATE_DIR: &'static str = "obj";
}

/// Profiling run under a test harness
pub struct RunningPipelineTest {
    /// Temporary directory where test files are located
    tmpdir: TempDir,

    /// Where the mock compiler logs its invocations
    log_path: PathBuf,

    /// Where intermediate artifacts go
    intermediate_dir: PathBuf,

    /// Files present in the intermediate directory before the run
    stale_files: Vec<String>,

    /// Status and report lines
    sink: Arc<MemorySink>,

    /// Ongoing run
    pipeline: Option<Pipeline>,

    /// Notification of the end of the run
    outcome: Receiver<PipelineOutcome>,
}
//
impl RunningPipelineTest {
    /// Wait for a line to show up in the sink
    pub fn wait_for_line(&self, line: &str) {
        let start = Instant::now();
        while !self.sink.lines().iter().any(|l| l == line) {
            assert!(
                start.elapsed() < Self::TIMEOUT,
                "Line {line:?} never showed up in {:#?}",
                self.sink.lines()
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Ask the run to stop
    pub fn cancel(&self) {
        self.pipeline
            .as_ref()
            .expect("Pipeline should still be around")
            .cancel();
    }

    /// Drop the pipeline handle, which cancels the run and waits for it
    pub fn drop_pipeline(&mut self) {
        std::mem::drop(
            self.pipeline
                .take()
                .expect("You can only drop the pipeline once"),
        );
    }

    /// Wait for the run to end, check that no artifact is left behind
    pub fn finish(mut self) -> FinishedPipelineTest {
        let outcome = match self.outcome.recv_timeout(Self::TIMEOUT) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => panic!("Profiling run is abnormally slow"),
            Err(RecvTimeoutError::Disconnected) => {
                panic!("Profiling run ended without reporting its outcome")
            }
        };
        if let Some(pipeline) = &self.pipeline {
            assert_eq!(pipeline.status(), outcome.status());
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.wait();
        }
        assert!(
            self.outcome.try_recv().is_err(),
            "Outcome should only be reported once"
        );
        let mut remaining = std::fs::read_dir(&self.intermediate_dir)
            .map(|entries| {
                entries
                    .map(|entry| {
                        let entry = entry.expect("Failed to list intermediate dir");
                        entry.file_name().to_string_lossy().into_owned()
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        remaining.sort();
        self.stale_files.sort();
        assert_eq!(
            remaining, self.stale_files,
            "Intermediate artifacts were left behind"
        );
        FinishedPipelineTest {
            outcome,
            lines: self.sink.lines(),
            invocations: std::fs::read_to_string(&self.log_path)
                .map(|log| log.lines().map(str::to_owned).collect())
                .unwrap_or_default(),
            intermediate_dir_exists: self.intermediate_dir.exists(),
            _tmpdir: self.tmpdir,
        }
    }

    /// Worst-case duration of a run
    const TIMEOUT: Duration = Duration::from_secs(20);
}

/// Results of a finished profiling run
pub struct FinishedPipelineTest {
    /// How the run ended
    pub outcome: PipelineOutcome,

    /// Lines written to the sink
    pub lines: Vec<String>,

    /// Invocations of the mock compiler
    pub invocations: Vec<String>,

    /// Truth that the intermediate directory was created
    pub intermediate_dir_exists: bool,

    /// Temporary directory where test files are located
    _tmpdir: TempDir,
}
//
impl FinishedPipelineTest {
    /// Check that the run was canceled
    pub fn assert_canceled(&self) {
        assert!(
            matches!(self.outcome, PipelineOutcome::Canceled),
            "Unexpected outcome {:?}",
            self.outcome
        );
        assert_eq!(self.outcome.status(), PipelineStatus::Canceled);
        assert_eq!(
            self.lines.last().map(String::as_str),
            Some("User canceled profile.")
        );
    }
}
