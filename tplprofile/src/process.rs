//! Cancellable execution of compiler processes

use std::{
    ffi::{OsStr, OsString},
    fmt::{self, Display, Formatter},
    io::{self, BufRead, BufReader, Read},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};
use thiserror::Error;
use wait_timeout::ChildExt;

/// Polling interval of process monitoring
///
/// This bounds the time it takes for a cancellation request to kill the
/// active process.
///
pub(crate) const POLLING_INTERVAL: Duration = Duration::from_millis(1000 / 30);

/// Shared request to stop a pipeline
///
/// Once raised, the flag stays raised.
///
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);
//
impl CancelFlag {
    /// Create a flag that is not raised yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Truth that cancellation has been requested
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Program and arguments of an external command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandLine {
    /// Executable
    program: OsString,

    /// Arguments to the executable
    args: Vec<OsString>,
}
//
impl CommandLine {
    /// Start building a command that runs `program`
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append arguments
    pub fn args(&mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> &mut Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Executable
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments to the executable
    pub fn arguments(&self) -> impl Iterator<Item = &OsStr> {
        self.args.iter().map(OsString::as_os_str)
    }
}
//
impl Display for CommandLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (idx, word) in std::iter::once(self.program()).chain(self.arguments()).enumerate() {
            if idx > 0 {
                write!(f, " ")?;
            }
            let word = word.to_string_lossy();
            match shlex::try_quote(&word) {
                Ok(quoted) => write!(f, "{quoted}")?,
                Err(_) => write!(f, "{word:?}")?,
            }
        }
        Ok(())
    }
}

/// Standard stream of a process
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Stream {
    /// Standard output
    Stdout,

    /// Standard error
    Stderr,
}

/// Outcome of a process that was run to the end or stopped
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// Process exited on its own, with some status
    Exited(ExitStatus),

    /// Cancellation was requested, process was killed
    Canceled,
}

/// Runner of external processes, one at a time
#[derive(Debug)]
pub struct ProcessRunner {
    /// Cancellation request
    cancel: CancelFlag,

    /// Process that is currently running, if any
    active: Option<Child>,
}
//
impl ProcessRunner {
    /// Set up a runner that observes a cancellation flag
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            cancel,
            active: None,
        }
    }

    /// Run a command in `working_dir` to completion
    ///
    /// The process gets no input and no window. If `on_line` is set, the
    /// standard output and error are captured and passed to it line by line in
    /// order of arrival, with line terminators stripped. Otherwise they are
    /// discarded.
    ///
    /// If cancellation is requested before or during the run, the process
    /// tree is killed and `RunOutcome::Canceled` is returned. A non-zero exit
    /// status is not an error at this layer.
    ///
    pub fn run(
        &mut self,
        command: &CommandLine,
        working_dir: &Path,
        on_line: Option<&mut dyn FnMut(Stream, &str)>,
    ) -> Result<RunOutcome, ProcessError> {
        // Don't start anything new once canceled
        if self.cancel.is_raised() {
            return Ok(RunOutcome::Canceled);
        }

        // Start the process
        log::debug!("Running {command} in {}", working_dir.display());
        let capture = on_line.is_some();
        let output = || {
            if capture {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        let mut process = Command::new(command.program());
        process
            .args(command.arguments())
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            process.creation_flags(CREATE_NO_WINDOW);
        }
        let mut child = process.spawn().map_err(|source| ProcessError::SpawnFailed {
            program: command.program().to_string_lossy().into(),
            source,
        })?;

        // Forward output until both pipes are closed
        let (stdout, stderr) = (child.stdout.take(), child.stderr.take());
        self.active = Some(child);
        if let Some(on_line) = on_line {
            let (sender, receiver) = mpsc::channel();
            let readers = [
                stdout.map(|pipe| read_lines(pipe, Stream::Stdout, sender.clone())),
                stderr.map(|pipe| read_lines(pipe, Stream::Stderr, sender.clone())),
            ];
            std::mem::drop(sender);
            loop {
                match receiver.recv_timeout(POLLING_INTERVAL) {
                    Ok((stream, line)) => on_line(stream, &line),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if self.cancel.is_raised() {
                    // Readers are left behind, they exit once the pipes close
                    self.terminate();
                    return Ok(RunOutcome::Canceled);
                }
            }
            for reader in readers.into_iter().flatten() {
                if reader.join().is_err() {
                    log::error!("Output reader of {command} has panicked");
                }
            }
        }

        // Wait for the process to exit
        let outcome = self.wait();
        if !matches!(outcome, Ok(RunOutcome::Exited(_))) {
            self.terminate();
        }
        self.active = None;
        outcome
    }

    /// Wait for the active process to exit, watching for cancellation
    fn wait(&mut self) -> Result<RunOutcome, ProcessError> {
        let Some(child) = self.active.as_mut() else {
            return Ok(RunOutcome::Canceled);
        };
        loop {
            if self.cancel.is_raised() {
                return Ok(RunOutcome::Canceled);
            }
            match child.wait_timeout(POLLING_INTERVAL) {
                Ok(Some(status)) => return Ok(RunOutcome::Exited(status)),
                Ok(None) => continue,
                Err(e) => return Err(ProcessError::WaitFailed(e)),
            }
        }
    }

    /// Kill the active process and its descendants
    ///
    /// Does nothing if no process is running.
    ///
    pub fn terminate(&mut self) {
        let Some(mut child) = self.active.take() else {
            return;
        };
        let mut tree = ProcessTree::new(Pid::from_u32(child.id()));
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        tree.refresh(&system);
        if let Err(e) = child.kill() {
            log::debug!("Failed to kill process {} ({e})", child.id());
        }
        if !tree.kill_descendants(&system) {
            log::warn!("Some child processes of {} could not be killed", child.id());
        }
        if let Err(e) = child.wait() {
            log::warn!("Failed to await killed process {} ({e})", child.id());
        }
    }
}
//
impl Drop for ProcessRunner {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Forward the lines of a process pipe to a channel from a dedicated thread
fn read_lines(
    pipe: impl Read + Send + 'static,
    stream: Stream,
    output: Sender<(Stream, String)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut pipe = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match pipe.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(&['\n', '\r'][..]);
                    if output.send((stream, line.to_owned())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Failed to read process {stream:?} ({e})");
                    break;
                }
            }
        }
    })
}

/// Failure to run a process
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Failed to spawn process
    #[error("failed to spawn {program} ({source})")]
    SpawnFailed {
        /// Program that was run
        program: Box<str>,

        /// Underlying OS error
        source: io::Error,
    },

    /// Failed to await process
    #[error("failed to await process ({0})")]
    WaitFailed(io::Error),
}

/// Process tree rooted at a compiler driver
struct ProcessTree {
    /// Root of the tree followed by its known descendants
    tree: Vec<Pid>,

    /// Buffer to collect the current generation of parent processes
    /// Used during refresh(), empty outside of this method
    parents: Vec<Pid>,

    /// Buffer to collect the current generation of child processes
    /// Used during refresh(), empty outside of this method
    children: Vec<Pid>,
}
//
impl ProcessTree {
    /// Prepare to track the descendants of `root`
    fn new(root: Pid) -> Self {
        Self {
            tree: vec![root],
            parents: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Refresh process tree
    fn refresh(&mut self, system: &System) {
        // Seed parent list with tree root, then reset tree
        self.parents.push(self.tree[0]);
        self.tree.clear();

        // Explore the tree one generation at a time
        while !self.parents.is_empty() {
            for parent_pid in self.parents.drain(..) {
                for (&child_pid, child) in system.processes() {
                    if child.parent() == Some(parent_pid) && !self.tree.contains(&child_pid) {
                        self.children.push(child_pid);
                    }
                }
                self.tree.push(parent_pid);
            }
            std::mem::swap(&mut self.parents, &mut self.children);
        }
    }

    /// Kill every process in the tree except for the root
    fn kill_descendants(&self, system: &System) -> bool {
        let mut global_result = true;
        for process in self.tree[1..].iter().filter_map(|pid| system.process(*pid)) {
            global_result &= process
                .kill_with(Signal::Kill)
                .unwrap_or_else(|| process.kill());
        }
        global_result
    }
}
