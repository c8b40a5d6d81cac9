//! Destination of the status and report lines of a run

use std::sync::Mutex;

/// Thread-safe destination for status and report lines
///
/// This stands for whatever presents the progress of a run to the user, be it
/// a terminal, an IDE output pane or a test buffer.
///
pub trait LogSink: Send + Sync {
    /// Append a line
    fn write_line(&self, line: &str);

    /// Forget previously written lines
    fn clear(&self);

    /// Bring the sink to the user's attention
    fn activate(&self);
}

/// Sink that keeps lines in memory
#[derive(Debug, Default)]
pub struct MemorySink(Mutex<Vec<String>>);
//
impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the lines written so far
    pub fn lines(&self) -> Vec<String> {
        self.0
            .lock()
            .map_or_else(|poisoned| poisoned.into_inner().clone(), |lines| lines.clone())
    }
}
//
impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        let mut lines = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lines.push(line.to_owned());
    }

    fn clear(&self) {
        let mut lines = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lines.clear();
    }

    fn activate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn memory_sink() {
        let sink = MemorySink::new();
        sink.write_line("a");
        sink.activate();
        sink.write_line("b");
        assert_eq!(sink.lines(), ["a", "b"]);
        sink.clear();
        assert!(sink.lines().is_empty());
    }
}
