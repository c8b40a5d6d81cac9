//! Template instantiation markers for preprocessed C++
//!
//! This crate rewrites a preprocessed C++ translation unit so that compiling it
//! makes the compiler emit one diagnostic for every instantiation of every
//! template body it contains. The program's semantics are unchanged and its
//! line structure is preserved, so other diagnostics keep pointing to the
//! right place.

#![deny(missing_docs)]

mod instrument;
pub mod lexer;

pub use instrument::{instrument, Instrumented, MarkerStats, MARKER_NAMESPACE, PRELUDE};

use std::{
    borrow::Cow,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Instrument a preprocessed translation unit on disk
///
/// Invalid UTF-8 in the input is replaced with U+FFFD, with a warning, since
/// it can only appear in comments and literals which are passed through.
///
pub fn instrument_file(input: &Path, output: &Path) -> Result<MarkerStats, InstrumentError> {
    let bytes = fs::read(input).map_err(|source| InstrumentError::Read {
        path: input.to_owned(),
        source,
    })?;
    let source = String::from_utf8_lossy(&bytes);
    if matches!(source, Cow::Owned(_)) {
        log::warn!(
            "Replaced invalid UTF-8 in {} while instrumenting it",
            input.display()
        );
    }

    let Instrumented { text, stats } = instrument(&source);
    log::debug!(
        "Inserted {} markers into {} ({stats:?})",
        stats.markers(),
        output.display()
    );
    fs::write(output, text).map_err(|source| InstrumentError::Write {
        path: output.to_owned(),
        source,
    })?;
    Ok(stats)
}

/// Things that can go wrong while instrumenting a file
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// Failed to read the preprocessed input
    #[error("failed to read preprocessed source {} ({source})", path.display())]
    Read {
        /// Preprocessed source
        path: PathBuf,

        /// Underlying I/O error
        source: io::Error,
    },

    /// Failed to write the instrumented output
    #[error("failed to write instrumented source {} ({source})", path.display())]
    Write {
        /// Instrumented output
        path: PathBuf,

        /// Underlying I/O error
        source: io::Error,
    },
}
