//! Check that instrumented standard library headers still compile
//!
//! These tests need a GCC-compatible `c++` in PATH and are skipped otherwise.

use std::{
    path::Path,
    process::{Command, Output, Stdio},
};
use tempfile::TempDir;

/// Run the system C++ compiler in `dir`, if there is one
fn cxx(dir: &Path, args: &[&str]) -> Option<Output> {
    Command::new("c++")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .ok()
}

/// Preprocess, instrument and compile a snippet, returning the compiler's
/// diagnostics
fn instrument_and_compile(source: &str) -> Option<String> {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("unit.cpp"), source).unwrap();
    let preprocessed = cxx(dir.path(), &["-x", "c++", "-E", "unit.cpp", "-o", "unit.ii"])?;
    if !preprocessed.status.success() {
        eprintln!(
            "Skipping test, c++ failed to preprocess:\n{}",
            String::from_utf8_lossy(&preprocessed.stderr)
        );
        return None;
    }
    tplmarker::instrument_file(
        &dir.path().join("unit.ii"),
        &dir.path().join("unit.instrumented.cpp"),
    )
    .unwrap();
    let compiled = cxx(
        dir.path(),
        &["-x", "c++", "-c", "unit.instrumented.cpp", "-o", "unit.o"],
    )
    .unwrap();
    let diagnostics = String::from_utf8_lossy(&compiled.stderr).into_owned();
    assert!(compiled.status.success(), "Compilation failed:\n{diagnostics}");
    Some(diagnostics)
}

#[test]
fn vector() {
    let Some(diagnostics) = instrument_and_compile(
        "#include <vector>\n\
         int main() { std::vector<int> v; v.push_back(42); return v[0]; }\n",
    ) else {
        return;
    };
    assert!(!diagnostics.contains(": error:"), "{diagnostics}");
}

#[test]
fn sfinae_parameters() {
    let Some(diagnostics) = instrument_and_compile(
        "#include <cstddef>\n\
         #include <type_traits>\n\
         template <class T, typename std::enable_if<std::is_integral<T>::value, bool>::type = true, \
                   std::size_t = 0>\n\
         T twice(T t) { return t * 2; }\n\
         int main() { return twice(21) - 42; }\n",
    ) else {
        return;
    };
    assert!(diagnostics.contains("template_profiler"), "{diagnostics}");
}
