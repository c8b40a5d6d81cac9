//! Toy compiler that does just enough to test tplprofile functionality
//!
//! It understands GCC-like `-E`/`-c`/`-o` arguments plus two options of its
//! own: `--mock-script=<path>` points to a script of actions to be carried out
//! before producing output, and `--mock-log=<path>` to a file where each
//! invocation is logged.
//!
//! Script lines follow the `<preprocess|compile> <action> <args>` syntax and
//! only apply to the matching mode. Actions are:
//!
//! - `stdout <text>` and `stderr <text>` print a line of output.
//! - `sleep <secs>` waits for some time.
//! - `exit <code>` sets the exit code (0 by default).
//! - `no-output` skips writing the output file.
//!
//! By default, preprocessing copies the source to the output and compilation
//! writes an empty object file.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    time::Duration,
};

fn main() {
    // Parse arguments
    let mut mode = None;
    let mut source = None;
    let mut output = None;
    let mut script = None;
    let mut log = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-E" => mode = Some("preprocess"),
            "-c" => mode = Some("compile"),
            "-o" => output = Some(PathBuf::from(args.next().expect("Expected output path"))),
            "-x" => {
                args.next().expect("Expected language name");
            }
            _ => {
                if let Some(path) = arg.strip_prefix("--mock-script=") {
                    script = Some(PathBuf::from(path));
                } else if let Some(path) = arg.strip_prefix("--mock-log=") {
                    log = Some(PathBuf::from(path));
                } else if !arg.starts_with('-') && source.is_none() {
                    source = Some(PathBuf::from(arg));
                }
            }
        }
    }
    let mode = mode.expect("Expected -E or -c");
    let source = source.expect("Expected a source file");
    let output = output.expect("Expected an output file");

    // Log the invocation, along with the number of markers in compiled sources
    let contents = std::fs::read_to_string(&source).expect("Failed to read source file");
    if let Some(log) = log {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .expect("Failed to open mock log");
        if mode == "compile" {
            let markers = contents.matches("::template_profiler::enter<").count();
            writeln!(log, "compile markers={markers}").expect("Failed to write mock log");
        } else {
            writeln!(log, "{mode}").expect("Failed to write mock log");
        }
    }

    // Process script
    let mut exit_code = 0;
    let mut write_output = true;
    if let Some(script) = script {
        let script = BufReader::new(File::open(script).expect("Failed to open mock script"));
        for line in script.lines() {
            let line = line.expect("Expected mock script to be made of text lines");
            let (line_mode, action) = line
                .split_once(' ')
                .expect("Expected mock script syntax <mode> <action> <args>...");
            if line_mode != mode {
                continue;
            }
            let (action, remainder) = action.split_once(' ').unwrap_or((action, ""));
            match action {
                "stdout" => println!("{remainder}"),
                "stderr" => eprintln!("{remainder}"),
                "sleep" => std::thread::sleep(Duration::from_secs_f64(
                    remainder
                        .parse()
                        .expect("Sleep duration should be a floating-point second count"),
                )),
                "exit" => exit_code = remainder.parse().expect("Expected integer exit code"),
                "no-output" => write_output = false,
                unknown => unreachable!("Got unknown action '{unknown}' with arguments '{remainder}'"),
            }
        }
    }

    // Produce output
    if write_output {
        let output_contents = if mode == "preprocess" {
            contents.as_str()
        } else {
            ""
        };
        std::fs::write(output, output_contents).expect("Failed to write output");
    }
    std::process::exit(exit_code);
}
