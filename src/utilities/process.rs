//! Thin helpers around `std::process` for the host tools we drive
//! (`ip`, `mount`, `ssh`, `ping`, ...), logging every invocation.
use crate::error::Error;
use log::{debug, log, Level};
use std::{
    ffi::OsStr,
    process::{Command, Output, Stdio},
};

/// Shell-like rendering of a command line, for logs and errors.
pub fn command_line<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    std::iter::once(program.to_owned())
        .chain(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs `program` to completion and captures its output. Failing to
/// spawn is an error; a non-zero exit status is not.
pub fn run<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<Output, Error> {
    run_logged(Level::Debug, program, args)
}

pub fn run_logged<S: AsRef<OsStr>>(level: Level, program: &str, args: &[S]) -> Result<Output, Error> {
    let line = command_line(program, args);
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::CommandFailed { command: format!("{} ({})", line, e), status: None })?;
    log!(level, "cmd[{}]: exit status {}", line, output.status);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        debug!("cmd[{}]: stderr {:?}", line, stderr.trim());
    }
    Ok(output)
}

/// Like `run`, but a non-zero exit status is an error.
pub fn run_checked<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<Output, Error> {
    let output = run(program, args)?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(Error::CommandFailed { command: command_line(program, args), status: output.status.code() })
    }
}

/// Whether `program` ran and exited successfully.
pub fn succeeds<S: AsRef<OsStr>>(program: &str, args: &[S]) -> bool {
    run(program, args).map(|o| o.status.success()).unwrap_or(false)
}
