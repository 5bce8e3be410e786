// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host tool execution.
//!
//! Every backend tool invocation goes through the [`Runner`] trait so
//! drivers can be exercised against a recording fake. Errors embed the
//! captured stderr, which is the only useful diagnostic most storage
//! tools produce.

use std::io::{Read, Write};
use std::process::{Command, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program:?} exited with status {code}: {stderr}")]
    Failed { program: String, code: i32, stdout: String, stderr: String },

    #[error("i/o error while running {program:?}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Executes host tools on behalf of a storage driver.
pub trait Runner: Send + Sync {
    /// Runs a program to completion, returning its captured stdout.
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CmdError>;

    /// Runs a program with its stdin fed from `stdin` and stdout drained
    /// into `stdout`, for tools that stream volume data.
    fn run_streams(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&mut (dyn Read + Send)>,
        stdout: Option<&mut dyn Write>,
    ) -> Result<(), CmdError>;
}

/// [`Runner`] backed by `std::process`.
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CmdError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| CmdError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(CmdError::Failed {
                program: program.to_string(),
                code: output.status.code().unwrap_or(-1),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim_end()
                    .to_string(),
            });
        }
        Ok(stdout)
    }

    fn run_streams(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&mut (dyn Read + Send)>,
        stdout: Option<&mut dyn Write>,
    ) -> Result<(), CmdError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if stdout.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| CmdError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();

        let mut copy_result: Result<(), std::io::Error> = Ok(());
        let mut stderr_buf = String::new();
        std::thread::scope(|s| {
            // Feed the child's stdin from its own thread so a tool that
            // interleaves reading and writing cannot deadlock against us.
            let feeder = match (stdin, child_stdin) {
                (Some(input), Some(mut sink)) => Some(s.spawn(move || {
                    let res = std::io::copy(input, &mut sink).map(|_| ());
                    drop(sink);
                    res
                })),
                _ => None,
            };
            let stderr_reader = child_stderr.map(|mut pipe| {
                s.spawn(move || {
                    let mut buf = String::new();
                    let _ = pipe.read_to_string(&mut buf);
                    buf
                })
            });

            if let (Some(out), Some(mut src)) = (stdout, child_stdout) {
                if let Err(e) = std::io::copy(&mut src, out) {
                    copy_result = Err(e);
                }
            }

            if let Some(handle) = feeder {
                if let Ok(Err(e)) = handle.join() {
                    if copy_result.is_ok() {
                        copy_result = Err(e);
                    }
                }
            }
            if let Some(handle) = stderr_reader {
                stderr_buf = handle.join().unwrap_or_default();
            }
        });

        let status = child.wait().map_err(|source| CmdError::Io {
            program: program.to_string(),
            source,
        })?;

        if let Err(source) = copy_result {
            return Err(CmdError::Io { program: program.to_string(), source });
        }
        if !status.success() {
            return Err(CmdError::Failed {
                program: program.to_string(),
                code: status.code().unwrap_or(-1),
                stdout: String::new(),
                stderr: stderr_buf.trim_end().to_string(),
            });
        }
        Ok(())
    }
}

/// Reports whether `name` resolves to a file somewhere in `PATH`. Used by
/// driver load checks to produce `ToolMissing` before any work starts.
pub fn tool_in_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}
