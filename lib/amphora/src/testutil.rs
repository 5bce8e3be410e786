// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for unit tests.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use slog::Drain;

use crate::cmd::{CmdError, Runner};
use crate::volume::{ContentType, Volume, VolumeType};

/// Logger for tests. Set `AMPHORA_TEST_LOG` to see output.
pub(crate) fn test_logger() -> slog::Logger {
    if std::env::var_os("AMPHORA_TEST_LOG").is_some() {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog::o!())
    } else {
        slog::Logger::root(slog::Discard, slog::o!())
    }
}

/// A volume on the standing test pool, with empty configs.
pub(crate) fn test_volume(
    name: &str,
    vol_type: VolumeType,
    content_type: ContentType,
) -> Volume {
    Volume::new(
        PathBuf::from("/tmp/amphora-test-root"),
        "pool1",
        vol_type,
        content_type,
        name,
        BTreeMap::new(),
        Arc::new(BTreeMap::new()),
    )
}

enum Stub {
    Respond(String),
    Fail(String),
    Handle(Box<dyn Fn(&str) -> Result<String, CmdError> + Send>),
}

/// A [`Runner`] that records command lines instead of spawning
/// anything. Responses are matched by command-line prefix; unmatched
/// commands succeed with empty output.
#[derive(Default)]
pub(crate) struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    stubs: Mutex<Vec<(String, Stub)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes commands starting with `prefix` return `stdout`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.stubs
            .lock()
            .unwrap()
            .push((prefix.to_string(), Stub::Respond(stdout.to_string())));
    }

    /// Makes commands starting with `prefix` fail with `stderr`.
    pub fn fail(&self, prefix: &str, stderr: &str) {
        self.stubs
            .lock()
            .unwrap()
            .push((prefix.to_string(), Stub::Fail(stderr.to_string())));
    }

    /// Routes commands starting with `prefix` through `f`, which gets
    /// the full command line and may emulate the tool's side effects.
    pub fn handle(
        &self,
        prefix: &str,
        f: impl Fn(&str) -> Result<String, CmdError> + Send + 'static,
    ) {
        self.stubs
            .lock()
            .unwrap()
            .push((prefix.to_string(), Stub::Handle(Box::new(f))));
    }

    /// Every command line run so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Index of the first recorded command line starting with `prefix`.
    pub fn call_index(&self, prefix: &str) -> Option<usize> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .position(|c| c.starts_with(prefix))
    }

    fn render(program: &str, args: &[&str]) -> String {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn lookup(&self, line: &str) -> Result<String, CmdError> {
        let stubs = self.stubs.lock().unwrap();
        for (prefix, stub) in stubs.iter() {
            if line.starts_with(prefix.as_str()) {
                return match stub {
                    Stub::Respond(stdout) => Ok(stdout.clone()),
                    Stub::Fail(stderr) => Err(CmdError::Failed {
                        program: line
                            .split(' ')
                            .next()
                            .unwrap_or_default()
                            .to_string(),
                        code: 1,
                        stdout: String::new(),
                        stderr: stderr.clone(),
                    }),
                    Stub::Handle(f) => f(line),
                };
            }
        }
        Ok(String::new())
    }
}

impl Runner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CmdError> {
        let line = Self::render(program, args);
        self.calls.lock().unwrap().push(line.clone());
        self.lookup(&line)
    }

    fn run_streams(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&mut (dyn Read + Send)>,
        stdout: Option<&mut dyn Write>,
    ) -> Result<(), CmdError> {
        let line = Self::render(program, args);
        self.calls.lock().unwrap().push(line.clone());
        if let Some(stdin) = stdin {
            let mut sink = Vec::new();
            stdin.read_to_end(&mut sink).map_err(|source| {
                CmdError::Io { program: program.to_string(), source }
            })?;
        }
        let response = self.lookup(&line)?;
        if let Some(stdout) = stdout {
            stdout.write_all(response.as_bytes()).map_err(|source| {
                CmdError::Io { program: program.to_string(), source }
            })?;
        }
        Ok(())
    }
}
