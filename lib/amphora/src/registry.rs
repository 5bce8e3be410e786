// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver registry.
//!
//! Maps backend names to constructors. Each entry carries a [`LoadCell`]
//! holding the backend's one-time load state: the required host tools are
//! checked and the tool version detected on first load, then cached for
//! the life of the process. Driver instances themselves are cheap and
//! built per logical operation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::cmd::{tool_in_path, Runner};
use crate::drivers::{
    BtrfsDriver, CommonDriver, DirDriver, DrbdDriver, Driver, Info,
    NfsDriver, RbdDriver,
};
use crate::error::{Error, Result};

/// One-time load state for a backend: required tools are verified and the
/// version string detected on the first load, under a lock so concurrent
/// loads probe the host once.
pub struct LoadCell {
    required_tools: &'static [&'static str],
    detect: fn(&dyn Runner) -> Result<String>,
    version: Mutex<Option<String>>,
}

impl LoadCell {
    pub fn new(
        required_tools: &'static [&'static str],
        detect: fn(&dyn Runner) -> Result<String>,
    ) -> Self {
        Self { required_tools, detect, version: Mutex::new(None) }
    }

    /// Returns the backend version, probing the host on the first call.
    pub fn load(&self, runner: &dyn Runner) -> Result<String> {
        let mut version = self.version.lock().unwrap();
        if let Some(v) = version.as_ref() {
            return Ok(v.clone());
        }
        for tool in self.required_tools {
            if !tool_in_path(tool) {
                return Err(Error::ToolMissing(tool.to_string()));
            }
        }
        let detected = (self.detect)(runner)?;
        *version = Some(detected.clone());
        Ok(detected)
    }

    pub fn loaded(&self) -> bool {
        self.version.lock().unwrap().is_some()
    }
}

struct Entry {
    name: &'static str,
    cell: LoadCell,
    build: fn(CommonDriver, String) -> Box<dyn Driver>,
}

fn first_line(out: &str) -> String {
    out.lines().next().unwrap_or("").trim().to_string()
}

fn detect_static(_runner: &dyn Runner) -> Result<String> {
    Ok("1".to_string())
}

fn detect_btrfs(runner: &dyn Runner) -> Result<String> {
    let out = runner.run("btrfs", &["version"])?;
    let line = first_line(&out);
    Ok(line.strip_prefix("btrfs-progs v").unwrap_or(&line).to_string())
}

fn detect_rbd(runner: &dyn Runner) -> Result<String> {
    let out = runner.run("rbd", &["--version"])?;
    Ok(first_line(&out))
}

fn detect_drbd(runner: &dyn Runner) -> Result<String> {
    let out = runner.run("linstor", &["--version"])?;
    Ok(first_line(&out))
}

lazy_static! {
    static ref DRIVERS: Vec<Entry> = vec![
        Entry {
            name: "dir",
            cell: LoadCell::new(&[], detect_static),
            build: |common, _version| Box::new(DirDriver::new(common)),
        },
        Entry {
            name: "btrfs",
            cell: LoadCell::new(&["btrfs"], detect_btrfs),
            build: |common, version| {
                Box::new(BtrfsDriver::new(common, version))
            },
        },
        Entry {
            name: "rbd",
            cell: LoadCell::new(&["rbd", "ceph"], detect_rbd),
            build: |common, version| {
                Box::new(RbdDriver::new(common, version))
            },
        },
        Entry {
            name: "drbd",
            cell: LoadCell::new(&["linstor"], detect_drbd),
            build: |common, version| {
                Box::new(DrbdDriver::new(common, version))
            },
        },
        Entry {
            name: "nfs",
            cell: LoadCell::new(&["mount.nfs"], detect_static),
            build: |common, _version| Box::new(NfsDriver::new(common)),
        },
    ];
}

fn entry(name: &str) -> Result<&'static Entry> {
    DRIVERS
        .iter()
        .find(|e| e.name == name)
        .ok_or_else(|| Error::NotFound(format!("storage driver {name:?}")))
}

/// Names of all registered backends, in registration order.
pub fn driver_names() -> Vec<&'static str> {
    DRIVERS.iter().map(|e| e.name).collect()
}

/// Whether a backend has completed its one-time load in this process.
pub fn loaded(name: &str) -> bool {
    entry(name).map(|e| e.cell.loaded()).unwrap_or(false)
}

/// Builds a driver instance for one pool. The backend's load check runs
/// on first use; later loads reuse the cached version.
pub fn load(
    name: &str,
    pool_name: impl Into<String>,
    config: BTreeMap<String, String>,
    storage_root: impl Into<PathBuf>,
    log: slog::Logger,
    runner: Arc<dyn Runner>,
) -> Result<Box<dyn Driver>> {
    let entry = entry(name)?;
    let version = entry.cell.load(runner.as_ref())?;
    let log = log.new(slog::o!("driver" => entry.name));
    let common =
        CommonDriver::new(pool_name, config, storage_root, log, runner);
    Ok((entry.build)(common, version))
}

/// Capability descriptors of every backend usable on this host. Backends
/// whose tools are missing are skipped rather than reported as errors.
pub fn supported_drivers(
    storage_root: impl Into<PathBuf>,
    log: &slog::Logger,
    runner: &Arc<dyn Runner>,
) -> Vec<Info> {
    let storage_root = storage_root.into();
    DRIVERS
        .iter()
        .filter_map(|e| {
            load(
                e.name,
                "probe",
                BTreeMap::new(),
                storage_root.clone(),
                log.clone(),
                runner.clone(),
            )
            .ok()
            .map(|d| d.info())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_logger, RecordingRunner};

    #[test]
    fn unknown_driver_is_not_found() {
        let runner: Arc<dyn Runner> = Arc::new(RecordingRunner::new());
        let root = tempfile::tempdir().unwrap();
        let err = load(
            "floppy",
            "p1",
            BTreeMap::new(),
            root.path(),
            test_logger(),
            runner,
        )
        .map(|_| ())
        .unwrap_err();
        assert!(err.is_not_found());
        assert!(!loaded("floppy"));
    }

    #[test]
    fn dir_driver_loads_without_host_tools() {
        let runner: Arc<dyn Runner> = Arc::new(RecordingRunner::new());
        let root = tempfile::tempdir().unwrap();
        let driver = load(
            "dir",
            "p1",
            BTreeMap::new(),
            root.path(),
            test_logger(),
            runner,
        )
        .unwrap();
        assert_eq!(driver.info().name, "dir");
        assert_eq!(driver.info().version, "1");
        assert!(loaded("dir"));
    }

    #[test]
    fn load_cell_probes_the_host_once() {
        let runner = RecordingRunner::new();
        runner.respond("fooctl --version", "fooctl 2.4");
        let cell = LoadCell::new(&[], |r| {
            Ok(first_line(&r.run("fooctl", &["--version"])?))
        });
        assert!(!cell.loaded());

        assert_eq!(cell.load(&runner).unwrap(), "fooctl 2.4");
        assert_eq!(cell.load(&runner).unwrap(), "fooctl 2.4");
        assert!(cell.loaded());
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn missing_tool_fails_before_any_probe() {
        let runner = RecordingRunner::new();
        let cell = LoadCell::new(
            &["amphora-no-such-tool"],
            |r| Ok(first_line(&r.run("fooctl", &["--version"])?)),
        );
        let err = cell.load(&runner).unwrap_err();
        assert!(matches!(err, Error::ToolMissing(_)));
        assert!(runner.calls().is_empty());
        assert!(!cell.loaded());
    }

    #[test]
    fn registry_names_every_backend() {
        assert_eq!(
            driver_names(),
            vec!["dir", "btrfs", "rbd", "drbd", "nfs"]
        );
    }
}
