// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NFS backend.
//!
//! The pool is an NFS export mounted under the pool mount path; every
//! cluster member can mount the same export, so volumes behave like
//! remote [`dir`](super::dir) volumes. All volume-level operations
//! delegate to an inner [`DirDriver`]; this layer only owns the export
//! parsing and the pool mount itself.

use std::fs;
use std::io::{Read, Write};

use amphora_wire::FsType;

use crate::backup;
use crate::config::{self, Rules};
use crate::error::{Error, Result};
use crate::migration::{
    MigrationType, VolumeSourceArgs, VolumeTargetArgs,
};
use crate::op::Operation;
use crate::stream::ReadWrite;
use crate::volume::{ContentType, Volume, VolumeType};

use super::dir::DirDriver;
use super::generic;
use super::{CommonDriver, Driver, Info, VolumeFiller};

/// Mount options used when the pool config supplies none.
const DEFAULT_MOUNT_OPTIONS: &str = "vers=4.2";

/// Splits an `[host:]path` export spec. IPv6 hosts travel in brackets,
/// `[::1]:/srv/share`.
fn parse_source(source: &str) -> (Option<String>, String) {
    if let Some(rest) = source.strip_prefix('[') {
        if let Some((host, path)) = rest.split_once("]:") {
            return (Some(host.to_string()), path.to_string());
        }
    }
    match source.split_once(':') {
        Some((host, path)) if !host.is_empty() => {
            (Some(host.to_string()), path.to_string())
        }
        _ => (None, source.to_string()),
    }
}

/// Renders `host:path` for mount(8), bracketing IPv6 hosts.
fn export_spec(host: &str, path: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{path}")
    } else {
        format!("{host}:{path}")
    }
}

pub struct NfsDriver {
    dir: DirDriver,
}

impl NfsDriver {
    pub fn new(common: CommonDriver) -> Self {
        Self { dir: DirDriver::new(common) }
    }

    fn config_value(&self, key: &str) -> Option<String> {
        self.common()
            .config()
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
    }

    fn mount_options(&self) -> String {
        self.config_value("nfs.mount_options")
            .unwrap_or_else(|| DEFAULT_MOUNT_OPTIONS.to_string())
    }

    fn path_is_mounted(&self, path: &std::path::Path) -> bool {
        let path = path.to_string_lossy().into_owned();
        self.common().runner().run("mountpoint", &["-q", &path]).is_ok()
    }

    /// Host and export path for this pool, once `create` has settled
    /// them into the config.
    fn export(&self) -> Result<(String, String)> {
        let host = self.config_value("nfs.host").ok_or_else(|| {
            Error::ConfigInvalid(vec!["nfs.host: required".to_string()])
        })?;
        let path = self.config_value("nfs.path").ok_or_else(|| {
            Error::ConfigInvalid(vec!["nfs.path: required".to_string()])
        })?;
        Ok((host, path))
    }
}

impl Driver for NfsDriver {
    fn info(&self) -> Info {
        Info {
            name: "nfs",
            version: "1".to_string(),
            volume_types: vec![
                VolumeType::Container,
                VolumeType::Vm,
                VolumeType::Image,
                VolumeType::Custom,
            ],
            remote: true,
            optimized_images: false,
            optimized_backups: false,
            volume_multi_node: true,
            block_backing: false,
            preserves_inodes: false,
            deactivate: false,
            buckets: false,
        }
    }

    fn common(&self) -> &CommonDriver {
        self.dir.common()
    }

    fn common_mut(&mut self) -> &mut CommonDriver {
        self.dir.common_mut()
    }

    fn config_rules(&self) -> Rules {
        let mut rules = Rules::new();
        rules.insert("source", config::optional(config::is_any));
        rules.insert("nfs.host", config::optional(config::is_any));
        rules.insert("nfs.path", config::optional(config::is_any));
        rules.insert("nfs.mount_options", config::optional(config::is_any));
        rules.insert("rsync.compression", config::optional(config::is_bool));
        rules
    }

    fn volume_config_rules(&self, vol: &Volume) -> Rules {
        self.dir.volume_config_rules(vol)
    }

    fn create(&mut self, _op: &Operation) -> Result<()> {
        let source = self
            .config_value("source")
            .ok_or_else(|| {
                Error::ConfigInvalid(vec!["source: required".to_string()])
            })?;
        let (source_host, source_path) = parse_source(&source);

        let host = source_host
            .or_else(|| self.config_value("nfs.host"))
            .ok_or_else(|| {
                Error::ConfigInvalid(vec![
                    "source: no NFS host given".to_string(),
                ])
            })?;
        if !source_path.starts_with('/') {
            return Err(Error::ConfigInvalid(vec![format!(
                "source: export path {source_path} is not absolute"
            )]));
        }

        let config = self.common_mut().config_mut();
        config.insert("nfs.host".to_string(), host.clone());
        config.insert("nfs.path".to_string(), source_path.clone());
        config.insert(
            "source".to_string(),
            export_spec(&host, &source_path),
        );

        fs::create_dir_all(self.common().pool_mount_path())?;
        Ok(())
    }

    fn delete(&mut self, _op: &Operation) -> Result<()> {
        self.unmount()?;
        match fs::remove_dir_all(self.common().pool_mount_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn mount(&mut self) -> Result<bool> {
        let mount_path = self.common().pool_mount_path();
        fs::create_dir_all(&mount_path)?;
        if self.path_is_mounted(&mount_path) {
            return Ok(false);
        }

        let (host, path) = self.export()?;
        let spec = export_spec(&host, &path);
        let options = self.mount_options();
        let target = mount_path.to_string_lossy().into_owned();
        self.common().runner().run(
            "mount",
            &["-t", "nfs4", "-o", options.as_str(), &spec, &target],
        )?;
        Ok(true)
    }

    fn unmount(&mut self) -> Result<bool> {
        let mount_path = self.common().pool_mount_path();
        if !self.path_is_mounted(&mount_path) {
            return Ok(false);
        }
        let target = mount_path.to_string_lossy().into_owned();
        self.common().runner().run("umount", &[&target])?;
        Ok(true)
    }

    // Volume semantics are directory semantics on the mounted export.

    fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&mut VolumeFiller<'_>>,
        op: &Operation,
    ) -> Result<()> {
        self.dir.create_volume(vol, filler, op)
    }

    fn delete_volume(&self, vol: &Volume, op: &Operation) -> Result<()> {
        self.dir.delete_volume(vol, op)
    }

    fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src: &Volume,
        copy_snapshots: bool,
        allow_inconsistent: bool,
        op: &Operation,
    ) -> Result<()> {
        self.dir.create_volume_from_copy(
            vol,
            src,
            copy_snapshots,
            allow_inconsistent,
            op,
        )
    }

    fn set_volume_quota(
        &self,
        vol: &Volume,
        size: &str,
        allow_unsafe_resize: bool,
        op: &Operation,
    ) -> Result<()> {
        self.dir.set_volume_quota(vol, size, allow_unsafe_resize, op)
    }

    fn get_volume_usage(&self, vol: &Volume) -> Result<i64> {
        self.dir.get_volume_usage(vol)
    }

    fn mount_volume(&self, vol: &Volume, op: &Operation) -> Result<()> {
        self.dir.mount_volume(vol, op)
    }

    fn unmount_volume(
        &self,
        vol: &Volume,
        keep_block_dev: bool,
        op: &Operation,
    ) -> Result<bool> {
        self.dir.unmount_volume(vol, keep_block_dev, op)
    }

    fn create_volume_snapshot(
        &self,
        snap: &Volume,
        op: &Operation,
    ) -> Result<()> {
        self.dir.create_volume_snapshot(snap, op)
    }

    fn delete_volume_snapshot(
        &self,
        snap: &Volume,
        op: &Operation,
    ) -> Result<()> {
        self.dir.delete_volume_snapshot(snap, op)
    }

    fn restore_volume(
        &self,
        vol: &Volume,
        snapshot_name: &str,
        op: &Operation,
    ) -> Result<()> {
        self.dir.restore_volume(vol, snapshot_name, op)
    }

    fn migration_types(
        &self,
        content_type: ContentType,
        _refresh: bool,
        _copy_snapshots: bool,
        _cluster_move: bool,
        _storage_move: bool,
    ) -> Vec<MigrationType> {
        // NFS does not reliably carry xattrs, so they are never offered.
        let features = generic::byte_stream_features(self.common(), false);
        let primary = if content_type == ContentType::Filesystem {
            FsType::Rsync
        } else {
            FsType::BlockAndRsync
        };
        vec![MigrationType { fs_type: primary, features }]
    }

    fn migrate_volume(
        &self,
        vol: &Volume,
        conn: &mut dyn ReadWrite,
        args: &VolumeSourceArgs,
        op: &Operation,
    ) -> Result<()> {
        generic::vfs_migrate_volume(self, vol, conn, args, op)
    }

    fn create_volume_from_migration(
        &self,
        vol: &Volume,
        conn: &mut dyn ReadWrite,
        args: &VolumeTargetArgs,
        op: &Operation,
    ) -> Result<()> {
        generic::vfs_create_volume_from_migration(self, vol, conn, args, op)
    }

    fn refresh_volume(
        &self,
        vol: &Volume,
        src: &Volume,
        refresh_snapshots: &[String],
        allow_inconsistent: bool,
        op: &Operation,
    ) -> Result<()> {
        generic::vfs_refresh_volume(
            self,
            vol,
            src,
            refresh_snapshots,
            allow_inconsistent,
            op,
        )
    }

    fn backup_volume(
        &self,
        vol: &Volume,
        dest: &mut dyn Write,
        optimized: bool,
        snapshots: &[String],
        op: &Operation,
    ) -> Result<()> {
        self.dir.backup_volume(vol, dest, optimized, snapshots, op)
    }

    fn create_volume_from_backup(
        &self,
        vol: &Volume,
        info: &backup::Info,
        data: &mut (dyn Read + Send),
        op: &Operation,
    ) -> Result<()> {
        self.dir.create_volume_from_backup(vol, info, data, op)
    }
}
