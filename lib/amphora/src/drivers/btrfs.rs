// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Copy-on-write filesystem backend.
//!
//! Every volume is a btrfs subvolume and every snapshot a readonly
//! snapshot subvolume, so copies and snapshots are instant. Quotas map
//! to qgroup limits. Migration and backups can use the filesystem's
//! own send/receive streams, with the byte-stream transport as the
//! negotiated fallback.

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use slog::{debug, warn};

use amphora_wire::{
    FsType, BTRFS_FEATURE_MIGRATION_HEADER, BTRFS_FEATURE_SUBVOLUMES,
    BTRFS_FEATURE_SUBVOLUME_UUIDS,
};

use crate::backup;
use crate::config::{self, Rules};
use crate::error::{Error, Result, ResultExt};
use crate::migration::{
    MigrationType, VolumeSourceArgs, VolumeTargetArgs,
};
use crate::op::Operation;
use crate::revert::Revert;
use crate::stream::{self, NativeSink, NativeSource, ReadWrite};
use crate::volume::{
    temp_copy_snapshot_name, ContentType, Volume, VolumeType,
};

use super::{generic, CommonDriver, Driver, Info, VolumeFiller};

/// Metadata announced ahead of a native stream sequence so the receiver
/// can verify what it is about to apply.
#[derive(Debug, Serialize, Deserialize)]
struct SubvolumeHeader {
    snapshots: Vec<String>,
}

pub struct BtrfsDriver {
    common: CommonDriver,
    version: String,
}

impl BtrfsDriver {
    pub fn new(common: CommonDriver, version: String) -> Self {
        Self { common, version }
    }

    fn source_path(&self) -> Option<PathBuf> {
        self.common
            .config()
            .get("source")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    fn mount_options(&self) -> String {
        self.common
            .config()
            .get("btrfs.mount_options")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| "user_subvol_rm_allowed".to_string())
    }

    fn path_is_mounted(&self, path: &Path) -> bool {
        let path = path.to_string_lossy().into_owned();
        self.common.runner().run("mountpoint", &["-q", &path]).is_ok()
    }

    fn is_subvolume(&self, path: &Path) -> bool {
        let path = path.to_string_lossy().into_owned();
        self.common
            .runner()
            .run("btrfs", &["subvolume", "show", &path])
            .is_ok()
    }

    fn create_subvolume(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        self.common
            .runner()
            .run("btrfs", &["subvolume", "create", &path])?;
        Ok(())
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        self.common
            .runner()
            .run("btrfs", &["subvolume", "delete", &path])?;
        Ok(())
    }

    fn snapshot_subvolume(
        &self,
        src: &Path,
        dst: &Path,
        readonly: bool,
    ) -> Result<()> {
        let src = src.to_string_lossy().into_owned();
        let dst = dst.to_string_lossy().into_owned();
        let mut args = vec!["subvolume", "snapshot"];
        if readonly {
            args.push("-r");
        }
        args.push(&src);
        args.push(&dst);
        self.common.runner().run("btrfs", &args)?;
        Ok(())
    }

    fn set_subvolume_writable(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        self.common
            .runner()
            .run("btrfs", &["property", "set", &path, "ro", "false"])?;
        Ok(())
    }

    /// Streams one subvolume to the peer, incrementally against
    /// `parent` when set.
    fn send_subvolume(
        &self,
        path: &Path,
        parent: Option<&Path>,
        conn: &mut dyn ReadWrite,
    ) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        let parent = parent.map(|p| p.to_string_lossy().into_owned());
        let mut args = vec!["send"];
        if let Some(parent) = parent.as_deref() {
            args.push("-p");
            args.push(parent);
        }
        args.push(&path);

        let mut sink = NativeSink::new(conn);
        self.common.runner().run_streams(
            "btrfs",
            &args,
            None,
            Some(&mut sink),
        )?;
        sink.finish()
    }

    /// Spools one send stream to a file so it can be archived with a
    /// known size.
    fn spool_send(
        &self,
        path: &Path,
        parent: Option<&Path>,
    ) -> Result<tempfile::NamedTempFile> {
        let path = path.to_string_lossy().into_owned();
        let parent = parent.map(|p| p.to_string_lossy().into_owned());
        let mut args = vec!["send"];
        if let Some(parent) = parent.as_deref() {
            args.push("-p");
            args.push(parent);
        }
        args.push(&path);

        let mut spool =
            tempfile::NamedTempFile::new_in(self.common.pool_mount_path())?;
        self.common.runner().run_streams(
            "btrfs",
            &args,
            None,
            Some(spool.as_file_mut()),
        )?;
        Ok(spool)
    }

    /// Receives one stream into `staging` and moves the resulting
    /// subvolume to `dest`, replacing whatever was there.
    fn receive_subvolume(
        &self,
        staging: &Path,
        source: &mut (dyn Read + Send),
        dest: &Path,
    ) -> Result<()> {
        let before: HashSet<std::ffi::OsString> = fs::read_dir(staging)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.file_name())
            .collect();

        let staging_arg = staging.to_string_lossy().into_owned();
        self.common.runner().run_streams(
            "btrfs",
            &["receive", "-e", &staging_arg],
            Some(source),
            None,
        )?;

        let mut appeared = Vec::new();
        for entry in fs::read_dir(staging)? {
            let entry = entry?;
            if !before.contains(&entry.file_name()) {
                appeared.push(entry.path());
            }
        }
        if appeared.len() != 1 {
            return Err(Error::Protocol(format!(
                "expected one received subvolume, found {}",
                appeared.len()
            )));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            self.delete_subvolume(dest)?;
        }
        fs::rename(&appeared[0], dest)?;
        Ok(())
    }

    fn receive_native(
        &self,
        vol: &Volume,
        conn: &mut dyn ReadWrite,
        args: &VolumeTargetArgs,
        op: &Operation,
        staging: &Path,
    ) -> Result<()> {
        let mut revert = Revert::new();

        if args
            .migration_type
            .features
            .iter()
            .any(|f| f == BTRFS_FEATURE_MIGRATION_HEADER)
        {
            let header: SubvolumeHeader = stream::recv_header(conn)?;
            if header.snapshots != args.snapshots {
                return Err(Error::Protocol(format!(
                    "announced snapshots {:?} do not match negotiated {:?}",
                    header.snapshots, args.snapshots
                )));
            }
        }

        if !args.volume_only {
            for snap_name in &args.snapshots {
                op.check_cancelled()?;
                let snap = vol.new_snapshot(snap_name)?;
                debug!(self.common.log(), "receiving snapshot stream";
                    "volume" => vol.name(), "snapshot" => snap_name.as_str());
                let mut source = NativeSource::new(conn);
                self.receive_subvolume(
                    staging,
                    &mut source,
                    &snap.mount_path(),
                )
                .context("receive snapshot", snap.name().to_string())?;
                revert.add(move || {
                    if let Err(e) = self.delete_subvolume(&snap.mount_path())
                    {
                        warn!(self.common.log(), "cleanup failed";
                            "snapshot" => snap.name(), "error" => %e);
                    }
                });
            }
        }

        op.check_cancelled()?;
        debug!(self.common.log(), "receiving volume stream";
            "volume" => vol.name());
        let mut source = NativeSource::new(conn);
        self.receive_subvolume(staging, &mut source, &vol.mount_path())
            .context("receive volume", vol.name().to_string())?;
        if !args.refresh {
            let vol_path = vol.mount_path();
            revert.add(move || {
                if let Err(e) = self.delete_subvolume(&vol_path) {
                    warn!(self.common.log(), "cleanup failed";
                        "volume" => vol.name(), "error" => %e);
                }
            });
        }
        self.set_subvolume_writable(&vol.mount_path())?;
        stream::recv_end(conn)?;

        if args.volume_size > 0 {
            self.set_volume_quota(
                vol,
                &args.volume_size.to_string(),
                true,
                op,
            )?;
        }

        revert.success();
        Ok(())
    }

    fn restore_native(
        &self,
        vol: &Volume,
        data: &mut (dyn Read + Send),
        op: &Operation,
        staging: &Path,
    ) -> Result<()> {
        let mut revert = Revert::new();
        let mut archive = tar::Archive::new(GzDecoder::new(data));

        for entry in archive.entries()? {
            op.check_cancelled()?;
            let mut entry = entry?;
            let member = entry.path()?.to_string_lossy().into_owned();

            if member == backup::INDEX_MEMBER {
                continue;
            }

            // Streams can be large and the receiver needs a Send
            // source, so each member is spooled before being applied.
            let mut spool =
                tempfile::tempfile_in(self.common.pool_mount_path())?;
            std::io::copy(&mut entry, &mut spool)?;
            spool.seek(SeekFrom::Start(0))?;

            if member == backup::VOLUME_NATIVE_MEMBER {
                self.receive_subvolume(staging, &mut spool, &vol.mount_path())
                    .context("restore volume", vol.name().to_string())?;
                let vol_path = vol.mount_path();
                revert.add(move || {
                    if let Err(e) = self.delete_subvolume(&vol_path) {
                        warn!(self.common.log(), "cleanup failed";
                            "volume" => vol.name(), "error" => %e);
                    }
                });
                self.set_subvolume_writable(&vol.mount_path())?;
                continue;
            }

            let snap_name = member
                .strip_prefix(&format!(
                    "{}/",
                    backup::SNAPSHOTS_MEMBER_PREFIX
                ))
                .and_then(|m| m.strip_suffix(".bin"));
            let Some(snap_name) = snap_name else {
                return Err(Error::Protocol(format!(
                    "unexpected archive member {member}"
                )));
            };

            let snap = vol.new_snapshot(snap_name)?;
            self.receive_subvolume(staging, &mut spool, &snap.mount_path())
                .context("restore snapshot", snap.name().to_string())?;
            revert.add(move || {
                if let Err(e) = self.delete_subvolume(&snap.mount_path()) {
                    warn!(self.common.log(), "cleanup failed";
                        "snapshot" => snap.name(), "error" => %e);
                }
            });
        }

        if !vol.mount_path().exists() {
            return Err(Error::Protocol(
                "archive carried no volume stream".into(),
            ));
        }
        revert.success();
        Ok(())
    }
}

impl Driver for BtrfsDriver {
    fn info(&self) -> Info {
        Info {
            name: "btrfs",
            version: self.version.clone(),
            volume_types: vec![
                VolumeType::Container,
                VolumeType::Vm,
                VolumeType::Image,
                VolumeType::Custom,
                VolumeType::Bucket,
            ],
            remote: false,
            optimized_images: true,
            optimized_backups: true,
            volume_multi_node: false,
            block_backing: false,
            preserves_inodes: true,
            deactivate: false,
            buckets: true,
        }
    }

    fn common(&self) -> &CommonDriver {
        &self.common
    }

    fn common_mut(&mut self) -> &mut CommonDriver {
        &mut self.common
    }

    fn config_rules(&self) -> Rules {
        let mut rules = Rules::new();
        rules.insert("source", config::optional(config::is_any));
        rules.insert("btrfs.mount_options", config::optional(config::is_any));
        rules.insert("rsync.compression", config::optional(config::is_bool));
        rules
    }

    fn volume_config_rules(&self, _vol: &Volume) -> Rules {
        let mut rules = Rules::new();
        rules.insert("size", config::optional(config::is_size));
        rules.insert(
            "block.filesystem",
            config::optional(config::one_of(&["ext4", "xfs", "btrfs"])),
        );
        rules.insert("block.mount_options", config::optional(config::is_any));
        rules
    }

    fn create(&mut self, _op: &Operation) -> Result<()> {
        let source = self.source_path().ok_or_else(|| {
            Error::ConfigInvalid(vec!["source: required".to_string()])
        })?;

        if !self.is_subvolume(&source) {
            if let Some(parent) = source.parent() {
                fs::create_dir_all(parent)?;
            }
            self.create_subvolume(&source)
                .context("create pool subvolume", self.common.pool_name().to_string())?;
        }

        fs::create_dir_all(self.common.pool_mount_path())?;
        Ok(())
    }

    fn delete(&mut self, _op: &Operation) -> Result<()> {
        self.unmount()?;
        match fs::remove_dir_all(self.common.pool_mount_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn mount(&mut self) -> Result<bool> {
        let mount_path = self.common.pool_mount_path();
        fs::create_dir_all(&mount_path)?;

        let Some(source) = self.source_path() else {
            return Ok(false);
        };
        if source == mount_path || self.path_is_mounted(&mount_path) {
            return Ok(false);
        }

        let source = source.to_string_lossy().into_owned();
        let target = mount_path.to_string_lossy().into_owned();
        self.common.runner().run("mount", &["--bind", &source, &target])?;

        if self
            .common
            .config()
            .get("btrfs.mount_options")
            .map_or(false, |v| !v.is_empty())
        {
            let remount = format!("remount,{}", self.mount_options());
            self.common.runner().run("mount", &["-o", &remount, &target])?;
        }
        Ok(true)
    }

    fn unmount(&mut self) -> Result<bool> {
        let mount_path = self.common.pool_mount_path();
        if self.source_path().is_none()
            || !self.path_is_mounted(&mount_path)
        {
            return Ok(false);
        }
        let target = mount_path.to_string_lossy().into_owned();
        self.common.runner().run("umount", &[&target])?;
        Ok(true)
    }

    fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&mut VolumeFiller<'_>>,
        _op: &Operation,
    ) -> Result<()> {
        let vol_path = vol.mount_path();
        if vol_path.exists() {
            return Err(Error::AlreadyExists(format!(
                "volume path {}",
                vol_path.display()
            )));
        }
        if let Some(parent) = vol_path.parent() {
            fs::create_dir_all(parent)?;
        }

        self.create_subvolume(&vol_path)
            .context("create volume", vol.name().to_string())?;
        let mut revert = Revert::new();
        {
            let vol_path = vol_path.clone();
            revert.add(move || {
                if let Err(e) = self.delete_subvolume(&vol_path) {
                    warn!(self.common.log(), "cleanup failed";
                        "volume" => vol.name(), "error" => %e);
                }
            });
        }
        vol.ensure_mount_path()?;

        let is_block = vol.content_type() != ContentType::Filesystem;
        let fill_target = if is_block {
            self.get_volume_disk_path(vol)?
        } else {
            vol_path
        };

        if let Some(filler) = filler {
            (filler.fill)(vol, &fill_target)
                .context("fill volume", vol.name().to_string())?;
        }

        if is_block {
            match generic::ensure_volume_block_file(
                &fill_target,
                vol.config_size()?,
                false,
            ) {
                Ok(_) | Err(Error::CannotShrink) => (),
                Err(e) => return Err(e),
            }
        }

        revert.success();
        Ok(())
    }

    fn delete_volume(&self, vol: &Volume, op: &Operation) -> Result<()> {
        let snapshots = self.volume_snapshots(vol, op)?;
        if !snapshots.is_empty() {
            return Err(Error::RequiresCascade(snapshots));
        }

        if vol.mount_path().exists() {
            self.delete_subvolume(&vol.mount_path())
                .context("remove volume", vol.name().to_string())?;
        }

        generic::prune_empty_snapshots_dir(vol)?;
        Ok(())
    }

    fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src: &Volume,
        copy_snapshots: bool,
        _allow_inconsistent: bool,
        op: &Operation,
    ) -> Result<()> {
        let mut revert = Revert::new();

        let snap_names = if copy_snapshots && !src.is_snapshot() {
            self.volume_snapshots(src, op)?
        } else {
            Vec::new()
        };

        for snap_name in &snap_names {
            op.check_cancelled()?;
            let src_snap = src.new_snapshot(snap_name)?;
            let dst_snap = vol.new_snapshot(snap_name)?;
            fs::create_dir_all(vol.snapshots_dir())?;
            self.snapshot_subvolume(
                &src_snap.mount_path(),
                &dst_snap.mount_path(),
                true,
            )
            .context("copy snapshot", src_snap.name().to_string())?;
            revert.add(move || {
                if let Err(e) =
                    self.delete_subvolume(&dst_snap.mount_path())
                {
                    warn!(self.common.log(), "cleanup failed";
                        "snapshot" => dst_snap.name(), "error" => %e);
                }
            });
        }

        op.check_cancelled()?;
        let vol_path = vol.mount_path();
        if vol_path.exists() {
            return Err(Error::AlreadyExists(format!(
                "volume path {}",
                vol_path.display()
            )));
        }
        if let Some(parent) = vol_path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.snapshot_subvolume(&src.mount_path(), &vol_path, false)
            .context("copy volume", src.name().to_string())?;

        revert.success();
        Ok(())
    }

    fn set_volume_quota(
        &self,
        vol: &Volume,
        size: &str,
        allow_unsafe_resize: bool,
        _op: &Operation,
    ) -> Result<()> {
        let size_bytes = crate::units::parse_byte_size(size)
            .map_err(|msg| Error::ConfigInvalid(vec![format!("size: {msg}")]))?;

        if vol.content_type() == ContentType::Block {
            if size_bytes <= 0 {
                return Ok(());
            }
            let disk_path = self.get_volume_disk_path(vol)?;
            generic::ensure_volume_block_file(
                &disk_path,
                size_bytes,
                allow_unsafe_resize,
            )?;
            return Ok(());
        }

        let vol_path = vol.mount_path().to_string_lossy().into_owned();
        if size_bytes <= 0 {
            self.common
                .runner()
                .run("btrfs", &["qgroup", "limit", "none", &vol_path])?;
            return Ok(());
        }

        let pool_path =
            self.common.pool_mount_path().to_string_lossy().into_owned();
        self.common.runner().run("btrfs", &["quota", "enable", &pool_path])?;
        let limit = size_bytes.to_string();
        self.common
            .runner()
            .run("btrfs", &["qgroup", "limit", &limit, &vol_path])?;
        Ok(())
    }

    fn get_volume_usage(&self, vol: &Volume) -> Result<i64> {
        let vol_path = vol.mount_path().to_string_lossy().into_owned();
        let out = self.common.runner().run(
            "btrfs",
            &["qgroup", "show", "-e", "-f", "--raw", &vol_path],
        )?;

        // Last line carries this subvolume's qgroup; the second column
        // is the referenced byte count.
        for line in out.lines().rev() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                continue;
            }
            if let Ok(referenced) = fields[1].parse::<i64>() {
                return Ok(referenced);
            }
        }
        Err(Error::Protocol(format!(
            "unparseable qgroup output for {}",
            vol.name()
        )))
    }

    fn mount_volume(&self, vol: &Volume, _op: &Operation) -> Result<()> {
        let _guard = vol.mount_lock();
        if !vol.mount_path().exists() {
            return Err(Error::NotFound(format!("volume {}", vol.name())));
        }
        vol.mount_ref_count_increment();
        Ok(())
    }

    fn unmount_volume(
        &self,
        vol: &Volume,
        _keep_block_dev: bool,
        _op: &Operation,
    ) -> Result<bool> {
        let _guard = vol.mount_lock();

        let ref_count = vol.mount_ref_count_decrement();
        if ref_count > 0 {
            debug!(self.common.log(), "skipping unmount as in use";
                "volume" => vol.name(), "ref_count" => ref_count);
            return Err(Error::InUse);
        }
        Ok(false)
    }

    fn create_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<()> {
        let parent = snap.parent();
        fs::create_dir_all(parent.snapshots_dir())?;
        self.snapshot_subvolume(
            &parent.mount_path(),
            &snap.mount_path(),
            true,
        )
        .context("snapshot volume", snap.name().to_string())
    }

    fn delete_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<()> {
        if snap.mount_path().exists() {
            self.delete_subvolume(&snap.mount_path())
                .context("remove snapshot", snap.name().to_string())?;
        }
        generic::prune_empty_snapshots_dir(&snap.parent())?;
        Ok(())
    }

    fn restore_volume(
        &self,
        vol: &Volume,
        snapshot_name: &str,
        _op: &Operation,
    ) -> Result<()> {
        let snap = vol.new_snapshot(snapshot_name)?;
        if !snap.mount_path().exists() {
            return Err(Error::NotFound(format!(
                "snapshot {snapshot_name}"
            )));
        }

        let vol_path = vol.mount_path();
        if vol_path.exists() {
            self.delete_subvolume(&vol_path)
                .context("restore volume", vol.name().to_string())?;
        }
        self.snapshot_subvolume(&snap.mount_path(), &vol_path, false)
            .context("restore volume", vol.name().to_string())
    }

    fn migration_types(
        &self,
        content_type: ContentType,
        refresh: bool,
        copy_snapshots: bool,
        _cluster_move: bool,
        _storage_move: bool,
    ) -> Vec<MigrationType> {
        let rsync_features =
            generic::byte_stream_features(&self.common, true);
        let btrfs_features = vec![
            BTRFS_FEATURE_MIGRATION_HEADER.to_string(),
            BTRFS_FEATURE_SUBVOLUMES.to_string(),
            BTRFS_FEATURE_SUBVOLUME_UUIDS.to_string(),
        ];

        if content_type != ContentType::Filesystem {
            return vec![
                MigrationType {
                    fs_type: FsType::Btrfs,
                    features: btrfs_features,
                },
                MigrationType {
                    fs_type: FsType::BlockAndRsync,
                    features: rsync_features,
                },
            ];
        }

        // An incremental refresh without snapshots has no common base
        // subvolume to build a native stream on.
        if refresh && !copy_snapshots {
            return vec![MigrationType {
                fs_type: FsType::Rsync,
                features: rsync_features,
            }];
        }

        vec![
            MigrationType { fs_type: FsType::Btrfs, features: btrfs_features },
            MigrationType { fs_type: FsType::Rsync, features: rsync_features },
        ]
    }

    fn migrate_volume(
        &self,
        vol: &Volume,
        conn: &mut dyn ReadWrite,
        args: &VolumeSourceArgs,
        op: &Operation,
    ) -> Result<()> {
        if args.migration_type.fs_type != FsType::Btrfs {
            return generic::vfs_migrate_volume(self, vol, conn, args, op);
        }

        if args
            .migration_type
            .features
            .iter()
            .any(|f| f == BTRFS_FEATURE_MIGRATION_HEADER)
        {
            let header =
                SubvolumeHeader { snapshots: args.snapshots.clone() };
            stream::send_header(conn, &header)?;
        }

        let mut parent: Option<PathBuf> = None;
        if !args.volume_only {
            for snap_name in &args.snapshots {
                op.check_cancelled()?;
                let snap = vol.new_snapshot(snap_name)?;
                debug!(self.common.log(), "sending snapshot stream";
                    "volume" => vol.name(), "snapshot" => snap_name.as_str());
                let snap_path = snap.mount_path();
                self.send_subvolume(&snap_path, parent.as_deref(), conn)
                    .context("send snapshot", snap.name().to_string())?;
                parent = Some(snap_path);
            }
        }

        // The live volume is writable and send needs a readonly source,
        // so it goes out through a transient snapshot.
        op.check_cancelled()?;
        fs::create_dir_all(vol.snapshots_dir())?;
        let transient = vol.snapshots_dir().join(temp_copy_snapshot_name());
        self.snapshot_subvolume(&vol.mount_path(), &transient, true)?;

        debug!(self.common.log(), "sending volume stream";
            "volume" => vol.name());
        let result = self
            .send_subvolume(&transient, parent.as_deref(), conn)
            .context("send volume", vol.name().to_string())
            .and_then(|()| stream::send_end(conn));

        if let Err(e) = self.delete_subvolume(&transient) {
            warn!(self.common.log(), "failed to remove transient snapshot";
                "volume" => vol.name(), "error" => %e);
        }
        let _ = generic::prune_empty_snapshots_dir(vol);
        result
    }

    fn create_volume_from_migration(
        &self,
        vol: &Volume,
        conn: &mut dyn ReadWrite,
        args: &VolumeTargetArgs,
        op: &Operation,
    ) -> Result<()> {
        if args.migration_type.fs_type != FsType::Btrfs {
            return generic::vfs_create_volume_from_migration(
                self, vol, conn, args, op,
            );
        }

        let staging = self
            .common
            .pool_mount_path()
            .join(format!("migration-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&staging)?;
        let result = self.receive_native(vol, conn, args, op, &staging);
        let _ = fs::remove_dir_all(&staging);
        result
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
        if !optimized {
            return generic::vfs_backup_volume(self, vol, dest, snapshots, op);
        }

        let info = backup::Info {
            format_version: backup::CURRENT_FORMAT,
            pool: self.common.pool_name().to_string(),
            name: vol.name().to_string(),
            vol_type: vol.vol_type(),
            content_type: vol.content_type(),
            optimized: true,
            snapshots: snapshots.to_vec(),
            config: vol.config().clone(),
        };
        let mut writer = backup::Writer::new(&mut *dest, &info)?;

        let mut parent: Option<PathBuf> = None;
        for snap_name in snapshots {
            op.check_cancelled()?;
            let snap = vol.new_snapshot(snap_name)?;
            let snap_path = snap.mount_path();
            let spool = self
                .spool_send(&snap_path, parent.as_deref())
                .context("archive snapshot", snap.name().to_string())?;
            writer.add_file(
                &backup::native_snapshot_member(snap_name),
                spool.path(),
            )?;
            parent = Some(snap_path);
        }

        op.check_cancelled()?;
        fs::create_dir_all(vol.snapshots_dir())?;
        let transient = vol.snapshots_dir().join(temp_copy_snapshot_name());
        self.snapshot_subvolume(&vol.mount_path(), &transient, true)?;

        let result = (|| {
            let spool = self
                .spool_send(&transient, parent.as_deref())
                .context("archive volume", vol.name().to_string())?;
            writer.add_file(backup::VOLUME_NATIVE_MEMBER, spool.path())?;
            writer.finish()
        })();

        if let Err(e) = self.delete_subvolume(&transient) {
            warn!(self.common.log(), "failed to remove transient snapshot";
                "volume" => vol.name(), "error" => %e);
        }
        let _ = generic::prune_empty_snapshots_dir(vol);
        result
    }

    fn create_volume_from_backup(
        &self,
        vol: &Volume,
        info: &backup::Info,
        data: &mut (dyn Read + Send),
        op: &Operation,
    ) -> Result<()> {
        if !info.optimized {
            return generic::vfs_create_volume_from_backup(
                self, vol, info, data, op,
            );
        }

        let staging = self
            .common
            .pool_mount_path()
            .join(format!("restore-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&staging)?;
        let result = self.restore_native(vol, data, op, &staging);
        let _ = fs::remove_dir_all(&staging);
        result
    }
}
