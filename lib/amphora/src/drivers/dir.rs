// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plain-directory backend.
//!
//! Volumes are directories under the pool mount path, snapshots are
//! full copies in a parallel tree, and block content is a sparse raw
//! image file. Everything goes through the generic path-based helpers;
//! this backend is the reference for their semantics.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use slog::debug;

use amphora_wire::FsType;

use crate::backup;
use crate::config::{self, Rules};
use crate::error::{Error, Result, ResultExt};
use crate::migration::{
    MigrationType, VolumeSourceArgs, VolumeTargetArgs,
};
use crate::op::Operation;
use crate::revert::Revert;
use crate::stream::ReadWrite;
use crate::volume::{ContentType, Volume, VolumeType};

use super::generic;
use super::{CommonDriver, Driver, Info, VolumeFiller};

pub struct DirDriver {
    common: CommonDriver,
}

impl DirDriver {
    pub fn new(common: CommonDriver) -> Self {
        Self { common }
    }

    fn source_path(&self) -> Option<PathBuf> {
        self.common
            .config()
            .get("source")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    fn path_is_mounted(&self, path: &std::path::Path) -> bool {
        let path = path.to_string_lossy().into_owned();
        self.common.runner().run("mountpoint", &["-q", &path]).is_ok()
    }
}

impl Driver for DirDriver {
    fn info(&self) -> Info {
        Info {
            name: "dir",
            version: "1".to_string(),
            volume_types: vec![
                VolumeType::Container,
                VolumeType::Vm,
                VolumeType::Image,
                VolumeType::Custom,
                VolumeType::Bucket,
            ],
            remote: false,
            optimized_images: false,
            optimized_backups: false,
            volume_multi_node: false,
            block_backing: false,
            preserves_inodes: false,
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
        if !source.is_dir() {
            return Err(Error::NotFound(format!(
                "source path {}",
                source.display()
            )));
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

    fn validate_volume(
        &self,
        vol: &mut Volume,
        remove_unknown: bool,
    ) -> Result<()> {
        let rules = self.volume_config_rules(vol);
        config::validate(vol.config_mut(), &rules, remove_unknown)?;
        if vol.vol_type() == VolumeType::Bucket
            && vol.config().contains_key("size")
        {
            return Err(Error::ConfigInvalid(vec![
                "size: not supported for buckets".to_string(),
            ]));
        }
        Ok(())
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

        let mut revert = Revert::new();
        vol.ensure_mount_path()?;
        {
            let vol_path = vol_path.clone();
            revert.add(move || {
                let _ = fs::remove_dir_all(&vol_path);
            });
        }

        let is_block = vol.content_type() != ContentType::Filesystem;
        let fill_target = if is_block {
            self.get_volume_disk_path(vol)?
        } else {
            vol_path.clone()
        };

        if let Some(filler) = filler {
            (filler.fill)(vol, &fill_target)
                .context("fill volume", vol.name().to_string())?;
        }

        if is_block {
            // The filler may well have grown the image beyond the
            // configured size already; that is not an error.
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

        let vol_path = vol.mount_path();
        if vol_path.exists() {
            fs::remove_dir_all(&vol_path)
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
        allow_inconsistent: bool,
        op: &Operation,
    ) -> Result<()> {
        let src_snapshots = if copy_snapshots && !src.is_snapshot() {
            self.volume_snapshots(src, op)?
        } else {
            Vec::new()
        };
        generic::vfs_copy_volume(
            self,
            vol,
            src,
            &src_snapshots,
            false,
            allow_inconsistent,
            op,
        )
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

        // Plain directories carry no enforceable filesystem quota, so a
        // size change on filesystem content only updates accounting.
        debug!(self.common.log(), "quota noted without enforcement";
            "volume" => vol.name(), "size" => size_bytes);
        Ok(())
    }

    fn get_volume_usage(&self, vol: &Volume) -> Result<i64> {
        if vol.is_snapshot() {
            return Err(Error::NotSupported);
        }
        generic::tree_size_bytes(&vol.mount_path())
    }

    fn mount_volume(&self, vol: &Volume, _op: &Operation) -> Result<()> {
        let _guard = vol.mount_lock();

        // Keep the permissions a user may have set on an existing
        // custom volume root.
        if !vol.mount_path().exists()
            || vol.vol_type() != VolumeType::Custom
        {
            vol.ensure_mount_path()?;
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

        // Nothing is physically mounted for directory volumes.
        Ok(false)
    }

    fn create_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<()> {
        let parent = snap.parent();

        snap.ensure_mount_path()?;
        let mut revert = Revert::new();
        let snap_path = snap.mount_path();
        {
            let snap_path = snap_path.clone();
            revert.add(move || {
                let _ = fs::remove_dir_all(&snap_path);
            });
        }

        generic::copy_tree(&parent.mount_path(), &snap_path, true)
            .context("snapshot volume", snap.name().to_string())?;

        revert.success();
        Ok(())
    }

    fn delete_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<()> {
        let snap_path = snap.mount_path();
        match fs::remove_dir_all(&snap_path) {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => {
                return Err(Error::from(e)
                    .context("remove snapshot", snap.name().to_string()))
            }
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
        let snap_path = snap.mount_path();
        if !snap_path.exists() {
            return Err(Error::NotFound(format!(
                "snapshot {snapshot_name}"
            )));
        }

        generic::copy_tree(&snap_path, &vol.mount_path(), true)
            .context("restore volume", vol.name().to_string())
    }

    fn migration_types(
        &self,
        content_type: ContentType,
        _refresh: bool,
        _copy_snapshots: bool,
        _cluster_move: bool,
        _storage_move: bool,
    ) -> Vec<MigrationType> {
        let features = generic::byte_stream_features(&self.common, true);
        let fs_type = if content_type == ContentType::Filesystem {
            FsType::Rsync
        } else {
            FsType::BlockAndRsync
        };
        vec![MigrationType { fs_type, features }]
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
        if optimized {
            return Err(Error::NotSupported);
        }
        generic::vfs_backup_volume(self, vol, dest, snapshots, op)
    }

    fn create_volume_from_backup(
        &self,
        vol: &Volume,
        info: &backup::Info,
        data: &mut (dyn Read + Send),
        op: &Operation,
    ) -> Result<()> {
        if info.optimized {
            return Err(Error::NotSupported);
        }
        generic::vfs_create_volume_from_backup(self, vol, info, data, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_logger, RecordingRunner};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use uuid::Uuid;

    // Pool names are unique per test: mount reference counts are keyed
    // by volume identity process-wide.
    fn test_driver(root: &std::path::Path) -> DirDriver {
        DirDriver::new(CommonDriver::new(
            format!("pool-{}", Uuid::new_v4()),
            BTreeMap::new(),
            root,
            test_logger(),
            Arc::new(RecordingRunner::new()),
        ))
    }

    fn custom_fs_volume(d: &DirDriver, name: &str) -> Volume {
        d.common().new_volume(
            VolumeType::Custom,
            ContentType::Filesystem,
            name,
            BTreeMap::new(),
        )
    }

    #[test]
    fn create_volume_twice_reports_conflict() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let vol = custom_fs_volume(&d, "vol1");
        let op = Operation::new();

        d.create_volume(&vol, None, &op).unwrap();
        let err = d.create_volume(&vol, None, &op).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn failed_filler_leaves_no_volume_behind() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let vol = custom_fs_volume(&d, "vol1");
        let op = Operation::new();

        let mut filler = VolumeFiller {
            fill: Box::new(|_, _| {
                Err(Error::Protocol("image stream broke".into()))
            }),
            fingerprint: None,
        };
        let err =
            d.create_volume(&vol, Some(&mut filler), &op).unwrap_err();
        assert!(err.to_string().contains("image stream broke"));
        assert!(!vol.mount_path().exists());
    }

    #[test]
    fn block_volume_gets_sized_image_file() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let mut config = BTreeMap::new();
        config.insert("size".to_string(), "1MiB".to_string());
        let vol = d.common().new_volume(
            VolumeType::Custom,
            ContentType::Block,
            "blk1",
            config,
        );
        let op = Operation::new();

        d.create_volume(&vol, None, &op).unwrap();
        let disk = d.get_volume_disk_path(&vol).unwrap();
        assert_eq!(fs::metadata(&disk).unwrap().len(), 1024 * 1024);
    }

    #[test]
    fn delete_with_snapshots_requires_cascade() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let vol = custom_fs_volume(&d, "vol1");
        let op = Operation::new();

        d.create_volume(&vol, None, &op).unwrap();
        fs::write(vol.mount_path().join("data"), b"v1").unwrap();
        d.create_volume_snapshot(&vol.new_snapshot("snap0").unwrap(), &op)
            .unwrap();

        let err = d.delete_volume(&vol, &op).unwrap_err();
        match err {
            Error::RequiresCascade(names) => {
                assert_eq!(names, vec!["snap0".to_string()])
            }
            other => panic!("unexpected error {other:?}"),
        }

        d.delete_volume_snapshot(
            &vol.new_snapshot("snap0").unwrap(),
            &op,
        )
        .unwrap();
        d.delete_volume(&vol, &op).unwrap();
        assert!(!vol.mount_path().exists());
    }

    #[test]
    fn snapshots_capture_and_restore_state() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let vol = custom_fs_volume(&d, "vol1");
        let op = Operation::new();

        d.create_volume(&vol, None, &op).unwrap();
        fs::write(vol.mount_path().join("data"), b"first").unwrap();
        d.create_volume_snapshot(&vol.new_snapshot("s1").unwrap(), &op)
            .unwrap();

        fs::write(vol.mount_path().join("data"), b"second").unwrap();
        fs::write(vol.mount_path().join("extra"), b"later").unwrap();
        d.create_volume_snapshot(&vol.new_snapshot("s2").unwrap(), &op)
            .unwrap();

        assert_eq!(
            d.volume_snapshots(&vol, &op).unwrap(),
            vec!["s1".to_string(), "s2".to_string()]
        );

        d.restore_volume(&vol, "s1", &op).unwrap();
        assert_eq!(
            fs::read(vol.mount_path().join("data")).unwrap(),
            b"first"
        );
        assert!(!vol.mount_path().join("extra").exists());
    }

    #[test]
    fn restore_of_unknown_snapshot_reports_not_found() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let vol = custom_fs_volume(&d, "vol1");
        let op = Operation::new();

        d.create_volume(&vol, None, &op).unwrap();
        let err = d.restore_volume(&vol, "nope", &op).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn unmount_while_referenced_reports_in_use() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let vol = custom_fs_volume(&d, "vol1");
        let op = Operation::new();

        d.create_volume(&vol, None, &op).unwrap();
        d.mount_volume(&vol, &op).unwrap();
        d.mount_volume(&vol, &op).unwrap();

        let err = d.unmount_volume(&vol, false, &op).unwrap_err();
        assert!(err.is_in_use());
        assert!(!d.unmount_volume(&vol, false, &op).unwrap());
    }

    #[test]
    fn quota_on_block_volume_resizes_image() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let mut config = BTreeMap::new();
        config.insert("size".to_string(), "4KiB".to_string());
        let vol = d.common().new_volume(
            VolumeType::Custom,
            ContentType::Block,
            "blk1",
            config,
        );
        let op = Operation::new();
        d.create_volume(&vol, None, &op).unwrap();
        let disk = d.get_volume_disk_path(&vol).unwrap();

        // Zero size is a no-op for block content.
        d.set_volume_quota(&vol, "0", false, &op).unwrap();
        assert_eq!(fs::metadata(&disk).unwrap().len(), 4096);

        d.set_volume_quota(&vol, "8KiB", false, &op).unwrap();
        assert_eq!(fs::metadata(&disk).unwrap().len(), 8192);

        let err = d.set_volume_quota(&vol, "4KiB", false, &op).unwrap_err();
        assert!(matches!(err, Error::CannotShrink));

        d.set_volume_quota(&vol, "4KiB", true, &op).unwrap();
        assert_eq!(fs::metadata(&disk).unwrap().len(), 4096);
    }

    #[test]
    fn usage_counts_file_bytes() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let vol = custom_fs_volume(&d, "vol1");
        let op = Operation::new();

        d.create_volume(&vol, None, &op).unwrap();
        fs::write(vol.mount_path().join("a"), vec![0u8; 300]).unwrap();
        fs::write(vol.mount_path().join("b"), vec![0u8; 200]).unwrap();
        assert_eq!(d.get_volume_usage(&vol).unwrap(), 500);

        let snap = vol.new_snapshot("s1").unwrap();
        assert!(matches!(
            d.get_volume_usage(&snap).unwrap_err(),
            Error::NotSupported
        ));
    }

    #[test]
    fn copy_volume_carries_snapshots() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let op = Operation::new();

        let src = custom_fs_volume(&d, "src");
        d.create_volume(&src, None, &op).unwrap();
        fs::write(src.mount_path().join("data"), b"old").unwrap();
        d.create_volume_snapshot(&src.new_snapshot("s1").unwrap(), &op)
            .unwrap();
        fs::write(src.mount_path().join("data"), b"new").unwrap();

        let dst = custom_fs_volume(&d, "dst");
        d.create_volume_from_copy(&dst, &src, true, false, &op).unwrap();

        assert_eq!(
            fs::read(dst.mount_path().join("data")).unwrap(),
            b"new"
        );
        assert_eq!(
            d.volume_snapshots(&dst, &op).unwrap(),
            vec!["s1".to_string()]
        );
        let dst_snap = dst.new_snapshot("s1").unwrap();
        assert_eq!(
            fs::read(dst_snap.mount_path().join("data")).unwrap(),
            b"old"
        );
    }

    #[test]
    fn migration_round_trip_between_pools() {
        let root = tempfile::tempdir().unwrap();
        let src_d = test_driver(root.path());
        let dst_d = test_driver(root.path());
        let op = Operation::new();

        let src = custom_fs_volume(&src_d, "vol1");
        src_d.create_volume(&src, None, &op).unwrap();
        fs::write(src.mount_path().join("payload"), b"travels").unwrap();
        src_d
            .create_volume_snapshot(&src.new_snapshot("s1").unwrap(), &op)
            .unwrap();

        let offered =
            src_d.migration_types(ContentType::Filesystem, false, true, false, false);
        let migration_type = offered[0].clone();

        // The byte-stream transport acknowledges each file, so both
        // ends must run concurrently over a real socket.
        let (mut a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
        let src_args = VolumeSourceArgs {
            name: "vol1".to_string(),
            snapshots: vec!["s1".to_string()],
            migration_type: migration_type.clone(),
            ..Default::default()
        };
        let sender = std::thread::spawn(move || {
            let op = Operation::new();
            src_d.migrate_volume(&src, &mut a, &src_args, &op)
        });

        let dst = custom_fs_volume(&dst_d, "vol1");
        let dst_args = VolumeTargetArgs {
            name: "vol1".to_string(),
            snapshots: vec!["s1".to_string()],
            migration_type,
            ..Default::default()
        };
        dst_d
            .create_volume_from_migration(&dst, &mut b, &dst_args, &op)
            .unwrap();
        sender.join().unwrap().unwrap();

        assert_eq!(
            fs::read(dst.mount_path().join("payload")).unwrap(),
            b"travels"
        );
        assert_eq!(
            dst_d.volume_snapshots(&dst, &op).unwrap(),
            vec!["s1".to_string()]
        );
    }

    #[test]
    fn backup_round_trip_restores_volume_and_snapshots() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let op = Operation::new();

        let vol = custom_fs_volume(&d, "vol1");
        d.create_volume(&vol, None, &op).unwrap();
        fs::write(vol.mount_path().join("data"), b"old").unwrap();
        d.create_volume_snapshot(&vol.new_snapshot("s1").unwrap(), &op)
            .unwrap();
        fs::write(vol.mount_path().join("data"), b"current").unwrap();

        let mut archive = Vec::new();
        d.backup_volume(&vol, &mut archive, false, &["s1".to_string()], &op)
            .unwrap();

        let info = backup::read_info(archive.as_slice()).unwrap();
        assert_eq!(info.snapshots, vec!["s1".to_string()]);

        let restored = custom_fs_volume(&d, "restored");
        d.create_volume_from_backup(
            &restored,
            &info,
            &mut archive.as_slice(),
            &op,
        )
        .unwrap();

        assert_eq!(
            fs::read(restored.mount_path().join("data")).unwrap(),
            b"current"
        );
        let snap = restored.new_snapshot("s1").unwrap();
        assert_eq!(
            fs::read(snap.mount_path().join("data")).unwrap(),
            b"old"
        );
    }

    #[test]
    fn optimized_backup_is_not_supported() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let vol = custom_fs_volume(&d, "vol1");
        let op = Operation::new();
        let mut sink = Vec::new();
        let err = d
            .backup_volume(&vol, &mut sink, true, &[], &op)
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported));
    }

    #[test]
    fn offers_byte_stream_for_filesystem_and_block() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());

        let fs_types =
            d.migration_types(ContentType::Filesystem, false, false, false, false);
        assert_eq!(fs_types[0].fs_type, FsType::Rsync);
        assert!(fs_types[0]
            .features
            .contains(&"compress".to_string()));

        let block_types =
            d.migration_types(ContentType::Block, false, false, false, false);
        assert_eq!(block_types[0].fs_type, FsType::BlockAndRsync);
    }

    #[test]
    fn list_volumes_reports_types_and_content() {
        let root = tempfile::tempdir().unwrap();
        let d = test_driver(root.path());
        let op = Operation::new();

        let fs_vol = custom_fs_volume(&d, "plain");
        d.create_volume(&fs_vol, None, &op).unwrap();
        let mut config = BTreeMap::new();
        config.insert("size".to_string(), "4KiB".to_string());
        let blk_vol = d.common().new_volume(
            VolumeType::Custom,
            ContentType::Block,
            "raw",
            config,
        );
        d.create_volume(&blk_vol, None, &op).unwrap();

        let mut listed = d.list_volumes().unwrap();
        listed.sort_by(|a, b| a.name().cmp(b.name()));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name(), "plain");
        assert_eq!(listed[0].content_type(), ContentType::Filesystem);
        assert_eq!(listed[1].name(), "raw");
        assert_eq!(listed[1].content_type(), ContentType::Block);
    }
}
