// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The storage backend contract.
//!
//! One [`Driver`] implementation per backend technology presents the
//! same volume surface over very different primitives. Backends compose
//! [`CommonDriver`] for the shared pool plumbing and lean on the
//! [`generic`] helpers for everything expressible through a mounted
//! path, overriding only what their native tooling does better.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::backup;
use crate::cmd::Runner;
use crate::config::{self, Rules};
use crate::error::{Error, Result};
use crate::migration::{MigrationType, VolumeSourceArgs, VolumeTargetArgs};
use crate::op::Operation;
use crate::stream::ReadWrite;
use crate::volume::{
    ContentType, Volume, VolumeType, DEFAULT_FILESYSTEM,
};

pub mod btrfs;
pub mod dir;
pub mod drbd;
pub mod generic;
pub mod nfs;
pub mod rbd;

pub use btrfs::BtrfsDriver;
pub use dir::DirDriver;
pub use drbd::DrbdDriver;
pub use nfs::NfsDriver;
pub use rbd::RbdDriver;

/// File name of the raw image inside a block volume's directory.
pub const BLOCK_FILE_NAME: &str = "root.img";

/// Static capability descriptor for one backend.
#[derive(Clone, Debug)]
pub struct Info {
    pub name: &'static str,
    pub version: String,
    pub volume_types: Vec<VolumeType>,
    /// Data lives off-host and survives this member.
    pub remote: bool,
    /// Images clone natively instead of being copied byte by byte.
    pub optimized_images: bool,
    /// Backups can embed a backend-native stream.
    pub optimized_backups: bool,
    /// Several cluster members may mount one volume concurrently.
    pub volume_multi_node: bool,
    /// Volumes are raw block objects rather than host directories.
    pub block_backing: bool,
    pub preserves_inodes: bool,
    /// Pool removal needs an explicit deactivate step first.
    pub deactivate: bool,
    pub buckets: bool,
}

/// Pool-level space accounting, in bytes and inodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolResources {
    pub space_total: u64,
    pub space_used: u64,
    pub inodes_total: u64,
    pub inodes_used: u64,
}

/// Content source for a freshly created volume, e.g. an image unpacker.
/// `fill` receives the volume and, for block content, the path of the
/// raw image file to fill; it returns the number of bytes written.
pub struct VolumeFiller<'a> {
    pub fill: Box<dyn FnMut(&Volume, &std::path::Path) -> Result<i64> + Send + 'a>,
    pub fingerprint: Option<String>,
}

/// Shared plumbing every backend composes: pool identity, validated
/// pool config, the host command runner and the pool-scoped logger.
pub struct CommonDriver {
    pool_name: String,
    config: BTreeMap<String, String>,
    storage_root: PathBuf,
    log: slog::Logger,
    runner: Arc<dyn Runner>,
}

impl CommonDriver {
    pub fn new(
        pool_name: impl Into<String>,
        config: BTreeMap<String, String>,
        storage_root: impl Into<PathBuf>,
        log: slog::Logger,
        runner: Arc<dyn Runner>,
    ) -> Self {
        let pool_name = pool_name.into();
        let log = log.new(slog::o!("pool" => pool_name.clone()));
        Self {
            pool_name,
            config,
            storage_root: storage_root.into(),
            log,
            runner,
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn config(&self) -> &BTreeMap<String, String> {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.config
    }

    pub fn storage_root(&self) -> &std::path::Path {
        &self.storage_root
    }

    pub fn log(&self) -> &slog::Logger {
        &self.log
    }

    pub fn runner(&self) -> &dyn Runner {
        self.runner.as_ref()
    }

    /// Where this pool mounts on the host.
    pub fn pool_mount_path(&self) -> PathBuf {
        self.storage_root.join(&self.pool_name)
    }

    /// Builds a [`Volume`] belonging to this pool.
    pub fn new_volume(
        &self,
        vol_type: VolumeType,
        content_type: ContentType,
        name: impl Into<String>,
        config: BTreeMap<String, String>,
    ) -> Volume {
        Volume::new(
            self.storage_root.clone(),
            self.pool_name.clone(),
            vol_type,
            content_type,
            name,
            config,
            Arc::new(self.config.clone()),
        )
    }

    /// Fills the block-content defaults every backend agrees on.
    pub fn fill_block_defaults(&self, vol: &mut Volume) {
        if vol.content_type() != ContentType::Block && !vol.is_vm_block() {
            return;
        }
        let config = vol.config_mut();
        config
            .entry("block.filesystem".to_string())
            .or_insert_with(|| DEFAULT_FILESYSTEM.to_string());
        config
            .entry("block.mount_options".to_string())
            .or_insert_with(|| "discard".to_string());
    }
}

/// The uniform storage contract.
///
/// Backend-specific methods are required; anything expressible through
/// a mounted path defaults to the [`generic`] virtual-filesystem
/// implementation so new backends start functional and override
/// incrementally.
pub trait Driver: Send + Sync {
    fn info(&self) -> Info;
    fn common(&self) -> &CommonDriver;
    fn common_mut(&mut self) -> &mut CommonDriver;

    /// Validation rules for pool-level config keys.
    fn config_rules(&self) -> Rules;

    /// Validation rules for volume-level config keys.
    fn volume_config_rules(&self, vol: &Volume) -> Rules;

    // Pool lifecycle.

    fn create(&mut self, op: &Operation) -> Result<()>;
    fn delete(&mut self, op: &Operation) -> Result<()>;
    fn mount(&mut self) -> Result<bool>;
    fn unmount(&mut self) -> Result<bool>;

    fn validate(&self, pool_config: &mut BTreeMap<String, String>) -> Result<()> {
        config::validate(pool_config, &self.config_rules(), false)
    }

    fn update(&mut self, changed: &BTreeMap<String, String>) -> Result<()> {
        let mut merged = self.common().config().clone();
        for (key, value) in changed {
            if value.is_empty() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        self.validate(&mut merged)?;
        *self.common_mut().config_mut() = merged;
        Ok(())
    }

    fn get_resources(&self) -> Result<PoolResources> {
        generic::statvfs_resources(&self.common().pool_mount_path())
    }

    // Volume CRUD.

    fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&mut VolumeFiller<'_>>,
        op: &Operation,
    ) -> Result<()>;

    fn delete_volume(&self, vol: &Volume, op: &Operation) -> Result<()>;

    fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src: &Volume,
        copy_snapshots: bool,
        allow_inconsistent: bool,
        op: &Operation,
    ) -> Result<()>;

    fn set_volume_quota(
        &self,
        vol: &Volume,
        size: &str,
        allow_unsafe_resize: bool,
        op: &Operation,
    ) -> Result<()>;

    fn get_volume_usage(&self, vol: &Volume) -> Result<i64>;

    fn mount_volume(&self, vol: &Volume, op: &Operation) -> Result<()>;

    fn unmount_volume(
        &self,
        vol: &Volume,
        keep_block_dev: bool,
        op: &Operation,
    ) -> Result<bool>;

    fn fill_volume_config(&self, vol: &mut Volume) -> Result<()> {
        self.common().fill_block_defaults(vol);
        Ok(())
    }

    fn validate_volume(&self, vol: &mut Volume, remove_unknown: bool) -> Result<()> {
        let rules = self.volume_config_rules(vol);
        config::validate(vol.config_mut(), &rules, remove_unknown)
    }

    fn has_volume(&self, vol: &Volume) -> Result<bool> {
        generic::vfs_has_volume(vol)
    }

    fn update_volume(
        &self,
        vol: &Volume,
        changed: &BTreeMap<String, String>,
    ) -> Result<()> {
        if let Some(size) = changed.get("size") {
            self.set_volume_quota(vol, size, false, &Operation::new())?;
        }
        Ok(())
    }

    fn rename_volume(
        &self,
        vol: &Volume,
        new_name: &str,
        op: &Operation,
    ) -> Result<()> {
        generic::vfs_rename_volume(self.common(), vol, new_name, op)
    }

    fn get_volume_disk_path(&self, vol: &Volume) -> Result<PathBuf> {
        generic::vfs_disk_path(vol)
    }

    fn list_volumes(&self) -> Result<Vec<Volume>> {
        generic::vfs_list_volumes(self.common())
    }

    // Snapshots.

    fn create_volume_snapshot(&self, snap: &Volume, op: &Operation) -> Result<()>;

    fn delete_volume_snapshot(&self, snap: &Volume, op: &Operation) -> Result<()>;

    fn restore_volume(
        &self,
        vol: &Volume,
        snapshot_name: &str,
        op: &Operation,
    ) -> Result<()>;

    fn mount_volume_snapshot(&self, snap: &Volume, _op: &Operation) -> Result<()> {
        let _guard = snap.mount_lock();
        if !snap.mount_path().exists() {
            return Err(Error::NotFound(format!(
                "snapshot {}",
                snap.name()
            )));
        }
        snap.mount_ref_count_increment();
        Ok(())
    }

    fn unmount_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<bool> {
        let _guard = snap.mount_lock();
        if snap.mount_ref_count_decrement() > 0 {
            return Err(Error::InUse);
        }
        Ok(false)
    }

    fn volume_snapshots(&self, vol: &Volume, op: &Operation) -> Result<Vec<String>> {
        generic::vfs_volume_snapshots(vol, op)
    }

    fn rename_volume_snapshot(
        &self,
        snap: &Volume,
        new_snap_name: &str,
        op: &Operation,
    ) -> Result<()> {
        generic::vfs_rename_volume_snapshot(self.common(), snap, new_snap_name, op)
    }

    // Migration and backup.

    fn migration_types(
        &self,
        content_type: ContentType,
        refresh: bool,
        copy_snapshots: bool,
        cluster_move: bool,
        storage_move: bool,
    ) -> Vec<MigrationType>;

    /// Sends `vol` to the peer using the negotiated transport in
    /// `args`. Backends without a native stream delegate to
    /// [`generic::vfs_migrate_volume`].
    fn migrate_volume(
        &self,
        vol: &Volume,
        conn: &mut dyn ReadWrite,
        args: &VolumeSourceArgs,
        op: &Operation,
    ) -> Result<()>;

    fn create_volume_from_migration(
        &self,
        vol: &Volume,
        conn: &mut dyn ReadWrite,
        args: &VolumeTargetArgs,
        op: &Operation,
    ) -> Result<()>;

    /// Incrementally synchronizes `vol` from `src` on the same host.
    fn refresh_volume(
        &self,
        vol: &Volume,
        src: &Volume,
        refresh_snapshots: &[String],
        allow_inconsistent: bool,
        op: &Operation,
    ) -> Result<()>;

    fn backup_volume(
        &self,
        vol: &Volume,
        dest: &mut dyn Write,
        optimized: bool,
        snapshots: &[String],
        op: &Operation,
    ) -> Result<()>;

    fn create_volume_from_backup(
        &self,
        vol: &Volume,
        info: &backup::Info,
        data: &mut (dyn Read + Send),
        op: &Operation,
    ) -> Result<()>;

    /// Populates the usage cache for `vol`'s whole snapshot family in
    /// one backend call. Backends without bulk accounting keep the
    /// default no-op and answer usage queries directly.
    fn cache_volume_snapshots(&self, _vol: &Volume) -> Result<()> {
        Ok(())
    }
}
