// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The volume data model shared by all drivers.
//!
//! A [`Volume`] identifies one logical storage object: pool, type,
//! content type and name, plus its config map layered over pool-level
//! defaults. Snapshots are volumes whose name encodes the parent as
//! `parent/snap`. Mount state is process-local bookkeeping keyed by the
//! volume's identity, never persisted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::locking::{self, OpLockGuard};
use crate::units::parse_byte_size;

/// Separator between a parent volume name and a snapshot name.
pub const SNAPSHOT_DELIMITER: &str = "/";

/// Filesystem used for block volumes when the config does not pick one.
pub const DEFAULT_FILESYSTEM: &str = "ext4";

/// Prefix marking backend objects renamed aside for deferred deletion.
pub const ZOMBIE_PREFIX: &str = "zombie_";

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
pub enum VolumeType {
    #[strum(serialize = "containers")]
    #[serde(rename = "containers")]
    Container,
    #[strum(serialize = "virtual-machines")]
    #[serde(rename = "virtual-machines")]
    Vm,
    #[strum(serialize = "images")]
    #[serde(rename = "images")]
    Image,
    #[strum(serialize = "custom")]
    #[serde(rename = "custom")]
    Custom,
    #[strum(serialize = "buckets")]
    #[serde(rename = "buckets")]
    Bucket,
    /// Placeholder type for internal bookkeeping objects, guaranteed not
    /// to collide with any user-visible volume.
    #[strum(serialize = "internal")]
    #[serde(rename = "internal")]
    Internal,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[strum(serialize = "filesystem")]
    Filesystem,
    #[strum(serialize = "block")]
    Block,
    #[strum(serialize = "iso")]
    Iso,
}

/// Checks the volume-type/content-type pairing invariants: block content
/// is limited to custom, image and VM volumes, and buckets only ever
/// carry filesystem content.
pub fn check_content_type(
    vol_type: VolumeType,
    content_type: ContentType,
) -> Result<()> {
    let ok = match content_type {
        ContentType::Filesystem => true,
        ContentType::Block => matches!(
            vol_type,
            VolumeType::Custom | VolumeType::Image | VolumeType::Vm
        ),
        ContentType::Iso => {
            matches!(vol_type, VolumeType::Custom | VolumeType::Image)
        }
    };
    if !ok {
        return Err(Error::ConfigInvalid(vec![format!(
            "content type {content_type} not allowed for {vol_type} volumes"
        )]));
    }
    Ok(())
}

pub fn is_snapshot_name(name: &str) -> bool {
    name.contains(SNAPSHOT_DELIMITER)
}

/// Splits `parent/snap` into `("parent", Some("snap"))`; names without a
/// delimiter come back as `(name, None)`.
pub fn split_snapshot_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(SNAPSHOT_DELIMITER) {
        Some((parent, snap)) => (parent, Some(snap)),
        None => (name, None),
    }
}

pub fn join_snapshot_name(parent: &str, snap: &str) -> String {
    format!("{parent}{SNAPSHOT_DELIMITER}{snap}")
}

/// Builds the rename target for an object that must be kept for its
/// clones: the reserved prefix plus a fresh unique suffix.
pub fn zombie_object_name(base: &str) -> String {
    format!("{ZOMBIE_PREFIX}{base}_{}", Uuid::new_v4())
}

pub fn is_zombie_object_name(name: &str) -> bool {
    name.starts_with(ZOMBIE_PREFIX)
}

/// Name for a transient snapshot supporting a copy in flight.
pub fn temp_copy_snapshot_name() -> String {
    format!("copy-{}", Uuid::new_v4())
}

/// Name for a snapshot logically deleted but retained for its clones.
pub fn deleted_snapshot_name() -> String {
    format!("deleted-{}", Uuid::new_v4())
}

pub fn is_transient_snapshot_name(name: &str) -> bool {
    name.starts_with("copy-") || name.starts_with("deleted-")
}

#[derive(Clone, Debug)]
pub struct Volume {
    pool: String,
    vol_type: VolumeType,
    content_type: ContentType,
    name: String,
    config: BTreeMap<String, String>,
    pool_config: Arc<BTreeMap<String, String>>,
    storage_root: PathBuf,
    has_source: bool,
    custom_mount_path: Option<PathBuf>,
}

impl Volume {
    pub fn new(
        storage_root: impl Into<PathBuf>,
        pool: impl Into<String>,
        vol_type: VolumeType,
        content_type: ContentType,
        name: impl Into<String>,
        config: BTreeMap<String, String>,
        pool_config: Arc<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            pool: pool.into(),
            vol_type,
            content_type,
            name: name.into(),
            config,
            pool_config,
            storage_root: storage_root.into(),
            has_source: false,
            custom_mount_path: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn vol_type(&self) -> VolumeType {
        self.vol_type
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn config(&self) -> &BTreeMap<String, String> {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.config
    }

    pub fn pool_config(&self) -> &BTreeMap<String, String> {
        &self.pool_config
    }

    pub fn storage_root(&self) -> &PathBuf {
        &self.storage_root
    }

    /// Marks this volume as created from an externally supplied source
    /// (copy, migration, backup) rather than freshly provisioned.
    pub fn set_has_source(&mut self, has_source: bool) {
        self.has_source = has_source;
    }

    pub fn has_source(&self) -> bool {
        self.has_source
    }

    /// Overrides the mount location, used for custom volumes mounted at
    /// a caller-chosen path.
    pub fn set_custom_mount_path(&mut self, path: Option<PathBuf>) {
        self.custom_mount_path = path;
    }

    pub fn is_snapshot(&self) -> bool {
        is_snapshot_name(&self.name)
    }

    /// Splits the name into parent and optional snapshot part.
    pub fn split_name(&self) -> (&str, Option<&str>) {
        split_snapshot_name(&self.name)
    }

    pub fn snapshot_name(&self) -> Option<&str> {
        self.split_name().1
    }

    pub fn is_vm_block(&self) -> bool {
        self.vol_type == VolumeType::Vm
            && self.content_type == ContentType::Block
    }

    /// Returns the snapshot volume `self/<snap>`. Fails on a volume that
    /// already is a snapshot.
    pub fn new_snapshot(&self, snap: &str) -> Result<Volume> {
        if self.is_snapshot() {
            return Err(Error::ConfigInvalid(vec![format!(
                "cannot take a snapshot of snapshot {:?}",
                self.name
            )]));
        }
        let mut vol = self.clone();
        vol.name = join_snapshot_name(&self.name, snap);
        Ok(vol)
    }

    /// Returns the parent volume of a snapshot, or a clone of self for a
    /// non-snapshot volume.
    pub fn parent(&self) -> Volume {
        let (parent, _) = self.split_name();
        let mut vol = self.clone();
        vol.name = parent.to_string();
        vol
    }

    /// Returns the auxiliary filesystem volume paired with a VM block
    /// volume, holding non-block metadata. Same name, filesystem
    /// content; the size key does not carry over since the config volume
    /// has its own default size.
    pub fn new_vm_block_filesystem_volume(&self) -> Volume {
        let mut vol = self.clone();
        vol.content_type = ContentType::Filesystem;
        vol.config.remove("size");
        vol
    }

    /// The host path this volume is (or would be) mounted at:
    /// `<root>/<pool>/<type>/<name>`, with snapshots under a parallel
    /// `<type>-snapshots/<parent>/<snap>` tree.
    pub fn mount_path(&self) -> PathBuf {
        if let Some(path) = &self.custom_mount_path {
            return path.clone();
        }
        let type_dir: &'static str = self.vol_type.into();
        match self.split_name() {
            (parent, Some(snap)) => self
                .storage_root
                .join(&self.pool)
                .join(format!("{type_dir}-snapshots"))
                .join(parent)
                .join(snap),
            (name, None) => {
                self.storage_root.join(&self.pool).join(type_dir).join(name)
            }
        }
    }

    /// Creates the mount path if missing. Instance volumes get a
    /// traversal-only mode so unprivileged users cannot list foreign
    /// volumes; custom volumes stay browsable.
    pub fn ensure_mount_path(&self) -> Result<()> {
        let path = self.mount_path();
        std::fs::create_dir_all(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if self.vol_type == VolumeType::Custom {
                0o755
            } else {
                0o711
            };
            std::fs::set_permissions(
                &path,
                std::fs::Permissions::from_mode(mode),
            )?;
        }
        Ok(())
    }

    /// Directory holding all snapshot mount points of this volume.
    pub fn snapshots_dir(&self) -> PathBuf {
        let type_dir: &'static str = self.vol_type.into();
        let (parent, _) = self.split_name();
        self.storage_root
            .join(&self.pool)
            .join(format!("{type_dir}-snapshots"))
            .join(parent)
    }

    /// Looks up a config key, falling back to the pool-level
    /// `volume.<key>` default.
    pub fn expanded_config(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.config.get(key) {
            return Some(value);
        }
        self.pool_config.get(&format!("volume.{key}")).map(String::as_str)
    }

    /// The configured size in bytes, zero when unset.
    pub fn config_size(&self) -> Result<i64> {
        match self.expanded_config("size") {
            Some(value) => parse_byte_size(value)
                .map_err(|msg| Error::ConfigInvalid(vec![format!("size: {msg}")])),
            None => Ok(0),
        }
    }

    pub fn config_block_filesystem(&self) -> String {
        self.expanded_config("block.filesystem")
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_FILESYSTEM)
            .to_string()
    }

    pub fn config_block_mount_options(&self) -> String {
        self.expanded_config("block.mount_options")
            .filter(|v| !v.is_empty())
            .unwrap_or("discard")
            .to_string()
    }

    fn identity(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.pool, self.vol_type, self.content_type, self.name
        )
    }

    /// Acquires the advisory lock serializing mount and unmount of this
    /// volume identity.
    pub fn mount_lock(&self) -> OpLockGuard {
        locking::lock(&locking::op_lock_name(
            "Mount",
            &self.pool,
            self.vol_type.into(),
            self.content_type.into(),
            &self.name,
        ))
    }

    pub fn mount_ref_count_increment(&self) -> u32 {
        locking::ref_count_increment(&self.identity())
    }

    pub fn mount_ref_count_decrement(&self) -> u32 {
        locking::ref_count_decrement(&self.identity())
    }

    pub fn mount_in_use(&self) -> bool {
        locking::ref_count(&self.identity()) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_volume;

    #[test]
    fn snapshot_name_round_trip() {
        for name in ["web/hourly-0", "db/before upgrade", "v/s/with-slash"] {
            let (parent, snap) = split_snapshot_name(name);
            assert_eq!(join_snapshot_name(parent, snap.unwrap()), name);
        }
        let (parent, snap) = split_snapshot_name("plain");
        assert_eq!(parent, "plain");
        assert_eq!(snap, None);
    }

    #[test]
    fn snapshot_volume_derivation() {
        let vol = test_volume("web", VolumeType::Custom, ContentType::Filesystem);
        let snap = vol.new_snapshot("hourly-0").unwrap();
        assert!(snap.is_snapshot());
        assert_eq!(snap.name(), "web/hourly-0");
        assert_eq!(snap.snapshot_name(), Some("hourly-0"));
        assert_eq!(snap.parent().name(), "web");
        assert!(snap.new_snapshot("again").is_err());
    }

    #[test]
    fn mount_path_layout() {
        let vol = test_volume("web", VolumeType::Custom, ContentType::Filesystem);
        let root = vol.storage_root().clone();
        assert_eq!(vol.mount_path(), root.join("pool1/custom/web"));

        let snap = vol.new_snapshot("s0").unwrap();
        assert_eq!(
            snap.mount_path(),
            root.join("pool1/custom-snapshots/web/s0")
        );
        assert_eq!(
            vol.snapshots_dir(),
            root.join("pool1/custom-snapshots/web")
        );
    }

    #[test]
    fn vm_block_pairs_with_config_volume() {
        let mut vol = test_volume("vm1", VolumeType::Vm, ContentType::Block);
        vol.config_mut().insert("size".into(), "10GiB".into());
        assert!(vol.is_vm_block());

        let config_vol = vol.new_vm_block_filesystem_volume();
        assert_eq!(config_vol.name(), vol.name());
        assert_eq!(config_vol.content_type(), ContentType::Filesystem);
        assert!(config_vol.config().get("size").is_none());
    }

    #[test]
    fn expanded_config_falls_back_to_pool() {
        let pool_config = Arc::new(BTreeMap::from([(
            "volume.block.filesystem".to_string(),
            "xfs".to_string(),
        )]));
        let mut vol = Volume::new(
            "/tmp/does-not-matter",
            "pool1",
            VolumeType::Custom,
            ContentType::Block,
            "blk",
            BTreeMap::new(),
            pool_config,
        );
        assert_eq!(vol.config_block_filesystem(), "xfs");
        vol.config_mut()
            .insert("block.filesystem".into(), "ext4".into());
        assert_eq!(vol.config_block_filesystem(), "ext4");
    }

    #[test]
    fn content_type_pairing_invariants() {
        assert!(check_content_type(VolumeType::Vm, ContentType::Block).is_ok());
        assert!(
            check_content_type(VolumeType::Custom, ContentType::Iso).is_ok()
        );
        assert!(check_content_type(VolumeType::Container, ContentType::Block)
            .is_err());
        assert!(
            check_content_type(VolumeType::Bucket, ContentType::Block).is_err()
        );
        assert!(
            check_content_type(VolumeType::Bucket, ContentType::Iso).is_err()
        );
        assert!(check_content_type(VolumeType::Bucket, ContentType::Filesystem)
            .is_ok());
    }

    #[test]
    fn zombie_and_transient_names() {
        let name = zombie_object_name("custom_web");
        assert!(is_zombie_object_name(&name));
        assert!(name.starts_with("zombie_custom_web_"));
        assert_ne!(name, zombie_object_name("custom_web"));

        assert!(is_transient_snapshot_name(&temp_copy_snapshot_name()));
        assert!(is_transient_snapshot_name(&deleted_snapshot_name()));
        assert!(!is_transient_snapshot_name("hourly-0"));
    }

    #[test]
    fn refcount_tracks_identity_not_instance() {
        let vol = test_volume("shared", VolumeType::Custom, ContentType::Filesystem);
        let other = vol.clone();
        assert!(!vol.mount_in_use());
        vol.mount_ref_count_increment();
        assert!(other.mount_in_use());
        assert_eq!(other.mount_ref_count_decrement(), 0);
        assert!(!vol.mount_in_use());
    }
}
