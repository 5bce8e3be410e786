// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DRBD backend, managed through a LINSTOR controller.
//!
//! Volumes are replicated block resources spawned from a resource group.
//! Resource names are opaque (`<prefix><uuid>`); the volume identity and
//! the user-facing snapshot names live in auxiliary properties on the
//! resource definition, so renames are metadata moves that never touch
//! the replicated data. Replication is active-passive: a volume is usable
//! on one member at a time.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use slog::{debug, warn};
use uuid::Uuid;

use amphora_wire::FsType;

use crate::backup;
use crate::config::{self, Rules};
use crate::error::{Error, Result, ResultExt};
use crate::migration::{MigrationType, VolumeSourceArgs, VolumeTargetArgs};
use crate::op::Operation;
use crate::revert::Revert;
use crate::stream::ReadWrite;
use crate::volume::{ContentType, Volume, VolumeType};

use super::{generic, CommonDriver, Driver, Info, VolumeFiller};

/// New resources default to 10GiB when no size is configured.
const DEFAULT_VOLUME_SIZE: i64 = 10 * 1024 * 1024 * 1024;

/// Replica count used when the pool config does not set one.
const DEFAULT_PLACE_COUNT: &str = "2";

/// Resource names are `<prefix><uuid>`; the prefix is configurable but
/// bounded so the whole name stays within DRBD's limits.
const DEFAULT_RESOURCE_PREFIX: &str = "amphora-volume-";
const MAX_RESOURCE_PREFIX_LEN: usize = 24;

/// Auxiliary property keys carrying the volume identity. The controller
/// prefixes them with `Aux/` in listings.
const AUX_NAME: &str = "Amphora/name";
const AUX_TYPE: &str = "Amphora/type";
const AUX_CONTENT_TYPE: &str = "Amphora/content-type";
/// `Amphora/snapshot/<user name>` maps to the backend snapshot name.
const AUX_SNAPSHOT_PREFIX: &str = "Amphora/snapshot/";

#[derive(Deserialize)]
struct ResourceDefinition {
    name: String,
    #[serde(default)]
    props: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct ResourceGroupEntry {
    name: String,
}

#[derive(Deserialize)]
struct ResourceVolumeState {
    #[serde(default)]
    device_path: String,
    #[serde(default)]
    allocated_size_kib: i64,
}

#[derive(Deserialize)]
struct VolumeDefinition {
    #[serde(default)]
    size_kib: i64,
}

#[derive(Deserialize)]
struct SnapshotEntry {
    name: String,
}

fn parse_json<T: DeserializeOwned>(what: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw.trim())
        .map_err(|e| Error::Protocol(format!("{what}: {e}")))
}

/// Empty controller output stands for an empty listing.
fn parse_json_list<T: DeserializeOwned + Default>(
    what: &str,
    raw: &str,
) -> Result<T> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    parse_json(what, raw)
}

fn kib_for(bytes: i64) -> i64 {
    (bytes + 1023) / 1024
}

fn backend_snapshot_name() -> String {
    format!("snap-{}", Uuid::new_v4())
}

impl ResourceDefinition {
    fn aux(&self, key: &str) -> Option<&str> {
        self.props.get(&format!("Aux/{key}")).map(String::as_str)
    }

    /// User snapshot name → backend snapshot name, from the aux
    /// property map.
    fn snapshot_map(&self) -> BTreeMap<String, String> {
        let prefix = format!("Aux/{AUX_SNAPSHOT_PREFIX}");
        self.props
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .map(|user| (user.to_string(), value.clone()))
            })
            .collect()
    }
}

pub struct DrbdDriver {
    common: CommonDriver,
    version: String,
}

impl DrbdDriver {
    pub fn new(common: CommonDriver, version: String) -> Self {
        Self { common, version }
    }

    fn resource_group(&self) -> String {
        self.common
            .config()
            .get("drbd.resource_group")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| self.common.pool_name().to_string())
    }

    fn resource_prefix(&self) -> String {
        self.common
            .config()
            .get("drbd.volume_prefix")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_RESOURCE_PREFIX.to_string())
    }

    fn place_count(&self) -> String {
        self.common
            .config()
            .get("drbd.place_count")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_PLACE_COUNT.to_string())
    }

    fn run_linstor(&self, args: &[&str]) -> Result<String> {
        let out = self.common.runner().run("linstor", args)?;
        Ok(out)
    }

    /// Controller query with machine-readable output.
    fn query_linstor(&self, args: &[&str]) -> Result<String> {
        let mut argv = vec!["-m", "--output-version", "v1"];
        argv.extend_from_slice(args);
        let out = self.common.runner().run("linstor", &argv)?;
        Ok(out)
    }

    fn set_aux(&self, resource: &str, key: &str, value: &str) -> Result<()> {
        self.run_linstor(&[
            "resource-definition",
            "set-property",
            "--aux",
            resource,
            key,
            value,
        ])?;
        Ok(())
    }

    /// Clears an aux property; the controller drops empty values.
    fn clear_aux(&self, resource: &str, key: &str) -> Result<()> {
        self.set_aux(resource, key, "")
    }

    fn resource_definitions(&self) -> Result<Vec<ResourceDefinition>> {
        let raw = self.query_linstor(&["resource-definition", "list"])?;
        parse_json_list("linstor resource-definition list", &raw)
    }

    /// Looks up the resource definition tagged with `vol`'s identity.
    fn find_resource(&self, vol: &Volume) -> Result<Option<ResourceDefinition>> {
        let vol_type: &'static str = vol.vol_type().into();
        let content_type: &'static str = vol.content_type().into();
        for rd in self.resource_definitions()? {
            if rd.aux(AUX_NAME) == Some(vol.name())
                && rd.aux(AUX_TYPE) == Some(vol_type)
                && rd.aux(AUX_CONTENT_TYPE) == Some(content_type)
            {
                return Ok(Some(rd));
            }
        }
        Ok(None)
    }

    fn resource_for(&self, vol: &Volume) -> Result<ResourceDefinition> {
        self.find_resource(vol)?.ok_or_else(|| {
            Error::NotFound(format!("volume {}", vol.name()))
        })
    }

    /// Tags a resource definition with a volume's identity.
    fn tag_resource(&self, resource: &str, vol: &Volume) -> Result<()> {
        let vol_type: &'static str = vol.vol_type().into();
        let content_type: &'static str = vol.content_type().into();
        self.set_aux(resource, AUX_NAME, vol.name())?;
        self.set_aux(resource, AUX_TYPE, vol_type)?;
        self.set_aux(resource, AUX_CONTENT_TYPE, content_type)?;
        Ok(())
    }

    fn delete_resource(&self, resource: &str) -> Result<()> {
        self.run_linstor(&["resource-definition", "delete", resource])?;
        Ok(())
    }

    /// Backend snapshot names of a resource, in creation order as the
    /// controller reports them.
    fn backend_snapshot_names(&self, resource: &str) -> Result<Vec<String>> {
        let raw =
            self.query_linstor(&["snapshot", "list", "-r", resource])?;
        let entries: Vec<SnapshotEntry> =
            parse_json_list("linstor snapshot list", &raw)?;
        Ok(entries.into_iter().map(|s| s.name).collect())
    }

    /// User names of snapshots created after `backend`. DRBD snapshots
    /// stack, so an earlier one cannot be deleted or rolled back to
    /// while any of these remain.
    fn snapshots_after(
        &self,
        rd: &ResourceDefinition,
        backend: &str,
    ) -> Result<Vec<String>> {
        let names = self.backend_snapshot_names(&rd.name)?;
        let Some(idx) = names.iter().position(|n| n == backend) else {
            return Ok(Vec::new());
        };
        let map = rd.snapshot_map();
        let by_backend: BTreeMap<&String, &String> =
            map.iter().map(|(user, backend)| (backend, user)).collect();
        Ok(names[idx + 1..]
            .iter()
            .filter_map(|b| by_backend.get(b).map(|u| u.to_string()))
            .collect())
    }

    /// DRBD device path of a resource on this member.
    fn device_path(&self, resource: &str) -> Result<String> {
        let raw = self.query_linstor(&[
            "resource",
            "list-volumes",
            "-r",
            resource,
        ])?;
        let states: Vec<ResourceVolumeState> =
            parse_json_list("linstor resource list-volumes", &raw)?;
        states
            .into_iter()
            .map(|s| s.device_path)
            .find(|p| !p.is_empty())
            .ok_or_else(|| {
                Error::Protocol(format!("resource {resource} has no device"))
            })
    }

    /// Bytes allocated for a resource, the largest replica counting.
    fn allocated_bytes(&self, resource: &str) -> Result<i64> {
        let raw = self.query_linstor(&[
            "resource",
            "list-volumes",
            "-r",
            resource,
        ])?;
        let states: Vec<ResourceVolumeState> =
            parse_json_list("linstor resource list-volumes", &raw)?;
        Ok(states
            .iter()
            .map(|s| s.allocated_size_kib)
            .max()
            .unwrap_or(0)
            * 1024)
    }

    /// Current provisioned size of a resource in bytes.
    fn definition_size_bytes(&self, resource: &str) -> Result<i64> {
        let raw = self.query_linstor(&[
            "volume-definition",
            "list",
            "-r",
            resource,
        ])?;
        let defs: Vec<VolumeDefinition> =
            parse_json_list("linstor volume-definition list", &raw)?;
        let def = defs.into_iter().next().ok_or_else(|| {
            Error::Protocol(format!(
                "resource {resource} has no volume definition"
            ))
        })?;
        Ok(def.size_kib * 1024)
    }

    fn resource_group_exists(&self, group: &str) -> Result<bool> {
        let raw = self.query_linstor(&["resource-group", "list"])?;
        let groups: Vec<ResourceGroupEntry> =
            parse_json_list("linstor resource-group list", &raw)?;
        Ok(groups.iter().any(|g| g.name == group))
    }

    fn resize_resource(&self, resource: &str, bytes: i64) -> Result<()> {
        let size = format!("{}KiB", kib_for(bytes));
        self.run_linstor(&[
            "volume-definition",
            "set-size",
            resource,
            "0",
            size.as_str(),
        ])?;
        Ok(())
    }

    /// Size for a new resource: the configured size or the default.
    fn volume_size_bytes(&self, vol: &Volume) -> Result<i64> {
        let size = vol.config_size()?;
        if size > 0 {
            return Ok(size);
        }
        Ok(DEFAULT_VOLUME_SIZE)
    }

    fn mount_device(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &str,
        readonly: bool,
    ) -> Result<()> {
        let target = target.to_string_lossy();
        let options = if readonly {
            format!("ro,{options}")
        } else {
            options.to_string()
        };
        self.common.runner().run(
            "mount",
            &["-t", fs_type, "-o", options.as_str(), device, &target],
        )?;
        Ok(())
    }

    fn unmount_path(&self, target: &Path) -> Result<()> {
        let target = target.to_string_lossy();
        self.common.runner().run("umount", &[&target])?;
        Ok(())
    }

    fn path_is_mounted(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.common.runner().run("mountpoint", &["-q", &path]).is_ok()
    }

    /// Runs mkfs and the optional content filler against a fresh
    /// resource's device.
    fn populate_new_volume(
        &self,
        vol: &Volume,
        device: &str,
        filler: Option<&mut VolumeFiller<'_>>,
    ) -> Result<()> {
        if vol.content_type() == ContentType::Filesystem {
            let fs_type = vol.config_block_filesystem();
            generic::make_file_system(&self.common, &fs_type, Path::new(device))?;
            let Some(filler) = filler else { return Ok(()) };
            vol.ensure_mount_path()?;
            let mount_path = vol.mount_path();
            self.mount_device(
                device,
                &mount_path,
                &fs_type,
                &vol.config_block_mount_options(),
                false,
            )?;
            let filled = (filler.fill)(vol, &mount_path);
            if let Err(e) = self.unmount_path(&mount_path) {
                warn!(self.common.log(), "failed to unmount after filling";
                    "path" => %mount_path.display(), "error" => %e);
            }
            filled.map(|_| ())
        } else {
            let Some(filler) = filler else { return Ok(()) };
            (filler.fill)(vol, Path::new(device)).map(|_| ())
        }
    }

    /// Materializes a snapshot as a new resource definition tagged with
    /// `target`'s identity.
    fn restore_snapshot_into_resource(
        &self,
        parent_resource: &str,
        backend_snap: &str,
        new_resource: &str,
        target: &Volume,
    ) -> Result<()> {
        let mut revert = Revert::new();
        self.run_linstor(&["resource-definition", "create", new_resource])?;
        {
            let name = new_resource.to_string();
            revert.add(move || {
                if let Err(e) = self.delete_resource(&name) {
                    warn!(self.common.log(),
                        "failed to remove partial resource";
                        "resource" => name.as_str(), "error" => %e);
                }
            });
        }
        self.run_linstor(&[
            "snapshot",
            "volume-definition",
            "restore",
            "--from-resource",
            parent_resource,
            "--from-snapshot",
            backend_snap,
            "--to-resource",
            new_resource,
        ])?;
        self.run_linstor(&[
            "snapshot",
            "resource",
            "restore",
            "--from-resource",
            parent_resource,
            "--from-snapshot",
            backend_snap,
            "--to-resource",
            new_resource,
        ])?;
        self.tag_resource(new_resource, target)?;
        revert.success();
        Ok(())
    }
}

impl Driver for DrbdDriver {
    fn info(&self) -> Info {
        Info {
            name: "drbd",
            version: self.version.clone(),
            volume_types: vec![
                VolumeType::Container,
                VolumeType::Vm,
                VolumeType::Image,
                VolumeType::Custom,
            ],
            remote: true,
            optimized_images: false,
            optimized_backups: false,
            // Active-passive replication: one member at a time.
            volume_multi_node: false,
            block_backing: true,
            preserves_inodes: false,
            deactivate: false,
            buckets: false,
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
        rules.insert("drbd.resource_group", config::optional(config::is_any));
        rules.insert("drbd.place_count", config::optional(config::is_uint));
        rules.insert("drbd.storage_pool", config::optional(config::is_any));
        rules.insert(
            "drbd.volume_prefix",
            config::optional(Box::new(|value: &str| {
                if value.len() >= MAX_RESOURCE_PREFIX_LEN {
                    return Err(format!(
                        "must be shorter than {MAX_RESOURCE_PREFIX_LEN} \
                         characters"
                    ));
                }
                Ok(())
            })),
        );
        rules.insert("rsync.compression", config::optional(config::is_bool));
        rules.insert("volatile.pool.pristine", config::optional(config::is_any));
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
        {
            let config = self.common.config_mut();
            let source = config.get("source").cloned().unwrap_or_default();
            if !source.is_empty() {
                match config.get("drbd.resource_group").cloned() {
                    Some(existing) if existing != source => {
                        return Err(Error::ConfigInvalid(vec![format!(
                            "source does not match drbd.resource_group \
                             ({source} vs {existing})"
                        )]));
                    }
                    _ => {
                        config.insert(
                            "drbd.resource_group".to_string(),
                            source,
                        );
                    }
                }
            }
            config
                .entry("drbd.place_count".to_string())
                .or_insert_with(|| DEFAULT_PLACE_COUNT.to_string());
        }

        let group = self.resource_group();
        let exists = self.resource_group_exists(&group)?;
        self.common.config_mut().insert(
            "volatile.pool.pristine".to_string(),
            (!exists).to_string(),
        );

        let this: &Self = self;
        let mut revert = Revert::new();
        if !exists {
            let place_count = this.place_count();
            let storage_pool = this
                .common
                .config()
                .get("drbd.storage_pool")
                .filter(|v| !v.is_empty())
                .cloned();
            let mut args = vec![
                "resource-group",
                "create",
                group.as_str(),
                "--place-count",
                place_count.as_str(),
            ];
            if let Some(pool) = &storage_pool {
                args.push("--storage-pool");
                args.push(pool.as_str());
            }
            this.run_linstor(&args)?;
            {
                let group = group.clone();
                revert.add(move || {
                    if let Err(e) = this.run_linstor(&[
                        "resource-group",
                        "delete",
                        group.as_str(),
                    ]) {
                        warn!(this.common.log(),
                            "failed to remove resource group";
                            "group" => group.as_str(), "error" => %e);
                    }
                });
            }
            this.run_linstor(&["volume-group", "create", group.as_str()])?;
        }

        fs::create_dir_all(this.common.pool_mount_path())?;
        revert.success();
        Ok(())
    }

    fn delete(&mut self, _op: &Operation) -> Result<()> {
        let pristine = self
            .common
            .config()
            .get("volatile.pool.pristine")
            .map(|v| v != "false")
            .unwrap_or(true);
        if pristine {
            let group = self.resource_group();
            self.run_linstor(&["resource-group", "delete", group.as_str()])?;
        }
        let mount_path = self.common.pool_mount_path();
        if mount_path.exists() {
            fs::remove_dir_all(&mount_path)?;
        }
        Ok(())
    }

    fn mount(&mut self) -> Result<bool> {
        fs::create_dir_all(self.common.pool_mount_path())?;
        Ok(true)
    }

    fn unmount(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn update(&mut self, _changed: &BTreeMap<String, String>) -> Result<()> {
        // Resource-group parameters cannot be reshaped under live
        // resources.
        Err(Error::NotSupported)
    }

    fn get_resources(&self) -> Result<super::PoolResources> {
        // Controller storage pools have no single capacity answer here.
        Err(Error::NotSupported)
    }

    fn list_volumes(&self) -> Result<Vec<Volume>> {
        Err(Error::NotSupported)
    }

    fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&mut VolumeFiller<'_>>,
        _op: &Operation,
    ) -> Result<()> {
        if self.find_resource(vol)?.is_some() {
            return Err(Error::AlreadyExists(vol.name().to_string()));
        }
        let mut revert = Revert::new();
        let size = self.volume_size_bytes(vol)?;
        let group = self.resource_group();
        let resource = format!("{}{}", self.resource_prefix(), Uuid::new_v4());
        let size_spec = format!("{}KiB", kib_for(size));
        self.run_linstor(&[
            "resource-group",
            "spawn-resources",
            group.as_str(),
            resource.as_str(),
            size_spec.as_str(),
        ])
        .context("create volume", vol.name().to_string())?;
        {
            let resource = resource.clone();
            revert.add(move || {
                if let Err(e) = self.delete_resource(&resource) {
                    warn!(self.common.log(),
                        "failed to remove partial resource";
                        "resource" => resource.as_str(), "error" => %e);
                }
            });
        }
        self.tag_resource(&resource, vol)?;

        let wants_filesystem = vol.content_type() == ContentType::Filesystem;
        if wants_filesystem || filler.is_some() {
            let device = self.device_path(&resource)?;
            self.populate_new_volume(vol, &device, filler)?;
        }

        vol.ensure_mount_path()?;
        {
            let path = vol.mount_path();
            revert.add(move || {
                let _ = fs::remove_dir_all(&path);
            });
        }
        revert.success();
        Ok(())
    }

    fn delete_volume(&self, vol: &Volume, op: &Operation) -> Result<()> {
        if let Some(rd) = self.find_resource(vol)? {
            let snapshots = self.volume_snapshots(vol, op)?;
            if !snapshots.is_empty() {
                return Err(Error::RequiresCascade(snapshots));
            }
            self.delete_resource(&rd.name)
                .context("delete volume", vol.name().to_string())?;
        }
        let mount_path = vol.mount_path();
        if mount_path.exists() {
            fs::remove_dir_all(&mount_path)?;
        }
        generic::prune_empty_snapshots_dir(vol)?;
        Ok(())
    }

    fn has_volume(&self, vol: &Volume) -> Result<bool> {
        Ok(self.find_resource(vol)?.is_some())
    }

    fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src: &Volume,
        copy_snapshots: bool,
        allow_inconsistent: bool,
        op: &Operation,
    ) -> Result<()> {
        if self.find_resource(vol)?.is_some() {
            return Err(Error::AlreadyExists(vol.name().to_string()));
        }

        // A snapshot source materializes directly into the new volume.
        if let Some(snap_name) = src.snapshot_name() {
            let parent_rd = self.resource_for(&src.parent())?;
            let backend =
                parent_rd.snapshot_map().get(snap_name).cloned().ok_or_else(
                    || Error::NotFound(format!("snapshot {snap_name}")),
                )?;
            let resource =
                format!("{}{}", self.resource_prefix(), Uuid::new_v4());
            self.restore_snapshot_into_resource(
                &parent_rd.name,
                &backend,
                &resource,
                vol,
            )?;
            vol.ensure_mount_path()?;
            return Ok(());
        }

        let src_snapshots = if copy_snapshots {
            self.volume_snapshots(src, op)?
        } else {
            Vec::new()
        };
        if !src_snapshots.is_empty() {
            // Snapshot history cannot clone; fall back to replaying the
            // tree through the generic path.
            return generic::vfs_copy_volume(
                self,
                vol,
                src,
                &src_snapshots,
                false,
                allow_inconsistent,
                op,
            );
        }

        let src_rd = self.resource_for(src)?;
        let resource = format!("{}{}", self.resource_prefix(), Uuid::new_v4());
        let mut revert = Revert::new();
        self.run_linstor(&[
            "resource-definition",
            "clone",
            src_rd.name.as_str(),
            resource.as_str(),
        ])
        .context("copy volume", src.name().to_string())?;
        {
            let resource = resource.clone();
            revert.add(move || {
                if let Err(e) = self.delete_resource(&resource) {
                    warn!(self.common.log(), "failed to remove partial clone";
                        "resource" => resource.as_str(), "error" => %e);
                }
            });
        }
        self.tag_resource(&resource, vol)?;
        vol.ensure_mount_path()?;

        let size = vol.config_size()?;
        if size > 0 {
            self.set_volume_quota(vol, &size.to_string(), false, op)?;
        }
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
        let new_bytes = crate::units::parse_byte_size(size)
            .map_err(|msg| Error::ConfigInvalid(vec![format!("size: {msg}")]))?;
        if new_bytes <= 0 {
            return Ok(());
        }
        let rd = self.resource_for(vol)?;
        let old_bytes = self.definition_size_bytes(&rd.name)?;
        // DRBD settles sizes on extent boundaries; treat a sub-sector
        // difference as already sized.
        if (new_bytes - old_bytes).abs() < 512 {
            return Ok(());
        }

        if vol.content_type() == ContentType::Filesystem {
            let device = self.device_path(&rd.name)?;
            let mut resize_device = |bytes: i64| -> Result<()> {
                self.resize_resource(&rd.name, bytes)
            };
            generic::resize_with_filesystem(
                &self.common,
                vol,
                Path::new(&device),
                &vol.config_block_filesystem(),
                old_bytes,
                new_bytes,
                allow_unsafe_resize,
                &mut resize_device,
            )
        } else {
            if new_bytes < old_bytes && !allow_unsafe_resize {
                return Err(Error::CannotShrink);
            }
            self.resize_resource(&rd.name, new_bytes)
        }
    }

    fn get_volume_usage(&self, vol: &Volume) -> Result<i64> {
        let rd = self.resource_for(vol)?;
        self.allocated_bytes(&rd.name)
    }

    fn mount_volume(&self, vol: &Volume, _op: &Operation) -> Result<()> {
        let _lock = vol.mount_lock();
        let rd = self.resource_for(vol)?;
        match vol.content_type() {
            ContentType::Filesystem => {
                let mount_path = vol.mount_path();
                if !self.path_is_mounted(&mount_path) {
                    vol.ensure_mount_path()?;
                    let device = self.device_path(&rd.name)?;
                    self.mount_device(
                        &device,
                        &mount_path,
                        &vol.config_block_filesystem(),
                        &vol.config_block_mount_options(),
                        false,
                    )?;
                }
            }
            ContentType::Block | ContentType::Iso => {
                // Resolving the device promotes this member to primary.
                self.device_path(&rd.name)?;
            }
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
        let _lock = vol.mount_lock();
        if vol.mount_ref_count_decrement() > 0 {
            debug!(self.common.log(), "skipping unmount as in use";
                "volume" => vol.name());
            return Err(Error::InUse);
        }
        let mut ours = false;
        if vol.content_type() == ContentType::Filesystem {
            let mount_path = vol.mount_path();
            if self.path_is_mounted(&mount_path) {
                self.unmount_path(&mount_path)?;
                ours = true;
            }
        }
        Ok(ours)
    }

    fn rename_volume(
        &self,
        vol: &Volume,
        new_name: &str,
        op: &Operation,
    ) -> Result<()> {
        let rd = self.resource_for(vol)?;
        let mut revert = Revert::new();
        // The resource keeps its opaque name; only the identity tag
        // moves.
        self.set_aux(&rd.name, AUX_NAME, new_name)?;
        {
            let resource = rd.name.clone();
            let old_name = vol.name().to_string();
            revert.add(move || {
                if let Err(e) = self.set_aux(&resource, AUX_NAME, &old_name) {
                    warn!(self.common.log(),
                        "failed to restore volume name tag";
                        "resource" => resource.as_str(), "error" => %e);
                }
            });
        }
        generic::vfs_rename_volume(&self.common, vol, new_name, op)?;
        revert.success();
        Ok(())
    }

    fn get_volume_disk_path(&self, vol: &Volume) -> Result<PathBuf> {
        if vol.content_type() == ContentType::Filesystem
            && !vol.is_vm_block()
        {
            return Err(Error::NotSupported);
        }
        let rd = self.resource_for(vol)?;
        Ok(PathBuf::from(self.device_path(&rd.name)?))
    }

    fn create_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<()> {
        let snap_name = snap.snapshot_name().ok_or_else(|| {
            Error::NotFound(format!("snapshot of {}", snap.name()))
        })?;
        let rd = self.resource_for(&snap.parent())?;
        if rd.snapshot_map().contains_key(snap_name) {
            return Err(Error::AlreadyExists(snap.name().to_string()));
        }
        let backend = backend_snapshot_name();
        let mut revert = Revert::new();
        self.run_linstor(&[
            "snapshot",
            "create",
            rd.name.as_str(),
            backend.as_str(),
        ])
        .context("create snapshot", snap.name().to_string())?;
        {
            let resource = rd.name.clone();
            let backend = backend.clone();
            revert.add(move || {
                let _ = self.run_linstor(&[
                    "snapshot",
                    "delete",
                    resource.as_str(),
                    backend.as_str(),
                ]);
            });
        }
        let key = format!("{AUX_SNAPSHOT_PREFIX}{snap_name}");
        self.set_aux(&rd.name, &key, &backend)?;
        snap.ensure_mount_path()?;
        revert.success();
        Ok(())
    }

    fn delete_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<()> {
        let snap_name = snap.snapshot_name().ok_or_else(|| {
            Error::NotFound(format!("snapshot of {}", snap.name()))
        })?;
        let rd = self.resource_for(&snap.parent())?;
        if let Some(backend) = rd.snapshot_map().get(snap_name) {
            let later = self.snapshots_after(&rd, backend)?;
            if !later.is_empty() {
                return Err(Error::RequiresCascade(later));
            }
            self.run_linstor(&[
                "snapshot",
                "delete",
                rd.name.as_str(),
                backend.as_str(),
            ])?;
            let key = format!("{AUX_SNAPSHOT_PREFIX}{snap_name}");
            self.clear_aux(&rd.name, &key)?;
        }
        let mount_path = snap.mount_path();
        if mount_path.exists() {
            fs::remove_dir_all(&mount_path)?;
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
        let rd = self.resource_for(vol)?;
        let backend = rd
            .snapshot_map()
            .get(snapshot_name)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("snapshot {snapshot_name}"))
            })?;
        let later = self.snapshots_after(&rd, &backend)?;
        if !later.is_empty() {
            return Err(Error::RequiresCascade(later));
        }
        if vol.mount_in_use() {
            return Err(Error::InUse);
        }
        self.run_linstor(&[
            "snapshot",
            "rollback",
            rd.name.as_str(),
            backend.as_str(),
        ])?;
        Ok(())
    }

    fn volume_snapshots(
        &self,
        vol: &Volume,
        _op: &Operation,
    ) -> Result<Vec<String>> {
        let Some(rd) = self.find_resource(vol)? else {
            return Ok(Vec::new());
        };
        Ok(rd.snapshot_map().into_keys().collect())
    }

    fn rename_volume_snapshot(
        &self,
        snap: &Volume,
        new_snap_name: &str,
        op: &Operation,
    ) -> Result<()> {
        let snap_name = snap.snapshot_name().ok_or_else(|| {
            Error::NotFound(format!("snapshot of {}", snap.name()))
        })?;
        let rd = self.resource_for(&snap.parent())?;
        let backend = rd
            .snapshot_map()
            .get(snap_name)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("snapshot {snap_name}"))
            })?;
        let old_key = format!("{AUX_SNAPSHOT_PREFIX}{snap_name}");
        let new_key = format!("{AUX_SNAPSHOT_PREFIX}{new_snap_name}");

        let mut revert = Revert::new();
        // Metadata move: the backend snapshot itself never changes.
        self.set_aux(&rd.name, &new_key, &backend)?;
        {
            let resource = rd.name.clone();
            let new_key = new_key.clone();
            revert.add(move || {
                let _ = self.clear_aux(&resource, &new_key);
            });
        }
        self.clear_aux(&rd.name, &old_key)?;
        {
            let resource = rd.name.clone();
            let old_key = old_key.clone();
            let backend = backend.clone();
            revert.add(move || {
                let _ = self.set_aux(&resource, &old_key, &backend);
            });
        }
        generic::vfs_rename_volume_snapshot(
            &self.common,
            snap,
            new_snap_name,
            op,
        )?;
        revert.success();
        Ok(())
    }

    fn mount_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<()> {
        let _lock = snap.mount_lock();
        let snap_name = snap.snapshot_name().ok_or_else(|| {
            Error::NotFound(format!("snapshot of {}", snap.name()))
        })?;
        let parent_rd = self.resource_for(&snap.parent())?;
        let backend = parent_rd
            .snapshot_map()
            .get(snap_name)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("snapshot {snap_name}"))
            })?;

        // The snapshot lives for the duration of the mount as its own
        // transient resource.
        if self.find_resource(snap)?.is_none() {
            self.restore_snapshot_into_resource(
                &parent_rd.name,
                &backend,
                &backend,
                snap,
            )?;
        }

        if snap.content_type() == ContentType::Filesystem {
            let mount_path = snap.mount_path();
            if !self.path_is_mounted(&mount_path) {
                snap.ensure_mount_path()?;
                let device = self.device_path(&backend)?;
                self.mount_device(
                    &device,
                    &mount_path,
                    &snap.config_block_filesystem(),
                    &snap.config_block_mount_options(),
                    true,
                )?;
            }
        }
        snap.mount_ref_count_increment();
        Ok(())
    }

    fn unmount_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<bool> {
        let _lock = snap.mount_lock();
        if snap.mount_ref_count_decrement() > 0 {
            return Err(Error::InUse);
        }
        let mut ours = false;
        if snap.content_type() == ContentType::Filesystem {
            let mount_path = snap.mount_path();
            if self.path_is_mounted(&mount_path) {
                self.unmount_path(&mount_path)?;
                ours = true;
            }
        }
        if let Some(rd) = self.find_resource(snap)? {
            self.delete_resource(&rd.name)?;
        }
        Ok(ours)
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
        if args.cluster_move && !args.storage_move {
            // Same controller, same resource group: the replicas are
            // already where the target needs them.
            return Ok(());
        }
        if !args.migration_type.fs_type.is_rsync_family() {
            return Err(Error::NotSupported);
        }
        generic::vfs_migrate_volume(self, vol, conn, args, op)
    }

    fn create_volume_from_migration(
        &self,
        vol: &Volume,
        conn: &mut dyn ReadWrite,
        args: &VolumeTargetArgs,
        op: &Operation,
    ) -> Result<()> {
        if !args.cluster_move_source_name.is_empty() {
            // Intra-cluster move: the resource already exists here.
            vol.ensure_mount_path()?;
            return Ok(());
        }
        if !args.migration_type.fs_type.is_rsync_family() {
            return Err(Error::NotSupported);
        }
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
        generic::vfs_copy_volume(
            self,
            vol,
            src,
            refresh_snapshots,
            true,
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
