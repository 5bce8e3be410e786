// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ceph RBD backend.
//!
//! Volumes are RBD images in a shared OSD pool, so every cluster member
//! sees the same data without copying it around. Copies clone from a
//! protected snapshot when possible and fall back to replaying
//! incremental diffs. An image whose snapshots still back clones cannot
//! be removed; deletion parks it under a zombie name, and removing the
//! last dependent clone sweeps the parked chain.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use slog::{debug, warn};

use amphora_wire::FsType;

use crate::backup;
use crate::cmd::CmdError;
use crate::config::{self, Rules};
use crate::error::{Error, Result, ResultExt};
use crate::migration::{MigrationType, VolumeSourceArgs, VolumeTargetArgs};
use crate::op::Operation;
use crate::revert::Revert;
use crate::stream::{self, NativeSink, NativeSource, ReadWrite};
use crate::usage::{UsageCache, VolumeUsage};
use crate::volume::{
    deleted_snapshot_name, is_transient_snapshot_name, is_zombie_object_name,
    temp_copy_snapshot_name, zombie_object_name, ContentType, Volume,
    VolumeType,
};

use super::{generic, CommonDriver, Driver, Info, PoolResources, VolumeFiller};

/// Snapshot that image volumes are cloned from. Created lazily on the
/// first clone and kept for the life of the image.
const IMAGE_BASE_SNAPSHOT: &str = "readonly";

/// New images default to 10GiB when no size is configured.
const DEFAULT_VOLUME_SIZE: i64 = 10 * 1024 * 1024 * 1024;

#[derive(Deserialize)]
struct ImageInfo {
    #[serde(default)]
    size: u64,
    #[serde(default)]
    parent: Option<ImageParent>,
}

#[derive(Deserialize)]
struct ImageParent {
    #[serde(default)]
    pool: String,
    image: String,
    snapshot: String,
}

#[derive(Deserialize)]
struct SnapshotEntry {
    name: String,
}

#[derive(Deserialize)]
struct CloneEntry {
    image: String,
}

#[derive(Deserialize)]
struct MappedEntry {
    #[serde(default)]
    pool: String,
    name: String,
    #[serde(default)]
    snap: Option<String>,
    device: String,
}

#[derive(Default, Deserialize)]
struct DiskUsageReport {
    #[serde(default)]
    images: Vec<DiskUsageEntry>,
}

#[derive(Deserialize)]
struct DiskUsageEntry {
    name: String,
    #[serde(default)]
    snapshot: Option<String>,
    #[serde(default)]
    provisioned_size: i64,
    #[serde(default)]
    used_size: i64,
}

#[derive(Deserialize)]
struct DfReport {
    pools: Vec<DfPool>,
}

#[derive(Deserialize)]
struct DfPool {
    name: String,
    stats: DfStats,
}

#[derive(Deserialize)]
struct DfStats {
    #[serde(default)]
    bytes_used: u64,
    #[serde(default)]
    max_avail: u64,
}

fn parse_json<T: DeserializeOwned>(what: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw.trim())
        .map_err(|e| Error::Protocol(format!("{what}: {e}")))
}

/// Like [`parse_json`] but treats empty output as an empty listing,
/// which the tools produce for objects with nothing to report.
fn parse_json_list<T: DeserializeOwned + Default>(
    what: &str,
    raw: &str,
) -> Result<T> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    parse_json(what, raw)
}

/// Image-name prefix per volume type. Singular forms keep the names
/// compact and readable in `rbd ls` output.
fn type_prefix(vol_type: VolumeType) -> &'static str {
    match vol_type {
        VolumeType::Container => "container",
        VolumeType::Vm => "virtual-machine",
        VolumeType::Image => "image",
        VolumeType::Custom => "custom",
        VolumeType::Bucket => "bucket",
        VolumeType::Internal => "internal",
    }
}

/// Key used for usage-cache entries: the image name, with `@snap`
/// appended for snapshots. Matches what `rbd disk-usage` reports.
fn du_key(name: &str, snapshot: Option<&str>) -> String {
    match snapshot {
        Some(snap) => format!("{name}@{snap}"),
        None => name.to_string(),
    }
}

pub struct RbdDriver {
    common: CommonDriver,
    version: String,
    usage: UsageCache,
}

impl RbdDriver {
    pub fn new(common: CommonDriver, version: String) -> Self {
        Self { common, version, usage: UsageCache::new() }
    }

    fn cluster_name(&self) -> String {
        self.common
            .config()
            .get("rbd.cluster_name")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| "ceph".to_string())
    }

    fn user_name(&self) -> String {
        self.common
            .config()
            .get("rbd.user_name")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| "admin".to_string())
    }

    fn osd_pool_name(&self) -> String {
        self.common
            .config()
            .get("rbd.osd_pool_name")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| self.common.pool_name().to_string())
    }

    /// Whether copies may clone instead of doing a full diff replay.
    fn clone_copy_enabled(&self) -> bool {
        !matches!(
            self.common
                .config()
                .get("rbd.clone_copy")
                .map(|v| v.to_ascii_lowercase())
                .as_deref(),
            Some("false") | Some("no") | Some("0") | Some("off")
        )
    }

    /// Whether usage queries report provisioned rather than allocated
    /// bytes.
    fn use_provisioned(&self) -> bool {
        config::bool_value(self.common.config(), "rbd.use_provisioned")
    }

    fn image_features(&self) -> Vec<String> {
        self.common
            .config()
            .get("rbd.features")
            .map(String::as_str)
            .unwrap_or("layering")
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from)
            .collect()
    }

    fn rbd_base(&self) -> Vec<String> {
        vec![
            "--id".to_string(),
            self.user_name(),
            "--cluster".to_string(),
            self.cluster_name(),
            "--pool".to_string(),
            self.osd_pool_name(),
        ]
    }

    fn run_rbd(&self, args: &[&str]) -> Result<String> {
        let base = self.rbd_base();
        let mut argv: Vec<&str> = base.iter().map(String::as_str).collect();
        argv.extend_from_slice(args);
        let out = self.common.runner().run("rbd", &argv)?;
        Ok(out)
    }

    fn run_rbd_streams(
        &self,
        args: &[&str],
        stdin: Option<&mut (dyn Read + Send)>,
        stdout: Option<&mut dyn Write>,
    ) -> Result<()> {
        let base = self.rbd_base();
        let mut argv: Vec<&str> = base.iter().map(String::as_str).collect();
        argv.extend_from_slice(args);
        self.common.runner().run_streams("rbd", &argv, stdin, stdout)?;
        Ok(())
    }

    fn run_ceph(&self, args: &[&str]) -> Result<String> {
        let name = format!("client.{}", self.user_name());
        let cluster = self.cluster_name();
        let mut argv =
            vec!["--name", name.as_str(), "--cluster", cluster.as_str()];
        argv.extend_from_slice(args);
        let out = self.common.runner().run("ceph", &argv)?;
        Ok(out)
    }

    /// Backend image name for a volume: `<type>_<name>`, with the
    /// filesystem appended for image volumes, a `.block`/`.iso`
    /// extension for non-filesystem content, and `@<snap>` for
    /// snapshots.
    fn image_name(&self, vol: &Volume) -> String {
        let (parent, snapshot) = vol.split_name();
        let mut base = parent.to_string();
        if vol.vol_type() == VolumeType::Image {
            base = format!("{base}_{}", vol.config_block_filesystem());
        }
        let extension = match vol.content_type() {
            ContentType::Block => ".block",
            ContentType::Iso => ".iso",
            ContentType::Filesystem => "",
        };
        let mut name =
            format!("{}_{base}{extension}", type_prefix(vol.vol_type()));
        if let Some(snap) = snapshot {
            name = format!("{name}@{snap}");
        }
        name
    }

    /// Reverses [`Self::image_name`] for pool listings. Zombies,
    /// snapshot specs and images of unknown shape yield `None`.
    fn parse_image_name(&self, entry: &str) -> Option<Volume> {
        if entry.contains('@') || is_zombie_object_name(entry) {
            return None;
        }
        let (prefix, rest) = entry.split_once('_')?;
        let vol_type = match prefix {
            "container" => VolumeType::Container,
            "virtual-machine" => VolumeType::Vm,
            "image" => VolumeType::Image,
            "custom" => VolumeType::Custom,
            _ => return None,
        };
        let (name, content_type) =
            if let Some(name) = rest.strip_suffix(".block") {
                (name, ContentType::Block)
            } else if let Some(name) = rest.strip_suffix(".iso") {
                (name, ContentType::Iso)
            } else {
                (rest, ContentType::Filesystem)
            };
        let mut config = BTreeMap::new();
        let name = if vol_type == VolumeType::Image {
            let (name, fs_type) = name.rsplit_once('_')?;
            config
                .insert("block.filesystem".to_string(), fs_type.to_string());
            name
        } else {
            name
        };
        Some(self.common.new_volume(vol_type, content_type, name, config))
    }

    /// The internal image that marks the OSD pool as belonging to this
    /// storage pool.
    fn placeholder_volume(&self) -> Volume {
        self.common.new_volume(
            VolumeType::Internal,
            ContentType::Filesystem,
            self.osd_pool_name(),
            BTreeMap::new(),
        )
    }

    fn has_image(&self, image: &str) -> Result<bool> {
        match self.run_rbd(&["info", image]) {
            Ok(_) => Ok(true),
            Err(Error::Cmd(CmdError::Failed { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn image_info(&self, image: &str) -> Result<ImageInfo> {
        let raw = self.run_rbd(&["info", "--format", "json", image])?;
        parse_json("rbd info", &raw)
    }

    /// All backend snapshots of an image, in creation order. Diff
    /// replays depend on that order, so it is never sorted.
    fn image_snapshot_names(&self, image: &str) -> Result<Vec<String>> {
        let raw = self.run_rbd(&["snap", "ls", "--format", "json", image])?;
        let entries: Vec<SnapshotEntry> =
            parse_json_list("rbd snap ls", &raw)?;
        Ok(entries.into_iter().map(|s| s.name).collect())
    }

    fn snapshot_clones(&self, image: &str, snap: &str) -> Result<Vec<String>> {
        let spec = format!("{image}@{snap}");
        let raw = self.run_rbd(&["children", "--format", "json", &spec])?;
        let entries: Vec<CloneEntry> =
            parse_json_list("rbd children", &raw)?;
        Ok(entries.into_iter().map(|c| c.image).collect())
    }

    fn create_image(&self, image: &str, size_bytes: i64) -> Result<()> {
        let size = format!("{size_bytes}B");
        let features = self.image_features();
        let mut args = vec!["create"];
        for feature in &features {
            args.push("--image-feature");
            args.push(feature.as_str());
        }
        args.push("--size");
        args.push(size.as_str());
        args.push(image);
        self.run_rbd(&args)?;
        Ok(())
    }

    fn rename_image(&self, from: &str, to: &str) -> Result<()> {
        self.run_rbd(&["rename", from, to])?;
        Ok(())
    }

    /// Deletes an image outright, or parks it under a zombie name when
    /// one of its snapshots still backs clones.
    fn delete_image_or_zombie(&self, image: &str) -> Result<()> {
        let mut has_clones = false;
        for snap in self.image_snapshot_names(image)? {
            if !self.snapshot_clones(image, &snap)?.is_empty() {
                has_clones = true;
                break;
            }
        }
        if !has_clones {
            return self.delete_image(image);
        }
        if !is_zombie_object_name(image) {
            let zombie = zombie_object_name(image);
            debug!(self.common.log(), "parking image with dependent clones";
                "image" => image, "zombie" => zombie.as_str());
            self.rename_image(image, &zombie)?;
        }
        Ok(())
    }

    /// Removes an image and its snapshots, then walks up the origin
    /// chain: a parked parent or transient boundary snapshot whose last
    /// dependent just went away is removed in turn.
    fn delete_image(&self, image: &str) -> Result<()> {
        let parent = self.image_info(image)?.parent;
        for snap in self.image_snapshot_names(image)? {
            let spec = format!("{image}@{snap}");
            if let Err(e) = self.run_rbd(&["snap", "unprotect", &spec]) {
                debug!(self.common.log(), "snapshot not protected";
                    "snapshot" => spec.as_str(), "error" => %e);
            }
        }
        self.run_rbd(&["snap", "purge", image])?;
        self.run_rbd(&["rm", image])?;

        let Some(parent) = parent else { return Ok(()) };
        if !parent.pool.is_empty() && parent.pool != self.osd_pool_name() {
            return Ok(());
        }
        let parked = is_zombie_object_name(&parent.image);
        if !parked && !is_transient_snapshot_name(&parent.snapshot) {
            // The origin is a live volume; its snapshot stays.
            return Ok(());
        }
        if !self.snapshot_clones(&parent.image, &parent.snapshot)?.is_empty()
        {
            return Ok(());
        }
        let spec = format!("{}@{}", parent.image, parent.snapshot);
        if let Err(e) = self.run_rbd(&["snap", "unprotect", &spec]) {
            debug!(self.common.log(), "snapshot not protected";
                "snapshot" => spec.as_str(), "error" => %e);
        }
        self.run_rbd(&["snap", "rm", &spec])?;
        if parked {
            self.delete_image_or_zombie(&parent.image)?;
        }
        Ok(())
    }

    fn map_image(&self, spec: &str) -> Result<String> {
        let mut args = vec!["map"];
        if spec.contains('@') {
            args.push("--read-only");
        }
        args.push(spec);
        let out = self.run_rbd(&args)?;
        let device = out.trim().to_string();
        if device.is_empty() {
            return Err(Error::Protocol(format!(
                "rbd map returned no device for {spec}"
            )));
        }
        Ok(device)
    }

    fn mapped_device(&self, image: &str) -> Result<Option<String>> {
        let raw = self.run_rbd(&["showmapped", "--format", "json"])?;
        let entries: Vec<MappedEntry> =
            parse_json_list("rbd showmapped", &raw)?;
        let (name, snap) = match image.split_once('@') {
            Some((name, snap)) => (name, Some(snap)),
            None => (image, None),
        };
        let pool = self.osd_pool_name();
        for entry in entries {
            if entry.pool != pool || entry.name != name {
                continue;
            }
            let entry_snap = entry.snap.as_deref().filter(|s| *s != "-");
            if entry_snap == snap {
                return Ok(Some(entry.device));
            }
        }
        Ok(None)
    }

    /// Block device for an image, mapping it if not already mapped.
    fn device_for(&self, image: &str) -> Result<String> {
        if let Some(device) = self.mapped_device(image)? {
            return Ok(device);
        }
        self.map_image(image)
    }

    fn unmap_device(&self, device: &str) -> Result<()> {
        self.run_rbd(&["unmap", device])?;
        Ok(())
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

    /// Reads `pg_num` for an OSD pool, `None` when the pool does not
    /// exist.
    fn osd_pool_pg_num(&self, pool: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct PoolPgNum {
            pg_num: u64,
        }
        match self.run_ceph(&["osd", "pool", "get", pool, "pg_num", "-f", "json"])
        {
            Ok(raw) => {
                let parsed: PoolPgNum =
                    parse_json("ceph osd pool get", &raw)?;
                Ok(Some(parsed.pg_num.to_string()))
            }
            Err(Error::Cmd(CmdError::Failed { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Size for a new image: the configured size or the block default.
    fn volume_size_bytes(&self, vol: &Volume) -> Result<i64> {
        let size = vol.config_size()?;
        if size > 0 {
            return Ok(size);
        }
        Ok(DEFAULT_VOLUME_SIZE)
    }

    /// Runs mkfs and the optional content filler against a freshly
    /// mapped device.
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

    /// Copies `src_spec` into `dst_image` as an incremental diff,
    /// spooled through a temporary file so the sink sees a complete
    /// stream.
    fn apply_diff(
        &self,
        src_spec: &str,
        from_snap: Option<&str>,
        dst_image: &str,
    ) -> Result<()> {
        let mut spool = tempfile::tempfile()?;
        {
            let mut args = vec!["export-diff"];
            if let Some(from) = from_snap {
                args.push("--from-snap");
                args.push(from);
            }
            args.push(src_spec);
            args.push("-");
            self.run_rbd_streams(&args, None, Some(&mut spool))?;
        }
        spool.seek(SeekFrom::Start(0))?;
        self.run_rbd_streams(
            &["import-diff", "-", dst_image],
            Some(&mut spool),
            None,
        )?;
        Ok(())
    }

    /// Replays a source image onto a fresh destination, snapshot by
    /// snapshot, so the copy carries the full snapshot history without
    /// any clone relationship. The head state travels under a transient
    /// snapshot that is dropped from both sides afterwards.
    fn copy_image_with_snapshots(
        &self,
        src_image: &str,
        dst_image: &str,
        snapshots: &[String],
    ) -> Result<()> {
        let mut last: Option<&str> = None;
        for snap in snapshots {
            let spec = format!("{src_image}@{snap}");
            self.apply_diff(&spec, last, dst_image)?;
            last = Some(snap);
        }
        let marker = temp_copy_snapshot_name();
        let head_spec = format!("{src_image}@{marker}");
        self.run_rbd(&["snap", "create", &head_spec])?;
        let result = self.apply_diff(&head_spec, last, dst_image);
        if let Err(e) = self.run_rbd(&["snap", "rm", &head_spec]) {
            warn!(self.common.log(), "failed to remove transient snapshot";
                "snapshot" => head_spec.as_str(), "error" => %e);
        }
        result?;
        // import-diff recreates the boundary snapshot on the copy.
        let dst_marker = format!("{dst_image}@{marker}");
        if let Err(e) = self.run_rbd(&["snap", "rm", &dst_marker]) {
            debug!(self.common.log(), "no transient snapshot on copy";
                "snapshot" => dst_marker.as_str(), "error" => %e);
        }
        Ok(())
    }

    fn send_image_diff(
        &self,
        conn: &mut dyn ReadWrite,
        src_spec: &str,
        from_snap: Option<&str>,
    ) -> Result<()> {
        let mut sink = NativeSink::new(conn);
        let mut args = vec!["export-diff"];
        if let Some(from) = from_snap {
            args.push("--from-snap");
            args.push(from);
        }
        args.push(src_spec);
        args.push("-");
        self.run_rbd_streams(&args, None, Some(&mut sink))?;
        sink.finish()?;
        Ok(())
    }

    fn receive_image_diff(
        &self,
        conn: &mut dyn ReadWrite,
        dst_image: &str,
    ) -> Result<()> {
        let mut source = NativeSource::new(conn);
        self.run_rbd_streams(
            &["import-diff", "-", dst_image],
            Some(&mut source),
            None,
        )?;
        Ok(())
    }
}

impl Driver for RbdDriver {
    fn info(&self) -> Info {
        Info {
            name: "rbd",
            version: self.version.clone(),
            volume_types: vec![
                VolumeType::Container,
                VolumeType::Vm,
                VolumeType::Image,
                VolumeType::Custom,
            ],
            remote: true,
            optimized_images: true,
            optimized_backups: false,
            volume_multi_node: true,
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
        rules.insert("rbd.cluster_name", config::optional(config::is_any));
        rules.insert("rbd.user_name", config::optional(config::is_any));
        rules.insert("rbd.osd_pool_name", config::optional(config::is_any));
        rules.insert("rbd.pg_num", config::optional(config::is_uint));
        rules.insert("rbd.features", config::optional(config::is_any));
        rules.insert("rbd.clone_copy", config::optional(config::is_bool));
        rules.insert("rbd.use_provisioned", config::optional(config::is_bool));
        rules.insert("rbd.force_reuse", config::optional(config::is_bool));
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
                match config.get("rbd.osd_pool_name").cloned() {
                    Some(existing) if existing != source => {
                        return Err(Error::ConfigInvalid(vec![format!(
                            "source does not match rbd.osd_pool_name \
                             ({source} vs {existing})"
                        )]));
                    }
                    _ => {
                        config.insert("rbd.osd_pool_name".to_string(), source);
                    }
                }
            }
            for (key, default) in [
                ("rbd.cluster_name", "ceph"),
                ("rbd.user_name", "admin"),
                ("rbd.pg_num", "32"),
            ] {
                config
                    .entry(key.to_string())
                    .or_insert_with(|| default.to_string());
            }
        }

        let osd_pool = self.osd_pool_name();
        let existing_pg = self.osd_pool_pg_num(&osd_pool)?;
        let placeholder_image = self.image_name(&self.placeholder_volume());

        // Record up front whether the OSD pool predates us, so delete()
        // knows what it is allowed to tear down.
        {
            let config = self.common.config_mut();
            match &existing_pg {
                Some(actual) => {
                    config.insert("rbd.pg_num".to_string(), actual.clone());
                    config.insert(
                        "volatile.pool.pristine".to_string(),
                        "false".to_string(),
                    );
                }
                None => {
                    config.insert(
                        "volatile.pool.pristine".to_string(),
                        "true".to_string(),
                    );
                }
            }
        }
        let force_reuse =
            config::bool_value(self.common.config(), "rbd.force_reuse");
        let pg_num = self
            .common
            .config()
            .get("rbd.pg_num")
            .cloned()
            .unwrap_or_else(|| "32".to_string());

        let this: &Self = self;
        let mut revert = Revert::new();
        match existing_pg {
            None => {
                this.run_ceph(&[
                    "osd",
                    "pool",
                    "create",
                    osd_pool.as_str(),
                    pg_num.as_str(),
                ])?;
                {
                    let osd_pool = osd_pool.clone();
                    revert.add(move || {
                        if let Err(e) = this.run_ceph(&[
                            "osd",
                            "pool",
                            "delete",
                            osd_pool.as_str(),
                            osd_pool.as_str(),
                            "--yes-i-really-really-mean-it",
                        ]) {
                            warn!(this.common.log(),
                                "failed to remove osd pool";
                                "pool" => osd_pool.as_str(), "error" => %e);
                        }
                    });
                }
                let user = this.user_name();
                let cluster = this.cluster_name();
                if let Err(e) = this.common.runner().run(
                    "rbd",
                    &[
                        "--id",
                        user.as_str(),
                        "--cluster",
                        cluster.as_str(),
                        "pool",
                        "init",
                        osd_pool.as_str(),
                    ],
                ) {
                    warn!(this.common.log(), "rbd pool init failed";
                        "pool" => osd_pool.as_str(), "error" => %e);
                }
                this.create_image(&placeholder_image, 0)?;
            }
            Some(_) => {
                if this.has_image(&placeholder_image)? {
                    if !force_reuse {
                        return Err(Error::InUse);
                    }
                } else {
                    this.create_image(&placeholder_image, 0)?;
                }
            }
        }
        fs::create_dir_all(this.common.pool_mount_path())?;
        revert.success();
        Ok(())
    }

    fn delete(&mut self, _op: &Operation) -> Result<()> {
        let placeholder_image = self.image_name(&self.placeholder_volume());
        if self.has_image(&placeholder_image)? {
            let pristine = self
                .common
                .config()
                .get("volatile.pool.pristine")
                .map(|v| v != "false")
                .unwrap_or(true);
            if pristine {
                let osd_pool = self.osd_pool_name();
                self.run_ceph(&[
                    "osd",
                    "pool",
                    "delete",
                    osd_pool.as_str(),
                    osd_pool.as_str(),
                    "--yes-i-really-really-mean-it",
                ])?;
            } else {
                // Adopted pool: leave it alone, just drop our marker.
                self.run_rbd(&["rm", &placeholder_image])?;
            }
        }
        let mount_path = self.common.pool_mount_path();
        if mount_path.exists() {
            fs::remove_dir_all(&mount_path)?;
        }
        Ok(())
    }

    fn mount(&mut self) -> Result<bool> {
        let placeholder_image = self.image_name(&self.placeholder_volume());
        if !self.has_image(&placeholder_image)? {
            return Err(Error::NotFound(format!(
                "osd pool {} has no placeholder image",
                self.osd_pool_name()
            )));
        }
        fs::create_dir_all(self.common.pool_mount_path())?;
        Ok(true)
    }

    fn unmount(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn get_resources(&self) -> Result<PoolResources> {
        let raw = self.run_ceph(&["df", "-f", "json"])?;
        let report: DfReport = parse_json("ceph df", &raw)?;
        let osd_pool = self.osd_pool_name();
        let pool = report
            .pools
            .into_iter()
            .find(|p| p.name == osd_pool)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "osd pool {osd_pool} missing from ceph df"
                ))
            })?;
        Ok(PoolResources {
            space_total: pool.stats.bytes_used + pool.stats.max_avail,
            space_used: pool.stats.bytes_used,
            inodes_total: 0,
            inodes_used: 0,
        })
    }

    fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&mut VolumeFiller<'_>>,
        _op: &Operation,
    ) -> Result<()> {
        let image = self.image_name(vol);
        if self.has_image(&image)? {
            return Err(Error::AlreadyExists(vol.name().to_string()));
        }
        let mut revert = Revert::new();
        let size = self.volume_size_bytes(vol)?;
        self.create_image(&image, size)
            .context("create volume", vol.name().to_string())?;
        {
            let image = image.clone();
            revert.add(move || {
                let _ = self.run_rbd(&["snap", "purge", &image]);
                if let Err(e) = self.run_rbd(&["rm", &image]) {
                    warn!(self.common.log(), "failed to remove partial image";
                        "image" => image.as_str(), "error" => %e);
                }
            });
        }

        let wants_filesystem = vol.content_type() == ContentType::Filesystem;
        if wants_filesystem || filler.is_some() {
            let device = self.device_for(&image)?;
            let result = self.populate_new_volume(vol, &device, filler);
            if let Err(e) = self.unmap_device(&device) {
                warn!(self.common.log(), "failed to unmap device";
                    "device" => device.as_str(), "error" => %e);
            }
            result?;
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
        let image = self.image_name(vol);
        if self.has_image(&image)? {
            let snapshots = self.volume_snapshots(vol, op)?;
            if !snapshots.is_empty() {
                return Err(Error::RequiresCascade(snapshots));
            }
            if let Some(device) = self.mapped_device(&image)? {
                self.unmap_device(&device)?;
            }
            self.delete_image_or_zombie(&image)
                .context("delete volume", vol.name().to_string())?;
        }
        let mount_path = vol.mount_path();
        if mount_path.exists() {
            fs::remove_dir_all(&mount_path)?;
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
        let dst_image = self.image_name(vol);
        if self.has_image(&dst_image)? {
            return Err(Error::AlreadyExists(vol.name().to_string()));
        }
        let src_image = self.image_name(src);
        let snapshots = if copy_snapshots && !src.is_snapshot() {
            self.volume_snapshots(src, op)?
        } else {
            Vec::new()
        };

        let mut revert = Revert::new();
        if !snapshots.is_empty() || !self.clone_copy_enabled() {
            // Full copy: rebuild the destination from diffs so it has
            // no ties to the source.
            let size = self.image_info(&src_image)?.size as i64;
            let size =
                if size > 0 { size } else { self.volume_size_bytes(vol)? };
            self.create_image(&dst_image, size)?;
            {
                let dst = dst_image.clone();
                revert.add(move || {
                    if let Err(e) = self.run_rbd(&["rm", &dst]) {
                        warn!(self.common.log(),
                            "failed to remove partial copy";
                            "image" => dst.as_str(), "error" => %e);
                    }
                });
            }
            if let Some(snap) = src.snapshot_name() {
                self.apply_diff(&src_image, None, &dst_image)?;
                let stray = format!("{dst_image}@{snap}");
                if let Err(e) = self.run_rbd(&["snap", "rm", &stray]) {
                    debug!(self.common.log(),
                        "no boundary snapshot on copy";
                        "snapshot" => stray.as_str(), "error" => %e);
                }
            } else {
                self.copy_image_with_snapshots(
                    &src_image,
                    &dst_image,
                    &snapshots,
                )?;
            }
        } else {
            // Cheap copy: clone from a protected source snapshot. The
            // snapshot stays for as long as the clone depends on it.
            let clone_src = if src.is_snapshot() {
                src_image.clone()
            } else if src.vol_type() == VolumeType::Image {
                let spec = format!("{src_image}@{IMAGE_BASE_SNAPSHOT}");
                let existing = self.image_snapshot_names(&src_image)?;
                if !existing.iter().any(|s| s == IMAGE_BASE_SNAPSHOT) {
                    self.run_rbd(&["snap", "create", &spec])?;
                    let cleanup = spec.clone();
                    revert.add(move || {
                        let _ = self.run_rbd(&["snap", "rm", &cleanup]);
                    });
                }
                spec
            } else {
                let spec =
                    format!("{src_image}@{}", temp_copy_snapshot_name());
                self.run_rbd(&["snap", "create", &spec])?;
                {
                    let cleanup = spec.clone();
                    revert.add(move || {
                        let _ = self.run_rbd(&["snap", "rm", &cleanup]);
                    });
                }
                spec
            };
            if let Err(e) = self.run_rbd(&["snap", "protect", &clone_src]) {
                debug!(self.common.log(), "snapshot already protected";
                    "snapshot" => clone_src.as_str(), "error" => %e);
            }
            self.run_rbd(&["clone", &clone_src, &dst_image])?;
            {
                let dst = dst_image.clone();
                revert.add(move || {
                    if let Err(e) = self.run_rbd(&["rm", &dst]) {
                        warn!(self.common.log(),
                            "failed to remove partial clone";
                            "image" => dst.as_str(), "error" => %e);
                    }
                });
            }
        }
        vol.ensure_mount_path()?;
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
        let image = self.image_name(vol);
        let old_bytes = self.image_info(&image)?.size as i64;
        if old_bytes == new_bytes {
            return Ok(());
        }

        if vol.content_type() == ContentType::Filesystem {
            let was_mapped = self.mapped_device(&image)?.is_some();
            let device = self.device_for(&image)?;
            let mut resize_device = |bytes: i64| -> Result<()> {
                let spec = format!("{bytes}B");
                let mut args = vec!["resize"];
                if bytes < old_bytes {
                    args.push("--allow-shrink");
                }
                args.push("--size");
                args.push(spec.as_str());
                args.push(image.as_str());
                self.run_rbd(&args)?;
                Ok(())
            };
            let result = generic::resize_with_filesystem(
                &self.common,
                vol,
                Path::new(&device),
                &vol.config_block_filesystem(),
                old_bytes,
                new_bytes,
                allow_unsafe_resize,
                &mut resize_device,
            );
            if !was_mapped {
                if let Err(e) = self.unmap_device(&device) {
                    warn!(self.common.log(), "failed to unmap device";
                        "device" => device.as_str(), "error" => %e);
                }
            }
            result
        } else {
            if new_bytes < old_bytes && !allow_unsafe_resize {
                return Err(Error::CannotShrink);
            }
            let spec = format!("{new_bytes}B");
            let mut args = vec!["resize"];
            if new_bytes < old_bytes {
                args.push("--allow-shrink");
            }
            args.push("--size");
            args.push(spec.as_str());
            args.push(image.as_str());
            self.run_rbd(&args)?;
            Ok(())
        }
    }

    fn get_volume_usage(&self, vol: &Volume) -> Result<i64> {
        let key = self.image_name(vol);
        let provisioned = self.use_provisioned();
        if let Some(usage) = self.usage.lookup(&key) {
            return Ok(if provisioned {
                usage.referenced
            } else {
                usage.used
            });
        }
        let raw = self.run_rbd(&["disk-usage", "--format", "json", &key])?;
        let report: DiskUsageReport =
            parse_json_list("rbd disk-usage", &raw)?;
        for entry in report.images {
            if du_key(&entry.name, entry.snapshot.as_deref()) == key {
                return Ok(if provisioned {
                    entry.provisioned_size
                } else {
                    entry.used_size
                });
            }
        }
        Err(Error::NotFound(format!("usage for {}", vol.name())))
    }

    fn cache_volume_snapshots(&self, _vol: &Volume) -> Result<()> {
        let result = self.usage.populate(|| {
            let raw = self.run_rbd(&["disk-usage", "--format", "json"])?;
            let report: DiskUsageReport =
                parse_json_list("rbd disk-usage", &raw)?;
            let mut usage = HashMap::new();
            for entry in report.images {
                usage.insert(
                    du_key(&entry.name, entry.snapshot.as_deref()),
                    VolumeUsage {
                        used: entry.used_size,
                        referenced: entry.provisioned_size,
                    },
                );
            }
            Ok(usage)
        });
        if let Err(e) = result {
            // Usage stays answerable through direct queries.
            warn!(self.common.log(), "failed to prime usage cache";
                "error" => %e);
        }
        Ok(())
    }

    fn mount_volume(&self, vol: &Volume, _op: &Operation) -> Result<()> {
        let _lock = vol.mount_lock();
        let image = self.image_name(vol);
        match vol.content_type() {
            ContentType::Filesystem => {
                let mount_path = vol.mount_path();
                if !self.path_is_mounted(&mount_path) {
                    vol.ensure_mount_path()?;
                    let device = self.device_for(&image)?;
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
                self.device_for(&image)?;
            }
        }
        vol.mount_ref_count_increment();
        Ok(())
    }

    fn unmount_volume(
        &self,
        vol: &Volume,
        keep_block_dev: bool,
        _op: &Operation,
    ) -> Result<bool> {
        let _lock = vol.mount_lock();
        if vol.mount_ref_count_decrement() > 0 {
            return Err(Error::InUse);
        }
        let image = self.image_name(vol);
        let mut ours = false;
        if vol.content_type() == ContentType::Filesystem {
            let mount_path = vol.mount_path();
            if self.path_is_mounted(&mount_path) {
                self.unmount_path(&mount_path)?;
                ours = true;
            }
        }
        if !keep_block_dev {
            if let Some(device) = self.mapped_device(&image)? {
                self.unmap_device(&device)?;
                ours = true;
            }
        }
        Ok(ours)
    }

    fn has_volume(&self, vol: &Volume) -> Result<bool> {
        self.has_image(&self.image_name(vol))
    }

    fn rename_volume(
        &self,
        vol: &Volume,
        new_name: &str,
        op: &Operation,
    ) -> Result<()> {
        let renamed = self.common.new_volume(
            vol.vol_type(),
            vol.content_type(),
            new_name,
            vol.config().clone(),
        );
        let old_image = self.image_name(vol);
        let new_image = self.image_name(&renamed);
        let mut revert = Revert::new();
        self.rename_image(&old_image, &new_image)?;
        {
            let old_image = old_image.clone();
            let new_image = new_image.clone();
            revert.add(move || {
                if let Err(e) = self.rename_image(&new_image, &old_image) {
                    warn!(self.common.log(), "failed to restore image name";
                        "image" => new_image.as_str(), "error" => %e);
                }
            });
        }
        generic::vfs_rename_volume(&self.common, vol, new_name, op)?;
        revert.success();
        Ok(())
    }

    fn get_volume_disk_path(&self, vol: &Volume) -> Result<PathBuf> {
        if vol.content_type() == ContentType::Filesystem {
            return Err(Error::NotSupported);
        }
        let device = self.device_for(&self.image_name(vol))?;
        Ok(PathBuf::from(device))
    }

    fn list_volumes(&self) -> Result<Vec<Volume>> {
        let raw = self.run_rbd(&["ls", "--format", "json"])?;
        let names: Vec<String> = parse_json_list("rbd ls", &raw)?;
        Ok(names
            .iter()
            .filter_map(|name| self.parse_image_name(name))
            .collect())
    }

    fn create_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<()> {
        let spec = self.image_name(snap);
        let mut revert = Revert::new();
        self.run_rbd(&["snap", "create", &spec])
            .context("create snapshot", snap.name().to_string())?;
        {
            let spec = spec.clone();
            revert.add(move || {
                let _ = self.run_rbd(&["snap", "rm", &spec]);
            });
        }
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
        let parent_image = self.image_name(&snap.parent());
        let spec = format!("{parent_image}@{snap_name}");
        if self.snapshot_clones(&parent_image, snap_name)?.is_empty() {
            if let Err(e) = self.run_rbd(&["snap", "unprotect", &spec]) {
                debug!(self.common.log(), "snapshot not protected";
                    "snapshot" => spec.as_str(), "error" => %e);
            }
            self.run_rbd(&["snap", "rm", &spec])?;
        } else {
            // Clones still read from this snapshot. Park it under a
            // deletion marker; the last clone to go away removes it.
            let marker = deleted_snapshot_name();
            let parked = format!("{parent_image}@{marker}");
            debug!(self.common.log(), "parking snapshot with dependent clones";
                "snapshot" => spec.as_str(), "marker" => marker.as_str());
            self.run_rbd(&["snap", "rename", &spec, &parked])?;
        }
        let mount_path = snap.mount_path();
        if mount_path.exists() {
            fs::remove_dir_all(&mount_path)?;
        }
        generic::prune_empty_snapshots_dir(snap)?;
        Ok(())
    }

    fn restore_volume(
        &self,
        vol: &Volume,
        snapshot_name: &str,
        _op: &Operation,
    ) -> Result<()> {
        let image = self.image_name(vol);
        let snapshots = self.image_snapshot_names(&image)?;
        let Some(idx) = snapshots.iter().position(|s| s == snapshot_name)
        else {
            return Err(Error::NotFound(format!(
                "snapshot {snapshot_name} of {}",
                vol.name()
            )));
        };
        // Rolling back discards every snapshot taken afterwards; the
        // caller must delete those explicitly first.
        let later: Vec<String> = snapshots[idx + 1..]
            .iter()
            .filter(|s| !is_transient_snapshot_name(s))
            .cloned()
            .collect();
        if !later.is_empty() {
            return Err(Error::RequiresCascade(later));
        }
        if vol.mount_in_use() {
            return Err(Error::InUse);
        }
        let spec = format!("{image}@{snapshot_name}");
        self.run_rbd(&["snap", "rollback", &spec])?;
        Ok(())
    }

    fn mount_volume_snapshot(
        &self,
        snap: &Volume,
        _op: &Operation,
    ) -> Result<()> {
        let _lock = snap.mount_lock();
        let image = self.image_name(snap);
        match snap.content_type() {
            ContentType::Filesystem => {
                let mount_path = snap.mount_path();
                if !self.path_is_mounted(&mount_path) {
                    snap.ensure_mount_path()?;
                    let device = self.device_for(&image)?;
                    self.mount_device(
                        &device,
                        &mount_path,
                        &snap.config_block_filesystem(),
                        &snap.config_block_mount_options(),
                        true,
                    )?;
                }
            }
            ContentType::Block | ContentType::Iso => {
                self.device_for(&image)?;
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
        let image = self.image_name(snap);
        let mut ours = false;
        if snap.content_type() == ContentType::Filesystem {
            let mount_path = snap.mount_path();
            if self.path_is_mounted(&mount_path) {
                self.unmount_path(&mount_path)?;
                ours = true;
            }
        }
        if let Some(device) = self.mapped_device(&image)? {
            self.unmap_device(&device)?;
            ours = true;
        }
        Ok(ours)
    }

    fn volume_snapshots(
        &self,
        vol: &Volume,
        _op: &Operation,
    ) -> Result<Vec<String>> {
        let image = self.image_name(vol);
        let is_image = vol.vol_type() == VolumeType::Image;
        let names = self.image_snapshot_names(&image)?;
        Ok(names
            .into_iter()
            .filter(|name| {
                !is_transient_snapshot_name(name)
                    && (!is_image || name.as_str() != IMAGE_BASE_SNAPSHOT)
            })
            .collect())
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
        let parent_image = self.image_name(&snap.parent());
        let old_spec = format!("{parent_image}@{snap_name}");
        let new_spec = format!("{parent_image}@{new_snap_name}");
        let mut revert = Revert::new();
        self.run_rbd(&["snap", "rename", &old_spec, &new_spec])?;
        {
            let old_spec = old_spec.clone();
            let new_spec = new_spec.clone();
            revert.add(move || {
                let _ =
                    self.run_rbd(&["snap", "rename", &new_spec, &old_spec]);
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

    fn migration_types(
        &self,
        content_type: ContentType,
        refresh: bool,
        _copy_snapshots: bool,
        _cluster_move: bool,
        _storage_move: bool,
    ) -> Vec<MigrationType> {
        let byte_type = if content_type == ContentType::Filesystem {
            FsType::Rsync
        } else {
            FsType::BlockAndRsync
        };
        let byte_features = generic::byte_stream_features(&self.common, true);
        if refresh {
            // Refresh cannot assume a shared base image on the far
            // side, so only the byte-stream transport is offered.
            return vec![MigrationType {
                fs_type: byte_type,
                features: byte_features,
            }];
        }
        vec![
            // The native delta stream has no negotiable options.
            MigrationType { fs_type: FsType::Rbd, features: Vec::new() },
            MigrationType { fs_type: byte_type, features: byte_features },
        ]
    }

    fn migrate_volume(
        &self,
        vol: &Volume,
        conn: &mut dyn ReadWrite,
        args: &VolumeSourceArgs,
        op: &Operation,
    ) -> Result<()> {
        if args.migration_type.fs_type != FsType::Rbd {
            return generic::vfs_migrate_volume(self, vol, conn, args, op);
        }
        if args.cluster_move && !args.storage_move {
            // Same cluster, same OSD pool: the data is already where
            // the target needs it.
            return Ok(());
        }
        let image = self.image_name(vol);
        let mut last: Option<String> = None;
        if !args.volume_only {
            for snap in &args.snapshots {
                op.check_cancelled()?;
                let spec = format!("{image}@{snap}");
                self.send_image_diff(conn, &spec, last.as_deref())?;
                last = Some(snap.clone());
            }
        }
        op.check_cancelled()?;
        let marker = temp_copy_snapshot_name();
        let head_spec = format!("{image}@{marker}");
        self.run_rbd(&["snap", "create", &head_spec])?;
        let result = self.send_image_diff(conn, &head_spec, last.as_deref());
        if let Err(e) = self.run_rbd(&["snap", "rm", &head_spec]) {
            warn!(self.common.log(), "failed to remove transient snapshot";
                "snapshot" => head_spec.as_str(), "error" => %e);
        }
        result?;
        stream::send_end(conn)?;
        Ok(())
    }

    fn create_volume_from_migration(
        &self,
        vol: &Volume,
        conn: &mut dyn ReadWrite,
        args: &VolumeTargetArgs,
        op: &Operation,
    ) -> Result<()> {
        if args.migration_type.fs_type != FsType::Rbd {
            return generic::vfs_create_volume_from_migration(
                self, vol, conn, args, op,
            );
        }
        if !args.cluster_move_source_name.is_empty() {
            // Intra-cluster move: the image already exists here.
            vol.ensure_mount_path()?;
            return Ok(());
        }
        if args.refresh {
            return Err(Error::NotSupported);
        }
        let image = self.image_name(vol);
        if self.has_image(&image)? {
            return Err(Error::AlreadyExists(vol.name().to_string()));
        }
        let mut revert = Revert::new();
        let size = if args.volume_size > 0 {
            args.volume_size
        } else {
            self.volume_size_bytes(vol)?
        };
        self.create_image(&image, size)?;
        {
            let image = image.clone();
            revert.add(move || {
                if let Err(e) = self.run_rbd(&["rm", &image]) {
                    warn!(self.common.log(), "failed to remove partial image";
                        "image" => image.as_str(), "error" => %e);
                }
            });
        }
        if !args.volume_only {
            for _snap in &args.snapshots {
                op.check_cancelled()?;
                self.receive_image_diff(conn, &image)?;
            }
        }
        op.check_cancelled()?;
        self.receive_image_diff(conn, &image)?;
        // import-diff recreated the sender's boundary snapshots, the
        // transient head marker among them.
        for snap in self.image_snapshot_names(&image)? {
            if is_transient_snapshot_name(&snap) {
                let spec = format!("{image}@{snap}");
                if let Err(e) = self.run_rbd(&["snap", "rm", &spec]) {
                    warn!(self.common.log(),
                        "failed to remove transient snapshot";
                        "snapshot" => spec.as_str(), "error" => %e);
                }
            }
        }
        stream::recv_end(conn)?;
        vol.ensure_mount_path()?;
        revert.success();
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_logger, RecordingRunner};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn test_driver(
        root: &Path,
        config: &[(&str, &str)],
    ) -> (RbdDriver, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::new());
        let mut map = BTreeMap::new();
        for (key, value) in config {
            map.insert(key.to_string(), value.to_string());
        }
        let driver = RbdDriver::new(
            CommonDriver::new(
                format!("pool-{}", Uuid::new_v4()),
                map,
                root,
                test_logger(),
                runner.clone(),
            ),
            "18.2.2".to_string(),
        );
        (driver, runner)
    }

    fn rbd_cmd(d: &RbdDriver, rest: &str) -> String {
        format!(
            "rbd --id admin --cluster ceph --pool {} {rest}",
            d.common().pool_name()
        )
    }

    fn ceph_cmd(rest: &str) -> String {
        format!("ceph --name client.admin --cluster ceph {rest}")
    }

    fn custom_fs_volume(d: &RbdDriver, name: &str) -> Volume {
        d.common().new_volume(
            VolumeType::Custom,
            ContentType::Filesystem,
            name,
            BTreeMap::new(),
        )
    }

    #[test]
    fn create_pool_initializes_osd_pool_and_placeholder() {
        let root = tempfile::tempdir().unwrap();
        let (mut d, runner) = test_driver(root.path(), &[]);
        let pool = d.common().pool_name().to_string();
        runner.fail(
            &ceph_cmd(&format!("osd pool get {pool} pg_num")),
            "unrecognized pool",
        );

        d.create(&Operation::new()).unwrap();

        assert!(runner
            .call_index(&ceph_cmd(&format!("osd pool create {pool} 32")))
            .is_some());
        assert!(runner
            .call_index(&format!(
                "rbd --id admin --cluster ceph pool init {pool}"
            ))
            .is_some());
        assert!(runner
            .call_index(&rbd_cmd(
                &d,
                &format!(
                    "create --image-feature layering --size 0B internal_{pool}"
                )
            ))
            .is_some());
        let config = d.common().config();
        assert_eq!(config.get("rbd.cluster_name").unwrap(), "ceph");
        assert_eq!(config.get("rbd.user_name").unwrap(), "admin");
        assert_eq!(config.get("rbd.pg_num").unwrap(), "32");
        assert_eq!(config.get("volatile.pool.pristine").unwrap(), "true");
        assert!(d.common().pool_mount_path().exists());
    }

    #[test]
    fn existing_pool_with_placeholder_requires_force_reuse() {
        let root = tempfile::tempdir().unwrap();
        let (mut d, runner) = test_driver(root.path(), &[]);
        runner.respond(&ceph_cmd("osd pool get"), r#"{"pg_num":64}"#);

        // The placeholder image resolves as present, so the OSD pool
        // belongs to someone else.
        let err = d.create(&Operation::new()).unwrap_err();
        assert!(err.is_in_use());

        let (mut d, runner) =
            test_driver(root.path(), &[("rbd.force_reuse", "true")]);
        runner.respond(&ceph_cmd("osd pool get"), r#"{"pg_num":64}"#);
        d.create(&Operation::new()).unwrap();

        assert!(runner.call_index(&ceph_cmd("osd pool create")).is_none());
        let config = d.common().config();
        assert_eq!(config.get("rbd.pg_num").unwrap(), "64");
        assert_eq!(config.get("volatile.pool.pristine").unwrap(), "false");
    }

    #[test]
    fn delete_pool_only_removes_pristine_pools() {
        let root = tempfile::tempdir().unwrap();

        let (mut d, runner) = test_driver(
            root.path(),
            &[("volatile.pool.pristine", "true")],
        );
        let pool = d.common().pool_name().to_string();
        d.delete(&Operation::new()).unwrap();
        assert!(runner
            .call_index(&ceph_cmd(&format!(
                "osd pool delete {pool} {pool} --yes-i-really-really-mean-it"
            )))
            .is_some());
        assert!(runner.call_index(&rbd_cmd(&d, "rm internal_")).is_none());

        let (mut d, runner) = test_driver(
            root.path(),
            &[("volatile.pool.pristine", "false")],
        );
        let pool = d.common().pool_name().to_string();
        d.delete(&Operation::new()).unwrap();
        assert!(runner
            .call_index(&rbd_cmd(&d, &format!("rm internal_{pool}")))
            .is_some());
        assert!(runner.call_index(&ceph_cmd("osd pool delete")).is_none());
    }

    #[test]
    fn image_names_follow_backend_conventions() {
        let root = tempfile::tempdir().unwrap();
        let (d, _runner) = test_driver(root.path(), &[]);
        let common = d.common();

        let container = common.new_volume(
            VolumeType::Container,
            ContentType::Filesystem,
            "c1",
            BTreeMap::new(),
        );
        assert_eq!(d.image_name(&container), "container_c1");

        let vm = common.new_volume(
            VolumeType::Vm,
            ContentType::Block,
            "v1",
            BTreeMap::new(),
        );
        assert_eq!(d.image_name(&vm), "virtual-machine_v1.block");

        let image = common.new_volume(
            VolumeType::Image,
            ContentType::Block,
            "fp123",
            BTreeMap::new(),
        );
        assert_eq!(d.image_name(&image), "image_fp123_ext4.block");

        let dotted = common.new_volume(
            VolumeType::Custom,
            ContentType::Filesystem,
            "foo.vol",
            BTreeMap::new(),
        );
        assert_eq!(d.image_name(&dotted), "custom_foo.vol");

        let iso = common.new_volume(
            VolumeType::Custom,
            ContentType::Iso,
            "media",
            BTreeMap::new(),
        );
        assert_eq!(d.image_name(&iso), "custom_media.iso");

        let snap =
            custom_fs_volume(&d, "data").new_snapshot("s1").unwrap();
        assert_eq!(d.image_name(&snap), "custom_data@s1");
    }

    #[test]
    fn list_volumes_skips_zombies_and_placeholder() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let pool = d.common().pool_name().to_string();
        runner.respond(
            &rbd_cmd(&d, "ls --format json"),
            &format!(
                r#"["container_c1", "zombie_container_old_0d2c3e", "custom_data",
                    "image_fp123_ext4", "internal_{pool}",
                    "virtual-machine_v1.block", "custom_media.iso"]"#
            ),
        );

        let volumes = d.list_volumes().unwrap();
        let described: Vec<(VolumeType, ContentType, String)> = volumes
            .iter()
            .map(|v| (v.vol_type(), v.content_type(), v.name().to_string()))
            .collect();
        assert_eq!(
            described,
            vec![
                (
                    VolumeType::Container,
                    ContentType::Filesystem,
                    "c1".to_string()
                ),
                (
                    VolumeType::Custom,
                    ContentType::Filesystem,
                    "data".to_string()
                ),
                (
                    VolumeType::Image,
                    ContentType::Filesystem,
                    "fp123".to_string()
                ),
                (VolumeType::Vm, ContentType::Block, "v1".to_string()),
                (VolumeType::Custom, ContentType::Iso, "media".to_string()),
            ]
        );
        let image = &volumes[2];
        assert_eq!(image.config().get("block.filesystem").unwrap(), "ext4");
    }

    #[test]
    fn validate_rejects_unknown_and_malformed_keys() {
        let root = tempfile::tempdir().unwrap();
        let (d, _runner) = test_driver(root.path(), &[]);

        let mut config = BTreeMap::new();
        config.insert("rbd.bogus".to_string(), "x".to_string());
        config.insert("rbd.pg_num".to_string(), "many".to_string());
        let err = d.validate(&mut config).unwrap_err();
        let Error::ConfigInvalid(problems) = err else {
            panic!("expected config error");
        };
        assert_eq!(problems.len(), 2);

        let mut config = BTreeMap::new();
        config.insert("rbd.pg_num".to_string(), "128".to_string());
        config.insert("user.notes".to_string(), "anything".to_string());
        d.validate(&mut config).unwrap();
    }

    #[test]
    fn create_volume_formats_filesystem_content() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let vol = custom_fs_volume(&d, "v1");
        runner.fail(&rbd_cmd(&d, "info custom_v1"), "no such image");
        runner.respond(&rbd_cmd(&d, "map custom_v1"), "/dev/rbd0\n");

        d.create_volume(&vol, None, &Operation::new()).unwrap();

        assert!(runner
            .call_index(&rbd_cmd(
                &d,
                "create --image-feature layering --size 10737418240B custom_v1"
            ))
            .is_some());
        assert!(runner
            .call_index("mkfs.ext4 -E nodiscard -F /dev/rbd0")
            .is_some());
        assert!(runner.call_index(&rbd_cmd(&d, "unmap /dev/rbd0")).is_some());
        assert!(vol.mount_path().exists());
    }

    #[test]
    fn create_block_volume_skips_device_setup() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let vol = d.common().new_volume(
            VolumeType::Custom,
            ContentType::Block,
            "b1",
            BTreeMap::new(),
        );
        runner.fail(&rbd_cmd(&d, "info custom_b1.block"), "no such image");

        d.create_volume(&vol, None, &Operation::new()).unwrap();

        assert!(runner
            .call_index(&rbd_cmd(
                &d,
                "create --image-feature layering --size 10737418240B \
                 custom_b1.block"
            ))
            .is_some());
        assert!(runner.call_index(&rbd_cmd(&d, "map ")).is_none());
        assert!(vol.mount_path().exists());
    }

    #[test]
    fn delete_volume_with_snapshots_requires_cascade() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let vol = custom_fs_volume(&d, "a");
        runner.respond(
            &rbd_cmd(&d, "snap ls --format json custom_a"),
            r#"[{"name":"s1"},{"name":"s2"}]"#,
        );

        let err = d.delete_volume(&vol, &Operation::new()).unwrap_err();
        let Error::RequiresCascade(blocking) = err else {
            panic!("expected cascade error");
        };
        assert_eq!(blocking, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn volume_with_cloned_snapshot_is_parked_as_zombie() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let image_vol = d.common().new_volume(
            VolumeType::Image,
            ContentType::Filesystem,
            "fp123",
            BTreeMap::new(),
        );
        runner.respond(
            &rbd_cmd(&d, "snap ls --format json image_fp123_ext4"),
            r#"[{"name":"readonly"}]"#,
        );
        runner.respond(
            &rbd_cmd(&d, "children --format json image_fp123_ext4@readonly"),
            r#"[{"pool":"x","image":"container_c1"}]"#,
        );

        d.delete_volume(&image_vol, &Operation::new()).unwrap();

        let rename = runner
            .calls()
            .into_iter()
            .find(|c| {
                c.starts_with(&rbd_cmd(
                    &d,
                    "rename image_fp123_ext4 zombie_image_fp123_ext4_",
                ))
            })
            .expect("image parked under zombie name");
        assert!(!rename.is_empty());
        let removed = rbd_cmd(&d, "rm image_fp123_ext4");
        assert!(runner.calls().iter().all(|c| c != &removed));
    }

    #[test]
    fn snapshot_with_clone_is_parked_then_swept_on_last_clone_delete() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let pool = d.common().pool_name().to_string();
        let op = Operation::new();

        let vol_a = custom_fs_volume(&d, "a");
        let snap = vol_a.new_snapshot("s1").unwrap();
        runner.respond(
            &rbd_cmd(&d, "children --format json custom_a@s1"),
            &format!(r#"[{{"pool":"{pool}","image":"custom_b"}}]"#),
        );

        d.delete_volume_snapshot(&snap, &op).unwrap();

        let rename = runner
            .calls()
            .into_iter()
            .find(|c| c.starts_with(&rbd_cmd(&d, "snap rename custom_a@s1 ")))
            .expect("snapshot parked under deletion marker");
        let marker = rename.rsplit('@').next().unwrap().to_string();
        assert!(marker.starts_with("deleted-"));

        // Deleting the last clone sweeps the parked snapshot but leaves
        // the live origin volume alone.
        runner.respond(
            &rbd_cmd(&d, "info --format json custom_b"),
            &format!(
                r#"{{"size":1024,"parent":{{"pool":"{pool}","image":"custom_a","snapshot":"{marker}"}}}}"#
            ),
        );
        let vol_b = custom_fs_volume(&d, "b");
        d.delete_volume(&vol_b, &op).unwrap();

        let removed_clone = rbd_cmd(&d, "rm custom_b");
        assert!(runner.calls().iter().any(|c| c == &removed_clone));
        assert!(runner
            .call_index(&rbd_cmd(&d, &format!("snap rm custom_a@{marker}")))
            .is_some());
        let removed_origin = rbd_cmd(&d, "rm custom_a");
        assert!(runner.calls().iter().all(|c| c != &removed_origin));
    }

    #[test]
    fn cheap_copy_clones_via_protected_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let src = custom_fs_volume(&d, "a");
        let dst = custom_fs_volume(&d, "b");
        runner.fail(&rbd_cmd(&d, "info custom_b"), "no such image");

        d.create_volume_from_copy(&dst, &src, false, false, &Operation::new())
            .unwrap();

        let snap_create = runner
            .call_index(&rbd_cmd(&d, "snap create custom_a@copy-"))
            .expect("transient clone base created");
        let protect = runner
            .call_index(&rbd_cmd(&d, "snap protect custom_a@copy-"))
            .expect("clone base protected");
        let clone = runner
            .call_index(&rbd_cmd(&d, "clone custom_a@copy-"))
            .expect("clone created");
        assert!(snap_create < protect && protect < clone);
        let clone_line = &runner.calls()[clone];
        assert!(clone_line.ends_with(" custom_b"));
    }

    #[test]
    fn full_copy_replays_snapshot_deltas() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let src = custom_fs_volume(&d, "a");
        let dst = custom_fs_volume(&d, "b");
        runner.fail(&rbd_cmd(&d, "info custom_b"), "no such image");
        runner.respond(
            &rbd_cmd(&d, "snap ls --format json custom_a"),
            r#"[{"name":"s1"},{"name":"s2"}]"#,
        );
        runner.respond(
            &rbd_cmd(&d, "info --format json custom_a"),
            r#"{"size":5368709120}"#,
        );

        d.create_volume_from_copy(&dst, &src, true, false, &Operation::new())
            .unwrap();

        assert!(runner
            .call_index(&rbd_cmd(
                &d,
                "create --image-feature layering --size 5368709120B custom_b"
            ))
            .is_some());
        let exports: Vec<String> = runner
            .calls()
            .into_iter()
            .filter(|c| c.starts_with(&rbd_cmd(&d, "export-diff")))
            .collect();
        assert_eq!(exports.len(), 3);
        assert!(exports[0].contains("export-diff custom_a@s1 -"));
        assert!(exports[1].contains("--from-snap s1 custom_a@s2"));
        assert!(exports[2].contains("--from-snap s2 custom_a@copy-"));
        let imports = runner
            .calls()
            .iter()
            .filter(|c| c.starts_with(&rbd_cmd(&d, "import-diff - custom_b")))
            .count();
        assert_eq!(imports, 3);
        assert!(runner
            .call_index(&rbd_cmd(&d, "snap rm custom_a@copy-"))
            .is_some());
        assert!(runner
            .call_index(&rbd_cmd(&d, "snap rm custom_b@copy-"))
            .is_some());
    }

    #[test]
    fn quota_shrink_resizes_filesystem_before_device() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let pool = d.common().pool_name().to_string();
        let vol = custom_fs_volume(&d, "a");
        runner.respond(
            &rbd_cmd(&d, "info --format json custom_a"),
            r#"{"size":10737418240}"#,
        );
        runner.respond(
            &rbd_cmd(&d, "showmapped --format json"),
            &format!(
                r#"[{{"pool":"{pool}","name":"custom_a","snap":"-","device":"/dev/rbd0"}}]"#
            ),
        );

        d.set_volume_quota(&vol, "5GiB", false, &Operation::new()).unwrap();

        let fs_resize = runner
            .call_index("resize2fs /dev/rbd0")
            .expect("filesystem shrunk");
        let dev_resize = runner
            .call_index(&rbd_cmd(&d, "resize --allow-shrink"))
            .expect("device shrunk");
        assert!(fs_resize < dev_resize);
        // The device was already mapped, so it stays mapped.
        assert!(runner.call_index(&rbd_cmd(&d, "unmap")).is_none());
    }

    #[test]
    fn quota_grow_resizes_device_before_filesystem() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let vol = custom_fs_volume(&d, "a");
        runner.respond(
            &rbd_cmd(&d, "info --format json custom_a"),
            r#"{"size":10737418240}"#,
        );
        runner.respond(&rbd_cmd(&d, "map custom_a"), "/dev/rbd0\n");

        d.set_volume_quota(&vol, "20GiB", false, &Operation::new()).unwrap();

        let dev_resize = runner
            .call_index(&rbd_cmd(&d, "resize --size 21474836480B custom_a"))
            .expect("device grown");
        let fs_resize = runner
            .call_index("resize2fs /dev/rbd0")
            .expect("filesystem grown");
        assert!(dev_resize < fs_resize);
        assert!(runner.call_index(&rbd_cmd(&d, "unmap /dev/rbd0")).is_some());
    }

    #[test]
    fn usage_prefers_cache_and_falls_back_to_direct_queries() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let vol = custom_fs_volume(&d, "a");
        runner.respond(
            &rbd_cmd(&d, "disk-usage --format json custom_b"),
            r#"{"images":[{"name":"custom_b","provisioned_size":77,"used_size":33}]}"#,
        );
        runner.respond(
            &rbd_cmd(&d, "disk-usage --format json"),
            r#"{"images":[
                {"name":"custom_a","provisioned_size":100,"used_size":40},
                {"name":"custom_a","snapshot":"s1","provisioned_size":100,"used_size":10}
            ]}"#,
        );

        d.cache_volume_snapshots(&vol).unwrap();
        assert_eq!(d.get_volume_usage(&vol).unwrap(), 40);
        let snap = vol.new_snapshot("s1").unwrap();
        assert_eq!(d.get_volume_usage(&snap).unwrap(), 10);
        // Both answers came from the one bulk query.
        let bulk_queries = runner
            .calls()
            .iter()
            .filter(|c| c.starts_with(&rbd_cmd(&d, "disk-usage")))
            .count();
        assert_eq!(bulk_queries, 1);

        // Cache miss goes straight to the backend.
        let other = custom_fs_volume(&d, "b");
        assert_eq!(d.get_volume_usage(&other).unwrap(), 33);

        let (d, runner) =
            test_driver(root.path(), &[("rbd.use_provisioned", "true")]);
        runner.respond(
            &rbd_cmd(&d, "disk-usage --format json custom_b"),
            r#"{"images":[{"name":"custom_b","provisioned_size":77,"used_size":33}]}"#,
        );
        let other = custom_fs_volume(&d, "b");
        assert_eq!(d.get_volume_usage(&other).unwrap(), 77);
    }

    #[test]
    fn offers_native_delta_with_byte_stream_fallback() {
        let root = tempfile::tempdir().unwrap();
        let (d, _runner) = test_driver(root.path(), &[]);

        let types =
            d.migration_types(ContentType::Filesystem, false, true, false, false);
        assert_eq!(types.len(), 2);
        assert_eq!(types[0].fs_type, FsType::Rbd);
        assert!(types[0].features.is_empty());
        assert_eq!(types[1].fs_type, FsType::Rsync);
        assert!(!types[1].features.is_empty());

        let types =
            d.migration_types(ContentType::Block, false, false, false, false);
        assert_eq!(types[1].fs_type, FsType::BlockAndRsync);

        let refresh =
            d.migration_types(ContentType::Filesystem, true, true, false, false);
        assert_eq!(refresh.len(), 1);
        assert_eq!(refresh[0].fs_type, FsType::Rsync);
    }

    #[test]
    fn native_migration_replays_deltas_on_the_receiver() {
        let root = tempfile::tempdir().unwrap();
        let (sender, sender_runner) = test_driver(root.path(), &[]);
        let src = custom_fs_volume(&sender, "m");
        sender_runner.respond(
            &rbd_cmd(&sender, "export-diff custom_m@s1 -"),
            "DELTA-ONE",
        );
        sender_runner.respond(
            &rbd_cmd(&sender, "export-diff --from-snap s1 custom_m@copy-"),
            "DELTA-TWO",
        );

        let mut conn = Cursor::new(Vec::new());
        let source_args = VolumeSourceArgs {
            name: "m".to_string(),
            snapshots: vec!["s1".to_string()],
            migration_type: MigrationType {
                fs_type: FsType::Rbd,
                features: Vec::new(),
            },
            ..Default::default()
        };
        sender
            .migrate_volume(&src, &mut conn, &source_args, &Operation::new())
            .unwrap();
        assert!(sender_runner
            .call_index(&rbd_cmd(&sender, "snap create custom_m@copy-"))
            .is_some());
        assert!(sender_runner
            .call_index(&rbd_cmd(&sender, "snap rm custom_m@copy-"))
            .is_some());

        conn.seek(SeekFrom::Start(0)).unwrap();
        let (receiver, receiver_runner) = test_driver(root.path(), &[]);
        let dst = custom_fs_volume(&receiver, "m");
        receiver_runner
            .fail(&rbd_cmd(&receiver, "info custom_m"), "no such image");
        receiver_runner.respond(
            &rbd_cmd(&receiver, "snap ls --format json custom_m"),
            r#"[{"name":"s1"},{"name":"copy-7aa1b2c3"}]"#,
        );
        let target_args = VolumeTargetArgs {
            name: "m".to_string(),
            snapshots: vec!["s1".to_string()],
            migration_type: MigrationType {
                fs_type: FsType::Rbd,
                features: Vec::new(),
            },
            ..Default::default()
        };
        receiver
            .create_volume_from_migration(
                &dst,
                &mut conn,
                &target_args,
                &Operation::new(),
            )
            .unwrap();

        assert!(receiver_runner
            .call_index(&rbd_cmd(
                &receiver,
                "create --image-feature layering --size 10737418240B custom_m"
            ))
            .is_some());
        let imports = receiver_runner
            .calls()
            .iter()
            .filter(|c| {
                c.starts_with(&rbd_cmd(&receiver, "import-diff - custom_m"))
            })
            .count();
        assert_eq!(imports, 2);
        assert!(receiver_runner
            .call_index(&rbd_cmd(
                &receiver,
                "snap rm custom_m@copy-7aa1b2c3"
            ))
            .is_some());
        assert!(dst.mount_path().exists());
    }

    #[test]
    fn intra_cluster_move_transfers_no_data() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let vol = custom_fs_volume(&d, "m");
        let mut conn = Cursor::new(Vec::new());
        let args = VolumeSourceArgs {
            name: "m".to_string(),
            migration_type: MigrationType {
                fs_type: FsType::Rbd,
                features: Vec::new(),
            },
            cluster_move: true,
            ..Default::default()
        };

        d.migrate_volume(&vol, &mut conn, &args, &Operation::new()).unwrap();

        assert!(runner.calls().is_empty());
        assert!(conn.into_inner().is_empty());
    }

    #[test]
    fn mount_volume_maps_device_and_tracks_references() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let pool = d.common().pool_name().to_string();
        let vol = custom_fs_volume(&d, "a");
        let op = Operation::new();

        let mounted = Arc::new(AtomicBool::new(false));
        let mapped = Arc::new(AtomicBool::new(false));
        {
            let mounted = mounted.clone();
            runner.handle("mountpoint -q", move |_| {
                if mounted.load(Ordering::SeqCst) {
                    Ok(String::new())
                } else {
                    Err(CmdError::Failed {
                        program: "mountpoint".to_string(),
                        code: 1,
                        stdout: String::new(),
                        stderr: String::new(),
                    })
                }
            });
        }
        {
            let mapped = mapped.clone();
            let pool = pool.clone();
            runner.handle(
                &rbd_cmd(&d, "showmapped --format json"),
                move |_| {
                    if mapped.load(Ordering::SeqCst) {
                        Ok(format!(
                            r#"[{{"pool":"{pool}","name":"custom_a","snap":"-","device":"/dev/rbd0"}}]"#
                        ))
                    } else {
                        Ok("[]".to_string())
                    }
                },
            );
        }
        {
            let mapped = mapped.clone();
            runner.handle(&rbd_cmd(&d, "map custom_a"), move |_| {
                mapped.store(true, Ordering::SeqCst);
                Ok("/dev/rbd0\n".to_string())
            });
        }
        {
            let mounted = mounted.clone();
            runner.handle("mount -t ext4", move |_| {
                mounted.store(true, Ordering::SeqCst);
                Ok(String::new())
            });
        }
        {
            let mounted = mounted.clone();
            runner.handle("umount", move |_| {
                mounted.store(false, Ordering::SeqCst);
                Ok(String::new())
            });
        }
        {
            let mapped = mapped.clone();
            runner.handle(&rbd_cmd(&d, "unmap"), move |_| {
                mapped.store(false, Ordering::SeqCst);
                Ok(String::new())
            });
        }

        d.mount_volume(&vol, &op).unwrap();
        d.mount_volume(&vol, &op).unwrap();
        let mounts = runner
            .calls()
            .iter()
            .filter(|c| c.starts_with("mount -t ext4"))
            .count();
        assert_eq!(mounts, 1);

        let err = d.unmount_volume(&vol, false, &op).unwrap_err();
        assert!(err.is_in_use());

        assert!(d.unmount_volume(&vol, false, &op).unwrap());
        assert!(runner.call_index("umount").is_some());
        assert!(runner.call_index(&rbd_cmd(&d, "unmap /dev/rbd0")).is_some());
        assert!(!mounted.load(Ordering::SeqCst));
        assert!(!mapped.load(Ordering::SeqCst));
    }

    #[test]
    fn restore_requires_an_existing_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let vol = custom_fs_volume(&d, "a");
        let op = Operation::new();
        runner.respond(
            &rbd_cmd(&d, "snap ls --format json custom_a"),
            r#"[{"name":"s1"}]"#,
        );

        let err = d.restore_volume(&vol, "s9", &op).unwrap_err();
        assert!(err.is_not_found());

        vol.mount_ref_count_increment();
        let err = d.restore_volume(&vol, "s1", &op).unwrap_err();
        assert!(err.is_in_use());
        vol.mount_ref_count_decrement();

        d.restore_volume(&vol, "s1", &op).unwrap();
        assert!(runner
            .call_index(&rbd_cmd(&d, "snap rollback custom_a@s1"))
            .is_some());
    }

    #[test]
    fn restore_to_earlier_snapshot_requires_cascade() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let vol = custom_fs_volume(&d, "a");
        let op = Operation::new();
        runner.respond(
            &rbd_cmd(&d, "snap ls --format json custom_a"),
            r#"[{"name":"s1"},{"name":"deleted-3d4e5f"},{"name":"s2"}]"#,
        );

        let err = d.restore_volume(&vol, "s1", &op).unwrap_err();
        let Error::RequiresCascade(blocking) = err else {
            panic!("expected cascade error");
        };
        assert_eq!(blocking, vec!["s2".to_string()]);
        assert!(runner.call_index(&rbd_cmd(&d, "snap rollback")).is_none());

        // The newest user snapshot can be rolled back to; parked
        // markers behind it do not block.
        d.restore_volume(&vol, "s2", &op).unwrap();
        assert!(runner
            .call_index(&rbd_cmd(&d, "snap rollback custom_a@s2"))
            .is_some());
    }

    #[test]
    fn snapshot_listing_hides_internal_markers() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let image_vol = d.common().new_volume(
            VolumeType::Image,
            ContentType::Filesystem,
            "fp123",
            BTreeMap::new(),
        );
        runner.respond(
            &rbd_cmd(&d, "snap ls --format json image_fp123_ext4"),
            r#"[{"name":"readonly"},{"name":"copy-0a1b2c"},
                {"name":"deleted-3d4e5f"},{"name":"user1"}]"#,
        );

        let names =
            d.volume_snapshots(&image_vol, &Operation::new()).unwrap();
        assert_eq!(names, vec!["user1".to_string()]);
    }

    #[test]
    fn rename_volume_renames_image_and_snapshot_specs() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let vol = custom_fs_volume(&d, "a");
        let op = Operation::new();

        d.rename_volume(&vol, "b", &op).unwrap();
        assert!(runner
            .call_index(&rbd_cmd(&d, "rename custom_a custom_b"))
            .is_some());

        let snap = vol.new_snapshot("s1").unwrap();
        d.create_volume_snapshot(&snap, &op).unwrap();
        assert!(runner
            .call_index(&rbd_cmd(&d, "snap create custom_a@s1"))
            .is_some());

        d.rename_volume_snapshot(&snap, "s2", &op).unwrap();
        assert!(runner
            .call_index(&rbd_cmd(&d, "snap rename custom_a@s1 custom_a@s2"))
            .is_some());
        assert!(vol.new_snapshot("s2").unwrap().mount_path().exists());
    }

    #[test]
    fn get_resources_reads_pool_usage_from_ceph_df() {
        let root = tempfile::tempdir().unwrap();
        let (d, runner) = test_driver(root.path(), &[]);
        let pool = d.common().pool_name().to_string();
        runner.respond(
            &ceph_cmd("df -f json"),
            &format!(
                r#"{{"pools":[{{"name":"{pool}","stats":{{"bytes_used":1000,"max_avail":9000}}}}]}}"#
            ),
        );

        let resources = d.get_resources().unwrap();
        assert_eq!(resources.space_total, 10000);
        assert_eq!(resources.space_used, 1000);
        assert_eq!(resources.inodes_total, 0);

        let (d, runner) =
            test_driver(root.path(), &[("rbd.osd_pool_name", "elsewhere")]);
        runner.respond(
            &ceph_cmd("df -f json"),
            r#"{"pools":[{"name":"other","stats":{"bytes_used":1,"max_avail":1}}]}"#,
        );
        let err = d.get_resources().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
