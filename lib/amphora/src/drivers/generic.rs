// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic volume operations shared by every backend that exposes its
//! volumes as host paths. Backends with native primitives override the
//! corresponding [`Driver`] methods; everything here only assumes a
//! mountable directory per volume and a raw image file for block
//! content.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use slog::{debug, warn};

use crate::backup;
use crate::cmd::CmdError;
use crate::error::{Error, Result, ResultExt};
use crate::migration::{VolumeSourceArgs, VolumeTargetArgs};
use crate::op::{Operation, ProgressTracker};
use crate::revert::Revert;
use crate::stream::{self, ReadWrite, SendOptions};
use crate::volume::{ContentType, Volume, VolumeType};

use super::{CommonDriver, Driver, PoolResources, BLOCK_FILE_NAME};

/// Filesystem space accounting for a mounted path.
#[cfg(unix)]
pub fn statvfs_resources(path: &Path) -> Result<PoolResources> {
    use std::os::unix::ffi::OsStrExt;

    let c = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::NotFound(format!("path {}", path.display())))?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let frsize =
        if st.f_frsize > 0 { st.f_frsize } else { st.f_bsize } as u64;
    Ok(PoolResources {
        space_total: st.f_blocks as u64 * frsize,
        space_used: (st.f_blocks as u64)
            .saturating_sub(st.f_bfree as u64)
            * frsize,
        inodes_total: st.f_files as u64,
        inodes_used: (st.f_files as u64).saturating_sub(st.f_ffree as u64),
    })
}

#[cfg(not(unix))]
pub fn statvfs_resources(_path: &Path) -> Result<PoolResources> {
    Err(Error::NotSupported)
}

pub fn vfs_has_volume(vol: &Volume) -> Result<bool> {
    Ok(vol.mount_path().exists())
}

/// Location of the raw image file for block and ISO content.
pub fn vfs_disk_path(vol: &Volume) -> Result<PathBuf> {
    if vol.content_type() == ContentType::Filesystem && !vol.is_vm_block() {
        return Err(Error::NotSupported);
    }
    Ok(vol.mount_path().join(BLOCK_FILE_NAME))
}

/// Snapshot names of a volume, sorted, from its snapshots directory.
pub fn vfs_volume_snapshots(
    vol: &Volume,
    _op: &Operation,
) -> Result<Vec<String>> {
    let dir = vol.snapshots_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = fs::read_dir(&dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

/// Removes a volume's snapshots directory once its last snapshot is
/// gone. Non-empty directories are left alone.
pub fn prune_empty_snapshots_dir(vol: &Volume) -> Result<()> {
    match fs::remove_dir(vol.snapshots_dir()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn vfs_rename_volume(
    common: &CommonDriver,
    vol: &Volume,
    new_name: &str,
    _op: &Operation,
) -> Result<()> {
    let new_vol = common.new_volume(
        vol.vol_type(),
        vol.content_type(),
        new_name,
        vol.config().clone(),
    );

    let mut revert = Revert::new();

    let old_path = vol.mount_path();
    let new_path = new_vol.mount_path();
    if old_path.exists() {
        if new_path.exists() {
            return Err(Error::AlreadyExists(format!("volume {new_name}")));
        }
        fs::rename(&old_path, &new_path)
            .context("rename volume", vol.name().to_string())?;
        let (from, to) = (new_path.clone(), old_path.clone());
        revert.add(move || {
            let _ = fs::rename(&from, &to);
        });
    }

    let old_snaps = vol.snapshots_dir();
    let new_snaps = new_vol.snapshots_dir();
    if old_snaps.exists() {
        fs::rename(&old_snaps, &new_snaps)
            .context("rename volume snapshots", vol.name().to_string())?;
        revert.add(move || {
            let _ = fs::rename(&new_snaps, &old_snaps);
        });
    }

    revert.success();
    Ok(())
}

pub fn vfs_rename_volume_snapshot(
    common: &CommonDriver,
    snap: &Volume,
    new_snap_name: &str,
    _op: &Operation,
) -> Result<()> {
    let snap_name = snap.snapshot_name().ok_or_else(|| {
        Error::NotFound(format!("snapshot of {}", snap.name()))
    })?;
    let new_snap = snap.parent().new_snapshot(new_snap_name)?;

    let old_path = snap.mount_path();
    let new_path = new_snap.mount_path();
    if new_path.exists() {
        return Err(Error::AlreadyExists(format!(
            "snapshot {new_snap_name}"
        )));
    }
    fs::rename(&old_path, &new_path)
        .context("rename snapshot", snap_name.to_string())?;
    debug!(common.log(), "renamed snapshot";
        "from" => snap.name(), "to" => new_snap_name);
    Ok(())
}

/// Enumerates volumes from the pool's on-disk layout. Block content is
/// recognized by the presence of the raw image file.
pub fn vfs_list_volumes(common: &CommonDriver) -> Result<Vec<Volume>> {
    let mut volumes = Vec::new();
    for vol_type in [
        VolumeType::Container,
        VolumeType::Vm,
        VolumeType::Image,
        VolumeType::Custom,
        VolumeType::Bucket,
    ] {
        let type_dir: &'static str = vol_type.into();
        let dir = common.pool_mount_path().join(type_dir);
        if !dir.exists() {
            continue;
        }
        let mut names: Vec<String> = fs::read_dir(&dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        for name in names {
            let content_type = if vol_type == VolumeType::Vm
                || dir.join(&name).join(BLOCK_FILE_NAME).exists()
            {
                ContentType::Block
            } else {
                ContentType::Filesystem
            };
            volumes.push(common.new_volume(
                vol_type,
                content_type,
                name,
                Default::default(),
            ));
        }
    }
    Ok(volumes)
}

/// Total bytes used by a tree, counting regular files only and not
/// following symlinks.
pub fn tree_size_bytes(path: &Path) -> Result<i64> {
    let mut total: i64 = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            total += tree_size_bytes(&entry.path())?;
        } else {
            total += meta.len() as i64;
        }
    }
    Ok(total)
}

fn copy_entry_times(src_meta: &fs::Metadata, dst: &Path) {
    if let Ok(modified) = src_meta.modified() {
        if let Ok(secs) =
            modified.duration_since(std::time::UNIX_EPOCH)
        {
            let _ = crate::stream::sys::set_mtime(dst, secs.as_secs() as i64);
        }
    }
}

fn copy_tree_inner(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let src_path = src.join(&name);
        let dst_path = dst.join(&name);
        let meta = fs::symlink_metadata(&src_path)?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            match fs::symlink_metadata(&dst_path) {
                Ok(existing) if !existing.is_dir() => {
                    fs::remove_file(&dst_path)?;
                }
                _ => (),
            }
            fs::create_dir_all(&dst_path)?;
            copy_tree_inner(&src_path, &dst_path)?;
            fs::set_permissions(&dst_path, meta.permissions())?;
            copy_entry_times(&meta, &dst_path);
        } else if file_type.is_symlink() {
            match fs::remove_file(&dst_path) {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => return Err(e.into()),
            }
            let target = fs::read_link(&src_path)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dst_path)?;
            #[cfg(not(unix))]
            let _ = target;
        } else {
            if dst_path.is_dir() {
                fs::remove_dir_all(&dst_path)?;
            }
            fs::copy(&src_path, &dst_path)?;
            copy_entry_times(&meta, &dst_path);
        }
    }
    Ok(())
}

fn prune_tree_extras(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(dst)? {
        let entry = entry?;
        let name = entry.file_name();
        let src_path = src.join(&name);
        let dst_path = dst.join(&name);
        let dst_meta = fs::symlink_metadata(&dst_path)?;

        match fs::symlink_metadata(&src_path) {
            Ok(src_meta) => {
                if src_meta.is_dir() && dst_meta.is_dir() {
                    prune_tree_extras(&src_path, &dst_path)?;
                } else if src_meta.is_dir() != dst_meta.is_dir() {
                    if dst_meta.is_dir() {
                        fs::remove_dir_all(&dst_path)?;
                    } else {
                        fs::remove_file(&dst_path)?;
                    }
                }
            }
            Err(_) => {
                if dst_meta.is_dir() {
                    fs::remove_dir_all(&dst_path)?;
                } else {
                    fs::remove_file(&dst_path)?;
                }
            }
        }
    }
    Ok(())
}

/// Mirrors `src` into `dst`, preserving modes, mtimes and symlinks.
/// With `prune`, destination entries absent from the source are
/// removed, making the destination an exact mirror.
pub fn copy_tree(src: &Path, dst: &Path, prune: bool) -> Result<()> {
    fs::create_dir_all(dst)?;
    copy_tree_inner(src, dst)?;
    if prune {
        prune_tree_extras(src, dst)?;
    }
    Ok(())
}

/// Creates or resizes the sparse image file backing a block volume.
/// Returns whether the size changed. Shrinking an existing image is
/// refused unless the caller opted into unsafe resizes, since the
/// contained data would be truncated.
pub fn ensure_volume_block_file(
    path: &Path,
    size_bytes: i64,
    allow_unsafe_resize: bool,
) -> Result<bool> {
    if size_bytes <= 0 {
        return Ok(false);
    }

    match fs::metadata(path) {
        Ok(meta) => {
            let current = meta.len() as i64;
            if current == size_bytes {
                return Ok(false);
            }
            if size_bytes < current && !allow_unsafe_resize {
                return Err(Error::CannotShrink);
            }
            let file = File::options().write(true).open(path)?;
            file.set_len(size_bytes as u64)?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let file = File::create(path)?;
            file.set_len(size_bytes as u64)?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

/// Whether a filesystem type supports shrinking at all.
pub fn fs_shrinkable(fs_type: &str) -> bool {
    matches!(fs_type, "ext4" | "btrfs")
}

/// Formats a device with the given filesystem.
pub fn make_file_system(
    common: &CommonDriver,
    fs_type: &str,
    dev_path: &Path,
) -> Result<()> {
    let dev = dev_path.to_string_lossy().into_owned();
    let program = format!("mkfs.{fs_type}");
    let args: Vec<&str> = match fs_type {
        "ext4" => vec!["-E", "nodiscard", "-F", &dev],
        "xfs" => vec!["-K", "-f", &dev],
        "btrfs" => vec!["-f", &dev],
        _ => vec![&dev],
    };
    common.runner().run(&program, &args)?;
    Ok(())
}

/// Shrinks the filesystem on `dev_path` to `size_bytes`. Must run
/// before the underlying device is shrunk.
pub fn shrink_file_system(
    common: &CommonDriver,
    fs_type: &str,
    dev_path: &Path,
    vol: &Volume,
    size_bytes: i64,
) -> Result<()> {
    let dev = dev_path.to_string_lossy().into_owned();
    match fs_type {
        "ext4" => {
            // e2fsck exits 1 after repairing correctable issues.
            match common.runner().run("e2fsck", &["-f", "-y", &dev]) {
                Ok(_) => (),
                Err(CmdError::Failed { code: 1 | 2, .. }) => (),
                Err(e) => return Err(e.into()),
            }
            let size_k = format!("{}K", size_bytes / 1024);
            common.runner().run("resize2fs", &[&dev, &size_k])?;
            Ok(())
        }
        "btrfs" => {
            let mount = vol.mount_path().to_string_lossy().into_owned();
            let size = size_bytes.to_string();
            common.runner().run(
                "btrfs",
                &["filesystem", "resize", &size, &mount],
            )?;
            Ok(())
        }
        _ => Err(Error::CannotShrink),
    }
}

/// Grows the filesystem on `dev_path` to fill the device. Must run
/// after the underlying device has been grown.
pub fn grow_file_system(
    common: &CommonDriver,
    fs_type: &str,
    dev_path: &Path,
    vol: &Volume,
) -> Result<()> {
    let dev = dev_path.to_string_lossy().into_owned();
    match fs_type {
        "ext4" => {
            common.runner().run("resize2fs", &[&dev])?;
            Ok(())
        }
        "xfs" => {
            let mount = vol.mount_path().to_string_lossy().into_owned();
            common.runner().run("xfs_growfs", &[&mount])?;
            Ok(())
        }
        "btrfs" => {
            let mount = vol.mount_path().to_string_lossy().into_owned();
            common
                .runner()
                .run("btrfs", &["filesystem", "resize", "max", &mount])?;
            Ok(())
        }
        other => {
            Err(Error::ConfigInvalid(vec![format!(
                "block.filesystem: cannot grow {other}"
            )]))
        }
    }
}

/// Resizes a filesystem-bearing block volume, keeping the filesystem
/// inside the bounds of the device at every step: the filesystem
/// shrinks before the device does, and the device grows before the
/// filesystem does. `resize_device` performs the backend device resize
/// to the requested byte size.
pub fn resize_with_filesystem(
    common: &CommonDriver,
    vol: &Volume,
    dev_path: &Path,
    fs_type: &str,
    old_bytes: i64,
    new_bytes: i64,
    allow_unsafe_resize: bool,
    resize_device: &mut dyn FnMut(i64) -> Result<()>,
) -> Result<()> {
    if new_bytes == old_bytes {
        return Ok(());
    }

    if new_bytes < old_bytes {
        if !allow_unsafe_resize {
            if !fs_shrinkable(fs_type) {
                return Err(Error::CannotShrink);
            }
            if vol.mount_in_use() {
                return Err(Error::InUse);
            }
        }
        shrink_file_system(common, fs_type, dev_path, vol, new_bytes)?;
        resize_device(new_bytes)?;
    } else {
        resize_device(new_bytes)?;
        grow_file_system(common, fs_type, dev_path, vol)?;
    }

    debug!(common.log(), "resized volume";
        "volume" => vol.name(),
        "from" => old_bytes, "to" => new_bytes);
    Ok(())
}

/// Byte-stream feature list a backend can offer, in canonical order.
/// Compression is dropped when the pool config disables it; xattr
/// support is excluded for backends that cannot preserve them.
pub fn byte_stream_features(
    common: &CommonDriver,
    xattrs: bool,
) -> Vec<String> {
    use amphora_wire::{
        RSYNC_FEATURE_BIDIRECTIONAL, RSYNC_FEATURE_COMPRESS,
        RSYNC_FEATURE_DELETE, RSYNC_FEATURE_XATTRS,
    };

    let mut features = Vec::new();
    if xattrs {
        features.push(RSYNC_FEATURE_XATTRS.to_string());
    }
    features.push(RSYNC_FEATURE_DELETE.to_string());
    if crate::config::bool_value(common.config(), "rsync.compression")
        || common.config().get("rsync.compression").is_none()
    {
        features.push(RSYNC_FEATURE_COMPRESS.to_string());
    }
    features.push(RSYNC_FEATURE_BIDIRECTIONAL.to_string());
    features
}

/// Unmounts after an internal mount, tolerating remaining references.
pub fn unmount_volume_best_effort(
    d: &dyn Driver,
    vol: &Volume,
    op: &Operation,
) {
    match d.unmount_volume(vol, false, op) {
        Ok(_) => (),
        Err(e) if e.is_in_use() => (),
        Err(e) => warn!(d.common().log(), "failed to unmount volume";
            "volume" => vol.name(), "error" => %e),
    }
}

fn delete_volume_on_fail(d: &dyn Driver, vol: &Volume, op: &Operation) {
    if let Err(e) = d.delete_volume(vol, op) {
        warn!(d.common().log(), "cleanup failed";
            "volume" => vol.name(), "error" => %e);
    }
}

fn delete_snapshot_on_fail(d: &dyn Driver, snap: &Volume, op: &Operation) {
    if let Err(e) = d.delete_volume_snapshot(snap, op) {
        warn!(d.common().log(), "cleanup failed";
            "snapshot" => snap.name(), "error" => %e);
    }
}

/// Same-pool copy and refresh. Snapshots are replayed oldest first
/// through the volume path so each backend snapshot captures the right
/// historical state, then the current state is mirrored last.
pub fn vfs_copy_volume(
    d: &dyn Driver,
    vol: &Volume,
    src: &Volume,
    src_snapshots: &[String],
    refresh: bool,
    _allow_inconsistent: bool,
    op: &Operation,
) -> Result<()> {
    let mut revert = Revert::new();

    if !refresh {
        d.create_volume(vol, None, op)?;
        revert.add(move || delete_volume_on_fail(d, vol, op));
    }

    for snap_name in src_snapshots {
        op.check_cancelled()?;
        let src_snap = src.new_snapshot(snap_name)?;
        copy_tree(&src_snap.mount_path(), &vol.mount_path(), true)
            .context("copy snapshot", src_snap.name().to_string())?;

        let new_snap = vol.new_snapshot(snap_name)?;
        d.create_volume_snapshot(&new_snap, op)?;
        revert.add(move || delete_snapshot_on_fail(d, &new_snap, op));
    }

    op.check_cancelled()?;
    copy_tree(&src.mount_path(), &vol.mount_path(), true)
        .context("copy volume", src.name().to_string())?;

    revert.success();
    Ok(())
}

/// Sends a volume over an established connection using the negotiated
/// byte-stream transport: each requested snapshot first, then the
/// volume itself.
pub fn vfs_migrate_volume(
    d: &dyn Driver,
    vol: &Volume,
    conn: &mut dyn ReadWrite,
    args: &VolumeSourceArgs,
    op: &Operation,
) -> Result<()> {
    let log = d.common().log();
    let opts = SendOptions::from_features(&args.migration_type.features);

    d.mount_volume(vol, op)?;
    let result = (|| {
        if !args.volume_only {
            for snap_name in &args.snapshots {
                let snap = vol.new_snapshot(snap_name)?;
                debug!(log, "sending snapshot";
                    "volume" => vol.name(), "snapshot" => snap_name.as_str());
                let tracker = args.track_progress.then(|| {
                    ProgressTracker::new(op, "fs_progress", snap.name())
                });
                stream::send_tree(
                    conn,
                    log,
                    &snap.mount_path(),
                    opts,
                    op,
                    tracker,
                )
                .context("send snapshot", snap.name().to_string())?;
            }
        }

        debug!(log, "sending volume"; "volume" => vol.name());
        let tracker = args.track_progress.then(|| {
            ProgressTracker::new(op, "fs_progress", vol.name())
        });
        stream::send_tree(conn, log, &vol.mount_path(), opts, op, tracker)
            .context("send volume", vol.name().to_string())
    })();
    unmount_volume_best_effort(d, vol, op);
    result
}

/// Receives a migrated volume: snapshots are applied through the volume
/// path and snapshotted in order, then the final state is received.
pub fn vfs_create_volume_from_migration(
    d: &dyn Driver,
    vol: &Volume,
    conn: &mut dyn ReadWrite,
    args: &VolumeTargetArgs,
    op: &Operation,
) -> Result<()> {
    let log = d.common().log();
    let mut revert = Revert::new();

    if !args.refresh {
        d.create_volume(vol, None, op)?;
        revert.add(move || delete_volume_on_fail(d, vol, op));
    }

    if !args.volume_only {
        for snap_name in &args.snapshots {
            debug!(log, "receiving snapshot";
                "volume" => vol.name(), "snapshot" => snap_name.as_str());
            stream::recv_tree(conn, log, &vol.mount_path(), op)
                .context("receive snapshot", snap_name.clone())?;

            let snap = vol.new_snapshot(snap_name)?;
            d.create_volume_snapshot(&snap, op)?;
            revert.add(move || delete_snapshot_on_fail(d, &snap, op));
        }
    }

    debug!(log, "receiving volume"; "volume" => vol.name());
    stream::recv_tree(conn, log, &vol.mount_path(), op)
        .context("receive volume", vol.name().to_string())?;

    if args.volume_size > 0 {
        d.set_volume_quota(vol, &args.volume_size.to_string(), true, op)?;
    }

    revert.success();
    Ok(())
}

/// Same-pool incremental refresh over the generic copy machinery.
pub fn vfs_refresh_volume(
    d: &dyn Driver,
    vol: &Volume,
    src: &Volume,
    refresh_snapshots: &[String],
    allow_inconsistent: bool,
    op: &Operation,
) -> Result<()> {
    vfs_copy_volume(
        d,
        vol,
        src,
        refresh_snapshots,
        true,
        allow_inconsistent,
        op,
    )
}

/// Writes a backup archive of the volume and the requested snapshots.
pub fn vfs_backup_volume(
    d: &dyn Driver,
    vol: &Volume,
    dest: &mut dyn Write,
    snapshots: &[String],
    op: &Operation,
) -> Result<()> {
    let common = d.common();

    d.mount_volume(vol, op)?;
    let result = (|| {
        let info = backup::Info {
            format_version: backup::CURRENT_FORMAT,
            pool: common.pool_name().to_string(),
            name: vol.name().to_string(),
            vol_type: vol.vol_type(),
            content_type: vol.content_type(),
            optimized: false,
            snapshots: snapshots.to_vec(),
            config: vol.config().clone(),
        };
        let mut writer = backup::Writer::new(&mut *dest, &info)?;

        for snap_name in snapshots {
            op.check_cancelled()?;
            let snap = vol.new_snapshot(snap_name)?;
            writer
                .add_tree(
                    &format!(
                        "{}/{snap_name}",
                        backup::SNAPSHOTS_MEMBER_PREFIX
                    ),
                    &snap.mount_path(),
                )
                .context("archive snapshot", snap.name().to_string())?;
        }

        op.check_cancelled()?;
        writer
            .add_tree(backup::VOLUME_TREE_MEMBER, &vol.mount_path())
            .context("archive volume", vol.name().to_string())?;
        writer.finish()
    })();
    unmount_volume_best_effort(d, vol, op);
    result
}

/// Restores a backup archive into a fresh volume. Snapshot trees land
/// in their mount locations; backends whose snapshots are first-class
/// objects re-create any snapshot the unpack did not materialize.
pub fn vfs_create_volume_from_backup(
    d: &dyn Driver,
    vol: &Volume,
    info: &backup::Info,
    data: &mut (dyn Read + Send),
    op: &Operation,
) -> Result<()> {
    let mut revert = Revert::new();

    d.create_volume(vol, None, op)?;
    revert.add(move || delete_volume_on_fail(d, vol, op));

    let targets = backup::UnpackTargets {
        volume_tree: Some(vol.mount_path()),
        volume_image: Some(vol.mount_path().join(BLOCK_FILE_NAME)),
        snapshots_tree: Some(vol.snapshots_dir()),
        snapshots_image: Some(vol.snapshots_dir()),
    };
    backup::unpack(&mut *data, &targets)
        .context("unpack backup", vol.name().to_string())?;

    for snap_name in &info.snapshots {
        op.check_cancelled()?;
        let snap = vol.new_snapshot(snap_name)?;
        if !snap.mount_path().exists() {
            d.create_volume_snapshot(&snap, op)?;
        }
    }

    revert.success();
    Ok(())
}
