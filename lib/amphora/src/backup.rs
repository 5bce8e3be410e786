// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backup archive format.
//!
//! A backup is a gzip-compressed tarball. The first member is a JSON
//! index describing the volume; data follows under `backup/volume` (a
//! filesystem tree) or `backup/volume.img` (a raw block image), with
//! snapshots under `backup/snapshots/<name>` in the same two shapes.
//! Drivers that can dump their own native stream mark the index
//! `optimized` and store that stream as the member instead.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::volume::{ContentType, VolumeType};

pub const CURRENT_FORMAT: u32 = 1;

pub const INDEX_MEMBER: &str = "backup/index.json";
pub const VOLUME_TREE_MEMBER: &str = "backup/volume";
pub const VOLUME_IMAGE_MEMBER: &str = "backup/volume.img";
pub const VOLUME_NATIVE_MEMBER: &str = "backup/volume.bin";
pub const SNAPSHOTS_MEMBER_PREFIX: &str = "backup/snapshots";

/// Member name of a backend-native snapshot dump in an optimized backup.
pub fn native_snapshot_member(name: &str) -> String {
    format!("{SNAPSHOTS_MEMBER_PREFIX}/{name}.bin")
}

/// Index describing the archived volume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub format_version: u32,
    pub pool: String,
    pub name: String,
    pub vol_type: VolumeType,
    pub content_type: ContentType,
    #[serde(default)]
    pub optimized: bool,
    #[serde(default)]
    pub snapshots: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Streaming archive writer. The index is written up front so readers
/// can inspect a backup without unpacking it.
pub struct Writer<W: Write> {
    builder: tar::Builder<GzEncoder<W>>,
}

impl<W: Write> Writer<W> {
    pub fn new(dest: W, info: &Info) -> Result<Self> {
        let encoder = GzEncoder::new(dest, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let index = serde_json::to_vec_pretty(info)
            .map_err(|e| Error::Protocol(format!("encoding index: {e}")))?;
        let mut header = tar::Header::new_gnu();
        header.set_size(index.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, INDEX_MEMBER, index.as_slice())?;

        Ok(Self { builder })
    }

    /// Archives the tree rooted at `root` under the member `name`.
    pub fn add_tree(&mut self, name: &str, root: &Path) -> Result<()> {
        self.builder.append_dir_all(name, root)?;
        Ok(())
    }

    /// Archives a single file, typically a raw block image.
    pub fn add_file(&mut self, name: &str, src: &Path) -> Result<()> {
        let mut file = File::open(src)?;
        self.builder.append_file(name, &mut file)?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        let encoder = self.builder.into_inner()?;
        encoder.finish()?;
        Ok(())
    }
}

/// Where [`unpack`] places archive members. A member whose target is
/// unset is a malformed archive for that restore.
#[derive(Debug, Default)]
pub struct UnpackTargets {
    pub volume_tree: Option<PathBuf>,
    pub volume_image: Option<PathBuf>,
    /// Snapshot trees land in `<dir>/<snapshot name>`.
    pub snapshots_tree: Option<PathBuf>,
    /// Snapshot images land in `<dir>/<snapshot name>.img`.
    pub snapshots_image: Option<PathBuf>,
}

/// Validates an archive-supplied relative path.
fn clean_member_rel(rel: &str) -> Result<&Path> {
    let path = Path::new(rel);
    if rel.is_empty() || path.is_absolute() {
        return Err(Error::Protocol(format!("illegal archive path {rel:?}")));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => (),
            _ => {
                return Err(Error::Protocol(format!(
                    "illegal archive path {rel:?}"
                )))
            }
        }
    }
    Ok(path)
}

fn unpack_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    dest: &Path,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    entry.unpack(dest)?;
    Ok(())
}

/// Unpacks a backup stream into `targets`, returning the parsed index.
pub fn unpack<R: Read>(src: R, targets: &UnpackTargets) -> Result<Info> {
    let mut archive = tar::Archive::new(GzDecoder::new(src));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    let mut info: Option<Info> = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let member = entry.path()?.to_string_lossy().into_owned();
        let member = member.trim_end_matches('/').to_string();

        if member == INDEX_MEMBER {
            let mut index = Vec::new();
            entry.read_to_end(&mut index)?;
            info = Some(serde_json::from_slice(&index).map_err(|e| {
                Error::Protocol(format!("decoding index: {e}"))
            })?);
            continue;
        }

        if member == "backup" || member == SNAPSHOTS_MEMBER_PREFIX {
            continue;
        }

        if member == VOLUME_IMAGE_MEMBER {
            let dest = targets.volume_image.as_ref().ok_or_else(|| {
                Error::Protocol(format!("unexpected archive member {member}"))
            })?;
            unpack_entry(&mut entry, dest)?;
            continue;
        }

        if member == VOLUME_TREE_MEMBER {
            if let Some(tree) = &targets.volume_tree {
                fs::create_dir_all(tree)?;
            }
            continue;
        }

        if let Some(rel) =
            member.strip_prefix(&format!("{VOLUME_TREE_MEMBER}/"))
        {
            let tree = targets.volume_tree.as_ref().ok_or_else(|| {
                Error::Protocol(format!("unexpected archive member {member}"))
            })?;
            let dest = tree.join(clean_member_rel(rel)?);
            unpack_entry(&mut entry, &dest)?;
            continue;
        }

        if let Some(rel) =
            member.strip_prefix(&format!("{SNAPSHOTS_MEMBER_PREFIX}/"))
        {
            let dest = if !rel.contains('/') && rel.ends_with(".img") {
                let dir = targets.snapshots_image.as_ref().ok_or_else(
                    || {
                        Error::Protocol(format!(
                            "unexpected archive member {member}"
                        ))
                    },
                )?;
                dir.join(clean_member_rel(rel)?)
            } else {
                let dir = targets.snapshots_tree.as_ref().ok_or_else(
                    || {
                        Error::Protocol(format!(
                            "unexpected archive member {member}"
                        ))
                    },
                )?;
                dir.join(clean_member_rel(rel)?)
            };
            unpack_entry(&mut entry, &dest)?;
            continue;
        }

        return Err(Error::Protocol(format!(
            "unexpected archive member {member}"
        )));
    }

    info.ok_or_else(|| Error::Protocol("archive has no index".into()))
}

/// Reads just the index from a backup stream.
pub fn read_info<R: Read>(src: R) -> Result<Info> {
    let mut archive = tar::Archive::new(GzDecoder::new(src));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == INDEX_MEMBER {
            let mut index = Vec::new();
            entry.read_to_end(&mut index)?;
            return serde_json::from_slice(&index).map_err(|e| {
                Error::Protocol(format!("decoding index: {e}"))
            });
        }
    }
    Err(Error::Protocol("archive has no index".into()))
}
