// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Migration transport negotiation.
//!
//! A source advertises its preference-ordered transport list in a
//! [`MigrationHeader`]; the destination reconciles that offer against its
//! own list with [`match_types`]. Negotiation never silently picks an
//! incompatible transport: only explicit feature intersections survive,
//! so neither side can end up relying on an optimization the other does
//! not implement.

use std::collections::BTreeMap;

use amphora_wire::{
    BtrfsFeatures, FsType, MigrationHeader, RsyncFeatures, ZfsFeatures,
    BTRFS_FEATURE_SUBVOLUME_UUIDS, ZFS_FEATURE_MIGRATION_HEADER,
};

use crate::error::{Error, Result};
use crate::volume::ContentType;

/// One transport the local side supports: the method plus the optional
/// features it can honor on top.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MigrationType {
    pub fs_type: FsType,
    pub features: Vec<String>,
}

impl MigrationType {
    pub fn new(fs_type: FsType, features: &[&str]) -> Self {
        Self {
            fs_type,
            features: features.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Arguments for setting up a migration source.
#[derive(Clone, Debug)]
pub struct VolumeSourceArgs {
    pub name: String,
    pub snapshots: Vec<String>,
    pub migration_type: MigrationType,
    pub track_progress: bool,
    pub content_type: ContentType,
    pub allow_inconsistent: bool,
    pub refresh: bool,
    pub volume_only: bool,
    pub cluster_move: bool,
    pub storage_move: bool,
}

impl Default for VolumeSourceArgs {
    fn default() -> Self {
        Self {
            name: String::new(),
            snapshots: Vec::new(),
            migration_type: MigrationType::default(),
            track_progress: false,
            content_type: ContentType::Filesystem,
            allow_inconsistent: false,
            refresh: false,
            volume_only: false,
            cluster_move: false,
            storage_move: false,
        }
    }
}

/// Arguments for setting up a migration sink.
#[derive(Clone, Debug)]
pub struct VolumeTargetArgs {
    pub name: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
    pub snapshots: Vec<String>,
    pub migration_type: MigrationType,
    pub refresh: bool,
    pub live: bool,
    pub volume_size: i64,
    pub content_type: ContentType,
    pub volume_only: bool,
    pub cluster_move_source_name: String,
}

impl Default for VolumeTargetArgs {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            config: BTreeMap::new(),
            snapshots: Vec::new(),
            migration_type: MigrationType::default(),
            refresh: false,
            live: false,
            volume_size: 0,
            content_type: ContentType::Filesystem,
            volume_only: false,
            cluster_move_source_name: String::new(),
        }
    }
}

/// Reconciles a remote offer against the local transport list.
///
/// The offered candidates are the remote's preferred type followed by
/// `fallback_type` (both sides are expected to support the fallback for
/// the volume's content type). Every compatible pairing is returned, in
/// our preference order, carrying the intersection of both sides'
/// features; consumers pick the first. An optimized incremental refresh
/// additionally requires the family's header capability in the
/// intersection, otherwise that candidate is skipped in favor of a less
/// optimal one.
pub fn match_types(
    offer: &MigrationHeader,
    fallback_type: FsType,
    ours: &[MigrationType],
) -> Result<Vec<MigrationType>> {
    let offered_fs_types = [offer.fs_type(), fallback_type];
    let mut matched = Vec::new();

    for our_type in ours {
        for offer_fs_type in offered_fs_types {
            if offer_fs_type != our_type.fs_type {
                continue;
            }

            let offered_features = match offer_fs_type {
                FsType::Zfs => offer.zfs_features_slice(),
                FsType::Btrfs => offer.btrfs_features_slice(),
                FsType::Rsync => offer.rsync_features_slice(),
                _ => Vec::new(),
            };

            let common: Vec<String> = our_type
                .features
                .iter()
                .filter(|f| offered_features.iter().any(|of| of == &f.as_str()))
                .cloned()
                .collect();

            if offer.refresh() {
                // An incremental refresh over a native transport needs
                // the migration header to line up snapshots, and for
                // subvolume-based backends the subvolume UUIDs too.
                if our_type.fs_type == FsType::Zfs
                    && !common.iter().any(|f| f == ZFS_FEATURE_MIGRATION_HEADER)
                {
                    continue;
                }
                if our_type.fs_type == FsType::Btrfs
                    && !common
                        .iter()
                        .any(|f| f == BTRFS_FEATURE_SUBVOLUME_UUIDS)
                {
                    continue;
                }
            }

            matched.push(MigrationType {
                fs_type: our_type.fs_type,
                features: common,
            });
        }
    }

    if matched.is_empty() {
        let offered: Vec<String> =
            offered_fs_types.iter().map(|t| t.to_string()).collect();
        let supported: Vec<String> =
            ours.iter().map(|t| t.fs_type.to_string()).collect();
        return Err(Error::Protocol(format!(
            "no matching migration types; offered: {offered:?}, ours: {supported:?}"
        )));
    }

    Ok(matched)
}

/// Converts a preference-ordered transport list into an offer header.
/// The first type is the advertised primary and contributes its family
/// features; the first byte-stream type anywhere in the list always
/// contributes its features so the far side can fall back.
pub fn types_to_header(types: &[MigrationType]) -> MigrationHeader {
    let preferred = types.first().cloned().unwrap_or_default();

    let mut header = MigrationHeader {
        fs_type: Some(preferred.fs_type),
        ..Default::default()
    };

    if preferred.fs_type == FsType::Zfs {
        header.zfs_features =
            Some(ZfsFeatures::from_slice(&preferred.features));
    }
    if preferred.fs_type == FsType::Btrfs {
        header.btrfs_features =
            Some(BtrfsFeatures::from_slice(&preferred.features));
    }

    for t in types {
        if t.fs_type.is_rsync_family() {
            header.rsync_features =
                Some(RsyncFeatures::from_slice(&t.features));
            break;
        }
    }

    header
}
