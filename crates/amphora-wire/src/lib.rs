// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level vocabulary for volume migration negotiation.
//!
//! Both ends of a transfer exchange a [`MigrationHeader`] before any data
//! moves. The header advertises a preferred transport and, per transport
//! family, a set of optional feature booleans. The token strings emitted by
//! the `*_slice` methods are the negotiation vocabulary and must match
//! exactly across peers; changing one is a wire format break.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Transport method for moving volume data between pools or hosts.
///
/// `Rsync` and `BlockAndRsync` are the generic byte-stream transports every
/// backend supports; the remaining values are backend-native protocols that
/// only match when both sides run the same backend family.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsType {
    #[default]
    #[strum(serialize = "RSYNC")]
    Rsync,
    #[strum(serialize = "BLOCK_AND_RSYNC")]
    BlockAndRsync,
    #[strum(serialize = "BTRFS")]
    Btrfs,
    #[strum(serialize = "ZFS")]
    Zfs,
    #[strum(serialize = "RBD")]
    Rbd,
    #[strum(serialize = "DRBD")]
    Drbd,
}

impl FsType {
    /// Whether this is one of the generic byte-stream transports.
    pub fn is_rsync_family(&self) -> bool {
        matches!(self, FsType::Rsync | FsType::BlockAndRsync)
    }
}

pub const RSYNC_FEATURE_XATTRS: &str = "xattrs";
pub const RSYNC_FEATURE_DELETE: &str = "delete";
pub const RSYNC_FEATURE_COMPRESS: &str = "compress";
pub const RSYNC_FEATURE_BIDIRECTIONAL: &str = "bidirectional";

pub const ZFS_FEATURE_COMPRESS: &str = "compress";
pub const ZFS_FEATURE_MIGRATION_HEADER: &str = "migration_header";
pub const ZFS_FEATURE_ZVOL_FILESYSTEMS: &str = "header_zvol_filesystems";

pub const BTRFS_FEATURE_MIGRATION_HEADER: &str = "migration_header";
pub const BTRFS_FEATURE_SUBVOLUMES: &str = "header_subvolumes";
pub const BTRFS_FEATURE_SUBVOLUME_UUIDS: &str = "header_subvolume_uuids";

/// Optional capabilities of the byte-stream transports.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct RsyncFeatures {
    pub xattrs: bool,
    pub delete: bool,
    pub compress: bool,
    pub bidirectional: bool,
}

impl RsyncFeatures {
    pub fn to_slice(&self) -> Vec<&'static str> {
        let mut features = Vec::new();
        if self.xattrs {
            features.push(RSYNC_FEATURE_XATTRS);
        }
        if self.delete {
            features.push(RSYNC_FEATURE_DELETE);
        }
        if self.compress {
            features.push(RSYNC_FEATURE_COMPRESS);
        }
        if self.bidirectional {
            features.push(RSYNC_FEATURE_BIDIRECTIONAL);
        }
        features
    }

    pub fn from_slice<S: AsRef<str>>(features: &[S]) -> Self {
        let mut out = Self::default();
        for feature in features {
            match feature.as_ref() {
                RSYNC_FEATURE_XATTRS => out.xattrs = true,
                RSYNC_FEATURE_DELETE => out.delete = true,
                RSYNC_FEATURE_COMPRESS => out.compress = true,
                RSYNC_FEATURE_BIDIRECTIONAL => out.bidirectional = true,
                _ => (),
            }
        }
        out
    }
}

/// Optional capabilities of the ZFS-native transport.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct ZfsFeatures {
    pub compress: bool,
    pub migration_header: bool,
    pub header_zvol_filesystems: bool,
}

impl ZfsFeatures {
    pub fn to_slice(&self) -> Vec<&'static str> {
        let mut features = Vec::new();
        if self.compress {
            features.push(ZFS_FEATURE_COMPRESS);
        }
        if self.migration_header {
            features.push(ZFS_FEATURE_MIGRATION_HEADER);
        }
        if self.header_zvol_filesystems {
            features.push(ZFS_FEATURE_ZVOL_FILESYSTEMS);
        }
        features
    }

    pub fn from_slice<S: AsRef<str>>(features: &[S]) -> Self {
        let mut out = Self::default();
        for feature in features {
            match feature.as_ref() {
                ZFS_FEATURE_COMPRESS => out.compress = true,
                ZFS_FEATURE_MIGRATION_HEADER => out.migration_header = true,
                ZFS_FEATURE_ZVOL_FILESYSTEMS => {
                    out.header_zvol_filesystems = true
                }
                _ => (),
            }
        }
        out
    }
}

/// Optional capabilities of the BTRFS-native transport.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct BtrfsFeatures {
    pub migration_header: bool,
    pub header_subvolumes: bool,
    pub header_subvolume_uuids: bool,
}

impl BtrfsFeatures {
    pub fn to_slice(&self) -> Vec<&'static str> {
        let mut features = Vec::new();
        if self.migration_header {
            features.push(BTRFS_FEATURE_MIGRATION_HEADER);
        }
        if self.header_subvolumes {
            features.push(BTRFS_FEATURE_SUBVOLUMES);
        }
        if self.header_subvolume_uuids {
            features.push(BTRFS_FEATURE_SUBVOLUME_UUIDS);
        }
        features
    }

    pub fn from_slice<S: AsRef<str>>(features: &[S]) -> Self {
        let mut out = Self::default();
        for feature in features {
            match feature.as_ref() {
                BTRFS_FEATURE_MIGRATION_HEADER => out.migration_header = true,
                BTRFS_FEATURE_SUBVOLUMES => out.header_subvolumes = true,
                BTRFS_FEATURE_SUBVOLUME_UUIDS => {
                    out.header_subvolume_uuids = true
                }
                _ => (),
            }
        }
        out
    }
}

/// The negotiation header exchanged before volume data transfer.
///
/// Serialized as JSON on the wire. Absent feature structs decode as
/// all-false, so a peer that predates a feature simply does not offer it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationHeader {
    pub fs_type: Option<FsType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsync_features: Option<RsyncFeatures>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zfs_features: Option<ZfsFeatures>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub btrfs_features: Option<BtrfsFeatures>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub snapshot_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<i64>,
}

impl MigrationHeader {
    pub fn fs_type(&self) -> FsType {
        self.fs_type.unwrap_or_default()
    }

    pub fn refresh(&self) -> bool {
        self.refresh.unwrap_or(false)
    }

    pub fn rsync_features_slice(&self) -> Vec<&'static str> {
        self.rsync_features.map(|f| f.to_slice()).unwrap_or_default()
    }

    pub fn zfs_features_slice(&self) -> Vec<&'static str> {
        self.zfs_features.map(|f| f.to_slice()).unwrap_or_default()
    }

    pub fn btrfs_features_slice(&self) -> Vec<&'static str> {
        self.btrfs_features.map(|f| f.to_slice()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_type_wire_names() {
        assert_eq!(FsType::Rsync.to_string(), "RSYNC");
        assert_eq!(FsType::BlockAndRsync.to_string(), "BLOCK_AND_RSYNC");
        assert_eq!(FsType::Btrfs.to_string(), "BTRFS");
        assert_eq!(FsType::Zfs.to_string(), "ZFS");
        assert_eq!(FsType::Rbd.to_string(), "RBD");
        assert_eq!(FsType::Drbd.to_string(), "DRBD");
        assert_eq!("BLOCK_AND_RSYNC".parse(), Ok(FsType::BlockAndRsync));
    }

    #[test]
    fn rsync_feature_slice_order() {
        let features = RsyncFeatures {
            xattrs: true,
            delete: true,
            compress: true,
            bidirectional: true,
        };
        assert_eq!(
            features.to_slice(),
            vec!["xattrs", "delete", "compress", "bidirectional"]
        );
    }

    #[test]
    fn zfs_feature_slice_order() {
        let features = ZfsFeatures {
            compress: true,
            migration_header: true,
            header_zvol_filesystems: true,
        };
        assert_eq!(
            features.to_slice(),
            vec!["compress", "migration_header", "header_zvol_filesystems"]
        );
    }

    #[test]
    fn btrfs_feature_slice_order() {
        let features = BtrfsFeatures {
            migration_header: true,
            header_subvolumes: true,
            header_subvolume_uuids: true,
        };
        assert_eq!(
            features.to_slice(),
            vec![
                "migration_header",
                "header_subvolumes",
                "header_subvolume_uuids"
            ]
        );
    }

    #[test]
    fn feature_slice_round_trip() {
        let features = RsyncFeatures {
            xattrs: true,
            delete: false,
            compress: true,
            bidirectional: false,
        };
        let slice = features.to_slice();
        assert_eq!(RsyncFeatures::from_slice(&slice), features);
    }

    #[test]
    fn unknown_tokens_ignored() {
        let features =
            ZfsFeatures::from_slice(&["compress", "not_a_feature"]);
        assert!(features.compress);
        assert!(!features.migration_header);
    }

    #[test]
    fn header_json_round_trip() {
        let header = MigrationHeader {
            fs_type: Some(FsType::Btrfs),
            btrfs_features: Some(BtrfsFeatures {
                migration_header: true,
                header_subvolumes: true,
                header_subvolume_uuids: false,
            }),
            rsync_features: Some(RsyncFeatures {
                xattrs: true,
                delete: true,
                compress: false,
                bidirectional: true,
            }),
            refresh: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_string(&header).unwrap();
        let decoded: MigrationHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_missing_fields_decode_as_defaults() {
        let decoded: MigrationHeader =
            serde_json::from_str(r#"{"fs_type":"RSYNC"}"#).unwrap();
        assert_eq!(decoded.fs_type(), FsType::Rsync);
        assert!(!decoded.refresh());
        assert!(decoded.rsync_features_slice().is_empty());
    }
}
