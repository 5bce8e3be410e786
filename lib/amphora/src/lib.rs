// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage-pool drivers and volume lifecycle for the fleet manager.
//!
//! Incompatible storage backends (plain directories, btrfs, Ceph RBD,
//! DRBD/LINSTOR, NFS) present one uniform [`drivers::Driver`] contract:
//! create, snapshot, clone, quota, migrate and back up volumes with
//! identical semantics regardless of the backend primitives underneath.
//! Drivers are obtained from the [`registry`] by name; migration
//! transports are negotiated by the [`migration`] matcher over the wire
//! types in `amphora_wire`.
//!
//! The library is synchronous. Callers run operations on their own
//! worker threads; per-volume serialization happens through the
//! [`locking`] tables and long transfers poll their [`op::Operation`]
//! for cancellation.

pub mod backup;
pub mod cmd;
pub mod config;
pub mod drivers;
pub mod error;
pub mod locking;
pub mod migration;
pub mod op;
pub mod registry;
pub mod revert;
pub mod stream;
pub mod units;
pub mod usage;
pub mod volume;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
