// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Usage caching for backends whose space accounting is one expensive
//! bulk enumeration away.
//!
//! A cache instance lives on a driver instance, and driver instances are
//! built per logical operation, so the cache can never outlive the
//! operation that populated it. Population failure leaves the cache
//! empty; callers fall back to direct per-object queries.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;

/// Space accounting for one backend object. `used` is the object's
/// exclusive consumption; `referenced` is everything reachable from it.
/// Which one a query reports is a config decision, not ours.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeUsage {
    pub used: i64,
    pub referenced: i64,
}

pub struct UsageCache {
    entries: Mutex<Option<HashMap<String, VolumeUsage>>>,
}

impl UsageCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(None) }
    }

    pub fn populated(&self) -> bool {
        self.entries.lock().unwrap().is_some()
    }

    /// Fills the cache with one bulk enumeration. A second call is a
    /// no-op returning `Ok(false)`; the bulk query runs at most once per
    /// cache lifetime. On error the cache stays unpopulated.
    pub fn populate<F>(&self, fill: F) -> Result<bool>
    where
        F: FnOnce() -> Result<HashMap<String, VolumeUsage>>,
    {
        let mut entries = self.entries.lock().unwrap();
        if entries.is_some() {
            return Ok(false);
        }
        *entries = Some(fill()?);
        Ok(true)
    }

    /// Returns the cached usage for `key`, or `None` when the cache is
    /// unpopulated or has no such object.
    pub fn lookup(&self, key: &str) -> Option<VolumeUsage> {
        self.entries.lock().unwrap().as_ref()?.get(key).copied()
    }
}

impl Default for UsageCache {
    fn default() -> Self {
        Self::new()
    }
}
