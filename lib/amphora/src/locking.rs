// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide named locks and mount reference counts.
//!
//! Both tables are keyed by a volume's logical identity (pool, volume
//! type, content type, name), never by a driver instance, so identical
//! identities reached from different code paths observe the same state.
//! The lock serializes mount/unmount of one volume; the refcount records
//! how many consumers currently need it mounted.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};

use lazy_static::lazy_static;

struct OpLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

lazy_static! {
    static ref OP_LOCKS: OpLocks = OpLocks {
        held: Mutex::new(HashSet::new()),
        released: Condvar::new(),
    };
    static ref REF_COUNTS: Mutex<HashMap<String, u32>> =
        Mutex::new(HashMap::new());
}

/// Holding this guard means holding the named lock; dropping it releases
/// the lock and wakes contending threads.
pub struct OpLockGuard {
    name: String,
}

impl Drop for OpLockGuard {
    fn drop(&mut self) {
        let mut held = OP_LOCKS.held.lock().unwrap();
        held.remove(&self.name);
        OP_LOCKS.released.notify_all();
    }
}

/// Acquires the named advisory lock, blocking until it is free.
pub fn lock(name: &str) -> OpLockGuard {
    let mut held = OP_LOCKS.held.lock().unwrap();
    while held.contains(name) {
        held = OP_LOCKS.released.wait(held).unwrap();
    }
    held.insert(name.to_string());
    OpLockGuard { name: name.to_string() }
}

/// Builds the canonical lock name for a volume operation.
pub fn op_lock_name(
    op: &str,
    pool: &str,
    vol_type: &str,
    content_type: &str,
    vol_name: &str,
) -> String {
    format!("{op}/{pool}/{vol_type}/{content_type}/{vol_name}")
}

/// Increments the reference count for `name`, returning the new count.
pub fn ref_count_increment(name: &str) -> u32 {
    let mut counts = REF_COUNTS.lock().unwrap();
    let count = counts.entry(name.to_string()).or_insert(0);
    *count += 1;
    *count
}

/// Decrements the reference count for `name`, returning the new count.
/// Decrementing past zero stays at zero.
pub fn ref_count_decrement(name: &str) -> u32 {
    let mut counts = REF_COUNTS.lock().unwrap();
    match counts.get_mut(name) {
        Some(count) if *count > 1 => {
            *count -= 1;
            *count
        }
        Some(_) => {
            counts.remove(name);
            0
        }
        None => 0,
    }
}

pub fn ref_count(name: &str) -> u32 {
    REF_COUNTS.lock().unwrap().get(name).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lock_serializes_same_name() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let guard = lock("locktest/pool/custom/filesystem/v1");
        let contender_tx = tx.clone();
        let contender = std::thread::spawn(move || {
            let _guard = lock("locktest/pool/custom/filesystem/v1");
            contender_tx.send("acquired").unwrap();
        });
        // Give the contender a chance to block on the held lock.
        std::thread::sleep(Duration::from_millis(20));
        tx.send("releasing").unwrap();
        drop(guard);
        contender.join().unwrap();

        let order: Vec<_> = rx.iter().take(2).collect();
        assert_eq!(order, vec!["releasing", "acquired"]);
    }

    #[test]
    fn different_names_do_not_contend() {
        let _a = lock("locktest/pool/custom/filesystem/a");
        let _b = lock("locktest/pool/custom/filesystem/b");
    }

    #[test]
    fn lock_reacquirable_after_drop() {
        drop(lock("locktest/reacquire"));
        drop(lock("locktest/reacquire"));
    }

    #[test]
    fn ref_count_never_negative() {
        let name = "reftest/pool/custom/filesystem/v1";
        assert_eq!(ref_count(name), 0);
        assert_eq!(ref_count_decrement(name), 0);
        assert_eq!(ref_count_increment(name), 1);
        assert_eq!(ref_count_increment(name), 2);
        assert_eq!(ref_count_decrement(name), 1);
        assert_eq!(ref_count_decrement(name), 0);
        assert_eq!(ref_count_decrement(name), 0);
        assert_eq!(ref_count(name), 0);
    }
}
