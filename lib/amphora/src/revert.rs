// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Best-effort rollback for multi-step provisioning.
//!
//! A [`Revert`] is opened at the start of an operation; after each
//! state-changing step succeeds, a compensating closure is pushed. If the
//! operation returns before [`Revert::success`] is called, the stack
//! unwinds in reverse order on drop. This is not a transaction: the
//! closures are best effort, and any that fail should log a warning
//! themselves rather than escalate.

pub struct Revert<'a> {
    actions: Vec<Box<dyn FnOnce() + Send + 'a>>,
    armed: bool,
}

impl<'a> Revert<'a> {
    pub fn new() -> Self {
        Self { actions: Vec::new(), armed: true }
    }

    /// Pushes a compensating action for a step that just completed.
    /// Actions may borrow from the surrounding operation; the stack
    /// never outlives the scope that opened it.
    pub fn add(&mut self, action: impl FnOnce() + Send + 'a) {
        self.actions.push(Box::new(action));
    }

    /// Marks the operation complete; pending actions are discarded.
    pub fn success(mut self) {
        self.armed = false;
        self.actions.clear();
    }

    /// Unwinds immediately instead of waiting for drop. Used when an
    /// operation wants to roll back and then continue doing other work.
    pub fn fail(&mut self) {
        self.unwind();
    }

    fn unwind(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

impl Default for Revert<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Revert<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.unwind();
        }
    }
}
