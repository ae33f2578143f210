// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The uniform map/unmap/lookup facade over a per-task page table
//! named in `spec.md` §4.B, sitting on top of the host's
//! [`crate::platform::PageTableWalker`].

use crate::platform::{self, with_critical, PageFlags, PhysFrame, VirtPage, VmRoot};
use alloc::vec::Vec;

/// One task's address space. Every operation is O(1) and talks
/// straight through to the host's page table walker; callers that need
/// several operations to appear atomic (e.g. the page-fault handler's
/// lookup-then-map) take the owning task's `vm_lock` around the whole
/// sequence rather than relying on anything in here.
pub struct Vm {
    root: VmRoot,
}

impl Vm {
    /// Allocates a fresh, empty address space.
    pub fn new() -> Option<Self> {
        let root = with_critical(|critical| platform::platform().new_root(critical))?;
        Some(Vm { root })
    }

    /// Installs or overwrites the mapping for `vpage`. Returns `false`
    /// if the underlying walker failed to allocate an intermediate
    /// table.
    pub fn map(&self, vpage: VirtPage, dpage: PhysFrame, flags: PageFlags) -> bool {
        with_critical(|critical| platform::platform().map(self.root, vpage, dpage, flags, critical))
    }

    /// Clears the mapping for `vpage`, if any.
    pub fn unmap(&self, vpage: VirtPage) {
        with_critical(|critical| platform::platform().unmap(self.root, vpage, critical))
    }

    /// Returns the mapping for `vpage`. `PageFlags::empty()` means
    /// entirely unmapped.
    pub fn lookup(&self, vpage: VirtPage) -> (PhysFrame, PageFlags) {
        with_critical(|critical| platform::platform().lookup(self.root, vpage, critical))
    }

    /// Reads every present mapping from `[CODE_PAGE, KERN_STACKS_PAGE)`,
    /// stopping at the first absent entry, per `spec.md`'s fork-task
    /// algorithm (§4.C). Returns an owned snapshot so the caller can
    /// drop this VM's lock before touching another task's VM: `fork_task`
    /// takes a page out of the original `task.c`'s book and unlocks the
    /// parent's `vmLock` before ever touching the child's, rather than
    /// holding both locks at once.
    pub fn snapshot_code_mappings(&self) -> Vec<(VirtPage, PhysFrame, PageFlags)> {
        let mut out = Vec::new();
        let mut page = VirtPage::new(crate::config::CODE_PAGE);
        let end = VirtPage::new(crate::config::KERN_STACKS_PAGE);
        while page < end {
            let (frame, flags) = self.lookup(page);
            if !flags.contains(PageFlags::PRESENT) {
                break;
            }
            out.push((page, frame, flags));
            page = page.offset(1);
        }
        out
    }

    /// Installs a snapshot produced by [`Vm::snapshot_code_mappings`].
    /// Physical pages are shared, not copied. Returns `false` as soon as
    /// any mapping fails to install.
    pub fn apply_code_mappings(&self, mappings: &[(VirtPage, PhysFrame, PageFlags)]) -> bool {
        for &(page, frame, flags) in mappings {
            if !self.map(page, frame, flags) {
                return false;
            }
        }
        true
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        with_critical(|critical| platform::platform().free_root(self.root, critical));
    }
}
