// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The task lifecycle named in `spec.md` §3/§4.C: creation from a code
//! image, forking, reference counting, and kill.
//!
//! A task's "refcount" is an explicit bookkeeping field (`Lifecycle::
//! refcount` below), not the strong count of an `Arc`. The global
//! [`TASKS`] table holds exactly one permanent owning `Arc<Task>` per
//! live task — the Rust analogue of the teacher's `THREADS:
//! spin::Mutex<BTreeMap<ThreadId, Arc<Thread>>>` table in
//! `multitasking/thread/mod.rs` — and every other `Arc<Task>` in the
//! system (a thread's back-reference, a transient holder from
//! `try_reference`) is counted against `Lifecycle::refcount` one for
//! one. Kill machinery's step 6 removes the task from `TASKS`, which is
//! the point the task struct actually drops.

use crate::config;
use crate::pid::{Pid, PIDS};
use crate::platform::{self, with_critical, PageFlags, PhysFrame, VirtPage};
use crate::socket::SocketLink;
use crate::thread::Thread;
use crate::vm::Vm;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cmp::min;
use idxset::IndexSet;
use log::info;
use spin::Mutex;

/// Why a task was torn down, propagated to its socket peers as the
/// message type used in place of a plain `REMOTE_CLOSED` when kill
/// machinery closes the task's remaining sockets (spec.md §4.G step 5,
/// §7's task-level-fault taxonomy entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The task's threads all ran to completion on their own.
    Exit,
    /// `Task::kill` was called on this task by another part of the
    /// system.
    Killed,
    /// A page fault on memory the task had no business touching.
    MemoryFault,
}

impl KillReason {
    pub(crate) fn message_type(self) -> crate::socket::MessageType {
        match self {
            KillReason::Exit => crate::socket::MessageType::RemoteExit,
            KillReason::Killed => crate::socket::MessageType::RemoteKilled,
            KillReason::MemoryFault => crate::socket::MessageType::RemoteMemoryFault,
        }
    }
}

/// Why [`create_task_from_code`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateTaskError {
    /// The host's frame allocator or page table walker ran out of
    /// memory partway through construction. Any pages already mapped
    /// were unwound before this was returned.
    OutOfMemory,
}

struct Lifecycle {
    /// All transient holders (threads currently registered as a CPU's
    /// current thread, anything mid-`try_reference`) plus the implicit
    /// hold every live thread contributes for its own lifetime.
    refcount: u64,
    is_killed: bool,
    kill_reason: Option<KillReason>,
}

/// An address space plus its threads, sockets, and bookkeeping —
/// `spec.md` §3's Task.
pub struct Task {
    pid: Pid,
    code_refcount: Arc<core::sync::atomic::AtomicU64>,
    vm: Mutex<Vm>,
    sockets: Mutex<Vec<VecDeque<Arc<SocketLink>>>>,
    pending: Mutex<VecDeque<Arc<SocketLink>>>,
    threads: Mutex<VecDeque<Arc<Thread>>>,
    stacks: Mutex<IndexSet>,
    descriptors: Mutex<IndexSet>,
    lifecycle: Mutex<Lifecycle>,
}

/// The process-wide table of live tasks: one permanent `Arc<Task>` per
/// task, keyed by its `Pid`. Mirrors the teacher's `THREADS` table.
static TASKS: Mutex<Option<BTreeMap<Pid, Arc<Task>>>> = Mutex::new(None);

fn with_tasks<R>(f: impl FnOnce(&mut BTreeMap<Pid, Arc<Task>>) -> R) -> R {
    let mut guard = TASKS.lock();
    f(guard.get_or_insert_with(BTreeMap::new))
}

impl Task {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn bare(vm: Vm, code_refcount: Arc<core::sync::atomic::AtomicU64>) -> Arc<Task> {
        let mut sockets = Vec::with_capacity(config::SOCKET_BUCKETS);
        for _ in 0..config::SOCKET_BUCKETS {
            sockets.push(VecDeque::new());
        }
        // `Arc::new_cyclic` hands us a `Weak<Task>` pointing at the
        // allocation before it is fully initialized, so the PID
        // registry can be given something to downgrade-check against
        // without ever needing a raw pointer into the `Arc`.
        Arc::new_cyclic(|weak| {
            let pid = PIDS.allocate(Weak::clone(weak));
            Task {
                pid,
                code_refcount,
                vm: Mutex::new(vm),
                sockets: Mutex::new(sockets),
                pending: Mutex::new(VecDeque::new()),
                threads: Mutex::new(VecDeque::new()),
                stacks: Mutex::new(IndexSet::new_bounded(config::MAX_STACK_SLOTS)),
                descriptors: Mutex::new(IndexSet::new_unbounded()),
                lifecycle: Mutex::new(Lifecycle {
                    refcount: 0,
                    is_killed: false,
                    kill_reason: None,
                }),
            }
        })
    }

    /// Builds an empty task (fresh VM, empty index sets, registered
    /// `Pid`) with no code mapped in. Used directly by tests and as the
    /// first step of [`create_task_from_code`]/[`fork_task`].
    fn new_empty(code_refcount: Arc<core::sync::atomic::AtomicU64>) -> Result<Arc<Task>, CreateTaskError> {
        let vm = Vm::new().ok_or(CreateTaskError::OutOfMemory)?;
        let task = Task::bare(vm, code_refcount);
        with_tasks(|tasks| tasks.insert(task.pid, Arc::clone(&task)));
        Ok(task)
    }

    /// Builds a task suitable only for unit tests that need a valid
    /// `Arc<Task>` but do not exercise VM or code-copy behaviour.
    #[cfg(test)]
    pub fn new_for_test() -> Arc<Task> {
        let code_refcount = Arc::new(core::sync::atomic::AtomicU64::new(0));
        Task::new_empty(code_refcount).expect("TestPlatform allocation cannot fail")
    }

    /// Identity-maps the first `KERNEL_LOW_PAGE_COUNT` pages of `vm`
    /// with `PRESENT | WRITE | GLOBAL`, frame number equal to page
    /// number, per `spec.md` §4.C's "identity-map the first 4 MiB"
    /// step. Returns `false` on the first mapping failure.
    fn map_low_memory(vm: &Vm) -> bool {
        let flags = PageFlags::PRESENT | PageFlags::WRITE | PageFlags::GLOBAL;
        for page in 0..config::KERNEL_LOW_PAGE_COUNT {
            let vpage = VirtPage::new(config::KERNEL_LOW_PAGE + page);
            if !vm.map(vpage, PhysFrame(vpage.0), flags) {
                return false;
            }
        }
        true
    }

    /// Builds a task from a flat code image: an empty task, the
    /// kernel's low-memory identity map, then `ceil(len/4096)` freshly
    /// allocated, copied code pages at `CODE_PAGE`, per `spec.md` §4.C.
    /// `code_refcount` starts at 1. Any partially built state is
    /// unwound (by `Vm`'s `Drop`, which frees the whole root at once)
    /// on failure.
    pub fn create_task_from_code(code: &[u8]) -> Result<Arc<Task>, CreateTaskError> {
        let task = Task::new_empty(Arc::new(core::sync::atomic::AtomicU64::new(0)))?;
        let ok = {
            let vm = task.vm.lock();
            if !Task::map_low_memory(&vm) {
                false
            } else {
                let page_count = align::align_up_usize(code.len(), config::PAGE_SIZE as usize)
                    / config::PAGE_SIZE as usize;
                let mut mapped = true;
                for i in 0..page_count {
                    let frame = match with_critical(|c| platform::platform().alloc_zeroed(c)) {
                        Some(frame) => frame,
                        None => {
                            mapped = false;
                            break;
                        }
                    };
                    let start = i * config::PAGE_SIZE as usize;
                    let end = min(start + config::PAGE_SIZE as usize, code.len());
                    with_critical(|c| {
                        platform::platform().write(frame, 0, &code[start..end], c)
                    });
                    let vpage = VirtPage::new(config::CODE_PAGE + i as u64);
                    let flags = PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER;
                    if !vm.map(vpage, frame, flags) {
                        mapped = false;
                        break;
                    }
                }
                mapped
            }
        };
        if !ok {
            let pid = task.pid;
            with_tasks(|tasks| tasks.remove(&pid));
            PIDS.release(pid);
            return Err(CreateTaskError::OutOfMemory);
        }
        task.code_refcount.store(1, core::sync::atomic::Ordering::SeqCst);
        info!("task {} created from {} bytes of code", task.pid.as_u32(), code.len());
        Ok(task)
    }

    /// Creates an empty task whose code segment mirrors `self`'s
    /// (shared physical pages, `code_refcount` incremented), per
    /// `spec.md` §4.C's fork algorithm. No threads, descriptors, or
    /// sockets are inherited.
    pub fn fork_task(self: &Arc<Task>) -> Result<Arc<Task>, CreateTaskError> {
        // Incremented up front so the child is constructed already
        // sharing the parent's counter (`Task::bare` needs the final
        // `code_refcount` at construction time, not after the fact);
        // rolled back below if the fork doesn't pan out.
        self.code_refcount
            .fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        let child = match Task::new_empty(Arc::clone(&self.code_refcount)) {
            Ok(child) => child,
            Err(e) => {
                self.code_refcount
                    .fetch_sub(1, core::sync::atomic::Ordering::SeqCst);
                return Err(e);
            }
        };
        // The parent's `vm_lock` is taken, read, and released before the
        // child's is ever touched — never both at once — matching the
        // original `task.c` fork, which unlocks `aTask->vmLock` before
        // locking the child's (`spec.md` §5 forbids holding two
        // same-category locks without address ordering, and this crate
        // doesn't order `Task`s by address at all).
        let mappings = self.vm.lock().snapshot_code_mappings();
        let ok = {
            let child_vm = child.vm.lock();
            Task::map_low_memory(&child_vm) && child_vm.apply_code_mappings(&mappings)
        };
        if !ok {
            self.code_refcount
                .fetch_sub(1, core::sync::atomic::Ordering::SeqCst);
            let pid = child.pid;
            with_tasks(|tasks| tasks.remove(&pid));
            PIDS.release(pid);
            return Err(CreateTaskError::OutOfMemory);
        }
        info!("task {} forked from task {}", child.pid.as_u32(), self.pid.as_u32());
        Ok(child)
    }

    /// Attempts to take a transient reference. Fails if the task is
    /// already killed (`spec.md` §4.C).
    pub fn try_reference(self: &Arc<Task>) -> Option<Arc<Task>> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_killed {
            return None;
        }
        lifecycle.refcount += 1;
        Some(Arc::clone(self))
    }

    /// Releases a transient reference taken by [`Task::try_reference`]
    /// (or implicitly held by a thread for its lifetime). If this was
    /// the last reference and the task is killed, generates the kill
    /// job rather than freeing inline, since the caller may currently
    /// be executing inside this very task.
    pub fn dereference(self: &Arc<Task>) {
        let should_kill = {
            let mut lifecycle = self.lifecycle.lock();
            debug_assert!(lifecycle.refcount > 0, "dereference without a matching reference");
            lifecycle.refcount -= 1;
            lifecycle.refcount == 0 && lifecycle.is_killed
        };
        if should_kill {
            crate::kill::spawn_kill_job(Arc::clone(self));
        }
    }

    /// Marks the task killed. Future `try_reference` calls fail. If the
    /// refcount is already zero, generates the kill job immediately;
    /// otherwise the final `dereference` will.
    pub fn kill(self: &Arc<Task>, reason: KillReason) {
        let should_kill = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.is_killed {
                return;
            }
            lifecycle.is_killed = true;
            lifecycle.kill_reason = Some(reason);
            lifecycle.refcount == 0
        };
        info!("task {} killed ({:?})", self.pid.as_u32(), reason);
        if should_kill {
            crate::kill::spawn_kill_job(Arc::clone(self));
        }
    }

    pub fn kill_reason(&self) -> Option<KillReason> {
        self.lifecycle.lock().kill_reason
    }

    pub fn is_killed(&self) -> bool {
        self.lifecycle.lock().is_killed
    }

    pub(crate) fn vm(&self) -> &Mutex<Vm> {
        &self.vm
    }

    pub(crate) fn threads(&self) -> &Mutex<VecDeque<Arc<Thread>>> {
        &self.threads
    }

    pub(crate) fn sockets(&self) -> &Mutex<Vec<VecDeque<Arc<SocketLink>>>> {
        &self.sockets
    }

    pub(crate) fn pending(&self) -> &Mutex<VecDeque<Arc<SocketLink>>> {
        &self.pending
    }

    pub(crate) fn stacks(&self) -> &Mutex<IndexSet> {
        &self.stacks
    }

    pub(crate) fn descriptors(&self) -> &Mutex<IndexSet> {
        &self.descriptors
    }

    pub(crate) fn code_refcount(&self) -> &Arc<core::sync::atomic::AtomicU64> {
        &self.code_refcount
    }

    /// Looks the task up by `pid`, the Rust rendering of kill
    /// machinery's precondition that the dying task is already
    /// unreachable via any fresh lookup once this returns `None`.
    pub fn lookup(pid: Pid) -> Option<Arc<Task>> {
        PIDS.lookup(pid)
    }

    /// Removes the task from the global table, the point at which the
    /// last owning `Arc<Task>` (besides any the caller still holds)
    /// drops. Called only by kill machinery's final step.
    pub(crate) fn forget(pid: Pid) {
        with_tasks(|tasks| tasks.remove(&pid));
        PIDS.release(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::with_test_platform;

    #[test]
    fn create_from_code_maps_and_copies_pages() {
        with_test_platform(|tp| {
            let code = [1u8, 2, 3, 4, 5];
            let task = Task::create_task_from_code(&code).expect("creation should succeed");
            let vm = task.vm.lock();
            let (frame, flags) = vm.lookup(VirtPage::new(config::CODE_PAGE));
            assert!(flags.contains(PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER));
            assert_eq!(&tp.frame_contents(frame)[..5], &code[..]);
            assert_eq!(
                task.code_refcount.load(core::sync::atomic::Ordering::SeqCst),
                1
            );
        });
    }

    #[test]
    fn fork_shares_code_and_increments_refcount() {
        with_test_platform(|_tp| {
            let parent = Task::create_task_from_code(&[0xAA; 9000]).unwrap();
            let child = parent.fork_task().unwrap();

            let parent_vm = parent.vm.lock();
            let child_vm = child.vm.lock();
            let (parent_frame, parent_flags) = parent_vm.lookup(VirtPage::new(config::CODE_PAGE));
            let (child_frame, child_flags) = child_vm.lookup(VirtPage::new(config::CODE_PAGE));
            assert_eq!(parent_frame, child_frame);
            assert_eq!(parent_flags, child_flags);
            assert_eq!(
                parent.code_refcount.load(core::sync::atomic::Ordering::SeqCst),
                2
            );
            assert!(child.threads.lock().is_empty());
        });
    }

    #[test]
    fn reference_fails_after_kill() {
        with_test_platform(|_tp| {
            let task = Task::new_for_test();
            task.kill(KillReason::Killed);
            assert!(task.try_reference().is_none());
        });
    }

    #[test]
    fn dereference_to_zero_after_kill_spawns_kill_job() {
        with_test_platform(|_tp| {
            let task = Task::new_for_test();
            let held = task.try_reference().expect("not yet killed");
            task.kill(KillReason::Exit);
            // Still referenced once: kill job must not run yet.
            assert!(task.lifecycle.lock().refcount > 0);
            task.dereference();
            drop(held);
            // `dereference` already dropped the count to zero above;
            // this just confirms no panic/double-decrement occurred.
        });
    }
}
