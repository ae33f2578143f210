// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! IRQ delivery and page-fault handling — `spec.md` §4.E, plus the
//! pager-delivery path that generalizes the same singleton-thread
//! pattern to lazily-backed pages a task's own fault handler (rather
//! than the kernel) resolves.

use crate::config;
use crate::pid::Pid;
use crate::platform::{self, with_critical, PageFlags, VirtPage};
use crate::task::{KillReason, Task};
use crate::thread::{Thread, ThreadId};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use log::warn;
use spin::Mutex;

/// One queued page fault a task's registered pager thread has not yet
/// consumed via [`next_pending_fault`].
#[derive(Debug, Clone, Copy)]
pub struct PageFaultRecord {
    pub task: Pid,
    pub address: VirtPage,
    pub thread: ThreadId,
}

/// What [`handle_page_fault`] did about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultOutcome {
    /// A lazily-reserved page was backed with a fresh zeroed frame; the
    /// faulting instruction can simply be retried.
    Resolved,
    /// The access was a privilege violation or otherwise unrecoverable;
    /// the task was killed.
    Fatal,
    /// Handed to the registered pager thread for a userspace decision.
    Queued,
    /// No pager thread is registered to receive the fault, so the task
    /// was killed instead of being queued.
    KilledNoObserver,
}

static INTERRUPT_THREAD: Mutex<Option<Arc<Thread>>> = Mutex::new(None);
static PAGER_THREAD: Mutex<Option<Arc<Thread>>> = Mutex::new(None);

lazy_static! {
    static ref PENDING_FAULTS: Mutex<VecDeque<PageFaultRecord>> = Mutex::new(VecDeque::new());
}

/// Registers the thread that receives IRQ deliveries via
/// [`deliver_irq`]. Ordinarily called once, during host boot.
pub fn register_interrupt_thread(thread: Arc<Thread>) {
    *INTERRUPT_THREAD.lock() = Some(thread);
}

pub fn interrupt_thread() -> Option<Arc<Thread>> {
    INTERRUPT_THREAD.lock().clone()
}

/// Registers the thread that receives queued page faults via
/// [`next_pending_fault`].
pub fn register_pager_thread(thread: Arc<Thread>) {
    *PAGER_THREAD.lock() = Some(thread);
}

pub fn pager_thread() -> Option<Arc<Thread>> {
    PAGER_THREAD.lock().clone()
}

/// Delivers `irq` to the registered interrupt thread — `spec.md` §4.E's
/// IRQ router. A no-op if no interrupt thread is registered, or if its
/// task has already been killed; otherwise switches to it immediately
/// if it was polling.
pub fn deliver_irq(irq: u32) {
    let thread = match interrupt_thread() {
        Some(t) => t,
        None => return,
    };
    let task = match thread.task().and_then(|t| t.try_reference()) {
        Some(t) => t,
        None => return,
    };
    if thread.raise_irq_and_test_polling(irq) {
        with_critical(|critical| crate::scheduler::switch_to(Some(task), thread, critical));
    } else {
        task.dereference();
    }
}

/// Handles a page fault on `vpage` for `thread` (a thread of `task`) —
/// `spec.md` §4.E's page-fault handling:
///
/// - A kernel-mode fault is always unrecoverable.
/// - A lazily-reserved (`UNALLOC`, not yet `PRESENT`) page gets backed
///   with a fresh zeroed frame and retried.
/// - A write fault against a page mapped without `WRITE`, or any fault
///   against a page without `USER`, is a privilege violation: the task
///   is killed.
/// - Anything else (a legitimately absent mapping) is handed to the
///   task's pager thread.
pub fn handle_page_fault(
    task: &Arc<Task>,
    thread: &Arc<Thread>,
    vpage: VirtPage,
    faulted_in_user_mode: bool,
) -> PageFaultOutcome {
    if !faulted_in_user_mode {
        panic!("kernel-mode page fault is unrecoverable");
    }

    let vm = task.vm().lock();
    let (_, flags) = vm.lookup(vpage);

    if flags.contains(PageFlags::UNALLOC) && !flags.contains(PageFlags::PRESENT) {
        let resolved = match with_critical(|c| platform::platform().alloc_zeroed(c)) {
            Some(frame) => vm.map(vpage, frame, PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER),
            None => false,
        };
        drop(vm);
        if resolved {
            PageFaultOutcome::Resolved
        } else {
            task.kill(KillReason::MemoryFault);
            PageFaultOutcome::Fatal
        }
    } else if flags.contains(PageFlags::PRESENT) && !flags.contains(PageFlags::USER) {
        drop(vm);
        task.kill(KillReason::MemoryFault);
        PageFaultOutcome::Fatal
    } else if flags == PageFlags::empty() {
        drop(vm);
        deliver_to_pager(task, thread, vpage)
    } else {
        // Present, user-accessible, but the fault happened anyway (e.g.
        // a write against a read-only mapping): a privilege violation.
        drop(vm);
        task.kill(KillReason::MemoryFault);
        PageFaultOutcome::Fatal
    }
}

fn deliver_to_pager(task: &Arc<Task>, thread: &Arc<Thread>, vpage: VirtPage) -> PageFaultOutcome {
    let pager = match pager_thread() {
        Some(t) => t,
        None => {
            task.kill(KillReason::MemoryFault);
            return PageFaultOutcome::KilledNoObserver;
        }
    };

    let record = PageFaultRecord { task: task.pid(), address: vpage, thread: thread.id() };
    {
        let mut pending = PENDING_FAULTS.lock();
        if pending.len() >= config::MAX_PENDING_FAULTS {
            warn!("dropping oldest page-fault record: pager queue full");
            pending.pop_front();
        }
        pending.push_back(record);
    }

    let pager_task = match pager.task().and_then(|t| t.try_reference()) {
        Some(t) => t,
        None => return PageFaultOutcome::Queued,
    };
    if pager.test_and_clear_polling() {
        with_critical(|critical| crate::scheduler::switch_to(Some(pager_task), pager, critical));
    } else {
        pager_task.dereference();
    }
    PageFaultOutcome::Queued
}

/// Pops the oldest queued fault, for the pager thread to consume once
/// it wakes up.
pub fn next_pending_fault() -> Option<PageFaultRecord> {
    PENDING_FAULTS.lock().pop_front()
}

/// Clears all interrupt/pager-routing state. Exposed only to the test
/// harness, for the same reason as `crate::scheduler::reset_for_test`.
#[cfg(test)]
pub(crate) fn reset_for_test() {
    *INTERRUPT_THREAD.lock() = None;
    *PAGER_THREAD.lock() = None;
    PENDING_FAULTS.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::with_test_platform;
    use crate::task::Task;

    fn noop_entry(_arg: usize) -> ! {
        unreachable!("kernel thread entry is never actually resumed on the host")
    }

    #[test]
    fn deliver_irq_is_noop_without_a_registered_thread() {
        with_test_platform(|_tp| {
            // Must not panic even though nothing is registered.
            deliver_irq(3);
        });
    }

    #[test]
    fn deliver_irq_wakes_a_polling_interrupt_thread() {
        with_test_platform(|_tp| {
            let old = Thread::create_kernel(0, noop_entry).unwrap();
            crate::scheduler::install_dummy_current_for_test(None, Arc::clone(&old));

            let task = Task::new_for_test();
            let thread = Thread::create_user(&task, 0).unwrap();
            assert!(!thread.poll());
            register_interrupt_thread(Arc::clone(&thread));

            deliver_irq(5);

            assert!(Arc::ptr_eq(&crate::scheduler::current_thread().unwrap(), &thread));
            assert!(crate::scheduler::queue_contains(&old));
        });
    }

    #[test]
    fn lazy_unalloc_fault_maps_a_zeroed_page() {
        with_test_platform(|_tp| {
            let task = Task::new_for_test();
            let thread = Thread::create_user(&task, 0).unwrap();
            let vpage = VirtPage::new(config::USER_STACKS_PAGE);
            {
                let vm = task.vm().lock();
                vm.map(vpage, crate::platform::PhysFrame(0), PageFlags::UNALLOC);
            }

            let outcome = handle_page_fault(&task, &thread, vpage, true);
            assert_eq!(outcome, PageFaultOutcome::Resolved);

            let vm = task.vm().lock();
            let (_, flags) = vm.lookup(vpage);
            assert!(flags.contains(PageFlags::PRESENT));
        });
    }

    #[test]
    fn write_to_read_only_page_kills_the_task() {
        with_test_platform(|_tp| {
            let task = Task::new_for_test();
            let thread = Thread::create_user(&task, 0).unwrap();
            let vpage = VirtPage::new(config::CODE_PAGE);
            {
                let vm = task.vm().lock();
                vm.map(vpage, crate::platform::PhysFrame(9), PageFlags::PRESENT | PageFlags::USER);
            }

            let outcome = handle_page_fault(&task, &thread, vpage, true);
            assert_eq!(outcome, PageFaultOutcome::Fatal);
            assert!(task.is_killed());
        });
    }

    #[test]
    fn fault_with_no_registered_pager_kills_the_task() {
        with_test_platform(|_tp| {
            let task = Task::new_for_test();
            let thread = Thread::create_user(&task, 0).unwrap();
            let vpage = VirtPage::new(config::USER_STACKS_PAGE);

            let outcome = handle_page_fault(&task, &thread, vpage, true);
            assert_eq!(outcome, PageFaultOutcome::KilledNoObserver);
            assert!(task.is_killed());
        });
    }

    #[test]
    fn fault_with_a_registered_pager_is_queued_for_it() {
        with_test_platform(|_tp| {
            let old = Thread::create_kernel(0, noop_entry).unwrap();
            crate::scheduler::install_dummy_current_for_test(None, Arc::clone(&old));

            let pager_task = Task::new_for_test();
            let pager = Thread::create_user(&pager_task, 0).unwrap();
            assert!(!pager.poll());
            register_pager_thread(Arc::clone(&pager));

            let task = Task::new_for_test();
            let thread = Thread::create_user(&task, 0).unwrap();
            let vpage = VirtPage::new(config::USER_STACKS_PAGE);

            let outcome = handle_page_fault(&task, &thread, vpage, true);
            assert_eq!(outcome, PageFaultOutcome::Queued);
            assert!(!task.is_killed());

            let record = next_pending_fault().unwrap();
            assert_eq!(record.address, vpage);
            assert_eq!(record.task, task.pid());
        });
    }
}
