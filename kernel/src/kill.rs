// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The seven-step kill protocol — `spec.md` §4.G. Split out of
//! `crate::scheduler` (which only ever runs jobs, not invents them)
//! because tearing down a task touches its VM, threads, and sockets,
//! none of which the scheduler otherwise needs to know about.

use crate::config;
use crate::platform::{self, with_critical, PageFlags, VirtPage};
use crate::task::Task;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use log::{error, info};

/// Steps 1-2: pulls every thread of `task` off the ready queue and
/// spawns the kernel thread that will run the rest of the protocol.
/// Called from [`crate::task::Task::kill`]/[`crate::task::Task::
/// dereference`] the moment a killed task's refcount reaches zero.
pub(crate) fn spawn_kill_job(task: Arc<Task>) {
    // Collected into a `Vec` first and the lock dropped before calling
    // `scheduler::delete`, which takes the higher-row `run_queue_lock`
    // (`spec.md` §5 forbids acquiring a higher-row lock while holding a
    // lower-row one). `spec.md` §4.G step 1 notes no thread-list lock is
    // even required here — nothing else can reach this unreferenced
    // task — so dropping it early costs nothing.
    let threads: Vec<_> = task.threads().lock().iter().cloned().collect();
    for thread in &threads {
        crate::scheduler::delete(thread);
    }
    let raw = Arc::into_raw(task) as usize;
    if !crate::scheduler::push_kernel(raw, run_kill_job) {
        // SAFETY: `push_kernel` failing leaves the raw pointer
        // unconsumed; reclaim it before aborting, or it leaks.
        drop(unsafe { Arc::from_raw(raw as *const Task) });
        error!("out of memory while spawning a task's kill job");
        panic!("out of memory while spawning a task's kill job");
    }
}

fn run_kill_job(arg: usize) -> ! {
    // SAFETY: `arg` is exactly the pointer `spawn_kill_job` produced via
    // `Arc::into_raw`.
    let task = unsafe { Arc::from_raw(arg as *const Task) };
    run_kill_steps(task);

    // 7. Return to the dispatcher.
    crate::scheduler::delete_current_kernel()
}

/// Steps 3-6 of the protocol, split out from [`run_kill_job`] so it can
/// be exercised directly in tests without going through the diverging
/// `delete_current_kernel` tail.
fn run_kill_steps(task: Arc<Task>) {
    let reason = task.kill_reason().expect("kill job without a kill reason");
    info!("kill job running for task {} ({:?})", task.pid().as_u32(), reason);

    // 3. Release the shared code segment, if this was the last task
    // referencing it.
    if task.code_refcount().fetch_sub(1, Ordering::SeqCst) == 1 {
        let vm = task.vm().lock();
        let mut page = VirtPage::new(config::CODE_PAGE);
        let end = VirtPage::new(config::KERN_STACKS_PAGE);
        while page < end {
            let (frame, flags) = vm.lookup(page);
            if flags.contains(PageFlags::PRESENT) {
                with_critical(|c| platform::platform().free(frame, c));
                vm.unmap(page);
            }
            page = page.offset(1);
        }
    }

    // 4. Free every thread's stacks. Each thread here was already pulled
    // off the ready queue by `spawn_kill_job`, and none of them can be
    // "current" on any CPU: a task this far into the kill path (refcount
    // zero) has nothing still holding a reference to keep it running.
    // Drained into a `Vec` and the `threads_lock` guard dropped before
    // freeing anything: `free_user_stack`/`free_kernel_stack` take
    // `vm_lock`, a higher row than `threads_lock` in `spec.md` §5's
    // ordering, so the lock must already be gone by then.
    {
        let drained: Vec<_> = task.threads().lock().drain(..).collect();
        for thread in drained {
            thread.free_user_stack();
            thread.free_kernel_stack();
            drop(thread);
        }
    }

    // 5. Close every socket link the task still owns, notifying each
    // remaining peer with this task's kill reason instead of a plain
    // REMOTE_CLOSED. Drained into a `Vec` and the `sockets_lock` guard
    // dropped before calling `close_for_kill`/`dereference`: a link
    // closed here with its refcount already at 1 routes straight into
    // `SocketLink::destroy`, whose first act is to re-acquire this same
    // task's `sockets_lock` — fatal self-deadlock on a non-reentrant
    // `spin::Mutex` if that lock is still held.
    {
        let drained: Vec<_> = {
            let mut sockets = task.sockets().lock();
            sockets.iter_mut().flat_map(|bucket| bucket.drain(..)).collect()
        };
        for link in drained {
            link.close_for_kill(reason.message_type());
            link.dereference();
        }
    }
    task.pending().lock().clear();

    // 6. Free the task's index sets, VM root, and struct: automatic,
    // once the last owning reference (the permanent `TASKS` entry) is
    // dropped below.
    let pid = task.pid();
    drop(task);
    Task::forget(pid);
    platform::platform().notify_dead(pid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::with_test_platform;
    use crate::task::KillReason;
    use crate::thread::Thread;

    #[test]
    fn spawn_kill_job_pulls_threads_off_the_ready_queue() {
        with_test_platform(|_tp| {
            let task = Task::new_for_test();
            let thread = Thread::create_user(&task, 0).unwrap();
            Thread::add(Arc::clone(&thread));
            assert!(crate::scheduler::queue_contains(&thread));

            task.kill(KillReason::Killed);

            assert!(!crate::scheduler::queue_contains(&thread));
        });
    }

    #[test]
    fn run_kill_steps_releases_shared_code_segment_only_once_both_tasks_are_gone() {
        with_test_platform(|_tp| {
            let parent = Task::create_task_from_code(&[0xAB; 32]).unwrap();
            let child = parent.fork_task().unwrap();
            assert_eq!(parent.code_refcount().load(Ordering::SeqCst), 2);

            parent.kill(KillReason::Exit);
            run_kill_steps(parent);
            assert_eq!(child.code_refcount().load(Ordering::SeqCst), 1);

            child.kill(KillReason::Exit);
            run_kill_steps(child);
        });
    }

    #[test]
    fn run_kill_steps_closes_sockets_with_the_task_kill_reason() {
        with_test_platform(|_tp| {
            let a = Task::new_for_test();
            let b = Task::new_for_test();
            let link_a = crate::socket::SocketLink::new_socket(&a).unwrap();
            assert!(link_a.connect(&b));

            a.kill(KillReason::MemoryFault);
            run_kill_steps(a);

            let bucket = b.sockets().lock();
            let link_b = bucket.iter().flatten().next().unwrap().clone();
            drop(bucket);
            let msg = link_b.read().unwrap();
            assert_eq!(msg.ty, crate::socket::MessageType::Connect);

            // `spec.md` §8's S5: once the killed peer quiesces, B
            // observes its kill reason on the same socket instead of a
            // plain `REMOTE_CLOSED`, with no double-free or
            // use-after-free along the way.
            let fault_msg = link_b.read().unwrap();
            assert_eq!(fault_msg.ty, crate::socket::MessageType::RemoteMemoryFault);

            link_b.close(0);
            link_b.dereference();
        });
    }
}
