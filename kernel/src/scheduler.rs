// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The global ready queue, the dispatcher, and per-CPU current-thread
//! bookkeeping — `spec.md` §4.D.
//!
//! `CURRENT` plays the role of the teacher's GS-base `CpuData` (see
//! `multitasking/cpu_local.rs`): one `(task, thread)` pair per CPU.
//! Since this crate is host-arch-agnostic it cannot assume a
//! segmentation register to hold that pointer, so it is kept in a
//! `spin::Mutex`-guarded map keyed by `CpuId` instead — the same
//! `static` + `spin::Mutex` idiom the teacher uses for its own
//! `THREADS`/`SCHEDULER` globals.

use crate::config;
use crate::platform::{self, with_critical, Critical, CpuId, Ticks};
use crate::task::Task;
use crate::thread::Thread;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use core::cmp::min;
use lazy_static::lazy_static;
use spin::Mutex;

struct Current {
    /// `None` for a kernel thread (`push_kernel`'s product); `Some` is
    /// the logical reference this thread's task-liveness is riding on
    /// for as long as it stays current, paired with exactly one
    /// `Task::dereference` once it stops being current.
    task: Option<Arc<Task>>,
    thread: Arc<Thread>,
}

lazy_static! {
    static ref READY: Mutex<VecDeque<Arc<Thread>>> = Mutex::new(VecDeque::new());
    static ref CURRENT: Mutex<BTreeMap<CpuId, Current>> = Mutex::new(BTreeMap::new());
}

/// Appends `thread` to the tail of the ready queue, unless its task has
/// already been killed — `spec.md` §4.D's `push`.
pub(crate) fn push(thread: Arc<Thread>) {
    if let Some(task) = thread.task() {
        if task.is_killed() {
            return;
        }
    }
    READY.lock().push_back(thread);
}

/// Removes the thread from the queue, tolerating its absence —
/// `spec.md` §4.D's `delete`. Used by kill machinery (`crate::kill`) to
/// pull a dying task's threads off the queue before they can be
/// dispatched again.
pub(crate) fn delete(thread: &Arc<Thread>) {
    READY.lock().retain(|t| !Arc::ptr_eq(t, thread));
}

/// Removes this CPU's current `(task, thread)`, re-appends the thread
/// to the ready queue, and releases the task reference that came with
/// being current — `spec.md` §4.D's `push_current`. A thread holds no
/// task reference while merely sitting on the ready queue; the
/// dispatcher (or `switch_to`) acquires a fresh one the moment it makes
/// a thread current again.
fn push_current(cpu: CpuId) {
    let removed = CURRENT.lock().remove(&cpu);
    if let Some(current) = removed {
        push(Arc::clone(&current.thread));
        if let Some(task) = current.task {
            task.dereference();
        }
    }
}

/// Allocates a bare kernel thread with no owning task, enqueues it, and
/// returns whether that succeeded — `spec.md` §4.D's `push_kernel`.
/// Kernel threads must exit through [`delete_current_kernel`], never
/// `crate::scheduler::thread_exit` (that path assumes a task).
pub fn push_kernel(arg: usize, entry: fn(usize) -> !) -> bool {
    match Thread::create_kernel(arg, entry) {
        Some(thread) => {
            push(thread);
            true
        }
        None => false,
    }
}

/// Hands execution directly to `thread` (optionally as `task`) without
/// going through the ready queue — `spec.md` §4.D's `switch`, and the
/// shared plumbing behind IRQ delivery (`crate::interrupts`) and socket
/// peer wakeup (`crate::socket::wake_peer`). `task`, if present, must
/// already represent exactly one outstanding reference (the caller's
/// own `Task::try_reference`); it becomes this thread's "current"
/// reference and is released later, whenever this thread stops being
/// current.
///
/// If this CPU already has a current thread, that thread's state is
/// saved and this function returns once it is resumed again — the
/// `save_return_state`/setjmp-style wakeup of `spec.md` §9, rendered as
/// the explicit [`crate::platform::ContextSwitch::switch`] call. If
/// there is no current thread (the dispatcher calling this with
/// nothing yet running), execution never returns: the thread is
/// resumed outright.
pub(crate) fn switch_to(task: Option<Arc<Task>>, thread: Arc<Thread>, critical: &Critical) {
    let cpu = platform::platform().id();
    let old = CURRENT.lock().remove(&cpu);
    if let Some(old_current) = &old {
        push(Arc::clone(&old_current.thread));
        if let Some(old_task) = &old_current.task {
            old_task.dereference();
        }
    }
    CURRENT.lock().insert(cpu, Current { task, thread: Arc::clone(&thread) });

    let new_state = thread.state().lock();
    match &old {
        Some(old_current) => {
            let mut old_state = old_current.thread.state().lock();
            platform::platform().switch(&mut old_state, &new_state, critical);
        }
        None => {
            platform::platform().resume(&new_state, critical);
        }
    }
}

/// Scans `task`'s thread list for the first thread whose `is_polling`
/// flag test-and-clears to true and switches to it — `spec.md` §4.F's
/// "peer wakeup" step, generalized for reuse by `crate::interrupts`'
/// IRQ/pager delivery too, since both reduce to "wake the one thread
/// waiting on this task for an event." Returns whether a thread was
/// actually switched to: on `true`, `task`'s reference was consumed
/// (handed into the new current-thread bookkeeping); on `false`, the
/// caller still owns it and must dereference it itself.
pub(crate) fn wake_one(task: &Arc<Task>) -> bool {
    let target = {
        let threads = task.threads().lock();
        threads.iter().find(|th| th.test_and_clear_polling()).cloned()
    };
    match target {
        Some(thread) => {
            with_critical(|critical| switch_to(Some(Arc::clone(task)), thread, critical));
            true
        }
        None => false,
    }
}

/// The dispatcher: picks the next eligible thread, arms the timer, and
/// resumes it. Never returns — `spec.md` §4.D's `run`.
pub fn run() -> ! {
    loop {
        let picked = {
            let mut queue = READY.lock();
            let scan_limit = queue.len();
            let mut next_timer: Option<Ticks> = None;
            let mut picked = None;
            for _ in 0..scan_limit {
                let th = match queue.pop_front() {
                    Some(t) => t,
                    None => break,
                };
                let now = platform::platform().now();
                if th.next_timestamp() > now {
                    next_timer = Some(match next_timer {
                        Some(cur) => min(cur, th.next_timestamp()),
                        None => th.next_timestamp(),
                    });
                    queue.push_back(th);
                    continue;
                }
                match th.task() {
                    Some(task) => match task.try_reference() {
                        Some(task_ref) => {
                            picked = Some((Some(task_ref), th));
                            break;
                        }
                        // Killed since it was enqueued: the kill job
                        // already removed it from this queue in theory,
                        // but a race against that removal is harmless —
                        // just drop it without re-enqueueing.
                        None => continue,
                    },
                    None => {
                        picked = Some((None, th));
                        break;
                    }
                }
            }
            picked.map(|p| (p, next_timer))
        };

        match picked {
            Some(((task, thread), next_timer)) => {
                with_critical(|critical| {
                    let now = platform::platform().now();
                    let quantum = now + platform::platform().ticks_per_second() / config::QUANTUM_TICKS_PER_SECOND_DIVISOR;
                    let when = match next_timer {
                        Some(t) => min(t, quantum),
                        None => quantum,
                    };
                    platform::platform().arm_timer(when, critical);
                    switch_to(task, thread, critical);
                });
            }
            None => platform::platform().halt(),
        }
    }
}

/// The timer interrupt's entry point, called once the host's interrupt
/// trampoline has already saved the interrupted thread's context into
/// its `Thread::state`. Removes that thread from "current" and
/// re-enters the dispatcher — `spec.md` §4.D's "timer tick".
pub fn timer_tick() -> ! {
    let cpu = platform::platform().id();
    push_current(cpu);
    run()
}

/// Removes this CPU's current kernel thread, switches onto the CPU's
/// scratch stack, frees that thread's stack, and re-enters the
/// dispatcher — `spec.md` §4.D's `delete_current_kernel`. The
/// counterpart to `push_kernel`; never call this on a thread with a
/// task (see `crate::scheduler::thread_exit` instead).
pub fn delete_current_kernel() -> ! {
    let cpu = platform::platform().id();
    let current = CURRENT.lock().remove(&cpu);
    let thread = current
        .expect("delete_current_kernel with no current thread")
        .thread;
    debug_assert!(thread.task().is_none(), "delete_current_kernel called on a user thread");
    let raw = Arc::into_raw(thread) as usize;
    platform::platform().run_on_scratch_stack(raw, finish_delete_current_kernel);
}

fn finish_delete_current_kernel(arg: usize) -> ! {
    // SAFETY: `arg` is exactly the pointer `delete_current_kernel`
    // produced via `Arc::into_raw` just before the scratch-stack jump.
    let thread = unsafe { Arc::from_raw(arg as *const Thread) };
    thread.free_kernel_stack();
    drop(thread);
    run()
}

/// The calling user thread's exit sequence — `spec.md` §4.C's "thread
/// exit": free the user stack eagerly (safe, since it never touches the
/// kernel stack this very call is running on), broadcast a VM
/// invalidation, then hand the rest (unlinking from the task, freeing
/// the kernel stack, dropping the task reference) to a freshly spawned
/// kernel thread running on a different stack entirely. Never returns.
pub fn thread_exit() -> ! {
    let cpu = platform::platform().id();
    let current = CURRENT.lock().remove(&cpu);
    let thread = current
        .expect("thread_exit with no current thread")
        .thread;
    // `current.task` (this thread's "is running" reference) is dropped
    // here; the logical `Task::dereference` it represents happens later,
    // inside `exit_kernel_job`, via `thread.task()` — the same `Task`,
    // reached through the thread's own permanent back-reference rather
    // than this transient one.
    let task = thread.task().expect("thread_exit called from a kernel thread");
    thread.free_user_stack();
    platform::platform().notify_invalidate(task.pid());

    let raw = Arc::into_raw(thread) as usize;
    platform::platform().run_on_scratch_stack(raw, finish_thread_exit);
}

fn finish_thread_exit(arg: usize) -> ! {
    // SAFETY: see `finish_delete_current_kernel`.
    let thread = unsafe { Arc::from_raw(arg as *const Thread) };
    let raw = Arc::into_raw(thread) as usize;
    if !push_kernel(raw, exit_kernel_job) {
        // SAFETY: `push_kernel` failing leaves the raw pointer
        // unconsumed; reclaim it so nothing leaks before aborting.
        drop(unsafe { Arc::from_raw(raw as *const Thread) });
        log::error!("out of memory while tearing down an exiting thread");
        panic!("out of memory while tearing down an exiting thread");
    }
    run()
}

fn exit_kernel_job(arg: usize) -> ! {
    // SAFETY: see `finish_delete_current_kernel`.
    let thread = unsafe { Arc::from_raw(arg as *const Thread) };
    let task = thread.task().cloned();
    if let Some(task) = &task {
        task.threads().lock().retain(|t| !Arc::ptr_eq(t, &thread));
    }
    thread.free_kernel_stack();
    drop(thread);
    if let Some(task) = task {
        task.dereference();
    }
    delete_current_kernel()
}

/// The task this CPU is currently running, if any.
pub fn current_task() -> Option<Arc<Task>> {
    let cpu = platform::platform().id();
    CURRENT.lock().get(&cpu).and_then(|c| c.task.clone())
}

/// The thread this CPU is currently running.
pub fn current_thread() -> Option<Arc<Thread>> {
    let cpu = platform::platform().id();
    CURRENT.lock().get(&cpu).map(|c| Arc::clone(&c.thread))
}

/// Clears all scheduler-global state. Exposed only to the test harness
/// (`crate::platform::test::with_test_platform`), which otherwise
/// leaves the ready queue and per-CPU current state polluted by
/// whichever test ran previously, since neither is part of
/// `TestPlatform` itself.
#[cfg(test)]
pub(crate) fn reset_for_test() {
    READY.lock().clear();
    CURRENT.lock().clear();
}

#[cfg(test)]
pub(crate) fn install_dummy_current_for_test(task: Option<Arc<Task>>, thread: Arc<Thread>) {
    let cpu = platform::platform().id();
    CURRENT.lock().insert(cpu, Current { task, thread });
}

#[cfg(test)]
pub(crate) fn queue_contains(thread: &Arc<Thread>) -> bool {
    READY.lock().iter().any(|t| Arc::ptr_eq(t, thread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::with_test_platform;
    use crate::task::{KillReason, Task};

    fn noop_entry(_arg: usize) -> ! {
        unreachable!("kernel thread entry is never actually resumed on the host")
    }

    #[test]
    fn push_and_delete_round_trip() {
        with_test_platform(|_tp| {
            let task = Task::new_for_test();
            let thread = Thread::create_user(&task, 0).unwrap();
            push(Arc::clone(&thread));
            assert!(queue_contains(&thread));
            delete(&thread);
            assert!(!queue_contains(&thread));
        });
    }

    #[test]
    fn push_silently_drops_threads_of_killed_tasks() {
        with_test_platform(|_tp| {
            let task = Task::new_for_test();
            let thread = Thread::create_user(&task, 0).unwrap();
            task.kill(KillReason::Killed);
            push(Arc::clone(&thread));
            assert!(!queue_contains(&thread));
        });
    }

    #[test]
    fn wake_one_switches_current_and_requeues_old_thread() {
        with_test_platform(|_tp| {
            let old_thread = Thread::create_kernel(0, noop_entry).unwrap();
            install_dummy_current_for_test(None, Arc::clone(&old_thread));

            let target_task = Task::new_for_test();
            let target_thread = Thread::create_user(&target_task, 0).unwrap();
            assert!(!target_thread.poll());
            let held = target_task.try_reference().unwrap();

            let consumed = wake_one(&held);
            assert!(consumed, "a polling thread was available to wake");
            assert!(queue_contains(&old_thread), "the previously current thread is requeued");
            assert!(Arc::ptr_eq(&current_thread().unwrap(), &target_thread));
        });
    }

    #[test]
    fn wake_one_returns_false_when_nothing_is_polling() {
        with_test_platform(|_tp| {
            let task = Task::new_for_test();
            let held = task.try_reference().unwrap();
            assert!(!wake_one(&held));
            held.dereference();
        });
    }

    #[test]
    fn push_kernel_enqueues_a_bare_thread() {
        with_test_platform(|_tp| {
            assert!(READY.lock().is_empty());
            assert!(push_kernel(42, noop_entry));
            assert_eq!(READY.lock().len(), 1);
            assert!(READY.lock()[0].task().is_none());
        });
    }
}
