// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A `Platform` backed by plain heap allocation and a manually driven
//! clock, in place of real page tables and real timer hardware. This
//! is the "thin test harness that mocks these" line from `spec.md` §1
//! — out of scope as a product feature, required as test tooling.
//!
//! Tests exercise the crate's bookkeeping (task/thread lifecycle,
//! socket protocol, dispatcher queue discipline) directly; they never
//! call the diverging `-> !` entry points ([`crate::scheduler::run`],
//! [`crate::scheduler::delete_current_kernel`]), so `resume`/`switch`/
//! `run_on_scratch_stack` here are simple stand-ins rather than real
//! architectural primitives.

use super::{
    Critical, Cpu, CpuId, LogSink, PageFlags, PageTableWalker, PhysFrame, PhysFrameAllocator,
    SavedState, Ticks, VirtPage, VmRoot,
};
use crate::pid::Pid;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

// Serializes test bodies that touch the global platform. `cargo test`
// runs `#[test]` functions on separate host threads by default, but
// this crate's modules talk to one process-global `Platform` (matching
// the teacher's own static-global idiom); running two tests'
// kernel-level operations concurrently against two different
// `TestPlatform`s swapped into the same global would race.
static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Installs a fresh [`TestPlatform`] as the global platform, holds
/// `TEST_LOCK` for the duration of `f`, and runs `f` against it. Every
/// `#[test]` in this crate that touches task/thread/socket/scheduler
/// state should go through this rather than calling
/// `platform::init`/`platform::reset_for_test` directly.
pub fn with_test_platform<R>(f: impl FnOnce(&TestPlatform) -> R) -> R {
    let _guard = TEST_LOCK.lock();
    let tp: &'static TestPlatform = Box::leak(Box::new(TestPlatform::new()));
    super::reset_for_test(tp);
    crate::scheduler::reset_for_test();
    crate::interrupts::reset_for_test();
    f(tp)
}

/// A `Platform` suitable for host-target unit tests.
pub struct TestPlatform {
    next_root: AtomicU64,
    next_frame: AtomicU64,
    tables: Mutex<BTreeMap<(u64, u64), (PhysFrame, PageFlags)>>,
    frames: Mutex<BTreeMap<u64, alloc::vec::Vec<u8>>>,
    clock: AtomicU64,
    last_armed: AtomicU64,
}

impl TestPlatform {
    pub fn new() -> Self {
        TestPlatform {
            next_root: AtomicU64::new(1),
            next_frame: AtomicU64::new(1),
            tables: Mutex::new(BTreeMap::new()),
            frames: Mutex::new(BTreeMap::new()),
            clock: AtomicU64::new(0),
            last_armed: AtomicU64::new(0),
        }
    }

    /// Returns the bytes written into `frame` by `PhysFrameAllocator::write`,
    /// for tests that check code-copy behaviour.
    pub fn frame_contents(&self, frame: PhysFrame) -> alloc::vec::Vec<u8> {
        self.frames
            .lock()
            .get(&frame.0)
            .cloned()
            .unwrap_or_default()
    }

    /// Advances the simulated clock by `ticks`, as if that much time
    /// passed with nothing else happening.
    pub fn advance(&self, ticks: Ticks) {
        self.clock.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Returns the tick the test most recently asked the timer to be
    /// armed for.
    pub fn last_armed(&self) -> Ticks {
        self.last_armed.load(Ordering::SeqCst)
    }
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTableWalker for TestPlatform {
    fn new_root(&self, _critical: &Critical) -> Option<VmRoot> {
        Some(VmRoot(self.next_root.fetch_add(1, Ordering::SeqCst)))
    }

    fn free_root(&self, root: VmRoot, _critical: &Critical) {
        self.tables.lock().retain(|(r, _), _| *r != root.0);
    }

    fn map(
        &self,
        root: VmRoot,
        vpage: VirtPage,
        dpage: PhysFrame,
        flags: PageFlags,
        _critical: &Critical,
    ) -> bool {
        self.tables
            .lock()
            .insert((root.0, vpage.0), (dpage, flags));
        true
    }

    fn unmap(&self, root: VmRoot, vpage: VirtPage, _critical: &Critical) {
        self.tables.lock().remove(&(root.0, vpage.0));
    }

    fn lookup(&self, root: VmRoot, vpage: VirtPage, _critical: &Critical) -> (PhysFrame, PageFlags) {
        self.tables
            .lock()
            .get(&(root.0, vpage.0))
            .copied()
            .unwrap_or((PhysFrame(0), PageFlags::empty()))
    }
}

impl PhysFrameAllocator for TestPlatform {
    fn alloc_zeroed(&self, _critical: &Critical) -> Option<PhysFrame> {
        Some(PhysFrame(self.next_frame.fetch_add(1, Ordering::SeqCst)))
    }

    fn free(&self, _frame: PhysFrame, _critical: &Critical) {}

    fn write(&self, frame: PhysFrame, offset: usize, data: &[u8], _critical: &Critical) {
        let mut frames = self.frames.lock();
        let buf = frames.entry(frame.0).or_insert_with(|| alloc::vec![0u8; 0x1000]);
        buf[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl super::Clock for TestPlatform {
    fn now(&self) -> Ticks {
        self.clock.load(Ordering::SeqCst)
    }

    fn ticks_per_second(&self) -> Ticks {
        512
    }
}

impl Cpu for TestPlatform {
    fn id(&self) -> CpuId {
        CpuId(0)
    }

    fn disable_interrupts(&self) {}

    fn enable_interrupts(&self) {}

    fn halt(&self) {}

    fn arm_timer(&self, when: Ticks, _critical: &Critical) {
        self.last_armed.store(when, Ordering::SeqCst);
    }

    fn notify_invalidate(&self, _pid: Pid) {}

    fn notify_dead(&self, _pid: Pid) {}

    fn run_on_scratch_stack(&self, arg: usize, f: fn(usize) -> !) -> ! {
        f(arg)
    }
}

impl super::ContextSwitch for TestPlatform {
    fn init_kernel_thread(&self, _stack_top: usize, _entry: fn(usize) -> !, _arg: usize) -> SavedState {
        SavedState(0)
    }

    fn init_user_thread(&self, _stack_top: usize, _entry_point: u64) -> SavedState {
        SavedState(0)
    }

    fn switch(&self, _current: &mut SavedState, _next: &SavedState, _critical: &Critical) {}

    fn resume(&self, _state: &SavedState, _critical: &Critical) -> ! {
        panic!("TestPlatform::resume: tests drive bookkeeping directly, not real execution")
    }
}

impl LogSink for TestPlatform {
    fn write_str(&self, _s: &str) {}
}
