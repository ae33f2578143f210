// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The fixed platform-facing interface every host must supply: the
//! physical frame allocator, the architecture's page table walker,
//! timer hardware, per-CPU control, context save/restore, and a log
//! sink.
//!
//! The rest of this crate never reaches for `x86_64` or any other
//! architecture crate directly; it only calls through the traits here,
//! the way the teacher keeps paging (`memory`), segmentation (`gdt`),
//! and per-CPU state (`cpu`) as separate modules behind the
//! `multitasking` module that schedules threads without caring how a
//! context switch is actually performed.

use core::sync::atomic::{AtomicBool, Ordering};

mod critical;
#[cfg(test)]
pub mod test;

pub use critical::{with_critical, Critical};

/// A virtual page number (a virtual address shifted right by 12 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtPage(pub u64);

impl VirtPage {
    pub const fn new(page: u64) -> Self {
        VirtPage(page)
    }

    pub const fn offset(self, pages: u64) -> Self {
        VirtPage(self.0 + pages)
    }
}

/// A physical page frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysFrame(pub u64);

bitflags::bitflags! {
    /// Page-table entry flags. Matches the bit layout `spec.md` §6
    /// fixes: PRESENT=1, WRITE=2, USER=4, GLOBAL=0x100, UNALLOC=0x200.
    pub struct PageFlags: u16 {
        const PRESENT = 0x1;
        const WRITE   = 0x2;
        const USER    = 0x4;
        const GLOBAL  = 0x100;
        const UNALLOC = 0x200;
    }
}

/// An opaque handle to a per-task page table root, as returned by
/// [`PageTableWalker::new_root`]. Hosts are free to make this the
/// physical address of a PML4 (or equivalent); the core crate never
/// interprets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmRoot(pub u64);

/// Per-task page table operations, the Rust rendering of `spec.md`
/// §4.B and the `vm_root_*`/`vm_map`/`vm_unmap`/`vm_lookup` entries of
/// §6. Callers hold the task's `vm_lock` (see [`crate::task::Task`])
/// around every call.
pub trait PageTableWalker: Send + Sync {
    /// Allocates a fresh page-table tree with no mappings beyond
    /// whatever the architecture always requires (e.g. a kernel half).
    fn new_root(&self, _critical: &Critical) -> Option<VmRoot>;

    /// Tears down a page-table tree. The caller must have already
    /// unmapped or intentionally leaked every entry it cares about.
    fn free_root(&self, root: VmRoot, _critical: &Critical);

    /// Installs or overwrites the mapping for `vpage`. Returns `false`
    /// if the walker itself needed to allocate an intermediate table
    /// and that allocation failed.
    fn map(
        &self,
        root: VmRoot,
        vpage: VirtPage,
        dpage: PhysFrame,
        flags: PageFlags,
        _critical: &Critical,
    ) -> bool;

    /// Clears the mapping for `vpage`, if any.
    fn unmap(&self, root: VmRoot, vpage: VirtPage, _critical: &Critical);

    /// Returns the mapping for `vpage`. Returns `PageFlags::empty()` in
    /// the flags half if the page is entirely unmapped.
    fn lookup(&self, root: VmRoot, vpage: VirtPage, _critical: &Critical) -> (PhysFrame, PageFlags);
}

/// The page-sized kernel allocator named in `spec.md` §6 (`alloc`/
/// `free`), plus the `vm_physical`/`vm_virtual` kernel-window
/// translation that same section names for copying bytes into a frame
/// that is not the running CPU's current address space (used once, by
/// [`crate::task::create_task_from_code`], to copy a new task's code
/// pages in before anything can fault on them).
pub trait PhysFrameAllocator: Send + Sync {
    /// Every frame this hands out is zeroed.
    fn alloc_zeroed(&self, _critical: &Critical) -> Option<PhysFrame>;
    fn free(&self, frame: PhysFrame, _critical: &Critical);

    /// Copies `data` into `frame` starting at byte `offset`. `offset +
    /// data.len()` must not exceed the page size.
    fn write(&self, frame: PhysFrame, offset: usize, data: &[u8], _critical: &Critical);
}

/// A monotonic tick count, in units of `1 / Clock::ticks_per_second()`
/// seconds.
pub type Ticks = u64;

/// The monotonic timer named in `spec.md` §6 (`get_time`/
/// `second_length`). Programming the timer to fire is folded into
/// [`Cpu::arm_timer`], since on real hardware both halves talk to the
/// same device.
pub trait Clock: Send + Sync {
    fn now(&self) -> Ticks;
    fn ticks_per_second(&self) -> Ticks;
}

/// Identifies one of the system's CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CpuId(pub u32);

/// Per-CPU control: critical sections, halting, cross-CPU
/// notification, and the scratch-stack trampoline used to tear down a
/// thread's own stack out from under it. The Rust rendering of
/// `spec.md` §6's `cpu_*` family.
pub trait Cpu: Send + Sync {
    fn id(&self) -> CpuId;

    /// Disables interrupt delivery on this CPU. Paired with
    /// [`Cpu::enable_interrupts`] by [`with_critical`]; do not call
    /// directly.
    fn disable_interrupts(&self);

    /// Re-enables interrupt delivery on this CPU.
    fn enable_interrupts(&self);

    /// Parks this CPU until the next interrupt.
    fn halt(&self);

    /// Programs the timer to next fire at tick `when`.
    fn arm_timer(&self, when: Ticks, _critical: &Critical);

    /// Tells other CPUs that `task`'s page tables changed and any
    /// cached translations for it must be invalidated.
    fn notify_invalidate(&self, pid: crate::pid::Pid);

    /// Tells other CPUs that `task` is gone and any cached per-task
    /// state must be dropped.
    fn notify_dead(&self, pid: crate::pid::Pid);

    /// Switches onto this CPU's dedicated scratch stack and calls
    /// `f(arg)`, which must not return. Used by
    /// [`crate::scheduler::delete_current_kernel`] and thread exit to
    /// free a stack safely from underneath the thread that was using
    /// it.
    fn run_on_scratch_stack(&self, arg: usize, f: fn(usize) -> !) -> !;
}

/// An opaque, architecture-specific saved CPU context: `spec.md` §6's
/// `save_return_state`/`set_state`, rendered as an explicit value
/// rather than a setjmp-style primitive (see `SPEC_FULL.md` §9).
#[derive(Debug, Clone, Copy)]
pub struct SavedState(pub u64);

/// Context save/restore. The Rust rendering of `spec.md` §6's
/// `thread_run`/`set_state`/`save_return_state`.
pub trait ContextSwitch: Send + Sync {
    /// Builds the initial saved state for a kernel thread that will
    /// start executing `entry(arg)` on `stack_top` (the highest
    /// address of its stack) the first time it is resumed.
    fn init_kernel_thread(&self, stack_top: usize, entry: fn(usize) -> !, arg: usize) -> SavedState;

    /// Builds the initial saved state for a user thread that will
    /// start executing at `entry_point` (a user virtual address) on
    /// `stack_top` the first time it is resumed.
    fn init_user_thread(&self, stack_top: usize, entry_point: u64) -> SavedState;

    /// Saves the currently running thread's context into `current`,
    /// then resumes `next`. Returns once `current` is resumed again by
    /// some future call to `switch`.
    fn switch(&self, current: &mut SavedState, next: &SavedState, _critical: &Critical);

    /// Resumes `state` without saving any context first. Used when the
    /// previously running thread is exiting and has no further use for
    /// its own state. Never returns.
    fn resume(&self, state: &SavedState, _critical: &Critical) -> !;
}

/// The no_std analogue of the teacher's `SerialPort`-backed `_print`:
/// wherever a real kernel would own a UART, this crate owns a
/// `LogSink`.
pub trait LogSink: Send + Sync {
    fn write_str(&self, s: &str);
}

/// Everything a host must supply, bundled into one object so `init()`
/// takes a single argument the way the teacher's `init()` sequences a
/// handful of subsystem `init()` calls.
pub trait Platform: PageTableWalker + PhysFrameAllocator + Clock + Cpu + ContextSwitch + LogSink {}

impl<T> Platform for T where T: PageTableWalker + PhysFrameAllocator + Clock + Cpu + ContextSwitch + LogSink {}

// A `spin::Mutex` rather than a `spin::Once`: production code calls
// `init` exactly once and `INITIALISED` enforces that, but the
// `#[cfg(test)]` harness needs to install a fresh `TestPlatform` for
// every test function, which `Once` cannot do.
static PLATFORM: spin::Mutex<Option<&'static dyn Platform>> = spin::Mutex::new(None);
static INITIALISED: AtomicBool = AtomicBool::new(false);

/// Installs the host's `Platform` implementation. Must be called
/// exactly once, before any other function in this crate.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init(platform: &'static dyn Platform) {
    if INITIALISED.swap(true, Ordering::SeqCst) {
        panic!("platform::init called more than once");
    }
    *PLATFORM.lock() = Some(platform);
}

/// Returns the installed platform.
///
/// # Panics
///
/// Panics if [`init`] (or, in tests, [`test::with_test_platform`]) has
/// not been called yet.
pub fn platform() -> &'static dyn Platform {
    PLATFORM
        .lock()
        .expect("platform::platform() called before platform::init()")
}

/// Overwrites the installed platform unconditionally. Only exposed to
/// tests, which need a fresh `TestPlatform` per test function rather
/// than the production one-shot-ever discipline `init` enforces.
#[cfg(test)]
pub(crate) fn reset_for_test(platform: &'static dyn Platform) {
    *PLATFORM.lock() = Some(platform);
}
