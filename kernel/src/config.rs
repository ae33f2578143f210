// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tuning constants and the fixed address-space layout, gathered in one
//! place the way the teacher's `memory::constants` module centralizes
//! its layout numbers rather than scattering them across callers.

/// Maximum number of `DATA` messages a single queue direction may hold
/// before `Socket::msg` refuses to enqueue another. Control messages
/// (`CONNECT`, `REMOTE_CLOSED`, `REMOTE_KILLED`, `REMOTE_EXIT`,
/// `REMOTE_MEMORY_FAULT`) bypass this limit.
pub const MAX_BUF: usize = 8;

/// Maximum payload length of a single message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 0xfe8;

/// Depth of the pager-thread fault queue. Shares the data-queue
/// backpressure constant, since a page-fault record is, like a DATA
/// message, best-effort diagnostic traffic rather than a guaranteed
/// delivery channel.
pub const MAX_PENDING_FAULTS: usize = MAX_BUF;

/// Upper bound (exclusive) on the number of stack slots a single task
/// may allocate.
pub const MAX_STACK_SLOTS: usize = 1 << 20;

/// Number of socket descriptor buckets in a task's descriptor table,
/// hashed by `descriptor & (SOCKET_BUCKETS - 1)`.
pub const SOCKET_BUCKETS: usize = 16;

/// The dispatcher's preemption quantum: a thread runs for at most this
/// long before the timer forces a return to the dispatcher.
pub const QUANTUM_TICKS_PER_SECOND_DIVISOR: u64 = 32;

/// Page size, in bytes, of every mapping the VM facade manages.
pub const PAGE_SIZE: u64 = 0x1000;

/// Virtual page number of the first page of kernel identity-mapped low
/// memory, and the number of pages identity-mapped there.
pub const KERNEL_LOW_PAGE: u64 = 0;
pub const KERNEL_LOW_PAGE_COUNT: u64 = 0x400; // 4 MiB / 4 KiB.

/// Base virtual page number of a task's code segment.
pub const CODE_PAGE: u64 = 0x1000;

/// Base virtual page number of the kernel-stacks region: one 4 KiB page
/// per thread, indexed by stack slot.
pub const KERN_STACKS_PAGE: u64 = 0x10_0000;

/// Base virtual page number of the user-stacks region: 256 pages per
/// thread, indexed by `slot << 8`.
pub const USER_STACKS_PAGE: u64 = 0x20_0000;

/// Number of pages reserved for a single thread's user stack.
pub const USER_STACK_PAGES: u64 = 256;
