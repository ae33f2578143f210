// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Renders `spec.md`'s `@critical`/`@noncritical` annotation discipline
//! as a type-state token, per the Design Note in `SPEC_FULL.md` §5:
//! acquiring a spinlock requires a `&Critical`, and the only way to
//! obtain one is to be inside [`with_critical`]'s closure. This turns
//! "called without interrupts disabled" from a runtime assertion into
//! a compile error, the same way the teacher's
//! `interrupts::without_interrupts(|| { ... })` scopes "this runs with
//! interrupts off" as a closure rather than a pair of unchecked calls.

use super::platform;

/// Proof that this CPU is currently in a critical section (interrupts
/// disabled). Zero-sized and not `Clone`/`Copy`: a `Critical` cannot be
/// stored past the end of the closure that produced it.
pub struct Critical(());

/// Disables interrupts on this CPU, runs `f`, then re-enables them.
///
/// Nesting is safe but not reentrant-free: a second `with_critical`
/// call inside `f` will unconditionally re-enable interrupts when it
/// returns, even though the outer call is still logically critical.
/// Keep critical sections short and non-nested, as the teacher's own
/// `without_interrupts` call sites do.
pub fn with_critical<R>(f: impl FnOnce(&Critical) -> R) -> R {
    let cpu = platform();
    cpu.disable_interrupts();
    let token = Critical(());
    let result = f(&token);
    cpu.enable_interrupts();
    result
}
