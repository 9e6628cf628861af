// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Preemptive, priority-based RTOS kernel for small 32-bit microcontrollers.
//!
//! Tasks run at fixed priorities (numerically lower = more important) with
//! round-robin time slicing among tasks that share a level. All blocking
//! primitives -- semaphore, mutex, mailbox, flag group, memory pool -- are
//! built on one generic wait-queue, and a tick interrupt drives delays,
//! slicing, and timers.
//!
//! The code outside the `arch` module is portable; it is actively developed
//! against ARMv7-M plus a hosted variant used for unit tests.
//!
//! # Design principles
//!
//! 1. Static everything. The kernel never allocates: tasks, synchronization
//!    objects, and timers live in fixed tables, and bulk storage (stacks,
//!    mailbox buffers, pool memory) is caller-supplied.
//! 2. One lock. Every kernel state transition happens with interrupts
//!    disabled; there are no finer-grained locks to get wrong.
//! 3. Deferred switching. Kernel calls and ISRs only *request* a context
//!    switch; the actual register save/restore runs in the lowest-priority
//!    pended interrupt, so kernel state is never observed mid-transition.
//! 4. A strong preference for safe code where reasonable. Queue membership
//!    is index moves between lists, not pointer graphs.

#![cfg_attr(not(test), no_std)]

/// Kernel-internal assertion. These check invariants whose violation means
/// kernel state is corrupt; there is nothing useful to return to the caller.
macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// Kernel debug logging. Compiles to semihosting output when the
/// `klog-semihosting` feature is enabled on ARM, and to nothing otherwise.
macro_rules! klog {
    ($($args:tt)*) => {
        #[cfg(all(target_arch = "arm", feature = "klog-semihosting"))]
        {
            let _ = cortex_m_semihosting::hprintln!($($args)*);
        }
    };
}

pub mod arch;
pub mod config;
pub mod event;
pub mod flags;
pub mod mbox;
pub mod mempool;
pub mod mutex;
pub mod sched;
pub mod sem;
pub mod startup;
pub mod task;
pub mod time;
pub mod timer;
