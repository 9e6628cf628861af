// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time kernel configuration.
//!
//! Applications tune the kernel by editing these constants; they take the
//! place of a generated config file since the kernel has no build-time app
//! description to read.

/// Number of priority levels. Must be a power of two in `[8, 32]`; the
/// ready bitmap is a single 32-bit word.
pub const PRIO_COUNT: usize = 32;

/// Default time-slice length, in ticks, granted to a task when it is
/// created and each time it is rotated to the back of its level.
pub const SLICE_MAX: u32 = 10;

/// Capacity of the task table, including the built-in idle and timer
/// worker tasks.
pub const TASK_CAP: usize = 16;

/// Capacity of the synchronization-object table (semaphores, mutexes,
/// mailboxes, flag groups, memory pools combined). The timer module uses
/// two slots for its internal semaphores.
pub const EVENT_CAP: usize = 16;

/// Capacity of the timer table.
pub const TIMER_CAP: usize = 16;

/// Stack size of the built-in idle task, in words.
pub const IDLE_STACK_WORDS: usize = 256;

/// Stack size of the soft-timer worker task, in words.
pub const TIMER_TASK_STACK_WORDS: usize = 256;

/// Priority of the soft-timer worker task. Must be more important than the
/// idle priority (`PRIO_COUNT - 1`); how much more important is a latency
/// policy decision for the application.
pub const TIMER_TASK_PRIO: u8 = 1;

/// Tick period, in milliseconds.
pub const SYSTICK_MS: u32 = 10;

/// Ticks per second, derived from the tick period. Used by the CPU-usage
/// averaging window.
pub const TICKS_PER_SEC: u64 = (1000 / SYSTICK_MS) as u64;

const _: () = assert!(
    PRIO_COUNT >= 8 && PRIO_COUNT <= 32 && PRIO_COUNT.is_power_of_two()
);
const _: () = assert!((TIMER_TASK_PRIO as usize) < PRIO_COUNT - 1);
const _: () = assert!(SLICE_MAX > 0);
const _: () = assert!(1000 % SYSTICK_MS == 0);
