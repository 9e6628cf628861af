// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared kernel type definitions, used by both the kernel and application
//! code.
//!
//! Nothing in here does anything; this crate is the common vocabulary of
//! handles, result codes, and state descriptions that the kernel API is
//! phrased in.

#![no_std]

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Names a slot in the kernel's task table.
///
/// Task IDs are handed out by `task_create` and remain valid until the task
/// is deleted. A stale ID names a vacant slot and is rejected with
/// `KernelError::BadHandle`; an ID reused for a *new* task is not detected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct TaskId(pub u16);

/// Handle to a counting semaphore.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct SemId(pub u16);

/// Handle to a recursive mutex with priority inheritance.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct MutexId(pub u16);

/// Handle to a mailbox (bounded queue of message pointers).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct MboxId(pub u16);

/// Handle to an event flag group.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct FlagsId(pub u16);

/// Handle to a fixed-block memory pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct PoolId(pub u16);

/// Handle to a timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct TimerId(pub u16);

/// Value carried through a mailbox or delivered from a memory pool.
///
/// The kernel treats messages as opaque words; they round-trip bit-exact.
pub type Message = *mut ();

/// Entry point of a task. Tasks never return; a task that is done should
/// call `task_delete_self`.
pub type TaskEntry = fn(*mut ()) -> !;

/// Timer expiration callback.
pub type TimerFn = fn(*mut ());

bitflags::bitflags! {
    /// Blocking-state bits of a task. A task with no bits set is READY and
    /// lives on the ready list for its priority.
    ///
    /// `DELAYED` is orthogonal to the other two: it tracks membership in the
    /// tick-driven delay list, and can be combined with `WAIT_EVENT` for a
    /// timed wait.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct TaskState: u32 {
        /// Task is sleeping on the delay list.
        const DELAYED = 1 << 0;
        /// Task has a nonzero suspend count.
        const SUSPENDED = 1 << 1;
        /// Task is queued on a synchronization object's wait list.
        const WAIT_EVENT = 1 << 2;
    }
}

/// Result codes returned by kernel operations.
///
/// Success is `Ok`; these are the failure cases. A blocked task exits its
/// wait without the condition holding in exactly two cases: `Timeout` and
/// `Deleted`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// The wait elapsed before the condition was met.
    Timeout,
    /// The object was destroyed while the task was waiting on it.
    Deleted,
    /// Post into a bounded container whose capacity is exhausted and no
    /// waiter exists (semaphore at max, full mailbox, full pool free list).
    ResourceFull,
    /// Mutex unlock attempted by a task that does not own it.
    NotOwner,
    /// Non-blocking poll found the resource unavailable.
    Unavailable,
    /// A fixed kernel pool (tasks, events, timers) has no free slot.
    NoSlot,
    /// The handle names a vacant slot or an object of another type.
    BadHandle,
    /// An argument failed validation (priority out of range, stack too
    /// small, misaligned pool storage, ...).
    BadParam,
}

/// How a flag-group wait matches against the group's 32-bit flag word.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlagsMode {
    /// All requested bits must be set.
    SetAll,
    /// At least one requested bit must be set.
    SetAny,
    /// All requested bits must be clear.
    ClearAll,
    /// At least one requested bit must be clear.
    ClearAny,
}

/// Where a timer's callback runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerKind {
    /// Dispatched directly from the tick interrupt, inside the kernel
    /// critical section. Callbacks must be short and must not block.
    Hard,
    /// Dispatched from the timer worker task. Callbacks may use any
    /// blocking kernel primitive.
    Soft,
}

/// Life-cycle state of a timer. Destruction is not a state: destroying a
/// timer releases its slot and invalidates the handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerState {
    /// Initialized, never started (or never restarted after creation).
    Created,
    /// Counting down on the hard or soft list.
    Started,
    /// Callback currently executing.
    Running,
    /// Stopped explicitly or expired (one-shot).
    Stopped,
}

/// Snapshot of a task, as reported by `task_info`.
#[derive(Copy, Clone, Debug)]
pub struct TaskInfo {
    pub priority: Priority,
    pub state: TaskState,
    /// Remaining delay, in ticks. Meaningful only while `DELAYED` is set.
    pub delay_ticks: u32,
    /// Remaining time slice, in ticks.
    pub slice: u32,
    pub suspend_count: u32,
    /// Total stack size, in bytes.
    pub stack_size: usize,
    /// Bytes of stack never written since creation, measured by counting
    /// still-zero sentinel words up from the stack base.
    pub stack_free: usize,
}

/// Snapshot of a semaphore.
#[derive(Copy, Clone, Debug)]
pub struct SemInfo {
    pub count: u32,
    /// Maximum count; 0 means unbounded.
    pub max: u32,
    pub waiters: usize,
}

/// Snapshot of a mutex.
#[derive(Copy, Clone, Debug)]
pub struct MutexInfo {
    pub owner: Option<TaskId>,
    pub recursion: u32,
    /// Owner's priority at lock time; differs from the owner's current
    /// priority while priority inheritance is in effect.
    pub owner_base_priority: Priority,
    pub waiters: usize,
}

/// Snapshot of a mailbox.
#[derive(Copy, Clone, Debug)]
pub struct MboxInfo {
    pub count: usize,
    pub capacity: usize,
    pub waiters: usize,
}

/// Snapshot of a flag group.
#[derive(Copy, Clone, Debug)]
pub struct FlagsInfo {
    pub flags: u32,
    pub waiters: usize,
}

/// Snapshot of a memory pool.
#[derive(Copy, Clone, Debug)]
pub struct PoolInfo {
    pub block_size: usize,
    pub block_count: usize,
    pub free_count: usize,
    pub waiters: usize,
}

/// Snapshot of a timer.
#[derive(Copy, Clone, Debug)]
pub struct TimerInfo {
    pub start_delay: u32,
    pub period: u32,
    /// Ticks until the next expiry, while started.
    pub countdown: u32,
    pub kind: TimerKind,
    pub state: TimerState,
}
