// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler core.
//!
//! All kernel state lives in one [`Kernel`] value: the task table, the
//! per-priority ready lists with their occupancy bitmap, the delay list,
//! the synchronization-object and timer tables, and the scheduler
//! registers. The other kernel modules are `impl Kernel` blocks over this
//! struct; nothing here is a free-standing global except the single static
//! cell in `startup`.
//!
//! Scheduling is fixed-priority preemptive: the runnable task at the lowest
//! occupied bitmap index runs, and ties within a level are broken by
//! round-robin time slicing (see `time`). Any operation that changes
//! readiness reports a [`NextTask`] hint; acting on the hint means calling
//! [`Kernel::reschedule`] and, if it returns `true`, pending the context
//! switch interrupt.

use abi::{KernelError, Priority, TaskId};
use kerncore::{List, Node, PrioBitmap};

use crate::arch;
use crate::config;
use crate::event::Event;
use crate::startup::with_kernel;
use crate::task::{NextTask, Task};
use crate::time::CpuUsage;
use crate::timer::Timer;

/// The whole kernel.
///
/// Access is serialized by the interrupt-disable critical section; see
/// `startup::with_kernel` for the discipline.
pub struct Kernel {
    /// Task table. A `TaskId` is an index into this array.
    pub(crate) tasks: [Option<Task>; config::TASK_CAP],
    /// Link nodes for ready lists *and* event wait queues. A task is on at
    /// most one of those at a time, so one node per slot suffices.
    pub(crate) run_links: [Node; config::TASK_CAP],
    /// Link nodes for the delay list, which is independent of the above.
    pub(crate) delay_links: [Node; config::TASK_CAP],
    /// Ready list per priority; the head is the next task to run at that
    /// level.
    pub(crate) ready: [List; config::PRIO_COUNT],
    /// Bit `p` set iff `ready[p]` is non-empty.
    pub(crate) ready_map: PrioBitmap,
    /// All tasks with `DELAYED` set, in no particular order.
    pub(crate) delayed: List,
    /// Task currently executing (or about to give up the CPU).
    pub(crate) current: Option<u16>,
    /// Task selected to run after the pended switch, if one is pending.
    pub(crate) next: Option<u16>,
    /// Nested scheduler-disable count; selection is inhibited while > 0.
    pub(crate) sched_lock: u8,
    /// Ticks since boot (restarted once when CPU measurement engages).
    pub(crate) tick_count: u64,
    /// Synchronization objects, named by the index part of their handles.
    pub(crate) events: [Option<Event>; config::EVENT_CAP],
    /// Timer table.
    pub(crate) timers: [Option<Timer>; config::TIMER_CAP],
    /// Link nodes for the hard/soft timer lists.
    pub(crate) timer_links: [Node; config::TIMER_CAP],
    /// Timers dispatched from the tick ISR.
    pub(crate) hard_timers: List,
    /// Timers dispatched from the worker task.
    pub(crate) soft_timers: List,
    /// CPU-utilization measurement state.
    pub(crate) usage: CpuUsage,
    /// Application init hook, consumed by the idle task on first run.
    pub(crate) app_init: Option<fn()>,
}

impl Kernel {
    pub const fn new() -> Self {
        const NO_TASK: Option<Task> = None;
        const NO_EVENT: Option<Event> = None;
        const NO_TIMER: Option<Timer> = None;
        const NODE: Node = Node::new();
        const LIST: List = List::new();
        Kernel {
            tasks: [NO_TASK; config::TASK_CAP],
            run_links: [NODE; config::TASK_CAP],
            delay_links: [NODE; config::TASK_CAP],
            ready: [LIST; config::PRIO_COUNT],
            ready_map: PrioBitmap::new(),
            delayed: LIST,
            current: None,
            next: None,
            sched_lock: 0,
            tick_count: 0,
            events: [NO_EVENT; config::EVENT_CAP],
            timers: [NO_TIMER; config::TIMER_CAP],
            timer_links: [NODE; config::TIMER_CAP],
            hard_timers: LIST,
            soft_timers: LIST,
            usage: CpuUsage::new(),
            app_init: None,
        }
    }

    /// Borrows the task in slot `ix`, which must be occupied.
    pub(crate) fn task_ref(&self, ix: u16) -> &Task {
        match self.tasks[usize::from(ix)].as_ref() {
            Some(t) => t,
            None => panic!("vacant task slot"),
        }
    }

    /// Mutable flavor of [`Self::task_ref`].
    pub(crate) fn task_mut(&mut self, ix: u16) -> &mut Task {
        match self.tasks[usize::from(ix)].as_mut() {
            Some(t) => t,
            None => panic!("vacant task slot"),
        }
    }

    /// Checks a caller-supplied task handle.
    pub(crate) fn get_task(
        &mut self,
        id: TaskId,
    ) -> Result<&mut Task, KernelError> {
        self.tasks
            .get_mut(usize::from(id.0))
            .and_then(|s| s.as_mut())
            .ok_or(KernelError::BadHandle)
    }

    /// Index of the task the scheduler believes is running.
    ///
    /// Panics if called outside task context (i.e. before the first task
    /// has been launched), which would indicate a kernel API being used
    /// from startup code.
    pub(crate) fn current_index(&self) -> u16 {
        match self.current {
            Some(ix) => ix,
            None => panic!("no current task"),
        }
    }

    /// Adds `ix` to the ready set, at the head of its priority's list.
    pub(crate) fn sched_ready(&mut self, ix: u16) {
        let p = usize::from(self.task_ref(ix).priority.0);
        self.ready[p].push_front(&mut self.run_links, ix);
        self.ready_map.set(p);
    }

    /// Removes `ix` from the ready set, maintaining the bitmap.
    pub(crate) fn sched_unready(&mut self, ix: u16) {
        let p = usize::from(self.task_ref(ix).priority.0);
        self.ready[p].remove(&mut self.run_links, ix);
        if self.ready[p].is_empty() {
            self.ready_map.clear(p);
        }
    }

    /// Selects the most important ready task: the head of the list at the
    /// lowest set bitmap index.
    ///
    /// Panics if no task is ready. The built-in idle task never blocks, so
    /// after startup this cannot happen with intact kernel state.
    pub(crate) fn highest_ready(&self) -> u16 {
        let p = match self.ready_map.first_set() {
            Some(p) => p,
            None => panic!("no runnable task"),
        };
        match self.ready[p].first() {
            Some(ix) => ix,
            None => panic!("ready bitmap out of sync"),
        }
    }

    /// Scheduling decision point. If the scheduler is unlocked and the
    /// highest-ready task differs from `current`, records it as `next` and
    /// returns `true`, in which case the caller must pend the context
    /// switch.
    pub(crate) fn reschedule(&mut self) -> bool {
        if self.sched_lock > 0 {
            return false;
        }
        let t = self.highest_ready();
        if self.current != Some(t) {
            self.next = Some(t);
            true
        } else {
            false
        }
    }

    /// Increments the scheduler lock, saturating at 255.
    pub fn lock_scheduler(&mut self) {
        self.sched_lock = self.sched_lock.saturating_add(1);
    }

    /// Decrements the scheduler lock. On the transition to zero the caller
    /// should act on the returned hint.
    pub fn unlock_scheduler(&mut self) -> NextTask {
        if self.sched_lock > 0 {
            self.sched_lock -= 1;
            if self.sched_lock == 0 {
                return NextTask::Other;
            }
        }
        NextTask::Same
    }

    /// Moves `ix` to a new priority, keeping the ready table and bitmap
    /// consistent. Used by mutex priority inheritance. A task that is not
    /// ready (blocked, delayed, or suspended) just has its priority field
    /// updated; FIFO wait-queue positions are unaffected by priority.
    pub(crate) fn set_priority(&mut self, ix: u16, new: Priority) {
        let (old, ready) = {
            let t = self.task_ref(ix);
            (t.priority, t.is_ready())
        };
        if old == new {
            return;
        }
        if ready {
            self.sched_unready(ix);
            self.task_mut(ix).priority = new;
            self.sched_ready(ix);
        } else {
            self.task_mut(ix).priority = new;
        }
    }

    /// Completes a context switch: records the outgoing stack pointer,
    /// promotes `next` to `current`, and returns the incoming stack
    /// pointer. Called from the pended switch handler with `old_sp == 0`
    /// exactly once, at first launch, when there is no outgoing context.
    pub(crate) fn switch_context(&mut self, old_sp: usize) -> usize {
        if old_sp != 0 {
            if let Some(cur) = self.current {
                // The slot may have been vacated if the outgoing task
                // deleted itself; its context is not worth saving then.
                if let Some(t) = self.tasks[usize::from(cur)].as_mut() {
                    t.saved_sp = old_sp;
                }
            }
        }
        let nxt = match self.next.take() {
            Some(n) => n,
            // Spurious switch request; stay where we are.
            None => self.current_index(),
        };
        self.current = Some(nxt);
        self.task_ref(nxt).saved_sp
    }
}

/// Requests a scheduling pass and pends the context switch if one is due.
/// Must be called outside the kernel borrow but may be called with
/// interrupts disabled; the switch itself happens once interrupts are
/// enabled and all other handlers have retired.
pub(crate) fn reschedule_now() {
    let status = arch::enter_critical();
    if with_kernel(|k| k.reschedule()) {
        arch::pend_context_switch();
    }
    arch::exit_critical(status);
}

/// Runs a kernel operation that yields a value and a scheduling hint,
/// acting on the hint. This is the shape of every non-blocking API wrapper.
pub(crate) fn run_scheduler_op<T>(
    f: impl FnOnce(&mut Kernel) -> Result<(T, NextTask), KernelError>,
) -> Result<T, KernelError> {
    let status = arch::enter_critical();
    let out = with_kernel(|k| match f(k) {
        Ok((v, hint)) => {
            let switch = hint == NextTask::Other && k.reschedule();
            Ok((v, switch))
        }
        Err(e) => Err(e),
    });
    let out = match out {
        Ok((v, switch)) => {
            if switch {
                arch::pend_context_switch();
            }
            Ok(v)
        }
        Err(e) => Err(e),
    };
    arch::exit_critical(status);
    out
}

/// Disables the scheduler. Nesting is allowed, saturating at 255 holds.
pub fn sched_disable() {
    let status = arch::enter_critical();
    with_kernel(|k| k.lock_scheduler());
    arch::exit_critical(status);
}

/// Re-enables the scheduler, running a scheduling pass when the nesting
/// count reaches zero.
pub fn sched_enable() {
    let status = arch::enter_critical();
    let switch = with_kernel(|k| {
        k.unlock_scheduler() == NextTask::Other && k.reschedule()
    });
    if switch {
        arch::pend_context_switch();
    }
    arch::exit_critical(status);
}

/// The task currently executing, if the kernel has been started.
pub fn current_task() -> Option<TaskId> {
    let status = arch::enter_critical();
    let cur = with_kernel(|k| k.current);
    arch::exit_critical(status);
    cur.map(TaskId)
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared helpers for driving a local `Kernel` value in unit tests,
    //! standing in for the context-switch machinery.

    use super::*;

    pub(crate) fn leak_stack(words: usize) -> &'static mut [usize] {
        Box::leak(vec![0usize; words].into_boxed_slice())
    }

    /// Task entry for tasks that are never actually run by tests.
    pub(crate) fn spin(_arg: *mut ()) -> ! {
        loop {
            std::hint::spin_loop();
        }
    }

    /// Creates a task at `prio` with a throwaway stack.
    pub(crate) fn spawn(k: &mut Kernel, prio: u8) -> TaskId {
        k.task_create(spin, core::ptr::null_mut(), Priority(prio), {
            leak_stack(64)
        })
        .expect("spawn failed")
    }

    /// Declares `id` to be the running task, as the switch handler would.
    pub(crate) fn run(k: &mut Kernel, id: TaskId) {
        k.current = Some(id.0);
        k.next = None;
    }

    /// Performs any pending context switch.
    pub(crate) fn finish_switch(k: &mut Kernel) {
        if k.next.is_some() {
            let _ = k.switch_context(0);
        }
    }

    /// Reschedules and performs the switch, as the API wrappers + PendSV
    /// would after the current task blocked.
    pub(crate) fn block_switch(k: &mut Kernel) {
        let _ = k.reschedule();
        finish_switch(k);
    }

    /// Simulates one tick interrupt: runs the tick handler, dispatches any
    /// due hard-timer callbacks, and performs the resulting switch.
    pub(crate) fn simulate_tick(k: &mut Kernel) {
        let (hint, batch) = k.tick();
        for (cb, arg) in batch.iter() {
            cb(arg);
        }
        k.finish_timers(&batch);
        if hint == NextTask::Other && k.reschedule() {
            finish_switch(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn ready_table_and_bitmap_stay_in_sync() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 4);
        let b = spawn(&mut k, 4);
        let c = spawn(&mut k, 9);
        assert!(k.ready_map.get(4));
        assert!(k.ready_map.get(9));
        assert_eq!(k.ready[4].len(), 2);

        k.sched_unready(a.0);
        assert!(k.ready_map.get(4), "level still occupied by b");
        k.sched_unready(b.0);
        assert!(!k.ready_map.get(4), "bit must clear with the last task");
        k.sched_unready(c.0);
        assert!(k.ready_map.is_empty());
    }

    #[test]
    fn highest_ready_is_numerically_smallest_priority() {
        let mut k = Kernel::new();
        let _low = spawn(&mut k, 20);
        let hi = spawn(&mut k, 3);
        let _mid = spawn(&mut k, 10);
        assert_eq!(k.highest_ready(), hi.0);
    }

    #[test]
    fn reschedule_picks_other_task_and_respects_lock() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 8);
        let b = spawn(&mut k, 2);
        run(&mut k, a);

        k.lock_scheduler();
        assert!(!k.reschedule(), "locked scheduler must not switch");
        assert_eq!(k.unlock_scheduler(), NextTask::Other);
        assert!(k.reschedule());
        assert_eq!(k.next, Some(b.0));

        finish_switch(&mut k);
        assert_eq!(k.current, Some(b.0));
        assert!(!k.reschedule(), "already running the best task");
    }

    #[test]
    fn scheduler_lock_nests_and_saturates() {
        let mut k = Kernel::new();
        let _a = spawn(&mut k, 1);
        for _ in 0..300 {
            k.lock_scheduler();
        }
        assert_eq!(k.sched_lock, 255);
        // Unlock down to one; still locked.
        for _ in 0..254 {
            assert_eq!(k.unlock_scheduler(), NextTask::Same);
        }
        assert_eq!(k.unlock_scheduler(), NextTask::Other);
        assert_eq!(k.sched_lock, 0);
        assert_eq!(k.unlock_scheduler(), NextTask::Same);
    }

    #[test]
    fn set_priority_moves_ready_task_between_levels() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 12);
        k.set_priority(a.0, Priority(5));
        assert!(!k.ready_map.get(12));
        assert!(k.ready_map.get(5));
        assert_eq!(k.highest_ready(), a.0);
        assert_eq!(k.task_ref(a.0).priority, Priority(5));
    }

    #[test]
    fn switch_context_saves_and_loads_stack_pointers() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 3);
        let b = spawn(&mut k, 4);
        run(&mut k, a);
        let b_sp = k.task_ref(b.0).saved_sp;

        k.next = Some(b.0);
        let loaded = k.switch_context(0xdead_0000);
        assert_eq!(loaded, b_sp);
        assert_eq!(k.current, Some(b.0));
        assert_eq!(k.task_ref(a.0).saved_sp, 0xdead_0000);
    }
}
