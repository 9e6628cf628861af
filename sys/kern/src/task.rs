// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.

use abi::{
    KernelError, Message, Priority, TaskEntry, TaskId, TaskInfo, TaskState,
};

use crate::arch;
use crate::config;
use crate::sched::{self, Kernel};
use crate::startup::with_kernel;

/// Internal representation of a task.
///
/// The fields are `pub(crate)` rather than private because the kernel
/// modules are all `impl Kernel` blocks over the same state; the invariants
/// (queue membership vs. `state` bits, see `sched`) are maintained by those
/// blocks collectively.
pub(crate) struct Task {
    /// Caller-supplied stack, zero-filled at creation. The zeros double as
    /// the high-water sentinel for `task_info`.
    pub(crate) stack: &'static mut [usize],
    /// Stack pointer as of the last time this task was switched out, or the
    /// synthetic initial frame before first run.
    pub(crate) saved_sp: usize,
    /// Fixed priority. Only mutex priority inheritance changes this, and it
    /// changes it back.
    pub(crate) priority: Priority,
    /// Blocking-state bits; empty means READY.
    pub(crate) state: TaskState,
    /// Remaining delay, meaningful while `DELAYED` is set.
    pub(crate) delay_ticks: u32,
    /// Remaining time slice.
    pub(crate) slice: u32,
    /// Nested suspend count.
    pub(crate) suspend_count: u32,
    /// Event slot this task is queued on, while `WAIT_EVENT` is set. This
    /// is the back-reference that lets the tick handler pull a timed-out
    /// task off the right wait queue.
    pub(crate) wait_event: Option<u16>,
    /// Outcome of the current/last wait, written by the waker.
    pub(crate) wait_result: Result<(), KernelError>,
    /// Message delivered by the waker (mailbox receive, pool allocation).
    pub(crate) wait_msg: Option<Message>,
    /// Predicate for a flag-group wait, while queued on one.
    pub(crate) flag_wait: Option<crate::flags::FlagWait>,
    /// Cleanup callback + argument, run when the task is deleted.
    pub(crate) cleanup: Option<(fn(*mut ()), *mut ())>,
    /// Cooperative self-termination signal.
    pub(crate) delete_requested: bool,
}

impl Task {
    /// A task with no state bits set is on the ready list for its priority.
    pub(crate) fn is_ready(&self) -> bool {
        self.state.is_empty()
    }

    /// Bytes of stack never written, counting still-zero sentinel words up
    /// from the base (stacks grow down).
    pub(crate) fn stack_free(&self) -> usize {
        self.stack.iter().take_while(|w| **w == 0).count()
            * core::mem::size_of::<usize>()
    }
}

/// Return value for operations that can have scheduling implications. This
/// is marked `must_use` because forgetting to actually update the scheduler
/// after performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever task we were just running.
    Same,
    /// We need to switch tasks; the scheduler will figure out which.
    Other,
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        if self == NextTask::Other || other == NextTask::Other {
            NextTask::Other
        } else {
            NextTask::Same
        }
    }
}

impl Kernel {
    /// Creates a task and makes it ready.
    ///
    /// The stack is zero-filled (sentinel for the high-water measurement)
    /// and topped with a synthetic frame so that the first switch into the
    /// task looks like an interrupt return into `entry(arg)`.
    pub(crate) fn task_create(
        &mut self,
        entry: TaskEntry,
        arg: *mut (),
        priority: Priority,
        stack: &'static mut [usize],
    ) -> Result<TaskId, KernelError> {
        if usize::from(priority.0) >= config::PRIO_COUNT
            || stack.len() < arch::MIN_STACK_WORDS
        {
            return Err(KernelError::BadParam);
        }
        let slot = self
            .tasks
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::NoSlot)?;

        stack.fill(0);
        let saved_sp = arch::initialize_stack(stack, entry, arg);

        self.tasks[slot] = Some(Task {
            stack,
            saved_sp,
            priority,
            state: TaskState::empty(),
            delay_ticks: 0,
            slice: config::SLICE_MAX,
            suspend_count: 0,
            wait_event: None,
            wait_result: Ok(()),
            wait_msg: None,
            flag_wait: None,
            cleanup: None,
            delete_requested: false,
        });
        let ix = slot as u16;
        self.sched_ready(ix);
        Ok(TaskId(ix))
    }

    /// Puts the current task to sleep for `ticks`. Zero is a no-op -- the
    /// "wait forever" meaning of zero applies to event waits only.
    pub(crate) fn task_delay(&mut self, ticks: u32) -> NextTask {
        if ticks == 0 {
            return NextTask::Same;
        }
        let cur = self.current_index();
        self.sched_unready(cur);
        self.delay_task(cur, ticks);
        NextTask::Other
    }

    /// Suspends a task, with nesting. Tasks that are delayed or waiting on
    /// an event are left alone; their queues own them until they wake.
    pub(crate) fn task_suspend(
        &mut self,
        id: TaskId,
    ) -> Result<NextTask, KernelError> {
        let ix = id.0;
        let t = self.get_task(id)?;
        if t.state
            .intersects(TaskState::DELAYED | TaskState::WAIT_EVENT)
        {
            return Ok(NextTask::Same);
        }
        t.suspend_count += 1;
        if t.suspend_count == 1 {
            t.state |= TaskState::SUSPENDED;
            self.sched_unready(ix);
            if self.current == Some(ix) {
                return Ok(NextTask::Other);
            }
        }
        Ok(NextTask::Same)
    }

    /// Undoes one level of suspension; the task becomes ready again when
    /// the count reaches zero.
    pub(crate) fn task_resume(
        &mut self,
        id: TaskId,
    ) -> Result<NextTask, KernelError> {
        let ix = id.0;
        let t = self.get_task(id)?;
        if t.state.contains(TaskState::SUSPENDED) {
            t.suspend_count -= 1;
            if t.suspend_count == 0 {
                t.state.remove(TaskState::SUSPENDED);
                self.sched_ready(ix);
                return Ok(NextTask::Other);
            }
        }
        Ok(NextTask::Same)
    }

    pub(crate) fn task_set_cleanup(
        &mut self,
        id: TaskId,
        f: fn(*mut ()),
        arg: *mut (),
    ) -> Result<(), KernelError> {
        self.get_task(id)?.cleanup = Some((f, arg));
        Ok(())
    }

    pub(crate) fn task_request_delete(
        &mut self,
        id: TaskId,
    ) -> Result<(), KernelError> {
        self.get_task(id)?.delete_requested = true;
        Ok(())
    }

    /// Removes a task from every queue it occupies and vacates its slot.
    /// Returns the cleanup callback (for the wrapper to run outside the
    /// kernel borrow) and a scheduling hint.
    pub(crate) fn task_force_delete(
        &mut self,
        id: TaskId,
    ) -> Result<(Option<(fn(*mut ()), *mut ())>, NextTask), KernelError> {
        let ix = id.0;
        let state = self.get_task(id)?.state;

        if state.contains(TaskState::WAIT_EVENT) {
            let ev = self.task_ref(ix).wait_event;
            if let Some(ev) = ev {
                let slot = match self.events[usize::from(ev)].as_mut() {
                    Some(s) => s,
                    None => panic!("wait on vacant event"),
                };
                slot.waiters.remove(&mut self.run_links, ix);
            }
        }
        if state.contains(TaskState::DELAYED) {
            self.delayed.remove(&mut self.delay_links, ix);
        }
        if state.is_empty() {
            self.sched_unready(ix);
        }

        let t = match self.tasks[usize::from(ix)].take() {
            Some(t) => t,
            None => panic!("vacant task slot"),
        };
        let hint = if self.current == Some(ix) {
            NextTask::Other
        } else {
            NextTask::Same
        };
        Ok((t.cleanup, hint))
    }

    pub(crate) fn task_info(
        &mut self,
        id: TaskId,
    ) -> Result<TaskInfo, KernelError> {
        let t = self.get_task(id)?;
        Ok(TaskInfo {
            priority: t.priority,
            state: t.state,
            delay_ticks: t.delay_ticks,
            slice: t.slice,
            suspend_count: t.suspend_count,
            stack_size: t.stack.len() * core::mem::size_of::<usize>(),
            stack_free: t.stack_free(),
        })
    }
}

/// Creates a task and schedules it. If the new task is more important than
/// the caller, the switch happens before this returns.
pub fn task_create(
    entry: TaskEntry,
    arg: *mut (),
    priority: Priority,
    stack: &'static mut [usize],
) -> Result<TaskId, KernelError> {
    sched::run_scheduler_op(|k| {
        k.task_create(entry, arg, priority, stack)
            .map(|id| (id, NextTask::Other))
    })
}

/// Sleeps the current task for `ticks` ticks.
pub fn task_delay(ticks: u32) {
    let _ = sched::run_scheduler_op(|k| {
        Ok::<_, KernelError>(((), k.task_delay(ticks)))
    });
}

/// Suspends a task (nested).
pub fn task_suspend(id: TaskId) -> Result<(), KernelError> {
    sched::run_scheduler_op(|k| k.task_suspend(id).map(|h| ((), h)))
}

/// Resumes a suspended task.
pub fn task_resume(id: TaskId) -> Result<(), KernelError> {
    sched::run_scheduler_op(|k| k.task_resume(id).map(|h| ((), h)))
}

/// Registers a cleanup callback to run when the task is deleted.
pub fn task_set_cleanup(
    id: TaskId,
    f: fn(*mut ()),
    arg: *mut (),
) -> Result<(), KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.task_set_cleanup(id, f, arg));
    arch::exit_critical(status);
    r
}

/// Asks a task to delete itself; the target observes this through
/// [`task_delete_requested`].
pub fn task_request_delete(id: TaskId) -> Result<(), KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.task_request_delete(id));
    arch::exit_critical(status);
    r
}

/// Checks whether someone asked the current task to delete itself.
pub fn task_delete_requested() -> bool {
    let status = arch::enter_critical();
    let r = with_kernel(|k| {
        let cur = k.current_index();
        k.task_ref(cur).delete_requested
    });
    arch::exit_critical(status);
    r
}

/// Deletes a task outright, running its cleanup callback.
pub fn task_force_delete(id: TaskId) -> Result<(), KernelError> {
    let status = arch::enter_critical();
    let out = match with_kernel(|k| k.task_force_delete(id)) {
        Ok((cleanup, hint)) => {
            if let Some((f, arg)) = cleanup {
                f(arg);
            }
            if hint == NextTask::Other && with_kernel(|k| k.reschedule()) {
                arch::pend_context_switch();
            }
            Ok(())
        }
        Err(e) => Err(e),
    };
    arch::exit_critical(status);
    out
}

/// Deletes the current task. Does not return; the pended switch carries
/// execution away once interrupts are re-enabled.
pub fn task_delete_self() -> ! {
    let status = arch::enter_critical();
    let cur = with_kernel(|k| TaskId(k.current_index()));
    let cleanup = match with_kernel(|k| k.task_force_delete(cur)) {
        Ok((cleanup, _)) => cleanup,
        Err(_) => None,
    };
    if let Some((f, arg)) = cleanup {
        f(arg);
    }
    if with_kernel(|k| k.reschedule()) {
        arch::pend_context_switch();
    }
    arch::exit_critical(status);
    loop {
        arch::wait_for_interrupt();
    }
}

/// Reports a task's scheduling state and stack usage.
pub fn task_info(id: TaskId) -> Result<TaskInfo, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.task_info(id));
    arch::exit_critical(status);
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::*;

    #[test]
    fn create_validates_arguments() {
        let mut k = Kernel::new();
        assert!(matches!(
            k.task_create(
                spin,
                core::ptr::null_mut(),
                Priority(config::PRIO_COUNT as u8),
                leak_stack(64),
            ),
            Err(KernelError::BadParam),
        ));
        assert!(matches!(
            k.task_create(
                spin,
                core::ptr::null_mut(),
                Priority(0),
                leak_stack(4),
            ),
            Err(KernelError::BadParam),
        ));
    }

    #[test]
    fn create_exhausts_slots() {
        let mut k = Kernel::new();
        for _ in 0..config::TASK_CAP {
            spawn(&mut k, 5);
        }
        assert!(matches!(
            k.task_create(
                spin,
                core::ptr::null_mut(),
                Priority(5),
                leak_stack(64),
            ),
            Err(KernelError::NoSlot),
        ));
    }

    #[test]
    fn delay_expires_after_exact_tick_count() {
        let mut k = Kernel::new();
        let idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 2);
        run(&mut k, a);

        assert_eq!(k.task_delay(3), NextTask::Other);
        block_switch(&mut k);
        assert_eq!(k.current, Some(idle.0));
        assert!(k.task_ref(a.0).state.contains(TaskState::DELAYED));

        simulate_tick(&mut k);
        simulate_tick(&mut k);
        assert_eq!(k.current, Some(idle.0), "two ticks are not enough");
        simulate_tick(&mut k);
        assert_eq!(k.current, Some(a.0), "third tick wakes and preempts");
        assert!(k.task_ref(a.0).state.is_empty());
    }

    #[test]
    fn delay_zero_is_a_no_op() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 2);
        run(&mut k, a);
        assert_eq!(k.task_delay(0), NextTask::Same);
        assert!(k.task_ref(a.0).is_ready());
    }

    #[test]
    fn suspend_nests_and_resume_reschedules() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 4);
        let b = spawn(&mut k, 9);
        run(&mut k, b);

        assert_eq!(k.task_suspend(a).unwrap(), NextTask::Same);
        assert_eq!(k.task_suspend(a).unwrap(), NextTask::Same);
        assert!(k.task_ref(a.0).state.contains(TaskState::SUSPENDED));
        assert!(!k.ready_map.get(4));

        assert_eq!(k.task_resume(a).unwrap(), NextTask::Same);
        assert!(
            k.task_ref(a.0).state.contains(TaskState::SUSPENDED),
            "still one suspend outstanding"
        );
        assert_eq!(k.task_resume(a).unwrap(), NextTask::Other);
        assert!(k.task_ref(a.0).is_ready());
    }

    #[test]
    fn suspend_leaves_delayed_tasks_alone() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 3);
        run(&mut k, a);
        let _ = k.task_delay(10);
        block_switch(&mut k);

        assert_eq!(k.task_suspend(a).unwrap(), NextTask::Same);
        assert_eq!(k.task_ref(a.0).suspend_count, 0);
        assert!(!k.task_ref(a.0).state.contains(TaskState::SUSPENDED));
    }

    #[test]
    fn force_delete_returns_cleanup_and_vacates_slot() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 6);
        fn cb(_: *mut ()) {}
        k.task_set_cleanup(a, cb, core::ptr::null_mut()).unwrap();

        let (cleanup, hint) = k.task_force_delete(a).unwrap();
        assert!(cleanup.is_some());
        assert_eq!(hint, NextTask::Same);
        assert!(k.tasks[usize::from(a.0)].is_none());
        assert!(!k.ready_map.get(6));
        assert!(k.get_task(a).is_err());
    }

    #[test]
    fn force_delete_pulls_task_out_of_delay_list() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 3);
        run(&mut k, a);
        let _ = k.task_delay(50);
        block_switch(&mut k);

        k.task_force_delete(a).unwrap();
        assert!(k.delayed.is_empty());
        // Ticking afterwards must not touch the vacated slot.
        simulate_tick(&mut k);
    }

    #[test]
    fn request_delete_is_observable_by_target() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 3);
        k.task_request_delete(a).unwrap();
        assert!(k.task_ref(a.0).delete_requested);
    }

    #[test]
    fn info_reports_stack_watermark() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 3);
        let info = k.task_info(a).unwrap();
        let word = core::mem::size_of::<usize>();
        assert_eq!(info.stack_size, 64 * word);
        // Creation writes only the initial frame at the stack top; the
        // sentinel below it is intact.
        assert!(info.stack_free <= info.stack_size);
        assert_eq!(info.stack_free, (64 - arch::FRAME_WORDS) * word);

        // Dirty the bottom of the stack; the watermark must drop to zero.
        k.task_mut(a.0).stack[0] = 0xdead;
        assert_eq!(k.task_info(a).unwrap().stack_free, 0);
    }
}
