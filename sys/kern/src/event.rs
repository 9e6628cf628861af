// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic wait-event primitive.
//!
//! Every blocking object is an [`Event`]: a FIFO queue of waiting tasks
//! plus a `kind` carrying the object's own state. The operations here move
//! tasks between the ready set and a wait queue and deliver wake-up results;
//! the object modules (`sem`, `mutex`, `mbox`, `flags`, `mempool`) decide
//! *when* to block and wake.
//!
//! Wait queues are strictly FIFO. The only ways out of a queue are: a waker
//! (head or specific task), the tick handler on timeout, object
//! destruction, and forced task deletion.

use abi::{KernelError, Message, TaskState};
use kerncore::List;

use crate::arch;
use crate::sched::Kernel;
use crate::startup::with_kernel;

/// A synchronization object slot.
pub(crate) struct Event {
    /// Tasks blocked on this object, oldest first. Linked through
    /// `Kernel::run_links`; a waiting task is never simultaneously ready.
    pub(crate) waiters: List,
    pub(crate) kind: EventKind,
}

/// Object-specific state. The discriminant doubles as the handle type
/// check: a `SemId` naming a `Mutex` slot is rejected with `BadHandle`.
pub(crate) enum EventKind {
    Sem {
        count: u32,
        /// 0 = unbounded.
        max: u32,
    },
    Mutex {
        owner: Option<u16>,
        recursion: u32,
        /// Owner's priority at lock time; restored when inheritance ends.
        owner_base_prio: abi::Priority,
    },
    Mbox {
        buf: &'static mut [Message],
        read: usize,
        write: usize,
        count: usize,
    },
    Flags {
        flags: u32,
    },
    Pool {
        /// Head of the free list threaded through the blocks; null = empty.
        free: *mut u8,
        free_count: usize,
        block_size: usize,
        block_count: usize,
    },
}

/// Outcome of the in-kernel half of a blocking operation: either the
/// condition held immediately, or the current task is now parked on the
/// wait queue and the caller must finish with a context switch.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub(crate) enum WaitOutcome<T> {
    Ready(T),
    Blocked,
}

impl Kernel {
    /// Claims a free object slot.
    pub(crate) fn event_alloc(
        &mut self,
        kind: EventKind,
    ) -> Result<u16, KernelError> {
        let slot = self
            .events
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::NoSlot)?;
        self.events[slot] = Some(Event {
            waiters: List::new(),
            kind,
        });
        Ok(slot as u16)
    }

    pub(crate) fn event_ref(&self, ix: u16) -> &Event {
        match self.events[usize::from(ix)].as_ref() {
            Some(e) => e,
            None => panic!("vacant event slot"),
        }
    }

    pub(crate) fn event_mut(&mut self, ix: u16) -> &mut Event {
        match self.events[usize::from(ix)].as_mut() {
            Some(e) => e,
            None => panic!("vacant event slot"),
        }
    }

    /// Releases an object slot. All waiters must have been drained first.
    pub(crate) fn event_free(&mut self, ix: u16) {
        uassert!(self.event_ref(ix).waiters.is_empty());
        self.events[usize::from(ix)] = None;
    }

    /// Parks the current task at the tail of `ev`'s wait queue, with an
    /// optional timeout in ticks (`0` = wait forever). The caller must
    /// follow up with a reschedule; this only rearranges the queues.
    pub(crate) fn event_wait_on(&mut self, ev: u16, timeout: u32) {
        let cur = self.current_index();
        self.sched_unready(cur);
        {
            let t = self.task_mut(cur);
            t.state |= TaskState::WAIT_EVENT;
            t.wait_event = Some(ev);
            t.wait_result = Ok(());
            t.wait_msg = None;
        }
        let slot = match self.events[usize::from(ev)].as_mut() {
            Some(s) => s,
            None => panic!("vacant event slot"),
        };
        slot.waiters.push_back(&mut self.run_links, cur);
        if timeout > 0 {
            self.delay_task(cur, timeout);
        }
    }

    /// Common tail of every wake path: clears the wait state, delivers the
    /// result (and message, if any), cancels a pending timeout, and makes
    /// the task ready. The task must already be off the wait queue.
    fn finish_wake(
        &mut self,
        ix: u16,
        msg: Option<Message>,
        result: Result<(), KernelError>,
    ) {
        let delayed = {
            let t = self.task_mut(ix);
            t.wait_event = None;
            t.state.remove(TaskState::WAIT_EVENT);
            t.wait_result = result;
            if msg.is_some() {
                t.wait_msg = msg;
            }
            t.state.contains(TaskState::DELAYED)
        };
        if delayed {
            self.undelay_task(ix);
        }
        self.sched_ready(ix);
    }

    /// Wakes the oldest waiter, if any, delivering `result` and `msg`.
    /// Returns the task index so callers (e.g. mutex ownership transfer)
    /// can act on it. The caller decides whether to reschedule.
    pub(crate) fn event_wake_head(
        &mut self,
        ev: u16,
        msg: Option<Message>,
        result: Result<(), KernelError>,
    ) -> Option<u16> {
        let ix = {
            let slot = self.events[usize::from(ev)].as_mut()?;
            slot.waiters.pop_front(&mut self.run_links)?
        };
        self.finish_wake(ix, msg, result);
        Some(ix)
    }

    /// Wakes one specific waiter, wherever it sits in its queue. Used by
    /// the flag-group notify walk, where matching is per-task.
    pub(crate) fn event_wake_task(
        &mut self,
        ix: u16,
        msg: Option<Message>,
        result: Result<(), KernelError>,
    ) {
        let ev = match self.task_ref(ix).wait_event {
            Some(ev) => ev,
            None => panic!("wake of non-waiting task"),
        };
        let slot = match self.events[usize::from(ev)].as_mut() {
            Some(s) => s,
            None => panic!("vacant event slot"),
        };
        slot.waiters.remove(&mut self.run_links, ix);
        self.finish_wake(ix, msg, result);
    }

    /// Drains the whole queue (object destruction), delivering `result` --
    /// conventionally `Err(Deleted)` -- to every waiter. Returns how many
    /// tasks were woken.
    pub(crate) fn event_remove_all(
        &mut self,
        ev: u16,
        result: Result<(), KernelError>,
    ) -> u32 {
        let mut n = 0;
        loop {
            let ix = {
                let slot = match self.events[usize::from(ev)].as_mut() {
                    Some(s) => s,
                    None => panic!("vacant event slot"),
                };
                slot.waiters.pop_front(&mut self.run_links)
            };
            match ix {
                Some(ix) => {
                    self.finish_wake(ix, None, result);
                    n += 1;
                }
                None => return n,
            }
        }
    }

    pub(crate) fn event_waiters(&self, ev: u16) -> usize {
        self.event_ref(ev).waiters.len()
    }

    /// Fetches (and resets) the wake-up result of the current task. Called
    /// by blocking wrappers right after the task resumes.
    pub(crate) fn take_wait_result(&mut self) -> Result<(), KernelError> {
        let cur = self.current_index();
        core::mem::replace(&mut self.task_mut(cur).wait_result, Ok(()))
    }

    /// Fetches the message delivered by the waker, if any.
    pub(crate) fn take_wait_msg(&mut self) -> Option<Message> {
        let cur = self.current_index();
        self.task_mut(cur).wait_msg.take()
    }
}

/// Second half of a blocking wrapper: the current task has been parked and
/// the scheduler pass run; pend the switch, open the critical section so it
/// takes effect, and collect the result once we run again.
pub(crate) fn finish_blocking_wait(status: u32) -> Result<(), KernelError> {
    arch::pend_context_switch();
    arch::exit_critical(status);
    // Execution resumes here once a waker or the tick handler readied us.
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.take_wait_result());
    arch::exit_critical(status);
    r
}

/// Like [`finish_blocking_wait`], for waits whose waker delivers a message
/// (mailbox receive, pool allocation).
pub(crate) fn finish_blocking_wait_msg(
    status: u32,
) -> Result<Message, KernelError> {
    arch::pend_context_switch();
    arch::exit_critical(status);
    let status = arch::enter_critical();
    let (res, msg) = with_kernel(|k| {
        let res = k.take_wait_result();
        let msg = k.take_wait_msg();
        (res, msg)
    });
    arch::exit_critical(status);
    match res {
        Ok(()) => match msg {
            Some(m) => Ok(m),
            None => panic!("wake without message"),
        },
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::*;

    fn sem_event(k: &mut Kernel) -> u16 {
        k.event_alloc(EventKind::Sem { count: 0, max: 0 }).unwrap()
    }

    #[test]
    fn waiters_wake_in_fifo_order() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 5);
        let b = spawn(&mut k, 5);
        let c = spawn(&mut k, 5);
        let ev = sem_event(&mut k);

        for t in [a, b, c] {
            run(&mut k, t);
            k.event_wait_on(ev, 0);
            block_switch(&mut k);
        }
        assert_eq!(k.event_waiters(ev), 3);

        assert_eq!(k.event_wake_head(ev, None, Ok(())), Some(a.0));
        assert_eq!(k.event_wake_head(ev, None, Ok(())), Some(b.0));
        assert_eq!(k.event_wake_head(ev, None, Ok(())), Some(c.0));
        assert_eq!(k.event_wake_head(ev, None, Ok(())), None);
    }

    #[test]
    fn wake_delivers_result_and_message() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 5);
        let ev = sem_event(&mut k);

        run(&mut k, a);
        k.event_wait_on(ev, 0);
        block_switch(&mut k);

        let msg = 0x1234 as Message;
        k.event_wake_task(a.0, Some(msg), Err(KernelError::Deleted));
        let t = k.task_ref(a.0);
        assert!(t.is_ready());
        assert_eq!(t.wait_result, Err(KernelError::Deleted));
        assert_eq!(t.wait_msg, Some(msg));
        assert_eq!(t.wait_event, None);
    }

    #[test]
    fn timed_wait_joins_both_queues_and_wake_cancels_timeout() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 5);
        let ev = sem_event(&mut k);

        run(&mut k, a);
        k.event_wait_on(ev, 25);
        block_switch(&mut k);
        assert!(k.task_ref(a.0).state.contains(TaskState::DELAYED));
        assert_eq!(k.delayed.len(), 1);

        k.event_wake_head(ev, None, Ok(()));
        assert!(k.delayed.is_empty(), "wake must cancel the timeout");
        assert!(k.task_ref(a.0).state.is_empty());
    }

    #[test]
    fn remove_all_counts_and_readies_everyone() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let tasks: Vec<_> = (0..3).map(|_| spawn(&mut k, 7)).collect();
        let ev = sem_event(&mut k);
        for t in &tasks {
            run(&mut k, *t);
            k.event_wait_on(ev, 0);
            block_switch(&mut k);
        }

        let n = k.event_remove_all(ev, Err(KernelError::Deleted));
        assert_eq!(n, 3);
        for t in &tasks {
            assert!(k.task_ref(t.0).is_ready());
            assert_eq!(
                k.task_ref(t.0).wait_result,
                Err(KernelError::Deleted)
            );
        }
        k.event_free(ev);
        assert!(k.events[usize::from(ev)].is_none());
    }
}
