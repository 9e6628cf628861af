// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event flag groups: a 32-bit flag word with set/clear, any/all wait
//! semantics.
//!
//! Each waiter carries its own predicate (mode + mask + consume). A notify
//! re-evaluates waiters in FIFO order against the updated word, and a
//! matching waiter with `consume` set changes the word *before* later
//! waiters are evaluated -- so one notification can satisfy some waiters
//! and starve others, by design of the queue discipline.

use abi::{FlagsId, FlagsInfo, FlagsMode, KernelError};
use kerncore::List;

use crate::arch;
use crate::event::{Event, EventKind, WaitOutcome};
use crate::sched::{self, Kernel};
use crate::startup::with_kernel;
use crate::task::NextTask;

/// Wait predicate stored on a task while it is queued on a flag group.
/// `matched` is filled in by the waker.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FlagWait {
    pub(crate) mode: FlagsMode,
    pub(crate) consume: bool,
    pub(crate) mask: u32,
    pub(crate) matched: u32,
}

/// Evaluates a predicate against `flags`. On a match, returns the matched
/// bits and, if `consume` is set, removes them from (SET modes) or adds
/// them to (CLEAR modes) the word.
fn flags_check(
    flags: &mut u32,
    mode: FlagsMode,
    consume: bool,
    mask: u32,
) -> Option<u32> {
    let (set, all) = match mode {
        FlagsMode::SetAll => (true, true),
        FlagsMode::SetAny => (true, false),
        FlagsMode::ClearAll => (false, true),
        FlagsMode::ClearAny => (false, false),
    };
    let calc = if set { *flags & mask } else { !*flags & mask };
    let satisfied = if all { calc == mask } else { calc != 0 };
    if !satisfied {
        return None;
    }
    if consume {
        if set {
            *flags &= !calc;
        } else {
            *flags |= calc;
        }
    }
    Some(calc)
}

impl Kernel {
    fn check_flags(&self, id: FlagsId) -> Result<u16, KernelError> {
        match self.events.get(usize::from(id.0)).and_then(|s| s.as_ref()) {
            Some(Event {
                kind: EventKind::Flags { .. },
                ..
            }) => Ok(id.0),
            _ => Err(KernelError::BadHandle),
        }
    }

    /// Borrows the flag word of slot `ix`, whose kind has been checked.
    fn flags_word(&mut self, ix: u16) -> &mut u32 {
        match &mut self.event_mut(ix).kind {
            EventKind::Flags { flags } => flags,
            _ => panic!("flag slot changed kind"),
        }
    }

    pub(crate) fn flags_create(
        &mut self,
        initial: u32,
    ) -> Result<FlagsId, KernelError> {
        self.event_alloc(EventKind::Flags { flags: initial })
            .map(FlagsId)
    }

    pub(crate) fn flags_wait(
        &mut self,
        id: FlagsId,
        mode: FlagsMode,
        consume: bool,
        mask: u32,
        timeout: u32,
    ) -> Result<WaitOutcome<u32>, KernelError> {
        let ix = self.check_flags(id)?;
        if let Some(m) = flags_check(self.flags_word(ix), mode, consume, mask)
        {
            return Ok(WaitOutcome::Ready(m));
        }
        let cur = self.current_index();
        self.task_mut(cur).flag_wait = Some(FlagWait {
            mode,
            consume,
            mask,
            matched: 0,
        });
        self.event_wait_on(ix, timeout);
        Ok(WaitOutcome::Blocked)
    }

    pub(crate) fn flags_poll(
        &mut self,
        id: FlagsId,
        mode: FlagsMode,
        consume: bool,
        mask: u32,
    ) -> Result<u32, KernelError> {
        let ix = self.check_flags(id)?;
        flags_check(self.flags_word(ix), mode, consume, mask)
            .ok_or(KernelError::Unavailable)
    }

    /// Applies `bits` to the word (`set` chooses OR vs. AND-NOT) and walks
    /// the wait queue, waking every waiter whose predicate now holds.
    /// Consumption is applied between waiters, in queue order.
    pub(crate) fn flags_notify(
        &mut self,
        id: FlagsId,
        set: bool,
        bits: u32,
    ) -> Result<NextTask, KernelError> {
        let ix = self.check_flags(id)?;
        let mut val = {
            let w = self.flags_word(ix);
            if set {
                *w |= bits;
            } else {
                *w &= !bits;
            }
            *w
        };

        let mut hint = NextTask::Same;
        let mut cursor = self.event_ref(ix).waiters.first();
        while let Some(t) = cursor {
            cursor = List::next(&self.run_links, t);
            let fw = self.task_ref(t).flag_wait;
            if let Some(fw) = fw {
                if let Some(m) =
                    flags_check(&mut val, fw.mode, fw.consume, fw.mask)
                {
                    self.task_mut(t).flag_wait =
                        Some(FlagWait { matched: m, ..fw });
                    self.event_wake_task(t, None, Ok(()));
                    hint = hint.combine(NextTask::Other);
                }
            }
        }

        *self.flags_word(ix) = val;
        Ok(hint)
    }

    pub(crate) fn flags_destroy(
        &mut self,
        id: FlagsId,
    ) -> Result<(u32, NextTask), KernelError> {
        let ix = self.check_flags(id)?;
        let n = self.event_remove_all(ix, Err(KernelError::Deleted));
        self.event_free(ix);
        let hint = if n > 0 {
            NextTask::Other
        } else {
            NextTask::Same
        };
        Ok((n, hint))
    }

    pub(crate) fn flags_info(
        &mut self,
        id: FlagsId,
    ) -> Result<FlagsInfo, KernelError> {
        let ix = self.check_flags(id)?;
        let waiters = self.event_waiters(ix);
        Ok(FlagsInfo {
            flags: *self.flags_word(ix),
            waiters,
        })
    }

    /// Fetches the outcome of a flag wait for the resumed current task:
    /// the matched bits on success, the waker's error otherwise.
    pub(crate) fn take_flag_wait_result(
        &mut self,
    ) -> Result<u32, KernelError> {
        let cur = self.current_index();
        let t = self.task_mut(cur);
        let res = core::mem::replace(&mut t.wait_result, Ok(()));
        let fw = t.flag_wait.take();
        match res {
            Ok(()) => Ok(fw.map(|f| f.matched).unwrap_or(0)),
            Err(e) => Err(e),
        }
    }
}

/// Creates a flag group with the given initial word.
pub fn flags_create(initial: u32) -> Result<FlagsId, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.flags_create(initial));
    arch::exit_critical(status);
    r
}

/// Waits until the predicate over `mask` holds, blocking up to `timeout`
/// ticks (0 = forever). Returns the matched bits. With `consume`, the
/// matched bits are cleared (SET modes) or set (CLEAR modes) on success.
pub fn flags_wait(
    id: FlagsId,
    mode: FlagsMode,
    consume: bool,
    mask: u32,
    timeout: u32,
) -> Result<u32, KernelError> {
    let status = arch::enter_critical();
    let outcome = with_kernel(|k| {
        k.flags_wait(id, mode, consume, mask, timeout).map(|o| {
            if matches!(o, WaitOutcome::Blocked) {
                let _ = k.reschedule();
            }
            o
        })
    });
    match outcome {
        Ok(WaitOutcome::Ready(m)) => {
            arch::exit_critical(status);
            Ok(m)
        }
        Ok(WaitOutcome::Blocked) => {
            arch::pend_context_switch();
            arch::exit_critical(status);
            let status = arch::enter_critical();
            let r = with_kernel(|k| k.take_flag_wait_result());
            arch::exit_critical(status);
            r
        }
        Err(e) => {
            arch::exit_critical(status);
            Err(e)
        }
    }
}

/// Non-blocking predicate check. Safe from ISR context.
pub fn flags_poll(
    id: FlagsId,
    mode: FlagsMode,
    consume: bool,
    mask: u32,
) -> Result<u32, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.flags_poll(id, mode, consume, mask));
    arch::exit_critical(status);
    r
}

/// Sets bits in the group, waking satisfied waiters. Safe from ISR context.
pub fn flags_set(id: FlagsId, bits: u32) -> Result<(), KernelError> {
    sched::run_scheduler_op(|k| k.flags_notify(id, true, bits).map(|h| ((), h)))
}

/// Clears bits in the group, waking satisfied waiters. Safe from ISR
/// context.
pub fn flags_clear(id: FlagsId, bits: u32) -> Result<(), KernelError> {
    sched::run_scheduler_op(|k| {
        k.flags_notify(id, false, bits).map(|h| ((), h))
    })
}

/// Destroys the group, waking every waiter with `Deleted`. Returns the
/// number of tasks woken.
pub fn flags_destroy(id: FlagsId) -> Result<u32, KernelError> {
    sched::run_scheduler_op(|k| k.flags_destroy(id))
}

pub fn flags_info(id: FlagsId) -> Result<FlagsInfo, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.flags_info(id));
    arch::exit_critical(status);
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::*;

    #[test]
    fn check_covers_all_modes() {
        let mut f = 0b1010;
        assert_eq!(
            flags_check(&mut f, FlagsMode::SetAll, false, 0b1010),
            Some(0b1010)
        );
        assert_eq!(flags_check(&mut f, FlagsMode::SetAll, false, 0b1011), None);
        assert_eq!(
            flags_check(&mut f, FlagsMode::SetAny, false, 0b0011),
            Some(0b0010)
        );
        assert_eq!(
            flags_check(&mut f, FlagsMode::ClearAll, false, 0b0101),
            Some(0b0101)
        );
        assert_eq!(
            flags_check(&mut f, FlagsMode::ClearAny, false, 0b1100),
            Some(0b0100)
        );
        assert_eq!(
            flags_check(&mut f, FlagsMode::ClearAny, false, 0b1000),
            None
        );
    }

    #[test]
    fn consume_clears_set_matches_and_sets_clear_matches() {
        let mut f = 0b1110;
        assert_eq!(
            flags_check(&mut f, FlagsMode::SetAny, true, 0b0110),
            Some(0b0110)
        );
        assert_eq!(f, 0b1000);
        assert_eq!(
            flags_check(&mut f, FlagsMode::ClearAll, true, 0b0011),
            Some(0b0011)
        );
        assert_eq!(f, 0b1011);
    }

    #[test]
    fn satisfied_wait_returns_immediately() {
        let mut k = Kernel::new();
        let g = k.flags_create(0b0001).unwrap();
        match k
            .flags_wait(g, FlagsMode::SetAny, true, 0b0011, 0)
            .unwrap()
        {
            WaitOutcome::Ready(m) => assert_eq!(m, 0b0001),
            WaitOutcome::Blocked => panic!("should not block"),
        }
        assert_eq!(k.flags_info(g).unwrap().flags, 0, "consumed");
    }

    #[test]
    fn set_wakes_matching_waiter_with_result_bits() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 5);
        let g = k.flags_create(0).unwrap();

        run(&mut k, a);
        assert!(matches!(
            k.flags_wait(g, FlagsMode::SetAll, false, 0b11, 0).unwrap(),
            WaitOutcome::Blocked
        ));
        block_switch(&mut k);

        // Partial set: predicate still unsatisfied.
        assert_eq!(k.flags_notify(g, true, 0b01).unwrap(), NextTask::Same);
        assert!(!k.task_ref(a.0).is_ready());

        assert_eq!(k.flags_notify(g, true, 0b10).unwrap(), NextTask::Other);
        assert!(k.task_ref(a.0).is_ready());
        run(&mut k, a);
        assert_eq!(k.take_flag_wait_result().unwrap(), 0b11);
    }

    #[test]
    fn earlier_waiter_consumes_bits_from_later_one() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let first = spawn(&mut k, 5);
        let second = spawn(&mut k, 5);
        let g = k.flags_create(0).unwrap();

        for t in [first, second] {
            run(&mut k, t);
            let _ = k
                .flags_wait(g, FlagsMode::SetAny, true, 0b1, 0)
                .unwrap();
            block_switch(&mut k);
        }

        let _ = k.flags_notify(g, true, 0b1).unwrap();
        assert!(k.task_ref(first.0).is_ready(), "FIFO head satisfied");
        assert!(
            !k.task_ref(second.0).is_ready(),
            "bit was consumed before the second waiter was evaluated"
        );
        assert_eq!(k.flags_info(g).unwrap().flags, 0);
        assert_eq!(k.flags_info(g).unwrap().waiters, 1);
    }

    #[test]
    fn poll_does_not_block() {
        let mut k = Kernel::new();
        let g = k.flags_create(0).unwrap();
        assert!(matches!(
            k.flags_poll(g, FlagsMode::SetAny, false, 0b1),
            Err(KernelError::Unavailable)
        ));
    }

    #[test]
    fn destroy_wakes_all_with_deleted() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let tasks: Vec<_> = (0..3).map(|_| spawn(&mut k, 7)).collect();
        let g = k.flags_create(0).unwrap();
        for t in &tasks {
            run(&mut k, *t);
            let _ = k
                .flags_wait(g, FlagsMode::SetAll, false, 0b100, 0)
                .unwrap();
            block_switch(&mut k);
        }

        let (n, _) = k.flags_destroy(g).unwrap();
        assert_eq!(n, 3);
        for t in &tasks {
            run(&mut k, *t);
            assert_eq!(
                k.take_flag_wait_result(),
                Err(KernelError::Deleted)
            );
        }
    }
}
