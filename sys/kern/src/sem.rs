// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! A notify with waiters present hands the permit straight to the oldest
//! waiter -- the count never goes positive while somebody is queued. With
//! no waiters, the count accumulates up to `max` (0 = unbounded).

use abi::{KernelError, SemId, SemInfo};

use crate::arch;
use crate::event::{self, Event, EventKind, WaitOutcome};
use crate::sched::{self, Kernel};
use crate::startup::with_kernel;
use crate::task::NextTask;

enum Notify {
    Wake,
    Counted,
    Full,
}

impl Kernel {
    pub(crate) fn sem_create(
        &mut self,
        initial: u32,
        max: u32,
    ) -> Result<SemId, KernelError> {
        let count = if max > 0 { initial.min(max) } else { initial };
        self.event_alloc(EventKind::Sem { count, max }).map(SemId)
    }

    pub(crate) fn sem_wait(
        &mut self,
        id: SemId,
        timeout: u32,
    ) -> Result<WaitOutcome<()>, KernelError> {
        let ix = id.0;
        let took = match self
            .events
            .get_mut(usize::from(ix))
            .and_then(|s| s.as_mut())
        {
            Some(Event {
                kind: EventKind::Sem { count, .. },
                ..
            }) => {
                if *count > 0 {
                    *count -= 1;
                    true
                } else {
                    false
                }
            }
            _ => return Err(KernelError::BadHandle),
        };
        if took {
            Ok(WaitOutcome::Ready(()))
        } else {
            self.event_wait_on(ix, timeout);
            Ok(WaitOutcome::Blocked)
        }
    }

    pub(crate) fn sem_try_wait(
        &mut self,
        id: SemId,
    ) -> Result<(), KernelError> {
        match self
            .events
            .get_mut(usize::from(id.0))
            .and_then(|s| s.as_mut())
        {
            Some(Event {
                kind: EventKind::Sem { count, .. },
                ..
            }) => {
                if *count > 0 {
                    *count -= 1;
                    Ok(())
                } else {
                    Err(KernelError::Unavailable)
                }
            }
            _ => Err(KernelError::BadHandle),
        }
    }

    pub(crate) fn sem_notify(
        &mut self,
        id: SemId,
    ) -> Result<NextTask, KernelError> {
        let ix = id.0;
        let action = match self
            .events
            .get_mut(usize::from(ix))
            .and_then(|s| s.as_mut())
        {
            Some(Event {
                kind: EventKind::Sem { count, max },
                waiters,
            }) => {
                if !waiters.is_empty() {
                    Notify::Wake
                } else if *max == 0 || *count < *max {
                    *count += 1;
                    Notify::Counted
                } else {
                    Notify::Full
                }
            }
            _ => return Err(KernelError::BadHandle),
        };
        match action {
            Notify::Wake => {
                self.event_wake_head(ix, None, Ok(()));
                Ok(NextTask::Other)
            }
            Notify::Counted => Ok(NextTask::Same),
            Notify::Full => Err(KernelError::ResourceFull),
        }
    }

    pub(crate) fn sem_destroy(
        &mut self,
        id: SemId,
    ) -> Result<(u32, NextTask), KernelError> {
        let ix = id.0;
        match self
            .events
            .get(usize::from(ix))
            .and_then(|s| s.as_ref())
        {
            Some(Event {
                kind: EventKind::Sem { .. },
                ..
            }) => {}
            _ => return Err(KernelError::BadHandle),
        }
        let n = self.event_remove_all(ix, Err(KernelError::Deleted));
        self.event_free(ix);
        let hint = if n > 0 {
            NextTask::Other
        } else {
            NextTask::Same
        };
        Ok((n, hint))
    }

    pub(crate) fn sem_info(
        &mut self,
        id: SemId,
    ) -> Result<SemInfo, KernelError> {
        match self
            .events
            .get(usize::from(id.0))
            .and_then(|s| s.as_ref())
        {
            Some(Event {
                kind: EventKind::Sem { count, max },
                waiters,
            }) => Ok(SemInfo {
                count: *count,
                max: *max,
                waiters: waiters.len(),
            }),
            _ => Err(KernelError::BadHandle),
        }
    }
}

/// Creates a semaphore. The initial count is clamped to `max` when `max`
/// is nonzero.
pub fn sem_create(initial: u32, max: u32) -> Result<SemId, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.sem_create(initial, max));
    arch::exit_critical(status);
    r
}

/// Takes the semaphore, blocking up to `timeout` ticks (0 = forever).
pub fn sem_wait(id: SemId, timeout: u32) -> Result<(), KernelError> {
    let status = arch::enter_critical();
    let outcome = with_kernel(|k| {
        k.sem_wait(id, timeout).map(|o| {
            if matches!(o, WaitOutcome::Blocked) {
                let _ = k.reschedule();
            }
            o
        })
    });
    match outcome {
        Ok(WaitOutcome::Ready(())) => {
            arch::exit_critical(status);
            Ok(())
        }
        Ok(WaitOutcome::Blocked) => event::finish_blocking_wait(status),
        Err(e) => {
            arch::exit_critical(status);
            Err(e)
        }
    }
}

/// Non-blocking take. Safe from ISR context.
pub fn sem_try_wait(id: SemId) -> Result<(), KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.sem_try_wait(id));
    arch::exit_critical(status);
    r
}

/// Releases the semaphore: wakes the oldest waiter, or bumps the count.
/// Safe from ISR context.
pub fn sem_notify(id: SemId) -> Result<(), KernelError> {
    sched::run_scheduler_op(|k| k.sem_notify(id).map(|h| ((), h)))
}

/// Destroys the semaphore, waking every waiter with `Deleted`. Returns the
/// number of tasks woken.
pub fn sem_destroy(id: SemId) -> Result<u32, KernelError> {
    sched::run_scheduler_op(|k| k.sem_destroy(id))
}

pub fn sem_info(id: SemId) -> Result<SemInfo, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.sem_info(id));
    arch::exit_critical(status);
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::*;

    #[test]
    fn initial_count_is_clamped_to_max() {
        let mut k = Kernel::new();
        let s = k.sem_create(10, 3).unwrap();
        assert_eq!(k.sem_info(s).unwrap().count, 3);
    }

    #[test]
    fn wait_decrements_while_positive_then_blocks() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 5);
        run(&mut k, a);
        let s = k.sem_create(2, 0).unwrap();

        assert!(matches!(
            k.sem_wait(s, 0).unwrap(),
            WaitOutcome::Ready(())
        ));
        assert!(matches!(
            k.sem_wait(s, 0).unwrap(),
            WaitOutcome::Ready(())
        ));
        assert!(matches!(k.sem_wait(s, 0).unwrap(), WaitOutcome::Blocked));
        block_switch(&mut k);
        assert_eq!(k.sem_info(s).unwrap().waiters, 1);
    }

    #[test]
    fn notify_hands_permit_to_oldest_waiter() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 5);
        let b = spawn(&mut k, 5);
        let s = k.sem_create(0, 0).unwrap();

        for t in [a, b] {
            run(&mut k, t);
            let _ = k.sem_wait(s, 0).unwrap();
            block_switch(&mut k);
        }

        assert_eq!(k.sem_notify(s).unwrap(), NextTask::Other);
        assert!(k.task_ref(a.0).is_ready(), "FIFO: a first");
        assert!(!k.task_ref(b.0).is_ready());
        // Count stays at zero while the permit is being handed over.
        assert_eq!(k.sem_info(s).unwrap().count, 0);
    }

    #[test]
    fn notify_without_waiters_counts_up_to_max() {
        let mut k = Kernel::new();
        let s = k.sem_create(0, 2).unwrap();
        assert_eq!(k.sem_notify(s).unwrap(), NextTask::Same);
        assert_eq!(k.sem_notify(s).unwrap(), NextTask::Same);
        assert!(matches!(
            k.sem_notify(s),
            Err(KernelError::ResourceFull)
        ));
        assert_eq!(k.sem_info(s).unwrap().count, 2);
    }

    #[test]
    fn timed_wait_expires_with_timeout_and_leaves_no_trace() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 5);
        run(&mut k, a);
        let s = k.sem_create(0, 0).unwrap();

        assert!(matches!(
            k.sem_wait(s, 10).unwrap(),
            WaitOutcome::Blocked
        ));
        block_switch(&mut k);

        for _ in 0..9 {
            simulate_tick(&mut k);
            assert!(!k.task_ref(a.0).is_ready());
        }
        simulate_tick(&mut k);
        assert_eq!(k.current, Some(a.0), "resumes on the tenth tick");
        assert_eq!(
            k.task_ref(a.0).wait_result,
            Err(KernelError::Timeout)
        );
        assert_eq!(k.sem_info(s).unwrap().waiters, 0);
        assert!(k.delayed.is_empty());
    }

    #[test]
    fn try_wait_never_blocks() {
        let mut k = Kernel::new();
        let s = k.sem_create(1, 0).unwrap();
        assert!(k.sem_try_wait(s).is_ok());
        assert!(matches!(
            k.sem_try_wait(s),
            Err(KernelError::Unavailable)
        ));
    }

    #[test]
    fn destroy_wakes_all_with_deleted_and_frees_slot() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 5);
        let b = spawn(&mut k, 6);
        let s = k.sem_create(0, 0).unwrap();
        for t in [a, b] {
            run(&mut k, t);
            let _ = k.sem_wait(s, 0).unwrap();
            block_switch(&mut k);
        }

        let (n, hint) = k.sem_destroy(s).unwrap();
        assert_eq!(n, 2);
        assert_eq!(hint, NextTask::Other);
        for t in [a, b] {
            assert_eq!(
                k.task_ref(t.0).wait_result,
                Err(KernelError::Deleted)
            );
        }
        assert!(matches!(k.sem_info(s), Err(KernelError::BadHandle)));
    }
}
