// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recursive mutexes with priority inheritance.
//!
//! When a more important task contends for an owned mutex, the owner is
//! boosted to the contender's priority so it can finish and release.
//! Inheritance is a single hop: it follows one mutex, not chains of them.
//! The boost is rolled back when the recursion count reaches zero (or on
//! destroy), never on inner recursive unlocks.

use abi::{KernelError, MutexId, MutexInfo, Priority, TaskId};

use crate::arch;
use crate::event::{self, Event, EventKind, WaitOutcome};
use crate::sched::{self, Kernel};
use crate::startup::with_kernel;
use crate::task::NextTask;

enum Unlock {
    Retained,
    Release { base: Priority },
}

impl Kernel {
    fn check_mutex(&self, id: MutexId) -> Result<u16, KernelError> {
        match self.events.get(usize::from(id.0)).and_then(|s| s.as_ref()) {
            Some(Event {
                kind: EventKind::Mutex { .. },
                ..
            }) => Ok(id.0),
            _ => Err(KernelError::BadHandle),
        }
    }

    /// Borrows the mutex fields of slot `ix`, whose kind has already been
    /// checked.
    fn mutex_state(
        &mut self,
        ix: u16,
    ) -> (&mut Option<u16>, &mut u32, &mut Priority) {
        match &mut self.event_mut(ix).kind {
            EventKind::Mutex {
                owner,
                recursion,
                owner_base_prio,
            } => (owner, recursion, owner_base_prio),
            _ => panic!("mutex slot changed kind"),
        }
    }

    pub(crate) fn mutex_create(&mut self) -> Result<MutexId, KernelError> {
        self.event_alloc(EventKind::Mutex {
            owner: None,
            recursion: 0,
            owner_base_prio: Priority(0),
        })
        .map(MutexId)
    }

    pub(crate) fn mutex_lock(
        &mut self,
        id: MutexId,
        timeout: u32,
    ) -> Result<WaitOutcome<()>, KernelError> {
        let ix = self.check_mutex(id)?;
        let cur = self.current_index();
        let cur_prio = self.task_ref(cur).priority;

        let contended_with = {
            let (owner, recursion, base) = self.mutex_state(ix);
            match *owner {
                None => {
                    *owner = Some(cur);
                    *recursion = 1;
                    *base = cur_prio;
                    None
                }
                Some(o) if o == cur => {
                    *recursion += 1;
                    None
                }
                Some(o) => Some(o),
            }
        };

        match contended_with {
            None => Ok(WaitOutcome::Ready(())),
            Some(owner) => {
                let owner_prio = self.task_ref(owner).priority;
                if cur_prio.is_more_important_than(owner_prio) {
                    // Bound the inversion: lend the owner our priority
                    // until it releases.
                    self.set_priority(owner, cur_prio);
                }
                self.event_wait_on(ix, timeout);
                Ok(WaitOutcome::Blocked)
            }
        }
    }

    pub(crate) fn mutex_unlock(
        &mut self,
        id: MutexId,
    ) -> Result<NextTask, KernelError> {
        let ix = self.check_mutex(id)?;
        let cur = self.current_index();

        let action = {
            let (owner, recursion, base) = self.mutex_state(ix);
            if *owner != Some(cur) {
                return Err(KernelError::NotOwner);
            }
            *recursion -= 1;
            if *recursion > 0 {
                Unlock::Retained
            } else {
                Unlock::Release { base: *base }
            }
        };

        match action {
            Unlock::Retained => Ok(NextTask::Same),
            Unlock::Release { base } => {
                if self.task_ref(cur).priority != base {
                    self.set_priority(cur, base);
                }
                if let Some(w) = self.event_wake_head(ix, None, Ok(())) {
                    // Hand the mutex to the oldest waiter, re-basing the
                    // inheritance bookkeeping on its current priority.
                    let wprio = self.task_ref(w).priority;
                    let (owner, recursion, base) = self.mutex_state(ix);
                    *owner = Some(w);
                    *recursion = 1;
                    *base = wprio;
                    Ok(NextTask::Other)
                } else {
                    let (owner, _, _) = self.mutex_state(ix);
                    *owner = None;
                    Ok(NextTask::Same)
                }
            }
        }
    }

    pub(crate) fn mutex_destroy(
        &mut self,
        id: MutexId,
    ) -> Result<(u32, NextTask), KernelError> {
        let ix = self.check_mutex(id)?;
        let (owner, base) = {
            let (o, _, b) = self.mutex_state(ix);
            (*o, *b)
        };
        if let Some(o) = owner {
            if self.task_ref(o).priority != base {
                self.set_priority(o, base);
            }
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

    pub(crate) fn mutex_info(
        &mut self,
        id: MutexId,
    ) -> Result<MutexInfo, KernelError> {
        let ix = self.check_mutex(id)?;
        let waiters = self.event_waiters(ix);
        let (owner, recursion, base) = self.mutex_state(ix);
        Ok(MutexInfo {
            owner: owner.map(TaskId),
            recursion: *recursion,
            owner_base_priority: *base,
            waiters,
        })
    }
}

pub fn mutex_create() -> Result<MutexId, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.mutex_create());
    arch::exit_critical(status);
    r
}

/// Locks the mutex, blocking up to `timeout` ticks (0 = forever) if it is
/// held by another task. Recursive locking by the owner always succeeds
/// immediately.
pub fn mutex_lock(id: MutexId, timeout: u32) -> Result<(), KernelError> {
    let status = arch::enter_critical();
    let outcome = with_kernel(|k| {
        k.mutex_lock(id, timeout).map(|o| {
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

/// Unlocks the mutex. Must be called by the owner; the outermost unlock
/// ends priority inheritance and passes ownership to the oldest waiter.
pub fn mutex_unlock(id: MutexId) -> Result<(), KernelError> {
    sched::run_scheduler_op(|k| k.mutex_unlock(id).map(|h| ((), h)))
}

/// Destroys the mutex, restoring the owner's priority and waking every
/// waiter with `Deleted`. Returns the number of tasks woken.
pub fn mutex_destroy(id: MutexId) -> Result<u32, KernelError> {
    sched::run_scheduler_op(|k| k.mutex_destroy(id))
}

pub fn mutex_info(id: MutexId) -> Result<MutexInfo, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.mutex_info(id));
    arch::exit_critical(status);
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::*;

    #[test]
    fn recursion_locks_and_unlocks_symmetrically() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 5);
        run(&mut k, a);
        let m = k.mutex_create().unwrap();

        for _ in 0..3 {
            assert!(matches!(
                k.mutex_lock(m, 0).unwrap(),
                WaitOutcome::Ready(())
            ));
        }
        assert_eq!(k.mutex_info(m).unwrap().recursion, 3);

        assert_eq!(k.mutex_unlock(m).unwrap(), NextTask::Same);
        assert_eq!(k.mutex_unlock(m).unwrap(), NextTask::Same);
        assert_eq!(k.mutex_info(m).unwrap().recursion, 1);
        assert_eq!(k.mutex_unlock(m).unwrap(), NextTask::Same);
        assert_eq!(k.mutex_info(m).unwrap().owner, None);
        assert_eq!(k.task_ref(a.0).priority, Priority(5));
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 5);
        let b = spawn(&mut k, 6);
        let m = k.mutex_create().unwrap();

        run(&mut k, a);
        let _ = k.mutex_lock(m, 0).unwrap();
        run(&mut k, b);
        assert!(matches!(
            k.mutex_unlock(m),
            Err(KernelError::NotOwner)
        ));
    }

    #[test]
    fn contender_boosts_owner_and_unlock_restores() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let t1 = spawn(&mut k, 2);
        let t2 = spawn(&mut k, 5);
        let m = k.mutex_create().unwrap();

        // T2 (prio 5) takes the mutex.
        run(&mut k, t2);
        let _ = k.mutex_lock(m, 0).unwrap();

        // T1 (prio 2) contends: T2 inherits priority 2.
        run(&mut k, t1);
        assert!(matches!(
            k.mutex_lock(m, 0).unwrap(),
            WaitOutcome::Blocked
        ));
        block_switch(&mut k);
        assert_eq!(k.task_ref(t2.0).priority, Priority(2));
        assert_eq!(
            k.mutex_info(m).unwrap().owner_base_priority,
            Priority(5)
        );
        assert_eq!(k.current, Some(t2.0), "owner now outranks everyone");

        // T2 releases: its priority reverts, T1 takes over with its own
        // priority as the new base.
        assert_eq!(k.mutex_unlock(m).unwrap(), NextTask::Other);
        assert_eq!(k.task_ref(t2.0).priority, Priority(5));
        let info = k.mutex_info(m).unwrap();
        assert_eq!(info.owner, Some(t1));
        assert_eq!(info.owner_base_priority, Priority(2));
        assert!(k.task_ref(t1.0).is_ready());
    }

    #[test]
    fn less_important_contender_does_not_boost() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let hi = spawn(&mut k, 3);
        let lo = spawn(&mut k, 8);
        let m = k.mutex_create().unwrap();

        run(&mut k, hi);
        let _ = k.mutex_lock(m, 0).unwrap();
        run(&mut k, lo);
        let _ = k.mutex_lock(m, 0).unwrap();
        block_switch(&mut k);
        assert_eq!(k.task_ref(hi.0).priority, Priority(3));
    }

    #[test]
    fn boost_survives_inner_recursive_unlocks() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let hi = spawn(&mut k, 2);
        let lo = spawn(&mut k, 9);
        let m = k.mutex_create().unwrap();

        run(&mut k, lo);
        let _ = k.mutex_lock(m, 0).unwrap();
        let _ = k.mutex_lock(m, 0).unwrap(); // recursion 2

        run(&mut k, hi);
        let _ = k.mutex_lock(m, 0).unwrap();
        block_switch(&mut k);
        assert_eq!(k.task_ref(lo.0).priority, Priority(2));

        // Inner unlock: still owned, still boosted.
        assert_eq!(k.mutex_unlock(m).unwrap(), NextTask::Same);
        assert_eq!(k.task_ref(lo.0).priority, Priority(2));
        // Outer unlock: rollback + handoff.
        assert_eq!(k.mutex_unlock(m).unwrap(), NextTask::Other);
        assert_eq!(k.task_ref(lo.0).priority, Priority(9));
        assert_eq!(k.mutex_info(m).unwrap().owner, Some(hi));
    }

    #[test]
    fn destroy_restores_owner_and_wakes_waiters_deleted() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let t1 = spawn(&mut k, 2);
        let t2 = spawn(&mut k, 5);
        let m = k.mutex_create().unwrap();

        run(&mut k, t2);
        let _ = k.mutex_lock(m, 0).unwrap();
        run(&mut k, t1);
        let _ = k.mutex_lock(m, 0).unwrap();
        block_switch(&mut k);
        assert_eq!(k.task_ref(t2.0).priority, Priority(2));

        let (n, _) = k.mutex_destroy(m).unwrap();
        assert_eq!(n, 1);
        assert_eq!(k.task_ref(t2.0).priority, Priority(5));
        assert_eq!(
            k.task_ref(t1.0).wait_result,
            Err(KernelError::Deleted)
        );
        assert!(matches!(
            k.mutex_info(m),
            Err(KernelError::BadHandle)
        ));
    }
}
