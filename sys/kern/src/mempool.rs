// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-block memory pools with blocking allocation.
//!
//! The free list is threaded through the blocks themselves: the first word
//! of each free block holds the address of the next. That costs no
//! metadata storage, which is the point of a pool on a small target, but
//! it means block contents are clobbered while free. Returning a pointer
//! that did not come from the pool is undefined behavior the kernel does
//! not attempt to detect.

use abi::{KernelError, Message, PoolId, PoolInfo};

use crate::arch;
use crate::event::{self, Event, EventKind, WaitOutcome};
use crate::sched::{self, Kernel};
use crate::startup::with_kernel;
use crate::task::NextTask;

enum Free {
    Wake,
    Pushed,
}

impl Kernel {
    fn check_pool(&self, id: PoolId) -> Result<u16, KernelError> {
        match self.events.get(usize::from(id.0)).and_then(|s| s.as_ref()) {
            Some(Event {
                kind: EventKind::Pool { .. },
                ..
            }) => Ok(id.0),
            _ => Err(KernelError::BadHandle),
        }
    }

    /// Carves `storage` into `storage.len() / block_size` blocks and
    /// threads the free list through them. The storage must be word
    /// aligned and the block size a word multiple of at least one word, so
    /// every block can hold a link pointer.
    pub(crate) fn pool_create(
        &mut self,
        storage: &'static mut [u8],
        block_size: usize,
    ) -> Result<PoolId, KernelError> {
        let word = core::mem::size_of::<usize>();
        let align = core::mem::align_of::<usize>();
        if block_size < word
            || block_size % align != 0
            || (storage.as_ptr() as usize) % align != 0
        {
            return Err(KernelError::BadParam);
        }
        let block_count = storage.len() / block_size;
        if block_count == 0 {
            return Err(KernelError::BadParam);
        }

        let base = storage.as_mut_ptr();
        let mut head: *mut u8 = core::ptr::null_mut();
        for i in (0..block_count).rev() {
            // Safety: i < block_count, so the block's first word lies
            // within `storage`, and the alignment checks above make the
            // pointer-sized write aligned.
            unsafe {
                let b = base.add(i * block_size);
                b.cast::<*mut u8>().write(head);
                head = b;
            }
        }

        self.event_alloc(EventKind::Pool {
            free: head,
            free_count: block_count,
            block_size,
            block_count,
        })
        .map(PoolId)
    }

    /// Pops the free-list head, if any.
    fn pool_take(&mut self, ix: u16) -> Option<*mut u8> {
        match &mut self.event_mut(ix).kind {
            EventKind::Pool {
                free, free_count, ..
            } => {
                if free.is_null() {
                    None
                } else {
                    let b = *free;
                    // Safety: `b` is a block the pool threaded (or was
                    // handed back by `pool_free`); its first word is the
                    // next-free link.
                    *free = unsafe { b.cast::<*mut u8>().read() };
                    *free_count -= 1;
                    Some(b)
                }
            }
            _ => panic!("pool slot changed kind"),
        }
    }

    pub(crate) fn pool_alloc(
        &mut self,
        id: PoolId,
        timeout: u32,
    ) -> Result<WaitOutcome<*mut u8>, KernelError> {
        let ix = self.check_pool(id)?;
        match self.pool_take(ix) {
            Some(b) => Ok(WaitOutcome::Ready(b)),
            None => {
                self.event_wait_on(ix, timeout);
                Ok(WaitOutcome::Blocked)
            }
        }
    }

    pub(crate) fn pool_try_alloc(
        &mut self,
        id: PoolId,
    ) -> Result<*mut u8, KernelError> {
        let ix = self.check_pool(id)?;
        self.pool_take(ix).ok_or(KernelError::Unavailable)
    }

    /// Returns a block: straight to the oldest waiter if there is one,
    /// onto the free list otherwise.
    pub(crate) fn pool_free(
        &mut self,
        id: PoolId,
        block: *mut u8,
    ) -> Result<NextTask, KernelError> {
        let ix = self.check_pool(id)?;
        let action = match self.events[usize::from(ix)].as_mut() {
            Some(Event {
                kind:
                    EventKind::Pool {
                        free,
                        free_count,
                        block_count,
                        ..
                    },
                waiters,
            }) => {
                if !waiters.is_empty() {
                    Free::Wake
                } else if *free_count == *block_count {
                    return Err(KernelError::ResourceFull);
                } else {
                    // Safety: caller contract -- `block` came from this
                    // pool, so it is writable and word aligned.
                    unsafe {
                        block.cast::<*mut u8>().write(*free);
                    }
                    *free = block;
                    *free_count += 1;
                    Free::Pushed
                }
            }
            _ => panic!("pool slot changed kind"),
        };
        match action {
            Free::Wake => {
                self.event_wake_head(ix, Some(block as Message), Ok(()));
                Ok(NextTask::Other)
            }
            Free::Pushed => Ok(NextTask::Same),
        }
    }

    pub(crate) fn pool_destroy(
        &mut self,
        id: PoolId,
    ) -> Result<(u32, NextTask), KernelError> {
        let ix = self.check_pool(id)?;
        let n = self.event_remove_all(ix, Err(KernelError::Deleted));
        self.event_free(ix);
        let hint = if n > 0 {
            NextTask::Other
        } else {
            NextTask::Same
        };
        Ok((n, hint))
    }

    pub(crate) fn pool_info(
        &mut self,
        id: PoolId,
    ) -> Result<PoolInfo, KernelError> {
        let ix = self.check_pool(id)?;
        match self.events[usize::from(ix)].as_ref() {
            Some(Event {
                kind:
                    EventKind::Pool {
                        free_count,
                        block_size,
                        block_count,
                        ..
                    },
                waiters,
            }) => Ok(PoolInfo {
                block_size: *block_size,
                block_count: *block_count,
                free_count: *free_count,
                waiters: waiters.len(),
            }),
            _ => panic!("pool slot changed kind"),
        }
    }
}

/// Creates a pool over caller-supplied storage. The storage must be word
/// aligned; `block_size` must be a word multiple of at least one word.
pub fn pool_create(
    storage: &'static mut [u8],
    block_size: usize,
) -> Result<PoolId, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.pool_create(storage, block_size));
    arch::exit_critical(status);
    r
}

/// Allocates a block, blocking up to `timeout` ticks (0 = forever) while
/// the pool is exhausted.
pub fn pool_alloc(id: PoolId, timeout: u32) -> Result<*mut u8, KernelError> {
    let status = arch::enter_critical();
    let outcome = with_kernel(|k| {
        k.pool_alloc(id, timeout).map(|o| {
            if matches!(o, WaitOutcome::Blocked) {
                let _ = k.reschedule();
            }
            o
        })
    });
    match outcome {
        Ok(WaitOutcome::Ready(b)) => {
            arch::exit_critical(status);
            Ok(b)
        }
        Ok(WaitOutcome::Blocked) => {
            event::finish_blocking_wait_msg(status).map(|m| m as *mut u8)
        }
        Err(e) => {
            arch::exit_critical(status);
            Err(e)
        }
    }
}

/// Non-blocking allocation. Safe from ISR context.
pub fn pool_try_alloc(id: PoolId) -> Result<*mut u8, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.pool_try_alloc(id));
    arch::exit_critical(status);
    r
}

/// Returns a block to the pool, or hands it directly to the oldest waiting
/// allocator. Safe from ISR context.
pub fn pool_free(id: PoolId, block: *mut u8) -> Result<(), KernelError> {
    sched::run_scheduler_op(|k| k.pool_free(id, block).map(|h| ((), h)))
}

/// Destroys the pool, waking every waiter with `Deleted`. Returns the
/// number of tasks woken.
pub fn pool_destroy(id: PoolId) -> Result<u32, KernelError> {
    sched::run_scheduler_op(|k| k.pool_destroy(id))
}

pub fn pool_info(id: PoolId) -> Result<PoolInfo, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.pool_info(id));
    arch::exit_critical(status);
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::*;

    /// Word-aligned backing storage (a plain `Box<[u8]>` only guarantees
    /// byte alignment).
    fn storage(words: usize) -> &'static mut [u8] {
        let s = Box::leak(vec![0usize; words].into_boxed_slice());
        let len = s.len() * core::mem::size_of::<usize>();
        unsafe {
            core::slice::from_raw_parts_mut(s.as_mut_ptr().cast::<u8>(), len)
        }
    }

    const WORD: usize = core::mem::size_of::<usize>();

    #[test]
    fn create_validates_geometry() {
        let mut k = Kernel::new();
        assert!(matches!(
            k.pool_create(storage(8), WORD - 1),
            Err(KernelError::BadParam)
        ));
        assert!(matches!(
            k.pool_create(storage(1), 4 * WORD),
            Err(KernelError::BadParam)
        ));
    }

    #[test]
    fn blocks_are_distinct_and_recyclable() {
        let mut k = Kernel::new();
        let p = k.pool_create(storage(8), 2 * WORD).unwrap();
        assert_eq!(k.pool_info(p).unwrap().block_count, 4);

        let mut blocks = Vec::new();
        for _ in 0..4 {
            blocks.push(k.pool_try_alloc(p).unwrap());
        }
        assert!(matches!(
            k.pool_try_alloc(p),
            Err(KernelError::Unavailable)
        ));
        blocks.sort();
        blocks.dedup();
        assert_eq!(blocks.len(), 4, "blocks must not alias");

        for b in &blocks {
            assert_eq!(k.pool_free(p, *b).unwrap(), NextTask::Same);
        }
        assert_eq!(k.pool_info(p).unwrap().free_count, 4);
        assert!(matches!(
            k.pool_free(p, blocks[0]),
            Err(KernelError::ResourceFull)
        ));
    }

    #[test]
    fn exhausted_pool_blocks_and_free_hands_over_directly() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 5);
        let p = k.pool_create(storage(2), 2 * WORD).unwrap();

        let b0 = k.pool_try_alloc(p).unwrap();
        run(&mut k, a);
        assert!(matches!(
            k.pool_alloc(p, 0).unwrap(),
            WaitOutcome::Blocked
        ));
        block_switch(&mut k);

        assert_eq!(k.pool_free(p, b0).unwrap(), NextTask::Other);
        assert!(k.task_ref(a.0).is_ready());
        assert_eq!(k.task_ref(a.0).wait_msg, Some(b0 as Message));
        assert_eq!(
            k.pool_info(p).unwrap().free_count,
            0,
            "handed over, never on the free list"
        );
    }

    #[test]
    fn destroy_wakes_waiting_allocators() {
        let mut k = Kernel::new();
        let _idle = spawn(&mut k, 31);
        let a = spawn(&mut k, 5);
        let p = k.pool_create(storage(2), 2 * WORD).unwrap();
        let _b = k.pool_try_alloc(p).unwrap();

        run(&mut k, a);
        let _ = k.pool_alloc(p, 0).unwrap();
        block_switch(&mut k);

        let (n, _) = k.pool_destroy(p).unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            k.task_ref(a.0).wait_result,
            Err(KernelError::Deleted)
        );
    }
}
