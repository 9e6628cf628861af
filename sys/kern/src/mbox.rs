// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mailboxes: bounded FIFO queues of message pointers.
//!
//! The ring buffer is caller-supplied. A post with receivers waiting skips
//! the buffer entirely and delivers straight to the oldest waiter; urgent
//! posts cut the line by storing at the read side. Posting never blocks --
//! a full mailbox is an error, so the non-blocking half is safe from ISRs.

use abi::{KernelError, MboxId, MboxInfo, Message};

use crate::arch;
use crate::event::{self, Event, EventKind, WaitOutcome};
use crate::sched::{self, Kernel};
use crate::startup::with_kernel;
use crate::task::NextTask;

enum Post {
    Wake,
    Stored,
}

impl Kernel {
    fn check_mbox(&self, id: MboxId) -> Result<u16, KernelError> {
        match self.events.get(usize::from(id.0)).and_then(|s| s.as_ref()) {
            Some(Event {
                kind: EventKind::Mbox { .. },
                ..
            }) => Ok(id.0),
            _ => Err(KernelError::BadHandle),
        }
    }

    pub(crate) fn mbox_create(
        &mut self,
        buf: &'static mut [Message],
    ) -> Result<MboxId, KernelError> {
        if buf.is_empty() {
            return Err(KernelError::BadParam);
        }
        self.event_alloc(EventKind::Mbox {
            buf,
            read: 0,
            write: 0,
            count: 0,
        })
        .map(MboxId)
    }

    pub(crate) fn mbox_post(
        &mut self,
        id: MboxId,
        msg: Message,
        urgent: bool,
    ) -> Result<NextTask, KernelError> {
        let ix = self.check_mbox(id)?;
        let action = match self.events[usize::from(ix)].as_mut() {
            Some(Event {
                kind:
                    EventKind::Mbox {
                        buf,
                        read,
                        write,
                        count,
                    },
                waiters,
            }) => {
                if !waiters.is_empty() {
                    Post::Wake
                } else if *count == buf.len() {
                    return Err(KernelError::ResourceFull);
                } else {
                    if urgent {
                        // Store at the read side so this message is
                        // dequeued next.
                        *read = (*read + buf.len() - 1) % buf.len();
                        buf[*read] = msg;
                    } else {
                        buf[*write] = msg;
                        *write = (*write + 1) % buf.len();
                    }
                    *count += 1;
                    Post::Stored
                }
            }
            _ => panic!("mbox slot changed kind"),
        };
        match action {
            Post::Wake => {
                self.event_wake_head(ix, Some(msg), Ok(()));
                Ok(NextTask::Other)
            }
            Post::Stored => Ok(NextTask::Same),
        }
    }

    pub(crate) fn mbox_wait(
        &mut self,
        id: MboxId,
        timeout: u32,
    ) -> Result<WaitOutcome<Message>, KernelError> {
        let ix = self.check_mbox(id)?;
        match self.mbox_take(ix) {
            Some(msg) => Ok(WaitOutcome::Ready(msg)),
            None => {
                self.event_wait_on(ix, timeout);
                Ok(WaitOutcome::Blocked)
            }
        }
    }

    pub(crate) fn mbox_try_wait(
        &mut self,
        id: MboxId,
    ) -> Result<Message, KernelError> {
        let ix = self.check_mbox(id)?;
        self.mbox_take(ix).ok_or(KernelError::Unavailable)
    }

    /// Dequeues the oldest buffered message, if any.
    fn mbox_take(&mut self, ix: u16) -> Option<Message> {
        match self.events[usize::from(ix)].as_mut() {
            Some(Event {
                kind:
                    EventKind::Mbox {
                        buf, read, count, ..
                    },
                ..
            }) => {
                if *count == 0 {
                    None
                } else {
                    let msg = buf[*read];
                    *read = (*read + 1) % buf.len();
                    *count -= 1;
                    Some(msg)
                }
            }
            _ => panic!("mbox slot changed kind"),
        }
    }

    /// Discards all buffered messages. With receivers waiting the buffer is
    /// necessarily empty already, so this is a no-op then.
    pub(crate) fn mbox_flush(
        &mut self,
        id: MboxId,
    ) -> Result<(), KernelError> {
        let ix = self.check_mbox(id)?;
        match self.events[usize::from(ix)].as_mut() {
            Some(Event {
                kind:
                    EventKind::Mbox {
                        read,
                        write,
                        count,
                        ..
                    },
                waiters,
            }) => {
                if waiters.is_empty() {
                    *read = 0;
                    *write = 0;
                    *count = 0;
                }
                Ok(())
            }
            _ => panic!("mbox slot changed kind"),
        }
    }

    pub(crate) fn mbox_destroy(
        &mut self,
        id: MboxId,
    ) -> Result<(u32, NextTask), KernelError> {
        let ix = self.check_mbox(id)?;
        let n = self.event_remove_all(ix, Err(KernelError::Deleted));
        self.event_free(ix);
        let hint = if n > 0 {
            NextTask::Other
        } else {
            NextTask::Same
        };
        Ok((n, hint))
    }

    pub(crate) fn mbox_info(
        &mut self,
        id: MboxId,
    ) -> Result<MboxInfo, KernelError> {
        let ix = self.check_mbox(id)?;
        match self.events[usize::from(ix)].as_ref() {
            Some(Event {
                kind: EventKind::Mbox { buf, count, .. },
                waiters,
            }) => Ok(MboxInfo {
                count: *count,
                capacity: buf.len(),
                waiters: waiters.len(),
            }),
            _ => panic!("mbox slot changed kind"),
        }
    }
}

/// Creates a mailbox over a caller-supplied message buffer.
pub fn mbox_create(
    buf: &'static mut [Message],
) -> Result<MboxId, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.mbox_create(buf));
    arch::exit_critical(status);
    r
}

/// Posts a message at the tail. Wakes the oldest receiver directly if one
/// is waiting. Never blocks; a full mailbox is `ResourceFull`. Safe from
/// ISR context.
pub fn mbox_post(id: MboxId, msg: Message) -> Result<(), KernelError> {
    sched::run_scheduler_op(|k| k.mbox_post(id, msg, false).map(|h| ((), h)))
}

/// Posts an urgent message at the head: it will be received before
/// anything already buffered. Otherwise like [`mbox_post`].
pub fn mbox_post_urgent(id: MboxId, msg: Message) -> Result<(), KernelError> {
    sched::run_scheduler_op(|k| k.mbox_post(id, msg, true).map(|h| ((), h)))
}

/// Receives the oldest message, blocking up to `timeout` ticks (0 =
/// forever) if the mailbox is empty.
pub fn mbox_wait(id: MboxId, timeout: u32) -> Result<Message, KernelError> {
    let status = arch::enter_critical();
    let outcome = with_kernel(|k| {
        k.mbox_wait(id, timeout).map(|o| {
            if matches!(o, WaitOutcome::Blocked) {
                let _ = k.reschedule();
            }
            o
        })
    });
    match outcome {
        Ok(WaitOutcome::Ready(msg)) => {
            arch::exit_critical(status);
            Ok(msg)
        }
        Ok(WaitOutcome::Blocked) => event::finish_blocking_wait_msg(status),
        Err(e) => {
            arch::exit_critical(status);
            Err(e)
        }
    }
}

/// Non-blocking receive. Safe from ISR context.
pub fn mbox_try_wait(id: MboxId) -> Result<Message, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.mbox_try_wait(id));
    arch::exit_critical(status);
    r
}

/// Discards buffered messages.
pub fn mbox_flush(id: MboxId) -> Result<(), KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.mbox_flush(id));
    arch::exit_critical(status);
    r
}

/// Destroys the mailbox, waking every waiter with `Deleted`. Returns the
/// number of tasks woken.
pub fn mbox_destroy(id: MboxId) -> Result<u32, KernelError> {
    sched::run_scheduler_op(|k| k.mbox_destroy(id))
}

pub fn mbox_info(id: MboxId) -> Result<MboxInfo, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.mbox_info(id));
    arch::exit_critical(status);
    r
}
