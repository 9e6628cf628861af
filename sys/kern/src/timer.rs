// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hard and soft timers.
//!
//! Hard timers live on a list scanned by the tick handler inside the
//! kernel critical section; their callbacks run in ISR context and must
//! not block. Soft timers live on a second list owned by a worker task
//! that the tick handler pokes through a semaphore; their callbacks run in
//! task context and may use any blocking primitive. The soft list itself
//! is guarded by a binary protect semaphore so start/stop can't race the
//! worker's scan.
//!
//! Dispatch is two-phase: a scan (under the kernel borrow) collects due
//! timers into a batch and updates their countdowns and states; the
//! callbacks run from the batch afterwards, so they are free to call back
//! into the kernel.

use core::sync::atomic::{AtomicU16, Ordering};

use abi::{
    KernelError, Priority, SemId, TimerFn, TimerId, TimerInfo, TimerKind,
    TimerState,
};
use kerncore::{List, NIL};

use crate::arch;
use crate::config;
use crate::sched::Kernel;
use crate::sem;
use crate::startup::with_kernel;
use crate::task;

pub(crate) struct Timer {
    /// Delay before the first expiry; 0 means "use the period".
    start_delay: u32,
    /// Expiry period; 0 makes the timer one-shot.
    period: u32,
    /// Ticks left until the next expiry.
    countdown: u32,
    callback: TimerFn,
    arg: *mut (),
    kind: TimerKind,
    state: TimerState,
}

/// Due timers collected by a scan, to be dispatched once the kernel borrow
/// is released.
pub(crate) struct TimerBatch {
    items: [Option<(u16, TimerFn, *mut ())>; config::TIMER_CAP],
    len: usize,
}

impl TimerBatch {
    pub(crate) const fn new() -> Self {
        const NONE: Option<(u16, TimerFn, *mut ())> = None;
        TimerBatch {
            items: [NONE; config::TIMER_CAP],
            len: 0,
        }
    }

    fn push(&mut self, item: (u16, TimerFn, *mut ())) {
        self.items[self.len] = Some(item);
        self.len += 1;
    }

    /// The callbacks to invoke, in list order.
    pub(crate) fn iter(
        &self,
    ) -> impl Iterator<Item = (TimerFn, *mut ())> + '_ {
        self.items[..self.len]
            .iter()
            .flatten()
            .map(|&(_, f, a)| (f, a))
    }

    fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.items[..self.len].iter().flatten().map(|&(ix, ..)| ix)
    }
}

/// Internal semaphores, created by `module_init` before any task runs.
/// `NIL` means "not initialized yet"; the accessors below treat that as
/// "timer module not present", which makes early bring-up code safe.
static TICK_SEM: AtomicU16 = AtomicU16::new(NIL);
static PROTECT_SEM: AtomicU16 = AtomicU16::new(NIL);

static mut TIMER_TASK_STACK: [usize; config::TIMER_TASK_STACK_WORDS] =
    [0; config::TIMER_TASK_STACK_WORDS];

fn tick_sem() -> Option<SemId> {
    match TICK_SEM.load(Ordering::Relaxed) {
        NIL => None,
        v => Some(SemId(v)),
    }
}

fn protect_sem() -> Option<SemId> {
    match PROTECT_SEM.load(Ordering::Relaxed) {
        NIL => None,
        v => Some(SemId(v)),
    }
}

impl Kernel {
    fn get_timer(&mut self, id: TimerId) -> Result<&mut Timer, KernelError> {
        self.timers
            .get_mut(usize::from(id.0))
            .and_then(|s| s.as_mut())
            .ok_or(KernelError::BadHandle)
    }

    pub(crate) fn timer_create(
        &mut self,
        start_delay: u32,
        period: u32,
        callback: TimerFn,
        arg: *mut (),
        kind: TimerKind,
    ) -> Result<TimerId, KernelError> {
        let slot = self
            .timers
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::NoSlot)?;
        self.timers[slot] = Some(Timer {
            start_delay,
            period,
            countdown: if start_delay == 0 { period } else { start_delay },
            callback,
            arg,
            kind,
            state: TimerState::Created,
        });
        Ok(TimerId(slot as u16))
    }

    /// Arms the timer. Only meaningful from `Created` or `Stopped`; other
    /// states are left untouched.
    pub(crate) fn timer_start(
        &mut self,
        id: TimerId,
    ) -> Result<(), KernelError> {
        let ix = id.0;
        let kind = {
            let t = self.get_timer(id)?;
            match t.state {
                TimerState::Created | TimerState::Stopped => {}
                _ => return Ok(()),
            }
            t.countdown = if t.start_delay > 0 {
                t.start_delay
            } else {
                t.period
            };
            t.state = TimerState::Started;
            t.kind
        };
        match kind {
            TimerKind::Hard => {
                self.hard_timers.push_front(&mut self.timer_links, ix)
            }
            TimerKind::Soft => {
                self.soft_timers.push_back(&mut self.timer_links, ix)
            }
        }
        Ok(())
    }

    /// Disarms the timer. Only meaningful from `Started` or `Running`.
    pub(crate) fn timer_stop(
        &mut self,
        id: TimerId,
    ) -> Result<(), KernelError> {
        let ix = id.0;
        let kind = {
            let t = self.get_timer(id)?;
            match t.state {
                TimerState::Started | TimerState::Running => {}
                _ => return Ok(()),
            }
            t.state = TimerState::Stopped;
            t.kind
        };
        // Started and Running timers are linked (one-shots go straight to
        // Stopped when the scan retires them), so the node is on `kind`'s
        // list.
        match kind {
            TimerKind::Hard => {
                self.hard_timers.remove(&mut self.timer_links, ix)
            }
            TimerKind::Soft => {
                self.soft_timers.remove(&mut self.timer_links, ix)
            }
        }
        Ok(())
    }

    /// Releases the timer's slot, disarming it first if needed.
    pub(crate) fn timer_destroy(
        &mut self,
        id: TimerId,
    ) -> Result<(), KernelError> {
        let _ = self.get_timer(id)?;
        self.timer_stop(id)?;
        self.timers[usize::from(id.0)] = None;
        Ok(())
    }

    pub(crate) fn timer_info(
        &mut self,
        id: TimerId,
    ) -> Result<TimerInfo, KernelError> {
        let t = self.get_timer(id)?;
        Ok(TimerInfo {
            start_delay: t.start_delay,
            period: t.period,
            countdown: t.countdown,
            kind: t.kind,
            state: t.state,
        })
    }

    /// Advances every timer on the `kind` list by one scan, collecting the
    /// due ones. Periodic timers reload; one-shots retire to `Stopped` and
    /// leave the list (their callback still runs, from the batch).
    pub(crate) fn scan_timers(&mut self, kind: TimerKind) -> TimerBatch {
        let mut batch = TimerBatch::new();
        let mut cursor = match kind {
            TimerKind::Hard => self.hard_timers.first(),
            TimerKind::Soft => self.soft_timers.first(),
        };
        while let Some(ix) = cursor {
            cursor = List::next(&self.timer_links, ix);
            let t = match self.timers[usize::from(ix)].as_mut() {
                Some(t) => t,
                None => panic!("vacant timer on list"),
            };
            let due = if t.countdown == 0 {
                true
            } else {
                t.countdown -= 1;
                t.countdown == 0
            };
            if !due {
                continue;
            }
            t.state = TimerState::Running;
            batch.push((ix, t.callback, t.arg));
            if t.period > 0 {
                t.countdown = t.period;
            } else {
                t.state = TimerState::Stopped;
                match kind {
                    TimerKind::Hard => {
                        self.hard_timers.remove(&mut self.timer_links, ix)
                    }
                    TimerKind::Soft => {
                        self.soft_timers.remove(&mut self.timer_links, ix)
                    }
                }
            }
        }
        batch
    }

    /// Returns dispatched periodic timers from `Running` to `Started`.
    /// Timers stopped or destroyed by their own callback are left alone.
    pub(crate) fn finish_timers(&mut self, batch: &TimerBatch) {
        for ix in batch.ids() {
            if let Some(t) = self.timers[usize::from(ix)].as_mut() {
                if t.state == TimerState::Running {
                    t.state = TimerState::Started;
                }
            }
        }
    }
}

/// Creates the timer module's internal semaphores. Runs once during
/// `start_kernel`, before any task exists.
pub(crate) fn module_init(k: &mut Kernel) {
    let tick = match k.sem_create(0, 0) {
        Ok(s) => s,
        Err(_) => panic!("timer module init"),
    };
    let protect = match k.sem_create(1, 1) {
        Ok(s) => s,
        Err(_) => panic!("timer module init"),
    };
    TICK_SEM.store(tick.0, Ordering::Relaxed);
    PROTECT_SEM.store(protect.0, Ordering::Relaxed);
}

/// Creates the soft-timer worker task. Runs once, from the idle task.
pub(crate) fn init_timer_task() {
    let stack: &'static mut [usize] =
        unsafe { &mut *core::ptr::addr_of_mut!(TIMER_TASK_STACK) };
    if task::task_create(
        timer_soft_task,
        core::ptr::null_mut(),
        Priority(config::TIMER_TASK_PRIO),
        stack,
    )
    .is_err()
    {
        panic!("timer task init");
    }
}

/// Pokes the soft-timer worker; called by the tick handler after it leaves
/// the critical section. A no-op until the module is initialized.
pub(crate) fn notify_tick() {
    if let Some(s) = tick_sem() {
        let _ = sem::sem_notify(s);
    }
}

/// The soft-timer worker: one scan of the soft list per tick semaphore
/// permit, serialized against start/stop by the protect semaphore.
fn timer_soft_task(_arg: *mut ()) -> ! {
    loop {
        if let Some(s) = tick_sem() {
            let _ = sem::sem_wait(s, 0);
        }
        run_with_protect(run_soft_scan);
    }
}

/// Runs `f` while holding the soft-list protect semaphore. Before the
/// module is initialized there is nothing to protect against (single
/// threaded bring-up), so `f` just runs.
fn run_with_protect<R>(f: impl FnOnce() -> R) -> R {
    match protect_sem() {
        Some(s) => {
            let _ = sem::sem_wait(s, 0);
            let r = f();
            let _ = sem::sem_notify(s);
            r
        }
        None => f(),
    }
}

fn run_soft_scan() {
    let status = arch::enter_critical();
    let batch = with_kernel(|k| k.scan_timers(TimerKind::Soft));
    arch::exit_critical(status);
    // Soft callbacks: task context, interrupts enabled, blocking allowed.
    for (cb, arg) in batch.iter() {
        cb(arg);
    }
    let status = arch::enter_critical();
    with_kernel(|k| k.finish_timers(&batch));
    arch::exit_critical(status);
}

/// Creates a timer. `start_delay` of 0 makes the first expiry use the
/// period; `period` of 0 makes the timer one-shot.
pub fn timer_create(
    start_delay: u32,
    period: u32,
    callback: TimerFn,
    arg: *mut (),
    kind: TimerKind,
) -> Result<TimerId, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| {
        k.timer_create(start_delay, period, callback, arg, kind)
    });
    arch::exit_critical(status);
    r
}

/// Arms a timer. For soft timers this may block briefly on the protect
/// semaphore, so it must not be called from ISR context; hard timers are
/// safe anywhere.
pub fn timer_start(id: TimerId) -> Result<(), KernelError> {
    match timer_kind(id)? {
        TimerKind::Hard => {
            let status = arch::enter_critical();
            let r = with_kernel(|k| k.timer_start(id));
            arch::exit_critical(status);
            r
        }
        TimerKind::Soft => run_with_protect(|| {
            let status = arch::enter_critical();
            let r = with_kernel(|k| k.timer_start(id));
            arch::exit_critical(status);
            r
        }),
    }
}

/// Disarms a timer. Same context rules as [`timer_start`].
pub fn timer_stop(id: TimerId) -> Result<(), KernelError> {
    match timer_kind(id)? {
        TimerKind::Hard => {
            let status = arch::enter_critical();
            let r = with_kernel(|k| k.timer_stop(id));
            arch::exit_critical(status);
            r
        }
        TimerKind::Soft => run_with_protect(|| {
            let status = arch::enter_critical();
            let r = with_kernel(|k| k.timer_stop(id));
            arch::exit_critical(status);
            r
        }),
    }
}

/// Destroys a timer and invalidates its handle. Same context rules as
/// [`timer_start`].
pub fn timer_destroy(id: TimerId) -> Result<(), KernelError> {
    match timer_kind(id)? {
        TimerKind::Hard => {
            let status = arch::enter_critical();
            let r = with_kernel(|k| k.timer_destroy(id));
            arch::exit_critical(status);
            r
        }
        TimerKind::Soft => run_with_protect(|| {
            let status = arch::enter_critical();
            let r = with_kernel(|k| k.timer_destroy(id));
            arch::exit_critical(status);
            r
        }),
    }
}

pub fn timer_info(id: TimerId) -> Result<TimerInfo, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.timer_info(id));
    arch::exit_critical(status);
    r
}

fn timer_kind(id: TimerId) -> Result<TimerKind, KernelError> {
    let status = arch::enter_critical();
    let r = with_kernel(|k| k.get_timer(id).map(|t| t.kind));
    arch::exit_critical(status);
    r
}
