// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time: the tick handler, the delay list, and
//! CPU-utilization measurement.
//!
//! Everything in this module runs inside the kernel critical section. The
//! tick handler is the busiest path in the kernel; it advances delays,
//! charges the running task's time slice, feeds the CPU-usage averager,
//! and collects due hard timers for dispatch by the tick ISR wrapper.

use abi::{KernelError, TaskState, TimerKind};
use kerncore::List;

use crate::arch;
use crate::config;
use crate::sched::{self, Kernel};
use crate::startup::with_kernel;
use crate::task::NextTask;
use crate::timer::{self, TimerBatch};

/// CPU-utilization measurement state.
///
/// The idle task spins incrementing `idle_count`. The first measured
/// second, taken with the scheduler locked so nothing else runs,
/// establishes `idle_max` -- the idle headroom of an unloaded system.
/// Every second after that, utilization is how far the actual idle count
/// fell short of that calibration.
pub(crate) struct CpuUsage {
    /// Set on the first tick after boot; aligns the measurement window to
    /// a tick boundary.
    enabled: bool,
    idle_count: u32,
    idle_max: u32,
    /// Last computed utilization, percent in [0, 100]. Zero until the
    /// first post-calibration second completes.
    percent: u32,
}

impl CpuUsage {
    pub(crate) const fn new() -> Self {
        CpuUsage {
            enabled: false,
            idle_count: 0,
            idle_max: 0,
            percent: 0,
        }
    }
}

impl Kernel {
    /// Adds `ix` to the delay list for `ticks` ticks and marks it DELAYED.
    pub(crate) fn delay_task(&mut self, ix: u16, ticks: u32) {
        uassert!(ticks > 0);
        {
            let t = self.task_mut(ix);
            t.delay_ticks = ticks;
            t.state |= TaskState::DELAYED;
        }
        self.delayed.push_back(&mut self.delay_links, ix);
    }

    /// Removes `ix` from the delay list and clears DELAYED.
    pub(crate) fn undelay_task(&mut self, ix: u16) {
        self.delayed.remove(&mut self.delay_links, ix);
        let t = self.task_mut(ix);
        t.state.remove(TaskState::DELAYED);
        t.delay_ticks = 0;
    }

    /// One tick: delay scan, slice accounting, tick count, CPU usage, and
    /// the hard-timer scan. Returns the scheduling hint and the batch of
    /// due hard timers; the ISR wrapper runs the callbacks while still in
    /// the critical section and then calls `finish_timers`.
    pub(crate) fn tick(&mut self) -> (NextTask, TimerBatch) {
        let mut hint = NextTask::Same;

        // Expire delays. Cursor walk: grab the successor before waking,
        // since waking unlinks the node under the cursor.
        let mut cursor = self.delayed.first();
        while let Some(ix) = cursor {
            cursor = List::next(&self.delay_links, ix);
            let expired = {
                let t = self.task_mut(ix);
                t.delay_ticks -= 1;
                t.delay_ticks == 0
            };
            if expired {
                // A timed event wait leaves its queue with Timeout; a
                // plain delay just ends.
                let ev = self.task_ref(ix).wait_event;
                if let Some(ev) = ev {
                    let slot = match self.events[usize::from(ev)].as_mut() {
                        Some(s) => s,
                        None => panic!("wait on vacant event"),
                    };
                    slot.waiters.remove(&mut self.run_links, ix);
                    let t = self.task_mut(ix);
                    t.wait_event = None;
                    t.state.remove(TaskState::WAIT_EVENT);
                    t.wait_result = Err(KernelError::Timeout);
                }
                self.undelay_task(ix);
                self.sched_ready(ix);
                hint = hint.combine(NextTask::Other);
            }
        }

        hint = hint.combine(self.rotate_slice());

        self.tick_count = self.tick_count.wrapping_add(1);
        hint = hint.combine(self.usage_update());

        let batch = self.scan_timers(TimerKind::Hard);

        (hint, batch)
    }

    /// Charges the running task one slice tick; on exhaustion, rotates it
    /// to the back of its level if it has company there.
    fn rotate_slice(&mut self) -> NextTask {
        let cur = match self.current {
            Some(c) => c,
            None => return NextTask::Same,
        };
        let (slice_after, prio) = {
            let t = match self.tasks[usize::from(cur)].as_mut() {
                Some(t) => t,
                None => return NextTask::Same,
            };
            // The tick can land in the window between the current task
            // blocking and the pended switch running; the task is then
            // already queued elsewhere and must not be rotated.
            if !t.is_ready() {
                return NextTask::Same;
            }
            if t.slice > 0 {
                t.slice -= 1;
            }
            (t.slice, usize::from(t.priority.0))
        };
        if slice_after == 0 && self.ready[prio].len() >= 2 {
            self.ready[prio].remove(&mut self.run_links, cur);
            self.ready[prio].push_back(&mut self.run_links, cur);
            self.task_mut(cur).slice = config::SLICE_MAX;
            return NextTask::Other;
        }
        NextTask::Same
    }

    /// Advances the CPU-usage state machine. The first call aligns the
    /// window to a tick boundary; the call that completes the calibration
    /// second also releases the scheduler lock the idle task took at
    /// bring-up.
    fn usage_update(&mut self) -> NextTask {
        if !self.usage.enabled {
            self.usage.enabled = true;
            self.tick_count = 0;
            return NextTask::Same;
        }
        if self.tick_count == config::TICKS_PER_SEC {
            self.usage.idle_max = self.usage.idle_count;
            self.usage.idle_count = 0;
            return self.unlock_scheduler();
        } else if self.tick_count % config::TICKS_PER_SEC == 0 {
            if self.usage.idle_max > 0 {
                let idle_share = (u64::from(self.usage.idle_count) * 100
                    / u64::from(self.usage.idle_max))
                .min(100) as u32;
                self.usage.percent = 100 - idle_share;
            }
            self.usage.idle_count = 0;
        }
        NextTask::Same
    }

    /// One iteration of the idle task's measurement loop.
    pub(crate) fn idle_tick(&mut self) {
        self.usage.idle_count = self.usage.idle_count.wrapping_add(1);
    }

    pub(crate) fn usage_enabled(&self) -> bool {
        self.usage.enabled
    }

    pub(crate) fn cpu_usage_percent(&self) -> u32 {
        self.usage.percent
    }
}

/// Entry point for the periodic tick interrupt. The port's tick ISR must
/// call this exactly once per tick.
pub fn tick_handler() {
    let status = arch::enter_critical();
    let (hint, batch) = with_kernel(|k| k.tick());
    // Hard timer callbacks run here: ISR context, interrupts still
    // disabled. They may use the non-blocking kernel API.
    for (cb, arg) in batch.iter() {
        cb(arg);
    }
    with_kernel(|k| k.finish_timers(&batch));
    arch::exit_critical(status);

    timer::notify_tick();

    if hint == NextTask::Other {
        sched::reschedule_now();
    }
}

/// Ticks since boot. The counter restarts once, on the tick that engages
/// CPU-usage measurement.
pub fn tick_count() -> u64 {
    let status = arch::enter_critical();
    let t = with_kernel(|k| k.tick_count);
    arch::exit_critical(status);
    t
}

/// Last computed CPU utilization, percent. Reads 0 until calibration and
/// the first measured second have completed.
pub fn cpu_usage() -> u32 {
    let status = arch::enter_critical();
    let p = with_kernel(|k| k.cpu_usage_percent());
    arch::exit_critical(status);
    p
}
