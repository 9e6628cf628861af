// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the kernel state cell.

use core::cell::UnsafeCell;

use abi::Priority;

use crate::arch;
use crate::config;
use crate::sched::Kernel;
use crate::timer;

/// Holder for the one [`Kernel`] value.
struct KernelCell(UnsafeCell<Kernel>);

// Safety: single-core target. Every access goes through `with_kernel`,
// whose callers hold the interrupt-disable critical section (or run in a
// non-preemptible handler), so borrows never overlap.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::new()));

/// Scoped access to the kernel state.
///
/// Discipline: call only with interrupts disabled (or from the pended
/// switch handler, which nothing kernel-touching can preempt), keep the
/// closure short, and never invoke user callbacks inside it -- callbacks
/// re-enter the kernel API and would alias the borrow. The timer batches
/// exist precisely to move callback invocation outside this scope.
pub(crate) fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    // Safety: see the discipline above; exclusive by construction.
    unsafe { f(&mut *KERNEL.0.get()) }
}

static mut IDLE_STACK: [usize; config::IDLE_STACK_WORDS] =
    [0; config::IDLE_STACK_WORDS];

/// The main kernel entry point.
///
/// The application's reset handler performs board setup, records the core
/// clock frequency via `arch::set_clock_freq`, and calls this. `app_init`
/// runs later, inside the idle task, with the scheduler locked; it is
/// where the application creates its tasks and objects.
///
/// # Safety
///
/// This can be called exactly once per boot.
pub unsafe fn start_kernel(app_init: fn()) -> ! {
    klog!("starting: tables");
    let idle_stack: &'static mut [usize] =
        unsafe { &mut *core::ptr::addr_of_mut!(IDLE_STACK) };

    let status = arch::enter_critical();
    with_kernel(|k| {
        k.app_init = Some(app_init);
        timer::module_init(k);
        let idle = k.task_create(
            idle_main,
            core::ptr::null_mut(),
            Priority((config::PRIO_COUNT - 1) as u8),
            idle_stack,
        );
        if idle.is_err() {
            panic!("idle task init");
        }
        // Arrange for the first launch to land in the best ready task
        // (which is the idle task, until app_init has run).
        let first = k.highest_ready();
        k.next = Some(first);
    });
    arch::exit_critical(status);

    klog!("starting: first task");
    arch::start_first_task()
}

/// The idle task: finishes bring-up with the scheduler locked, then spins
/// counting idle loops for the CPU-usage measurement. Never blocks.
fn idle_main(_arg: *mut ()) -> ! {
    // Hold the scheduler so the application observes no partial state
    // while it creates tasks; released by the tick handler when the
    // CPU-usage calibration second completes.
    crate::sched::sched_disable();

    let app = {
        let status = arch::enter_critical();
        let f = with_kernel(|k| k.app_init.take());
        arch::exit_critical(status);
        f
    };
    if let Some(f) = app {
        f();
    }
    timer::init_timer_task();

    arch::set_systick_period(config::SYSTICK_MS);

    // Sync to a tick boundary: measurement engages on the first tick.
    loop {
        let status = arch::enter_critical();
        let enabled = with_kernel(|k| k.usage_enabled());
        arch::exit_critical(status);
        if enabled {
            break;
        }
    }

    loop {
        let status = arch::enter_critical();
        with_kernel(|k| k.idle_tick());
        arch::exit_critical(status);
    }
}
