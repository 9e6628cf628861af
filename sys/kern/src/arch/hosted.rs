// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the CPU hooks, used to build and unit-test the
//! kernel on a development machine. No context switch actually happens
//! here; tests drive `Kernel` values directly and treat the pended-switch
//! flag as an observable.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Words consumed by the synthetic initial frame.
pub const FRAME_WORDS: usize = 16;

/// Smallest stack `task_create` accepts.
pub const MIN_STACK_WORDS: usize = 32;

static CRIT_DEPTH: AtomicU32 = AtomicU32::new(0);

pub fn enter_critical() -> u32 {
    CRIT_DEPTH.fetch_add(1, Ordering::SeqCst)
}

pub fn exit_critical(_status: u32) {
    CRIT_DEPTH.fetch_sub(1, Ordering::SeqCst);
}

static SWITCH_PENDED: AtomicBool = AtomicBool::new(false);

pub fn pend_context_switch() {
    SWITCH_PENDED.store(true, Ordering::SeqCst);
}

/// Reports and clears a pended switch request. Test hook.
pub fn take_pended_switch() -> bool {
    SWITCH_PENDED.swap(false, Ordering::SeqCst)
}

/// Marks the frame area at the stack top (so high-water accounting sees
/// it used) and returns its address as the "stack pointer".
pub fn initialize_stack(
    stack: &mut [usize],
    entry: fn(*mut ()) -> !,
    arg: *mut (),
) -> usize {
    let top = stack.len();
    let frame = &mut stack[top - FRAME_WORDS..];
    frame.fill(0xcccc_cccc);
    frame[0] = entry as usize;
    frame[1] = arg as usize;
    stack.as_ptr() as usize + (top - FRAME_WORDS) * core::mem::size_of::<usize>()
}

pub fn wait_for_interrupt() {}

pub fn set_systick_period(_ms: u32) {}

/// # Safety
///
/// Trivially safe here; mirrors the ARM port's signature.
pub unsafe fn set_clock_freq(_hz: u32) {}

pub fn start_first_task() -> ! {
    panic!("entering task context");
}
