// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # Notes on ARM-M interrupts
//!
//! Two service routines matter here:
//!
//! - `SysTick` handles the periodic timer interrupt and drives the kernel
//!   tick.
//! - `PendSV` performs deferred context switches.
//!
//! Kernel calls and ISRs never switch contexts themselves; they set the
//! PendSV pending bit. PendSV sits at the lowest exception priority, so
//! the hardware takes it only after every other handler has retired --
//! which is exactly the guarantee the kernel needs: the register
//! save/restore can never interleave with a real handler, and kernel
//! state is never observed mid-switch.
//!
//! PendSV itself distinguishes two cases by the process stack pointer. A
//! null PSP means no task has ever run: there is nothing to save, and the
//! handler simply pops the chosen task's synthetic initial frame. That
//! frame is built by `initialize_stack` to look exactly like a suspended
//! task: the eight manually-saved registers, then the hardware exception
//! frame whose PC is the task entry point (Thumb bit set) and whose r0
//! carries the entry argument.
//!
//! Floating-point state is deliberately not saved; tasks must not rely on
//! FP registers across blocking calls, and `EXC_RETURN` selects the basic
//! frame.

use core::arch::global_asm;
use core::sync::atomic::{AtomicU32, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::startup::with_kernel;

/// Words consumed by the synthetic initial frame: r4-r11 plus the
/// hardware-stacked frame.
pub const FRAME_WORDS: usize = 16;

/// Smallest stack `task_create` accepts: one initial frame plus headroom
/// for the handler that first suspends the task.
pub const MIN_STACK_WORDS: usize = 32;

/// Registers the hardware stacks on exception entry (basic frame, no FP).
#[derive(Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct ExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Full initial frame as laid out in a fresh task stack: the registers
/// PendSV saves and restores by hand, then the hardware frame.
#[derive(Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct InitialFrame {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    hw: ExceptionFrame,
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// Return into Thread mode on the process stack, basic (no-FP) frame.
const EXC_RETURN: u32 = 0xFFFF_FFFD;

/// Disables interrupts, returning whether they were enabled before. Safe
/// to nest: each `exit_critical` restores exactly what its matching enter
/// observed, carried on the caller's stack.
pub fn enter_critical() -> u32 {
    let primask = cortex_m::register::primask::read();
    cortex_m::interrupt::disable();
    primask.is_active() as u32
}

pub fn exit_critical(status: u32) {
    if status != 0 {
        // Safety: only re-enables what the matching enter found enabled.
        unsafe { cortex_m::interrupt::enable() }
    }
}

/// Requests a context switch. PendSV fires once interrupts are enabled
/// and all other handlers have retired.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Core clock frequency, recorded before kernel start so the tick timer
/// can be programmed. Kept in memory where a debugger can find it.
#[no_mangle]
static CLOCK_FREQ_HZ: AtomicU32 = AtomicU32::new(0);

/// Records the core clock frequency in Hz.
///
/// # Safety
///
/// Call once, from the reset handler, before `start_kernel`.
pub unsafe fn set_clock_freq(hz: u32) {
    CLOCK_FREQ_HZ.store(hz, Ordering::Relaxed);
}

/// Programs the SysTick timer for a `ms`-millisecond period and starts it.
pub fn set_systick_period(ms: u32) {
    let hz = CLOCK_FREQ_HZ.load(Ordering::Relaxed);
    uassert!(hz >= 1000);
    let reload = hz / 1000 * ms - 1;
    uassert!(reload > 0 && reload < (1 << 24));
    // Safety: SYST register writes; the worst outcome is a wrong tick
    // rate, which is safe.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.rvr.write(reload);
        syst.cvr.write(0);
        // Processor clock, interrupt on, counter on.
        syst.csr.modify(|v| v | 0b111);
    }
}

/// Builds the synthetic initial frame at the (8-byte aligned) top of
/// `stack` and returns the initial stack pointer value.
pub fn initialize_stack(
    stack: &mut [usize],
    entry: fn(*mut ()) -> !,
    arg: *mut (),
) -> usize {
    let word = core::mem::size_of::<usize>();
    let top = (stack.as_ptr() as usize + stack.len() * word) & !0x7;
    let sp = top - core::mem::size_of::<InitialFrame>();
    uassert!(sp >= stack.as_ptr() as usize);

    let mut frame = InitialFrame::default();
    frame.hw.r0 = arg as usize as u32;
    // Trap if the task entry ever returns.
    frame.hw.lr = 0xFFFF_FFFF;
    frame.hw.pc = (entry as usize as u32) | 1; // Thumb
    frame.hw.xpsr = INITIAL_PSR;

    // Safety: `sp .. sp + size_of::<InitialFrame>()` lies within the
    // caller's stack slice, and the alignment math above makes it 8-byte
    // aligned; InitialFrame is IntoBytes, plain words.
    unsafe {
        (sp as *mut InitialFrame).write(frame);
    }
    sp
}

// Handler that gets linked into the vector table for PendSV. (Name is
// dictated by the `cortex_m` crate.)
//
// On entry the hardware has stacked the caller-saved registers on the
// outgoing task's process stack. We stack r4-r11 next to them, let
// `pendsv_entry` swap the kernel's notion of the current task, and unpack
// the same layout from the incoming task's stack. `cbz` skips the save
// when PSP is still null, i.e. on the very first launch.
global_asm!(
    "
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        mrs r0, psp
        cbz r0, 1f
        stmdb r0!, {{r4-r11}}
    1:
        bl pendsv_entry
        ldmia r0!, {{r4-r11}}
        msr psp, r0
        ldr lr, ={exc_return}
        bx lr
    ",
    exc_return = const EXC_RETURN,
);

/// The Rust side of the PendSV handler. Receives the outgoing stack
/// pointer (or 0 at first launch), returns the incoming one.
#[no_mangle]
extern "C" fn pendsv_entry(saved_psp: u32) -> u32 {
    // PendSV runs at the lowest exception priority; nothing that touches
    // kernel state can preempt it, so the kernel borrow is exclusive.
    with_kernel(|k| k.switch_context(saved_psp as usize)) as u32
}

/// Handler for the System Tick Timer interrupt. (Name is dictated by the
/// `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::time::tick_handler();
}

/// Final step of kernel startup: demote every kernel entry point and
/// external interrupt to the lowest priority, mark "no context yet" with
/// a null PSP, and pend the first switch.
pub fn start_first_task() -> ! {
    // Our goal is to keep the kernel non-preemptive: all kernel entry
    // points (PendSV, SysTick, interrupt handlers that post) must share
    // one priority level.
    //
    // Safety: we're purely lowering priorities from their defaults, so
    // this can't cause surprise preemption; the operations are `unsafe`
    // in the `cortex_m` crate's API only.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // SVCall, PendSV, SysTick to the lowest configurable priority.
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // How many IRQs have we got? This information is stored away from
        // the NVIC, in blocks of 32, minus one.
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        let icb = &*cortex_m::peripheral::ICB::PTR;
        let irq_block_count = (icb.ictr.read() as usize & 0xF) + 1;
        for i in 0..irq_block_count * 32 {
            nvic.ipr[i].write(0xFFu8);
        }
    }

    // Safety: nulling PSP is fine while running on the main stack; it is
    // the "no task yet" marker PendSV tests for.
    unsafe {
        cortex_m::register::psp::write(0);
    }
    pend_context_switch();
    // Safety: everything is in place; the pended switch takes over the
    // moment interrupts open and never returns here.
    unsafe {
        cortex_m::interrupt::enable();
    }
    loop {
        cortex_m::asm::wfi();
    }
}
