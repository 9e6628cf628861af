// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, tailored for the current target. Each support
//! module must define the same set of names: the critical-section pair,
//! `initialize_stack`, `pend_context_switch`, `start_first_task`,
//! `set_systick_period`, `set_clock_freq`, `wait_for_interrupt`, and the
//! `FRAME_WORDS`/`MIN_STACK_WORDS` constants.
//!
//! The `hosted` variant is not a port: it exists so the kernel builds and
//! unit-tests on a development host, where no context switch can actually
//! occur.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod hosted;
        pub use hosted::*;
    }
}
