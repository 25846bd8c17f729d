//! RISC-V port for the STK kernel (RV32 and RV64, machine mode, with a
//! CLINT-compatible machine timer).
//!
//! # Hardware contract
//!
//! * The application must route the machine trap vector (`mtvec`, direct
//!   mode) to [`stk_riscv_trap_handler`]. With `riscv-rt` that means
//!   overriding `_setup_interrupts`, or pointing `mtvec` at the handler
//!   before `Kernel::start`.
//! * A CLINT-compatible `MTIME`/`MTIMECMP` register pair must exist at
//!   the addresses given by the [`ClintOptions`] implementation. Both
//!   32-bit (hi-lo double read) and 64-bit `mtime` accesses are
//!   supported.
//!
//! # Context layout
//!
//! A trap stores, on the interrupted task's stack: two service words
//! (`mepc`, `mstatus`) followed by `x1` and `x4`–`x31` (`x2` is the stack
//! pointer itself, saved in the task's one-word descriptor; `x3` is the
//! global pointer, which is invariant across tasks). When a
//! floating-point register file is present (`F` on RV32, `D` on RV64),
//! `fcsr` and `f0`–`f31` are appended.
//!
//! # Access modes
//!
//! The task privilege is encoded in each task's saved `mstatus` service
//! word (`MPP` = M or U), so it takes effect on every `mret` into the
//! task; the kernel's per-switch access-mode call is a no-op here.
#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
mod threading;

#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
pub use threading::{stk_riscv_trap_handler, ClintOptions, RiscVPort};
