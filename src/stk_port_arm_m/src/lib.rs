//! Cortex-M port for the STK kernel.
//!
//! Supports Armv6-M (M0/M0+), Armv7-M (M3/M4/M7, with or without FPU) and
//! Armv8-M Mainline (M33).
//!
//! # Hardware contract
//!
//! * The application must route the `SysTick`, `PendSV`, and `SVCall`
//!   vectors to this crate's handlers (`SysTick_Handler`,
//!   `PendSV_Handler`, `SVC_Handler`; `cortex-m-rt` picks them up by
//!   name).
//! * The CMSIS-style `SystemCoreClock` global must hold the CPU frequency
//!   in Hz before [`stk_kernel::Kernel::start`] is called.
//!
//! # Context layout
//!
//! The hardware stacks `xPSR, PC, LR, R12, R3-R0` on exception entry; the
//! `PendSV` handler additionally stores `R4-R11` and, on Armv7-M and
//! later, the `EXC_RETURN` value (so each task keeps its own FPU-active
//! state; `S16-S31` are saved on top when `EXC_RETURN` says the frame has
//! FP state). The saved stack pointer of the outgoing task is written to
//! its one-word `Stack` descriptor, and the incoming descriptor's SP is
//! loaded back the same way.
#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(target_os = "none")]
mod threading;

#[cfg(target_os = "none")]
pub use threading::ArmMPort;
