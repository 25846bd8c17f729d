//! Context switching, the tick source, and the trap plumbing.
use core::arch::naked_asm;
use core::cell::UnsafeCell;
use core::sync::atomic::{compiler_fence, AtomicBool, AtomicI32, Ordering};

use stk_kernel::port::{Port, PortEvents, StackKind};
use stk_kernel::task::{AccessMode, Stack, StackRegion, Task, STACK_SENTINEL};

extern "C" {
    /// CMSIS: the CPU frequency in Hz, populated by the startup code.
    static SystemCoreClock: u32;
}

/// Number of words in the initial register save area.
#[cfg(not(any(armv6m, armv8m_base)))]
const REGISTER_COUNT: usize = 17; // xPSR..R0, R4-R11, EXC_RETURN
#[cfg(any(armv6m, armv8m_base))]
const REGISTER_COUNT: usize = 16; // xPSR..R0, R4-R11

#[cfg(not(any(armv6m, armv8m_base)))]
const EXC_RETURN_THREAD_PSP: usize = 0xffff_fffd;

/// State shared with the naked handlers.
///
/// `idle`/`active` are `*const Stack` (whose first word is the saved SP);
/// `idle` is null when the outgoing context is to be discarded.
#[repr(C)]
struct PortContext {
    idle: UnsafeCell<*const Stack>,
    active: UnsafeCell<*const Stack>,
}

// Safety: accessed from the handlers and from `switch_context` with the
// context-switch interrupt priority serializing them.
unsafe impl Sync for PortContext {}

#[no_mangle]
static STK_ARM_M_CONTEXT: PortContext = PortContext {
    idle: UnsafeCell::new(core::ptr::null()),
    active: UnsafeCell::new(core::ptr::null()),
};

struct EventsCell(UnsafeCell<Option<&'static dyn PortEvents>>);
// Safety: written once in `start` before the first tick can fire.
unsafe impl Sync for EventsCell {}

static EVENTS: EventsCell = EventsCell(UnsafeCell::new(None));
static TICK_US: AtomicI32 = AtomicI32::new(0);
static STARTED: AtomicBool = AtomicBool::new(false);

/// Anchor of the scheduler-exit trap: SP plus the callee-saved registers
/// of the `start` frame.
#[repr(C)]
struct ExitAnchor {
    regs: UnsafeCell<[usize; 10]>, // sp, r4-r11, lr
}
unsafe impl Sync for ExitAnchor {}

#[no_mangle]
static STK_ARM_M_EXIT_ANCHOR: ExitAnchor = ExitAnchor {
    regs: UnsafeCell::new([0; 10]),
};

#[inline]
fn events() -> &'static dyn PortEvents {
    // Safety: `start` stores the handler before enabling the tick
    unsafe { (*EVENTS.0.get()).expect("scheduling was not started") }
}

/// Save the callee-saved context of the caller into the exit anchor.
/// Returns `0` on the saving call and `1` when control comes back through
/// [`exit_anchor_jump`].
#[unsafe(naked)]
extern "C" fn exit_anchor_save() -> u32 {
    naked_asm!(
        "ldr r0, =STK_ARM_M_EXIT_ANCHOR",
        "mov r1, sp",
        "str r1, [r0]",
        "str r4, [r0, #4]",
        "str r5, [r0, #8]",
        "str r6, [r0, #12]",
        "str r7, [r0, #16]",
        "mov r1, r8",
        "str r1, [r0, #20]",
        "mov r1, r9",
        "str r1, [r0, #24]",
        "mov r1, r10",
        "str r1, [r0, #28]",
        "mov r1, r11",
        "str r1, [r0, #32]",
        "mov r1, lr",
        "str r1, [r0, #36]",
        "movs r0, #0",
        "bx lr",
    );
}

/// Restore the context saved by [`exit_anchor_save`], making that call
/// return `1`.
#[unsafe(naked)]
extern "C" fn exit_anchor_jump() -> ! {
    naked_asm!(
        "ldr r0, =STK_ARM_M_EXIT_ANCHOR",
        "ldr r1, [r0]",
        "mov sp, r1",
        "ldr r4, [r0, #4]",
        "ldr r5, [r0, #8]",
        "ldr r6, [r0, #12]",
        "ldr r7, [r0, #16]",
        "ldr r1, [r0, #20]",
        "mov r8, r1",
        "ldr r1, [r0, #24]",
        "mov r9, r1",
        "ldr r1, [r0, #28]",
        "mov r10, r1",
        "ldr r1, [r0, #32]",
        "mov r11, r1",
        "ldr r1, [r0, #36]",
        "mov lr, r1",
        "movs r0, #1",
        "bx lr",
    );
}

/// The PendSV handler: the context switch itself.
///
/// Interrupts are masked for the duration; the outgoing context goes to
/// `idle` (skipped when null), the incoming one comes from `active`. The
/// FPU registers `S16-S31` are stored conditionally on bit 4 of the
/// `EXC_RETURN` value.
#[cfg(all(not(any(armv6m, armv8m_base)), has_fpu))]
#[unsafe(naked)]
#[no_mangle]
pub extern "C" fn PendSV_Handler() {
    naked_asm!(
        "cpsid i",
        "ldr r3, =STK_ARM_M_CONTEXT",
        // save the idle context, unless it is being discarded
        "ldr r1, [r3]",
        "cbz r1, 1f",
        "mrs r0, psp",
        "tst lr, #16",
        "it eq",
        "vstmdbeq r0!, {{s16-s31}}",
        "stmdb r0!, {{r4-r11, lr}}",
        "str r0, [r1]",
        "1:",
        // load the active context
        "ldr r1, [r3, #4]",
        "ldr r0, [r1]",
        "ldmia r0!, {{r4-r11, lr}}",
        "tst lr, #16",
        "it eq",
        "vldmiaeq r0!, {{s16-s31}}",
        "msr psp, r0",
        "cpsie i",
        "bx lr",
    );
}

/// The PendSV handler, Armv7-M/Armv8-M Mainline without an FPU.
#[cfg(all(not(any(armv6m, armv8m_base)), not(has_fpu)))]
#[unsafe(naked)]
#[no_mangle]
pub extern "C" fn PendSV_Handler() {
    naked_asm!(
        "cpsid i",
        "ldr r3, =STK_ARM_M_CONTEXT",
        // save the idle context, unless it is being discarded
        "ldr r1, [r3]",
        "cbz r1, 1f",
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11, lr}}",
        "str r0, [r1]",
        "1:",
        // load the active context
        "ldr r1, [r3, #4]",
        "ldr r0, [r1]",
        "ldmia r0!, {{r4-r11, lr}}",
        "msr psp, r0",
        "cpsie i",
        "bx lr",
    );
}

/// The PendSV handler, Armv6-M / Armv8-M Baseline encoding (`stm`/`ldm`
/// are limited to `r0-r7`, and `EXC_RETURN` is not managed per task).
#[cfg(any(armv6m, armv8m_base))]
#[unsafe(naked)]
#[no_mangle]
pub extern "C" fn PendSV_Handler() {
    naked_asm!(
        "cpsid i",
        "ldr r3, =STK_ARM_M_CONTEXT",
        "ldr r1, [r3]",
        "cmp r1, #0",
        "beq 1f",
        "mrs r0, psp",
        "subs r0, #16",
        "stmia r0!, {{r4-r7}}",
        "mov r4, r8",
        "mov r5, r9",
        "mov r6, r10",
        "mov r7, r11",
        "subs r0, #32",
        "stmia r0!, {{r4-r7}}",
        "subs r0, #16",
        "str r0, [r1]",
        "1:",
        "ldr r1, [r3, #4]",
        "ldr r0, [r1]",
        "ldmia r0!, {{r4-r7}}",
        "mov r8, r4",
        "mov r9, r5",
        "mov r10, r6",
        "mov r11, r7",
        "ldmia r0!, {{r4-r7}}",
        "msr psp, r0",
        // return to Thread mode, using the process stack
        "ldr r0, =0xfffffffd",
        "mov lr, r0",
        "cpsie i",
        "bx lr",
    );
}

/// The SysTick handler: forwards the tick to the kernel.
#[no_mangle]
pub extern "C" fn SysTick_Handler() {
    // make sure SysTick is enabled by `start` and nowhere else
    debug_assert!(STARTED.load(Ordering::Relaxed));

    events().on_tick();
    cortex_m::asm::dsb();
}

/// The SVCall handler. `SVC #0` enters scheduling.
#[cfg(not(any(armv6m, armv8m_base)))]
#[unsafe(naked)]
#[no_mangle]
pub extern "C" fn SVC_Handler() {
    naked_asm!(
        "tst lr, #4",
        "ite eq",
        "mrseq r0, msp",
        "mrsne r0, psp",
        "b {main}",
        main = sym svc_handler_main,
    );
}

/// The SVCall handler, Armv6-M / Armv8-M Baseline encoding.
#[cfg(any(armv6m, armv8m_base))]
#[unsafe(naked)]
#[no_mangle]
pub extern "C" fn SVC_Handler() {
    naked_asm!(
        "mov r0, lr",
        "lsls r0, r0, #29",
        "bmi 1f",
        "mrs r0, msp",
        "b {main}",
        "1:",
        "mrs r0, psp",
        "b {main}",
        main = sym svc_handler_main,
    );
}

/// Rust half of the SVCall handler. `frame` points at the stacked
/// exception frame (`R0, R1, R2, R3, R12, LR, PC, xPSR`).
extern "C" fn svc_handler_main(frame: *const usize) {
    // the SVC immediate lives in the halfword right before the stacked PC
    let svc_arg = unsafe {
        let pc = *frame.add(6) as *const u8;
        *pc.sub(2)
    };

    match svc_arg {
        0 => {
            start_scheduling();
            // return into the first context by rewriting PSP and
            // EXC_RETURN; the simplest correct way is to pend PendSV with
            // a discarded outgoing context and let it do the load
            unsafe {
                *STK_ARM_M_CONTEXT.idle.get() = core::ptr::null();
            }
            cortex_m::peripheral::SCB::set_pendsv();
        }
        _ => panic!("unknown SVC"),
    }
}

fn start_scheduling() {
    // disallow any duplicate attempt
    assert!(!STARTED.load(Ordering::Relaxed));

    enable_full_fpu_access();
    clear_fpu_state();

    // Safety: the vector table routes these handlers to us
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };
    unsafe {
        peripherals
            .SCB
            .set_priority(cortex_m::peripheral::scb::SystemHandler::SVCall, 0xff);
        peripherals
            .SCB
            .set_priority(cortex_m::peripheral::scb::SystemHandler::PendSV, 0xff);
        peripherals
            .SCB
            .set_priority(cortex_m::peripheral::scb::SystemHandler::SysTick, 0xff);
    }

    // ask the kernel for the first context
    let active = events().on_start();
    unsafe {
        *STK_ARM_M_CONTEXT.active.get() = active;
    }

    // schedule the ticks
    let tick_us = TICK_US.load(Ordering::Relaxed);
    // Safety: read-only access to a CMSIS global the startup code set up
    let reload = unsafe { SystemCoreClock } as u64 * tick_us as u64 / 1_000_000 - 1;
    assert!(reload > 0 && reload < (1 << 24), "tick out of SysTick range");
    peripherals.SYST.set_reload(reload as u32);
    peripherals.SYST.clear_current();
    peripherals
        .SYST
        .set_clock_source(cortex_m::peripheral::syst::SystClkSource::Core);
    peripherals.SYST.enable_interrupt();
    peripherals.SYST.enable_counter();

    STARTED.store(true, Ordering::Relaxed);
}

#[inline]
fn enable_full_fpu_access() {
    #[cfg(has_fpu)]
    unsafe {
        // enable FPU CP10/CP11 full access
        let scb = &*cortex_m::peripheral::SCB::PTR;
        scb.cpacr.modify(|v| v | (0b11 << 20) | (0b11 << 22));
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }
}

#[inline]
fn clear_fpu_state() {
    #[cfg(has_fpu)]
    unsafe {
        // clear CONTROL.FPCA in case the FPU was used before the start
        let control = cortex_m::register::control::read().bits() & !0b100;
        core::arch::asm!("msr control, {}", in(reg) control);
        cortex_m::asm::isb();
    }
}

/// Thread-mode entry of the sleep trap: idle until the next tick switches
/// a task back in.
extern "C" fn sleep_trap_entry(_: *mut ()) -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

/// Thread-mode entry of the exit trap: scheduling is over; hand control
/// back to the caller of `start`.
extern "C" fn exit_trap_entry(_: *mut ()) -> ! {
    unsafe {
        // back to the main stack, with a clean process-stack state
        core::arch::asm!("movs r0, #0", "msr control, r0", "msr psp, r0", out("r0") _);
    }
    cortex_m::asm::isb();
    exit_anchor_jump();
}

/// Thread-mode landing point of a task that returned from its entry
/// function.
extern "C" fn task_exit_entry() -> ! {
    cortex_m::interrupt::free(|_| {
        // the active descriptor is the exiting task's own stack
        let stack = unsafe { &**STK_ARM_M_CONTEXT.active.get() };
        events().on_task_exit(stack);
    });

    // wait to be switched away for the last time
    loop {
        cortex_m::asm::nop();
    }
}

/// The Cortex-M platform driver.
pub struct ArmMPort;

unsafe impl Port for ArmMPort {
    fn start(events: &'static dyn PortEvents, tick_us: u32, _exit_trap: Option<&'static Stack>) {
        unsafe {
            *EVENTS.0.get() = Some(events);
        }
        TICK_US.store(tick_us as i32, Ordering::Relaxed);

        if exit_anchor_save() == 0 {
            // enter the supervisor: sets up the tick source and never
            // returns here; control comes back through the exit anchor
            unsafe { core::arch::asm!("svc #0") };
            unreachable!("SVC #0 must not return");
        }
    }

    fn stop() {
        // Safety: exclusive access within the stop path
        let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

        // stop and clear SysTick
        peripherals.SYST.disable_interrupt();
        peripherals.SYST.disable_counter();
        peripherals.SYST.clear_current();

        STARTED.store(false, Ordering::Relaxed);

        // the pended PendSV loads the exit-trap context on return from
        // this interrupt
        compiler_fence(Ordering::Release);
    }

    fn init_stack(
        kind: StackKind,
        stack: &Stack,
        memory: StackRegion,
        task: Option<&'static dyn Task>,
    ) -> bool {
        if memory.len() <= REGISTER_COUNT {
            return false;
        }

        let base = memory.as_ptr();
        let top = unsafe { base.add(memory.len()) };

        // fill with the overflow sentinel
        for i in 0..memory.len() - REGISTER_COUNT {
            unsafe { base.add(i).write(STACK_SENTINEL) };
        }

        // xPSR: the T bit must be set on Cortex-M
        let xpsr = 1usize << 24;

        let (pc, lr, r0) = match (kind, task) {
            (StackKind::UserTask, Some(task)) => (
                task.entry_fn() as usize & !1,
                task_exit_entry as usize,
                task.user_data() as usize,
            ),
            (StackKind::SleepTrap, None) => {
                (sleep_trap_entry as usize & !1, sleep_trap_entry as usize, 0)
            }
            (StackKind::ExitTrap, None) => {
                (exit_trap_entry as usize & !1, exit_trap_entry as usize, 0)
            }
            _ => return false,
        };

        // hardware exception frame:
        //   xPSR, PC, LR, R12, R3, R2, R1, R0
        //   -1    -2  -3  -4   -5  -6  -7  -8
        unsafe {
            top.sub(1).write(xpsr);
            top.sub(2).write(pc);
            top.sub(3).write(lr);
            top.sub(4).write(0); // R12
            top.sub(5).write(0); // R3
            top.sub(6).write(0); // R2
            top.sub(7).write(0); // R1
            top.sub(8).write(r0);

            // software-saved part: R4-R11, preceded by the EXC_RETURN
            // word on Armv7-M and later (`stmdb {r4-r11, lr}` leaves LR
            // at the highest address of the block)
            for i in 9..=REGISTER_COUNT {
                top.sub(i).write(0);
            }
            #[cfg(not(any(armv6m, armv8m_base)))]
            top.sub(9).write(EXC_RETURN_THREAD_PSP);
        }

        stack.set_sp(unsafe { top.sub(REGISTER_COUNT) } as usize);
        true
    }

    fn switch_context(idle: Option<&'static Stack>, active: &'static Stack) {
        // make preceding memory operations visible to the PendSV handler
        compiler_fence(Ordering::Release);

        unsafe {
            *STK_ARM_M_CONTEXT.idle.get() =
                idle.map_or(core::ptr::null(), |s| s as *const Stack);
            *STK_ARM_M_CONTEXT.active.get() = active;
        }

        cortex_m::peripheral::SCB::set_pendsv();
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    fn set_access_mode(mode: AccessMode) {
        let control = cortex_m::register::control::read().bits();
        let control = match mode {
            AccessMode::Privileged => control & !1,
            AccessMode::User => control | 1,
        };
        unsafe { core::arch::asm!("msr control, {}", in(reg) control) };
        cortex_m::asm::isb();
    }

    fn tick_resolution_us() -> i32 {
        TICK_US.load(Ordering::Relaxed)
    }

    fn caller_sp() -> usize {
        // tasks run on the process stack
        let psp;
        unsafe {
            core::arch::asm!("mrs {}, psp", out(reg) psp, options(nomem, preserves_flags, nostack))
        };
        psp
    }

    unsafe fn enter_cpu_lock() {
        cortex_m::interrupt::disable();
    }

    unsafe fn leave_cpu_lock() {
        // Safety: paired with `enter_cpu_lock` by the kernel
        unsafe { cortex_m::interrupt::enable() };
    }

    fn is_cpu_lock_active() -> bool {
        cortex_m::register::primask::read().is_inactive()
    }

    fn is_interrupt_context() -> bool {
        // IPSR.Exception != 0
        let ipsr: u32;
        unsafe {
            core::arch::asm!("mrs {}, ipsr", out(reg) ipsr, options(nomem, preserves_flags, nostack))
        };
        (ipsr & ((1 << 9) - 1)) != 0
    }

    fn relax_cpu() {
        cortex_m::asm::nop();
    }

    fn hard_fault() -> ! {
        cortex_m::asm::udf();
    }
}
