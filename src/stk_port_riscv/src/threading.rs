//! Context switching, the machine-timer tick source, and the trap
//! plumbing.
use core::arch::naked_asm;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};

use stk_kernel::port::{Port, PortEvents, StackKind};
use stk_kernel::task::{AccessMode, Stack, StackRegion, Task, STACK_SENTINEL};
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;

/// Static description of the CLINT-compatible machine timer.
pub trait ClintOptions: 'static {
    /// Address of the `MTIME` register.
    const MTIME_PTR: usize;
    /// Address of this hart's `MTIMECMP` register.
    const MTIMECMP_PTR: usize;
    /// Frequency the timer counts at, in Hz.
    const MTIME_FREQ_HZ: u64;
}

// Word-size-dependent assembly fragments. The assembler folds the `a*b+c`
// offset expressions.
#[cfg(target_arch = "riscv32")]
macro_rules! xs {
    ($r:literal, $i:literal) => {
        concat!("sw ", $r, ", 4*", $i, "(sp)")
    };
}
#[cfg(target_arch = "riscv64")]
macro_rules! xs {
    ($r:literal, $i:literal) => {
        concat!("sd ", $r, ", 8*", $i, "(sp)")
    };
}
#[cfg(target_arch = "riscv32")]
macro_rules! xl {
    ($r:literal, $i:literal) => {
        concat!("lw ", $r, ", 4*", $i, "(sp)")
    };
}
#[cfg(target_arch = "riscv64")]
macro_rules! xl {
    ($r:literal, $i:literal) => {
        concat!("ld ", $r, ", 8*", $i, "(sp)")
    };
}

/// Load the `$i`-th pointer field of the context block at `t0`.
#[cfg(target_arch = "riscv32")]
macro_rules! ctx_l {
    ($r:literal, $i:literal) => {
        concat!("lw ", $r, ", 4*", $i, "(t0)")
    };
}
#[cfg(target_arch = "riscv64")]
macro_rules! ctx_l {
    ($r:literal, $i:literal) => {
        concat!("ld ", $r, ", 8*", $i, "(t0)")
    };
}

#[cfg(target_arch = "riscv32")]
macro_rules! sp_store {
    ($base:literal) => {
        concat!("sw sp, 0(", $base, ")")
    };
}
#[cfg(target_arch = "riscv64")]
macro_rules! sp_store {
    ($base:literal) => {
        concat!("sd sp, 0(", $base, ")")
    };
}
#[cfg(target_arch = "riscv32")]
macro_rules! sp_load {
    ($base:literal) => {
        concat!("lw sp, 0(", $base, ")")
    };
}
#[cfg(target_arch = "riscv64")]
macro_rules! sp_load {
    ($base:literal) => {
        concat!("ld sp, 0(", $base, ")")
    };
}
#[cfg(target_arch = "riscv32")]
macro_rules! ctx_clear_active {
    () => {
        "sw zero, 4*1(t0)"
    };
}
#[cfg(target_arch = "riscv64")]
macro_rules! ctx_clear_active {
    () => {
        "sd zero, 8*1(t0)"
    };
}

// Frame geometry. The integer area is 32 words (2 service words, x1, x4,
// x5-x31, one pad word that doubles as the fcsr slot); the optional FP
// area appends f0-f31.
#[cfg(target_arch = "riscv32")]
const XLEN_BYTES: usize = 4;
#[cfg(target_arch = "riscv64")]
const XLEN_BYTES: usize = 8;

const FRAME_INT_WORDS: usize = 32;

#[cfg(all(target_arch = "riscv32", target_feature = "f"))]
const FRAME_FPU_BYTES: usize = 32 * 4;
#[cfg(all(target_arch = "riscv64", target_feature = "d"))]
const FRAME_FPU_BYTES: usize = 32 * 8;
#[cfg(not(any(
    all(target_arch = "riscv32", target_feature = "f"),
    all(target_arch = "riscv64", target_feature = "d")
)))]
const FRAME_FPU_BYTES: usize = 0;

const FRAME_BYTES: usize = FRAME_INT_WORDS * XLEN_BYTES + FRAME_FPU_BYTES;
const FRAME_WORDS: usize = FRAME_BYTES / XLEN_BYTES;

// frame slot indices (in words)
// (slot 31 is the pad word, used as the fcsr slot when the FP area is
// present)
const SLOT_MEPC: usize = 0;
const SLOT_MSTATUS: usize = 1;
const SLOT_RA: usize = 2;
const SLOT_A0: usize = 9; // x10: 4 + (10 - 5)

#[cfg(target_arch = "riscv32")]
macro_rules! frame_alloc {
    () => {
        concat!("addi sp, sp, -(32*4+", frame_fpu_bytes!(), ")")
    };
}
#[cfg(target_arch = "riscv64")]
macro_rules! frame_alloc {
    () => {
        concat!("addi sp, sp, -(32*8+", frame_fpu_bytes!(), ")")
    };
}
#[cfg(target_arch = "riscv32")]
macro_rules! frame_free {
    () => {
        concat!("addi sp, sp, (32*4+", frame_fpu_bytes!(), ")")
    };
}
#[cfg(target_arch = "riscv64")]
macro_rules! frame_free {
    () => {
        concat!("addi sp, sp, (32*8+", frame_fpu_bytes!(), ")")
    };
}
#[cfg(all(target_arch = "riscv32", target_feature = "f"))]
macro_rules! frame_fpu_bytes {
    () => {
        "32*4"
    };
}
#[cfg(all(target_arch = "riscv64", target_feature = "d"))]
macro_rules! frame_fpu_bytes {
    () => {
        "32*8"
    };
}
#[cfg(not(any(
    all(target_arch = "riscv32", target_feature = "f"),
    all(target_arch = "riscv64", target_feature = "d")
)))]
macro_rules! frame_fpu_bytes {
    () => {
        "0"
    };
}

#[cfg(all(target_arch = "riscv32", target_feature = "f"))]
macro_rules! fs {
    ($i:literal) => {
        concat!("fsw f", $i, ", 32*4+4*", $i, "(sp)")
    };
}
#[cfg(all(target_arch = "riscv64", target_feature = "d"))]
macro_rules! fs {
    ($i:literal) => {
        concat!("fsd f", $i, ", 32*8+8*", $i, "(sp)")
    };
}
#[cfg(all(target_arch = "riscv32", target_feature = "f"))]
macro_rules! fl {
    ($i:literal) => {
        concat!("flw f", $i, ", 32*4+4*", $i, "(sp)")
    };
}
#[cfg(all(target_arch = "riscv64", target_feature = "d"))]
macro_rules! fl {
    ($i:literal) => {
        concat!("fld f", $i, ", 32*8+8*", $i, "(sp)")
    };
}

#[cfg(any(
    all(target_arch = "riscv32", target_feature = "f"),
    all(target_arch = "riscv64", target_feature = "d")
))]
macro_rules! save_fpu {
    () => {
        concat!(
            "csrr t0, fcsr\n",
            xs!("t0", "31"),
            "\n",
            fs!("0"), "\n", fs!("1"), "\n", fs!("2"), "\n", fs!("3"), "\n",
            fs!("4"), "\n", fs!("5"), "\n", fs!("6"), "\n", fs!("7"), "\n",
            fs!("8"), "\n", fs!("9"), "\n", fs!("10"), "\n", fs!("11"), "\n",
            fs!("12"), "\n", fs!("13"), "\n", fs!("14"), "\n", fs!("15"), "\n",
            fs!("16"), "\n", fs!("17"), "\n", fs!("18"), "\n", fs!("19"), "\n",
            fs!("20"), "\n", fs!("21"), "\n", fs!("22"), "\n", fs!("23"), "\n",
            fs!("24"), "\n", fs!("25"), "\n", fs!("26"), "\n", fs!("27"), "\n",
            fs!("28"), "\n", fs!("29"), "\n", fs!("30"), "\n", fs!("31")
        )
    };
}
#[cfg(any(
    all(target_arch = "riscv32", target_feature = "f"),
    all(target_arch = "riscv64", target_feature = "d")
))]
macro_rules! restore_fpu {
    () => {
        concat!(
            xl!("t0", "31"),
            "\n",
            "csrw fcsr, t0\n",
            fl!("0"), "\n", fl!("1"), "\n", fl!("2"), "\n", fl!("3"), "\n",
            fl!("4"), "\n", fl!("5"), "\n", fl!("6"), "\n", fl!("7"), "\n",
            fl!("8"), "\n", fl!("9"), "\n", fl!("10"), "\n", fl!("11"), "\n",
            fl!("12"), "\n", fl!("13"), "\n", fl!("14"), "\n", fl!("15"), "\n",
            fl!("16"), "\n", fl!("17"), "\n", fl!("18"), "\n", fl!("19"), "\n",
            fl!("20"), "\n", fl!("21"), "\n", fl!("22"), "\n", fl!("23"), "\n",
            fl!("24"), "\n", fl!("25"), "\n", fl!("26"), "\n", fl!("27"), "\n",
            fl!("28"), "\n", fl!("29"), "\n", fl!("30"), "\n", fl!("31")
        )
    };
}
#[cfg(not(any(
    all(target_arch = "riscv32", target_feature = "f"),
    all(target_arch = "riscv64", target_feature = "d")
)))]
macro_rules! save_fpu {
    () => {
        "nop"
    };
}
#[cfg(not(any(
    all(target_arch = "riscv32", target_feature = "f"),
    all(target_arch = "riscv64", target_feature = "d")
)))]
macro_rules! restore_fpu {
    () => {
        "nop"
    };
}

/// State shared with the trap handler. `active != null` requests a
/// context switch at trap return; `idle == null` discards the outgoing
/// context.
#[repr(C)]
struct PortContext {
    idle: UnsafeCell<*const Stack>,
    active: UnsafeCell<*const Stack>,
}

// Safety: only touched inside traps (interrupts masked).
unsafe impl Sync for PortContext {}

#[no_mangle]
static STK_RISCV_CONTEXT: PortContext = PortContext {
    idle: UnsafeCell::new(core::ptr::null()),
    active: UnsafeCell::new(core::ptr::null()),
};

struct EventsCell(UnsafeCell<Option<&'static dyn PortEvents>>);
// Safety: written once in `start` before the first trap can fire.
unsafe impl Sync for EventsCell {}

static EVENTS: EventsCell = EventsCell(UnsafeCell::new(None));
static TICK_US: AtomicI32 = AtomicI32::new(0);
static STARTED: AtomicBool = AtomicBool::new(false);
static TRAP_NESTING: AtomicUsize = AtomicUsize::new(0);

// CLINT parameters, copied out of the `ClintOptions` at `start` so the
// non-generic trap handler can reach them.
static MTIME_PTR: AtomicUsize = AtomicUsize::new(0);
static MTIMECMP_PTR: AtomicUsize = AtomicUsize::new(0);
static TICK_INTERVAL: AtomicU64 = AtomicU64::new(0);

#[inline]
fn events() -> &'static dyn PortEvents {
    // Safety: `start` stores the handler before the first trap
    unsafe { (*EVENTS.0.get()).expect("scheduling was not started") }
}

/// Read the 64-bit `mtime`, with the hi-lo-hi double read on RV32.
fn mtime() -> u64 {
    let base = MTIME_PTR.load(Ordering::Relaxed);
    #[cfg(target_arch = "riscv64")]
    {
        let reg = unsafe { &*(base as *const ReadWrite<u64>) };
        reg.get()
    }
    #[cfg(target_arch = "riscv32")]
    {
        let lo = unsafe { &*(base as *const ReadWrite<u32>) };
        let hi = unsafe { &*((base + 4) as *const ReadWrite<u32>) };
        loop {
            let h0 = hi.get();
            let l = lo.get();
            let h1 = hi.get();
            if h0 == h1 {
                return ((h0 as u64) << 32) | l as u64;
            }
        }
    }
}

/// Program `mtimecmp`, without spuriously firing mid-update on RV32.
fn set_mtimecmp(value: u64) {
    let base = MTIMECMP_PTR.load(Ordering::Relaxed);
    #[cfg(target_arch = "riscv64")]
    {
        let reg = unsafe { &*(base as *const ReadWrite<u64>) };
        reg.set(value);
    }
    #[cfg(target_arch = "riscv32")]
    {
        let lo = unsafe { &*(base as *const ReadWrite<u32>) };
        let hi = unsafe { &*((base + 4) as *const ReadWrite<u32>) };
        hi.set(u32::MAX);
        lo.set(value as u32);
        hi.set((value >> 32) as u32);
    }
}

/// The machine trap handler. Must be installed at `mtvec` (direct mode).
#[unsafe(naked)]
#[no_mangle]
pub extern "C" fn stk_riscv_trap_handler() {
    naked_asm!(
        ".align 4",
        frame_alloc!(),
        // integer register file (x2 = sp lives in the stack descriptor,
        // x3 = gp is invariant)
        xs!("x1", "2"),
        xs!("x4", "3"),
        xs!("x5", "4"),
        xs!("x6", "5"),
        xs!("x7", "6"),
        xs!("x8", "7"),
        xs!("x9", "8"),
        xs!("x10", "9"),
        xs!("x11", "10"),
        xs!("x12", "11"),
        xs!("x13", "12"),
        xs!("x14", "13"),
        xs!("x15", "14"),
        xs!("x16", "15"),
        xs!("x17", "16"),
        xs!("x18", "17"),
        xs!("x19", "18"),
        xs!("x20", "19"),
        xs!("x21", "20"),
        xs!("x22", "21"),
        xs!("x23", "22"),
        xs!("x24", "23"),
        xs!("x25", "24"),
        xs!("x26", "25"),
        xs!("x27", "26"),
        xs!("x28", "27"),
        xs!("x29", "28"),
        xs!("x30", "29"),
        xs!("x31", "30"),
        // service area
        "csrr t0, mepc",
        xs!("t0", "0"),
        "csrr t0, mstatus",
        xs!("t0", "1"),
        save_fpu!(),
        // into Rust, with the frame as the argument
        "mv a0, sp",
        "call {rust}",
        // apply a pending context switch
        "la t0, {ctx}",
        ctx_l!("t1", "0"),
        ctx_l!("t2", "1"),
        "beqz t2, 2f",
        "beqz t1, 1f",
        sp_store!("t1"),
        "1:",
        sp_load!("t2"),
        ctx_clear_active!(),
        "2:",
        // unwind the (possibly different) frame
        xl!("t0", "1"),
        "csrw mstatus, t0",
        xl!("t0", "0"),
        "csrw mepc, t0",
        restore_fpu!(),
        xl!("x1", "2"),
        xl!("x4", "3"),
        xl!("x5", "4"),
        xl!("x6", "5"),
        xl!("x7", "6"),
        xl!("x8", "7"),
        xl!("x9", "8"),
        xl!("x10", "9"),
        xl!("x11", "10"),
        xl!("x12", "11"),
        xl!("x13", "12"),
        xl!("x14", "13"),
        xl!("x15", "14"),
        xl!("x16", "15"),
        xl!("x17", "16"),
        xl!("x18", "17"),
        xl!("x19", "18"),
        xl!("x20", "19"),
        xl!("x21", "20"),
        xl!("x22", "21"),
        xl!("x23", "22"),
        xl!("x24", "23"),
        xl!("x25", "24"),
        xl!("x26", "25"),
        xl!("x27", "26"),
        xl!("x28", "27"),
        xl!("x29", "28"),
        xl!("x30", "29"),
        xl!("x31", "30"),
        frame_free!(),
        "mret",
        rust = sym stk_riscv_trap_rust,
        ctx = sym STK_RISCV_CONTEXT,
    );
}

const MCAUSE_MACHINE_TIMER: usize = 7;
const MCAUSE_ECALL_U: usize = 8;
const MCAUSE_ECALL_M: usize = 11;

/// Rust half of the trap handler. `frame` points at the register save
/// area on the interrupted context's stack.
extern "C" fn stk_riscv_trap_rust(frame: *mut usize) {
    TRAP_NESTING.fetch_add(1, Ordering::Relaxed);

    let cause = riscv::register::mcause::read();
    if cause.is_interrupt() {
        match cause.code() {
            MCAUSE_MACHINE_TIMER => {
                schedule_next_tick();
                events().on_tick();
            }
            code => panic!("unrouted machine interrupt {code}"),
        }
    } else {
        match cause.code() {
            MCAUSE_ECALL_U | MCAUSE_ECALL_M => {
                // step over the `ecall` itself
                unsafe { *frame.add(SLOT_MEPC) += 4 };
                start_scheduling();
            }
            code => panic!("unhandled exception {code} at {:#x}", unsafe {
                *frame.add(SLOT_MEPC)
            }),
        }
    }

    TRAP_NESTING.fetch_sub(1, Ordering::Relaxed);
}

/// Advance `mtimecmp` by one period, resynchronizing if ticks were lost.
fn schedule_next_tick() {
    let interval = TICK_INTERVAL.load(Ordering::Relaxed);
    let base = MTIMECMP_PTR.load(Ordering::Relaxed);
    #[cfg(target_arch = "riscv64")]
    let cmp = unsafe { &*(base as *const ReadWrite<u64>) }.get();
    #[cfg(target_arch = "riscv32")]
    let cmp = {
        let lo = unsafe { &*(base as *const ReadWrite<u32>) }.get();
        let hi = unsafe { &*((base + 4) as *const ReadWrite<u32>) }.get();
        ((hi as u64) << 32) | lo as u64
    };

    let mut next = cmp.wrapping_add(interval);
    let now = mtime();
    if next <= now {
        next = now.wrapping_add(interval);
    }
    set_mtimecmp(next);
}

fn start_scheduling() {
    // disallow any duplicate attempt
    assert!(!STARTED.load(Ordering::Relaxed));

    // first tick one period from now
    let interval = TICK_INTERVAL.load(Ordering::Relaxed);
    set_mtimecmp(mtime().wrapping_add(interval));

    // ask the kernel for the first context; the trap return loads it
    let active = events().on_start();
    unsafe {
        *STK_RISCV_CONTEXT.idle.get() = core::ptr::null();
        *STK_RISCV_CONTEXT.active.get() = active;
    }

    unsafe {
        riscv::register::mie::set_mtimer();
        // keep the FPU usable in every context so the register file can
        // always be spilled
        #[cfg(any(target_feature = "f", target_feature = "d"))]
        riscv::register::mstatus::set_fs(riscv::register::mstatus::FS::Initial);
    }

    STARTED.store(true, Ordering::Relaxed);
}

/// Thread-mode entry of the sleep trap.
extern "C" fn sleep_trap_entry(_: *mut ()) -> ! {
    loop {
        riscv::asm::wfi();
    }
}

/// Thread-mode entry of the exit trap: scheduling is over; hand control
/// back to the caller of `start`.
extern "C" fn exit_trap_entry(_: *mut ()) -> ! {
    exit_anchor_jump();
}

/// Landing point of a task that returned from its entry function.
extern "C" fn task_exit_entry() -> ! {
    riscv::interrupt::free(|_| {
        let stack = unsafe { &**STK_RISCV_CONTEXT.active.get() };
        events().on_task_exit(stack);
    });

    loop {
        riscv::asm::nop();
    }
}

/// Anchor of the scheduler-exit trap: SP plus the callee-saved registers
/// of the `start` frame.
#[repr(C)]
struct ExitAnchor {
    regs: UnsafeCell<[usize; 14]>, // sp, ra, s0-s11
}
unsafe impl Sync for ExitAnchor {}

#[no_mangle]
static STK_RISCV_EXIT_ANCHOR: ExitAnchor = ExitAnchor {
    regs: UnsafeCell::new([0; 14]),
};

#[cfg(target_arch = "riscv32")]
macro_rules! anchor_s {
    ($r:literal, $i:literal) => {
        concat!("sw ", $r, ", 4*", $i, "(t0)")
    };
}
#[cfg(target_arch = "riscv64")]
macro_rules! anchor_s {
    ($r:literal, $i:literal) => {
        concat!("sd ", $r, ", 8*", $i, "(t0)")
    };
}
#[cfg(target_arch = "riscv32")]
macro_rules! anchor_l {
    ($r:literal, $i:literal) => {
        concat!("lw ", $r, ", 4*", $i, "(t0)")
    };
}
#[cfg(target_arch = "riscv64")]
macro_rules! anchor_l {
    ($r:literal, $i:literal) => {
        concat!("ld ", $r, ", 8*", $i, "(t0)")
    };
}

/// Save the callee-saved context of the caller. Returns `0` on the saving
/// call and `1` when control comes back through [`exit_anchor_jump`].
#[unsafe(naked)]
extern "C" fn exit_anchor_save() -> u32 {
    naked_asm!(
        "la t0, {anchor}",
        anchor_s!("sp", "0"),
        anchor_s!("ra", "1"),
        anchor_s!("s0", "2"),
        anchor_s!("s1", "3"),
        anchor_s!("s2", "4"),
        anchor_s!("s3", "5"),
        anchor_s!("s4", "6"),
        anchor_s!("s5", "7"),
        anchor_s!("s6", "8"),
        anchor_s!("s7", "9"),
        anchor_s!("s8", "10"),
        anchor_s!("s9", "11"),
        anchor_s!("s10", "12"),
        anchor_s!("s11", "13"),
        "li a0, 0",
        "ret",
        anchor = sym STK_RISCV_EXIT_ANCHOR,
    );
}

/// Restore the context saved by [`exit_anchor_save`], making that call
/// return `1`.
#[unsafe(naked)]
extern "C" fn exit_anchor_jump() -> ! {
    naked_asm!(
        "la t0, {anchor}",
        anchor_l!("sp", "0"),
        anchor_l!("ra", "1"),
        anchor_l!("s0", "2"),
        anchor_l!("s1", "3"),
        anchor_l!("s2", "4"),
        anchor_l!("s3", "5"),
        anchor_l!("s4", "6"),
        anchor_l!("s5", "7"),
        anchor_l!("s6", "8"),
        anchor_l!("s7", "9"),
        anchor_l!("s8", "10"),
        anchor_l!("s9", "11"),
        anchor_l!("s10", "12"),
        anchor_l!("s11", "13"),
        "li a0, 1",
        "ret",
        anchor = sym STK_RISCV_EXIT_ANCHOR,
    );
}

/// The RISC-V platform driver, parameterized over the CLINT description.
pub struct RiscVPort<O: ClintOptions> {
    _options: PhantomData<O>,
}

unsafe impl<O: ClintOptions> Port for RiscVPort<O> {
    fn start(events: &'static dyn PortEvents, tick_us: u32, _exit_trap: Option<&'static Stack>) {
        unsafe {
            *EVENTS.0.get() = Some(events);
        }
        TICK_US.store(tick_us as i32, Ordering::Relaxed);
        MTIME_PTR.store(O::MTIME_PTR, Ordering::Relaxed);
        MTIMECMP_PTR.store(O::MTIMECMP_PTR, Ordering::Relaxed);
        TICK_INTERVAL.store(
            O::MTIME_FREQ_HZ * tick_us as u64 / 1_000_000,
            Ordering::Relaxed,
        );

        if exit_anchor_save() == 0 {
            // enter the supervisor; control comes back through the exit
            // anchor when the last task is gone
            unsafe { core::arch::asm!("ecall") };
            unreachable!("ecall must not return");
        }
    }

    fn stop() {
        unsafe { riscv::register::mie::clear_mtimer() };
        STARTED.store(false, Ordering::Relaxed);
    }

    fn init_stack(
        kind: StackKind,
        stack: &Stack,
        memory: StackRegion,
        task: Option<&'static dyn Task>,
    ) -> bool {
        if memory.len() <= FRAME_WORDS {
            return false;
        }

        let base = memory.as_ptr();
        for i in 0..memory.len() - FRAME_WORDS {
            unsafe { base.add(i).write(STACK_SENTINEL) };
        }

        let (pc, ra, a0, mode) = match (kind, task) {
            (StackKind::UserTask, Some(task)) => (
                task.entry_fn() as usize,
                task_exit_entry as usize,
                task.user_data() as usize,
                task.access_mode(),
            ),
            (StackKind::SleepTrap, None) => (
                sleep_trap_entry as usize,
                sleep_trap_entry as usize,
                0,
                AccessMode::Privileged,
            ),
            (StackKind::ExitTrap, None) => (
                exit_trap_entry as usize,
                exit_trap_entry as usize,
                0,
                AccessMode::Privileged,
            ),
            _ => return false,
        };

        // MPIE so that `mret` re-enables interrupts; MPP selects the
        // task's privilege; FS keeps the FPU usable
        let mpp = match mode {
            AccessMode::Privileged => 0b11 << 11,
            AccessMode::User => 0b00 << 11,
        };
        let mut mstatus = (1 << 7) | mpp;
        if FRAME_FPU_BYTES != 0 {
            mstatus |= 0b01 << 13;
        }

        let frame = unsafe { base.add(memory.len() - FRAME_WORDS) };
        unsafe {
            for i in 0..FRAME_WORDS {
                frame.add(i).write(0);
            }
            frame.add(SLOT_MEPC).write(pc);
            frame.add(SLOT_MSTATUS).write(mstatus);
            frame.add(SLOT_RA).write(ra);
            frame.add(SLOT_A0).write(a0);
        }

        stack.set_sp(frame as usize);
        true
    }

    fn switch_context(idle: Option<&'static Stack>, active: &'static Stack) {
        // the trap handler applies the switch on its way out
        unsafe {
            *STK_RISCV_CONTEXT.idle.get() = idle.map_or(core::ptr::null(), |s| s as *const Stack);
            *STK_RISCV_CONTEXT.active.get() = active;
        }
    }

    fn set_access_mode(_mode: AccessMode) {
        // encoded in each task's saved `mstatus` service word instead;
        // see the crate documentation
    }

    fn tick_resolution_us() -> i32 {
        TICK_US.load(Ordering::Relaxed)
    }

    fn caller_sp() -> usize {
        let sp: usize;
        unsafe {
            core::arch::asm!("mv {}, sp", out(reg) sp, options(nomem, preserves_flags, nostack))
        };
        sp
    }

    unsafe fn enter_cpu_lock() {
        riscv::interrupt::disable();
    }

    unsafe fn leave_cpu_lock() {
        // inside a trap `mstatus.MIE` stays masked; `mret` restores it
        // from `MPIE` instead
        if TRAP_NESTING.load(Ordering::Relaxed) == 0 {
            // Safety: paired with `enter_cpu_lock` by the kernel
            unsafe { riscv::interrupt::enable() };
        }
    }

    fn is_cpu_lock_active() -> bool {
        !riscv::register::mstatus::read().mie()
    }

    fn is_interrupt_context() -> bool {
        TRAP_NESTING.load(Ordering::Relaxed) != 0
    }

    fn relax_cpu() {
        core::hint::spin_loop();
    }

    fn hard_fault() -> ! {
        loop {
            unsafe { core::arch::asm!("unimp") };
        }
    }
}
