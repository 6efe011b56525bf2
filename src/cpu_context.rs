//! CPU context primitives.
//!
//! Three operations form the only machine-dependent surface of the
//! runtime: [`context_switch`], [`context_swap`], and [`trampoline`].
//! Everything above this module (tasks, the scheduler, the deque) is
//! ordinary safe-ish Rust; everything in it is raw register plumbing
//! for x86-64 System V (Linux/macOS user-space, not the Windows x64
//! ABI).

use crate::task::Task;

/// Callee-saved CPU state needed to resume a suspended stack.
///
/// Only the registers the System V ABI requires a callee to preserve
/// are here, plus `rsp`/`rip`. No SIMD/FP control words are saved —
/// this runtime does not support yielding out of hand-written SIMD
/// code that depends on control-word state surviving a switch.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct CpuContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    /// Stack pointer.
    pub rsp: u64,
    /// Instruction pointer to resume at. Only read by `context_switch`
    /// and by `setup_initial_stack`'s caller; `context_swap` relies on
    /// the return address the `call` instruction already pushed.
    pub rip: u64,
}

/// Switch directly into `next`, discarding the caller's state.
///
/// Used by [`crate::task::Task::finalize`]: the task's own stack is
/// never coming back, so there is nothing worth saving.
///
/// # Safety
/// `next` must point at a fully initialized [`CpuContext`] whose
/// `rsp` points into a live, correctly laid out stack.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(next: *const CpuContext) -> ! {
    // rdi = next context pointer.
    core::arch::naked_asm!(
        "mov r15, [rdi + 0x00]",
        "mov r14, [rdi + 0x08]",
        "mov r13, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov rbx, [rdi + 0x20]",
        "mov rbp, [rdi + 0x28]",
        "mov rsp, [rdi + 0x30]",
        "jmp [rdi + 0x38]",
    );
}

/// Save the caller's callee-saved state into `current`, then load
/// `next`. When something later swaps back into `current`, this call
/// returns as if it were an ordinary function call.
///
/// # Safety
/// Both pointers must be valid, and `next` must point at a context
/// previously produced either by a prior `context_swap` into it, or
/// by [`crate::task::init_context`].
#[unsafe(naked)]
pub unsafe extern "C" fn context_swap(current: *mut CpuContext, next: *const CpuContext) {
    // rdi = current (save destination), rsi = next (restore source).
    core::arch::naked_asm!(
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], rbx",
        "mov [rdi + 0x28], rbp",
        "mov [rdi + 0x30], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov rbx, [rsi + 0x20]",
        "mov rbp, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        "2:",
        "ret",
    );
}

/// Bootstrap routine a fresh task first jumps into.
///
/// Contract: by the time control reaches here, [`init_context`] has
/// laid out the task's stack so the top two callee-saved slots hold
/// (argument = `*mut Task`, return-address = `task_main`) and `rsp`
/// points at the argument slot. `pop rdi` loads the argument into the
/// platform's first-argument register and advances `rsp` onto the
/// `task_main` slot; the following `ret` jumps there with `rdi` set.
#[unsafe(naked)]
pub unsafe extern "C" fn trampoline() -> ! {
    core::arch::naked_asm!("pop rdi", "ret");
}

/// Extra bytes reserved below the stack's call frame before the
/// closure storage. The Windows x64 ABI mandates 32 bytes of shadow
/// space for a callee's register-passed arguments; System V has no
/// such requirement, but the red zone is handled automatically by the
/// compiler, so zero is correct here.
const SHADOW_SPACE: usize = 0;

/// Lay out a freshly allocated task's stack so that the first
/// [`context_swap`] into it lands in [`trampoline`] with `task` as the
/// effective argument.
///
/// `closure_high` is the address immediately above the task's
/// embedded closure (i.e. the first byte *not* used by closure
/// storage); stack setup works downward from there.
///
/// # Safety
/// `closure_high` must be a valid, writable address with at least 32
/// bytes available below it inside the task's stack allocation.
pub unsafe fn init_context(task: *mut Task, closure_high: usize) -> CpuContext {
    let mut sp = closure_high & !0xf;
    sp -= SHADOW_SPACE;
    let task_main_slot = sp - 8;
    let task_ptr_slot = sp - 16;
    unsafe {
        core::ptr::write(task_main_slot as *mut usize, crate::task::task_main as usize);
        core::ptr::write(task_ptr_slot as *mut *mut Task, task);
    }
    CpuContext {
        rsp: task_ptr_slot as u64,
        rip: trampoline as usize as u64,
        ..Default::default()
    }
}
