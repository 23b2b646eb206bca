//! X86-64 System V is pretty simple. Anything that is not callee-saved has already been spilled by
//! the compiler by the time someone calls [`switch`], so we only carry rbx, rbp, r12-r15 and the
//! control words of the SSE and x87 units, which the ABI also declares callee-saved.
//!
//! Fun ABI facts:
//!
//! * `rsp` ought to be aligned to 16 bytes when making a function call, so on entry to a function
//!   `rsp + 8` is aligned and `[rsp]` holds the return address.
//! * We treat that return-address slot as the saved instruction pointer. Restoring a context pops
//!   the slot and jumps, exactly as `ret` would. A fresh stack is built the same way, so the first
//!   switch into it looks like an ordinary return into the trampoline.

/// Default MXCSR: all exceptions masked, round to nearest.
const MXCSR_DEFAULT: u32 = 0x1f80;
/// Default x87 control word: all exceptions masked, 64-bit precision, round to nearest.
const FPUCW_DEFAULT: u16 = 0x037f;

/// Saved execution context.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
  rbx:   u64,
  rbp:   u64,
  r12:   u64,
  r13:   u64,
  r14:   u64,
  r15:   u64,
  rsp:   u64, // points at the return-address slot
  rip:   u64,
  mxcsr: u32,
  fpucw: u16,
  _pad:  u16,
}

impl Context {
  /// Writes the return-address slot at `frame` and points the context at it.
  ///
  /// # Safety
  ///
  /// * `frame` must be 16-byte aligned and writable, with at least one word of stack above it.
  pub unsafe fn new(frame: usize, entry: usize) -> Self {
    (frame as *mut usize).write(entry);
    Context {
      rsp: frame as u64,
      rip: entry as u64,
      mxcsr: MXCSR_DEFAULT,
      fpucw: FPUCW_DEFAULT,
      ..Default::default()
    }
  }

  /// Saved stack pointer.
  pub fn stack_pointer(&self) -> usize { self.rsp as usize }
  /// Address execution continues at when this context is next switched to.
  pub fn instruction_pointer(&self) -> usize { self.rip as usize }
}

extern "C" {
  pub(crate) fn cofiber_switch(from: *mut Context, to: *const Context);
  pub(crate) fn cofiber_trampoline();
}

asm_func!(
  "cofiber_switch",
  "
  // rdi = from, rsi = to
  mov rax, [rsp]                   // our own return address is where `from` resumes
  mov [rdi + 0x00], rbx
  mov [rdi + 0x08], rbp
  mov [rdi + 0x10], r12
  mov [rdi + 0x18], r13
  mov [rdi + 0x20], r14
  mov [rdi + 0x28], r15
  mov [rdi + 0x30], rsp
  mov [rdi + 0x38], rax
  stmxcsr dword ptr [rdi + 0x40]
  fnstcw word ptr [rdi + 0x44]

  mov rbx, [rsi + 0x00]
  mov rbp, [rsi + 0x08]
  mov r12, [rsi + 0x10]
  mov r13, [rsi + 0x18]
  mov r14, [rsi + 0x20]
  mov r15, [rsi + 0x28]
  ldmxcsr dword ptr [rsi + 0x40]
  fldcw word ptr [rsi + 0x44]
  mov rsp, [rsi + 0x30]
  add rsp, 8                       // pop the return-address slot
  jmp qword ptr [rsi + 0x38]
  "
);

/* Trampoline (terminates the call chain, becoming the first frame):
 * - entered with rsp + 8 aligned and rbp zeroed, as if just called.
 * - calls into the scheduler, which runs the entry function and never comes back.
 */
asm_func!(
  "cofiber_trampoline",
  "
  .cfi_startproc simple
  .cfi_def_cfa rsp, 8              // entered as if called: CFA sits just above the return slot
  .cfi_undefined rip               // stop unwinding at this frame
  push rbp                         // null frame pointer ends the chain for debuggers
  .cfi_adjust_cfa_offset 8
  mov rbp, rsp
  call {enter}
  ud2
  .cfi_endproc
  ",
  enter = sym crate::scheduler::enter,
);
