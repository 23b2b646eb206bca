//! AArch64 (AAPCS64). The callee-saved set is x19-x28, the frame pointer, the stack pointer and the
//! low halves of v8-v15 (d8-d15). The link register doubles as our saved program counter: `bl`
//! into [`switch`] leaves the resume address in it, and `ret` at the end of a switch branches to
//! whatever the target context stored there.
//!
//! There is no return-address slot on the stack here, a fresh context just starts with its pc
//! pointing at the trampoline.

/// Saved execution context.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
  x:  [u64; 10], // x19-x28
  fp: u64,
  sp: u64,
  pc: u64,       // restored into lr
  d:  [u64; 8],  // d8-d15
}

impl Context {
  /// Points a fresh context at `frame` and `entry`.
  ///
  /// # Safety
  ///
  /// * `frame` must be 16-byte aligned and the top of a writable stack region.
  pub unsafe fn new(frame: usize, entry: usize) -> Self {
    Context { sp: frame as u64, pc: entry as u64, ..Default::default() }
  }

  /// Saved stack pointer.
  pub fn stack_pointer(&self) -> usize { self.sp as usize }
  /// Address execution continues at when this context is next switched to.
  pub fn instruction_pointer(&self) -> usize { self.pc as usize }
}

extern "C" {
  pub(crate) fn cofiber_switch(from: *mut Context, to: *const Context);
  pub(crate) fn cofiber_trampoline();
}

asm_func!(
  "cofiber_switch",
  "
  // x0 = from, x1 = to
  mov x9, sp
  stp x19, x20, [x0, #0x00]
  stp x21, x22, [x0, #0x10]
  stp x23, x24, [x0, #0x20]
  stp x25, x26, [x0, #0x30]
  stp x27, x28, [x0, #0x40]
  stp x29, x9,  [x0, #0x50]
  str x30,      [x0, #0x60]   // lr is where `from` resumes
  stp d8,  d9,  [x0, #0x68]
  stp d10, d11, [x0, #0x78]
  stp d12, d13, [x0, #0x88]
  stp d14, d15, [x0, #0x98]

  ldp x19, x20, [x1, #0x00]
  ldp x21, x22, [x1, #0x10]
  ldp x23, x24, [x1, #0x20]
  ldp x25, x26, [x1, #0x30]
  ldp x27, x28, [x1, #0x40]
  ldp x29, x9,  [x1, #0x50]
  mov sp, x9
  ldr x30,      [x1, #0x60]
  ldp d8,  d9,  [x1, #0x68]
  ldp d10, d11, [x1, #0x78]
  ldp d12, d13, [x1, #0x88]
  ldp d14, d15, [x1, #0x98]
  ret
  "
);

/* Trampoline (terminates the call chain, becoming the first frame):
 * - entered with sp aligned and fp zeroed.
 * - calls into the scheduler, which runs the entry function and never comes back.
 */
asm_func!(
  "cofiber_trampoline",
  "
  .cfi_startproc simple
  .cfi_def_cfa sp, 0
  .cfi_undefined x30               // stop unwinding at this frame
  mov lr, xzr
  bl {enter}
  brk #0
  .cfi_endproc
  ",
  enter = sym crate::scheduler::enter,
);

#[cfg(test)]
mod tests {
  use super::*;
  use core::mem::offset_of;

  #[test]
  fn layout_matches_assembly() {
    assert_eq!(offset_of!(Context, fp), 0x50);
    assert_eq!(offset_of!(Context, sp), 0x58);
    assert_eq!(offset_of!(Context, pc), 0x60);
    assert_eq!(offset_of!(Context, d), 0x68);
    assert_eq!(core::mem::size_of::<Context>(), 0xa8);
  }
}
