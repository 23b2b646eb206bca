//! The only non-portable part of the crate: a register snapshot and the routine that swaps one for
//! another. Everything else is written against [`switch`]'s contract.
mod arch;
pub use arch::Context;

/// Saves the running context into `from` and continues execution from `to`.
///
/// Control comes back to the caller only when some later switch loads `from` again.
///
/// # Safety
///
/// * `from` must be valid for writes and stay alive until it has been switched back to (or
///   forgotten for good).
/// * `to` must hold a context saved by a previous `switch` or built by [`Context::new`], and the
///   stack it refers to must still be allocated.
#[inline(always)]
pub unsafe fn switch(from: *mut Context, to: *const Context) {
  arch::cofiber_switch(from, to)
}

/// Address of the assembly trampoline that starts every fresh context.
pub(crate) fn trampoline() -> usize {
  arch::cofiber_trampoline as *const () as usize
}
