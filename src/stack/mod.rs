//! Stack memory for coroutines.
//!
//! A coroutine owns exactly one stack for its whole life. Stacks grow downward on every platform we
//! support, so the interesting address is the end of the region, rounded down to the call
//! alignment.

/// # Safety
///
/// * end() must point one past the last usable byte of a region that stays allocated and unaliased
///   for as long as the value lives.
pub unsafe trait Stack {
  /// Returns a pointer past the end of the stack.
  fn end(&self) -> *mut usize;

  /// Highest usable address, rounded down to [`STACK_ALIGN`].
  fn top(&self) -> usize {
    align_down(self.end() as usize, STACK_ALIGN)
  }
}

cfg_if::cfg_if! {
  if #[cfg(any(
    // https://community.arm.com/arm-community-blogs/b/architectures-and-processors-blog/posts/using-the-stack-in-aarch32-and-aarch64
    target_arch="aarch64",
    // https://agner.org/optimize/calling_conventions.pdf
    target_arch="x86_64",
  ))] {
    /// Stack pointer alignment required at a call boundary.
    pub const STACK_ALIGN: usize = 16;
  }
}

/// Rounds `addr` down to a multiple of `align`, which must be a power of two.
#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
  addr & !(align - 1)
}

mod allocator;
pub use allocator::*;

#[cfg(unix)]
mod os_unix;
#[cfg(unix)]
pub use os_unix::*;
