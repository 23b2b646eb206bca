use crate::{Error, Result};
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use super::STACK_ALIGN;

/// A dynamically-sized GlobalAlloc-allocated stack
pub struct AllocatorStack {
  start:  NonNull<u8>,
  layout: Layout,
}

impl AllocatorStack {
  /// Allocates a new stack on the heap with the given size.
  ///
  /// The block carries no guard page, so an overflowing coroutine scribbles over whatever sits
  /// below it. Use [`GuardedStack`](super::GuardedStack) where that matters.
  pub fn new(size: usize) -> Result<AllocatorStack> {
    if size == 0 { return Err(Error::ZeroStackSize) }
    let layout = Layout::from_size_align(size, STACK_ALIGN)
      .map_err(|_| Error::StackAlloc { size })?;
    match NonNull::new(unsafe { alloc(layout) }) {
      Some(start) => Ok(AllocatorStack { start, layout }),
      None => Err(Error::StackAlloc { size }),
    }
  }

  pub fn size(&self) -> usize { self.layout.size() }
}

impl Drop for AllocatorStack {
  fn drop(&mut self) {
    unsafe { dealloc(self.start.as_ptr(), self.layout) }
  }
}

unsafe impl super::Stack for AllocatorStack {
  fn end(&self) -> *mut usize {
    unsafe { self.start.as_ptr().add(self.layout.size()) }.cast()
  }
}
