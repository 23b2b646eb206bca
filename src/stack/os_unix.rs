use crate::{Error, Result};
use super::Stack;
use std::{fmt, io};
use std::ptr::null_mut;
use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE, c_int, c_void};

/// Puts a guard page below the stack so an overflow faults instead of corrupting the heap.
pub struct GuardedStack {
  start: *mut u8, // start of the guard page
  size:  usize,   // usable bytes, a whole number of pages
  page:  usize,
}

impl fmt::Debug for GuardedStack {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "GuardedStack<{:x}-{:x}>", self.start as usize, self.end() as usize)
  }
}

unsafe impl Stack for GuardedStack {
  fn end(&self) -> *mut usize {
    unsafe { self.start.add(self.size + self.page) }.cast()
  }
}

impl GuardedStack {
  /// Maps `size` bytes (rounded up to whole pages) plus one inaccessible guard page.
  pub fn new(size: usize, page_size: PageSize) -> Result<Self> {
    if size == 0 { return Err(Error::ZeroStackSize) }
    let size = page_size.round(size);
    let guard_size = page_size.size();
    let total_size = size + guard_size;
    // Reserve the whole range inaccessible first, then open up everything above the guard page.
    match unsafe { libc::mmap(null_mut(), total_size, PROT_NONE, GUARD_FLAGS, -1, 0) } {
      MAP_FAILED => Err(Error::Map(io::Error::last_os_error())),
      not_ptr if not_ptr.is_null() => Err(Error::Map(io::Error::new(io::ErrorKind::Other, MMAP_RETURNED_NULL))),
      start => {
        let ptr = unsafe { start.cast::<u8>().add(guard_size) }.cast::<c_void>(); // Skip the guard page
        match unsafe { libc::mmap(ptr, size, PROT, STACK_FLAGS, -1, 0) } {
          moved if moved == ptr => {
            log::trace!("mapped {} byte stack at {:?} with guard {:?}", size, ptr, start);
            Ok(GuardedStack { start: start.cast(), size, page: guard_size })
          }
          failed => {
            let err = if failed == MAP_FAILED {
              io::Error::last_os_error()
            } else {
              io::Error::new(io::ErrorKind::Other, MMAP_MOVED_FIXED)
            };
            unsafe { libc::munmap(start, total_size) };
            Err(Error::Map(err))
          }
        }
      }
    }
  }

  /// Usable bytes above the guard page.
  pub fn size(&self) -> usize { self.size }

  /// The inaccessible range below the stack.
  pub fn guard_range(&self) -> std::ops::Range<usize> {
    self.start as usize..self.start as usize + self.page
  }
}

impl Drop for GuardedStack {
  fn drop(&mut self) {
    let size = self.size + self.page;
    unsafe { libc::munmap(self.start.cast(), size) };
  }
}

#[repr(transparent)]
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
/// A value holding the operating system's standard pagesize (probably 4k).
pub struct PageSize(usize);

impl PageSize {
  pub fn get() -> io::Result<PageSize> {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
      -1 => Err(io::Error::last_os_error()),
      size => Ok(PageSize(size as usize)),
    }
  }
  pub fn size(self) -> usize { self.0 }
  /// Rounds up to the nearest multiple of the page size.
  pub fn round(self, size: usize) -> usize {
    let mask = self.0 - 1;
    (size + mask) & !mask
  }
}

const PROT: c_int = PROT_READ | PROT_WRITE;

const MMAP_RETURNED_NULL: &str = "mmap returned a null mapping";
const MMAP_MOVED_FIXED: &str = "mmap ignored MAP_FIXED and placed the stack elsewhere";

const GUARD_FLAGS: c_int = MAP_ANONYMOUS | MAP_PRIVATE;

#[cfg(any(target_os="freebsd", target_os="linux", target_os="netbsd", target_os="openbsd"))]
const STACK_FLAGS: c_int = MAP_ANONYMOUS | MAP_PRIVATE | MAP_FIXED | libc::MAP_STACK;
#[cfg(not(any(target_os="freebsd", target_os="linux", target_os="netbsd", target_os="openbsd")))]
const STACK_FLAGS: c_int = MAP_ANONYMOUS | MAP_PRIVATE | MAP_FIXED;
