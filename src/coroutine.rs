use crate::stack::{AllocatorStack, Stack};
use crate::switch::{self, Context};
use crate::{scheduler, Error, Result};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

/// Bytes kept free below the top of every stack for the trampoline's own frame.
pub const TRAMPOLINE_RESERVE: usize = 256;
/// Smallest stack [`create`] accepts.
pub const MIN_STACK_SIZE: usize = 4096;
/// Stack size used by [`Builder`] unless told otherwise.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
  /// Created, never resumed.
  Ready,
  /// On the call chain. Only the innermost one is executing; the rest are blocked in `resume`.
  Running,
  /// Parked in a yield, or blocked in `resume` while a coroutine it resumed runs.
  Suspended,
  /// The entry function returned (or panicked). Terminal.
  Finished,
}

/// A handle to a coroutine owned by the current thread's scheduler.
///
/// Handles are cheap to copy and are checked against a generation counter on every use, so a
/// handle that outlives [`destroy`](Coroutine::destroy) is reported as
/// [`Error::InvalidHandle`] rather than touching freed memory. They cannot leave their thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coroutine {
  pub(crate) index:      u32,
  pub(crate) generation: u32,
  _thread:               PhantomData<*const ()>,
}

impl Coroutine {
  pub(crate) fn new(index: u32, generation: u32) -> Self {
    Coroutine { index, generation, _thread: PhantomData }
  }

  /// Transfers control into this coroutine until it yields or finishes.
  ///
  /// Returns the state it was left in. Resuming a finished coroutine does nothing and returns
  /// `Ok(State::Finished)`. If the entry function panicked, the panic continues from here.
  pub fn resume(self) -> Result<State> { scheduler::resume(self) }

  /// Yields control back to whoever resumed this coroutine. Must be the running coroutine.
  pub fn suspend(self) -> Result<()> { scheduler::suspend(self) }

  pub fn state(self) -> Result<State> { scheduler::with_fiber(self, |f| f.state) }

  /// The context that most recently resumed this one, `None` meaning the thread's root.
  pub fn caller(self) -> Result<Option<Coroutine>> { scheduler::with_fiber(self, |f| f.caller) }

  /// The aligned top-of-stack address the first activation was built below.
  pub fn stack_top(self) -> Result<usize> { scheduler::with_fiber(self, |f| f.stack_top) }

  /// Releases the stack and the coroutine. Only `Ready` and `Finished` coroutines qualify.
  pub fn destroy(self) -> Result<()> { scheduler::destroy(self) }

  /// Releases a yielded coroutine without ever resuming it.
  ///
  /// Nothing on its stack is dropped: resources owned by its frames leak.
  ///
  /// # Safety
  ///
  /// Nothing may still refer into the coroutine's stack. Pinned values living there are freed
  /// without their destructors running, which breaks the pinning guarantee.
  pub unsafe fn abandon(self) -> Result<()> { scheduler::abandon(self) }
}

impl fmt::Debug for Coroutine {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "Coroutine({}v{})", self.index, self.generation)
  }
}

impl fmt::Display for Coroutine {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "#{}", self.index)
  }
}

/// The coroutine object proper. Lives boxed in the scheduler so its context never moves.
pub(crate) struct Fiber {
  pub(crate) state:     State,
  pub(crate) context:   Context,
  pub(crate) entry:     Option<Box<dyn FnOnce()>>,
  pub(crate) caller:    Option<Coroutine>,
  pub(crate) panic:     Option<Box<dyn Any + Send>>,
  pub(crate) name:      Option<String>,
  pub(crate) stack_top: usize,
  pub(crate) stack:     Box<dyn Stack>,
}

impl Fiber {
  /// Builds the synthetic first frame: the context points at the trampoline, which will pretend it
  /// was called from a frame `TRAMPOLINE_RESERVE` bytes below the top of the stack.
  pub(crate) fn new(entry: Box<dyn FnOnce()>, stack: Box<dyn Stack>, name: Option<String>) -> Fiber {
    let stack_top = stack.top();
    let frame = stack_top - TRAMPOLINE_RESERVE;
    let context = unsafe { Context::new(frame, switch::trampoline()) };
    Fiber {
      state: State::Ready,
      context,
      entry: Some(entry),
      caller: None,
      panic: None,
      name,
      stack_top,
      stack,
    }
  }
}

impl fmt::Debug for Fiber {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Fiber")
      .field("state", &self.state)
      .field("name", &self.name)
      .field("caller", &self.caller)
      .field("stack_top", &format_args!("{:#x}", self.stack_top))
      .field("stack_end", &format_args!("{:#x}", self.stack.end() as usize))
      .finish()
  }
}

/// Per-coroutine configuration.
#[derive(Clone, Debug)]
pub struct Builder {
  stack_size: usize,
  guard_page: bool,
  name:       Option<String>,
}

impl Default for Builder {
  fn default() -> Self { Builder::new() }
}

impl Builder {
  pub fn new() -> Self {
    Builder { stack_size: DEFAULT_STACK_SIZE, guard_page: false, name: None }
  }

  /// Stack size in bytes.
  pub fn stack_size(mut self, size: usize) -> Self {
    self.stack_size = size;
    self
  }

  /// Map the stack with an inaccessible page below it. Unix only; ignored elsewhere.
  pub fn guard_page(mut self, yes: bool) -> Self {
    self.guard_page = yes;
    self
  }

  /// Name shown in log lines.
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  /// Creates a coroutine running `f`. It does not start until resumed.
  pub fn spawn<F: FnOnce() + 'static>(self, f: F) -> Result<Coroutine> {
    let stack = self.stack()?;
    Ok(scheduler::insert(Fiber::new(Box::new(f), stack, self.name)))
  }

  /// Creates a coroutine that calls `entry(arg)` exactly once.
  pub fn create<A: 'static>(self, entry: Option<fn(A)>, arg: A) -> Result<Coroutine> {
    let entry = entry.ok_or(Error::MissingEntry)?;
    self.spawn(move || entry(arg))
  }

  fn stack(&self) -> Result<Box<dyn Stack>> {
    let size = self.stack_size;
    if size == 0 { return Err(Error::ZeroStackSize) }
    if size < MIN_STACK_SIZE { return Err(Error::StackTooSmall { size, min: MIN_STACK_SIZE }) }
    if self.guard_page {
      return guarded_stack(size);
    }
    Ok(Box::new(AllocatorStack::new(size)?))
  }
}

#[cfg(unix)]
fn guarded_stack(size: usize) -> Result<Box<dyn Stack>> {
  let page = crate::stack::PageSize::get()?;
  Ok(Box::new(crate::stack::GuardedStack::new(size, page)?))
}

#[cfg(not(unix))]
fn guarded_stack(size: usize) -> Result<Box<dyn Stack>> {
  Ok(Box::new(AllocatorStack::new(size)?))
}

/// Creates a coroutine that will call `entry(arg)` on its own `stack_size` byte stack.
///
/// Fails without allocating anything if `entry` is `None` or the size is unusable.
pub fn create<A: 'static>(entry: Option<fn(A)>, arg: A, stack_size: usize) -> Result<Coroutine> {
  Builder::new().stack_size(stack_size).create(entry, arg)
}

/// Creates a coroutine running the closure `f`.
pub fn spawn<F: FnOnce() + 'static>(f: F, stack_size: usize) -> Result<Coroutine> {
  Builder::new().stack_size(stack_size).spawn(f)
}
