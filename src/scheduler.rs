//! Per-thread scheduler state: the coroutine arena, the logical call stack and the root context.
//!
//! Every control transfer follows the same shape. Bookkeeping happens under a short `RefCell`
//! borrow that yields the two context pointers; the borrow is released; then [`switch`] runs. No
//! borrow is ever held across a switch, so whichever coroutine runs next is free to call back in.
//!
//! The call chain is the source of truth for who runs and who gets control back. Its last entry is
//! the current coroutine; an empty chain means the thread's own stack (the root) is running.
use crate::coroutine::{Coroutine, Fiber, State};
use crate::switch::{self, Context};
use crate::{die, Error, Result};
use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

struct Slot {
  generation: u32,
  fiber:      Option<Box<Fiber>>,
}

pub(crate) struct Scheduler {
  slots: Vec<Slot>,
  free:  Vec<u32>,
  chain: Vec<Coroutine>,
  root:  Box<Context>,
}

thread_local! {
  static SCHEDULER: RefCell<Scheduler> = RefCell::new(Scheduler::new());
}

fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
  SCHEDULER.with(|s| f(&mut s.borrow_mut()))
}

/// The pair of contexts a transfer goes between.
struct Transfer {
  from: *mut Context,
  to:   *const Context,
}

enum Begin {
  Finished,
  Switch { previous: Option<Coroutine>, transfer: Transfer },
}

impl Scheduler {
  fn new() -> Self {
    Scheduler { slots: Vec::new(), free: Vec::new(), chain: Vec::new(), root: Box::default() }
  }

  fn get(&self, co: Coroutine) -> Result<&Fiber> {
    match self.slots.get(co.index as usize) {
      Some(Slot { generation, fiber: Some(fiber) }) if *generation == co.generation => Ok(&**fiber),
      _ => Err(Error::InvalidHandle),
    }
  }

  fn get_mut(&mut self, co: Coroutine) -> Result<&mut Fiber> {
    match self.slots.get_mut(co.index as usize) {
      Some(Slot { generation, fiber: Some(fiber) }) if *generation == co.generation => Ok(&mut **fiber),
      _ => Err(Error::InvalidHandle),
    }
  }

  fn current(&self) -> Option<Coroutine> {
    self.chain.last().copied()
  }

  fn insert(&mut self, fiber: Fiber) -> Coroutine {
    let fiber = Some(Box::new(fiber));
    match self.free.pop() {
      Some(index) => {
        let slot = &mut self.slots[index as usize];
        slot.fiber = fiber;
        Coroutine::new(index, slot.generation)
      }
      None => {
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, fiber });
        Coroutine::new(index, 0)
      }
    }
  }

  /// Takes a coroutine out of the arena, leaving every outstanding handle to it stale.
  fn release(&mut self, co: Coroutine, yielded_too: bool) -> Result<Box<Fiber>> {
    match self.get(co)?.state {
      State::Ready | State::Finished => {}
      State::Suspended if yielded_too && !self.chain.contains(&co) => {}
      state => return Err(Error::Busy(state)),
    }
    let slot = &mut self.slots[co.index as usize];
    slot.generation = slot.generation.wrapping_add(1);
    self.free.push(co.index);
    slot.fiber.take().ok_or(Error::InvalidHandle)
  }

  /// Marks whoever is getting control back as running and returns where to switch to.
  fn resume_point(&mut self, caller: Option<Coroutine>) -> *mut Context {
    match caller {
      Some(caller) => match self.get_mut(caller) {
        Ok(fiber) => {
          fiber.state = State::Running;
          &mut fiber.context as *mut Context
        }
        Err(_) => die("a caller was destroyed while blocked in resume"),
      },
      None => &mut *self.root as *mut Context,
    }
  }

  fn begin_resume(&mut self, co: Coroutine) -> Result<Begin> {
    match self.get(co)?.state {
      State::Finished => return Ok(Begin::Finished),
      State::Running => return Err(Error::Active),
      State::Suspended if self.chain.contains(&co) => return Err(Error::Active),
      State::Ready | State::Suspended => {}
    }
    let previous = self.current();
    let from: *mut Context = match previous {
      Some(previous) => {
        let fiber = self.get_mut(previous)?;
        fiber.state = State::Suspended;
        &mut fiber.context as *mut Context
      }
      None => &mut *self.root as *mut Context,
    };
    let fiber = self.get_mut(co)?;
    fiber.caller = previous;
    fiber.state = State::Running;
    let to = &fiber.context as *const Context;
    self.chain.push(co);
    log::trace!("resume {:?} from {:?}", co, previous);
    Ok(Begin::Switch { previous, transfer: Transfer { from, to } })
  }

  fn end_resume(&mut self, co: Coroutine, previous: Option<Coroutine>) -> Result<(State, Option<Box<dyn Any + Send>>)> {
    if self.current() != previous {
      die("call chain does not lead back to the resumer");
    }
    if let Some(previous) = previous {
      self.get_mut(previous)?.state = State::Running;
    }
    let fiber = self.get_mut(co)?;
    Ok((fiber.state, fiber.panic.take()))
  }

  fn begin_suspend(&mut self, co: Coroutine) -> Result<Transfer> {
    self.get(co)?;
    if self.current() != Some(co) {
      return Err(Error::NotCurrent);
    }
    self.chain.pop();
    let caller = self.current();
    let fiber = self.get_mut(co)?;
    debug_assert_eq!(fiber.caller, caller);
    fiber.state = State::Suspended;
    let from = &mut fiber.context as *mut Context;
    log::trace!("yield {:?} to {:?}", co, caller);
    Ok(Transfer { from, to: self.resume_point(caller) })
  }

  fn begin_finish(&mut self) -> Transfer {
    let Some(co) = self.chain.pop() else { die("the trampoline finished with an empty call chain") };
    let caller = self.current();
    let fiber = match self.get_mut(co) {
      Ok(fiber) => fiber,
      Err(_) => die("the finishing coroutine is missing"),
    };
    fiber.state = State::Finished;
    let from = &mut fiber.context as *mut Context;
    log::trace!("finish {:?}, returning to {:?}", co, caller);
    Transfer { from, to: self.resume_point(caller) }
  }
}

impl Drop for Scheduler {
  fn drop(&mut self) {
    for slot in self.slots.iter_mut() {
      let Some(fiber) = slot.fiber.take() else { continue };
      match fiber.state {
        State::Ready | State::Finished => drop(fiber),
        // frames on this stack are still owed a resumption that will never come.
        state => {
          log::warn!("leaking the stack of a {:?} coroutine {:?} at thread exit", state, fiber.name);
          std::mem::forget(fiber);
        }
      }
    }
  }
}

pub(crate) fn insert(fiber: Fiber) -> Coroutine {
  let name = fiber.name.clone();
  let co = with(|s| s.insert(fiber));
  log::debug!("created {:?} {}", co, name.as_deref().unwrap_or(""));
  co
}

pub(crate) fn with_fiber<R>(co: Coroutine, f: impl FnOnce(&Fiber) -> R) -> Result<R> {
  with(|s| s.get(co).map(f))
}

pub(crate) fn resume(co: Coroutine) -> Result<State> {
  let previous = match with(|s| s.begin_resume(co))? {
    Begin::Finished => return Ok(State::Finished),
    Begin::Switch { previous, transfer } => {
      unsafe { switch::switch(transfer.from, transfer.to) };
      previous
    }
  };
  let (state, panic) = with(|s| s.end_resume(co, previous))?;
  if let Some(payload) = panic {
    panic::resume_unwind(payload);
  }
  Ok(state)
}

pub(crate) fn suspend(co: Coroutine) -> Result<()> {
  let transfer = with(|s| s.begin_suspend(co))?;
  unsafe { switch::switch(transfer.from, transfer.to) };
  // whoever resumed us has already put us back on top of the chain.
  debug_assert_eq!(current(), Some(co));
  Ok(())
}

pub(crate) fn destroy(co: Coroutine) -> Result<()> {
  let fiber = with(|s| s.release(co, false))?;
  log::debug!("destroyed {:?} ({:?})", co, fiber.state);
  // dropped outside the borrow: the entry closure of a never-run coroutine may run arbitrary code.
  drop(fiber);
  Ok(())
}

pub(crate) fn abandon(co: Coroutine) -> Result<()> {
  let fiber = with(|s| s.release(co, true))?;
  log::debug!("abandoned {:?} ({:?})", co, fiber.state);
  drop(fiber);
  Ok(())
}

/// First Rust code on a fresh stack, called by the assembly trampoline.
pub(crate) extern "C" fn enter() -> ! {
  run_entry();
  let transfer = with(|s| s.begin_finish());
  unsafe { switch::switch(transfer.from, transfer.to) };
  die("a finished coroutine was switched back into")
}

// Kept out of line so nothing the entry function owned is still live on this stack once we
// switch away for the last time.
#[inline(never)]
fn run_entry() {
  let (co, entry) = with(|s| {
    let Some(co) = s.current() else { die("the trampoline ran with no current coroutine") };
    match s.get_mut(co) {
      Ok(fiber) => (co, fiber.entry.take()),
      Err(_) => die("the trampoline ran for a missing coroutine"),
    }
  });
  let Some(entry) = entry else { return };
  if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
    log::debug!("{:?} panicked", co);
    with(|s| {
      if let Ok(fiber) = s.get_mut(co) {
        fiber.panic = Some(payload);
      }
    });
  }
}

/// The coroutine currently executing on this thread, `None` on the thread's own stack.
pub fn current() -> Option<Coroutine> {
  with(|s| s.current())
}

/// Yields the current coroutine back to its caller.
pub fn yield_now() -> Result<()> {
  match current() {
    Some(co) => suspend(co),
    None => Err(Error::NotCurrent),
  }
}

/// The logical call stack, outermost first. The last entry is [`current`].
pub fn call_chain() -> Vec<Coroutine> {
  with(|s| s.chain.clone())
}

/// Number of coroutines this thread has created and not yet destroyed.
pub fn live() -> usize {
  with(|s| s.slots.iter().filter(|slot| slot.fiber.is_some()).count())
}
