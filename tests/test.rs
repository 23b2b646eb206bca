use cofiber::*;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const STACK: usize = 64 * 1024;

fn init() {
  let _ = env_logger::builder().is_test(true).try_init();
}

thread_local! {
  static RUNS: Cell<usize> = const { Cell::new(0) };
}

fn count_run(_: ()) {
  RUNS.with(|r| r.set(r.get() + 1));
  assert_eq!(current().unwrap().state().unwrap(), State::Running);
}

fn yield_n(n: usize) {
  for _ in 0..n {
    yield_now().unwrap();
  }
}

#[test]
fn create_rejects_bad_arguments() {
  init();
  let before = live();
  assert!(matches!(create::<()>(None, (), STACK), Err(Error::MissingEntry)));
  assert!(matches!(create(Some(count_run), (), 0), Err(Error::ZeroStackSize)));
  assert!(matches!(spawn(|| {}, 0), Err(Error::ZeroStackSize)));
  assert_eq!(live(), before);
}

#[test]
fn runs_to_completion_once() {
  init();
  let runs = RUNS.with(Cell::get);
  let co = create(Some(count_run), (), STACK).unwrap();
  assert_eq!(co.state().unwrap(), State::Ready);
  assert_eq!(co.caller().unwrap(), None);
  assert_eq!(co.resume().unwrap(), State::Finished);
  assert_eq!(RUNS.with(Cell::get), runs + 1);
  assert_eq!(current(), None);
  co.destroy().unwrap();
}

#[test]
fn finished_resume_is_a_noop() {
  init();
  let runs = RUNS.with(Cell::get);
  let co = create(Some(count_run), (), STACK).unwrap();
  co.resume().unwrap();
  for _ in 0..3 {
    assert_eq!(co.resume().unwrap(), State::Finished);
  }
  assert_eq!(RUNS.with(Cell::get), runs + 1);
  co.destroy().unwrap();
}

#[test]
fn five_yields_take_six_resumes() {
  init();
  let co = create(Some(yield_n), 5, STACK).unwrap();
  for _ in 0..5 {
    assert_eq!(co.resume().unwrap(), State::Suspended);
  }
  assert_eq!(co.resume().unwrap(), State::Finished);
  co.destroy().unwrap();
}

#[test]
fn state_history() {
  init();
  let history = Rc::new(RefCell::new(vec![]));
  let h = history.clone();
  let co = spawn(move || {
    for _ in 0..2 {
      h.borrow_mut().push(current().unwrap().state().unwrap());
      yield_now().unwrap();
    }
    h.borrow_mut().push(current().unwrap().state().unwrap());
  }, STACK).unwrap();
  history.borrow_mut().push(co.state().unwrap());
  while co.resume().unwrap() != State::Finished {
    history.borrow_mut().push(co.state().unwrap());
  }
  history.borrow_mut().push(co.state().unwrap());
  use State::*;
  assert_eq!(*history.borrow(), [Ready, Running, Suspended, Running, Suspended, Running, Finished]);
  co.destroy().unwrap();
}

#[test]
fn alternating_driver_interleaves() {
  init();
  let log = Rc::new(RefCell::new(vec![]));
  let checks = Rc::new(Cell::new(0));
  let worker = |id: u32, steps: u32, log: Rc<RefCell<Vec<(u32, u32)>>>, peer: Rc<Cell<Option<Coroutine>>>, checks: Rc<Cell<u32>>| {
    move || {
      for step in 0..steps {
        log.borrow_mut().push((id, step));
        assert_eq!(current().unwrap().state().unwrap(), State::Running);
        // the one we alternate with is never running at the same time.
        let peer = peer.get().unwrap();
        assert_ne!(peer.state().unwrap(), State::Running);
        checks.set(checks.get() + 1);
        yield_now().unwrap();
      }
    }
  };
  let peer_of_a = Rc::new(Cell::new(None));
  let peer_of_b = Rc::new(Cell::new(None));
  let a = spawn(worker(1, 3, log.clone(), peer_of_a.clone(), checks.clone()), STACK).unwrap();
  let b = spawn(worker(2, 2, log.clone(), peer_of_b.clone(), checks.clone()), STACK).unwrap();
  peer_of_a.set(Some(b));
  peer_of_b.set(Some(a));
  loop {
    let sa = a.resume().unwrap();
    let sb = b.resume().unwrap();
    if sa == State::Finished && sb == State::Finished { break }
  }
  assert_eq!(*log.borrow(), [(1, 0), (2, 0), (1, 1), (2, 1), (1, 2)]);
  assert_eq!(checks.get(), 5);
  a.destroy().unwrap();
  b.destroy().unwrap();
}

#[test]
fn nested_resume_returns_along_the_chain() {
  init();
  let log = Rc::new(RefCell::new(Vec::<&'static str>::new()));
  let l = log.clone();
  let y = spawn(move || {
    l.borrow_mut().push("y start");
    yield_now().unwrap();
    l.borrow_mut().push("y end");
  }, STACK).unwrap();
  let l = log.clone();
  let x = spawn(move || {
    let me = current().unwrap();
    l.borrow_mut().push("x start");
    assert_eq!(y.resume().unwrap(), State::Suspended);
    assert_eq!(y.caller().unwrap(), Some(me));
    l.borrow_mut().push("x after y");
    yield_now().unwrap();
    l.borrow_mut().push("x end");
  }, STACK).unwrap();

  assert_eq!(x.resume().unwrap(), State::Suspended);
  assert_eq!(current(), None);
  // the root picks y up directly: its caller link is rebound.
  assert_eq!(y.resume().unwrap(), State::Finished);
  assert_eq!(y.caller().unwrap(), None);
  assert_eq!(x.resume().unwrap(), State::Finished);
  assert_eq!(*log.borrow(), ["x start", "y start", "x after y", "y end", "x end"]);
  x.destroy().unwrap();
  y.destroy().unwrap();
}

#[test]
fn deep_nesting_composes() {
  init();
  fn level(depth: usize, out: Rc<RefCell<Vec<usize>>>) -> Coroutine {
    spawn(move || {
      if depth > 0 {
        let inner = level(depth - 1, out.clone());
        assert_eq!(inner.resume().unwrap(), State::Suspended);
        assert_eq!(call_chain().len(), 6 - depth);
        yield_now().unwrap();
        assert_eq!(inner.resume().unwrap(), State::Finished);
        inner.destroy().unwrap();
      } else {
        yield_now().unwrap();
      }
      out.borrow_mut().push(depth);
    }, STACK).unwrap()
  }
  let out = Rc::new(RefCell::new(vec![]));
  let top = level(5, out.clone());
  assert_eq!(top.resume().unwrap(), State::Suspended);
  assert_eq!(top.resume().unwrap(), State::Finished);
  assert_eq!(*out.borrow(), [0, 1, 2, 3, 4, 5]);
  top.destroy().unwrap();
}

#[test]
fn stack_top_is_aligned() {
  init();
  for size in MIN_STACK_SIZE..MIN_STACK_SIZE + 40 {
    let co = create(Some(count_run), (), size).unwrap();
    assert_eq!(co.stack_top().unwrap() % 16, 0);
    co.destroy().unwrap();
  }
}

#[test]
fn misuse_is_reported() {
  init();
  let co = spawn(|| {
    let me = current().unwrap();
    assert!(matches!(me.resume(), Err(Error::Active)));
    assert!(matches!(me.destroy(), Err(Error::Busy(State::Running))));
  }, STACK).unwrap();
  let idle = spawn(|| {}, STACK).unwrap();
  assert!(matches!(idle.suspend(), Err(Error::NotCurrent)));
  co.resume().unwrap();
  co.destroy().unwrap();
  assert!(matches!(co.resume(), Err(Error::InvalidHandle)));
  assert!(matches!(co.destroy(), Err(Error::InvalidHandle)));
  idle.destroy().unwrap();
}

#[test]
fn blocked_caller_cannot_be_resumed() {
  init();
  let outer_slot: Rc<Cell<Option<Coroutine>>> = Rc::new(Cell::new(None));
  let slot = outer_slot.clone();
  let inner = spawn(move || {
    let outer = slot.get().unwrap();
    assert_eq!(outer.state().unwrap(), State::Suspended);
    assert!(matches!(outer.resume(), Err(Error::Active)));
  }, STACK).unwrap();
  let outer = spawn(move || { inner.resume().unwrap(); inner.destroy().unwrap(); }, STACK).unwrap();
  outer_slot.set(Some(outer));
  assert_eq!(outer.resume().unwrap(), State::Finished);
  outer.destroy().unwrap();
}

#[test]
fn destroy_respects_lifecycle() {
  init();
  let token = Rc::new(());
  let held = token.clone();
  let never_run = spawn(move || drop(held), STACK).unwrap();
  assert_eq!(Rc::strong_count(&token), 2);
  never_run.destroy().unwrap();
  assert_eq!(Rc::strong_count(&token), 1);

  let parked = spawn(|| yield_now().unwrap(), STACK).unwrap();
  parked.resume().unwrap();
  assert!(matches!(parked.destroy(), Err(Error::Busy(State::Suspended))));
  parked.resume().unwrap();
  parked.destroy().unwrap();
}

#[test]
fn abandon_frees_a_parked_coroutine() {
  init();
  let before = live();
  let parked = spawn(|| loop { yield_now().unwrap() }, STACK).unwrap();
  parked.resume().unwrap();
  unsafe { parked.abandon().unwrap() };
  assert_eq!(live(), before);
  assert!(matches!(parked.state(), Err(Error::InvalidHandle)));
}

#[test]
fn panics_surface_at_resume() {
  init();
  let co = spawn(|| {
    yield_now().unwrap();
    panic!("boom");
  }, 256 * 1024).unwrap();
  co.resume().unwrap();
  let err = std::panic::catch_unwind(|| co.resume()).unwrap_err();
  assert_eq!(err.downcast_ref::<&str>(), Some(&"boom"));
  assert_eq!(co.state().unwrap(), State::Finished);
  assert_eq!(current(), None);
  co.destroy().unwrap();
}

#[test]
fn nested_panic_is_caught_by_the_resumer() {
  init();
  let y = spawn(|| panic!("inner"), 256 * 1024).unwrap();
  let x = spawn(move || {
    let err = std::panic::catch_unwind(|| y.resume()).unwrap_err();
    assert_eq!(err.downcast_ref::<&str>(), Some(&"inner"));
    assert_eq!(y.state().unwrap(), State::Finished);
    assert_eq!(call_chain(), [current().unwrap()]);
    yield_now().unwrap();
    y.destroy().unwrap();
  }, 256 * 1024).unwrap();
  assert_eq!(x.resume().unwrap(), State::Suspended);
  assert_eq!(current(), None);
  assert_eq!(x.resume().unwrap(), State::Finished);
  x.destroy().unwrap();
}

#[test]
fn backtrace_walks_a_coroutine_stack() {
  use std::backtrace::{Backtrace, BacktraceStatus};
  init();
  let captured = Rc::new(RefCell::new(None));
  let slot = captured.clone();
  let co = spawn(move || {
    *slot.borrow_mut() = Some(Backtrace::force_capture());
  }, 1024 * 1024).unwrap();
  assert_eq!(co.resume().unwrap(), State::Finished);
  let trace = captured.borrow_mut().take().unwrap();
  assert_eq!(trace.status(), BacktraceStatus::Captured);
  // resolving symbols walks the frames again, on the thread's own stack.
  assert!(!trace.to_string().is_empty());
  co.destroy().unwrap();
}

#[test]
fn builder_with_guard_page() {
  init();
  let hits = Rc::new(Cell::new(0));
  let h = hits.clone();
  let co = Builder::new()
    .stack_size(4 * MIN_STACK_SIZE + 1)
    .guard_page(true)
    .name("guarded")
    .spawn(move || {
      // some real stack use
      let buf = [7u8; 2048];
      h.set(buf.iter().map(|b| *b as usize).sum());
    })
    .unwrap();
  assert_eq!(co.resume().unwrap(), State::Finished);
  assert_eq!(hits.get(), 7 * 2048);
  co.destroy().unwrap();
}

#[test]
fn schedulers_are_per_thread() {
  init();
  let co = spawn(|| yield_now().unwrap(), STACK).unwrap();
  co.resume().unwrap();
  assert!(live() > 0);
  std::thread::spawn(|| {
    assert_eq!(live(), 0);
    assert_eq!(current(), None);
    let co = spawn(|| {}, STACK).unwrap();
    assert_eq!(co.resume().unwrap(), State::Finished);
    co.destroy().unwrap();
  }).join().unwrap();
  assert_eq!(co.resume().unwrap(), State::Finished);
  co.destroy().unwrap();
}

#[test]
fn readiness_resumes_the_parked_coroutine() {
  init();
  let ready = Rc::new(Readiness::<i32>::new());
  let log = Rc::new(RefCell::new(vec![]));
  let mut cos = vec![];
  for fd in [3, 4] {
    let (r, l) = (ready.clone(), log.clone());
    cos.push(spawn(move || {
      r.wait(fd).unwrap();
      l.borrow_mut().push(fd);
    }, STACK).unwrap());
  }
  for co in &cos {
    assert_eq!(co.resume().unwrap(), State::Suspended);
  }
  assert_eq!(ready.len(), 2);
  assert_eq!(ready.notify(4).unwrap(), Some(State::Finished));
  assert!(ready.is_waiting(3));
  assert_eq!(ready.notify(3).unwrap(), Some(State::Finished));
  assert_eq!(*log.borrow(), [4, 3]);
  for co in cos {
    co.destroy().unwrap();
  }
}
