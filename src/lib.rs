//! Stackful, cooperatively scheduled coroutines.
//!
//! Each coroutine runs on its own stack and hands control back and forth explicitly: [`resume`]
//! enters a coroutine, [`yield_now`] (or [`Coroutine::suspend`]) leaves it, and control always
//! returns to whichever context resumed it last. Nothing is preempted and no kernel threads are
//! involved.
//!
//! ```no_run
//! use cofiber::{spawn, yield_now, State};
//!
//! let co = spawn(|| {
//!   for step in 0..3 {
//!     println!("step {}", step);
//!     yield_now().unwrap();
//!   }
//! }, 64 * 1024).unwrap();
//!
//! while co.resume().unwrap() != State::Finished {}
//! co.destroy().unwrap();
//! ```
//!
//! All state is per thread. Handles are `!Send`, and every thread has its own set of coroutines and
//! its own notion of [`current`].

pub mod stack;
pub mod switch;
mod coroutine;
mod error;
mod registry;
mod scheduler;

pub use coroutine::*;
pub use error::*;
pub use registry::Readiness;
pub use scheduler::{call_chain, current, live, yield_now};

/// Transfers control into `co`. See [`Coroutine::resume`].
pub fn resume(co: Coroutine) -> Result<State> {
  co.resume()
}

/// Releases a `Ready` or `Finished` coroutine. See [`Coroutine::destroy`].
pub fn destroy(co: Coroutine) -> Result<()> {
  co.destroy()
}

/// Bails out when the scheduler's own bookkeeping no longer describes the stacks it switches
/// between. Carrying on would jump into garbage.
pub(crate) fn die(message: &str) -> ! {
  log::error!("{}, aborting.", message);
  // the process may never have installed a logger.
  eprintln!("{}, aborting.", message);
  std::process::abort();
}
