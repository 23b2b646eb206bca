//! Parking coroutines on I/O channels.
//!
//! A coroutine that hits a would-block result parks itself under the channel's key (typically the
//! raw fd) with [`Readiness::wait`]. The event loop calls [`Readiness::notify`] with the same key
//! when its poller reports the channel ready, which resumes exactly that coroutine.
use crate::{scheduler, Coroutine, Error, Result, State};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::fmt::Debug;
use std::hash::Hash;

#[derive(Debug)]
pub struct Readiness<K> {
  waiting: RefCell<FxHashMap<K, Coroutine>>,
}

impl<K: Hash + Eq + Copy + Debug> Default for Readiness<K> {
  fn default() -> Self { Readiness::new() }
}

impl<K: Hash + Eq + Copy + Debug> Readiness<K> {
  pub fn new() -> Self {
    Readiness { waiting: RefCell::new(FxHashMap::default()) }
  }

  /// Parks the current coroutine under `key` and yields. Returns once it has been resumed.
  ///
  /// One coroutine per key: parking a second one is [`Error::KeyBusy`].
  pub fn wait(&self, key: K) -> Result<()> {
    let co = scheduler::current().ok_or(Error::NotCurrent)?;
    {
      let mut waiting = self.waiting.borrow_mut();
      match waiting.get(&key) {
        Some(&other) if other != co => return Err(Error::KeyBusy),
        _ => { waiting.insert(key, co); }
      }
    }
    log::trace!("{:?} waits on {:?}", co, key);
    let result = co.suspend();
    // resumed by someone other than notify(): don't leave a stale registration behind.
    let mut waiting = self.waiting.borrow_mut();
    if waiting.get(&key) == Some(&co) {
      waiting.remove(&key);
    }
    result
  }

  /// Resumes the coroutine parked under `key`, if any, and returns the state it came back in.
  pub fn notify(&self, key: K) -> Result<Option<State>> {
    let parked = self.waiting.borrow_mut().remove(&key);
    match parked {
      Some(co) => {
        log::trace!("{:?} ready, resuming {:?}", key, co);
        co.resume().map(Some)
      }
      None => Ok(None),
    }
  }

  /// Forgets whoever is parked under `key` without resuming it.
  pub fn cancel(&self, key: K) -> Option<Coroutine> {
    self.waiting.borrow_mut().remove(&key)
  }

  pub fn is_waiting(&self, key: K) -> bool {
    self.waiting.borrow().contains_key(&key)
  }

  pub fn len(&self) -> usize {
    self.waiting.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.waiting.borrow().is_empty()
  }
}
