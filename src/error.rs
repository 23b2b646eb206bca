use crate::State;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("coroutine has no entry function")]
  MissingEntry,
  #[error("stack size must be non-zero")]
  ZeroStackSize,
  #[error("a {size} byte stack is smaller than the {min} byte minimum")]
  StackTooSmall { size: usize, min: usize },
  #[error("failed to allocate a {size} byte stack")]
  StackAlloc { size: usize },
  #[error("failed to map stack: {0}")]
  Map(#[from] io::Error),
  #[error("stale or unknown coroutine handle")]
  InvalidHandle,
  #[error("coroutine is already on the active call chain")]
  Active,
  #[error("coroutine is not the one currently running")]
  NotCurrent,
  #[error("cannot destroy a coroutine that is {0:?}")]
  Busy(State),
  #[error("another coroutine is already waiting on this key")]
  KeyBusy,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
