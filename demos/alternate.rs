//! Two coroutines taking turns under a driver loop.
use cofiber::{create, current, yield_now, State};
use std::time::Duration;

fn worker((id, steps, pause): (u32, u32, u64)) {
  println!("coroutine {}: started", id);
  for step in 1..=steps {
    println!("coroutine {}: step {}", id, step);
    yield_now().unwrap();
    std::thread::sleep(Duration::from_millis(pause));
  }
  println!("coroutine {}: done ({:?})", id, current());
}

fn main() {
  env_logger::init();

  let one = create(Some(worker), (1, 5, 100), 64 * 1024).unwrap();
  let two = create(Some(worker), (2, 3, 150), 64 * 1024).unwrap();

  let mut states = [State::Ready, State::Ready];
  while states != [State::Finished, State::Finished] {
    for (co, state) in [one, two].into_iter().zip(states.iter_mut()) {
      if *state != State::Finished {
        println!("--- switching to {} ---", co);
        *state = co.resume().unwrap();
      }
    }
  }

  one.destroy().unwrap();
  two.destroy().unwrap();
  println!("all coroutines finished");
}
