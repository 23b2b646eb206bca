//! Echo server with one coroutine per connection.
//!
//! Sockets are non-blocking. A coroutine that would block parks itself on its fd in a
//! [`Readiness`] registry, and the epoll loop on the thread's own stack resumes exactly that
//! coroutine when its fd becomes ready.

#[cfg(target_os = "linux")]
fn main() {
  env_logger::init();
  let mut args = std::env::args();
  let program = args.next().unwrap_or_else(|| "echo_server".into());
  let port = match args.next() {
    None => server::DEFAULT_PORT,
    Some(arg) => match arg.parse::<u16>() {
      Ok(port) if port > 0 => port,
      _ => {
        eprintln!("invalid port: {}", arg);
        eprintln!("usage: {} [port]", program);
        std::process::exit(1);
      }
    },
  };
  if let Err(e) = server::run(port) {
    log::error!("server failed: {}", e);
    std::process::exit(1);
  }
}

#[cfg(not(target_os = "linux"))]
fn main() {
  eprintln!("echo_server needs epoll and only runs on linux");
}

#[cfg(target_os = "linux")]
mod server {
  use cofiber::{Builder, Coroutine, Readiness, State};
  use rustc_hash::FxHashMap;
  use std::cell::RefCell;
  use std::error::Error;
  use std::io::{self, ErrorKind, Read, Write};
  use std::net::{TcpListener, TcpStream};
  use std::os::unix::io::{AsRawFd, RawFd};
  use std::rc::Rc;
  use std::sync::atomic::{AtomicBool, Ordering};

  pub const DEFAULT_PORT: u16 = 8888;
  const STACK_SIZE: usize = 64 * 1024;
  const BUFFER_SIZE: usize = 4096;
  const MAX_EVENTS: usize = 64;
  const POLL_TIMEOUT_MS: i32 = 100;

  static RUNNING: AtomicBool = AtomicBool::new(true);

  extern "C" fn on_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
  }

  fn running() -> bool {
    RUNNING.load(Ordering::SeqCst)
  }

  struct Epoll(RawFd);

  impl Epoll {
    fn new() -> io::Result<Epoll> {
      let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
      if fd < 0 {
        return Err(io::Error::last_os_error());
      }
      Ok(Epoll(fd))
    }

    fn add(&self, fd: RawFd) -> io::Result<()> {
      let mut ev = libc::epoll_event {
        events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32,
        u64: fd as u64,
      };
      if unsafe { libc::epoll_ctl(self.0, libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0 {
        return Err(io::Error::last_os_error());
      }
      Ok(())
    }

    fn delete(&self, fd: RawFd) {
      let ret = unsafe { libc::epoll_ctl(self.0, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
      if ret < 0 {
        log::debug!("epoll_ctl DEL {}: {}", fd, io::Error::last_os_error());
      }
    }

    /// Returns the keys of the ready fds. An interrupted wait yields no events.
    fn wait(&self, events: &mut Vec<libc::epoll_event>, timeout: i32) -> io::Result<Vec<RawFd>> {
      events.clear();
      let n = unsafe { libc::epoll_wait(self.0, events.as_mut_ptr(), events.capacity() as i32, timeout) };
      if n < 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == ErrorKind::Interrupted { Ok(vec![]) } else { Err(err) };
      }
      unsafe { events.set_len(n as usize) };
      // epoll_event is packed: copy the key out by value.
      Ok(events.iter().map(|ev| { let key = ev.u64; key as RawFd }).collect())
    }
  }

  impl Drop for Epoll {
    fn drop(&mut self) {
      unsafe { libc::close(self.0) };
    }
  }

  struct Server {
    listener: TcpListener,
    epoll:    Epoll,
    ready:    Readiness<RawFd>,
    clients:  RefCell<FxHashMap<RawFd, Coroutine>>,
  }

  impl Server {
    fn accept_loop(self: Rc<Self>) {
      let listen_fd = self.listener.as_raw_fd();
      log::info!("accepting connections");
      while running() {
        match self.listener.accept() {
          Ok((stream, peer)) => {
            log::info!("accepted {} as fd {}", peer, stream.as_raw_fd());
            if let Err(e) = self.start_client(stream) {
              log::warn!("dropping {}: {}", peer, e);
            }
          }
          Err(e) if e.kind() == ErrorKind::WouldBlock => self.park(listen_fd),
          Err(e) if e.kind() == ErrorKind::Interrupted => {}
          Err(e) => {
            log::error!("accept: {}", e);
            break;
          }
        }
      }
      log::info!("accept loop stopped");
    }

    fn start_client(self: &Rc<Self>, stream: TcpStream) -> Result<(), Box<dyn Error>> {
      stream.set_nonblocking(true)?;
      let fd = stream.as_raw_fd();
      self.epoll.add(fd)?;
      let server = self.clone();
      let co = Builder::new()
        .stack_size(STACK_SIZE)
        .name(format!("client fd {}", fd))
        .spawn(move || server.serve(stream))?;
      // the fd number may be reused before the previous owner was reaped.
      let previous = self.clients.borrow_mut().insert(fd, co);
      if let Some(previous) = previous {
        previous.destroy()?;
      }
      // run it until it first has to wait for data.
      co.resume()?;
      Ok(())
    }

    fn serve(&self, mut stream: TcpStream) {
      let fd = stream.as_raw_fd();
      let mut buffer = [0u8; BUFFER_SIZE];
      while running() {
        match stream.read(&mut buffer) {
          Ok(0) => {
            log::info!("fd {} closed by peer", fd);
            break;
          }
          Ok(n) => {
            log::debug!("fd {}: {} bytes: {}", fd, n, String::from_utf8_lossy(&buffer[..n]));
            if let Err(e) = self.write_all(&mut stream, &buffer[..n]) {
              log::warn!("fd {}: send: {}", fd, e);
              break;
            }
          }
          Err(e) if e.kind() == ErrorKind::WouldBlock => self.park(fd),
          Err(e) if e.kind() == ErrorKind::Interrupted => {}
          Err(e) => {
            log::warn!("fd {}: recv: {}", fd, e);
            break;
          }
        }
      }
      self.epoll.delete(fd);
      log::info!("fd {} done", fd);
    }

    fn write_all(&self, stream: &mut TcpStream, mut data: &[u8]) -> io::Result<()> {
      let fd = stream.as_raw_fd();
      while !data.is_empty() {
        match stream.write(data) {
          Ok(0) => return Err(ErrorKind::WriteZero.into()),
          Ok(n) => data = &data[n..],
          Err(e) if e.kind() == ErrorKind::WouldBlock => {
            self.park(fd);
            if !running() {
              return Err(ErrorKind::Interrupted.into());
            }
          }
          Err(e) if e.kind() == ErrorKind::Interrupted => {}
          Err(e) => return Err(e),
        }
      }
      Ok(())
    }

    fn park(&self, fd: RawFd) {
      if let Err(e) = self.ready.wait(fd) {
        park_failed(fd, e);
      }
    }

    /// Destroys client coroutines that have run to completion.
    fn reap(&self) {
      let finished: Vec<(RawFd, Coroutine)> = self.clients.borrow()
        .iter()
        .filter(|(_, co)| co.state().map_or(true, |s| s == State::Finished))
        .map(|(fd, co)| (*fd, *co))
        .collect();
      for (fd, co) in finished {
        self.clients.borrow_mut().remove(&fd);
        if let Err(e) = co.destroy() {
          log::warn!("destroying {:?}: {}", co, e);
        }
      }
    }
  }

  // parking only fails off a coroutine or on a busy key.
  fn park_failed(fd: RawFd, e: cofiber::Error) -> ! {
    log::error!("cannot park on fd {}: {}", fd, e);
    std::process::abort()
  }

  pub fn run(port: u16) -> Result<(), Box<dyn Error>> {
    unsafe {
      libc::signal(libc::SIGINT, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t);
      libc::signal(libc::SIGTERM, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t);
    }

    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    let epoll = Epoll::new()?;
    let listen_fd = listener.as_raw_fd();
    epoll.add(listen_fd)?;
    let server = Rc::new(Server {
      listener,
      epoll,
      ready: Readiness::new(),
      clients: RefCell::new(FxHashMap::default()),
    });
    log::info!("listening on port {}, ctrl-c to stop", port);

    let acceptor = server.clone();
    let accept_co = Builder::new()
      .stack_size(STACK_SIZE)
      .name("accept")
      .spawn(move || acceptor.accept_loop())?;
    accept_co.resume()?;

    let mut events = Vec::with_capacity(MAX_EVENTS);
    while running() {
      let ready = match server.epoll.wait(&mut events, POLL_TIMEOUT_MS) {
        Ok(ready) => ready,
        Err(e) => {
          log::error!("epoll_wait: {}", e);
          break;
        }
      };
      for fd in ready {
        server.ready.notify(fd)?;
      }
      server.reap();
      if accept_co.state()? == State::Finished {
        break;
      }
    }

    log::info!("shutting down");
    RUNNING.store(false, Ordering::SeqCst);
    // everyone parked wakes up once, sees the flag and unwinds normally.
    server.ready.notify(listen_fd)?;
    let parked: Vec<RawFd> = server.clients.borrow().keys().copied().collect();
    for fd in parked {
      server.ready.notify(fd)?;
    }
    server.reap();
    accept_co.destroy()?;
    log::info!("server stopped");
    Ok(())
  }
}
