//! Sends a fixed list of messages to the echo server and prints what comes back.
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8888;
const BUFFER_SIZE: usize = 4096;

const MESSAGES: &[&str] = &[
  "Hello, Server!",
  "This is a test message.",
  "协程 Echo Server 测试",
  "1234567890",
  "quit",
];

fn main() -> std::io::Result<()> {
  env_logger::init();
  let mut args = std::env::args().skip(1);
  let host = args.next().unwrap_or_else(|| DEFAULT_HOST.into());
  let port = match args.next() {
    None => DEFAULT_PORT,
    Some(arg) => match arg.parse::<u16>() {
      Ok(port) if port > 0 => port,
      _ => {
        eprintln!("invalid port: {}", arg);
        std::process::exit(1);
      }
    },
  };

  println!("connecting to {}:{}", host, port);
  let mut stream = TcpStream::connect((host.as_str(), port))?;
  log::info!("connected from {}", stream.local_addr()?);

  let mut buffer = [0u8; BUFFER_SIZE];
  for message in MESSAGES {
    println!("\n[send] {}", message);
    stream.write_all(message.as_bytes())?;
    let n = stream.read(&mut buffer)?;
    if n == 0 {
      println!("server closed the connection");
      break;
    }
    println!("[recv] {}", String::from_utf8_lossy(&buffer[..n]));
    if *message == "quit" {
      break;
    }
    std::thread::sleep(Duration::from_millis(100));
  }

  println!("\nclosing");
  Ok(())
}
