#![allow(dead_code)]

use ::core::cell::Cell;
use ::std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use ::std::sync::{Arc, Mutex};
use embedded_time::rate::Fraction;
use embedded_time::Instant;
use newt_msg::{TryFromBytes, TryIntoBytes};

use crate::net::{Addrd, Socket};

pub fn dummy_addr() -> SocketAddr {
  SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 8080))
}

pub fn dummy_addr_2() -> SocketAddr {
  SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 2), 8080))
}

pub fn dummy_addr_3() -> SocketAddr {
  SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 3), 8080))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClockMock(pub Cell<u64>);

impl ClockMock {
  pub fn new() -> Self {
    Self(Cell::new(0))
  }

  pub fn set(&self, to: u64) {
    self.0.set(to);
  }

  pub fn advance(&self, by: u64) {
    self.0.set(self.0.get() + by);
  }

  pub fn instant(n: u64) -> Instant<Self> {
    Instant::new(n)
  }
}

impl embedded_time::Clock for ClockMock {
  type T = u64;

  const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000_000);

  fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
    Ok(Instant::new(self.0.get()))
  }
}

/// Milliseconds, in [`ClockMock`] ticks (it counts microseconds)
pub fn ms(n: u64) -> u64 {
  n * 1000
}

/// A mocked socket
#[derive(Debug)]
pub struct SockMock {
  /// Inbound bytes from remote sockets. Address represents the sender
  pub rx: Arc<Mutex<Vec<Addrd<Vec<u8>>>>>,
  /// Outbound bytes to remote sockets. Address represents the destination
  pub tx: Arc<Mutex<Vec<Addrd<Vec<u8>>>>>,
  /// Multicast groups joined, as (ifindex, group)
  pub joined: Arc<Mutex<Vec<(u32, IpAddr)>>>,
}

impl SockMock {
  pub fn new() -> Self {
    Self { rx: Default::default(),
           tx: Default::default(),
           joined: Default::default() }
  }

  pub fn send_msg(rx: &Arc<Mutex<Vec<Addrd<Vec<u8>>>>>, msg: Addrd<newt_msg::Message>) {
    rx.lock()
      .unwrap()
      .push(msg.map(|msg| msg.try_into_bytes().unwrap()));
  }

  /// Pop every outbound datagram bound for `addr` and parse it
  pub fn sent_msgs(tx: &Arc<Mutex<Vec<Addrd<Vec<u8>>>>>,
                   addr: SocketAddr)
                   -> Vec<newt_msg::Message> {
    tx.lock()
      .unwrap()
      .iter()
      .filter(|dgram| dgram.addr() == addr && !dgram.data().is_empty())
      .map(|Addrd(bytes, _)| newt_msg::Message::try_from_bytes(bytes).unwrap())
      .collect()
  }
}

impl Socket for SockMock {
  type Error = Option<()>;

  fn local_addr(&self) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 5683))
  }

  fn bind_raw(_: SocketAddr) -> Result<Self, Self::Error> {
    Ok(Self::new())
  }

  fn send(&self, buf: Addrd<&[u8]>) -> nb::Result<usize, Self::Error> {
    let mut vec = self.tx.lock().unwrap();
    vec.push(buf.map(Vec::from));
    Ok(buf.data().len())
  }

  fn recv(&self, buf: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    let mut rx = self.rx.lock().unwrap();

    if rx.is_empty() {
      return Err(nb::Error::WouldBlock);
    }

    let dgram = rx.remove(0);
    let n = usize::min(buf.len(), dgram.data().len());
    buf[..n].copy_from_slice(&dgram.data()[..n]);

    Ok(dgram.map(|_| n))
  }

  fn peek(&self, buf: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    let rx = self.rx.lock().unwrap();

    match rx.first() {
      | None => Err(nb::Error::WouldBlock),
      | Some(dgram) => {
        let n = usize::min(buf.len(), dgram.data().len());
        buf[..n].copy_from_slice(&dgram.data()[..n]);
        Ok(Addrd(n, dgram.addr()))
      },
    }
  }

  fn join_multicast(&self, ifindex: u32, group: IpAddr) -> Result<(), Self::Error> {
    self.joined.lock().unwrap().push((ifindex, group));
    Ok(())
  }
}

#[test]
fn sock_mock_round_trips() {
  let sock = SockMock::new();
  sock.rx
      .lock()
      .unwrap()
      .push(Addrd(vec![1, 2, 3], dummy_addr()));

  let mut buf = [0u8; 8];
  let Addrd(n, addr) = sock.recv(&mut buf).unwrap();
  assert_eq!(&buf[..n], &[1, 2, 3]);
  assert_eq!(addr, dummy_addr());
  assert!(matches!(sock.recv(&mut buf), Err(nb::Error::WouldBlock)));
}
