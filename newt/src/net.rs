use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Bluetooth LE address subtype
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
pub enum BleAddrType {
  /// Public device address
  Public,
  /// Static random address
  RandomStatic,
  /// Resolvable private address
  RandomResolvable,
  /// Non-resolvable private address
  RandomNonResolvable,
}

/// A network address as this stack models it: a tagged union over
/// the address families a constrained device may talk across.
///
/// Ports are optional (a Bluetooth address has none, and some
/// comparisons don't care).
///
/// # Equality
/// Two addresses are equal when family, raw bytes and port all
/// match, with one cross-family allowance: an IPv6 address that is
/// an IPv4-mapped address (first 80 bits zero, next 16 bits 0xFFFF)
/// equals the IPv4 address held in its final 32 bits. Use
/// [`Addr::eq_ignoring_port`] when port equality should not factor in.
#[derive(Debug, Clone, Copy, Eq)]
pub enum Addr {
  /// IPv4
  V4 {
    /// Raw address bytes, network order
    ip: [u8; 4],
    /// Optional UDP port
    port: Option<u16>,
  },
  /// IPv6
  V6 {
    /// Raw address bytes, network order
    ip: [u8; 16],
    /// Optional UDP port
    port: Option<u16>,
  },
  /// Bluetooth LE
  Bluetooth {
    /// Raw 48-bit device address
    mac: [u8; 6],
    /// See [`BleAddrType`]
    ty: BleAddrType,
  },
}

impl Addr {
  /// If this is an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`),
  /// produce the equivalent [`Addr::V4`].
  pub fn unmap(self) -> Addr {
    match self {
      | Addr::V6 { ip, port }
        if ip[..10].iter().all(|b| *b == 0) && ip[10] == 0xFF && ip[11] == 0xFF =>
      {
        Addr::V4 { ip: [ip[12], ip[13], ip[14], ip[15]],
                   port }
      },
      | other => other,
    }
  }

  /// The port, if this address has one
  pub fn port(&self) -> Option<u16> {
    match self {
      | Addr::V4 { port, .. } | Addr::V6 { port, .. } => *port,
      | Addr::Bluetooth { .. } => None,
    }
  }

  /// Compare everything but the port
  pub fn eq_ignoring_port(&self, other: &Addr) -> bool {
    match (self.unmap(), other.unmap()) {
      | (Addr::V4 { ip: a, .. }, Addr::V4 { ip: b, .. }) => a == b,
      | (Addr::V6 { ip: a, .. }, Addr::V6 { ip: b, .. }) => a == b,
      | (Addr::Bluetooth { mac: a, ty: a_ty },
         Addr::Bluetooth { mac: b, ty: b_ty }) => a == b && a_ty == b_ty,
      | _ => false,
    }
  }
}

impl PartialEq for Addr {
  fn eq(&self, other: &Self) -> bool {
    self.eq_ignoring_port(other) && self.port() == other.port()
  }
}

// hash over the unmapped normal form so v4-mapped v6 addresses
// land in the same bucket as the v4 they equal
impl core::hash::Hash for Addr {
  fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
    match self.unmap() {
      | Addr::V4 { ip, port } => {
        state.write_u8(4);
        state.write(&ip);
        port.hash(state);
      },
      | Addr::V6 { ip, port } => {
        state.write_u8(6);
        state.write(&ip);
        port.hash(state);
      },
      | Addr::Bluetooth { mac, ty } => {
        state.write_u8(b'b');
        state.write(&mac);
        ty.hash(state);
      },
    }
  }
}

impl From<SocketAddr> for Addr {
  fn from(sa: SocketAddr) -> Self {
    match sa {
      | SocketAddr::V4(v4) => Addr::V4 { ip: v4.ip().octets(),
                                         port: Some(v4.port()) },
      | SocketAddr::V6(v6) => Addr::V6 { ip: v6.ip().octets(),
                                         port: Some(v6.port()) },
    }
  }
}

impl TryFrom<Addr> for SocketAddr {
  type Error = crate::error::ErrorKind;

  fn try_from(addr: Addr) -> Result<Self, Self::Error> {
    match addr {
      | Addr::V4 { ip, port: Some(port) } => {
        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
      },
      | Addr::V6 { ip, port: Some(port) } => {
        Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
      },
      | Addr::V4 { port: None, .. } | Addr::V6 { port: None, .. } => {
        Err(crate::error::ErrorKind::InvalidArgument)
      },
      | Addr::Bluetooth { .. } => Err(crate::error::ErrorKind::Unsupported),
    }
  }
}

/// Do two socket addresses name the same endpoint?
///
/// Routes through [`Addr`] so that an IPv4-mapped IPv6 source
/// (dual-stack sockets report these) matches the IPv4 destination
/// the request went to.
pub fn same_endpoint(a: SocketAddr, b: SocketAddr) -> bool {
  Addr::from(a) == Addr::from(b)
}

/// Data that came from, or is bound for, a network socket
#[derive(PartialEq, PartialOrd, Eq, Ord, Hash, Debug, Clone, Copy)]
pub struct Addrd<T>(pub T, pub SocketAddr);

impl<T> Addrd<T> {
  /// Borrow the contents of this Addressed
  pub fn as_ref(&self) -> Addrd<&T> {
    Addrd(self.data(), self.addr())
  }

  /// Discard the socket and get the data in this Addressed
  pub fn unwrap(self) -> T {
    self.0
  }

  /// Map the data contained in this Addressed
  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Addrd<R> {
    Addrd(f(self.0), self.1)
  }

  /// Borrow the contents of the addressed item
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Mutably borrow the contents of the addressed item
  pub fn data_mut(&mut self) -> &mut T {
    &mut self.0
  }

  /// Copy the socket address for the data
  pub fn addr(&self) -> SocketAddr {
    self.1
  }

  /// Turn the entire structure into something else
  pub fn fold<R>(self, f: impl FnOnce(T, SocketAddr) -> R) -> R {
    f(self.0, self.1)
  }
}

impl<T> AsMut<T> for Addrd<T> {
  fn as_mut(&mut self) -> &mut T {
    &mut self.0
  }
}

/// Buffer type used for receiving and sending datagrams.
pub type Dgram = tinyvec::ArrayVec<[u8; 1152]>;

/// A network interface as seen by the multicast machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetInterface {
  /// OS interface index (0 = "let the OS pick")
  pub index: u32,
  /// An address assigned to the interface, used to select it
  /// for IPv4 multicast sends
  pub addr: IpAddr,
  /// Is the interface up & running?
  pub running: bool,
  /// Does the interface support multicast?
  pub multicast: bool,
}

impl NetInterface {
  /// The "unspecified" pseudo-interface: the OS routes multicast
  /// through whatever interface it deems right.
  pub fn unspecified() -> Self {
    NetInterface { index: 0,
                   addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                   running: true,
                   multicast: true }
  }
}

/// A CoAP datagram socket.
///
/// This mirrors the Udp socket traits in embedded-nal, but allows us
/// to implement them for foreign types (like `std::net::UdpSocket`)
/// and for sockets that encrypt in flight (see [`crate::secure`]).
pub trait Socket: Sized {
  /// The error yielded by socket operations
  type Error: core::fmt::Debug;

  /// Get the local address this socket was created from
  fn local_addr(&self) -> SocketAddr;

  /// Bind the socket to an address, without doing any spooky magic things like switching to non-blocking mode
  /// or auto-detecting and joining multicast groups.
  ///
  /// Implementors of `bind_raw` should yield a socket in a
  /// non-blocking state.
  fn bind_raw(addr: SocketAddr) -> Result<Self, Self::Error>;

  /// Binds the socket to a local address.
  ///
  /// This function will automatically invoke [`Socket::join_multicast`] if the address
  /// is a multicast address, and should yield a non-blocking socket.
  fn bind(addr: SocketAddr) -> Result<Self, Self::Error> {
    Self::bind_raw(addr).and_then(|sock| match addr.ip() {
                          | ip if ip.is_multicast() => {
                            sock.join_multicast(0, ip).map(|_| sock)
                          },
                          | _ => Ok(sock),
                        })
  }

  /// Send a message to a remote address, yielding the number of
  /// bytes that went out on the wire
  fn send(&self, msg: Addrd<&[u8]>) -> nb::Result<usize, Self::Error>;

  /// Send a message to a remote address, bypassing DTLS.
  ///
  /// If the socket type implementing this trait does not participate
  /// in DTLS, then this is just an alias for `send`.
  fn insecure_send(&self, msg: Addrd<&[u8]>) -> nb::Result<usize, Self::Error> {
    self.send(msg)
  }

  /// Pull a buffered datagram from the socket, along with the address to the sender.
  ///
  /// It is expected that (like [`std::net::UdpSocket`]) if the message is larger
  /// than the buffer, those bytes are dropped and not considered an error condition.
  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error>;

  /// Look at the message at the top of the receipt queue without
  /// clearing it.
  fn peek(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error>;

  /// Look at who the sender of the message at the top of the receipt queue
  /// is.
  ///
  /// This should return [`nb::Error::WouldBlock`] if there is no message available.
  fn peek_addr(&self) -> nb::Result<SocketAddr, Self::Error> {
    self.peek(&mut []).map(|Addrd(_, addr)| addr)
  }

  /// Poll the socket for a datagram
  fn poll(&self) -> Result<Option<Addrd<Dgram>>, Self::Error> {
    let mut buf = Dgram::from([0u8; 1152]);
    let recvd = self.recv(&mut buf);

    match recvd {
      | Ok(Addrd(n, addr)) => Ok(Some(Addrd(buf.into_iter().take(n).collect(), addr))),
      | Err(nb::Error::WouldBlock) => Ok(None),
      | Err(nb::Error::Other(e)) => Err(e),
    }
  }

  /// Join a multicast group on a given interface
  /// (index 0 lets the OS pick)
  fn join_multicast(&self, ifindex: u32, group: IpAddr) -> Result<(), Self::Error>;

  /// Ask the platform to start (or stop) watching this socket for
  /// readability, invoking the read callback registered at socket
  /// construction.
  ///
  /// The default implementation does nothing; sockets polled in a
  /// loop don't need monitors.
  fn set_read_monitor(&self, _on: bool) -> Result<(), Self::Error> {
    Ok(())
  }

  /// Same as [`Socket::set_read_monitor`], for writability.
  fn set_write_monitor(&self, _on: bool) -> Result<(), Self::Error> {
    Ok(())
  }
}

// a socket shared between an engine and the layers beside it
// (e.g. the OIC security device and the Core both holding the same
// DTLS wrapper)
impl<T: Socket> Socket for std::sync::Arc<T> {
  type Error = T::Error;

  fn local_addr(&self) -> SocketAddr {
    T::local_addr(self)
  }

  fn bind_raw(addr: SocketAddr) -> Result<Self, Self::Error> {
    T::bind_raw(addr).map(std::sync::Arc::new)
  }

  fn send(&self, msg: Addrd<&[u8]>) -> nb::Result<usize, Self::Error> {
    T::send(self, msg)
  }

  fn insecure_send(&self, msg: Addrd<&[u8]>) -> nb::Result<usize, Self::Error> {
    T::insecure_send(self, msg)
  }

  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    T::recv(self, buffer)
  }

  fn peek(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    T::peek(self, buffer)
  }

  fn join_multicast(&self, ifindex: u32, group: IpAddr) -> Result<(), Self::Error> {
    T::join_multicast(self, ifindex, group)
  }

  fn set_read_monitor(&self, on: bool) -> Result<(), Self::Error> {
    T::set_read_monitor(self, on)
  }

  fn set_write_monitor(&self, on: bool) -> Result<(), Self::Error> {
    T::set_write_monitor(self, on)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn v4(ip: [u8; 4], port: Option<u16>) -> Addr {
    Addr::V4 { ip, port }
  }

  #[test]
  fn v4_mapped_v6_equals_v4() {
    let mut mapped = [0u8; 16];
    mapped[10] = 0xFF;
    mapped[11] = 0xFF;
    mapped[12..].copy_from_slice(&[192, 168, 0, 1]);

    let v6 = Addr::V6 { ip: mapped,
                        port: Some(5683) };

    assert_eq!(v6, v4([192, 168, 0, 1], Some(5683)));
    assert_ne!(v6, v4([192, 168, 0, 2], Some(5683)));
    assert_ne!(v6, v4([192, 168, 0, 1], Some(5684)));
    assert!(v6.eq_ignoring_port(&v4([192, 168, 0, 1], Some(5684))));
  }

  #[test]
  fn plain_v6_is_not_v4() {
    let v6 = Addr::V6 { ip: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 192, 168, 0, 1],
                        port: Some(5683) };
    assert_ne!(v6, v4([192, 168, 0, 1], Some(5683)));
  }

  #[test]
  fn ble_equality_includes_subtype() {
    let a = Addr::Bluetooth { mac: [1, 2, 3, 4, 5, 6],
                              ty: BleAddrType::Public };
    let b = Addr::Bluetooth { mac: [1, 2, 3, 4, 5, 6],
                              ty: BleAddrType::RandomStatic };
    assert_ne!(a, b);
    assert_eq!(a, a);
  }

  #[test]
  fn same_endpoint_sees_through_dual_stack() {
    let sent_to: SocketAddr = "192.168.0.1:5683".parse().unwrap();
    let replied_from: SocketAddr = "[::ffff:192.168.0.1]:5683".parse().unwrap();
    assert!(same_endpoint(sent_to, replied_from));
  }
}
