use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use socket2::{InterfaceIndexOrAddress, SockRef};

use crate::net::{Addrd, NetInterface, Socket};

pub(crate) fn io_to_nb(err: io::Error) -> nb::Error<io::Error> {
  match err.kind() {
    | io::ErrorKind::WouldBlock => nb::Error::WouldBlock,
    | _ => nb::Error::Other(err),
  }
}

/// [`std::net::UdpSocket`] dressed up as a [`Socket`], with the
/// multicast behavior constrained stacks expect:
///
/// - a multicast send is duplicated over every running+multicast
///   interface this socket knows about, rotating the outgoing
///   interface per iteration and restoring it afterwards. The send
///   counts as successful if at least one interface took it.
/// - joined groups are remembered so that [`UdpSocket::rejoin_groups`]
///   can be called from an interface-change notification.
///
/// The interface list defaults to the single "unspecified" interface
/// (the OS picks); platforms that can enumerate interfaces feed the
/// real list through [`UdpSocket::set_interfaces`].
#[derive(Debug)]
pub struct UdpSocket {
  sock: std::net::UdpSocket,
  ifaces: Vec<NetInterface>,
  groups: Mutex<Vec<(u32, IpAddr)>>,
}

impl UdpSocket {
  /// Replace the interface list used for multicast sends & joins
  pub fn set_interfaces(&mut self, ifaces: Vec<NetInterface>) {
    self.ifaces = ifaces;
  }

  /// Re-join every multicast group this socket has joined.
  ///
  /// Call on interface-change notifications; joins that now fail are
  /// logged and skipped (the interface may be mid-teardown).
  pub fn rejoin_groups(&self) {
    let groups = self.groups.lock().unwrap().clone();
    for (ifindex, group) in groups {
      if let Err(e) = self.join_group_raw(ifindex, group) {
        log::warn!("rejoin of {:?} on if{} failed: {:?}", group, ifindex, e);
      }
    }
  }

  fn join_group_raw(&self, ifindex: u32, group: IpAddr) -> io::Result<()> {
    let sock = SockRef::from(&self.sock);
    match group {
      | IpAddr::V4(group) => {
        sock.join_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(ifindex))
      },
      | IpAddr::V6(group) => sock.join_multicast_v6(&group, ifindex),
    }
  }

  fn send_multicast(&self, msg: Addrd<&[u8]>) -> nb::Result<usize, io::Error> {
    let sock = SockRef::from(&self.sock);
    let mut sent: Option<usize> = None;
    let mut would_block = false;

    for iface in self.ifaces
                     .iter()
                     .filter(|i| i.running && i.multicast)
    {
      let selected = match (msg.addr().ip(), iface.addr) {
        | (IpAddr::V4(_), IpAddr::V4(if_addr)) => sock.set_multicast_if_v4(&if_addr),
        | (IpAddr::V4(_), _) => sock.set_multicast_if_v4(&Ipv4Addr::UNSPECIFIED),
        | (IpAddr::V6(_), _) => sock.set_multicast_if_v6(iface.index),
      };

      if let Err(e) = selected {
        log::warn!("could not select if{} for multicast: {:?}", iface.index, e);
        continue;
      }

      match self.sock.send_to(msg.data(), msg.addr()) {
        | Ok(n) => sent = Some(n),
        | Err(e) if e.kind() == io::ErrorKind::WouldBlock => would_block = true,
        | Err(e) => log::warn!("multicast send on if{} failed: {:?}", iface.index, e),
      }
    }

    // restore the default outgoing interface
    match msg.addr().ip() {
      | IpAddr::V4(_) => sock.set_multicast_if_v4(&Ipv4Addr::UNSPECIFIED).ok(),
      | IpAddr::V6(_) => sock.set_multicast_if_v6(0).ok(),
    };

    match (sent, would_block) {
      | (Some(n), _) => Ok(n),
      | (None, true) => Err(nb::Error::WouldBlock),
      | (None, false) => {
        Err(nb::Error::Other(io::Error::new(io::ErrorKind::Other,
                                            "no interface accepted the multicast datagram")))
      },
    }
  }
}

impl Socket for UdpSocket {
  type Error = io::Error;

  fn local_addr(&self) -> SocketAddr {
    self.sock.local_addr().unwrap()
  }

  fn bind_raw(addr: SocketAddr) -> Result<Self, Self::Error> {
    let sock = std::net::UdpSocket::bind(addr)?;
    sock.set_nonblocking(true)?;
    Ok(Self { sock,
              ifaces: vec![NetInterface::unspecified()],
              groups: Mutex::new(vec![]) })
  }

  fn send(&self, msg: Addrd<&[u8]>) -> nb::Result<usize, Self::Error> {
    if msg.addr().ip().is_multicast() {
      self.send_multicast(msg)
    } else {
      self.sock
          .send_to(msg.data(), msg.addr())
          .map_err(io_to_nb)
    }
  }

  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    self.sock
        .recv_from(buffer)
        .map(|(n, addr)| Addrd(n, addr))
        .map_err(io_to_nb)
  }

  fn peek(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    self.sock
        .peek_from(buffer)
        .map(|(n, addr)| Addrd(n, addr))
        .map_err(io_to_nb)
  }

  fn join_multicast(&self, ifindex: u32, group: IpAddr) -> Result<(), Self::Error> {
    self.join_group_raw(ifindex, group)?;
    self.groups.lock().unwrap().push((ifindex, group));
    Ok(())
  }
}
