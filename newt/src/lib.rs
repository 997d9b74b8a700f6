//! `newt` is a Rust CoAP runtime for constrained-device fleets that
//! need secure onboarding, built around three pieces:
//! - a reliable request/response engine ([`core`]) speaking RFC 7252
//!   CoAP with observe (RFC 7641) and multicast discovery
//! - a DTLS 1.2 PSK transport wrapper ([`secure`]) that slots beneath
//!   the engine without the engine noticing
//! - the OIC "Just-Works" device-ownership dance ([`sec`]): an unowned
//!   device and a claiming client meet over anonymous ECDH, mint a
//!   shared owner key from the handshake, and re-meet over PSK
//!
//! ## Platform independence
//! The runtime never blocks and owns no event loop; it consumes the
//! [`reactor::Reactor`] and [`net::Socket`] interfaces and suspends
//! only at socket I/O and timer expiry. Hosted platforms get
//! batteries-included implementations in [`std`].
//!
//! ## CoAP
//! CoAP is an application-level network protocol that copies the semantics of HTTP
//! to an environment conducive to **constrained** devices. (weak hardware, small battery capacity, etc.)
//!
//! This means that you can write and run two-way RESTful communication
//! between devices very similarly to the networking semantics you are
//! most likely very familiar with.

// style
#![allow(clippy::unused_unit)]
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]

#[cfg(test)]
pub(crate) mod test;

pub(crate) mod logging;

/// Blocking rust CoAP client
pub mod blocking;

/// errors common to the whole runtime
pub mod error;

/// customizable retrying of fallible operations
pub mod retry;

/// low-level coap behavior
pub mod core;

/// credential storage
pub mod cred;

/// DTLS-secured sockets
pub mod secure;

/// OIC device ownership & provisioning
pub mod sec;

/// resources served over coap
pub mod server;

/// the event loop interface this runtime runs on
pub mod reactor;

/// network abstractions
pub mod net;

/// time abstractions
pub mod time;

/// configuring runtime behavior
pub mod config;

/// `std`-only newt stuff
pub mod std;

/// Helper constants and functions for creating multicast addresses
pub mod multicast {
  use ::std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

  /// IPv4 "All CoAP devices" multicast address.
  ///
  /// If using multicast to discover devices, it's recommended
  /// that you use this address with a port specific to your application.
  pub const ALL_COAP_DEVICES_IP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);

  /// IPv6 link-local "All OCF devices" multicast address (`ff02::fd`)
  pub const ALL_OCF_DEVICES_LINK_LOCAL: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x00fd);

  /// IPv6 site-local "All OCF devices" multicast address (`ff05::fd`)
  pub const ALL_OCF_DEVICES_SITE_LOCAL: Ipv6Addr =
    Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0x00fd);

  /// Create a SocketAddr (IP + port) with the [`ALL_COAP_DEVICES_IP`] address
  pub const fn all_coap_devices(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(ALL_COAP_DEVICES_IP, port))
  }

  /// Create a SocketAddr (IP + port) with the link-local discovery group
  pub const fn link_local_discovery(port: u16) -> SocketAddr {
    SocketAddr::V6(SocketAddrV6::new(ALL_OCF_DEVICES_LINK_LOCAL, port, 0, 0))
  }

  /// Create a SocketAddr (IP + port) with the site-local discovery group
  pub const fn site_local_discovery(port: u16) -> SocketAddr {
    SocketAddr::V6(SocketAddrV6::new(ALL_OCF_DEVICES_SITE_LOCAL, port, 0, 0))
  }

  /// The discovery groups a server joins on every
  /// running+multicast interface
  pub const DISCOVERY_GROUPS: [IpAddr; 3] = [IpAddr::V4(ALL_COAP_DEVICES_IP),
                                             IpAddr::V6(ALL_OCF_DEVICES_LINK_LOCAL),
                                             IpAddr::V6(ALL_OCF_DEVICES_SITE_LOCAL)];
}
