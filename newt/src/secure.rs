//! A datagram socket wrapped in DTLS 1.2.
//!
//! Higher layers see the same [`Socket`] interface they'd use on a
//! clear socket; the wire sees ciphertext. Plaintext sends are
//! queued, driven through the handshake state machine, and wiped
//! after encryption; inbound ciphertext advances the state machine
//! (possibly emitting handshake flights) or lands as plaintext in a
//! bounded read queue.
//!
//! Two ciphersuite regimes matter to the ownership dance upstairs:
//! PSK-AES128-CCM8 for everyday traffic, and anonymous ECDH enabled
//! only while an unowned device is being claimed (see [`crate::sec`]).

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use embedded_time::duration::Milliseconds;
use openssl::ex_data::Index;
use openssl::ssl::{ErrorCode,
                   HandshakeError,
                   MidHandshakeSslStream,
                   Ssl,
                   SslContext,
                   SslContextBuilder,
                   SslMethod,
                   SslStream,
                   SslVerifyMode};
use zeroize::Zeroizing;

use crate::cred::{IDENTITY_LEN, PSK_LEN};
use crate::error::{Classify, ErrorKind};
use crate::net::{Addrd, Socket};
use crate::retry::{Attempts, RetryTimer, Strategy, YouShould};

/// Secure socket result
pub type Result<T> = ::core::result::Result<T, Error>;

/// Items allowed to sit in each of the read & write queues
/// before new ones are dropped with a warning
const QUEUE_CAP: usize = 4;

#[doc(inline)]
pub use error::*;
mod error {
  use super::*;

  /// I/O errors that sockets secured by DTLS can encounter
  #[derive(Debug)]
  pub enum Error {
    /// There was an issue within openssl - this is more likely
    /// to be a bug in `newt` than a bug in `openssl`.
    Ssl(openssl::ssl::Error),
    /// There was an IO error raised by the underlying socket
    Io(std::io::Error),
    /// A message was outbound to (or an operation named) an address
    /// that we haven't established a connection with
    NotConnected,
    /// The read or write queue hit [`QUEUE_CAP`] and the item was dropped
    QueueFull,
    /// The operation would block
    WouldBlock,
    /// The operation isn't available on a secured socket
    /// (e.g. multicast)
    Unsupported,
  }

  impl From<nb::Error<Error>> for Error {
    fn from(e: nb::Error<Self>) -> Self {
      match e {
        | nb::Error::WouldBlock => Self::WouldBlock,
        | nb::Error::Other(e) => e,
      }
    }
  }

  impl Error {
    pub(super) fn into_nb(self) -> nb::Error<Self> {
      match self {
        | Self::Io(io) if io.kind() == std::io::ErrorKind::WouldBlock => nb::Error::WouldBlock,
        | Self::Ssl(e)
          if e.io_error()
              .map(|io| io.kind() == std::io::ErrorKind::WouldBlock)
              .unwrap_or_default() =>
        {
          nb::Error::WouldBlock
        },
        | Self::WouldBlock => nb::Error::WouldBlock,
        | e => nb::Error::Other(e),
      }
    }
  }

  impl From<openssl::ssl::Error> for Error {
    fn from(e: openssl::ssl::Error) -> Self {
      Self::Ssl(e)
    }
  }

  impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
      Self::Ssl(e.into())
    }
  }

  impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
      Self::Io(e)
    }
  }

  impl Classify for Error {
    fn kind(&self) -> ErrorKind {
      match self {
        | Error::Ssl(_) => ErrorKind::SecurityFailure,
        | Error::Io(_) => ErrorKind::IoError,
        | Error::NotConnected => ErrorKind::NotConnected,
        | Error::QueueFull => ErrorKind::QueueFull,
        | Error::WouldBlock => ErrorKind::IoError,
        | Error::Unsupported => ErrorKind::Unsupported,
      }
    }
  }
}

/// Ciphersuites the wrapper can be told to offer for the next
/// handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
  /// `TLS_PSK_WITH_AES_128_CCM_8`, the everyday suite once a
  /// device is owned
  PskAes128Ccm8,
  /// `TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8`; defined for raw-public-key
  /// deployments, not required by the ownership flow
  EcdheEcdsaAes128Ccm8,
}

impl Cipher {
  fn cipher_list(&self) -> &'static str {
    match self {
      | Cipher::PskAes128Ccm8 => "PSK-AES128-CCM8",
      | Cipher::EcdheEcdsaAes128Ccm8 => "ECDHE-ECDSA-AES128-CCM8",
    }
  }
}

// Anonymous ECDH is only on the table while an unowned device is
// being claimed. OpenSSL >= 1.1 banishes anonymous suites above
// security level 0, hence the explicit SECLEVEL.
const ANON_ECDH_CIPHER_LIST: &str = "AECDH-AES128-SHA256:AECDH-AES128-SHA:@SECLEVEL=0";

/// Where the wrapper gets identities and keys when the DTLS library
/// asks for them mid-handshake.
///
/// `buf` is the library's buffer; implementations write the bytes and
/// return how many. Identities are [`IDENTITY_LEN`] bytes; keys are
/// [`PSK_LEN`] bytes. Errors become fatal handshake alerts
/// (INTERNAL_ERROR, or ILLEGAL_PARAMETER for
/// [`ErrorKind::NoMatch`]/[`ErrorKind::InvalidArgument`]).
pub trait CredLookup {
  /// Which identity should we present to `peer`?
  fn get_id(&self, peer: SocketAddr, buf: &mut [u8]) -> core::result::Result<usize, ErrorKind>;

  /// What key goes with `identity`?
  fn get_psk(&self, identity: &[u8], buf: &mut [u8]) -> core::result::Result<usize, ErrorKind>;
}

/// Which side of the handshake this socket plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
  Server,
  Client,
}

struct TlsConfig {
  cipher: Cipher,
  anon_ecdh: bool,
  creds: Option<Arc<dyn CredLookup + Send + Sync>>,
}

/// # Peer connections
///
/// Implementations of the io stream traits ([`Read`], [`Write`])
/// over a shared datagram socket, scoped to a single peer.
///
/// You probably don't need to refer to these directly, but you can
/// if you've walked yourself into a deep hole
pub mod conn {
  use super::*;

  fn sock_err_to_io<E: core::fmt::Debug>(e: nb::Error<E>) -> io::Error {
    match e {
      | nb::Error::WouldBlock => io::Error::from(io::ErrorKind::WouldBlock),
      | nb::Error::Other(e) => io::Error::new(io::ErrorKind::Other, format!("{:?}", e)),
    }
  }

  /// A raw unsecured datagram stream scoped to one remote address.
  ///
  /// Writes are buffered until `flush`, which emits a single
  /// datagram; reads only see datagrams from the scoped peer and
  /// yield `WouldBlock` otherwise.
  pub struct PeerIo<S> {
    sock: Arc<S>,
    addr: SocketAddr,
    tx_buf: Vec<u8>,
  }

  impl<S> core::fmt::Debug for PeerIo<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
      write!(f, "PeerIo {{ addr: {} }}", self.addr)
    }
  }

  impl<S: Socket> PeerIo<S> {
    pub(super) fn new(sock: Arc<S>, addr: SocketAddr) -> Self {
      Self { sock,
             addr,
             tx_buf: vec![] }
    }
  }

  impl<S: Socket> io::Write for PeerIo<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.tx_buf.extend(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      let sent = self.sock
                     .send(Addrd(self.tx_buf.as_slice(), self.addr))
                     .map(|_| ())
                     .map_err(sock_err_to_io);
      // lost datagrams are the DTLS retransmit machinery's problem,
      // not ours; the buffer never survives a flush
      self.tx_buf.clear();
      sent
    }
  }

  impl<S: Socket> io::Read for PeerIo<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      match self.sock.peek_addr() {
        | Ok(rx_addr) if rx_addr == self.addr => self.sock
                                                     .recv(buf)
                                                     .map(|Addrd(n, _)| n)
                                                     .map_err(sock_err_to_io),
        // The message in the socket is for someone else,
        // so we should yield
        | Ok(_) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        | Err(e) => Err(sock_err_to_io(e)),
      }
    }
  }
}

use conn::PeerIo;

enum Session<S: Socket> {
  Established(SslStream<PeerIo<S>>),
  Establishing(MidHandshakeSslStream<PeerIo<S>>),
}

type Sessions<S> = HashMap<SocketAddr, Session<S>>;

/// A datagram socket secured by DTLS.
///
/// Wraps any [`Socket`] implementor; see the module docs for the
/// queueing discipline.
pub struct SecureSocket<S: Socket> {
  sock: Arc<S>,
  role: Role,
  cfg: Mutex<TlsConfig>,
  ctx: Mutex<Option<SslContext>>,
  sessions: Mutex<Sessions<S>>,
  // clear-on-drop applies to both queues; inbound plaintext can be
  // just as secret as outbound
  rx_q: Mutex<VecDeque<Addrd<Zeroizing<Vec<u8>>>>>,
  tx_q: Mutex<VecDeque<Addrd<Zeroizing<Vec<u8>>>>>,
  #[allow(clippy::type_complexity)]
  on_read: Mutex<Option<Box<dyn Fn(&[u8], SocketAddr) -> bool + Send>>>,
  pending_err: Mutex<Option<Error>>,
  clock: crate::std::Clock,
  hs_retry: Mutex<Option<RetryTimer<crate::std::Clock>>>,
  peer_ix: Index<Ssl, SocketAddr>,
}

impl<S: Socket> core::fmt::Debug for SecureSocket<S> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "SecureSocket {{ role: {:?}, /* fields hidden */ }}", self.role)
  }
}

impl<S: Socket> SecureSocket<S> {
  fn new(role: Role, sock: S) -> Result<Self> {
    Ok(Self { sock: Arc::new(sock),
              role,
              cfg: Mutex::new(TlsConfig { cipher: Cipher::PskAes128Ccm8,
                                          anon_ecdh: false,
                                          creds: None }),
              ctx: Mutex::new(None),
              sessions: Mutex::new(HashMap::new()),
              rx_q: Mutex::new(VecDeque::new()),
              tx_q: Mutex::new(VecDeque::new()),
              on_read: Mutex::new(None),
              pending_err: Mutex::new(None),
              clock: crate::std::Clock::new(),
              hs_retry: Mutex::new(None),
              peer_ix: Ssl::new_ex_index::<SocketAddr>()? })
  }

  /// Create a new secure socket that will accept handshakes
  /// initiated by remote peers
  pub fn new_server(sock: S) -> Result<Self> {
    Self::new(Role::Server, sock)
  }

  /// Create a new secure socket that will initiate handshakes
  /// with remote peers on first send
  pub fn new_client(sock: S) -> Result<Self> {
    Self::new(Role::Client, sock)
  }

  /// Borrow the wrapped socket
  pub fn inner(&self) -> &S {
    &self.sock
  }

  /// Route the DTLS library's identity & key lookups through `creds`.
  ///
  /// Affects handshakes started after this call.
  pub fn set_credential_callbacks(&self, creds: Arc<dyn CredLookup + Send + Sync>) {
    self.cfg.lock().unwrap().creds = Some(creds);
    self.ctx.lock().unwrap().take();
  }

  /// Choose the ciphersuite offered on the next handshake
  pub fn set_handshake_cipher(&self, cipher: Cipher) {
    self.cfg.lock().unwrap().cipher = cipher;
    self.ctx.lock().unwrap().take();
  }

  /// Allow (or stop allowing) anonymous ECDH handshakes.
  ///
  /// Only ever enabled while ownership of this device is being
  /// transferred; [`crate::sec`] flips this off again the moment an
  /// owner is registered.
  pub fn set_anonymous_ecdh_enabled(&self, on: bool) {
    self.cfg.lock().unwrap().anon_ecdh = on;
    self.ctx.lock().unwrap().take();
  }

  /// Register a callback to run as plaintext datagrams arrive.
  ///
  /// Returning `true` consumes the item; returning `false` leaves it
  /// queued for a later [`Socket::recv`].
  pub fn set_on_read(&self, f: Box<dyn Fn(&[u8], SocketAddr) -> bool + Send>) {
    *self.on_read.lock().unwrap() = Some(f);
  }

  /// Does `peer` have a completed handshake?
  pub fn connected(&self, peer: SocketAddr) -> bool {
    matches!(self.sessions.lock().unwrap().get(&peer),
             Some(Session::Established(_)))
  }

  /// Close the session with `peer`, notifying them (close_notify)
  /// if the handshake had completed. Idempotent.
  pub fn close(&self, peer: SocketAddr) {
    match self.sessions.lock().unwrap().remove(&peer) {
      | Some(Session::Established(mut stream)) => {
        stream.shutdown().ok();
        log::debug!("closed session with {}", peer);
      },
      | Some(Session::Establishing(_)) => {
        log::debug!("abandoned mid-handshake session with {}", peer);
      },
      | None => (),
    }
  }

  /// Derive key material from the completed handshake with `peer`.
  ///
  /// `label` is passed verbatim to the TLS exporter (RFC 5705);
  /// `random1` followed by `random2` rides along as exporter
  /// context. This is how the ownership dance mints the owner PSK on
  /// both sides without it ever crossing the wire.
  pub fn prf_keyblock(&self,
                      peer: SocketAddr,
                      label: &str,
                      random1: &[u8],
                      random2: &[u8],
                      out: &mut [u8])
                      -> Result<()> {
    let context = [random1, random2].concat();

    match self.sessions.lock().unwrap().get(&peer) {
      | Some(Session::Established(stream)) => {
        stream.ssl()
              .export_keying_material(out, label, Some(&context))
              .map_err(Error::from)
      },
      | _ => Err(Error::NotConnected),
    }
  }

  /// If a handshake is mid-flight, how long (in milliseconds) until
  /// its next retransmission is due? `None` means no timer needs to
  /// be armed.
  pub fn retransmit_in_millis(&self) -> Option<u64> {
    let has_handshake = self.sessions
                            .lock()
                            .unwrap()
                            .values()
                            .any(|s| matches!(s, Session::Establishing(_)));

    if !has_handshake {
      return None;
    }

    use embedded_time::Clock;
    let now = self.clock.try_now().ok()?;
    self.hs_retry
        .lock()
        .unwrap()
        .as_ref()
        .map(|t| t.millis_until_retry(now))
  }

  /// Drive any mid-flight handshakes whose retransmission is due.
  ///
  /// Call when the timer armed from [`Self::retransmit_in_millis`]
  /// fires; also called internally after every socket event.
  pub fn handle_timeout(&self) {
    self.check_retransmit();
  }

  fn ctx(&self) -> Result<SslContext> {
    let mut ctx = self.ctx.lock().unwrap();
    if ctx.is_none() {
      *ctx = Some(build_ctx(self.role, &self.cfg.lock().unwrap(), self.peer_ix)?);
    }
    Ok(ctx.clone().unwrap())
  }

  fn start_handshake(&self, sessions: &mut Sessions<S>, addr: SocketAddr) -> Result<()> {
    let ctx = self.ctx()?;
    let mut ssl = Ssl::new(&ctx)?;
    ssl.set_ex_data(self.peer_ix, addr);

    let io = PeerIo::new(self.sock.clone(), addr);
    let attempt = match self.role {
      | Role::Client => ssl.connect(io),
      | Role::Server => ssl.accept(io),
    };

    match attempt {
      | Ok(stream) => {
        log::debug!("handshake with {} completed immediately", addr);
        sessions.insert(addr, Session::Established(stream));
        self.flush_tx(sessions);
        Ok(())
      },
      | Err(HandshakeError::WouldBlock(mid)) => {
        log::trace!("handshake with {} in flight", addr);
        sessions.insert(addr, Session::Establishing(mid));
        Ok(())
      },
      | Err(HandshakeError::SetupFailure(e)) => Err(e.into()),
      | Err(HandshakeError::Failure(mid)) => {
        log::error!("handshake with {} failed: {:?}", addr, mid.error());
        Err(mid.into_error().into())
      },
    }
  }

  fn continue_handshake(&self,
                        sessions: &mut Sessions<S>,
                        addr: SocketAddr,
                        mid: MidHandshakeSslStream<PeerIo<S>>) {
    match mid.handshake() {
      | Ok(stream) => {
        log::debug!("handshake with {} complete", addr);
        sessions.insert(addr, Session::Established(stream));
        self.flush_tx(sessions);
      },
      | Err(HandshakeError::WouldBlock(mid)) => {
        sessions.insert(addr, Session::Establishing(mid));
      },
      | Err(HandshakeError::SetupFailure(e)) => {
        log::error!("handshake with {} died: {:?}", addr, e);
        *self.pending_err.lock().unwrap() = Some(e.into());
      },
      | Err(HandshakeError::Failure(mid)) => {
        // fatal alert; the wrapped socket survives, the session doesn't
        log::error!("handshake with {} failed: {:?}", addr, mid.error());
        *self.pending_err.lock().unwrap() = Some(mid.into_error().into());
      },
    }
  }

  /// Feed one inbound datagram (if any) to the state machine.
  ///
  /// Returns `true` when a datagram was consumed, so callers can
  /// loop until quiescent.
  fn pump(&self) -> Result<bool> {
    let addr = match self.sock.peek_addr() {
      | Ok(addr) => addr,
      | Err(nb::Error::WouldBlock) => {
        self.check_retransmit();
        return Ok(false);
      },
      | Err(nb::Error::Other(e)) => {
        return Err(Error::Io(io::Error::new(io::ErrorKind::Other, format!("{:?}", e))));
      },
    };

    let mut sessions = self.sessions.lock().unwrap();

    match sessions.remove(&addr) {
      | None => match self.role {
        | Role::Server => {
          self.start_handshake(&mut sessions, addr)?;
        },
        | Role::Client => {
          // a datagram from a peer we never spoke to; drain & drop it
          let mut scratch = [0u8; 1152];
          self.sock.recv(&mut scratch).ok();
          log::warn!("dropped unsolicited datagram from {}", addr);
        },
      },
      | Some(Session::Establishing(mid)) => self.continue_handshake(&mut sessions, addr, mid),
      | Some(Session::Established(mut stream)) => {
        let mut buf = [0u8; 1152];
        match stream.ssl_read(&mut buf) {
          | Ok(n) => {
            sessions.insert(addr, Session::Established(stream));
            drop(sessions);
            self.push_rx(Addrd(buf[..n].to_vec(), addr));
            self.check_retransmit();
            return Ok(true);
          },
          | Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
            log::debug!("{} sent close_notify", addr);
            // session is done; drop it
          },
          | Err(e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => {
            sessions.insert(addr, Session::Established(stream));
          },
          | Err(e) => {
            log::error!("decrypt from {} failed: {:?}", addr, e);
            sessions.insert(addr, Session::Established(stream));
            *self.pending_err.lock().unwrap() = Some(e.into());
          },
        }
      },
    }

    drop(sessions);
    self.check_retransmit();
    Ok(true)
  }

  pub(crate) fn push_rx(&self, item: Addrd<Vec<u8>>) {
    let mut rx = self.rx_q.lock().unwrap();
    if rx.len() >= QUEUE_CAP {
      log::warn!("read queue too long, dropping {}b from {}",
                 item.data().len(),
                 item.addr());
      return;
    }

    rx.push_back(item.map(Zeroizing::new));

    let consumed = {
      let on_read = self.on_read.lock().unwrap();
      match (on_read.as_ref(), rx.back()) {
        | (Some(f), Some(item)) => f(item.data(), item.addr()),
        | _ => false,
      }
    };

    if consumed {
      rx.pop_back();
    }
  }

  /// Encrypt & emit queued plaintext, in order, stopping at the
  /// first item whose peer isn't ready. Ordering within the queue is
  /// part of the contract: items enqueued before a handshake
  /// finished go out in enqueue order once it does.
  fn flush_tx(&self, sessions: &mut Sessions<S>) {
    let mut tx = self.tx_q.lock().unwrap();

    while let Some(head) = tx.front() {
      let addr = head.addr();
      match sessions.get_mut(&addr) {
        | Some(Session::Established(stream)) => {
          match stream.ssl_write(head.data()) {
            | Ok(_) => {
              // Zeroizing wipes the plaintext as it drops
              tx.pop_front();
            },
            | Err(e)
              if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE =>
            {
              break;
            },
            | Err(e) => {
              log::error!("encrypt for {} failed: {:?}", addr, e);
              *self.pending_err.lock().unwrap() = Some(e.into());
              break;
            },
          }
        },
        | Some(Session::Establishing(_)) => break,
        | None => break,
      }
    }
  }

  /// Arm, fire or clear the handshake retransmission timer.
  ///
  /// DTLS loses handshake flights like any datagram; OpenSSL
  /// retransmits when the handshake is re-driven after its internal
  /// timer lapses, so all we owe it is a periodic nudge while any
  /// handshake is in flight.
  fn check_retransmit(&self) {
    use embedded_time::Clock;

    let addrs_establishing = self.sessions
                                 .lock()
                                 .unwrap()
                                 .iter()
                                 .filter(|(_, s)| matches!(s, Session::Establishing(_)))
                                 .map(|(addr, _)| *addr)
                                 .collect::<Vec<_>>();

    let mut hs_retry = self.hs_retry.lock().unwrap();

    if addrs_establishing.is_empty() {
      *hs_retry = None;
      return;
    }

    let now = match self.clock.try_now() {
      | Ok(now) => now,
      | Err(_) => return,
    };

    let decision = match hs_retry.as_mut() {
      | None => {
        *hs_retry = Some(RetryTimer::new(now,
                                         Strategy::Exponential { init_min: Milliseconds(1000),
                                                                 init_max:
                                                                   Milliseconds(2000) },
                                         Attempts(6)));
        None
      },
      | Some(timer) => timer.what_should_i_do(now).ok(),
    };

    drop(hs_retry);

    match decision {
      | Some(YouShould::Retry) => {
        let mut sessions = self.sessions.lock().unwrap();
        for addr in addrs_establishing {
          if let Some(Session::Establishing(mid)) = sessions.remove(&addr) {
            log::trace!("re-driving handshake with {}", addr);
            self.continue_handshake(&mut sessions, addr, mid);
          }
        }
      },
      | Some(YouShould::Cry) => {
        let mut sessions = self.sessions.lock().unwrap();
        for addr in addrs_establishing {
          log::error!("handshake with {} timed out", addr);
          sessions.remove(&addr);
        }
        drop(sessions);
        *self.pending_err.lock().unwrap() = Some(Error::NotConnected);
        *self.hs_retry.lock().unwrap() = None;
      },
      | None => (),
    }
  }

  fn take_pending_err(&self) -> Option<Error> {
    self.pending_err.lock().unwrap().take()
  }

  // simulates a completed flush for tests that have no live peer to
  // handshake with
  #[cfg(test)]
  pub(crate) fn drop_queued(&self) {
    self.tx_q.lock().unwrap().clear();
    self.rx_q.lock().unwrap().clear();
  }
}

fn classify_cred_err(kind: ErrorKind) -> &'static str {
  match kind {
    | ErrorKind::NoMatch | ErrorKind::InvalidArgument => "illegal parameter",
    | _ => "internal error",
  }
}

fn build_ctx(role: Role,
             cfg: &TlsConfig,
             peer_ix: Index<Ssl, SocketAddr>)
             -> Result<SslContext> {
  let mut b = SslContextBuilder::new(SslMethod::dtls())?;
  b.set_verify(SslVerifyMode::NONE);

  if cfg.anon_ecdh {
    b.set_cipher_list(ANON_ECDH_CIPHER_LIST)?;
  } else {
    b.set_cipher_list(cfg.cipher.cipher_list())?;
  }

  if let Some(creds) = cfg.creds.clone() {
    match role {
      | Role::Client => {
        b.set_psk_client_callback(move |ssl, _hint, identity_buf, psk_buf| {
           let peer = match ssl.ex_data(peer_ix) {
             | Some(peer) => *peer,
             | None => {
               log::error!("psk lookup without a peer address");
               return Ok(0);
             },
           };

           let mut id = [0u8; IDENTITY_LEN];
           if let Err(kind) = creds.get_id(peer, &mut id) {
             // a failed lookup becomes a fatal alert when we
             // abandon the handshake with no psk
             log::error!("identity lookup for {} failed ({:?} -> {})",
                         peer,
                         kind,
                         classify_cred_err(kind));
             return Ok(0);
           }

           // OpenSSL treats the identity as a C string, so the raw
           // 16 bytes travel hex-encoded with a NUL terminator
           let hexed = hex::encode(id);
           if identity_buf.len() < hexed.len() + 1 {
             log::error!("identity buffer too small ({}b)", identity_buf.len());
             return Ok(0);
           }
           identity_buf[..hexed.len()].copy_from_slice(hexed.as_bytes());
           identity_buf[hexed.len()] = 0;

           let n = usize::min(psk_buf.len(), PSK_LEN);
           match creds.get_psk(&id, &mut psk_buf[..n]) {
             | Ok(n) => Ok(n),
             | Err(kind) => {
               log::error!("psk lookup failed ({:?} -> {})",
                           kind,
                           classify_cred_err(kind));
               Ok(0)
             },
           }
         });
      },
      | Role::Server => {
        b.set_psk_server_callback(move |_ssl, identity, psk_buf| {
           let id = identity.and_then(|hexed| hex::decode(hexed).ok())
                            .and_then(|bytes| <[u8; IDENTITY_LEN]>::try_from(bytes).ok());

           let id = match id {
             | Some(id) => id,
             | None => {
               log::error!("peer presented a malformed psk identity (illegal parameter)");
               return Ok(0);
             },
           };

           let n = usize::min(psk_buf.len(), PSK_LEN);
           match creds.get_psk(&id, &mut psk_buf[..n]) {
             | Ok(n) => Ok(n),
             | Err(kind) => {
               log::error!("psk lookup failed ({:?} -> {})",
                           kind,
                           classify_cred_err(kind));
               Ok(0)
             },
           }
         });
      },
    }
  }

  Ok(b.build())
}

impl<S: Socket> Socket for SecureSocket<S> {
  type Error = Error;

  fn local_addr(&self) -> SocketAddr {
    self.sock.local_addr()
  }

  fn bind_raw(_: SocketAddr) -> Result<Self> {
    // a secure socket wraps an existing socket; it can't conjure one
    Err(Error::Unsupported)
  }

  fn send(&self, msg: Addrd<&[u8]>) -> nb::Result<usize, Self::Error> {
    if let Some(e) = self.take_pending_err() {
      return Err(e.into_nb());
    }

    let len = msg.data().len();

    {
      let mut tx = self.tx_q.lock().unwrap();
      if tx.len() >= QUEUE_CAP {
        log::warn!("write queue too long, dropping {}b for {}", len, msg.addr());
        return Err(Error::QueueFull.into_nb());
      }
      tx.push_back(Addrd(Zeroizing::new(msg.data().to_vec()), msg.addr()));
    }

    let mut sessions = self.sessions.lock().unwrap();

    if !sessions.contains_key(&msg.addr()) {
      match self.role {
        | Role::Client => {
          self.start_handshake(&mut sessions, msg.addr())
              .map_err(Error::into_nb)?;
        },
        | Role::Server => {
          // servers don't chase peers; the item waits for the
          // peer's handshake, and callers see "not connected"
          return Err(Error::NotConnected.into_nb());
        },
      }
    }

    self.flush_tx(&mut sessions);
    drop(sessions);
    self.check_retransmit();
    Ok(len)
  }

  fn insecure_send(&self, msg: Addrd<&[u8]>) -> nb::Result<usize, Self::Error> {
    self.sock.send(msg).map_err(|e| match e {
                         | nb::Error::WouldBlock => nb::Error::WouldBlock,
                         | nb::Error::Other(e) => {
                           nb::Error::Other(Error::Io(io::Error::new(io::ErrorKind::Other,
                                                                     format!("{:?}", e))))
                         },
                       })
  }

  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    // drain ciphertext until the socket runs dry or plaintext appears
    loop {
      match self.pump() {
        | Ok(true) if !self.rx_q.lock().unwrap().is_empty() => break,
        | Ok(true) => continue,
        | Ok(false) => break,
        | Err(e) => return Err(e.into_nb()),
      }
    }

    let mut rx = self.rx_q.lock().unwrap();

    match rx.pop_front() {
      | None => match self.take_pending_err() {
        | Some(e) => Err(e.into_nb()),
        | None => Err(nb::Error::WouldBlock),
      },
      | Some(Addrd(bytes, addr)) if bytes.len() > buffer.len() => {
        // short read: hand over a prefix, keep the remainder as the
        // new head so nothing is lost
        buffer.copy_from_slice(&bytes[..buffer.len()]);
        let n = buffer.len();
        rx.push_front(Addrd(Zeroizing::new(bytes[n..].to_vec()), addr));
        Ok(Addrd(n, addr))
      },
      | Some(Addrd(bytes, addr)) => {
        buffer[..bytes.len()].copy_from_slice(&bytes);
        Ok(Addrd(bytes.len(), addr))
      },
    }
  }

  fn peek(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    let rx = self.rx_q.lock().unwrap();
    match rx.front() {
      | Some(Addrd(bytes, addr)) => {
        let n = usize::min(bytes.len(), buffer.len());
        buffer[..n].copy_from_slice(&bytes[..n]);
        Ok(Addrd(n, *addr))
      },
      | None => Err(nb::Error::WouldBlock),
    }
  }

  /// Multicast and DTLS are incompatible, so this always fails with
  /// [`Error::Unsupported`].
  fn join_multicast(&self, _: u32, _: std::net::IpAddr) -> Result<()> {
    Err(Error::Unsupported)
  }
}
