use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use newt_msg::{Code, Id, Message, Token, Type};

use crate::config::Config;
use crate::core::{Core, Error, What, When};
use crate::net::{Addrd, Socket};
use crate::secure::{CredLookup, SecureSocket};
use crate::time::{Clock, Millis, Timeout};

/// A blocking CoAP request client.
///
/// Wraps a [`Core`] and spins its poll loop until a reply (or a
/// timeout) shows up; the rest of this crate never blocks, this
/// module is the convenience lid on top for hosted platforms and
/// tools.
#[allow(missing_debug_implementations)]
pub struct Client<S: Socket, C: Clock> {
  core: Core<S, C>,
}

/// Helper methods on Client Results
pub trait ClientResultExt<T, E> {
  /// If we timed out waiting for a response, consider that Ok(None).
  ///
  /// Usually used to handle sending non-confirmable requests that
  /// the server may have received but not responded to.
  fn timeout_ok(self) -> Result<Option<T>, Error<E>>;
}

impl<T, E> ClientResultExt<T, E> for Result<T, Error<E>> {
  fn timeout_ok(self) -> Result<Option<T>, Error<E>> {
    match self {
      | Ok(t) => Ok(Some(t)),
      | Err(Error { what: What::Timeout, .. })
      | Err(Error { what: What::MessageNeverAcked,
                    .. }) => Ok(None),
      | Err(e) => Err(e),
    }
  }
}

impl Client<crate::std::UdpSocket, crate::std::Clock> {
  /// Create a new client bound to a local port.
  ///
  /// ```no_run
  /// use newt::blocking::Client;
  /// use newt::time::Timeout;
  ///
  /// let mut client = Client::new_std(1111).unwrap();
  /// let rep = client.get("127.0.0.1:5683".parse().unwrap(),
  ///                      "hello",
  ///                      Timeout::Millis(5_000))
  ///                 .unwrap();
  ///
  /// println!("Hello, {}!",
  ///          String::from_utf8_lossy(rep.data().payload.as_bytes()));
  /// ```
  pub fn new_std(port: u16) -> std::io::Result<Self> {
    let sock = crate::std::UdpSocket::bind_raw(SocketAddr::from(([0, 0, 0, 0], port)))?;
    Ok(Self::new_config(Config::default(), crate::std::Clock::new(), sock))
  }
}

impl Client<SecureSocket<crate::std::UdpSocket>, crate::std::Clock> {
  /// Create a new client whose traffic runs over DTLS, with PSK
  /// lookups routed through `creds`.
  pub fn try_new_secure(port: u16,
                        creds: Arc<dyn CredLookup + Send + Sync>)
                        -> crate::secure::Result<Self> {
    let sock = crate::std::UdpSocket::bind_raw(SocketAddr::from(([0, 0, 0, 0], port)))?;
    let sock = SecureSocket::new_client(sock)?;
    sock.set_credential_callbacks(creds);

    let mut client = Self::new_config(Config::default(), crate::std::Clock::new(), sock);
    client.core.mark_transport_secure();
    Ok(client)
  }
}

impl<S: Socket, C: Clock> Client<S, C> {
  /// Bring-your-own clock & socket
  pub fn new_config(config: Config, clock: C, sock: S) -> Self {
    Self { core: Core::new_config(config, clock, sock) }
  }

  /// The non-blocking engine underneath, e.g. to register resources
  /// or observe subscriptions
  pub fn core_mut(&mut self) -> &mut Core<S, C> {
    &mut self.core
  }

  fn now_millis(&self) -> Result<u64, Error<S::Error>> {
    self.core
        .clock
        .try_now()
        .ok()
        .and_then(|now| Millis::try_from(now.duration_since_epoch()).ok())
        .map(|m| m.0)
        .ok_or_else(|| When::None.what(What::ClockError))
  }

  /// Send a request, block until its reply.
  ///
  /// `timeout` bounds the whole wait; the engine's own
  /// retransmission schedule still applies underneath it, so a CON
  /// request that exhausts its retransmissions errors before a
  /// generous timeout fires.
  pub fn send(&mut self,
              msg: Message,
              addr: SocketAddr,
              timeout: Timeout)
              -> Result<Addrd<Message>, Error<S::Error>> {
    type Slot = Arc<Mutex<Option<Option<Addrd<Message>>>>>;

    let slot: Slot = Default::default();
    let slot_in_cb = slot.clone();

    let token = self.core.send_req(msg,
                                   addr,
                                   Box::new(move |reply| {
                                     let reply =
                                       reply.map(|r| Addrd((*r.data()).clone(), r.addr()));
                                     *slot_in_cb.lock().unwrap() = Some(reply);
                                     false
                                   }))?;

    let started = self.now_millis()?;

    loop {
      self.core.poll()?;

      if let Some(outcome) = slot.lock().unwrap().take() {
        return match outcome {
          | Some(reply) => Ok(reply),
          | None => Err(When::None.what(What::Timeout)),
        };
      }

      if let Timeout::Millis(ms) = timeout {
        if self.now_millis()?.saturating_sub(started) >= ms {
          self.core.cancel(token);
          return Err(When::None.what(What::Timeout));
        }
      }

      std::thread::sleep(std::time::Duration::from_millis(1));
    }
  }

  /// GET `path` on `addr`, blocking for the response
  pub fn get(&mut self,
             addr: SocketAddr,
             path: &str,
             timeout: Timeout)
             -> Result<Addrd<Message>, Error<S::Error>> {
    let mut msg = Message::new(Type::Con, Code::GET, Id(0), Token(Default::default()));
    msg.set_path(path);
    self.send(msg, addr, timeout)
  }

  /// CoAP ping, blocking until the pong (or `timeout`)
  pub fn ping(&mut self, addr: SocketAddr, timeout: Timeout) -> Result<(), Error<S::Error>> {
    let slot: Arc<Mutex<Option<bool>>> = Default::default();
    let slot_in_cb = slot.clone();

    self.core.ping(addr,
                   Box::new(move |reply| {
                     *slot_in_cb.lock().unwrap() = Some(reply.is_some());
                     false
                   }))?;

    let started = self.now_millis()?;

    loop {
      self.core.poll()?;

      match slot.lock().unwrap().take() {
        | Some(true) => return Ok(()),
        | Some(false) => return Err(When::None.what(What::Timeout)),
        | None => (),
      }

      if let Timeout::Millis(ms) = timeout {
        if self.now_millis()?.saturating_sub(started) >= ms {
          return Err(When::None.what(What::Timeout));
        }
      }

      std::thread::sleep(std::time::Duration::from_millis(1));
    }
  }
}
