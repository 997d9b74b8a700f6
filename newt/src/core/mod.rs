//! The request/response engine: pending exchanges, retransmission,
//! observe bookkeeping, duplicate suppression, multicast discovery,
//! and dispatch into the resource [`Server`].

use std::collections::VecDeque;
use std::net::SocketAddr;

use newt_msg::{observe, Code, CodeKind, Id, Message, OptValue, Payload, Token, TryFromBytes,
               TryIntoBytes, Type};
use rand::{Rng, SeedableRng};

mod error;
#[doc(inline)]
pub use error::*;

use crate::config::Config;
use crate::logging;
use crate::net::{same_endpoint, Addrd, Dgram, Socket};
use crate::retry::{RetryTimer, YouShould};
use crate::server::{Path, Server};
use crate::time::{Clock, Millis};

/// How a pending exchange reacts to traffic (or silence).
///
/// Invoked with `Some(packet)` for each matching reply, and `None`
/// exactly once on timeout or RESET. The return value answers "keep
/// waiting?": `true` keeps the exchange alive (observe streams),
/// `false` completes it.
pub type ReplyHandler = Box<dyn FnMut(Option<Addrd<&Message>>) -> bool + Send>;

/// Lifecycle of a pending exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
  /// Awaiting ACK or first reply
  Outstanding,
  /// Reply received, further notifications expected
  Observing,
}

struct Exchange<C: Clock> {
  id: Id,
  token: Token,
  addr: SocketAddr,
  code: Code,
  /// Serialized request, kept for retransmission
  packet: Vec<u8>,
  state: ExchangeState,
  retry: Option<RetryTimer<C>>,
  /// For NON exchanges: when (millis since clock epoch) to stop
  /// waiting for further replies
  expires_at: Option<u64>,
  on_reply: ReplyHandler,
}

/// One observer of one resource
#[derive(Debug, Clone, PartialEq, Eq)]
struct Observation {
  path: Path,
  addr: SocketAddr,
  token: Token,
}

/// A recently-seen inbound (address, message-id), with the response
/// we gave so duplicates can be answered from cache
struct Seen {
  addr: SocketAddr,
  id: Id,
  response: Option<Vec<u8>>,
}

/// A CoAP request/response runtime that drives client- and
/// server-side behavior over any [`Socket`].
#[allow(missing_debug_implementations)]
pub struct Core<S: Socket, C: Clock> {
  sock: S,
  pub(crate) clock: C,
  config: Config,
  rand: rand_chacha::ChaCha8Rng,
  server: Server,
  exchanges: Vec<Exchange<C>>,
  observations: Vec<Observation>,
  dedup: VecDeque<Seen>,
  obs_seq: u32,
  transport_secure: bool,
}

impl<S: Socket, C: Clock> Core<S, C> {
  /// Creates a new Core with the default runtime behavior
  pub fn new(clock: C, sock: S) -> Self {
    Self::new_config(Config::default(), clock, sock)
  }

  /// Create a new core with custom runtime behavior
  pub fn new_config(config: Config, clock: C, sock: S) -> Self {
    Self { rand: rand_chacha::ChaCha8Rng::seed_from_u64(config.msg.token_seed),
           config,
           sock,
           clock,
           server: Server::default(),
           exchanges: vec![],
           observations: vec![],
           dedup: VecDeque::new(),
           obs_seq: 0,
           transport_secure: false }
  }

  /// Tell the engine its socket encrypts in flight, unlocking
  /// `secure_only` resources.
  pub fn mark_transport_secure(&mut self) {
    self.transport_secure = true;
  }

  /// The resources this endpoint serves
  pub fn server_mut(&mut self) -> &mut Server {
    &mut self.server
  }

  /// Borrow the socket
  pub fn sock(&self) -> &S {
    &self.sock
  }

  /// Number of exchanges still waiting on the network
  pub fn pending_count(&self) -> usize {
    self.exchanges.len()
  }

  /// Number of registered observers across all resources
  pub fn observer_count(&self) -> usize {
    self.observations.len()
  }

  /// Number of pending exchanges that have become observe streams
  pub fn observing_count(&self) -> usize {
    self.exchanges
        .iter()
        .filter(|e| e.state == ExchangeState::Observing)
        .count()
  }

  fn now(&self) -> Result<embedded_time::Instant<C>, Error<S::Error>> {
    self.clock
        .try_now()
        .map_err(|_| When::None.what(What::ClockError))
  }

  fn now_millis(&self) -> Result<u64, Error<S::Error>> {
    self.now().and_then(|now| {
                Millis::try_from(now.duration_since_epoch())
                  .map(|m| m.0)
                  .map_err(|_| When::None.what(What::ClockError))
              })
  }

  fn next_id(&mut self, addr: SocketAddr) -> Id {
    // ids are 16 bits of a 32-bit random; keep drawing until the id
    // is unique among this peer's pending exchanges
    loop {
      let id = Id::from_random(self.rand.gen::<u32>());
      let clash = self.exchanges
                      .iter()
                      .any(|e| e.id == id && same_endpoint(e.addr, addr));
      if !clash {
        break id;
      }
    }
  }

  fn next_token(&mut self) -> Token {
    Token::from_random(self.rand.gen::<u64>())
  }

  fn send_bytes(sock: &S,
                when: When,
                bytes: &[u8],
                addr: SocketAddr)
                -> Result<(), Error<S::Error>> {
    nb::block!(sock.send(Addrd(bytes, addr))).map(|_| ())
                                             .map_err(|e| when.what(What::SockError(e)))
  }

  fn serialize(msg: Message) -> Result<Vec<u8>, Error<S::Error>> {
    let when = When::SendingMessage(None, msg.id, msg.token);
    msg.try_into_bytes()
       .map_err(|e| when.what(What::ToBytes(e)))
  }

  /// Send a request and register `on_reply` for whatever comes back.
  ///
  /// The engine assigns a fresh message id, and a fresh 8-byte token
  /// unless the message already carries one (EMPTY messages carry
  /// none). CONfirmable requests retransmit per RFC 7252 until ACKed
  /// or spent; a multicast destination requires NON.
  pub fn send_req(&mut self,
                  mut msg: Message,
                  addr: SocketAddr,
                  on_reply: ReplyHandler)
                  -> Result<Token, Error<S::Error>> {
    if addr.ip().is_multicast() && msg.ty != Type::Non {
      return Err(When::SendingMessage(Some(addr), msg.id, msg.token)
                   .what(What::MulticastRequiresNon));
    }

    if msg.token.is_empty() && msg.code != Code::EMPTY {
      msg.token = self.next_token();
    }
    msg.id = self.next_id(addr);

    let (id, token, code, ty) = (msg.id, msg.token, msg.code, msg.ty);

    log::trace!("sending {} -> {}", logging::msg_summary(&msg), addr);
    let bytes = Self::serialize(msg)?;

    let now = self.now()?;
    let retry = match ty {
      | Type::Con => Some(RetryTimer::new(now,
                                          self.config.msg.con.unacked_retry_strategy,
                                          self.config.msg.con.max_attempts)),
      | _ => None,
    };
    let expires_at = match ty {
      | Type::Non => Some(self.now_millis()? + self.config.msg.non.lifetime.0),
      | _ => None,
    };

    self.exchanges.push(Exchange { id,
                                   token,
                                   addr,
                                   code,
                                   packet: bytes.clone(),
                                   state: ExchangeState::Outstanding,
                                   retry,
                                   expires_at,
                                   on_reply });

    Self::send_bytes(&self.sock,
                     When::SendingMessage(Some(addr), id, token),
                     &bytes,
                     addr)?;
    Ok(token)
  }

  /// Send a message once, keeping no state: NON data, ACKs, RESETs.
  ///
  /// CON/NON messages get a fresh id; ACK/RESET keep the id they
  /// carry (it names the message they answer).
  pub fn fling(&mut self, mut msg: Message, addr: SocketAddr) -> Result<(), Error<S::Error>> {
    if matches!(msg.ty, Type::Con | Type::Non) {
      msg.id = self.next_id(addr);
    }
    let (id, token) = (msg.id, msg.token);
    let bytes = Self::serialize(msg)?;
    Self::send_bytes(&self.sock, When::SendingMessage(Some(addr), id, token), &bytes, addr)
  }

  fn fling_raw(&self, msg: Message, addr: SocketAddr) -> Result<(), Error<S::Error>> {
    let (id, token) = (msg.id, msg.token);
    let bytes = Self::serialize(msg)?;
    Self::send_bytes(&self.sock, When::SendingMessage(Some(addr), id, token), &bytes, addr)
  }

  /// CoAP ping: an EMPTY CON message the peer answers with RESET.
  ///
  /// `on_pong` gets `Some(reset)` when the peer is alive, `None` on
  /// timeout.
  pub fn ping(&mut self, addr: SocketAddr, on_pong: ReplyHandler) -> Result<(), Error<S::Error>> {
    let msg = Message::new(Type::Con, Code::EMPTY, Id(0), Token(Default::default()));
    self.send_req(msg, addr, on_pong).map(|_| ())
  }

  /// NON GET `/.well-known/core` to a discovery multicast group.
  ///
  /// Replies from every responder funnel into `on_reply` in receive
  /// order until the discovery window closes, at which point
  /// `on_reply` sees `None` once.
  pub fn discover(&mut self,
                  group: SocketAddr,
                  on_reply: ReplyHandler)
                  -> Result<Token, Error<S::Error>> {
    let mut msg = Message::new(Type::Non, Code::GET, Id(0), Token(Default::default()));
    msg.set_path(".well-known/core");
    self.send_req(msg, group, on_reply)
  }

  /// Join the CoAP/OCF discovery groups on each given interface.
  ///
  /// Call again (with the fresh interface list) on interface-change
  /// notifications; joins are idempotent at the socket layer.
  pub fn join_discovery_groups(&self, ifindexes: &[u32]) -> Result<(), Error<S::Error>> {
    for ifindex in ifindexes {
      for group in crate::multicast::DISCOVERY_GROUPS {
        self.sock
            .join_multicast(*ifindex, group)
            .map_err(|e| When::None.what(What::SockError(e)))?;
      }
    }
    Ok(())
  }

  /// Forget the exchange registered under `token` without invoking
  /// its handler. Idempotent.
  pub fn cancel(&mut self, token: Token) {
    self.exchanges.retain(|e| e.token != token);
  }

  /// Stop observing: emits an Observe=1 copy of the original request
  /// and removes the exchange (without invoking its handler).
  ///
  /// Returns whether anything was registered under `token`.
  pub fn unobserve(&mut self, token: Token) -> Result<bool, Error<S::Error>> {
    let ix = match self.exchanges.iter().position(|e| e.token == token) {
      | Some(ix) => ix,
      | None => return Ok(false),
    };

    let ex = self.exchanges.remove(ix);

    let mut req = Message::try_from_bytes(&ex.packet).expect("exchange holds bytes we serialized");
    req.ty = Type::Non;
    req.set_observe(observe::Action::Deregister);
    req.id = self.next_id(ex.addr);

    self.fling_raw(req, ex.addr).map(|_| true)
  }

  /// Notify every observer of the resource at `path`.
  ///
  /// Each observer gets a clone of `packet` re-tokened for them with
  /// a fresh Observe sequence number. Returns how many went out.
  pub fn send_notification(&mut self,
                           path: &Path,
                           packet: Message)
                           -> Result<usize, Error<S::Error>> {
    self.obs_seq = self.obs_seq.wrapping_add(1);
    let seq = self.obs_seq;

    let observers = self.observations
                        .iter()
                        .filter(|o| &o.path == path)
                        .map(|o| (o.addr, o.token))
                        .collect::<Vec<_>>();

    for (addr, token) in observers.iter().copied() {
      let mut msg = packet.clone();
      msg.token = token;
      msg.id = self.next_id(addr);
      msg.set(newt_msg::known::no_repeat::OBSERVE, OptValue(uint_bytes(seq)));

      // notifications are best-effort; a lost NON is repaired by the
      // next notification
      if let Err(e) = self.fling_raw(msg, addr) {
        log::warn!("notify of {} failed: {:?}", addr, e.what);
      }
    }

    Ok(observers.len())
  }

  /// Poll the socket & timers once.
  ///
  /// Call from the reactor whenever the socket is readable and
  /// whenever the retransmit timer fires.
  pub fn poll(&mut self) -> Result<(), Error<S::Error>> {
    let polled = self.sock
                     .poll()
                     .map_err(|e| When::Polling.what(What::SockError(e)))?;

    if let Some(dgram) = polled {
      self.dgram_recvd(dgram)?;
    }

    self.tick_timers()
  }

  /// Milliseconds until the engine next needs [`Core::poll`] for
  /// timer work, if anything is pending. For reactor arming.
  pub fn next_timer_millis(&self) -> Result<Option<u64>, Error<S::Error>> {
    let now = self.now()?;
    let now_ms = self.now_millis()?;

    let due = self.exchanges
                  .iter()
                  .filter_map(|e| {
                    let retry_due = e.retry.as_ref().map(|r| r.millis_until_retry(now));
                    let expiry_due = e.expires_at.map(|at| at.saturating_sub(now_ms));
                    match (retry_due, expiry_due) {
                      | (Some(a), Some(b)) => Some(u64::min(a, b)),
                      | (a, b) => a.or(b),
                    }
                  })
                  .min();

    Ok(due)
  }

  fn dgram_recvd(&mut self, dgram: Addrd<Dgram>) -> Result<(), Error<S::Error>> {
    log::trace!("recvd {}b <- {}", dgram.data().len(), dgram.addr());

    match Message::try_from_bytes(dgram.data()) {
      | Ok(msg) => self.msg_recvd(Addrd(msg, dgram.addr())),
      | Err(e) => {
        // invalid packets are dropped silently, except that a CON
        // with a readable header earns a RESET so the sender stops
        // retransmitting
        log::debug!("dropping malformed dgram from {}: {:?}", dgram.addr(), e);

        let bytes = dgram.data();
        let is_con = bytes.len() >= 4 && (bytes[0] >> 4) & 0b11 == 0;
        if is_con {
          let id = Id::from_be_bytes([bytes[2], bytes[3]]);
          let rst = Message::new(Type::Reset, Code::EMPTY, id, Token(Default::default()));
          self.fling_raw(rst, dgram.addr())?;
        }
        Ok(())
      },
    }
  }

  fn msg_recvd(&mut self, msg: Addrd<Message>) -> Result<(), Error<S::Error>> {
    log::trace!("recvd {} <- {}",
                logging::msg_summary(msg.data()),
                msg.addr());

    match msg.data().code.kind() {
      | CodeKind::Empty if msg.data().ty == Type::Con => {
        // CoAP ping; pong with RESET
        self.fling_raw(msg.data().reset(), msg.addr())
      },
      | CodeKind::Empty => self.handle_reply(msg),
      | CodeKind::Response => self.handle_reply(msg),
      | CodeKind::Request => self.request_recvd(msg),
    }
  }

  /// Correlate an inbound ACK / RESET / response with a pending
  /// exchange: message-id match for ACK & RESET, token match for
  /// piggy-backed & separate responses (and multicast exchanges,
  /// where replies come from addresses we never sent to).
  fn handle_reply(&mut self, msg: Addrd<Message>) -> Result<(), Error<S::Error>> {
    let pos = self.exchanges.iter().position(|e| {
                                     let id_match =
                                       matches!(msg.data().ty, Type::Ack | Type::Reset)
                                       && e.id == msg.data().id
                                       && same_endpoint(e.addr, msg.addr());
                                     let token_match =
                                       !msg.data().token.is_empty()
                                       && e.token == msg.data().token
                                       && (e.addr.ip().is_multicast()
                                           || same_endpoint(e.addr, msg.addr()));
                                     id_match || token_match
                                   });

    let ix = match pos {
      | Some(ix) => ix,
      | None => {
        match msg.data().ty {
          | Type::Reset => {
            // an observer rejecting our notification; drop their
            // observations
            let had = self.observations.len();
            self.observations
                .retain(|o| !same_endpoint(o.addr, msg.addr()));
            if self.observations.len() != had {
              log::debug!("{} unobserved via RESET", msg.addr());
            }
          },
          | Type::Con => {
            // a CON response nobody is waiting for
            self.fling_raw(msg.data().reset(), msg.addr())?;
          },
          | _ => log::debug!("ignoring stray {:?} from {}", msg.data().ty, msg.addr()),
        }
        return Ok(());
      },
    };

    if msg.data().ty == Type::Reset {
      let mut ex = self.exchanges.remove(ix);
      if ex.code == Code::EMPTY {
        // RESET answering an EMPTY CON is a pong, not a rejection
        (ex.on_reply)(Some(Addrd(msg.data(), msg.addr())));
      } else {
        log::debug!("{} rejected {:?} with RESET", msg.addr(), ex.id);
        (ex.on_reply)(None);
      }
      return Ok(());
    }

    // a separate CON response wants an ACK of its own
    if msg.data().ty == Type::Con {
      self.fling_raw(msg.data().ack(), msg.addr())?;
    }

    let keep = {
      let ex = &mut self.exchanges[ix];
      ex.retry = None;
      (ex.on_reply)(Some(Addrd(msg.data(), msg.addr())))
    };

    if keep {
      self.exchanges[ix].state = ExchangeState::Observing;
    } else {
      self.exchanges.remove(ix);
    }

    Ok(())
  }

  fn remember_seen(&mut self, addr: SocketAddr, id: Id, response: Option<Vec<u8>>) {
    while self.dedup.len() >= self.config.dedup_capacity {
      self.dedup.pop_front();
    }
    self.dedup.push_back(Seen { addr, id, response });
  }

  fn request_recvd(&mut self, msg: Addrd<Message>) -> Result<(), Error<S::Error>> {
    // duplicate suppression: answer repeats from cache without
    // re-dispatching to the application
    if let Some(seen) = self.dedup
                            .iter()
                            .find(|s| s.id == msg.data().id && same_endpoint(s.addr, msg.addr()))
    {
      log::debug!("duplicate {:?} from {}", msg.data().id, msg.addr());
      if let Some(bytes) = seen.response.clone() {
        Self::send_bytes(&self.sock, When::None, &bytes, msg.addr())?;
      }
      return Ok(());
    }

    let obs_action = match msg.data().code {
      | Code::GET => msg.data().observe(),
      | _ => None,
    };

    let reply = self.server
                    .dispatch(Addrd(msg.data(), msg.addr()), self.transport_secure);

    let mut obs_seq = None;
    match obs_action {
      | Some(observe::Action::Register) if reply.code.class == 2 => {
        let segments = msg.data().path().unwrap_or_default();
        let observable = self.server
                             .find(&segments)
                             .map(|r| (r.flags().observable, r.path().clone()));

        if let Some((true, path)) = observable {
          let already = self.observations.iter().any(|o| {
                                                  o.path == path
                                                  && o.token == msg.data().token
                                                  && same_endpoint(o.addr, msg.addr())
                                                });
          if !already {
            log::debug!("{} observing /{}", msg.addr(), path.to_string());
            self.observations.push(Observation { path,
                                                 addr: msg.addr(),
                                                 token: msg.data().token });
          }
          self.obs_seq = self.obs_seq.wrapping_add(1);
          obs_seq = Some(self.obs_seq);
        }
      },
      | Some(observe::Action::Deregister) => {
        self.observations.retain(|o| {
                           !(o.token == msg.data().token && same_endpoint(o.addr, msg.addr()))
                         });
      },
      | _ => (),
    }

    let mut resp = match msg.data().ty {
      // piggy-backed response in the ACK
      | Type::Con => Message::new(Type::Ack, reply.code, msg.data().id, msg.data().token),
      | _ => {
        let id = self.next_id(msg.addr());
        Message::new(Type::Non, reply.code, id, msg.data().token)
      },
    };

    if let Some(format) = reply.format {
      resp.set_content_format(format);
    }
    if let Some(seq) = obs_seq {
      resp.set(newt_msg::known::no_repeat::OBSERVE, OptValue(uint_bytes(seq)));
    }
    resp.payload = Payload(reply.payload);

    let bytes = Self::serialize(resp)?;
    self.remember_seen(msg.addr(), msg.data().id, Some(bytes.clone()));
    Self::send_bytes(&self.sock, When::None, &bytes, msg.addr())
  }

  fn tick_timers(&mut self) -> Result<(), Error<S::Error>> {
    let now = self.now()?;
    let now_ms = self.now_millis()?;

    let mut finalize: Vec<usize> = vec![];

    for (ix, ex) in self.exchanges.iter_mut().enumerate() {
      if let Some(at) = ex.expires_at {
        if now_ms >= at {
          finalize.push(ix);
          continue;
        }
      }

      if let Some(retry) = ex.retry.as_mut() {
        match retry.what_should_i_do(now) {
          | Ok(YouShould::Retry) => {
            log::trace!("retransmitting {:?} -> {}", ex.id, ex.addr);
            // a failed retransmission isn't fatal; the timer will
            // bring us back
            if let Err(e) = nb::block!(self.sock.send(Addrd(ex.packet.as_slice(), ex.addr))) {
              log::warn!("retransmit to {} failed: {:?}", ex.addr, e);
            }
          },
          | Ok(YouShould::Cry) => finalize.push(ix),
          | Err(nb::Error::WouldBlock) => (),
          | Err(nb::Error::Other(_)) => unreachable!(),
        }
      }
    }

    for ix in finalize.into_iter().rev() {
      let mut ex = self.exchanges.remove(ix);
      log::debug!("finalizing exchange {:?} with {}", ex.id, ex.addr);

      // exactly one None to signal timeout; `true` keeps an observe
      // stream alive with retransmission spent
      let keep = (ex.on_reply)(None);
      if keep {
        ex.retry = None;
        ex.expires_at = None;
        self.exchanges.push(ex);
      }
    }

    Ok(())
  }
}

/// Minimal big-endian encoding of a CoAP uint option value
fn uint_bytes(n: u32) -> Vec<u8> {
  let bytes = n.to_be_bytes();
  let skip = bytes.iter().take_while(|b| **b == 0).count();
  bytes[skip..].to_vec()
}

#[cfg(test)]
mod tests {
  use ::std::sync::{Arc, Mutex};

  use newt_msg::resp_code;

  use super::*;
  use crate::server::{Reply, Resource};
  use crate::test::{dummy_addr, dummy_addr_2, ms, ClockMock, SockMock};

  type TestCore = Core<SockMock, ClockMock>;

  fn client() -> TestCore {
    Core::new(ClockMock::new(), SockMock::new())
  }

  fn hello_server() -> TestCore {
    let mut core = Core::new(ClockMock::new(), SockMock::new());
    core.server_mut()
        .register(Resource::new("hello").discoverable().on_get(Box::new(|_| {
                    Reply::content(b"world".to_vec(), newt_msg::ContentFormat::Text)
                  })));
    core
  }

  /// Move every outbound datagram of `from` into the receive queue
  /// of `to`, stamped as sent by `from_addr`
  fn shuttle(from: &TestCore, to: &TestCore, from_addr: SocketAddr) {
    let mut tx = from.sock.tx.lock().unwrap();
    let mut rx = to.sock.rx.lock().unwrap();
    for Addrd(bytes, _) in tx.drain(..) {
      rx.push(Addrd(bytes, from_addr));
    }
  }

  fn con_get(path: &str) -> Message {
    let mut msg = Message::new(Type::Con, Code::GET, Id(0), Token(Default::default()));
    msg.set_path(path);
    msg
  }

  #[test]
  fn con_get_round_trip() {
    let mut client = client();
    let mut server = hello_server();

    let got: Arc<Mutex<Vec<(Code, Vec<u8>)>>> = Default::default();
    let got_in_cb = got.clone();

    client.send_req(con_get("hello"),
                    dummy_addr(),
                    Box::new(move |reply| {
                      let reply = reply.expect("no timeout expected");
                      got_in_cb.lock()
                               .unwrap()
                               .push((reply.data().code, reply.data().payload.0.clone()));
                      false
                    }))
          .unwrap();

    shuttle(&client, &server, dummy_addr_2());
    server.poll().unwrap();
    shuttle(&server, &client, dummy_addr());
    client.poll().unwrap();

    let got = got.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, resp_code::CONTENT);
    assert_eq!(u8::from(got[0].0), 0x45);
    assert_eq!(got[0].1, b"world");
    assert_eq!(client.pending_count(), 0);
  }

  #[test]
  fn con_retransmits_then_finalizes() {
    let mut client = client();
    let timeouts: Arc<Mutex<u32>> = Default::default();
    let timeouts_in_cb = timeouts.clone();

    client.send_req(con_get("hello"),
                    dummy_addr(),
                    Box::new(move |reply| {
                      assert!(reply.is_none());
                      *timeouts_in_cb.lock().unwrap() += 1;
                      false
                    }))
          .unwrap();

    // one transmission so far
    assert_eq!(client.sock.tx.lock().unwrap().len(), 1);

    // worst-case schedule: 3s, +6s, +12s, +24s; each poll past the
    // deadline performs one retransmission
    for t in [ms(3_100), ms(9_200), ms(21_300), ms(45_400)] {
      client.clock.set(t);
      client.poll().unwrap();
    }
    assert_eq!(client.sock.tx.lock().unwrap().len(), 5);
    assert_eq!(*timeouts.lock().unwrap(), 0);

    // attempts are spent; the next tick finalizes
    client.clock.set(ms(100_000));
    client.poll().unwrap();

    assert_eq!(client.sock.tx.lock().unwrap().len(), 5);
    assert_eq!(*timeouts.lock().unwrap(), 1);
    assert_eq!(client.pending_count(), 0);
  }

  #[test]
  fn ack_removes_exchange_within_one_tick() {
    let mut client = client();

    client.send_req(con_get("hello"), dummy_addr(), Box::new(|_| false))
          .unwrap();

    let sent = SockMock::sent_msgs(&client.sock.tx, dummy_addr());
    let ack = sent[0].ack();

    client.sock
          .rx
          .lock()
          .unwrap()
          .push(Addrd(ack.try_into_bytes().unwrap(), dummy_addr()));
    client.poll().unwrap();

    assert_eq!(client.pending_count(), 0);
  }

  #[test]
  fn reset_cancels_exchange() {
    let mut client = client();
    let cancelled: Arc<Mutex<bool>> = Default::default();
    let cancelled_in_cb = cancelled.clone();

    client.send_req(con_get("hello"),
                    dummy_addr(),
                    Box::new(move |reply| {
                      assert!(reply.is_none());
                      *cancelled_in_cb.lock().unwrap() = true;
                      false
                    }))
          .unwrap();

    let sent = SockMock::sent_msgs(&client.sock.tx, dummy_addr());
    let rst = sent[0].reset();

    client.sock
          .rx
          .lock()
          .unwrap()
          .push(Addrd(rst.try_into_bytes().unwrap(), dummy_addr()));
    client.poll().unwrap();

    assert!(*cancelled.lock().unwrap());
    assert_eq!(client.pending_count(), 0);
  }

  #[test]
  fn ping_pongs() {
    let mut client = client();
    let ponged: Arc<Mutex<bool>> = Default::default();
    let ponged_in_cb = ponged.clone();

    client.ping(dummy_addr(),
                Box::new(move |reply| {
                  *ponged_in_cb.lock().unwrap() = reply.is_some();
                  false
                }))
          .unwrap();

    let sent = SockMock::sent_msgs(&client.sock.tx, dummy_addr());
    assert_eq!(sent[0].code, Code::EMPTY);
    assert_eq!(sent[0].ty, Type::Con);

    let rst = sent[0].reset();
    client.sock
          .rx
          .lock()
          .unwrap()
          .push(Addrd(rst.try_into_bytes().unwrap(), dummy_addr()));
    client.poll().unwrap();

    assert!(*ponged.lock().unwrap());
    assert_eq!(client.pending_count(), 0);
  }

  #[test]
  fn duplicate_requests_are_answered_from_cache() {
    let hits: Arc<Mutex<u32>> = Default::default();
    let hits_in_handler = hits.clone();

    let mut server = client();
    server.server_mut()
          .register(Resource::new("hit").on_get(Box::new(move |_| {
                      *hits_in_handler.lock().unwrap() += 1;
                      Reply::content(b"ow".to_vec(), newt_msg::ContentFormat::Text)
                    })));

    let mut req = con_get("hit");
    req.id = Id(77);
    req.token = Token::from_random(1);
    let bytes: Vec<u8> = req.try_into_bytes().unwrap();

    for _ in 0..2 {
      server.sock
            .rx
            .lock()
            .unwrap()
            .push(Addrd(bytes.clone(), dummy_addr()));
      server.poll().unwrap();
    }

    assert_eq!(*hits.lock().unwrap(), 1);

    // both the original and the replay went out
    let responses = SockMock::sent_msgs(&server.sock.tx, dummy_addr());
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0], responses[1]);
  }

  #[test]
  fn observe_notify_and_cancel() {
    let mut server = client();
    server.server_mut()
          .register(Resource::new("temp").observable().on_get(Box::new(|_| {
                      Reply::content(b"20C".to_vec(), newt_msg::ContentFormat::Text)
                    })));

    let mut client = client();
    let notifications: Arc<Mutex<Vec<Token>>> = Default::default();
    let notifications_in_cb = notifications.clone();

    let mut req = con_get("temp");
    req.set_observe(observe::Action::Register);
    let token = client.send_req(req,
                                dummy_addr(),
                                Box::new(move |reply| {
                                  let reply = reply.expect("no timeout expected");
                                  notifications_in_cb.lock()
                                                     .unwrap()
                                                     .push(reply.data().token);
                                  true
                                }))
                      .unwrap();

    shuttle(&client, &server, dummy_addr_2());
    server.poll().unwrap();
    assert_eq!(server.observer_count(), 1);

    shuttle(&server, &client, dummy_addr());
    client.poll().unwrap();
    assert_eq!(notifications.lock().unwrap().len(), 1);

    // three notifications, all carrying the observer's token
    let path = crate::server::Path::from("temp");
    for _ in 0..3 {
      let mut note = Message::new(Type::Non,
                                  resp_code::CONTENT,
                                  Id(0),
                                  Token(Default::default()));
      note.payload = Payload(b"21C".to_vec());
      assert_eq!(server.send_notification(&path, note).unwrap(), 1);

      shuttle(&server, &client, dummy_addr());
      client.poll().unwrap();
    }

    {
      let notifications = notifications.lock().unwrap();
      assert_eq!(notifications.len(), 4);
      assert!(notifications.iter().all(|t| *t == token));
    }
    assert_eq!(client.pending_count(), 1);
    assert_eq!(client.observing_count(), 1);

    // cancel: unobserve packet goes out, server forgets us, further
    // notifications reach nobody
    assert!(client.unobserve(token).unwrap());
    assert_eq!(client.pending_count(), 0);

    shuttle(&client, &server, dummy_addr_2());
    server.poll().unwrap();
    assert_eq!(server.observer_count(), 0);

    let note = Message::new(Type::Non,
                            resp_code::CONTENT,
                            Id(0),
                            Token(Default::default()));
    assert_eq!(server.send_notification(&path, note).unwrap(), 0);
  }

  #[test]
  fn multicast_requires_non() {
    let mut client = client();
    let group = crate::multicast::all_coap_devices(5683);

    let result = client.send_req(con_get("x"), group, Box::new(|_| false));
    assert!(matches!(result,
                     Err(Error { what: What::MulticastRequiresNon,
                                 .. })));
  }

  #[test]
  fn multicast_discovery_collects_replies_until_timeout() {
    let mut client = client();
    let group = crate::multicast::link_local_discovery(5683);

    let replies: Arc<Mutex<Vec<Option<SocketAddr>>>> = Default::default();
    let replies_in_cb = replies.clone();

    let token = client.discover(group,
                                Box::new(move |reply| {
                                  replies_in_cb.lock()
                                               .unwrap()
                                               .push(reply.map(|r| r.addr()));
                                  reply.is_some()
                                }))
                      .unwrap();

    // two responders answer from their unicast addresses
    for responder in [dummy_addr(), dummy_addr_2()] {
      let mut resp = Message::new(Type::Non, resp_code::CONTENT, Id(9), token);
      resp.set_content_format(newt_msg::ContentFormat::LinkFormat);
      resp.payload = Payload(b"</hello>".to_vec());
      client.sock
            .rx
            .lock()
            .unwrap()
            .push(Addrd(resp.try_into_bytes().unwrap(), responder));
      client.poll().unwrap();
    }

    assert_eq!(replies.lock().unwrap().len(), 2);
    assert_eq!(client.pending_count(), 1);

    // the discovery window closes
    client.clock.set(ms(6_000));
    client.poll().unwrap();

    let replies = replies.lock().unwrap();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0], Some(dummy_addr()));
    assert_eq!(replies[1], Some(dummy_addr_2()));
    assert_eq!(replies[2], None);
    assert_eq!(client.pending_count(), 0);
  }

  #[test]
  fn pending_ids_are_unique_per_peer() {
    let mut client = client();

    for _ in 0..16 {
      client.send_req(con_get("x"), dummy_addr(), Box::new(|_| false))
            .unwrap();
    }

    let mut ids = client.exchanges
                        .iter()
                        .map(|e| e.id)
                        .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 16);
  }

  #[test]
  fn join_discovery_groups_joins_all() {
    let client = client();
    client.join_discovery_groups(&[0, 2]).unwrap();
    assert_eq!(client.sock.joined.lock().unwrap().len(), 6);
  }
}
