use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use newt_msg::{Code, ContentFormat, Id, Message, Payload, Token, Type};
use zeroize::Zeroize;

use super::{paths, Doxm, Pstat, JW_PRF_LABEL, OM_CLIENT_DRIVEN, OM_SINGLE_SERVICE,
            OXM_JUST_WORKS};
use crate::core::Core;
use crate::cred::{CredStore, IDENTITY_LEN, PSK_LEN};
use crate::error::ErrorKind;
use crate::net::Socket;
use crate::secure::{Cipher, CredLookup, SecureSocket};
use crate::time::Clock;

/// How a pairing attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairResult {
  /// Both sides hold the owner PSK; reconnect over
  /// PSK-AES128-CCM8 will succeed
  Success,
  /// The device already has an owner; nothing was changed
  AlreadyOwned,
  /// The device doesn't offer Just-Works
  UnsupportedPairingMethod,
  /// The device can't hold a symmetric pair-wise key
  UnsupportedCredentialType,
  /// The dance broke down (timeout, rejection, derivation failure)
  PairFailure,
}

/// PSK lookups for a claiming client: peers are identified by the
/// device UUID learned while pairing, keys come off disk per lookup.
#[derive(Debug)]
pub struct StoreCreds {
  path: PathBuf,
  peers: Mutex<HashMap<SocketAddr, [u8; 16]>>,
}

impl StoreCreds {
  /// Lookups backed by the credential file at `path`
  pub fn new(path: PathBuf) -> Self {
    Self { path,
           peers: Mutex::new(HashMap::new()) }
  }

  /// Teach the lookup which device UUID lives at `peer`
  pub fn set_peer_identity(&self, peer: SocketAddr, id: [u8; 16]) {
    self.peers.lock().unwrap().insert(peer, id);
  }
}

impl CredLookup for StoreCreds {
  fn get_id(&self, peer: SocketAddr, buf: &mut [u8]) -> Result<usize, ErrorKind> {
    let peers = self.peers.lock().unwrap();
    let id = peers.get(&peer).ok_or(ErrorKind::NoMatch)?;

    if buf.len() < IDENTITY_LEN {
      return Err(ErrorKind::BufferTooSmall);
    }
    buf[..IDENTITY_LEN].copy_from_slice(id);
    Ok(IDENTITY_LEN)
  }

  fn get_psk(&self, identity: &[u8], buf: &mut [u8]) -> Result<usize, ErrorKind> {
    let id = <[u8; IDENTITY_LEN]>::try_from(identity).map_err(|_| ErrorKind::InvalidArgument)?;

    if buf.len() < PSK_LEN {
      return Err(ErrorKind::BufferTooSmall);
    }

    let store = CredStore::load(&self.path).map_err(|_| ErrorKind::IoError)?;
    match store.find_psk_by_id(&id) {
      | Some(psk) => {
        buf[..PSK_LEN].copy_from_slice(psk);
        Ok(PSK_LEN)
      },
      | None => Err(ErrorKind::NoMatch),
    }
  }
}

/// Response slot a pairing step's reply callback deposits into:
/// `Some(None)` is a timeout, `Some(Some(msg))` is the reply.
type Slot = Arc<Mutex<Option<Option<Message>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  AwaitDoxm,
  AwaitDoxmAnonAck,
  AwaitPstat,
  AwaitPstatAck,
  AwaitDoxmOwnedAck,
  Done,
}

/// A Just-Works pairing attempt in flight.
///
/// Drive it from the reactor loop: after each [`Core::poll`], call
/// [`Pairing::drive`] until it yields a [`PairResult`].
#[allow(missing_debug_implementations)]
pub struct Pairing {
  addr: SocketAddr,
  my_id: [u8; 16],
  device_id: [u8; 16],
  state: State,
  slot: Slot,
  creds: Arc<StoreCreds>,
  result: Option<PairResult>,
}

/// Start claiming the unowned device at `addr` over `core`'s secure
/// socket.
///
/// Opens the anonymous-ECDH window on the local transport (closed
/// again on any terminal result) and sends the initial GET
/// `/oic/sec/doxm`. Tokens and message-ids for every request come
/// from the engine's ChaCha generator; seed it from a CSPRNG.
pub fn pair_request<S, C>(core: &mut Core<SecureSocket<S>, C>,
                          addr: SocketAddr,
                          creds: Arc<StoreCreds>)
                          -> Result<Pairing, crate::core::Error<crate::secure::Error>>
  where S: Socket,
        C: Clock
{
  core.sock().set_anonymous_ecdh_enabled(true);

  let mut pairing = Pairing { addr,
                              my_id: super::machine_id(),
                              device_id: [0; 16],
                              state: State::AwaitDoxm,
                              slot: Default::default(),
                              creds,
                              result: None };

  pairing.send(core, get_of(paths::DOXM))?;
  Ok(pairing)
}

fn get_of(path: &str) -> Message {
  let mut msg = Message::new(Type::Con, Code::GET, Id(0), Token(Default::default()));
  msg.set_path(path);
  msg
}

fn put_of(path: &str, payload: Vec<u8>) -> Message {
  let mut msg = Message::new(Type::Con, Code::PUT, Id(0), Token(Default::default()));
  msg.set_path(path);
  msg.set_content_format(ContentFormat::Cbor);
  msg.payload = Payload(payload);
  msg
}

impl Pairing {
  /// The terminal result, once there is one
  pub fn result(&self) -> Option<PairResult> {
    self.result
  }

  /// The device UUID learned from its DOXM (zeros until then)
  pub fn device_id(&self) -> [u8; 16] {
    self.device_id
  }

  fn send<S, C>(&mut self,
                core: &mut Core<SecureSocket<S>, C>,
                msg: Message)
                -> Result<(), crate::core::Error<crate::secure::Error>>
    where S: Socket,
          C: Clock
  {
    self.slot = Default::default();
    let slot = self.slot.clone();

    core.send_req(msg,
                  self.addr,
                  Box::new(move |reply| {
                    *slot.lock().unwrap() = Some(reply.map(|r| (*r.data()).clone()));
                    false
                  }))
        .map(|_| ())
  }

  /// Advance the dance as far as the collected replies allow.
  ///
  /// Returns the terminal [`PairResult`] once there is one; `None`
  /// while still in flight.
  pub fn drive<S, C>(&mut self,
                     core: &mut Core<SecureSocket<S>, C>)
                     -> Option<PairResult>
    where S: Socket,
          C: Clock
  {
    if let Some(result) = self.result {
      return Some(result);
    }

    let reply = match self.slot.lock().unwrap().take() {
      | Some(reply) => reply,
      | None => return None,
    };

    let reply = match reply {
      | Some(reply) => reply,
      | None => {
        log::warn!("pairing with {} timed out in {:?}", self.addr, self.state);
        return Some(self.finish(core, PairResult::PairFailure));
      },
    };

    let step = self.advance(core, reply);
    match step {
      | Ok(None) => None,
      | Ok(Some(result)) => Some(self.finish(core, result)),
      | Err(result) => Some(self.finish(core, result)),
    }
  }

  /// One state transition. `Ok(Some(_))`/`Err(_)` are terminal.
  fn advance<S, C>(&mut self,
                   core: &mut Core<SecureSocket<S>, C>,
                   reply: Message)
                   -> Result<Option<PairResult>, PairResult>
    where S: Socket,
          C: Clock
  {
    let changed = |reply: &Message| reply.code == newt_msg::resp_code::CHANGED;

    match self.state {
      | State::AwaitDoxm => {
        let doxm = Doxm::from_cbor(reply.payload.as_bytes()).map_err(|_| {
                                                              PairResult::PairFailure
                                                            })?;

        if doxm.owned {
          return Err(PairResult::AlreadyOwned);
        }
        if !doxm.supports_just_works() {
          return Err(PairResult::UnsupportedPairingMethod);
        }
        if !doxm.supports_symmetric_creds() {
          return Err(PairResult::UnsupportedCredentialType);
        }

        self.device_id = doxm.device_id;

        let mut select = Doxm::unowned(doxm.device_id);
        select.selected_method = OXM_JUST_WORKS;
        let payload = select.to_cbor().map_err(|_| PairResult::PairFailure)?;

        self.send(core, put_of(paths::DOXM, payload))
            .map_err(|_| PairResult::PairFailure)?;
        self.state = State::AwaitDoxmAnonAck;
        Ok(None)
      },

      | State::AwaitDoxmAnonAck => {
        if !changed(&reply) {
          return Err(PairResult::PairFailure);
        }

        self.send(core, get_of(paths::PSTAT))
            .map_err(|_| PairResult::PairFailure)?;
        self.state = State::AwaitPstat;
        Ok(None)
      },

      | State::AwaitPstat => {
        let mut pstat =
          Pstat::from_cbor(reply.payload.as_bytes()).map_err(|_| PairResult::PairFailure)?;

        let mode = OM_SINGLE_SERVICE | OM_CLIENT_DRIVEN;
        if !pstat.supports_mode(mode) {
          return Err(PairResult::PairFailure);
        }
        pstat.operation_mode = mode;

        let payload = pstat.to_cbor().map_err(|_| PairResult::PairFailure)?;
        self.send(core, put_of(paths::PSTAT, payload))
            .map_err(|_| PairResult::PairFailure)?;
        self.state = State::AwaitPstatAck;
        Ok(None)
      },

      | State::AwaitPstatAck => {
        if !changed(&reply) {
          return Err(PairResult::PairFailure);
        }

        let mut owned = Doxm::unowned(self.device_id);
        owned.owned = true;
        owned.owner = self.my_id;
        let payload = owned.to_cbor().map_err(|_| PairResult::PairFailure)?;

        self.send(core, put_of(paths::DOXM, payload))
            .map_err(|_| PairResult::PairFailure)?;
        self.state = State::AwaitDoxmOwnedAck;
        Ok(None)
      },

      | State::AwaitDoxmOwnedAck => {
        if !changed(&reply) {
          return Err(PairResult::PairFailure);
        }

        // mint the owner key from the live anonymous handshake,
        // then retire the session; the device derived the same key
        // from the same handshake
        let mut psk = [0u8; PSK_LEN];
        let minted = core.sock().prf_keyblock(self.addr,
                                              JW_PRF_LABEL,
                                              &self.my_id,
                                              &self.device_id,
                                              &mut psk);
        if let Err(e) = minted {
          log::error!("owner key derivation failed: {:?}", e);
          return Err(PairResult::PairFailure);
        }

        core.sock().close(self.addr);

        let stored = CredStore::load(&self.creds.path).and_then(|mut store| {
                                                        store.add(self.device_id, psk)?;
                                                        store.save(&self.creds.path)
                                                      });
        psk.zeroize();

        if let Err(e) = stored {
          log::error!("storing owner key failed: {:?}", e);
          return Err(PairResult::PairFailure);
        }

        self.creds.set_peer_identity(self.addr, self.device_id);
        Ok(Some(PairResult::Success))
      },

      | State::Done => Ok(self.result),
    }
  }

  /// Settle the terminal state: the anonymous window closes and the
  /// transport is left ready for PSK traffic.
  fn finish<S, C>(&mut self,
                  core: &mut Core<SecureSocket<S>, C>,
                  result: PairResult)
                  -> PairResult
    where S: Socket,
          C: Clock
  {
    core.sock().set_anonymous_ecdh_enabled(false);
    core.sock().set_handshake_cipher(Cipher::PskAes128Ccm8);

    if result != PairResult::Success {
      core.sock().close(self.addr);
    }

    log::info!("pairing with {}: {:?}", self.addr, result);
    self.state = State::Done;
    self.result = Some(result);
    result
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::resp_code;

  use super::*;
  use crate::test::{dummy_addr, ClockMock, SockMock};

  type PairCore = Core<SecureSocket<SockMock>, ClockMock>;

  fn tmp(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("newt-pair-{}-{}.json", std::process::id(), name))
  }

  fn pair_core() -> PairCore {
    let sock = SecureSocket::new_client(SockMock::new()).unwrap();
    Core::new(ClockMock::new(), sock)
  }

  /// Deposit `reply` as if the device had answered the outstanding
  /// request
  fn answer(pairing: &Pairing, reply: Option<Message>) {
    *pairing.slot.lock().unwrap() = Some(reply);
  }

  fn doxm_reply(doxm: &Doxm) -> Message {
    let mut msg = Message::new(Type::Ack,
                               resp_code::CONTENT,
                               Id(1),
                               Token(Default::default()));
    msg.payload = Payload(doxm.to_cbor().unwrap());
    msg
  }

  #[test]
  fn already_owned_device_short_circuits() {
    let mut core = pair_core();
    let creds = Arc::new(StoreCreds::new(tmp("owned")));
    let mut pairing = pair_request(&mut core, dummy_addr(), creds).unwrap();

    let mut doxm = Doxm::unowned([0xD; 16]);
    doxm.owned = true;
    doxm.owner = [0xA; 16];

    answer(&pairing, Some(doxm_reply(&doxm)));
    assert_eq!(pairing.drive(&mut core), Some(PairResult::AlreadyOwned));
    assert_eq!(pairing.result(), Some(PairResult::AlreadyOwned));
  }

  #[test]
  fn unsupported_method_is_reported() {
    let mut core = pair_core();
    let creds = Arc::new(StoreCreds::new(tmp("method")));
    let mut pairing = pair_request(&mut core, dummy_addr(), creds).unwrap();

    let mut doxm = Doxm::unowned([0xD; 16]);
    doxm.supported_methods = vec![99];

    answer(&pairing, Some(doxm_reply(&doxm)));
    assert_eq!(pairing.drive(&mut core),
               Some(PairResult::UnsupportedPairingMethod));
  }

  #[test]
  fn unsupported_cred_type_is_reported() {
    let mut core = pair_core();
    let creds = Arc::new(StoreCreds::new(tmp("credtype")));
    let mut pairing = pair_request(&mut core, dummy_addr(), creds).unwrap();

    let mut doxm = Doxm::unowned([0xD; 16]);
    doxm.supported_cred_types = 0;

    answer(&pairing, Some(doxm_reply(&doxm)));
    assert_eq!(pairing.drive(&mut core),
               Some(PairResult::UnsupportedCredentialType));
  }

  #[test]
  fn timeout_is_pair_failure() {
    let mut core = pair_core();
    let creds = Arc::new(StoreCreds::new(tmp("timeout")));
    let mut pairing = pair_request(&mut core, dummy_addr(), creds).unwrap();

    answer(&pairing, None);
    assert_eq!(pairing.drive(&mut core), Some(PairResult::PairFailure));
  }

  #[test]
  fn happy_path_walks_every_state() {
    let mut core = pair_core();
    let creds = Arc::new(StoreCreds::new(tmp("happy")));
    let mut pairing = pair_request(&mut core, dummy_addr(), creds).unwrap();

    answer(&pairing, Some(doxm_reply(&Doxm::unowned([0xD; 16]))));
    assert_eq!(pairing.drive(&mut core), None);
    assert_eq!(pairing.state, State::AwaitDoxmAnonAck);
    assert_eq!(pairing.device_id(), [0xD; 16]);
    core.sock().drop_queued();

    let changed = Message::new(Type::Ack,
                               resp_code::CHANGED,
                               Id(2),
                               Token(Default::default()));
    answer(&pairing, Some(changed.clone()));
    assert_eq!(pairing.drive(&mut core), None);
    assert_eq!(pairing.state, State::AwaitPstat);
    core.sock().drop_queued();

    let mut pstat_reply = Message::new(Type::Ack,
                                       resp_code::CONTENT,
                                       Id(3),
                                       Token(Default::default()));
    pstat_reply.payload = Payload(Pstat::unprovisioned([0xD; 16]).to_cbor().unwrap());
    answer(&pairing, Some(pstat_reply));
    assert_eq!(pairing.drive(&mut core), None);
    assert_eq!(pairing.state, State::AwaitPstatAck);
    core.sock().drop_queued();

    answer(&pairing, Some(changed.clone()));
    assert_eq!(pairing.drive(&mut core), None);
    assert_eq!(pairing.state, State::AwaitDoxmOwnedAck);
    core.sock().drop_queued();

    // the final ack arrives, but with no live anonymous handshake
    // to export from the derivation fails and pairing reports it
    answer(&pairing, Some(changed));
    assert_eq!(pairing.drive(&mut core), Some(PairResult::PairFailure));
  }

  #[test]
  fn store_creds_lookup() {
    let path = tmp("lookup");
    let mut store = CredStore::default();
    store.add([5; 16], [6; 16]).unwrap();
    store.save(&path).unwrap();

    let creds = StoreCreds::new(path.clone());
    creds.set_peer_identity(dummy_addr(), [5; 16]);

    let mut id = [0u8; IDENTITY_LEN];
    assert_eq!(creds.get_id(dummy_addr(), &mut id), Ok(IDENTITY_LEN));
    assert_eq!(id, [5; 16]);

    let mut psk = [0u8; PSK_LEN];
    assert_eq!(creds.get_psk(&id, &mut psk), Ok(PSK_LEN));
    assert_eq!(psk, [6; 16]);

    assert_eq!(creds.get_psk(&[9; 16], &mut psk), Err(ErrorKind::NoMatch));

    std::fs::remove_file(&path).ok();
  }
}
