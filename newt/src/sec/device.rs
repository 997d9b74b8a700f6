use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use newt_msg::{resp_code, ContentFormat, Message};
use zeroize::Zeroize;

use super::context::SecurityContext;
use super::{paths, Doxm, Pstat, Result, JW_PRF_LABEL, OXM_JUST_WORKS};
use crate::cred::{CredStore, IDENTITY_LEN, PSK_LEN};
use crate::error::ErrorKind;
use crate::net::{Addrd, Socket};
use crate::secure::{Cipher, CredLookup, SecureSocket};
use crate::server::{Reply, Resource, Server};

/// Where a device stands on the road to being owned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
  /// Factory fresh; will entertain a Just-Works advance
  Unowned,
  /// A claimant has selected Just-Works; anonymous ECDH handshakes
  /// are accepted while the transfer runs
  AnonEcdhEnabled,
  /// Owned; anonymous ECDH is off and traffic runs over the owner
  /// PSK
  Owned,
}

struct DeviceState {
  ctx: SecurityContext,
  state: OwnershipState,
}

/// PSK lookups for an owned device: the identity is the device's own
/// UUID, the key is whatever the ownership dance minted, fetched
/// fresh from disk per lookup so key material doesn't linger.
struct DeviceCreds {
  cred_path: PathBuf,
  device_id: [u8; 16],
}

impl CredLookup for DeviceCreds {
  fn get_id(&self,
            _peer: std::net::SocketAddr,
            buf: &mut [u8])
            -> core::result::Result<usize, ErrorKind> {
    if buf.len() < IDENTITY_LEN {
      return Err(ErrorKind::BufferTooSmall);
    }
    buf[..IDENTITY_LEN].copy_from_slice(&self.device_id);
    Ok(IDENTITY_LEN)
  }

  fn get_psk(&self, identity: &[u8], buf: &mut [u8]) -> core::result::Result<usize, ErrorKind> {
    let id = <[u8; IDENTITY_LEN]>::try_from(identity).map_err(|_| ErrorKind::InvalidArgument)?;

    if buf.len() < PSK_LEN {
      return Err(ErrorKind::BufferTooSmall);
    }

    // load → query → drop; the store wipes itself on the way out
    let store = CredStore::load(&self.cred_path).map_err(|_| ErrorKind::IoError)?;
    match store.find_psk_by_id(&id) {
      | Some(psk) => {
        buf[..PSK_LEN].copy_from_slice(psk);
        Ok(PSK_LEN)
      },
      | None => Err(ErrorKind::NoMatch),
    }
  }
}

/// The device side of OIC security: owns the DOXM/PSTAT records,
/// serves the four `/oic/sec/*` resources, and walks
/// UNOWNED → ANON_ECDH_ENABLED → OWNED as a claimant drives it.
pub struct SecurityDevice<S: Socket> {
  sock: Arc<SecureSocket<S>>,
  state: Arc<Mutex<DeviceState>>,
  cred_path: PathBuf,
  ctx_path: PathBuf,
}

impl<S: Socket> core::fmt::Debug for SecurityDevice<S> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f,
           "SecurityDevice {{ state: {:?} }}",
           self.state.lock().unwrap().state)
  }
}

impl<S: Socket + Send + Sync + 'static> SecurityDevice<S> {
  /// Bring up the security layer over `sock`.
  ///
  /// Restores persisted state from `ctx_path` when present (an owned
  /// device stays owned across reboots); otherwise starts factory
  /// fresh with `device_id`. Wires the credential callbacks of
  /// `sock` to the store at `cred_path`.
  pub fn new(sock: Arc<SecureSocket<S>>,
             device_id: [u8; 16],
             cred_path: PathBuf,
             ctx_path: PathBuf)
             -> Result<Self> {
    let ctx = match SecurityContext::load(&ctx_path)? {
      | Some(ctx) => ctx,
      | None => SecurityContext::fresh(device_id),
    };

    let state = if ctx.doxm.owned {
      OwnershipState::Owned
    } else {
      OwnershipState::Unowned
    };

    sock.set_credential_callbacks(Arc::new(DeviceCreds { cred_path: cred_path.clone(),
                                                         device_id: ctx.doxm.device_id }));
    sock.set_handshake_cipher(Cipher::PskAes128Ccm8);
    sock.set_anonymous_ecdh_enabled(false);

    log::info!("security device up, {:?}", state);

    Ok(Self { sock,
              state: Arc::new(Mutex::new(DeviceState { ctx, state })),
              cred_path,
              ctx_path })
  }

  /// Where the device stands right now
  pub fn ownership_state(&self) -> OwnershipState {
    self.state.lock().unwrap().state
  }

  /// The device's UUID
  pub fn device_id(&self) -> [u8; 16] {
    self.state.lock().unwrap().ctx.doxm.device_id
  }

  /// Register `/oic/sec/{doxm,pstat,cred,svc}` on a server.
  pub fn register_resources(&self, server: &mut Server) {
    server.register(self.doxm_resource());
    server.register(self.pstat_resource());
    server.register(self.cred_resource());
    server.register(self.svc_resource());
  }

  fn doxm_resource(&self) -> Resource {
    let state = self.state.clone();
    let get = move |_req: Addrd<&Message>| match state.lock().unwrap().ctx.doxm.to_cbor() {
      | Ok(bytes) => Reply::content(bytes, ContentFormat::Cbor),
      | Err(_) => Reply::code_only(resp_code::INTERNAL_SERVER_ERROR),
    };

    let state = self.state.clone();
    let sock = self.sock.clone();
    let cred_path = self.cred_path.clone();
    let ctx_path = self.ctx_path.clone();
    let put = move |req: Addrd<&Message>| {
      let incoming = match Doxm::from_cbor(req.data().payload.as_bytes()) {
        | Ok(incoming) => incoming,
        | Err(_) => return Reply::code_only(resp_code::BAD_REQUEST),
      };

      let mut st = state.lock().unwrap();
      match (st.state, incoming.owned) {
        | (OwnershipState::Owned, _) => Reply::code_only(resp_code::UNAUTHORIZED),

        // selecting the transfer method opens the anonymous window
        | (_, false) => {
          if incoming.selected_method != OXM_JUST_WORKS || !st.ctx.doxm.supports_just_works() {
            return Reply::code_only(resp_code::BAD_REQUEST);
          }

          st.ctx.doxm.selected_method = incoming.selected_method;
          st.state = OwnershipState::AnonEcdhEnabled;
          sock.set_anonymous_ecdh_enabled(true);
          log::info!("ownership transfer opened by {}", req.addr());
          Reply::code_only(resp_code::CHANGED)
        },

        // the claimant commits; mint the owner key from the live
        // anonymous handshake and close the window
        | (OwnershipState::AnonEcdhEnabled, true) => {
          let device_id = st.ctx.doxm.device_id;
          let mut psk = [0u8; PSK_LEN];

          let minted = sock.prf_keyblock(req.addr(),
                                         JW_PRF_LABEL,
                                         &incoming.owner,
                                         &device_id,
                                         &mut psk);
          if let Err(e) = minted {
            log::error!("owner key derivation failed: {:?}", e);
            return Reply::code_only(resp_code::INTERNAL_SERVER_ERROR);
          }

          let stored = CredStore::load(&cred_path).and_then(|mut store| {
                                                    store.add(device_id, psk)?;
                                                    store.save(&cred_path)
                                                  });
          psk.zeroize();

          if let Err(e) = stored {
            log::error!("storing owner key failed: {:?}", e);
            return Reply::code_only(resp_code::INTERNAL_SERVER_ERROR);
          }

          st.ctx.doxm.owned = true;
          st.ctx.doxm.owner = incoming.owner;
          st.ctx.pstat.is_operational = true;
          st.ctx.pstat.current_mode = st.ctx.pstat.target_mode;
          st.state = OwnershipState::Owned;

          if let Err(e) = st.ctx.save(&ctx_path) {
            log::error!("persisting security context failed: {:?}", e);
          }

          sock.set_anonymous_ecdh_enabled(false);
          sock.set_handshake_cipher(Cipher::PskAes128Ccm8);

          log::info!("owned; owner registered, anonymous ECDH disabled");
          Reply::code_only(resp_code::CHANGED)
        },

        // owned=true without the anonymous step first
        | (OwnershipState::Unowned, true) => Reply::code_only(resp_code::UNAUTHORIZED),
      }
    };

    Resource::new(paths::DOXM).discoverable()
                              .resource_type("oic.sec.doxm")
                              .on_get(Box::new(get))
                              .on_put(Box::new(put))
  }

  fn pstat_resource(&self) -> Resource {
    let state = self.state.clone();
    let get = move |_req: Addrd<&Message>| match state.lock().unwrap().ctx.pstat.to_cbor() {
      | Ok(bytes) => Reply::content(bytes, ContentFormat::Cbor),
      | Err(_) => Reply::code_only(resp_code::INTERNAL_SERVER_ERROR),
    };

    let state = self.state.clone();
    let ctx_path = self.ctx_path.clone();
    let put = move |req: Addrd<&Message>| {
      let incoming = match Pstat::from_cbor(req.data().payload.as_bytes()) {
        | Ok(incoming) => incoming,
        | Err(_) => return Reply::code_only(resp_code::BAD_REQUEST),
      };

      let mut st = state.lock().unwrap();

      if st.state == OwnershipState::Owned {
        return Reply::code_only(resp_code::UNAUTHORIZED);
      }
      if !st.ctx.pstat.supports_mode(incoming.operation_mode) {
        return Reply::code_only(resp_code::BAD_REQUEST);
      }

      st.ctx.pstat.operation_mode = incoming.operation_mode;
      st.ctx.pstat.target_mode = incoming.target_mode;
      st.ctx.pstat.commit_hash = incoming.commit_hash;

      if let Err(e) = st.ctx.save(&ctx_path) {
        log::error!("persisting security context failed: {:?}", e);
      }

      Reply::code_only(resp_code::CHANGED)
    };

    Resource::new(paths::PSTAT).discoverable()
                               .resource_type("oic.sec.pstat")
                               .on_get(Box::new(get))
                               .on_put(Box::new(put))
  }

  fn cred_resource(&self) -> Resource {
    // keys never leave the store, and Just-Works never provisions
    // them over the wire
    Resource::new(paths::CRED).resource_type("oic.sec.cred")
                              .on_get(Box::new(|_| Reply::code_only(resp_code::UNAUTHORIZED)))
                              .on_put(Box::new(|_| Reply::code_only(resp_code::BAD_REQUEST)))
  }

  fn svc_resource(&self) -> Resource {
    Resource::new(paths::SVC).resource_type("oic.sec.svc")
                             .on_get(Box::new(|_| {
                               // empty CBOR map; no services beyond the baseline
                               Reply::content(vec![0xA0], ContentFormat::Cbor)
                             }))
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::{Code, Id, Token, Type};

  use super::*;
  use crate::test::{dummy_addr, SockMock};

  fn tmp(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("newt-dev-{}-{}", std::process::id(), name))
  }

  fn device(name: &str) -> (SecurityDevice<SockMock>, Server) {
    let sock = Arc::new(SecureSocket::new_server(SockMock::new()).unwrap());
    let dev = SecurityDevice::new(sock,
                                  [0xD; 16],
                                  tmp(&format!("{}-creds.json", name)),
                                  tmp(&format!("{}-ctx.json", name))).unwrap();
    let mut server = Server::default();
    dev.register_resources(&mut server);
    (dev, server)
  }

  fn put_doxm(doxm: &Doxm) -> Message {
    let mut msg = Message::new(Type::Con, Code::PUT, Id(1), Token(Default::default()));
    msg.set_path(paths::DOXM);
    msg.set_content_format(ContentFormat::Cbor);
    msg.payload = newt_msg::Payload(doxm.to_cbor().unwrap());
    msg
  }

  #[test]
  fn fresh_device_serves_unowned_doxm() {
    let (_dev, mut server) = device("fresh");

    let mut get = Message::new(Type::Con, Code::GET, Id(1), Token(Default::default()));
    get.set_path(paths::DOXM);

    let reply = server.dispatch(Addrd(&get, dummy_addr()), true);
    assert_eq!(reply.code, resp_code::CONTENT);
    assert_eq!(reply.format, Some(ContentFormat::Cbor));

    let doxm = Doxm::from_cbor(&reply.payload).unwrap();
    assert!(!doxm.owned);
    assert_eq!(doxm.device_id, [0xD; 16]);
  }

  #[test]
  fn anon_put_opens_the_window() {
    let (dev, mut server) = device("anon");
    assert_eq!(dev.ownership_state(), OwnershipState::Unowned);

    let req = put_doxm(&Doxm::unowned([0xD; 16]));
    let reply = server.dispatch(Addrd(&req, dummy_addr()), true);

    assert_eq!(reply.code, resp_code::CHANGED);
    assert_eq!(dev.ownership_state(), OwnershipState::AnonEcdhEnabled);
  }

  #[test]
  fn owned_put_without_anon_step_is_refused() {
    let (dev, mut server) = device("skipanon");

    let mut owned = Doxm::unowned([0xD; 16]);
    owned.owned = true;
    owned.owner = [0xA; 16];

    let req = put_doxm(&owned);
    let reply = server.dispatch(Addrd(&req, dummy_addr()), true);

    assert_eq!(reply.code, resp_code::UNAUTHORIZED);
    assert_eq!(dev.ownership_state(), OwnershipState::Unowned);
  }

  #[test]
  fn owned_put_without_live_handshake_is_server_error() {
    // the window is open but there's no anonymous-ECDH session with
    // the claimant to mint a key from
    let (dev, mut server) = device("nohs");

    server.dispatch(Addrd(&put_doxm(&Doxm::unowned([0xD; 16])), dummy_addr()), true);
    assert_eq!(dev.ownership_state(), OwnershipState::AnonEcdhEnabled);

    let mut owned = Doxm::unowned([0xD; 16]);
    owned.owned = true;
    owned.owner = [0xA; 16];

    let reply = server.dispatch(Addrd(&put_doxm(&owned), dummy_addr()), true);
    assert_eq!(reply.code, resp_code::INTERNAL_SERVER_ERROR);
    assert_eq!(dev.ownership_state(), OwnershipState::AnonEcdhEnabled);
  }

  #[test]
  fn malformed_doxm_payload_is_bad_request() {
    let (_dev, mut server) = device("badput");

    let mut req = Message::new(Type::Con, Code::PUT, Id(1), Token(Default::default()));
    req.set_path(paths::DOXM);
    req.payload = newt_msg::Payload(b"not cbor".to_vec());

    assert_eq!(server.dispatch(Addrd(&req, dummy_addr()), true).code,
               resp_code::BAD_REQUEST);
  }

  #[test]
  fn pstat_put_selects_operation_mode() {
    let (dev, mut server) = device("pstat");

    let mut pstat = Pstat::unprovisioned([0xD; 16]);
    pstat.operation_mode = super::super::OM_SINGLE_SERVICE | super::super::OM_CLIENT_DRIVEN;

    let mut req = Message::new(Type::Con, Code::PUT, Id(1), Token(Default::default()));
    req.set_path(paths::PSTAT);
    req.set_content_format(ContentFormat::Cbor);
    req.payload = newt_msg::Payload(pstat.to_cbor().unwrap());

    assert_eq!(server.dispatch(Addrd(&req, dummy_addr()), true).code,
               resp_code::CHANGED);
    assert_eq!(dev.ownership_state(), OwnershipState::Unowned);
  }

  #[test]
  fn device_serves_doxm_through_an_engine() {
    // the engine and the security device share one transport
    use newt_msg::TryIntoBytes;

    use crate::core::Core;
    use crate::test::ClockMock;

    let sock = Arc::new(SecureSocket::new_server(SockMock::new()).unwrap());
    let dev = SecurityDevice::new(sock.clone(),
                                  [0xE; 16],
                                  tmp("engine-creds.json"),
                                  tmp("engine-ctx.json")).unwrap();

    let mut core = Core::new(ClockMock::new(), sock.clone());
    core.mark_transport_secure();
    dev.register_resources(core.server_mut());

    // plaintext arrives as if a completed DTLS session delivered it
    let mut get = Message::new(Type::Con, Code::GET, Id(4), Token(Default::default()));
    get.set_path(paths::DOXM);
    sock.push_rx(crate::net::Addrd(get.try_into_bytes().unwrap(), dummy_addr()));

    // the engine dispatches to the device's doxm resource; its
    // piggy-backed response queues for encryption and, with no DTLS
    // session to carry it, surfaces "not connected" rather than ever
    // touching clear text
    assert!(core.poll().is_err());
    assert!(sock.inner().tx.lock().unwrap().is_empty());
    assert_eq!(dev.device_id(), [0xE; 16]);
  }

  #[test]
  fn cred_resource_keeps_its_secrets() {
    let (_dev, mut server) = device("cred");

    let mut get = Message::new(Type::Con, Code::GET, Id(1), Token(Default::default()));
    get.set_path(paths::CRED);

    assert_eq!(server.dispatch(Addrd(&get, dummy_addr()), true).code,
               resp_code::UNAUTHORIZED);
  }
}
