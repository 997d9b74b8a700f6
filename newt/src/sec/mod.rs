//! OIC device ownership & provisioning.
//!
//! Two sides of one dance:
//! - [`device`]: the thing being claimed. Serves
//!   `/oic/sec/{doxm,pstat,cred,svc}`, walks
//!   UNOWNED → ANON_ECDH_ENABLED → OWNED as the claiming client
//!   drives it, and registers the minted owner key with its
//!   credential store.
//! - [`pair`]: the claimant. Drives the Just-Works sequence
//!   (GET doxm, PUT doxm, GET pstat, PUT pstat, PUT doxm owned),
//!   derives the same owner key from the anonymous-ECDH handshake,
//!   and reconnects over PSK.
//!
//! Everything on the wire is CBOR (Content-Format 60); persisted
//! state is JSON in the platform's config directory.

use std::io;

use crate::cred;
use crate::error::{Classify, ErrorKind};

/// DOXM record & codec
pub mod doxm;
/// PSTAT record & codec
pub mod pstat;
/// persisted security context
pub mod context;
/// device-side ownership state machine
pub mod device;
/// client-side pairing driver
pub mod pair;

pub use device::{OwnershipState, SecurityDevice};
pub use doxm::Doxm;
pub use pair::{pair_request, PairResult, Pairing, StoreCreds};
pub use pstat::Pstat;

/// The ownership-transfer method this stack implements
pub const OXM_JUST_WORKS: i64 = 0;

/// Credential-type bit for symmetric pair-wise keys
pub const CRED_TYPE_SYMMETRIC_PAIR_WISE: i64 = 1;

/// Single-service provisioning bit of the PSTAT operation mode
pub const OM_SINGLE_SERVICE: i64 = 0x1;

/// Client-driven provisioning bit of the PSTAT operation mode
pub const OM_CLIENT_DRIVEN: i64 = 0x2;

/// The exporter label minting an owner PSK out of a Just-Works
/// handshake. Protocol-defined; passed verbatim to the DTLS PRF.
pub const JW_PRF_LABEL: &str = "oic.sec.doxm.jw";

/// Paths of the security resources
pub mod paths {
  /// Device Ownership Transfer Method
  pub const DOXM: &str = "oic/sec/doxm";
  /// Provisioning Status
  pub const PSTAT: &str = "oic/sec/pstat";
  /// Credentials
  pub const CRED: &str = "oic/sec/cred";
  /// Services
  pub const SVC: &str = "oic/sec/svc";
}

/// Security-layer result
pub type Result<T> = core::result::Result<T, Error>;

/// Things that can go wrong in the security layer
#[derive(Debug)]
pub enum Error {
  /// A CBOR payload would not parse
  DecodeCbor(ciborium::de::Error<io::Error>),
  /// A record would not encode (out of memory, in practice)
  EncodeCbor(ciborium::ser::Error<io::Error>),
  /// The credential store refused us
  Cred(cred::Error),
  /// The DTLS layer refused us
  Secure(crate::secure::Error),
  /// Reading or writing persisted state failed
  Io(io::Error),
  /// A record violated an invariant (e.g. owned with a zero owner)
  InvalidRecord,
}

impl From<ciborium::de::Error<io::Error>> for Error {
  fn from(e: ciborium::de::Error<io::Error>) -> Self {
    Self::DecodeCbor(e)
  }
}

impl From<ciborium::ser::Error<io::Error>> for Error {
  fn from(e: ciborium::ser::Error<io::Error>) -> Self {
    Self::EncodeCbor(e)
  }
}

impl From<cred::Error> for Error {
  fn from(e: cred::Error) -> Self {
    Self::Cred(e)
  }
}

impl From<crate::secure::Error> for Error {
  fn from(e: crate::secure::Error) -> Self {
    Self::Secure(e)
  }
}

impl From<io::Error> for Error {
  fn from(e: io::Error) -> Self {
    Self::Io(e)
  }
}

impl Classify for Error {
  fn kind(&self) -> ErrorKind {
    match self {
      | Error::DecodeCbor(_) | Error::InvalidRecord => ErrorKind::ProtocolError,
      | Error::EncodeCbor(_) => ErrorKind::OutOfMemory,
      | Error::Cred(e) => e.kind(),
      | Error::Secure(e) => e.kind(),
      | Error::Io(_) => ErrorKind::IoError,
    }
  }
}

/// serde shim: 16 raw bytes ⇄ base64 string, the encoding device &
/// owner UUIDs use in both the CBOR payloads and the JSON files
pub(crate) mod b64_uuid {
  use base64::Engine;
  use serde::{Deserialize, Deserializer, Serializer};

  pub(crate) fn serialize<S: Serializer>(bytes: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
  }

  pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D)
                                                      -> Result<[u8; 16], D::Error> {
    let s = String::deserialize(d)?;
    base64::engine::general_purpose::STANDARD.decode(&s)
                                             .ok()
                                             .and_then(|v| <[u8; 16]>::try_from(v.as_slice()).ok())
                                             .ok_or_else(|| {
                                               serde::de::Error::custom("expected base64 of 16 bytes")
                                             })
  }
}

/// This machine's persistent 16-byte identifier.
///
/// Falls back to `0xFF × 16` where the platform can't provide one;
/// a fleet of fallback-id devices can still talk, they just can't be
/// told apart as owners.
pub fn machine_id() -> [u8; 16] {
  std::fs::read_to_string("/etc/machine-id").ok()
                                            .and_then(|s| hex::decode(s.trim()).ok())
                                            .and_then(|v| <[u8; 16]>::try_from(v.as_slice()).ok())
                                            .unwrap_or([0xFF; 16])
}
