//! Identity → pre-shared-key associations.
//!
//! The store is a flat list with linear search; fleets this stack
//! targets hold single-digit numbers of peers, and a list we can
//! wipe byte-by-byte beats a hash map we can't.
//!
//! Key hygiene rules:
//! - every removal path zeroes both identity and key bytes before
//!   the memory is released ([`zeroize`])
//! - callers are encouraged to keep store lifetime short:
//!   load → query → drop

use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Classify, ErrorKind};

/// Length of a credential identity, in bytes
pub const IDENTITY_LEN: usize = 16;

/// Length of a pre-shared key, in bytes
pub const PSK_LEN: usize = 16;

/// Credential store result
pub type Result<T> = core::result::Result<T, Error>;

/// Things that can go wrong adding, loading or persisting credentials
#[derive(Debug)]
pub enum Error {
  /// An identity is already present with a different key.
  ///
  /// Overwriting an existing association silently would let a
  /// mis-provisioned peer shadow a good one, so it's an error;
  /// re-adding the exact same pair is fine and does nothing.
  ConflictingPsk,
  /// A persisted record held something other than base64 of 16 bytes
  MalformedRecord,
  /// The platform has no configuration directory
  NoConfigDir,
  /// Reading or writing the backing file failed
  Io(io::Error),
  /// The backing file held malformed JSON
  Json(serde_json::Error),
}

impl From<io::Error> for Error {
  fn from(e: io::Error) -> Self {
    Self::Io(e)
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Json(e)
  }
}

impl Classify for Error {
  fn kind(&self) -> ErrorKind {
    match self {
      | Error::ConflictingPsk => ErrorKind::InvalidArgument,
      | Error::MalformedRecord | Error::Json(_) => ErrorKind::ProtocolError,
      | Error::NoConfigDir => ErrorKind::NoMatch,
      | Error::Io(_) => ErrorKind::IoError,
    }
  }
}

/// One identity → PSK association.
///
/// Both halves are wiped when the entry is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Entry {
  id: [u8; IDENTITY_LEN],
  psk: [u8; PSK_LEN],
}

impl core::fmt::Debug for Entry {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    // never let key material wander into logs
    write!(f, "Entry {{ id: {:02x?}, psk: <hidden> }}", self.id)
  }
}

impl Entry {
  /// The identity half
  pub fn id(&self) -> &[u8; IDENTITY_LEN] {
    &self.id
  }

  /// The key half
  pub fn psk(&self) -> &[u8; PSK_LEN] {
    &self.psk
  }
}

/// The JSON shape credentials persist as:
/// `[{"id": "<base64>", "psk": "<base64>"}, …]`
#[derive(Serialize, Deserialize)]
struct Record {
  id: String,
  psk: String,
}

fn b64() -> impl Engine {
  base64::engine::general_purpose::STANDARD
}

fn decode16(s: &str) -> Result<[u8; 16]> {
  b64().decode(s)
       .ok()
       .and_then(|bytes| <[u8; 16]>::try_from(bytes.as_slice()).ok())
       .ok_or(Error::MalformedRecord)
}

/// A mapping from identity to pre-shared key.
///
/// ```
/// use newt::cred::CredStore;
///
/// let mut store = CredStore::default();
/// store.add([1; 16], [2; 16]).unwrap();
///
/// assert_eq!(store.find_psk_by_id(&[1; 16]), Some(&[2; 16]));
/// assert_eq!(store.find_psk_by_id(&[9; 16]), None);
///
/// // idempotent re-add is fine, conflicting overwrite is not
/// assert!(store.add([1; 16], [2; 16]).is_ok());
/// assert!(store.add([1; 16], [3; 16]).is_err());
/// ```
#[derive(Debug, Default)]
pub struct CredStore {
  entries: Vec<Entry>,
}

impl CredStore {
  /// Associate `psk` with `id`.
  ///
  /// Errors with [`Error::ConflictingPsk`] when `id` is already
  /// associated with a _different_ key; re-adding the same pair is
  /// accepted and does nothing.
  pub fn add(&mut self, id: [u8; IDENTITY_LEN], psk: [u8; PSK_LEN]) -> Result<()> {
    match self.entries.iter().find(|e| e.id == id) {
      | Some(e) if e.psk == psk => Ok(()),
      | Some(_) => Err(Error::ConflictingPsk),
      | None => {
        self.entries.push(Entry { id, psk });
        Ok(())
      },
    }
  }

  /// Look up the key for an identity
  pub fn find_psk_by_id(&self, id: &[u8; IDENTITY_LEN]) -> Option<&[u8; PSK_LEN]> {
    self.entries
        .iter()
        .find(|e| &e.id == id)
        .map(|e| &e.psk)
  }

  /// Forget everything, wiping each entry's bytes first
  pub fn clear(&mut self) {
    for entry in self.entries.iter_mut() {
      entry.zeroize();
    }
    self.entries.clear();
  }

  /// Number of stored associations
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Is the store empty?
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// The file credentials for `machine_id` live in, under the
  /// platform's configuration directory.
  ///
  /// The machine id is encoded with the url-safe base64 alphabet;
  /// the standard alphabet can produce `/` which no filesystem
  /// appreciates in a file name.
  pub fn default_path(machine_id: &[u8; 16]) -> Result<PathBuf> {
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(machine_id);
    dirs::config_dir().map(|dir| dir.join(format!("oic-creds-{}.json", encoded)))
                      .ok_or(Error::NoConfigDir)
  }

  /// Read a store from `path`. A missing file is an empty store.
  pub fn load(path: &Path) -> Result<Self> {
    let json = match std::fs::read_to_string(path) {
      | Ok(json) => json,
      | Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
      | Err(e) => return Err(e.into()),
    };

    let records: Vec<Record> = serde_json::from_str(&json)?;

    let mut store = Self::default();
    for rec in records {
      store.add(decode16(&rec.id)?, decode16(&rec.psk)?)?;
    }

    Ok(store)
  }

  /// Persist the store to `path` atomically (write tempfile, rename).
  pub fn save(&self, path: &Path) -> Result<()> {
    let records = self.entries
                      .iter()
                      .map(|e| Record { id: b64().encode(e.id),
                                        psk: b64().encode(e.psk) })
                      .collect::<Vec<_>>();

    let json = serde_json::to_string(&records)?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
  }
}

impl Drop for CredStore {
  fn drop(&mut self) {
    self.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn conflicting_add_is_rejected_and_original_survives() {
    let mut store = CredStore::default();
    store.add([1; 16], [2; 16]).unwrap();

    assert!(matches!(store.add([1; 16], [3; 16]),
                     Err(Error::ConflictingPsk)));
    assert_eq!(store.find_psk_by_id(&[1; 16]), Some(&[2; 16]));
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn reload_round_trips() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("newt-cred-test-{}.json", std::process::id()));

    let mut store = CredStore::default();
    store.add([0xAB; 16], [0xCD; 16]).unwrap();
    store.add([1; 16], [2; 16]).unwrap();
    store.save(&path).unwrap();

    let loaded = CredStore::load(&path).unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.find_psk_by_id(&[0xAB; 16]), Some(&[0xCD; 16]));

    std::fs::remove_file(&path).ok();
  }

  #[test]
  fn load_of_missing_file_is_empty() {
    let store = CredStore::load(Path::new("/definitely/not/here.json")).unwrap();
    assert!(store.is_empty());
  }

  #[test]
  fn entries_zeroize() {
    let mut entry = Entry { id: [1; 16],
                            psk: [2; 16] };
    entry.zeroize();
    assert_eq!(entry.id, [0; 16]);
    assert_eq!(entry.psk, [0; 16]);
  }

  #[test]
  fn persisted_shape_matches_wire_contract() {
    let mut store = CredStore::default();
    store.add([0; 16], [0; 16]).unwrap();

    let dir = std::env::temp_dir();
    let path = dir.join(format!("newt-cred-shape-{}.json", std::process::id()));
    store.save(&path).unwrap();

    let json = std::fs::read_to_string(&path).unwrap();
    assert_eq!(json,
               r#"[{"id":"AAAAAAAAAAAAAAAAAAAAAA==","psk":"AAAAAAAAAAAAAAAAAAAAAA=="}]"#);

    std::fs::remove_file(&path).ok();
  }
}
