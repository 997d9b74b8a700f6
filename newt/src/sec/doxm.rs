use serde::{Deserialize, Serialize};

use super::{b64_uuid, Error, Result, CRED_TYPE_SYMMETRIC_PAIR_WISE, OXM_JUST_WORKS};

/// Device Ownership Transfer Method: which ownership mechanisms a
/// device supports, and whether (and by whom) it is owned.
///
/// Wire shape (CBOR map, Content-Format 60):
/// `{"oxm": [0], "oxmsel": 0, "sct": 1, "owned": false,
///   "deviceid": "<base64>", "ownr": "<base64>"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doxm {
  /// Ownership-transfer methods the device supports
  #[serde(rename = "oxm")]
  pub supported_methods: Vec<i64>,

  /// The method selected for the transfer in progress (or last
  /// completed)
  #[serde(rename = "oxmsel")]
  pub selected_method: i64,

  /// Bitmask of credential types the device can hold
  #[serde(rename = "sct")]
  pub supported_cred_types: i64,

  /// Has ownership transfer completed?
  pub owned: bool,

  /// The device's own UUID
  #[serde(rename = "deviceid", with = "b64_uuid")]
  pub device_id: [u8; 16],

  /// The owner's UUID; all-zero until owned
  #[serde(rename = "ownr", with = "b64_uuid")]
  pub owner: [u8; 16],
}

impl Doxm {
  /// The DOXM of a factory-fresh Just-Works device
  pub fn unowned(device_id: [u8; 16]) -> Self {
    Doxm { supported_methods: vec![OXM_JUST_WORKS],
           selected_method: OXM_JUST_WORKS,
           supported_cred_types: CRED_TYPE_SYMMETRIC_PAIR_WISE,
           owned: false,
           device_id,
           owner: [0; 16] }
  }

  /// Does the record hold together? `owned` demands a nonzero owner.
  pub fn validate(&self) -> Result<()> {
    if self.owned && self.owner == [0; 16] {
      return Err(Error::InvalidRecord);
    }
    Ok(())
  }

  /// Is Just-Works on the menu?
  pub fn supports_just_works(&self) -> bool {
    self.supported_methods.contains(&OXM_JUST_WORKS)
  }

  /// Can the device hold a symmetric pair-wise key?
  pub fn supports_symmetric_creds(&self) -> bool {
    self.supported_cred_types & CRED_TYPE_SYMMETRIC_PAIR_WISE != 0
  }

  /// Encode as the CBOR the security resources serve
  pub fn to_cbor(&self) -> Result<Vec<u8>> {
    let mut out = vec![];
    ciborium::ser::into_writer(self, &mut out)?;
    Ok(out)
  }

  /// Decode from CBOR, checking invariants
  pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
    let doxm: Doxm = ciborium::de::from_reader(bytes)?;
    doxm.validate()?;
    Ok(doxm)
  }
}
