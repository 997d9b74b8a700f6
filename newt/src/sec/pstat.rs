use serde::{Deserialize, Serialize};

use super::{b64_uuid, Result, OM_CLIENT_DRIVEN, OM_SINGLE_SERVICE};

/// Provisioning Status: where the device stands in its provisioning
/// state machine.
///
/// Wire shape (CBOR map, Content-Format 60):
/// `{"isop": false, "deviceid": "<base64>", "ch": 0,
///   "cm": 2, "tm": 0, "om": 3, "sm": [3]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pstat {
  /// Is the device fully provisioned & operational?
  #[serde(rename = "isop")]
  pub is_operational: bool,

  /// The device's own UUID
  #[serde(rename = "deviceid", with = "b64_uuid")]
  pub device_id: [u8; 16],

  /// Commit hash of the last provisioning transaction
  #[serde(rename = "ch")]
  pub commit_hash: u16,

  /// Current provisioning-mode bitmask
  #[serde(rename = "cm")]
  pub current_mode: i64,

  /// Target provisioning-mode bitmask
  #[serde(rename = "tm")]
  pub target_mode: i64,

  /// Operation-mode bitmask (who drives provisioning, and for how
  /// many services)
  #[serde(rename = "om")]
  pub operation_mode: i64,

  /// Operation modes the device supports
  #[serde(rename = "sm")]
  pub supported_modes: Vec<i64>,
}

impl Pstat {
  /// The PSTAT of a factory-fresh device: not operational, waiting
  /// to be taken through client-driven single-service provisioning.
  pub fn unprovisioned(device_id: [u8; 16]) -> Self {
    Pstat { is_operational: false,
            device_id,
            commit_hash: 0,
            current_mode: 0,
            target_mode: 0,
            operation_mode: OM_SINGLE_SERVICE | OM_CLIENT_DRIVEN,
            supported_modes: vec![OM_SINGLE_SERVICE | OM_CLIENT_DRIVEN] }
  }

  /// Does the device support operating in `mode`?
  pub fn supports_mode(&self, mode: i64) -> bool {
    self.supported_modes.contains(&mode)
  }

  /// Encode as the CBOR the security resources serve
  pub fn to_cbor(&self) -> Result<Vec<u8>> {
    let mut out = vec![];
    ciborium::ser::into_writer(self, &mut out)?;
    Ok(out)
  }

  /// Decode from CBOR
  pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
    Ok(ciborium::de::from_reader(bytes)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cbor_round_trip() {
    let pstat = Pstat::unprovisioned([9; 16]);
    let bytes = pstat.to_cbor().unwrap();
    assert_eq!(Pstat::from_cbor(&bytes).unwrap(), pstat);
  }

  #[test]
  fn fresh_device_wants_client_driven_single_service() {
    let pstat = Pstat::unprovisioned([9; 16]);
    assert!(!pstat.is_operational);
    assert!(pstat.supports_mode(OM_SINGLE_SERVICE | OM_CLIENT_DRIVEN));
  }

  #[test]
  fn json_shape_uses_oic_field_names() {
    let pstat = Pstat::unprovisioned([0; 16]);
    let json = serde_json::to_string(&pstat).unwrap();
    assert_eq!(json,
               concat!(r#"{"isop":false,"deviceid":"AAAAAAAAAAAAAAAAAAAAAA==","#,
                       r#""ch":0,"cm":0,"tm":0,"om":3,"sm":[3]}"#));
  }
}
