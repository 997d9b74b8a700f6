use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{Doxm, Error, Pstat, Result};

/// The security state that survives reboots:
/// `{"doxm": {…}, "pstat": {…}}`, written atomically to the
/// platform's configuration directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
  /// See [`Doxm`]
  pub doxm: Doxm,
  /// See [`Pstat`]
  pub pstat: Pstat,
}

impl SecurityContext {
  /// The context of a factory-fresh device
  pub fn fresh(device_id: [u8; 16]) -> Self {
    SecurityContext { doxm: Doxm::unowned(device_id),
                      pstat: Pstat::unprovisioned(device_id) }
  }

  /// The file this machine's context lives in, under the platform's
  /// configuration directory
  pub fn default_path(machine_id: &[u8; 16]) -> Result<PathBuf> {
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(machine_id);
    dirs::config_dir().map(|dir| dir.join(format!("oic-security-context-{}.json", encoded)))
                      .ok_or_else(|| {
                        Error::Io(io::Error::new(io::ErrorKind::NotFound,
                                                 "no config directory on this platform"))
                      })
  }

  /// Read a persisted context. A missing file yields `None` (fresh
  /// device).
  pub fn load(path: &Path) -> Result<Option<Self>> {
    let json = match std::fs::read_to_string(path) {
      | Ok(json) => json,
      | Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      | Err(e) => return Err(e.into()),
    };

    let ctx: SecurityContext =
      serde_json::from_str(&json).map_err(|e| {
                                   Error::Io(io::Error::new(io::ErrorKind::InvalidData,
                                                            format!("{}", e)))
                                 })?;
    ctx.doxm.validate()?;
    Ok(Some(ctx))
  }

  /// Persist atomically (write tempfile, rename)
  pub fn save(&self, path: &Path) -> Result<()> {
    let json = serde_json::to_string(self).map_err(|e| {
                                            Error::Io(io::Error::new(io::ErrorKind::InvalidData,
                                                                     format!("{}", e)))
                                          })?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn save_load_round_trip() {
    let path = std::env::temp_dir().join(format!("newt-sec-ctx-{}.json", std::process::id()));

    let mut ctx = SecurityContext::fresh([3; 16]);
    ctx.doxm.owned = true;
    ctx.doxm.owner = [9; 16];
    ctx.pstat.is_operational = true;
    ctx.save(&path).unwrap();

    let loaded = SecurityContext::load(&path).unwrap().unwrap();
    assert_eq!(loaded, ctx);

    std::fs::remove_file(&path).ok();
  }

  #[test]
  fn missing_file_is_fresh() {
    assert!(SecurityContext::load(Path::new("/definitely/not/here.json")).unwrap()
                                                                         .is_none());
  }

  #[test]
  fn corrupt_owned_context_is_rejected() {
    let path = std::env::temp_dir().join(format!("newt-sec-bad-{}.json", std::process::id()));

    let mut ctx = SecurityContext::fresh([3; 16]);
    ctx.doxm.owned = true; // owner left zero
    let json = serde_json::to_string(&ctx).unwrap();
    std::fs::write(&path, json).unwrap();

    assert!(SecurityContext::load(&path).is_err());

    std::fs::remove_file(&path).ok();
  }
}
