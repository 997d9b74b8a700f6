//! Option numbers known to this library (RFC 7252 Section 12.2,
//! RFC 7641 Section 2).

macro_rules! opt {
  (#[doc = $doc:expr] $name:ident = $n:literal) => {
    #[doc = $doc]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: crate::OptNumber = crate::OptNumber($n);
  };
}

pub(crate) use opt;

/// Non-repeatable options
pub mod no_repeat {
  use super::opt;

  opt!(#[doc = "Uri-Host"]
       HOST = 3);
  opt!(#[doc = "If-None-Match"]
       IF_NONE_MATCH = 5);
  opt!(#[doc = "Observe (<https://www.rfc-editor.org/rfc/rfc7641#section-2>)"]
       OBSERVE = 6);
  opt!(#[doc = "Uri-Port"]
       PORT = 7);
  opt!(#[doc = "Content-Format"]
       CONTENT_FORMAT = 12);
  opt!(#[doc = "Max-Age"]
       MAX_AGE = 14);
  opt!(#[doc = "Accept"]
       ACCEPT = 17);
  opt!(#[doc = "Proxy-Uri"]
       PROXY_URI = 35);
  opt!(#[doc = "Proxy-Scheme"]
       PROXY_SCHEME = 39);
}

/// Repeatable options
pub mod repeat {
  use super::opt;

  opt!(#[doc = "If-Match"]
       IF_MATCH = 1);
  opt!(#[doc = "ETag"]
       ETAG = 4);
  opt!(#[doc = "Location-Path"]
       LOCATION_PATH = 8);
  opt!(#[doc = "Uri-Path"]
       PATH = 11);
  opt!(#[doc = "Uri-Query"]
       QUERY = 15);
  opt!(#[doc = "Location-Query"]
       LOCATION_QUERY = 20);
}

/// Observe option values
pub mod observe {
  /// When included in a GET request, the Observe Option extends the GET
  /// method so it does not only retrieve a current representation of the
  /// target resource, but also requests the server to add or remove an
  /// entry in the list of observers of the resource depending on the
  /// option value.  The list entry consists of the client endpoint and the
  /// token specified by the client in the request.
  #[derive(Hash, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
  pub enum Action {
    /// Tells the resource owner we would like to observe updates to
    /// the resource we've issued a GET request for.
    Register,
    /// Tells the resource owner we would no longer like to observe updates to
    /// the resource we've issued a GET request for.
    Deregister,
  }

  impl Action {
    /// Try to parse from a single byte
    pub fn from_byte(n: u8) -> Option<Self> {
      match n {
        | 0 => Some(Action::Register),
        | 1 => Some(Action::Deregister),
        | _ => None,
      }
    }
  }

  impl From<Action> for u8 {
    fn from(a: Action) -> Self {
      match a {
        | Action::Register => 0,
        | Action::Deregister => 1,
      }
    }
  }
}

/// Content-Format
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentFormat {
  /// `text/plain; charset=utf-8`
  Text,
  /// `application/link-format`
  LinkFormat,
  /// `application/xml`
  Xml,
  /// `application/octet-stream`
  OctetStream,
  /// `application/exi`
  Exi,
  /// `application/json`
  Json,
  /// `application/cbor`
  Cbor,
  /// Another content format
  Other(u16),
}

impl ContentFormat {
  /// Convert this content format to the CoAP byte value
  pub fn bytes(&self) -> [u8; 2] {
    u16::from(self).to_be_bytes()
  }
}

impl<'a> From<&'a ContentFormat> for u16 {
  fn from(f: &'a ContentFormat) -> Self {
    use ContentFormat::*;
    match *f {
      | Text => 0,
      | LinkFormat => 40,
      | Xml => 41,
      | OctetStream => 42,
      | Exi => 47,
      | Json => 50,
      | Cbor => 60,
      | Other(n) => n,
    }
  }
}

impl From<u16> for ContentFormat {
  fn from(n: u16) -> Self {
    use ContentFormat::*;
    match n {
      | 0 => Text,
      | 40 => LinkFormat,
      | 41 => Xml,
      | 42 => OctetStream,
      | 47 => Exi,
      | 50 => Json,
      | 60 => Cbor,
      | n => Other(n),
    }
  }
}

impl<'a> IntoIterator for &'a ContentFormat {
  type Item = u8;

  type IntoIter = <[u8; 2] as IntoIterator>::IntoIter;

  fn into_iter(self) -> Self::IntoIter {
    self.bytes().into_iter()
  }
}
