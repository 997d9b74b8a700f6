use core::str::{from_utf8, Utf8Error};

use tinyvec::ArrayVec;

use crate::from_bytes::TryConsumeBytes;
use crate::{Cursor, TryFromBytes, MAX_PACKET_SIZE};

/// Message Code
pub mod code;

/// Message parsing errors
pub mod parse_error;

/// Message ID
pub mod id;

/// Message Options
pub mod opt;

/// Message Type
pub mod ty;

/// Message Token
pub mod token;

/// Message Version
pub mod ver;

pub use code::*;
pub use id::*;
pub use opt::*;
pub use parse_error::*;
pub use token::*;
pub use ty::*;
pub use ver::*;

/// The message body; whatever bytes follow the `0xFF` payload marker.
///
/// An absent marker means an empty payload.
#[derive(Default, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload(pub Vec<u8>);

impl Payload {
  /// Convert a reference to a Payload to a byte slice
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }
}

/// Struct representing the first byte of a message.
///
/// ```text
/// CoAP version
/// |
/// |  Message type (request, response, empty)
/// |  |
/// |  |  Length of token, in bytes. (4-bit integer)
/// |  |  |
/// vv vv vvvv
/// 01 00 0000
/// ```
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq, Ord)]
pub(crate) struct Byte1 {
  pub(crate) ver: Version,
  pub(crate) ty: Type,
  pub(crate) tkl: u8,
}

impl TryFrom<u8> for Byte1 {
  type Error = MessageParseError;

  fn try_from(b: u8) -> Result<Self, Self::Error> {
    let ver = b >> 6; // bits 0 & 1
    let ty = b >> 4 & 0b11; // bits 2 & 3
    let tkl = b & 0b1111u8; // last 4 bits

    Ok(Byte1 { ver: Version(ver),
               ty: Type::try_from(ty)?,
               tkl })
  }
}

/// # CoAP Messages
/// This struct provides a high-level API for manipulating requests & responses,
/// while still being cheaply serializable to & from the byte layout of CoAP messages on the wire.
///
/// ## Options
/// Options (the CoAP equivalent to HTTP headers) can be manipulated with the
/// accessor methods below, which cover the options known to this library.
///
/// ## Constructing
/// [`Message::new`] is the most straightforward way to initialize messages,
/// though you may also initialize one with a struct literal.
///
/// ```
/// use newt_msg::{Code, Id, Message, Payload, Token, Type, Version};
///
/// let a = Message { id: Id(1),
///                   token: Token(Default::default()),
///                   ver: Version::default(),
///                   ty: Type::Con,
///                   code: Code::GET,
///                   payload: Payload(vec![]),
///                   opts: Default::default() };
///
/// let b = Message::new(Type::Con, Code::GET, Id(1), Token(Default::default()));
///
/// assert_eq!(a, b);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
  /// see [`Id`] for details
  pub id: Id,
  /// see [`Type`] for details
  pub ty: Type,
  /// see [`Version`] for details
  pub ver: Version,
  /// see [`Token`] for details
  pub token: Token,
  /// see [`Code`] for details
  pub code: Code,
  /// see [`opt::OptMap`] for details
  pub opts: OptMap,
  /// see [`Payload`]
  pub payload: Payload,
}

impl Message {
  /// Create a new message
  pub fn new(ty: Type, code: Code, id: Id, token: Token) -> Self {
    Self { id,
           token,
           ty,
           code,
           ver: Version::default(),
           payload: Payload(Default::default()),
           opts: OptMap::default() }
  }

  /// Get the payload
  pub fn payload(&self) -> &Payload {
    &self.payload
  }

  /// Set the payload, returning the old payload if there was one
  pub fn set_payload(&mut self, p: Payload) -> Option<Payload> {
    let mut old: Payload = p;
    core::mem::swap(&mut old, &mut self.payload);
    Some(old).filter(|old| !old.0.is_empty())
  }

  /// Create a new message that ACKs this one.
  ///
  /// An empty ACK shares the CONfirmable message's id and carries
  /// no token; a piggy-backed response would instead echo the token.
  pub fn ack(&self) -> Self {
    Self { id: self.id,
           token: Token(Default::default()),
           ver: Default::default(),
           ty: Type::Ack,
           code: Code::EMPTY,
           payload: Payload(Default::default()),
           opts: Default::default() }
  }

  /// Create a RESET rejecting this message.
  pub fn reset(&self) -> Self {
    Self { id: self.id,
           token: Token(Default::default()),
           ver: Default::default(),
           ty: Type::Reset,
           code: Code::EMPTY,
           payload: Payload(Default::default()),
           opts: Default::default() }
  }

  /// The number of bytes this message occupies on the wire
  pub fn wire_len(&self) -> usize {
    let header_size = 4;
    let payload_marker_size = if self.payload.0.is_empty() { 0 } else { 1 };
    let payload_size = self.payload.0.len();
    let token_size = self.token.0.len();
    let opts_size: usize = opt::opts_in_wire_order(&self.opts).map(|o| o.wire_len())
                                                              .sum();

    header_size + payload_marker_size + payload_size + token_size + opts_size
  }
}

/// Option accessors
impl Message {
  /// Insert a new value for a given option, alongside any existing values
  pub fn add(&mut self, n: OptNumber, v: OptValue) {
    self.opts.entry(n).or_default().push(v);
  }

  /// Replace any / all existing values with a new one,
  /// yielding the previous value(s)
  pub fn set(&mut self, n: OptNumber, v: OptValue) -> Option<Vec<OptValue>> {
    let old = self.opts.remove(&n);
    self.add(n, v);
    old
  }

  /// Get the number of values for a given option
  pub fn count(&self, n: OptNumber) -> usize {
    self.get(n).map(|a| a.len()).unwrap_or(0)
  }

  /// Get the value(s) of an option by number
  pub fn get(&self, n: OptNumber) -> Option<&Vec<OptValue>> {
    self.opts.get(&n)
  }

  /// Get the value of an option, taking the first if there are multiple.
  pub fn get_first(&self, n: OptNumber) -> Option<&OptValue> {
    self.get(n).and_then(|vs| vs.first())
  }

  /// Get the value of an option, and interpret it
  /// as a UTF-8 string
  pub fn get_str(&self, n: OptNumber) -> Result<Option<&str>, Utf8Error> {
    match self.get_first(n) {
      | Some(v) => from_utf8(&v.0).map(Some),
      | _ => Ok(None),
    }
  }

  /// Get all values for an option, and interpret them as UTF-8 strings
  pub fn get_strs(&self, n: OptNumber) -> Result<Vec<&str>, Utf8Error> {
    match self.get(n) {
      | Some(vs) => vs.iter().map(|s| from_utf8(&s.0)).collect(),
      | _ => Ok(vec![]),
    }
  }

  /// Get the value of an option, and interpret it as a u8
  pub fn get_u8(&self, n: OptNumber) -> Option<u8> {
    self.get_first(n)
        .filter(|bytes| bytes.0.len() == 1)
        .map(|bytes| bytes.0[0])
  }

  /// Get the value of an option, and interpret it as a u16
  pub fn get_u16(&self, n: OptNumber) -> Option<u16> {
    self.get_first(n)
        .filter(|bytes| bytes.0.len() == 2)
        .map(|bytes| u16::from_be_bytes([bytes.0[0], bytes.0[1]]))
  }

  /// Get the value of an option, and interpret it as a u32
  pub fn get_u32(&self, n: OptNumber) -> Option<u32> {
    self.get_first(n)
        .filter(|bytes| bytes.0.len() == 4)
        .map(|bytes| u32::from_be_bytes([bytes.0[0], bytes.0[1], bytes.0[2], bytes.0[3]]))
  }

  /// Remove all values for the option from this message,
  /// returning them if there were any.
  pub fn remove(&mut self, n: OptNumber) -> Option<Vec<OptValue>> {
    self.opts.remove(&n)
  }

  /// Update the value for the Uri-Host option,
  /// discarding any existing values.
  pub fn set_host<S>(&mut self, host: S)
    where S: AsRef<str>
  {
    self.set(known::no_repeat::HOST,
             host.as_ref().bytes().collect());
  }

  /// Get the value for the Uri-Host option
  pub fn host(&self) -> Result<Option<&str>, Utf8Error> {
    self.get_str(known::no_repeat::HOST)
  }

  /// Update the value for the Uri-Port option,
  /// discarding any existing values.
  pub fn set_port(&mut self, port: u16) {
    self.set(known::no_repeat::PORT,
             port.to_be_bytes().into_iter().collect());
  }

  /// Get the value for the Uri-Port option
  pub fn port(&self) -> Option<u16> {
    self.get_u16(known::no_repeat::PORT)
  }

  /// Update the value for the Uri-Path option,
  /// discarding any existing values.
  ///
  /// ```
  /// use newt_msg::{Code, Id, Message, Token, Type};
  ///
  /// let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token(Default::default()));
  ///
  /// msg.set_path("oic/sec/doxm");
  /// assert_eq!(msg.path_string(), Ok("oic/sec/doxm".to_string()));
  /// ```
  pub fn set_path<S>(&mut self, path: S)
    where S: AsRef<str>
  {
    self.remove(known::repeat::PATH);
    path.as_ref()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .for_each(|segment| {
          self.add(known::repeat::PATH, segment.bytes().collect());
        });
  }

  /// Get the Uri-Path segments
  pub fn path(&self) -> Result<Vec<&str>, Utf8Error> {
    self.get_strs(known::repeat::PATH)
  }

  /// Get the fully built path, joining segments with '/'.
  pub fn path_string(&self) -> Result<String, Utf8Error> {
    self.path().map(|segs| segs.join("/"))
  }

  /// Insert a new value for the Uri-Query option,
  /// alongside any existing values.
  pub fn add_query<S>(&mut self, query: S)
    where S: AsRef<str>
  {
    self.add(known::repeat::QUERY, query.as_ref().bytes().collect());
  }

  /// Get all query parameters for this request
  pub fn query(&self) -> Result<Vec<&str>, Utf8Error> {
    self.get_strs(known::repeat::QUERY)
  }

  /// Update the value for the Content-Format option,
  /// discarding any existing values.
  pub fn set_content_format(&mut self, format: ContentFormat) {
    self.set(known::no_repeat::CONTENT_FORMAT,
             format.into_iter().collect());
  }

  /// Get the value for the Content-Format option
  ///
  /// ```
  /// use newt_msg::ContentFormat::Cbor;
  /// use newt_msg::{Code, Id, Message, Token, Type};
  ///
  /// let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token(Default::default()));
  ///
  /// msg.set_content_format(Cbor);
  /// assert_eq!(msg.content_format(), Some(Cbor));
  /// ```
  pub fn content_format(&self) -> Option<ContentFormat> {
    self.get_u16(known::no_repeat::CONTENT_FORMAT)
        .map(ContentFormat::from)
  }

  /// Update the value for the Accept option,
  /// discarding any existing values.
  pub fn set_accept(&mut self, format: ContentFormat) {
    self.set(known::no_repeat::ACCEPT, format.into_iter().collect());
  }

  /// Get the value for the Accept option
  pub fn accept(&self) -> Option<ContentFormat> {
    self.get_u16(known::no_repeat::ACCEPT)
        .map(ContentFormat::from)
  }

  /// Set the value for the Observe option,
  /// discarding any existing values.
  pub fn set_observe(&mut self, a: observe::Action) {
    self.set(known::no_repeat::OBSERVE,
             core::iter::once(u8::from(a)).collect());
  }

  /// Get the value for the Observe option
  pub fn observe(&self) -> Option<observe::Action> {
    self.get_u8(known::no_repeat::OBSERVE)
        .and_then(observe::Action::from_byte)
  }

  /// Update the value for the Max-Age option,
  /// discarding any existing values.
  pub fn set_max_age(&mut self, max_age_seconds: u32) {
    self.set(known::no_repeat::MAX_AGE,
             max_age_seconds.to_be_bytes().into_iter().collect());
  }

  /// Get the value for the Max-Age option, in seconds
  pub fn max_age_seconds(&self) -> Option<u32> {
    self.get_u32(known::no_repeat::MAX_AGE)
  }
}

impl<Bytes: AsRef<[u8]>> TryFromBytes<Bytes> for Message {
  type Error = MessageParseError;

  fn try_from_bytes(bytes: Bytes) -> Result<Self, Self::Error> {
    if bytes.as_ref().len() > MAX_PACKET_SIZE {
      return Err(Self::Error::PacketTooLong(bytes.as_ref().len()));
    }

    let mut bytes = Cursor::new(bytes);

    let Byte1 { tkl, ty, ver } = bytes.next()
                                      .ok_or_else(MessageParseError::eof)?
                                      .try_into()?;

    if ver.0 != 1 {
      return Err(Self::Error::InvalidVersion(ver.0));
    }

    if tkl > 8 {
      return Err(Self::Error::InvalidTokenLength(tkl));
    }

    let code: Code = bytes.next().ok_or_else(MessageParseError::eof)?.into();
    let id: Id = Id::try_consume_bytes(&mut bytes)?;

    let token = bytes.take_exact(tkl as usize)
                     .ok_or_else(MessageParseError::eof)?;
    let token = ArrayVec::<[u8; 8]>::try_from(token).expect("tkl was checked to be <= 8");
    let token = Token(token);

    let opts = OptMap::try_consume_bytes(&mut bytes).map_err(Self::Error::OptParseError)?;

    let payload = Payload(bytes.take_until_end().to_vec());

    Ok(Message { id,
                 ty,
                 ver,
                 code,
                 token,
                 opts,
                 payload })
  }
}
