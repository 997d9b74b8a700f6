use core::ops::{Add, Sub};
use std::collections::BTreeMap;

use crate::from_bytes::*;
use crate::Cursor;

/// Option parsing error
pub mod parse_error;
pub use parse_error::*;

/// Well-known options
pub mod known;
pub use known::*;

/// The map CoAP options live in, keyed by option number.
///
/// A `BTreeMap` keeps the keys sorted, which means serialization
/// emits options in strictly non-decreasing number order no matter
/// what order they were added in. Repeatable options (e.g. Uri-Path)
/// store one entry per occurrence, in insertion order.
pub type OptMap = BTreeMap<OptNumber, Vec<OptValue>>;

/// The "Option Delta" is the difference between this Option's Number
/// and the previous Option's number.
///
/// This is just used to compute the Option Number, identifying which
/// Option is being set (e.g. Content-Format has a Number of 12)
///
/// # Related
/// - [RFC7252#section-3.1 Option Format](https://datatracker.ietf.org/doc/html/rfc7252#section-3.1)
#[derive(Copy, Clone, Hash, PartialEq, PartialOrd, Eq, Ord, Debug, Default)]
pub struct OptDelta(pub u16);

/// Identifier of the option being set (e.g. Content-Format is 12)
///
/// # Related
/// - [RFC7252#section-12.2 Core CoAP Option Numbers](https://datatracker.ietf.org/doc/html/rfc7252#section-12.2)
#[derive(Copy, Clone, Hash, PartialEq, PartialOrd, Eq, Ord, Debug, Default)]
pub struct OptNumber(pub u32);

impl Add for OptNumber {
  type Output = OptNumber;

  fn add(self, rhs: Self) -> Self::Output {
    Self(self.0 + rhs.0)
  }
}

impl Sub for OptNumber {
  type Output = OptNumber;

  fn sub(self, rhs: Self) -> Self::Output {
    Self(self.0 - rhs.0)
  }
}

/// The value of an option, an opaque sequence of bytes
///
/// # Related
/// - [RFC7252#section-3.2 Option Value Formats](https://datatracker.ietf.org/doc/html/rfc7252#section-3.2)
#[derive(Clone, Hash, PartialEq, PartialOrd, Eq, Ord, Debug, Default)]
pub struct OptValue(pub Vec<u8>);

impl OptValue {
  /// Convert a reference to a OptValue to a byte slice
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }
}

impl FromIterator<u8> for OptValue {
  fn from_iter<T: IntoIterator<Item = u8>>(iter: T) -> Self {
    Self(iter.into_iter().collect())
  }
}

/// Low-level representation of a CoAP Option, closely mirroring the byte layout
/// of message options.
///
/// Notably, this doesn't include the Number (key, e.g. "Content-Format" or "Uri-Path");
/// on the wire the number is implied by the running sum of deltas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Opt {
  /// See [`OptDelta`]
  pub delta: OptDelta,
  /// See [`OptValue`]
  pub value: OptValue,
}

impl Opt {
  /// Given a collection to [`Extend`] and an Opt, add that Opt's bytes to the collection.
  pub fn extend_bytes(self, bytes: &mut impl Extend<u8>) {
    let (del, del_bytes) = crate::to_bytes::opt_len_or_delta(self.delta.0);
    let (len, len_bytes) = crate::to_bytes::opt_len_or_delta(self.value.0.len() as u16);
    let del = del << 4;

    let header = del | len;

    bytes.extend(Some(header));

    if let Some(bs) = del_bytes {
      bytes.extend(bs);
    }

    if let Some(bs) = len_bytes {
      bytes.extend(bs);
    }

    bytes.extend(self.value.0);
  }

  /// The number of bytes this option occupies on the wire
  pub fn wire_len(&self) -> usize {
    let ext_size = |n: usize| match n {
      | n if n >= 269 => 2,
      | n if n >= 13 => 1,
      | _ => 0,
    };

    1 + ext_size(self.delta.0 as usize) + ext_size(self.value.0.len()) + self.value.0.len()
  }
}

/// Walk an option map in wire order, yielding each occurrence with
/// its delta against the previous occurrence.
pub(crate) fn opts_in_wire_order(opts: &OptMap) -> impl Iterator<Item = Opt> + '_ {
  let mut last = OptNumber(0);
  opts.iter()
      .flat_map(|(num, values)| values.iter().map(move |v| (*num, v)))
      .map(move |(num, value)| {
        let OptNumber(delta) = num - last;
        last = num;
        Opt { delta: OptDelta(delta as u16),
              value: value.clone() }
      })
}

pub(crate) fn parse_opt_len_or_delta<A: AsRef<[u8]>>(head: u8,
                                                     bytes: &mut Cursor<A>,
                                                     reserved_err: OptParseError)
                                                     -> Result<u16, OptParseError> {
  match head {
    | 13 => {
      let n = bytes.next().ok_or_else(OptParseError::eof)?;
      Ok((n as u16) + 13)
    },
    | 14 => match bytes.take_exact(2) {
      | Some(&[a, b]) => Ok(u16::from_be_bytes([a, b]) + 269),
      | _ => Err(OptParseError::eof()),
    },
    | 15 => Err(reserved_err),
    | _ => Ok(head as u16),
  }
}

impl<Bytes: AsRef<[u8]>> TryConsumeBytes<Bytes> for Opt {
  type Error = OptParseError;

  fn try_consume_bytes(bytes: &mut Cursor<Bytes>) -> Result<Self, Self::Error> {
    let byte1 = bytes.next()
                     .ok_or(OptParseError::OptionsExhausted)
                     .and_then(|b| {
                       if b == 0b11111111 {
                         Err(OptParseError::OptionsExhausted)
                       } else {
                         Ok(b)
                       }
                     })?;

    // NOTE: Delta **MUST** be consumed before Value; both may pull extension bytes.
    let delta = parse_opt_len_or_delta(byte1 >> 4,
                                       bytes,
                                       OptParseError::OptionDeltaReservedValue(15))?;
    let delta = OptDelta(delta);

    let len = parse_opt_len_or_delta(byte1 & 0b00001111,
                                     bytes,
                                     OptParseError::ValueLengthReservedValue(15))?
              as usize;

    let value = bytes.take_exact(len)
                     .map(|bs| OptValue(bs.to_vec()))
                     .ok_or(OptParseError::UnexpectedEndOfStream)?;

    Ok(Opt { delta, value })
  }
}

impl<Bytes: AsRef<[u8]>> TryConsumeBytes<Bytes> for OptMap {
  type Error = OptParseError;

  fn try_consume_bytes(bytes: &mut Cursor<Bytes>) -> Result<Self, Self::Error> {
    let mut map = OptMap::default();
    let mut last = OptNumber(0);

    loop {
      match Opt::try_consume_bytes(bytes) {
        | Ok(opt) => {
          let OptDelta(d) = opt.delta;
          let num = last + OptNumber(d as u32);

          map.entry(num).or_default().push(opt.value);
          last = num;
        },
        | Err(OptParseError::OptionsExhausted) => break Ok(map),
        | Err(e) => break Err(e),
      }
    }
  }
}
