use tinyvec::ArrayVec;

use crate::*;

/// Trait allowing fallible conversion into bytes
pub trait TryIntoBytes {
  /// Error type yielded if conversion fails
  type Error;

  /// Try to convert into a collection of bytes
  ///
  /// ```
  /// use newt_msg::TryIntoBytes;
  ///
  /// let message = newt_msg::Message {
  ///   // ...
  /// # id: newt_msg::Id(0),
  /// # ty: newt_msg::Type::Con,
  /// # ver: Default::default(),
  /// # opts: Default::default(),
  /// # payload: newt_msg::Payload(Default::default()),
  /// # token: newt_msg::Token(Default::default()),
  /// # code: newt_msg::Code { class: 0, detail: 1 },
  /// };
  ///
  /// let bytes: Vec<u8> = message.try_into_bytes().unwrap();
  /// ```
  fn try_into_bytes(self) -> Result<Vec<u8>, Self::Error>;
}

/// Errors encounterable serializing to bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageToBytesError {
  /// Message wire size exceeds [`MAX_PACKET_SIZE`]
  TooLong {
    /// Upper bound on the wire size
    capacity: usize,
    /// Actual wire size of the message
    size: usize,
  },
}

impl TryIntoBytes for Message {
  type Error = MessageToBytesError;

  fn try_into_bytes(self) -> Result<Vec<u8>, Self::Error> {
    let size: usize = self.wire_len();

    if size > MAX_PACKET_SIZE {
      return Err(Self::Error::TooLong { capacity: MAX_PACKET_SIZE,
                                        size });
    }

    let mut bytes = Vec::with_capacity(size);

    let byte1: u8 = Byte1 { tkl: self.token.0.len() as u8,
                            ver: self.ver,
                            ty: self.ty }.into();
    let code: u8 = self.code.into();
    let id: [u8; 2] = self.id.into();
    let token: ArrayVec<[u8; 8]> = self.token.0;

    bytes.extend(Some(byte1));
    bytes.extend(Some(code));

    bytes.extend(id);
    bytes.extend(token);

    for opt in opt::opts_in_wire_order(&self.opts) {
      opt.extend_bytes(&mut bytes);
    }

    if !self.payload.0.is_empty() {
      bytes.extend(Some(0b11111111));
      bytes.extend(self.payload.0);
    }

    Ok(bytes)
  }
}

pub(crate) fn opt_len_or_delta(val: u16) -> (u8, Option<ArrayVec<[u8; 2]>>) {
  match val {
    | n if n >= 269 => {
      let mut bytes = ArrayVec::new();
      bytes.extend((n - 269).to_be_bytes());
      (14, Some(bytes))
    },
    | n if n >= 13 => {
      let mut bytes = ArrayVec::new();
      bytes.push((n as u8) - 13);
      (13, Some(bytes))
    },
    | n => (n as u8, None),
  }
}

impl From<Id> for [u8; 2] {
  fn from(id: Id) -> [u8; 2] {
    id.0.to_be_bytes()
  }
}

impl From<Type> for u8 {
  fn from(t: Type) -> u8 {
    use Type::*;
    match t {
      | Con => 0,
      | Non => 1,
      | Ack => 2,
      | Reset => 3,
    }
  }
}

impl From<Byte1> for u8 {
  fn from(b: Byte1) -> u8 {
    let ver = b.ver.0 << 6;
    let ty = u8::from(b.ty) << 4;
    let tkl = b.tkl;

    ver | ty | tkl
  }
}

#[cfg(test)]
mod tests {
  use itertools::Itertools;

  use super::*;
  use crate::{assert_eqb, assert_eqb_iter};

  #[test]
  fn msg() {
    let (msg, expected) = test_msg();
    let actual: Vec<u8> = msg.try_into_bytes().unwrap();
    assert_eqb_iter!(actual, expected);
  }

  #[test]
  fn byte_1() {
    let byte = Byte1 { ver: Version(1),
                       ty: Type::Ack,
                       tkl: 3 };
    let actual: u8 = byte.into();
    let expected = 0b_01_10_0011u8;
    assert_eqb!(actual, expected)
  }

  #[test]
  fn opt() {
    use core::iter::repeat;
    let cases: [(u16, Vec<u8>, Vec<u8>); 4] =
      [(24,
        repeat(1).take(100).collect(),
        [[0b1101_1101u8, 24 - 13, 100 - 13].as_ref(),
         repeat(1).take(100).collect::<Vec<u8>>().as_ref()].concat()),
       (1, vec![1], vec![0b0001_0001, 1]),
       (24, vec![1], vec![0b1101_0001, 11, 1]),
       (24,
        repeat(1).take(300).collect(),
        [[0b1101_1110, 24 - 13].as_ref(),
         (300u16 - 269).to_be_bytes().as_ref(),
         repeat(1).take(300).collect::<Vec<u8>>().as_ref()].concat())];

    cases.into_iter().for_each(|(delta, values, expected)| {
                       let opt = Opt { delta: OptDelta(delta),
                                       value: OptValue(values.into_iter().collect()) };
                       let mut actual = Vec::<u8>::new();
                       opt.extend_bytes(&mut actual);
                       assert_eqb_iter!(actual, expected)
                     });
  }

  #[test]
  fn no_payload_marker() {
    let msg = Message { id: Id(0),
                        ty: Type::Con,
                        ver: Default::default(),
                        code: Code { class: 2,
                                     detail: 5 },
                        token: Token(Default::default()),
                        opts: Default::default(),
                        payload: Payload(Default::default()) };

    assert_ne!(msg.try_into_bytes().unwrap().last(), Some(&0b11111111));
  }

  #[test]
  fn opt_insertion_order_does_not_change_wire_bytes() {
    let opts: [(OptNumber, OptValue); 4] = [(OptNumber(11), OptValue(b"oic".to_vec())),
                                            (OptNumber(11), OptValue(b"sec".to_vec())),
                                            (OptNumber(12), OptValue(vec![60])),
                                            (OptNumber(17), OptValue(vec![60]))];

    // repeated values for the same number must keep their relative
    // order, so permute the distinct numbers rather than the values
    let distinct: Vec<OptNumber> = vec![OptNumber(11), OptNumber(12), OptNumber(17)];
    let reference: Option<Vec<u8>> = None;

    distinct.iter()
            .copied()
            .permutations(distinct.len())
            .fold(reference, |reference, order| {
              let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token(Default::default()));
              for n in order {
                for (num, value) in opts.iter() {
                  if *num == n {
                    msg.add(*num, value.clone());
                  }
                }
              }

              let bytes = msg.try_into_bytes().unwrap();
              match reference {
                | Some(expected) => {
                  assert_eq!(bytes, expected);
                  Some(expected)
                },
                | None => Some(bytes),
              }
            });
  }

  #[test]
  fn round_trip() {
    let (msg, _) = test_msg();
    let bytes: Vec<u8> = msg.clone().try_into_bytes().unwrap();
    assert_eq!(Message::try_from_bytes(&bytes).unwrap(), msg);
  }

  #[test]
  fn too_long_is_rejected() {
    let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token(Default::default()));
    msg.payload = Payload(vec![1; MAX_PACKET_SIZE + 1]);
    assert!(matches!(msg.try_into_bytes(),
                     Err(MessageToBytesError::TooLong { .. })));
  }
}
