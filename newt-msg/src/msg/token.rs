use tinyvec::ArrayVec;

/// # Message Token
///
/// Opaque sequence of 0-8 bytes chosen by the client to correlate
/// requests with responses across message-id boundaries (separate
/// responses, observe notifications).
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Token(pub ArrayVec<[u8; 8]>);

impl Token {
  /// Turn a 64-bit random into an 8-byte opaque token.
  ///
  /// Tokens are always generated at the full 8-byte width; the
  /// wire supports shorter tokens (down to zero bytes) and those
  /// parse fine, we just never produce them.
  pub fn from_random(n: u64) -> Self {
    Token(n.to_be_bytes().into())
  }

  /// Is this the zero-length (empty message) token?
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn token_from_random_is_8_bytes() {
    let t = Token::from_random(0x0102_0304_0506_0708);
    assert_eq!(t.0.len(), 8);
    assert_eq!(t.0.as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
  }

  #[test]
  fn zero_length_token_is_valid() {
    assert!(Token(Default::default()).is_empty());
  }
}
