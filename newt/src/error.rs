/// The broad classes of failure surfaced by this crate.
///
/// Leaf modules define richer error enums (see e.g.
/// [`crate::secure::Error`]); this is the flattened vocabulary
/// callers can branch on without caring which module failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
  /// Bad caller input
  InvalidArgument,
  /// An allocation or reservation failed
  OutOfMemory,
  /// A caller-provided buffer was too small for the data
  BufferTooSmall,
  /// A lookup found nothing (e.g. no PSK for an identity)
  NoMatch,
  /// The peer has no established session
  NotConnected,
  /// A bounded queue was full and the item was dropped
  QueueFull,
  /// Something took too long
  Timeout,
  /// Malformed wire bytes or out-of-order options
  ProtocolError,
  /// Handshake, credential mismatch, or key-derivation failure
  SecurityFailure,
  /// Cipher or method not implemented
  Unsupported,
  /// The socket layer failed
  IoError,
}

/// Errors that can report which [`ErrorKind`] they belong to
pub trait Classify {
  /// The broad class of this error
  fn kind(&self) -> ErrorKind;
}

impl Classify for std::io::Error {
  fn kind(&self) -> ErrorKind {
    match std::io::Error::kind(self) {
      | std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
      | std::io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
      | std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
      | std::io::ErrorKind::NotConnected => ErrorKind::NotConnected,
      | _ => ErrorKind::IoError,
    }
  }
}
