use std::net::SocketAddr;

use newt_msg::to_bytes::MessageToBytesError;
use newt_msg::{Id, MessageParseError, Token};

use crate::error::{Classify, ErrorKind};

/// The context that an error occurred in
#[derive(Debug, Clone, Copy)]
pub enum When {
  /// We were polling for a message when the error occurred
  Polling,
  /// We were sending a message
  SendingMessage(Option<SocketAddr>, Id, Token),
  /// No interesting context
  None,
}

impl When {
  /// Construct a specific error from the context the error occurred in
  pub fn what<E>(self, what: What<E>) -> Error<E> {
    Error { when: self, what }
  }
}

/// An error encounterable from within [`crate::core::Core`]
#[derive(Debug)]
pub struct Error<E> {
  /// What happened?
  pub what: What<E>,
  /// What were we doing when it happened?
  pub when: When,
}

/// A contextless error with some additional debug data attached.
#[derive(Debug)]
pub enum What<E> {
  /// Some socket operation failed
  SockError(E),
  /// Deserializing a message from bytes failed
  FromBytes(MessageParseError),
  /// Serializing a message to bytes failed
  ToBytes(MessageToBytesError),
  /// A request addressed to a multicast group was not Non-confirmable
  MulticastRequiresNon,
  /// A CONfirmable message was sent many times without an ACKnowledgement.
  MessageNeverAcked,
  /// The clock failed to provide timing.
  ///
  /// See [`embedded_time::clock::Error`]
  ClockError,
  /// Something timed out
  Timeout,
}

impl<E: core::fmt::Debug> Classify for Error<E> {
  fn kind(&self) -> ErrorKind {
    match self.what {
      | What::SockError(_) => ErrorKind::IoError,
      | What::FromBytes(_) | What::ToBytes(_) => ErrorKind::ProtocolError,
      | What::MulticastRequiresNon => ErrorKind::InvalidArgument,
      | What::MessageNeverAcked | What::Timeout => ErrorKind::Timeout,
      | What::ClockError => ErrorKind::IoError,
    }
  }
}
