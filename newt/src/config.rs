use embedded_time::duration::Milliseconds;

use crate::retry::{Attempts, Strategy};
use crate::time::Millis;

/// `ACK_TIMEOUT` from RFC 7252 Section 4.8, in milliseconds
pub const ACK_TIMEOUT_MILLIS: u64 = 2_000;

/// `ACK_RANDOM_FACTOR` from RFC 7252 Section 4.8, applied to
/// [`ACK_TIMEOUT_MILLIS`] to obtain the upper bound of the
/// first-retransmission delay
pub const ACK_RANDOM_FACTOR: f32 = 1.5;

/// `MAX_RETRANSMIT` from RFC 7252 Section 4.8
pub const MAX_RETRANSMIT: u16 = 4;

/// Configuration options related to parsing & handling outbound CON requests
#[derive(Debug, Clone, Copy)]
pub struct Con {
  /// Retry strategy for CON requests that
  /// have not yet been ACKed.
  ///
  /// Defaults to the RFC 7252 exponential strategy: first
  /// retransmission after a uniformly random 2000..=3000 ms
  /// (`ACK_TIMEOUT * [1, ACK_RANDOM_FACTOR]`), doubling afterwards.
  pub unacked_retry_strategy: Strategy,
  /// Retry strategy for CON requests that have been ACKed but whose
  /// separate response is still outstanding.
  ///
  /// Usually this should be **lazier** than `unacked_retry_strategy`,
  /// since we can reasonably expect the duration between "received request"
  /// and "responded with ACK" to be much shorter than "responded with ACK" and
  /// "sent actual response."
  pub acked_retry_strategy: Strategy,
  /// Number of times we are allowed to resend a CON request
  /// before finalizing the exchange (`MAX_RETRANSMIT`).
  pub max_attempts: Attempts,
}

/// Configuration options related to parsing & handling outbound NON requests
#[derive(Debug, Clone, Copy)]
pub struct Non {
  /// How long to keep a NON exchange (e.g. a multicast discovery
  /// request) pending for further replies before finalizing it.
  ///
  /// Defaults to 5000 milliseconds.
  pub lifetime: Millis,
}

/// Configuration options related to parsing & handling messages
#[derive(Debug, Clone, Copy)]
pub struct Msg {
  /// Seed for the ChaCha generator behind message [`newt_msg::Token`]s
  /// and [`newt_msg::Id`]s.
  ///
  /// This should come from a CSPRNG (`rand::rngs::OsRng` on hosted
  /// platforms) so that tokens are not guessable.
  pub token_seed: u64,

  /// See [`Con`]
  pub con: Con,

  /// See [`Non`]
  pub non: Non,

  /// Set the maximum amount of time we should delay
  /// our response to multicast requests.
  ///
  /// The actual delay will be random between zero
  /// and this value.
  ///
  /// Defaults to 5000 milliseconds.
  pub multicast_response_leisure: Millis,
}

impl Default for Con {
  fn default() -> Self {
    Con { unacked_retry_strategy:
            Strategy::Exponential { init_min: Milliseconds(ACK_TIMEOUT_MILLIS),
                                    init_max:
                                      Milliseconds((ACK_TIMEOUT_MILLIS as f32
                                                    * ACK_RANDOM_FACTOR)
                                                   as u64) },
          acked_retry_strategy:
            Strategy::Exponential { init_min: Milliseconds(2 * ACK_TIMEOUT_MILLIS),
                                    init_max:
                                      Milliseconds((2.0 * ACK_TIMEOUT_MILLIS as f32
                                                    * ACK_RANDOM_FACTOR)
                                                   as u64) },
          max_attempts: Attempts(MAX_RETRANSMIT) }
  }
}

impl Default for Non {
  fn default() -> Self {
    Non { lifetime: Milliseconds(5000) }
  }
}

impl Default for Msg {
  fn default() -> Self {
    Msg { token_seed: 0,
          con: Con::default(),
          non: Non::default(),
          multicast_response_leisure: Milliseconds(5000) }
  }
}

/// Runtime config
#[derive(Debug, Clone, Copy)]
pub struct Config {
  /// See [`Msg`]
  pub msg: Msg,
  /// Capacity of the recently-seen (address, message-id) ring used
  /// for duplicate suppression.
  ///
  /// Defaults to 32.
  pub dedup_capacity: usize,
}

impl Default for Config {
  fn default() -> Self {
    Config { msg: Msg::default(),
             dedup_capacity: 32 }
  }
}

impl Config {
  pub(crate) fn max_transmit_span_millis(&self) -> u64 {
    let acked_con = self.msg
                        .con
                        .acked_retry_strategy
                        .max_time(self.msg.con.max_attempts - Attempts(1))
                        .0;

    let unacked_con = self.msg
                          .con
                          .unacked_retry_strategy
                          .max_time(self.msg.con.max_attempts - Attempts(1))
                          .0;

    acked_con.max(unacked_con)
  }

  // TODO: adjust these on the fly based on actual timings?
  pub(crate) fn max_latency_millis(&self) -> u64 {
    100_000
  }

  pub(crate) fn expected_processing_delay_millis(&self) -> u64 {
    200
  }

  pub(crate) fn exchange_lifetime_millis(&self) -> u64 {
    self.max_transmit_span_millis()
    + (2 * self.max_latency_millis())
    + self.expected_processing_delay_millis()
  }
}
