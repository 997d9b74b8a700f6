/// Blocking client
pub mod client;

pub use client::Client;
