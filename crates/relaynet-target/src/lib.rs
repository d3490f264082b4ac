#![warn(missing_docs)]

//! relaynet target: request handling on top of the transport and the client ledger
//!
//! A [`TargetServer`] receives requests through a transport [`Service`],
//! runs them with an [`OpHandler`], records each outcome in the client's
//! [`Ledger`] slot and holds the reply until its transaction commits.
//! A resent request is answered from the ledger instead of running again.
//!
//! [`Service`]: relaynet_transport::Service
//! [`Ledger`]: relaynet_recovery::Ledger

pub mod error;
pub mod server;
pub mod wire;

pub use error::{TargetError, TargetResult};
pub use server::{Disposition, OpHandler, OpResult, TargetServer};
pub use wire::{decode_reply_data, encode_reply_data, TargetRequest, REPLY_DATA_SIZE};
