// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Wire-level definitions for LLDP (IEEE 802.1AB) and the DCBX extension
//! (IEEE 802.1Qaz).  Nothing in this crate performs I/O or owns threads.

pub mod dcbx;
pub mod macaddr;
pub mod packet;
pub mod types;

pub use macaddr::MacAddr;

/// Failures encountered while decoding or encoding LLDP frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The buffer ended before a complete structure could be read
    #[error("truncated: {0}")]
    Truncated(String),
    /// A structure was complete, but its contents are not legal
    #[error("malformed: {0}")]
    Malformed(String),
    /// A value could not be encoded
    #[error("invalid: {0}")]
    Invalid(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Utility function to generate a Malformed error
pub fn malformed(message: impl ToString) -> ProtocolError {
    ProtocolError::Malformed(message.to_string())
}

/// Utility function to generate a Truncated error
pub fn truncated(message: impl ToString) -> ProtocolError {
    ProtocolError::Truncated(message.to_string())
}

/// Utility function to generate an Invalid error
pub fn invalid(message: impl ToString) -> ProtocolError {
    ProtocolError::Invalid(message.to_string())
}
