// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::convert;

#[derive(Debug, thiserror::Error)]
pub enum LldpdError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("Resource already exists: {0}")]
    Exists(String),
    #[error("No such resource: {0}")]
    Missing(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    /// A received LLDPDU was malformed
    #[error("LLDP protocol error: {0}")]
    Protocol(String),
    /// The timer service could not accept a new timer
    #[error("Timer error: {0}")]
    Timer(String),
    /// Sending or receiving on a link failed
    #[error("Transport error: {0}")]
    Transport(String),
    /// A DCBX feature failed to apply its operating configuration
    #[error("Action failed: {0}")]
    Action(String),
    #[error("error: {0}")]
    Other(String),
}

impl convert::From<std::io::Error> for LldpdError {
    fn from(err: std::io::Error) -> Self {
        LldpdError::Io(err)
    }
}

impl convert::From<protocol::ProtocolError> for LldpdError {
    fn from(err: protocol::ProtocolError) -> Self {
        match err {
            protocol::ProtocolError::Invalid(e) => LldpdError::Invalid(e),
            e => LldpdError::Protocol(e.to_string()),
        }
    }
}

impl convert::From<String> for LldpdError {
    fn from(err: String) -> Self {
        LldpdError::Other(err)
    }
}

impl convert::From<&str> for LldpdError {
    fn from(err: &str) -> Self {
        LldpdError::Other(err.to_string())
    }
}

impl convert::From<anyhow::Error> for LldpdError {
    fn from(err: anyhow::Error) -> Self {
        LldpdError::Other(err.to_string())
    }
}
