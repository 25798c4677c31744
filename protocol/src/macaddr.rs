// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// An EUI-48 MAC address.  The derived ordering compares octets in network
/// byte order, which is the same as comparing the addresses numerically.  The
/// DCBX tie-break relies on this.
#[derive(
    Clone, Copy, Deserialize, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct MacAddr {
    a: [u8; 6],
}

impl From<[u8; 6]> for MacAddr {
    fn from(a: [u8; 6]) -> Self {
        Self { a }
    }
}

impl MacAddr {
    pub const ZERO: Self = MacAddr { a: [0; 6] };

    /// Nearest-bridge group address (IEEE 802.1AB table 7-1).  All LLDPDUs
    /// sent by this agent go here.
    pub const LLDP_NEAREST_BRIDGE: Self = MacAddr {
        a: [0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e],
    };

    pub const fn new(o0: u8, o1: u8, o2: u8, o3: u8, o4: u8, o5: u8) -> Self {
        MacAddr {
            a: [o0, o1, o2, o3, o4, o5],
        }
    }

    /// Build an address from the first six octets of a slice.  Returns
    /// `None` if the slice is shorter than that.
    pub fn from_slice(s: &[u8]) -> Option<MacAddr> {
        let a: [u8; 6] = s.get(..6)?.try_into().ok()?;
        Some(MacAddr { a })
    }

    pub fn octets(&self) -> [u8; 6] {
        self.a
    }

    pub fn is_null(&self) -> bool {
        *self == Self::ZERO
    }

    /// Group (multicast or broadcast) addresses have the I/G bit set.
    pub fn is_multicast(&self) -> bool {
        self.a[0] & 0x01 != 0
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacError {
    #[error("Too few octets")]
    TooShort,
    #[error("Too many octets")]
    TooLong,
    #[error("Invalid octet")]
    InvalidOctet,
}

impl FromStr for MacAddr {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, MacError> {
        let v: Vec<&str> = s.split(':').collect();

        match v.len().cmp(&6) {
            std::cmp::Ordering::Less => Err(MacError::TooShort),
            std::cmp::Ordering::Greater => Err(MacError::TooLong),
            std::cmp::Ordering::Equal => {
                let mut a = [0u8; 6];
                for (i, octet) in v.iter().enumerate() {
                    a[i] = u8::from_str_radix(octet, 16)
                        .map_err(|_| MacError::InvalidOctet)?;
                }
                Ok(MacAddr { a })
            }
        }
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.a[0], self.a[1], self.a[2], self.a[3], self.a[4], self.a[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<MacAddr> for u64 {
    fn from(mac: MacAddr) -> u64 {
        mac.a.iter().fold(0u64, |acc, o| (acc << 8) | *o as u64)
    }
}

#[test]
fn test_parse_and_display() {
    let mac: MacAddr = "a8:40:25:0:0:1".parse().unwrap();
    assert_eq!(mac.to_string(), "a8:40:25:00:00:01");
    assert_eq!("a8:40:25:00:01".parse::<MacAddr>(), Err(MacError::TooShort));
    assert_eq!(
        "a8:40:25:00:01:02:03".parse::<MacAddr>(),
        Err(MacError::TooLong)
    );
    assert_eq!(
        "a8:40:25:00:01:zz".parse::<MacAddr>(),
        Err(MacError::InvalidOctet)
    );
}

#[test]
fn test_numeric_ordering() {
    let low = MacAddr::new(0, 0, 0, 0, 0, 0xff);
    let high = MacAddr::new(0, 0, 0, 0, 1, 0);
    assert!(low < high);
    assert!(u64::from(low) < u64::from(high));
    assert_eq!(u64::from(high), 0x100);
    assert!(MacAddr::LLDP_NEAREST_BRIDGE.is_multicast());
    assert!(!high.is_multicast());
    assert_eq!(MacAddr::from_slice(&[1, 2, 3]), None);
}
