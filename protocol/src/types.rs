// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;
use std::net::IpAddr;

use serde::Deserialize;
use serde::Serialize;

use crate::invalid;
use crate::malformed;
use crate::packet::LldpTlv;
use crate::MacAddr;
use crate::ProtocolResult;

/// TLV Type values as defined in table 8-1
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[repr(u8)]
pub enum TlvType {
    EndOfLLDPDU = 0,
    ChassisId,
    PortId,
    Ttl,
    PortDescription,
    SystemName,
    SystemDescription,
    SystemCapabilities,
    ManagementAddress,
    OrganizationallySpecific = 127,
}

impl TryFrom<u8> for TlvType {
    type Error = crate::ProtocolError;

    fn try_from(t: u8) -> ProtocolResult<Self> {
        match t {
            0 => Ok(TlvType::EndOfLLDPDU),
            1 => Ok(TlvType::ChassisId),
            2 => Ok(TlvType::PortId),
            3 => Ok(TlvType::Ttl),
            4 => Ok(TlvType::PortDescription),
            5 => Ok(TlvType::SystemName),
            6 => Ok(TlvType::SystemDescription),
            7 => Ok(TlvType::SystemCapabilities),
            8 => Ok(TlvType::ManagementAddress),
            127 => Ok(TlvType::OrganizationallySpecific),
            x => Err(malformed(format!("reserved tlv type {x}"))),
        }
    }
}

impl From<TlvType> for u8 {
    fn from(x: TlvType) -> u8 {
        x as u8
    }
}

// IANA Address Family Numbers for the address types we support
const IANA_IPV4: u8 = 1;
const IANA_IPV6: u8 = 2;

fn addr_to_octets(ip: &IpAddr) -> Vec<u8> {
    let mut v = Vec::with_capacity(17);
    match ip {
        IpAddr::V4(ip) => {
            v.push(IANA_IPV4);
            v.extend(ip.octets())
        }
        IpAddr::V6(ip) => {
            v.push(IANA_IPV6);
            v.extend(ip.octets())
        }
    }
    v
}

fn addr_from_octets(data: &[u8]) -> ProtocolResult<IpAddr> {
    match data {
        [IANA_IPV4, rest @ ..] => <[u8; 4]>::try_from(rest)
            .map(IpAddr::from)
            .map_err(|_| malformed("invalid sized IPv4 address")),
        [IANA_IPV6, rest @ ..] => <[u8; 16]>::try_from(rest)
            .map(IpAddr::from)
            .map_err(|_| malformed("invalid sized IPv6 address")),
        [x, ..] => Err(malformed(format!("unsupported address family {x}"))),
        [] => Err(malformed("address has no payload")),
    }
}

fn string_from_octets(label: &str, data: &[u8]) -> ProtocolResult<String> {
    let s = String::from_utf8(data.to_vec())
        .map_err(|_| malformed(format!("invalid bytes in {label}")))?;
    if s.is_empty() {
        Err(malformed(format!("found empty payload for {label}")))
    } else {
        Ok(s)
    }
}

/// Check that a TLV has the expected type and that its header length agrees
/// with the payload actually carried.
fn tlv_sanity_check(tlv: &LldpTlv, expected: TlvType) -> ProtocolResult<()> {
    if tlv.lldp_tlv_type != expected as u8 {
        Err(malformed(format!(
            "expected {expected:?} tlv, found type {}",
            tlv.lldp_tlv_type
        )))
    } else if tlv.lldp_tlv_size as usize != tlv.lldp_tlv_octets.len() {
        Err(malformed(format!("{expected:?} tlv size mismatch")))
    } else {
        Ok(())
    }
}

// Both the ChassisId and PortId TLVs carry a subtype octet followed by
// 1-255 octets of identifier.
fn id_to_tlv(
    tlv_type: TlvType,
    subtype: u8,
    data: Vec<u8>,
) -> ProtocolResult<LldpTlv> {
    if data.is_empty() {
        return Err(invalid(format!("0-length {tlv_type:?}")));
    } else if data.len() > 255 {
        return Err(invalid(format!("{tlv_type:?} exceeds 255 octets")));
    }
    let mut octets = Vec::with_capacity(data.len() + 1);
    octets.push(subtype);
    octets.extend(data);
    LldpTlv::new(tlv_type.into(), &octets)
}

fn id_from_tlv(tlv: &LldpTlv, tlv_type: TlvType) -> ProtocolResult<(u8, &[u8])> {
    tlv_sanity_check(tlv, tlv_type)?;
    match tlv.lldp_tlv_octets.as_slice() {
        [_] | [] => Err(malformed(format!("{tlv_type:?} tlv has no payload"))),
        [subtype, data @ ..] if data.len() <= 255 => Ok((*subtype, data)),
        _ => Err(malformed(format!("{tlv_type:?} exceeds 255 octets"))),
    }
}

fn mac_from_octets(label: &str, data: &[u8]) -> ProtocolResult<MacAddr> {
    <[u8; 6]>::try_from(data).map(MacAddr::from).map_err(|_| {
        malformed(format!("{label} mac address has {} octets", data.len()))
    })
}

/// Chassis ID subtypes as defined in table 8-2.
#[derive(
    Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize,
)]
pub enum ChassisId {
    ChassisComponent(String),
    InterfaceAlias(String),
    PortComponent(String),
    MacAddress(MacAddr),
    NetworkAddress(IpAddr),
    InterfaceName(String),
    LocallyAssigned(String),
}

impl fmt::Display for ChassisId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChassisId::ChassisComponent(s) => write!(f, "chassis:{s}"),
            ChassisId::InterfaceAlias(s) => write!(f, "alias:{s}"),
            ChassisId::PortComponent(s) => write!(f, "port:{s}"),
            ChassisId::MacAddress(mac) => write!(f, "mac:{mac}"),
            ChassisId::NetworkAddress(ip) => write!(f, "addr:{ip}"),
            ChassisId::InterfaceName(s) => write!(f, "ifname:{s}"),
            ChassisId::LocallyAssigned(s) => write!(f, "local:{s}"),
        }
    }
}

impl TryFrom<&ChassisId> for LldpTlv {
    type Error = crate::ProtocolError;

    fn try_from(id: &ChassisId) -> ProtocolResult<Self> {
        let (subtype, data) = match id {
            ChassisId::ChassisComponent(s) => (1, s.as_bytes().to_vec()),
            ChassisId::InterfaceAlias(s) => (2, s.as_bytes().to_vec()),
            ChassisId::PortComponent(s) => (3, s.as_bytes().to_vec()),
            ChassisId::MacAddress(mac) => (4, mac.octets().to_vec()),
            ChassisId::NetworkAddress(ip) => (5, addr_to_octets(ip)),
            ChassisId::InterfaceName(s) => (6, s.as_bytes().to_vec()),
            ChassisId::LocallyAssigned(s) => (7, s.as_bytes().to_vec()),
        };
        id_to_tlv(TlvType::ChassisId, subtype, data)
    }
}

impl TryFrom<&LldpTlv> for ChassisId {
    type Error = crate::ProtocolError;

    fn try_from(tlv: &LldpTlv) -> ProtocolResult<Self> {
        const L: &str = "ChassisId";
        let (subtype, data) = id_from_tlv(tlv, TlvType::ChassisId)?;
        match subtype {
            1 => Ok(ChassisId::ChassisComponent(string_from_octets(L, data)?)),
            2 => Ok(ChassisId::InterfaceAlias(string_from_octets(L, data)?)),
            3 => Ok(ChassisId::PortComponent(string_from_octets(L, data)?)),
            4 => Ok(ChassisId::MacAddress(mac_from_octets(L, data)?)),
            5 => Ok(ChassisId::NetworkAddress(addr_from_octets(data)?)),
            6 => Ok(ChassisId::InterfaceName(string_from_octets(L, data)?)),
            7 => Ok(ChassisId::LocallyAssigned(string_from_octets(L, data)?)),
            x => Err(malformed(format!("invalid ChassisId subtype {x}"))),
        }
    }
}

/// Port ID subtypes as defined by table 8-3.
#[derive(
    Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize,
)]
pub enum PortId {
    InterfaceAlias(String),
    PortComponent(String),
    MacAddress(MacAddr),
    NetworkAddress(IpAddr),
    InterfaceName(String),
    AgentCircuitId(String),
    LocallyAssigned(String),
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PortId::InterfaceAlias(s) => write!(f, "alias:{s}"),
            PortId::PortComponent(s) => write!(f, "port:{s}"),
            PortId::MacAddress(mac) => write!(f, "mac:{mac}"),
            PortId::NetworkAddress(ip) => write!(f, "addr:{ip}"),
            PortId::InterfaceName(s) => write!(f, "ifname:{s}"),
            PortId::AgentCircuitId(s) => write!(f, "circuit:{s}"),
            PortId::LocallyAssigned(s) => write!(f, "local:{s}"),
        }
    }
}

impl TryFrom<&PortId> for LldpTlv {
    type Error = crate::ProtocolError;

    fn try_from(id: &PortId) -> ProtocolResult<Self> {
        let (subtype, data) = match id {
            PortId::InterfaceAlias(s) => (1, s.as_bytes().to_vec()),
            PortId::PortComponent(s) => (2, s.as_bytes().to_vec()),
            PortId::MacAddress(mac) => (3, mac.octets().to_vec()),
            PortId::NetworkAddress(ip) => (4, addr_to_octets(ip)),
            PortId::InterfaceName(s) => (5, s.as_bytes().to_vec()),
            PortId::AgentCircuitId(s) => (6, s.as_bytes().to_vec()),
            PortId::LocallyAssigned(s) => (7, s.as_bytes().to_vec()),
        };
        id_to_tlv(TlvType::PortId, subtype, data)
    }
}

impl TryFrom<&LldpTlv> for PortId {
    type Error = crate::ProtocolError;

    fn try_from(tlv: &LldpTlv) -> ProtocolResult<Self> {
        const L: &str = "PortId";
        let (subtype, data) = id_from_tlv(tlv, TlvType::PortId)?;
        match subtype {
            1 => Ok(PortId::InterfaceAlias(string_from_octets(L, data)?)),
            2 => Ok(PortId::PortComponent(string_from_octets(L, data)?)),
            3 => Ok(PortId::MacAddress(mac_from_octets(L, data)?)),
            4 => Ok(PortId::NetworkAddress(addr_from_octets(data)?)),
            5 => Ok(PortId::InterfaceName(string_from_octets(L, data)?)),
            6 => Ok(PortId::AgentCircuitId(string_from_octets(L, data)?)),
            7 => Ok(PortId::LocallyAssigned(string_from_octets(L, data)?)),
            x => Err(malformed(format!("invalid PortId subtype {x}"))),
        }
    }
}

pub fn ttl_to_tlv(ttl: u16) -> LldpTlv {
    LldpTlv {
        lldp_tlv_type: TlvType::Ttl.into(),
        lldp_tlv_size: 2,
        lldp_tlv_octets: ttl.to_be_bytes().to_vec(),
    }
}

pub fn ttl_from_tlv(tlv: &LldpTlv) -> ProtocolResult<u16> {
    tlv_sanity_check(tlv, TlvType::Ttl)?;
    match tlv.lldp_tlv_octets.as_slice() {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(malformed("payload is the wrong size for a TTL")),
    }
}

/// Encode one of the free-text TLVs: Port Description, System Name or System
/// Description.
pub fn string_to_tlv(tlv_type: TlvType, data: &str) -> ProtocolResult<LldpTlv> {
    match tlv_type {
        TlvType::PortDescription
        | TlvType::SystemName
        | TlvType::SystemDescription => {}
        x => return Err(invalid(format!("{x:?} doesn't carry string data"))),
    }
    if data.is_empty() {
        Err(invalid("0-length string"))
    } else if data.len() > 255 {
        Err(invalid("string exceeds 255 octets"))
    } else {
        LldpTlv::new(tlv_type.into(), data.as_bytes())
    }
}

pub fn string_from_tlv(
    tlv: &LldpTlv,
    tlv_type: TlvType,
) -> ProtocolResult<String> {
    tlv_sanity_check(tlv, tlv_type)?;
    string_from_octets(&format!("{tlv_type:?}"), &tlv.lldp_tlv_octets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::deparse_tlvs;
    use crate::packet::TlvReader;

    #[test]
    fn test_chassis_id_encoding() {
        let id = ChassisId::MacAddress(MacAddr::new(0, 1, 2, 3, 4, 5));
        let tlv = LldpTlv::try_from(&id).unwrap();
        assert_eq!(tlv.lldp_tlv_type, 1);
        assert_eq!(tlv.lldp_tlv_octets, vec![4, 0, 1, 2, 3, 4, 5]);

        let wire = deparse_tlvs(&[tlv]);
        let back = TlvReader::new(&wire).next().unwrap().unwrap();
        assert_eq!(ChassisId::try_from(&back).unwrap(), id);
    }

    #[test]
    fn test_chassis_id_rejects_bad_payloads() {
        // Reserved subtype
        let tlv = LldpTlv::new(1, &[0, b'x']).unwrap();
        assert!(ChassisId::try_from(&tlv).is_err());
        // No identifier after the subtype
        let tlv = LldpTlv::new(1, &[1]).unwrap();
        assert!(ChassisId::try_from(&tlv).is_err());
        // MAC address subtype with a short address
        let tlv = LldpTlv::new(1, &[4, 1, 2, 3]).unwrap();
        assert!(ChassisId::try_from(&tlv).is_err());
        // Right payload, wrong TLV type
        let tlv = LldpTlv::new(2, &[7, b'x']).unwrap();
        assert!(ChassisId::try_from(&tlv).is_err());
        // Empty identifiers can't be encoded
        assert!(LldpTlv::try_from(&ChassisId::LocallyAssigned(String::new()))
            .is_err());
    }

    #[test]
    fn test_port_id_network_address() {
        let id = PortId::NetworkAddress("10.0.0.1".parse().unwrap());
        let tlv = LldpTlv::try_from(&id).unwrap();
        assert_eq!(tlv.lldp_tlv_octets, vec![4, 1, 10, 0, 0, 1]);
        assert_eq!(PortId::try_from(&tlv).unwrap(), id);

        let tlv = LldpTlv::new(2, &[4, 1, 10, 0, 0]).unwrap();
        assert!(PortId::try_from(&tlv).is_err());
    }

    #[test]
    fn test_ttl() {
        let tlv = ttl_to_tlv(121);
        assert_eq!(tlv.lldp_tlv_octets, vec![0, 121]);
        assert_eq!(ttl_from_tlv(&tlv).unwrap(), 121);
        let short = LldpTlv::new(3, &[1]).unwrap();
        assert!(ttl_from_tlv(&short).is_err());
    }

    #[test]
    fn test_string_tlvs() {
        let tlv = string_to_tlv(TlvType::SystemName, "switch0").unwrap();
        assert_eq!(
            string_from_tlv(&tlv, TlvType::SystemName).unwrap(),
            "switch0"
        );
        assert!(string_from_tlv(&tlv, TlvType::PortDescription).is_err());
        assert!(string_to_tlv(TlvType::Ttl, "nope").is_err());
        assert!(string_to_tlv(TlvType::SystemName, "").is_err());
    }
}
