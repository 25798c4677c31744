// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use crate::invalid;
use crate::truncated;
use crate::MacAddr;
use crate::ProtocolResult;

pub const ETHER_VLAN: u16 = 0x8100;
pub const ETHER_LLDP: u16 = 0x88cc;
pub const ETHER_LEN: usize = 14;

/// Type value for organizationally specific TLVs
pub const TLV_ORG_SPECIFIC: u8 = 127;
/// Largest payload expressible in the 9-bit TLV length field
pub const TLV_MAX_SIZE: usize = 511;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthQHdr {
    pub eth_pcp: u8,       // 802.1q Priority code point
    pub eth_dei: u8,       // 802.1q Drop eligible indicator
    pub eth_vlan_tag: u16, // 802.1q VID
}

impl From<EthQHdr> for u16 {
    fn from(x: EthQHdr) -> Self {
        ((x.eth_pcp as u16) << 13) | ((x.eth_dei as u16) << 12) | x.eth_vlan_tag
    }
}

impl From<u16> for EthQHdr {
    fn from(x: u16) -> Self {
        EthQHdr {
            eth_pcp: ((x >> 13) & 0x07) as u8,
            eth_dei: ((x >> 12) & 0x01) as u8,
            eth_vlan_tag: x & 0xfff,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthHdr {
    pub eth_dmac: MacAddr,
    pub eth_smac: MacAddr,
    pub eth_8021q: Option<EthQHdr>,
    pub eth_type: u16,
}

impl EthHdr {
    /// Header for an untagged LLDPDU sent from `smac` to the nearest-bridge
    /// group address.
    pub fn lldp(smac: MacAddr) -> Self {
        EthHdr {
            eth_dmac: MacAddr::LLDP_NEAREST_BRIDGE,
            eth_smac: smac,
            eth_8021q: None,
            eth_type: ETHER_LLDP,
        }
    }

    /// Parse an ethernet header, returning it along with the number of
    /// bytes it occupied.
    pub fn parse(data: &[u8]) -> ProtocolResult<(EthHdr, usize)> {
        if data.len() < ETHER_LEN {
            return Err(truncated("ethernet header"));
        }
        let mut size = ETHER_LEN;
        let mut eth_type = get_u16(&data[12..])?;
        let mut eth_8021q = None;
        if eth_type == ETHER_VLAN {
            size += 4;
            if data.len() < size {
                return Err(truncated("vlan header"));
            }
            eth_8021q = Some(EthQHdr::from(get_u16(&data[14..])?));
            eth_type = get_u16(&data[16..])?;
        }

        let hdr = EthHdr {
            eth_dmac: MacAddr::from_slice(&data[0..6])
                .expect("size validated above"),
            eth_smac: MacAddr::from_slice(&data[6..12])
                .expect("size validated above"),
            eth_8021q,
            eth_type,
        };
        Ok((hdr, size))
    }

    pub fn deparse(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.eth_dmac.octets());
        bytes.extend_from_slice(&self.eth_smac.octets());
        if let Some(q) = self.eth_8021q {
            bytes.extend_from_slice(&ETHER_VLAN.to_be_bytes());
            bytes.extend_from_slice(&u16::from(q).to_be_bytes());
        }
        bytes.extend_from_slice(&self.eth_type.to_be_bytes());
    }

    pub fn size(&self) -> usize {
        match self.eth_8021q {
            Some(_) => ETHER_LEN + 4,
            None => ETHER_LEN,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LldpTlv {
    pub lldp_tlv_type: u8,  // 7 bits
    pub lldp_tlv_size: u16, // 9 bits
    pub lldp_tlv_octets: Vec<u8>,
}

impl LldpTlv {
    pub fn new(tlv_type: u8, tlv_data: &[u8]) -> ProtocolResult<Self> {
        let tlv_size = tlv_data.len();
        if tlv_type & 0x80 != 0 {
            Err(invalid(format!("tlv type {tlv_type} exceeds 7 bits")))
        } else if tlv_size > TLV_MAX_SIZE {
            Err(invalid("tlv data exceeds 511 octets"))
        } else {
            Ok(LldpTlv {
                lldp_tlv_type: tlv_type,
                lldp_tlv_size: tlv_size as u16,
                lldp_tlv_octets: tlv_data.to_vec(),
            })
        }
    }

    /// Build an organizationally specific TLV, whose payload begins with
    /// the 3-octet OUI and a 1-octet subtype.
    pub fn org_specific(
        oui: [u8; 3],
        subtype: u8,
        info: &[u8],
    ) -> ProtocolResult<Self> {
        let mut payload = Vec::with_capacity(4 + info.len());
        payload.extend_from_slice(&oui);
        payload.push(subtype);
        payload.extend_from_slice(info);
        LldpTlv::new(TLV_ORG_SPECIFIC, &payload)
    }

    /// The End Of LLDPDU TLV
    pub fn end() -> Self {
        LldpTlv {
            lldp_tlv_type: 0,
            lldp_tlv_size: 0,
            lldp_tlv_octets: Vec::new(),
        }
    }

    /// For an organizationally specific TLV, return its OUI and subtype.
    pub fn org_id(&self) -> Option<([u8; 3], u8)> {
        if self.lldp_tlv_type != TLV_ORG_SPECIFIC {
            return None;
        }
        let d = &self.lldp_tlv_octets;
        (d.len() >= 4).then(|| ([d[0], d[1], d[2]], d[3]))
    }

    /// Number of octets this TLV occupies on the wire
    pub fn wire_size(&self) -> usize {
        2 + self.lldp_tlv_octets.len()
    }

    pub fn deparse(&self, bytes: &mut Vec<u8>) {
        let w = ((self.lldp_tlv_type as u16) << 9) | self.lldp_tlv_size;
        bytes.extend_from_slice(&w.to_be_bytes());
        bytes.extend_from_slice(&self.lldp_tlv_octets);
    }

    fn parse(data: &[u8]) -> ProtocolResult<(LldpTlv, usize)> {
        let word = get_u16(data)
            .map_err(|_| truncated("lldp tlv prefix too short"))?;
        let lldp_tlv_type = (word >> 9) as u8;
        let lldp_tlv_size = word & 0x1ff;
        let end = 2 + lldp_tlv_size as usize;

        if end > data.len() {
            return Err(truncated(format!(
                "lldp tlv type {lldp_tlv_type} claims {lldp_tlv_size} octets, \
                 {} available",
                data.len() - 2
            )));
        }
        Ok((
            LldpTlv {
                lldp_tlv_type,
                lldp_tlv_size,
                lldp_tlv_octets: data[2..end].to_vec(),
            },
            end,
        ))
    }
}

/// Walks an LLDPDU one TLV at a time.  The caller decides when to stop,
/// which lets it bail out on an End TLV or a zero TTL without decoding the
/// remainder of the buffer.  After the first error the reader yields nothing
/// further.
pub struct TlvReader<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> TlvReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        TlvReader {
            data,
            offset: 0,
            failed: false,
        }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = ProtocolResult<LldpTlv>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        match LldpTlv::parse(&self.data[self.offset..]) {
            Ok((tlv, used)) => {
                self.offset += used;
                Some(Ok(tlv))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Encode a list of TLVs into an LLDPDU payload
pub fn deparse_tlvs(tlvs: &[LldpTlv]) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(tlvs.iter().map(LldpTlv::wire_size).sum());
    tlvs.iter().for_each(|tlv| tlv.deparse(&mut bytes));
    bytes
}

fn get_u16(data: &[u8]) -> ProtocolResult<u16> {
    if data.len() < 2 {
        Err(truncated("buffer too small"))
    } else {
        Ok(((data[0] as u16) << 8) | data[1] as u16)
    }
}
