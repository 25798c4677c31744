// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! TLV codecs and the registry that maps received TLVs onto them.
//!
//! Each TLV kind we understand is handled by a `TlvCodec`, which knows how
//! to decode the TLV into a `TlvData` value, how to encode our own value
//! from the local MIB, and what to do when the TLV is enabled or disabled on
//! an agent.  Codecs are looked up by `TlvKey`: the TLV type, plus the OUI and
//! subtype for organizationally specific TLVs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use crate::agent::Agent;
use crate::dcbx;
use crate::errors::LldpdError;
use crate::mib::LocalMib;
use crate::types::LldpdResult;
use protocol::dcbx::PfcTlv;
use protocol::dcbx::IEEE_8021_OUI;
use protocol::dcbx::PFC_SUBTYPE;
use protocol::packet::LldpTlv;
use protocol::packet::TLV_ORG_SPECIFIC;
use protocol::types::string_from_tlv;
use protocol::types::string_to_tlv;
use protocol::types::ttl_from_tlv;
use protocol::types::ttl_to_tlv;
use protocol::types::ChassisId;
use protocol::types::PortId;
use protocol::types::TlvType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TlvKey {
    pub tlv_type: u8,
    pub oui: Option<[u8; 3]>,
    pub subtype: u8,
}

impl TlvKey {
    pub const CHASSIS_ID: TlvKey = TlvKey::basic(TlvType::ChassisId);
    pub const PORT_ID: TlvKey = TlvKey::basic(TlvType::PortId);
    pub const TTL: TlvKey = TlvKey::basic(TlvType::Ttl);
    pub const PORT_DESC: TlvKey = TlvKey::basic(TlvType::PortDescription);
    pub const SYS_NAME: TlvKey = TlvKey::basic(TlvType::SystemName);
    pub const SYS_DESC: TlvKey = TlvKey::basic(TlvType::SystemDescription);
    pub const PFC: TlvKey = TlvKey::org(IEEE_8021_OUI, PFC_SUBTYPE);

    pub const fn basic(tlv_type: TlvType) -> Self {
        TlvKey {
            tlv_type: tlv_type as u8,
            oui: None,
            subtype: 0,
        }
    }

    pub const fn org(oui: [u8; 3], subtype: u8) -> Self {
        TlvKey {
            tlv_type: TLV_ORG_SPECIFIC,
            oui: Some(oui),
            subtype,
        }
    }

    /// The key under which a received TLV's codec is registered
    pub fn of(tlv: &LldpTlv) -> Self {
        match tlv.org_id() {
            Some((oui, subtype)) => TlvKey::org(oui, subtype),
            None => TlvKey {
                tlv_type: tlv.lldp_tlv_type,
                oui: None,
                subtype: 0,
            },
        }
    }

    /// Chassis ID, Port ID and TTL may each appear only once, at the start
    /// of an LLDPDU.
    pub fn is_mandatory(&self) -> bool {
        *self == TlvKey::CHASSIS_ID
            || *self == TlvKey::PORT_ID
            || *self == TlvKey::TTL
    }
}

impl fmt::Display for TlvKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.oui {
            Some(oui) => write!(
                f,
                "{:02x}-{:02x}-{:02x}/{}",
                oui[0], oui[1], oui[2], self.subtype
            ),
            None => match TlvType::try_from(self.tlv_type) {
                Ok(t) => write!(f, "{t:?}"),
                Err(_) => write!(f, "type-{}", self.tlv_type),
            },
        }
    }
}

// Serialized as a string so that maps keyed by TlvKey can be rendered as
// JSON objects.
impl Serialize for TlvKey {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The decoded contents of every TLV kind we understand
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TlvData {
    ChassisId(ChassisId),
    PortId(PortId),
    Ttl(u16),
    PortDescription(String),
    SystemName(String),
    SystemDescription(String),
    Pfc(PfcTlv),
}

/// The TLVs received from (or advertised by) one station, keyed by codec
pub type Fields = BTreeMap<TlvKey, TlvData>;

/// Why a codec refused a TLV
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TlvError {
    /// This TLV was already seen in the current LLDPDU.  Only this TLV is
    /// discarded.
    #[error("duplicate tlv")]
    Duplicate,
    /// No room to store the data.  The whole LLDPDU is dropped.
    #[error("out of resources")]
    Resource,
    /// The TLV is malformed.  The whole LLDPDU is dropped.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<protocol::ProtocolError> for TlvError {
    fn from(e: protocol::ProtocolError) -> Self {
        TlvError::Protocol(e.to_string())
    }
}

fn insert_unique(
    fields: &mut Fields,
    key: TlvKey,
    data: TlvData,
) -> Result<(), TlvError> {
    match fields.entry(key) {
        std::collections::btree_map::Entry::Occupied(_) => {
            Err(TlvError::Duplicate)
        }
        std::collections::btree_map::Entry::Vacant(e) => {
            e.insert(data);
            Ok(())
        }
    }
}

pub trait TlvCodec: Send + Sync {
    fn key(&self) -> TlvKey;

    fn name(&self) -> &'static str;

    /// Decode `tlv` and add its value to `fields`.
    fn parse(&self, tlv: &LldpTlv, fields: &mut Fields) -> Result<(), TlvError>;

    /// Encode this station's value for the TLV, if it has one.
    fn write(&self, local: &LocalMib) -> LldpdResult<Option<LldpTlv>>;

    /// Whether two decoded values are equivalent for change detection
    fn compare(&self, a: &TlvData, b: &TlvData) -> bool {
        a == b
    }

    /// Called, with the local MIB write-locked, when the TLV is added to an
    /// agent's write list.
    fn init(&self, _agent: &Arc<Agent>, _local: &mut LocalMib) -> LldpdResult<()> {
        Ok(())
    }

    /// Called, with the local MIB write-locked, when the TLV is removed from
    /// an agent's write list.
    fn fini(&self, _agent: &Arc<Agent>, _local: &mut LocalMib) {}
}

struct ChassisIdCodec;

impl TlvCodec for ChassisIdCodec {
    fn key(&self) -> TlvKey {
        TlvKey::CHASSIS_ID
    }

    fn name(&self) -> &'static str {
        "chassis-id"
    }

    fn parse(&self, tlv: &LldpTlv, fields: &mut Fields) -> Result<(), TlvError> {
        let id = ChassisId::try_from(tlv)?;
        insert_unique(fields, self.key(), TlvData::ChassisId(id))
    }

    fn write(&self, local: &LocalMib) -> LldpdResult<Option<LldpTlv>> {
        Ok(Some(LldpTlv::try_from(&local.msap.chassis_id)?))
    }
}

struct PortIdCodec;

impl TlvCodec for PortIdCodec {
    fn key(&self) -> TlvKey {
        TlvKey::PORT_ID
    }

    fn name(&self) -> &'static str {
        "port-id"
    }

    fn parse(&self, tlv: &LldpTlv, fields: &mut Fields) -> Result<(), TlvError> {
        let id = PortId::try_from(tlv)?;
        insert_unique(fields, self.key(), TlvData::PortId(id))
    }

    fn write(&self, local: &LocalMib) -> LldpdResult<Option<LldpTlv>> {
        Ok(Some(LldpTlv::try_from(&local.msap.port_id)?))
    }
}

struct TtlCodec;

impl TlvCodec for TtlCodec {
    fn key(&self) -> TlvKey {
        TlvKey::TTL
    }

    fn name(&self) -> &'static str {
        "ttl"
    }

    fn parse(&self, tlv: &LldpTlv, fields: &mut Fields) -> Result<(), TlvError> {
        let ttl = ttl_from_tlv(tlv)?;
        insert_unique(fields, self.key(), TlvData::Ttl(ttl))
    }

    fn write(&self, local: &LocalMib) -> LldpdResult<Option<LldpTlv>> {
        Ok(Some(ttl_to_tlv(local.ttl)))
    }
}

/// Port Description, System Name and System Description all carry a single
/// string.
struct StringCodec {
    tlv_type: TlvType,
    name: &'static str,
    wrap: fn(String) -> TlvData,
}

impl StringCodec {
    fn unwrap<'a>(&self, data: &'a TlvData) -> Option<&'a str> {
        match (self.tlv_type, data) {
            (TlvType::PortDescription, TlvData::PortDescription(s))
            | (TlvType::SystemName, TlvData::SystemName(s))
            | (TlvType::SystemDescription, TlvData::SystemDescription(s)) => {
                Some(s)
            }
            _ => None,
        }
    }
}

impl TlvCodec for StringCodec {
    fn key(&self) -> TlvKey {
        TlvKey::basic(self.tlv_type)
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn parse(&self, tlv: &LldpTlv, fields: &mut Fields) -> Result<(), TlvError> {
        let s = string_from_tlv(tlv, self.tlv_type)?;
        insert_unique(fields, self.key(), (self.wrap)(s))
    }

    fn write(&self, local: &LocalMib) -> LldpdResult<Option<LldpTlv>> {
        match local.fields.get(&self.key()).and_then(|d| self.unwrap(d)) {
            Some(s) => Ok(Some(string_to_tlv(self.tlv_type, s)?)),
            None => Ok(None),
        }
    }
}

/// The IEEE 802.1Qaz PFC Configuration TLV.  Enabling it on an agent starts
/// the DCBX PFC feature; disabling it stops the feature.
struct PfcCodec;

impl TlvCodec for PfcCodec {
    fn key(&self) -> TlvKey {
        TlvKey::PFC
    }

    fn name(&self) -> &'static str {
        "pfc"
    }

    fn parse(&self, tlv: &LldpTlv, fields: &mut Fields) -> Result<(), TlvError> {
        let pfc = PfcTlv::try_from(tlv)?;
        insert_unique(fields, self.key(), TlvData::Pfc(pfc))
    }

    fn write(&self, local: &LocalMib) -> LldpdResult<Option<LldpTlv>> {
        match local.fields.get(&self.key()) {
            Some(TlvData::Pfc(pfc)) => Ok(Some(LldpTlv::try_from(pfc)?)),
            Some(x) => Err(LldpdError::Invalid(format!(
                "local pfc field holds {x:?}"
            ))),
            None => Ok(None),
        }
    }

    fn init(&self, agent: &Arc<Agent>, local: &mut LocalMib) -> LldpdResult<()> {
        dcbx::start_feature(agent, local, dcbx::Feature::Pfc)
    }

    fn fini(&self, agent: &Arc<Agent>, local: &mut LocalMib) {
        dcbx::stop_feature(agent, local, dcbx::Feature::Pfc)
    }
}

/// The set of codecs known to the daemon, keyed by the TLV they handle.
/// Built once at startup and shared read-only by every agent.
#[derive(Default)]
pub struct TlvRegistry {
    codecs: BTreeMap<TlvKey, Arc<dyn TlvCodec>>,
}

impl TlvRegistry {
    pub fn new() -> Self {
        TlvRegistry::default()
    }

    /// A registry with every codec this crate implements
    pub fn with_defaults() -> Self {
        let mut r = TlvRegistry::new();
        let codecs: Vec<Arc<dyn TlvCodec>> = vec![
            Arc::new(ChassisIdCodec),
            Arc::new(PortIdCodec),
            Arc::new(TtlCodec),
            Arc::new(StringCodec {
                tlv_type: TlvType::PortDescription,
                name: "port-description",
                wrap: TlvData::PortDescription,
            }),
            Arc::new(StringCodec {
                tlv_type: TlvType::SystemName,
                name: "system-name",
                wrap: TlvData::SystemName,
            }),
            Arc::new(StringCodec {
                tlv_type: TlvType::SystemDescription,
                name: "system-description",
                wrap: TlvData::SystemDescription,
            }),
            Arc::new(PfcCodec),
        ];
        for codec in codecs {
            r.codecs.insert(codec.key(), codec);
        }
        r
    }

    pub fn register(&mut self, codec: Arc<dyn TlvCodec>) -> LldpdResult<()> {
        let key = codec.key();
        if self.codecs.contains_key(&key) {
            return Err(LldpdError::Exists(format!("codec for {key}")));
        }
        self.codecs.insert(key, codec);
        Ok(())
    }

    pub fn lookup(&self, key: &TlvKey) -> Option<Arc<dyn TlvCodec>> {
        self.codecs.get(key).cloned()
    }

    /// Compare two values for `key` using its codec's notion of equality
    pub fn same(&self, key: &TlvKey, a: &TlvData, b: &TlvData) -> bool {
        match self.codecs.get(key) {
            Some(codec) => codec.compare(a, b),
            None => a == b,
        }
    }
}

/// The optional TLVs currently being transmitted by an agent, in
/// transmission order.  A codec appears at most once.
#[derive(Clone, Default)]
pub struct WriteList {
    entries: Vec<Arc<dyn TlvCodec>>,
}

impl WriteList {
    pub fn contains(&self, key: &TlvKey) -> bool {
        self.entries.iter().any(|c| c.key() == *key)
    }

    /// Returns false if the codec was already present
    pub fn add(&mut self, codec: Arc<dyn TlvCodec>) -> bool {
        if self.contains(&codec.key()) {
            false
        } else {
            self.entries.push(codec);
            true
        }
    }

    pub fn remove(&mut self, key: &TlvKey) -> Option<Arc<dyn TlvCodec>> {
        let idx = self.entries.iter().position(|c| c.key() == *key)?;
        Some(self.entries.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TlvCodec>> {
        self.entries.iter()
    }

    pub fn keys(&self) -> Vec<TlvKey> {
        self.entries.iter().map(|c| c.key()).collect()
    }
}

/// Groups of optional TLVs that are administered together
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlvCategory {
    Basic,
    Dcbx,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptionalTlv {
    PortDesc,
    SysName,
    SysDesc,
    Pfc,
}

impl OptionalTlv {
    pub const ALL: [OptionalTlv; 4] = [
        OptionalTlv::PortDesc,
        OptionalTlv::SysName,
        OptionalTlv::SysDesc,
        OptionalTlv::Pfc,
    ];

    pub fn key(self) -> TlvKey {
        match self {
            OptionalTlv::PortDesc => TlvKey::PORT_DESC,
            OptionalTlv::SysName => TlvKey::SYS_NAME,
            OptionalTlv::SysDesc => TlvKey::SYS_DESC,
            OptionalTlv::Pfc => TlvKey::PFC,
        }
    }

    pub fn category(self) -> TlvCategory {
        match self {
            OptionalTlv::Pfc => TlvCategory::Dcbx,
            _ => TlvCategory::Basic,
        }
    }
}

impl FromStr for OptionalTlv {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "portdesc" => Ok(OptionalTlv::PortDesc),
            "sysname" => Ok(OptionalTlv::SysName),
            "sysdesc" => Ok(OptionalTlv::SysDesc),
            "pfc" => Ok(OptionalTlv::Pfc),
            _ => Err(format!("unknown tlv: {s}")),
        }
    }
}

/// How `Agent::set_tlv_mask()` combines the supplied TLVs with the ones
/// already enabled in the category
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskOp {
    Set,
    Add,
    Remove,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mib::Msap;
    use protocol::dcbx::PfcConfig;
    use protocol::MacAddr;

    fn local() -> LocalMib {
        let mut local = LocalMib::new(
            Msap {
                chassis_id: ChassisId::MacAddress(MacAddr::new(
                    0, 0, 0, 0, 0, 1,
                )),
                port_id: PortId::InterfaceName("eth0".to_string()),
            },
            121,
        );
        local
            .fields
            .insert(TlvKey::SYS_NAME, TlvData::SystemName("sw0".to_string()));
        local
    }

    #[test]
    fn test_key_of_received_tlvs() {
        let tlv = LldpTlv::new(5, b"host").unwrap();
        assert_eq!(TlvKey::of(&tlv), TlvKey::SYS_NAME);
        let tlv = LldpTlv::org_specific(IEEE_8021_OUI, PFC_SUBTYPE, &[0, 0])
            .unwrap();
        assert_eq!(TlvKey::of(&tlv), TlvKey::PFC);
        assert!(TlvKey::TTL.is_mandatory());
        assert!(!TlvKey::PFC.is_mandatory());
        assert_eq!(TlvKey::PFC.to_string(), "00-80-c2/11");
        assert_eq!(TlvKey::SYS_NAME.to_string(), "SystemName");
    }

    #[test]
    fn test_parse_rejects_duplicates() {
        let registry = TlvRegistry::with_defaults();
        let codec = registry.lookup(&TlvKey::SYS_NAME).unwrap();
        let tlv = LldpTlv::new(5, b"host").unwrap();
        let mut fields = Fields::new();
        assert_eq!(codec.parse(&tlv, &mut fields), Ok(()));
        assert_eq!(codec.parse(&tlv, &mut fields), Err(TlvError::Duplicate));
        assert_eq!(
            fields.get(&TlvKey::SYS_NAME),
            Some(&TlvData::SystemName("host".to_string()))
        );
    }

    #[test]
    fn test_parse_protocol_error() {
        let registry = TlvRegistry::with_defaults();
        let codec = registry.lookup(&TlvKey::PFC).unwrap();
        let tlv =
            LldpTlv::org_specific(IEEE_8021_OUI, PFC_SUBTYPE, &[0]).unwrap();
        assert!(matches!(
            codec.parse(&tlv, &mut Fields::new()),
            Err(TlvError::Protocol(_))
        ));
    }

    #[test]
    fn test_write_from_local_mib() {
        let registry = TlvRegistry::with_defaults();
        let mut local = local();

        let name = registry.lookup(&TlvKey::SYS_NAME).unwrap();
        let tlv = name.write(&local).unwrap().unwrap();
        assert_eq!(tlv.lldp_tlv_octets, b"sw0".to_vec());

        // Nothing configured, nothing written
        let desc = registry.lookup(&TlvKey::SYS_DESC).unwrap();
        assert_eq!(desc.write(&local).unwrap(), None);

        let pfc = registry.lookup(&TlvKey::PFC).unwrap();
        assert_eq!(pfc.write(&local).unwrap(), None);
        local.fields.insert(
            TlvKey::PFC,
            TlvData::Pfc(PfcTlv {
                willing: true,
                config: PfcConfig {
                    mbc: false,
                    cap: 8,
                    enable: 0x08,
                },
            }),
        );
        let tlv = pfc.write(&local).unwrap().unwrap();
        assert_eq!(TlvKey::of(&tlv), TlvKey::PFC);

        let chassis = registry.lookup(&TlvKey::CHASSIS_ID).unwrap();
        let tlv = chassis.write(&local).unwrap().unwrap();
        assert_eq!(
            ChassisId::try_from(&tlv).unwrap(),
            local.msap.chassis_id
        );
        let ttl = registry.lookup(&TlvKey::TTL).unwrap();
        let tlv = ttl.write(&local).unwrap().unwrap();
        assert_eq!(ttl_from_tlv(&tlv).unwrap(), 121);
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = TlvRegistry::with_defaults();
        assert!(matches!(
            registry.register(Arc::new(PfcCodec)),
            Err(LldpdError::Exists(_))
        ));
    }

    #[test]
    fn test_write_list() {
        let registry = TlvRegistry::with_defaults();
        let mut list = WriteList::default();
        assert!(list.add(registry.lookup(&TlvKey::SYS_DESC).unwrap()));
        assert!(list.add(registry.lookup(&TlvKey::SYS_NAME).unwrap()));
        assert!(!list.add(registry.lookup(&TlvKey::SYS_DESC).unwrap()));
        assert_eq!(list.keys(), vec![TlvKey::SYS_DESC, TlvKey::SYS_NAME]);
        assert!(list.remove(&TlvKey::SYS_DESC).is_some());
        assert!(list.remove(&TlvKey::SYS_DESC).is_none());
        assert_eq!(list.keys(), vec![TlvKey::SYS_NAME]);
    }
}
