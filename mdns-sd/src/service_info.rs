//! `ServiceInfo`: the materialised view joining a service instance's SRV,
//! TXT, and A/AAAA records (spec §3). Owned by the registry (for
//! locally-announced services) and by the resolver (for a service being
//! looked up), and updated in place as matching records arrive.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::IpVersion;
use crate::error::{Error, Result};
use crate::name;
use crate::records::{RData, Record, RecordType, Srv, Txt};

/// A TXT property value: present with a byte-string value, present with
/// no value (`key` alone, no `=`), or — by the key's simple absence from
/// `properties` — not present at all.
pub type Properties = Vec<(Vec<u8>, Option<Vec<u8>>)>;

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub service_type: String,
    /// Case-preserving instance name; display uses this, comparison uses `key`.
    pub instance_name: String,
    pub key: String,

    /// Case-preserving host name; comparison uses `server_key`. Both are
    /// updated together whenever an SRV record is received (spec §9 open
    /// question).
    pub server: String,
    pub server_key: String,

    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub properties: Properties,
    /// Whether a TXT record has ever been supplied — distinct from
    /// `properties.is_empty()`, since an empty TXT is still "known text".
    pub has_text: bool,

    pub addresses: Vec<IpAddr>,
    pub subtypes: Vec<String>,
}

impl ServiceInfo {
    /// Construct a fully known `ServiceInfo`, as a caller registering a
    /// local service would: text and server are known up front.
    pub fn new(
        service_type: impl Into<String>,
        instance_name: impl Into<String>,
        server: impl Into<String>,
        port: u16,
        priority: u16,
        weight: u16,
        properties: Properties,
        addresses: Vec<IpAddr>,
    ) -> Self {
        let instance_name = instance_name.into();
        let server = server.into();
        Self {
            service_type: service_type.into(),
            key: name::key(&instance_name),
            instance_name,
            server_key: name::key(&server),
            server,
            port,
            priority,
            weight,
            properties,
            has_text: true,
            addresses,
            subtypes: Vec::new(),
        }
    }

    /// As `new`, but takes addresses as textual (dotted/colon) strings
    /// instead of parsed `IpAddr`s — mirroring `python-zeroconf`'s
    /// `parsed_addresses=` constructor kwarg
    /// (`original_source/tests/services/test_info.py`'s
    /// `parsed_addresses=[...]` cases). Entries that don't parse as an
    /// IPv4 or IPv6 address are silently skipped.
    pub fn new_with_address_strings(
        service_type: impl Into<String>,
        instance_name: impl Into<String>,
        server: impl Into<String>,
        port: u16,
        priority: u16,
        weight: u16,
        properties: Properties,
        addresses: &[&str],
    ) -> Self {
        Self::new(service_type, instance_name, server, port, priority, weight, properties, parse_addresses(addresses))
    }

    /// A placeholder `ServiceInfo` with nothing known yet but the name
    /// being resolved — the resolver's starting point (§4.I).
    pub fn placeholder(service_type: impl Into<String>, instance_name: impl Into<String>) -> Self {
        let instance_name = instance_name.into();
        Self {
            service_type: service_type.into(),
            key: name::key(&instance_name),
            instance_name,
            server: String::new(),
            server_key: String::new(),
            port: 0,
            priority: 0,
            weight: 0,
            properties: Vec::new(),
            has_text: false,
            addresses: Vec::new(),
            subtypes: Vec::new(),
        }
    }

    /// Validate this `ServiceInfo` before it is handed to the registry
    /// (spec §7: `ServiceNameTooLong`/`BadTypeInName` are "raised at
    /// validation time from the public API"). Checks the two things the
    /// wire codec itself can't recover from later: the instance name fits
    /// in the 255-byte name budget (§4.A), and the service type is a
    /// well-formed `_service._proto.local.` name that the instance name
    /// actually falls under.
    pub fn validate(&self) -> Result<()> {
        if self.instance_name.len() > crate::name::MAX_NAME_LEN {
            return Err(Error::ServiceNameTooLong(self.instance_name.clone()));
        }
        let type_key = name::key(&self.service_type);
        if !(type_key.ends_with("._tcp.local.") || type_key.ends_with("._udp.local.")) {
            return Err(Error::BadTypeInName(self.service_type.clone()));
        }
        if !self.key.ends_with(&format!(".{type_key}")) {
            return Err(Error::BadTypeInName(self.instance_name.clone()));
        }
        Ok(())
    }

    /// Changing `instance_name` recomputes `key` (invariant 6).
    pub fn set_name(&mut self, name_str: impl Into<String>) {
        self.instance_name = name_str.into();
        self.key = name::key(&self.instance_name);
    }

    pub fn add_subtype(&mut self, subtype: impl Into<String>) {
        self.subtypes.push(subtype.into());
    }

    /// The bare instance label, with the service-type suffix stripped.
    pub fn get_name(&self) -> String {
        self.instance_name
            .strip_suffix(&format!(".{}", self.service_type))
            .unwrap_or(&self.instance_name)
            .to_string()
    }

    pub fn property(&self, key: &[u8]) -> Option<&Option<Vec<u8>>> {
        self.properties.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Completeness (invariant 4): server known, port known, text known,
    /// and at least one address known for the server.
    pub fn is_complete(&self) -> bool {
        !self.server_key.is_empty() && self.port != 0 && self.has_text && !self.addresses.is_empty()
    }

    pub fn addresses_by_version(&self, version: IpVersion) -> Vec<IpAddr> {
        self.addresses
            .iter()
            .filter(|addr| match (version, addr) {
                (IpVersion::All, _) => true,
                (IpVersion::V4Only, IpAddr::V4(_)) => true,
                (IpVersion::V6Only, IpAddr::V6(_)) => true,
                _ => false,
            })
            .copied()
            .collect()
    }

    pub fn parsed_addresses(&self, version: IpVersion) -> Vec<String> {
        self.addresses_by_version(version).iter().map(IpAddr::to_string).collect()
    }

    /// This `ServiceInfo`'s addresses, re-expressed as wire-ready A/AAAA
    /// records for the registry to announce.
    pub fn dns_addresses(&self, version: IpVersion, ttl: u32, now_ms: u64) -> Vec<Record> {
        self.addresses_by_version(version)
            .into_iter()
            .map(|addr| match addr {
                IpAddr::V4(v4) => Record::a(&self.server, v4, ttl, now_ms),
                IpAddr::V6(v6) => Record::aaaa(&self.server, v6, ttl, now_ms),
            })
            .collect()
    }

    pub fn srv_record(&self, ttl: u32, now_ms: u64) -> Record {
        Record::srv(
            &self.instance_name,
            Srv {
                priority: self.priority,
                weight: self.weight,
                port: self.port,
                target: self.server.clone(),
            },
            ttl,
            now_ms,
        )
    }

    pub fn txt_record(&self, ttl: u32, now_ms: u64) -> Record {
        Record::txt(&self.instance_name, self.encode_txt(), ttl, now_ms)
    }

    pub fn ptr_record(&self, ttl: u32, now_ms: u64) -> Record {
        Record::ptr(&self.service_type, &self.instance_name, ttl, now_ms)
    }

    /// A subtype PTR record (RFC 6763 §7.1): `<subtype>.<service_type>` ->
    /// instance name, one per entry in `subtypes`.
    pub fn subtype_ptr_records(&self, ttl: u32, now_ms: u64) -> Vec<Record> {
        self.subtypes
            .iter()
            .map(|subtype| Record::ptr(&format!("{subtype}.{}", self.service_type), &self.instance_name, ttl, now_ms))
            .collect()
    }

    fn encode_txt(&self) -> Txt {
        let entries: Vec<Vec<u8>> = self
            .properties
            .iter()
            .map(|(key, value)| match value {
                Some(v) => {
                    let mut entry = key.clone();
                    entry.push(b'=');
                    entry.extend_from_slice(v);
                    entry
                }
                None => key.clone(),
            })
            .collect();
        Txt::from_entries(entries.iter().map(|e| e.as_slice()))
    }

    fn decode_txt(txt: &Txt) -> Properties {
        txt.entries()
            .into_iter()
            .map(|entry| match entry.iter().position(|&b| b == b'=') {
                Some(pos) => (entry[..pos].to_vec(), Some(entry[pos + 1..].to_vec())),
                None => (entry.to_vec(), None),
            })
            .collect()
    }

    /// Apply an inbound record: reject it (return `false`, no mutation)
    /// if it is expired, or if its name doesn't match the part of this
    /// `ServiceInfo` it would update (invariant 7 / spec §10.6). Returns
    /// `true` iff something changed.
    pub fn update_record(&mut self, record: &Record, now_ms: u64) -> bool {
        if record.is_expired(now_ms) {
            return false;
        }
        let record_key = name::key(&record.name);

        match (&record.rtype, &record.rdata) {
            (RecordType::TXT, RData::Txt(txt)) if record_key == self.key => {
                self.properties = Self::decode_txt(txt);
                self.has_text = true;
                true
            }
            (RecordType::SRV, RData::Srv(srv)) if record_key == self.key => {
                self.port = srv.port;
                self.priority = srv.priority;
                self.weight = srv.weight;
                self.server = srv.target.clone();
                self.server_key = name::key(&srv.target);
                true
            }
            (RecordType::A, RData::A(addr)) if !self.server_key.is_empty() && record_key == self.server_key => {
                self.push_address(IpAddr::V4(*addr))
            }
            (RecordType::AAAA, RData::Aaaa(addr)) if !self.server_key.is_empty() && record_key == self.server_key => {
                self.push_address(IpAddr::V6(*addr))
            }
            _ => false,
        }
    }

    fn push_address(&mut self, addr: IpAddr) -> bool {
        if self.addresses.contains(&addr) {
            return false;
        }
        self.addresses.push(addr);
        true
    }

    /// Which record types are still missing to complete this view — used
    /// by the resolver to requery only what's needed (§4.I).
    pub fn missing_types(&self) -> Vec<RecordType> {
        let mut missing = Vec::new();
        if self.server_key.is_empty() || self.port == 0 {
            missing.push(RecordType::SRV);
        }
        if !self.has_text {
            missing.push(RecordType::TXT);
        }
        if !self.server_key.is_empty() {
            let has_v4 = self.addresses.iter().any(|a| a.is_ipv4());
            let has_v6 = self.addresses.iter().any(|a| a.is_ipv6());
            if !has_v4 {
                missing.push(RecordType::A);
            }
            if !has_v6 {
                missing.push(RecordType::AAAA);
            }
        } else {
            missing.push(RecordType::A);
            missing.push(RecordType::AAAA);
        }
        missing
    }
}

pub fn parse_address(s: &str) -> Option<IpAddr> {
    s.parse::<Ipv4Addr>().map(IpAddr::V4).ok().or_else(|| s.parse::<Ipv6Addr>().map(IpAddr::V6).ok())
}

/// Parse a batch of textual addresses, silently skipping any that don't parse.
pub fn parse_addresses(addrs: &[&str]) -> Vec<IpAddr> {
    addrs.iter().filter_map(|s| parse_address(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn desc() -> Properties {
        vec![(b"path".to_vec(), Some(b"/~paulsm/".to_vec()))]
    }

    #[test]
    fn validate_accepts_well_formed_service() {
        let info = ServiceInfo::new(
            "_http._tcp.local.",
            "name._http._tcp.local.",
            "ash-1.local.",
            80,
            0,
            0,
            desc(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2))],
        );
        assert!(info.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_type() {
        let info = ServiceInfo::new(
            "_http.local.",
            "name._http.local.",
            "ash-1.local.",
            80,
            0,
            0,
            desc(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2))],
        );
        assert!(matches!(info.validate(), Err(crate::error::Error::BadTypeInName(_))));
    }

    #[test]
    fn validate_rejects_oversized_name() {
        let long_label = "a".repeat(250);
        let info = ServiceInfo::new(
            "_http._tcp.local.",
            format!("{long_label}._http._tcp.local."),
            "ash-1.local.",
            80,
            0,
            0,
            desc(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2))],
        );
        assert!(matches!(info.validate(), Err(crate::error::Error::ServiceNameTooLong(_))));
    }

    #[test]
    fn get_name_strips_service_type() {
        let info = ServiceInfo::new(
            "_type._tcp.local.",
            "name._type._tcp.local.",
            "ash-1.local.",
            22,
            0,
            0,
            desc(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2))],
        );
        assert_eq!(info.get_name(), "name");
    }

    #[test]
    fn name_change_updates_key() {
        let mut info = ServiceInfo::new(
            "_homeassistant._tcp.local.",
            "MyTestHome._homeassistant._tcp.local.",
            "ash-2.local.",
            80,
            0,
            0,
            desc(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2))],
        );
        assert_eq!(info.key, "mytesthome._homeassistant._tcp.local.");
        info.set_name("YourTestHome._homeassistant._tcp.local.");
        assert_eq!(info.key, "yourtesthome._homeassistant._tcp.local.");
    }

    #[test]
    fn addresses_by_version_filters() {
        let info = ServiceInfo::new(
            "_http._tcp.local.",
            "xxxyyy._http._tcp.local.",
            "ash-2.local.",
            80,
            0,
            0,
            desc(),
            vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2)),
                IpAddr::V6("2001:db8::1".parse().unwrap()),
            ],
        );
        assert_eq!(info.addresses_by_version(IpVersion::V4Only), vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2))]);
        assert_eq!(info.addresses_by_version(IpVersion::V6Only), vec!["2001:db8::1".parse::<IpAddr>().unwrap()]);
        assert_eq!(info.addresses_by_version(IpVersion::All).len(), 2);
    }

    #[test]
    fn parse_addresses_skips_unparseable_entries() {
        let parsed = parse_addresses(&["10.0.0.1", "not-an-ip", "::1"]);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn new_with_address_strings_parses_and_skips_bad_entries() {
        let info = ServiceInfo::new_with_address_strings(
            "_http._tcp.local.",
            "name._http._tcp.local.",
            "ash-1.local.",
            80,
            0,
            0,
            desc(),
            &["10.0.1.2", "garbage", "2001:db8::1"],
        );
        assert_eq!(
            info.addresses,
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2)), "2001:db8::1".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn rejects_record_for_a_different_name() {
        let mut info = ServiceInfo::placeholder("_type._tcp.local.", "name._type._tcp.local.");
        let wrong = Record::txt("incorrect.name.", Txt::from_entries([b"ci=3".as_slice()]), 120, 0);
        assert!(!info.update_record(&wrong, 0));
        assert!(!info.has_text);
    }

    #[test]
    fn rejects_expired_record() {
        let mut info = ServiceInfo::placeholder("_type._tcp.local.", "name._type._tcp.local.");
        let expired = Record::txt(&info.instance_name, Txt::from_entries([b"ci=3".as_slice()]), 120, 0);
        assert!(!info.update_record(&expired, 1_000_000));
        assert!(!info.has_text);
    }

    #[test]
    fn srv_then_address_completes_info() {
        let mut info = ServiceInfo::placeholder("_type._tcp.local.", "name._type._tcp.local.");
        let txt = Record::txt(&info.instance_name, Txt::from_entries([b"path=/~matt1/".as_slice()]), 120, 0);
        assert!(info.update_record(&txt, 0));

        let srv = Record::srv(
            &info.instance_name,
            Srv { priority: 0, weight: 0, port: 80, target: "ash-1.local.".to_string() },
            120,
            0,
        );
        assert!(info.update_record(&srv, 0));
        assert!(!info.is_complete());

        let a = Record::a("ash-1.local.", Ipv4Addr::new(10, 0, 1, 2), 120, 0);
        assert!(info.update_record(&a, 0));
        assert!(info.is_complete());
        assert_eq!(info.addresses, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2))]);
    }

    #[test]
    fn txt_roundtrips_through_properties() {
        let info = ServiceInfo::new(
            "_homeassistant._tcp.local.",
            "MyTestHome._homeassistant._tcp.local.",
            "ash-2.local.",
            80,
            0,
            0,
            vec![(b"path".to_vec(), Some(b"/~paulsm/".to_vec()))],
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2))],
        );
        assert_eq!(info.encode_txt().0, b"\x0epath=/~paulsm/");
    }
}
