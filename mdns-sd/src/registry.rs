//! Registry of locally-owned services (spec §4.E): a primary map keyed by
//! instance key plus a secondary by-service-type index, the same shape as
//! the teacher's `hr-dhcp::LeaseStore` (primary map + MAC/hostname
//! indexes), adapted from "IP/MAC/hostname" to "instance-key/service-type".

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::cache::Cache;
use crate::name;
use crate::records::RecordType;
use crate::service_info::ServiceInfo;

pub struct Registry {
    services: RwLock<HashMap<String, ServiceInfo>>,
    by_type: RwLock<HashMap<String, Vec<String>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            by_type: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, info: ServiceInfo) {
        let key = info.key.clone();
        let type_key = name::key(&info.service_type);
        let mut by_type = self.by_type.write().await;
        let list = by_type.entry(type_key).or_default();
        if !list.contains(&key) {
            list.push(key.clone());
        }
        self.services.write().await.insert(key, info);
    }

    /// Same storage operation as `add`; named separately because the
    /// engine's `update_service` path re-announces afterwards while
    /// `register_service` probes first.
    pub async fn update(&self, info: ServiceInfo) {
        self.add(info).await;
    }

    pub async fn remove(&self, key: &str) -> Option<ServiceInfo> {
        let removed = self.services.write().await.remove(key);
        if let Some(info) = &removed {
            let type_key = name::key(&info.service_type);
            if let Some(list) = self.by_type.write().await.get_mut(&type_key) {
                list.retain(|k| k != key);
            }
        }
        removed
    }

    pub async fn get(&self, key: &str) -> Option<ServiceInfo> {
        self.services.read().await.get(key).cloned()
    }

    pub async fn by_type(&self, service_type: &str) -> Vec<ServiceInfo> {
        let type_key = name::key(service_type);
        let services = self.services.read().await;
        self.by_type
            .read()
            .await
            .get(&type_key)
            .map(|keys| keys.iter().filter_map(|k| services.get(k).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn all(&self) -> Vec<ServiceInfo> {
        self.services.read().await.values().cloned().collect()
    }

    /// Conflict detection (§4.E): an added service may not reuse a name
    /// the cache already attributes to a different server address.
    pub async fn check_conflict(&self, info: &ServiceInfo, cache: &Cache, now_ms: u64) -> bool {
        let conflicts = cache.entries_with_name_and_alias(RecordType::SRV, &info.instance_name, now_ms).await;
        for record in conflicts {
            if let crate::records::RData::Srv(srv) = &record.rdata {
                if name::key(&srv.target) != info.server_key {
                    return true;
                }
            }
        }
        false
    }

    /// Authoritative answers for an inbound question (§4.G "inbound
    /// questions: gather answers from the registry"). Handles the three
    /// shapes a question can take against locally-owned services: a PTR
    /// query for a service type, an SRV/TXT/ANY query for an instance, or
    /// an A/AAAA query for an instance's server name.
    pub async fn answers_for(
        &self,
        name_str: &str,
        rtype: RecordType,
        ttl: u32,
        now_ms: u64,
    ) -> Vec<crate::records::Record> {
        let mut out = Vec::new();
        let services = self.services.read().await;

        if matches!(rtype, RecordType::PTR | RecordType::Any) {
            let type_key = name::key(name_str);
            for info in services.values() {
                if name::key(&info.service_type) == type_key {
                    out.push(info.ptr_record(ttl, now_ms));
                }
                for subtype in &info.subtypes {
                    if name::key(&format!("{subtype}.{}", info.service_type)) == type_key {
                        out.push(crate::records::Record::ptr(
                            &format!("{subtype}.{}", info.service_type),
                            &info.instance_name,
                            ttl,
                            now_ms,
                        ));
                    }
                }
            }
        }

        let name_key = name::key(name_str);
        for info in services.values() {
            if info.key == name_key && matches!(rtype, RecordType::SRV | RecordType::Any) {
                out.push(info.srv_record(ttl, now_ms));
            }
            if info.key == name_key && matches!(rtype, RecordType::TXT | RecordType::Any) {
                out.push(info.txt_record(ttl, now_ms));
            }
            if info.server_key == name_key {
                match rtype {
                    RecordType::A => out.extend(info.dns_addresses(crate::config::IpVersion::V4Only, ttl, now_ms)),
                    RecordType::AAAA => out.extend(info.dns_addresses(crate::config::IpVersion::V6Only, ttl, now_ms)),
                    RecordType::Any => out.extend(info.dns_addresses(crate::config::IpVersion::All, ttl, now_ms)),
                    _ => {}
                }
            }
        }

        out
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample(server: &str) -> ServiceInfo {
        ServiceInfo::new(
            "_http._tcp.local.",
            "inst._http._tcp.local.",
            server,
            80,
            0,
            0,
            vec![(b"path".to_vec(), Some(b"/".to_vec()))],
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))],
        )
    }

    #[tokio::test]
    async fn add_then_lookup_by_type() {
        let registry = Registry::new();
        registry.add(sample("ash-1.local.")).await;
        let found = registry.by_type("_http._tcp.local.").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].server, "ash-1.local.");
    }

    #[tokio::test]
    async fn remove_clears_both_indexes() {
        let registry = Registry::new();
        let info = sample("ash-1.local.");
        let key = info.key.clone();
        registry.add(info).await;
        registry.remove(&key).await;
        assert!(registry.get(&key).await.is_none());
        assert!(registry.by_type("_http._tcp.local.").await.is_empty());
    }

    #[tokio::test]
    async fn answers_for_ptr_question_returns_pointer_to_instance() {
        let registry = Registry::new();
        registry.add(sample("ash-1.local.")).await;
        let answers = registry.answers_for("_http._tcp.local.", RecordType::PTR, 120, 0).await;
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].rtype, RecordType::PTR);
    }

    #[tokio::test]
    async fn answers_for_subtype_ptr_question_returns_pointer_to_instance() {
        let registry = Registry::new();
        let mut info = sample("ash-1.local.");
        info.add_subtype("_printer._sub");
        registry.add(info).await;

        let answers = registry.answers_for("_printer._sub._http._tcp.local.", RecordType::PTR, 120, 0).await;
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].name, "_printer._sub._http._tcp.local.");
        assert_eq!(answers[0].rdata, crate::records::RData::Ptr("inst._http._tcp.local.".to_string()));
    }

    #[tokio::test]
    async fn conflict_detected_against_different_server() {
        let registry = Registry::new();
        let cache = Cache::new();
        let info = sample("ash-1.local.");
        cache
            .add(crate::records::Record::srv(
                &info.instance_name,
                crate::records::Srv { priority: 0, weight: 0, port: 80, target: "someone-else.local.".to_string() },
                120,
                0,
            ))
            .await;
        assert!(registry.check_conflict(&info, &cache, 0).await);
    }
}
