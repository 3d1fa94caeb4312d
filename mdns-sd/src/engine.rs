//! Query/response engine (spec §4.G): answers inbound questions from the
//! registry and cache, applies inbound answers to the cache, and drives
//! the probe → announce → goodbye state machine for locally-owned
//! services. Grounded on `hr-dns::resolver`'s sequential-stage shape
//! (each stage returns early) and, for probe/announce timing, on
//! `original_source/zeroconf/asyncio.py`'s broadcast/check helpers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::cache::Cache;
use crate::clock::now_millis;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{self, Message, Question, FLAG_AUTHORITATIVE, FLAG_RESPONSE};
use crate::reactor::{Inbound, Reactor};
use crate::records::{Record, RecordType};
use crate::registry::Registry;
use crate::service_info::ServiceInfo;

/// A notified party (spec §9): the service browser (§4.H) and the
/// service-info resolver (§4.I) both register as a `Listener` and react
/// to every cached or evicted record, interpreting them into their own
/// higher-level events.
pub trait Listener: Send + Sync {
    fn record_updated(&self, record: &Record, now_ms: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Init,
    Probing,
    Announcing,
    Steady,
    Goodbye,
    Terminal,
}

/// The query/response engine. Holds the shared cache and registry, the
/// reactor used to send, and the set of listeners notified on every
/// inbound answer. Per spec §9, listeners are held weakly: they own
/// themselves and detach on drop.
pub struct Engine {
    pub cache: Arc<Cache>,
    pub registry: Arc<Registry>,
    reactor: Arc<Reactor>,
    config: Config,
    listeners: Mutex<Vec<Weak<dyn Listener>>>,
    states: StdMutex<HashMap<String, ServiceState>>,
    next_id: StdMutex<u16>,
    /// Every outbound query's question list, in send order. Test-only: lets
    /// S2/S3-style tests assert on "the next outbound query" without
    /// standing up a real socket capture.
    #[cfg(test)]
    sent_queries: Mutex<Vec<Vec<Question>>>,
}

impl Engine {
    pub fn new(cache: Arc<Cache>, registry: Arc<Registry>, reactor: Arc<Reactor>, config: Config) -> Arc<Self> {
        Arc::new(Self {
            cache,
            registry,
            reactor,
            config,
            listeners: Mutex::new(Vec::new()),
            states: StdMutex::new(HashMap::new()),
            next_id: StdMutex::new(1),
            #[cfg(test)]
            sent_queries: Mutex::new(Vec::new()),
        })
    }

    fn next_message_id(&self) -> u16 {
        let mut guard = self.next_id.lock().unwrap();
        let id = *guard;
        *guard = guard.wrapping_add(1);
        id
    }

    pub async fn add_listener(&self, listener: &Arc<dyn Listener>) {
        self.listeners.lock().await.push(Arc::downgrade(listener));
    }

    pub async fn remove_all_listeners(&self) {
        self.listeners.lock().await.clear();
    }

    /// Drop the one listener behind `listener` (spec `remove_service_listener`).
    pub async fn remove_listener(&self, listener: &Arc<dyn Listener>) {
        let target = Arc::as_ptr(listener);
        self.listeners.lock().await.retain(|weak| match weak.upgrade() {
            Some(existing) => !std::ptr::eq(Arc::as_ptr(&existing) as *const (), target as *const ()),
            None => false,
        });
    }

    async fn notify_record(&self, record: &Record, now_ms: u64) {
        let mut listeners = self.listeners.lock().await;
        listeners.retain(|weak| weak.upgrade().is_some());
        for weak in listeners.iter() {
            if let Some(listener) = weak.upgrade() {
                listener.record_updated(record, now_ms);
            }
        }
    }

    pub fn service_state(&self, key: &str) -> ServiceState {
        self.states.lock().unwrap().get(key).copied().unwrap_or(ServiceState::Init)
    }

    fn set_service_state(&self, key: &str, state: ServiceState) {
        self.states.lock().unwrap().insert(key.to_string(), state);
    }

    /// Dispatch one inbound datagram (§4.G): questions get answered,
    /// answers get cached and broadcast to listeners.
    pub async fn handle_inbound(self: &Arc<Self>, inbound: Inbound) {
        let now = now_millis();
        let message = inbound.message;

        if message.header.is_response() {
            self.apply_answers(&message, now).await;
            return;
        }

        if !message.questions.is_empty() {
            self.answer_questions(&message, inbound.source, now).await;
        }
    }

    async fn apply_answers(&self, message: &Message, now: u64) {
        for record in message.answers.iter().chain(message.additionals.iter()) {
            if record.is_goodbye() {
                self.cache.remove(record).await;
            } else {
                self.cache.add(record.clone()).await;
            }
            self.notify_record(record, now).await;
        }
    }

    async fn answer_questions(&self, message: &Message, source: SocketAddr, now: u64) {
        let mut answers = Vec::new();
        for question in &message.questions {
            let mut from_registry = self
                .registry
                .answers_for(&question.name, question.rtype, 120, now)
                .await;
            let mut from_cache = self.cache.get_by_name(&question.name, now).await;
            from_cache.retain(|r| question.rtype == RecordType::Any || r.rtype.to_u16() == question.rtype.to_u16());
            answers.append(&mut from_registry);
            answers.append(&mut from_cache);
        }

        let answers = dedup_by_identity(answers);
        let answers = suppress_known_answers(answers, &message.answers, now);
        if answers.is_empty() {
            return;
        }

        let unicast_wanted = message.questions.iter().any(|q| q.unicast_response_wanted());
        let target = if unicast_wanted { Some(source) } else { None };

        let reactor = self.reactor.clone();
        let config = self.config.clone();
        let id = self.next_message_id();
        tokio::spawn(async move {
            if target.is_none() {
                let jitter = rand::rng().random_range(config.query_delay_min_ms..=config.query_delay_max_ms);
                sleep(Duration::from_millis(jitter)).await;
            }
            if let Err(e) = send_records(&reactor, id, FLAG_RESPONSE | FLAG_AUTHORITATIVE, &answers, target, config.max_datagram_size, now).await {
                warn!("failed to send mdns response: {}", e);
            }
        });
    }

    /// Build and send one outbound query (§4.G `generate_query`), with a
    /// known-answers section attached for suppression on the responder side.
    pub async fn send_query(&self, questions: Vec<Question>, known_answers: Vec<Record>) -> Result<()> {
        #[cfg(test)]
        self.sent_queries.lock().await.push(questions.clone());

        let id = self.next_message_id();
        let datagrams = message::encode(id, 0, &questions, &known_answers, &[], &[], self.config.max_datagram_size)?;
        for datagram in datagrams {
            self.reactor.send(&datagram, None).await?;
        }
        Ok(())
    }

    /// Test-only snapshot of every query sent so far, in send order.
    #[cfg(test)]
    pub async fn sent_query_question_counts(&self) -> Vec<usize> {
        self.sent_queries.lock().await.iter().map(Vec::len).collect()
    }

    /// Probe → announce → register a locally-owned service (§4.G state
    /// machine). When `cooperating_responders` is true, skips conflict
    /// checking and probing entirely and announces immediately — matching
    /// `async_check_service`'s early return for cooperating responders
    /// (`examples/original_source/zeroconf/asyncio.py:198-204`: multiple
    /// responders deliberately answer for the same name, so there is
    /// nothing to probe against). Otherwise renames on conflict up to
    /// `max_probe_attempts`, failing with `NonUniqueName` once exhausted.
    pub async fn register_service(self: &Arc<Self>, mut info: ServiceInfo, cooperating_responders: bool) -> Result<ServiceInfo> {
        self.set_service_state(&info.key, ServiceState::Probing);

        if !cooperating_responders {
            for attempt in 0..self.config.max_probe_attempts {
                if self.registry.check_conflict(&info, &self.cache, now_millis()).await {
                    if attempt + 1 >= self.config.max_probe_attempts {
                        self.set_service_state(&info.key, ServiceState::Init);
                        return Err(Error::NonUniqueName(info.instance_name.clone()));
                    }
                    rename(&mut info);
                    continue;
                }

                if self.probe_once(&info).await? {
                    break;
                }
                if attempt + 1 >= self.config.max_probe_attempts {
                    self.set_service_state(&info.key, ServiceState::Init);
                    return Err(Error::NonUniqueName(info.instance_name.clone()));
                }
                rename(&mut info);
            }
        }

        self.set_service_state(&info.key, ServiceState::Announcing);
        self.registry.add(info.clone()).await;
        self.announce(&info).await?;
        self.set_service_state(&info.key, ServiceState::Steady);
        Ok(info)
    }

    /// Send the three probe queries at `probe_interval_ms` and watch the
    /// cache for a conflicting response. Returns `Ok(true)` if no conflict
    /// surfaced, `Ok(false)` on a detected conflict (caller should rename).
    async fn probe_once(&self, info: &ServiceInfo) -> Result<bool> {
        let proposed = info.srv_record(120, now_millis());
        let question = Question::new(info.instance_name.clone(), RecordType::Any, false);

        for _ in 0..3 {
            let id = self.next_message_id();
            let datagrams = message::encode(id, 0, &[question.clone()], &[], std::slice::from_ref(&proposed), &[], self.config.max_datagram_size)?;
            for datagram in datagrams {
                self.reactor.send(&datagram, None).await?;
            }
            sleep(Duration::from_millis(self.config.probe_interval_ms)).await;

            if self.registry.check_conflict(info, &self.cache, now_millis()).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Re-announce a service whose details changed, without probing again
    /// (spec §4.G `STEADY → (update → ANNOUNCING)`, §6 `update_service`):
    /// stores the new `ServiceInfo` in the registry, then pushes its full
    /// record set onto the network the same way `register_service` does
    /// after a successful probe.
    pub async fn update_service(&self, info: ServiceInfo) -> Result<()> {
        self.set_service_state(&info.key, ServiceState::Announcing);
        self.registry.update(info.clone()).await;
        self.announce(&info).await?;
        self.set_service_state(&info.key, ServiceState::Steady);
        Ok(())
    }

    /// Unsolicited responses announcing `info`'s full record set, three
    /// times at `register_time_ms` intervals (`_REGISTER_TIME`).
    async fn announce(&self, info: &ServiceInfo) -> Result<()> {
        let now = now_millis();
        let mut records = vec![info.ptr_record(120, now), info.srv_record(120, now), info.txt_record(120, now)];
        records.extend(info.subtype_ptr_records(120, now));
        records.extend(info.dns_addresses(crate::config::IpVersion::All, 120, now));

        for i in 0..3 {
            let id = self.next_message_id();
            let datagrams = message::encode(id, FLAG_RESPONSE | FLAG_AUTHORITATIVE, &[], &records, &[], &[], self.config.max_datagram_size)?;
            for datagram in datagrams {
                self.reactor.send(&datagram, None).await?;
            }
            info!("announced {} ({}/3)", info.instance_name, i + 1);
            if i < 2 {
                sleep(Duration::from_millis(self.config.register_time_ms)).await;
            }
        }
        Ok(())
    }

    /// Goodbye: the same record set sent three times with TTL=0 (spec §4.G).
    pub async fn unregister_service(&self, info: &ServiceInfo) -> Result<()> {
        self.set_service_state(&info.key, ServiceState::Goodbye);
        let now = now_millis();
        let mut records = vec![info.ptr_record(0, now), info.srv_record(0, now), info.txt_record(0, now)];
        records.extend(info.subtype_ptr_records(0, now));
        records.extend(info.dns_addresses(crate::config::IpVersion::All, 0, now));

        for _ in 0..3 {
            let id = self.next_message_id();
            let datagrams = message::encode(id, FLAG_RESPONSE | FLAG_AUTHORITATIVE, &[], &records, &[], &[], self.config.max_datagram_size)?;
            for datagram in datagrams {
                self.reactor.send(&datagram, None).await?;
            }
            sleep(Duration::from_millis(self.config.register_time_ms)).await;
        }
        self.registry.remove(&info.key).await;
        self.set_service_state(&info.key, ServiceState::Terminal);
        Ok(())
    }
}

/// Rename on conflict (§4.G): append " (2)" or increment an existing
/// "(N)" suffix on the bare instance label, then rebuild the full name.
fn rename(info: &mut ServiceInfo) {
    let bare = info.get_name();
    let (stem, n) = match bare.rfind(" (").and_then(|pos| {
        let rest = &bare[pos + 2..];
        rest.strip_suffix(')').and_then(|digits| digits.parse::<u32>().ok()).map(|n| (&bare[..pos], n))
    }) {
        Some((stem, n)) => (stem.to_string(), n + 1),
        None => (bare, 2),
    };
    let new_name = format!("{stem} ({n}).{}", info.service_type);
    info.set_name(new_name);
}

/// Collapse multiple answers sharing identity (e.g. the registry and the
/// cache both offering the same SRV record) down to one.
fn dedup_by_identity(records: Vec<Record>) -> Vec<Record> {
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for record in records {
        let id = record.identity();
        if !seen.contains(&id) {
            seen.push(id);
            out.push(record);
        }
    }
    out
}

/// Known-answer suppression (§4.G, invariant 5): drop any computed answer
/// that the querier already listed with remaining TTL at least half ours.
fn suppress_known_answers(answers: Vec<Record>, known: &[Record], now: u64) -> Vec<Record> {
    answers
        .into_iter()
        .filter(|answer| {
            !known.iter().any(|k| {
                k.identity() == answer.identity() && k.ttl_remaining(now) * 2 >= answer.ttl_remaining(now)
            })
        })
        .collect()
}

async fn send_records(
    reactor: &Reactor,
    id: u16,
    flags: u16,
    records: &[Record],
    target: Option<SocketAddr>,
    max_size: usize,
    now: u64,
) -> Result<()> {
    let with_remaining_ttl: Vec<Record> = records
        .iter()
        .cloned()
        .map(|mut r| {
            r.ttl = r.ttl_remaining(now);
            r
        })
        .collect();
    let datagrams = message::encode(id, flags, &[], &with_remaining_ttl, &[], &[], max_size)?;
    for datagram in datagrams {
        reactor.send(&datagram, target).await?;
    }
    Ok(())
}
