//! Service browser (spec §4.H): watches the cache for a service type's PTR
//! records and emits Added/Updated/Removed events, re-querying on a
//! doubling backoff that resets whenever a fresh answer arrives. Grounded
//! on `original_source/examples/browser-subservice.py` for the event shape
//! (`ServiceStateChange`) and on `zeroconf/asyncio.py`'s
//! `_CHECK_TIME`-doubling query loop for the retry schedule, adapted here
//! into a `Listener` impl plus a background task instead of a
//! `threading.Timer` chain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::clock::now_millis;
use crate::config::Config;
use crate::engine::{Engine, Listener};
use crate::message::Question;
use crate::name;
use crate::records::{RData, Record, RecordType};

/// The special meta-type a PTR browse on it enumerates every advertised
/// service type on the network (spec §10.6, `find_all_service_types`).
pub const SERVICE_TYPE_ENUMERATION_TYPE: &str = "_services._dns-sd._udp.local.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Added { service_type: String, name: String },
    Removed { service_type: String, name: String },
    Updated { service_type: String, name: String },
}

/// Tracks one service type's PTR population and forwards state-change
/// events on an unbounded channel. Registers itself with the engine as a
/// `Listener`; a background task re-issues the PTR query on a backoff
/// that doubles from `check_time_ms` up to `browser_max_interval_ms`,
/// resetting to `check_time_ms` whenever a fresh PTR answer arrives
/// (spec §4.H: "resetting whenever a new answer arrives").
/// `seen` is a plain (non-async) mutex: `record_updated` runs synchronously
/// from inside the engine's listener dispatch and never awaits.
pub struct ServiceBrowser {
    service_type: String,
    engine: Arc<Engine>,
    config: Config,
    seen: Mutex<HashMap<String, ()>>,
    events: mpsc::UnboundedSender<ServiceEvent>,
    query_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by `handle_ptr` whenever a PTR answer adds or updates an
    /// instance; `query_loop` races this against its backoff sleep and
    /// resets the backoff when it fires first.
    new_answer: Notify,
}

impl ServiceBrowser {
    pub fn new(
        engine: Arc<Engine>,
        config: Config,
        service_type: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let browser = Arc::new(Self {
            service_type: service_type.into(),
            engine,
            config,
            seen: Mutex::new(HashMap::new()),
            events: tx,
            query_task: Mutex::new(None),
            new_answer: Notify::new(),
        });
        (browser, rx)
    }

    /// Register as a cache listener and spawn the periodic query task. The
    /// task handle is kept on the browser itself and aborted by `stop` (and
    /// on drop), so a removed browser doesn't leave its query loop running.
    pub async fn start(self: &Arc<Self>) {
        let listener: Arc<dyn Listener> = self.clone();
        self.engine.add_listener(&listener).await;

        let browser = self.clone();
        let handle = tokio::spawn(async move { browser.query_loop().await });
        *self.query_task.lock().unwrap() = Some(handle);
    }

    /// Stop the periodic query loop. The browser still holds whatever it
    /// already pushed into `seen`; it simply stops re-querying and reacting.
    pub fn stop(&self) {
        if let Some(handle) = self.query_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn query_loop(self: Arc<Self>) {
        let mut delay = self.config.check_time_ms;
        loop {
            let question = Question::new(self.service_type.clone(), RecordType::PTR, false);
            let now = now_millis();
            let known_answers = self.engine.cache.get_by_name(&self.service_type, now).await;
            if let Err(e) = self.engine.send_query(vec![question], known_answers).await {
                debug!("browser query for {} failed: {}", self.service_type, e);
            }

            tokio::select! {
                _ = sleep(Duration::from_millis(delay)) => {
                    delay = (delay * 2).min(self.config.browser_max_interval_ms);
                }
                _ = self.new_answer.notified() => {
                    delay = self.config.check_time_ms;
                }
            }
        }
    }

    fn handle_ptr(&self, record: &Record, now_ms: u64) {
        if name::key(&record.name) != name::key(&self.service_type) {
            return;
        }
        let RData::Ptr(target) = &record.rdata else { return };
        let instance_key = name::key(target);

        let mut seen = self.seen.lock().unwrap();
        if record.is_expired(now_ms) || record.is_goodbye() {
            if seen.remove(&instance_key).is_some() {
                let _ = self.events.send(ServiceEvent::Removed {
                    service_type: self.service_type.clone(),
                    name: target.clone(),
                });
            }
            return;
        }

        let already_seen = seen.insert(instance_key, ()).is_some();
        let event = if already_seen {
            ServiceEvent::Updated { service_type: self.service_type.clone(), name: target.clone() }
        } else {
            ServiceEvent::Added { service_type: self.service_type.clone(), name: target.clone() }
        };
        let _ = self.events.send(event);
        self.new_answer.notify_one();
    }
}

impl Listener for ServiceBrowser {
    fn record_updated(&self, record: &Record, now_ms: u64) {
        if record.rtype == RecordType::PTR {
            self.handle_ptr(record, now_ms);
        }
    }
}

impl Drop for ServiceBrowser {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::reactor::{DefaultIfaces, Reactor};
    use crate::registry::Registry;

    #[test]
    fn service_type_enumeration_constant_is_well_formed() {
        assert_eq!(SERVICE_TYPE_ENUMERATION_TYPE, "_services._dns-sd._udp.local.");
    }

    #[tokio::test]
    async fn added_then_removed_round_trip() {
        let cache = Arc::new(Cache::new());
        let registry = Arc::new(Registry::new());
        let config = Config { interfaces: crate::config::InterfaceChoice::Explicit(vec!["127.0.0.1".to_string()]), ..Config::default() };
        let reactor = Arc::new(Reactor::open(&config, &DefaultIfaces).await.unwrap());
        let engine = Engine::new(cache, registry, reactor, config.clone());
        let (browser, mut rx) = ServiceBrowser::new(engine, config, "_http._tcp.local.");

        let added = Record::ptr("_http._tcp.local.", "inst._http._tcp.local.", 120, 0);
        browser.handle_ptr(&added, 0);
        assert_eq!(rx.try_recv().unwrap(), ServiceEvent::Added { service_type: "_http._tcp.local.".to_string(), name: "inst._http._tcp.local.".to_string() });

        let mut removed = added.clone();
        removed.ttl = 0;
        browser.handle_ptr(&removed, 0);
        assert_eq!(rx.try_recv().unwrap(), ServiceEvent::Removed { service_type: "_http._tcp.local.".to_string(), name: "inst._http._tcp.local.".to_string() });
    }

    #[tokio::test]
    async fn fresh_answer_wakes_the_backoff() {
        let cache = Arc::new(Cache::new());
        let registry = Arc::new(Registry::new());
        let config = Config { interfaces: crate::config::InterfaceChoice::Explicit(vec!["127.0.0.1".to_string()]), ..Config::default() };
        let reactor = Arc::new(Reactor::open(&config, &DefaultIfaces).await.unwrap());
        let engine = Engine::new(cache, registry, reactor, config.clone());
        let (browser, _rx) = ServiceBrowser::new(engine, config, "_http._tcp.local.");

        // Nothing has arrived yet: waiting on `new_answer` should not
        // resolve within a short window.
        let waited = tokio::time::timeout(Duration::from_millis(20), browser.new_answer.notified()).await;
        assert!(waited.is_err());

        let added = Record::ptr("_http._tcp.local.", "inst._http._tcp.local.", 120, 0);
        browser.handle_ptr(&added, 0);

        // A fresh PTR answer should wake a waiter immediately — this is
        // what lets `query_loop`'s backoff reset instead of sleeping out
        // the full doubled interval (spec §4.H).
        let waited = tokio::time::timeout(Duration::from_millis(20), browser.new_answer.notified()).await;
        assert!(waited.is_ok());
    }
}
