//! Service-info resolver (spec §4.I): `get_service_info`, blocking (from
//! the caller's point of view) until a `ServiceInfo` is complete or a
//! timeout elapses. Grounded on `zeroconf/asyncio.py`'s
//! `AsyncServiceInfo.async_request` — load from cache first, then
//! register as a listener and requery only the missing record types on a
//! doubling `_LISTENER_TIME` backoff, waking early whenever a relevant
//! record arrives instead of sleeping the full interval.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::debug;

use crate::clock::now_millis;
use crate::config::Config;
use crate::engine::{Engine, Listener};
use crate::message::Question;
use crate::name;
use crate::records::{Record, RecordType};
use crate::service_info::ServiceInfo;

/// Bridges the engine's synchronous `Listener::record_updated` callback to
/// an async waiter: records the latest update and notifies, while
/// `resolve` drives the actual requery loop.
struct Waiter {
    key: String,
    server_key: Mutex<Option<String>>,
    notify: Notify,
}

impl Listener for Waiter {
    fn record_updated(&self, record: &Record, _now_ms: u64) {
        let record_key = name::key(&record.name);
        let matches_instance = record_key == self.key;
        let matches_server = self
            .server_key
            .lock()
            .unwrap()
            .as_ref()
            .map(|k| *k == record_key)
            .unwrap_or(false);
        if matches_instance || matches_server {
            self.notify.notify_waiters();
        }
    }
}

/// Look up one service instance's full `ServiceInfo` (spec §4.I). Loads
/// whatever the cache already has, then — if incomplete — requeries only
/// the still-missing record types, doubling the wait between attempts
/// from `config.listener_time_ms`, until `info.is_complete()` or
/// `timeout` elapses.
pub async fn get_service_info(
    engine: &Arc<Engine>,
    config: &Config,
    service_type: &str,
    instance_name: &str,
    timeout: Duration,
) -> Option<ServiceInfo> {
    let mut info = ServiceInfo::placeholder(service_type, instance_name);
    load_from_cache(engine, &mut info).await;
    if info.is_complete() {
        return Some(info);
    }

    let waiter = Arc::new(Waiter {
        key: info.key.clone(),
        server_key: Mutex::new(None),
        notify: Notify::new(),
    });
    let listener: Arc<dyn Listener> = waiter.clone();
    engine.add_listener(&listener).await;

    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(config.listener_time_ms);

    let result = loop {
        if info.is_complete() {
            break Some(info);
        }

        let missing = info.missing_types();
        if missing.is_empty() {
            break Some(info);
        }

        let questions: Vec<Question> = missing
            .iter()
            .map(|rtype| {
                let name = if matches!(rtype, RecordType::A | RecordType::AAAA) {
                    info.server.clone()
                } else {
                    info.instance_name.clone()
                };
                Question::new(name, *rtype, false)
            })
            .collect();

        if !info.server_key.is_empty() {
            *waiter.server_key.lock().unwrap() = Some(info.server_key.clone());
        }

        if let Err(e) = engine.send_query(questions, Vec::new()).await {
            debug!("resolver query for {} failed: {}", instance_name, e);
        }

        let wait_until = Instant::now() + delay;
        if wait_until >= deadline {
            // One last wait capped at the deadline, then give up either way.
            let _ = timeout_at(deadline, waiter.notify.notified()).await;
            load_from_cache(engine, &mut info).await;
            break info.is_complete().then_some(info);
        }

        let _ = timeout_at(wait_until, waiter.notify.notified()).await;
        load_from_cache(engine, &mut info).await;
        delay *= 2;
    };

    // `waiter` drops here; its `Weak` is pruned from the engine's listener
    // list the next time a record is notified (spec §9 weak-listener note).
    result
}

async fn load_from_cache(engine: &Arc<Engine>, info: &mut ServiceInfo) {
    let now = now_millis();
    for record in engine.cache.get_by_name(&info.instance_name, now).await {
        info.update_record(&record, now);
    }
    if !info.server_key.is_empty() {
        let server = info.server.clone();
        for record in engine.cache.get_by_name(&server, now).await {
            info.update_record(&record, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::message::{Header, Message, FLAG_RESPONSE};
    use crate::reactor::{DefaultIfaces, Inbound, Reactor};
    use crate::registry::Registry;
    use crate::records::Srv;
    use std::net::{Ipv4Addr, SocketAddr};

    async fn test_engine() -> (Arc<Engine>, Config) {
        let cache = Arc::new(Cache::new());
        let registry = Arc::new(Registry::new());
        let config = Config {
            interfaces: crate::config::InterfaceChoice::Explicit(vec!["127.0.0.1".to_string()]),
            unicast: true,
            ..Config::default()
        };
        let reactor = Arc::new(Reactor::open(&config, &DefaultIfaces).await.unwrap());
        (Engine::new(cache, registry, reactor, config.clone()), config)
    }

    /// A decoded inbound response message carrying `answers`, as the
    /// reactor would hand one to `Engine::handle_inbound` after parsing it
    /// off the wire.
    fn response_message(answers: Vec<Record>) -> Message {
        Message {
            header: Header {
                id: 0,
                flags: FLAG_RESPONSE,
                qd_count: 0,
                an_count: answers.len() as u16,
                ns_count: 0,
                ar_count: 0,
            },
            questions: Vec::new(),
            answers,
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    fn loopback_source() -> SocketAddr {
        "127.0.0.1:5353".parse().unwrap()
    }

    /// Polls `engine`'s recorded outbound queries until at least `count`
    /// have been sent, or panics after a short deadline. Needed because the
    /// resolver's requery is driven by a background task woken through
    /// `Engine::handle_inbound` rather than by anything this test calls
    /// directly.
    async fn wait_for_query_count(engine: &Arc<Engine>, count: usize) {
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            if engine.sent_query_question_counts().await.len() >= count {
                return;
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for {count} outbound quer(y/ies) to be sent");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn resolves_immediately_from_a_warm_cache() {
        let (engine, config) = test_engine().await;
        let now = now_millis();
        engine
            .cache
            .add(Record::srv(
                "inst._http._tcp.local.",
                Srv { priority: 0, weight: 0, port: 80, target: "ash-1.local.".to_string() },
                120,
                now,
            ))
            .await;
        engine
            .cache
            .add(Record::txt("inst._http._tcp.local.", crate::records::Txt::from_entries([b"k=v".as_slice()]), 120, now))
            .await;
        engine.cache.add(Record::a("ash-1.local.", Ipv4Addr::new(10, 0, 0, 9), 120, now)).await;

        let info = get_service_info(&engine, &config, "_http._tcp.local.", "inst._http._tcp.local.", Duration::from_millis(50))
            .await
            .expect("service should resolve from cache");
        assert!(info.is_complete());
        assert_eq!(info.addresses, vec![std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))]);
    }

    #[tokio::test]
    async fn times_out_when_nothing_in_cache() {
        let (engine, config) = test_engine().await;
        let info = get_service_info(&engine, &config, "_http._tcp.local.", "missing._http._tcp.local.", Duration::from_millis(30)).await;
        assert!(info.is_none());
    }

    /// S2: inject SRV/TXT/A answers one at a time through the real
    /// `Engine::handle_inbound` path and watch the resolver's outbound
    /// query narrow each round: 4 questions (SRV, TXT, A, AAAA), then 3
    /// once TXT is known, then 2 once SRV is known, then no further query
    /// once an address arrives and the info is complete.
    #[tokio::test]
    async fn engine_driven_resolution_narrows_query_each_round() {
        let (engine, mut config) = test_engine().await;
        config.listener_time_ms = 5;
        let instance = "inst._http._tcp.local.";

        let resolve = tokio::spawn({
            let engine = engine.clone();
            let config = config.clone();
            async move { get_service_info(&engine, &config, "_http._tcp.local.", instance, Duration::from_millis(1_000)).await }
        });

        wait_for_query_count(&engine, 1).await;
        assert_eq!(engine.sent_query_question_counts().await[0], 4);

        let source = loopback_source();
        let txt = Record::txt(instance, crate::records::Txt::from_entries([b"path=/~matt1/".as_slice()]), 120, now_millis());
        engine.handle_inbound(Inbound { message: response_message(vec![txt]), source }).await;

        wait_for_query_count(&engine, 2).await;
        assert_eq!(engine.sent_query_question_counts().await[1], 3);

        let srv = Record::srv(
            instance,
            Srv { priority: 0, weight: 0, port: 80, target: "ash-1.local.".to_string() },
            120,
            now_millis(),
        );
        engine.handle_inbound(Inbound { message: response_message(vec![srv]), source }).await;

        wait_for_query_count(&engine, 3).await;
        assert_eq!(engine.sent_query_question_counts().await[2], 2);

        let a = Record::a("ash-1.local.", Ipv4Addr::new(10, 0, 1, 2), 120, now_millis());
        engine.handle_inbound(Inbound { message: response_message(vec![a]), source }).await;

        let info = resolve.await.unwrap().expect("should resolve complete once the address arrives");
        assert!(info.is_complete());
        assert_eq!(info.addresses, vec![std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2))]);
        assert_eq!(info.port, 80);
        assert_eq!(info.server, "ash-1.local.");
        // No further query after the info became complete.
        assert_eq!(engine.sent_query_question_counts().await.len(), 3);
    }

    /// S3: the same three answers arriving in a single message collapse to
    /// exactly one outbound query.
    #[tokio::test]
    async fn single_message_with_all_answers_collapses_to_one_query() {
        let (engine, mut config) = test_engine().await;
        config.listener_time_ms = 5;
        let instance = "inst._http._tcp.local.";

        let resolve = tokio::spawn({
            let engine = engine.clone();
            let config = config.clone();
            async move { get_service_info(&engine, &config, "_http._tcp.local.", instance, Duration::from_millis(1_000)).await }
        });

        wait_for_query_count(&engine, 1).await;
        assert_eq!(engine.sent_query_question_counts().await[0], 4);

        let now = now_millis();
        let txt = Record::txt(instance, crate::records::Txt::from_entries([b"path=/~matt1/".as_slice()]), 120, now);
        let srv = Record::srv(instance, Srv { priority: 0, weight: 0, port: 80, target: "ash-1.local.".to_string() }, 120, now);
        let a = Record::a("ash-1.local.", Ipv4Addr::new(10, 0, 1, 2), 120, now);
        let source = loopback_source();
        engine.handle_inbound(Inbound { message: response_message(vec![txt, srv, a]), source }).await;

        let info = resolve.await.unwrap().expect("should resolve complete");
        assert!(info.is_complete());
        assert_eq!(engine.sent_query_question_counts().await.len(), 1);
    }
}
