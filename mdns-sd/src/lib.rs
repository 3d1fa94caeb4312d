//! A multicast DNS / DNS-SD engine (RFC 6762 / RFC 6763): register local
//! services, browse for remote ones, and resolve a service instance's
//! full connection details. The public surface is `Daemon`, modelled on
//! the teacher's `DnsState`/`SharedDnsState` split — one struct holding
//! every shared piece (`cache`, `registry`, `reactor`, `engine`) behind
//! `Arc`s so clones are cheap and every component can be reached
//! independently from background tasks.

pub mod browser;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod name;
pub mod reactor;
pub mod records;
pub mod registry;
pub mod resolver;
pub mod service_info;

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::info;

pub use browser::ServiceEvent;
pub use config::{Config, InterfaceChoice, IpVersion};
pub use error::{Error, Result};
pub use service_info::{Properties, ServiceInfo};

use browser::ServiceBrowser;
use cache::Cache;
use engine::Engine;
use reactor::{DefaultIfaces, Ifaces, Reactor};
use registry::Registry;

/// A running mDNS/DNS-SD engine instance (spec §1 "Daemon handle" /
/// teacher's `Zeroconf`/`AsyncZeroconf`).
pub struct Daemon {
    cache: Arc<Cache>,
    registry: Arc<Registry>,
    engine: Arc<Engine>,
    config: Config,
    receive_tasks: Vec<tokio::task::JoinHandle<()>>,
    reap_task: tokio::task::JoinHandle<()>,
    dispatch_task: tokio::task::JoinHandle<()>,
}

impl Daemon {
    /// Open sockets and start background tasks (receive loops, cache
    /// reaper). Equivalent to the teacher's `Zeroconf::new` /
    /// `AsyncZeroconf::__init__`.
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with_ifaces(config, &DefaultIfaces).await
    }

    /// As `open`, but with an explicit interface-enumeration strategy —
    /// the seam tests and embedders use in place of the real platform
    /// lookup (spec §1, out-of-scope platform interface enumeration).
    pub async fn open_with_ifaces(config: Config, ifaces: &dyn Ifaces) -> Result<Self> {
        let cache = Arc::new(Cache::new());
        let registry = Arc::new(Registry::new());
        let reactor = Arc::new(Reactor::open(&config, ifaces).await?);
        let engine = Engine::new(cache.clone(), registry.clone(), reactor.clone(), config.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let receive_tasks = reactor.spawn_receive_loops(tx);

        let dispatch_engine = engine.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                dispatch_engine.handle_inbound(inbound).await;
            }
        });

        let reap_cache = cache.clone();
        let reap_interval = Duration::from_millis(config.reap_interval_ms);
        let reap_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(reap_interval).await;
                let evicted = reap_cache.reap(clock::now_millis()).await;
                if evicted > 0 {
                    info!("cache reap evicted {} expired record(s)", evicted);
                }
            }
        });

        Ok(Self {
            cache,
            registry,
            engine,
            config,
            receive_tasks,
            reap_task,
            dispatch_task,
        })
    }

    /// Probe, announce, and register a service (spec §4.G). When
    /// `cooperating_responders` is set, skips probing/conflict-checking
    /// entirely and announces straight away — multiple responders are
    /// expected to answer for this name, mirroring
    /// `async_check_service`'s early return for that flag. Otherwise
    /// probes first and renames on conflict.
    pub async fn register_service(&self, info: ServiceInfo, cooperating_responders: bool) -> Result<ServiceInfo> {
        info.validate()?;
        self.engine.register_service(info, cooperating_responders).await
    }

    /// Re-announce a service whose details changed, without probing
    /// again (it was already proven unique).
    pub async fn update_service(&self, info: ServiceInfo) -> Result<()> {
        self.engine.update_service(info).await
    }

    /// Goodbye a registered service (spec §4.G).
    pub async fn unregister_service(&self, key: &str) -> Result<()> {
        if let Some(info) = self.registry.get(key).await {
            self.engine.unregister_service(&info).await?;
        }
        Ok(())
    }

    /// Goodbye every service this daemon has registered.
    pub async fn unregister_all_services(&self) -> Result<()> {
        for info in self.registry.all().await {
            self.engine.unregister_service(&info).await?;
        }
        Ok(())
    }

    /// Resolve one service instance's full connection details (spec
    /// §4.I), blocking up to `timeout`.
    pub async fn get_service_info(&self, service_type: &str, instance_name: &str, timeout: Duration) -> Option<ServiceInfo> {
        resolver::get_service_info(&self.engine, &self.config, service_type, instance_name, timeout).await
    }

    /// Start browsing one service type (spec §4.H). Returns the browser
    /// handle (pass it to `remove_service_listener` to stop) and a
    /// receiver of `ServiceEvent`s.
    pub async fn add_service_listener(&self, service_type: &str) -> (Arc<ServiceBrowser>, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (browser, rx) = ServiceBrowser::new(self.engine.clone(), self.config.clone(), service_type);
        browser.start().await;
        (browser, rx)
    }

    /// Stop one browser started with `add_service_listener`.
    pub async fn remove_service_listener(&self, browser: &Arc<ServiceBrowser>) {
        browser.stop();
        let listener: Arc<dyn engine::Listener> = browser.clone();
        self.engine.remove_listener(&listener).await;
    }

    /// Stop every registered listener (browsers and in-flight resolves).
    pub async fn remove_all_service_listeners(&self) {
        self.engine.remove_all_listeners().await;
    }

    /// Enumerate every service type currently advertised on the network
    /// (spec §10.6), by browsing the special `_services._dns-sd._udp.local.`
    /// meta-type for `timeout` and collecting the distinct PTR targets seen.
    pub async fn find_all_service_types(&self, timeout: Duration) -> Vec<String> {
        let (browser, mut rx) = self.add_service_listener(browser::SERVICE_TYPE_ENUMERATION_TYPE).await;
        let mut found = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(ServiceEvent::Added { name, .. })) => {
                    if !found.contains(&name) {
                        found.push(name);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        self.remove_service_listener(&browser).await;
        found
    }

    /// Shut down every background task, blocking until each one has
    /// actually finished (spec §5: "close blocks until all worker threads
    /// join and all sockets are closed"). Does not send goodbyes for
    /// registered services — call `unregister_all_services` first if
    /// that's wanted (mirrors `Zeroconf.close` leaving that to the caller).
    pub async fn close(self) {
        self.dispatch_task.abort();
        self.reap_task.abort();
        for task in &self.receive_tasks {
            task.abort();
        }
        let _ = self.dispatch_task.await;
        let _ = self.reap_task.await;
        for task in self.receive_tasks {
            let _ = task.await;
        }
        info!("mdns daemon closed");
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> Config {
        Config {
            interfaces: InterfaceChoice::Explicit(vec!["127.0.0.1".to_string()]),
            unicast: true,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn opens_and_closes_cleanly_on_loopback() {
        let daemon = Daemon::open(loopback_config()).await.unwrap();
        assert_eq!(daemon.cache().len().await, 0);
        daemon.close().await;
    }

    #[tokio::test]
    async fn register_then_lookup_in_registry() {
        let daemon = Daemon::open(loopback_config()).await.unwrap();
        let info = ServiceInfo::new(
            "_http._tcp.local.",
            "box._http._tcp.local.",
            "box.local.",
            80,
            0,
            0,
            vec![],
            vec![IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 4))],
        );
        // cooperating_responders=true skips the network probe, which would
        // otherwise need a real peer to race against on loopback.
        let registered = daemon.register_service(info, true).await.unwrap();
        assert!(daemon.registry().get(&registered.key).await.is_some());
        daemon.close().await;
    }
}
