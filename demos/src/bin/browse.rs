//! Browse for service instances and print their full `ServiceInfo` as each
//! one is discovered, mirroring `examples/browser-subservice.py` from the
//! original project. With `--find`, first enumerates every advertised
//! service type (`find_all_service_types`) and browses all of them instead
//! of the hardcoded default.

use std::time::Duration;

use mdns_sd::{Config, Daemon, ServiceEvent};
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,demos=debug".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let find = args.iter().any(|a| a == "--find");
    let v6 = args.iter().any(|a| a == "--v6");
    let v6_only = args.iter().any(|a| a == "--v6-only");

    let config = Config {
        ip_version: if v6_only {
            mdns_sd::IpVersion::V6Only
        } else if v6 {
            mdns_sd::IpVersion::All
        } else {
            mdns_sd::IpVersion::V4Only
        },
        ..Config::default()
    };

    let daemon = Daemon::open(config).await?;

    let service_types = if find {
        daemon.find_all_service_types(Duration::from_secs(3)).await
    } else {
        vec!["_RToic.d.battery._sub._ocfd._udp.local.".to_string()]
    };

    println!("\nBrowsing {} service(s), press Ctrl-C to exit...\n", service_types.len());

    // Fan every browser's events into one channel of (service_type, event)
    // pairs so the main loop can select across all of them at once.
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut browsers = Vec::new();
    for service_type in service_types {
        let (browser, mut rx) = daemon.add_service_listener(&service_type).await;
        browsers.push(browser);
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if tx.send((service_type.clone(), event)).is_err() {
                    return;
                }
            }
        });
    }
    drop(tx);

    loop {
        tokio::select! {
            Some((service_type, event)) = events.recv() => {
                print_event(&daemon, &service_type, event).await;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    for browser in &browsers {
        daemon.remove_service_listener(browser).await;
    }
    daemon.close().await;
    Ok(())
}

async fn print_event(daemon: &Daemon, service_type: &str, event: ServiceEvent) {
    match event {
        ServiceEvent::Added { name, .. } => {
            println!("Service {name} of type {service_type} state changed: Added");
            match daemon.get_service_info(service_type, &name, Duration::from_secs(3)).await {
                Some(info) => {
                    println!("  Server: {}", info.server);
                    println!("  Port: {}", info.port);
                    println!("  Addresses: {:?}", info.parsed_addresses(mdns_sd::IpVersion::All));
                    for (key, value) in &info.properties {
                        println!(
                            "  {}: {:?}",
                            String::from_utf8_lossy(key),
                            value.as_ref().map(|v| String::from_utf8_lossy(v))
                        );
                    }
                }
                None => info!("{name} added but did not resolve in time"),
            }
        }
        ServiceEvent::Updated { name, .. } => println!("Service {name} of type {service_type} state changed: Updated"),
        ServiceEvent::Removed { name, .. } => println!("Service {name} of type {service_type} state changed: Removed"),
    }
}
