//! Announce a couple of fake services on the local network, mirroring
//! `examples/registration.py` from the original project: two device
//! instances of `_ocfd._udp.local.`, each with a subtype, left running
//! until Ctrl-C, then goodbye'd and closed cleanly.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use mdns_sd::{Config, Daemon, ServiceInfo};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,demos=debug".parse().unwrap()),
        )
        .init();

    let v6 = std::env::args().any(|a| a == "--v6");
    let v6_only = std::env::args().any(|a| a == "--v6-only");
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

    let devices = [
        ("54321CA5-4101-4AE4-595B-353C51AA983C", "dummy-1.local.", "_DI54321CA5-4101-4AE4-595B-353C51AA983C._sub", "_RToic.d.light._sub"),
        ("12345CA5-4101-4AE4-595B-353C51AA983C", "dummy-2.local.", "_DI12345CA5-4101-4AE4-595B-353C51AA983C._sub", "_RToic.d.battery._sub"),
    ];

    for (name, server, di_subtype, rt_subtype) in devices {
        let type_ = "_ocfd._udp.local.";
        let full_name = format!("{name}.{type_}");
        let mut info = ServiceInfo::new(
            type_,
            &full_name,
            server,
            80,
            0,
            0,
            vec![(b"di".to_vec(), Some(name.as_bytes().to_vec())), (b"rt".to_vec(), Some(b"oic.d.light".to_vec()))],
            vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))],
        );
        info.add_subtype(di_subtype);
        info.add_subtype(rt_subtype);

        info!("registering {}", full_name);
        daemon.register_service(info, false).await?;
    }

    info!("registered, press Ctrl-C to unregister and exit");
    tokio::signal::ctrl_c().await?;

    info!("unregistering...");
    daemon.unregister_all_services().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    daemon.close().await;
    Ok(())
}
