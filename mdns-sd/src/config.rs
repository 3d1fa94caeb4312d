//! Engine configuration (spec §6): which address families and interfaces
//! to bind, whether to use a unicast ephemeral port, and the tunable
//! timing constants §4 names. No field here is ever persisted to disk —
//! unlike the teacher's `DnsConfig`, this struct does not derive
//! `Serialize`/`Deserialize`.

use crate::message::DEFAULT_MAX_DATAGRAM_SIZE;

/// Which address families to listen and query on. Default matches the
/// teacher-grounded original: `V4Only`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVersion {
    #[default]
    V4Only,
    V6Only,
    All,
}

impl IpVersion {
    pub fn wants_v4(self) -> bool {
        matches!(self, IpVersion::V4Only | IpVersion::All)
    }

    pub fn wants_v6(self) -> bool {
        matches!(self, IpVersion::V6Only | IpVersion::All)
    }
}

/// Which local interfaces to bind sockets on.
#[derive(Debug, Clone, Default)]
pub enum InterfaceChoice {
    /// Bind every interface the platform reports.
    All,
    /// Let the OS pick (the unspecified address).
    #[default]
    Default,
    /// Explicit list of interface IPs or indices, as strings.
    Explicit(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ip_version: IpVersion,
    pub interfaces: InterfaceChoice,
    /// Bind an ephemeral unicast port for queries instead of 5353;
    /// replies then arrive unicast.
    pub unicast: bool,
    /// Also enable the AWDL interface (platform-specific; a no-op seam
    /// here, since platform socket options are outside this crate's scope).
    pub apple_p2p: bool,

    /// Outbound datagram size cap (§4.C). Clamped to `message::MIN_MAX_DATAGRAM_SIZE`.
    pub max_datagram_size: usize,
    /// Interval between the three probe queries (§4.G).
    pub probe_interval_ms: u64,
    /// Probe/rename attempts before giving up with `NonUniqueName` (§4.G).
    pub max_probe_attempts: u32,
    /// `_REGISTER_TIME`: interval between the three unsolicited
    /// announce responses, and between the three goodbye responses.
    pub register_time_ms: u64,
    /// `_LISTENER_TIME`: initial retry interval for the service-info
    /// resolver's requery loop, doubling from here (§4.I).
    pub listener_time_ms: u64,
    /// `_CHECK_TIME`: initial retry interval for a service browser's
    /// periodic PTR query, doubling from here up to `browser_max_interval_ms` (§4.H).
    pub check_time_ms: u64,
    pub browser_max_interval_ms: u64,
    /// Cache reap period; spec requires this run at least every 10s.
    pub reap_interval_ms: u64,
    /// Multicast-response aggregation delay window (§4.G): uniform
    /// random in `[query_delay_min_ms, query_delay_max_ms]`.
    pub query_delay_min_ms: u64,
    pub query_delay_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip_version: IpVersion::default(),
            interfaces: InterfaceChoice::default(),
            unicast: false,
            apple_p2p: false,

            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            probe_interval_ms: 250,
            max_probe_attempts: 10,
            register_time_ms: 1_000,
            listener_time_ms: 1_000,
            check_time_ms: 1_000,
            browser_max_interval_ms: 3_600_000,
            reap_interval_ms: 10_000,
            query_delay_min_ms: 20,
            query_delay_max_ms: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.ip_version, IpVersion::V4Only);
        assert!(!config.unicast);
        assert_eq!(config.max_probe_attempts, 10);
        assert_eq!(config.reap_interval_ms, 10_000);
    }

    #[test]
    fn ip_version_family_filters() {
        assert!(IpVersion::V4Only.wants_v4());
        assert!(!IpVersion::V4Only.wants_v6());
        assert!(IpVersion::All.wants_v4());
        assert!(IpVersion::All.wants_v6());
    }
}
