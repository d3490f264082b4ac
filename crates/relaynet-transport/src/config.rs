//! Tunables for routing, router health checking, and RPC transport.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TransportError, TransportResult};

/// Whether this node forwards traffic for other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum Forwarding {
    /// Not set either way: forward only if the node is configured as a router.
    #[default]
    Unset,
    /// Explicitly enabled.
    Enabled,
    /// Explicitly disabled.
    Disabled,
}

impl Forwarding {
    /// Parses the textual setting; only "", "enabled" and "disabled" are accepted.
    pub fn parse(value: &str) -> TransportResult<Self> {
        match value {
            "" => Ok(Forwarding::Unset),
            "enabled" => Ok(Forwarding::Enabled),
            "disabled" => Ok(Forwarding::Disabled),
            other => Err(TransportError::InvalidConfig(format!(
                "'forwarding' not set to either 'enabled' or 'disabled': '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Forwarding {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Forwarding::parse(&value)
    }
}

impl From<Forwarding> for String {
    fn from(value: Forwarding) -> Self {
        match value {
            Forwarding::Unset => String::new(),
            Forwarding::Enabled => "enabled".to_string(),
            Forwarding::Disabled => "disabled".to_string(),
        }
    }
}

/// Router and router-checker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Explicit forwarding setting.
    pub forwarding: Forwarding,
    /// Buffers in the zero-payload pool.
    pub tiny_router_buffers: i64,
    /// Buffers in the one-page pool.
    pub small_router_buffers: i64,
    /// Buffers in the MTU-sized pool.
    pub large_router_buffers: i64,
    /// Per-peer forwarding credits; 0 defers to the interface default.
    pub peer_buffer_credits: i64,
    /// Honour "peer is down" reports from network interfaces.
    pub auto_down: bool,
    /// Refuse to use a gateway until its state has been pinged.
    pub check_routers_before_use: bool,
    /// Track per-route down interfaces from ping payloads.
    pub avoid_asym_router_failure: bool,
    /// Seconds between pings of dead gateways (<= 0 disables).
    pub dead_router_check_interval: i64,
    /// Seconds between pings of live gateways (<= 0 disables).
    pub live_router_check_interval: i64,
    /// Seconds a ping may go unanswered before the gateway is marked dead.
    pub router_ping_timeout: u64,
    /// Milliseconds between router checker sweeps.
    pub checker_tick_ms: u64,
    /// Milliseconds between waits for ping buffers to be released at shutdown.
    pub rcd_prune_pause_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            forwarding: Forwarding::Unset,
            tiny_router_buffers: 1024,
            small_router_buffers: 8192,
            large_router_buffers: 512,
            peer_buffer_credits: 0,
            auto_down: true,
            check_routers_before_use: false,
            avoid_asym_router_failure: false,
            dead_router_check_interval: 0,
            live_router_check_interval: 0,
            router_ping_timeout: 50,
            checker_tick_ms: 1000,
            rcd_prune_pause_ms: 250,
        }
    }
}

impl RouterConfig {
    /// New peers start down when gateways must be checked before use.
    pub fn peers_start_down(&self) -> bool {
        self.check_routers_before_use
    }

    /// Ping timeout as a duration.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.router_ping_timeout)
    }

    /// Sweep period as a duration.
    pub fn checker_tick(&self) -> Duration {
        Duration::from_millis(self.checker_tick_ms)
    }

    /// Pause between prune passes while waiting for unlinks.
    pub fn rcd_prune_pause(&self) -> Duration {
        Duration::from_millis(self.rcd_prune_pause_ms)
    }

    /// Ping interval for a gateway in the given state; zero disables pinging.
    pub fn check_interval(&self, alive: bool) -> Duration {
        let secs = if alive {
            self.live_router_check_interval
        } else {
            self.dead_router_check_interval
        };
        Duration::from_secs(secs.max(0) as u64)
    }

    /// How long a local interface may stay silent before it is reported down.
    pub fn ni_status_timeout(&self) -> Duration {
        let longest = self
            .live_router_check_interval
            .max(self.dead_router_check_interval)
            .max(0) as u64;
        Duration::from_secs(self.router_ping_timeout + longest)
    }

    /// Checks the combinations the router checker cannot run with.
    pub fn validate(&self) -> TransportResult<()> {
        if self.check_routers_before_use && self.dead_router_check_interval <= 0 {
            return Err(TransportError::InvalidConfig(
                "'dead_router_check_interval' must be set if 'check_routers_before_use' is set"
                    .to_string(),
            ));
        }
        if self.checker_tick_ms == 0 {
            return Err(TransportError::InvalidConfig(
                "checker_tick_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// RPC transport tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Portal servers receive requests on.
    pub request_portal: u32,
    /// Portal clients receive replies on.
    pub reply_portal: u32,
    /// Portal bulk data moves on.
    pub bulk_portal: u32,
    /// Default time a caller waits for a reply, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// Seconds between warnings while waiting for the network to release memory.
    pub unlink_wait_timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_portal: 4,
            reply_portal: 10,
            bulk_portal: 8,
            rpc_timeout_ms: 30_000,
            unlink_wait_timeout_secs: 300,
        }
    }
}

impl RpcConfig {
    /// Default reply timeout.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Interval between "unexpectedly long" warnings during unlink waits.
    pub fn unlink_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.unlink_wait_timeout_secs)
    }
}

/// Full transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LnetConfig {
    /// Routing and health checker settings.
    pub router: RouterConfig,
    /// Message transport settings.
    pub rpc: RpcConfig,
}

impl LnetConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: LnetConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> TransportResult<()> {
        self.router.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_default_values() {
        let config = RouterConfig::default();
        assert_eq!(config.tiny_router_buffers, 1024);
        assert_eq!(config.small_router_buffers, 8192);
        assert_eq!(config.large_router_buffers, 512);
        assert_eq!(config.router_ping_timeout, 50);
        assert!(config.auto_down);
        assert!(!config.check_routers_before_use);
        assert_eq!(config.forwarding, Forwarding::Unset);
    }

    #[test]
    fn test_forwarding_parse() {
        assert_eq!(Forwarding::parse("").unwrap(), Forwarding::Unset);
        assert_eq!(Forwarding::parse("enabled").unwrap(), Forwarding::Enabled);
        assert_eq!(Forwarding::parse("disabled").unwrap(), Forwarding::Disabled);
        assert!(matches!(
            Forwarding::parse("maybe"),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_check_before_use_needs_dead_interval() {
        let mut config = RouterConfig {
            check_routers_before_use: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.dead_router_check_interval = 30;
        assert!(config.validate().is_ok());
        assert!(config.peers_start_down());
    }

    #[test]
    fn test_check_interval_clamps_negative() {
        let config = RouterConfig {
            live_router_check_interval: 60,
            dead_router_check_interval: -5,
            ..Default::default()
        };
        assert_eq!(config.check_interval(true), Duration::from_secs(60));
        assert_eq!(config.check_interval(false), Duration::ZERO);
        assert_eq!(config.ni_status_timeout(), Duration::from_secs(110));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[router]\nforwarding = \"enabled\"\nlive_router_check_interval = 60\n\n[rpc]\nrpc_timeout_ms = 500"
        )
        .unwrap();

        let config = LnetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.router.forwarding, Forwarding::Enabled);
        assert_eq!(config.router.live_router_check_interval, 60);
        assert_eq!(config.router.small_router_buffers, 8192);
        assert_eq!(config.rpc.rpc_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_from_json_file_rejects_bad_forwarding() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, "{{\"router\": {{\"forwarding\": \"sometimes\"}}}}").unwrap();
        assert!(LnetConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_unknown_extension() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(LnetConfig::from_file(file.path()).is_err());
    }
}
