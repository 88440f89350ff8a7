//! Configuration handling for the link node.
//!
//! Settings come from an optional YAML file, then `LINK_*` environment
//! variables, then command line flags. Durations are written the humantime
//! way (`250ms`, `5m`).

use anyhow::{Context, Result};
use link_session::LinkConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// A peer this node knows how to reach
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerEntry {
    /// Remote node id
    pub id: u64,
    /// Remote address
    pub address: SocketAddr,
}

/// Link node configuration (matches the `link` section of the YAML file)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Node ID for this link node
    pub node_id: Option<u64>,
    /// Address to accept peer connections on
    pub listen: Option<SocketAddr>,
    /// Use legacy framing instead of multiplexed packets
    pub legacy: Option<bool>,
    pub max_packet_size: Option<usize>,
    pub pad_boundary: Option<usize>,
    pub max_frame_body: Option<usize>,
    pub chunk_size: Option<usize>,
    pub max_chunk_attempts: Option<u32>,
    pub initial_credit: Option<u32>,
    pub message_ttl: Option<String>,
    pub blocking_send_cap: Option<String>,
    pub trailer_stall_timeout: Option<String>,
    pub trailer_pause_threshold: Option<usize>,
    pub trailer_resume_threshold: Option<usize>,
    pub backoff_initial: Option<String>,
    pub backoff_max: Option<String>,
    pub unreachable_after_failures: Option<u32>,
    pub maintenance_interval: Option<String>,
    pub idle_eviction: Option<String>,
    pub request_rate: Option<u32>,
    /// Peers to dial
    pub peers: Vec<PeerEntry>,
}

/// Root configuration structure
#[derive(Debug, Default, Deserialize)]
struct RootConfig {
    link: Option<NodeConfig>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing config file {}", path.display()))?;
                info!("Loaded configuration from {:?}", path);
                root.link.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `LINK_*` overrides fetched through `lookup`
    pub fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("LINK_NODE_ID") {
            self.node_id = Some(value.parse().context("LINK_NODE_ID")?);
            info!("Node ID overridden by environment: {}", value);
        }
        if let Some(value) = lookup("LINK_LISTEN") {
            self.listen = Some(value.parse().context("LINK_LISTEN")?);
            info!("Listen address overridden by environment: {}", value);
        }
        if let Some(value) = lookup("LINK_LEGACY") {
            self.legacy = Some(value.eq_ignore_ascii_case("true") || value == "1");
        }
        if let Some(value) = lookup("LINK_MESSAGE_TTL") {
            parse_duration(&value).context("LINK_MESSAGE_TTL")?;
            self.message_ttl = Some(value);
        }
        if let Some(value) = lookup("LINK_REQUEST_RATE") {
            self.request_rate = Some(value.parse().context("LINK_REQUEST_RATE")?);
        }
        Ok(())
    }

    /// Build the validated transport configuration
    pub fn to_link_config(&self) -> Result<LinkConfig> {
        let mut link = LinkConfig::default();
        if let Some(node_id) = self.node_id {
            link.node_id = node_id;
        }
        if let Some(legacy) = self.legacy {
            link.multiplexed = !legacy;
        }
        set(&mut link.max_packet_size, self.max_packet_size);
        set(&mut link.pad_boundary, self.pad_boundary);
        set(&mut link.max_frame_body, self.max_frame_body);
        set(&mut link.chunk_size, self.chunk_size);
        set(&mut link.max_chunk_attempts, self.max_chunk_attempts);
        set(&mut link.initial_credit, self.initial_credit);
        set(&mut link.trailer_pause_threshold, self.trailer_pause_threshold);
        set(&mut link.trailer_resume_threshold, self.trailer_resume_threshold);
        set(&mut link.unreachable_after_failures, self.unreachable_after_failures);
        set(&mut link.request_rate, self.request_rate);

        set_duration(&mut link.message_ttl, &self.message_ttl, "message_ttl")?;
        set_duration(&mut link.blocking_send_cap, &self.blocking_send_cap, "blocking_send_cap")?;
        set_duration(
            &mut link.trailer_stall_timeout,
            &self.trailer_stall_timeout,
            "trailer_stall_timeout",
        )?;
        set_duration(&mut link.backoff_initial, &self.backoff_initial, "backoff_initial")?;
        set_duration(&mut link.backoff_max, &self.backoff_max, "backoff_max")?;
        set_duration(
            &mut link.maintenance_interval,
            &self.maintenance_interval,
            "maintenance_interval",
        )?;
        set_duration(&mut link.idle_eviction, &self.idle_eviction, "idle_eviction")?;

        link.validate()?;
        Ok(link)
    }
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

fn set_duration(field: &mut Duration, value: &Option<String>, name: &str) -> Result<()> {
    if let Some(text) = value {
        *field = parse_duration(text).with_context(|| format!("invalid {name}"))?;
    }
    Ok(())
}

fn parse_duration(text: &str) -> Result<Duration> {
    humantime::parse_duration(text.trim()).with_context(|| format!("cannot parse duration {text:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let link = NodeConfig::default().to_link_config().unwrap();
        assert_eq!(link.node_id, 1);
        assert!(link.multiplexed);
        assert_eq!(link.message_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
link:
  node_id: 2001
  listen: 127.0.0.1:9100
  legacy: true
  chunk_size: 8192
  message_ttl: 90s
  trailer_stall_timeout: 2m
  peers:
    - id: 2002
      address: 127.0.0.1:9101
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.listen, Some("127.0.0.1:9100".parse().unwrap()));
        assert_eq!(
            config.peers,
            vec![PeerEntry {
                id: 2002,
                address: "127.0.0.1:9101".parse().unwrap()
            }]
        );

        let link = config.to_link_config().unwrap();
        assert_eq!(link.node_id, 2001);
        assert!(!link.multiplexed);
        assert_eq!(link.chunk_size, 8192);
        assert_eq!(link.message_ttl, Duration::from_secs(90));
        assert_eq!(link.trailer_stall_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = NodeConfig::load_from_file("/nonexistent/link.yaml").unwrap();
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let config = NodeConfig {
            message_ttl: Some("soon".into()),
            ..Default::default()
        };
        assert!(config.to_link_config().is_err());

        let config = NodeConfig {
            chunk_size: Some(1 << 20),
            ..Default::default()
        };
        assert!(config.to_link_config().is_err());

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"link:\n  bogus: 1\n").unwrap();
        assert!(NodeConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("LINK_NODE_ID", "77"),
            ("LINK_LEGACY", "true"),
            ("LINK_MESSAGE_TTL", "5s"),
        ]
        .into_iter()
        .collect();
        let mut config = NodeConfig::default();
        config
            .apply_environment_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        let link = config.to_link_config().unwrap();
        assert_eq!(link.node_id, 77);
        assert!(!link.multiplexed);
        assert_eq!(link.message_ttl, Duration::from_secs(5));

        let mut config = NodeConfig::default();
        assert!(config
            .apply_environment_overrides(|key| (key == "LINK_NODE_ID").then(|| "x".to_string()))
            .is_err());
    }
}
