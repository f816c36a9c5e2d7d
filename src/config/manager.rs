//! Configuration Manager

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};

use super::Config;
use crate::outbound::{parse_link, SelectionPolicy, LATENCY_HISTORY};
use crate::routing::{OutboundId, BLOCK_OUTBOUND, DIRECT_OUTBOUND};
use crate::Result;

/// Policy used when neither inline text nor a file is configured
pub const DEFAULT_POLICY: &str = "final: direct";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to defaults if it is missing
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from `TPROUTE_*` environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(port) = std::env::var("TPROUTE_PORT") {
            config.server.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid TPROUTE_PORT: {}", port))?;
        }

        if let Ok(timeout) = std::env::var("TPROUTE_DIAL_TIMEOUT") {
            config.server.dial_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TPROUTE_DIAL_TIMEOUT: {}", timeout))?;
        }

        if let Ok(path) = std::env::var("TPROUTE_POLICY_FILE") {
            config.routing.policy_file = Some(path.into());
        }

        if let Ok(dir) = std::env::var("TPROUTE_DATA_DIR") {
            config.routing.data_dir = dir.into();
        }

        if let Ok(links) = std::env::var("TPROUTE_BIND_LINKS") {
            config.interception.links = links
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(log_level) = std::env::var("TPROUTE_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_routing_config()
            .with_context(|| "Routing configuration validation failed")?;

        self.validate_outbounds_config()
            .with_context(|| "Outbound configuration validation failed")?;

        self.validate_interception_config()
            .with_context(|| "Interception configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("port must be greater than 0");
        }

        for (name, value) in [
            ("dial_timeout", self.server.dial_timeout),
            ("relay_timeout", self.server.relay_timeout),
            ("udp_session_timeout", self.server.udp_session_timeout),
            ("header_timeout", self.server.header_timeout),
        ] {
            if value.is_zero() {
                bail!("{} must be greater than 0", name);
            }
        }

        if self.server.relay_timeout.as_secs() > 86400 {
            bail!("relay_timeout cannot exceed 24 hours");
        }

        Ok(())
    }

    fn validate_routing_config(&self) -> Result<()> {
        if self.routing.policy.is_some() && self.routing.policy_file.is_some() {
            bail!("routing.policy and routing.policy_file are mutually exclusive");
        }

        if self.probe.interval.is_zero() {
            bail!("probe.interval must be greater than 0");
        }

        if self.probe.timeout.is_zero() {
            bail!("probe.timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_outbounds_config(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (i, outbound) in self.outbounds.iter().enumerate() {
            if outbound.name.is_empty() {
                bail!("Outbound {} has empty name", i);
            }

            if outbound.name == BLOCK_OUTBOUND {
                bail!("Outbound {} uses the reserved name '{}'", i, BLOCK_OUTBOUND);
            }

            if !names.insert(outbound.name.as_str()) {
                bail!("Outbound '{}' is declared more than once", outbound.name);
            }

            if outbound.dialers.is_empty() {
                bail!("Outbound '{}' has no dialers", outbound.name);
            }

            for link in &outbound.dialers {
                parse_link(link).with_context(|| {
                    format!("Outbound '{}' has an invalid dialer", outbound.name)
                })?;
            }

            match outbound.policy {
                SelectionPolicy::Fixed { index } if index >= outbound.dialers.len() => bail!(
                    "Outbound '{}' fixed index {} is out of range",
                    outbound.name,
                    index
                ),
                SelectionPolicy::MinAverage { window: 0 } => {
                    bail!("Outbound '{}' latency window must be at least 1", outbound.name)
                }
                SelectionPolicy::MinAverage { window } if window > LATENCY_HISTORY => bail!(
                    "Outbound '{}' latency window {} exceeds the {} retained samples",
                    outbound.name,
                    window,
                    LATENCY_HISTORY
                ),
                _ => {}
            }
        }

        let total = self.outbounds.len() + usize::from(!names.contains(DIRECT_OUTBOUND));
        if total > OutboundId::MAX_DECLARED {
            bail!(
                "{} outbounds declared, at most {} are supported",
                total,
                OutboundId::MAX_DECLARED
            );
        }

        Ok(())
    }

    fn validate_interception_config(&self) -> Result<()> {
        let mut names = HashSet::new();
        for link in &self.interception.static_links {
            if link.name.is_empty() {
                bail!("Static link with index {} has empty name", link.index);
            }
            if !names.insert(link.name.as_str()) {
                bail!("Static link '{}' is declared more than once", link.name);
            }
        }
        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Policy text from the inline value, the policy file or the default
    pub fn policy_text(&self) -> Result<String> {
        if let Some(policy) = &self.routing.policy {
            return Ok(policy.clone());
        }
        match &self.routing.policy_file {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read policy file: {}", path.display())),
            None => Ok(DEFAULT_POLICY.to_string()),
        }
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        port: Option<u16>,
        bind_links: &[String],
        log_level: Option<&str>,
    ) {
        if let Some(port) = port {
            self.server.port = port;
            tracing::info!("CLI override: port set to {}", port);
        }

        for link in bind_links {
            if !self.interception.links.contains(link) {
                self.interception.links.push(link.clone());
                tracing::info!("CLI override: binding link {}", link);
            }
        }

        if let Some(level) = log_level {
            self.monitoring.log_level = level.to_string();
            tracing::info!("CLI override: log level set to {}", level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboundConfig;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn outbound(name: &str, dialers: &[&str], policy: SelectionPolicy) -> OutboundConfig {
        OutboundConfig {
            name: name.to_string(),
            dialers: dialers.iter().map(|d| d.to_string()).collect(),
            policy,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.policy_text().unwrap(), DEFAULT_POLICY);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 7893
dial_timeout = "3s"

[routing]
policy = """
domain(geosite: cn) -> direct
final: proxy
"""

[[outbounds]]
name = "proxy"
dialers = ["socks5://127.0.0.1:1080", "http://127.0.0.1:3128"]
policy = {{ type = "min_average", window = 10 }}

[probe]
target = "8.8.8.8:443"
interval = "15s"
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 7893);
        assert_eq!(config.server.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.outbounds[0].policy, SelectionPolicy::MinAverage { window: 10 });
        assert_eq!(config.probe.interval, Duration::from_secs(15));
        assert!(config.policy_text().unwrap().contains("final: proxy"));
    }

    #[test]
    fn test_outbound_validation() {
        let cases = vec![
            outbound("", &["direct://"], SelectionPolicy::default()),
            outbound("block", &["direct://"], SelectionPolicy::default()),
            outbound("p", &[], SelectionPolicy::default()),
            outbound("p", &["gopher://x:1"], SelectionPolicy::default()),
            outbound("p", &["direct://"], SelectionPolicy::Fixed { index: 1 }),
            outbound("p", &["direct://"], SelectionPolicy::MinAverage { window: 0 }),
            outbound(
                "p",
                &["direct://"],
                SelectionPolicy::MinAverage {
                    window: LATENCY_HISTORY + 1,
                },
            ),
        ];
        for case in cases {
            let mut config = Config::default();
            config.outbounds.push(case.clone());
            assert!(config.validate().is_err(), "{:?}", case);
        }

        let mut config = Config::default();
        config.outbounds.push(outbound("p", &["direct://"], SelectionPolicy::default()));
        config.outbounds.push(outbound("p", &["direct://"], SelectionPolicy::default()));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.outbounds.push(outbound(
            "p",
            &["direct://"],
            SelectionPolicy::MinAverage {
                window: LATENCY_HISTORY,
            },
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_outbound_count_includes_builtin_direct() {
        let mut config = Config::default();
        config.outbounds = (0..254)
            .map(|i| outbound(&format!("o{}", i), &["direct://"], SelectionPolicy::default()))
            .collect();
        assert!(config.validate().is_ok());

        config
            .outbounds
            .push(outbound("o254", &["direct://"], SelectionPolicy::default()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_with_cli_args() {
        let mut config = Config::default();
        let links = ["eth0".to_string(), "eth0".to_string()];
        config.merge_with_cli_args(Some(9000), &links, Some("debug"));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.interception.links, vec!["eth0".to_string()]);
        assert_eq!(config.monitoring.log_level, "debug");
    }
}
