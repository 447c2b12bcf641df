use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_SERVER_PORT: u16 = 80;
const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_HEALTH_INTERVAL: Duration = Duration::from_secs(1);

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Service name mapping to its virtual host and backends
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
            timeout: DEFAULT_SERVER_TIMEOUT,
        }
    }
}

/// One upstream service: a virtual host bound to a set of backend URLs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub host: String,
    #[serde(default)]
    pub strategy: Strategy,
    pub servers: Vec<String>,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConn,
}

/// Health check configuration. An empty path disables probing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub path: String,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
}

impl HealthConfig {
    pub fn enabled(&self) -> bool {
        !self.path.is_empty()
    }
}

impl Config {
    /// Load and validate configuration from a YAML file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).context("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            anyhow::bail!("no services defined");
        }

        for (name, service) in &self.services {
            if service.host.is_empty() {
                anyhow::bail!("service {:?}: host is required", name);
            }

            if service.servers.is_empty() {
                anyhow::bail!("service {:?} must have at least one server", name);
            }

            for server in &service.servers {
                let url = reqwest::Url::parse(server)
                    .with_context(|| format!("service {:?}: invalid server url {:?}", name, server))?;

                if url.scheme() != "http" && url.scheme() != "https" {
                    anyhow::bail!(
                        "service {:?}: server url {:?} must use http or https",
                        name,
                        server
                    );
                }

                if url.host_str().is_none() {
                    anyhow::bail!("service {:?}: server url {:?} missing host", name, server);
                }
            }

            if service.health.enabled() && service.health.interval < MIN_HEALTH_INTERVAL {
                anyhow::bail!("service {:?}: health check interval must be >= 1s", name);
            }
        }

        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        serializer.serialize_str(&format!("{}s", secs))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        if s.ends_with("s") {
            let num: u64 = s.trim_end_matches("s").parse()?;
            Ok(Duration::from_secs(num))
        } else if s.ends_with("m") {
            let num: u64 = s.trim_end_matches("m").parse()?;
            Ok(Duration::from_secs(num * 60))
        } else if s.ends_with("h") {
            let num: u64 = s.trim_end_matches("h").parse()?;
            Ok(Duration::from_secs(num * 3600))
        } else {
            let num: u64 = s.parse()?;
            Ok(Duration::from_secs(num))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  port: 8080
  timeout: "45s"

services:
  api:
    host: API.local:9999
    strategy: least_conn
    servers:
      - "http://127.0.0.1:9001"
      - "http://127.0.0.1:9002"
    health:
      path: /health
      interval: "5s"
  web:
    host: web.local
    servers:
      - "https://10.0.0.1"
"#;

    #[test]
    fn parses_full_config() {
        let config = Config::parse(SAMPLE).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.timeout, Duration::from_secs(45));
        assert_eq!(config.services.len(), 2);

        let api = &config.services["api"];
        assert_eq!(api.strategy, Strategy::LeastConn);
        assert_eq!(api.servers.len(), 2);
        assert!(api.health.enabled());
        assert_eq!(api.health.interval, Duration::from_secs(5));
    }

    #[test]
    fn applies_defaults() {
        let config = Config::parse(
            r#"
services:
  web:
    host: web.local
    servers: ["http://127.0.0.1:9000"]
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.timeout, Duration::from_secs(30));

        let web = &config.services["web"];
        assert_eq!(web.strategy, Strategy::RoundRobin);
        assert!(!web.health.enabled());
    }

    #[test]
    fn rejects_empty_services() {
        assert!(Config::parse("services: {}").is_err());
    }

    #[test]
    fn rejects_missing_host() {
        let err = Config::parse(
            r#"
services:
  web:
    host: ""
    servers: ["http://127.0.0.1:9000"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("host is required"));
    }

    #[test]
    fn rejects_bad_server_url() {
        let result = Config::parse(
            r#"
services:
  web:
    host: web.local
    servers: ["ftp://127.0.0.1:9000"]
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_short_health_interval() {
        let err = Config::parse(
            r#"
services:
  web:
    host: web.local
    servers: ["http://127.0.0.1:9000"]
    health:
      path: /health
      interval: "0s"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("interval"));
    }

    #[test]
    fn rejects_unknown_strategy() {
        let result = Config::parse(
            r#"
services:
  web:
    host: web.local
    strategy: random
    servers: ["http://127.0.0.1:9000"]
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn parses_duration_units() {
        let config = Config::parse(
            r#"
server:
  timeout: "2m"
services:
  web:
    host: web.local
    servers: ["http://127.0.0.1:9000"]
    health:
      path: /health
      interval: "1h"
"#,
        )
        .unwrap();

        assert_eq!(config.server.timeout, Duration::from_secs(120));
        assert_eq!(
            config.services["web"].health.interval,
            Duration::from_secs(3600)
        );
    }
}
