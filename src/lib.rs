//! ECH Gateway - tunnels Encrypted Client Hello connections and serves DoH
//!
//! Every inbound TLS connection is offered to ECH first. Connections whose
//! ECH payload decrypts are tunneled to the concealed server name; the rest
//! are terminated under the gateway's own certificate and served over
//! HTTP/1.1 or HTTP/2, where a DNS-over-HTTPS endpoint publishes the
//! gateway's addresses and ECH configuration.

pub mod cert;
pub mod doh;
pub mod ech;
pub mod error;
pub mod gateway;
pub mod hello;
pub mod listener;
pub mod mux;
pub mod pipe;
pub mod server;
pub mod tls_crypto;
pub mod tunnel;

use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub use error::{GatewayError, Result};
pub use gateway::EchGateway;
pub use server::DualProtocolServer;

/// Gateway configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind (default: 0.0.0.0)
    pub bind_addr: String,
    /// Port to bind (default: 443)
    pub bind_port: u16,
    /// Hostname the TLS certificate is served for
    pub hostname: String,
    /// ECH public name; clients without ECH must use it as SNI
    pub public_name: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Address published in A answers and HTTPS hints
    pub ipv4: Ipv4Addr,
    /// Address published in AAAA answers and HTTPS hints
    pub ipv6: Ipv6Addr,
    pub ech_config_id: u8,
    /// ECH negotiation timeout in seconds
    pub negotiation_timeout_secs: u64,
    /// Port dialed on the revealed server name
    pub upstream_port: u16,
    /// Upstream connect timeout in seconds
    pub dial_timeout_secs: u64,
    pub doh_path: String,
    /// Extra TLS-only listener for the DoH endpoint, e.g. 127.0.0.1:8443
    pub doh_listen: Option<String>,
    /// Write the base64 ECHConfigList here at startup
    pub ech_config_out: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 443,
            hostname: String::new(),
            public_name: String::new(),
            cert_path: PathBuf::from("certs/server.crt"),
            key_path: PathBuf::from("certs/server.key"),
            ipv4: Ipv4Addr::LOCALHOST,
            ipv6: Ipv6Addr::LOCALHOST,
            ech_config_id: 114,
            negotiation_timeout_secs: 5,
            upstream_port: 443,
            dial_timeout_secs: 10,
            doh_path: "/dns-query".to_string(),
            doh_listen: None,
            ech_config_out: None,
        }
    }
}

impl GatewayConfig {
    /// Load from a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&text)
            .map_err(|e| GatewayError::Config(format!("Invalid {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(GatewayError::Config("hostname is required".to_string()));
        }
        if self.public_name.is_empty() {
            return Err(GatewayError::Config("public_name is required".to_string()));
        }
        if self.negotiation_timeout_secs == 0 || self.dial_timeout_secs == 0 {
            return Err(GatewayError::Config("timeouts must be positive".to_string()));
        }
        if !self.doh_path.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "doh_path {:?} must start with '/'",
                self.doh_path
            )));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> GatewayConfig {
        GatewayConfig {
            hostname: "doh.example".to_string(),
            public_name: "doh.example".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:443");
        assert_eq!(config.ech_config_id, 114);
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(5));
        assert_eq!(config.doh_path, "/dns-query");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            hostname = "doh.example"
            public_name = "cover.example"
            bind_port = 8443
            ipv4 = "192.0.2.1"
            ipv6 = "2001:db8::1"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_address(), "0.0.0.0:8443");
        assert_eq!(config.public_name, "cover.example");
        assert_eq!(config.ipv4, Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(config.upstream_port, 443);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(GatewayConfig::default().validate().is_err());

        let mut config = valid();
        config.public_name.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.negotiation_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.doh_path = "dns-query".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = GatewayConfig::load(Path::new("/nonexistent/gateway.toml"));
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
