//! Tunnels file support
//!
//! Lets one process run several tunnels described in a YAML file:
//!
//! ```yaml
//! defaults:
//!   cert: /etc/tcp-tunnel/server.crt
//!   connect_timeout_seconds: 10
//!
//! tunnels:
//!   - name: postgres
//!     local: "127.0.0.1:5433"
//!     remote: "db.internal:5432"
//!     tls: true
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tcp_tunnel_relay::{TlsVersion, TunnelConfig};

/// Default file name used by `up`
pub const DEFAULT_CONFIG_FILE: &str = "tunnels.yml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectConfig {
    /// Settings applied to every tunnel unless overridden
    #[serde(default)]
    pub defaults: ProjectDefaults,

    #[serde(default)]
    pub tunnels: Vec<ProjectTunnel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectDefaults {
    /// Enable TLS on both legs
    #[serde(default)]
    pub tls: bool,

    /// Skip verification of the remote's certificate (INSECURE)
    #[serde(default)]
    pub insecure: bool,

    /// Combined certificate + key PEM (supports ${ENV_VAR} expansion)
    pub cert: Option<String>,

    /// Extra CA bundle trusted for the remote
    pub ca_cert: Option<String>,

    /// "1.2" or "1.3"
    pub min_tls_version: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_handshake_timeout() -> u64 {
    30
}

impl Default for ProjectDefaults {
    fn default() -> Self {
        Self {
            tls: false,
            insecure: false,
            cert: None,
            ca_cert: None,
            min_tls_version: None,
            connect_timeout_seconds: default_connect_timeout(),
            handshake_timeout_seconds: default_handshake_timeout(),
        }
    }
}

/// One tunnel entry
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectTunnel {
    /// Unique name, used in logs
    pub name: String,

    /// Address to listen on
    pub local: String,

    /// Address to relay to
    pub remote: String,

    pub tls: Option<bool>,

    pub insecure: Option<bool>,

    pub cert: Option<String>,

    pub ca_cert: Option<String>,

    /// Whether the tunnel is started by `up` (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: ProjectConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for tunnel in &self.tunnels {
            if !names.insert(&tunnel.name) {
                anyhow::bail!("Duplicate tunnel name: {}", tunnel.name);
            }

            if !is_valid_tunnel_name(&tunnel.name) {
                anyhow::bail!(
                    "Invalid tunnel name '{}': must be alphanumeric with hyphens/underscores only",
                    tunnel.name
                );
            }

            if tunnel.local.trim().is_empty() || tunnel.remote.trim().is_empty() {
                anyhow::bail!(
                    "Tunnel '{}' needs both a local and a remote address",
                    tunnel.name
                );
            }
        }

        if let Some(version) = &self.defaults.min_tls_version {
            version
                .parse::<TlsVersion>()
                .context("Invalid min_tls_version in defaults")?;
        }

        Ok(())
    }

    pub fn enabled_tunnels(&self) -> Vec<&ProjectTunnel> {
        self.tunnels.iter().filter(|t| t.enabled).collect()
    }

    /// Starter file written by `up --init`
    pub fn template() -> String {
        r#"# tcp-tunnel configuration

defaults:
  # cert: "server.crt"
  # ca_cert: "${TCP_TUNNEL_CA_CERT}"
  # min_tls_version: "1.2"
  connect_timeout_seconds: 60
  handshake_timeout_seconds: 30

tunnels:
  - name: web
    local: "127.0.0.1:8080"
    remote: "example.com:80"

  # - name: postgres
  #   local: "127.0.0.1:5433"
  #   remote: "db.internal:5432"
  #   tls: true

  # - name: staging
  #   local: ":9443"
  #   remote: "staging.internal:443"
  #   tls: true
  #   insecure: true
  #   enabled: false
"#
        .to_string()
    }
}

impl ProjectTunnel {
    /// Build the runtime configuration, filling gaps from `defaults`
    pub fn to_tunnel_config(&self, defaults: &ProjectDefaults) -> Result<TunnelConfig> {
        let mut config = TunnelConfig::new(
            self.name.clone(),
            expand_env_vars(&self.local),
            expand_env_vars(&self.remote),
        )
        .with_connect_timeout(Duration::from_secs(defaults.connect_timeout_seconds))
        .with_handshake_timeout(Duration::from_secs(defaults.handshake_timeout_seconds));

        config.tls = self.tls.unwrap_or(defaults.tls);
        config.insecure_skip_verify = self.insecure.unwrap_or(defaults.insecure);

        if let Some(cert) = self.cert.as_ref().or(defaults.cert.as_ref()) {
            config.cert_path = PathBuf::from(expand_env_vars(cert));
        }

        if let Some(ca) = self.ca_cert.as_ref().or(defaults.ca_cert.as_ref()) {
            let ca = expand_env_vars(ca);
            if !ca.is_empty() {
                config = config.with_ca_cert(ca);
            }
        }

        if let Some(version) = &defaults.min_tls_version {
            let version = version
                .parse::<TlsVersion>()
                .with_context(|| format!("Invalid min_tls_version for tunnel '{}'", self.name))?;
            config = config.with_min_tls_version(version);
        }

        Ok(config)
    }
}

fn is_valid_tunnel_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// Expand `${VAR}` references; unset variables expand to an empty string
pub fn expand_env_vars(input: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };

    re.replace_all(input, |caps: &regex_lite::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
