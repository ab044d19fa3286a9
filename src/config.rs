//! Configuration types for the DCR flow validator.
//!
//! Values come from an optional JSON file and are then overridden by
//! command-line flags or their environment variables (see `main.rs`). The
//! resulting [`FlowConfig`] is built once and only read afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::dcr;
use crate::spiffe::{IdentityError, WorkloadIdentity};

/// Errors raised while loading or checking configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {field} '{value}': {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid workload identity: {0}")]
    Identity(#[from] IdentityError),
}

/// Complete configuration for one run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct FlowConfig {
    /// Authorization server (Keycloak) settings.
    #[serde(default)]
    pub auth_server: AuthServerConfig,

    /// Workload identity settings.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// SPIRE containers and binaries.
    #[serde(default)]
    pub spire: SpireConfig,

    /// JWT-SVID fetch retry policy.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Statement source and registration toggles.
    #[serde(default)]
    pub mode: ModeConfig,
}

impl FlowConfig {
    /// Load configuration from a JSON file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check URLs and build the workload identity.
    pub fn validate(&self) -> Result<WorkloadIdentity, ConfigError> {
        check_url("auth server URL", &self.auth_server.base_url)?;
        check_url("JWKS URL", &self.auth_server.jwks_url)?;

        Ok(WorkloadIdentity::new(
            self.identity.trust_domain.clone(),
            self.identity.workload_id.clone(),
            self.identity.parent_id.clone(),
        )?)
    }

    /// Audience of the JWT-SVID; the realm URL unless configured.
    pub fn audience(&self) -> String {
        self.auth_server
            .audience
            .clone()
            .unwrap_or_else(|| dcr::realm_url(&self.auth_server.base_url, &self.auth_server.realm))
    }

    pub fn registration_endpoint(&self) -> String {
        dcr::registration_endpoint(&self.auth_server.base_url, &self.auth_server.realm)
    }

    pub fn svid_ttl(&self) -> Duration {
        Duration::from_secs(self.identity.ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch.retry_delay_ms)
    }
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    Url::parse(value)
        .map(|_| ())
        .map_err(|source| ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
            source,
        })
}

/// Authorization server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthServerConfig {
    /// Base URL of the Keycloak server.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Realm hosting the spiffe-dcr provider.
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Display name of the client to register.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// JWKS endpoint serving the SPIRE JWT signing keys.
    #[serde(default = "default_jwks_url")]
    pub jwks_url: String,

    /// JWT-SVID audience override.
    #[serde(default)]
    pub audience: Option<String>,
}

impl Default for AuthServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            realm: default_realm(),
            client_name: default_client_name(),
            jwks_url: default_jwks_url(),
            audience: None,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_realm() -> String {
    "spiffe".to_string()
}

fn default_client_name() -> String {
    "spiffe-dcr-client".to_string()
}

fn default_jwks_url() -> String {
    "http://localhost:8443/keys".to_string()
}

/// Workload identity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdentityConfig {
    #[serde(default = "default_trust_domain")]
    pub trust_domain: String,

    /// SPIFFE ID of the workload.
    #[serde(default = "default_workload_id")]
    pub workload_id: String,

    /// SPIFFE ID of the agent the entry is parented to.
    #[serde(default = "default_parent_id")]
    pub parent_id: String,

    /// JWT-SVID TTL in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Selector attesting the workload process.
    #[serde(default = "default_selector")]
    pub selector: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trust_domain: default_trust_domain(),
            workload_id: default_workload_id(),
            parent_id: default_parent_id(),
            ttl_secs: default_ttl_secs(),
            selector: default_selector(),
        }
    }
}

fn default_trust_domain() -> String {
    "example.org".to_string()
}

fn default_workload_id() -> String {
    "spiffe://example.org/workload/dcr-client".to_string()
}

fn default_parent_id() -> String {
    "spiffe://example.org/spire/agent/docker".to_string()
}

fn default_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_selector() -> String {
    "unix:uid:0".to_string()
}

/// SPIRE container settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpireConfig {
    /// Name (or name fragment) of the SPIRE server container.
    #[serde(default = "default_server_container")]
    pub server_container: String,

    /// Name (or name fragment) of the SPIRE agent container.
    #[serde(default = "default_agent_container")]
    pub agent_container: String,

    #[serde(default = "default_server_binary")]
    pub server_binary: String,

    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,

    /// Workload API socket inside the agent container.
    #[serde(default = "default_agent_socket")]
    pub agent_socket: String,
}

impl Default for SpireConfig {
    fn default() -> Self {
        Self {
            server_container: default_server_container(),
            agent_container: default_agent_container(),
            server_binary: default_server_binary(),
            agent_binary: default_agent_binary(),
            agent_socket: default_agent_socket(),
        }
    }
}

fn default_server_container() -> String {
    "spire-server".to_string()
}

fn default_agent_container() -> String {
    "spire-agent".to_string()
}

fn default_server_binary() -> String {
    "/opt/spire/bin/spire-server".to_string()
}

fn default_agent_binary() -> String {
    "/opt/spire/bin/spire-agent".to_string()
}

fn default_agent_socket() -> String {
    "/run/spire/sockets/agent.sock".to_string()
}

/// JWT-SVID fetch retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FetchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    2000 // 2 seconds
}

/// Where the statement comes from and whether to register the workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModeConfig {
    /// Caller-supplied software statement, used verbatim.
    #[serde(default)]
    pub statement: Option<String>,

    /// Submit an unsigned mock statement instead of a real JWT-SVID.
    #[serde(default)]
    pub mock: bool,

    /// Create the SPIRE registration entry if missing.
    #[serde(default = "default_true")]
    pub auto_register: bool,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            statement: None,
            mock: false,
            auto_register: true,
        }
    }
}

fn default_true() -> bool {
    true
}
