//! SPIFFE DCR Flow Validator
//!
//! Checks that a workload can register itself as an OAuth client by
//! presenting its SPIFFE JWT-SVID as a software statement to Keycloak's
//! `spiffe-dcr` Dynamic Client Registration endpoint.
//!
//! # Flow
//!
//! 1. Preflight: the realm is reachable and `docker` is available
//! 2. Register the workload with the SPIRE server (unless skipped)
//! 3. Fetch a JWT-SVID from the SPIRE agent, retrying while the entry propagates
//! 4. Check the statement is a well-formed JWT
//! 5. Submit the registration request
//!
//! # Usage
//!
//! ```bash
//! spiffe-dcr-validator --keycloak-url http://localhost:8080 --realm spiffe
//! spiffe-dcr-validator --statement "$(cat svid.jwt)"
//! spiffe-dcr-validator --mock
//! ```

mod config;
mod dcr;
mod environment;
mod orchestrator;
mod spiffe;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use config::FlowConfig;
use dcr::ReqwestClient;
use environment::{DockerRuntime, ProcessRunner};
use orchestrator::{Collaborators, Orchestrator};
use spiffe::{SpireAgentCli, SpireServerCli};

/// Command line arguments. Flags override their environment variable, which
/// overrides the config file.
#[derive(Parser, Debug, Default)]
#[command(name = "spiffe-dcr-validator")]
#[command(about = "Validate the SPIFFE JWT-SVID to OAuth Dynamic Client Registration flow")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "DCR_CONFIG")]
    config: Option<PathBuf>,

    /// Keycloak base URL
    #[arg(long, env = "KEYCLOAK_URL")]
    keycloak_url: Option<String>,

    /// Keycloak realm
    #[arg(long, env = "KEYCLOAK_REALM")]
    realm: Option<String>,

    /// SPIFFE trust domain
    #[arg(long, env = "SPIFFE_TRUST_DOMAIN")]
    trust_domain: Option<String>,

    /// SPIFFE ID of the workload
    #[arg(long, env = "SPIFFE_WORKLOAD_ID")]
    workload_id: Option<String>,

    /// SPIFFE ID of the parent agent
    #[arg(long, env = "SPIFFE_PARENT_ID")]
    parent_id: Option<String>,

    /// Display name of the OAuth client
    #[arg(long, env = "DCR_CLIENT_NAME")]
    client_name: Option<String>,

    /// JWKS URL serving the SPIRE signing keys
    #[arg(long, env = "SPIFFE_JWKS_URL")]
    jwks_url: Option<String>,

    /// JWT-SVID audience (defaults to the realm URL)
    #[arg(long, env = "DCR_AUDIENCE")]
    audience: Option<String>,

    /// JWT-SVID TTL in seconds
    #[arg(long, env = "SVID_TTL")]
    ttl: Option<u64>,

    /// Software statement to submit instead of fetching one
    #[arg(long, env = "DCR_SOFTWARE_STATEMENT")]
    statement: Option<String>,

    /// Submit an unsigned mock statement
    #[arg(long, env = "DCR_MOCK", num_args = 0..=1, default_missing_value = "true")]
    mock: Option<bool>,

    /// Create the SPIRE registration entry when it is missing
    #[arg(long, env = "DCR_AUTO_REGISTER", num_args = 0..=1, default_missing_value = "true")]
    auto_register: Option<bool>,

    /// Maximum JWT-SVID fetch attempts
    #[arg(long, env = "DCR_FETCH_ATTEMPTS")]
    fetch_attempts: Option<u32>,

    /// Delay between fetch attempts in milliseconds
    #[arg(long, env = "DCR_FETCH_DELAY_MS")]
    fetch_delay_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, env = "DCR_VERBOSE")]
    verbose: bool,
}

impl Args {
    /// Build the run configuration: file (or defaults), then these overrides.
    fn into_config(self) -> Result<FlowConfig> {
        let mut config = match &self.config {
            Some(path) => FlowConfig::from_file(path)?,
            None => FlowConfig::default(),
        };

        let auth = &mut config.auth_server;
        override_with(&mut auth.base_url, self.keycloak_url);
        override_with(&mut auth.realm, self.realm);
        override_with(&mut auth.client_name, self.client_name);
        override_with(&mut auth.jwks_url, self.jwks_url);
        if self.audience.is_some() {
            auth.audience = self.audience;
        }

        let identity = &mut config.identity;
        override_with(&mut identity.trust_domain, self.trust_domain);
        override_with(&mut identity.workload_id, self.workload_id);
        override_with(&mut identity.parent_id, self.parent_id);
        override_with(&mut identity.ttl_secs, self.ttl);

        override_with(&mut config.fetch.max_attempts, self.fetch_attempts);
        override_with(&mut config.fetch.retry_delay_ms, self.fetch_delay_ms);

        if self.statement.is_some() {
            config.mode.statement = self.statement;
        }
        override_with(&mut config.mode.mock, self.mock);
        override_with(&mut config.mode.auto_register, self.auto_register);

        Ok(config)
    }
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    info!("Starting SPIFFE DCR flow validator");

    let config = args.into_config()?;
    let identity = config.validate().context("Invalid configuration")?;

    info!(
        keycloak_url = %config.auth_server.base_url,
        realm = %config.auth_server.realm,
        spiffe_id = %identity.id(),
        audience = %config.audience(),
        mock = config.mode.mock,
        auto_register = config.mode.auto_register,
        "Configuration loaded"
    );

    let runtime = DockerRuntime::new(ProcessRunner);
    let directory = SpireServerCli::new(
        ProcessRunner,
        &config.spire.server_container,
        &config.spire.server_binary,
    );
    let agent = SpireAgentCli::new(
        ProcessRunner,
        &config.spire.agent_container,
        &config.spire.agent_binary,
        &config.spire.agent_socket,
    );
    let http = ReqwestClient::new();

    let collaborators = Collaborators {
        runtime: &runtime,
        directory: &directory,
        agent: &agent,
        http: &http,
    };

    let report = Orchestrator::new(&config, &identity, collaborators)
        .run()
        .await;

    if let Ok(result) = &report.outcome {
        info!(
            status = result.http_status,
            client_id = result.client_id().as_deref().unwrap_or("unknown"),
            body = %result.body,
            "Client registered"
        );
    }

    Ok(report.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "spiffe-dcr-validator",
            "--keycloak-url",
            "https://kc.example",
            "--realm",
            "test",
            "--ttl",
            "60",
            "--auto-register",
            "false",
            "--fetch-attempts",
            "5",
        ]);

        let config = args.into_config().unwrap();
        assert_eq!(config.auth_server.base_url, "https://kc.example");
        assert_eq!(config.auth_server.realm, "test");
        assert_eq!(config.identity.ttl_secs, 60);
        assert_eq!(config.fetch.max_attempts, 5);
        assert!(!config.mode.auto_register);
        assert_eq!(config.audience(), "https://kc.example/realms/test");
    }

    #[test]
    fn test_unset_flags_keep_defaults() {
        let config = Args::default().into_config().unwrap();
        assert_eq!(config.auth_server.base_url, "http://localhost:8080");
        assert!(config.mode.auto_register);
        assert!(!config.mode.mock);
    }

    #[test]
    fn test_flags_override_config_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"auth-server": {{"realm": "file-realm", "client-name": "file-client"}}, "mode": {{"mock": true}}}}"#
        )
        .unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            realm: Some("flag-realm".into()),
            statement: Some("abc.def.ghi".into()),
            ..Default::default()
        };

        let config = args.into_config().unwrap();
        assert_eq!(config.auth_server.realm, "flag-realm");
        assert_eq!(config.auth_server.client_name, "file-client");
        assert!(config.mode.mock);
        assert_eq!(config.mode.statement.as_deref(), Some("abc.def.ghi"));
    }

    fn toggles_file() -> tempfile::NamedTempFile {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"mode": {{"mock": true, "auto-register": false}}}}"#).unwrap();
        file
    }

    #[test]
    fn test_toggle_flags_override_config_file() {
        let file = toggles_file();
        let path = file.path().to_str().unwrap();

        let config = Args::parse_from([
            "spiffe-dcr-validator",
            "--config",
            path,
            "--mock",
            "false",
            "--auto-register",
        ])
        .into_config()
        .unwrap();
        assert!(!config.mode.mock);
        assert!(config.mode.auto_register);

        let config = Args::parse_from(["spiffe-dcr-validator", "--config", path])
            .into_config()
            .unwrap();
        assert!(config.mode.mock);
        assert!(!config.mode.auto_register);
    }

    #[test]
    fn test_toggle_values_override_config_file() {
        let file = toggles_file();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            mock: Some(false),
            auto_register: Some(true),
            ..Default::default()
        };

        let config = args.into_config().unwrap();
        assert!(!config.mode.mock);
        assert!(config.mode.auto_register);
    }

    #[test]
    fn test_bare_mock_flag_enables_mock() {
        let config = Args::parse_from(["spiffe-dcr-validator", "--mock"])
            .into_config()
            .unwrap();
        assert!(config.mode.mock);
    }
}
