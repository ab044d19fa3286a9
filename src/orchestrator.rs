//! The end-to-end flow as a sequence of gated stages.
//!
//! `PreflightCheck -> [RegisterIdentity] -> AcquireStatement ->
//! ValidateStructure -> SubmitRegistration`. The first failing stage ends the
//! run; nothing after it is attempted and nothing is retried at this level.

use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::FlowConfig;
use crate::dcr::{DcrClient, HttpClient, RegistrationResult, RequestError};
use crate::environment::{ensure_containers_running, ContainerRuntime, EnvironmentError};
use crate::spiffe::{
    decode_for_display, ensure_registered, mock_statement, Credential, CredentialFetcher,
    FetchError, FormatError, IdentityAgent, IdentityDirectory, RegistrationError,
    WorkloadIdentity,
};

/// Stages of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PreflightCheck,
    RegisterIdentity,
    AcquireStatement,
    ValidateStructure,
    SubmitRegistration,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::PreflightCheck => write!(f, "preflight_check"),
            Stage::RegisterIdentity => write!(f, "register_identity"),
            Stage::AcquireStatement => write!(f, "acquire_statement"),
            Stage::ValidateStructure => write!(f, "validate_structure"),
            Stage::SubmitRegistration => write!(f, "submit_registration"),
        }
    }
}

/// Where the software statement comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementSource {
    /// Caller-supplied statement, used verbatim.
    Supplied(String),
    /// JWT-SVID fetched from the SPIRE agent.
    Agent,
    /// Unsigned mock statement.
    Mock,
}

impl StatementSource {
    /// A supplied statement wins over mock mode.
    pub fn from_config(config: &FlowConfig) -> Self {
        match (&config.mode.statement, config.mode.mock) {
            (Some(statement), _) => StatementSource::Supplied(statement.clone()),
            (None, true) => StatementSource::Mock,
            (None, false) => StatementSource::Agent,
        }
    }
}

/// The stage-level failure that ended a run.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("environment check failed: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("identity registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("credential acquisition failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("malformed software statement: {0}")]
    Format(#[from] FormatError),

    #[error("client registration failed: {0}")]
    Request(#[from] RequestError),
}

/// External systems the flow talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub directory: &'a dyn IdentityDirectory,
    pub agent: &'a dyn IdentityAgent,
    pub http: &'a dyn HttpClient,
}

/// Stages entered and the terminal outcome of a run.
#[derive(Debug)]
pub struct RunReport {
    pub stages: Vec<Stage>,
    pub outcome: Result<RegistrationResult, FlowError>,
}

impl RunReport {
    /// The stage that failed, if any.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self.outcome {
            Ok(_) => None,
            Err(_) => self.stages.last().copied(),
        }
    }

    /// 0 on success, 1 on any failure.
    pub fn exit_code(&self) -> u8 {
        if self.outcome.is_ok() {
            0
        } else {
            1
        }
    }
}

/// Drives one run of the flow.
pub struct Orchestrator<'a> {
    config: &'a FlowConfig,
    identity: &'a WorkloadIdentity,
    collaborators: Collaborators<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a FlowConfig,
        identity: &'a WorkloadIdentity,
        collaborators: Collaborators<'a>,
    ) -> Self {
        Self {
            config,
            identity,
            collaborators,
        }
    }

    /// Run every stage until one fails or the registration completes.
    pub async fn run(&self) -> RunReport {
        let mut stages = Vec::with_capacity(5);
        let outcome = self.drive(&mut stages).await;
        let report = RunReport { stages, outcome };

        match (&report.outcome, report.failed_stage()) {
            (Ok(result), _) => info!(
                status = result.http_status,
                stages = report.stages.len(),
                "DCR flow completed"
            ),
            (Err(e), stage) => error!(
                stage = %stage.map(|s| s.to_string()).unwrap_or_default(),
                error = %e,
                "DCR flow failed"
            ),
        }

        report
    }

    async fn drive(&self, stages: &mut Vec<Stage>) -> Result<RegistrationResult, FlowError> {
        let source = StatementSource::from_config(self.config);

        stages.push(Stage::PreflightCheck);
        self.preflight(&source).await?;

        if self.should_register(&source) {
            stages.push(Stage::RegisterIdentity);
            self.register_identity().await?;
        } else {
            debug!("Skipping identity registration");
        }

        stages.push(Stage::AcquireStatement);
        let raw = self.acquire_statement(source).await?;

        stages.push(Stage::ValidateStructure);
        let statement = self.validate_statement(raw)?;

        stages.push(Stage::SubmitRegistration);
        let result = DcrClient::new(self.collaborators.http)
            .register(
                statement,
                &self.config.auth_server.client_name,
                &self.config.registration_endpoint(),
            )
            .await?
            .into_accepted()?;

        Ok(result)
    }

    fn should_register(&self, source: &StatementSource) -> bool {
        matches!(source, StatementSource::Agent) && self.config.mode.auto_register
    }

    async fn preflight(&self, source: &StatementSource) -> Result<(), EnvironmentError> {
        let auth = &self.config.auth_server;

        DcrClient::new(self.collaborators.http)
            .probe_realm(&auth.base_url, &auth.realm)
            .await
            .map_err(|e| EnvironmentError::AuthServerUnreachable {
                url: crate::dcr::realm_url(&auth.base_url, &auth.realm),
                reason: e.to_string(),
            })?;
        info!(base_url = %auth.base_url, realm = %auth.realm, "Authorization server is reachable");

        match self.collaborators.http.get(&auth.jwks_url).await {
            Ok(response) if (200..300).contains(&response.status) => {
                debug!(jwks_url = %auth.jwks_url, "JWKS endpoint is reachable");
            }
            Ok(response) => {
                warn!(jwks_url = %auth.jwks_url, status = response.status, "JWKS endpoint returned an error");
            }
            Err(e) => {
                warn!(jwks_url = %auth.jwks_url, error = %e, "JWKS endpoint is unreachable");
            }
        }

        if matches!(source, StatementSource::Agent) {
            self.collaborators.runtime.check_tool("docker").await?;
        }

        Ok(())
    }

    async fn register_identity(&self) -> Result<(), FlowError> {
        let spire = &self.config.spire;
        ensure_containers_running(
            self.collaborators.runtime,
            &[spire.server_container.as_str(), spire.agent_container.as_str()],
        )
        .await?;

        ensure_registered(
            self.collaborators.directory,
            self.identity,
            self.config.svid_ttl(),
            &self.config.identity.selector,
        )
        .await?;

        Ok(())
    }

    async fn acquire_statement(&self, source: StatementSource) -> Result<String, FlowError> {
        match source {
            StatementSource::Supplied(statement) => {
                info!("Using caller-supplied software statement");
                Ok(statement)
            }
            StatementSource::Mock => {
                warn!("Using unsigned mock statement; signature checks will reject it");
                let statement = mock_statement(
                    self.identity,
                    &self.config.audience(),
                    &self.config.auth_server.jwks_url,
                    self.config.svid_ttl(),
                )?;
                Ok(statement.into_inner())
            }
            StatementSource::Agent => {
                let fetched = CredentialFetcher::new(self.collaborators.agent)
                    .max_attempts(self.config.fetch.max_attempts)
                    .retry_delay(self.config.retry_delay())
                    .fetch(self.identity, &self.config.audience())
                    .await;

                match fetched {
                    Ok(credential) => Ok(credential.into_inner()),
                    Err(e) => {
                        for hint in e.guidance() {
                            warn!(hint = %hint, "Possible cause");
                        }
                        Err(e.into())
                    }
                }
            }
        }
    }

    fn validate_statement(&self, raw: String) -> Result<Credential, FormatError> {
        let statement = Credential::parse(raw)?;

        let decoded = decode_for_display(statement.as_str());
        info!(
            header = %decoded.header,
            claims = %decoded.claims,
            "Software statement is well-formed"
        );

        Ok(statement)
    }
}
