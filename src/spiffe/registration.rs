//! Registration entries in the SPIRE server.
//!
//! A workload can only be issued a JWT-SVID once the server holds an entry
//! binding its SPIFFE ID to a parent agent. [`ensure_registered`] creates that
//! entry at most once per identity.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::id::WorkloadIdentity;
use crate::environment::CommandRunner;

/// Errors from the identity directory.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("identity directory is unreachable: {0}")]
    Unreachable(String),

    #[error("identity directory rejected entry for {spiffe_id}: {reason}")]
    Rejected { spiffe_id: String, reason: String },
}

/// Parameters of a new registration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRequest {
    pub parent_id: String,
    pub spiffe_id: String,
    pub ttl: Duration,
    pub selector: String,
}

/// Identity directory operations used by the flow.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Look up the entry for a SPIFFE ID. `Ok(None)` means no entry exists.
    async fn show_entry(&self, spiffe_id: &str) -> Result<Option<String>, RegistrationError>;

    /// Create a registration entry.
    async fn create_entry(&self, request: &EntryRequest) -> Result<(), RegistrationError>;
}

/// Make sure the directory holds an entry for `identity`.
///
/// An existing entry with the same SPIFFE ID is accepted as is; its other
/// fields are neither compared nor updated.
pub async fn ensure_registered(
    directory: &dyn IdentityDirectory,
    identity: &WorkloadIdentity,
    ttl: Duration,
    selector: &str,
) -> Result<(), RegistrationError> {
    if let Some(existing) = directory.show_entry(identity.id()).await? {
        info!(spiffe_id = %identity.id(), "Registration entry already exists");
        debug!(entry = %existing.trim(), "Existing registration entry");
        return Ok(());
    }

    let request = EntryRequest {
        parent_id: identity.parent_id().to_string(),
        spiffe_id: identity.id().to_string(),
        ttl,
        selector: selector.to_string(),
    };

    info!(
        spiffe_id = %request.spiffe_id,
        parent_id = %request.parent_id,
        ttl_secs = request.ttl.as_secs(),
        selector = %request.selector,
        "Creating registration entry"
    );

    directory.create_entry(&request).await
}

/// SPIRE server CLI, reached through `docker exec` into the server container.
pub struct SpireServerCli<R> {
    runner: R,
    container: String,
    binary: String,
}

impl<R: CommandRunner> SpireServerCli<R> {
    pub fn new(runner: R, container: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            container: container.into(),
            binary: binary.into(),
        }
    }

    fn exec_args(&self, rest: &[&str]) -> Vec<String> {
        ["exec", self.container.as_str(), self.binary.as_str()]
            .iter()
            .chain(rest)
            .map(|s| s.to_string())
            .collect()
    }
}

#[async_trait]
impl<R: CommandRunner> IdentityDirectory for SpireServerCli<R> {
    async fn show_entry(&self, spiffe_id: &str) -> Result<Option<String>, RegistrationError> {
        let args = self.exec_args(&["entry", "show", "-spiffeID", spiffe_id]);
        let output = self
            .runner
            .run("docker", &args)
            .await
            .map_err(|e| RegistrationError::Unreachable(e.to_string()))?;

        if !output.success() {
            return Err(RegistrationError::Unreachable(
                output.diagnostic().to_string(),
            ));
        }

        if lists_spiffe_id(&output.stdout, spiffe_id) {
            Ok(Some(output.stdout))
        } else {
            Ok(None)
        }
    }

    async fn create_entry(&self, request: &EntryRequest) -> Result<(), RegistrationError> {
        let ttl = request.ttl.as_secs().to_string();
        let args = self.exec_args(&[
            "entry",
            "create",
            "-parentID",
            request.parent_id.as_str(),
            "-spiffeID",
            request.spiffe_id.as_str(),
            "-selector",
            request.selector.as_str(),
            "-jwtSVIDTTL",
            ttl.as_str(),
        ]);
        let output = self
            .runner
            .run("docker", &args)
            .await
            .map_err(|e| RegistrationError::Unreachable(e.to_string()))?;

        if output.success() {
            info!(spiffe_id = %request.spiffe_id, "Registration entry created");
            return Ok(());
        }

        let reason = output.diagnostic();
        // A concurrent create leaves exactly the postcondition we want.
        if reason.contains("AlreadyExists") || reason.contains("similar entry already exists") {
            info!(spiffe_id = %request.spiffe_id, "Registration entry already exists");
            return Ok(());
        }

        Err(RegistrationError::Rejected {
            spiffe_id: request.spiffe_id.clone(),
            reason: reason.to_string(),
        })
    }
}

/// True if `entry show` output contains a `SPIFFE ID : <id>` line for `spiffe_id`.
fn lists_spiffe_id(output: &str, spiffe_id: &str) -> bool {
    output.lines().any(|line| {
        line.split_once(':').is_some_and(|(label, value)| {
            label.trim() == "SPIFFE ID" && value.trim() == spiffe_id
        })
    })
}
