//! SPIFFE ID parsing and the workload identity used for one run.

use thiserror::Error;
use tracing::debug;

/// Errors raised when building a [`WorkloadIdentity`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("trust domain must not be empty")]
    EmptyTrustDomain,

    #[error("invalid SPIFFE ID '{0}': expected spiffe://<trust-domain>/<path>")]
    InvalidSpiffeId(String),

    #[error("SPIFFE ID '{id}' is not scoped under trust domain '{trust_domain}'")]
    ForeignTrustDomain { id: String, trust_domain: String },
}

/// Identity of the workload whose credential is presented for registration.
///
/// Both IDs are `spiffe://` URIs under `trust_domain`. Fields are private so
/// the type can only be obtained through [`WorkloadIdentity::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadIdentity {
    trust_domain: String,
    id: String,
    parent_id: String,
}

impl WorkloadIdentity {
    /// Create a workload identity, checking both IDs against the trust domain.
    pub fn new(
        trust_domain: impl Into<String>,
        id: impl Into<String>,
        parent_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let trust_domain = trust_domain.into();
        let id = id.into();
        let parent_id = parent_id.into();

        if trust_domain.trim().is_empty() {
            return Err(IdentityError::EmptyTrustDomain);
        }

        for spiffe_id in [&id, &parent_id] {
            let components = parse_spiffe_id(spiffe_id)
                .filter(|c| !c.trust_domain.is_empty() && c.workload_path.is_some())
                .ok_or_else(|| IdentityError::InvalidSpiffeId(spiffe_id.clone()))?;

            if components.trust_domain != trust_domain {
                return Err(IdentityError::ForeignTrustDomain {
                    id: spiffe_id.clone(),
                    trust_domain: trust_domain.clone(),
                });
            }
        }

        debug!(
            trust_domain = %trust_domain,
            spiffe_id = %id,
            parent_id = %parent_id,
            "Workload identity resolved"
        );

        Ok(Self {
            trust_domain,
            id,
            parent_id,
        })
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// The workload's SPIFFE ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// SPIFFE ID of the agent node the workload entry is parented to.
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }
}

/// Parse a SPIFFE ID into its components.
pub fn parse_spiffe_id(spiffe_id: &str) -> Option<SpiffeIdComponents<'_>> {
    let remainder = spiffe_id.strip_prefix("spiffe://")?;

    let (trust_domain, workload_path) = match remainder.find('/') {
        Some(pos) if pos + 1 < remainder.len() => (&remainder[..pos], Some(&remainder[pos..])),
        Some(pos) => (&remainder[..pos], None),
        None => (remainder, None),
    };

    Some(SpiffeIdComponents {
        trust_domain,
        workload_path,
    })
}

/// Components of a parsed SPIFFE ID.
#[derive(Debug, Clone)]
pub struct SpiffeIdComponents<'a> {
    /// The trust domain.
    pub trust_domain: &'a str,
    /// The workload path including its leading `/` (if present).
    pub workload_path: Option<&'a str>,
}
