//! SPIFFE/SPIRE integration modules.
//!
//! This module provides:
//! - SPIFFE ID parsing and the run's workload identity
//! - JWT-SVID structure validation and display decoding
//! - SPIRE server registration entries
//! - SPIRE agent JWT-SVID fetching
//! - Unsigned mock statements

mod id;
mod mock;
mod registration;
mod validation;
mod workload_api;

pub use id::{IdentityError, WorkloadIdentity};
pub use mock::mock_statement;
pub use registration::{ensure_registered, IdentityDirectory, RegistrationError, SpireServerCli};
pub use validation::{decode_for_display, Credential, FormatError};
pub use workload_api::{CredentialFetcher, FetchError, IdentityAgent, SpireAgentCli};

#[cfg(test)]
pub(crate) mod testing {
    pub use super::registration::testing::FakeDirectory;
    pub use super::workload_api::testing::FakeAgent;
}
