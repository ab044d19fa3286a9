//! Unsigned stand-in statements for exercising the DCR endpoint without SPIRE.
//!
//! The result always has the JWT shape, but the signature segment is a fixed
//! marker, so a server that verifies signatures must reject it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL, Engine};
use serde_json::json;
use std::time::Duration;

use super::id::WorkloadIdentity;
use super::validation::{Credential, FormatError};

const MOCK_SIGNATURE: &[u8] = b"mock-signature-not-valid";

/// Build an unsigned JWT-SVID for `identity`.
pub fn mock_statement(
    identity: &WorkloadIdentity,
    audience: &str,
    jwks_url: &str,
    ttl: Duration,
) -> Result<Credential, FormatError> {
    let now = chrono::Utc::now().timestamp();
    let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

    let header = json!({ "alg": "none", "typ": "JWT", "kid": "mock" });
    let claims = json!({
        "iss": format!("spiffe://{}", identity.trust_domain()),
        "sub": identity.id(),
        "aud": [audience],
        "iat": now,
        "exp": now.saturating_add(ttl),
        "jwks_url": jwks_url,
    });

    let token = format!(
        "{}.{}.{}",
        BASE64_URL.encode(header.to_string()),
        BASE64_URL.encode(claims.to_string()),
        BASE64_URL.encode(MOCK_SIGNATURE),
    );

    Credential::parse(token)
}
