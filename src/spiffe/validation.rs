//! Structural validation of JWT-SVIDs used as software statements.
//!
//! Only the shape of the token is checked here. Signature verification is the
//! authorization server's job.

use base64::{engine::general_purpose::URL_SAFE as BASE64_URL, Engine};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::trace;

/// `header.payload.signature`, each segment base64url without padding.
static JWT_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+$").expect("static JWT pattern")
});

/// A credential that does not have the three-segment JWT shape.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("credential is empty")]
    Empty,

    #[error("credential has {0} segments, expected 3 (header.payload.signature)")]
    SegmentCount(usize),

    #[error("credential segment {0} is empty or not base64url")]
    InvalidSegment(usize),
}

/// Check that a string looks like a JWT: three non-empty base64url segments.
pub fn validate_structure(credential: &str) -> Result<(), FormatError> {
    if JWT_SHAPE.is_match(credential) {
        return Ok(());
    }

    if credential.is_empty() {
        return Err(FormatError::Empty);
    }

    let segments: Vec<&str> = credential.split('.').collect();
    if segments.len() != 3 {
        return Err(FormatError::SegmentCount(segments.len()));
    }

    let bad = segments
        .iter()
        .position(|s| s.is_empty() || !s.bytes().all(is_base64url_byte))
        .unwrap_or(0);
    Err(FormatError::InvalidSegment(bad + 1))
}

/// Returns true if the string has the JWT shape.
pub fn looks_like_jwt(candidate: &str) -> bool {
    JWT_SHAPE.is_match(candidate)
}

fn is_base64url_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

/// A JWT-SVID that passed [`validate_structure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Validate and wrap a credential string.
    pub fn parse(raw: impl Into<String>) -> Result<Self, FormatError> {
        let raw = raw.into();
        validate_structure(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// A decoded JWT segment, best effort.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplaySegment {
    /// Segment decoded to JSON.
    Json(Value),
    /// Segment decoded, but the bytes are not JSON.
    Text(String),
    /// Segment could not be decoded; the undecoded text is kept.
    Raw(String),
}

impl fmt::Display for DisplaySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplaySegment::Json(value) => match serde_json::to_string_pretty(value) {
                Ok(pretty) => f.write_str(&pretty),
                Err(_) => write!(f, "{}", value),
            },
            DisplaySegment::Text(text) | DisplaySegment::Raw(text) => f.write_str(text),
        }
    }
}

/// Header and claims of a statement, decoded for operators.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedStatement {
    pub header: DisplaySegment,
    pub claims: DisplaySegment,
}

/// Decode the header and claims of a token for display.
///
/// Never fails: segments that cannot be decoded come back as
/// [`DisplaySegment::Raw`].
pub fn decode_for_display(credential: &str) -> DecodedStatement {
    let mut segments = credential.split('.');
    let header = decode_segment(segments.next().unwrap_or_default());
    let claims = decode_segment(segments.next().unwrap_or_default());
    DecodedStatement { header, claims }
}

fn decode_segment(segment: &str) -> DisplaySegment {
    if segment.is_empty() {
        return DisplaySegment::Raw(String::new());
    }

    let padding = (4 - segment.len() % 4) % 4;
    let padded = format!("{}{}", segment, "=".repeat(padding));

    let bytes = match BASE64_URL.decode(padded.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            trace!(error = %e, "Segment is not base64url, showing raw text");
            return DisplaySegment::Raw(segment.to_string());
        }
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => DisplaySegment::Json(value),
        Err(_) => DisplaySegment::Text(String::from_utf8_lossy(&bytes).into_owned()),
    }
}
