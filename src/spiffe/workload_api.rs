//! JWT-SVID acquisition from the SPIRE agent.
//!
//! Registration entries reach the agent asynchronously, so the first fetches
//! after a fresh registration often come back empty. [`CredentialFetcher`]
//! retries with a fixed delay until a token shows up or attempts run out.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::id::WorkloadIdentity;
use super::validation::{looks_like_jwt, Credential};
use crate::environment::CommandRunner;

/// Likely causes when no JWT-SVID could be fetched. The agent output does not
/// tell them apart.
pub const EXHAUSTED_GUIDANCE: [&str; 4] = [
    "the registration entry has not propagated from the SPIRE server to the agent yet",
    "the requested SPIFFE ID does not match the registration entry",
    "the entry's parent ID does not match the agent's SPIFFE ID",
    "the SPIRE agent has lost its connection to the SPIRE server",
];

/// A single failed call to the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to invoke SPIRE agent: {0}")]
    Invocation(String),

    #[error("SPIRE agent exited with status {status:?}: {output}")]
    Failed { status: Option<i32>, output: String },
}

/// The credential could not be obtained.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no JWT-SVID for {spiffe_id} after {attempts} attempts")]
    Exhausted { spiffe_id: String, attempts: u32 },
}

impl FetchError {
    /// Operator-facing hints for the failure.
    pub fn guidance(&self) -> &'static [&'static str] {
        match self {
            FetchError::Exhausted { .. } => &EXHAUSTED_GUIDANCE,
        }
    }
}

/// Identity agent operations used by the flow.
#[async_trait]
pub trait IdentityAgent: Send + Sync {
    /// Request a JWT-SVID and return the agent's raw output.
    async fn fetch_jwt(&self, spiffe_id: &str, audience: &str) -> Result<String, AgentError>;
}

/// SPIRE agent CLI, reached through `docker exec` into the agent container.
pub struct SpireAgentCli<R> {
    runner: R,
    container: String,
    binary: String,
    socket_path: String,
}

impl<R: CommandRunner> SpireAgentCli<R> {
    pub fn new(
        runner: R,
        container: impl Into<String>,
        binary: impl Into<String>,
        socket_path: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            container: container.into(),
            binary: binary.into(),
            socket_path: socket_path.into(),
        }
    }
}

#[async_trait]
impl<R: CommandRunner> IdentityAgent for SpireAgentCli<R> {
    async fn fetch_jwt(&self, spiffe_id: &str, audience: &str) -> Result<String, AgentError> {
        let args: Vec<String> = [
            "exec",
            self.container.as_str(),
            self.binary.as_str(),
            "api",
            "fetch",
            "jwt",
            "-audience",
            audience,
            "-spiffeID",
            spiffe_id,
            "-socketPath",
            self.socket_path.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let output = self
            .runner
            .run("docker", &args)
            .await
            .map_err(|e| AgentError::Invocation(e.to_string()))?;

        if !output.success() {
            return Err(AgentError::Failed {
                status: output.status,
                output: output.diagnostic().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

/// Extract a JWT-SVID from `spire-agent api fetch jwt` output.
///
/// The agent prints the token on the line after its `token(<spiffe-id>):`
/// label. When that line does not hold a well-formed token, the first line
/// anywhere in the output with the JWT shape is used instead.
pub fn extract_credential(output: &str) -> Option<Credential> {
    from_token_label(output)
        .or_else(|| scan_for_jwt(output))
        .and_then(|raw| Credential::parse(raw).ok())
}

fn from_token_label(output: &str) -> Option<&str> {
    let mut lines = output.lines();
    lines.find(|l| l.contains("token("))?;
    let candidate = lines.next()?.trim();

    if looks_like_jwt(candidate) {
        Some(candidate)
    } else {
        trace!("Line after token label is not a JWT, falling back to scan");
        None
    }
}

fn scan_for_jwt(output: &str) -> Option<&str> {
    output.lines().map(str::trim).find(|l| looks_like_jwt(l))
}

/// Fetches a JWT-SVID with bounded, fixed-delay retries.
pub struct CredentialFetcher<'a> {
    agent: &'a dyn IdentityAgent,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<'a> CredentialFetcher<'a> {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

    pub fn new(agent: &'a dyn IdentityAgent) -> Self {
        Self {
            agent,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            retry_delay: Self::DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the attempt ceiling. Values below 1 are raised to 1.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Fetch a JWT-SVID for `identity` scoped to `audience`.
    ///
    /// Returns on the first attempt that yields a token.
    pub async fn fetch(
        &self,
        identity: &WorkloadIdentity,
        audience: &str,
    ) -> Result<Credential, FetchError> {
        info!(
            spiffe_id = %identity.id(),
            audience = %audience,
            max_attempts = self.max_attempts,
            "Fetching JWT-SVID from SPIRE agent"
        );

        for attempt in 1..=self.max_attempts {
            match self.agent.fetch_jwt(identity.id(), audience).await {
                Ok(output) => match extract_credential(&output) {
                    Some(credential) => {
                        info!(attempt = attempt, "Obtained JWT-SVID");
                        return Ok(credential);
                    }
                    None => {
                        debug!(
                            attempt = attempt,
                            output = %output.trim(),
                            "Agent output contains no JWT-SVID"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "JWT-SVID fetch attempt failed"
                    );
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(FetchError::Exhausted {
            spiffe_id: identity.id().to_string(),
            attempts: self.max_attempts,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeAgent;
    use super::*;
    use crate::environment::testing::ScriptedRunner;
    use std::sync::Arc;

    const TOKEN: &str = "eyJhbGciOiJFUzI1NiJ9.e30.sig";

    fn identity() -> WorkloadIdentity {
        WorkloadIdentity::new(
            "example.org",
            "spiffe://example.org/w1",
            "spiffe://example.org/agent",
        )
        .unwrap()
    }

    fn fetcher(agent: &FakeAgent) -> CredentialFetcher<'_> {
        CredentialFetcher::new(agent).retry_delay(Duration::ZERO)
    }

    #[test]
    fn test_extract_from_token_label() {
        let output = "token(\n  eyJhbGciOiJFUzI1NiJ9.e30.sig\n)";
        assert_eq!(extract_credential(output).unwrap().as_str(), TOKEN);

        let output = format!(
            "token(spiffe://example.org/w1):\n\t{}\nbundle(spiffe://example.org):\n\t{{}}\n",
            TOKEN
        );
        assert_eq!(extract_credential(&output).unwrap().as_str(), TOKEN);
    }

    #[test]
    fn test_extract_falls_back_to_scan() {
        // Label present but the next line is blank.
        let output = format!("token(spiffe://example.org/w1):\n\n  {}\n", TOKEN);
        assert_eq!(extract_credential(&output).unwrap().as_str(), TOKEN);

        // No label at all.
        let output = format!("some banner\n{}\n", TOKEN);
        assert_eq!(extract_credential(&output).unwrap().as_str(), TOKEN);
    }

    #[test]
    fn test_extract_nothing() {
        assert!(extract_credential("").is_none());
        assert!(extract_credential("token(\n\n)").is_none());
        assert!(extract_credential("token(spiffe://example.org/w1):\n  not.a token\n").is_none());
        assert!(extract_credential("rpc error: code = PermissionDenied").is_none());
    }

    #[tokio::test]
    async fn test_fetch_first_attempt() {
        let agent = FakeAgent::succeeding_after(0, "token(\n  eyJhbGciOiJFUzI1NiJ9.e30.sig\n)");

        let credential = fetcher(&agent).fetch(&identity(), "aud").await.unwrap();
        assert_eq!(credential.as_str(), TOKEN);
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_stops_at_first_success() {
        for k in 1..=5 {
            let output = format!("token(spiffe://example.org/w1):\n\t{}\n", TOKEN);
            let agent = FakeAgent::succeeding_after(k - 1, &output);

            let result = fetcher(&agent).max_attempts(5).fetch(&identity(), "aud").await;
            assert!(result.is_ok());
            assert_eq!(agent.calls(), k);
        }
    }

    #[tokio::test]
    async fn test_fetch_output_without_token_is_retried() {
        let agent = FakeAgent::default();
        agent.push(Ok("token(spiffe://example.org/w1):\n\n".to_string()));
        agent.push(Ok(format!("token(spiffe://example.org/w1):\n\t{}\n", TOKEN)));

        let credential = fetcher(&agent).fetch(&identity(), "aud").await.unwrap();
        assert_eq!(credential.as_str(), TOKEN);
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn test_fetch_exhausted() {
        let agent = FakeAgent::default();

        let result = fetcher(&agent).max_attempts(4).fetch(&identity(), "aud").await;
        let err = result.unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 4, .. }));
        assert_eq!(err.guidance().len(), 4);
        assert_eq!(agent.calls(), 4);
    }

    #[tokio::test]
    async fn test_fetch_default_attempts() {
        let agent = FakeAgent::default();

        let result = fetcher(&agent).fetch(&identity(), "aud").await;
        assert!(matches!(result, Err(FetchError::Exhausted { attempts: 10, .. })));
        assert_eq!(agent.calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_waits_between_attempts_only() {
        let agent = FakeAgent::default();
        let delay = Duration::from_millis(500);
        let start = tokio::time::Instant::now();

        let result = CredentialFetcher::new(&agent)
            .max_attempts(4)
            .retry_delay(delay)
            .fetch(&identity(), "aud")
            .await;
        assert!(result.is_err());
        assert_eq!(start.elapsed(), delay * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_success_skips_remaining_delays() {
        let output = format!("token(spiffe://example.org/w1):\n\t{}\n", TOKEN);
        let agent = FakeAgent::succeeding_after(2, &output);
        let start = tokio::time::Instant::now();

        let result = CredentialFetcher::new(&agent)
            .retry_delay(Duration::from_secs(2))
            .fetch(&identity(), "aud")
            .await;
        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn test_max_attempts_floor() {
        let agent = FakeAgent::default();
        let fetcher = CredentialFetcher::new(&agent).max_attempts(0);
        assert_eq!(fetcher.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_cli_fetch_args() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_ok(0, "token(spiffe://example.org/w1):\n\tabc.def.ghi\n", "");
        let cli = SpireAgentCli::new(
            runner.clone(),
            "spire-agent",
            "/opt/spire/bin/spire-agent",
            "/run/spire/sockets/agent.sock",
        );

        let output = cli
            .fetch_jwt("spiffe://example.org/w1", "http://localhost:8080/realms/spiffe")
            .await
            .unwrap();
        assert!(output.contains("abc.def.ghi"));

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0, "docker");
        assert_eq!(
            calls[0].1,
            vec![
                "exec",
                "spire-agent",
                "/opt/spire/bin/spire-agent",
                "api",
                "fetch",
                "jwt",
                "-audience",
                "http://localhost:8080/realms/spiffe",
                "-spiffeID",
                "spiffe://example.org/w1",
                "-socketPath",
                "/run/spire/sockets/agent.sock",
            ]
        );
    }

    #[tokio::test]
    async fn test_cli_nonzero_exit_is_error() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_ok(1, "", "rpc error: code = PermissionDenied desc = no identity issued");
        let cli = SpireAgentCli::new(runner, "spire-agent", "spire-agent", "/tmp/agent.sock");

        let result = cli.fetch_jwt("spiffe://example.org/w1", "aud").await;
        assert!(matches!(result, Err(AgentError::Failed { status: Some(1), .. })));
    }
}
