//! Pre-build credential verification.
//!
//! Every server in a composed credential file gets an authenticated
//! handshake before the build is dispatched. Transient failures are retried
//! under a bounded exponential backoff; a definitive authorization
//! rejection is terminal immediately, since retrying cannot make wrong
//! credentials right. Failures are collected across servers and reported as
//! one aggregate error carrying the provenance list, so an operator can
//! tell which credential source is likely at fault.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client as OciClient, Reference, RegistryOperation};
use tracing::{debug, warn};

use crate::docker_config::DockerConfig;
use crate::persist::CONFIG_FILE_NAME;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error reading composed credential file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error decoding composed credential file: {0}")]
    Decode(#[from] crate::docker_config::Error),

    #[error("{0}")]
    Failed(VerificationFailure),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome classification of one handshake attempt.
#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    /// The registry rejected the credentials. Terminal.
    #[error("authorization rejected: {0}")]
    Unauthorized(String),

    /// Network trouble, server errors and everything else worth retrying.
    #[error("{0}")]
    Transient(String),
}

impl HandshakeError {
    fn is_unauthorized(&self) -> bool {
        matches!(self, HandshakeError::Unauthorized(_))
    }
}

/// All per-server failures of one verification pass plus the provenance of
/// every credential source that went into the file.
#[derive(Debug)]
pub struct VerificationFailure {
    pub failures: Vec<(String, HandshakeError)>,
    pub provenance: Vec<String>,
}

impl std::fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "credential verification failed for {} server(s):",
            self.failures.len()
        )?;
        for (server, err) in &self.failures {
            write!(f, " [{server}: {err}]")?;
        }
        if !self.provenance.is_empty() {
            write!(f, " credential sources: {}", self.provenance.join("; "))?;
        }
        Ok(())
    }
}

/// Bounded exponential backoff: `attempts` tries in total, sleeping
/// `initial * factor^n` between them; the final attempt is not followed by
/// a sleep.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub factor: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 6,
            initial: Duration::from_secs(1),
            factor: 2,
        }
    }
}

/// One authenticated handshake against a registry, supplied as a
/// collaborator so retry behavior can be exercised without a live
/// registry.
#[async_trait]
pub trait RegistryHandshaker: Send + Sync {
    async fn handshake(
        &self,
        server: &str,
        auth: &RegistryAuth,
    ) -> std::result::Result<(), HandshakeError>;
}

/// Production handshake: the registry's `/v2/` probe plus token exchange,
/// driven by the OCI distribution client.
pub struct OciRegistryHandshaker {
    insecure_registries: Vec<String>,
}

impl OciRegistryHandshaker {
    pub fn new(insecure_registries: Vec<String>) -> Self {
        Self {
            insecure_registries,
        }
    }
}

#[async_trait]
impl RegistryHandshaker for OciRegistryHandshaker {
    async fn handshake(
        &self,
        server: &str,
        auth: &RegistryAuth,
    ) -> std::result::Result<(), HandshakeError> {
        let protocol = if self.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(self.insecure_registries.clone())
        };
        let client_config = ClientConfig {
            protocol,
            ..Default::default()
        };
        let mut client = OciClient::new(client_config);

        // The scope repository is irrelevant for a login handshake; token
        // endpoints authenticate the caller before they look at the scope.
        let reference: Reference = format!("{server}/kiln/credential-probe:latest")
            .parse()
            .map_err(|e: oci_distribution::ParseError| HandshakeError::Transient(e.to_string()))?;

        client
            .auth(&reference, auth, RegistryOperation::Push)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

fn classify(err: OciDistributionError) -> HandshakeError {
    match err {
        OciDistributionError::AuthenticationFailure(reason) => {
            HandshakeError::Unauthorized(reason)
        }
        OciDistributionError::UnauthorizedError { url } => {
            HandshakeError::Unauthorized(format!("unauthorized request to {url}"))
        }
        other => HandshakeError::Transient(other.to_string()),
    }
}

/// Verify every server in the credential file composed at `dir`.
pub async fn verify(dir: &Path, insecure_registries: &[String], provenance: &[String]) -> Result<()> {
    let handshaker = OciRegistryHandshaker::new(insecure_registries.to_vec());
    verify_with(dir, provenance, &handshaker, &BackoffPolicy::default()).await
}

/// [`verify`] with an explicit handshake collaborator and backoff policy.
pub async fn verify_with(
    dir: &Path,
    provenance: &[String],
    handshaker: &dyn RegistryHandshaker,
    policy: &BackoffPolicy,
) -> Result<()> {
    let raw = std::fs::read(dir.join(CONFIG_FILE_NAME))?;
    let config = DockerConfig::from_slice(&raw)?;

    let mut failures = Vec::new();
    for server in config.servers() {
        let auth = config.get_auth(server)?;
        match attempt(server, &auth, handshaker, policy).await {
            Ok(()) => debug!(server, "registry credentials verified"),
            Err(err) => {
                warn!(server, %err, "registry credential verification failed");
                failures.push((server.to_string(), err));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Failed(VerificationFailure {
            failures,
            provenance: provenance.to_vec(),
        }))
    }
}

async fn attempt(
    server: &str,
    auth: &RegistryAuth,
    handshaker: &dyn RegistryHandshaker,
    policy: &BackoffPolicy,
) -> std::result::Result<(), HandshakeError> {
    let mut delay = policy.initial;
    let mut tries = 0;
    loop {
        tries += 1;
        match handshaker.handshake(server, auth).await {
            Ok(()) => return Ok(()),
            // Retrying rejected credentials cannot help.
            Err(err) if err.is_unauthorized() => return Err(err),
            Err(err) if tries >= policy.attempts => return Err(err),
            Err(err) => {
                debug!(
                    server,
                    attempt = tries,
                    backoff = ?delay,
                    %err,
                    "transient verification failure, backing off"
                );
                tokio::time::sleep(delay).await;
                delay *= policy.factor;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use std::sync::Mutex;

    enum Script {
        AlwaysUnauthorized,
        AlwaysTransient,
        SucceedAfter(u32),
    }

    struct ScriptedHandshaker {
        scripts: HashMap<String, Script>,
        counts: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedHandshaker {
        fn new(scripts: impl IntoIterator<Item = (&'static str, Script)>) -> Self {
            Self {
                scripts: scripts
                    .into_iter()
                    .map(|(server, script)| (server.to_string(), script))
                    .collect(),
                counts: Mutex::new(HashMap::new()),
            }
        }

        fn count(&self, server: &str) -> u32 {
            *self.counts.lock().unwrap().get(server).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl RegistryHandshaker for ScriptedHandshaker {
        async fn handshake(
            &self,
            server: &str,
            _auth: &RegistryAuth,
        ) -> std::result::Result<(), HandshakeError> {
            let tries = {
                let mut counts = self.counts.lock().unwrap();
                let tries = counts.entry(server.to_string()).or_insert(0);
                *tries += 1;
                *tries
            };
            match self.scripts.get(server).expect("scripted server") {
                Script::AlwaysUnauthorized => Err(HandshakeError::Unauthorized(
                    "credentials rejected".to_string(),
                )),
                Script::AlwaysTransient => {
                    Err(HandshakeError::Transient("connection reset".to_string()))
                }
                Script::SucceedAfter(n) => {
                    if tries > *n {
                        Ok(())
                    } else {
                        Err(HandshakeError::Transient("connection reset".to_string()))
                    }
                }
            }
        }
    }

    fn write_config(servers: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let auths: HashMap<_, _> = servers
            .iter()
            .map(|server| {
                (
                    server.to_string(),
                    serde_json::json!({"username": "u", "password": "p"}),
                )
            })
            .collect();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            serde_json::json!({ "auths": auths }).to_string(),
        )
        .expect("write config");
        dir
    }

    #[tokio::test]
    async fn unauthorized_terminates_after_a_single_attempt() {
        let dir = write_config(&["registry1.com"]);
        let handshaker =
            ScriptedHandshaker::new([("registry1.com", Script::AlwaysUnauthorized)]);

        let err = verify_with(
            dir.path(),
            &["inline basic auth credentials provided for registry1.com".to_string()],
            &handshaker,
            &BackoffPolicy::default(),
        )
        .await
        .expect_err("verification must fail");

        assert_eq!(handshaker.count("registry1.com"), 1);
        assert_matches!(err, Error::Failed(failure) => {
            assert_matches!(
                failure.failures.as_slice(),
                [(server, HandshakeError::Unauthorized(_))] if server == "registry1.com"
            );
        });
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_six_times() {
        let dir = write_config(&["registry1.com"]);
        let handshaker = ScriptedHandshaker::new([("registry1.com", Script::AlwaysTransient)]);

        let err = verify_with(dir.path(), &[], &handshaker, &BackoffPolicy::default())
            .await
            .expect_err("verification must fail");

        assert_eq!(handshaker.count("registry1.com"), 6);
        assert_matches!(err, Error::Failed(_));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_during_backoff_verifies_cleanly() {
        let dir = write_config(&["registry1.com"]);
        let handshaker = ScriptedHandshaker::new([("registry1.com", Script::SucceedAfter(2))]);

        verify_with(dir.path(), &[], &handshaker, &BackoffPolicy::default())
            .await
            .expect("verification recovers");

        assert_eq!(handshaker.count("registry1.com"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_collected_across_servers() {
        let dir = write_config(&["registry1.com", "registry2.com", "registry3.com"]);
        let handshaker = ScriptedHandshaker::new([
            ("registry1.com", Script::AlwaysUnauthorized),
            ("registry2.com", Script::SucceedAfter(0)),
            ("registry3.com", Script::AlwaysTransient),
        ]);
        let provenance = vec![
            "secret builds/registry-creds provided credentials for registry1.com".to_string(),
            "inline basic auth credentials provided for registry2.com".to_string(),
            "cloud provider credentials resolved for registry3.com".to_string(),
        ];

        let err = verify_with(dir.path(), &provenance, &handshaker, &BackoffPolicy::default())
            .await
            .expect_err("two servers fail");

        assert_matches!(err, Error::Failed(failure) => {
            let servers: Vec<_> = failure.failures.iter().map(|(s, _)| s.as_str()).collect();
            assert_eq!(servers, vec!["registry1.com", "registry3.com"]);

            // The rendered diagnostic names every failing server and every
            // credential source.
            let rendered = failure.to_string();
            assert!(rendered.contains("registry1.com"));
            assert!(rendered.contains("registry3.com"));
            assert!(rendered.contains("secret builds/registry-creds"));
            assert!(rendered.contains("cloud provider credentials resolved"));
        });
    }
}
