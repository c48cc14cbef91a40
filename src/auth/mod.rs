//! Credential federation for container registries.
//!
//! A [`ProviderRegistry`] maps hostname patterns to cloud authentication
//! loaders. It is assembled once at startup by [`load_cloud_providers`] and
//! shared read-only across reconcile workers; nothing here retries or
//! caches, each provider owns its own policy.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

pub mod acr;
pub mod challenge;
pub mod ecr;
pub mod gcr;

pub use challenge::{AuthDirective, HttpLoginChallenger, LoginChallenger};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No registered pattern matches the requested server. Callers
    /// special-case this to tell "cloud auth unsupported here" apart from
    /// "cloud auth failed".
    #[error("no cloud credential provider matches server {0}")]
    NoLoaderFound(String),

    #[error("invalid ACR URL: {0}")]
    InvalidAcrUrl(String),

    #[error("invalid ECR URL: {0}")]
    InvalidEcrUrl(String),

    #[error("invalid GCR URL: {0}")]
    InvalidGcrUrl(String),

    #[error("AAD token refresh failed: {0}")]
    AadRefresh(String),

    #[error("challenging login server {server}: {detail}")]
    Challenge { server: String, detail: String },

    #[error("exchanging AAD token with {server}: {detail}")]
    AcrExchange { server: String, detail: String },

    #[error("fetching ECR authorization token: {0}")]
    EcrApi(String),

    #[error("expected exactly one ECR authorization data entry, got {0}")]
    EcrTokenCount(usize),

    #[error("blank ECR authorization token")]
    BlankToken,

    #[error("decoding ECR authorization token: {0}")]
    TokenDecode(#[from] base64::DecodeError),

    #[error("decoding ECR authorization token: {0}")]
    TokenUtf8(#[from] std::string::FromUtf8Error),

    #[error("malformed ECR authorization token: expected <user>:<password>")]
    MalformedToken,

    #[error("obtaining ADC access token: {0}")]
    AdcToken(String),

    #[error("fetching registry token from {server}: HTTP {status}: {body}")]
    RegistryToken {
        server: String,
        status: u16,
        body: String,
    },

    #[error("no token in response from {0}")]
    NoTokenInResponse(String),

    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Push/pull credentials for one registry server.
///
/// `username`/`password` are always set for basic-auth consumers;
/// `registry_token` is set only when a provider obtained a bearer token
/// (GCR).
#[derive(Clone, PartialEq, Eq, Default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub registry_token: Option<String>,
}

impl AuthConfig {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            registry_token: None,
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("registry_token", &self.registry_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A provider-specific identity-to-registry-token exchange.
#[async_trait]
pub trait AuthLoader: Send + Sync {
    async fn authenticate(&self, server: &str) -> Result<AuthConfig>;
}

/// Outcome of a provider's startup capability check. "Absent" and "broken"
/// are distinct: a provider with no discoverable identity declines to
/// register, while one with unusable configured credentials fails startup.
pub enum Availability {
    Unavailable(String),
    Ready(Arc<dyn AuthLoader>),
    Misconfigured(Error),
}

/// Ordered hostname-pattern dispatch to [`AuthLoader`]s.
///
/// Patterns are tried in registration order, so precedence is deterministic.
/// The registry is populated before the controller starts reconciling and is
/// never mutated afterwards; that write-once-then-read-many discipline is
/// what makes the lock-free sharing sound.
#[derive(Default)]
pub struct ProviderRegistry {
    loaders: Vec<(Regex, Arc<dyn AuthLoader>)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: Regex, loader: Arc<dyn AuthLoader>) {
        self.loaders.push((pattern, loader));
    }

    /// Resolve credentials for `server` through the first registered
    /// pattern that matches it. Returns [`Error::NoLoaderFound`] when no
    /// pattern matches.
    pub async fn retrieve_authorization(&self, server: &str) -> Result<AuthConfig> {
        for (pattern, loader) in &self.loaders {
            if pattern.is_match(server) {
                return loader.authenticate(server).await;
            }
        }
        Err(Error::NoLoaderFound(server.to_string()))
    }
}

/// Detect the cloud providers usable in this execution environment and
/// register them, in a fixed order. A provider without discoverable
/// identity is logged and skipped; one with malformed configured
/// credentials aborts startup.
pub async fn load_cloud_providers(
    http: reqwest::Client,
    challenger: Arc<dyn LoginChallenger>,
) -> crate::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    let detected = [
        (
            "acr",
            acr::host_pattern(),
            acr::detect(http.clone(), challenger.clone()).await,
        ),
        ("ecr", ecr::host_pattern(), ecr::detect().await),
        (
            "gcr",
            gcr::host_pattern(),
            gcr::detect(http.clone(), challenger.clone()).await,
        ),
    ];

    for (provider, pattern, availability) in detected {
        match availability {
            Availability::Ready(loader) => {
                info!(provider, "registered cloud credential provider");
                registry.register(pattern.clone(), loader);
            }
            Availability::Unavailable(reason) => {
                info!(provider, %reason, "cloud credential provider not available");
            }
            Availability::Misconfigured(err) => return Err(err.into()),
        }
    }

    Ok(registry)
}
