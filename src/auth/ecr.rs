//! Elastic Container Registry authentication.
//!
//! ECR hands out a base64 `user:password` pair through the
//! `GetAuthorizationToken` API, one entry per account/region. The SDK owns
//! its own retry policy, so a failed call is surfaced immediately.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use base64::{engine::general_purpose, Engine as _};
use itertools::Itertools;
use regex::Regex;
use tracing::{error, info};

use super::{AuthConfig, AuthLoader, Availability, Error, Result};

static HOST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\.dkr\.ecr(?:-fips)?\.[a-z0-9-]+\.amazonaws\.com(?:\.cn)?$").unwrap()
});

pub fn host_pattern() -> &'static Regex {
    &HOST_PATTERN
}

/// One entry of the `GetAuthorizationToken` response.
pub struct EcrAuthorizationData {
    pub authorization_token: Option<String>,
}

/// The `GetAuthorizationToken` API surface, supplied as a collaborator.
#[async_trait]
pub trait EcrTokenFetcher: Send + Sync {
    async fn authorization_data(&self) -> Result<Vec<EcrAuthorizationData>>;
}

pub struct SdkEcrTokenFetcher {
    client: aws_sdk_ecr::Client,
}

impl SdkEcrTokenFetcher {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_ecr::Client::new(config),
        }
    }
}

#[async_trait]
impl EcrTokenFetcher for SdkEcrTokenFetcher {
    async fn authorization_data(&self) -> Result<Vec<EcrAuthorizationData>> {
        let output = self
            .client
            .get_authorization_token()
            .send()
            .await
            .map_err(|e| Error::EcrApi(aws_sdk_ecr::error::DisplayErrorContext(&e).to_string()))?;

        Ok(output
            .authorization_data()
            .iter()
            .map(|data| EcrAuthorizationData {
                authorization_token: data.authorization_token().map(str::to_string),
            })
            .collect())
    }
}

pub struct EcrAuthLoader {
    fetcher: Arc<dyn EcrTokenFetcher>,
}

/// Registration-time capability check against the default AWS credential
/// chain (environment, profile, IMDS). Partially configured static keys are
/// a startup fault, an empty chain just means no ECR support.
pub async fn detect() -> Availability {
    let access_key = std::env::var("AWS_ACCESS_KEY_ID")
        .ok()
        .filter(|v| !v.is_empty());
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .ok()
        .filter(|v| !v.is_empty());
    if access_key.is_some() != secret_key.is_some() {
        return Availability::Misconfigured(Error::EcrApi(
            "static AWS credentials are partially configured: \
             AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must both be set"
                .to_string(),
        ));
    }

    let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let Some(provider) = config.credentials_provider() else {
        return Availability::Unavailable("no AWS credentials provider configured".to_string());
    };

    match provider.provide_credentials().await {
        Ok(_) => Availability::Ready(Arc::new(EcrAuthLoader::new(Arc::new(
            SdkEcrTokenFetcher::new(&config),
        )))),
        Err(err) => Availability::Unavailable(format!("no AWS credentials discoverable: {err}")),
    }
}

impl EcrAuthLoader {
    pub fn new(fetcher: Arc<dyn EcrTokenFetcher>) -> Self {
        Self { fetcher }
    }

    async fn try_authenticate(&self, server: &str) -> Result<AuthConfig> {
        if !HOST_PATTERN.is_match(server) {
            return Err(Error::InvalidEcrUrl(server.to_string()));
        }

        let data = self.fetcher.authorization_data().await?;

        // ECR returns one token per account/region pair; anything else means
        // the response cannot be attributed to this registry.
        let count = data.len();
        let entry = data
            .into_iter()
            .exactly_one()
            .map_err(|_| Error::EcrTokenCount(count))?;

        let token = entry.authorization_token.unwrap_or_default();
        let (username, password) = decode_authorization_token(&token)?;
        Ok(AuthConfig::basic(username, password))
    }
}

/// Decode a `GetAuthorizationToken` token: base64 over `user:password`,
/// split on the first colon (passwords may contain colons).
fn decode_authorization_token(token: &str) -> Result<(String, String)> {
    if token.is_empty() {
        return Err(Error::BlankToken);
    }

    let decoded = String::from_utf8(general_purpose::STANDARD.decode(token)?)?;
    decoded
        .split_once(':')
        .map(|(user, password)| (user.to_string(), password.to_string()))
        .ok_or(Error::MalformedToken)
}

#[async_trait]
impl AuthLoader for EcrAuthLoader {
    async fn authenticate(&self, server: &str) -> Result<AuthConfig> {
        match self.try_authenticate(server).await {
            Ok(auth) => {
                info!(server, "obtained ECR authorization token");
                Ok(auth)
            }
            Err(err) => {
                error!(server, %err, "ECR authentication failed");
                Err(err)
            }
        }
    }
}
