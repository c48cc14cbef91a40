//! Google Container Registry / Artifact Registry authentication.
//!
//! An Application Default Credentials access token is presented to the
//! registry's token realm as HTTP basic auth under the `oauth2accesstoken`
//! username, yielding a registry bearer token.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{error, info};

use super::challenge::LoginChallenger;
use super::{AuthConfig, AuthLoader, Availability, Error, Result};

/// Username GCR expects alongside an OAuth2 access token.
pub const GCR_TOKEN_USERNAME: &str = "oauth2accesstoken";

const ADC_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

static HOST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9-]+\.)?gcr\.io$|^[a-z0-9-]+-docker\.pkg\.dev$").unwrap()
});

pub fn host_pattern() -> &'static Regex {
    &HOST_PATTERN
}

/// Source of OAuth2 access tokens from the ambient GCP identity.
#[async_trait]
pub trait AdcTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

pub struct GcpAdcTokenSource {
    provider: Arc<dyn gcp_auth::TokenProvider>,
}

impl GcpAdcTokenSource {
    pub async fn from_environment() -> Result<Self> {
        let provider = gcp_auth::provider()
            .await
            .map_err(|e| Error::AdcToken(e.to_string()))?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl AdcTokenSource for GcpAdcTokenSource {
    async fn access_token(&self) -> Result<String> {
        let token = self
            .provider
            .token(&[ADC_SCOPE])
            .await
            .map_err(|e| Error::AdcToken(e.to_string()))?;
        Ok(token.as_str().to_string())
    }
}

pub struct GcrAuthLoader {
    tokens: Arc<dyn AdcTokenSource>,
    challenger: Arc<dyn LoginChallenger>,
    http: reqwest::Client,
}

/// Registration-time capability check. ADC discovery failing is normal on
/// non-GCP clusters; an explicitly named credential file that cannot be
/// loaded is a startup fault.
pub async fn detect(http: reqwest::Client, challenger: Arc<dyn LoginChallenger>) -> Availability {
    match GcpAdcTokenSource::from_environment().await {
        Ok(tokens) => {
            Availability::Ready(Arc::new(GcrAuthLoader::new(Arc::new(tokens), http, challenger)))
        }
        Err(err) => {
            let named_credentials = std::env::var("GOOGLE_APPLICATION_CREDENTIALS")
                .map(|v| !v.is_empty())
                .unwrap_or(false);
            if named_credentials {
                Availability::Misconfigured(err)
            } else {
                Availability::Unavailable(format!("no application default credentials: {err}"))
            }
        }
    }
}

impl GcrAuthLoader {
    pub fn new(
        tokens: Arc<dyn AdcTokenSource>,
        http: reqwest::Client,
        challenger: Arc<dyn LoginChallenger>,
    ) -> Self {
        Self {
            tokens,
            challenger,
            http,
        }
    }

    async fn try_authenticate(&self, server: &str) -> Result<AuthConfig> {
        if !HOST_PATTERN.is_match(server) {
            return Err(Error::InvalidGcrUrl(server.to_string()));
        }

        let access_token = self.tokens.access_token().await?;

        let directive = self.challenger.challenge(&format!("https://{server}")).await?;

        let response = self
            .http
            .get(&directive.realm)
            .query(&[("service", directive.service.as_str())])
            .basic_auth(GCR_TOKEN_USERNAME, Some(&access_token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RegistryToken {
                server: server.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let token_response: RegistryTokenResponse =
            response.json().await.map_err(|e| Error::Challenge {
                server: server.to_string(),
                detail: format!("decoding registry token response: {e}"),
            })?;

        let token = resolve_token(server, token_response)?;

        Ok(AuthConfig {
            username: GCR_TOKEN_USERNAME.to_string(),
            password: token.clone(),
            registry_token: Some(token),
        })
    }
}

/// Response body of the token realm. `refresh_token` appears in the schema
/// but registries do not accept it as a push/pull credential, so it is
/// deliberately ignored.
#[derive(Deserialize)]
struct RegistryTokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    #[allow(dead_code)]
    refresh_token: Option<String>,
}

fn resolve_token(server: &str, response: RegistryTokenResponse) -> Result<String> {
    response
        .token
        .or(response.access_token)
        .ok_or_else(|| Error::NoTokenInResponse(server.to_string()))
}

#[async_trait]
impl AuthLoader for GcrAuthLoader {
    async fn authenticate(&self, server: &str) -> Result<AuthConfig> {
        match self.try_authenticate(server).await {
            Ok(auth) => {
                info!(server, "obtained GCR registry token");
                Ok(auth)
            }
            Err(err) => {
                error!(server, %err, "GCR authentication failed");
                Err(err)
            }
        }
    }
}
