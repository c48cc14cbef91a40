//! Azure Container Registry authentication.
//!
//! An AAD access token is exchanged for an ACR refresh token through the
//! registry's `/oauth2/exchange` endpoint. ACR accepts token-based logins
//! under a fixed sentinel username.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use azure_core::auth::TokenCredential;
use azure_identity::DefaultAzureCredentialBuilder;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error, info};

use super::challenge::LoginChallenger;
use super::{AuthConfig, AuthLoader, Availability, Error, Result};

/// Username ACR expects alongside a refresh token.
pub const ACR_TOKEN_USERNAME: &str = "00000000-0000-0000-0000-000000000000";

const AAD_SCOPE: &str = "https://management.azure.com/.default";
const AAD_REFRESH_ATTEMPTS: u32 = 3;
const AAD_REFRESH_DELAY: Duration = Duration::from_secs(1);

static HOST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.azurecr\.(?:io|cn|de|us)$").unwrap()
});

pub fn host_pattern() -> &'static Regex {
    &HOST_PATTERN
}

/// Source of fresh AAD access tokens. The production implementation wraps
/// the Azure identity SDK's default credential chain (service principal or
/// managed identity).
#[async_trait]
pub trait AadTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

pub struct AzureAdTokenSource {
    credential: Arc<dyn TokenCredential>,
}

impl AzureAdTokenSource {
    pub fn from_environment() -> Result<Self> {
        let credential = DefaultAzureCredentialBuilder::new()
            .build()
            .map_err(|e| Error::AadRefresh(format!("building Azure credential chain: {e}")))?;
        Ok(Self {
            credential: Arc::new(credential),
        })
    }
}

#[async_trait]
impl AadTokenSource for AzureAdTokenSource {
    async fn access_token(&self) -> Result<String> {
        let token = self
            .credential
            .get_token(&[AAD_SCOPE])
            .await
            .map_err(|e| Error::AadRefresh(e.to_string()))?;
        Ok(token.token.secret().to_string())
    }
}

pub struct AcrAuthLoader {
    tokens: Arc<dyn AadTokenSource>,
    tenant_id: String,
    challenger: Arc<dyn LoginChallenger>,
    http: reqwest::Client,
}

/// Registration-time capability check. A cluster with no Azure identity at
/// all simply does not get ACR support; an Azure identity that is named but
/// unusable is a startup fault.
pub async fn detect(http: reqwest::Client, challenger: Arc<dyn LoginChallenger>) -> Availability {
    let tenant_id = match std::env::var("AZURE_TENANT_ID") {
        Ok(tenant) if !tenant.is_empty() => tenant,
        _ => return Availability::Unavailable("AZURE_TENANT_ID is not set".to_string()),
    };

    match AzureAdTokenSource::from_environment() {
        Ok(tokens) => Availability::Ready(Arc::new(AcrAuthLoader::new(
            Arc::new(tokens),
            tenant_id,
            http,
            challenger,
        ))),
        Err(err) => Availability::Misconfigured(err),
    }
}

impl AcrAuthLoader {
    pub fn new(
        tokens: Arc<dyn AadTokenSource>,
        tenant_id: String,
        http: reqwest::Client,
        challenger: Arc<dyn LoginChallenger>,
    ) -> Self {
        Self {
            tokens,
            tenant_id,
            challenger,
            http,
        }
    }

    /// AAD tokens go stale; refresh is the only step worth retrying, the
    /// registry protocol steps are not.
    async fn fresh_aad_token(&self) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.tokens.access_token().await {
                Ok(token) => return Ok(token),
                Err(err) if attempt < AAD_REFRESH_ATTEMPTS => {
                    debug!(attempt, %err, "AAD token refresh attempt failed");
                    tokio::time::sleep(AAD_REFRESH_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_authenticate(&self, server: &str) -> Result<AuthConfig> {
        if !HOST_PATTERN.is_match(server) {
            return Err(Error::InvalidAcrUrl(server.to_string()));
        }

        let aad_token = self.fresh_aad_token().await?;

        let directive = self.challenger.challenge(&format!("https://{server}")).await?;

        let response = self
            .http
            .post(format!("https://{server}/oauth2/exchange"))
            .form(&[
                ("grant_type", "access_token"),
                ("service", &directive.service),
                ("tenant", &self.tenant_id),
                ("access_token", &aad_token),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AcrExchange {
                server: server.to_string(),
                detail: format!("HTTP {status}: {body}"),
            });
        }

        let exchange: ExchangeResponse =
            response.json().await.map_err(|e| Error::AcrExchange {
                server: server.to_string(),
                detail: format!("decoding exchange response: {e}"),
            })?;

        Ok(AuthConfig::basic(ACR_TOKEN_USERNAME, exchange.refresh_token))
    }
}

#[derive(Deserialize)]
struct ExchangeResponse {
    refresh_token: String,
}

#[async_trait]
impl AuthLoader for AcrAuthLoader {
    async fn authenticate(&self, server: &str) -> Result<AuthConfig> {
        match self.try_authenticate(server).await {
            Ok(auth) => {
                info!(server, "obtained ACR refresh token");
                Ok(auth)
            }
            Err(err) => {
                error!(server, %err, "ACR authentication failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    use crate::auth::AuthDirective;

    #[test]
    fn host_pattern_accepts_all_acr_suffixes() {
        for host in [
            "foo.azurecr.io",
            "foo.azurecr.cn",
            "foo.azurecr.de",
            "foo.azurecr.us",
            "my-registry-01.azurecr.io",
        ] {
            assert!(host_pattern().is_match(host), "{host} should match");
        }
    }

    #[test]
    fn host_pattern_rejects_non_acr_hosts() {
        for host in [
            "foo.azurecr.com",
            "foo",
            "azurecr.io",
            "foo.azurecr.io.evil.com",
            "123456.dkr.ecr.us-east-1.amazonaws.com",
        ] {
            assert!(!host_pattern().is_match(host), "{host} should not match");
        }
    }

    struct UnreachableTokens;

    #[async_trait]
    impl AadTokenSource for UnreachableTokens {
        async fn access_token(&self) -> Result<String> {
            panic!("token source must not be reached for an invalid ACR URL");
        }
    }

    struct UnreachableChallenger;

    #[async_trait]
    impl LoginChallenger for UnreachableChallenger {
        async fn challenge(&self, _login_server: &str) -> Result<AuthDirective> {
            panic!("login server must not be probed for an invalid ACR URL");
        }
    }

    #[tokio::test]
    async fn invalid_url_fails_before_any_network_step() {
        let loader = AcrAuthLoader::new(
            Arc::new(UnreachableTokens),
            "tenant-a".to_string(),
            reqwest::Client::new(),
            Arc::new(UnreachableChallenger),
        );

        assert_matches!(
            loader.authenticate("foo.azurecr.com").await,
            Err(Error::InvalidAcrUrl(url)) if url == "foo.azurecr.com"
        );
    }

    struct FailingTokens(Arc<std::sync::atomic::AtomicU32>);

    #[async_trait]
    impl AadTokenSource for FailingTokens {
        async fn access_token(&self) -> Result<String> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(Error::AadRefresh("identity endpoint unreachable".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aad_refresh_gives_up_after_three_attempts() {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let loader = AcrAuthLoader::new(
            Arc::new(FailingTokens(calls.clone())),
            "tenant-a".to_string(),
            reqwest::Client::new(),
            Arc::new(UnreachableChallenger),
        );

        assert_matches!(
            loader.authenticate("foo.azurecr.io").await,
            Err(Error::AadRefresh(_))
        );
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
