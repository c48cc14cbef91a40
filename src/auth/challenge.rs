//! The registry login challenge probe.
//!
//! Container registries answer an unauthenticated `GET /v2/` with a
//! `WWW-Authenticate: Bearer realm="…",service="…"` header naming the token
//! endpoint to exchange against. ACR and GCR both start from this probe.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::{Error, Result};

static CHALLENGE_PARAMETER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]+)""#).unwrap());

/// The outcome of one login-server probe. Produced per probe and never
/// cached; callers may re-probe on every authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthDirective {
    pub service: String,
    pub realm: String,
}

impl AuthDirective {
    /// Parse a `WWW-Authenticate` header value into a directive.
    pub fn from_challenge_header(server: &str, header: &str) -> Result<Self> {
        let parameters = match header.strip_prefix("Bearer ") {
            Some(rest) => rest.trim(),
            None => {
                return Err(Error::Challenge {
                    server: server.to_string(),
                    detail: format!("unsupported authentication scheme in challenge: {header}"),
                })
            }
        };

        let mut service = None;
        let mut realm = None;
        for (_, [key, value]) in CHALLENGE_PARAMETER
            .captures_iter(parameters)
            .map(|c| c.extract())
        {
            match key {
                "service" => service = Some(value.to_string()),
                "realm" => realm = Some(value.to_string()),
                _ => {}
            }
        }

        let missing = |parameter: &str| Error::Challenge {
            server: server.to_string(),
            detail: format!("challenge is missing the {parameter} parameter"),
        };

        Ok(AuthDirective {
            service: service.ok_or_else(|| missing("service"))?,
            realm: realm.ok_or_else(|| missing("realm"))?,
        })
    }
}

/// Performs the unauthenticated probe against a login server and reads the
/// bearer challenge. Supplied as a collaborator so providers can be
/// exercised without a live registry.
///
/// The probe itself is not retried; the calling provider owns its retry
/// policy.
#[async_trait]
pub trait LoginChallenger: Send + Sync {
    async fn challenge(&self, login_server: &str) -> Result<AuthDirective>;
}

pub struct HttpLoginChallenger {
    http: reqwest::Client,
}

impl HttpLoginChallenger {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl LoginChallenger for HttpLoginChallenger {
    async fn challenge(&self, login_server: &str) -> Result<AuthDirective> {
        let url = format!("{login_server}/v2/");
        let response = self.http.get(&url).send().await?;

        let header = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .ok_or_else(|| Error::Challenge {
                server: login_server.to_string(),
                detail: format!(
                    "no WWW-Authenticate challenge in response (HTTP {})",
                    response.status()
                ),
            })?;

        let header = header.to_str().map_err(|e| Error::Challenge {
            server: login_server.to_string(),
            detail: format!("challenge header is not valid UTF-8: {e}"),
        })?;

        AuthDirective::from_challenge_header(login_server, header)
    }
}
