use std::collections::BTreeMap;

use base64::{engine::general_purpose, Engine as _};
use oci_distribution::secrets::RegistryAuth;
use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error deserializing JSON: {0}")]
    Deserializing(#[from] serde_json::Error),

    #[error("Error decoding base64 field inside docker config auth section: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Error decoding content of base64 field inside docker config auth section: {0}")]
    FromUtf8(#[from] std::string::FromUtf8Error),

    #[error("Missing colon in auth field")]
    MissingColon,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A content of a ~/.docker/config.json file which is also the same format
/// of the contents of the kubernetes kubernetes.io/dockerconfigjson secret,
/// and the shape of the credential file this controller composes for the
/// build executor.
///
/// Keys are bare registry hostnames. A BTreeMap keeps the serialized file
/// deterministic for a given set of entries.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    auths: BTreeMap<String, DockerCredentials>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DockerCredentials {
    Split { username: String, password: String },
    Composite { auth: String },
}

impl DockerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a DockerConfig from a string.
    pub fn from_str(str: &str) -> Result<Self> {
        Self::from_slice(str.as_bytes())
    }

    /// Parse a DockerConfig from slice of bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Returns a [`RegistryAuth`] for a given image registry.
    /// If a registry is not mentioned in the auth section of the docker config file,
    /// the authentication method will be "anonymous" (i.e. unauthenticated), which
    /// is suitable for public images. This matches the normal behavior of the docker client.
    pub fn get_auth(&self, registry: &str) -> Result<RegistryAuth> {
        Ok(match self.auths.get(registry) {
            None => RegistryAuth::Anonymous,
            Some(credentials) => {
                let (username, password) = credentials.unpack()?;
                RegistryAuth::Basic(username, password)
            }
        })
    }

    /// Registry hostnames present in the file, in key order.
    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.auths.keys().map(String::as_str)
    }

    /// Record credentials for `server`. Basic credentials are stored as an
    /// explicit username/password pair, the shape the build executor reads.
    pub fn insert(&mut self, server: &str, auth: &AuthConfig) {
        self.auths.insert(
            server.to_string(),
            DockerCredentials::Split {
                username: auth.username.clone(),
                password: auth.password.clone(),
            },
        );
    }

    /// Move all entries of `other` into `self`, normalizing composite
    /// base64 `auth` fields into username/password pairs. Returns the list
    /// of servers contributed, in key order.
    pub fn absorb(&mut self, other: DockerConfig) -> Result<Vec<String>> {
        let mut contributed = Vec::with_capacity(other.auths.len());
        for (server, credentials) in other.auths {
            let (username, password) = credentials.unpack()?;
            self.auths
                .insert(server.clone(), DockerCredentials::Split { username, password });
            contributed.push(server);
        }
        Ok(contributed)
    }
}

impl DockerCredentials {
    pub(crate) fn unpack(&self) -> Result<(String, String)> {
        Ok(match self.clone() {
            DockerCredentials::Split { username, password } => (username, password),

            DockerCredentials::Composite { auth } => {
                String::from_utf8(general_purpose::STANDARD.decode(auth)?)?
                    .split_once(':')
                    .map(|(a, b)| (a.to_string(), b.to_string()))
                    .ok_or(Error::MissingColon)?
            }
        })
    }
}

impl std::fmt::Debug for DockerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerConfig")
            .field("auths", &"<redacted>")
            .finish()
    }
}
