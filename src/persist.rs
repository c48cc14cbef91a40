//! Credential composition.
//!
//! [`persist`] resolves an ordered list of registry credential specs into a
//! single Docker-style `config.json` inside a fresh temporary directory.
//! Ownership of the directory transfers to the caller, which removes it
//! when the build that consumed it is done.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

use crate::auth::{self, AuthConfig, ProviderRegistry};
use crate::docker_config::DockerConfig;
use crate::resources::RegistryCredentialSpec;

/// File name of the composed credential file.
pub const CONFIG_FILE_NAME: &str = "config.json";

const DOCKER_CONFIG_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_SECRET_KEY: &str = ".dockerconfigjson";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error fetching secret {namespace}/{name}: {source}")]
    FetchSecret {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error(
        "Unsupported registry secret type {found:?} for {namespace}/{name}, \
         should be kubernetes.io/dockerconfigjson"
    )]
    BadSecretType {
        namespace: String,
        name: String,
        found: Option<String>,
    },

    #[error("Secret {namespace}/{name} doesn't contain .dockerconfigjson")]
    NoDockerConfigJson { namespace: String, name: String },

    #[error("Error decoding docker config JSON in secret {namespace}/{name}: {source}")]
    DecodeSecret {
        namespace: String,
        name: String,
        #[source]
        source: crate::docker_config::Error,
    },

    /// Distinct from a provider-internal failure: no provider claims this
    /// server at all.
    #[error(
        "server {0} is not configured for cloud authentication; \
         credentials may be misconfigured"
    )]
    ServerNotConfigured(String),

    #[error("{0}")]
    CloudAuth(auth::Error),

    #[error("duplicate credentials for server {server}: already provided by {existing}")]
    DuplicateServer { server: String, existing: String },

    #[error("Error serializing registry credential file: {0}")]
    Serialize(serde_json::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The composed credential artifact. Dropping it removes the backing
/// directory, so keep it alive for as long as the build consumes it.
#[derive(Debug)]
pub struct ComposedCredentials {
    pub dir: tempfile::TempDir,
    /// One human-readable note per credential source, correlated with the
    /// composed servers for diagnostics.
    pub provenance: Vec<String>,
}

impl ComposedCredentials {
    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join(CONFIG_FILE_NAME)
    }
}

/// Fetch of a named/namespaced Kubernetes secret, supplied as a
/// collaborator so composition can be exercised without a cluster.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self, namespace: &str, name: &str) -> Result<Secret>;
}

pub struct KubeSecretSource {
    client: Client,
}

impl KubeSecretSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for KubeSecretSource {
    async fn fetch(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|source| Error::FetchSecret {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        })
    }
}

/// Resolve every credential spec and write the merged credential file.
///
/// Per entry exactly one source applies, in this precedence: secret
/// reference, then inline basic auth, then cloud-provider dispatch. A
/// server contributed twice across entries is rejected rather than
/// silently overwritten.
pub async fn persist(
    specs: &[RegistryCredentialSpec],
    default_namespace: &str,
    secrets: &dyn SecretSource,
    providers: &ProviderRegistry,
) -> Result<ComposedCredentials> {
    let mut config = DockerConfig::new();
    let mut provenance = Vec::with_capacity(specs.len());
    let mut claimed: HashMap<String, String> = HashMap::new();

    for spec in specs {
        if let Some(secret_ref) = &spec.secret_ref {
            let namespace = secret_ref.namespace.as_deref().unwrap_or(default_namespace);
            let name = secret_ref.name.as_str();

            let secret = secrets.fetch(namespace, name).await?;
            if secret.type_.as_deref() != Some(DOCKER_CONFIG_SECRET_TYPE) {
                return Err(Error::BadSecretType {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    found: secret.type_,
                });
            }

            let data = secret
                .data
                .as_ref()
                .and_then(|data| data.get(DOCKER_CONFIG_SECRET_KEY))
                .ok_or_else(|| Error::NoDockerConfigJson {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })?;

            let parsed =
                DockerConfig::from_slice(&data.0).map_err(|source| Error::DecodeSecret {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    source,
                })?;

            // A single secret may carry credentials for several registries.
            let source = format!("secret {namespace}/{name}");
            for server in parsed.servers() {
                claim(&mut claimed, server, &source)?;
            }
            let contributed =
                config
                    .absorb(parsed)
                    .map_err(|source| Error::DecodeSecret {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        source,
                    })?;
            provenance.push(format!(
                "{source} provided credentials for {}",
                contributed.join(", ")
            ));
        } else if let Some(basic) = &spec.basic_auth {
            claim(&mut claimed, &spec.server, "inline basic auth")?;
            config.insert(
                &spec.server,
                &AuthConfig::basic(&basic.username, &basic.password),
            );
            provenance.push(format!(
                "inline basic auth credentials provided for {}",
                spec.server
            ));
        } else {
            claim(&mut claimed, &spec.server, "cloud provider dispatch")?;
            let resolved = match providers.retrieve_authorization(&spec.server).await {
                Ok(resolved) => resolved,
                Err(auth::Error::NoLoaderFound(server)) => {
                    return Err(Error::ServerNotConfigured(server))
                }
                Err(other) => return Err(Error::CloudAuth(other)),
            };
            config.insert(&spec.server, &resolved);
            provenance.push(format!(
                "cloud provider credentials resolved for {}",
                spec.server
            ));
        }
    }

    let dir = tempfile::Builder::new()
        .prefix("kiln-registry-auth-")
        .tempdir()?;
    let contents = serde_json::to_vec_pretty(&config).map_err(Error::Serialize)?;
    std::fs::write(dir.path().join(CONFIG_FILE_NAME), contents)?;

    debug!(
        servers = ?config.servers().collect::<Vec<_>>(),
        dir = %dir.path().display(),
        "composed registry credential file"
    );

    Ok(ComposedCredentials { dir, provenance })
}

fn claim(claimed: &mut HashMap<String, String>, server: &str, source: &str) -> Result<()> {
    if let Some(existing) = claimed.insert(server.to_string(), source.to_string()) {
        return Err(Error::DuplicateServer {
            server: server.to_string(),
            existing,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use k8s_openapi::ByteString;
    use regex::Regex;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::auth::AuthLoader;
    use crate::resources::{BasicAuthCredential, CredentialSecretRef};

    fn docker_config_secret(payload: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(
            DOCKER_CONFIG_SECRET_KEY.to_string(),
            ByteString(payload.as_bytes().to_vec()),
        );
        Secret {
            data: Some(data),
            type_: Some(DOCKER_CONFIG_SECRET_TYPE.to_string()),
            ..Default::default()
        }
    }

    struct MapSecrets(HashMap<(String, String), Secret>);

    impl MapSecrets {
        fn single(namespace: &str, name: &str, secret: Secret) -> Self {
            let mut map = HashMap::new();
            map.insert((namespace.to_string(), name.to_string()), secret);
            Self(map)
        }
    }

    #[async_trait]
    impl SecretSource for MapSecrets {
        async fn fetch(&self, namespace: &str, name: &str) -> Result<Secret> {
            Ok(self
                .0
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .unwrap_or_else(|| panic!("unexpected secret fetch {namespace}/{name}")))
        }
    }

    fn secret_spec(server: &str, name: &str) -> RegistryCredentialSpec {
        RegistryCredentialSpec {
            server: server.to_string(),
            secret_ref: Some(CredentialSecretRef {
                name: name.to_string(),
                namespace: None,
            }),
            basic_auth: None,
        }
    }

    fn basic_spec(server: &str, username: &str, password: &str) -> RegistryCredentialSpec {
        RegistryCredentialSpec {
            server: server.to_string(),
            secret_ref: None,
            basic_auth: Some(BasicAuthCredential {
                username: username.to_string(),
                password: password.to_string(),
            }),
        }
    }

    fn cloud_spec(server: &str) -> RegistryCredentialSpec {
        RegistryCredentialSpec {
            server: server.to_string(),
            secret_ref: None,
            basic_auth: None,
        }
    }

    fn read_config(composed: &ComposedCredentials) -> serde_json::Value {
        let raw = std::fs::read(composed.config_path()).expect("config file exists");
        serde_json::from_slice(&raw).expect("valid json")
    }

    #[tokio::test]
    async fn secret_entry_lands_verbatim_in_the_config_file() {
        let secrets = MapSecrets::single(
            "builds",
            "registry-creds",
            docker_config_secret(
                r#"{"auths":{"registry1.com":{"username":"happy","password":"gilmore"}}}"#,
            ),
        );

        let composed = persist(
            &[secret_spec("registry1.com", "registry-creds")],
            "builds",
            &secrets,
            &ProviderRegistry::new(),
        )
        .await
        .expect("composition succeeds");

        let config = read_config(&composed);
        assert_eq!(config["auths"]["registry1.com"]["username"], "happy");
        assert_eq!(config["auths"]["registry1.com"]["password"], "gilmore");

        assert_eq!(composed.provenance.len(), 1);
        assert!(composed.provenance[0].contains("registry-creds"));
        assert!(composed.provenance[0].contains("builds"));
        assert!(composed.provenance[0].contains("registry1.com"));
    }

    #[tokio::test]
    async fn secret_may_contribute_multiple_servers() {
        let secrets = MapSecrets::single(
            "builds",
            "registry-creds",
            docker_config_secret(
                r#"{"auths":{
                    "registry1.com":{"username":"a","password":"b"},
                    "registry2.com":{"auth":"Zm9vOmh1bnRlcjEy"}
                }}"#,
            ),
        );

        let composed = persist(
            &[secret_spec("registry1.com", "registry-creds")],
            "builds",
            &secrets,
            &ProviderRegistry::new(),
        )
        .await
        .expect("composition succeeds");

        let config = read_config(&composed);
        assert_eq!(config["auths"]["registry2.com"]["username"], "foo");
        assert_eq!(config["auths"]["registry2.com"]["password"], "hunter12");
        assert!(composed.provenance[0].contains("registry1.com"));
        assert!(composed.provenance[0].contains("registry2.com"));
    }

    #[tokio::test]
    async fn wrong_secret_type_is_rejected() {
        let mut secret = docker_config_secret(r#"{"auths":{}}"#);
        secret.type_ = Some("Opaque".to_string());
        let secrets = MapSecrets::single("builds", "registry-creds", secret);

        let err = persist(
            &[secret_spec("registry1.com", "registry-creds")],
            "builds",
            &secrets,
            &ProviderRegistry::new(),
        )
        .await
        .expect_err("wrong type must be rejected");

        assert_matches!(err, Error::BadSecretType { found: Some(found), .. } if found == "Opaque");
    }

    #[tokio::test]
    async fn basic_auth_is_copied_verbatim() {
        let composed = persist(
            &[basic_spec("registry1.com", "happy", "gilmore")],
            "builds",
            &MapSecrets(HashMap::new()),
            &ProviderRegistry::new(),
        )
        .await
        .expect("composition succeeds");

        let config = read_config(&composed);
        assert_eq!(config["auths"]["registry1.com"]["username"], "happy");
        assert_eq!(config["auths"]["registry1.com"]["password"], "gilmore");
        // No secret material in the provenance note.
        assert!(!composed.provenance[0].contains("gilmore"));
    }

    struct StaticLoader;

    #[async_trait]
    impl AuthLoader for StaticLoader {
        async fn authenticate(&self, _server: &str) -> auth::Result<AuthConfig> {
            Ok(AuthConfig::basic("cloud-user", "cloud-pass"))
        }
    }

    #[tokio::test]
    async fn cloud_entries_dispatch_through_the_provider_registry() {
        let mut providers = ProviderRegistry::new();
        providers.register(
            Regex::new(r"\.cloud\.example$").unwrap(),
            Arc::new(StaticLoader),
        );

        let composed = persist(
            &[cloud_spec("push.cloud.example")],
            "builds",
            &MapSecrets(HashMap::new()),
            &providers,
        )
        .await
        .expect("composition succeeds");

        let config = read_config(&composed);
        assert_eq!(
            config["auths"]["push.cloud.example"]["username"],
            "cloud-user"
        );
        assert!(composed.provenance[0].contains("push.cloud.example"));
    }

    #[tokio::test]
    async fn unmatched_cloud_server_is_a_configuration_error() {
        let err = persist(
            &[cloud_spec("registry1.com")],
            "builds",
            &MapSecrets(HashMap::new()),
            &ProviderRegistry::new(),
        )
        .await
        .expect_err("no provider matches");

        assert_matches!(err, Error::ServerNotConfigured(server) if server == "registry1.com");
    }

    #[tokio::test]
    async fn duplicate_servers_are_rejected_not_overwritten() {
        let secrets = MapSecrets::single(
            "builds",
            "registry-creds",
            docker_config_secret(
                r#"{"auths":{"registry1.com":{"username":"a","password":"b"}}}"#,
            ),
        );

        let err = persist(
            &[
                secret_spec("registry1.com", "registry-creds"),
                basic_spec("registry1.com", "c", "d"),
            ],
            "builds",
            &secrets,
            &ProviderRegistry::new(),
        )
        .await
        .expect_err("duplicate server must be rejected");

        assert_matches!(
            err,
            Error::DuplicateServer { server, existing }
                if server == "registry1.com" && existing.contains("registry-creds")
        );
    }

    #[tokio::test]
    async fn secret_reference_takes_precedence_over_inline_auth() {
        let secrets = MapSecrets::single(
            "builds",
            "registry-creds",
            docker_config_secret(
                r#"{"auths":{"registry1.com":{"username":"from-secret","password":"s"}}}"#,
            ),
        );

        let mut spec = secret_spec("registry1.com", "registry-creds");
        spec.basic_auth = Some(BasicAuthCredential {
            username: "from-inline".to_string(),
            password: "i".to_string(),
        });

        let composed = persist(&[spec], "builds", &secrets, &ProviderRegistry::new())
            .await
            .expect("composition succeeds");

        let config = read_config(&composed);
        assert_eq!(config["auths"]["registry1.com"]["username"], "from-secret");
    }
}
