use std::collections::HashMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
group = "kiln.dev",
version = "v1alpha1",
kind = "ImageBuild",
namespaced
)]
#[kube(status = "ImageBuildStatus")]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildSpec {
    /// Fully qualified name of the image to build and push, e.g.
    /// `registry1.com/team/app:v3`.
    pub image: String,

    /// URL of the build context (git or http) handed to the build executor.
    pub context: String,

    /// Credentials for every registry the build pulls from or pushes to.
    /// Entries are resolved in order.
    pub registry_credentials: Option<Vec<RegistryCredentialSpec>>,

    /// Registries to contact over plain HTTP during verification and build.
    pub insecure_registries: Option<Vec<String>>,

    /// If true, the controller will not reconcile this build.
    /// You can use this if you need to do some manual changes (either with kubectl directly or with the kiln CLI)
    #[serde(default)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pause: bool,
}

impl ImageBuild {
    pub fn namespace_any(&self) -> String {
        self.namespace().unwrap_or_default()
    }
}

/// One registry credential source. `server` is always a bare registry
/// hostname, never a full image reference. Exactly one of `secret_ref` and
/// `basic_auth` may be set; when neither is set the credentials are resolved
/// through the cloud provider matching `server`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredentialSpec {
    pub server: String,

    /// Reference to a `kubernetes.io/dockerconfigjson` secret holding an
    /// existing registry credential file.
    pub secret_ref: Option<CredentialSecretRef>,

    /// Inline username/password.
    pub basic_auth: Option<BasicAuthCredential>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSecretRef {
    pub name: String,
    /// Defaults to the namespace of the ImageBuild.
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthCredential {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildStatus {
    pub last_logs: Option<HashMap<String, String>>,
    #[serde(default)]
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    pub conditions: Vec<ImageBuildCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildCondition {
    pub last_transition_time: Time,
    pub message: String,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    pub reason: String,
    pub status: String,
    pub type_: String,
}
