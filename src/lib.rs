#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{0}")]
    Auth(#[from] auth::Error),

    #[error("{0}")]
    Persist(#[from] persist::Error),

    #[error("{0}")]
    Verify(#[from] verify::Error),

    #[error("Error decoding docker config JSON: {0}")]
    DecodeDockerConfig(#[from] docker_config::Error),

    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Namespace is required")]
    NamespaceRequired,

    /// A slow or hung network is not the same thing as rejected credentials;
    /// status conditions must be able to tell them apart.
    #[error("credential preflight did not complete within {0:?}")]
    CredentialPreflightTimeout(Duration),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Expose all controller components used by main.
pub mod controller;

/// Resource type definitions.
pub mod resources;

/// Cloud provider credential federation.
pub mod auth;

/// Credential composition into a Docker-style config file.
pub mod persist;

/// Pre-build verification of composed credentials.
pub mod verify;

mod docker_config;

pub use docker_config::DockerConfig;
