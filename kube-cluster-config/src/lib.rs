//! Resolve how to reach and authenticate to a Kubernetes cluster
//!
//! This crate turns a kubeconfig document, a structured application config, or the in-cluster
//! service account mount into one [`ClusterConfig`]: the API server address, an authentication
//! strategy, and transport settings. It does not talk to the cluster itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use kube_cluster_config::{ClusterConfig, KubeConfigOptions, Kubeconfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // A local kubeconfig, honouring `$KUBECONFIG`
//!     let kubeconfig = Kubeconfig::read()?;
//!     let config = ClusterConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())?;
//!
//!     // Secrets are only read (or exec plugins run) when a credential is requested
//!     let provider = config.credential_provider();
//!     if let Some(header) = provider.credential()?.authorization_header()? {
//!         println!("authenticating to {} with a {} byte header", config.host, header.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! For more details, see:
//!
//! - [`config`] for the constructors and the kubeconfig model
//! - [`auth`] for authentication strategies, credentials and exec plugins
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod auth;
pub mod config;
pub mod error;

#[doc(inline)]
pub use auth::{Authentication, Credential, CredentialProvider, ServerCertificate};
#[doc(inline)]
pub use config::{ClientConfig, ClusterConfig, KeySource, KubeConfigOptions, Kubeconfig, ResolvePolicy};
pub use error::Error;

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
