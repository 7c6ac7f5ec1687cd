//! Kubernetes cluster connection settings from `~/.kube/config`, `$KUBECONFIG`, application
//! settings, or the [cluster environment](https://kubernetes.io/docs/tasks/access-application-cluster/access-cluster/#accessing-the-api-from-a-pod).
//!
//! # Usage
//! The [`ClusterConfig`] has several constructors plus logic to infer the environment.
//! Every constructor ends in the same immutable value, handed to whatever transport talks to the cluster.
mod file_config;
mod file_loader;
mod incluster_config;
mod key_source;
mod structured;

use std::{sync::Arc, time::Duration};

use crate::{
    auth::{parse_host, Authentication, CredentialProvider, ExecRunner, ProcessRunner, ServerCertificate},
    Error, Result,
};
pub use file_config::{
    ClusterInfo, ContextInfo, ExecConfig, ExecEnvVar, Kubeconfig, NamedCluster, NamedContext, NamedUser,
    UserInfo,
};
use file_loader::ConfigLoader;
pub use file_loader::KubeConfigOptions;
pub use key_source::KeySource;

/// Exec plugins that have not answered within this window are killed.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// How names that appear more than once in a kubeconfig are looked up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DuplicateNamePolicy {
    /// The first entry in document order is selected, later ones are never used.
    #[default]
    FirstMatch,
    /// Looking up a duplicated name is an error.
    Reject,
}

/// What a secure connection without a configured certificate authority means.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CertificateAuthorityPolicy {
    /// Verify the server against the platform trust store.
    #[default]
    PlatformTrustStore,
    /// A certificate authority must be configured.
    Required,
}

/// Answers to the questions a kubeconfig or settings document may leave open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolvePolicy {
    /// Lookup of duplicated cluster, context and user names
    pub duplicate_names: DuplicateNamePolicy,
    /// Secure connections without a certificate authority
    pub missing_certificate_authority: CertificateAuthorityPolicy,
}

/// Transport level settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Whether the transport should log requests verbosely
    pub debug: bool,
    /// How the server's certificate is verified
    pub server_certificate: ServerCertificate,
}

/// Everything needed to connect and authenticate to one cluster.
///
/// # Usage
/// Construct a [`ClusterConfig`] with one of the constructors. Prefer [`ClusterConfig::infer`]
/// unless you know where the configuration lives.
///
/// No secret is read while constructing it. Credentials are resolved on demand through
/// [`ClusterConfig::credential_provider`], so rotated token files are picked up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    /// The API server address
    pub host: http::Uri,
    /// How requests are authenticated
    pub authentication: Authentication,
    /// Transport settings
    pub client: ClientConfig,
}

impl ClusterConfig {
    /// Defaults for a workload running inside a cluster.
    ///
    /// Uses the cluster DNS name and the mounted service account files. Nothing is read here.
    pub fn incluster() -> Self {
        Self {
            host: incluster_config::kube_dns(),
            authentication: Authentication::ServiceAccountToken(incluster_config::token_file()),
            client: ClientConfig {
                debug: false,
                server_certificate: ServerCertificate::Secure {
                    disable_hostname_verification: false,
                    certificate: Some(incluster_config::cert_file()),
                },
            },
        }
    }

    /// Create configuration from the cluster's environment variables
    ///
    /// Like [`ClusterConfig::incluster`], with the host taken from `KUBERNETES_SERVICE_HOST`
    /// and `KUBERNETES_SERVICE_PORT`.
    pub fn from_cluster_env() -> Result<Self> {
        let server = incluster_config::kube_server().ok_or(Error::MissingInClusterVariables {
            hostenv: incluster_config::SERVICE_HOSTENV,
            portenv: incluster_config::SERVICE_PORTENV,
        })?;
        Ok(Self {
            host: parse_host(&server)?,
            ..Self::incluster()
        })
    }

    /// Infer the configuration from the environment
    ///
    /// Done by attempting to load in-cluster environment variables first, and
    /// then if that fails, trying the local kubeconfig.
    ///
    /// Fails if inference from both sources fails
    pub fn infer() -> Result<Self> {
        match Self::from_cluster_env() {
            Err(cluster_env_err) => {
                tracing::trace!("No in-cluster config found: {}", cluster_env_err);
                tracing::trace!("Falling back to local kubeconfig");
                Self::from_kubeconfig(&KubeConfigOptions::default()).map_err(|kubeconfig_err| {
                    Error::ConfigInferenceExhausted {
                        cluster_env: Box::new(cluster_env_err),
                        kubeconfig: Box::new(kubeconfig_err),
                    }
                })
            }
            success => success,
        }
    }

    /// Create configuration from the default local config file
    ///
    /// This will respect the `$KUBECONFIG` evar, but otherwise default to `~/.kube/config`.
    /// You can also customize what context/cluster/user you want to use here,
    /// but it will default to the current-context.
    pub fn from_kubeconfig(options: &KubeConfigOptions) -> Result<Self> {
        let kubeconfig = Kubeconfig::read()?;
        Self::from_custom_kubeconfig(kubeconfig, options)
    }

    /// Create configuration from a [`Kubeconfig`] struct
    pub fn from_custom_kubeconfig(kubeconfig: Kubeconfig, options: &KubeConfigOptions) -> Result<Self> {
        let loader = ConfigLoader::load(&kubeconfig, options)?;
        Self::new_from_loader(loader, &options.policy)
    }

    fn new_from_loader(loader: ConfigLoader, policy: &ResolvePolicy) -> Result<Self> {
        let host = parse_host(&loader.cluster.server)?;
        let authentication = Authentication::resolve(&loader.user_name, &loader.user)?;
        let server_certificate = ServerCertificate::resolve(&loader.cluster_name, &loader.cluster, policy)?;

        tracing::debug!(
            host = %host,
            auth = authentication.strategy(),
            namespace = loader.current_context.namespace.as_deref().unwrap_or("default"),
            "resolved cluster config from kubeconfig"
        );

        Ok(Self {
            host,
            authentication,
            client: ClientConfig {
                debug: false,
                server_certificate,
            },
        })
    }

    /// A provider that resolves this config's credential on every call.
    ///
    /// Exec plugins run as child processes and are killed after [`DEFAULT_EXEC_TIMEOUT`].
    pub fn credential_provider(&self) -> CredentialProvider {
        self.credential_provider_with(Arc::new(ProcessRunner), DEFAULT_EXEC_TIMEOUT)
    }

    /// Like [`ClusterConfig::credential_provider`], with a custom exec runner and timeout.
    pub fn credential_provider_with(&self, runner: Arc<dyn ExecRunner>, timeout: Duration) -> CredentialProvider {
        self.authentication.provider(runner, timeout)
    }
}
