//! Authentication strategies and the credentials they produce
//!
//! An [`Authentication`] only describes where a credential comes from. Nothing is read or executed
//! until [`Authentication::credential`] is called, and nothing is cached afterwards: service account
//! tokens and exec plugin tokens rotate, so every use should go through a [`CredentialProvider`].
use std::{fmt, sync::Arc, time::Duration};

use http::{header::HeaderValue, Uri};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    config::{CertificateAuthorityPolicy, ClusterInfo, ExecConfig, KeySource, ResolvePolicy, UserInfo},
    Error, Result,
};

pub mod exec;
pub use exec::{ExecRunner, ProcessRunner};

/// How requests are authenticated against the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Authentication {
    /// Bearer token read from the source on every use
    ServiceAccountToken(KeySource),
    /// HTTP basic auth
    BasicAuth {
        /// Username
        username: String,
        /// Password
        password: KeySource,
    },
    /// Mutual TLS with a client certificate and its private key
    ClientCertificates {
        /// PEM encoded certificate
        certificate: KeySource,
        /// PEM encoded private key
        key: KeySource,
    },
    /// Bearer token obtained by running a credential plugin on every use
    ExecPlugin(ExecConfig),
}

/// How the server's TLS certificate is verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerCertificate {
    /// No verification at all
    Insecure,
    /// Verify the chain, optionally against a specific certificate authority
    Secure {
        /// Skip checking that the certificate matches the host name
        disable_hostname_verification: bool,
        /// The trusted certificate authority. `None` defers to the platform trust store.
        certificate: Option<KeySource>,
    },
}

/// A usable credential, obtained from an [`Authentication`].
///
/// Hand it to the transport and drop it; obtain a fresh one for later requests.
#[derive(Clone, Debug)]
pub enum Credential {
    /// `Authorization: Bearer` token
    Bearer(SecretString),
    /// `Authorization: Basic` credentials
    Basic {
        /// Username
        username: String,
        /// Password
        password: SecretString,
    },
    /// Client identity for the TLS handshake
    ClientCertificate {
        /// PEM encoded certificate chain
        certificate: Vec<u8>,
        /// PEM encoded private key
        key: SecretString,
    },
}

impl Authentication {
    /// Pick the authentication strategy for `user`.
    ///
    /// The first populated option wins, in this order:
    /// 1. `token` (or `tokenFile`)
    /// 2. `client-certificate` together with `client-key`
    /// 3. `username` together with `password`
    /// 4. `exec`
    ///
    /// The exec plugin is not run here.
    pub fn resolve(user_name: &str, user: &UserInfo) -> Result<Self> {
        if let Some(token) = &user.token {
            return Ok(Self::ServiceAccountToken(token.clone()));
        }

        match (&user.client_certificate, &user.client_key) {
            (Some(certificate), Some(key)) => {
                return Ok(Self::ClientCertificates {
                    certificate: certificate.clone(),
                    key: key.clone(),
                })
            }
            (None, None) => {}
            _ => tracing::warn!(user = %user_name, "ignoring client certificate without a matching key"),
        }

        match (&user.username, &user.password) {
            (Some(username), Some(password)) => {
                return Ok(Self::BasicAuth {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            (None, None) => {}
            _ => tracing::warn!(user = %user_name, "ignoring username without a matching password"),
        }

        if let Some(exec) = &user.exec {
            return Ok(Self::ExecPlugin(exec.clone()));
        }

        Err(Error::NotFound {
            kind: "authentication",
            name: user_name.to_owned(),
        })
    }

    /// Short name of the strategy, safe to log.
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::ServiceAccountToken(_) => "service-account-token",
            Self::BasicAuth { .. } => "basic-auth",
            Self::ClientCertificates { .. } => "client-certificates",
            Self::ExecPlugin(_) => "exec-plugin",
        }
    }

    /// Obtain a credential now, reading files or running the exec plugin as needed.
    pub fn credential(&self, runner: &dyn ExecRunner, timeout: Duration) -> Result<Credential> {
        match self {
            Self::ServiceAccountToken(source) => {
                let token = source.resolve_secret()?;
                Ok(Credential::Bearer(SecretString::from(token.expose_secret().trim().to_owned())))
            }
            Self::BasicAuth { username, password } => Ok(Credential::Basic {
                username: username.clone(),
                password: password.resolve_secret()?,
            }),
            Self::ClientCertificates { certificate, key } => Ok(Credential::ClientCertificate {
                certificate: certificate.resolve()?,
                key: key.resolve_secret()?,
            }),
            Self::ExecPlugin(config) => Ok(Credential::Bearer(exec::run(config, runner, timeout)?.token)),
        }
    }

    /// Wrap [`Authentication::credential`] in a function value that re-resolves on every call.
    pub fn provider(&self, runner: Arc<dyn ExecRunner>, timeout: Duration) -> CredentialProvider {
        let auth = self.clone();
        CredentialProvider::new(move || auth.credential(runner.as_ref(), timeout))
    }
}

impl ServerCertificate {
    /// Decide how to verify the server of `cluster`.
    ///
    /// `insecure-skip-tls-verify` wins over any configured certificate authority.
    /// A missing certificate authority means the platform trust store, unless `policy` requires one.
    pub fn resolve(cluster_name: &str, cluster: &ClusterInfo, policy: &ResolvePolicy) -> Result<Self> {
        if cluster.insecure_skip_tls_verify {
            if cluster.certificate_authority.is_some() {
                tracing::debug!(cluster = %cluster_name, "certificate authority ignored for insecure cluster");
            }
            return Ok(Self::Insecure);
        }
        Self::secure(
            cluster.certificate_authority.clone(),
            false,
            policy,
            || format!("clusters[{cluster_name}].certificate-authority"),
        )
    }

    pub(crate) fn secure(
        certificate: Option<KeySource>,
        disable_hostname_verification: bool,
        policy: &ResolvePolicy,
        field: impl FnOnce() -> String,
    ) -> Result<Self> {
        if certificate.is_none() && policy.missing_certificate_authority == CertificateAuthorityPolicy::Required
        {
            return Err(Error::missing(field()));
        }
        Ok(Self::Secure {
            disable_hostname_verification,
            certificate,
        })
    }

    /// DER encoded root certificates to trust, if a specific certificate authority is configured.
    pub fn root_certificates(&self) -> Result<Option<Vec<Vec<u8>>>> {
        match self {
            Self::Secure {
                certificate: Some(source),
                ..
            } => source.resolve_certificates().map(Some),
            _ => Ok(None),
        }
    }
}

impl Credential {
    /// The `Authorization` header for this credential, if it is carried in one.
    ///
    /// The returned value is marked sensitive.
    pub fn authorization_header(&self) -> Result<Option<HeaderValue>> {
        let raw = match self {
            Self::Bearer(token) => format!("Bearer {}", token.expose_secret()),
            Self::Basic { username, password } => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{}", password.expose_secret()));
                format!("Basic {encoded}")
            }
            Self::ClientCertificate { .. } => return Ok(None),
        };
        let mut value = HeaderValue::try_from(raw).map_err(Error::InvalidHeader)?;
        value.set_sensitive(true);
        Ok(Some(value))
    }
}

/// A function value producing a fresh [`Credential`] on every call.
///
/// Cloning is cheap and clones share nothing mutable.
#[derive(Clone)]
pub struct CredentialProvider {
    inner: Arc<dyn Fn() -> Result<Credential> + Send + Sync>,
}

impl CredentialProvider {
    /// Wrap an arbitrary credential source.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Result<Credential> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Resolve a credential now.
    pub fn credential(&self) -> Result<Credential> {
        (self.inner)()
    }
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider").finish_non_exhaustive()
    }
}

pub(crate) fn parse_host(raw: &str) -> Result<Uri> {
    raw.parse::<Uri>().map_err(|source| Error::InvalidUri {
        raw: raw.to_owned(),
        source,
    })
}
