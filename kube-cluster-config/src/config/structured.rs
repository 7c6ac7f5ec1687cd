//! Decoding a [`ClusterConfig`] from hierarchical application settings
//!
//! The settings are read with the [`config`] crate, so any source it supports (files in YAML,
//! TOML or JSON, environment overrides, ...) can feed the decoder. Each sum type is spelled as a
//! set of mutually exclusive sub-keys:
//!
//! ```yaml
//! host: https://kubernetes.default.svc
//! authentication:
//!   serviceAccountToken:
//!     path: /var/run/secrets/kubernetes.io/serviceaccount/token
//!   # or basicAuth: { username, password }
//!   # or clientCertificates: { certificate: { path }, key: { path } }
//! client:
//!   debug: false
//!   secure:
//!     certificate:
//!       path: /var/run/secrets/kubernetes.io/serviceaccount/ca.crt
//!     disableHostnameVerification: false
//!   # or insecure: true
//! ```
use std::{fmt, path::PathBuf};

use serde::{
    de::{self, IgnoredAny, MapAccess, Visitor},
    Deserialize, Deserializer,
};

use super::{ClientConfig, ClusterConfig, KeySource, ResolvePolicy};
use crate::{
    auth::{parse_host, Authentication, ServerCertificate},
    Error, Result,
};

// Older `config` releases lowercase every key, hence the aliases on camelCase names.

#[derive(Deserialize)]
struct StructuredConfig {
    host: Option<String>,
    authentication: Option<AuthenticationFields>,
    #[serde(default)]
    client: ClientFields,
}

#[derive(Deserialize)]
struct AuthenticationFields {
    #[serde(rename = "serviceAccountToken", alias = "serviceaccounttoken")]
    service_account_token: Option<PathField>,
    #[serde(rename = "basicAuth", alias = "basicauth")]
    basic_auth: Option<BasicAuthFields>,
    #[serde(rename = "clientCertificates", alias = "clientcertificates")]
    client_certificates: Option<ClientCertificatesFields>,
}

#[derive(Deserialize)]
struct PathField {
    path: Option<String>,
}

#[derive(Deserialize)]
struct BasicAuthFields {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
struct ClientCertificatesFields {
    certificate: Option<PathField>,
    key: Option<PathField>,
}

#[derive(Deserialize, Default)]
struct ClientFields {
    #[serde(default)]
    debug: bool,
    secure: Option<SecureFields>,
    insecure: Option<Toggle>,
}

#[derive(Deserialize)]
struct SecureFields {
    certificate: Option<PathField>,
    #[serde(
        default,
        rename = "disableHostnameVerification",
        alias = "disablehostnameverification"
    )]
    disable_hostname_verification: bool,
}

/// `insecure: true` and a table under `insecure` both select the insecure alternative.
enum Toggle {
    Flag(bool),
    Table,
}

impl Toggle {
    fn is_set(&self) -> bool {
        match self {
            Toggle::Flag(flag) => *flag,
            Toggle::Table => true,
        }
    }
}

impl<'de> Deserialize<'de> for Toggle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ToggleVisitor;

        impl<'de> Visitor<'de> for ToggleVisitor {
            type Value = Toggle;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a boolean or a table")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Toggle, E> {
                Ok(Toggle::Flag(v))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Toggle, A::Error> {
                while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
                Ok(Toggle::Table)
            }
        }

        deserializer.deserialize_any(ToggleVisitor)
    }
}

fn required_path(field: Option<PathField>, name: &str) -> Result<KeySource> {
    field
        .and_then(|f| f.path)
        .filter(|p| !p.is_empty())
        .map(|p| KeySource::FromFile(PathBuf::from(p)))
        .ok_or_else(|| Error::missing(format!("{name}.path")))
}

impl StructuredConfig {
    fn into_cluster_config(self, policy: &ResolvePolicy) -> Result<ClusterConfig> {
        let raw_host = self.host.filter(|h| !h.is_empty()).ok_or_else(|| Error::missing("host"))?;
        let host = parse_host(&raw_host)?;
        let authentication = self
            .authentication
            .ok_or_else(|| Error::missing("authentication"))?
            .into_authentication()?;
        let server_certificate = self.client.server_certificate(policy)?;
        Ok(ClusterConfig {
            host,
            authentication,
            client: ClientConfig {
                debug: self.client.debug,
                server_certificate,
            },
        })
    }
}

impl AuthenticationFields {
    fn into_authentication(self) -> Result<Authentication> {
        match (self.service_account_token, self.basic_auth, self.client_certificates) {
            (Some(token), None, None) => Ok(Authentication::ServiceAccountToken(required_path(
                Some(token),
                "authentication.serviceAccountToken",
            )?)),
            (None, Some(basic), None) => {
                let username = basic
                    .username
                    .ok_or_else(|| Error::missing("authentication.basicAuth.username"))?;
                let password = basic
                    .password
                    .ok_or_else(|| Error::missing("authentication.basicAuth.password"))?;
                Ok(Authentication::BasicAuth {
                    username,
                    password: KeySource::literal(password),
                })
            }
            (None, None, Some(certs)) => Ok(Authentication::ClientCertificates {
                certificate: required_path(
                    certs.certificate,
                    "authentication.clientCertificates.certificate",
                )?,
                key: required_path(certs.key, "authentication.clientCertificates.key")?,
            }),
            (None, None, None) => Err(Error::missing("authentication")),
            _ => Err(Error::AmbiguousConfig {
                field: "authentication".into(),
            }),
        }
    }
}

impl ClientFields {
    fn server_certificate(&self, policy: &ResolvePolicy) -> Result<ServerCertificate> {
        let insecure = self.insecure.as_ref().is_some_and(Toggle::is_set);
        match (&self.secure, insecure) {
            (Some(_), true) => Err(Error::AmbiguousConfig {
                field: "client".into(),
            }),
            (None, true) => Ok(ServerCertificate::Insecure),
            (Some(secure), false) => {
                let certificate = secure
                    .certificate
                    .as_ref()
                    .and_then(|c| c.path.as_deref())
                    .filter(|p| !p.is_empty())
                    .map(|p| KeySource::FromFile(PathBuf::from(p)));
                ServerCertificate::secure(
                    certificate,
                    secure.disable_hostname_verification,
                    policy,
                    || "client.secure.certificate.path".into(),
                )
            }
            (None, false) => Err(Error::missing("client.secure")),
        }
    }
}

impl ClusterConfig {
    /// Decode from application settings, with the default [`ResolvePolicy`].
    pub fn from_structured(settings: &config::Config) -> Result<Self> {
        Self::from_structured_with(settings, &ResolvePolicy::default())
    }

    /// Decode from application settings.
    ///
    /// Fails with [`Error::AmbiguousConfig`] when more than one alternative of a sum type is set,
    /// and with [`Error::MissingConfig`] when none is.
    pub fn from_structured_with(settings: &config::Config, policy: &ResolvePolicy) -> Result<Self> {
        let raw: StructuredConfig = settings.clone().try_deserialize().map_err(Error::StructuredConfig)?;
        let config = raw.into_cluster_config(policy)?;
        tracing::debug!(
            host = %config.host,
            auth = config.authentication.strategy(),
            "decoded structured cluster config"
        );
        Ok(config)
    }

    /// Decode from a settings document held in memory.
    pub fn from_structured_str(text: &str, format: config::FileFormat) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, format))
            .build()
            .map_err(Error::StructuredConfig)?;
        Self::from_structured(&settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertificateAuthorityPolicy;
    use config::FileFormat;

    const FIXTURE: &str = r#"
host: https://kubernetes.default.svc
authentication:
  serviceAccountToken:
    path: /var/run/secrets/kubernetes.io/serviceaccount/token
client:
  debug: false
  secure:
    certificate:
      path: /var/run/secrets/kubernetes.io/serviceaccount/ca.crt
    disableHostnameVerification: false
"#;

    #[test]
    fn decodes_service_account_fixture() {
        let config = ClusterConfig::from_structured_str(FIXTURE, FileFormat::Yaml).unwrap();
        assert_eq!(config, ClusterConfig {
            host: "https://kubernetes.default.svc".parse().unwrap(),
            authentication: Authentication::ServiceAccountToken(KeySource::FromFile(
                "/var/run/secrets/kubernetes.io/serviceaccount/token".into()
            )),
            client: ClientConfig {
                debug: false,
                server_certificate: ServerCertificate::Secure {
                    disable_hostname_verification: false,
                    certificate: Some(KeySource::FromFile(
                        "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".into()
                    )),
                },
            },
        });
    }

    #[test]
    fn decodes_toml_with_basic_auth_and_insecure() {
        let text = r#"
host = "https://10.0.0.1:6443"

[authentication.basicAuth]
username = "admin"
password = "secret"

[client]
debug = true
insecure = true
"#;
        let config = ClusterConfig::from_structured_str(text, FileFormat::Toml).unwrap();
        assert!(config.client.debug);
        assert_eq!(config.client.server_certificate, ServerCertificate::Insecure);
        assert_eq!(config.authentication, Authentication::BasicAuth {
            username: "admin".into(),
            password: KeySource::literal("secret"),
        });
    }

    #[test]
    fn insecure_accepts_a_table_or_false() {
        let text = "host: https://10.0.0.1\nauthentication:\n  basicAuth:\n    username: a\n    password: b\nclient:\n  insecure:\n    reason: lab cluster\n";
        let config = ClusterConfig::from_structured_str(text, FileFormat::Yaml).unwrap();
        assert_eq!(config.client.server_certificate, ServerCertificate::Insecure);

        let text = format!("{FIXTURE}  insecure: false\n");
        let config = ClusterConfig::from_structured_str(&text, FileFormat::Yaml).unwrap();
        assert!(matches!(config.client.server_certificate, ServerCertificate::Secure { .. }));
    }

    #[test]
    fn insecure_rejects_other_values() {
        let text = format!("{FIXTURE}  insecure: 3\n");
        assert!(matches!(
            ClusterConfig::from_structured_str(&text, FileFormat::Yaml),
            Err(Error::StructuredConfig(_))
        ));
    }

    #[test]
    fn debug_defaults_to_false() {
        let text = FIXTURE.replace("  debug: false\n", "");
        let config = ClusterConfig::from_structured_str(&text, FileFormat::Yaml).unwrap();
        assert!(!config.client.debug);
    }

    #[test]
    fn secure_and_insecure_is_ambiguous() {
        let text = format!("{FIXTURE}  insecure: true\n");
        match ClusterConfig::from_structured_str(&text, FileFormat::Yaml).unwrap_err() {
            Error::AmbiguousConfig { field } => assert_eq!(field, "client"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn two_authentications_is_ambiguous() {
        let text = FIXTURE.replace(
            "authentication:\n",
            "authentication:\n  basicAuth:\n    username: a\n    password: b\n",
        );
        match ClusterConfig::from_structured_str(&text, FileFormat::Yaml).unwrap_err() {
            Error::AmbiguousConfig { field } => assert_eq!(field, "authentication"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_alternatives_are_reported() {
        let text = r#"
host: https://kubernetes.default.svc
authentication:
  clientCertificates:
    certificate:
      path: /tls/client.crt
client:
  insecure: true
"#;
        match ClusterConfig::from_structured_str(text, FileFormat::Yaml).unwrap_err() {
            Error::MissingConfig { field } => assert_eq!(field, "authentication.clientCertificates.key.path"),
            other => panic!("unexpected error {other:?}"),
        }

        let text = "host: https://kubernetes.default.svc\nauthentication:\n  basicAuth:\n    username: a\n    password: b\n";
        match ClusterConfig::from_structured_str(text, FileFormat::Yaml).unwrap_err() {
            Error::MissingConfig { field } => assert_eq!(field, "client.secure"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn secure_without_certificate_follows_policy() {
        let text = FIXTURE.replace(
            "    certificate:\n      path: /var/run/secrets/kubernetes.io/serviceaccount/ca.crt\n",
            "",
        );
        let config = ClusterConfig::from_structured_str(&text, FileFormat::Yaml).unwrap();
        assert_eq!(config.client.server_certificate, ServerCertificate::Secure {
            disable_hostname_verification: false,
            certificate: None,
        });

        let settings = config::Config::builder()
            .add_source(config::File::from_str(&text, FileFormat::Yaml))
            .build()
            .unwrap();
        let strict = ResolvePolicy {
            missing_certificate_authority: CertificateAuthorityPolicy::Required,
            ..Default::default()
        };
        match ClusterConfig::from_structured_with(&settings, &strict).unwrap_err() {
            Error::MissingConfig { field } => assert_eq!(field, "client.secure.certificate.path"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn invalid_host_is_rejected() {
        let text = FIXTURE.replace("https://kubernetes.default.svc", "https://bad host");
        assert!(matches!(
            ClusterConfig::from_structured_str(&text, FileFormat::Yaml),
            Err(Error::InvalidUri { .. })
        ));
    }
}
