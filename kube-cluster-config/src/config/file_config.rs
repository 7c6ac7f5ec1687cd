use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Deserializer};

use super::KeySource;
use crate::{Error, Result};

const KUBECONFIG: &str = "KUBECONFIG";

/// [`Kubeconfig`] represents information on how to connect to a remote Kubernetes cluster
///
/// Stored in `~/.kube/config` by default, but can be distributed across multiple paths in passed through `KUBECONFIG`.
/// An analogue of the [config type from client-go](https://github.com/kubernetes/client-go/blob/7697067af71046b18e03dbda04e01a5bb17f9809/tools/clientcmd/api/types.go)
/// after validation: required fields are guaranteed present, and every `*-data`/path pair has been
/// collapsed into a single [`KeySource`].
///
/// Cross references (context to cluster, context to user) are only checked when a context is resolved.
/// Names do not have to be unique; every sequence keeps the order of the source document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Kubeconfig {
    /// Referencable names to cluster configs
    pub clusters: Vec<NamedCluster>,
    /// Referencable names to context configs
    pub contexts: Vec<NamedContext>,
    /// Referencable names to user configs
    pub users: Vec<NamedUser>,
    /// The name of the context that you would like to use by default
    pub current_context: Option<String>,
}

/// NamedCluster associates name with cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedCluster {
    /// Name of cluster
    pub name: String,
    /// Information about how to communicate with a kubernetes cluster
    pub cluster: ClusterInfo,
}

/// Connection details of a cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInfo {
    /// The address of the kubernetes cluster (https://hostname:port).
    pub server: String,
    /// Skips the validity check for the server's certificate. This will make your HTTPS connections insecure.
    pub insecure_skip_tls_verify: bool,
    /// The certificate authority, from `certificate-authority-data` or `certificate-authority`.
    pub certificate_authority: Option<KeySource>,
}

/// NamedContext associates name with context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedContext {
    /// Name of the context
    pub name: String,
    /// Associations for the context
    pub context: ContextInfo,
}

/// Context stores tuple of cluster and user information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextInfo {
    /// Name of the cluster for this context
    pub cluster: String,
    /// Name of the user for this context
    pub user: String,
    /// The default namespace to use on unspecified requests
    pub namespace: Option<String>,
}

/// NamedUser associates name with authentication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedUser {
    /// Name of the user
    pub name: String,
    /// Information that describes identity of the user
    pub user: UserInfo,
}

/// UserInfo stores information to tell cluster who you are.
///
/// Several credentials may be set at once; see [`Authentication::resolve`](crate::auth::Authentication::resolve)
/// for which one is used.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    /// The bearer token, from `token` or `tokenFile`. If both are present, `token` takes precedence.
    pub token: Option<KeySource>,
    /// The username for basic authentication to the kubernetes cluster.
    pub username: Option<String>,
    /// The password for basic authentication to the kubernetes cluster.
    pub password: Option<KeySource>,
    /// Client certificate for TLS, from `client-certificate-data` or `client-certificate`.
    pub client_certificate: Option<KeySource>,
    /// Client key for TLS, from `client-key-data` or `client-key`.
    pub client_key: Option<KeySource>,
    /// Specifies a custom exec-based authentication plugin for the kubernetes cluster.
    pub exec: Option<ExecConfig>,
}

/// ExecConfig stores credential-plugin configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecConfig {
    /// Preferred input version of the ExecInfo.
    pub api_version: Option<String>,
    /// Command to execute.
    pub command: String,
    /// Arguments to pass to the command when executing it.
    pub args: Vec<String>,
    /// Additional environment variables to expose to the process, on top of the host's environment.
    pub env: Vec<ExecEnvVar>,
    /// Shown to the user when the command cannot be started.
    pub install_hint: Option<String>,
}

/// A single environment variable for an exec plugin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecEnvVar {
    /// Name of the variable
    pub name: String,
    /// Value of the variable
    pub value: String,
}

/// Some helpers on the Kubeconfig object are exposed for people needing to parse it
impl Kubeconfig {
    /// Read a Kubeconfig from an arbitrary location
    ///
    /// Relative file references are resolved against the directory of `path`.
    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Kubeconfig> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.into(),
            source,
        })?;
        let config = Self::from_yaml(&data)?;
        Ok(match path.parent() {
            Some(dir) => config.rebase(dir),
            None => config,
        })
    }

    /// Read a Kubeconfig from an arbitrary YAML string
    ///
    /// Multi-document YAML is parsed document by document and merged into a single `Kubeconfig`.
    /// Parsing is all-or-nothing: the first invalid document fails the whole call.
    pub fn from_yaml(text: &str) -> Result<Kubeconfig> {
        let mut merged = Kubeconfig::default();
        for doc in serde_yaml::Deserializer::from_str(text) {
            let value = serde_yaml::Value::deserialize(doc).map_err(|err| Error::parse("document", err))?;
            if value.is_null() {
                continue;
            }
            let raw: KubeconfigFile =
                serde_yaml::from_value(value).map_err(|err| Error::parse("document", err))?;
            merged = merged.merge(raw.validate()?);
        }
        Ok(merged)
    }

    /// Read a Kubeconfig from `KUBECONFIG` or the the default location.
    pub fn read() -> Result<Kubeconfig> {
        match Self::from_env()? {
            Some(config) => Ok(config),
            None => Self::read_from(default_kube_path().ok_or(Error::FindPath)?),
        }
    }

    /// Create `Kubeconfig` from `KUBECONFIG` environment variable.
    /// Supports list of files to be merged.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var_os(KUBECONFIG) {
            Some(value) => {
                let paths = std::env::split_paths(&value)
                    .filter(|p| !p.as_os_str().is_empty())
                    .collect::<Vec<_>>();
                if paths.is_empty() {
                    return Ok(None);
                }

                let merged = paths.iter().try_fold(Kubeconfig::default(), |m, p| {
                    Kubeconfig::read_from(p).map(|c| m.merge(c))
                })?;
                Ok(Some(merged))
            }

            None => Ok(None),
        }
    }

    /// Merge kubeconfig file according to the rules described in
    /// <https://kubernetes.io/docs/concepts/configuration/organize-cluster-access-kubeconfig/#merging-kubeconfig-files>
    ///
    /// > - The first file to set a particular value or map key wins.
    /// > - Never change the value or map key.
    ///
    /// Entries of `next` whose name already exists in `self` are discarded.
    pub fn merge(mut self, next: Kubeconfig) -> Self {
        append_new_named(&mut self.clusters, next.clusters, |x| &x.name);
        append_new_named(&mut self.users, next.users, |x| &x.name);
        append_new_named(&mut self.contexts, next.contexts, |x| &x.name);
        self.current_context = self.current_context.or(next.current_context);
        self
    }

    fn rebase(mut self, dir: &Path) -> Self {
        for named in &mut self.clusters {
            rebase_in_place(&mut named.cluster.certificate_authority, dir);
        }
        for named in &mut self.users {
            let user = &mut named.user;
            rebase_in_place(&mut user.token, dir);
            rebase_in_place(&mut user.client_certificate, dir);
            rebase_in_place(&mut user.client_key, dir);
        }
        self
    }
}

impl FromStr for Kubeconfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_yaml(s)
    }
}

fn rebase_in_place(source: &mut Option<KeySource>, dir: &Path) {
    *source = source.take().map(|s| s.rebase(dir));
}

#[allow(clippy::redundant_closure)]
fn append_new_named<T, F>(base: &mut Vec<T>, next: Vec<T>, f: F)
where
    F: Fn(&T) -> &String,
{
    base.extend({
        let existing = base.iter().map(|x| f(x)).collect::<HashSet<_>>();
        next.into_iter()
            .filter(|x| !existing.contains(f(x)))
            .collect::<Vec<_>>()
    });
}

/// Returns kubeconfig path from `$HOME/.kube/config`.
fn default_kube_path() -> Option<PathBuf> {
    home::home_dir().map(|h| h.join(".kube").join("config"))
}

// The on-disk shape. Everything is optional here so that a missing field can be
// reported with its full path instead of a generic serde message.

#[derive(Deserialize, Default)]
struct KubeconfigFile {
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    clusters: Vec<ClusterEntry>,
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    contexts: Vec<ContextEntry>,
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    users: Vec<UserEntry>,
    #[serde(rename = "current-context")]
    current_context: Option<String>,
}

#[derive(Deserialize)]
struct ClusterEntry {
    name: Option<String>,
    cluster: Option<ClusterFields>,
}

#[derive(Deserialize)]
struct ClusterFields {
    server: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify")]
    insecure_skip_tls_verify: Option<bool>,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<String>,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
}

#[derive(Deserialize)]
struct ContextEntry {
    name: Option<String>,
    context: Option<ContextFields>,
}

#[derive(Deserialize)]
struct ContextFields {
    cluster: Option<String>,
    user: Option<String>,
    namespace: Option<String>,
}

#[derive(Deserialize)]
struct UserEntry {
    name: Option<String>,
    user: Option<UserFields>,
}

#[derive(Deserialize, Default)]
struct UserFields {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<String>,
    #[serde(rename = "client-certificate")]
    client_certificate: Option<String>,
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key")]
    client_key: Option<String>,
    #[serde(rename = "client-key-data")]
    client_key_data: Option<String>,
    exec: Option<ExecFields>,
}

#[derive(Deserialize)]
struct ExecFields {
    #[serde(rename = "apiVersion")]
    api_version: Option<String>,
    command: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    args: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    env: Vec<EnvFields>,
    #[serde(rename = "installHint")]
    install_hint: Option<String>,
}

#[derive(Deserialize)]
struct EnvFields {
    name: Option<String>,
    value: Option<String>,
}

fn deserialize_null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

fn required(value: Option<String>, field: impl FnOnce() -> String) -> Result<String> {
    value.ok_or_else(|| Error::parse(field(), "missing required field"))
}

impl KubeconfigFile {
    fn validate(self) -> Result<Kubeconfig> {
        let clusters = self
            .clusters
            .into_iter()
            .enumerate()
            .map(|(i, entry)| entry.validate(&format!("clusters[{i}]")))
            .collect::<Result<_>>()?;
        let contexts = self
            .contexts
            .into_iter()
            .enumerate()
            .map(|(i, entry)| entry.validate(&format!("contexts[{i}]")))
            .collect::<Result<_>>()?;
        let users = self
            .users
            .into_iter()
            .enumerate()
            .map(|(i, entry)| entry.validate(&format!("users[{i}]")))
            .collect::<Result<_>>()?;
        Ok(Kubeconfig {
            clusters,
            contexts,
            users,
            current_context: self.current_context.filter(|c| !c.is_empty()),
        })
    }
}

impl ClusterEntry {
    fn validate(self, at: &str) -> Result<NamedCluster> {
        let name = required(self.name, || format!("{at}.name"))?;
        let fields = self
            .cluster
            .ok_or_else(|| Error::parse(format!("{at}.cluster"), "missing required field"))?;
        let server = required(fields.server, || format!("{at}.cluster.server"))?;
        let certificate_authority = KeySource::from_base64_or_file(
            &format!("{at}.cluster.certificate-authority-data"),
            fields.certificate_authority_data.as_deref(),
            fields.certificate_authority.as_deref(),
        )?;
        Ok(NamedCluster {
            name,
            cluster: ClusterInfo {
                server,
                insecure_skip_tls_verify: fields.insecure_skip_tls_verify.unwrap_or(false),
                certificate_authority,
            },
        })
    }
}

impl ContextEntry {
    fn validate(self, at: &str) -> Result<NamedContext> {
        let name = required(self.name, || format!("{at}.name"))?;
        let fields = self
            .context
            .ok_or_else(|| Error::parse(format!("{at}.context"), "missing required field"))?;
        Ok(NamedContext {
            name,
            context: ContextInfo {
                cluster: required(fields.cluster, || format!("{at}.context.cluster"))?,
                user: required(fields.user, || format!("{at}.context.user"))?,
                namespace: fields.namespace,
            },
        })
    }
}

impl UserEntry {
    fn validate(self, at: &str) -> Result<NamedUser> {
        let name = required(self.name, || format!("{at}.name"))?;
        // `user: {}` and an absent `user` both mean "no credentials"
        let fields = self.user.unwrap_or_default();
        let exec = fields
            .exec
            .map(|exec| exec.validate(&format!("{at}.user.exec")))
            .transpose()?;
        Ok(NamedUser {
            name,
            user: UserInfo {
                token: KeySource::from_literal_or_file(fields.token.as_deref(), fields.token_file.as_deref()),
                username: fields.username,
                password: KeySource::from_literal_or_file(fields.password.as_deref(), None),
                client_certificate: KeySource::from_base64_or_file(
                    &format!("{at}.user.client-certificate-data"),
                    fields.client_certificate_data.as_deref(),
                    fields.client_certificate.as_deref(),
                )?,
                client_key: KeySource::from_base64_or_file(
                    &format!("{at}.user.client-key-data"),
                    fields.client_key_data.as_deref(),
                    fields.client_key.as_deref(),
                )?,
                exec,
            },
        })
    }
}

impl ExecFields {
    fn validate(self, at: &str) -> Result<ExecConfig> {
        let command = required(self.command, || format!("{at}.command"))?;
        let env = self
            .env
            .into_iter()
            .enumerate()
            .map(|(i, var)| {
                Ok(ExecEnvVar {
                    name: required(var.name, || format!("{at}.env[{i}].name"))?,
                    value: required(var.value, || format!("{at}.env[{i}].value"))?,
                })
            })
            .collect::<Result<_>>()?;
        Ok(ExecConfig {
            api_version: self.api_version,
            command,
            args: self.args,
            env,
            install_hint: self.install_hint,
        })
    }
}
