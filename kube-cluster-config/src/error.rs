//! Error handling in [`kube-cluster-config`][crate]
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
// Redundant with the error messages and machine names
#[allow(missing_docs)]
/// Possible errors when resolving a cluster configuration
///
/// None of the variants ever carry resolved secret material.
pub enum Error {
    #[error("Failed to parse kubeconfig at `{field}`: {reason}")]
    Parse { field: String, reason: String },

    #[error("Invalid server uri '{raw}': {source}")]
    InvalidUri {
        raw: String,
        #[source]
        source: http::uri::InvalidUri,
    },

    #[error("Unable to find {kind} '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("Found more than one {kind} named '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Failed to determine current context")]
    CurrentContextNotSet,

    #[error("More than one alternative is set for `{field}`")]
    AmbiguousConfig { field: String },

    #[error("No value is set for `{field}`")]
    MissingConfig { field: String },

    #[error("Failed to decode structured config: {0}")]
    StructuredConfig(#[source] config::ConfigError),

    #[error("Failed to read '{path:?}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse PEM-encoded certificates: {0}")]
    ParseCertificates(#[source] pem::PemError),

    #[error("Unable to run exec plugin '{command}': {source}{}", hint_suffix(.install_hint))]
    ExecStart {
        command: String,
        install_hint: Option<String>,
        #[source]
        source: std::io::Error,
    },

    #[error("Exec plugin '{command}' failed (exit code: {exit_code:?}, timed out: {timed_out}): {stderr}")]
    ExecutionFailed {
        command: String,
        exit_code: Option<i32>,
        timed_out: bool,
        stderr: String,
    },

    #[error("Failed to wait for exec plugin '{command}': {source}")]
    ExecWait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid ExecCredential: {reason}")]
    ExecCredential { reason: String },

    #[error("Invalid authorization header value: {0}")]
    InvalidHeader(#[source] http::header::InvalidHeaderValue),

    #[error("Unable to load in cluster config, {hostenv} and {portenv} must be defined")]
    MissingInClusterVariables {
        hostenv: &'static str,
        portenv: &'static str,
    },

    #[error("Unable to find path of kubeconfig")]
    FindPath,

    #[error("Failed to infer config.. cluster env: ({cluster_env}), kubeconfig: ({kubeconfig})")]
    ConfigInferenceExhausted {
        cluster_env: Box<Error>,
        // We can only pick one source, but the kubeconfig failure is more likely to be a user error
        #[source]
        kubeconfig: Box<Error>,
    },
}

impl Error {
    /// Whether the error came from an exec plugin that ran past its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ExecutionFailed { timed_out: true, .. })
    }

    pub(crate) fn parse(field: impl Into<String>, reason: impl ToString) -> Self {
        Error::Parse {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn missing(field: impl Into<String>) -> Self {
        Error::MissingConfig { field: field.into() }
    }
}

fn hint_suffix(install_hint: &Option<String>) -> String {
    install_hint
        .as_ref()
        .map(|hint| format!("\n\n{hint}"))
        .unwrap_or_default()
}
