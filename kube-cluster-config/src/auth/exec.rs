//! Client-go style exec credential plugins
//!
//! See <https://kubernetes.io/docs/reference/access-authn-authz/authentication/#client-go-credential-plugins>
use std::{
    io::{self, Read},
    process::{Child, Command, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::{config::ExecConfig, Error, Result};

const EXEC_INFO_ENV: &str = "KUBERNETES_EXEC_INFO";
const EXEC_CREDENTIAL_KIND: &str = "ExecCredential";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single process invocation requested by [`run`].
#[derive(Clone, Debug)]
pub struct ExecInvocation<'a> {
    /// Program to start
    pub command: &'a str,
    /// Arguments, in order
    pub args: &'a [String],
    /// Variables added on top of the inherited environment, later entries win
    pub env: Vec<(String, String)>,
    /// Shown when the command cannot be started
    pub install_hint: Option<&'a str>,
}

/// What a finished process left behind.
#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    /// Exit code, `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: Vec<u8>,
    /// Captured standard error
    pub stderr: Vec<u8>,
}

/// Capability to start a credential plugin and wait for it.
///
/// [`ProcessRunner`] spawns real processes. Tests can substitute their own implementation.
pub trait ExecRunner: Send + Sync {
    /// Run the invocation to completion.
    ///
    /// Must fail with [`Error::ExecutionFailed`] and `timed_out: true` when `timeout` elapses first.
    fn run(&self, invocation: &ExecInvocation<'_>, timeout: Duration) -> Result<ExecOutput>;
}

/// [`ExecRunner`] backed by [`std::process::Command`].
///
/// The child inherits the current environment, gets a null stdin, and is killed once the timeout elapses.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

impl ExecRunner for ProcessRunner {
    fn run(&self, invocation: &ExecInvocation<'_>, timeout: Duration) -> Result<ExecOutput> {
        let mut child = Command::new(invocation.command)
            .args(invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::ExecStart {
                command: invocation.command.to_owned(),
                install_hint: invocation.install_hint.map(str::to_owned),
                source,
            })?;

        // Drain both pipes off-thread while polling for exit
        let mut stdout = PipeReader::spawn(child.stdout.take());
        let mut stderr = PipeReader::spawn(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(timed_out(invocation.command, stderr));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => return Err(wait_failed(invocation.command, &mut child, source)),
            }
        };

        // Anything the plugin left running in the background may still hold the pipes open
        if !(stdout.finish(deadline) && stderr.finish(deadline)) {
            return Err(timed_out(invocation.command, stderr));
        }

        Ok(ExecOutput {
            exit_code: status.code(),
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
        })
    }
}

fn timed_out(command: &str, stderr: PipeReader) -> Error {
    Error::ExecutionFailed {
        command: command.to_owned(),
        exit_code: None,
        timed_out: true,
        stderr: String::from_utf8_lossy(&stderr.into_bytes()).trim().to_owned(),
    }
}

fn wait_failed(command: &str, child: &mut Child, source: io::Error) -> Error {
    let _ = child.kill();
    let _ = child.wait();
    Error::ExecWait {
        command: command.to_owned(),
        source,
    }
}

/// Output of one pipe, read on a helper thread and handed over in chunks.
struct PipeReader {
    chunks: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        let (tx, chunks) = mpsc::channel();
        if let Some(mut pipe) = pipe {
            thread::spawn(move || {
                let mut chunk = [0; 4096];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(chunk[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => break,
                    }
                }
            });
        }
        Self {
            chunks,
            buf: Vec::new(),
        }
    }

    /// Collect until the pipe closes. Returns `false` if `deadline` passes first.
    fn finish(&mut self, deadline: Instant) -> bool {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.chunks.recv_timeout(deadline - now) {
                Ok(chunk) => self.buf.extend(chunk),
                Err(mpsc::RecvTimeoutError::Disconnected) => return true,
                Err(mpsc::RecvTimeoutError::Timeout) => return false,
            }
        }
    }

    /// Everything received so far, without waiting for more.
    fn into_bytes(mut self) -> Vec<u8> {
        self.buf.extend(self.chunks.try_iter().flatten());
        self.buf
    }
}

/// ExecCredentials is used by exec-based plugins to communicate credentials to
/// HTTP transports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecCredential {
    /// Should always be `ExecCredential`
    pub kind: Option<String>,
    /// Version of the `client.authentication.k8s.io` API
    #[serde(rename = "apiVersion")]
    pub api_version: Option<String>,
    /// Request information passed to the plugin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<ExecCredentialSpec>,
    /// Credentials returned by the plugin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecCredentialStatus>,
}

/// ExecCredentialSpec holds request and runtime specific information provided
/// by transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecCredentialSpec {
    /// Whether stdin is available to the plugin
    #[serde(default)]
    pub interactive: bool,
}

/// ExecCredentialStatus holds credentials for the transport to use.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecCredentialStatus {
    /// When the returned token stops being valid
    #[serde(rename = "expirationTimestamp")]
    pub expiration_timestamp: Option<String>,
    /// Bearer token
    pub token: Option<String>,
}

/// A bearer token obtained from an exec plugin.
#[derive(Clone, Debug)]
pub struct ExecToken {
    /// The token itself
    pub token: SecretString,
    /// When the plugin said the token expires, if it did
    pub expiration_timestamp: Option<DateTime<Utc>>,
}

/// Invoke the plugin described by `config` once and extract its bearer token.
///
/// The plugin is run exactly once; failures are returned to the caller as they are.
pub fn run(config: &ExecConfig, runner: &dyn ExecRunner, timeout: Duration) -> Result<ExecToken> {
    let invocation = ExecInvocation {
        command: &config.command,
        args: &config.args,
        env: exec_env(config)?,
        install_hint: config.install_hint.as_deref(),
    };
    tracing::debug!(command = %config.command, ?timeout, "running exec credential plugin");

    let out = runner.run(&invocation, timeout)?;
    if out.exit_code != Some(0) {
        return Err(Error::ExecutionFailed {
            command: config.command.clone(),
            exit_code: out.exit_code,
            timed_out: false,
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
        });
    }
    parse_credential(&out.stdout)
}

fn exec_env(config: &ExecConfig) -> Result<Vec<(String, String)>> {
    let info = ExecCredential {
        kind: Some(EXEC_CREDENTIAL_KIND.into()),
        api_version: config.api_version.clone(),
        spec: Some(ExecCredentialSpec { interactive: false }),
        status: None,
    };
    let info = serde_json::to_string(&info).map_err(|err| Error::ExecCredential {
        reason: format!("failed to encode {EXEC_INFO_ENV}: {err}"),
    })?;

    let mut env = vec![(EXEC_INFO_ENV.to_owned(), info)];
    env.extend(config.env.iter().map(|var| (var.name.clone(), var.value.clone())));
    Ok(env)
}

fn parse_credential(stdout: &[u8]) -> Result<ExecToken> {
    let creds: ExecCredential = serde_json::from_slice(stdout).map_err(|err| Error::ExecCredential {
        reason: format!("malformed output: {err}"),
    })?;
    match creds.kind.as_deref() {
        Some(EXEC_CREDENTIAL_KIND) => {}
        other => {
            return Err(Error::ExecCredential {
                reason: format!("unexpected kind {other:?}"),
            })
        }
    }

    let status = creds.status.ok_or_else(|| Error::ExecCredential {
        reason: "missing status".into(),
    })?;
    let expiration_timestamp = status
        .expiration_timestamp
        .as_deref()
        .map(DateTime::parse_from_rfc3339)
        .transpose()
        .map_err(|err| Error::ExecCredential {
            reason: format!("malformed status.expirationTimestamp: {err}"),
        })?
        .map(|ts| ts.with_timezone(&Utc));
    if let Some(expiry) = expiration_timestamp {
        if expiry <= Utc::now() {
            tracing::warn!(%expiry, "exec plugin returned an already expired token");
        }
    }

    let token = status
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::ExecCredential {
            reason: "missing status.token".into(),
        })?;
    Ok(ExecToken {
        token: SecretString::from(token),
        expiration_timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecEnvVar;
    use secrecy::ExposeSecret;
    use std::sync::Mutex;

    /// Replays a canned output and records what it was asked to run
    #[derive(Default)]
    struct FakeRunner {
        output: ExecOutput,
        seen: Mutex<Vec<(String, Vec<String>, Vec<(String, String)>)>>,
    }

    impl FakeRunner {
        fn printing(stdout: &str) -> Self {
            Self {
                output: ExecOutput {
                    exit_code: Some(0),
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: vec![],
                },
                ..Default::default()
            }
        }
    }

    impl ExecRunner for FakeRunner {
        fn run(&self, invocation: &ExecInvocation<'_>, _timeout: Duration) -> Result<ExecOutput> {
            self.seen.lock().unwrap().push((
                invocation.command.to_owned(),
                invocation.args.to_vec(),
                invocation.env.clone(),
            ));
            Ok(self.output.clone())
        }
    }

    fn exec_config(command: &str, args: &[&str]) -> ExecConfig {
        ExecConfig {
            api_version: Some("client.authentication.k8s.io/v1".into()),
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: vec![],
            install_hint: None,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn extracts_token_from_fake_runner() {
        let runner = FakeRunner::printing(
            r#"{"apiVersion":"client.authentication.k8s.io/v1","kind":"ExecCredential","status":{"token":"abc","expirationTimestamp":"2099-01-01T00:00:00Z"}}"#,
        );
        let mut config = exec_config("plugin", &["get-token", "--cluster", "c"]);
        config.env.push(ExecEnvVar {
            name: "AWS_PROFILE".into(),
            value: "dev".into(),
        });

        let token = run(&config, &runner, TIMEOUT).unwrap();
        assert_eq!(token.token.expose_secret(), "abc");
        assert_eq!(
            token.expiration_timestamp.unwrap().to_rfc3339(),
            "2099-01-01T00:00:00+00:00"
        );

        let seen = runner.seen.lock().unwrap();
        let (command, args, env) = &seen[0];
        assert_eq!(command, "plugin");
        assert_eq!(args, &["get-token", "--cluster", "c"]);
        assert_eq!(env[0].0, EXEC_INFO_ENV);
        assert!(env[0].1.contains(r#""kind":"ExecCredential""#));
        assert!(env[0].1.contains(r#""interactive":false"#));
        assert_eq!(env[1], ("AWS_PROFILE".to_owned(), "dev".to_owned()));
    }

    #[test]
    fn rejects_wrong_kind() {
        let runner = FakeRunner::printing(r#"{"kind":"Secret","status":{"token":"abc"}}"#);
        let err = run(&exec_config("plugin", &[]), &runner, TIMEOUT).unwrap_err();
        assert!(matches!(err, Error::ExecCredential { .. }));
    }

    #[test]
    fn rejects_missing_or_empty_token() {
        for body in [
            r#"{"kind":"ExecCredential"}"#,
            r#"{"kind":"ExecCredential","status":{}}"#,
            r#"{"kind":"ExecCredential","status":{"token":""}}"#,
        ] {
            let runner = FakeRunner::printing(body);
            let err = run(&exec_config("plugin", &[]), &runner, TIMEOUT).unwrap_err();
            assert!(matches!(err, Error::ExecCredential { .. }), "{body}");
        }
    }

    #[test]
    fn rejects_malformed_json() {
        let runner = FakeRunner::printing("token: abc");
        let err = run(&exec_config("plugin", &[]), &runner, TIMEOUT).unwrap_err();
        assert!(matches!(err, Error::ExecCredential { .. }));
    }

    #[test]
    fn rejects_malformed_expiry() {
        let runner =
            FakeRunner::printing(r#"{"kind":"ExecCredential","status":{"token":"a","expirationTimestamp":"soon"}}"#);
        let err = run(&exec_config("plugin", &[]), &runner, TIMEOUT).unwrap_err();
        assert!(matches!(err, Error::ExecCredential { .. }));
    }

    #[test]
    fn non_zero_exit_reports_code_and_stderr() {
        let runner = FakeRunner {
            output: ExecOutput {
                exit_code: Some(3),
                stdout: vec![],
                stderr: b"login required\n".to_vec(),
            },
            ..Default::default()
        };
        match run(&exec_config("plugin", &[]), &runner, TIMEOUT).unwrap_err() {
            Error::ExecutionFailed {
                exit_code,
                timed_out,
                stderr,
                ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(!timed_out);
                assert_eq!(stderr, "login required");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_passes_env_and_captures_output() {
        let mut config = exec_config("sh", &[
            "-c",
            r#"printf '{"kind":"ExecCredential","status":{"token":"%s"}}' "$PLUGIN_TOKEN""#,
        ]);
        config.env.push(ExecEnvVar {
            name: "PLUGIN_TOKEN".into(),
            value: "from-env".into(),
        });
        let token = run(&config, &ProcessRunner, TIMEOUT).unwrap();
        assert_eq!(token.token.expose_secret(), "from-env");
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_inherits_path() {
        // `sh` is only found through the inherited PATH
        let config = exec_config("sh", &["-c", "exit 4"]);
        match run(&config, &ProcessRunner, TIMEOUT).unwrap_err() {
            Error::ExecutionFailed { exit_code, .. } => assert_eq!(exit_code, Some(4)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_enforces_timeout() {
        let config = exec_config("sleep", &["5"]);
        let started = Instant::now();
        let err = run(&config, &ProcessRunner, Duration::from_millis(100)).unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_timeout_covers_background_children() {
        // The plugin exits at once but a background child keeps stdout open
        let config = exec_config("sh", &[
            "-c",
            r#"sleep 3 & printf '{"kind":"ExecCredential","status":{"token":"t"}}'"#,
        ]);
        let started = Instant::now();
        let err = run(&config, &ProcessRunner, Duration::from_millis(200)).unwrap_err();
        assert!(err.is_timeout(), "unexpected error {err:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_timeout_keeps_stderr() {
        let config = exec_config("sh", &["-c", "echo waiting for browser login >&2; exec sleep 5"]);
        match run(&config, &ProcessRunner, Duration::from_millis(300)).unwrap_err() {
            Error::ExecutionFailed {
                timed_out, stderr, ..
            } => {
                assert!(timed_out);
                assert_eq!(stderr, "waiting for browser login");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn wait_failure_reaps_child() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let err = wait_failed("sleep", &mut child, io::Error::other("interrupted"));
        assert!(matches!(err, Error::ExecWait { ref command, .. } if command == "sleep"));
        assert!(err.to_string().contains("wait"));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn missing_command_surfaces_install_hint() {
        let mut config = exec_config("definitely-not-an-installed-plugin", &[]);
        config.install_hint = Some("install it with `brew install plugin`".into());
        let err = run(&config, &ProcessRunner, TIMEOUT).unwrap_err();
        assert!(matches!(err, Error::ExecStart { .. }));
        assert!(err.to_string().contains("brew install plugin"));
    }
}
