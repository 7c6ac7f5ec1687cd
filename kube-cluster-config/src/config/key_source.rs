use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use secrecy::{ExposeSecret, SecretSlice, SecretString};

use crate::{Error, Result};

/// A lazy reference to key material such as a token, a private key or a certificate bundle.
///
/// Nothing is read when a `KeySource` is constructed. Every call to [`KeySource::resolve`]
/// goes back to the source, so rotated service account tokens are picked up without
/// rebuilding the configuration.
///
/// The [`Debug`](fmt::Debug) output of a literal source is redacted.
#[derive(Clone)]
pub enum KeySource {
    /// Read from the given path on every resolution
    FromFile(PathBuf),
    /// An inline value, kept as raw bytes
    FromString(SecretSlice<u8>),
}

impl KeySource {
    /// An inline source holding `value`.
    pub fn literal(value: impl Into<Vec<u8>>) -> Self {
        Self::FromString(SecretSlice::from(value.into()))
    }

    /// Build a source from a base64 encoded `*-data` field and its path sibling.
    ///
    /// Inline data takes precedence over the path. Returns `None` when neither is set.
    pub fn from_base64_or_file(field: &str, data: Option<&str>, file: Option<&str>) -> Result<Option<Self>> {
        match (nonempty(data), nonempty(file)) {
            (Some(data), _) => {
                use base64::Engine;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|err| Error::parse(field, err))?;
                Ok(Some(Self::literal(decoded)))
            }
            (None, Some(file)) => Ok(Some(Self::FromFile(PathBuf::from(file)))),
            (None, None) => Ok(None),
        }
    }

    /// Build a source from a literal value and its path sibling, such as `token` and `tokenFile`.
    ///
    /// The literal takes precedence over the path.
    pub fn from_literal_or_file(literal: Option<&str>, file: Option<&str>) -> Option<Self> {
        match (nonempty(literal), nonempty(file)) {
            (Some(literal), _) => Some(Self::literal(literal)),
            (None, Some(file)) => Some(Self::FromFile(PathBuf::from(file))),
            (None, None) => None,
        }
    }

    /// Read the current content of the source.
    pub fn resolve(&self) -> Result<Vec<u8>> {
        match self {
            Self::FromFile(path) => fs::read(path).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            }),
            Self::FromString(value) => Ok(value.expose_secret().to_vec()),
        }
    }

    /// Read the current content of the source as text, keeping it wrapped as a secret.
    ///
    /// Fails if the content is not valid UTF-8.
    pub fn resolve_secret(&self) -> Result<SecretString> {
        match self {
            Self::FromFile(path) => fs::read_to_string(path)
                .map(SecretString::from)
                .map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                }),
            Self::FromString(value) => std::str::from_utf8(value.expose_secret())
                .map(SecretString::from)
                .map_err(|_| Error::parse("inline value", "not valid UTF-8")),
        }
    }

    /// Read the source as a PEM bundle and return the DER contents of every `CERTIFICATE` block.
    pub fn resolve_certificates(&self) -> Result<Vec<Vec<u8>>> {
        certs(&self.resolve()?)
    }

    /// Make a relative file path relative to `dir` instead of the working directory.
    pub fn rebase(self, dir: &Path) -> Self {
        match self {
            Self::FromFile(path) if path.is_relative() => Self::FromFile(dir.join(path)),
            other => other,
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FromFile(path) => f.debug_tuple("FromFile").field(path).finish(),
            Self::FromString(_) => f.write_str("FromString([REDACTED])"),
        }
    }
}

impl PartialEq for KeySource {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::FromFile(a), Self::FromFile(b)) => a == b,
            (Self::FromString(a), Self::FromString(b)) => a.expose_secret() == b.expose_secret(),
            _ => false,
        }
    }
}

impl Eq for KeySource {}

fn nonempty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn certs(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    Ok(pem::parse_many(data)
        .map_err(Error::ParseCertificates)?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(pem::Pem::into_contents)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CERT_PEM: &str = "-----BEGIN CERTIFICATE-----\naGVsbG8K\n-----END CERTIFICATE-----\n";

    #[test]
    fn data_takes_precedence_over_file() {
        let source = KeySource::from_base64_or_file("ca", Some("aGVsbG8K"), Some("/nonexistent"))
            .unwrap()
            .unwrap();
        assert_eq!(source.resolve().unwrap(), b"hello\n");
    }

    #[test]
    fn binary_data_is_kept_as_bytes() {
        // DER prefix, not valid UTF-8
        let source = KeySource::from_base64_or_file("ca", Some("MIL/"), None).unwrap().unwrap();
        assert_eq!(source.resolve().unwrap(), vec![0x30, 0x82, 0xff]);
        assert_eq!(source, KeySource::literal(vec![0x30, 0x82, 0xff]));
        assert!(matches!(source.resolve_secret(), Err(Error::Parse { .. })));
    }

    #[test]
    fn neither_data_nor_file_is_no_source() {
        assert!(KeySource::from_base64_or_file("ca", None, None).unwrap().is_none());
        assert!(KeySource::from_base64_or_file("ca", Some(""), Some("")).unwrap().is_none());
        assert!(KeySource::from_literal_or_file(None, None).is_none());
    }

    #[test]
    fn invalid_base64_names_the_field() {
        let err = KeySource::from_base64_or_file("users[0].user.client-key-data", Some("!!!"), None)
            .unwrap_err();
        match err {
            Error::Parse { field, .. } => assert_eq!(field, "users[0].user.client-key-data"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn file_is_read_fresh_on_every_resolve() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "first").unwrap();
        let source = KeySource::from_literal_or_file(None, file.path().to_str()).unwrap();
        assert_eq!(source.resolve_secret().unwrap().expose_secret(), "first");

        std::fs::write(file.path(), "second").unwrap();
        assert_eq!(source.resolve_secret().unwrap().expose_secret(), "second");
    }

    #[test]
    fn missing_file_reports_path() {
        let source = KeySource::FromFile("/definitely/not/here".into());
        match source.resolve().unwrap_err() {
            Error::Io { path, .. } => assert_eq!(path, PathBuf::from("/definitely/not/here")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn debug_does_not_output_literal() {
        let source = KeySource::from_literal_or_file(Some("hunter2"), None).unwrap();
        let output = format!("{source:?}");
        assert_eq!(output, "FromString([REDACTED])");
        assert!(!output.contains("hunter2"));
    }

    #[test]
    fn rebase_only_touches_relative_paths() {
        let dir = Path::new("/etc/kube");
        assert_eq!(
            KeySource::FromFile("ca.crt".into()).rebase(dir),
            KeySource::FromFile("/etc/kube/ca.crt".into())
        );
        assert_eq!(
            KeySource::FromFile("/abs/ca.crt".into()).rebase(dir),
            KeySource::FromFile("/abs/ca.crt".into())
        );
    }

    #[test]
    fn certificates_are_split_from_bundle() {
        let bundle = format!("{CERT_PEM}{CERT_PEM}");
        let source = KeySource::literal(bundle);
        let certs = source.resolve_certificates().unwrap();
        assert_eq!(certs, vec![b"hello\n".to_vec(), b"hello\n".to_vec()]);
    }
}
