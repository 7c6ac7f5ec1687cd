use std::{env, net::IpAddr, path::PathBuf};

use super::KeySource;

pub(crate) const SERVICE_HOSTENV: &str = "KUBERNETES_SERVICE_HOST";
pub(crate) const SERVICE_PORTENV: &str = "KUBERNETES_SERVICE_PORT";

// Mounted credential files
const SERVICE_TOKENFILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_CERTFILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

pub(crate) fn kube_dns() -> http::Uri {
    http::Uri::from_static("https://kubernetes.default.svc/")
}

pub(crate) fn token_file() -> KeySource {
    KeySource::FromFile(PathBuf::from(SERVICE_TOKENFILE))
}

pub(crate) fn cert_file() -> KeySource {
    KeySource::FromFile(PathBuf::from(SERVICE_CERTFILE))
}

/// Returns the API server address from the service environment variables.
pub(crate) fn kube_server() -> Option<String> {
    let host = env::var(SERVICE_HOSTENV).ok().filter(|h| !h.is_empty())?;
    let port = env::var(SERVICE_PORTENV).ok().filter(|p| !p.is_empty())?;
    Some(server_url(&host, &port))
}

fn server_url(host: &str, port: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("https://[{ip}]:{port}"),
        _ => format!("https://{host}:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_url_brackets_ipv6() {
        assert_eq!(server_url("fake.io", "8080"), "https://fake.io:8080");
        assert_eq!(server_url("10.96.0.1", "443"), "https://10.96.0.1:443");
        assert_eq!(server_url("fd00::1", "443"), "https://[fd00::1]:443");
    }

    #[test]
    fn mounted_paths() {
        assert_eq!(
            token_file(),
            KeySource::FromFile("/var/run/secrets/kubernetes.io/serviceaccount/token".into())
        );
        assert_eq!(kube_dns().host(), Some("kubernetes.default.svc"));
    }
}
