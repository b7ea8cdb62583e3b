//! Artifact downloads from the content mirror.
//!
//! The mirror serves target archives at
//! `<mirror>/kolide/<binary>/<os>/<arch>/<target>`. Nothing the mirror
//! returns is trusted until it passes verification against the release
//! metadata.

use crate::error::{LauncherError, Result};
use crate::update::Binary;
use std::io::Read;
use std::time::Duration;

/// Capability to open a byte stream for a named target.
///
/// Kept narrow so tests can substitute an in-memory fetcher.
pub trait MirrorFetcher: Send + Sync {
    /// Open a download stream for the given binary's target archive.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::Network`] when the mirror is unreachable,
    /// the request times out, or the response is non-2xx.
    fn fetch(&self, binary: Binary, target: &str) -> Result<Box<dyn Read + Send>>;
}

/// HTTP mirror client with bounded connect and read timeouts.
pub struct HttpMirror {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpMirror {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(15))
            .timeout_read(Duration::from_secs(300))
            .build();
        Self {
            base_url: base_url.into(),
            agent,
        }
    }

    fn target_url(&self, binary: Binary, target: &str) -> String {
        format!(
            "{}/kolide/{}/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            binary,
            platform_os(),
            platform_arch(),
            target
        )
    }
}

impl MirrorFetcher for HttpMirror {
    fn fetch(&self, binary: Binary, target: &str) -> Result<Box<dyn Read + Send>> {
        let url = self.target_url(binary, target);
        let response = self
            .agent
            .get(&url)
            .set("User-Agent", concat!("launcher/", env!("CARGO_PKG_VERSION")))
            .call()
            .map_err(|e| LauncherError::Network(format!("mirror request for {target}: {e}")))?;
        Ok(Box::new(response.into_reader()))
    }
}

/// OS label used in mirror paths.
pub fn platform_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Architecture label used in mirror paths.
pub fn platform_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn target_url_layout() {
        let mirror = HttpMirror::new("https://dl.example.com/");
        let url = mirror.target_url(Binary::Launcher, "launcher-1.2.0.tar.gz");
        assert_eq!(
            url,
            format!(
                "https://dl.example.com/kolide/launcher/{}/{}/launcher-1.2.0.tar.gz",
                platform_os(),
                platform_arch()
            )
        );
    }

    #[test]
    fn platform_labels_are_mirror_names() {
        assert_ne!(platform_os(), "macos");
        assert_ne!(platform_arch(), "x86_64");
        assert_ne!(platform_arch(), "aarch64");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_streams_response_body() {
        let server = MockServer::start().await;
        let mirror_path = format!(
            "/kolide/osqueryd/{}/{}/osqueryd-5.9.1.tar.gz",
            platform_os(),
            platform_arch()
        );

        Mock::given(method("GET"))
            .and(path(mirror_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"archive bytes".to_vec()))
            .mount(&server)
            .await;

        let mirror = HttpMirror::new(server.uri());
        let body = tokio::task::spawn_blocking(move || {
            let mut reader = mirror
                .fetch(Binary::Osqueryd, "osqueryd-5.9.1.tar.gz")
                .unwrap();
            let mut body = Vec::new();
            reader.read_to_end(&mut body).unwrap();
            body
        })
        .await
        .unwrap();

        assert_eq!(body, b"archive bytes");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_success_status_is_network_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mirror = HttpMirror::new(server.uri());
        let err = tokio::task::spawn_blocking(move || {
            mirror
                .fetch(Binary::Launcher, "launcher-9.9.9.tar.gz")
                .err()
        })
        .await
        .unwrap()
        .unwrap();

        assert!(matches!(err, LauncherError::Network(_)));
    }

    #[test]
    fn unreachable_mirror_is_network_error() {
        let mirror = HttpMirror::new("http://127.0.0.1:1");
        let err = match mirror.fetch(Binary::Launcher, "launcher-1.0.0.tar.gz") {
            Ok(_) => panic!("expected fetch to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, LauncherError::Network(_)));
    }
}
