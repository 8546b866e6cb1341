use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::error::EnviroError;

/// Network/file access used by loaders. Mocked in tests.
pub trait Upstream: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, EnviroError>;
    fn download(&self, url: &str, destination: &Path) -> Result<(), EnviroError>;
}

impl<T: Upstream + ?Sized> Upstream for Arc<T> {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, EnviroError> {
        (**self).fetch(url)
    }

    fn download(&self, url: &str, destination: &Path) -> Result<(), EnviroError> {
        (**self).download(url, destination)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_retries: 3,
            base_delay_ms: 200,
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1 << attempt.min(10)))
    }
}

#[derive(Clone)]
pub struct HttpUpstream {
    client: Client,
    policy: RetryPolicy,
}

impl HttpUpstream {
    pub fn new(policy: RetryPolicy) -> Result<Self, EnviroError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("envirocode/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| EnviroError::UpstreamUnavailable(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(policy.timeout_secs))
            .build()
            .map_err(|err| EnviroError::UpstreamUnavailable(err.to_string()))?;
        Ok(Self { client, policy })
    }

    fn send_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, EnviroError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.policy.max_retries && is_retryable_status(status) {
                        tracing::debug!(url, status, attempt, "retrying upstream request");
                        thread::sleep(self.policy.delay(attempt));
                        attempt += 1;
                        continue;
                    }
                    if !resp.status().is_success() {
                        let message = resp
                            .text()
                            .unwrap_or_else(|_| "upstream request failed".to_string());
                        return Err(EnviroError::UpstreamStatus { status, message });
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.policy.max_retries && is_retryable_error(&err) {
                        tracing::debug!(url, attempt, error = %err, "retrying upstream request");
                        thread::sleep(self.policy.delay(attempt));
                        attempt += 1;
                        continue;
                    }
                    return Err(EnviroError::UpstreamUnavailable(err.to_string()));
                }
            }
        }
    }
}

impl Upstream for HttpUpstream {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, EnviroError> {
        if let Some(path) = local_path(url) {
            return std::fs::read(path)
                .map_err(|err| EnviroError::UpstreamUnavailable(format!("{url}: {err}")));
        }
        let response = self.send_with_retries(url)?;
        let bytes = response
            .bytes()
            .map_err(|err| EnviroError::UpstreamUnavailable(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn download(&self, url: &str, destination: &Path) -> Result<(), EnviroError> {
        if let Some(path) = local_path(url) {
            std::fs::copy(path, destination)
                .map_err(|err| EnviroError::UpstreamUnavailable(format!("{url}: {err}")))?;
            return Ok(());
        }
        let mut response = self.send_with_retries(url)?;
        let mut file =
            File::create(destination).map_err(|err| EnviroError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| EnviroError::UpstreamUnavailable(err.to_string()))?;
        Ok(())
    }
}

/// Sources that are not `http(s)://` URLs are plain file copies.
fn local_path(source: &str) -> Option<&Path> {
    if source.starts_with("http://") || source.starts_with("https://") {
        return None;
    }
    Some(Path::new(source.strip_prefix("file://").unwrap_or(source)))
}

/// Replace `{name}` placeholders in a URL template.
pub fn fill_template(template: &str, values: &[(&str, String)]) -> String {
    values.iter().fold(template.to_string(), |url, (key, value)| {
        url.replace(&format!("{{{key}}}"), value)
    })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
