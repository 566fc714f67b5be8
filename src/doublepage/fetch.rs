use thiserror::Error;
use tracing::warn;

use super::{DetectError, DetectionResult, Detector};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid image url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("timed out fetching {0}")]
    Timeout(String),
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },
    #[error("transport error fetching {url}: {reason}")]
    Transport { url: String, reason: String },
}

pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetches `url` and runs `detector` on the bytes. Failures stay scoped to this page.
pub fn detect_from_url(
    fetcher: &dyn ImageFetcher,
    detector: &dyn Detector,
    url: &str,
) -> Result<DetectionResult, DetectError> {
    let bytes = fetcher.fetch(url).map_err(|err| {
        warn!(url, error = %err, "page image fetch failed");
        err
    })?;
    detector.detect(&bytes)
}

#[cfg(feature = "remote")]
pub(crate) fn parse_http_url(raw: &str) -> Result<url::Url, FetchError> {
    let parsed = url::Url::parse(raw).map_err(|err| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

#[cfg(feature = "remote")]
pub use http::HttpImageFetcher;

#[cfg(feature = "remote")]
mod http {
    use std::time::Duration;

    use reqwest::blocking::Client;

    use super::{parse_http_url, FetchError, ImageFetcher};

    pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

    pub struct HttpImageFetcher {
        client: Client,
    }

    impl HttpImageFetcher {
        pub fn new() -> Result<Self, FetchError> {
            Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
        }

        pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|err| FetchError::Transport {
                    url: String::new(),
                    reason: err.to_string(),
                })?;
            Ok(Self { client })
        }
    }

    impl ImageFetcher for HttpImageFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            let parsed = parse_http_url(url)?;
            let classify = |err: reqwest::Error| {
                if err.is_timeout() {
                    FetchError::Timeout(url.to_string())
                } else {
                    FetchError::Transport {
                        url: url.to_string(),
                        reason: err.to_string(),
                    }
                }
            };

            let response = self.client.get(parsed).send().map_err(classify)?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let bytes = response.bytes().map_err(classify)?;
            Ok(bytes.to_vec())
        }
    }
}
