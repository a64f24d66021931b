use crate::config::{BasicAuth, EndpointConfig};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("invalid endpoint url {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
}

/// One encoded request body.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub body: Vec<u8>,
    pub content_type: String,
    pub samples: usize,
}

/// What the endpoint answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
}

impl SendResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
        }
    }
}

/// Sends encoded requests to one endpoint.
///
/// Any HTTP status is an `Ok`; only failures to get a response at all are
/// errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &WriteRequest) -> Result<SendResponse, TransportError>;
}

/// `Retry-After` given in seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// HTTP POST transport; one connection pool per endpoint.
#[derive(Debug)]
pub struct HttpTransport {
    endpoint: String,
    url: reqwest::Url,
    client: reqwest::Client,
    basic_auth: Option<BasicAuth>,
    user_agent: String,
    write_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &EndpointConfig) -> Result<Self, TransportError> {
        let url = reqwest::Url::parse(&config.url).map_err(|e| TransportError::InvalidUrl {
            url: config.url.clone(),
            message: e.to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.write_timeout)
            .build()
            .map_err(TransportError::Build)?;

        Ok(Self {
            endpoint: config.name.clone(),
            url,
            client,
            basic_auth: config.basic_auth.clone(),
            user_agent: config.user_agent.clone(),
            write_timeout: config.write_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &WriteRequest) -> Result<SendResponse, TransportError> {
        let mut builder = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, request.content_type.as_str())
            .header(USER_AGENT, self.user_agent.as_str())
            .body(request.body.clone());

        if let Some(auth) = &self.basic_auth {
            builder = builder.basic_auth(&auth.username, Some(auth.password.expose_secret()));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.write_timeout)
            } else {
                TransportError::Network(e)
            }
        })?;

        Ok(SendResponse {
            status: response.status().as_u16(),
            retry_after: parse_retry_after(response.headers()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_retry_after_ignores_dates() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = EndpointConfig::new("bad", "not a url");
        assert!(matches!(
            HttpTransport::new(&config),
            Err(TransportError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_builds_from_config() {
        let config = EndpointConfig::new("primary", "http://localhost:9009/api/v1/push");
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.endpoint(), "primary");
    }
}
