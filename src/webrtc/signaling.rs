//! WHEP signaling over HTTP
//!
//! POSTs the local SDP offer to the endpoint and returns the SDP answer body.

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tokio::time::{self, Instant};
use url::Url;

/// Content type of WHEP offer bodies
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// HTTP-level signaling failures
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP error {status}")]
    Status { status: u16, body: Option<String> },
    #[error("answer body is not valid UTF-8")]
    UndecodableAnswer,
    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

/// Sends an SDP offer, returns the SDP answer.
#[async_trait]
pub trait WhepSignaler: Send + Sync {
    async fn post_offer(&self, endpoint: &Url, offer_sdp: &str) -> Result<String, SignalingError>;
}

/// Time bounds for one offer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhepTimeouts {
    /// Bound on a single HTTP request
    pub request: Duration,
    /// Bound on the whole exchange including waiting for connectivity
    pub resource: Duration,
    /// Pause between attempts while the endpoint is unreachable
    pub connectivity_retry: Duration,
}

impl Default for WhepTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            resource: Duration::from_secs(60),
            connectivity_retry: Duration::from_secs(1),
        }
    }
}

/// reqwest-backed WHEP signaler
#[derive(Debug, Clone)]
pub struct HttpWhepSignaler {
    client: reqwest::Client,
    timeouts: WhepTimeouts,
}

impl HttpWhepSignaler {
    pub fn new(timeouts: WhepTimeouts) -> Result<Self, SignalingError> {
        let client = reqwest::Client::builder()
            .timeout(timeouts.request)
            .build()
            .map_err(|e| SignalingError::Client(e.to_string()))?;
        Ok(Self { client, timeouts })
    }

    pub fn timeouts(&self) -> WhepTimeouts {
        self.timeouts
    }

    async fn send_once(&self, endpoint: &Url, offer_sdp: &str) -> Result<String, SendFailure> {
        let response = self
            .client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer_sdp.to_owned())
            .timeout(self.timeouts.request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    SendFailure::Unreachable(e.to_string())
                } else if e.is_timeout() {
                    SendFailure::Fatal(SignalingError::Timeout)
                } else {
                    SendFailure::Fatal(SignalingError::Network(e.to_string()))
                }
            })?;

        let status = response.status();
        debug!("WHEP: HTTP status {} from {}", status.as_u16(), endpoint);
        let body = response
            .bytes()
            .await
            .map_err(|e| SendFailure::Fatal(SignalingError::Network(e.to_string())))?;

        if !status.is_success() {
            let body = String::from_utf8(body.to_vec()).ok();
            if let Some(ref text) = body {
                warn!("WHEP: HTTP error {} body: {}", status.as_u16(), text);
            }
            return Err(SendFailure::Fatal(SignalingError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        String::from_utf8(body.to_vec()).map_err(|_| SendFailure::Fatal(SignalingError::UndecodableAnswer))
    }
}

enum SendFailure {
    /// Connection could not be established; worth waiting for
    Unreachable(String),
    Fatal(SignalingError),
}

#[async_trait]
impl WhepSignaler for HttpWhepSignaler {
    async fn post_offer(&self, endpoint: &Url, offer_sdp: &str) -> Result<String, SignalingError> {
        info!("WHEP: Sending POST request to {} ({} byte offer)", endpoint, offer_sdp.len());
        let deadline = Instant::now() + self.timeouts.resource;

        let exchange = async {
            loop {
                match self.send_once(endpoint, offer_sdp).await {
                    Ok(answer) => return Ok(answer),
                    Err(SendFailure::Fatal(e)) => return Err(e),
                    Err(SendFailure::Unreachable(e)) => {
                        if Instant::now() + self.timeouts.connectivity_retry >= deadline {
                            return Err(SignalingError::Network(e));
                        }
                        debug!("WHEP: {} unreachable ({}), waiting for connectivity", endpoint, e);
                        time::sleep(self.timeouts.connectivity_retry).await;
                    }
                }
            }
        };

        match time::timeout_at(deadline, exchange).await {
            Ok(result) => {
                if let Ok(ref answer) = result {
                    info!("WHEP: Received SDP answer ({} bytes)", answer.len());
                }
                result
            }
            Err(_) => Err(SignalingError::Timeout),
        }
    }
}
