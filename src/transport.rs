//! HTTP surface of the relay server.
//!
//! Two endpoints are consumed: `GET /getaddr` for the liveness ping and
//! `POST /relay` for submitting the signed request. The trait seam exists so
//! selection and orchestration can be exercised without a network.

use crate::{
    error::{EnvelopingError, PingError, RelayingError},
    types::{PingResponse, RelayTransactionRequest},
};
use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Client side of the relay server's HTTP surface.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Pings the relay, optionally telling it which verifier will be used.
    async fn ping(&self, url: &Url, verifier: Option<Address>)
        -> Result<PingResponse, PingError>;

    /// Submits the signed request and returns the raw signed transaction the
    /// relay claims to have broadcast.
    async fn relay_transaction(
        &self,
        url: &Url,
        request: &RelayTransactionRequest,
    ) -> Result<Bytes, RelayingError>;
}

/// Body of a `POST /relay` response.
///
/// A non-null `error` or a missing `signedTx` are relay-level failures even
/// when the HTTP status is 200.
#[derive(Debug, Deserialize)]
struct RelayServerResponse {
    #[serde(rename = "signedTx")]
    signed_tx: Option<Bytes>,
    #[serde(default)]
    error: Option<String>,
}

/// [`RelayTransport`] over reqwest. The per-request timeout configured here
/// is the only bound on ping-race latency.
#[derive(Debug, Clone)]
pub struct HttpRelayTransport {
    client: reqwest::Client,
}

impl HttpRelayTransport {
    /// Builds the transport with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, EnvelopingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                EnvelopingError::Configuration(format!("http client construction failed: {e}"))
            })?;
        Ok(Self { client })
    }

    fn endpoint(url: &Url, path: &str) -> String {
        format!("{}/{}", url.as_str().trim_end_matches('/'), path)
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn ping(
        &self,
        url: &Url,
        verifier: Option<Address>,
    ) -> Result<PingResponse, PingError> {
        let mut request = self.client.get(Self::endpoint(url, "getaddr"));
        if let Some(verifier) = verifier {
            request = request.query(&[("verifier", verifier.to_string())]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PingError::Timeout
            } else {
                PingError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(PingError::Transport(format!("http status {status}")));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                PingError::Timeout
            } else {
                PingError::Transport(e.to_string())
            }
        })?;
        if body.trim().is_empty() {
            return Err(PingError::EmptyBody);
        }
        let ping: PingResponse =
            serde_json::from_str(&body).map_err(|e| PingError::Malformed(e.to_string()))?;
        debug!(url = %url, worker = %ping.relay_worker_address, ready = ping.ready, "relay ping answered");
        Ok(ping)
    }

    async fn relay_transaction(
        &self,
        url: &Url,
        request: &RelayTransactionRequest,
    ) -> Result<Bytes, RelayingError> {
        let response = self
            .client
            .post(Self::endpoint(url, "relay"))
            .json(request)
            .send()
            .await
            .map_err(|e| RelayingError::Unreachable {
                timeout: e.is_timeout(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayingError::Unreachable {
                timeout: false,
                reason: format!("http status {status}"),
            });
        }

        let body: RelayServerResponse =
            response
                .json()
                .await
                .map_err(|e| RelayingError::Unreachable {
                    timeout: e.is_timeout(),
                    reason: format!("malformed relay response: {e}"),
                })?;
        if let Some(error) = body.error {
            return Err(RelayingError::ServerError(error));
        }
        body.signed_tx.ok_or(RelayingError::MissingSignedTx)
    }
}
