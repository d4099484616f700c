//! HTTP client for the cloud sync endpoints.
//!
//! Requests are signed over the exact bytes sent (see
//! [`RequestSigner`](edgesync_protocol::RequestSigner)). When a certificate
//! pin is configured, every signed call is preceded by a fresh TLS connection
//! whose peer certificate fingerprint must match the pin.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use edgesync_protocol::{
    HeartbeatRequest, HeartbeatResponse, PullQuery, PullResponse, PushRequest, PushResponse,
    RequestSigner, HEALTH_PATH, HEARTBEAT_PATH, PULL_PATH, PUSH_PATH,
};
use reqwest::header::CONTENT_TYPE;
use reqwest::tls::TlsInfo;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

/// Signed, pinned, time-bounded access to the cloud hub.
#[derive(Debug, Clone)]
pub struct SyncClient {
    http: Client,
    pin_probe: Option<(Client, String)>,
    base: Url,
    signer: RequestSigner,
}

impl SyncClient {
    /// Creates a client from the engine configuration.
    ///
    /// Fails fast on a plaintext URL pointing at a non-loopback host.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let base = parse_endpoint(&config.cloud_url)?;
        let signer = RequestSigner::new(config.key_id(), config.signing_key.as_bytes().to_vec());

        let http = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("http client: {e}")))?;

        let pin_probe = match config.pinned_fingerprint()? {
            Some(pin) => {
                if base.scheme() != "https" {
                    return Err(SyncError::InvalidConfig(
                        "tls_pin requires an https cloud_url".into(),
                    ));
                }
                Some((pin_client(config.request_timeout)?, pin))
            }
            None => None,
        };

        Ok(Self {
            http,
            pin_probe,
            base,
            signer,
        })
    }

    /// Returns the cloud base URL.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Opens a fresh TLS connection and compares the peer certificate with
    /// the pin. Does nothing when no pin is configured.
    pub async fn verify_pin(&self) -> SyncResult<()> {
        let Some((probe, expected)) = &self.pin_probe else {
            return Ok(());
        };

        let url = self.endpoint(HEALTH_PATH, None);
        let response = probe
            .get(url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, "certificate check"))?;
        let certificate = response
            .extensions()
            .get::<TlsInfo>()
            .and_then(TlsInfo::peer_certificate)
            .ok_or_else(|| SyncError::transport_retryable("no peer certificate presented"))?;

        let actual = hex::encode(Sha256::digest(certificate));
        if &actual != expected {
            error!(
                host = self.base.host_str().unwrap_or_default(),
                expected = %expected,
                actual = %actual,
                "certificate pin mismatch, aborting sync call"
            );
            return Err(SyncError::PinMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn endpoint(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        url.set_path(&format!("{prefix}{path}"));
        url.set_query(query);
        url
    }

    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        body: Vec<u8>,
        operation: &'static str,
    ) -> SyncResult<T> {
        self.verify_pin().await?;

        let url = self.endpoint(path, query);
        let target = request_target(&url);
        let headers = self.signer.sign(method.as_str(), &target, &body);

        let mut request = self.http.request(method, url);
        for (name, value) in headers.pairs() {
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, operation))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, operation))?;
        decode_response(status.as_u16(), &bytes, operation)
    }
}

#[async_trait]
impl SyncTransport for SyncClient {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        let body = encode_body(request)?;
        debug!(entities = request.entities.len(), "pushing to cloud");
        self.send_signed(Method::POST, PUSH_PATH, None, body, "push")
            .await
    }

    async fn pull(&self, query: &PullQuery) -> SyncResult<PullResponse> {
        let encoded = query.to_query_string();
        self.send_signed(
            Method::GET,
            PULL_PATH,
            Some(&encoded),
            Vec::new(),
            "pull",
        )
        .await
    }

    async fn heartbeat(&self, request: &HeartbeatRequest) -> SyncResult<HeartbeatResponse> {
        let body = encode_body(request)?;
        self.send_signed(Method::POST, HEARTBEAT_PATH, None, body, "heartbeat")
            .await
    }

    async fn check_health(&self) -> SyncResult<()> {
        let response = self
            .http
            .get(self.endpoint(HEALTH_PATH, None))
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, "health check"))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SyncError::Http {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }
}

/// Returns the path and query exactly as they appear on the request line.
pub(crate) fn request_target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

pub(crate) fn encode_body<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SyncError::Protocol(format!("encode: {e}")))
}

/// Maps a status and body to a decoded message or a typed error.
pub(crate) fn decode_response<T: DeserializeOwned>(
    status: u16,
    body: &[u8],
    operation: &'static str,
) -> SyncResult<T> {
    if !(200..300).contains(&status) {
        let body = String::from_utf8_lossy(body).into_owned();
        warn!(operation, status, body = %body, "cloud rejected request");
        return Err(SyncError::Http { status, body });
    }
    serde_json::from_slice(body)
        .map_err(|e| SyncError::Protocol(format!("{operation} response: {e}")))
}

fn map_reqwest_error(err: reqwest::Error, operation: &'static str) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout { operation }
    } else if err.is_builder() {
        SyncError::transport_fatal(format!("{operation}: {err}"))
    } else if err.is_decode() {
        SyncError::Protocol(format!("{operation}: {err}"))
    } else {
        SyncError::transport_retryable(format!("{operation}: {err}"))
    }
}

/// Client used only for certificate checks: no pooling, so each check
/// performs its own handshake.
fn pin_client(timeout: Duration) -> SyncResult<Client> {
    Client::builder()
        .tls_info(true)
        .pool_max_idle_per_host(0)
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::InvalidConfig(format!("pin probe client: {e}")))
}

/// Parses the cloud URL and enforces HTTPS for anything but loopback.
pub(crate) fn parse_endpoint(raw: &str) -> SyncResult<Url> {
    let url = Url::parse(raw).map_err(|e| SyncError::InvalidConfig(format!("cloud_url {raw:?}: {e}")))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if is_loopback(&url) => Ok(url),
        "http" => Err(SyncError::InsecureEndpoint(raw.to_string())),
        other => Err(SyncError::InvalidConfig(format!(
            "cloud_url scheme {other:?} is not supported"
        ))),
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}
