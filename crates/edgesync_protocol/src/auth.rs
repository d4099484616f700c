//! Request signing with a per-site shared secret.
//!
//! Every sync request carries three headers:
//!
//! | Header | Content |
//! |---|---|
//! | `x-sync-key` | key identifier |
//! | `x-sync-timestamp` | unix milliseconds |
//! | `x-sync-signature` | lowercase hex HMAC-SHA256 of `"{timestamp}.{METHOD}.{target}.{body}"` |
//!
//! `target` is the request path including its query string. The signature is
//! computed over the exact body bytes put on the wire, so the receiver never
//! has to re-serialize anything to check it.

use crate::error::AuthError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Key identifier header.
pub const KEY_HEADER: &str = "x-sync-key";
/// Timestamp header.
pub const TIMESTAMP_HEADER: &str = "x-sync-timestamp";
/// Signature header.
pub const SIGNATURE_HEADER: &str = "x-sync-signature";

/// Maximum accepted difference between sender and receiver clocks.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// The authentication headers of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// Key identifier.
    pub key_id: String,
    /// Unix milliseconds, as sent.
    pub timestamp: String,
    /// Hex signature.
    pub signature: String,
}

impl SignedHeaders {
    /// Returns the headers as name/value pairs.
    pub fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            (KEY_HEADER, self.key_id.as_str()),
            (TIMESTAMP_HEADER, self.timestamp.as_str()),
            (SIGNATURE_HEADER, self.signature.as_str()),
        ]
    }

    /// Collects the headers through a case-insensitive lookup function.
    pub fn from_lookup<'a>(
        mut lookup: impl FnMut(&'static str) -> Option<&'a str>,
    ) -> Result<Self, AuthError> {
        let mut get = |name| {
            lookup(name)
                .map(str::to_string)
                .ok_or(AuthError::MissingHeader(name))
        };
        Ok(Self {
            key_id: get(KEY_HEADER)?,
            timestamp: get(TIMESTAMP_HEADER)?,
            signature: get(SIGNATURE_HEADER)?,
        })
    }
}

/// Signs outgoing requests.
#[derive(Clone)]
pub struct RequestSigner {
    key_id: String,
    secret: Vec<u8>,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// Creates a signer for the given key.
    pub fn new(key_id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
        }
    }

    /// Returns the key identifier.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Computes the hex signature for one request.
    pub fn signature(&self, timestamp_ms: i64, method: &str, target: &str, body: &[u8]) -> String {
        hex::encode(mac_over(&self.secret, timestamp_ms, method, target, body))
    }

    /// Signs a request at an explicit instant.
    pub fn sign_at(&self, timestamp_ms: i64, method: &str, target: &str, body: &[u8]) -> SignedHeaders {
        SignedHeaders {
            key_id: self.key_id.clone(),
            timestamp: timestamp_ms.to_string(),
            signature: self.signature(timestamp_ms, method, target, body),
        }
    }

    /// Signs a request now.
    pub fn sign(&self, method: &str, target: &str, body: &[u8]) -> SignedHeaders {
        self.sign_at(chrono::Utc::now().timestamp_millis(), method, target, body)
    }
}

/// Checks signatures on the receiving side.
#[derive(Clone, Default)]
pub struct SignatureVerifier {
    keys: HashMap<String, Vec<u8>>,
    max_skew: Option<Duration>,
}

impl SignatureVerifier {
    /// Creates a verifier with no registered keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a key.
    pub fn with_key(mut self, key_id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(key_id.into(), secret.into());
        self
    }

    /// Overrides the accepted clock skew.
    pub fn with_max_skew(mut self, skew: Duration) -> Self {
        self.max_skew = Some(skew);
        self
    }

    /// Verifies a request against the receiver clock `now_ms`.
    pub fn verify(
        &self,
        headers: &SignedHeaders,
        method: &str,
        target: &str,
        body: &[u8],
        now_ms: i64,
    ) -> Result<(), AuthError> {
        let secret = self
            .keys
            .get(&headers.key_id)
            .ok_or_else(|| AuthError::UnknownKey(headers.key_id.clone()))?;

        let timestamp_ms: i64 = headers
            .timestamp
            .parse()
            .map_err(|_| AuthError::MalformedTimestamp(headers.timestamp.clone()))?;

        let skew_ms = now_ms.abs_diff(timestamp_ms);
        let max_skew = self.max_skew.unwrap_or(MAX_CLOCK_SKEW);
        if u128::from(skew_ms) > max_skew.as_millis() {
            return Err(AuthError::StaleTimestamp { skew_ms });
        }

        let provided = hex::decode(&headers.signature).map_err(|_| AuthError::BadSignature)?;
        let mut mac = keyed(secret);
        feed(&mut mac, timestamp_ms, method, target, body);
        mac.verify_slice(&provided)
            .map_err(|_| AuthError::BadSignature)
    }
}

fn keyed(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size")
}

fn feed(mac: &mut HmacSha256, timestamp_ms: i64, method: &str, target: &str, body: &[u8]) {
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(b".");
    mac.update(method.to_ascii_uppercase().as_bytes());
    mac.update(b".");
    mac.update(target.as_bytes());
    mac.update(b".");
    mac.update(body);
}

fn mac_over(secret: &[u8], timestamp_ms: i64, method: &str, target: &str, body: &[u8]) -> [u8; 32] {
    let mut mac = keyed(secret);
    feed(&mut mac, timestamp_ms, method, target, body);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECRET: &[u8] = b"site-shared-secret";
    const NOW: i64 = 1_772_359_200_000;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new().with_key("site-1", SECRET)
    }

    #[test]
    fn signed_request_verifies() {
        let signer = RequestSigner::new("site-1", SECRET);
        let body = br#"{"siteId":"site-1","entities":[]}"#;
        let headers = signer.sign_at(NOW, "POST", "/sync/push", body);

        assert_eq!(headers.signature.len(), 64);
        assert!(verifier().verify(&headers, "POST", "/sync/push", body, NOW).is_ok());
    }

    #[test]
    fn signature_binds_method_and_target() {
        let signer = RequestSigner::new("site-1", SECRET);
        let headers = signer.sign_at(NOW, "GET", "/sync/pull?siteId=site-1", b"");

        assert_eq!(
            verifier().verify(&headers, "POST", "/sync/pull?siteId=site-1", b"", NOW),
            Err(AuthError::BadSignature)
        );
        assert_eq!(
            verifier().verify(&headers, "GET", "/sync/pull?siteId=site-2", b"", NOW),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn rejects_unknown_key_and_stale_timestamp() {
        let headers = RequestSigner::new("site-9", SECRET).sign_at(NOW, "POST", "/sync/push", b"{}");
        assert_eq!(
            verifier().verify(&headers, "POST", "/sync/push", b"{}", NOW),
            Err(AuthError::UnknownKey("site-9".into()))
        );

        let headers = RequestSigner::new("site-1", SECRET).sign_at(NOW, "POST", "/sync/push", b"{}");
        let later = NOW + MAX_CLOCK_SKEW.as_millis() as i64 + 1;
        assert!(matches!(
            verifier().verify(&headers, "POST", "/sync/push", b"{}", later),
            Err(AuthError::StaleTimestamp { .. })
        ));
    }

    #[test]
    fn extreme_timestamps_are_stale() {
        for extreme in [i64::MIN, i64::MAX] {
            let mut headers =
                RequestSigner::new("site-1", SECRET).sign_at(NOW, "POST", "/sync/push", b"{}");
            headers.timestamp = extreme.to_string();
            assert!(matches!(
                verifier().verify(&headers, "POST", "/sync/push", b"{}", NOW),
                Err(AuthError::StaleTimestamp { .. })
            ));
        }
    }

    #[test]
    fn rejects_wrong_secret() {
        let headers = RequestSigner::new("site-1", b"other".to_vec()).sign_at(NOW, "POST", "/p", b"x");
        assert_eq!(
            verifier().verify(&headers, "POST", "/p", b"x", NOW),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn headers_from_lookup() {
        let headers = RequestSigner::new("site-1", SECRET).sign_at(NOW, "POST", "/p", b"");
        let pairs = headers.pairs();
        let parsed = SignedHeaders::from_lookup(|name| {
            pairs.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
        })
        .unwrap();
        assert_eq!(parsed, headers);

        let missing = SignedHeaders::from_lookup(|name| (name == KEY_HEADER).then_some("k"));
        assert_eq!(missing, Err(AuthError::MissingHeader(TIMESTAMP_HEADER)));
    }

    #[test]
    fn debug_hides_secret() {
        let signer = RequestSigner::new("site-1", SECRET);
        assert!(!format!("{signer:?}").contains("site-shared-secret"));
    }

    proptest! {
        #[test]
        fn altering_any_body_byte_breaks_signature(
            body in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let signer = RequestSigner::new("site-1", SECRET);
            let headers = signer.sign_at(NOW, "POST", "/sync/push", &body);

            let mut tampered = body.clone();
            let i = index.index(tampered.len());
            tampered[i] ^= flip;

            prop_assert_ne!(
                signer.signature(NOW, "POST", "/sync/push", &tampered),
                headers.signature.clone()
            );
            prop_assert_eq!(
                verifier().verify(&headers, "POST", "/sync/push", &tampered, NOW),
                Err(AuthError::BadSignature)
            );
        }
    }
}
