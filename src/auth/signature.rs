//! HMAC-SHA256 request signatures shared between the directory service and a
//! knot.
//!
//! The signed payload is `method ++ path ++ timestamp`, where `timestamp` is
//! the RFC 3339 string sent in [`TIMESTAMP_HEADER`].  The hex-encoded MAC
//! travels in [`SIGNATURE_HEADER`].  The query string and body are not
//! covered.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("shared secret is empty")]
    EmptySecret,
    #[error("HMAC key rejected")]
    InvalidKey,
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("signature is not valid hex")]
    MalformedSignature,
    #[error("signature mismatch")]
    Mismatch,
    #[error("timestamp is not RFC 3339")]
    MalformedTimestamp,
    #[error("timestamp skew of {skew_secs}s is outside the accepted window")]
    Stale { skew_secs: i64 },
}

// ---------------------------------------------------------------------------
// Shared secret
// ---------------------------------------------------------------------------

/// The HMAC key.  Never logged.
#[derive(Clone)]
pub struct SharedSecret(Arc<[u8]>);

impl SharedSecret {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, SignatureError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(SignatureError::EmptySecret);
        }
        Ok(Self(Arc::from(secret)))
    }

    fn mac(&self) -> Result<HmacSha256, SignatureError> {
        HmacSha256::new_from_slice(&self.0).map_err(|_| SignatureError::InvalidKey)
    }

    /// Hex HMAC of an arbitrary message.
    pub fn sign_message(&self, message: &[u8]) -> Result<String, SignatureError> {
        let mut mac = self.mac()?;
        mac.update(message);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a hex HMAC over `message`.
    pub fn verify_message(&self, message: &[u8], signature: &str) -> Result<(), SignatureError> {
        let expected = hex::decode(signature).map_err(|_| SignatureError::MalformedSignature)?;
        let mut mac = self.mac()?;
        mac.update(message);
        mac.verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch)
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

fn payload(method: &str, path: &str, timestamp: &str) -> String {
    format!("{method}{path}{timestamp}")
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

/// Header values for one outbound request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub signature: String,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct RequestSigner {
    secret: SharedSecret,
}

impl RequestSigner {
    pub fn new(secret: SharedSecret) -> Self {
        Self { secret }
    }

    /// Sign `method` + `path` with the current time.
    pub fn sign(&self, method: &str, path: &str) -> Result<SignedHeaders, SignatureError> {
        self.sign_at(method, path, Utc::now())
    }

    pub fn sign_at(
        &self,
        method: &str,
        path: &str,
        at: DateTime<Utc>,
    ) -> Result<SignedHeaders, SignatureError> {
        let timestamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let signature = self
            .secret
            .sign_message(payload(method, path, &timestamp).as_bytes())?;
        Ok(SignedHeaders {
            signature,
            timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Checks inbound signatures.  With `max_age` unset any correctly signed
/// timestamp is accepted, so a captured request can be replayed forever.
#[derive(Debug, Clone)]
pub struct Verifier {
    secret: SharedSecret,
    max_age: Option<Duration>,
}

impl Verifier {
    pub fn new(secret: SharedSecret, max_age: Option<Duration>) -> Self {
        Self { secret, max_age }
    }

    pub fn verify(
        &self,
        method: &str,
        path: &str,
        timestamp: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), SignatureError> {
        self.verify_at(method, path, timestamp, signature, Utc::now())
    }

    pub fn verify_at(
        &self,
        method: &str,
        path: &str,
        timestamp: Option<&str>,
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let signature = signature.ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;
        let timestamp = timestamp.ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;

        self.secret
            .verify_message(payload(method, path, timestamp).as_bytes(), signature)?;

        if let Some(max_age) = self.max_age {
            let signed_at = DateTime::parse_from_rfc3339(timestamp)
                .map_err(|_| SignatureError::MalformedTimestamp)?
                .with_timezone(&Utc);
            let skew = now.signed_duration_since(signed_at);
            let window_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
            if skew.num_milliseconds().saturating_abs() > window_ms {
                return Err(SignatureError::Stale {
                    skew_secs: skew.num_seconds(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn secret() -> SharedSecret {
        SharedSecret::new("a very secret value").unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    // ── Round trip ───────────────────────────────────────────────────

    #[test]
    fn test_sign_verify_round_trip() {
        let signed = RequestSigner::new(secret())
            .sign_at("PUT", "/repo/new", at(0))
            .unwrap();
        let verifier = Verifier::new(secret(), None);
        verifier
            .verify_at(
                "PUT",
                "/repo/new",
                Some(&signed.timestamp),
                Some(&signed.signature),
                at(0),
            )
            .unwrap();
    }

    #[test]
    fn test_tampered_fields_fail() {
        let signed = RequestSigner::new(secret())
            .sign_at("PUT", "/repo/new", at(0))
            .unwrap();
        let verifier = Verifier::new(secret(), None);
        let other_ts = at(1).to_rfc3339_opts(SecondsFormat::Secs, true);

        let cases = [
            ("POST", "/repo/new", signed.timestamp.as_str()),
            ("PUT", "/repo", signed.timestamp.as_str()),
            ("PUT", "/repo/new", other_ts.as_str()),
        ];
        for (method, path, ts) in cases {
            assert_eq!(
                verifier.verify_at(method, path, Some(ts), Some(&signed.signature), at(0)),
                Err(SignatureError::Mismatch),
                "{method} {path} {ts}"
            );
        }
    }

    #[test]
    fn test_wrong_secret_fails() {
        let signed = RequestSigner::new(SharedSecret::new("other").unwrap())
            .sign_at("GET", "/keys", at(0))
            .unwrap();
        let result = Verifier::new(secret(), None).verify_at(
            "GET",
            "/keys",
            Some(&signed.timestamp),
            Some(&signed.signature),
            at(0),
        );
        assert_eq!(result, Err(SignatureError::Mismatch));
    }

    // ── Malformed input ──────────────────────────────────────────────

    #[test]
    fn test_missing_headers() {
        let verifier = Verifier::new(secret(), None);
        assert_eq!(
            verifier.verify("GET", "/keys", Some("2024-01-01T00:00:00Z"), None),
            Err(SignatureError::MissingHeader(SIGNATURE_HEADER))
        );
        assert_eq!(
            verifier.verify("GET", "/keys", None, Some("00")),
            Err(SignatureError::MissingHeader(TIMESTAMP_HEADER))
        );
    }

    #[test]
    fn test_non_hex_signature() {
        let verifier = Verifier::new(secret(), None);
        assert_eq!(
            verifier.verify("GET", "/keys", Some("2024-01-01T00:00:00Z"), Some("zz-not-hex")),
            Err(SignatureError::MalformedSignature)
        );
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert_eq!(SharedSecret::new("").unwrap_err(), SignatureError::EmptySecret);
    }

    // ── Freshness ────────────────────────────────────────────────────

    #[test]
    fn test_old_timestamp_verifies_without_window() {
        let signed = RequestSigner::new(secret())
            .sign_at("GET", "/keys", at(0))
            .unwrap();
        let a_year_later = at(365 * 24 * 3600);
        Verifier::new(secret(), None)
            .verify_at(
                "GET",
                "/keys",
                Some(&signed.timestamp),
                Some(&signed.signature),
                a_year_later,
            )
            .unwrap();
    }

    #[test]
    fn test_old_timestamp_rejected_with_window() {
        let signed = RequestSigner::new(secret())
            .sign_at("GET", "/keys", at(0))
            .unwrap();
        let verifier = Verifier::new(secret(), Some(Duration::from_secs(60)));

        verifier
            .verify_at(
                "GET",
                "/keys",
                Some(&signed.timestamp),
                Some(&signed.signature),
                at(59),
            )
            .unwrap();
        assert_eq!(
            verifier.verify_at(
                "GET",
                "/keys",
                Some(&signed.timestamp),
                Some(&signed.signature),
                at(120),
            ),
            Err(SignatureError::Stale { skew_secs: 120 })
        );
        // Far-future timestamps are just as suspicious.
        assert_eq!(
            verifier.verify_at(
                "GET",
                "/keys",
                Some(&signed.timestamp),
                Some(&signed.signature),
                at(-120),
            ),
            Err(SignatureError::Stale { skew_secs: -120 })
        );
    }

    #[test]
    fn test_unparseable_timestamp_with_window() {
        let secret = secret();
        let signature = secret.sign_message(b"GET/keysyesterday").unwrap();
        let verifier = Verifier::new(secret, Some(Duration::from_secs(60)));
        assert_eq!(
            verifier.verify("GET", "/keys", Some("yesterday"), Some(&signature)),
            Err(SignatureError::MalformedTimestamp)
        );
    }
}
