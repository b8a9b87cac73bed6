use rand::Rng;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, CryptoErrorKind, ReplayErrorKind};
use crate::security::hsm::{HsmProvider, Signature};
use crate::sharding::certificate::{self, ShardCertificateInfo};

/// Authenticated envelope for shard-to-shard requests. Defense in depth on
/// top of mTLS: the timestamp bounds freshness, the nonce kills replays,
/// and the signature binds the payload to the sender's certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest {
    pub shard_id: String,
    /// HTTP method: GET, POST, PUT, DELETE.
    pub operation: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<Value>,
    pub timestamp_ms: u64,
    pub nonce: u64,
    pub signature_b64: String,
    pub cert_serial: String,
}

impl SignedRequest {
    /// Canonical byte string covered by the signature:
    /// `shard_id|operation|path|body_json|timestamp_ms|nonce` where
    /// `body_json` is the compact JSON of the body, or empty when absent.
    pub fn canonical_string(&self) -> String {
        let body_json = self
            .body
            .as_ref()
            .map(|b| serde_json::to_string(b).unwrap_or_default())
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.shard_id, self.operation, self.path, body_json, self.timestamp_ms, self.nonce
        )
    }

    /// Whether a JSON value looks like a signed envelope.
    pub fn is_envelope(value: &Value) -> bool {
        value.get("signature_b64").is_some()
            && value.get("shard_id").is_some()
            && value.get("nonce").is_some()
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Signs outbound envelopes on behalf of the local shard. All private-key
/// operations go through the HSM core; the certificate serial cached there
/// is stamped into every envelope as the sender identity.
pub struct SignedRequestSigner {
    shard_id: String,
    hsm: Arc<HsmProvider>,
}

impl SignedRequestSigner {
    pub fn new(shard_id: impl Into<String>, hsm: Arc<HsmProvider>) -> Self {
        Self {
            shard_id: shard_id.into(),
            hsm,
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Build and sign an envelope for `operation path` with an optional
    /// body. Timestamp is now, nonce comes from the thread CSPRNG.
    pub fn create_signed_request(
        &self,
        operation: &str,
        path: &str,
        body: Option<Value>,
    ) -> AppResult<SignedRequest> {
        let mut request = SignedRequest {
            shard_id: self.shard_id.clone(),
            operation: operation.to_string(),
            path: path.to_string(),
            body,
            timestamp_ms: now_ms(),
            nonce: rand::rng().random::<u64>(),
            signature_b64: String::new(),
            cert_serial: String::new(),
        };

        let canonical = request.canonical_string();
        let result = self.hsm.sign(canonical.as_bytes(), None);
        if !result.success {
            return Err(AppError::Crypto(
                CryptoErrorKind::GeneralError,
                format!("Request signing failed: {}", result.error_message),
            ));
        }

        request.signature_b64 = result.signature_b64().to_string();
        request.cert_serial = result.cert_serial;
        Ok(request)
    }
}

impl std::fmt::Debug for SignedRequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedRequestSigner")
            .field("shard_id", &self.shard_id)
            .finish()
    }
}

/// Known peer certificates, keyed by uppercase serial. The verifier looks
/// up the envelope's `cert_serial` here; a serial it has never seen cannot
/// authenticate anything.
#[derive(Default)]
pub struct CertificateRegistry {
    certs: RwLock<HashMap<String, (ShardCertificateInfo, RsaPublicKey)>>,
}

impl CertificateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: ShardCertificateInfo, public_key: RsaPublicKey) {
        self.certs
            .write()
            .unwrap()
            .insert(info.serial_number.clone(), (info, public_key));
    }

    /// Parse a PEM peer certificate and register it.
    pub fn load_pem(&self, pem_data: &[u8]) -> AppResult<ShardCertificateInfo> {
        let info = certificate::parse_pem(pem_data)?;
        let public_key = certificate::rsa_public_key_from_pem(pem_data)?;
        self.register(info.clone(), public_key);
        Ok(info)
    }

    pub fn get(&self, serial: &str) -> Option<(ShardCertificateInfo, RsaPublicKey)> {
        self.certs.read().unwrap().get(serial).cloned()
    }

    pub fn len(&self) -> usize {
        self.certs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Maximum |now - timestamp_ms| accepted.
    pub max_time_skew_ms: u64,
    /// Nonces older than this are forgotten.
    pub nonce_expiry_ms: u64,
    /// Hard cap on tracked nonces.
    pub max_nonce_cache: usize,
    /// Accept deterministic fallback signatures. Bootstrap and tests only;
    /// production keeps this off.
    pub allow_fallback: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_time_skew_ms: 60_000,
            nonce_expiry_ms: 300_000,
            max_nonce_cache: 10_000,
            allow_fallback: false,
        }
    }
}

/// Verifies inbound envelopes: freshness, replay, signature, and sender
/// identity, in that order.
pub struct SignedRequestVerifier {
    config: VerifierConfig,
    registry: Arc<CertificateRegistry>,
    /// (shard_id, nonce) -> first-seen timestamp. One mutex; entries are
    /// short-lived and capped.
    seen_nonces: Mutex<HashMap<(String, u64), u64>>,
}

impl SignedRequestVerifier {
    pub fn new(config: VerifierConfig, registry: Arc<CertificateRegistry>) -> Self {
        Self {
            config,
            registry,
            seen_nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Verify an envelope. An identical `(shard_id, nonce)` within the
    /// expiry window is a replay: the first envelope is recorded, the
    /// second rejected.
    pub fn verify(&self, request: &SignedRequest, expected_shard_id: Option<&str>) -> AppResult<()> {
        self.verify_timestamp(request)?;
        self.verify_nonce(request)?;
        self.verify_signature(request)?;

        if let Some(expected) = expected_shard_id {
            if expected != request.shard_id {
                warn!(
                    "Envelope shard id {} does not match expected {}",
                    request.shard_id, expected
                );
                return Err(AppError::Replay(
                    ReplayErrorKind::ShardMismatch,
                    format!("expected shard {}, envelope from {}", expected, request.shard_id),
                ));
            }
        }

        Ok(())
    }

    fn verify_timestamp(&self, request: &SignedRequest) -> AppResult<()> {
        let now = now_ms();
        let skew = now.abs_diff(request.timestamp_ms);
        if skew > self.config.max_time_skew_ms {
            return Err(AppError::Replay(
                ReplayErrorKind::TimestampOutOfWindow,
                format!(
                    "timestamp {} is {}ms from now, max skew {}ms (shard {})",
                    request.timestamp_ms, skew, self.config.max_time_skew_ms, request.shard_id
                ),
            ));
        }
        Ok(())
    }

    fn verify_nonce(&self, request: &SignedRequest) -> AppResult<()> {
        let now = now_ms();
        let key = (request.shard_id.clone(), request.nonce);
        let mut seen = self.seen_nonces.lock().unwrap();

        if let Some(&first_seen) = seen.get(&key) {
            if now.saturating_sub(first_seen) <= self.config.nonce_expiry_ms {
                warn!(
                    "Replay detected: nonce {} from shard {} already seen",
                    request.nonce, request.shard_id
                );
                return Err(AppError::Replay(
                    ReplayErrorKind::NonceSeen,
                    format!("nonce {} from shard {} replayed", request.nonce, request.shard_id),
                ));
            }
        }

        if seen.len() >= self.config.max_nonce_cache {
            let expiry = self.config.nonce_expiry_ms;
            seen.retain(|_, &mut ts| now.saturating_sub(ts) <= expiry);
            if seen.len() >= self.config.max_nonce_cache {
                // Cache still full of live nonces: drop the oldest entry.
                if let Some(oldest) = seen
                    .iter()
                    .min_by_key(|(_, &ts)| ts)
                    .map(|(k, _)| k.clone())
                {
                    seen.remove(&oldest);
                }
            }
        }

        seen.insert(key, now);
        Ok(())
    }

    fn verify_signature(&self, request: &SignedRequest) -> AppResult<()> {
        let canonical = request.canonical_string();

        match Signature::from_wire(&request.signature_b64) {
            Signature::Fallback(sig) => {
                if !self.config.allow_fallback {
                    return Err(AppError::Crypto(
                        CryptoErrorKind::FallbackInUse,
                        format!(
                            "fallback signature from shard {} refused by policy",
                            request.shard_id
                        ),
                    ));
                }
                let expected = format!("hex:{}", hex::encode(Sha256::digest(canonical.as_bytes())));
                if sig != expected {
                    return Err(AppError::Replay(
                        ReplayErrorKind::SignatureInvalid,
                        format!("fallback signature mismatch from shard {}", request.shard_id),
                    ));
                }
                debug!(
                    "Accepted fallback signature from shard {} (policy allows)",
                    request.shard_id
                );
                Ok(())
            }
            Signature::Real(sig_b64) => {
                use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

                let Some((info, public_key)) = self.registry.get(&request.cert_serial) else {
                    return Err(AppError::Replay(
                        ReplayErrorKind::SignatureInvalid,
                        format!("unknown certificate serial {}", request.cert_serial),
                    ));
                };

                // The certificate is the identity: its shard id must match
                // the envelope's claimed sender.
                if !info.shard_id.is_empty() && info.shard_id != request.shard_id {
                    return Err(AppError::Replay(
                        ReplayErrorKind::ShardMismatch,
                        format!(
                            "certificate {} belongs to shard {}, envelope claims {}",
                            request.cert_serial, info.shard_id, request.shard_id
                        ),
                    ));
                }

                let sig = BASE64.decode(sig_b64.as_bytes()).map_err(|_| {
                    AppError::Replay(
                        ReplayErrorKind::SignatureInvalid,
                        "signature is not valid base64".to_string(),
                    )
                })?;

                let digest = Sha256::digest(canonical.as_bytes());
                public_key
                    .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &sig)
                    .map_err(|_| {
                        AppError::Replay(
                            ReplayErrorKind::SignatureInvalid,
                            format!("signature verification failed for shard {}", request.shard_id),
                        )
                    })
            }
        }
    }

    /// Drop nonces older than the expiry window. Call periodically.
    pub fn cleanup_expired_nonces(&self) {
        let now = now_ms();
        let expiry = self.config.nonce_expiry_ms;
        let mut seen = self.seen_nonces.lock().unwrap();
        seen.retain(|_, &mut ts| now.saturating_sub(ts) <= expiry);
    }

    pub fn nonce_cache_len(&self) -> usize {
        self.seen_nonces.lock().unwrap().len()
    }
}

impl std::fmt::Debug for SignedRequestVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedRequestVerifier")
            .field("max_time_skew_ms", &self.config.max_time_skew_ms)
            .field("nonces", &self.nonce_cache_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::hsm::HsmConfig;
    use serde_json::json;

    fn fallback_signer(shard_id: &str) -> SignedRequestSigner {
        let mut hsm = HsmProvider::new(HsmConfig::default());
        hsm.initialize();
        SignedRequestSigner::new(shard_id, Arc::new(hsm))
    }

    fn test_verifier(allow_fallback: bool) -> SignedRequestVerifier {
        SignedRequestVerifier::new(
            VerifierConfig {
                allow_fallback,
                ..VerifierConfig::default()
            },
            Arc::new(CertificateRegistry::new()),
        )
    }

    #[test]
    fn test_canonical_string_format() {
        let request = SignedRequest {
            shard_id: "shard_001".to_string(),
            operation: "POST".to_string(),
            path: "/api/v1/query".to_string(),
            body: Some(json!({"a": 1})),
            timestamp_ms: 1000,
            nonce: 42,
            signature_b64: String::new(),
            cert_serial: String::new(),
        };
        assert_eq!(
            request.canonical_string(),
            "shard_001|POST|/api/v1/query|{\"a\":1}|1000|42"
        );

        let no_body = SignedRequest {
            body: None,
            ..request
        };
        assert_eq!(
            no_body.canonical_string(),
            "shard_001|POST|/api/v1/query||1000|42"
        );
    }

    #[test]
    fn test_envelope_json_round_trip() {
        let signer = fallback_signer("shard_001");
        let request = signer
            .create_signed_request("PUT", "/api/v1/data/x", Some(json!({"v": true})))
            .unwrap();

        let wire = serde_json::to_string(&request).unwrap();
        let parsed: SignedRequest = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed.canonical_string(), request.canonical_string());
        assert!(SignedRequest::is_envelope(
            &serde_json::from_str::<Value>(&wire).unwrap()
        ));
        assert!(!SignedRequest::is_envelope(&json!({"v": true})));
    }

    #[test]
    fn test_sign_and_verify_accepts() {
        let signer = fallback_signer("shard_001");
        let verifier = test_verifier(true);

        let request = signer
            .create_signed_request("POST", "/api/v1/data/u", Some(json!({"a": 1})))
            .unwrap();
        verifier.verify(&request, None).unwrap();
    }

    #[test]
    fn test_replay_rejected() {
        let signer = fallback_signer("shard_001");
        let verifier = test_verifier(true);

        let request = signer
            .create_signed_request("POST", "/api/v1/data/u", Some(json!({"a": 1})))
            .unwrap();

        verifier.verify(&request, None).unwrap();
        let err = verifier.verify(&request, None).unwrap_err();
        assert!(matches!(
            err,
            AppError::Replay(ReplayErrorKind::NonceSeen, _)
        ));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let signer = fallback_signer("shard_001");
        let verifier = test_verifier(true);

        let mut request = signer
            .create_signed_request("GET", "/api/v1/data/u", None)
            .unwrap();
        request.timestamp_ms -= 120_000;

        let err = verifier.verify(&request, None).unwrap_err();
        assert!(matches!(
            err,
            AppError::Replay(ReplayErrorKind::TimestampOutOfWindow, _)
        ));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let signer = fallback_signer("shard_001");
        let verifier = test_verifier(true);

        let mut request = signer
            .create_signed_request("POST", "/api/v1/data/u", Some(json!({"a": 1})))
            .unwrap();
        request.body = Some(json!({"a": 2}));

        let err = verifier.verify(&request, None).unwrap_err();
        assert!(matches!(
            err,
            AppError::Replay(ReplayErrorKind::SignatureInvalid, _)
        ));
    }

    #[test]
    fn test_shard_mismatch_rejected() {
        let signer = fallback_signer("shard_001");
        let verifier = test_verifier(true);

        let request = signer
            .create_signed_request("GET", "/api/v1/data/u", None)
            .unwrap();

        let err = verifier.verify(&request, Some("shard_002")).unwrap_err();
        assert!(matches!(
            err,
            AppError::Replay(ReplayErrorKind::ShardMismatch, _)
        ));
    }

    #[test]
    fn test_fallback_refused_by_default() {
        let signer = fallback_signer("shard_001");
        let verifier = test_verifier(false);

        let request = signer
            .create_signed_request("GET", "/api/v1/data/u", None)
            .unwrap();

        let err = verifier.verify(&request, None).unwrap_err();
        assert!(matches!(
            err,
            AppError::Crypto(CryptoErrorKind::FallbackInUse, _)
        ));
    }

    #[test]
    fn test_nonce_cleanup() {
        let signer = fallback_signer("shard_001");
        let verifier = SignedRequestVerifier::new(
            VerifierConfig {
                allow_fallback: true,
                nonce_expiry_ms: 0,
                ..VerifierConfig::default()
            },
            Arc::new(CertificateRegistry::new()),
        );

        let request = signer
            .create_signed_request("GET", "/api/v1/data/u", None)
            .unwrap();
        verifier.verify(&request, None).unwrap();
        assert_eq!(verifier.nonce_cache_len(), 1);

        std::thread::sleep(std::time::Duration::from_millis(5));
        verifier.cleanup_expired_nonces();
        assert_eq!(verifier.nonce_cache_len(), 0);
    }

    #[test]
    fn test_real_rsa_signature_round_trip() {
        use rsa::traits::PublicKeyParts;
        use rsa::RsaPrivateKey;

        let mut rng = rand_core::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = RsaPublicKey::new(private_key.n().clone(), private_key.e().clone())
            .unwrap();

        let registry = Arc::new(CertificateRegistry::new());
        let mut info = crate::sharding::certificate::test_support::sample_info();
        info.serial_number = "0AFF".to_string();
        info.shard_id = "shard_001".to_string();
        registry.register(info, public_key);

        let mut request = SignedRequest {
            shard_id: "shard_001".to_string(),
            operation: "POST".to_string(),
            path: "/api/v1/query".to_string(),
            body: Some(json!({"query": "RETURN 1"})),
            timestamp_ms: now_ms(),
            nonce: 7,
            signature_b64: String::new(),
            cert_serial: "0AFF".to_string(),
        };

        let digest = Sha256::digest(request.canonical_string().as_bytes());
        let sig = private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap();
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        request.signature_b64 = BASE64.encode(sig);

        let verifier = SignedRequestVerifier::new(VerifierConfig::default(), registry);
        verifier.verify(&request, Some("shard_001")).unwrap();

        // Flip the payload: signature no longer matches.
        request.body = Some(json!({"query": "RETURN 2"}));
        request.nonce = 8;
        let err = verifier.verify(&request, None).unwrap_err();
        assert!(matches!(
            err,
            AppError::Replay(ReplayErrorKind::SignatureInvalid, _)
        ));
    }
}
