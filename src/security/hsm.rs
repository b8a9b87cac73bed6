use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::CryptoErrorKind;
use crate::security::pkcs11::{
    self, CkObjectHandle, CkRv, CkSessionHandle, Pkcs11Module, CKM_RSA_PKCS,
    CKM_SHA256_RSA_PKCS, CKO_CERTIFICATE, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY,
};
use crate::sharding::certificate;

pub const ENV_HSM_PIN: &str = "THEMIS_HSM_PIN";
pub const ENV_HSM_SESSION_POOL: &str = "THEMIS_HSM_SESSION_POOL";

/// DER prefix of a SHA-256 DigestInfo, prepended when signing with raw
/// `CKM_RSA_PKCS` instead of the combined mechanism.
const SHA256_DIGEST_INFO_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

#[derive(Debug, Clone)]
pub struct HsmConfig {
    /// PKCS#11 library path. Empty means fallback mode from the start.
    pub library_path: String,
    pub slot_id: u32,
    pub pin: String,
    /// Optional token label filter.
    pub token_label: String,
    /// "RSA-SHA256" or "RSA-SHA384".
    pub signature_algorithm: String,
    pub key_label: String,
    pub session_pool_size: u32,
    pub verbose: bool,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            library_path: String::new(),
            slot_id: 0,
            pin: String::new(),
            token_label: String::new(),
            signature_algorithm: "RSA-SHA256".to_string(),
            key_label: "themis-signing-key".to_string(),
            session_pool_size: 1,
            verbose: false,
        }
    }
}

impl HsmConfig {
    /// Resolve the PIN and pool size, honoring `THEMIS_HSM_PIN` and
    /// `THEMIS_HSM_SESSION_POOL`.
    pub fn resolve_env(mut self) -> Self {
        if self.pin.is_empty() {
            if let Ok(pin) = std::env::var(ENV_HSM_PIN) {
                self.pin = pin;
            }
        }
        if let Ok(pool) = std::env::var(ENV_HSM_SESSION_POOL) {
            if let Ok(size) = pool.parse::<u32>() {
                self.session_pool_size = size.max(1);
            }
        }
        self
    }
}

/// A signature produced by the core. The tag travels with the value so a
/// verifier can refuse fallback signatures by policy instead of guessing
/// from the encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    /// Base64 RSA signature from the HSM.
    Real(String),
    /// Deterministic stand-in: `hex:` + hex(SHA-256(data)).
    Fallback(String),
}

impl Signature {
    pub fn as_str(&self) -> &str {
        match self {
            Signature::Real(s) | Signature::Fallback(s) => s,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Signature::Fallback(_))
    }

    /// Re-tag a wire string: the `hex:` prefix marks fallback signatures.
    pub fn from_wire(s: &str) -> Self {
        if s.starts_with("hex:") {
            Signature::Fallback(s.to_string())
        } else {
            Signature::Real(s.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct HsmSignatureResult {
    pub success: bool,
    pub signature: Option<Signature>,
    pub algorithm: String,
    pub key_id: String,
    pub cert_serial: String,
    pub error_message: String,
    pub timestamp_ms: u64,
}

impl HsmSignatureResult {
    fn failure(message: String) -> Self {
        Self {
            success: false,
            signature: None,
            algorithm: String::new(),
            key_id: String::new(),
            cert_serial: String::new(),
            error_message: message,
            timestamp_ms: 0,
        }
    }

    pub fn signature_b64(&self) -> &str {
        self.signature.as_ref().map(Signature::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HsmKeyInfo {
    pub label: String,
    pub id: String,
    pub algorithm: String,
    pub can_sign: bool,
    pub can_verify: bool,
    pub extractable: bool,
    pub key_size: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct HsmStats {
    pub sign_count: u64,
    pub verify_count: u64,
    pub sign_errors: u64,
    pub verify_errors: u64,
    pub total_sign_time_us: u64,
    pub total_verify_time_us: u64,
    pub pool_size: usize,
    pub pool_round_robin_hits: u64,
}

#[derive(Default)]
struct StatCounters {
    sign_count: AtomicU64,
    verify_count: AtomicU64,
    sign_errors: AtomicU64,
    verify_errors: AtomicU64,
    total_sign_time_us: AtomicU64,
    total_verify_time_us: AtomicU64,
    pool_round_robin_hits: AtomicU64,
}

/// One logged-in PKCS#11 session with its discovered object handles.
/// PKCS#11 sessions are serial; concurrency is bounded by owning one
/// session per pool slot.
struct HsmSession {
    handle: CkSessionHandle,
    private_key: CkObjectHandle,
    public_key: CkObjectHandle,
    certificate: CkObjectHandle,
    ready: bool,
}

/// HSM-backed signing core: the single place private-key operations happen.
///
/// When the PKCS#11 module cannot be loaded, no slot is found, login fails
/// or no private key is discovered, the core stays initialized in a
/// deterministic non-cryptographic fallback mode so tests and early
/// deployments keep running. The mode is visible through `token_info()` and
/// the `Signature::Fallback` tag; verifiers refuse it in production.
pub struct HsmProvider {
    config: HsmConfig,
    module: Option<Pkcs11Module>,
    pool: Vec<HsmSession>,
    real_ready: bool,
    initialized: bool,
    cert_serial: String,
    next_session_idx: AtomicU32,
    stats: StatCounters,
    last_error: Mutex<String>,
}

pub fn map_ckr(rv: CkRv) -> CryptoErrorKind {
    match rv {
        pkcs11::CKR_PIN_INCORRECT => CryptoErrorKind::PinIncorrect,
        pkcs11::CKR_DEVICE_ERROR => CryptoErrorKind::DeviceError,
        pkcs11::CKR_GENERAL_ERROR => CryptoErrorKind::GeneralError,
        pkcs11::CKR_ARGUMENTS_BAD => CryptoErrorKind::ArgumentsBad,
        pkcs11::CKR_SIGNATURE_INVALID => CryptoErrorKind::SignatureInvalid,
        other => CryptoErrorKind::Other(other as u64),
    }
}

fn ckr_message(rv: CkRv) -> String {
    format!("{:?} (CKR 0x{:X})", map_ckr(rv), rv)
}

fn sha256_digest(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

fn digest_info(digest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SHA256_DIGEST_INFO_PREFIX.len() + digest.len());
    out.extend_from_slice(&SHA256_DIGEST_INFO_PREFIX);
    out.extend_from_slice(digest);
    out
}

fn fallback_signature(data: &[u8]) -> String {
    format!("hex:{}", hex::encode(sha256_digest(data)))
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

impl HsmProvider {
    pub fn new(config: HsmConfig) -> Self {
        Self {
            config,
            module: None,
            pool: Vec::new(),
            real_ready: false,
            initialized: false,
            cert_serial: String::new(),
            next_session_idx: AtomicU32::new(0),
            stats: StatCounters::default(),
            last_error: Mutex::new(String::new()),
        }
    }

    /// Open the session pool and discover key material. Always returns
    /// true: failures put the core into fallback mode instead of refusing
    /// to start.
    pub fn initialize(&mut self) -> bool {
        if self.initialized {
            return true;
        }
        self.try_initialize_real();
        self.initialized = true;
        info!(
            "HSM core initialized (mode={}, pool={})",
            if self.real_ready { "pkcs11" } else { "fallback" },
            self.pool.len()
        );
        true
    }

    fn try_initialize_real(&mut self) {
        if self.config.library_path.is_empty() {
            self.enter_fallback("no PKCS#11 library configured");
            return;
        }

        let module = match Pkcs11Module::load(&self.config.library_path) {
            Ok(m) => m,
            Err(e) => {
                self.enter_fallback(&e);
                return;
            }
        };

        let slots = match module.slot_list() {
            Ok(slots) if !slots.is_empty() => slots,
            Ok(_) => {
                self.enter_fallback("no slots with a token present");
                return;
            }
            Err(rv) => {
                self.enter_fallback(&ckr_message(rv));
                return;
            }
        };

        let configured = self.config.slot_id as pkcs11::CkSlotId;
        let slot = if slots.contains(&configured) {
            configured
        } else {
            slots[0]
        };

        let pin = self.config.pin.clone();
        if pin.is_empty() {
            self.enter_fallback("empty PIN, login skipped");
            return;
        }

        let pool_size = self.config.session_pool_size.max(1) as usize;
        let mut pool = Vec::with_capacity(pool_size);

        for i in 0..pool_size {
            let handle = match module.open_session(slot) {
                Ok(h) => h,
                Err(rv) => {
                    warn!("HSM pool session {} open failed: {}", i, ckr_message(rv));
                    continue;
                }
            };
            // Some HSMs require a login per session; a second login on an
            // already-authenticated token is tolerated.
            if let Err(rv) = module.login_user(handle, &pin) {
                if map_ckr(rv) == CryptoErrorKind::PinIncorrect {
                    *self.last_error.lock().unwrap() = ckr_message(rv);
                    module.close_session(handle);
                    self.enter_fallback("login failed: PIN incorrect");
                    return;
                }
            }

            let private_key = module
                .find_object(handle, CKO_PRIVATE_KEY, &self.config.key_label)
                .unwrap_or(0);
            let public_key = module
                .find_object(handle, CKO_PUBLIC_KEY, &self.config.key_label)
                .unwrap_or(0);
            let cert = module
                .find_object(handle, CKO_CERTIFICATE, &self.config.key_label)
                .unwrap_or(0);

            if cert != 0 && self.cert_serial.is_empty() {
                if let Some(der) = module.get_attribute(handle, cert, pkcs11::CKA_VALUE) {
                    self.cert_serial = certificate::serial_from_der(&der).unwrap_or_default();
                }
            }

            pool.push(HsmSession {
                handle,
                private_key,
                public_key,
                certificate: cert,
                ready: private_key != 0,
            });
        }

        let real_ready = pool.iter().any(|s| s.ready);
        self.pool = pool;
        self.module = Some(module);
        self.real_ready = real_ready;

        if !real_ready {
            self.enter_fallback("no private key found in any pool session");
        }
    }

    fn enter_fallback(&mut self, reason: &str) {
        if !self.real_ready {
            warn!("HSM core falling back to deterministic mode: {}", reason);
        }
        self.real_ready = false;
    }

    pub fn finalize(&mut self) {
        if !self.initialized {
            return;
        }
        if let Some(module) = &self.module {
            for session in &self.pool {
                module.logout(session.handle);
                module.close_session(session.handle);
            }
            module.finalize_module();
        }
        self.pool.clear();
        self.module = None;
        self.real_ready = false;
        self.initialized = false;
    }

    /// Round-robin session pick without locks: fetch-add modulo pool size,
    /// scan forward for a ready slot. Release is a no-op; the pool size is
    /// the concurrency bound.
    fn acquire_session(&self) -> Option<&HsmSession> {
        let pool_size = self.pool.len();
        if pool_size == 0 {
            return None;
        }
        for _ in 0..pool_size {
            let idx =
                self.next_session_idx.fetch_add(1, Ordering::Relaxed) as usize % pool_size;
            if self.pool[idx].ready {
                self.stats
                    .pool_round_robin_hits
                    .fetch_add(1, Ordering::Relaxed);
                return Some(&self.pool[idx]);
            }
        }
        self.pool.iter().find(|s| s.ready)
    }

    fn use_combined_mechanism(&self) -> bool {
        self.config.signature_algorithm.contains("SHA256")
    }

    /// Sign `data`. Combined hash-and-sign mechanism when the configured
    /// algorithm names SHA256; otherwise SHA-256 + DigestInfo + raw RSA.
    pub fn sign(&self, data: &[u8], key_label: Option<&str>) -> HsmSignatureResult {
        let started = Instant::now();
        if !self.initialized {
            self.stats.sign_errors.fetch_add(1, Ordering::Relaxed);
            return HsmSignatureResult::failure("HSM core not initialized".to_string());
        }

        if !self.real_ready {
            let result = self.finish_sign(
                Signature::Fallback(fallback_signature(data)),
                key_label,
                "FALLBACK".to_string(),
                started,
            );
            return result;
        }

        let input = if self.use_combined_mechanism() {
            data.to_vec()
        } else {
            digest_info(&sha256_digest(data))
        };
        self.sign_raw(&input, key_label, started)
    }

    /// Sign a pre-computed hash. Always takes the DigestInfo + raw RSA
    /// path; the combined mechanism would hash a second time.
    pub fn sign_hash(&self, hash: &[u8], key_label: Option<&str>) -> HsmSignatureResult {
        let started = Instant::now();
        if !self.initialized {
            self.stats.sign_errors.fetch_add(1, Ordering::Relaxed);
            return HsmSignatureResult::failure("HSM core not initialized".to_string());
        }

        if !self.real_ready {
            let sig = Signature::Fallback(format!("hex:{}", hex::encode(hash)));
            return self.finish_sign(sig, key_label, "FALLBACK".to_string(), started);
        }

        self.sign_with_mechanism(&digest_info(hash), CKM_RSA_PKCS, key_label, started)
    }

    fn sign_raw(
        &self,
        input: &[u8],
        key_label: Option<&str>,
        started: Instant,
    ) -> HsmSignatureResult {
        let mechanism = if self.use_combined_mechanism() {
            CKM_SHA256_RSA_PKCS
        } else {
            CKM_RSA_PKCS
        };
        self.sign_with_mechanism(input, mechanism, key_label, started)
    }

    fn sign_with_mechanism(
        &self,
        input: &[u8],
        mechanism: pkcs11::CkUlong,
        key_label: Option<&str>,
        started: Instant,
    ) -> HsmSignatureResult {
        let Some(module) = &self.module else {
            self.stats.sign_errors.fetch_add(1, Ordering::Relaxed);
            return HsmSignatureResult::failure("PKCS#11 module not loaded".to_string());
        };
        let Some(session) = self.acquire_session() else {
            self.stats.sign_errors.fetch_add(1, Ordering::Relaxed);
            return HsmSignatureResult::failure("no ready HSM session".to_string());
        };

        match module.sign(session.handle, mechanism, session.private_key, input) {
            Ok(sig) => {
                let serial = if self.cert_serial.is_empty() {
                    "UNKNOWN".to_string()
                } else {
                    self.cert_serial.clone()
                };
                self.finish_sign(Signature::Real(BASE64.encode(sig)), key_label, serial, started)
            }
            Err(rv) => {
                let message = ckr_message(rv);
                *self.last_error.lock().unwrap() = message.clone();
                self.stats.sign_errors.fetch_add(1, Ordering::Relaxed);
                HsmSignatureResult::failure(message)
            }
        }
    }

    fn finish_sign(
        &self,
        signature: Signature,
        key_label: Option<&str>,
        cert_serial: String,
        started: Instant,
    ) -> HsmSignatureResult {
        self.stats.sign_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_sign_time_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        HsmSignatureResult {
            success: true,
            signature: Some(signature),
            algorithm: self.config.signature_algorithm.clone(),
            key_id: key_label.unwrap_or(&self.config.key_label).to_string(),
            cert_serial,
            error_message: String::new(),
            timestamp_ms: now_ms(),
        }
    }

    /// Verify `signature_b64` over `data`. Mirror of `sign`; any PKCS#11
    /// error is reported as false.
    pub fn verify(&self, data: &[u8], signature_b64: &str, _key_label: Option<&str>) -> bool {
        let started = Instant::now();
        if !self.initialized {
            self.stats.verify_errors.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let ok = if !self.real_ready {
            signature_b64 == fallback_signature(data)
        } else {
            self.verify_real(data, signature_b64)
        };

        if ok {
            self.stats.verify_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.verify_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .total_verify_time_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        ok
    }

    fn verify_real(&self, data: &[u8], signature_b64: &str) -> bool {
        let Some(module) = &self.module else {
            return false;
        };
        let Some(session) = self.acquire_session() else {
            return false;
        };
        if session.public_key == 0 {
            return false;
        }
        let Ok(sig) = BASE64.decode(signature_b64) else {
            return false;
        };

        let (mechanism, input) = if self.use_combined_mechanism() {
            (CKM_SHA256_RSA_PKCS, data.to_vec())
        } else {
            (CKM_RSA_PKCS, digest_info(&sha256_digest(data)))
        };

        module
            .verify(session.handle, mechanism, session.public_key, &input, &sig)
            .is_ok()
    }

    pub fn list_keys(&self) -> Vec<HsmKeyInfo> {
        vec![HsmKeyInfo {
            label: self.config.key_label.clone(),
            id: if self.real_ready {
                "pkcs11".to_string()
            } else {
                "fallback".to_string()
            },
            algorithm: self.config.signature_algorithm.clone(),
            can_sign: true,
            can_verify: true,
            extractable: false,
            key_size: if self.real_ready { 2048 } else { 0 },
        }]
    }

    pub fn is_ready(&self) -> bool {
        self.initialized
    }

    pub fn is_fallback(&self) -> bool {
        !self.real_ready
    }

    /// Human-readable mode string. Contains "fallback" whenever the
    /// deterministic mode is active so operators and tests can detect it.
    pub fn token_info(&self) -> String {
        if self.real_ready {
            format!(
                "PKCS#11 token active (slot {}, pool {})",
                self.config.slot_id,
                self.pool.len()
            )
        } else {
            "PKCS#11 fallback mode (deterministic, non-cryptographic)".to_string()
        }
    }

    pub fn cert_serial(&self) -> &str {
        &self.cert_serial
    }

    /// DER certificate stored next to the signing key, when the token has
    /// one.
    pub fn certificate_der(&self) -> Option<Vec<u8>> {
        let module = self.module.as_ref()?;
        let session = self.pool.iter().find(|s| s.certificate != 0)?;
        module.get_attribute(session.handle, session.certificate, pkcs11::CKA_VALUE)
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().unwrap().clone()
    }

    pub fn stats(&self) -> HsmStats {
        HsmStats {
            sign_count: self.stats.sign_count.load(Ordering::Relaxed),
            verify_count: self.stats.verify_count.load(Ordering::Relaxed),
            sign_errors: self.stats.sign_errors.load(Ordering::Relaxed),
            verify_errors: self.stats.verify_errors.load(Ordering::Relaxed),
            total_sign_time_us: self.stats.total_sign_time_us.load(Ordering::Relaxed),
            total_verify_time_us: self.stats.total_verify_time_us.load(Ordering::Relaxed),
            pool_size: self.pool.len(),
            pool_round_robin_hits: self.stats.pool_round_robin_hits.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.stats.sign_count.store(0, Ordering::Relaxed);
        self.stats.verify_count.store(0, Ordering::Relaxed);
        self.stats.sign_errors.store(0, Ordering::Relaxed);
        self.stats.verify_errors.store(0, Ordering::Relaxed);
        self.stats.total_sign_time_us.store(0, Ordering::Relaxed);
        self.stats.total_verify_time_us.store(0, Ordering::Relaxed);
        self.stats.pool_round_robin_hits.store(0, Ordering::Relaxed);
    }
}

impl Drop for HsmProvider {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl std::fmt::Debug for HsmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmProvider")
            .field("key_label", &self.config.key_label)
            .field("real_ready", &self.real_ready)
            .field("pool", &self.pool.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback_provider() -> HsmProvider {
        let mut provider = HsmProvider::new(HsmConfig {
            library_path: "/does/not/exist/libsofthsm2.so".to_string(),
            ..HsmConfig::default()
        });
        assert!(provider.initialize());
        provider
    }

    #[test]
    fn test_fallback_mode_is_visible() {
        let provider = fallback_provider();
        assert!(provider.is_ready());
        assert!(provider.is_fallback());
        assert!(provider.token_info().contains("fallback"));
    }

    #[test]
    fn test_fallback_sign_verify_round_trip() {
        let provider = fallback_provider();
        let result = provider.sign(b"x", None);
        assert!(result.success);
        assert!(result.signature_b64().starts_with("hex:"));
        assert!(result.timestamp_ms > 0);
        assert!(matches!(result.signature, Some(Signature::Fallback(_))));

        assert!(provider.verify(b"x", result.signature_b64(), None));
        assert!(!provider.verify(b"y", result.signature_b64(), None));
    }

    #[test]
    fn test_sign_verify_bit_flip() {
        let provider = fallback_provider();
        let result = provider.sign(b"Hello HSM", None);
        assert!(result.success);
        assert!(!result.signature_b64().is_empty());
        assert!(provider.verify(b"Hello HSM", result.signature_b64(), None));
        assert!(!provider.verify(b"Hello hsm", result.signature_b64(), None));
    }

    #[test]
    fn test_sign_hash_uses_given_digest() {
        let provider = fallback_provider();
        let digest = sha256_digest(b"payload");
        let result = provider.sign_hash(&digest, None);
        assert!(result.success);
        assert_eq!(
            result.signature_b64(),
            format!("hex:{}", hex::encode(&digest))
        );
    }

    #[test]
    fn test_stats_accumulate_and_reset() {
        let provider = fallback_provider();
        let sig = provider.sign(b"a", None);
        provider.verify(b"a", sig.signature_b64(), None);
        provider.verify(b"b", sig.signature_b64(), None);

        let stats = provider.stats();
        assert_eq!(stats.sign_count, 1);
        assert_eq!(stats.verify_count, 1);
        assert_eq!(stats.verify_errors, 1);

        provider.reset_stats();
        let stats = provider.stats();
        assert_eq!(stats.sign_count, 0);
        assert_eq!(stats.verify_errors, 0);
    }

    #[test]
    fn test_list_keys() {
        let provider = fallback_provider();
        let keys = provider.list_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].label, "themis-signing-key");
        assert!(!keys[0].extractable);
    }

    #[test]
    fn test_signature_wire_tagging() {
        assert!(Signature::from_wire("hex:00ff").is_fallback());
        assert!(!Signature::from_wire("AAAA").is_fallback());
    }

    #[test]
    fn test_env_pool_override() {
        std::env::set_var(ENV_HSM_SESSION_POOL, "4");
        let config = HsmConfig::default().resolve_env();
        assert_eq!(config.session_pool_size, 4);
        std::env::remove_var(ENV_HSM_SESSION_POOL);
    }
}
