use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, NetworkErrorKind, TlsErrorKind};

/// mTLS client configuration. One client instance serves a shard process;
/// the same identity is presented to every peer.
#[derive(Debug, Clone)]
pub struct MtlsConfig {
    /// Client certificate chain (PEM).
    pub cert_path: String,
    /// Client private key (PEM).
    pub key_path: String,
    /// Passphrase for an encrypted PKCS#8 key.
    pub key_passphrase: String,
    /// Root CA bundle (PEM).
    pub ca_cert_path: String,
    /// Optional CRL file checked by the certificate layer.
    pub crl_path: String,

    /// "TLSv1.2" or "TLSv1.3". Lower versions are never negotiated.
    pub tls_version: String,
    pub verify_peer: bool,
    pub verify_hostname: bool,

    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,

    pub enable_pooling: bool,
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
}

impl Default for MtlsConfig {
    fn default() -> Self {
        Self {
            cert_path: String::new(),
            key_path: String::new(),
            key_passphrase: String::new(),
            ca_cert_path: String::new(),
            crl_path: String::new(),
            tls_version: "TLSv1.3".to_string(),
            verify_peer: true,
            verify_hostname: true,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            enable_pooling: true,
            max_connections: 10,
            idle_timeout_ms: 60_000,
        }
    }
}

/// Result of one HTTP exchange. `success` tracks the status class only;
/// transport failures leave `status_code` at 0 and set `error`.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_message: String,
    pub body: Option<Value>,
    pub raw_body: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Accepts the chain when WebPKI does, but tolerates a hostname mismatch.
/// Installed only when `verify_hostname` is off.
#[derive(Debug)]
struct NoHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for NoHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(err))
                if matches!(
                    err,
                    CertificateError::NotValidForName
                        | CertificateError::NotValidForNameContext { .. }
                ) =>
            {
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Skips peer verification entirely. Installed only when `verify_peer`
/// is off, which is logged loudly at construction.
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

struct PooledConn {
    sender: SendRequest<Full<Bytes>>,
    last_used: Instant,
}

/// Idle http1 connections keyed by endpoint. Each endpoint gets its own
/// mutex so a slow peer never blocks checkout for the others.
#[derive(Default)]
struct ConnectionPool {
    endpoints: RwLock<HashMap<String, Arc<Mutex<Vec<PooledConn>>>>>,
}

impl ConnectionPool {
    fn bucket(&self, endpoint: &str) -> Arc<Mutex<Vec<PooledConn>>> {
        if let Some(bucket) = self.endpoints.read().unwrap().get(endpoint) {
            return bucket.clone();
        }
        self.endpoints
            .write()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }

    fn checkout(&self, endpoint: &str, idle_timeout: Duration) -> Option<SendRequest<Full<Bytes>>> {
        let bucket = self.bucket(endpoint);
        let mut conns = bucket.lock().unwrap();
        conns.retain(|c| c.last_used.elapsed() < idle_timeout && !c.sender.is_closed());
        conns.pop().map(|c| c.sender)
    }

    fn checkin(&self, endpoint: &str, sender: SendRequest<Full<Bytes>>, max: usize) {
        if sender.is_closed() {
            return;
        }
        let bucket = self.bucket(endpoint);
        let mut conns = bucket.lock().unwrap();
        if conns.len() < max {
            conns.push(PooledConn {
                sender,
                last_used: Instant::now(),
            });
        }
    }

    fn clear(&self) {
        self.endpoints.write().unwrap().clear();
    }
}

/// Mutual-TLS HTTP/1.1 client for shard-to-shard calls.
///
/// Both sides present certificates; trust is anchored at the cluster CA.
/// Network-class failures are retried with exponential backoff, TLS and
/// HTTP-level failures are not.
pub struct MtlsClient {
    config: MtlsConfig,
    connector: TlsConnector,
    pool: ConnectionPool,
}

impl MtlsClient {
    pub fn new(config: MtlsConfig) -> AppResult<Self> {
        let tls_config = build_tls_config(&config)?;
        Ok(Self {
            config,
            connector: TlsConnector::from(tls_config),
            pool: ConnectionPool::default(),
        })
    }

    pub fn config(&self) -> &MtlsConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        !self.config.cert_path.is_empty()
            && !self.config.key_path.is_empty()
            && !self.config.ca_cert_path.is_empty()
    }

    /// Drop all pooled connections.
    pub fn reset(&self) {
        self.pool.clear();
    }

    pub async fn get(&self, endpoint: &str, path: &str) -> HttpResponse {
        self.request(Method::GET, endpoint, path, None).await
    }

    pub async fn post(&self, endpoint: &str, path: &str, body: &Value) -> HttpResponse {
        self.request(Method::POST, endpoint, path, Some(body)).await
    }

    pub async fn put(&self, endpoint: &str, path: &str, body: &Value) -> HttpResponse {
        self.request(Method::PUT, endpoint, path, Some(body)).await
    }

    pub async fn delete(&self, endpoint: &str, path: &str) -> HttpResponse {
        self.request(Method::DELETE, endpoint, path, None).await
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        path: &str,
        body: Option<&Value>,
    ) -> HttpResponse {
        let mut retry_delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut last_error: Option<AppError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.attempt(&method, endpoint, path, body).await {
                Ok(response) => return response,
                Err(err) => {
                    if err.is_retryable() && attempt < self.config.max_retries {
                        debug!(
                            "Request {} {}{} failed (attempt {}): {}; retrying in {:?}",
                            method, endpoint, path, attempt + 1, err, retry_delay
                        );
                        tokio::time::sleep(retry_delay).await;
                        retry_delay *= 2;
                        last_error = Some(err);
                        continue;
                    }
                    return HttpResponse {
                        error: Some(err.to_string()),
                        ..HttpResponse::default()
                    };
                }
            }
        }

        HttpResponse {
            error: Some(
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "max retries exceeded".to_string()),
            ),
            ..HttpResponse::default()
        }
    }

    async fn attempt(
        &self,
        method: &Method,
        endpoint: &str,
        path: &str,
        body: Option<&Value>,
    ) -> AppResult<HttpResponse> {
        let (host, port) = parse_endpoint(endpoint);

        let mut sender = match self.pooled_sender(endpoint) {
            Some(sender) => sender,
            None => self.connect(&host, port).await?,
        };

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(hyper::header::HOST, format!("{}:{}", host, port))
            .header(hyper::header::USER_AGENT, "themis-mtls-client/1.0")
            .header(hyper::header::ACCEPT, "application/json");

        let payload = match body {
            Some(value) => {
                builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
                Bytes::from(serde_json::to_vec(value).map_err(|e| {
                    AppError::Internal(format!("Failed to serialize request body: {}", e))
                })?)
            }
            None => Bytes::new(),
        };

        let request = builder
            .body(Full::new(payload))
            .map_err(|e| AppError::Internal(format!("Failed to build request: {}", e)))?;

        let request_timeout = Duration::from_millis(self.config.request_timeout_ms);
        let response = tokio::time::timeout(request_timeout, async {
            let res = sender
                .send_request(request)
                .await
                .map_err(map_hyper_error)?;
            let status = res.status();
            let bytes = res
                .into_body()
                .collect()
                .await
                .map_err(map_hyper_error)?
                .to_bytes();
            Ok::<_, AppError>((status, bytes))
        })
        .await
        .map_err(|_| {
            AppError::Network(
                NetworkErrorKind::Timeout,
                format!("request to {} timed out", endpoint),
            )
        })??;

        let (status, bytes) = response;

        if self.config.enable_pooling {
            self.pool
                .checkin(endpoint, sender, self.config.max_connections);
        }

        let raw_body = String::from_utf8_lossy(&bytes).to_string();
        let parsed = if raw_body.is_empty() {
            None
        } else {
            serde_json::from_str(&raw_body).ok()
        };

        Ok(HttpResponse {
            status_code: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or("").to_string(),
            body: parsed,
            raw_body,
            success: status.is_success(),
            error: None,
        })
    }

    fn pooled_sender(&self, endpoint: &str) -> Option<SendRequest<Full<Bytes>>> {
        if !self.config.enable_pooling {
            return None;
        }
        self.pool
            .checkout(endpoint, Duration::from_millis(self.config.idle_timeout_ms))
    }

    async fn connect(&self, host: &str, port: u16) -> AppResult<SendRequest<Full<Bytes>>> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                AppError::Network(
                    NetworkErrorKind::Timeout,
                    format!("connect to {}:{} timed out", host, port),
                )
            })?
            .map_err(|e| {
                AppError::Network(
                    NetworkErrorKind::Connect,
                    format!("connect to {}:{} failed: {}", host, port, e),
                )
            })?;
        tcp.set_nodelay(true).ok();

        // SNI is always sent; the hostname check is controlled separately
        // through the verifier.
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            AppError::Tls(
                TlsErrorKind::Hostname,
                format!("'{}' is not a valid SNI hostname", host),
            )
        })?;

        let tls = tokio::time::timeout(connect_timeout, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| {
                AppError::Network(
                    NetworkErrorKind::Timeout,
                    format!("TLS handshake with {}:{} timed out", host, port),
                )
            })?
            .map_err(map_handshake_error)?;

        let (sender, conn) = http1::handshake(TokioIo::new(tls)).await.map_err(|e| {
            AppError::Network(
                NetworkErrorKind::Connect,
                format!("HTTP handshake failed: {}", e),
            )
        })?;

        // The driver task owns the socket; it finishes when the peer or
        // the pool drops the sender.
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("Connection closed: {}", err);
            }
        });

        Ok(sender)
    }
}

impl std::fmt::Debug for MtlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsClient")
            .field("tls_version", &self.config.tls_version)
            .field("pooling", &self.config.enable_pooling)
            .finish()
    }
}

fn map_hyper_error(err: hyper::Error) -> AppError {
    let kind = if err.is_timeout() {
        NetworkErrorKind::Timeout
    } else if err.is_incomplete_message() || err.is_body_write_aborted() {
        NetworkErrorKind::Read
    } else {
        NetworkErrorKind::Write
    };
    AppError::Network(kind, err.to_string())
}

/// TLS handshake failures come back as io errors wrapping `rustls::Error`.
/// Certificate problems must not be retried, so they map to the TLS class.
fn map_handshake_error(err: std::io::Error) -> AppError {
    let message = err.to_string();
    if let Some(inner) = err.get_ref() {
        if let Some(tls_err) = inner.downcast_ref::<rustls::Error>() {
            let kind = match tls_err {
                rustls::Error::InvalidCertificate(CertificateError::NotValidForName) => {
                    TlsErrorKind::Hostname
                }
                rustls::Error::InvalidCertificate(CertificateError::NotValidForNameContext {
                    ..
                }) => TlsErrorKind::Hostname,
                rustls::Error::InvalidCertificate(_) => TlsErrorKind::PeerUntrusted,
                rustls::Error::AlertReceived(_) => TlsErrorKind::HandshakeFailed,
                _ => TlsErrorKind::HandshakeFailed,
            };
            return AppError::Tls(kind, message);
        }
    }
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        // Peer closed mid-handshake.
        return AppError::Tls(TlsErrorKind::Closed, message);
    }
    AppError::from(err)
}

fn build_tls_config(config: &MtlsConfig) -> AppResult<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let versions: &[&rustls::SupportedProtocolVersion] = match config.tls_version.as_str() {
        "TLSv1.2" => &[&rustls::version::TLS12],
        "TLSv1.3" => &[&rustls::version::TLS13],
        other => {
            return Err(AppError::ConfigurationError(format!(
                "Unsupported TLS version '{}'",
                other
            )))
        }
    };

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .map_err(|e| AppError::ConfigurationError(format!("TLS version setup failed: {}", e)))?;

    let builder = if !config.verify_peer {
        warn!("mTLS peer verification is DISABLED");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier { provider }))
    } else if !config.verify_hostname {
        let root_store = load_root_store(&config.ca_cert_path)?;
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(root_store), provider)
            .build()
            .map_err(|e| {
                AppError::ConfigurationError(format!("CA verifier setup failed: {}", e))
            })?;
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoHostnameVerifier { inner }))
    } else {
        let root_store = load_root_store(&config.ca_cert_path)?;
        builder.with_root_certificates(root_store)
    };

    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path, &config.key_passphrase)?;

    let client_config = builder.with_client_auth_cert(certs, key).map_err(|e| {
        AppError::ConfigurationError(format!("Client identity setup failed: {}", e))
    })?;

    Ok(Arc::new(client_config))
}

fn load_root_store(ca_cert_path: &str) -> AppResult<RootCertStore> {
    let data = std::fs::read(ca_cert_path).map_err(|e| {
        AppError::ConfigurationError(format!("Cannot read CA bundle {}: {}", ca_cert_path, e))
    })?;
    let mut store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut data.as_slice()) {
        let cert = cert.map_err(|e| {
            AppError::ConfigurationError(format!("Invalid certificate in CA bundle: {}", e))
        })?;
        store.add(cert).map_err(|e| {
            AppError::ConfigurationError(format!("Rejected CA certificate: {}", e))
        })?;
    }
    if store.is_empty() {
        return Err(AppError::ConfigurationError(format!(
            "CA bundle {} holds no certificates",
            ca_cert_path
        )));
    }
    Ok(store)
}

fn load_certs(cert_path: &str) -> AppResult<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(cert_path).map_err(|e| {
        AppError::ConfigurationError(format!("Cannot read certificate {}: {}", cert_path, e))
    })?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut data.as_slice()).collect();
    let certs = certs.map_err(|e| {
        AppError::ConfigurationError(format!("Invalid certificate {}: {}", cert_path, e))
    })?;
    if certs.is_empty() {
        return Err(AppError::ConfigurationError(format!(
            "No certificates found in {}",
            cert_path
        )));
    }
    Ok(certs)
}

fn load_private_key(key_path: &str, passphrase: &str) -> AppResult<PrivateKeyDer<'static>> {
    let data = std::fs::read(key_path).map_err(|e| {
        AppError::ConfigurationError(format!("Cannot read private key {}: {}", key_path, e))
    })?;

    if !passphrase.is_empty() {
        return decrypt_private_key(&data, passphrase, key_path);
    }

    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| {
            AppError::ConfigurationError(format!("Invalid private key {}: {}", key_path, e))
        })?
        .ok_or_else(|| {
            AppError::ConfigurationError(format!("No private key found in {}", key_path))
        })
}

/// Decrypt an encrypted PKCS#8 key with the configured passphrase.
fn decrypt_private_key(
    data: &[u8],
    passphrase: &str,
    key_path: &str,
) -> AppResult<PrivateKeyDer<'static>> {
    let pem = std::str::from_utf8(data).map_err(|_| {
        AppError::ConfigurationError(format!("Key file {} is not valid PEM", key_path))
    })?;
    let (label, doc) = pkcs8::Document::from_pem(pem).map_err(|e| {
        AppError::ConfigurationError(format!("Cannot parse key {}: {}", key_path, e))
    })?;
    if label != "ENCRYPTED PRIVATE KEY" {
        return Err(AppError::ConfigurationError(format!(
            "Key {} has passphrase configured but is not an encrypted PKCS#8 key",
            key_path
        )));
    }
    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(doc.as_bytes()).map_err(|e| {
        AppError::ConfigurationError(format!("Invalid encrypted key {}: {}", key_path, e))
    })?;
    let decrypted = encrypted.decrypt(passphrase).map_err(|e| {
        AppError::ConfigurationError(format!("Cannot decrypt key {}: {}", key_path, e))
    })?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        decrypted.as_bytes().to_vec(),
    )))
}

/// Split `[scheme://]host[:port]` into host and port, defaulting to 8080.
pub fn parse_endpoint(endpoint: &str) -> (String, u16) {
    let without_scheme = match endpoint.find("://") {
        Some(pos) => &endpoint[pos + 3..],
        None => endpoint,
    };
    let without_path = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme);

    match without_path.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().unwrap_or(8080);
            (host.to_string(), port)
        }
        None => (without_path.to_string(), 8080),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("https://shard-001.dc1:8443"),
            ("shard-001.dc1".to_string(), 8443)
        );
        assert_eq!(
            parse_endpoint("shard-001.dc1:9000"),
            ("shard-001.dc1".to_string(), 9000)
        );
        assert_eq!(
            parse_endpoint("shard-001.dc1"),
            ("shard-001.dc1".to_string(), 8080)
        );
        assert_eq!(
            parse_endpoint("https://shard-001.dc1:8443/api/v1"),
            ("shard-001.dc1".to_string(), 8443)
        );
    }

    #[test]
    fn test_parse_endpoint_bad_port_falls_back() {
        assert_eq!(
            parse_endpoint("host:notaport"),
            ("host".to_string(), 8080)
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = MtlsConfig::default();
        assert_eq!(config.tls_version, "TLSv1.3");
        assert!(config.verify_peer);
        assert!(config.verify_hostname);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 1_000);
        assert!(config.enable_pooling);
    }

    #[test]
    fn test_client_rejects_unknown_tls_version() {
        let config = MtlsConfig {
            tls_version: "TLSv1.1".to_string(),
            ..MtlsConfig::default()
        };
        assert!(MtlsClient::new(config).is_err());
    }

    #[test]
    fn test_client_requires_readable_ca() {
        let config = MtlsConfig {
            cert_path: "/missing/cert.pem".to_string(),
            key_path: "/missing/key.pem".to_string(),
            ca_cert_path: "/missing/ca.pem".to_string(),
            ..MtlsConfig::default()
        };
        let err = MtlsClient::new(config).unwrap_err();
        assert!(matches!(err, AppError::ConfigurationError(_)));
    }

    #[test]
    fn test_retryability_classes() {
        assert!(AppError::Network(NetworkErrorKind::Connect, String::new()).is_retryable());
        assert!(AppError::Network(NetworkErrorKind::Timeout, String::new()).is_retryable());
        assert!(!AppError::Tls(TlsErrorKind::PeerUntrusted, String::new()).is_retryable());
        assert!(!AppError::Tls(TlsErrorKind::HandshakeFailed, String::new()).is_retryable());
    }
}
