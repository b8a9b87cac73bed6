use serde::{Deserialize, Serialize};
use std::env;

use crate::security::hsm::HsmConfig;
use crate::sharding::mtls_client::MtlsConfig;
use crate::sharding::router::RouterConfig;
use crate::sharding::signed_request::VerifierConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// This process's shard id. Empty means "client only": every URN
    /// resolves remote.
    pub local_shard_id: String,
    pub virtual_nodes: usize,
    pub replica_count: usize,
    /// JSON topology file; empty disables the file store.
    pub topology_path: String,
}

/// Process configuration, assembled from the environment the way the rest
/// of the deployment tooling expects.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub shard: ShardConfig,
    pub hsm: HsmConfig,
    pub mtls: MtlsConfig,
    pub enable_signing: bool,
    pub allow_fallback_signatures: bool,
    pub scatter_timeout_ms: u64,
    pub max_concurrent_shards: usize,
    /// PEM files of peer shard certificates, comma-separated.
    pub peer_cert_paths: Vec<String>,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let hsm = HsmConfig {
            library_path: env_or("THEMIS_HSM_LIBRARY", ""),
            slot_id: env_parse("THEMIS_HSM_SLOT", 0u32),
            pin: env_or("THEMIS_HSM_PIN", ""),
            token_label: env_or("THEMIS_HSM_TOKEN_LABEL", ""),
            signature_algorithm: env_or("THEMIS_HSM_ALGORITHM", "RSA-SHA256"),
            key_label: env_or("THEMIS_HSM_KEY_LABEL", "themis-signing-key"),
            session_pool_size: env_parse("THEMIS_HSM_SESSION_POOL", 1u32),
            verbose: env_parse("THEMIS_HSM_VERBOSE", false),
        }
        .resolve_env();

        let mtls = MtlsConfig {
            cert_path: env_or("THEMIS_SHARD_CERT", ""),
            key_path: env_or("THEMIS_SHARD_KEY", ""),
            key_passphrase: env_or("THEMIS_SHARD_KEY_PASSPHRASE", ""),
            ca_cert_path: env_or("THEMIS_CLUSTER_CA", ""),
            crl_path: env_or("THEMIS_CLUSTER_CRL", ""),
            tls_version: env_or("THEMIS_TLS_VERSION", "TLSv1.3"),
            verify_peer: env_parse("THEMIS_TLS_VERIFY_PEER", true),
            verify_hostname: env_parse("THEMIS_TLS_VERIFY_HOSTNAME", true),
            connect_timeout_ms: env_parse("THEMIS_CONNECT_TIMEOUT_MS", 5_000u64),
            request_timeout_ms: env_parse("THEMIS_REQUEST_TIMEOUT_MS", 30_000u64),
            max_retries: env_parse("THEMIS_MAX_RETRIES", 3u32),
            retry_delay_ms: env_parse("THEMIS_RETRY_DELAY_MS", 1_000u64),
            enable_pooling: env_parse("THEMIS_CONNECTION_POOLING", true),
            max_connections: env_parse("THEMIS_MAX_CONNECTIONS", 10usize),
            idle_timeout_ms: env_parse("THEMIS_IDLE_TIMEOUT_MS", 60_000u64),
        };

        let peer_cert_paths = env_or("THEMIS_PEER_CERTS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            server: ServerConfig {
                host: env_or("THEMIS_HOST", "0.0.0.0"),
                port: env_parse("THEMIS_PORT", 8443u16),
            },
            shard: ShardConfig {
                local_shard_id: env_or("THEMIS_SHARD_ID", ""),
                virtual_nodes: env_parse("THEMIS_VIRTUAL_NODES", 150usize),
                replica_count: env_parse("THEMIS_REPLICA_COUNT", 2usize),
                topology_path: env_or("THEMIS_TOPOLOGY_PATH", ""),
            },
            hsm,
            mtls,
            enable_signing: env_parse("THEMIS_REQUEST_SIGNING", true),
            allow_fallback_signatures: env_parse("THEMIS_ALLOW_FALLBACK_SIGNATURES", false),
            scatter_timeout_ms: env_parse("THEMIS_SCATTER_TIMEOUT_MS", 30_000u64),
            max_concurrent_shards: env_parse("THEMIS_MAX_CONCURRENT_SHARDS", 10usize),
            peer_cert_paths,
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            local_shard_id: self.shard.local_shard_id.clone(),
            scatter_timeout_ms: self.scatter_timeout_ms,
            max_concurrent_shards: self.max_concurrent_shards,
        }
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            allow_fallback: self.allow_fallback_signatures,
            ..VerifierConfig::default()
        }
    }
}
