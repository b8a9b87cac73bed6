use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::error::AppResult;
use crate::sharding::mtls_client::{HttpResponse, MtlsClient, MtlsConfig};
use crate::sharding::signed_request::SignedRequestSigner;
use crate::sharding::topology::ShardInfo;

/// Outcome of one routed call against a shard.
#[derive(Debug, Clone, Default)]
pub struct ShardResult {
    pub shard_id: String,
    pub data: Value,
    pub success: bool,
    pub error_msg: String,
    pub execution_time_ms: u64,
    pub http_status: u16,
}

impl ShardResult {
    pub fn failure(shard_id: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            error_msg: error_msg.into(),
            ..Self::default()
        }
    }
}

/// The router's seam to remote shards. `RemoteExecutor` is the production
/// implementation; tests substitute their own.
#[async_trait]
pub trait RemoteDispatch: Send + Sync {
    async fn get(&self, shard: &ShardInfo, path: &str) -> ShardResult;
    async fn post(&self, shard: &ShardInfo, path: &str, body: Value) -> ShardResult;
    async fn put(&self, shard: &ShardInfo, path: &str, body: Value) -> ShardResult;
    async fn delete(&self, shard: &ShardInfo, path: &str) -> ShardResult;

    /// POST `{"query": ...}` to the shard's query endpoint.
    async fn execute_query(&self, shard: &ShardInfo, query: &str) -> ShardResult {
        self.post(shard, "/api/v1/query", json!({ "query": query }))
            .await
    }
}

#[derive(Debug, Clone)]
pub struct RemoteExecutorConfig {
    pub local_shard_id: String,
    /// Wrap body-carrying requests in a signed envelope.
    pub enable_signing: bool,
    pub mtls: MtlsConfig,
}

/// Executes requests on remote shards over mTLS, wrapping payloads in
/// signed envelopes when signing is enabled. GET and DELETE carry no body
/// and rely on the mTLS channel alone.
pub struct RemoteExecutor {
    config: RemoteExecutorConfig,
    client: MtlsClient,
    signer: Option<Arc<SignedRequestSigner>>,
}

impl RemoteExecutor {
    pub fn new(
        config: RemoteExecutorConfig,
        signer: Option<Arc<SignedRequestSigner>>,
    ) -> AppResult<Self> {
        let client = MtlsClient::new(config.mtls.clone())?;
        let signer = if config.enable_signing { signer } else { None };
        Ok(Self {
            config,
            client,
            signer,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.client.is_ready()
    }

    pub fn local_shard_id(&self) -> &str {
        &self.config.local_shard_id
    }

    /// `primary_endpoint` as-is when it already carries a scheme,
    /// otherwise `https://` is prepended.
    fn endpoint_url(shard: &ShardInfo) -> String {
        if shard.primary_endpoint.contains("://") {
            shard.primary_endpoint.clone()
        } else {
            format!("https://{}", shard.primary_endpoint)
        }
    }

    /// Wrap a payload in a signed envelope. Signing failures surface to the
    /// caller instead of degrading to an unsigned request.
    fn wrap_body(&self, method: &str, path: &str, body: Value) -> AppResult<Value> {
        let Some(signer) = &self.signer else {
            return Ok(body);
        };
        let envelope = signer.create_signed_request(method, path, Some(body))?;
        Ok(serde_json::to_value(envelope)?)
    }

    async fn run(
        &self,
        shard: &ShardInfo,
        call: impl std::future::Future<Output = HttpResponse>,
    ) -> ShardResult {
        let started = Instant::now();
        let response = call.await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        convert_response(response, &shard.shard_id, elapsed_ms)
    }
}

#[async_trait]
impl RemoteDispatch for RemoteExecutor {
    async fn get(&self, shard: &ShardInfo, path: &str) -> ShardResult {
        let endpoint = Self::endpoint_url(shard);
        self.run(shard, self.client.get(&endpoint, path)).await
    }

    async fn post(&self, shard: &ShardInfo, path: &str, body: Value) -> ShardResult {
        let endpoint = Self::endpoint_url(shard);
        let body = match self.wrap_body("POST", path, body) {
            Ok(body) => body,
            Err(err) => {
                debug!("Request signing failed: {}", err);
                return ShardResult::failure(&shard.shard_id, err.to_string());
            }
        };
        self.run(shard, self.client.post(&endpoint, path, &body))
            .await
    }

    async fn put(&self, shard: &ShardInfo, path: &str, body: Value) -> ShardResult {
        let endpoint = Self::endpoint_url(shard);
        let body = match self.wrap_body("PUT", path, body) {
            Ok(body) => body,
            Err(err) => {
                debug!("Request signing failed: {}", err);
                return ShardResult::failure(&shard.shard_id, err.to_string());
            }
        };
        self.run(shard, self.client.put(&endpoint, path, &body))
            .await
    }

    async fn delete(&self, shard: &ShardInfo, path: &str) -> ShardResult {
        let endpoint = Self::endpoint_url(shard);
        self.run(shard, self.client.delete(&endpoint, path)).await
    }
}

/// Dispatch used when no mTLS identity is configured: every remote call
/// fails with a clear message, local operation keeps working.
#[derive(Debug, Default)]
pub struct UnconfiguredRemote;

#[async_trait]
impl RemoteDispatch for UnconfiguredRemote {
    async fn get(&self, shard: &ShardInfo, _path: &str) -> ShardResult {
        ShardResult::failure(&shard.shard_id, "remote execution not configured")
    }
    async fn post(&self, shard: &ShardInfo, _path: &str, _body: Value) -> ShardResult {
        ShardResult::failure(&shard.shard_id, "remote execution not configured")
    }
    async fn put(&self, shard: &ShardInfo, _path: &str, _body: Value) -> ShardResult {
        ShardResult::failure(&shard.shard_id, "remote execution not configured")
    }
    async fn delete(&self, shard: &ShardInfo, _path: &str) -> ShardResult {
        ShardResult::failure(&shard.shard_id, "remote execution not configured")
    }
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("local_shard_id", &self.config.local_shard_id)
            .field("signing", &self.signer.is_some())
            .finish()
    }
}

fn convert_response(response: HttpResponse, shard_id: &str, elapsed_ms: u64) -> ShardResult {
    if response.success {
        ShardResult {
            shard_id: shard_id.to_string(),
            data: response.body.unwrap_or(Value::Null),
            success: true,
            error_msg: String::new(),
            execution_time_ms: elapsed_ms,
            http_status: response.status_code,
        }
    } else {
        let error_msg = response
            .error
            .clone()
            .unwrap_or_else(|| format!("HTTP {} {}", response.status_code, response.status_message));
        ShardResult {
            shard_id: shard_id.to_string(),
            data: json!({
                "error": error_msg,
                "status_code": response.status_code,
                "message": response.status_message,
            }),
            success: false,
            error_msg,
            execution_time_ms: elapsed_ms,
            http_status: response.status_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::topology::test_shard;

    #[test]
    fn test_endpoint_url_scheme_handling() {
        let mut shard = test_shard("shard_001", true);
        shard.primary_endpoint = "shard-001.dc1:8443".to_string();
        assert_eq!(
            RemoteExecutor::endpoint_url(&shard),
            "https://shard-001.dc1:8443"
        );

        shard.primary_endpoint = "http://shard-001.dc1:8080".to_string();
        assert_eq!(
            RemoteExecutor::endpoint_url(&shard),
            "http://shard-001.dc1:8080"
        );
    }

    #[test]
    fn test_convert_success_response() {
        let response = HttpResponse {
            status_code: 200,
            status_message: "OK".to_string(),
            body: Some(json!({"results": [1, 2]})),
            raw_body: String::new(),
            success: true,
            error: None,
        };
        let result = convert_response(response, "shard_001", 12);
        assert!(result.success);
        assert_eq!(result.shard_id, "shard_001");
        assert_eq!(result.http_status, 200);
        assert_eq!(result.execution_time_ms, 12);
        assert_eq!(result.data["results"][0], 1);
    }

    #[test]
    fn test_convert_error_response_keeps_envelope() {
        let response = HttpResponse {
            status_code: 500,
            status_message: "Internal Server Error".to_string(),
            body: None,
            raw_body: String::new(),
            success: false,
            error: None,
        };
        let result = convert_response(response, "shard_002", 5);
        assert!(!result.success);
        assert_eq!(result.http_status, 500);
        assert!(result.error_msg.contains("500"));
        assert_eq!(result.data["status_code"], 500);
    }

    #[test]
    fn test_convert_transport_failure() {
        let response = HttpResponse {
            error: Some("Network error (Connect): refused".to_string()),
            ..HttpResponse::default()
        };
        let result = convert_response(response, "shard_003", 0);
        assert!(!result.success);
        assert_eq!(result.http_status, 0);
        assert!(result.error_msg.contains("refused"));
    }
}
