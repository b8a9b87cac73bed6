use axum::{
    extract::{Path as AxumPath, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::security::hsm::HsmProvider;
use crate::sharding::router::{apply_pagination, ShardRouter};
use crate::sharding::signed_request::{SignedRequest, SignedRequestVerifier};
use crate::sharding::urn::Urn;

/// Shared state behind the shard HTTP API.
#[derive(Clone)]
pub struct ShardServerState {
    pub router: Arc<ShardRouter>,
    pub verifier: Option<Arc<SignedRequestVerifier>>,
    pub hsm: Arc<HsmProvider>,
}

/// Build the shard API router: the endpoints peers and clients consume.
pub fn create_shard_router(state: ShardServerState) -> Router {
    Router::new()
        .route("/api/v1/data/{urn}", get(get_data).put(put_data).delete(delete_data))
        .route("/api/v1/query", post(post_query))
        .route("/api/v1/shard/status", get(shard_status))
        .route("/api/v1/shard/nonces/cleanup", post(cleanup_nonces))
        .with_state(state)
}

/// Peel a signed envelope off a request body. Plain bodies pass through;
/// envelopes must verify and match the operation and path they were
/// signed for.
fn unwrap_envelope(
    state: &ShardServerState,
    value: Value,
    operation: &str,
    path: &str,
) -> AppResult<Option<Value>> {
    if !SignedRequest::is_envelope(&value) {
        return Ok(Some(value));
    }

    let envelope: SignedRequest = serde_json::from_value(value)
        .map_err(|e| AppError::BadRequest(format!("Malformed signed envelope: {}", e)))?;

    if let Some(verifier) = &state.verifier {
        verifier.verify(&envelope, None)?;
    } else {
        warn!(
            "Accepting envelope from shard {} without verification: no verifier configured",
            envelope.shard_id
        );
    }

    if envelope.operation != operation || envelope.path != path {
        return Err(AppError::Replay(
            crate::error::ReplayErrorKind::SignatureInvalid,
            format!(
                "envelope signed for {} {} but presented on {} {}",
                envelope.operation, envelope.path, operation, path
            ),
        ));
    }

    Ok(envelope.body)
}

async fn get_data(
    State(state): State<ShardServerState>,
    AxumPath(urn): AxumPath<String>,
) -> AppResult<Json<Value>> {
    let urn = Urn::parse(&urn)?;
    match state.router.get(&urn).await {
        Some(data) => Ok(Json(data)),
        None => Err(AppError::NotFound(format!("{} not found", urn))),
    }
}

async fn put_data(
    State(state): State<ShardServerState>,
    AxumPath(urn): AxumPath<String>,
    Json(body): Json<Value>,
) -> AppResult<Json<Value>> {
    let urn = Urn::parse(&urn)?;
    let path = format!("/api/v1/data/{}", urn);
    let body = unwrap_envelope(&state, body, "PUT", &path)?
        .ok_or_else(|| AppError::BadRequest("PUT requires a body".to_string()))?;

    if state.router.put(&urn, body).await {
        Ok(Json(json!({ "accepted": true })))
    } else {
        Err(AppError::Internal(format!("PUT {} was not accepted", urn)))
    }
}

async fn delete_data(
    State(state): State<ShardServerState>,
    AxumPath(urn): AxumPath<String>,
) -> AppResult<Json<Value>> {
    let urn = Urn::parse(&urn)?;
    if state.router.del(&urn).await {
        Ok(Json(json!({ "accepted": true })))
    } else {
        Err(AppError::Internal(format!("DELETE {} was not accepted", urn)))
    }
}

async fn post_query(
    State(state): State<ShardServerState>,
    Json(body): Json<Value>,
) -> AppResult<Json<Value>> {
    let body = unwrap_envelope(&state, body, "POST", "/api/v1/query")?
        .ok_or_else(|| AppError::BadRequest("Query body required".to_string()))?;

    let query = body
        .get("query")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest("Missing 'query' field".to_string()))?;

    let mut merged = state.router.execute_query(query).await;

    // Optional LIMIT/OFFSET applied after the merge so pagination is
    // deterministic across shards.
    let offset = body.get("offset").and_then(Value::as_u64);
    let limit = body.get("limit").and_then(Value::as_u64);
    if offset.is_some() || limit.is_some() {
        merged = apply_pagination(
            &merged,
            offset.unwrap_or(0) as usize,
            limit.unwrap_or(u64::MAX) as usize,
        );
    }

    Ok(Json(merged))
}

async fn shard_status(State(state): State<ShardServerState>) -> Json<Value> {
    let resolver = state.router.resolver();
    Json(json!({
        "topology": resolver.topology().stats(),
        "ring": {
            "shards": resolver.hash_ring().shard_count(),
            "virtual_nodes": resolver.hash_ring().virtual_node_count(),
            "balance_factor": resolver.hash_ring().balance_factor(),
        },
        "router": state.router.get_statistics(),
        "hsm": {
            "token_info": state.hsm.token_info(),
            "stats": state.hsm.stats(),
        },
    }))
}

async fn cleanup_nonces(State(state): State<ShardServerState>) -> Json<Value> {
    let before = state
        .verifier
        .as_ref()
        .map(|v| v.nonce_cache_len())
        .unwrap_or(0);
    if let Some(verifier) = &state.verifier {
        verifier.cleanup_expired_nonces();
    }
    let after = state
        .verifier
        .as_ref()
        .map(|v| v.nonce_cache_len())
        .unwrap_or(0);
    Json(json!({ "removed": before.saturating_sub(after), "remaining": after }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::hsm::HsmConfig;
    use crate::server::local_store::MemoryExecutor;
    use crate::sharding::hash_ring::{ConsistentHashRing, DEFAULT_VIRTUAL_NODES};
    use crate::sharding::remote_executor::{RemoteDispatch, ShardResult};
    use crate::sharding::resolver::UrnResolver;
    use crate::sharding::router::RouterConfig;
    use crate::sharding::signed_request::{
        CertificateRegistry, SignedRequestSigner, VerifierConfig,
    };
    use crate::sharding::topology::{test_shard, ShardInfo, ShardTopology};
    use async_trait::async_trait;

    struct NoRemote;

    #[async_trait]
    impl RemoteDispatch for NoRemote {
        async fn get(&self, shard: &ShardInfo, _path: &str) -> ShardResult {
            ShardResult::failure(&shard.shard_id, "no remote in tests")
        }
        async fn post(&self, shard: &ShardInfo, _path: &str, _body: Value) -> ShardResult {
            ShardResult::failure(&shard.shard_id, "no remote in tests")
        }
        async fn put(&self, shard: &ShardInfo, _path: &str, _body: Value) -> ShardResult {
            ShardResult::failure(&shard.shard_id, "no remote in tests")
        }
        async fn delete(&self, shard: &ShardInfo, _path: &str) -> ShardResult {
            ShardResult::failure(&shard.shard_id, "no remote in tests")
        }
    }

    fn single_shard_state() -> ShardServerState {
        let topology = Arc::new(ShardTopology::new());
        let ring = Arc::new(ConsistentHashRing::new());
        topology.add_shard(test_shard("shard_001", true));
        ring.add_shard("shard_001", DEFAULT_VIRTUAL_NODES);
        let resolver = Arc::new(UrnResolver::new(topology, ring, "shard_001"));

        let router = Arc::new(ShardRouter::new(
            resolver,
            Arc::new(NoRemote),
            Some(Arc::new(MemoryExecutor::new())),
            RouterConfig {
                local_shard_id: "shard_001".to_string(),
                ..RouterConfig::default()
            },
        ));

        let mut hsm = HsmProvider::new(HsmConfig::default());
        hsm.initialize();

        let verifier = Arc::new(SignedRequestVerifier::new(
            VerifierConfig {
                allow_fallback: true,
                ..VerifierConfig::default()
            },
            Arc::new(CertificateRegistry::new()),
        ));

        ShardServerState {
            router,
            verifier: Some(verifier),
            hsm: Arc::new(hsm),
        }
    }

    const URN: &str = "urn:themis:document:tenants:docs:550e8400-e29b-41d4-a716-446655440000";

    #[tokio::test]
    async fn test_data_round_trip_through_handlers() {
        let state = single_shard_state();

        put_data(
            State(state.clone()),
            AxumPath(URN.to_string()),
            Json(json!({"title": "t"})),
        )
        .await
        .unwrap();

        let fetched = get_data(State(state.clone()), AxumPath(URN.to_string()))
            .await
            .unwrap();
        assert_eq!(fetched.0["title"], "t");

        delete_data(State(state.clone()), AxumPath(URN.to_string()))
            .await
            .unwrap();
        let err = get_data(State(state), AxumPath(URN.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_put_with_signed_envelope() {
        let state = single_shard_state();
        let mut hsm = HsmProvider::new(HsmConfig::default());
        hsm.initialize();
        let signer = SignedRequestSigner::new("shard_peer", Arc::new(hsm));

        let path = format!("/api/v1/data/{}", URN);
        let envelope = signer
            .create_signed_request("PUT", &path, Some(json!({"title": "signed"})))
            .unwrap();

        put_data(
            State(state.clone()),
            AxumPath(URN.to_string()),
            Json(serde_json::to_value(&envelope).unwrap()),
        )
        .await
        .unwrap();

        let fetched = get_data(State(state.clone()), AxumPath(URN.to_string()))
            .await
            .unwrap();
        assert_eq!(fetched.0["title"], "signed");

        // Replaying the same envelope must be rejected.
        let err = put_data(
            State(state),
            AxumPath(URN.to_string()),
            Json(serde_json::to_value(&envelope).unwrap()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Replay(_, _)));
    }

    #[tokio::test]
    async fn test_envelope_path_splice_rejected() {
        let state = single_shard_state();
        let mut hsm = HsmProvider::new(HsmConfig::default());
        hsm.initialize();
        let signer = SignedRequestSigner::new("shard_peer", Arc::new(hsm));

        // Signed for a different path than it is presented on.
        let envelope = signer
            .create_signed_request("PUT", "/api/v1/data/other", Some(json!({"x": 1})))
            .unwrap();

        let err = put_data(
            State(state),
            AxumPath(URN.to_string()),
            Json(serde_json::to_value(&envelope).unwrap()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Replay(_, _)));
    }

    #[tokio::test]
    async fn test_query_handler_with_pagination() {
        let state = single_shard_state();
        for i in 0..3 {
            let urn = format!(
                "urn:themis:document:tenants:docs:550e8400-e29b-41d4-a716-4466554400{:02}",
                i
            );
            put_data(
                State(state.clone()),
                AxumPath(urn),
                Json(json!({"i": i})),
            )
            .await
            .unwrap();
        }

        let merged = post_query(
            State(state.clone()),
            Json(json!({"query": "FOR d IN docs RETURN d"})),
        )
        .await
        .unwrap();
        assert_eq!(merged.0["results"].as_array().unwrap().len(), 3);

        let page = post_query(
            State(state),
            Json(json!({"query": "FOR d IN docs RETURN d", "offset": 0, "limit": 2})),
        )
        .await
        .unwrap();
        assert_eq!(page.0["results"].as_array().unwrap().len(), 2);
        assert_eq!(page.0["total_count"], 3);
    }

    #[tokio::test]
    async fn test_query_requires_query_field() {
        let state = single_shard_state();
        let err = post_query(State(state), Json(json!({"q": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_bad_urn_rejected() {
        let state = single_shard_state();
        let err = get_data(State(state), AxumPath("not-a-urn".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Parse(_, _)));
    }

    #[tokio::test]
    async fn test_status_reports_fallback_hsm() {
        let state = single_shard_state();
        let status = shard_status(State(state)).await;
        assert!(status.0["hsm"]["token_info"]
            .as_str()
            .unwrap()
            .contains("fallback"));
        assert_eq!(status.0["ring"]["shards"], 1);
    }
}
