use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, RoutingErrorKind};
use crate::sharding::remote_executor::{RemoteDispatch, ShardResult};
use crate::sharding::resolver::UrnResolver;
use crate::sharding::urn::Urn;

static URN_IN_QUERY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"urn:themis:[^:\s]+:[^:\s]+:[^:\s]+:[0-9a-fA-F-]+").expect("urn regex")
});

static NAMESPACE_IN_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"NAMESPACE\s+([A-Za-z0-9_]+)").expect("namespace regex"));

/// How a query is routed across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// One shard, addressed by a URN literal in the query.
    SingleShard,
    /// Fan out to every healthy shard and merge.
    ScatterGather,
    /// Scoped to one namespace. Until a namespace-to-shard map exists this
    /// degrades to scatter-gather.
    NamespaceLocal,
    /// Join across shards. Phase one is a scatter; the lookup phase is an
    /// acknowledged TODO in the query engine.
    CrossShardJoin,
}

/// In-process execution callback for operations that land on the local
/// shard. The router never links a storage engine; whatever owns one
/// implements this.
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn execute(&self, method: &str, path: &str, body: Option<Value>) -> AppResult<Value>;
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub local_shard_id: String,
    pub scatter_timeout_ms: u64,
    pub max_concurrent_shards: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            local_shard_id: String::new(),
            scatter_timeout_ms: 30_000,
            max_concurrent_shards: 10,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RouterStats {
    pub total_requests: u64,
    pub local_requests: u64,
    pub remote_requests: u64,
    pub scatter_gather_requests: u64,
    pub errors: u64,
}

#[derive(Default)]
struct StatCounters {
    total_requests: AtomicU64,
    local_requests: AtomicU64,
    remote_requests: AtomicU64,
    scatter_gather_requests: AtomicU64,
    errors: AtomicU64,
}

/// Routes data operations and queries to the shards that own them.
///
/// Single-URN operations resolve to one shard and run locally or remotely;
/// queries are classified and either routed to one shard or scattered to
/// all healthy shards and merged.
pub struct ShardRouter {
    resolver: Arc<UrnResolver>,
    executor: Arc<dyn RemoteDispatch>,
    local: Option<Arc<dyn LocalExecutor>>,
    config: RouterConfig,
    stats: StatCounters,
}

impl ShardRouter {
    pub fn new(
        resolver: Arc<UrnResolver>,
        executor: Arc<dyn RemoteDispatch>,
        local: Option<Arc<dyn LocalExecutor>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            resolver,
            executor,
            local,
            config,
            stats: StatCounters::default(),
        }
    }

    /// Fetch the record behind `urn`. `None` covers both "not found" and
    /// per-call failure; failures are counted and logged.
    pub async fn get(&self, urn: &Urn) -> Option<Value> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        let path = format!("/api/v1/data/{}", urn);
        let result = self.route_request(urn, "GET", &path, None).await;

        if result.success {
            return Some(result.data);
        }
        if result.http_status != 404 {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!("GET {} failed on shard {}: {}", urn, result.shard_id, result.error_msg);
        }
        None
    }

    /// Store `data` under `urn`. Returns acceptance.
    pub async fn put(&self, urn: &Urn, data: Value) -> bool {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        let path = format!("/api/v1/data/{}", urn);
        let result = self.route_request(urn, "PUT", &path, Some(data)).await;

        if !result.success {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!("PUT {} failed on shard {}: {}", urn, result.shard_id, result.error_msg);
        }
        result.success
    }

    /// Delete the record behind `urn`. Returns acceptance.
    pub async fn del(&self, urn: &Urn) -> bool {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        let path = format!("/api/v1/data/{}", urn);
        let result = self.route_request(urn, "DELETE", &path, None).await;

        if !result.success {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        result.success
    }

    /// Classify and execute a query. Always returns a well-formed merged
    /// object, even under partial failure.
    pub async fn execute_query(&self, query: &str) -> Value {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        match self.analyze_query(query) {
            RoutingStrategy::SingleShard => {
                if let Some(urn) = extract_urn(query) {
                    let result = self
                        .route_request(&urn, "POST", "/api/v1/query", Some(json!({ "query": query })))
                        .await;
                    if !result.success {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                    return result.data;
                }
                // URN literal did not parse: treat as a full scan.
                self.scatter_and_merge(query).await
            }
            RoutingStrategy::NamespaceLocal => {
                if let Some(namespace) = extract_namespace(query) {
                    debug!(
                        "Namespace-scoped query for '{}' falls back to scatter-gather",
                        namespace
                    );
                }
                self.scatter_and_merge(query).await
            }
            RoutingStrategy::CrossShardJoin => {
                // Phase 1 only: scatter the join query and merge.
                self.scatter_and_merge(query).await
            }
            RoutingStrategy::ScatterGather => self.scatter_and_merge(query).await,
        }
    }

    /// Query classification by cheap text inspection. A URN literal pins
    /// the query to one shard; JOIN and NAMESPACE mark the wider shapes.
    pub fn analyze_query(&self, query: &str) -> RoutingStrategy {
        if query.contains("urn:themis:") {
            return RoutingStrategy::SingleShard;
        }
        if query.to_ascii_lowercase().contains("join") {
            return RoutingStrategy::CrossShardJoin;
        }
        if NAMESPACE_IN_QUERY.is_match(query) {
            return RoutingStrategy::NamespaceLocal;
        }
        RoutingStrategy::ScatterGather
    }

    async fn scatter_and_merge(&self, query: &str) -> Value {
        self.stats
            .scatter_gather_requests
            .fetch_add(1, Ordering::Relaxed);
        let results = self.scatter_gather(query).await;
        if results.iter().any(|r| !r.success) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        merge_results(&results)
    }

    /// Fan a query out to every healthy shard, bounded by
    /// `max_concurrent_shards` in flight and `scatter_timeout_ms` end to
    /// end. Shards that miss the deadline contribute error entries instead
    /// of blocking the merge.
    pub async fn scatter_gather(&self, query: &str) -> Vec<ShardResult> {
        let shards = self.resolver.get_healthy_shards();
        if shards.is_empty() {
            return Vec::new();
        }

        let total = shards.len();
        let mut futs: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = ShardResult> + Send + '_>>> =
            Vec::with_capacity(total);
        for shard in shards.iter() {
            futs.push(Box::pin(self.query_one_shard(shard, query)));
        }
        let mut stream =
            futures::stream::iter(futs).buffer_unordered(self.config.max_concurrent_shards.max(1));

        let timeout = tokio::time::sleep(Duration::from_millis(self.config.scatter_timeout_ms));
        tokio::pin!(timeout);

        let mut results: Vec<ShardResult> = Vec::with_capacity(total);
        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(result) => results.push(result),
                    None => break,
                },
                _ = &mut timeout => {
                    let done: HashSet<String> =
                        results.iter().map(|r| r.shard_id.clone()).collect();
                    for shard in &shards {
                        if !done.contains(shard.shard_id.as_str()) {
                            warn!(
                                "Shard {} missed the scatter deadline of {}ms",
                                shard.shard_id, self.config.scatter_timeout_ms
                            );
                            results.push(ShardResult::failure(
                                &shard.shard_id,
                                AppError::Routing(
                                    RoutingErrorKind::ScatterTimeout,
                                    format!(
                                        "no response within {}ms",
                                        self.config.scatter_timeout_ms
                                    ),
                                )
                                .to_string(),
                            ));
                        }
                    }
                    break;
                }
            }
        }

        results
    }

    async fn query_one_shard(
        &self,
        shard: &crate::sharding::topology::ShardInfo,
        query: &str,
    ) -> ShardResult {
        if shard.shard_id == self.config.local_shard_id {
            self.stats.local_requests.fetch_add(1, Ordering::Relaxed);
            self.execute_local("POST", "/api/v1/query", Some(json!({ "query": query })))
                .await
        } else {
            self.stats.remote_requests.fetch_add(1, Ordering::Relaxed);
            self.executor.execute_query(shard, query).await
        }
    }

    async fn route_request(
        &self,
        urn: &Urn,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> ShardResult {
        let shard = match self.resolver.resolve_primary(urn) {
            Ok(shard) => shard,
            Err(err) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return ShardResult::failure("", err.to_string());
            }
        };

        if self.resolver.is_local(urn) {
            self.stats.local_requests.fetch_add(1, Ordering::Relaxed);
            return self.execute_local(method, path, body).await;
        }

        self.stats.remote_requests.fetch_add(1, Ordering::Relaxed);
        match method {
            "GET" => self.executor.get(&shard, path).await,
            "PUT" => self.executor.put(&shard, path, body.unwrap_or(Value::Null)).await,
            "DELETE" => self.executor.delete(&shard, path).await,
            "POST" => self.executor.post(&shard, path, body.unwrap_or(Value::Null)).await,
            other => ShardResult::failure(&shard.shard_id, format!("unsupported method {}", other)),
        }
    }

    async fn execute_local(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> ShardResult {
        let Some(local) = &self.local else {
            let err = AppError::Routing(
                RoutingErrorKind::LocalHandlerMissing,
                "no local execution callback configured".to_string(),
            );
            return ShardResult::failure(&self.config.local_shard_id, err.to_string());
        };

        let started = Instant::now();
        match local.execute(method, path, body).await {
            Ok(data) => ShardResult {
                shard_id: self.config.local_shard_id.clone(),
                data,
                success: true,
                error_msg: String::new(),
                execution_time_ms: started.elapsed().as_millis() as u64,
                http_status: 200,
            },
            Err(AppError::NotFound(msg)) => ShardResult {
                shard_id: self.config.local_shard_id.clone(),
                data: Value::Null,
                success: false,
                error_msg: msg,
                execution_time_ms: started.elapsed().as_millis() as u64,
                http_status: 404,
            },
            Err(err) => {
                let mut result =
                    ShardResult::failure(&self.config.local_shard_id, err.to_string());
                result.execution_time_ms = started.elapsed().as_millis() as u64;
                result
            }
        }
    }

    pub fn get_statistics(&self) -> RouterStats {
        RouterStats {
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            local_requests: self.stats.local_requests.load(Ordering::Relaxed),
            remote_requests: self.stats.remote_requests.load(Ordering::Relaxed),
            scatter_gather_requests: self.stats.scatter_gather_requests.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    pub fn resolver(&self) -> &Arc<UrnResolver> {
        &self.resolver
    }
}

impl std::fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRouter")
            .field("local_shard_id", &self.config.local_shard_id)
            .field("scatter_timeout_ms", &self.config.scatter_timeout_ms)
            .finish()
    }
}

/// Merge per-shard results into one payload. Array-shaped data (bare
/// arrays, or objects with a top-level `results` array) is flattened;
/// anything else is pushed whole. Errors are collected with their shard
/// ids, never interleaved with data.
pub fn merge_results(results: &[ShardResult]) -> Value {
    let mut merged_results = Vec::new();
    let mut errors = Vec::new();
    let mut success_count = 0usize;

    for result in results {
        if result.success {
            success_count += 1;
            match &result.data {
                Value::Array(items) => merged_results.extend(items.iter().cloned()),
                Value::Object(map) if map.get("results").map_or(false, Value::is_array) => {
                    if let Some(Value::Array(items)) = map.get("results") {
                        merged_results.extend(items.iter().cloned());
                    }
                }
                other => merged_results.push(other.clone()),
            }
        } else {
            errors.push(json!({
                "shard_id": result.shard_id,
                "error": result.error_msg,
            }));
        }
    }

    json!({
        "results": merged_results,
        "errors": errors,
        "success_count": success_count,
        "error_count": results.len() - success_count,
        "shard_count": results.len(),
    })
}

/// Deterministic offset/limit slice over a merged result set.
pub fn apply_pagination(merged: &Value, offset: usize, limit: usize) -> Value {
    let mut paginated = merged.clone();
    let Some(results) = merged.get("results").and_then(Value::as_array) else {
        return paginated;
    };

    let start = offset.min(results.len());
    let end = (start + limit).min(results.len());
    let page: Vec<Value> = results[start..end].to_vec();

    paginated["results"] = Value::Array(page);
    paginated["offset"] = json!(offset);
    paginated["limit"] = json!(limit);
    paginated["total_count"] = json!(results.len());
    paginated
}

fn extract_urn(query: &str) -> Option<Urn> {
    let candidate = URN_IN_QUERY.find(query)?;
    Urn::parse(candidate.as_str()).ok()
}

fn extract_namespace(query: &str) -> Option<String> {
    NAMESPACE_IN_QUERY
        .captures(query)
        .map(|caps| caps[1].to_string())
}
