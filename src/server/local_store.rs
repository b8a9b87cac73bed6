use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AppError, AppResult};
use crate::sharding::router::LocalExecutor;

/// In-memory local execution callback. Stands in for a storage engine so
/// a shard process can run end to end; records are keyed by request path
/// and queries scan everything this shard holds.
pub struct MemoryExecutor {
    records: Mutex<HashMap<String, Value>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalExecutor for MemoryExecutor {
    async fn execute(&self, method: &str, path: &str, body: Option<Value>) -> AppResult<Value> {
        match method {
            "GET" => {
                let records = self.records.lock().unwrap();
                records
                    .get(path)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("{} not found", path)))
            }
            "PUT" => {
                let data = body.ok_or_else(|| {
                    AppError::BadRequest("PUT requires a body".to_string())
                })?;
                self.records.lock().unwrap().insert(path.to_string(), data);
                Ok(json!({ "accepted": true }))
            }
            "DELETE" => {
                self.records.lock().unwrap().remove(path);
                Ok(json!({ "accepted": true }))
            }
            "POST" => {
                // Query execution: return every record on this shard. The
                // real engine lives behind this callback in production.
                let records = self.records.lock().unwrap();
                let results: Vec<Value> = records.values().cloned().collect();
                Ok(json!({ "results": results }))
            }
            other => Err(AppError::BadRequest(format!(
                "Unsupported local method {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryExecutor::new();
        store
            .execute("PUT", "/api/v1/data/x", Some(json!({"v": 1})))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        let fetched = store.execute("GET", "/api/v1/data/x", None).await.unwrap();
        assert_eq!(fetched["v"], 1);

        store.execute("DELETE", "/api/v1/data/x", None).await.unwrap();
        let err = store.execute("GET", "/api/v1/data/x", None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_scans_records() {
        let store = MemoryExecutor::new();
        store
            .execute("PUT", "/a", Some(json!({"v": 1})))
            .await
            .unwrap();
        store
            .execute("PUT", "/b", Some(json!({"v": 2})))
            .await
            .unwrap();

        let result = store
            .execute("POST", "/api/v1/query", Some(json!({"query": "all"})))
            .await
            .unwrap();
        assert_eq!(result["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_put_without_body_rejected() {
        let store = MemoryExecutor::new();
        let err = store.execute("PUT", "/x", None).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
