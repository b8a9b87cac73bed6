use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, AppResult, ParseErrorKind};

/// RFC 4122 layout: 8-4-4-4-12 hex digits with hyphens.
static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid regex")
});

/// Data models a URN can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataModel {
    Relational,
    Graph,
    Vector,
    Timeseries,
    Document,
}

impl DataModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataModel::Relational => "relational",
            DataModel::Graph => "graph",
            DataModel::Vector => "vector",
            DataModel::Timeseries => "timeseries",
            DataModel::Document => "document",
        }
    }
}

impl FromStr for DataModel {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s {
            "relational" => Ok(DataModel::Relational),
            "graph" => Ok(DataModel::Graph),
            "vector" => Ok(DataModel::Vector),
            "timeseries" => Ok(DataModel::Timeseries),
            "document" => Ok(DataModel::Document),
            other => Err(AppError::Parse(
                ParseErrorKind::ModelInvalid,
                format!("Unknown data model '{}'", other),
            )),
        }
    }
}

impl fmt::Display for DataModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical resource name: `urn:themis:{model}:{namespace}:{collection}:{uuid}`.
///
/// The URN is the unit of routing. Clients address records by URN and never
/// learn which shard holds them; the resolver maps the URN's UUID hash onto
/// the ring. Values are immutable and compared by the full tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Urn {
    pub model: DataModel,
    pub namespace: String,
    pub collection: String,
    pub uuid: String,
}

impl Urn {
    /// Parse a URN string. Rejects anything that is not exactly six
    /// colon-separated fields with the `urn:themis:` prefix, a known model
    /// and an RFC 4122 uuid. Colons never appear inside fields.
    pub fn parse(s: &str) -> AppResult<Self> {
        if !s.starts_with("urn:themis:") {
            return Err(AppError::Parse(
                ParseErrorKind::UrnInvalid,
                format!("URN must start with 'urn:themis:': {}", s),
            ));
        }

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(AppError::Parse(
                ParseErrorKind::UrnInvalid,
                format!("URN must have 6 colon-separated fields, got {}", parts.len()),
            ));
        }

        let model = DataModel::from_str(parts[2])?;
        let namespace = parts[3];
        let collection = parts[4];
        let uuid = parts[5];

        if namespace.is_empty() || collection.is_empty() {
            return Err(AppError::Parse(
                ParseErrorKind::UrnInvalid,
                "URN namespace and collection must be non-empty".to_string(),
            ));
        }

        if !UUID_PATTERN.is_match(uuid) {
            return Err(AppError::Parse(
                ParseErrorKind::UuidInvalid,
                format!("Invalid RFC 4122 uuid '{}'", uuid),
            ));
        }

        Ok(Urn {
            model,
            namespace: namespace.to_string(),
            collection: collection.to_string(),
            uuid: uuid.to_string(),
        })
    }

    /// Mint a URN for a new record with a fresh v4 uuid.
    pub fn new_v4(model: DataModel, namespace: impl Into<String>, collection: impl Into<String>) -> Self {
        Urn {
            model,
            namespace: namespace.into(),
            collection: collection.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Routing hash: XXH64 over the UUID string bytes alone, so siblings in
    /// a collection spread across shards. Stable across processes and
    /// platforms.
    pub fn hash(&self) -> u64 {
        xxhash_rust::xxh64::xxh64(self.uuid.as_bytes(), 0)
    }

    /// Collection-local key, `{collection}:{uuid}`. Matches the storage
    /// layer's key format.
    pub fn resource_id(&self) -> String {
        format!("{}:{}", self.collection, self.uuid)
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "urn:themis:{}:{}:{}:{}",
            self.model, self.namespace, self.collection, self.uuid
        )
    }
}

impl FromStr for Urn {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        Urn::parse(s)
    }
}
