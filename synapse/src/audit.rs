//! Audit Store Interface
//!
//! The audit store is an external content-searchable append log. Every
//! message, consensus round, and emergent insight is mirrored into it for
//! traceability and cross-session learning. The concrete engine is opaque;
//! this module defines the trait boundary, an HTTP-backed client, and an
//! in-memory implementation used by tests and embedded deployments.

use crate::config::StoreConfig;
use crate::types::RecordId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Audit store error types
#[derive(Debug, Error)]
pub enum AuditError {
    /// Network communication error
    #[error("network error: {0}")]
    Network(String),

    /// Store unavailable (connection refused or similar)
    #[error("audit store unavailable: {0}")]
    Unavailable(String),

    /// Request timeout
    #[error("audit store timeout: {0}")]
    Timeout(String),

    /// Store-side rejection
    #[error("audit store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for AuditError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuditError::Timeout(err.to_string())
        } else if err.is_connect() {
            AuditError::Unavailable(err.to_string())
        } else {
            AuditError::Network(err.to_string())
        }
    }
}

/// Result type for audit store operations
pub type Result<T> = std::result::Result<T, AuditError>;

/// One record in the audit store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record id assigned by the store
    pub id: RecordId,

    /// Free-text content the store indexes for search
    pub content: String,

    /// Structured metadata (session id, agent id, record kind, ...)
    pub metadata: HashMap<String, serde_json::Value>,

    /// When the record was appended
    pub created_at: DateTime<Utc>,
}

/// Search filters applied server-side
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Restrict to records whose metadata matches these key/value pairs
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// External append-only, content-searchable record store
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a record and return its store-assigned id
    async fn append(
        &self,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<RecordId>;

    /// Search records by content query and metadata filters
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<AuditRecord>>;
}

// ==============================================================================
// HTTP-backed store
// ==============================================================================

#[derive(Debug, Serialize)]
struct AppendRequest<'a> {
    content: &'a str,
    metadata: &'a HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AppendResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    filters: &'a SearchFilters,
    limit: usize,
}

/// Audit store client backed by an HTTP API
pub struct HttpAuditStore {
    client: HttpClient,
    base_url: String,
}

impl HttpAuditStore {
    /// Build a client from store configuration
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.audit_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AuditStore for HttpAuditStore {
    async fn append(
        &self,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<RecordId> {
        let response = self
            .client
            .post(format!("{}/records", self.base_url))
            .json(&AppendRequest {
                content: &content,
                metadata: &metadata,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuditError::Store(format!(
                "append rejected with status {}",
                response.status()
            )));
        }

        let body: AppendResponse = response.json().await?;
        debug!(record_id = %body.id, "audit record appended");
        Ok(RecordId::from(body.id))
    }

    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        let response = self
            .client
            .post(format!("{}/records/search", self.base_url))
            .json(&SearchRequest {
                query,
                filters,
                limit,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuditError::Store(format!(
                "search rejected with status {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

// ==============================================================================
// In-memory store
// ==============================================================================

/// In-memory audit store for tests and embedded deployments
#[derive(Default)]
pub struct MemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended so far
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(
        &self,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<RecordId> {
        let record = AuditRecord {
            id: RecordId::new(),
            content,
            metadata,
            created_at: Utc::now(),
        };
        let id = record.id.clone();
        self.records.write().await.push(record);
        Ok(id)
    }

    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        let query = query.to_lowercase();
        let records = self.records.read().await;

        Ok(records
            .iter()
            .filter(|r| query.is_empty() || r.content.to_lowercase().contains(&query))
            .filter(|r| {
                filters
                    .metadata
                    .iter()
                    .all(|(k, v)| r.metadata.get(k) == Some(v))
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_append_and_search() {
        let store = MemoryAuditStore::new();

        let mut metadata = HashMap::new();
        metadata.insert("session_id".to_string(), json!("s1"));
        store
            .append("agents agreed on caching strategy".to_string(), metadata)
            .await
            .unwrap();

        let mut other = HashMap::new();
        other.insert("session_id".to_string(), json!("s2"));
        store
            .append("unrelated record".to_string(), other)
            .await
            .unwrap();

        let hits = store
            .search("caching", &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let mut filters = SearchFilters::default();
        filters.metadata.insert("session_id".to_string(), json!("s2"));
        let hits = store.search("", &filters, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "unrelated record");
    }
}
