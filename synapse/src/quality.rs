//! Quality Gate Interface
//!
//! External validator consulted by the insight synthesis engine before any
//! candidate is persisted. A candidate survives only when the gate reports
//! `passed = true` and its score clears the configured threshold.

use crate::config::StoreConfig;
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Quality gate error types
#[derive(Debug, Error)]
pub enum QualityError {
    /// Network communication error
    #[error("network error: {0}")]
    Network(String),

    /// Gate unavailable
    #[error("quality gate unavailable: {0}")]
    Unavailable(String),

    /// Request timeout
    #[error("quality gate timeout: {0}")]
    Timeout(String),

    /// Gate-side rejection
    #[error("quality gate error: {0}")]
    Gate(String),
}

impl From<reqwest::Error> for QualityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            QualityError::Timeout(err.to_string())
        } else if err.is_connect() {
            QualityError::Unavailable(err.to_string())
        } else {
            QualityError::Network(err.to_string())
        }
    }
}

/// Result type for quality gate operations
pub type Result<T> = std::result::Result<T, QualityError>;

/// Verdict returned by the gate for one candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityVerdict {
    /// Quality score in 0..=1
    pub score: f32,

    /// Whether the candidate passed validation
    pub passed: bool,

    /// Rule violations found, empty when passed
    #[serde(default)]
    pub violations: Vec<String>,
}

/// External quality validator
#[async_trait]
pub trait QualityGate: Send + Sync {
    /// Validate a candidate text in its surrounding context
    async fn validate(&self, text: &str, context: &str) -> Result<QualityVerdict>;
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    text: &'a str,
    context: &'a str,
}

/// Quality gate client backed by an HTTP API
pub struct HttpQualityGate {
    client: HttpClient,
    base_url: String,
}

impl HttpQualityGate {
    /// Build a client from store configuration
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.quality_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl QualityGate for HttpQualityGate {
    async fn validate(&self, text: &str, context: &str) -> Result<QualityVerdict> {
        let response = self
            .client
            .post(format!("{}/validate", self.base_url))
            .json(&ValidateRequest { text, context })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QualityError::Gate(format!(
                "validate rejected with status {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

/// Quality gate returning a fixed verdict, for tests and local runs
#[derive(Debug, Clone)]
pub struct FixedQualityGate {
    verdict: QualityVerdict,
}

impl FixedQualityGate {
    /// Gate that passes everything with the given score
    pub fn passing(score: f32) -> Self {
        Self {
            verdict: QualityVerdict {
                score,
                passed: true,
                violations: Vec::new(),
            },
        }
    }

    /// Gate that rejects everything with the given score and violation
    pub fn rejecting(score: f32, violation: impl Into<String>) -> Self {
        Self {
            verdict: QualityVerdict {
                score,
                passed: false,
                violations: vec![violation.into()],
            },
        }
    }
}

#[async_trait]
impl QualityGate for FixedQualityGate {
    async fn validate(&self, _text: &str, _context: &str) -> Result<QualityVerdict> {
        Ok(self.verdict.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_gate_verdicts() {
        let gate = FixedQualityGate::passing(0.9);
        let verdict = gate.validate("insight", "context").await.unwrap();
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());

        let gate = FixedQualityGate::rejecting(0.2, "too vague");
        let verdict = gate.validate("insight", "context").await.unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.violations, vec!["too vague".to_string()]);
    }
}
