//! Evidence providers
//!
//! The engine asks a provider for candidates once per cycle and bounds the
//! call with a timeout. Failures degrade to an empty bundle.

use crate::advisory::types::AdviceCandidate;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Source of advice candidates
#[async_trait]
pub trait EvidenceProvider: Send + Sync {
    /// Candidates relevant to `tool` in the given context
    async fn get_evidence(
        &self,
        session_id: &str,
        tool: &str,
        intent_context: &str,
    ) -> Result<Vec<AdviceCandidate>>;

    /// Provider name for logs
    fn name(&self) -> &str;
}

/// In-memory provider keyed by tool name.
///
/// Candidates registered under `*` are returned for every tool.
pub struct StaticEvidenceProvider {
    by_tool: RwLock<HashMap<String, Vec<AdviceCandidate>>>,
}

impl StaticEvidenceProvider {
    pub fn new() -> Self {
        Self {
            by_tool: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_map(by_tool: HashMap<String, Vec<AdviceCandidate>>) -> Self {
        Self {
            by_tool: RwLock::new(by_tool),
        }
    }

    /// Load a JSON object of `{ "<tool>": [candidates...] }`
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let by_tool: HashMap<String, Vec<AdviceCandidate>> = serde_json::from_str(&content)
            .map_err(|e| {
                Error::Evidence(format!("Invalid evidence file {}: {}", path.display(), e))
            })?;
        tracing::info!(
            path = %path.display(),
            tools = by_tool.len(),
            "Loaded static evidence"
        );
        Ok(Self::from_map(by_tool))
    }

    /// Register candidates for a tool
    pub async fn insert(&self, tool: impl Into<String>, candidates: Vec<AdviceCandidate>) {
        self.by_tool
            .write()
            .await
            .entry(tool.into())
            .or_default()
            .extend(candidates);
    }
}

impl Default for StaticEvidenceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EvidenceProvider for StaticEvidenceProvider {
    async fn get_evidence(
        &self,
        _session_id: &str,
        tool: &str,
        _intent_context: &str,
    ) -> Result<Vec<AdviceCandidate>> {
        let by_tool = self.by_tool.read().await;
        let mut candidates = by_tool.get(tool).cloned().unwrap_or_default();
        if let Some(any) = by_tool.get("*") {
            candidates.extend(any.iter().cloned());
        }
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[derive(Serialize)]
struct EvidenceRequest<'a> {
    session_id: &'a str,
    tool: &'a str,
    intent_context: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EvidenceResponse {
    Wrapped { candidates: Vec<AdviceCandidate> },
    Bare(Vec<AdviceCandidate>),
}

/// Retrieval service reached over HTTP
pub struct HttpEvidenceProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEvidenceProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl EvidenceProvider for HttpEvidenceProvider {
    async fn get_evidence(
        &self,
        session_id: &str,
        tool: &str,
        intent_context: &str,
    ) -> Result<Vec<AdviceCandidate>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EvidenceRequest {
                session_id,
                tool,
                intent_context,
            })
            .send()
            .await
            .map_err(|e| Error::Evidence(format!("Evidence request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Evidence(format!(
                "Evidence service returned HTTP {}",
                response.status()
            )));
        }

        let body: EvidenceResponse = response
            .json()
            .await
            .map_err(|e| Error::Evidence(format!("Failed to parse evidence response: {}", e)))?;

        Ok(match body {
            EvidenceResponse::Wrapped { candidates } => candidates,
            EvidenceResponse::Bare(candidates) => candidates,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_static_provider_by_tool_and_wildcard() {
        let provider = StaticEvidenceProvider::new();
        provider
            .insert("Edit", vec![AdviceCandidate::new("cognitive", "edit advice")])
            .await;
        provider
            .insert("*", vec![AdviceCandidate::new("bank", "general advice")])
            .await;

        let edit = provider.get_evidence("s1", "Edit", "").await.unwrap();
        assert_eq!(edit.len(), 2);

        let bash = provider.get_evidence("s1", "Bash", "").await.unwrap();
        assert_eq!(bash.len(), 1);
        assert_eq!(bash[0].text, "general advice");
    }

    #[test]
    fn test_static_provider_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"Edit": [{{"id": "c1", "source_type": "cognitive", "text": "Check auth",
                "confidence": 0.9, "context_match": 0.8, "reliability": 0.5,
                "provenance_key": "p1"}}]}}"#
        )
        .unwrap();

        let provider = StaticEvidenceProvider::from_file(file.path()).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let candidates = rt
            .block_on(provider.get_evidence("s", "Edit", ""))
            .unwrap();
        assert_eq!(candidates[0].id, "c1");
        assert!(candidates[0].observed_at.is_none());
    }

    #[test]
    fn test_static_provider_rejects_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            StaticEvidenceProvider::from_file(file.path()),
            Err(Error::Evidence(_))
        ));
    }

    #[test]
    fn test_response_shapes() {
        let wrapped: EvidenceResponse =
            serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(matches!(wrapped, EvidenceResponse::Wrapped { .. }));
        let bare: EvidenceResponse = serde_json::from_str("[]").unwrap();
        assert!(matches!(bare, EvidenceResponse::Bare(_)));
    }

    #[tokio::test]
    async fn test_http_provider_unreachable() {
        let provider = HttpEvidenceProvider::new("http://127.0.0.1:1/evidence");
        assert!(matches!(
            provider.get_evidence("s", "Edit", "").await,
            Err(Error::Evidence(_))
        ));
    }
}
