//! Request and response bodies for the knowledge backend routes:
//! variant generation, market insight, knowledge-base query and health.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Keyword metrics as returned by the keyword research provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordData {
    pub term: String,
    pub volume: i64,
    pub intent: String,
    pub difficulty: f64,
}

/// One element of an ad (headline, body, CTA) that a variant may rewrite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdElement {
    #[serde(rename = "type")]
    pub kind: String,
    pub location: String,
    pub code: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantInput {
    pub keywords: Vec<KeywordData>,
    pub elements: Vec<AdElement>,
    pub target_markets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedVariant {
    pub variant_id: String,
    pub geo_target: String,
    pub keyword: String,
    /// Element location to replacement text.
    pub element_updates: BTreeMap<String, String>,
    pub audience_segment: String,
    /// Score in `0.0..=1.0`.
    pub predicted_performance: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketInsightRequest {
    pub user_id: String,
    #[serde(default)]
    pub filters: Map<String, Value>,
}

impl MarketInsightRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            filters: Map::new(),
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filters.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketInsightResponse {
    pub executive_summary: Map<String, Value>,
    pub market_summary: Map<String, Value>,
    pub market_analysis: Map<String, Value>,
    pub keyword_insights: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeQuery {
    pub query: String,
    #[serde(default)]
    pub deep_research: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub extra_info: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSection {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub title: String,
    pub sections: Vec<ReportSection>,
    pub summary: String,
}

/// A quick query returns an answer with sources; a deep-research query
/// returns a structured report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum KnowledgeAnswer {
    Report {
        report: Report,
        #[serde(rename = "type")]
        kind: String,
    },
    Answer {
        response: String,
        #[serde(default)]
        sources: Vec<Source>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Healthy,
    Degraded,
}

/// `GET /health` payload; `services` maps each backend service to whether it
/// is initialised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub status: ServiceState,
    #[serde(default)]
    pub services: BTreeMap<String, bool>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == ServiceState::Healthy
    }

    pub fn unavailable(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, up)| !**up)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
