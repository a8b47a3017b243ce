use crate::data::ThreatLevel;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

static EMBEDDED_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("embedded json regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub keywords: Vec<String>,
}

impl AnalysisRequest {
    /// Build a request, truncating content to `max_chars` characters.
    pub fn new(
        url: &str,
        title: Option<&str>,
        content: &str,
        keywords: Vec<String>,
        max_chars: usize,
    ) -> Self {
        Self {
            url: url.to_string(),
            title: title.map(String::from),
            content: content.chars().take(max_chars).collect(),
            keywords,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisVerdict {
    pub threat_level: String,
    #[serde(default, alias = "threat_categories")]
    pub categories: Vec<String>,
    #[serde(default, alias = "confidence_score")]
    pub confidence: f64,
    #[serde(default, alias = "analysis_summary")]
    pub summary: String,
    #[serde(default)]
    pub illegal_content_detected: bool,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    #[serde(default)]
    pub suspicious_indicators: Vec<String>,
}

impl AnalysisVerdict {
    /// Unknown level strings count as `Info`.
    pub fn level(&self) -> ThreatLevel {
        ThreatLevel::parse(&self.threat_level).unwrap_or_default()
    }
}

#[async_trait]
pub trait DeepAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisVerdict>;
}

/// Parse an analyzer response. Accepts a bare JSON object or one embedded
/// in surrounding prose.
pub fn parse_verdict(text: &str) -> Result<AnalysisVerdict> {
    if let Ok(verdict) = serde_json::from_str::<AnalysisVerdict>(text.trim()) {
        return Ok(verdict);
    }

    let embedded = EMBEDDED_OBJECT
        .find(text)
        .ok_or_else(|| CoreError::Analyzer("no JSON object in analyzer response".into()))?;
    serde_json::from_str(embedded.as_str())
        .map_err(|e| CoreError::Analyzer(format!("unparseable analyzer verdict: {}", e)))
}

/// Analyzer reached over HTTP: `POST {endpoint}` with the request as JSON.
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAnalyzer {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl DeepAnalyzer for HttpAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisVerdict> {
        debug!("Requesting deep analysis of {}", request.url);
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CoreError::Analyzer(format!(
                "analyzer returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        parse_verdict(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_truncates_by_characters() {
        let content = "é".repeat(5000);
        let request = AnalysisRequest::new("http://x.onion/", None, &content, vec![], 4000);
        assert_eq!(request.content.chars().count(), 4000);
    }

    #[test]
    fn test_parse_bare_verdict() {
        let verdict = parse_verdict(
            r#"{"threat_level": "HIGH", "threat_categories": ["drugs"], "confidence_score": 0.8,
                "analysis_summary": "vendor listing", "illegal_content_detected": true}"#,
        )
        .unwrap();
        assert_eq!(verdict.level(), ThreatLevel::High);
        assert_eq!(verdict.categories, vec!["drugs".to_string()]);
        assert!(verdict.illegal_content_detected);
    }

    #[test]
    fn test_parse_embedded_verdict() {
        let text = "Here is my analysis:\n```json\n{\"threat_level\": \"BENIGN\", \"confidence\": 0.9}\n```\nThanks.";
        let verdict = parse_verdict(text).unwrap();
        assert_eq!(verdict.level(), ThreatLevel::Info);
        assert_eq!(verdict.confidence, 0.9);
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(matches!(parse_verdict("no json here"), Err(CoreError::Analyzer(_))));
        assert!(parse_verdict("{not json}").is_err());
    }

    #[tokio::test]
    async fn test_http_analyzer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"threat_level": "critical", "categories": ["weapons"], "confidence": 0.95}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let analyzer = HttpAnalyzer::new(
            &format!("{}/analyze", server.uri()),
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = AnalysisRequest::new("http://x.onion/", Some("t"), "body", vec![], 4000);
        let verdict = analyzer.analyze(&request).await.unwrap();
        assert_eq!(verdict.level(), ThreatLevel::Critical);
    }

    #[tokio::test]
    async fn test_http_analyzer_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let analyzer = HttpAnalyzer::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let request = AnalysisRequest::new("http://x.onion/", None, "body", vec![], 4000);
        assert!(matches!(
            analyzer.analyze(&request).await,
            Err(CoreError::Analyzer(_))
        ));
    }
}
