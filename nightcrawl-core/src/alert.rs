use crate::data::ThreatLevel;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub url: String,
    pub content_hash: Option<String>,
    pub previous_level: ThreatLevel,
    pub threat_level: ThreatLevel,
    /// "keywords" or "analyzer"
    pub source: String,
    pub summary: Option<String>,
    pub timestamp: i64,
}

/// Receives alerts when a page crosses into Medium or above. Callers do not
/// wait on delivery.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &AlertPayload) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: &AlertPayload) -> Result<()> {
        let level = match alert.threat_level {
            ThreatLevel::Critical => alert.threat_level.as_str().to_uppercase().red().bold(),
            ThreatLevel::High => alert.threat_level.as_str().to_uppercase().red(),
            _ => alert.threat_level.as_str().to_uppercase().yellow(),
        };
        warn!(
            "ALERT {} {} (was {}, via {}){}",
            level,
            alert.url,
            alert.previous_level.as_str(),
            alert.source,
            alert
                .summary
                .as_deref()
                .map(|s| format!(": {}", s))
                .unwrap_or_default()
        );
        Ok(())
    }
}

pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, alert: &AlertPayload) -> Result<()> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(CoreError::Alert(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
