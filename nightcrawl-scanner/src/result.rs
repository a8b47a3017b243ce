use crate::blocking::BlockingVerdict;
use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use url::Url;

/// A URL waiting in the frontier.
#[derive(Debug, Clone)]
pub struct FrontierEntry {
    pub url: Url,
    pub normalized_url: String,
    pub source_url: Option<String>,
    pub discovered_at: SystemTime,
    pub depth: usize,
}

impl FrontierEntry {
    pub fn seed(url: Url) -> Self {
        Self::discovered(url, None, 0)
    }

    pub fn discovered(url: Url, source_url: Option<String>, depth: usize) -> Self {
        let normalized_url = crate::frontier::normalize_url(&url);
        Self {
            url,
            normalized_url,
            source_url,
            discovered_at: SystemTime::now(),
            depth,
        }
    }

    pub fn domain(&self) -> String {
        host_of(&self.url)
    }
}

/// Lowercased host of a URL, or "unknown".
pub fn host_of(url: &Url) -> String {
    url.host_str()
        .map(|h| h.to_ascii_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn is_onion(url: &Url) -> bool {
    url.host_str()
        .map(|h| h.to_ascii_lowercase().ends_with(".onion"))
        .unwrap_or(false)
}

/// Result of a single fetch attempt. Never persisted.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub url: String,
    pub status_code: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
    pub content_type: Option<String>,
    pub elapsed: Duration,
    pub route_id: String,
    pub error: Option<String>,
    pub transport_failure: bool,
}

impl FetchOutcome {
    pub fn new(url: String, route_id: String) -> Self {
        Self {
            url,
            status_code: 0,
            body: String::new(),
            headers: HashMap::new(),
            content_type: None,
            elapsed: Duration::from_secs(0),
            route_id,
            error: None,
            transport_failure: false,
        }
    }

    pub fn failed(url: String, route_id: String, error: &ScanError, elapsed: Duration) -> Self {
        Self {
            elapsed,
            error: Some(error.to_string()),
            transport_failure: error.is_transport(),
            ..Self::new(url, route_id)
        }
    }

    pub fn is_text(&self) -> bool {
        match &self.content_type {
            Some(ct) => {
                let ct = ct.to_ascii_lowercase();
                ["text/html", "text/plain", "application/xhtml+xml"]
                    .iter()
                    .any(|t| ct.contains(t))
            }
            // Hidden services frequently omit the header; assume HTML.
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedLink {
    pub url: String,
    pub text: String,
    pub is_external: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NonHttpLink {
    pub kind: String,
    pub value: String,
}

/// Investigative indicators pulled out of a page body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    pub emails: Vec<String>,
    pub ips: Vec<String>,
    pub btc_addresses: Vec<String>,
    pub eth_addresses: Vec<String>,
    pub chatrooms: Vec<String>,
    pub non_http_links: Vec<NonHttpLink>,
}

impl Indicators {
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
            && self.ips.is_empty()
            && self.btc_addresses.is_empty()
            && self.eth_addresses.is_empty()
            && self.chatrooms.is_empty()
            && self.non_http_links.is_empty()
    }
}

/// A successfully fetched page, handed to the page callback.
#[derive(Debug, Clone)]
pub struct ScannedPage {
    pub entry: FrontierEntry,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub title: Option<String>,
    /// Empty for metadata-only (non-text) responses.
    pub body: String,
    pub page_size: usize,
    pub links: Vec<ExtractedLink>,
    pub indicators: Indicators,
    pub route_id: String,
    pub response_time: Duration,
    pub rendered: bool,
}

impl ScannedPage {
    pub fn url(&self) -> &str {
        self.entry.url.as_str()
    }

    pub fn is_metadata_only(&self) -> bool {
        self.body.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Transport(String),
    HttpStatus(u16),
    Blocked(BlockingVerdict),
    DomainBlocked,
    NoRoute,
    AttemptsExhausted,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> String {
        match self {
            FailureReason::Transport(e) => format!("transport: {}", e),
            FailureReason::HttpStatus(code) => format!("http status {}", code),
            FailureReason::Blocked(v) => format!("blocked: {}", v.as_str()),
            FailureReason::DomainBlocked => "domain blocklisted".to_string(),
            FailureReason::NoRoute => "no usable route".to_string(),
            FailureReason::AttemptsExhausted => "attempts exhausted".to_string(),
            FailureReason::Cancelled => "cancelled".to_string(),
        }
    }
}

/// A URL the worker pool gave up on.
#[derive(Debug, Clone)]
pub struct CrawlFailure {
    pub url: String,
    pub domain: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlStats {
    pub pages_fetched: usize,
    pub failures: usize,
    pub links_discovered: usize,
    pub links_enqueued: usize,
    pub blocklisted_domains: Vec<String>,
}
