use crate::error::{Result, ScanError};
use crate::result::FetchOutcome;
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockingVerdict {
    Clean,
    RateLimited,
    Captcha,
    Challenge,
    Firewall,
    UnknownError,
}

impl BlockingVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingVerdict::Clean => "clean",
            BlockingVerdict::RateLimited => "rate_limited",
            BlockingVerdict::Captcha => "captcha",
            BlockingVerdict::Challenge => "challenge",
            BlockingVerdict::Firewall => "firewall",
            BlockingVerdict::UnknownError => "unknown_error",
        }
    }

    pub fn is_blocked(&self) -> bool {
        *self != BlockingVerdict::Clean
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub verdict: BlockingVerdict,
    pub pattern: Option<String>,
}

impl Detection {
    pub fn clean() -> Self {
        Self {
            verdict: BlockingVerdict::Clean,
            pattern: None,
        }
    }
}

/// Proxy-side error pages that look like blocking but are not.
const IGNORE_PHRASES: &[&str] = &[
    "socks5 request failed",
    "general socks server failure",
    "privoxy",
    "proxy error",
    "connection refused by proxy",
    "ttl expired",
];

// (verdict, pattern) checked in order; the first hit wins.
static SIGNATURES: Lazy<Vec<(BlockingVerdict, Regex)>> = Lazy::new(|| {
    let table: &[(BlockingVerdict, &str)] = &[
        (BlockingVerdict::Captcha, r"captcha"),
        (BlockingVerdict::Captcha, r"are you (a )?human"),
        (BlockingVerdict::Captcha, r"prove you('| a)re not a robot"),
        (BlockingVerdict::Challenge, r"checking your browser"),
        (BlockingVerdict::Challenge, r"ddos protection"),
        (BlockingVerdict::Challenge, r"cloudflare"),
        (BlockingVerdict::Challenge, r"please enable javascript"),
        (BlockingVerdict::RateLimited, r"rate limit"),
        (BlockingVerdict::RateLimited, r"too many requests"),
        (BlockingVerdict::RateLimited, r"slow down"),
        (BlockingVerdict::Firewall, r"firewall"),
        (BlockingVerdict::Firewall, r"web application firewall"),
        (BlockingVerdict::Firewall, r"request (has been )?rejected"),
        (BlockingVerdict::UnknownError, r"access denied"),
        (BlockingVerdict::UnknownError, r"\bblocked\b"),
        (BlockingVerdict::UnknownError, r"\bforbidden\b"),
        (BlockingVerdict::UnknownError, r"temporarily unavailable"),
        (BlockingVerdict::UnknownError, r"suspicious activity"),
        (BlockingVerdict::UnknownError, r"security check"),
    ];
    table
        .iter()
        .filter_map(|(verdict, pattern)| Regex::new(pattern).ok().map(|re| (*verdict, re)))
        .collect()
});

#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingDetector;

impl BlockingDetector {
    pub fn new() -> Self {
        Self
    }

    /// Classify a fetch outcome. Only status-200 bodies are scanned; other
    /// statuses are the fetch layer's problem.
    pub fn classify(&self, outcome: &FetchOutcome) -> Detection {
        if outcome.status_code != 200 {
            return Detection::clean();
        }
        self.classify_body(&outcome.body)
    }

    pub fn classify_body(&self, body: &str) -> Detection {
        let text = body.to_lowercase();

        if let Some(phrase) = IGNORE_PHRASES.iter().find(|p| text.contains(*p)) {
            debug!("Ignoring proxy-side error page ({})", phrase);
            return Detection::clean();
        }

        for (verdict, re) in SIGNATURES.iter() {
            if re.is_match(&text) {
                return Detection {
                    verdict: *verdict,
                    pattern: Some(re.as_str().to_string()),
                };
            }
        }
        Detection::clean()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    Proceed,
    Backoff(Duration),
    Render { attempt: u32 },
    Rotate,
    Abandon(BlockingVerdict),
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Captcha/challenge verdicts tolerated per URL, counting the first.
    pub max_render_attempts: u32,
    pub max_rotations: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
            max_render_attempts: 3,
            max_rotations: 1,
        }
    }
}

#[derive(Debug, Default)]
struct UrlAttempts {
    renders: u32,
    rotations: u32,
}

/// Decides what a worker does after a verdict. Rate-limit failures are
/// counted per domain, render and rotate attempts per URL.
pub struct RecoveryPolicy {
    config: RecoveryConfig,
    rate_limited: DashMap<String, u32>,
    attempts: DashMap<String, UrlAttempts>,
}

impl RecoveryPolicy {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            rate_limited: DashMap::new(),
            attempts: DashMap::new(),
        }
    }

    /// `min(max_backoff, base * 2^failures)`
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.config
            .base_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    pub fn decide(&self, url: &str, domain: &str, verdict: BlockingVerdict) -> RecoveryAction {
        match verdict {
            BlockingVerdict::Clean => {
                self.rate_limited.remove(domain);
                RecoveryAction::Proceed
            }
            BlockingVerdict::RateLimited => {
                let mut failures = self.rate_limited.entry(domain.to_string()).or_insert(0);
                let delay = self.backoff_for(*failures);
                *failures += 1;
                RecoveryAction::Backoff(delay)
            }
            BlockingVerdict::Captcha | BlockingVerdict::Challenge => {
                let mut attempts = self.attempts.entry(url.to_string()).or_default();
                attempts.renders += 1;
                if attempts.renders >= self.config.max_render_attempts {
                    warn!("Giving up on {} after {} {} verdicts", url, attempts.renders, verdict.as_str());
                    RecoveryAction::Abandon(verdict)
                } else {
                    RecoveryAction::Render {
                        attempt: attempts.renders,
                    }
                }
            }
            BlockingVerdict::Firewall | BlockingVerdict::UnknownError => {
                let mut attempts = self.attempts.entry(url.to_string()).or_default();
                if attempts.rotations >= self.config.max_rotations {
                    warn!("Repeat {} verdict on {}, abandoning", verdict.as_str(), url);
                    RecoveryAction::Abandon(verdict)
                } else {
                    attempts.rotations += 1;
                    RecoveryAction::Rotate
                }
            }
        }
    }

    /// Forget per-URL attempt counters once a URL is finished with.
    pub fn finish(&self, url: &str) {
        self.attempts.remove(url);
    }

    pub fn rate_limit_failures(&self, domain: &str) -> u32 {
        self.rate_limited.get(domain).map(|f| *f).unwrap_or(0)
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

/// Fetches a page through a headless browser.
#[async_trait]
pub trait RenderService: Send + Sync {
    async fn render(&self, url: &str) -> Result<String>;
}

/// Render service reached over HTTP: `POST {endpoint}` with `{"url": ...}`,
/// answered with the rendered HTML.
pub struct HttpRenderService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRenderService {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl RenderService for HttpRenderService {
    async fn render(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ScanError::Render(format!(
                "render of {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.text().await?)
    }
}
