use crate::alert::{AlertPayload, AlertSink, LogAlertSink};
use crate::analyzer::{AnalysisRequest, AnalysisVerdict, DeepAnalyzer};
use crate::data::{current_timestamp, retry_once, Database, KeywordHit, ThreatLevel, ThreatRecord};
use dashmap::DashSet;
use nightcrawl_scanner::extract::visible_text;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Keywords per category, evaluated critical first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordTable {
    pub critical: Vec<String>,
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for KeywordTable {
    fn default() -> Self {
        Self {
            critical: words(&[
                "bomb",
                "terror",
                "attack",
                "kill",
                "murder",
                "assassination",
                "child",
                "minor",
                "trafficking",
            ]),
            high: words(&[
                "weapon",
                "explosive",
                "drug",
                "narcotic",
                "malware",
                "ransomware",
                "hitman",
            ]),
            medium: words(&[
                "carding", "hacking", "fraud", "exploit", "phishing", "stolen", "fake",
            ]),
            low: words(&["escrow", "darknet", "untraceable", "pgp"]),
        }
    }
}

impl KeywordTable {
    fn categories(&self) -> [(ThreatLevel, &[String]); 4] {
        [
            (ThreatLevel::Critical, &self.critical),
            (ThreatLevel::High, &self.high),
            (ThreatLevel::Medium, &self.medium),
            (ThreatLevel::Low, &self.low),
        ]
    }
}

/// Case-insensitive whole-word matcher built once from a `KeywordTable`.
pub struct KeywordMatcher {
    categories: Vec<(ThreatLevel, Regex)>,
}

impl KeywordMatcher {
    pub fn new(table: &KeywordTable) -> Self {
        let categories = table
            .categories()
            .into_iter()
            .filter_map(|(level, keywords)| {
                let alternatives: Vec<String> = keywords
                    .iter()
                    .map(|k| k.trim())
                    .filter(|k| !k.is_empty())
                    .map(regex::escape)
                    .collect();
                if alternatives.is_empty() {
                    return None;
                }
                let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
                match Regex::new(&pattern) {
                    Ok(re) => Some((level, re)),
                    Err(e) => {
                        warn!("Skipping {} keywords: {}", level.as_str(), e);
                        None
                    }
                }
            })
            .collect();
        Self { categories }
    }

    /// Distinct keyword hits, most severe category first.
    pub fn match_keywords(&self, text: &str) -> Vec<KeywordHit> {
        let mut hits: Vec<KeywordHit> = Vec::new();
        for (level, re) in &self.categories {
            for m in re.find_iter(text) {
                let keyword = m.as_str().to_lowercase();
                if !hits.iter().any(|h| h.keyword == keyword) {
                    hits.push(KeywordHit {
                        category: *level,
                        keyword,
                    });
                }
            }
        }
        hits
    }
}

/// Highest matched category, or `Info` when nothing matched.
pub fn score(matches: &[KeywordHit]) -> ThreatLevel {
    matches
        .iter()
        .map(|h| h.category)
        .max()
        .unwrap_or(ThreatLevel::Info)
}

pub fn content_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

/// First 16 hex chars of SHA-256 over `LEVEL|sorted,categories|confidence`.
pub fn threat_signature(level: ThreatLevel, categories: &[String], confidence: f64) -> String {
    let mut sorted: Vec<&str> = categories.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let data = format!(
        "{}|{}|{}",
        level.as_str().to_uppercase(),
        sorted.join(","),
        confidence
    );
    let digest = hex::encode(Sha256::digest(data.as_bytes()));
    digest[..16].to_string()
}

const URL_FLAGS: &[&str] = &["market", "vendor", "admin", "upload", "trade"];
const ONION_URL_FLAGS: &[&str] = &["shop", "forum", "exchange"];

static PATH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"[0-9a-f]{16,}", r"[a-z]{20,}"]
        .iter()
        .map(|p| Regex::new(p).expect("path pattern"))
        .collect()
});

static CONTENT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(buy|sell|order|purchase).*(drug|narcotic|cocaine|heroin|meth|lsd|mdma|fentanyl)",
        r"(?i)(weapon|gun|rifle|pistol|bomb|explosive|grenade|ammunition)",
        r"(?i)(credit.*card|cvv|fullz|carding|stolen.*data)",
        r"(?i)(hacking.*service|malware|ransomware|ddos.*attack|botnet)",
        r"(?i)(human.*trafficking|forced.*labor|kidnap)",
        r"(?i)(money.*laundering|bitcoin.*mixer|crypto.*tumbler|darknet.*market)",
        r"(?i)(murder.*for.*hire|hitman|contract.*kill)",
        r"(?i)(passport|id.*card|social.*security|driver.*license).*(fake|forged|stolen)",
        r"(?i)(vendor|escrow|market|shop|store).*(tor|onion|darknet)",
        r"\b(bc1|[13])[a-km-zA-HJ-NP-Z1-9]{25,39}\b",
        r"\b0x[a-fA-F0-9]{40}\b",
        r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("content pattern"))
    .collect()
});

/// URL or content looks like a marketplace, admin surface or payment page.
pub fn is_suspicious(url: &str, content: &str) -> bool {
    let lower = url.to_lowercase();
    let onion = lower.contains(".onion");
    if URL_FLAGS.iter().any(|f| lower.contains(f))
        || (onion && ONION_URL_FLAGS.iter().any(|f| lower.contains(f)))
    {
        return true;
    }

    if let Ok(parsed) = url::Url::parse(url)
        && PATH_PATTERNS.iter().any(|re| re.is_match(parsed.path()))
    {
        return true;
    }

    CONTENT_PATTERNS.iter().any(|re| re.is_match(content))
}

const MAX_LIMITER_WAIT: Duration = Duration::from_secs(3600);

/// Token bucket gating analyzer calls.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_rate: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        let rate = requests_per_second.max(f64::MIN_POSITIVE);
        let capacity = rate.max(1.0);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_rate: rate,
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                let needed = 1.0 - bucket.tokens;
                Duration::try_from_secs_f64(needed / self.refill_rate)
                    .unwrap_or(MAX_LIMITER_WAIT)
                    .clamp(Duration::from_millis(1), MAX_LIMITER_WAIT)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Synchronous result of scoring one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub content_hash: String,
    /// Visible text the keywords were matched against.
    pub text: String,
    pub matches: Vec<KeywordHit>,
    pub level: ThreatLevel,
    pub suspicious: bool,
}

impl Assessment {
    pub fn needs_escalation(&self) -> bool {
        !self.matches.is_empty() || self.suspicious
    }
}

/// Persists alerts and fans them out to the sink without waiting.
#[derive(Clone)]
struct Alerter {
    db: Arc<Database>,
    sink: Arc<dyn AlertSink>,
    tracker: TaskTracker,
}

impl Alerter {
    fn crossed(previous: ThreatLevel, level: ThreatLevel) -> bool {
        previous < ThreatLevel::Medium && level >= ThreatLevel::Medium
    }

    fn raise(
        &self,
        url: &str,
        content_hash: Option<&str>,
        previous: ThreatLevel,
        level: ThreatLevel,
        source: &str,
        summary: Option<&str>,
    ) {
        if !Self::crossed(previous, level) {
            return;
        }
        retry_once("insert alert", || {
            self.db
                .insert_alert(url, content_hash, previous, level, source, summary)
        });

        let payload = AlertPayload {
            url: url.to_string(),
            content_hash: content_hash.map(String::from),
            previous_level: previous,
            threat_level: level,
            source: source.to_string(),
            summary: summary.map(String::from),
            timestamp: current_timestamp(),
        };
        let sink = self.sink.clone();
        self.tracker.spawn(async move {
            if let Err(e) = sink.notify(&payload).await {
                warn!("Alert for {} not delivered: {}", payload.url, e);
            }
        });
    }
}

pub struct ThreatClassifier {
    db: Arc<Database>,
    matcher: KeywordMatcher,
    analyzer: Option<Arc<dyn DeepAnalyzer>>,
    limiter: Arc<RateLimiter>,
    alerter: Alerter,
    tracker: TaskTracker,
    escalated: DashSet<String>,
    max_content_chars: usize,
}

impl ThreatClassifier {
    pub fn new(db: Arc<Database>, keywords: &KeywordTable, requests_per_second: f64) -> Self {
        let tracker = TaskTracker::new();
        Self {
            alerter: Alerter {
                db: db.clone(),
                sink: Arc::new(LogAlertSink),
                tracker: tracker.clone(),
            },
            db,
            matcher: KeywordMatcher::new(keywords),
            analyzer: None,
            limiter: Arc::new(RateLimiter::new(requests_per_second)),
            tracker,
            escalated: DashSet::new(),
            max_content_chars: 4000,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn DeepAnalyzer>, max_content_chars: usize) -> Self {
        self.analyzer = Some(analyzer);
        self.max_content_chars = max_content_chars;
        self
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerter.sink = sink;
        self
    }

    /// Score a page without touching storage. Keywords and content
    /// patterns see only the visible text; the hash covers the raw body.
    pub fn assess(&self, url: &str, body: &str) -> Assessment {
        let text = visible_text(body);
        let matches = self.matcher.match_keywords(&text);
        Assessment {
            content_hash: content_hash(body),
            level: score(&matches),
            suspicious: is_suspicious(url, &text),
            matches,
            text,
        }
    }

    /// Store the threat record for an assessed page, alert on a keyword
    /// crossing and schedule analyzer escalation. The page row must already
    /// carry `assessment.content_hash`. Returns true if escalation was
    /// scheduled.
    pub fn record(
        &self,
        url: &str,
        title: Option<&str>,
        previous: ThreatLevel,
        assessment: &Assessment,
    ) -> bool {
        let hash = assessment.content_hash.as_str();
        let record = ThreatRecord {
            content_hash: hash.to_string(),
            keyword_matches: assessment.matches.clone(),
            ai_verdict: None,
            threat_level: assessment.level,
            confidence: 0.0,
            signature: None,
        };

        let inserted = retry_once("insert threat record", || self.db.insert_threat_record(&record))
            .unwrap_or(false);

        self.alerter
            .raise(url, Some(hash), previous, assessment.level, "keywords", None);

        // Content seen before: carry the stored verdict over to this page
        let mut analyzed = false;
        if !inserted {
            match self.db.get_threat_record(hash) {
                Ok(Some(stored)) => {
                    analyzed = stored.ai_verdict.is_some();
                    if stored.threat_level > assessment.level {
                        let raised = retry_once("raise threat level", || {
                            self.db.raise_threat_level(hash, stored.threat_level)
                        })
                        .unwrap_or_default();
                        let floor = previous.max(assessment.level);
                        for (raised_url, _) in raised {
                            self.alerter.raise(
                                &raised_url,
                                Some(hash),
                                floor,
                                stored.threat_level,
                                "analyzer",
                                None,
                            );
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Cannot read threat record {}: {}", hash, e),
            }
        }

        if !assessment.needs_escalation() || analyzed {
            return false;
        }
        let Some(analyzer) = self.analyzer.clone() else {
            return false;
        };
        if !self.escalated.insert(hash.to_string()) {
            debug!("Escalation for {} already scheduled this run", hash);
            return false;
        }

        let request = AnalysisRequest::new(
            url,
            title,
            &assessment.text,
            assessment.matches.iter().map(|h| h.keyword.clone()).collect(),
            self.max_content_chars,
        );
        let task = Escalation {
            db: self.db.clone(),
            analyzer,
            limiter: self.limiter.clone(),
            alerter: self.alerter.clone(),
            content_hash: hash.to_string(),
            sync_level: assessment.level,
        };
        self.tracker.spawn(task.run(request));
        debug!("Scheduled deep analysis for {}", url);
        true
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `limit` for outstanding analyzer and alert tasks. Returns
    /// false if some were still running.
    pub async fn drain(&self, limit: Duration) -> bool {
        self.tracker.close();
        let finished = tokio::time::timeout(limit, self.tracker.wait()).await.is_ok();
        if !finished {
            warn!(
                "{} analyzer tasks still pending after {:?}",
                self.tracker.len(),
                limit
            );
        }
        finished
    }
}

struct Escalation {
    db: Arc<Database>,
    analyzer: Arc<dyn DeepAnalyzer>,
    limiter: Arc<RateLimiter>,
    alerter: Alerter,
    content_hash: String,
    sync_level: ThreatLevel,
}

impl Escalation {
    async fn run(self, request: AnalysisRequest) {
        self.limiter.acquire().await;
        match self.analyzer.analyze(&request).await {
            Ok(verdict) => self.apply(&request.url, verdict),
            Err(e) => warn!(
                "Deep analysis of {} failed, keeping {}: {}",
                request.url,
                self.sync_level.as_str(),
                e
            ),
        }
    }

    fn apply(&self, url: &str, verdict: AnalysisVerdict) {
        let hash = self.content_hash.as_str();
        let level = self.sync_level.max(verdict.level());
        let signature = threat_signature(level, &verdict.categories, verdict.confidence);
        let raw = match serde_json::to_string(&verdict) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cannot serialize verdict for {}: {}", url, e);
                return;
            }
        };

        info!(
            "Analyzer rated {} as {} (confidence {:.2})",
            url,
            level.as_str(),
            verdict.confidence
        );

        retry_once("update threat verdict", || {
            self.db
                .update_threat_verdict(hash, &raw, level, verdict.confidence, &signature)
        });
        retry_once("record signature", || {
            self.db.record_signature(&signature, level, &verdict.categories)
        });
        let raised = retry_once("raise threat level", || self.db.raise_threat_level(hash, level))
            .unwrap_or_default();

        let summary = Some(verdict.summary.as_str()).filter(|s| !s.is_empty());
        for (page_url, previous) in raised {
            self.alerter
                .raise(&page_url, Some(hash), previous, level, "analyzer", summary);
        }
    }
}
