// Tests for the threat classification pipeline

use async_trait::async_trait;
use nightcrawl_core::alert::{AlertPayload, AlertSink};
use nightcrawl_core::analyzer::{AnalysisRequest, AnalysisVerdict, DeepAnalyzer};
use nightcrawl_core::data::{Database, PageRecord, ThreatLevel};
use nightcrawl_core::error::{CoreError, Result};
use nightcrawl_core::threat::{KeywordTable, ThreatClassifier, threat_signature};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct MockAnalyzer {
    level: &'static str,
    fail: bool,
    requests: Mutex<Vec<AnalysisRequest>>,
}

impl MockAnalyzer {
    fn rating(level: &'static str) -> Arc<Self> {
        Arc::new(Self {
            level,
            fail: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            level: "info",
            fail: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl DeepAnalyzer for MockAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisVerdict> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(CoreError::Analyzer("analyzer offline".into()));
        }
        Ok(AnalysisVerdict {
            threat_level: self.level.to_string(),
            categories: vec!["weapons".to_string(), "extremism".to_string()],
            confidence: 0.9,
            summary: "explosives manual".to_string(),
            illegal_content_detected: true,
            recommended_actions: vec![],
            suspicious_indicators: vec![],
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    alerts: Mutex<Vec<AlertPayload>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn notify(&self, alert: &AlertPayload) -> Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

fn create_test_db() -> (TempDir, Arc<Database>) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
    (temp_dir, Arc::new(db))
}

/// Score, store the page row, then record, the way the crawl callback does.
fn classify(
    classifier: &ThreatClassifier,
    db: &Database,
    url: &str,
    body: &str,
) -> (ThreatLevel, bool) {
    let previous = db.page_threat_level(url).unwrap().unwrap_or_default();
    let assessment = classifier.assess(url, body);
    db.upsert_page(&PageRecord {
        url: url.to_string(),
        domain: "example.onion".to_string(),
        content_hash: Some(assessment.content_hash.clone()),
        threat_level: assessment.level,
        page_size: body.len(),
        status_code: Some(200),
        ..Default::default()
    })
    .unwrap();
    let scheduled = classifier.record(url, None, previous, &assessment);
    (assessment.level, scheduled)
}

#[tokio::test]
async fn test_bomb_page_is_critical_and_escalated() {
    let (_temp_dir, db) = create_test_db();
    let analyzer = MockAnalyzer::rating("high");
    let sink = Arc::new(RecordingSink::default());
    let classifier = ThreatClassifier::new(db.clone(), &KeywordTable::default(), 100.0)
        .with_analyzer(analyzer.clone(), 4000)
        .with_alert_sink(sink.clone());

    let url = "http://example.onion/";
    let (level, scheduled) = classify(&classifier, &db, url, "<p>how to build a bomb</p>");

    assert_eq!(level, ThreatLevel::Critical);
    assert!(scheduled);
    assert_eq!(db.page_threat_level(url).unwrap(), Some(ThreatLevel::Critical));

    assert!(classifier.drain(Duration::from_secs(5)).await);
    assert_eq!(analyzer.calls(), 1);
    assert_eq!(analyzer.requests.lock().unwrap()[0].keywords, vec!["bomb".to_string()]);

    // Analyzer said high, the page stays critical
    assert_eq!(db.page_threat_level(url).unwrap(), Some(ThreatLevel::Critical));
    let hash = db.get_page(url).unwrap().unwrap().content_hash.unwrap();
    let stored = db.get_threat_record(&hash).unwrap().unwrap();
    assert_eq!(stored.threat_level, ThreatLevel::Critical);
    let expected = threat_signature(
        ThreatLevel::Critical,
        &["weapons".to_string(), "extremism".to_string()],
        0.9,
    );
    assert_eq!(stored.signature.as_deref(), Some(expected.as_str()));
    assert_eq!(db.signature_count(&expected).unwrap(), Some(1));

    // One alert for the keyword crossing
    let alerts = sink.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].threat_level, ThreatLevel::Critical);
    assert_eq!(alerts[0].source, "keywords");
}

#[tokio::test]
async fn test_analyzer_raises_suspicious_page() {
    let (_temp_dir, db) = create_test_db();
    let analyzer = MockAnalyzer::rating("critical");
    let sink = Arc::new(RecordingSink::default());
    let classifier = ThreatClassifier::new(db.clone(), &KeywordTable::default(), 100.0)
        .with_analyzer(analyzer.clone(), 4000)
        .with_alert_sink(sink.clone());

    let url = "http://example.onion/market/item";
    let (level, scheduled) = classify(&classifier, &db, url, "a quiet listing page");
    assert_eq!(level, ThreatLevel::Info);
    assert!(scheduled);

    assert!(classifier.drain(Duration::from_secs(5)).await);
    assert_eq!(db.page_threat_level(url).unwrap(), Some(ThreatLevel::Critical));

    let alerts = sink.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].previous_level, ThreatLevel::Info);
    assert_eq!(alerts[0].source, "analyzer");
    assert_eq!(alerts[0].summary.as_deref(), Some("explosives manual"));
    assert_eq!(db.get_alerts().unwrap().len(), 1);
}

#[tokio::test]
async fn test_escalation_once_per_content_hash() {
    let (_temp_dir, db) = create_test_db();
    let analyzer = MockAnalyzer::rating("medium");
    let classifier = ThreatClassifier::new(db.clone(), &KeywordTable::default(), 100.0)
        .with_analyzer(analyzer.clone(), 4000);

    let body = "malware for sale";
    let (_, first) = classify(&classifier, &db, "http://a.onion/", body);
    let (_, mirror) = classify(&classifier, &db, "http://b.onion/", body);
    assert!(first);
    assert!(!mirror);

    assert!(classifier.drain(Duration::from_secs(5)).await);
    assert_eq!(analyzer.calls(), 1);
}

#[tokio::test]
async fn test_stored_verdict_not_reanalyzed() {
    let (_temp_dir, db) = create_test_db();
    let body = "ransomware builder";

    let analyzer = MockAnalyzer::rating("critical");
    let first_run = ThreatClassifier::new(db.clone(), &KeywordTable::default(), 100.0)
        .with_analyzer(analyzer.clone(), 4000);
    classify(&first_run, &db, "http://a.onion/", body);
    assert!(first_run.drain(Duration::from_secs(5)).await);
    assert_eq!(analyzer.calls(), 1);

    // A later run sees the same content on a new page
    let second_analyzer = MockAnalyzer::rating("critical");
    let second_run = ThreatClassifier::new(db.clone(), &KeywordTable::default(), 100.0)
        .with_analyzer(second_analyzer.clone(), 4000);
    let (level, scheduled) = classify(&second_run, &db, "http://c.onion/", body);
    assert_eq!(level, ThreatLevel::High);
    assert!(!scheduled);
    assert!(second_run.drain(Duration::from_secs(5)).await);
    assert_eq!(second_analyzer.calls(), 0);

    // The stored verdict carries over
    assert_eq!(
        db.page_threat_level("http://c.onion/").unwrap(),
        Some(ThreatLevel::Critical)
    );
}

#[tokio::test]
async fn test_analyzer_failure_keeps_sync_level() {
    let (_temp_dir, db) = create_test_db();
    let analyzer = MockAnalyzer::failing();
    let classifier = ThreatClassifier::new(db.clone(), &KeywordTable::default(), 100.0)
        .with_analyzer(analyzer.clone(), 4000);

    let url = "http://a.onion/";
    let (level, scheduled) = classify(&classifier, &db, url, "phishing kit");
    assert_eq!(level, ThreatLevel::Medium);
    assert!(scheduled);

    assert!(classifier.drain(Duration::from_secs(5)).await);
    assert_eq!(analyzer.calls(), 1);
    assert_eq!(db.page_threat_level(url).unwrap(), Some(ThreatLevel::Medium));

    let hash = db.get_page(url).unwrap().unwrap().content_hash.unwrap();
    assert!(db.get_threat_record(&hash).unwrap().unwrap().ai_verdict.is_none());
}

#[tokio::test]
async fn test_clean_page_not_escalated() {
    let (_temp_dir, db) = create_test_db();
    let analyzer = MockAnalyzer::rating("critical");
    let classifier = ThreatClassifier::new(db.clone(), &KeywordTable::default(), 100.0)
        .with_analyzer(analyzer.clone(), 4000);

    let (level, scheduled) = classify(&classifier, &db, "http://a.onion/blog", "gardening notes");
    assert_eq!(level, ThreatLevel::Info);
    assert!(!scheduled);
    assert!(classifier.drain(Duration::from_secs(1)).await);
    assert_eq!(analyzer.calls(), 0);
}

#[tokio::test]
async fn test_stylesheet_selectors_do_not_score() {
    let (_temp_dir, db) = create_test_db();
    let analyzer = MockAnalyzer::rating("critical");
    let sink = Arc::new(RecordingSink::default());
    let classifier = ThreatClassifier::new(db.clone(), &KeywordTable::default(), 100.0)
        .with_analyzer(analyzer.clone(), 4000)
        .with_alert_sink(sink.clone());

    let body = "<style>li:first-child { margin: 0 } td:nth-child(2) {}</style>\
                <script>attack();</script><p>Welcome to my gardening blog.</p>";
    let assessment = classifier.assess("http://a.onion/blog", body);
    assert!(assessment.matches.is_empty());
    assert_eq!(assessment.text, "Welcome to my gardening blog.");

    let (level, scheduled) = classify(&classifier, &db, "http://a.onion/blog", body);
    assert_eq!(level, ThreatLevel::Info);
    assert!(!scheduled);
    assert!(classifier.drain(Duration::from_secs(1)).await);
    assert_eq!(analyzer.calls(), 0);
    assert!(sink.alerts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_no_analyzer_means_no_escalation() {
    let (_temp_dir, db) = create_test_db();
    let classifier = ThreatClassifier::new(db.clone(), &KeywordTable::default(), 1.0);

    let (level, scheduled) = classify(&classifier, &db, "http://a.onion/", "bomb");
    assert_eq!(level, ThreatLevel::Critical);
    assert!(!scheduled);
    assert_eq!(classifier.pending(), 1); // alert delivery to the log sink
    assert!(classifier.drain(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_long_content_truncated_for_analyzer() {
    let (_temp_dir, db) = create_test_db();
    let analyzer = MockAnalyzer::rating("low");
    let classifier = ThreatClassifier::new(db.clone(), &KeywordTable::default(), 100.0)
        .with_analyzer(analyzer.clone(), 4000);

    let body = format!("fraud {}", "x".repeat(10_000));
    classify(&classifier, &db, "http://a.onion/", &body);
    assert!(classifier.drain(Duration::from_secs(5)).await);

    let requests = analyzer.requests.lock().unwrap();
    assert_eq!(requests[0].content.chars().count(), 4000);
}
