use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

/// SQLite storage. The connection sits behind a mutex so one `Database` can
/// be shared by every worker and background task.
pub struct Database {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Critical => "critical",
            ThreatLevel::High => "high",
            ThreatLevel::Medium => "medium",
            ThreatLevel::Low => "low",
            ThreatLevel::Info => "info",
        }
    }

    /// Parse a stored or analyzer-supplied level. `benign` maps to `Info`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(ThreatLevel::Critical),
            "high" => Some(ThreatLevel::High),
            "medium" => Some(ThreatLevel::Medium),
            "low" => Some(ThreatLevel::Low),
            "info" | "benign" | "none" => Some(ThreatLevel::Info),
            _ => None,
        }
    }

    pub fn all() -> [ThreatLevel; 5] {
        [
            ThreatLevel::Critical,
            ThreatLevel::High,
            ThreatLevel::Medium,
            ThreatLevel::Low,
            ThreatLevel::Info,
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageRecord {
    pub url: String,
    pub domain: String,
    pub title: Option<String>,
    pub content_hash: Option<String>,
    pub threat_level: ThreatLevel,
    pub page_size: usize,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub depth: usize,
    pub last_crawled: Option<i64>,
    pub centrality: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    pub source_url: String,
    pub target_url: String,
    pub link_text: Option<String>,
    pub occurrence_count: i64,
    pub is_external: bool,
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordHit {
    pub category: ThreatLevel,
    pub keyword: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreatRecord {
    pub content_hash: String,
    pub keyword_matches: Vec<KeywordHit>,
    /// Raw analyzer verdict as JSON, once one has landed.
    pub ai_verdict: Option<String>,
    pub threat_level: ThreatLevel,
    pub confidence: f64,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedUrl {
    pub url: String,
    pub domain: String,
    pub reason: String,
    pub failure_count: i64,
}

pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: for<'de> Deserialize<'de>>(idx: usize, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn level_from_sql(idx: usize, raw: String) -> Result<ThreatLevel> {
    ThreatLevel::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown threat level {}", raw).into(),
        )
    })
}

// Numeric rank of a threat level column, for "only raise" updates.
fn level_rank(column: &str) -> String {
    format!(
        "(CASE {} WHEN 'critical' THEN 4 WHEN 'high' THEN 3 WHEN 'medium' THEN 2 WHEN 'low' THEN 1 ELSE 0 END)",
        column
    )
}

/// Run a storage operation, retrying once. A second failure is logged and
/// swallowed so that only this write is lost.
pub fn retry_once<T, E: std::fmt::Display>(
    operation: &str,
    mut f: impl FnMut() -> std::result::Result<T, E>,
) -> Option<T> {
    match f() {
        Ok(value) => Some(value),
        Err(first) => {
            warn!("Storage write '{}' failed, retrying: {}", operation, first);
            match f() {
                Ok(value) => Some(value),
                Err(e) => {
                    error!("Storage write '{}' failed after retry: {}", operation, e);
                    None
                }
            }
        }
    }
}

impl Database {
    pub fn remove(path: &Path) -> std::io::Result<()> {
        fs::remove_file(path)
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            "
CREATE TABLE IF NOT EXISTS crawl_sessions (
    id TEXT PRIMARY KEY,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    status TEXT NOT NULL CHECK(status IN ('running', 'completed', 'failed', 'cancelled')),
    seed_urls TEXT NOT NULL,  -- JSON array
    configuration TEXT,       -- JSON configuration used
    pages_crawled INTEGER NOT NULL DEFAULT 0
);

-- One row per URL; uncrawled link targets are placeholders with no hash
CREATE TABLE IF NOT EXISTS pages (
    url TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    title TEXT,
    content_hash TEXT,
    threat_level TEXT NOT NULL DEFAULT 'info'
        CHECK(threat_level IN ('critical', 'high', 'medium', 'low', 'info')),
    page_size INTEGER NOT NULL DEFAULT 0,
    status_code INTEGER,
    content_type TEXT,
    depth INTEGER NOT NULL DEFAULT 0,
    first_seen INTEGER NOT NULL,
    last_crawled INTEGER,
    centrality REAL NOT NULL DEFAULT 0.0
);

CREATE INDEX IF NOT EXISTS idx_pages_domain ON pages(domain);
CREATE INDEX IF NOT EXISTS idx_pages_hash ON pages(content_hash);
CREATE INDEX IF NOT EXISTS idx_pages_threat ON pages(threat_level);

CREATE TABLE IF NOT EXISTS threat_records (
    content_hash TEXT PRIMARY KEY,
    keyword_matches TEXT NOT NULL,  -- JSON array
    ai_verdict TEXT,                -- JSON object
    threat_level TEXT NOT NULL
        CHECK(threat_level IN ('critical', 'high', 'medium', 'low', 'info')),
    confidence REAL NOT NULL DEFAULT 0.0,
    signature TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS graph_edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_url TEXT NOT NULL,
    target_url TEXT NOT NULL,
    link_text TEXT,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    is_external BOOLEAN NOT NULL DEFAULT 0,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    UNIQUE(source_url, target_url)
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON graph_edges(source_url);
CREATE INDEX IF NOT EXISTS idx_edges_target ON graph_edges(target_url);

CREATE TABLE IF NOT EXISTS threat_signatures (
    signature TEXT PRIMARY KEY,
    threat_level TEXT NOT NULL,
    categories TEXT NOT NULL,  -- JSON array
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    content_hash TEXT,
    previous_level TEXT NOT NULL,
    threat_level TEXT NOT NULL,
    source TEXT NOT NULL,
    summary TEXT,
    created_at INTEGER NOT NULL
);

-- Emails, addresses, chat rooms and non-HTTP links seen on a page
CREATE TABLE IF NOT EXISTS indicators (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_url TEXT NOT NULL,
    kind TEXT NOT NULL,
    value TEXT NOT NULL,
    discovered_at INTEGER NOT NULL,
    UNIQUE(page_url, kind, value)
);

CREATE INDEX IF NOT EXISTS idx_indicators_kind ON indicators(kind, value);

CREATE TABLE IF NOT EXISTS failed_urls (
    url TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    reason TEXT NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 1,
    last_failed INTEGER NOT NULL
);
            ",
        )?;
        Ok(())
    }

    // Session management
    pub fn create_session(&self, seed_urls: &[String], configuration: Option<&str>) -> Result<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let timestamp = current_timestamp();

        self.conn().execute(
            "INSERT INTO crawl_sessions (id, start_time, status, seed_urls, configuration) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![&session_id, timestamp, "running", to_json(&seed_urls)?, configuration],
        )?;

        Ok(session_id)
    }

    pub fn complete_session(&self, session_id: &str, pages_crawled: usize) -> Result<()> {
        self.finish_session(session_id, "completed", pages_crawled)
    }

    pub fn cancel_session(&self, session_id: &str, pages_crawled: usize) -> Result<()> {
        self.finish_session(session_id, "cancelled", pages_crawled)
    }

    pub fn fail_session(&self, session_id: &str) -> Result<()> {
        self.finish_session(session_id, "failed", 0)
    }

    fn finish_session(&self, session_id: &str, status: &str, pages_crawled: usize) -> Result<()> {
        self.conn().execute(
            "UPDATE crawl_sessions SET status = ?1, end_time = ?2, pages_crawled = ?3 WHERE id = ?4",
            params![status, current_timestamp(), pages_crawled as i64, session_id],
        )?;
        Ok(())
    }

    pub fn get_session_status(&self, session_id: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT status FROM crawl_sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
    }

    // Page operations
    pub fn upsert_page(&self, page: &PageRecord) -> Result<()> {
        let timestamp = current_timestamp();
        // Unchanged content never drops below a level raised by deep analysis.
        let sql = format!(
            "INSERT INTO pages (
                url, domain, title, content_hash, threat_level, page_size,
                status_code, content_type, depth, first_seen, last_crawled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                content_hash = excluded.content_hash,
                threat_level = CASE
                    WHEN pages.content_hash IS excluded.content_hash AND {} > {}
                    THEN pages.threat_level
                    ELSE excluded.threat_level
                END,
                page_size = excluded.page_size,
                status_code = excluded.status_code,
                content_type = excluded.content_type,
                depth = MIN(pages.depth, excluded.depth),
                last_crawled = excluded.last_crawled",
            level_rank("pages.threat_level"),
            level_rank("excluded.threat_level")
        );
        self.conn().execute(
            &sql,
            params![
                &page.url,
                &page.domain,
                &page.title,
                &page.content_hash,
                page.threat_level.as_str(),
                page.page_size as i64,
                page.status_code,
                &page.content_type,
                page.depth as i64,
                timestamp,
            ],
        )?;
        Ok(())
    }

    /// Insert an uncrawled link target. Existing rows are left alone.
    pub fn insert_placeholder_page(&self, url: &str, domain: &str, depth: usize) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO pages (url, domain, depth, first_seen) VALUES (?1, ?2, ?3, ?4)",
            params![url, domain, depth as i64, current_timestamp()],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_page(&self, url: &str) -> Result<Option<PageRecord>> {
        self.conn()
            .query_row(
                "SELECT url, domain, title, content_hash, threat_level, page_size,
                        status_code, content_type, depth, last_crawled, centrality
                 FROM pages WHERE url = ?1",
                params![url],
                |row| {
                    Ok(PageRecord {
                        url: row.get(0)?,
                        domain: row.get(1)?,
                        title: row.get(2)?,
                        content_hash: row.get(3)?,
                        threat_level: level_from_sql(4, row.get(4)?)?,
                        page_size: row.get::<_, i64>(5)? as usize,
                        status_code: row.get(6)?,
                        content_type: row.get(7)?,
                        depth: row.get::<_, i64>(8)? as usize,
                        last_crawled: row.get(9)?,
                        centrality: row.get(10)?,
                    })
                },
            )
            .optional()
    }

    pub fn page_threat_level(&self, url: &str) -> Result<Option<ThreatLevel>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT threat_level FROM pages WHERE url = ?1",
                params![url],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| level_from_sql(0, r)).transpose()
    }

    /// Raise the level of every page carrying this content hash. Pages
    /// already at or above `level` are untouched. Returns the URLs raised
    /// together with their previous level.
    pub fn raise_threat_level(&self, content_hash: &str, level: ThreatLevel) -> Result<Vec<(String, ThreatLevel)>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let raised = {
            let mut stmt = tx.prepare(&format!(
                "SELECT url, threat_level FROM pages WHERE content_hash = ?1 AND {} < ?2",
                level_rank("threat_level")
            ))?;
            let rows = stmt
                .query_map(params![content_hash, rank_of(level)], |row| {
                    Ok((row.get::<_, String>(0)?, level_from_sql(1, row.get(1)?)?))
                })?
                .collect::<Result<Vec<_>>>()?;
            rows
        };
        tx.execute(
            &format!(
                "UPDATE pages SET threat_level = ?1 WHERE content_hash = ?2 AND {} < ?3",
                level_rank("threat_level")
            ),
            params![level.as_str(), content_hash, rank_of(level)],
        )?;
        tx.commit()?;
        Ok(raised)
    }

    pub fn count_pages(&self) -> Result<i64> {
        self.conn()
            .query_row("SELECT COUNT(*) FROM pages", [], |row| row.get(0))
    }

    pub fn count_crawled_pages(&self) -> Result<i64> {
        self.conn().query_row(
            "SELECT COUNT(*) FROM pages WHERE last_crawled IS NOT NULL",
            [],
            |row| row.get(0),
        )
    }

    pub fn page_urls(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT url FROM pages")?;
        let urls = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>>>()?;
        Ok(urls)
    }

    pub fn threat_counts(&self) -> Result<Vec<(ThreatLevel, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT threat_level, COUNT(*) FROM pages WHERE last_crawled IS NOT NULL
             GROUP BY threat_level ORDER BY {} DESC",
            level_rank("threat_level")
        ))?;
        let counts = stmt
            .query_map([], |row| Ok((level_from_sql(0, row.get(0)?)?, row.get(1)?)))?
            .collect::<Result<Vec<_>>>()?;
        Ok(counts)
    }

    // Edge operations

    /// Insert an edge or bump its occurrence count. Returns the count after
    /// the write.
    pub fn upsert_edge(
        &self,
        source_url: &str,
        target_url: &str,
        link_text: Option<&str>,
        is_external: bool,
    ) -> Result<i64> {
        let timestamp = current_timestamp();
        let link_text = link_text.filter(|t| !t.is_empty());
        self.conn().query_row(
            "INSERT INTO graph_edges (source_url, target_url, link_text, is_external, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(source_url, target_url) DO UPDATE SET
                occurrence_count = occurrence_count + 1,
                link_text = COALESCE(excluded.link_text, graph_edges.link_text),
                last_seen = excluded.last_seen
             RETURNING occurrence_count",
            params![source_url, target_url, link_text, is_external, timestamp],
            |row| row.get(0),
        )
    }

    pub fn get_edges(&self) -> Result<Vec<EdgeRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT source_url, target_url, link_text, occurrence_count, is_external, last_seen
             FROM graph_edges ORDER BY id",
        )?;
        let edges = stmt
            .query_map([], |row| {
                Ok(EdgeRecord {
                    source_url: row.get(0)?,
                    target_url: row.get(1)?,
                    link_text: row.get(2)?,
                    occurrence_count: row.get(3)?,
                    is_external: row.get(4)?,
                    last_seen: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(edges)
    }

    pub fn count_edges(&self) -> Result<i64> {
        self.conn()
            .query_row("SELECT COUNT(*) FROM graph_edges", [], |row| row.get(0))
    }

    pub fn set_centrality(&self, scores: &HashMap<String, f64>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE pages SET centrality = ?1 WHERE url = ?2")?;
            for (url, score) in scores {
                stmt.execute(params![score, url])?;
            }
        }
        tx.commit()
    }

    pub fn top_pages_by_centrality(&self, limit: usize) -> Result<Vec<(String, f64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT url, centrality FROM pages WHERE centrality > 0
             ORDER BY centrality DESC, url LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    // Threat records

    /// Insert-or-ignore. Returns true if this hash was new.
    pub fn insert_threat_record(&self, record: &ThreatRecord) -> Result<bool> {
        let timestamp = current_timestamp();
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO threat_records (
                content_hash, keyword_matches, ai_verdict, threat_level, confidence,
                signature, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                &record.content_hash,
                to_json(&record.keyword_matches)?,
                &record.ai_verdict,
                record.threat_level.as_str(),
                record.confidence,
                &record.signature,
                timestamp,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_threat_record(&self, content_hash: &str) -> Result<Option<ThreatRecord>> {
        let row = self
            .conn()
            .query_row(
                "SELECT content_hash, keyword_matches, ai_verdict, threat_level, confidence, signature
                 FROM threat_records WHERE content_hash = ?1",
                params![content_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(content_hash, matches, ai_verdict, level, confidence, signature)| {
            Ok(ThreatRecord {
                content_hash,
                keyword_matches: from_json(1, &matches)?,
                ai_verdict,
                threat_level: level_from_sql(3, level)?,
                confidence,
                signature,
            })
        })
        .transpose()
    }

    /// Attach an analyzer verdict. The stored level is only ever raised.
    pub fn update_threat_verdict(
        &self,
        content_hash: &str,
        ai_verdict: &str,
        level: ThreatLevel,
        confidence: f64,
        signature: &str,
    ) -> Result<()> {
        self.conn().execute(
            &format!(
                "UPDATE threat_records SET
                    ai_verdict = ?1,
                    threat_level = CASE WHEN {} < ?2 THEN ?3 ELSE threat_level END,
                    confidence = ?4,
                    signature = ?5,
                    updated_at = ?6
                 WHERE content_hash = ?7",
                level_rank("threat_level")
            ),
            params![
                ai_verdict,
                rank_of(level),
                level.as_str(),
                confidence,
                signature,
                current_timestamp(),
                content_hash
            ],
        )?;
        Ok(())
    }

    /// Count one more sighting of a threat signature.
    pub fn record_signature(&self, signature: &str, level: ThreatLevel, categories: &[String]) -> Result<i64> {
        let timestamp = current_timestamp();
        self.conn().query_row(
            "INSERT INTO threat_signatures (signature, threat_level, categories, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(signature) DO UPDATE SET
                occurrence_count = occurrence_count + 1,
                last_seen = excluded.last_seen
             RETURNING occurrence_count",
            params![signature, level.as_str(), to_json(&categories)?, timestamp],
            |row| row.get(0),
        )
    }

    pub fn signature_count(&self, signature: &str) -> Result<Option<i64>> {
        self.conn()
            .query_row(
                "SELECT occurrence_count FROM threat_signatures WHERE signature = ?1",
                params![signature],
                |row| row.get(0),
            )
            .optional()
    }

    // Alerts
    pub fn insert_alert(
        &self,
        url: &str,
        content_hash: Option<&str>,
        previous: ThreatLevel,
        level: ThreatLevel,
        source: &str,
        summary: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO alerts (url, content_hash, previous_level, threat_level, source, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                url,
                content_hash,
                previous.as_str(),
                level.as_str(),
                source,
                summary,
                current_timestamp()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_alerts(&self) -> Result<Vec<(String, ThreatLevel, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT url, threat_level, source FROM alerts ORDER BY id")?;
        let alerts = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, level_from_sql(1, row.get(1)?)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(alerts)
    }

    // Indicators
    pub fn insert_indicators(&self, page_url: &str, indicators: &[(&str, &str)]) -> Result<usize> {
        let timestamp = current_timestamp();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO indicators (page_url, kind, value, discovered_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (kind, value) in indicators {
                inserted += stmt.execute(params![page_url, kind, value, timestamp])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_indicators(&self, page_url: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT kind, value FROM indicators WHERE page_url = ?1 ORDER BY kind, value")?;
        let rows = stmt
            .query_map(params![page_url], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    // Failed URLs
    pub fn record_failed_url(&self, url: &str, domain: &str, reason: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO failed_urls (url, domain, reason, last_failed) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(url) DO UPDATE SET
                reason = excluded.reason,
                failure_count = failure_count + 1,
                last_failed = excluded.last_failed",
            params![url, domain, reason, current_timestamp()],
        )?;
        Ok(())
    }

    pub fn get_failed_urls(&self) -> Result<Vec<FailedUrl>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT url, domain, reason, failure_count FROM failed_urls ORDER BY last_failed DESC, url",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FailedUrl {
                    url: row.get(0)?,
                    domain: row.get(1)?,
                    reason: row.get(2)?,
                    failure_count: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn rank_of(level: ThreatLevel) -> i64 {
    match level {
        ThreatLevel::Critical => 4,
        ThreatLevel::High => 3,
        ThreatLevel::Medium => 2,
        ThreatLevel::Low => 1,
        ThreatLevel::Info => 0,
    }
}
