use crate::data::{current_timestamp, Database, EdgeRecord, PageRecord};
use crate::error::Result;
use nightcrawl_scanner::frontier::normalize_url;
use nightcrawl_scanner::result::host_of;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Key a node by its normalized URL, the same form the frontier dedups on.
/// Unparseable input is kept as is.
pub fn node_key(url: &str) -> String {
    Url::parse(url)
        .map(|u| normalize_url(&u))
        .unwrap_or_else(|_| url.to_string())
}

pub struct LinkGraph {
    db: Arc<Database>,
}

impl LinkGraph {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn upsert_node(&self, page: &PageRecord) -> Result<()> {
        let key = node_key(&page.url);
        if key == page.url {
            self.db.upsert_page(page)?;
        } else {
            self.db.upsert_page(&PageRecord {
                url: key,
                ..page.clone()
            })?;
        }
        Ok(())
    }

    /// Record a hyperlink. An uncrawled target becomes a placeholder page.
    /// Returns the edge's occurrence count after this sighting.
    pub fn upsert_edge(
        &self,
        source: &str,
        target: &str,
        link_text: Option<&str>,
        is_external: bool,
        target_depth: usize,
    ) -> Result<i64> {
        let (source, target) = (node_key(source), node_key(target));
        let domain = Url::parse(&target)
            .map(|u| host_of(&u))
            .unwrap_or_else(|_| "unknown".to_string());
        self.db.insert_placeholder_page(&target, &domain, target_depth)?;
        let count = self.db.upsert_edge(&source, &target, link_text, is_external)?;
        debug!("Edge {} -> {} seen {} times", source, target, count);
        Ok(count)
    }

    /// Recompute centrality from the stored edges and write it back to pages.
    pub fn compute_centrality(&self, half_life: Option<Duration>) -> Result<HashMap<String, f64>> {
        let nodes = self.db.page_urls()?;
        let edges = self.db.get_edges()?;
        let scores = degree_centrality(&nodes, &edges, half_life, current_timestamp());
        self.db.set_centrality(&scores)?;
        info!(
            "Computed centrality for {} nodes over {} edges",
            scores.len(),
            edges.len()
        );
        Ok(scores)
    }

    pub fn top_nodes(&self, n: usize) -> Result<Vec<(String, f64)>> {
        Ok(self.db.top_pages_by_centrality(n)?)
    }

    pub fn node_count(&self) -> Result<i64> {
        Ok(self.db.count_pages()?)
    }

    pub fn edge_count(&self) -> Result<i64> {
        Ok(self.db.count_edges()?)
    }
}

/// Weight of an edge last seen `age_secs` ago: halves every `half_life`.
fn decay(age_secs: i64, half_life: Option<Duration>) -> f64 {
    match half_life {
        Some(h) if h.as_secs_f64() > 0.0 => {
            0.5_f64.powf(age_secs.max(0) as f64 / h.as_secs_f64())
        }
        _ => 1.0,
    }
}

/// Incoming plus outgoing edge weight per node, normalized by `n - 1`.
/// Edge weight is the occurrence count scaled by recency decay.
pub fn degree_centrality(
    nodes: &[String],
    edges: &[EdgeRecord],
    half_life: Option<Duration>,
    now: i64,
) -> HashMap<String, f64> {
    let mut graph: DiGraph<&str, f64> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for url in nodes {
        index
            .entry(url.as_str())
            .or_insert_with(|| graph.add_node(url.as_str()));
    }
    for edge in edges {
        let source = *index
            .entry(edge.source_url.as_str())
            .or_insert_with(|| graph.add_node(edge.source_url.as_str()));
        let target = *index
            .entry(edge.target_url.as_str())
            .or_insert_with(|| graph.add_node(edge.target_url.as_str()));
        let weight = edge.occurrence_count as f64 * decay(now - edge.last_seen, half_life);
        graph.add_edge(source, target, weight);
    }

    let n = graph.node_count();
    let norm = if n > 1 { (n - 1) as f64 } else { 1.0 };

    graph
        .node_indices()
        .map(|idx| {
            let incoming: f64 = graph
                .edges_directed(idx, Direction::Incoming)
                .map(|e| *e.weight())
                .sum();
            let outgoing: f64 = graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|e| *e.weight())
                .sum();
            (graph[idx].to_string(), (incoming + outgoing) / norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: &str, target: &str, count: i64, last_seen: i64) -> EdgeRecord {
        EdgeRecord {
            source_url: source.to_string(),
            target_url: target.to_string(),
            link_text: None,
            occurrence_count: count,
            is_external: false,
            last_seen,
        }
    }

    #[test]
    fn test_hub_scores_highest() {
        let nodes: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let edges = vec![edge("a", "b", 1, 0), edge("c", "b", 1, 0), edge("d", "b", 1, 0)];
        let scores = degree_centrality(&nodes, &edges, None, 0);

        assert!((scores["b"] - 1.0).abs() < 1e-9);
        assert!((scores["a"] - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_occurrence_count_weights_edges() {
        let edges = vec![edge("a", "b", 3, 0)];
        let scores = degree_centrality(&[], &edges, None, 0);
        assert!((scores["b"] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_recency_decay_halves_weight() {
        let day = 86_400;
        let edges = vec![edge("a", "b", 1, 0)];
        let scores = degree_centrality(&[], &edges, Some(Duration::from_secs(day as u64)), day);
        assert!((scores["b"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_isolated_single_node() {
        let scores = degree_centrality(&["solo".to_string()], &[], None, 0);
        assert_eq!(scores["solo"], 0.0);
    }
}
