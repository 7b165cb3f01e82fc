//! Compress stage: deduplicate findings and assign citations.
//!
//! Near-identical claims are clustered by token Jaccard similarity; each
//! cluster keeps its highest-confidence finding and every distinct source
//! URL. Citation ids are dense and assigned in first-appearance order, which
//! is deterministic because findings arrive ordered.

use super::{StageContext, StageOutcome};
use crate::graph::EdgeLabel;
use crate::state::{Citation, Compressed, Finding, ResearchState, StateDelta};
use crate::text;

/// Longest snippet carried into a citation.
const CITATION_SNIPPET_BYTES: usize = 200;

struct Cluster {
    representative: Finding,
    urls: Vec<String>,
}

/// Run the compress stage. Pure: no model call, no I/O.
pub fn run(state: &ResearchState, ctx: &StageContext) -> StageOutcome {
    let compressed = compress(
        &state.findings,
        ctx.config.jaccard_dedup_threshold,
        ctx.config.compression_target_ratio,
    );
    let mut delta = StateDelta::default();
    delta.compressed = Some(compressed);
    StageOutcome::new(delta, EdgeLabel::Next)
}

fn compress(findings: &[Finding], threshold: f64, target_ratio: f64) -> Compressed {
    let mut clusters: Vec<Cluster> = Vec::new();

    for finding in findings {
        let existing = clusters
            .iter_mut()
            .find(|c| text::jaccard(&c.representative.claim, &finding.claim) >= threshold);
        match existing {
            Some(cluster) => {
                if !cluster.urls.contains(&finding.source_url) {
                    cluster.urls.push(finding.source_url.clone());
                }
                if finding.confidence > cluster.representative.confidence {
                    cluster.representative = finding.clone();
                }
            }
            None => clusters.push(Cluster {
                representative: finding.clone(),
                urls: vec![finding.source_url.clone()],
            }),
        }
    }

    // Dense citation ids in first-appearance order across clusters.
    let mut citations: Vec<Citation> = Vec::new();
    let mut text_out = String::new();
    for cluster in &clusters {
        let mut markers = String::new();
        for url in &cluster.urls {
            let id = match citations.iter().find(|c| &c.url == url) {
                Some(existing) => existing.id,
                None => {
                    let id = citations.len() + 1;
                    let (snippet, _) = text::truncate_bytes(
                        &cluster.representative.supporting_snippet,
                        CITATION_SNIPPET_BYTES,
                    );
                    citations.push(Citation {
                        id,
                        url: url.clone(),
                        title: title_from_url(url),
                        snippet: snippet.to_string(),
                    });
                    id
                }
            };
            markers.push_str(&format!("[{id}]"));
        }
        text_out.push_str(&format!("- {} {}\n", cluster.representative.claim, markers));
    }

    let raw_len: usize = findings.iter().map(|f| f.claim.len()).sum();
    if raw_len > 0 {
        let ratio = text_out.len() as f64 / raw_len as f64;
        tracing::debug!(
            clusters = clusters.len(),
            findings = findings.len(),
            ratio = format!("{ratio:.2}"),
            target = target_ratio,
            "Compressed findings"
        );
    }

    Compressed {
        text: text_out,
        citations,
    }
}

/// Readable title derived from the last path segment of a URL. Domain-only
/// URLs have no usable segment.
fn title_from_url(url: &str) -> Option<String> {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let trimmed = without_scheme.trim_end_matches('/');
    let (_, path) = trimmed.split_once('/')?;
    let segment = path.rsplit('/').next()?;
    let cleaned = segment
        .split(['?', '#', '.'])
        .next()
        .unwrap_or(segment)
        .replace(['-', '_'], " ");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_context;

    fn finding(claim: &str, url: &str, confidence: f64) -> Finding {
        Finding {
            claim: claim.to_string(),
            source_url: url.to_string(),
            confidence,
            supporting_snippet: format!("snippet: {claim}"),
        }
    }

    #[test]
    fn test_near_duplicates_clustered() {
        let findings = vec![
            finding(
                "the tokio runtime uses a work stealing scheduler",
                "https://a.example",
                0.7,
            ),
            finding(
                "tokio runtime uses a work stealing scheduler design",
                "https://b.example",
                0.9,
            ),
            finding("completely different claim about pricing", "https://c.example", 0.5),
        ];
        let compressed = compress(&findings, 0.75, 0.5);

        // Two clusters; the duplicate cluster keeps both URLs and the
        // higher-confidence representative.
        assert_eq!(compressed.text.lines().count(), 2);
        assert!(compressed
            .text
            .contains("tokio runtime uses a work stealing scheduler design"));
        assert_eq!(compressed.citations.len(), 3);
    }

    #[test]
    fn test_citation_ids_dense_and_first_use_ordered() {
        let findings = vec![
            finding("claim one about alpha systems", "https://one.example", 0.8),
            finding("claim two about beta systems", "https://two.example", 0.8),
            finding("claim three about gamma systems", "https://one.example", 0.8),
        ];
        let compressed = compress(&findings, 0.75, 0.5);

        let ids: Vec<usize> = compressed.citations.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(compressed.citations[0].url, "https://one.example");
        assert_eq!(compressed.citations[1].url, "https://two.example");
        // The third cluster reuses citation 1.
        assert!(compressed.text.lines().nth(2).unwrap().contains("[1]"));
    }

    #[test]
    fn test_deterministic_given_same_findings() {
        let findings = vec![
            finding("alpha claim with several words", "https://one.example", 0.6),
            finding("beta claim with several words too", "https://two.example", 0.9),
            finding("gamma claim entirely different topic", "https://three.example", 0.4),
        ];
        let a = compress(&findings, 0.75, 0.5);
        let b = compress(&findings, 0.75, 0.5);
        assert_eq!(a.text, b.text);
        assert_eq!(a.citations, b.citations);
    }

    #[test]
    fn test_empty_findings() {
        let compressed = compress(&[], 0.75, 0.5);
        assert!(compressed.text.is_empty());
        assert!(compressed.citations.is_empty());
    }

    #[test]
    fn test_stage_writes_delta() {
        let (ctx, _mock, _rx) = make_context();
        let mut state = ResearchState::new("q", "t");
        state.findings.push(finding("a claim", "https://a.example", 0.8));
        let outcome = run(&state, &ctx);
        assert_eq!(outcome.label, EdgeLabel::Next);
        let compressed = outcome.delta.compressed.unwrap();
        assert_eq!(compressed.citations.len(), 1);
        assert!(compressed.text.contains("[1]"));
    }

    #[test]
    fn test_title_from_url() {
        assert_eq!(
            title_from_url("https://docs.example.com/guides/async-runtime"),
            Some("async runtime".to_string())
        );
        assert_eq!(title_from_url("https://example.com/"), None);
    }
}
