//! Relevance-scored programme search.
//!
//! The store narrows candidates with a LIKE query; the score combines how
//! much of each query term is covered by the programme's name, category
//! and description, damped by how far the programme is from now, so that
//! tonight's broadcast outranks last week's rerun of the same title.

use chrono::{DateTime, Duration, Utc};

use crate::database::{Database, DatabaseError, Programme};
use crate::text;

/// Results scoring below this are dropped.
pub const MIN_SEARCH_RELEVANCE: f64 = 0.1;

/// Days around `now` considered by [`search_programmes`].
const SEARCH_WINDOW_DAYS: i64 = 7;

/// A programme matching a search query.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub programme: Programme,
    pub relevance: f64,
}

/// Relevance of one programme for the query terms:
/// `min(Σ per-field coverage, 1.0) / sqrt(days from now)`.
pub fn relevance(programme: &Programme, raw_terms: &[String], now: DateTime<Utc>) -> f64 {
    let coverage = text::compute_match_terms(&text::raw_name(&programme.name), raw_terms)
        + text::compute_match_terms(&text::raw_name(&programme.category), raw_terms)
        + text::compute_match_terms(&text::raw_name(&programme.description), raw_terms);

    let days = (programme.utc_start - now).num_days().abs().max(1);

    coverage.min(1.0) / (days as f64).sqrt()
}

/// Search programmes from a week back to a week ahead, ordered by
/// descending relevance.
pub fn search_programmes(
    db: &Database,
    query: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<SearchHit>, DatabaseError> {
    let begin = now - Duration::days(SEARCH_WINDOW_DAYS);
    let end = now + Duration::days(SEARCH_WINDOW_DAYS);

    let raw_terms: Vec<String> = query
        .iter()
        .map(|t| text::raw_name(t))
        .filter(|t| !t.is_empty())
        .collect();
    if raw_terms.is_empty() {
        return Ok(Vec::new());
    }

    let mut hits: Vec<SearchHit> = db
        .query_programmes(query, begin, end)?
        .into_iter()
        .filter_map(|programme| {
            let relevance = relevance(&programme, &raw_terms, now);
            (relevance >= MIN_SEARCH_RELEVANCE).then_some(SearchHit {
                programme,
                relevance,
            })
        })
        .collect();

    hits.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    Ok(hits)
}
