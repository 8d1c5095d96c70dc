//! Channel name reconciliation.
//!
//! External EPG feeds identify channels by free-text display names that
//! never quite match the configured channel list ("BBC 1" vs "BBC One").
//! Each feed channel is matched to the local channel it most resembles;
//! when two feed channels claim the same local channel, only the better
//! claim survives. This is a greedy 1:1 assignment, not optimal bipartite
//! matching; ties go to whichever candidate is evaluated first.

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::text;

/// Reconciliation errors. These are diagnostic only: a feed channel that
/// cannot be matched is dropped from the mapping, never fatal.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no confident channel match for feed channel {0}")]
    AmbiguousChannelMatch(String),
}

/// A channel as presented by an external feed: an opaque id plus one or
/// more display-name aliases.
#[derive(Debug, Clone)]
pub struct FeedChannel {
    pub id: String,
    pub names: Vec<String>,
}

/// A resolved link from a feed channel to a configured channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelLink {
    /// Display name of the local channel.
    pub channel: String,
    pub score: f64,
}

/// Map feed channels onto the local channel list.
///
/// Returns feed-channel id → best local channel. Feed channels whose best
/// score is zero, or that lose their claim to a better-scoring feed
/// channel, are absent from the result.
pub fn reconcile_channels(
    feeds: &[FeedChannel],
    local_channels: &[String],
) -> HashMap<String, ChannelLink> {
    let raw_locals: Vec<(String, &String)> = local_channels
        .iter()
        .map(|name| (text::raw_name(name), name))
        .collect();

    let mut links: HashMap<String, ChannelLink> = HashMap::new();

    for feed in feeds {
        // Best local channel over all of this feed channel's aliases.
        let mut best_name: Option<&String> = None;
        let mut best_score = 0.0f64;

        for alias in &feed.names {
            let raw_alias = text::raw_name(alias);
            for (raw_local, local) in &raw_locals {
                let score = text::bidir_match(raw_local, &raw_alias);
                if score > best_score {
                    best_score = score;
                    best_name = Some(*local);
                }
            }
        }

        // Never match two feed channels to the same local channel: the
        // weaker claim is discarded entirely.
        if let Some(name) = best_name {
            let mut defeated = false;
            links.retain(|other_id, link| {
                if link.channel.as_str() != name.as_str() {
                    return true;
                }
                if link.score > best_score {
                    defeated = true;
                    true
                } else {
                    debug!(
                        "Feed channel {} loses {:?} to a better match",
                        other_id, link.channel
                    );
                    false
                }
            });
            if defeated {
                best_score = 0.0;
            }
        }

        match best_name {
            Some(name) if best_score > 0.0 => {
                links.insert(
                    feed.id.clone(),
                    ChannelLink {
                        channel: name.clone(),
                        score: best_score,
                    },
                );
            }
            _ => {
                debug!(
                    "{}",
                    ReconcileError::AmbiguousChannelMatch(feed.id.clone())
                );
            }
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(id: &str, names: &[&str]) -> FeedChannel {
        FeedChannel {
            id: id.to_string(),
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn locals(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn matches_best_alias() {
        let links = reconcile_channels(
            &[feed("ext.one", &["BBC 1", "BBC One London"])],
            &locals(&["BBC One", "BBC Two"]),
        );

        assert_eq!(links["ext.one"].channel, "BBC One");
        assert!(links["ext.one"].score > 0.5);
    }

    #[test]
    fn competing_claims_keep_the_better_match() {
        let links = reconcile_channels(
            &[
                feed("ext.vague", &["BBC"]),
                feed("ext.exact", &["BBC One"]),
            ],
            &locals(&["BBC One"]),
        );

        assert_eq!(links.len(), 1);
        assert_eq!(links["ext.exact"].channel, "BBC One");
        assert!(!links.contains_key("ext.vague"));
    }

    #[test]
    fn later_weaker_claim_is_dropped() {
        let links = reconcile_channels(
            &[
                feed("ext.exact", &["BBC One"]),
                feed("ext.vague", &["BBC"]),
            ],
            &locals(&["BBC One"]),
        );

        assert_eq!(links.len(), 1);
        assert!(links.contains_key("ext.exact"));
    }

    #[test]
    fn unmatched_feed_channels_are_absent() {
        let links = reconcile_channels(
            &[feed("ext.sport", &["Eurosport"]), feed("ext.empty", &[])],
            &locals(&["BBC One"]),
        );

        // "Eurosport" has nearly nothing in common with "BBC One"; the
        // empty alias list has literally nothing.
        assert!(!links.contains_key("ext.empty"));
        if let Some(link) = links.get("ext.sport") {
            assert!(link.score < 0.1);
        }
    }
}
