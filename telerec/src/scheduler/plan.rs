//! The recording plan builder.
//!
//! Turns EPG rows flagged for recording, plus the sessions already
//! running, into a non-overlapping per-tuner plan. This is a greedy,
//! priority-ordered bin-packing pass per tuner; deterministic and cheap,
//! not globally optimal. A candidate displaced from one tuner goes back
//! into the pool so a later tuner can still pick it up.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use log::debug;

use super::SessionId;
use crate::config::ChannelMap;
use crate::database::Programme;

/// Recordings start this many seconds before the programme.
pub const START_EARLIER_SECS: i64 = 2 * 60;

/// Recordings stop this many seconds after the next programme starts.
pub const STOP_LATER_SECS: i64 = 5 * 60;

/// Scheduling class of a candidate. A running recording outranks any
/// planned one, so it is never preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Running,
    Planned { priority: i32 },
}

/// A provisional recording derived from one EPG row (or one live
/// session), not yet assigned to a tuner.
#[derive(Debug, Clone)]
pub struct RecordingCandidate {
    /// Raw channel name.
    pub channel: String,
    /// Programme name, for logs only.
    pub name: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub class: Class,
    /// Insertion order; the final tie-break.
    pub seq: usize,
    /// Tuner this candidate is pinned to (always set for running
    /// sessions; set during the build once a tuner keeps a candidate).
    pub tuner: Option<String>,
    /// Working flag during conflict resolution.
    pub scheduled: bool,
    /// Session already backing this candidate, if any.
    pub session: Option<SessionId>,
}

impl RecordingCandidate {
    /// Candidate for a flagged programme, bounded by the next programme's
    /// start.
    pub fn from_programme(programme: &Programme, next_start: DateTime<Utc>, seq: usize) -> Self {
        Self {
            channel: programme.channel.clone(),
            name: programme.name.clone(),
            begin: programme.utc_start - Duration::seconds(START_EARLIER_SECS),
            end: next_start + Duration::seconds(STOP_LATER_SECS),
            class: Class::Planned {
                priority: programme.record_priority,
            },
            seq,
            tuner: None,
            scheduled: true,
            session: None,
        }
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.begin < other.end && self.end > other.begin
    }

    fn touches(&self, other: &Self) -> bool {
        self.begin <= other.end && self.end >= other.begin
    }
}

/// Scheduling order: running sessions first, then higher manual priority,
/// then insertion order. Explicit so the tie-break is a decision, not an
/// artifact of container ordering.
pub fn candidate_order(a: &RecordingCandidate, b: &RecordingCandidate) -> Ordering {
    match (a.class, b.class) {
        (Class::Running, Class::Running) => a.seq.cmp(&b.seq),
        (Class::Running, Class::Planned { .. }) => Ordering::Less,
        (Class::Planned { .. }, Class::Running) => Ordering::Greater,
        (Class::Planned { priority: pa }, Class::Planned { priority: pb }) => {
            pb.cmp(&pa).then(a.seq.cmp(&b.seq))
        }
    }
}

/// One entry of the final plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRecording {
    /// Raw channel name.
    pub channel: String,
    /// Programme name, for logs only.
    pub name: String,
    pub tuner: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Runtime attachment to a capture session once started.
    pub session: Option<SessionId>,
}

/// Build the plan from the candidate pool.
///
/// Tuners are processed most-constrained first (see
/// [`ChannelMap::plan_tuner_order`]); each takes every poolable candidate
/// it can serve, resolves overlaps in priority order (losers go back to
/// the pool for later tuners), then merges adjacent or overlapping
/// same-channel survivors into single continuous recordings.
pub fn build_plan(candidates: Vec<RecordingCandidate>, map: &ChannelMap) -> Vec<ScheduledRecording> {
    let mut pool = candidates;
    let mut buckets: Vec<(String, Vec<RecordingCandidate>)> = Vec::new();

    for tuner in map.plan_tuner_order() {
        let serves = map.channels_for(&tuner);

        // Claim every candidate this tuner can execute.
        let mut bucket: Vec<RecordingCandidate> = Vec::new();
        let mut rest: Vec<RecordingCandidate> = Vec::new();
        for mut candidate in pool {
            let claimable = match &candidate.tuner {
                Some(pinned) => *pinned == tuner,
                None => serves.contains(candidate.channel.as_str()),
            };
            if claimable {
                candidate.tuner = Some(tuner.clone());
                bucket.push(candidate);
            } else {
                rest.push(candidate);
            }
        }
        pool = rest;

        bucket.sort_by(candidate_order);

        // Unschedule overlapping lower-priority candidates the tuner
        // cannot serve concurrently via transponder sharing.
        for i in 0..bucket.len() {
            if !bucket[i].scheduled {
                continue;
            }
            for j in (i + 1)..bucket.len() {
                if bucket[j].scheduled
                    && bucket[i].overlaps(&bucket[j])
                    && bucket[i].channel != bucket[j].channel
                    && !map.share_transponder(&bucket[i].channel, &bucket[j].channel, &tuner)
                {
                    debug!(
                        "Not recording {:?} on {}: overlaps {:?}",
                        bucket[j].name, tuner, bucket[i].name
                    );
                    bucket[j].scheduled = false;
                }
            }
        }

        // Displaced candidates go back to the pool for later tuners.
        let (kept, displaced): (Vec<_>, Vec<_>) =
            bucket.into_iter().partition(|c| c.scheduled);
        for mut candidate in displaced {
            candidate.tuner = None;
            candidate.scheduled = true;
            pool.push(candidate);
        }

        buckets.push((tuner, kept));
    }

    // Merge scheduled candidates on the same channel whose ranges touch
    // or overlap: a multi-programme block records as one capture.
    let mut result = Vec::new();
    for (tuner, mut bucket) in buckets {
        for j in 0..bucket.len() {
            if !bucket[j].scheduled {
                continue;
            }
            for k in (j + 1)..bucket.len() {
                if bucket[k].scheduled
                    && bucket[j].channel == bucket[k].channel
                    && bucket[j].touches(&bucket[k])
                {
                    bucket[j].begin = bucket[j].begin.min(bucket[k].begin);
                    bucket[j].end = bucket[j].end.max(bucket[k].end);
                    if bucket[j].session.is_none() {
                        bucket[j].session = bucket[k].session;
                    }
                    bucket[k].scheduled = false;
                }
            }

            result.push(ScheduledRecording {
                channel: bucket[j].channel.clone(),
                name: bucket[j].name.clone(),
                tuner: tuner.clone(),
                begin: bucket[j].begin,
                end: bucket[j].end,
                session: bucket[j].session,
            });
        }
    }

    result.sort_by_key(|r| r.begin);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 3, 10, h, m, 0).unwrap()
    }

    /// Tuner A serves X and Y (same transponder) plus Z (another
    /// transponder); tuner B serves only Z.
    fn two_tuner_map() -> ChannelMap {
        ChannelMap::new(
            &Config::from_toml(
                r#"
                [[tuners]]
                name = "a"

                [[tuners]]
                name = "b"

                [[channels]]
                name = "X"
                preset = 1
                feeds = [{ tuner = "a", transponder = 474, service_id = 1 }]

                [[channels]]
                name = "Y"
                preset = 2
                feeds = [{ tuner = "a", transponder = 474, service_id = 2 }]

                [[channels]]
                name = "Z"
                preset = 3
                feeds = [
                    { tuner = "a", transponder = 482, service_id = 3 },
                    { tuner = "b", transponder = 562, service_id = 3 },
                ]
                "#,
            )
            .unwrap(),
        )
    }

    fn one_tuner_map() -> ChannelMap {
        ChannelMap::new(
            &Config::from_toml(
                r#"
                [[tuners]]
                name = "a"

                [[channels]]
                name = "X"
                preset = 1
                feeds = [{ tuner = "a", transponder = 474, service_id = 1 }]

                [[channels]]
                name = "Y"
                preset = 2
                feeds = [{ tuner = "a", transponder = 474, service_id = 2 }]

                [[channels]]
                name = "Z"
                preset = 3
                feeds = [{ tuner = "a", transponder = 482, service_id = 3 }]
                "#,
            )
            .unwrap(),
        )
    }

    fn candidate(
        channel: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        priority: i32,
        seq: usize,
    ) -> RecordingCandidate {
        RecordingCandidate {
            channel: channel.into(),
            name: format!("{channel} programme"),
            begin,
            end,
            class: Class::Planned { priority },
            seq,
            tuner: None,
            scheduled: true,
            session: None,
        }
    }

    /// Verify the no-double-booking invariant: recordings on one tuner
    /// either do not overlap or share a transponder there.
    fn assert_no_double_booking(plan: &[ScheduledRecording], map: &ChannelMap) {
        for a in plan {
            for b in plan {
                if std::ptr::eq(a, b) || a.tuner != b.tuner {
                    continue;
                }
                let overlap = a.begin < b.end && a.end > b.begin;
                assert!(
                    !overlap
                        || a.channel == b.channel
                        || map.share_transponder(&a.channel, &b.channel, &a.tuner),
                    "double booking on {}: {:?} vs {:?}",
                    a.tuner,
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn overlapping_candidate_spills_to_the_alternate_tuner() {
        let map = two_tuner_map();
        let plan = build_plan(
            vec![
                candidate("X", utc(10, 0), utc(11, 0), 3, 0),
                candidate("Z", utc(10, 30), utc(11, 30), 5, 1),
            ],
            &map,
        );

        assert_eq!(plan.len(), 2);
        let x = plan.iter().find(|r| r.channel == "X").unwrap();
        let z = plan.iter().find(|r| r.channel == "Z").unwrap();
        assert_eq!(x.tuner, "a");
        assert_eq!(z.tuner, "b");
        assert_no_double_booking(&plan, &map);
    }

    #[test]
    fn priority_wins_when_there_is_no_alternate_tuner() {
        let map = one_tuner_map();
        let plan = build_plan(
            vec![
                candidate("X", utc(10, 0), utc(11, 0), 3, 0),
                candidate("Z", utc(10, 30), utc(11, 30), 5, 1),
            ],
            &map,
        );

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].channel, "Z");
        assert_no_double_booking(&plan, &map);
    }

    #[test]
    fn priority_dominance() {
        let map = one_tuner_map();
        let plan = build_plan(
            vec![
                candidate("X", utc(10, 0), utc(11, 0), 1, 0),
                candidate("Z", utc(10, 0), utc(11, 0), 5, 1),
            ],
            &map,
        );

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].channel, "Z");
    }

    #[test]
    fn transponder_sharing_allows_concurrent_recordings() {
        let map = one_tuner_map();
        let plan = build_plan(
            vec![
                candidate("X", utc(10, 0), utc(11, 0), 1, 0),
                candidate("Y", utc(10, 0), utc(11, 0), 5, 1),
            ],
            &map,
        );

        // X and Y ride the same multiplex on tuner a.
        assert_eq!(plan.len(), 2);
        assert_no_double_booking(&plan, &map);
    }

    #[test]
    fn running_session_is_never_preempted() {
        let map = one_tuner_map();

        let mut running = candidate("X", utc(10, 0), utc(11, 0), 1, 0);
        running.class = Class::Running;
        running.tuner = Some("a".into());
        running.session = Some(7);

        let plan = build_plan(
            vec![running, candidate("Z", utc(10, 0), utc(11, 0), 99, 1)],
            &map,
        );

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].channel, "X");
        assert_eq!(plan[0].session, Some(7));
    }

    #[test]
    fn adjacent_same_channel_blocks_merge_into_one_recording() {
        let map = one_tuner_map();
        let plan = build_plan(
            vec![
                candidate("X", utc(10, 0), utc(11, 5), 2, 0),
                candidate("X", utc(10, 58), utc(12, 5), 2, 1),
            ],
            &map,
        );

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].begin, utc(10, 0));
        assert_eq!(plan[0].end, utc(12, 5));
    }

    #[test]
    fn merged_entry_keeps_the_running_session() {
        let map = one_tuner_map();

        let mut running = candidate("X", utc(10, 0), utc(11, 5), 1, 0);
        running.class = Class::Running;
        running.tuner = Some("a".into());
        running.session = Some(3);

        let plan = build_plan(
            vec![running, candidate("X", utc(11, 0), utc(12, 5), 5, 1)],
            &map,
        );

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].session, Some(3));
        assert_eq!(plan[0].end, utc(12, 5));
    }

    #[test]
    fn candidate_order_ranks_running_then_priority_then_seq() {
        let a = candidate("X", utc(10, 0), utc(11, 0), 5, 1);
        let b = candidate("Y", utc(10, 0), utc(11, 0), 5, 0);
        let c = candidate("Z", utc(10, 0), utc(11, 0), 9, 2);
        let mut running = candidate("X", utc(10, 0), utc(11, 0), 0, 3);
        running.class = Class::Running;

        let mut all = vec![a, b, c, running];
        all.sort_by(candidate_order);

        assert_eq!(all[0].class, Class::Running);
        assert_eq!(all[1].channel, "Z");
        assert_eq!(all[2].channel, "Y"); // seq 0 before seq 1 at equal priority
        assert_eq!(all[3].channel, "X");
    }

    #[test]
    fn candidate_padding_from_programme() {
        let programme = Programme {
            channel: "X".into(),
            utc_start: utc(21, 0),
            station_start: utc(21, 0).naive_utc(),
            name: "News".into(),
            category: String::new(),
            description: String::new(),
            record_priority: 2,
        };

        let c = RecordingCandidate::from_programme(&programme, utc(21, 30), 0);
        assert_eq!(c.begin, utc(20, 58));
        assert_eq!(c.end, utc(21, 35));
    }
}
