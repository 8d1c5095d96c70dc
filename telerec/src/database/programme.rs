//! Programme storage: merge/insert and time-range queries.
//!
//! EPG sources disagree on exact start times by a few minutes and on title
//! wording, so an incoming observation is first matched against existing
//! rows in a ±30 minute window and merged into the best match instead of
//! inserted, keeping one row per broadcast.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use rusqlite::params;

use super::{dt, naive, naive_ts, ts, Database, NewProgramme, Programme, Result};
use crate::text;

/// Minimum match score for an observation to merge into an existing row.
const MERGE_THRESHOLD: f64 = 0.3;

/// Minutes around the observed start time searched for merge candidates.
const MERGE_WINDOW_MINUTES: i64 = 30;

/// How far back (hours) a programme may have started and still be "the
/// programme at" a given instant.
const MAX_PROGRAMME_AGE_HOURS: i64 = 8;

const PROGRAMME_COLUMNS: &str =
    "raw_channel, utc_start, station_start, name, category, description, record_priority";

fn programme_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Programme> {
    Ok(Programme {
        channel: row.get(0)?,
        utc_start: dt(row.get(1)?),
        station_start: naive(row.get(2)?),
        name: row.get(3)?,
        category: row.get(4)?,
        description: row.get(5)?,
        record_priority: row.get(6)?,
    })
}

impl Database {
    /// Merge a programme observation into the store.
    ///
    /// Resolves the UTC start from the channel's known offset when absent
    /// (learning and persisting the offset when it is the *pair* that is
    /// supplied), then either updates the best-matching existing row in
    /// the merge window or inserts a new one. Observations without a name
    /// or without a resolvable UTC start are dropped.
    pub fn add_programme(&self, p: NewProgramme) -> Result<()> {
        if p.name.is_empty() {
            return Ok(());
        }

        let raw_channel = text::raw_name(&p.channel);
        let offset = self.utc_offset(&raw_channel)?;

        let utc_start = match (p.utc_start, p.station_start, offset) {
            (Some(utc), _, _) => utc,
            (None, Some(station), Some(offset)) => {
                (station - Duration::seconds(offset)).and_utc()
            }
            // No UTC start and no way to derive one.
            (None, _, _) => return Ok(()),
        };

        // Learn the channel's UTC offset from a supplied pair.
        let offset = match (offset, p.station_start) {
            (Some(offset), _) => Some(offset),
            (None, Some(station)) => {
                let observed = naive_ts(station) - ts(utc_start);
                self.set_utc_offset(&raw_channel, observed)?;
                self.utc_offset(&raw_channel)?
            }
            (None, None) => None,
        };

        // Station wall clock re-derived from the authoritative UTC start.
        let station_start = match offset {
            Some(offset) => (utc_start + Duration::seconds(offset)).naive_utc(),
            None => utc_start.naive_utc(),
        };

        let window = Duration::minutes(MERGE_WINDOW_MINUTES);
        let candidates =
            self.programmes_between(&raw_channel, utc_start - window, utc_start + window)?;

        let raw_new = text::raw_name(&p.name);
        let mut best: Option<(f64, &Programme)> = None;
        for candidate in &candidates {
            let score = if candidate.utc_start == utc_start {
                1.0
            } else {
                let minutes = (candidate.utc_start - utc_start).num_minutes().abs();
                text::bidir_match(&text::raw_name(&candidate.name), &raw_new)
                    - (minutes as f64 / 120.0)
            };

            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, candidate));
            }
        }

        if let Some((score, existing)) = best.filter(|(s, _)| *s >= MERGE_THRESHOLD) {
            debug!(
                "Merging programme {:?} into {:?} on {} (score {:.2})",
                p.name, existing.name, raw_channel, score
            );

            // Keep the name with the fewest words (cleanest), the longer
            // category and description, and the higher record priority.
            let name = if text::num_words(&existing.name) < text::num_words(&p.name) {
                existing.name.clone()
            } else {
                p.name
            };
            let category = longer(&p.category, &existing.category);
            let description = longer(&p.description, &existing.description);
            let record_priority = p.record_priority.max(existing.record_priority);

            self.conn.execute(
                "UPDATE OR REPLACE programmes
                 SET utc_start = ?1, raw_name = ?2, name = ?3, category = ?4,
                     description = ?5, station_start = ?6, record_priority = ?7
                 WHERE raw_channel = ?8 AND utc_start = ?9",
                params![
                    ts(utc_start),
                    text::raw_name(&name),
                    name,
                    category,
                    description,
                    naive_ts(station_start),
                    record_priority,
                    raw_channel,
                    ts(existing.utc_start),
                ],
            )?;

            return Ok(());
        }

        self.conn.execute(
            "INSERT OR REPLACE INTO programmes
             (raw_channel, utc_start, raw_name, name, category, description,
              station_start, record_priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                raw_channel,
                ts(utc_start),
                raw_new,
                p.name,
                p.category,
                p.description,
                naive_ts(station_start),
                p.record_priority,
            ],
        )?;

        Ok(())
    }

    /// The programme running at `time` on a channel: the newest row that
    /// started at or before `time`, looking back at most eight hours.
    pub fn programme_at(
        &self,
        raw_channel: &str,
        time: DateTime<Utc>,
    ) -> Result<Option<Programme>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRAMME_COLUMNS} FROM programmes
             WHERE raw_channel = ?1 AND utc_start <= ?2 AND utc_start > ?3
             ORDER BY utc_start DESC LIMIT 1"
        ))?;

        let result = stmt.query_row(
            params![
                raw_channel,
                ts(time),
                ts(time - Duration::hours(MAX_PROGRAMME_AGE_HOURS))
            ],
            programme_from_row,
        );

        match result {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The programme running right now on a channel.
    pub fn current_programme(
        &self,
        raw_channel: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Programme>> {
        self.programme_at(raw_channel, now)
    }

    /// The first programme starting strictly after `time` on a channel.
    pub fn next_programme(
        &self,
        raw_channel: &str,
        time: DateTime<Utc>,
    ) -> Result<Option<Programme>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRAMME_COLUMNS} FROM programmes
             WHERE raw_channel = ?1 AND utc_start > ?2
             ORDER BY utc_start ASC LIMIT 1"
        ))?;

        let result = stmt.query_row(params![raw_channel, ts(time)], programme_from_row);

        match result {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Programmes on a channel with `begin <= utc_start < end`.
    pub fn programmes_between(
        &self,
        raw_channel: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Programme>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRAMME_COLUMNS} FROM programmes
             WHERE raw_channel = ?1 AND utc_start >= ?2 AND utc_start < ?3
             ORDER BY utc_start ASC"
        ))?;

        let rows = stmt
            .query_map(params![raw_channel, ts(begin), ts(end)], programme_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Programmes in a window whose name, category or description contains
    /// every query term. Scoring happens in the caller; this only narrows
    /// the candidate set.
    pub fn query_programmes(
        &self,
        terms: &[String],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Programme>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut name_clause = String::new();
        let mut category_clause = String::new();
        let mut description_clause = String::new();
        for term in terms {
            let raw = text::raw_name(term).replace('\'', "");
            let plain = term.replace('\'', "");
            name_clause.push_str(&format!(" AND raw_name LIKE '%{raw}%'"));
            category_clause.push_str(&format!(" AND category LIKE '%{plain}%'"));
            description_clause.push_str(&format!(" AND description LIKE '%{plain}%'"));
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRAMME_COLUMNS} FROM programmes
             WHERE utc_start >= ?1 AND utc_start < ?2 AND (
               ({}) OR ({}) OR ({})
             ) ORDER BY utc_start ASC",
            &name_clause[5..],
            &category_clause[5..],
            &description_clause[5..],
        ))?;

        let rows = stmt
            .query_map(params![ts(begin), ts(end)], programme_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Programmes flagged for recording in `[begin, end)`, across all
    /// channels.
    pub fn programmes_to_record(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Programme>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRAMME_COLUMNS} FROM programmes
             WHERE record_priority > 0 AND utc_start >= ?1 AND utc_start < ?2
             ORDER BY utc_start ASC"
        ))?;

        let rows = stmt
            .query_map(params![ts(begin), ts(end)], programme_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Programmes in a window whose normalized name contains `raw_fragment`.
    pub fn programmes_by_name(
        &self,
        raw_fragment: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Programme>> {
        let fragment = raw_fragment.replace('\'', "");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRAMME_COLUMNS} FROM programmes
             WHERE utc_start >= ?1 AND utc_start < ?2
             AND raw_name LIKE '%{fragment}%'
             ORDER BY utc_start ASC"
        ))?;

        let rows = stmt
            .query_map(params![ts(begin), ts(end)], programme_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Set the record priority of the programme keyed by channel and UTC
    /// start. Returns false when no such row exists.
    pub fn set_record_priority(
        &self,
        raw_channel: &str,
        utc_start: DateTime<Utc>,
        priority: i32,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE programmes SET record_priority = ?1
             WHERE raw_channel = ?2 AND utc_start = ?3",
            params![priority, raw_channel, ts(utc_start)],
        )?;
        Ok(changed > 0)
    }
}

fn longer(a: &str, b: &str) -> String {
    if a.len() >= b.len() {
        a.to_string()
    } else {
        b.to_string()
    }
}
