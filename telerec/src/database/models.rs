//! Database model definitions.

use chrono::{DateTime, NaiveDateTime, Utc};

/// An EPG row. The key is (`channel`, `utc_start`); `channel` is always a
/// raw (normalized) channel name.
#[derive(Debug, Clone, PartialEq)]
pub struct Programme {
    pub channel: String,
    pub utc_start: DateTime<Utc>,
    /// Start time as the station broadcast it (local wall clock).
    pub station_start: NaiveDateTime,
    pub name: String,
    pub category: String,
    pub description: String,
    pub record_priority: i32,
}

/// A programme observation to merge into the store. Either `utc_start` or
/// `station_start` may be absent; the store derives the missing one from
/// the channel's known UTC offset.
#[derive(Debug, Clone, Default)]
pub struct NewProgramme {
    pub channel: String,
    pub utc_start: Option<DateTime<Utc>>,
    pub station_start: Option<NaiveDateTime>,
    pub name: String,
    pub category: String,
    pub description: String,
    pub record_priority: i32,
}

impl NewProgramme {
    pub fn new(channel: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn at(mut self, utc_start: DateTime<Utc>) -> Self {
        self.utc_start = Some(utc_start);
        self
    }

    pub fn station_time(mut self, station_start: NaiveDateTime) -> Self {
        self.station_start = Some(station_start);
        self
    }
}

/// A completed recording interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub channel: String,
    pub file: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A viewing history interval.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub channel: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}
