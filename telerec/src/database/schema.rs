//! Database schema definitions.

/// SQL schema for the EPG store. All timestamps are unix seconds (UTC);
/// `station_start` is the broadcaster's wall clock stored as naive seconds.
pub const SCHEMA_SQL: &str = r#"
-- Electronic programme guide rows, one per broadcast observation after merging
CREATE TABLE IF NOT EXISTS programmes (
    raw_channel     TEXT NOT NULL,       -- normalized channel name
    utc_start       INTEGER NOT NULL,    -- authoritative start time
    raw_name        TEXT NOT NULL,       -- normalized programme name (for LIKE search)
    name            TEXT NOT NULL,
    category        TEXT NOT NULL DEFAULT '',
    description     TEXT NOT NULL DEFAULT '',
    station_start   INTEGER NOT NULL,    -- start time as broadcast (station wall clock)
    record_priority INTEGER NOT NULL DEFAULT 0,  -- 0 = not wanted, higher = more important
    PRIMARY KEY (raw_channel, utc_start)
);

CREATE INDEX IF NOT EXISTS programmes_raw_channel ON programmes(raw_channel);
CREATE INDEX IF NOT EXISTS programmes_utc_start ON programmes(utc_start);
CREATE INDEX IF NOT EXISTS programmes_raw_name ON programmes(raw_name);

-- Completed recording intervals
CREATE TABLE IF NOT EXISTS records (
    raw_channel TEXT NOT NULL,
    file        TEXT NOT NULL,
    begin_utc   INTEGER NOT NULL,
    end_utc     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS records_raw_channel ON records(raw_channel);

-- Viewing history intervals
CREATE TABLE IF NOT EXISTS views (
    raw_channel TEXT NOT NULL,
    begin_utc   INTEGER NOT NULL,
    end_utc     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS views_raw_channel ON views(raw_channel);

-- Per-channel UTC offset learned from EPG observations
CREATE TABLE IF NOT EXISTS channel_offsets (
    raw_channel     TEXT PRIMARY KEY,
    utc_offset_secs INTEGER NOT NULL,
    updated_at      INTEGER DEFAULT (strftime('%s', 'now'))
);
"#;
