//! Recording and viewing history storage.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{dt, ts, Database, Programme, Record, Result, View};

fn record_from_row(channel: &str) -> impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<Record> + '_ {
    move |row| {
        Ok(Record {
            channel: channel.to_string(),
            file: row.get(0)?,
            begin: dt(row.get(1)?),
            end: dt(row.get(2)?),
        })
    }
}

impl Database {
    /// Persist a completed recording interval.
    pub fn store_record(
        &self,
        raw_channel: &str,
        file: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO records (raw_channel, file, begin_utc, end_utc)
             VALUES (?1, ?2, ?3, ?4)",
            params![raw_channel, file, ts(begin), ts(end)],
        )?;
        Ok(())
    }

    /// The recording covering `time` on a channel, if any.
    pub fn record_at(&self, raw_channel: &str, time: DateTime<Utc>) -> Result<Option<Record>> {
        let result = self.conn.query_row(
            "SELECT file, begin_utc, end_utc FROM records
             WHERE raw_channel = ?1 AND begin_utc <= ?2 AND end_utc > ?2",
            params![raw_channel, ts(time)],
            record_from_row(raw_channel),
        );

        match result {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Recordings on a channel overlapping `[begin, end)`.
    pub fn records_between(
        &self,
        raw_channel: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(
            "SELECT file, begin_utc, end_utc FROM records
             WHERE raw_channel = ?1 AND begin_utc <= ?2 AND end_utc > ?3
             ORDER BY begin_utc ASC",
        )?;

        let rows = stmt
            .query_map(
                params![raw_channel, ts(end), ts(begin)],
                record_from_row(raw_channel),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Programmes in a window that fall inside a recorded interval.
    pub fn recorded_programmes(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Programme>> {
        self.covered_programmes("records", begin, end)
    }

    /// Persist a viewing history interval.
    pub fn store_view(
        &self,
        raw_channel: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO views (raw_channel, begin_utc, end_utc) VALUES (?1, ?2, ?3)",
            params![raw_channel, ts(begin), ts(end)],
        )?;
        Ok(())
    }

    /// The viewing interval covering `time` on a channel, if any.
    pub fn view_at(&self, raw_channel: &str, time: DateTime<Utc>) -> Result<Option<View>> {
        let result = self.conn.query_row(
            "SELECT begin_utc, end_utc FROM views
             WHERE raw_channel = ?1 AND begin_utc <= ?2 AND end_utc > ?2",
            params![raw_channel, ts(time)],
            |row| {
                Ok(View {
                    channel: raw_channel.to_string(),
                    begin: dt(row.get(0)?),
                    end: dt(row.get(1)?),
                })
            },
        );

        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Viewing intervals on a channel overlapping `[begin, end)`.
    pub fn views_between(
        &self,
        raw_channel: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<View>> {
        let mut stmt = self.conn.prepare(
            "SELECT begin_utc, end_utc FROM views
             WHERE raw_channel = ?1 AND begin_utc <= ?2 AND end_utc > ?3
             ORDER BY begin_utc ASC",
        )?;

        let rows = stmt
            .query_map(params![raw_channel, ts(end), ts(begin)], |row| {
                Ok(View {
                    channel: raw_channel.to_string(),
                    begin: dt(row.get(0)?),
                    end: dt(row.get(1)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Programmes in a window that fall inside a viewed interval.
    pub fn viewed_programmes(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Programme>> {
        self.covered_programmes("views", begin, end)
    }

    /// Programmes whose start falls inside an interval of `table`.
    fn covered_programmes(
        &self,
        table: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Programme>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT a.raw_channel, a.utc_start, a.station_start, a.name, a.category,
                    a.description, a.record_priority
             FROM (SELECT * FROM programmes WHERE utc_start >= ?1 AND utc_start < ?2) AS a
             JOIN (SELECT * FROM {table} WHERE begin_utc < ?2 AND end_utc >= ?1) AS b
             ON a.raw_channel = b.raw_channel
             WHERE a.utc_start >= b.begin_utc AND a.utc_start < b.end_utc
             ORDER BY a.utc_start ASC"
        ))?;

        let rows = stmt
            .query_map(params![ts(begin), ts(end)], |row| {
                Ok(Programme {
                    channel: row.get(0)?,
                    utc_start: dt(row.get(1)?),
                    station_start: super::naive(row.get(2)?),
                    name: row.get(3)?,
                    category: row.get(4)?,
                    description: row.get(5)?,
                    record_priority: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
