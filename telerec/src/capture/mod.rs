//! Capture graph seam: the external audio/video pipeline the scheduler
//! starts and stops, and the file-name convention for recordings.

pub mod graph;

pub use graph::{CaptureGraph, GraphError, GraphId, ProcessGraph, StartRequest};

use chrono::{DateTime, Utc};

/// File name for a capture started now on a channel, e.g.
/// `20120310205800@bbcone.ts`.
pub fn recording_file_name(raw_channel: &str, start: DateTime<Utc>) -> String {
    format!(
        "{}@{}.ts",
        start.format("%Y%m%d%H%M%S"),
        raw_channel.to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_names_sort_by_start_time() {
        let early = Utc.with_ymd_and_hms(2012, 3, 10, 20, 58, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2012, 3, 10, 22, 5, 0).unwrap();

        let a = recording_file_name("BBCONE", early);
        let b = recording_file_name("BBCONE", late);

        assert_eq!(a, "20120310205800@bbcone.ts");
        assert!(a < b);
    }
}
