pub mod index;
pub mod space;

pub use index::{SegmentFile, StorageIndex};
pub use space::{FsSpaceGauge, SpaceGauge};

use chrono::{DateTime, NaiveDateTime, Utc};

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Session stamp used as the filename prefix: `YYYYMMDDTHHMMSSmmm` (UTC)
pub fn session_stamp(at: DateTime<Utc>) -> String {
    format!(
        "{}{:03}",
        at.format(STAMP_FORMAT),
        at.timestamp_subsec_millis()
    )
}

pub fn segment_file_name(stamp: &str, sequence: u32, extension: &str) -> String {
    format!("{}_{:05}.{}", stamp, sequence, extension)
}

/// Output pattern for an external segment muxer (printf-style sequence)
pub fn segment_pattern(stamp: &str, extension: &str) -> String {
    format!("{}_%05d.{}", stamp, extension)
}

/// Parse `<stamp>_<seq>.<ext>` back into the session start and sequence number
pub fn parse_segment_name(name: &str, extension: &str) -> Option<(DateTime<Utc>, u32)> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    let (stamp, seq) = stem.rsplit_once('_')?;
    let sequence = seq.parse::<u32>().ok()?;

    if stamp.len() != 18 || !stamp.is_char_boundary(15) {
        return None;
    }
    let (clock, millis) = stamp.split_at(15);
    let millis = millis.parse::<u32>().ok()?;
    let naive = NaiveDateTime::parse_from_str(clock, STAMP_FORMAT).ok()?;
    let at = naive.and_utc() + chrono::Duration::milliseconds(millis as i64);

    Some((at, sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_segment_name_round_trips_through_parser() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 8, 5, 9).unwrap()
            + chrono::Duration::milliseconds(42);
        let stamp = session_stamp(at);
        assert_eq!(stamp, "20261016T080509042");

        let name = segment_file_name(&stamp, 7, "mp4");
        assert_eq!(name, "20261016T080509042_00007.mp4");
        assert_eq!(parse_segment_name(&name, "mp4"), Some((at, 7)));
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert_eq!(parse_segment_name("notes.txt", "mp4"), None);
        assert_eq!(parse_segment_name("holiday.mp4", "mp4"), None);
        assert_eq!(parse_segment_name("20261016T080509042_00007.mkv", "mp4"), None);
        assert_eq!(parse_segment_name("2026_00001.mp4", "mp4"), None);
    }

    #[test]
    fn test_pattern_matches_file_name_layout() {
        assert_eq!(segment_pattern("20261016T080509042", "mp4"), "20261016T080509042_%05d.mp4");
    }
}
